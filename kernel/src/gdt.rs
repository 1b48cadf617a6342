use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicPtr, Ordering};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::task::process::IO_BITMAP_BYTES;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const PAGE_FAULT_IST_INDEX: u16 = 1;

const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;
const PAGE_FAULT_STACK_SIZE: usize = 4096 * 5;

static mut DOUBLE_FAULT_STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];
static mut PAGE_FAULT_STACK: [u8; PAGE_FAULT_STACK_SIZE] = [0; PAGE_FAULT_STACK_SIZE];

/// A `TaskStateSegment` extended with a trailing per-process I/O-port
/// permission bitmap. Field layout up to `iomap_base` matches the hardware
/// TSS exactly (the x86_64 crate's own `TaskStateSegment` uses `VirtAddr`,
/// a `repr(transparent)` wrapper over `u64`, for the same fields). A single
/// instance is shared kernel-wide; `set_io_bitmap` copies the currently
/// scheduled process's bitmap into it on every context switch.
#[repr(C, packed)]
struct TssWithBitmap {
    reserved_1: u32,
    privilege_stack_table: [VirtAddr; 3],
    reserved_2: u64,
    interrupt_stack_table: [VirtAddr; 7],
    reserved_3: u64,
    reserved_4: u16,
    iomap_base: u16,
    io_bitmap: [u8; IO_BITMAP_BYTES],
}

impl TssWithBitmap {
    const fn new() -> Self {
        TssWithBitmap {
            reserved_1: 0,
            privilege_stack_table: [VirtAddr::zero(); 3],
            reserved_2: 0,
            interrupt_stack_table: [VirtAddr::zero(); 7],
            reserved_3: 0,
            reserved_4: 0,
            iomap_base: core::mem::size_of::<[u64; 11]>() as u16 + 8,
            io_bitmap: [0xff; IO_BITMAP_BYTES],
        }
    }
}

/// Build the 16-byte 64-bit system-segment descriptor for a TSS-shaped
/// structure at an arbitrary base/limit, mirroring `x86_64`'s own (private)
/// `Descriptor::tss_segment` construction.
fn tss_descriptor(base: u64, limit: u64) -> Descriptor {
    let mut low: u64 = 1 << 47; // present
    low |= limit & 0xffff;
    low |= (base & 0xff_ffff) << 16;
    low |= 0b1001 << 40; // type: available 64-bit TSS
    low |= ((base >> 24) & 0xff) << 56;

    let high: u64 = (base >> 32) & 0xffff_ffff;

    Descriptor::SystemSegment(low, high)
}

static TSS: OnceCell<TssWithBitmap> = OnceCell::uninit();
static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();
static TSS_PTR: AtomicPtr<TssWithBitmap> = AtomicPtr::new(core::ptr::null_mut());

struct Selectors {
    code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
}

// Export user segment selectors for context switching
// These will be initialized dynamically when GDT is created
pub static mut USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(0, PrivilegeLevel::Ring0);
pub static mut USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(0, PrivilegeLevel::Ring0);

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS};
    use x86_64::instructions::tables::load_tss;

    TSS.init_once(|| {
        let mut tss = TssWithBitmap::new();

        let df_stack_top = unsafe { core::ptr::addr_of!(DOUBLE_FAULT_STACK) as u64 + DOUBLE_FAULT_STACK_SIZE as u64 };
        let pf_stack_top = unsafe { core::ptr::addr_of!(PAGE_FAULT_STACK) as u64 + PAGE_FAULT_STACK_SIZE as u64 };
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = VirtAddr::new(df_stack_top);
        tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] = VirtAddr::new(pf_stack_top);

        // RSP0 is set once a real kernel stack is allocated, via set_kernel_stack.
        tss.privilege_stack_table[0] = VirtAddr::zero();

        log::info!("TSS I/O permission bitmap enabled at offset {}", tss.iomap_base);

        tss
    });

    // Store a pointer to the TSS for later updates
    let tss_ref = TSS.get().unwrap();
    TSS_PTR.store(tss_ref as *const _ as *mut _, Ordering::Release);

    // Log TSS address for debugging CR3 switch issues
    let tss_addr = tss_ref as *const _ as u64;
    log::info!("TSS located at {:#x} (PML4 index {})", tss_addr, (tss_addr >> 39) & 0x1FF);

    GDT.init_once(|| {
        let mut gdt = GlobalDescriptorTable::new();

        // Kernel segments
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_limit = core::mem::size_of::<TssWithBitmap>() as u64 - 1;
        let tss_selector = gdt.append(tss_descriptor(tss_addr, tss_limit));

        // User segments (Ring 3)
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());

        (
            gdt,
            Selectors {
                code_selector,
                tss_selector,
                data_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    });

    let (gdt, selectors) = GDT.get().unwrap();

    gdt.load();
    
    // Log GDT address for debugging CR3 switch issues
    use x86_64::instructions::tables::sgdt;
    let gdtr = sgdt();
    log::info!("GDT loaded at {:#x} (PML4 index {})", gdtr.base.as_u64(), (gdtr.base.as_u64() >> 39) & 0x1FF);
    unsafe {
        CS::set_reg(selectors.code_selector);
        DS::set_reg(selectors.data_selector);
        load_tss(selectors.tss_selector);
    }

    // Store user segment selectors for context switching
    unsafe {
        USER_CODE_SELECTOR = selectors.user_code_selector;
        USER_DATA_SELECTOR = selectors.user_data_selector;
    }

    log::info!("GDT initialized with kernel and user segments");
    log::debug!("  Kernel code: {:#x}", selectors.code_selector.0);
    log::debug!("  Kernel data: {:#x}", selectors.data_selector.0);
    log::debug!("  TSS: {:#x}", selectors.tss_selector.0);
    log::debug!("  User data: {:#x}", selectors.user_data_selector.0);
    log::debug!("  User code: {:#x}", selectors.user_code_selector.0);
    
    // Dump raw GDT descriptors for debugging
    unsafe {
        let gdtr = x86_64::instructions::tables::sgdt();
        log::debug!("GDT base: {:#x}, limit: {:#x}", gdtr.base.as_u64(), gdtr.limit);
        
        // Dump user segment descriptors
        let gdt_base = gdtr.base.as_ptr::<u64>();
        let user_data_desc = *gdt_base.offset(5);  // Index 5
        let user_code_desc = *gdt_base.offset(6);  // Index 6
        
        log::debug!("Raw user data descriptor (0x2b): {:#018x}", user_data_desc);
        log::debug!("Raw user code descriptor (0x33): {:#018x}", user_code_desc);
        
        // Decode user data descriptor
        let present = (user_data_desc >> 47) & 1;
        let dpl = (user_data_desc >> 45) & 3;
        let s_bit = (user_data_desc >> 44) & 1;
        let type_field = (user_data_desc >> 40) & 0xF;
        log::debug!("  User data: P={} DPL={} S={} Type={:#x}", present, dpl, s_bit, type_field);
        
        // Decode user code descriptor
        let present = (user_code_desc >> 47) & 1;
        let dpl = (user_code_desc >> 45) & 3;
        let s_bit = (user_code_desc >> 44) & 1;
        let type_field = (user_code_desc >> 40) & 0xF;
        let l_bit = (user_code_desc >> 53) & 1;
        let d_bit = (user_code_desc >> 54) & 1;
        log::debug!("  User code: P={} DPL={} S={} Type={:#x} L={} D={}", 
            present, dpl, s_bit, type_field, l_bit, d_bit);
    }

    // Log TSS setup
    let tss = TSS.get().unwrap();
    let rsp0 = tss.privilege_stack_table[0];
    let ist0 = tss.interrupt_stack_table[0];
    log::debug!("  TSS RSP0 (kernel stack): {:#x}", rsp0);
    log::debug!("  TSS IST[0] (double fault stack): {:#x}", ist0);
}

pub fn user_code_selector() -> SegmentSelector {
    GDT.get().expect("GDT not initialized").1.user_code_selector
}

pub fn user_data_selector() -> SegmentSelector {
    GDT.get().expect("GDT not initialized").1.user_data_selector
}

pub fn kernel_code_selector() -> SegmentSelector {
    GDT.get().expect("GDT not initialized").1.code_selector
}

pub fn kernel_data_selector() -> SegmentSelector {
    GDT.get().expect("GDT not initialized").1.data_selector
}

pub fn set_kernel_stack(stack_top: VirtAddr) {
    let tss_ptr = TSS_PTR.load(Ordering::Acquire);
    if !tss_ptr.is_null() {
        unsafe {
            let old_stack = (*tss_ptr).privilege_stack_table[0];
            (*tss_ptr).privilege_stack_table[0] = stack_top;
            crate::serial_println!(
                "TSS RSP0 updated: {:#x} -> {:#x}",
                old_stack.as_u64(),
                stack_top.as_u64()
            );
        }
    } else {
        panic!("TSS not initialized");
    }
}

/// Get the current TSS RSP0 value for debugging
pub fn get_tss_rsp0() -> u64 {
    let tss_ptr = TSS_PTR.load(Ordering::Acquire);
    if !tss_ptr.is_null() {
        unsafe { (*tss_ptr).privilege_stack_table[0].as_u64() }
    } else {
        0
    }
}

/// Set TSS.RSP0 directly (for testing/debugging)
pub fn set_tss_rsp0(kernel_stack_top: VirtAddr) {
    let tss_ptr = TSS_PTR.load(Ordering::Acquire);
    if !tss_ptr.is_null() {
        unsafe {
            (*tss_ptr).privilege_stack_table[0] = kernel_stack_top;
        }
    }
}

/// Get GDT base and limit for logging
pub fn get_gdt_info() -> (u64, u16) {
    let gdtr = x86_64::instructions::tables::sgdt();
    (gdtr.base.as_u64(), gdtr.limit)
}

/// Get TSS base address and RSP0 for logging
pub fn get_tss_info() -> (u64, u64) {
    let tss_ptr = TSS_PTR.load(Ordering::Acquire);
    if !tss_ptr.is_null() {
        let base = tss_ptr as u64;
        let rsp0 = unsafe { (*tss_ptr).privilege_stack_table[0].as_u64() };
        (base, rsp0)
    } else {
        (0, 0)
    }
}
