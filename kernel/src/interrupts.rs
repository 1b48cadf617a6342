//! IDT setup, the 8259 PIC, and the IRQ dispatch table device drivers
//! register against.
//!
//! Exception vectors are wired one-to-one to named handlers. Hardware IRQs
//! are wired through a small per-line chain: several PCI functions can share
//! a legacy IRQ line (AHCI, OHCI and EHCI commonly do), so each line holds a
//! list of candidate handlers tried in registration order until one reports
//! the interrupt was its own.

use crate::gdt::{DOUBLE_FAULT_IST_INDEX, PAGE_FAULT_IST_INDEX};
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Irq {
    Timer = 0,
    Keyboard = 1,
    Serial2 = 3,
    Serial1 = 4,
    SharedPci = 11,
    AtaPrimary = 14,
    AtaSecondary = 15,
}

impl Irq {
    fn vector(self) -> u8 {
        PIC_1_OFFSET + self as u8
    }
}

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::uninit();

/// Depth counter so `memory::physical`'s allocator guard can refuse
/// allocation from interrupt context. Incremented on entry to every
/// handler below, decremented on the way out.
static IRQ_DEPTH: AtomicUsize = AtomicUsize::new(0);

pub fn in_interrupt_context() -> bool {
    IRQ_DEPTH.load(Ordering::Acquire) > 0
}

struct InterruptGuard;

impl InterruptGuard {
    fn enter() -> Self {
        IRQ_DEPTH.fetch_add(1, Ordering::AcqRel);
        InterruptGuard
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        IRQ_DEPTH.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A device ISR returns `true` once it has established the interrupt was
/// actually raised by its own controller (status/cause register non-zero)
/// and it has handled it, `false` to let the chain try the next handler.
pub type DeviceIsr = fn() -> bool;

const MAX_CHAIN: usize = 4;
const NUM_LINES: usize = 16;

struct IrqChain {
    handlers: Mutex<([Option<DeviceIsr>; MAX_CHAIN], usize)>,
}

impl IrqChain {
    const fn new() -> Self {
        IrqChain {
            handlers: Mutex::new(([None; MAX_CHAIN], 0)),
        }
    }
}

static IRQ_CHAINS: [IrqChain; NUM_LINES] = [
    IrqChain::new(), IrqChain::new(), IrqChain::new(), IrqChain::new(),
    IrqChain::new(), IrqChain::new(), IrqChain::new(), IrqChain::new(),
    IrqChain::new(), IrqChain::new(), IrqChain::new(), IrqChain::new(),
    IrqChain::new(), IrqChain::new(), IrqChain::new(), IrqChain::new(),
];

/// Register a driver ISR on a legacy IRQ line. Called once per device at
/// probe time (the PCI dispatch in `drivers::pci` reads the interrupt-line
/// register and calls this with the matching `Irq`).
pub fn register_irq_handler(irq: Irq, handler: DeviceIsr) {
    let chain = &IRQ_CHAINS[irq as usize];
    let mut guard = chain.handlers.lock();
    let (slots, len) = &mut *guard;
    if *len >= MAX_CHAIN {
        log::warn!("IRQ{} chain full, dropping handler registration", irq as u8);
        return;
    }
    slots[*len] = Some(handler);
    *len += 1;
}

fn dispatch_chain(line: u8) {
    let chain = &IRQ_CHAINS[line as usize];
    let (slots, len) = {
        let guard = chain.handlers.lock();
        (guard.0, guard.1)
    };
    for slot in slots.iter().take(len) {
        if let Some(handler) = slot {
            if handler() {
                return;
            }
        }
    }
}

macro_rules! irq_handler {
    ($name:ident, $line:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            let _guard = InterruptGuard::enter();
            dispatch_chain($line);
            unsafe {
                PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + $line);
            }
        }
    };
}

irq_handler!(serial2_interrupt_handler, 3);
irq_handler!(serial1_interrupt_handler, 4);
irq_handler!(shared_pci_interrupt_handler, 11);
irq_handler!(ata_primary_interrupt_handler, 14);
irq_handler!(ata_secondary_interrupt_handler, 15);

/// IRQ1 fires for a PS/2 keyboard we do not drive (out of scope); still
/// must be acknowledged or the PIC stops delivering anything past it.
extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    use x86_64::instructions::port::Port;
    unsafe {
        let mut data_port: Port<u8> = Port::new(0x60);
        let _ = data_port.read();
        PICS.lock().notify_end_of_interrupt(Irq::Keyboard.vector());
    }
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    crate::time::timer_interrupt();
    unsafe {
        PICS.lock().notify_end_of_interrupt(Irq::Timer.vector());
    }
    if let Some(pid) = crate::task::scheduler::current_pid() {
        crate::task::scheduler::tick_and_switch(pid);
    }
}

extern "x86-interrupt" fn spurious_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + 7);
    }
}

const FAULT_KILLED_EXIT_CODE: i32 = -9;

fn fault_current_process(name: &str, frame: &InterruptStackFrame) {
    log::error!("{} at {:#x}", name, frame.instruction_pointer.as_u64());
    match crate::task::scheduler::current_pid() {
        Some(pid) if !crate::task::scheduler::is_kernel_critical(pid) => {
            crate::task::scheduler::terminate_current(FAULT_KILLED_EXIT_CODE);
            crate::task::scheduler::reschedule_now();
        }
        _ => panic!("{} in kernel/idle/exception context, unrecoverable", name),
    }
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    fault_current_process("divide error", &frame);
}

extern "x86-interrupt" fn debug_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    log::trace!("debug trap at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn non_maskable_interrupt_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    log::warn!("NMI at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    log::info!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn overflow_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    fault_current_process("overflow", &frame);
}

extern "x86-interrupt" fn bound_range_exceeded_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    fault_current_process("bound range exceeded", &frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    fault_current_process("invalid opcode", &frame);
}

/// Lazy FPU ownership: `on_context_switch` sets CR0.TS whenever the
/// scheduler is about to resume a process that isn't the FPU's current
/// owner, so that process's first FPU instruction traps here instead of
/// eagerly saving/restoring 512 bytes on every switch. Resuming the owner
/// itself clears TS up front and skips the trap entirely.
static FPU_OWNER: Mutex<Option<u64>> = Mutex::new(None);

/// Called by the scheduler right before jumping into `new_pid`: arms or
/// disarms the device-not-available trap depending on whether `new_pid`
/// already owns the FPU.
pub fn on_context_switch(new_pid: u64) {
    use x86_64::registers::control::{Cr0, Cr0Flags};
    let owner = *FPU_OWNER.lock();
    unsafe {
        let mut flags = Cr0::read();
        if owner == Some(new_pid) {
            flags.remove(Cr0Flags::TASK_SWITCHED);
        } else {
            flags.insert(Cr0Flags::TASK_SWITCHED);
        }
        Cr0::write(flags);
    }
}

/// `fxsave`/`fxrstor` into a process's 512-byte save area (`FxSave` legacy
/// layout, 16-byte aligned per the instruction's own requirement).
unsafe fn fxsave(area: &mut [u8; 512]) {
    core::arch::asm!("fxsave [{}]", in(reg) area.as_mut_ptr(), options(nostack));
}

unsafe fn fxrstor(area: &[u8; 512]) {
    core::arch::asm!("fxrstor [{}]", in(reg) area.as_ptr(), options(nostack));
}

/// On first FPU use after a switch: if a previous owner's state is still
/// live in hardware, save it; if the new owner has a saved state of its
/// own, restore it; otherwise initialize a clean FPU state (masking all
/// exceptions, the `fninit` default) for a process using it for the first
/// time.
extern "x86-interrupt" fn device_not_available_handler(_frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    unsafe {
        core::arch::asm!("clts");
    }
    let current = match crate::task::scheduler::current_pid() {
        Some(pid) => pid,
        None => return,
    };
    let mut owner = FPU_OWNER.lock();
    if let Some(prev) = *owner {
        if prev != current {
            crate::task::scheduler::with_fpu_state(prev, |area, saved| unsafe {
                fxsave(area);
                *saved = true;
            });
        }
    }
    let restored = crate::task::scheduler::with_fpu_state(current, |area, saved| {
        if *saved {
            unsafe {
                fxrstor(area);
            }
            true
        } else {
            false
        }
    });
    if restored != Some(true) {
        unsafe {
            core::arch::asm!("fninit");
        }
    }
    *owner = Some(current);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    panic!(
        "double fault (error code {:#x}) at {:#x}",
        error_code,
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn invalid_tss_handler(frame: InterruptStackFrame, error_code: u64) {
    let _guard = InterruptGuard::enter();
    log::error!("invalid TSS (selector {:#x})", error_code);
    fault_current_process("invalid TSS", &frame);
}

extern "x86-interrupt" fn segment_not_present_handler(frame: InterruptStackFrame, error_code: u64) {
    let _guard = InterruptGuard::enter();
    log::error!("segment not present (selector {:#x})", error_code);
    fault_current_process("segment not present", &frame);
}

extern "x86-interrupt" fn stack_segment_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    let _guard = InterruptGuard::enter();
    log::error!("stack segment fault (error code {:#x})", error_code);
    fault_current_process("stack segment fault", &frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    frame: InterruptStackFrame,
    error_code: u64,
) {
    let _guard = InterruptGuard::enter();
    log::error!("general protection fault (error code {:#x})", error_code);
    fault_current_process("general protection fault", &frame);
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let _guard = InterruptGuard::enter();
    let fault_addr = x86_64::registers::control::Cr2::read();
    log::error!("page fault at {:?} ({:?})", fault_addr, error_code);
    fault_current_process("page fault", &frame);
}

extern "x86-interrupt" fn x87_floating_point_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    fault_current_process("x87 floating point exception", &frame);
}

extern "x86-interrupt" fn alignment_check_handler(frame: InterruptStackFrame, _error_code: u64) {
    let _guard = InterruptGuard::enter();
    fault_current_process("alignment check", &frame);
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    panic!(
        "machine check exception at {:#x}",
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn simd_floating_point_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    fault_current_process("SIMD floating point exception", &frame);
}

extern "x86-interrupt" fn virtualization_handler(frame: InterruptStackFrame) {
    let _guard = InterruptGuard::enter();
    log::warn!(
        "virtualization exception at {:#x}",
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn security_exception_handler(frame: InterruptStackFrame, _error_code: u64) {
    let _guard = InterruptGuard::enter();
    fault_current_process("security exception", &frame);
}

fn init_idt() {
    IDT.init_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt
            .set_handler_fn(non_maskable_interrupt_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded
            .set_handler_fn(bound_range_exceeded_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault
            .set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        unsafe {
            idt.page_fault
                .set_handler_fn(page_fault_handler)
                .set_stack_index(PAGE_FAULT_IST_INDEX);
        }
        idt.x87_floating_point
            .set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point
            .set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        idt.security_exception
            .set_handler_fn(security_exception_handler);

        idt[Irq::Timer.vector() as usize].set_handler_fn(timer_interrupt_handler);
        idt[Irq::Keyboard.vector() as usize].set_handler_fn(keyboard_interrupt_handler);
        idt[Irq::Serial2.vector() as usize].set_handler_fn(serial2_interrupt_handler);
        idt[Irq::Serial1.vector() as usize].set_handler_fn(serial1_interrupt_handler);
        idt[(PIC_1_OFFSET + 7) as usize].set_handler_fn(spurious_interrupt_handler);
        idt[Irq::SharedPci.vector() as usize].set_handler_fn(shared_pci_interrupt_handler);
        idt[Irq::AtaPrimary.vector() as usize].set_handler_fn(ata_primary_interrupt_handler);
        idt[Irq::AtaSecondary.vector() as usize].set_handler_fn(ata_secondary_interrupt_handler);

        idt
    });
    IDT.get().unwrap().load();
}

fn init_pic() {
    unsafe {
        PICS.lock().initialize();
    }
}

/// Mask every line at remap time; drivers call `enable_irq` once they've
/// actually claimed a device on that line.
fn mask_all_lines() {
    use x86_64::instructions::port::Port;
    unsafe {
        let mut mask1: Port<u8> = Port::new(0x21);
        let mut mask2: Port<u8> = Port::new(0xA1);
        mask1.write(0xffu8);
        mask2.write(0xffu8);
    }
}

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Unmask a line. Automatically also unmasks IRQ2, the PIC1-PIC2 cascade
/// line, the first time a PIC2 (irq >= 8) line is enabled.
pub fn enable_irq(irq: Irq) {
    use x86_64::instructions::port::Port;
    let line = irq as u8;
    unsafe {
        let (port_addr, bit): (u16, u8) = if line < 8 {
            (0x21, line)
        } else {
            (0xA1, line - 8)
        };
        let mut port: Port<u8> = Port::new(port_addr);
        let mask = port.read();
        port.write(mask & !(1 << bit));
        if line >= 8 {
            let mut cascade: Port<u8> = Port::new(0x21);
            let cascade_mask = cascade.read();
            cascade.write(cascade_mask & !(1 << 2));
        }
    }
}

pub fn init() {
    init_idt();
    init_pic();
    mask_all_lines();
    enable_irq(Irq::Timer);
    x86_64::instructions::interrupts::enable();
    ENABLED.store(true, Ordering::Release);
    log::info!("interrupts initialized");
}

pub fn are_interrupts_enabled() -> bool {
    ENABLED.load(Ordering::Acquire) && x86_64::instructions::interrupts::are_enabled()
}

#[allow(dead_code)]
fn stack_frame_rip(frame: &InterruptStackFrame) -> VirtAddr {
    frame.instruction_pointer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn irq_vector_offsets_match_pic_remap() {
        assert_eq!(Irq::Timer.vector(), 32);
        assert_eq!(Irq::AtaPrimary.vector(), 46);
    }

    #[test_case]
    fn interrupt_guard_tracks_depth() {
        assert!(!in_interrupt_context());
        {
            let _g = InterruptGuard::enter();
            assert!(in_interrupt_context());
        }
        assert!(!in_interrupt_context());
    }
}
