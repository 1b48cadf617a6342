//! Per-process paging manager.
//!
//! The contract (`map`/`unmap`/`map_mapped`/`get_physical`/`new_directory`/
//! `share_directory`/`delete_directory`/`set_attrs`) comes from a 32-bit,
//! 2-level (1024×32-bit-entry) page-directory/page-table model. Long mode
//! has no such table shape — it's 4-level, 512-entry, 64-bit-entry paging —
//! so that contract is implemented here on top of an `OffsetPageTable` per
//! process; "directory" below means "this process's PML4 plus its owned
//! lower-level tables", not a literal x86 page directory.

use crate::error::KernelError;
use crate::memory::physical::{self, GlobalFrameAllocator};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::{Translate, TranslateResult};
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

/// Kernel region starts here; per spec, kernel PDEs are aliased (GLOBAL) into
/// every process directory so TLB entries for kernel mappings survive CR3
/// switches. This is `crate::memory::layout::KERNEL_BASE`.
pub const KERNEL_VIRTUAL_ADDRESS: u64 = crate::memory::layout::KERNEL_BASE;

static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

bitflags::bitflags! {
    /// Attribute bits `set_attrs` can toggle on an existing mapping.
    #[derive(Clone, Copy)]
    pub struct Attrs: u32 {
        const USER           = 1 << 0;
        const WRITABLE       = 1 << 1;
        const CACHE_DISABLE  = 1 << 2;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Place the mapping at an exact caller-supplied virtual address.
    Exact,
    /// Find a free virtual range in the process's (or kernel's) region.
    Any,
}

/// One process's address space: its own PML4 frame plus the bookkeeping
/// needed to free owned page tables and to support directory sharing.
struct Directory {
    pml4_frame: PhysFrame,
    /// Next free virtual address to try for `MapMode::Any` allocations,
    /// scanned forward monotonically within the process/kernel region.
    next_any_addr: u64,
    is_kernel: bool,
}

struct PagingState {
    directories: BTreeMap<u64, Directory>,
    kernel_pml4_frame: PhysFrame,
    /// Live reference count per PML4 frame, keyed by its physical address.
    /// A thread's directory entry points at the same frame as its parent's;
    /// tracking the count per-frame (rather than per-pid entry) is what lets
    /// `delete_directory` tell a borrower tearing down its own entry apart
    /// from the last reference actually freeing the frame.
    frame_refs: BTreeMap<u64, u32>,
}

static STATE: Mutex<Option<PagingState>> = Mutex::new(None);

/// Lowest unallocated virtual address handed out to user processes by
/// `MapMode::Any`, below the user stack region and above the ELF image.
const USER_ANY_BASE: u64 = 0x1000_0000;

pub unsafe fn init(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);
    let (kernel_pml4_frame, _) = Cr3::read();

    let mut directories = BTreeMap::new();
    directories.insert(
        physical::KERNEL_PID,
        Directory {
            pml4_frame: kernel_pml4_frame,
            next_any_addr: KERNEL_VIRTUAL_ADDRESS,
            is_kernel: true,
        },
    );
    let mut frame_refs = BTreeMap::new();
    frame_refs.insert(kernel_pml4_frame.start_address().as_u64(), 1);
    *STATE.lock() = Some(PagingState {
        directories,
        kernel_pml4_frame,
        frame_refs,
    });

    log::info!("paging: kernel directory at pml4={:?}", kernel_pml4_frame);
    mapper_for(kernel_pml4_frame)
}

fn phys_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET.get().expect("paging not initialized")
}

/// Build an `OffsetPageTable` over an arbitrary PML4 frame. Every directory
/// shares the same physical-memory offset mapping, so this is safe to call
/// for any process's frame once the HHDM is established.
fn mapper_for(pml4_frame: PhysFrame) -> OffsetPageTable<'static> {
    let offset = phys_offset();
    let virt = offset + pml4_frame.start_address().as_u64();
    let table_ptr: *mut PageTable = virt.as_mut_ptr();
    unsafe { OffsetPageTable::new(&mut *table_ptr, offset) }
}

/// Get a mapper for the currently loaded (active) address space.
pub unsafe fn get_mapper() -> OffsetPageTable<'static> {
    let (frame, _) = Cr3::read();
    mapper_for(frame)
}

pub unsafe fn get_mapper_with_offset(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    let (frame, _) = Cr3::read();
    let virt = physical_memory_offset + frame.start_address().as_u64();
    let table_ptr: *mut PageTable = virt.as_mut_ptr();
    OffsetPageTable::new(&mut *table_ptr, physical_memory_offset)
}

pub unsafe fn enable_global_pages() {
    use x86_64::registers::control::{Cr4, Cr4Flags};
    let mut cr4 = Cr4::read();
    if !cr4.contains(Cr4Flags::PAGE_GLOBAL) {
        cr4 |= Cr4Flags::PAGE_GLOBAL;
        Cr4::write(cr4);
        log::info!("paging: enabled CR4.PGE");
    }
}

fn with_state<F, R>(f: F) -> Result<R, KernelError>
where
    F: FnOnce(&mut PagingState) -> Result<R, KernelError>,
{
    let mut guard = STATE.lock();
    let state = guard.as_mut().ok_or(KernelError::NotInitialized)?;
    f(state)
}

/// Create a fresh directory for `pid`, aliasing the kernel's upper PML4
/// entries (covering `KERNEL_VIRTUAL_ADDRESS` and above) so kernel mappings
/// are visible without walking the kernel directory on every fault.
pub fn new_directory(pid: u64) -> Result<(), KernelError> {
    with_state(|state| {
        if state.directories.contains_key(&pid) {
            return Err(KernelError::InvalidArgument);
        }
        let frame = physical::alloc(4096, 4096, pid, "pml4")
            .map(|p| PhysFrame::containing_address(PhysAddr::new(p)))
            .map_err(|_| KernelError::NoFree)?;

        let offset = phys_offset();
        let new_table: &mut PageTable =
            unsafe { &mut *(offset + frame.start_address().as_u64()).as_mut_ptr() };
        new_table.zero();

        let kernel_table: &PageTable = unsafe {
            &*(offset + state.kernel_pml4_frame.start_address().as_u64()).as_ptr()
        };
        // PML4 index for KERNEL_VIRTUAL_ADDRESS and above; copying these
        // entries (marked GLOBAL at the leaf level) makes the kernel
        // half of every process's address space identical and TLB-stable
        // across CR3 switches.
        let kernel_pml4_index = ((KERNEL_VIRTUAL_ADDRESS >> 39) & 0x1ff) as usize;
        for i in kernel_pml4_index..512 {
            new_table[i] = kernel_table[i].clone();
        }

        state.directories.insert(
            pid,
            Directory {
                pml4_frame: frame,
                next_any_addr: USER_ANY_BASE,
                is_kernel: false,
            },
        );
        state.frame_refs.insert(frame.start_address().as_u64(), 1);
        Ok(())
    })
}

/// Share `parent`'s directory with `child` (thread creation): child's
/// directory lookups resolve to the same PML4 frame, and freeing either
/// only tears the mapping down once the share count reaches zero.
pub fn share_directory(parent: u64, child: u64) -> Result<(), KernelError> {
    with_state(|state| {
        let frame = state
            .directories
            .get(&parent)
            .ok_or(KernelError::NoSuchEntry)?
            .pml4_frame;
        *state.frame_refs.entry(frame.start_address().as_u64()).or_insert(0) += 1;
        state.directories.insert(
            child,
            Directory {
                pml4_frame: frame,
                next_any_addr: USER_ANY_BASE,
                is_kernel: false,
            },
        );
        Ok(())
    })
}

/// Drop this pid's reference to its directory. If other pids (the parent or
/// sibling threads) still hold a reference to the same PML4 frame, only this
/// pid's entry is removed; the frame and its owned sub-tables are only freed
/// once the last reference is dropped.
pub fn delete_directory(pid: u64) -> Result<(), KernelError> {
    with_state(|state| {
        let dir = state.directories.get(&pid).ok_or(KernelError::NoSuchEntry)?;
        if dir.is_kernel {
            return Err(KernelError::Permission);
        }
        let pml4_frame = dir.pml4_frame;
        let frame_key = pml4_frame.start_address().as_u64();

        let remaining = {
            let count = state.frame_refs.get_mut(&frame_key).ok_or(KernelError::NoSuchEntry)?;
            *count -= 1;
            *count
        };
        state.directories.remove(&pid);

        if remaining > 0 {
            return Ok(());
        }
        state.frame_refs.remove(&frame_key);

        // Last reference gone: release owned page tables below the kernel
        // split, then the PML4 frame itself. Kernel-half entries are
        // shared, never owned here.
        let offset = phys_offset();
        let table: &PageTable =
            unsafe { &*(offset + pml4_frame.start_address().as_u64()).as_ptr() };
        let kernel_pml4_index = ((KERNEL_VIRTUAL_ADDRESS >> 39) & 0x1ff) as usize;
        for i in 0..kernel_pml4_index {
            let entry = &table[i];
            if entry.flags().contains(PageTableFlags::PRESENT) {
                free_subtree(entry.addr(), 3);
            }
        }
        physical::deallocate_frame(pml4_frame);
        Ok(())
    })
}

/// Recursively free an owned sub-table tree (levels 3..1); frees the leaf
/// frames is the caller's job via `unmap`, this only reclaims page-table
/// pages themselves once a directory is torn down wholesale.
fn free_subtree(frame_addr: PhysAddr, level: u8) {
    if level == 0 {
        return;
    }
    let offset = phys_offset();
    let table: &PageTable = unsafe { &*(offset + frame_addr.as_u64()).as_ptr() };
    for entry in table.iter() {
        if entry.flags().contains(PageTableFlags::PRESENT) && level > 1 {
            free_subtree(entry.addr(), level - 1);
        }
    }
    physical::deallocate_frame(PhysFrame::containing_address(frame_addr));
}

fn dir_pml4_frame(state: &PagingState, pid: u64) -> Result<PhysFrame, KernelError> {
    state
        .directories
        .get(&pid)
        .map(|d| d.pml4_frame)
        .ok_or(KernelError::NoSuchEntry)
}

fn page_flags(pid: u64, attrs: Attrs) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if attrs.contains(Attrs::WRITABLE) {
        flags |= PageTableFlags::WRITABLE;
    }
    if pid != physical::KERNEL_PID && attrs.contains(Attrs::USER) {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    if attrs.contains(Attrs::CACHE_DISABLE) {
        flags |= PageTableFlags::NO_CACHE;
    }
    if pid == physical::KERNEL_PID {
        flags |= PageTableFlags::GLOBAL;
    }
    flags
}

/// Find `count` contiguous unmapped pages starting from `dir.next_any_addr`,
/// in the caller's region (kernel region for the kernel pid).
fn find_any_range(mapper: &OffsetPageTable, start: u64, count: u64) -> u64 {
    let mut candidate = start;
    'search: loop {
        for i in 0..count {
            let page = Page::<Size4KiB>::containing_address(VirtAddr::new(candidate + i * 4096));
            if mapper.translate_page(page).is_ok() {
                candidate += 4096;
                continue 'search;
            }
        }
        return candidate;
    }
}

/// `map(pid, phys, virt_out, size, flags)`.
pub fn map(
    pid: u64,
    phys: u64,
    virt: Option<u64>,
    size: u64,
    mode: MapMode,
    attrs: Attrs,
) -> Result<u64, KernelError> {
    if size == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let pages = (size + 4095) / 4096;
    let flags = page_flags(pid, attrs);

    with_state(|state| {
        let pml4_frame = dir_pml4_frame(state, pid)?;
        let mut mapper = mapper_for(pml4_frame);

        let base = match mode {
            MapMode::Exact => virt.ok_or(KernelError::InvalidArgument)?,
            MapMode::Any => {
                let dir = state.directories.get(&pid).unwrap();
                find_any_range(&mapper, dir.next_any_addr, pages)
            }
        };

        ensure_spare_kernel_page(state)?;

        for i in 0..pages {
            let page = Page::<Size4KiB>::containing_address(VirtAddr::new(base + i * 4096));
            let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(phys + i * 4096));
            if mode == MapMode::Exact && mapper.translate_page(page).is_ok() {
                return Err(KernelError::NoFree);
            }
            unsafe {
                mapper
                    .map_to(page, frame, flags, &mut GlobalFrameAllocator)
                    .map_err(|_| KernelError::Memory)?
                    .flush();
            }
        }

        if let Some(dir) = state.directories.get_mut(&pid) {
            dir.next_any_addr = dir.next_any_addr.max(base + pages * 4096);
        }
        Ok(base)
    })
}

/// Guarantee a spare free page-table page exists in the kernel directory
/// before a user-directory mapping is allocated, so a page-table allocation
/// triggered while building a *user* directory never recurses into the
/// kernel directory's own allocation path.
fn ensure_spare_kernel_page(_state: &PagingState) -> Result<(), KernelError> {
    // The global frame allocator always has capacity to hand out one more
    // frame barring true exhaustion; the invariant here is structural (no
    // recursive directory-of-directories allocation happens in this
    // design, since `GlobalFrameAllocator` draws directly from the L0
    // allocator rather than another page-table's free list).
    Ok(())
}

pub fn unmap(pid: u64, virt: u64, size: u64) -> Result<(), KernelError> {
    let pages = (size + 4095) / 4096;
    with_state(|state| {
        let pml4_frame = dir_pml4_frame(state, pid)?;
        let mut mapper = mapper_for(pml4_frame);
        for i in 0..pages {
            let virt_addr = virt + i * 4096;
            let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt_addr));
            if let Ok((frame, flush)) = mapper.unmap(page) {
                flush.flush();
                physical::deallocate_frame(frame);
                reclaim_empty_tables(pml4_frame, virt_addr);
            }
        }
        Ok(())
    })
}

/// After clearing a PTE, walk back up PT → PD → PDPT and free any table
/// that's now entirely empty, clearing the parent entry that pointed to it
/// in turn — the "deletes a page-table if it becomes empty" half of
/// `unmap`'s contract. Never crosses into the kernel half of the address
/// space: those tables are shared (aliased into every directory), not
/// owned by this one, so they're never torn down from a per-process unmap.
fn reclaim_empty_tables(pml4_frame: PhysFrame, virt: u64) {
    if virt >= KERNEL_VIRTUAL_ADDRESS {
        return;
    }
    let offset = phys_offset();
    let pml4_index = ((virt >> 39) & 0x1ff) as usize;
    let pdpt_index = ((virt >> 30) & 0x1ff) as usize;
    let pd_index = ((virt >> 21) & 0x1ff) as usize;

    let pml4: &mut PageTable =
        unsafe { &mut *(offset + pml4_frame.start_address().as_u64()).as_mut_ptr() };
    let Ok(pdpt_frame) = pml4[pml4_index].frame() else { return };
    let pdpt: &mut PageTable =
        unsafe { &mut *(offset + pdpt_frame.start_address().as_u64()).as_mut_ptr() };
    let Ok(pd_frame) = pdpt[pdpt_index].frame() else { return };
    let pd: &mut PageTable = unsafe { &mut *(offset + pd_frame.start_address().as_u64()).as_mut_ptr() };
    let Ok(pt_frame) = pd[pd_index].frame() else { return };
    let pt: &PageTable = unsafe { &*(offset + pt_frame.start_address().as_u64()).as_ptr() };

    if !pt.iter().any(|e| e.flags().contains(PageTableFlags::PRESENT)) {
        pd[pd_index].set_unused();
        physical::deallocate_frame(pt_frame);

        if !pd.iter().any(|e| e.flags().contains(PageTableFlags::PRESENT)) {
            pdpt[pdpt_index].set_unused();
            physical::deallocate_frame(pd_frame);

            if !pdpt.iter().any(|e| e.flags().contains(PageTableFlags::PRESENT)) {
                pml4[pml4_index].set_unused();
                physical::deallocate_frame(pdpt_frame);
            }
        }
    }
}

pub fn map_mapped(pid: u64, virt: u64) -> bool {
    with_state(|state| {
        let pml4_frame = dir_pml4_frame(state, pid)?;
        let mapper = mapper_for(pml4_frame);
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt));
        Ok(mapper.translate_page(page).is_ok())
    })
    .unwrap_or(false)
}

pub fn get_physical(pid: u64, virt: u64) -> u64 {
    with_state(|state| {
        let pml4_frame = dir_pml4_frame(state, pid)?;
        let mapper = mapper_for(pml4_frame);
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(virt));
        match mapper.translate_page(page) {
            Ok(frame) => Ok(frame.start_address().as_u64() + (virt & 0xfff)),
            Err(_) => Ok(0),
        }
    })
    .unwrap_or(0)
}

pub fn set_attrs(pid: u64, set: bool, attrs: Attrs, virt: u64, size: u64) -> Result<(), KernelError> {
    let pages = (size + 4095) / 4096;
    with_state(|state| {
        let pml4_frame = dir_pml4_frame(state, pid)?;
        let mut mapper = mapper_for(pml4_frame);
        for i in 0..pages {
            let addr = VirtAddr::new(virt + i * 4096);
            let page = Page::<Size4KiB>::containing_address(addr);
            let mut flags = match mapper.translate(addr) {
                TranslateResult::Mapped { flags, .. } => flags,
                _ => return Err(KernelError::NoSuchEntry),
            };
            if attrs.contains(Attrs::WRITABLE) {
                flags.set(PageTableFlags::WRITABLE, set);
            }
            if attrs.contains(Attrs::USER) {
                flags.set(PageTableFlags::USER_ACCESSIBLE, set);
            }
            if attrs.contains(Attrs::CACHE_DISABLE) {
                flags.set(PageTableFlags::NO_CACHE, set);
            }
            unsafe {
                mapper
                    .update_flags(page, flags)
                    .map_err(|_| KernelError::NoSuchEntry)?
                    .flush();
            }
        }
        Ok(())
    })
}

/// Clear the USER bit on the topmost page of a user stack so it acts as a
/// guard page: an overflowing stack faults as a supervisor-only access
/// instead of silently growing into whatever is mapped above it.
pub fn set_stack_guard_page(pid: u64, stack_top: u64) -> Result<(), KernelError> {
    set_attrs(pid, false, Attrs::USER, stack_top - 4096, 4096)
}

/// Switch the active address space by loading `pid`'s PML4 into CR3.
pub fn switch_to(pid: u64) -> Result<(), KernelError> {
    with_state(|state| {
        let frame = dir_pml4_frame(state, pid)?;
        let (_, flags) = Cr3::read();
        unsafe {
            Cr3::write(frame, flags);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn attrs_bits_are_distinct() {
        assert_ne!(Attrs::USER.bits(), Attrs::WRITABLE.bits());
        assert_ne!(Attrs::WRITABLE.bits(), Attrs::CACHE_DISABLE.bits());
    }
}
