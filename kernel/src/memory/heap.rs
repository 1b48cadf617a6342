//! Kernel heap: a fixed virtual region backed by `linked_list_allocator`.
//!
//! `kalloc`/`kfree` (i.e. every `alloc`/`dealloc` the global allocator
//! routes here) refuse interrupt-context callers the same way
//! `memory::physical` does, since growing or walking the free list isn't
//! interrupt-safe: `GuardedHeap` wraps `LockedHeap` and uses `try_lock`
//! instead of `lock` so a reentrant or ISR-context caller gets a null
//! allocation (surfacing as `alloc_error_handler`) rather than deadlocking
//! on a lock this same context already holds.

use crate::memory::physical::{self, GlobalFrameAllocator};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::{Mapper, OffsetPageTable, Page, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

pub const HEAP_START: u64 = 0x_4444_4444_0000;
pub const HEAP_SIZE: u64 = 32 * 1024 * 1024;

struct GuardedHeap(LockedHeap);

unsafe impl GlobalAlloc for GuardedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.0.try_lock() {
            Some(mut heap) => heap
                .allocate_first_fit(layout)
                .map(|a| a.as_ptr())
                .unwrap_or(core::ptr::null_mut()),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match self.0.try_lock() {
            Some(mut heap) => {
                #[cfg(debug_assertions)]
                core::ptr::write_bytes(ptr, 0, layout.size());
                heap.deallocate(NonNull::new_unchecked(ptr), layout);
            }
            None => {
                log::error!(
                    "kernel heap dealloc skipped: allocator busy, leaking {} bytes",
                    layout.size()
                );
            }
        }
    }
}

#[global_allocator]
static ALLOCATOR: GuardedHeap = GuardedHeap(LockedHeap::empty());

/// Map the heap's virtual range and hand it to the allocator.
pub fn init(mapper: &OffsetPageTable<'static>) -> Result<(), &'static str> {
    let heap_start = VirtAddr::new(HEAP_START);
    let heap_end = heap_start + HEAP_SIZE;
    let heap_start_page = Page::<Size4KiB>::containing_address(heap_start);
    let heap_end_page = Page::<Size4KiB>::containing_address(heap_end - 1u64);

    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    for page in Page::range_inclusive(heap_start_page, heap_end_page) {
        let frame_addr = physical::alloc(
            physical::FRAME_SIZE,
            physical::FRAME_SIZE,
            physical::KERNEL_PID,
            "heap",
        )
        .map_err(|_| "out of memory mapping kernel heap")?;
        let frame = x86_64::structures::paging::PhysFrame::containing_address(
            x86_64::PhysAddr::new(frame_addr),
        );

        unsafe {
            let locked_mapper = mapper as *const _ as *mut OffsetPageTable<'static>;
            (*locked_mapper)
                .map_to(page, frame, flags, &mut GlobalFrameAllocator)
                .map_err(|_| "failed to map heap page")?
                .flush();
        }
    }

    unsafe {
        ALLOCATOR
            .0
            .lock()
            .init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }

    log::info!(
        "heap initialized at {:#x}, size {} KiB",
        HEAP_START,
        HEAP_SIZE / 1024
    );

    Ok(())
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}
