//! Block-bitmap physical memory allocator.
//!
//! One bit per 4 KiB frame (1 = used) over every usable region the
//! bootloader's memory map reports. Used frames are additionally recorded in
//! a fixed-capacity table of `{owner_pid, description, start, end}` so that
//! `ERR_MEMORY`/leak diagnosis doesn't need to walk the bitmap.

use crate::error::KernelError;
use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

pub const FRAME_SIZE: u64 = 4096;

/// Capacity heuristic carried over from the original allocator: one
/// used-block slot per 16 frames of total RAM, capped so the table itself
/// stays a bounded, pre-sized allocation.
const MAX_USED_BLOCKS: usize = 65536;

#[derive(Debug, Clone, Copy)]
struct UsedBlock {
    owner_pid: u64,
    description: [u8; 32],
    start: u64,
    end: u64,
}

struct Bitmap {
    bits: Vec<u64>,
    total_frames: usize,
    base_frame: u64,
}

impl Bitmap {
    fn is_used(&self, frame: u64) -> bool {
        let idx = (frame - self.base_frame) as usize;
        (self.bits[idx / 64] >> (idx % 64)) & 1 != 0
    }

    fn set_used(&mut self, frame: u64, used: bool) {
        let idx = (frame - self.base_frame) as usize;
        if used {
            self.bits[idx / 64] |= 1 << (idx % 64);
        } else {
            self.bits[idx / 64] &= !(1 << (idx % 64));
        }
    }

    fn in_range(&self, frame: u64) -> bool {
        frame >= self.base_frame && frame < self.base_frame + self.total_frames as u64
    }
}

struct Allocator {
    bitmap: Bitmap,
    used_blocks: Vec<UsedBlock>,
    free_frames: usize,
}

impl Allocator {
    fn reserve(&mut self, start: u64, end: u64, owner_pid: u64, desc: &str) -> Result<(), KernelError> {
        let start_frame = start / FRAME_SIZE;
        let end_frame = (end + FRAME_SIZE - 1) / FRAME_SIZE;
        for frame in start_frame..end_frame {
            if self.bitmap.in_range(frame) && !self.bitmap.is_used(frame) {
                self.bitmap.set_used(frame, true);
                self.free_frames -= 1;
            }
        }
        self.record_block(owner_pid, desc, start_frame * FRAME_SIZE, end_frame * FRAME_SIZE)
    }

    fn record_block(&mut self, owner_pid: u64, desc: &str, start: u64, end: u64) -> Result<(), KernelError> {
        if self.used_blocks.len() >= MAX_USED_BLOCKS {
            return Err(KernelError::Memory);
        }
        let mut description = [0u8; 32];
        let bytes = desc.as_bytes();
        let n = bytes.len().min(32);
        description[..n].copy_from_slice(&bytes[..n]);
        self.used_blocks.push(UsedBlock {
            owner_pid,
            description,
            start,
            end,
        });
        Ok(())
    }

    fn alloc(&mut self, size: u64, alignment: u64, owner_pid: u64, desc: &str) -> Result<u64, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if alignment != 0 && alignment % FRAME_SIZE != 0 {
            return Err(KernelError::Align);
        }
        let frames_needed = (size + FRAME_SIZE - 1) / FRAME_SIZE;
        let align_frames = if alignment == 0 { 1 } else { alignment / FRAME_SIZE };

        let mut frame = self.bitmap.base_frame;
        let end_frame = self.bitmap.base_frame + self.bitmap.total_frames as u64;
        while frame < end_frame {
            if self.bitmap.is_used(frame) {
                frame += 1;
                continue;
            }
            // Preserve the alignment invariant by jumping forward by whole
            // alignment strides rather than one frame at a time.
            if frame % align_frames != 0 {
                frame += align_frames - (frame % align_frames);
                continue;
            }
            let run_end = (frame + frames_needed).min(end_frame);
            let mut ok = true;
            for f in frame..run_end {
                if self.bitmap.is_used(f) {
                    ok = false;
                    break;
                }
            }
            if ok && run_end - frame == frames_needed {
                for f in frame..run_end {
                    self.bitmap.set_used(f, true);
                }
                self.free_frames -= frames_needed as usize;
                let start = frame * FRAME_SIZE;
                let end = run_end * FRAME_SIZE;
                self.record_block(owner_pid, desc, start, end)?;
                return Ok(start);
            }
            frame += 1;
        }
        Err(KernelError::Memory)
    }

    fn free(&mut self, phys_addr: u64) -> Result<(), KernelError> {
        let pos = self
            .used_blocks
            .iter()
            .position(|b| b.start == phys_addr)
            .ok_or(KernelError::NoSuchEntry)?;
        let block = self.used_blocks.swap_remove(pos);
        let start_frame = block.start / FRAME_SIZE;
        let end_frame = block.end / FRAME_SIZE;
        for frame in start_frame..end_frame {
            if self.bitmap.in_range(frame) {
                self.bitmap.set_used(frame, false);
                self.free_frames += 1;
            }
        }
        Ok(())
    }

    fn owned_frames(&self, pid: u64) -> u64 {
        self.used_blocks
            .iter()
            .filter(|b| b.owner_pid == pid)
            .map(|b| (b.end - b.start) / FRAME_SIZE)
            .sum()
    }
}

static ALLOCATOR: Mutex<Option<Allocator>> = Mutex::new(None);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Kernel-owned pid used to tag reserved ranges and kernel allocations.
pub const KERNEL_PID: u64 = 0;

pub fn init(memory_regions: &'static MemoryRegions) {
    let mut lowest = u64::MAX;
    let mut highest = 0u64;
    for region in memory_regions.iter() {
        if region.kind == MemoryRegionKind::Usable {
            lowest = lowest.min(region.start);
            highest = highest.max(region.end);
        }
    }
    if lowest == u64::MAX {
        panic!("physical allocator: no usable memory regions reported");
    }
    let base_frame = lowest / FRAME_SIZE;
    let total_frames = ((highest - lowest) / FRAME_SIZE) as usize;
    let word_count = (total_frames + 63) / 64;

    let mut bitmap = Bitmap {
        bits: alloc::vec![0u64; word_count],
        total_frames,
        base_frame,
    };

    // Mark every frame used by default; usable regions are cleared below,
    // so BIOS/firmware-reserved gaps between usable regions stay allocated.
    for word in bitmap.bits.iter_mut() {
        *word = u64::MAX;
    }
    let mut free_frames = 0usize;
    for region in memory_regions.iter() {
        if region.kind == MemoryRegionKind::Usable {
            let start_frame = region.start / FRAME_SIZE;
            let end_frame = region.end / FRAME_SIZE;
            for frame in start_frame..end_frame {
                bitmap.set_used(frame, false);
                free_frames += 1;
            }
        }
    }

    let mut allocator = Allocator {
        bitmap,
        used_blocks: Vec::with_capacity((total_frames / 16).min(MAX_USED_BLOCKS)),
        free_frames,
    };

    // The bitmap's own backing storage is itself a reserved used block: it
    // lives on the heap before the heap exists, so we account for it as a
    // logical reservation at the kernel pid rather than a real range.
    allocator
        .record_block(KERNEL_PID, "frame bitmap", 0, 0)
        .expect("reserve bitmap block");

    *ALLOCATOR.lock() = Some(allocator);
    INITIALIZED.store(true, Ordering::SeqCst);

    log::info!(
        "physical allocator: {} frames total, {} free, base_frame={:#x}",
        total_frames, free_frames, base_frame
    );
}

/// Pre-allocate a reserved range (IVT/BDA, EBDA, video/ROM, kernel image,
/// paging data, non-available BIOS map entries) to the kernel pid.
pub fn reserve_range(start: u64, end: u64, desc: &str) -> Result<(), KernelError> {
    with_allocator(|a| a.reserve(start, end, KERNEL_PID, desc))
}

fn with_allocator<F, R>(f: F) -> Result<R, KernelError>
where
    F: FnOnce(&mut Allocator) -> Result<R, KernelError>,
{
    if !INITIALIZED.load(Ordering::SeqCst) {
        return Err(KernelError::NotInitialized);
    }
    if crate::interrupts::in_interrupt_context() {
        return Err(KernelError::InvalidArgument);
    }
    let mut guard = ALLOCATOR.lock();
    let allocator = guard.as_mut().ok_or(KernelError::NotInitialized)?;
    f(allocator)
}

pub fn alloc(size: u64, alignment: u64, owner_pid: u64, desc: &str) -> Result<u64, KernelError> {
    with_allocator(|a| a.alloc(size, alignment, owner_pid, desc))
}

pub fn free(phys_addr: u64) -> Result<(), KernelError> {
    with_allocator(|a| a.free(phys_addr))
}

pub fn owned_frames(pid: u64) -> u64 {
    with_allocator(|a| Ok(a.owned_frames(pid))).unwrap_or(0)
}

/// Total frames and free frames, for diagnostics.
pub fn stats() -> (usize, usize) {
    with_allocator(|a| Ok((a.bitmap.total_frames, a.free_frames))).unwrap_or((0, 0))
}

// --- x86_64 `FrameAllocator` bridge for the paging crate's `Mapper` API ---

use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

/// Adapts the block allocator to the `x86_64` crate's single-frame
/// `FrameAllocator` trait used by `Mapper::map_to`.
pub struct GlobalFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let phys = alloc(FRAME_SIZE, FRAME_SIZE, KERNEL_PID, "page table").ok()?;
        Some(PhysFrame::containing_address(PhysAddr::new(phys)))
    }
}

pub fn deallocate_frame(frame: PhysFrame) {
    let _ = free(frame.start_address().as_u64());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bitmap(total_frames: usize) -> Allocator {
        Allocator {
            bitmap: Bitmap {
                bits: alloc::vec![0u64; (total_frames + 63) / 64],
                total_frames,
                base_frame: 0,
            },
            used_blocks: Vec::new(),
            free_frames: total_frames,
        }
    }

    #[test_case]
    fn alloc_respects_alignment() {
        let mut a = test_bitmap(64);
        let p = a.alloc(4096, 0x10000, 1, "x").unwrap();
        assert_eq!(p % 0x10000, 0);
    }

    #[test_case]
    fn zero_size_is_invalid() {
        let mut a = test_bitmap(64);
        assert_eq!(a.alloc(0, 0, 1, "x"), Err(KernelError::InvalidArgument));
    }

    #[test_case]
    fn free_restores_frame_count() {
        let mut a = test_bitmap(64);
        let before = a.free_frames;
        let p = a.alloc(4096, 0, 1, "x").unwrap();
        assert_eq!(a.free_frames, before - 1);
        a.free(p).unwrap();
        assert_eq!(a.free_frames, before);
    }

    #[test_case]
    fn owned_frames_matches_used_block_sum() {
        let mut a = test_bitmap(64);
        a.alloc(4096 * 3, 0, 7, "x").unwrap();
        a.alloc(4096, 0, 7, "y").unwrap();
        assert_eq!(a.owned_frames(7), 4);
    }

    #[test_case]
    fn exhaustion_returns_nofree_equivalent() {
        let mut a = test_bitmap(2);
        assert!(a.alloc(4096 * 3, 0, 1, "x").is_err());
    }
}
