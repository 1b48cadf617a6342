//! `io_memory_get(size, alignment)`: the DMA-memory acquisition path every
//! device driver in this module uses to get a `(physical, virtual)` pair
//! suitable for bus-master/command-list/descriptor-ring memory.
//!
//! Backed by `memory::physical::alloc` for the frames and `memory::map_mmio`
//! for the virtual alias; the alias is mapped `NO_CACHE | WRITE_THROUGH` so
//! a driver never has to reason about a DMA engine racing the CPU's cache.

use crate::error::KernelError;
use crate::memory::physical;

/// Acquire `size` bytes of physically-contiguous, cache-disabled memory
/// aligned to `alignment` (0 meaning "frame-aligned is enough").
///
/// Returns `(phys_addr, virt_addr)`. The mapping is never torn down: driver
/// DMA regions are allocated once at probe time and live for the lifetime
/// of the controller, matching every driver in this module.
pub fn io_memory_get(size: u64, alignment: u64, owner_pid: u64, desc: &str) -> Result<(u64, u64), KernelError> {
    let phys = physical::alloc(size, alignment, owner_pid, desc)?;
    let virt = crate::memory::map_mmio(phys, size as usize).map_err(|_| KernelError::Memory)?;
    Ok((phys, virt as u64))
}

#[cfg(test)]
mod tests {
    // `io_memory_get` touches the global physical allocator and the MMIO
    // bump allocator, both of which require a booted kernel; exercised by
    // the AHCI/ATA/OHCI/EHCI probe-time boot path instead of a host-side
    // unit test here.
}
