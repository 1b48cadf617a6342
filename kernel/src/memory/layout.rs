//! Canonical kernel virtual memory layout constants.
//!
//! Long mode, higher-half kernel. These are the fixed virtual-address
//! regions every page directory agrees on: the kernel's own mapping
//! (shared and GLOBAL-tagged across every process directory, see
//! `memory::paging`) and the MMIO window device drivers borrow from.

/// Upper-half kernel base. Every process directory maps the kernel's
/// PDPT/PD entries here with the GLOBAL bit set so a CR3 switch never
/// flushes kernel TLB entries.
pub const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

/// Higher-half direct map of all physical memory, established by the
/// bootloader and reused for `phys_to_virt`.
pub const HHDM_BASE: u64 = 0xffff_8080_0000_0000;

/// Start of the MMIO window. Device drivers borrow pages from this
/// region via `memory::map_mmio`; it never overlaps the heap or the
/// direct physical map.
pub const MMIO_BASE: u64 = 0xffff_9000_0000_0000;
