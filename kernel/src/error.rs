//! The universal fallible-return type for this kernel.
//!
//! Every subsystem below (physical allocator, paging, scheduler, PCI, block
//! and USB drivers) returns `Result<T, KernelError>` rather than inventing
//! its own error type. Device-recoverable conditions are retried by the
//! owning driver before ever surfacing as `Err` (see `ERR_IO`/`ERR_TIMEOUT`);
//! programmer errors that indicate kernel corruption still panic.

use core::fmt;

/// Concrete enum behind the `ERR_*` taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Bad argument: out-of-range value, malformed descriptor, wrong width.
    InvalidArgument,
    /// Allocation failed for a reason other than exhaustion (alignment,
    /// overlapping reservation, interrupt-context allocation attempt).
    Memory,
    /// Resource exhausted: no free frames, no free used-block slots, no
    /// free command slots/TDs/QHs.
    NoFree,
    /// Lookup failed: no such page table entry, PCI device, process, or pid.
    NoSuchEntry,
    /// Removable media absent (ATAPI tray open, no disk).
    NoMedia,
    /// Device I/O error, exhausted its retry budget.
    Io,
    /// Device or bus did not respond within its allotted polling window.
    Timeout,
    /// Resource already locked/claimed by another owner.
    Busy,
    /// Address or size violates a required alignment.
    Align,
    /// Caller lacks permission for the requested operation.
    Permission,
    /// Address or index out of the valid range for its region.
    Bounds,
    /// Subsystem used before its `init()` ran.
    NotInitialized,
    /// Referenced process does not exist (already reaped, bad pid).
    NoSuchProcess,
    /// Target process was killed mid-operation.
    Killed,
}

impl KernelError {
    /// Short identifier matching the `ERR_*` name this variant implements.
    pub const fn name(self) -> &'static str {
        match self {
            KernelError::InvalidArgument => "ERR_INVALID",
            KernelError::Memory => "ERR_MEMORY",
            KernelError::NoFree => "ERR_NOFREE",
            KernelError::NoSuchEntry => "ERR_NOSUCHENTRY",
            KernelError::NoMedia => "ERR_NOMEDIA",
            KernelError::Io => "ERR_IO",
            KernelError::Timeout => "ERR_TIMEOUT",
            KernelError::Busy => "ERR_BUSY",
            KernelError::Align => "ERR_ALIGN",
            KernelError::Permission => "ERR_PERMISSION",
            KernelError::Bounds => "ERR_BOUNDS",
            KernelError::NotInitialized => "ERR_NOTINITIALIZED",
            KernelError::NoSuchProcess => "ERR_NOSUCHPROCESS",
            KernelError::Killed => "ERR_KILLED",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn name_matches_err_prefix() {
        assert_eq!(KernelError::NoFree.name(), "ERR_NOFREE");
        assert_eq!(KernelError::Killed.name(), "ERR_KILLED");
    }
}
