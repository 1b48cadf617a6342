//! Named signal numbers and the kernel-wide entry point for raising one.
//!
//! The per-process mask-and-queue mechanics live on `Process` itself
//! (`Process::signal`); this module is the thin, stable surface other
//! subsystems (drivers needing to wake a waiting process, the exception
//! dispatcher) call through rather than reaching into the scheduler
//! directly.

use crate::error::KernelError;
use crate::task::scheduler;

pub const SIGKILL: u32 = 9;
pub const SIGTERM: u32 = 15;
pub const SIGSEGV: u32 = 11;
pub const SIGCHLD: u32 = 17;
pub const SIGALRM: u32 = 14;

/// Raise signal `n` against `pid`. Queues it if the process has the signal
/// unmasked and listening, otherwise terminates the process with an exit
/// code derived from the signal number (default-terminate semantics).
pub fn raise(pid: u64, n: u32) -> Result<(), KernelError> {
    scheduler::signal(pid, n)
}
