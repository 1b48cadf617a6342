//! Weighted priority + wait-time scheduler.
//!
//! Single CPU, preemptive, driven by the timer interrupt. The teacher's
//! round-robin `Scheduler` (ready queue + retire list for deferred Arc
//! drops) is generalized here to compute a priority-and-starvation-aware
//! weight per candidate instead of simple FIFO rotation.

use crate::error::KernelError;
use crate::task::context::perform_context_switch;
use crate::task::process::{CpuContext, Process, ProcessState, PRIORITY_LEVELS};
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

/// Weight multiplier applied to `(PRIORITY_LEVELS - priority)`.
const PRIORITY_RATIO: u64 = 3;

/// How many timer ticks make up one "timeslice counter" window, after which
/// `cpu_percent` is recomputed and every process's accumulator resets.
const CPU_PERCENT_TIMESLICES: u64 = 100;

/// Ticks granted per scheduling win before the timer ISR forces a reconsider.
pub const TIME_SLICE: u64 = 10;

/// Exit code surfaced to a killed process's blocker, per the `ERR_KILLED`
/// process-visible failure kind.
const KILLED_EXIT_CODE: i32 = -9;

struct Scheduler {
    processes: Vec<Box<Process>>,
    current: Option<u64>,
    kernel_pid: u64,
    exception_pid: u64,
    idle_pid: u64,
    total_sched_time: u64,
    window_ticks: u64,
    /// Deferred-drop queue: processes removed from `processes` land here so
    /// their `Box<Process>` (and its boxed I/O-bitmap/FPU-area buffers)
    /// never drops while interrupts are disabled inside the scheduler.
    retire_list: Vec<Box<Process>>,
}

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

fn weight(p: &Process, current_window: u64) -> Option<u64> {
    if !p.is_runnable() {
        return None;
    }
    if p.consumed_window == Some(current_window) {
        return Some(0);
    }
    let effective_priority = if p.state == ProcessState::IoReady {
        1
    } else {
        p.priority as u32
    };
    if effective_priority == 0 {
        return Some(u64::MAX);
    }
    if effective_priority as u64 == (PRIORITY_LEVELS - 1) as u64 {
        return Some(0);
    }
    Some((PRIORITY_LEVELS as u64 - effective_priority as u64) * PRIORITY_RATIO + p.wait_time)
}

impl Scheduler {
    fn pick_next(&mut self) -> Option<u64> {
        let now = crate::time::get_ticks();
        let current_window = now / TIME_SLICE;
        let mut best: Option<(usize, u64, u64)> = None; // (index, weight, wait_time)

        for (i, p) in self.processes.iter_mut().enumerate() {
            if p.state == ProcessState::Waiting {
                if let Some(until) = p.wait_until {
                    if now >= until {
                        p.set_ready();
                    }
                }
            }
            if p.pid == self.idle_pid {
                continue;
            }
            if let Some(w) = weight(p, current_window) {
                let better = match best {
                    None => true,
                    Some((_, bw, bwait)) => w > bw || (w == bw && p.wait_time > bwait),
                };
                if better {
                    best = Some((i, w, p.wait_time));
                }
            }
        }

        let winner_index = best.map(|(i, _, _)| i);
        if let Some(i) = winner_index {
            // Matches `Process::wait_time`'s doc comment: the winner's
            // wait_time resets so the weight formula's wait-time term
            // can't grow unbounded for a frequently-scheduled process.
            self.processes[i].wait_time = 0;
        }
        for (i, p) in self.processes.iter_mut().enumerate() {
            if winner_index != Some(i) && p.is_runnable() && p.pid != self.idle_pid {
                p.wait_time += 1;
            }
        }

        match winner_index {
            Some(i) => Some(self.processes[i].pid),
            None => Some(self.idle_pid),
        }
    }

    fn tick(&mut self) {
        self.total_sched_time += 1;
        self.window_ticks += 1;
        if self.window_ticks >= CPU_PERCENT_TIMESLICES {
            for p in self.processes.iter_mut() {
                p.cpu_percent = ((p.cpu_time * 100) / self.total_sched_time.max(1)) as u8;
                p.cpu_time = 0;
            }
            self.window_ticks = 0;
        }
        self.reap_finished();
    }

    fn reap_finished(&mut self) {
        let mut i = 0;
        while i < self.processes.len() {
            if self.processes[i].state == ProcessState::Finished {
                let p = self.processes.remove(i);
                self.retire_list.push(p);
            } else {
                i += 1;
            }
        }
    }

    fn process_mut(&mut self, pid: u64) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.pid == pid)
    }

    fn process(&self, pid: u64) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }
}

pub fn init(idle: Box<Process>, kernel_pid: u64, exception_pid: u64) {
    let idle_pid = idle.pid;
    let mut processes = Vec::with_capacity(128);
    processes.push(idle);
    *SCHEDULER.lock() = Some(Scheduler {
        processes,
        current: Some(idle_pid),
        kernel_pid,
        exception_pid,
        idle_pid,
        total_sched_time: 0,
        window_ticks: 0,
        retire_list: Vec::new(),
    });
    log::info!("scheduler initialized, idle pid={}", idle_pid);
}

fn with_sched<F, R>(f: F) -> R
where
    F: FnOnce(&mut Scheduler) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut().expect("scheduler not initialized");
        f(sched)
    })
}

pub fn spawn(process: Box<Process>) -> u64 {
    with_sched(|s| {
        let pid = process.pid;
        s.processes.push(process);
        if let Some(p) = s.process_mut(pid) {
            p.set_ready();
        }
        pid
    })
}

/// Return (old_pid, new_pid) if a switch is warranted.
pub fn schedule() -> Option<(u64, u64)> {
    with_sched(|s| {
        s.tick();
        let current_window = crate::time::get_ticks() / TIME_SLICE;
        if let Some(current) = s.current {
            if let Some(p) = s.process_mut(current) {
                if p.state == ProcessState::Running {
                    p.set_ready();
                    p.consumed_window = Some(current_window);
                }
            }
        }
        let next = s.pick_next()?;
        let old = s.current.unwrap_or(s.idle_pid);
        if next == old {
            return None;
        }
        s.current = Some(next);
        if let Some(p) = s.process_mut(next) {
            p.set_running();
        }
        Some((old, next))
    })
}

/// Carry out a switch decided by `schedule()`. Pulls raw pointers to both
/// processes' saved contexts out of the scheduler lock, then releases the
/// lock before jumping: `perform_context_switch` never returns to this call
/// site until `old_pid` is rescheduled, so the lock cannot stay held across
/// the jump.
///
/// Safe to call from the timer ISR: the jump resumes execution inside the
/// new thread's own last call to this same function (or, for a thread that
/// has never run, at its entry point via `perform_initial_switch`), so the
/// interrupted handler's stack frame is left exactly as-is and is unwound
/// normally via `iretq` once this pid is switched back to.
fn switch(old_pid: u64, new_pid: u64) {
    let contexts = with_sched(|s| {
        let old_ctx = s.process_mut(old_pid).map(|p| &mut p.context as *mut CpuContext);
        let new_ctx = s.process(new_pid).map(|p| &p.context as *const CpuContext);
        old_ctx.zip(new_ctx)
    });
    if let Some((old_ctx, new_ctx)) = contexts {
        crate::interrupts::on_context_switch(new_pid);
        unsafe {
            perform_context_switch(&mut *old_ctx, &*new_ctx);
        }
    }
}

/// Give the interrupt layer's lazy-FPU handler mutable access to a single
/// process's save area and `saved?` flag without exposing the process
/// table itself.
pub fn with_fpu_state<R>(pid: u64, f: impl FnOnce(&mut [u8; 512], &mut bool) -> R) -> Option<R> {
    with_sched(|s| {
        s.process_mut(pid)
            .map(|p| f(&mut **p.fpu_save_area, &mut p.fpu_saved))
    })
}

/// Run one scheduling decision and perform the switch if one is warranted.
/// Called once per timer tick, after PIC EOI has already been sent.
pub fn tick_and_switch(current_pid: u64) {
    account_tick(current_pid);
    if let Some((old, new)) = schedule() {
        switch(old, new);
    }
}

/// Force an immediate reschedule outside the normal tick cadence. Used by
/// fault handlers right after `terminate_current`: the faulting process is
/// `Finished` and must not execute another instruction.
pub fn reschedule_now() {
    if let Some((old, new)) = schedule() {
        switch(old, new);
    }
}

/// Voluntary `yield()` suspension point (§5): a direct reschedule without
/// waiting for the next timer tick. `schedule()` marks the yielding process
/// with the current timeslice window before picking a replacement, so it
/// cannot win again until a real timer tick rolls the window over — the
/// cooperative-yield throttle `consumed_window` exists for.
pub fn yield_now() {
    reschedule_now();
}

pub fn current_pid() -> Option<u64> {
    with_sched(|s| s.current)
}

/// The reserved pid device drivers use to own DMA allocations made at init
/// time, before any real process exists to attribute them to.
pub fn kernel_pid() -> u64 {
    with_sched(|s| s.kernel_pid)
}

pub fn wait(pid: u64, ms: u64) -> Result<(), KernelError> {
    with_sched(|s| {
        // 1 PIT tick == 1 ms at PIT_HZ == 1000, see time::timer.
        let target = crate::time::get_ticks() + ms;
        let p = s.process_mut(pid).ok_or(KernelError::NoSuchProcess)?;
        p.set_waiting(target);
        Ok(())
    })
}

pub fn block(pid: u64, wait_for_pid: u64) -> Result<(), KernelError> {
    with_sched(|s| {
        let p = s.process_mut(pid).ok_or(KernelError::NoSuchProcess)?;
        p.set_blocked(wait_for_pid);
        Ok(())
    })
}

/// ISR-safe wake path: `set_state(pid, IO_READY)`. Never blocks, never
/// allocates; only flips a state enum.
pub fn set_io_ready(pid: u64) {
    with_sched(|s| {
        if let Some(p) = s.process_mut(pid) {
            p.set_io_ready();
        }
    });
}

pub fn signal(pid: u64, n: u32) -> Result<(), KernelError> {
    with_sched(|s| {
        let p = s.process_mut(pid).ok_or(KernelError::NoSuchProcess)?;
        p.signal(n);
        Ok(())
    })
}

pub fn terminate(pid: u64, exit_code: i32) -> Result<(), KernelError> {
    with_sched(|s| {
        let parent_wakeup = {
            let p = s.process_mut(pid).ok_or(KernelError::NoSuchProcess)?;
            if p.descendent_thread_count.load(core::sync::atomic::Ordering::SeqCst) > 0 {
                return Err(KernelError::Busy);
            }
            p.finish(exit_code);
            p.parent_pid
        };
        if let Some(parent_pid) = parent_wakeup {
            if let Some(parent) = s.process_mut(parent_pid) {
                if parent.wait_for_pid == Some(pid) {
                    parent.wait_for_pid = None;
                    parent.blocking_exit_code = Some(exit_code);
                    parent.set_ready();
                }
            }
        }
        Ok(())
    })
}

pub fn kill(pid: u64, _force: bool) -> Result<(), KernelError> {
    with_sched(|s| {
        let current = s.current.unwrap_or(s.idle_pid);
        let p = s.process(pid).ok_or(KernelError::NoSuchProcess)?;
        if !p.is_killable(current, s.kernel_pid, s.exception_pid, s.idle_pid) {
            return Err(KernelError::Permission);
        }
        let victims: Vec<u64> = s
            .processes
            .iter()
            .filter(|c| c.parent_pid == Some(pid))
            .map(|c| c.pid)
            .collect();
        for child in victims {
            let _ = kill_locked(s, child);
        }
        kill_locked(s, pid)
    })
}

fn kill_locked(s: &mut Scheduler, pid: u64) -> Result<(), KernelError> {
    let p = s.process_mut(pid).ok_or(KernelError::NoSuchProcess)?;
    p.finish(KILLED_EXIT_CODE);
    Ok(())
}

/// Terminate the currently running process from fault context. Unlike
/// `kill`, this bypasses `is_killable`'s "not current" rule: a CPU
/// exception always terminates whatever was running when it fired.
pub fn terminate_current(exit_code: i32) {
    with_sched(|s| {
        if let Some(pid) = s.current {
            if let Some(p) = s.process_mut(pid) {
                p.finish(exit_code);
            }
        }
    });
}

/// True if `pid` is one of the three processes an unhandled exception can
/// never terminate (there is nothing left to fall back to).
pub fn is_kernel_critical(pid: u64) -> bool {
    with_sched(|s| pid == s.kernel_pid || pid == s.exception_pid || pid == s.idle_pid)
}

pub fn process_retire_list() {
    with_sched(|s| {
        s.retire_list.clear();
    });
}

/// Called by the timer ISR once per tick for the currently running pid.
pub fn account_tick(pid: u64) {
    with_sched(|s| {
        if let Some(p) = s.process_mut(pid) {
            p.cpu_time += 1;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::process::Privilege;

    #[test_case]
    fn idle_priority_has_zero_weight_unless_alone() {
        let p = Process::new_process("idle", Privilege::Supervisor, 7, 0, 0x1000, None);
        assert_eq!(weight(&p, 0), Some(0));
    }

    #[test_case]
    fn realtime_priority_has_infinite_weight() {
        let mut p = Process::new_process("rt", Privilege::Supervisor, 0, 0, 0x1000, None);
        p.set_ready();
        assert_eq!(weight(&p, 0), Some(u64::MAX));
    }

    #[test_case]
    fn io_ready_is_boosted_like_priority_one() {
        let mut normal = Process::new_process("a", Privilege::Supervisor, 2, 0, 0x1000, None);
        normal.set_ready();
        let mut io = Process::new_process("b", Privilege::Supervisor, 5, 0, 0x1000, None);
        io.state = ProcessState::IoReady;
        assert!(weight(&io, 0).unwrap() > weight(&normal, 0).unwrap());
    }

    #[test_case]
    fn tie_break_favors_longer_wait_time() {
        let mut a = Process::new_process("a", Privilege::Supervisor, 2, 0, 0x1000, None);
        let mut b = Process::new_process("b", Privilege::Supervisor, 2, 0, 0x1000, None);
        a.set_ready();
        b.set_ready();
        b.wait_time = 1;
        assert!(weight(&b, 0).unwrap() > weight(&a, 0).unwrap());
    }

    #[test_case]
    fn consumed_window_is_ineligible_until_window_rolls_over() {
        let mut p = Process::new_process("a", Privilege::Supervisor, 2, 0, 0x1000, None);
        p.set_ready();
        p.consumed_window = Some(5);
        assert_eq!(weight(&p, 5), Some(0));
        assert!(weight(&p, 6).unwrap() > 0);
    }

    /// Spec §8 scenario 2: equal-priority processes tied at wait_time 0
    /// rotate through the winner slot because `pick_next` resets the
    /// winner's `wait_time` to 0 on every selection (matching
    /// `Process::wait_time`'s doc comment) while every other runnable
    /// process's `wait_time` keeps climbing.
    #[test_case]
    fn pick_next_resets_winners_wait_time_so_ties_rotate() {
        let idle = Box::new(Process::new_process("idle", Privilege::Supervisor, 7, 0, 0x1000, None));
        let idle_pid = idle.pid;
        let mut sched = Scheduler {
            processes: Vec::new(),
            current: Some(idle_pid),
            kernel_pid: 0,
            exception_pid: 0,
            idle_pid,
            total_sched_time: 0,
            window_ticks: 0,
            retire_list: Vec::new(),
        };
        sched.processes.push(idle);

        let mut a = Process::new_process("a", Privilege::Supervisor, 2, 0, 0x1000, None);
        a.set_ready();
        let a_pid = a.pid;
        let mut b = Process::new_process("b", Privilege::Supervisor, 2, 0, 0x1000, None);
        b.set_ready();
        let b_pid = b.pid;
        sched.processes.push(Box::new(a));
        sched.processes.push(Box::new(b));

        let winner1 = sched.pick_next().unwrap();
        assert_eq!(winner1, a_pid, "first queued process wins the initial 0/0 tie");
        assert_eq!(sched.process(winner1).unwrap().wait_time, 0);
        assert_eq!(sched.process(b_pid).unwrap().wait_time, 1);

        let winner2 = sched.pick_next().unwrap();
        assert_eq!(winner2, b_pid, "b's higher wait_time should win the next round");
        assert_eq!(sched.process(winner2).unwrap().wait_time, 0);
        assert_eq!(sched.process(a_pid).unwrap().wait_time, 1);
    }
}
