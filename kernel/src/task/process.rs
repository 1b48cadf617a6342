//! Unified process/thread control block.
//!
//! The data model names one entity ("process", with a `type` field
//! distinguishing a full process from a thread that shares its parent's
//! directory) rather than two separate kernel objects, so the teacher's
//! previously-separate `Thread`/`Process` structs are folded into a single
//! `Process` here. The register-save mechanics (`CpuContext`, the asm
//! context switch in `task::context`) are unchanged from the teacher.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

pub fn allocate_pid() -> u64 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Ready,
    IoReady,
    Waiting,
    Sleeping,
    Stopped,
    Finished,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Normal,
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Supervisor,
    User,
}

/// Number of distinct scheduling priority levels; priority 0 is real-time,
/// `PRIORITY_LEVELS - 1` is the idle/background level.
pub const PRIORITY_LEVELS: u32 = 8;
pub const IDLE_PRIORITY: u8 = (PRIORITY_LEVELS - 1) as u8;
pub const KERNEL_PRIORITY: u8 = 1;
pub const EXCEPTION_PRIORITY: u8 = 0;

/// I/O-port permission bitmap: one bit per port (0 = allowed), plus the
/// mandatory trailing 0xFF byte the x86_64 TSS's `iomap_base` convention
/// requires to terminate the map within the TSS segment limit.
pub const IO_BITMAP_BYTES: usize = 65536 / 8 + 1;

/// Saved register state for a process, swapped in and out by the asm
/// routines in `task::context`. Field order and offsets are load-bearing:
/// `switch_context`/`switch_to_thread` address these by raw byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

impl CpuContext {
    pub fn new(entry_point: u64, stack_pointer: u64, privilege: Privilege) -> Self {
        let (rflags, cs, ss) = match privilege {
            // IF clear: kernel threads start with interrupts disabled and
            // the scheduler re-enables them once the thread is running.
            Privilege::Supervisor => (0x002u64, 0x08u64, 0x10u64),
            // IF set + the mandatory reserved bit 1.
            Privilege::User => (0x202u64, 0x33u64, 0x2bu64),
        };
        CpuContext {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: stack_pointer,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: entry_point,
            rflags,
            cs,
            ss,
        }
    }
}

/// `fxsave`/`fxrstor` legacy save area. The instruction faults on a
/// misaligned operand, so this wrapper forces 16-byte alignment that a bare
/// `[u8; 512]` (alignment 1) would not give a heap allocation.
#[repr(C, align(16))]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    pub fn zeroed() -> Box<Self> {
        Box::new(FpuState([0u8; 512]))
    }
}

impl core::ops::Deref for FpuState {
    type Target = [u8; 512];
    fn deref(&self) -> &[u8; 512] {
        &self.0
    }
}

impl core::ops::DerefMut for FpuState {
    fn deref_mut(&mut self) -> &mut [u8; 512] {
        &mut self.0
    }
}

pub struct Process {
    pub pid: u64,
    pub parent_pid: Option<u64>,
    pub name: String,
    pub state: ProcessState,
    pub kind: ProcessType,
    pub priority: u8,
    pub privilege: Privilege,

    pub context: CpuContext,
    pub kernel_stack_top: Option<u64>,
    pub user_stack_top: Option<u64>,
    pub user_stack_bottom: Option<u64>,
    pub super_stack_top: Option<u64>,

    /// This process's I/O-port permission bitmap, copied into the shared
    /// TSS's extended region on every context switch into this process.
    pub io_bitmap: Box<[u8; IO_BITMAP_BYTES]>,

    pub fpu_save_area: Box<FpuState>,
    pub fpu_saved: bool,

    pub signal_mask: u64,
    pub signal_stream: VecDeque<u32>,

    pub cpu_time: u64,
    pub cpu_percent: u8,
    /// Timeslice-counter window (`ticks / TIME_SLICE`) in which this process
    /// last gave up `Running`. While the scheduler's current window matches
    /// this value the process is ineligible (weight 0) for re-selection, so
    /// a cooperative yielder can't spin and monopolize the CPU before the
    /// next real timer tick rolls the window over.
    pub consumed_window: Option<u64>,

    pub wait_until: Option<u64>,
    pub wait_for_pid: Option<u64>,
    pub blocking_exit_code: Option<i32>,

    pub current_directory: String,
    pub env: Vec<(String, String)>,

    pub descendent_thread_count: AtomicU32,

    /// Running tally of wait_time used by the scheduler's weight formula;
    /// reset to 0 whenever this process wins a schedule.
    pub wait_time: u64,

    pub has_started: bool,
}

impl Process {
    pub fn new_process(
        name: &str,
        privilege: Privilege,
        priority: u8,
        entry_point: u64,
        kernel_stack_top: u64,
        user_stack_top: Option<u64>,
    ) -> Box<Process> {
        let pid = allocate_pid();
        let sp = user_stack_top.unwrap_or(kernel_stack_top);
        let context = CpuContext::new(entry_point, sp, privilege);
        Box::new(Process {
            pid,
            parent_pid: None,
            name: String::from(name),
            state: ProcessState::Stopped,
            kind: ProcessType::Normal,
            priority,
            privilege,
            context,
            kernel_stack_top: Some(kernel_stack_top),
            user_stack_top,
            user_stack_bottom: None,
            super_stack_top: Some(kernel_stack_top),
            io_bitmap: Box::new([0xffu8; IO_BITMAP_BYTES]),
            fpu_save_area: FpuState::zeroed(),
            fpu_saved: false,
            signal_mask: 0,
            signal_stream: VecDeque::with_capacity(16),
            cpu_time: 0,
            cpu_percent: 0,
            consumed_window: None,
            wait_until: None,
            wait_for_pid: None,
            blocking_exit_code: None,
            current_directory: String::from("/"),
            env: Vec::new(),
            descendent_thread_count: AtomicU32::new(0),
            wait_time: 0,
            has_started: false,
        })
    }

    /// `spawn(addr, name, argc, argv)`: a thread sharing the parent's
    /// directory/env/symbol table (the directory sharing itself is done by
    /// the caller via `paging::share_directory`; this just builds the
    /// control block).
    pub fn new_thread(
        parent: &Process,
        entry_point: u64,
        name: &str,
        kernel_stack_top: u64,
        user_stack_top: u64,
    ) -> Box<Process> {
        let pid = allocate_pid();
        let context = CpuContext::new(
            entry_point,
            user_stack_top,
            parent.privilege,
        );
        Box::new(Process {
            pid,
            parent_pid: Some(parent.pid),
            name: String::from(name),
            state: ProcessState::Stopped,
            kind: ProcessType::Thread,
            priority: parent.priority,
            privilege: parent.privilege,
            context,
            kernel_stack_top: Some(kernel_stack_top),
            user_stack_top: Some(user_stack_top),
            user_stack_bottom: None,
            super_stack_top: Some(kernel_stack_top),
            io_bitmap: Box::new([0xffu8; IO_BITMAP_BYTES]),
            fpu_save_area: FpuState::zeroed(),
            fpu_saved: false,
            signal_mask: 0,
            signal_stream: VecDeque::with_capacity(16),
            cpu_time: 0,
            cpu_percent: 0,
            consumed_window: None,
            wait_until: None,
            wait_for_pid: None,
            blocking_exit_code: None,
            current_directory: parent.current_directory.clone(),
            env: parent.env.clone(),
            descendent_thread_count: AtomicU32::new(0),
            wait_time: 0,
            has_started: false,
        })
    }

    pub fn is_runnable(&self) -> bool {
        matches!(
            self.state,
            ProcessState::Ready | ProcessState::Running | ProcessState::IoReady
        )
    }

    pub fn set_ready(&mut self) {
        if self.state != ProcessState::Finished && self.state != ProcessState::Zombie {
            self.state = ProcessState::Ready;
        }
    }

    pub fn set_running(&mut self) {
        self.state = ProcessState::Running;
    }

    pub fn set_waiting(&mut self, until_tick: u64) {
        self.wait_until = Some(until_tick);
        self.state = ProcessState::Waiting;
    }

    pub fn set_blocked(&mut self, wait_for_pid: u64) {
        self.wait_for_pid = Some(wait_for_pid);
        self.state = ProcessState::Sleeping;
    }

    pub fn set_io_ready(&mut self) {
        if self.state == ProcessState::Waiting || self.state == ProcessState::Sleeping {
            self.state = ProcessState::IoReady;
        }
    }

    pub fn finish(&mut self, exit_code: i32) {
        self.blocking_exit_code = Some(exit_code);
        self.state = ProcessState::Finished;
    }

    pub fn mark_zombie(&mut self) {
        self.state = ProcessState::Zombie;
    }

    /// Kernel pid, exception-thread pid and idle pid are never killable;
    /// neither is the currently-running process (it must exit voluntarily).
    pub fn is_killable(&self, current_pid: u64, kernel_pid: u64, exception_pid: u64, idle_pid: u64) -> bool {
        self.pid != kernel_pid
            && self.pid != exception_pid
            && self.pid != idle_pid
            && self.pid != current_pid
    }

    /// Append a signal to the stream if unmasked; otherwise apply
    /// default-terminate semantics immediately.
    pub fn signal(&mut self, n: u32) {
        if (self.signal_mask >> (n & 63)) & 1 != 0 {
            self.signal_stream.push_back(n);
        } else {
            self.finish(-(n as i32));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn signal_outside_mask_terminates() {
        let mut p = Process::new_process("t", Privilege::Supervisor, 4, 0, 0x1000, None);
        p.signal_mask = 0;
        p.signal(5);
        assert_eq!(p.state, ProcessState::Finished);
    }

    #[test_case]
    fn signal_inside_mask_queues() {
        let mut p = Process::new_process("t", Privilege::Supervisor, 4, 0, 0x1000, None);
        p.signal_mask = 1 << 5;
        p.signal(5);
        assert_eq!(p.signal_stream.len(), 1);
        assert_eq!(p.state, ProcessState::Stopped);
    }

    #[test_case]
    fn kernel_pid_is_not_killable() {
        let p = Process::new_process("k", Privilege::Supervisor, 1, 0, 0x1000, None);
        assert!(!p.is_killable(999, p.pid, 2, 3));
    }
}
