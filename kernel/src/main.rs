#![no_std]
#![no_main]

use bootloader_api::BootInfo;
use kernel::task::process::{Privilege, Process};
use kernel::task::{context, process, scheduler};
use kernel::{drivers, gdt, hlt_loop, interrupts, logger, memory, serial, time};

bootloader_api::entry_point!(kernel_main);

const IDLE_STACK_SIZE: usize = 64 * 1024;
static mut IDLE_STACK: [u8; IDLE_STACK_SIZE] = [0; IDLE_STACK_SIZE];

/// Every kernel thread's `CpuContext` starts with IF clear (see
/// `CpuContext::new`) so the register-restore half of a context switch
/// can't be interrupted mid-flight; the thread re-enables interrupts
/// itself as its first action once fully resumed.
extern "C" fn idle_entry() -> ! {
    x86_64::instructions::interrupts::enable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Deliberate-fault scenarios selected by the `test_*` Cargo features.
/// Each one runs as its own low-priority process (never inline in idle or
/// kernel context, since `fault_current_process` treats a fault hitting
/// those as unrecoverable) so the resulting `#GP`/`#UD`/`#DE`/page fault is
/// routed through the normal exception handlers, which kill the faulting
/// process and resume the scheduler instead of halting the machine.
#[cfg(any(
    feature = "test_divide_by_zero",
    feature = "test_invalid_opcode",
    feature = "test_page_fault",
    feature = "test_all_exceptions"
))]
mod fault_scenarios {
    const STACK_SIZE: usize = 16 * 1024;

    #[cfg(any(feature = "test_divide_by_zero", feature = "test_all_exceptions"))]
    static mut DIV0_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
    #[cfg(any(feature = "test_invalid_opcode", feature = "test_all_exceptions"))]
    static mut UD_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
    #[cfg(any(feature = "test_page_fault", feature = "test_all_exceptions"))]
    static mut PF_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

    #[cfg(any(feature = "test_divide_by_zero", feature = "test_all_exceptions"))]
    pub extern "C" fn divide_by_zero_entry() -> ! {
        log::info!("fault scenario: divide_by_zero");
        let zero = core::hint::black_box(0u64);
        let _ = 1u64 / zero;
        unreachable!("divide error did not fault");
    }

    #[cfg(any(feature = "test_invalid_opcode", feature = "test_all_exceptions"))]
    pub extern "C" fn invalid_opcode_entry() -> ! {
        log::info!("fault scenario: invalid_opcode");
        unsafe { core::arch::asm!("ud2") };
        unreachable!("invalid opcode did not fault");
    }

    #[cfg(any(feature = "test_page_fault", feature = "test_all_exceptions"))]
    pub extern "C" fn page_fault_entry() -> ! {
        log::info!("fault scenario: page_fault");
        let bad = 0xdead_0000_0000u64 as *mut u8;
        unsafe { core::ptr::write_volatile(bad, 0) };
        unreachable!("page fault did not fault");
    }

    #[cfg(any(feature = "test_divide_by_zero", feature = "test_all_exceptions"))]
    pub fn div0_stack_top() -> u64 {
        core::ptr::addr_of_mut!(DIV0_STACK) as u64 + STACK_SIZE as u64
    }
    #[cfg(any(feature = "test_invalid_opcode", feature = "test_all_exceptions"))]
    pub fn ud_stack_top() -> u64 {
        core::ptr::addr_of_mut!(UD_STACK) as u64 + STACK_SIZE as u64
    }
    #[cfg(any(feature = "test_page_fault", feature = "test_all_exceptions"))]
    pub fn pf_stack_top() -> u64 {
        core::ptr::addr_of_mut!(PF_STACK) as u64 + STACK_SIZE as u64
    }
}

/// Spawns the processes selected by the crate's `test_*` features. A no-op
/// build when none of them are enabled.
#[allow(unused_variables)]
fn spawn_fault_scenarios() {
    #[cfg(any(feature = "test_divide_by_zero", feature = "test_all_exceptions"))]
    {
        let mut p = Process::new_process(
            "test-div0",
            Privilege::Supervisor,
            process::IDLE_PRIORITY - 1,
            fault_scenarios::divide_by_zero_entry as u64,
            fault_scenarios::div0_stack_top(),
            None,
        );
        p.set_ready();
        scheduler::spawn(p);
    }
    #[cfg(any(feature = "test_invalid_opcode", feature = "test_all_exceptions"))]
    {
        let mut p = Process::new_process(
            "test-ud",
            Privilege::Supervisor,
            process::IDLE_PRIORITY - 1,
            fault_scenarios::invalid_opcode_entry as u64,
            fault_scenarios::ud_stack_top(),
            None,
        );
        p.set_ready();
        scheduler::spawn(p);
    }
    #[cfg(any(feature = "test_page_fault", feature = "test_all_exceptions"))]
    {
        let mut p = Process::new_process(
            "test-pf",
            Privilege::Supervisor,
            process::IDLE_PRIORITY - 1,
            fault_scenarios::page_fault_entry as u64,
            fault_scenarios::pf_stack_top(),
            None,
        );
        p.set_ready();
        scheduler::spawn(p);
    }
}

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    logger::init();
    log::info!("booting");

    gdt::init();

    let physical_memory_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not provide a physical memory offset");
    memory::init(
        x86_64::VirtAddr::new(physical_memory_offset),
        &boot_info.memory_regions,
    );

    time::init();

    let idle_stack_top = unsafe { core::ptr::addr_of!(IDLE_STACK) as u64 + IDLE_STACK_SIZE as u64 };
    let mut idle = Process::new_process(
        "idle",
        Privilege::Supervisor,
        process::IDLE_PRIORITY,
        idle_entry as u64,
        idle_stack_top,
        None,
    );
    idle.set_ready();
    idle.set_running();

    let kernel_pid = process::allocate_pid();
    let exception_pid = process::allocate_pid();
    let idle_context = idle.context;
    scheduler::init(idle, kernel_pid, exception_pid);

    spawn_fault_scenarios();

    interrupts::init();

    let device_count = drivers::init();
    log::info!("found {} PCI device(s)", device_count);

    log::info!("entering idle loop");
    unsafe {
        context::perform_initial_switch(&idle_context);
    }
}

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    hlt_loop();
}
