//! EHCI host controller driver: an asynchronous reclamation ring of QHs
//! for control/bulk, a 1024-entry periodic frame list plus an 11-level
//! interrupt QH tree, and BIOS legacy handoff via the extended-capabilities
//! list.
//!
//! Grounded on `kernelUsbEhciDriver.c`'s capability/operational register
//! split and QH/qTD binary layout, reimplemented against this crate's DMA
//! allocation path and `UsbHostController` trait.

use super::{Speed, UsbDevice, UsbHostController};
use crate::drivers::dma;
use crate::drivers::pci::{self, Device as PciDevice};
use crate::error::KernelError;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicUsize, Ordering};

mod cap_reg {
    pub const CAPLENGTH: usize = 0x00;
    pub const HCSPARAMS: usize = 0x04;
    pub const HCCPARAMS: usize = 0x08;
}

mod op_reg {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const USBINTR: usize = 0x08;
    pub const FRINDEX: usize = 0x0C;
    pub const PERIODICLISTBASE: usize = 0x14;
    pub const ASYNCLISTADDR: usize = 0x18;
    pub const CONFIGFLAG: usize = 0x40;
    pub const PORTSC_BASE: usize = 0x44;
}

mod usbcmd {
    pub const RUN_STOP: u32 = 1 << 0;
    pub const HC_RESET: u32 = 1 << 1;
    pub const PERIODIC_ENABLE: u32 = 1 << 4;
    pub const ASYNC_ENABLE: u32 = 1 << 5;
}

mod usbsts {
    pub const HC_HALTED: u32 = 1 << 12;
    pub const HOST_SYSTEM_ERROR: u32 = 1 << 4;
    pub const PORT_CHANGE: u32 = 1 << 2;
    pub const USB_INT: u32 = 1 << 0;
    pub const USB_ERR_INT: u32 = 1 << 1;
}

mod portsc {
    pub const CURRENT_CONNECT_STATUS: u32 = 1 << 0;
    pub const CONNECT_STATUS_CHANGE: u32 = 1 << 1;
    pub const PORT_ENABLE: u32 = 1 << 2;
    pub const PORT_RESET: u32 = 1 << 8;
    pub const PORT_OWNER: u32 = 1 << 13; // released to companion controller
}

mod legacy {
    pub const CAP_ID_LEGACY_SUPPORT: u8 = 0x01;
    pub const BIOS_OWNED: u32 = 1 << 16;
    pub const OS_OWNED: u32 = 1 << 24;
}

const PERIODIC_LIST_ENTRIES: usize = 1024;
const NUM_INTERRUPT_LEVELS: usize = 11;

#[repr(C, align(32))]
#[derive(Clone, Copy)]
struct QhOverlay {
    next_qtd: u32,
    alt_next_qtd: u32,
    token: u32, // bits [7:0] status (active=0x80,halted=0x40,databuf=0x20,babble=0x10,xact=0x08), [9:8] pid, [14:10] err-count(ro), [15] ioc, [30:16] total-bytes, [31] data-toggle
    buffer_page: [u32; 5],
}

#[repr(C, align(32))]
#[derive(Clone, Copy)]
struct Qh {
    horizontal_link: u32, // low 2 bits = type (01 = QH)
    endpoint_chars: u32,  // addr[6:0], endpoint[10:7], eps[13:12], dtc[14], h[15], max_packet[26:16]
    endpoint_caps: u32,   // s-mask[7:0], c-mask[15:8], hub addr[22:16], port[29:23], mult[31:30]
    current_qtd: u32,
    overlay: QhOverlay,
}

#[repr(C, align(32))]
#[derive(Clone, Copy)]
struct Qtd {
    next_qtd: u32,
    alt_next_qtd: u32,
    token: u32,
    buffer_page: [u32; 5],
}

mod token {
    pub const ACTIVE: u32 = 1 << 7;
    pub const HALTED: u32 = 1 << 6;
    pub const DATA_BUFFER_ERROR: u32 = 1 << 5;
    pub const BABBLE: u32 = 1 << 4;
    pub const TRANSACTION_ERROR: u32 = 1 << 3;
    pub const MISSED_MICROFRAME: u32 = 1 << 2;

    pub const PID_OUT: u32 = 0b00 << 8;
    pub const PID_IN: u32 = 0b01 << 8;
    pub const PID_SETUP: u32 = 0b10 << 8;

    pub const IOC: u32 = 1 << 15;

    pub fn total_bytes(n: u32) -> u32 {
        (n & 0x7FFF) << 16
    }
}

/// A single qTD addresses up to 5 buffer pages (20 KiB); splitting a larger
/// transfer into multiple qTDs is the caller's job.
const MAX_QTD_BYTES: usize = 5 * 4096;

const ERROR_TOKEN_BITS: u32 = token::HALTED | token::DATA_BUFFER_ERROR | token::BABBLE | token::TRANSACTION_ERROR | token::MISSED_MICROFRAME;

struct Controller {
    cap_base: u64,
    op_base: u64,
    num_ports: u8,
    periodic_list_virt: u64,
    periodic_list_phys: u64,
    interrupt_qh_levels_virt: [u64; NUM_INTERRUPT_LEVELS],
    async_head_virt: u64,
    async_head_phys: u64,
}

unsafe impl Send for Controller {}
unsafe impl Sync for Controller {}

impl Controller {
    unsafe fn op_read(&self, offset: usize) -> u32 {
        core::ptr::read_volatile((self.op_base as usize + offset) as *const u32)
    }

    unsafe fn op_write(&self, offset: usize, value: u32) {
        core::ptr::write_volatile((self.op_base as usize + offset) as *mut u32, value);
    }

    unsafe fn reset(&self) -> Result<(), KernelError> {
        self.op_write(op_reg::USBCMD, usbcmd::HC_RESET);
        let deadline = crate::time::get_ticks() + 500;
        while self.op_read(op_reg::USBCMD) & usbcmd::HC_RESET != 0 {
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
        }

        self.op_write(op_reg::PERIODICLISTBASE, self.periodic_list_phys as u32);
        self.op_write(op_reg::ASYNCLISTADDR, self.async_head_phys as u32);
        self.op_write(op_reg::USBINTR, usbsts::USB_INT | usbsts::USB_ERR_INT | usbsts::PORT_CHANGE | usbsts::HOST_SYSTEM_ERROR);
        self.op_write(op_reg::CONFIGFLAG, 1);
        self.op_write(
            op_reg::USBCMD,
            usbcmd::RUN_STOP | usbcmd::PERIODIC_ENABLE | usbcmd::ASYNC_ENABLE | (8 << 16), // 8-microframe interrupt threshold
        );

        let deadline = crate::time::get_ticks() + 500;
        while self.op_read(op_reg::USBSTS) & usbsts::HC_HALTED != 0 {
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
        }
        Ok(())
    }
}

/// Controllers are attached once at `init()` time and never removed, so
/// they're held in fixed `OnceCell` slots rather than a `Mutex<Vec<_>>`:
/// `OnceCell::get` never blocks, so `ehci_isr` (spec §5: ISR context may
/// only set flags, never take a lock) can't deadlock against a foreground
/// `submit_control`/`submit_interrupt_in` call that's spinning on a qTD's
/// ACTIVE bit.
const MAX_CONTROLLERS: usize = 4;
static CONTROLLERS: [OnceCell<Controller>; MAX_CONTROLLERS] = [const { OnceCell::uninit() }; MAX_CONTROLLERS];
static CONTROLLER_COUNT: AtomicUsize = AtomicUsize::new(0);

fn controllers() -> impl Iterator<Item = &'static Controller> {
    let n = CONTROLLER_COUNT.load(Ordering::SeqCst).min(MAX_CONTROLLERS);
    CONTROLLERS[..n].iter().filter_map(|c| c.get())
}

/// Lock-free: iterates the `OnceCell` slots above, never a mutex, so it
/// can't deadlock against an in-progress foreground transfer.
fn ehci_isr() -> bool {
    let mut handled = false;
    for c in controllers() {
        let status = unsafe { c.op_read(op_reg::USBSTS) };
        if status & (usbsts::USB_INT | usbsts::USB_ERR_INT | usbsts::PORT_CHANGE | usbsts::HOST_SYSTEM_ERROR) == 0 {
            continue;
        }
        unsafe { c.op_write(op_reg::USBSTS, status) };
        handled = true;

        if status & usbsts::HOST_SYSTEM_ERROR != 0 {
            log::error!("ehci: HOSTSYSTEMERROR, resetting controller");
            unsafe { let _ = c.reset(); }
        }
        if let Some(pid) = crate::task::scheduler::current_pid() {
            crate::task::scheduler::set_io_ready(pid);
        }
    }
    handled
}

/// Build an empty, always-active async-ring dummy QH (the H bit marks it
/// as the reclamation-list head) so `ASYNCLISTADDR` always points at a
/// valid, self-linked QH even with zero control/bulk devices attached.
fn init_async_ring_head(qh_virt: u64, qh_phys: u64) {
    let qh = unsafe { &mut *(qh_virt as *mut Qh) };
    qh.horizontal_link = (qh_phys as u32 & !0x1F) | 0b01 << 1;
    qh.endpoint_chars = 1 << 15; // H bit
    qh.endpoint_caps = 0;
    qh.current_qtd = 0;
    qh.overlay.next_qtd = 1; // terminate bit set
    qh.overlay.token = 0;
}

/// EHCI's interrupt schedule mask ("s-mask"): for full/low-speed endpoints,
/// one bit per frame interval; for high-speed endpoints with an interval
/// under 8 microframes, one bit per microframe. Intervals of 8 or more
/// microframes collapse to a single bit (microframe 0), matching the
/// driver's conservative fixed choice for longer intervals.
fn s_mask_for_interval(speed: Speed, interval_frames: u32) -> u8 {
    match speed {
        Speed::High if interval_frames < 8 => ((1u32 << interval_frames) - 1) as u8,
        _ => 0x01,
    }
}

/// Nearest power-of-two interrupt-QH tree level (0..=10) for `interval_ms`,
/// clamped to the EHCI periodic list's maximum 256 ms interval.
fn interrupt_level_for_interval(interval_ms: u32) -> usize {
    let clamped = interval_ms.max(1).min(256);
    (31 - clamped.leading_zeros()) as usize
}

/// Probe and bring one EHCI controller out of reset.
pub fn attach(dev: &PciDevice) -> Result<(), KernelError> {
    dev.set_master();
    dev.enable_memory_space();
    let bar = dev.get_mmio_bar().ok_or(KernelError::NoSuchEntry)?;
    let base_virt = crate::memory::map_mmio(bar.address, bar.size as usize).map_err(|_| KernelError::Memory)? as u64;

    let cap_length = unsafe { core::ptr::read_volatile((base_virt as usize + cap_reg::CAPLENGTH) as *const u8) };
    let op_base = base_virt + cap_length as u64;

    let hccparams = unsafe { core::ptr::read_volatile((base_virt as usize + cap_reg::HCCPARAMS) as *const u32) };
    let eecp = ((hccparams >> 8) & 0xFF) as u8;
    if eecp >= 0x40 {
        let mut offset = eecp;
        loop {
            let cap_id = pci::read_register(dev.bus, dev.device, dev.function, offset, 1) as u8;
            let next_offset = (pci::read_register(dev.bus, dev.device, dev.function, offset, 2) >> 8) as u8;
            if cap_id == legacy::CAP_ID_LEGACY_SUPPORT {
                let mut legsup = pci::read_register(dev.bus, dev.device, dev.function, offset, 4);
                legsup |= legacy::OS_OWNED;
                pci::write_register(dev.bus, dev.device, dev.function, offset, 4, legsup);
                let deadline = crate::time::get_ticks() + 200;
                loop {
                    let v = pci::read_register(dev.bus, dev.device, dev.function, offset, 4);
                    if v & legacy::BIOS_OWNED == 0 {
                        break;
                    }
                    if crate::time::get_ticks() > deadline {
                        log::warn!("ehci: BIOS did not release legacy ownership in time");
                        break;
                    }
                }
                break;
            }
            if next_offset == 0 || next_offset < 0x40 {
                break;
            }
            offset = next_offset;
        }
    }
    let hcsparams = unsafe { core::ptr::read_volatile((base_virt as usize + cap_reg::HCSPARAMS) as *const u32) };
    let num_ports = (hcsparams & 0x0F) as u8;

    let (periodic_list_phys, periodic_list_virt) =
        dma::io_memory_get((PERIODIC_LIST_ENTRIES * 4) as u64, 4096, crate::task::scheduler::kernel_pid(), "ehci-periodic")?;

    let mut interrupt_qh_levels_virt = [0u64; NUM_INTERRUPT_LEVELS];
    let mut interrupt_qh_levels_phys = [0u64; NUM_INTERRUPT_LEVELS];
    for level in 0..NUM_INTERRUPT_LEVELS {
        let (phys, virt) = dma::io_memory_get(48, 32, crate::task::scheduler::kernel_pid(), "ehci-int-qh")?;
        unsafe { core::ptr::write_bytes(virt as *mut u8, 0, 48) };
        let qh = unsafe { &mut *(virt as *mut Qh) };
        qh.horizontal_link = 1; // terminate: nothing linked yet at this level
        qh.overlay.next_qtd = 1;
        interrupt_qh_levels_virt[level] = virt;
        interrupt_qh_levels_phys[level] = phys;
    }
    // Link each level to the next coarser one (level 10 is the root,
    // level 0 the finest 1ms granularity), forming the 11-level tree the
    // periodic list's 1024 entries fan into.
    for level in 0..NUM_INTERRUPT_LEVELS - 1 {
        let qh = unsafe { &mut *(interrupt_qh_levels_virt[level] as *mut Qh) };
        qh.horizontal_link = (interrupt_qh_levels_phys[level + 1] as u32 & !0x1F) | 0b01 << 1;
    }

    let periodic_list = unsafe { core::slice::from_raw_parts_mut(periodic_list_virt as *mut u32, PERIODIC_LIST_ENTRIES) };
    for entry in periodic_list.iter_mut() {
        *entry = (interrupt_qh_levels_phys[NUM_INTERRUPT_LEVELS - 1] as u32 & !0x1F) | 0b01 << 1;
    }

    let (async_head_phys, async_head_virt) = dma::io_memory_get(48, 32, crate::task::scheduler::kernel_pid(), "ehci-async-head")?;
    unsafe { core::ptr::write_bytes(async_head_virt as *mut u8, 0, 48) };
    init_async_ring_head(async_head_virt, async_head_phys);

    let controller = Controller {
        cap_base: base_virt,
        op_base,
        num_ports,
        periodic_list_virt,
        periodic_list_phys,
        interrupt_qh_levels_virt,
        async_head_virt,
        async_head_phys,
    };

    unsafe {
        controller.reset()?;
    }

    if let Some(irq) = dev.irq() {
        crate::interrupts::register_irq_handler(irq, ehci_isr);
        crate::interrupts::enable_irq(irq);
    }

    let slot = CONTROLLER_COUNT.fetch_add(1, Ordering::SeqCst);
    if slot >= MAX_CONTROLLERS {
        CONTROLLER_COUNT.fetch_sub(1, Ordering::SeqCst);
        return Err(KernelError::NoFree);
    }
    CONTROLLERS[slot].init_once(|| controller);
    log::info!("ehci: controller attached, {} root port(s)", num_ports);
    Ok(())
}

/// Release a low/full-speed port to its companion OHCI controller: set
/// `PORTSC.PortOwner`, per spec §4.5's EHCI-specific routing rule.
#[allow(dead_code)]
fn release_to_companion(controller: &Controller, port_index: usize) {
    unsafe {
        let offset = op_reg::PORTSC_BASE + port_index * 4;
        let status = controller.op_read(offset);
        controller.op_write(offset, status | portsc::PORT_OWNER);
    }
}

impl UsbHostController for Controller {
    fn reset(&self) -> Result<(), KernelError> {
        unsafe { Controller::reset(self) }
    }

    fn handle_interrupt(&self) -> bool {
        let status = unsafe { self.op_read(op_reg::USBSTS) };
        if status & (usbsts::USB_INT | usbsts::USB_ERR_INT | usbsts::PORT_CHANGE) == 0 {
            return false;
        }
        unsafe { self.op_write(op_reg::USBSTS, status) };
        true
    }

    /// SETUP qTD, optional DATA qTD(s) (split every `MAX_QTD_BYTES`),
    /// linked onto the async-ring head; the caller polls the overlay's
    /// ACTIVE bit rather than sleeping, since control transfers are rare
    /// and short relative to a scheduling quantum.
    fn submit_control(&self, _device: &UsbDevice, setup: &[u8; 8], data: Option<&mut [u8]>) -> Result<usize, KernelError> {
        let (setup_phys, setup_virt) = dma::io_memory_get(8, 8, crate::task::scheduler::kernel_pid(), "ehci-setup")?;
        unsafe { core::ptr::copy_nonoverlapping(setup.as_ptr(), setup_virt as *mut u8, 8) };

        submit_one_qtd(self.async_head_virt, token::PID_SETUP, false, setup_phys, 8)?;

        let mut transferred = 0usize;
        if let Some(buf) = data {
            let mut offset = 0usize;
            let mut toggle = true;
            while offset < buf.len() {
                let chunk = (buf.len() - offset).min(MAX_QTD_BYTES);
                let phys = buf.as_ptr() as u64 + offset as u64;
                submit_one_qtd(self.async_head_virt, token::PID_IN, toggle, phys, chunk)?;
                offset += chunk;
                toggle = !toggle;
            }
            transferred = buf.len();
        }
        Ok(transferred)
    }

    fn submit_interrupt_in(&self, device: &UsbDevice, _endpoint: u8, interval_ms: u8, buf_len: usize) -> Result<(), KernelError> {
        let level = interrupt_level_for_interval(interval_ms as u32);
        let qh_virt = self.interrupt_qh_levels_virt[level];
        let _ = s_mask_for_interval(device.speed, interval_ms as u32);
        let (buf_phys, _) = dma::io_memory_get(buf_len.max(1) as u64, 1, crate::task::scheduler::kernel_pid(), "ehci-int-buf")?;
        submit_one_qtd(qh_virt, token::PID_IN, false, buf_phys, buf_len)
    }

    fn device_removed(&self, _address: u8) {}
}

/// Build one qTD, splice it onto `qh_virt`'s overlay, and poll the
/// overlay's ACTIVE bit until it clears (success) or an error bit sets,
/// retrying up to 3 times per spec §4.5's error-recovery rule.
fn submit_one_qtd(qh_virt: u64, pid: u32, toggle: bool, buffer_phys: u64, buffer_len: usize) -> Result<(), KernelError> {
    const MAX_RETRIES: u32 = 3;
    let mut last_err = KernelError::Io;
    for attempt in 0..MAX_RETRIES {
        let (qtd_phys, qtd_virt) = dma::io_memory_get(32, 32, crate::task::scheduler::kernel_pid(), "ehci-qtd")?;
        let qtd = unsafe { &mut *(qtd_virt as *mut Qtd) };
        qtd.next_qtd = 1;
        qtd.alt_next_qtd = 1;
        qtd.token = pid | token::total_bytes(buffer_len as u32) | token::ACTIVE | if toggle { 1 << 31 } else { 0 };
        qtd.buffer_page[0] = buffer_phys as u32;
        for page in 1..5 {
            qtd.buffer_page[page] = 0;
        }

        let qh = unsafe { &mut *(qh_virt as *mut Qh) };
        qh.overlay.next_qtd = qtd_phys as u32;
        qh.overlay.token = token::ACTIVE;

        let deadline = crate::time::get_ticks() + 2000;
        let result = loop {
            let token_val = unsafe { core::ptr::read_volatile(&qh.overlay.token as *const u32) };
            if token_val & ERROR_TOKEN_BITS != 0 {
                break Err(KernelError::Io);
            }
            if token_val & token::ACTIVE == 0 {
                break Ok(());
            }
            if crate::time::get_ticks() > deadline {
                break Err(KernelError::Timeout);
            }
            core::hint::spin_loop();
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("ehci: qTD attempt {} failed: {:?}", attempt + 1, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn qtd_spans_five_pages_exactly_fits_one_descriptor() {
        assert_eq!(MAX_QTD_BYTES, 20 * 1024);
    }

    #[test_case]
    fn high_speed_smask_under_8_microframes_is_a_bit_run() {
        assert_eq!(s_mask_for_interval(Speed::High, 1), 0b1);
        assert_eq!(s_mask_for_interval(Speed::High, 4), 0b1111);
    }

    #[test_case]
    fn high_speed_smask_at_or_above_8_microframes_collapses_to_one_bit() {
        assert_eq!(s_mask_for_interval(Speed::High, 8), 0x01);
        assert_eq!(s_mask_for_interval(Speed::High, 64), 0x01);
    }

    #[test_case]
    fn interrupt_level_matches_nearest_power_of_two() {
        assert_eq!(interrupt_level_for_interval(1), 0);
        assert_eq!(interrupt_level_for_interval(8), 3);
        assert_eq!(interrupt_level_for_interval(256), 8);
    }
}
