//! AHCI (SATA) driver: command-list-based, 32 command slots per port,
//! PRD tables shared across slots.
//!
//! Grounded on `kernelSataAhciDriver.c`/`.h` (the original HBA register
//! layout, port start/stop sequence and signature-based device detection)
//! reimplemented against `x86_64` MMIO, the crate's `BlockDevice` contract
//! and the shared [`crate::drivers::dma::io_memory_get`] allocation path
//! instead of a cache-maintenance-heavy identity-mapped layout.

use crate::block::{BlockDevice, BlockError};
use crate::drivers::dma;
use crate::drivers::pci::{self, storage_prog_if, DeviceClass};
use crate::error::KernelError;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

const MAX_PORTS: usize = 32;
const MAX_SLOTS: usize = 32;
const MAX_PRDS_PER_CMD: usize = 8;

mod hba_reg {
    pub const CAP: usize = 0x00;
    pub const GHC: usize = 0x04;
    pub const IS: usize = 0x08;
    pub const PI: usize = 0x0C;
    pub const PORT_BASE: usize = 0x100;
    pub const PORT_STRIDE: usize = 0x80;
}

mod ghc {
    pub const HBA_RESET: u32 = 1 << 0;
    pub const INTERRUPT_ENABLE: u32 = 1 << 1;
    pub const AHCI_ENABLE: u32 = 1 << 31;
}

mod port_reg {
    pub const CLB: usize = 0x00;
    pub const CLBU: usize = 0x04;
    pub const FB: usize = 0x08;
    pub const FBU: usize = 0x0C;
    pub const IS: usize = 0x10;
    pub const IE: usize = 0x14;
    pub const CMD: usize = 0x18;
    pub const TFD: usize = 0x20;
    pub const SIG: usize = 0x24;
    pub const SSTS: usize = 0x28;
    pub const SERR: usize = 0x30;
    pub const SACT: usize = 0x34;
    pub const CI: usize = 0x38;
}

mod pxcmd {
    pub const ST: u32 = 1 << 0;
    pub const FRE: u32 = 1 << 4;
    pub const FR: u32 = 1 << 14;
    pub const CR: u32 = 1 << 15;
    pub const CLO: u32 = 1 << 3;
    pub const SSS: u32 = 1 << 1; // spin-up device
    pub const POD: u32 = 1 << 2; // power on device
}

mod pxis {
    pub const TFES: u32 = 1 << 30;
    pub const HBFS: u32 = 1 << 29;
    pub const HBDS: u32 = 1 << 28;
    pub const IFS: u32 = 1 << 27;
    pub const DHRS: u32 = 1 << 0;
    pub const PSS: u32 = 1 << 1;
}

const PXIE_ALL: u32 = 0xFFFF_FFFF;

const SIG_ATA: u32 = 0x0000_0101;
const SIG_ATAPI: u32 = 0xEB14_0101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortDeviceKind {
    None,
    Sata,
    Satapi,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct CommandHeader {
    flags: u16, // CFL(5) | A(1) | W(1) | P(1) | R(1) | B(1) | C(1) : PMP(4)
    prdtl: u16,
    prdbc: u32,
    ctba: u32,
    ctbau: u32,
    reserved: [u32; 4],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Prd {
    dba: u32,
    dbau: u32,
    reserved: u32,
    dbc_i: u32, // bits 21:0 byte count - 1, bit 31 interrupt-on-completion
}

#[repr(C)]
struct CommandTable {
    cfis: [u8; 64],
    acmd: [u8; 16],
    reserved: [u8; 48],
    prdt: [Prd; MAX_PRDS_PER_CMD],
}

/// One AHCI port, its command list, FIS receive area and one command table
/// per slot, all allocated once at probe time via [`dma::io_memory_get`].
struct Port {
    port_index: usize,
    mmio_base: u64,
    kind: PortDeviceKind,
    cmd_list_virt: u64,
    fis_virt: u64,
    cmd_tables_virt: u64,
    cmd_tables_phys: u64,
    slot_in_use: AtomicU32,
    num_sectors: u64,
}

impl Port {
    fn reg(&self, offset: usize) -> *mut u32 {
        (self.mmio_base as usize + offset) as *mut u32
    }

    unsafe fn read(&self, offset: usize) -> u32 {
        core::ptr::read_volatile(self.reg(offset))
    }

    unsafe fn write(&self, offset: usize, value: u32) {
        core::ptr::write_volatile(self.reg(offset), value);
    }

    fn command_header(&self, slot: usize) -> *mut CommandHeader {
        (self.cmd_list_virt as usize + slot * core::mem::size_of::<CommandHeader>()) as *mut CommandHeader
    }

    fn command_table(&self, slot: usize) -> *mut CommandTable {
        (self.cmd_tables_virt as usize + slot * core::mem::size_of::<CommandTable>()) as *mut CommandTable
    }

    /// Port startup per spec §4.4: spin up (SSS), clear PxSERR, enable all
    /// interrupt sources, set FRE before ST, then confirm the device isn't
    /// stuck BSY/DRQ.
    unsafe fn start(&self) -> Result<(), KernelError> {
        let mut cmd = self.read(port_reg::CMD);
        cmd |= pxcmd::POD | pxcmd::SSS;
        self.write(port_reg::CMD, cmd);

        self.write(port_reg::SERR, 0xFFFF_FFFF);
        self.write(port_reg::IE, PXIE_ALL);

        let mut cmd = self.read(port_reg::CMD);
        cmd |= pxcmd::FRE;
        self.write(port_reg::CMD, cmd);

        let deadline = crate::time::get_ticks() + 500;
        while self.read(port_reg::CMD) & pxcmd::CR != 0 {
            if crate::time::get_ticks() > deadline {
                break;
            }
        }

        let mut cmd = self.read(port_reg::CMD);
        cmd |= pxcmd::ST;
        self.write(port_reg::CMD, cmd);

        let tfd = self.read(port_reg::TFD);
        if tfd & 0x88 != 0 {
            log::warn!("ahci: port {} stuck BSY/DRQ after start ({:#x})", self.port_index, tfd);
        }
        Ok(())
    }

    unsafe fn stop(&self) {
        let mut cmd = self.read(port_reg::CMD);
        cmd &= !(pxcmd::ST | pxcmd::FRE);
        self.write(port_reg::CMD, cmd);

        let deadline = crate::time::get_ticks() + 500;
        while self.read(port_reg::CMD) & (pxcmd::FR | pxcmd::CR) != 0 {
            if crate::time::get_ticks() > deadline {
                break;
            }
        }
    }

    fn detect_kind(&self) -> PortDeviceKind {
        let ssts = unsafe { self.read(port_reg::SSTS) };
        let det = ssts & 0x0F;
        if det != 3 {
            return PortDeviceKind::None;
        }
        match unsafe { self.read(port_reg::SIG) } {
            SIG_ATA => PortDeviceKind::Sata,
            SIG_ATAPI => PortDeviceKind::Satapi,
            _ => PortDeviceKind::None,
        }
    }

    fn alloc_slot(&self) -> Option<usize> {
        loop {
            let current = self.slot_in_use.load(Ordering::Acquire);
            for slot in 0..MAX_SLOTS {
                if current & (1 << slot) == 0 {
                    let updated = current | (1 << slot);
                    if self
                        .slot_in_use
                        .compare_exchange(current, updated, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Some(slot);
                    }
                    break;
                }
            }
            if current == u32::MAX {
                return None;
            }
        }
    }

    fn free_slot(&self, slot: usize) {
        self.slot_in_use.fetch_and(!(1 << slot), Ordering::AcqRel);
    }

    /// Issue a 48-bit LBA READ/WRITE DMA command in slot, waiting for
    /// completion by polling PxCI (interrupt-chained wake happens via
    /// PxIS but a busy controller is polled here to bound latency).
    unsafe fn issue_rw(&self, slot: usize, lba: u64, count: u16, buf_phys: u64, buf_len: usize, write: bool) -> Result<(), KernelError> {
        let header = &mut *self.command_header(slot);
        header.flags = (5 /* CFL: FIS words */) | if write { 1 << 6 } else { 0 };
        let table = &mut *self.command_table(slot);
        let num_prds = fill_prdt(&mut table.prdt, buf_phys, buf_len)?;
        header.prdtl = num_prds as u16;
        header.prdbc = 0;

        let cfis = &mut table.cfis;
        cfis[0] = 0x27; // Register FIS - host to device
        cfis[1] = 0x80; // command bit
        cfis[2] = if write { 0x35 } else { 0x25 }; // WRITE/READ DMA EXT
        cfis[4] = (lba & 0xFF) as u8;
        cfis[5] = ((lba >> 8) & 0xFF) as u8;
        cfis[6] = ((lba >> 16) & 0xFF) as u8;
        cfis[7] = 0x40; // LBA mode
        cfis[8] = ((lba >> 24) & 0xFF) as u8;
        cfis[9] = ((lba >> 32) & 0xFF) as u8;
        cfis[10] = ((lba >> 40) & 0xFF) as u8;
        cfis[12] = (count & 0xFF) as u8;
        cfis[13] = ((count >> 8) & 0xFF) as u8;

        let deadline = crate::time::get_ticks() + 1000;
        while self.read(port_reg::TFD) & 0x88 != 0 {
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
        }

        self.write(port_reg::CI, 1 << slot);

        let deadline = crate::time::get_ticks() + 5000;
        loop {
            let is = self.read(port_reg::IS);
            if is & (pxis::TFES | pxis::HBFS | pxis::HBDS | pxis::IFS) != 0 {
                self.write(port_reg::IS, is);
                return Err(KernelError::Io);
            }
            if self.read(port_reg::CI) & (1 << slot) == 0 {
                self.write(port_reg::IS, is);
                return Ok(());
            }
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
            core::hint::spin_loop();
        }
    }

    /// IDENTIFY DEVICE through slot 0, parsing the 256-word response for
    /// 28-bit/48-bit sector counts the same way the PATA driver does.
    unsafe fn identify(&self) -> Result<u64, KernelError> {
        let slot = 0usize;
        let (scratch_phys, scratch_virt) = dma::io_memory_get(512, 512, crate::task::scheduler::kernel_pid(), "ahci-identify")?;

        let header = &mut *self.command_header(slot);
        header.flags = 5;
        let table = &mut *self.command_table(slot);
        table.prdt[0] = Prd { dba: scratch_phys as u32, dbau: (scratch_phys >> 32) as u32, reserved: 0, dbc_i: 511 };
        header.prdtl = 1;
        header.prdbc = 0;

        let cfis = &mut table.cfis;
        cfis.iter_mut().for_each(|b| *b = 0);
        cfis[0] = 0x27;
        cfis[1] = 0x80;
        cfis[2] = 0xEC; // IDENTIFY DEVICE

        let deadline = crate::time::get_ticks() + 1000;
        while self.read(port_reg::TFD) & 0x88 != 0 {
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
        }
        self.write(port_reg::CI, 1 << slot);

        let deadline = crate::time::get_ticks() + 1000;
        while self.read(port_reg::CI) & (1 << slot) != 0 {
            if crate::time::get_ticks() > deadline {
                return Err(KernelError::Timeout);
            }
        }

        let words = core::slice::from_raw_parts(scratch_virt as *const u16, 256);
        let lba48 = words[83] & (1 << 10) != 0;
        let sectors_28 = (words[60] as u64) | ((words[61] as u64) << 16);
        let sectors_48 = (words[100] as u64) | ((words[101] as u64) << 16) | ((words[102] as u64) << 32) | ((words[103] as u64) << 48);
        Ok(if lba48 { sectors_48 } else { sectors_28 })
    }

    /// TFES/HBFS/HBDS/IFS recovery: clear PxCMD.ST, CLO to clear BSY/DRQ,
    /// restart the port, and let the caller retry the command.
    unsafe fn recover(&self) {
        let mut cmd = self.read(port_reg::CMD);
        cmd &= !pxcmd::ST;
        self.write(port_reg::CMD, cmd);
        let deadline = crate::time::get_ticks() + 500;
        while self.read(port_reg::CMD) & pxcmd::CR != 0 {
            if crate::time::get_ticks() > deadline {
                break;
            }
        }
        let mut cmd = self.read(port_reg::CMD);
        cmd |= pxcmd::CLO;
        self.write(port_reg::CMD, cmd);
        let deadline = crate::time::get_ticks() + 500;
        while self.read(port_reg::CMD) & pxcmd::CLO != 0 {
            if crate::time::get_ticks() > deadline {
                break;
            }
        }
        cmd = self.read(port_reg::CMD);
        cmd |= pxcmd::ST;
        self.write(port_reg::CMD, cmd);
    }
}

/// Each PRDT entry's byte count is a 22-bit "count - 1" field that must be
/// even; a single entry can span up to 4 MiB, far more than the IDE
/// bus-master 64 KiB-boundary rule, so this just caps chunk size.
const MAX_PRD_BYTES: usize = 4 * 1024 * 1024;

fn fill_prdt(prdt: &mut [Prd; MAX_PRDS_PER_CMD], phys_addr: u64, total_bytes: usize) -> Result<usize, KernelError> {
    let mut offset = 0usize;
    let mut index = 0usize;
    while offset < total_bytes {
        if index >= MAX_PRDS_PER_CMD {
            return Err(KernelError::NoFree);
        }
        let remaining = total_bytes - offset;
        let chunk = remaining.min(MAX_PRD_BYTES) & !1; // even byte count
        let chunk = if chunk == 0 { remaining } else { chunk };
        let addr = phys_addr + offset as u64;
        prdt[index] = Prd {
            dba: addr as u32,
            dbau: (addr >> 32) as u32,
            reserved: 0,
            dbc_i: (chunk as u32 - 1) & 0x3F_FFFF,
        };
        offset += chunk;
        index += 1;
    }
    Ok(index.max(1))
}

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

static PORTS: Mutex<Vec<Port>> = Mutex::new(Vec::new());

/// MMIO base per port, mirrored from `Port::mmio_base` at init time so
/// `ahci_isr` (spec §5: ISR context may only set flags, never take a lock)
/// never has to contend with `rw_sectors` holding `PORTS.lock()` across
/// `issue_rw`'s completion poll. 0 until `init()` populates a given slot.
static PORT_MMIO_BASE: [AtomicU64; MAX_PORTS] = [const { AtomicU64::new(0) }; MAX_PORTS];
static PORT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Lock-free: reads only `PORT_MMIO_BASE`/`PORT_COUNT`, never `PORTS`, so it
/// can't deadlock against `rw_sectors` spinning on a command's completion
/// with that mutex held.
fn ahci_isr() -> bool {
    let count = PORT_COUNT.load(Ordering::SeqCst);
    let mut handled = false;
    for i in 0..count {
        let mmio_base = PORT_MMIO_BASE[i].load(Ordering::SeqCst);
        if mmio_base == 0 {
            continue;
        }
        let is_reg = (mmio_base as usize + port_reg::IS) as *mut u32;
        let is = unsafe { core::ptr::read_volatile(is_reg) };
        if is != 0 {
            unsafe { core::ptr::write_volatile(is_reg, is) };
            if let Some(pid) = crate::task::scheduler::current_pid() {
                crate::task::scheduler::set_io_ready(pid);
            }
            handled = true;
        }
    }
    handled
}

const MAX_RETRIES: u32 = 3;

fn rw_sectors(port_index: usize, lba: u64, count: u16, buf: &mut [u8], write: bool) -> Result<(), KernelError> {
    let ports = PORTS.lock();
    let port = ports.get(port_index).ok_or(KernelError::NoSuchEntry)?;
    let slot = port.alloc_slot().ok_or(KernelError::Busy)?;

    let bytes = buf.len();
    let (scratch_phys, scratch_virt) =
        dma::io_memory_get(bytes.max(4096) as u64, 4096, crate::task::scheduler::kernel_pid(), "ahci-xfer")?;

    if write {
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), scratch_virt as *mut u8, bytes) };
    }

    let mut last_err = KernelError::Io;
    let mut ok = false;
    for attempt in 0..MAX_RETRIES {
        let result = unsafe { port.issue_rw(slot, lba, count, scratch_phys, bytes, write) };
        match result {
            Ok(()) => {
                ok = true;
                break;
            }
            Err(e) => {
                log::warn!("ahci: port {} attempt {} failed: {:?}", port_index, attempt + 1, e);
                last_err = e;
                unsafe { port.recover() };
            }
        }
    }

    port.free_slot(slot);

    if ok {
        if !write {
            unsafe { core::ptr::copy_nonoverlapping(scratch_virt as *const u8, buf.as_mut_ptr(), bytes) };
        }
        Ok(())
    } else {
        Err(last_err)
    }
}

/// Probe every SATA AHCI controller on the bus, bring the HBA out of reset,
/// and start each occupied port.
pub fn init() -> usize {
    let devices = pci::find_by_class(DeviceClass::MassStorage, 0x06, storage_prog_if::SATA_AHCI);
    let mut ports = Vec::new();

    for dev in &devices {
        dev.set_master();
        dev.enable_memory_space();
        let bar = match dev.get_mmio_bar() {
            Some(b) => *b,
            None => continue,
        };
        let hba_virt = match crate::memory::map_mmio(bar.address, bar.size as usize) {
            Ok(v) => v as u64,
            Err(_) => continue,
        };

        unsafe {
            let ghc_ptr = (hba_virt as usize + hba_reg::GHC) as *mut u32;
            core::ptr::write_volatile(ghc_ptr, core::ptr::read_volatile(ghc_ptr) | ghc::AHCI_ENABLE);
            core::ptr::write_volatile(ghc_ptr, core::ptr::read_volatile(ghc_ptr) | ghc::INTERRUPT_ENABLE);
        }

        let pi = unsafe { core::ptr::read_volatile((hba_virt as usize + hba_reg::PI) as *const u32) };

        for port_index in 0..MAX_PORTS {
            if pi & (1 << port_index) == 0 {
                continue;
            }
            let port_mmio = hba_virt + (hba_reg::PORT_BASE + port_index * hba_reg::PORT_STRIDE) as u64;

            let (cmd_list_phys, cmd_list_virt) = match dma::io_memory_get(1024, 1024, crate::task::scheduler::kernel_pid(), "ahci-cmdlist") {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let (fis_phys, fis_virt) = match dma::io_memory_get(256, 256, crate::task::scheduler::kernel_pid(), "ahci-fis") {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let cmd_table_size = core::mem::size_of::<CommandTable>() * MAX_SLOTS;
            let (cmd_tables_phys, cmd_tables_virt) =
                match dma::io_memory_get(cmd_table_size as u64, 128, crate::task::scheduler::kernel_pid(), "ahci-cmdtables") {
                    Ok(pair) => pair,
                    Err(_) => continue,
                };

            let port = Port {
                port_index,
                mmio_base: port_mmio,
                kind: PortDeviceKind::None,
                cmd_list_virt,
                fis_virt,
                cmd_tables_virt,
                cmd_tables_phys,
                slot_in_use: AtomicU32::new(0),
                num_sectors: 0,
            };

            unsafe {
                port.stop();
                port.write(port_reg::CLB, cmd_list_phys as u32);
                port.write(port_reg::CLBU, (cmd_list_phys >> 32) as u32);
                port.write(port_reg::FB, fis_phys as u32);
                port.write(port_reg::FBU, (fis_phys >> 32) as u32);

                for slot in 0..MAX_SLOTS {
                    let header = &mut *port.command_header(slot);
                    header.ctba = (cmd_tables_phys + slot as u64 * core::mem::size_of::<CommandTable>() as u64) as u32;
                    header.ctbau = ((cmd_tables_phys + slot as u64 * core::mem::size_of::<CommandTable>() as u64) >> 32) as u32;
                }

                let _ = port.start();
            }

            let kind = port.detect_kind();
            if kind == PortDeviceKind::None {
                continue;
            }

            let mut port = port;
            port.kind = kind;
            if kind == PortDeviceKind::Sata {
                match unsafe { port.identify() } {
                    Ok(sectors) => port.num_sectors = sectors,
                    Err(e) => log::warn!("ahci: port {} IDENTIFY failed: {:?}", port_index, e),
                }
            }
            log::info!("ahci: port {} detected {:?}, {} sectors", port_index, kind, port.num_sectors);
            ports.push(port);
        }
    }

    for (i, port) in ports.iter().enumerate() {
        PORT_MMIO_BASE[i].store(port.mmio_base, Ordering::SeqCst);
    }
    PORT_COUNT.store(ports.len(), Ordering::SeqCst);

    let count = ports.len();
    *PORTS.lock() = ports;

    if let Some(dev) = devices.first() {
        if let Some(irq) = dev.irq() {
            crate::interrupts::register_irq_handler(irq, ahci_isr);
            crate::interrupts::enable_irq(irq);
        }
    }

    log::info!("ahci: {} port(s) with an attached device", count);
    count
}

pub struct AhciBlockDevice {
    port_index: usize,
}

pub fn get_block_device(port_index: usize) -> Option<AhciBlockDevice> {
    let ports = PORTS.lock();
    if port_index < ports.len() {
        Some(AhciBlockDevice { port_index })
    } else {
        None
    }
}

impl BlockDevice for AhciBlockDevice {
    fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        rw_sectors(self.port_index, lba, 1, buf, false).map_err(|_| BlockError::Io)
    }

    fn write_block(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        let mut scratch = buf.to_vec();
        rw_sectors(self.port_index, lba, 1, &mut scratch, true).map_err(|_| BlockError::Io)
    }

    fn num_blocks(&self) -> u64 {
        PORTS.lock()[self.port_index].num_sectors
    }

    fn flush(&self) -> Result<(), BlockError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn port_slot_allocation_is_exclusive() {
        let port = Port {
            port_index: 0,
            mmio_base: 0,
            kind: PortDeviceKind::None,
            cmd_list_virt: 0,
            fis_virt: 0,
            cmd_tables_virt: 0,
            cmd_tables_phys: 0,
            slot_in_use: AtomicU32::new(0),
            num_sectors: 0,
        };
        let a = port.alloc_slot().unwrap();
        let b = port.alloc_slot().unwrap();
        assert_ne!(a, b);
        port.free_slot(a);
        let c = port.alloc_slot().unwrap();
        assert_eq!(c, a);
    }

    #[test_case]
    fn signature_constants_match_ahci_spec() {
        assert_eq!(SIG_ATA, 0x0000_0101);
        assert_eq!(SIG_ATAPI, 0xEB14_0101);
    }
}
