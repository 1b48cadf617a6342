//! PATA/IDE driver: dual-channel PIO/DMA ATA + ATAPI over the legacy
//! compatibility I/O ports, bus-mastered via the PCI IDE controller's BAR4.
//!
//! Grounded on `kernelIdeDriver.c`/`kernelAtaDriver.c` (Visopsys): the
//! channel state machine in [`Channel::command`] follows the same eight
//! steps (select, program registers, arm the interrupt-wait flag, issue,
//! transfer, decode errors) but is reimplemented against this crate's
//! `KernelError`/`BlockDevice`/`interrupts` surfaces instead of a function
//! table.

use crate::block::{BlockDevice, BlockError};
use crate::drivers::dma;
use crate::drivers::pci::{self, storage_prog_if, DeviceClass};
use crate::error::KernelError;
use crate::interrupts::Irq;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;
use x86_64::instructions::port::Port;

const SECTOR_SIZE: usize = 512;

/// Per spec §4.4: 256 sectors (28-bit) or 65536 (48-bit), the max encoded
/// as 0 in the respective sector-count register.
const MAX_SECTORS_28BIT: u32 = 256;
const MAX_SECTORS_48BIT: u32 = 65536;

/// Legacy compatibility-mode I/O port bases.
const CHANNELS: [(u16, u16); 2] = [(0x1F0, 0x3F6), (0x170, 0x376)];

// ATA command register offsets from the channel's io base.
mod reg {
    pub const DATA: u16 = 0;
    pub const ERROR_FEATURES: u16 = 1;
    pub const SECTOR_COUNT: u16 = 2;
    pub const LBA_LOW: u16 = 3;
    pub const LBA_MID: u16 = 4;
    pub const LBA_HIGH: u16 = 5;
    pub const DRIVE_HEAD: u16 = 6;
    pub const STATUS_COMMAND: u16 = 7;
}

mod status {
    pub const ERR: u8 = 1 << 0;
    pub const DRQ: u8 = 1 << 3;
    pub const DF: u8 = 1 << 5;
    pub const DRDY: u8 = 1 << 6;
    pub const BSY: u8 = 1 << 7;
}

mod cmd {
    pub const READ_PIO: u8 = 0x20;
    pub const READ_PIO_EXT: u8 = 0x24;
    pub const WRITE_PIO: u8 = 0x30;
    pub const WRITE_PIO_EXT: u8 = 0x34;
    pub const READ_DMA: u8 = 0xC8;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const WRITE_DMA: u8 = 0xCA;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const FLUSH_CACHE: u8 = 0xE7;
    pub const FLUSH_CACHE_EXT: u8 = 0xEA;
    pub const IDENTIFY: u8 = 0xEC;
    pub const IDENTIFY_PACKET: u8 = 0xA1;
    pub const PACKET: u8 = 0xA0;
}

/// ATA status-register error taxonomy (`kernelAtaDriver.h`), plus the two
/// conditions this driver detects itself (`Unknown`, `Timeout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaError {
    /// Address mark not found.
    Amnf,
    /// Track 0 not found.
    Tk0nf,
    /// Command aborted.
    Abrt,
    /// Media change requested.
    Mcr,
    /// Sector (ID) not found.
    Idnf,
    /// Media changed.
    Mc,
    /// Uncorrectable data error.
    Unc,
    /// Bad block detected.
    Bbk,
    Unknown,
    Timeout,
}

impl AtaError {
    fn decode(error_reg: u8) -> Self {
        if error_reg & 0x01 != 0 {
            AtaError::Amnf
        } else if error_reg & 0x02 != 0 {
            AtaError::Tk0nf
        } else if error_reg & 0x04 != 0 {
            AtaError::Abrt
        } else if error_reg & 0x08 != 0 {
            AtaError::Mcr
        } else if error_reg & 0x10 != 0 {
            AtaError::Idnf
        } else if error_reg & 0x20 != 0 {
            AtaError::Mc
        } else if error_reg & 0x40 != 0 {
            AtaError::Unc
        } else if error_reg & 0x80 != 0 {
            AtaError::Bbk
        } else {
            AtaError::Unknown
        }
    }
}

impl From<AtaError> for KernelError {
    fn from(_: AtaError) -> Self {
        KernelError::Io
    }
}

bitflags! {
    #[derive(Clone, Copy)]
    pub struct Features: u32 {
        const LBA48        = 1 << 0;
        const DMA          = 1 << 1;
        const SMART        = 1 << 2;
        const READ_CACHE   = 1 << 3;
        const WRITE_CACHE  = 1 << 4;
        const MEDIA_STATUS = 1 << 5;
        const MULTI_SECTOR = 1 << 6;
    }
}

/// Physical Region Descriptor: `{physical address, byte count, end-of-table}`.
/// Byte count is a dword multiple; no PRD spans a 64 KiB boundary.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Prd {
    phys_addr: u32,
    byte_count_eot: u32, // bits 15:0 byte count, bit 31 end-of-table
}

const MAX_PRDS: usize = 32;

#[repr(C, align(4))]
struct PrdTable {
    entries: [Prd; MAX_PRDS],
}

/// Split a physical transfer into PRDs, none of which cross a 64 KiB
/// boundary and all of whose byte counts are dword multiples. This is the
/// "64 KiB aligned request becomes two 32 KiB PRDs" quirk avoidance named
/// in the spec's boundary cases.
fn fill_prds(table: &mut PrdTable, phys_addr: u64, total_bytes: usize) -> Result<usize, KernelError> {
    const BOUNDARY: u64 = 0x10000;
    let mut offset = 0usize;
    let mut index = 0usize;
    while offset < total_bytes {
        if index >= MAX_PRDS {
            return Err(KernelError::NoFree);
        }
        let addr = phys_addr + offset as u64;
        let room_in_boundary = (BOUNDARY - (addr % BOUNDARY)) as usize;
        let remaining = total_bytes - offset;
        let mut chunk = remaining.min(room_in_boundary);
        chunk &= !0x3; // dword multiple
        if chunk == 0 {
            chunk = remaining.min(4);
        }
        let is_last = offset + chunk >= total_bytes;
        table.entries[index] = Prd {
            phys_addr: addr as u32,
            byte_count_eot: (chunk as u32 & 0xFFFF) | if is_last { 1 << 31 } else { 0 },
        };
        offset += chunk;
        index += 1;
    }
    Ok(index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    None,
    Ata,
    Atapi,
}

/// Per-drive geometry and capability record (§3 "ATA/AHCI disk").
#[derive(Clone)]
pub struct Drive {
    pub kind: DriveKind,
    pub channel: usize,
    pub drive_num: u8, // 0 = master, 1 = slave
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
    pub sector_size: u32,
    pub num_sectors: u64,
    pub multi_sectors: u8,
    pub features: Features,
    pub motor_on: bool,
    pub door_open: bool,
    pub door_locked: bool,
}

struct ChannelIo {
    io_base: u16,
    ctrl_base: u16,
    bmide_base: Option<u16>,
}

impl ChannelIo {
    fn port(&self, offset: u16) -> Port<u8> {
        Port::new(self.io_base + offset)
    }

    fn data_port(&self) -> Port<u16> {
        Port::new(self.io_base + reg::DATA)
    }

    fn alt_status(&self) -> Port<u8> {
        Port::new(self.ctrl_base)
    }

    unsafe fn read_status(&self) -> u8 {
        self.port(reg::STATUS_COMMAND).read()
    }

    unsafe fn select_drive(&self, drive_num: u8, lba: bool, head_bits: u8) {
        let mut p = self.port(reg::DRIVE_HEAD);
        p.write(0xA0 | (drive_num << 4) | (if lba { 0x40 } else { 0 }) | (head_bits & 0x0F));
    }

    unsafe fn poll_not_busy(&self, timeout_ms: u64) -> Result<u8, AtaError> {
        let deadline = crate::time::get_ticks() + timeout_ms;
        loop {
            let status = self.read_status();
            if status & status::BSY == 0 {
                return Ok(status);
            }
            if crate::time::get_ticks() > deadline {
                return Err(AtaError::Timeout);
            }
            core::hint::spin_loop();
        }
    }

    unsafe fn poll_drq(&self, timeout_ms: u64) -> Result<(), AtaError> {
        let deadline = crate::time::get_ticks() + timeout_ms;
        loop {
            let status = self.read_status();
            if status & status::ERR != 0 || status & status::DF != 0 {
                return Err(AtaError::decode(self.port(reg::ERROR_FEATURES).read()));
            }
            if status & status::DRQ != 0 {
                return Ok(());
            }
            if crate::time::get_ticks() > deadline {
                return Err(AtaError::Timeout);
            }
            core::hint::spin_loop();
        }
    }
}

/// One IDE channel (primary/secondary), owning its own lock and DMA PRD
/// table. Per spec §5, transactions on a channel linearize behind `lock`.
struct Channel {
    io: ChannelIo,
    prd_virt: u64,
    prd_phys: u64,
    dma_buf_virt: u64,
    dma_buf_phys: u64,
    dma_tested_ok: bool,
}

const DMA_BUF_SIZE: usize = 128 * 1024;
const NUM_CHANNELS: usize = CHANNELS.len();

/// Interrupt-wait state, kept outside `CHANNELS_STATE`'s mutex so `ata_isr`
/// (spec §5: ISR context may only set flags, never take a lock) never has
/// to contend with a foreground transfer that is itself holding that lock
/// across a `wait_interrupt` spin — see the `got_interrupt`/`io_base`
/// entries below.
static CHANNEL_GOT_INTERRUPT: [core::sync::atomic::AtomicBool; NUM_CHANNELS] =
    [const { core::sync::atomic::AtomicBool::new(false) }; NUM_CHANNELS];
/// Status-register I/O port base per channel, mirrored from `ChannelIo` at
/// init time so the ISR can acknowledge the IRQ without touching
/// `CHANNELS_STATE`. 0 until `init()` populates it.
static CHANNEL_STATUS_IO_BASE: [core::sync::atomic::AtomicU16; NUM_CHANNELS] =
    [const { core::sync::atomic::AtomicU16::new(0) }; NUM_CHANNELS];

fn wait_interrupt(channel_idx: usize, timeout_ms: u64) -> Result<(), AtaError> {
    let deadline = crate::time::get_ticks() + timeout_ms;
    CHANNEL_GOT_INTERRUPT[channel_idx].store(false, core::sync::atomic::Ordering::SeqCst);
    loop {
        if CHANNEL_GOT_INTERRUPT[channel_idx].load(core::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        if crate::time::get_ticks() > deadline {
            return Err(AtaError::Timeout);
        }
        core::hint::spin_loop();
    }
}

static CHANNELS_STATE: Mutex<Vec<Channel>> = Mutex::new(Vec::new());
static DRIVES: Mutex<Vec<Drive>> = Mutex::new(Vec::new());

fn with_channel<R>(idx: usize, f: impl FnOnce(&Channel) -> R) -> R {
    let guard = CHANNELS_STATE.lock();
    f(&guard[idx])
}

/// Lock-free: reads only `CHANNEL_STATUS_IO_BASE`/`CHANNEL_GOT_INTERRUPT`,
/// never `CHANNELS_STATE`, so it can't deadlock against a foreground
/// transfer spinning in [`wait_interrupt`] with that mutex held.
fn ata_isr(channel_idx: usize) -> bool {
    let io_base = CHANNEL_STATUS_IO_BASE[channel_idx].load(core::sync::atomic::Ordering::SeqCst);
    if io_base == 0 {
        return false;
    }
    // Reading the status register acknowledges the IRQ on real hardware.
    let _status: u8 = unsafe { Port::new(io_base + reg::STATUS_COMMAND).read() };
    CHANNEL_GOT_INTERRUPT[channel_idx].store(true, core::sync::atomic::Ordering::SeqCst);
    if let Some(pid) = crate::task::scheduler::current_pid() {
        crate::task::scheduler::set_io_ready(pid);
    }
    true
}

fn ata_primary_isr() -> bool {
    ata_isr(0)
}
fn ata_secondary_isr() -> bool {
    ata_isr(1)
}

/// Drive-count cap applied when a LBA48-incapable drive's reported sector
/// count would otherwise overflow the 28-bit encoding.
fn encode_sector_count(count: u32, lba48: bool) -> (u8, u8) {
    let max = if lba48 { MAX_SECTORS_48BIT } else { MAX_SECTORS_28BIT };
    let encoded = if count >= max { 0 } else { count };
    if lba48 {
        ((encoded & 0xFF) as u8, ((encoded >> 8) & 0xFF) as u8)
    } else {
        ((encoded & 0xFF) as u8, 0)
    }
}

/// Issue IDENTIFY (or IDENTIFY PACKET) and decode the 512-byte response
/// into geometry/feature fields.
fn identify(channel_idx: usize, drive_num: u8, packet: bool) -> Result<Drive, AtaError> {
    with_channel(channel_idx, |ch| unsafe {
        ch.io.select_drive(drive_num, false, 0);
        ch.io.poll_not_busy(1000)?;

        ch.io.port(reg::SECTOR_COUNT).write(0u8);
        ch.io.port(reg::LBA_LOW).write(0u8);
        ch.io.port(reg::LBA_MID).write(0u8);
        ch.io.port(reg::LBA_HIGH).write(0u8);
        ch.io
            .port(reg::STATUS_COMMAND)
            .write(if packet { cmd::IDENTIFY_PACKET } else { cmd::IDENTIFY });

        let status = ch.io.poll_not_busy(1000)?;
        if status == 0 {
            return Err(AtaError::Idnf);
        }
        ch.io.poll_drq(1000)?;

        let mut words = [0u16; 256];
        let mut data_port = ch.io.data_port();
        for w in words.iter_mut() {
            *w = data_port.read();
        }

        let lba48 = words[83] & (1 << 10) != 0;
        let dma_capable = words[49] & (1 << 8) != 0;
        let multi_sectors = (words[59] & 0xFF) as u8;
        let sectors_28 = (words[60] as u32) | ((words[61] as u32) << 16);
        let sectors_48 = (words[100] as u64)
            | ((words[101] as u64) << 16)
            | ((words[102] as u64) << 32)
            | ((words[103] as u64) << 48);

        let mut features = Features::empty();
        if lba48 {
            features |= Features::LBA48;
        }
        if dma_capable {
            features |= Features::DMA;
        }
        if multi_sectors > 0 {
            features |= Features::MULTI_SECTOR;
        }

        Ok(Drive {
            kind: if packet { DriveKind::Atapi } else { DriveKind::Ata },
            channel: channel_idx,
            drive_num,
            cylinders: words[1],
            heads: words[3],
            sectors_per_track: words[6],
            sector_size: if packet { 2048 } else { SECTOR_SIZE as u32 },
            num_sectors: if lba48 { sectors_48 } else { sectors_28 as u64 },
            multi_sectors: multi_sectors.max(1),
            features,
            motor_on: false,
            door_open: false,
            door_locked: false,
        })
    })
}

const MAX_RETRIES: u32 = 3;

/// PIO sector transfer (read or write), one command per call. `write`
/// selects WRITE PIO (EXT); data direction of the 256-word inner loop
/// follows.
fn pio_transfer(channel_idx: usize, drive: &Drive, lba: u64, count: u32, buf: &mut [u8], write: bool) -> Result<(), AtaError> {
    let lba48 = drive.features.contains(Features::LBA48);
    with_channel(channel_idx, |ch| unsafe {
        ch.io.select_drive(drive.drive_num, true, if lba48 { 0 } else { ((lba >> 24) & 0x0F) as u8 });
        ch.io.poll_not_busy(1000)?;

        let (count_lo, count_hi) = encode_sector_count(count, lba48);
        if lba48 {
            ch.io.port(reg::SECTOR_COUNT).write(count_hi);
            ch.io.port(reg::LBA_LOW).write(((lba >> 24) & 0xFF) as u8);
            ch.io.port(reg::LBA_MID).write(((lba >> 32) & 0xFF) as u8);
            ch.io.port(reg::LBA_HIGH).write(((lba >> 40) & 0xFF) as u8);
        }
        ch.io.port(reg::SECTOR_COUNT).write(count_lo);
        ch.io.port(reg::LBA_LOW).write((lba & 0xFF) as u8);
        ch.io.port(reg::LBA_MID).write(((lba >> 8) & 0xFF) as u8);
        ch.io.port(reg::LBA_HIGH).write(((lba >> 16) & 0xFF) as u8);

        let command = match (write, lba48) {
            (false, false) => cmd::READ_PIO,
            (false, true) => cmd::READ_PIO_EXT,
            (true, false) => cmd::WRITE_PIO,
            (true, true) => cmd::WRITE_PIO_EXT,
        };
        ch.io.port(reg::STATUS_COMMAND).write(command);

        let per_chunk = (drive.multi_sectors as u32).min(count).max(1);
        let mut transferred = 0u32;
        let mut data_port = ch.io.data_port();
        while transferred < count {
            ch.io.poll_drq(2000)?;
            let this_chunk = per_chunk.min(count - transferred);
            for s in 0..this_chunk {
                let base = ((transferred + s) as usize) * SECTOR_SIZE;
                for w in 0..(SECTOR_SIZE / 2) {
                    if write {
                        let lo = buf[base + w * 2] as u16;
                        let hi = buf[base + w * 2 + 1] as u16;
                        data_port.write(lo | (hi << 8));
                    } else {
                        let word = data_port.read();
                        buf[base + w * 2] = (word & 0xFF) as u8;
                        buf[base + w * 2 + 1] = (word >> 8) as u8;
                    }
                }
            }
            transferred += this_chunk;
        }
        Ok(())
    })
}

/// DMA sector transfer via the channel's bus-master controller and PRD
/// table, following the command life-cycle in spec §4.4 steps 4-7.
fn dma_transfer(channel_idx: usize, drive: &Drive, lba: u64, count: u32, buf: &mut [u8], write: bool) -> Result<(), AtaError> {
    let lba48 = drive.features.contains(Features::LBA48);
    let bytes = count as usize * SECTOR_SIZE;
    if bytes > DMA_BUF_SIZE {
        return Err(AtaError::Unknown);
    }

    with_channel(channel_idx, |ch| unsafe {
        let bmide_base = match ch.io.bmide_base {
            Some(b) => b,
            None => return Err(AtaError::Unknown),
        };

        if write {
            let src = core::slice::from_raw_parts(buf.as_ptr(), bytes);
            core::ptr::copy_nonoverlapping(src.as_ptr(), ch.dma_buf_virt as *mut u8, bytes);
        }

        let prd_table = &mut *(ch.prd_virt as *mut PrdTable);
        fill_prds(prd_table, ch.dma_buf_phys, bytes).map_err(|_| AtaError::Unknown)?;

        let mut bmide_command: Port<u8> = Port::new(bmide_base);
        let mut bmide_status: Port<u8> = Port::new(bmide_base + 2);
        let mut bmide_prdt: Port<u32> = Port::new(bmide_base + 4);

        bmide_command.write(0u8); // stop
        bmide_status.write(0x06u8); // clear error + interrupt bits
        bmide_prdt.write(ch.prd_phys as u32);

        ch.io.select_drive(drive.drive_num, true, if lba48 { 0 } else { ((lba >> 24) & 0x0F) as u8 });
        ch.io.poll_not_busy(1000)?;

        let (count_lo, count_hi) = encode_sector_count(count, lba48);
        if lba48 {
            ch.io.port(reg::SECTOR_COUNT).write(count_hi);
            ch.io.port(reg::LBA_LOW).write(((lba >> 24) & 0xFF) as u8);
            ch.io.port(reg::LBA_MID).write(((lba >> 32) & 0xFF) as u8);
            ch.io.port(reg::LBA_HIGH).write(((lba >> 40) & 0xFF) as u8);
        }
        ch.io.port(reg::SECTOR_COUNT).write(count_lo);
        ch.io.port(reg::LBA_LOW).write((lba & 0xFF) as u8);
        ch.io.port(reg::LBA_MID).write(((lba >> 8) & 0xFF) as u8);
        ch.io.port(reg::LBA_HIGH).write(((lba >> 16) & 0xFF) as u8);

        let command = if lba48 {
            if write { cmd::WRITE_DMA_EXT } else { cmd::READ_DMA_EXT }
        } else if write {
            cmd::WRITE_DMA
        } else {
            cmd::READ_DMA
        };
        ch.io.port(reg::STATUS_COMMAND).write(command);

        // Start bus-master: bit 0 = start, bit 3 = read/write (1 = read from
        // device into memory).
        let dir_bit = if write { 0 } else { 1 << 3 };
        bmide_command.write(0x01 | dir_bit);

        wait_interrupt(channel_idx, 5000)?;

        let bm_status = bmide_status.read();
        bmide_command.write(0u8);

        let ata_status = ch.io.read_status();
        if ata_status & status::ERR != 0 || bm_status & 0x02 != 0 {
            return Err(AtaError::decode(ch.io.port(reg::ERROR_FEATURES).read()));
        }

        if !write {
            let dst = core::slice::from_raw_parts_mut(buf.as_mut_ptr(), bytes);
            core::ptr::copy_nonoverlapping(ch.dma_buf_virt as *const u8, dst.as_mut_ptr(), bytes);
        }
        Ok(())
    })
}

fn transfer_with_retry(channel_idx: usize, drive: &Drive, lba: u64, count: u32, buf: &mut [u8], write: bool) -> Result<(), KernelError> {
    let use_dma = drive.features.contains(Features::DMA);
    let mut last_err = AtaError::Unknown;
    for attempt in 0..MAX_RETRIES {
        let result = if use_dma {
            dma_transfer(channel_idx, drive, lba, count, buf, write)
        } else {
            pio_transfer(channel_idx, drive, lba, count, buf, write)
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("ata: attempt {} failed: {:?}", attempt + 1, e);
                last_err = e;
            }
        }
    }
    log::error!("ata: transfer exhausted retries: {:?}", last_err);
    Err(last_err.into())
}

/// ATAPI spin-up retry loop: polls `REQUEST SENSE` for up to 10 seconds
/// when the drive reports `NOT_READY` (sense key 0x02) with ASC 0x04
/// ("not ready, cause not reportable" through "becoming ready").
fn atapi_wait_ready(channel_idx: usize, drive_num: u8) -> Result<(), KernelError> {
    let deadline = crate::time::get_ticks() + 10_000;
    loop {
        match atapi_test_unit_ready(channel_idx, drive_num) {
            Ok(()) => return Ok(()),
            Err((sense_key, asc)) if sense_key == 0x02 && asc == 0x04 => {
                if crate::time::get_ticks() > deadline {
                    return Err(KernelError::NoMedia);
                }
                core::hint::spin_loop();
            }
            Err((0x02, 0x3A)) => return Err(KernelError::NoMedia), // medium not present
            Err(_) => return Err(KernelError::Io),
        }
    }
}

/// Send a 12-byte SCSI packet via the PACKET (0xA0) command and, on CHK,
/// decode REQUEST SENSE into `(sense_key, asc)`.
fn atapi_packet_command(channel_idx: usize, drive_num: u8, packet: &[u8; 12], data: Option<&mut [u8]>) -> Result<(), (u8, u8)> {
    with_channel(channel_idx, |ch| unsafe {
        ch.io.select_drive(drive_num, false, 0);
        let _ = ch.io.poll_not_busy(1000);

        ch.io.port(reg::ERROR_FEATURES).write(0u8);
        ch.io.port(reg::LBA_MID).write(0xFFu8); // max byte count low
        ch.io.port(reg::LBA_HIGH).write(0xFFu8); // max byte count high
        ch.io.port(reg::STATUS_COMMAND).write(cmd::PACKET);

        if ch.io.poll_drq(1000).is_err() {
            return Err((0xFF, 0xFF));
        }

        let mut data_port = ch.io.data_port();
        for chunk in packet.chunks(2) {
            let word = chunk[0] as u16 | ((*chunk.get(1).unwrap_or(&0) as u16) << 8);
            data_port.write(word);
        }

        let status = ch.io.read_status();
        if status & status::ERR != 0 {
            let sense = ch.io.port(reg::ERROR_FEATURES).read();
            return Err(((sense >> 4) & 0x0F, 0x00));
        }

        if let Some(buf) = data {
            if ch.io.poll_drq(2000).is_ok() {
                for word_slot in buf.chunks_mut(2) {
                    let word = data_port.read();
                    word_slot[0] = (word & 0xFF) as u8;
                    if word_slot.len() > 1 {
                        word_slot[1] = (word >> 8) as u8;
                    }
                }
            }
        }
        Ok(())
    })
}

fn atapi_test_unit_ready(channel_idx: usize, drive_num: u8) -> Result<(), (u8, u8)> {
    let packet = [0u8; 12]; // TEST UNIT READY, opcode 0x00
    atapi_packet_command(channel_idx, drive_num, &packet, None)
}

/// Probe both legacy channels on every IDE bus-master controller found on
/// the PCI bus, identifying up to two drives per channel.
pub fn init() -> usize {
    let devices = pci::find_by_class(DeviceClass::MassStorage, 0x01, storage_prog_if::IDE_BUS_MASTER);
    let mut channels = Vec::new();
    let mut drives = Vec::new();

    for (idx, (io_base, ctrl_base)) in CHANNELS.iter().enumerate() {
        let bmide_base = devices.first().and_then(|d| d.get_io_bar()).map(|bar| bar.address as u16 + (idx as u16) * 8);
        if let Some(dev) = devices.first() {
            dev.set_master();
        }

        let (prd_phys, prd_virt) = match dma::io_memory_get(4096, 4096, crate::task::scheduler::kernel_pid(), "ata-prd") {
            Ok(pair) => pair,
            Err(_) => (0, 0),
        };
        let (dma_buf_phys, dma_buf_virt) = match dma::io_memory_get(DMA_BUF_SIZE as u64, 4096, crate::task::scheduler::kernel_pid(), "ata-dmabuf") {
            Ok(pair) => pair,
            Err(_) => (0, 0),
        };

        CHANNEL_STATUS_IO_BASE[idx].store(*io_base, core::sync::atomic::Ordering::SeqCst);
        channels.push(Channel {
            io: ChannelIo { io_base: *io_base, ctrl_base: *ctrl_base, bmide_base },
            prd_virt,
            prd_phys,
            dma_buf_virt,
            dma_buf_phys,
            dma_tested_ok: bmide_base.is_some(),
        });

        for drive_num in 0..2u8 {
            if let Ok(drive) = identify(idx, drive_num, false) {
                drives.push(drive);
                continue;
            }
            if let Ok(drive) = identify(idx, drive_num, true) {
                drives.push(drive);
            }
        }
    }

    *CHANNELS_STATE.lock() = channels;
    let count = drives.len();
    *DRIVES.lock() = drives;

    crate::interrupts::register_irq_handler(Irq::AtaPrimary, ata_primary_isr);
    crate::interrupts::register_irq_handler(Irq::AtaSecondary, ata_secondary_isr);
    crate::interrupts::enable_irq(Irq::AtaPrimary);
    crate::interrupts::enable_irq(Irq::AtaSecondary);

    dma_self_test();

    log::info!("ata: {} drive(s) identified across {} channel(s)", count, CHANNELS.len());
    count
}

/// Exercise one DMA read per DMA-capable drive at init time; a controller
/// that can't complete a DMA round trip (missing bus-master BAR, PRD setup
/// rejected by the chipset) falls back to PIO for that drive rather than
/// failing every later read.
fn dma_self_test() {
    let indices: Vec<(usize, usize)> = DRIVES
        .lock()
        .iter()
        .enumerate()
        .filter(|(_, d)| d.kind == DriveKind::Ata && d.features.contains(Features::DMA))
        .map(|(i, d)| (i, d.channel))
        .collect();

    for (drive_index, channel_idx) in indices {
        let mut scratch = [0u8; SECTOR_SIZE];
        let drive_snapshot = DRIVES.lock()[drive_index].clone();
        let ok = dma_transfer(channel_idx, &drive_snapshot, 0, 1, &mut scratch, false).is_ok();
        if !ok {
            log::warn!("ata: DMA self-test failed on channel {}, falling back to PIO", channel_idx);
            DRIVES.lock()[drive_index].features.remove(Features::DMA);
        }
        if let Some(ch) = CHANNELS_STATE.lock().get_mut(channel_idx) {
            ch.dma_tested_ok = ok;
        }
    }
}

/// A `BlockDevice` handle bound to one drive's index in the global table.
pub struct AtaBlockDevice {
    index: usize,
}

pub fn get_block_device(index: usize) -> Option<AtaBlockDevice> {
    let drives = DRIVES.lock();
    if index < drives.len() && drives[index].kind == DriveKind::Ata {
        Some(AtaBlockDevice { index })
    } else {
        None
    }
}

impl BlockDevice for AtaBlockDevice {
    fn read_block(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let drives = DRIVES.lock();
        let drive = &drives[self.index];
        if lba >= drive.num_sectors {
            return Err(BlockError::OutOfBounds);
        }
        transfer_with_retry(drive.channel, drive, lba, 1, buf, false).map_err(|_| BlockError::Io)
    }

    fn write_block(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        let drives = DRIVES.lock();
        let drive = &drives[self.index];
        if lba >= drive.num_sectors {
            return Err(BlockError::OutOfBounds);
        }
        let mut scratch = buf.to_vec();
        transfer_with_retry(drive.channel, drive, lba, 1, &mut scratch, true).map_err(|_| BlockError::Io)
    }

    fn num_blocks(&self) -> u64 {
        DRIVES.lock()[self.index].num_sectors
    }

    fn flush(&self) -> Result<(), BlockError> {
        let drives = DRIVES.lock();
        let drive = &drives[self.index];
        let lba48 = drive.features.contains(Features::LBA48);
        with_channel(drive.channel, |ch| unsafe {
            ch.io.select_drive(drive.drive_num, true, 0);
            let _ = ch.io.poll_not_busy(1000);
            ch.io
                .port(reg::STATUS_COMMAND)
                .write(if lba48 { cmd::FLUSH_CACHE_EXT } else { cmd::FLUSH_CACHE });
            ch.io.poll_not_busy(5000).map(|_| ()).map_err(|_| BlockError::Timeout)
        })
    }
}

/// ATAPI disk count, for the storage layer's media-present polling.
pub fn atapi_probe(index: usize) -> Result<(), KernelError> {
    let (channel, drive_num) = {
        let drives = DRIVES.lock();
        let d = drives.get(index).ok_or(KernelError::NoSuchEntry)?;
        (d.channel, d.drive_num)
    };
    atapi_wait_ready(channel, drive_num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn sector_count_256_encodes_as_zero_28bit() {
        assert_eq!(encode_sector_count(256, false), (0, 0));
        assert_eq!(encode_sector_count(255, false), (255, 0));
    }

    #[test_case]
    fn sector_count_65536_encodes_as_zero_48bit() {
        assert_eq!(encode_sector_count(65536, true), (0, 0));
        assert_eq!(encode_sector_count(65535, true), (0xFF, 0xFF));
    }

    #[test_case]
    fn error_register_decodes_amnf_first() {
        assert_eq!(AtaError::decode(0x01), AtaError::Amnf);
        assert_eq!(AtaError::decode(0x04), AtaError::Abrt);
        assert_eq!(AtaError::decode(0x80), AtaError::Bbk);
    }

    #[test_case]
    fn prd_never_crosses_64kib_boundary() {
        let mut table = PrdTable { entries: [Prd { phys_addr: 0, byte_count_eot: 0 }; MAX_PRDS] };
        // A transfer starting 4 KiB before a 64 KiB boundary and running
        // 8 KiB must split into two PRDs, neither crossing the boundary.
        let base: u64 = 0x1_0000 - 0x1000;
        let n = fill_prds(&mut table, base, 0x2000).unwrap();
        assert_eq!(n, 2);
        let first_len = table.entries[0].byte_count_eot & 0xFFFF;
        assert_eq!(first_len, 0x1000);
    }
}
