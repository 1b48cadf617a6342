//! PCI configuration-space access and bus enumeration.
//!
//! Mechanism 1: `CONFIG_ADDRESS`/`CONFIG_DATA` port pair, legacy
//! `0x8000_0000 | bus<<16 | device<<11 | function<<8 | offset` addressing.
//! Every config-space access funnels through [`with_config_lock`] so two
//! drivers probing concurrently (interrupt vs. init-time enumeration) can
//! never interleave an address write with another's data read.

use crate::error::KernelError;
use crate::interrupts::Irq;
use alloc::vec::Vec;
use core::{fmt, sync::atomic::AtomicBool};
use spin::Mutex;
use x86_64::instructions::port::Port;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const MAX_BUS: u8 = 255;
const MAX_DEVICE: u8 = 32;
const MAX_FUNCTION: u8 = 8;

/// Guards every config-space access; PCI config space has no per-access
/// atomicity of its own (address and data are separate ports).
static CONFIG_LOCK: Mutex<()> = Mutex::new(());

fn with_config_lock<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = CONFIG_LOCK.lock();
    f()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceClass {
    Legacy = 0x00,
    MassStorage = 0x01,
    Network = 0x02,
    Display = 0x03,
    Multimedia = 0x04,
    Memory = 0x05,
    Bridge = 0x06,
    SimpleCommunication = 0x07,
    BaseSystemPeripheral = 0x08,
    InputDevice = 0x09,
    DockingStation = 0x0A,
    Processor = 0x0B,
    SerialBus = 0x0C,
    Wireless = 0x0D,
    IntelligentIO = 0x0E,
    SatelliteCommunication = 0x0F,
    Encryption = 0x10,
    SignalProcessing = 0x11,
    Unknown = 0xFF,
}

impl DeviceClass {
    fn from_u8(value: u8) -> Self {
        match value {
            0x00 => DeviceClass::Legacy,
            0x01 => DeviceClass::MassStorage,
            0x02 => DeviceClass::Network,
            0x03 => DeviceClass::Display,
            0x04 => DeviceClass::Multimedia,
            0x05 => DeviceClass::Memory,
            0x06 => DeviceClass::Bridge,
            0x07 => DeviceClass::SimpleCommunication,
            0x08 => DeviceClass::BaseSystemPeripheral,
            0x09 => DeviceClass::InputDevice,
            0x0A => DeviceClass::DockingStation,
            0x0B => DeviceClass::Processor,
            0x0C => DeviceClass::SerialBus,
            0x0D => DeviceClass::Wireless,
            0x0E => DeviceClass::IntelligentIO,
            0x0F => DeviceClass::SatelliteCommunication,
            0x10 => DeviceClass::Encryption,
            0x11 => DeviceClass::SignalProcessing,
            _ => DeviceClass::Unknown,
        }
    }
}

/// Storage programming-interface codes this kernel dispatches on.
pub mod storage_prog_if {
    pub const IDE_BUS_MASTER: u8 = 0x80;
    pub const SATA_AHCI: u8 = 0x01;
}

/// Serial-bus subclass/prog-if pairs for the USB host controllers in scope.
pub mod usb_prog_if {
    pub const SUBCLASS_USB: u8 = 0x03;
    pub const OHCI: u8 = 0x10;
    pub const EHCI: u8 = 0x20;
}

#[derive(Debug, Copy, Clone)]
pub struct Bar {
    pub address: u64,
    pub size: u64,
    pub is_io: bool,
    pub is_64bit: bool,
    pub prefetchable: bool,
}

impl Bar {
    const fn empty() -> Self {
        Bar {
            address: 0,
            size: 0,
            is_io: false,
            is_64bit: false,
            prefetchable: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.size > 0
    }
}

/// One function's 256-byte configuration header, decoded.
#[derive(Clone)]
pub struct Device {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub class: DeviceClass,
    pub subclass: u8,
    pub prog_if: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub multifunction: bool,
    pub bars: [Bar; 6],
}

impl Device {
    pub fn get_mmio_bar(&self) -> Option<&Bar> {
        self.bars.iter().find(|bar| bar.is_valid() && !bar.is_io)
    }

    pub fn get_io_bar(&self) -> Option<&Bar> {
        self.bars.iter().find(|bar| bar.is_valid() && bar.is_io)
    }

    /// The legacy `Irq` line this function's interrupt-line register maps
    /// to, if it is one of the lines this kernel actually services.
    pub fn irq(&self) -> Option<Irq> {
        match self.interrupt_line {
            11 => Some(Irq::SharedPci),
            14 => Some(Irq::AtaPrimary),
            15 => Some(Irq::AtaSecondary),
            _ => None,
        }
    }

    /// `set_master`: set the Bus Master Enable bit (command register, bit 2).
    pub fn set_master(&self) {
        let command = read_register(self.bus, self.device, self.function, 0x04, 2);
        write_register(self.bus, self.device, self.function, 0x04, 2, command as u32 | 0x04);
    }

    /// `device_enable(mem)`: set Memory Space Enable (bit 1).
    pub fn enable_memory_space(&self) {
        let command = read_register(self.bus, self.device, self.function, 0x04, 2);
        write_register(self.bus, self.device, self.function, 0x04, 2, command as u32 | 0x02);
    }

    /// `device_enable(io)`: set I/O Space Enable (bit 0).
    pub fn enable_io_space(&self) {
        let command = read_register(self.bus, self.device, self.function, 0x04, 2);
        write_register(self.bus, self.device, self.function, 0x04, 2, command as u32 | 0x01);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{} {:04x}:{:04x} {:?}/{:02x}",
            self.bus, self.device, self.function, self.vendor_id, self.device_id, self.class, self.subclass
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field("location", &format_args!("{:02x}:{:02x}.{}", self.bus, self.device, self.function))
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("device_id", &format_args!("{:#06x}", self.device_id))
            .field("class", &self.class)
            .field("subclass", &format_args!("{:#04x}", self.subclass))
            .field("prog_if", &format_args!("{:#04x}", self.prog_if))
            .field("irq", &self.interrupt_line)
            .finish()
    }
}

fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset & 0xFC) as u32)
}

fn pci_read_config_dword(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    with_config_lock(|| unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);
        addr_port.write(config_address(bus, device, function, offset));
        data_port.read()
    })
}

fn pci_write_config_dword(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    with_config_lock(|| unsafe {
        let mut addr_port = Port::<u32>::new(CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(CONFIG_DATA);
        addr_port.write(config_address(bus, device, function, offset));
        data_port.write(value);
    })
}

/// `read_register(offset, width)`: width in {1, 2, 4} bytes.
pub fn read_register(bus: u8, device: u8, function: u8, offset: u8, width: u8) -> u32 {
    let dword = pci_read_config_dword(bus, device, function, offset & 0xFC);
    let shift = ((offset & 3) * 8) as u32;
    match width {
        1 => (dword >> shift) & 0xFF,
        2 => (dword >> shift) & 0xFFFF,
        _ => dword,
    }
}

/// `write_register(offset, width, value)`: read-modify-write for widths
/// narrower than a dword, since config space is only dword-addressable.
pub fn write_register(bus: u8, device: u8, function: u8, offset: u8, width: u8, value: u32) {
    let dword_offset = offset & 0xFC;
    if width == 4 {
        pci_write_config_dword(bus, device, function, dword_offset, value);
        return;
    }
    let shift = ((offset & 3) * 8) as u32;
    let mask: u32 = if width == 1 { 0xFF } else { 0xFFFF };
    let mut dword = pci_read_config_dword(bus, device, function, dword_offset);
    dword = (dword & !(mask << shift)) | ((value & mask) << shift);
    pci_write_config_dword(bus, device, function, dword_offset, dword);
}

fn decode_bar(bus: u8, device: u8, function: u8, bar_index: u8) -> (Bar, bool) {
    let offset = 0x10 + (bar_index * 4);
    let bar_low = pci_read_config_dword(bus, device, function, offset);

    if bar_low & 0x01 != 0 {
        pci_write_config_dword(bus, device, function, offset, 0xFFFF_FFFF);
        let size_mask = pci_read_config_dword(bus, device, function, offset);
        pci_write_config_dword(bus, device, function, offset, bar_low);

        let address = (bar_low & 0xFFFF_FFFC) as u64;
        let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
            0
        } else {
            (!(size_mask & 0xFFFF_FFFC)).wrapping_add(1) as u64
        };
        (Bar { address, size, is_io: true, is_64bit: false, prefetchable: false }, false)
    } else {
        let bar_type = (bar_low >> 1) & 0x03;
        let prefetchable = (bar_low & 0x08) != 0;

        if bar_type == 0x02 {
            let bar_high = pci_read_config_dword(bus, device, function, offset + 4);
            pci_write_config_dword(bus, device, function, offset, 0xFFFF_FFFF);
            pci_write_config_dword(bus, device, function, offset + 4, 0xFFFF_FFFF);
            let size_low = pci_read_config_dword(bus, device, function, offset);
            let size_high = pci_read_config_dword(bus, device, function, offset + 4);
            pci_write_config_dword(bus, device, function, offset, bar_low);
            pci_write_config_dword(bus, device, function, offset + 4, bar_high);

            let address = ((bar_high as u64) << 32) | ((bar_low & 0xFFFF_FFF0) as u64);
            let size_mask = ((size_high as u64) << 32) | ((size_low & 0xFFFF_FFF0) as u64);
            let size = if size_mask == 0 { 0 } else { (!size_mask).wrapping_add(1) };
            (Bar { address, size, is_io: false, is_64bit: true, prefetchable }, true)
        } else {
            pci_write_config_dword(bus, device, function, offset, 0xFFFF_FFFF);
            let size_mask = pci_read_config_dword(bus, device, function, offset);
            pci_write_config_dword(bus, device, function, offset, bar_low);

            let address = (bar_low & 0xFFFF_FFF0) as u64;
            let size = if size_mask == 0 || size_mask == 0xFFFF_FFFF {
                0
            } else {
                (!(size_mask & 0xFFFF_FFF0)).wrapping_add(1) as u64
            };
            (Bar { address, size, is_io: false, is_64bit: false, prefetchable }, false)
        }
    }
}

fn probe_device(bus: u8, device: u8, function: u8) -> Option<Device> {
    let vendor_device = pci_read_config_dword(bus, device, function, 0x00);
    if vendor_device == 0xFFFF_FFFF {
        return None;
    }

    let vendor_id = vendor_device as u16;
    let device_id = (vendor_device >> 16) as u16;

    let class_reg = pci_read_config_dword(bus, device, function, 0x08);
    let revision_id = class_reg as u8;
    let prog_if = (class_reg >> 8) as u8;
    let subclass = (class_reg >> 16) as u8;
    let class_code = (class_reg >> 24) as u8;

    let header_reg = pci_read_config_dword(bus, device, function, 0x0C);
    let header_type = (header_reg >> 16) as u8;
    let multifunction = (header_type & 0x80) != 0;

    let int_reg = pci_read_config_dword(bus, device, function, 0x3C);
    let interrupt_line = int_reg as u8;
    let interrupt_pin = (int_reg >> 8) as u8;

    let mut bars = [Bar::empty(); 6];
    let mut bar_index = 0u8;
    while bar_index < 6 {
        let (bar, skip_next) = decode_bar(bus, device, function, bar_index);
        bars[bar_index as usize] = bar;
        bar_index += 1;
        if skip_next && bar_index < 6 {
            bar_index += 1;
        }
    }

    Some(Device {
        bus,
        device,
        function,
        vendor_id,
        device_id,
        revision_id,
        class: DeviceClass::from_u8(class_code),
        subclass,
        prog_if,
        interrupt_line,
        interrupt_pin,
        multifunction,
        bars,
    })
}

static PCI_DEVICES: Mutex<Option<Vec<Device>>> = Mutex::new(None);
static PCI_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// `get_targets`: enumerate the whole bus, returning the device count.
pub fn enumerate() -> usize {
    log::info!("pci: starting bus enumeration");
    let mut devices = Vec::new();

    for bus in 0..=MAX_BUS {
        for device in 0..MAX_DEVICE {
            if let Some(dev) = probe_device(bus, device, 0) {
                let multifunction = dev.multifunction;
                log::info!("pci: {} irq={}", dev, dev.interrupt_line);
                devices.push(dev);

                if multifunction {
                    for function in 1..MAX_FUNCTION {
                        if let Some(func_dev) = probe_device(bus, device, function) {
                            log::info!("pci: {} irq={}", func_dev, func_dev.interrupt_line);
                            devices.push(func_dev);
                        }
                    }
                }
            }
        }
    }

    let device_count = devices.len();
    log::info!("pci: enumeration complete, {} device(s)", device_count);
    *PCI_DEVICES.lock() = Some(devices);
    PCI_INITIALIZED.store(true, core::sync::atomic::Ordering::Release);
    device_count
}

/// `get_target_info`: a snapshot of every function discovered.
pub fn get_targets() -> Vec<Device> {
    PCI_DEVICES.lock().clone().unwrap_or_default()
}

pub fn find_device(vendor_id: u16, device_id: u16) -> Option<Device> {
    PCI_DEVICES
        .lock()
        .as_ref()?
        .iter()
        .find(|d| d.vendor_id == vendor_id && d.device_id == device_id)
        .cloned()
}

/// `device_claim`: find the single function matching a class/subclass/
/// prog-if triple, the dispatch key `drivers::mod` uses to pick a driver.
pub fn find_by_class(class: DeviceClass, subclass: u8, prog_if: u8) -> Vec<Device> {
    PCI_DEVICES
        .lock()
        .as_ref()
        .map(|devs| {
            devs.iter()
                .filter(|d| d.class == class && d.subclass == subclass && d.prog_if == prog_if)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

pub fn device_claim(vendor_id: u16, device_id: u16) -> Result<Device, KernelError> {
    find_device(vendor_id, device_id).ok_or(KernelError::NoSuchEntry)
}
