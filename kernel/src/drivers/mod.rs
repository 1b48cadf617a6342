//! Device drivers subsystem.
//!
//! PCI enumeration runs first; every storage and USB host-controller
//! driver then probes the enumerated device list for the class/subclass/
//! prog-if triple it owns. A driver finding no matching device is simply
//! a no-op, so boards without a given controller never pay more than one
//! `find_by_class` scan for it.

pub mod ahci;
pub mod ata;
pub mod dma;
pub mod pci;
pub mod usb;

/// Initialize the driver subsystem.
///
/// Enumerates PCI devices, then dispatches each storage/USB driver against
/// the class codes it claims. Returns the PCI device count (not the number
/// of drivers that attached — see each driver's own `init()` return value
/// for that).
pub fn init() -> usize {
    log::info!("Initializing driver subsystem...");

    // Enumerate PCI bus and detect devices
    let device_count = pci::enumerate();

    let ata_drives = ata::init();
    let ahci_ports = ahci::init();
    let usb_devices = usb::init();

    log::info!(
        "driver subsystem initialized: {} ATA drive(s), {} AHCI port(s), {} USB device(s)",
        ata_drives,
        ahci_ports,
        usb_devices
    );
    device_count
}
