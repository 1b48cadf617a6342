//! USB host-controller common contract, shared by the OHCI and EHCI
//! drivers: device/speed/transfer-type types, the port connect/reset state
//! machine, and the `UsbHostController` trait each controller implements.
//!
//! Grounded on the original_source SATA/AHCI and IDE drivers' pattern of a
//! thin common contract (`BlockDevice`) with multiple backends; USB gets
//! the same shape since OHCI and EHCI share almost everything but their
//! register/descriptor layout.

pub mod ehci;
pub mod ohci;

use crate::drivers::pci::{self, usb_prog_if, DeviceClass};
use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Setup,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
}

/// One in-flight (or queued) transaction: a single PID/buffer/toggle unit
/// of a larger transfer. Both OHCI TDs and EHCI qTDs are built from one of
/// these at submission time.
#[derive(Debug, Clone, Copy)]
pub struct Transaction {
    pub pid: Pid,
    pub data_toggle: bool,
    pub buffer_len: usize,
}

/// A device discovered on a root-hub port (or, for EHCI, a companion-owned
/// low/full-speed port). Addresses are host-assigned starting at 1; 0 is
/// the default/unaddressed device during enumeration.
#[derive(Debug, Clone, Copy)]
pub struct UsbDevice {
    pub address: u8,
    pub speed: Speed,
    pub max_packet_size: u16,
    pub port: u8,
}

/// Root-hub port connect/reset state machine shared by OHCI and EHCI: on a
/// connection-change interrupt, debounce 100 ms, then drive the
/// controller-specific reset sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disconnected,
    Debouncing,
    Resetting,
    Enabled,
}

/// Debounce window before trusting a connect-change bit, per spec §4.5.
pub const DEBOUNCE_MS: u64 = 100;

/// `UsbHostController`: the operations common to OHCI and EHCI once a
/// transaction has been built into the controller's native descriptor
/// format. Enumeration (`GET_DESCRIPTOR`, `SET_ADDRESS`) is built on top of
/// `submit_control` by the class/enumeration layer, out of scope here.
pub trait UsbHostController: Send + Sync {
    /// Reset and take ownership of the controller (BIOS handoff for EHCI,
    /// ownership-change bit for OHCI).
    fn reset(&self) -> Result<(), KernelError>;

    /// Service a pending interrupt: drain completions, advance the done
    /// queue / overlay state, and report whether this controller raised it.
    fn handle_interrupt(&self) -> bool;

    /// Submit a control transfer (SETUP/DATA*/STATUS) and block the caller
    /// until it completes or fails.
    fn submit_control(&self, device: &UsbDevice, setup: &[u8; 8], data: Option<&mut [u8]>) -> Result<usize, KernelError>;

    /// Submit an interrupt-in transfer, registering `interval_ms` so future
    /// completions repeat without a fresh call (one-shot placement, not a
    /// per-poll submission).
    fn submit_interrupt_in(&self, device: &UsbDevice, endpoint: u8, interval_ms: u8, buf_len: usize) -> Result<(), KernelError>;

    /// Release all driver-side and controller-side state for a device that
    /// disconnected.
    fn device_removed(&self, address: u8);
}

/// Probe the bus for OHCI and EHCI host controllers and bring each one out
/// of reset. Returns the total number of controllers successfully claimed.
pub fn init() -> usize {
    let mut claimed = 0usize;

    let ohci_devices = pci::find_by_class(DeviceClass::SerialBus, usb_prog_if::SUBCLASS_USB, usb_prog_if::OHCI);
    for dev in &ohci_devices {
        if ohci::attach(dev).is_ok() {
            claimed += 1;
        }
    }

    let ehci_devices = pci::find_by_class(DeviceClass::SerialBus, usb_prog_if::SUBCLASS_USB, usb_prog_if::EHCI);
    for dev in &ehci_devices {
        if ehci::attach(dev).is_ok() {
            claimed += 1;
        }
    }

    log::info!("usb: {} host controller(s) claimed", claimed);
    claimed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn default_device_address_is_unaddressed() {
        let d = UsbDevice { address: 0, speed: Speed::Full, max_packet_size: 8, port: 0 };
        assert_eq!(d.address, 0);
    }
}
