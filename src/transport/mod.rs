//! Bus transport adapters.
//!
//! Three bus kinds are supported: generic USB (control and bulk transfers),
//! USB-HID (fixed-size reports) and SMBus/I²C. Adapters only move bytes; they
//! know nothing about device semantics. Every adapter failure is reported as
//! a [`TransportError`] carrying the bus kind, operation and device.

pub mod hid;
pub mod mock;
pub mod smbus;
pub mod usb;

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{DriverError, Result, TransportError};

pub use hid::HidapiBus;
pub use smbus::I2cDevBus;
pub use usb::NusbBus;

// =============================================================================
// Bus Kind
// =============================================================================

/// Kind of bus a device was enumerated on.
///
/// The declaration order is the primary sort key for discovered devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Hid,
    Usb,
    Smbus,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Hid => write!(f, "hid"),
            BusKind::Usb => write!(f, "usb"),
            BusKind::Smbus => write!(f, "smbus"),
        }
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Bounded wait for a single transport call.
///
/// There is no infinite variant: every I/O method of every adapter takes one
/// of these by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeout(Duration);

impl Timeout {
    /// Default for USB control/bulk and HID report transfers.
    pub const DEFAULT: Timeout = Timeout(Duration::from_millis(5000));

    /// Used to drain stale input reports without waiting for new ones.
    pub const DRAIN: Timeout = Timeout(Duration::from_millis(1));

    pub const fn millis(ms: u64) -> Self {
        Timeout(Duration::from_millis(if ms == 0 { 1 } else { ms }))
    }

    /// Build a timeout from user input; zero is rejected.
    pub fn from_millis(ms: u64) -> Result<Self> {
        if ms == 0 {
            return Err(DriverError::InvalidValue(
                "timeout must be at least 1 ms".into(),
            ));
        }
        Ok(Timeout(Duration::from_millis(ms)))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    /// Milliseconds as expected by hidapi.
    pub fn as_millis_i32(self) -> i32 {
        i32::try_from(self.0.as_millis()).unwrap_or(i32::MAX)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// =============================================================================
// Device Descriptor
// =============================================================================

/// Identifying metadata for one enumerated device.
///
/// Immutable once discovery completes; used for matching and display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub bus_kind: BusKind,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub release_number: Option<u16>,
    /// Bus name, e.g. `usb1`, `hid` or `i2c-3`.
    pub bus: String,
    /// Address on the bus: HID path, USB device address or SMBus address.
    pub address: String,
    /// Human-readable description; drivers replace it with the model name.
    pub description: String,
    /// Kernel driver bound to the bus adapter (SMBus only).
    pub bus_driver: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(bus_kind: BusKind, vendor_id: u16, product_id: u16) -> Self {
        Self {
            bus_kind,
            vendor_id,
            product_id,
            serial_number: None,
            release_number: None,
            bus: bus_kind.to_string(),
            address: String::new(),
            description: format!("{:04x}:{:04x}", vendor_id, product_id),
            bus_driver: None,
        }
    }

    pub fn with_bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = bus.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_release(mut self, release: u16) -> Self {
        self.release_number = Some(release);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_bus_driver(mut self, driver: impl Into<String>) -> Self {
        self.bus_driver = Some(driver.into());
        self
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    /// Stable identity string, used in logs and transport errors.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}:{:04x}:{:04x}",
            self.bus_kind, self.bus, self.address, self.vendor_id, self.product_id
        )
    }

    /// Key that survives re-enumeration: serial number when present,
    /// otherwise the bus location.
    pub fn storage_key(&self) -> String {
        let location = match &self.serial_number {
            Some(serial) if !serial.is_empty() => serial.clone(),
            _ => format!("{}_{}", self.bus, self.address),
        };
        sanitize_key(&format!(
            "{:04x}_{:04x}_{}",
            self.vendor_id, self.product_id, location
        ))
    }

    /// Deterministic order: bus kind, then bus, then address (numbers
    /// compared numerically), then the remaining identity fields.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        self.bus_kind
            .cmp(&other.bus_kind)
            .then_with(|| natural_cmp(&self.bus, &other.bus))
            .then_with(|| natural_cmp(&self.address, &other.address))
            .then_with(|| self.vendor_id.cmp(&other.vendor_id))
            .then_with(|| self.product_id.cmp(&other.product_id))
            .then_with(|| self.serial_number.cmp(&other.serial_number))
            .then_with(|| self.release_number.cmp(&other.release_number))
            .then_with(|| self.description.cmp(&other.description))
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.description, self.bus, self.address)
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Compare strings treating embedded decimal runs as numbers, so that
/// `hidraw9` sorts before `hidraw10` and address `3` before `12`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let mut na = String::new();
                while let Some(c) = a.peek().copied().filter(char::is_ascii_digit) {
                    na.push(c);
                    a.next();
                }
                let mut nb = String::new();
                while let Some(c) = b.peek().copied().filter(char::is_ascii_digit) {
                    nb.push(c);
                    b.next();
                }
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

// =============================================================================
// HID
// =============================================================================

/// Read-only half of an open HID device.
pub trait HidRead: Send {
    /// Read one input report; an empty result means nothing arrived in time.
    fn read(&mut self, length: usize, timeout: Timeout) -> std::result::Result<Vec<u8>, TransportError>;

    /// Read a feature report; `report_id` is placed in the first byte.
    fn get_feature_report(
        &mut self,
        report_id: u8,
        length: usize,
        timeout: Timeout,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

/// An open HID device.
pub trait HidHandle: HidRead {
    /// Write one output report; the first byte is the report id.
    fn write(&mut self, report: &[u8], timeout: Timeout) -> std::result::Result<usize, TransportError>;

    fn send_feature_report(
        &mut self,
        report: &[u8],
        timeout: Timeout,
    ) -> std::result::Result<usize, TransportError>;

    fn close(&mut self);
}

/// HID enumeration and open.
pub trait HidBus: Send + Sync {
    fn enumerate(&self) -> std::result::Result<Vec<DeviceDescriptor>, TransportError>;

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> std::result::Result<Box<dyn HidHandle>, TransportError>;
}

// =============================================================================
// Generic USB
// =============================================================================

/// Control transfer request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

/// Control transfer recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup packet fields of a control transfer (direction is implied by the
/// method used).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// An open USB device with one claimed interface.
pub trait UsbHandle: Send {
    fn control_in(
        &mut self,
        request: ControlRequest,
        length: usize,
        timeout: Timeout,
    ) -> std::result::Result<Vec<u8>, TransportError>;

    fn control_out(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        timeout: Timeout,
    ) -> std::result::Result<usize, TransportError>;

    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Timeout,
    ) -> std::result::Result<usize, TransportError>;

    fn bulk_read(
        &mut self,
        endpoint: u8,
        length: usize,
        timeout: Timeout,
    ) -> std::result::Result<Vec<u8>, TransportError>;

    /// Release the claimed interface and close the device.
    fn close(&mut self);
}

/// USB enumeration and open.
pub trait UsbBus: Send + Sync {
    fn enumerate(&self) -> std::result::Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open the device and claim `interface`.
    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        interface: u8,
    ) -> std::result::Result<Box<dyn UsbHandle>, TransportError>;
}

// =============================================================================
// SMBus
// =============================================================================

/// Read-only SMBus access, the only thing a discovery probe gets to see.
pub trait SmbusRead: Send {
    fn read_byte(&mut self, address: u8, register: u8) -> std::result::Result<u8, TransportError>;

    fn read_word(&mut self, address: u8, register: u8) -> std::result::Result<u16, TransportError>;

    fn read_block(
        &mut self,
        address: u8,
        register: u8,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

/// An open SMBus adapter.
///
/// Addresses are only ever touched when a driver asks for them explicitly;
/// there is no scanning.
pub trait SmbusHandle: SmbusRead {
    fn write_byte(
        &mut self,
        address: u8,
        register: u8,
        value: u8,
    ) -> std::result::Result<(), TransportError>;

    fn write_word(
        &mut self,
        address: u8,
        register: u8,
        value: u16,
    ) -> std::result::Result<(), TransportError>;

    fn write_block(
        &mut self,
        address: u8,
        register: u8,
        data: &[u8],
    ) -> std::result::Result<(), TransportError>;

    /// Narrow this handle to its read-only half.
    fn as_read(&mut self) -> &mut dyn SmbusRead;

    fn close(&mut self);
}

/// SMBus adapter enumeration and open.
pub trait SmbusBus: Send + Sync {
    /// List adapters (not the chips behind them).
    fn enumerate(&self) -> std::result::Result<Vec<DeviceDescriptor>, TransportError>;

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> std::result::Result<Box<dyn SmbusHandle>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_ordering() {
        assert_eq!(natural_cmp("hidraw9", "hidraw10"), Ordering::Less);
        assert_eq!(natural_cmp("3", "12"), Ordering::Less);
        assert_eq!(natural_cmp("usb1", "usb1"), Ordering::Equal);
        assert_eq!(natural_cmp("0x58", "0x59"), Ordering::Less);
        assert_eq!(natural_cmp("a", "ab"), Ordering::Less);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(Timeout::from_millis(0).is_err());
        assert_eq!(
            Timeout::from_millis(250).unwrap().as_duration(),
            Duration::from_millis(250)
        );
        assert_eq!(Timeout::default(), Timeout::DEFAULT);
    }

    #[test]
    fn test_storage_key_prefers_serial() {
        let with_serial = DeviceDescriptor::new(BusKind::Hid, 0x1e71, 0x170e)
            .with_address("/dev/hidraw3")
            .with_serial("ABC 123");
        assert_eq!(with_serial.storage_key(), "1e71_170e_ABC_123");

        let without = DeviceDescriptor::new(BusKind::Usb, 0x2433, 0xb200)
            .with_bus("usb2")
            .with_address("7");
        assert_eq!(without.storage_key(), "2433_b200_usb2_7");
    }

    #[test]
    fn test_sort_by_bus_kind_first() {
        let usb = DeviceDescriptor::new(BusKind::Usb, 1, 1).with_address("1");
        let hid = DeviceDescriptor::new(BusKind::Hid, 9, 9).with_address("9");
        assert_eq!(hid.sort_cmp(&usb), Ordering::Less);
    }
}
