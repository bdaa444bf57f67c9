//! SMBus transport through the Linux `i2c-dev` interface.
//!
//! Adapters are listed from sysfs; chips behind them are never scanned.
//! Transactions are bounded by the kernel adapter's own timeout.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{BusKind, DeviceDescriptor, SmbusBus, SmbusHandle};
#[cfg(target_os = "linux")]
use super::SmbusRead;
use crate::error::{TransportError, TransportErrorKind};

/// System SMBus adapters exposed as `/dev/i2c-*`.
#[derive(Debug, Clone)]
pub struct I2cDevBus {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for I2cDevBus {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cDevBus {
    pub fn new() -> Self {
        Self::with_roots("/sys", "/dev")
    }

    /// Use alternative sysfs and device roots.
    pub fn with_roots(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn describe_adapter(&self, entry: &Path, bus: &str) -> DeviceDescriptor {
        let parent = entry.join("device");
        let vendor = read_hex_id(&parent.join("vendor")).unwrap_or(0);
        let product = read_hex_id(&parent.join("device")).unwrap_or(0);

        let mut descriptor = DeviceDescriptor::new(BusKind::Smbus, vendor, product).with_bus(bus);
        if let Ok(name) = fs::read_to_string(entry.join("name")) {
            descriptor = descriptor.with_description(name.trim());
        }
        if let Some(driver) = fs::read_link(parent.join("driver"))
            .ok()
            .and_then(|link| link.file_name().map(|n| n.to_string_lossy().into_owned()))
        {
            descriptor = descriptor.with_bus_driver(driver);
        }
        descriptor
    }
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u16::from_str_radix(digits, 16).ok()
}

impl SmbusBus for I2cDevBus {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let root = self.sysfs_root.join("bus/i2c/devices");
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %root.display(), "no i2c sysfs tree");
                return Ok(Vec::new());
            }
            Err(e) => return Err(TransportError::from_io(BusKind::Smbus, "enumerate", "i2c", &e)),
        };

        let mut adapters = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("i2c-") {
                continue;
            }
            let descriptor = self.describe_adapter(&entry.path(), &name);
            trace!(device = %descriptor.identity(), "smbus adapter enumerated");
            adapters.push(descriptor);
        }

        Ok(adapters)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn SmbusHandle>, TransportError> {
        let node = self.dev_root.join(&descriptor.bus);
        open_adapter(&node, descriptor.identity())
    }
}

#[cfg(not(target_os = "linux"))]
fn open_adapter(_node: &Path, identity: String) -> Result<Box<dyn SmbusHandle>, TransportError> {
    Err(TransportError::new(
        BusKind::Smbus,
        "open",
        identity,
        TransportErrorKind::Io("SMBus is only supported on Linux".into()),
    ))
}

#[cfg(target_os = "linux")]
fn open_adapter(node: &Path, identity: String) -> Result<Box<dyn SmbusHandle>, TransportError> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(node)
        .map_err(|e| TransportError::from_io(BusKind::Smbus, "open", identity.as_str(), &e))?;
    debug!(device = %identity, node = %node.display(), "smbus adapter opened");

    Ok(Box::new(linux::I2cDevHandle::new(file, identity)))
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::File;
    use std::os::fd::AsRawFd;

    use super::*;

    const I2C_SLAVE: u64 = 0x0703;
    const I2C_SMBUS: u64 = 0x0720;

    const I2C_SMBUS_READ: u8 = 1;
    const I2C_SMBUS_WRITE: u8 = 0;

    const I2C_SMBUS_BYTE_DATA: u32 = 2;
    const I2C_SMBUS_WORD_DATA: u32 = 3;
    const I2C_SMBUS_BLOCK_DATA: u32 = 5;

    const I2C_SMBUS_BLOCK_MAX: usize = 32;

    #[repr(C)]
    union SmbusData {
        byte: u8,
        word: u16,
        block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
    }

    #[repr(C)]
    struct SmbusIoctlData {
        read_write: u8,
        command: u8,
        size: u32,
        data: *mut SmbusData,
    }

    pub struct I2cDevHandle {
        file: Option<File>,
        identity: String,
        current_address: Option<u8>,
    }

    impl I2cDevHandle {
        pub fn new(file: File, identity: String) -> Self {
            Self {
                file: Some(file),
                identity,
                current_address: None,
            }
        }

        fn fd(&self, operation: &'static str) -> Result<i32, TransportError> {
            self.file.as_ref().map(|f| f.as_raw_fd()).ok_or_else(|| {
                TransportError::new(
                    BusKind::Smbus,
                    operation,
                    self.identity.as_str(),
                    TransportErrorKind::Disconnected,
                )
            })
        }

        fn last_os_error(&self, operation: &'static str) -> TransportError {
            let err = std::io::Error::last_os_error();
            TransportError::from_io(BusKind::Smbus, operation, self.identity.as_str(), &err)
        }

        fn select(&mut self, operation: &'static str, address: u8) -> Result<i32, TransportError> {
            let fd = self.fd(operation)?;
            if self.current_address != Some(address) {
                // SAFETY: fd is an open i2c-dev node; I2C_SLAVE takes the address by value.
                let ret = unsafe { libc::ioctl(fd, I2C_SLAVE as _, libc::c_ulong::from(address)) };
                if ret < 0 {
                    return Err(self.last_os_error(operation));
                }
                self.current_address = Some(address);
            }
            Ok(fd)
        }

        fn transact(
            &mut self,
            operation: &'static str,
            address: u8,
            read_write: u8,
            command: u8,
            size: u32,
            data: &mut SmbusData,
        ) -> Result<(), TransportError> {
            let fd = self.select(operation, address)?;
            let mut args = SmbusIoctlData {
                read_write,
                command,
                size,
                data: data as *mut SmbusData,
            };
            // SAFETY: args points at a live, correctly laid out i2c_smbus_ioctl_data.
            let ret = unsafe { libc::ioctl(fd, I2C_SMBUS as _, &mut args as *mut SmbusIoctlData) };
            if ret < 0 {
                return Err(self.last_os_error(operation));
            }
            trace!(device = %self.identity, operation, address, command, "smbus transaction");
            Ok(())
        }
    }

    impl SmbusRead for I2cDevHandle {
        fn read_byte(&mut self, address: u8, register: u8) -> Result<u8, TransportError> {
            let mut data = SmbusData { word: 0 };
            self.transact("read_byte", address, I2C_SMBUS_READ, register, I2C_SMBUS_BYTE_DATA, &mut data)?;
            // SAFETY: the kernel filled the byte member.
            Ok(unsafe { data.byte })
        }

        fn read_word(&mut self, address: u8, register: u8) -> Result<u16, TransportError> {
            let mut data = SmbusData { word: 0 };
            self.transact("read_word", address, I2C_SMBUS_READ, register, I2C_SMBUS_WORD_DATA, &mut data)?;
            // SAFETY: the kernel filled the word member.
            Ok(unsafe { data.word })
        }

        fn read_block(&mut self, address: u8, register: u8) -> Result<Vec<u8>, TransportError> {
            let mut data = SmbusData {
                block: [0; I2C_SMBUS_BLOCK_MAX + 2],
            };
            self.transact("read_block", address, I2C_SMBUS_READ, register, I2C_SMBUS_BLOCK_DATA, &mut data)?;
            // SAFETY: the kernel filled the block member; byte 0 is the length.
            let block = unsafe { data.block };
            let len = usize::from(block[0]).min(I2C_SMBUS_BLOCK_MAX);
            Ok(block[1..=len].to_vec())
        }
    }

    impl SmbusHandle for I2cDevHandle {
        fn write_byte(&mut self, address: u8, register: u8, value: u8) -> Result<(), TransportError> {
            let mut data = SmbusData { byte: value };
            self.transact("write_byte", address, I2C_SMBUS_WRITE, register, I2C_SMBUS_BYTE_DATA, &mut data)
        }

        fn write_word(&mut self, address: u8, register: u8, value: u16) -> Result<(), TransportError> {
            let mut data = SmbusData { word: value };
            self.transact("write_word", address, I2C_SMBUS_WRITE, register, I2C_SMBUS_WORD_DATA, &mut data)
        }

        fn write_block(&mut self, address: u8, register: u8, bytes: &[u8]) -> Result<(), TransportError> {
            if bytes.len() > I2C_SMBUS_BLOCK_MAX {
                return Err(TransportError::new(
                    BusKind::Smbus,
                    "write_block",
                    self.identity.as_str(),
                    TransportErrorKind::Io(format!(
                        "block of {} bytes exceeds SMBus limit of {}",
                        bytes.len(),
                        I2C_SMBUS_BLOCK_MAX
                    )),
                ));
            }
            let mut block = [0u8; I2C_SMBUS_BLOCK_MAX + 2];
            block[0] = bytes.len() as u8;
            block[1..=bytes.len()].copy_from_slice(bytes);
            let mut data = SmbusData { block };
            self.transact("write_block", address, I2C_SMBUS_WRITE, register, I2C_SMBUS_BLOCK_DATA, &mut data)
        }

        fn as_read(&mut self) -> &mut dyn SmbusRead {
            self
        }

        fn close(&mut self) {
            if self.file.take().is_some() {
                self.current_address = None;
                debug!(device = %self.identity, "smbus adapter closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_adapters_from_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let adapter = root.path().join("bus/i2c/devices/i2c-3");
        fs::create_dir_all(adapter.join("device")).unwrap();
        fs::write(adapter.join("name"), "SMBus I801 adapter at efa0\n").unwrap();
        fs::write(adapter.join("device/vendor"), "0x8086\n").unwrap();
        fs::write(adapter.join("device/device"), "0xa323\n").unwrap();
        // chips behind an adapter are not adapters
        fs::create_dir_all(root.path().join("bus/i2c/devices/3-0050")).unwrap();

        let bus = I2cDevBus::with_roots(root.path(), root.path().join("dev"));
        let adapters = bus.enumerate().unwrap();

        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].bus, "i2c-3");
        assert_eq!(adapters[0].vendor_id, 0x8086);
        assert_eq!(adapters[0].product_id, 0xa323);
        assert_eq!(adapters[0].description, "SMBus I801 adapter at efa0");
    }

    #[test]
    fn test_missing_sysfs_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let bus = I2cDevBus::with_roots(root.path().join("nope"), root.path());
        assert!(bus.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_open_missing_node_fails() {
        let root = tempfile::tempdir().unwrap();
        let bus = I2cDevBus::with_roots(root.path(), root.path());
        let descriptor = DeviceDescriptor::new(BusKind::Smbus, 0x8086, 0xa323).with_bus("i2c-9");
        assert!(bus.open(&descriptor).is_err());
    }
}
