//! Per-bus connection state shared by drivers.
//!
//! Each connection owns the bus handle and the descriptor it was opened
//! from, tracks open/closed state, and closes itself when dropped. Drivers
//! compose one of these instead of talking to the adapter traits directly.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::driver::BusHandle;
use crate::error::{DriverError, Result, TransportError, TransportErrorKind};
use crate::transport::{
    BusKind, ControlRequest, DeviceDescriptor, HidBus, HidHandle, SmbusBus, SmbusHandle, Timeout,
    UsbBus, UsbHandle,
};

/// Upper bound on reports discarded by a single drain.
const MAX_DRAINED_REPORTS: usize = 256;

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

// =============================================================================
// HID
// =============================================================================

/// An HID device with fixed-size input and output reports.
pub struct HidConnection {
    descriptor: DeviceDescriptor,
    bus: Arc<dyn HidBus>,
    handle: Option<Box<dyn HidHandle>>,
    write_length: usize,
    read_length: usize,
}

impl HidConnection {
    /// # Arguments
    /// * `write_length` - Output report size, report id included
    /// * `read_length` - Input report size
    pub fn new(
        descriptor: DeviceDescriptor,
        bus: impl Into<BusHandle<dyn HidBus>>,
        write_length: usize,
        read_length: usize,
    ) -> Self {
        Self {
            descriptor,
            bus: bus.into().into_inner(),
            handle: None,
            write_length,
            read_length,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn open(&mut self) -> Result<()> {
        if self.handle.is_none() {
            self.handle = Some(self.bus.open(&self.descriptor)?);
            debug!(device = %self.descriptor.identity(), "hid device opened");
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!(device = %self.descriptor.identity(), "hid device closed");
        }
    }

    fn handle(&mut self) -> Result<&mut Box<dyn HidHandle>> {
        self.handle.as_mut().ok_or(DriverError::NotConnected)
    }

    /// Write one report, zero-padded to the output report length.
    pub fn write(&mut self, data: &[u8], timeout: Timeout) -> Result<()> {
        let mut report = data.to_vec();
        if report.len() < self.write_length {
            report.resize(self.write_length, 0);
        }
        trace!(device = %self.descriptor.identity(), data = %hex(data), "hid write");
        self.handle()?.write(&report, timeout)?;
        Ok(())
    }

    /// Read one input report.
    ///
    /// # Errors
    /// A `Timeout` transport error when nothing arrives in time.
    pub fn read(&mut self, timeout: Timeout) -> Result<Vec<u8>> {
        let length = self.read_length;
        let report = self.handle()?.read(length, timeout)?;
        if report.is_empty() {
            return Err(TransportError::new(
                BusKind::Hid,
                "read",
                self.descriptor.identity(),
                TransportErrorKind::Timeout,
            )
            .into());
        }
        trace!(device = %self.descriptor.identity(), data = %hex(&report), "hid read");
        Ok(report)
    }

    /// Read reports until one satisfies `accept`, discarding the rest.
    ///
    /// At most `attempts` reports are examined.
    pub fn read_until(
        &mut self,
        timeout: Timeout,
        attempts: usize,
        accept: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<u8>> {
        for _ in 0..attempts {
            let report = self.read(timeout)?;
            if accept(&report) {
                return Ok(report);
            }
            trace!(device = %self.descriptor.identity(), "discarding unrelated report");
        }
        Err(DriverError::protocol(
            self.descriptor.identity(),
            format!("no expected reply within {} reports", attempts),
        ))
    }

    /// Discard input reports queued before the next request.
    pub fn clear_enqueued_reports(&mut self) -> Result<usize> {
        let length = self.read_length;
        let handle = self.handle()?;
        let mut drained = 0;
        while drained < MAX_DRAINED_REPORTS {
            if handle.read(length, Timeout::DRAIN)?.is_empty() {
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            trace!(device = %self.descriptor.identity(), drained, "stale reports discarded");
        }
        Ok(drained)
    }

    pub fn get_feature_report(&mut self, report_id: u8, length: usize, timeout: Timeout) -> Result<Vec<u8>> {
        Ok(self.handle()?.get_feature_report(report_id, length, timeout)?)
    }

    pub fn send_feature_report(&mut self, data: &[u8], timeout: Timeout) -> Result<()> {
        trace!(device = %self.descriptor.identity(), data = %hex(data), "hid feature report");
        self.handle()?.send_feature_report(data, timeout)?;
        Ok(())
    }
}

impl Drop for HidConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Generic USB
// =============================================================================

/// A USB device with one claimed interface.
pub struct UsbConnection {
    descriptor: DeviceDescriptor,
    bus: Arc<dyn UsbBus>,
    interface: u8,
    handle: Option<Box<dyn UsbHandle>>,
}

impl UsbConnection {
    pub fn new(descriptor: DeviceDescriptor, bus: impl Into<BusHandle<dyn UsbBus>>, interface: u8) -> Self {
        Self {
            descriptor,
            bus: bus.into().into_inner(),
            interface,
            handle: None,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn open(&mut self) -> Result<()> {
        if self.handle.is_none() {
            self.handle = Some(self.bus.open(&self.descriptor, self.interface)?);
            debug!(
                device = %self.descriptor.identity(),
                interface = self.interface,
                "usb device opened"
            );
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!(device = %self.descriptor.identity(), "usb device closed");
        }
    }

    fn handle(&mut self) -> Result<&mut Box<dyn UsbHandle>> {
        self.handle.as_mut().ok_or(DriverError::NotConnected)
    }

    pub fn control_in(&mut self, request: ControlRequest, length: usize, timeout: Timeout) -> Result<Vec<u8>> {
        Ok(self.handle()?.control_in(request, length, timeout)?)
    }

    pub fn control_out(&mut self, request: ControlRequest, data: &[u8], timeout: Timeout) -> Result<()> {
        trace!(device = %self.descriptor.identity(), request = ?request, data = %hex(data), "usb control out");
        self.handle()?.control_out(request, data, timeout)?;
        Ok(())
    }

    pub fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Timeout) -> Result<()> {
        trace!(device = %self.descriptor.identity(), endpoint, data = %hex(data), "usb bulk write");
        self.handle()?.bulk_write(endpoint, data, timeout)?;
        Ok(())
    }

    pub fn bulk_read(&mut self, endpoint: u8, length: usize, timeout: Timeout) -> Result<Vec<u8>> {
        let data = self.handle()?.bulk_read(endpoint, length, timeout)?;
        trace!(device = %self.descriptor.identity(), endpoint, data = %hex(&data), "usb bulk read");
        Ok(data)
    }
}

impl Drop for UsbConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// SMBus
// =============================================================================

/// An open SMBus adapter.
pub struct SmbusConnection {
    descriptor: DeviceDescriptor,
    bus: Arc<dyn SmbusBus>,
    handle: Option<Box<dyn SmbusHandle>>,
}

impl SmbusConnection {
    /// `descriptor` names the adapter, not the chip.
    pub fn new(descriptor: DeviceDescriptor, bus: impl Into<BusHandle<dyn SmbusBus>>) -> Self {
        Self {
            descriptor,
            bus: bus.into().into_inner(),
            handle: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn open(&mut self) -> Result<()> {
        if self.handle.is_none() {
            self.handle = Some(self.bus.open(&self.descriptor)?);
            debug!(adapter = %self.descriptor.bus, "smbus adapter opened");
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!(adapter = %self.descriptor.bus, "smbus adapter closed");
        }
    }

    fn handle(&mut self) -> Result<&mut Box<dyn SmbusHandle>> {
        self.handle.as_mut().ok_or(DriverError::NotConnected)
    }

    pub fn read_byte(&mut self, address: u8, register: u8) -> Result<u8> {
        Ok(self.handle()?.read_byte(address, register)?)
    }

    pub fn read_word(&mut self, address: u8, register: u8) -> Result<u16> {
        Ok(self.handle()?.read_word(address, register)?)
    }

    pub fn write_byte(&mut self, address: u8, register: u8, value: u8) -> Result<()> {
        trace!(address = %format!("{:#04x}", address), register, value, "smbus write byte");
        Ok(self.handle()?.write_byte(address, register, value)?)
    }

    pub fn write_block(&mut self, address: u8, register: u8, data: &[u8]) -> Result<()> {
        trace!(address = %format!("{:#04x}", address), register, data = %hex(data), "smbus write block");
        Ok(self.handle()?.write_block(address, register, data)?)
    }
}

impl Drop for SmbusConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockHidBus, MockHidDevice};

    fn connection(device: &MockHidDevice) -> HidConnection {
        let bus: Arc<dyn HidBus> = Arc::new(MockHidBus::new().with_device(device.clone()));
        HidConnection::new(device.descriptor().clone(), bus, 65, 64)
    }

    #[test]
    fn test_writes_are_padded() {
        let device = MockHidDevice::new(0x1e71, 0x170e, "/dev/hidraw0");
        let mut conn = connection(&device);
        conn.open().unwrap();
        conn.write(&[0x02, 0x4d], Timeout::DEFAULT).unwrap();

        let writes = device.writes();
        assert_eq!(writes[0].len(), 65);
        assert_eq!(&writes[0][..3], &[0x02, 0x4d, 0x00]);
    }

    #[test]
    fn test_empty_read_is_timeout() {
        let device = MockHidDevice::new(0x1e71, 0x170e, "/dev/hidraw0");
        let mut conn = connection(&device);
        conn.open().unwrap();

        let err = conn.read(Timeout::millis(10)).unwrap_err();
        match err {
            DriverError::Transport(t) => assert!(t.is_transient()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_clear_then_read_until() {
        let device = MockHidDevice::new(0x1e71, 0x2007, "/dev/hidraw1");
        device.queue_read(vec![0x75, 0x02]);
        device.queue_read(vec![0x33, 0x00]);
        device.reply_to(&[0x74, 0x01], vec![vec![0x11, 0x01], vec![0x75, 0x01, 0xaa]]);

        let mut conn = connection(&device);
        conn.open().unwrap();
        assert_eq!(conn.clear_enqueued_reports().unwrap(), 2);

        conn.write(&[0x74, 0x01], Timeout::DEFAULT).unwrap();
        let reply = conn
            .read_until(Timeout::DEFAULT, 4, |r| r.starts_with(&[0x75, 0x01]))
            .unwrap();
        assert_eq!(reply[2], 0xaa);
    }

    #[test]
    fn test_io_after_close_is_not_connected() {
        let device = MockHidDevice::new(0x1e71, 0x170e, "/dev/hidraw0");
        let mut conn = connection(&device);
        conn.open().unwrap();
        conn.close();
        conn.close();

        assert!(matches!(conn.write(&[0], Timeout::DEFAULT), Err(DriverError::NotConnected)));
        assert_eq!(device.counts().closes, 1);
    }

    #[test]
    fn test_drop_closes() {
        let device = MockHidDevice::new(0x1e71, 0x170e, "/dev/hidraw0");
        {
            let mut conn = connection(&device);
            conn.open().unwrap();
        }
        assert_eq!(device.counts().opens, 1);
        assert_eq!(device.counts().closes, 1);
    }
}
