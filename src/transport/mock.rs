//! In-memory transports for tests and dry runs.
//!
//! Each mock device shares its state between the bus, every handle opened on
//! it and the test holding the original, so calls made through a driver can
//! be inspected afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    BusKind, ControlRequest, DeviceDescriptor, HidBus, HidHandle, HidRead, SmbusBus, SmbusHandle,
    SmbusRead, Timeout, UsbBus, UsbHandle,
};
use crate::error::{TransportError, TransportErrorKind};

// =============================================================================
// Call Accounting
// =============================================================================

/// Number of calls made against one mock device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub opens: usize,
    pub closes: usize,
    pub reads: usize,
    pub writes: usize,
    pub feature_reads: usize,
    pub feature_writes: usize,
    pub control_transfers: usize,
    pub bulk_reads: usize,
    pub bulk_writes: usize,
    pub smbus_reads: usize,
    pub smbus_writes: usize,
}

impl CallCounts {
    /// Data transfers of any kind.
    pub fn io(&self) -> usize {
        self.reads
            + self.writes
            + self.feature_reads
            + self.feature_writes
            + self.control_transfers
            + self.bulk_reads
            + self.bulk_writes
            + self.smbus_reads
            + self.smbus_writes
    }

    /// Every call, including open and close.
    pub fn total(&self) -> usize {
        self.io() + self.opens + self.closes
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn failure(
    bus: BusKind,
    operation: &'static str,
    descriptor: &DeviceDescriptor,
    kind: TransportErrorKind,
) -> TransportError {
    TransportError::new(bus, operation, descriptor.identity(), kind)
}

// =============================================================================
// HID
// =============================================================================

#[derive(Default)]
struct HidState {
    reads: VecDeque<Vec<u8>>,
    replies: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
    features: HashMap<u8, Vec<u8>>,
    writes: Vec<Vec<u8>>,
    feature_writes: Vec<Vec<u8>>,
    counts: CallCounts,
    fail_open: Option<TransportErrorKind>,
    fail_reads: Option<TransportErrorKind>,
    fail_writes: Option<TransportErrorKind>,
}

/// A scripted HID device.
///
/// Reads pop queued reports; an empty queue behaves like a read timeout
/// (an empty report).
#[derive(Clone)]
pub struct MockHidDevice {
    descriptor: DeviceDescriptor,
    state: Arc<Mutex<HidState>>,
}

impl MockHidDevice {
    pub fn new(vendor_id: u16, product_id: u16, path: impl Into<String>) -> Self {
        Self::from_descriptor(
            DeviceDescriptor::new(BusKind::Hid, vendor_id, product_id).with_address(path),
        )
    }

    pub fn from_descriptor(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            state: Arc::new(Mutex::new(HidState::default())),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn queue_read(&self, report: Vec<u8>) {
        lock(&self.state).reads.push_back(report);
    }

    /// Queue `replies` every time a report starting with `prefix` is written.
    pub fn reply_to(&self, prefix: &[u8], replies: Vec<Vec<u8>>) {
        lock(&self.state).replies.push((prefix.to_vec(), replies));
    }

    pub fn set_feature_report(&self, report_id: u8, report: Vec<u8>) {
        lock(&self.state).features.insert(report_id, report);
    }

    pub fn fail_open(&self, kind: TransportErrorKind) {
        lock(&self.state).fail_open = Some(kind);
    }

    pub fn fail_reads(&self, kind: TransportErrorKind) {
        lock(&self.state).fail_reads = Some(kind);
    }

    pub fn fail_writes(&self, kind: TransportErrorKind) {
        lock(&self.state).fail_writes = Some(kind);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    pub fn feature_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).feature_writes.clone()
    }

    pub fn counts(&self) -> CallCounts {
        lock(&self.state).counts
    }
}

struct MockHidHandle {
    device: MockHidDevice,
    open: bool,
}

impl MockHidHandle {
    fn check_open(&self, operation: &'static str) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(failure(
                BusKind::Hid,
                operation,
                &self.device.descriptor,
                TransportErrorKind::Disconnected,
            ))
        }
    }
}

impl HidRead for MockHidHandle {
    fn read(&mut self, length: usize, _timeout: Timeout) -> Result<Vec<u8>, TransportError> {
        self.check_open("read")?;
        let mut state = lock(&self.device.state);
        state.counts.reads += 1;
        if let Some(kind) = state.fail_reads.clone() {
            return Err(failure(BusKind::Hid, "read", &self.device.descriptor, kind));
        }
        let mut report = state.reads.pop_front().unwrap_or_default();
        report.truncate(length);
        Ok(report)
    }

    fn get_feature_report(
        &mut self,
        report_id: u8,
        length: usize,
        _timeout: Timeout,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_open("get_feature_report")?;
        let mut state = lock(&self.device.state);
        state.counts.feature_reads += 1;
        let mut report = state.features.get(&report_id).cloned().ok_or_else(|| {
            failure(
                BusKind::Hid,
                "get_feature_report",
                &self.device.descriptor,
                TransportErrorKind::Timeout,
            )
        })?;
        report.truncate(length);
        Ok(report)
    }
}

impl HidHandle for MockHidHandle {
    fn write(&mut self, report: &[u8], _timeout: Timeout) -> Result<usize, TransportError> {
        self.check_open("write")?;
        let mut state = lock(&self.device.state);
        state.counts.writes += 1;
        if let Some(kind) = state.fail_writes.clone() {
            return Err(failure(BusKind::Hid, "write", &self.device.descriptor, kind));
        }
        state.writes.push(report.to_vec());

        let queued: Vec<Vec<u8>> = state
            .replies
            .iter()
            .filter(|(prefix, _)| report.starts_with(prefix))
            .flat_map(|(_, replies)| replies.iter().cloned())
            .collect();
        state.reads.extend(queued);

        Ok(report.len())
    }

    fn send_feature_report(
        &mut self,
        report: &[u8],
        _timeout: Timeout,
    ) -> Result<usize, TransportError> {
        self.check_open("send_feature_report")?;
        let mut state = lock(&self.device.state);
        state.counts.feature_writes += 1;
        state.feature_writes.push(report.to_vec());
        Ok(report.len())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            lock(&self.device.state).counts.closes += 1;
        }
    }
}

/// A HID bus holding a fixed set of mock devices.
#[derive(Clone, Default)]
pub struct MockHidBus {
    devices: Vec<MockHidDevice>,
}

impl MockHidBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: MockHidDevice) -> Self {
        self.devices.push(device);
        self
    }
}

impl HidBus for MockHidBus {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.devices.iter().map(|d| d.descriptor.clone()).collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn HidHandle>, TransportError> {
        let device = self
            .devices
            .iter()
            .find(|d| d.descriptor.address == descriptor.address && d.descriptor.bus == descriptor.bus)
            .ok_or_else(|| failure(BusKind::Hid, "open", descriptor, TransportErrorKind::NotFound))?;

        let mut state = lock(&device.state);
        state.counts.opens += 1;
        if let Some(kind) = state.fail_open.clone() {
            return Err(failure(BusKind::Hid, "open", descriptor, kind));
        }
        drop(state);

        Ok(Box::new(MockHidHandle {
            device: device.clone(),
            open: true,
        }))
    }
}

// =============================================================================
// Generic USB
// =============================================================================

#[derive(Default)]
struct UsbState {
    bulk_reads: VecDeque<Vec<u8>>,
    control_reads: VecDeque<Vec<u8>>,
    bulk_writes: Vec<(u8, Vec<u8>)>,
    controls: Vec<(ControlRequest, Vec<u8>)>,
    claimed: Option<u8>,
    counts: CallCounts,
    fail_bulk_reads: Option<TransportErrorKind>,
}

/// A scripted USB device.
///
/// Bulk reads with an empty queue fail with a timeout.
#[derive(Clone)]
pub struct MockUsbDevice {
    descriptor: DeviceDescriptor,
    state: Arc<Mutex<UsbState>>,
}

impl MockUsbDevice {
    pub fn new(vendor_id: u16, product_id: u16, bus: impl Into<String>, address: u8) -> Self {
        Self {
            descriptor: DeviceDescriptor::new(BusKind::Usb, vendor_id, product_id)
                .with_bus(bus)
                .with_address(address.to_string()),
            state: Arc::new(Mutex::new(UsbState::default())),
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_serial(serial);
        self
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn queue_bulk_read(&self, data: Vec<u8>) {
        lock(&self.state).bulk_reads.push_back(data);
    }

    pub fn queue_control_read(&self, data: Vec<u8>) {
        lock(&self.state).control_reads.push_back(data);
    }

    pub fn fail_bulk_reads(&self, kind: TransportErrorKind) {
        lock(&self.state).fail_bulk_reads = Some(kind);
    }

    pub fn bulk_writes(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.state).bulk_writes.clone()
    }

    pub fn control_transfers(&self) -> Vec<(ControlRequest, Vec<u8>)> {
        lock(&self.state).controls.clone()
    }

    pub fn claimed_interface(&self) -> Option<u8> {
        lock(&self.state).claimed
    }

    pub fn counts(&self) -> CallCounts {
        lock(&self.state).counts
    }
}

struct MockUsbHandle {
    device: MockUsbDevice,
    open: bool,
}

impl MockUsbHandle {
    fn state(&self, operation: &'static str) -> Result<MutexGuard<'_, UsbState>, TransportError> {
        if !self.open {
            return Err(failure(
                BusKind::Usb,
                operation,
                &self.device.descriptor,
                TransportErrorKind::Disconnected,
            ));
        }
        Ok(lock(&self.device.state))
    }
}

impl UsbHandle for MockUsbHandle {
    fn control_in(
        &mut self,
        request: ControlRequest,
        length: usize,
        _timeout: Timeout,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state("control_in")?;
        state.counts.control_transfers += 1;
        state.controls.push((request, Vec::new()));
        let mut data = state.control_reads.pop_front().unwrap_or_default();
        data.truncate(length);
        Ok(data)
    }

    fn control_out(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        _timeout: Timeout,
    ) -> Result<usize, TransportError> {
        let mut state = self.state("control_out")?;
        state.counts.control_transfers += 1;
        state.controls.push((request, data.to_vec()));
        Ok(data.len())
    }

    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Timeout,
    ) -> Result<usize, TransportError> {
        let mut state = self.state("bulk_write")?;
        state.counts.bulk_writes += 1;
        state.bulk_writes.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn bulk_read(
        &mut self,
        _endpoint: u8,
        length: usize,
        _timeout: Timeout,
    ) -> Result<Vec<u8>, TransportError> {
        let descriptor = self.device.descriptor.clone();
        let mut state = self.state("bulk_read")?;
        state.counts.bulk_reads += 1;
        if let Some(kind) = state.fail_bulk_reads.clone() {
            return Err(failure(BusKind::Usb, "bulk_read", &descriptor, kind));
        }
        let mut data = state.bulk_reads.pop_front().ok_or_else(|| {
            failure(BusKind::Usb, "bulk_read", &descriptor, TransportErrorKind::Timeout)
        })?;
        data.truncate(length);
        Ok(data)
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut state = lock(&self.device.state);
            state.claimed = None;
            state.counts.closes += 1;
        }
    }
}

/// A USB bus holding a fixed set of mock devices.
#[derive(Clone, Default)]
pub struct MockUsbBus {
    devices: Vec<MockUsbDevice>,
}

impl MockUsbBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: MockUsbDevice) -> Self {
        self.devices.push(device);
        self
    }
}

impl UsbBus for MockUsbBus {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.devices.iter().map(|d| d.descriptor.clone()).collect())
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        interface: u8,
    ) -> Result<Box<dyn UsbHandle>, TransportError> {
        let device = self
            .devices
            .iter()
            .find(|d| d.descriptor.bus == descriptor.bus && d.descriptor.address == descriptor.address)
            .ok_or_else(|| failure(BusKind::Usb, "open", descriptor, TransportErrorKind::NotFound))?;

        let mut state = lock(&device.state);
        state.counts.opens += 1;
        state.claimed = Some(interface);
        drop(state);

        Ok(Box::new(MockUsbHandle {
            device: device.clone(),
            open: true,
        }))
    }
}

// =============================================================================
// SMBus
// =============================================================================

#[derive(Default)]
struct SmbusState {
    bytes: HashMap<(u8, u8), u8>,
    words: HashMap<(u8, u8), u16>,
    blocks: HashMap<(u8, u8), Vec<u8>>,
    writes: Vec<(u8, u8, Vec<u8>)>,
    counts: CallCounts,
}

/// A scripted SMBus adapter with a register map per chip address.
///
/// Reads of unmapped registers fail as if the chip did not acknowledge.
#[derive(Clone)]
pub struct MockSmbusAdapter {
    descriptor: DeviceDescriptor,
    state: Arc<Mutex<SmbusState>>,
}

impl MockSmbusAdapter {
    pub fn new(bus: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            descriptor: DeviceDescriptor::new(BusKind::Smbus, vendor_id, product_id).with_bus(bus),
            state: Arc::new(Mutex::new(SmbusState::default())),
        }
    }

    pub fn with_bus_driver(mut self, driver: impl Into<String>) -> Self {
        self.descriptor = self.descriptor.with_bus_driver(driver);
        self
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn set_byte(&self, address: u8, register: u8, value: u8) {
        lock(&self.state).bytes.insert((address, register), value);
    }

    pub fn set_word(&self, address: u8, register: u8, value: u16) {
        lock(&self.state).words.insert((address, register), value);
    }

    pub fn set_block(&self, address: u8, register: u8, value: Vec<u8>) {
        lock(&self.state).blocks.insert((address, register), value);
    }

    /// Writes as `(address, register, payload)`.
    pub fn writes(&self) -> Vec<(u8, u8, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    pub fn counts(&self) -> CallCounts {
        lock(&self.state).counts
    }
}

struct MockSmbusHandle {
    adapter: MockSmbusAdapter,
    open: bool,
}

impl MockSmbusHandle {
    fn state(&self, operation: &'static str) -> Result<MutexGuard<'_, SmbusState>, TransportError> {
        if !self.open {
            return Err(failure(
                BusKind::Smbus,
                operation,
                &self.adapter.descriptor,
                TransportErrorKind::Disconnected,
            ));
        }
        Ok(lock(&self.adapter.state))
    }

    fn nack(&self, operation: &'static str) -> TransportError {
        failure(
            BusKind::Smbus,
            operation,
            &self.adapter.descriptor,
            TransportErrorKind::NotFound,
        )
    }
}

impl SmbusRead for MockSmbusHandle {
    fn read_byte(&mut self, address: u8, register: u8) -> Result<u8, TransportError> {
        let mut state = self.state("read_byte")?;
        state.counts.smbus_reads += 1;
        let value = state.bytes.get(&(address, register)).copied();
        drop(state);
        value.ok_or_else(|| self.nack("read_byte"))
    }

    fn read_word(&mut self, address: u8, register: u8) -> Result<u16, TransportError> {
        let mut state = self.state("read_word")?;
        state.counts.smbus_reads += 1;
        let value = state.words.get(&(address, register)).copied();
        drop(state);
        value.ok_or_else(|| self.nack("read_word"))
    }

    fn read_block(&mut self, address: u8, register: u8) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state("read_block")?;
        state.counts.smbus_reads += 1;
        let value = state.blocks.get(&(address, register)).cloned();
        drop(state);
        value.ok_or_else(|| self.nack("read_block"))
    }
}

impl SmbusHandle for MockSmbusHandle {
    fn write_byte(&mut self, address: u8, register: u8, value: u8) -> Result<(), TransportError> {
        let mut state = self.state("write_byte")?;
        state.counts.smbus_writes += 1;
        state.bytes.insert((address, register), value);
        state.writes.push((address, register, vec![value]));
        Ok(())
    }

    fn write_word(&mut self, address: u8, register: u8, value: u16) -> Result<(), TransportError> {
        let mut state = self.state("write_word")?;
        state.counts.smbus_writes += 1;
        state.words.insert((address, register), value);
        state.writes.push((address, register, value.to_le_bytes().to_vec()));
        Ok(())
    }

    fn write_block(&mut self, address: u8, register: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state("write_block")?;
        state.counts.smbus_writes += 1;
        state.blocks.insert((address, register), data.to_vec());
        state.writes.push((address, register, data.to_vec()));
        Ok(())
    }

    fn as_read(&mut self) -> &mut dyn SmbusRead {
        self
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            lock(&self.adapter.state).counts.closes += 1;
        }
    }
}

/// An SMBus holding a fixed set of mock adapters.
#[derive(Clone, Default)]
pub struct MockSmbusBus {
    adapters: Vec<MockSmbusAdapter>,
}

impl MockSmbusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: MockSmbusAdapter) -> Self {
        self.adapters.push(adapter);
        self
    }
}

impl SmbusBus for MockSmbusBus {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.adapters.iter().map(|a| a.descriptor.clone()).collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn SmbusHandle>, TransportError> {
        let adapter = self
            .adapters
            .iter()
            .find(|a| a.descriptor.bus == descriptor.bus)
            .ok_or_else(|| failure(BusKind::Smbus, "open", descriptor, TransportErrorKind::NotFound))?;

        lock(&adapter.state).counts.opens += 1;

        Ok(Box::new(MockSmbusHandle {
            adapter: adapter.clone(),
            open: true,
        }))
    }
}
