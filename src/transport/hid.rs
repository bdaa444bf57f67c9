//! USB-HID transport backed by `hidapi`.

use std::ffi::CString;
use std::sync::Mutex;

use hidapi::{HidApi, HidDevice, HidError};
use tracing::{debug, trace};

use super::{BusKind, DeviceDescriptor, HidBus, HidHandle, HidRead, Timeout};
use crate::error::{TransportError, TransportErrorKind};

/// System HID bus.
///
/// The `HidApi` context is created on first use and reused afterwards.
#[derive(Default)]
pub struct HidapiBus {
    api: Mutex<Option<HidApi>>,
}

impl HidapiBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_api<T>(
        &self,
        operation: &'static str,
        device: &str,
        f: impl FnOnce(&mut HidApi) -> Result<T, HidError>,
    ) -> Result<T, TransportError> {
        let mut guard = self.api.lock().map_err(|_| {
            TransportError::new(
                BusKind::Hid,
                operation,
                device,
                TransportErrorKind::Io("hidapi context poisoned".into()),
            )
        })?;

        if guard.is_none() {
            let api = HidApi::new().map_err(|e| map_hid_error(operation, device, e))?;
            *guard = Some(api);
        }

        match guard.as_mut() {
            Some(api) => f(api).map_err(|e| map_hid_error(operation, device, e)),
            None => Err(TransportError::new(
                BusKind::Hid,
                operation,
                device,
                TransportErrorKind::NotFound,
            )),
        }
    }
}

impl HidBus for HidapiBus {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.with_api("enumerate", "hid", |api| {
            api.refresh_devices()?;

            let mut found: Vec<DeviceDescriptor> = Vec::new();
            for info in api.device_list() {
                let path = info.path().to_string_lossy().into_owned();
                if found.iter().any(|d| d.address == path) {
                    continue;
                }

                let mut descriptor =
                    DeviceDescriptor::new(BusKind::Hid, info.vendor_id(), info.product_id())
                        .with_address(path)
                        .with_release(info.release_number());
                if let Some(serial) = info.serial_number().filter(|s| !s.is_empty()) {
                    descriptor = descriptor.with_serial(serial);
                }
                if let Some(product) = info.product_string().filter(|s| !s.is_empty()) {
                    descriptor = descriptor.with_description(product);
                }

                trace!(
                    device = %descriptor.identity(),
                    interface = info.interface_number(),
                    "hid device enumerated"
                );
                found.push(descriptor);
            }

            Ok(found)
        })
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn HidHandle>, TransportError> {
        let identity = descriptor.identity();
        let path = CString::new(descriptor.address.as_str()).map_err(|_| {
            TransportError::new(
                BusKind::Hid,
                "open",
                identity.as_str(),
                TransportErrorKind::NotFound,
            )
        })?;

        let device = self.with_api("open", &identity, |api| api.open_path(&path))?;
        debug!(device = %identity, "hid device opened");

        Ok(Box::new(HidapiHandle {
            device: Some(device),
            identity,
        }))
    }
}

/// An open `hidapi` device.
pub struct HidapiHandle {
    device: Option<HidDevice>,
    identity: String,
}

impl HidapiHandle {
    fn device(&self, operation: &'static str) -> Result<&HidDevice, TransportError> {
        self.device.as_ref().ok_or_else(|| {
            TransportError::new(
                BusKind::Hid,
                operation,
                self.identity.as_str(),
                TransportErrorKind::Disconnected,
            )
        })
    }
}

impl HidRead for HidapiHandle {
    fn read(&mut self, length: usize, timeout: Timeout) -> Result<Vec<u8>, TransportError> {
        let device = self.device("read")?;
        let mut buf = vec![0u8; length];
        let read = device
            .read_timeout(&mut buf, timeout.as_millis_i32())
            .map_err(|e| map_hid_error("read", &self.identity, e))?;
        buf.truncate(read);
        Ok(buf)
    }

    fn get_feature_report(
        &mut self,
        report_id: u8,
        length: usize,
        _timeout: Timeout,
    ) -> Result<Vec<u8>, TransportError> {
        let device = self.device("get_feature_report")?;
        let mut buf = vec![0u8; length.max(1)];
        buf[0] = report_id;
        let read = device
            .get_feature_report(&mut buf)
            .map_err(|e| map_hid_error("get_feature_report", &self.identity, e))?;
        buf.truncate(read);
        Ok(buf)
    }
}

impl HidHandle for HidapiHandle {
    // hidapi offers no write timeout; the OS bounds interrupt OUT transfers.
    fn write(&mut self, report: &[u8], _timeout: Timeout) -> Result<usize, TransportError> {
        let device = self.device("write")?;
        device
            .write(report)
            .map_err(|e| map_hid_error("write", &self.identity, e))
    }

    fn send_feature_report(
        &mut self,
        report: &[u8],
        _timeout: Timeout,
    ) -> Result<usize, TransportError> {
        let device = self.device("send_feature_report")?;
        device
            .send_feature_report(report)
            .map_err(|e| map_hid_error("send_feature_report", &self.identity, e))?;
        Ok(report.len())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!(device = %self.identity, "hid device closed");
        }
    }
}

fn map_hid_error(operation: &'static str, device: &str, err: HidError) -> TransportError {
    match err {
        HidError::IoError { error } => TransportError::from_io(BusKind::Hid, operation, device, &error),
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            let kind = if lower.contains("permission") || lower.contains("access denied") {
                TransportErrorKind::PermissionDenied
            } else if lower.contains("no such device") || lower.contains("disconnected") {
                TransportErrorKind::Disconnected
            } else if lower.contains("timed out") || lower.contains("timeout") {
                TransportErrorKind::Timeout
            } else if lower.contains("busy") {
                TransportErrorKind::Busy
            } else {
                TransportErrorKind::Io(message)
            };
            TransportError::new(BusKind::Hid, operation, device, kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hid_error_message_mapping() {
        let err = map_hid_error(
            "open",
            "hid:/dev/hidraw0",
            HidError::HidApiError {
                message: "Permission denied".into(),
            },
        );
        assert_eq!(err.kind, TransportErrorKind::PermissionDenied);
        assert!(err.remediation().is_some());

        let err = map_hid_error(
            "read",
            "hid:/dev/hidraw0",
            HidError::HidApiError {
                message: "something odd".into(),
            },
        );
        assert!(matches!(err.kind, TransportErrorKind::Io(ref m) if m.contains("something odd")));
        assert!(!err.is_transient());
    }
}
