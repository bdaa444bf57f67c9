//! Generic USB transport backed by `nusb`.
//!
//! Control transfers use the blocking helpers; bulk transfers are driven
//! with `futures_lite` and dropped (which cancels them) once the timeout
//! elapses.

use std::future::Future;
use std::time::{Duration, Instant};

use futures_lite::future::{self, block_on};
use nusb::transfer::{Control, ControlType, RequestBuffer, TransferError};
use tracing::{debug, trace};

use super::{
    BusKind, ControlRequest, DeviceDescriptor, Recipient, RequestType, Timeout, UsbBus, UsbHandle,
};
use crate::error::{TransportError, TransportErrorKind};

/// Poll interval while waiting for a bulk transfer.
const BULK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// System USB bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBus;

impl NusbBus {
    pub fn new() -> Self {
        Self
    }
}

fn usb_bus_name(bus_number: u8) -> String {
    format!("usb{}", bus_number)
}

impl UsbBus for NusbBus {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let devices = nusb::list_devices()
            .map_err(|e| TransportError::from_io(BusKind::Usb, "enumerate", "usb", &e))?;

        Ok(devices
            .map(|info| {
                let mut descriptor =
                    DeviceDescriptor::new(BusKind::Usb, info.vendor_id(), info.product_id())
                        .with_bus(usb_bus_name(info.bus_number()))
                        .with_address(info.device_address().to_string())
                        .with_release(info.device_version());
                if let Some(serial) = info.serial_number().filter(|s| !s.is_empty()) {
                    descriptor = descriptor.with_serial(serial);
                }
                if let Some(product) = info.product_string().filter(|s| !s.is_empty()) {
                    descriptor = descriptor.with_description(product);
                }
                trace!(device = %descriptor.identity(), "usb device enumerated");
                descriptor
            })
            .collect())
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        interface: u8,
    ) -> Result<Box<dyn UsbHandle>, TransportError> {
        let identity = descriptor.identity();
        let io_err = |op: &'static str, e: std::io::Error| {
            TransportError::from_io(BusKind::Usb, op, identity.as_str(), &e)
        };

        let info = nusb::list_devices()
            .map_err(|e| io_err("open", e))?
            .find(|info| {
                usb_bus_name(info.bus_number()) == descriptor.bus
                    && info.device_address().to_string() == descriptor.address
                    && info.vendor_id() == descriptor.vendor_id
                    && info.product_id() == descriptor.product_id
            })
            .ok_or_else(|| {
                TransportError::new(
                    BusKind::Usb,
                    "open",
                    identity.as_str(),
                    TransportErrorKind::NotFound,
                )
            })?;

        let device = info.open().map_err(|e| io_err("open", e))?;

        // Unconfigured devices get their first configuration.
        if device.active_configuration().is_err() {
            let first = device
                .configurations()
                .next()
                .map(|config| config.configuration_value())
                .unwrap_or(1);
            debug!(device = %identity, configuration = first, "setting usb configuration");
            device
                .set_configuration(first)
                .map_err(|e| io_err("set_configuration", e))?;
        }

        let claimed = device
            .claim_interface(interface)
            .map_err(|e| io_err("claim_interface", e))?;
        debug!(device = %identity, interface, "usb interface claimed");

        Ok(Box::new(NusbHandle {
            interface: Some(claimed),
            identity,
        }))
    }
}

/// An open `nusb` device with one claimed interface.
pub struct NusbHandle {
    interface: Option<nusb::Interface>,
    identity: String,
}

impl NusbHandle {
    fn interface(&self, operation: &'static str) -> Result<&nusb::Interface, TransportError> {
        self.interface.as_ref().ok_or_else(|| {
            TransportError::new(
                BusKind::Usb,
                operation,
                self.identity.as_str(),
                TransportErrorKind::Disconnected,
            )
        })
    }

    fn error(&self, operation: &'static str, kind: TransportErrorKind) -> TransportError {
        TransportError::new(BusKind::Usb, operation, self.identity.as_str(), kind)
    }
}

fn to_control(request: ControlRequest) -> Control {
    Control {
        control_type: match request.request_type {
            RequestType::Standard => ControlType::Standard,
            RequestType::Class => ControlType::Class,
            RequestType::Vendor => ControlType::Vendor,
        },
        recipient: match request.recipient {
            Recipient::Device => nusb::transfer::Recipient::Device,
            Recipient::Interface => nusb::transfer::Recipient::Interface,
            Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
            Recipient::Other => nusb::transfer::Recipient::Other,
        },
        request: request.request,
        value: request.value,
        index: request.index,
    }
}

fn transfer_error_kind(err: TransferError) -> TransportErrorKind {
    match err {
        // Blocking helpers cancel the transfer when their timeout elapses.
        TransferError::Cancelled => TransportErrorKind::Timeout,
        TransferError::Disconnected => TransportErrorKind::Disconnected,
        TransferError::Stall => TransportErrorKind::Io("endpoint stalled".into()),
        other => TransportErrorKind::Io(other.to_string()),
    }
}

/// Drive `transfer` until it completes or `timeout` elapses.
///
/// Returns `None` on timeout; the transfer is cancelled when dropped.
fn wait_with_timeout<F: Future>(transfer: F, timeout: Timeout) -> Option<F::Output> {
    let deadline = Instant::now() + timeout.as_duration();
    let mut transfer = Box::pin(transfer);

    loop {
        if let Some(output) = block_on(future::poll_once(transfer.as_mut())) {
            return Some(output);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(BULK_POLL_INTERVAL);
    }
}

impl UsbHandle for NusbHandle {
    fn control_in(
        &mut self,
        request: ControlRequest,
        length: usize,
        timeout: Timeout,
    ) -> Result<Vec<u8>, TransportError> {
        let interface = self.interface("control_in")?;
        let mut buf = vec![0u8; length];
        let read = interface
            .control_in_blocking(to_control(request), &mut buf, timeout.as_duration())
            .map_err(|e| self.error("control_in", transfer_error_kind(e)))?;
        buf.truncate(read);
        Ok(buf)
    }

    fn control_out(
        &mut self,
        request: ControlRequest,
        data: &[u8],
        timeout: Timeout,
    ) -> Result<usize, TransportError> {
        let interface = self.interface("control_out")?;
        interface
            .control_out_blocking(to_control(request), data, timeout.as_duration())
            .map_err(|e| self.error("control_out", transfer_error_kind(e)))
    }

    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Timeout,
    ) -> Result<usize, TransportError> {
        let interface = self.interface("bulk_write")?;
        let completion = wait_with_timeout(interface.bulk_out(endpoint, data.to_vec()), timeout)
            .ok_or_else(|| self.error("bulk_write", TransportErrorKind::Timeout))?;
        completion
            .status
            .map_err(|e| self.error("bulk_write", transfer_error_kind(e)))?;
        Ok(completion.data.actual_length())
    }

    fn bulk_read(
        &mut self,
        endpoint: u8,
        length: usize,
        timeout: Timeout,
    ) -> Result<Vec<u8>, TransportError> {
        let interface = self.interface("bulk_read")?;
        let completion =
            wait_with_timeout(interface.bulk_in(endpoint, RequestBuffer::new(length)), timeout)
                .ok_or_else(|| self.error("bulk_read", TransportErrorKind::Timeout))?;
        completion
            .status
            .map_err(|e| self.error("bulk_read", transfer_error_kind(e)))?;
        Ok(completion.data)
    }

    fn close(&mut self) {
        if self.interface.take().is_some() {
            debug!(device = %self.identity, "usb interface released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_transfer_is_timeout() {
        assert_eq!(
            transfer_error_kind(TransferError::Cancelled),
            TransportErrorKind::Timeout
        );
        assert_eq!(
            transfer_error_kind(TransferError::Disconnected),
            TransportErrorKind::Disconnected
        );
    }

    #[test]
    fn test_wait_with_timeout_gives_up() {
        let never = future::pending::<()>();
        assert!(wait_with_timeout(never, Timeout::millis(5)).is_none());

        let ready = future::ready(7);
        assert_eq!(wait_with_timeout(ready, Timeout::millis(5)), Some(7));
    }

    #[test]
    fn test_control_request_mapping() {
        let control = to_control(ControlRequest {
            request_type: RequestType::Vendor,
            recipient: Recipient::Device,
            request: 2,
            value: 1,
            index: 0,
        });
        assert_eq!(control.request, 2);
        assert_eq!(control.value, 1);
    }
}
