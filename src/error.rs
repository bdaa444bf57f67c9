//! Error types for device discovery, validation and communication.
//!
//! Input-validation and gating failures are kept apart from transport and
//! protocol faults: the former never carry transport context and are always
//! raised before any byte reaches a device, the latter always name the bus,
//! operation and device involved.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::mode::ColorCount;
use crate::transport::BusKind;

// =============================================================================
// Transport Errors
// =============================================================================

/// What went wrong at the bus level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No response within the requested timeout.
    Timeout,
    /// The device went away (unplugged, reset, or handle closed).
    Disconnected,
    /// The OS refused access to the device node.
    PermissionDenied,
    /// The device or bus could not be found when opening it.
    NotFound,
    /// Another driver or process holds the device.
    Busy,
    /// Any other backend failure.
    Io(String),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timed out"),
            TransportErrorKind::Disconnected => write!(f, "device disconnected"),
            TransportErrorKind::PermissionDenied => write!(f, "permission denied"),
            TransportErrorKind::NotFound => write!(f, "device not found"),
            TransportErrorKind::Busy => write!(f, "device busy"),
            TransportErrorKind::Io(message) => write!(f, "{}", message),
        }
    }
}

/// Bus-level I/O failure with enough context to decide whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{bus} {operation} failed on {device}: {kind}")]
pub struct TransportError {
    pub bus: BusKind,
    pub operation: &'static str,
    pub device: String,
    pub kind: TransportErrorKind,
}

impl TransportError {
    pub fn new(
        bus: BusKind,
        operation: &'static str,
        device: impl Into<String>,
        kind: TransportErrorKind,
    ) -> Self {
        Self {
            bus,
            operation,
            device: device.into(),
            kind,
        }
    }

    /// Whether repeating the same call could reasonably succeed.
    ///
    /// Only timeouts qualify; a dropped report is transient, an unplugged
    /// device or a permission problem is not.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Timeout)
    }

    /// Known remediation for access problems, if any.
    pub fn remediation(&self) -> Option<&'static str> {
        match (&self.kind, self.bus) {
            (TransportErrorKind::PermissionDenied, BusKind::Smbus) => Some(
                "access to /dev/i2c-* requires root or membership in the i2c group; \
                 load the i2c-dev kernel module if the device node is missing",
            ),
            (TransportErrorKind::PermissionDenied, _) => Some(
                "run with elevated privileges or install udev rules granting access \
                 to the device; on Windows a capture driver may be required",
            ),
            (TransportErrorKind::Busy, _) => Some(
                "another process or kernel driver has claimed the device; \
                 close other control software or unbind the kernel driver",
            ),
            _ => None,
        }
    }

    /// Map an `std::io::Error` from a backend into a transport error.
    pub fn from_io(
        bus: BusKind,
        operation: &'static str,
        device: impl Into<String>,
        err: &std::io::Error,
    ) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            ErrorKind::PermissionDenied => TransportErrorKind::PermissionDenied,
            ErrorKind::NotFound => TransportErrorKind::NotFound,
            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::ConnectionReset => {
                TransportErrorKind::Disconnected
            }
            _ => match err.raw_os_error() {
                // ENODEV / ENXIO: the node exists but the device is gone
                Some(19) | Some(6) => TransportErrorKind::Disconnected,
                // EBUSY
                Some(16) => TransportErrorKind::Busy,
                _ => TransportErrorKind::Io(err.to_string()),
            },
        };

        Self::new(bus, operation, device, kind)
    }
}

// =============================================================================
// Driver Errors
// =============================================================================

/// Coarse classification used for pattern matching by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Validation,
    Gating,
    Selection,
    State,
    Config,
}

/// Main error type for every device operation.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Bus-level I/O failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Device answered with something inconsistent with the request.
    #[error("protocol error on {device}: {message}")]
    Protocol { device: String, message: String },

    /// Channel name not advertised by this device.
    #[error("unsupported channel '{channel}' (supported: {})", .supported.join(", "))]
    UnsupportedChannel {
        channel: String,
        supported: Vec<String>,
    },

    /// Mode name unknown or not available on the channel.
    #[error("unsupported mode '{mode}' for channel '{channel}'")]
    UnsupportedMode { mode: String, channel: String },

    /// Number of colors does not satisfy the mode's arity contract.
    #[error("mode '{mode}' requires {expected} color(s), got {got}")]
    ColorCountMismatch {
        mode: String,
        expected: ColorCount,
        got: usize,
    },

    /// Color token could not be parsed.
    #[error("cannot parse color '{token}': {reason}")]
    ColorParse { token: String, reason: String },

    /// Unknown animation speed token.
    #[error("unknown animation speed '{0}' (use slowest, slower, normal, faster or fastest)")]
    InvalidSpeed(String),

    /// Unknown direction token.
    #[error("unknown direction '{0}' (use forward or backward)")]
    InvalidDirection(String),

    /// Operation requires unsafe features the caller did not enable.
    #[error(
        "operation requires unsafe features that are not enabled: {} (enable with --unsafe {})",
        join(.missing),
        join(.required)
    )]
    UnsafeFeatureNotEnabled {
        required: BTreeSet<String>,
        missing: BTreeSet<String>,
    },

    /// Value outside the device's documented bounds.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Operation attempted on a driver that is not connected.
    #[error("device not connected; call connect() first")]
    NotConnected,

    /// No candidate matched the requested filters.
    #[error("no device matches the available drivers and selection criteria")]
    DeviceNotFound,

    /// More than one candidate matched where exactly one was required.
    #[error("{0} devices match the selection criteria; use --match, --serial or --pick to select one")]
    MultipleDevicesFound(usize),

    /// Settings could not be loaded or saved.
    #[error("configuration error: {0}")]
    Config(String),
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Transport(_) => ErrorKind::Transport,
            DriverError::Protocol { .. } => ErrorKind::Protocol,
            DriverError::UnsupportedChannel { .. }
            | DriverError::UnsupportedMode { .. }
            | DriverError::ColorCountMismatch { .. }
            | DriverError::ColorParse { .. }
            | DriverError::InvalidSpeed(_)
            | DriverError::InvalidDirection(_)
            | DriverError::InvalidValue(_) => ErrorKind::Validation,
            DriverError::UnsafeFeatureNotEnabled { .. } => ErrorKind::Gating,
            DriverError::DeviceNotFound | DriverError::MultipleDevicesFound(_) => {
                ErrorKind::Selection
            }
            DriverError::NotConnected => ErrorKind::State,
            DriverError::Config(_) => ErrorKind::Config,
        }
    }

    /// Raised from caller input alone, before any device I/O.
    pub fn is_pre_io(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Gating)
    }

    /// Remediation hint for the user, when one is known.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            DriverError::Transport(err) => err.remediation(),
            _ => None,
        }
    }

    pub(crate) fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_transient() {
        let timeout = TransportError::new(BusKind::Hid, "read", "hid:1", TransportErrorKind::Timeout);
        let gone = TransportError::new(
            BusKind::Hid,
            "read",
            "hid:1",
            TransportErrorKind::Disconnected,
        );
        assert!(timeout.is_transient());
        assert!(!gone.is_transient());
    }

    #[test]
    fn test_permission_errors_carry_remediation() {
        let err = TransportError::new(
            BusKind::Usb,
            "open",
            "usb:1:4",
            TransportErrorKind::PermissionDenied,
        );
        assert!(err.remediation().unwrap().contains("udev"));

        let smbus = TransportError::new(
            BusKind::Smbus,
            "open",
            "i2c-0",
            TransportErrorKind::PermissionDenied,
        );
        assert!(smbus.remediation().unwrap().contains("i2c"));
    }

    #[test]
    fn test_io_error_mapping() {
        let io = std::io::Error::from_raw_os_error(19);
        let err = TransportError::from_io(BusKind::Hid, "write", "hid:1", &io);
        assert_eq!(err.kind, TransportErrorKind::Disconnected);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = TransportError::from_io(BusKind::Hid, "open", "hid:1", &io);
        assert_eq!(err.kind, TransportErrorKind::PermissionDenied);
    }

    #[test]
    fn test_validation_errors_are_pre_io() {
        let err = DriverError::UnsupportedChannel {
            channel: "fan9".into(),
            supported: vec!["fan1".into()],
        };
        assert!(err.is_pre_io());
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err: DriverError =
            TransportError::new(BusKind::Hid, "read", "hid:1", TransportErrorKind::Timeout).into();
        assert!(!err.is_pre_io());
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_gating_message_names_missing_tokens() {
        let err = DriverError::UnsafeFeatureNotEnabled {
            required: ["smbus".to_string(), "vengeance_rgb".to_string()].into(),
            missing: ["smbus".to_string()].into(),
        };
        let message = err.to_string();
        assert!(message.contains("smbus"));
        assert!(message.contains("--unsafe smbus,vengeance_rgb"));
    }
}
