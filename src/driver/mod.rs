//! The uniform driver contract.
//!
//! Every device driver implements [`Driver`]. The trait is split in two:
//!
//! - required hooks (`open`, `close`, `init_device`, `read_status`,
//!   `write_speed`, `write_color`) that talk to the hardware and may assume
//!   their inputs have been validated;
//! - provided operations (`connect`, `initialize`, `get_status`,
//!   `set_speed`, `set_color`, `disconnect`) that check connection state,
//!   channel names, unsafe features and value bounds, in that order, before
//!   delegating to a hook.
//!
//! Discovery is a separate capability, [`Probe`]. Probes see descriptors,
//! read-only SMBus access through [`ProbeCandidate::read_smbus`], and opaque
//! [`BusHandle`]s they can only pass on to the drivers they build.

pub mod connection;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Context;
use crate::error::{DriverError, Result};
use crate::mode::{ColorMode, ColorRequest, find_mode, validate_request};
use crate::profile::{SpeedSetting, validate_points};
use crate::transport::{BusKind, DeviceDescriptor, HidBus, SmbusBus, SmbusRead, UsbBus};

pub use connection::{HidConnection, SmbusConnection, UsbConnection};

// =============================================================================
// Status Reporting
// =============================================================================

/// Value of one status entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Float(v) => write!(f, "{:.1}", v),
            StatusValue::Integer(v) => write!(f, "{}", v),
            StatusValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// One `(key, value, unit)` entry returned by `initialize` or `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusItem {
    pub key: String,
    pub value: StatusValue,
    pub unit: &'static str,
}

impl StatusItem {
    pub fn float(key: impl Into<String>, value: f64, unit: &'static str) -> Self {
        Self {
            key: key.into(),
            value: StatusValue::Float(value),
            unit,
        }
    }

    pub fn integer(key: impl Into<String>, value: i64, unit: &'static str) -> Self {
        Self {
            key: key.into(),
            value: StatusValue::Integer(value),
            unit,
        }
    }

    pub fn text(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: StatusValue::Text(value.into()),
            unit: "",
        }
    }
}

impl fmt::Display for StatusItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_empty() {
            write!(f, "{}: {}", self.key, self.value)
        } else {
            write!(f, "{}: {} {}", self.key, self.value, self.unit)
        }
    }
}

// =============================================================================
// Channels And Operations
// =============================================================================

/// A cooling channel and the duty bounds it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpeedChannel {
    pub name: &'static str,
    pub min_duty: u8,
    pub max_duty: u8,
    /// Maximum number of profile points; zero when only fixed duties are
    /// supported.
    pub max_points: usize,
}

impl SpeedChannel {
    pub const fn fixed(name: &'static str, min_duty: u8, max_duty: u8) -> Self {
        Self {
            name,
            min_duty,
            max_duty,
            max_points: 0,
        }
    }

    pub const fn with_profiles(mut self, max_points: usize) -> Self {
        self.max_points = max_points;
        self
    }

    pub fn supports_profiles(&self) -> bool {
        self.max_points > 0
    }

    /// Check a speed setting against this channel's bounds.
    pub fn validate(&self, setting: &SpeedSetting) -> Result<()> {
        match setting {
            SpeedSetting::Fixed(duty) => {
                if *duty < self.min_duty || *duty > self.max_duty {
                    return Err(DriverError::InvalidValue(format!(
                        "duty {}% for channel '{}' is outside {}..={}",
                        duty, self.name, self.min_duty, self.max_duty
                    )));
                }
                Ok(())
            }
            SpeedSetting::Profile(points) => {
                if !self.supports_profiles() {
                    return Err(DriverError::InvalidValue(format!(
                        "channel '{}' only supports fixed duties",
                        self.name
                    )));
                }
                validate_points(self.name, points, self.max_points, self.min_duty..=self.max_duty)
            }
        }
    }
}

/// Driver operations, used to look up unsafe-feature requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Initialize,
    GetStatus,
    SetSpeed,
    SetColor,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Initialize => "initialize",
            Operation::GetStatus => "get_status",
            Operation::SetSpeed => "set_speed",
            Operation::SetColor => "set_color",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Driver
// =============================================================================

/// A connectable device.
pub trait Driver: Send {
    /// Short driver name, e.g. `kraken2`.
    fn name(&self) -> &'static str;

    fn descriptor(&self) -> &DeviceDescriptor;

    /// Model name shown to users.
    fn description(&self) -> &str {
        &self.descriptor().description
    }

    fn speed_channels(&self) -> &[SpeedChannel] {
        &[]
    }

    fn color_channels(&self) -> &[&'static str] {
        &[]
    }

    /// Modes available on `channel`; empty for unknown channels.
    fn color_modes(&self, _channel: &str) -> &[ColorMode] {
        &[]
    }

    /// Unsafe feature tokens `operation` requires on this device.
    fn required_features(&self, _operation: Operation) -> &[&'static str] {
        &[]
    }

    fn is_connected(&self) -> bool;

    // -------------------------------------------------------------------------
    // Hardware hooks
    // -------------------------------------------------------------------------

    /// Open the transport.
    fn open(&mut self, ctx: &Context) -> Result<()>;

    /// Release the transport; must be idempotent.
    fn close(&mut self);

    fn init_device(&mut self, ctx: &Context) -> Result<Vec<StatusItem>>;

    fn read_status(&mut self, ctx: &Context) -> Result<Vec<StatusItem>>;

    /// Apply a validated speed setting.
    fn write_speed(
        &mut self,
        _ctx: &Context,
        channel: &SpeedChannel,
        _setting: &SpeedSetting,
    ) -> Result<()> {
        Err(unsupported_channel(channel.name, self.speed_channels().iter().map(|c| c.name)))
    }

    /// Apply a validated lighting request.
    fn write_color(
        &mut self,
        _ctx: &Context,
        channel: &str,
        _mode: &ColorMode,
        _request: &ColorRequest,
    ) -> Result<()> {
        Err(unsupported_channel(channel, self.color_channels().iter().copied()))
    }

    // -------------------------------------------------------------------------
    // Validated operations
    // -------------------------------------------------------------------------

    /// Connect to the device. Connecting an already connected driver is a
    /// no-op; a failed connect leaves the driver disconnected.
    fn connect(&mut self, ctx: &Context) -> Result<()> {
        check_features(ctx, self.required_features(Operation::Connect), &[])?;
        if self.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.open(ctx) {
            self.close();
            return Err(e);
        }
        debug!(driver = self.name(), device = %self.descriptor().identity(), "connected");
        Ok(())
    }

    /// Disconnect; safe to call any number of times.
    fn disconnect(&mut self) {
        if self.is_connected() {
            debug!(driver = self.name(), device = %self.descriptor().identity(), "disconnecting");
        }
        self.close();
    }

    /// Initialize the device and return firmware/status information.
    fn initialize(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        ensure_connected(self.is_connected())?;
        check_features(ctx, self.required_features(Operation::Initialize), &[])?;
        self.init_device(ctx)
    }

    fn get_status(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        ensure_connected(self.is_connected())?;
        check_features(ctx, self.required_features(Operation::GetStatus), &[])?;
        self.read_status(ctx)
    }

    /// Set a fixed duty or a temperature profile on `channel`.
    fn set_speed(&mut self, ctx: &Context, channel: &str, setting: &SpeedSetting) -> Result<()> {
        ensure_connected(self.is_connected())?;

        let speed_channel = self
            .speed_channels()
            .iter()
            .find(|c| c.name == channel)
            .copied()
            .ok_or_else(|| {
                unsupported_channel(channel, self.speed_channels().iter().map(|c| c.name))
            })?;

        check_features(ctx, self.required_features(Operation::SetSpeed), &[])?;
        speed_channel.validate(setting)?;

        debug!(driver = self.name(), channel, setting = %setting, "setting speed");
        self.write_speed(ctx, &speed_channel, setting)
    }

    /// Apply a lighting mode with its colors to `channel`.
    fn set_color(&mut self, ctx: &Context, channel: &str, request: &ColorRequest) -> Result<()> {
        ensure_connected(self.is_connected())?;

        if !self.color_channels().contains(&channel) {
            return Err(unsupported_channel(channel, self.color_channels().iter().copied()));
        }

        let mode = *find_mode(self.color_modes(channel), channel, &request.mode)?;
        check_features(ctx, self.required_features(Operation::SetColor), mode.requires)?;
        validate_request(&mode, request)?;

        debug!(
            driver = self.name(),
            channel,
            mode = mode.name,
            colors = request.colors.len(),
            "setting color"
        );
        self.write_color(ctx, channel, &mode, request)
    }
}

fn ensure_connected(connected: bool) -> Result<()> {
    if connected {
        Ok(())
    } else {
        Err(DriverError::NotConnected)
    }
}

fn check_features(ctx: &Context, required: &[&str], extra: &[&str]) -> Result<()> {
    let mut all: Vec<&str> = required.to_vec();
    all.extend(extra.iter().filter(|t| !required.contains(t)));
    ctx.unsafe_features.check(&all)
}

fn unsupported_channel<'a>(channel: &str, supported: impl Iterator<Item = &'a str>) -> DriverError {
    DriverError::UnsupportedChannel {
        channel: channel.to_string(),
        supported: supported.map(str::to_string).collect(),
    }
}

// =============================================================================
// Scoped Connections
// =============================================================================

/// A connected driver that disconnects when dropped.
///
/// Disconnect runs exactly once on every exit path, including early returns
/// through `?` and panics.
pub struct ConnectGuard<'a, D: Driver + ?Sized> {
    driver: &'a mut D,
}

impl<'a, D: Driver + ?Sized> ConnectGuard<'a, D> {
    /// Connect `driver` and return a guard over it.
    pub fn connect(driver: &'a mut D, ctx: &Context) -> Result<Self> {
        driver.connect(ctx)?;
        Ok(Self { driver })
    }
}

impl<D: Driver + ?Sized> Deref for ConnectGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.driver
    }
}

impl<D: Driver + ?Sized> DerefMut for ConnectGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.driver
    }
}

impl<D: Driver + ?Sized> Drop for ConnectGuard<'_, D> {
    fn drop(&mut self) {
        self.driver.disconnect();
    }
}

// =============================================================================
// Probing
// =============================================================================

#[derive(Clone)]
enum CandidateBus {
    Hid(Arc<dyn HidBus>),
    Usb(Arc<dyn UsbBus>),
    Smbus(Arc<dyn SmbusBus>),
}

/// A bus that a probe can hand to a driver but cannot open.
///
/// Only connections inside this crate unwrap the handle, so a probe has no
/// path to device I/O other than constructing an (unconnected) driver.
pub struct BusHandle<B: ?Sized>(Arc<B>);

impl<B: ?Sized> BusHandle<B> {
    pub(crate) fn into_inner(self) -> Arc<B> {
        self.0
    }
}

impl<B: ?Sized> Clone for BusHandle<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B: ?Sized> From<Arc<B>> for BusHandle<B> {
    fn from(bus: Arc<B>) -> Self {
        Self(bus)
    }
}

/// One enumerated device offered to a [`Probe`].
pub struct ProbeCandidate<'a> {
    pub descriptor: &'a DeviceDescriptor,
    bus: CandidateBus,
}

impl<'a> ProbeCandidate<'a> {
    pub fn hid(descriptor: &'a DeviceDescriptor, bus: Arc<dyn HidBus>) -> Self {
        Self {
            descriptor,
            bus: CandidateBus::Hid(bus),
        }
    }

    pub fn usb(descriptor: &'a DeviceDescriptor, bus: Arc<dyn UsbBus>) -> Self {
        Self {
            descriptor,
            bus: CandidateBus::Usb(bus),
        }
    }

    pub fn smbus(descriptor: &'a DeviceDescriptor, bus: Arc<dyn SmbusBus>) -> Self {
        Self {
            descriptor,
            bus: CandidateBus::Smbus(bus),
        }
    }

    pub fn bus_kind(&self) -> BusKind {
        self.descriptor.bus_kind
    }

    pub fn hid_bus(&self) -> Option<BusHandle<dyn HidBus>> {
        match &self.bus {
            CandidateBus::Hid(bus) => Some(BusHandle(bus.clone())),
            _ => None,
        }
    }

    pub fn usb_bus(&self) -> Option<BusHandle<dyn UsbBus>> {
        match &self.bus {
            CandidateBus::Usb(bus) => Some(BusHandle(bus.clone())),
            _ => None,
        }
    }

    pub fn smbus_bus(&self) -> Option<BusHandle<dyn SmbusBus>> {
        match &self.bus {
            CandidateBus::Smbus(bus) => Some(BusHandle(bus.clone())),
            _ => None,
        }
    }

    /// Run `f` with read-only access to the SMBus adapter.
    ///
    /// The adapter is opened for the duration of the call and closed
    /// afterwards, whatever `f` returns.
    pub fn read_smbus<T>(&self, f: impl FnOnce(&mut dyn SmbusRead) -> Result<T>) -> Result<T> {
        let CandidateBus::Smbus(bus) = &self.bus else {
            return Err(DriverError::protocol(
                self.descriptor.identity(),
                "not an SMBus adapter",
            ));
        };
        let mut handle = bus.open(self.descriptor)?;
        let result = f(handle.as_read());
        handle.close();
        result
    }
}

/// Discovery capability: recognize devices and build drivers for them.
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    fn bus_kind(&self) -> BusKind;

    /// Unsafe features without which this probe must not touch the bus.
    fn required_features(&self) -> &'static [&'static str] {
        &[]
    }

    /// Drivers for `candidate`, possibly none.
    fn probe(&self, candidate: &ProbeCandidate<'_>, ctx: &Context) -> Result<Vec<Box<dyn Driver>>>;
}

/// Run `probe` against `candidate`, honoring its feature requirements.
///
/// Failures are logged and yield no drivers.
pub(crate) fn run_probe(
    probe: &dyn Probe,
    candidate: &ProbeCandidate<'_>,
    ctx: &Context,
) -> Vec<Box<dyn Driver>> {
    if !ctx.unsafe_features.allows(probe.required_features()) {
        debug!(
            probe = probe.name(),
            device = %candidate.descriptor.identity(),
            required = ?probe.required_features(),
            "skipping probe, unsafe features not enabled"
        );
        return Vec::new();
    }

    match probe.probe(candidate, ctx) {
        Ok(drivers) => drivers,
        Err(e) => {
            warn!(
                probe = probe.name(),
                device = %candidate.descriptor.identity(),
                error = %e,
                "probe failed, device omitted"
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Rgb;
    use crate::gate::UnsafeFeatures;
    use crate::mode::ColorCount;
    use crate::transport::BusKind;

    const CHANNELS: [SpeedChannel; 2] = [
        SpeedChannel::fixed("fan", 25, 100).with_profiles(8),
        SpeedChannel::fixed("pump", 50, 100),
    ];
    const MODES: [ColorMode; 1] = [ColorMode::new("fixed", ColorCount::Exact(1))];

    struct Fake {
        descriptor: DeviceDescriptor,
        connected: bool,
        opens: usize,
        closes: usize,
        writes: usize,
        fail_open: bool,
        gated: bool,
    }

    impl Fake {
        fn new() -> Self {
            Self {
                descriptor: DeviceDescriptor::new(BusKind::Hid, 1, 2).with_address("a"),
                connected: false,
                opens: 0,
                closes: 0,
                writes: 0,
                fail_open: false,
                gated: false,
            }
        }
    }

    impl Driver for Fake {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn descriptor(&self) -> &DeviceDescriptor {
            &self.descriptor
        }

        fn speed_channels(&self) -> &[SpeedChannel] {
            &CHANNELS
        }

        fn color_channels(&self) -> &[&'static str] {
            &["ring"]
        }

        fn color_modes(&self, channel: &str) -> &[ColorMode] {
            if channel == "ring" { &MODES } else { &[] }
        }

        fn required_features(&self, operation: Operation) -> &[&'static str] {
            match operation {
                Operation::SetSpeed if self.gated => &["fake_speed"],
                _ => &[],
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn open(&mut self, _ctx: &Context) -> Result<()> {
            self.opens += 1;
            if self.fail_open {
                return Err(DriverError::protocol("fake", "handshake failed"));
            }
            self.connected = true;
            Ok(())
        }

        fn close(&mut self) {
            if self.connected {
                self.closes += 1;
            }
            self.connected = false;
        }

        fn init_device(&mut self, _ctx: &Context) -> Result<Vec<StatusItem>> {
            Ok(vec![StatusItem::text("Firmware version", "1.0.0")])
        }

        fn read_status(&mut self, _ctx: &Context) -> Result<Vec<StatusItem>> {
            Err(DriverError::protocol("fake", "boom"))
        }

        fn write_speed(&mut self, _: &Context, _: &SpeedChannel, _: &SpeedSetting) -> Result<()> {
            self.writes += 1;
            Ok(())
        }

        fn write_color(&mut self, _: &Context, _: &str, _: &ColorMode, _: &ColorRequest) -> Result<()> {
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_operations_require_connection() {
        let mut fake = Fake::new();
        let ctx = Context::new();
        assert!(matches!(fake.get_status(&ctx), Err(DriverError::NotConnected)));
        assert!(matches!(
            fake.set_speed(&ctx, "fan", &SpeedSetting::Fixed(50)),
            Err(DriverError::NotConnected)
        ));
    }

    #[test]
    fn test_unknown_channel_rejected_before_io() {
        let mut fake = Fake::new();
        let ctx = Context::new();
        fake.connect(&ctx).unwrap();

        let err = fake.set_speed(&ctx, "fan9", &SpeedSetting::Fixed(50)).unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedChannel { ref supported, .. } if supported.len() == 2));
        assert_eq!(fake.writes, 0);
    }

    #[test]
    fn test_gating_precedes_bounds() {
        let mut fake = Fake::new();
        fake.gated = true;
        let ctx = Context::new();
        fake.connect(&ctx).unwrap();

        // out of range, but the missing feature is reported first
        let err = fake.set_speed(&ctx, "pump", &SpeedSetting::Fixed(10)).unwrap_err();
        assert!(matches!(err, DriverError::UnsafeFeatureNotEnabled { .. }));

        let ctx = ctx.with_unsafe_features(UnsafeFeatures::parse("fake_speed"));
        let err = fake.set_speed(&ctx, "pump", &SpeedSetting::Fixed(10)).unwrap_err();
        assert!(matches!(err, DriverError::InvalidValue(_)));
        assert_eq!(fake.writes, 0);
    }

    #[test]
    fn test_profile_on_fixed_only_channel() {
        let mut fake = Fake::new();
        let ctx = Context::new();
        fake.connect(&ctx).unwrap();

        let profile = SpeedSetting::Profile(vec![(20, 60), (40, 100)]);
        assert!(fake.set_speed(&ctx, "pump", &profile).is_err());
        assert!(fake.set_speed(&ctx, "fan", &profile).is_ok());
        assert_eq!(fake.writes, 1);
    }

    #[test]
    fn test_set_color_validation_order() {
        let mut fake = Fake::new();
        let ctx = Context::new();
        fake.connect(&ctx).unwrap();

        let request = ColorRequest::new("fixed", vec![Rgb::BLACK]);
        assert!(matches!(
            fake.set_color(&ctx, "logo", &request),
            Err(DriverError::UnsupportedChannel { .. })
        ));
        assert!(matches!(
            fake.set_color(&ctx, "ring", &ColorRequest::new("disco", vec![])),
            Err(DriverError::UnsupportedMode { .. })
        ));
        assert!(matches!(
            fake.set_color(&ctx, "ring", &ColorRequest::new("fixed", vec![])),
            Err(DriverError::ColorCountMismatch { got: 0, .. })
        ));
        assert_eq!(fake.writes, 0);

        fake.set_color(&ctx, "ring", &request).unwrap();
        assert_eq!(fake.writes, 1);
    }

    #[test]
    fn test_guard_disconnects_once_on_error() {
        let mut fake = Fake::new();
        let ctx = Context::new();

        let result = (|| -> Result<()> {
            let mut guard = ConnectGuard::connect(&mut fake, &ctx)?;
            guard.initialize(&ctx)?;
            guard.get_status(&ctx)?;
            Ok(())
        })();

        assert!(result.is_err());
        assert!(!fake.connected);
        assert_eq!(fake.closes, 1);
    }

    #[test]
    fn test_failed_connect_leaves_driver_disconnected() {
        let mut fake = Fake::new();
        fake.fail_open = true;
        let ctx = Context::new();

        assert!(ConnectGuard::connect(&mut fake, &ctx).is_err());
        assert!(!fake.is_connected());
        fake.disconnect();
        assert_eq!(fake.closes, 0);
    }

    #[test]
    fn test_status_item_display() {
        assert_eq!(StatusItem::float("Liquid temperature", 31.46, "°C").to_string(), "Liquid temperature: 31.5 °C");
        assert_eq!(StatusItem::integer("Fan speed", 1200, "rpm").to_string(), "Fan speed: 1200 rpm");
        assert_eq!(StatusItem::text("Firmware version", "6.0.2").to_string(), "Firmware version: 6.0.2");
    }
}
