//! Asetek 690LC coolers (EVGA CLC, NZXT Kraken X31/X41/X61 and relatives).
//!
//! Raw USB with vendor control requests framing every bulk exchange. The
//! device forgets the pump duty whenever the fan is reconfigured and vice
//! versa, so the last setting of each channel is kept in runtime storage and
//! resent alongside every change.

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info};

use super::{ASETEK_VID, Model, find_model};
use crate::config::Context;
use crate::driver::{BusHandle, Driver, Probe, ProbeCandidate, SpeedChannel, StatusItem, UsbConnection};
use crate::error::{DriverError, Result};
use crate::mode::{ColorCount, ColorMode, ColorRequest};
use crate::profile::{SpeedSetting, normalize};
use crate::transport::{BusKind, ControlRequest, DeviceDescriptor, Recipient, RequestType, UsbBus};

const INTERFACE: u8 = 0;
const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x82;
const READ_LENGTH: usize = 32;

const CRITICAL_TEMPERATURE: u8 = 60;
const PROFILE_POINTS: usize = 6;

pub static MODELS: [Model; 1] = [Model::new(ASETEK_VID, 0xb200, "Asetek 690LC (assuming EVGA CLC)", true)];

// =============================================================================
// Protocol Constants
// =============================================================================

const USBXPRESS_REQUEST: u8 = 0x02;
const USBXPRESS_FLUSH_BUFFERS: u16 = 0x01;
const USBXPRESS_CLEAR_TO_SEND: u16 = 0x02;
const USBXPRESS_NOT_CLEAR_TO_SEND: u16 = 0x04;

const CMD_STATUS: [u8; 4] = [0x14, 0x00, 0x00, 0x00];
const CMD_FAN_PROFILE: u8 = 0x11;
const CMD_FAN_FIXED: u8 = 0x12;
const CMD_PUMP_FIXED: u8 = 0x13;
const CMD_COLOR: u8 = 0x10;
const CMD_RAINBOW: u8 = 0x23;

/// Liquid temperature alert color, red.
const ALERT_COLOR: [u8; 3] = [0xff, 0x00, 0x00];
const ALERT_TEMPERATURE: u8 = 60;

fn usbxpress(value: u16) -> ControlRequest {
    ControlRequest {
        request_type: RequestType::Vendor,
        recipient: Recipient::Device,
        request: USBXPRESS_REQUEST,
        value,
        index: 0,
    }
}

// =============================================================================
// Channels
// =============================================================================

const SPEED_CHANNELS: [SpeedChannel; 2] = [
    SpeedChannel::fixed("fan", 0, 100).with_profiles(PROFILE_POINTS),
    SpeedChannel::fixed("pump", 50, 100),
];

const COLOR_CHANNELS: [&str; 1] = ["logo"];

const MODES: [ColorMode; 6] = [
    ColorMode::new("off", ColorCount::Exact(0)),
    ColorMode::new("fixed", ColorCount::Exact(1)),
    ColorMode::new("fading", ColorCount::Exact(2)).animated(),
    ColorMode::new("blinking", ColorCount::Exact(1)).animated(),
    ColorMode::new("blackout", ColorCount::Exact(1)),
    ColorMode::new("rainbow", ColorCount::Exact(0)).animated(),
];

/// Fan profile reduced to exactly six points ending at the critical
/// temperature.
fn profile_points(points: &[(u8, u8)], channel: &SpeedChannel) -> Vec<(u8, u8)> {
    let mut normalized = normalize(points, CRITICAL_TEMPERATURE);
    if normalized.len() > PROFILE_POINTS {
        let last = normalized.len() - 1;
        normalized.drain(PROFILE_POINTS - 1..last);
    }
    while normalized.len() < PROFILE_POINTS {
        let last = normalized[normalized.len() - 1];
        normalized.push(last);
    }
    normalized
        .into_iter()
        .map(|(temp, duty)| (temp, duty.clamp(channel.min_duty, channel.max_duty)))
        .collect()
}

fn speed_message(channel: &SpeedChannel, setting: &SpeedSetting) -> Vec<u8> {
    match (channel.name, setting) {
        ("pump", SpeedSetting::Fixed(duty)) => vec![CMD_PUMP_FIXED, *duty],
        (_, SpeedSetting::Fixed(duty)) => vec![CMD_FAN_FIXED, *duty],
        (_, SpeedSetting::Profile(points)) => {
            let points = profile_points(points, channel);
            let mut msg = vec![CMD_FAN_PROFILE, 0x00];
            msg.extend(points.iter().map(|(temp, _)| *temp));
            msg.extend(points.iter().map(|(_, duty)| *duty));
            msg
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

pub struct Asetek690Lc {
    conn: UsbConnection,
}

impl Asetek690Lc {
    pub fn new(descriptor: DeviceDescriptor, bus: impl Into<BusHandle<dyn UsbBus>>, model: &'static Model) -> Self {
        let descriptor = descriptor.with_description(model.description);
        Self {
            conn: UsbConnection::new(descriptor, bus, INTERFACE),
        }
    }

    /// Send one message and read the reply, framed by clear-to-send.
    fn transaction(&mut self, ctx: &Context, data: &[u8]) -> Result<Vec<u8>> {
        self.conn
            .control_out(usbxpress(USBXPRESS_CLEAR_TO_SEND), &[], ctx.timeout)?;
        self.conn.bulk_write(ENDPOINT_OUT, data, ctx.timeout)?;
        let reply = self.conn.bulk_read(ENDPOINT_IN, READ_LENGTH, ctx.timeout);
        self.conn
            .control_out(usbxpress(USBXPRESS_NOT_CLEAR_TO_SEND), &[], ctx.timeout)?;
        reply
    }

    fn status_report(&mut self, ctx: &Context) -> Result<Vec<u8>> {
        let msg = self.transaction(ctx, &CMD_STATUS)?;
        if msg.len() < 0x1b {
            return Err(DriverError::protocol(
                self.conn.descriptor().identity(),
                format!("short status report ({} bytes)", msg.len()),
            ));
        }
        Ok(msg)
    }

    fn firmware(msg: &[u8]) -> String {
        msg[0x17..0x1b]
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    fn color_message(mode: &ColorMode, request: &ColorRequest) -> Vec<u8> {
        if mode.name == "rainbow" {
            return vec![CMD_RAINBOW, request.speed.index() as u8 + 1];
        }
        let interval = 5 - request.speed.index() as u8;

        let first = request.colors.first().map(|c| c.rgb_bytes()).unwrap_or([0; 3]);
        let second = request.colors.get(1).map(|c| c.rgb_bytes()).unwrap_or(first);
        let flag = |name: &str| u8::from(mode.name == name);

        let mut msg = vec![CMD_COLOR];
        msg.extend_from_slice(&first);
        msg.extend_from_slice(&second);
        msg.extend_from_slice(&ALERT_COLOR);
        msg.extend_from_slice(&[
            ALERT_TEMPERATURE,
            interval,
            interval,
            flag("blackout"),
            flag("fading"),
            flag("blinking"),
            0x01,
            0x00,
            0x01,
        ]);
        msg
    }
}

impl Driver for Asetek690Lc {
    fn name(&self) -> &'static str {
        "asetek690lc"
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        self.conn.descriptor()
    }

    fn speed_channels(&self) -> &[SpeedChannel] {
        &SPEED_CHANNELS
    }

    fn color_channels(&self) -> &[&'static str] {
        &COLOR_CHANNELS
    }

    fn color_modes(&self, channel: &str) -> &[ColorMode] {
        if channel == "logo" { &MODES } else { &[] }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    fn open(&mut self, ctx: &Context) -> Result<()> {
        self.conn.open()?;
        self.conn
            .control_out(usbxpress(USBXPRESS_FLUSH_BUFFERS), &[], ctx.timeout)
    }

    fn close(&mut self) {
        self.conn.close();
    }

    fn init_device(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        let msg = self.status_report(ctx)?;
        let firmware = Self::firmware(&msg);
        info!(device = %self.conn.descriptor().identity(), firmware = %firmware, "initialized");
        Ok(vec![StatusItem::text("Firmware version", firmware)])
    }

    fn read_status(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        let msg = self.status_report(ctx)?;
        Ok(vec![
            StatusItem::float(
                "Liquid temperature",
                f64::from(msg[10]) + f64::from(msg[14]) / 10.0,
                "°C",
            ),
            StatusItem::integer("Fan speed", i64::from(BigEndian::read_u16(&msg[0..2])), "rpm"),
            StatusItem::integer("Pump speed", i64::from(BigEndian::read_u16(&msg[8..10])), "rpm"),
            StatusItem::text("Firmware version", Self::firmware(&msg)),
        ])
    }

    fn write_speed(&mut self, ctx: &Context, channel: &SpeedChannel, setting: &SpeedSetting) -> Result<()> {
        let storage = ctx.device_storage(self.name(), self.conn.descriptor());
        self.transaction(ctx, &speed_message(channel, setting))?;
        storage.store(channel.name, setting)?;

        for other in SPEED_CHANNELS.iter().filter(|c| c.name != channel.name) {
            if let Some(cached) = storage.load::<SpeedSetting>(other.name) {
                debug!(channel = other.name, setting = %cached, "resending cached setting");
                self.transaction(ctx, &speed_message(other, &cached))?;
            }
        }
        Ok(())
    }

    fn write_color(&mut self, ctx: &Context, _channel: &str, mode: &ColorMode, request: &ColorRequest) -> Result<()> {
        self.transaction(ctx, &Self::color_message(mode, request))?;
        Ok(())
    }
}

// =============================================================================
// Probe
// =============================================================================

pub struct Asetek690LcProbe;

impl Probe for Asetek690LcProbe {
    fn name(&self) -> &'static str {
        "asetek690lc"
    }

    fn bus_kind(&self) -> BusKind {
        BusKind::Usb
    }

    fn probe(&self, candidate: &ProbeCandidate<'_>, _ctx: &Context) -> Result<Vec<Box<dyn Driver>>> {
        let (Some(model), Some(bus)) = (find_model(&MODELS, candidate.descriptor), candidate.usb_bus())
        else {
            return Ok(Vec::new());
        };
        Ok(vec![Box::new(Asetek690Lc::new(candidate.descriptor.clone(), bus, model))])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::mock::{MockUsbBus, MockUsbDevice};

    fn connected(device: &MockUsbDevice, ctx: &Context) -> Asetek690Lc {
        let bus: Arc<dyn UsbBus> = Arc::new(MockUsbBus::new().with_device(device.clone()));
        let mut driver = Asetek690Lc::new(device.descriptor().clone(), bus, &MODELS[0]);
        driver.connect(ctx).unwrap();
        driver
    }

    fn status_reply() -> Vec<u8> {
        let mut msg = vec![0u8; READ_LENGTH];
        msg[0..2].copy_from_slice(&840u16.to_be_bytes());
        msg[8..10].copy_from_slice(&2760u16.to_be_bytes());
        msg[10] = 29;
        msg[14] = 6;
        msg[0x17..0x1b].copy_from_slice(&[2, 10, 0, 0]);
        msg
    }

    #[test]
    fn test_open_claims_interface_and_flushes() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        let _driver = connected(&device, &Context::new());

        assert_eq!(device.claimed_interface(), Some(0));
        let controls = device.control_transfers();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].0.value, USBXPRESS_FLUSH_BUFFERS);
    }

    #[test]
    fn test_status_transaction() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        device.queue_bulk_read(status_reply());
        let ctx = Context::new();
        let mut driver = connected(&device, &ctx);

        let status = driver.get_status(&ctx).unwrap();
        assert_eq!(status[0], StatusItem::float("Liquid temperature", 29.6, "°C"));
        assert_eq!(status[1], StatusItem::integer("Fan speed", 840, "rpm"));
        assert_eq!(status[2], StatusItem::integer("Pump speed", 2760, "rpm"));
        assert_eq!(status[3], StatusItem::text("Firmware version", "2.10.0.0"));

        let values: Vec<u16> = device.control_transfers().iter().map(|(r, _)| r.value).collect();
        assert_eq!(
            values,
            vec![USBXPRESS_FLUSH_BUFFERS, USBXPRESS_CLEAR_TO_SEND, USBXPRESS_NOT_CLEAR_TO_SEND]
        );
        assert_eq!(device.bulk_writes(), vec![(ENDPOINT_OUT, CMD_STATUS.to_vec())]);
    }

    #[test]
    fn test_read_timeout_still_ends_transaction() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        let ctx = Context::new();
        let mut driver = connected(&device, &ctx);

        assert!(matches!(driver.get_status(&ctx), Err(DriverError::Transport(_))));
        let last = device.control_transfers().last().map(|(r, _)| r.value);
        assert_eq!(last, Some(USBXPRESS_NOT_CLEAR_TO_SEND));
    }

    #[test]
    fn test_fan_change_resends_cached_pump() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        for _ in 0..3 {
            device.queue_bulk_read(vec![0u8; READ_LENGTH]);
        }
        let ctx = Context::new();
        let mut driver = connected(&device, &ctx);

        driver.set_speed(&ctx, "pump", &SpeedSetting::Fixed(75)).unwrap();
        driver.set_speed(&ctx, "fan", &SpeedSetting::Fixed(40)).unwrap();

        let payloads: Vec<Vec<u8>> = device.bulk_writes().into_iter().map(|(_, d)| d).collect();
        assert_eq!(payloads, vec![vec![0x13, 75], vec![0x12, 40], vec![0x13, 75]]);
    }

    #[test]
    fn test_failed_speed_is_not_cached() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        let ctx = Context::new();
        let mut driver = connected(&device, &ctx);

        assert!(matches!(
            driver.set_speed(&ctx, "pump", &SpeedSetting::Fixed(75)),
            Err(DriverError::Transport(_))
        ));
        let storage = ctx.device_storage("asetek690lc", device.descriptor());
        assert_eq!(storage.load::<SpeedSetting>("pump"), None);

        device.queue_bulk_read(vec![0u8; READ_LENGTH]);
        driver.set_speed(&ctx, "fan", &SpeedSetting::Fixed(40)).unwrap();

        let payloads: Vec<Vec<u8>> = device.bulk_writes().into_iter().map(|(_, d)| d).collect();
        assert_eq!(payloads, vec![vec![0x13, 75], vec![0x12, 40]]);
        assert_eq!(storage.load::<SpeedSetting>("fan"), Some(SpeedSetting::Fixed(40)));
    }

    #[test]
    fn test_fan_profile_is_six_points() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        device.queue_bulk_read(vec![0u8; READ_LENGTH]);
        let ctx = Context::new();
        let mut driver = connected(&device, &ctx);

        let profile = SpeedSetting::Profile(vec![(25, 20), (35, 50), (45, 70)]);
        driver.set_speed(&ctx, "fan", &profile).unwrap();

        let writes = device.bulk_writes();
        let (_, msg) = &writes[0];
        assert_eq!(msg[..2], [0x11, 0x00]);
        assert_eq!(msg[2..8], [25, 35, 45, 60, 60, 60]);
        assert_eq!(msg[8..14], [20, 50, 70, 100, 100, 100]);
    }

    #[test]
    fn test_fading_logo() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        device.queue_bulk_read(vec![0u8; READ_LENGTH]);
        let ctx = Context::new();
        let mut driver = connected(&device, &ctx);

        let request = ColorRequest::parse("fading", &["ff0000", "0000ff"], Some("faster"), None).unwrap();
        driver.set_color(&ctx, "logo", &request).unwrap();

        let writes = device.bulk_writes();
        let (_, msg) = &writes[0];
        assert_eq!(msg[0], CMD_COLOR);
        assert_eq!(msg[1..7], [0xff, 0, 0, 0, 0, 0xff]);
        assert_eq!(msg[10..16], [60, 2, 2, 0, 1, 0]);
    }

    #[test]
    fn test_rainbow_speed() {
        let device = MockUsbDevice::new(ASETEK_VID, 0xb200, "usb1", 5);
        device.queue_bulk_read(vec![0u8; READ_LENGTH]);
        let ctx = Context::new();
        let mut driver = connected(&device, &ctx);

        let request = ColorRequest::parse::<&str>("rainbow", &[], Some("slowest"), None).unwrap();
        driver.set_color(&ctx, "logo", &request).unwrap();
        assert_eq!(device.bulk_writes()[0].1, vec![CMD_RAINBOW, 1]);
    }
}
