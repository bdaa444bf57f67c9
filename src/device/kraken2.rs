//! NZXT Kraken X42/X52/X62/X72 and M22.
//!
//! The device streams a status report continuously; no request is needed.
//! Output reports are 65 bytes (report id 0x02 included), input reports 64.
//!
//! When the `kraken2` kernel driver is bound, status is read from hwmon
//! unless direct access is requested.

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use super::{Model, NZXT_VID, find_model, speed_value};
use crate::color::Rgb;
use crate::config::Context;
use crate::driver::{BusHandle, Driver, HidConnection, Probe, ProbeCandidate, SpeedChannel, StatusItem};
use crate::error::{DriverError, Result};
use crate::hwmon::HwmonDevice;
use crate::mode::{ColorCount, ColorMode, ColorRequest, Direction};
use crate::profile::{SpeedSetting, normalize, sample};
use crate::transport::{BusKind, DeviceDescriptor, HidBus};

const WRITE_LENGTH: usize = 65;
const READ_LENGTH: usize = 64;

/// Profiles are capped at this temperature with 100% duty.
const CRITICAL_TEMPERATURE: u8 = 60;

/// Temperatures at which a profile is sampled before upload.
const PROFILE_TEMPS: [u8; 9] = [20, 25, 30, 35, 40, 45, 50, 55, 60];

const SPEEDS: [u8; 5] = [0x00, 0x01, 0x02, 0x03, 0x04];

pub static MODELS: [Model; 2] = [
    Model::new(NZXT_VID, 0x170e, "NZXT Kraken X (X42, X52, X62 or X72)", true),
    Model::new(NZXT_VID, 0x1715, "NZXT Kraken M22", false),
];

// =============================================================================
// Channels
// =============================================================================

const SPEED_CHANNELS: [SpeedChannel; 2] = [
    SpeedChannel::fixed("fan", 25, 100).with_profiles(PROFILE_TEMPS.len()),
    SpeedChannel::fixed("pump", 50, 100).with_profiles(PROFILE_TEMPS.len()),
];

/// Profile base register, fixed-duty register.
fn speed_registers(channel: &str) -> (u8, u8) {
    match channel {
        "pump" => (0xc0, 0x40),
        _ => (0x80, 0x00),
    }
}

const COLOR_CHANNELS: [&str; 3] = ["sync", "logo", "ring"];

fn color_channel_id(channel: &str) -> u8 {
    match channel {
        "logo" => 0x01,
        "ring" => 0x02,
        _ => 0x00,
    }
}

// =============================================================================
// Color Modes
// =============================================================================

const SHARED_MODES: [ColorMode; 8] = [
    ColorMode::new("off", ColorCount::Exact(0)),
    ColorMode::new("fixed", ColorCount::Exact(1)),
    ColorMode::new("super-fixed", ColorCount::Range(1, 9)),
    ColorMode::new("fading", ColorCount::Range(2, 8)).animated(),
    ColorMode::new("spectrum-wave", ColorCount::Exact(0)).reversible(),
    ColorMode::new("breathing", ColorCount::Range(1, 8)).animated(),
    ColorMode::new("super-breathing", ColorCount::Range(1, 9)).animated(),
    ColorMode::new("pulse", ColorCount::Range(1, 8)).animated(),
];

const RING_MODES: [ColorMode; 19] = [
    SHARED_MODES[0],
    SHARED_MODES[1],
    SHARED_MODES[2],
    SHARED_MODES[3],
    SHARED_MODES[4],
    SHARED_MODES[5],
    SHARED_MODES[6],
    SHARED_MODES[7],
    ColorMode::new("marquee-3", ColorCount::Exact(1)).reversible(),
    ColorMode::new("marquee-4", ColorCount::Exact(1)).reversible(),
    ColorMode::new("marquee-5", ColorCount::Exact(1)).reversible(),
    ColorMode::new("marquee-6", ColorCount::Exact(1)).reversible(),
    ColorMode::new("covering-marquee", ColorCount::Range(1, 8)).reversible(),
    ColorMode::new("alternating", ColorCount::Exact(2)).animated(),
    ColorMode::new("moving-alternating", ColorCount::Exact(2)).reversible(),
    ColorMode::new("tai-chi", ColorCount::Exact(2)).animated(),
    ColorMode::new("water-cooler", ColorCount::Exact(0)).animated(),
    ColorMode::new("loading", ColorCount::Exact(1)).animated(),
    ColorMode::new("super-wave", ColorCount::Range(1, 8)).reversible(),
];

/// Wire encoding of a mode: mode byte, variant bits, LED group size bits.
fn mode_code(name: &str) -> (u8, u8, u8) {
    match name {
        "fading" => (0x01, 0x00, 0x00),
        "spectrum-wave" => (0x02, 0x00, 0x00),
        "marquee-3" => (0x03, 0x00, 0x00),
        "marquee-4" => (0x03, 0x00, 0x08),
        "marquee-5" => (0x03, 0x00, 0x10),
        "marquee-6" => (0x03, 0x00, 0x18),
        "covering-marquee" => (0x04, 0x00, 0x00),
        "alternating" => (0x05, 0x00, 0x00),
        "moving-alternating" => (0x05, 0x08, 0x00),
        "breathing" | "super-breathing" => (0x06, 0x00, 0x00),
        "pulse" => (0x07, 0x00, 0x00),
        "tai-chi" => (0x08, 0x00, 0x00),
        "water-cooler" => (0x09, 0x00, 0x00),
        "loading" => (0x0a, 0x00, 0x00),
        "super-wave" => (0x0d, 0x00, 0x00),
        _ => (0x00, 0x00, 0x00),
    }
}

/// LED colors for each animation step: logo first, then the eight ring LEDs.
fn color_steps(mode: &str, colors: &[Rgb]) -> Vec<[Rgb; 9]> {
    match mode {
        "super-fixed" | "super-breathing" | "super-wave" => {
            let mut leds = [Rgb::BLACK; 9];
            for (led, color) in leds.iter_mut().zip(colors) {
                *led = *color;
            }
            vec![leds]
        }
        _ if colors.is_empty() => vec![[Rgb::BLACK; 9]],
        _ => colors.iter().map(|c| [*c; 9]).collect(),
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Driver for the Kraken X42/X52/X62/X72 and M22.
pub struct Kraken2 {
    conn: HidConnection,
    model: &'static Model,
    hwmon: Option<HwmonDevice>,
}

impl Kraken2 {
    pub fn new(descriptor: DeviceDescriptor, bus: impl Into<BusHandle<dyn HidBus>>, model: &'static Model) -> Self {
        let descriptor = descriptor.with_description(model.description);
        Self {
            conn: HidConnection::new(descriptor, bus, WRITE_LENGTH, READ_LENGTH),
            model,
            hwmon: None,
        }
    }

    pub fn with_hwmon(mut self, hwmon: Option<HwmonDevice>) -> Self {
        self.hwmon = hwmon;
        self
    }

    fn read_report(&mut self, ctx: &Context) -> Result<Vec<u8>> {
        let msg = self.conn.read(ctx.timeout)?;
        if msg.len() < 0x0f {
            return Err(DriverError::protocol(
                self.conn.descriptor().identity(),
                format!("short status report ({} bytes)", msg.len()),
            ));
        }
        Ok(msg)
    }

    fn firmware(msg: &[u8]) -> String {
        format!(
            "{}.{}.{}",
            msg[0x0b],
            BigEndian::read_u16(&msg[0x0c..0x0e]),
            msg[0x0e]
        )
    }

    fn status_from_hwmon(hwmon: &HwmonDevice) -> Vec<StatusItem> {
        let mut status = Vec::new();
        if let Some(temp) = hwmon.read_milli("temp1_input") {
            status.push(StatusItem::float("Liquid temperature", temp, "°C"));
        }
        if let Some(rpm) = hwmon.read_int("fan1_input") {
            status.push(StatusItem::integer("Fan speed", rpm, "rpm"));
        }
        if let Some(rpm) = hwmon.read_int("fan2_input") {
            status.push(StatusItem::integer("Pump speed", rpm, "rpm"));
        }
        status
    }
}

impl Driver for Kraken2 {
    fn name(&self) -> &'static str {
        "kraken2"
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        self.conn.descriptor()
    }

    fn speed_channels(&self) -> &[SpeedChannel] {
        if self.model.cooling { &SPEED_CHANNELS } else { &[] }
    }

    fn color_channels(&self) -> &[&'static str] {
        &COLOR_CHANNELS
    }

    fn color_modes(&self, channel: &str) -> &[ColorMode] {
        match channel {
            "ring" => &RING_MODES,
            "logo" | "sync" => &SHARED_MODES,
            _ => &[],
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    fn open(&mut self, _ctx: &Context) -> Result<()> {
        self.conn.open()
    }

    fn close(&mut self) {
        self.conn.close();
    }

    fn init_device(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        if !self.model.cooling {
            return Ok(Vec::new());
        }
        let msg = self.read_report(ctx)?;
        Ok(vec![StatusItem::text("Firmware version", Self::firmware(&msg))])
    }

    fn read_status(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        if !self.model.cooling {
            return Ok(Vec::new());
        }

        if !ctx.direct_access
            && let Some(hwmon) = &self.hwmon
        {
            debug!(hwmon = %hwmon.path.display(), "reading status from hwmon");
            return Ok(Self::status_from_hwmon(hwmon));
        }

        let msg = self.read_report(ctx)?;
        Ok(vec![
            StatusItem::float(
                "Liquid temperature",
                f64::from(msg[1]) + f64::from(msg[2]) / 10.0,
                "°C",
            ),
            StatusItem::integer("Fan speed", i64::from(BigEndian::read_u16(&msg[3..5])), "rpm"),
            StatusItem::integer("Pump speed", i64::from(BigEndian::read_u16(&msg[5..7])), "rpm"),
            StatusItem::text("Firmware version", Self::firmware(&msg)),
        ])
    }

    fn write_speed(&mut self, ctx: &Context, channel: &SpeedChannel, setting: &SpeedSetting) -> Result<()> {
        let (profile_base, fixed_register) = speed_registers(channel.name);
        match setting {
            SpeedSetting::Fixed(duty) => {
                self.conn
                    .write(&[0x02, 0x4d, fixed_register, 0x00, *duty], ctx.timeout)
            }
            SpeedSetting::Profile(points) => {
                let normalized = normalize(points, CRITICAL_TEMPERATURE);
                let duties = sample(&normalized, PROFILE_TEMPS[0]..=CRITICAL_TEMPERATURE)?;
                for (i, temp) in PROFILE_TEMPS.iter().enumerate() {
                    let duty = duties[usize::from(temp - PROFILE_TEMPS[0])]
                        .clamp(channel.min_duty, channel.max_duty);
                    self.conn
                        .write(&[0x02, 0x4d, profile_base + i as u8, *temp, duty], ctx.timeout)?;
                }
                Ok(())
            }
        }
    }

    fn write_color(&mut self, ctx: &Context, channel: &str, mode: &ColorMode, request: &ColorRequest) -> Result<()> {
        let (mode_byte, variant, size) = mode_code(mode.name);
        let direction = if request.direction == Direction::Backward { 0x10 } else { 0x00 };
        let byte2 = variant | direction | color_channel_id(channel);
        let speed = speed_value(&SPEEDS, request.speed);

        for (step, leds) in color_steps(mode.name, &request.colors).iter().enumerate() {
            let byte4 = speed | ((step as u8) << 5) | size;
            let mut msg = vec![0x02, 0x4c, byte2, mode_byte, byte4];
            msg.extend_from_slice(&leds[0].grb_bytes());
            for led in &leds[1..] {
                msg.extend_from_slice(&led.rgb_bytes());
            }
            self.conn.write(&msg, ctx.timeout)?;
        }
        Ok(())
    }
}

// =============================================================================
// Probe
// =============================================================================

pub struct Kraken2Probe;

impl Probe for Kraken2Probe {
    fn name(&self) -> &'static str {
        "kraken2"
    }

    fn bus_kind(&self) -> BusKind {
        BusKind::Hid
    }

    fn probe(&self, candidate: &ProbeCandidate<'_>, ctx: &Context) -> Result<Vec<Box<dyn Driver>>> {
        let (Some(model), Some(bus)) = (find_model(&MODELS, candidate.descriptor), candidate.hid_bus())
        else {
            return Ok(Vec::new());
        };

        let hwmon = HwmonDevice::find_for_hidraw(&ctx.sysfs_root, &candidate.descriptor.address);
        debug!(device = %candidate.descriptor.identity(), model = model.description, "kraken2 found");
        Ok(vec![Box::new(
            Kraken2::new(candidate.descriptor.clone(), bus, model).with_hwmon(hwmon),
        )])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::mock::{MockHidBus, MockHidDevice};

    fn kraken(device: &MockHidDevice) -> Kraken2 {
        let bus: Arc<dyn HidBus> = Arc::new(MockHidBus::new().with_device(device.clone()));
        Kraken2::new(device.descriptor().clone(), bus, &MODELS[0])
    }

    fn status_report() -> Vec<u8> {
        let mut msg = vec![0u8; 64];
        msg[0x01] = 31;
        msg[0x02] = 4;
        msg[0x03..0x05].copy_from_slice(&1200u16.to_be_bytes());
        msg[0x05..0x07].copy_from_slice(&2500u16.to_be_bytes());
        msg[0x0b] = 6;
        msg[0x0c..0x0e].copy_from_slice(&0u16.to_be_bytes());
        msg[0x0e] = 2;
        msg
    }

    #[test]
    fn test_status_from_stream() {
        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        device.queue_read(status_report());
        let mut kraken = kraken(&device);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let status = kraken.get_status(&ctx).unwrap();
        assert_eq!(status.len(), 4);
        assert_eq!(status[0], StatusItem::float("Liquid temperature", 31.4, "°C"));
        assert_eq!(status[1], StatusItem::integer("Fan speed", 1200, "rpm"));
        assert_eq!(status[2], StatusItem::integer("Pump speed", 2500, "rpm"));
        assert_eq!(status[3], StatusItem::text("Firmware version", "6.0.2"));
    }

    #[test]
    fn test_status_prefers_hwmon() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("class/hidraw/hidraw0/device/hwmon/hwmon2");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("name"), "kraken2\n").unwrap();
        std::fs::write(dir.join("temp1_input"), "30500\n").unwrap();
        std::fs::write(dir.join("fan1_input"), "900\n").unwrap();
        std::fs::write(dir.join("fan2_input"), "2000\n").unwrap();

        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        device.queue_read(status_report());
        let hwmon = HwmonDevice::find_for_hidraw(root.path(), "/dev/hidraw0");
        let mut kraken = kraken(&device).with_hwmon(hwmon);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let status = kraken.get_status(&ctx).unwrap();
        assert_eq!(status[0], StatusItem::float("Liquid temperature", 30.5, "°C"));
        assert_eq!(device.counts().reads, 0);

        let direct = ctx.clone().with_direct_access(true);
        let status = kraken.get_status(&direct).unwrap();
        assert_eq!(status[1], StatusItem::integer("Fan speed", 1200, "rpm"));
        assert_eq!(device.counts().reads, 1);
    }

    #[test]
    fn test_fixed_pump_speed() {
        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        let mut kraken = kraken(&device);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        kraken.set_speed(&ctx, "pump", &SpeedSetting::Fixed(70)).unwrap();
        let writes = device.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), WRITE_LENGTH);
        assert_eq!(&writes[0][..5], &[0x02, 0x4d, 0x40, 0x00, 70]);

        assert!(kraken.set_speed(&ctx, "pump", &SpeedSetting::Fixed(30)).is_err());
        assert_eq!(device.writes().len(), 1);
    }

    #[test]
    fn test_fan_profile_upload() {
        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        let mut kraken = kraken(&device);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let profile = SpeedSetting::Profile(vec![(20, 30), (40, 50), (50, 80)]);
        kraken.set_speed(&ctx, "fan", &profile).unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), PROFILE_TEMPS.len());
        assert_eq!(&writes[0][..5], &[0x02, 0x4d, 0x80, 20, 30]);
        assert_eq!(&writes[4][..5], &[0x02, 0x4d, 0x84, 40, 50]);
        assert_eq!(&writes[8][..5], &[0x02, 0x4d, 0x88, 60, 100]);
    }

    #[test]
    fn test_fixed_color_on_ring() {
        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        let mut kraken = kraken(&device);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let request = ColorRequest::parse("fixed", &["ff0000"], None, None).unwrap();
        kraken.set_color(&ctx, "ring", &request).unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(&writes[0][..5], &[0x02, 0x4c, 0x02, 0x00, 0x02]);
        // logo is sent green-red-blue
        assert_eq!(&writes[0][5..8], &[0x00, 0xff, 0x00]);
        assert_eq!(&writes[0][8..11], &[0xff, 0x00, 0x00]);
    }

    #[test]
    fn test_backward_marquee() {
        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        let mut kraken = kraken(&device);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let request =
            ColorRequest::parse("backwards-marquee-5", &["00ff00"], Some("fastest"), None).unwrap();
        kraken.set_color(&ctx, "ring", &request).unwrap();

        let writes = device.writes();
        assert_eq!(&writes[0][2..5], &[0x12, 0x03, 0x04 | 0x10]);
    }

    #[test]
    fn test_fading_steps() {
        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        let mut kraken = kraken(&device);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let request = ColorRequest::parse("fading", &["ff0000", "0000ff", "00ff00"], None, None).unwrap();
        kraken.set_color(&ctx, "sync", &request).unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2][4], 0x02 | (2 << 5));
    }

    #[test]
    fn test_ring_only_mode_rejected_on_logo() {
        let device = MockHidDevice::new(NZXT_VID, 0x170e, "/dev/hidraw0");
        let mut kraken = kraken(&device);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let request = ColorRequest::parse("tai-chi", &["ff0000", "0000ff"], None, None).unwrap();
        assert!(matches!(
            kraken.set_color(&ctx, "logo", &request),
            Err(DriverError::UnsupportedMode { .. })
        ));
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_m22_has_no_cooling() {
        let device = MockHidDevice::new(NZXT_VID, 0x1715, "/dev/hidraw0");
        let bus: Arc<dyn HidBus> = Arc::new(MockHidBus::new().with_device(device.clone()));
        let mut kraken = Kraken2::new(device.descriptor().clone(), bus, &MODELS[1]);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        assert!(kraken.speed_channels().is_empty());
        assert!(kraken.get_status(&ctx).unwrap().is_empty());
        assert!(matches!(
            kraken.set_speed(&ctx, "fan", &SpeedSetting::Fixed(50)),
            Err(DriverError::UnsupportedChannel { .. })
        ));
    }
}
