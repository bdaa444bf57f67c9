//! NZXT Smart Device V2 and RGB & Fan Controllers.
//!
//! Three PWM/DC fan headers and two addressable LED channels. The device
//! streams `0x67 0x02` status reports on its own once initialized.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use super::{Model, NZXT_VID, find_model, speed_value};
use crate::color::Rgb;
use crate::config::Context;
use crate::driver::{BusHandle, Driver, HidConnection, Probe, ProbeCandidate, SpeedChannel, StatusItem};
use crate::error::{DriverError, Result};
use crate::mode::{ColorCount, ColorMode, ColorRequest, Direction};
use crate::profile::SpeedSetting;
use crate::transport::{BusKind, DeviceDescriptor, HidBus};

const REPORT_LENGTH: usize = 64;

const MAX_REPLY_ATTEMPTS: usize = 32;

const FAN_COUNT: usize = 3;

/// LEDs addressable by the per-LED (`super-*`) modes.
const MAX_SUPER_LEDS: usize = 40;
const LEDS_PER_CHUNK: usize = 20;

const SPEEDS: [u8; 5] = [0x00, 0x01, 0x02, 0x03, 0x04];

pub static MODELS: [Model; 5] = [
    Model::new(NZXT_VID, 0x2006, "NZXT Smart Device V2", true),
    Model::new(NZXT_VID, 0x200d, "NZXT Smart Device V2", true),
    Model::new(NZXT_VID, 0x2009, "NZXT RGB & Fan Controller", true),
    Model::new(NZXT_VID, 0x200e, "NZXT RGB & Fan Controller", true),
    Model::new(NZXT_VID, 0x2010, "NZXT RGB & Fan Controller", true),
];

// Requests
const CMD_FIRMWARE_INFO: [u8; 2] = [0x10, 0x01];
const CMD_LED_INFO: [u8; 2] = [0x20, 0x03];
const CMD_INIT_INTERVAL: [u8; 5] = [0x70, 0x02, 0x01, 0xb8, 0x01];
const CMD_INIT_COMPLETE: [u8; 2] = [0x70, 0x01];
const CMD_SET_DUTY: [u8; 2] = [0x62, 0x01];
const CMD_SET_COLOR: [u8; 2] = [0x28, 0x03];
const CMD_SUPER_FIRST: [u8; 2] = [0x22, 0x10];
const CMD_SUPER_SECOND: [u8; 2] = [0x22, 0x11];
const CMD_SUPER_COMMIT: [u8; 2] = [0x22, 0xa0];

// Replies
const RESP_FIRMWARE: [u8; 2] = [0x11, 0x01];
const RESP_STATUS: [u8; 2] = [0x67, 0x02];

// =============================================================================
// Channels
// =============================================================================

const SPEED_CHANNELS: [SpeedChannel; 4] = [
    SpeedChannel::fixed("fan1", 0, 100),
    SpeedChannel::fixed("fan2", 0, 100),
    SpeedChannel::fixed("fan3", 0, 100),
    SpeedChannel::fixed("sync", 0, 100),
];

/// Fan indexes a speed channel drives.
fn fan_indexes(channel: &str) -> &'static [usize] {
    match channel {
        "fan1" => &[0],
        "fan2" => &[1],
        "fan3" => &[2],
        _ => &[0, 1, 2],
    }
}

const COLOR_CHANNELS: [&str; 3] = ["led1", "led2", "sync"];

fn color_channel_mask(channel: &str) -> u8 {
    match channel {
        "led1" => 0b001,
        "led2" => 0b010,
        _ => 0b011,
    }
}

// =============================================================================
// Color Modes
// =============================================================================

const MODES: [ColorMode; 28] = [
    ColorMode::new("off", ColorCount::Exact(0)),
    ColorMode::new("fixed", ColorCount::Exact(1)),
    ColorMode::new("super-fixed", ColorCount::UpTo(MAX_SUPER_LEDS)),
    ColorMode::new("fading", ColorCount::Range(2, 8)).animated(),
    ColorMode::new("spectrum-wave", ColorCount::Exact(0)).reversible(),
    ColorMode::new("marquee-3", ColorCount::Exact(1)).reversible(),
    ColorMode::new("marquee-4", ColorCount::Exact(1)).reversible(),
    ColorMode::new("marquee-5", ColorCount::Exact(1)).reversible(),
    ColorMode::new("marquee-6", ColorCount::Exact(1)).reversible(),
    ColorMode::new("covering-marquee", ColorCount::Range(1, 8)).reversible(),
    ColorMode::new("alternating-3", ColorCount::Exact(2)).animated(),
    ColorMode::new("alternating-4", ColorCount::Exact(2)).animated(),
    ColorMode::new("alternating-5", ColorCount::Exact(2)).animated(),
    ColorMode::new("alternating-6", ColorCount::Exact(2)).animated(),
    ColorMode::new("moving-alternating-3", ColorCount::Exact(2)).reversible(),
    ColorMode::new("moving-alternating-4", ColorCount::Exact(2)).reversible(),
    ColorMode::new("moving-alternating-5", ColorCount::Exact(2)).reversible(),
    ColorMode::new("moving-alternating-6", ColorCount::Exact(2)).reversible(),
    ColorMode::new("pulse", ColorCount::Range(1, 8)).animated(),
    ColorMode::new("breathing", ColorCount::Range(1, 8)).animated(),
    ColorMode::new("super-breathing", ColorCount::Range(1, MAX_SUPER_LEDS)).animated(),
    ColorMode::new("candle", ColorCount::Exact(1)),
    ColorMode::new("starry-night", ColorCount::Exact(1)).animated(),
    ColorMode::new("wings", ColorCount::Exact(1)).animated(),
    ColorMode::new("rainbow-flow", ColorCount::Exact(0)).reversible(),
    ColorMode::new("super-rainbow", ColorCount::Exact(0)).reversible(),
    ColorMode::new("rainbow-pulse", ColorCount::Exact(0)).reversible(),
    ColorMode::new("covering-rainbow", ColorCount::Exact(0)).animated(),
];

/// Wire encoding of a mode: mode byte, moving flag, LED group size.
fn mode_code(name: &str) -> (u8, u8, u8) {
    match name {
        "fading" => (0x01, 0x00, 0x00),
        "spectrum-wave" => (0x02, 0x00, 0x00),
        "marquee-3" => (0x03, 0x00, 0x00),
        "marquee-4" => (0x03, 0x00, 0x01),
        "marquee-5" => (0x03, 0x00, 0x02),
        "marquee-6" => (0x03, 0x00, 0x03),
        "covering-marquee" => (0x04, 0x00, 0x00),
        "alternating-3" => (0x05, 0x00, 0x00),
        "alternating-4" => (0x05, 0x00, 0x01),
        "alternating-5" => (0x05, 0x00, 0x02),
        "alternating-6" => (0x05, 0x00, 0x03),
        "moving-alternating-3" => (0x05, 0x01, 0x00),
        "moving-alternating-4" => (0x05, 0x01, 0x01),
        "moving-alternating-5" => (0x05, 0x01, 0x02),
        "moving-alternating-6" => (0x05, 0x01, 0x03),
        "pulse" => (0x06, 0x00, 0x00),
        "breathing" | "super-breathing" => (0x07, 0x00, 0x00),
        "candle" => (0x08, 0x00, 0x00),
        "starry-night" => (0x09, 0x00, 0x00),
        "wings" => (0x0a, 0x00, 0x00),
        "rainbow-flow" => (0x0b, 0x00, 0x00),
        "super-rainbow" => (0x0c, 0x00, 0x00),
        "rainbow-pulse" => (0x0d, 0x00, 0x00),
        "covering-rainbow" => (0x0e, 0x00, 0x00),
        _ => (0x00, 0x00, 0x00),
    }
}

fn is_super_mode(name: &str) -> bool {
    matches!(name, "super-fixed" | "super-breathing")
}

// =============================================================================
// Status Parsing
// =============================================================================

fn fan_control_mode(code: u8) -> Option<&'static str> {
    match code {
        0x01 => Some("DC"),
        0x02 => Some("PWM"),
        _ => None,
    }
}

fn parse_status(msg: &[u8]) -> Vec<StatusItem> {
    let mut status = Vec::new();
    for i in 0..FAN_COUNT {
        let Some(mode) = fan_control_mode(msg[0x10 + i]) else {
            continue;
        };
        let fan = i + 1;
        let rpm = LittleEndian::read_u16(&msg[0x18 + 2 * i..]);
        status.push(StatusItem::text(format!("Fan {} control mode", fan), mode));
        status.push(StatusItem::integer(format!("Fan {} speed", fan), i64::from(rpm), "rpm"));
        status.push(StatusItem::integer(format!("Fan {} duty", fan), i64::from(msg[0x28 + i]), "%"));
    }
    status.push(StatusItem::integer("Noise level", i64::from(msg[0x38]), "dB"));
    status
}

// =============================================================================
// Driver
// =============================================================================

pub struct SmartDevice2 {
    conn: HidConnection,
}

impl SmartDevice2 {
    pub fn new(descriptor: DeviceDescriptor, bus: impl Into<BusHandle<dyn HidBus>>, model: &'static Model) -> Self {
        let descriptor = descriptor.with_description(model.description);
        Self {
            conn: HidConnection::new(descriptor, bus, REPORT_LENGTH, REPORT_LENGTH),
        }
    }

    fn short_report(&self, what: &str, len: usize) -> DriverError {
        DriverError::protocol(
            self.conn.descriptor().identity(),
            format!("short {} report ({} bytes)", what, len),
        )
    }

    fn write_super(&mut self, ctx: &Context, mask: u8, mode: u8, speed: u8, colors: &[Rgb]) -> Result<()> {
        let mut leds = [Rgb::BLACK; MAX_SUPER_LEDS];
        for (led, color) in leds.iter_mut().zip(colors) {
            *led = *color;
        }

        for (header, chunk) in [CMD_SUPER_FIRST, CMD_SUPER_SECOND]
            .iter()
            .zip(leds.chunks(LEDS_PER_CHUNK))
        {
            let mut msg = vec![header[0], header[1], mask, 0x00];
            for led in chunk {
                msg.extend_from_slice(&led.grb_bytes());
            }
            self.conn.write(&msg, ctx.timeout)?;
        }

        let commit = [CMD_SUPER_COMMIT[0], CMD_SUPER_COMMIT[1], mask, 0x00, mode, speed];
        self.conn.write(&commit, ctx.timeout)
    }
}

impl Driver for SmartDevice2 {
    fn name(&self) -> &'static str {
        "smart_device2"
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
        if COLOR_CHANNELS.contains(&channel) { &MODES } else { &[] }
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
        self.conn.clear_enqueued_reports()?;
        let requests: [&[u8]; 4] = [&CMD_FIRMWARE_INFO, &CMD_LED_INFO, &CMD_INIT_INTERVAL, &CMD_INIT_COMPLETE];
        for request in requests {
            self.conn.write(request, ctx.timeout)?;
        }

        let reply = self
            .conn
            .read_until(ctx.timeout, MAX_REPLY_ATTEMPTS, |r| r.starts_with(&RESP_FIRMWARE))?;
        if reply.len() < 0x14 {
            return Err(self.short_report("firmware", reply.len()));
        }
        let firmware = format!("{}.{}.{}", reply[0x11], reply[0x12], reply[0x13]);

        info!(device = %self.conn.descriptor().identity(), firmware = %firmware, "initialized");
        Ok(vec![StatusItem::text("Firmware version", firmware)])
    }

    fn read_status(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        let msg = self
            .conn
            .read_until(ctx.timeout, MAX_REPLY_ATTEMPTS, |r| r.starts_with(&RESP_STATUS))?;
        if msg.len() <= 0x38 {
            return Err(self.short_report("status", msg.len()));
        }
        Ok(parse_status(&msg))
    }

    fn write_speed(&mut self, ctx: &Context, channel: &SpeedChannel, setting: &SpeedSetting) -> Result<()> {
        let SpeedSetting::Fixed(duty) = setting else {
            return Err(DriverError::InvalidValue(format!(
                "channel '{}' only supports fixed duties",
                channel.name
            )));
        };

        let mut msg = vec![CMD_SET_DUTY[0], CMD_SET_DUTY[1], 0x00, 0x00, 0x00, 0x00];
        for &fan in fan_indexes(channel.name) {
            msg[2] |= 1 << fan;
            msg[3 + fan] = *duty;
        }
        debug!(channel = channel.name, duty = *duty, "setting fixed duty");
        self.conn.write(&msg, ctx.timeout)
    }

    fn write_color(&mut self, ctx: &Context, channel: &str, mode: &ColorMode, request: &ColorRequest) -> Result<()> {
        let mask = color_channel_mask(channel);
        let (mode_byte, moving, size) = mode_code(mode.name);
        let speed = speed_value(&SPEEDS, request.speed);

        if is_super_mode(mode.name) {
            return self.write_super(ctx, mask, mode_byte, speed, &request.colors);
        }

        let mut msg = vec![CMD_SET_COLOR[0], CMD_SET_COLOR[1], mask, moving, mode_byte, speed];
        for i in 0..8 {
            let color = request.colors.get(i).copied().unwrap_or(Rgb::BLACK);
            msg.extend_from_slice(&color.grb_bytes());
        }
        let direction = u8::from(request.direction == Direction::Backward);
        msg.extend_from_slice(&[direction, request.colors.len() as u8, size]);
        self.conn.write(&msg, ctx.timeout)
    }
}

// =============================================================================
// Probe
// =============================================================================

pub struct SmartDevice2Probe;

impl Probe for SmartDevice2Probe {
    fn name(&self) -> &'static str {
        "smart_device2"
    }

    fn bus_kind(&self) -> BusKind {
        BusKind::Hid
    }

    fn probe(&self, candidate: &ProbeCandidate<'_>, _ctx: &Context) -> Result<Vec<Box<dyn Driver>>> {
        let (Some(model), Some(bus)) = (find_model(&MODELS, candidate.descriptor), candidate.hid_bus())
        else {
            return Ok(Vec::new());
        };
        Ok(vec![Box::new(SmartDevice2::new(candidate.descriptor.clone(), bus, model))])
    }
}
