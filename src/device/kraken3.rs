//! NZXT Kraken X53/X63/X73 and Z53/Z63/Z73.
//!
//! Unlike the previous generation these coolers answer requests: status is
//! polled with `0x74 0x01` and arrives as a `0x75 0x01` report, possibly
//! behind unrelated replies that must be skipped.
//!
//! Speed curves are always uploaded as 40 duties, one per degree from 20°C
//! to 59°C; fixed duties are flat curves.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use super::{Model, NZXT_VID, find_model};
use crate::config::Context;
use crate::driver::{BusHandle, Driver, HidConnection, Probe, ProbeCandidate, SpeedChannel, StatusItem};
use crate::error::{DriverError, Result};
use crate::profile::{SpeedSetting, normalize, sample};
use crate::transport::{BusKind, DeviceDescriptor, HidBus};

const REPORT_LENGTH: usize = 64;

const CRITICAL_TEMPERATURE: u8 = 59;
const MIN_CURVE_TEMP: u8 = 20;
const CURVE_POINTS: usize = 40;

/// Reports examined while waiting for one reply.
const MAX_REPLY_ATTEMPTS: usize = 16;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Request firmware info.
const CMD_FIRMWARE_INFO: [u8; 2] = [0x10, 0x01];

/// Request lighting accessory info.
const CMD_LED_INFO: [u8; 2] = [0x20, 0x03];

/// Status update interval; the last byte selects 500 ms.
const CMD_INIT_INTERVAL: [u8; 5] = [0x70, 0x02, 0x01, 0xb8, 0x01];

const CMD_INIT_COMPLETE: [u8; 2] = [0x70, 0x01];

const CMD_REQUEST_STATUS: [u8; 2] = [0x74, 0x01];

/// Header of a speed curve upload: `[0x72, channel id, 40 duties]`.
const CMD_SET_SPEED_HEADER: u8 = 0x72;

const RESP_FIRMWARE: [u8; 2] = [0x11, 0x01];
const RESP_STATUS: [u8; 2] = [0x75, 0x01];
/// Older firmware answers with a shorter layout under these headers.
const RESP_STATUS_ALT: u8 = 0x71;
const RESP_SPEED_ACK: u8 = 0xff;
const RESP_SUB_OK: u8 = 0x01;

/// Reported when the liquid sensor has failed.
const INVALID_TEMP_SENTINEL: [u8; 2] = [0xff, 0xff];

pub static MODELS: [Model; 2] = [
    Model::new(NZXT_VID, 0x2007, "NZXT Kraken X (X53, X63 or X73)", false),
    Model::new(NZXT_VID, 0x3008, "NZXT Kraken Z (Z53, Z63 or Z73)", true),
];

const PUMP_ONLY: [SpeedChannel; 1] = [
    SpeedChannel::fixed("pump", 20, 100).with_profiles(CURVE_POINTS),
];

const PUMP_AND_FAN: [SpeedChannel; 2] = [
    SpeedChannel::fixed("pump", 20, 100).with_profiles(CURVE_POINTS),
    SpeedChannel::fixed("fan", 0, 100).with_profiles(CURVE_POINTS),
];

fn channel_id(channel: &str) -> u8 {
    match channel {
        "fan" => 0x02,
        _ => 0x01,
    }
}

// =============================================================================
// Status Parsing
// =============================================================================

/// Readings decoded from one status report.
#[derive(Debug, Clone, PartialEq)]
struct Readings {
    liquid_temp: f64,
    pump_rpm: u16,
    pump_duty: u8,
    fan_rpm: u16,
    fan_duty: u8,
}

impl Readings {
    fn parse(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < 26 {
            return Err(format!("short status report ({} bytes)", buf.len()));
        }

        if buf[..2] == RESP_STATUS {
            if buf[15..17] == INVALID_TEMP_SENTINEL {
                return Err("invalid temperature reading (0xffff), possible sensor fault".into());
            }
            return Ok(Self {
                liquid_temp: f64::from(buf[15]) + f64::from(buf[16]) / 10.0,
                pump_rpm: LittleEndian::read_u16(&buf[17..19]),
                pump_duty: buf[19],
                fan_rpm: LittleEndian::read_u16(&buf[23..25]),
                fan_duty: buf[25],
            });
        }

        if (buf[0] == RESP_STATUS_ALT || buf[0] == RESP_SPEED_ACK) && buf[1] == RESP_SUB_OK {
            return Ok(Self {
                liquid_temp: f64::from(buf[2]) + f64::from(buf[3]) / 10.0,
                pump_rpm: LittleEndian::read_u16(&buf[5..7]),
                pump_duty: buf[7],
                fan_rpm: LittleEndian::read_u16(&buf[14..16]),
                fan_duty: buf[13],
            });
        }

        Err(format!("unknown status header: [{:#04x}, {:#04x}]", buf[0], buf[1]))
    }
}

fn is_status_reply(buf: &[u8]) -> bool {
    buf.len() >= 2
        && (buf[..2] == RESP_STATUS
            || ((buf[0] == RESP_STATUS_ALT || buf[0] == RESP_SPEED_ACK) && buf[1] == RESP_SUB_OK))
}

// =============================================================================
// Driver
// =============================================================================

/// Driver for the Kraken X53/X63/X73 and Z53/Z63/Z73.
pub struct Kraken3 {
    conn: HidConnection,
    model: &'static Model,
}

impl Kraken3 {
    pub fn new(descriptor: DeviceDescriptor, bus: impl Into<BusHandle<dyn HidBus>>, model: &'static Model) -> Self {
        let descriptor = descriptor.with_description(model.description);
        Self {
            conn: HidConnection::new(descriptor, bus, REPORT_LENGTH, REPORT_LENGTH),
            model,
        }
    }

    fn curve(channel: &SpeedChannel, setting: &SpeedSetting) -> Result<[u8; CURVE_POINTS]> {
        let mut duties = [0u8; CURVE_POINTS];
        match setting {
            SpeedSetting::Fixed(duty) => duties.fill(*duty),
            SpeedSetting::Profile(points) => {
                let normalized = normalize(points, CRITICAL_TEMPERATURE);
                let sampled = sample(&normalized, MIN_CURVE_TEMP..=CRITICAL_TEMPERATURE)?;
                for (slot, duty) in duties.iter_mut().zip(sampled) {
                    *slot = duty.clamp(channel.min_duty, channel.max_duty);
                }
            }
        }
        Ok(duties)
    }
}

impl Driver for Kraken3 {
    fn name(&self) -> &'static str {
        "kraken3"
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        self.conn.descriptor()
    }

    fn speed_channels(&self) -> &[SpeedChannel] {
        if self.model.cooling { &PUMP_AND_FAN } else { &PUMP_ONLY }
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

        self.conn.write(&CMD_FIRMWARE_INFO, ctx.timeout)?;
        let reply = self
            .conn
            .read_until(ctx.timeout, MAX_REPLY_ATTEMPTS, |r| r.starts_with(&RESP_FIRMWARE))?;
        if reply.len() < 0x14 {
            return Err(DriverError::protocol(
                self.conn.descriptor().identity(),
                "short firmware report",
            ));
        }
        let firmware = format!("{}.{}.{}", reply[0x11], reply[0x12], reply[0x13]);

        self.conn.write(&CMD_LED_INFO, ctx.timeout)?;
        self.conn.write(&CMD_INIT_INTERVAL, ctx.timeout)?;
        self.conn.write(&CMD_INIT_COMPLETE, ctx.timeout)?;

        info!(device = %self.conn.descriptor().identity(), firmware = %firmware, "initialized");
        Ok(vec![StatusItem::text("Firmware version", firmware)])
    }

    fn read_status(&mut self, ctx: &Context) -> Result<Vec<StatusItem>> {
        self.conn.clear_enqueued_reports()?;
        self.conn.write(&CMD_REQUEST_STATUS, ctx.timeout)?;

        let reply = self
            .conn
            .read_until(ctx.timeout, MAX_REPLY_ATTEMPTS, is_status_reply)?;
        let readings = Readings::parse(&reply)
            .map_err(|message| DriverError::protocol(self.conn.descriptor().identity(), message))?;

        let mut status = vec![
            StatusItem::float("Liquid temperature", readings.liquid_temp, "°C"),
            StatusItem::integer("Pump speed", i64::from(readings.pump_rpm), "rpm"),
            StatusItem::integer("Pump duty", i64::from(readings.pump_duty), "%"),
        ];
        if self.model.cooling {
            status.push(StatusItem::integer("Fan speed", i64::from(readings.fan_rpm), "rpm"));
            status.push(StatusItem::integer("Fan duty", i64::from(readings.fan_duty), "%"));
        }
        Ok(status)
    }

    fn write_speed(&mut self, ctx: &Context, channel: &SpeedChannel, setting: &SpeedSetting) -> Result<()> {
        let duties = Self::curve(channel, setting)?;
        let mut msg = Vec::with_capacity(2 + CURVE_POINTS);
        msg.push(CMD_SET_SPEED_HEADER);
        msg.push(channel_id(channel.name));
        msg.extend_from_slice(&duties);

        debug!(channel = channel.name, first = duties[0], last = duties[CURVE_POINTS - 1], "uploading curve");
        self.conn.write(&msg, ctx.timeout)
    }
}

// =============================================================================
// Probe
// =============================================================================

pub struct Kraken3Probe;

impl Probe for Kraken3Probe {
    fn name(&self) -> &'static str {
        "kraken3"
    }

    fn bus_kind(&self) -> BusKind {
        BusKind::Hid
    }

    fn probe(&self, candidate: &ProbeCandidate<'_>, _ctx: &Context) -> Result<Vec<Box<dyn Driver>>> {
        let (Some(model), Some(bus)) = (find_model(&MODELS, candidate.descriptor), candidate.hid_bus())
        else {
            return Ok(Vec::new());
        };
        Ok(vec![Box::new(Kraken3::new(candidate.descriptor.clone(), bus, model))])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::mock::{MockHidBus, MockHidDevice};

    fn kraken(device: &MockHidDevice, model: &'static Model) -> Kraken3 {
        let bus: Arc<dyn HidBus> = Arc::new(MockHidBus::new().with_device(device.clone()));
        Kraken3::new(device.descriptor().clone(), bus, model)
    }

    fn status_report() -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0] = 0x75;
        buf[1] = 0x01;
        buf[15] = 30;
        buf[16] = 5;
        buf[17..19].copy_from_slice(&2400u16.to_le_bytes());
        buf[19] = 60;
        buf[23..25].copy_from_slice(&900u16.to_le_bytes());
        buf[25] = 35;
        buf
    }

    #[test]
    fn test_parse_status_report() {
        let readings = Readings::parse(&status_report()).unwrap();
        assert_eq!(readings.liquid_temp, 30.5);
        assert_eq!(readings.pump_rpm, 2400);
        assert_eq!(readings.pump_duty, 60);
        assert_eq!(readings.fan_rpm, 900);
        assert_eq!(readings.fan_duty, 35);
    }

    #[test]
    fn test_parse_rejects_sensor_fault() {
        let mut buf = status_report();
        buf[15] = 0xff;
        buf[16] = 0xff;
        assert!(Readings::parse(&buf).is_err());
    }

    #[test]
    fn test_initialize_reads_firmware() {
        let device = MockHidDevice::new(NZXT_VID, 0x3008, "/dev/hidraw2");
        let mut firmware = vec![0u8; 64];
        firmware[..2].copy_from_slice(&RESP_FIRMWARE);
        firmware[0x11..0x14].copy_from_slice(&[2, 1, 0]);
        device.reply_to(&CMD_FIRMWARE_INFO, vec![vec![0x33, 0x01], firmware]);

        let mut kraken = kraken(&device, &MODELS[1]);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let info = kraken.initialize(&ctx).unwrap();
        assert_eq!(info, vec![StatusItem::text("Firmware version", "2.1.0")]);

        let writes = device.writes();
        assert_eq!(writes.len(), 4);
        assert!(writes[2].starts_with(&CMD_INIT_INTERVAL));
        assert!(writes.iter().all(|w| w.len() == REPORT_LENGTH));
    }

    #[test]
    fn test_status_skips_unrelated_replies() {
        let device = MockHidDevice::new(NZXT_VID, 0x3008, "/dev/hidraw2");
        device.queue_read(vec![0x75, 0x01, 0xaa]);
        device.reply_to(&CMD_REQUEST_STATUS, vec![vec![0x21, 0x03], status_report()]);

        let mut kraken = kraken(&device, &MODELS[1]);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let status = kraken.get_status(&ctx).unwrap();
        assert_eq!(status.len(), 5);
        assert_eq!(status[0], StatusItem::float("Liquid temperature", 30.5, "°C"));
        assert_eq!(status[3], StatusItem::integer("Fan speed", 900, "rpm"));
    }

    #[test]
    fn test_x_series_has_no_fan() {
        let device = MockHidDevice::new(NZXT_VID, 0x2007, "/dev/hidraw2");
        device.reply_to(&CMD_REQUEST_STATUS, vec![status_report()]);

        let mut kraken = kraken(&device, &MODELS[0]);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        assert_eq!(kraken.get_status(&ctx).unwrap().len(), 3);
        assert!(matches!(
            kraken.set_speed(&ctx, "fan", &SpeedSetting::Fixed(50)),
            Err(DriverError::UnsupportedChannel { .. })
        ));
    }

    #[test]
    fn test_fixed_speed_is_flat_curve() {
        let device = MockHidDevice::new(NZXT_VID, 0x3008, "/dev/hidraw2");
        let mut kraken = kraken(&device, &MODELS[1]);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        kraken.set_speed(&ctx, "fan", &SpeedSetting::Fixed(45)).unwrap();
        let writes = device.writes();
        assert_eq!(&writes[0][..2], &[0x72, 0x02]);
        assert!(writes[0][2..42].iter().all(|d| *d == 45));
        assert_eq!(writes[0][42], 0);
    }

    #[test]
    fn test_pump_profile_curve() {
        let device = MockHidDevice::new(NZXT_VID, 0x3008, "/dev/hidraw2");
        let mut kraken = kraken(&device, &MODELS[1]);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        let profile = SpeedSetting::Profile(vec![(20, 30), (40, 60), (50, 80)]);
        kraken.set_speed(&ctx, "pump", &profile).unwrap();

        let msg = &device.writes()[0];
        assert_eq!(&msg[..2], &[0x72, 0x01]);
        assert_eq!(msg[2], 30);
        assert_eq!(msg[2 + 20], 60);
        assert_eq!(msg[2 + 30], 80);
        assert_eq!(msg[2 + 39], 100);
    }

    #[test]
    fn test_pump_minimum_enforced_before_io() {
        let device = MockHidDevice::new(NZXT_VID, 0x3008, "/dev/hidraw2");
        let mut kraken = kraken(&device, &MODELS[1]);
        let ctx = Context::new();
        kraken.connect(&ctx).unwrap();

        assert!(matches!(
            kraken.set_speed(&ctx, "pump", &SpeedSetting::Fixed(10)),
            Err(DriverError::InvalidValue(_))
        ));
        assert_eq!(device.counts().writes, 0);
    }
}
