//! Corsair Vengeance RGB DIMMs.
//!
//! Each module carries a temperature sensor at `0x18 | slot` and an RGB
//! controller at `0x58 | slot` on the host SMBus. Only Intel i801 adapters
//! are considered, and every access requires the `smbus` and
//! `vengeance_rgb` unsafe features.

use tracing::debug;

use crate::color::Rgb;
use crate::config::Context;
use crate::driver::{BusHandle, Driver, Operation, Probe, ProbeCandidate, SmbusConnection, StatusItem};
use crate::error::Result;
use crate::gate::tokens::{SMBUS, VENGEANCE_RGB};
use crate::mode::{ColorCount, ColorMode, ColorRequest};
use crate::transport::{BusKind, DeviceDescriptor, SmbusBus, SmbusRead};

const REQUIRED_FEATURES: [&str; 2] = [SMBUS, VENGEANCE_RGB];

/// Kernel driver of the only adapters probed.
const ADAPTER_DRIVER: &str = "i801_smbus";

const SLOTS: u8 = 8;
const TS_BASE: u8 = 0x18;
const RGB_BASE: u8 = 0x58;

// Temperature sensor registers
const REG_TEMPERATURE: u8 = 0x05;

// RGB controller registers
const REG_TIMING1: u8 = 0xa4;
const REG_TIMING2: u8 = 0xa5;
const REG_MODE: u8 = 0xa6;
const REG_COLOR_COUNT: u8 = 0xa7;
const REG_COLOR_START: u8 = 0xb0;

const MODE_FIXED: u8 = 0x00;
const MODE_FADING: u8 = 0x01;
const MODE_BREATHING: u8 = 0x02;

/// Timing values from slowest to fastest.
const TIMINGS: [u8; 5] = [0x3f, 0x2f, 0x1f, 0x0f, 0x07];
const TIMING_STATIC: u8 = 0x01;

const COLOR_CHANNELS: [&str; 1] = ["led"];

const MODES: [ColorMode; 4] = [
    ColorMode::new("off", ColorCount::Exact(0)).requires(&[SMBUS]),
    ColorMode::new("fixed", ColorCount::Exact(1)).requires(&[SMBUS]),
    ColorMode::new("fading", ColorCount::Range(2, 7)).animated().requires(&[SMBUS]),
    ColorMode::new("breathing", ColorCount::Range(1, 7)).animated().requires(&[SMBUS]),
];

/// Decode a JEDEC temperature sensor reading.
///
/// SMBus words arrive least significant byte first but the sensor sends the
/// most significant byte first.
fn decode_temperature(word: u16) -> f64 {
    let raw = word.swap_bytes() & 0x1fff;
    let value = if raw > 0x0fff {
        i32::from(raw) - 0x2000
    } else {
        i32::from(raw)
    };
    f64::from(value) * 0.0625
}

// =============================================================================
// Driver
// =============================================================================

pub struct VengeanceRgb {
    conn: SmbusConnection,
    descriptor: DeviceDescriptor,
    slot: u8,
}

impl VengeanceRgb {
    /// `adapter` is the SMBus adapter the module sits on.
    pub fn new(adapter: &DeviceDescriptor, bus: impl Into<BusHandle<dyn SmbusBus>>, slot: u8) -> Self {
        let descriptor = adapter
            .clone()
            .with_address(format!("{:#04x}", RGB_BASE | slot))
            .with_description(format!("Corsair Vengeance RGB DIMM{}", slot + 1));
        Self {
            conn: SmbusConnection::new(descriptor.clone(), bus),
            descriptor,
            slot,
        }
    }

    fn sensor_address(&self) -> u8 {
        TS_BASE | self.slot
    }

    fn controller_address(&self) -> u8 {
        RGB_BASE | self.slot
    }
}

impl Driver for VengeanceRgb {
    fn name(&self) -> &'static str {
        "vengeance_rgb"
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn color_channels(&self) -> &[&'static str] {
        &COLOR_CHANNELS
    }

    fn color_modes(&self, channel: &str) -> &[ColorMode] {
        if channel == "led" { &MODES } else { &[] }
    }

    fn required_features(&self, _operation: Operation) -> &[&'static str] {
        &REQUIRED_FEATURES
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

    fn init_device(&mut self, _ctx: &Context) -> Result<Vec<StatusItem>> {
        Ok(Vec::new())
    }

    fn read_status(&mut self, _ctx: &Context) -> Result<Vec<StatusItem>> {
        let word = self.conn.read_word(self.sensor_address(), REG_TEMPERATURE)?;
        Ok(vec![StatusItem::float("Temperature", decode_temperature(word), "°C")])
    }

    fn write_color(&mut self, _ctx: &Context, _channel: &str, mode: &ColorMode, request: &ColorRequest) -> Result<()> {
        let (mode_byte, timing, colors) = match mode.name {
            "off" => (MODE_FIXED, TIMING_STATIC, vec![Rgb::BLACK]),
            "fading" => (MODE_FADING, TIMINGS[request.speed.index()], request.colors.clone()),
            "breathing" => (MODE_BREATHING, TIMINGS[request.speed.index()], request.colors.clone()),
            _ => (MODE_FIXED, TIMING_STATIC, request.colors.clone()),
        };

        let address = self.controller_address();
        self.conn.write_byte(address, REG_TIMING1, timing)?;
        self.conn.write_byte(address, REG_TIMING2, timing)?;

        let components = colors.iter().flat_map(|c| c.rgb_bytes());
        for (register, component) in (REG_COLOR_START..).zip(components) {
            self.conn.write_byte(address, register, component)?;
        }

        self.conn.write_byte(address, REG_COLOR_COUNT, colors.len() as u8)?;
        self.conn.write_byte(address, REG_MODE, mode_byte)
    }
}

// =============================================================================
// Probe
// =============================================================================

pub struct VengeanceRgbProbe;

/// Slots answering on both the sensor and the controller address.
fn populated_slots(bus: &mut dyn SmbusRead) -> Vec<u8> {
    (0..SLOTS)
        .filter(|slot| {
            bus.read_word(TS_BASE | slot, REG_TEMPERATURE).is_ok()
                && bus.read_byte(RGB_BASE | slot, REG_MODE).is_ok()
        })
        .collect()
}

impl Probe for VengeanceRgbProbe {
    fn name(&self) -> &'static str {
        "vengeance_rgb"
    }

    fn bus_kind(&self) -> BusKind {
        BusKind::Smbus
    }

    fn required_features(&self) -> &'static [&'static str] {
        &REQUIRED_FEATURES
    }

    fn probe(&self, candidate: &ProbeCandidate<'_>, _ctx: &Context) -> Result<Vec<Box<dyn Driver>>> {
        let adapter = candidate.descriptor;
        if adapter.bus_driver.as_deref() != Some(ADAPTER_DRIVER) {
            return Ok(Vec::new());
        }
        let Some(bus) = candidate.smbus_bus() else {
            return Ok(Vec::new());
        };

        let slots = candidate.read_smbus(|reader| Ok(populated_slots(reader)))?;
        debug!(adapter = %adapter.bus, slots = ?slots, "vengeance rgb modules found");

        Ok(slots
            .into_iter()
            .map(|slot| Box::new(VengeanceRgb::new(adapter, bus.clone(), slot)) as Box<dyn Driver>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::run_probe;
    use crate::error::DriverError;
    use crate::gate::UnsafeFeatures;
    use crate::transport::mock::{MockSmbusAdapter, MockSmbusBus};

    fn adapter() -> MockSmbusAdapter {
        MockSmbusAdapter::new("i2c-0", 0x8086, 0xa323).with_bus_driver(ADAPTER_DRIVER)
    }

    fn unsafe_ctx() -> Context {
        Context::new().with_unsafe_features(UnsafeFeatures::parse("smbus,vengeance_rgb"))
    }

    #[test]
    fn test_decode_temperature() {
        assert_eq!(decode_temperature(0x3802), 35.5);
        assert_eq!(decode_temperature(0x601f), -10.0);
    }

    #[test]
    fn test_probe_finds_populated_slots() {
        let adapter = adapter();
        for slot in [1u8, 3] {
            adapter.set_word(TS_BASE | slot, REG_TEMPERATURE, 0x3802);
            adapter.set_byte(RGB_BASE | slot, REG_MODE, 0x00);
        }
        // sensor without controller
        adapter.set_word(TS_BASE | 5, REG_TEMPERATURE, 0x3802);

        let bus: Arc<dyn SmbusBus> = Arc::new(MockSmbusBus::new().with_adapter(adapter.clone()));
        let candidate = ProbeCandidate::smbus(adapter.descriptor(), bus);
        let drivers = run_probe(&VengeanceRgbProbe, &candidate, &unsafe_ctx());

        let addresses: Vec<&str> = drivers.iter().map(|d| d.descriptor().address.as_str()).collect();
        assert_eq!(addresses, vec!["0x59", "0x5b"]);
        assert_eq!(drivers[0].description(), "Corsair Vengeance RGB DIMM2");
        assert_eq!(adapter.counts().closes, 1);
    }

    #[test]
    fn test_probe_gated_without_tokens() {
        let adapter = adapter();
        let bus: Arc<dyn SmbusBus> = Arc::new(MockSmbusBus::new().with_adapter(adapter.clone()));
        let candidate = ProbeCandidate::smbus(adapter.descriptor(), bus);

        let ctx = Context::new().with_unsafe_features(UnsafeFeatures::parse("smbus"));
        assert!(run_probe(&VengeanceRgbProbe, &candidate, &ctx).is_empty());
        assert_eq!(adapter.counts().total(), 0);
    }

    #[test]
    fn test_other_adapters_ignored() {
        let adapter = MockSmbusAdapter::new("i2c-1", 0x1002, 0x790b).with_bus_driver("piix4_smbus");
        let bus: Arc<dyn SmbusBus> = Arc::new(MockSmbusBus::new().with_adapter(adapter.clone()));
        let candidate = ProbeCandidate::smbus(adapter.descriptor(), bus);

        assert!(run_probe(&VengeanceRgbProbe, &candidate, &unsafe_ctx()).is_empty());
        assert_eq!(adapter.counts().total(), 0);
    }

    #[test]
    fn test_every_operation_is_gated() {
        let adapter = adapter();
        let bus: Arc<dyn SmbusBus> = Arc::new(MockSmbusBus::new().with_adapter(adapter.clone()));
        let mut dimm = VengeanceRgb::new(adapter.descriptor(), bus, 0);

        let ctx = Context::new();
        assert!(matches!(dimm.connect(&ctx), Err(DriverError::UnsafeFeatureNotEnabled { .. })));
        assert_eq!(adapter.counts().total(), 0);
    }

    #[test]
    fn test_status_and_breathing() {
        let adapter = adapter();
        adapter.set_word(TS_BASE, REG_TEMPERATURE, 0x3802);
        let bus: Arc<dyn SmbusBus> = Arc::new(MockSmbusBus::new().with_adapter(adapter.clone()));
        let mut dimm = VengeanceRgb::new(adapter.descriptor(), bus, 0);
        let ctx = unsafe_ctx();
        dimm.connect(&ctx).unwrap();

        let status = dimm.get_status(&ctx).unwrap();
        assert_eq!(status, vec![StatusItem::float("Temperature", 35.5, "°C")]);

        let request = ColorRequest::parse("breathing", &["ff8000"], Some("fastest"), None).unwrap();
        dimm.set_color(&ctx, "led", &request).unwrap();

        let writes = adapter.writes();
        assert_eq!(writes[0], (0x58, REG_TIMING1, vec![0x07]));
        assert_eq!(writes[2], (0x58, REG_COLOR_START, vec![0xff]));
        assert_eq!(writes[3], (0x58, REG_COLOR_START + 1, vec![0x80]));
        assert_eq!(writes[5], (0x58, REG_COLOR_COUNT, vec![1]));
        assert_eq!(writes[6], (0x58, REG_MODE, vec![MODE_BREATHING]));
    }

    #[test]
    fn test_off_writes_black() {
        let adapter = adapter();
        let bus: Arc<dyn SmbusBus> = Arc::new(MockSmbusBus::new().with_adapter(adapter.clone()));
        let mut dimm = VengeanceRgb::new(adapter.descriptor(), bus, 2);
        let ctx = unsafe_ctx();
        dimm.connect(&ctx).unwrap();

        let request = ColorRequest::parse::<&str>("off", &[], None, None).unwrap();
        dimm.set_color(&ctx, "led", &request).unwrap();

        let writes = adapter.writes();
        assert_eq!(writes.len(), 7);
        assert!(writes[2..5].iter().all(|(addr, _, value)| *addr == 0x5a && value == &vec![0]));
        assert_eq!(writes[6], (0x5a, REG_MODE, vec![MODE_FIXED]));
    }
}
