//! Device discovery, filtering and selection.
//!
//! A [`Registry`] holds the bus adapters to enumerate and the probes that
//! recognize devices on them. Discovery enumerates every bus, offers each
//! descriptor to the probes for its bus kind, and returns the resulting
//! drivers in a deterministic order so that `pick` indices are stable
//! between invocations on an unchanged setup.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Context;
use crate::device::builtin_probes;
use crate::driver::{Driver, Probe, ProbeCandidate, run_probe};
use crate::error::{DriverError, Result};
use crate::transport::{
    BusKind, DeviceDescriptor, HidBus, HidapiBus, I2cDevBus, NusbBus, SmbusBus, UsbBus,
};

// =============================================================================
// Filters
// =============================================================================

/// Criteria narrowing the discovered device list.
///
/// Every set field must match. `pick` is applied last, as a 1-based index
/// into the already filtered and ordered list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub release: Option<u16>,
    pub serial: Option<String>,
    pub bus: Option<String>,
    pub address: Option<String>,
    /// Case-insensitive substring of the description.
    pub description: Option<String>,
    pub pick: Option<usize>,
}

impl DeviceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vendor(mut self, vendor: u16) -> Self {
        self.vendor = Some(vendor);
        self
    }

    pub fn with_product(mut self, product: u16) -> Self {
        self.product = Some(product);
        self
    }

    pub fn with_release(mut self, release: u16) -> Self {
        self.release = Some(release);
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = Some(bus.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_match(mut self, pattern: impl Into<String>) -> Self {
        self.description = Some(pattern.into());
        self
    }

    pub fn with_pick(mut self, pick: usize) -> Self {
        self.pick = Some(pick);
        self
    }

    /// Match on fields known before probing.
    fn matches_location(&self, d: &DeviceDescriptor) -> bool {
        self.vendor.is_none_or(|v| d.vendor_id == v)
            && self.product.is_none_or(|p| d.product_id == p)
            && self.release.is_none_or(|r| d.release_number == Some(r))
            && self
                .serial
                .as_deref()
                .is_none_or(|s| d.serial_number.as_deref() == Some(s))
            && self.bus.as_deref().is_none_or(|b| d.bus == b)
            && self.address.as_deref().is_none_or(|a| d.address == a)
    }

    /// Whether `descriptor` satisfies every criterion except `pick`.
    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.matches_location(descriptor)
            && self.description.as_deref().is_none_or(|pattern| {
                descriptor
                    .description
                    .to_lowercase()
                    .contains(&pattern.to_lowercase())
            })
    }

    fn check_pick(&self) -> Result<()> {
        if self.pick == Some(0) {
            return Err(DriverError::InvalidValue(
                "pick is 1-based; the first device is 1".into(),
            ));
        }
        Ok(())
    }

    /// Keep the matching candidates, preserving order, then apply `pick`.
    ///
    /// # Errors
    /// `InvalidValue` for `pick` 0.
    pub fn select<T>(&self, candidates: Vec<T>, descriptor: impl Fn(&T) -> &DeviceDescriptor) -> Result<Vec<T>> {
        self.check_pick()?;
        let matched = candidates.into_iter().filter(|c| self.matches(descriptor(c)));
        Ok(match self.pick {
            Some(pick) => matched.skip(pick - 1).take(1).collect(),
            None => matched.collect(),
        })
    }
}

/// Reduce a candidate list to exactly one device.
///
/// # Errors
/// `DeviceNotFound` for an empty list, `MultipleDevicesFound` for more than
/// one candidate.
pub fn select_one<T>(mut candidates: Vec<T>) -> Result<T> {
    match candidates.len() {
        0 => Err(DriverError::DeviceNotFound),
        1 => candidates.pop().ok_or(DriverError::DeviceNotFound),
        n => Err(DriverError::MultipleDevicesFound(n)),
    }
}

/// Deterministic ordering of discovered drivers.
pub fn sort_drivers(drivers: &mut [Box<dyn Driver>]) {
    drivers.sort_by(|a, b| {
        a.descriptor()
            .sort_cmp(b.descriptor())
            .then_with(|| a.name().cmp(b.name()))
    });
}

// =============================================================================
// Registry
// =============================================================================

/// Bus adapters and probes used for discovery.
#[derive(Default)]
pub struct Registry {
    hid_buses: Vec<Arc<dyn HidBus>>,
    usb_buses: Vec<Arc<dyn UsbBus>>,
    smbus_buses: Vec<Arc<dyn SmbusBus>>,
    probes: Vec<Box<dyn Probe>>,
}

impl Registry {
    /// Empty registry: no buses, no probes.
    pub fn new() -> Self {
        Self::default()
    }

    /// The host's HID, USB and SMBus adapters with every built-in driver.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_hid_bus(HidapiBus::new())
            .with_usb_bus(NusbBus)
            .with_smbus_bus(I2cDevBus::new())
            .with_builtin_probes()
    }

    pub fn with_hid_bus(mut self, bus: impl HidBus + 'static) -> Self {
        self.hid_buses.push(Arc::new(bus));
        self
    }

    pub fn with_usb_bus(mut self, bus: impl UsbBus + 'static) -> Self {
        self.usb_buses.push(Arc::new(bus));
        self
    }

    pub fn with_smbus_bus(mut self, bus: impl SmbusBus + 'static) -> Self {
        self.smbus_buses.push(Arc::new(bus));
        self
    }

    pub fn register(mut self, probe: impl Probe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }

    pub fn with_builtin_probes(mut self) -> Self {
        self.probes.extend(builtin_probes());
        self
    }

    pub fn probes(&self) -> impl Iterator<Item = &dyn Probe> {
        self.probes.iter().map(|p| p.as_ref())
    }

    /// Every recognized device, ordered.
    pub fn discover(&self, ctx: &Context) -> Vec<Box<dyn Driver>> {
        self.discover_where(ctx, |_| true)
    }

    /// Devices matching `filter`, ordered, with `pick` applied.
    ///
    /// Descriptors that cannot match are never offered to a probe.
    pub fn find(&self, ctx: &Context, filter: &DeviceFilter) -> Result<Vec<Box<dyn Driver>>> {
        filter.check_pick()?;
        let drivers = self.discover_where(ctx, |d| filter.matches_location(d));
        filter.select(drivers, |d| d.descriptor())
    }

    fn discover_where(
        &self,
        ctx: &Context,
        wanted: impl Fn(&DeviceDescriptor) -> bool,
    ) -> Vec<Box<dyn Driver>> {
        let mut drivers: Vec<Box<dyn Driver>> = Vec::new();

        for bus in &self.hid_buses {
            for descriptor in enumerate(BusKind::Hid, bus.enumerate()).iter().filter(|d| wanted(d)) {
                let candidate = ProbeCandidate::hid(descriptor, bus.clone());
                drivers.extend(self.probe_candidate(&candidate, ctx));
            }
        }

        for bus in &self.usb_buses {
            for descriptor in enumerate(BusKind::Usb, bus.enumerate()).iter().filter(|d| wanted(d)) {
                let candidate = ProbeCandidate::usb(descriptor, bus.clone());
                drivers.extend(self.probe_candidate(&candidate, ctx));
            }
        }

        for bus in &self.smbus_buses {
            for descriptor in enumerate(BusKind::Smbus, bus.enumerate()).iter().filter(|d| wanted(d)) {
                let candidate = ProbeCandidate::smbus(descriptor, bus.clone());
                drivers.extend(self.probe_candidate(&candidate, ctx));
            }
        }

        sort_drivers(&mut drivers);
        debug!(count = drivers.len(), "discovery finished");
        drivers
    }

    fn probe_candidate(&self, candidate: &ProbeCandidate<'_>, ctx: &Context) -> Vec<Box<dyn Driver>> {
        self.probes
            .iter()
            .filter(|p| p.bus_kind() == candidate.bus_kind())
            .flat_map(|p| run_probe(p.as_ref(), candidate, ctx))
            .collect()
    }
}

fn enumerate(
    kind: BusKind,
    result: std::result::Result<Vec<DeviceDescriptor>, crate::error::TransportError>,
) -> Vec<DeviceDescriptor> {
    match result {
        Ok(descriptors) => {
            debug!(bus = %kind, count = descriptors.len(), "enumerated");
            descriptors
        }
        Err(e) => {
            warn!(bus = %kind, error = %e, "enumeration failed, skipping bus");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BusKind;

    fn descriptors() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor::new(BusKind::Hid, 0x1e71, 0x170e)
                .with_bus("usb1")
                .with_address("1")
                .with_description("NZXT Kraken X (X42, X52, X62 or X72)")
                .with_serial("A1"),
            DeviceDescriptor::new(BusKind::Hid, 0x1e71, 0x2007)
                .with_bus("usb1")
                .with_address("3")
                .with_description("NZXT Kraken X (X53, X63 or X73)")
                .with_release(0x100),
            DeviceDescriptor::new(BusKind::Usb, 0x2433, 0xb200)
                .with_bus("usb2")
                .with_address("4")
                .with_description("Asetek 690LC"),
        ]
    }

    #[test]
    fn test_match_is_case_insensitive_substring() {
        let filter = DeviceFilter::new().with_match("kraken x (x5");
        let selected = filter.select(descriptors(), |d| d).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].product_id, 0x2007);
    }

    #[test]
    fn test_pick_is_one_based_and_last() {
        let filter = DeviceFilter::new().with_vendor(0x1e71).with_pick(2);
        let selected = filter.select(descriptors(), |d| d).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].address, "3");

        let beyond = DeviceFilter::new().with_pick(4);
        assert!(beyond.select(descriptors(), |d| d).unwrap().is_empty());

        let zero = DeviceFilter::new().with_pick(0);
        assert!(matches!(zero.select(descriptors(), |d| d), Err(DriverError::InvalidValue(_))));
    }

    #[test]
    fn test_exact_fields() {
        let all = descriptors();
        assert_eq!(DeviceFilter::new().with_serial("A1").select(all.clone(), |d| d).unwrap().len(), 1);
        assert_eq!(DeviceFilter::new().with_release(0x100).select(all.clone(), |d| d).unwrap().len(), 1);
        assert_eq!(DeviceFilter::new().with_bus("usb1").select(all.clone(), |d| d).unwrap().len(), 2);
        assert_eq!(
            DeviceFilter::new().with_bus("usb1").with_address("4").select(all, |d| d).unwrap().len(),
            0
        );
    }

    #[test]
    fn test_select_one() {
        assert!(matches!(select_one(Vec::<u8>::new()), Err(DriverError::DeviceNotFound)));
        assert!(matches!(select_one(vec![1, 2]), Err(DriverError::MultipleDevicesFound(2))));
        assert_eq!(select_one(vec![7]).unwrap(), 7);
    }
}
