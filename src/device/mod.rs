//! Device drivers.
//!
//! One driver per supported device family. Each module exposes the driver
//! type and a [`Probe`] that recognizes its devices during discovery.

pub mod asetek;
pub mod kraken2;
pub mod kraken3;
pub mod smart_device2;
pub mod vengeance_rgb;

pub use asetek::Asetek690Lc;
pub use kraken2::Kraken2;
pub use kraken3::Kraken3;
pub use smart_device2::SmartDevice2;
pub use vengeance_rgb::VengeanceRgb;

use crate::driver::Probe;
use crate::transport::DeviceDescriptor;

/// NZXT USB vendor ID.
pub const NZXT_VID: u16 = 0x1e71;

/// Asetek USB vendor ID.
pub const ASETEK_VID: u16 = 0x2433;

/// A supported product and the capabilities that vary between models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub vendor_id: u16,
    pub product_id: u16,
    pub description: &'static str,
    /// Has a fan header besides the pump (or any cooling at all).
    pub cooling: bool,
}

impl Model {
    pub const fn new(vendor_id: u16, product_id: u16, description: &'static str, cooling: bool) -> Self {
        Self {
            vendor_id,
            product_id,
            description,
            cooling,
        }
    }
}

/// Find the model table entry for `descriptor`.
pub(crate) fn find_model(models: &'static [Model], descriptor: &DeviceDescriptor) -> Option<&'static Model> {
    models
        .iter()
        .find(|m| descriptor.matches(m.vendor_id, m.product_id))
}

/// Probes for every built-in driver.
pub fn builtin_probes() -> Vec<Box<dyn Probe>> {
    vec![
        Box::new(kraken2::Kraken2Probe),
        Box::new(kraken3::Kraken3Probe),
        Box::new(smart_device2::SmartDevice2Probe),
        Box::new(asetek::Asetek690LcProbe),
        Box::new(vengeance_rgb::VengeanceRgbProbe),
    ]
}

/// Linear index of an animation speed into a per-device table.
pub(crate) fn speed_value(table: &[u8; 5], speed: crate::mode::AnimationSpeed) -> u8 {
    table[speed.index()]
}
