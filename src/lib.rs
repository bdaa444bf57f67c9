//! coolctl
//!
//! A host-side control library for liquid coolers, fan controllers and RGB
//! devices on USB, HID and SMBus.
//!
//! # Features
//!
//! - Discover supported devices and select one with filters
//! - Read status (temperatures, fan and pump speeds, firmware)
//! - Set fixed duties or temperature profiles
//! - Set lighting modes with validated colors
//! - Gate risky operations behind explicitly enabled unsafe features
//!
//! # Example
//!
//! ```no_run
//! use coolctl::{Context, DeviceFilter, Registry, SpeedSetting};
//! use coolctl::discovery::select_one;
//! use coolctl::driver::ConnectGuard;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Context::new();
//!     let registry = Registry::with_defaults();
//!
//!     let filter = DeviceFilter::new().with_match("kraken");
//!     let mut driver = select_one(registry.find(&ctx, &filter)?)?;
//!
//!     let mut device = ConnectGuard::connect(driver.as_mut(), &ctx)?;
//!     for item in device.get_status(&ctx)? {
//!         println!("{}", item);
//!     }
//!     device.set_speed(&ctx, "pump", &SpeedSetting::Fixed(80))?;
//!
//!     Ok(())
//! }
//! ```

pub mod color;
pub mod config;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod gate;
pub mod hwmon;
pub mod mode;
pub mod profile;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use color::Rgb;
pub use config::{Context, Settings};
pub use discovery::{DeviceFilter, Registry};
pub use driver::{Driver, StatusItem};
pub use error::{DriverError, Result, TransportError};
pub use gate::UnsafeFeatures;
pub use mode::{AnimationSpeed, ColorRequest, Direction};
pub use profile::SpeedSetting;
pub use transport::DeviceDescriptor;
