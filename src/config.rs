//! Persistent settings and the per-call context handed to drivers.
//!
//! Settings live in a JSON file:
//! - Linux: `~/.config/coolctl/config.json`
//! - Windows: `%APPDATA%\coolctl\config.json`
//!
//! Unsafe feature tokens are never read from the settings file; they must be
//! enabled per invocation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};
use crate::gate::UnsafeFeatures;
use crate::storage::{DeviceStorage, FileStorage, MemoryStorage, RuntimeStorage, default_runtime_dir};
use crate::transport::{DeviceDescriptor, Timeout};

const APP_NAME: &str = "coolctl";
const CONFIG_FILE: &str = "config.json";

/// Get the configuration directory path.
pub fn get_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .ok_or_else(|| DriverError::Config("could not find config directory".into()))
}

/// Get the full path to the settings file.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

// =============================================================================
// Settings
// =============================================================================

/// Settings persisted between invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Timeout for each USB/HID transfer, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bypass kernel hwmon drivers and talk to devices directly.
    #[serde(default)]
    pub direct_access: bool,

    /// Where runtime data is kept; platform default when unset.
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            direct_access: false,
            runtime_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from the default location; a missing file yields
    /// defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("failed to read {}: {}", path.display(), e)))?;

        serde_json::from_str(&content)
            .map_err(|e| DriverError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                DriverError::Config(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DriverError::Config(format!("failed to serialize settings: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| DriverError::Config(format!("failed to write {}: {}", path.display(), e)))
    }

    pub fn timeout(&self) -> Result<Timeout> {
        Timeout::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything a driver call may consult besides its arguments.
///
/// Passed explicitly to every driver operation; there is no global state.
#[derive(Clone)]
pub struct Context {
    pub unsafe_features: UnsafeFeatures,
    pub timeout: Timeout,
    pub direct_access: bool,
    /// Root of the sysfs tree used for hwmon lookups.
    pub sysfs_root: PathBuf,
    storage: Arc<dyn RuntimeStorage>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Defaults with in-memory runtime storage.
    pub fn new() -> Self {
        Self {
            unsafe_features: UnsafeFeatures::new(),
            timeout: Timeout::DEFAULT,
            direct_access: false,
            sysfs_root: PathBuf::from("/sys"),
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    /// Context from persisted settings, with file-backed runtime storage.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut ctx = Self::new()
            .with_timeout(settings.timeout()?)
            .with_direct_access(settings.direct_access);

        if let Some(dir) = settings.runtime_dir.clone().or_else(default_runtime_dir) {
            ctx = ctx.with_storage(Arc::new(FileStorage::new(dir)));
        }
        Ok(ctx)
    }

    pub fn with_unsafe_features(mut self, features: UnsafeFeatures) -> Self {
        self.unsafe_features = features;
        self
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_direct_access(mut self, direct_access: bool) -> Self {
        self.direct_access = direct_access;
        self
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn RuntimeStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Runtime storage scoped to one driver instance.
    pub fn device_storage(&self, driver: &str, descriptor: &DeviceDescriptor) -> DeviceStorage {
        DeviceStorage::new(self.storage.clone(), driver, descriptor)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("unsafe_features", &self.unsafe_features)
            .field("timeout", &self.timeout)
            .field("direct_access", &self.direct_access)
            .field("sysfs_root", &self.sysfs_root)
            .finish_non_exhaustive()
    }
}
