//! Runtime storage for per-device state.
//!
//! Some devices cannot report back what they were last told (for example a
//! pump duty that must be resent together with every fan change). Drivers
//! persist such values here, keyed by driver and device identity, so that a
//! later invocation can pick up where the previous one left off.
//!
//! Values are JSON. Unreadable or corrupt entries are treated as absent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{DriverError, Result};
use crate::transport::DeviceDescriptor;

const APP_NAME: &str = "coolctl";

/// Default directory for runtime data: the user runtime directory when the
/// platform has one, the cache directory otherwise.
pub fn default_runtime_dir() -> Option<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|p| p.join(APP_NAME))
}

// =============================================================================
// Backends
// =============================================================================

/// Key-value backend for runtime data.
pub trait RuntimeStorage: Send + Sync {
    /// Raw value for `key` in `namespace`, if any.
    fn load(&self, namespace: &str, key: &str) -> Option<String>;

    /// Replace the value for `key` in `namespace`.
    fn store(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
}

/// One file per key under `root/namespace/`.
///
/// Writes go to a temporary file that is then renamed over the old one, so a
/// concurrent reader sees either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(key)
    }
}

impl RuntimeStorage for FileStorage {
    fn load(&self, namespace: &str, key: &str) -> Option<String> {
        let path = self.path(namespace, key);
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read runtime data");
                None
            }
        }
    }

    fn store(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let dir = self.root.join(namespace);
        fs::create_dir_all(&dir).map_err(|e| {
            DriverError::Config(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(key);
        let tmp = dir.join(format!(".{}.{}.tmp", key, std::process::id()));
        fs::write(&tmp, value)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                DriverError::Config(format!("failed to write {}: {}", path.display(), e))
            })?;

        debug!(path = %path.display(), "runtime data stored");
        Ok(())
    }
}

/// Process-local storage; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuntimeStorage for MemoryStorage {
    fn load(&self, namespace: &str, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn store(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

// =============================================================================
// Device Storage
// =============================================================================

/// Typed view of runtime storage scoped to one device.
#[derive(Clone)]
pub struct DeviceStorage {
    backend: Arc<dyn RuntimeStorage>,
    namespace: String,
}

impl DeviceStorage {
    pub fn new(backend: Arc<dyn RuntimeStorage>, driver: &str, descriptor: &DeviceDescriptor) -> Self {
        Self {
            backend,
            namespace: format!("{}_{}", driver, descriptor.storage_key()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Load and decode `key`; corrupt data is logged and ignored.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.backend.load(&self.namespace, key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(namespace = %self.namespace, key, error = %e, "ignoring corrupt runtime data");
                None
            }
        }
    }

    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| DriverError::Config(format!("failed to encode {}: {}", key, e)))?;
        self.backend.store(&self.namespace, key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BusKind;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new(BusKind::Usb, 0x2433, 0xb200)
            .with_bus("usb1")
            .with_address("4")
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DeviceStorage::new(Arc::new(FileStorage::new(dir.path())), "asetek", &descriptor());

        assert_eq!(storage.load::<u8>("pump"), None);
        storage.store("pump", &75u8).unwrap();
        assert_eq!(storage.load::<u8>("pump"), Some(75));

        let file = dir.path().join(storage.namespace()).join("pump");
        assert_eq!(fs::read_to_string(file).unwrap(), "75");
    }

    #[test]
    fn test_corrupt_data_is_absent() {
        let backend = Arc::new(MemoryStorage::new());
        let storage = DeviceStorage::new(backend.clone(), "asetek", &descriptor());
        backend.store(storage.namespace(), "pump", "{not json").unwrap();
        assert_eq!(storage.load::<u8>("pump"), None);
    }

    #[test]
    fn test_namespaces_are_per_device() {
        let backend: Arc<dyn RuntimeStorage> = Arc::new(MemoryStorage::new());
        let a = DeviceStorage::new(backend.clone(), "asetek", &descriptor());
        let b = DeviceStorage::new(backend, "asetek", &descriptor().with_address("5"));

        a.store("fan", &30u8).unwrap();
        assert_eq!(b.load::<u8>("fan"), None);
    }
}
