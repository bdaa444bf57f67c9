//! Linux hwmon integration.
//!
//! When a kernel driver already binds a device and exposes its sensors
//! through hwmon, status reads go through sysfs instead of competing with
//! the kernel for HID reports. Callers opt out with `direct_access`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

/// A hwmon chip directory bound to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwmonDevice {
    pub path: PathBuf,
    /// Contents of the `name` attribute.
    pub name: String,
}

impl HwmonDevice {
    /// Locate the hwmon directory of the HID device at `hid_path`
    /// (e.g. `/dev/hidraw3`), under the sysfs tree rooted at `sysfs_root`.
    pub fn find_for_hidraw(sysfs_root: &Path, hid_path: &str) -> Option<Self> {
        let node = Path::new(hid_path).file_name()?.to_str()?;
        if !node.starts_with("hidraw") {
            return None;
        }

        let hwmon_root = sysfs_root
            .join("class/hidraw")
            .join(node)
            .join("device/hwmon");
        let mut entries: Vec<PathBuf> = fs::read_dir(&hwmon_root)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("hwmon"))
            })
            .collect();
        entries.sort();

        let path = entries.into_iter().next()?;
        let name = read_trimmed(path.join("name")).unwrap_or_default();
        debug!(hid = hid_path, hwmon = %path.display(), name = %name, "hwmon device found");
        Some(Self { path, name })
    }

    /// Raw integer attribute, e.g. `fan1_input`.
    pub fn read_int(&self, attribute: &str) -> Option<i64> {
        read_trimmed(self.path.join(attribute)).ok()?.parse().ok()
    }

    /// Attribute in milli-units (temperatures), scaled to units.
    pub fn read_milli(&self, attribute: &str) -> Option<f64> {
        self.read_int(attribute).map(|v| v as f64 / 1000.0)
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.path.join(attribute).exists()
    }
}

fn read_trimmed<P: AsRef<Path>>(p: P) -> std::io::Result<String> {
    let mut s = String::new();
    fs::File::open(p)?.read_to_string(&mut s)?;
    Ok(s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_hwmon(root: &Path, hidraw: &str) -> PathBuf {
        let dir = root
            .join("class/hidraw")
            .join(hidraw)
            .join("device/hwmon/hwmon5");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), "kraken2\n").unwrap();
        fs::write(dir.join("temp1_input"), "31500\n").unwrap();
        fs::write(dir.join("fan1_input"), "1200\n").unwrap();
        dir
    }

    #[test]
    fn test_find_for_hidraw() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_hwmon(root.path(), "hidraw3");

        let hwmon = HwmonDevice::find_for_hidraw(root.path(), "/dev/hidraw3").unwrap();
        assert_eq!(hwmon.path, dir);
        assert_eq!(hwmon.name, "kraken2");
        assert_eq!(hwmon.read_milli("temp1_input"), Some(31.5));
        assert_eq!(hwmon.read_int("fan1_input"), Some(1200));
        assert_eq!(hwmon.read_int("fan2_input"), None);
    }

    #[test]
    fn test_non_hidraw_paths_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        fake_hwmon(root.path(), "hidraw3");
        assert!(HwmonDevice::find_for_hidraw(root.path(), "1-2:1.0").is_none());
        assert!(HwmonDevice::find_for_hidraw(root.path(), "/dev/hidraw4").is_none());
    }
}
