//! Unsafe-feature gating.
//!
//! Some operations can damage hardware or rely on undocumented behavior.
//! They are only performed when the caller explicitly enables every
//! required token, e.g. `--unsafe smbus,vengeance_rgb`. Checks happen before
//! any transport call.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{DriverError, Result};

/// Token names shared by several drivers.
pub mod tokens {
    /// Any access to an SMBus adapter.
    pub const SMBUS: &str = "smbus";
    /// Corsair Vengeance RGB DIMM lighting controllers.
    pub const VENGEANCE_RGB: &str = "vengeance_rgb";
}

/// Set of unsafe feature tokens enabled by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsafeFeatures(BTreeSet<String>);

impl UnsafeFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated token list; blanks are ignored.
    pub fn parse(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_ascii_lowercase)
            .collect()
    }

    pub fn enable(&mut self, token: impl Into<String>) {
        self.0.insert(token.into());
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.contains(token)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Whether every token in `required` is enabled.
    pub fn allows(&self, required: &[&str]) -> bool {
        required.iter().all(|t| self.contains(t))
    }

    /// Fail with `UnsafeFeatureNotEnabled` unless every required token is
    /// enabled.
    pub fn check(&self, required: &[&str]) -> Result<()> {
        let missing: BTreeSet<String> = required
            .iter()
            .filter(|t| !self.contains(t))
            .map(|t| t.to_string())
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        Err(DriverError::UnsafeFeatureNotEnabled {
            required: required.iter().map(|t| t.to_string()).collect(),
            missing,
        })
    }
}

impl FromIterator<String> for UnsafeFeatures {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for UnsafeFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<&str> = self.iter().collect();
        write!(f, "{}", list.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_list() {
        let features = UnsafeFeatures::parse(" smbus, Vengeance_RGB,,");
        assert!(features.contains("smbus"));
        assert!(features.contains("vengeance_rgb"));
        assert_eq!(features.to_string(), "smbus,vengeance_rgb");
    }

    #[test]
    fn test_check_reports_only_missing() {
        let features = UnsafeFeatures::parse("smbus");
        let err = features
            .check(&[tokens::SMBUS, tokens::VENGEANCE_RGB])
            .unwrap_err();
        match err {
            DriverError::UnsafeFeatureNotEnabled { required, missing } => {
                assert_eq!(required.len(), 2);
                assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec!["vengeance_rgb"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_nothing_required_always_allowed() {
        let features = UnsafeFeatures::new();
        assert!(features.check(&[]).is_ok());
        assert!(features.allows(&[]));
        assert!(!features.allows(&[tokens::SMBUS]));
    }
}
