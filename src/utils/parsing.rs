//! Parsing utilities for CLI arguments and configuration values.
//!
//! This module provides reusable parsing functions for the input formats the
//! command line accepts: USB ids, speed settings and token lists.

use crate::error::{DriverError, Result};
use crate::profile::SpeedSetting;

// =============================================================================
// Identifier Parsing
// =============================================================================

/// Parse a USB vendor/product id or release number.
///
/// Accepts hexadecimal with or without a `0x` prefix.
///
/// # Example
/// ```
/// use coolctl::utils::parsing::parse_hex_u16;
///
/// assert_eq!(parse_hex_u16("0x1e71").unwrap(), 0x1e71);
/// assert_eq!(parse_hex_u16("170E").unwrap(), 0x170e);
/// ```
pub fn parse_hex_u16(value: &str) -> Result<u16> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16)
        .map_err(|_| DriverError::InvalidValue(format!("'{}' is not a 16-bit hex id", value)))
}

// =============================================================================
// Speed Parsing
// =============================================================================

fn parse_percent_or_temp(token: &str, what: &str) -> Result<u8> {
    let token = token.trim().trim_end_matches('%').trim_end_matches("°C");
    token
        .parse()
        .map_err(|_| DriverError::InvalidValue(format!("invalid {} '{}'", what, token)))
}

/// Parse speed arguments into a [`SpeedSetting`].
///
/// A single value is a fixed duty. An even number of values is a profile
/// of `temperature duty` pairs.
///
/// # Arguments
/// * `args` - Values as given on the command line
///
/// # Example
/// ```
/// use coolctl::profile::SpeedSetting;
/// use coolctl::utils::parsing::parse_speed;
///
/// assert_eq!(parse_speed(&["60"]).unwrap(), SpeedSetting::Fixed(60));
/// assert_eq!(
///     parse_speed(&["20", "30", "50", "80"]).unwrap(),
///     SpeedSetting::Profile(vec![(20, 30), (50, 80)])
/// );
/// ```
pub fn parse_speed<S: AsRef<str>>(args: &[S]) -> Result<SpeedSetting> {
    match args {
        [] => Err(DriverError::InvalidValue("missing speed value".into())),
        [duty] => Ok(SpeedSetting::Fixed(parse_percent_or_temp(duty.as_ref(), "duty")?)),
        pairs if pairs.len() % 2 == 0 => {
            let points = pairs
                .chunks(2)
                .map(|pair| {
                    Ok((
                        parse_percent_or_temp(pair[0].as_ref(), "temperature")?,
                        parse_percent_or_temp(pair[1].as_ref(), "duty")?,
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(SpeedSetting::Profile(points))
        }
        _ => Err(DriverError::InvalidValue(
            "a profile needs temperature and duty pairs".into(),
        )),
    }
}

// =============================================================================
// Lists
// =============================================================================

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u16() {
        assert_eq!(parse_hex_u16("0x2433").unwrap(), 0x2433);
        assert_eq!(parse_hex_u16("b200").unwrap(), 0xb200);
        assert!(parse_hex_u16("0x12345").is_err());
        assert!(parse_hex_u16("kraken").is_err());
    }

    #[test]
    fn test_parse_fixed_speed() {
        assert_eq!(parse_speed(&["75"]).unwrap(), SpeedSetting::Fixed(75));
        assert_eq!(parse_speed(&["75%"]).unwrap(), SpeedSetting::Fixed(75));
        assert!(parse_speed(&["fast"]).is_err());
        assert!(parse_speed::<&str>(&[]).is_err());
    }

    #[test]
    fn test_parse_profile() {
        assert_eq!(
            parse_speed(&["20", "25", "40", "60", "50", "100"]).unwrap(),
            SpeedSetting::Profile(vec![(20, 25), (40, 60), (50, 100)])
        );
        assert!(parse_speed(&["20", "25", "40"]).is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("smbus, vengeance_rgb,,"), vec!["smbus", "vengeance_rgb"]);
        assert!(parse_list("").is_empty());
    }
}
