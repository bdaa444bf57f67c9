//! Speed settings and temperature-duty profiles.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Highest temperature a profile may reference, in °C.
pub const MAX_PROFILE_TEMP: u8 = 100;

// =============================================================================
// Speed Settings
// =============================================================================

/// Requested speed for one cooling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedSetting {
    /// Constant duty, in percent.
    Fixed(u8),
    /// `(temperature °C, duty %)` points, applied against the liquid
    /// temperature by the device.
    Profile(Vec<(u8, u8)>),
}

impl fmt::Display for SpeedSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedSetting::Fixed(duty) => write!(f, "{}%", duty),
            SpeedSetting::Profile(points) => {
                let points: Vec<String> = points
                    .iter()
                    .map(|(temp, duty)| format!("{}°C→{}%", temp, duty))
                    .collect();
                write!(f, "{}", points.join(", "))
            }
        }
    }
}

// =============================================================================
// Profile Helpers
// =============================================================================

/// Sort a profile, force duties to be non-decreasing, drop points at or
/// above `critical` and end with `(critical, 100)`.
pub fn normalize(profile: &[(u8, u8)], critical: u8) -> Vec<(u8, u8)> {
    let mut sorted = profile.to_vec();
    sorted.sort_by_key(|(temp, _)| *temp);

    let mut normalized: Vec<(u8, u8)> = Vec::with_capacity(sorted.len() + 1);
    let mut floor = 0u8;
    for (temp, duty) in sorted {
        if temp >= critical {
            break;
        }
        floor = floor.max(duty);
        match normalized.last_mut() {
            Some(last) if last.0 == temp => last.1 = floor,
            _ => normalized.push((temp, floor)),
        }
    }
    normalized.push((critical, 100));
    normalized
}

/// Duty for `temp`, linearly interpolated between profile points.
///
/// Below the first point the first duty applies; above the last point the
/// last duty applies. Returns `None` for an empty profile.
pub fn interpolate(profile: &[(u8, u8)], temp: u8) -> Option<u8> {
    let mut sorted = profile.to_vec();
    sorted.sort_by_key(|(t, _)| *t);

    let first = *sorted.first()?;
    let last = *sorted.last()?;

    if temp <= first.0 {
        return Some(first.1);
    }
    if temp >= last.0 {
        return Some(last.1);
    }

    sorted.windows(2).find_map(|window| {
        let (t1, d1) = window[0];
        let (t2, d2) = window[1];
        if temp >= t1 && temp <= t2 && t2 > t1 {
            let ratio = f32::from(temp - t1) / f32::from(t2 - t1);
            Some((f32::from(d1) + ratio * (f32::from(d2) - f32::from(d1))).round() as u8)
        } else {
            None
        }
    })
}

/// Sample a profile at every temperature in `temps`.
///
/// # Errors
/// `InvalidValue` for an empty profile.
pub fn sample(profile: &[(u8, u8)], temps: RangeInclusive<u8>) -> Result<Vec<u8>> {
    temps
        .map(|temp| {
            interpolate(profile, temp)
                .ok_or_else(|| DriverError::InvalidValue("profile cannot be empty".into()))
        })
        .collect()
}

/// Check that every point references a temperature in 0..=100 °C and a
/// duty within `duty_bounds`.
pub fn validate_points(
    channel: &str,
    profile: &[(u8, u8)],
    max_points: usize,
    duty_bounds: RangeInclusive<u8>,
) -> Result<()> {
    if profile.is_empty() {
        return Err(DriverError::InvalidValue(format!(
            "profile for channel '{}' cannot be empty",
            channel
        )));
    }
    if profile.len() > max_points {
        return Err(DriverError::InvalidValue(format!(
            "channel '{}' accepts at most {} profile points, got {}",
            channel,
            max_points,
            profile.len()
        )));
    }
    for &(temp, duty) in profile {
        if temp > MAX_PROFILE_TEMP {
            return Err(DriverError::InvalidValue(format!(
                "profile temperature {}°C is above {}°C",
                temp, MAX_PROFILE_TEMP
            )));
        }
        if !duty_bounds.contains(&duty) {
            return Err(DriverError::InvalidValue(format!(
                "duty {}% for channel '{}' is outside {}..={}",
                duty,
                channel,
                duty_bounds.start(),
                duty_bounds.end()
            )));
        }
    }
    Ok(())
}
