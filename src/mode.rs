//! Lighting modes, animation parameters and color-count validation.
//!
//! Each driver publishes a table of [`ColorMode`]s per lighting channel.
//! Requests are normalized once, at the parse boundary, by
//! [`ColorRequest::parse`]: legacy `backwards-*` names are rewritten into the
//! base mode plus [`Direction::Backward`], and speed/direction tokens become
//! enums. Drivers only ever see the normalized form.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use crate::color::{Rgb, parse_colors};
use crate::error::{DriverError, Result};

// =============================================================================
// Color Count
// =============================================================================

/// How many colors a mode accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColorCount {
    Exact(usize),
    /// Inclusive bounds.
    Range(usize, usize),
    /// Zero up to the given maximum.
    UpTo(usize),
}

impl ColorCount {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            ColorCount::Exact(n) => count == n,
            ColorCount::Range(min, max) => (min..=max).contains(&count),
            ColorCount::UpTo(max) => count <= max,
        }
    }

    /// Largest accepted count.
    pub fn max(&self) -> usize {
        match *self {
            ColorCount::Exact(n) | ColorCount::UpTo(n) => n,
            ColorCount::Range(_, max) => max,
        }
    }

    /// Smallest accepted count.
    pub fn min(&self) -> usize {
        match *self {
            ColorCount::Exact(n) => n,
            ColorCount::Range(min, _) => min,
            ColorCount::UpTo(_) => 0,
        }
    }
}

impl fmt::Display for ColorCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorCount::Exact(n) => write!(f, "exactly {}", n),
            ColorCount::Range(min, max) => write!(f, "between {} and {}", min, max),
            ColorCount::UpTo(max) => write!(f, "at most {}", max),
        }
    }
}

// =============================================================================
// Animation Parameters
// =============================================================================

/// Animation speed, slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationSpeed {
    Slowest,
    Slower,
    #[default]
    Normal,
    Faster,
    Fastest,
}

impl AnimationSpeed {
    pub const ALL: [AnimationSpeed; 5] = [
        AnimationSpeed::Slowest,
        AnimationSpeed::Slower,
        AnimationSpeed::Normal,
        AnimationSpeed::Faster,
        AnimationSpeed::Fastest,
    ];

    /// Position from 0 (slowest) to 4 (fastest).
    pub fn index(self) -> usize {
        self as usize
    }
}

impl FromStr for AnimationSpeed {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slowest" => Ok(AnimationSpeed::Slowest),
            "slower" => Ok(AnimationSpeed::Slower),
            "normal" => Ok(AnimationSpeed::Normal),
            "faster" => Ok(AnimationSpeed::Faster),
            "fastest" => Ok(AnimationSpeed::Fastest),
            _ => Err(DriverError::InvalidSpeed(s.to_string())),
        }
    }
}

/// Animation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl FromStr for Direction {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" | "backwards" => Ok(Direction::Backward),
            _ => Err(DriverError::InvalidDirection(s.to_string())),
        }
    }
}

// =============================================================================
// Color Modes
// =============================================================================

/// One lighting mode a channel supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColorMode {
    pub name: &'static str,
    pub colors: ColorCount,
    /// Accepts an animation speed.
    pub animated: bool,
    /// Accepts [`Direction::Backward`].
    pub reversible: bool,
    /// Unsafe features required on top of the operation's own.
    pub requires: &'static [&'static str],
}

impl ColorMode {
    pub const fn new(name: &'static str, colors: ColorCount) -> Self {
        Self {
            name,
            colors,
            animated: false,
            reversible: false,
            requires: &[],
        }
    }

    pub const fn animated(mut self) -> Self {
        self.animated = true;
        self
    }

    pub const fn reversible(mut self) -> Self {
        self.animated = true;
        self.reversible = true;
        self
    }

    pub const fn requires(mut self, features: &'static [&'static str]) -> Self {
        self.requires = features;
        self
    }
}

/// Look up `name` in a channel's mode table.
pub fn find_mode<'a>(modes: &'a [ColorMode], channel: &str, name: &str) -> Result<&'a ColorMode> {
    modes
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| DriverError::UnsupportedMode {
            mode: name.to_string(),
            channel: channel.to_string(),
        })
}

/// Check the color count and animation parameters of `request` against
/// `mode`.
pub fn validate_request(mode: &ColorMode, request: &ColorRequest) -> Result<()> {
    if !mode.colors.accepts(request.colors.len()) {
        return Err(DriverError::ColorCountMismatch {
            mode: mode.name.to_string(),
            expected: mode.colors,
            got: request.colors.len(),
        });
    }

    if request.direction == Direction::Backward && !mode.reversible {
        return Err(DriverError::InvalidValue(format!(
            "mode '{}' cannot run backward",
            mode.name
        )));
    }

    Ok(())
}

// =============================================================================
// Legacy Mode Names
// =============================================================================

/// Deprecated spellings that encoded direction in the mode name.
const LEGACY_MODES: &[(&str, &str)] = &[
    ("backwards-spectrum-wave", "spectrum-wave"),
    ("backwards-super-wave", "super-wave"),
    ("backwards-marquee-3", "marquee-3"),
    ("backwards-marquee-4", "marquee-4"),
    ("backwards-marquee-5", "marquee-5"),
    ("backwards-marquee-6", "marquee-6"),
    ("covering-backwards-marquee", "covering-marquee"),
    ("backwards-moving-alternating", "moving-alternating"),
    ("backwards-moving-alternating-3", "moving-alternating-3"),
    ("backwards-moving-alternating-4", "moving-alternating-4"),
    ("backwards-moving-alternating-5", "moving-alternating-5"),
    ("backwards-moving-alternating-6", "moving-alternating-6"),
    ("backwards-rainbow-flow", "rainbow-flow"),
    ("backwards-super-rainbow", "super-rainbow"),
    ("backwards-rainbow-pulse", "rainbow-pulse"),
];

/// Map a legacy `backwards-*` mode name to its base mode.
pub fn legacy_base_mode(name: &str) -> Option<&'static str> {
    LEGACY_MODES
        .iter()
        .find(|(legacy, _)| *legacy == name)
        .map(|(_, base)| *base)
}

// =============================================================================
// Color Requests
// =============================================================================

/// A normalized lighting request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColorRequest {
    pub mode: String,
    pub colors: Vec<Rgb>,
    pub speed: AnimationSpeed,
    pub direction: Direction,
}

impl ColorRequest {
    pub fn new(mode: impl Into<String>, colors: Vec<Rgb>) -> Self {
        Self {
            mode: mode.into(),
            colors,
            ..Self::default()
        }
    }

    pub fn with_speed(mut self, speed: AnimationSpeed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Build a request from user-facing tokens.
    ///
    /// Legacy mode names are accepted with a warning and always run
    /// backward.
    ///
    /// # Errors
    /// `ColorParse`, `InvalidSpeed` or `InvalidDirection` for bad tokens.
    pub fn parse<S: AsRef<str>>(
        mode: &str,
        colors: &[S],
        speed: Option<&str>,
        direction: Option<&str>,
    ) -> Result<Self> {
        let colors = parse_colors(colors)?;
        let speed: AnimationSpeed = speed.map(str::parse).transpose()?.unwrap_or_default();
        let mut direction: Direction = direction.map(str::parse).transpose()?.unwrap_or_default();

        let requested = mode.trim().to_ascii_lowercase();
        let mode = match legacy_base_mode(&requested) {
            Some(base) => {
                warn!(
                    legacy = %requested,
                    mode = base,
                    "deprecated mode name, use '{}' with direction backward",
                    base
                );
                direction = Direction::Backward;
                base.to_string()
            }
            None => requested,
        };

        Ok(Self {
            mode,
            colors,
            speed,
            direction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FADING: ColorMode = ColorMode::new("fading", ColorCount::Range(2, 8)).animated();
    const FIXED: ColorMode = ColorMode::new("fixed", ColorCount::Exact(1));
    const WAVE: ColorMode = ColorMode::new("spectrum-wave", ColorCount::Exact(0)).reversible();

    #[test]
    fn test_color_count_bounds() {
        assert!(ColorCount::Range(2, 8).accepts(2));
        assert!(ColorCount::Range(2, 8).accepts(8));
        assert!(!ColorCount::Range(2, 8).accepts(1));
        assert!(!ColorCount::Range(2, 8).accepts(9));
        assert!(ColorCount::UpTo(40).accepts(0));
        assert!(!ColorCount::UpTo(40).accepts(41));
        assert_eq!(ColorCount::UpTo(40).min(), 0);
    }

    #[test]
    fn test_fading_without_colors_rejected() {
        let request = ColorRequest::new("fading", vec![]);
        let err = validate_request(&FADING, &request).unwrap_err();
        assert!(matches!(
            err,
            DriverError::ColorCountMismatch {
                expected: ColorCount::Range(2, 8),
                got: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_fixed_accepts_one_color() {
        let request = ColorRequest::parse("fixed", &["af5a2f"], None, None).unwrap();
        assert!(validate_request(&FIXED, &request).is_ok());
        assert_eq!(request.colors, vec![Rgb::new(175, 90, 47)]);
    }

    #[test]
    fn test_legacy_name_translated() {
        let request =
            ColorRequest::parse::<&str>("backwards-spectrum-wave", &[], Some("fastest"), None).unwrap();
        assert_eq!(request.mode, "spectrum-wave");
        assert_eq!(request.direction, Direction::Backward);
        assert_eq!(request.speed, AnimationSpeed::Fastest);
        assert!(validate_request(&WAVE, &request).is_ok());
    }

    #[test]
    fn test_backward_on_non_reversible_mode() {
        let request = ColorRequest::new("fixed", vec![Rgb::BLACK]).with_direction(Direction::Backward);
        assert!(validate_request(&FIXED, &request).is_err());
    }

    #[test]
    fn test_speed_and_direction_tokens() {
        assert_eq!("SLOWER".parse::<AnimationSpeed>().unwrap(), AnimationSpeed::Slower);
        assert!(matches!(
            "warp".parse::<AnimationSpeed>(),
            Err(DriverError::InvalidSpeed(_))
        ));
        assert!(matches!(
            "sideways".parse::<Direction>(),
            Err(DriverError::InvalidDirection(_))
        ));
        assert_eq!(AnimationSpeed::Fastest.index(), 4);
    }

    #[test]
    fn test_unknown_mode_lookup() {
        let modes = [FIXED, FADING];
        assert!(find_mode(&modes, "ring", "fading").is_ok());
        assert!(matches!(
            find_mode(&modes, "ring", "disco"),
            Err(DriverError::UnsupportedMode { .. })
        ));
    }
}
