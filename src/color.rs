//! Color values and color token parsing.
//!
//! Accepted tokens:
//! - hex: `ff8000`, `#ff8000`, `0xff8000`
//! - `rgb(255, 128, 0)`
//! - `hsv(30, 100, 100)` with hue in degrees and saturation/value in percent
//! - `hsl(30, 100, 50)` with hue in degrees and saturation/lightness in percent

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

// =============================================================================
// Rgb
// =============================================================================

/// A 24-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn rgb_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// Green-red-blue order used by several NZXT controllers.
    pub fn grb_bytes(self) -> [u8; 3] {
        [self.g, self.r, self.b]
    }

    /// Scale every component by `percent` (0-100).
    pub fn scaled(self, percent: u8) -> Self {
        let scale = |c: u8| ((u16::from(c) * u16::from(percent.min(100))) / 100) as u8;
        Rgb::new(scale(self.r), scale(self.g), scale(self.b))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for Rgb {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        parse_color(s)
    }
}

// =============================================================================
// Parsing
// =============================================================================

fn parse_error(token: &str, reason: impl Into<String>) -> DriverError {
    DriverError::ColorParse {
        token: token.to_string(),
        reason: reason.into(),
    }
}

/// Parse a single color token.
///
/// # Errors
/// Returns `ColorParse` naming the offending token.
pub fn parse_color(token: &str) -> Result<Rgb> {
    let normalized = token.trim().to_ascii_lowercase();

    if let Some(args) = function_args(&normalized, "hsv") {
        let [h, s, v] = parse_components(token, args)?;
        check_hue(token, h)?;
        check_percent(token, "saturation", s)?;
        check_percent(token, "value", v)?;
        return Ok(hsv_to_rgb(h, s, v));
    }

    if let Some(args) = function_args(&normalized, "hsl") {
        let [h, s, l] = parse_components(token, args)?;
        check_hue(token, h)?;
        check_percent(token, "saturation", s)?;
        check_percent(token, "lightness", l)?;
        return Ok(hsl_to_rgb(h, s, l));
    }

    if let Some(args) = function_args(&normalized, "rgb") {
        let [r, g, b] = parse_components(token, args)?;
        let channel = |name: &str, value: f64| -> Result<u8> {
            if (0.0..=255.0).contains(&value) && value.fract() == 0.0 {
                Ok(value as u8)
            } else {
                Err(parse_error(token, format!("{} must be an integer in 0..=255", name)))
            }
        };
        return Ok(Rgb::new(channel("red", r)?, channel("green", g)?, channel("blue", b)?));
    }

    parse_hex(token, &normalized)
}

/// Parse every token, stopping at the first invalid one.
pub fn parse_colors<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Rgb>> {
    tokens.iter().map(|t| parse_color(t.as_ref())).collect()
}

fn parse_hex(token: &str, normalized: &str) -> Result<Rgb> {
    let hex = normalized
        .strip_prefix('#')
        .or_else(|| normalized.strip_prefix("0x"))
        .unwrap_or(normalized);

    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(parse_error(token, "expected 6 hexadecimal digits"));
    }

    let component = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&hex[range], 16).map_err(|e| parse_error(token, e.to_string()))
    };

    Ok(Rgb::new(component(0..2)?, component(2..4)?, component(4..6)?))
}

fn function_args<'a>(token: &'a str, name: &str) -> Option<&'a str> {
    token
        .strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn parse_components(token: &str, args: &str) -> Result<[f64; 3]> {
    let values = args
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| parse_error(token, format!("'{}' is not a number", part)))
        })
        .collect::<Result<Vec<f64>>>()?;

    match values.as_slice() {
        [a, b, c] => Ok([*a, *b, *c]),
        _ => Err(parse_error(token, "expected exactly three components")),
    }
}

fn check_hue(token: &str, hue: f64) -> Result<()> {
    if (0.0..360.0).contains(&hue) {
        Ok(())
    } else {
        Err(parse_error(token, "hue must be in 0..360"))
    }
}

fn check_percent(token: &str, name: &str, value: f64) -> Result<()> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(parse_error(token, format!("{} must be in 0..=100", name)))
    }
}

// =============================================================================
// Color Space Conversion
// =============================================================================

fn to_byte(unit: f64) -> u8 {
    (unit.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn from_chroma(hue: f64, chroma: f64, offset: f64) -> Rgb {
    let sector = (hue % 360.0) / 60.0;
    let x = chroma * (1.0 - ((sector % 2.0) - 1.0).abs());
    let (r, g, b) = match sector as u8 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    Rgb::new(to_byte(r + offset), to_byte(g + offset), to_byte(b + offset))
}

/// Convert HSV (degrees, percent, percent) to RGB.
pub fn hsv_to_rgb(hue: f64, saturation: f64, value: f64) -> Rgb {
    let s = saturation / 100.0;
    let v = value / 100.0;
    let chroma = v * s;
    from_chroma(hue, chroma, v - chroma)
}

/// Convert HSL (degrees, percent, percent) to RGB.
pub fn hsl_to_rgb(hue: f64, saturation: f64, lightness: f64) -> Rgb {
    let s = saturation / 100.0;
    let l = lightness / 100.0;
    let chroma = (1.0 - (2.0 * l - 1.0).abs()) * s;
    from_chroma(hue, chroma, l - chroma / 2.0)
}

fn hue_of(r: f64, g: f64, b: f64, max: f64, delta: f64) -> f64 {
    if delta == 0.0 {
        return 0.0;
    }
    let hue = if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    if hue < 0.0 { hue + 360.0 } else { hue }
}

fn unit_components(color: Rgb) -> (f64, f64, f64) {
    (
        f64::from(color.r) / 255.0,
        f64::from(color.g) / 255.0,
        f64::from(color.b) / 255.0,
    )
}

/// Convert RGB to HSV (degrees, percent, percent).
pub fn rgb_to_hsv(color: Rgb) -> (f64, f64, f64) {
    let (r, g, b) = unit_components(color);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue_of(r, g, b, max, delta), saturation * 100.0, max * 100.0)
}

/// Convert RGB to HSL (degrees, percent, percent).
pub fn rgb_to_hsl(color: Rgb) -> (f64, f64, f64) {
    let (r, g, b) = unit_components(color);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let lightness = (max + min) / 2.0;

    let saturation = if delta == 0.0 {
        0.0
    } else {
        delta / (1.0 - (2.0 * lightness - 1.0).abs())
    };
    (hue_of(r, g, b, max, delta), saturation * 100.0, lightness * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_variants() {
        let expected = Rgb::new(0xaf, 0x5a, 0x2f);
        assert_eq!(parse_color("af5a2f").unwrap(), expected);
        assert_eq!(parse_color("#AF5A2F").unwrap(), expected);
        assert_eq!(parse_color("0xaf5a2f").unwrap(), expected);
        assert_eq!(expected.rgb_bytes(), [175, 90, 47]);
    }

    #[test]
    fn test_parse_hex_invalid() {
        assert!(parse_color("FFF").is_err());
        assert!(parse_color("").is_err());
        assert!(parse_color("gg0000").is_err());
        assert!(parse_color("#ff00000").is_err());
    }

    #[test]
    fn test_parse_hsv_and_hsl() {
        assert_eq!(parse_color("hsv(0, 100, 100)").unwrap(), Rgb::new(255, 0, 0));
        assert_eq!(parse_color("HSV(120,100,100)").unwrap(), Rgb::new(0, 255, 0));
        assert_eq!(parse_color("hsl(240, 100, 50)").unwrap(), Rgb::new(0, 0, 255));
        assert_eq!(parse_color("hsl(0, 0, 100)").unwrap(), Rgb::new(255, 255, 255));
    }

    #[test]
    fn test_parse_rgb_function() {
        assert_eq!(parse_color("rgb(1, 2, 3)").unwrap(), Rgb::new(1, 2, 3));
        assert!(parse_color("rgb(256, 0, 0)").is_err());
    }

    #[test]
    fn test_out_of_range_components_rejected() {
        assert!(parse_color("hsv(360, 50, 50)").is_err());
        assert!(parse_color("hsv(10, 101, 50)").is_err());
        assert!(parse_color("hsl(10, 50)").is_err());
        assert!(parse_color("hsv(a, b, c)").is_err());
    }

    #[test]
    fn test_error_names_token() {
        let err = parse_color("nope").unwrap_err();
        assert!(matches!(err, DriverError::ColorParse { ref token, .. } if token == "nope"));
    }

    #[test]
    fn test_hsv_round_trip() {
        let color = Rgb::new(175, 90, 47);
        let (h, s, v) = rgb_to_hsv(color);
        assert_eq!(hsv_to_rgb(h, s, v), color);

        let (h, s, l) = rgb_to_hsl(color);
        assert_eq!(hsl_to_rgb(h, s, l), color);
    }

    #[test]
    fn test_grb_and_scaling() {
        let color = Rgb::new(1, 2, 3);
        assert_eq!(color.grb_bytes(), [2, 1, 3]);
        assert_eq!(Rgb::new(200, 100, 0).scaled(50), Rgb::new(100, 50, 0));
        assert_eq!(color.to_string(), "#010203");
    }
}
