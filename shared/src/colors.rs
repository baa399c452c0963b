use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A normalized `#RRGGBB` color (uppercase hex digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexColor(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorError {
    Empty,
    Malformed(String),
}

impl fmt::Display for ColorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("color is empty"),
            Self::Malformed(raw) => write!(f, "color {raw:?} is not a 6-digit hex value"),
        }
    }
}

impl std::error::Error for ColorError {}

impl HexColor {
    /// Trim, uppercase and prepend `#` when missing. Exactly six hex digits are accepted.
    pub fn parse(raw: &str) -> Result<Self, ColorError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ColorError::Empty);
        }
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ColorError::Malformed(raw.to_owned()));
        }
        Ok(Self(format!("#{}", digits.to_ascii_uppercase())))
    }

    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self(format!("#{r:02X}{g:02X}{b:02X}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&self.0[range], 16).unwrap_or_default()
        };
        (channel(1..3), channel(3..5), channel(5..7))
    }
}

impl FromStr for HexColor {
    type Err = ColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HexColor {
    type Error = ColorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HexColor> for String {
    fn from(value: HexColor) -> Self {
        value.0
    }
}

impl fmt::Display for HexColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic starting brush color via CRC32 hash of the user id.
pub fn user_color(user_id: &str) -> HexColor {
    let hash = crc32fast::hash(user_id.as_bytes());
    let bytes = hash.to_be_bytes();
    HexColor::from_rgb(bytes[0], bytes[1], bytes[2])
}
