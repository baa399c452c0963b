use std::fmt;

use serde::{Deserialize, Serialize};

/// Remaining paint budget of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStatus {
    pub tokens: u32,
    pub max_tokens: u32,
    pub credits: u64,
    /// Seconds until the next token lands; 0 when the bucket is full.
    pub next_refill_seconds: u64,
}

/// Machine-readable reason attached to a rejected paint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum RejectReason {
    InvalidColor,
    CooldownActive {
        #[serde(rename = "secondsRemaining")]
        seconds_remaining: u64,
    },
    InsufficientCredits,
    OutOfRange,
    /// Raised client-side when no ack arrives in time.
    Timeout,
}

impl RejectReason {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidColor => "InvalidColor",
            Self::CooldownActive { .. } => "CooldownActive",
            Self::InsufficientCredits => "InsufficientCredits",
            Self::OutOfRange => "OutOfRange",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidColor => f.write_str("color must be a 6-digit hex value"),
            Self::CooldownActive { seconds_remaining } => {
                write!(f, "cooldown active, next pixel in {seconds_remaining}s")
            }
            Self::InsufficientCredits => f.write_str("not enough credits to paint"),
            Self::OutOfRange => f.write_str("cell is outside the canvas"),
            Self::Timeout => f.write_str("paint was not acknowledged in time"),
        }
    }
}
