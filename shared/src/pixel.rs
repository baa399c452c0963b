use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::colors::HexColor;
use crate::grid::Cell;

/// The live value of one cell as decided by the paint authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pixel {
    pub id: String,
    pub cell: Cell,
    pub color: HexColor,
    pub painted_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub painter_name: Option<String>,
    pub painted_at: DateTime<Utc>,
    /// Authority commit order; strictly increasing across the canvas.
    pub seq: u64,
}

impl Pixel {
    /// Whether `self` was committed after `other`.
    pub fn supersedes(&self, other: &Pixel) -> bool {
        self.seq > other.seq
    }
}

/// Inclusive axis-aligned rectangle in cell space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl Viewport {
    /// Swapped bounds are put back in order.
    pub fn new(min_x: i32, max_x: i32, min_y: i32, max_y: i32) -> Self {
        Self {
            min_x: min_x.min(max_x),
            max_x: min_x.max(max_x),
            min_y: min_y.min(max_y),
            max_y: min_y.max(max_y),
        }
    }

    pub fn normalized(self) -> Self {
        Self::new(self.min_x, self.max_x, self.min_y, self.max_y)
    }

    pub const fn contains(&self, cell: Cell) -> bool {
        cell.x >= self.min_x && cell.x <= self.max_x && cell.y >= self.min_y && cell.y <= self.max_y
    }

    pub fn width(&self) -> u64 {
        (i64::from(self.max_x) - i64::from(self.min_x) + 1).max(0) as u64
    }

    pub fn height(&self) -> u64 {
        (i64::from(self.max_y) - i64::from(self.min_y) + 1).max(0) as u64
    }

    pub fn area(&self) -> u64 {
        self.width().saturating_mul(self.height())
    }

    pub fn intersection(&self, other: &Viewport) -> Option<Viewport> {
        let min_x = self.min_x.max(other.min_x);
        let max_x = self.max_x.min(other.max_x);
        let min_y = self.min_y.max(other.min_y);
        let max_y = self.max_y.min(other.max_y);
        if min_x > max_x || min_y > max_y {
            return None;
        }
        Some(Viewport {
            min_x,
            max_x,
            min_y,
            max_y,
        })
    }
}

/// Response body for an area snapshot query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaSnapshot {
    pub pixels: Vec<Pixel>,
    pub count: usize,
    /// Set when the pixel cap cut the result short.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelInfo {
    pub pixel: Option<Pixel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelHistory {
    pub cell: Cell,
    pub history: Vec<Pixel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub pixel_count: u64,
}
