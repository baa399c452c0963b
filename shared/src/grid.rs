use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pixel::Viewport;

/// Grid arithmetic runs on integer micro-degrees (6 decimal places).
pub const MICRO_PER_DEGREE: i64 = 1_000_000;
/// 0.0001° per cell, roughly 11 m at the equator.
pub const DEFAULT_CELL_SIZE_MICRODEG: i64 = 100;

const LNG_OFFSET_MICRO: i64 = 180 * MICRO_PER_DEGREE;
const LAT_OFFSET_MICRO: i64 = 90 * MICRO_PER_DEGREE;
const LNG_SPAN_MICRO: i64 = 360 * MICRO_PER_DEGREE;
const LAT_SPAN_MICRO: i64 = 180 * MICRO_PER_DEGREE;

/// Integer cell coordinates. `x` grows eastward from -180°, `y` northward from -90°.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Stable identifier, `"{x}_{y}"`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.x, self.y)
    }

    pub fn from_id(id: &str) -> Result<Self, GridError> {
        let (x, y) = id.split_once('_').ok_or(GridError::InvalidCellId)?;
        let x = x.parse::<i32>().map_err(|_| GridError::InvalidCellId)?;
        let y = y.parse::<i32>().map_err(|_| GridError::InvalidCellId)?;
        Ok(Self { x, y })
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GridError {
    NotFinite { lat: f64, lng: f64 },
    LatitudeOutOfRange(f64),
    LongitudeOutOfRange(f64),
    CellOutOfRange(Cell),
    InvalidCellId,
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFinite { lat, lng } => write!(f, "coordinates are not finite: lat={lat}, lng={lng}"),
            Self::LatitudeOutOfRange(lat) => write!(f, "latitude {lat} is outside [-90, 90]"),
            Self::LongitudeOutOfRange(lng) => write!(f, "longitude {lng} is outside [-180, 180]"),
            Self::CellOutOfRange(cell) => write!(f, "cell {cell} is outside the grid"),
            Self::InvalidCellId => f.write_str("cell id must look like \"{x}_{y}\""),
        }
    }
}

impl std::error::Error for GridError {}

/// Bidirectional mapping between geographic coordinates and grid cells.
///
/// Inputs are snapped to micro-degrees before any division, so converting the
/// same coordinate twice can never land in two different cells. The inverse
/// mapping returns the cell's origin (south-west) corner, not the original point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCodec {
    cell_size_micro: i64,
    x_max: i32,
    y_max: i32,
}

impl Default for GridCodec {
    fn default() -> Self {
        Self {
            cell_size_micro: DEFAULT_CELL_SIZE_MICRODEG,
            x_max: (LNG_SPAN_MICRO / DEFAULT_CELL_SIZE_MICRODEG) as i32,
            y_max: (LAT_SPAN_MICRO / DEFAULT_CELL_SIZE_MICRODEG) as i32,
        }
    }
}

impl GridCodec {
    /// The cell size must evenly divide the latitude span so the last row is whole.
    pub fn new(cell_size_micro: i64) -> Option<Self> {
        if cell_size_micro <= 0 || LAT_SPAN_MICRO % cell_size_micro != 0 {
            return None;
        }
        let x_max = i32::try_from(LNG_SPAN_MICRO / cell_size_micro).ok()?;
        let y_max = i32::try_from(LAT_SPAN_MICRO / cell_size_micro).ok()?;
        Some(Self {
            cell_size_micro,
            x_max,
            y_max,
        })
    }

    pub const fn cell_size_micro(&self) -> i64 {
        self.cell_size_micro
    }

    pub fn cell_size_deg(&self) -> f64 {
        from_micro(self.cell_size_micro)
    }

    pub const fn x_max(&self) -> i32 {
        self.x_max
    }

    pub const fn y_max(&self) -> i32 {
        self.y_max
    }

    pub const fn contains(&self, cell: Cell) -> bool {
        cell.x >= 0 && cell.x < self.x_max && cell.y >= 0 && cell.y < self.y_max
    }

    pub fn to_cell(&self, lat: f64, lng: f64) -> Result<Cell, GridError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(GridError::NotFinite { lat, lng });
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(GridError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(GridError::LongitudeOutOfRange(lng));
        }

        let x = (to_micro(lng) + LNG_OFFSET_MICRO).div_euclid(self.cell_size_micro);
        let y = (to_micro(lat) + LAT_OFFSET_MICRO).div_euclid(self.cell_size_micro);

        // lng = 180 / lat = 90 sit on the far edge; fold them into the last cell.
        Ok(Cell {
            x: x.clamp(0, i64::from(self.x_max - 1)) as i32,
            y: y.clamp(0, i64::from(self.y_max - 1)) as i32,
        })
    }

    pub fn to_coord(&self, cell: Cell) -> Result<LatLng, GridError> {
        if !self.contains(cell) {
            return Err(GridError::CellOutOfRange(cell));
        }
        let lng = i64::from(cell.x) * self.cell_size_micro - LNG_OFFSET_MICRO;
        let lat = i64::from(cell.y) * self.cell_size_micro - LAT_OFFSET_MICRO;
        Ok(LatLng {
            lat: from_micro(lat),
            lng: from_micro(lng),
        })
    }

    pub fn cell_id(&self, cell: Cell) -> String {
        cell.id()
    }

    pub fn lat_lng_id(&self, lat: f64, lng: f64) -> Result<String, GridError> {
        self.to_cell(lat, lng).map(|cell| cell.id())
    }

    /// Origin corner of the cell containing `(lat, lng)`; used for hover previews.
    pub fn origin(&self, lat: f64, lng: f64) -> Result<LatLng, GridError> {
        self.to_cell(lat, lng).and_then(|cell| self.to_coord(cell))
    }

    /// Intersect a viewport with the grid. `None` when nothing of it is on the grid.
    pub fn clamp_viewport(&self, viewport: Viewport) -> Option<Viewport> {
        let min_x = viewport.min_x.max(0);
        let min_y = viewport.min_y.max(0);
        let max_x = viewport.max_x.min(self.x_max - 1);
        let max_y = viewport.max_y.min(self.y_max - 1);
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

fn to_micro(value: f64) -> i64 {
    (value * MICRO_PER_DEGREE as f64).round() as i64
}

fn from_micro(value: i64) -> f64 {
    value as f64 / MICRO_PER_DEGREE as f64
}
