use std::fmt;

use serde::{Deserialize, Serialize};

use crate::grid::Cell;
use crate::pixel::Viewport;

/// A square tile of cells used to group subscribers for broadcast fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey {
    pub rx: i32,
    pub ry: i32,
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room:{}:{}", self.rx, self.ry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomTiling {
    room_size: i32,
}

impl Default for RoomTiling {
    fn default() -> Self {
        Self { room_size: 64 }
    }
}

impl RoomTiling {
    /// Rooms must hold more than one cell.
    pub fn new(room_size: i32) -> Option<Self> {
        (room_size >= 2).then_some(Self { room_size })
    }

    pub const fn room_size(&self) -> i32 {
        self.room_size
    }

    pub const fn room_of(&self, cell: Cell) -> RoomKey {
        RoomKey {
            rx: cell.x.div_euclid(self.room_size),
            ry: cell.y.div_euclid(self.room_size),
        }
    }

    /// Number of rooms a viewport overlaps, without materializing them.
    pub fn room_count(&self, viewport: &Viewport) -> u64 {
        let (lo, hi) = (self.room_of(min_corner(viewport)), self.room_of(max_corner(viewport)));
        let cols = (i64::from(hi.rx) - i64::from(lo.rx) + 1) as u64;
        let rows = (i64::from(hi.ry) - i64::from(lo.ry) + 1) as u64;
        cols.saturating_mul(rows)
    }

    pub fn rooms_for(&self, viewport: &Viewport) -> Vec<RoomKey> {
        let (lo, hi) = (self.room_of(min_corner(viewport)), self.room_of(max_corner(viewport)));
        let mut rooms = Vec::with_capacity(self.room_count(viewport).min(4096) as usize);
        for ry in lo.ry..=hi.ry {
            for rx in lo.rx..=hi.rx {
                rooms.push(RoomKey { rx, ry });
            }
        }
        rooms
    }

    /// Cells covered by a room.
    pub fn bounds(&self, room: RoomKey) -> Viewport {
        let min_x = room.rx * self.room_size;
        let min_y = room.ry * self.room_size;
        Viewport {
            min_x,
            max_x: min_x + self.room_size - 1,
            min_y,
            max_y: min_y + self.room_size - 1,
        }
    }
}

const fn min_corner(viewport: &Viewport) -> Cell {
    Cell::new(viewport.min_x, viewport.min_y)
}

const fn max_corner(viewport: &Viewport) -> Cell {
    Cell::new(viewport.max_x, viewport.max_y)
}
