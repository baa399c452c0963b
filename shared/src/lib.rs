pub mod colors;
pub mod events;
pub mod grid;
pub mod pixel;
pub mod progression;
pub mod rate;
pub mod room;

pub use colors::{ColorError, HexColor, user_color};
pub use events::*;
pub use grid::{Cell, GridCodec, GridError, LatLng};
pub use pixel::*;
pub use progression::LevelUp;
pub use rate::{RateStatus, RejectReason};
pub use room::{RoomKey, RoomTiling};
