use serde::{Deserialize, Serialize};

use crate::grid::Cell;
use crate::pixel::{Pixel, Viewport};
use crate::progression::LevelUp;
use crate::rate::{RateStatus, RejectReason};

/// Messages a client sends over the live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    UpdateViewport(Viewport),
    Paint {
        request_id: u64,
        cell: Cell,
        color: String,
    },
    Ping,
}

/// Messages the server pushes over the live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Hello {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate: Option<RateStatus>,
    },
    /// Full state of the client's rooms; sent after every viewport change and resync.
    RoomState {
        viewport: Viewport,
        pixels: Vec<Pixel>,
        #[serde(default)]
        truncated: bool,
    },
    PixelsUpdate {
        pixels: Vec<Pixel>,
    },
    PaintResult {
        request_id: u64,
        result: PaintAck,
    },
    RateStatus(RateStatus),
    LevelUp(LevelUp),
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

/// Synchronous outcome of a paint request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaintAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel: Option<Pixel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    /// The write was accepted but a newer pixel already held the cell; `pixel` is the winner.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub superseded: bool,
}

impl PaintAck {
    pub fn accepted(pixel: Pixel) -> Self {
        Self {
            accepted: true,
            pixel: Some(pixel),
            reason: None,
            superseded: false,
        }
    }

    pub fn superseded(winner: Pixel) -> Self {
        Self {
            accepted: true,
            pixel: Some(winner),
            reason: None,
            superseded: true,
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            pixel: None,
            reason: Some(reason),
            superseded: false,
        }
    }
}

/// REST paint request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaintRequest {
    pub cell: Cell,
    pub color: String,
}
