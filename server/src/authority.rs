use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use youplace_shared::{
    AreaSnapshot, Cell, GridCodec, HexColor, PaintAck, Pixel, RateStatus, RejectReason, RoomKey,
    RoomTiling, ServerMessage, Viewport,
};

use crate::clock::Clock;
use crate::identity::Identity;
use crate::ledger::{ConsumeOutcome, RateLedger};
use crate::progression::ProgressionJob;
use crate::router::ViewportRouter;
use crate::state::ObservabilityCounters;

/// How two writes to the same cell are ordered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Last write committed at the authority wins.
    #[default]
    ArrivalOrder,
    /// Latest authority-assigned submission time wins; ties go to arrival order.
    SubmissionTimestamp,
}

impl ConflictPolicy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ArrivalOrder => "arrival",
            Self::SubmissionTimestamp => "timestamp",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "arrival" | "arrival_order" => Ok(Self::ArrivalOrder),
            "timestamp" | "submission_timestamp" => Ok(Self::SubmissionTimestamp),
            other => Err(format!("unknown conflict policy '{other}'")),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaintOutcome {
    Accepted { pixel: Pixel, status: RateStatus },
    /// Accepted, but a newer pixel already held the cell. Nothing was broadcast.
    Superseded { winner: Pixel, status: RateStatus },
    Rejected(RejectReason),
}

impl PaintOutcome {
    pub fn ack(&self) -> PaintAck {
        match self {
            Self::Accepted { pixel, .. } => PaintAck::accepted(pixel.clone()),
            Self::Superseded { winner, .. } => PaintAck::superseded(winner.clone()),
            Self::Rejected(reason) => PaintAck::rejected(*reason),
        }
    }

    pub const fn status(&self) -> Option<RateStatus> {
        match self {
            Self::Accepted { status, .. } | Self::Superseded { status, .. } => Some(*status),
            Self::Rejected(_) => None,
        }
    }
}

/// Best-effort queues fed after each committed paint.
#[derive(Debug, Default, Clone)]
pub struct AuthoritySinks {
    pub persist: Option<mpsc::Sender<Pixel>>,
    pub progression: Option<mpsc::Sender<ProgressionJob>>,
}

/// Sole writer of the live canvas.
///
/// Cells are sharded by room; a paint holds its room's entry while it assigns
/// `seq`, stores the pixel and hands it to the router, so every subscriber
/// sees a cell's writes in commit order.
pub struct PaintAuthority {
    codec: GridCodec,
    tiling: RoomTiling,
    policy: ConflictPolicy,
    ledger: Arc<RateLedger>,
    router: Arc<ViewportRouter>,
    clock: Arc<dyn Clock>,
    observability: Arc<ObservabilityCounters>,
    sinks: AuthoritySinks,
    canvas: DashMap<RoomKey, HashMap<Cell, Pixel>>,
    next_seq: AtomicU64,
    painted: DashMap<String, u64>,
}

impl PaintAuthority {
    pub fn new(
        codec: GridCodec,
        policy: ConflictPolicy,
        ledger: Arc<RateLedger>,
        router: Arc<ViewportRouter>,
        clock: Arc<dyn Clock>,
        observability: Arc<ObservabilityCounters>,
    ) -> Self {
        Self {
            codec,
            tiling: router.tiling(),
            policy,
            ledger,
            router,
            clock,
            observability,
            sinks: AuthoritySinks::default(),
            canvas: DashMap::new(),
            next_seq: AtomicU64::new(0),
            painted: DashMap::new(),
        }
    }

    pub fn with_sinks(mut self, sinks: AuthoritySinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub const fn codec(&self) -> &GridCodec {
        &self.codec
    }

    pub const fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn ledger(&self) -> &RateLedger {
        &self.ledger
    }

    pub fn submit_paint(&self, painter: &Identity, cell: Cell, color: &str) -> PaintOutcome {
        let outcome = self.commit(painter, cell, color);
        match &outcome {
            PaintOutcome::Accepted { pixel, status } => {
                self.observability.record_paint_accepted();
                self.after_commit(pixel);
                self.router
                    .notify_user(&painter.user_id, &ServerMessage::RateStatus(*status));
            }
            PaintOutcome::Superseded { status, .. } => {
                self.observability.record_paint_superseded();
                self.router
                    .notify_user(&painter.user_id, &ServerMessage::RateStatus(*status));
            }
            PaintOutcome::Rejected(reason) => {
                self.observability.record_paint_rejected(reason);
                debug!(user_id = %painter.user_id, %cell, reason = reason.code(), "paint rejected");
            }
        }
        outcome
    }

    fn commit(&self, painter: &Identity, cell: Cell, color: &str) -> PaintOutcome {
        if !self.codec.contains(cell) {
            return PaintOutcome::Rejected(RejectReason::OutOfRange);
        }
        let Ok(color) = HexColor::parse(color) else {
            return PaintOutcome::Rejected(RejectReason::InvalidColor);
        };
        let status = match self.ledger.try_consume(&painter.user_id) {
            ConsumeOutcome::Allowed(status) => status,
            ConsumeOutcome::Denied(reason) => return PaintOutcome::Rejected(reason),
        };

        let submitted_at = self.clock.now();
        let room = self.tiling.room_of(cell);
        let mut shard = self.canvas.entry(room).or_default();

        let painted_at = match (self.policy, shard.get(&cell)) {
            (ConflictPolicy::SubmissionTimestamp, Some(current))
                if current.painted_at > submitted_at =>
            {
                return PaintOutcome::Superseded {
                    winner: current.clone(),
                    status,
                };
            }
            (ConflictPolicy::ArrivalOrder, Some(current)) => submitted_at.max(current.painted_at),
            _ => submitted_at,
        };

        let pixel = Pixel {
            id: self.codec.cell_id(cell),
            cell,
            color,
            painted_by: painter.user_id.clone(),
            painter_name: painter.display_name.clone(),
            painted_at,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        shard.insert(cell, pixel.clone());
        self.router.broadcast(&pixel);
        drop(shard);

        PaintOutcome::Accepted { pixel, status }
    }

    fn after_commit(&self, pixel: &Pixel) {
        let total_painted = {
            let mut count = self.painted.entry(pixel.painted_by.clone()).or_default();
            *count += 1;
            *count
        };

        if let Some(persist) = self.sinks.persist.as_ref() {
            match persist.try_send(pixel.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.observability.record_persist_queue_drop();
                    warn!(seq = pixel.seq, cell = %pixel.cell, "persist queue full; pixel not stored");
                }
                Err(TrySendError::Closed(_)) => {
                    self.observability.record_persist_queue_drop();
                    warn!(seq = pixel.seq, "persister is gone; pixel not stored");
                }
            }
        }

        if let Some(progression) = self.sinks.progression.as_ref() {
            let job = ProgressionJob {
                user_id: pixel.painted_by.clone(),
                total_painted,
            };
            if progression.try_send(job).is_err() {
                self.observability.record_progression_failure();
                debug!(user_id = %pixel.painted_by, "progression queue unavailable; skipping");
            }
        }
    }

    pub fn pixel_at(&self, cell: Cell) -> Option<Pixel> {
        let room = self.tiling.room_of(cell);
        self.canvas
            .get(&room)
            .and_then(|shard| shard.get(&cell).cloned())
    }

    /// Live pixels inside `viewport`, oldest first. Keeps the newest `limit` when capped.
    pub fn snapshot_rect(&self, viewport: Viewport, limit: usize) -> AreaSnapshot {
        let viewport = viewport.normalized();
        let mut pixels = Vec::new();

        let mut collect = |shard: &HashMap<Cell, Pixel>| {
            pixels.extend(
                shard
                    .iter()
                    .filter(|(cell, _)| viewport.contains(**cell))
                    .map(|(_, pixel)| pixel.clone()),
            );
        };

        if self.tiling.room_count(&viewport) > self.canvas.len() as u64 {
            for shard in self.canvas.iter() {
                collect(shard.value());
            }
        } else {
            for room in self.tiling.rooms_for(&viewport) {
                if let Some(shard) = self.canvas.get(&room) {
                    collect(shard.value());
                }
            }
        }

        let truncated = pixels.len() > limit;
        if truncated {
            pixels.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
            pixels.truncate(limit);
        }
        pixels.sort_unstable_by_key(|pixel| pixel.seq);

        AreaSnapshot {
            count: pixels.len(),
            pixels,
            truncated,
        }
    }

    /// Boot the canvas from storage. Older rows never replace newer ones.
    pub fn load(&self, pixels: impl IntoIterator<Item = Pixel>) -> usize {
        let mut loaded = 0;
        for pixel in pixels {
            if !self.codec.contains(pixel.cell) {
                warn!(cell = %pixel.cell, "skipping stored pixel outside the grid");
                continue;
            }
            self.next_seq.fetch_max(pixel.seq, Ordering::SeqCst);
            let mut shard = self.canvas.entry(self.tiling.room_of(pixel.cell)).or_default();
            let newer = shard
                .get(&pixel.cell)
                .is_none_or(|current| pixel.supersedes(current));
            if newer {
                shard.insert(pixel.cell, pixel);
                loaded += 1;
            }
        }
        loaded
    }

    pub fn seed_painted_counts(&self, counts: impl IntoIterator<Item = (String, u64)>) {
        for (user_id, count) in counts {
            self.painted.insert(user_id, count);
        }
    }

    pub fn painted_count(&self, user_id: &str) -> u64 {
        self.painted.get(user_id).map(|count| *count).unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.canvas.iter().map(|shard| shard.len()).sum()
    }

    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }
}
