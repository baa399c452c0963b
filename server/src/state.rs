use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;
use youplace_shared::{GridCodec, Pixel, RejectReason, RoomTiling};

use crate::authority::{AuthoritySinks, PaintAuthority};
use crate::clock::Clock;
use crate::config::{
    PERSIST_QUEUE_CAPACITY, PROGRESSION_QUEUE_CAPACITY, Settings, upstream_connect_timeout,
    upstream_http_timeout,
};
use crate::identity::IdentityProvider;
use crate::ledger::RateLedger;
use crate::progression::{ProgressionHook, ProgressionJob};
use crate::router::ViewportRouter;
use crate::store::PixelStore;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub codec: GridCodec,
    pub ledger: Arc<RateLedger>,
    pub router: Arc<ViewportRouter>,
    pub authority: Arc<PaintAuthority>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Durable pixel storage: Postgres when DATABASE_URL is set, memory otherwise.
    pub store: Arc<dyn PixelStore>,
    pub observability: Arc<ObservabilityCounters>,
    pub started_at: DateTime<Utc>,
}

/// External collaborators wired into the engine at startup.
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub progression: Arc<dyn ProgressionHook>,
    pub store: Arc<dyn PixelStore>,
    pub clock: Arc<dyn Clock>,
}

/// Receiving ends of the authority's best-effort queues, drained by background services.
pub struct WorkerQueues {
    pub persist_rx: mpsc::Receiver<Pixel>,
    pub progression_rx: mpsc::Receiver<ProgressionJob>,
    pub progression: Arc<dyn ProgressionHook>,
}

#[derive(Debug, Default)]
pub struct ObservabilityCounters {
    paints_accepted_total: AtomicU64,
    paints_superseded_total: AtomicU64,
    paints_rejected_invalid_color_total: AtomicU64,
    paints_rejected_cooldown_total: AtomicU64,
    paints_rejected_credits_total: AtomicU64,
    paints_rejected_out_of_range_total: AtomicU64,
    dropped_broadcasts_total: AtomicU64,
    resyncs_total: AtomicU64,
    persisted_pixels_total: AtomicU64,
    persist_failures_total: AtomicU64,
    persist_queue_drops_total: AtomicU64,
    progression_failures_total: AtomicU64,
    level_ups_total: AtomicU64,
    identity_failures_total: AtomicU64,
    ws_connections_total: AtomicU64,
    sse_connections_total: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ObservabilitySnapshot {
    pub paints_accepted_total: u64,
    pub paints_superseded_total: u64,
    pub paints_rejected_invalid_color_total: u64,
    pub paints_rejected_cooldown_total: u64,
    pub paints_rejected_credits_total: u64,
    pub paints_rejected_out_of_range_total: u64,
    pub dropped_broadcasts_total: u64,
    pub resyncs_total: u64,
    pub persisted_pixels_total: u64,
    pub persist_failures_total: u64,
    pub persist_queue_drops_total: u64,
    pub progression_failures_total: u64,
    pub level_ups_total: u64,
    pub identity_failures_total: u64,
    pub ws_connections_total: u64,
    pub sse_connections_total: u64,
}

impl ObservabilityCounters {
    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            paints_accepted_total: self.paints_accepted_total.load(Ordering::Relaxed),
            paints_superseded_total: self.paints_superseded_total.load(Ordering::Relaxed),
            paints_rejected_invalid_color_total: self
                .paints_rejected_invalid_color_total
                .load(Ordering::Relaxed),
            paints_rejected_cooldown_total: self
                .paints_rejected_cooldown_total
                .load(Ordering::Relaxed),
            paints_rejected_credits_total: self
                .paints_rejected_credits_total
                .load(Ordering::Relaxed),
            paints_rejected_out_of_range_total: self
                .paints_rejected_out_of_range_total
                .load(Ordering::Relaxed),
            dropped_broadcasts_total: self.dropped_broadcasts_total.load(Ordering::Relaxed),
            resyncs_total: self.resyncs_total.load(Ordering::Relaxed),
            persisted_pixels_total: self.persisted_pixels_total.load(Ordering::Relaxed),
            persist_failures_total: self.persist_failures_total.load(Ordering::Relaxed),
            persist_queue_drops_total: self.persist_queue_drops_total.load(Ordering::Relaxed),
            progression_failures_total: self.progression_failures_total.load(Ordering::Relaxed),
            level_ups_total: self.level_ups_total.load(Ordering::Relaxed),
            identity_failures_total: self.identity_failures_total.load(Ordering::Relaxed),
            ws_connections_total: self.ws_connections_total.load(Ordering::Relaxed),
            sse_connections_total: self.sse_connections_total.load(Ordering::Relaxed),
        }
    }

    pub fn record_paint_accepted(&self) {
        self.paints_accepted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_paint_superseded(&self) {
        self.paints_superseded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_paint_rejected(&self, reason: &RejectReason) {
        let counter = match reason {
            RejectReason::InvalidColor => &self.paints_rejected_invalid_color_total,
            RejectReason::CooldownActive { .. } => &self.paints_rejected_cooldown_total,
            RejectReason::InsufficientCredits => &self.paints_rejected_credits_total,
            RejectReason::OutOfRange => &self.paints_rejected_out_of_range_total,
            RejectReason::Timeout => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_broadcasts(&self, count: u64) {
        self.dropped_broadcasts_total
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted_pixels(&self, count: u64) {
        self.persisted_pixels_total
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_queue_drop(&self) {
        self.persist_queue_drops_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_progression_failure(&self) {
        self.progression_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_level_up(&self) {
        self.level_ups_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_identity_failure(&self) {
        self.identity_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ws_connection(&self) {
        self.ws_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sse_connection(&self) {
        self.sse_connections_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn build_http_client() -> reqwest::Client {
    let request_timeout = upstream_http_timeout();
    let connect_timeout = upstream_connect_timeout();
    reqwest::Client::builder()
        .user_agent("youplace/0.1")
        .timeout(request_timeout)
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(
                error = %e,
                "failed to build configured HTTP client, falling back to defaults"
            );
            reqwest::Client::new()
        })
}

impl AppState {
    pub fn new(settings: Settings, collaborators: Collaborators) -> (Self, WorkerQueues) {
        let Collaborators {
            identity,
            progression,
            store,
            clock,
        } = collaborators;

        let codec = GridCodec::new(settings.cell_size_microdeg).unwrap_or_else(|| {
            warn!(
                cell_size_microdeg = settings.cell_size_microdeg,
                "cell size does not tile the globe; using the default grid"
            );
            GridCodec::default()
        });
        let tiling = RoomTiling::new(settings.room_size_cells).unwrap_or_default();
        let observability = Arc::new(ObservabilityCounters::default());

        let router = Arc::new(ViewportRouter::new(
            tiling,
            settings.max_rooms_per_client,
            settings.outbound_queue_capacity,
            Arc::clone(&observability),
        ));
        let ledger = Arc::new(RateLedger::new(settings.bucket, Arc::clone(&clock)));

        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE_CAPACITY);
        let (progression_tx, progression_rx) = mpsc::channel(PROGRESSION_QUEUE_CAPACITY);
        let authority = PaintAuthority::new(
            codec,
            settings.conflict_policy,
            Arc::clone(&ledger),
            Arc::clone(&router),
            clock,
            Arc::clone(&observability),
        )
        .with_sinks(AuthoritySinks {
            persist: Some(persist_tx),
            progression: Some(progression_tx),
        });

        let state = Self {
            settings: Arc::new(settings),
            codec,
            ledger,
            router,
            authority: Arc::new(authority),
            identity,
            store,
            observability,
            started_at: Utc::now(),
        };
        let queues = WorkerQueues {
            persist_rx,
            progression_rx,
            progression,
        };
        (state, queues)
    }
}
