use std::time::{Duration, Instant};

use youplace_shared::Viewport;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);

/// Holds back viewport updates until pan/zoom has been still for the settle delay.
#[derive(Debug, Clone)]
pub struct ViewportDebouncer {
    settle: Duration,
    pending: Option<(Viewport, Instant)>,
    last_sent: Option<Viewport>,
}

impl Default for ViewportDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_DELAY)
    }
}

impl ViewportDebouncer {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            pending: None,
            last_sent: None,
        }
    }

    /// Records the latest viewport; each call restarts the settle timer.
    pub fn observe(&mut self, viewport: Viewport, now: Instant) {
        self.pending = Some((viewport.normalized(), now));
    }

    /// Viewport to send, once settled and different from the last one sent.
    pub fn poll(&mut self, now: Instant) -> Option<Viewport> {
        let (viewport, observed_at) = self.pending?;
        if now.saturating_duration_since(observed_at) < self.settle {
            return None;
        }
        self.pending = None;
        if self.last_sent == Some(viewport) {
            return None;
        }
        self.last_sent = Some(viewport);
        Some(viewport)
    }

    /// Time left before [`poll`](Self::poll) can fire.
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        let (_, observed_at) = self.pending?;
        Some(self.settle.saturating_sub(now.saturating_duration_since(observed_at)))
    }

    /// Latest known viewport, to be sent right away on a fresh connection.
    ///
    /// Skips the settle delay and counts the viewport as sent.
    pub fn force_resend(&mut self) -> Option<Viewport> {
        let viewport = self
            .pending
            .take()
            .map(|(viewport, _)| viewport)
            .or(self.last_sent);
        self.last_sent = viewport;
        viewport
    }

    pub fn last_sent(&self) -> Option<Viewport> {
        self.last_sent
    }
}
