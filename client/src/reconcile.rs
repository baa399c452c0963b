//! Two-layer pixel cache for one client.
//!
//! The authoritative layer only ever holds pixels committed by the server and
//! only moves forward by `seq`. The pending layer holds this client's own
//! optimistic edits until server truth for the cell arrives, the paint is
//! rejected, or the edit times out. The layers are merged at read time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use youplace_shared::{Cell, HexColor, PaintAck, Pixel, RejectReason, Viewport};

pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEdit {
    request_id: u64,
    color: HexColor,
    submitted_at: Instant,
}

/// An optimistic edit that was undone, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollback {
    pub request_id: u64,
    pub cell: Cell,
    pub color: HexColor,
    pub reason: RejectReason,
}

#[derive(Debug)]
pub struct ReconciliationCache {
    authoritative: HashMap<Cell, Pixel>,
    pending: HashMap<Cell, PendingEdit>,
    timeout: Duration,
    next_request_id: u64,
}

impl Default for ReconciliationCache {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TIMEOUT)
    }
}

impl ReconciliationCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            authoritative: HashMap::new(),
            pending: HashMap::new(),
            timeout,
            next_request_id: 1,
        }
    }

    /// Shows `color` at `cell` right away and returns the request id to send with the paint.
    ///
    /// A second edit to the same cell replaces the first; the first request's
    /// ack is then ignored.
    pub fn apply_optimistic(&mut self, cell: Cell, color: HexColor, now: Instant) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending.insert(
            cell,
            PendingEdit {
                request_id,
                color,
                submitted_at: now,
            },
        );
        request_id
    }

    /// Merges a committed pixel and drops any pending edit on its cell.
    ///
    /// Returns false when an equal or newer pixel is already known; the
    /// stale event then changes nothing.
    pub fn on_server_event(&mut self, pixel: Pixel) -> bool {
        if self
            .authoritative
            .get(&pixel.cell)
            .is_some_and(|known| !pixel.supersedes(known))
        {
            return false;
        }
        self.pending.remove(&pixel.cell);
        self.authoritative.insert(pixel.cell, pixel);
        true
    }

    /// Drops the pending edit on `cell` and reports what was rolled back.
    pub fn on_rejected(&mut self, cell: Cell, reason: RejectReason) -> Option<Rollback> {
        let edit = self.pending.remove(&cell)?;
        Some(Rollback {
            request_id: edit.request_id,
            cell,
            color: edit.color,
            reason,
        })
    }

    /// Resolves the pending edit that `request_id` belongs to.
    pub fn on_paint_result(&mut self, request_id: u64, ack: PaintAck) -> Option<Rollback> {
        let cell = self
            .pending
            .iter()
            .find(|(_, edit)| edit.request_id == request_id)
            .map(|(cell, _)| *cell);

        if let Some(pixel) = ack.pixel {
            self.on_server_event(pixel);
        }
        let cell = cell?;
        if ack.accepted {
            self.pending.remove(&cell);
            return None;
        }
        let reason = ack.reason.unwrap_or(RejectReason::Timeout);
        self.on_rejected(cell, reason)
    }

    /// Merges a resync snapshot of `viewport` by `seq`; returns how many cells moved forward.
    ///
    /// Cells never go back to empty, so a cell missing from the snapshot keeps
    /// what the cache knows. An event committed after the snapshot was taken
    /// can arrive before it and must survive.
    pub fn on_snapshot(&mut self, viewport: Viewport, pixels: Vec<Pixel>) -> usize {
        let mut merged = 0;
        for pixel in pixels {
            if viewport.contains(pixel.cell) && self.on_server_event(pixel) {
                merged += 1;
            }
        }
        merged
    }

    /// Whether `request_id` still has an unresolved optimistic edit.
    pub fn is_request_pending(&self, request_id: u64) -> bool {
        self.pending
            .values()
            .any(|edit| edit.request_id == request_id)
    }

    /// Gives up on `request_id` before it was ever sent.
    pub fn cancel_request(&mut self, request_id: u64, reason: RejectReason) -> Option<Rollback> {
        let cell = self
            .pending
            .iter()
            .find(|(_, edit)| edit.request_id == request_id)
            .map(|(cell, _)| *cell)?;
        self.on_rejected(cell, reason)
    }

    /// Rolls back every pending edit older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Rollback> {
        let timeout = self.timeout;
        let expired: Vec<Cell> = self
            .pending
            .iter()
            .filter(|(_, edit)| now.saturating_duration_since(edit.submitted_at) >= timeout)
            .map(|(cell, _)| *cell)
            .collect();

        let mut rollbacks: Vec<Rollback> = expired
            .into_iter()
            .filter_map(|cell| self.on_rejected(cell, RejectReason::Timeout))
            .collect();
        rollbacks.sort_by_key(|rollback| rollback.request_id);
        rollbacks
    }

    pub fn color_at(&self, cell: Cell) -> Option<&HexColor> {
        self.pending
            .get(&cell)
            .map(|edit| &edit.color)
            .or_else(|| self.authoritative.get(&cell).map(|pixel| &pixel.color))
    }

    pub fn pixel_at(&self, cell: Cell) -> Option<&Pixel> {
        self.authoritative.get(&cell)
    }

    pub fn is_pending(&self, cell: Cell) -> bool {
        self.pending.contains_key(&cell)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Merged view of `viewport`, ordered by cell.
    pub fn visible_cells(&self, viewport: Viewport) -> Vec<(Cell, HexColor)> {
        let mut cells: HashMap<Cell, &HexColor> = self
            .authoritative
            .iter()
            .filter(|(cell, _)| viewport.contains(**cell))
            .map(|(cell, pixel)| (*cell, &pixel.color))
            .collect();
        for (cell, edit) in &self.pending {
            if viewport.contains(*cell) {
                cells.insert(*cell, &edit.color);
            }
        }

        let mut merged: Vec<(Cell, HexColor)> = cells
            .into_iter()
            .map(|(cell, color)| (cell, color.clone()))
            .collect();
        merged.sort_by_key(|(cell, _)| *cell);
        merged
    }

    /// Highest committed sequence number seen so far.
    pub fn last_seq(&self) -> u64 {
        self.authoritative
            .values()
            .map(|pixel| pixel.seq)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use youplace_shared::{Cell, HexColor, PaintAck, Pixel, RejectReason, Viewport};

    use super::ReconciliationCache;

    fn color(raw: &str) -> HexColor {
        HexColor::parse(raw).expect("valid color")
    }

    fn pixel(x: i32, y: i32, raw: &str, seq: u64) -> Pixel {
        let cell = Cell::new(x, y);
        Pixel {
            id: cell.id(),
            cell,
            color: color(raw),
            painted_by: "someone".to_owned(),
            painter_name: None,
            painted_at: Utc::now(),
            seq,
        }
    }

    #[test]
    fn pending_edit_overlays_authoritative_until_acked() {
        let mut cache = ReconciliationCache::default();
        let cell = Cell::new(3, 4);
        cache.on_server_event(pixel(3, 4, "#000000", 1));

        let request_id = cache.apply_optimistic(cell, color("#FF0000"), Instant::now());
        assert_eq!(cache.color_at(cell), Some(&color("#FF0000")));
        assert!(cache.is_pending(cell));

        let rollback =
            cache.on_paint_result(request_id, PaintAck::accepted(pixel(3, 4, "#FF0000", 3)));
        assert!(rollback.is_none());
        assert!(!cache.is_pending(cell));
        assert_eq!(cache.color_at(cell), Some(&color("#FF0000")));
        assert_eq!(cache.last_seq(), 3);
    }

    #[test]
    fn server_event_replaces_a_pending_edit() {
        let mut cache = ReconciliationCache::default();
        let cell = Cell::new(7, 7);
        let request_id = cache.apply_optimistic(cell, color("#111111"), Instant::now());

        // Another painter won the race; their pixel is the truth.
        assert!(cache.on_server_event(pixel(7, 7, "#222222", 4)));
        assert!(!cache.is_pending(cell));
        assert_eq!(cache.color_at(cell), Some(&color("#222222")));

        // The late superseded ack changes nothing and surfaces no rollback.
        let late = cache.on_paint_result(request_id, PaintAck::superseded(pixel(7, 7, "#222222", 4)));
        assert!(late.is_none());
        assert_eq!(cache.color_at(cell), Some(&color("#222222")));
    }

    #[test]
    fn stale_event_keeps_the_pending_edit() {
        let mut cache = ReconciliationCache::default();
        let cell = Cell::new(4, 4);
        cache.on_server_event(pixel(4, 4, "#000000", 9));
        cache.apply_optimistic(cell, color("#FFFFFF"), Instant::now());

        assert!(!cache.on_server_event(pixel(4, 4, "#333333", 2)));
        assert!(cache.is_pending(cell));
        assert_eq!(cache.color_at(cell), Some(&color("#FFFFFF")));
    }

    #[test]
    fn authoritative_layer_never_moves_backwards() {
        let mut cache = ReconciliationCache::default();
        assert!(cache.on_server_event(pixel(1, 1, "#111111", 5)));
        assert!(!cache.on_server_event(pixel(1, 1, "#222222", 4)));
        assert!(!cache.on_server_event(pixel(1, 1, "#333333", 5)));
        assert_eq!(cache.color_at(Cell::new(1, 1)), Some(&color("#111111")));
    }

    #[test]
    fn rejection_rolls_back_to_the_authoritative_color() {
        let mut cache = ReconciliationCache::default();
        let cell = Cell::new(0, 0);
        cache.on_server_event(pixel(0, 0, "#ABCDEF", 1));
        let request_id = cache.apply_optimistic(cell, color("#123456"), Instant::now());

        let rollback = cache
            .on_paint_result(
                request_id,
                PaintAck::rejected(RejectReason::CooldownActive {
                    seconds_remaining: 12,
                }),
            )
            .expect("rollback");
        assert_eq!(rollback.cell, cell);
        assert_eq!(rollback.color, color("#123456"));
        assert_eq!(
            rollback.reason,
            RejectReason::CooldownActive {
                seconds_remaining: 12
            }
        );
        assert_eq!(cache.color_at(cell), Some(&color("#ABCDEF")));
    }

    #[test]
    fn superseded_paint_shows_the_winner() {
        let mut cache = ReconciliationCache::default();
        let cell = Cell::new(9, 9);
        let request_id = cache.apply_optimistic(cell, color("#FFFFFF"), Instant::now());

        let rollback = cache.on_paint_result(request_id, PaintAck::superseded(pixel(9, 9, "#0000FF", 8)));
        assert!(rollback.is_none());
        assert_eq!(cache.color_at(cell), Some(&color("#0000FF")));
    }

    #[test]
    fn stale_ack_for_a_replaced_edit_is_ignored() {
        let mut cache = ReconciliationCache::default();
        let cell = Cell::new(2, 2);
        let now = Instant::now();
        let first = cache.apply_optimistic(cell, color("#010101"), now);
        let second = cache.apply_optimistic(cell, color("#020202"), now);
        assert_ne!(first, second);

        assert!(
            cache
                .on_paint_result(first, PaintAck::rejected(RejectReason::InsufficientCredits))
                .is_none()
        );
        assert!(cache.is_pending(cell));
        assert_eq!(cache.color_at(cell), Some(&color("#020202")));
    }

    #[test]
    fn unacknowledged_edits_time_out() {
        let mut cache = ReconciliationCache::new(Duration::from_secs(10));
        let start = Instant::now();
        cache.apply_optimistic(Cell::new(0, 0), color("#FF0000"), start);
        cache.apply_optimistic(Cell::new(0, 1), color("#00FF00"), start + Duration::from_secs(5));

        assert!(cache.expire(start + Duration::from_secs(9)).is_empty());

        let rolled_back = cache.expire(start + Duration::from_secs(10));
        assert_eq!(rolled_back.len(), 1);
        assert_eq!(rolled_back[0].cell, Cell::new(0, 0));
        assert_eq!(rolled_back[0].reason, RejectReason::Timeout);
        assert_eq!(cache.color_at(Cell::new(0, 0)), None);
        assert_eq!(cache.pending_count(), 1);
    }

    #[test]
    fn snapshot_merges_by_seq_within_its_viewport() {
        let mut cache = ReconciliationCache::default();
        cache.on_server_event(pixel(1, 1, "#111111", 1));
        cache.on_server_event(pixel(2, 2, "#222222", 2));
        cache.on_server_event(pixel(50, 50, "#555555", 3));

        let merged = cache.on_snapshot(
            Viewport::new(0, 10, 0, 10),
            vec![pixel(2, 2, "#AAAAAA", 7), pixel(60, 60, "#666666", 8)],
        );

        assert_eq!(merged, 1);
        assert_eq!(cache.color_at(Cell::new(1, 1)), Some(&color("#111111")));
        assert_eq!(cache.color_at(Cell::new(2, 2)), Some(&color("#AAAAAA")));
        assert_eq!(cache.color_at(Cell::new(50, 50)), Some(&color("#555555")));
        assert_eq!(cache.color_at(Cell::new(60, 60)), None);
    }

    #[test]
    fn event_committed_after_an_older_snapshot_survives_it() {
        let mut cache = ReconciliationCache::default();
        // The update for a freshly painted cell overtakes the snapshot taken just before it.
        cache.on_server_event(pixel(3, 3, "#333333", 9));
        cache.on_server_event(pixel(4, 4, "#444444", 10));

        cache.on_snapshot(Viewport::new(0, 10, 0, 10), vec![pixel(4, 4, "#000000", 5)]);

        assert_eq!(cache.pixel_at(Cell::new(3, 3)).map(|pixel| pixel.seq), Some(9));
        assert_eq!(cache.color_at(Cell::new(3, 3)), Some(&color("#333333")));
        assert_eq!(cache.color_at(Cell::new(4, 4)), Some(&color("#444444")));
    }

    #[test]
    fn cancelled_request_rolls_back_and_is_no_longer_pending() {
        let mut cache = ReconciliationCache::default();
        let request_id = cache.apply_optimistic(Cell::new(6, 6), color("#FF00FF"), Instant::now());
        assert!(cache.is_request_pending(request_id));

        let rollback = cache
            .cancel_request(request_id, RejectReason::Timeout)
            .expect("rollback");
        assert_eq!(rollback.cell, Cell::new(6, 6));
        assert!(!cache.is_request_pending(request_id));
        assert!(cache.cancel_request(request_id, RejectReason::Timeout).is_none());
    }

    #[test]
    fn visible_cells_merge_both_layers() {
        let mut cache = ReconciliationCache::default();
        cache.on_server_event(pixel(0, 0, "#000000", 1));
        cache.on_server_event(pixel(1, 0, "#111111", 2));
        cache.on_server_event(pixel(20, 20, "#222222", 3));
        cache.apply_optimistic(Cell::new(1, 0), color("#FFFFFF"), Instant::now());
        cache.apply_optimistic(Cell::new(0, 1), color("#EEEEEE"), Instant::now());

        let visible = cache.visible_cells(Viewport::new(0, 5, 0, 5));
        assert_eq!(
            visible,
            vec![
                (Cell::new(0, 0), color("#000000")),
                (Cell::new(0, 1), color("#EEEEEE")),
                (Cell::new(1, 0), color("#FFFFFF")),
            ]
        );
    }
}
