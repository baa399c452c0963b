use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use youplace_shared::{RateStatus, RejectReason};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_amount: u32,
    pub refill_interval: TimeDelta,
    /// Credits granted to a user the ledger has never seen.
    pub initial_credits: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_amount: 1,
            refill_interval: TimeDelta::seconds(30),
            initial_credits: 100,
        }
    }
}

impl BucketConfig {
    fn interval_ms(&self) -> i64 {
        self.refill_interval.num_milliseconds().max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Allowed(RateStatus),
    Denied(RejectReason),
}

#[derive(Debug, Clone)]
struct RateState {
    tokens: u32,
    last_refill_at: DateTime<Utc>,
    credits: u64,
}

impl RateState {
    fn fresh(config: &BucketConfig, credits: u64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: config.capacity,
            last_refill_at: now,
            credits,
        }
    }

    /// Lazily add the tokens earned by whole elapsed intervals.
    fn refill(&mut self, config: &BucketConfig, now: DateTime<Utc>) {
        if self.tokens >= config.capacity {
            self.tokens = config.capacity;
            self.last_refill_at = now;
            return;
        }

        let interval_ms = config.interval_ms();
        let elapsed_ms = now
            .signed_duration_since(self.last_refill_at)
            .num_milliseconds();
        if elapsed_ms < interval_ms {
            return;
        }

        let steps = elapsed_ms / interval_ms;
        let gained = u64::try_from(steps)
            .unwrap_or(u64::MAX)
            .saturating_mul(u64::from(config.refill_amount));
        let tokens = (u64::from(self.tokens).saturating_add(gained)).min(u64::from(config.capacity));
        self.tokens = tokens as u32;

        if self.tokens >= config.capacity {
            self.last_refill_at = now;
        } else {
            self.last_refill_at += TimeDelta::milliseconds(steps * interval_ms);
        }
    }

    fn seconds_until_refill(&self, config: &BucketConfig, now: DateTime<Utc>) -> u64 {
        if self.tokens >= config.capacity {
            return 0;
        }
        let elapsed_ms = now
            .signed_duration_since(self.last_refill_at)
            .num_milliseconds()
            .max(0);
        let remaining_ms = (config.interval_ms() - elapsed_ms).max(1);
        (remaining_ms as u64).div_ceil(1000)
    }

    fn status(&self, config: &BucketConfig, now: DateTime<Utc>) -> RateStatus {
        RateStatus {
            tokens: self.tokens,
            max_tokens: config.capacity,
            credits: self.credits,
            next_refill_seconds: self.seconds_until_refill(config, now),
        }
    }
}

/// Per-user cooldown bucket and credit balance.
///
/// Each user's state lives behind its own map entry, so concurrent attempts by
/// the same user (several tabs) serialize while different users never contend
/// on anything wider than a map shard.
pub struct RateLedger {
    config: BucketConfig,
    clock: Arc<dyn Clock>,
    states: DashMap<String, RateState>,
}

impl RateLedger {
    pub fn new(config: BucketConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: DashMap::new(),
        }
    }

    pub const fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Check both gates and, when both pass, spend one token and one credit.
    pub fn try_consume(&self, user_id: &str) -> ConsumeOutcome {
        let now = self.clock.now();
        let mut entry = self
            .states
            .entry(user_id.to_owned())
            .or_insert_with(|| RateState::fresh(&self.config, self.config.initial_credits, now));
        let state = entry.value_mut();
        state.refill(&self.config, now);

        if state.credits == 0 {
            return ConsumeOutcome::Denied(RejectReason::InsufficientCredits);
        }
        if state.tokens == 0 {
            return ConsumeOutcome::Denied(RejectReason::CooldownActive {
                seconds_remaining: state.seconds_until_refill(&self.config, now),
            });
        }

        state.tokens -= 1;
        state.credits -= 1;
        ConsumeOutcome::Allowed(state.status(&self.config, now))
    }

    /// Current budget without spending anything. Unknown users report a fresh bucket.
    pub fn status(&self, user_id: &str) -> RateStatus {
        let now = self.clock.now();
        match self.states.get_mut(user_id) {
            Some(mut state) => {
                state.refill(&self.config, now);
                state.status(&self.config, now)
            }
            None => RateState::fresh(&self.config, self.config.initial_credits, now)
                .status(&self.config, now),
        }
    }

    /// Create the user's state from the identity provider's balance; existing state wins.
    pub fn seed(&self, user_id: &str, credits: u64) -> RateStatus {
        let now = self.clock.now();
        let mut entry = self
            .states
            .entry(user_id.to_owned())
            .or_insert_with(|| RateState::fresh(&self.config, credits, now));
        let state = entry.value_mut();
        state.refill(&self.config, now);
        state.status(&self.config, now)
    }

    /// Add credits from an external bonus claim.
    pub fn grant_credits(&self, user_id: &str, amount: u64) -> RateStatus {
        let now = self.clock.now();
        let mut entry = self
            .states
            .entry(user_id.to_owned())
            .or_insert_with(|| RateState::fresh(&self.config, self.config.initial_credits, now));
        let state = entry.value_mut();
        state.refill(&self.config, now);
        state.credits = state.credits.saturating_add(amount);
        state.status(&self.config, now)
    }

    pub fn tracked_users(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeDelta, TimeZone, Utc};
    use youplace_shared::RejectReason;

    use super::{BucketConfig, ConsumeOutcome, RateLedger};
    use crate::clock::ManualClock;

    fn ledger(config: BucketConfig) -> (RateLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid start"),
        ));
        (RateLedger::new(config, clock.clone()), clock)
    }

    fn config(capacity: u32, credits: u64) -> BucketConfig {
        BucketConfig {
            capacity,
            refill_amount: 1,
            refill_interval: TimeDelta::seconds(30),
            initial_credits: credits,
        }
    }

    #[test]
    fn consumes_one_token_and_one_credit() {
        let (ledger, _) = ledger(config(10, 5));
        let ConsumeOutcome::Allowed(status) = ledger.try_consume("alice") else {
            panic!("first attempt should be allowed");
        };
        assert_eq!(status.tokens, 9);
        assert_eq!(status.credits, 4);
        assert_eq!(status.max_tokens, 10);
        assert_eq!(status.next_refill_seconds, 30);
    }

    #[test]
    fn empty_bucket_reports_cooldown_with_remaining_seconds() {
        let (ledger, clock) = ledger(config(2, 100));
        assert!(matches!(ledger.try_consume("bob"), ConsumeOutcome::Allowed(_)));
        assert!(matches!(ledger.try_consume("bob"), ConsumeOutcome::Allowed(_)));

        clock.advance(TimeDelta::seconds(12));
        assert_eq!(
            ledger.try_consume("bob"),
            ConsumeOutcome::Denied(RejectReason::CooldownActive {
                seconds_remaining: 18
            })
        );

        clock.advance(TimeDelta::milliseconds(17_500));
        assert_eq!(
            ledger.try_consume("bob"),
            ConsumeOutcome::Denied(RejectReason::CooldownActive {
                seconds_remaining: 1
            })
        );
    }

    #[test]
    fn refill_counts_whole_intervals_and_caps_at_capacity() {
        let (ledger, clock) = ledger(config(3, 100));
        for _ in 0..3 {
            assert!(matches!(ledger.try_consume("carol"), ConsumeOutcome::Allowed(_)));
        }
        assert_eq!(ledger.status("carol").tokens, 0);

        clock.advance(TimeDelta::seconds(65));
        let status = ledger.status("carol");
        assert_eq!(status.tokens, 2);
        assert_eq!(status.next_refill_seconds, 25);

        clock.advance(TimeDelta::hours(1));
        let status = ledger.status("carol");
        assert_eq!(status.tokens, 3);
        assert_eq!(status.next_refill_seconds, 0);
    }

    #[test]
    fn full_bucket_restarts_refill_clock_on_first_spend() {
        let (ledger, clock) = ledger(config(3, 100));
        clock.advance(TimeDelta::hours(2));
        let ConsumeOutcome::Allowed(status) = ledger.try_consume("dave") else {
            panic!("allowed");
        };
        assert_eq!(status.tokens, 2);
        assert_eq!(status.next_refill_seconds, 30);
    }

    #[test]
    fn zero_credits_always_report_insufficient_credits() {
        let (ledger, clock) = ledger(config(10, 0));
        for _ in 0..5 {
            assert_eq!(
                ledger.try_consume("erin"),
                ConsumeOutcome::Denied(RejectReason::InsufficientCredits)
            );
            clock.advance(TimeDelta::minutes(5));
        }
        assert_eq!(ledger.status("erin").tokens, 10);
    }

    #[test]
    fn denied_attempts_do_not_mutate_balances() {
        let (ledger, _) = ledger(config(1, 3));
        assert!(matches!(ledger.try_consume("fay"), ConsumeOutcome::Allowed(_)));
        assert!(matches!(ledger.try_consume("fay"), ConsumeOutcome::Denied(_)));
        let status = ledger.status("fay");
        assert_eq!(status.tokens, 0);
        assert_eq!(status.credits, 2);
    }

    #[test]
    fn seed_and_grant_credits() {
        let (ledger, _) = ledger(config(10, 100));
        assert_eq!(ledger.seed("gus", 1).credits, 1);
        // Existing state is never overwritten by a later seed.
        assert_eq!(ledger.seed("gus", 50).credits, 1);
        assert!(matches!(ledger.try_consume("gus"), ConsumeOutcome::Allowed(_)));
        assert_eq!(
            ledger.try_consume("gus"),
            ConsumeOutcome::Denied(RejectReason::InsufficientCredits)
        );
        assert_eq!(ledger.grant_credits("gus", 5).credits, 5);
        assert!(matches!(ledger.try_consume("gus"), ConsumeOutcome::Allowed(_)));
    }

    #[test]
    fn users_do_not_share_balances() {
        let (ledger, _) = ledger(config(1, 1));
        assert!(matches!(ledger.try_consume("hal"), ConsumeOutcome::Allowed(_)));
        assert!(matches!(ledger.try_consume("ivy"), ConsumeOutcome::Allowed(_)));
        assert_eq!(ledger.tracked_users(), 2);
    }

    #[test]
    fn parallel_attempts_never_overspend_credits() {
        let (ledger, _) = ledger(config(1_000, 7));
        let ledger = Arc::new(ledger);
        let allowed = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..16 {
                let ledger = Arc::clone(&ledger);
                let allowed = Arc::clone(&allowed);
                scope.spawn(move || {
                    for _ in 0..8 {
                        if matches!(ledger.try_consume("jay"), ConsumeOutcome::Allowed(_)) {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::SeqCst), 7);
        let status = ledger.status("jay");
        assert_eq!(status.credits, 0);
        assert_eq!(status.tokens, 1_000 - 7);
    }

    #[test]
    fn parallel_attempts_never_overspend_tokens() {
        let (ledger, _) = ledger(config(5, 1_000));
        let ledger = Arc::new(ledger);
        let allowed = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..12 {
                let ledger = Arc::clone(&ledger);
                let allowed = Arc::clone(&allowed);
                scope.spawn(move || {
                    if matches!(ledger.try_consume("kim"), ConsumeOutcome::Allowed(_)) {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::SeqCst), 5);
        assert_eq!(ledger.status("kim").tokens, 0);
    }
}
