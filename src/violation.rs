//! Per-principal abuse history and the blocking state machine.
//!
//! One [`ViolationRecord`] exists per principal, shared by every endpoint class: a caller
//! abusing one class is presumed adversarial everywhere.
//!
//! ```text
//! NORMAL(count 0..threshold-1) --threshold-th exceed--> BLOCKED
//! BLOCKED --now >= blocked_until--> NORMAL(count 0)
//! ```
//!
//! Records expire `history_ttl` after the last violation, refreshed on every exceed.

use crate::backoff::{Backoff, BackoffError};
use crate::clock::Clock;
use crate::engine::DEFAULT_STORE_TIMEOUT;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod store;

pub use store::{MemoryViolationStore, Transform, ViolationStore};

/// Abuse history for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub identity: String,
    pub count: u32,
    pub first_violation: u64,
    pub last_violation: u64,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<u64>,
}

impl ViolationRecord {
    /// A principal with no history.
    pub fn clean(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            count: 0,
            first_violation: 0,
            last_violation: 0,
            blocked: false,
            blocked_until: None,
        }
    }

    /// Whether the block is still in force at `now`.
    pub fn is_blocked_at(&self, now: u64) -> bool {
        self.blocked && matches!(self.blocked_until, Some(until) if now < until)
    }

    fn block_elapsed(&self, now: u64) -> bool {
        self.blocked && !self.is_blocked_at(now)
    }

    fn clear_block(&mut self) {
        self.count = 0;
        self.blocked = false;
        self.blocked_until = None;
    }
}

/// Thresholds and durations governing escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationPolicy {
    block_threshold: u32,
    block_backoff: Backoff,
    history_ttl: Duration,
}

impl ViolationPolicy {
    /// Block on the `block_threshold`-th violation for `base_block * 2^(count - threshold)`,
    /// capped at `max_block`; forget history `history_ttl` after the last violation.
    pub fn new(
        block_threshold: u32,
        base_block: Duration,
        max_block: Duration,
        history_ttl: Duration,
    ) -> Result<Self, BackoffError> {
        let block_backoff = Backoff::exponential(base_block).with_max(max_block)?;
        Ok(Self { block_threshold: block_threshold.max(1), block_backoff, history_ttl })
    }

    pub fn block_threshold(&self) -> u32 {
        self.block_threshold
    }

    pub fn history_ttl(&self) -> Duration {
        self.history_ttl
    }

    /// Block length for a principal that has just reached `count` violations, or `None` if
    /// `count` is below the threshold.
    pub fn block_duration(&self, count: u32) -> Option<Duration> {
        if count < self.block_threshold {
            return None;
        }
        let attempt = (count - self.block_threshold) as usize + 1;
        Some(self.block_backoff.delay(attempt))
    }
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        Self {
            block_threshold: 5,
            block_backoff: Backoff::capped(Duration::from_secs(60), Duration::from_secs(60 * 60)),
            history_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Reads and evolves violation records over a [`ViolationStore`].
///
/// Store failures never reach request-time callers: reads fall back to a clean history and
/// writes are dropped, both with a warning. Every store call is bounded by the tracker's
/// timeout.
#[derive(Debug, Clone)]
pub struct ViolationTracker {
    store: Arc<dyn ViolationStore>,
    clock: Arc<dyn Clock>,
    policy: ViolationPolicy,
    timeout: Duration,
}

impl ViolationTracker {
    pub fn new(
        store: Arc<dyn ViolationStore>,
        clock: Arc<dyn Clock>,
        policy: ViolationPolicy,
    ) -> Self {
        Self { store, clock, policy, timeout: DEFAULT_STORE_TIMEOUT }
    }

    /// Deadline for each violation-store call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &ViolationPolicy {
        &self.policy
    }

    /// Current state for `principal`, lifting an elapsed block first so callers never see a
    /// stale one.
    pub async fn check(&self, principal: &str) -> ViolationRecord {
        let now = self.clock.now_millis();
        let Some(mut record) = self.load(principal, now).await else {
            return ViolationRecord::clean(principal);
        };
        if !record.block_elapsed(now) {
            return record;
        }

        let lift = |raw: Option<&str>| {
            let mut latest = self.decode(principal, raw)?;
            if !latest.block_elapsed(now) {
                return None;
            }
            latest.clear_block();
            self.encode(&latest, now)
        };
        match self.bounded(self.store.update(principal, now, &lift)).await {
            Ok(stored) => {
                record = self
                    .decode(principal, stored.as_deref())
                    .unwrap_or_else(|| ViolationRecord::clean(principal));
            }
            Err(error) => {
                self.write_failed(principal, &error);
                record.clear_block();
            }
        }
        tracing::info!(
            target: "hallpass::violations",
            principal,
            "block elapsed; violation count reset"
        );
        record
    }

    /// Count one more limit exceed for `principal` and return the updated record.
    ///
    /// The increment is applied atomically in the store, so concurrent exceeds each count.
    pub async fn record(&self, principal: &str) -> ViolationRecord {
        let now = self.clock.now_millis();
        let bump = |raw: Option<&str>| {
            let next = self.next_record(principal, self.decode(principal, raw), now);
            self.encode(&next, now)
        };
        let record = match self.bounded(self.store.update(principal, now, &bump)).await {
            Ok(Some(stored)) => self.decode(principal, Some(&stored)),
            Ok(None) => None,
            Err(error) => {
                self.write_failed(principal, &error);
                None
            }
        }
        .unwrap_or_else(|| self.next_record(principal, None, now));

        if record.blocked {
            tracing::warn!(
                target: "hallpass::violations",
                principal,
                violations = record.count,
                blocked_until = record.blocked_until,
                "principal blocked"
            );
        }
        record
    }

    /// Remove all history for `principal`.
    pub async fn reset(&self, principal: &str) -> Result<(), StoreError> {
        self.bounded(self.store.remove(principal)).await?;
        tracing::info!(target: "hallpass::violations", principal, "violation history reset");
        Ok(())
    }

    /// Record for `principal` as of now, without side effects. An elapsed block reads as
    /// lifted. `None` when there is no history.
    pub async fn stats(&self, principal: &str) -> Option<ViolationRecord> {
        let now = self.clock.now_millis();
        let mut record = self.load(principal, now).await?;
        if record.block_elapsed(now) {
            record.clear_block();
        }
        Some(record)
    }

    fn next_record(
        &self,
        principal: &str,
        current: Option<ViolationRecord>,
        now: u64,
    ) -> ViolationRecord {
        let mut record = current.unwrap_or_else(|| ViolationRecord::clean(principal));
        if record.block_elapsed(now) {
            record.clear_block();
        }
        if record.count == 0 {
            record.first_violation = now;
        }
        record.count = record.count.saturating_add(1);
        record.last_violation = now;

        if let Some(block) = self.policy.block_duration(record.count) {
            let block_ms = u64::try_from(block.as_millis()).unwrap_or(u64::MAX);
            record.blocked = true;
            record.blocked_until = Some(now.saturating_add(block_ms));
        }
        record
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.timeout)))
    }

    async fn load(&self, principal: &str, now: u64) -> Option<ViolationRecord> {
        match self.bounded(self.store.load(principal, now)).await {
            Ok(raw) => self.decode(principal, raw.as_deref()),
            Err(error) => {
                tracing::warn!(
                    target: "hallpass::violations",
                    principal,
                    backend = self.store.backend(),
                    %error,
                    "violation store read failed; assuming clean history"
                );
                None
            }
        }
    }

    fn decode(&self, principal: &str, raw: Option<&str>) -> Option<ViolationRecord> {
        match serde_json::from_str::<ViolationRecord>(raw?) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::debug!(
                    target: "hallpass::violations",
                    principal,
                    %error,
                    "discarding malformed violation record"
                );
                None
            }
        }
    }

    fn encode(&self, record: &ViolationRecord, now: u64) -> Option<(String, Duration)> {
        match serde_json::to_string(record) {
            Ok(payload) => Some((payload, self.remaining_ttl(record, now))),
            Err(error) => {
                tracing::warn!(target: "hallpass::violations", %error, "cannot encode violation record");
                None
            }
        }
    }

    fn write_failed(&self, principal: &str, error: &StoreError) {
        tracing::warn!(
            target: "hallpass::violations",
            principal,
            backend = self.store.backend(),
            %error,
            "violation store write failed; record not persisted"
        );
    }

    /// TTL measured from the last violation, never shorter than an active block.
    fn remaining_ttl(&self, record: &ViolationRecord, now: u64) -> Duration {
        let ttl_ms = u64::try_from(self.policy.history_ttl.as_millis()).unwrap_or(u64::MAX);
        let expires = record.last_violation.saturating_add(ttl_ms);
        let expires = record.blocked_until.map_or(expires, |until| expires.max(until));
        Duration::from_millis(expires.saturating_sub(now).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker() -> (ViolationTracker, ManualClock, MemoryViolationStore) {
        let clock = ManualClock::new(1_000_000);
        let store = MemoryViolationStore::new();
        let tracker = ViolationTracker::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            ViolationPolicy::default(),
        );
        (tracker, clock, store)
    }

    #[test]
    fn default_policy_blocks_at_five_with_capped_exponent() {
        let policy = ViolationPolicy::default();
        assert_eq!(policy.block_duration(4), None);
        assert_eq!(policy.block_duration(5), Some(Duration::from_secs(60)));
        assert_eq!(policy.block_duration(6), Some(Duration::from_secs(120)));
        assert_eq!(policy.block_duration(10), Some(Duration::from_secs(1920)));
        assert_eq!(policy.block_duration(11), Some(Duration::from_secs(3600)));
        assert_eq!(policy.block_duration(40), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn record_counts_and_tracks_timestamps() {
        let (tracker, clock, _) = tracker();
        let first = tracker.record("p").await;
        assert_eq!(first.count, 1);
        assert_eq!(first.first_violation, 1_000_000);
        assert!(!first.blocked);

        clock.advance(Duration::from_secs(5));
        let second = tracker.record("p").await;
        assert_eq!(second.count, 2);
        assert_eq!(second.first_violation, 1_000_000);
        assert_eq!(second.last_violation, 1_005_000);
    }

    #[tokio::test]
    async fn fifth_violation_blocks_for_one_minute() {
        let (tracker, _, _) = tracker();
        for _ in 0..4 {
            assert!(!tracker.record("p").await.blocked);
        }
        let record = tracker.record("p").await;
        assert!(record.blocked);
        assert_eq!(record.blocked_until, Some(1_060_000));
        assert!(tracker.check("p").await.is_blocked_at(1_000_000));
    }

    #[tokio::test]
    async fn check_lifts_elapsed_block() {
        let (tracker, clock, _) = tracker();
        for _ in 0..5 {
            tracker.record("p").await;
        }
        clock.advance(Duration::from_secs(60));
        let record = tracker.check("p").await;
        assert_eq!(record.count, 0);
        assert!(!record.blocked);
        assert_eq!(record.blocked_until, None);
        // the reset is persisted
        assert_eq!(tracker.stats("p").await.map(|r| r.count), Some(0));
    }

    #[tokio::test]
    async fn stats_show_an_elapsed_block_as_lifted_without_writing() {
        let (tracker, clock, store) = tracker();
        for _ in 0..5 {
            tracker.record("p").await;
        }
        clock.set(10_000_000);
        let stats = tracker.stats("p").await.expect("history still within ttl");
        assert!(!stats.blocked);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.blocked_until, None);

        let raw = store.load("p", 10_000_000).await.unwrap().unwrap();
        let stored: ViolationRecord = serde_json::from_str(&raw).unwrap();
        assert!(stored.blocked, "stats must not persist the lift");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_records_are_all_counted() {
        let (tracker, _, _) = tracker();
        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.record("p").await.count })
            })
            .collect();
        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=200).collect::<Vec<u32>>());
        assert_eq!(tracker.stats("p").await.map(|r| r.count), Some(200));
    }

    #[tokio::test]
    async fn history_expires_after_a_day_of_silence() {
        let (tracker, clock, _) = tracker();
        tracker.record("p").await;
        clock.advance(Duration::from_secs(24 * 60 * 60 - 1));
        assert!(tracker.stats("p").await.is_some());
        tracker.record("p").await;
        clock.advance(Duration::from_secs(24 * 60 * 60 - 1));
        assert_eq!(tracker.stats("p").await.map(|r| r.count), Some(2));
        clock.advance(Duration::from_secs(1));
        assert!(tracker.stats("p").await.is_none());
    }

    #[tokio::test]
    async fn malformed_record_reads_as_clean() {
        let (tracker, _, store) = tracker();
        store.insert_raw("p", "{not json", u64::MAX);
        assert!(tracker.stats("p").await.is_none());
        assert_eq!(tracker.check("p").await, ViolationRecord::clean("p"));
        assert_eq!(tracker.record("p").await.count, 1);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let (tracker, _, _) = tracker();
        for _ in 0..6 {
            tracker.record("p").await;
        }
        tracker.reset("p").await.unwrap();
        assert!(tracker.stats("p").await.is_none());
        assert_eq!(tracker.check("p").await.count, 0);
    }

    #[test]
    fn record_serializes_with_camel_case_fields() {
        let mut record = ViolationRecord::clean("1.2.3.4");
        record.count = 5;
        record.blocked = true;
        record.blocked_until = Some(42);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["firstViolation"], 0);
        assert_eq!(json["blockedUntil"], 42);
        let clean = serde_json::to_value(ViolationRecord::clean("x")).unwrap();
        assert!(clean.get("blockedUntil").is_none());
    }
}
