//! Sliding-window counters.
//!
//! A [`WindowStore`] answers one question per call: "how many events for this key fall inside
//! the last `window`, and may one more be admitted under `limit`?" Two implementations share
//! the contract:
//!
//! - [`MemoryWindowStore`]: in-process, single-instance, swept periodically by
//!   [`spawn_sweeper`].
//! - A shared backend (see the `hallpass-redis` crate) for multi-instance deployments.
//!
//! An event at time `t` is inside the window at `now` while `now - t < window`.

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod sweeper;

pub use memory::MemoryWindowStore;
pub use sweeper::{spawn_sweeper, SweeperHandle};

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the attempt fit under the limit and was recorded.
    pub admitted: bool,
    /// Events in the window: including this one when admitted, excluding it when rejected.
    pub count: u32,
    /// Timestamp (epoch ms) of the oldest event still in the window.
    pub oldest_in_window: Option<u64>,
}

impl WindowOutcome {
    /// Epoch ms at which the oldest event leaves the window, if any event is tracked.
    pub fn resets_at(&self, window: Duration) -> Option<u64> {
        self.oldest_in_window.map(|oldest| oldest.saturating_add(window_millis(window)))
    }
}

/// Storage interface for sliding-window event logs.
///
/// `admit` must purge expired events for `key`, count what remains and record `now_millis`
/// when the count is below `limit`. Implementations decide how atomic the sequence is; see
/// the backend docs.
#[async_trait]
pub trait WindowStore: Send + Sync + std::fmt::Debug {
    async fn admit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_millis: u64,
    ) -> Result<WindowOutcome, StoreError>;

    /// Forget every event recorded under `key`.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}
