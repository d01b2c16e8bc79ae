//! Background expiry for the in-process stores.

use crate::clock::Clock;
use crate::violation::MemoryViolationStore;
use crate::window::MemoryWindowStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Handle to a running sweeper. The task stops when the handle is dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop sweeping.
    pub fn shutdown(self) {
        self.task.abort();
    }

    /// Whether the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sweep `store` (and `violations`, when the in-process violation store is in use) every
/// `every` on the current tokio runtime.
///
/// The first sweep runs one full interval after spawning. Must be called from within a
/// runtime.
pub fn spawn_sweeper(
    store: MemoryWindowStore,
    violations: Option<MemoryViolationStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> SweeperHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = clock.now_millis();
            let removed = store.sweep(now);
            if removed > 0 {
                tracing::debug!(
                    target: "hallpass::window",
                    removed,
                    remaining = store.tracked_keys(),
                    "swept expired window entries"
                );
            }
            if let Some(violations) = &violations {
                let expired = violations.purge_expired(now);
                if expired > 0 {
                    tracing::debug!(
                        target: "hallpass::violations",
                        expired,
                        "dropped expired violation records"
                    );
                }
            }
        }
    });
    SweeperHandle { task }
}
