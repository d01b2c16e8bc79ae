use crate::error::StoreError;
use crate::window::{window_millis, WindowOutcome, WindowStore};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Upper bound on events kept per key, so a flood of rejected attempts cannot grow one
/// entry without limit. Attempts beyond it are still answered, just not recorded.
pub const MAX_EVENTS_PER_KEY: usize = 4096;

#[derive(Debug, Default)]
struct WindowEntry {
    window_ms: u64,
    events: VecDeque<u64>,
}

impl WindowEntry {
    fn purge(&mut self, now: u64) {
        let window_ms = self.window_ms;
        while let Some(&oldest) = self.events.front() {
            if now.saturating_sub(oldest) >= window_ms {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        match self.events.back() {
            Some(&newest) => now.saturating_sub(newest) >= self.window_ms,
            None => true,
        }
    }
}

/// In-process sliding-window store.
///
/// Exclusive to the process that created it; clones share the same map. Every attempt is
/// recorded, including rejected ones, so a caller hammering a full window keeps it full.
/// Memory is bounded by [`sweep`](Self::sweep), normally driven by
/// [`spawn_sweeper`](crate::window::spawn_sweeper).
#[derive(Default, Clone, Debug)]
pub struct MemoryWindowStore {
    entries: Arc<Mutex<HashMap<String, WindowEntry>>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WindowEntry>> {
        // Entries are plain data; a panic mid-update leaves nothing worth discarding.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronous core of [`WindowStore::admit`].
    pub fn admit_now(&self, key: &str, window: Duration, limit: u32, now: u64) -> WindowOutcome {
        let mut entries = self.lock();
        let entry = entries.entry(key.to_string()).or_default();
        entry.window_ms = window_millis(window);
        entry.purge(now);

        let count = u32::try_from(entry.events.len()).unwrap_or(u32::MAX);
        let admitted = count < limit;
        if entry.events.len() < MAX_EVENTS_PER_KEY {
            entry.events.push_back(now);
        }
        let oldest_in_window = entry.events.front().copied();
        WindowOutcome {
            admitted,
            count: if admitted { count.saturating_add(1) } else { count },
            oldest_in_window,
        }
    }

    /// Drop keys whose newest event has left its window. Returns the number removed.
    pub fn sweep(&self, now: u64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of keys currently held.
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    /// Forget every key.
    pub fn clear_all(&self) {
        self.lock().clear();
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn admit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_millis: u64,
    ) -> Result<WindowOutcome, StoreError> {
        Ok(self.admit_now(key, window, limit, now_millis))
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
