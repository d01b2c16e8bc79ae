use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Computes the next document from the current one. `None` leaves the stored document as it is;
/// `Some((payload, ttl))` replaces it and restarts its TTL.
///
/// Backends may call it more than once per update when they retry after a conflicting write.
pub type Transform<'a> = dyn Fn(Option<&str>) -> Option<(String, Duration)> + Send + Sync + 'a;

/// Persistence for serialized violation records, keyed by principal.
///
/// Records are opaque JSON documents here; [`ViolationTracker`](super::ViolationTracker) owns
/// their shape and lifecycle. A written record must disappear on its own once its `ttl`
/// elapses.
#[async_trait]
pub trait ViolationStore: Send + Sync + std::fmt::Debug {
    /// Fetch the stored document, if present and unexpired at `now_millis`.
    async fn load(&self, principal: &str, now_millis: u64) -> Result<Option<String>, StoreError>;

    /// Atomically read, transform and write the document for `principal`.
    ///
    /// No other update of the same principal may interleave between the read handed to `apply`
    /// and the write of its result. Returns the document stored afterwards.
    async fn update(
        &self,
        principal: &str,
        now_millis: u64,
        apply: &Transform<'_>,
    ) -> Result<Option<String>, StoreError>;

    /// Delete the document. Deleting a missing key is not an error.
    async fn remove(&self, principal: &str) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

#[derive(Debug)]
struct Stored {
    payload: String,
    expires_at: u64,
}

/// In-process violation store with lazy TTL expiry.
///
/// Updates run under one mutex, so concurrent updates of a principal never lose a write.
#[derive(Default, Clone, Debug)]
pub struct MemoryViolationStore {
    records: Arc<Mutex<HashMap<String, Stored>>>,
}

impl MemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stored>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a raw document, bypassing serialization. Useful for seeding tests.
    pub fn insert_raw(&self, principal: &str, payload: impl Into<String>, expires_at: u64) {
        self.lock()
            .insert(principal.to_string(), Stored { payload: payload.into(), expires_at });
    }

    /// Drop every expired document. Returns the number removed.
    pub fn purge_expired(&self, now_millis: u64) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, stored| stored.expires_at > now_millis);
        before - records.len()
    }

    /// Number of documents held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ViolationStore for MemoryViolationStore {
    async fn load(&self, principal: &str, now_millis: u64) -> Result<Option<String>, StoreError> {
        let mut records = self.lock();
        match records.get(principal) {
            Some(stored) if stored.expires_at > now_millis => Ok(Some(stored.payload.clone())),
            Some(_) => {
                records.remove(principal);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        principal: &str,
        now_millis: u64,
        apply: &Transform<'_>,
    ) -> Result<Option<String>, StoreError> {
        let mut records = self.lock();
        let current = records
            .get(principal)
            .filter(|stored| stored.expires_at > now_millis)
            .map(|stored| stored.payload.as_str());
        let Some((payload, ttl)) = apply(current) else {
            return Ok(current.map(str::to_string));
        };
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = now_millis.saturating_add(ttl_ms);
        records.insert(principal.to_string(), Stored { payload: payload.clone(), expires_at });
        Ok(Some(payload))
    }

    async fn remove(&self, principal: &str) -> Result<(), StoreError> {
        self.lock().remove(principal);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(value: &'static str, secs: u64) -> impl Fn(Option<&str>) -> Option<(String, Duration)> {
        move |_| Some((value.to_string(), Duration::from_secs(secs)))
    }

    #[tokio::test]
    async fn documents_expire_after_ttl() {
        let store = MemoryViolationStore::new();
        store.update("p", 1_000, &put("{}", 10)).await.unwrap();
        assert_eq!(store.load("p", 10_999).await.unwrap().as_deref(), Some("{}"));
        assert_eq!(store.load("p", 11_000).await.unwrap(), None);
        assert!(store.is_empty(), "expired document is dropped on read");
    }

    #[tokio::test]
    async fn update_restarts_ttl_and_remove_is_idempotent() {
        let store = MemoryViolationStore::new();
        store.update("p", 0, &put("a", 10)).await.unwrap();
        store.update("p", 9_000, &put("b", 10)).await.unwrap();
        assert_eq!(store.load("p", 15_000).await.unwrap().as_deref(), Some("b"));
        store.remove("p").await.unwrap();
        store.remove("p").await.unwrap();
        assert_eq!(store.load("p", 15_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_sees_current_document_and_may_skip_the_write() {
        let store = MemoryViolationStore::new();
        store.insert_raw("p", "1", 100);
        let append = |current: Option<&str>| {
            Some((format!("{}+", current.unwrap_or("none")), Duration::from_secs(1)))
        };
        assert_eq!(store.update("p", 50, &append).await.unwrap().as_deref(), Some("1+"));
        // expired documents read as absent
        assert_eq!(store.update("p", 5_000, &append).await.unwrap().as_deref(), Some("none+"));

        let keep = |_: Option<&str>| -> Option<(String, Duration)> { None };
        assert_eq!(store.update("p", 5_000, &keep).await.unwrap().as_deref(), Some("none+"));
        assert_eq!(store.update("q", 5_000, &keep).await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_expired_counts_removed() {
        let store = MemoryViolationStore::new();
        store.insert_raw("old", "{}", 100);
        store.insert_raw("new", "{}", 10_000);
        assert_eq!(store.purge_expired(5_000), 1);
        assert_eq!(store.len(), 1);
    }
}
