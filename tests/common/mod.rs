#![allow(dead_code)]

use async_trait::async_trait;
use hallpass::{StoreError, Transform, ViolationStore, WindowOutcome, WindowStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Window store whose every call fails.
#[derive(Debug, Clone, Default)]
pub struct BrokenWindowStore {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl WindowStore for BrokenWindowStore {
    async fn admit(
        &self,
        _key: &str,
        _window: Duration,
        _limit: u32,
        _now_millis: u64,
    ) -> Result<WindowOutcome, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn clear(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn backend(&self) -> &'static str {
        "broken"
    }
}

/// Window store that never answers within any reasonable deadline.
#[derive(Debug, Clone)]
pub struct SlowWindowStore {
    pub delay: Duration,
}

#[async_trait]
impl WindowStore for SlowWindowStore {
    async fn admit(
        &self,
        _key: &str,
        _window: Duration,
        _limit: u32,
        _now_millis: u64,
    ) -> Result<WindowOutcome, StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(WindowOutcome { admitted: false, count: 0, oldest_in_window: None })
    }

    async fn clear(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "slow"
    }
}

/// Violation store whose every call fails.
#[derive(Debug, Clone, Default)]
pub struct BrokenViolationStore;

#[async_trait]
impl ViolationStore for BrokenViolationStore {
    async fn load(&self, _principal: &str, _now_millis: u64) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("read refused".into()))
    }

    async fn update(
        &self,
        _principal: &str,
        _now_millis: u64,
        _apply: &Transform<'_>,
    ) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("write refused".into()))
    }

    async fn remove(&self, _principal: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("delete refused".into()))
    }

    fn backend(&self) -> &'static str {
        "broken"
    }
}

/// Violation store that hangs for `delay` on every call before answering with nothing.
#[derive(Debug, Clone)]
pub struct SlowViolationStore {
    pub delay: Duration,
}

#[async_trait]
impl ViolationStore for SlowViolationStore {
    async fn load(&self, _principal: &str, _now_millis: u64) -> Result<Option<String>, StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }

    async fn update(
        &self,
        _principal: &str,
        _now_millis: u64,
        _apply: &Transform<'_>,
    ) -> Result<Option<String>, StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }

    async fn remove(&self, _principal: &str) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "slow"
    }
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captured formatted log output for the current thread.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self { buffer, _guard: guard }
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }

    /// Lines at WARN level containing `needle`.
    pub fn warnings_containing(&self, needle: &str) -> usize {
        self.contents().lines().filter(|l| l.contains("WARN") && l.contains(needle)).count()
    }
}
