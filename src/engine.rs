//! The decision engine: one call per request.
//!
//! ```rust
//! use hallpass::{EndpointClass, Identity, RateLimitEngine, Role};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = RateLimitEngine::builder().build();
//!     let caller = Identity::new("203.0.113.7", None, Role::Unauthenticated);
//!
//!     let decision = engine.evaluate(&caller, EndpointClass::Auth).await;
//!     assert!(decision.allowed);
//!     assert_eq!(decision.limit, 5);
//!     assert_eq!(decision.remaining, 4);
//! }
//! ```

use crate::backoff::{backoff_multiplier, effective_limit};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, StoreError};
use crate::identity::{Identity, Role};
use crate::policy::{EndpointClass, LimitPolicy, PolicyTable};
use crate::violation::{
    MemoryViolationStore, ViolationPolicy, ViolationRecord, ViolationStore, ViolationTracker,
};
use crate::window::{
    spawn_sweeper, window_millis, MemoryWindowStore, SweeperHandle, WindowOutcome, WindowStore,
};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default deadline for one window-store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of [`RateLimitEngine::evaluate`]. Constructed fresh per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Effective limit after backoff.
    pub limit: u32,
    pub remaining: u32,
    /// Epoch ms at which budget frees up (or the block ends).
    pub reset_at: u64,
    pub violations: u32,
    pub backoff_multiplier: u32,
    /// Set while the principal is blocked.
    pub blocked_until: Option<u64>,
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Whether this rejection comes from a hard block rather than an exhausted window.
    pub fn is_blocked(&self) -> bool {
        self.blocked_until.is_some()
    }

    /// How long the caller should wait before retrying, measured from `now_millis`.
    pub fn retry_after(&self, now_millis: u64) -> Duration {
        if self.allowed {
            return Duration::ZERO;
        }
        let until = self.blocked_until.unwrap_or(self.reset_at);
        Duration::from_millis(until.saturating_sub(now_millis))
    }
}

/// What to do when the window store fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FailOpenMode {
    /// Serve this decision from the in-process store.
    #[default]
    #[serde(rename = "local")]
    LocalFallback,
    /// Admit without counting.
    #[serde(rename = "admit")]
    AdmitAll,
}

impl FromStr for FailOpenMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(FailOpenMode::LocalFallback),
            "admit" => Ok(FailOpenMode::AdmitAll),
            _ => Err(ConfigError::UnknownName(s.to_string())),
        }
    }
}

/// Counter key for one `(class, role, principal)` budget.
pub fn window_key(class: EndpointClass, role: Role, principal: &str) -> String {
    format!("{}:{}:{}", class, role, principal)
}

/// Adaptive rate limiter guarding every endpoint class.
///
/// Clones share the same stores, so one engine can be handed to every request handler.
#[derive(Debug, Clone)]
pub struct RateLimitEngine {
    policies: Arc<PolicyTable>,
    windows: Arc<dyn WindowStore>,
    fallback: MemoryWindowStore,
    local_violations: Option<MemoryViolationStore>,
    tracker: ViolationTracker,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    fail_open: FailOpenMode,
}

impl RateLimitEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Build an engine backed by in-process stores from validated configuration.
    ///
    /// A remote store named in the configuration is not connected here; pass one to
    /// [`EngineBuilder::window_store`] (see the `hallpass-redis` crate).
    pub fn from_config(config: &crate::config::HallpassConfig) -> Result<Self, ConfigError> {
        Ok(EngineBuilder::from_config(config)?.build())
    }

    /// Decide whether `identity` may make one more `class` request now.
    pub async fn evaluate(&self, identity: &Identity, class: EndpointClass) -> Decision {
        let principal = identity.principal();
        let policy = self.policies.get(class, identity.role());
        let history = self.tracker.check(principal).await;
        let now = self.clock.now_millis();

        if let Some(until) = history.blocked_until.filter(|_| history.is_blocked_at(now)) {
            tracing::debug!(
                target: "hallpass::engine",
                principal,
                %class,
                blocked_until = until,
                "rejected: principal blocked"
            );
            return Decision {
                allowed: false,
                limit: effective_limit(policy.limit, history.count),
                remaining: 0,
                reset_at: until,
                violations: history.count,
                backoff_multiplier: backoff_multiplier(history.count),
                blocked_until: Some(until),
            };
        }

        let limit = effective_limit(policy.limit, history.count);
        let key = window_key(class, identity.role(), principal);
        let outcome = self.admit(&key, &policy, limit, now).await;
        let window_ms = window_millis(policy.window);

        if outcome.admitted {
            return Decision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(outcome.count),
                reset_at: now.saturating_add(window_ms),
                violations: history.count,
                backoff_multiplier: backoff_multiplier(history.count),
                blocked_until: None,
            };
        }

        let updated = self.tracker.record(principal).await;
        let reset_at =
            outcome.resets_at(policy.window).unwrap_or_else(|| now.saturating_add(window_ms));
        tracing::debug!(
            target: "hallpass::engine",
            principal,
            %class,
            limit,
            violations = updated.count,
            "rejected: window full"
        );
        Decision {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            violations: updated.count,
            backoff_multiplier: backoff_multiplier(updated.count),
            blocked_until: updated.blocked_until.filter(|_| updated.blocked),
        }
    }

    /// Administrative reset: the next evaluation treats `identity` as brand new.
    ///
    /// Clears the violation history and every window counter of the principal, across all
    /// classes and roles.
    pub async fn reset(&self, identity: &Identity) -> Result<(), StoreError> {
        let principal = identity.principal();
        self.tracker.reset(principal).await?;
        for class in EndpointClass::ALL {
            for role in Role::ALL {
                let key = window_key(class, role, principal);
                self.windows.clear(&key).await?;
                self.fallback.clear(&key).await?;
            }
        }
        Ok(())
    }

    /// Violation history for the monitoring dashboard. Read-only.
    pub async fn violation_stats(&self, identity: &Identity) -> Option<ViolationRecord> {
        self.tracker.stats(identity.principal()).await
    }

    /// Policy applied to `(class, role)` before backoff.
    pub fn policy(&self, class: EndpointClass, role: Role) -> LimitPolicy {
        self.policies.get(class, role)
    }

    /// Current time on the engine's clock, in epoch milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The in-process store used for fallback (and as primary when no shared store is set).
    pub fn local_store(&self) -> &MemoryWindowStore {
        &self.fallback
    }

    /// Start the periodic sweep of the in-process stores on the current runtime.
    pub fn spawn_sweeper(&self, every: Duration) -> SweeperHandle {
        spawn_sweeper(
            self.fallback.clone(),
            self.local_violations.clone(),
            self.clock.clone(),
            every,
        )
    }

    async fn admit(
        &self,
        key: &str,
        policy: &LimitPolicy,
        limit: u32,
        now: u64,
    ) -> WindowOutcome {
        let call = self.windows.admit(key, policy.window, limit, now);
        let result = match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        };
        match result {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    target: "hallpass::engine",
                    key,
                    backend = self.windows.backend(),
                    %error,
                    "window store failed; failing open"
                );
                match self.fail_open {
                    FailOpenMode::LocalFallback => {
                        self.fallback.admit_now(key, policy.window, limit, now)
                    }
                    FailOpenMode::AdmitAll => {
                        WindowOutcome { admitted: true, count: 1, oldest_in_window: None }
                    }
                }
            }
        }
    }
}

/// Assembles a [`RateLimitEngine`]. Every part has an in-process default.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    policies: Option<PolicyTable>,
    windows: Option<Arc<dyn WindowStore>>,
    violations: Option<Arc<dyn ViolationStore>>,
    violation_policy: Option<ViolationPolicy>,
    clock: Option<Arc<dyn Clock>>,
    store_timeout: Option<Duration>,
    fail_open: FailOpenMode,
}

impl EngineBuilder {
    /// Builder preloaded with the validated tables and timeouts of `config`. Stores are left
    /// at their in-process defaults.
    pub fn from_config(config: &crate::config::HallpassConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::default()
            .policies(config.policy_table()?)
            .violation_policy(config.violation_policy()?)
            .store_timeout(config.store_timeout())
            .fail_open(config.fail_open))
    }

    /// Validated limit table; defaults to [`PolicyTable::default`].
    pub fn policies(mut self, table: PolicyTable) -> Self {
        self.policies = Some(table);
        self
    }

    /// Shared window store; defaults to the engine's in-process store.
    pub fn window_store<W: WindowStore + 'static>(mut self, store: W) -> Self {
        self.windows = Some(Arc::new(store));
        self
    }

    /// Violation persistence; defaults to [`MemoryViolationStore`].
    pub fn violation_store<V: ViolationStore + 'static>(mut self, store: V) -> Self {
        self.violations = Some(Arc::new(store));
        self
    }

    pub fn violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.violation_policy = Some(policy);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Deadline for each window-store call.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn fail_open(mut self, mode: FailOpenMode) -> Self {
        self.fail_open = mode;
        self
    }

    pub fn build(self) -> RateLimitEngine {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let fallback = MemoryWindowStore::new();
        let windows = self.windows.unwrap_or_else(|| Arc::new(fallback.clone()));
        let (violations, local_violations) = match self.violations {
            Some(store) => (store, None),
            None => {
                let local = MemoryViolationStore::new();
                (Arc::new(local.clone()) as Arc<dyn ViolationStore>, Some(local))
            }
        };
        let store_timeout = self.store_timeout.unwrap_or(DEFAULT_STORE_TIMEOUT);
        let tracker = ViolationTracker::new(
            violations,
            clock.clone(),
            self.violation_policy.unwrap_or_default(),
        )
        .with_timeout(store_timeout);
        RateLimitEngine {
            policies: Arc::new(self.policies.unwrap_or_default()),
            windows,
            fallback,
            local_violations,
            tracker,
            clock,
            store_timeout,
            fail_open: self.fail_open,
        }
    }
}
