//! Startup configuration.
//!
//! Loaded once, validated once. Everything here is either a literal JSON document
//! ([`HallpassConfig::from_json_str`]) or environment overrides on top of the defaults
//! ([`HallpassConfig::from_env`]).
//!
//! ```json
//! {
//!   "store": { "kind": "remote", "url": "redis://127.0.0.1:6379" },
//!   "store_timeout_ms": 100,
//!   "fail_open": "local",
//!   "violations": { "block_threshold": 5, "base_block_secs": 60 }
//! }
//! ```

use crate::engine::{FailOpenMode, DEFAULT_STORE_TIMEOUT};
use crate::error::ConfigError;
use crate::identity::Role;
use crate::policy::{EndpointClass, LimitPolicy, PolicyTable};
use crate::violation::ViolationPolicy;
use crate::window::sweeper::DEFAULT_SWEEP_INTERVAL;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variable selecting the shared store.
pub const ENV_REDIS_URL: &str = "HALLPASS_REDIS_URL";
pub const ENV_STORE_TIMEOUT_MS: &str = "HALLPASS_STORE_TIMEOUT_MS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "HALLPASS_SWEEP_INTERVAL_SECS";
pub const ENV_FAIL_OPEN: &str = "HALLPASS_FAIL_OPEN";

/// Default key namespace in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "hallpass:";

/// Which window/violation backend to use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process stores only. Correct for a single instance.
    #[default]
    Local,
    /// Shared store reachable at `url`.
    Remote {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// One `(limit, window)` pair in a configured table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyEntry {
    pub limit: u32,
    pub window_secs: u64,
}

/// Escalation settings, see [`ViolationPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViolationConfig {
    pub block_threshold: u32,
    pub base_block_secs: u64,
    pub max_block_secs: u64,
    pub history_ttl_secs: u64,
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            block_threshold: 5,
            base_block_secs: 60,
            max_block_secs: 60 * 60,
            history_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Full configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HallpassConfig {
    pub store: StoreConfig,
    pub store_timeout_ms: u64,
    pub fail_open: FailOpenMode,
    pub sweep_interval_secs: u64,
    pub violations: ViolationConfig,
    /// Complete replacement for the built-in table: `class → role → entry`.
    pub policies: Option<BTreeMap<String, BTreeMap<String, PolicyEntry>>>,
}

impl Default for HallpassConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Local,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT.as_millis() as u64,
            fail_open: FailOpenMode::LocalFallback,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            violations: ViolationConfig::default(),
            policies: None,
        }
    }
}

impl HallpassConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `HALLPASS_*` environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (an environment reader in production).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_REDIS_URL).filter(|v| !v.trim().is_empty()) {
            let key_prefix = match &self.store {
                StoreConfig::Remote { key_prefix, .. } => key_prefix.clone(),
                StoreConfig::Local => default_key_prefix(),
            };
            self.store = StoreConfig::Remote { url: url.trim().to_string(), key_prefix };
        }
        if let Some(raw) = lookup(ENV_STORE_TIMEOUT_MS) {
            self.store_timeout_ms = parse_number(ENV_STORE_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            self.sweep_interval_secs = parse_number(ENV_SWEEP_INTERVAL_SECS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_FAIL_OPEN) {
            self.fail_open = raw.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check every setting; a failure here must stop the process from starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store_timeout_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval_secs",
                reason: "must be > 0".into(),
            });
        }
        if let StoreConfig::Remote { url, .. } = &self.store {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "store.url",
                    reason: "must not be empty".into(),
                });
            }
        }
        self.violation_policy()?;
        self.policy_table()?;
        Ok(())
    }

    /// The validated limit table: the configured one if present, else the built-in one.
    pub fn policy_table(&self) -> Result<PolicyTable, ConfigError> {
        let Some(classes) = &self.policies else {
            return Ok(PolicyTable::default());
        };
        let mut rows = Vec::new();
        for (class_name, roles) in classes {
            let class: EndpointClass = class_name.parse()?;
            for (role_name, entry) in roles {
                let role: Role = role_name.parse()?;
                rows.push(LimitPolicy {
                    class,
                    role,
                    limit: entry.limit,
                    window: Duration::from_secs(entry.window_secs),
                });
            }
        }
        PolicyTable::from_policies(rows)
    }

    pub fn violation_policy(&self) -> Result<ViolationPolicy, ConfigError> {
        let v = &self.violations;
        if v.block_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "violations.block_threshold",
                reason: "must be >= 1".into(),
            });
        }
        if v.history_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "violations.history_ttl_secs",
                reason: "must be > 0".into(),
            });
        }
        ViolationPolicy::new(
            v.block_threshold,
            Duration::from_secs(v.base_block_secs),
            Duration::from_secs(v.max_block_secs),
            Duration::from_secs(v.history_ttl_secs),
        )
        .map_err(|e| ConfigError::InvalidValue { field: "violations", reason: e.to_string() })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_number(field: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue { field, reason: e.to_string() })
}
