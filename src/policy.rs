//! Tiered limit policy: `(endpoint class, role) → (limit, window)`.
//!
//! This is the only place limit numbers are defined. The table is validated once at startup
//! and is immutable afterwards, so lookups at request time cannot miss.

use crate::error::ConfigError;
use crate::identity::Role;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Named category of API traffic sharing one limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointClass {
    Api,
    Auth,
    Upload,
    Read,
    Moderation,
}

impl EndpointClass {
    /// Every class, in table order.
    pub const ALL: [EndpointClass; 5] = [
        EndpointClass::Api,
        EndpointClass::Auth,
        EndpointClass::Upload,
        EndpointClass::Read,
        EndpointClass::Moderation,
    ];

    /// Lowercase name used in store keys and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Api => "api",
            EndpointClass::Auth => "auth",
            EndpointClass::Upload => "upload",
            EndpointClass::Read => "read",
            EndpointClass::Moderation => "moderation",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointClass {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointClass::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownName(s.to_string()))
    }
}

/// One row of the limit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub class: EndpointClass,
    pub role: Role,
    pub limit: u32,
    pub window: Duration,
}

impl LimitPolicy {
    /// Window length in whole seconds.
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }
}

/// Built-in `(class, role, limit, window_secs)` rows.
const DEFAULT_POLICIES: [(EndpointClass, Role, u32, u64); 20] = [
    (EndpointClass::Api, Role::Student, 100, 60),
    (EndpointClass::Api, Role::Guardian, 150, 60),
    (EndpointClass::Api, Role::Admin, 500, 60),
    (EndpointClass::Api, Role::Unauthenticated, 20, 60),
    (EndpointClass::Auth, Role::Student, 10, 60),
    (EndpointClass::Auth, Role::Guardian, 10, 60),
    (EndpointClass::Auth, Role::Admin, 30, 60),
    (EndpointClass::Auth, Role::Unauthenticated, 5, 60),
    (EndpointClass::Upload, Role::Student, 20, 3600),
    (EndpointClass::Upload, Role::Guardian, 30, 3600),
    (EndpointClass::Upload, Role::Admin, 200, 3600),
    (EndpointClass::Upload, Role::Unauthenticated, 2, 3600),
    (EndpointClass::Read, Role::Student, 300, 60),
    (EndpointClass::Read, Role::Guardian, 400, 60),
    (EndpointClass::Read, Role::Admin, 1000, 60),
    (EndpointClass::Read, Role::Unauthenticated, 60, 60),
    (EndpointClass::Moderation, Role::Student, 30, 60),
    (EndpointClass::Moderation, Role::Guardian, 40, 60),
    (EndpointClass::Moderation, Role::Admin, 300, 60),
    (EndpointClass::Moderation, Role::Unauthenticated, 5, 60),
];

/// Validated, exhaustive limit table.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<(EndpointClass, Role), LimitPolicy>,
}

impl PolicyTable {
    /// Build a table from arbitrary rows, requiring every `(class, role)` pair exactly once
    /// and positive limits and windows. Later duplicates replace earlier ones.
    pub fn from_policies<I>(policies: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = LimitPolicy>,
    {
        let mut entries = HashMap::new();
        for policy in policies {
            if policy.limit == 0 {
                return Err(invalid(&policy, "limit must be > 0"));
            }
            if policy.window.as_secs() == 0 {
                return Err(invalid(&policy, "window must be at least one second"));
            }
            entries.insert((policy.class, policy.role), policy);
        }
        for class in EndpointClass::ALL {
            for role in Role::ALL {
                if !entries.contains_key(&(class, role)) {
                    return Err(ConfigError::MissingPolicy {
                        class: class.to_string(),
                        role: role.to_string(),
                    });
                }
            }
        }
        Ok(Self { entries })
    }

    /// Policy for `(class, role)`. Total over the closed product once constructed.
    pub fn get(&self, class: EndpointClass, role: Role) -> LimitPolicy {
        // Every pair is present after validation; the built-in row is never reached.
        self.entries.get(&(class, role)).copied().unwrap_or_else(|| default_row(class, role))
    }

    /// All rows, ordered by class then role.
    pub fn policies(&self) -> Vec<LimitPolicy> {
        let mut rows: Vec<LimitPolicy> = self.entries.values().copied().collect();
        rows.sort_by_key(|p| (p.class, p.role));
        rows
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let entries = DEFAULT_POLICIES
            .iter()
            .map(|&(class, role, limit, secs)| {
                ((class, role), LimitPolicy { class, role, limit, window: Duration::from_secs(secs) })
            })
            .collect();
        Self { entries }
    }
}

fn default_row(class: EndpointClass, role: Role) -> LimitPolicy {
    DEFAULT_POLICIES
        .iter()
        .find(|(c, r, _, _)| *c == class && *r == role)
        .map(|&(class, role, limit, secs)| LimitPolicy {
            class,
            role,
            limit,
            window: Duration::from_secs(secs),
        })
        .unwrap_or(LimitPolicy { class, role, limit: 1, window: Duration::from_secs(60) })
}

fn invalid(policy: &LimitPolicy, reason: &str) -> ConfigError {
    ConfigError::InvalidPolicy {
        class: policy.class.to_string(),
        role: policy.role.to_string(),
        reason: reason.to_string(),
    }
}
