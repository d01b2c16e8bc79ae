//! Caller identity: who a decision is made for.
//!
//! The engine never authenticates anyone. A session collaborator answers "which role, if
//! any" through [`RoleResolver`]; everything else is derived from the client address.

use crate::error::ConfigError;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// Caller role as reported by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Student,
    Guardian,
    Admin,
    Unauthenticated,
}

impl Role {
    /// Every role, in table order.
    pub const ALL: [Role; 4] = [Role::Student, Role::Guardian, Role::Admin, Role::Unauthenticated];

    /// Lowercase name used in store keys and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Guardian => "guardian",
            Role::Admin => "admin",
            Role::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownName(s.to_string()))
    }
}

/// The `(principal, role)` pair a decision is made for. Derived per request, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    principal: String,
    role: Role,
}

impl Identity {
    /// Build an identity from the client address and optional user id.
    ///
    /// The principal is `ip` for anonymous callers and `ip:user_id` otherwise, so two users
    /// behind one NAT do not share a budget.
    pub fn new(ip: &str, user_id: Option<&str>, role: Role) -> Self {
        let principal = match user_id {
            Some(user) if !user.is_empty() => format!("{}:{}", ip, user),
            _ => ip.to_string(),
        };
        Self { principal, role }
    }

    /// Anonymous caller identified only by address.
    pub fn anonymous(ip: &str) -> Self {
        Self::new(ip, None, Role::Unauthenticated)
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.principal, self.role)
    }
}

/// Placeholder principal when no address header is present.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Pick the caller address from proxy headers.
///
/// First entry of `X-Forwarded-For`, then `X-Real-IP`, then [`UNKNOWN_CLIENT`].
pub fn client_ip<'a>(forwarded_for: Option<&'a str>, real_ip: Option<&'a str>) -> &'a str {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|v| !v.is_empty()))
        .unwrap_or(UNKNOWN_CLIENT)
}

/// Capability to ask the session layer for the caller's role.
///
/// `None` means no valid session; the caller is treated as [`Role::Unauthenticated`].
#[async_trait]
pub trait RoleResolver<Req: Sync>: Send + Sync {
    async fn resolve_role(&self, request: &Req) -> Option<Role>;

    /// Stable user id of the session, used to split a shared address into per-user budgets.
    async fn resolve_user(&self, _request: &Req) -> Option<String> {
        None
    }
}
