#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # hallpass
//!
//! Adaptive rate limiting for API surfaces with several kinds of callers.
//!
//! ## Features
//!
//! - **Tiered budgets** per endpoint class and caller role, validated at startup
//! - **Sliding windows** over an in-process or shared store
//! - **Violation tracking** shared across endpoint classes, with shrinking limits
//! - **Escalating blocks** using capped exponential backoff, lifted automatically
//! - **Fail open**: a broken store never rejects traffic
//! - **Tower middleware** and `http` header rendering
//!
//! ## Quick Start
//!
//! ```rust
//! use hallpass::{EndpointClass, Identity, RateLimitEngine, Role};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = RateLimitEngine::builder().build();
//!     let _sweeper = engine.spawn_sweeper(std::time::Duration::from_secs(300));
//!
//!     let student = Identity::new("198.51.100.4", Some("1042"), Role::Student);
//!     let decision = engine.evaluate(&student, EndpointClass::Read).await;
//!     if !decision.allowed {
//!         // render 429 with hallpass::headers
//!     }
//! }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod headers;
pub mod identity;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod violation;
pub mod window;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HallpassConfig, StoreConfig};
pub use engine::{Decision, EngineBuilder, FailOpenMode, RateLimitEngine};
pub use error::{ConfigError, GuardError, StoreError};
pub use identity::{Identity, Role, RoleResolver};
pub use middleware::{HttpClassifier, RateLimitLayer, RateLimitService, RequestClassifier};
pub use policy::{EndpointClass, LimitPolicy, PolicyTable};
pub use violation::{
    MemoryViolationStore, Transform, ViolationPolicy, ViolationRecord, ViolationStore,
    ViolationTracker,
};
pub use window::{MemoryWindowStore, WindowOutcome, WindowStore};
