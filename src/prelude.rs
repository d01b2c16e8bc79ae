//! Convenient re-exports for common hallpass types.
pub use crate::{
    backoff::{backoff_multiplier, effective_limit},
    clock::{Clock, SystemClock},
    config::{HallpassConfig, StoreConfig},
    engine::{Decision, FailOpenMode, RateLimitEngine},
    error::{ConfigError, GuardError, StoreError},
    identity::{Identity, Role, RoleResolver},
    middleware::{HttpClassifier, RateLimitLayer, RequestClassifier},
    policy::{EndpointClass, LimitPolicy, PolicyTable},
    violation::{ViolationRecord, ViolationStore},
    window::{WindowOutcome, WindowStore},
};
