//! Penalty arithmetic: limit-shrinking multipliers and block durations.
//!
//! Two independent escalation paths live here:
//!
//! - [`backoff_multiplier`] divides an endpoint's base budget as violations accumulate, a soft
//!   degradation below the hard block.
//! - [`Backoff`] computes exponential, capped block durations once a caller crosses the block
//!   threshold.
//!
//! ```rust
//! use std::time::Duration;
//! use hallpass::backoff::{backoff_multiplier, effective_limit, Backoff};
//!
//! assert_eq!(backoff_multiplier(3), 4);
//! assert_eq!(effective_limit(100, 3), 25);
//!
//! let block = Backoff::exponential(Duration::from_secs(60))
//!     .with_max(Duration::from_secs(3600))
//!     .unwrap();
//! assert_eq!(block.delay(1), Duration::from_secs(60));
//! assert_eq!(block.delay(3), Duration::from_secs(240));
//! assert_eq!(block.delay(10), Duration::from_secs(3600)); // capped
//! ```

use std::fmt;
use std::time::Duration;

/// Multiplier returned past the last table entry. Divides any realistic limit down to the floor
/// of 1; the actual shutoff comes from the tracker's blocked state.
pub const SATURATED_MULTIPLIER: u32 = 999;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Divisor applied to a base limit for a caller with `violations` recorded exceeds.
///
/// `0 → 1, 1 → 1, 2 → 2, 3 → 4, 4 → 8, 5 → 16, ≥6 → 999`. The first violation is free.
pub fn backoff_multiplier(violations: u32) -> u32 {
    match violations {
        0 | 1 => 1,
        2..=5 => 1 << (violations - 1),
        _ => SATURATED_MULTIPLIER,
    }
}

/// `max(1, floor(base / backoff_multiplier(violations)))`.
pub fn effective_limit(base: u32, violations: u32) -> u32 {
    (base / backoff_multiplier(violations)).max(1)
}

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Exponential, optionally capped delay: `base * 2^(attempt - 1)`.
///
/// Attempt `0` means "no penalty" and yields a zero delay. Computations that would overflow
/// saturate to [`MAX_BACKOFF`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Create an exponential backoff strategy
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Exponential backoff capped at `max`, raised to `base` if smaller.
    pub fn capped(base: Duration, max: Duration) -> Self {
        Self { base, max: Some(max.max(base)) }
    }

    /// Set a maximum delay. Returns an error if `max` is zero or `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Calculate the delay for a given attempt number (1-based; 0 = no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let base_nanos = self.base.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(base_nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        let capped = self.max.map(|m| exp_delay.min(m)).unwrap_or(exp_delay);
        capped.min(MAX_BACKOFF)
    }
}
