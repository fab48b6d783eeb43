//! Backoff strategies for retry delays and poll intervals.
//!
//! Attempt semantics: attempt index `0` represents the initial call (no delay), and retries
//! start at `attempt = 1`, so `exponential(base).delay(n) == base · 2^(n-1)`.
//! Delays saturate at [`MAX_BACKOFF`] to avoid overflow.
//!
//! ```rust
//! use std::time::Duration;
//! use cwcli_resilience::Backoff;
//!
//! let backoff =
//!     Backoff::capped_exponential(Duration::from_millis(100), Duration::from_secs(2)).unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(0));
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2));
//! ```

use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, max: Option<Duration> },
}

/// Delay schedule used between retries and between status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Delay doubling with each retry, starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, max: None } }
    }

    /// Exponential backoff capped at `max`. Errors on a zero `max` or `max < base`.
    pub fn capped_exponential(base: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < base {
            return Err(BackoffError::MaxLessThanBase { base, max });
        }
        Ok(Self { kind: BackoffKind::Exponential { base, max: Some(max) } })
    }

    /// Delay for the given attempt number (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.kind {
            BackoffKind::Constant { delay } => delay.min(MAX_BACKOFF),
            BackoffKind::Exponential { base, max } => {
                let exp = exponential_delay(base, attempt - 1);
                max.map(|m| exp.min(m)).unwrap_or(exp)
            }
        }
    }
}

/// `base · 2^exponent`, saturating at [`MAX_BACKOFF`].
pub fn exponential_delay(base: Duration, exponent: usize) -> Duration {
    let exponent = exponent.min(u32::MAX as usize) as u32;
    let multiplier = 2u128.saturating_pow(exponent);
    let nanos = base.as_nanos().saturating_mul(multiplier);
    Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(5), Duration::from_millis(1600));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff =
            Backoff::capped_exponential(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(50), Duration::from_secs(1));
    }

    #[test]
    fn huge_exponents_saturate() {
        assert_eq!(exponential_delay(Duration::from_secs(1), 1_000_000), MAX_BACKOFF);
        assert_eq!(exponential_delay(Duration::ZERO, 40), Duration::ZERO);
    }

    #[test]
    fn cap_validation() {
        assert_eq!(
            Backoff::capped_exponential(Duration::from_secs(1), Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            Backoff::capped_exponential(Duration::from_secs(100), Duration::from_secs(50)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }
}
