//! Backoff schedules for the server-error retry and leader reconnects.
//!
//! Attempt `0` is the initial call and never waits; retries start at `attempt = 1`.
//! Exponential delays double from the first backoff up to an optional ceiling and saturate at
//! [`MAX_BACKOFF`] instead of overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use bucketgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_secs(2))
//!     .with_max(Duration::from_secs(30))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_secs(2));
//! assert_eq!(backoff.delay(3), Duration::from_secs(8));
//! assert_eq!(backoff.delay(10), Duration::from_secs(30));
//! ```

use std::fmt;
use std::time::Duration;

/// Upper bound used when a delay computation would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// Only exponential schedules accept a ceiling.
    ConstantDoesNotSupportMax,
    /// A ceiling of zero would disable backoff entirely.
    MaxMustBePositive,
    /// The ceiling sits below the first delay.
    MaxLessThanFirst {
        /// First backoff.
        first: Duration,
        /// Requested ceiling.
        max: Duration,
    },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max backoff must be greater than zero"),
            BackoffError::MaxLessThanFirst { first, max } => {
                write!(f, "max backoff ({:?}) must be >= first backoff ({:?})", max, first)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Constant(Duration),
    Exponential { first: Duration, max: Option<Duration> },
}

/// Delay schedule indexed by attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant(delay) }
    }

    /// Doubling delay starting at `first`.
    pub fn exponential(first: Duration) -> Self {
        Self { schedule: Schedule::Exponential { first, max: None } }
    }

    /// Cap an exponential schedule at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.schedule {
            Schedule::Exponential { first, max: existing } => {
                if max < *first {
                    return Err(BackoffError::MaxLessThanFirst { first: *first, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            Schedule::Constant(_) => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Delay before `attempt` (0-based; 0 is the initial call).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.schedule {
            Schedule::Constant(delay) => delay,
            Schedule::Exponential { first, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let nanos = first.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map_or(delay, |m| delay.min(m)).min(MAX_BACKOFF)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_call_never_waits() {
        assert_eq!(Backoff::constant(Duration::from_secs(1)).delay(0), Duration::ZERO);
        assert_eq!(Backoff::exponential(Duration::from_secs(2)).delay(0), Duration::ZERO);
    }

    #[test]
    fn constant_is_flat() {
        let backoff = Backoff::constant(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(50), Duration::from_millis(250));
    }

    #[test]
    fn server_error_schedule_doubles_to_thirty_seconds() {
        let backoff =
            Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(30)).unwrap();
        let delays: Vec<_> = (1..=6).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay((u32::MAX as usize) + 10), MAX_BACKOFF);
    }

    #[test]
    fn invalid_ceilings_are_rejected() {
        assert_eq!(
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(5)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        );
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(10)).with_max(Duration::from_secs(5)),
            Err(BackoffError::MaxLessThanFirst { .. })
        ));
    }
}
