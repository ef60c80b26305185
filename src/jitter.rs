//! Jitter applied on top of backoff delays.
//!
//! - `None`: exact delays, used by tests and deterministic schedules.
//! - `Full`: uniform in `[0, delay]`.
//! - `Random { factor }`: uniform in `[delay * (1 - factor), delay * (1 + factor)]`. The
//!   server-error retry and leader reconnects use a factor of `0.5`.
//!
//! Randomness comes from `rand`'s thread-local generator; `apply_with_rng` accepts a seeded one.

use crate::error::BuildError;
use rand::{rng, Rng};
use std::time::Duration;

/// Jitter factor used by the built-in retry schedules.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

/// Randomization strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the backoff delay unchanged.
    None,
    /// Anywhere between zero and the delay.
    Full,
    /// Spread symmetrically around the delay.
    Random {
        /// Fraction of the delay added or removed, within `[0, 1]`.
        factor: f64,
    },
}

impl Jitter {
    /// Uniform in `[0, delay]`.
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Symmetric jitter around the delay.
    pub fn random(factor: f64) -> Result<Self, BuildError> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(BuildError::InvalidJitterFactor(factor));
        }
        Ok(Jitter::Random { factor })
    }

    /// Symmetric jitter with [`DEFAULT_JITTER_FACTOR`].
    pub fn standard() -> Self {
        Jitter::Random { factor: DEFAULT_JITTER_FACTOR }
    }

    /// Randomize `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Randomize `delay` with a caller-supplied generator.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return delay;
        }
        match *self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Random { factor } => {
                let spread = (millis as f64 * factor) as u64;
                let low = millis.saturating_sub(spread);
                let high = millis.saturating_add(spread);
                Duration::from_millis(rng.random_range(low..=high))
            }
        }
    }
}
