//! Retry policy for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries); `None` retries forever.
//! - `should_retry` decides whether an error is eligible; ineligible errors return immediately.
//! - When attempts run out, the last error is returned unchanged.
//! - Backoff computes the delay for retry `n` (1-based) and jitter randomizes it.
//! - The sleeper applies delays (production uses `TokioSleeper`; tests inject
//!   `InstantSleeper`/`TrackingSleeper`).
//!
//! Two schedules are built in: [`RetryPolicy::server_errors`] for 5xx responses and
//! [`RetryPolicy::reconnect`] for reaching a coordination leader.
//!
//! ```rust
//! use std::time::Duration;
//! use bucketgate::{Backoff, Jitter, RetryPolicy, InstantSleeper};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<std::io::Error>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_jitter(Jitter::None)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), _> = policy
//!     .execute(|| async { Err(std::io::Error::other("boom")) })
//!     .await;
//! assert!(result.is_err());
//! # });
//! ```

use crate::error::{BuildError, RouterError};
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// First delay of the server-error schedule.
pub const SERVER_ERROR_FIRST_BACKOFF: Duration = Duration::from_secs(2);
/// Ceiling of the server-error schedule.
pub const SERVER_ERROR_MAX_BACKOFF: Duration = Duration::from_secs(30);

type RetryHook<E> = Arc<dyn Fn(usize, Duration, &E) + Send + Sync>;

/// Retry policy combining backoff, jitter, predicate, and sleeper.
pub struct RetryPolicy<E> {
    max_attempts: Option<usize>,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    on_retry: Option<RetryHook<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
            on_retry: self.on_retry.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Same policy, additionally reporting each retry to `hook`.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, Duration, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Delay before retry `attempt` (1-based), jitter applied.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt))
    }

    /// Run `operation` until it succeeds, fails with an ineligible error, or runs out of
    /// attempts.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, E>
    where
        T: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut attempt = 0usize;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !(self.should_retry)(&error) {
                return Err(error);
            }
            attempt += 1;
            if self.max_attempts.map_or(false, |max| attempt >= max) {
                tracing::debug!(attempts = attempt, error = %error, "retries exhausted");
                return Err(error);
            }
            let delay = self.delay_for(attempt);
            tracing::debug!(attempt, ?delay, error = %error, "retrying");
            if let Some(hook) = &self.on_retry {
                hook(attempt, delay, &error);
            }
            self.sleeper.sleep(delay).await;
        }
    }
}

impl RetryPolicy<RouterError> {
    /// Unbounded exponential retry of 500/502/503/504 responses and transport failures,
    /// 2s doubling to 30s with ±50% jitter.
    pub fn server_errors() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::exponential(SERVER_ERROR_FIRST_BACKOFF)
                .with_max(SERVER_ERROR_MAX_BACKOFF)
                .unwrap_or_else(|_| Backoff::constant(SERVER_ERROR_FIRST_BACKOFF)),
            jitter: Jitter::standard(),
            should_retry: Arc::new(RouterError::is_retryable_server_error),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// A single retry after a fixed `delay`, for errors matching `predicate`.
    pub fn once<F>(delay: Duration, predicate: F) -> Self
    where
        F: Fn(&RouterError) -> bool + Send + Sync + 'static,
    {
        Self {
            max_attempts: Some(2),
            backoff: Backoff::constant(delay),
            jitter: Jitter::None,
            should_retry: Arc::new(predicate),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Reconnect schedule for a lost coordination leader.
    pub fn reconnect(options: &ReconnectOptions) -> Self {
        Self {
            max_attempts: options.max_retries.map(|r| r.saturating_add(1)),
            backoff: options.backoff(),
            jitter: options.jitter,
            should_retry: Arc::new(RouterError::is_leader_unavailable),
            on_retry: None,
            sleeper: options.sleeper.clone(),
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: Option<usize>,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    on_retry: Option<RetryHook<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    /// Three attempts, exponential from one second, full jitter.
    pub fn new() -> Self {
        Self {
            max_attempts: Some(3),
            backoff: Backoff::exponential(Duration::from_secs(1)),
            jitter: Jitter::full(),
            should_retry: Arc::new(|_| true),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Retry until the operation succeeds or fails with an ineligible error.
    pub fn unbounded(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Set backoff schedule.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set predicate deciding which errors are retried.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Observe each retry (attempt number, delay, error) before it sleeps.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, Duration, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Set the sleeper used for delays.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Validate and build the policy.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == Some(0) {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            on_retry: self.on_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect schedule for the coordination leader.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    first_backoff: Duration,
    max_backoff: Duration,
    jitter: Jitter,
    max_retries: Option<usize>,
    sleeper: Arc<dyn Sleeper>,
}

impl ReconnectOptions {
    /// Default first delay between connection attempts.
    pub const DEFAULT_FIRST_BACKOFF: Duration = Duration::from_secs(2);
    /// Default ceiling between connection attempts.
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

    /// First delay and ceiling for the exponential schedule.
    pub fn new(first_backoff: Duration, max_backoff: Duration) -> Result<Self, BuildError> {
        Backoff::exponential(first_backoff).with_max(max_backoff)?;
        Ok(Self { first_backoff, max_backoff, ..Self::default() })
    }

    /// Give up after `retries` failed reconnects instead of retrying forever.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Replace the jitter applied to reconnect delays.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// First delay.
    pub fn first_backoff(&self) -> Duration {
        self.first_backoff
    }

    /// Delay ceiling.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    fn backoff(&self) -> Backoff {
        Backoff::exponential(self.first_backoff)
            .with_max(self.max_backoff)
            .unwrap_or_else(|_| Backoff::constant(self.first_backoff))
    }
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            first_backoff: Self::DEFAULT_FIRST_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
            jitter: Jitter::standard(),
            max_retries: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}
