//! Process-wide (or cluster-wide) global rate limiting.
//!
//! A [`GlobalRateLimiter`] combines two gates every exchange passes through:
//! a cooldown that blocks all dispatches after a global 429, and a bounded number of admission
//! slots. [`GlobalRateLimiterExt::with_limiter`] wraps an operation in both.

use crate::error::{BuildError, RouterError};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Default number of exchanges allowed in flight at once.
pub const DEFAULT_REQUEST_PARALLELISM: usize = 12;

/// Admission slot held for the duration of one exchange. Dropping it releases the slot.
pub struct GlobalPermit {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl GlobalPermit {
    /// Permit that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }

    /// Permit with nothing to release.
    pub fn detached() -> Self {
        Self { release: None }
    }
}

impl fmt::Debug for GlobalPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalPermit").field("held", &self.release.is_some()).finish()
    }
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Global cooldown plus admission slots.
#[async_trait]
pub trait GlobalRateLimiter: Send + Sync + fmt::Debug {
    /// Block every dispatch for `duration` from now. Never shortens an active cooldown.
    async fn rate_limit_for(&self, duration: Duration) -> Result<(), RouterError>;

    /// Time left on the cooldown, zero when none.
    async fn remaining(&self) -> Result<Duration, RouterError>;

    /// Take an admission slot once the cooldown has passed.
    async fn acquire(&self) -> Result<GlobalPermit, RouterError>;
}

/// Run operations under a [`GlobalRateLimiter`].
pub trait GlobalRateLimiterExt: GlobalRateLimiter {
    /// Acquire, run `operation`, release. The slot is released on every exit path.
    fn with_limiter<'a, T, F>(&'a self, operation: F) -> BoxFuture<'a, Result<T, RouterError>>
    where
        F: Future<Output = Result<T, RouterError>> + Send + 'a,
        T: Send + 'a,
    {
        Box::pin(async move {
            let permit = self.acquire().await?;
            let result = operation.await;
            drop(permit);
            result
        })
    }
}

impl<L: GlobalRateLimiter + ?Sized> GlobalRateLimiterExt for L {}

/// Monotonic cooldown deadline.
///
/// The deadline is stored as nanoseconds past a fixed origin and only ever moves forward.
#[derive(Debug)]
pub struct Cooldown {
    origin: Instant,
    deadline: AtomicU64,
}

impl Cooldown {
    /// No cooldown active.
    pub fn new() -> Self {
        Self { origin: Instant::now(), deadline: AtomicU64::new(0) }
    }

    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Push the deadline to at least `duration` from now.
    pub fn extend(&self, duration: Duration) {
        let target = self
            .elapsed_nanos()
            .saturating_add(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX));
        self.deadline.fetch_max(target, Ordering::AcqRel);
    }

    /// Time until the deadline.
    pub fn remaining(&self) -> Duration {
        let deadline = self.deadline.load(Ordering::Acquire);
        Duration::from_nanos(deadline.saturating_sub(self.elapsed_nanos()))
    }

    /// Sleep until no cooldown remains, including extensions made while sleeping.
    pub async fn wait(&self, sleeper: &dyn Sleeper) {
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                return;
            }
            sleeper.sleep(remaining).await;
        }
    }
}

impl Default for Cooldown {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process limiter: a cooldown plus a FIFO-fair semaphore.
///
/// Cloning shares state, so every router built from one limiter obeys the same cooldown.
#[derive(Debug, Clone)]
pub struct LocalGlobalRateLimiter {
    cooldown: Arc<Cooldown>,
    slots: Arc<Semaphore>,
    parallelism: usize,
    sleeper: Arc<dyn Sleeper>,
}

impl LocalGlobalRateLimiter {
    /// Allow `parallelism` exchanges at once.
    pub fn new(parallelism: usize) -> Result<Self, BuildError> {
        if parallelism == 0 {
            return Err(BuildError::InvalidParallelism);
        }
        Ok(Self {
            cooldown: Arc::new(Cooldown::new()),
            slots: Arc::new(Semaphore::new(parallelism)),
            parallelism,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Strictly sequential: one exchange at a time across all buckets.
    pub fn single() -> Self {
        Self {
            cooldown: Arc::new(Cooldown::new()),
            slots: Arc::new(Semaphore::new(1)),
            parallelism: 1,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Wait out cooldowns through `sleeper`.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Configured number of slots.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl Default for LocalGlobalRateLimiter {
    fn default() -> Self {
        Self {
            cooldown: Arc::new(Cooldown::new()),
            slots: Arc::new(Semaphore::new(DEFAULT_REQUEST_PARALLELISM)),
            parallelism: DEFAULT_REQUEST_PARALLELISM,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

#[async_trait]
impl GlobalRateLimiter for LocalGlobalRateLimiter {
    async fn rate_limit_for(&self, duration: Duration) -> Result<(), RouterError> {
        tracing::debug!(?duration, "globally rate limited");
        self.cooldown.extend(duration);
        Ok(())
    }

    async fn remaining(&self) -> Result<Duration, RouterError> {
        Ok(self.cooldown.remaining())
    }

    async fn acquire(&self) -> Result<GlobalPermit, RouterError> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RouterError::Closed("global rate limiter"))?;
        self.cooldown.wait(self.sleeper.as_ref()).await;
        Ok(GlobalPermit::new(move || drop(slot)))
    }
}
