//! Abstraction for waiting.
//!
//! Bucket queues, the global cooldown and the retry policies all wait through a [`Sleeper`] so
//! tests can skip or record delays.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Something that can wait for a duration.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Resolve after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Waits on the tokio timer. Honors paused time in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Resolves immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Records every requested delay, then delegates to an inner sleeper.
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
    inner: Arc<dyn Sleeper>,
}

impl TrackingSleeper {
    /// Record delays without waiting.
    pub fn new() -> Self {
        Self::wrapping(InstantSleeper)
    }

    /// Record delays and wait through `inner`.
    pub fn wrapping(inner: impl Sleeper + 'static) -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())), inner: Arc::new(inner) }
    }

    /// Delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Sum of every requested delay.
    pub fn total(&self) -> Duration {
        self.calls().into_iter().sum()
    }

    /// Forget recorded delays.
    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(duration);
        }
        self.inner.sleep(duration)
    }
}
