//! Router telemetry.
//!
//! Routers emit a [`RouterEvent`] at each step of an exchange: admission, bucket delays, global
//! cooldowns, retries and completion. Events flow into a [`TelemetrySink`], which is a
//! `tower::Service<RouterEvent>` so sinks compose with ordinary tower combinators.
//!
//! Emission is best effort and never waits: a sink that is not ready at the moment of emission,
//! or that fails, simply loses the event. Calls that do not finish straight away complete on the
//! runtime in the background.
//!
//! ```rust
//! use bucketgate::telemetry::{MemorySink, RouterEvent};
//! use bucketgate::BucketKey;
//! use std::time::Duration;
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = RouterEvent::BucketDelayed {
//!     bucket: BucketKey::from("/channels/{channel.id}/messages:1"),
//!     delay: Duration::from_millis(200),
//! };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use crate::bucket::BucketKey;
use crate::request::RequestId;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use futures::FutureExt;
use tower::{BoxError, Service, ServiceExt};

/// A sink consuming router events.
pub trait TelemetrySink:
    Service<RouterEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Hand `event` to `sink` without waiting.
///
/// `poll_ready` is polled once; a sink that is not ready drops the event. A call future that
/// does not complete immediately is spawned when a tokio runtime is available and dropped
/// otherwise. Errors are swallowed.
pub fn emit_best_effort<S>(mut sink: S, event: RouterEvent)
where
    S: Service<RouterEvent, Response = ()>,
    S::Future: Send + 'static,
{
    let call = match sink.ready().now_or_never() {
        Some(Ok(ready)) => ready.call(event),
        Some(Err(_)) => return,
        None => {
            tracing::trace!(%event, "telemetry sink not ready, event dropped");
            return;
        }
    };
    let mut call = Box::pin(call);
    if (&mut call).now_or_never().is_none() {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = call.await;
            });
        }
    }
}

/// Something observable that happened while routing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A request was granted its bucket.
    Admitted {
        /// Bucket admitted on.
        bucket: BucketKey,
        /// Request admitted.
        request: RequestId,
    },
    /// A response delayed the next admission on its bucket.
    BucketDelayed {
        /// Delayed bucket.
        bucket: BucketKey,
        /// Delay applied after the in-flight request.
        delay: Duration,
    },
    /// A response engaged the global cooldown.
    GloballyLimited {
        /// Cooldown requested.
        delay: Duration,
    },
    /// A request is going around again.
    Retrying {
        /// Request being retried.
        request: RequestId,
        /// Retry number, starting at 1.
        attempt: usize,
        /// Delay before it re-enters its bucket queue.
        delay: Duration,
        /// Why: `rate_limited` or `server_error`.
        reason: &'static str,
    },
    /// A dispatch finished and released its bucket.
    Completed {
        /// Bucket released.
        bucket: BucketKey,
        /// Request completed.
        request: RequestId,
        /// Response status, if a response was read.
        status: Option<u16>,
    },
    /// A coordination leader tore down a channel.
    ProtocolViolation {
        /// Leader that sent the error.
        leader: SocketAddr,
        /// Reason given.
        reason: String,
    },
}

impl fmt::Display for RouterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterEvent::Admitted { bucket, request } => {
                write!(f, "Admitted(bucket={}, request={})", bucket, request)
            }
            RouterEvent::BucketDelayed { bucket, delay } => {
                write!(f, "BucketDelayed(bucket={}, delay={:?})", bucket, delay)
            }
            RouterEvent::GloballyLimited { delay } => write!(f, "GloballyLimited({:?})", delay),
            RouterEvent::Retrying { request, attempt, delay, reason } => write!(
                f,
                "Retrying(request={}, attempt={}, delay={:?}, reason={})",
                request, attempt, delay, reason
            ),
            RouterEvent::Completed { bucket, request, status } => match status {
                Some(s) => write!(f, "Completed(bucket={}, request={}, status={})", bucket, request, s),
                None => write!(f, "Completed(bucket={}, request={}, no response)", bucket, request),
            },
            RouterEvent::ProtocolViolation { leader, reason } => {
                write!(f, "ProtocolViolation(leader={}, reason={})", leader, reason)
            }
        }
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<RouterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RouterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing` at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<RouterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RouterEvent) -> Self::Future {
        tracing::debug!(event = %event, "router_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest beyond its capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RouterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Bounded sink holding up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of stored events.
    pub fn events(&self) -> Vec<RouterEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RouterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RouterEvent) -> Self::Future {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(event);
        drop(events);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Type-erased sink shared by a router and its clones.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxCloneService<RouterEvent, (), BoxError>>>,
}

impl Telemetry {
    /// Route events into `sink`.
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let sink = sink.map_err(|e: S::SinkError| -> BoxError { Box::new(e) });
        Self { sink: Arc::new(Mutex::new(BoxCloneService::new(sink))) }
    }

    /// Emit `event`, best effort. Never waits on the sink, so it is safe to call while a
    /// bucket or global slot is held.
    pub fn emit(&self, event: RouterEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        emit_best_effort(sink, event);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Telemetry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delayed(ms: u64) -> RouterEvent {
        RouterEvent::BucketDelayed {
            bucket: BucketKey::from("/channels/{channel.id}:1"),
            delay: Duration::from_millis(ms),
        }
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        for ms in [1, 2, 3] {
            sink.call(delayed(ms)).await.unwrap();
        }
        assert_eq!(sink.events(), vec![delayed(2), delayed(3)]);
        assert_eq!(sink.evicted(), 1);
    }

    #[tokio::test]
    async fn telemetry_handle_forwards_to_sink() {
        let sink = MemorySink::new();
        let telemetry = Telemetry::new(sink.clone());
        telemetry.clone().emit(RouterEvent::GloballyLimited { delay: Duration::from_secs(1) });
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn failing_sinks_are_ignored() {
        #[derive(Clone)]
        struct Fails;

        impl Service<RouterEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = Pin<
                Box<dyn std::future::Future<Output = Result<(), std::io::Error>> + Send>,
            >;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _event: RouterEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::other("sink down")) })
            }
        }

        impl TelemetrySink for Fails {
            type SinkError = std::io::Error;
        }

        Telemetry::new(Fails).emit(delayed(5));
    }

    #[derive(Clone)]
    struct NeverReady;

    impl Service<RouterEvent> for NeverReady {
        type Response = ();
        type Error = Infallible;
        type Future = SinkFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn call(&mut self, _event: RouterEvent) -> Self::Future {
            Box::pin(async { Ok(()) })
        }
    }

    impl TelemetrySink for NeverReady {
        type SinkError = Infallible;
    }

    #[test]
    fn unready_sinks_drop_events_without_waiting() {
        // no runtime and a sink that never becomes ready: must return immediately
        Telemetry::new(NeverReady).emit(delayed(5));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_finish_in_the_background() {
        #[derive(Clone)]
        struct Slow(MemorySink);

        impl Service<RouterEvent> for Slow {
            type Response = ();
            type Error = Infallible;
            type Future = SinkFuture;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, event: RouterEvent) -> Self::Future {
                let mut inner = self.0.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    inner.call(event).await
                })
            }
        }

        impl TelemetrySink for Slow {
            type SinkError = Infallible;
        }

        let memory = MemorySink::new();
        let start = tokio::time::Instant::now();
        Telemetry::new(Slow(memory.clone())).emit(delayed(5));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(memory.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(memory.events(), vec![delayed(5)]);
    }

    #[test]
    fn events_render_readably() {
        let event = RouterEvent::Completed {
            bucket: BucketKey::from("/gateway"),
            request: RequestId::new(),
            status: Some(204),
        };
        assert!(event.to_string().contains("status=204"));
    }
}
