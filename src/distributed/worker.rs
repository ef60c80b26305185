//! Worker-side router: admission comes from a leader, HTTP happens locally.

use crate::bucket::BucketKey;
use crate::distributed::connection::LeaderPool;
use crate::distributed::frame::{LeaderMessage, WorkerMessage};
use crate::error::{BuildError, RouterError};
use crate::request::Request;
use crate::response::Response;
use crate::router::{classify, exchange_once, outcome_status, run_with_retries, Router, RouterOptions};
use crate::telemetry::RouterEvent;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{trace, warn, Instrument};

/// Picks the leader responsible for a bucket. Every worker must map buckets identically.
pub trait LeaderMapper: Send + Sync {
    /// Leader owning `bucket`.
    fn leader_for(&self, bucket: &BucketKey) -> SocketAddr;
}

impl<F> LeaderMapper for F
where
    F: Fn(&BucketKey) -> SocketAddr + Send + Sync,
{
    fn leader_for(&self, bucket: &BucketKey) -> SocketAddr {
        self(bucket)
    }
}

/// Every bucket on one leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleLeader(pub SocketAddr);

impl LeaderMapper for SingleLeader {
    fn leader_for(&self, _bucket: &BucketKey) -> SocketAddr {
        self.0
    }
}

/// Buckets spread over several leaders by a stable hash of the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedLeaders {
    leaders: Vec<SocketAddr>,
}

impl HashedLeaders {
    /// Spread over `leaders`; order matters and must match on every worker.
    pub fn new(leaders: Vec<SocketAddr>) -> Result<Self, BuildError> {
        if leaders.is_empty() {
            return Err(BuildError::NoLeaders);
        }
        Ok(Self { leaders })
    }

    /// Configured leaders.
    pub fn leaders(&self) -> &[SocketAddr] {
        &self.leaders
    }
}

impl LeaderMapper for HashedLeaders {
    fn leader_for(&self, bucket: &BucketKey) -> SocketAddr {
        // FNV-1a: stable across processes and builds
        let hash = bucket
            .as_str()
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3));
        let idx = usize::try_from(hash % self.leaders.len() as u64).unwrap_or(0);
        self.leaders[idx]
    }
}

/// [`Router`] whose buckets live on coordination leaders.
///
/// Each dispatch opens a router channel on the bucket's leader, waits for `READY`, performs the
/// exchange locally, reports learned delays with `LIMIT` and finishes with `DONE`. For a fully
/// coordinated fleet, configure the options with a
/// [`RemoteGlobalRateLimiter`](crate::distributed::RemoteGlobalRateLimiter) as well.
pub struct DistributedRouter {
    options: RouterOptions,
    pool: LeaderPool,
    mapper: Arc<dyn LeaderMapper>,
}

impl fmt::Debug for DistributedRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedRouter")
            .field("options", &self.options)
            .field("pool", &self.pool)
            .finish()
    }
}

impl DistributedRouter {
    /// Router sending admissions to the leaders chosen by `mapper`.
    pub fn new(options: RouterOptions, pool: LeaderPool, mapper: impl LeaderMapper + 'static) -> Self {
        Self { options, pool, mapper: Arc::new(mapper) }
    }

    /// Options this router was built with.
    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Leader connections.
    pub fn pool(&self) -> &LeaderPool {
        &self.pool
    }

    async fn dispatch(&self, request: &Request) -> Result<Response, RouterError> {
        let key = BucketKey::of(request);
        let leader = self.mapper.leader_for(&key);
        let id = request.id();
        let telemetry = self.options.telemetry();

        let channel = self
            .pool
            .with_leader(leader, |conn| {
                let key = key.clone();
                async move {
                    let done = WorkerMessage::Done { bucket: key.clone(), request: id };
                    let mut channel =
                        conn.open(WorkerMessage::Request { bucket: key, request: id }, Some(done))?;
                    let admitted = channel.expect(LeaderMessage::Ready).await;
                    match admitted {
                        Err(RouterError::Protocol(e)) => {
                            telemetry.emit(RouterEvent::ProtocolViolation { leader, reason: e.to_string() });
                            Err(e.into())
                        }
                        other => other.map(|()| channel),
                    }
                }
            })
            .await?;
        trace!(bucket = %key, %leader, "admitted by leader");
        telemetry.emit(RouterEvent::Admitted { bucket: key.clone(), request: id });

        let outcome = exchange_once(&self.options, request).await;
        if let Ok((_, info)) = &outcome {
            if !info.reset_after.is_zero() {
                let limit = WorkerMessage::Limit { bucket: key.clone(), delay: info.reset_after };
                match channel.connection().request(limit).await {
                    Ok(LeaderMessage::Ok { .. }) => {
                        let delay = info.reset_after;
                        telemetry.emit(RouterEvent::BucketDelayed { bucket: key.clone(), delay });
                    }
                    Ok(other) => warn!(bucket = %key, reply = other.tag(), "unexpected reply to LIMIT"),
                    Err(e) => warn!(bucket = %key, error = %e, "could not report bucket delay"),
                }
            }
        }

        let status = outcome_status(&outcome);
        let result = outcome.and_then(|(response, info)| classify(request, response, info));
        drop(channel);
        telemetry.emit(RouterEvent::Completed { bucket: key, request: id, status });
        result
    }
}

#[async_trait]
impl Router for DistributedRouter {
    async fn exchange(&self, request: Request) -> Result<Response, RouterError> {
        let span = tracing::debug_span!("exchange", request = %request.id(), route = %request.route());
        run_with_retries(&self.options, &request, |req| self.dispatch(req)).instrument(span).await
    }
}
