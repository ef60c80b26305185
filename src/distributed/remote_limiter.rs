//! Global rate limiter living on a coordination leader.

use crate::clock::{compensate_lag, nanos, Clock, SystemClock};
use crate::distributed::connection::LeaderPool;
use crate::distributed::frame::{LeaderMessage, ProtocolError, WorkerMessage};
use crate::error::RouterError;
use crate::limiter::{GlobalPermit, GlobalRateLimiter};
use crate::request::RequestId;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// [`GlobalRateLimiter`] backed by a leader's cooldown and single global slot.
///
/// Every worker pointing at the same leader shares one cooldown, and exchanges across the
/// fleet are admitted one at a time in FIFO order.
#[derive(Debug, Clone)]
pub struct RemoteGlobalRateLimiter {
    leader: SocketAddr,
    pool: LeaderPool,
    clock: Arc<dyn Clock>,
}

impl RemoteGlobalRateLimiter {
    /// Limiter held by the leader at `leader`, reached through `pool`.
    pub fn new(leader: SocketAddr, pool: LeaderPool) -> Self {
        Self { leader, pool, clock: Arc::new(SystemClock) }
    }

    /// Timestamp frames with `clock`.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Leader address.
    pub fn leader(&self) -> SocketAddr {
        self.leader
    }
}

fn unexpected(expected: &'static str, got: &LeaderMessage) -> RouterError {
    ProtocolError::Unexpected { expected, got: got.tag().into() }.into()
}

#[async_trait]
impl GlobalRateLimiter for RemoteGlobalRateLimiter {
    async fn rate_limit_for(&self, duration: Duration) -> Result<(), RouterError> {
        let reply = self
            .pool
            .with_leader(self.leader, |conn| async move {
                let sent_at = self.clock.now_nanos();
                conn.request(WorkerMessage::LimitGlobal { delay: duration, sent_at }).await
            })
            .await?;
        match reply {
            LeaderMessage::Ok { .. } => {
                tracing::debug!(?duration, leader = %self.leader, "global cooldown engaged");
                Ok(())
            }
            other => Err(unexpected("OK", &other)),
        }
    }

    async fn remaining(&self) -> Result<Duration, RouterError> {
        let reply = self
            .pool
            .with_leader(self.leader, |conn| async move {
                conn.request(WorkerMessage::QueryGlobal).await
            })
            .await?;
        match reply {
            LeaderMessage::QueryGlobal { remaining, at } => {
                let now = self.clock.now_nanos();
                Ok(Duration::from_nanos(compensate_lag(nanos(remaining), at, now)))
            }
            other => Err(unexpected("QUERY:global", &other)),
        }
    }

    async fn acquire(&self) -> Result<GlobalPermit, RouterError> {
        let request = RequestId::new();
        let channel = self
            .pool
            .with_leader(self.leader, |conn| async move {
                let mut channel = conn.open(
                    WorkerMessage::Acquire { request },
                    Some(WorkerMessage::Release { request }),
                )?;
                channel.expect(LeaderMessage::Permit).await?;
                Ok(channel)
            })
            .await?;
        tracing::trace!(%request, "global permit held");
        Ok(GlobalPermit::new(move || drop(channel)))
    }
}
