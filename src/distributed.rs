//! Coordination across processes.
//!
//! A [`LeaderServer`] owns every bucket queue and the global limiter; workers run a
//! [`DistributedRouter`] that asks the leader for admission over TCP and performs the HTTP
//! exchange locally. A [`RemoteGlobalRateLimiter`] shares the leader's global cooldown and slot.
//!
//! Frames are plain text, described in [`frame`].

pub mod connection;
pub mod frame;
pub mod leader;
pub mod remote_limiter;
pub mod worker;

pub use connection::{Channel, LeaderConnection, LeaderPool};
pub use frame::{LeaderMessage, ProtocolError, StreamId, WorkerMessage, PROTOCOL_VERSION};
pub use leader::{LeaderConfig, LeaderHandle, LeaderServer, DEFAULT_LEADER_ADDR};
pub use remote_limiter::RemoteGlobalRateLimiter;
pub use worker::{DistributedRouter, HashedLeaders, LeaderMapper, SingleLeader};
