#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketgate
//!
//! Outbound REST request routing with per-route rate-limit buckets and a global limiter.
//!
//! ## Features
//!
//! - **Buckets**: requests on the same route and major parameter run one at a time, in order
//! - **Learned delays** from rate-limit headers, applied before the next request in the bucket
//! - **Global cooldown** shared by every bucket after a global 429
//! - **Retries** for 429s (requeue) and 5xx/transport failures (exponential backoff with jitter)
//! - **Response functions** that suppress or retry chosen error statuses per route
//! - **Coordination** of buckets and the global limiter across processes through a leader
//! - **tower integration**: exchanges are `Service`s and routers are `Service`s
//!
//! ## Quick Start
//!
//! ```rust
//! use bucketgate::{DefaultRouter, Request, Response, Route, Router, RouterError, RouterOptions};
//! use bucketgate::exchange::ServiceExchange;
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RouterError> {
//!     let http = tower::service_fn(|_req: Request| async {
//!         Ok::<_, RouterError>(Response::empty(StatusCode::OK))
//!     });
//!     let options = RouterOptions::builder().exchange(ServiceExchange::new(http)).build()?;
//!     let router = DefaultRouter::new(options);
//!
//!     let request = Request::new(Route::get("/channels/{channel.id}/messages"), ["123"])?;
//!     let response = router.exchange(request).await?;
//!     assert_eq!(response.status(), StatusCode::OK);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bucket;
pub mod clock;
pub mod distributed;
pub mod error;
pub mod exchange;
pub mod jitter;
pub mod limiter;
pub mod queue;
pub mod request;
pub mod response;
pub mod retry;
pub mod route;
pub mod router;
pub mod sleeper;
pub mod strategy;
pub mod telemetry;
pub mod transform;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use bucket::BucketKey;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BuildError, ClientError, RouterError};
pub use exchange::HttpExchange;
pub use jitter::Jitter;
pub use limiter::{
    GlobalPermit, GlobalRateLimiter, GlobalRateLimiterExt, LocalGlobalRateLimiter,
    DEFAULT_REQUEST_PARALLELISM,
};
pub use queue::{BucketPermit, QueueState, RequestQueue};
pub use request::{Request, RequestId};
pub use response::Response;
pub use retry::{ReconnectOptions, RetryPolicy, RetryPolicyBuilder};
pub use route::Route;
pub use router::{DefaultRouter, Router, RouterLayer, RouterOptions, RouterOptionsBuilder, RouterService};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use strategy::{
    FixedDelayStrategy, HeaderNames, HeaderStrategy, RateLimitInfo, RateLimitStrategy, RetryAfterUnit,
};
pub use transform::{ResponseFunction, RouteMatcher};
