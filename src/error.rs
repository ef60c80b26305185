//! Error types surfaced by the router, the limiters and the coordination protocol.
//!
//! Classification follows how the router reacts to a failure:
//! - `Client` errors (4xx other than 429) go straight back to the caller.
//! - `RateLimited` (429) is absorbed by the rate-limit retry and only escapes if the caller
//!   gives up first.
//! - Server errors in {500, 502, 503, 504} and `Transport` failures are retried with backoff.
//! - `LeaderUnavailable` and rejected channels trigger a reconnect to the leader.
use crate::distributed::frame::ProtocolError;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Status codes retried by the server-error policy.
pub const RETRYABLE_STATUS_CODES: [u16; 4] = [500, 502, 503, 504];

/// An error status returned by the remote API.
#[derive(Debug, Clone)]
pub struct ClientError {
    method: Method,
    uri: String,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    error_body: Option<serde_json::Value>,
}

impl ClientError {
    /// Build from the parts of an error response; the body is parsed as JSON when possible.
    pub fn new(
        method: Method,
        uri: impl Into<String>,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let error_body = serde_json::from_slice(&body).ok();
        Self { method, uri: uri.into(), status, headers, body, error_body }
    }

    /// HTTP method of the failed request.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path and query of the failed request.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Status code returned by the remote API.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Response body parsed as JSON, if it was valid JSON.
    pub fn error_body(&self) -> Option<&serde_json::Value> {
        self.error_body.as_ref()
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} returned {}", self.method, self.uri, self.status)?;
        if let Some(body) = &self.error_body {
            write!(f, " with response {}", body)?;
        }
        Ok(())
    }
}

impl std::error::Error for ClientError {}

/// Invalid configuration or request construction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    /// Parallelism of a limiter must be > 0.
    #[error("parallelism must be > 0")]
    InvalidParallelism,
    /// A jitter factor outside `[0, 1]`.
    #[error("jitter factor must be within [0, 1] (got {0})")]
    InvalidJitterFactor(f64),
    /// Backoff bounds are inconsistent.
    #[error(transparent)]
    Backoff(#[from] crate::backoff::BackoffError),
    /// No HTTP exchange was configured for the router.
    #[error("an http exchange is required")]
    MissingExchange,
    /// A leader mapping was given no leaders.
    #[error("at least one leader address is required")]
    NoLeaders,
    /// A route template expected a different number of values.
    #[error("route {template} expects {expected} values, got {provided}")]
    ValueCount {
        /// Template being expanded.
        template: String,
        /// Placeholders in the template.
        expected: usize,
        /// Values supplied by the caller.
        provided: usize,
    },
    /// A header name or value could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    /// The request body could not be serialized.
    #[error("request body could not be serialized: {0}")]
    Body(String),
}

/// Unified error for router operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The remote API answered with an error status.
    #[error(transparent)]
    Client(ClientError),
    /// The remote API answered 429.
    #[error("{error} (rate limited for {retry_after:?}, global: {global})")]
    RateLimited {
        /// The 429 response.
        error: ClientError,
        /// Wait communicated by the response.
        retry_after: Duration,
        /// Whether the limit applies to every bucket.
        global: bool,
    },
    /// The HTTP exchange failed before a response was read.
    #[error("transport error: {0}")]
    Transport(String),
    /// A response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// A coordination frame was malformed or arrived in the wrong place.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The leader could not be reached or the connection dropped.
    #[error("leader {addr} unavailable: {reason}")]
    LeaderUnavailable {
        /// Address of the leader.
        addr: SocketAddr,
        /// What went wrong.
        reason: String,
    },
    /// A queue or limiter actor has shut down.
    #[error("{0} is closed")]
    Closed(&'static str),
    /// Invalid configuration or request.
    #[error(transparent)]
    Build(#[from] BuildError),
}

impl RouterError {
    /// Status code of the response behind this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Client(e) => Some(e.status()),
            Self::RateLimited { error, .. } => Some(error.status()),
            _ => None,
        }
    }

    /// True for 429 responses.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// True when the response status is one of [`RETRYABLE_STATUS_CODES`].
    pub fn is_server_error(&self) -> bool {
        self.status().map_or(false, |s| RETRYABLE_STATUS_CODES.contains(&s.as_u16()))
    }

    /// True for errors the server-error retry policy handles.
    pub fn is_retryable_server_error(&self) -> bool {
        self.is_server_error() || matches!(self, Self::Transport(_))
    }

    /// True when the leader connection is gone or refused the channel.
    pub fn is_leader_unavailable(&self) -> bool {
        matches!(self, Self::LeaderUnavailable { .. } | Self::Protocol(ProtocolError::Rejected(_)))
    }

    /// Borrow the client error for error statuses.
    pub fn as_client_error(&self) -> Option<&ClientError> {
        match self {
            Self::Client(e) => Some(e),
            Self::RateLimited { error, .. } => Some(error),
            _ => None,
        }
    }
}
