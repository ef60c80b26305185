//! Turning responses into rate-limit delays.

use crate::backoff::MAX_BACKOFF;
use crate::response::Response;
use http::header::HeaderName;
use http::StatusCode;
use std::fmt;
use std::time::Duration;

/// Delay used for a 429 that carries no usable `Retry-After`.
pub const FALLBACK_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// Delays derived from one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// How long the bucket must wait before its next request.
    pub reset_after: Duration,
    /// Set when the response imposes a cooldown on every bucket.
    pub global: Option<Duration>,
}

/// Computes the delay a response imposes on its bucket.
pub trait RateLimitStrategy: Send + Sync + fmt::Debug {
    /// Inspect `response`.
    fn apply(&self, response: &Response) -> RateLimitInfo;
}

/// Unit of the retry-after header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryAfterUnit {
    /// Decimal seconds, e.g. `1.5`.
    #[default]
    Seconds,
    /// Milliseconds.
    Milliseconds,
}

/// Names of the headers a [`HeaderStrategy`] reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNames {
    /// Requests left in the current window.
    pub remaining: HeaderName,
    /// Seconds until the window resets.
    pub reset_after: HeaderName,
    /// Present and `true` when a 429 is global.
    pub global: HeaderName,
    /// Wait demanded by a 429.
    pub retry_after: HeaderName,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            remaining: HeaderName::from_static("x-ratelimit-remaining"),
            reset_after: HeaderName::from_static("x-ratelimit-reset-after"),
            global: HeaderName::from_static("x-ratelimit-global"),
            retry_after: HeaderName::from_static("retry-after"),
        }
    }
}

/// Reads rate-limit headers.
///
/// - `remaining == 0` delays the bucket by `reset_after`.
/// - A 429 delays the bucket by `retry_after`, or engages the global cooldown when flagged
///   global.
#[derive(Debug, Clone, Default)]
pub struct HeaderStrategy {
    names: HeaderNames,
    retry_after_unit: RetryAfterUnit,
}

impl HeaderStrategy {
    /// Strategy over custom header names.
    pub fn new(names: HeaderNames, retry_after_unit: RetryAfterUnit) -> Self {
        Self { names, retry_after_unit }
    }

    /// Header value as a delay of `value / divisor` seconds, capped at [`MAX_BACKOFF`].
    fn delay(response: &Response, name: &HeaderName, divisor: f64) -> Option<Duration> {
        let secs = response
            .header_str(name)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)?
            / divisor;
        Some(Duration::try_from_secs_f64(secs).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF)))
    }

    fn retry_after(&self, response: &Response) -> Option<Duration> {
        let divisor = match self.retry_after_unit {
            RetryAfterUnit::Seconds => 1.0,
            RetryAfterUnit::Milliseconds => 1000.0,
        };
        Self::delay(response, &self.names.retry_after, divisor)
    }
}

impl RateLimitStrategy for HeaderStrategy {
    fn apply(&self, response: &Response) -> RateLimitInfo {
        let mut info = RateLimitInfo::default();
        let exhausted = response
            .header_str(&self.names.remaining)
            .and_then(|v| v.trim().parse::<u64>().ok())
            == Some(0);
        if exhausted {
            if let Some(reset) = Self::delay(response, &self.names.reset_after, 1.0) {
                info.reset_after = reset;
            }
        }

        let global = response
            .header_str(&self.names.global)
            .map_or(false, |v| v.trim().eq_ignore_ascii_case("true"));
        let retry_after = self.retry_after(response);
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let wait = retry_after.unwrap_or(FALLBACK_RATE_LIMIT_DELAY);
            if global {
                info.global = Some(wait);
            } else {
                info.reset_after = info.reset_after.max(wait);
            }
        } else if let (true, Some(wait)) = (global, retry_after) {
            info.global = Some(wait);
        }
        info
    }
}

/// Imposes at least a fixed delay after every response, on top of header-driven limits.
#[derive(Debug, Clone)]
pub struct FixedDelayStrategy {
    delay: Duration,
    headers: HeaderStrategy,
}

impl FixedDelayStrategy {
    /// At least `delay` between requests of the bucket.
    pub fn new(delay: Duration) -> Self {
        Self { delay, headers: HeaderStrategy::default() }
    }
}

impl RateLimitStrategy for FixedDelayStrategy {
    fn apply(&self, response: &Response) -> RateLimitInfo {
        let mut info = self.headers.apply(response);
        info.reset_after = info.reset_after.max(self.delay);
        info
    }
}
