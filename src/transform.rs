//! Per-route handling of error responses.
//!
//! A [`ResponseFunction`] sits between the rate-limit requeue and the server-error retry. It sees
//! every outcome of a matching request and may turn selected error statuses into an empty
//! response, or run the request again under its own [`RetryPolicy`]. Functions registered on a
//! router apply in registration order, each wrapping the ones before it.
//!
//! ```rust
//! use bucketgate::transform::{ResponseFunction, RouteMatcher};
//! use bucketgate::{Route, RouterOptions};
//!
//! let messages = Route::get("/channels/{channel.id}/messages/{message.id}");
//! let builder = RouterOptions::builder()
//!     .on_client_response(ResponseFunction::empty_if_not_found().matching(RouteMatcher::route(messages)))
//!     .on_client_response(ResponseFunction::retry_once_on_error_status([502]));
//! # let _ = builder;
//! ```
//!
//! 429 responses never reach a response function; the router requeues them first.

use crate::error::RouterError;
use crate::request::Request;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::route::Route;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Wait before the single retry of [`ResponseFunction::retry_once_on_error_status`].
pub const RETRY_ONCE_DELAY: Duration = Duration::from_secs(1);

/// Selects the requests a [`ResponseFunction`] applies to.
#[derive(Clone)]
pub enum RouteMatcher {
    /// Every request.
    Any,
    /// Requests on this route (same method and template).
    Route(Route),
    /// Requests accepted by a predicate.
    Custom(Arc<dyn Fn(&Request) -> bool + Send + Sync>),
}

impl RouteMatcher {
    /// Match every request.
    pub fn any() -> Self {
        RouteMatcher::Any
    }

    /// Match requests on `route`.
    pub fn route(route: Route) -> Self {
        RouteMatcher::Route(route)
    }

    /// Match requests accepted by `predicate`.
    pub fn custom(predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        RouteMatcher::Custom(Arc::new(predicate))
    }

    /// Whether `request` is selected.
    pub fn matches(&self, request: &Request) -> bool {
        match self {
            RouteMatcher::Any => true,
            RouteMatcher::Route(route) => {
                let other = request.route();
                route.method() == other.method() && route.template() == other.template()
            }
            RouteMatcher::Custom(predicate) => predicate(request),
        }
    }
}

impl fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMatcher::Any => f.write_str("Any"),
            RouteMatcher::Route(route) => f.debug_tuple("Route").field(route).finish(),
            RouteMatcher::Custom(_) => f.write_str("Custom(<predicate>)"),
        }
    }
}

#[derive(Debug, Clone)]
enum Action {
    Empty(Vec<u16>),
    Retry(RetryPolicy<RouterError>),
}

/// Transformation of the outcomes of matching requests.
#[derive(Debug, Clone)]
pub struct ResponseFunction {
    matcher: RouteMatcher,
    action: Action,
}

/// One run of the request below a response function.
pub(crate) type Attempt<'a> =
    Arc<dyn Fn() -> BoxFuture<'a, Result<Response, RouterError>> + Send + Sync + 'a>;

impl ResponseFunction {
    /// Turn 404s into an empty response.
    pub fn empty_if_not_found() -> Self {
        Self::empty_on_error_status([404])
    }

    /// Turn the given error statuses into an empty response carrying the status and headers.
    pub fn empty_on_error_status(codes: impl IntoIterator<Item = u16>) -> Self {
        Self { matcher: RouteMatcher::Any, action: Action::Empty(codes.into_iter().collect()) }
    }

    /// Retry once, [`RETRY_ONCE_DELAY`] later, on the given error statuses.
    ///
    /// Listing 502, 503 or 504 puts this retry ahead of the router's server-error backoff.
    pub fn retry_once_on_error_status(codes: impl IntoIterator<Item = u16>) -> Self {
        let codes: Vec<u16> = codes.into_iter().collect();
        let policy = RetryPolicy::once(RETRY_ONCE_DELAY, move |e| has_status(e, &codes));
        Self::retry_when(policy)
    }

    /// Run matching requests again under `policy`.
    ///
    /// A long-running policy holds up the bucket queue of every retried request.
    pub fn retry_when(policy: RetryPolicy<RouterError>) -> Self {
        Self { matcher: RouteMatcher::Any, action: Action::Retry(policy) }
    }

    /// Restrict this function to requests selected by `matcher`.
    pub fn matching(mut self, matcher: RouteMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Requests this function applies to.
    pub fn matcher(&self) -> &RouteMatcher {
        &self.matcher
    }

    async fn run<'a>(
        &self,
        attempt: &(dyn Fn() -> BoxFuture<'a, Result<Response, RouterError>> + Send + Sync + 'a),
    ) -> Result<Response, RouterError> {
        match &self.action {
            Action::Empty(codes) => match attempt().await {
                Err(RouterError::Client(error)) if codes.contains(&error.status().as_u16()) => {
                    tracing::debug!(status = %error.status(), uri = error.uri(), "error status suppressed");
                    Ok(Response::new(error.status(), error.headers().clone(), Bytes::new()))
                }
                other => other,
            },
            Action::Retry(policy) => policy.execute(|| attempt()).await,
        }
    }
}

fn has_status(error: &RouterError, codes: &[u16]) -> bool {
    matches!(error, RouterError::Client(e) if codes.contains(&e.status().as_u16()))
}

/// Wrap `upstream` in every function of `functions` that matches `request`, in order.
pub(crate) fn chain<'a>(
    functions: &'a [ResponseFunction],
    request: &Request,
    upstream: Attempt<'a>,
) -> Attempt<'a> {
    let mut attempt = upstream;
    for function in functions.iter().filter(|f| f.matcher.matches(request)) {
        let inner = attempt.clone();
        attempt = Arc::new(move || {
            let inner = inner.clone();
            async move { function.run(inner.as_ref()).await }.boxed()
        });
    }
    attempt
}
