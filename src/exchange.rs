//! The HTTP exchange: the caller-supplied function that actually talks to the API.
//!
//! The router never does I/O itself. Anything that implements [`HttpExchange`] can be plugged
//! in, including any `tower::Service<Request, Response = Response>` via [`ServiceExchange`].

use crate::error::RouterError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use std::fmt;
use tower::ServiceExt;
use tower_service::Service;

/// Performs one HTTP round trip.
#[async_trait]
pub trait HttpExchange: Send + Sync + fmt::Debug {
    /// Send `request` and read the full response. Error statuses are returned as `Ok`.
    async fn execute(&self, request: &Request) -> Result<Response, RouterError>;
}

/// Adapts a tower service into an [`HttpExchange`].
#[derive(Clone)]
pub struct ServiceExchange<S> {
    inner: S,
}

impl<S> ServiceExchange<S> {
    /// Wrap `inner`; it is cloned per call.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> fmt::Debug for ServiceExchange<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceExchange").field("inner", &std::any::type_name::<S>()).finish()
    }
}

#[async_trait]
impl<S> HttpExchange for ServiceExchange<S>
where
    S: Service<Request, Response = Response> + Clone + Send + Sync + 'static,
    S::Error: Into<RouterError>,
    S::Future: Send,
{
    async fn execute(&self, request: &Request) -> Result<Response, RouterError> {
        self.inner.clone().oneshot(request.clone()).await.map_err(Into::into)
    }
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_exchange::ReqwestExchange;

#[cfg(feature = "reqwest")]
mod reqwest_exchange {
    use super::*;
    use http::HeaderMap;

    /// Exchange backed by a `reqwest::Client` against a base URL.
    #[derive(Debug, Clone)]
    pub struct ReqwestExchange {
        client: reqwest::Client,
        base_url: String,
        default_headers: HeaderMap,
    }

    impl ReqwestExchange {
        /// Send requests to `base_url` (e.g. `https://discord.com/api/v10`).
        pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
            let base_url = base_url.into().trim_end_matches('/').to_string();
            Self { client, base_url, default_headers: HeaderMap::new() }
        }

        /// Headers added to every request unless the request sets them itself.
        pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
            self.default_headers = headers;
            self
        }
    }

    #[async_trait]
    impl HttpExchange for ReqwestExchange {
        async fn execute(&self, request: &Request) -> Result<Response, RouterError> {
            let url = format!("{}{}", self.base_url, request.uri());
            let mut headers = self.default_headers.clone();
            headers.extend(request.headers().clone());
            let mut builder =
                self.client.request(request.route().method().clone(), url).headers(headers);
            if let Some(body) = request.body_bytes() {
                builder = builder.body(body.clone());
            }
            let response =
                builder.send().await.map_err(|e| RouterError::Transport(e.to_string()))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| RouterError::Transport(e.to_string()))?;
            Ok(Response::new(status, headers, body))
        }
    }
}
