//! Outbound API requests.

use crate::error::BuildError;
use crate::route::{encode_into, is_query_param_char, Route};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::HeaderMap;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier attached to a request for tracing and coordination frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A request bound to a [`Route`] with its placeholder values filled in.
///
/// Cloning yields an equivalent request, which is how retries resubmit.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    route: Arc<Route>,
    path: String,
    params: Vec<(String, String)>,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    /// Bind `route` to `values`, one per placeholder in template order.
    pub fn new<I>(route: impl Into<Arc<Route>>, values: I) -> Result<Self, BuildError>
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        let route = route.into();
        let values: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
        let (path, params) = route.expand(&values)?;
        Ok(Self {
            id: RequestId::new(),
            route,
            path,
            params,
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        })
    }

    /// Append a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Set a header, replacing any previous value.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a header from strings.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self, BuildError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| BuildError::InvalidHeader(e.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| BuildError::InvalidHeader(e.to_string()))?;
        Ok(self.header(name, value))
    }

    /// Raw body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body with a matching content type.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, BuildError> {
        let bytes = serde_json::to_vec(body).map_err(|e| BuildError::Body(e.to_string()))?;
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Request identifier.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Route this request was built from.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Raw value supplied for `placeholder`.
    pub fn param(&self, placeholder: &str) -> Option<&str> {
        self.params.iter().find(|(name, _)| name == placeholder).map(|(_, v)| v.as_str())
    }

    /// Expanded path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Expanded path followed by the encoded query string.
    pub fn uri(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let mut uri = self.path.clone();
        for (i, (key, value)) in self.query.iter().enumerate() {
            uri.push(if i == 0 { '?' } else { '&' });
            encode_into(&mut uri, key, is_query_param_char);
            uri.push('=');
            encode_into(&mut uri, value, is_query_param_char);
        }
        uri
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request body.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// `METHOD /path?query`, as used in logs.
    pub fn description(&self) -> String {
        format!("{} {}", self.route.method(), self.uri())
    }
}
