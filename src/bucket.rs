//! Rate-limit bucket identity.

use crate::request::Request;
use std::fmt;
use std::sync::Arc;

/// Canonical identity of a rate-limit bucket: `[METHOD ]template[:majorValue]`.
///
/// Two requests share a bucket exactly when their keys are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(Arc<str>);

impl BucketKey {
    /// Key of the single shared global queue on a coordination leader.
    pub const GLOBAL: &'static str = "global";

    /// Derive the bucket of `request` from its route and major parameter value.
    pub fn of(request: &Request) -> Self {
        let route = request.route();
        let mut key = String::with_capacity(route.template().len() + 24);
        if route.is_method_scoped() {
            key.push_str(route.method().as_str());
            key.push(' ');
        }
        key.push_str(route.template());
        if let Some(value) = route.major_param().and_then(|name| request.param(name)) {
            key.push(':');
            key.push_str(value);
        }
        Self(key.into())
    }

    /// The global key.
    pub fn global() -> Self {
        Self(Arc::from(Self::GLOBAL))
    }

    /// Wrap an already canonical key, e.g. one read off the wire.
    pub fn from_raw(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Canonical text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketKey({:?})", &*self.0)
    }
}

impl From<&str> for BucketKey {
    fn from(key: &str) -> Self {
        Self::from_raw(key)
    }
}

impl From<String> for BucketKey {
    fn from(key: String) -> Self {
        Self::from_raw(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;
    use std::collections::HashSet;

    fn key(route: Route, values: &[&str]) -> BucketKey {
        BucketKey::of(&Request::new(route, values.iter().copied()).unwrap())
    }

    #[test]
    fn major_value_partitions_buckets() {
        let route = Route::post("/channels/{channel.id}/messages");
        let a = key(route.clone(), &["1"]);
        let b = key(route.clone(), &["2"]);
        assert_ne!(a, b);
        assert_eq!(a, key(route, &["1"]));
        assert_eq!(a.as_str(), "/channels/{channel.id}/messages:1");
    }

    #[test]
    fn minor_params_share_a_bucket() {
        let route = Route::patch("/channels/{channel.id}/messages/{message.id}");
        assert_eq!(key(route.clone(), &["1", "10"]), key(route, &["1", "11"]));
    }

    #[test]
    fn method_scoped_routes_get_their_own_bucket() {
        let template = "/channels/{channel.id}/messages/{message.id}";
        let delete = key(Route::delete(template).scoped_by_method(), &["1", "10"]);
        let patch = key(Route::patch(template), &["1", "10"]);
        assert_ne!(delete, patch);
        assert!(delete.as_str().starts_with("DELETE /channels/"));
    }

    #[test]
    fn routes_without_major_param_are_shared() {
        let k = key(Route::get("/gateway/bot"), &[]);
        assert_eq!(k.to_string(), "/gateway/bot");
    }

    #[test]
    fn usable_as_map_key() {
        let route = Route::get("/guilds/{guild.id}/members");
        let set: HashSet<_> = ["1", "1", "2"].iter().map(|v| key(route.clone(), &[*v])).collect();
        assert_eq!(set.len(), 2);
        assert_eq!(BucketKey::global(), BucketKey::from("global"));
    }
}
