//! Route descriptors: an HTTP method plus a URI template such as
//! `/channels/{channel.id}/messages`.
//!
//! A route also names its *major parameter*, the placeholder whose value partitions rate-limit
//! buckets. By default the first placeholder among [`DEFAULT_MAJOR_PARAMS`] is used.

use crate::error::BuildError;
use http::Method;
use std::borrow::Cow;
use std::fmt;

/// Placeholders that identify a bucket unless a route overrides its major parameter.
pub const DEFAULT_MAJOR_PARAMS: [&str; 3] = ["channel.id", "guild.id", "webhook.id"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Part {
    Literal(String),
    Param(String),
}

/// Immutable route descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    template: Cow<'static, str>,
    parts: Vec<Part>,
    major_param: Option<String>,
    method_scoped: bool,
}

impl Route {
    /// Route for `method` on `template`.
    pub fn new(method: Method, template: impl Into<Cow<'static, str>>) -> Self {
        let template = template.into();
        let parts = parse_template(&template);
        let major_param = parts.iter().find_map(|part| match part {
            Part::Param(name) if DEFAULT_MAJOR_PARAMS.contains(&name.as_str()) => {
                Some(name.clone())
            }
            _ => None,
        });
        Self { method, template, parts, major_param, method_scoped: false }
    }

    /// `GET` route.
    pub fn get(template: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::GET, template)
    }

    /// `POST` route.
    pub fn post(template: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::POST, template)
    }

    /// `PUT` route.
    pub fn put(template: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::PUT, template)
    }

    /// `PATCH` route.
    pub fn patch(template: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::PATCH, template)
    }

    /// `DELETE` route.
    pub fn delete(template: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::DELETE, template)
    }

    /// Partition buckets by `param` instead of the default major parameter.
    pub fn with_major_param(mut self, param: impl Into<String>) -> Self {
        self.major_param = Some(param.into());
        self
    }

    /// Share one bucket across every value of every placeholder.
    pub fn without_major_param(mut self) -> Self {
        self.major_param = None;
        self
    }

    /// Give this route its own bucket per HTTP method, separate from other methods on the same
    /// template.
    pub fn scoped_by_method(mut self) -> Self {
        self.method_scoped = true;
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// URI template.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Placeholder that partitions buckets, if any.
    pub fn major_param(&self) -> Option<&str> {
        self.major_param.as_deref()
    }

    /// Whether the HTTP method is part of the bucket identity.
    pub fn is_method_scoped(&self) -> bool {
        self.method_scoped
    }

    /// Placeholder names in template order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Param(name) => Some(name.as_str()),
            Part::Literal(_) => None,
        })
    }

    /// Substitute `values` positionally, percent-encoding each as a path segment.
    ///
    /// Returns the expanded path and the raw `(placeholder, value)` pairs.
    pub fn expand(
        &self,
        values: &[String],
    ) -> Result<(String, Vec<(String, String)>), BuildError> {
        let expected = self.placeholders().count();
        if expected != values.len() {
            return Err(BuildError::ValueCount {
                template: self.template.to_string(),
                expected,
                provided: values.len(),
            });
        }
        let mut path = String::with_capacity(self.template.len() + values.len() * 16);
        let mut params = Vec::with_capacity(values.len());
        let mut values = values.iter();
        for part in &self.parts {
            match part {
                Part::Literal(text) => path.push_str(text),
                Part::Param(name) => {
                    // counts were checked above
                    if let Some(value) = values.next() {
                        encode_into(&mut path, value, is_path_segment_char);
                        params.push((name.clone(), value.clone()));
                    }
                }
            }
        }
        Ok((path, params))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

fn parse_template(template: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after.find('}');
        let name = close.map(|c| &after[..c]).filter(|name| {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        });
        match (name, close) {
            (Some(name), Some(close)) => {
                literal.push_str(&rest[..open]);
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Param(name.to_string()));
                rest = &after[close + 1..];
            }
            _ => {
                literal.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    parts
}

fn is_unreserved(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b'_' | b'~')
}

fn is_sub_delim(c: u8) -> bool {
    matches!(c, b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=')
}

/// pchar = unreserved / sub-delims / ":" / "@"
pub(crate) fn is_path_segment_char(c: u8) -> bool {
    is_unreserved(c) || is_sub_delim(c) || c == b':' || c == b'@'
}

/// Query components additionally escape the separators `&`, `=` and `+`.
pub(crate) fn is_query_param_char(c: u8) -> bool {
    is_path_segment_char(c) && !matches!(c, b'&' | b'=' | b'+') || c == b'/' || c == b'?'
}

pub(crate) fn encode_into(out: &mut String, value: &str, allowed: fn(u8) -> bool) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for &byte in value.as_bytes() {
        if allowed(byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0F) as usize] as char);
        }
    }
}
