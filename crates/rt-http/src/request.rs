//! Builder-driven request construction: a fluent, immutable-per-operation
//! configuration. Calling a method on `RequestBuilder` returns `Self` by
//! value, so each chained call produces a fresh value rather than mutating
//! shared state — the same "freeze at build time" shape `rt-http::client`
//! expects when it clones a `Request` into a retry loop.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

#[derive(Debug, Clone)]
pub enum PartValue {
    Text(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub value: PartValue,
}

#[derive(Debug, Clone)]
pub enum Body {
    Raw { content_type: String, bytes: Vec<u8> },
    Json(Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<Part>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1,
    Http2,
}

#[derive(Debug, Clone)]
pub enum Auth {
    Bearer(String),
    Basic { username: String, password: String },
}

/// A fully-built, ready-to-send request. Produced by `RequestBuilder::build`
/// (or implicitly by `Client::get`/`post`/etc. methods that call it for you).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
    pub timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub user_agent: Option<String>,
    pub auth: Option<Auth>,
    pub http_version: Option<HttpVersion>,
    pub throw_on_error: bool,
}

pub struct RequestBuilder {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Body>,
    timeout: Option<Duration>,
    follow_redirects: bool,
    user_agent: Option<String>,
    auth: Option<Auth>,
    http_version: Option<HttpVersion>,
    throw_on_error: bool,
}

impl RequestBuilder {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            follow_redirects: true,
            user_agent: None,
            auth: None,
            http_version: None,
            throw_on_error: false,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Some(Body::Json(value));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Form(fields));
        self
    }

    pub fn multipart(mut self, parts: Vec<Part>) -> Self {
        self.body = Some(Body::Multipart(parts));
        self
    }

    pub fn raw_body(mut self, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.body = Some(Body::Raw {
            content_type: content_type.into(),
            bytes,
        });
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Auth::Bearer(token.into()));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::Basic {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn http_version(mut self, version: HttpVersion) -> Self {
        self.http_version = Some(version);
        self
    }

    /// Opts into `HttpStatusError` for non-2xx responses rather than
    /// returning them as an ordinary `Response`.
    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }

    pub fn build(self) -> Request {
        Request {
            method: self.method,
            url: self.url,
            query: self.query,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
            follow_redirects: self.follow_redirects,
            user_agent: self.user_agent,
            auth: self.auth,
            http_version: self.http_version,
            throw_on_error: self.throw_on_error,
        }
    }
}

impl Request {
    pub fn url_with_query(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let qs: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, sep, qs.join("&"))
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_follow_redirects_and_does_not_throw_on_error() {
        let req = RequestBuilder::new(Method::Get, "https://a.test").build();
        assert!(req.follow_redirects);
        assert!(!req.throw_on_error);
        assert!(req.body.is_none());
    }

    #[test]
    fn url_with_query_appends_a_question_mark_when_the_url_has_none() {
        let req = RequestBuilder::new(Method::Get, "https://a.test/search")
            .query("q", "rust books")
            .query("page", "2")
            .build();
        assert_eq!(req.url_with_query(), "https://a.test/search?q=rust+books&page=2");
    }

    #[test]
    fn url_with_query_appends_with_ampersand_when_the_url_already_has_a_query_string() {
        let req = RequestBuilder::new(Method::Get, "https://a.test/search?sort=asc")
            .query("q", "x")
            .build();
        assert_eq!(req.url_with_query(), "https://a.test/search?sort=asc&q=x");
    }

    #[test]
    fn url_with_query_is_unchanged_without_any_query_params() {
        let req = RequestBuilder::new(Method::Get, "https://a.test").build();
        assert_eq!(req.url_with_query(), "https://a.test");
    }

    #[test]
    fn json_form_and_multipart_builders_set_the_matching_body_variant() {
        assert!(matches!(
            RequestBuilder::new(Method::Post, "u").json(serde_json::json!({"a": 1})).build().body,
            Some(Body::Json(_))
        ));
        assert!(matches!(
            RequestBuilder::new(Method::Post, "u").form(vec![("a".into(), "b".into())]).build().body,
            Some(Body::Form(_))
        ));
        assert!(matches!(
            RequestBuilder::new(Method::Post, "u")
                .multipart(vec![Part { name: "f".into(), value: PartValue::Text("v".into()) }])
                .build()
                .body,
            Some(Body::Multipart(_))
        ));
    }

    #[test]
    fn method_as_str_matches_the_http_verb() {
        assert_eq!(Method::Get.as_str(), "GET");
        assert_eq!(Method::Patch.as_str(), "PATCH");
    }
}
