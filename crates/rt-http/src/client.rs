//! The HTTP client: builder-driven request construction plus the retry
//! engine, response cache, and cookie jar that `send`/`stream`/`download`
//! thread together. Grounded on the teacher's `crates/http_client` wrapper
//! around `reqwest`/`http-cache-reqwest`, generalized to the spec's
//! caller-controlled TTLs and our own `curl`-backed transport (§4.5, §9).

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use url::Url;

use rt_core::error::RuntimeError;
use rt_core::promise::Promise;
use rt_core::LoopHandle;

use crate::cache::{cache_key, Cache, CachedResponse};
use crate::cookie::CookieJar;
use crate::error::HttpError;
use crate::pump::{RawResponse, Transfer, TransferId, Transport};
use crate::request::{Auth, Body, Method, Request};
use crate::response::{DownloadResponse, Response, StreamingResponse};
use crate::retry::RetryConfig;
use crate::stream::{chunk_sink, ChunkSink};

/// Caller-supplied configuration a `Client` is built from. Every field is
/// optional: a bare `ClientConfig::default()` client has no retries, no
/// cache, and an in-memory-only, empty cookie jar.
#[derive(Default, Clone)]
pub struct ClientConfig {
    pub retry: Option<RetryConfig>,
    pub cache: Option<Rc<dyn Cache>>,
    pub cache_ttl: Duration,
    pub cookie_jar: Option<Rc<RefCell<CookieJar>>>,
    pub default_timeout: Option<Duration>,
    pub default_user_agent: Option<String>,
}

pub struct Client {
    handle: LoopHandle,
    pump: Rc<dyn Transport>,
    config: ClientConfig,
}

impl Client {
    pub fn new(handle: LoopHandle, pump: impl Transport + 'static, config: ClientConfig) -> Self {
        Self { handle, pump: Rc::new(pump), config }
    }

    pub fn get(&self, url: impl Into<String>) -> crate::request::RequestBuilder {
        crate::request::RequestBuilder::new(Method::Get, url)
    }

    pub fn post(&self, url: impl Into<String>) -> crate::request::RequestBuilder {
        crate::request::RequestBuilder::new(Method::Post, url)
    }

    pub fn put(&self, url: impl Into<String>) -> crate::request::RequestBuilder {
        crate::request::RequestBuilder::new(Method::Put, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> crate::request::RequestBuilder {
        crate::request::RequestBuilder::new(Method::Delete, url)
    }

    /// Sends `request`, applying the configured cache (GET only) and retry
    /// policy. Returns a cancellable promise: cancelling it cancels whatever
    /// attempt is currently in flight and stops further retries.
    pub fn send(&self, request: Request) -> Promise<Response, RuntimeError> {
        let scheduler = self.handle.scheduler();
        let is_get = matches!(request.method, Method::Get);

        if is_get {
            if let Some(cache) = &self.config.cache {
                let key = cache_key(&request.url_with_query());
                if let Some(cached) = cache.get(&key) {
                    metrics::counter!("rt_http_cache_hits_total").increment(1);
                    return Promise::resolved(
                        &scheduler,
                        Response {
                            status: cached.status,
                            headers: cached.headers,
                            body: cached.body,
                        },
                    );
                }
                metrics::counter!("rt_http_cache_misses_total").increment(1);
            }
        }

        let current: Rc<RefCell<Option<(TransferId, rt_core::promise::Resolver<RawResponse, HttpError>)>>> =
            Rc::new(RefCell::new(None));
        let cancelled = Rc::new(RefCell::new(false));

        let current_for_cancel = current.clone();
        let cancelled_for_cancel = cancelled.clone();
        let pump_for_cancel = self.pump.clone();
        let (promise, resolver, _cancel) = Promise::cancellable(&scheduler, move || {
            *cancelled_for_cancel.borrow_mut() = true;
            if let Some((id, attempt_resolver)) = current_for_cancel.borrow_mut().take() {
                pump_for_cancel.cancel(id);
                attempt_resolver.reject(HttpError::Cancelled);
            }
        });
        self.handle.track_shutdown(&resolver);

        let request = Rc::new(request);
        let ctx = Rc::new(SendCtx {
            handle: self.handle.clone(),
            pump: self.pump.clone(),
            retry: self.config.retry.clone(),
            cookie_jar: self.config.cookie_jar.clone(),
            cache: if is_get { self.config.cache.clone() } else { None },
            cache_ttl: self.config.cache_ttl,
            default_timeout: self.config.default_timeout,
            default_user_agent: self.config.default_user_agent.clone(),
            is_get,
            throw_on_error: request.throw_on_error,
        });

        attempt(ctx, request, resolver, current, cancelled, 1);
        promise
    }

    /// Streams the response body via `on_chunk`, settling with headers only
    /// once the transfer completes. Not retried or cached (the spec scopes
    /// retry/cache to the ordinary `send` path only).
    pub fn stream(
        &self,
        request: Request,
        on_chunk: impl FnMut(&[u8]) + 'static,
    ) -> Promise<StreamingResponse, RuntimeError> {
        self.run_uncached(request, Some(chunk_sink(on_chunk)), None)
            .map(|raw| StreamingResponse {
                status: raw.status,
                headers: raw.headers,
            })
    }

    /// Downloads the response body directly to `destination`, creating
    /// parent directories as needed. Cancelling the returned promise
    /// cancels the transfer and deletes any partially written file.
    pub fn download(&self, request: Request, destination: PathBuf) -> Promise<DownloadResponse, RuntimeError> {
        if let Some(parent) = destination.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                return Promise::rejected(&self.handle.scheduler(), RuntimeError::other(err.to_string()));
            }
        }
        let destination_for_sink = destination.clone();
        let destination_for_cancel = destination.clone();
        self.run_uncached(request, None, Some(Box::new(move || {
            let _ = fs::remove_file(&destination_for_cancel);
        })))
        .then(
            move |raw| -> Result<DownloadResponse, RuntimeError> {
                fs::write(&destination_for_sink, &raw.body)
                    .map_err(|e| RuntimeError::other(e.to_string()))?;
                Ok(DownloadResponse {
                    file: destination_for_sink,
                    status: raw.status,
                    headers: raw.headers,
                    size: raw.body.len() as u64,
                })
            },
            Err,
        )
    }

    /// Shared machinery for `stream`/`download`: a single non-retried,
    /// non-cached transfer with its own cancellation hook.
    fn run_uncached(
        &self,
        request: Request,
        on_chunk: Option<ChunkSink>,
        on_cancel_extra: Option<Box<dyn FnOnce()>>,
    ) -> Promise<RawResponse, RuntimeError> {
        let scheduler = self.handle.scheduler();
        let pump = self.pump.clone();
        let cookie_jar = self.config.cookie_jar.clone();
        let default_timeout = self.config.default_timeout;
        let default_user_agent = self.config.default_user_agent.clone();
        let transfer = build_transfer(&request, &cookie_jar, default_timeout, &default_user_agent);

        let id_cell: Rc<RefCell<Option<TransferId>>> = Rc::new(RefCell::new(None));
        let id_cell_for_cancel = id_cell.clone();
        let pump_for_cancel = pump.clone();
        let (promise, resolver, _cancel) = Promise::cancellable(&scheduler, move || {
            if let Some(id) = id_cell_for_cancel.borrow_mut().take() {
                pump_for_cancel.cancel(id);
            }
            if let Some(extra) = on_cancel_extra {
                extra();
            }
        });
        self.handle.track_shutdown(&resolver);

        let reg_result = pump.register_streaming(transfer, on_chunk, {
            let resolver = resolver.clone();
            Box::new(move |outcome| match outcome {
                Ok(raw) => resolver.resolve(raw),
                Err(err) => resolver.reject(RuntimeError::from(err)),
            })
        });
        match reg_result {
            Ok(id) => *id_cell.borrow_mut() = Some(id),
            Err(err) => resolver.reject(RuntimeError::from(err)),
        }
        promise
    }
}

/// Immutable, per-`send` configuration snapshot shared by every attempt in
/// the retry loop — avoids re-cloning `ClientConfig` fields on each retry.
struct SendCtx {
    handle: LoopHandle,
    pump: Rc<dyn Transport>,
    retry: Option<RetryConfig>,
    cookie_jar: Option<Rc<RefCell<CookieJar>>>,
    cache: Option<Rc<dyn Cache>>,
    cache_ttl: Duration,
    default_timeout: Option<Duration>,
    default_user_agent: Option<String>,
    is_get: bool,
    throw_on_error: bool,
}

type CurrentAttempt = Rc<RefCell<Option<(TransferId, rt_core::promise::Resolver<RawResponse, HttpError>)>>>;

/// Runs one attempt and, via `subscribe`, decides whether to retry (schedule
/// the backoff delay, then recurse) or settle the outer promise. Written as
/// explicit recursion rather than `async`/`.await` because `Promise<T, E>`
/// only implements `Future` for `E = RuntimeError` (see `promise.rs`), and
/// the retry engine needs `HttpError`'s retryability classification intact.
fn attempt(
    ctx: Rc<SendCtx>,
    request: Rc<Request>,
    resolver: rt_core::promise::Resolver<Response, RuntimeError>,
    current: CurrentAttempt,
    cancelled: Rc<RefCell<bool>>,
    attempt_no: u32,
) {
    if *cancelled.borrow() {
        resolver.reject(RuntimeError::Cancellation);
        return;
    }

    let max_attempts = ctx.retry.as_ref().map(|r| r.max_attempts()).unwrap_or(1);
    let transfer = build_transfer(&request, &ctx.cookie_jar, ctx.default_timeout, &ctx.default_user_agent);
    let (attempt_promise, attempt_resolver) = Promise::<RawResponse, HttpError>::pending(&ctx.handle.scheduler());

    let register_result = ctx.pump.register(transfer, {
        let attempt_resolver = attempt_resolver.clone();
        Box::new(move |outcome| match outcome {
            Ok(raw) => attempt_resolver.resolve(raw),
            Err(err) => attempt_resolver.reject(err),
        })
    });
    let id = match register_result {
        Ok(id) => id,
        Err(err) => {
            resolver.reject(RuntimeError::from(err));
            return;
        }
    };
    *current.borrow_mut() = Some((id, attempt_resolver));

    attempt_promise.subscribe(move |outcome| {
        *current.borrow_mut() = None;
        match outcome {
            Ok(raw) => {
                if let Some(jar) = &ctx.cookie_jar {
                    apply_set_cookies(jar, &request.url, &raw.headers);
                }
                let retryable_status = ctx
                    .retry
                    .as_ref()
                    .map(|r| r.is_retryable_status(raw.status))
                    .unwrap_or(false);
                if retryable_status && attempt_no < max_attempts {
                    retry_after_delay(ctx, request, resolver, current, cancelled, attempt_no);
                    return;
                }
                if ctx.is_get && raw.status / 100 == 2 {
                    if let Some(cache) = &ctx.cache {
                        let key = cache_key(&request.url_with_query());
                        cache.set(
                            &key,
                            CachedResponse {
                                body: raw.body.clone(),
                                status: raw.status,
                                headers: raw.headers.clone(),
                                expires_at: Instant::now() + ctx.cache_ttl,
                            },
                        );
                    }
                }
                if ctx.throw_on_error && raw.status / 100 != 2 {
                    resolver.reject(RuntimeError::other(format!("http status {}", raw.status)));
                    return;
                }
                resolver.resolve(Response {
                    status: raw.status,
                    headers: raw.headers,
                    body: raw.body,
                });
            }
            Err(err) => {
                if matches!(err, HttpError::Cancelled) {
                    resolver.reject(RuntimeError::Cancellation);
                    return;
                }
                let retryable = ctx
                    .retry
                    .as_ref()
                    .map(|r| r.is_retryable_error(&err))
                    .unwrap_or(false);
                if retryable && attempt_no < max_attempts {
                    retry_after_delay(ctx, request, resolver, current, cancelled, attempt_no);
                    return;
                }
                let cause = err.to_string();
                resolver.reject(RuntimeError::other(format!(
                    "failed after {attempt_no} attempts: {cause}"
                )));
            }
        }
    });
}

fn retry_after_delay(
    ctx: Rc<SendCtx>,
    request: Rc<Request>,
    resolver: rt_core::promise::Resolver<Response, RuntimeError>,
    current: CurrentAttempt,
    cancelled: Rc<RefCell<bool>>,
    attempt_no: u32,
) {
    let delay = ctx.retry.as_ref().expect("retryable implies configured").delay_for_attempt(attempt_no);
    metrics::counter!("rt_http_retries_total").increment(1);
    let ctx2 = ctx.clone();
    ctx.handle.add_timer(delay, move || {
        attempt(ctx2, request, resolver, current, cancelled, attempt_no + 1);
    });
}

fn build_transfer(
    request: &Request,
    cookie_jar: &Option<Rc<RefCell<CookieJar>>>,
    default_timeout: Option<Duration>,
    default_user_agent: &Option<String>,
) -> Transfer {
    let mut headers = request.headers.clone();

    if let Some(jar) = cookie_jar {
        if let Ok(url) = Url::parse(&request.url) {
            if let Some(jar_header) = jar.borrow().get_cookie_header(&url) {
                headers = merge_cookie_header(headers, jar_header);
            }
        }
    }

    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
        if let Some(ua) = request.user_agent.clone().or_else(|| default_user_agent.clone()) {
            headers.push(("User-Agent".to_string(), ua));
        }
    }

    match &request.auth {
        Some(Auth::Bearer(token)) => headers.push(("Authorization".to_string(), format!("Bearer {token}"))),
        Some(Auth::Basic { username, password }) => {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            headers.push(("Authorization".to_string(), format!("Basic {encoded}")));
        }
        None => {}
    }

    let body = request.body.as_ref().map(|body| encode_body(body, &mut headers));

    Transfer {
        method: request.method.as_str(),
        url: request.url_with_query(),
        headers,
        body,
        timeout: request.timeout.or(default_timeout),
        follow_redirects: request.follow_redirects,
        http_version: request.http_version,
    }
}

fn merge_cookie_header(mut headers: Vec<(String, String)>, jar_header: String) -> Vec<(String, String)> {
    if let Some(existing) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case("cookie")) {
        existing.1 = format!("{}; {}", existing.1, jar_header);
    } else {
        headers.push(("Cookie".to_string(), jar_header));
    }
    headers
}

fn apply_set_cookies(jar: &Rc<RefCell<CookieJar>>, request_url: &str, headers: &[(String, String)]) {
    let Ok(url) = Url::parse(request_url) else { return };
    let mut jar = jar.borrow_mut();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("set-cookie") {
            if let Some(cookie) = crate::cookie::Cookie::parse_set_cookie(value, &url) {
                jar.set_cookie(cookie);
            }
        }
    }
}

fn encode_body(body: &Body, headers: &mut Vec<(String, String)>) -> Vec<u8> {
    match body {
        Body::Raw { content_type, bytes } => {
            set_content_type(headers, content_type);
            bytes.clone()
        }
        Body::Json(value) => {
            set_content_type(headers, "application/json");
            serde_json::to_vec(value).unwrap_or_default()
        }
        Body::Form(fields) => {
            set_content_type(headers, "application/x-www-form-urlencoded");
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish()
                .into_bytes()
        }
        Body::Multipart(parts) => encode_multipart(parts, headers),
    }
}

fn set_content_type(headers: &mut Vec<(String, String)>, content_type: &str) {
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
        headers.push(("Content-Type".to_string(), content_type.to_string()));
    }
}

fn encode_multipart(parts: &[crate::request::Part], headers: &mut Vec<(String, String)>) -> Vec<u8> {
    let boundary = format!("----rt-http-boundary-{}", boundary_suffix());
    set_content_type(headers, &format!("multipart/form-data; boundary={boundary}"));
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match &part.value {
            crate::request::PartValue::Text(text) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name).as_bytes(),
                );
                body.extend_from_slice(text.as_bytes());
                body.extend_from_slice(b"\r\n");
            }
            crate::request::PartValue::File(path) => {
                let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                        part.name, filename
                    )
                    .as_bytes(),
                );
                if let Ok(contents) = fs::read(path) {
                    body.extend_from_slice(&contents);
                }
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

fn boundary_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::pump::MockTransport;
    use crate::request::RequestBuilder;

    fn raw_ok(body: &str) -> RawResponse {
        RawResponse { status: 200, headers: Vec::new(), body: body.as_bytes().to_vec() }
    }

    #[test]
    fn successful_get_is_served_from_cache_on_the_second_call() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        mock.push_response(Ok(raw_ok("hello")));
        let client = Client::new(
            handle.clone(),
            mock.clone(),
            ClientConfig {
                cache: Some(InMemoryCache::new()),
                cache_ttl: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let first = client.send(RequestBuilder::new(Method::Get, "https://a.test").build());
        let resp = handle.run_until_settled(&first).unwrap();
        assert_eq!(resp.body, b"hello");

        let second = client.send(RequestBuilder::new(Method::Get, "https://a.test").build());
        let resp = handle.run_until_settled(&second).unwrap();
        assert_eq!(resp.body, b"hello");
        assert_eq!(mock.request_count(), 1, "second GET should be served from cache, not re-sent");
    }

    #[test]
    fn post_requests_are_never_cached() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        mock.push_response(Ok(raw_ok("a")));
        mock.push_response(Ok(raw_ok("b")));
        let client = Client::new(
            handle.clone(),
            mock.clone(),
            ClientConfig {
                cache: Some(InMemoryCache::new()),
                cache_ttl: Duration::from_secs(60),
                ..Default::default()
            },
        );

        for _ in 0..2 {
            let p = client.send(RequestBuilder::new(Method::Post, "https://a.test").build());
            handle.run_until_settled(&p).unwrap();
        }
        assert_eq!(mock.request_count(), 2);
    }

    #[test]
    fn a_retryable_transport_error_is_retried_until_it_succeeds() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        mock.push_response(Err(HttpError::Transport("connection reset".into())));
        mock.push_response(Ok(raw_ok("recovered")));
        let client = Client::new(
            handle.clone(),
            mock.clone(),
            ClientConfig {
                retry: Some(RetryConfig {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    jitter: 0.0,
                    ..RetryConfig::default()
                }),
                ..Default::default()
            },
        );

        let p = client.send(RequestBuilder::new(Method::Get, "https://a.test").build());
        let resp = handle.run_until_settled(&p).unwrap();
        assert_eq!(resp.body, b"recovered");
        assert_eq!(mock.request_count(), 2);
    }

    #[test]
    fn exhausting_retries_reports_the_last_cause() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        for _ in 0..3 {
            mock.push_response(Err(HttpError::Transport("still down".into())));
        }
        let client = Client::new(
            handle.clone(),
            mock.clone(),
            ClientConfig {
                retry: Some(RetryConfig {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    jitter: 0.0,
                    ..RetryConfig::default()
                }),
                ..Default::default()
            },
        );

        let p = client.send(RequestBuilder::new(Method::Get, "https://a.test").build());
        let err = handle.run_until_settled(&p).unwrap_err();
        assert!(err.to_string().contains("failed after 3 attempts"));
        assert_eq!(mock.request_count(), 3);
    }

    #[test]
    fn a_custom_retryable_predicate_overrides_the_default_transport_check() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        mock.push_response(Err(HttpError::Transport("not retried by the custom predicate".into())));
        let client = Client::new(
            handle.clone(),
            mock.clone(),
            ClientConfig {
                retry: Some(RetryConfig {
                    max_retries: 2,
                    retryable_exceptions: crate::retry::RetryableExceptions::new(|err| {
                        matches!(err, HttpError::Io(_))
                    }),
                    ..RetryConfig::default()
                }),
                ..Default::default()
            },
        );

        let p = client.send(RequestBuilder::new(Method::Get, "https://a.test").build());
        assert!(handle.run_until_settled(&p).is_err());
        assert_eq!(mock.request_count(), 1, "transport error not matched by the custom predicate should not retry");
    }

    #[test]
    fn status_in_the_retryable_set_is_retried_then_returned_once_exhausted() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        mock.push_response(Ok(RawResponse { status: 503, headers: Vec::new(), body: Vec::new() }));
        mock.push_response(Ok(RawResponse { status: 503, headers: Vec::new(), body: Vec::new() }));
        let mut retryable_status_codes = std::collections::HashSet::new();
        retryable_status_codes.insert(503);
        let client = Client::new(
            handle.clone(),
            mock.clone(),
            ClientConfig {
                retry: Some(RetryConfig {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    retryable_status_codes,
                    ..RetryConfig::default()
                }),
                ..Default::default()
            },
        );

        let p = client.send(RequestBuilder::new(Method::Get, "https://a.test").build());
        let resp = handle.run_until_settled(&p).unwrap();
        assert_eq!(resp.status, 503);
        assert_eq!(mock.request_count(), 2);
    }

    #[test]
    fn throw_on_error_rejects_non_2xx_responses_instead_of_returning_them() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        mock.push_response(Ok(RawResponse { status: 404, headers: Vec::new(), body: Vec::new() }));
        let client = Client::new(handle.clone(), mock.clone(), ClientConfig::default());

        let req = RequestBuilder::new(Method::Get, "https://a.test").throw_on_error(true).build();
        let p = client.send(req);
        let err = handle.run_until_settled(&p).unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn set_cookie_on_the_response_is_applied_to_the_jar() {
        let handle = LoopHandle::new();
        let mock = Rc::new(MockTransport::new());
        mock.push_response(Ok(RawResponse {
            status: 200,
            headers: vec![("Set-Cookie".to_string(), "session=abc; Path=/".to_string())],
            body: Vec::new(),
        }));
        let jar = Rc::new(RefCell::new(CookieJar::new()));
        let client = Client::new(
            handle.clone(),
            mock.clone(),
            ClientConfig { cookie_jar: Some(jar.clone()), ..Default::default() },
        );

        let p = client.send(RequestBuilder::new(Method::Get, "https://a.test/").build());
        handle.run_until_settled(&p).unwrap();
        assert_eq!(jar.borrow().get_cookie_header(&Url::parse("https://a.test/").unwrap()), Some("session=abc".to_string()));
    }
}
