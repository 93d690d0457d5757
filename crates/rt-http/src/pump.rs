//! The HTTP transfer pump: owns a single `curl::multi::Multi` handle (the
//! "native multi-request transfer library" of the spec) and advances every
//! in-flight transfer with one non-blocking `perform()` call per loop
//! iteration. `Pump` is the concrete type; `LoopPump` is the thin adapter
//! that makes it satisfy `rt_core::pump::HttpPump`'s object-safe seam so
//! `rt-core` itself never depends on `curl`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use curl::easy::{Easy2, Handler, List, WriteError};
use curl::multi::{Easy2Handle, Multi};

use rt_core::pump::HttpPump;

use crate::error::HttpError;
use crate::request::HttpVersion;

pub type TransferId = usize;

/// A fully-resolved transfer: everything `curl::easy::Easy2` needs, already
/// flattened out of the builder-level `Request`/retry/cache layers above.
pub struct Transfer {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub http_version: Option<HttpVersion>,
}

#[derive(Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

type Completion = Box<dyn FnOnce(Result<RawResponse, HttpError>)>;
type ChunkWatcher = Rc<RefCell<dyn FnMut(&[u8])>>;

/// The narrow transfer seam `Client` programs against, so its retry/cache
/// logic can be exercised against a scripted fake instead of real libcurl
/// transfers. Boxes its completion in place of `Pump`'s `impl FnOnce` so the
/// trait stays object-safe.
pub trait Transport {
    fn register(&self, transfer: Transfer, on_complete: Completion) -> Result<TransferId, HttpError>;

    fn register_streaming(
        &self,
        transfer: Transfer,
        on_chunk: Option<ChunkWatcher>,
        on_complete: Completion,
    ) -> Result<TransferId, HttpError>;

    fn cancel(&self, id: TransferId);
}

impl<T: Transport + ?Sized> Transport for Rc<T> {
    fn register(&self, transfer: Transfer, on_complete: Completion) -> Result<TransferId, HttpError> {
        (**self).register(transfer, on_complete)
    }

    fn register_streaming(
        &self,
        transfer: Transfer,
        on_chunk: Option<ChunkWatcher>,
        on_complete: Completion,
    ) -> Result<TransferId, HttpError> {
        (**self).register_streaming(transfer, on_chunk, on_complete)
    }

    fn cancel(&self, id: TransferId) {
        (**self).cancel(id)
    }
}

#[derive(Default)]
struct Collector {
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    on_chunk: Option<Rc<RefCell<dyn FnMut(&[u8])>>>,
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if let Some(cb) = &self.on_chunk {
            (cb.borrow_mut())(data);
        }
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(line) = std::str::from_utf8(data) {
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some((name, value)) = line.split_once(':') {
                self.headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        true
    }
}

struct InFlight {
    handle: Easy2Handle<Collector>,
    on_complete: Completion,
}

#[derive(Default)]
struct PumpInner {
    multi: Option<Multi>,
    in_flight: HashMap<TransferId, InFlight>,
    next_id: TransferId,
}

impl PumpInner {
    fn multi(&mut self) -> &Multi {
        self.multi.get_or_insert_with(Multi::new)
    }
}

/// Cloneable handle to the transfer pump. The loop itself only ever sees the
/// narrow `HttpPump` seam (via `LoopPump`); `Client` holds a `Pump` directly
/// so it can register and cancel individual transfers.
#[derive(Clone, Default)]
pub struct Pump(Rc<RefCell<PumpInner>>);

impl Pump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps this pump in the adapter `rt_core::LoopHandle::install_http_pump`
    /// expects.
    pub fn as_loop_pump(&self) -> Box<dyn HttpPump> {
        Box::new(LoopPump(self.clone()))
    }

    pub fn register(
        &self,
        transfer: Transfer,
        on_complete: impl FnOnce(Result<RawResponse, HttpError>) + 'static,
    ) -> Result<TransferId, HttpError> {
        self.register_streaming(transfer, None, on_complete)
    }

    pub fn register_streaming(
        &self,
        transfer: Transfer,
        on_chunk: Option<Rc<RefCell<dyn FnMut(&[u8])>>>,
        on_complete: impl FnOnce(Result<RawResponse, HttpError>) + 'static,
    ) -> Result<TransferId, HttpError> {
        let mut easy = Easy2::new(Collector {
            body: Vec::new(),
            headers: Vec::new(),
            on_chunk,
        });
        easy.url(&transfer.url).map_err(curl_err)?;
        easy.custom_request(transfer.method).map_err(curl_err)?;
        easy.follow_location(transfer.follow_redirects).map_err(curl_err)?;
        if let Some(timeout) = transfer.timeout {
            easy.timeout(timeout).map_err(curl_err)?;
        }
        if let Some(HttpVersion::Http2) = transfer.http_version {
            // Best-effort: fall back silently to whatever the local libcurl
            // build actually supports (the spec's "fallback on unsupported
            // version" behavior).
            let _ = easy.http_version(curl::easy::HttpVersion::V2);
        }
        let mut list = List::new();
        for (name, value) in &transfer.headers {
            list.append(&format!("{name}: {value}")).map_err(curl_err)?;
        }
        easy.http_headers(list).map_err(curl_err)?;
        if let Some(body) = &transfer.body {
            easy.post(true).map_err(curl_err)?;
            easy.post_fields_copy(body).map_err(curl_err)?;
        }

        let mut inner = self.0.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let handle = inner.multi().add2(easy).map_err(curl_err)?;
        handle.set_token(id).map_err(curl_err)?;
        inner.in_flight.insert(
            id,
            InFlight {
                handle,
                on_complete: Box::new(on_complete),
            },
        );
        Ok(id)
    }

    /// Cancels an in-flight transfer: removes it from the multi handle so no
    /// further bytes are read or written, without invoking `on_complete`.
    pub fn cancel(&self, id: TransferId) {
        let mut inner = self.0.borrow_mut();
        if let Some(in_flight) = inner.in_flight.remove(&id) {
            if let Some(multi) = &inner.multi {
                let _ = multi.remove2(in_flight.handle);
            }
        }
    }

    pub fn has_in_flight(&self) -> bool {
        !self.0.borrow().in_flight.is_empty()
    }

    /// One non-blocking multi-perform pass: drives every in-flight transfer
    /// forward, then drains completion messages and invokes their callbacks.
    pub fn poll(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.in_flight.is_empty() {
            return;
        }
        if let Err(err) = inner.multi().perform() {
            tracing::warn!(?err, "curl multi perform failed");
        }

        let mut finished: Vec<TransferId> = Vec::new();
        let mut outcomes: Vec<Result<RawResponse, HttpError>> = Vec::new();
        {
            let PumpInner { multi, in_flight, .. } = &mut *inner;
            let multi = multi.as_ref().expect("initialized above");
            multi.messages(|msg| {
                let Ok(token) = msg.token() else { return };
                let Some(in_flight) = in_flight.get(&token) else { return };
                let Some(result) = msg.result_for2(&in_flight.handle) else { return };
                let outcome = match result {
                    Ok(()) => {
                        let status = in_flight.handle.response_code().unwrap_or(0) as u16;
                        Ok(RawResponse {
                            status,
                            headers: in_flight.handle.get_ref().headers.clone(),
                            body: in_flight.handle.get_ref().body.clone(),
                        })
                    }
                    Err(err) => Err(curl_err(err)),
                };
                finished.push(token);
                outcomes.push(outcome);
            });
        }

        for (id, outcome) in finished.into_iter().zip(outcomes) {
            if let Some(in_flight) = inner.in_flight.remove(&id) {
                if let Some(multi) = &inner.multi {
                    let _ = multi.remove2(in_flight.handle);
                }
                (in_flight.on_complete)(outcome);
            }
        }
    }
}

impl Transport for Pump {
    fn register(&self, transfer: Transfer, on_complete: Completion) -> Result<TransferId, HttpError> {
        Pump::register(self, transfer, on_complete)
    }

    fn register_streaming(
        &self,
        transfer: Transfer,
        on_chunk: Option<ChunkWatcher>,
        on_complete: Completion,
    ) -> Result<TransferId, HttpError> {
        Pump::register_streaming(self, transfer, on_chunk, on_complete)
    }

    fn cancel(&self, id: TransferId) {
        Pump::cancel(self, id)
    }
}

fn curl_err(err: curl::Error) -> HttpError {
    HttpError::Transport(err.to_string())
}

/// Adapter making `Pump` satisfy `rt_core::pump::HttpPump`.
struct LoopPump(Pump);

impl HttpPump for LoopPump {
    fn poll(&mut self) {
        self.0.poll();
    }

    fn has_in_flight(&self) -> bool {
        self.0.has_in_flight()
    }
}

/// A scripted [`Transport`] double: every `register`/`register_streaming`
/// call pops the next queued outcome (settling synchronously, which
/// `Promise::subscribe` handles correctly even when the subscriber attaches
/// after the fact — see `promise.rs`) and records the method/URL it was
/// given. Lets `Client`'s retry and cache logic be exercised without a real
/// libcurl transfer.
#[cfg(test)]
pub struct MockTransport {
    responses: RefCell<std::collections::VecDeque<Result<RawResponse, HttpError>>>,
    requests: RefCell<Vec<(&'static str, String)>>,
    next_id: std::cell::Cell<TransferId>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: RefCell::new(std::collections::VecDeque::new()),
            requests: RefCell::new(Vec::new()),
            next_id: std::cell::Cell::new(0),
        }
    }

    pub fn push_response(&self, outcome: Result<RawResponse, HttpError>) {
        self.responses.borrow_mut().push_back(outcome);
    }

    pub fn requests(&self) -> Vec<(&'static str, String)> {
        self.requests.borrow().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn register(&self, transfer: Transfer, on_complete: Completion) -> Result<TransferId, HttpError> {
        self.requests.borrow_mut().push((transfer.method, transfer.url.clone()));
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let outcome = self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(HttpError::Transport("no mock response queued".into())));
        on_complete(outcome);
        Ok(id)
    }

    fn register_streaming(
        &self,
        transfer: Transfer,
        _on_chunk: Option<ChunkWatcher>,
        on_complete: Completion,
    ) -> Result<TransferId, HttpError> {
        self.register(transfer, on_complete)
    }

    fn cancel(&self, _id: TransferId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(url: &str) -> Transfer {
        Transfer {
            method: "GET",
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            follow_redirects: true,
            http_version: None,
        }
    }

    #[test]
    fn header_parsing_splits_on_first_colon_and_trims_whitespace() {
        let mut collector = Collector::default();
        assert!(collector.header(b"Content-Type: application/json\r\n"));
        assert_eq!(
            collector.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn header_line_without_colon_is_ignored() {
        let mut collector = Collector::default();
        assert!(collector.header(b"HTTP/1.1 200 OK\r\n"));
        assert!(collector.headers.is_empty());
    }

    #[test]
    fn write_invokes_on_chunk_and_still_accumulates_the_body() {
        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_for_cb = seen.clone();
        let mut collector = Collector {
            body: Vec::new(),
            headers: Vec::new(),
            on_chunk: Some(Rc::new(RefCell::new(move |chunk: &[u8]| {
                seen_for_cb.borrow_mut().extend_from_slice(chunk);
            }))),
        };
        collector.write(b"hello").unwrap();
        collector.write(b" world").unwrap();
        assert_eq!(collector.body, b"hello world");
        assert_eq!(*seen.borrow(), b"hello world");
    }

    #[test]
    fn mock_transport_pops_responses_in_fifo_order_and_records_requests() {
        let mock = MockTransport::new();
        mock.push_response(Ok(RawResponse { status: 200, headers: Vec::new(), body: b"first".to_vec() }));
        mock.push_response(Ok(RawResponse { status: 500, headers: Vec::new(), body: b"second".to_vec() }));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen1 = seen.clone();
        mock.register(transfer("https://a.test"), Box::new(move |r| seen1.borrow_mut().push(r))).unwrap();
        let seen2 = seen.clone();
        mock.register(transfer("https://b.test"), Box::new(move |r| seen2.borrow_mut().push(r))).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen[0].as_ref().unwrap().status, 200);
        assert_eq!(seen[1].as_ref().unwrap().status, 500);
        assert_eq!(mock.requests(), vec![("GET", "https://a.test".to_string()), ("GET", "https://b.test".to_string())]);
    }

    #[test]
    fn mock_transport_without_a_queued_response_rejects_as_transport_error() {
        let mock = MockTransport::new();
        let outcome = Rc::new(RefCell::new(None));
        let outcome_cb = outcome.clone();
        mock.register(transfer("https://a.test"), Box::new(move |r| *outcome_cb.borrow_mut() = Some(r))).unwrap();
        assert!(matches!(outcome.borrow().as_ref().unwrap(), Err(HttpError::Transport(_))));
    }
}
