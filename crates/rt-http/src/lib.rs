//! Multiplexed non-blocking HTTP client, built over libcurl's multi
//! interface via the `curl` crate (the direct Rust binding for the "native
//! multi-request transfer library" the spec calls for). `pump::Pump` plugs
//! into `rt_core::LoopHandle::install_http_pump`; `client::Client` is the
//! public, builder-driven surface callers actually use.

pub mod cache;
pub mod client;
pub mod cookie;
pub mod error;
pub mod pump;
pub mod request;
pub mod response;
pub mod retry;
pub mod stream;

pub use cache::{cache_key, Cache, CachedResponse, InMemoryCache};
pub use client::{Client, ClientConfig};
pub use cookie::{Cookie, CookieJar, FileCookieJar, SameSite};
pub use error::HttpError;
pub use pump::Pump;
pub use request::{Auth, Body, HttpVersion, Method, Part, PartValue, Request, RequestBuilder};
pub use response::{DownloadResponse, Response, StreamingResponse};
pub use retry::RetryConfig;
