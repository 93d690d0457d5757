//! Response caching keyed by an opaque, stable function of the URL
//! (`cache_key`). Generalizes the shape the teacher gets "for free" from
//! `http-cache-reqwest`'s `HttpCache`/`MokaManager` in
//! `crates/http_client/src/lib.rs` into an injectable `Cache` trait with
//! caller-controlled TTLs rather than origin `Cache-Control` semantics.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub expires_at: Instant,
}

pub trait Cache {
    fn get(&self, key: &str) -> Option<CachedResponse>;
    fn set(&self, key: &str, value: CachedResponse);
}

/// Default cache: a plain `HashMap` guarded by `RefCell` (single-threaded,
/// so no `Mutex` needed), with TTLs read off each entry's `expires_at`.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RefCell<HashMap<String, CachedResponse>>,
}

impl InMemoryCache {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> Option<CachedResponse> {
        let entries = self.entries.borrow();
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.clone())
    }

    fn set(&self, key: &str, value: CachedResponse) {
        self.entries.borrow_mut().insert(key.to_string(), value);
    }
}

/// Opaque, stable cache key: SHA-1 of the URL. Exposed publicly so callers
/// can invalidate a specific entry without reimplementing the hash choice
/// (the distilled spec leaves the exact hash unspecified, only requiring
/// that it be stable and exposed as a public helper).
pub fn cache_key(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn ttl_to_deadline(ttl: Duration) -> Instant {
    Instant::now() + ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(expires_at: Instant) -> CachedResponse {
        CachedResponse {
            body: b"cached".to_vec(),
            status: 200,
            headers: Vec::new(),
            expires_at,
        }
    }

    #[test]
    fn cache_key_is_stable_and_distinguishes_urls() {
        assert_eq!(cache_key("https://a.test/x"), cache_key("https://a.test/x"));
        assert_ne!(cache_key("https://a.test/x"), cache_key("https://a.test/y"));
    }

    #[test]
    fn unexpired_entry_is_returned() {
        let cache = InMemoryCache::new();
        cache.set("k", entry(Instant::now() + Duration::from_secs(60)));
        assert_eq!(cache.get("k").unwrap().body, b"cached");
    }

    #[test]
    fn expired_entry_is_treated_as_a_miss() {
        let cache = InMemoryCache::new();
        cache.set("k", entry(Instant::now() - Duration::from_secs(1)));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn missing_key_is_a_miss() {
        let cache = InMemoryCache::new();
        assert!(cache.get("absent").is_none());
    }

    #[test]
    fn set_overwrites_the_previous_value_for_the_same_key() {
        let cache = InMemoryCache::new();
        cache.set("k", entry(Instant::now() + Duration::from_secs(60)));
        let mut second = entry(Instant::now() + Duration::from_secs(60));
        second.body = b"updated".to_vec();
        cache.set("k", second);
        assert_eq!(cache.get("k").unwrap().body, b"updated");
    }
}
