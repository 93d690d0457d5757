//! Cookie jar state machine: parsing `Set-Cookie`, domain/path matching,
//! `Cookie:` header composition, and an optional file-backed persistent
//! variant. Cookies are plain `serde`-derived structs, matching the way
//! config-like value types throughout the corpus derive `Serialize`/
//! `Deserialize` rather than hand-rolling (de)serialization.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix timestamp, seconds. `None` marks a session cookie.
    pub expires: Option<u64>,
    pub max_age: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    fn key(&self) -> (String, String, String) {
        (
            self.name.clone(),
            self.domain.clone().unwrap_or_default(),
            self.path.clone(),
        )
    }

    fn is_expired(&self, now: u64) -> bool {
        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return true;
            }
        }
        matches!(self.expires, Some(exp) if exp <= now)
    }

    fn is_session(&self) -> bool {
        self.expires.is_none() && self.max_age.is_none()
    }

    fn domain_matches(&self, host: &str) -> bool {
        match &self.domain {
            None => true,
            Some(domain) if domain.starts_with('.') => {
                host == &domain[1..] || host.ends_with(domain.as_str())
            }
            Some(domain) => host == domain,
        }
    }

    fn path_matches(&self, path: &str) -> bool {
        if path == self.path {
            return true;
        }
        path.starts_with(&self.path)
            && (self.path.ends_with('/') || path.as_bytes().get(self.path.len()) == Some(&b'/'))
    }

    /// Lenient `Set-Cookie` parser: unparseable attribute pairs are dropped,
    /// never fatal to the whole header.
    pub fn parse_set_cookie(header: &str, request_url: &Url) -> Option<Cookie> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name,
            value,
            domain: None,
            path: default_path(),
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
        };

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => cookie.domain = Some(val.trim().to_ascii_lowercase()),
                "path" if !val.is_empty() => cookie.path = val.trim().to_string(),
                "max-age" => cookie.max_age = val.trim().parse().ok(),
                "expires" => cookie.expires = httpdate_to_unix(val.trim()),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => {
                    cookie.same_site = match val.trim().to_ascii_lowercase().as_str() {
                        "strict" => Some(SameSite::Strict),
                        "lax" => Some(SameSite::Lax),
                        "none" => Some(SameSite::None),
                        _ => None,
                    }
                }
                _ => {}
            }
        }

        if cookie.domain.is_none() {
            cookie.domain = request_url.host_str().map(|h| h.to_string());
        }
        Some(cookie)
    }
}

/// Best-effort HTTP-date parse, tried in the three formats RFC 6265 §5.1.1
/// requires a cookie parser to accept: RFC 1123 (`Sun, 06 Nov 1994
/// 08:49:37 GMT`), the obsolete RFC 850/1036 form (`Sunday, 06-Nov-94
/// 08:49:37 GMT`), and `asctime` (`Sun Nov  6 08:49:37 1994`). Malformed
/// dates are dropped rather than failing the whole `Set-Cookie` entry.
fn httpdate_to_unix(s: &str) -> Option<u64> {
    const RFC1123: &str = "%a, %d %b %Y %H:%M:%S %Z";
    const RFC850: &str = "%A, %d-%b-%y %H:%M:%S %Z";
    const ASCTIME: &str = "%a %b %e %H:%M:%S %Y";

    let parsed: DateTime<Utc> = [RFC1123, RFC850, ASCTIME].iter().find_map(|fmt| {
        chrono::NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .and_then(|naive| Utc.from_local_datetime(&naive).single())
    })?;
    let unix = parsed.timestamp();
    u64::try_from(unix).ok()
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// De-duplicates on `(name, domain, path)`; last write wins.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: HashMap<(String, String, String), Cookie>,
    include_session_cookies_on_persist: bool,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_cookies_persisted(mut self, include: bool) -> Self {
        self.include_session_cookies_on_persist = include;
        self
    }

    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.cookies.insert(cookie.key(), cookie);
    }

    pub fn get_cookies(&self, domain: &str, path: &str, is_secure: bool) -> Vec<&Cookie> {
        let now = now_unix();
        self.cookies
            .values()
            .filter(|c| !c.is_expired(now))
            .filter(|c| c.domain_matches(domain))
            .filter(|c| c.path_matches(path))
            .filter(|c| !c.secure || is_secure)
            .collect()
    }

    pub fn get_cookie_header(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let is_secure = url.scheme() == "https";
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let matches = self.get_cookies(host, path, is_secure);
        if matches.is_empty() {
            return None;
        }
        Some(
            matches
                .into_iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn clear_expired(&mut self) {
        let now = now_unix();
        self.cookies.retain(|_, c| !c.is_expired(now));
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    fn persistable_cookies(&self) -> Vec<&Cookie> {
        self.cookies
            .values()
            .filter(|c| self.include_session_cookies_on_persist || !c.is_session())
            .collect()
    }
}

/// Atomically persists to `path` on every mutation: JSON array of `Cookie`,
/// written to a sibling temp file and renamed into place.
pub struct FileCookieJar {
    jar: CookieJar,
    path: PathBuf,
}

impl FileCookieJar {
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut jar = CookieJar::new();
        if let Ok(contents) = fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<Cookie>>(&contents) {
                Ok(cookies) => {
                    for cookie in cookies {
                        jar.set_cookie(cookie);
                    }
                }
                Err(err) => {
                    tracing::warn!(?err, path = %path.display(), "dropping malformed cookie jar file");
                }
            }
        }
        Ok(Self { jar, path })
    }

    pub fn set_cookie(&mut self, cookie: Cookie) -> std::io::Result<()> {
        self.jar.set_cookie(cookie);
        self.persist()
    }

    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    fn persist(&self) -> std::io::Result<()> {
        let cookies = self.jar.persistable_cookies();
        let json = serde_json::to_string_pretty(&cookies).unwrap_or_default();
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_domain_matches_as_a_suffix() {
        let mut jar = CookieJar::new();
        jar.set_cookie(Cookie {
            name: "session".into(),
            value: "abc".into(),
            domain: Some(".example.test".into()),
            path: "/".into(),
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
        });
        assert_eq!(jar.get_cookies("www.example.test", "/", false).len(), 1);
        assert_eq!(jar.get_cookies("other.test", "/", false).len(), 0);
    }

    #[test]
    fn last_write_wins_on_identical_key() {
        let mut jar = CookieJar::new();
        for value in ["first", "second"] {
            jar.set_cookie(Cookie {
                name: "a".into(),
                value: value.into(),
                domain: Some("example.test".into()),
                path: "/".into(),
                expires: None,
                max_age: None,
                secure: false,
                http_only: false,
                same_site: None,
            });
        }
        let matches = jar.get_cookies("example.test", "/", false);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].value, "second");
    }

    #[test]
    fn expires_attribute_without_max_age_is_parsed_as_a_real_deadline() {
        let url = Url::parse("https://example.test/").unwrap();
        let cookie =
            Cookie::parse_set_cookie("a=b; Expires=Wed, 09 Jun 2021 10:18:14 GMT", &url).unwrap();
        assert_eq!(cookie.expires, Some(1623233894));
        assert!(!cookie.is_session());
    }

    #[test]
    fn rfc850_and_asctime_expires_formats_also_parse() {
        let url = Url::parse("https://example.test/").unwrap();
        let rfc850 =
            Cookie::parse_set_cookie("a=b; Expires=Wednesday, 09-Jun-21 10:18:14 GMT", &url).unwrap();
        assert_eq!(rfc850.expires, Some(1623233894));

        let asctime = Cookie::parse_set_cookie("a=b; Expires=Wed Jun  9 10:18:14 2021", &url).unwrap();
        assert_eq!(asctime.expires, Some(1623233894));
    }

    #[test]
    fn unparseable_expires_is_dropped_not_fatal() {
        let url = Url::parse("https://example.test/").unwrap();
        let cookie = Cookie::parse_set_cookie("a=b; Expires=not-a-date", &url).unwrap();
        assert_eq!(cookie.expires, None);
    }

    #[test]
    fn secure_cookie_excluded_from_insecure_request() {
        let mut jar = CookieJar::new();
        jar.set_cookie(Cookie {
            name: "s".into(),
            value: "v".into(),
            domain: Some("example.test".into()),
            path: "/".into(),
            expires: None,
            max_age: None,
            secure: true,
            http_only: false,
            same_site: None,
        });
        assert!(jar.get_cookies("example.test", "/", false).is_empty());
        assert_eq!(jar.get_cookies("example.test", "/", true).len(), 1);
    }
}
