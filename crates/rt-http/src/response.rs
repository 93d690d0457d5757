use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Resolved once headers arrive; `on_chunk` has already been invoked for
/// every chunk received before this settles, so `body_so_far` only ever
/// accumulates bytes seen after the caller's own streaming callback ran.
#[derive(Debug, Clone)]
pub struct StreamingResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DownloadResponse {
    pub file: PathBuf,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> Response {
        Response {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: br#"{"ok":true}"#.to_vec(),
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = response(200);
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(resp.header("x-missing"), None);
    }

    #[test]
    fn is_success_covers_only_the_2xx_range() {
        assert!(response(200).is_success());
        assert!(response(299).is_success());
        assert!(!response(300).is_success());
        assert!(!response(404).is_success());
    }

    #[test]
    fn json_deserializes_the_body() {
        #[derive(serde::Deserialize)]
        struct Body {
            ok: bool,
        }
        let resp = response(200);
        assert!(resp.json::<Body>().unwrap().ok);
    }
}
