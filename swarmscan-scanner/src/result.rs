use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw outcome of a single HTTP request, before any element extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: String,
    /// Absolute redirect target when the response carried a `Location` header.
    pub location: Option<String>,
    pub response_time: Duration,
}

impl FetchResult {
    pub fn new(url: String) -> Self {
        Self {
            url,
            status_code: 0,
            headers: Vec::new(),
            content_type: None,
            body: String::new(),
            location: None,
            response_time: Duration::from_secs(0),
        }
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code) && self.location.is_some()
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_ref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false)
    }

    /// Case-insensitive lookup of the first header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_requires_location() {
        let mut result = FetchResult::new("http://example.com/".to_string());
        result.status_code = 302;
        assert!(!result.is_redirect());

        result.location = Some("http://example.com/login".to_string());
        assert!(result.is_redirect());
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut result = FetchResult::new("http://example.com/".to_string());
        result.headers.push(("Set-Cookie".to_string(), "a=1".to_string()));
        result.headers.push(("set-cookie".to_string(), "b=2".to_string()));

        assert_eq!(result.header("SET-COOKIE"), Some("a=1"));
        assert_eq!(result.headers_named("set-cookie").count(), 2);
    }
}
