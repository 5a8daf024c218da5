use crate::error::{Result, ScanError};
use crate::result::FetchResult;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "swarmscan/0.1";

/// Single-request HTTP primitive.
///
/// Redirects are never followed here: the orchestration engine decides what
/// to do with a `Location` header, so it is resolved and handed back verbatim.
#[derive(Clone)]
pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    pub fn new() -> Result<Self> {
        Self::with_options(10, DEFAULT_USER_AGENT)
    }

    pub fn with_options(timeout_secs: u64, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs.div_ceil(2)))
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .http2_adaptive_window(true)
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchResult> {
        debug!("Fetching {}", url);

        let base = Url::parse(url).map_err(|e| ScanError::InvalidUrl(format!("{}: {}", url, e)))?;

        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let response_time = start.elapsed();

        let status_code = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| base.join(loc).ok())
            .map(|mut target| {
                target.set_fragment(None);
                target.to_string()
            });

        let body = response.text().await?;

        let mut result = FetchResult::new(url.to_string());
        result.status_code = status_code;
        result.headers = headers;
        result.content_type = content_type;
        result.body = body;
        result.location = location;
        result.response_time = response_time;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    #[tokio::test]
    async fn test_fetch_captures_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .insert_header("x-frame-options", "DENY")
                    .set_body_bytes(b"<html><body>Hello</body></html>"),
            )
            .mount(&mock_server)
            .await;

        let fetcher = PageFetcher::new().unwrap();
        let result = fetcher.fetch(&mock_server.uri()).await.unwrap();

        assert_eq!(result.status_code, 200);
        assert!(result.is_html());
        assert_eq!(result.header("X-Frame-Options"), Some("DENY"));
        assert!(result.body.contains("Hello"));
        assert!(!result.is_redirect());
    }

    #[tokio::test]
    async fn test_fetch_does_not_follow_redirects() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new#frag"))
            .mount(&mock_server)
            .await;

        let fetcher = PageFetcher::new().unwrap();
        let result = fetcher
            .fetch(&format!("{}/old", mock_server.uri()))
            .await
            .unwrap();

        assert_eq!(result.status_code, 301);
        assert!(result.is_redirect());
        assert_eq!(
            result.location,
            Some(format!("{}/new", mock_server.uri()))
        );
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url() {
        let fetcher = PageFetcher::new().unwrap();
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidUrl(_)));
    }
}
