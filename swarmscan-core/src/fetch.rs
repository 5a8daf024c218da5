use crate::collaborators::Fetcher;
use crate::config::HttpOptions;
use crate::error::Result;
use crate::model::{Fetchable, PageData};
use async_trait::async_trait;
use swarmscan_scanner::PageFetcher;
use swarmscan_scanner::extract::extract;
use tracing::debug;

/// Default [`Fetcher`]: one GET through reqwest, elements extracted with
/// scraper. Redirects are surfaced, never followed.
pub struct HttpFetcher {
    inner: PageFetcher,
}

impl HttpFetcher {
    pub fn new(options: &HttpOptions) -> Result<Self> {
        Ok(Self {
            inner: PageFetcher::with_options(options.timeout_secs, &options.user_agent)?,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Fetchable {
        let result = match self.inner.fetch(url).await {
            Ok(result) => result,
            Err(e) => return Fetchable::Failure(e.to_string()),
        };

        if result.is_redirect()
            && let Some(location) = result.location.clone()
        {
            return Fetchable::RedirectTarget(location);
        }

        match extract(&result) {
            Ok(extraction) => {
                debug!(
                    "{} -> {} links, {} elements",
                    url,
                    extraction.links.len(),
                    extraction.elements.len()
                );
                Fetchable::Page(PageData::from_fetch(result, extraction))
            }
            Err(e) => Fetchable::Failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ElementKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&HttpOptions {
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_html_page_resolves_to_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"<html><body><a href="/next">n</a>
                <form action="/login" method="post"><input name="user"><input name="pass"></form>
                </body></html>"#,
                "text/html",
            ))
            .mount(&server)
            .await;

        let url = format!("{}/", server.uri());
        let Fetchable::Page(page) = fetcher().fetch(&url).await else {
            panic!("expected a page");
        };
        assert_eq!(page.status_code, 200);
        assert!(page.links.contains(&format!("{}/next", server.uri())));
        assert!(page.elements.iter().any(|e| e.kind == ElementKind::Form));
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let fetched = fetcher().fetch(&format!("{}/old", server.uri())).await;
        match fetched {
            Fetchable::RedirectTarget(target) => assert_eq!(target, format!("{}/new", server.uri())),
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_error_is_failure() {
        let fetched = fetcher().fetch("http://127.0.0.1:1/").await;
        assert!(matches!(fetched, Fetchable::Failure(_)));
    }
}
