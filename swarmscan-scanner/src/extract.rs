// Element extraction: turns a fetched response into follow-up links and
// auditable input surfaces.

use crate::error::{Result, ScanError};
use crate::result::FetchResult;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExtractedKind {
    Link,
    Form,
    Cookie,
    Header,
}

/// An input surface as found in the response, values included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedElement {
    pub kind: ExtractedKind,
    pub action: String,
    pub method: String,
    pub inputs: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub links: Vec<String>,
    pub elements: Vec<ExtractedElement>,
    pub scripts: usize,
}

/// Extract links and elements from a response.
pub fn extract(result: &FetchResult) -> Result<Extraction> {
    let mut extraction = Extraction::default();

    if let Some(link) = link_element(&result.url) {
        extraction.elements.push(link);
    }
    extraction.elements.extend(cookie_elements(result));

    if result.is_html() {
        let (links, forms, scripts) = extract_html(&result.body, &result.url)?;
        for link in &links {
            if let Some(element) = link_element(link) {
                extraction.elements.push(element);
            }
        }
        extraction.links = links;
        extraction.elements.extend(forms);
        extraction.scripts = scripts;
    }

    Ok(extraction)
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| ScanError::ParseError(format!("{}: {}", css, e)))
}

fn extract_html(
    html: &str,
    current_url: &str,
) -> Result<(Vec<String>, Vec<ExtractedElement>, usize)> {
    let document = Html::parse_document(html);

    let link_selector = selector("a[href]")?;
    let mut links = Vec::new();
    for element in document.select(&link_selector) {
        if let Some(href) = element.value().attr("href")
            && let Some(absolute_url) = resolve_url(current_url, href)
            && !links.contains(&absolute_url)
        {
            debug!("Found link: {}", absolute_url);
            links.push(absolute_url);
        }
    }

    let form_selector = selector("form")?;
    let input_selector = selector("input[name], textarea[name], select[name], button[name]")?;
    let mut forms = Vec::new();
    for form in document.select(&form_selector) {
        let action = form
            .value()
            .attr("action")
            .and_then(|action| resolve_url(current_url, action))
            .unwrap_or_else(|| strip_query(current_url));
        let method = form
            .value()
            .attr("method")
            .unwrap_or("get")
            .to_ascii_uppercase();

        let inputs: Vec<(String, String)> = form
            .select(&input_selector)
            .filter_map(|input| {
                let value = input.value();
                value.attr("name").map(|name| {
                    (
                        name.to_string(),
                        value.attr("value").unwrap_or_default().to_string(),
                    )
                })
            })
            .collect();

        if inputs.is_empty() {
            continue;
        }

        forms.push(ExtractedElement {
            kind: ExtractedKind::Form,
            action,
            method,
            inputs,
        });
    }

    let script_selector = selector("script[src]")?;
    let scripts = document.select(&script_selector).count();

    Ok((links, forms, scripts))
}

/// A link element exists only for URLs that carry query parameters.
fn link_element(url: &str) -> Option<ExtractedElement> {
    let parsed = Url::parse(url).ok()?;
    let inputs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if inputs.is_empty() {
        return None;
    }

    Some(ExtractedElement {
        kind: ExtractedKind::Link,
        action: strip_query(url),
        method: "GET".to_string(),
        inputs,
    })
}

fn cookie_elements(result: &FetchResult) -> Vec<ExtractedElement> {
    result
        .headers_named("set-cookie")
        .filter_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(ExtractedElement {
                kind: ExtractedKind::Cookie,
                action: strip_query(&result.url),
                method: "GET".to_string(),
                inputs: vec![(name.to_string(), value.trim().to_string())],
            })
        })
        .collect()
}

pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    // Skip empty, javascript:, mailto:, tel:, etc.
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with('#')
    {
        return None;
    }

    let base_url = Url::parse(base).ok()?;
    let mut url = base_url.join(href).ok()?;
    url.set_fragment(None);

    Some(url.to_string())
}

fn strip_query(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}
