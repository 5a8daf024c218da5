use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use swarmscan_scanner::{ExtractedElement, ExtractedKind, Extraction, FetchResult};

pub type PageId = usize;
pub type ElementId = usize;

/// Stable identifier of an element's audit-relevant shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hash that stays identical across processes and builds, unlike `DefaultHasher`.
pub(crate) fn stable_hash<'a>(parts: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementKind {
    Link,
    Form,
    Cookie,
    Header,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Link => "link",
            ElementKind::Form => "form",
            ElementKind::Cookie => "cookie",
            ElementKind::Header => "header",
        }
    }
}

impl From<ExtractedKind> for ElementKind {
    fn from(kind: ExtractedKind) -> Self {
        match kind {
            ExtractedKind::Link => ElementKind::Link,
            ExtractedKind::Form => ElementKind::Form,
            ExtractedKind::Cookie => ElementKind::Cookie,
            ExtractedKind::Header => ElementKind::Header,
        }
    }
}

/// A mutable input surface of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub kind: ElementKind,
    pub action: String,
    pub method: String,
    pub inputs: Vec<(String, String)>,
}

impl Element {
    pub fn new(kind: ElementKind, action: &str, method: &str, inputs: &[(&str, &str)]) -> Self {
        Self {
            kind,
            action: action.to_string(),
            method: method.to_ascii_uppercase(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Hash of kind, action, method and sorted input names. Values are
    /// ignored so seeded or injected values never create a new identity.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut names: Vec<&str> = self.inputs.iter().map(|(name, _)| name.as_str()).collect();
        names.sort_unstable();
        names.dedup();

        let method = self.method.to_ascii_uppercase();
        let head = [self.kind.as_str(), self.action.as_str(), method.as_str()];
        Fingerprint(stable_hash(head.into_iter().chain(names)))
    }
}

impl From<ExtractedElement> for Element {
    fn from(element: ExtractedElement) -> Self {
        Self {
            kind: element.kind.into(),
            action: element.action,
            method: element.method.to_ascii_uppercase(),
            inputs: element.inputs,
        }
    }
}

/// Self-contained page as it travels between queues, collaborators and
/// participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageData {
    pub url: String,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub depth: usize,
    pub links: Vec<String>,
    pub elements: Vec<Element>,
    /// When set, only these elements are audited; the rest stay on the page
    /// for passive inspection.
    pub whitelist: Option<Vec<Fingerprint>>,
}

impl PageData {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status_code: 200,
            headers: Vec::new(),
            body: String::new(),
            depth: 0,
            links: Vec::new(),
            elements: Vec::new(),
            whitelist: None,
        }
    }

    pub fn from_fetch(result: FetchResult, extraction: Extraction) -> Self {
        Self {
            url: result.url,
            status_code: result.status_code,
            headers: result.headers,
            body: result.body,
            depth: 0,
            links: extraction.links,
            elements: extraction.elements.into_iter().map(Element::from).collect(),
            whitelist: None,
        }
    }

    pub fn with_elements(mut self, elements: Vec<Element>) -> Self {
        self.elements = elements;
        self
    }

    pub fn with_links(mut self, links: Vec<String>) -> Self {
        self.links = links;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn element_fingerprints(&self) -> Vec<Fingerprint> {
        self.elements.iter().map(Element::fingerprint).collect()
    }

    /// Number of elements this page hands to the checker.
    pub fn audit_element_count(&self) -> usize {
        match &self.whitelist {
            Some(whitelist) => whitelist.len(),
            None => self.elements.len(),
        }
    }
}

/// Arena-resident page. Elements are referenced by index.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    /// `None` once the page has been audited and its cache cleared.
    pub body: Option<String>,
    pub depth: usize,
    pub links: Vec<String>,
    pub elements: Vec<ElementId>,
    pub whitelist: Option<HashSet<Fingerprint>>,
}

#[derive(Debug, Clone)]
pub struct ArenaElement {
    pub element: Element,
    pub fingerprint: Fingerprint,
    pub page: PageId,
}

/// Flat storage for pages and their elements.
#[derive(Debug, Default)]
pub struct PageArena {
    pages: Vec<Page>,
    elements: Vec<ArenaElement>,
}

impl PageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: PageData) -> PageId {
        let id = self.pages.len();
        let mut element_ids = Vec::with_capacity(data.elements.len());
        for element in data.elements {
            element_ids.push(self.elements.len());
            self.elements.push(ArenaElement {
                fingerprint: element.fingerprint(),
                element,
                page: id,
            });
        }

        self.pages.push(Page {
            url: data.url,
            status_code: data.status_code,
            headers: data.headers,
            body: Some(data.body),
            depth: data.depth,
            links: data.links,
            elements: element_ids,
            whitelist: data.whitelist.map(|w| w.into_iter().collect()),
        });
        id
    }

    pub fn page(&self, id: PageId) -> Option<&Page> {
        self.pages.get(id)
    }

    pub fn element(&self, id: ElementId) -> Option<&ArenaElement> {
        self.elements.get(id)
    }

    pub fn elements_of(&self, id: PageId) -> impl Iterator<Item = (ElementId, &ArenaElement)> + '_ {
        self.pages
            .get(id)
            .into_iter()
            .flat_map(|page| page.elements.iter())
            .filter_map(|&eid| self.elements.get(eid).map(|e| (eid, e)))
    }

    /// Rebuild the owned form of a page. Cleared pages come back without body.
    pub fn to_data(&self, id: PageId) -> Option<PageData> {
        let page = self.pages.get(id)?;
        let mut whitelist: Option<Vec<Fingerprint>> =
            page.whitelist.as_ref().map(|w| w.iter().copied().collect());
        if let Some(whitelist) = whitelist.as_mut() {
            whitelist.sort_unstable();
        }

        Some(PageData {
            url: page.url.clone(),
            status_code: page.status_code,
            headers: page.headers.clone(),
            body: page.body.clone().unwrap_or_default(),
            depth: page.depth,
            links: page.links.clone(),
            elements: self
                .elements_of(id)
                .map(|(_, e)| e.element.clone())
                .collect(),
            whitelist,
        })
    }

    /// Drop the parsed/response data of an audited page, keeping its identity.
    /// Its elements keep kind, action, method and fingerprint; inputs go.
    pub fn clear_cache(&mut self, id: PageId) {
        let Some(page) = self.pages.get_mut(id) else {
            return;
        };
        page.body = None;
        page.headers = Vec::new();
        page.links = Vec::new();
        for &eid in &page.elements {
            if let Some(entry) = self.elements.get_mut(eid) {
                entry.element.inputs = Vec::new();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// What a fetch can resolve into.
#[derive(Debug, Clone)]
pub enum Fetchable {
    Page(PageData),
    RedirectTarget(String),
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    Vulnerability,
    Misconfiguration,
    InformationDisclosure,
    InterestingFile,
    SecurityHeaderMissing,
    InsecureTransport,
    InjectionPoint,
    Other,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Vulnerability => "vulnerability",
            IssueKind::Misconfiguration => "misconfiguration",
            IssueKind::InformationDisclosure => "information_disclosure",
            IssueKind::InterestingFile => "interesting_file",
            IssueKind::SecurityHeaderMissing => "security_header_missing",
            IssueKind::InsecureTransport => "insecure_transport",
            IssueKind::InjectionPoint => "injection_point",
            IssueKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub url: String,
    pub element: Option<Fingerprint>,
    pub remediation: Option<String>,
    pub evidence: Option<String>,
    pub cwe_id: Option<String>,
}

impl Issue {
    /// Identity used to drop the same finding reported twice.
    pub fn digest(&self) -> u64 {
        let element = self.element.map(|f| f.to_string()).unwrap_or_default();
        stable_hash([
            self.kind.as_str(),
            self.title.as_str(),
            self.url.as_str(),
            element.as_str(),
        ])
    }

    pub fn summary(&self) -> IssueSummary {
        IssueSummary {
            digest: self.digest(),
            severity: self.severity,
            title: self.title.clone(),
            url: self.url.clone(),
        }
    }
}

/// Lightweight form of an issue sent upstream immediately for live progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub digest: u64,
    pub severity: Severity,
    pub title: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_values_and_order() {
        let a = Element::new(
            ElementKind::Form,
            "http://example.com/login",
            "post",
            &[("user", "alice"), ("pass", "secret")],
        );
        let b = Element::new(
            ElementKind::Form,
            "http://example.com/login",
            "POST",
            &[("pass", "<script>"), ("user", "")],
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_shape() {
        let form = Element::new(ElementKind::Form, "http://example.com/a", "GET", &[("q", "")]);
        let link = Element::new(ElementKind::Link, "http://example.com/a", "GET", &[("q", "")]);
        let other = Element::new(ElementKind::Form, "http://example.com/a", "GET", &[("id", "")]);
        assert_ne!(form.fingerprint(), link.fingerprint());
        assert_ne!(form.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_arena_indexes_elements_by_owner() {
        let mut arena = PageArena::new();
        let page = PageData::new("http://example.com/").with_elements(vec![
            Element::new(ElementKind::Link, "http://example.com/", "GET", &[("a", "1")]),
            Element::new(ElementKind::Form, "http://example.com/f", "POST", &[("b", "")]),
        ]);
        let id = arena.insert(page.clone());

        let owned: Vec<_> = arena.elements_of(id).collect();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|(_, e)| e.page == id));
        assert_eq!(arena.to_data(id), Some(page));
    }

    #[test]
    fn test_clear_cache_keeps_identity() {
        let mut arena = PageArena::new();
        let mut page = PageData::new("http://example.com/x");
        page.body = "<html></html>".to_string();
        page.elements = vec![Element::new(ElementKind::Cookie, "http://example.com/x", "GET", &[("s", "1")])];
        let id = arena.insert(page);

        arena.clear_cache(id);

        let page = arena.page(id).unwrap();
        assert_eq!(page.url, "http://example.com/x");
        assert!(page.body.is_none());
        assert_eq!(page.elements.len(), 1);
    }

    #[test]
    fn test_clear_cache_drops_element_inputs() {
        let mut arena = PageArena::new();
        let form = Element::new(
            ElementKind::Form,
            "http://example.com/login",
            "POST",
            &[("user", "admin"), ("pass", "hunter2")],
        );
        let id = arena.insert(PageData::new("http://example.com/").with_elements(vec![form.clone()]));

        arena.clear_cache(id);

        let (_, entry) = arena.elements_of(id).next().unwrap();
        assert!(entry.element.inputs.is_empty());
        assert_eq!(entry.element.kind, ElementKind::Form);
        assert_eq!(entry.fingerprint, form.fingerprint());
    }

    #[test]
    fn test_issue_summary_carries_digest() {
        let issue = Issue {
            kind: IssueKind::InsecureTransport,
            severity: Severity::Medium,
            title: "Insecure Transport (HTTP)".to_string(),
            description: String::new(),
            url: "http://example.com/".to_string(),
            element: None,
            remediation: None,
            evidence: None,
            cwe_id: Some("CWE-319".to_string()),
        };
        let summary = issue.summary();
        assert_eq!(summary.digest, issue.digest());
        assert_eq!(summary.severity, Severity::Medium);
    }
}
