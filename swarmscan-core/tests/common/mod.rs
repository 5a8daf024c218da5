// Fake collaborators shared by the engine and distribution tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarmscan_core::distributed::{Handler, LocalConnector};
use swarmscan_core::model::IssueKind;
use swarmscan_core::{
    Checker, Element, ElementKind, ExplorationJob, Explorer, Fetchable, Fetcher, Fingerprint,
    Instance, Issue, PageCallback, PageData, ScanOptions, Severity, Status,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub const ROOT: &str = "http://site.test/";

pub fn shared_form() -> Element {
    Element::new(ElementKind::Form, "http://site.test/search", "GET", &[("q", "")])
}

pub fn own_form(url: &str) -> Element {
    Element::new(ElementKind::Form, url, "POST", &[("id", ""), ("comment", "")])
}

/// A root page linking to one page per name. Every page carries the same
/// search form plus a form of its own.
pub fn site(children: &[&str]) -> HashMap<String, PageData> {
    let mut pages = HashMap::new();
    let links: Vec<String> = children
        .iter()
        .map(|name| format!("{}{}", ROOT, name))
        .collect();

    for url in links.iter().map(String::as_str).chain([ROOT]) {
        let page = PageData::new(url).with_elements(vec![shared_form(), own_form(url)]);
        pages.insert(url.to_string(), page);
    }
    if let Some(root) = pages.get_mut(ROOT) {
        root.links = links;
    }
    pages
}

/// Distinct elements `site(children)` exposes.
pub fn element_count(children: &[&str]) -> usize {
    children.len() + 2
}

/// Serves a fixed set of pages and redirects; anything else fails. An
/// optional gate holds every fetch until a permit is available.
pub struct SiteFetcher {
    pages: HashMap<String, PageData>,
    redirects: HashMap<String, String>,
    attempts: Mutex<HashMap<String, usize>>,
    gate: Option<Arc<Semaphore>>,
}

impl SiteFetcher {
    pub fn new(pages: HashMap<String, PageData>) -> Self {
        Self {
            pages,
            redirects: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            gate: None,
        }
    }

    pub fn with_redirect(mut self, from: &str, to: &str) -> Self {
        self.redirects.insert(from.to_string(), to.to_string());
        self
    }

    pub fn gated(pages: HashMap<String, PageData>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(pages)
        }
    }

    pub fn attempts(&self, url: &str) -> usize {
        self.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for SiteFetcher {
    async fn fetch(&self, url: &str) -> Fetchable {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        if let Some(target) = self.redirects.get(url) {
            return Fetchable::RedirectTarget(target.clone());
        }
        match self.pages.get(url) {
            Some(page) => Fetchable::Page(page.clone()),
            None => Fetchable::Failure(format!("no route to {}", url)),
        }
    }
}

/// Records every audited element and reports one issue per element.
#[derive(Default)]
pub struct RecordingChecker {
    audited: Mutex<Vec<Fingerprint>>,
}

impl RecordingChecker {
    pub fn audited(&self) -> Vec<Fingerprint> {
        self.audited.lock().unwrap().clone()
    }

    pub fn assert_audited_once(&self, expected: usize) {
        let audited = self.audited();
        let mut distinct = audited.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), audited.len(), "an element was audited twice");
        assert_eq!(audited.len(), expected);
    }
}

#[async_trait]
impl Checker for RecordingChecker {
    async fn check(&self, page: &PageData, elements: &[Element]) -> anyhow::Result<Vec<Issue>> {
        let fingerprints: Vec<Fingerprint> = elements.iter().map(Element::fingerprint).collect();
        self.audited.lock().unwrap().extend(&fingerprints);

        Ok(fingerprints
            .into_iter()
            .map(|fingerprint| Issue {
                kind: IssueKind::InjectionPoint,
                severity: Severity::Info,
                title: format!("finding {}", fingerprint),
                description: String::new(),
                url: page.url.clone(),
                element: Some(fingerprint),
                remediation: None,
                evidence: None,
                cwe_id: None,
            })
            .collect())
    }
}

/// Audits like [`RecordingChecker`], then never returns for the page at `hold`.
pub struct HoldingChecker {
    pub inner: RecordingChecker,
    hold: String,
}

impl HoldingChecker {
    pub fn new(hold: &str) -> Self {
        Self {
            inner: RecordingChecker::default(),
            hold: hold.to_string(),
        }
    }
}

#[async_trait]
impl Checker for HoldingChecker {
    async fn check(&self, page: &PageData, elements: &[Element]) -> anyhow::Result<Vec<Issue>> {
        let issues = self.inner.check(page, elements).await?;
        if page.url == self.hold {
            std::future::pending::<()>().await;
        }
        Ok(issues)
    }
}

/// Delivers `found` once, `delay` after the page at `trigger` was explored.
pub struct DelayedExplorer {
    trigger: String,
    found: PageData,
    delay: Duration,
    fired: AtomicBool,
    pending: Arc<AtomicUsize>,
}

impl DelayedExplorer {
    pub fn new(trigger: &str, found: PageData, delay: Duration) -> Self {
        Self {
            trigger: trigger.to_string(),
            found,
            delay,
            fired: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Explorer for DelayedExplorer {
    async fn explore(&self, job: ExplorationJob, callback: PageCallback) -> anyhow::Result<()> {
        if job.page.url != self.trigger || self.fired.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.clone();
        let found = self.found.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(found);
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

/// A page only the explorer knows about, carrying one form of its own.
pub fn dom_page() -> PageData {
    let url = "http://site.test/dom";
    PageData::new(url).with_elements(vec![Element::new(
        ElementKind::Form,
        url,
        "POST",
        &[("dom_only", "")],
    )])
}

pub fn options(seeds: &[&str]) -> ScanOptions {
    let mut options = ScanOptions::default();
    options.seeds = seeds.iter().map(|s| s.to_string()).collect();
    options.poll_interval_ms = 10;
    options
}

pub async fn register(connector: &LocalConnector, instance: &Arc<Instance>) {
    let handler: Arc<dyn Handler> = instance.clone();
    connector.register(&instance.info().url, &handler).await;
}

pub async fn finish(handle: JoinHandle<swarmscan_core::Result<Status>>) -> Status {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("scan did not finish in time")
        .unwrap()
        .unwrap()
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
