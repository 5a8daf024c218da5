//! The scan context: every piece of cross-cutting state behind one lock.

use crate::config::ScanOptions;
use crate::distributed::{ParticipantSet, Role};
use crate::error::Result;
use crate::filter::{DedupFilter, PageAdmission};
use crate::model::{ElementId, Fingerprint, Issue, IssueSummary, PageArena, PageData, PageId};
use crate::queue::{QueuedUrl, WorkQueues};
use crate::snapshot::{SNAPSHOT_VERSION, Snapshot};
use crate::stats::{Counters, Statistics};
use chrono::Utc;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// How a push treats the filter and the page limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOptions {
    /// Skip scope, seen and redundancy checks.
    pub force: bool,
    /// Accept even once the page limit is reached.
    pub bypass_limit: bool,
}

impl PushOptions {
    pub const DEFAULT: Self = Self {
        force: false,
        bypass_limit: false,
    };
    pub const FORCE: Self = Self {
        force: true,
        bypass_limit: false,
    };
    /// Administrative delivery, used for chunks handed out by a master.
    pub const ADMIN: Self = Self {
        force: true,
        bypass_limit: true,
    };
}

/// An element selected for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementRef {
    pub page: PageId,
    pub element: ElementId,
    pub fingerprint: Fingerprint,
}

pub struct Shared {
    pub(crate) options: ScanOptions,
    pub(crate) filter: DedupFilter,
    pub(crate) queues: WorkQueues,
    pub(crate) arena: PageArena,
    pub(crate) counters: Counters,
    pub(crate) issues: Vec<Issue>,
    issue_digests: HashSet<u64>,
    pub(crate) summaries: Vec<IssueSummary>,
    errors: Vec<String>,
    pub(crate) participants: ParticipantSet,
    pub(crate) role: Role,
}

impl Shared {
    fn new(options: ScanOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            filter: DedupFilter::new(&options.scope, &options.audit, &options.dedup)?,
            queues: WorkQueues::new(options.queue.clone()),
            arena: PageArena::new(),
            counters: Counters::default(),
            issues: Vec::new(),
            issue_digests: HashSet::new(),
            summaries: Vec::new(),
            errors: Vec::new(),
            participants: ParticipantSet::default(),
            role: Role::Solo,
            options,
        })
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Replace the configuration of a scan that has not started yet.
    pub(crate) fn apply_options(&mut self, options: ScanOptions) -> Result<()> {
        options.validate()?;
        self.filter = DedupFilter::new(&options.scope, &options.audit, &options.dedup)?;
        self.queues = WorkQueues::new(options.queue.clone());
        self.options = options;
        Ok(())
    }

    pub fn page_limit_reached(&self) -> bool {
        self.options.scope.page_limit.is_some_and(|limit| {
            self.counters.pages_audited + self.counters.pages_dispatched >= limit
        })
    }

    pub fn push_url(&mut self, url: &str, options: PushOptions) -> bool {
        self.push_url_at(url, 0, options)
    }

    pub fn push_url_at(&mut self, url: &str, depth: usize, options: PushOptions) -> bool {
        if !options.bypass_limit && self.page_limit_reached() {
            return false;
        }
        match self.filter.admit_url(url, depth, options.force) {
            Some(url) => {
                self.queues.push_url(QueuedUrl { url, depth });
                true
            }
            None => false,
        }
    }

    pub fn push_page(&mut self, page: PageData, options: PushOptions) -> bool {
        if !options.bypass_limit && self.page_limit_reached() {
            return false;
        }
        match self.filter.admit_page(&page, options.force) {
            PageAdmission::Accepted(new_elements) => {
                self.counters.elements_seen += new_elements.len();
                let id = self.arena.insert(page);
                self.queues.push_page(id);
                true
            }
            PageAdmission::Rejected => false,
        }
    }

    /// Auditable elements of `pages` that were never claimed before. Every
    /// returned element is claimed on the spot.
    pub fn filter_elements(&mut self, pages: &[PageId]) -> Vec<ElementRef> {
        let mut selected = Vec::new();
        for &page in pages {
            for (element, entry) in self.arena.elements_of(page) {
                if !self.filter.is_auditable(entry.element.kind) {
                    continue;
                }
                if self.filter.claim(&entry.fingerprint) {
                    selected.push(ElementRef {
                        page,
                        element,
                        fingerprint: entry.fingerprint,
                    });
                }
            }
        }
        selected
    }

    /// Drain the queued pages a master may split, within the remaining page
    /// budget. Pages already carrying a whitelist stay queued. The links of
    /// taken pages are queued here since their whitelisted audits skip them.
    pub(crate) fn take_distributable_pages(&mut self) -> Vec<PageId> {
        let budget = self.options.scope.page_limit.map(|limit| {
            limit.saturating_sub(self.counters.pages_audited + self.counters.pages_dispatched)
        });

        let mut taken = Vec::new();
        for id in self.queues.take_pages() {
            let assigned = self
                .arena
                .page(id)
                .is_some_and(|page| page.whitelist.is_some());
            if assigned || budget.is_some_and(|budget| taken.len() >= budget) {
                self.queues.push_page(id);
            } else {
                taken.push(id);
            }
        }

        for &id in &taken {
            let Some((links, depth)) = self.arena.page(id).map(|p| (p.links.clone(), p.depth)) else {
                continue;
            };
            for link in links {
                self.push_url_at(&link, depth + 1, PushOptions::DEFAULT);
            }
        }
        taken
    }

    /// Mark fingerprints on behalf of a participant, returning the unseen ones.
    pub fn claim_elements(&mut self, fingerprints: &[Fingerprint]) -> Vec<Fingerprint> {
        fingerprints
            .iter()
            .copied()
            .filter(|fingerprint| self.filter.claim(fingerprint))
            .collect()
    }

    /// Store an issue unless the same finding is already known.
    pub fn record_issue(&mut self, issue: Issue) -> Option<IssueSummary> {
        let summary = issue.summary();
        if !self.issue_digests.insert(summary.digest) {
            return None;
        }
        self.issues.push(issue);
        Some(summary)
    }

    pub fn record_summary(&mut self, summary: IssueSummary) {
        self.summaries.push(summary);
    }

    pub fn record_error(&mut self, message: &str) {
        self.errors
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), message));
    }

    pub fn errors_since(&self, index: usize) -> Vec<String> {
        self.errors.iter().skip(index).cloned().collect()
    }

    pub fn statistics(&self, runtime: Duration) -> Statistics {
        Statistics::from_counters(&self.counters, self.filter.urls_seen(), runtime)
    }

    pub fn has_queued_work(&self) -> bool {
        !self.queues.is_empty()
    }

    pub fn snapshot(&self, scan_id: &str) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            scan_id: scan_id.to_string(),
            created_at: Utc::now(),
            options: self.options.clone(),
            url_queue: self.queues.queued_urls(),
            page_queue: self
                .queues
                .queued_pages()
                .into_iter()
                .filter_map(|id| self.arena.to_data(id))
                .collect(),
            failures: self.queues.failures().to_vec(),
            tries: self.queues.tries(),
            seen: self.filter.seen_sets(),
            element_filter: self.filter.audited_state(),
            redundancy: self.filter.redundancy_state(),
            counters: self.counters.clone(),
            issues: self.issues.clone(),
            errors: self.errors.clone(),
        }
    }

    /// Rebuild queues, seen-sets and the element filter from a snapshot.
    pub(crate) fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        let Snapshot {
            options,
            url_queue,
            page_queue,
            failures,
            tries,
            seen,
            element_filter,
            redundancy,
            counters,
            issues,
            errors,
            ..
        } = snapshot;

        self.apply_options(options)?;
        self.filter.restore(&seen, &element_filter, &redundancy);
        self.queues.restore(url_queue, &tries, failures);
        self.arena = PageArena::new();
        for page in page_queue {
            let id = self.arena.insert(page);
            self.queues.push_page(id);
        }
        self.counters = counters;
        self.issue_digests = issues.iter().map(Issue::digest).collect();
        self.issues = issues;
        self.errors = errors;
        Ok(())
    }
}

pub struct ScanContext {
    shared: Mutex<Shared>,
    started: Instant,
}

impl ScanContext {
    pub fn new(options: ScanOptions) -> Result<Self> {
        Ok(Self {
            shared: Mutex::new(Shared::new(options)?),
            started: Instant::now(),
        })
    }

    /// Load a snapshot into a context nobody else holds yet.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        self.shared.get_mut().restore(snapshot)
    }

    /// Run `f` under the lock. Keeps critical sections free of `.await`.
    pub async fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut shared = self.shared.lock().await;
        f(&mut shared)
    }

    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    pub async fn statistics(&self) -> Statistics {
        let runtime = self.runtime();
        self.with(|s| s.statistics(runtime)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, ElementKind};

    fn shared(options: ScanOptions) -> Shared {
        Shared::new(options).unwrap()
    }

    #[test]
    fn test_push_url_is_idempotent() {
        let mut s = shared(ScanOptions::default());
        assert!(s.push_url("http://example.com/", PushOptions::DEFAULT));
        assert!(!s.push_url("http://example.com/", PushOptions::DEFAULT));
        assert!(!s.push_url("http://example.com/#top", PushOptions::DEFAULT));
        assert_eq!(s.queues.url_len(), 1);
    }

    #[test]
    fn test_page_limit_rejects_forced_but_not_admin_pushes() {
        let mut options = ScanOptions::default();
        options.scope.page_limit = Some(1);
        let mut s = shared(options);
        s.counters.pages_audited = 1;

        assert!(!s.push_url("http://example.com/a", PushOptions::FORCE));
        assert!(!s.push_page(PageData::new("http://example.com/b"), PushOptions::FORCE));
        assert!(s.push_page(PageData::new("http://example.com/c"), PushOptions::ADMIN));
    }

    #[test]
    fn test_filter_elements_only_returns_unseen_enabled_kinds() {
        let mut s = shared(ScanOptions::default());
        let form = Element::new(ElementKind::Form, "http://example.com/s", "GET", &[("q", "")]);
        let header = Element::new(ElementKind::Header, "http://example.com/", "GET", &[("X-Test", "")]);

        s.push_page(
            PageData::new("http://example.com/a").with_elements(vec![form.clone(), header]),
            PushOptions::DEFAULT,
        );
        s.push_page(
            PageData::new("http://example.com/b").with_elements(vec![form.clone()]),
            PushOptions::DEFAULT,
        );
        let pages = s.queues.take_pages();

        let selected = s.filter_elements(&pages);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].fingerprint, form.fingerprint());
        assert!(s.filter_elements(&pages).is_empty());
    }

    #[test]
    fn test_duplicate_issues_are_dropped() {
        let mut s = shared(ScanOptions::default());
        let issue = Issue {
            kind: crate::model::IssueKind::Misconfiguration,
            severity: crate::model::Severity::Low,
            title: "Missing header".to_string(),
            description: String::new(),
            url: "http://example.com/".to_string(),
            element: None,
            remediation: None,
            evidence: None,
            cwe_id: None,
        };
        assert!(s.record_issue(issue.clone()).is_some());
        assert!(s.record_issue(issue).is_none());
        assert_eq!(s.issues.len(), 1);
    }

    #[test]
    fn test_errors_since_index() {
        let mut s = shared(ScanOptions::default());
        s.record_error("first");
        s.record_error("second");
        let errors = s.errors_since(1);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("second"));
    }
}
