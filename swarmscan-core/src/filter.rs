//! Scope, redundancy and deduplication filters.
//!
//! Everything that enters a queue or reaches the checker passes through
//! [`DedupFilter`]. URLs and pages are tracked in exact seen-sets; audited
//! element fingerprints live in a bloom filter ([`ElementFilter`]) whose false
//! positive rate is configurable.

use crate::config::{AuditOptions, DedupOptions, ScopeOptions};
use crate::error::Result;
use crate::model::{ElementKind, Fingerprint, PageData, stable_hash};
use bloomfilter::Bloom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;
use url::Url;

/// Parse a URL and return it without fragment, plus its dedup key.
///
/// The key additionally sorts query pairs so parameter order does not create
/// distinct targets.
pub fn normalize_url(url: &str) -> Option<(Url, String)> {
    let mut parsed = Url::parse(url).ok()?;
    parsed.set_fragment(None);

    let mut key = parsed.clone();
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        key.set_query(None);
    } else {
        pairs.sort();
        key.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Some((parsed, key.to_string()))
}

pub struct Scope {
    domain: Option<String>,
    include_subdomains: bool,
    exclude: Vec<Regex>,
    max_depth: Option<usize>,
}

impl Scope {
    pub fn new(options: &ScopeOptions) -> Result<Self> {
        let exclude = options
            .exclude
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            domain: options.domain.as_ref().map(|d| d.to_ascii_lowercase()),
            include_subdomains: options.include_subdomains,
            exclude,
            max_depth: options.max_depth,
        })
    }

    pub fn in_scope(&self, url: &Url, depth: usize) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }

        if let Some(max_depth) = self.max_depth
            && depth > max_depth
        {
            return false;
        }

        if let Some(ref domain) = self.domain {
            let Some(host) = url.host_str() else {
                return false;
            };
            let same = host == domain
                || (self.include_subdomains && host.ends_with(&format!(".{}", domain)));
            if !same {
                return false;
            }
        }

        !self.exclude.iter().any(|re| re.is_match(url.as_str()))
    }
}

/// Counters behind the redundancy rules, persisted in snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedundancyState {
    pub remaining: Vec<usize>,
    pub auto_counts: BTreeMap<String, usize>,
}

pub struct Redundancy {
    rules: Vec<(Regex, usize)>,
    auto_limit: Option<usize>,
    auto_counts: HashMap<String, usize>,
}

impl Redundancy {
    pub fn new(options: &ScopeOptions) -> Result<Self> {
        let rules = options
            .redundant
            .iter()
            .map(|rule| -> Result<(Regex, usize)> { Ok((Regex::new(&rule.pattern)?, rule.count)) })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            auto_limit: options.auto_redundant,
            auto_counts: HashMap::new(),
        })
    }

    /// Consumes one slot of every matching rule; redundant once any is spent.
    pub fn is_redundant(&mut self, url: &Url) -> bool {
        let mut redundant = false;
        for (pattern, remaining) in self.rules.iter_mut() {
            if pattern.is_match(url.as_str()) {
                if *remaining == 0 {
                    redundant = true;
                } else {
                    *remaining -= 1;
                }
            }
        }

        if let Some(limit) = self.auto_limit {
            let mut names: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
            names.sort();
            let key = format!("{}{}?{}", url.host_str().unwrap_or(""), url.path(), names.join("&"));
            let count = self.auto_counts.entry(key).or_insert(0);
            if *count >= limit {
                redundant = true;
            } else {
                *count += 1;
            }
        }

        redundant
    }

    pub fn state(&self) -> RedundancyState {
        RedundancyState {
            remaining: self.rules.iter().map(|(_, r)| *r).collect(),
            auto_counts: self
                .auto_counts
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    pub fn restore(&mut self, state: &RedundancyState) {
        for ((_, remaining), saved) in self.rules.iter_mut().zip(&state.remaining) {
            *remaining = *saved;
        }
        self.auto_counts = state
            .auto_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
    }
}

/// Bit-exact serialized form of an [`ElementFilter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub bitmap: Vec<u8>,
    pub bits: u64,
    pub hashes: u32,
    pub sip_keys: [(u64, u64); 2],
    pub inserted: usize,
}

/// Probabilistic set of element fingerprints.
pub struct ElementFilter {
    bloom: Bloom<Fingerprint>,
    inserted: usize,
}

impl ElementFilter {
    pub fn new(options: &DedupOptions) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(options.expected_elements, options.false_positive_rate),
            inserted: 0,
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.bloom.check(fingerprint)
    }

    /// Mark as seen; returns whether it had been seen before.
    pub fn check_and_set(&mut self, fingerprint: &Fingerprint) -> bool {
        let seen = self.bloom.check_and_set(fingerprint);
        if !seen {
            self.inserted += 1;
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    pub fn state(&self) -> FilterState {
        FilterState {
            bitmap: self.bloom.bitmap(),
            bits: self.bloom.number_of_bits(),
            hashes: self.bloom.number_of_hash_functions(),
            sip_keys: self.bloom.sip_keys(),
            inserted: self.inserted,
        }
    }

    pub fn from_state(state: &FilterState) -> Self {
        Self {
            bloom: Bloom::from_existing(&state.bitmap, state.bits, state.hashes, state.sip_keys),
            inserted: state.inserted,
        }
    }
}

/// Result of offering a page to the filter.
#[derive(Debug, Clone, PartialEq)]
pub enum PageAdmission {
    Rejected,
    /// Accepted; carries the fingerprints the seen-element index did not know.
    Accepted(Vec<Fingerprint>),
}

/// Seen-sets captured by a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeenSets {
    pub urls: BTreeSet<String>,
    pub pages: BTreeSet<u64>,
    pub elements: BTreeSet<Fingerprint>,
}

pub struct DedupFilter {
    scope: Scope,
    redundancy: Redundancy,
    audit: AuditOptions,
    seen_urls: HashSet<String>,
    seen_pages: HashSet<u64>,
    known_elements: HashSet<Fingerprint>,
    audited: ElementFilter,
}

impl DedupFilter {
    pub fn new(scope: &ScopeOptions, audit: &AuditOptions, dedup: &DedupOptions) -> Result<Self> {
        Ok(Self {
            scope: Scope::new(scope)?,
            redundancy: Redundancy::new(scope)?,
            audit: audit.clone(),
            seen_urls: HashSet::new(),
            seen_pages: HashSet::new(),
            known_elements: HashSet::new(),
            audited: ElementFilter::new(dedup),
        })
    }

    /// Admit a URL, returning the form to enqueue. Forced URLs skip scope,
    /// seen and redundancy checks but are still marked seen.
    pub fn admit_url(&mut self, url: &str, depth: usize, force: bool) -> Option<String> {
        let (parsed, key) = normalize_url(url)?;

        if !force {
            if self.seen_urls.contains(&key) {
                return None;
            }
            if !self.scope.in_scope(&parsed, depth) {
                debug!("Out of scope: {}", url);
                return None;
            }
            if self.redundancy.is_redundant(&parsed) {
                debug!("Redundant: {}", url);
                return None;
            }
        }

        self.seen_urls.insert(key);
        Some(parsed.to_string())
    }

    /// Admit a page and merge its elements into the seen-element index.
    ///
    /// Redundancy only applies when the page's URL was not already admitted
    /// through [`admit_url`](Self::admit_url), so a fetched URL is never
    /// counted twice.
    pub fn admit_page(&mut self, page: &PageData, force: bool) -> PageAdmission {
        let Some((parsed, url_key)) = normalize_url(&page.url) else {
            return PageAdmission::Rejected;
        };
        let page_key = page_key(&url_key, page);

        if !force {
            if self.seen_pages.contains(&page_key) {
                return PageAdmission::Rejected;
            }
            if !self.scope.in_scope(&parsed, page.depth) {
                debug!("Page out of scope: {}", page.url);
                return PageAdmission::Rejected;
            }
            if !self.seen_urls.contains(&url_key) && self.redundancy.is_redundant(&parsed) {
                debug!("Redundant page: {}", page.url);
                return PageAdmission::Rejected;
            }
        }

        self.seen_pages.insert(page_key);
        self.seen_urls.insert(url_key);
        let new_elements = page
            .element_fingerprints()
            .into_iter()
            .filter(|f| self.known_elements.insert(*f))
            .collect();

        PageAdmission::Accepted(new_elements)
    }

    pub fn is_auditable(&self, kind: ElementKind) -> bool {
        match kind {
            ElementKind::Link => self.audit.links,
            ElementKind::Form => self.audit.forms,
            ElementKind::Cookie => self.audit.cookies,
            ElementKind::Header => self.audit.headers,
        }
    }

    /// Claim a fingerprint for audit. True when it had not been claimed, or
    /// always when redundant audits are enabled.
    pub fn claim(&mut self, fingerprint: &Fingerprint) -> bool {
        let seen = self.audited.check_and_set(fingerprint);
        !seen || self.audit.redundant
    }

    /// Record fingerprints audited on behalf of someone else (chunk whitelists).
    pub fn mark_audited(&mut self, fingerprint: &Fingerprint) {
        self.audited.check_and_set(fingerprint);
    }

    pub fn urls_seen(&self) -> usize {
        self.seen_urls.len()
    }

    pub fn seen_sets(&self) -> SeenSets {
        SeenSets {
            urls: self.seen_urls.iter().cloned().collect(),
            pages: self.seen_pages.iter().copied().collect(),
            elements: self.known_elements.iter().copied().collect(),
        }
    }

    pub fn audited_state(&self) -> FilterState {
        self.audited.state()
    }

    pub fn redundancy_state(&self) -> RedundancyState {
        self.redundancy.state()
    }

    /// Reinstate seen-sets, counters and the audit filter from a snapshot.
    pub fn restore(&mut self, seen: &SeenSets, audited: &FilterState, redundancy: &RedundancyState) {
        self.seen_urls = seen.urls.iter().cloned().collect();
        self.seen_pages = seen.pages.iter().copied().collect();
        self.known_elements = seen.elements.iter().copied().collect();
        self.audited = ElementFilter::from_state(audited);
        self.redundancy.restore(redundancy);
    }
}

fn page_key(url_key: &str, page: &PageData) -> u64 {
    let mut fingerprints: Vec<String> = page
        .element_fingerprints()
        .iter()
        .map(|f| f.to_string())
        .collect();
    fingerprints.sort_unstable();
    fingerprints.dedup();
    stable_hash(std::iter::once(url_key).chain(fingerprints.iter().map(String::as_str)))
}
