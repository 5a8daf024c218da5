//! URL and page queues plus the concurrent fetch pipeline that moves targets
//! from one to the other.

use crate::collaborators::Fetcher;
use crate::config::QueueOptions;
use crate::context::{PushOptions, ScanContext};
use crate::model::{Fetchable, PageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedUrl {
    pub url: String,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-enqueued for another attempt.
    Retry,
    /// Out of attempts; recorded as a permanent failure.
    Dropped,
}

pub struct WorkQueues {
    options: QueueOptions,
    urls: VecDeque<QueuedUrl>,
    pages: VecDeque<PageId>,
    tries: HashMap<String, u32>,
    failures: Vec<String>,
    failed: HashSet<String>,
}

impl WorkQueues {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            urls: VecDeque::new(),
            pages: VecDeque::new(),
            tries: HashMap::new(),
            failures: Vec::new(),
            failed: HashSet::new(),
        }
    }

    pub fn push_url(&mut self, target: QueuedUrl) {
        self.urls.push_back(target);
    }

    pub fn pop_url(&mut self) -> Option<QueuedUrl> {
        self.urls.pop_front()
    }

    pub fn push_page(&mut self, id: PageId) {
        self.pages.push_back(id);
    }

    pub fn pop_page(&mut self) -> Option<PageId> {
        self.pages.pop_front()
    }

    pub fn take_pages(&mut self) -> Vec<PageId> {
        self.pages.drain(..).collect()
    }

    pub fn url_len(&self) -> usize {
        self.urls.len()
    }

    pub fn page_len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.pages.is_empty()
    }

    /// How many URLs to start fetching now, given fetches already in flight.
    pub fn replenish_count(&self, in_flight: usize) -> usize {
        let buffered = self.pages.len() + in_flight;
        if buffered >= self.options.low_water_mark {
            return 0;
        }
        let free = self.options.page_queue_capacity.saturating_sub(buffered);
        self.options.replenish_batch.min(free).min(self.urls.len())
    }

    pub fn record_success(&mut self, url: &str) {
        self.tries.remove(url);
    }

    pub fn record_failure(&mut self, target: QueuedUrl) -> FailureOutcome {
        let tries = self.tries.entry(target.url.clone()).or_insert(0);
        *tries += 1;

        if *tries >= self.options.max_tries {
            self.tries.remove(&target.url);
            if self.failed.insert(target.url.clone()) {
                self.failures.push(target.url);
            }
            FailureOutcome::Dropped
        } else {
            self.urls.push_back(target);
            FailureOutcome::Retry
        }
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub(crate) fn queued_urls(&self) -> Vec<QueuedUrl> {
        self.urls.iter().cloned().collect()
    }

    pub(crate) fn queued_pages(&self) -> Vec<PageId> {
        self.pages.iter().copied().collect()
    }

    pub(crate) fn tries(&self) -> BTreeMap<String, u32> {
        self.tries.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub(crate) fn restore(
        &mut self,
        urls: Vec<QueuedUrl>,
        tries: &BTreeMap<String, u32>,
        failures: Vec<String>,
    ) {
        self.urls = urls.into();
        self.tries = tries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        self.failed = failures.iter().cloned().collect();
        self.failures = failures;
    }
}

/// Owns the in-flight fetches of one audit loop.
pub struct FetchPipeline {
    fetcher: Arc<dyn Fetcher>,
    in_flight: JoinSet<Fetchable>,
    targets: HashMap<task::Id, QueuedUrl>,
}

impl FetchPipeline {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            in_flight: JoinSet::new(),
            targets: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Top up the page queue by starting fetches, after folding any that
    /// already completed. Returns the number of fetches started.
    pub async fn replenish(&mut self, ctx: &ScanContext) -> usize {
        self.collect_ready(ctx).await;

        let in_flight = self.in_flight.len();
        let batch: Vec<QueuedUrl> = ctx
            .with(|s| {
                let count = s.queues.replenish_count(in_flight);
                (0..count).filter_map(|_| s.queues.pop_url()).collect()
            })
            .await;

        let started = batch.len();
        for target in batch {
            self.spawn(target);
        }
        if started > 0 {
            debug!("Started {} fetches ({} in flight)", started, self.in_flight.len());
        }
        started
    }

    /// Fold fetches that have already finished without waiting for others.
    pub async fn collect_ready(&mut self, ctx: &ScanContext) {
        while let Some(joined) = self.in_flight.try_join_next_with_id() {
            self.settle(ctx, joined).await;
        }
    }

    /// Next page to audit: the page queue first, then in-flight fetches, then
    /// a fresh fetch from the URL queue. `None` once both queues are empty and
    /// nothing is in flight.
    pub async fn pop_page(&mut self, ctx: &ScanContext) -> Option<PageId> {
        loop {
            if let Some(id) = ctx.with(|s| s.queues.pop_page()).await {
                return Some(id);
            }

            if let Some(joined) = self.in_flight.join_next_with_id().await {
                self.settle(ctx, joined).await;
                continue;
            }

            match ctx.with(|s| s.queues.pop_url()).await {
                Some(target) => self.spawn(target),
                None => return None,
            }
        }
    }

    /// Wait for every in-flight fetch, fold the results, then drain the
    /// fetcher itself.
    pub async fn drain(&mut self, ctx: &ScanContext) {
        while let Some(joined) = self.in_flight.join_next_with_id().await {
            self.settle(ctx, joined).await;
        }
        self.fetcher.drain().await;
    }

    pub async fn abort(&mut self) {
        self.in_flight.shutdown().await;
        self.targets.clear();
    }

    fn spawn(&mut self, target: QueuedUrl) {
        let fetcher = self.fetcher.clone();
        let url = target.url.clone();
        let handle = self
            .in_flight
            .spawn(async move { fetcher.fetch(&url).await });
        self.targets.insert(handle.id(), target);
    }

    /// A fetch task that died counts as a failed fetch of its target.
    async fn settle(&mut self, ctx: &ScanContext, joined: Result<(task::Id, Fetchable), JoinError>) {
        match joined {
            Ok((id, fetched)) => {
                if let Some(target) = self.targets.remove(&id) {
                    resolve(ctx, target, fetched).await;
                }
            }
            Err(e) => {
                let Some(target) = self.targets.remove(&e.id()) else {
                    return;
                };
                warn!("Fetch task for {} died: {}", target.url, e);
                let reason = format!("fetch of {} died: {}", target.url, e);
                ctx.with(|s| s.record_error(&reason)).await;
                resolve(ctx, target, Fetchable::Failure(reason)).await;
            }
        }
    }
}

async fn resolve(ctx: &ScanContext, target: QueuedUrl, fetched: Fetchable) {
    match fetched {
        Fetchable::Page(mut page) => {
            page.depth = target.depth;
            ctx.with(|s| {
                s.queues.record_success(&target.url);
                // The URL already passed the filter when it was queued.
                s.push_page(page, PushOptions::FORCE)
            })
            .await;
        }
        Fetchable::RedirectTarget(location) => {
            debug!("Redirect {} -> {}", target.url, location);
            ctx.with(|s| {
                s.queues.record_success(&target.url);
                s.push_url_at(&location, target.depth, PushOptions::DEFAULT)
            })
            .await;
        }
        Fetchable::Failure(reason) => {
            let url = target.url.clone();
            let outcome = ctx
                .with(|s| {
                    let outcome = s.queues.record_failure(target);
                    if outcome == FailureOutcome::Dropped {
                        s.counters.fetch_failures += 1;
                    }
                    outcome
                })
                .await;
            match outcome {
                FailureOutcome::Retry => debug!("Fetch of {} failed, retrying: {}", url, reason),
                FailureOutcome::Dropped => warn!("Giving up on {}: {}", url, reason),
            }
        }
    }
}
