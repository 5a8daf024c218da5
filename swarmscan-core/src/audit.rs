//! The audit loop every participant runs.

use crate::collaborators::{ExplorationJob, PageCallback};
use crate::context::PushOptions;
use crate::distributed::channel::invoke;
use crate::distributed::{Request, Response, Role};
use crate::error::{EngineError, Result};
use crate::instance::Instance;
use crate::model::{Element, Fingerprint, PageData, PageId};
use crate::queue::FetchPipeline;
use crate::state::{Checkpoint, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

impl Instance {
    /// Drive the scan until it is done, aborted or suspended.
    ///
    /// A fresh scan pushes its seeds (forced) first; a restored one picks up
    /// its queues where the snapshot left them.
    pub async fn run(self: &Arc<Self>) -> Result<Status> {
        if !self.state.transition(Status::Ready, Status::Preparing) {
            let status = self.state.status();
            if status.is_finished() {
                return Ok(status);
            }
            // Released by a master before the loop got going.
            if status == Status::Cleanup {
                return Ok(self.state.wait_until_finished().await);
            }
            return Err(EngineError::InvalidState(format!(
                "scan {} is already {}",
                self.scan_id, status
            )));
        }

        if !self.restored {
            let (pushed, total) = self
                .ctx
                .with(|s| {
                    let seeds = s.options.seeds.clone();
                    let pushed = seeds
                        .iter()
                        .filter(|seed| s.push_url(seed, PushOptions::FORCE))
                        .count();
                    (pushed, seeds.len())
                })
                .await;
            if total > 0 {
                info!("Seeded {}/{} URLs", pushed, total);
            }
        }

        self.state.start_scanning();
        let role = self.ctx.with(|s| s.role.name()).await;
        info!("Scan {} started ({})", self.scan_id, role);

        let mut pipeline = FetchPipeline::new(self.fetcher.clone());
        let mut explored = self.explored_rx.lock().await;
        match self.audit_loop(&mut pipeline, &mut explored).await {
            Ok(status) => Ok(status),
            Err(e) => {
                error!("Scan {} failed: {}", self.scan_id, e);
                pipeline.abort().await;
                self.state.set_status(Status::Aborted);
                Err(e)
            }
        }
    }

    async fn audit_loop(
        self: &Arc<Self>,
        pipeline: &mut FetchPipeline,
        explored: &mut UnboundedReceiver<PageData>,
    ) -> Result<Status> {
        let poll = self.ctx.with(|s| s.options.poll_interval()).await;

        loop {
            let status = self.state.status();
            if status.is_finished() {
                pipeline.abort().await;
                return Ok(status);
            }

            match self.state.checkpoint().await {
                Checkpoint::Continue => {}
                Checkpoint::Abort => return Ok(self.abort_now(pipeline).await),
                Checkpoint::Suspend => return self.suspend_now(pipeline, explored, poll).await,
            }

            self.fold_explored(explored).await;

            if self.ctx.with(|s| s.page_limit_reached()).await {
                if !pipeline.is_idle() {
                    info!("Page limit reached, dropping {} fetches", pipeline.in_flight());
                    pipeline.abort().await;
                }
                if let Some(status) = self.finish_local().await? {
                    return Ok(status);
                }
                self.idle(poll).await;
                continue;
            }

            if self.ctx.with(|s| s.role.is_master()).await {
                self.distribute_round(pipeline).await;
            }

            pipeline.replenish(&self.ctx).await;

            match pipeline.pop_page(&self.ctx).await {
                Some(id) => self.audit_page(id).await?,
                None if self.explorer.has_pending() => self.idle(poll).await,
                None => {
                    if let Some(status) = self.finish_local().await? {
                        return Ok(status);
                    }
                    self.idle(poll).await;
                }
            }
        }
    }

    /// Sleep one tick, or less if work or a signal arrives.
    pub(crate) async fn idle(&self, poll: Duration) {
        tokio::select! {
            _ = self.wakeup.notified() => {}
            _ = self.state.wait_for_change(poll) => {}
        }
    }

    async fn fold_explored(&self, explored: &mut UnboundedReceiver<PageData>) {
        let mut pages = Vec::new();
        while let Ok(page) = explored.try_recv() {
            pages.push(page);
        }
        if pages.is_empty() {
            return;
        }

        let pushed = self
            .ctx
            .with(|s| {
                pages
                    .into_iter()
                    .filter(|page| s.push_page(page.clone(), PushOptions::DEFAULT))
                    .count()
            })
            .await;
        debug!("Explorer produced {} new pages", pushed);
    }

    /// Local work is exhausted. Returns the final status once the whole scan
    /// is over.
    async fn finish_local(&self) -> Result<Option<Status>> {
        if self.ctx.with(|s| s.role.is_slave()).await {
            self.report_slave_done().await;
            return Ok(None);
        }

        let has_participants = self
            .ctx
            .with(|s| {
                s.participants.set_local_finished(true);
                !s.participants.is_empty()
            })
            .await;
        if has_participants {
            self.poll_participants().await;
        }

        if self.check_termination().await {
            return Ok(Some(self.state.status()));
        }
        Ok(None)
    }

    /// Run `clean_up` and finish, once the local loop and every participant
    /// are done. Whoever completes the condition first does it.
    pub(crate) async fn check_termination(&self) -> bool {
        if !self.ctx.with(|s| s.participants.try_terminate()).await {
            return false;
        }

        self.clean_up().await;
        self.state.set_status(Status::Done);
        self.wakeup.notify_one();

        let stats = self.statistics().await;
        info!(
            "Scan {} done: {} pages, {} elements, {} issues",
            self.scan_id, stats.pages_audited, stats.elements_audited, stats.issues
        );
        true
    }

    async fn abort_now(&self, pipeline: &mut FetchPipeline) -> Status {
        warn!("Aborting scan {}", self.scan_id);
        pipeline.abort().await;
        self.clean_up().await;
        self.state.set_status(Status::Aborted);
        Status::Aborted
    }

    async fn suspend_now(
        &self,
        pipeline: &mut FetchPipeline,
        explored: &mut UnboundedReceiver<PageData>,
        poll: Duration,
    ) -> Result<Status> {
        info!("Suspending scan {}", self.scan_id);
        self.state.set_status(Status::Suspending);

        pipeline.drain(&self.ctx).await;
        // Pages the explorer still owes must land in the snapshot.
        while self.explorer.has_pending() {
            if self.state.abort_requested() {
                return Ok(self.abort_now(pipeline).await);
            }
            self.fold_explored(explored).await;
            self.idle(poll).await;
        }
        self.fold_explored(explored).await;

        let snapshot = self.snapshot().await;
        match self.ctx.with(|s| s.options.snapshot_path.clone()).await {
            Some(path) => snapshot.save(&path).await?,
            None => warn!("No snapshot path configured, suspended state is only kept in memory"),
        }

        self.clean_up().await;
        self.state.set_status(Status::Suspended);
        Ok(Status::Suspended)
    }

    async fn audit_page(self: &Arc<Self>, id: PageId) -> Result<()> {
        let selected = self
            .ctx
            .with(|s| {
                let page = s.arena.to_data(id)?;
                let elements: Vec<(Fingerprint, Element)> = match &page.whitelist {
                    Some(whitelist) => {
                        for fingerprint in whitelist {
                            s.filter.mark_audited(fingerprint);
                        }
                        s.arena
                            .elements_of(id)
                            .filter(|(_, entry)| whitelist.contains(&entry.fingerprint))
                            .map(|(_, entry)| (entry.fingerprint, entry.element.clone()))
                            .collect()
                    }
                    None => s
                        .filter_elements(&[id])
                        .into_iter()
                        .filter_map(|selected| {
                            s.arena
                                .element(selected.element)
                                .map(|entry| (selected.fingerprint, entry.element.clone()))
                        })
                        .collect(),
                };
                Some((page, elements))
            })
            .await;
        let Some((page, mut elements)) = selected else {
            return Ok(());
        };
        let whitelisted = page.whitelist.is_some();

        // Slaves only audit what the master lets them claim.
        if !whitelisted && !elements.is_empty() {
            let upstream = self
                .ctx
                .with(|s| match &s.role {
                    Role::Slave(link) => Some((link.channel.clone(), link.master.token.clone())),
                    _ => None,
                })
                .await;
            if let Some((channel, token)) = upstream {
                let request = Request::ClaimElements {
                    page_url: page.url.clone(),
                    fingerprints: elements.iter().map(|(f, _)| *f).collect(),
                };
                match invoke(channel.as_ref(), &token, request).await {
                    Ok(Response::Claimed(accepted)) => {
                        elements.retain(|(f, _)| accepted.contains(f));
                    }
                    Ok(other) => {
                        warn!("Unexpected claim response for {}: {:?}", page.url, other);
                        elements.clear();
                    }
                    Err(e) => {
                        warn!("Could not claim elements of {}: {}", page.url, e);
                        self.ctx
                            .with(|s| s.record_error(&format!("claim for {} failed: {}", page.url, e)))
                            .await;
                        elements.clear();
                    }
                }
            }
        }

        let audited: Vec<Element> = elements.into_iter().map(|(_, element)| element).collect();
        debug!("Auditing {} ({} elements)", page.url, audited.len());

        let issues = match self.checker.check(&page, &audited).await {
            Ok(issues) => issues,
            Err(e) => {
                warn!("Check failed on {}: {:#}", page.url, e);
                self.ctx
                    .with(|s| {
                        s.counters.check_errors += 1;
                        s.record_error(&format!("check failed on {}: {:#}", page.url, e));
                    })
                    .await;
                Vec::new()
            }
        };

        let tx = self.explored_tx.clone();
        let callback: PageCallback = Arc::new(move |found| {
            let _ = tx.send(found);
        });
        let job = ExplorationJob { page: page.clone() };
        if let Err(e) = self.explorer.explore(job, callback).await {
            warn!("Exploration of {} failed: {:#}", page.url, e);
            self.ctx
                .with(|s| s.record_error(&format!("exploration of {} failed: {:#}", page.url, e)))
                .await;
        }

        let upstream = self
            .ctx
            .with(|s| {
                // Whitelisted pages come from a master that already queued their links.
                if !whitelisted {
                    for link in &page.links {
                        s.push_url_at(link, page.depth + 1, PushOptions::DEFAULT);
                    }
                }
                s.counters.pages_audited += 1;
                s.counters.elements_audited += audited.len();
                s.arena.clear_cache(id);
                s.participants.set_local_finished(false);

                let mut fresh = Vec::new();
                for issue in issues {
                    if let Some(summary) = s.record_issue(issue.clone()) {
                        s.counters.issues += 1;
                        fresh.push((issue, summary));
                    }
                }

                match &mut s.role {
                    Role::Slave(link) => {
                        let mut batches = Vec::new();
                        if fresh.is_empty() {
                            batches.extend(link.buffer.tick());
                        }
                        let mut summaries = Vec::new();
                        for (issue, summary) in fresh {
                            summaries.push(summary);
                            batches.extend(link.buffer.push(issue));
                        }
                        Some((link.channel.clone(), link.master.token.clone(), batches, summaries))
                    }
                    _ => None,
                }
            })
            .await;

        if let Some((channel, token, batches, summaries)) = upstream {
            if !summaries.is_empty() {
                let channel = channel.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    if let Err(e) = invoke(channel.as_ref(), &token, Request::ReportSummaries(summaries)).await {
                        warn!("Could not report issue summaries: {}", e);
                    }
                });
            }
            for batch in batches {
                self.report_issues(&channel, &token, batch).await;
            }
        }

        Ok(())
    }
}
