use super::channel::{Channel, invoke};
use super::messages::{ParticipantInfo, Request, Response};
use super::Role;
use crate::context::{PushOptions, Shared};
use crate::error::{EngineError, Result};
use crate::instance::Instance;
use crate::model::PageData;
use crate::partition::{Chunk, split};
use crate::queue::FetchPipeline;
use crate::stats::{Statistics, merge_statistics};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Reservation = (ParticipantInfo, Arc<dyn Channel>);

impl Instance {
    /// Take `info` on as a slave: push it the configuration, assign this
    /// instance as its master and record it as idle.
    pub async fn enslave(&self, info: ParticipantInfo) -> Result<()> {
        info.validate()?;
        if info.url == self.info.url {
            return Err(EngineError::InvalidParticipant(
                "an instance cannot enslave itself".to_string(),
            ));
        }

        let options = self
            .ctx
            .with(|s| match s.role {
                Role::Slave(_) => Err(EngineError::AlreadySlave),
                _ => Ok(s.options.for_participant()),
            })
            .await?;

        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| EngineError::Channel("no connector configured".to_string()))?;
        let channel = connector.connect(&info).await?;

        invoke(channel.as_ref(), &info.token, Request::PushConfiguration(options)).await?;
        invoke(
            channel.as_ref(),
            &info.token,
            Request::AssignMaster(self.info.clone()),
        )
        .await?;

        self.ctx
            .with(|s| {
                if !s.role.is_slave() {
                    s.role = Role::Master;
                }
                s.participants.add(info.clone(), channel);
            })
            .await;
        info!("Enslaved {}", info.url);
        Ok(())
    }

    /// One distribution round: reserve every idle participant, split the
    /// queued pages over them plus this instance and ship the chunks.
    pub(crate) async fn distribute_round(self: &Arc<Self>, pipeline: &mut FetchPipeline) {
        pipeline.collect_ready(&self.ctx).await;

        let round = self
            .ctx
            .with(|s| {
                if s.participants.idle_count() == 0 || s.queues.page_len() == 0 {
                    return None;
                }
                let pages = s.take_distributable_pages();
                if pages.is_empty() {
                    return None;
                }
                Some((pages, s.participants.reserve_idle()))
            })
            .await;
        let Some((pages, reserved)) = round else {
            return;
        };

        let chunks = split(&self.ctx, &pages, reserved.len()).await;
        debug!(
            "Split {} pages into {} chunks ({} elements)",
            pages.len(),
            chunks.len(),
            chunks.iter().map(Chunk::element_count).sum::<usize>()
        );
        self.ctx
            .with(|s| {
                for &id in &pages {
                    s.arena.clear_cache(id);
                }
            })
            .await;

        let local = self.distribute(chunks, 0, reserved).await;
        self.ctx
            .with(|s| {
                for page in local.pages {
                    s.push_page(page, PushOptions::ADMIN);
                }
            })
            .await;
    }

    /// Keep `chunks[local_index]` and dispatch every other chunk to the next
    /// reserved participant. Empty chunks give their reservation back.
    pub(crate) async fn distribute(
        self: &Arc<Self>,
        mut chunks: Vec<Chunk>,
        local_index: usize,
        reserved: Vec<Reservation>,
    ) -> Chunk {
        let mut local = match chunks.get_mut(local_index) {
            Some(chunk) => std::mem::take(chunk),
            None => Chunk::default(),
        };

        let mut reserved = reserved.into_iter();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if index == local_index {
                continue;
            }
            let Some((info, channel)) = reserved.next() else {
                local.pages.extend(chunk.pages);
                continue;
            };
            if chunk.is_empty() {
                self.ctx.with(|s| s.participants.release(&info.url)).await;
                continue;
            }

            let count = chunk.pages.len();
            self.ctx.with(|s| s.counters.pages_dispatched += count).await;
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dispatch_chunk(info, channel, chunk).await });
        }

        for (info, _) in reserved {
            self.ctx.with(|s| s.participants.release(&info.url)).await;
        }
        local
    }

    async fn dispatch_chunk(&self, info: ParticipantInfo, channel: Arc<dyn Channel>, chunk: Chunk) {
        let _permit = self.fanout.acquire().await;
        let pages = chunk.pages.clone();
        let elements = chunk.element_count();

        match invoke(channel.as_ref(), &info.token, Request::DispatchChunk(chunk)).await {
            Ok(_) => {
                debug!(
                    "Dispatched {} pages ({} elements) to {}",
                    pages.len(),
                    elements,
                    info.url
                );
                self.ctx
                    .with(|s| s.participants.mark_dispatched(&info.url, pages))
                    .await;
            }
            Err(e) => {
                warn!(
                    "Dispatch to {} failed, auditing its {} pages locally: {}",
                    info.url,
                    pages.len(),
                    e
                );
                let evicted = self
                    .ctx
                    .with(|s| {
                        s.counters.pages_dispatched =
                            s.counters.pages_dispatched.saturating_sub(pages.len());
                        for page in pages {
                            s.push_page(page, PushOptions::ADMIN);
                        }
                        s.participants.set_local_finished(false);
                        s.record_error(&format!("dispatch to {} failed: {}", info.url, e));
                        let max_failures = s.options.distribution.max_participant_failures;
                        let held = s.participants.mark_failed(&info.url, max_failures)?;
                        Some(reclaim(s, held))
                    })
                    .await;
                if let Some(reclaimed) = evicted {
                    warn!(
                        "Dropped participant {} after repeated failures, {} pages taken back",
                        info.url, reclaimed
                    );
                }
                self.wakeup.notify_one();
            }
        }
    }

    /// Ask outstanding participants for their status. Idle ones join the
    /// done-set; unreachable ones count a failure and are eventually dropped.
    pub(crate) async fn poll_participants(&self) {
        let (pollable, concurrency, max_failures) = self
            .ctx
            .with(|s| {
                (
                    s.participants.pollable(),
                    s.options.distribution.max_concurrency,
                    s.options.distribution.max_participant_failures,
                )
            })
            .await;
        if pollable.is_empty() {
            return;
        }

        let requests: Vec<_> = pollable
            .into_iter()
            .map(|(info, channel)| async move {
                let result = invoke(channel.as_ref(), &info.token, Request::Status).await;
                (info.url, result)
            })
            .collect();
        let results: Vec<(String, Result<Response>)> = stream::iter(requests)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        self.ctx
            .with(|s| {
                for (url, result) in results {
                    match result {
                        Ok(Response::Status(report)) if !report.busy => {
                            s.participants.mark_done(&url);
                        }
                        Ok(_) => s.participants.mark_reachable(&url),
                        Err(e) => match s.participants.mark_failed(&url, max_failures) {
                            Some(held) => {
                                let reclaimed = reclaim(s, held);
                                warn!(
                                    "Dropped unreachable participant {}, {} pages taken back: {}",
                                    url, reclaimed, e
                                );
                            }
                            None => debug!("Status poll of {} failed: {}", url, e),
                        },
                    }
                }
            })
            .await;
    }

    /// A participant finished its chunk.
    pub async fn slave_done(&self, url: &str) -> Result<()> {
        if !self.ctx.with(|s| s.participants.mark_done(url)).await {
            return Err(EngineError::InvalidParticipant(format!(
                "unknown participant {}",
                url
            )));
        }
        info!("Participant {} is done", url);
        self.wakeup.notify_one();
        self.check_termination().await;
        Ok(())
    }

    /// Statistics of this instance merged with those of every participant
    /// that answers.
    pub async fn statistics(&self) -> Statistics {
        let local = self.local_statistics().await;
        let (participants, concurrency) = self
            .ctx
            .with(|s| (s.participants.all(), s.options.distribution.max_concurrency))
            .await;
        if participants.is_empty() {
            return local;
        }

        let requests: Vec<_> = participants
            .into_iter()
            .map(|(info, channel)| async move {
                match invoke(channel.as_ref(), &info.token, Request::Statistics).await {
                    Ok(Response::Statistics(stats)) => Some(stats),
                    Ok(_) => None,
                    Err(e) => {
                        debug!("No statistics from {}: {}", info.url, e);
                        None
                    }
                }
            })
            .collect();
        let mut reports: Vec<Option<Statistics>> = stream::iter(requests)
            .buffer_unordered(concurrency)
            .collect()
            .await;
        reports.push(Some(local));
        merge_statistics(&reports)
    }

    /// Tell every participant to clean up.
    pub(crate) async fn release_participants(&self) {
        let (participants, concurrency) = self
            .ctx
            .with(|s| (s.participants.all(), s.options.distribution.max_concurrency))
            .await;

        let requests: Vec<_> = participants
            .into_iter()
            .map(|(info, channel)| async move {
                if let Err(e) = invoke(channel.as_ref(), &info.token, Request::CleanUp).await {
                    warn!("Clean up of {} failed: {}", info.url, e);
                }
            })
            .collect();
        stream::iter(requests)
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;
    }
}

/// Queue the pages an evicted participant never finished for local audit.
/// Their elements are already claimed, so nobody else would audit them.
fn reclaim(s: &mut Shared, held: Vec<PageData>) -> usize {
    let count = held.len();
    s.counters.pages_dispatched = s.counters.pages_dispatched.saturating_sub(count);
    for page in held {
        s.push_page(page, PushOptions::ADMIN);
    }
    if count > 0 {
        s.participants.set_local_finished(false);
    }
    count
}
