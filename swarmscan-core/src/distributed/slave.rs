use super::channel::{Channel, invoke};
use super::messages::{ParticipantInfo, Request};
use super::Role;
use crate::config::DistributionOptions;
use crate::error::Result;
use crate::instance::Instance;
use crate::model::Issue;
use crate::state::Status;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Issues waiting to be reported to the master.
///
/// Flushed when full, or once `max_fill_attempts` ticks passed without the
/// buffer filling up.
#[derive(Debug)]
pub struct IssueBuffer {
    issues: Vec<Issue>,
    capacity: usize,
    max_fill_attempts: usize,
    attempts: usize,
}

impl IssueBuffer {
    pub fn new(capacity: usize, max_fill_attempts: usize) -> Self {
        Self {
            issues: Vec::new(),
            capacity: capacity.max(1),
            max_fill_attempts: max_fill_attempts.max(1),
            attempts: 0,
        }
    }

    /// Returns a batch to send once the buffer is full.
    pub fn push(&mut self, issue: Issue) -> Option<Vec<Issue>> {
        self.issues.push(issue);
        if self.issues.len() >= self.capacity {
            return Some(self.take());
        }
        None
    }

    /// Count one audit that did not fill the buffer.
    pub fn tick(&mut self) -> Option<Vec<Issue>> {
        if self.issues.is_empty() {
            return None;
        }
        self.attempts += 1;
        if self.attempts >= self.max_fill_attempts {
            return Some(self.take());
        }
        None
    }

    pub fn take(&mut self) -> Vec<Issue> {
        self.attempts = 0;
        std::mem::take(&mut self.issues)
    }

    /// Put back a batch that could not be delivered.
    pub fn requeue(&mut self, mut batch: Vec<Issue>) {
        batch.append(&mut self.issues);
        self.issues = batch;
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

/// A slave's connection to its master.
pub struct SlaveLink {
    pub master: ParticipantInfo,
    pub channel: Arc<dyn Channel>,
    pub buffer: IssueBuffer,
    /// No chunk pending since the last done report.
    pub idle: bool,
    /// Bumped by every chunk received.
    pub generation: u64,
}

impl SlaveLink {
    pub fn new(
        master: ParticipantInfo,
        channel: Arc<dyn Channel>,
        options: &DistributionOptions,
    ) -> Self {
        Self {
            master,
            channel,
            buffer: IssueBuffer::new(options.issue_buffer_size, options.max_fill_attempts),
            idle: true,
            generation: 0,
        }
    }
}

impl Instance {
    /// Wait to be enslaved, then run as a slave.
    pub async fn serve(self: &Arc<Self>) -> Result<Status> {
        loop {
            if self.ctx.with(|s| s.role.is_slave()).await {
                break;
            }
            let status = self.state.status();
            if status.is_finished() {
                return Ok(status);
            }
            if self.state.abort_requested() {
                self.state.set_status(Status::Aborted);
                return Ok(Status::Aborted);
            }
            let poll = self.ctx.with(|s| s.options.poll_interval()).await;
            self.idle(poll).await;
        }

        info!("{} serving as slave", self.info.url);
        self.run().await
    }

    /// Flush buffered issues and tell the master this slave ran out of work.
    /// Sent once per exhaustion: nothing goes out again until a new chunk
    /// arrives.
    pub(crate) async fn report_slave_done(&self) {
        let pending = self
            .ctx
            .with(|s| match &mut s.role {
                Role::Slave(link) if !link.idle => Some((
                    link.channel.clone(),
                    link.master.token.clone(),
                    link.buffer.take(),
                    link.generation,
                )),
                _ => None,
            })
            .await;
        let Some((channel, token, issues, generation)) = pending else {
            return;
        };

        if !issues.is_empty() {
            self.report_issues(&channel, &token, issues).await;
        }

        let request = Request::SlaveDone {
            url: self.info.url.clone(),
        };
        match invoke(channel.as_ref(), &token, request).await {
            Ok(_) => {
                self.ctx
                    .with(|s| {
                        if let Role::Slave(link) = &mut s.role
                            && link.generation == generation
                        {
                            link.idle = true;
                        }
                    })
                    .await;
                debug!("{} reported done", self.info.url);
            }
            Err(e) => warn!("Could not report done to master, will retry: {}", e),
        }
    }

    /// Send a batch upstream; on failure it goes back into the buffer.
    pub(crate) async fn report_issues(&self, channel: &Arc<dyn Channel>, token: &str, batch: Vec<Issue>) {
        let count = batch.len();
        match invoke(channel.as_ref(), token, Request::ReportIssues(batch.clone())).await {
            Ok(_) => debug!("Reported {} issues upstream", count),
            Err(e) => {
                warn!("Could not report {} issues upstream: {}", count, e);
                self.ctx
                    .with(|s| {
                        s.record_error(&format!("issue report failed: {}", e));
                        if let Role::Slave(link) = &mut s.role {
                            link.buffer.requeue(batch);
                        }
                    })
                    .await;
            }
        }
    }
}
