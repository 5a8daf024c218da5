//! A scan participant: context, lifecycle and collaborators in one handle.
//!
//! The audit loop lives in [`crate::audit`], master and slave behaviour in
//! [`crate::distributed`]; this module holds construction and the public
//! control surface.

use crate::collaborators::{Checker, Explorer, Fetcher, NoopExplorer};
use crate::config::ScanOptions;
use crate::context::{PushOptions, ScanContext};
use crate::distributed::{Connector, ParticipantInfo, Role};
use crate::error::{EngineError, Result};
use crate::model::{Issue, IssueSummary, PageData};
use crate::snapshot::Snapshot;
use crate::state::{PauseToken, ScanState, Status};
use crate::stats::{Statistics, StatusReport};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use uuid::Uuid;

pub struct Instance {
    pub(crate) info: ParticipantInfo,
    pub(crate) ctx: ScanContext,
    pub(crate) state: ScanState,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) explorer: Arc<dyn Explorer>,
    pub(crate) checker: Arc<dyn Checker>,
    pub(crate) connector: Option<Arc<dyn Connector>>,
    /// Bounds in-flight remote calls made from spawned tasks.
    pub(crate) fanout: Arc<Semaphore>,
    /// Wakes an idle loop when work arrives from outside.
    pub(crate) wakeup: Notify,
    pub(crate) scan_id: String,
    pub(crate) restored: bool,
    pub(crate) explored_tx: mpsc::UnboundedSender<PageData>,
    pub(crate) explored_rx: Mutex<mpsc::UnboundedReceiver<PageData>>,
}

impl Instance {
    pub fn new(
        options: ScanOptions,
        fetcher: Arc<dyn Fetcher>,
        checker: Arc<dyn Checker>,
    ) -> Result<Self> {
        let ctx = ScanContext::new(options.clone())?;
        Ok(Self::assemble(ctx, &options, fetcher, checker, Uuid::new_v4().to_string()))
    }

    /// Rebuild a suspended scan. The restored instance skips seeding.
    pub fn restore(
        snapshot: Snapshot,
        fetcher: Arc<dyn Fetcher>,
        checker: Arc<dyn Checker>,
    ) -> Result<Self> {
        let options = snapshot.options.clone();
        let scan_id = snapshot.scan_id.clone();
        let mut ctx = ScanContext::new(options.clone())?;
        ctx.restore(snapshot)?;

        let mut instance = Self::assemble(ctx, &options, fetcher, checker, scan_id);
        instance.restored = true;
        Ok(instance)
    }

    fn assemble(
        ctx: ScanContext,
        options: &ScanOptions,
        fetcher: Arc<dyn Fetcher>,
        checker: Arc<dyn Checker>,
        scan_id: String,
    ) -> Self {
        let (explored_tx, explored_rx) = mpsc::unbounded_channel();
        Self {
            info: ParticipantInfo::new(
                &format!("local://{}", Uuid::new_v4()),
                &Uuid::new_v4().to_string(),
            ),
            ctx,
            state: ScanState::new(),
            fetcher,
            explorer: Arc::new(NoopExplorer),
            checker,
            connector: None,
            fanout: Arc::new(Semaphore::new(options.distribution.max_concurrency)),
            wakeup: Notify::new(),
            scan_id,
            restored: false,
            explored_tx,
            explored_rx: Mutex::new(explored_rx),
        }
    }

    pub fn with_explorer(mut self, explorer: Arc<dyn Explorer>) -> Self {
        self.explorer = explorer;
        self
    }

    pub fn with_identity(mut self, info: ParticipantInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn info(&self) -> &ParticipantInfo {
        &self.info
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn context(&self) -> &ScanContext {
        &self.ctx
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub async fn push_url(&self, url: &str, options: PushOptions) -> bool {
        let pushed = self.ctx.with(|s| s.push_url(url, options)).await;
        if pushed {
            self.wakeup.notify_one();
        }
        pushed
    }

    pub async fn push_page(&self, page: PageData, options: PushOptions) -> bool {
        let pushed = self.ctx.with(|s| s.push_page(page, options)).await;
        if pushed {
            self.wakeup.notify_one();
        }
        pushed
    }

    pub async fn pause(&self, wait: bool) -> PauseToken {
        self.state.pause(wait).await
    }

    pub fn resume(&self, token: PauseToken) -> bool {
        self.state.resume(token)
    }

    pub async fn abort(&self, wait: bool) {
        self.state.abort(wait).await;
        self.wakeup.notify_one();
    }

    /// Suspend to the configured snapshot path. Refused once the instance
    /// takes part in a multi-instance scan.
    pub async fn suspend(&self, wait: bool) -> Result<()> {
        let distributed = self
            .ctx
            .with(|s| !matches!(s.role, Role::Solo) || !s.participants.is_empty())
            .await;
        if distributed {
            return Err(EngineError::InvalidState(
                "only solo scans can be suspended".to_string(),
            ));
        }

        self.state.suspend(wait).await;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Release everything the scan holds outside this process: a master
    /// cleans up its participants, a slave flushes its issue buffer. The
    /// caller sets the final status.
    pub(crate) async fn clean_up(&self) {
        self.state.set_status(Status::Cleanup);

        let (is_master, upstream) = self
            .ctx
            .with(|s| match &mut s.role {
                Role::Master => (true, None),
                Role::Slave(link) => (
                    false,
                    Some((link.channel.clone(), link.master.token.clone(), link.buffer.take())),
                ),
                Role::Solo => (false, None),
            })
            .await;

        if is_master {
            self.release_participants().await;
        }
        if let Some((channel, token, issues)) = upstream
            && !issues.is_empty()
        {
            self.report_issues(&channel, &token, issues).await;
        }
        self.fetcher.drain().await;
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.ctx.with(|s| s.snapshot(&self.scan_id)).await
    }

    pub async fn local_statistics(&self) -> Statistics {
        self.ctx.statistics().await
    }

    pub async fn status_report(&self) -> StatusReport {
        let status = self.state.status();
        let runtime = self.ctx.runtime();
        self.ctx
            .with(|s| StatusReport {
                status,
                busy: match &s.role {
                    Role::Slave(link) => !link.idle && status.is_running(),
                    _ => status.is_running(),
                },
                url_queue: s.queues.url_len(),
                page_queue: s.queues.page_len(),
                statistics: s.statistics(runtime),
            })
            .await
    }

    pub async fn errors(&self, from: usize) -> Vec<String> {
        self.ctx.with(|s| s.errors_since(from)).await
    }

    pub async fn issues(&self) -> Vec<Issue> {
        self.ctx.with(|s| s.issues.clone()).await
    }

    pub async fn summaries(&self) -> Vec<IssueSummary> {
        self.ctx.with(|s| s.summaries.clone()).await
    }

    pub async fn failures(&self) -> Vec<String> {
        self.ctx.with(|s| s.queues.failures().to_vec()).await
    }

    /// Participants that failed calls and are neither done nor evicted yet.
    pub async fn stalled_participants(&self) -> Vec<String> {
        self.ctx.with(|s| s.participants.stalled()).await
    }
}
