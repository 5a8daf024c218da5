//! Inbound calls, for both the master and the slave side.

use super::channel::Handler;
use super::messages::{Envelope, ParticipantInfo, Request, Response};
use super::slave::SlaveLink;
use super::Role;
use crate::config::ScanOptions;
use crate::context::PushOptions;
use crate::error::{EngineError, Result};
use crate::instance::Instance;
use crate::partition::Chunk;
use crate::state::Status;
use async_trait::async_trait;
use tracing::{debug, info, warn};

#[async_trait]
impl Handler for Instance {
    async fn handle(&self, envelope: Envelope) -> Response {
        let call = envelope.request.name();
        if envelope.token != self.info.token {
            warn!("Refused {} call with a bad token", call);
            return Response::Unauthorized;
        }

        match self.serve_request(envelope.request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Rejected {}: {}", call, e);
                Response::Rejected(e.to_string())
            }
        }
    }
}

impl Instance {
    async fn serve_request(&self, request: Request) -> Result<Response> {
        match request {
            Request::PushConfiguration(options) => self.accept_configuration(options).await,
            Request::AssignMaster(master) => self.accept_master(master).await,
            Request::DispatchChunk(chunk) => self.accept_chunk(chunk).await,
            Request::ReportIssues(issues) => {
                self.require_master().await?;
                let count = issues.len();
                let new = self
                    .ctx
                    .with(|s| {
                        issues
                            .into_iter()
                            .filter(|issue| s.record_issue(issue.clone()).is_some())
                            .count()
                    })
                    .await;
                debug!("Received {} issues ({} new)", count, new);
                Ok(Response::Ok)
            }
            Request::ReportSummaries(summaries) => {
                self.require_master().await?;
                self.ctx
                    .with(|s| {
                        for summary in summaries {
                            info!("[{}] {} at {}", summary.severity.as_str(), summary.title, summary.url);
                            s.record_summary(summary);
                        }
                    })
                    .await;
                Ok(Response::Ok)
            }
            Request::ClaimElements {
                page_url,
                fingerprints,
            } => {
                self.require_master().await?;
                let accepted = self.ctx.with(|s| s.claim_elements(&fingerprints)).await;
                debug!(
                    "Claim for {}: {}/{} accepted",
                    page_url,
                    accepted.len(),
                    fingerprints.len()
                );
                Ok(Response::Claimed(accepted))
            }
            Request::SlaveDone { url } => {
                self.require_master().await?;
                self.slave_done(&url).await?;
                Ok(Response::Ok)
            }
            Request::Statistics => Ok(Response::Statistics(self.local_statistics().await)),
            Request::Errors { from } => Ok(Response::Errors(self.errors(from).await)),
            Request::Status => Ok(Response::Status(self.status_report().await)),
            Request::CleanUp => {
                if !self.ctx.with(|s| s.role.is_slave()).await {
                    return Err(EngineError::InvalidState("not a slave".to_string()));
                }
                if !self.state.status().is_finished() {
                    self.clean_up().await;
                    self.state.set_status(Status::Done);
                    self.wakeup.notify_one();
                    info!("{} cleaned up on request of its master", self.info.url);
                }
                Ok(Response::Ok)
            }
        }
    }

    async fn require_master(&self) -> Result<()> {
        if self.ctx.with(|s| s.role.is_master()).await {
            Ok(())
        } else {
            Err(EngineError::InvalidState("not a master".to_string()))
        }
    }

    async fn accept_configuration(&self, options: ScanOptions) -> Result<Response> {
        if self.state.status() != Status::Ready {
            return Err(EngineError::InvalidState(format!(
                "cannot reconfigure a scan that is {}",
                self.state.status()
            )));
        }
        self.ctx
            .with(|s| {
                if !matches!(s.role, Role::Solo) || !s.participants.is_empty() {
                    return Err(EngineError::InvalidState(format!(
                        "cannot reconfigure a {}",
                        s.role.name()
                    )));
                }
                s.apply_options(options)
            })
            .await?;
        Ok(Response::Ok)
    }

    async fn accept_master(&self, master: ParticipantInfo) -> Result<Response> {
        master.validate()?;
        self.ctx
            .with(|s| match s.role {
                Role::Solo if s.participants.is_empty() => Ok(()),
                Role::Slave(_) => Err(EngineError::InvalidState(
                    "already assigned to a master".to_string(),
                )),
                _ => Err(EngineError::InvalidState(
                    "a master cannot become a slave".to_string(),
                )),
            })
            .await?;

        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| EngineError::Channel("no connector configured".to_string()))?;
        let channel = connector.connect(&master).await?;

        self.ctx
            .with(|s| {
                if s.role.is_slave() {
                    return Err(EngineError::InvalidState(
                        "already assigned to a master".to_string(),
                    ));
                }
                let link = SlaveLink::new(master.clone(), channel, &s.options.distribution);
                s.role = Role::Slave(link);
                Ok(())
            })
            .await?;

        info!("{} assigned to master {}", self.info.url, master.url);
        self.wakeup.notify_one();
        Ok(Response::Ok)
    }

    async fn accept_chunk(&self, chunk: Chunk) -> Result<Response> {
        let (pages, elements) = (chunk.pages.len(), chunk.element_count());
        self.ctx
            .with(|s| {
                let Role::Slave(link) = &mut s.role else {
                    return Err(EngineError::InvalidState("not a slave".to_string()));
                };
                link.idle = false;
                link.generation += 1;
                for page in chunk.pages {
                    s.push_page(page, PushOptions::ADMIN);
                }
                Ok(())
            })
            .await?;

        debug!("Received chunk of {} pages ({} elements)", pages, elements);
        self.wakeup.notify_one();
        Ok(Response::Ok)
    }
}
