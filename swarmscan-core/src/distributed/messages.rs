//! Calls exchanged between a master and its slaves.

use crate::config::ScanOptions;
use crate::error::{EngineError, Result};
use crate::model::{Fingerprint, Issue, IssueSummary};
use crate::partition::Chunk;
use crate::stats::{Statistics, StatusReport};
use serde::{Deserialize, Serialize};

/// Identity of a participant: where to reach it and the token it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub url: String,
    pub token: String,
}

impl ParticipantInfo {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(EngineError::InvalidParticipant(
                "participant URL is empty".to_string(),
            ));
        }
        if self.token.trim().is_empty() {
            return Err(EngineError::InvalidParticipant(format!(
                "participant {} has no token",
                self.url
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", content = "args", rename_all = "snake_case")]
pub enum Request {
    PushConfiguration(ScanOptions),
    AssignMaster(ParticipantInfo),
    DispatchChunk(Chunk),
    ReportIssues(Vec<Issue>),
    ReportSummaries(Vec<IssueSummary>),
    ClaimElements {
        page_url: String,
        fingerprints: Vec<Fingerprint>,
    },
    SlaveDone {
        url: String,
    },
    Statistics,
    Errors {
        from: usize,
    },
    Status,
    CleanUp,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::PushConfiguration(_) => "push_configuration",
            Request::AssignMaster(_) => "assign_master",
            Request::DispatchChunk(_) => "dispatch_chunk",
            Request::ReportIssues(_) => "report_issues",
            Request::ReportSummaries(_) => "report_summaries",
            Request::ClaimElements { .. } => "claim_elements",
            Request::SlaveDone { .. } => "slave_done",
            Request::Statistics => "statistics",
            Request::Errors { .. } => "errors",
            Request::Status => "status",
            Request::CleanUp => "clean_up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Unauthorized,
    Rejected(String),
    Claimed(Vec<Fingerprint>),
    Statistics(Statistics),
    Errors(Vec<String>),
    Status(StatusReport),
}

/// A request plus the token of the participant it is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub token: String,
    pub request: Request,
}

impl Envelope {
    pub fn new(token: &str, request: Request) -> Self {
        Self {
            token: token.to_string(),
            request,
        }
    }
}
