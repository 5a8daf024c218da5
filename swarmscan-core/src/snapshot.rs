//! Suspend-to-disk.

use crate::config::ScanOptions;
use crate::error::{EngineError, Result};
use crate::filter::{FilterState, RedundancyState, SeenSets};
use crate::model::{Issue, PageData};
use crate::queue::QueuedUrl;
use crate::stats::Counters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume a suspended scan in a fresh process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub scan_id: String,
    pub created_at: DateTime<Utc>,
    pub options: ScanOptions,
    pub url_queue: Vec<QueuedUrl>,
    pub page_queue: Vec<PageData>,
    pub failures: Vec<String>,
    pub tries: BTreeMap<String, u32>,
    pub seen: SeenSets,
    pub element_filter: FilterState,
    pub redundancy: RedundancyState,
    pub counters: Counters,
    pub issues: Vec<Issue>,
    pub errors: Vec<String>,
}

impl Snapshot {
    /// Write atomically: the JSON goes to a sibling temp file that is then
    /// renamed over `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");

        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, path).await?;

        info!(
            "Snapshot {} written to {} ({} urls, {} pages queued)",
            self.scan_id,
            path.display(),
            self.url_queue.len(),
            self.page_queue.len()
        );
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::Snapshot(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }
}
