//! Scan configuration.
//!
//! Every section deserializes with defaults, so a JSON file only needs the
//! keys it wants to change.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Seed URLs pushed (forced) when a fresh scan starts.
    pub seeds: Vec<String>,
    pub scope: ScopeOptions,
    pub audit: AuditOptions,
    pub dedup: DedupOptions,
    pub queue: QueueOptions,
    pub distribution: DistributionOptions,
    pub http: HttpOptions,
    /// Where a suspended scan writes its snapshot.
    pub snapshot_path: Option<PathBuf>,
    /// Upper bound on how long an idle loop sleeps before re-checking signals.
    pub poll_interval_ms: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            scope: ScopeOptions::default(),
            audit: AuditOptions::default(),
            dedup: DedupOptions::default(),
            queue: QueueOptions::default(),
            distribution: DistributionOptions::default(),
            http: HttpOptions::default(),
            snapshot_path: None,
            poll_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeOptions {
    /// Restrict the scan to this host (and its subdomains when enabled).
    pub domain: Option<String>,
    pub include_subdomains: bool,
    /// URLs matching any of these patterns are out of scope.
    pub exclude: Vec<String>,
    pub redundant: Vec<RedundantRule>,
    /// Maximum number of URLs sharing a path and parameter names.
    pub auto_redundant: Option<usize>,
    pub max_depth: Option<usize>,
    pub page_limit: Option<usize>,
}

/// Allow at most `count` URLs matching `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedundantRule {
    pub pattern: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditOptions {
    pub links: bool,
    pub forms: bool,
    pub cookies: bool,
    pub headers: bool,
    /// Audit elements again even if their fingerprint was already audited.
    pub redundant: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            links: true,
            forms: true,
            cookies: true,
            headers: false,
            redundant: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupOptions {
    /// Capacity the element bloom filter is sized for.
    pub expected_elements: usize,
    /// Target false-positive rate of the element bloom filter.
    pub false_positive_rate: f64,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            expected_elements: 1_000_000,
            false_positive_rate: 0.0001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Fetch attempts before a URL is recorded as a permanent failure.
    pub max_tries: u32,
    pub page_queue_capacity: usize,
    /// Replenish from the URL queue when the page queue drops below this.
    pub low_water_mark: usize,
    pub replenish_batch: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_tries: 5,
            page_queue_capacity: 50,
            low_water_mark: 10,
            replenish_batch: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionOptions {
    /// Local slave instances to spawn. Never propagated to participants.
    pub spawns: usize,
    /// Maximum in-flight remote calls during a fan-out.
    pub max_concurrency: usize,
    pub issue_buffer_size: usize,
    pub max_fill_attempts: usize,
    /// Failed status polls before a participant is dropped from the scan.
    pub max_participant_failures: u32,
}

impl Default for DistributionOptions {
    fn default() -> Self {
        Self {
            spawns: 0,
            max_concurrency: 20,
            issue_buffer_size: 100,
            max_fill_attempts: 10,
            max_participant_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: swarmscan_scanner::fetcher::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ScanOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let options: ScanOptions = serde_json::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dedup.expected_elements == 0 {
            return Err(EngineError::Config(
                "dedup.expected_elements must be greater than zero".to_string(),
            ));
        }
        if !(self.dedup.false_positive_rate > 0.0 && self.dedup.false_positive_rate < 1.0) {
            return Err(EngineError::Config(format!(
                "dedup.false_positive_rate must be in (0, 1), got {}",
                self.dedup.false_positive_rate
            )));
        }
        if self.queue.max_tries == 0 {
            return Err(EngineError::Config(
                "queue.max_tries must be at least 1".to_string(),
            ));
        }
        if self.distribution.max_concurrency == 0 {
            return Err(EngineError::Config(
                "distribution.max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The configuration a master pushes to its participants.
    ///
    /// Spawn counts, seeds and the snapshot path are local concerns. The page
    /// limit is a global budget enforced by the master alone.
    pub fn for_participant(&self) -> Self {
        let mut options = self.clone();
        options.seeds.clear();
        options.snapshot_path = None;
        options.distribution.spawns = 0;
        options.scope.page_limit = None;
        options
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"scope": {{"page_limit": 25}}, "queue": {{"max_tries": 2}}}}"#
        )
        .unwrap();

        let options = ScanOptions::load(file.path()).unwrap();
        assert_eq!(options.scope.page_limit, Some(25));
        assert_eq!(options.queue.max_tries, 2);
        assert_eq!(options.queue.low_water_mark, 10);
        assert_eq!(options.distribution.max_concurrency, 20);
    }

    #[test]
    fn test_rejects_invalid_false_positive_rate() {
        let mut options = ScanOptions::default();
        options.dedup.false_positive_rate = 1.5;
        assert!(matches!(options.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_for_participant_strips_local_settings() {
        let mut options = ScanOptions::default();
        options.seeds = vec!["http://example.com/".to_string()];
        options.distribution.spawns = 4;
        options.snapshot_path = Some(PathBuf::from("/tmp/scan.json"));
        options.scope.page_limit = Some(10);
        options.scope.domain = Some("example.com".to_string());

        let pushed = options.for_participant();
        assert!(pushed.seeds.is_empty());
        assert_eq!(pushed.distribution.spawns, 0);
        assert_eq!(pushed.snapshot_path, None);
        assert_eq!(pushed.scope.page_limit, None);
        assert_eq!(pushed.scope.domain, Some("example.com".to_string()));
    }
}
