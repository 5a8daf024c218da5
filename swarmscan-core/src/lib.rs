//! Scan orchestration engine.
//!
//! Work queues, dedup and scope filtering, the scan lifecycle and the
//! master/slave workload distribution that lets several instances share one
//! crawl-and-audit job.

pub mod audit;
pub mod checks;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod distributed;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod instance;
pub mod model;
pub mod partition;
pub mod queue;
pub mod snapshot;
pub mod state;
pub mod stats;

pub use checks::PassiveChecker;
pub use collaborators::{Checker, ExplorationJob, Explorer, Fetcher, NoopExplorer, PageCallback};
pub use config::ScanOptions;
pub use context::{PushOptions, ScanContext};
pub use error::{EngineError, Result};
pub use fetch::HttpFetcher;
pub use instance::Instance;
pub use model::{Element, ElementKind, Fetchable, Fingerprint, Issue, IssueSummary, PageData, Severity};
pub use snapshot::Snapshot;
pub use state::{PauseToken, Status};
pub use stats::{Statistics, StatusReport, merge_statistics};
