//! Seams between the engine and the components it drives.
//!
//! The engine never looks inside these: a fetcher resolves a URL into a
//! [`Fetchable`], an explorer turns a page into more pages, a checker turns a
//! page and its audited elements into issues.

use crate::model::{Element, Fetchable, Issue, PageData};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives pages produced asynchronously by an [`Explorer`].
pub type PageCallback = Arc<dyn Fn(PageData) + Send + Sync>;

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Fetchable;

    /// Wait for any background work the fetcher started on its own.
    async fn drain(&self) {}
}

#[derive(Debug, Clone)]
pub struct ExplorationJob {
    pub page: PageData,
}

#[async_trait]
pub trait Explorer: Send + Sync {
    /// Start exploring. New pages are delivered through `callback`, possibly
    /// after this returns.
    async fn explore(&self, job: ExplorationJob, callback: PageCallback) -> anyhow::Result<()>;

    fn has_pending(&self) -> bool;
}

#[async_trait]
pub trait Checker: Send + Sync {
    /// `elements` is the audited subset; the full page stays available for
    /// passive inspection.
    async fn check(&self, page: &PageData, elements: &[Element]) -> anyhow::Result<Vec<Issue>>;
}

/// Explorer that discovers nothing. Used when no browser engine is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExplorer;

#[async_trait]
impl Explorer for NoopExplorer {
    async fn explore(&self, _job: ExplorationJob, _callback: PageCallback) -> anyhow::Result<()> {
        Ok(())
    }

    fn has_pending(&self) -> bool {
        false
    }
}
