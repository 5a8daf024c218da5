// Tests for the solo audit loop: lifecycle, limits, retries and suspend/restore

mod common;

use async_trait::async_trait;
use common::{
    DelayedExplorer, RecordingChecker, ROOT, SiteFetcher, dom_page, element_count, finish,
    options, site, wait_until,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use swarmscan_core::{
    EngineError, Fetchable, Fetcher, Instance, PushOptions, Snapshot, Status,
};
use tempfile::tempdir;
use tokio::sync::Semaphore;

const CHILDREN: [&str; 4] = ["a", "b", "c", "d"];

fn solo(fetcher: Arc<SiteFetcher>, checker: Arc<RecordingChecker>) -> Arc<Instance> {
    Arc::new(Instance::new(options(&[ROOT]), fetcher, checker).unwrap())
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_solo_scan_audits_every_element_once() {
    let fetcher = Arc::new(SiteFetcher::new(site(&CHILDREN)));
    let checker = Arc::new(RecordingChecker::default());
    let instance = solo(fetcher, checker.clone());

    let runner = instance.clone();
    let status = finish(tokio::spawn(async move { runner.run().await })).await;

    assert_eq!(status, Status::Done);
    assert_eq!(instance.status(), Status::Done);
    checker.assert_audited_once(element_count(&CHILDREN));

    let stats = instance.statistics().await;
    assert_eq!(stats.pages_audited, CHILDREN.len() + 1);
    assert_eq!(stats.elements_audited, element_count(&CHILDREN));
    assert_eq!(stats.urls_seen, CHILDREN.len() + 1);
    assert_eq!(stats.issues, element_count(&CHILDREN));
    assert_eq!(instance.issues().await.len(), element_count(&CHILDREN));
}

#[tokio::test]
async fn test_run_twice_is_refused() {
    let fetcher = Arc::new(SiteFetcher::new(site(&[])));
    let instance = solo(fetcher, Arc::new(RecordingChecker::default()));

    let runner = instance.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );

    // A finished scan reports its final status again
    assert_eq!(instance.run().await.unwrap(), Status::Done);
}

#[tokio::test]
async fn test_pushed_urls_are_deduplicated() {
    let fetcher = Arc::new(SiteFetcher::new(site(&[])));
    let instance = solo(fetcher, Arc::new(RecordingChecker::default()));

    assert!(instance.push_url("http://site.test/x", PushOptions::DEFAULT).await);
    assert!(!instance.push_url("http://site.test/x#top", PushOptions::DEFAULT).await);
    assert!(!instance.push_url("mailto:someone@site.test", PushOptions::DEFAULT).await);
}

// ============================================================================
// Queue Tests
// ============================================================================

#[tokio::test]
async fn test_failing_url_is_retried_up_to_max_tries() {
    let mut pages = site(&[]);
    if let Some(root) = pages.get_mut(ROOT) {
        root.links.push("http://site.test/broken".to_string());
    }
    let fetcher = Arc::new(SiteFetcher::new(pages));
    let mut opts = options(&[ROOT]);
    opts.queue.max_tries = 3;
    let instance = Arc::new(
        Instance::new(opts, fetcher.clone(), Arc::new(RecordingChecker::default())).unwrap(),
    );

    let runner = instance.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );

    assert_eq!(fetcher.attempts("http://site.test/broken"), 3);
    assert_eq!(fetcher.attempts(ROOT), 1);
    assert_eq!(instance.failures().await, ["http://site.test/broken"]);
    assert_eq!(instance.statistics().await.fetch_failures, 1);
}

#[tokio::test]
async fn test_page_limit_bounds_audits() {
    let fetcher = Arc::new(SiteFetcher::new(site(&CHILDREN)));
    let mut opts = options(&[ROOT]);
    opts.scope.page_limit = Some(2);
    let instance =
        Arc::new(Instance::new(opts, fetcher, Arc::new(RecordingChecker::default())).unwrap());

    let runner = instance.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );
    assert_eq!(instance.statistics().await.pages_audited, 2);
}

#[tokio::test]
async fn test_max_depth_stops_link_following() {
    let fetcher = Arc::new(SiteFetcher::new(site(&CHILDREN)));
    let mut opts = options(&[ROOT]);
    opts.scope.max_depth = Some(0);
    let instance = Arc::new(
        Instance::new(opts, fetcher.clone(), Arc::new(RecordingChecker::default())).unwrap(),
    );

    let runner = instance.clone();
    finish(tokio::spawn(async move { runner.run().await })).await;

    assert_eq!(instance.statistics().await.pages_audited, 1);
    assert_eq!(fetcher.attempts("http://site.test/a"), 0);
}

#[tokio::test]
async fn test_redirect_queues_target_without_spending_a_try() {
    let mut pages = site(&["new"]);
    if let Some(root) = pages.get_mut(ROOT) {
        root.links = vec!["http://site.test/old".to_string()];
    }
    let fetcher = Arc::new(
        SiteFetcher::new(pages).with_redirect("http://site.test/old", "http://site.test/new"),
    );
    let checker = Arc::new(RecordingChecker::default());
    let mut opts = options(&[ROOT]);
    opts.queue.max_tries = 1;
    let instance = Arc::new(Instance::new(opts, fetcher.clone(), checker.clone()).unwrap());

    let runner = instance.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );

    assert_eq!(fetcher.attempts("http://site.test/old"), 1);
    assert_eq!(fetcher.attempts("http://site.test/new"), 1);
    assert!(instance.failures().await.is_empty());
    let stats = instance.statistics().await;
    assert_eq!(stats.fetch_failures, 0);
    assert_eq!(stats.pages_audited, 2);
    checker.assert_audited_once(element_count(&["new"]));
}

/// Serves the site, except for one URL whose fetch panics.
struct PanickingFetcher {
    site: SiteFetcher,
    url: &'static str,
    panics: AtomicUsize,
}

#[async_trait]
impl Fetcher for PanickingFetcher {
    async fn fetch(&self, url: &str) -> Fetchable {
        if url == self.url {
            self.panics.fetch_add(1, Ordering::SeqCst);
            panic!("fetcher blew up on {}", url);
        }
        self.site.fetch(url).await
    }
}

#[tokio::test]
async fn test_panicking_fetch_counts_as_failed_fetch() {
    let boom = "http://site.test/boom";
    let mut pages = site(&CHILDREN);
    if let Some(root) = pages.get_mut(ROOT) {
        root.links.push(boom.to_string());
    }
    let fetcher = Arc::new(PanickingFetcher {
        site: SiteFetcher::new(pages),
        url: boom,
        panics: AtomicUsize::new(0),
    });
    let checker = Arc::new(RecordingChecker::default());
    let mut opts = options(&[ROOT]);
    opts.queue.max_tries = 2;
    let instance = Arc::new(Instance::new(opts, fetcher.clone(), checker.clone()).unwrap());

    let runner = instance.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );

    assert_eq!(fetcher.panics.load(Ordering::SeqCst), 2);
    assert_eq!(instance.failures().await, [boom]);
    assert_eq!(instance.statistics().await.fetch_failures, 1);
    assert!(
        instance
            .errors(0)
            .await
            .iter()
            .any(|error| error.contains(boom) && error.contains("died"))
    );
    checker.assert_audited_once(element_count(&CHILDREN));
}

// ============================================================================
// Explorer Tests
// ============================================================================

#[tokio::test]
async fn test_explored_pages_are_audited() {
    let fetcher = Arc::new(SiteFetcher::new(site(&[])));
    let checker = Arc::new(RecordingChecker::default());
    let explorer = DelayedExplorer::new(ROOT, dom_page(), Duration::from_millis(100));
    let instance = Arc::new(
        Instance::new(options(&[ROOT]), fetcher, checker.clone())
            .unwrap()
            .with_explorer(Arc::new(explorer)),
    );

    let runner = instance.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );

    checker.assert_audited_once(element_count(&[]) + 1);
    let dom_form = dom_page().elements[0].fingerprint();
    assert!(checker.audited().contains(&dom_form));
    assert_eq!(instance.statistics().await.pages_audited, 2);
}

// ============================================================================
// Pause / Abort Tests
// ============================================================================

#[tokio::test]
async fn test_pause_tokens_nest() {
    let fetcher = Arc::new(SiteFetcher::new(site(&CHILDREN)));
    let checker = Arc::new(RecordingChecker::default());
    let instance = solo(fetcher, checker.clone());

    let first = instance.pause(false).await;
    let second = instance.pause(false).await;

    let runner = instance.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    wait_until(|| instance.status() == Status::Paused).await;

    assert!(instance.resume(first));
    assert!(!instance.resume(first));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(instance.status(), Status::Paused);
    assert!(checker.audited().is_empty());

    assert!(instance.resume(second));
    assert_eq!(finish(handle).await, Status::Done);
    checker.assert_audited_once(element_count(&CHILDREN));
}

#[tokio::test]
async fn test_abort_while_paused() {
    let fetcher = Arc::new(SiteFetcher::new(site(&CHILDREN)));
    let checker = Arc::new(RecordingChecker::default());
    let instance = solo(fetcher, checker.clone());

    instance.pause(false).await;
    let runner = instance.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    wait_until(|| instance.status() == Status::Paused).await;

    instance.abort(true).await;

    assert_eq!(instance.status(), Status::Aborted);
    assert_eq!(finish(handle).await, Status::Aborted);
    assert!(checker.audited().is_empty());
}

// ============================================================================
// Suspend / Restore Tests
// ============================================================================

#[tokio::test]
async fn test_suspend_and_restore_resumes_without_repeats() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.json");
    let gate = Arc::new(Semaphore::new(1));
    let fetcher = Arc::new(SiteFetcher::gated(site(&CHILDREN), gate.clone()));
    let checker = Arc::new(RecordingChecker::default());

    let mut opts = options(&[ROOT]);
    opts.snapshot_path = Some(path.clone());
    let instance = Arc::new(Instance::new(opts, fetcher.clone(), checker.clone()).unwrap());

    let runner = instance.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    // Only the root can be fetched until the gate opens
    tokio::time::timeout(Duration::from_secs(10), async {
        while instance.local_statistics().await.pages_audited < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    instance.suspend(false).await.unwrap();
    gate.add_permits(100);
    assert_eq!(finish(handle).await, Status::Suspended);

    let saved = Snapshot::load(&path).await.unwrap();
    assert_eq!(saved.scan_id, instance.scan_id());
    assert!(saved.counters.pages_audited >= 1);
    assert!(saved.seen.urls.contains(ROOT));

    let restored = Arc::new(Instance::restore(saved.clone(), fetcher, checker.clone()).unwrap());
    let rebuilt = restored.snapshot().await;
    assert_eq!(rebuilt.seen, saved.seen);
    assert_eq!(rebuilt.element_filter, saved.element_filter);
    assert_eq!(rebuilt.redundancy, saved.redundancy);
    assert_eq!(rebuilt.url_queue, saved.url_queue);
    assert_eq!(rebuilt.page_queue, saved.page_queue);
    assert_eq!(rebuilt.counters, saved.counters);

    let runner = restored.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );
    checker.assert_audited_once(element_count(&CHILDREN));
    assert_eq!(
        restored.local_statistics().await.pages_audited,
        CHILDREN.len() + 1
    );
}

#[tokio::test]
async fn test_suspend_keeps_pages_the_explorer_still_owes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.json");
    let gate = Arc::new(Semaphore::new(1));
    let fetcher = Arc::new(SiteFetcher::gated(site(&CHILDREN), gate.clone()));
    let checker = Arc::new(RecordingChecker::default());
    let explorer = DelayedExplorer::new(ROOT, dom_page(), Duration::from_millis(300));

    let mut opts = options(&[ROOT]);
    opts.snapshot_path = Some(path.clone());
    let instance = Arc::new(
        Instance::new(opts, fetcher.clone(), checker.clone())
            .unwrap()
            .with_explorer(Arc::new(explorer)),
    );

    let runner = instance.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    // The root is audited, so its exploration is already under way
    tokio::time::timeout(Duration::from_secs(10), async {
        while instance.local_statistics().await.pages_audited < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    instance.suspend(false).await.unwrap();
    gate.add_permits(100);
    assert_eq!(finish(handle).await, Status::Suspended);

    let saved = Snapshot::load(&path).await.unwrap();
    let restored = Arc::new(Instance::restore(saved, fetcher, checker.clone()).unwrap());
    let runner = restored.clone();
    assert_eq!(
        finish(tokio::spawn(async move { runner.run().await })).await,
        Status::Done
    );

    checker.assert_audited_once(element_count(&CHILDREN) + 1);
    let dom_form = dom_page().elements[0].fingerprint();
    assert!(checker.audited().contains(&dom_form));
}

#[tokio::test]
async fn test_snapshot_version_is_checked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.json");
    let instance = solo(
        Arc::new(SiteFetcher::new(site(&[]))),
        Arc::new(RecordingChecker::default()),
    );

    let mut snapshot = instance.snapshot().await;
    snapshot.version += 1;
    snapshot.save(&path).await.unwrap();

    assert!(matches!(
        Snapshot::load(&path).await,
        Err(EngineError::Snapshot(_))
    ));
}
