//! Scan lifecycle: status, pause tokens, abort and suspend flags.
//!
//! All signals live in one `watch` channel. The audit loop observes them at
//! its suspension points through [`ScanState::checkpoint`]; callers that want
//! to wait for an outcome subscribe to the same channel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ready,
    Preparing,
    Scanning,
    Pausing,
    Paused,
    Suspending,
    Suspended,
    Cleanup,
    Aborted,
    Done,
}

impl Status {
    pub fn is_finished(&self) -> bool {
        matches!(self, Status::Suspended | Status::Aborted | Status::Done)
    }

    /// Whether a loop is currently driving the scan.
    pub fn is_running(&self) -> bool {
        !matches!(self, Status::Ready) && !self.is_finished()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ready => "ready",
            Status::Preparing => "preparing",
            Status::Scanning => "scanning",
            Status::Pausing => "pausing",
            Status::Paused => "paused",
            Status::Suspending => "suspending",
            Status::Suspended => "suspended",
            Status::Cleanup => "cleanup",
            Status::Aborted => "aborted",
            Status::Done => "done",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type PauseToken = u64;

#[derive(Debug, Clone, Default)]
struct Signals {
    status: Status,
    pause_tokens: BTreeSet<PauseToken>,
    abort: bool,
    suspend: bool,
}

/// What the loop must do after a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Abort,
    Suspend,
}

pub struct ScanState {
    signals: watch::Sender<Signals>,
    next_token: AtomicU64,
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanState {
    pub fn new() -> Self {
        let (signals, _) = watch::channel(Signals::default());
        Self {
            signals,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn status(&self) -> Status {
        self.signals.borrow().status
    }

    pub fn set_status(&self, status: Status) {
        self.signals.send_if_modified(|signals| {
            if signals.status == status {
                return false;
            }
            signals.status = status;
            true
        });
    }

    /// Move from `from` to `to`. Returns false, changing nothing, when the
    /// status is anything other than `from`.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.signals.send_if_modified(|signals| {
            if signals.status != from {
                return false;
            }
            signals.status = to;
            true
        })
    }

    /// Leave `preparing`. Pauses requested in the meantime take effect.
    pub fn start_scanning(&self) {
        self.signals.send_if_modified(|signals| {
            if signals.status != Status::Preparing {
                return false;
            }
            signals.status = if signals.pause_tokens.is_empty() {
                Status::Scanning
            } else {
                Status::Pausing
            };
            true
        });
    }

    pub fn is_paused(&self) -> bool {
        !self.signals.borrow().pause_tokens.is_empty()
    }

    pub fn abort_requested(&self) -> bool {
        self.signals.borrow().abort
    }

    /// Request a pause. Pauses nest: the scan only resumes once every token
    /// handed out has been given back.
    pub async fn pause(&self, wait: bool) -> PauseToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.signals.send_modify(|signals| {
            signals.pause_tokens.insert(token);
            if matches!(signals.status, Status::Preparing | Status::Scanning) {
                signals.status = Status::Pausing;
            }
        });

        if wait {
            self.wait_until(|signals| signals.status != Status::Pausing)
                .await;
        }
        token
    }

    /// Give back a pause token. Returns false for unknown tokens.
    pub fn resume(&self, token: PauseToken) -> bool {
        let mut known = false;
        self.signals.send_if_modified(|signals| {
            known = signals.pause_tokens.remove(&token);
            if known
                && signals.pause_tokens.is_empty()
                && matches!(signals.status, Status::Pausing | Status::Paused)
            {
                signals.status = Status::Scanning;
            }
            known
        });
        known
    }

    pub async fn abort(&self, wait: bool) {
        self.signals.send_modify(|signals| signals.abort = true);
        if wait && self.status().is_running() {
            self.wait_until_finished().await;
        }
    }

    pub async fn suspend(&self, wait: bool) {
        self.signals.send_modify(|signals| {
            signals.suspend = true;
            if signals.status.is_running() {
                signals.status = Status::Suspending;
            }
        });
        if wait && self.status().is_running() {
            self.wait_until_finished().await;
        }
    }

    /// Suspension point. Blocks while paused, then reports pending abort or
    /// suspend requests.
    pub async fn checkpoint(&self) -> Checkpoint {
        let mut receiver = self.signals.subscribe();
        loop {
            let blocked = {
                let signals = receiver.borrow_and_update();
                if signals.abort {
                    return Checkpoint::Abort;
                }
                if signals.suspend {
                    return Checkpoint::Suspend;
                }
                !signals.pause_tokens.is_empty()
            };
            if !blocked {
                return Checkpoint::Continue;
            }

            self.signals.send_if_modified(|signals| {
                if signals.status == Status::Pausing {
                    signals.status = Status::Paused;
                    return true;
                }
                false
            });
            if receiver.changed().await.is_err() {
                return Checkpoint::Abort;
            }
        }
    }

    /// Sleep until any signal changes or `timeout` elapses.
    pub async fn wait_for_change(&self, timeout: Duration) {
        let mut receiver = self.signals.subscribe();
        receiver.borrow_and_update();
        let _ = tokio::time::timeout(timeout, receiver.changed()).await;
    }

    pub async fn wait_until_finished(&self) -> Status {
        self.wait_until(|signals| signals.status.is_finished()).await;
        self.status()
    }

    async fn wait_until(&self, predicate: impl Fn(&Signals) -> bool) {
        let mut receiver = self.signals.subscribe();
        let _ = receiver.wait_for(|signals| predicate(signals)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pause_is_reference_counted() {
        let state = ScanState::new();
        state.set_status(Status::Scanning);

        let first = state.pause(false).await;
        let second = state.pause(false).await;
        assert_eq!(state.status(), Status::Pausing);

        assert!(state.resume(first));
        assert!(state.is_paused());
        assert_eq!(state.status(), Status::Pausing);

        assert!(state.resume(second));
        assert!(!state.is_paused());
        assert_eq!(state.status(), Status::Scanning);
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let state = ScanState::new();
        assert!(!state.resume(999));
        let token = state.pause(false).await;
        assert!(state.resume(token));
        assert!(!state.resume(token));
    }

    #[tokio::test]
    async fn test_checkpoint_blocks_until_resumed() {
        let state = Arc::new(ScanState::new());
        state.set_status(Status::Scanning);
        let token = state.pause(false).await;

        let loop_state = state.clone();
        let handle = tokio::spawn(async move { loop_state.checkpoint().await });

        state
            .wait_until(|signals| signals.status == Status::Paused)
            .await;
        assert!(!handle.is_finished());

        state.resume(token);
        assert_eq!(handle.await.unwrap(), Checkpoint::Continue);
        assert_eq!(state.status(), Status::Scanning);
    }

    #[tokio::test]
    async fn test_pause_wait_returns_once_paused() {
        let state = Arc::new(ScanState::new());
        state.set_status(Status::Scanning);

        let loop_state = state.clone();
        let checkpoint = tokio::spawn(async move {
            loop {
                match loop_state.checkpoint().await {
                    Checkpoint::Continue => tokio::task::yield_now().await,
                    other => return other,
                }
            }
        });

        let token = state.pause(true).await;
        assert_eq!(state.status(), Status::Paused);

        state.abort(false).await;
        assert_eq!(checkpoint.await.unwrap(), Checkpoint::Abort);
        assert!(state.resume(token));
    }

    #[tokio::test]
    async fn test_suspend_is_observed_at_checkpoint() {
        let state = ScanState::new();
        state.set_status(Status::Scanning);
        state.suspend(false).await;
        assert_eq!(state.status(), Status::Suspending);
        assert_eq!(state.checkpoint().await, Checkpoint::Suspend);
    }
}
