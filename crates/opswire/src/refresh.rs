//! Refresh coordinator: collapses push-triggered refetch storms into a
//! bounded trickle while letting high-priority requests jump the queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::RefreshConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPriority {
    /// Deferred and coalesced with nearby requests.
    Normal,
    /// Runs right away, still honoring the minimum inter-refresh spacing.
    Immediate,
}

#[derive(Debug, thiserror::Error)]
#[error("refresh failed: {0}")]
pub struct RefreshError(pub String);

pub type RefetchFuture = Pin<Box<dyn Future<Output = Result<(), RefreshError>> + Send>>;
pub type RefetchFn = Arc<dyn Fn() -> RefetchFuture + Send + Sync>;

/// Owns the scheduling state and the injected refetch function. Requests
/// are messages; the actor folds them into at most one pending deadline.
pub struct RefreshCoordinator {
    tx: mpsc::UnboundedSender<RefreshPriority>,
    last_error: watch::Receiver<Option<String>>,
    task: Option<JoinHandle<()>>,
}

/// Cheap clonable handle for wiring event listeners to the coordinator.
#[derive(Clone)]
pub struct RefreshRequester {
    tx: mpsc::UnboundedSender<RefreshPriority>,
}

impl RefreshRequester {
    pub fn request(&self, priority: RefreshPriority) {
        let _ = self.tx.send(priority);
    }
}

impl RefreshCoordinator {
    pub fn new(config: RefreshConfig, refetch: RefetchFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (error_tx, last_error) = watch::channel(None);
        let task = tokio::spawn(run(config, refetch, rx, error_tx));
        Self {
            tx,
            last_error,
            task: Some(task),
        }
    }

    pub fn request(&self, priority: RefreshPriority) {
        let _ = self.tx.send(priority);
    }

    pub fn requester(&self) -> RefreshRequester {
        RefreshRequester {
            tx: self.tx.clone(),
        }
    }

    /// Outcome of the most recent refetch: `None` after a success, the
    /// error text after a failure.
    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error.clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    config: RefreshConfig,
    refetch: RefetchFn,
    mut rx: mpsc::UnboundedReceiver<RefreshPriority>,
    error_tx: watch::Sender<Option<String>>,
) {
    let mut last_run: Option<Instant> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(priority) = request else { break };
                let now = Instant::now();
                let mut target = match priority {
                    RefreshPriority::Immediate => now,
                    RefreshPriority::Normal => now + config.coalesce_window,
                };
                if let Some(at) = last_run {
                    target = target.max(at + config.min_spacing);
                }
                // An earlier pending deadline wins; a later one is pulled
                // forward by an immediate request.
                deadline = Some(match deadline {
                    Some(existing) => existing.min(target),
                    None => target,
                });
            }
            _ = wait_until(deadline), if deadline.is_some() => {
                deadline = None;
                let started = Instant::now();
                match (refetch)().await {
                    Ok(()) => {
                        let _ = error_tx.send(None);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "scheduled refresh failed");
                        let _ = error_tx.send(Some(err.to_string()));
                    }
                }
                // A failed refetch still counts for spacing; the next
                // request schedules normally.
                last_run = Some(started);
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
