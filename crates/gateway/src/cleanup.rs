//! Per-request scoped cleanup.
//!
//! A [`CleanupManager`] collects release callbacks for the resources one
//! request owns (transport token, ephemeral server) and guarantees they run
//! exactly once, whether the request finishes, the client disconnects, the
//! gateway shuts down, or several of those happen at once.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type ReleaseFn = BoxFuture<'static, anyhow::Result<()>>;

pub struct CleanupManager {
    profile: String,
    triggered: AtomicBool,
    callbacks: Mutex<Vec<ReleaseFn>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupManager {
    pub fn new(profile: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            profile: profile.into(),
            triggered: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Append a release callback. Callbacks run concurrently with each other
    /// and independently: one failing does not stop the others.
    pub fn register<F>(&self, release: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.lock().push(Box::pin(release));
    }

    /// Run cleanup when `token` fires. The watcher hands off to a detached
    /// task so that aborting watchers inside [`CleanupManager::run`] can
    /// never cancel an in-flight cleanup.
    pub fn watch(self: &Arc<Self>, token: CancellationToken) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            let manager_for_run = manager.clone();
            tokio::spawn(async move {
                manager_for_run.run(None).await;
            });
        });
        self.watchers.lock().push(handle);
    }

    /// At-most-once: the first caller wins, later calls (and later watcher
    /// firings) are no-ops. Watchers are detached before any callback runs,
    /// so a callback cancelling a watched token cannot re-enter.
    pub async fn run(&self, cause: Option<String>) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cause) = cause {
            tracing::warn!(
                profile = %self.profile,
                cause = %cause,
                "request ended with an error; releasing its resources"
            );
        }

        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            watcher.abort();
        }

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for result in futures::future::join_all(callbacks).await {
            if let Err(err) = result {
                tracing::warn!(
                    profile = %self.profile,
                    error = %err,
                    "cleanup callback failed"
                );
            }
        }
    }
}

/// Fires the manager when dropped. Attached to the response body stream so
/// close, finish and error all funnel into the same single cleanup run.
pub struct CleanupGuard {
    manager: Arc<CleanupManager>,
}

impl CleanupGuard {
    pub fn new(manager: Arc<CleanupManager>) -> Self {
        Self { manager }
    }

    fn trigger(&self, cause: Option<String>) {
        let manager = self.manager.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager.run(cause).await;
            });
        }
    }

    /// Trigger cleanup now with an error cause (stream error path).
    pub fn fail(&self, cause: String) {
        self.trigger(Some(cause));
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.trigger(None);
    }
}
