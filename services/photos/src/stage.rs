//! Queue + dispatcher pairs.
//!
//! A [`Stage`] owns one [`WorkQueue`] and the single task that drains it. What
//! happens to each dequeued photo is supplied as a [`StageHandler`]; how the
//! handler is run is chosen with a [`DispatchPolicy`] when the stage is built.

use crate::queue::{QueueError, WorkQueue};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// A photo in the pipeline, identified by where it currently lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhotoRef(PathBuf);

impl PhotoRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl From<PathBuf> for PhotoRef {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl fmt::Display for PhotoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Anything photos can be handed to: a stage, or the whole pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotoSink: Send + Sync {
    /// Enqueue a photo, waiting while the queue is full.
    async fn submit(&self, photo: PhotoRef) -> Result<(), QueueError>;

    /// Stop accepting photos. Work already accepted is not cancelled.
    fn shutdown(&self);
}

/// Errors from processing a single photo inside a stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to forward photo: {0}")]
    Forward(#[from] QueueError),

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Work performed for each dequeued photo.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    async fn handle(&self, photo: PhotoRef) -> Result<(), StageError>;
}

/// How a dispatcher runs its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Spawn one task per item; no limit on items in flight
    Concurrent,
    /// Run each item to completion on the dispatcher before taking the next
    Serial,
}

/// Per-stage counters.
#[derive(Debug, Default)]
pub struct StageStats {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

/// Point-in-time copy of [`StageStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub submitted: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: u64,
    /// Highest number of items ever handled at the same time
    pub peak_in_flight: u64,
}

impl StageStats {
    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            dispatched: self.dispatched.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    fn begin(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a StageStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bounded queue plus the dispatcher task draining it.
pub struct Stage {
    queue: WorkQueue<PhotoRef>,
    policy: DispatchPolicy,
    stats: Arc<StageStats>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Stage {
    /// Build the stage and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        name: &'static str,
        capacity: usize,
        policy: DispatchPolicy,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        let (queue, rx) = WorkQueue::bounded(name, capacity);
        let stats = Arc::new(StageStats::default());

        let dispatcher = tokio::spawn(dispatch(name, rx, policy, handler, stats.clone()));

        info!(
            stage = name,
            capacity = queue.capacity(),
            policy = ?policy,
            "Stage started"
        );

        Self {
            queue,
            policy,
            stats,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.queue.name()
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Enqueue a photo, waiting while the queue is full.
    pub async fn submit(&self, photo: PhotoRef) -> Result<(), QueueError> {
        debug!(stage = self.name(), path = %photo, "Submitting photo");

        self.queue.push(photo).await?;

        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("photos.stage.submitted", "stage" => self.name()).increment(1);
        Ok(())
    }

    /// Close the queue. The dispatcher exits after draining what is buffered.
    pub fn shutdown(&self) {
        if !self.queue.is_closed() {
            info!(stage = self.name(), pending = self.queue.len(), "Shutting down stage");
        }
        self.queue.close();
    }

    /// Wait for the dispatcher loop to exit. Returns at once on later calls.
    ///
    /// Items handed to their own task under [`DispatchPolicy::Concurrent`] may
    /// still be running afterwards.
    pub async fn join(&self) {
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(stage = self.name(), error = %e, "Dispatcher task failed");
            }
        }
    }

    pub fn stats(&self) -> StageSnapshot {
        self.stats.snapshot()
    }
}

async fn dispatch(
    name: &'static str,
    mut rx: mpsc::Receiver<PhotoRef>,
    policy: DispatchPolicy,
    handler: Arc<dyn StageHandler>,
    stats: Arc<StageStats>,
) {
    while let Some(photo) = rx.recv().await {
        stats.dispatched.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("photos.stage.dispatched", "stage" => name).increment(1);

        match policy {
            DispatchPolicy::Serial => run_one(name, handler.as_ref(), &stats, photo).await,
            DispatchPolicy::Concurrent => {
                let handler = handler.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    run_one(name, handler.as_ref(), &stats, photo).await;
                });
            }
        }
    }

    info!(stage = name, "Queue closed, dispatcher exiting");
}

#[instrument(skip_all, fields(stage = name, path = %photo))]
async fn run_one(
    name: &'static str,
    handler: &dyn StageHandler,
    stats: &StageStats,
    photo: PhotoRef,
) {
    let _in_flight = stats.begin();

    match handler.handle(photo).await {
        Ok(()) => {
            stats.succeeded.fetch_add(1, Ordering::SeqCst);
            metrics::counter!("photos.stage.succeeded", "stage" => name).increment(1);
        }
        Err(e) => {
            // Dropped here; nothing requeues a failed item.
            stats.failed.fetch_add(1, Ordering::SeqCst);
            metrics::counter!("photos.stage.failed", "stage" => name).increment(1);
            error!(error = %e, "Photo dropped from pipeline");
        }
    }
}
