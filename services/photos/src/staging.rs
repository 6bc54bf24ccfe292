use crate::naming::{make_unique, NamingCandidate};
use crate::queue::QueueError;
use crate::stage::{
    DispatchPolicy, PhotoRef, PhotoSink, Stage, StageError, StageHandler, StageSnapshot,
};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Final pipeline stage: moves photos into the slideshow directory.
///
/// Names are chosen with [`make_unique`], which checks for a free name and
/// then moves into it. That is only safe while a single task owns the
/// directory, so the default policy for this stage is
/// [`DispatchPolicy::Serial`].
pub struct StagingStage {
    stage: Stage,
    stage_dir: PathBuf,
}

struct Stager {
    stage_dir: PathBuf,
}

#[async_trait]
impl StageHandler for Stager {
    async fn handle(&self, photo: PhotoRef) -> Result<(), StageError> {
        let from = photo.into_path_buf();
        let candidate = NamingCandidate::from_path(&from);

        let to = match make_unique(&self.stage_dir, &candidate.base, &candidate.extension).await {
            Ok(to) => to,
            Err(source) => {
                return Err(StageError::Move {
                    to: self.stage_dir.join(candidate.file_name(0)),
                    from,
                    source,
                })
            }
        };

        if let Err(source) = move_file(&from, &to).await {
            return Err(StageError::Move { from, to, source });
        }

        info!(from = %from.display(), to = %to.display(), "Staged photo");
        Ok(())
    }
}

/// Rename, falling back to copy + remove only when the rename would cross
/// filesystems.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    let rename_err = match tokio::fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) if crosses_devices(&e) => e,
        Err(e) => return Err(e),
    };

    debug!(error = %rename_err, "Rename crosses filesystems, copying instead");

    if let Err(e) = tokio::fs::copy(from, to).await {
        discard_partial(to).await;
        return Err(e);
    }

    // Keep exactly one copy: the original stays if it cannot be removed.
    if let Err(e) = tokio::fs::remove_file(from).await {
        discard_partial(to).await;
        return Err(e);
    }

    Ok(())
}

fn crosses_devices(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::CrossesDevices
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial copy");
        }
    }
}

impl StagingStage {
    /// Start the staging stage. `stage_dir` must already exist.
    pub fn new(stage_dir: impl Into<PathBuf>, capacity: usize, policy: DispatchPolicy) -> Self {
        let stage_dir = stage_dir.into();

        if policy == DispatchPolicy::Concurrent {
            warn!(
                dir = %stage_dir.display(),
                "Staging with concurrent dispatch; colliding names may overwrite each other"
            );
        }

        let stager = Arc::new(Stager {
            stage_dir: stage_dir.clone(),
        });
        let stage = Stage::spawn("staging", capacity, policy, stager);

        Self { stage, stage_dir }
    }

    pub fn stage_dir(&self) -> &Path {
        &self.stage_dir
    }

    /// Wait for the dispatcher to exit after [`PhotoSink::shutdown`].
    pub async fn join(&self) {
        self.stage.join().await;
    }

    pub fn stats(&self) -> StageSnapshot {
        self.stage.stats()
    }
}

#[async_trait]
impl PhotoSink for StagingStage {
    async fn submit(&self, photo: PhotoRef) -> Result<(), QueueError> {
        self.stage.submit(photo).await
    }

    fn shutdown(&self) {
        self.stage.shutdown();
    }
}
