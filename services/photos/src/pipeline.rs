use crate::backup::{BackupStage, BackupTarget};
use crate::config::PipelineConfig;
use crate::queue::QueueError;
use crate::stage::{PhotoRef, PhotoSink, StageSnapshot};
use crate::staging::StagingStage;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Backup stage feeding the staging stage.
pub struct Pipeline {
    backup: Arc<BackupStage>,
    staging: Arc<StagingStage>,
}

/// Counters for both stages
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PipelineSnapshot {
    pub backup: StageSnapshot,
    pub backup_failures: u64,
    pub staging: StageSnapshot,
}

impl Pipeline {
    /// Build both stages and start their dispatchers.
    pub fn start(
        settings: &PipelineConfig,
        show_path: impl Into<PathBuf>,
        target: Arc<dyn BackupTarget>,
    ) -> Self {
        let staging = Arc::new(StagingStage::new(
            show_path,
            settings.staging_queue_size,
            settings.staging_dispatch,
        ));

        let backup = Arc::new(BackupStage::new(
            target,
            staging.clone(),
            settings.backup_queue_size,
            settings.backup_dispatch,
        ));

        Self { backup, staging }
    }

    /// Stop both stages, backup first, and wait for their dispatchers.
    ///
    /// Backup tasks still running when this returns may find staging closed;
    /// their photos stay in the upload directory.
    pub async fn shutdown(&self) {
        self.backup.shutdown();
        self.backup.join().await;

        self.staging.shutdown();
        self.staging.join().await;

        info!(stats = ?self.snapshot(), "Pipeline stopped");
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            backup: self.backup.stats(),
            backup_failures: self.backup.backup_failures(),
            staging: self.staging.stats(),
        }
    }

    pub fn backup(&self) -> &BackupStage {
        &self.backup
    }

    pub fn staging(&self) -> &StagingStage {
        &self.staging
    }
}

#[async_trait]
impl PhotoSink for Pipeline {
    async fn submit(&self, photo: PhotoRef) -> Result<(), QueueError> {
        self.backup.submit(photo).await
    }

    fn shutdown(&self) {
        self.backup.shutdown();
        self.staging.shutdown();
    }
}
