use crate::config::{BackupConfig, BackupKind, S3Config};
use crate::queue::QueueError;
use crate::stage::{
    DispatchPolicy, PhotoRef, PhotoSink, Stage, StageError, StageHandler, StageSnapshot,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors from an off-site backup
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("S3 {operation} failed: {message}")]
    S3 {
        operation: &'static str,
        message: String,
    },

    #[error("Backup target misconfigured: {0}")]
    Config(String),
}

impl BackupError {
    fn s3<E: std::error::Error>(operation: &'static str, err: E) -> Self {
        BackupError::S3 {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        }
    }
}

/// Where photos are copied for safekeeping
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupTarget: Send + Sync {
    async fn backup(&self, path: &Path) -> Result<(), BackupError>;
}

/// Build the configured backup target.
pub async fn target_from_config(
    config: &BackupConfig,
) -> Result<Arc<dyn BackupTarget>, BackupError> {
    match config.target {
        BackupKind::Log => Ok(Arc::new(LogBackup)),
        BackupKind::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| BackupError::Config("backup.s3 section is missing".to_string()))?;
            Ok(Arc::new(S3Backup::new(s3).await))
        }
    }
}

/// Backup target that only records the backup in the logs.
pub struct LogBackup;

#[async_trait]
impl BackupTarget for LogBackup {
    async fn backup(&self, path: &Path) -> Result<(), BackupError> {
        info!(path = %path.display(), "Backing up photo");
        info!(path = %path.display(), "Done backing up photo");
        Ok(())
    }
}

/// S3 backup target
pub struct S3Backup {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Backup {
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.key_prefix,
            "S3 backup initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    async fn simple_upload(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackupError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BackupError::s3("PutObject", e))?;

        Ok(())
    }

    async fn multipart_upload(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), BackupError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BackupError::s3("CreateMultipartUpload", e))?;

        let upload_id = create_response.upload_id().ok_or_else(|| BackupError::S3 {
            operation: "CreateMultipartUpload",
            message: "no upload ID in response".to_string(),
        })?;

        match self.upload_parts(key, upload_id, data).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| BackupError::s3("CompleteMultipartUpload", e))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: &[u8],
    ) -> Result<Vec<CompletedPart>, BackupError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in data.chunks(self.config.part_size_bytes.max(1)).enumerate() {
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| BackupError::s3("UploadPart", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BackupTarget for S3Backup {
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path.display()))]
    async fn backup(&self, path: &Path) -> Result<(), BackupError> {
        let data = tokio::fs::read(path).await.map_err(|source| BackupError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let key = object_key(&self.config.key_prefix, path);
        let content_type = content_type(path);

        debug!(key = %key, size_bytes = data.len(), "Uploading photo to S3");

        let size_bytes = data.len();
        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(&key, &data, content_type).await?;
        } else {
            self.simple_upload(&key, data, content_type).await?;
        }

        info!(key = %key, size_bytes, "Photo backed up to S3");
        Ok(())
    }
}

/// Object key for a photo: `<prefix>/<file name>`.
pub fn object_key(prefix: &str, path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| sanitize_key_component(&n.to_string_lossy()))
        .unwrap_or_default();

    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file_name
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

fn sanitize_key_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "heic" => "image/heic",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// First pipeline stage: copy each photo off-site, then hand it to staging.
pub struct BackupStage {
    stage: Stage,
    worker: Arc<BackupWorker>,
}

struct BackupWorker {
    target: Arc<dyn BackupTarget>,
    staging: Arc<dyn PhotoSink>,
    failures: AtomicU64,
}

#[async_trait]
impl StageHandler for BackupWorker {
    async fn handle(&self, photo: PhotoRef) -> Result<(), StageError> {
        match self.target.backup(photo.path()).await {
            Ok(()) => debug!(path = %photo, "Backup complete"),
            Err(e) => {
                // The photo is staged whether or not the off-site copy worked.
                self.failures.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("photos.backup.failed").increment(1);
                warn!(path = %photo, error = %e, "Backup failed, forwarding to staging anyway");
            }
        }

        self.staging.submit(photo).await?;
        Ok(())
    }
}

impl BackupStage {
    /// Start the backup stage, forwarding every photo to `staging`.
    pub fn new(
        target: Arc<dyn BackupTarget>,
        staging: Arc<dyn PhotoSink>,
        capacity: usize,
        policy: DispatchPolicy,
    ) -> Self {
        let worker = Arc::new(BackupWorker {
            target,
            staging,
            failures: AtomicU64::new(0),
        });

        let stage = Stage::spawn("backup", capacity, policy, worker.clone());

        Self { stage, worker }
    }

    /// Wait for the dispatcher to exit after [`PhotoSink::shutdown`].
    pub async fn join(&self) {
        self.stage.join().await;
    }

    pub fn stats(&self) -> StageSnapshot {
        self.stage.stats()
    }

    /// Number of backups that failed (and were staged anyway).
    pub fn backup_failures(&self) -> u64 {
        self.worker.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhotoSink for BackupStage {
    async fn submit(&self, photo: PhotoRef) -> Result<(), QueueError> {
        self.stage.submit(photo).await
    }

    fn shutdown(&self) {
        self.stage.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::MockPhotoSink;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn forwarding_sink(tx: mpsc::UnboundedSender<PhotoRef>) -> MockPhotoSink {
        let mut sink = MockPhotoSink::new();
        sink.expect_submit().returning(move |photo| {
            tx.send(photo).ok();
            Ok(())
        });
        sink
    }

    async fn wait_for(stage: &BackupStage, done: impl Fn(&StageSnapshot) -> bool) -> StageSnapshot {
        timeout(Duration::from_secs(5), async {
            loop {
                let stats = stage.stats();
                if done(&stats) {
                    return stats;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backup stage did not settle")
    }

    #[tokio::test]
    async fn test_backup_then_forward() {
        let mut target = MockBackupTarget::new();
        target
            .expect_backup()
            .withf(|path| path == Path::new("/photos/a.jpg"))
            .times(1)
            .returning(|_| Ok(()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stage = BackupStage::new(
            Arc::new(target),
            Arc::new(forwarding_sink(tx)),
            4,
            DispatchPolicy::Concurrent,
        );

        stage.submit(PhotoRef::new("/photos/a.jpg")).await.unwrap();

        let forwarded = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(forwarded, Some(PhotoRef::new("/photos/a.jpg")));

        let stats = wait_for(&stage, |s| s.succeeded == 1).await;
        assert_eq!(stats.failed, 0);
        assert_eq!(stage.backup_failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_backup_is_still_forwarded() {
        let mut target = MockBackupTarget::new();
        target.expect_backup().times(1).returning(|_| {
            Err(BackupError::S3 {
                operation: "PutObject",
                message: "bucket unavailable".to_string(),
            })
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stage = BackupStage::new(
            Arc::new(target),
            Arc::new(forwarding_sink(tx)),
            4,
            DispatchPolicy::Concurrent,
        );

        stage.submit(PhotoRef::new("/photos/b.jpg")).await.unwrap();

        let forwarded = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(forwarded, Some(PhotoRef::new("/photos/b.jpg")));

        let stats = wait_for(&stage, |s| s.succeeded == 1).await;
        assert_eq!(stats.failed, 0);
        assert_eq!(stage.backup_failures(), 1);
    }

    #[tokio::test]
    async fn test_rejected_forward_fails_the_task() {
        let mut target = MockBackupTarget::new();
        target.expect_backup().returning(|_| Ok(()));

        let mut sink = MockPhotoSink::new();
        sink.expect_submit()
            .times(1)
            .returning(|_| Err(QueueError::Closed("staging")));

        let stage = BackupStage::new(Arc::new(target), Arc::new(sink), 4, DispatchPolicy::Serial);
        stage.submit(PhotoRef::new("/photos/c.jpg")).await.unwrap();

        let stats = wait_for(&stage, |s| s.failed == 1).await;
        assert_eq!(stats.succeeded, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_photos() {
        let target = MockBackupTarget::new();
        let sink = MockPhotoSink::new();
        let stage = BackupStage::new(
            Arc::new(target),
            Arc::new(sink),
            4,
            DispatchPolicy::Concurrent,
        );

        stage.shutdown();
        assert!(stage.submit(PhotoRef::new("/photos/d.jpg")).await.is_err());

        timeout(Duration::from_secs(1), stage.join()).await.unwrap();
        assert_eq!(stage.stats().dispatched, 0);
    }

    #[tokio::test]
    async fn test_log_backup_always_succeeds() {
        assert!(LogBackup.backup(Path::new("/photos/missing.jpg")).await.is_ok());
    }

    #[test]
    fn test_object_key() {
        let path = Path::new("/slideshow/2023-04-01-10-15-30.jpg");
        assert_eq!(object_key("photos/", path), "photos/2023-04-01-10-15-30.jpg");
        assert_eq!(object_key("", path), "2023-04-01-10-15-30.jpg");
        assert_eq!(object_key("a/b", Path::new("/x/my photo.jpg")), "a/b/my_photo.jpg");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(content_type(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(content_type(Path::new("a.png")), "image/png");
        assert_eq!(content_type(Path::new("a")), "application/octet-stream");
    }
}
