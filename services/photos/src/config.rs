use crate::stage::DispatchPolicy;
use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Main configuration for the photos service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Directory layout
    #[serde(default)]
    pub storage: StorageConfig,
    /// Stage queue sizes and dispatch
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Off-site backup target
    #[serde(default)]
    pub backup: BackupConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus exporter port; no exporter when unset
    pub metrics_port: Option<u16>,
    /// File holding the version reported by the healthcheck
    pub version_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// API configuration for the upload endpoint and UI
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Multipart form name that carries uploaded photos
    #[serde(default = "default_upload_tag")]
    pub upload_tag: String,
    /// Request body limit for uploads
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Directory layout
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Where uploads are first written
    #[serde(default = "default_photos_path")]
    pub photos_path: PathBuf,
    /// Slideshow directory staged photos are moved into
    #[serde(default = "default_show_path")]
    pub show_path: PathBuf,
    /// Static UI build served under /ui
    #[serde(default = "default_ui_path")]
    pub ui_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_size")]
    pub backup_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub staging_queue_size: usize,
    #[serde(default = "default_backup_dispatch")]
    pub backup_dispatch: DispatchPolicy,
    #[serde(default = "default_staging_dispatch")]
    pub staging_dispatch: DispatchPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Log each backup and do nothing else
    #[default]
    Log,
    /// Upload to an S3 bucket
    S3,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub target: BackupKind,
    /// Required when `target` is `s3`
    pub s3: Option<S3Config>,
}

/// S3 backup configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for photo backups
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Prepended to every object key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "photopi-api".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_upload_tag() -> String {
    "uploadImages".to_string()
}

fn default_max_upload_bytes() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_true() -> bool {
    true
}

fn default_photos_path() -> PathBuf {
    PathBuf::from("./piphotos")
}

fn default_show_path() -> PathBuf {
    PathBuf::from("./slideshow")
}

fn default_ui_path() -> PathBuf {
    PathBuf::from("./ui/build")
}

fn default_queue_size() -> usize {
    25
}

fn default_backup_dispatch() -> DispatchPolicy {
    DispatchPolicy::Concurrent
}

fn default_staging_dispatch() -> DispatchPolicy {
    DispatchPolicy::Serial
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "photos".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/photos").required(false))
            .add_source(config::File::with_name("/etc/photopi/photos").required(false))
            // Override with environment variables
            // PHOTOPI__STORAGE__SHOW_PATH -> storage.show_path
            .add_source(
                config::Environment::with_prefix("PHOTOPI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.api.upload_tag.is_empty() {
            return Err(ConfigValidationError::MissingField("api.upload_tag".to_string()));
        }

        if self.api.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_upload_bytes".to_string(),
                message: "Limit must be greater than 0".to_string(),
            });
        }

        if self.pipeline.backup_queue_size == 0 || self.pipeline.staging_queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.backup_queue_size/staging_queue_size".to_string(),
                message: "Queue sizes must be greater than 0".to_string(),
            });
        }

        if self.backup.target == BackupKind::S3 {
            let s3 = self
                .backup
                .s3
                .as_ref()
                .ok_or_else(|| ConfigValidationError::MissingField("backup.s3".to_string()))?;

            if s3.bucket.is_empty() {
                return Err(ConfigValidationError::MissingField("backup.s3.bucket".to_string()));
            }

            // S3 rejects parts below 5MB except the last one
            if s3.part_size_bytes < 5 * 1024 * 1024 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "backup.s3.part_size_bytes".to_string(),
                    message: "Part size must be at least 5MB".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Version reported by the healthcheck.
    pub fn version(&self) -> anyhow::Result<String> {
        match &self.service.version_file {
            Some(path) => read_version(path),
            None => Ok(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

impl ApiConfig {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid API listen address {}:{}", self.host, self.port))
    }
}

/// Read a version file and check that it holds a semantic version.
pub fn read_version(path: &Path) -> anyhow::Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read version file {}", path.display()))?;

    let version = contents.trim_matches(|c| c == '\n' || c == ' ');
    if !is_semver(version)? {
        anyhow::bail!("{:?} in {} is not a valid version number", version, path.display());
    }

    Ok(version.to_string())
}

const SEMVER_PATTERN: &str = concat!(
    r"^v?(?:0|[1-9][0-9]*)\.(?:0|[1-9][0-9]*)\.(?:0|[1-9][0-9]*)",
    r"(?:-[\da-z\-]+(?:\.[\da-z\-]+)*)?",
    r"(?:\+[\da-z\-]+(?:\.[\da-z\-]+)*)?$",
);

static SEMVER: OnceLock<Regex> = OnceLock::new();

fn is_semver(version: &str) -> Result<bool, regex::Error> {
    let re = match SEMVER.get() {
        Some(re) => re,
        None => {
            let compiled = Regex::new(SEMVER_PATTERN)?;
            SEMVER.get_or_init(|| compiled)
        }
    };

    Ok(re.is_match(version))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
            version_file: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            upload_tag: default_upload_tag(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            photos_path: default_photos_path(),
            show_path: default_show_path(),
            ui_path: default_ui_path(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backup_queue_size: default_queue_size(),
            staging_queue_size: default_queue_size(),
            backup_dispatch: default_backup_dispatch(),
            staging_dispatch: default_staging_dispatch(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn from_json(json: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    fn s3_settings() -> S3Config {
        S3Config {
            bucket: "photo-backups".to_string(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            key_prefix: default_key_prefix(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }

    #[test]
    fn test_defaults_from_empty_source() {
        let config = from_json("{}");

        assert_eq!(config.storage.photos_path, PathBuf::from("./piphotos"));
        assert_eq!(config.storage.show_path, PathBuf::from("./slideshow"));
        assert_eq!(config.storage.ui_path, PathBuf::from("./ui/build"));
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.upload_tag, "uploadImages");
        assert_eq!(config.pipeline.backup_queue_size, 25);
        assert_eq!(config.pipeline.staging_queue_size, 25);
        assert_eq!(config.pipeline.backup_dispatch, DispatchPolicy::Concurrent);
        assert_eq!(config.pipeline.staging_dispatch, DispatchPolicy::Serial);
        assert_eq!(config.backup.target, BackupKind::Log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = from_json(
            r#"{
                "api": { "port": 3001, "upload_tag": "files" },
                "pipeline": { "staging_queue_size": 5, "backup_dispatch": "serial" },
                "backup": {
                    "target": "s3",
                    "s3": { "bucket": "b", "endpoint_url": "http://minio:9000" }
                }
            }"#,
        );

        assert_eq!(config.api.port, 3001);
        assert_eq!(config.api.upload_tag, "files");
        assert_eq!(config.pipeline.staging_queue_size, 5);
        assert_eq!(config.pipeline.backup_queue_size, 25);
        assert_eq!(config.pipeline.backup_dispatch, DispatchPolicy::Serial);
        assert_eq!(config.backup.target, BackupKind::S3);

        let s3 = config.backup.s3.as_ref().unwrap();
        assert_eq!(s3.bucket, "b");
        assert_eq!(s3.region, "us-east-1");
        assert_eq!(s3.endpoint_url.as_deref(), Some("http://minio:9000"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_queue_size() {
        let mut config = Config::default();
        config.pipeline.backup_queue_size = 0;

        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_s3_without_settings() {
        let mut config = Config::default();
        config.backup.target = BackupKind::S3;

        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "backup.s3"
        ));

        config.backup.s3 = Some(s3_settings());
        assert!(config.validate().is_ok());

        config.backup.s3.as_mut().unwrap().part_size_bytes = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_semver() {
        for valid in ["0.0.0", "1.2.3", "v1.2.3", "1.0.0-rc.1", "1.0.0+build.5"] {
            assert!(is_semver(valid).unwrap(), "{valid} should be valid");
        }
        for invalid in ["", "1.2", "01.2.3", "1.2.3.4", "latest"] {
            assert!(!is_semver(invalid).unwrap(), "{invalid} should be invalid");
        }
    }

    #[test]
    fn test_semver_pattern_is_compiled_once() {
        assert!(is_semver("1.0.0").unwrap());
        let first = SEMVER.get().unwrap() as *const Regex;

        assert!(!is_semver("nope").unwrap());
        assert_eq!(SEMVER.get().unwrap() as *const Regex, first);
    }

    #[test]
    fn test_read_version_trims_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, " 1.4.0 ").unwrap();

        assert_eq!(read_version(file.path()).unwrap(), "1.4.0");
    }

    #[test]
    fn test_read_version_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not-a-version").unwrap();

        assert!(read_version(file.path()).is_err());
        assert!(read_version(Path::new("/does/not/exist/VERSION")).is_err());
    }

    #[test]
    fn test_version_defaults_to_crate_version() {
        let config = Config::default();
        assert_eq!(config.version().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_listen_addr() {
        let config = Config::default();
        assert_eq!(config.api.listen_addr().unwrap().port(), 8080);
    }
}
