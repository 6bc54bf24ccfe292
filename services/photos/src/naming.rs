//! Unique photo naming.
//!
//! Photos are named after their EXIF capture time so that a directory listing
//! groups them chronologically. When the metadata is missing or unreadable the
//! wall-clock time at naming is used instead. Collisions are resolved by
//! appending `_1`, `_2`, ... to the base name.

use chrono::{DateTime, Local};
use exif::{In, Reader, Tag, Value};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Format of the fallback key, e.g. `2024-01-15-10-30-45`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Errors raised while reading naming metadata.
#[derive(Debug, Error)]
pub enum NamingError {
    #[error("Malformed image metadata: {0}")]
    Metadata(#[from] exif::Error),
}

/// A base name plus extension that has not yet been checked against the
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingCandidate {
    /// File name without extension
    pub base: String,
    /// Extension including the leading dot, or empty
    pub extension: String,
}

impl NamingCandidate {
    pub fn new(base: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            extension: extension.into(),
        }
    }

    /// Name an uploaded image from its capture time, falling back to now.
    ///
    /// Metadata errors never fail the upload; they are logged and the
    /// timestamp fallback is used.
    pub fn for_image(image: &[u8], extension: impl Into<String>) -> Self {
        let base = match derive_key(image) {
            Ok(Some(key)) => key,
            Ok(None) => timestamp_key(&Local::now()),
            Err(e) => {
                warn!(error = %e, "Unreadable image metadata, naming by current time");
                timestamp_key(&Local::now())
            }
        };

        Self::new(base, extension)
    }

    /// Split an existing file's name into base and extension.
    pub fn from_path(path: &Path) -> Self {
        let base = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self::new(base, extension_of(path))
    }

    /// File name for the given disambiguator (0 means none).
    pub fn file_name(&self, disambiguator: u32) -> String {
        if disambiguator == 0 {
            format!("{}{}", self.base, self.extension)
        } else {
            format!("{}_{}{}", self.base, disambiguator, self.extension)
        }
    }
}

/// Extension of `path` with its leading dot, or an empty string.
pub fn extension_of(path: impl AsRef<Path>) -> String {
    path.as_ref()
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Extract a filename-safe capture-time key from the image's EXIF data.
///
/// Returns `Ok(None)` when the bytes are not a recognised image container or
/// carry no capture time. Returns an error only when a recognised container
/// has metadata too broken to read.
pub fn derive_key(image: &[u8]) -> Result<Option<String>, NamingError> {
    if !is_image_container(image) {
        return Ok(None);
    }

    let exif = match Reader::new().read_from_container(&mut Cursor::new(image)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let key = exif
        .get_field(Tag::DateTime, In::PRIMARY)
        .or_else(|| exif.get_field(Tag::DateTimeOriginal, In::PRIMARY))
        .and_then(|field| match &field.value {
            Value::Ascii(values) => values
                .first()
                .map(|v| String::from_utf8_lossy(v).into_owned()),
            _ => None,
        })
        .map(|raw| sanitize_key(&raw))
        .filter(|key| !key.is_empty());

    debug!(key = ?key, "Derived naming key from image metadata");

    Ok(key)
}

/// Render `at` as a naming key.
pub fn timestamp_key(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Replace characters that are unsafe in file names with hyphens.
pub fn sanitize_key(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .chars()
        .map(|c| match c {
            ':' | ' ' | '/' | '\\' => '-',
            _ => c,
        })
        .collect()
}

/// First path in `dir` for `base` + `extension` that does not exist yet.
///
/// Tries `base.ext`, then `base_1.ext`, `base_2.ext`, ... The check is not
/// atomic with whatever the caller does with the path afterwards. Fails with
/// the underlying error when a candidate cannot be looked up at all, e.g.
/// when `dir` is not a directory or cannot be searched.
pub async fn make_unique(dir: &Path, base: &str, extension: &str) -> io::Result<PathBuf> {
    let candidate = NamingCandidate::new(base, extension);

    let mut disambiguator: u32 = 0;
    loop {
        let path = dir.join(candidate.file_name(disambiguator));
        match tokio::fs::symlink_metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(path),
            Err(e) => return Err(e),
        }

        disambiguator = disambiguator.checked_add(1).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("no free name for {} in {}", candidate.file_name(0), dir.display()),
            )
        })?;
    }
}

/// Write `data` to the first free name for `candidate` in `dir`.
///
/// Unlike [`make_unique`], the existence check and the creation are a single
/// `create_new` open, so concurrent writers never overwrite each other: a
/// writer that loses the race moves on to the next disambiguator.
pub async fn create_unique(
    dir: &Path,
    candidate: &NamingCandidate,
    data: &[u8],
) -> io::Result<PathBuf> {
    let mut disambiguator = 0;
    loop {
        let path = dir.join(candidate.file_name(disambiguator));

        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(mut file) => {
                if let Err(e) = write_all(&mut file, data).await {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e);
                }
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                disambiguator += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn write_all(file: &mut tokio::fs::File, data: &[u8]) -> io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}

/// Whether the bytes start like a container the EXIF reader understands
/// (JPEG, TIFF, PNG, WebP, HEIF).
fn is_image_container(data: &[u8]) -> bool {
    data.starts_with(&[0xFF, 0xD8])
        || data.starts_with(b"II*\0")
        || data.starts_with(b"MM\0*")
        || data.starts_with(b"\x89PNG\r\n\x1a\n")
        || (data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP")
        || (data.len() >= 8 && &data[4..8] == b"ftyp")
}
