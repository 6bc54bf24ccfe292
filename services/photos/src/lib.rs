//! PhotoPi Photos Service
//!
//! Accepts photo uploads for the PhotoPi slideshow, names each one after its
//! EXIF capture time, copies it off-site and moves it into the slideshow
//! directory.
//!
//! ## Features
//!
//! - **Metadata-based Naming**: Photos are named `YYYY-MM-DD-HH-MM-SS.ext` from
//!   their capture time, falling back to the upload time, with `_N` suffixes
//!   on collision
//! - **Backpressured Pipeline**: Two bounded queues, each drained by its own
//!   dispatcher; producers wait when a queue is full
//! - **Pluggable Backup**: Log-only or S3 backup targets
//! - **Serialized Staging**: One photo at a time is moved into the slideshow
//!   directory, so naming decisions there never race
//!
//! ## Architecture
//!
//! ```text
//!  POST /photos                 Backup Stage                Staging Stage
//! ┌──────────────┐            ┌──────────────┐            ┌──────────────┐
//! │ Upload       │  submit    │ queue (25)   │  submit    │ queue (25)   │
//! │ Handler      │───────────▶│      │       │───────────▶│      │       │
//! └──────────────┘            │      ▼       │            │      ▼       │
//!        │                    │ task / photo │            │ one at a time│
//!        ▼                    └──────────────┘            └──────────────┘
//! ┌──────────────┐                   │                           │
//! │ ./piphotos   │                   ▼                           ▼
//! │ (create_new) │            ┌──────────────┐            ┌──────────────┐
//! └──────────────┘            │ Backup       │            │ ./slideshow  │
//!                             │ Target       │            │ (rename)     │
//!                             └──────────────┘            └──────────────┘
//! ```

pub mod api;
pub mod backup;
pub mod config;
pub mod naming;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod staging;

pub use api::{create_router, start_api_server, AppState};
pub use backup::{BackupError, BackupStage, BackupTarget, LogBackup, S3Backup};
pub use config::Config;
pub use naming::{create_unique, derive_key, make_unique, NamingCandidate, NamingError};
pub use pipeline::{Pipeline, PipelineSnapshot};
pub use queue::{QueueError, WorkQueue};
pub use stage::{DispatchPolicy, PhotoRef, PhotoSink, Stage, StageError, StageSnapshot};
pub use staging::StagingStage;
