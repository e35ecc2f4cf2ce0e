//! Model artifact acquisition: the per-model coordinator state machine, the
//! download service interface, and persisted resume tokens.

mod coordinator;
mod resume;
mod service;

pub use coordinator::DownloadCoordinator;
pub use resume::{JsonResumeStore, ResumeTokenStore};
pub use service::{
    DownloadService, HttpDownloadService, TransferId, TransferRequest, TransferSnapshot,
    TransferStatus,
};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Acquisition state of one model artifact.
///
/// Transitions are driven solely by the coordinator and the external
/// transfer status; `progress` is non-decreasing while `InProgress` for a
/// given transfer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DownloadState {
    /// Nothing known yet; initialization has not run.
    Uninitialized,
    /// Artifact absent or invalid; `last_error` carries the most recent failure.
    NotAcquired { last_error: Option<String> },
    /// A transfer is live and being polled.
    InProgress { transfer_id: TransferId, progress: f32 },
    /// Artifact present and verified on disk.
    Acquired { local_path: PathBuf },
}
