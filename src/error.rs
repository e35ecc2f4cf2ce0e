use std::io;

/// Errors produced by the acquisition pipeline.
///
/// These never escape the coordinator boundary: the coordinator stringifies
/// them into [`DownloadState::NotAcquired`](crate::download::DownloadState),
/// where they stay recoverable by triggering acquisition again.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Failed: {reason}")]
    TransportFailure { reason: String },
    #[error("Paused: {reason}")]
    Paused { reason: String },
    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the inference session. Captured in
/// [`InferenceSession::Failed`](crate::session::InferenceSession), never
/// propagated past the manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to load model: {cause}")]
    LoadFailure { cause: String },
    #[error("Generation failed: {cause}")]
    GenerationFailure { cause: String },
}

/// Opaque failure reported by a native inference runtime.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
