//! Acquire large LLM artifacts over the network, verify their integrity,
//! and drive a single local inference session that streams generated text
//! back incrementally.
//!
//! The crate is built around three state machines feeding one reactive view:
//!
//! - [`download::DownloadCoordinator`] — one per model id: resumable
//!   acquisition with integrity verification, request deduplication, and a
//!   fixed-interval status poll loop;
//! - [`session::InferenceSessionManager`] — the single process-wide
//!   load → ready → generate → stream lifecycle;
//! - [`view::ViewHub`] — combine-latest fan-in of every per-model download
//!   state plus the session state into one consistent [`view::ViewState`]
//!   stream for a presentation layer.
//!
//! The download transport ([`download::DownloadService`]), the resume-token
//! store ([`download::ResumeTokenStore`]), and the native runtime
//! ([`session::InferenceRuntime`]) are trait seams; ready-to-use
//! implementations ship for the first two.

pub mod catalog;
pub mod download;
pub mod error;
pub mod integrity;
pub mod session;
pub mod storage;
pub mod view;

pub use catalog::{default_catalog, Model};
pub use download::{
    DownloadCoordinator, DownloadService, DownloadState, HttpDownloadService, JsonResumeStore,
    ResumeTokenStore, TransferId, TransferRequest, TransferSnapshot, TransferStatus,
};
pub use error::{AcquisitionError, RuntimeError, SessionError};
pub use session::{
    GenerationStream, InferenceRuntime, InferenceSession, InferenceSessionManager, LogCallback,
    LogEntry, LogLevel,
};
pub use storage::StorageLayout;
pub use view::{ModelAction, ModelEntry, ViewHub, ViewState};
