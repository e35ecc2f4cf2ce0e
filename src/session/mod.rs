//! Inference session lifecycle atop a pluggable runtime.
//!
//! [`InferenceSessionManager`] owns the single [`InferenceSession`] state
//! machine; [`InferenceRuntime`] is the seam where an actual llama.cpp
//! binding (or a test fake) plugs in.

mod manager;
mod runtime;

pub use manager::InferenceSessionManager;
pub use runtime::{GenerationStream, InferenceRuntime, LogCallback};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::catalog::Model;

/// Severity of a runtime log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// One line emitted by the inference runtime's internal logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// The inference session state machine.
///
/// `Streaming::partial_response` always holds the full response so far;
/// each runtime chunk replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum InferenceSession {
    Idle,
    Loading {
        model: Model,
        local_path: PathBuf,
    },
    Ready {
        model: Model,
    },
    AwaitingResponse {
        model: Model,
        prompt: String,
    },
    Streaming {
        model: Model,
        partial_response: String,
    },
    Failed {
        model: Model,
        cause: String,
    },
}
