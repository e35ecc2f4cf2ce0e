use std::path::Path;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::LogLevel;
use crate::error::RuntimeError;

/// Stream of cumulative response snapshots. Each item carries the full
/// response so far, not a delta; consumers replace, never append.
pub type GenerationStream = BoxStream<'static, Result<String, RuntimeError>>;

/// Sink for the runtime's internal log lines.
pub type LogCallback = Box<dyn Fn(LogLevel, String) + Send + Sync>;

/// Abstraction over the model execution engine.
///
/// Implementations wrap an actual inference backend; tests use fakes.
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Load model weights from a local file. Resolves when the model is
    /// ready to generate, or with the backend's failure cause.
    async fn load(&self, path: &Path) -> Result<(), RuntimeError>;

    /// Start generating a response to `prompt`.
    fn generate(&self, prompt: &str) -> GenerationStream;

    /// Register the sink that receives the runtime's log lines.
    fn set_log_callback(&self, callback: LogCallback);
}
