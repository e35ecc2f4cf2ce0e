use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Where model artifacts land on disk.
///
/// A shared, externally visible directory is preferred when one is
/// configured; otherwise files go into a private app-data directory. The
/// choice affects only path selection, not acquisition semantics.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    shared_dir: Option<PathBuf>,
    private_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(shared_dir: Option<PathBuf>, private_dir: PathBuf) -> Self {
        Self {
            shared_dir,
            private_dir,
        }
    }

    /// Resolve the default private location from the OS app-data
    /// conventions. `None` when the platform exposes no home directory.
    pub fn discover() -> Option<Self> {
        ProjectDirs::from("", "", "llamaden")
            .map(|dirs| Self::new(None, dirs.data_local_dir().join("models")))
    }

    /// The directory model files are written to.
    pub fn models_dir(&self) -> &Path {
        self.shared_dir.as_deref().unwrap_or(&self.private_dir)
    }

    /// Destination path for one model artifact.
    pub fn model_path(&self, filename: &str) -> PathBuf {
        self.models_dir().join(filename)
    }
}
