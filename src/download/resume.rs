use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;

use super::service::TransferId;

/// Persisted transfer ids keyed by model id.
///
/// Survives process restarts; single writer per key. A token is written
/// when a new transfer is created, read on coordinator initialization, and
/// cleared once the referenced transfer is no longer valid.
pub trait ResumeTokenStore: Send + Sync {
    fn get(&self, model_id: &str) -> Option<TransferId>;
    fn set(&self, model_id: &str, id: TransferId) -> io::Result<()>;
    fn clear(&self, model_id: &str) -> io::Result<()>;
}

/// File-backed [`ResumeTokenStore`]: one JSON object of model id → transfer id.
pub struct JsonResumeStore {
    path: PathBuf,
    tokens: Mutex<HashMap<String, TransferId>>,
}

impl JsonResumeStore {
    /// Open (or create) the store at `path`, loading any existing tokens.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let tokens = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("resume store {:?} is unreadable, starting empty: {}", path, e);
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            tokens: Mutex::new(tokens),
        })
    }

    fn persist(&self, tokens: &HashMap<String, TransferId>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(tokens).map_err(io::Error::other)?;
        // Write-then-rename; readers never observe a torn file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl ResumeTokenStore for JsonResumeStore {
    fn get(&self, model_id: &str) -> Option<TransferId> {
        self.tokens.lock().unwrap().get(model_id).copied()
    }

    fn set(&self, model_id: &str, id: TransferId) -> io::Result<()> {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.insert(model_id.to_string(), id);
        self.persist(&tokens)
    }

    fn clear(&self, model_id: &str) -> io::Result<()> {
        let mut tokens = self.tokens.lock().unwrap();
        if tokens.remove(model_id).is_none() {
            return Ok(());
        }
        self.persist(&tokens)
    }
}
