use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::watch;

use super::runtime::InferenceRuntime;
use super::{InferenceSession, LogEntry};
use crate::catalog::Model;
use crate::error::SessionError;

/// Owns the [`InferenceSession`] state machine and the runtime log buffer.
///
/// All transitions go through one watch channel, so observers see a
/// totally ordered history. Loads and generation episodes run on
/// background tasks; triggers that arrive in the wrong state are ignored
/// rather than queued.
pub struct InferenceSessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Arc<dyn InferenceRuntime>,
    tx: watch::Sender<InferenceSession>,
    logs: Mutex<Vec<LogEntry>>,
    // Serializes trigger checks so two racing calls cannot both pass gating.
    gate: Mutex<()>,
}

impl InferenceSessionManager {
    pub fn new(runtime: Arc<dyn InferenceRuntime>) -> Self {
        let (tx, _rx) = watch::channel(InferenceSession::Idle);
        let inner = Arc::new(Inner {
            runtime,
            tx,
            logs: Mutex::new(Vec::new()),
            gate: Mutex::new(()),
        });
        // Weak, otherwise the runtime and the manager keep each other alive.
        let sink = Arc::downgrade(&inner);
        inner.runtime.set_log_callback(Box::new(move |level, message| {
            if let Some(sink) = sink.upgrade() {
                sink.logs.lock().unwrap().push(LogEntry { level, message });
            }
        }));
        Self { inner }
    }

    /// Latest session state.
    pub fn current(&self) -> InferenceSession {
        self.inner.tx.borrow().clone()
    }

    /// Continuously updated session state stream.
    pub fn observe(&self) -> watch::Receiver<InferenceSession> {
        self.inner.tx.subscribe()
    }

    /// Everything the runtime has logged so far, in emission order.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.logs.lock().unwrap().clone()
    }

    /// Load `model` from `local_path`, replacing whatever was loaded before.
    ///
    /// Ignored while a load or a generation episode is in flight.
    pub fn load(&self, model: Model, local_path: PathBuf) {
        let _gate = self.inner.gate.lock().unwrap();
        let busy = matches!(
            *self.inner.tx.borrow(),
            InferenceSession::Loading { .. }
                | InferenceSession::AwaitingResponse { .. }
                | InferenceSession::Streaming { .. }
        );
        if busy {
            warn!("session busy, ignoring load of {}", model.id);
            return;
        }
        info!("loading {} from {:?}", model.id, local_path);
        self.inner.publish(InferenceSession::Loading {
            model: model.clone(),
            local_path: local_path.clone(),
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.runtime.load(&local_path).await {
                Ok(()) => {
                    info!("{} ready", model.id);
                    inner.publish(InferenceSession::Ready { model });
                }
                Err(e) => {
                    let cause = SessionError::LoadFailure {
                        cause: e.to_string(),
                    }
                    .to_string();
                    warn!("{}: {}", model.id, cause);
                    inner.publish(InferenceSession::Failed { model, cause });
                }
            }
        });
    }

    /// Submit a prompt. Accepted only in `Ready`; ignored everywhere else,
    /// including while a previous response is still streaming.
    pub fn send_message(&self, prompt: &str) {
        let _gate = self.inner.gate.lock().unwrap();
        let model = match &*self.inner.tx.borrow() {
            InferenceSession::Ready { model } => model.clone(),
            other => {
                debug!("no model ready (session is {}), dropping prompt", other);
                return;
            }
        };
        self.inner.publish(InferenceSession::AwaitingResponse {
            model: model.clone(),
            prompt: prompt.to_string(),
        });

        let inner = Arc::clone(&self.inner);
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            inner.publish(InferenceSession::Streaming {
                model: model.clone(),
                partial_response: String::new(),
            });
            let mut stream = inner.runtime.generate(&prompt);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(text) => {
                        // Runtime chunks are cumulative; replace, never append.
                        if !matches!(
                            *inner.tx.borrow(),
                            InferenceSession::Streaming { .. }
                        ) {
                            return;
                        }
                        inner.publish(InferenceSession::Streaming {
                            model: model.clone(),
                            partial_response: text,
                        });
                    }
                    Err(e) => {
                        let cause = SessionError::GenerationFailure {
                            cause: e.to_string(),
                        }
                        .to_string();
                        warn!("{}: {}", model.id, cause);
                        inner.publish(InferenceSession::Failed { model, cause });
                        return;
                    }
                }
            }
            inner.publish(InferenceSession::Ready { model });
        });
    }

    /// Clear a failed session back to `Idle`. No-op in any other state.
    pub fn reset(&self) {
        let _gate = self.inner.gate.lock().unwrap();
        if matches!(*self.inner.tx.borrow(), InferenceSession::Failed { .. }) {
            self.inner.publish(InferenceSession::Idle);
        }
    }
}

impl Inner {
    fn publish(&self, state: InferenceSession) {
        debug!("session -> {}", state);
        self.tx.send_replace(state);
    }
}
