//! Combined view over every model's acquisition state plus the inference
//! session, for a frontend that renders one list and one chat surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use futures_util::stream::{self, BoxStream, StreamExt};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::catalog::Model;
use crate::download::{DownloadCoordinator, DownloadService, DownloadState, ResumeTokenStore};
use crate::session::{InferenceSession, InferenceSessionManager};
use crate::storage::StorageLayout;

/// What activating a model would do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelAction {
    None,
    StartAcquisition,
    LoadIntoSession,
}

impl ModelAction {
    fn for_state(state: &DownloadState) -> Self {
        match state {
            DownloadState::Uninitialized => ModelAction::None,
            DownloadState::NotAcquired { .. } | DownloadState::InProgress { .. } => {
                ModelAction::StartAcquisition
            }
            DownloadState::Acquired { .. } => ModelAction::LoadIntoSession,
        }
    }
}

/// One row of the model list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub model: Model,
    pub state: DownloadState,
    pub action: ModelAction,
}

/// Everything a frontend needs to render, in one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub models: Vec<ModelEntry>,
    pub session: InferenceSession,
}

/// Owns one [`DownloadCoordinator`] per catalog model and fans their state
/// streams, together with the session stream, into a single [`ViewState`]
/// stream that re-emits on any change.
pub struct ViewHub {
    catalog: Vec<Model>,
    layout: StorageLayout,
    service: Arc<dyn DownloadService>,
    resume: Arc<dyn ResumeTokenStore>,
    session: Arc<InferenceSessionManager>,
    registry: Mutex<HashMap<String, Arc<DownloadCoordinator>>>,
    // The fan-in task is the single producer; the sender moves into it.
    view_tx: Mutex<Option<watch::Sender<ViewState>>>,
    view_rx: watch::Receiver<ViewState>,
    fan_in: Once,
}

impl ViewHub {
    pub fn new(
        catalog: Vec<Model>,
        layout: StorageLayout,
        service: Arc<dyn DownloadService>,
        resume: Arc<dyn ResumeTokenStore>,
        session: Arc<InferenceSessionManager>,
    ) -> Self {
        let initial = ViewState {
            models: catalog
                .iter()
                .map(|model| ModelEntry {
                    model: model.clone(),
                    state: DownloadState::Uninitialized,
                    action: ModelAction::None,
                })
                .collect(),
            session: InferenceSession::Idle,
        };
        let (view_tx, view_rx) = watch::channel(initial);
        Self {
            catalog,
            layout,
            service,
            resume,
            session,
            registry: Mutex::new(HashMap::new()),
            view_tx: Mutex::new(Some(view_tx)),
            view_rx,
            fan_in: Once::new(),
        }
    }

    /// The coordinator for `model_id`, created and bootstrapped on first
    /// use. Every caller gets the same instance.
    pub fn coordinator(&self, model_id: &str) -> Option<Arc<DownloadCoordinator>> {
        let model = self.catalog.iter().find(|m| m.id == model_id)?.clone();
        let mut registry = self.registry.lock().unwrap();
        let coordinator = registry
            .entry(model.id.clone())
            .or_insert_with(|| {
                let destination = self.layout.model_path(&model.filename);
                let coordinator = Arc::new(DownloadCoordinator::new(
                    model,
                    destination,
                    Arc::clone(&self.service),
                    Arc::clone(&self.resume),
                ));
                coordinator.bootstrap();
                coordinator
            });
        Some(Arc::clone(coordinator))
    }

    /// Continuously updated combined view.
    pub fn observe(&self) -> watch::Receiver<ViewState> {
        self.ensure_fan_in();
        self.view_rx.clone()
    }

    /// Do the right thing for `model_id` given its current state: trigger
    /// acquisition, or load the acquired model into the session.
    pub async fn activate(&self, model_id: &str) {
        self.ensure_fan_in();
        let Some(coordinator) = self.coordinator(model_id) else {
            return;
        };
        match coordinator.state() {
            DownloadState::Acquired { local_path } => {
                info!("activating {} into the session", model_id);
                self.session.load(coordinator.model().clone(), local_path);
            }
            _ => coordinator.request_acquisition().await,
        }
    }

    pub fn send_message(&self, prompt: &str) {
        self.session.send_message(prompt);
    }

    pub fn session_manager(&self) -> &Arc<InferenceSessionManager> {
        &self.session
    }

    /// Spawn the fan-in task on first call: merge every coordinator stream
    /// with the session stream and rebuild the view on each tick.
    fn ensure_fan_in(&self) {
        self.fan_in.call_once(|| {
            let coordinators: Vec<Arc<DownloadCoordinator>> = self
                .catalog
                .iter()
                .map(|model| {
                    self.coordinator(&model.id)
                        .expect("catalog model has a coordinator")
                })
                .collect();

            let mut sources: Vec<BoxStream<'static, ()>> = coordinators
                .iter()
                .map(|c| WatchStream::new(c.observe()).map(|_| ()).boxed())
                .collect();
            sources.push(
                WatchStream::new(self.session.observe())
                    .map(|_| ())
                    .boxed(),
            );
            let mut merged = stream::select_all(sources);

            let view_tx = self
                .view_tx
                .lock()
                .unwrap()
                .take()
                .expect("fan-in spawned once");
            let session = Arc::clone(&self.session);
            tokio::spawn(async move {
                while merged.next().await.is_some() {
                    let models = coordinators
                        .iter()
                        .map(|c| {
                            let state = c.state();
                            ModelEntry {
                                model: c.model().clone(),
                                action: ModelAction::for_state(&state),
                                state,
                            }
                        })
                        .collect();
                    let session = session.current();
                    view_tx.send_replace(ViewState { models, session });
                }
            });
        });
    }
}
