use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::resume::ResumeTokenStore;
use super::service::{DownloadService, TransferId, TransferRequest, TransferStatus};
use super::DownloadState;
use crate::catalog::Model;
use crate::error::AcquisitionError;
use crate::integrity::compute_sha256;

/// How often a live transfer is polled for status.
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Background work owned by the coordinator. At most one per model.
struct DownloadJob {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Per-model acquisition state machine.
///
/// Owns this model's [`DownloadState`] and publishes every transition
/// through a watch channel. All mutation happens either in the triggering
/// call or in the single background job, so emissions are totally ordered
/// and progress is monotonic per transfer id.
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    model: Model,
    destination: PathBuf,
    service: Arc<dyn DownloadService>,
    resume: Arc<dyn ResumeTokenStore>,
    tx: watch::Sender<DownloadState>,
    job: Mutex<Option<DownloadJob>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl DownloadCoordinator {
    pub fn new(
        model: Model,
        destination: PathBuf,
        service: Arc<dyn DownloadService>,
        resume: Arc<dyn ResumeTokenStore>,
    ) -> Self {
        let (tx, _rx) = watch::channel(DownloadState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                model,
                destination,
                service,
                resume,
                tx,
                job: Mutex::new(None),
                init_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    /// Latest state, race-free snapshot.
    pub fn state(&self) -> DownloadState {
        self.inner.tx.borrow().clone()
    }

    /// Continuously updated state stream. Each subscriber sees the latest
    /// value plus all subsequent transitions; restartable per subscriber.
    pub fn observe(&self) -> watch::Receiver<DownloadState> {
        self.inner.tx.subscribe()
    }

    /// Run initialization in the background. Called when the coordinator is
    /// brought up; a later [`request_acquisition`](Self::request_acquisition)
    /// on a still-uninitialized coordinator does the same work inline.
    pub fn bootstrap(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.initialize().await;
        });
    }

    /// Idempotent acquisition trigger.
    ///
    /// `Uninitialized` runs initialization; `NotAcquired` starts the
    /// acquisition job; `InProgress` and `Acquired` are no-ops, so no
    /// duplicate transfer is ever created for this model.
    pub async fn request_acquisition(&self) {
        match self.state() {
            DownloadState::Uninitialized => Arc::clone(&self.inner).initialize().await,
            DownloadState::NotAcquired { .. } => Inner::begin_acquisition(&self.inner),
            DownloadState::InProgress { transfer_id, .. } => {
                debug!(
                    "model {}: transfer {} already live, ignoring duplicate request",
                    self.inner.model.id, transfer_id
                );
            }
            DownloadState::Acquired { .. } => {
                debug!("model {}: already acquired", self.inner.model.id);
            }
        }
    }

    /// Cancel the live background job, if any. A cancelled episode settles
    /// in `NotAcquired` and can be retried.
    pub fn cancel(&self) {
        let job = self.inner.job.lock().unwrap();
        if let Some(job) = job.as_ref() {
            if !job.handle.is_finished() {
                info!("model {}: cancelling acquisition", self.inner.model.id);
                job.cancel.cancel();
            }
        }
    }
}

impl Inner {
    /// Initialization algorithm; runs once per process per model.
    async fn initialize(self: Arc<Self>) {
        let _guard = self.init_lock.lock().await;
        if !matches!(*self.tx.borrow(), DownloadState::Uninitialized) {
            return;
        }
        info!(
            "model {}: initializing, destination {:?}",
            self.model.id, self.destination
        );

        // A verified artifact on disk short-circuits everything: no network.
        let on_disk = match compute_sha256(&self.destination).await {
            Ok(actual) => actual == self.model.sha256,
            Err(_) => false,
        };
        if on_disk {
            info!("model {}: artifact already on disk and verified", self.model.id);
            self.publish(DownloadState::Acquired {
                local_path: self.destination.clone(),
            });
            return;
        }

        let Some(transfer_id) = self.resume.get(&self.model.id) else {
            self.publish(DownloadState::NotAcquired { last_error: None });
            return;
        };

        match self.service.query(transfer_id).await {
            None => {
                debug!(
                    "model {}: resume token {} is stale, clearing",
                    self.model.id, transfer_id
                );
                self.clear_token();
                self.publish(DownloadState::NotAcquired { last_error: None });
            }
            Some(snapshot) => match snapshot.status {
                TransferStatus::Pending | TransferStatus::Running => {
                    info!(
                        "model {}: resuming polling of transfer {}",
                        self.model.id, transfer_id
                    );
                    let progress = if snapshot.bytes_total == 0 {
                        0.0
                    } else {
                        (snapshot.bytes_downloaded as f32 / snapshot.bytes_total as f32)
                            .clamp(0.0, 1.0)
                    };
                    self.publish(DownloadState::InProgress {
                        transfer_id,
                        progress,
                    });
                    Self::spawn_poll(&self, transfer_id);
                }
                TransferStatus::Successful => {
                    // Finished while we were away; verify before trusting it.
                    self.finish_successful(transfer_id).await;
                }
                TransferStatus::Failed => {
                    let reason = snapshot.reason.unwrap_or_else(|| "unknown".into());
                    self.clear_token();
                    self.publish(DownloadState::NotAcquired {
                        last_error: Some(
                            AcquisitionError::TransportFailure { reason }.to_string(),
                        ),
                    });
                }
                TransferStatus::Paused => {
                    let reason = snapshot.reason.unwrap_or_else(|| "unknown".into());
                    self.publish(DownloadState::NotAcquired {
                        last_error: Some(AcquisitionError::Paused { reason }.to_string()),
                    });
                }
            },
        }
    }

    /// Start the acquisition job unless one is already live.
    fn begin_acquisition(this: &Arc<Self>) {
        let mut slot = this.job.lock().unwrap();
        if let Some(job) = slot.as_ref() {
            if !job.handle.is_finished() {
                debug!("model {}: acquisition already running", this.model.id);
                return;
            }
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            inner.acquire(token).await;
        });
        *slot = Some(DownloadJob { handle, cancel });
    }

    /// Start a poll-only job for an already-live transfer (resume path).
    fn spawn_poll(this: &Arc<Self>, transfer_id: TransferId) {
        let mut slot = this.job.lock().unwrap();
        if let Some(job) = slot.as_ref() {
            if !job.handle.is_finished() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            inner.poll_until_terminal(transfer_id, token).await;
        });
        *slot = Some(DownloadJob { handle, cancel });
    }

    async fn acquire(self: Arc<Self>, cancel: CancellationToken) {
        match self.resolve_transfer().await {
            Ok(transfer_id) => self.poll_until_terminal(transfer_id, cancel).await,
            Err(e) => {
                warn!("model {}: could not start acquisition: {}", self.model.id, e);
                self.publish(DownloadState::NotAcquired {
                    last_error: Some(e.to_string()),
                });
            }
        }
    }

    /// Clean up any stale artifact and produce a transfer id, reusing a
    /// still-live resume token when the service confirms it.
    async fn resolve_transfer(&self) -> Result<TransferId, AcquisitionError> {
        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // The state is NotAcquired, so anything at the destination is stale.
        match tokio::fs::remove_file(&self.destination).await {
            Ok(()) => debug!("model {}: removed stale artifact", self.model.id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(existing) = self.resume.get(&self.model.id) {
            match self.service.query(existing).await {
                Some(snapshot)
                    if matches!(
                        snapshot.status,
                        TransferStatus::Pending
                            | TransferStatus::Running
                            | TransferStatus::Successful
                    ) =>
                {
                    info!("model {}: reusing live transfer {}", self.model.id, existing);
                    return Ok(existing);
                }
                _ => {
                    debug!(
                        "model {}: resume token {} no longer live, clearing",
                        self.model.id, existing
                    );
                    self.clear_token();
                }
            }
        }

        let transfer_id = self
            .service
            .enqueue(TransferRequest {
                url: self.model.url.clone(),
                destination: self.destination.clone(),
            })
            .await?;
        if let Err(e) = self.resume.set(&self.model.id, transfer_id) {
            warn!(
                "model {}: failed to persist resume token: {}",
                self.model.id, e
            );
        }
        info!("model {}: transfer {} enqueued", self.model.id, transfer_id);
        Ok(transfer_id)
    }

    /// Poll the service at a fixed interval, publishing every mapped state,
    /// until the transfer reaches a terminal status or the job is cancelled.
    async fn poll_until_terminal(&self, transfer_id: TransferId, cancel: CancellationToken) {
        let mut last_progress = match &*self.tx.borrow() {
            DownloadState::InProgress {
                transfer_id: id,
                progress,
            } if *id == transfer_id => *progress,
            _ => 0.0,
        };
        loop {
            if cancel.is_cancelled() {
                self.publish(DownloadState::NotAcquired {
                    last_error: Some("cancelled".into()),
                });
                return;
            }

            let Some(snapshot) = self.service.query(transfer_id).await else {
                warn!(
                    "model {}: transfer {} vanished from the download service",
                    self.model.id, transfer_id
                );
                self.clear_token();
                self.publish(DownloadState::NotAcquired { last_error: None });
                return;
            };

            match snapshot.status {
                TransferStatus::Pending => {
                    self.publish(DownloadState::InProgress {
                        transfer_id,
                        progress: last_progress,
                    });
                }
                TransferStatus::Running => {
                    let progress = if snapshot.bytes_total == 0 {
                        0.0
                    } else {
                        snapshot.bytes_downloaded as f32 / snapshot.bytes_total as f32
                    };
                    last_progress = last_progress.max(progress.clamp(0.0, 1.0));
                    self.publish(DownloadState::InProgress {
                        transfer_id,
                        progress: last_progress,
                    });
                }
                TransferStatus::Failed => {
                    let reason = snapshot.reason.unwrap_or_else(|| "unknown".into());
                    warn!(
                        "model {}: transfer {} failed: {}",
                        self.model.id, transfer_id, reason
                    );
                    self.clear_token();
                    self.publish(DownloadState::NotAcquired {
                        last_error: Some(
                            AcquisitionError::TransportFailure { reason }.to_string(),
                        ),
                    });
                    return;
                }
                TransferStatus::Paused => {
                    let reason = snapshot.reason.unwrap_or_else(|| "unknown".into());
                    self.publish(DownloadState::NotAcquired {
                        last_error: Some(AcquisitionError::Paused { reason }.to_string()),
                    });
                    return;
                }
                TransferStatus::Successful => {
                    self.finish_successful(transfer_id).await;
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.publish(DownloadState::NotAcquired {
                        last_error: Some("cancelled".into()),
                    });
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Re-verify the finished artifact before trusting it.
    async fn finish_successful(&self, transfer_id: TransferId) {
        match compute_sha256(&self.destination).await {
            Ok(actual) if actual == self.model.sha256 => {
                info!(
                    "model {}: transfer {} complete and verified",
                    self.model.id, transfer_id
                );
                self.publish(DownloadState::Acquired {
                    local_path: self.destination.clone(),
                });
            }
            Ok(actual) => {
                let error = AcquisitionError::IntegrityMismatch {
                    expected: self.model.sha256.clone(),
                    actual,
                };
                warn!("model {}: {}", self.model.id, error);
                if let Err(e) = tokio::fs::remove_file(&self.destination).await {
                    warn!(
                        "model {}: failed to remove corrupt artifact: {}",
                        self.model.id, e
                    );
                }
                self.clear_token();
                self.publish(DownloadState::NotAcquired {
                    last_error: Some(error.to_string()),
                });
            }
            Err(e) => {
                self.clear_token();
                self.publish(DownloadState::NotAcquired {
                    last_error: Some(AcquisitionError::Io(e).to_string()),
                });
            }
        }
    }

    fn clear_token(&self) {
        if let Err(e) = self.resume.clear(&self.model.id) {
            warn!(
                "model {}: failed to clear resume token: {}",
                self.model.id, e
            );
        }
    }

    fn publish(&self, state: DownloadState) {
        debug!("model {}: -> {}", self.model.id, state);
        self.tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::TransferSnapshot;

    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use sha2::{Digest, Sha256};

    const PAYLOAD: &[u8] = b"gguf model bytes";

    fn sha_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn test_model() -> Model {
        Model {
            id: "phi-2-q4_0".into(),
            display_name: "Phi-2".into(),
            filename: "phi-2-q4_0.gguf".into(),
            url: "https://example.test/phi-2-q4_0.gguf".into(),
            sha256: sha_hex(PAYLOAD),
        }
    }

    /// Scripted stand-in for the external transport: serves a fixed queue
    /// of query answers (the last one repeats) and records every enqueue.
    struct ScriptedService {
        responses: Mutex<VecDeque<Option<TransferSnapshot>>>,
        enqueued: Mutex<Vec<TransferRequest>>,
        dest_existed_at_enqueue: Mutex<Vec<bool>>,
        queries: AtomicU64,
        next_id: AtomicU64,
        /// Written to the destination the first time `Successful` is served.
        success_payload: Vec<u8>,
        destination: Mutex<Option<PathBuf>>,
    }

    impl ScriptedService {
        fn new(success_payload: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                enqueued: Mutex::new(Vec::new()),
                dest_existed_at_enqueue: Mutex::new(Vec::new()),
                queries: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                success_payload: success_payload.to_vec(),
                destination: Mutex::new(None),
            })
        }

        /// For resume-path tests where no enqueue ever happens.
        fn with_destination(success_payload: &[u8], destination: &Path) -> Arc<Self> {
            let service = Self::new(success_payload);
            *service.destination.lock().unwrap() = Some(destination.to_path_buf());
            service
        }

        fn script(&self, responses: Vec<Option<TransferSnapshot>>) {
            *self.responses.lock().unwrap() = responses.into();
        }

        fn enqueue_count(&self) -> usize {
            self.enqueued.lock().unwrap().len()
        }

        fn query_count(&self) -> u64 {
            self.queries.load(Ordering::Relaxed)
        }

        fn pending() -> Option<TransferSnapshot> {
            Some(TransferSnapshot {
                status: TransferStatus::Pending,
                reason: None,
                bytes_downloaded: 0,
                bytes_total: 0,
            })
        }

        fn running(done: u64, total: u64) -> Option<TransferSnapshot> {
            Some(TransferSnapshot {
                status: TransferStatus::Running,
                reason: None,
                bytes_downloaded: done,
                bytes_total: total,
            })
        }

        fn failed(reason: &str) -> Option<TransferSnapshot> {
            Some(TransferSnapshot {
                status: TransferStatus::Failed,
                reason: Some(reason.into()),
                bytes_downloaded: 0,
                bytes_total: 0,
            })
        }

        fn successful() -> Option<TransferSnapshot> {
            Some(TransferSnapshot {
                status: TransferStatus::Successful,
                reason: None,
                bytes_downloaded: 100,
                bytes_total: 100,
            })
        }
    }

    #[async_trait]
    impl DownloadService for ScriptedService {
        async fn enqueue(&self, request: TransferRequest) -> Result<TransferId, AcquisitionError> {
            self.dest_existed_at_enqueue
                .lock()
                .unwrap()
                .push(request.destination.exists());
            *self.destination.lock().unwrap() = Some(request.destination.clone());
            self.enqueued.lock().unwrap().push(request);
            Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
        }

        async fn query(&self, _id: TransferId) -> Option<TransferSnapshot> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            let next = {
                let mut responses = self.responses.lock().unwrap();
                if responses.len() > 1 {
                    responses.pop_front()
                } else {
                    responses.front().cloned()
                }
            };
            let snapshot = next??;
            if snapshot.status == TransferStatus::Successful {
                let destination = self.destination.lock().unwrap().clone();
                if let Some(destination) = destination {
                    std::fs::write(destination, &self.success_payload).unwrap();
                }
            }
            Some(snapshot)
        }
    }

    #[derive(Default)]
    struct MemoryTokenStore {
        tokens: Mutex<HashMap<String, TransferId>>,
    }

    impl ResumeTokenStore for MemoryTokenStore {
        fn get(&self, model_id: &str) -> Option<TransferId> {
            self.tokens.lock().unwrap().get(model_id).copied()
        }

        fn set(&self, model_id: &str, id: TransferId) -> std::io::Result<()> {
            self.tokens.lock().unwrap().insert(model_id.into(), id);
            Ok(())
        }

        fn clear(&self, model_id: &str) -> std::io::Result<()> {
            self.tokens.lock().unwrap().remove(model_id);
            Ok(())
        }
    }

    fn coordinator(
        dir: &Path,
        service: &Arc<ScriptedService>,
        store: &Arc<MemoryTokenStore>,
    ) -> DownloadCoordinator {
        let model = test_model();
        let destination = dir.join(&model.filename);
        DownloadCoordinator::new(
            model,
            destination,
            Arc::clone(service) as Arc<dyn DownloadService>,
            Arc::clone(store) as Arc<dyn ResumeTokenStore>,
        )
    }

    /// Collect every emission (starting from the current value) until `stop`
    /// matches; panics if the machine stalls.
    async fn collect_until(
        rx: &mut watch::Receiver<DownloadState>,
        stop: impl Fn(&DownloadState) -> bool,
    ) -> Vec<DownloadState> {
        let mut seen = vec![rx.borrow_and_update().clone()];
        while !stop(seen.last().unwrap()) {
            tokio::time::timeout(Duration::from_secs(60), rx.changed())
                .await
                .expect("state machine stalled")
                .expect("coordinator dropped");
            seen.push(rx.borrow_and_update().clone());
        }
        seen
    }

    fn is_terminal(state: &DownloadState) -> bool {
        matches!(
            state,
            DownloadState::Acquired { .. } | DownloadState::NotAcquired { .. }
        )
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_short_circuits_on_verified_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        std::fs::write(dir.path().join("phi-2-q4_0.gguf"), PAYLOAD).unwrap();

        let coordinator = coordinator(dir.path(), &service, &store);
        coordinator.request_acquisition().await;

        assert_eq!(
            coordinator.state(),
            DownloadState::Acquired {
                local_path: dir.path().join("phi-2-q4_0.gguf")
            }
        );
        assert_eq!(service.enqueue_count(), 0);
        assert_eq!(service.query_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_without_file_or_token_is_not_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());

        let coordinator = coordinator(dir.path(), &service, &store);
        coordinator.request_acquisition().await;

        assert_eq!(
            coordinator.state(),
            DownloadState::NotAcquired { last_error: None }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_streams_progress_to_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        service.script(vec![
            ScriptedService::pending(),
            ScriptedService::running(50, 100),
            ScriptedService::successful(),
        ]);

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();

        coordinator.request_acquisition().await; // initialize
        assert_eq!(
            coordinator.state(),
            DownloadState::NotAcquired { last_error: None }
        );
        coordinator.request_acquisition().await; // acquire

        let states = collect_until(&mut rx, |s| {
            matches!(s, DownloadState::Acquired { .. })
        })
        .await;

        assert_eq!(service.enqueue_count(), 1);
        let request = service.enqueued.lock().unwrap()[0].clone();
        assert_eq!(request.url, test_model().url);
        assert_eq!(request.destination, dir.path().join("phi-2-q4_0.gguf"));

        assert!(states.contains(&DownloadState::InProgress {
            transfer_id: 1,
            progress: 0.0
        }));
        assert!(states.contains(&DownloadState::InProgress {
            transfer_id: 1,
            progress: 0.5
        }));
        assert_eq!(
            states.last().unwrap(),
            &DownloadState::Acquired {
                local_path: dir.path().join("phi-2-q4_0.gguf")
            }
        );
        // The resume token was written when the transfer was created.
        assert_eq!(store.get("phi-2-q4_0"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_requests_never_enqueue_twice() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        service.script(vec![
            ScriptedService::pending(),
            ScriptedService::pending(),
            ScriptedService::running(10, 100),
            ScriptedService::successful(),
        ]);

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();
        coordinator.request_acquisition().await;
        coordinator.request_acquisition().await;

        // Hammer the trigger while the transfer is live.
        collect_until(&mut rx, |s| matches!(s, DownloadState::InProgress { .. })).await;
        coordinator.request_acquisition().await;
        coordinator.request_acquisition().await;

        collect_until(&mut rx, is_terminal).await;
        assert_eq!(service.enqueue_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_token_restarts_polling_without_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("phi-2-q4_0.gguf");
        let service = ScriptedService::with_destination(PAYLOAD, &destination);
        let store = Arc::new(MemoryTokenStore::default());
        store.set("phi-2-q4_0", 42).unwrap();
        service.script(vec![
            ScriptedService::running(25, 100),
            ScriptedService::successful(),
        ]);

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();
        coordinator.request_acquisition().await;

        let states = collect_until(&mut rx, |s| {
            matches!(s, DownloadState::Acquired { .. })
        })
        .await;

        assert_eq!(service.enqueue_count(), 0);
        assert!(states.contains(&DownloadState::InProgress {
            transfer_id: 42,
            progress: 0.25
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_resume_token_is_cleared_on_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        store.set("phi-2-q4_0", 42).unwrap();
        // No script: every query answers None (transfer unknown).

        let coordinator = coordinator(dir.path(), &service, &store);
        coordinator.request_acquisition().await;

        assert_eq!(
            coordinator.state(),
            DownloadState::NotAcquired { last_error: None }
        );
        assert_eq!(store.get("phi-2-q4_0"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn hash_mismatch_deletes_file_and_starts_fresh_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("phi-2-q4_0.gguf");
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        std::fs::write(&destination, b"corrupt leftover").unwrap();
        service.script(vec![ScriptedService::successful()]);

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();
        coordinator.request_acquisition().await;
        // The stale file failed verification during initialization.
        assert_eq!(
            coordinator.state(),
            DownloadState::NotAcquired { last_error: None }
        );

        coordinator.request_acquisition().await;
        collect_until(&mut rx, |s| matches!(s, DownloadState::Acquired { .. })).await;

        assert_eq!(service.enqueue_count(), 1);
        // The stale artifact was gone before the new transfer was created.
        assert_eq!(service.dest_existed_at_enqueue.lock().unwrap()[0], false);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_never_regresses_for_one_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        service.script(vec![
            ScriptedService::running(50, 100),
            ScriptedService::running(30, 100), // service briefly reports less
            ScriptedService::running(80, 100),
            ScriptedService::successful(),
        ]);

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();
        coordinator.request_acquisition().await;
        coordinator.request_acquisition().await;
        let states = collect_until(&mut rx, is_terminal).await;

        let progresses: Vec<f32> = states
            .iter()
            .filter_map(|s| match s {
                DownloadState::InProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert_eq!(progresses, vec![0.5, 0.5, 0.8]);
        assert!(matches!(
            states.last().unwrap(),
            DownloadState::Acquired { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_recoverable_and_clears_the_token() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        service.script(vec![
            ScriptedService::running(10, 100),
            ScriptedService::failed("network gone"),
        ]);

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();
        coordinator.request_acquisition().await;
        coordinator.request_acquisition().await;
        let states = collect_until(&mut rx, is_terminal).await;

        assert_eq!(
            states.last().unwrap(),
            &DownloadState::NotAcquired {
                last_error: Some("Failed: network gone".into())
            }
        );
        assert_eq!(store.get("phi-2-q4_0"), None);

        // A fresh trigger starts a brand-new transfer and succeeds.
        service.script(vec![ScriptedService::successful()]);
        coordinator.request_acquisition().await;
        collect_until(&mut rx, |s| matches!(s, DownloadState::Acquired { .. })).await;
        assert_eq!(service.enqueue_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_payload_is_rejected_after_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(b"not what was promised");
        let store = Arc::new(MemoryTokenStore::default());
        service.script(vec![ScriptedService::successful()]);

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();
        coordinator.request_acquisition().await;
        coordinator.request_acquisition().await;
        let states = collect_until(&mut rx, is_terminal).await;

        match states.last().unwrap() {
            DownloadState::NotAcquired {
                last_error: Some(error),
            } => assert!(error.starts_with("Integrity mismatch"), "{error}"),
            other => panic!("unexpected terminal state {other:?}"),
        }
        assert!(!dir.path().join("phi-2-q4_0.gguf").exists());
        assert_eq!(store.get("phi-2-q4_0"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_settles_in_not_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let service = ScriptedService::new(PAYLOAD);
        let store = Arc::new(MemoryTokenStore::default());
        service.script(vec![ScriptedService::pending()]); // never terminal

        let coordinator = coordinator(dir.path(), &service, &store);
        let mut rx = coordinator.observe();
        coordinator.request_acquisition().await;
        coordinator.request_acquisition().await;
        collect_until(&mut rx, |s| matches!(s, DownloadState::InProgress { .. })).await;

        coordinator.cancel();
        let states = collect_until(&mut rx, is_terminal).await;
        assert_eq!(
            states.last().unwrap(),
            &DownloadState::NotAcquired {
                last_error: Some("cancelled".into())
            }
        );
    }
}
