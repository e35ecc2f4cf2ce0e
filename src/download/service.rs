use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::AcquisitionError;

/// Identifier the download service assigns to one tracked transfer.
pub type TransferId = u64;

/// External status of a tracked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Running,
    Paused,
    Failed,
    Successful,
}

/// Point-in-time answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub status: TransferStatus,
    pub reason: Option<String>,
    pub bytes_downloaded: u64,
    /// Zero when the total is not yet known.
    pub bytes_total: u64,
}

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
}

/// Transport that tracks resumable transfers by id.
///
/// `query` returning `None` means the service no longer knows the transfer,
/// e.g. a persisted resume token that outlived the service's bookkeeping.
#[async_trait]
pub trait DownloadService: Send + Sync {
    /// Start a transfer, returning its id immediately.
    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId, AcquisitionError>;

    /// Current status of a transfer, or `None` if unknown.
    async fn query(&self, id: TransferId) -> Option<TransferSnapshot>;
}

struct TransferRecord {
    snapshot: TransferSnapshot,
    cancel: CancellationToken,
}

/// HTTP implementation of [`DownloadService`] backed by reqwest.
///
/// Each transfer streams the response body into `<destination>.partial`,
/// resuming from the partial file's length with a `Range` header, and is
/// renamed to the final destination only after the body completes.
pub struct HttpDownloadService {
    client: reqwest::Client,
    next_id: AtomicU64,
    transfers: Arc<Mutex<HashMap<TransferId, TransferRecord>>>,
}

impl HttpDownloadService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cancel a live transfer. It surfaces as `Failed` afterwards.
    /// Returns false when the id is unknown.
    pub fn cancel(&self, id: TransferId) -> bool {
        let transfers = self.transfers.lock().unwrap();
        match transfers.get(&id) {
            Some(record) => {
                info!("transfer {}: cancellation requested", id);
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn update(
        transfers: &Mutex<HashMap<TransferId, TransferRecord>>,
        id: TransferId,
        apply: impl FnOnce(&mut TransferSnapshot),
    ) {
        if let Some(record) = transfers.lock().unwrap().get_mut(&id) {
            apply(&mut record.snapshot);
        }
    }

    async fn run_transfer(
        client: reqwest::Client,
        transfers: Arc<Mutex<HashMap<TransferId, TransferRecord>>>,
        id: TransferId,
        url: String,
        destination: PathBuf,
        cancel: CancellationToken,
    ) {
        match Self::stream_to_disk(&client, &transfers, id, &url, &destination, &cancel).await {
            Ok(()) => {
                info!("transfer {}: complete, {:?}", id, destination);
                Self::update(&transfers, id, |s| {
                    s.status = TransferStatus::Successful;
                    s.reason = None;
                });
            }
            Err(e) => {
                warn!("transfer {}: failed: {}", id, e);
                Self::update(&transfers, id, |s| {
                    s.status = TransferStatus::Failed;
                    s.reason = Some(e.to_string());
                });
            }
        }
    }

    async fn stream_to_disk(
        client: &reqwest::Client,
        transfers: &Mutex<HashMap<TransferId, TransferRecord>>,
        id: TransferId,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AcquisitionError> {
        let partial = partial_path(destination);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let resume_from = match tokio::fs::metadata(&partial).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let mut request = client.get(url);
        if resume_from > 0 {
            debug!("transfer {}: resuming at byte {}", id, resume_from);
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
        }

        let response = request.send().await.map_err(|e| {
            AcquisitionError::TransportFailure {
                reason: e.to_string(),
            }
        })?;

        if !response.status().is_success()
            && response.status() != reqwest::StatusCode::PARTIAL_CONTENT
        {
            return Err(AcquisitionError::TransportFailure {
                reason: format!("HTTP {}", response.status()),
            });
        }

        // A server that ignored the Range header sends the whole body again.
        let resume_from = if resume_from > 0 && response.status() != reqwest::StatusCode::PARTIAL_CONTENT
        {
            0
        } else {
            resume_from
        };

        let bytes_total = response
            .content_length()
            .map(|len| len + resume_from)
            .unwrap_or(0);

        let file = if resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await?
        } else {
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&partial)
                .await?
        };
        let mut file = tokio::io::BufWriter::new(file);

        Self::update(transfers, id, |s| {
            s.status = TransferStatus::Running;
            s.bytes_downloaded = resume_from;
            s.bytes_total = bytes_total;
        });

        let mut stream = response.bytes_stream();
        let mut downloaded = resume_from;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(AcquisitionError::TransportFailure {
                    reason: "cancelled".into(),
                });
            }

            let chunk = chunk.map_err(|e| AcquisitionError::TransportFailure {
                reason: e.to_string(),
            })?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            Self::update(transfers, id, |s| s.bytes_downloaded = downloaded);
        }

        file.flush().await?;
        tokio::fs::rename(&partial, destination).await?;
        Ok(())
    }
}

impl Default for HttpDownloadService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadService for HttpDownloadService {
    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId, AcquisitionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut transfers = self.transfers.lock().unwrap();
            transfers.insert(
                id,
                TransferRecord {
                    snapshot: TransferSnapshot {
                        status: TransferStatus::Pending,
                        reason: None,
                        bytes_downloaded: 0,
                        bytes_total: 0,
                    },
                    cancel: cancel.clone(),
                },
            );
        }
        info!("transfer {}: enqueued {}", id, request.url);

        let client = self.client.clone();
        let transfers = Arc::clone(&self.transfers);
        tokio::spawn(async move {
            Self::run_transfer(
                client,
                transfers,
                id,
                request.url,
                request.destination,
                cancel,
            )
            .await;
        });

        Ok(id)
    }

    async fn query(&self, id: TransferId) -> Option<TransferSnapshot> {
        self.transfers
            .lock()
            .unwrap()
            .get(&id)
            .map(|record| record.snapshot.clone())
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}
