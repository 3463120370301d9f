//! Cloud-style backend connector.
//!
//! A star-topology remote replica reached by uploading changed records and
//! downloading everything since a marker. Records coming back go through the
//! same resolver path as mesh traffic.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tandem_engine::{CausalOrder, RecordId, Timestamp, VectorClock};

use crate::error::{MeshError, Result};
use crate::protocol::RecordPayload;
use crate::replica::Replica;

/// Peer id used for records that came from the backend.
pub const BACKEND_PEER: &str = "backend";

/// Default page size for downloads.
const DEFAULT_PAGE: usize = 100;

/// Response to an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    /// Records stored at the uploaded clock
    pub accepted: Vec<RecordId>,
    /// Records the backend already holds a newer copy of
    pub rejected: Vec<RecordId>,
}

/// One page of a download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Download {
    pub records: Vec<RecordPayload>,
    /// Marker to pass to the next download
    pub marker: Option<String>,
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn upload_changed(&self, records: Vec<RecordPayload>) -> Result<UploadAck>;

    async fn download_since(&self, marker: Option<String>, limit: usize) -> Result<Download>;
}

/// Counts from one backend cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSyncResult {
    pub downloaded: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub uploaded: usize,
    pub rejected: usize,
}

/// Runs download-then-upload cycles against a backend.
pub struct BackendSync {
    replica: Arc<Replica>,
    backend: Arc<dyn RemoteBackend>,
    marker: tokio::sync::Mutex<Option<String>>,
}

impl BackendSync {
    pub fn new(replica: Arc<Replica>, backend: Arc<dyn RemoteBackend>) -> Self {
        Self {
            replica,
            backend,
            marker: tokio::sync::Mutex::new(None),
        }
    }

    /// Marker of the last downloaded page.
    pub async fn marker(&self) -> Option<String> {
        self.marker.lock().await.clone()
    }

    /// Pull remote changes, then push local ones.
    pub async fn sync(&self, now: Timestamp) -> Result<BackendSyncResult> {
        // Held for the whole cycle so two cycles never interleave
        let mut marker = self.marker.lock().await;
        let mut result = BackendSyncResult::default();

        loop {
            let page = self
                .backend
                .download_since(marker.clone(), DEFAULT_PAGE)
                .await?;
            result.downloaded += page.records.len();

            for payload in page.records {
                let record = match payload.into_record() {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!("Skipping invalid backend record: {}", e);
                        continue;
                    }
                };
                let outcome = self.replica.apply_remote(&record, BACKEND_PEER, now).await?;
                if outcome.is_applied() {
                    result.applied += 1;
                }
                if outcome.is_conflict() {
                    result.conflicts += 1;
                }
            }

            if page.marker.is_some() {
                *marker = page.marker;
            }
            if !page.has_more {
                break;
            }
        }

        let dirty = self.replica.repository().dirty_records().await?;
        if !dirty.is_empty() {
            let sent: Vec<(RecordId, VectorClock)> = dirty
                .iter()
                .map(|r| (r.id.clone(), r.clock.clone()))
                .collect();
            let ack = self
                .backend
                .upload_changed(dirty.iter().map(RecordPayload::from).collect())
                .await?;

            let acked: Vec<(RecordId, VectorClock)> = sent
                .into_iter()
                .filter(|(id, _)| ack.accepted.contains(id))
                .collect();
            result.uploaded = self.replica.repository().mark_acknowledged(acked).await?;
            result.rejected = ack.rejected.len();
        }

        tracing::info!(
            downloaded = result.downloaded,
            applied = result.applied,
            conflicts = result.conflicts,
            uploaded = result.uploaded,
            rejected = result.rejected,
            "Backend sync finished"
        );
        Ok(result)
    }
}

/// In-memory backend keeping an append-only change log.
///
/// An upload is rejected when the backend's copy causally dominates it;
/// anything else is appended and becomes visible to later downloads.
#[derive(Default)]
pub struct MemoryBackend {
    log: Mutex<Vec<RecordPayload>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries in the change log.
    pub fn len(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest logged copy of a record.
    pub fn latest(&self, id: &str) -> Option<RecordPayload> {
        let log = self.log.lock().ok()?;
        log.iter().rev().find(|r| r.id == id).cloned()
    }
}

fn poisoned() -> MeshError {
    MeshError::Backend("backend state poisoned".into())
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn upload_changed(&self, records: Vec<RecordPayload>) -> Result<UploadAck> {
        let mut log = self.log.lock().map_err(|_| poisoned())?;
        let mut ack = UploadAck::default();

        for record in records {
            let newer = log
                .iter()
                .rev()
                .find(|stored| stored.id == record.id)
                .map(|stored| stored.clock.compare(&record.clock) == CausalOrder::After)
                .unwrap_or(false);
            if newer {
                ack.rejected.push(record.id);
                continue;
            }
            ack.accepted.push(record.id.clone());
            log.push(record);
        }
        Ok(ack)
    }

    async fn download_since(&self, marker: Option<String>, limit: usize) -> Result<Download> {
        let start = match marker.as_deref() {
            None | Some("") => 0,
            Some(m) => m
                .parse::<usize>()
                .map_err(|_| MeshError::Backend(format!("invalid marker {m}")))?,
        };
        let log = self.log.lock().map_err(|_| poisoned())?;
        let start = start.min(log.len());
        let end = start.saturating_add(limit.max(1)).min(log.len());

        Ok(Download {
            records: log[start..end].to_vec(),
            marker: Some(end.to_string()),
            has_more: end < log.len(),
        })
    }
}
