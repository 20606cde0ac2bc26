//! Per-file synchronization: feeds stored sync state and the live remote
//! entity-tag into [`decide`] and turns the verdict into queued work.

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use stratus_core::path_utils::RemotePath;
use stratus_core::{
    decide, RemoteFileState, SyncVerdict, TransferDirection, TransferId, TransferRecord,
};
use stratus_infra::net::{RequestContext, TransferClient, TransferRequest};
use stratus_persistence::{FileSyncStore, TransferRecordStore};
use tokio_util::sync::CancellationToken;

use crate::io_utils::robust_rename;
use crate::scheduler::TransferScheduler;
use crate::transfer::{status_error, unix_mtime};
use crate::{DavEndpoints, TransferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    AlreadySynchronized,
    UploadEnqueued(TransferId),
    DownloadEnqueued(TransferId),
    ConflictDetected(String),
    ConflictResolvedWithCopy(Utf8PathBuf),
    FileNotFound,
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub account: String,
    pub remote_path: String,
    pub local_path: Utf8PathBuf,
    pub mime_type: String,
    pub space_id: Option<String>,
}

impl SyncRequest {
    pub fn new(
        account: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            account: account.into(),
            remote_path: RemotePath::normalize(&remote_path.into()),
            local_path: local_path.into(),
            mime_type: "application/octet-stream".to_string(),
            space_id: None,
        }
    }
}

/// What the server currently holds at one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub state: RemoteFileState,
    /// `Content-Length` of the server copy, when reported.
    pub size: Option<u64>,
}

impl RemoteEntry {
    pub fn missing() -> Self {
        Self {
            state: RemoteFileState::Missing,
            size: None,
        }
    }

    pub fn present(etag: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            state: RemoteFileState::Present { etag: etag.into() },
            size,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        match &self.state {
            RemoteFileState::Present { etag } => Some(etag),
            RemoteFileState::Missing => None,
        }
    }
}

/// Where the current remote entity-tag comes from.
#[async_trait::async_trait]
pub trait RemoteEtagSource: Send + Sync {
    async fn lookup(
        &self,
        remote_path: &str,
        space_id: Option<&str>,
    ) -> Result<RemoteEntry, TransferError>;
}

/// Live lookup through a HEAD request.
pub struct HttpEtagSource {
    client: Arc<dyn TransferClient>,
    endpoints: DavEndpoints,
    cancel: CancellationToken,
}

impl HttpEtagSource {
    pub fn new(
        client: Arc<dyn TransferClient>,
        endpoints: DavEndpoints,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            endpoints,
            cancel,
        }
    }
}

#[async_trait::async_trait]
impl RemoteEtagSource for HttpEtagSource {
    async fn lookup(
        &self,
        remote_path: &str,
        space_id: Option<&str>,
    ) -> Result<RemoteEntry, TransferError> {
        let url = self.endpoints.file_url(remote_path, space_id)?;
        let resp = self
            .client
            .send(
                TransferRequest::new(Method::HEAD, url.clone()),
                &RequestContext::new(self.cancel.clone()),
            )
            .await?;
        if resp.status == StatusCode::NOT_FOUND || resp.status == StatusCode::GONE {
            return Ok(RemoteEntry::missing());
        }
        if !resp.status.is_success() {
            return Err(status_error("HEAD", &url, &resp));
        }
        let etag = resp.etag().ok_or(TransferError::MissingHeader {
            header: "ETag",
            context: "remote state lookup",
        })?;
        Ok(RemoteEntry::present(etag, resp.header_u64("Content-Length")))
    }
}

pub struct SyncService {
    store: Arc<dyn TransferRecordStore>,
    files: Arc<dyn FileSyncStore>,
    remote: Arc<dyn RemoteEtagSource>,
    scheduler: Option<TransferScheduler>,
}

fn disk_mtime(path: &Utf8Path) -> Option<(i64, u64)> {
    let meta = std::fs::metadata(path).ok().filter(|m| m.is_file())?;
    Some((unix_mtime(&meta).unwrap_or_default(), meta.len()))
}

impl SyncService {
    pub fn new(
        store: Arc<dyn TransferRecordStore>,
        files: Arc<dyn FileSyncStore>,
        remote: Arc<dyn RemoteEtagSource>,
    ) -> Self {
        Self {
            store,
            files,
            remote,
            scheduler: None,
        }
    }

    /// Hand enqueued records straight to a running scheduler.
    pub fn with_scheduler(mut self, scheduler: TransferScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub async fn synchronize(&self, req: &SyncRequest) -> Result<SyncDecision, TransferError> {
        let mut stored = self
            .files
            .load_file_state(&req.account, &req.remote_path)?
            .unwrap_or_default();
        let disk = disk_mtime(&req.local_path);
        let local = stored.to_local_state(disk.map(|(mtime, _)| mtime));
        let remote = self
            .remote
            .lookup(&req.remote_path, req.space_id.as_deref())
            .await?;

        let verdict = decide(&local, &remote.state);
        tracing::debug!(remote = %req.remote_path, ?verdict, "sync decision");
        match verdict {
            SyncVerdict::AlreadySynchronized => Ok(SyncDecision::AlreadySynchronized),
            SyncVerdict::FileNotFound => Ok(SyncDecision::FileNotFound),
            SyncVerdict::Upload => {
                let size = disk.map(|(_, len)| len).unwrap_or_default();
                let mut record = TransferRecord::new_upload(
                    req.account.as_str(),
                    req.local_path.as_str(),
                    req.remote_path.as_str(),
                    req.mime_type.as_str(),
                    size,
                );
                // Refuse to overwrite a server copy we have not seen.
                if let Some(etag) = &stored.synced_etag {
                    record = record.with_required_etag(etag.as_str());
                }
                self.enqueue(record, req).map(SyncDecision::UploadEnqueued)
            }
            SyncVerdict::Download => self
                .enqueue_download(req, remote.size.unwrap_or_default())
                .map(SyncDecision::DownloadEnqueued),
            SyncVerdict::Conflict { remote_etag } => {
                tracing::info!(remote = %req.remote_path, etag = %remote_etag, "conflict detected");
                stored.conflict_etag = Some(remote_etag.clone());
                self.files
                    .save_file_state(&req.account, &req.remote_path, &stored)?;
                Ok(SyncDecision::ConflictDetected(remote_etag))
            }
        }
    }

    /// Keep the local edit under a "conflicted copy" name and fetch the server version.
    ///
    /// Only valid after [`Self::synchronize`] recorded a conflict for the file.
    pub async fn resolve_with_copy(
        &self,
        req: &SyncRequest,
    ) -> Result<SyncDecision, TransferError> {
        let mut stored = self
            .files
            .load_file_state(&req.account, &req.remote_path)?
            .unwrap_or_default();
        if stored.conflict_etag.is_none() {
            return Err(TransferError::NoConflict {
                remote_path: req.remote_path.clone(),
            });
        }
        let remote = self
            .remote
            .lookup(&req.remote_path, req.space_id.as_deref())
            .await?;

        let file_name = req.local_path.file_name().ok_or_else(|| {
            TransferError::invalid(format!("{} has no file name", req.local_path))
        })?;
        let stamp = chrono::Local::now().format("%Y-%m-%d %H%M%S").to_string();
        let copy = req
            .local_path
            .with_file_name(RemotePath::conflicted_copy_name(file_name, &stamp));

        if disk_mtime(&req.local_path).is_some() {
            robust_rename(&req.local_path, &copy)
                .await
                .map_err(|source| TransferError::LocalIo {
                    path: req.local_path.to_string(),
                    source,
                })?;
            tracing::info!(from = %req.local_path, to = %copy, "kept local edit as conflicted copy");
        }

        stored.conflict_etag = None;
        self.files
            .save_file_state(&req.account, &req.remote_path, &stored)?;

        self.enqueue_download(req, remote.size.unwrap_or_default())?;
        Ok(SyncDecision::ConflictResolvedWithCopy(copy))
    }

    fn enqueue_download(&self, req: &SyncRequest, size: u64) -> Result<TransferId, TransferError> {
        let record = TransferRecord::new_download(
            req.account.as_str(),
            req.remote_path.as_str(),
            req.local_path.as_str(),
            size,
        );
        self.enqueue(record, req)
    }

    /// Insert `record` unless an unfinished transfer for the same file and
    /// direction exists; that one is reused.
    fn enqueue(
        &self,
        mut record: TransferRecord,
        req: &SyncRequest,
    ) -> Result<TransferId, TransferError> {
        if let Some(space) = &req.space_id {
            record = record.with_space(space.as_str());
        }
        let existing = self
            .store
            .list_by_account(&req.account)?
            .into_iter()
            .find(|r| {
                !r.status.is_terminal()
                    && r.direction == record.direction
                    && r.remote_path == record.remote_path
            });
        let id = match existing {
            Some(r) => {
                tracing::debug!(transfer = %r.id, "reusing pending transfer");
                r.id
            }
            None => {
                self.store.insert(&record)?;
                let kind = match record.direction {
                    TransferDirection::Upload => "upload",
                    TransferDirection::Download => "download",
                };
                tracing::info!(transfer = %record.id, remote = %record.remote_path, "{kind} enqueued");
                record.id
            }
        };
        if let Some(scheduler) = &self.scheduler {
            scheduler.enqueue(&id);
        }
        Ok(id)
    }
}
