//! Upload and download drivers.
//!
//! Drivers perform the protocol exchange for one record and raise
//! [`TransferError`]s. They never decide whether a failure is retried; the
//! worker does that once, from [`TransferError::classify`].

use camino::Utf8Path;
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use stratus_core::TransferRecord;
use stratus_infra::{ChunkReader, RequestContext, TransferClient, TransferResponse};
use stratus_persistence::TransferRecordStore;
use tokio_util::sync::CancellationToken;

use crate::tracker::ProgressReporter;
use crate::{DavEndpoints, TransferError, TransferOptions};

mod chunked;
mod download;
mod selector;
mod single;
mod tus;

pub use chunked::ChunkedUploadDriver;
pub use download::{DownloadOutcome, Downloader};
pub use selector::StrategySelector;
pub use single::SinglePutUploader;
pub use tus::TusDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Tus,
    Chunked,
    SinglePut,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Tus => "tus",
            Strategy::Chunked => "chunked",
            Strategy::SinglePut => "single-put",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counters, mostly for tests and debug logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub requests: u32,
    pub patch_calls: u32,
    pub backoffs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub strategy: Strategy,
    pub etag: Option<String>,
    pub bytes: u64,
    pub stats: DriverStats,
    /// Set when this strategy replaced an abandoned resumable attempt.
    pub fallback_from: Option<Strategy>,
}

/// Collaborators shared by every driver.
#[derive(Clone)]
pub struct TransferEnv {
    pub client: Arc<dyn TransferClient>,
    pub store: Arc<dyn TransferRecordStore>,
    pub endpoints: DavEndpoints,
    pub options: TransferOptions,
}

impl TransferEnv {
    pub fn new(
        client: Arc<dyn TransferClient>,
        store: Arc<dyn TransferRecordStore>,
        endpoints: DavEndpoints,
        options: TransferOptions,
    ) -> Self {
        Self {
            client,
            store,
            endpoints,
            options,
        }
    }
}

/// Per-run cancellation and progress.
#[derive(Clone)]
pub struct TransferScope {
    pub cancel: CancellationToken,
    pub progress: Arc<ProgressReporter>,
}

impl TransferScope {
    pub fn new(cancel: CancellationToken, progress: Arc<ProgressReporter>) -> Self {
        Self { cancel, progress }
    }

    /// Context for requests whose body bytes count as progress.
    pub fn request_ctx(&self) -> RequestContext {
        RequestContext::new(self.cancel.clone()).with_progress(self.progress.callback())
    }

    /// Context for control requests.
    pub fn control_ctx(&self) -> RequestContext {
        RequestContext::new(self.cancel.clone())
    }

    pub fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }
}

pub(crate) fn unix_mtime(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

/// Open the upload source of `record`, returning it with its mtime.
pub(crate) fn open_source(record: &TransferRecord) -> Result<(ChunkReader, Option<i64>), TransferError> {
    let path = Utf8Path::new(&record.local_path);
    let reader = ChunkReader::open(path).map_err(|e| TransferError::local(&record.local_path, e))?;
    let mtime = std::fs::metadata(path)
        .ok()
        .as_ref()
        .and_then(unix_mtime);
    Ok((reader, mtime))
}

/// Whole-file `MD5:<hex>` when checksums are enabled. Hashing runs off the runtime threads.
pub(crate) async fn content_checksum(
    reader: &ChunkReader,
    options: &TransferOptions,
) -> Result<Option<String>, TransferError> {
    if !options.checksums {
        return Ok(None);
    }
    let reader = reader.clone();
    let path = reader.path().to_string();
    let sum = tokio::task::spawn_blocking(move || reader.checksum())
        .await
        .map_err(|e| TransferError::invalid(format!("checksum task failed: {e}")))?
        .map_err(|e| TransferError::local(&path, e))?;
    Ok(Some(sum))
}

/// Map a non-2xx answer onto the error taxonomy.
pub(crate) fn status_error(method: &str, url: &Url, resp: &TransferResponse) -> TransferError {
    match resp.status {
        StatusCode::UNAUTHORIZED => TransferError::Unauthorized {
            status: resp.status,
        },
        StatusCode::FORBIDDEN => TransferError::Forbidden {
            url: url.to_string(),
        },
        StatusCode::PRECONDITION_FAILED => TransferError::PreconditionFailed {
            url: url.to_string(),
        },
        status => TransferError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status,
        },
    }
}

pub(crate) fn expect_success(
    method: &str,
    url: &Url,
    resp: TransferResponse,
) -> Result<TransferResponse, TransferError> {
    if resp.status.is_success() {
        Ok(resp)
    } else {
        Err(status_error(method, url, &resp))
    }
}

pub(crate) fn child_url(parent: &Url, name: &str) -> Result<Url, TransferError> {
    let mut url = parent.clone();
    url.path_segments_mut()
        .map_err(|_| TransferError::invalid(format!("{parent} cannot hold a path")))?
        .pop_if_empty()
        .push(name);
    Ok(url)
}

pub(crate) async fn sleep_cancellable(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod testing;
