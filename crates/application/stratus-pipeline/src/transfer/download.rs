use camino::Utf8Path;
use reqwest::StatusCode;
use stratus_core::TransferRecord;

use super::{status_error, TransferEnv, TransferScope};
use crate::io_utils::{partial_path, remove_best_effort, robust_rename};
use crate::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub etag: Option<String>,
    pub bytes: u64,
}

/// GET into `<target>.part`, then rename over the target.
pub struct Downloader<'a> {
    env: &'a TransferEnv,
}

impl<'a> Downloader<'a> {
    pub fn new(env: &'a TransferEnv) -> Self {
        Self { env }
    }

    pub async fn download(
        &self,
        record: &TransferRecord,
        scope: &TransferScope,
    ) -> Result<DownloadOutcome, TransferError> {
        let url = self
            .env
            .endpoints
            .file_url(&record.remote_path, record.space_id.as_deref())?;
        let dest = Utf8Path::new(&record.local_path);
        let part = partial_path(dest);

        scope.check_cancelled()?;
        tracing::debug!(transfer = %record.id, %url, %dest, "downloading");
        let resp = match self
            .env
            .client
            .download_to(url.clone(), Vec::new(), &part, &scope.request_ctx())
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                remove_best_effort(&part).await;
                return Err(e.into());
            }
        };
        if resp.status == StatusCode::NOT_FOUND || resp.status == StatusCode::GONE {
            return Err(TransferError::RemoteNotFound {
                url: url.to_string(),
            });
        }
        if !resp.status.is_success() {
            return Err(status_error("GET", &url, &resp));
        }

        let bytes = tokio::fs::metadata(&part)
            .await
            .map_err(|source| TransferError::LocalIo {
                path: part.to_string(),
                source,
            })?
            .len();
        robust_rename(&part, dest)
            .await
            .map_err(|source| TransferError::LocalIo {
                path: dest.to_string(),
                source,
            })?;
        scope.progress.observe(bytes);
        tracing::info!(transfer = %record.id, bytes, %dest, "download complete");
        Ok(DownloadOutcome {
            etag: resp.etag(),
            bytes,
        })
    }
}
