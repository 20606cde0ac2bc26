use reqwest::Method;
use stratus_core::TransferRecord;
use stratus_infra::net::{RequestBody, TransferRequest};

use super::{
    content_checksum, expect_success, open_source, DriverStats, Strategy, TransferEnv,
    TransferScope, UploadOutcome,
};
use crate::TransferError;

/// Whole-file PUT for small files and servers without chunking support.
pub struct SinglePutUploader<'a> {
    env: &'a TransferEnv,
}

impl<'a> SinglePutUploader<'a> {
    pub fn new(env: &'a TransferEnv) -> Self {
        Self { env }
    }

    pub async fn upload(
        &self,
        record: &TransferRecord,
        scope: &TransferScope,
    ) -> Result<UploadOutcome, TransferError> {
        let (reader, mtime) = open_source(record)?;
        let checksum = content_checksum(&reader, &self.env.options).await?;
        let url = self
            .env
            .endpoints
            .file_url(&record.remote_path, record.space_id.as_deref())?;

        let body = if reader.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::FileWindow {
                path: reader.path().to_path_buf(),
                offset: 0,
                len: reader.len(),
            }
        };
        let req = TransferRequest::new(Method::PUT, url.clone())
            .header("Content-Type", record.mime_type.as_str())
            .header("OC-Total-Length", reader.len().to_string())
            .header_opt("X-OC-Mtime", mtime.map(|m| m.to_string()).as_deref())
            .header_opt("If-Match", record.if_match())
            .header_opt("OC-Checksum", checksum.as_deref())
            .body(body);

        scope.check_cancelled()?;
        tracing::debug!(transfer = %record.id, %url, bytes = reader.len(), "uploading with a single PUT");
        let resp = self.env.client.send(req, &scope.request_ctx()).await?;
        let resp = expect_success("PUT", &url, resp)?;
        scope.progress.observe(reader.len());

        Ok(UploadOutcome {
            strategy: Strategy::SinglePut,
            etag: resp.etag(),
            bytes: reader.len(),
            stats: DriverStats {
                requests: 1,
                ..DriverStats::default()
            },
            fallback_from: None,
        })
    }
}
