use reqwest::{Method, StatusCode};
use stratus_core::TransferRecord;
use stratus_infra::net::{RequestBody, TransferRequest};

use super::{
    child_url, content_checksum, expect_success, open_source, DriverStats, Strategy, TransferEnv,
    TransferScope, UploadOutcome,
};
use crate::TransferError;

/// Legacy chunk-then-assemble upload: MKCOL a staging collection, PUT
/// numbered chunks into it, then MOVE its `.file` onto the target.
///
/// A failure before the MOVE leaves the staging collection behind; every
/// attempt uses a fresh one.
pub struct ChunkedUploadDriver<'a> {
    env: &'a TransferEnv,
}

fn dav_method(name: &'static str) -> Result<Method, TransferError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| TransferError::invalid(format!("method {name}: {e}")))
}

/// Unique per record and attempt, so concurrent uploads of one path never collide.
fn staging_name(record: &TransferRecord) -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros());
    let seed = format!("{}:{}:{nanos}", record.remote_path, record.id);
    format!("{:x}", md5::compute(seed.as_bytes()))
}

impl<'a> ChunkedUploadDriver<'a> {
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
        let target = self
            .env
            .endpoints
            .file_url(&record.remote_path, record.space_id.as_deref())?;
        let staging = self.env.endpoints.staging_url(&staging_name(record))?;
        let mut stats = DriverStats::default();

        tracing::debug!(transfer = %record.id, %staging, "creating staging collection");
        stats.requests += 1;
        let resp = self
            .env
            .client
            .send(
                TransferRequest::new(dav_method("MKCOL")?, staging.clone()),
                &scope.control_ctx(),
            )
            .await?;
        expect_success("MKCOL", &staging, resp)?;

        let windows = reader.windows(self.env.options.legacy_chunk_size);
        let total = windows.len();
        for (index, (offset, len)) in windows.into_iter().enumerate() {
            scope.check_cancelled()?;
            let chunk_url = child_url(&staging, &format!("{index:08}"))?;
            let req = TransferRequest::new(Method::PUT, chunk_url.clone())
                .header("Content-Type", "application/octet-stream")
                .body(RequestBody::FileWindow {
                    path: reader.path().to_path_buf(),
                    offset,
                    len,
                });
            stats.requests += 1;
            let resp = self.env.client.send(req, &scope.request_ctx()).await?;
            expect_success("PUT", &chunk_url, resp)?;
            scope.progress.observe(offset + len);
            tracing::debug!(transfer = %record.id, chunk = index + 1, total, "chunk stored");
        }

        scope.check_cancelled()?;
        let assembly = child_url(&staging, ".file")?;
        let req = TransferRequest::new(dav_method("MOVE")?, assembly.clone())
            .header("Destination", target.as_str())
            .header("Overwrite", "T")
            .header("OC-Total-Length", reader.len().to_string())
            .header_opt("X-OC-Mtime", mtime.map(|m| m.to_string()).as_deref())
            .header_opt("If-Match", record.if_match())
            .header_opt("OC-Checksum", checksum.as_deref());
        stats.requests += 1;
        let resp = self.env.client.send(req, &scope.control_ctx()).await?;
        if resp.status == StatusCode::PRECONDITION_FAILED {
            return Err(TransferError::PreconditionFailed {
                url: target.to_string(),
            });
        }
        let resp = expect_success("MOVE", &assembly, resp)?;

        tracing::info!(transfer = %record.id, chunks = total, bytes = reader.len(), "chunked upload assembled");
        Ok(UploadOutcome {
            strategy: Strategy::Chunked,
            etag: resp.etag(),
            bytes: reader.len(),
            stats,
            fallback_from: None,
        })
    }
}
