use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use std::sync::Arc;
use stratus_core::TusSupport;
use tokio_util::sync::CancellationToken;

mod client;

pub use client::{default_http_client, ReqwestTransferClient};

pub const TUS_RESUMABLE: &str = "Tus-Resumable";
pub const TUS_VERSION: &str = "Tus-Version";
pub const TUS_EXTENSION: &str = "Tus-Extension";
pub const TUS_MAX_SIZE: &str = "Tus-Max-Size";
pub const TUS_MAX_CHUNK_SIZE: &str = "Tus-Max-Chunk-Size";
pub const UPLOAD_OFFSET: &str = "Upload-Offset";
pub const UPLOAD_LENGTH: &str = "Upload-Length";
pub const UPLOAD_METADATA: &str = "Upload-Metadata";
pub const UPLOAD_EXPIRES: &str = "Upload-Expires";
pub const UPLOAD_CHECKSUM: &str = "Upload-Checksum";
pub const METHOD_OVERRIDE: &str = "X-HTTP-Method-Override";
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Bytes-sent (or received) delta callback.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// Stream `len` bytes of `path` starting at `offset`.
    FileWindow {
        path: Utf8PathBuf,
        offset: u64,
        len: u64,
    },
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Bytes(b) => b.len() as u64,
            RequestBody::FileWindow { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl TransferRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header_opt(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.header(name, v),
            None => self,
        }
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransferResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.header(name).and_then(|v| v.trim().parse().ok())
    }

    /// Entity-tag of the written resource (`OC-ETag` wins over `ETag`).
    pub fn etag(&self) -> Option<String> {
        self.header("OC-ETag")
            .or_else(|| self.header("ETag"))
            .map(|e| e.to_string())
    }
}

/// Per-request cooperative controls.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub cancel: CancellationToken,
    pub progress: Option<ProgressFn>,
}

impl RequestContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) fn report(&self, delta: u64) {
        if let Some(cb) = &self.progress {
            cb(delta);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("{method} {url} failed: {message}")]
    Transport {
        method: String,
        url: String,
        message: String,
        timeout: bool,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("local IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Authenticated HTTP client used by the transfer drivers.
///
/// Non-2xx answers are returned as responses, not errors; only transport
/// failures, cancellation and local I/O surface as [`HttpError`].
#[async_trait::async_trait]
pub trait TransferClient: Send + Sync {
    async fn send(
        &self,
        req: TransferRequest,
        ctx: &RequestContext,
    ) -> Result<TransferResponse, HttpError>;

    /// GET `url` and stream a 2xx body into `dest`. Other statuses leave
    /// `dest` untouched and are returned as-is.
    async fn download_to(
        &self,
        url: Url,
        headers: Vec<(String, String)>,
        dest: &Utf8Path,
        ctx: &RequestContext,
    ) -> Result<TransferResponse, HttpError>;
}

/// Ask a collection which resumable-upload features the server offers.
pub async fn probe_tus(
    client: &dyn TransferClient,
    collection: Url,
    ctx: &RequestContext,
) -> Result<Option<TusSupport>, HttpError> {
    let resp = client
        .send(
            TransferRequest::new(Method::OPTIONS, collection)
                .header(TUS_RESUMABLE, stratus_config::TUS_VERSION),
            ctx,
        )
        .await?;
    if !resp.status.is_success() {
        tracing::debug!("OPTIONS returned {}; resumable uploads unavailable", resp.status);
        return Ok(None);
    }
    let tus = TusSupport::from_headers(
        resp.header(TUS_VERSION),
        resp.header(TUS_EXTENSION),
        resp.header(TUS_MAX_SIZE),
    )
    .map(|tus| tus.with_transport_hints(resp.header(TUS_MAX_CHUNK_SIZE), resp.header("Allow")));
    Ok(tus)
}

/// Encode `Upload-Metadata`: comma separated `key base64(value)` pairs.
pub fn encode_upload_metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k} {}", STANDARD.encode(v.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}
