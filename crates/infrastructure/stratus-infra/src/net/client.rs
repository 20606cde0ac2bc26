use camino::Utf8Path;
use futures::stream::StreamExt;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{InsufficientCapacity, Quota, RateLimiter};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Client, Method, Url};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::{HttpError, RequestBody, RequestContext, TransferClient, TransferRequest, TransferResponse};
use crate::hashing::{ChecksumError, ChunkReader};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Byte-rate cap shared by every body a client streams.
///
/// The quota's burst equals one second of traffic, so bodies are metered
/// in pieces no larger than that burst.
struct Bandwidth {
    limiter: Limiter,
    burst: NonZeroU32,
}

impl Bandwidth {
    fn new(bytes_per_sec: u64) -> Option<Self> {
        let burst = NonZeroU32::new(bytes_per_sec.min(u32::MAX as u64) as u32)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_second(burst)),
            burst,
        })
    }

    /// Wait until `len` bytes may pass.
    async fn consume(&self, len: usize) -> Result<(), InsufficientCapacity> {
        let mut left = len;
        while left > 0 {
            let piece = left.min(self.burst.get() as usize);
            if let Some(n) = NonZeroU32::new(piece as u32) {
                self.limiter.until_n_ready(n).await?;
            }
            left -= piece;
        }
        Ok(())
    }
}

fn over_capacity(err: InsufficientCapacity) -> std::io::Error {
    std::io::Error::other(format!("bandwidth limiter rejected a chunk: {err}"))
}

/// Build the shared HTTP client. `authorization` is sent verbatim as the
/// `Authorization` header of every request.
pub fn default_http_client(authorization: Option<&str>) -> Result<Client, HttpError> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(auth) = authorization {
        let mut value = HeaderValue::from_str(auth)
            .map_err(|e| HttpError::InvalidRequest(format!("bad authorization header: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(concat!("stratus/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| HttpError::InvalidRequest(format!("cannot build HTTP client: {e}")))
}

/// [`TransferClient`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransferClient {
    client: Client,
    limiter: Option<Arc<Bandwidth>>,
}

impl ReqwestTransferClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            limiter: None,
        }
    }

    /// Cap streamed request and response bodies to `bytes_per_sec`.
    pub fn with_rate_limit(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.limiter = bytes_per_sec.and_then(Bandwidth::new).map(Arc::new);
        self
    }

    async fn build_body(
        &self,
        body: RequestBody,
        ctx: &RequestContext,
    ) -> Result<Option<reqwest::Body>, HttpError> {
        match body {
            RequestBody::Empty => Ok(None),
            RequestBody::Bytes(bytes) => Ok(Some(reqwest::Body::from(bytes))),
            RequestBody::FileWindow { path, offset, len } => {
                let reader = ChunkReader::open(&path)?;
                let window = reader.window_stream(offset, len).await?;
                let cancel = ctx.cancel.clone();
                let progress = ctx.progress.clone();
                let limiter = self.limiter.clone();

                let stream = window.then(move |chunk| {
                    let cancel = cancel.clone();
                    let progress = progress.clone();
                    let limiter = limiter.clone();
                    async move {
                        let chunk = chunk?;
                        if cancel.is_cancelled() {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::Interrupted,
                                "upload cancelled",
                            ));
                        }
                        if let Some(l) = &limiter {
                            l.consume(chunk.len()).await.map_err(over_capacity)?;
                        }
                        if let Some(cb) = &progress {
                            cb(chunk.len() as u64);
                        }
                        Ok(chunk)
                    }
                });
                Ok(Some(reqwest::Body::wrap_stream(stream)))
            }
        }
    }
}

fn transport(method: &Method, url: &Url, err: reqwest::Error) -> HttpError {
    HttpError::Transport {
        method: method.to_string(),
        url: url.to_string(),
        message: err.to_string(),
        timeout: err.is_timeout(),
    }
}

impl From<ChecksumError> for HttpError {
    fn from(value: ChecksumError) -> Self {
        match value {
            ChecksumError::Io(e) => HttpError::Io(e),
            other => HttpError::InvalidRequest(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl TransferClient for ReqwestTransferClient {
    async fn send(
        &self,
        req: TransferRequest,
        ctx: &RequestContext,
    ) -> Result<TransferResponse, HttpError> {
        if ctx.cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }

        let method = req.method.clone();
        let url = req.url.clone();
        let body_len = req.body.len();
        let streamed = matches!(req.body, RequestBody::FileWindow { .. });
        let in_memory = matches!(req.body, RequestBody::Bytes(_));

        let mut builder = self.client.request(req.method, req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = self.build_body(req.body, ctx).await? {
            if streamed {
                // Streamed bodies would otherwise go out chunked; TUS needs an exact length.
                builder = builder.header(CONTENT_LENGTH, body_len);
            }
            builder = builder.body(body);
        }

        let exchange = async {
            let resp = builder.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>(TransferResponse {
                status,
                headers,
                body,
            })
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(HttpError::Cancelled),
            r = exchange => r,
        };

        match result {
            Ok(resp) => {
                if in_memory && resp.status.is_success() {
                    ctx.report(body_len);
                }
                tracing::debug!("{method} {url} -> {}", resp.status);
                Ok(resp)
            }
            Err(_) if ctx.cancel.is_cancelled() => Err(HttpError::Cancelled),
            Err(e) => Err(transport(&method, &url, e)),
        }
    }

    async fn download_to(
        &self,
        url: Url,
        headers: Vec<(String, String)>,
        dest: &Utf8Path,
        ctx: &RequestContext,
    ) -> Result<TransferResponse, HttpError> {
        if ctx.cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }

        let mut builder = self.client.get(url.clone());
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(HttpError::Cancelled),
            r = builder.send() => r.map_err(|e| transport(&Method::GET, &url, e))?,
        };

        let mut out = TransferResponse::new(resp.status());
        out.headers = resp.headers().clone();
        if !resp.status().is_success() {
            return Ok(out);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent.as_std_path()).await?;
        }
        let mut file = File::create(dest.as_std_path()).await?;
        let mut stream = resp.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(HttpError::Cancelled),
                n = stream.next() => n,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| transport(&Method::GET, &url, e))?;
            if let Some(l) = &self.limiter {
                l.consume(chunk.len()).await.map_err(over_capacity)?;
            }
            file.write_all(&chunk).await?;
            ctx.report(chunk.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(out)
    }
}
