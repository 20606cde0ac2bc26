use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::{Method, StatusCode, Url};
use stratus_core::path_utils::RemotePath;
use stratus_core::tus::{OffsetChange, TusAction, TusEvent, TusLimits, TusMachine, TusState};
use stratus_core::{TransferRecord, TusSession, TusSupport};
use stratus_infra::net::{
    encode_upload_metadata, HttpError, RequestBody, TransferRequest, TransferResponse,
    METHOD_OVERRIDE, OFFSET_CONTENT_TYPE, TUS_RESUMABLE, UPLOAD_CHECKSUM, UPLOAD_EXPIRES,
    UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
};
use stratus_infra::ChunkReader;

use super::{
    content_checksum, open_source, sleep_cancellable, status_error, DriverStats, Strategy,
    TransferEnv, TransferScope, UploadOutcome,
};
use crate::TransferError;

/// Resumable upload over the TUS protocol.
///
/// Runs [`TusMachine`] to completion, persisting every server-confirmed
/// offset before the next chunk is sent.
pub struct TusDriver<'a> {
    env: &'a TransferEnv,
}

/// Mutable bookkeeping of one driver run.
struct Run<'r> {
    record: &'r TransferRecord,
    reader: ChunkReader,
    mtime: Option<i64>,
    session: Option<TusSession>,
    etag: Option<String>,
    stats: DriverStats,
}

impl<'r> Run<'r> {
    fn session(&self) -> Result<&TusSession, TransferError> {
        self.session
            .as_ref()
            .ok_or_else(|| TransferError::invalid("no upload session in progress"))
    }

    fn session_url(&self) -> Result<Url, TransferError> {
        let session = self.session()?;
        Url::parse(&session.upload_url).map_err(|e| {
            TransferError::invalid(format!("stored upload url {} is invalid: {e}", session.upload_url))
        })
    }
}

fn is_gone(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

impl<'a> TusDriver<'a> {
    pub fn new(env: &'a TransferEnv) -> Self {
        Self { env }
    }

    /// Upload `record` through a new session created below `collection`, or
    /// resume the session stored on the record.
    pub async fn upload(
        &self,
        record: &TransferRecord,
        collection: &Url,
        tus: &TusSupport,
        scope: &TransferScope,
    ) -> Result<UploadOutcome, TransferError> {
        let (reader, mtime) = open_source(record)?;
        let limits = self.env.options.tus_limits(tus);

        let mut state = match &record.session {
            Some(s) if s.length != reader.len() => {
                return Err(TransferError::invalid(format!(
                    "session declares {} bytes but {} has {}",
                    s.length,
                    record.local_path,
                    reader.len()
                )));
            }
            Some(s) => {
                tracing::info!(transfer = %record.id, offset = s.offset, length = s.length, "resuming upload session");
                scope.progress.observe(s.offset);
                TusState::resume(s.offset, s.length)
            }
            None => TusState::NoSession {
                length: reader.len(),
            },
        };

        let mut run = Run {
            record,
            reader,
            mtime,
            session: record.session.clone(),
            etag: None,
            stats: DriverStats::default(),
        };

        loop {
            scope.check_cancelled()?;
            let event = match TusMachine::next_action(&state, &limits) {
                TusAction::Create => {
                    let (session, offset) = self
                        .create(&mut run, collection, tus, &limits, scope)
                        .await?;
                    let step = TusMachine::apply(state, TusEvent::SessionCreated { offset }, &limits)?;
                    self.env.store.begin_session(&record.id, &session)?;
                    tracing::info!(transfer = %record.id, url = %session.upload_url, offset, "upload session created");
                    scope.progress.observe(offset);
                    run.session = Some(session);
                    state = step.state;
                    continue;
                }
                TusAction::QueryOffset => self.query_offset(&mut run, scope).await?,
                TusAction::Patch { offset, len } => {
                    self.patch(&mut run, tus, offset, len, scope).await?
                }
                TusAction::Backoff { attempt } => {
                    run.stats.backoffs += 1;
                    let delay = self.env.options.patch_backoff(attempt);
                    tracing::debug!(transfer = %record.id, attempt, ?delay, "backing off before resending chunk");
                    sleep_cancellable(delay, &scope.cancel).await?;
                    TusEvent::BackoffElapsed
                }
                TusAction::Finish => {
                    self.env.store.clear_session(&record.id)?;
                    tracing::info!(
                        transfer = %record.id,
                        bytes = state.length(),
                        patches = run.stats.patch_calls,
                        "resumable upload complete"
                    );
                    return Ok(UploadOutcome {
                        strategy: Strategy::Tus,
                        etag: run.etag,
                        bytes: state.length(),
                        stats: run.stats,
                        fallback_from: None,
                    });
                }
            };

            let step = TusMachine::apply(state, event, &limits)?;
            self.persist(&mut run, step.offset, scope)?;
            state = step.state;
        }
    }

    fn persist(
        &self,
        run: &mut Run<'_>,
        change: OffsetChange,
        scope: &TransferScope,
    ) -> Result<(), TransferError> {
        let (offset, rewound) = match change {
            OffsetChange::Unchanged => return Ok(()),
            OffsetChange::Advanced(o) => (o, false),
            OffsetChange::Rewound(o) => (o, true),
        };
        let id = &run.record.id;
        let url = run.session()?.upload_url.clone();
        if rewound {
            self.env.store.rewind_offset(id, &url, offset)?;
        } else {
            self.env.store.update_offset(id, &url, offset)?;
        }
        if let Some(session) = run.session.as_mut() {
            session.offset = offset;
        }
        scope.progress.observe(offset);
        Ok(())
    }

    async fn create(
        &self,
        run: &mut Run<'_>,
        collection: &Url,
        tus: &TusSupport,
        limits: &TusLimits,
        scope: &TransferScope,
    ) -> Result<(TusSession, u64), TransferError> {
        let record = run.record;
        let length = run.reader.len();
        let checksum = content_checksum(&run.reader, &self.env.options).await?;
        let filename = RemotePath::file_name(&record.remote_path).unwrap_or_default();
        let mtime = run.mtime.map(|m| m.to_string());

        let mut pairs = vec![
            ("filename", filename.as_str()),
            ("mimetype", record.mime_type.as_str()),
        ];
        if let Some(m) = &mtime {
            pairs.push(("mtime", m.as_str()));
        }
        if let Some(c) = &checksum {
            pairs.push(("checksum", c.as_str()));
        }
        let metadata = encode_upload_metadata(&pairs);

        let mut req = TransferRequest::new(Method::POST, collection.clone())
            .header(TUS_RESUMABLE, stratus_config::TUS_VERSION)
            .header(UPLOAD_LENGTH, length.to_string())
            .header(UPLOAD_METADATA, metadata.as_str())
            .header_opt("If-Match", record.if_match());

        let inline = if tus.creation_with_upload() && length > 0 {
            let cap = limits.server_max_chunk.filter(|c| *c > 0).unwrap_or(u64::MAX);
            limits.chunk_size.min(cap).min(length)
        } else {
            0
        };
        let ctx = if inline > 0 {
            req = req
                .header("Content-Type", OFFSET_CONTENT_TYPE)
                .body(RequestBody::FileWindow {
                    path: run.reader.path().to_path_buf(),
                    offset: 0,
                    len: inline,
                });
            scope.request_ctx()
        } else {
            scope.control_ctx()
        };

        tracing::debug!(transfer = %record.id, %collection, length, inline, "creating upload session");
        run.stats.requests += 1;
        let resp = self.env.client.send(req, &ctx).await?;
        if resp.status == StatusCode::UNAUTHORIZED {
            return Err(TransferError::Unauthorized {
                status: resp.status,
            });
        }
        if resp.status == StatusCode::FORBIDDEN {
            return Err(TransferError::Forbidden {
                url: collection.to_string(),
            });
        }
        if !resp.status.is_success() {
            return Err(TransferError::CreateRejected {
                status: resp.status,
            });
        }

        let location = resp.header("Location").ok_or(TransferError::MissingHeader {
            header: "Location",
            context: "session create",
        })?;
        let upload_url = collection
            .join(location)
            .map_err(|e| TransferError::invalid(format!("bad Location {location}: {e}")))?;
        let offset = if inline > 0 {
            resp.header_u64(UPLOAD_OFFSET).unwrap_or(0)
        } else {
            0
        };

        let mut session = TusSession::new(
            upload_url.to_string(),
            length,
            stratus_config::TUS_VERSION.to_string(),
            metadata,
        );
        session.offset = offset;
        session.checksum = checksum;
        session.expires = resp.header(UPLOAD_EXPIRES).map(str::to_string);
        if let Some(etag) = resp.etag() {
            run.etag = Some(etag);
        }
        Ok((session, offset))
    }

    async fn query_offset(
        &self,
        run: &mut Run<'_>,
        scope: &TransferScope,
    ) -> Result<TusEvent, TransferError> {
        let url = run.session_url()?;
        let version = run.session()?.version.clone();
        let req = TransferRequest::new(Method::HEAD, url.clone()).header(TUS_RESUMABLE, version);

        run.stats.requests += 1;
        let resp = match self.env.client.send(req, &scope.control_ctx()).await {
            Ok(resp) => resp,
            Err(HttpError::Cancelled) => return Err(TransferError::Cancelled),
            Err(e) => return self.transient_or(run, TransferError::from(e), TusEvent::OffsetUnavailable),
        };
        if is_gone(resp.status) {
            return Err(self.forget_session(run, &url)?);
        }
        if !resp.status.is_success() {
            let err = status_error("HEAD", &url, &resp);
            return self.transient_or(run, err, TusEvent::OffsetUnavailable);
        }
        let offset = resp.header_u64(UPLOAD_OFFSET).ok_or(TransferError::MissingHeader {
            header: "Upload-Offset",
            context: "offset query",
        })?;
        tracing::debug!(transfer = %run.record.id, offset, "server reports offset");
        Ok(TusEvent::OffsetResolved(offset))
    }

    async fn patch(
        &self,
        run: &mut Run<'_>,
        tus: &TusSupport,
        offset: u64,
        len: u64,
        scope: &TransferScope,
    ) -> Result<TusEvent, TransferError> {
        let url = run.session_url()?;
        let version = run.session()?.version.clone();

        let mut req = if tus.http_method_override {
            TransferRequest::new(Method::POST, url.clone()).header(METHOD_OVERRIDE, "PATCH")
        } else {
            TransferRequest::new(Method::PATCH, url.clone())
        };
        req = req
            .header(TUS_RESUMABLE, version)
            .header(UPLOAD_OFFSET, offset.to_string())
            .header("Content-Type", OFFSET_CONTENT_TYPE);

        req = if self.env.options.checksums && tus.checksum() {
            // The checksummed bytes are the bytes sent.
            let data = run
                .reader
                .read_window(offset, len)
                .map_err(|e| TransferError::local(&run.record.local_path, e))?;
            let digest = md5::compute(&data);
            req.header(UPLOAD_CHECKSUM, format!("md5 {}", STANDARD.encode(digest.0)))
                .body(RequestBody::Bytes(Bytes::from(data)))
        } else {
            req.body(RequestBody::FileWindow {
                path: run.reader.path().to_path_buf(),
                offset,
                len,
            })
        };

        tracing::debug!(transfer = %run.record.id, offset, len, "sending chunk");
        run.stats.requests += 1;
        run.stats.patch_calls += 1;
        let resp = match self.env.client.send(req, &scope.request_ctx()).await {
            Ok(resp) => resp,
            Err(HttpError::Cancelled) => return Err(TransferError::Cancelled),
            Err(e) => return self.transient_or(run, TransferError::from(e), TusEvent::PatchFailed),
        };
        if is_gone(resp.status) {
            return Err(self.forget_session(run, &url)?);
        }
        if !resp.status.is_success() {
            let err = status_error("PATCH", &url, &resp);
            return self.transient_or(run, err, TusEvent::PatchFailed);
        }
        self.acknowledge(run, &resp)
    }

    fn acknowledge(
        &self,
        run: &mut Run<'_>,
        resp: &TransferResponse,
    ) -> Result<TusEvent, TransferError> {
        let reported = resp.header_u64(UPLOAD_OFFSET).ok_or(TransferError::MissingHeader {
            header: "Upload-Offset",
            context: "chunk upload",
        })?;
        if let Some(expires) = resp.header(UPLOAD_EXPIRES) {
            let url = run.session()?.upload_url.clone();
            self.env
                .store
                .set_session_expiry(&run.record.id, &url, expires)?;
            if let Some(session) = run.session.as_mut() {
                session.expires = Some(expires.to_string());
            }
        }
        if let Some(etag) = resp.etag() {
            run.etag = Some(etag);
        }
        Ok(TusEvent::PatchAcknowledged(reported))
    }

    /// Feed a transient failure back into the machine; anything else aborts the run.
    fn transient_or(
        &self,
        run: &Run<'_>,
        err: TransferError,
        event: TusEvent,
    ) -> Result<TusEvent, TransferError> {
        if err.is_transient() {
            tracing::warn!(transfer = %run.record.id, error = %err, "transient failure, recovering");
            Ok(event)
        } else {
            Err(err)
        }
    }

    fn forget_session(&self, run: &mut Run<'_>, url: &Url) -> Result<TransferError, TransferError> {
        tracing::warn!(transfer = %run.record.id, %url, "server no longer knows the upload session");
        self.env.store.clear_session(&run.record.id)?;
        run.session = None;
        Ok(TransferError::SessionExpired {
            url: url.to_string(),
        })
    }

    /// Best-effort DELETE of an abandoned session.
    pub async fn terminate(&self, session: &TusSession, tus: &TusSupport, scope: &TransferScope) {
        if !tus.termination() {
            return;
        }
        let url = match Url::parse(&session.upload_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("cannot terminate session {}: {e}", session.upload_url);
                return;
            }
        };
        let req = TransferRequest::new(Method::DELETE, url)
            .header(TUS_RESUMABLE, session.version.as_str());
        match self.env.client.send(req, &scope.control_ctx()).await {
            Ok(resp) if resp.status.is_success() || is_gone(resp.status) => {
                tracing::debug!("terminated upload session {}", session.upload_url);
            }
            Ok(resp) => tracing::warn!(
                "terminating {} answered {}",
                session.upload_url,
                resp.status
            ),
            Err(e) => tracing::warn!("terminating {} failed: {e}", session.upload_url),
        }
    }
}
