//! In-memory WebDAV/TUS server for driver unit tests.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use camino::{Utf8Path, Utf8PathBuf};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use stratus_core::TransferRecord;
use stratus_infra::net::{
    HttpError, RequestBody, RequestContext, TransferClient, TransferRequest, TransferResponse,
};
use stratus_persistence::{MemoryTransferStore, TransferRecordStore};
use tokio_util::sync::CancellationToken;

use super::{TransferEnv, TransferScope};
use crate::tracker::ProgressReporter;
use crate::{DavEndpoints, TransferOptions};

#[derive(Default)]
struct DavState {
    files: HashMap<String, Vec<u8>>,
    sessions: HashMap<u32, (Vec<u8>, u64)>,
    /// Where a completed session is stored. Completion answers carry no etag.
    targets: HashMap<u32, String>,
    staging: HashMap<String, BTreeMap<String, Vec<u8>>>,
    next_session: u32,
    patch_calls: u32,
    patch_offsets: Vec<u64>,
    fail_patches: HashSet<u32>,
    regress_patch: Option<u32>,
    create_status: Option<StatusCode>,
    put_status: Option<StatusCode>,
    cancel_after: Option<(u32, CancellationToken)>,
    log: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeDav {
    state: Mutex<DavState>,
}

fn respond(status: StatusCode, headers: &[(&str, String)]) -> TransferResponse {
    let mut resp = TransferResponse::new(status);
    for (name, value) in headers {
        resp.headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    resp
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

fn metadata_filename(metadata: &str) -> Option<String> {
    metadata
        .split(',')
        .filter_map(|pair| pair.trim().split_once(' '))
        .find(|(key, _)| *key == "filename")
        .and_then(|(_, value)| STANDARD.decode(value).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
}

fn read_body(body: &RequestBody) -> Vec<u8> {
    match body {
        RequestBody::Empty => Vec::new(),
        RequestBody::Bytes(b) => b.to_vec(),
        RequestBody::FileWindow { path, offset, len } => {
            let data = std::fs::read(path).unwrap();
            data[*offset as usize..(*offset + *len) as usize].to_vec()
        }
    }
}

impl FakeDav {
    pub(crate) fn fail_patch_calls(&self, calls: &[u32]) {
        self.state.lock().unwrap().fail_patches.extend(calls);
    }

    pub(crate) fn regress_ack_on_patch(&self, call: u32) {
        self.state.lock().unwrap().regress_patch = Some(call);
    }

    pub(crate) fn reject_create(&self, status: StatusCode) {
        self.state.lock().unwrap().create_status = Some(status);
    }

    pub(crate) fn fail_puts_with(&self, status: StatusCode) {
        self.state.lock().unwrap().put_status = Some(status);
    }

    pub(crate) fn cancel_after_patches(&self, calls: u32, token: CancellationToken) {
        self.state.lock().unwrap().cancel_after = Some((calls, token));
    }

    pub(crate) fn seed_session(&self, id: u32, data: &[u8], length: u64) {
        let mut s = self.state.lock().unwrap();
        s.sessions.insert(id, (data.to_vec(), length));
        s.next_session = s.next_session.max(id);
    }

    pub(crate) fn seed_file(&self, path: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
    }

    pub(crate) fn session_url(&self, collection: &Url, id: u32) -> String {
        collection.join(&format!("/tus/{id}")).unwrap().to_string()
    }

    pub(crate) fn tus_data(&self, id: u32) -> Vec<u8> {
        self.state.lock().unwrap().sessions[&id].0.clone()
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub(crate) fn patch_offsets(&self) -> Vec<u64> {
        self.state.lock().unwrap().patch_offsets.clone()
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    fn handle(&self, req: &TransferRequest, body: Vec<u8>) -> TransferResponse {
        let mut s = self.state.lock().unwrap();
        let method = match req.header_value("X-HTTP-Method-Override") {
            Some(m) if req.method == Method::POST => m.to_string(),
            _ => req.method.to_string(),
        };
        let path = req.url.path().to_string();
        s.log.push(method.clone());
        let tus_id = path
            .strip_prefix("/tus/")
            .and_then(|id| id.parse::<u32>().ok());

        match (method.as_str(), tus_id) {
            ("OPTIONS", _) => respond(
                StatusCode::OK,
                &[
                    ("Tus-Version", "1.0.0".into()),
                    ("Tus-Extension", "creation,termination".into()),
                ],
            ),
            ("POST", None) => {
                if let Some(status) = s.create_status {
                    return respond(status, &[]);
                }
                let length: u64 = req.header_value("Upload-Length").unwrap().parse().unwrap();
                s.next_session += 1;
                let id = s.next_session;
                let offset = body.len() as u64;
                s.sessions.insert(id, (body, length));
                if let Some(name) = req.header_value("Upload-Metadata").and_then(metadata_filename) {
                    s.targets
                        .insert(id, format!("{}/{name}", path.trim_end_matches('/')));
                }
                respond(
                    StatusCode::CREATED,
                    &[
                        ("Location", format!("/tus/{id}")),
                        ("Upload-Offset", offset.to_string()),
                    ],
                )
            }
            ("HEAD", Some(id)) => match s.sessions.get(&id) {
                Some((data, length)) => respond(
                    StatusCode::OK,
                    &[
                        ("Upload-Offset", data.len().to_string()),
                        ("Upload-Length", length.to_string()),
                    ],
                ),
                None => respond(StatusCode::NOT_FOUND, &[]),
            },
            ("PATCH", Some(id)) => {
                s.patch_calls += 1;
                let call = s.patch_calls;
                let offset: u64 = req.header_value("Upload-Offset").unwrap().parse().unwrap();
                s.patch_offsets.push(offset);
                if let Some((n, token)) = &s.cancel_after {
                    if call >= *n {
                        token.cancel();
                    }
                }
                if s.fail_patches.contains(&call) {
                    return respond(StatusCode::INTERNAL_SERVER_ERROR, &[]);
                }
                if s.regress_patch == Some(call) {
                    return respond(
                        StatusCode::NO_CONTENT,
                        &[("Upload-Offset", offset.saturating_sub(5).to_string())],
                    );
                }
                let Some((data, length)) = s.sessions.get_mut(&id) else {
                    return respond(StatusCode::NOT_FOUND, &[]);
                };
                if data.len() as u64 != offset {
                    return respond(StatusCode::CONFLICT, &[]);
                }
                data.extend_from_slice(&body);
                let now = data.len();
                if now as u64 == *length {
                    let done = data.clone();
                    if let Some(target) = s.targets.get(&id).cloned() {
                        s.files.insert(target, done);
                    }
                }
                respond(
                    StatusCode::NO_CONTENT,
                    &[
                        ("Upload-Offset", now.to_string()),
                        ("Upload-Expires", "Wed, 25 Jun 2031 10:00:00 GMT".into()),
                    ],
                )
            }
            ("HEAD", None) => match s.files.get(&path) {
                Some(data) => respond(
                    StatusCode::OK,
                    &[
                        ("ETag", etag_of(data)),
                        ("Content-Length", data.len().to_string()),
                    ],
                ),
                None => respond(StatusCode::NOT_FOUND, &[]),
            },
            ("DELETE", Some(id)) => match s.sessions.remove(&id) {
                Some(_) => respond(StatusCode::NO_CONTENT, &[]),
                None => respond(StatusCode::NOT_FOUND, &[]),
            },
            ("MKCOL", None) => {
                s.staging.insert(path, BTreeMap::new());
                respond(StatusCode::CREATED, &[])
            }
            ("MOVE", None) => {
                let staging = path.trim_end_matches("/.file").to_string();
                let Some(chunks) = s.staging.remove(&staging) else {
                    return respond(StatusCode::NOT_FOUND, &[]);
                };
                let dest = Url::parse(req.header_value("Destination").unwrap()).unwrap();
                let data: Vec<u8> = chunks.into_values().flatten().collect();
                let declared: usize = req.header_value("OC-Total-Length").unwrap().parse().unwrap();
                if declared != data.len() {
                    return respond(StatusCode::BAD_REQUEST, &[]);
                }
                let etag = etag_of(&data);
                s.files.insert(dest.path().to_string(), data);
                respond(StatusCode::CREATED, &[("ETag", etag)])
            }
            ("PUT", None) => {
                let (parent, name) = path.rsplit_once('/').unwrap();
                if let Some(chunks) = s.staging.get_mut(parent) {
                    chunks.insert(name.to_string(), body);
                    return respond(StatusCode::CREATED, &[]);
                }
                if let Some(status) = s.put_status {
                    return respond(status, &[]);
                }
                if let Some(expected) = req.header_value("If-Match") {
                    let current = s.files.get(&path).map(|d| etag_of(d));
                    if current.as_deref() != Some(expected) {
                        return respond(StatusCode::PRECONDITION_FAILED, &[]);
                    }
                }
                let etag = etag_of(&body);
                s.files.insert(path, body);
                respond(StatusCode::CREATED, &[("ETag", etag)])
            }
            _ => respond(StatusCode::METHOD_NOT_ALLOWED, &[]),
        }
    }
}

#[async_trait::async_trait]
impl TransferClient for FakeDav {
    async fn send(
        &self,
        req: TransferRequest,
        ctx: &RequestContext,
    ) -> Result<TransferResponse, HttpError> {
        if ctx.cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        let body = read_body(&req.body);
        let resp = self.handle(&req, body);
        if resp.status.is_success() {
            if let Some(cb) = &ctx.progress {
                cb(req.body.len());
            }
        }
        Ok(resp)
    }

    async fn download_to(
        &self,
        url: Url,
        _headers: Vec<(String, String)>,
        dest: &Utf8Path,
        ctx: &RequestContext,
    ) -> Result<TransferResponse, HttpError> {
        if ctx.cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        let Some(data) = self.file(url.path()) else {
            return Ok(respond(StatusCode::NOT_FOUND, &[]));
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &data)?;
        if let Some(cb) = &ctx.progress {
            cb(data.len() as u64);
        }
        Ok(respond(StatusCode::OK, &[("ETag", etag_of(&data))]))
    }
}

/// A record, a source file, a store and a fake server wired together.
pub(crate) struct Harness {
    pub dav: Arc<FakeDav>,
    pub env: TransferEnv,
    pub record: TransferRecord,
    pub root: Utf8PathBuf,
    _dir: tempfile::TempDir,
}

pub(crate) fn test_options() -> TransferOptions {
    TransferOptions {
        chunk_threshold: 16,
        tus_chunk_size: 10,
        legacy_chunk_size: 10,
        backoff_base: std::time::Duration::from_millis(1),
        backoff_max: std::time::Duration::from_millis(4),
        scheduler_backoff_base: std::time::Duration::from_millis(1),
        scheduler_backoff_max: std::time::Duration::from_millis(4),
        checksums: false,
        ..TransferOptions::default()
    }
}

impl Harness {
    pub(crate) fn new(dav: FakeDav, content: &[u8]) -> Self {
        Self::with_options(dav, content, |_| {})
    }

    pub(crate) fn with_options(
        dav: FakeDav,
        content: &[u8],
        tweak: impl FnOnce(&mut TransferOptions),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = root.join("source.bin");
        std::fs::write(&source, content).unwrap();

        let record = TransferRecord::new_upload(
            "alice",
            source.as_str(),
            "/docs/source.bin",
            "application/octet-stream",
            content.len() as u64,
        );
        let store = Arc::new(MemoryTransferStore::new());
        store.insert(&record).unwrap();

        let mut options = test_options();
        tweak(&mut options);
        let dav = Arc::new(dav);
        let env = TransferEnv::new(
            dav.clone(),
            store,
            DavEndpoints::for_user("http://dav.test", "alice").unwrap(),
            options,
        );
        Self {
            dav,
            env,
            record,
            root,
            _dir: dir,
        }
    }

    pub(crate) fn collection(&self) -> Url {
        self.env
            .endpoints
            .parent_collection_url(&self.record.remote_path, None)
            .unwrap()
    }

    pub(crate) fn scope(&self) -> TransferScope {
        TransferScope::new(
            CancellationToken::new(),
            ProgressReporter::silent(self.record.id.clone(), self.record.size),
        )
    }

    pub(crate) fn stored(&self) -> TransferRecord {
        self.env.store.get(&self.record.id).unwrap().unwrap()
    }
}
