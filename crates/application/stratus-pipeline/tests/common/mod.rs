#![allow(dead_code)]

//! In-process WebDAV server speaking TUS and the legacy chunking protocol.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use stratus_infra::net::default_http_client;
use stratus_infra::{ReqwestTransferClient, TransferClient};
use stratus_pipeline::{DavEndpoints, TransferOptions};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_EXTENSIONS: &str = "creation,termination,expiration";

pub struct Session {
    pub collection: String,
    pub filename: String,
    pub length: u64,
    pub data: Vec<u8>,
}

pub struct DavState {
    pub tus_enabled: bool,
    pub extensions: String,
    pub files: HashMap<String, Vec<u8>>,
    pub sessions: HashMap<u32, Session>,
    pub staging: HashMap<String, BTreeMap<String, Vec<u8>>>,
    pub next_session: u32,
    pub patch_calls: u32,
    /// 1-based PATCH calls answered with 500.
    pub fail_patch_calls: HashSet<u32>,
    /// Every PATCH from this call on is answered with 503.
    pub fail_patches_from: Option<u32>,
    /// The session is dropped and this PATCH call answered with 404.
    pub expire_on_patch_call: Option<u32>,
    pub create_status: Option<StatusCode>,
    /// Advertised `Tus-Max-Chunk-Size`; larger PATCH bodies get 413.
    pub max_chunk_size: Option<usize>,
    /// PATCH is blocked; chunks must arrive as POST with a method override.
    pub patch_via_post: bool,
    pub required_auth: Option<String>,
    pub requests: Vec<(Method, String)>,
}

impl Default for DavState {
    fn default() -> Self {
        Self {
            tus_enabled: true,
            extensions: DEFAULT_EXTENSIONS.to_string(),
            files: HashMap::new(),
            sessions: HashMap::new(),
            staging: HashMap::new(),
            next_session: 0,
            patch_calls: 0,
            fail_patch_calls: HashSet::new(),
            fail_patches_from: None,
            expire_on_patch_call: None,
            create_status: None,
            max_chunk_size: None,
            patch_via_post: false,
            required_auth: None,
            requests: Vec::new(),
        }
    }
}

impl DavState {
    pub fn count(&self, method: &str) -> usize {
        self.requests
            .iter()
            .filter(|(m, _)| m.as_str() == method)
            .count()
    }

    fn patch_fails(&self, call: u32) -> Option<StatusCode> {
        if self.fail_patch_calls.contains(&call) {
            return Some(StatusCode::INTERNAL_SERVER_ERROR);
        }
        match self.fail_patches_from {
            Some(from) if call >= from => Some(StatusCode::SERVICE_UNAVAILABLE),
            _ => None,
        }
    }
}

type Shared = Arc<Mutex<DavState>>;

fn etag_of(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reply(status: StatusCode, headers: &[(&str, String)], body: Vec<u8>) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn status(status: StatusCode) -> Response {
    reply(status, &[], Vec::new())
}

fn metadata_filename(metadata: &str) -> String {
    metadata
        .split(',')
        .filter_map(|pair| pair.trim().split_once(' '))
        .find(|(key, _)| *key == "filename")
        .and_then(|(_, value)| STANDARD.decode(value).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .unwrap_or_default()
}

fn session_id(path: &str) -> Option<u32> {
    path.strip_prefix("/tus/")?.parse().ok()
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

async fn dispatch(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let mut dav = state.lock().unwrap();
    dav.requests.push((method.clone(), path.clone()));

    if let Some(required) = &dav.required_auth {
        if header(&headers, "authorization") != Some(required.as_str()) {
            return status(StatusCode::UNAUTHORIZED);
        }
    }

    let overridden = header(&headers, "x-http-method-override")
        .filter(|_| method == Method::POST)
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok());
    let method = match overridden {
        Some(m) => m,
        None if method == Method::PATCH && dav.patch_via_post => {
            return status(StatusCode::METHOD_NOT_ALLOWED);
        }
        None => method,
    };

    match method.as_str() {
        "OPTIONS" => {
            if !dav.tus_enabled {
                return status(StatusCode::OK);
            }
            let mut advertised = vec![
                ("Tus-Resumable", "1.0.0".to_string()),
                ("Tus-Version", "1.0.0".into()),
                ("Tus-Extension", dav.extensions.clone()),
                ("Tus-Max-Size", "1073741824".into()),
            ];
            if let Some(max) = dav.max_chunk_size {
                advertised.push(("Tus-Max-Chunk-Size", max.to_string()));
            }
            if dav.patch_via_post {
                advertised.push(("Allow", "OPTIONS, HEAD, POST, DELETE".into()));
            }
            reply(StatusCode::NO_CONTENT, &advertised, Vec::new())
        }
        "POST" => {
            if let Some(code) = dav.create_status {
                return status(code);
            }
            let Some(length) = header(&headers, "upload-length").and_then(|v| v.parse().ok())
            else {
                return status(StatusCode::BAD_REQUEST);
            };
            dav.next_session += 1;
            let id = dav.next_session;
            let filename = metadata_filename(header(&headers, "upload-metadata").unwrap_or(""));
            let data = body.to_vec();
            let offset = data.len();
            dav.sessions.insert(
                id,
                Session {
                    collection: path.trim_end_matches('/').to_string(),
                    filename,
                    length,
                    data,
                },
            );
            reply(
                StatusCode::CREATED,
                &[
                    ("Location", format!("/tus/{id}")),
                    ("Upload-Offset", offset.to_string()),
                    ("Tus-Resumable", "1.0.0".into()),
                ],
                Vec::new(),
            )
        }
        "HEAD" => {
            if let Some(id) = session_id(&path) {
                return match dav.sessions.get(&id) {
                    Some(s) => reply(
                        StatusCode::OK,
                        &[
                            ("Upload-Offset", s.data.len().to_string()),
                            ("Upload-Length", s.length.to_string()),
                            ("Cache-Control", "no-store".into()),
                        ],
                        Vec::new(),
                    ),
                    None => status(StatusCode::NOT_FOUND),
                };
            }
            match dav.files.get(&path) {
                Some(data) => reply(
                    StatusCode::OK,
                    &[
                        ("ETag", etag_of(data)),
                        ("Content-Length", data.len().to_string()),
                    ],
                    Vec::new(),
                ),
                None => status(StatusCode::NOT_FOUND),
            }
        }
        "PATCH" => {
            dav.patch_calls += 1;
            if let Some(code) = dav.patch_fails(dav.patch_calls) {
                return status(code);
            }
            let Some(id) = session_id(&path) else {
                return status(StatusCode::NOT_FOUND);
            };
            if dav.max_chunk_size.is_some_and(|max| body.len() > max) {
                return status(StatusCode::PAYLOAD_TOO_LARGE);
            }
            if dav.expire_on_patch_call == Some(dav.patch_calls) {
                dav.sessions.remove(&id);
                return status(StatusCode::NOT_FOUND);
            }
            let offset: Option<usize> = header(&headers, "upload-offset").and_then(|v| v.parse().ok());
            let Some(session) = dav.sessions.get_mut(&id) else {
                return status(StatusCode::NOT_FOUND);
            };
            if offset != Some(session.data.len()) {
                return status(StatusCode::CONFLICT);
            }
            session.data.extend_from_slice(&body);
            let new_offset = session.data.len();
            let complete = new_offset as u64 == session.length;
            let target = format!("{}/{}", session.collection, session.filename);
            let data = session.data.clone();
            let mut extra = vec![("Upload-Offset", new_offset.to_string())];
            if complete {
                extra.push(("OC-ETag", etag_of(&data)));
                dav.files.insert(target, data);
            }
            reply(StatusCode::NO_CONTENT, &extra, Vec::new())
        }
        "DELETE" => match session_id(&path).and_then(|id| dav.sessions.remove(&id)) {
            Some(_) => status(StatusCode::NO_CONTENT),
            None => status(StatusCode::NOT_FOUND),
        },
        "MKCOL" => {
            dav.staging.insert(path, BTreeMap::new());
            status(StatusCode::CREATED)
        }
        "PUT" => {
            let parent = parent_of(&path).to_string();
            if let Some(chunks) = dav.staging.get_mut(&parent) {
                let name = path[parent.len() + 1..].to_string();
                chunks.insert(name, body.to_vec());
                return status(StatusCode::CREATED);
            }
            if let (Some(expected), Some(existing)) = (header(&headers, "if-match"), dav.files.get(&path)) {
                if expected != etag_of(existing) {
                    return status(StatusCode::PRECONDITION_FAILED);
                }
            }
            let data = body.to_vec();
            let etag = etag_of(&data);
            dav.files.insert(path, data);
            reply(StatusCode::CREATED, &[("ETag", etag)], Vec::new())
        }
        "MOVE" => {
            let Some(staging) = path.strip_suffix("/.file").map(str::to_string) else {
                return status(StatusCode::BAD_REQUEST);
            };
            let Some(target) = header(&headers, "destination")
                .and_then(|d| reqwest::Url::parse(d).ok())
                .map(|u| u.path().to_string())
            else {
                return status(StatusCode::BAD_REQUEST);
            };
            let Some(chunks) = dav.staging.remove(&staging) else {
                return status(StatusCode::NOT_FOUND);
            };
            let data: Vec<u8> = chunks.into_values().flatten().collect();
            let declared = header(&headers, "oc-total-length").and_then(|v| v.parse::<usize>().ok());
            if declared.is_some_and(|len| len != data.len()) {
                return status(StatusCode::BAD_REQUEST);
            }
            let etag = etag_of(&data);
            dav.files.insert(target, data);
            reply(StatusCode::CREATED, &[("OC-ETag", etag)], Vec::new())
        }
        "GET" => match dav.files.get(&path) {
            Some(data) => reply(StatusCode::OK, &[("ETag", etag_of(data))], data.clone()),
            None => status(StatusCode::NOT_FOUND),
        },
        _ => status(StatusCode::METHOD_NOT_ALLOWED),
    }
}

pub struct DavServer {
    pub addr: SocketAddr,
    state: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl DavServer {
    pub async fn start() -> Self {
        Self::with_state(DavState::default()).await
    }

    pub async fn with_state(state: DavState) -> Self {
        init_tracing();
        let state: Shared = Arc::new(Mutex::new(state));
        let app = Router::new().fallback(dispatch).with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state, handle }
    }

    pub fn state(&self) -> MutexGuard<'_, DavState> {
        self.state.lock().unwrap()
    }

    pub fn endpoints(&self) -> DavEndpoints {
        DavEndpoints::for_user(&format!("http://{}", self.addr), "alice").unwrap()
    }

    pub fn client(&self, authorization: Option<&str>) -> Arc<dyn TransferClient> {
        Arc::new(ReqwestTransferClient::new(
            default_http_client(authorization).unwrap(),
        ))
    }

    /// Server-side path of a file in alice's home.
    pub fn file_path(remote_path: &str) -> String {
        format!("/remote.php/dav/files/alice{remote_path}")
    }

    pub fn file(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.state().files.get(&Self::file_path(remote_path)).cloned()
    }

    pub fn seed_file(&self, remote_path: &str, data: &[u8]) {
        self.state()
            .files
            .insert(Self::file_path(remote_path), data.to_vec());
    }
}

impl Drop for DavServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// `RUST_LOG=stratus_pipeline=debug cargo test` shows the protocol exchange.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small chunks and millisecond backoffs.
pub fn fast_options() -> TransferOptions {
    TransferOptions {
        chunk_threshold: 16,
        tus_chunk_size: 10,
        legacy_chunk_size: 10,
        max_patch_retries: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(4),
        scheduler_backoff_base: Duration::from_millis(1),
        scheduler_backoff_max: Duration::from_millis(4),
        ..TransferOptions::default()
    }
}

pub fn write_source(dir: &Utf8Path, name: &str, content: &[u8]) -> Utf8PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

pub fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}
