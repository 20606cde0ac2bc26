use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use camino::Utf8PathBuf;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use stratus_cli::{commands, CliBehavior, ServerArgs};
use stratus_pipeline::SyncDecision;
use tempfile::tempdir;

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

fn etag(data: &[u8]) -> String {
    format!("\"{}-{}\"", data.len(), data.iter().map(|b| *b as u64).sum::<u64>())
}

async fn plain_dav(
    State(files): State<Files>,
    method: Method,
    uri: Uri,
    _headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let mut files = files.lock().unwrap();
    let (status, tag, payload) = match method.as_str() {
        // No TUS headers: plain WebDAV only.
        "OPTIONS" => (StatusCode::OK, None, Vec::new()),
        "PUT" => {
            let tag = etag(&body);
            files.insert(path, body.to_vec());
            (StatusCode::CREATED, Some(tag), Vec::new())
        }
        "GET" | "HEAD" => match files.get(&path) {
            Some(data) => (
                StatusCode::OK,
                Some(etag(data)),
                if method == Method::GET { data.clone() } else { Vec::new() },
            ),
            None => (StatusCode::NOT_FOUND, None, Vec::new()),
        },
        _ => (StatusCode::METHOD_NOT_ALLOWED, None, Vec::new()),
    };
    let mut builder = Response::builder().status(status);
    if let Some(tag) = tag {
        builder = builder.header("ETag", tag);
    }
    builder.body(Body::from(payload)).unwrap()
}

async fn start_server(files: Files) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new().fallback(plain_dav).with_state(files);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

fn server_args(addr: SocketAddr) -> ServerArgs {
    ServerArgs {
        server: format!("http://{addr}"),
        user: "alice".into(),
        token: None,
        chunking: false,
        workers: 2,
        limit_kb: None,
    }
}

#[tokio::test]
async fn upload_status_sync_and_download() {
    let files: Files = Arc::default();
    let (addr, handle) = start_server(Arc::clone(&files)).await;
    let server = server_args(addr);

    let tmp = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    let data_dir = root.join("state");
    let local = root.join("notes.txt");
    std::fs::write(&local, b"remember the milk").unwrap();

    // 1. Upload
    let summary = commands::cmd_upload(
        &server,
        Some(data_dir.clone()),
        local.clone(),
        "/Notes/notes.txt".into(),
        None,
        None,
        CliBehavior::Copy,
    )
    .await
    .expect("upload");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(
        files
            .lock()
            .unwrap()
            .get("/remote.php/dav/files/alice/Notes/notes.txt")
            .cloned(),
        Some(b"remember the milk".to_vec())
    );
    assert!(local.exists());

    // 2. Status reads the same database
    commands::cmd_status(Some(data_dir.clone()), Some("alice".into())).expect("status");

    // 3. Nothing changed on either side since the upload
    let decision = commands::cmd_sync(
        &server,
        Some(data_dir.clone()),
        local.clone(),
        "/Notes/notes.txt".into(),
        None,
        false,
    )
    .await
    .expect("sync");
    assert_eq!(decision, SyncDecision::AlreadySynchronized);

    // 4. Download to a new location
    let copy = root.join("copies").join("notes.txt");
    let summary = commands::cmd_download(
        &server,
        Some(data_dir.clone()),
        "/Notes/notes.txt".into(),
        copy.clone(),
        None,
    )
    .await
    .expect("download");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(std::fs::read(&copy).unwrap(), b"remember the milk");

    // 5. Nothing left to resume
    let summary = commands::cmd_retry(&server, Some(data_dir.clone()), None)
        .await
        .expect("retry");
    assert_eq!(summary.succeeded, 0);

    let caps = commands::cmd_probe(&server, Some(data_dir)).await.expect("probe");
    assert!(caps.tus.is_none());

    handle.abort();
}

#[tokio::test]
async fn missing_remote_file_fails_the_download() {
    let (addr, handle) = start_server(Arc::default()).await;
    let server = server_args(addr);
    let tmp = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

    let err = commands::cmd_download(
        &server,
        Some(root.join("state")),
        "/nope.bin".into(),
        root.join("nope.bin"),
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("failed"));
    assert!(!root.join("nope.bin").exists());

    handle.abort();
}
