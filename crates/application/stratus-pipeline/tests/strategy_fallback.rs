mod common;

use axum::http::StatusCode;
use common::{fast_options, utf8_tempdir, write_source, DavServer, DavState};
use std::sync::Arc;
use stratus_core::{ServerCapabilities, TransferRecord};
use stratus_infra::{probe_tus, RequestContext};
use stratus_persistence::{MemoryTransferStore, TransferRecordStore};
use stratus_pipeline::{
    Downloader, ProgressReporter, Strategy, StrategySelector, TransferEnv, TransferError,
    TransferScope,
};
use tokio_util::sync::CancellationToken;

fn scope(record: &TransferRecord) -> TransferScope {
    TransferScope::new(
        CancellationToken::new(),
        ProgressReporter::silent(record.id.clone(), record.size),
    )
}

async fn capabilities(env: &TransferEnv, chunking: bool) -> ServerCapabilities {
    let root = env.endpoints.parent_collection_url("/", None).unwrap();
    let tus = probe_tus(env.client.as_ref(), root, &RequestContext::default())
        .await
        .unwrap();
    ServerCapabilities { chunking, tus }
}

fn upload_record(env: &TransferEnv, source: &camino::Utf8Path, remote: &str, size: u64) -> TransferRecord {
    let record = TransferRecord::new_upload(
        "alice",
        source.as_str(),
        remote,
        "application/octet-stream",
        size,
    );
    env.store.insert(&record).unwrap();
    record
}

#[tokio::test]
async fn rejected_session_create_falls_back_to_chunked_assembly() {
    let mut state = DavState::default();
    state.create_status = Some(StatusCode::PRECONDITION_FAILED);
    let server = DavServer::with_state(state).await;
    let (_dir, root) = utf8_tempdir();
    let content: Vec<u8> = (0..35u8).collect();
    let source = write_source(&root, "report.pdf", &content);

    let env = TransferEnv::new(
        server.client(None),
        Arc::new(MemoryTransferStore::new()),
        server.endpoints(),
        fast_options(),
    );
    let caps = capabilities(&env, true).await;
    assert!(caps.tus.is_some());
    let record = upload_record(&env, &source, "/docs/report.pdf", 35);

    let outcome = StrategySelector::new(&env)
        .upload(&record, &caps, &scope(&record))
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::Chunked);
    assert_eq!(outcome.fallback_from, Some(Strategy::Tus));
    assert_eq!(server.file("/docs/report.pdf"), Some(content));

    let state = server.state();
    assert_eq!(state.count("POST"), 1);
    assert_eq!(state.count("MKCOL"), 1);
    assert_eq!(state.count("PUT"), 4);
    assert_eq!(state.count("MOVE"), 1);
    assert!(state.staging.is_empty());
    drop(state);
    assert!(env.store.get(&record.id).unwrap().unwrap().session.is_none());
}

#[tokio::test]
async fn servers_without_tus_get_chunked_uploads() {
    let mut state = DavState::default();
    state.tus_enabled = false;
    let server = DavServer::with_state(state).await;
    let (_dir, root) = utf8_tempdir();
    let content = vec![3u8; 21];
    let source = write_source(&root, "plain.bin", &content);

    let env = TransferEnv::new(
        server.client(None),
        Arc::new(MemoryTransferStore::new()),
        server.endpoints(),
        fast_options(),
    );
    let caps = capabilities(&env, true).await;
    assert!(caps.tus.is_none());
    let record = upload_record(&env, &source, "/plain.bin", 21);

    let outcome = StrategySelector::new(&env)
        .upload(&record, &caps, &scope(&record))
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::Chunked);
    assert_eq!(outcome.fallback_from, None);
    assert_eq!(server.state().count("POST"), 0);
    assert_eq!(server.file("/plain.bin"), Some(content));
}

#[tokio::test]
async fn small_files_use_one_put() {
    let server = DavServer::start().await;
    let (_dir, root) = utf8_tempdir();
    let source = write_source(&root, "note.txt", b"hello");

    let env = TransferEnv::new(
        server.client(None),
        Arc::new(MemoryTransferStore::new()),
        server.endpoints(),
        fast_options(),
    );
    let caps = capabilities(&env, true).await;
    let record = upload_record(&env, &source, "/notes/note.txt", 5);

    let outcome = StrategySelector::new(&env)
        .upload(&record, &caps, &scope(&record))
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::SinglePut);
    assert!(outcome.etag.is_some());
    assert_eq!(server.file("/notes/note.txt"), Some(b"hello".to_vec()));
}

#[tokio::test]
async fn download_lands_atomically() {
    let server = DavServer::start().await;
    server.seed_file("/photos/cat.jpg", b"meow meow");
    let (_dir, root) = utf8_tempdir();
    let dest = root.join("out").join("cat.jpg");

    let env = TransferEnv::new(
        server.client(None),
        Arc::new(MemoryTransferStore::new()),
        server.endpoints(),
        fast_options(),
    );
    let record = TransferRecord::new_download("alice", "/photos/cat.jpg", dest.as_str(), 9);
    env.store.insert(&record).unwrap();

    let outcome = Downloader::new(&env)
        .download(&record, &scope(&record))
        .await
        .unwrap();

    assert_eq!(outcome.bytes, 9);
    assert!(outcome.etag.is_some());
    assert_eq!(std::fs::read(&dest).unwrap(), b"meow meow");
    assert!(!root.join("out").join("cat.jpg.part").exists());
}

#[tokio::test]
async fn missing_remote_file_is_reported() {
    let server = DavServer::start().await;
    let (_dir, root) = utf8_tempdir();
    let dest = root.join("gone.txt");

    let env = TransferEnv::new(
        server.client(None),
        Arc::new(MemoryTransferStore::new()),
        server.endpoints(),
        fast_options(),
    );
    let record = TransferRecord::new_download("alice", "/gone.txt", dest.as_str(), 0);

    let err = Downloader::new(&env)
        .download(&record, &scope(&record))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::RemoteNotFound { .. }));
    assert!(!dest.exists());
    assert!(!root.join("gone.txt.part").exists());
}
