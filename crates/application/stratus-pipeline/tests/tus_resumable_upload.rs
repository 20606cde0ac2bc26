mod common;

use common::{fast_options, utf8_tempdir, write_source, DavServer, DavState};
use std::sync::Arc;
use stratus_core::{ResultCode, TransferRecord};
use stratus_infra::{probe_tus, RequestContext};
use stratus_persistence::{RedbTransferStore, TransferRecordStore};
use stratus_pipeline::{
    ProgressReporter, TransferEnv, TransferOptions, TransferScope, TusDriver,
};
use tokio_util::sync::CancellationToken;

fn env_for(server: &DavServer, store: Arc<RedbTransferStore>, options: TransferOptions) -> TransferEnv {
    TransferEnv::new(server.client(None), store, server.endpoints(), options)
}

fn scope(record: &TransferRecord) -> TransferScope {
    TransferScope::new(
        CancellationToken::new(),
        ProgressReporter::silent(record.id.clone(), record.size),
    )
}

#[tokio::test]
async fn fifty_bytes_survive_a_failed_third_patch() {
    let mut state = DavState::default();
    state.fail_patch_calls.insert(3);
    let server = DavServer::with_state(state).await;
    let (_dir, root) = utf8_tempdir();
    let content: Vec<u8> = (0..50u8).collect();
    let source = write_source(&root, "big.bin", &content);

    let store = Arc::new(RedbTransferStore::open(&root.join("db")).unwrap());
    let record = TransferRecord::new_upload(
        "alice",
        source.as_str(),
        "/docs/big.bin",
        "application/octet-stream",
        50,
    );
    store.insert(&record).unwrap();
    let env = env_for(&server, Arc::clone(&store), fast_options());

    let collection = env.endpoints.parent_collection_url("/docs/big.bin", None).unwrap();
    let tus = probe_tus(env.client.as_ref(), collection.clone(), &RequestContext::default())
        .await
        .unwrap()
        .expect("server advertises TUS");

    let outcome = TusDriver::new(&env)
        .upload(&record, &collection, &tus, &scope(&record))
        .await
        .unwrap();

    assert_eq!(outcome.bytes, 50);
    assert_eq!(outcome.stats.patch_calls, 6);
    assert_eq!(outcome.stats.backoffs, 1);
    assert!(outcome.etag.is_some());
    assert_eq!(server.state().patch_calls, 6);
    assert_eq!(server.state().count("POST"), 1);
    assert_eq!(server.file("/docs/big.bin"), Some(content));
    assert!(store.get(&record.id).unwrap().unwrap().session.is_none());
}

#[tokio::test]
async fn interrupted_upload_resumes_to_identical_bytes() {
    let mut state = DavState::default();
    state.fail_patches_from = Some(3);
    let server = DavServer::with_state(state).await;
    let (_dir, root) = utf8_tempdir();
    let content: Vec<u8> = (0..50u8).rev().collect();
    let source = write_source(&root, "resume.bin", &content);

    let store = Arc::new(RedbTransferStore::open(&root.join("db")).unwrap());
    let record = TransferRecord::new_upload(
        "alice",
        source.as_str(),
        "/docs/resume.bin",
        "application/octet-stream",
        50,
    );
    store.insert(&record).unwrap();
    let mut options = fast_options();
    options.max_patch_retries = 2;
    let env = env_for(&server, Arc::clone(&store), options);
    let collection = env.endpoints.parent_collection_url("/docs/resume.bin", None).unwrap();
    let tus = probe_tus(env.client.as_ref(), collection.clone(), &RequestContext::default())
        .await
        .unwrap()
        .unwrap();

    let err = TusDriver::new(&env)
        .upload(&record, &collection, &tus, &scope(&record))
        .await
        .unwrap_err();
    assert_eq!(err.result_code(), ResultCode::RetriesExhausted);
    let interrupted = store.get(&record.id).unwrap().unwrap();
    assert_eq!(interrupted.session.as_ref().map(|s| s.offset), Some(20));

    server.state().fail_patches_from = None;
    let patches_before = server.state().patch_calls;

    // A fresh driver picks the session up from the store alone.
    let outcome = TusDriver::new(&env)
        .upload(&interrupted, &collection, &tus, &scope(&interrupted))
        .await
        .unwrap();

    assert_eq!(server.state().patch_calls - patches_before, 3);
    assert_eq!(server.state().count("POST"), 1);
    assert_eq!(outcome.bytes, 50);
    assert_eq!(server.file("/docs/resume.bin"), Some(content));
    assert!(store.get(&record.id).unwrap().unwrap().session.is_none());
}

#[tokio::test]
async fn creation_with_upload_sends_first_chunk_inline() {
    let mut state = DavState::default();
    state.extensions = "creation,creation-with-upload,termination".into();
    let server = DavServer::with_state(state).await;
    let (_dir, root) = utf8_tempdir();
    let content = vec![7u8; 25];
    let source = write_source(&root, "inline.bin", &content);

    let store = Arc::new(RedbTransferStore::open(&root.join("db")).unwrap());
    let record = TransferRecord::new_upload(
        "alice",
        source.as_str(),
        "/inline.bin",
        "application/octet-stream",
        25,
    );
    store.insert(&record).unwrap();
    let env = env_for(&server, Arc::clone(&store), fast_options());
    let collection = env.endpoints.parent_collection_url("/inline.bin", None).unwrap();
    let tus = probe_tus(env.client.as_ref(), collection.clone(), &RequestContext::default())
        .await
        .unwrap()
        .unwrap();
    assert!(tus.creation_with_upload());

    let outcome = TusDriver::new(&env)
        .upload(&record, &collection, &tus, &scope(&record))
        .await
        .unwrap();

    assert_eq!(outcome.stats.patch_calls, 2);
    assert_eq!(server.file("/inline.bin"), Some(content));
}

#[tokio::test]
async fn cancelled_upload_keeps_confirmed_offset() {
    let server = DavServer::start().await;
    let (_dir, root) = utf8_tempdir();
    let source = write_source(&root, "cancel.bin", &[1u8; 40]);

    let store = Arc::new(RedbTransferStore::open(&root.join("db")).unwrap());
    let record = TransferRecord::new_upload(
        "alice",
        source.as_str(),
        "/cancel.bin",
        "application/octet-stream",
        40,
    );
    store.insert(&record).unwrap();
    let env = env_for(&server, Arc::clone(&store), fast_options());
    let collection = env.endpoints.parent_collection_url("/cancel.bin", None).unwrap();
    let tus = probe_tus(env.client.as_ref(), collection.clone(), &RequestContext::default())
        .await
        .unwrap()
        .unwrap();

    let scope = scope(&record);
    scope.cancel.cancel();
    let err = TusDriver::new(&env)
        .upload(&record, &collection, &tus, &scope)
        .await
        .unwrap_err();

    assert_eq!(err.result_code(), ResultCode::Cancelled);
    assert_eq!(server.state().patch_calls, 0);
    assert!(server.file("/cancel.bin").is_none());
}

#[tokio::test]
async fn advertised_chunk_cap_and_method_override_are_honoured() {
    let mut state = DavState::default();
    state.max_chunk_size = Some(4);
    state.patch_via_post = true;
    let server = DavServer::with_state(state).await;
    let (_dir, root) = utf8_tempdir();
    let content = b"twenty bytes of data".to_vec();
    let source = write_source(&root, "capped.bin", &content);

    let store = Arc::new(RedbTransferStore::open(&root.join("db")).unwrap());
    let record = TransferRecord::new_upload(
        "alice",
        source.as_str(),
        "/docs/capped.bin",
        "application/octet-stream",
        20,
    );
    store.insert(&record).unwrap();
    let env = env_for(&server, Arc::clone(&store), fast_options());

    let collection = env.endpoints.parent_collection_url("/docs/capped.bin", None).unwrap();
    let tus = probe_tus(env.client.as_ref(), collection.clone(), &RequestContext::default())
        .await
        .unwrap()
        .expect("server advertises TUS");
    assert_eq!(tus.max_chunk_size, Some(4));
    assert!(tus.http_method_override);

    let outcome = TusDriver::new(&env)
        .upload(&record, &collection, &tus, &scope(&record))
        .await
        .unwrap();

    // 20 bytes in 4-byte chunks, each sent as an overridden POST.
    assert_eq!(outcome.stats.patch_calls, 5);
    assert_eq!(server.state().count("PATCH"), 0);
    assert_eq!(server.state().count("POST"), 1 + 5);
    assert_eq!(server.file("/docs/capped.bin"), Some(content));
}
