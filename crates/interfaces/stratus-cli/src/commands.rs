use crate::{CliBehavior, ServerArgs};
use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use directories::ProjectDirs;
use humansize::{format_size, BINARY};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Arc;
use stratus_core::path_utils::RemotePath;
use stratus_core::{ServerCapabilities, TransferId, TransferRecord, TransferStatus};
use stratus_infra::net::default_http_client;
use stratus_infra::{probe_tus, ReqwestTransferClient, RequestContext, TransferClient};
use stratus_persistence::{RedbTransferStore, Requeue, TransferRecordStore};
use stratus_pipeline::{
    DavEndpoints, HttpEtagSource, RemoteEtagSource, SyncDecision, SyncRequest, SyncService,
    TransferEnv, TransferEvent, TransferOptions, TransferScheduler, TransferWorker,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

const QUALIFIER: &str = "io";
const ORG: &str = "stratus";
const APP: &str = "stratus";

/// Directory holding the transfer database: `explicit` or the platform data dir.
pub fn data_root(explicit: Option<Utf8PathBuf>) -> Result<Utf8PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    let dirs = ProjectDirs::from(QUALIFIER, ORG, APP)
        .ok_or_else(|| anyhow!("Could not determine data directory"))?;
    Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf())
        .map_err(|p| anyhow!("Data directory {} is not valid UTF-8", p.display()))
}

pub fn open_store(data_dir: Option<Utf8PathBuf>) -> Result<Arc<RedbTransferStore>> {
    let root = data_root(data_dir)?;
    let store = RedbTransferStore::open(&root)
        .with_context(|| format!("Failed to open transfer store in {root}"))?;
    Ok(Arc::new(store))
}

/// Everything a command needs to move bytes for one account.
pub struct Engine {
    pub store: Arc<RedbTransferStore>,
    pub env: TransferEnv,
    pub caps: ServerCapabilities,
    pub user: String,
    workers: usize,
}

impl Engine {
    pub async fn connect(server: &ServerArgs, data_dir: Option<Utf8PathBuf>) -> Result<Self> {
        let store = open_store(data_dir)?;
        let auth = server.token.as_ref().map(|t| format!("Bearer {t}"));
        let http = default_http_client(auth.as_deref()).context("Failed to build HTTP client")?;
        let rate_limit = server.limit_kb.map(|kb| kb.saturating_mul(1024));
        let client: Arc<dyn TransferClient> =
            Arc::new(ReqwestTransferClient::new(http).with_rate_limit(rate_limit));
        let endpoints = DavEndpoints::for_user(&server.server, &server.user)
            .context("Invalid server URL or user")?;

        let root = endpoints.parent_collection_url("/", None)?;
        let tus = probe_tus(client.as_ref(), root, &RequestContext::default())
            .await
            .with_context(|| format!("Failed to reach {}", server.server))?;
        tracing::debug!(?tus, chunking = server.chunking, "server capabilities");

        let options = TransferOptions {
            rate_limit_bytes: rate_limit,
            ..TransferOptions::default()
        };
        let env = TransferEnv::new(
            client,
            Arc::clone(&store) as Arc<dyn TransferRecordStore>,
            endpoints,
            options,
        );
        Ok(Self {
            store,
            env,
            caps: ServerCapabilities {
                chunking: server.chunking,
                tus,
            },
            user: server.user.clone(),
            workers: server.workers,
        })
    }

    fn scheduler(&self) -> (TransferScheduler, UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = unbounded_channel();
        let worker = TransferWorker::new(self.env.clone(), self.caps.clone())
            .with_file_state(Arc::clone(&self.store) as _)
            .with_events(tx);
        (TransferScheduler::new(worker, self.workers), rx)
    }

    /// Run `ids`, or every queued record when `ids` is empty, until the queue drains.
    pub async fn run(&self, ids: &[TransferId]) -> Result<Summary> {
        let (scheduler, rx) = self.scheduler();
        if ids.is_empty() {
            let n = scheduler.resume_pending()?;
            println!(":: {n} transfer(s) queued");
        } else {
            for id in ids {
                scheduler.enqueue(id);
            }
        }
        let summary = drive(&scheduler, rx).await;
        scheduler.shutdown().await;
        Ok(summary)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub needs_reauth: bool,
}

impl Summary {
    fn report(self) -> Result<()> {
        println!(
            "\n:: Done: {} succeeded, {} failed",
            self.succeeded, self.failed
        );
        if self.needs_reauth {
            tracing::error!("server rejected the credentials");
            println!("   Credentials were rejected; refresh STRATUS_TOKEN and run `retry`.");
        }
        if self.failed > 0 {
            anyhow::bail!("{} transfer(s) failed (see `status`)", self.failed);
        }
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold} [{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

async fn drive(
    scheduler: &TransferScheduler,
    mut rx: UnboundedReceiver<TransferEvent>,
) -> Summary {
    let bars = MultiProgress::new();
    let mut active: HashMap<TransferId, ProgressBar> = HashMap::new();
    let mut summary = Summary::default();

    let idle = scheduler.wait_idle();
    tokio::pin!(idle);
    loop {
        tokio::select! {
            Some(event) = rx.recv() => render(&bars, &mut active, &mut summary, event),
            _ = &mut idle => break,
        }
    }
    while let Ok(event) = rx.try_recv() {
        render(&bars, &mut active, &mut summary, event);
    }
    summary
}

fn render(
    bars: &MultiProgress,
    active: &mut HashMap<TransferId, ProgressBar>,
    summary: &mut Summary,
    event: TransferEvent,
) {
    match event {
        TransferEvent::Started {
            id,
            direction,
            total,
        } => {
            let pb = active
                .entry(id.clone())
                .or_insert_with(|| bars.add(ProgressBar::new(total)));
            pb.set_style(bar_style());
            pb.set_length(total);
            pb.set_prefix(format!("{} {:?}", short_id(&id), direction));
            pb.set_message("");
        }
        TransferEvent::Progress { id, bytes_done, .. } => {
            if let Some(pb) = active.get(&id) {
                pb.set_position(bytes_done);
            }
        }
        TransferEvent::Retrying { id, attempt, delay } => {
            if let Some(pb) = active.get(&id) {
                pb.set_message(format!("retry #{attempt} in {delay:?}"));
            }
        }
        TransferEvent::Finished { id, status, code } => {
            if status == TransferStatus::Succeeded {
                summary.succeeded += 1;
            }
            if let Some(pb) = active.remove(&id) {
                if status == TransferStatus::Succeeded {
                    pb.finish_with_message("done");
                } else {
                    pb.abandon_with_message(format!("{} ({code:?})", status.as_str()));
                }
            }
        }
        TransferEvent::Failed {
            id,
            code,
            needs_reauth,
        } => {
            summary.failed += 1;
            summary.needs_reauth |= needs_reauth;
            if let Some(pb) = active.remove(&id) {
                pb.abandon_with_message(format!("failed: {code:?}"));
            }
        }
    }
}

pub async fn cmd_upload(
    server: &ServerArgs,
    data_dir: Option<Utf8PathBuf>,
    local: Utf8PathBuf,
    remote: String,
    space: Option<String>,
    if_match: Option<String>,
    behavior: CliBehavior,
) -> Result<Summary> {
    let meta = std::fs::metadata(&local).with_context(|| format!("Cannot read {local}"))?;
    if !meta.is_file() {
        anyhow::bail!("{local} is not a regular file");
    }
    let local = local
        .canonicalize_utf8()
        .with_context(|| format!("Cannot resolve {local}"))?;
    let remote = RemotePath::normalize(&remote);

    println!(":: Uploading {local} -> {remote} ({})", format_size(meta.len(), BINARY));
    let engine = Engine::connect(server, data_dir).await?;
    let mut record = TransferRecord::new_upload(
        engine.user.as_str(),
        local.as_str(),
        remote.as_str(),
        "application/octet-stream",
        meta.len(),
    )
    .with_behavior(behavior.into());
    if let Some(space) = space {
        record = record.with_space(space);
    }
    if let Some(etag) = if_match {
        record = record.with_required_etag(etag);
    }
    engine.store.insert(&record)?;

    let summary = engine.run(std::slice::from_ref(&record.id)).await?;
    summary.report()?;
    Ok(summary)
}

pub async fn cmd_download(
    server: &ServerArgs,
    data_dir: Option<Utf8PathBuf>,
    remote: String,
    local: Utf8PathBuf,
    space: Option<String>,
) -> Result<Summary> {
    let remote = RemotePath::normalize(&remote);
    println!(":: Downloading {remote} -> {local}");
    let engine = Engine::connect(server, data_dir).await?;
    let size = HttpEtagSource::new(
        Arc::clone(&engine.env.client),
        engine.env.endpoints.clone(),
        CancellationToken::new(),
    )
    .lookup(&remote, space.as_deref())
    .await?
    .size
    .unwrap_or_default();
    let mut record =
        TransferRecord::new_download(engine.user.as_str(), remote.as_str(), local.as_str(), size);
    if let Some(space) = space {
        record = record.with_space(space);
    }
    engine.store.insert(&record)?;

    let summary = engine.run(std::slice::from_ref(&record.id)).await?;
    summary.report()?;
    Ok(summary)
}

pub async fn cmd_sync(
    server: &ServerArgs,
    data_dir: Option<Utf8PathBuf>,
    local: Utf8PathBuf,
    remote: String,
    space: Option<String>,
    keep_both: bool,
) -> Result<SyncDecision> {
    let engine = Engine::connect(server, data_dir).await?;
    let etags = HttpEtagSource::new(
        Arc::clone(&engine.env.client),
        engine.env.endpoints.clone(),
        CancellationToken::new(),
    );
    let service = SyncService::new(
        Arc::clone(&engine.store) as _,
        Arc::clone(&engine.store) as _,
        Arc::new(etags),
    );
    let mut req = SyncRequest::new(engine.user.as_str(), remote, local);
    req.space_id = space;

    println!(":: Synchronizing {} <-> {}", req.local_path, req.remote_path);
    let mut decision = service.synchronize(&req).await?;
    if let SyncDecision::ConflictDetected(etag) = &decision {
        println!("   Conflict: both sides changed (server etag {etag})");
        if !keep_both {
            println!("   Re-run with --keep-both to keep the local copy and fetch the server version.");
            return Ok(decision);
        }
        decision = service.resolve_with_copy(&req).await?;
    }

    match &decision {
        SyncDecision::AlreadySynchronized => println!("   Status: up to date"),
        SyncDecision::FileNotFound => println!("   Status: missing on both sides"),
        SyncDecision::ConflictDetected(_) => {}
        SyncDecision::ConflictResolvedWithCopy(copy) => {
            println!("   Local edit kept as {copy}");
            engine.run(&[]).await?.report()?;
        }
        SyncDecision::UploadEnqueued(id) | SyncDecision::DownloadEnqueued(id) => {
            engine.run(std::slice::from_ref(id)).await?.report()?;
        }
    }
    Ok(decision)
}

fn print_records(records: &[TransferRecord]) {
    if records.is_empty() {
        println!("   No transfers.");
        return;
    }
    for r in records {
        let progress = r
            .session_percent()
            .map(|p| format!(" {p}%"))
            .unwrap_or_default();
        let code = r.result_code.map(|c| format!(" {c:?}")).unwrap_or_default();
        println!(
            "   {}  {:<11} {:?} {} ({}){progress}{code} attempts={}",
            short_id(&r.id),
            r.status.as_str(),
            r.direction,
            r.remote_path,
            format_size(r.size, BINARY),
            r.attempts,
        );
    }
}

pub fn cmd_status(data_dir: Option<Utf8PathBuf>, account: Option<String>) -> Result<()> {
    let store = open_store(data_dir)?;
    println!(":: Database: {:?} ({})", store.validate()?, store.path());
    let mut records = match account {
        Some(account) => store.list_by_account(&account)?,
        None => {
            let mut all = Vec::new();
            for status in [
                TransferStatus::InProgress,
                TransferStatus::Enqueued,
                TransferStatus::Failed,
                TransferStatus::Succeeded,
            ] {
                all.extend(store.list_by_status(status)?);
            }
            all
        }
    };
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    println!(":: Transfers");
    print_records(&records);
    Ok(())
}

fn resolve_id(store: &RedbTransferStore, prefix: &str) -> Result<TransferId> {
    if let Some(record) = store.get(prefix)? {
        return Ok(record.id);
    }
    let mut matches = Vec::new();
    for status in [
        TransferStatus::Enqueued,
        TransferStatus::InProgress,
        TransferStatus::Failed,
        TransferStatus::Succeeded,
    ] {
        matches.extend(
            store
                .list_by_status(status)?
                .into_iter()
                .filter(|r| r.id.starts_with(prefix))
                .map(|r| r.id),
        );
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(anyhow!("No transfer matches '{prefix}'")),
        n => Err(anyhow!("'{prefix}' is ambiguous ({n} transfers)")),
    }
}

pub async fn cmd_retry(
    server: &ServerArgs,
    data_dir: Option<Utf8PathBuf>,
    id: Option<String>,
) -> Result<Summary> {
    let engine = Engine::connect(server, data_dir).await?;
    let summary = match id {
        Some(prefix) => {
            let id = resolve_id(&engine.store, &prefix)?;
            let record = engine
                .store
                .requeue(&id, Requeue::Manual)
                .with_context(|| format!("Cannot retry {prefix}"))?;
            println!(":: Retrying {} ({})", short_id(&record.id), record.remote_path);
            engine.run(std::slice::from_ref(&record.id)).await?
        }
        None => {
            println!(":: Resuming pending transfers");
            engine.run(&[]).await?
        }
    };
    summary.report()?;
    Ok(summary)
}

pub async fn cmd_cancel(
    server: &ServerArgs,
    data_dir: Option<Utf8PathBuf>,
    id: String,
) -> Result<()> {
    let engine = Engine::connect(server, data_dir).await?;
    let id = resolve_id(&engine.store, &id)?;
    let (scheduler, _rx) = engine.scheduler();
    match scheduler.delete(&id).await? {
        Some(record) => println!(
            ":: Cancelled {} ({})",
            short_id(&record.id),
            record.remote_path
        ),
        None => println!(":: Nothing to cancel"),
    }
    Ok(())
}

pub async fn cmd_probe(server: &ServerArgs, data_dir: Option<Utf8PathBuf>) -> Result<ServerCapabilities> {
    let engine = Engine::connect(server, data_dir).await?;
    println!(":: Server capabilities for {}", server.server);
    match &engine.caps.tus {
        Some(tus) => {
            println!("   TUS:        {}", tus.version);
            println!("   Extensions: {}", tus.extensions.join(", "));
            if let Some(max) = tus.max_size {
                println!("   Max size:   {}", format_size(max, BINARY));
            }
        }
        None => println!("   TUS:        not offered"),
    }
    println!("   Chunking:   {}", if engine.caps.chunking { "assumed" } else { "off" });
    Ok(engine.caps.clone())
}
