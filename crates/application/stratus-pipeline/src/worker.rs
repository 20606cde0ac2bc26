use camino::Utf8Path;
use std::sync::Arc;
use stratus_core::{
    LocalBehavior, ResultCode, ServerCapabilities, TransferDirection, TransferRecord,
    TransferStatus, TusSupport,
};
use stratus_persistence::{FileSyncStore, Requeue, StorageErrorKind};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::io_utils::{partial_path, remove_best_effort};
use crate::sync::{HttpEtagSource, RemoteEtagSource};
use crate::tracker::{ProgressReporter, TransferEvent};
use crate::transfer::{
    unix_mtime, Downloader, StrategySelector, TransferEnv, TransferScope, TusDriver,
};
use crate::{Disposition, FatalKind, TransferError};

/// Result of one execution of a record.
#[derive(Debug)]
pub enum WorkOutcome {
    Succeeded(TransferRecord),
    /// Back in the queue; the scheduler decides when to run it again.
    Retry {
        record: TransferRecord,
        error: TransferError,
    },
    Failed {
        record: TransferRecord,
        error: TransferError,
        kind: FatalKind,
    },
    Cancelled(TransferRecord),
}

/// Executes one record end to end and applies the retry/fatal policy.
#[derive(Clone)]
pub struct TransferWorker {
    env: TransferEnv,
    caps: ServerCapabilities,
    files: Option<Arc<dyn FileSyncStore>>,
    events: Option<UnboundedSender<TransferEvent>>,
}

impl TransferWorker {
    pub fn new(env: TransferEnv, caps: ServerCapabilities) -> Self {
        Self {
            env,
            caps,
            files: None,
            events: None,
        }
    }

    /// Record successful transfers in the per-file sync state.
    pub fn with_file_state(mut self, files: Arc<dyn FileSyncStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<TransferEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn env(&self) -> &TransferEnv {
        &self.env
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Claim `id`, run it, and leave it SUCCEEDED, FAILED or back in the queue.
    ///
    /// Errors are returned only when the record could not be claimed or its
    /// final state could not be stored.
    pub async fn run(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> Result<WorkOutcome, TransferError> {
        let record = self.env.store.claim(id)?;
        let progress = ProgressReporter::new(record.id.clone(), record.size, self.events.clone());
        let scope = TransferScope::new(cancel, progress);

        self.emit(TransferEvent::Started {
            id: record.id.clone(),
            direction: record.direction,
            total: record.size,
        });
        tracing::info!(
            transfer = %record.id,
            direction = ?record.direction,
            attempt = record.attempts + 1,
            remote = %record.remote_path,
            "transfer started"
        );

        let result = match record.direction {
            TransferDirection::Upload => self
                .upload(&record, &scope)
                .await
                .map(|o| o.etag),
            TransferDirection::Download => Downloader::new(&self.env)
                .download(&record, &scope)
                .await
                .map(|o| o.etag),
        };

        match result {
            Ok(etag) => self.succeed(&record, etag).await,
            Err(error) => self.fail(record, error),
        }
    }

    async fn upload(
        &self,
        record: &TransferRecord,
        scope: &TransferScope,
    ) -> Result<crate::transfer::UploadOutcome, TransferError> {
        let meta = tokio::fs::metadata(&record.local_path)
            .await
            .map_err(|e| TransferError::local(&record.local_path, e.into()))?;

        let mut record = record.clone();
        if let Some(session) = &record.session {
            if session.length != meta.len() {
                tracing::warn!(
                    transfer = %record.id,
                    declared = session.length,
                    actual = meta.len(),
                    "local file changed since the session was created, starting over"
                );
                self.env.store.clear_session(&record.id)?;
                record.session = None;
            }
        }
        StrategySelector::new(&self.env)
            .upload(&record, &self.caps, scope)
            .await
    }

    async fn succeed(
        &self,
        record: &TransferRecord,
        etag: Option<String>,
    ) -> Result<WorkOutcome, TransferError> {
        let done = self
            .env
            .store
            .finish(&record.id, TransferStatus::Succeeded, ResultCode::Ok)?;

        if let Some(files) = &self.files {
            let etag = match etag.clone() {
                Some(etag) => Some(etag),
                None => self.current_etag(record).await,
            };
            let local_modified = std::fs::metadata(&record.local_path)
                .ok()
                .as_ref()
                .and_then(unix_mtime);
            let saved = files
                .load_file_state(&record.account, &record.remote_path)
                .and_then(|state| {
                    let mut state = state.unwrap_or_default();
                    state.mark_synced(&record.local_path, local_modified, etag.clone());
                    files.save_file_state(&record.account, &record.remote_path, &state)
                });
            if let Err(e) = saved {
                tracing::warn!(transfer = %record.id, "could not record sync state: {e}");
            }
        }

        self.cleanup(record).await;
        self.emit(TransferEvent::Finished {
            id: record.id.clone(),
            status: TransferStatus::Succeeded,
            code: ResultCode::Ok,
        });
        tracing::info!(transfer = %record.id, etag = ?etag, "transfer succeeded");
        Ok(WorkOutcome::Succeeded(done))
    }

    /// Entity-tag of the server copy when the transfer's last answer carried
    /// none. `None` when the lookup fails; the stale tag must not survive.
    async fn current_etag(&self, record: &TransferRecord) -> Option<String> {
        let source = HttpEtagSource::new(
            Arc::clone(&self.env.client),
            self.env.endpoints.clone(),
            CancellationToken::new(),
        );
        match source
            .lookup(&record.remote_path, record.space_id.as_deref())
            .await
        {
            Ok(entry) => entry.etag().map(str::to_string),
            Err(e) => {
                tracing::warn!(transfer = %record.id, "cannot read the server etag: {e}");
                None
            }
        }
    }

    /// Local leftovers of a finished transfer. Never fails the transfer.
    async fn cleanup(&self, record: &TransferRecord) {
        let local = Utf8Path::new(&record.local_path);
        match record.direction {
            TransferDirection::Upload if record.behavior == LocalBehavior::Move => {
                remove_best_effort(local).await;
            }
            TransferDirection::Upload => {}
            TransferDirection::Download => remove_best_effort(&partial_path(local)).await,
        }
    }

    fn fail(&self, record: TransferRecord, error: TransferError) -> Result<WorkOutcome, TransferError> {
        let code = error.result_code();
        match error.classify() {
            Disposition::Cancelled => {
                tracing::info!(transfer = %record.id, "transfer cancelled");
                match self.env.store.requeue(&record.id, Requeue::Cancelled) {
                    Ok(record) => Ok(WorkOutcome::Cancelled(record)),
                    // Deleted while running.
                    Err(e) if e.kind() == StorageErrorKind::NotFound => {
                        Ok(WorkOutcome::Cancelled(record))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Disposition::Retry if record.attempts + 1 >= self.env.options.max_scheduler_attempts => {
                tracing::warn!(
                    transfer = %record.id,
                    attempts = record.attempts + 1,
                    error = %error,
                    "giving up after repeated failures"
                );
                let record = self.finish_failed(&record, ResultCode::RetriesExhausted, false)?;
                Ok(WorkOutcome::Failed {
                    record,
                    error,
                    kind: FatalKind::Generic,
                })
            }
            Disposition::Retry => {
                tracing::info!(transfer = %record.id, error = %error, "transfer will be retried");
                let record = self.env.store.requeue(&record.id, Requeue::Retry(code))?;
                Ok(WorkOutcome::Retry { record, error })
            }
            Disposition::Fatal(kind) => {
                tracing::warn!(transfer = %record.id, error = %error, "transfer failed");
                let record =
                    self.finish_failed(&record, code, kind == FatalKind::NeedsReauth)?;
                Ok(WorkOutcome::Failed {
                    record,
                    error,
                    kind,
                })
            }
        }
    }

    fn finish_failed(
        &self,
        record: &TransferRecord,
        code: ResultCode,
        needs_reauth: bool,
    ) -> Result<TransferRecord, TransferError> {
        let done = self
            .env
            .store
            .finish(&record.id, TransferStatus::Failed, code)?;
        self.emit(TransferEvent::Failed {
            id: record.id.clone(),
            code,
            needs_reauth,
        });
        self.emit(TransferEvent::Finished {
            id: record.id.clone(),
            status: TransferStatus::Failed,
            code,
        });
        Ok(done)
    }

    /// Release what a record holds outside the store before it is deleted.
    pub async fn discard(&self, record: &TransferRecord) {
        if let Some(session) = &record.session {
            let tus = self.caps.tus.clone().unwrap_or_else(|| TusSupport {
                version: session.version.clone(),
                ..TusSupport::default()
            });
            let scope = TransferScope::new(
                CancellationToken::new(),
                ProgressReporter::silent(record.id.clone(), record.size),
            );
            TusDriver::new(&self.env)
                .terminate(session, &tus, &scope)
                .await;
        }
        if record.direction == TransferDirection::Download {
            remove_best_effort(&partial_path(Utf8Path::new(&record.local_path))).await;
        }
    }
}
