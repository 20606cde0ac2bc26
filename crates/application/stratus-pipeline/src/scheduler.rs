use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use stratus_core::{TransferId, TransferRecord, TransferStatus};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::tracker::TransferEvent;
use crate::worker::{TransferWorker, WorkOutcome};
use crate::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Scheduled,
    /// The id already has a unit queued or running; the existing one is kept.
    AlreadyActive,
    ShuttingDown,
}

struct Inner {
    worker: TransferWorker,
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<TransferId, CancellationToken>>,
    shutdown: CancellationToken,
    active_count: watch::Sender<usize>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<TransferId, CancellationToken>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, id: &str) {
        let mut active = self.active();
        active.remove(id);
        self.active_count.send_replace(active.len());
    }
}

/// Bounded pool running one unit of work per transfer id.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct TransferScheduler {
    inner: Arc<Inner>,
}

impl TransferScheduler {
    pub fn new(worker: TransferWorker, workers: usize) -> Self {
        let workers = stratus_config::clamp_workers(workers);
        let (active_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                worker,
                permits: Arc::new(Semaphore::new(workers)),
                active: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                active_count,
            }),
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.active().contains_key(id)
    }

    /// Schedule `id`. Must be called from within a tokio runtime.
    pub fn enqueue(&self, id: &str) -> EnqueueResult {
        if self.inner.shutdown.is_cancelled() {
            return EnqueueResult::ShuttingDown;
        }
        let token = {
            let mut active = self.inner.active();
            if active.contains_key(id) {
                tracing::debug!(transfer = %id, "already scheduled, keeping existing work");
                return EnqueueResult::AlreadyActive;
            }
            let token = self.inner.shutdown.child_token();
            active.insert(id.to_string(), token.clone());
            self.inner.active_count.send_replace(active.len());
            token
        };

        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move {
            run_unit(&inner, &id, token).await;
            inner.release(&id);
        });
        EnqueueResult::Scheduled
    }

    /// Ask a queued or running unit to stop. The record returns to ENQUEUED.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.active().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop any work on `id`, release its server session and remove the record.
    pub async fn delete(&self, id: &str) -> Result<Option<TransferRecord>, TransferError> {
        let mut changes = self.inner.active_count.subscribe();
        if self.cancel(id) {
            while self.is_active(id) {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        }
        let store = &self.inner.worker.env().store;
        if let Some(record) = store.get(id)? {
            self.inner.worker.discard(&record).await;
        }
        let removed = store.delete(id)?;
        if removed.is_some() {
            tracing::info!(transfer = %id, "transfer deleted");
        }
        Ok(removed)
    }

    /// Move records a dead process left running back to the queue and schedule
    /// every queued record. Returns how many were scheduled.
    pub fn resume_pending(&self) -> Result<usize, TransferError> {
        let store = &self.inner.worker.env().store;
        let reset = store.reset_interrupted()?;
        if !reset.is_empty() {
            tracing::info!(count = reset.len(), "re-queued interrupted transfers");
        }
        let mut scheduled = 0;
        for record in store.list_by_status(TransferStatus::Enqueued)? {
            if self.enqueue(&record.id) == EnqueueResult::Scheduled {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Resolves once no unit is queued or running.
    pub async fn wait_idle(&self) {
        let mut changes = self.inner.active_count.subscribe();
        let _ = changes.wait_for(|n| *n == 0).await;
    }

    /// Cancel everything and wait for the units to put their records back.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.wait_idle().await;
        tracing::info!("transfer scheduler stopped");
    }
}

async fn run_unit(inner: &Inner, id: &str, token: CancellationToken) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let outcome = inner.worker.run(id, token.clone()).await;
        drop(permit);

        match outcome {
            Ok(WorkOutcome::Retry { record, error }) => {
                let delay = inner.worker.env().options.retry_backoff(record.attempts);
                tracing::debug!(transfer = %id, ?delay, attempt = record.attempts, "retrying after {error}");
                inner.worker.emit(TransferEvent::Retrying {
                    id: id.to_string(),
                    attempt: record.attempts,
                    delay,
                });
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(transfer = %id, "transfer could not run: {e}");
                return;
            }
        }
    }
}
