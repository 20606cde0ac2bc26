use stratus_core::{ServerCapabilities, TransferRecord, TusSupport};

use super::{
    ChunkedUploadDriver, SinglePutUploader, Strategy, TransferEnv, TransferScope, TusDriver,
    UploadOutcome,
};
use crate::TransferError;

/// Picks the upload protocol for a record and falls back when a fresh
/// resumable attempt fails before any byte is confirmed.
pub struct StrategySelector<'a> {
    env: &'a TransferEnv,
}

impl<'a> StrategySelector<'a> {
    pub fn new(env: &'a TransferEnv) -> Self {
        Self { env }
    }

    /// Strategy for a file of `size` bytes. A stored session always resumes.
    pub fn plan(
        size: u64,
        caps: &ServerCapabilities,
        has_session: bool,
        threshold: u64,
    ) -> Strategy {
        if has_session {
            return Strategy::Tus;
        }
        if size <= threshold {
            return Strategy::SinglePut;
        }
        if caps.tus.is_some() {
            Strategy::Tus
        } else {
            Self::fallback_for(caps)
        }
    }

    pub fn fallback_for(caps: &ServerCapabilities) -> Strategy {
        if caps.chunking {
            Strategy::Chunked
        } else {
            Strategy::SinglePut
        }
    }

    pub async fn upload(
        &self,
        record: &TransferRecord,
        caps: &ServerCapabilities,
        scope: &TransferScope,
    ) -> Result<UploadOutcome, TransferError> {
        let size = tokio::fs::metadata(&record.local_path)
            .await
            .map_err(|e| TransferError::local(&record.local_path, e.into()))?
            .len();
        let resumed = record.session.is_some();
        let strategy = Self::plan(size, caps, resumed, self.env.options.chunk_threshold);
        tracing::debug!(transfer = %record.id, size, %strategy, resumed, "upload strategy selected");

        if strategy != Strategy::Tus {
            return self.run_plain(strategy, record, scope).await;
        }

        // A resumed session may predate a capability probe that found no TUS.
        let tus = caps.tus.clone().unwrap_or_else(|| TusSupport {
            version: record
                .session
                .as_ref()
                .map(|s| s.version.clone())
                .unwrap_or_else(|| stratus_config::TUS_VERSION.to_string()),
            ..TusSupport::default()
        });
        let collection = self
            .env
            .endpoints
            .parent_collection_url(&record.remote_path, record.space_id.as_deref())?;
        let driver = TusDriver::new(self.env);

        let err = match driver.upload(record, &collection, &tus, scope).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if resumed || !e.allows_fallback() => return Err(e),
            Err(e) => e,
        };

        // Only bytes the server confirmed and we persisted count as written.
        let stored = self.env.store.get(&record.id)?.and_then(|r| r.session);
        if let Some(session) = &stored {
            if session.offset > 0 {
                return Err(err);
            }
            driver.terminate(session, &tus, scope).await;
            self.env.store.clear_session(&record.id)?;
        }

        let next = Self::fallback_for(caps);
        tracing::warn!(transfer = %record.id, error = %err, "resumable upload unavailable, falling back to {next}");
        scope.progress.observe(0);
        let mut outcome = self.run_plain(next, record, scope).await?;
        outcome.fallback_from = Some(Strategy::Tus);
        Ok(outcome)
    }

    async fn run_plain(
        &self,
        strategy: Strategy,
        record: &TransferRecord,
        scope: &TransferScope,
    ) -> Result<UploadOutcome, TransferError> {
        match strategy {
            Strategy::Chunked => ChunkedUploadDriver::new(self.env).upload(record, scope).await,
            Strategy::SinglePut | Strategy::Tus => {
                SinglePutUploader::new(self.env).upload(record, scope).await
            }
        }
    }
}
