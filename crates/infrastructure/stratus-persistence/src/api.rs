use serde::{Deserialize, Serialize};
use stratus_core::{
    LocalFileState, ResultCode, TransferId, TransferRecord, TransferStatus, TusSession,
};

pub const STRATUS_REDB_FILENAME: &str = "stratus.redb";
pub const CURRENT_SCHEMA: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Missing,
    Valid,
    Busy,
    Corrupt,
    NewerSchema { found: u32, supported: u32 },
}

/// Why a record goes back to ENQUEUED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Retryable failure; counts toward the scheduler's attempt ceiling.
    Retry(ResultCode),
    /// Cooperative cancellation. The resumable session is kept.
    Cancelled,
    /// Explicit user retry of a FAILED record. Resets the attempt counter.
    Manual,
}

/// Per-file synchronization bookkeeping, keyed by (account, remote path).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSyncState {
    pub local_path: Option<String>,
    pub local_modified: Option<i64>,
    pub last_synced: Option<i64>,
    pub synced_etag: Option<String>,
    /// Remote etag recorded when a conflict was detected and not yet resolved.
    pub conflict_etag: Option<String>,
}

impl FileSyncState {
    /// Decision input. `disk_modified` is the mtime of the local copy, `None`
    /// when there is no local copy; a fresh mtime wins over the stored one.
    pub fn to_local_state(&self, disk_modified: Option<i64>) -> LocalFileState {
        LocalFileState {
            local_present: disk_modified.is_some(),
            local_modified: disk_modified.or(self.local_modified),
            last_synced: self.last_synced,
            synced_etag: self.synced_etag.clone(),
        }
    }

    /// Record a finished transfer: the local copy and the server now agree on
    /// `etag`. An unknown etag clears the old one.
    pub fn mark_synced(&mut self, local_path: &str, local_modified: Option<i64>, etag: Option<String>) {
        let now = chrono::Utc::now().timestamp();
        self.local_path = Some(local_path.to_string());
        self.local_modified = local_modified;
        self.last_synced = Some(local_modified.map_or(now, |m| m.max(now)));
        self.synced_etag = etag;
        self.conflict_etag = None;
    }
}

/// Durable store of [`TransferRecord`]s.
///
/// Every mutating operation is a single atomic read-modify-write of one
/// record; a resume and a retry racing on the same id observe each other's
/// writes in full or not at all.
pub trait TransferRecordStore: Send + Sync {
    fn validate(&self) -> Result<DbState, crate::StorageError>;

    fn insert(&self, record: &TransferRecord) -> Result<(), crate::StorageError>;
    fn get(&self, id: &str) -> Result<Option<TransferRecord>, crate::StorageError>;
    /// Remove a record; returns what was stored, if anything.
    fn delete(&self, id: &str) -> Result<Option<TransferRecord>, crate::StorageError>;

    fn list_by_account(&self, account: &str) -> Result<Vec<TransferRecord>, crate::StorageError>;
    fn list_by_status(
        &self,
        status: TransferStatus,
    ) -> Result<Vec<TransferRecord>, crate::StorageError>;

    /// ENQUEUED -> IN_PROGRESS.
    fn claim(&self, id: &str) -> Result<TransferRecord, crate::StorageError>;
    fn requeue(&self, id: &str, reason: Requeue) -> Result<TransferRecord, crate::StorageError>;

    /// Store a freshly created resumable session. All session fields land together.
    fn begin_session(&self, id: &str, session: &TusSession) -> Result<(), crate::StorageError>;
    /// Advance the offset of the session at `upload_url`. Decreases are rejected.
    fn update_offset(
        &self,
        id: &str,
        upload_url: &str,
        offset: u64,
    ) -> Result<(), crate::StorageError>;
    /// Move the offset of the session at `upload_url` backwards after the server lost data.
    fn rewind_offset(
        &self,
        id: &str,
        upload_url: &str,
        offset: u64,
    ) -> Result<(), crate::StorageError>;
    fn set_session_expiry(
        &self,
        id: &str,
        upload_url: &str,
        expires: &str,
    ) -> Result<(), crate::StorageError>;
    fn clear_session(&self, id: &str) -> Result<(), crate::StorageError>;

    /// Terminal status, result code and session clearing in one update.
    fn finish(
        &self,
        id: &str,
        status: TransferStatus,
        code: ResultCode,
    ) -> Result<TransferRecord, crate::StorageError>;

    /// Return records a dead process left IN_PROGRESS to ENQUEUED.
    fn reset_interrupted(&self) -> Result<Vec<TransferId>, crate::StorageError>;
}

pub trait FileSyncStore: Send + Sync {
    fn load_file_state(
        &self,
        account: &str,
        remote_path: &str,
    ) -> Result<Option<FileSyncState>, crate::StorageError>;

    fn save_file_state(
        &self,
        account: &str,
        remote_path: &str,
        state: &FileSyncState,
    ) -> Result<(), crate::StorageError>;
}
