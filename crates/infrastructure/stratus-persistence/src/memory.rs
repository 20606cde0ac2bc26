use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use stratus_core::{ResultCode, TransferId, TransferRecord, TransferStatus, TusSession};

use crate::api::{DbState, FileSyncState, Requeue};
use crate::index_key::IndexKey;
use crate::paths::normalize_remote_path;
use crate::transitions;
use crate::{FileSyncStore, StorageError, TransferRecordStore};

/// Volatile store with the same transition rules as the on-disk one.
#[derive(Default)]
pub struct MemoryTransferStore {
    records: Mutex<BTreeMap<TransferId, TransferRecord>>,
    files: Mutex<HashMap<(String, String), FileSyncState>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, id: &str, change: F) -> Result<TransferRecord, StorageError>
    where
        F: FnOnce(&mut TransferRecord) -> Result<(), StorageError>,
    {
        let mut records = lock(&self.records);
        let stored = records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        // Work on a copy so a rejected change leaves the stored record untouched.
        let mut record = stored.clone();
        change(&mut record)?;
        *stored = record.clone();
        Ok(record)
    }

    fn collect<P>(&self, keep: P) -> Vec<TransferRecord>
    where
        P: Fn(&TransferRecord) -> bool,
    {
        let mut out: Vec<_> = lock(&self.records)
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

impl TransferRecordStore for MemoryTransferStore {
    fn validate(&self) -> Result<DbState, StorageError> {
        Ok(DbState::Valid)
    }

    fn insert(&self, record: &TransferRecord) -> Result<(), StorageError> {
        IndexKey::validate_owner(&record.account)?;
        let mut record = record.clone();
        record.remote_path = normalize_remote_path(&record.remote_path)?;
        let mut records = lock(&self.records);
        if records.contains_key(&record.id) {
            return Err(StorageError::Duplicate(record.id));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<TransferRecord>, StorageError> {
        Ok(lock(&self.records).get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<Option<TransferRecord>, StorageError> {
        Ok(lock(&self.records).remove(id))
    }

    fn list_by_account(&self, account: &str) -> Result<Vec<TransferRecord>, StorageError> {
        IndexKey::validate_owner(account)?;
        Ok(self.collect(|r| r.account == account))
    }

    fn list_by_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>, StorageError> {
        Ok(self.collect(|r| r.status == status))
    }

    fn claim(&self, id: &str) -> Result<TransferRecord, StorageError> {
        self.mutate(id, transitions::claim)
    }

    fn requeue(&self, id: &str, reason: Requeue) -> Result<TransferRecord, StorageError> {
        self.mutate(id, |r| transitions::requeue(r, reason))
    }

    fn begin_session(&self, id: &str, session: &TusSession) -> Result<(), StorageError> {
        self.mutate(id, |r| transitions::begin_session(r, session))
            .map(|_| ())
    }

    fn update_offset(&self, id: &str, upload_url: &str, offset: u64) -> Result<(), StorageError> {
        self.mutate(id, |r| transitions::update_offset(r, upload_url, offset))
            .map(|_| ())
    }

    fn rewind_offset(&self, id: &str, upload_url: &str, offset: u64) -> Result<(), StorageError> {
        self.mutate(id, |r| transitions::rewind_offset(r, upload_url, offset))
            .map(|_| ())
    }

    fn set_session_expiry(
        &self,
        id: &str,
        upload_url: &str,
        expires: &str,
    ) -> Result<(), StorageError> {
        self.mutate(id, |r| transitions::set_session_expiry(r, upload_url, expires))
            .map(|_| ())
    }

    fn clear_session(&self, id: &str) -> Result<(), StorageError> {
        self.mutate(id, |r| {
            transitions::clear_session(r);
            Ok(())
        })
        .map(|_| ())
    }

    fn finish(
        &self,
        id: &str,
        status: TransferStatus,
        code: ResultCode,
    ) -> Result<TransferRecord, StorageError> {
        self.mutate(id, |r| transitions::finish(r, status, code))
    }

    fn reset_interrupted(&self) -> Result<Vec<TransferId>, StorageError> {
        let mut records = lock(&self.records);
        Ok(records
            .values_mut()
            .filter_map(|r| transitions::reset_interrupted(r).then(|| r.id.clone()))
            .collect())
    }
}

impl FileSyncStore for MemoryTransferStore {
    fn load_file_state(
        &self,
        account: &str,
        remote_path: &str,
    ) -> Result<Option<FileSyncState>, StorageError> {
        let key = (account.to_string(), normalize_remote_path(remote_path)?);
        Ok(lock(&self.files).get(&key).cloned())
    }

    fn save_file_state(
        &self,
        account: &str,
        remote_path: &str,
        state: &FileSyncState,
    ) -> Result<(), StorageError> {
        IndexKey::validate_owner(account)?;
        let key = (account.to_string(), normalize_remote_path(remote_path)?);
        lock(&self.files).insert(key, state.clone());
        Ok(())
    }
}
