use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use stratus_core::{ResultCode, TransferId, TransferRecord, TransferStatus, TusSession};

use crate::api::{DbState, FileSyncState, Requeue, CURRENT_SCHEMA, STRATUS_REDB_FILENAME};
use crate::codec::{decode_file_state, decode_record, encode_file_state, encode_record};
use crate::index_key::IndexKey;
use crate::paths::normalize_remote_path;
use crate::transitions;
use crate::{FileSyncStore, StorageError, TransferRecordStore};

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");
const TRANSFERS: TableDefinition<&str, &[u8]> = TableDefinition::new("transfers");
const BY_ACCOUNT: TableDefinition<&[u8], &str> = TableDefinition::new("transfers_by_account");
const FILE_STATE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("file_state");

const META_FORMAT_KEY: &str = "format";
const META_FORMAT_VALUE: &str = "stratus-redb";
const META_SCHEMA_VERSION: &str = "schema_version";
const META_CREATED_AT: &str = "created_at";

/// Transfer and file-sync state in a single `redb` file.
///
/// The handle owns its [`Database`]; clone it to share between workers.
#[derive(Clone)]
pub struct RedbTransferStore {
    path: Utf8PathBuf,
    db: Arc<Database>,
}

impl RedbTransferStore {
    fn is_corrupt_open_error(err: &redb::DatabaseError) -> bool {
        match err {
            redb::DatabaseError::Storage(storage) => match storage {
                redb::StorageError::Corrupted(_) => true,
                redb::StorageError::Io(ioe) => matches!(
                    ioe.kind(),
                    std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
                ),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn path_for_root(root: &Utf8Path) -> Utf8PathBuf {
        root.join(STRATUS_REDB_FILENAME)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Open the store under `root`, creating it on first use. A file that is
    /// not a stratus database is moved aside and reported as corrupt.
    pub fn open(root: &Utf8Path) -> Result<Self, StorageError> {
        let path = Self::path_for_root(root);
        std::fs::create_dir_all(root)?;

        let db = if path.exists() {
            match Database::open(path.as_std_path()) {
                Ok(db) => db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(StorageError::DatabaseAlreadyOpen);
                }
                Err(e) if Self::is_corrupt_open_error(&e) => {
                    let _ = quarantine_corrupt_file(&path);
                    return Err(StorageError::Corrupt);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            Database::create(path.as_std_path())?
        };

        if let Err(e) = ensure_schema(&db) {
            drop(db);
            if matches!(e, StorageError::Corrupt) {
                let _ = quarantine_corrupt_file(&path);
            }
            return Err(e);
        }
        tracing::debug!("opened transfer store at {path}");
        Ok(Self {
            path,
            db: Arc::new(db),
        })
    }

    /// Report the state of the database under `root` without keeping it open.
    pub fn inspect(root: &Utf8Path) -> Result<DbState, StorageError> {
        let path = Self::path_for_root(root);
        if !path.exists() {
            return Ok(DbState::Missing);
        }
        match Database::open(path.as_std_path()) {
            Ok(db) => match ensure_schema(&db) {
                Ok(()) => Ok(DbState::Valid),
                Err(StorageError::NewerSchema { found, supported }) => {
                    Ok(DbState::NewerSchema { found, supported })
                }
                Err(StorageError::DatabaseAlreadyOpen) => Ok(DbState::Busy),
                Err(StorageError::Corrupt) => {
                    drop(db);
                    let _ = quarantine_corrupt_file(&path);
                    Ok(DbState::Corrupt)
                }
                Err(e) => Err(e),
            },
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => Ok(DbState::Busy),
            Err(e) if Self::is_corrupt_open_error(&e) => {
                let _ = quarantine_corrupt_file(&path);
                Ok(DbState::Corrupt)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load, change and store one record inside a single write transaction.
    fn mutate<F>(&self, id: &str, change: F) -> Result<TransferRecord, StorageError>
    where
        F: FnOnce(&mut TransferRecord) -> Result<(), StorageError>,
    {
        let write_tx = self.db.begin_write()?;
        let record = {
            let mut table = write_tx.open_table(TRANSFERS)?;
            let bytes = table.get(id)?.map(|g| g.value().to_vec());
            let Some(bytes) = bytes else {
                return Err(StorageError::NotFound(id.to_string()));
            };
            let mut record = decode_record(&bytes)?;
            change(&mut record)?;
            let encoded = encode_record(&record)?;
            table.insert(id, encoded.as_slice())?;
            record
        };
        write_tx.commit()?;
        Ok(record)
    }

    fn collect<P>(&self, keep: P) -> Result<Vec<TransferRecord>, StorageError>
    where
        P: Fn(&TransferRecord) -> bool,
    {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(TRANSFERS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, v) = row?;
            let record = decode_record(v.value())?;
            if keep(&record) {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

fn ensure_schema(db: &Database) -> Result<(), StorageError> {
    let write_tx = db.begin_write()?;
    {
        let mut meta = write_tx.open_table(META)?;
        let format: Option<String> = meta.get(META_FORMAT_KEY)?.map(|g| g.value().to_string());
        if format.is_none() {
            let schema_version = CURRENT_SCHEMA.to_string();
            let created_at = Utc::now().to_rfc3339();
            meta.insert(META_FORMAT_KEY, META_FORMAT_VALUE)?;
            meta.insert(META_SCHEMA_VERSION, schema_version.as_str())?;
            meta.insert(META_CREATED_AT, created_at.as_str())?;
        } else if format.as_deref() != Some(META_FORMAT_VALUE) {
            return Err(StorageError::Corrupt);
        }
    }
    let _ = write_tx.open_table(TRANSFERS)?;
    let _ = write_tx.open_table(BY_ACCOUNT)?;
    let _ = write_tx.open_table(FILE_STATE)?;
    write_tx.commit()?;

    check_schema_version(db)
}

fn check_schema_version(db: &Database) -> Result<(), StorageError> {
    let read_tx = db.begin_read()?;
    let meta = read_tx.open_table(META)?;
    let schema_version = meta
        .get(META_SCHEMA_VERSION)?
        .and_then(|g| g.value().parse::<u32>().ok())
        .unwrap_or(0);
    if schema_version == 0 {
        return Err(StorageError::Corrupt);
    }
    if schema_version > CURRENT_SCHEMA {
        return Err(StorageError::NewerSchema {
            found: schema_version,
            supported: CURRENT_SCHEMA,
        });
    }
    if schema_version != CURRENT_SCHEMA {
        return Err(StorageError::Corrupt);
    }
    Ok(())
}

fn quarantine_corrupt_file(path: &Utf8Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let ts = Utc::now().format("%Y%m%dT%H%M%S%.f");
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path.file_name().unwrap_or(STRATUS_REDB_FILENAME);
    let new_path = path.with_file_name(format!("{name}.corrupt.{ts}.{}.{n}", std::process::id()));
    tracing::warn!("transfer store unreadable, quarantining to {new_path}");
    std::fs::rename(path, &new_path)
}

impl TransferRecordStore for RedbTransferStore {
    fn validate(&self) -> Result<DbState, StorageError> {
        match check_schema_version(&self.db) {
            Ok(()) => Ok(DbState::Valid),
            Err(StorageError::NewerSchema { found, supported }) => {
                Ok(DbState::NewerSchema { found, supported })
            }
            Err(StorageError::Corrupt) => Ok(DbState::Corrupt),
            Err(e) => Err(e),
        }
    }

    fn insert(&self, record: &TransferRecord) -> Result<(), StorageError> {
        IndexKey::validate_owner(&record.account)?;
        let mut record = record.clone();
        record.remote_path = normalize_remote_path(&record.remote_path)?;
        let encoded = encode_record(&record)?;
        let index = IndexKey::new(&record.account, &record.id).to_bytes();

        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(TRANSFERS)?;
            if table.get(record.id.as_str())?.is_some() {
                return Err(StorageError::Duplicate(record.id.clone()));
            }
            table.insert(record.id.as_str(), encoded.as_slice())?;
            let mut by_account = write_tx.open_table(BY_ACCOUNT)?;
            by_account.insert(index.as_slice(), record.id.as_str())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<TransferRecord>, StorageError> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(TRANSFERS)?;
        let guard = table.get(id)?;
        guard.map(|g| decode_record(g.value())).transpose()
    }

    fn delete(&self, id: &str) -> Result<Option<TransferRecord>, StorageError> {
        let write_tx = self.db.begin_write()?;
        let removed = {
            let mut table = write_tx.open_table(TRANSFERS)?;
            let bytes = table.remove(id)?.map(|g| g.value().to_vec());
            match bytes {
                Some(bytes) => {
                    let record = decode_record(&bytes)?;
                    let index = IndexKey::new(&record.account, &record.id).to_bytes();
                    let mut by_account = write_tx.open_table(BY_ACCOUNT)?;
                    let _ = by_account.remove(index.as_slice())?;
                    Some(record)
                }
                None => None,
            }
        };
        write_tx.commit()?;
        Ok(removed)
    }

    fn list_by_account(&self, account: &str) -> Result<Vec<TransferRecord>, StorageError> {
        let (start, end) = IndexKey::range_for_owner(account)?;
        let read_tx = self.db.begin_read()?;
        let by_account = read_tx.open_table(BY_ACCOUNT)?;
        let transfers = read_tx.open_table(TRANSFERS)?;

        let mut out = Vec::new();
        for row in by_account.range(start.as_slice()..end.as_slice())? {
            let (_, id) = row?;
            if let Some(guard) = transfers.get(id.value())? {
                out.push(decode_record(guard.value())?);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn list_by_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>, StorageError> {
        self.collect(|r| r.status == status)
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
        let write_tx = self.db.begin_write()?;
        let mut reset = Vec::new();
        {
            let mut table = write_tx.open_table(TRANSFERS)?;
            let mut stale = Vec::new();
            for row in table.iter()? {
                let (_, v) = row?;
                let record = decode_record(v.value())?;
                if record.status == TransferStatus::InProgress {
                    stale.push(record);
                }
            }
            for mut record in stale {
                if transitions::reset_interrupted(&mut record) {
                    let encoded = encode_record(&record)?;
                    table.insert(record.id.as_str(), encoded.as_slice())?;
                    reset.push(record.id);
                }
            }
        }
        write_tx.commit()?;
        if !reset.is_empty() {
            tracing::info!("re-queued {} interrupted transfers", reset.len());
        }
        Ok(reset)
    }
}

impl FileSyncStore for RedbTransferStore {
    fn load_file_state(
        &self,
        account: &str,
        remote_path: &str,
    ) -> Result<Option<FileSyncState>, StorageError> {
        IndexKey::validate_owner(account)?;
        let path = normalize_remote_path(remote_path)?;
        let key = IndexKey::new(account, &path).to_bytes();
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(FILE_STATE)?;
        let guard = table.get(key.as_slice())?;
        guard.map(|g| decode_file_state(g.value())).transpose()
    }

    fn save_file_state(
        &self,
        account: &str,
        remote_path: &str,
        state: &FileSyncState,
    ) -> Result<(), StorageError> {
        IndexKey::validate_owner(account)?;
        let path = normalize_remote_path(remote_path)?;
        let key = IndexKey::new(account, &path).to_bytes();
        let value = encode_file_state(state)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(FILE_STATE)?;
            table.insert(key.as_slice(), value.as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }
}
