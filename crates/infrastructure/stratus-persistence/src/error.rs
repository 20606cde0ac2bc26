use stratus_core::TransferStatus;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("stratus.redb missing")]
    Missing,
    #[error("stratus.redb schema is invalid or corrupt")]
    Corrupt,
    #[error("stratus.redb is from a newer stratus (schema_version={found}, supported={supported})")]
    NewerSchema { found: u32, supported: u32 },
    #[error("stratus.redb is already open in this process")]
    DatabaseAlreadyOpen,
    #[error("transfer {0} not found")]
    NotFound(String),
    #[error("transfer {0} already exists")]
    Duplicate(String),
    #[error("transfer {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: TransferStatus,
        to: TransferStatus,
    },
    #[error("transfer {id} has no session at {upload_url}")]
    SessionMismatch { id: String, upload_url: String },
    #[error("transfer {id}: offset {reported} is behind stored offset {previous}")]
    OffsetRegression {
        id: String,
        previous: u64,
        reported: u64,
    },
    #[error("transfer {id}: offset {offset} exceeds session length {length}")]
    OffsetOutOfRange { id: String, offset: u64, length: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("redb error: {0}")]
    Redb(Box<redb::Error>),
    #[error("redb database error: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("redb transaction error: {0}")]
    RedbTransaction(Box<redb::TransactionError>),
    #[error("redb table error: {0}")]
    RedbTable(Box<redb::TableError>),
    #[error("redb storage error: {0}")]
    RedbStorage(Box<redb::StorageError>),
    #[error("redb commit error: {0}")]
    RedbCommit(Box<redb::CommitError>),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Missing,
    Corrupt,
    NewerSchema,
    Busy,
    NotFound,
    InvalidTransition,
    /// The write contradicts the stored session (wrong URL, offset decrease, out of range, duplicate id).
    Conflict,
    InvalidPath,
    Io,
    Codec,
    Backend,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::Missing => StorageErrorKind::Missing,
            StorageError::Corrupt => StorageErrorKind::Corrupt,
            StorageError::NewerSchema { .. } => StorageErrorKind::NewerSchema,
            StorageError::DatabaseAlreadyOpen => StorageErrorKind::Busy,
            StorageError::NotFound(_) => StorageErrorKind::NotFound,
            StorageError::InvalidTransition { .. } => StorageErrorKind::InvalidTransition,
            StorageError::Duplicate(_)
            | StorageError::SessionMismatch { .. }
            | StorageError::OffsetRegression { .. }
            | StorageError::OffsetOutOfRange { .. } => StorageErrorKind::Conflict,
            StorageError::Io(_) => StorageErrorKind::Io,
            StorageError::Serde(_) => StorageErrorKind::Codec,
            StorageError::InvalidPath(_) => StorageErrorKind::InvalidPath,
            StorageError::Redb(_)
            | StorageError::RedbDatabase(_)
            | StorageError::RedbTransaction(_)
            | StorageError::RedbTable(_)
            | StorageError::RedbStorage(_)
            | StorageError::RedbCommit(_) => StorageErrorKind::Backend,
        }
    }
}

macro_rules! boxed_redb_error {
    ($($source:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$source> for StorageError {
                fn from(value: $source) -> Self {
                    Self::$variant(Box::new(value))
                }
            }
        )+
    };
}

boxed_redb_error! {
    redb::Error => Redb,
    redb::TransactionError => RedbTransaction,
    redb::TableError => RedbTable,
    redb::StorageError => RedbStorage,
    redb::CommitError => RedbCommit,
}

// A second open of the same file is a lock conflict, not a backend fault.
impl From<redb::DatabaseError> for StorageError {
    fn from(value: redb::DatabaseError) -> Self {
        match value {
            redb::DatabaseError::DatabaseAlreadyOpen => Self::DatabaseAlreadyOpen,
            other => Self::RedbDatabase(Box::new(other)),
        }
    }
}
