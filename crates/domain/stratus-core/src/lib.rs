use serde::{Deserialize, Serialize};

pub mod capabilities;
pub mod decision;
pub mod path_utils;
pub mod tus;

pub use capabilities::{ServerCapabilities, TusSupport};
pub use decision::{decide, LocalFileState, RemoteFileState, SyncVerdict};

pub type TransferId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Enqueued,
    InProgress,
    Succeeded,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Succeeded | TransferStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Enqueued => "ENQUEUED",
            TransferStatus::InProgress => "IN_PROGRESS",
            TransferStatus::Succeeded => "SUCCEEDED",
            TransferStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// What happens to the local source once an upload succeeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalBehavior {
    #[default]
    Copy,
    Move,
}

/// Last outcome recorded on a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    Cancelled,
    NetworkError,
    ServerError,
    SessionExpired,
    LocalFileNotFound,
    RemoteFileNotFound,
    PermissionDenied,
    Unauthorized,
    PreconditionFailed,
    ProtocolViolation,
    RetriesExhausted,
    Unknown,
}

/// Resumable-session fields of a [`TransferRecord`].
///
/// A record carries either a whole session or none at all, so the fields can
/// never be half-populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TusSession {
    pub upload_url: String,
    pub offset: u64,
    pub length: u64,
    pub version: String,
    /// Raw `Upload-Metadata` header value sent on creation.
    pub metadata: String,
    pub checksum: Option<String>,
    pub expires: Option<String>,
    /// `Upload-Concat` marker for combined uploads.
    pub concat: Option<String>,
}

impl TusSession {
    pub fn new(upload_url: String, length: u64, version: String, metadata: String) -> Self {
        Self {
            upload_url,
            offset: 0,
            length,
            version,
            metadata,
            checksum: None,
            expires: None,
            concat: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.length
    }
}

/// The durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
    pub id: TransferId,
    pub account: String,
    pub direction: TransferDirection,
    /// Filesystem path of the local side (source for uploads, target for downloads).
    pub local_path: String,
    pub remote_path: String,
    pub space_id: Option<String>,
    pub mime_type: String,
    pub size: u64,
    pub status: TransferStatus,
    pub result_code: Option<ResultCode>,
    pub behavior: LocalBehavior,
    pub force_overwrite: bool,
    pub required_etag: Option<String>,
    pub session: Option<TusSession>,
    /// Times the scheduler has re-run this record after a retryable failure.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TransferRecord {
    pub fn new_upload(
        account: impl Into<String>,
        local_path: impl Into<String>,
        remote_path: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        Self::new(
            TransferDirection::Upload,
            account.into(),
            local_path.into(),
            remote_path.into(),
            mime_type.into(),
            size,
        )
    }

    pub fn new_download(
        account: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl Into<String>,
        size: u64,
    ) -> Self {
        Self::new(
            TransferDirection::Download,
            account.into(),
            local_path.into(),
            remote_path.into(),
            "application/octet-stream".to_string(),
            size,
        )
    }

    fn new(
        direction: TransferDirection,
        account: String,
        local_path: String,
        remote_path: String,
        mime_type: String,
        size: u64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account,
            direction,
            local_path,
            remote_path: path_utils::RemotePath::normalize(&remote_path),
            space_id: None,
            mime_type,
            size,
            status: TransferStatus::Enqueued,
            result_code: None,
            behavior: LocalBehavior::Copy,
            force_overwrite: false,
            required_etag: None,
            session: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_space(mut self, space_id: impl Into<String>) -> Self {
        self.space_id = Some(space_id.into());
        self
    }

    pub fn with_behavior(mut self, behavior: LocalBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Overwrite the remote file only if its entity-tag still matches `etag`.
    pub fn with_required_etag(mut self, etag: impl Into<String>) -> Self {
        self.force_overwrite = true;
        self.required_etag = Some(etag.into());
        self
    }

    /// Value for an `If-Match` header, present only when force-overwrite is set.
    pub fn if_match(&self) -> Option<&str> {
        if self.force_overwrite {
            self.required_etag.as_deref()
        } else {
            None
        }
    }

    /// Percentage (0-100) of the active resumable session, if any.
    pub fn session_percent(&self) -> Option<u8> {
        self.session
            .as_ref()
            .map(|s| percent_of(s.offset, s.length))
    }
}

/// Integer percentage of `done` over `total`; an empty total counts as complete.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}
