use reqwest::StatusCode;
use stratus_core::tus::TusViolation;
use stratus_core::ResultCode;
use stratus_infra::{ChecksumError, HttpError};
use stratus_persistence::{StorageError, StorageErrorKind};

/// What the worker must do with a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Re-queue the whole unit of work for the scheduler's backoff.
    Retry,
    /// Mark FAILED and notify; never retried automatically.
    Fatal(FatalKind),
    /// Stopped on request; the record goes back to the queue untouched.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// The user has to log in again.
    NeedsReauth,
    Generic,
}

/// The single error type raised by every transfer driver.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("local file {path} does not exist")]
    LocalFileNotFound { path: String },
    #[error("no permission to read {path}")]
    LocalPermissionDenied { path: String },
    #[error("cannot read {path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("{method} {url} answered {status}")]
    Status {
        method: String,
        url: String,
        status: StatusCode,
    },
    #[error("server rejected the credentials ({status})")]
    Unauthorized { status: StatusCode },
    #[error("access to {url} is forbidden")]
    Forbidden { url: String },
    #[error("{url} changed on the server since it was last seen")]
    PreconditionFailed { url: String },
    #[error("{url} does not exist on the server")]
    RemoteNotFound { url: String },
    #[error("upload session {url} expired on the server")]
    SessionExpired { url: String },
    #[error("server refused to create an upload session ({status})")]
    CreateRejected { status: StatusCode },
    #[error("{context}: response lacks the {header} header")]
    MissingHeader {
        header: &'static str,
        context: &'static str,
    },
    #[error("protocol violation: {0}")]
    Protocol(#[from] TusViolation),
    #[error("transfer state: {0}")]
    Storage(#[from] StorageError),
    #[error("no unresolved conflict is recorded for {remote_path}")]
    NoConflict { remote_path: String },
    #[error("transfer cancelled")]
    Cancelled,
}

fn io_disposition(err: &std::io::Error) -> Disposition {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            Disposition::Fatal(FatalKind::Generic)
        }
        _ => Disposition::Retry,
    }
}

fn status_disposition(status: StatusCode) -> Disposition {
    if status == StatusCode::UNAUTHORIZED {
        Disposition::Fatal(FatalKind::NeedsReauth)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Disposition::Retry
    } else {
        Disposition::Fatal(FatalKind::Generic)
    }
}

fn io_result_code(err: &std::io::Error) -> ResultCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => ResultCode::LocalFileNotFound,
        std::io::ErrorKind::PermissionDenied => ResultCode::PermissionDenied,
        _ => ResultCode::Unknown,
    }
}

impl TransferError {
    /// Decide retry vs. fatal. This is the only place that makes that call.
    pub fn classify(&self) -> Disposition {
        use TransferError::*;
        match self {
            Cancelled | Http(HttpError::Cancelled) => Disposition::Cancelled,
            Unauthorized { .. } => Disposition::Fatal(FatalKind::NeedsReauth),
            LocalFileNotFound { .. }
            | LocalPermissionDenied { .. }
            | Forbidden { .. }
            | PreconditionFailed { .. }
            | RemoteNotFound { .. }
            | MissingHeader { .. }
            | Protocol(_)
            | NoConflict { .. }
            | Http(HttpError::InvalidRequest(_)) => Disposition::Fatal(FatalKind::Generic),
            LocalIo { source, .. } | Http(HttpError::Io(source)) => io_disposition(source),
            Http(HttpError::Transport { .. }) => Disposition::Retry,
            Status { status, .. } | CreateRejected { status } => status_disposition(*status),
            SessionExpired { .. } => Disposition::Retry,
            Storage(e) => match e.kind() {
                StorageErrorKind::Busy | StorageErrorKind::Io | StorageErrorKind::Backend => {
                    Disposition::Retry
                }
                _ => Disposition::Fatal(FatalKind::Generic),
            },
        }
    }

    pub fn result_code(&self) -> ResultCode {
        use TransferError::*;
        match self {
            Cancelled | Http(HttpError::Cancelled) => ResultCode::Cancelled,
            LocalFileNotFound { .. } => ResultCode::LocalFileNotFound,
            LocalPermissionDenied { .. } | Forbidden { .. } => ResultCode::PermissionDenied,
            LocalIo { source, .. } | Http(HttpError::Io(source)) => io_result_code(source),
            Http(HttpError::Transport { .. }) => ResultCode::NetworkError,
            Http(HttpError::InvalidRequest(_)) | Storage(_) | NoConflict { .. } => {
                ResultCode::Unknown
            }
            Status { status, .. } | CreateRejected { status } => {
                if status.is_server_error() {
                    ResultCode::ServerError
                } else if *status == StatusCode::REQUEST_TIMEOUT {
                    ResultCode::NetworkError
                } else {
                    ResultCode::Unknown
                }
            }
            Unauthorized { .. } => ResultCode::Unauthorized,
            PreconditionFailed { .. } => ResultCode::PreconditionFailed,
            RemoteNotFound { .. } => ResultCode::RemoteFileNotFound,
            SessionExpired { .. } => ResultCode::SessionExpired,
            Protocol(TusViolation::RetriesExhausted { .. }) => ResultCode::RetriesExhausted,
            MissingHeader { .. } | Protocol(_) => ResultCode::ProtocolViolation,
        }
    }

    /// Failures that allow abandoning a resumable attempt for another strategy.
    pub(crate) fn allows_fallback(&self) -> bool {
        match self {
            TransferError::CreateRejected { .. }
            | TransferError::MissingHeader {
                header: "Location",
                ..
            }
            | TransferError::Http(HttpError::Transport { .. }) => true,
            TransferError::Status { status, .. } => *status != StatusCode::UNAUTHORIZED,
            _ => false,
        }
    }

    /// Failures the TUS loop answers with an offset re-query instead of giving up.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            TransferError::Http(HttpError::Transport { .. }) => true,
            TransferError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::CONFLICT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    // 460: checksum mismatch (TUS checksum extension)
                    || status.as_u16() == 460
            }
            _ => false,
        }
    }

    pub(crate) fn local(path: &str, err: ChecksumError) -> Self {
        match err {
            ChecksumError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => TransferError::LocalFileNotFound {
                    path: path.to_string(),
                },
                std::io::ErrorKind::PermissionDenied => TransferError::LocalPermissionDenied {
                    path: path.to_string(),
                },
                _ => TransferError::LocalIo {
                    path: path.to_string(),
                    source: e,
                },
            },
            other => TransferError::LocalIo {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, other.to_string()),
            },
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        TransferError::Http(HttpError::InvalidRequest(message.into()))
    }
}
