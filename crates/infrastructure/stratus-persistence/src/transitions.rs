//! Record mutations shared by every store backend. Each function validates
//! and applies one change to an in-memory record; the backend is responsible
//! for doing the load, the call and the save inside one transaction.

use stratus_core::{ResultCode, TransferRecord, TransferStatus, TusSession};

use crate::{Requeue, StorageError};

fn touch(record: &mut TransferRecord) {
    record.updated_at = chrono::Utc::now().timestamp();
}

fn invalid(record: &TransferRecord, to: TransferStatus) -> StorageError {
    StorageError::InvalidTransition {
        id: record.id.clone(),
        from: record.status,
        to,
    }
}

fn session_mut<'a>(
    record: &'a mut TransferRecord,
    upload_url: &str,
) -> Result<&'a mut TusSession, StorageError> {
    let id = record.id.clone();
    match record.session.as_mut() {
        Some(s) if s.upload_url == upload_url => Ok(s),
        _ => Err(StorageError::SessionMismatch {
            id,
            upload_url: upload_url.to_string(),
        }),
    }
}

pub(crate) fn claim(record: &mut TransferRecord) -> Result<(), StorageError> {
    if record.status != TransferStatus::Enqueued {
        return Err(invalid(record, TransferStatus::InProgress));
    }
    record.status = TransferStatus::InProgress;
    touch(record);
    Ok(())
}

pub(crate) fn requeue(record: &mut TransferRecord, reason: Requeue) -> Result<(), StorageError> {
    match reason {
        Requeue::Retry(code) => {
            if record.status != TransferStatus::InProgress {
                return Err(invalid(record, TransferStatus::Enqueued));
            }
            record.attempts = record.attempts.saturating_add(1);
            record.result_code = Some(code);
        }
        Requeue::Cancelled => {
            if record.status.is_terminal() {
                return Err(invalid(record, TransferStatus::Enqueued));
            }
            record.result_code = Some(ResultCode::Cancelled);
        }
        Requeue::Manual => {
            if record.status != TransferStatus::Failed {
                return Err(invalid(record, TransferStatus::Enqueued));
            }
            record.attempts = 0;
            record.result_code = None;
        }
    }
    record.status = TransferStatus::Enqueued;
    touch(record);
    Ok(())
}

pub(crate) fn begin_session(
    record: &mut TransferRecord,
    session: &TusSession,
) -> Result<(), StorageError> {
    if record.status.is_terminal() {
        return Err(invalid(record, record.status));
    }
    if let Some(existing) = &record.session {
        if existing.upload_url != session.upload_url {
            return Err(StorageError::SessionMismatch {
                id: record.id.clone(),
                upload_url: session.upload_url.clone(),
            });
        }
    }
    if session.offset > session.length {
        return Err(StorageError::OffsetOutOfRange {
            id: record.id.clone(),
            offset: session.offset,
            length: session.length,
        });
    }
    record.session = Some(session.clone());
    touch(record);
    Ok(())
}

pub(crate) fn update_offset(
    record: &mut TransferRecord,
    upload_url: &str,
    offset: u64,
) -> Result<(), StorageError> {
    let id = record.id.clone();
    let session = session_mut(record, upload_url)?;
    if offset < session.offset {
        return Err(StorageError::OffsetRegression {
            id,
            previous: session.offset,
            reported: offset,
        });
    }
    if offset > session.length {
        return Err(StorageError::OffsetOutOfRange {
            id,
            offset,
            length: session.length,
        });
    }
    session.offset = offset;
    touch(record);
    Ok(())
}

pub(crate) fn rewind_offset(
    record: &mut TransferRecord,
    upload_url: &str,
    offset: u64,
) -> Result<(), StorageError> {
    let id = record.id.clone();
    let session = session_mut(record, upload_url)?;
    if offset > session.offset {
        return Err(StorageError::OffsetOutOfRange {
            id,
            offset,
            length: session.offset,
        });
    }
    tracing::warn!(transfer = %id, from = session.offset, to = offset, "rewinding session offset");
    session.offset = offset;
    touch(record);
    Ok(())
}

pub(crate) fn set_session_expiry(
    record: &mut TransferRecord,
    upload_url: &str,
    expires: &str,
) -> Result<(), StorageError> {
    session_mut(record, upload_url)?.expires = Some(expires.to_string());
    touch(record);
    Ok(())
}

pub(crate) fn clear_session(record: &mut TransferRecord) {
    if record.session.take().is_some() {
        touch(record);
    }
}

pub(crate) fn finish(
    record: &mut TransferRecord,
    status: TransferStatus,
    code: ResultCode,
) -> Result<(), StorageError> {
    if !status.is_terminal() || record.status.is_terminal() {
        return Err(invalid(record, status));
    }
    record.status = status;
    record.result_code = Some(code);
    record.session = None;
    touch(record);
    Ok(())
}

/// Returns true when the record was IN_PROGRESS and has been reset.
pub(crate) fn reset_interrupted(record: &mut TransferRecord) -> bool {
    if record.status != TransferStatus::InProgress {
        return false;
    }
    record.status = TransferStatus::Enqueued;
    touch(record);
    true
}
