use stratus_core::TransferRecord;

use crate::api::FileSyncState;
use crate::StorageError;

pub fn encode_record(record: &TransferRecord) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(record)?)
}

pub fn decode_record(bytes: &[u8]) -> Result<TransferRecord, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_file_state(state: &FileSyncState) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(state)?)
}

pub fn decode_file_state(bytes: &[u8]) -> Result<FileSyncState, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}
