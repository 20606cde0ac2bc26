use stratus_core::path_utils::RemotePath;

pub fn normalize_remote_path(remote_path: &str) -> Result<String, crate::StorageError> {
    if !RemotePath::verify_safe(remote_path) {
        return Err(crate::StorageError::InvalidPath(remote_path.to_string()));
    }
    Ok(RemotePath::normalize(remote_path))
}
