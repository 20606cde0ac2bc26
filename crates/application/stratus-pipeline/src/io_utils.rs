use camino::Utf8Path;
use std::time::Duration;

/// Rename with retries; another process may briefly hold the target open.
pub async fn robust_rename(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
    let mut attempt = 0u32;
    let max_attempts = 8u32;
    let mut backoff = Duration::from_millis(50);

    loop {
        match tokio::fs::rename(from, to).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts || e.kind() == std::io::ErrorKind::NotFound {
                    return Err(e);
                }
                tracing::debug!("rename {from} -> {to} failed ({e}), retrying");
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, Duration::from_millis(2000));
            }
        }
    }
}

/// Delete a file, logging instead of failing.
pub async fn remove_best_effort(path: &Utf8Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("removed {path}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("could not remove {path}: {e}"),
    }
}

/// Temporary download target next to `dest`.
pub fn partial_path(dest: &Utf8Path) -> camino::Utf8PathBuf {
    let mut name = dest.file_name().unwrap_or("download").to_string();
    name.push_str(".part");
    dest.with_file_name(name)
}
