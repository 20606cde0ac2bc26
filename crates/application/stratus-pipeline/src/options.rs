use reqwest::Url;
use std::time::Duration;
use stratus_config::{
    backoff_delay_ms, BACKOFF_BASE_MS, BACKOFF_MAX_MS, CHUNK_THRESHOLD_BYTES, LEGACY_CHUNK_BYTES,
    MAX_PATCH_RETRIES, MAX_SCHEDULER_ATTEMPTS, TUS_CHUNK_BYTES,
};
use stratus_core::path_utils::RemotePath;
use stratus_core::tus::TusLimits;
use stratus_core::TusSupport;

use crate::TransferError;

/// Runtime knobs for the drivers and the scheduler.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Files strictly larger than this go through TUS or chunking.
    pub chunk_threshold: u64,
    pub tus_chunk_size: u64,
    pub legacy_chunk_size: u64,
    pub max_patch_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_scheduler_attempts: u32,
    pub scheduler_backoff_base: Duration,
    pub scheduler_backoff_max: Duration,
    /// Send per-chunk `Upload-Checksum` and whole-file `OC-Checksum` headers.
    pub checksums: bool,
    pub rate_limit_bytes: Option<u64>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_threshold: CHUNK_THRESHOLD_BYTES,
            tus_chunk_size: TUS_CHUNK_BYTES,
            legacy_chunk_size: LEGACY_CHUNK_BYTES,
            max_patch_retries: MAX_PATCH_RETRIES,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(BACKOFF_MAX_MS),
            max_scheduler_attempts: MAX_SCHEDULER_ATTEMPTS,
            scheduler_backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            scheduler_backoff_max: Duration::from_millis(BACKOFF_MAX_MS),
            checksums: true,
            rate_limit_bytes: None,
        }
    }
}

fn delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    Duration::from_millis(backoff_delay_ms(
        attempt,
        base.as_millis() as u64,
        max.as_millis() as u64,
    ))
}

impl TransferOptions {
    /// Delay before re-sending a chunk after the `attempt`-th failure at one offset.
    pub fn patch_backoff(&self, attempt: u32) -> Duration {
        delay(attempt, self.backoff_base, self.backoff_max)
    }

    /// Delay before the scheduler re-runs a unit that failed `attempt` times.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        delay(
            attempt,
            self.scheduler_backoff_base,
            self.scheduler_backoff_max,
        )
    }

    pub(crate) fn tus_limits(&self, tus: &TusSupport) -> TusLimits {
        TusLimits {
            chunk_size: self.tus_chunk_size.max(1),
            server_max_chunk: tus.max_chunk_size,
            max_retries: self.max_patch_retries,
        }
    }
}

/// WebDAV roots of one account on one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEndpoints {
    pub files_root: Url,
    pub uploads_root: Url,
    pub spaces_root: Url,
}

fn normalize_base(raw: &str) -> Result<Url, TransferError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)
        .map_err(|e| TransferError::invalid(format!("invalid server url {raw}: {e}")))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(TransferError::invalid(format!(
            "server url {raw} must be an http(s) url"
        )));
    }
    Ok(url)
}

fn join_segments<'a, I>(base: &Url, segments: I) -> Result<Url, TransferError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| TransferError::invalid(format!("{base} cannot hold a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

impl DavEndpoints {
    pub fn new(files_root: Url, uploads_root: Url, spaces_root: Url) -> Self {
        Self {
            files_root,
            uploads_root,
            spaces_root,
        }
    }

    /// Standard ownCloud layout below `server`:
    /// `remote.php/dav/{files,uploads}/<user>` and `remote.php/dav/spaces`.
    pub fn for_user(server: &str, user: &str) -> Result<Self, TransferError> {
        if user.is_empty() || user.contains('/') {
            return Err(TransferError::invalid(format!("invalid user name {user:?}")));
        }
        let base = normalize_base(server)?;
        Ok(Self {
            files_root: join_segments(&base, ["remote.php", "dav", "files", user])?,
            uploads_root: join_segments(&base, ["remote.php", "dav", "uploads", user])?,
            spaces_root: join_segments(&base, ["remote.php", "dav", "spaces"])?,
        })
    }

    /// URL of a file, inside a space when `space_id` is set.
    pub fn file_url(&self, remote_path: &str, space_id: Option<&str>) -> Result<Url, TransferError> {
        if !RemotePath::verify_safe(remote_path) {
            return Err(TransferError::invalid(format!(
                "remote path {remote_path} escapes the account root"
            )));
        }
        let segments = RemotePath::segments(remote_path);
        match space_id {
            Some(space) => join_segments(
                &self.spaces_root,
                std::iter::once(space).chain(segments.iter().map(String::as_str)),
            ),
            None => join_segments(&self.files_root, segments.iter().map(String::as_str)),
        }
    }

    /// Collection holding `remote_path`, with a trailing slash.
    pub fn parent_collection_url(
        &self,
        remote_path: &str,
        space_id: Option<&str>,
    ) -> Result<Url, TransferError> {
        let mut url = self.file_url(&RemotePath::parent(remote_path), space_id)?;
        if !url.path().ends_with('/') {
            url.path_segments_mut()
                .map_err(|_| TransferError::invalid("collection url cannot hold a path"))?
                .push("");
        }
        Ok(url)
    }

    /// Staging collection for the legacy chunking protocol.
    pub fn staging_url(&self, name: &str) -> Result<Url, TransferError> {
        join_segments(&self.uploads_root, [name])
    }
}
