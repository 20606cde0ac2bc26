use serde::{Deserialize, Serialize};

/// What is known locally about a synchronized file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalFileState {
    pub local_present: bool,
    /// Local modification time (unix seconds) recorded by the store.
    pub local_modified: Option<i64>,
    /// Time of the last successful transfer in either direction.
    pub last_synced: Option<i64>,
    /// Entity-tag the server reported at the last successful transfer.
    pub synced_etag: Option<String>,
}

impl LocalFileState {
    fn locally_modified(&self) -> bool {
        match (self.local_modified, self.last_synced) {
            (Some(modified), Some(synced)) => modified > synced,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteFileState {
    Missing,
    Present { etag: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncVerdict {
    AlreadySynchronized,
    Upload,
    Download,
    Conflict { remote_etag: String },
    FileNotFound,
}

/// Decide what a synchronization pass must do for one file.
///
/// Rules are evaluated in order; the first match wins.
pub fn decide(local: &LocalFileState, remote: &RemoteFileState) -> SyncVerdict {
    let remote_etag = match remote {
        RemoteFileState::Present { etag } => etag,
        RemoteFileState::Missing => return SyncVerdict::FileNotFound,
    };

    if !local.local_present {
        return SyncVerdict::Download;
    }

    let local_changed = local.locally_modified();
    let remote_changed = local.synced_etag.as_deref() != Some(remote_etag.as_str());

    match (local_changed, remote_changed) {
        (true, false) => SyncVerdict::Upload,
        (false, true) => SyncVerdict::Download,
        (true, true) => SyncVerdict::Conflict {
            remote_etag: remote_etag.clone(),
        },
        (false, false) => SyncVerdict::AlreadySynchronized,
    }
}
