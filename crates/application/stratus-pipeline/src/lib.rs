mod error;
mod io_utils;
pub mod options;
pub mod scheduler;
pub mod sync;
pub mod tracker;
pub mod transfer;
pub mod worker;

pub use error::{Disposition, FatalKind, TransferError};
pub use options::{DavEndpoints, TransferOptions};
pub use scheduler::{EnqueueResult, TransferScheduler};
pub use sync::{
    HttpEtagSource, RemoteEntry, RemoteEtagSource, SyncDecision, SyncRequest, SyncService,
};
pub use tracker::{ProgressReporter, TransferEvent};
pub use transfer::{
    ChunkedUploadDriver, DownloadOutcome, Downloader, DriverStats, SinglePutUploader, Strategy,
    StrategySelector, TransferEnv, TransferScope, TusDriver, UploadOutcome,
};
pub use worker::{TransferWorker, WorkOutcome};
