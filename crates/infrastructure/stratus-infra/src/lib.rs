pub mod hashing;
pub mod net;

// Re-exports for convenience
pub use hashing::{file_checksum, ChecksumError, ChunkReader};
pub use net::{
    probe_tus, HttpError, ReqwestTransferClient, RequestBody, RequestContext, TransferClient,
    TransferRequest, TransferResponse,
};
