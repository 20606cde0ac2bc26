//! Central configuration constants for transfer limits and defaults.

/// Files strictly larger than this are candidates for resumable or chunked upload.
pub const CHUNK_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Size of a single TUS PATCH body before the server-advertised cap is applied.
pub const TUS_CHUNK_BYTES: u64 = 10 * 1024 * 1024;

/// Size of a single chunk in the legacy chunk-then-assemble protocol.
pub const LEGACY_CHUNK_BYTES: u64 = 10 * 1024 * 1024;

/// Consecutive failed PATCH attempts at the same offset before the upload is abandoned.
pub const MAX_PATCH_RETRIES: u32 = 5;

/// First backoff delay between PATCH retries (milliseconds). Doubles per attempt.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for a single backoff delay (milliseconds).
pub const BACKOFF_MAX_MS: u64 = 30_000;

/// Times the scheduler re-runs a retryable transfer before it is marked failed.
pub const MAX_SCHEDULER_ATTEMPTS: u32 = 5;

/// TUS protocol version sent in `Tus-Resumable` and stored with every session.
pub const TUS_VERSION: &str = "1.0.0";

/// Default number of transfers executed concurrently.
pub const DEFAULT_WORKERS: usize = 3;

/// Minimum allowed concurrent transfers.
pub const MIN_WORKERS: usize = 1;

/// Maximum allowed concurrent transfers.
pub const MAX_WORKERS: usize = 8;

/// Convenience function to clamp a worker count into allowed range.
pub fn clamp_workers(v: usize) -> usize {
    v.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Exponential backoff for attempt `n` (1-based), capped at `max_ms`.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}
