use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stratus_core::{percent_of, ResultCode, TransferDirection, TransferId, TransferStatus};
use stratus_infra::net::ProgressFn;
use tokio::sync::mpsc::UnboundedSender;

/// Lifecycle and progress notifications published by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        id: TransferId,
        direction: TransferDirection,
        total: u64,
    },
    Progress {
        id: TransferId,
        percent: u8,
        bytes_done: u64,
        total: u64,
    },
    Retrying {
        id: TransferId,
        attempt: u32,
        delay: Duration,
    },
    Finished {
        id: TransferId,
        status: TransferStatus,
        code: ResultCode,
    },
    /// Persistent user-facing failure notice.
    Failed {
        id: TransferId,
        code: ResultCode,
        needs_reauth: bool,
    },
}

/// Turns byte counts into percentage events, one per distinct integer percent.
///
/// Published progress never moves backwards: bytes resent after a rewind to
/// the server offset count toward the high-water mark, not below it.
pub struct ProgressReporter {
    id: TransferId,
    total: u64,
    done: AtomicU64,
    shown: AtomicU64,
    /// 255 until the first event is sent.
    last_percent: AtomicU8,
    tx: Option<UnboundedSender<TransferEvent>>,
}

const NOTHING_SENT: u8 = u8::MAX;

impl ProgressReporter {
    pub fn new(
        id: impl Into<TransferId>,
        total: u64,
        tx: Option<UnboundedSender<TransferEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            total,
            done: AtomicU64::new(0),
            shown: AtomicU64::new(0),
            last_percent: AtomicU8::new(NOTHING_SENT),
            tx,
        })
    }

    /// Reporter that only counts bytes.
    pub fn silent(id: impl Into<TransferId>, total: u64) -> Arc<Self> {
        Self::new(id, total, None)
    }

    pub fn bytes_done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn add(&self, delta: u64) {
        let done = self.done.fetch_add(delta, Ordering::Relaxed) + delta;
        self.publish(done);
    }

    /// Set the absolute byte count, e.g. a server-confirmed offset.
    pub fn observe(&self, bytes_done: u64) {
        self.done.store(bytes_done, Ordering::Relaxed);
        self.publish(bytes_done);
    }

    fn publish(&self, bytes_done: u64) {
        let bytes_done = self.shown.fetch_max(bytes_done, Ordering::AcqRel).max(bytes_done);
        let percent = percent_of(bytes_done, self.total);
        if self.last_percent.swap(percent, Ordering::AcqRel) == percent {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(TransferEvent::Progress {
                id: self.id.clone(),
                percent,
                bytes_done: bytes_done.min(self.total),
                total: self.total,
            });
        }
    }

    /// Callback for request bodies; counts streamed bytes.
    pub fn callback(self: &Arc<Self>) -> ProgressFn {
        let me = Arc::clone(self);
        Arc::new(move |delta| me.add(delta))
    }
}
