//! Progress reporting types shared between the scheduler and front ends.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// What one worker slot is doing right now.
#[derive(Debug, Clone)]
pub struct WorkerProgress {
    /// Source URL of the current transfer, once resolved.
    pub url: Option<String>,
    /// Bytes written into the image so far for this part.
    pub bytes_fetched: u64,
    /// Total size of the part being transferred.
    pub part_size: u64,
}

/// Point-in-time view of a reconstruction.
///
/// Byte counts cover completed parts only; per-worker counters carry the
/// in-flight amounts.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Active worker slots, in slot order.
    pub workers: Vec<WorkerProgress>,
    /// Parts that have reached `Complete`.
    pub files_done: usize,
    /// Total number of component files.
    pub files_total: usize,
    /// Bytes covered by completed parts.
    pub bytes_done: u64,
    /// Bytes covered by all component files.
    pub bytes_total: u64,
}

/// Callback invoked by the scheduler as completion counts change.
pub type ProgressFn = Box<dyn Fn(&ProgressSnapshot) + Send>;

/// Shared per-slot record read by progress snapshots.
///
/// Guarded by the slots mutex, which is separate from the status board so
/// reporting never contends with status transitions. The byte counter is
/// atomic so the worker can update it without taking the lock.
pub(crate) struct SlotInfo {
    /// Index of the part this slot is working on.
    pub(crate) part: Option<usize>,
    /// Resolved source URL, published by the worker.
    pub(crate) url: Option<String>,
    /// Bytes fetched so far, updated by the worker.
    pub(crate) fetched: Arc<AtomicU64>,
}

impl SlotInfo {
    pub(crate) fn idle() -> Self {
        SlotInfo {
            part: None,
            url: None,
            fetched: Arc::new(AtomicU64::new(0)),
        }
    }
}
