//! The per-assignment worker: resolve a source, stream it into the mapped
//! destination range, and verify.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::hash::Md5;
use crate::image::ImageFile;
use crate::jigdo::Manifest;
use crate::mirror;
use crate::template::FilePart;

use super::progress::SlotInfo;
use super::state::{PartStatus, StatusBoard};

/// Everything one worker needs for a single part.
pub(crate) struct WorkerJob {
    /// Index of the part on the status board.
    pub(crate) index: usize,
    /// The part itself (offset, size, digest).
    pub(crate) part: FilePart,
    /// Which slot this worker publishes progress to.
    pub(crate) slot: usize,
    pub(crate) image: Arc<ImageFile>,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) board: Arc<StatusBoard>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) slots: Arc<Mutex<Vec<SlotInfo>>>,
    pub(crate) fetched: Arc<AtomicU64>,
}

/// Run one assignment to completion.
///
/// Every exit path leaves the part in a scheduler-visible state: `Complete`
/// on success, `Error` on a retryable failure, `FatalError` when the part
/// cannot be mapped or has no source.
pub(crate) fn run(job: WorkerJob) {
    let part = job.part;

    let url = match mirror::source_for_md5(&job.manifest, &part.md5) {
        Ok(url) => url,
        Err(e) => {
            warn!(part = job.index, error = %e, "no source for part");
            job.board.set(job.index, PartStatus::FatalError);
            return;
        }
    };

    if let Ok(mut slots) = job.slots.lock() {
        slots[job.slot].url = Some(url.clone());
    }

    let mut range = match job.image.map_range(part.offset, part.size) {
        Ok(range) => range,
        Err(e) => {
            warn!(part = job.index, error = %e, "failed to map destination range");
            job.board.set(job.index, PartStatus::FatalError);
            return;
        }
    };

    job.board.set(job.index, PartStatus::InProgress);

    let fetched = Arc::clone(&job.fetched);
    let mut on_progress = |bytes: u64| fetched.store(bytes, Ordering::Relaxed);

    let outcome = job
        .fetcher
        .fetch(&url, range.as_mut_slice(), &mut on_progress);

    match outcome {
        Ok(n) if n == part.size => {
            let actual = Md5::of_bytes(range.as_slice());
            if actual != part.md5 {
                warn!(
                    url,
                    expected = %part.md5,
                    actual = %actual,
                    "digest mismatch on fetched part"
                );
                job.board.record_failure(job.index);
                return;
            }

            if let Err(e) = range.flush_sync() {
                warn!(part = job.index, error = %e, "failed to flush part to disk");
                job.board.record_failure(job.index);
                return;
            }

            debug!(url, bytes = n, "part complete");
            job.board.set(job.index, PartStatus::Complete);
        }
        Ok(short) => {
            warn!(url, got = short, want = part.size, "short transfer");
            job.board.record_failure(job.index);
        }
        Err(e) => {
            warn!(url, error = %e, "transfer failed");
            job.board.record_failure(job.index);
        }
    }
}
