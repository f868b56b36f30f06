//! Parallel reconstruction: the scheduler loop and its workers.
//!
//! Reconstruction runs one scheduler thread plus a pool of short-lived
//! worker threads, one per assignment. The scheduler polls its slots,
//! joins finished workers, and claims the next eligible part under the
//! status-board lock; workers stream their part straight into a mapped
//! window of the image and verify it. Parts that fail transiently are
//! reclaimed, possibly landing on a different mirror; a part that exhausts
//! its attempts (or cannot be mapped or resolved at all) aborts the run.
//!
//! ```text
//! Assembler ──► StatusBoard ◄── Worker ──► Fetcher
//!     │              │             │
//!     │              │             └──► ImageFile (mapped range)
//!     └── resume verification ─────────►    │
//!                                           └── final whole-image MD5
//! ```

mod progress;
mod state;
mod worker;

pub use progress::{ProgressFn, ProgressSnapshot, WorkerProgress};
pub use state::PartStatus;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::fetch::Fetcher;
use crate::hash::Md5;
use crate::image::{ImageError, ImageFile};
use crate::jigdo::Manifest;
use crate::mirror;
use crate::template::{DescTable, FilePart};

use progress::SlotInfo;
use state::{Outstanding, StatusBoard};

/// Errors that abort a reconstruction.
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    /// The status lock was poisoned by a panicking worker.
    #[error("reconstruction state lock was poisoned")]
    Lock,

    /// A part failed unrecoverably.
    #[error("part {md5} failed after {attempts} attempts")]
    PartFailed { md5: Md5, attempts: u32 },

    /// The finished image does not hash to the expected digest. The file
    /// is left in place for a later resume.
    #[error("image digest mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: Md5, actual: Md5 },

    /// Sizing, mapping, or flushing the image failed.
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Tunables for a reconstruction run.
#[derive(Debug, Clone)]
pub struct AssembleConfig {
    /// Number of worker slots.
    pub workers: usize,
    /// Attempts per part before a transient failure becomes fatal.
    pub max_attempts: u32,
    /// Pause between scheduler polling rounds.
    pub poll_interval: Duration,
}

impl Default for AssembleConfig {
    fn default() -> Self {
        AssembleConfig {
            workers: 16,
            max_attempts: 5,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl AssembleConfig {
    /// Set the worker count (minimum 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the per-part attempt bound (minimum 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the scheduler polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Summary of a successful reconstruction.
#[derive(Debug, Clone)]
pub struct AssembleReport {
    /// Total component files in the template.
    pub files_total: usize,
    /// Files satisfied from local mirror directories.
    pub files_local: usize,
    /// Files already present and verified in the existing output.
    pub files_resumed: usize,
    /// Files transferred by workers this run.
    pub files_transferred: usize,
    /// Combined size of all component files.
    pub bytes_total: u64,
    /// Verified whole-image digest.
    pub md5: Md5,
}

/// Drives a full reconstruction over an open image.
pub struct Assembler {
    config: AssembleConfig,
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::new(AssembleConfig::default())
    }
}

impl Assembler {
    /// Create an assembler with the given configuration.
    pub fn new(config: AssembleConfig) -> Self {
        Assembler { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &AssembleConfig {
        &self.config
    }

    /// Fetch every component file into `image` and verify the result.
    ///
    /// Succeeds iff every part reaches `Complete` and the whole-image MD5
    /// equals the template's. On failure the partially written image is
    /// preserved so a later run can resume from it.
    pub fn run(
        &self,
        image: Arc<ImageFile>,
        manifest: Arc<Manifest>,
        table: &DescTable,
        fetcher: Arc<dyn Fetcher>,
        on_progress: Option<ProgressFn>,
    ) -> Result<AssembleReport, AssembleError> {
        let parts: Arc<Vec<FilePart>> = Arc::new(table.files.clone());
        let total = parts.len();
        let sizes: Vec<u64> = parts.iter().map(|p| p.size).collect();
        let bytes_total: u64 = sizes.iter().sum();

        let board = Arc::new(StatusBoard::new(total, self.config.max_attempts));

        // Parts with a verified copy in a local mirror directory never go
        // over the network; the worker copies them through file://.
        let mut files_local = 0;
        for (index, part) in parts.iter().enumerate() {
            let advertised = mirror::find_by_md5(&manifest, &part.md5);
            if advertised.iter().any(|f| f.local_match.is_some()) {
                board.set(index, PartStatus::LocalCopy);
                files_local += 1;
            }
        }
        if files_local > 0 {
            info!(files_local, "parts available from local mirror directories");
        }

        let files_resumed = if image.existing() {
            self.verify_existing(&image, &parts, &board)?
        } else {
            0
        };

        // Largest parts first, so the long transfers start early and the
        // tail of the run stays parallel.
        let mut order: Vec<usize> = (0..total).collect();
        order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]).then(a.cmp(&b)));

        info!(
            to_fetch = total - files_resumed - files_local,
            files_local,
            files_resumed,
            total_kib = bytes_total / 1024,
            "starting part transfers"
        );

        let workers = self.config.workers.max(1);
        let slots: Arc<Mutex<Vec<SlotInfo>>> =
            Arc::new(Mutex::new((0..workers).map(|_| SlotInfo::idle()).collect()));
        let mut handles: Vec<Option<JoinHandle<()>>> = (0..workers).map(|_| None).collect();
        let mut assignments: Vec<Option<usize>> = vec![None; workers];
        let mut last_reported = usize::MAX;

        let fatal = loop {
            match board.outstanding()? {
                Outstanding::Done => break None,
                Outstanding::Fatal(index) => break Some(index),
                Outstanding::Pending => {}
            }

            for slot in 0..workers {
                self.poll_slot(
                    slot,
                    &mut assignments,
                    &mut handles,
                    &order,
                    &parts,
                    &board,
                    &slots,
                    &image,
                    &manifest,
                    &fetcher,
                )?;
            }

            if let Some(cb) = on_progress.as_ref() {
                let (files_done, bytes_done) = board.completed(&sizes);
                if files_done != last_reported {
                    last_reported = files_done;
                    cb(&snapshot(
                        &slots, &parts, files_done, total, bytes_done, bytes_total,
                    ));
                }
            }

            thread::sleep(self.config.poll_interval);
        };

        // Join everything still in flight before touching the result.
        for (slot, handle) in handles.iter_mut().enumerate() {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    if let Some(index) = assignments[slot] {
                        board.set(index, PartStatus::FatalError);
                    }
                }
            }
        }

        if let Some(cb) = on_progress.as_ref() {
            let (files_done, bytes_done) = board.completed(&sizes);
            cb(&snapshot(
                &slots, &parts, files_done, total, bytes_done, bytes_total,
            ));
        }

        if let Some(index) = fatal {
            let part = &parts[index];
            return Err(AssembleError::PartFailed {
                md5: part.md5,
                attempts: board.attempts(index),
            });
        }

        image.sync()?;

        let expected = table.image_info.md5;
        let actual = image.md5();
        if actual != expected {
            error!(%expected, %actual, "whole-image digest mismatch");
            return Err(AssembleError::ChecksumMismatch { expected, actual });
        }
        info!(md5 = %actual, "image verified");

        Ok(AssembleReport {
            files_total: total,
            files_local,
            files_resumed,
            files_transferred: total - files_resumed,
            bytes_total,
            md5: actual,
        })
    }

    /// Hash the on-disk range of every part and mark matches complete.
    ///
    /// Local-copy parts are skipped: their bytes are not in the file yet.
    fn verify_existing(
        &self,
        image: &ImageFile,
        parts: &[FilePart],
        board: &StatusBoard,
    ) -> Result<usize, AssembleError> {
        info!("verifying partially downloaded image");

        let mut verified = 0;
        for (index, part) in parts.iter().enumerate() {
            if board.get(index) == PartStatus::LocalCopy {
                continue;
            }

            let map = image.map_range_ro(part.offset, part.size)?;
            if Md5::of_bytes(&map[..]) == part.md5 {
                board.set(index, PartStatus::Complete);
                verified += 1;
            }
        }

        info!(verified, total = parts.len(), "resume verification finished");
        Ok(verified)
    }

    /// Service one worker slot: join a finished worker and hand out the
    /// next eligible part.
    #[allow(clippy::too_many_arguments)]
    fn poll_slot(
        &self,
        slot: usize,
        assignments: &mut [Option<usize>],
        handles: &mut [Option<JoinHandle<()>>],
        order: &[usize],
        parts: &Arc<Vec<FilePart>>,
        board: &Arc<StatusBoard>,
        slots: &Arc<Mutex<Vec<SlotInfo>>>,
        image: &Arc<ImageFile>,
        manifest: &Arc<Manifest>,
        fetcher: &Arc<dyn Fetcher>,
    ) -> Result<(), AssembleError> {
        let current = assignments[slot];
        let status = current.map(|index| board.get(index));

        // A worker that exited without recording an outcome (a panic
        // escapes the status protocol entirely).
        let abandoned = matches!(
            status,
            Some(PartStatus::Assigned) | Some(PartStatus::InProgress)
        ) && handles[slot].as_ref().is_some_and(|h| h.is_finished());

        let reclaim = match status {
            None => true,
            Some(PartStatus::Complete) | Some(PartStatus::Error) | Some(PartStatus::FatalError) => {
                true
            }
            _ => abandoned,
        };
        if !reclaim {
            return Ok(());
        }

        if let Some(handle) = handles[slot].take() {
            let joined = handle.join();
            if let Some(index) = current {
                if joined.is_err() {
                    warn!(part = index, "worker thread panicked");
                    board.set(index, PartStatus::FatalError);
                } else if abandoned {
                    warn!(part = index, "worker exited without an outcome");
                    board.set(index, PartStatus::FatalError);
                }
            }
        }
        assignments[slot] = None;

        match board.claim_next(order)? {
            Some(next) => {
                let fetched = Arc::new(AtomicU64::new(0));
                if let Ok(mut guard) = slots.lock() {
                    guard[slot] = SlotInfo {
                        part: Some(next),
                        url: None,
                        fetched: Arc::clone(&fetched),
                    };
                }

                let job = worker::WorkerJob {
                    index: next,
                    part: parts[next],
                    slot,
                    image: Arc::clone(image),
                    manifest: Arc::clone(manifest),
                    board: Arc::clone(board),
                    fetcher: Arc::clone(fetcher),
                    slots: Arc::clone(slots),
                    fetched,
                };

                assignments[slot] = Some(next);
                handles[slot] = Some(thread::spawn(move || worker::run(job)));
            }
            None => {
                if let Ok(mut guard) = slots.lock() {
                    guard[slot] = SlotInfo::idle();
                }
            }
        }

        Ok(())
    }
}

/// Copy out a progress view under the slots lock.
fn snapshot(
    slots: &Mutex<Vec<SlotInfo>>,
    parts: &[FilePart],
    files_done: usize,
    files_total: usize,
    bytes_done: u64,
    bytes_total: u64,
) -> ProgressSnapshot {
    let workers = match slots.lock() {
        Ok(guard) => guard
            .iter()
            .filter(|slot| slot.part.is_some())
            .map(|slot| WorkerProgress {
                url: slot.url.clone(),
                bytes_fetched: slot.fetched.load(Ordering::Relaxed),
                part_size: slot.part.map(|index| parts[index].size).unwrap_or(0),
            })
            .collect(),
        Err(_) => Vec::new(),
    };

    ProgressSnapshot {
        workers,
        files_done,
        files_total,
        bytes_done,
        bytes_total,
    }
}
