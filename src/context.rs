//! The per-scrub context: pool, counters, statistics, collaborators.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::device::BlockDevice;
use crate::events::{EventRegistry, ScrubTask};
use crate::fs::{CsumRun, PAGE_SIZE, ScrubFilesystem, ScrubGate};
use crate::pool::{BioPool, ScrubBio};
use crate::rate::ReleaseTimer;
use crate::replace::ReplaceCtx;

/// Counters reported back through the progress interface.
#[derive(Debug, Clone, Default)]
pub struct ScrubProgress {
    pub data_extents_scrubbed: u64,
    pub data_bytes_scrubbed: u64,
    pub tree_extents_scrubbed: u64,
    pub tree_bytes_scrubbed: u64,
    /// Bytes actually read and checksummed (skipped ranges excluded).
    pub data_bytes_verified: u64,
    pub tree_bytes_verified: u64,
    pub no_csum: u64,
    pub csum_errors: u64,
    pub super_errors: u64,
    pub read_errors: u64,
    pub verify_errors: u64,
    pub corrected_errors: u64,
    pub uncorrectable_errors: u64,
    pub unverified_errors: u64,
    /// Mismatches that disappeared once the stored checksum was
    /// refreshed (the held copy was stale).
    pub sync_errors: u64,
    pub csum_discards: u64,
    pub malloc_errors: u64,
    pub last_physical: u64,
}

/// Counter with blocking waits on zero, used for in-flight bios and
/// pending workers.
pub(crate) struct FlightCounter {
    count: Mutex<usize>,
    cond: Condvar,
}

impl FlightCounter {
    pub(crate) fn new() -> Self {
        FlightCounter {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn inc(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn dec(&self) {
        let mut c = self.count.lock();
        debug_assert!(*c > 0);
        *c -= 1;
        if *c == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn get(&self) -> usize {
        *self.count.lock()
    }

    pub(crate) fn wait_zero(&self) {
        let mut c = self.count.lock();
        while *c > 0 {
            self.cond.wait(&mut c);
        }
    }
}

/// A read job handed to the I/O worker pool: the bio to service.
pub(crate) type IoJob = Arc<ScrubBio>;

/// The single per-in-flight-scrub object.
pub struct ScrubContext {
    pub(crate) fs: Arc<dyn ScrubFilesystem>,
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) gate: Arc<ScrubGate>,
    pub(crate) pool: BioPool,

    /// Submission side of the I/O worker pool; dropped at teardown so
    /// the workers drain out.
    pub(crate) io_tx: Mutex<Option<Sender<IoJob>>>,
    pub(crate) timer: ReleaseTimer,

    pub(crate) bios_in_flight: FlightCounter,
    /// Bios out of the pool in any form, including ones parked on the
    /// release timer.
    pub(crate) bios_allocated: FlightCounter,
    pub(crate) workers_pending: FlightCounter,
    pub(crate) cancel_req: AtomicBool,

    pub(crate) readonly: bool,
    pub(crate) is_dev_replace: bool,

    /// Wall-clock budget in seconds; 0 disables rate control.
    pub(crate) deadline: u64,
    pub(crate) used_bytes: u64,
    pub(crate) t_start: Instant,
    /// Seconds each bio is held after completion.
    pub(crate) delay: AtomicU64,
    pub(crate) boost: bool,
    pub(crate) boosted: AtomicBool,

    pub(crate) csum_list: Mutex<VecDeque<CsumRun>>,
    pub(crate) stats: Mutex<ScrubProgress>,
    /// Failed repair writes, shared with the replace write path.
    pub(crate) num_write_errors: Arc<AtomicU64>,

    pub(crate) replace: Option<ReplaceCtx>,
    pub(crate) registry: Option<Arc<EventRegistry>>,
    pub(crate) task: Option<Arc<ScrubTask>>,
}

impl ScrubContext {
    /// Device-absolute offset of byte 0 of the scrub device, for event
    /// system keys.
    pub(crate) fn dstart(&self) -> u64 {
        self.dev.start_sector() << 9
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel_req.load(Ordering::SeqCst) || self.gate.cancel_requested()
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_req.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> ScrubProgress {
        self.stats.lock().clone()
    }

    pub(crate) fn note_write_error(&self) {
        self.num_write_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Repair writes that failed, on any path.
    pub fn num_write_errors(&self) -> u64 {
        self.num_write_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn with_stats<R>(&self, f: impl FnOnce(&mut ScrubProgress) -> R) -> R {
        f(&mut self.stats.lock())
    }

    /// Pop the stored checksum covering `logical`, discarding runs that
    /// end before it.
    pub(crate) fn find_csum(&self, logical: u64) -> Option<u32> {
        let mut list = self.csum_list.lock();
        loop {
            let run = list.front()?;
            if run.bytenr > logical {
                return None;
            }
            if run.bytenr + run.len_bytes() > logical {
                break;
            }
            list.pop_front();
            self.with_stats(|s| s.csum_discards += 1);
        }

        let run = list.front().unwrap();
        let index = ((logical - run.bytenr) / PAGE_SIZE) as usize;
        let csum = run.sums[index];
        if index == run.sums.len() - 1 {
            list.pop_front();
        }
        Some(csum)
    }

    pub(crate) fn free_csums(&self) {
        self.csum_list.lock().clear();
    }

    /// Hand a filled bio to the I/O workers.
    pub(crate) fn dispatch(&self, bio: Arc<ScrubBio>) {
        self.bios_in_flight.inc();
        self.bios_allocated.inc();
        let tx = self.io_tx.lock();
        if let Some(tx) = tx.as_ref() {
            bio.timing.lock().t_start = Instant::now();
            let _ = tx.send(bio);
        } else {
            // Teardown already dropped the workers; account the bio
            // back so waiters do not hang.
            drop(tx);
            self.bios_in_flight.dec();
            self.bios_allocated.dec();
        }
    }
}
