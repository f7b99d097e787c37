//! Adaptive rate control: deadline math and the bio release timer.
//!
//! The controller converts (remaining bytes, remaining time) into a
//! `(bios_in_flight, inter-bio delay)` pair. Completions that must be
//! slowed down are parked on a timer thread and released when their
//! delay expires.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::fs::PAGE_SIZE;
use crate::pool::{MAX_BIOS_PER_SCTX, PAGES_PER_RD_BIO, ScrubBio};

/// Payload bytes of one full read bio.
pub const BIO_BYTES: u64 = PAGES_PER_RD_BIO as u64 * PAGE_SIZE;

/// Pool size used whenever rate control is off or the deadline has
/// already passed.
pub const DEFAULT_BIOS: u16 = 64;

/// Compute the `(bios_per_sctx, delay_secs)` pair that meets the
/// deadline given observed progress.
///
/// Below one bio per second of required throughput, a single bio is
/// kept in flight and held for `delay` seconds after each completion;
/// above it, enough bios run back to back (capped) with a nominal
/// one-second delay.
pub fn adjust_rate(deadline: u64, elapsed: u64, used_bytes: u64, total_scrubbed: u64) -> (u16, u64) {
    if deadline == 0 || elapsed >= deadline {
        return (DEFAULT_BIOS, 0);
    }

    // With nothing left to do, still keep one bio's worth in the math
    // so the division below stays meaningful.
    let rem_bytes = if used_bytes > total_scrubbed {
        used_bytes - total_scrubbed
    } else {
        DEFAULT_BIOS as u64 * BIO_BYTES
    };
    let rem_time = deadline - elapsed;

    let bytes_per_sec = rem_bytes.div_ceil(rem_time);

    if bytes_per_sec < BIO_BYTES {
        (1, BIO_BYTES / bytes_per_sec)
    } else {
        let bios = bytes_per_sec.div_ceil(BIO_BYTES).min(MAX_BIOS_PER_SCTX as u64);
        (bios as u16, 1)
    }
}

/// Delay owed by a bio carrying `page_count` pages: the full-bio delay
/// scaled down for partial payloads.
pub(crate) fn scaled_delay(delay_secs: u64, page_count: usize) -> Duration {
    Duration::from_micros(delay_secs * 1_000_000 * page_count as u64 / PAGES_PER_RD_BIO as u64)
}

struct TimerEntry {
    at: Instant,
    bio: Arc<ScrubBio>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at)
    }
}

struct TimerShared {
    queue: Mutex<BinaryHeap<TimerEntry>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// Timer thread releasing delayed bios on expiry.
pub(crate) struct ReleaseTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReleaseTimer {
    pub(crate) fn new() -> Self {
        ReleaseTimer {
            shared: Arc::new(TimerShared {
                queue: Mutex::new(BinaryHeap::new()),
                cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the timer thread. `on_fire` runs on that thread for every
    /// expired bio, after its wasted-time mark is taken.
    pub(crate) fn spawn(&self, on_fire: impl Fn(Arc<ScrubBio>) + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("scrub-timer".into())
            .spawn(move || {
                loop {
                    let fired = {
                        let mut queue = shared.queue.lock();
                        loop {
                            if shared.shutdown.load(Ordering::SeqCst) {
                                return;
                            }
                            let now = Instant::now();
                            match queue.peek() {
                                None => {
                                    shared.cond.wait(&mut queue);
                                }
                                Some(entry) if entry.at <= now => {
                                    break queue.pop().unwrap().bio;
                                }
                                Some(entry) => {
                                    let at = entry.at;
                                    shared.cond.wait_until(&mut queue, at);
                                }
                            }
                        }
                    };
                    fired.timing.lock().wasted_mark = Some(Instant::now());
                    on_fire(fired);
                }
            })
            .expect("spawn release timer");
        *self.thread.lock() = Some(handle);
    }

    pub(crate) fn schedule(&self, bio: Arc<ScrubBio>, at: Instant) {
        {
            let mut bio_timing = bio.timing.lock();
            bio_timing.wasted_mark = None;
            drop(bio_timing);
            let mut queue = self.shared.queue.lock();
            queue.push(TimerEntry { at, bio });
        }
        self.shared.cond.notify_all();
    }

    /// Stop the thread. Call only once all scheduled bios have fired.
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let _q = self.shared.queue.lock();
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReleaseTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
