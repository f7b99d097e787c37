//! Resizable pool of scrub bio descriptors threaded through a free list.
//!
//! Every bio slot is always in exactly one state: on the free list,
//! being filled (`curr`), in flight, or scheduled for removal. The rate
//! controller grows the pool directly and shrinks it lazily by setting
//! `pending_removals`: each subsequent completion then retires its slot
//! instead of recycling it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::block::BioPage;
use crate::device::BlockDevice;

/// Pages per read bio (128 KiB of payload).
pub const PAGES_PER_RD_BIO: usize = 32;

/// Pages per dev-replace write bio.
pub const PAGES_PER_WR_BIO: usize = 32;

/// Hard cap on pool size under the rate controller.
pub const MAX_BIOS_PER_SCTX: usize = 1024;

/// Free-slot wait timeout in adaptive mode, so the filler can observe
/// pause requests promptly.
pub const WAIT_TO: Duration = Duration::from_millis(5);

/// Payload and placement of a bio being assembled.
pub struct BioFill {
    pub dev: Option<Arc<dyn BlockDevice>>,
    pub physical: u64,
    pub logical: u64,
    pub pages: Vec<BioPage>,
}

impl BioFill {
    fn reset(&mut self) {
        self.dev = None;
        self.physical = 0;
        self.logical = 0;
        self.pages.clear();
    }
}

/// Rate-control timestamps of one bio.
pub struct BioTiming {
    /// When the bio was submitted.
    pub t_start: Instant,
    /// Scheduling slop from the previous cycle, credited against the
    /// next delay.
    pub t_wasted: Duration,
    /// Set when the release worker is queued; wrapup turns it into
    /// `t_wasted`.
    pub wasted_mark: Option<Instant>,
}

/// One reusable bio descriptor occupying a pool slot.
pub struct ScrubBio {
    index: AtomicUsize,
    /// Next slot in the free list (`FREE_END` terminates). Only read
    /// or written under the pool lock.
    next_free: AtomicUsize,
    pub fill: Mutex<BioFill>,
    pub timing: Mutex<BioTiming>,
}

const FREE_END: usize = usize::MAX;

impl ScrubBio {
    fn new(index: usize) -> Arc<Self> {
        Arc::new(ScrubBio {
            index: AtomicUsize::new(index),
            next_free: AtomicUsize::new(FREE_END),
            fill: Mutex::new(BioFill {
                dev: None,
                physical: 0,
                logical: 0,
                pages: Vec::with_capacity(PAGES_PER_RD_BIO),
            }),
            timing: Mutex::new(BioTiming {
                t_start: Instant::now(),
                t_wasted: Duration::ZERO,
                wasted_mark: None,
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }
}

struct PoolState {
    bios: Vec<Arc<ScrubBio>>,
    first_free: usize,
    /// Slot currently being filled, or `FREE_END`.
    curr: usize,
    pending_removals: usize,
}

/// The free-listed bio pool.
pub struct BioPool {
    state: Mutex<PoolState>,
    free_wait: Condvar,
    adaptive: bool,
}

impl BioPool {
    pub fn new(initial: usize, adaptive: bool) -> Self {
        assert!(initial > 0);
        let bios: Vec<_> = (0..initial).map(ScrubBio::new).collect();
        for (i, bio) in bios.iter().enumerate() {
            let next = if i + 1 < initial { i + 1 } else { FREE_END };
            bio.next_free.store(next, Ordering::SeqCst);
        }
        BioPool {
            state: Mutex::new(PoolState {
                bios,
                first_free: 0,
                curr: FREE_END,
                pending_removals: 0,
            }),
            free_wait: Condvar::new(),
            adaptive,
        }
    }

    /// Current logical pool size.
    pub fn size(&self) -> usize {
        self.state.lock().bios.len()
    }

    pub fn pending_removals(&self) -> usize {
        self.state.lock().pending_removals
    }

    /// Schedule `n` slots for removal on upcoming completions.
    pub fn set_pending_removals(&self, n: usize) {
        self.state.lock().pending_removals = n;
    }

    /// Return the bio being assembled, acquiring a free slot first if
    /// none is. Blocks while the free list is empty; in adaptive mode
    /// the wait is bounded by [`WAIT_TO`] and `starved` is consulted —
    /// when it returns true (pause pressure) the pool grows by an
    /// emergency slot that is culled again later.
    pub fn current_or_acquire(&self, starved: impl Fn() -> bool) -> Arc<ScrubBio> {
        let mut st = self.state.lock();
        loop {
            if st.curr != FREE_END {
                return Arc::clone(&st.bios[st.curr]);
            }
            if st.first_free != FREE_END {
                let idx = st.first_free;
                let bio = Arc::clone(&st.bios[idx]);
                st.first_free = bio.next_free.load(Ordering::SeqCst);
                bio.next_free.store(FREE_END, Ordering::SeqCst);
                bio.fill.lock().reset();
                st.curr = idx;
                return bio;
            }
            if self.adaptive {
                if starved() && st.bios.len() < MAX_BIOS_PER_SCTX {
                    let new_size = st.bios.len() + 1;
                    Self::grow_locked(&mut st, new_size);
                    st.pending_removals += 1;
                    continue;
                }
                self.free_wait.wait_for(&mut st, WAIT_TO);
            } else {
                self.free_wait.wait(&mut st);
            }
        }
    }

    /// Detach the bio being assembled for submission. `None` when no
    /// bio is under assembly.
    pub fn take_current(&self) -> Option<Arc<ScrubBio>> {
        let mut st = self.state.lock();
        if st.curr == FREE_END {
            return None;
        }
        let bio = Arc::clone(&st.bios[st.curr]);
        st.curr = FREE_END;
        Some(bio)
    }

    /// Return a completed bio to the pool, or retire its slot when
    /// removals are pending.
    pub fn release(&self, bio: &Arc<ScrubBio>) {
        let mut st = self.state.lock();
        let idx = bio.index();
        if st.pending_removals > 0 {
            Self::remove_locked(&mut st, idx);
        } else {
            bio.next_free.store(st.first_free, Ordering::SeqCst);
            st.first_free = idx;
        }
        self.free_wait.notify_all();
    }

    /// Grow the pool to `new_size` slots (no-op if not larger). The new
    /// slots become the free-list prefix.
    pub fn grow(&self, new_size: usize) {
        let mut st = self.state.lock();
        Self::grow_locked(&mut st, new_size);
        self.free_wait.notify_all();
    }

    fn grow_locked(st: &mut PoolState, new_size: usize) {
        let old_size = st.bios.len();
        if new_size <= old_size {
            return;
        }
        for i in old_size..new_size {
            let bio = ScrubBio::new(i);
            let next = if i + 1 < new_size { i + 1 } else { st.first_free };
            bio.next_free.store(next, Ordering::SeqCst);
            st.bios.push(bio);
        }
        st.first_free = old_size;
    }

    /// Retire slot `idx`: move the last slot into its place and patch
    /// the stale index wherever it appears (free list or `curr`). The
    /// retired bio itself is neither free nor in flight.
    fn remove_locked(st: &mut PoolState, idx: usize) {
        debug_assert!(st.pending_removals > 0);
        debug_assert!(idx < st.bios.len());

        let last = st.bios.len() - 1;
        if idx == last {
            st.bios.pop();
        } else {
            let moved = st.bios.pop().unwrap();
            moved.index.store(idx, Ordering::SeqCst);
            st.bios[idx] = moved;

            if st.first_free == last {
                st.first_free = idx;
            } else {
                let mut cur = st.first_free;
                while cur != FREE_END {
                    let next = st.bios[cur].next_free.load(Ordering::SeqCst);
                    if next == last {
                        st.bios[cur].next_free.store(idx, Ordering::SeqCst);
                        break;
                    }
                    cur = next;
                }
            }
            if st.curr == last {
                st.curr = idx;
            }
        }
        st.pending_removals -= 1;
    }

    /// Wait until the free list is non-empty, up to `timeout`. Returns
    /// true when a slot is available.
    pub(crate) fn wait_free_for(&self, timeout: Duration) -> bool {
        let mut st = self.state.lock();
        if st.first_free != FREE_END {
            return true;
        }
        self.free_wait.wait_for(&mut st, timeout);
        st.first_free != FREE_END
    }

    /// Walk the free list from the head; `None` means a cycle or a
    /// dangling link was found.
    pub fn free_list_len(&self) -> Option<usize> {
        let st = self.state.lock();
        Self::free_len_locked(&st)
    }

    fn free_len_locked(st: &MutexGuard<'_, PoolState>) -> Option<usize> {
        let mut count = 0usize;
        let mut cur = st.first_free;
        while cur != FREE_END {
            if cur >= st.bios.len() || count > st.bios.len() {
                return None;
            }
            count += 1;
            cur = st.bios[cur].next_free.load(Ordering::SeqCst);
        }
        Some(count)
    }
}
