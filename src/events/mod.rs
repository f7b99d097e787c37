//! Foreground page-event ingestion.
//!
//! The page cache calls [`EventRegistry::emit`] whenever it adds or
//! dirties a page. The hook validates cheaply, then hands a small record
//! to a shared worker pool which fans it out to every subscribed task's
//! item store. The emit path never blocks: a full queue drops the event,
//! which only costs the scrubber a skip opportunity.

pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;

use crossbeam::channel::{self, Sender, TrySendError};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::bittree::{BitOp, BitTree};
use crate::error::ScrubError;

pub use self::store::{EventItem, EventMask, ItemStore};

/// Capacity of the hook-to-worker queue; beyond it events are dropped.
const EVENT_QUEUE_DEPTH: usize = 4096;

/// A raw page event as seen by the hook.
#[derive(Debug, Clone, Copy)]
pub struct PageEvent {
    /// Identity of the filesystem the page belongs to.
    pub fs_id: u64,
    pub ino: u64,
    pub page_index: u64,
    pub mask: EventMask,
    /// True when the page belongs to a regular-file (or directory)
    /// mapping; anything else is ignored.
    pub regular_mapping: bool,
}

enum WorkItem {
    Event(PageEvent),
    Stop,
}

/// One subscriber: a progress BitTree plus a pending-event store.
pub struct ScrubTask {
    id: u32,
    name: String,
    /// Restrict events to this filesystem; `None` accepts all.
    fs_id: Option<u64>,
    evtmask: EventMask,
    bittree: BitTree,
    store: ItemStore,
}

impl ScrubTask {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bittree(&self) -> &BitTree {
        &self.bittree
    }

    /// Drain up to `n` pending events in key order.
    pub fn fetch(&self, n: usize) -> Vec<EventItem> {
        self.store.fetch(n)
    }

    pub fn pending_events(&self) -> usize {
        self.store.len()
    }

    /// Mark `[offset, offset + len)` as done (skippable).
    pub fn mark(&self, offset: u64, len: u64) -> Result<(), ScrubError> {
        self.bittree.set_done(offset, len)
    }

    /// Clear the done bits over `[offset, offset + len)`.
    pub fn unmark(&self, offset: u64, len: u64) -> Result<(), ScrubError> {
        self.bittree.unset_done(offset, len)
    }

    /// True iff the whole range is marked done.
    pub fn check(&self, offset: u64, len: u64) -> Result<bool, ScrubError> {
        self.bittree.check(offset, len, &[BitOp::SetDone])
    }
}

/// Shared hook endpoint and task registry.
///
/// Replaces an ambient global task list: constructors receive the
/// registry handle explicitly, and event fan-out iterates a snapshot of
/// the task vector taken under a read lock.
pub struct EventRegistry {
    online: AtomicBool,
    tasks: RwLock<Vec<Arc<ScrubTask>>>,
    tx: Sender<WorkItem>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    num_workers: usize,
    next_id: AtomicU32,
    dropped: AtomicU64,
}

impl EventRegistry {
    /// Spawn the worker pool and return the shared registry handle.
    pub fn new(num_workers: usize) -> Arc<Self> {
        assert!(num_workers > 0);
        let (tx, rx) = channel::bounded::<WorkItem>(EVENT_QUEUE_DEPTH);

        let registry = Arc::new(EventRegistry {
            online: AtomicBool::new(true),
            tasks: RwLock::new(Vec::new()),
            tx,
            workers: Mutex::new(Vec::new()),
            num_workers,
            next_id: AtomicU32::new(1),
            dropped: AtomicU64::new(0),
        });

        let mut workers = registry.workers.lock();
        for n in 0..num_workers {
            let rx = rx.clone();
            // Weak: the pool must not keep the registry alive, or drop
            // (which joins the pool) would never run.
            let reg = Arc::downgrade(&registry);
            let handle = thread::Builder::new()
                .name(format!("scrub-evt{n}"))
                .spawn(move || {
                    while let Ok(item) = rx.recv() {
                        match item {
                            WorkItem::Event(ev) => match reg.upgrade() {
                                Some(reg) => reg.handle_event(ev),
                                None => break,
                            },
                            WorkItem::Stop => break,
                        }
                    }
                })
                .expect("spawn event worker");
            workers.push(handle);
        }
        drop(workers);

        registry
    }

    /// Register a new task. `range` is the BitTree granularity (bytes
    /// per bit in block mode, 1 in file mode).
    pub fn register(
        &self,
        name: &str,
        fs_id: Option<u64>,
        range: u64,
        is_file: bool,
        evtmask: EventMask,
    ) -> Arc<ScrubTask> {
        let task = Arc::new(ScrubTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            fs_id,
            evtmask,
            bittree: BitTree::new(range, is_file),
            store: ItemStore::new(),
        });
        info!("events: registered task #{} ({})", task.id, task.name);
        self.tasks.write().push(Arc::clone(&task));
        task
    }

    pub fn deregister(&self, id: u32) {
        let mut tasks = self.tasks.write();
        if let Some(pos) = tasks.iter().position(|t| t.id == id) {
            let task = tasks.remove(pos);
            info!("events: deregistered task #{} ({})", task.id, task.name);
        }
    }

    pub fn find_task(&self, id: u32) -> Option<Arc<ScrubTask>> {
        self.tasks.read().iter().find(|t| t.id == id).cloned()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Events dropped because the queue was full.
    pub fn events_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Hook entry point. Strictly non-blocking; invalid or unqueueable
    /// events are dropped silently.
    pub fn emit(&self, ev: PageEvent) {
        if !self.is_online() || ev.ino == 0 || !ev.regular_mapping || ev.mask.is_empty() {
            return;
        }
        match self.tx.try_send(WorkItem::Event(ev)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("events: queue full, dropped event for ino {}", ev.ino);
            }
        }
    }

    fn handle_event(&self, ev: PageEvent) {
        // Snapshot the task list so fan-out never holds the lock across
        // store insertion.
        let tasks: Vec<Arc<ScrubTask>> = self.tasks.read().clone();
        for task in tasks {
            if let Some(fs_id) = task.fs_id
                && fs_id != ev.fs_id
            {
                continue;
            }
            let masked = ev.mask.intersect(task.evtmask);
            if masked.is_empty() {
                continue;
            }
            task.store.insert_or_merge(ev.ino, ev.page_index, masked);
        }
    }

    /// Stop accepting events and join the worker pool. Idempotent.
    pub fn shutdown(&self) {
        if !self.online.swap(false, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.num_workers {
            let _ = self.tx.send(WorkItem::Stop);
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for EventRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
