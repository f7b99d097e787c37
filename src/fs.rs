//! Boundary against the host filesystem.
//!
//! The scrubber consumes the filesystem through these traits and types:
//! chunk/stripe layout, extent items, checksum runs, the logical-to-
//! physical mapping oracle, inode page resolution for the event pipeline,
//! and the pause/cancel gate shared with the transaction machinery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::device::BlockDevice;
use crate::error::ScrubError;

/// Page-cache page size; the unit of scrub I/O and event granularity.
pub const PAGE_SIZE: u64 = 4096;

/// Fixed upper bound on redundant copies of a logical range.
pub const MAX_MIRRORS: usize = 3;

pub type DeviceId = u32;

/// What an extent (and hence a scrub block) contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    Data,
    TreeBlock,
    Super,
}

/// One item from the extent tree, in logical space.
#[derive(Debug, Clone, Copy)]
pub struct ExtentItem {
    pub logical: u64,
    pub len: u64,
    pub kind: ExtentKind,
    pub generation: u64,
}

/// RAID scheme of a chunk; decides stripe advance and mirror numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidProfile {
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid10,
}

/// Placement of one stripe of a chunk.
#[derive(Debug, Clone, Copy)]
pub struct Stripe {
    pub dev: DeviceId,
    pub physical: u64,
}

/// Chunk layout: how a contiguous logical slice maps onto devices.
#[derive(Debug, Clone)]
pub struct StripeMap {
    pub profile: RaidProfile,
    pub stripe_len: u64,
    pub sub_stripes: usize,
    pub stripes: Vec<Stripe>,
}

impl StripeMap {
    pub fn num_stripes(&self) -> usize {
        self.stripes.len()
    }
}

/// One allocated device extent, from the device tree.
#[derive(Debug, Clone, Copy)]
pub struct DeviceChunk {
    pub dev_offset: u64,
    pub length: u64,
    pub chunk_offset: u64,
}

/// A run of per-sector checksums starting at `bytenr` (logical).
#[derive(Debug, Clone)]
pub struct CsumRun {
    pub bytenr: u64,
    pub sums: Vec<u32>,
}

impl CsumRun {
    pub fn len_bytes(&self) -> u64 {
        self.sums.len() as u64 * PAGE_SIZE
    }
}

/// Mapping request mode for [`ScrubFilesystem::map_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Map to the preferred single copy.
    Read,
    /// Return one location per mirror.
    ReadMirrors,
}

#[derive(Debug, Clone, Copy)]
pub struct MirrorLocation {
    pub dev: DeviceId,
    pub physical: u64,
}

#[derive(Debug, Clone)]
pub struct BlockMapping {
    pub mapped_len: u64,
    pub mirrors: Vec<MirrorLocation>,
}

/// Resolution of an (inode, page index) pair to logical space.
#[derive(Debug, Clone, Copy)]
pub struct PageMapping {
    pub logical: u64,
    /// True if resolving this page had to fault metadata in from disk;
    /// the event pipeline yields to the foreground after such an item.
    pub faulted_from_disk: bool,
}

/// Classification answer for the BitTree inode-check composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Relevant,
    Irrelevant,
}

/// Decides whether an inode is inside a file-mode task's scope.
pub trait RelevanceOracle: Send + Sync {
    fn classify(&self, ino: u64) -> Relevance;
}

/// Everything the scrubber needs from the host filesystem.
pub trait ScrubFilesystem: Send + Sync {
    /// Look up a device by id (for mirror reads and repair writes).
    fn device(&self, dev: DeviceId) -> Option<Arc<dyn BlockDevice>>;

    /// Enumerate allocated device extents of `dev` whose device offsets
    /// intersect `[start, end)`, in device-offset order.
    fn device_chunks(&self, dev: DeviceId, start: u64, end: u64)
    -> Result<Vec<DeviceChunk>, ScrubError>;

    /// Stripe layout of the chunk at `chunk_offset`.
    fn chunk_stripes(&self, chunk_offset: u64) -> Result<StripeMap, ScrubError>;

    /// Extent items intersecting logical `[start, end)`, in logical
    /// order. An item straddling `start` is included.
    fn extents_in_range(&self, start: u64, end: u64) -> Result<Vec<ExtentItem>, ScrubError>;

    /// Checksum runs covering logical `[start, end)`, ordered by bytenr.
    fn lookup_csums(&self, start: u64, end: u64) -> Result<Vec<CsumRun>, ScrubError>;

    /// Map a logical range to physical locations.
    fn map_block(&self, logical: u64, len: u64, mode: MapMode)
    -> Result<BlockMapping, ScrubError>;

    /// Resolve one page of an inode to its logical offset. `None` if the
    /// inode is gone or the page has no mapping.
    fn page_location(&self, ino: u64, page_index: u64)
    -> Result<Option<PageMapping>, ScrubError>;

    /// Hint that the given logical range (and its checksum items) will
    /// be walked shortly. Blocking here is fine; the caller yields the
    /// pause gate around it.
    fn read_ahead(&self, _extent_range: (u64, u64), _csum_range: (u64, u64)) {}

    /// Hand a checksum-less data range back to the filesystem so its
    /// generic read-failure path can rewrite it from a good mirror.
    fn queue_nodatasum_fixup(&self, _logical: u64, _len: u64, _failed_mirror: u8) {}

    /// Nudge the scrubbing thread's I/O priority. `boosted` follows the
    /// rate controller's behind/ahead decision.
    fn set_io_priority(&self, _boosted: bool) {}

    fn fsid(&self) -> [u8; 16];

    fn chunk_tree_uuid(&self) -> [u8; 16];

    /// Generation the superblock copies are expected to carry.
    fn super_generation(&self) -> u64;
}

/// Pause/cancel coordination between the filesystem (transaction commit)
/// and the scrub walker.
///
/// `request_pause`/`resume` nest; the walker parks in `wait_while_paused`
/// after flushing its bios and reports its parking through
/// `enter_paused`/`exit_paused`.
pub struct ScrubGate {
    pause_req: AtomicU32,
    paused: AtomicU32,
    cancel_req: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for ScrubGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrubGate {
    pub fn new() -> Self {
        ScrubGate {
            pause_req: AtomicU32::new(0),
            paused: AtomicU32::new(0),
            cancel_req: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn request_pause(&self) {
        self.pause_req.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let prev = self.pause_req.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        let _g = self.lock.lock();
        self.cond.notify_all();
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_req.load(Ordering::SeqCst) > 0
    }

    pub fn cancel(&self) {
        self.cancel_req.store(true, Ordering::SeqCst);
        let _g = self.lock.lock();
        self.cond.notify_all();
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_req.load(Ordering::SeqCst)
    }

    /// Walker-side: announce that the scrub is parked.
    pub fn enter_paused(&self) {
        self.paused.fetch_add(1, Ordering::SeqCst);
        let _g = self.lock.lock();
        self.cond.notify_all();
    }

    /// Walker-side: announce that the scrub is running again.
    pub fn exit_paused(&self) {
        self.paused.fetch_sub(1, Ordering::SeqCst);
        let _g = self.lock.lock();
        self.cond.notify_all();
    }

    pub fn scrubs_paused(&self) -> u32 {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block until no pause is requested (or a cancel arrives).
    pub fn wait_while_paused(&self) {
        let mut g = self.lock.lock();
        while self.pause_requested() && !self.cancel_requested() {
            self.cond.wait(&mut g);
        }
    }

    /// Like [`ScrubGate::wait_while_paused`], bounded by `timeout`.
    /// Returns true once unpaused (or cancelled).
    pub fn wait_while_paused_for(&self, timeout: Duration) -> bool {
        let mut g = self.lock.lock();
        if !self.pause_requested() || self.cancel_requested() {
            return true;
        }
        self.cond.wait_for(&mut g, timeout);
        !self.pause_requested() || self.cancel_requested()
    }
}
