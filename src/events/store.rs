//! Per-task store of pending page events.
//!
//! At most one entry exists per (inode, page index); a later event for
//! the same page OR-merges its mask into the stored state. The scrubber
//! drains entries in key order.

use std::collections::BTreeMap;
use std::ops::BitOr;

use parking_lot::Mutex;

/// OR-able summary of the page events observed between two fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(pub u8);

impl EventMask {
    /// Page entered the page cache (read path checksummed it).
    pub const ADDED: EventMask = EventMask(0x1);
    /// Page was dirtied; its on-disk location is about to change.
    pub const MODIFIED: EventMask = EventMask(0x2);
    pub const REMOVED: EventMask = EventMask(0x4);
    pub const FLUSHED: EventMask = EventMask(0x8);

    pub const ALL: EventMask = EventMask(0x0f);

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersect(self, other: EventMask) -> EventMask {
        EventMask(self.0 & other.0)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// One drained event summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventItem {
    pub ino: u64,
    pub page_index: u64,
    pub mask: EventMask,
}

/// Ordered, mutex-protected container keyed by (inode, page index).
#[derive(Default)]
pub struct ItemStore {
    items: Mutex<BTreeMap<(u64, u64), EventMask>>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry or OR-merge into an existing one.
    pub fn insert_or_merge(&self, ino: u64, page_index: u64, mask: EventMask) {
        let mut items = self.items.lock();
        let entry = items.entry((ino, page_index)).or_default();
        *entry = *entry | mask;
    }

    /// Remove and return up to `n` entries in key order.
    pub fn fetch(&self, n: usize) -> Vec<EventItem> {
        let mut items = self.items.lock();
        let mut out = Vec::with_capacity(n.min(items.len()));
        while out.len() < n {
            let Some((&key, _)) = items.first_key_value() else {
                break;
            };
            let mask = items.remove(&key).unwrap();
            out.push(EventItem {
                ino: key.0,
                page_index: key.1,
                mask,
            });
        }
        out
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
