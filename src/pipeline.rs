//! Scrubber-side event pipeline.
//!
//! Between stripe iterations (and while parked on a pause) the scrubber
//! drains pending page events, translates each (inode, page index) pair
//! to a device-absolute physical range, and marks or unmarks it in the
//! task's BitTree. A page the read path just checksummed can be skipped;
//! a dirtied page is about to move, so any earlier skip mark is revoked.

use crate::context::ScrubContext;
use crate::events::EventMask;
use crate::fs::{MapMode, PAGE_SIZE};

/// Items drained per call before yielding back to the walker.
pub(crate) const EVENT_BATCH: usize = 256;

/// Drain up to [`EVENT_BATCH`] events.
///
/// Returns false when the queue ran dry (the walker may queue a bio
/// immediately); true when events remain or resolving one touched the
/// disk, in which case the walker processes one stripe and checks again
/// so the foreground workload gets a chance.
pub(crate) fn process_events(ctx: &ScrubContext) -> bool {
    let Some(task) = ctx.task.as_ref() else {
        return false;
    };

    let dstart = ctx.dstart();
    let mut budget = EVENT_BATCH;
    let mut stop = false;

    while budget > 0 {
        let items = task.fetch(1);
        let Some(item) = items.first() else {
            // Out of items.
            return false;
        };

        match ctx.fs.page_location(item.ino, item.page_index) {
            Ok(Some(location)) => {
                if location.faulted_from_disk {
                    // We hit the disk resolving this inode; finish the
                    // item, then give the foreground a chance.
                    stop = true;
                }

                if let Ok(mapping) = ctx.fs.map_block(location.logical, PAGE_SIZE, MapMode::Read)
                    && mapping.mapped_len >= PAGE_SIZE
                    && let Some(first) = mapping.mirrors.first()
                {
                    if first.dev == ctx.dev.id() {
                        let offset = dstart + first.physical;
                        let result = if item.mask.contains(EventMask::MODIFIED) {
                            task.unmark(offset, PAGE_SIZE)
                        } else if item.mask.contains(EventMask::ADDED) {
                            task.mark(offset, PAGE_SIZE)
                        } else {
                            Ok(())
                        };
                        if let Err(err) = result {
                            log::warn!(
                                "events: failed to update [{}, {}): {err}",
                                offset,
                                offset + PAGE_SIZE
                            );
                        }
                    }
                }
            }
            // No mapping yet (or the inode is gone): the event cannot
            // help us skip anything, drop it.
            Ok(None) => {}
            Err(_) => {}
        }

        budget -= 1;
        if stop {
            break;
        }
    }

    // Budget exhausted (there may be more) or we touched the disk.
    true
}
