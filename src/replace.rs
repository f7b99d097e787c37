//! Device-replace write path.
//!
//! While a replace is running, every verified (or repaired) block is
//! also written to the target device at its replace-relative physical
//! offset. Pages are batched into write bios; a page that could not be
//! read from any mirror is written as zeroes so the target never holds
//! uninitialized data.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::warn;
use parking_lot::Mutex;

use crate::block::ScrubBlock;
use crate::device::BlockDevice;
use crate::fs::PAGE_SIZE;
use crate::pool::PAGES_PER_WR_BIO;

struct WriteBatch {
    physical: u64,
    data: Vec<u8>,
}

impl WriteBatch {
    fn page_count(&self) -> usize {
        self.data.len() / PAGE_SIZE as usize
    }

    fn end(&self) -> u64 {
        self.physical + self.data.len() as u64
    }
}

/// Write context toward the replace target device.
pub struct ReplaceCtx {
    target: Arc<dyn BlockDevice>,
    curr: Mutex<Option<WriteBatch>>,
    flush_all_writes: AtomicBool,
    /// The scrub's write-error counter, shared with the repair path.
    write_errors: Arc<AtomicU64>,
}

impl ReplaceCtx {
    pub fn new(target: Arc<dyn BlockDevice>, write_errors: Arc<AtomicU64>) -> Self {
        ReplaceCtx {
            target,
            curr: Mutex::new(None),
            flush_all_writes: AtomicBool::new(false),
            write_errors,
        }
    }

    pub fn target(&self) -> &Arc<dyn BlockDevice> {
        &self.target
    }

    pub fn num_write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn set_flush_all_writes(&self, flush: bool) {
        self.flush_all_writes.store(flush, Ordering::SeqCst);
    }

    pub(crate) fn flush_all_writes(&self) -> bool {
        self.flush_all_writes.load(Ordering::SeqCst)
    }

    /// Queue every page of `block` for the target device.
    pub(crate) fn write_block(&self, block: &ScrubBlock) {
        for page_idx in 0..block.page_count() {
            self.write_page(block, page_idx);
        }
    }

    /// Queue one page. A page with an I/O error is zero-filled first.
    pub(crate) fn write_page(&self, block: &ScrubBlock, page_idx: usize) {
        let page = block.page(page_idx);
        let physical = page.physical_for_replace;

        let mut curr = self.curr.lock();
        if let Some(batch) = curr.as_ref()
            && (batch.end() != physical || batch.page_count() >= PAGES_PER_WR_BIO)
        {
            let full = curr.take().unwrap();
            self.submit(full);
        }

        let batch = curr.get_or_insert_with(|| WriteBatch {
            physical,
            data: Vec::with_capacity(PAGES_PER_WR_BIO * PAGE_SIZE as usize),
        });
        if page.io_error() {
            batch.data.extend(std::iter::repeat_n(0u8, PAGE_SIZE as usize));
        } else {
            batch.data.extend_from_slice(&page.data());
        }
    }

    /// Push out the write bio under assembly.
    pub(crate) fn flush(&self) {
        let batch = self.curr.lock().take();
        if let Some(batch) = batch {
            self.submit(batch);
        }
    }

    fn submit(&self, batch: WriteBatch) {
        if let Err(err) = self.target.write_at(batch.physical, &batch.data) {
            self.write_errors
                .fetch_add(batch.page_count() as u64, Ordering::Relaxed);
            warn!(
                "dev-replace: write of {} pages at {} failed: {err}",
                batch.page_count(),
                batch.physical
            );
        }
    }
}
