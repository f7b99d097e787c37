//! Scrub block and page aggregates.
//!
//! A `ScrubBlock` groups the pages of one checksummed logical block; an
//! extent is cut into blocks of the sector or node size. Blocks and
//! pages are reference counted with `Arc`; a bio holds `(block, page
//! index)` pairs so pages need no back-pointer to their block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::device::BlockDevice;
use crate::fs::{ExtentKind, PAGE_SIZE};

/// Largest checksummed block, in pages (covers the biggest node size).
pub const MAX_PAGES_PER_BLOCK: usize = 16;

/// One page's worth of a block: buffer plus placement metadata.
pub struct ScrubPage {
    pub dev: Arc<dyn BlockDevice>,
    pub kind: ExtentKind,
    pub generation: u64,
    pub logical: u64,
    pub physical: u64,
    pub physical_for_replace: u64,
    pub mirror_num: u8,
    /// On-disk checksum covering this page's sector, when one exists.
    pub csum: Option<u32>,
    io_error: AtomicBool,
    data: Mutex<Box<[u8]>>,
}

impl ScrubPage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dev: Arc<dyn BlockDevice>,
        kind: ExtentKind,
        generation: u64,
        logical: u64,
        physical: u64,
        physical_for_replace: u64,
        mirror_num: u8,
        csum: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(ScrubPage {
            dev,
            kind,
            generation,
            logical,
            physical,
            physical_for_replace,
            mirror_num,
            csum,
            io_error: AtomicBool::new(false),
            data: Mutex::new(vec![0u8; PAGE_SIZE as usize].into_boxed_slice()),
        })
    }

    pub fn io_error(&self) -> bool {
        self.io_error.load(Ordering::SeqCst)
    }

    pub fn set_io_error(&self, err: bool) {
        self.io_error.store(err, Ordering::SeqCst);
    }

    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    pub fn copy_from(&self, other: &ScrubPage) {
        let src = other.data();
        self.data().copy_from_slice(&src);
    }
}

/// Aggregate of 1..=`MAX_PAGES_PER_BLOCK` pages forming one checksummed
/// logical block.
pub struct ScrubBlock {
    pages: Vec<Arc<ScrubPage>>,
    outstanding_pages: AtomicUsize,
    no_io_error_seen: AtomicBool,
    header_error: AtomicBool,
    checksum_error: AtomicBool,
    generation_error: AtomicBool,
}

impl ScrubBlock {
    pub fn new(pages: Vec<Arc<ScrubPage>>) -> Arc<Self> {
        debug_assert!(!pages.is_empty() && pages.len() <= MAX_PAGES_PER_BLOCK);
        let count = pages.len();
        Arc::new(ScrubBlock {
            pages,
            outstanding_pages: AtomicUsize::new(count),
            no_io_error_seen: AtomicBool::new(true),
            header_error: AtomicBool::new(false),
            checksum_error: AtomicBool::new(false),
            generation_error: AtomicBool::new(false),
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, idx: usize) -> &Arc<ScrubPage> {
        &self.pages[idx]
    }

    pub fn pages(&self) -> &[Arc<ScrubPage>] {
        &self.pages
    }

    pub fn len_bytes(&self) -> u64 {
        self.pages.len() as u64 * PAGE_SIZE
    }

    pub fn kind(&self) -> ExtentKind {
        self.pages[0].kind
    }

    pub fn logical(&self) -> u64 {
        self.pages[0].logical
    }

    /// Drop one outstanding page; true when this was the last one.
    pub fn complete_page(&self) -> bool {
        self.outstanding_pages.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn no_io_error_seen(&self) -> bool {
        self.no_io_error_seen.load(Ordering::SeqCst)
    }

    pub fn note_io_error(&self) {
        self.no_io_error_seen.store(false, Ordering::SeqCst);
    }

    pub fn reset_io_state(&self) {
        self.no_io_error_seen.store(true, Ordering::SeqCst);
        self.header_error.store(false, Ordering::SeqCst);
        self.checksum_error.store(false, Ordering::SeqCst);
        self.generation_error.store(false, Ordering::SeqCst);
    }

    pub fn header_error(&self) -> bool {
        self.header_error.load(Ordering::SeqCst)
    }

    pub fn set_header_error(&self) {
        self.header_error.store(true, Ordering::SeqCst);
    }

    pub fn checksum_error(&self) -> bool {
        self.checksum_error.load(Ordering::SeqCst)
    }

    pub fn set_checksum_error(&self) {
        self.checksum_error.store(true, Ordering::SeqCst);
    }

    pub fn generation_error(&self) -> bool {
        self.generation_error.load(Ordering::SeqCst)
    }

    /// Generation mismatch also counts as a header error.
    pub fn set_generation_error(&self) {
        self.generation_error.store(true, Ordering::SeqCst);
        self.header_error.store(true, Ordering::SeqCst);
    }

    /// Free of I/O, header and checksum problems.
    pub fn is_clean(&self) -> bool {
        self.no_io_error_seen() && !self.header_error() && !self.checksum_error()
    }
}

/// A bio's view of one page: the owning block plus the page's index.
#[derive(Clone)]
pub struct BioPage {
    pub block: Arc<ScrubBlock>,
    pub page_idx: usize,
}

impl BioPage {
    pub fn page(&self) -> &Arc<ScrubPage> {
        self.block.page(self.page_idx)
    }
}
