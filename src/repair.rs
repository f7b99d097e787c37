//! Block completion, mirror recheck and repair.
//!
//! When a block finishes with an I/O error or a failed verify, every
//! mirror of its logical range is re-read page by page. A mirror that is
//! completely clean rewrites the whole bad copy; otherwise pages are
//! repaired individually from whichever mirror could read them, and the
//! block is re-verified afterwards to decide between the corrected and
//! uncorrectable counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;

use crate::block::{ScrubBlock, ScrubPage};
use crate::checksum::{scrub_checksum, verify_quiet};
use crate::context::ScrubContext;
use crate::error::ScrubError;
use crate::fs::{ExtentKind, MAX_MIRRORS, MapMode, PAGE_SIZE};

/// Uncorrectable-error logs are throttled to this many per window.
const WARN_BURST: u32 = 10;
const WARN_WINDOW: Duration = Duration::from_secs(5);

struct WarnState {
    window_start: Option<Instant>,
    emitted: u32,
}

static WARN_LIMIT: Mutex<WarnState> = Mutex::new(WarnState {
    window_start: None,
    emitted: 0,
});

fn warn_limited(msg: &str, logical: u64, dev: u32) {
    let mut st = WARN_LIMIT.lock();
    let now = Instant::now();
    match st.window_start {
        Some(start) if now.duration_since(start) < WARN_WINDOW => {
            if st.emitted >= WARN_BURST {
                return;
            }
        }
        _ => {
            st.window_start = Some(now);
            st.emitted = 0;
        }
    }
    st.emitted += 1;
    warn!("scrub: {msg} at logical {logical} on dev {dev}");
}

/// Runs when the last outstanding page of a block completes.
pub(crate) fn scrub_block_complete(ctx: &ScrubContext, block: &Arc<ScrubBlock>) {
    if !block.no_io_error_seen() {
        handle_errored_block(ctx, block);
    } else if scrub_checksum(ctx, block) {
        handle_errored_block(ctx, block);
    } else if ctx.is_dev_replace
        && let Some(replace) = ctx.replace.as_ref()
    {
        // Verified clean; mirror it onto the replace target.
        replace.write_block(block);
    }
}

/// The error handler: repair the block from the contents of a mirror.
fn handle_errored_block(ctx: &ScrubContext, block_to_check: &Arc<ScrubBlock>) {
    debug_assert!(block_to_check.page_count() >= 1);

    // Superblock damage is only reported; the next commit rewrites the
    // copies anyway.
    if block_to_check.kind() == ExtentKind::Super {
        ctx.with_stats(|s| s.super_errors += 1);
        return;
    }

    let logical = block_to_check.logical();
    let length = block_to_check.len_bytes();
    let page0 = block_to_check.page(0);
    let dev_id = page0.dev.id();
    let is_metadata = page0.kind != ExtentKind::Data;
    let have_csum = page0.csum.is_some();
    debug_assert!(page0.mirror_num >= 1);
    let failed_mirror_index = (page0.mirror_num - 1) as usize;

    if ctx.is_dev_replace && !is_metadata && !have_csum {
        // The data may not be COWed and can change under us; hand the
        // range to the filesystem's generic read-failure path instead of
        // copying a moving target.
        ctx.fs
            .queue_nodatasum_fixup(logical, length, page0.mirror_num);
        return;
    }

    // Re-read the failed range once per mirror, page by page, so pages
    // with I/O errors can be told apart from good ones on every copy.
    let recheck_blocks = match setup_recheck_blocks(ctx, block_to_check) {
        Ok(blocks) => blocks,
        Err(_) => {
            ctx.with_stats(|s| {
                s.read_errors += 1;
                s.uncorrectable_errors += 1;
            });
            warn_limited("unable to map mirrors", logical, dev_id);
            return;
        }
    };

    let Some(Some(block_bad)) = recheck_blocks.get(failed_mirror_index).cloned() else {
        ctx.with_stats(|s| {
            s.read_errors += 1;
            s.uncorrectable_errors += 1;
        });
        return;
    };

    recheck_block(ctx, &block_bad);

    if block_bad.is_clean() {
        // The error went away on the page-by-page re-read: a huge-bio
        // artifact or a transient failure elsewhere in the merged
        // request.
        ctx.with_stats(|s| s.unverified_errors += 1);
        if let Some(replace) = ctx.replace.as_ref() {
            replace.write_block(&block_bad);
        }
        return;
    }

    if !block_bad.no_io_error_seen() {
        ctx.with_stats(|s| s.read_errors += 1);
        warn_limited("i/o error", logical, dev_id);
    } else if block_bad.checksum_error() {
        ctx.with_stats(|s| s.csum_errors += 1);
        warn_limited("checksum error", logical, dev_id);
    } else if block_bad.header_error() {
        ctx.with_stats(|s| s.verify_errors += 1);
        warn_limited("checksum/header error", logical, dev_id);
    }

    if ctx.readonly {
        debug_assert!(!ctx.is_dev_replace);
        return;
    }

    if !is_metadata && !have_csum {
        // Checksum-less data might not be COWed and can be modified
        // concurrently; the commit-root strategy gives no stable copy to
        // repair from. Queue the generic read-failure path instead.
        ctx.fs
            .queue_nodatasum_fixup(logical, length, page0.mirror_num);
        return;
    }

    // Prefer a mirror that is completely intact: it rewrites the whole
    // bad copy in one go.
    for (mirror_index, other) in recheck_blocks.iter().enumerate() {
        if mirror_index == failed_mirror_index {
            continue;
        }
        let Some(block_other) = other else { continue };

        recheck_block(ctx, block_other);

        if block_other.is_clean() {
            let repaired = if let Some(replace) = ctx.replace.as_ref() {
                replace.write_block(block_other);
                true
            } else {
                let force_write = is_metadata || have_csum;
                repair_block_from_good_copy(ctx, &block_bad, block_other, force_write).is_ok()
            };
            if repaired {
                ctx.with_stats(|s| s.corrected_errors += 1);
                info!("scrub: fixed up error at logical {logical} on dev {dev_id}");
                return;
            }
        }
    }

    // Dev-replace: assemble the target copy page by page from whatever
    // mirrors could read each page; unreadable pages go out zero-filled.
    if let Some(replace) = ctx.replace.as_ref() {
        for page_num in 0..block_bad.page_count() {
            let from_mirror = recheck_blocks
                .iter()
                .flatten()
                .find(|b| !b.page(page_num).io_error());
            match from_mirror {
                Some(block_other) => replace.write_page(block_other, page_num),
                None => replace.write_page(&block_bad, page_num),
            }
        }
        return;
    }

    // Only I/O errors can be repaired page by page: a checksum failure
    // gives no hint which copy of a readable page is the good one.
    if block_bad.no_io_error_seen() {
        ctx.with_stats(|s| s.uncorrectable_errors += 1);
        warn_limited("unable to fixup (regular) error", logical, dev_id);
        return;
    }

    let mut success = true;
    for page_num in 0..block_bad.page_count() {
        let page_bad = block_bad.page(page_num);
        if !page_bad.io_error() {
            continue;
        }

        let mut fixed = false;
        for (mirror_index, other) in recheck_blocks.iter().enumerate() {
            if mirror_index == failed_mirror_index {
                continue;
            }
            let Some(block_other) = other else { continue };
            if block_other.page(page_num).io_error() {
                continue;
            }
            if repair_page_from_good_copy(ctx, &block_bad, block_other, page_num, false).is_ok() {
                page_bad.set_io_error(false);
                fixed = true;
                break;
            }
        }
        if !fixed {
            success = false;
        }
    }

    if success {
        // All sectors are repaired on disk; re-read and re-verify so the
        // final report reflects whether errors remain.
        recheck_block(ctx, &block_bad);
        if block_bad.is_clean() {
            ctx.with_stats(|s| s.corrected_errors += 1);
            info!("scrub: fixed up error at logical {logical} on dev {dev_id}");
            return;
        }
    }

    ctx.with_stats(|s| s.uncorrectable_errors += 1);
    warn_limited("unable to fixup (regular) error", logical, dev_id);
}

/// Build one candidate block per mirror of the failed range. A mirror
/// whose device is gone gets a `None` slot so mirror numbering stays
/// aligned.
fn setup_recheck_blocks(
    ctx: &ScrubContext,
    original: &ScrubBlock,
) -> Result<Vec<Option<Arc<ScrubBlock>>>, ScrubError> {
    let mut per_mirror_pages: Vec<Option<Vec<Arc<ScrubPage>>>> = Vec::new();

    for (page_index, orig_page) in original.pages().iter().enumerate() {
        let logical = original.logical() + page_index as u64 * PAGE_SIZE;

        // With a length of one page, each returned location is one
        // mirror.
        let mapping = ctx.fs.map_block(logical, PAGE_SIZE, MapMode::ReadMirrors)?;
        if mapping.mapped_len < PAGE_SIZE || mapping.mirrors.is_empty() {
            return Err(ScrubError::Map("mirror mapping too short"));
        }

        if per_mirror_pages.is_empty() {
            per_mirror_pages.resize(mapping.mirrors.len().min(MAX_MIRRORS), Some(Vec::new()));
        }

        for (mirror_index, location) in mapping.mirrors.iter().enumerate() {
            if mirror_index >= per_mirror_pages.len() {
                continue;
            }
            let Some(pages) = per_mirror_pages[mirror_index].as_mut() else {
                continue;
            };
            match ctx.fs.device(location.dev) {
                Some(dev) => {
                    pages.push(ScrubPage::new(
                        dev,
                        orig_page.kind,
                        orig_page.generation,
                        logical,
                        location.physical,
                        orig_page.physical_for_replace,
                        (mirror_index + 1) as u8,
                        orig_page.csum,
                    ));
                }
                None => {
                    per_mirror_pages[mirror_index] = None;
                }
            }
        }
    }

    // A mirror that could not be mapped for every page is unusable.
    let expected = original.page_count();
    Ok(per_mirror_pages
        .into_iter()
        .map(|pages| pages.filter(|p| p.len() == expected).map(ScrubBlock::new))
        .collect())
}

/// Synchronously read every page of `block` and re-derive its error
/// state.
fn recheck_block(ctx: &ScrubContext, block: &Arc<ScrubBlock>) {
    block.reset_io_state();

    for page in block.pages() {
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        match page.dev.read_at(page.physical, &mut buf) {
            Ok(()) => {
                page.set_io_error(false);
                page.data().copy_from_slice(&buf);
            }
            Err(_) => {
                page.set_io_error(true);
                block.note_io_error();
            }
        }
    }

    if block.no_io_error_seen() {
        verify_quiet(ctx, block);
    }
}

/// Rewrite every page of the bad copy from a fully-good mirror.
fn repair_block_from_good_copy(
    ctx: &ScrubContext,
    block_bad: &ScrubBlock,
    block_good: &ScrubBlock,
    force_write: bool,
) -> Result<(), ScrubError> {
    debug_assert_eq!(block_bad.page_count(), block_good.page_count());
    for page_num in 0..block_bad.page_count() {
        repair_page_from_good_copy(ctx, block_bad, block_good, page_num, force_write)?;
    }
    Ok(())
}

/// Write one good page over the bad copy's on-disk location. Repair
/// writes get no retries; a failure counts as a write error and makes
/// the block uncorrectable.
fn repair_page_from_good_copy(
    ctx: &ScrubContext,
    block_bad: &ScrubBlock,
    block_good: &ScrubBlock,
    page_num: usize,
    force_write: bool,
) -> Result<(), ScrubError> {
    let page_bad = block_bad.page(page_num);
    let page_good = block_good.page(page_num);

    if !force_write && !page_bad.io_error() {
        return Ok(());
    }

    let data = page_good.data();
    if let Err(err) = page_bad.dev.write_at(page_bad.physical, &data) {
        ctx.note_write_error();
        return Err(err.into());
    }
    drop(data);
    page_bad.copy_from(page_good);
    Ok(())
}
