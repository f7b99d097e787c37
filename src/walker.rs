//! Extent walker: per-chunk, per-stripe scan feeding the bio pool.
//!
//! A chunk's device extent is walked one stripe window at a time. For
//! every extent item in the window the walker trims to the stripe,
//! consults the progress BitTree (a fully-marked range is skipped
//! outright), fetches checksums and cuts the extent into scrub blocks
//! whose pages are appended to the current read bio. Pause requests are
//! honored at stripe and extent granularity; pending page events are
//! drained between iterations.

use std::sync::Arc;

use log::{debug, warn};

use crate::block::{BioPage, MAX_PAGES_PER_BLOCK, ScrubBlock, ScrubPage};
use crate::context::ScrubContext;
use crate::error::ScrubError;
use crate::fs::{DeviceChunk, ExtentKind, PAGE_SIZE, RaidProfile, StripeMap};
use crate::pipeline;
use crate::pool::{PAGES_PER_RD_BIO, WAIT_TO};

/// Node (tree block) size; the largest checksummed metadata block.
pub const NODE_SIZE: u64 = 16 * 1024;

/// Scrub every stripe of `chunk` that lives on the scrub device.
pub(crate) fn scrub_chunk(ctx: &Arc<ScrubContext>, chunk: &DeviceChunk) -> Result<(), ScrubError> {
    let map = ctx.fs.chunk_stripes(chunk.chunk_offset)?;

    for (num, stripe) in map.stripes.iter().enumerate() {
        if stripe.dev == ctx.dev.id() && stripe.physical == chunk.dev_offset {
            scrub_stripe(ctx, &map, num, chunk.chunk_offset, chunk.length)?;
        }
    }
    Ok(())
}

/// Stripe geometry: where this device's walk starts within the chunk,
/// how far consecutive windows are apart in logical space, and which
/// mirror this copy is.
fn stripe_geometry(map: &StripeMap, num: usize) -> (u64, u64, u8) {
    match map.profile {
        RaidProfile::Raid0 => (map.stripe_len * num as u64, map.stripe_len * map.num_stripes() as u64, 1),
        RaidProfile::Raid10 => {
            let factor = (map.num_stripes() / map.sub_stripes) as u64;
            (
                map.stripe_len * (num / map.sub_stripes) as u64,
                map.stripe_len * factor,
                (num % map.sub_stripes) as u8 + 1,
            )
        }
        RaidProfile::Raid1 | RaidProfile::Dup => {
            (0, map.stripe_len, (num % map.num_stripes()) as u8 + 1)
        }
        RaidProfile::Single => (0, map.stripe_len, 1),
    }
}

fn scrub_stripe(
    ctx: &Arc<ScrubContext>,
    map: &StripeMap,
    num: usize,
    base: u64,
    length: u64,
) -> Result<(), ScrubError> {
    let (offset, increment, mirror_num) = stripe_geometry(map, num);
    let nstripes = length / map.stripe_len;
    let dstart = ctx.dstart();

    let mut logical = base + offset;
    let mut physical = map.stripes[num].physical;
    let logic_end = logical + increment * nstripes;
    let mut skipped_extents = 0u64;

    // Trigger readahead for the extent and checksum items of the whole
    // device extent and wait for it with the scrub officially paused, so
    // transaction commits are not held off.
    ctx.bios_in_flight.wait_zero();
    ctx.gate.enter_paused();
    ctx.fs.read_ahead((logical, logic_end), (logical, logic_end));
    ctx.gate.wait_while_paused();
    ctx.gate.exit_paused();

    while logical < logic_end {
        if ctx.cancelled() {
            flush_pending(ctx);
            return Err(ScrubError::Cancelled);
        }

        pause_point(ctx)?;

        // Drain page events first. A backlog (or an event that touched
        // the disk) sends us around the loop again, giving the
        // foreground workload a chance before the next stripe.
        if pipeline::process_events(ctx) {
            continue;
        }

        let stripe_end = logical + map.stripe_len;
        let extents = ctx.fs.extents_in_range(logical, stripe_end)?;

        for ext in &extents {
            if ctx.cancelled() {
                flush_pending(ctx);
                return Err(ScrubError::Cancelled);
            }
            // Asked to pause in the middle of an extent: flush, park,
            // and continue from where we left off.
            pause_point(ctx)?;

            if ext.logical + ext.len <= logical || ext.logical >= stripe_end {
                continue;
            }

            if ext.logical < logical && ext.kind == ExtentKind::TreeBlock {
                warn!(
                    "scrub: tree block {} spanning stripes, ignored. logical={}",
                    ext.logical, logical
                );
                continue;
            }

            // Trim the extent to this stripe.
            let ext_logical = ext.logical.max(logical);
            let ext_end = (ext.logical + ext.len).min(stripe_end);
            let ext_len = ext_end - ext_logical;
            let ext_physical = ext_logical - logical + physical;

            // Skip test: the whole portion already verified or rewritten
            // since, courtesy of the foreground workload.
            if !ctx.is_dev_replace
                && let Some(task) = ctx.task.as_ref()
                && task.check(dstart + ext_physical, ext_len)?
            {
                skipped_extents += 1;
                ctx.with_stats(|s| match ext.kind {
                    ExtentKind::Data => s.data_bytes_scrubbed += ext_len,
                    _ => s.tree_bytes_scrubbed += ext_len,
                });
                continue;
            }

            if ext.kind == ExtentKind::Data {
                let runs = ctx.fs.lookup_csums(ext_logical, ext_end)?;
                ctx.csum_list.lock().extend(runs);
            }

            scrub_extent(
                ctx,
                ext_logical,
                ext_len,
                ext_physical,
                ext.kind,
                ext.generation,
                mirror_num,
            )?;

            ctx.free_csums();
        }

        logical += increment;
        physical += map.stripe_len;
        ctx.with_stats(|s| {
            s.last_physical = if logical >= logic_end {
                map.stripes[num].physical + length
            } else {
                physical
            };
        });
    }

    // Push queued extents.
    flush_pending(ctx);
    if skipped_extents > 0 {
        debug!("scrub: skipped {skipped_extents} extent portions this stripe walk");
    }
    Ok(())
}

/// Flush the bio under assembly and any dev-replace writes.
fn flush_pending(ctx: &Arc<ScrubContext>) {
    scrub_submit(ctx);
    if let Some(replace) = ctx.replace.as_ref() {
        replace.flush();
    }
}

/// Honor a pause request: flush everything, wait for in-flight bios,
/// park until resumed (draining events meanwhile), and on resume make
/// sure a bio slot is free before walking on.
fn pause_point(ctx: &Arc<ScrubContext>) -> Result<(), ScrubError> {
    if !ctx.gate.pause_requested() {
        return Ok(());
    }

    if let Some(replace) = ctx.replace.as_ref() {
        replace.set_flush_all_writes(true);
    }
    flush_pending(ctx);
    ctx.bios_in_flight.wait_zero();
    if let Some(replace) = ctx.replace.as_ref() {
        replace.set_flush_all_writes(false);
    }

    ctx.gate.enter_paused();
    'paused: loop {
        while ctx.gate.pause_requested() && !ctx.cancelled() {
            // If there is nothing left to process, sleep until resumed.
            if !pipeline::process_events(ctx) {
                ctx.gate.wait_while_paused();
            }
        }

        if ctx.cancelled() {
            break;
        }

        // Resumed. In adaptive mode every bio may still be parked on
        // its release timer; wait for a slot, falling back to paused if
        // another request arrives meanwhile.
        if ctx.deadline != 0 {
            while !ctx.pool.wait_free_for(WAIT_TO) {
                if ctx.cancelled() {
                    break 'paused;
                }
                if ctx.gate.pause_requested() {
                    continue 'paused;
                }
            }
        }
        break;
    }
    ctx.gate.exit_paused();

    if ctx.cancelled() {
        return Err(ScrubError::Cancelled);
    }
    Ok(())
}

/// Cut one trimmed extent portion into checksummed blocks and queue
/// them. Data advances by the sector size, metadata by the node size;
/// within a segment logical and physical space are both contiguous.
fn scrub_extent(
    ctx: &Arc<ScrubContext>,
    mut logical: u64,
    mut len: u64,
    mut physical: u64,
    kind: ExtentKind,
    generation: u64,
    mirror_num: u8,
) -> Result<(), ScrubError> {
    let blocksize = match kind {
        ExtentKind::Data => PAGE_SIZE,
        _ => NODE_SIZE,
    };
    let dstart = ctx.dstart();

    ctx.with_stats(|s| match kind {
        ExtentKind::Data => {
            s.data_extents_scrubbed += 1;
            s.data_bytes_scrubbed += len;
        }
        _ => {
            s.tree_extents_scrubbed += 1;
            s.tree_bytes_scrubbed += len;
        }
    });

    while len > 0 {
        let l = len.min(blocksize);

        if kind != ExtentKind::Data && l < blocksize {
            // A partial tree block cannot be verified against its
            // header checksum.
            warn!("scrub: partial tree block at {logical} ({l} bytes), ignored");
            break;
        }

        // Block-granularity skip test; an event may have arrived since
        // the extent-level check.
        let skip = !ctx.is_dev_replace
            && match ctx.task.as_ref() {
                Some(task) => task.check(dstart + physical, l)?,
                None => false,
            };

        if !skip {
            ctx.with_stats(|s| match kind {
                ExtentKind::Data => s.data_bytes_verified += l,
                _ => s.tree_bytes_verified += l,
            });

            let mut csum = None;
            if kind == ExtentKind::Data {
                csum = ctx.find_csum(logical);
                if csum.is_none() {
                    ctx.with_stats(|s| s.no_csum += 1);
                }
            }

            scrub_pages(ctx, logical, l, physical, kind, generation, mirror_num, csum, false)?;
        }

        len -= l;
        logical += l;
        physical += l;
    }
    Ok(())
}

/// Build a scrub block for `[logical, logical + len)` and append its
/// pages to the current read bio.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scrub_pages(
    ctx: &Arc<ScrubContext>,
    logical: u64,
    len: u64,
    physical: u64,
    kind: ExtentKind,
    generation: u64,
    mirror_num: u8,
    csum: Option<u32>,
    force: bool,
) -> Result<(), ScrubError> {
    let page_count = len.div_ceil(PAGE_SIZE) as usize;
    debug_assert!(page_count <= MAX_PAGES_PER_BLOCK);

    let mut pages = Vec::with_capacity(page_count);
    for index in 0..page_count {
        let off = index as u64 * PAGE_SIZE;
        pages.push(ScrubPage::new(
            Arc::clone(&ctx.dev),
            kind,
            generation,
            logical + off,
            physical + off,
            physical + off,
            mirror_num,
            csum,
        ));
    }
    let block = ScrubBlock::new(pages);

    for page_idx in 0..block.page_count() {
        add_page_to_rd_bio(
            ctx,
            BioPage {
                block: Arc::clone(&block),
                page_idx,
            },
        )?;
    }

    if force {
        scrub_submit(ctx);
    }
    Ok(())
}

/// Append one page to the bio under assembly, submitting and restarting
/// whenever the page is not physically contiguous with the bio's tail
/// or the bio is full.
fn add_page_to_rd_bio(ctx: &Arc<ScrubContext>, bio_page: BioPage) -> Result<(), ScrubError> {
    let page = bio_page.page().clone();

    loop {
        let bio = ctx
            .pool
            .current_or_acquire(|| ctx.gate.pause_requested());

        let mut fill = bio.fill.lock();
        if fill.pages.is_empty() {
            fill.dev = Some(Arc::clone(&page.dev));
            fill.physical = page.physical;
            fill.logical = page.logical;
        } else {
            let tail = fill.pages.len() as u64 * PAGE_SIZE;
            let same_dev = fill
                .dev
                .as_ref()
                .is_some_and(|d| d.id() == page.dev.id());
            if fill.physical + tail != page.physical
                || fill.logical + tail != page.logical
                || !same_dev
            {
                drop(fill);
                scrub_submit(ctx);
                continue;
            }
        }

        fill.pages.push(bio_page);
        let full = fill.pages.len() == PAGES_PER_RD_BIO;
        drop(fill);

        if full {
            scrub_submit(ctx);
        }
        return Ok(());
    }
}

/// Dispatch the bio under assembly to the I/O workers.
pub(crate) fn scrub_submit(ctx: &Arc<ScrubContext>) {
    if let Some(bio) = ctx.pool.take_current() {
        ctx.dispatch(bio);
    }
}
