//! Top-level scrub-device routine and bio completion machinery.
//!
//! `Scrubber` owns the per-scrub context: it spawns the I/O worker pool
//! and the release timer, scrubs the superblock copies, enumerates the
//! device's chunks and hands each to the extent walker, then drains and
//! tears everything down. Completion processing (error marking, block
//! completion, the adaptive delay/release decision) runs on the worker
//! threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam::channel;
use log::{info, warn};
use parking_lot::Mutex;

use crate::checksum::{SUPER_INFO_SIZE, SUPER_OFFSETS};
use crate::context::{FlightCounter, IoJob, ScrubContext, ScrubProgress};
use crate::device::BlockDevice;
use crate::error::ScrubError;
use crate::events::{EventMask, EventRegistry};
use crate::fs::{ExtentKind, PAGE_SIZE, ScrubFilesystem, ScrubGate};
use crate::pool::BioPool;
use crate::rate::{BIO_BYTES, DEFAULT_BIOS, ReleaseTimer, adjust_rate, scaled_delay};
use crate::repair::scrub_block_complete;
use crate::replace::ReplaceCtx;
use crate::walker;

/// Behind-by-goal factor (in bio increments) at which the boost flag
/// raises the thread's I/O priority.
const BOOST_BEHIND_FACTOR: u64 = 100;

/// Configuration of one scrub run.
pub struct ScrubOptions {
    /// Wall-clock budget in seconds; 0 runs at the fixed default rate.
    pub deadline_secs: u64,
    /// Detect but never write repairs.
    pub readonly: bool,
    /// Allow raising the scrub thread's I/O priority when far behind.
    pub boost: bool,
    /// Replace target: verified blocks are mirrored onto this device.
    pub replace_target: Option<Arc<dyn BlockDevice>>,
    /// Event system hookup for synergistic skipping.
    pub registry: Option<Arc<EventRegistry>>,
    /// Threads servicing read bios.
    pub io_workers: usize,
}

impl Default for ScrubOptions {
    fn default() -> Self {
        ScrubOptions {
            deadline_secs: 0,
            readonly: false,
            boost: false,
            replace_target: None,
            registry: None,
            io_workers: 2,
        }
    }
}

/// One scrub of one device.
pub struct Scrubber {
    ctx: Arc<ScrubContext>,
    io_workers: usize,
    started: AtomicBool,
}

impl Scrubber {
    pub fn new(
        fs: Arc<dyn ScrubFilesystem>,
        dev: Arc<dyn BlockDevice>,
        gate: Arc<ScrubGate>,
        options: ScrubOptions,
    ) -> Result<Self, ScrubError> {
        let deadline = options.deadline_secs;
        let adaptive = deadline != 0;

        // Estimated bytes to scrub: the allocated device extents.
        let used_bytes: u64 = fs
            .device_chunks(dev.id(), 0, dev.len())?
            .iter()
            .map(|c| c.length)
            .sum();

        let (initial_bios, delay) = if adaptive {
            adjust_rate(deadline, 0, used_bytes, 0)
        } else {
            (DEFAULT_BIOS, 0)
        };
        info!(
            "scrub: dev {} deadline {}s used {} bytes, {} bios, delay {}s",
            dev.id(),
            deadline,
            used_bytes,
            initial_bios,
            delay
        );

        let task = options.registry.as_ref().map(|registry| {
            registry.register(
                &format!("scrub-dev{}", dev.id()),
                None,
                PAGE_SIZE,
                false,
                EventMask::ADDED | EventMask::MODIFIED,
            )
        });

        let num_write_errors = Arc::new(AtomicU64::new(0));

        let ctx = Arc::new(ScrubContext {
            fs,
            dev,
            gate,
            pool: BioPool::new(initial_bios as usize, adaptive),
            io_tx: Mutex::new(None),
            timer: ReleaseTimer::new(),
            bios_in_flight: FlightCounter::new(),
            bios_allocated: FlightCounter::new(),
            workers_pending: FlightCounter::new(),
            cancel_req: AtomicBool::new(false),
            readonly: options.readonly,
            is_dev_replace: options.replace_target.is_some(),
            deadline,
            used_bytes,
            t_start: Instant::now(),
            delay: AtomicU64::new(delay),
            boost: options.boost,
            boosted: AtomicBool::new(false),
            csum_list: Mutex::new(Default::default()),
            stats: Mutex::new(ScrubProgress::default()),
            num_write_errors: Arc::clone(&num_write_errors),
            replace: options
                .replace_target
                .map(|target| ReplaceCtx::new(target, num_write_errors)),
            registry: options.registry,
            task,
        });

        Ok(Scrubber {
            ctx,
            io_workers: options.io_workers.max(1),
            started: AtomicBool::new(false),
        })
    }

    /// Counters so far; callable concurrently with `run`.
    pub fn progress(&self) -> ScrubProgress {
        self.ctx.progress()
    }

    /// The event-system task this scrub subscribed, if any.
    pub fn task(&self) -> Option<&Arc<crate::events::ScrubTask>> {
        self.ctx.task.as_ref()
    }

    /// Failed repair writes, whether toward a mirror being fixed or the
    /// replace target.
    pub fn num_write_errors(&self) -> u64 {
        self.ctx.num_write_errors()
    }

    pub fn cancel(&self) {
        self.ctx.request_cancel();
    }

    /// Run the scrub over device offsets `[start, end)`. Blocks the
    /// calling thread until done, cancelled, or failed; outstanding
    /// bios are always drained before returning.
    pub fn run(&self, start: u64, end: u64) -> Result<ScrubProgress, ScrubError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ScrubError::Invalid("scrub context already ran"));
        }
        let ctx = &self.ctx;

        // I/O worker pool servicing read bios.
        let (tx, rx) = channel::unbounded::<IoJob>();
        *ctx.io_tx.lock() = Some(tx);
        let mut handles = Vec::with_capacity(self.io_workers);
        for n in 0..self.io_workers {
            let rx = rx.clone();
            let weak = Arc::downgrade(ctx);
            let handle = thread::Builder::new()
                .name(format!("scrub-io{n}"))
                .spawn(move || {
                    while let Ok(bio) = rx.recv() {
                        let Some(ctx) = weak.upgrade() else { break };
                        end_io(&ctx, bio);
                    }
                })
                .expect("spawn scrub io worker");
            handles.push(handle);
        }
        drop(rx);

        // Release timer for rate-controlled bios.
        {
            let weak = Arc::downgrade(ctx);
            ctx.timer.spawn(move |bio| {
                if let Some(ctx) = weak.upgrade() {
                    wrapup(&ctx, bio);
                }
            });
        }

        let mut result = if ctx.is_dev_replace {
            Ok(())
        } else {
            scrub_supers(ctx)
        };

        if result.is_ok() {
            result = self.scrub_chunks(start, end);
        }

        // Push queued extents and wait out everything in flight,
        // including bios parked on the release timer.
        walker::scrub_submit(ctx);
        if let Some(replace) = ctx.replace.as_ref() {
            replace.flush();
        }
        ctx.bios_in_flight.wait_zero();
        ctx.bios_allocated.wait_zero();
        ctx.workers_pending.wait_zero();

        // Teardown: close the job channel, join workers, stop the timer.
        *ctx.io_tx.lock() = None;
        for handle in handles {
            let _ = handle.join();
        }
        ctx.timer.shutdown();

        if ctx.boosted.swap(false, Ordering::SeqCst) {
            ctx.fs.set_io_priority(false);
        }

        result.map(|()| ctx.progress())
    }

    fn scrub_chunks(&self, start: u64, end: u64) -> Result<(), ScrubError> {
        let ctx = &self.ctx;
        let chunks = ctx.fs.device_chunks(ctx.dev.id(), start, end)?;

        for chunk in &chunks {
            if ctx.cancelled() {
                return Err(ScrubError::Cancelled);
            }
            walker::scrub_chunk(ctx, chunk)?;
        }
        Ok(())
    }
}

impl Drop for Scrubber {
    fn drop(&mut self) {
        if let (Some(registry), Some(task)) = (self.ctx.registry.as_ref(), self.ctx.task.as_ref()) {
            registry.deregister(task.id());
        }
    }
}

/// Convenience wrapper: build a scrubber and run it over the whole
/// device.
pub fn scrub_device(
    fs: Arc<dyn ScrubFilesystem>,
    dev: Arc<dyn BlockDevice>,
    gate: Arc<ScrubGate>,
    options: ScrubOptions,
) -> Result<ScrubProgress, ScrubError> {
    let end = dev.len();
    let scrubber = Scrubber::new(fs, dev, gate, options)?;
    scrubber.run(0, end)
}

/// Verify the superblock copies that fit on the device. Failures are
/// counted and never repaired.
fn scrub_supers(ctx: &Arc<ScrubContext>) -> Result<(), ScrubError> {
    let generation = ctx.fs.super_generation();

    for &bytenr in SUPER_OFFSETS.iter() {
        if bytenr + SUPER_INFO_SIZE > ctx.dev.len() {
            break;
        }
        walker::scrub_pages(
            ctx,
            bytenr,
            SUPER_INFO_SIZE,
            bytenr,
            ExtentKind::Super,
            generation,
            1,
            None,
            true,
        )?;
    }

    ctx.bios_in_flight.wait_zero();
    Ok(())
}

/// Service one read bio on a worker thread: do the read, mark errors,
/// complete blocks, then decide between immediate release and a timed
/// one.
fn end_io(ctx: &Arc<ScrubContext>, bio: IoJob) {
    ctx.workers_pending.inc();

    let (dev, physical, bio_pages) = {
        let mut fill = bio.fill.lock();
        (fill.dev.take(), fill.physical, std::mem::take(&mut fill.pages))
    };
    let page_count = bio_pages.len();

    let mut io_failed = dev.is_none();
    if let Some(dev) = dev {
        let mut buf = vec![0u8; page_count * PAGE_SIZE as usize];
        match dev.read_at(physical, &mut buf) {
            Ok(()) => {
                for (i, bio_page) in bio_pages.iter().enumerate() {
                    let off = i * PAGE_SIZE as usize;
                    bio_page
                        .page()
                        .data()
                        .copy_from_slice(&buf[off..off + PAGE_SIZE as usize]);
                }
            }
            Err(err) => {
                warn!("scrub: read bio at {physical} failed: {err}");
                io_failed = true;
            }
        }
    }

    if io_failed {
        for bio_page in &bio_pages {
            bio_page.page().set_io_error(true);
            bio_page.block.note_io_error();
        }
    }

    // Complete the blocks whose last page this bio carried.
    for bio_page in &bio_pages {
        if bio_page.block.complete_page() {
            scrub_block_complete(ctx, &bio_page.block);
        }
    }
    drop(bio_pages);

    if ctx.is_dev_replace
        && let Some(replace) = ctx.replace.as_ref()
        && replace.flush_all_writes()
    {
        replace.flush();
    }

    ctx.bios_in_flight.dec();

    if ctx.deadline != 0 && !ctx.gate.pause_requested() {
        // Hold the bio to pace the scrub; release through the timer
        // once its share of the delay (minus time already spent in
        // flight and previously wasted) has passed.
        let now = Instant::now();
        let delay_secs = ctx.delay.load(Ordering::SeqCst);
        let mut timing = bio.timing.lock();
        let owed = scaled_delay(delay_secs, page_count);
        let credit = now.duration_since(timing.t_start) + timing.t_wasted;
        if owed > credit {
            let fire_at = now + (owed - credit);
            drop(timing);
            ctx.timer.schedule(bio, fire_at);
        } else {
            timing.wasted_mark = Some(now);
            drop(timing);
            wrapup(ctx, bio);
        }
    } else {
        // Pause pressure or fixed mode: no delay, release right away.
        bio.timing.lock().wasted_mark = Some(Instant::now());
        wrapup(ctx, bio);
    }

    ctx.workers_pending.dec();
}

/// Final completion step: rate adjustment, then return the bio to the
/// pool (or retire its slot if a shrink is pending).
pub(crate) fn wrapup(ctx: &Arc<ScrubContext>, bio: IoJob) {
    if ctx.deadline != 0 {
        let elapsed = ctx.t_start.elapsed().as_secs();
        let progress = ctx.with_stats(|s| s.data_bytes_scrubbed + s.tree_bytes_scrubbed);
        let goal = elapsed * ctx.used_bytes / ctx.deadline;
        let min_inc = BIO_BYTES;

        // Adjust whenever we fell behind, or drifted more than one
        // bio's worth either way.
        if elapsed > ctx.deadline || progress + min_inc < goal || goal + min_inc < progress {
            if ctx.boost {
                let boosted = ctx.boosted.load(Ordering::SeqCst);
                if progress + BOOST_BEHIND_FACTOR * min_inc < goal && !boosted {
                    ctx.fs.set_io_priority(true);
                    ctx.boosted.store(true, Ordering::SeqCst);
                } else if progress > goal && boosted {
                    ctx.fs.set_io_priority(false);
                    ctx.boosted.store(false, Ordering::SeqCst);
                }
            }

            let (bios, delay) = adjust_rate(ctx.deadline, elapsed, ctx.used_bytes, progress);
            let target = bios as usize;
            let current = ctx.pool.size();
            if target > current {
                info!("scrub: growing bio pool {current} -> {target}");
                ctx.pool.grow(target);
            } else if target < current {
                info!("scrub: shrinking bio pool {current} -> {target}");
                ctx.pool.set_pending_removals(current - target);
            }

            let old = ctx.delay.swap(delay, Ordering::SeqCst);
            if old != delay {
                info!("scrub: adjusting delay {old}s -> {delay}s");
            }
        }
    }

    // Account queueing slop so the next delay is shortened by it.
    {
        let mut timing = bio.timing.lock();
        if let Some(mark) = timing.wasted_mark.take() {
            timing.t_wasted = mark.elapsed();
        }
    }

    ctx.pool.release(&bio);
    ctx.bios_allocated.dec();
}
