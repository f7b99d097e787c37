//! End-to-end scrub scenarios over the in-memory fixture.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use blkscrub::device::MemDevice;
use blkscrub::BlockDevice;
use blkscrub::error::ScrubError;
use blkscrub::events::{EventMask, EventRegistry, PageEvent};
use blkscrub::fs::{PAGE_SIZE, ScrubFilesystem, ScrubGate};
use blkscrub::orchestrator::{ScrubOptions, Scrubber, scrub_device};

use common::{CHUNK_LOGICAL, DEV_DATA_START, FixtureBuilder, MemFs};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_scrub(fs: &Arc<MemFs>, options: ScrubOptions) -> blkscrub::ScrubProgress {
    let fs_dyn: Arc<dyn ScrubFilesystem> = Arc::clone(fs) as _;
    scrub_device(fs_dyn, fs.device_arc(0), Arc::new(ScrubGate::new()), options)
        .expect("scrub should complete")
}

#[test]
fn clean_device_scrubs_everything() {
    init_logging();
    let mut builder = FixtureBuilder::new(2 << 20);
    builder.add_data_extent(512 * 1024);
    builder.add_data_extent(256 * 1024);
    builder.add_data_extent(256 * 1024);
    let _tree = builder.add_tree_extent(4);
    let fs = builder.build(2);

    let progress = run_scrub(&fs, ScrubOptions::default());

    // Extent portions are counted per stripe window: 1 MiB of data
    // over 64 KiB stripes.
    assert_eq!(progress.data_extents_scrubbed, 16);
    assert_eq!(progress.data_bytes_scrubbed, fs.total_data_bytes());
    assert_eq!(progress.data_bytes_verified, fs.total_data_bytes());
    assert_eq!(progress.tree_extents_scrubbed, 1);
    assert_eq!(progress.tree_bytes_scrubbed, fs.total_tree_bytes());
    assert_eq!(progress.tree_bytes_verified, fs.total_tree_bytes());
    assert_eq!(progress.csum_errors, 0);
    assert_eq!(progress.corrected_errors, 0);
    assert_eq!(progress.uncorrectable_errors, 0);
    assert_eq!(progress.read_errors, 0);
    assert_eq!(progress.super_errors, 0);
    assert_eq!(progress.no_csum, 0);
    assert_eq!(progress.last_physical, DEV_DATA_START + fs.chunk_len());
}

#[test]
fn injected_corruption_is_repaired_from_mirror() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    builder.add_data_extent(512 * 1024);
    let fs = builder.build(2);

    // Corrupt one page of the copy on the scrub device; the mirror
    // stays intact.
    let bad_logical = CHUNK_LOGICAL;
    fs.corrupt_data(0, bad_logical, 64);

    let progress = run_scrub(&fs, ScrubOptions::default());

    assert_eq!(progress.csum_errors, 1);
    assert_eq!(progress.corrected_errors, 1);
    assert_eq!(progress.uncorrectable_errors, 0);

    // The bad copy was rewritten from the good mirror.
    let physical = fs.physical_of(bad_logical);
    let fixed = fs.device_arc(0).snapshot(physical, PAGE_SIZE as usize);
    let mirror = fs.device_arc(1).snapshot(physical, PAGE_SIZE as usize);
    assert_eq!(fixed, mirror);
}

#[test]
fn corruption_on_every_mirror_is_uncorrectable() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    builder.add_data_extent(512 * 1024);
    let fs = builder.build(2);

    let bad_logical = CHUNK_LOGICAL + 3 * PAGE_SIZE;
    fs.corrupt_data(0, bad_logical, 64);
    fs.corrupt_data(1, bad_logical, 64);

    let progress = run_scrub(&fs, ScrubOptions::default());

    assert_eq!(progress.csum_errors, 1);
    assert_eq!(progress.corrected_errors, 0);
    assert_eq!(progress.uncorrectable_errors, 1);
}

#[test]
fn corrupt_tree_block_is_repaired() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    builder.add_data_extent(128 * 1024);
    let tree_logical = builder.add_tree_extent(2);
    let fs = builder.build(2);

    // Smash the payload of the first node on the scrub device.
    fs.corrupt_data(0, tree_logical + 512, 128);

    let progress = run_scrub(&fs, ScrubOptions::default());

    assert_eq!(progress.csum_errors, 1);
    assert_eq!(progress.corrected_errors, 1);
    assert_eq!(progress.uncorrectable_errors, 0);
}

#[test]
fn corrupt_super_is_counted_not_repaired() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    builder.add_data_extent(128 * 1024);
    let fs = builder.build(2);

    // First superblock copy lives at 64 KiB.
    fs.device_arc(0).patch(64 * 1024 + 100, &[0xFF; 32]);

    let progress = run_scrub(&fs, ScrubOptions::default());

    assert_eq!(progress.super_errors, 1);
    assert_eq!(progress.corrected_errors, 0);
    assert_eq!(progress.uncorrectable_errors, 0);
}

#[test]
fn read_error_repairs_only_the_failing_page() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    builder.add_data_extent(256 * 1024);
    let fs = builder.build(2);

    // Fail reads of one page on the scrub device. The whole 32-page bio
    // containing it errors out; every other page re-reads clean.
    let bad_logical = CHUNK_LOGICAL + 5 * PAGE_SIZE;
    fs.device_arc(0)
        .inject_read_error(fs.physical_of(bad_logical), PAGE_SIZE);

    let progress = run_scrub(&fs, ScrubOptions::default());

    assert_eq!(progress.read_errors, 1);
    assert_eq!(progress.corrected_errors, 1);
    assert_eq!(progress.uncorrectable_errors, 0);
    assert_eq!(progress.unverified_errors, 31);
}

#[test]
fn nodatasum_read_error_queues_fixup() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    let nocsum_logical = builder.add_nocsum_extent(128 * 1024);
    let fs = builder.build(2);

    fs.device_arc(0)
        .inject_read_error(fs.physical_of(nocsum_logical), PAGE_SIZE);

    let progress = run_scrub(&fs, ScrubOptions::default());

    assert_eq!(progress.no_csum, (128 * 1024) / PAGE_SIZE);
    let fixups = fs.queued_fixups();
    assert_eq!(fixups.len(), 1);
    assert_eq!(fixups[0].0, nocsum_logical);
    // Its neighbors in the failed bio re-read clean.
    assert_eq!(progress.uncorrectable_errors, 0);
}

#[test]
fn foreground_read_skips_the_page() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    let (ino, _logical) = builder.add_data_extent(512 * 1024);
    let fs = builder.build(2);

    let registry = EventRegistry::new(1);
    let fs_dyn: Arc<dyn ScrubFilesystem> = Arc::clone(&fs) as _;
    let scrubber = Scrubber::new(
        fs_dyn,
        fs.device_arc(0),
        Arc::new(ScrubGate::new()),
        ScrubOptions {
            registry: Some(Arc::clone(&registry)),
            ..Default::default()
        },
    )
    .unwrap();

    // The foreground "reads" page 2 of the file: its on-disk location
    // was just checksummed by the read path.
    registry.emit(PageEvent {
        fs_id: 1,
        ino,
        page_index: 2,
        mask: EventMask::ADDED,
        regular_mapping: true,
    });

    let task = scrubber.task().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while task.pending_events() < 1 {
        assert!(Instant::now() < deadline, "event never reached the store");
        std::thread::sleep(Duration::from_millis(1));
    }

    let progress = scrubber.run(0, fs.device_arc(0).len()).unwrap();

    // The extent is processed, but the page-sized subregion is skipped.
    assert_eq!(progress.data_bytes_scrubbed, fs.total_data_bytes());
    assert_eq!(
        progress.data_bytes_verified,
        fs.total_data_bytes() - PAGE_SIZE
    );
    assert_eq!(progress.csum_errors, 0);
}

#[test]
fn foreground_write_revokes_the_skip() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    let (ino, logical) = builder.add_data_extent(512 * 1024);
    let fs = builder.build(2);

    let registry = EventRegistry::new(1);
    let fs_dyn: Arc<dyn ScrubFilesystem> = Arc::clone(&fs) as _;
    let scrubber = Scrubber::new(
        fs_dyn,
        fs.device_arc(0),
        Arc::new(ScrubGate::new()),
        ScrubOptions {
            registry: Some(Arc::clone(&registry)),
            ..Default::default()
        },
    )
    .unwrap();
    let task = scrubber.task().unwrap();

    // Page 1 was seen by the read path earlier and is marked
    // skippable; page 4 likewise.
    task.mark(fs.physical_of(logical + PAGE_SIZE), PAGE_SIZE).unwrap();
    task.mark(fs.physical_of(logical + 4 * PAGE_SIZE), PAGE_SIZE).unwrap();

    // But page 4 is then dirtied: its done-bit must be cleared.
    registry.emit(PageEvent {
        fs_id: 1,
        ino,
        page_index: 4,
        mask: EventMask::ADDED | EventMask::MODIFIED,
        regular_mapping: true,
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while task.pending_events() < 1 {
        assert!(Instant::now() < deadline, "event never reached the store");
        std::thread::sleep(Duration::from_millis(1));
    }

    let progress = scrubber.run(0, fs.device_arc(0).len()).unwrap();

    // Only page 1 stays skipped; the dirtied page 4 is verified.
    assert_eq!(
        progress.data_bytes_verified,
        fs.total_data_bytes() - PAGE_SIZE
    );
}

#[test]
fn deadline_paces_the_scrub() {
    init_logging();
    let mut builder = FixtureBuilder::new(2 << 20);
    builder.add_data_extent(2 << 20);
    let fs = builder.build(2);

    let start = Instant::now();
    let progress = run_scrub(
        &fs,
        ScrubOptions {
            deadline_secs: 2,
            ..Default::default()
        },
    );
    let elapsed = start.elapsed();

    assert_eq!(progress.data_bytes_scrubbed, fs.total_data_bytes());
    assert_eq!(progress.last_physical, DEV_DATA_START + fs.chunk_len());
    // Unpaced, the in-memory device finishes in milliseconds; the rate
    // controller must stretch the run toward the deadline without
    // overshooting wildly.
    assert!(
        elapsed >= Duration::from_millis(900),
        "finished too fast: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_secs(15),
        "finished too slow: {elapsed:?}"
    );
}

#[test]
fn dev_replace_mirrors_content_onto_target() {
    init_logging();
    let mut builder = FixtureBuilder::new(1 << 20);
    builder.add_data_extent(256 * 1024);
    builder.add_tree_extent(2);
    let fs = builder.build(2);

    let source = fs.device_arc(0);
    let target = Arc::new(MemDevice::new(7, source.len() as usize));

    let fs_dyn: Arc<dyn ScrubFilesystem> = Arc::clone(&fs) as _;
    let scrubber = Scrubber::new(
        fs_dyn,
        Arc::clone(&source) as _,
        Arc::new(ScrubGate::new()),
        ScrubOptions {
            replace_target: Some(Arc::clone(&target) as _),
            ..Default::default()
        },
    )
    .unwrap();
    scrubber.run(0, source.len()).unwrap();

    let len = (fs.total_data_bytes() + fs.total_tree_bytes()) as usize;
    let copied = target.snapshot(DEV_DATA_START, len);
    let original = source.snapshot(DEV_DATA_START, len);
    assert_eq!(copied, original);
    assert_eq!(scrubber.num_write_errors(), 0);
}

#[test]
fn pause_resume_and_cancel() {
    init_logging();
    let mut builder = FixtureBuilder::new(2 << 20);
    builder.add_data_extent(2 << 20);
    let fs = builder.build(2);

    let gate = Arc::new(ScrubGate::new());
    let fs_dyn: Arc<dyn ScrubFilesystem> = Arc::clone(&fs) as _;
    let scrubber = Arc::new(
        Scrubber::new(
            fs_dyn,
            fs.device_arc(0),
            Arc::clone(&gate),
            ScrubOptions {
                deadline_secs: 20,
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let runner = {
        let scrubber = Arc::clone(&scrubber);
        let end = fs.device_arc(0).len();
        std::thread::spawn(move || scrubber.run(0, end))
    };

    // Ask for a pause (as a transaction commit would) and wait for the
    // walker to park.
    gate.request_pause();
    let deadline = Instant::now() + Duration::from_secs(10);
    while gate.scrubs_paused() == 0 {
        assert!(Instant::now() < deadline, "scrub never parked");
        std::thread::sleep(Duration::from_millis(5));
    }

    gate.resume();

    // Cancel shortly after resuming; the run must unwind cleanly.
    std::thread::sleep(Duration::from_millis(50));
    scrubber.cancel();

    match runner.join().unwrap() {
        Err(ScrubError::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}
