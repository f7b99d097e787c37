//! Checksum verification for data, tree and super blocks.
//!
//! Data blocks carry an external crc32c per sector (from the checksum
//! tree). Tree and super blocks embed a header whose fields are sanity
//! checked before the crc over the remainder of the block is compared.

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::block::ScrubBlock;
use crate::context::ScrubContext;
use crate::fs::{ExtentKind, PAGE_SIZE};

/// Stored checksum width (crc32c).
pub const CSUM_SIZE: usize = 4;

/// Magic carried by every superblock copy.
pub const SUPER_MAGIC: u64 = 0x4252_4353_4b4c_425f; // "_BLKSCRB" LE

/// Byte offsets of the superblock copies; copies beyond the device end
/// simply do not exist.
pub const SUPER_OFFSETS: [u64; 3] = [64 * 1024, 64 * 1024 * 1024, 256 * 1024 * 1024 * 1024];

/// Size of one superblock copy on disk.
pub const SUPER_INFO_SIZE: u64 = PAGE_SIZE;

/// Header embedded at the start of every tree block. The crc covers
/// everything after the checksum field up to the node size.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TreeBlockHeader {
    pub csum: U32,
    pub fsid: [u8; 16],
    pub bytenr: U64,
    pub generation: U64,
    pub chunk_tree_uuid: [u8; 16],
}

/// Header of a superblock copy.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SuperBlockHeader {
    pub csum: U32,
    pub fsid: [u8; 16],
    pub bytenr: U64,
    pub generation: U64,
    pub magic: U64,
}

impl TreeBlockHeader {
    /// Stamp a valid header (including its crc) onto a node-sized
    /// buffer whose payload is already in place.
    pub fn compose(
        block: &mut [u8],
        fsid: [u8; 16],
        chunk_tree_uuid: [u8; 16],
        bytenr: u64,
        generation: u64,
    ) {
        let header = TreeBlockHeader {
            csum: U32::new(0),
            fsid,
            bytenr: U64::new(bytenr),
            generation: U64::new(generation),
            chunk_tree_uuid,
        };
        let bytes = header.as_bytes();
        block[..bytes.len()].copy_from_slice(bytes);
        let crc = compute_header_csum(block);
        block[..CSUM_SIZE].copy_from_slice(&crc.to_le_bytes());
    }
}

impl SuperBlockHeader {
    /// Stamp a valid superblock copy onto a page-sized buffer.
    pub fn compose(page: &mut [u8], fsid: [u8; 16], bytenr: u64, generation: u64) {
        let header = SuperBlockHeader {
            csum: U32::new(0),
            fsid,
            bytenr: U64::new(bytenr),
            generation: U64::new(generation),
            magic: U64::new(SUPER_MAGIC),
        };
        let bytes = header.as_bytes();
        page[..bytes.len()].copy_from_slice(bytes);
        let crc = compute_header_csum(&page[..SUPER_INFO_SIZE as usize]);
        page[..CSUM_SIZE].copy_from_slice(&crc.to_le_bytes());
    }
}

/// crc32c over a data sector.
pub fn compute_data_csum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// crc32c over a header-carrying block: everything past the stored
/// checksum.
pub fn compute_header_csum(block_bytes: &[u8]) -> u32 {
    crc32c::crc32c(&block_bytes[CSUM_SIZE..])
}

/// Verify `block` according to its kind. Returns true when the block
/// failed and the repair path should run. Superblock failures are
/// counted here and never repaired.
pub(crate) fn scrub_checksum(ctx: &ScrubContext, block: &ScrubBlock) -> bool {
    match block.kind() {
        ExtentKind::Data => checksum_data(ctx, block),
        ExtentKind::TreeBlock => checksum_tree_block(ctx, block),
        ExtentKind::Super => {
            checksum_super(ctx, block);
            false
        }
    }
}

/// Data block verify. A block without a stored checksum cannot fail.
fn checksum_data(ctx: &ScrubContext, block: &ScrubBlock) -> bool {
    let page0 = block.page(0);
    let Some(on_disk) = page0.csum else {
        return false;
    };

    let computed = compute_data_csum(&page0.data());
    if computed == on_disk {
        return false;
    }

    // The held checksum may be stale if the extent was rewritten since
    // the stripe's csums were fetched. Refresh it once before declaring
    // corruption (data only; metadata has no such window).
    let fresh = ctx
        .fs
        .lookup_csums(page0.logical, page0.logical + PAGE_SIZE)
        .ok()
        .and_then(|runs| {
            runs.into_iter().find_map(|run| {
                let idx = page0.logical.checked_sub(run.bytenr)? / PAGE_SIZE;
                run.sums.get(idx as usize).copied()
            })
        });

    match fresh {
        Some(fresh_csum) if computed == fresh_csum => {
            ctx.with_stats(|s| s.sync_errors += 1);
            false
        }
        _ => {
            block.set_checksum_error();
            true
        }
    }
}

/// Tree block verify: header field checks plus crc over the block.
fn checksum_tree_block(ctx: &ScrubContext, block: &ScrubBlock) -> bool {
    let page0 = block.page(0);
    let data0 = page0.data();
    let Ok((header, _)) = TreeBlockHeader::ref_from_prefix(&data0) else {
        block.set_header_error();
        return true;
    };

    let mut fail = false;
    if header.bytenr.get() != page0.logical {
        block.set_header_error();
        fail = true;
    }
    if header.generation.get() != page0.generation {
        block.set_generation_error();
        fail = true;
    }
    if header.fsid != ctx.fs.fsid() {
        block.set_header_error();
        fail = true;
    }
    if header.chunk_tree_uuid != ctx.fs.chunk_tree_uuid() {
        block.set_header_error();
        fail = true;
    }
    let on_disk = header.csum.get();
    drop(data0);

    if block_header_crc(block) != on_disk {
        block.set_checksum_error();
        fail = true;
    }

    fail
}

/// Super block verify; errors are only counted, the next commit
/// rewrites the copies anyway.
fn checksum_super(ctx: &ScrubContext, block: &ScrubBlock) -> bool {
    let page0 = block.page(0);
    let data0 = page0.data();
    let Ok((header, _)) = SuperBlockHeader::ref_from_prefix(&data0) else {
        ctx.with_stats(|s| s.super_errors += 1);
        return true;
    };

    let mut fail_cor = false;
    let mut fail_gen = false;
    if header.magic.get() != SUPER_MAGIC {
        fail_cor = true;
    }
    if header.bytenr.get() != page0.logical {
        fail_cor = true;
    }
    if header.fsid != ctx.fs.fsid() {
        fail_cor = true;
    }
    if header.generation.get() != ctx.fs.super_generation() {
        fail_gen = true;
    }
    let on_disk = header.csum.get();
    drop(data0);

    if compute_header_csum(&block.page(0).data()[..SUPER_INFO_SIZE as usize]) != on_disk {
        fail_cor = true;
    }

    if fail_cor || fail_gen {
        ctx.with_stats(|s| s.super_errors += 1);
        return true;
    }
    false
}

/// crc over a header-carrying multi-page block, skipping the stored
/// checksum field.
fn block_header_crc(block: &ScrubBlock) -> u32 {
    let mut crc = 0u32;
    for (i, page) in block.pages().iter().enumerate() {
        let data = page.data();
        let slice: &[u8] = if i == 0 { &data[CSUM_SIZE..] } else { &data };
        crc = crc32c::crc32c_append(crc, slice);
    }
    crc
}

/// Recompute the checksum state of an already-read block without any
/// stats side effects, for use by the repair path's rechecks.
pub(crate) fn verify_quiet(ctx: &ScrubContext, block: &ScrubBlock) -> bool {
    match block.kind() {
        ExtentKind::Data => {
            let page0 = block.page(0);
            match page0.csum {
                Some(on_disk) => {
                    let ok = compute_data_csum(&page0.data()) == on_disk;
                    if !ok {
                        block.set_checksum_error();
                    }
                    ok
                }
                None => true,
            }
        }
        ExtentKind::TreeBlock => {
            let page0 = block.page(0);
            let data0 = page0.data();
            let Ok((header, _)) = TreeBlockHeader::ref_from_prefix(&data0) else {
                block.set_header_error();
                return false;
            };
            let mut ok = true;
            if header.bytenr.get() != page0.logical {
                block.set_header_error();
                ok = false;
            }
            if header.generation.get() != page0.generation {
                block.set_generation_error();
                ok = false;
            }
            if header.fsid != ctx.fs.fsid() {
                block.set_header_error();
                ok = false;
            }
            if header.chunk_tree_uuid != ctx.fs.chunk_tree_uuid() {
                block.set_header_error();
                ok = false;
            }
            let on_disk = header.csum.get();
            drop(data0);
            if block_header_crc(block) != on_disk {
                block.set_checksum_error();
                ok = false;
            }
            ok
        }
        ExtentKind::Super => true,
    }
}
