//! In-memory filesystem fixture for scrub integration tests.
//!
//! Models one chunk mirrored (RAID1) across two `MemDevice`s, with a
//! data/metadata extent layout, per-page checksums and superblock
//! copies, behind the `ScrubFilesystem` collaborator traits.

use std::collections::BTreeMap;
use std::sync::Arc;

use blkscrub::checksum::{SUPER_INFO_SIZE, SUPER_OFFSETS, SuperBlockHeader, TreeBlockHeader, compute_data_csum};
use blkscrub::device::{BlockDevice, MemDevice};
use blkscrub::error::ScrubError;
use blkscrub::fs::{
    BlockMapping, CsumRun, DeviceChunk, DeviceId, ExtentItem, ExtentKind, MapMode, MirrorLocation,
    PAGE_SIZE, PageMapping, RaidProfile, ScrubFilesystem, Stripe, StripeMap,
};
use blkscrub::walker::NODE_SIZE;
use parking_lot::Mutex;

/// Stripe length of the fixture chunk.
pub const STRIPE_LEN: u64 = 64 * 1024;

/// Logical address where the fixture chunk starts.
pub const CHUNK_LOGICAL: u64 = 1 << 20;

/// Device offset where the fixture chunk starts (leaves room for the
/// first superblock copy).
pub const DEV_DATA_START: u64 = 1 << 20;

pub const FSID: [u8; 16] = *b"blkscrub-test-fs";
pub const CHUNK_UUID: [u8; 16] = *b"blkscrub-chunk-u";
pub const GENERATION: u64 = 7;

pub struct MemFs {
    devices: Vec<Arc<MemDevice>>,
    chunk_len: u64,
    extents: Vec<ExtentItem>,
    csums: Vec<CsumRun>,
    /// ino -> (logical start, byte length)
    inodes: BTreeMap<u64, (u64, u64)>,
    nodatasum_fixups: Mutex<Vec<(u64, u64, u8)>>,
}

impl MemFs {
    fn logical_to_dev_offset(&self, logical: u64) -> u64 {
        DEV_DATA_START + (logical - CHUNK_LOGICAL)
    }

    pub fn device_arc(&self, id: DeviceId) -> Arc<MemDevice> {
        Arc::clone(&self.devices[id as usize])
    }

    /// Physical offset of a logical address, valid on every mirror.
    pub fn physical_of(&self, logical: u64) -> u64 {
        self.logical_to_dev_offset(logical)
    }

    pub fn total_data_bytes(&self) -> u64 {
        self.extents
            .iter()
            .filter(|e| e.kind == ExtentKind::Data)
            .map(|e| e.len)
            .sum()
    }

    pub fn total_tree_bytes(&self) -> u64 {
        self.extents
            .iter()
            .filter(|e| e.kind == ExtentKind::TreeBlock)
            .map(|e| e.len)
            .sum()
    }

    pub fn chunk_len(&self) -> u64 {
        self.chunk_len
    }

    pub fn queued_fixups(&self) -> Vec<(u64, u64, u8)> {
        self.nodatasum_fixups.lock().clone()
    }

    /// Corrupt the copy of `logical` on one device only.
    pub fn corrupt_data(&self, dev: DeviceId, logical: u64, len: usize) {
        let physical = self.logical_to_dev_offset(logical);
        self.devices[dev as usize].patch(physical, &vec![0xCC; len]);
    }
}

pub struct FixtureBuilder {
    dev_size: u64,
    chunk_len: u64,
    extents: Vec<ExtentItem>,
    csums: Vec<CsumRun>,
    inodes: BTreeMap<u64, (u64, u64)>,
    contents: Vec<(u64, Vec<u8>)>,
    next_logical: u64,
    next_ino: u64,
}

impl FixtureBuilder {
    pub fn new(chunk_len: u64) -> Self {
        assert_eq!(chunk_len % STRIPE_LEN, 0);
        FixtureBuilder {
            dev_size: DEV_DATA_START + chunk_len,
            chunk_len,
            extents: Vec::new(),
            csums: Vec::new(),
            inodes: BTreeMap::new(),
            contents: Vec::new(),
            next_logical: CHUNK_LOGICAL,
            next_ino: 257,
        }
    }

    /// Append a checksummed data extent backed by one inode. Returns
    /// (ino, logical start).
    pub fn add_data_extent(&mut self, len: u64) -> (u64, u64) {
        assert_eq!(len % PAGE_SIZE, 0);
        let logical = self.next_logical;
        let ino = self.next_ino;
        self.next_logical += len;
        self.next_ino += 1;

        let mut data = vec![0u8; len as usize];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i as u64 % 251) as u8 ^ (ino as u8);
        }

        let sums = data
            .chunks_exact(PAGE_SIZE as usize)
            .map(compute_data_csum)
            .collect();
        self.csums.push(CsumRun {
            bytenr: logical,
            sums,
        });
        self.extents.push(ExtentItem {
            logical,
            len,
            kind: ExtentKind::Data,
            generation: GENERATION,
        });
        self.inodes.insert(ino, (logical, len));
        self.contents.push((logical, data));
        (ino, logical)
    }

    /// Append a data extent without checksums (nodatasum).
    pub fn add_nocsum_extent(&mut self, len: u64) -> u64 {
        assert_eq!(len % PAGE_SIZE, 0);
        let logical = self.next_logical;
        self.next_logical += len;

        let data = vec![0x5A; len as usize];
        self.extents.push(ExtentItem {
            logical,
            len,
            kind: ExtentKind::Data,
            generation: GENERATION,
        });
        self.contents.push((logical, data));
        logical
    }

    /// Append a metadata extent of `nodes` tree blocks.
    pub fn add_tree_extent(&mut self, nodes: usize) -> u64 {
        let len = nodes as u64 * NODE_SIZE;
        let logical = self.next_logical;
        self.next_logical += len;

        let mut data = vec![0u8; len as usize];
        for node in 0..nodes {
            let off = node * NODE_SIZE as usize;
            let node_logical = logical + off as u64;
            let block = &mut data[off..off + NODE_SIZE as usize];
            for (i, byte) in block.iter_mut().enumerate().skip(64) {
                *byte = (i % 191) as u8;
            }
            TreeBlockHeader::compose(block, FSID, CHUNK_UUID, node_logical, GENERATION);
        }

        self.extents.push(ExtentItem {
            logical,
            len,
            kind: ExtentKind::TreeBlock,
            generation: GENERATION,
        });
        self.contents.push((logical, data));
        logical
    }

    /// Materialize the filesystem over `mirrors` identical devices.
    pub fn build(self, mirrors: usize) -> Arc<MemFs> {
        assert!(mirrors >= 1);
        assert!(self.next_logical <= CHUNK_LOGICAL + self.chunk_len);

        let devices: Vec<Arc<MemDevice>> = (0..mirrors)
            .map(|id| Arc::new(MemDevice::new(id as DeviceId, self.dev_size as usize)))
            .collect();

        // Superblock copies plus extent payloads, mirrored everywhere.
        let mut super_page = vec![0u8; SUPER_INFO_SIZE as usize];
        for dev in &devices {
            for &bytenr in SUPER_OFFSETS.iter() {
                if bytenr + SUPER_INFO_SIZE > self.dev_size {
                    break;
                }
                super_page.fill(0);
                SuperBlockHeader::compose(&mut super_page, FSID, bytenr, GENERATION);
                dev.patch(bytenr, &super_page);
            }
            for (logical, data) in &self.contents {
                let physical = DEV_DATA_START + (logical - CHUNK_LOGICAL);
                dev.patch(physical, data);
            }
        }

        Arc::new(MemFs {
            devices,
            chunk_len: self.chunk_len,
            extents: self.extents,
            csums: self.csums,
            inodes: self.inodes,
            nodatasum_fixups: Mutex::new(Vec::new()),
        })
    }
}

impl ScrubFilesystem for MemFs {
    fn device(&self, dev: DeviceId) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .get(dev as usize)
            .map(|d| Arc::clone(d) as Arc<dyn BlockDevice>)
    }

    fn device_chunks(
        &self,
        dev: DeviceId,
        start: u64,
        end: u64,
    ) -> Result<Vec<DeviceChunk>, ScrubError> {
        if (dev as usize) >= self.devices.len() {
            return Ok(Vec::new());
        }
        let chunk = DeviceChunk {
            dev_offset: DEV_DATA_START,
            length: self.chunk_len,
            chunk_offset: CHUNK_LOGICAL,
        };
        if chunk.dev_offset < end && start < chunk.dev_offset + chunk.length {
            Ok(vec![chunk])
        } else {
            Ok(Vec::new())
        }
    }

    fn chunk_stripes(&self, chunk_offset: u64) -> Result<StripeMap, ScrubError> {
        if chunk_offset != CHUNK_LOGICAL {
            return Err(ScrubError::Map("unknown chunk"));
        }
        let profile = if self.devices.len() > 1 {
            RaidProfile::Raid1
        } else {
            RaidProfile::Single
        };
        Ok(StripeMap {
            profile,
            stripe_len: STRIPE_LEN,
            sub_stripes: 1,
            stripes: self
                .devices
                .iter()
                .map(|d| Stripe {
                    dev: d.id(),
                    physical: DEV_DATA_START,
                })
                .collect(),
        })
    }

    fn extents_in_range(&self, start: u64, end: u64) -> Result<Vec<ExtentItem>, ScrubError> {
        Ok(self
            .extents
            .iter()
            .filter(|e| e.logical < end && e.logical + e.len > start)
            .copied()
            .collect())
    }

    fn lookup_csums(&self, start: u64, end: u64) -> Result<Vec<CsumRun>, ScrubError> {
        Ok(self
            .csums
            .iter()
            .filter(|run| run.bytenr < end && run.bytenr + run.len_bytes() > start)
            .cloned()
            .collect())
    }

    fn map_block(
        &self,
        logical: u64,
        len: u64,
        mode: MapMode,
    ) -> Result<BlockMapping, ScrubError> {
        if logical < CHUNK_LOGICAL || logical >= CHUNK_LOGICAL + self.chunk_len {
            return Err(ScrubError::Map("logical outside any chunk"));
        }
        let offset = logical - CHUNK_LOGICAL;
        let mapped_len = len.min(self.chunk_len - offset);

        let mut mirrors: Vec<MirrorLocation> = self
            .devices
            .iter()
            .map(|d| MirrorLocation {
                dev: d.id(),
                physical: DEV_DATA_START + offset,
            })
            .collect();
        if mode == MapMode::Read {
            mirrors.truncate(1);
        }
        Ok(BlockMapping {
            mapped_len,
            mirrors,
        })
    }

    fn page_location(
        &self,
        ino: u64,
        page_index: u64,
    ) -> Result<Option<PageMapping>, ScrubError> {
        let Some(&(start, len)) = self.inodes.get(&ino) else {
            return Ok(None);
        };
        let offset = page_index * PAGE_SIZE;
        if offset >= len {
            return Ok(None);
        }
        Ok(Some(PageMapping {
            logical: start + offset,
            faulted_from_disk: false,
        }))
    }

    fn queue_nodatasum_fixup(&self, logical: u64, len: u64, failed_mirror: u8) {
        self.nodatasum_fixups
            .lock()
            .push((logical, len, failed_mirror));
    }

    fn fsid(&self) -> [u8; 16] {
        FSID
    }

    fn chunk_tree_uuid(&self) -> [u8; 16] {
        CHUNK_UUID
    }

    fn super_generation(&self) -> u64 {
        GENERATION
    }
}
