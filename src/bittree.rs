//! Progress BitTree: a concurrent, range-indexed bitmap tree.
//!
//! The tree tracks, at `range`-byte granularity over a huge key space,
//! which ranges are done (verified or skippable) and, for file-mode
//! tasks, which inodes are relevant. Nodes cover
//! `range * BITS_PER_NODE` consecutive keys each and exist only while
//! they hold at least one set bit: a SET over a missing range inserts a
//! node, a RESET that clears the last bit disposes of it.
//!
//! All mutation goes through a single unified walk held under one mutex,
//! in one of three modes: READ (bit values at one key), CHECK (does an
//! entire range match an expression) and APPLY (update the range).

use std::collections::BTreeMap;

use log::debug;
use parking_lot::Mutex;

use crate::bitmap::{self, BITS_PER_NODE, WORDS_PER_NODE};
use crate::error::ScrubError;
use crate::fs::{Relevance, RelevanceOracle};

const BMAP_READ: u8 = 0x01;
const BMAP_CHECK: u8 = 0x02;
const BMAP_DONE_SET: u8 = 0x04;
const BMAP_DONE_RST: u8 = 0x08;
const BMAP_RELV_SET: u8 = 0x10;
const BMAP_RELV_RST: u8 = 0x20;

/// One element of an update/check expression.
///
/// `Set*` variants set bits on APPLY and expect set bits on CHECK;
/// `Reset*` variants clear bits on APPLY and expect clear bits on CHECK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    SetDone,
    ResetDone,
    SetRelv,
    ResetRelv,
}

impl BitOp {
    fn mask(self) -> u8 {
        match self {
            BitOp::SetDone => BMAP_DONE_SET,
            BitOp::ResetDone => BMAP_DONE_RST,
            BitOp::SetRelv => BMAP_RELV_SET,
            BitOp::ResetRelv => BMAP_RELV_RST,
        }
    }
}

fn expr_mask(expr: &[BitOp], is_file: bool) -> u8 {
    let mask = expr.iter().fold(0, |m, op| m | op.mask());
    if is_file {
        mask
    } else {
        // Block-mode trees have no relevance bitmap.
        mask & !(BMAP_RELV_SET | BMAP_RELV_RST)
    }
}

/// Bit values at a single key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitState {
    pub done: bool,
    /// Always false for block-mode trees.
    pub relv: bool,
}

/// Outcome of the inode-check composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeVerdict {
    /// Relevant and not yet processed: proceed.
    Process,
    /// Irrelevant or already processed: skip.
    Skip,
}

struct BitmapNode {
    done: Box<[u64]>,
    /// Allocated only for file-mode trees.
    relv: Option<Box<[u64]>>,
}

impl BitmapNode {
    fn new(is_file: bool) -> Self {
        let words = || vec![0u64; WORDS_PER_NODE].into_boxed_slice();
        BitmapNode {
            done: words(),
            relv: is_file.then(words),
        }
    }

    fn is_empty(&self) -> bool {
        bitmap::is_empty(&self.done)
            && self.relv.as_deref().is_none_or(bitmap::is_empty)
    }
}

struct TreeInner {
    nodes: BTreeMap<u64, BitmapNode>,
    nodes_max: usize,
}

/// Thread-safe progress bitmap tree keyed by range-aligned node offsets.
pub struct BitTree {
    range: u64,
    is_file: bool,
    inner: Mutex<TreeInner>,
}

impl BitTree {
    /// `range` is the number of key units covered per bit: bytes in block
    /// mode, exactly 1 in file mode (one bit per inode).
    pub fn new(range: u64, is_file: bool) -> Self {
        assert!(range > 0);
        BitTree {
            range,
            is_file,
            inner: Mutex::new(TreeInner {
                nodes: BTreeMap::new(),
                nodes_max: 0,
            }),
        }
    }

    pub fn is_file(&self) -> bool {
        self.is_file
    }

    /// Keys covered by one node.
    fn node_span(&self) -> u64 {
        self.range * BITS_PER_NODE as u64
    }

    /// Read the bit values covering `idx`. A missing node reads as all
    /// clear.
    pub fn read(&self, idx: u64) -> Result<BitState, ScrubError> {
        let r = self.update_tree(idx, 1, BMAP_READ)?;
        Ok(BitState {
            done: r & 0x1 != 0,
            relv: r & 0x2 != 0,
        })
    }

    /// True iff every bit named by `expr` is in its expected state over
    /// the whole of `[idx, idx + len)`. For `Set*` ops a missing node
    /// fails the check; for `Reset*` ops a missing node satisfies it.
    pub fn check(&self, idx: u64, len: u64, expr: &[BitOp]) -> Result<bool, ScrubError> {
        let flags = expr_mask(expr, self.is_file) | BMAP_CHECK;
        Ok(self.update_tree(idx, len, flags)? == 1)
    }

    /// Update `[idx, idx + len)` according to `expr`: create nodes as
    /// needed for `Set*` ops, clear through existing nodes for `Reset*`
    /// ops, and dispose of any node left entirely clear.
    pub fn apply(&self, idx: u64, len: u64, expr: &[BitOp]) -> Result<(), ScrubError> {
        self.update_tree(idx, len, expr_mask(expr, self.is_file))?;
        Ok(())
    }

    pub fn set_done(&self, idx: u64, len: u64) -> Result<(), ScrubError> {
        self.apply(idx, len, &[BitOp::SetDone])
    }

    pub fn unset_done(&self, idx: u64, len: u64) -> Result<(), ScrubError> {
        self.apply(idx, len, &[BitOp::ResetDone])
    }

    /// Clear both bit arrays over the range.
    pub fn clear(&self, idx: u64, len: u64) -> Result<(), ScrubError> {
        self.apply(idx, len, &[BitOp::ResetDone, BitOp::ResetRelv])
    }

    /// Inode-check composite for file-mode trees: classify `ino` through
    /// the relevance oracle the first time it is encountered, then answer
    /// from the bitmaps.
    pub fn check_inode(
        &self,
        ino: u64,
        oracle: &dyn RelevanceOracle,
    ) -> Result<InodeVerdict, ScrubError> {
        if !self.is_file {
            // Block-mode trees answer a plain done-range check.
            return Ok(if self.check(ino, 1, &[BitOp::SetDone])? {
                InodeVerdict::Skip
            } else {
                InodeVerdict::Process
            });
        }

        let state = self.read(ino)?;
        if !state.done && !state.relv {
            // Nothing known about this inode yet.
            return match oracle.classify(ino) {
                Relevance::Relevant => {
                    self.apply(ino, 1, &[BitOp::SetRelv])?;
                    Ok(InodeVerdict::Process)
                }
                Relevance::Irrelevant => {
                    self.apply(ino, 1, &[BitOp::SetDone])?;
                    Ok(InodeVerdict::Skip)
                }
            };
        }

        Ok(if state.done {
            InodeVerdict::Skip
        } else {
            InodeVerdict::Process
        })
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// High-water mark of live nodes over the tree's lifetime.
    pub fn node_count_max(&self) -> usize {
        self.inner.lock().nodes_max
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// The unified walk. Returns the 2-bit state for READ, 0/1 for
    /// CHECK, 0 for a successful update. A zero-length range is a
    /// vacuous success: nothing is touched and CHECK holds.
    fn update_tree(&self, idx: u64, len: u64, flags: u8) -> Result<u8, ScrubError> {
        let span = self.node_span();
        let mut inner = self.inner.lock();
        let mut idx = idx;
        let mut len = if flags & BMAP_READ != 0 { 1 } else { len };
        let mut node_offt = idx - idx % span;

        while len > 0 {
            let found = inner.nodes.contains_key(&node_offt);

            if flags & BMAP_READ != 0 {
                if !found {
                    return Ok(0);
                }
                let node = &inner.nodes[&node_offt];
                let bit = ((idx - node_offt) / self.range) as usize;
                let mut ret = 0u8;
                if let Some(relv) = node.relv.as_deref() {
                    ret |= (bitmap::read_bit(relv, bit)? as u8) << 1;
                }
                ret |= bitmap::read_bit(&node.done, bit)? as u8;
                return Ok(ret);
            }

            // Trim the range to this node and convert to bit space.
            let node_len = (idx + len).min(node_offt + span) - idx;
            let bit_off = ((idx - node_offt) / self.range) as usize;
            let bit_len = node_len.div_ceil(self.range) as usize;

            // Setting (or checking for set) bits first.
            if flags & (BMAP_DONE_SET | BMAP_RELV_SET) != 0 {
                if !found && flags & BMAP_CHECK != 0 {
                    // Looking for set bits in a node that does not exist.
                    return Ok(0);
                }
                if !found {
                    inner.nodes.insert(node_offt, BitmapNode::new(self.is_file));
                    if inner.nodes.len() > inner.nodes_max {
                        inner.nodes_max = inner.nodes.len();
                        debug!(
                            "bittree: {} nodes ({} bytes) live",
                            inner.nodes_max,
                            inner.nodes_max * BITS_PER_NODE / 8
                        );
                    }
                }

                let node = inner.nodes.get_mut(&node_offt).unwrap();
                if flags & BMAP_CHECK == 0 {
                    if self.is_file && flags & BMAP_RELV_SET != 0 {
                        bitmap::set_range(node.relv.as_deref_mut().unwrap(), bit_off, bit_len, true)?;
                    }
                    if flags & BMAP_DONE_SET != 0 {
                        bitmap::set_range(&mut node.done, bit_off, bit_len, true)?;
                    }
                } else {
                    if self.is_file
                        && flags & BMAP_RELV_SET != 0
                        && !bitmap::check_range(node.relv.as_deref().unwrap(), bit_off, bit_len, true)?
                    {
                        return Ok(0);
                    }
                    if flags & BMAP_DONE_SET != 0
                        && !bitmap::check_range(&node.done, bit_off, bit_len, true)?
                    {
                        return Ok(0);
                    }
                }
            }

            // Then clearing (or checking for clear). A missing node
            // already satisfies a reset.
            if found && flags & (BMAP_DONE_RST | BMAP_RELV_RST) != 0 {
                let node = inner.nodes.get_mut(&node_offt).unwrap();
                if flags & BMAP_CHECK == 0 {
                    if self.is_file && flags & BMAP_RELV_RST != 0 {
                        bitmap::set_range(node.relv.as_deref_mut().unwrap(), bit_off, bit_len, false)?;
                    }
                    if flags & BMAP_DONE_RST != 0 {
                        bitmap::set_range(&mut node.done, bit_off, bit_len, false)?;
                    }
                    if node.is_empty() {
                        inner.nodes.remove(&node_offt);
                    }
                } else {
                    if self.is_file
                        && flags & BMAP_RELV_RST != 0
                        && !bitmap::check_range(node.relv.as_deref().unwrap(), bit_off, bit_len, false)?
                    {
                        return Ok(0);
                    }
                    if flags & BMAP_DONE_RST != 0
                        && !bitmap::check_range(&node.done, bit_off, bit_len, false)?
                    {
                        return Ok(0);
                    }
                }
            }

            len -= node_len;
            idx += node_len;
            node_offt = idx;
        }

        Ok(if flags & BMAP_CHECK != 0 { 1 } else { 0 })
    }
}
