//! Explicit, non-global context threading the device, buffer access,
//! auxiliary bitmaps, objectid map, hash, and reporter through every
//! component. Spec §9: "pass an explicit FsckCtx ... No statics."

use super::bitmap::Bitmap;
use super::block_io::{BlockDevice, BlockIo};
use super::error::CoreResult;
use super::hash::HashKind;
use super::objectid::ObjectIdMap;
use super::reporter::Reporter;

pub const NO_BLOCK: u64 = u64::MAX;

/// Per-pass accumulator described in spec §7 ("errors fan up to a per-pass
/// accumulator {fatal, fixable}").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Corruptions {
    pub fatal: u64,
    pub fixable: u64,
}

impl Corruptions {
    pub fn merge(&mut self, other: Corruptions) {
        self.fatal += other.fatal;
        self.fixable += other.fixable;
    }
}

pub struct FsckCtx<D: BlockDevice, R: Reporter> {
    pub io: BlockIo<D>,
    pub blocksize: u64,
    pub block_count: u64,
    pub root_block: u64,
    pub tree_height: u16,

    /// On-disk allocation bitmap.
    pub source: Bitmap,
    /// Blocks seen while walking the live tree.
    pub control: Bitmap,
    /// Blocks reserved for super/bitmaps/journal/badblocks — never usable
    /// as a leaf, data block, or allocation target.
    pub reserved: Bitmap,

    // Rebuilder working bitmaps (spec §3 / §4.5-4.10); unused in check mode.
    pub leaves: Bitmap,
    pub good_unfm: Bitmap,
    pub bad_unfm: Bitmap,
    pub uninsertable: Bitmap,
    pub allocable: Bitmap,
    pub new: Bitmap,

    pub oid_map: ObjectIdMap,
    pub hash: HashKind,
    pub reporter: R,
    pub corruptions: Corruptions,

    next_alloc_hint: u64,
}

impl<D: BlockDevice, R: Reporter> FsckCtx<D, R> {
    pub fn new(mut io: BlockIo<D>, reporter: R) -> Self {
        let blocksize = io.blocksize();
        let block_count = io.block_count();
        let _ = &mut io;
        FsckCtx {
            io,
            blocksize,
            block_count,
            root_block: NO_BLOCK,
            tree_height: 0,
            source: Bitmap::new(block_count),
            control: Bitmap::new(block_count),
            reserved: Bitmap::new(block_count),
            leaves: Bitmap::new(block_count),
            good_unfm: Bitmap::new(block_count),
            bad_unfm: Bitmap::new(block_count),
            uninsertable: Bitmap::new(block_count),
            allocable: Bitmap::new(block_count),
            new: Bitmap::new(block_count),
            oid_map: ObjectIdMap::new(),
            hash: HashKind::R5,
            reporter,
            corruptions: Corruptions::default(),
            next_alloc_hint: 0,
        }
    }

    pub fn read_block(&mut self, blk: u64) -> CoreResult<Vec<u8>> {
        self.io.read(blk)
    }

    pub fn write_block(&mut self, blk: u64, data: &[u8]) -> CoreResult<()> {
        self.io.write(blk, data)
    }

    /// Finds `n` zero bits in `allocable` starting near `start`, marks them
    /// used there and in `new`, and returns them. Spec §5's
    /// `new_blocknrs(start, n)`.
    pub fn new_blocknrs(&mut self, start: u64, n: usize) -> Vec<u64> {
        let mut out = Vec::with_capacity(n);
        let mut cursor = start;
        while out.len() < n {
            let Some(b) = self.allocable.first_clear_from(cursor) else { break };
            self.allocable.set(b);
            self.new.set(b);
            out.push(b);
            cursor = b + 1;
        }
        self.next_alloc_hint = cursor;
        out
    }

    /// Inverse of `new_blocknrs`: returns a block to the allocable pool.
    pub fn free_block(&mut self, b: u64) {
        self.allocable.clear(b);
        self.new.clear(b);
    }

    pub fn record_fatal(&mut self) {
        self.corruptions.fatal += 1;
    }

    pub fn record_fixable(&mut self) {
        self.corruptions.fixable += 1;
    }
}
