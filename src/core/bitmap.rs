//! Fixed-size bit array tracking block usage, with the two on-disk bitmap
//! layouts used by the filesystem: one bitmap block immediately after the
//! superblock ("non-spread"), or one bitmap block per `blocksize * 8` blocks
//! scattered across the device ("spread").

use byteorder::{ByteOrder, LittleEndian};

use super::block_io::BlockDevice;
use super::error::CoreResult;

/// How bitmap blocks are laid out on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmapLayout {
    /// All bitmap blocks packed contiguously starting right after the
    /// superblock block.
    Contiguous { first_bitmap_block: u64 },
    /// One bitmap block per block-group, interleaved with data.
    Spread { blocks_per_bitmap: u64 },
}

impl BitmapLayout {
    /// Block numbers, in order, that hold bitmap data for a bitmap covering
    /// `bit_count` bits at the given blocksize.
    pub fn bitmap_block_numbers(&self, bit_count: u64, blocksize: u64) -> Vec<u64> {
        let bits_per_block = blocksize * 8;
        let nr_bitmaps = bit_count.div_ceil(bits_per_block).max(1);
        match *self {
            BitmapLayout::Contiguous { first_bitmap_block } => {
                (0..nr_bitmaps).map(|i| first_bitmap_block + i).collect()
            }
            BitmapLayout::Spread { blocks_per_bitmap } => {
                (0..nr_bitmaps).map(|i| i * blocks_per_bitmap).collect()
            }
        }
    }
}

/// A fixed-size, word-packed bit array. Bit `i` set means block `i` is in
/// the set this bitmap represents (used blocks for `source`, visited blocks
/// for `control`, etc. — see spec §3).
#[derive(Clone, Debug)]
pub struct Bitmap {
    bits: Vec<u64>,
    len: u64,
}

const WORD_BITS: u64 = 64;

impl Bitmap {
    pub fn new(len: u64) -> Self {
        let words = (len as usize).div_ceil(WORD_BITS as usize);
        Bitmap { bits: vec![0u64; words], len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn word_bit(&self, i: u64) -> (usize, u64) {
        ((i / WORD_BITS) as usize, i % WORD_BITS)
    }

    pub fn test(&self, i: u64) -> bool {
        if i >= self.len {
            return false;
        }
        let (w, b) = self.word_bit(i);
        (self.bits[w] >> b) & 1 != 0
    }

    pub fn set(&mut self, i: u64) {
        assert!(i < self.len, "bit {i} out of range (len {})", self.len);
        let (w, b) = self.word_bit(i);
        self.bits[w] |= 1 << b;
    }

    pub fn clear(&mut self, i: u64) {
        assert!(i < self.len, "bit {i} out of range (len {})", self.len);
        let (w, b) = self.word_bit(i);
        self.bits[w] &= !(1 << b);
    }

    pub fn set_range(&mut self, start: u64, end: u64) {
        for i in start..end {
            self.set(i);
        }
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u64 {
        self.bits.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Number of clear bits among the first `len` bits.
    pub fn count_clear(&self) -> u64 {
        self.len - self.count_set()
    }

    /// Bitwise OR, in place: `self |= other`. Panics on length mismatch.
    pub fn union_with(&mut self, other: &Bitmap) {
        assert_eq!(self.len, other.len);
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
    }

    /// Bitwise AND-NOT, in place: `self &= !other`.
    pub fn subtract(&mut self, other: &Bitmap) {
        assert_eq!(self.len, other.len);
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= !b;
        }
    }

    /// Bitwise AND, in place: `self &= other`.
    pub fn intersect(&mut self, other: &Bitmap) {
        assert_eq!(self.len, other.len);
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= b;
        }
    }

    pub fn invert(&mut self) {
        for w in self.bits.iter_mut() {
            *w = !*w;
        }
        self.mask_tail();
    }

    fn mask_tail(&mut self) {
        let used_bits = self.len % WORD_BITS;
        if used_bits != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u64 << used_bits) - 1;
            }
        }
    }

    /// True iff `self` is a pointwise subset of `other` (every bit set in
    /// `self` is also set in `other`) — the healthy-FS invariant
    /// `control <= source`.
    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        assert_eq!(self.len, other.len);
        self.bits.iter().zip(other.bits.iter()).all(|(a, b)| a & !b == 0)
    }

    /// Disjunction (symmetric difference) as a fresh bitmap: bits set in
    /// exactly one of the two.
    pub fn disjunction(&self, other: &Bitmap) -> Bitmap {
        assert_eq!(self.len, other.len);
        let mut out = self.clone();
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a ^= b;
        }
        out
    }

    pub fn shrink(&mut self, new_len: u64) {
        assert!(new_len <= self.len);
        self.len = new_len;
        self.bits.truncate((new_len as usize).div_ceil(WORD_BITS as usize));
        self.mask_tail();
    }

    pub fn expand(&mut self, new_len: u64) {
        assert!(new_len >= self.len);
        self.len = new_len;
        self.bits.resize((new_len as usize).div_ceil(WORD_BITS as usize), 0);
    }

    /// Find the first clear bit at or after `start`, wrapping once around
    /// the full bitmap. Used by block allocation (`new_blocknrs`).
    pub fn first_clear_from(&self, start: u64) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        let start = start % self.len;
        (start..self.len)
            .chain(0..start)
            .find(|&i| !self.test(i))
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(move |&i| self.test(i))
    }

    /// Serialize as run-length-encoded alternating (used, free) run lengths,
    /// per spec §6's stage-dump format.
    pub fn to_rle(&self) -> Vec<u32> {
        let mut runs = Vec::new();
        let mut cur_set = false;
        let mut run_len: u32 = 0;
        for i in 0..self.len {
            let bit = self.test(i);
            if bit == cur_set {
                run_len += 1;
            } else {
                runs.push(run_len);
                cur_set = bit;
                run_len = 1;
            }
        }
        runs.push(run_len);
        runs
    }

    pub fn from_rle(len: u64, runs: &[u32]) -> Bitmap {
        let mut bm = Bitmap::new(len);
        let mut pos = 0u64;
        let mut cur_set = false;
        for &run in runs {
            if cur_set {
                bm.set_range(pos, (pos + run as u64).min(len));
            }
            pos += run as u64;
            cur_set = !cur_set;
        }
        bm
    }

    /// Reads the on-disk allocation bitmap for a `bit_count`-block device
    /// using `layout`, word-packing each bitmap block's raw bytes directly
    /// (spec §3: the bitmap's in-memory and on-disk representations are the
    /// same packed bit array, just split across one or more blocks).
    pub fn read_from_device<D: BlockDevice>(
        device: &mut D,
        layout: BitmapLayout,
        bit_count: u64,
    ) -> CoreResult<Bitmap> {
        let blocksize = device.blocksize() as usize;
        let words_per_block = blocksize / 8;
        let blocks = layout.bitmap_block_numbers(bit_count, device.blocksize());
        let mut bitmap = Bitmap::new(bit_count);
        for (bi, &block) in blocks.iter().enumerate() {
            let buf = device.read_block(block)?;
            let mut words = vec![0u64; words_per_block];
            LittleEndian::read_u64_into(&buf, &mut words);
            for (wi, w) in words.into_iter().enumerate() {
                let word_idx = bi * words_per_block + wi;
                if word_idx < bitmap.bits.len() {
                    bitmap.bits[word_idx] = w;
                }
            }
        }
        bitmap.mask_tail();
        Ok(bitmap)
    }

    /// Inverse of [`Bitmap::read_from_device`].
    pub fn write_to_device<D: BlockDevice>(&self, device: &mut D, layout: BitmapLayout) -> CoreResult<()> {
        for (block, buf) in self.to_device_blocks(layout, device.blocksize()) {
            device.write_block(block, &buf)?;
        }
        Ok(())
    }

    /// Packs the bitmap into `(block number, raw bytes)` pairs for `layout`,
    /// without needing a live `BlockDevice` — used by callers that write
    /// each block through their own rollback-tracked path instead of a bare
    /// device (e.g. the CLI's free-block-counter repair).
    pub fn to_device_blocks(&self, layout: BitmapLayout, blocksize: u64) -> Vec<(u64, Vec<u8>)> {
        let bs = blocksize as usize;
        let words_per_block = bs / 8;
        let blocks = layout.bitmap_block_numbers(self.len, blocksize);
        blocks
            .iter()
            .enumerate()
            .map(|(bi, &block)| {
                let mut buf = vec![0u8; bs];
                for wi in 0..words_per_block {
                    let word_idx = bi * words_per_block + wi;
                    let w = self.bits.get(word_idx).copied().unwrap_or(0);
                    LittleEndian::write_u64(&mut buf[wi * 8..wi * 8 + 8], w);
                }
                (block, buf)
            })
            .collect()
    }
}
