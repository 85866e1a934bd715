//! Pass 0 — leaf recovery (spec §4.5). Scans every block in the supplied
//! bitmap, classifies it, strips sentinel/safe-link trash and items that
//! fail their own invariants, and records the blocks that still hold at
//! least one good item in `leaves`.

use std::cmp::Ordering;

use log::debug;

use super::super::bitmap::Bitmap;
use super::super::block_io::BlockDevice;
use super::super::ctx::FsckCtx;
use super::super::error::CoreResult;
use super::super::hash::HashSelector;
use super::super::item::{DirectoryItem, Extent};
use super::super::key::{compare_full, Key, KeyFormat};
use super::super::node::{classify, read_item_header, BlockHeader, BlockKind, BLOCK_HEADER_SIZE};
use super::super::objectid::ObjectIdMap;
use super::super::reporter::Reporter;
use super::rebuild_leaf_buf;

pub struct Pass0Output {
    pub leaves: Bitmap,
    pub good_unfm: Bitmap,
    pub bad_unfm: Bitmap,
    pub proper_id_map: ObjectIdMap,
    pub hash_selector: HashSelector,
}

pub fn pass0_scan<D: BlockDevice, R: Reporter>(ctx: &mut FsckCtx<D, R>, scan: &Bitmap) -> CoreResult<Pass0Output> {
    let bs = ctx.blocksize as usize;
    let mut leaves = Bitmap::new(ctx.block_count);
    let mut good_unfm = Bitmap::new(ctx.block_count);
    let mut bad_unfm = Bitmap::new(ctx.block_count);
    let mut proper_id_map = ObjectIdMap::new();
    let mut hash_selector = HashSelector::new();

    for block in scan.iter_set() {
        if block >= ctx.block_count || ctx.reserved.test(block) {
            continue;
        }
        let buf = ctx.read_block(block)?;
        if !matches!(classify(&buf, bs), BlockKind::Leaf | BlockKind::ItemArrayOnly) {
            continue;
        }

        let nr = BlockHeader::read(&buf).nr_items as usize;
        if nr == 0 {
            continue;
        }

        let mut kept: Vec<(Key, KeyFormat, u32, Vec<u8>)> = Vec::with_capacity(nr);
        for i in 0..nr {
            if BLOCK_HEADER_SIZE + (i + 1) * super::super::node::ITEM_HEADER_SIZE > bs {
                break;
            }
            let ih = read_item_header(&buf, i);

            // sentinel trash (dir_id 0) and safe-link items do not belong
            // in a rebuilt tree's regular leaves (spec §4.5 step 1)
            if ih.key.dir_id == 0 || ih.key.is_safe_link() || !ih.key.short_key_valid() {
                continue;
            }
            let loc = ih.item_location as usize;
            let len = ih.item_len as usize;
            if loc < BLOCK_HEADER_SIZE || loc + len > bs {
                continue;
            }
            let mut body = buf[loc..loc + len].to_vec();

            if ih.key.is_direntry() {
                let Some(dir) = DirectoryItem::parse(&body, ih.extra as usize) else { continue };
                if dir.entries.is_empty() {
                    continue;
                }
                for (deh, name) in &dir.entries {
                    hash_selector.observe(name, deh.deh_offset);
                }
            } else if ih.key.is_extent() {
                if body.len() % 4 != 0 {
                    continue;
                }
                if let Some(mut extent) = Extent::read(&body) {
                    let mut changed = false;
                    for ptr in extent.pointers.iter_mut() {
                        if *ptr == 0 {
                            continue;
                        }
                        let pb = *ptr as u64;
                        if pb >= ctx.block_count || ctx.reserved.test(pb) {
                            *ptr = 0;
                            changed = true;
                            continue;
                        }
                        if good_unfm.test(pb) {
                            good_unfm.clear(pb);
                            bad_unfm.set(pb);
                        } else if !bad_unfm.test(pb) {
                            good_unfm.set(pb);
                        }
                    }
                    if changed {
                        body = extent.write();
                    }
                }
            }

            kept.push((ih.key, ih.format, ih.extra, body));
        }

        if kept.is_empty() {
            continue;
        }

        kept.sort_by(|a, b| compare_full(&a.0, &b.0));
        kept.dedup_by(|a, b| compare_full(&a.0, &b.0) == Ordering::Equal);

        for (key, _, _, _) in &kept {
            if key.is_stat_data() {
                proper_id_map.mark_used(key.object_id);
            }
        }

        let rebuilt = rebuild_leaf_buf(bs, &kept);
        ctx.write_block(block, &rebuilt)?;
        leaves.set(block);
    }

    debug!(
        "pass 0: {} of {} scanned block(s) kept as leaves, {} good unformatted, {} bad unformatted",
        leaves.count_set(), scan.count_set(), good_unfm.count_set(), bad_unfm.count_set()
    );
    Ok(Pass0Output { leaves, good_unfm, bad_unfm, proper_id_map, hash_selector })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_io::{BlockIo, MemDevice};
    use crate::core::item::StatData;
    use crate::core::key::TYPE_STAT_DATA;
    use crate::core::node::LeafViewMut;
    use crate::core::reporter::NullReporter;

    fn mk_ctx(blocksize: u64, blocks: u64) -> FsckCtx<MemDevice, NullReporter> {
        let dev = MemDevice::new(blocksize, blocks);
        let io = BlockIo::new(dev);
        FsckCtx::new(io, NullReporter::default())
    }

    fn sd_key(dir: u32, obj: u32) -> Key {
        let mut k = Key::new(dir, obj, 0);
        k.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
        k
    }

    #[test]
    fn recovers_a_leaf_and_marks_it() {
        let mut ctx = mk_ctx(256, 8);
        let mut buf = vec![0u8; 256];
        {
            let mut leaf = LeafViewMut::new(&mut buf, 256);
            leaf.init_empty();
            let sd = StatData { mode: 0o100644, attrs: 0, nlink: 1, uid: 0, gid: 0, size: 0, atime: 0, mtime: 0, ctime: 0, blocks: 0, rdev_or_first_direct: 0 };
            let mut body = [0u8; 44];
            sd.write(&mut body);
            leaf.insert_item(0, sd_key(1, 2), KeyFormat::V2, 0, &body);
        }
        ctx.write_block(3, &buf).unwrap();

        let mut scan = Bitmap::new(8);
        scan.set(3);
        let out = pass0_scan(&mut ctx, &scan).unwrap();
        assert!(out.leaves.test(3));
        assert!(out.proper_id_map.is_used(2));
    }

    #[test]
    fn drops_safe_link_and_sentinel_items() {
        let mut ctx = mk_ctx(256, 8);
        let mut buf = vec![0u8; 256];
        {
            let mut leaf = LeafViewMut::new(&mut buf, 256);
            leaf.init_empty();
            let mut safe_key = Key::new(u32::MAX, 5, 0);
            safe_key.set_type_and_offset(KeyFormat::V1, 0x1, crate::core::key::TYPE_DIRECT);
            leaf.insert_item(0, safe_key, KeyFormat::V1, 0, b"x");
        }
        ctx.write_block(2, &buf).unwrap();

        let mut scan = Bitmap::new(8);
        scan.set(2);
        let out = pass0_scan(&mut ctx, &scan).unwrap();
        assert!(!out.leaves.test(2));
    }
}
