//! Pass 4 — cleanup (spec §4.10). Deletes whatever the semantic walk
//! never reached, clears the transient `REACHABLE` flag off survivors,
//! re-coalesces extent/direct items pass 2 left split across several
//! piecewise insertions, and squeezes adjacent sibling leaves back
//! together where they now fit in one block after pass 3's deletions
//! shrank them.

use log::debug;

use super::super::block_io::BlockDevice;
use super::super::ctx::{FsckCtx, NO_BLOCK};
use super::super::error::CoreResult;
use super::super::key::{Key, KeyFormat};
use super::super::node::{BlockHeader, ChildDesc, InternalView, InternalViewMut, ItemFlags, LeafView, BLOCK_HEADER_SIZE};
use super::super::reporter::Reporter;
use super::rebuild_leaf_buf;

#[derive(Debug, Default)]
pub struct Pass4Stats {
    pub deleted_unreachable: u64,
    pub merged_items: u64,
    pub merged_leaves: u64,
}

pub fn pass4_cleanup<D: BlockDevice, R: Reporter>(ctx: &mut FsckCtx<D, R>) -> CoreResult<Pass4Stats> {
    let mut stats = Pass4Stats::default();
    if ctx.root_block == NO_BLOCK {
        return Ok(stats);
    }

    strip_and_squeeze(ctx, ctx.root_block, &mut stats)?;
    ctx.source = ctx.new.clone();
    debug!(
        "pass 4: {} unreachable item(s) deleted, {} item(s) coalesced, {} leaves merged",
        stats.deleted_unreachable, stats.merged_items, stats.merged_leaves
    );
    Ok(stats)
}

fn strip_and_squeeze<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    block: u64,
    stats: &mut Pass4Stats,
) -> CoreResult<()> {
    let bs = ctx.blocksize as usize;
    let buf = ctx.read_block(block)?;
    let head = BlockHeader::read(&buf);

    if head.is_leaf() {
        return strip_leaf(ctx, block, stats);
    }

    let nr = InternalView::new(&buf, bs).nr_items();
    let children: Vec<ChildDesc> = (0..=nr).map(|i| InternalView::new(&buf, bs).child(i)).collect();

    for child in &children {
        strip_and_squeeze(ctx, child.block, stats)?;
    }

    refresh_child_sizes(ctx, block)?;
    squeeze_children(ctx, block, stats)
}

/// Pass 4 shrinks children in place (stripped items, coalesced extents) but
/// never rewrites itself into the parent, so `block`'s recorded
/// `ChildDesc.size` per child drifts stale. Recomputes it here from each
/// child's actual used space before `squeeze_children` decides who still
/// fits together.
fn refresh_child_sizes<D: BlockDevice, R: Reporter>(ctx: &mut FsckCtx<D, R>, block: u64) -> CoreResult<()> {
    let bs = ctx.blocksize as usize;
    let mut buf = ctx.read_block(block)?;
    let nr = InternalView::new(&buf, bs).nr_items();

    let mut fixups = Vec::new();
    for i in 0..=nr {
        let child = InternalView::new(&buf, bs).child(i);
        let child_buf = ctx.read_block(child.block)?;
        let actual = (bs - BLOCK_HEADER_SIZE - BlockHeader::read(&child_buf).free_space as usize) as u32;
        if actual != child.size {
            fixups.push((i, ChildDesc { block: child.block, size: actual }));
        }
    }
    if !fixups.is_empty() {
        let mut iv = InternalViewMut::new(&mut buf, bs);
        for (i, c) in fixups {
            iv.set_child(i, c);
        }
        drop(iv);
        ctx.write_block(block, &buf)?;
    }
    Ok(())
}

fn strip_leaf<D: BlockDevice, R: Reporter>(ctx: &mut FsckCtx<D, R>, block: u64, stats: &mut Pass4Stats) -> CoreResult<()> {
    let bs = ctx.blocksize as usize;
    let buf = ctx.read_block(block)?;
    let view = LeafView::new(&buf, bs);
    let nr = view.nr_items();
    let mut kept = Vec::with_capacity(nr);
    for i in 0..nr {
        let ih = view.item_header(i);
        if !ih.flags.contains(ItemFlags::REACHABLE) {
            stats.deleted_unreachable += 1;
            continue;
        }
        kept.push((ih.key, ih.format, ih.extra, view.item_body(i).to_vec()));
    }
    drop(view);

    let before = kept.len();
    let kept = merge_contiguous_items(kept);
    stats.merged_items += (before - kept.len()) as u64;
    let rebuilt = rebuild_leaf_buf(bs, &kept);
    ctx.write_block(block, &rebuilt)
}

/// Coalesces adjacent extent/direct items left over from pass 2's
/// piecewise per-item insertion: same object, same item type, and the
/// right item's offset picking up exactly where the left one's coverage
/// ends (one extent pointer slot per offset unit; one byte per offset unit
/// for direct items). `kept` is already in ascending key order, so only
/// neighbors ever need comparing.
fn merge_contiguous_items(kept: Vec<(Key, KeyFormat, u32, Vec<u8>)>) -> Vec<(Key, KeyFormat, u32, Vec<u8>)> {
    let mut merged: Vec<(Key, KeyFormat, u32, Vec<u8>)> = Vec::with_capacity(kept.len());
    for (key, format, extra, body) in kept {
        if let Some((prev_key, _, _, prev_body)) = merged.last_mut() {
            let same_object = prev_key.short() == key.short();
            let mergeable = if same_object && prev_key.is_extent() && key.is_extent() {
                let prev_slots = (prev_body.len() / 4) as u64;
                key.offset() == prev_key.offset() + prev_slots
            } else if same_object && prev_key.is_direct() && key.is_direct() {
                key.offset() == prev_key.offset() + prev_body.len() as u64
            } else {
                false
            };
            if mergeable {
                prev_body.extend_from_slice(&body);
                continue;
            }
        }
        merged.push((key, format, extra, body));
    }
    merged
}

/// Repeatedly scans `parent_block`'s children for an adjacent leaf pair
/// that now fits in one block and merges them, removing the absorbed
/// sibling's delimiting key/child from the parent. Restarts the scan
/// after each merge since positions shift (spec §4.10, scoped to
/// same-parent siblings only — no cross-subtree squeeze).
fn squeeze_children<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    parent_block: u64,
    stats: &mut Pass4Stats,
) -> CoreResult<()> {
    let bs = ctx.blocksize as usize;
    loop {
        let buf = ctx.read_block(parent_block)?;
        let view = InternalView::new(&buf, bs);
        let nr = view.nr_items();

        let mut merge_at = None;
        for i in 0..nr {
            let left = view.child(i).block;
            let right = view.child(i + 1).block;
            let left_is_leaf = BlockHeader::read(&ctx.read_block(left)?).is_leaf();
            let right_is_leaf = BlockHeader::read(&ctx.read_block(right)?).is_leaf();
            if left_is_leaf && right_is_leaf && ctx.leaves_mergeable(left, right)? {
                merge_at = Some((i, left, right));
                break;
            }
        }
        drop(view);

        let Some((i, left, right)) = merge_at else { break };
        ctx.merge_leaves(left, right)?;

        let left_buf = ctx.read_block(left)?;
        let left_size = (bs - BLOCK_HEADER_SIZE - BlockHeader::read(&left_buf).free_space as usize) as u32;

        let mut parent_buf = ctx.read_block(parent_block)?;
        {
            let mut iv = InternalViewMut::new(&mut parent_buf, bs);
            iv.remove_pointer(i);
            iv.set_child(i, ChildDesc { block: left, size: left_size });
        }
        ctx.write_block(parent_block, &parent_buf)?;
        stats.merged_leaves += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_io::{BlockIo, MemDevice};
    use crate::core::item::StatData;
    use crate::core::key::{Key, KeyFormat, TYPE_STAT_DATA};
    use crate::core::node::LeafViewMut;
    use crate::core::reporter::NullReporter;

    fn mk_ctx(blocksize: u64, blocks: u64) -> FsckCtx<MemDevice, NullReporter> {
        let dev = MemDevice::new(blocksize, blocks);
        let io = BlockIo::new(dev);
        FsckCtx::new(io, NullReporter::default())
    }

    #[test]
    fn strips_unreached_item_and_clears_flag_on_survivor() {
        let mut ctx = mk_ctx(256, 8);
        let root = ctx.new_blocknrs(0, 1)[0];
        let mut buf = vec![0u8; 256];
        {
            let mut leaf = LeafViewMut::new(&mut buf, 256);
            leaf.init_empty();
            let sd = StatData { mode: 0o100644, attrs: 0, nlink: 1, uid: 0, gid: 0, size: 0, atime: 0, mtime: 0, ctime: 0, blocks: 0, rdev_or_first_direct: 0 };
            let mut body = [0u8; 44];
            sd.write(&mut body);

            let mut k1 = Key::new(1, 2, 0);
            k1.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
            leaf.insert_item(0, k1, KeyFormat::V2, 0, &body);

            let mut k2 = Key::new(1, 3, 0);
            k2.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
            leaf.insert_item(1, k2, KeyFormat::V2, 0, &body);
            let mut ih = leaf.item_header(1);
            ih.flags |= ItemFlags::REACHABLE;
            crate::core::node::write_item_header(leaf.buf, 1, &ih);
        }
        ctx.write_block(root, &buf).unwrap();
        ctx.root_block = root;
        ctx.tree_height = 1;
        ctx.new.set(root);

        let stats = pass4_cleanup(&mut ctx).unwrap();
        assert_eq!(stats.deleted_unreachable, 1);

        let rb = ctx.read_block(root).unwrap();
        let view = LeafView::new(&rb, 256);
        assert_eq!(view.nr_items(), 1);
        assert!(!view.item_header(0).flags.contains(ItemFlags::REACHABLE));
    }

    #[test]
    fn merges_contiguous_extent_items_split_by_piecewise_insertion() {
        use crate::core::key::TYPE_EXTENT;

        let mut k0 = Key::new(1, 5, 0);
        k0.set_type_and_offset(KeyFormat::V2, 0, TYPE_EXTENT);
        let mut k1 = Key::new(1, 5, 0);
        k1.set_type_and_offset(KeyFormat::V2, 2, TYPE_EXTENT);
        // a third, unrelated item for a different object must survive untouched
        let mut k2 = Key::new(1, 6, 0);
        k2.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);

        let kept = vec![
            (k0, KeyFormat::V2, 0, vec![1, 0, 0, 0, 2, 0, 0, 0]), // two pointer slots: offsets 0,1
            (k1, KeyFormat::V2, 0, vec![3, 0, 0, 0]),             // one pointer slot at offset 2 — contiguous
            (k2, KeyFormat::V2, 0, vec![0u8; 44]),
        ];
        let merged = merge_contiguous_items(kept);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].0, k0);
        assert_eq!(merged[0].3, vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(merged[1].0, k2);
    }

    #[test]
    fn does_not_merge_extent_items_with_a_gap() {
        use crate::core::key::TYPE_EXTENT;

        let mut k0 = Key::new(1, 5, 0);
        k0.set_type_and_offset(KeyFormat::V2, 0, TYPE_EXTENT);
        let mut k1 = Key::new(1, 5, 0);
        k1.set_type_and_offset(KeyFormat::V2, 3, TYPE_EXTENT); // should be 1, not 3: gap
        let kept = vec![(k0, KeyFormat::V2, 0, vec![1, 0, 0, 0]), (k1, KeyFormat::V2, 0, vec![2, 0, 0, 0])];
        let merged = merge_contiguous_items(kept);
        assert_eq!(merged.len(), 2);
    }
}
