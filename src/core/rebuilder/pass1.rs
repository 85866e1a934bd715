//! Pass 1 — leaf grafting (spec §4.6). Re-derives each leaf's directory
//! entries against the selected hash, drops extent pointers that turned
//! out to double as another leaf or a second copy of the same unformatted
//! block, then splices the leaf into the tree as a whole unit where the
//! balance condition allows it.

use std::collections::HashSet;

use log::debug;

use super::super::bitmap::Bitmap;
use super::super::block_io::BlockDevice;
use super::super::ctx::{FsckCtx, NO_BLOCK};
use super::super::error::CoreResult;
use super::super::hash::{hash_name, unpack_hash, HashKind};
use super::super::item::{DirectoryItem, Extent};
use super::super::key::{Key, KeyFormat};
use super::super::node::LeafView;
use super::super::reporter::Reporter;
use super::super::tree_ops::Path;
use super::pass0::Pass0Output;
use super::rebuild_leaf_buf;

pub struct Pass1Output {
    pub uninsertable: Bitmap,
}

pub fn pass1_graft<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    pass0: &Pass0Output,
    selected_hash: HashKind,
) -> CoreResult<Pass1Output> {
    let bs = ctx.blocksize as usize;
    ctx.hash = selected_hash;
    ctx.leaves = pass0.leaves.clone();

    // `allocable` tracks blocks already spoken for (set bit = unavailable):
    // recovered leaves, both kinds of unformatted pointers, and anything
    // reserved for super/bitmap/journal. `new_blocknrs` hands out clear bits.
    let mut allocable = pass0.leaves.clone();
    allocable.union_with(&pass0.bad_unfm);
    allocable.union_with(&pass0.good_unfm);
    allocable.union_with(&ctx.reserved);
    ctx.allocable = allocable;

    let mut new = Bitmap::new(ctx.block_count);
    for b in ctx.reserved.iter_set() {
        new.set(b);
    }
    ctx.new = new;

    let mut uninsertable = Bitmap::new(ctx.block_count);
    let mut bad_unfm_seen: HashSet<u64> = HashSet::new();

    for block in pass0.leaves.iter_set() {
        let buf = ctx.read_block(block)?;
        if !LeafView::new(&buf, bs).is_valid() {
            uninsertable.set(block);
            continue;
        }

        let nr = LeafView::new(&buf, bs).nr_items();
        let mut items: Vec<(Key, KeyFormat, u32, Vec<u8>)> = Vec::with_capacity(nr);
        for i in 0..nr {
            let view = LeafView::new(&buf, bs);
            let ih = view.item_header(i);
            let mut body = view.item_body(i).to_vec();
            drop(view);

            if ih.key.is_direntry() {
                let Some(mut dir) = DirectoryItem::parse(&body, ih.extra as usize) else { continue };
                dir.entries.retain(|(deh, name)| {
                    name.as_slice() == b"."
                        || name.as_slice() == b".."
                        || unpack_hash(deh.deh_offset) == unpack_hash(hash_name(selected_hash, name))
                });
                if dir.entries.is_empty() {
                    continue;
                }
                body = dir.serialize();
            } else if ih.key.is_extent() {
                if let Some(mut extent) = Extent::read(&body) {
                    let mut changed = false;
                    for ptr in extent.pointers.iter_mut() {
                        if *ptr == 0 {
                            continue;
                        }
                        let pb = *ptr as u64;
                        if pass0.leaves.test(pb) {
                            *ptr = 0;
                            changed = true;
                        } else if pass0.bad_unfm.test(pb) && !bad_unfm_seen.insert(pb) {
                            *ptr = 0;
                            changed = true;
                        }
                    }
                    if changed {
                        body = extent.write();
                    }
                }
            }

            items.push((ih.key, ih.format, ih.extra, body));
        }

        if items.is_empty() {
            uninsertable.set(block);
            continue;
        }
        let rebuilt = rebuild_leaf_buf(bs, &items);
        ctx.write_block(block, &rebuilt)?;

        let spliced = if ctx.root_block == NO_BLOCK {
            ctx.insert_pointer_leaf(&Path(Vec::new()), block)?
        } else {
            let first_key = items[0].0;
            let (path, _) = ctx.search_by_key(&first_key)?;
            ctx.insert_pointer_leaf(&path, block)?
        };

        if spliced {
            ctx.new.set(block);
        } else {
            uninsertable.set(block);
            ctx.free_block(block);
        }
    }

    debug!("pass 1: {} leaf/leaves left uninsertable for pass 2", uninsertable.count_set());
    Ok(Pass1Output { uninsertable })
}
