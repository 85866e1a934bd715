//! Five-pass bottom-up tree reconstruction (spec §4.5-§4.10): recover
//! surviving leaves, graft them back as whole blocks where the balance
//! condition allows, insert whatever is left item by item, restore
//! directory reachability and relink orphans into lost+found, then strip
//! dead items and commit the rebuilt allocation bitmap.

pub mod pass0;
pub mod pass1;
pub mod pass2;
pub mod pass3;
pub mod pass4;

use std::path::Path as FsPath;

use log::info;

use super::bitmap::Bitmap;
use super::block_io::BlockDevice;
use super::ctx::{FsckCtx, NO_BLOCK};
use super::error::CoreResult;
use super::key::{Key, KeyFormat};
use super::node::LeafViewMut;
use super::reporter::Reporter;
use super::stage::{Stage, StageDump};

pub use pass0::Pass0Output;
pub use pass1::Pass1Output;
pub use pass2::Pass2Output;
pub use pass3::Pass3Output;
pub use pass4::Pass4Stats;

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub leaves_recovered: u64,
    pub uninsertable_blocks: u64,
    pub relocated_objects: u64,
    pub lost_found_entries: u64,
    pub deleted_unreachable: u64,
    pub merged_leaves: u64,
}

/// Packs `items` (already sorted and deduplicated by key) into a fresh
/// block. Shared by passes 0, 1, and 4, all of which rebuild a leaf from a
/// filtered item list rather than editing one in place.
pub(super) fn rebuild_leaf_buf(bs: usize, items: &[(Key, KeyFormat, u32, Vec<u8>)]) -> Vec<u8> {
    let mut buf = vec![0u8; bs];
    {
        let mut view = LeafViewMut::new(&mut buf, bs);
        view.init_empty();
        for (i, (k, f, e, b)) in items.iter().enumerate() {
            view.insert_item(i, *k, *f, *e, b);
        }
    }
    buf
}

fn write_stage(dump_dir: Option<&FsPath>, stage: Stage, bitmaps: &[(&str, &Bitmap)]) -> CoreResult<()> {
    let Some(dir) = dump_dir else { return Ok(()) };
    let mut dump = StageDump::new(stage);
    for (name, bm) in bitmaps {
        dump.add(name, bm);
    }
    dump.write_atomic(&dir.join("stage.dump"))
}

/// Runs all five passes against `ctx`, in order. `scan` restricts pass 0
/// to a subset of blocks (a badblocks exclusion list, typically); `None`
/// scans the whole device. `dump_dir`, when given, gets a stage-dump file
/// written after each pass boundary so an interrupted run can be resumed
/// from the last completed stage (spec §6).
pub fn rebuild_tree<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    scan: Option<Bitmap>,
    dump_dir: Option<&FsPath>,
) -> CoreResult<RebuildReport> {
    let scan = scan.unwrap_or_else(|| {
        let mut all = Bitmap::new(ctx.block_count);
        for b in 0..ctx.block_count {
            if !ctx.reserved.test(b) {
                all.set(b);
            }
        }
        all
    });

    ctx.root_block = NO_BLOCK;
    ctx.tree_height = 0;
    ctx.control = Bitmap::new(ctx.block_count);

    ctx.reporter.log("pass 0: recovering leaves");
    info!("pass 0: scanning {} block(s) for surviving leaves", scan.count_set());
    let p0 = pass0::pass0_scan(ctx, &scan)?;
    ctx.oid_map = p0.proper_id_map.clone();
    let selected_hash = p0.hash_selector.select(Some(ctx.hash));
    info!("pass 0 done: {} leaves recovered, hash {:?}", p0.leaves.count_set(), selected_hash);
    write_stage(dump_dir, Stage::Pass0Done, &[
        ("leaves", &p0.leaves),
        ("good_unfm", &p0.good_unfm),
        ("bad_unfm", &p0.bad_unfm),
    ])?;

    ctx.reporter.log("pass 1: grafting leaves");
    let p1 = pass1::pass1_graft(ctx, &p0, selected_hash)?;
    info!("pass 1 done: {} leaves left uninsertable", p1.uninsertable.count_set());
    write_stage(dump_dir, Stage::Pass1Done, &[("uninsertable", &p1.uninsertable), ("new", &ctx.new)])?;

    ctx.reporter.log("pass 2: inserting leftover items");
    let p2 = pass2::pass2_insert(ctx, &p1.uninsertable)?;
    info!("pass 2 done: {} objects relocated", p2.relocations.len());
    write_stage(dump_dir, Stage::TreeIsBuilt, &[("new", &ctx.new)])?;

    ctx.reporter.log("pass 3: semantic walk and lost+found");
    let p3 = pass3::pass3_semantic(ctx)?;
    info!("pass 3 done: {} lost+found entries", p3.lost_found_entries);
    write_stage(dump_dir, Stage::SemanticDone, &[("new", &ctx.new)])?;

    ctx.reporter.log("pass 4: cleanup");
    let p4 = pass4::pass4_cleanup(ctx)?;
    info!("pass 4 done: {} unreachable deleted, {} leaves merged", p4.deleted_unreachable, p4.merged_leaves);
    write_stage(dump_dir, Stage::LostFoundDone, &[("source", &ctx.source)])?;

    ctx.io.flush()?;

    Ok(RebuildReport {
        leaves_recovered: p0.leaves.count_set(),
        uninsertable_blocks: p1.uninsertable.count_set(),
        relocated_objects: p2.relocations.len() as u64,
        lost_found_entries: p3.lost_found_entries,
        deleted_unreachable: p4.deleted_unreachable,
        merged_leaves: p4.merged_leaves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_io::{BlockIo, MemDevice};
    use crate::core::item::{DirEntryHeader, DirectoryItem, StatData, DEH_STATE_VISIBLE};
    use crate::core::key::{OFFSET_DOT, ROOT_DIR_KEY, TYPE_DIRENTRY, TYPE_STAT_DATA};
    use crate::core::node::LeafViewMut;
    use crate::core::reporter::NullReporter;

    fn mk_ctx(blocksize: u64, blocks: u64) -> FsckCtx<MemDevice, NullReporter> {
        let dev = MemDevice::new(blocksize, blocks);
        let io = BlockIo::new(dev);
        FsckCtx::new(io, NullReporter::default())
    }

    #[test]
    fn rebuilds_a_single_surviving_leaf_into_a_fresh_root() {
        let mut ctx = mk_ctx(512, 16);

        let mut root_key = ROOT_DIR_KEY;
        root_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
        let sd = StatData { mode: 0o040755, attrs: 0, nlink: 2, uid: 0, gid: 0, size: 0, atime: 0, mtime: 0, ctime: 0, blocks: 0, rdev_or_first_direct: 0 };
        let mut sd_body = [0u8; 44];
        sd.write(&mut sd_body);

        let mut de_key = ROOT_DIR_KEY;
        de_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_DIRENTRY);
        let dir = DirectoryItem {
            entries: vec![(
                DirEntryHeader { deh_offset: OFFSET_DOT as u32, target: root_key, location: 0, state: DEH_STATE_VISIBLE },
                b".".to_vec(),
            )],
        };
        let de_body = dir.serialize();

        let leaf_block = 5u64;
        let mut buf = vec![0u8; 512];
        {
            let mut leaf = LeafViewMut::new(&mut buf, 512);
            leaf.init_empty();
            leaf.insert_item(0, root_key, KeyFormat::V2, 0, &sd_body);
            leaf.insert_item(1, de_key, KeyFormat::V2, 1, &de_body);
        }
        ctx.write_block(leaf_block, &buf).unwrap();

        let mut scan = Bitmap::new(16);
        scan.set(leaf_block);

        let report = rebuild_tree(&mut ctx, Some(scan), None).unwrap();
        assert_eq!(report.leaves_recovered, 1);
        assert_ne!(ctx.root_block, NO_BLOCK);

        let (_, found) = ctx.search_by_key(&root_key).unwrap();
        assert_eq!(found, crate::core::tree_ops::SearchResult::Found);
    }
}
