//! Pass 3 — semantic walk and lost+found (spec §4.8-§4.9). Reuses the
//! same directory traversal check mode uses for its informational pass,
//! then sweeps the whole tree for stat-data items the walk never reached
//! and relinks them under `/lost+found`.

use std::collections::HashSet;

use log::debug;

use super::super::block_io::BlockDevice;
use super::super::ctx::{FsckCtx, NO_BLOCK};
use super::super::error::CoreResult;
use super::super::hash::{hash_name, pack_hash_and_gen};
use super::super::item::{DirEntryHeader, DirectoryItem, StatData, DEH_STATE_VISIBLE, S_IFDIR};
use super::super::key::{Key, KeyFormat, OFFSET_DOT, OFFSET_DOT_DOT, ROOT_DIR_KEY, TYPE_DIRENTRY, TYPE_STAT_DATA};
use super::super::node::{BlockHeader, InternalView, ItemFlags, LeafView};
use super::super::reporter::Reporter;
use super::super::semantic::SemanticWalker;
use super::super::tree_ops::SearchResult;

pub struct Pass3Output {
    pub visited_dirs: u64,
    pub visited_files: u64,
    pub lost_found_entries: u64,
}

pub fn pass3_semantic<D: BlockDevice, R: Reporter>(ctx: &mut FsckCtx<D, R>) -> CoreResult<Pass3Output> {
    let mut walker = SemanticWalker::new();
    walker.walk(ctx)?;
    walker.check_safe_links(ctx)?;

    let mut lost_found: Option<(u32, u32)> = None;
    let mut lost_found_entries = 0u64;

    lost_found_entries += relink_unreachable(ctx, &mut walker, &mut lost_found, true)?;
    lost_found_entries += relink_unreachable(ctx, &mut walker, &mut lost_found, false)?;

    debug!(
        "pass 3: {} dirs, {} files visited, {} lost+found entries relinked",
        walker.stats().visited_dirs, walker.stats().visited_files, lost_found_entries
    );
    Ok(Pass3Output {
        visited_dirs: walker.stats().visited_dirs,
        visited_files: walker.stats().visited_files,
        lost_found_entries,
    })
}

/// One lost+found sweep: directories first (`want_dirs = true`), then
/// regular files, so a relinked orphan directory's own children get
/// visited through the normal walk rather than surfacing as separate
/// orphans (spec §4.9).
fn relink_unreachable<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    walker: &mut SemanticWalker,
    lost_found: &mut Option<(u32, u32)>,
    want_dirs: bool,
) -> CoreResult<u64> {
    let orphans = collect_unreachable_stat_data(ctx, want_dirs)?;
    if orphans.is_empty() {
        return Ok(0);
    }

    let root = ensure_lost_found(ctx, lost_found)?;
    let mut linked = 0u64;
    for short in orphans {
        if short == root {
            continue;
        }
        if !ctx.reporter.ask(&format!("object {short:?} is unreachable; link it into lost+found?")) {
            continue;
        }
        link_into_lost_found(ctx, root, short)?;
        linked += 1;
        if want_dirs {
            walker.continue_into_dir(ctx, short, root)?;
        } else {
            walker.adopt_file(ctx, short)?;
        }
    }
    Ok(linked)
}

/// Full-tree leaf sweep for stat-data items still missing `REACHABLE`
/// after the main walk.
fn collect_unreachable_stat_data<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    want_dirs: bool,
) -> CoreResult<Vec<(u32, u32)>> {
    let mut out = Vec::new();
    if ctx.root_block == NO_BLOCK {
        return Ok(out);
    }
    let bs = ctx.blocksize as usize;
    let mut stack = vec![ctx.root_block];
    let mut seen = HashSet::new();
    while let Some(block) = stack.pop() {
        if !seen.insert(block) {
            continue;
        }
        let buf = ctx.read_block(block)?;
        let head = BlockHeader::read(&buf);
        if head.is_leaf() {
            let view = LeafView::new(&buf, bs);
            for i in 0..view.nr_items() {
                let ih = view.item_header(i);
                if !ih.key.is_stat_data() || ih.flags.contains(ItemFlags::REACHABLE) {
                    continue;
                }
                let sd = StatData::read(view.item_body(i));
                if sd.is_dir() == want_dirs {
                    out.push(ih.key.short());
                }
            }
        } else {
            let view = InternalView::new(&buf, bs);
            for i in 0..=view.nr_items() {
                stack.push(view.child(i).block);
            }
        }
    }
    Ok(out)
}

fn ensure_lost_found<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    lost_found: &mut Option<(u32, u32)>,
) -> CoreResult<(u32, u32)> {
    if let Some(short) = *lost_found {
        return Ok(short);
    }

    let oid = ctx.oid_map.allocate();
    let short = (ROOT_DIR_KEY.dir_id, oid);

    let mut sd_key = Key::new(short.0, short.1, 0);
    sd_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
    let sd = StatData {
        mode: S_IFDIR | 0o755,
        attrs: 0,
        nlink: 2,
        uid: 0,
        gid: 0,
        size: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        blocks: 0,
        rdev_or_first_direct: 0,
    };
    let mut body = [0u8; 44];
    sd.write(&mut body);
    let (path, found) = ctx.search_by_key(&sd_key)?;
    if found != SearchResult::Found {
        ctx.insert_item(&path, sd_key, KeyFormat::V2, 0, &body)?;
    }

    let mut de_key = Key::new(short.0, short.1, 0);
    de_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_DIRENTRY);
    let mut parent_key = ROOT_DIR_KEY;
    parent_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
    let dir = DirectoryItem {
        entries: vec![
            (
                DirEntryHeader { deh_offset: OFFSET_DOT as u32, target: sd_key, location: 0, state: DEH_STATE_VISIBLE },
                b".".to_vec(),
            ),
            (
                DirEntryHeader { deh_offset: OFFSET_DOT_DOT as u32, target: parent_key, location: 0, state: DEH_STATE_VISIBLE },
                b"..".to_vec(),
            ),
        ],
    };
    let de_body = dir.serialize();
    let (de_path, de_found) = ctx.search_by_key(&de_key)?;
    if de_found != SearchResult::Found {
        ctx.insert_item(&de_path, de_key, KeyFormat::V2, 2, &de_body)?;
    }

    add_entry(ctx, ROOT_DIR_KEY.short(), short, b"lost+found")?;

    *lost_found = Some(short);
    Ok(short)
}

fn link_into_lost_found<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    lost_found: (u32, u32),
    orphan: (u32, u32),
) -> CoreResult<()> {
    let name = format!("{}_{}", orphan.0, orphan.1);
    add_entry(ctx, lost_found, orphan, name.as_bytes())
}

/// Appends one `(name -> target)` entry to `dir_short`'s directory item,
/// creating the item if the directory has none yet.
fn add_entry<D: BlockDevice, R: Reporter>(
    ctx: &mut FsckCtx<D, R>,
    dir_short: (u32, u32),
    target: (u32, u32),
    name: &[u8],
) -> CoreResult<()> {
    let mut target_key = Key::new(target.0, target.1, 0);
    target_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);

    let mut de_key = Key::new(dir_short.0, dir_short.1, 0);
    de_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_DIRENTRY);

    let hash = hash_name(ctx.hash, name);
    let deh = DirEntryHeader {
        deh_offset: pack_hash_and_gen(hash, 0),
        target: target_key,
        location: 0,
        state: DEH_STATE_VISIBLE,
    };

    let (path, found) = ctx.search_by_key(&de_key)?;
    if found != SearchResult::Found {
        let dir = DirectoryItem { entries: vec![(deh, name.to_vec())] };
        let body = dir.serialize();
        return ctx.insert_item(&path, de_key, KeyFormat::V2, 1, &body);
    }

    let (ih, existing_body) = {
        let buf = ctx.read_block(path.leaf_block().unwrap())?;
        let view = LeafView::new(&buf, ctx.blocksize as usize);
        let pos = path.leaf_pos().unwrap();
        (view.item_header(pos), view.item_body(pos).to_vec())
    };
    let mut dir = DirectoryItem::parse(&existing_body, ih.extra as usize).unwrap_or_default();
    dir.entries.push((deh, name.to_vec()));
    let new_body = dir.serialize();
    let new_extra = dir.entries.len() as u32;

    ctx.delete_item(&path)?;
    let (path2, _) = ctx.search_by_key(&de_key)?;
    ctx.insert_item(&path2, de_key, ih.format, new_extra, &new_body)
}
