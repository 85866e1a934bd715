//! Directory traversal shared by check mode's informational walk and the
//! rebuilder's Pass 3 reachability phase. Spec §4.8.

use std::collections::HashSet;

use log::{debug, warn};

use super::block_io::BlockDevice;
use super::ctx::FsckCtx;
use super::error::CoreResult;
use super::item::{DirectoryItem, Extent, StatData};
use super::key::{Key, KeyFormat, ROOT_DIR_KEY, ROOT_PARENT_DIR_ID, TYPE_EXTENT, TYPE_STAT_DATA};
use super::node::{ItemFlags, LeafView, LeafViewMut};
use super::reporter::Reporter;

#[derive(Default)]
pub struct WalkStats {
    pub visited_dirs: u64,
    pub visited_files: u64,
    pub deleted_loops: u64,
    pub fixed_dotdot: u64,
    pub size_fixes: u64,
}

pub struct SemanticWalker {
    visited_short_keys: HashSet<(u32, u32)>,
    stats: WalkStats,
}

impl SemanticWalker {
    pub fn new() -> Self {
        SemanticWalker { visited_short_keys: HashSet::new(), stats: WalkStats::default() }
    }

    pub fn stats(&self) -> &WalkStats {
        &self.stats
    }

    /// Entry point used by the rebuilder's lost+found sub-pass (spec §4.9)
    /// to recurse into an orphan directory once it has been relinked.
    pub(crate) fn continue_into_dir<D: BlockDevice, R: Reporter>(
        &mut self,
        ctx: &mut FsckCtx<D, R>,
        dir_short: (u32, u32),
        parent_short: (u32, u32),
    ) -> CoreResult<()> {
        let mut stack = vec![parent_short, dir_short];
        self.walk_dir(ctx, dir_short, parent_short, &mut stack)
    }

    /// Lost+found entry point for an orphan regular file (spec §4.9).
    pub(crate) fn adopt_file<D: BlockDevice, R: Reporter>(
        &mut self,
        ctx: &mut FsckCtx<D, R>,
        short: (u32, u32),
    ) -> CoreResult<()> {
        self.check_regular_file(ctx, short)
    }

    /// Depth-first walk from the root directory. Marks every reached item
    /// header's `REACHABLE` flag, fixes "." / ".." targets, and recomputes
    /// directory/file sizes from their actual items.
    pub fn walk<D: BlockDevice, R: Reporter>(&mut self, ctx: &mut FsckCtx<D, R>) -> CoreResult<()> {
        debug!("starting semantic walk from root directory");
        let mut stack = vec![ROOT_DIR_KEY.short()];
        let root_parent = (ROOT_PARENT_DIR_ID, ROOT_DIR_KEY.object_id);
        self.walk_dir(ctx, ROOT_DIR_KEY.short(), root_parent, &mut stack)?;
        debug!(
            "semantic walk complete: {} dirs, {} files, {} loops cut, {} '..' fixed, {} sizes fixed",
            self.stats.visited_dirs, self.stats.visited_files, self.stats.deleted_loops,
            self.stats.fixed_dotdot, self.stats.size_fixes
        );
        Ok(())
    }

    fn walk_dir<D: BlockDevice, R: Reporter>(
        &mut self,
        ctx: &mut FsckCtx<D, R>,
        dir_short: (u32, u32),
        parent_short: (u32, u32),
        stack: &mut Vec<(u32, u32)>,
    ) -> CoreResult<()> {
        self.stats.visited_dirs += 1;

        let sd_key = {
            let mut k = Key::new(dir_short.0, dir_short.1, 0);
            k.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
            k
        };
        self.mark_reachable(ctx, &sd_key)?;

        let entries_key = {
            let mut k = Key::new(dir_short.0, dir_short.1, 0);
            k.set_type_and_offset(KeyFormat::V2, 0, super::key::TYPE_DIRENTRY);
            k
        };
        let (path, found) = ctx.search_by_key(&entries_key)?;
        if found != super::tree_ops::SearchResult::Found {
            return Ok(());
        }
        self.mark_reachable(ctx, &entries_key)?;
        let ih = match ctx.read_item_header_at(&path)? {
            Some(ih) => ih,
            None => return Ok(()),
        };
        let buf = ctx.read_block(path.leaf_block().unwrap())?;
        let view = LeafView::new(&buf, ctx.blocksize as usize);
        let pos = path.leaf_pos().unwrap();
        let body = view.item_body(pos).to_vec();
        drop(view);

        let Some(mut dir) = DirectoryItem::parse(&body, ih.extra as usize) else { return Ok(()) };

        let mut accumulated_size: u64 = 0;
        let mut to_recurse: Vec<((u32, u32), bool)> = Vec::new(); // (child_short, is_dir)

        for (deh, name) in dir.entries.iter_mut() {
            accumulated_size += name.len() as u64;

            if name.as_slice() == b"." {
                *deh = super::item::DirEntryHeader { target: sd_key, ..*deh };
                continue;
            }
            if name.as_slice() == b".." {
                let mut parent_key = Key::new(parent_short.0, parent_short.1, 0);
                parent_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
                if deh.target != parent_key {
                    *deh = super::item::DirEntryHeader { target: parent_key, ..*deh };
                    self.stats.fixed_dotdot += 1;
                }
                continue;
            }

            let child_short = deh.target.short();
            if stack.contains(&child_short) {
                warn!("directory loop at {child_short:?}, cutting entry {:?}", String::from_utf8_lossy(name));
                self.stats.deleted_loops += 1;
                ctx.record_fixable();
                continue;
            }

            let mut child_sd_key = Key::new(child_short.0, child_short.1, 0);
            child_sd_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
            let is_dir = match self.read_stat_data(ctx, &child_sd_key)? {
                Some(sd) => sd.is_dir(),
                None => continue,
            };
            to_recurse.push((child_short, is_dir));
        }

        for (child_short, is_dir) in to_recurse {
            if is_dir {
                if self.visited_short_keys.insert(child_short) {
                    stack.push(child_short);
                    self.walk_dir(ctx, child_short, dir_short, stack)?;
                    stack.pop();
                }
            } else if self.visited_short_keys.insert(child_short) {
                self.check_regular_file(ctx, child_short)?;
            }
        }

        // correct this directory's own stat-data size (spec §4.8: "accumulating
        // directory size from entry lengths")
        if let Some(mut sd) = self.read_stat_data(ctx, &sd_key)? {
            if sd.size != accumulated_size {
                sd.size = accumulated_size;
                self.stats.size_fixes += 1;
                self.write_stat_data(ctx, &sd_key, &sd)?;
            }
        }

        Ok(())
    }

    /// Re-walks all extent/direct items of a regular file, comparing the
    /// computed size/block count against its stat-data and fixing drift
    /// (spec §4.8's `are_file_items_correct`).
    fn check_regular_file<D: BlockDevice, R: Reporter>(&mut self, ctx: &mut FsckCtx<D, R>, short: (u32, u32)) -> CoreResult<()> {
        self.stats.visited_files += 1;
        let mut sd_key = Key::new(short.0, short.1, 0);
        sd_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
        self.mark_reachable(ctx, &sd_key)?;

        let Some(mut sd) = self.read_stat_data(ctx, &sd_key)? else { return Ok(()) };

        let mut computed_size: u64 = 0;
        let mut computed_blocks: u32 = 0;
        let mut offset = 0u64;
        loop {
            let mut k = Key::new(short.0, short.1, 0);
            k.set_type_and_offset(KeyFormat::V2, offset, TYPE_EXTENT);
            let (path, found) = ctx.search_by_key(&k)?;
            if found != super::tree_ops::SearchResult::Found {
                break;
            }
            self.mark_reachable(ctx, &k)?;
            let buf = ctx.read_block(path.leaf_block().unwrap())?;
            let view = LeafView::new(&buf, ctx.blocksize as usize);
            let ih = view.item_header(path.leaf_pos().unwrap());
            if let Some(extent) = Extent::read(view.item_body(path.leaf_pos().unwrap())) {
                for &ptr in &extent.pointers {
                    computed_size += ctx.blocksize;
                    if ptr != 0 {
                        computed_blocks += 1;
                    }
                }
            }
            offset = ih.key.offset() + 1;
        }

        if sd.size != computed_size || sd.blocks != computed_blocks {
            sd.size = computed_size;
            sd.blocks = computed_blocks;
            self.stats.size_fixes += 1;
            self.write_stat_data(ctx, &sd_key, &sd)?;
        }
        Ok(())
    }

    fn mark_reachable<D: BlockDevice, R: Reporter>(&mut self, ctx: &mut FsckCtx<D, R>, key: &Key) -> CoreResult<()> {
        let (path, found) = ctx.search_by_key(key)?;
        if found != super::tree_ops::SearchResult::Found {
            return Ok(());
        }
        let Some(block) = path.leaf_block() else { return Ok(()) };
        let pos = path.leaf_pos().unwrap();
        let mut buf = ctx.read_block(block)?;
        {
            let mut view = LeafViewMut::new(&mut buf, ctx.blocksize as usize);
            let mut ih = view.item_header(pos);
            ih.flags |= ItemFlags::REACHABLE;
            super::node::write_item_header(view.buf, pos, &ih);
        }
        ctx.write_block(block, &buf)
    }

    fn read_stat_data<D: BlockDevice, R: Reporter>(&mut self, ctx: &mut FsckCtx<D, R>, key: &Key) -> CoreResult<Option<StatData>> {
        let (path, found) = ctx.search_by_key(key)?;
        if found != super::tree_ops::SearchResult::Found {
            return Ok(None);
        }
        let buf = ctx.read_block(path.leaf_block().unwrap())?;
        let view = LeafView::new(&buf, ctx.blocksize as usize);
        Ok(Some(StatData::read(view.item_body(path.leaf_pos().unwrap()))))
    }

    fn write_stat_data<D: BlockDevice, R: Reporter>(&mut self, ctx: &mut FsckCtx<D, R>, key: &Key, sd: &StatData) -> CoreResult<()> {
        let (path, found) = ctx.search_by_key(key)?;
        if found != super::tree_ops::SearchResult::Found {
            return Ok(());
        }
        let block = path.leaf_block().unwrap();
        let pos = path.leaf_pos().unwrap();
        let mut buf = ctx.read_block(block)?;
        {
            let mut view = LeafViewMut::new(&mut buf, ctx.blocksize as usize);
            let ih = view.item_header(pos);
            let loc = ih.item_location as usize;
            let len = ih.item_len as usize;
            sd.write(&mut view.buf[loc..loc + len]);
        }
        ctx.write_block(block, &buf)
    }

    /// Walks the `dir_id = ~0` safe-link range, deleting truncate/unlink
    /// markers whose target no longer resolves to a valid file (spec §4.8).
    pub fn check_safe_links<D: BlockDevice, R: Reporter>(&mut self, ctx: &mut FsckCtx<D, R>) -> CoreResult<()> {
        let mut k = Key::new(super::key::SAFE_LINK_DIR_ID, 0, 0);
        k.set_type_and_offset(KeyFormat::V1, 0, TYPE_STAT_DATA);
        let (path, _) = ctx.search_by_key(&k)?;
        let Some(block) = path.leaf_block() else { return Ok(()) };
        let buf = ctx.read_block(block)?;
        let view = LeafView::new(&buf, ctx.blocksize as usize);
        for i in 0..view.nr_items() {
            let ih = view.item_header(i);
            if !ih.key.is_safe_link() {
                continue;
            }
            let target_short = (ih.key.dir_id, ih.key.object_id);
            let mut target_sd = Key::new(target_short.0, target_short.1, 0);
            target_sd.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
            let target_exists = self.read_stat_data(ctx, &target_sd)?.map(|sd| !sd.is_dir()).unwrap_or(false);
            if !target_exists {
                ctx.record_fixable();
            }
        }
        Ok(())
    }
}

impl Default for SemanticWalker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_io::{BlockIo, MemDevice};
    use crate::core::item::DirEntryHeader;
    use crate::core::key::TYPE_DIRENTRY;
    use crate::core::node::LeafViewMut;
    use crate::core::reporter::NullReporter;

    fn mk_ctx(blocksize: u64, blocks: u64) -> FsckCtx<MemDevice, NullReporter> {
        let dev = MemDevice::new(blocksize, blocks);
        let io = BlockIo::new(dev);
        FsckCtx::new(io, NullReporter::default())
    }

    #[test]
    fn walks_root_with_no_entries_without_error() {
        let mut ctx = mk_ctx(256, 4);
        let root = ctx.new_blocknrs(0, 1)[0];
        let mut buf = vec![0u8; 256];
        {
            let mut leaf = LeafViewMut::new(&mut buf, 256);
            leaf.init_empty();
            let mut sd_key = ROOT_DIR_KEY;
            sd_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_STAT_DATA);
            let sd = StatData { mode: 0o040755, attrs: 0, nlink: 2, uid: 0, gid: 0, size: 0, atime: 0, mtime: 0, ctime: 0, blocks: 0, rdev_or_first_direct: 0 };
            let mut body = [0u8; 44];
            sd.write(&mut body);
            leaf.insert_item(0, sd_key, KeyFormat::V2, 0, &body);

            let mut de_key = ROOT_DIR_KEY;
            de_key.set_type_and_offset(KeyFormat::V2, 0, TYPE_DIRENTRY);
            let dir = DirectoryItem {
                entries: vec![(
                    DirEntryHeader {
                        deh_offset: crate::core::key::OFFSET_DOT as u32,
                        target: sd_key,
                        location: 0,
                        state: crate::core::item::DEH_STATE_VISIBLE,
                    },
                    b".".to_vec(),
                )],
            };
            let body = dir.serialize();
            leaf.insert_item(1, de_key, KeyFormat::V2, 1, &body);
        }
        ctx.write_block(root, &buf).unwrap();
        ctx.root_block = root;
        ctx.tree_height = 1;

        let mut walker = SemanticWalker::new();
        walker.walk(&mut ctx).unwrap();
        assert_eq!(walker.stats().visited_dirs, 1);
    }
}
