//! Tree search, balancing, and insertion at design level, per spec §4.3.
//! Operates on `Path`s — root-to-leaf arrays of `(block, position)` — over
//! an explicit `FsckCtx` rather than raw buffer-cache pointers (spec §9).

use super::block_io::BlockDevice;
use super::ctx::{FsckCtx, NO_BLOCK};
use super::error::{CoreError, CoreResult};
use super::key::{compare_full, Key, KeyFormat};
use super::node::{
    BlockHeader, ChildDesc, InternalView, InternalViewMut, ItemHeader, LeafView, LeafViewMut, BLOCK_HEADER_SIZE,
    ITEM_HEADER_SIZE,
};
use super::reporter::Reporter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathStep {
    pub block: u64,
    /// For an internal step: index of the child descended into. For the
    /// final (leaf) step: the item position — either the found item's
    /// index, or the index a new item would be inserted at.
    pub pos: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Path(pub Vec<PathStep>);

impl Path {
    pub fn leaf_block(&self) -> Option<u64> {
        self.0.last().map(|s| s.block)
    }

    pub fn leaf_pos(&self) -> Option<usize> {
        self.0.last().map(|s| s.pos)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchResult {
    Found,
    NotFound,
}

impl<D: BlockDevice, R: Reporter> FsckCtx<D, R> {
    /// Descends from the root to the leaf that would contain `k`. At each
    /// internal block, finds `pos` such that `key[pos-1] <= k < key[pos]`
    /// and descends to `child[pos]`.
    pub fn search_by_key(&mut self, k: &Key) -> CoreResult<(Path, SearchResult)> {
        if self.root_block == NO_BLOCK {
            return Err(CoreError::NoRoot);
        }
        let mut steps = Vec::new();
        let mut block = self.root_block;
        loop {
            let buf = self.read_block(block)?;
            let head = BlockHeader::read(&buf);
            if head.is_leaf() {
                let view = LeafView::new(&buf, self.blocksize as usize);
                let nr = view.nr_items();
                let mut pos = nr;
                let mut found = SearchResult::NotFound;
                for i in 0..nr {
                    match compare_full(&view.item_header(i).key, k) {
                        std::cmp::Ordering::Equal => {
                            pos = i;
                            found = SearchResult::Found;
                            break;
                        }
                        std::cmp::Ordering::Greater => {
                            pos = i;
                            break;
                        }
                        std::cmp::Ordering::Less => {}
                    }
                }
                steps.push(PathStep { block, pos });
                return Ok((Path(steps), found));
            }
            let view = InternalView::new(&buf, self.blocksize as usize);
            let pos = view.child_pos_for(k);
            steps.push(PathStep { block, pos });
            block = view.child(pos).block;
        }
    }

    fn read_leaf_mut(&mut self, block: u64) -> CoreResult<Vec<u8>> {
        self.read_block(block)
    }

    /// True iff leaf `left` and its right neighbor `right` can be merged
    /// into one block: `free_space(left) >= used(right)` (spec §4.3's
    /// mergeability condition, simplified to whole-block merges — this
    /// core does not attempt the header-saving mergeable-item optimization
    /// the original makes for adjacent same-file items).
    pub fn leaves_mergeable(&mut self, left: u64, right: u64) -> CoreResult<bool> {
        let lb = self.read_block(left)?;
        let rb = self.read_block(right)?;
        let lview = LeafView::new(&lb, self.blocksize as usize);
        let rview = LeafView::new(&rb, self.blocksize as usize);
        let used_right = rview.used_bytes() - BLOCK_HEADER_SIZE;
        Ok(lview.header().free_space as usize >= used_right)
    }

    /// Merges `right`'s items onto the end of `left` and frees `right`.
    /// Caller is responsible for removing `right`'s delimiting key/child
    /// pointer from the parent.
    pub fn merge_leaves(&mut self, left: u64, right: u64) -> CoreResult<()> {
        let rbuf = self.read_block(right)?;
        let rview = LeafView::new(&rbuf, self.blocksize as usize);
        let items: Vec<(Key, KeyFormat, u32, Vec<u8>)> = (0..rview.nr_items())
            .map(|i| {
                let ih = rview.item_header(i);
                (ih.key, ih.format, ih.extra, rview.item_body(i).to_vec())
            })
            .collect();
        drop(rview);

        let mut lbuf = self.read_block(left)?;
        {
            let mut lview = LeafViewMut::new(&mut lbuf, self.blocksize as usize);
            let mut pos = lview.nr_items();
            for (key, format, extra, body) in items {
                lview.insert_item(pos, key, format, extra, &body);
                pos += 1;
            }
        }
        self.write_block(left, &lbuf)?;
        self.free_block(right);
        Ok(())
    }

    /// Inserts a single item at `path`'s leaf position, splitting the leaf
    /// (and recursively the parent chain) if it doesn't fit.
    pub fn insert_item(&mut self, path: &Path, key: Key, format: KeyFormat, extra: u32, body: &[u8]) -> CoreResult<()> {
        let Some(leaf_step) = path.0.last() else { return Err(CoreError::NoRoot) };
        let leaf_block = leaf_step.block;
        let pos = leaf_step.pos;

        let mut buf = self.read_leaf_mut(leaf_block)?;
        let needed = body.len() + ITEM_HEADER_SIZE;
        let free = BlockHeader::read(&buf).free_space as usize;

        if needed <= free {
            let mut view = LeafViewMut::new(&mut buf, self.blocksize as usize);
            view.insert_item(pos, key, format, extra, body);
            drop(view);
            self.write_block(leaf_block, &buf)?;
            return self.refresh_child_size(path, leaf_block);
        }

        self.split_and_insert(path, key, format, extra, body)
    }

    /// Recomputes `child_block`'s used-space size and writes it back into
    /// its parent's `ChildDesc` (a no-op if `child_block` is the root, which
    /// has no parent entry). Keeps the field `checker::check_internal`
    /// validates in sync after an in-place leaf mutation that doesn't
    /// trigger a split.
    fn refresh_child_size(&mut self, path: &Path, child_block: u64) -> CoreResult<()> {
        if path.0.len() < 2 {
            return Ok(());
        }
        let parent_step = path.0[path.0.len() - 2];
        let bs = self.blocksize as usize;

        let child_buf = self.read_block(child_block)?;
        let actual = (bs - BLOCK_HEADER_SIZE - BlockHeader::read(&child_buf).free_space as usize) as u32;

        let mut parent_buf = self.read_block(parent_step.block)?;
        {
            let mut iv = InternalViewMut::new(&mut parent_buf, bs);
            iv.set_child(parent_step.pos, ChildDesc { block: child_block, size: actual });
        }
        self.write_block(parent_step.block, &parent_buf)
    }

    /// Leaf is full: splits it roughly in half, inserts the new item into
    /// whichever half it belongs in, and threads the new delimiting
    /// key/child pointer up through ancestors (spec §4.3).
    fn split_and_insert(
        &mut self,
        path: &Path,
        key: Key,
        format: KeyFormat,
        extra: u32,
        body: &[u8],
    ) -> CoreResult<()> {
        let leaf_step = path.0.last().unwrap();
        let leaf_block = leaf_step.block;
        let pos = leaf_step.pos;

        let buf = self.read_leaf_mut(leaf_block)?;
        let view = LeafView::new(&buf, self.blocksize as usize);
        let nr = view.nr_items();
        let items: Vec<(Key, KeyFormat, u32, Vec<u8>)> = (0..nr)
            .map(|i| {
                let ih = view.item_header(i);
                (ih.key, ih.format, ih.extra, view.item_body(i).to_vec())
            })
            .collect();
        drop(view);

        let mut all: Vec<(Key, KeyFormat, u32, Vec<u8>)> = Vec::with_capacity(nr + 1);
        all.extend_from_slice(&items[..pos]);
        all.push((key, format, extra, body.to_vec()));
        all.extend_from_slice(&items[pos..]);

        let mid = all.len() / 2;
        let (left_items, right_items) = all.split_at(mid);

        let new_block = self
            .new_blocknrs(leaf_block, 1)
            .into_iter()
            .next()
            .ok_or(CoreError::CorruptBlock { block: leaf_block, reason: "device is full" })?;

        let bs = self.blocksize as usize;
        let mut left_buf = vec![0u8; bs];
        {
            let mut lv = LeafViewMut::new(&mut left_buf, bs);
            lv.init_empty();
            for (i, (k, f, e, b)) in left_items.iter().enumerate() {
                lv.insert_item(i, *k, *f, *e, b);
            }
        }
        let mut right_buf = vec![0u8; bs];
        {
            let mut rv = LeafViewMut::new(&mut right_buf, bs);
            rv.init_empty();
            for (i, (k, f, e, b)) in right_items.iter().enumerate() {
                rv.insert_item(i, *k, *f, *e, b);
            }
        }
        self.write_block(leaf_block, &left_buf)?;
        self.write_block(new_block, &right_buf)?;

        let promoted_key = right_items[0].0;
        let right_size = (bs - BLOCK_HEADER_SIZE - BlockHeader::read(&right_buf).free_space as usize) as u32;
        self.insert_into_parent(path, promoted_key, ChildDesc { block: new_block, size: right_size })
    }

    /// Threads a new `(delimiting_key, child)` pair up from the parent of
    /// the block that just split, splitting internal nodes in turn and
    /// growing the root if necessary.
    fn insert_into_parent(&mut self, path: &Path, promoted_key: Key, new_child: ChildDesc) -> CoreResult<()> {
        if path.0.len() == 1 {
            // the leaf that split was the root: build a new 2-child root
            let old_root = path.0[0].block;
            let bs = self.blocksize as usize;
            let old_size = {
                let buf = self.read_block(old_root)?;
                (bs - BLOCK_HEADER_SIZE - BlockHeader::read(&buf).free_space as usize) as u32
            };
            let new_root_block = self
                .new_blocknrs(old_root, 1)
                .into_iter()
                .next()
                .ok_or(CoreError::CorruptBlock { block: old_root, reason: "device is full" })?;
            let mut root_buf = vec![0u8; bs];
            {
                let mut iv = InternalViewMut::new(&mut root_buf, bs);
                iv.init_empty(self.tree_height + 1);
                iv.insert_pointer(0, promoted_key, new_child);
                iv.set_child(0, ChildDesc { block: old_root, size: old_size });
            }
            self.write_block(new_root_block, &root_buf)?;
            self.root_block = new_root_block;
            self.tree_height += 1;
            return Ok(());
        }

        let parent_idx = path.0.len() - 2;
        let parent_block = path.0[parent_idx].block;
        let child_pos = path.0[parent_idx].pos;

        let mut buf = self.read_block(parent_block)?;
        let bs = self.blocksize as usize;
        let head = BlockHeader::read(&buf);
        let nr = head.nr_items as usize;
        let after_insert_bytes =
            BLOCK_HEADER_SIZE + (nr + 1) * super::node::DELIM_KEY_SIZE + (nr + 2) * super::node::CHILD_DESC_SIZE;
        let fits = after_insert_bytes <= bs;

        // `path.0.last()` just split (or was otherwise rewritten smaller) by
        // the caller before this was invoked; its own ChildDesc entry at
        // `child_pos` still reflects its pre-split size.
        let split_block = path.0.last().unwrap().block;
        let split_buf = self.read_block(split_block)?;
        let split_size =
            (bs - BLOCK_HEADER_SIZE - BlockHeader::read(&split_buf).free_space as usize) as u32;

        if fits {
            let mut iv = InternalViewMut::new(&mut buf, bs);
            iv.insert_pointer(child_pos, promoted_key, new_child);
            iv.set_child(child_pos, ChildDesc { block: split_block, size: split_size });
            drop(iv);
            self.write_block(parent_block, &buf)?;
            return Ok(());
        }

        // Internal node is full too: split it the same way, recursing up.
        // Collect existing (key, child) pairs plus the new one in order.
        let view = InternalView::new(&buf, bs);
        let nr = view.nr_items();
        let mut keys: Vec<Key> = (0..nr).map(|i| view.delimiting_key(i)).collect();
        let mut children: Vec<ChildDesc> = (0..=nr).map(|i| view.child(i)).collect();
        drop(view);

        children[child_pos] = ChildDesc { block: split_block, size: split_size };
        keys.insert(child_pos, promoted_key);
        children.insert(child_pos + 1, new_child);

        let mid_key_idx = keys.len() / 2;
        let up_key = keys[mid_key_idx];
        let left_keys = keys[..mid_key_idx].to_vec();
        let right_keys = keys[mid_key_idx + 1..].to_vec();
        let left_children = children[..=mid_key_idx].to_vec();
        let right_children = children[mid_key_idx + 1..].to_vec();

        let level = head.level;
        let new_internal_block = self
            .new_blocknrs(parent_block, 1)
            .into_iter()
            .next()
            .ok_or(CoreError::CorruptBlock { block: parent_block, reason: "device is full" })?;

        let mut left_buf = vec![0u8; bs];
        {
            let mut iv = InternalViewMut::new(&mut left_buf, bs);
            iv.init_empty(level);
            iv.set_child(0, left_children[0]);
            for (i, k) in left_keys.iter().enumerate() {
                iv.insert_pointer(i, *k, left_children[i + 1]);
            }
        }
        let mut right_buf = vec![0u8; bs];
        {
            let mut iv = InternalViewMut::new(&mut right_buf, bs);
            iv.init_empty(level);
            iv.set_child(0, right_children[0]);
            for (i, k) in right_keys.iter().enumerate() {
                iv.insert_pointer(i, *k, right_children[i + 1]);
            }
        }
        self.write_block(parent_block, &left_buf)?;
        self.write_block(new_internal_block, &right_buf)?;

        let right_size = (bs - BLOCK_HEADER_SIZE - BlockHeader::read(&right_buf).free_space as usize) as u32;
        let grandparent_path = Path(path.0[..=parent_idx].to_vec());
        self.insert_into_parent(
            &grandparent_path,
            up_key,
            ChildDesc { block: new_internal_block, size: right_size },
        )
    }

    /// Pass-1 whole-leaf splice: grafts `leaf_block` into the tree at
    /// `path`'s position as a brand-new leaf, without item-by-item
    /// insertion, when it fits under the balance condition and respects
    /// the surrounding delimiting keys (spec §4.3, §4.6).
    pub fn insert_pointer_leaf(&mut self, path: &Path, leaf_block: u64) -> CoreResult<bool> {
        if self.root_block == NO_BLOCK {
            let buf = self.read_block(leaf_block)?;
            let view = LeafView::new(&buf, self.blocksize as usize);
            if view.nr_items() == 0 {
                return Ok(false);
            }
            self.root_block = leaf_block;
            self.tree_height = 2;
            return Ok(true);
        }

        if path.0.is_empty() {
            return Ok(false);
        }
        let parent_idx = path.0.len().saturating_sub(1);
        if parent_idx == 0 {
            // leaf is (or would become) the new sibling of the current root leaf;
            // handled via the regular split machinery by delegating to the
            // first item's insertion path. Conservative: report not spliceable.
            return Ok(false);
        }

        let leaf_first_key = {
            let buf = self.read_block(leaf_block)?;
            let view = LeafView::new(&buf, self.blocksize as usize);
            match view.first_key() {
                Some(k) => k,
                None => return Ok(false),
            }
        };

        let size = {
            let buf = self.read_block(leaf_block)?;
            (self.blocksize as usize - BLOCK_HEADER_SIZE - BlockHeader::read(&buf).free_space as usize) as u32
        };

        let grandparent_path = Path(path.0[..parent_idx].to_vec());
        self.insert_into_parent(&grandparent_path, leaf_first_key, ChildDesc { block: leaf_block, size })?;
        Ok(true)
    }

    /// Deletes the item at `path`'s leaf position.
    pub fn delete_item(&mut self, path: &Path) -> CoreResult<()> {
        let Some(step) = path.0.last() else { return Err(CoreError::NoRoot) };
        let mut buf = self.read_block(step.block)?;
        {
            let mut view = LeafViewMut::new(&mut buf, self.blocksize as usize);
            view.delete_item(step.pos);
        }
        self.write_block(step.block, &buf)
    }

    pub fn read_item_header_at(&mut self, path: &Path) -> CoreResult<Option<ItemHeader>> {
        let Some(step) = path.0.last() else { return Ok(None) };
        let buf = self.read_block(step.block)?;
        let view = LeafView::new(&buf, self.blocksize as usize);
        if step.pos >= view.nr_items() {
            return Ok(None);
        }
        Ok(Some(view.item_header(step.pos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_io::{BlockIo, MemDevice};
    use crate::core::key::TYPE_STAT_DATA;
    use crate::core::reporter::NullReporter;

    fn mk_ctx(blocksize: u64, blocks: u64) -> FsckCtx<MemDevice, NullReporter> {
        let dev = MemDevice::new(blocksize, blocks);
        let io = BlockIo::new(dev);
        FsckCtx::new(io, NullReporter::default())
    }

    fn key(dir: u32, obj: u32, off: u64) -> Key {
        let mut k = Key::new(dir, obj, 0);
        k.set_type_and_offset(KeyFormat::V2, off, TYPE_STAT_DATA);
        k
    }

    #[test]
    fn insert_bootstraps_root_and_finds_item() {
        let mut ctx = mk_ctx(256, 16);
        let root = ctx.new_blocknrs(0, 1)[0];
        let mut buf = vec![0u8; 256];
        LeafViewMut::new(&mut buf, 256).init_empty();
        ctx.write_block(root, &buf).unwrap();
        ctx.root_block = root;
        ctx.tree_height = 1;

        let k = key(1, 2, 0);
        let (path, found) = ctx.search_by_key(&k).unwrap();
        assert_eq!(found, SearchResult::NotFound);
        ctx.insert_item(&path, k, KeyFormat::V2, 0, b"payload").unwrap();

        let (path2, found2) = ctx.search_by_key(&k).unwrap();
        assert_eq!(found2, SearchResult::Found);
        let ih = ctx.read_item_header_at(&path2).unwrap().unwrap();
        assert_eq!(ih.key, k);
    }

    #[test]
    fn repeated_inserts_force_a_split() {
        let mut ctx = mk_ctx(128, 64);
        let root = ctx.new_blocknrs(0, 1)[0];
        let mut buf = vec![0u8; 128];
        LeafViewMut::new(&mut buf, 128).init_empty();
        ctx.write_block(root, &buf).unwrap();
        ctx.root_block = root;
        ctx.tree_height = 1;

        for i in 0..20u32 {
            let k = key(1, i + 2, 0);
            let (path, _) = ctx.search_by_key(&k).unwrap();
            ctx.insert_item(&path, k, KeyFormat::V2, 0, b"0123456789").unwrap();
        }

        for i in 0..20u32 {
            let k = key(1, i + 2, 0);
            let (path, found) = ctx.search_by_key(&k).unwrap();
            assert_eq!(found, SearchResult::Found, "missing key for oid {i}");
            let ih = ctx.read_item_header_at(&path).unwrap().unwrap();
            assert_eq!(ih.key, k);
        }
        assert!(ctx.tree_height >= 2, "tree should have grown past a single leaf");
    }
}
