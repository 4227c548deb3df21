//! Ordered map: traversal, split, merge, borrow, root shrink/grow, B-link
//! retry.
//!
//! Grounded on the teacher's `BPTree` for the overall module shape
//! (slab of pages, root tracked in the tree, write path collecting a
//! locked path before mutating) but rebuilt around this crate's
//! `BufferPool`/`LatchManager`/`PageCodec` instead of the teacher's raw
//! `NonNull<BPNode>` slab and optimistic version-locked root pointer: the
//! coordinator already guarantees a single writer at a time, so the
//! write path here holds exclusive latches down the whole descent
//! (conservative crab-locking) rather than racing an optimistic retry
//! loop. Readers still crab-lock with shared latches and both readers
//! and writers honor B-link right-sibling retries.

use std::sync::Mutex;

use crate::buffer::BufferPool;
use crate::codec::{self, InternalCell, InternalPage, LeafCell, LeafPage};
use crate::error::{Error, Result};
use crate::lock_manager::{LatchGuard, LatchManager};
use crate::overflow::OverflowStore;
use crate::types::{Key, Meta, PageNo, PageType};

/// Maximum number of (key, child) cells an internal page can hold.
fn max_internal_keys(page_size: u32) -> usize {
    const CELLS_OFF: usize = 44;
    const CELL_SIZE: usize = Key::SIZE + 4;
    ((page_size as usize).saturating_sub(CELLS_OFF)) / CELL_SIZE
}

fn min_internal_keys(page_size: u32) -> usize {
    max_internal_keys(page_size) / 2
}

/// A conservative lower bound on leaf fanout, assuming zero-length
/// values; used only as the rebalance threshold, not as a hard capacity
/// limit (leaf capacity is governed by serialized size, since values are
/// variable-length).
fn max_leaf_keys(page_size: u32) -> usize {
    const SLOTS_OFF: usize = 40;
    const CELL_HEADER: usize = 2 + 2 + 4 + 4;
    let per_cell = 2 /* slot pointer */ + CELL_HEADER + Key::SIZE;
    ((page_size as usize).saturating_sub(SLOTS_OFF)) / per_cell
}

fn min_leaf_keys(page_size: u32) -> usize {
    max_leaf_keys(page_size) / 2
}

fn internal_choose_child(page: &InternalPage, key: Key) -> PageNo {
    let mut child = page.left_child;
    for cell in &page.cells {
        if cell.key <= key {
            child = cell.child;
        } else {
            break;
        }
    }
    child
}

fn internal_should_move_right(page: &InternalPage, key: Key) -> bool {
    page.right_sibling != 0 && !page.cells.is_empty() && page.cells.iter().all(|c| c.key <= key)
}

fn leaf_should_move_right(page: &LeafPage, key: Key) -> bool {
    page.right_sibling != 0 && page.cells.last().map_or(false, |c| c.key < key)
}

/// Position of a child within its parent: -1 denotes `leftChild`, i >= 0
/// denotes `cells[i].child`.
fn child_index_in_parent(parent: &InternalPage, child: PageNo) -> Option<i64> {
    if parent.left_child == child {
        return Some(-1);
    }
    parent.cells.iter().position(|c| c.child == child).map(|i| i as i64)
}

fn left_sibling_of(parent: &InternalPage, idx: i64) -> Option<PageNo> {
    match idx {
        -1 => None,
        0 => Some(parent.left_child),
        i => Some(parent.cells[(i - 1) as usize].child),
    }
}

fn right_sibling_of(parent: &InternalPage, idx: i64) -> Option<PageNo> {
    if idx == -1 {
        parent.cells.first().map(|c| c.child)
    } else {
        parent.cells.get((idx + 1) as usize).map(|c| c.child)
    }
}

fn materialize_value(buffer: &mut BufferPool, cell: &LeafCell) -> Result<Vec<u8>> {
    if !cell.has_overflow() {
        let mut v = cell.inline_value.clone();
        v.truncate(cell.total_value_len as usize);
        return Ok(v);
    }
    let mut out = cell.inline_value.clone();
    let remainder = cell.total_value_len as u64 - cell.inline_value.len() as u64;
    let tail = OverflowStore::read_chain(buffer.page_store_mut(), cell.overflow_head, remainder)?;
    out.extend_from_slice(&tail);
    Ok(out)
}

/// Splits `value` into the inline prefix and (if any) an overflow chain,
/// returning the cell fields ready to store.
fn prepare_value(buffer: &mut BufferPool, value: &[u8], max_inline: usize) -> Result<(Vec<u8>, u32, u32)> {
    if value.len() > u32::MAX as usize {
        return Err(Error::ValueTooLarge(value.len() as u64));
    }
    if value.len() <= max_inline {
        Ok((value.to_vec(), 0, value.len() as u32))
    } else {
        let inline = value[..max_inline].to_vec();
        let remainder = &value[max_inline..];
        let head = OverflowStore::allocate_chain(buffer.page_store_mut(), remainder)?;
        Ok((inline, head, value.len() as u32))
    }
}

fn write_page_through(buffer: &mut BufferPool, touched: &mut Vec<PageNo>, n: PageNo, bytes: Vec<u8>) -> Result<()> {
    let _ = buffer.get_page(n)?;
    buffer.put_page(n, bytes)?;
    buffer.unpin(n, true)?;
    touched.push(n);
    Ok(())
}

/// Accumulates cell sizes until half of the total is reached, returning
/// the split index (1..cells.len()).
fn leaf_split_index(page: &LeafPage) -> usize {
    let sizes: Vec<usize> = page
        .cells
        .iter()
        .map(|c| 2 + 2 + 2 + 4 + 4 + Key::SIZE + c.inline_value.len())
        .collect();
    let total: usize = sizes.iter().sum();
    let mut acc = 0usize;
    let mut idx = 1;
    for (i, s) in sizes.iter().enumerate() {
        acc += s;
        if acc * 2 >= total {
            idx = i + 1;
            break;
        }
    }
    idx.clamp(1, page.cells.len().saturating_sub(1).max(1))
}

fn split_leaf(page: &LeafPage, new_right_no: PageNo) -> (LeafPage, LeafPage, Key) {
    let idx = leaf_split_index(page);
    let right_cells = page.cells[idx..].to_vec();
    let left_cells = page.cells[..idx].to_vec();
    let promoted = right_cells[0].key;
    let left = LeafPage {
        right_sibling: new_right_no,
        cells: left_cells,
    };
    let right = LeafPage {
        right_sibling: page.right_sibling,
        cells: right_cells,
    };
    (left, right, promoted)
}

fn split_internal(page: &InternalPage, new_right_no: PageNo) -> (InternalPage, InternalPage, Key) {
    let mid = page.cells.len() / 2;
    let promoted = page.cells[mid].key;
    let left = InternalPage {
        left_child: page.left_child,
        right_sibling: new_right_no,
        cells: page.cells[..mid].to_vec(),
    };
    let right = InternalPage {
        left_child: page.cells[mid].child,
        right_sibling: page.right_sibling,
        cells: page.cells[mid + 1..].to_vec(),
    };
    (left, right, promoted)
}

/// One level of the descent path recorded while holding an exclusive
/// latch: the page number and its decoded contents at the time of
/// descent.
struct PathLevel {
    page_no: PageNo,
    page: InternalPage,
}

pub struct BTree {
    buffer: Mutex<BufferPool>,
    latches: LatchManager,
}

impl BTree {
    pub fn new(buffer: BufferPool) -> Self {
        BTree {
            buffer: Mutex::new(buffer),
            latches: LatchManager::new(),
        }
    }

    pub fn with_buffer<T>(&self, f: impl FnOnce(&mut BufferPool) -> Result<T>) -> Result<T> {
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        f(&mut buffer)
    }

    fn meta(&self, buffer: &mut BufferPool) -> Meta {
        buffer.page_store().meta().clone()
    }

    // ---- read path -----------------------------------------------------

    pub fn get(&self, key: Key) -> Result<Option<Vec<u8>>> {
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        let meta = self.meta(&mut buffer);
        let mut cur = meta.root_page;
        let mut _latch = self.latches.acquire_shared(cur);

        loop {
            let bytes = buffer.get_page(cur)?;
            let ty = codec::page_type_of(&bytes)
                .ok_or_else(|| Error::CorruptPage { page: cur, reason: "unknown page type".into() })?;
            match ty {
                PageType::Internal => {
                    let page = codec::decode_internal(&bytes, cur)?;
                    buffer.unpin(cur, false)?;
                    if internal_should_move_right(&page, key) {
                        let next = page.right_sibling;
                        _latch = self.latches.acquire_shared(next);
                        cur = next;
                        continue;
                    }
                    let child = internal_choose_child(&page, key);
                    _latch = self.latches.acquire_shared(child);
                    cur = child;
                }
                PageType::Leaf => {
                    let page = codec::decode_leaf(&bytes, cur)?;
                    buffer.unpin(cur, false)?;
                    if leaf_should_move_right(&page, key) {
                        let next = page.right_sibling;
                        _latch = self.latches.acquire_shared(next);
                        cur = next;
                        continue;
                    }
                    return match page.cells.binary_search_by_key(&key, |c| c.key) {
                        Ok(idx) => Ok(Some(materialize_value(&mut buffer, &page.cells[idx])?)),
                        Err(_) => Ok(None),
                    };
                }
                other => {
                    return Err(Error::CorruptPage {
                        page: cur,
                        reason: format!("expected internal/leaf page, found {:?}", other),
                    })
                }
            }
        }
    }

    /// Traverses to the leaf containing `start`, yielding cells with
    /// `start <= key <= end`, following `rightSibling` as needed. Only
    /// the currently pinned leaf is latched at any one time.
    pub fn range(&self, start: Key, end: Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let mut out = Vec::new();
        if end < start {
            return Ok(out);
        }
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        let meta = self.meta(&mut buffer);
        let mut cur = meta.root_page;
        let mut _latch = self.latches.acquire_shared(cur);

        // Descend to the leaf that should contain `start`.
        loop {
            let bytes = buffer.get_page(cur)?;
            match codec::page_type_of(&bytes) {
                Some(PageType::Internal) => {
                    let page = codec::decode_internal(&bytes, cur)?;
                    buffer.unpin(cur, false)?;
                    if internal_should_move_right(&page, start) {
                        let next = page.right_sibling;
                        _latch = self.latches.acquire_shared(next);
                        cur = next;
                        continue;
                    }
                    let child = internal_choose_child(&page, start);
                    _latch = self.latches.acquire_shared(child);
                    cur = child;
                }
                Some(PageType::Leaf) => {
                    buffer.unpin(cur, false)?;
                    break;
                }
                other => {
                    return Err(Error::CorruptPage {
                        page: cur,
                        reason: format!("expected internal/leaf page, found {:?}", other),
                    })
                }
            }
        }

        loop {
            let bytes = buffer.get_page(cur)?;
            let page = codec::decode_leaf(&bytes, cur)?;
            buffer.unpin(cur, false)?;
            let mut stop = false;
            for cell in &page.cells {
                if cell.key < start {
                    continue;
                }
                if cell.key > end {
                    stop = true;
                    break;
                }
                let v = materialize_value(&mut buffer, cell)?;
                out.push((cell.key, v));
            }
            if stop || page.right_sibling == 0 {
                break;
            }
            let next = page.right_sibling;
            _latch = self.latches.acquire_shared(next);
            cur = next;
        }
        Ok(out)
    }

    pub fn keys(&self, start: Key, end: Key) -> Result<Vec<Key>> {
        Ok(self.range(start, end)?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn values(&self, start: Key, end: Key) -> Result<Vec<Vec<u8>>> {
        Ok(self.range(start, end)?.into_iter().map(|(_, v)| v).collect())
    }

    // ---- write path: insert/overwrite ----------------------------------

    pub fn set(&self, key: Key, value: &[u8]) -> Result<()> {
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        let page_size = buffer.page_store().page_size();
        let max_inline = codec::max_inline_value_len(page_size);
        let meta = self.meta(&mut buffer);

        let mut path: Vec<PathLevel> = Vec::new();
        let mut latches: Vec<LatchGuard> = Vec::new();
        let mut touched: Vec<PageNo> = Vec::new();
        let mut cur = meta.root_page;
        latches.push(self.latches.acquire_exclusive(cur));

        let (leaf_no, mut leaf_page) = loop {
            let bytes = buffer.get_page(cur)?;
            match codec::page_type_of(&bytes) {
                Some(PageType::Internal) => {
                    let page = codec::decode_internal(&bytes, cur)?;
                    buffer.unpin(cur, false)?;
                    if internal_should_move_right(&page, key) {
                        let next = page.right_sibling;
                        latches.push(self.latches.acquire_exclusive(next));
                        cur = next;
                        continue;
                    }
                    let child = internal_choose_child(&page, key);
                    path.push(PathLevel { page_no: cur, page });
                    latches.push(self.latches.acquire_exclusive(child));
                    cur = child;
                }
                Some(PageType::Leaf) => {
                    let page = codec::decode_leaf(&bytes, cur)?;
                    buffer.unpin(cur, false)?;
                    if leaf_should_move_right(&page, key) {
                        let next = page.right_sibling;
                        latches.push(self.latches.acquire_exclusive(next));
                        cur = next;
                        continue;
                    }
                    break (cur, page);
                }
                other => {
                    return Err(Error::CorruptPage {
                        page: cur,
                        reason: format!("expected internal/leaf page, found {:?}", other),
                    })
                }
            }
        };

        let (inline_value, overflow_head, total_len) = prepare_value(&mut buffer, value, max_inline)?;
        let mut meta = meta;

        match leaf_page.cells.binary_search_by_key(&key, |c| c.key) {
            Ok(idx) => {
                let old = leaf_page.cells[idx].clone();
                if old.has_overflow() {
                    OverflowStore::free_chain(buffer.page_store_mut(), old.overflow_head)?;
                }
                leaf_page.cells[idx] = LeafCell {
                    key,
                    inline_value,
                    total_value_len: total_len,
                    overflow_head,
                };
            }
            Err(idx) => {
                leaf_page.cells.insert(
                    idx,
                    LeafCell {
                        key,
                        inline_value,
                        total_value_len: total_len,
                        overflow_head,
                    },
                );
                meta.key_count += 1;
                buffer.page_store_mut().write_meta(&meta)?;
            }
        }

        match codec::encode_leaf(&leaf_page, page_size) {
            Ok(bytes) => {
                write_page_through(&mut buffer, &mut touched, leaf_no, bytes)?;
                log::trace!("set: leaf {} updated in place", leaf_no);
            }
            Err(_) => {
                let new_right_no = buffer.page_store_mut().allocate_page()?;
                latches.push(self.latches.acquire_exclusive(new_right_no));
                let (left, right, promoted) = split_leaf(&leaf_page, new_right_no);
                write_page_through(&mut buffer, &mut touched, leaf_no, codec::encode_leaf(&left, page_size)?)?;
                write_page_through(&mut buffer, &mut touched, new_right_no, codec::encode_leaf(&right, page_size)?)?;
                log::debug!("set: leaf {} split, new sibling {}", leaf_no, new_right_no);
                self.propagate_split(&mut buffer, &mut touched, &mut path, &mut latches, &mut meta, promoted, new_right_no)?;
            }
        }
        buffer.flush_pages(&touched)?;
        Ok(())
    }

    /// Inserts `(promoted_key, new_child)` into the parent named by the
    /// last entry of `path`, splitting (and recursing) as needed; grows a
    /// new root if propagation reaches above the current root.
    fn propagate_split(
        &self,
        buffer: &mut BufferPool,
        touched: &mut Vec<PageNo>,
        path: &mut Vec<PathLevel>,
        latches: &mut Vec<LatchGuard>,
        meta: &mut Meta,
        promoted_key: Key,
        new_child: PageNo,
    ) -> Result<()> {
        let page_size = buffer.page_store().page_size();
        match path.pop() {
            None => {
                // Propagation reached above the root: grow a new root.
                let new_root_no = buffer.page_store_mut().allocate_page()?;
                latches.push(self.latches.acquire_exclusive(new_root_no));
                let new_root = InternalPage {
                    left_child: meta.root_page,
                    right_sibling: 0,
                    cells: vec![InternalCell {
                        key: promoted_key,
                        child: new_child,
                    }],
                };
                write_page_through(buffer, touched, new_root_no, codec::encode_internal(&new_root, page_size)?)?;
                meta.root_page = new_root_no;
                meta.tree_depth += 1;
                buffer.page_store_mut().write_meta(meta)?;
                log::debug!("set: grew new root {} (depth {})", new_root_no, meta.tree_depth);
                Ok(())
            }
            Some(level) => {
                let mut page = level.page;
                let idx = page
                    .cells
                    .iter()
                    .position(|c| c.key > promoted_key)
                    .unwrap_or(page.cells.len());
                page.cells.insert(idx, InternalCell { key: promoted_key, child: new_child });

                if page.cells.len() <= max_internal_keys(page_size) {
                    write_page_through(buffer, touched, level.page_no, codec::encode_internal(&page, page_size)?)?;
                    Ok(())
                } else {
                    let new_right_no = buffer.page_store_mut().allocate_page()?;
                    latches.push(self.latches.acquire_exclusive(new_right_no));
                    let (left, right, promoted) = split_internal(&page, new_right_no);
                    write_page_through(buffer, touched, level.page_no, codec::encode_internal(&left, page_size)?)?;
                    write_page_through(buffer, touched, new_right_no, codec::encode_internal(&right, page_size)?)?;
                    self.propagate_split(buffer, touched, path, latches, meta, promoted, new_right_no)
                }
            }
        }
    }

    // ---- write path: delete ---------------------------------------------

    pub fn delete(&self, key: Key) -> Result<bool> {
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        let page_size = buffer.page_store().page_size();
        let mut meta = self.meta(&mut buffer);

        let mut path: Vec<PathLevel> = Vec::new();
        let mut latches: Vec<LatchGuard> = Vec::new();
        let mut touched: Vec<PageNo> = Vec::new();
        let mut cur = meta.root_page;
        latches.push(self.latches.acquire_exclusive(cur));

        let (leaf_no, mut leaf_page) = loop {
            let bytes = buffer.get_page(cur)?;
            match codec::page_type_of(&bytes) {
                Some(PageType::Internal) => {
                    let page = codec::decode_internal(&bytes, cur)?;
                    buffer.unpin(cur, false)?;
                    if internal_should_move_right(&page, key) {
                        let next = page.right_sibling;
                        latches.push(self.latches.acquire_exclusive(next));
                        cur = next;
                        continue;
                    }
                    let child = internal_choose_child(&page, key);
                    path.push(PathLevel { page_no: cur, page });
                    latches.push(self.latches.acquire_exclusive(child));
                    cur = child;
                }
                Some(PageType::Leaf) => {
                    let page = codec::decode_leaf(&bytes, cur)?;
                    buffer.unpin(cur, false)?;
                    if leaf_should_move_right(&page, key) {
                        let next = page.right_sibling;
                        latches.push(self.latches.acquire_exclusive(next));
                        cur = next;
                        continue;
                    }
                    break (cur, page);
                }
                other => {
                    return Err(Error::CorruptPage {
                        page: cur,
                        reason: format!("expected internal/leaf page, found {:?}", other),
                    })
                }
            }
        };

        let idx = match leaf_page.cells.binary_search_by_key(&key, |c| c.key) {
            Ok(idx) => idx,
            Err(_) => return Ok(false),
        };
        let removed = leaf_page.cells.remove(idx);
        if removed.has_overflow() {
            OverflowStore::free_chain(buffer.page_store_mut(), removed.overflow_head)?;
        }
        meta.key_count -= 1;
        buffer.page_store_mut().write_meta(&meta)?;

        if path.is_empty() {
            // Root is a leaf: no rebalance, may legitimately become empty.
            write_page_through(&mut buffer, &mut touched, leaf_no, codec::encode_leaf(&leaf_page, page_size)?)?;
            buffer.flush_pages(&touched)?;
            return Ok(true);
        }

        if leaf_page.cells.len() >= min_leaf_keys(page_size) {
            write_page_through(&mut buffer, &mut touched, leaf_no, codec::encode_leaf(&leaf_page, page_size)?)?;
            buffer.flush_pages(&touched)?;
            return Ok(true);
        }

        self.rebalance_leaf(&mut buffer, &mut touched, &mut path, &mut latches, leaf_no, leaf_page, page_size)?;
        self.rebalance_internal_path(&mut buffer, &mut touched, &mut path, &mut latches, &mut meta, page_size)?;
        buffer.flush_pages(&touched)?;
        Ok(true)
    }

    fn rebalance_leaf(
        &self,
        buffer: &mut BufferPool,
        touched: &mut Vec<PageNo>,
        path: &mut Vec<PathLevel>,
        latches: &mut Vec<LatchGuard>,
        leaf_no: PageNo,
        mut leaf_page: LeafPage,
        page_size: u32,
    ) -> Result<()> {
        let parent_level = path.last_mut().expect("leaf rebalance requires a parent");
        let idx = child_index_in_parent(&parent_level.page, leaf_no)
            .ok_or_else(|| Error::CorruptPage { page: leaf_no, reason: "parent missing child pointer".into() })?;

        if let Some(left_no) = left_sibling_of(&parent_level.page, idx) {
            latches.push(self.latches.acquire_exclusive(left_no));
            let bytes = buffer.get_page(left_no)?;
            let mut left_page = codec::decode_leaf(&bytes, left_no)?;
            buffer.unpin(left_no, false)?;
            if left_page.cells.len() > min_leaf_keys(page_size) {
                let borrowed = left_page.cells.pop().unwrap();
                leaf_page.cells.insert(0, borrowed.clone());
                write_page_through(buffer, touched, left_no, codec::encode_leaf(&left_page, page_size)?)?;
                write_page_through(buffer, touched, leaf_no, codec::encode_leaf(&leaf_page, page_size)?)?;
                if idx >= 0 {
                    parent_level.page.cells[idx as usize].key = borrowed.key;
                }
                return Ok(());
            }
        }

        if let Some(right_no) = right_sibling_of(&parent_level.page, idx) {
            latches.push(self.latches.acquire_exclusive(right_no));
            let bytes = buffer.get_page(right_no)?;
            let mut right_page = codec::decode_leaf(&bytes, right_no)?;
            buffer.unpin(right_no, false)?;
            if right_page.cells.len() > min_leaf_keys(page_size) {
                let borrowed = right_page.cells.remove(0);
                leaf_page.cells.push(borrowed);
                write_page_through(buffer, touched, right_no, codec::encode_leaf(&right_page, page_size)?)?;
                write_page_through(buffer, touched, leaf_no, codec::encode_leaf(&leaf_page, page_size)?)?;
                let right_idx = if idx == -1 { 0 } else { (idx + 1) as usize };
                if let Some(new_first) = right_page_first_key(buffer, right_no, page_size)? {
                    parent_level.page.cells[right_idx].key = new_first;
                }
                return Ok(());
            }
        }

        // Merge: prefer left.
        if let Some(left_no) = left_sibling_of(&parent_level.page, idx) {
            let bytes = buffer.get_page(left_no)?;
            let mut left_page = codec::decode_leaf(&bytes, left_no)?;
            buffer.unpin(left_no, false)?;
            left_page.cells.extend(leaf_page.cells.clone());
            left_page.right_sibling = leaf_page.right_sibling;
            if let Ok(bytes) = codec::encode_leaf(&left_page, page_size) {
                write_page_through(buffer, touched, left_no, bytes)?;
                buffer.drop_page(leaf_no).ok();
                buffer.page_store_mut().free_page(leaf_no)?;
                parent_level.page.cells.remove(idx as usize);
                return Ok(());
            }
        }

        // Merge with right.
        if let Some(right_no) = right_sibling_of(&parent_level.page, idx) {
            let bytes = buffer.get_page(right_no)?;
            let right_page = codec::decode_leaf(&bytes, right_no)?;
            buffer.unpin(right_no, false)?;
            leaf_page.cells.extend(right_page.cells.clone());
            leaf_page.right_sibling = right_page.right_sibling;
            if let Ok(bytes) = codec::encode_leaf(&leaf_page, page_size) {
                write_page_through(buffer, touched, leaf_no, bytes)?;
                buffer.drop_page(right_no).ok();
                buffer.page_store_mut().free_page(right_no)?;
                let right_idx = if idx == -1 { 0 } else { (idx + 1) as usize };
                parent_level.page.cells.remove(right_idx);
                return Ok(());
            }
        }

        // Neither borrow nor merge was possible (e.g. an only child): keep
        // the leaf under-full rather than fail the operation.
        write_page_through(buffer, touched, leaf_no, codec::encode_leaf(&leaf_page, page_size)?)?;
        Ok(())
    }

    fn rebalance_internal_path(
        &self,
        buffer: &mut BufferPool,
        touched: &mut Vec<PageNo>,
        path: &mut Vec<PathLevel>,
        latches: &mut Vec<LatchGuard>,
        meta: &mut Meta,
        page_size: u32,
    ) -> Result<()> {
        loop {
            let Some(mut level) = path.pop() else { return Ok(()) };

            // Persist changes a child-level rebalance made to this node
            // (separator key updates) before checking thresholds.
            if level.page.cells.len() >= min_internal_keys(page_size) {
                write_page_through(buffer, touched, level.page_no, codec::encode_internal(&level.page, page_size)?)?;
                continue;
            }

            if path.is_empty() {
                // Root underflow: if it has no cells left, promote its
                // leftChild to be the new root.
                if level.page.cells.is_empty() {
                    meta.root_page = level.page.left_child;
                    meta.tree_depth = meta.tree_depth.saturating_sub(1).max(1);
                    buffer.page_store_mut().write_meta(meta)?;
                    buffer.drop_page(level.page_no).ok();
                    buffer.page_store_mut().free_page(level.page_no)?;
                    log::debug!("delete: root collapsed to {} (depth {})", meta.root_page, meta.tree_depth);
                } else {
                    write_page_through(buffer, touched, level.page_no, codec::encode_internal(&level.page, page_size)?)?;
                }
                return Ok(());
            }

            let parent_level = path.last_mut().unwrap();
            let idx = child_index_in_parent(&parent_level.page, level.page_no)
                .ok_or_else(|| Error::CorruptPage { page: level.page_no, reason: "parent missing child pointer".into() })?;

            if let Some(left_no) = left_sibling_of(&parent_level.page, idx) {
                latches.push(self.latches.acquire_exclusive(left_no));
                let bytes = buffer.get_page(left_no)?;
                let mut left_page = codec::decode_internal(&bytes, left_no)?;
                buffer.unpin(left_no, false)?;
                if left_page.cells.len() > min_internal_keys(page_size) {
                    let glue_key = parent_level.page.cells[idx as usize].key;
                    let borrowed = left_page.cells.pop().unwrap();
                    level.page.cells.insert(0, InternalCell { key: glue_key, child: level.page.left_child });
                    level.page.left_child = borrowed.child;
                    parent_level.page.cells[idx as usize].key = borrowed.key;
                    write_page_through(buffer, touched, left_no, codec::encode_internal(&left_page, page_size)?)?;
                    write_page_through(buffer, touched, level.page_no, codec::encode_internal(&level.page, page_size)?)?;
                    continue;
                }
            }

            if let Some(right_no) = right_sibling_of(&parent_level.page, idx) {
                latches.push(self.latches.acquire_exclusive(right_no));
                let bytes = buffer.get_page(right_no)?;
                let mut right_page = codec::decode_internal(&bytes, right_no)?;
                buffer.unpin(right_no, false)?;
                let right_idx = if idx == -1 { 0 } else { (idx + 1) as usize };
                if right_page.cells.len() > min_internal_keys(page_size) {
                    let glue_key = parent_level.page.cells[right_idx].key;
                    let promoted_child = right_page.left_child;
                    let new_first = right_page.cells.remove(0);
                    right_page.left_child = new_first.child;
                    level.page.cells.push(InternalCell { key: glue_key, child: promoted_child });
                    parent_level.page.cells[right_idx].key = new_first.key;
                    write_page_through(buffer, touched, right_no, codec::encode_internal(&right_page, page_size)?)?;
                    write_page_through(buffer, touched, level.page_no, codec::encode_internal(&level.page, page_size)?)?;
                    continue;
                }
            }

            // Merge: prefer left.
            if let Some(left_no) = left_sibling_of(&parent_level.page, idx) {
                let bytes = buffer.get_page(left_no)?;
                let mut left_page = codec::decode_internal(&bytes, left_no)?;
                buffer.unpin(left_no, false)?;
                let glue_key = parent_level.page.cells[idx as usize].key;
                left_page.cells.push(InternalCell { key: glue_key, child: level.page.left_child });
                left_page.cells.extend(level.page.cells.clone());
                left_page.right_sibling = level.page.right_sibling;
                write_page_through(buffer, touched, left_no, codec::encode_internal(&left_page, page_size)?)?;
                buffer.drop_page(level.page_no).ok();
                buffer.page_store_mut().free_page(level.page_no)?;
                parent_level.page.cells.remove(idx as usize);
                continue;
            }

            // Merge with right.
            if let Some(right_no) = right_sibling_of(&parent_level.page, idx) {
                let bytes = buffer.get_page(right_no)?;
                let right_page = codec::decode_internal(&bytes, right_no)?;
                buffer.unpin(right_no, false)?;
                let right_idx = if idx == -1 { 0 } else { (idx + 1) as usize };
                let glue_key = parent_level.page.cells[right_idx].key;
                level.page.cells.push(InternalCell { key: glue_key, child: right_page.left_child });
                level.page.cells.extend(right_page.cells.clone());
                level.page.right_sibling = right_page.right_sibling;
                write_page_through(buffer, touched, level.page_no, codec::encode_internal(&level.page, page_size)?)?;
                buffer.drop_page(right_no).ok();
                buffer.page_store_mut().free_page(right_no)?;
                parent_level.page.cells.remove(right_idx);
                continue;
            }

            // No sibling available under this parent: leave under-full.
            write_page_through(buffer, touched, level.page_no, codec::encode_internal(&level.page, page_size)?)?;
        }
    }

    // ---- maintenance -----------------------------------------------------

    /// DFS from root with a visited set to detect cycles; checks type and
    /// depth expectations at every level, and that the total number of
    /// leaf cells across the tree matches `meta.key_count`.
    pub fn consistency_check(&self) -> Result<bool> {
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        let meta = self.meta(&mut buffer);
        let mut visited = std::collections::HashSet::new();
        let mut leaf_cells: u64 = 0;
        let ok = self.check_subtree(&mut buffer, meta.root_page, meta.tree_depth, &mut visited, &mut leaf_cells)?;
        if leaf_cells != meta.key_count {
            log::error!(
                "consistency check: leaf cell count {} does not match meta.key_count {}",
                leaf_cells,
                meta.key_count
            );
            return Ok(false);
        }
        Ok(ok)
    }

    fn check_subtree(
        &self,
        buffer: &mut BufferPool,
        page_no: PageNo,
        depth: u32,
        visited: &mut std::collections::HashSet<PageNo>,
        leaf_cells: &mut u64,
    ) -> Result<bool> {
        if !visited.insert(page_no) {
            return Ok(false);
        }
        let bytes = buffer.get_page(page_no)?;
        let ty = codec::page_type_of(&bytes);
        if depth == 1 {
            let is_leaf = matches!(ty, Some(PageType::Leaf));
            if is_leaf {
                let page = codec::decode_leaf(&bytes, page_no)?;
                *leaf_cells += page.cells.len() as u64;
            }
            buffer.unpin(page_no, false)?;
            return Ok(is_leaf);
        }
        buffer.unpin(page_no, false)?;
        match ty {
            Some(PageType::Internal) => {
                let bytes = buffer.get_page(page_no)?;
                let page = codec::decode_internal(&bytes, page_no)?;
                buffer.unpin(page_no, false)?;
                let mut ok = self.check_subtree(buffer, page.left_child, depth - 1, visited, leaf_cells)?;
                for cell in &page.cells {
                    ok &= self.check_subtree(buffer, cell.child, depth - 1, visited, leaf_cells)?;
                }
                Ok(ok)
            }
            _ => Ok(false),
        }
    }

    /// Locks exclusively; flushes and checkpoints; collects all live
    /// (key, value) pairs via a left-to-right leaf walk; resets the
    /// buffer pool, WAL, and tree; truncates the file to 3 pages;
    /// reinserts every entry.
    pub fn defragment(&self) -> Result<()> {
        let entries = self.range(Key(u64::MIN), Key(u64::MAX))?;
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        buffer.flush_all()?;
        let fresh = Meta::fresh(buffer.page_store().page_size());
        buffer.page_store_mut().write_meta(&fresh)?;
        buffer.page_store_mut().truncate_pages(crate::types::FIRST_ALLOCATABLE_PAGE)?;
        let empty_leaf = LeafPage { right_sibling: 0, cells: vec![] };
        let page_size = buffer.page_store().page_size();
        buffer
            .page_store_mut()
            .write_page_raw(crate::types::INITIAL_ROOT_PAGE, &codec::encode_leaf(&empty_leaf, page_size)?)?;
        buffer.reset();
        drop(buffer);
        self.latches.reset();

        log::info!("defragment: reinserting {} entries", entries.len());
        for (k, v) in entries {
            self.set(k, &v)?;
        }
        Ok(())
    }

    pub fn vacuum(&self) -> Result<(u32, u32)> {
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        buffer.flush_all()?;
        buffer.page_store_mut().vacuum()
    }

    pub fn flush_all(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().expect("buffer pool poisoned");
        buffer.flush_all()
    }
}

fn right_page_first_key(buffer: &mut BufferPool, page_no: PageNo, _page_size: u32) -> Result<Option<Key>> {
    let bytes = buffer.get_page(page_no)?;
    let page = codec::decode_leaf(&bytes, page_no)?;
    buffer.unpin(page_no, false)?;
    Ok(page.cells.first().map(|c| c.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionPolicy;
    use crate::page_store::PageStore;
    use crate::wal::Wal;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_tree(page_size: u32) -> (tempfile::TempDir, BTree) {
        let dir = tempdir().unwrap();
        let ps = PageStore::initialize(dir.path().join("s.db"), page_size, None).unwrap();
        let wal = Arc::new(Wal::open(dir.path().join("s.wal"), page_size).unwrap());
        let bp = BufferPool::new(ps, wal, 64, EvictionPolicy::Lru, true);
        (dir, BTree::new(bp))
    }

    #[test]
    fn basic_put_get_delete() {
        let (_dir, tree) = make_tree(512);
        tree.set(Key(1), b"hello").unwrap();
        tree.set(Key(2), b"world").unwrap();
        assert_eq!(tree.get(Key(1)).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(tree.get(Key(2)).unwrap(), Some(b"world".to_vec()));
        assert!(tree.delete(Key(1)).unwrap());
        assert_eq!(tree.get(Key(1)).unwrap(), None);
        assert_eq!(tree.get(Key(2)).unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn many_inserts_trigger_splits_and_range_scan() {
        let (_dir, tree) = make_tree(512);
        for k in 0..200u64 {
            tree.set(Key(k), &(k as u32).to_le_bytes()).unwrap();
        }
        let found = tree.range(Key(0), Key(199)).unwrap();
        assert_eq!(found.len(), 200);
        for (i, (k, v)) in found.iter().enumerate() {
            assert_eq!(k.0, i as u64);
            assert_eq!(u32::from_le_bytes(v.as_slice().try_into().unwrap()), i as u32);
        }
        assert!(tree.consistency_check().unwrap());
    }

    #[test]
    fn deletes_preserve_remaining_keys() {
        let (_dir, tree) = make_tree(512);
        for k in 0..400u64 {
            tree.set(Key(k), &(k as u32).to_le_bytes()).unwrap();
        }
        for k in (0..400u64).step_by(2) {
            assert!(tree.delete(Key(k)).unwrap());
        }
        for k in 0..400u64 {
            let v = tree.get(Key(k)).unwrap();
            if k % 2 == 0 {
                assert_eq!(v, None);
            } else {
                assert_eq!(v, Some((k as u32).to_le_bytes().to_vec()));
            }
        }
        assert!(tree.consistency_check().unwrap());
    }

    #[test]
    fn overflow_value_roundtrips() {
        let (_dir, tree) = make_tree(512);
        let big = vec![0xABu8; 512 * 4];
        tree.set(Key(5), &big).unwrap();
        assert_eq!(tree.get(Key(5)).unwrap(), Some(big));
    }

    #[test]
    fn defragment_preserves_key_set() {
        let (_dir, tree) = make_tree(512);
        for k in 0..150u64 {
            tree.set(Key(k), &(k as u32).to_le_bytes()).unwrap();
        }
        tree.defragment().unwrap();
        for k in 0..150u64 {
            assert_eq!(tree.get(Key(k)).unwrap(), Some((k as u32).to_le_bytes().to_vec()));
        }
    }
}
