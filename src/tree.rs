//! The B+-tree engine: layout-driven search, split/insert, point get, range
//! iteration, and the virtual-mapping maintenance routines
//! (`fixMappings`/`updatePointers`/`clearMappings`), grounded end to end in
//! `vmtree.c`.
//!
//! `Tree` owns every piece of engine state (buffer pool, mapping table,
//! layout constants, active path, block device, comparator) as plain
//! fields — no process-global singleton, per the design note in spec.md §9
//! and a deliberate break from the teacher's `BufferPool::global()`.

use std::cmp::Ordering;
use std::convert::TryInto;

use log::{debug, info, trace};

use crate::buffer_pool::{BufferPool, BufferStats, TreeCallbacks, Validity};
use crate::error::{Result, VmtreeError};
use crate::mapping::{MappingStats, MappingTable};
use crate::page::{Layout, Mode, PageId, PageView, PageViewMut, INVALID_PAGE, PREV_ID_CONSTANT};
use crate::storage::BlockDevice;
use crate::TreeParams;

/// Key/byte-slice ordering capability, preserving the source's "opaque
/// comparator + key-size-in-bytes" shape (spec.md §9, "Untyped key/data").
pub trait Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Default comparator for 4-byte little-endian unsigned keys, used by every
/// scenario in spec.md §8. Uses the compare-then-return form uniformly
/// (never subtract-then-sign), per spec.md §9's note on comparator
/// duplication in the source.
pub struct U32Comparator;

impl Comparator for U32Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let av = u32::from_le_bytes(a[..4].try_into().expect("4-byte key"));
        let bv = u32::from_le_bytes(b[..4].try_into().expect("4-byte key"));
        av.cmp(&bv)
    }
}

/// Bridges `BufferPool::ensure_space`'s callback requirement to the tree's
/// mapping table without borrowing the whole `Tree` (disjoint field borrow
/// of `mapping`/`active_path`, leaving `buffer_pool`/`device` free).
struct CallbackCtx<'a> {
    mapping: &'a mut MappingTable,
}

impl<'a> TreeCallbacks for CallbackCtx<'a> {
    fn is_valid(&mut self, page_id: PageId) -> Result<Validity> {
        if self.mapping.resolve(page_id) != page_id {
            Ok(Validity::LiveViaMapping)
        } else {
            Ok(Validity::LiveDirect)
        }
    }

    fn move_page(&mut self, prev: PageId, curr: PageId, _buf: &mut [u8]) -> Result<()> {
        self.mapping.upsert(prev, curr)
    }

    fn check_mapping_space(&self) -> bool {
        self.mapping.count() < self.mapping.capacity()
    }
}

pub struct Tree {
    device: Box<dyn BlockDevice>,
    buffer_pool: BufferPool,
    mapping: MappingTable,
    layout: Layout,
    comparator: Box<dyn Comparator>,
    active_path: Vec<PageId>,
    levels: usize,
    mode: Mode,
    root: PageId,
}

impl Tree {
    pub fn init(device: Box<dyn BlockDevice>, params: TreeParams) -> Result<Self> {
        Self::init_with_comparator(device, params, Box::new(U32Comparator))
    }

    // TODO: this always formats a fresh empty root at page 0 rather than
    // scanning an existing device for one. Reopening a previously written
    // tree would need a boot-time scan to find the current root among
    // candidate root-flagged pages; until that lands, callers must treat
    // a device as single-session.
    pub fn init_with_comparator(
        mut device: Box<dyn BlockDevice>,
        params: TreeParams,
        comparator: Box<dyn Comparator>,
    ) -> Result<Self> {
        params.validate()?;
        let layout = Layout::compute(params.page_size, params.key_size, params.data_size, params.mode)?;
        let max_mappings = (params.mapping_buffer_size as usize / 8).max(1);
        let mut buffer_pool = BufferPool::new(
            params.page_size,
            params.num_buffer_pages,
            params.storage_size_pages,
            params.erase_size_in_pages,
        );
        // Invariant 7: the first two erase blocks are always erased at init.
        let first_two_blocks_end = (params.erase_size_in_pages as u32)
            .saturating_mul(2)
            .saturating_sub(1)
            .min(buffer_pool.end_data_page());
        device.erase_pages(0, first_two_blocks_end)?;
        buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(buffer_pool.frame_mut(0), &layout);
            pv.set_id(0);
            pv.set_root(true);
            pv.set_interior(false);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_count(0);
        }
        let root_buf = buffer_pool.frame(0).to_vec();
        device.write(0, layout.page_size, &root_buf)?;
        buffer_pool.set_valid(0);

        info!(
            "vmtree initialized: page_size={} key_size={} data_size={} mode={:?}",
            layout.page_size, layout.key_size, layout.data_size, params.mode
        );

        Ok(Tree {
            device,
            buffer_pool,
            mapping: MappingTable::new(max_mappings, 1),
            layout,
            comparator,
            active_path: vec![0],
            levels: 1,
            mode: params.mode,
            root: 0,
        })
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn mapping_count(&self) -> usize {
        self.mapping.count()
    }

    pub fn mapping_resolve(&mut self, p: PageId) -> PageId {
        self.mapping.resolve(p)
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer_pool.stats()
    }

    pub fn mapping_stats(&self) -> MappingStats {
        self.mapping.stats()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.device.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.device.flush()
    }

    // ---- allocation helpers -------------------------------------------------

    fn ensure_space(&mut self, n: u16) -> Result<()> {
        let mapping = &mut self.mapping;
        let mut ctx = CallbackCtx { mapping };
        self.buffer_pool.ensure_space(self.device.as_mut(), n, &mut ctx)
    }

    fn try_write(&mut self, buf: &mut [u8]) -> Result<PageId> {
        let mapping = &mut self.mapping;
        self.buffer_pool
            .write_page(self.device.as_mut(), buf, &mut |p| mapping.resolve(p))
    }

    fn alloc_write(&mut self, buf: &mut Vec<u8>) -> Result<PageId> {
        match self.try_write(buf) {
            Ok(id) => Ok(id),
            Err(VmtreeError::OutOfSpace { needed }) => {
                self.ensure_space(needed.max(1))?;
                self.try_write(buf)
            }
            Err(e) => Err(e),
        }
    }

    fn write_frame0_fresh(&mut self) -> Result<PageId> {
        let mut buf = self.buffer_pool.frame(0).to_vec();
        self.alloc_write(&mut buf)
    }

    // ---- search / descent ---------------------------------------------------

    fn binary_search_leaf(&self, view: &PageView, key: &[u8]) -> std::result::Result<usize, usize> {
        let count = view.count() as usize;
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.comparator.compare(view.key(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok(mid),
                Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    fn binary_search_interior_child(&self, view: &PageView, key: &[u8]) -> usize {
        let count = view.count() as usize;
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.comparator.compare(key, view.key(mid)) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    fn interior_sorted_nor(&self, view: &PageView) -> Vec<(Vec<u8>, u32)> {
        let mut v: Vec<(Vec<u8>, u32)> = (0..self.layout.max_interior_recs as usize)
            .filter(|&i| view.free_bit(i) == 0 && view.valid_bit(i) == 1)
            .map(|i| (view.key(i).to_vec(), view.pointer(i)))
            .collect();
        v.sort_by(|a, b| self.comparator.compare(&a.0, &b.0));
        v
    }

    fn interior_child_count(&self, view: &PageView) -> usize {
        if self.mode.is_nor() {
            self.interior_sorted_nor(view).len()
        } else {
            view.count() as usize + 1
        }
    }

    fn interior_child_pointer(&self, view: &PageView, idx: usize) -> u32 {
        if self.mode.is_nor() {
            self.interior_sorted_nor(view)[idx].1
        } else {
            view.pointer(idx)
        }
    }

    fn route_interior(&self, view: &PageView, key: &[u8]) -> u32 {
        if self.mode.is_nor() {
            let sorted = self.interior_sorted_nor(view);
            for (k, p) in &sorted {
                if self.comparator.compare(k, key) == Ordering::Greater {
                    return *p;
                }
            }
            sorted.last().map(|(_, p)| *p).unwrap_or(INVALID_PAGE)
        } else {
            let idx = self.binary_search_interior_child(view, key);
            view.pointer(idx)
        }
    }

    fn descend(&mut self, key: &[u8]) -> Result<PageId> {
        self.active_path.clear();
        let mut current = self.root;
        self.active_path.push(current);
        loop {
            let frame = self
                .buffer_pool
                .read(self.device.as_mut(), current, current == self.root)?;
            let view = PageView::new(self.buffer_pool.frame(frame), &self.layout);
            if !view.is_interior() {
                return Ok(current);
            }
            let raw = self.route_interior(&view, key);
            current = self.mapping.resolve(raw);
            self.active_path.push(current);
        }
    }

    // ---- point get ------------------------------------------------------------

    pub fn get(&mut self, key: &[u8], out: &mut [u8]) -> Result<()> {
        self.check_key_size(key)?;
        let leaf_id = self.descend(key)?;
        let frame = self
            .buffer_pool
            .read(self.device.as_mut(), leaf_id, leaf_id == self.root)?;
        let view = PageView::new(self.buffer_pool.frame(frame), &self.layout);
        if self.mode.is_nor() {
            for i in 0..self.layout.max_leaf_recs as usize {
                if view.free_bit(i) == 0
                    && view.valid_bit(i) == 1
                    && self.comparator.compare(view.key(i), key) == Ordering::Equal
                {
                    out[..self.layout.data_size as usize].copy_from_slice(view.data(i));
                    return Ok(());
                }
            }
            Err(VmtreeError::NotFound)
        } else {
            match self.binary_search_leaf(&view, key) {
                Ok(idx) => {
                    out[..self.layout.data_size as usize].copy_from_slice(view.data(idx));
                    Ok(())
                }
                Err(_) => Err(VmtreeError::NotFound),
            }
        }
    }

    fn check_key_size(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.layout.key_size as usize {
            return Err(VmtreeError::Invariant(format!(
                "key length {} does not match configured key_size {}",
                key.len(),
                self.layout.key_size
            )));
        }
        Ok(())
    }

    // ---- insert: dispatch -------------------------------------------------

    pub fn put(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.check_key_size(key)?;
        if data.len() != self.layout.data_size as usize {
            return Err(VmtreeError::Invariant(format!(
                "data length {} does not match configured data_size {}",
                data.len(),
                self.layout.data_size
            )));
        }
        let leaf_id = self.descend(key)?;
        if self.mode.is_nor() {
            self.put_nor_leaf(leaf_id, key, data)
        } else {
            self.put_plain_leaf(leaf_id, key, data)
        }
    }

    // ---- plain (SEQUENTIAL / OVERWRITE) insert -----------------------------

    fn put_plain_leaf(&mut self, leaf_id: PageId, key: &[u8], data: &[u8]) -> Result<()> {
        self.buffer_pool.read_into(self.device.as_mut(), leaf_id, 0)?;
        let count = { PageView::new(self.buffer_pool.frame(0), &self.layout).count() as usize };
        let (pos, is_update) = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            match self.binary_search_leaf(&view, key) {
                Ok(i) => (i, true),
                Err(i) => (i, false),
            }
        };

        if is_update {
            {
                let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
                pv.set_data(pos, data);
            }
            return self.finish_leaf_rewrite(leaf_id);
        }

        if count < self.layout.max_leaf_recs as usize {
            {
                let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
                if pos < count {
                    pv.shift_leaf_records_right(pos, count);
                }
                pv.set_key(pos, key);
                pv.set_data(pos, data);
                pv.set_count((count + 1) as u16);
            }
            self.finish_leaf_rewrite(leaf_id)
        } else {
            self.split_leaf_write(leaf_id, pos, key, data)
        }
    }

    fn finish_leaf_rewrite(&mut self, old_id: PageId) -> Result<()> {
        let is_root = self.levels == 1;
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            pv.set_interior(false);
            pv.set_root(is_root);
            pv.set_prev_id(old_id);
        }
        self.buffer_pool.set_free(old_id);
        let new_id = self.write_frame0_fresh()?;
        if is_root {
            self.root = new_id;
            self.active_path[0] = new_id;
        } else {
            self.fix_mappings(old_id, new_id, self.levels as isize - 2)?;
        }
        debug!("leaf {old_id} rewritten as {new_id}");
        Ok(())
    }

    fn split_leaf_and_insert(
        &mut self,
        leaf_id: PageId,
        pos: usize,
        key: &[u8],
        data: &[u8],
    ) -> Result<(PageId, PageId, Vec<u8>)> {
        let count = self.layout.max_leaf_recs as usize;
        let mut recs: Vec<(Vec<u8>, Vec<u8>)> = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            (0..count)
                .map(|i| (view.key(i).to_vec(), view.data(i).to_vec()))
                .collect()
        };
        recs.insert(pos, (key.to_vec(), data.to_vec()));
        let mid = recs.len() / 2;
        let right_min_key = recs[mid].0.clone();

        self.buffer_pool.set_free(leaf_id);

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, (k, d)) in recs[0..mid].iter().enumerate() {
                pv.set_key(i, k);
                pv.set_data(i, d);
            }
            pv.set_count(mid as u16);
            pv.set_interior(false);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let left_id = self.write_frame0_fresh()?;

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, (k, d)) in recs[mid..].iter().enumerate() {
                pv.set_key(i, k);
                pv.set_data(i, d);
            }
            pv.set_count((recs.len() - mid) as u16);
            pv.set_interior(false);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let right_id = self.write_frame0_fresh()?;

        Ok((left_id, right_id, right_min_key))
    }

    fn split_leaf_write(&mut self, leaf_id: PageId, pos: usize, key: &[u8], data: &[u8]) -> Result<()> {
        let (left_id, right_id, right_min_key) = self.split_leaf_and_insert(leaf_id, pos, key, data)?;
        debug!("leaf {leaf_id} split into {left_id}/{right_id}");
        if self.levels == 1 {
            self.create_new_root(left_id, right_min_key, right_id)
        } else {
            let level = self.levels as isize - 2;
            self.fix_mappings(leaf_id, left_id, level)?;
            self.insert_separator_upward(right_min_key, right_id, level as usize)
        }
    }

    fn create_new_root(&mut self, left: PageId, sep_key: Vec<u8>, right: PageId) -> Result<()> {
        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            pv.set_key(0, &sep_key);
            pv.set_pointer(0, left);
            pv.set_pointer(1, right);
            pv.set_count(1);
            pv.set_interior(true);
            pv.set_root(true);
            pv.set_prev_id(PREV_ID_CONSTANT);
        }
        let new_root_id = self.write_frame0_fresh()?;
        self.root = new_root_id;
        self.levels += 1;
        self.active_path.insert(0, new_root_id);
        info!("new root {new_root_id}, tree now has {} levels", self.levels);
        Ok(())
    }

    /// Inserts a new (separator key, right child) boundary into
    /// `active_path[level]`, splitting and propagating further up if that
    /// ancestor is also full.
    fn insert_separator_upward(
        &mut self,
        mut sep_key: Vec<u8>,
        mut right_child: PageId,
        mut level: usize,
    ) -> Result<()> {
        loop {
            let parent_id = self.active_path[level];
            self.buffer_pool.set_free(parent_id);
            self.buffer_pool.read_into(self.device.as_mut(), parent_id, 0)?;
            let count = { PageView::new(self.buffer_pool.frame(0), &self.layout).count() as usize };
            let pos = {
                let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
                self.binary_search_interior_child(&view, &sep_key)
            };

            if count < self.layout.max_interior_recs as usize {
                self.update_pointers_frame0()?;
                {
                    let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
                    pv.shift_interior_keys_right(pos, count);
                    pv.shift_interior_pointers_right(pos + 1, count + 1);
                    pv.set_key(pos, &sep_key);
                    pv.set_pointer(pos + 1, right_child);
                    pv.set_count((count + 1) as u16);
                    pv.set_interior(true);
                    pv.set_prev_id(PREV_ID_CONSTANT);
                    pv.set_root(level == 0);
                }
                let new_id = self.write_frame0_fresh()?;
                if level == 0 {
                    self.root = new_id;
                    self.active_path[0] = new_id;
                } else {
                    self.fix_mappings(parent_id, new_id, level as isize - 1)?;
                }
                return Ok(());
            }

            let (left_id, right_id, promoted) = self.split_interior_and_insert(pos, sep_key.clone(), right_child)?;
            debug!("interior {parent_id} split into {left_id}/{right_id}");
            if level == 0 {
                self.create_new_root(left_id, promoted, right_id)?;
                return Ok(());
            }
            self.fix_mappings(parent_id, left_id, level as isize - 1)?;
            sep_key = promoted;
            right_child = right_id;
            level -= 1;
        }
    }

    fn split_interior_and_insert(
        &mut self,
        pos: usize,
        sep_key: Vec<u8>,
        right_child: PageId,
    ) -> Result<(PageId, PageId, Vec<u8>)> {
        let count = self.layout.max_interior_recs as usize;
        let (mut keys, mut ptrs) = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            let keys: Vec<Vec<u8>> = (0..count).map(|i| view.key(i).to_vec()).collect();
            let ptrs: Vec<u32> = (0..=count).map(|i| view.pointer(i)).collect();
            (keys, ptrs)
        };
        keys.insert(pos, sep_key);
        ptrs.insert(pos + 1, right_child);
        let mid = keys.len() / 2;
        let promoted = keys[mid].clone();
        let left_keys = keys[0..mid].to_vec();
        let left_ptrs = ptrs[0..=mid].to_vec();
        let right_keys = keys[mid + 1..].to_vec();
        let right_ptrs = ptrs[mid + 1..].to_vec();

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, k) in left_keys.iter().enumerate() {
                pv.set_key(i, k);
            }
            for (i, p) in left_ptrs.iter().enumerate() {
                pv.set_pointer(i, *p);
            }
            pv.set_count(left_keys.len() as u16);
            pv.set_interior(true);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let left_id = self.write_frame0_fresh()?;

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, k) in right_keys.iter().enumerate() {
                pv.set_key(i, k);
            }
            for (i, p) in right_ptrs.iter().enumerate() {
                pv.set_pointer(i, *p);
            }
            pv.set_count(right_keys.len() as u16);
            pv.set_interior(true);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let right_id = self.write_frame0_fresh()?;

        Ok((left_id, right_id, promoted))
    }

    /// The garbage collector for the mapping table: rewrites stale child
    /// pointers in the interior page currently in frame 0 and deletes the
    /// mapping entries they consumed. Returns the number of edits.
    fn update_pointers_frame0(&mut self) -> Result<usize> {
        let slots: Vec<usize> = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            if self.mode.is_nor() {
                (0..self.layout.max_interior_recs as usize)
                    .filter(|&i| view.free_bit(i) == 0 && view.valid_bit(i) == 1)
                    .collect()
            } else {
                (0..=view.count() as usize).collect()
            }
        };
        let mut edits = 0;
        for i in slots {
            let c = { PageView::new(self.buffer_pool.frame(0), &self.layout).pointer(i) };
            let c2 = self.mapping.resolve(c);
            if c2 != c {
                let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
                pv.set_pointer(i, c2);
                self.mapping.remove(c);
                edits += 1;
            }
        }
        Ok(edits)
    }

    /// Installs `(prev_id, curr_id)` in the mapping table; if the table is
    /// full, cascades rewrites up `active_path` from `level` until
    /// `update_pointers` frees a slot, per spec.md §4.4's `fixMappings`.
    fn fix_mappings(&mut self, mut prev_id: PageId, mut curr_id: PageId, mut level: isize) -> Result<()> {
        loop {
            if self.mapping.upsert(prev_id, curr_id).is_ok() {
                return Ok(());
            }
            if level < 0 {
                self.root = curr_id;
                self.active_path[0] = curr_id;
                return Ok(());
            }
            let parent_id = self.active_path[level as usize];
            self.buffer_pool.read_into(self.device.as_mut(), parent_id, 0)?;
            self.mapping.set_saved(prev_id, curr_id);
            self.update_pointers_frame0()?;
            self.mapping.clear_saved();
            {
                let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
                pv.set_root(level == 0);
            }
            self.buffer_pool.set_free(parent_id);
            let new_id = self.write_frame0_fresh()?;
            self.active_path[level as usize] = new_id;
            if level == 0 {
                self.root = new_id;
            }
            prev_id = parent_id;
            curr_id = new_id;
            level -= 1;
        }
    }

    // ---- NOR_OVERWRITE insert ----------------------------------------------

    fn put_nor_leaf(&mut self, leaf_id: PageId, key: &[u8], data: &[u8]) -> Result<()> {
        self.buffer_pool.read_into(self.device.as_mut(), leaf_id, 0)?;
        let max_recs = self.layout.max_leaf_recs as usize;
        let free_slot = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            (0..max_recs).find(|&i| view.free_bit(i) == 1)
        };
        match free_slot {
            Some(i) => {
                {
                    let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
                    pv.set_key(i, key);
                    pv.set_data(i, data);
                    pv.set_free_bit(i, 0);
                    pv.set_valid_bit(i, 1, false);
                }
                let buf = self.buffer_pool.frame(0).to_vec();
                self.buffer_pool.over_write_page(self.device.as_mut(), &buf, leaf_id)?;
                trace!("NOR leaf {leaf_id}: inserted into free slot {i}");
                Ok(())
            }
            None => self.nor_leaf_compact_and_split(leaf_id, key, data),
        }
    }

    fn nor_leaf_compact_and_split(&mut self, leaf_id: PageId, key: &[u8], data: &[u8]) -> Result<()> {
        let max_recs = self.layout.max_leaf_recs as usize;
        let mut recs: Vec<(Vec<u8>, Vec<u8>)> = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            (0..max_recs)
                .filter(|&i| view.free_bit(i) == 0 && view.valid_bit(i) == 1)
                .map(|i| (view.key(i).to_vec(), view.data(i).to_vec()))
                .collect()
        };
        recs.sort_by(|a, b| self.comparator.compare(&a.0, &b.0));
        let pos = recs.partition_point(|(k, _)| self.comparator.compare(k, key) == Ordering::Less);
        recs.insert(pos, (key.to_vec(), data.to_vec()));
        let mid = recs.len() / 2;
        let right_min_key = recs[mid].0.clone();

        self.buffer_pool.set_free(leaf_id);

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, (k, d)) in recs[0..mid].iter().enumerate() {
                pv.set_key(i, k);
                pv.set_data(i, d);
                pv.set_free_bit(i, 0);
                pv.set_valid_bit(i, 1, false);
            }
            pv.set_interior(false);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let left_id = self.write_frame0_fresh()?;

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, (k, d)) in recs[mid..].iter().enumerate() {
                pv.set_key(i, k);
                pv.set_data(i, d);
                pv.set_free_bit(i, 0);
                pv.set_valid_bit(i, 1, false);
            }
            pv.set_interior(false);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let right_id = self.write_frame0_fresh()?;

        if self.levels == 1 {
            self.create_new_root(left_id, right_min_key, right_id)
        } else {
            let level = self.levels as isize - 2;
            self.fix_mappings(leaf_id, left_id, level)?;
            self.insert_separator_upward_nor(right_min_key, right_id, level as usize)
        }
    }

    /// `insertInterior`: appends `(sep_key, left)` and relabels the
    /// existing smallest-key-greater-than-`sep_key` slot's pointer to
    /// `right`, both as fresh free-slot writes so the page can be
    /// overwritten in place without erase. Falls back to a compaction
    /// split when fewer than two free slots remain (spec.md §4.4,
    /// "NOR-overwrite insert / Interior (NOR)").
    fn insert_separator_upward_nor(&mut self, sep_key: Vec<u8>, right_child: PageId, level: usize) -> Result<()> {
        let parent_id = self.active_path[level];
        self.buffer_pool.read_into(self.device.as_mut(), parent_id, 0)?;
        let max_recs = self.layout.max_interior_recs as usize;

        let found = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            (0..max_recs)
                .filter(|&i| view.free_bit(i) == 0 && view.valid_bit(i) == 1)
                .filter(|&i| self.comparator.compare(view.key(i), &sep_key) == Ordering::Greater)
                .min_by(|&a, &b| self.comparator.compare(view.key(a), view.key(b)))
        };

        let (k_slot, k_key, left_child) = match found {
            Some(i) => {
                let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
                (i, view.key(i).to_vec(), view.pointer(i))
            }
            None => return self.nor_interior_compact_and_split(parent_id, sep_key, right_child, level),
        };

        let free_slots: Vec<usize> = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            (0..max_recs).filter(|&i| view.free_bit(i) == 1).collect()
        };
        if free_slots.len() < 2 {
            return self.nor_interior_compact_and_split(parent_id, sep_key, right_child, level);
        }
        let (slot_a, slot_b) = (free_slots[0], free_slots[1]);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            pv.set_key(slot_a, &sep_key);
            pv.set_pointer(slot_a, left_child);
            pv.set_free_bit(slot_a, 0);
            pv.set_valid_bit(slot_a, 1, true);

            pv.set_key(slot_b, &k_key);
            pv.set_pointer(slot_b, right_child);
            pv.set_free_bit(slot_b, 0);
            pv.set_valid_bit(slot_b, 1, true);

            pv.set_valid_bit(k_slot, 0, true);
        }
        let buf = self.buffer_pool.frame(0).to_vec();
        self.buffer_pool.over_write_page(self.device.as_mut(), &buf, parent_id)?;
        trace!("NOR interior {parent_id}: appended boundary, invalidated slot {k_slot}");
        Ok(())
    }

    fn nor_interior_compact_and_split(
        &mut self,
        parent_id: PageId,
        sep_key: Vec<u8>,
        right_child: PageId,
        level: usize,
    ) -> Result<()> {
        let max_recs = self.layout.max_interior_recs as usize;
        let mut pairs: Vec<(Vec<u8>, u32)> = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            (0..max_recs)
                .filter(|&i| view.free_bit(i) == 0 && view.valid_bit(i) == 1)
                .map(|i| (view.key(i).to_vec(), view.pointer(i)))
                .collect()
        };
        pairs.sort_by(|a, b| self.comparator.compare(&a.0, &b.0));
        let pos = pairs.iter().position(|(k, _)| self.comparator.compare(k, &sep_key) == Ordering::Greater).unwrap_or(pairs.len());
        let left_child = if pos < pairs.len() { pairs[pos].1 } else { INVALID_PAGE };
        pairs.insert(pos, (sep_key, left_child));
        if pos + 1 < pairs.len() {
            pairs[pos + 1].1 = right_child;
        }

        let mid = pairs.len() / 2;
        let promoted = pairs[mid].0.clone();
        let left_pairs = pairs[0..=mid].to_vec();
        let right_pairs = pairs[mid + 1..].to_vec();

        self.buffer_pool.set_free(parent_id);

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, (k, p)) in left_pairs.iter().enumerate() {
                pv.set_key(i, k);
                pv.set_pointer(i, *p);
                pv.set_free_bit(i, 0);
                pv.set_valid_bit(i, 1, true);
            }
            pv.set_interior(true);
            pv.set_nor_interior(true);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let left_id = self.write_frame0_fresh()?;

        self.buffer_pool.init_frame(0);
        {
            let mut pv = PageViewMut::new(self.buffer_pool.frame_mut(0), &self.layout);
            for (i, (k, p)) in right_pairs.iter().enumerate() {
                pv.set_key(i, k);
                pv.set_pointer(i, *p);
                pv.set_free_bit(i, 0);
                pv.set_valid_bit(i, 1, true);
            }
            pv.set_interior(true);
            pv.set_nor_interior(true);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_root(false);
        }
        let right_id = self.write_frame0_fresh()?;

        debug!("NOR interior {parent_id} compacted and split into {left_id}/{right_id}");
        if level == 0 {
            self.create_new_root(left_id, promoted, right_id)
        } else {
            self.fix_mappings(parent_id, left_id, level as isize - 1)?;
            self.insert_separator_upward_nor(promoted, right_id, level - 1)
        }
    }

    // ---- mapping closure (supplemented feature) ----------------------------

    /// Resolves every reachable interior pointer in place and rewrites the
    /// interior pages whose pointers actually changed, so that
    /// `resolve(p) == p` for every pointer afterwards (testable property 4,
    /// "mapping closure"). See SPEC_FULL.md §1.2 for the deliberate
    /// divergence from `vmtreeClearMappings`'s recursion-by-raw-id bug.
    pub fn clear_mappings(&mut self) -> Result<()> {
        let root = self.root;
        self.clear_mappings_rec(root)?;
        self.mapping.retain_unresolved();
        Ok(())
    }

    fn clear_mappings_rec(&mut self, page_id: PageId) -> Result<()> {
        self.buffer_pool.read_into(self.device.as_mut(), page_id, 0)?;
        let is_interior = PageView::new(self.buffer_pool.frame(0), &self.layout).is_interior();
        if !is_interior {
            return Ok(());
        }
        let raw_children: Vec<PageId> = {
            let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
            let n = self.interior_child_count(&view);
            (0..n)
                .map(|i| self.interior_child_pointer(&view, i))
                .collect()
        };
        let children: Vec<PageId> = raw_children
            .into_iter()
            .map(|p| self.mapping.resolve(p))
            .collect();
        for child in children {
            self.clear_mappings_rec(child)?;
        }
        self.buffer_pool.read_into(self.device.as_mut(), page_id, 0)?;
        let edits = self.update_pointers_frame0()?;
        if edits > 0 {
            let buf = self.buffer_pool.frame(0).to_vec();
            self.buffer_pool.write_page_direct(self.device.as_mut(), &buf, page_id)?;
        }
        Ok(())
    }

    // ---- movePage (documented per spec.md §4.4; not exercised by this
    // crate's same-physical-id block reclamation path, see DESIGN.md) -----

    pub fn move_page(&mut self, prev: PageId, curr: PageId) -> Result<()> {
        self.buffer_pool.read_into(self.device.as_mut(), curr, 0)?;
        let is_interior = PageView::new(self.buffer_pool.frame(0), &self.layout).is_interior();
        if is_interior {
            self.update_pointers_frame0()?;
            let buf = self.buffer_pool.frame(0).to_vec();
            self.buffer_pool.write_page_direct(self.device.as_mut(), &buf, curr)?;
        }
        if prev == self.root {
            self.root = curr;
            self.active_path[0] = curr;
            Ok(())
        } else if self.mapping.upsert(prev, curr).is_ok() {
            Ok(())
        } else {
            self.fix_mappings(prev, curr, self.levels as isize - 2)
        }
    }

    // ---- debug dumpers (supplemented feature) ------------------------------

    pub fn print_node(&mut self, page_id: PageId) -> Result<()> {
        self.buffer_pool.read_into(self.device.as_mut(), page_id, 0)?;
        let view = PageView::new(self.buffer_pool.frame(0), &self.layout);
        if view.is_interior() {
            trace!(
                "node {page_id}: interior count={} root={} nor={}",
                view.count(),
                view.is_root(),
                view.is_nor_interior()
            );
        } else {
            trace!("node {page_id}: leaf count={} root={}", view.count(), view.is_root());
        }
        Ok(())
    }

    pub fn print_mappings(&self) {
        for (prev, curr) in self.mapping.scan() {
            trace!("mapping {prev} -> {curr}");
        }
    }

    // ---- range iteration ----------------------------------------------------

    pub fn iter(&mut self, min: Option<&[u8]>, max: Option<&[u8]>) -> TreeIterator {
        TreeIterator::new(min, max)
    }
}

/// A restartable lazy sequence of `(key, data)` pairs; its progress is an
/// active path plus a per-level position, exactly as in the source
/// (`activeIteratorPath`/`lastIterRec`), per spec.md §9's note on
/// expressing iteration without a hand-rolled state machine.
pub struct TreeIterator {
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    path: Vec<PageId>,
    pos: Vec<usize>,
    started: bool,
    done: bool,
}

impl TreeIterator {
    fn new(min: Option<&[u8]>, max: Option<&[u8]>) -> Self {
        TreeIterator {
            min_key: min.map(|k| k.to_vec()),
            max_key: max.map(|k| k.to_vec()),
            path: Vec::new(),
            pos: Vec::new(),
            started: false,
            done: false,
        }
    }

    fn descend_leftmost(&mut self, tree: &mut Tree) -> Result<()> {
        self.path.clear();
        self.pos.clear();
        let mut current = tree.root;
        loop {
            self.path.push(current);
            let frame = tree
                .buffer_pool
                .read(tree.device.as_mut(), current, current == tree.root)?;
            let view = PageView::new(tree.buffer_pool.frame(frame), &tree.layout);
            if !view.is_interior() {
                self.pos.push(0);
                return Ok(());
            }
            let child_index = match &self.min_key {
                Some(k) => {
                    if tree.mode.is_nor() {
                        let sorted = tree.interior_sorted_nor(&view);
                        sorted
                            .iter()
                            .position(|(ek, _)| tree.comparator.compare(ek, k) != Ordering::Less)
                            .unwrap_or(sorted.len().saturating_sub(1))
                    } else {
                        tree.binary_search_interior_child(&view, k)
                    }
                }
                None => 0,
            };
            self.pos.push(child_index);
            let raw = tree.interior_child_pointer(&view, child_index);
            current = tree.mapping.resolve(raw);
        }
    }

    fn ascend_and_redescend(&mut self, tree: &mut Tree) -> bool {
        loop {
            if self.path.len() <= 1 {
                return false;
            }
            self.path.pop();
            self.pos.pop();
            let level = self.path.len() - 1;
            let parent_id = self.path[level];
            let frame = match tree.buffer_pool.read(tree.device.as_mut(), parent_id, parent_id == tree.root) {
                Ok(f) => f,
                Err(_) => return false,
            };
            let child_count = {
                let view = PageView::new(tree.buffer_pool.frame(frame), &tree.layout);
                tree.interior_child_count(&view)
            };
            self.pos[level] += 1;
            if self.pos[level] >= child_count {
                continue;
            }
            let raw = {
                let view = PageView::new(tree.buffer_pool.frame(frame), &tree.layout);
                tree.interior_child_pointer(&view, self.pos[level])
            };
            let mut current = tree.mapping.resolve(raw);
            loop {
                self.path.push(current);
                let frame = match tree.buffer_pool.read(tree.device.as_mut(), current, current == tree.root) {
                    Ok(f) => f,
                    Err(_) => return false,
                };
                let view = PageView::new(tree.buffer_pool.frame(frame), &tree.layout);
                if !view.is_interior() {
                    self.pos.push(0);
                    return true;
                }
                let raw = tree.interior_child_pointer(&view, 0);
                self.pos.push(0);
                current = tree.mapping.resolve(raw);
            }
        }
    }

    /// Returns the next record `>= minKey` (if any) in ascending comparator
    /// order, or `None` once `maxKey` is exceeded or the tree is exhausted.
    pub fn next(&mut self, tree: &mut Tree) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            if self.descend_leftmost(tree).is_err() {
                self.done = true;
                return None;
            }
        }
        loop {
            let leaf_id = *self.path.last()?;
            let frame = match tree.buffer_pool.read(tree.device.as_mut(), leaf_id, leaf_id == tree.root) {
                Ok(f) => f,
                Err(_) => {
                    self.done = true;
                    return None;
                }
            };
            let found = {
                let view = PageView::new(tree.buffer_pool.frame(frame), &tree.layout);
                let level = self.pos.len() - 1;
                if tree.mode.is_nor() {
                    let mut idx = self.pos[level];
                    let mut result = None;
                    while idx < tree.layout.max_leaf_recs as usize {
                        if view.free_bit(idx) == 0 && view.valid_bit(idx) == 1 {
                            let k = view.key(idx).to_vec();
                            if self.min_key.as_ref().map_or(true, |m| tree.comparator.compare(&k, m) != Ordering::Less) {
                                result = Some((k, view.data(idx).to_vec()));
                                idx += 1;
                                break;
                            }
                        }
                        idx += 1;
                    }
                    self.pos[level] = idx;
                    result
                } else {
                    let idx = self.pos[level];
                    if idx < view.count() as usize {
                        self.pos[level] = idx + 1;
                        Some((view.key(idx).to_vec(), view.data(idx).to_vec()))
                    } else {
                        None
                    }
                }
            };

            if let Some((k, d)) = found {
                if let Some(max) = &self.max_key {
                    if tree.comparator.compare(&k, max) == Ordering::Greater {
                        self.done = true;
                        return None;
                    }
                }
                return Some((k, d));
            }

            if !self.ascend_and_redescend(tree) {
                self.done = true;
                return None;
            }
        }
    }
}
