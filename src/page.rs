//! Page header flags, layout-constant derivation, and typed accessors over a
//! raw page buffer.
//!
//! This is the Rust realization of the design note in the original spec
//! ("expose typed accessors ... rather than trying to overlay
//! language-level structs") grounded in the teacher's `BTreeLeafPage`
//! accessor methods (`is_slot_used`, `mark_slot_status`) which play the
//! same role over a bit-vector header.
//!
//! `vmtree.h`, which would have defined the exact `prev`-field flag bit
//! positions, was not part of the retained source; the bit layout below
//! (top three bits as flags, low 29 bits as the prev id) is this crate's own
//! choice, recorded in DESIGN.md.

use crate::error::{Result, VmtreeError};
use std::convert::TryInto;

pub type PageId = u32;

/// Not a valid physical page id; used for "no frame cached" rather than
/// reserving id 0, so the root may legitimately live at physical page 0.
pub const INVALID_PAGE: PageId = u32::MAX;

pub const ROOT_FLAG: u32 = 1 << 31;
pub const INTERIOR_FLAG: u32 = 1 << 30;
pub const NOR_INTERIOR_FLAG: u32 = 1 << 29;
pub const PREV_MASK: u32 = 0x1FFF_FFFF;
/// Sentinel meaning "the mapping chain is broken" (a split invalidates it).
pub const PREV_ID_CONSTANT: u32 = PREV_MASK;

pub const HEADER_SIZE: u16 = 10;
pub const POINTER_SIZE: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sequential,
    Overwrite,
    NorOverwrite,
}

impl Mode {
    pub fn is_nor(&self) -> bool {
        matches!(self, Mode::NorOverwrite)
    }
}

fn ceil_div8(n: u16) -> u16 {
    (n + 7) / 8
}

/// Page-layout constants derived once at `Tree::init` from `pageSize`,
/// `keySize`, `dataSize`, and `mode`, grounded in spec.md §4.4's "Layout
/// constants" subsection.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub page_size: u16,
    pub key_size: u16,
    pub data_size: u16,
    pub mode: Mode,
    pub max_leaf_recs: u16,
    pub max_interior_recs: u16,
    pub leaf_bitmap_bytes: u16,
    pub interior_bitmap_bytes: u16,
}

impl Layout {
    pub fn compute(page_size: u16, key_size: u16, data_size: u16, mode: Mode) -> Result<Self> {
        if key_size == 0 || data_size == 0 {
            return Err(VmtreeError::Invariant(
                "key_size and data_size must be nonzero".into(),
            ));
        }
        let (max_leaf_recs, max_interior_recs, leaf_bitmap_bytes, interior_bitmap_bytes) =
            match mode {
                Mode::Sequential | Mode::Overwrite => {
                    let leaf = (page_size - HEADER_SIZE) / (key_size + data_size);
                    let interior =
                        (page_size - HEADER_SIZE - POINTER_SIZE) / (key_size + POINTER_SIZE);
                    (leaf, interior, 0, 0)
                }
                Mode::NorOverwrite => {
                    let leaf = Self::solve_nor(page_size, key_size + data_size);
                    let interior = Self::solve_nor(page_size, key_size + POINTER_SIZE);
                    (leaf, interior, ceil_div8(leaf), ceil_div8(interior))
                }
            };
        if max_leaf_recs < 2 || max_interior_recs < 2 {
            return Err(VmtreeError::Invariant(format!(
                "page_size {page_size} too small for key_size {key_size}/data_size {data_size}"
            )));
        }
        Ok(Layout {
            page_size,
            key_size,
            data_size,
            mode,
            max_leaf_recs,
            max_interior_recs,
            leaf_bitmap_bytes,
            interior_bitmap_bytes,
        })
    }

    /// Solves `H + 2*ceil(R/8) + R*rec_size <= pageSize` for the largest R.
    fn solve_nor(page_size: u16, rec_size: u16) -> u16 {
        let mut r = (page_size.saturating_sub(HEADER_SIZE)) / rec_size;
        loop {
            if r == 0 {
                return 0;
            }
            let b = ceil_div8(r);
            if HEADER_SIZE + 2 * b + r * rec_size <= page_size {
                return r;
            }
            r -= 1;
        }
    }

    pub fn leaf_header_end(&self) -> u16 {
        if self.mode.is_nor() {
            HEADER_SIZE + 2 * self.leaf_bitmap_bytes
        } else {
            HEADER_SIZE
        }
    }

    pub fn interior_header_end(&self) -> u16 {
        if self.mode.is_nor() {
            HEADER_SIZE + 2 * self.interior_bitmap_bytes
        } else {
            HEADER_SIZE
        }
    }

    /// Plain leaf record size (key + data interleaved per record).
    pub fn leaf_record_size(&self) -> u16 {
        self.key_size + self.data_size
    }

    pub fn leaf_key_col_offset(&self) -> u16 {
        self.leaf_header_end()
    }

    pub fn leaf_data_col_offset(&self) -> u16 {
        self.leaf_header_end() + self.max_leaf_recs * self.key_size
    }

    pub fn interior_key_col_offset(&self) -> u16 {
        self.interior_header_end()
    }

    pub fn interior_pointer_col_offset(&self) -> u16 {
        self.interior_header_end() + self.max_interior_recs * self.key_size
    }
}

/// Read-only typed view over a page buffer.
pub struct PageView<'a> {
    pub buf: &'a [u8],
    pub layout: &'a Layout,
}

impl<'a> PageView<'a> {
    pub fn new(buf: &'a [u8], layout: &'a Layout) -> Self {
        PageView { buf, layout }
    }

    pub fn id(&self) -> u32 {
        u32::from_le_bytes(self.buf[0..4].try_into().unwrap())
    }

    pub fn prev_raw(&self) -> u32 {
        u32::from_le_bytes(self.buf[4..8].try_into().unwrap())
    }

    pub fn prev_id(&self) -> u32 {
        self.prev_raw() & PREV_MASK
    }

    pub fn is_root(&self) -> bool {
        self.prev_raw() & ROOT_FLAG != 0
    }

    pub fn is_interior(&self) -> bool {
        self.prev_raw() & INTERIOR_FLAG != 0
    }

    pub fn is_nor_interior(&self) -> bool {
        self.prev_raw() & NOR_INTERIOR_FLAG != 0
    }

    /// Plain-layout record count (the `count` header field). Meaningless
    /// for NOR pages, whose live-record count is the number of set valid
    /// bits (see `Tree::nor_valid_count`).
    pub fn count(&self) -> u16 {
        u16::from_le_bytes(self.buf[8..10].try_into().unwrap())
    }

    pub fn key(&self, i: usize) -> &[u8] {
        let off = if self.is_interior() {
            self.layout.interior_key_col_offset() as usize + i * self.layout.key_size as usize
        } else if self.layout.mode.is_nor() {
            self.layout.leaf_key_col_offset() as usize + i * self.layout.key_size as usize
        } else {
            self.layout.leaf_header_end() as usize
                + i * self.layout.leaf_record_size() as usize
        };
        &self.buf[off..off + self.layout.key_size as usize]
    }

    pub fn data(&self, i: usize) -> &[u8] {
        debug_assert!(!self.is_interior());
        let off = if self.layout.mode.is_nor() {
            self.layout.leaf_data_col_offset() as usize + i * self.layout.data_size as usize
        } else {
            self.layout.leaf_header_end() as usize
                + i * self.layout.leaf_record_size() as usize
                + self.layout.key_size as usize
        };
        &self.buf[off..off + self.layout.data_size as usize]
    }

    pub fn pointer(&self, i: usize) -> u32 {
        debug_assert!(self.is_interior());
        let off =
            self.layout.interior_pointer_col_offset() as usize + i * POINTER_SIZE as usize;
        u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap())
    }

    pub fn free_bit(&self, i: usize) -> u8 {
        let base = HEADER_SIZE as usize;
        let byte = base + i / 8;
        (self.buf[byte] >> (i % 8)) & 1
    }

    pub fn valid_bit(&self, i: usize) -> u8 {
        let bm_bytes = if self.is_interior() {
            self.layout.interior_bitmap_bytes
        } else {
            self.layout.leaf_bitmap_bytes
        } as usize;
        let base = HEADER_SIZE as usize + bm_bytes;
        let byte = base + i / 8;
        (self.buf[byte] >> (i % 8)) & 1
    }
}

/// Mutable typed view over a page buffer.
pub struct PageViewMut<'a> {
    pub buf: &'a mut [u8],
    pub layout: &'a Layout,
}

impl<'a> PageViewMut<'a> {
    pub fn new(buf: &'a mut [u8], layout: &'a Layout) -> Self {
        PageViewMut { buf, layout }
    }

    pub fn as_view(&self) -> PageView<'_> {
        PageView {
            buf: self.buf,
            layout: self.layout,
        }
    }

    pub fn set_id(&mut self, id: u32) {
        self.buf[0..4].copy_from_slice(&id.to_le_bytes());
    }

    fn prev_raw(&self) -> u32 {
        u32::from_le_bytes(self.buf[4..8].try_into().unwrap())
    }

    fn set_prev_raw(&mut self, raw: u32) {
        self.buf[4..8].copy_from_slice(&raw.to_le_bytes());
    }

    pub fn set_prev_id(&mut self, prev: u32) {
        let flags = self.prev_raw() & !PREV_MASK;
        self.set_prev_raw(flags | (prev & PREV_MASK));
    }

    pub fn set_root(&mut self, v: bool) {
        let raw = self.prev_raw();
        self.set_prev_raw(if v { raw | ROOT_FLAG } else { raw & !ROOT_FLAG });
    }

    pub fn set_interior(&mut self, v: bool) {
        let raw = self.prev_raw();
        self.set_prev_raw(if v {
            raw | INTERIOR_FLAG
        } else {
            raw & !INTERIOR_FLAG
        });
    }

    pub fn set_nor_interior(&mut self, v: bool) {
        let raw = self.prev_raw();
        self.set_prev_raw(if v {
            raw | NOR_INTERIOR_FLAG
        } else {
            raw & !NOR_INTERIOR_FLAG
        });
    }

    pub fn set_count(&mut self, count: u16) {
        self.buf[8..10].copy_from_slice(&count.to_le_bytes());
    }

    fn key_offset(&self, i: usize) -> usize {
        let view = self.as_view();
        if view.is_interior() {
            self.layout.interior_key_col_offset() as usize + i * self.layout.key_size as usize
        } else if self.layout.mode.is_nor() {
            self.layout.leaf_key_col_offset() as usize + i * self.layout.key_size as usize
        } else {
            self.layout.leaf_header_end() as usize
                + i * self.layout.leaf_record_size() as usize
        }
    }

    pub fn set_key(&mut self, i: usize, key: &[u8]) {
        let off = self.key_offset(i);
        let ks = self.layout.key_size as usize;
        self.buf[off..off + ks].copy_from_slice(&key[..ks]);
    }

    fn data_offset(&self, i: usize) -> usize {
        if self.layout.mode.is_nor() {
            self.layout.leaf_data_col_offset() as usize + i * self.layout.data_size as usize
        } else {
            self.layout.leaf_header_end() as usize
                + i * self.layout.leaf_record_size() as usize
                + self.layout.key_size as usize
        }
    }

    pub fn set_data(&mut self, i: usize, data: &[u8]) {
        let off = self.data_offset(i);
        let ds = self.layout.data_size as usize;
        self.buf[off..off + ds].copy_from_slice(&data[..ds]);
    }

    pub fn set_pointer(&mut self, i: usize, p: u32) {
        let off =
            self.layout.interior_pointer_col_offset() as usize + i * POINTER_SIZE as usize;
        self.buf[off..off + 4].copy_from_slice(&p.to_le_bytes());
    }

    pub fn set_free_bit(&mut self, i: usize, v: u8) {
        let base = HEADER_SIZE as usize;
        let byte = base + i / 8;
        if v != 0 {
            self.buf[byte] |= 1 << (i % 8);
        } else {
            self.buf[byte] &= !(1 << (i % 8));
        }
    }

    pub fn set_valid_bit(&mut self, i: usize, v: u8, interior: bool) {
        let bm_bytes = if interior {
            self.layout.interior_bitmap_bytes
        } else {
            self.layout.leaf_bitmap_bytes
        } as usize;
        let base = HEADER_SIZE as usize + bm_bytes;
        let byte = base + i / 8;
        if v != 0 {
            self.buf[byte] |= 1 << (i % 8);
        } else {
            self.buf[byte] &= !(1 << (i % 8));
        }
    }

    /// Shifts plain leaf records `[from, count)` one slot to the right, to
    /// open a hole at `from` for an insert. Record-major layout lets this
    /// be a single contiguous `copy_within`.
    pub fn shift_leaf_records_right(&mut self, from: usize, count: usize) {
        let rec = self.layout.leaf_record_size() as usize;
        let base = self.layout.leaf_header_end() as usize;
        let start = base + from * rec;
        let end = base + count * rec;
        self.buf.copy_within(start..end, start + rec);
    }

    /// Shifts the plain interior key column `[from, count)` right by one.
    pub fn shift_interior_keys_right(&mut self, from: usize, count: usize) {
        let ks = self.layout.key_size as usize;
        let base = self.layout.interior_key_col_offset() as usize;
        let start = base + from * ks;
        let end = base + count * ks;
        self.buf.copy_within(start..end, start + ks);
    }

    /// Shifts the plain interior pointer column `[from, count]` right by
    /// one (inclusive of the trailing "rightmost child" pointer).
    pub fn shift_interior_pointers_right(&mut self, from: usize, count_inclusive: usize) {
        let base = self.layout.interior_pointer_col_offset() as usize;
        let start = base + from * POINTER_SIZE as usize;
        let end = base + count_inclusive * POINTER_SIZE as usize;
        self.buf.copy_within(start..end, start + POINTER_SIZE as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_layout() -> Layout {
        Layout::compute(512, 4, 12, Mode::Sequential).unwrap()
    }

    #[test]
    fn plain_layout_matches_spec_example() {
        let l = plain_layout();
        assert_eq!(l.max_leaf_recs, 31);
        assert_eq!(l.max_interior_recs, 42);
    }

    #[test]
    fn header_flags_round_trip() {
        let layout = plain_layout();
        let mut buf = vec![0u8; 512];
        {
            let mut pv = PageViewMut::new(&mut buf, &layout);
            pv.set_id(7);
            pv.set_root(true);
            pv.set_interior(true);
            pv.set_prev_id(PREV_ID_CONSTANT);
            pv.set_count(3);
        }
        let view = PageView::new(&buf, &layout);
        assert_eq!(view.id(), 7);
        assert!(view.is_root());
        assert!(view.is_interior());
        assert_eq!(view.prev_id(), PREV_ID_CONSTANT);
        assert_eq!(view.count(), 3);
    }

    #[test]
    fn leaf_key_data_round_trip() {
        let layout = plain_layout();
        let mut buf = vec![0u8; 512];
        {
            let mut pv = PageViewMut::new(&mut buf, &layout);
            pv.set_key(0, &5u32.to_le_bytes());
            pv.set_data(0, b"hello world!");
        }
        let view = PageView::new(&buf, &layout);
        assert_eq!(view.key(0), &5u32.to_le_bytes());
        assert_eq!(view.data(0), b"hello world!");
    }

    #[test]
    fn nor_layout_bitmaps() {
        let layout = Layout::compute(512, 4, 12, Mode::NorOverwrite).unwrap();
        assert!(layout.max_leaf_recs > 0);
        assert!(layout.leaf_bitmap_bytes > 0);
    }
}
