//! Bounded page buffer with the allocator and block-reclamation routine,
//! grounded in `dbbuffer.c`/`dbbuffer.h`.
//!
//! `dbbuffer`'s three C function pointers (`isValid`, `checkMapping`,
//! `movePage`) become `TreeCallbacks`, a small capability record the pool
//! holds and invokes during `ensure_space` — the buffer depends on three
//! operations the tree supplies, nothing more (design note in spec.md §9).

use log::{debug, trace};

use crate::error::{Result, VmtreeError};
use crate::page::PageId;
use crate::storage::BlockDevice;

/// Result of `TreeCallbacks::is_valid` for a candidate page during
/// reclamation, mirroring `vmtreeIsValid`'s three-way `-1`/`0`/`1` return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Dead,
    LiveDirect,
    LiveViaMapping,
}

/// The three operations `BufferPool::ensure_space` needs from the tree
/// engine; the Rust expression of `dbbuffer`'s function-pointer triple.
pub trait TreeCallbacks {
    fn is_valid(&mut self, page_id: PageId) -> Result<Validity>;
    fn move_page(&mut self, prev: PageId, curr: PageId, buf: &mut [u8]) -> Result<()>;
    fn check_mapping_space(&self) -> bool;
}

#[derive(Default, Debug, Clone, Copy)]
pub struct BufferStats {
    pub num_reads: u64,
    pub num_writes: u64,
    pub num_over_writes: u64,
    pub num_moves: u64,
    pub buffer_hits: u64,
    pub num_block_erases: u64,
}

pub struct BufferPool {
    frames: Vec<u8>,
    status: Vec<Option<PageId>>,
    page_size: u16,
    num_pages: u16,
    last_hit: u16,
    next_buffer_page: u16,
    next_page_id: u32,
    next_page_write_id: u32,
    free_pages: crate::bitarr::BitArray,
    end_data_page: u32,
    erase_size_in_pages: u16,
    erased_start_page: u32,
    erased_end_page: u32,
    block_buffer: Vec<u8>,
    stats: BufferStats,
}

impl BufferPool {
    pub fn new(page_size: u16, num_pages: u16, storage_size_pages: u32, erase_size_in_pages: u16) -> Self {
        let end_data_page =
            (storage_size_pages / erase_size_in_pages as u32) * erase_size_in_pages as u32;
        let end_data_page = end_data_page.saturating_sub(1);
        BufferPool {
            frames: vec![0xFF; page_size as usize * num_pages as usize],
            status: vec![None; num_pages as usize],
            page_size,
            num_pages,
            last_hit: u16::MAX,
            next_buffer_page: 2.min(num_pages.saturating_sub(1)),
            next_page_id: 0,
            next_page_write_id: 0,
            free_pages: crate::bitarr::BitArray::init(end_data_page + 1, 1),
            end_data_page,
            erase_size_in_pages,
            erased_start_page: 0,
            erased_end_page: (erase_size_in_pages as u32).saturating_mul(2).saturating_sub(1),
            block_buffer: vec![0u8; page_size as usize * erase_size_in_pages as usize],
            stats: BufferStats::default(),
        }
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    pub fn num_pages(&self) -> u16 {
        self.num_pages
    }

    pub fn end_data_page(&self) -> u32 {
        self.end_data_page
    }

    pub fn next_page_write_id(&self) -> u32 {
        self.next_page_write_id
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    fn frame_slice(&self, idx: usize) -> &[u8] {
        let s = idx * self.page_size as usize;
        &self.frames[s..s + self.page_size as usize]
    }

    fn frame_slice_mut(&mut self, idx: usize) -> &mut [u8] {
        let s = idx * self.page_size as usize;
        &mut self.frames[s..s + self.page_size as usize]
    }

    /// Selects a victim frame for `page_id` per the frame policy: frame 0
    /// is scratch, frame 1 is reserved for the root when there are at
    /// least 3 frames, a 2-frame pool always uses frame 1, otherwise the
    /// victim pool round-robins skipping `last_hit`.
    fn choose_frame(&mut self, page_id: PageId, is_root: bool) -> usize {
        if is_root && self.num_pages >= 3 {
            return 1;
        }
        if self.num_pages == 2 {
            return 1;
        }
        if self.num_pages == 3 {
            return 2;
        }
        for i in 2..self.num_pages as usize {
            if self.status[i].is_none() {
                return i;
            }
        }
        let pool = (self.num_pages as usize).saturating_sub(2).max(1);
        let mut cursor = self.next_buffer_page as usize;
        loop {
            if cursor != self.last_hit as usize {
                self.next_buffer_page = (((cursor - 2 + 1) % pool) + 2) as u16;
                let _ = page_id;
                return cursor;
            }
            cursor = ((cursor - 2 + 1) % pool) + 2;
        }
    }

    /// Returns the frame index holding `page_id`, reading it from the
    /// device if not already resident. `is_root` tells the frame policy to
    /// prefer the reserved root frame.
    pub fn read(
        &mut self,
        device: &mut dyn BlockDevice,
        page_id: PageId,
        is_root: bool,
    ) -> Result<usize> {
        for i in 1..self.num_pages as usize {
            if self.status[i] == Some(page_id) {
                self.last_hit = i as u16;
                self.stats.buffer_hits += 1;
                return Ok(i);
            }
        }
        let frame = self.choose_frame(page_id, is_root);
        device.read(page_id, self.page_size, self.frame_slice_mut(frame))?;
        self.status[frame] = Some(page_id);
        self.last_hit = frame as u16;
        self.stats.num_reads += 1;
        trace!("buffer: read page {page_id} into frame {frame}");
        Ok(frame)
    }

    /// Forces a fresh read of `page_id` into a specific frame (typically 0,
    /// the scratch frame), bypassing residency.
    pub fn read_into(
        &mut self,
        device: &mut dyn BlockDevice,
        page_id: PageId,
        frame: usize,
    ) -> Result<()> {
        device.read(page_id, self.page_size, self.frame_slice_mut(frame))?;
        self.status[frame] = Some(page_id);
        self.stats.num_reads += 1;
        Ok(())
    }

    /// Fills a frame with all-one bytes (required before a NOR page may be
    /// written) and clears its residency tag.
    pub fn init_frame(&mut self, frame: usize) {
        self.frame_slice_mut(frame).fill(0xFF);
        self.status[frame] = None;
    }

    pub fn frame(&self, frame: usize) -> &[u8] {
        self.frame_slice(frame)
    }

    pub fn frame_mut(&mut self, frame: usize) -> &mut [u8] {
        self.frame_slice_mut(frame)
    }

    /// Advances `next_page_write_id`, skipping any page that is not free or
    /// that a live mapping still addresses, per invariant 6.
    fn next_valid_write_id(&mut self, resolve_identity: &mut dyn FnMut(u32) -> u32) -> Result<u32> {
        let start = self.next_page_write_id;
        loop {
            self.next_page_write_id = (self.next_page_write_id + 1) % (self.end_data_page + 1);
            let p = self.next_page_write_id;
            if self.free_pages.get(p) == 1 && resolve_identity(p) == p {
                return Ok(p);
            }
            if self.next_page_write_id == start {
                return Err(VmtreeError::OutOfSpace { needed: 1 });
            }
        }
    }

    /// Allocates the next physical page, stamps a fresh logical id into
    /// `buf[0..4]`, writes it to the device, and marks the slot used.
    pub fn write_page(
        &mut self,
        device: &mut dyn BlockDevice,
        buf: &mut [u8],
        resolve_identity: &mut dyn FnMut(u32) -> u32,
    ) -> Result<PageId> {
        let p = self.next_valid_write_id(resolve_identity)?;
        buf[0..4].copy_from_slice(&self.next_page_id.to_le_bytes());
        self.next_page_id += 1;
        device.write(p, self.page_size, buf)?;
        self.free_pages.set(p, 0);
        self.stats.num_writes += 1;
        for i in 1..self.status.len() {
            if self.status[i] == Some(p) {
                self.frame_slice_mut(i).copy_from_slice(buf);
            }
        }
        debug!("buffer: wrote fresh page {p}");
        Ok(p)
    }

    /// Writes `buf` back to the same physical id (used by block
    /// reclamation migration, where parent pointers must stay valid).
    pub fn write_page_direct(
        &mut self,
        device: &mut dyn BlockDevice,
        buf: &[u8],
        page_id: PageId,
    ) -> Result<()> {
        device.write(page_id, self.page_size, buf)?;
        self.free_pages.set(page_id, 0);
        for i in 1..self.status.len() {
            if self.status[i] == Some(page_id) {
                self.frame_slice_mut(i).copy_from_slice(buf);
            }
        }
        Ok(())
    }

    /// Overwrites `buf` in place at `page_id` (NOR mode) and refreshes any
    /// frame currently caching it.
    pub fn over_write_page(
        &mut self,
        device: &mut dyn BlockDevice,
        buf: &[u8],
        page_id: PageId,
    ) -> Result<()> {
        device.write(page_id, self.page_size, buf)?;
        self.stats.num_over_writes += 1;
        for i in 0..self.status.len() {
            if self.status[i] == Some(page_id) {
                self.frame_slice_mut(i).copy_from_slice(buf);
            }
        }
        Ok(())
    }

    pub fn set_free(&mut self, page_id: PageId) {
        self.free_pages.set(page_id, 1);
    }

    pub fn set_valid(&mut self, page_id: PageId) {
        self.free_pages.set(page_id, 0);
    }

    pub fn is_free(&self, page_id: PageId) -> bool {
        self.free_pages.get(page_id) == 1
    }

    pub fn clear_stats(&mut self) {
        self.stats = BufferStats::default();
    }

    /// The wear-aware block-reclamation routine. Frees at least `n` pages
    /// by scanning forward from `next_page_write_id`, migrating live pages
    /// out of the next candidate erase block, erasing it, and writing the
    /// migrated pages back to their original physical ids.
    pub fn ensure_space(
        &mut self,
        device: &mut dyn BlockDevice,
        n: u16,
        callbacks: &mut dyn TreeCallbacks,
    ) -> Result<()> {
        let window_free = self.count_free_in_window();
        if window_free >= n as u32 {
            return Ok(());
        }

        let erase_size = self.erase_size_in_pages as u32;
        let mut scanned_blocks = 0u32;
        let total_blocks = (self.end_data_page + 1) / erase_size;

        loop {
            let start = (self.erased_end_page + 1) % (self.end_data_page + 1);
            let end = start + erase_size - 1;
            let mut moved_ids = Vec::with_capacity(erase_size as usize);

            for i in start..=end {
                if self.is_free(i) {
                    continue;
                }
                match callbacks.is_valid(i)? {
                    Validity::Dead => {}
                    Validity::LiveViaMapping => {}
                    Validity::LiveDirect => {
                        let frame = self.read(device, i, false)?;
                        let page_size = self.page_size as usize;
                        let off = moved_ids.len() * page_size;
                        let src = frame * page_size;
                        self.block_buffer[off..off + page_size]
                            .copy_from_slice(&self.frames[src..src + page_size]);
                        moved_ids.push(i);
                    }
                }
            }

            scanned_blocks += 1;
            if moved_ids.len() as u32 == erase_size {
                self.erased_end_page = end;
                if scanned_blocks >= total_blocks {
                    return Err(VmtreeError::OutOfSpace { needed: n });
                }
                continue;
            }

            device.erase_pages(start, end)?;
            self.stats.num_block_erases += 1;
            for i in start..=end {
                self.free_pages.set(i, 1);
            }

            for (k, &id) in moved_ids.iter().enumerate() {
                let off = k * self.page_size as usize;
                let page = self.block_buffer[off..off + self.page_size as usize].to_vec();
                self.write_page_direct(device, &page, id)?;
                self.stats.num_moves += 1;
            }

            self.erased_start_page = start;
            self.erased_end_page = end;

            if self.count_free_in_window() >= n as u32 {
                return Ok(());
            }
            if scanned_blocks >= total_blocks {
                return Err(VmtreeError::OutOfSpace { needed: n });
            }
        }
    }

    fn count_free_in_window(&self) -> u32 {
        let mut p = self.next_page_write_id;
        let mut count = 0;
        for _ in 0..=self.end_data_page {
            if self.free_pages.get(p) == 1 {
                count += 1;
            }
            if p == self.erased_end_page {
                break;
            }
            p = (p + 1) % (self.end_data_page + 1);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlockDevice;

    struct NoopCallbacks;
    impl TreeCallbacks for NoopCallbacks {
        fn is_valid(&mut self, _page_id: PageId) -> Result<Validity> {
            Ok(Validity::Dead)
        }
        fn move_page(&mut self, _prev: PageId, _curr: PageId, _buf: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn check_mapping_space(&self) -> bool {
            true
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut device = MemoryBlockDevice::new(512 * 16, 512);
        let mut pool = BufferPool::new(512, 4, 16, 8);
        let mut buf = vec![0xAAu8; 512];
        let id = pool
            .write_page(&mut device, &mut buf, &mut |p| p)
            .unwrap();
        let frame = pool.read(&mut device, id, false).unwrap();
        assert_eq!(pool.frame(frame)[10], 0xAA);
    }

    #[test]
    fn ensure_space_noop_when_enough_free() {
        let mut device = MemoryBlockDevice::new(512 * 16, 512);
        let mut pool = BufferPool::new(512, 4, 16, 8);
        let mut cb = NoopCallbacks;
        pool.ensure_space(&mut device, 1, &mut cb).unwrap();
    }
}
