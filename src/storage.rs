//! Block device interface and the two concrete backends shipped for testing.
//!
//! The engine depends only on [`BlockDevice`]; a real dataflash/NOR driver is
//! out of scope (spec §1/§6) and is the caller's responsibility. The two
//! implementations here exist so `Tree` is runnably testable, grounded in
//! `memStorage.c` and `fileStorage.c` respectively.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, VmtreeError};

pub trait BlockDevice {
    fn read(&mut self, page_id: u32, page_size: u16, dst: &mut [u8]) -> Result<()>;
    fn write(&mut self, page_id: u32, page_size: u16, src: &[u8]) -> Result<()>;
    fn erase_pages(&mut self, start: u32, end: u32) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// A `Vec<u8>`-backed device, grounded in `memStorageState` (flat byte
/// array; erase = reset to all-ones bytes exactly as NOR erase would leave
/// them).
pub struct MemoryBlockDevice {
    buffer: Vec<u8>,
    page_size: u16,
}

impl MemoryBlockDevice {
    pub fn new(size_bytes: usize, page_size: u16) -> Self {
        MemoryBlockDevice {
            buffer: vec![0xFF; size_bytes],
            page_size,
        }
    }

    fn bounds_check(&self, page_id: u32, page_size: u16) -> Result<(usize, usize)> {
        let start = page_id as usize * page_size as usize;
        let end = start + page_size as usize;
        if end > self.buffer.len() {
            return Err(VmtreeError::Io(format!(
                "page {page_id} out of range for memory device of {} bytes",
                self.buffer.len()
            )));
        }
        Ok((start, end))
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read(&mut self, page_id: u32, page_size: u16, dst: &mut [u8]) -> Result<()> {
        let (start, end) = self.bounds_check(page_id, page_size)?;
        dst[..page_size as usize].copy_from_slice(&self.buffer[start..end]);
        Ok(())
    }

    fn write(&mut self, page_id: u32, page_size: u16, src: &[u8]) -> Result<()> {
        let (start, end) = self.bounds_check(page_id, page_size)?;
        self.buffer[start..end].copy_from_slice(&src[..page_size as usize]);
        Ok(())
    }

    fn erase_pages(&mut self, start: u32, end: u32) -> Result<()> {
        let (s, _) = self.bounds_check(start, self.page_size)?;
        let (_, e) = self.bounds_check(end, self.page_size)?;
        self.buffer[s..e].fill(0xFF);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Single-file seek+read/write device, grounded in `fileStorage.c`.
pub struct FileBlockDevice {
    file: File,
    page_size: u16,
}

impl FileBlockDevice {
    pub fn create(path: impl AsRef<Path>, size_bytes: u64, page_size: u16) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        file.set_len(size_bytes)
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        let mut dev = FileBlockDevice { file, page_size };
        dev.zero_fill(size_bytes)?;
        Ok(dev)
    }

    fn zero_fill(&mut self, size_bytes: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        let chunk = vec![0xFFu8; 4096];
        let mut written = 0u64;
        while written < size_bytes {
            let n = std::cmp::min(chunk.len() as u64, size_bytes - written) as usize;
            self.file
                .write_all(&chunk[..n])
                .map_err(|e| VmtreeError::Io(e.to_string()))?;
            written += n as u64;
        }
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&mut self, page_id: u32, page_size: u16, dst: &mut [u8]) -> Result<()> {
        let offset = page_id as u64 * page_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        self.file
            .read_exact(&mut dst[..page_size as usize])
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        Ok(())
    }

    fn write(&mut self, page_id: u32, page_size: u16, src: &[u8]) -> Result<()> {
        let offset = page_id as u64 * page_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        self.file
            .write_all(&src[..page_size as usize])
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        Ok(())
    }

    fn erase_pages(&mut self, start: u32, end: u32) -> Result<()> {
        let offset = start as u64 * self.page_size as u64;
        let count = (end - start + 1) as usize * self.page_size as usize;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        self.file
            .write_all(&vec![0xFFu8; count])
            .map_err(|e| VmtreeError::Io(e.to_string()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| VmtreeError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trip() {
        let mut dev = MemoryBlockDevice::new(4 * 512, 512);
        let page = vec![7u8; 512];
        dev.write(2, 512, &page).unwrap();
        let mut out = vec![0u8; 512];
        dev.read(2, 512, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn memory_device_erase_resets_to_ones() {
        let mut dev = MemoryBlockDevice::new(4 * 512, 512);
        dev.write(1, 512, &vec![0u8; 512]).unwrap();
        dev.erase_pages(0, 3).unwrap();
        let mut out = vec![0u8; 512];
        dev.read(1, 512, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xFF));
    }
}
