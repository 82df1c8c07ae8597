//! NAND flash subsystem: chip metrics, ECC, partition layout, and the two
//! bus-controller state machines (spec.md §3 "NAND state", §4.E).
//!
//! Grounded on `original_source/core/memory/flash.cpp`.

pub mod ecc;
pub mod fs;
pub mod parallel;
pub mod partition;
pub mod spi;

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{CoreError, CoreResult};

/// `{manufacturer_id, device_id, num_pages, log2_pages_per_block, page_size}`
/// (spec.md §3). The two concrete chips the corpus supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipMetrics {
    pub manufacturer_id: u8,
    pub device_id: u8,
    pub page_size: u32,
    pub log2_pages_per_block: u32,
    pub num_pages: u32,
}

/// ST Micro NAND256R3A: small-page parallel NAND, 33 MiB flash image.
pub const CHIP_SMALL_PAGE: ChipMetrics =
    ChipMetrics { manufacturer_id: 0x20, device_id: 0x35, page_size: 0x210, log2_pages_per_block: 5, num_pages: 0x10000 };

/// Winbond W25N01GW: 1 Gbit SPI NAND, 132 MiB flash image.
pub const CHIP_LARGE_PAGE: ChipMetrics =
    ChipMetrics { manufacturer_id: 0xEF, device_id: 0xBA, page_size: 0x840, log2_pages_per_block: 6, num_pages: 0x10000 };

impl ChipMetrics {
    pub fn data_size(self) -> u32 {
        if self.page_size < 0x800 {
            0x200
        } else {
            0x800
        }
    }
    pub fn spare_size(self) -> u32 {
        self.page_size - self.data_size()
    }
    pub fn pages_per_block(self) -> u32 {
        1 << self.log2_pages_per_block
    }
    pub fn block_size(self) -> u32 {
        self.page_size * self.pages_per_block()
    }
    pub fn total_size(self) -> u64 {
        self.page_size as u64 * self.num_pages as u64
    }
    pub fn is_large_page(self) -> bool {
        self.page_size >= 0x800
    }

    /// Distinguishes the chip solely by flash-image file length, per
    /// spec.md §6 "Flash image format".
    pub fn from_file_size(size: u64) -> Option<Self> {
        if size == CHIP_SMALL_PAGE.total_size() {
            Some(CHIP_SMALL_PAGE)
        } else if size == CHIP_LARGE_PAGE.total_size() {
            Some(CHIP_LARGE_PAGE)
        } else {
            None
        }
    }
}

/// Host-backed memory-mapped flash image (spec.md §3 "Data lives in a
/// host-backed memory-mapped file").
pub struct FlashImage {
    pub metrics: ChipMetrics,
    mmap: MmapMut,
    pub block_modified: Vec<bool>,
}

impl FlashImage {
    pub fn open(path: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let metrics = ChipMetrics::from_file_size(len)
            .ok_or_else(|| CoreError::Nand(format!("unrecognized flash image size {} bytes", len)))?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let num_blocks = (metrics.num_pages / metrics.pages_per_block()) as usize;
        Ok(FlashImage { metrics, mmap, block_modified: vec![false; num_blocks] })
    }

    /// Creates a fresh, zeroed (all-0xFF, matching erased NAND) image file
    /// of the requested size and opens it.
    pub fn create(path: &Path, large: bool) -> CoreResult<Self> {
        let metrics = if large { CHIP_LARGE_PAGE } else { CHIP_SMALL_PAGE };
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        let buf = vec![0xFFu8; metrics.total_size() as usize];
        file.write_all(&buf)?;
        drop(file);
        Self::open(path)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn page(&self, page: u32) -> &[u8] {
        let off = page as usize * self.metrics.page_size as usize;
        &self.mmap[off..off + self.metrics.page_size as usize]
    }

    pub fn page_mut(&mut self, page: u32) -> &mut [u8] {
        let size = self.metrics.page_size as usize;
        let off = page as usize * size;
        &mut self.mmap[off..off + size]
    }

    /// NAND program semantics: writes flip bits low only. Marks the
    /// containing block dirty.
    pub fn program_page(&mut self, page: u32, offset: u32, data: &[u8]) {
        let block_size = self.metrics.block_size();
        let block = (page * self.metrics.page_size) / block_size;
        let dst = self.page_mut(page);
        let off = offset as usize;
        let end = (off + data.len()).min(dst.len());
        if off >= end {
            return;
        }
        for (d, s) in dst[off..end].iter_mut().zip(data.iter()) {
            *d &= *s;
        }
        if let Some(flag) = self.block_modified.get_mut(block as usize) {
            *flag = true;
        }
    }

    /// Erases a block to all-ones, clamped to the block base when `row` is
    /// not block-aligned (spec.md §8 boundary behavior).
    pub fn erase_block(&mut self, row: u32) {
        let pages_per_block = self.metrics.pages_per_block();
        let block = row / pages_per_block;
        if row % pages_per_block != 0 {
            log::warn!("nand erase: row {:#x} not block-aligned, clamping to block base", row);
        }
        let start_page = block * pages_per_block;
        for p in start_page..start_page + pages_per_block {
            self.page_mut(p).fill(0xFF);
        }
        if let Some(flag) = self.block_modified.get_mut(block as usize) {
            *flag = true;
        }
    }

    pub fn flush(&self) -> CoreResult<()> {
        self.mmap.flush().map_err(CoreError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_can_only_clear_bits() {
        let mut data = vec![0xFFu8; 16];
        for (i, b) in data.iter_mut().enumerate() {
            if i < 4 {
                *b = 0xFF;
            }
        }
        let pattern = [0x0Fu8; 4];
        for (d, p) in data[0..4].iter_mut().zip(pattern.iter()) {
            *d &= *p;
        }
        assert_eq!(&data[0..4], &[0x0F, 0x0F, 0x0F, 0x0F]);
    }
}
