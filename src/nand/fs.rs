//! Reliance-like filesystem over FlashFX-mapped logical blocks (spec.md §3
//! "Filesystem model", GLOSSARY "Reliance FS"). Read-only by default, with
//! optional edit-in-place writes.
//!
//! Grounded on `original_source/core/memory/nand_fs.cpp`. Parsing failures
//! downgrade to "filesystem unrecognized" rather than panicking, per
//! spec.md §9 Open Questions.

use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::nand::ChipMetrics;

const MAST_SIG: &[u8; 4] = b"MAST";
const INOD_SIG: &[u8; 4] = b"INOD";
const MAX_FS_NODES: usize = 1 << 16;
const MAX_FILE_READ: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

/// Inline at inode+0x40, single-, double-, or triple-indirect block lists
/// (spec.md §3 "Storage modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Inline = 0,
    SingleIndirect = 1,
    DoubleIndirect = 2,
    TripleIndirect = 3,
}

impl StorageMode {
    fn from_u32(v: u32) -> Self {
        match v & 3 {
            0 => StorageMode::Inline,
            1 => StorageMode::SingleIndirect,
            2 => StorageMode::DoubleIndirect,
            _ => StorageMode::TripleIndirect,
        }
    }
}

#[derive(Debug)]
pub struct Node {
    pub inode_num: u32,
    pub parent_inode: u32,
    pub kind: NodeKind,
    pub name: String,
    pub full_path: String,
    pub size: u64,
    pub mtime: u32,
    pub storage_mode: StorageMode,
    pub inode_block: u32,
    pub data_blocks: Vec<u32>,
}

pub struct Filesystem {
    pub nodes: Vec<Node>,
    pub logical_to_physical: Vec<u32>,
    pub block_size: u32,
    pub page_size: u32,
    pub data_per_page: u32,
    pub pages_per_block: u32,
    pub partition_offset: u64,
}

fn rd32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn utf16le_to_utf8(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units).trim_end_matches('\0').to_string()
}

impl Filesystem {
    /// Translates a Reliance logical block number to a NAND data-byte
    /// offset within the partition.
    fn block_offset(&self, logical_block: u32) -> Option<u64> {
        let phys = *self.logical_to_physical.get(logical_block as usize)?;
        let block_size_phys = self.page_size as u64 * self.pages_per_block as u64;
        Some(self.partition_offset + phys as u64 * block_size_phys)
    }

    fn read_fs_block<'a>(&self, nand_data: &'a [u8], logical_block: u32) -> Option<&'a [u8]> {
        let off = self.block_offset(logical_block)? as usize;
        let end = off + self.block_size as usize;
        nand_data.get(off..end)
    }

    fn read_block_pointers(&self, nand_data: &[u8], inode_block: u32, offset: usize) -> Vec<u32> {
        let mut out = Vec::new();
        if let Some(block) = self.read_fs_block(nand_data, inode_block) {
            let mut pos = offset;
            while pos + 4 <= block.len() {
                let ptr = rd32(block, pos);
                if ptr == 0 || ptr == u32::MAX {
                    break;
                }
                out.push(ptr);
                pos += 4;
            }
        }
        out
    }

    fn read_inode_block(&self, nand_data: &[u8], inode_num: u32, inode_block_ptr: u32) -> Option<Node> {
        let block = self.read_fs_block(nand_data, inode_block_ptr)?;
        if &block[0..4] != INOD_SIG {
            return None;
        }
        let size = rd32(block, 0x08) as u64;
        let mtime = rd32(block, 0x18);
        let attributes = rd32(block, 0x28);
        let storage_mode = StorageMode::from_u32(attributes);
        let data_blocks = match storage_mode {
            StorageMode::Inline => Vec::new(),
            StorageMode::SingleIndirect => self.read_block_pointers(nand_data, inode_block_ptr, 0x40),
            StorageMode::DoubleIndirect => {
                let mut out = Vec::new();
                for indi in self.read_block_pointers(nand_data, inode_block_ptr, 0x40) {
                    out.extend(self.read_block_pointers(nand_data, indi, 0));
                }
                out
            }
            StorageMode::TripleIndirect => {
                let mut out = Vec::new();
                for dbli in self.read_block_pointers(nand_data, inode_block_ptr, 0x40) {
                    for indi in self.read_block_pointers(nand_data, dbli, 0) {
                        out.extend(self.read_block_pointers(nand_data, indi, 0));
                    }
                }
                out
            }
        };
        Some(Node {
            inode_num,
            parent_inode: 0,
            kind: NodeKind::File,
            name: String::new(),
            full_path: String::new(),
            size,
            mtime,
            storage_mode,
            inode_block: inode_block_ptr,
            data_blocks,
        })
    }

    /// Reads the raw bytes of a node, following its storage mode.
    pub fn read_file_bytes(&self, nand_data: &[u8], node: &Node) -> CoreResult<Vec<u8>> {
        let size = node.size.min(MAX_FILE_READ) as usize;
        if node.storage_mode == StorageMode::Inline {
            let block = self.read_fs_block(nand_data, node.inode_block).ok_or_else(|| CoreError::FsUnrecognized("inode block unreadable".into()))?;
            let end = (0x40 + size).min(block.len());
            return Ok(block[0x40..end].to_vec());
        }
        let mut out = Vec::with_capacity(size);
        let block_data = (self.page_size * self.pages_per_block) as usize;
        for &blk in &node.data_blocks {
            if out.len() >= size {
                break;
            }
            if let Some(block) = self.read_fs_block(nand_data, blk) {
                let take = (size - out.len()).min(block_data).min(block.len());
                out.extend_from_slice(&block[..take]);
            }
        }
        out.truncate(size);
        Ok(out)
    }

    fn parse_directory(
        &mut self,
        nand_data: &[u8],
        dir_data: &[u8],
        parent_inode: u32,
        parent_path: &str,
        inode_to_block: &HashMap<u32, u32>,
        depth: u32,
    ) {
        if depth > 32 || self.nodes.len() >= MAX_FS_NODES {
            return;
        }
        let mut pos = 0usize;
        while pos + 0x12 < dir_data.len() && self.nodes.len() < MAX_FS_NODES {
            if dir_data[pos] != 0x80 {
                pos += 1;
                continue;
            }
            let entry_len = dir_data[pos + 3] as usize;
            if entry_len < 0x12 || pos + entry_len > dir_data.len() {
                break;
            }
            let name_byte_len = dir_data[pos + 7] as usize;
            let attribs = dir_data[pos + 9];
            let child_inode = ((dir_data[pos + 0x0A] as u32) << 8) | dir_data[pos + 0x0B] as u32;
            let in_use = attribs & 0x01 != 0;
            let is_dir = attribs & 0x02 != 0;

            if in_use && name_byte_len > 0 && child_inode != 0 {
                let mut name_buf = Vec::with_capacity(name_byte_len);
                let mut remaining = name_byte_len;
                let mut cell_off = pos + 0x12;
                while remaining > 0 && cell_off < pos + entry_len {
                    let avail = remaining.min(14).min((pos + entry_len).saturating_sub(cell_off));
                    for i in 0..avail {
                        if let Some(&b) = dir_data.get(cell_off + i) {
                            name_buf.push(b);
                        }
                    }
                    remaining -= avail;
                    cell_off += 16;
                }
                if !name_buf.is_empty() {
                    let name = utf16le_to_utf8(&name_buf);
                    if !name.is_empty() && name != "." && name != ".." {
                        if let Some(&block) = inode_to_block.get(&child_inode) {
                            if let Some(mut node) = self.read_inode_block(nand_data, child_inode, block) {
                                node.parent_inode = parent_inode;
                                node.name = name.clone();
                                node.full_path = format!("{}/{}", parent_path, name);
                                node.kind = if is_dir { NodeKind::Dir } else { NodeKind::File };
                                let full_path = node.full_path.clone();
                                self.nodes.push(node);
                                if is_dir {
                                    let node_ref = self.nodes.last().unwrap().clone();
                                    if let Ok(contents) = self.read_file_bytes(nand_data, &node_ref) {
                                        if !contents.is_empty() {
                                            self.parse_directory(nand_data, &contents, child_inode, &full_path, inode_to_block, depth + 1);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            pos += entry_len;
        }
    }

    pub fn find_by_path(&self, path: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.full_path == path)
    }
}

/// Builds the FlashFX physical-to-logical block map by scanning spare-area
/// allocation bytes and choosing the highest sequence number per logical
/// address, falling back to an identity map when no FlashFX metadata is
/// present (spec.md §3 "Filesystem model").
fn flashfx_build_map(nand_data: &[u8], partition_offset: u64, partition_size: u64, metrics: ChipMetrics) -> Vec<u32> {
    let block_size_phys = metrics.page_size as u64 * metrics.pages_per_block() as u64;
    if block_size_phys == 0 {
        return Vec::new();
    }
    let num_blocks = (partition_size / block_size_phys) as u32;
    let mut logical_to_physical: HashMap<u32, (u32, u32)> = HashMap::new(); // logical -> (seq, phys)
    let spare_off = metrics.data_size() as usize;
    for phys in 0..num_blocks {
        let block_off = partition_offset + phys as u64 * block_size_phys;
        let spare_start = block_off as usize + spare_off;
        let spare = match nand_data.get(spare_start..spare_start + 16) {
            Some(s) => s,
            None => continue,
        };
        if spare.iter().all(|&b| b == 0xFF) {
            continue; // unallocated
        }
        let logical = u16::from_be_bytes([spare[0], spare[1]]) as u32;
        let seq = u16::from_be_bytes([spare[2], spare[3]]) as u32;
        if logical == 0xFFFF {
            continue;
        }
        match logical_to_physical.get(&logical) {
            Some(&(prev_seq, _)) if prev_seq >= seq => {}
            _ => {
                logical_to_physical.insert(logical, (seq, phys));
            }
        }
    }
    if logical_to_physical.is_empty() {
        return Vec::new();
    }
    let max_logical = *logical_to_physical.keys().max().unwrap();
    let mut out = vec![0u32; max_logical as usize + 1];
    for (logical, (_, phys)) in logical_to_physical {
        out[logical as usize] = phys;
    }
    out
}

/// Parses a Reliance filesystem out of `nand_data` at the given partition
/// bounds. Returns `Err(FsUnrecognized)` — never panics — on any structural
/// mismatch, per spec.md §9.
pub fn parse(nand_data: &[u8], partition_offset: u64, partition_size: u64, metrics: ChipMetrics) -> CoreResult<Filesystem> {
    let page_size = metrics.page_size;
    let data_per_page = page_size & !0x7F;
    let pages_per_block = metrics.pages_per_block();
    if partition_size == 0 || page_size == 0 || data_per_page == 0 || pages_per_block == 0 {
        return Err(CoreError::FsUnrecognized("invalid NAND metrics".into()));
    }

    let mut logical_to_physical = flashfx_build_map(nand_data, partition_offset, partition_size, metrics);
    if logical_to_physical.is_empty() {
        let block_size_phys = page_size as u64 * pages_per_block as u64;
        let num_blocks = (partition_size / block_size_phys) as usize;
        logical_to_physical = (0..num_blocks as u32).collect();
    }

    let mut fs = Filesystem {
        nodes: Vec::new(),
        logical_to_physical,
        block_size: data_per_page * pages_per_block,
        page_size,
        data_per_page,
        pages_per_block,
        partition_offset,
    };

    // MAST is conventionally the first logical block; its body starts at
    // Reliance byte offset 0x40.
    let mast_block = fs.read_fs_block(nand_data, 0).ok_or_else(|| CoreError::FsUnrecognized("MAST block unreadable".into()))?;
    if mast_block.len() < 0x40 + 24 || &mast_block[0x40..0x44] != MAST_SIG {
        return Err(CoreError::FsUnrecognized("no MAST signature found".into()));
    }
    let mast = &mast_block[0x40..];
    let meta_ptr_a = rd32(mast, 0x10);
    let meta_ptr_b = rd32(mast, 0x14);

    let pick_meta = |ptr: u32| -> Option<(u32, &[u8])> {
        let block = fs.read_fs_block(nand_data, ptr)?;
        if block.len() < 8 {
            return None;
        }
        Some((rd32(block, 0x04), block))
    };
    let meta_a = pick_meta(meta_ptr_a);
    let meta_b = pick_meta(meta_ptr_b);
    let _meta = match (meta_a, meta_b) {
        (Some(a), Some(b)) => {
            if a.0 >= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return Err(CoreError::FsUnrecognized("META blocks not readable".into())),
    };

    // Scan INOD blocks linearly; the newest physical block wins per inode
    // number (copy-on-write).
    let num_logical_blocks = fs.logical_to_physical.len() as u32;
    let mut inode_to_block: HashMap<u32, u32> = HashMap::new();
    let mut inode_seq: HashMap<u32, u32> = HashMap::new();
    for logical in 0..num_logical_blocks {
        let block = match fs.read_fs_block(nand_data, logical) {
            Some(b) => b,
            None => continue,
        };
        if block.len() < 0x30 || &block[0..4] != INOD_SIG {
            continue;
        }
        let inode_num = rd32(block, 0x04);
        let seq = rd32(block, 0x2C);
        match inode_seq.get(&inode_num) {
            Some(&prev) if prev >= seq => {}
            _ => {
                inode_seq.insert(inode_num, seq);
                inode_to_block.insert(inode_num, logical);
            }
        }
    }

    // Root is conventionally inode 1.
    let root_block = *inode_to_block.get(&1).ok_or_else(|| CoreError::FsUnrecognized("root inode not found".into()))?;
    let mut root = fs.read_inode_block(nand_data, 1, root_block).ok_or_else(|| CoreError::FsUnrecognized("root inode unreadable".into()))?;
    root.kind = NodeKind::Dir;
    root.full_path = String::new();
    root.name = String::new();
    let root_for_read = root.clone();
    fs.nodes.push(root);
    if let Ok(contents) = fs.read_file_bytes(nand_data, &root_for_read) {
        fs.parse_directory(nand_data, &contents, 1, "", &inode_to_block, 0);
    }

    Ok(fs)
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node {
            inode_num: self.inode_num,
            parent_inode: self.parent_inode,
            kind: self.kind,
            name: self.name.clone(),
            full_path: self.full_path.clone(),
            size: self.size,
            mtime: self.mtime,
            storage_mode: self.storage_mode,
            inode_block: self.inode_block,
            data_blocks: self.data_blocks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_name_decodes() {
        let bytes: Vec<u8> = "hi".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(utf16le_to_utf8(&bytes), "hi");
    }

    #[test]
    fn parse_on_garbage_downgrades_to_unrecognized() {
        let data = vec![0u8; 4096];
        let metrics = ChipMetrics { manufacturer_id: 0, device_id: 0, page_size: 0x840, log2_pages_per_block: 6, num_pages: 4 };
        let result = parse(&data, 0, 4096, metrics);
        assert!(result.is_err());
    }
}
