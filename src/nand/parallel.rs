//! Classic parallel NAND state machine (spec.md §4.E "Classic parallel
//! path"). Ported from `original_source/core/memory/flash.cpp`'s
//! `nand_write_command_byte` / `nand_write_address_byte` family.

use log::warn;

use super::{ChipMetrics, FlashImage};
use crate::error::{fatal, CoreResult};

const PAGE_BUFFER_MAX: usize = 0x840;

#[derive(Debug)]
pub struct ParallelNand {
    pub metrics: ChipMetrics,
    pub writable: bool,
    state: u8,
    addr_state: u8,
    area_pointer: u32,
    row: u32,
    col: u32,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl ParallelNand {
    pub fn new(metrics: ChipMetrics) -> Self {
        ParallelNand {
            metrics,
            writable: true,
            state: 0xFF,
            addr_state: 0,
            area_pointer: 0,
            row: 0,
            col: 0,
            buffer: vec![0u8; PAGE_BUFFER_MAX],
            buffer_pos: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = 0xFF;
        self.writable = true;
        self.addr_state = 0;
        self.area_pointer = 0;
        self.row = 0;
        self.col = 0;
        self.buffer_pos = 0;
    }

    pub fn write_command(&mut self, flash: &mut FlashImage, command: u8) -> CoreResult<()> {
        match command {
            0x01 | 0x50 if self.metrics.page_size < 0x800 => {
                self.area_pointer = 2;
                self.addr_state = 0;
                self.state = 0x00;
            }
            0x00 => {
                self.area_pointer = 0;
                self.addr_state = 0;
                self.state = 0x00;
            }
            0x10 => {
                if self.state == 0x80 {
                    if !self.writable {
                        return Err(fatal("NAND program with write protect on"));
                    }
                    flash.program_page(self.row, self.col, &self.buffer[..self.buffer_pos]);
                    self.state = 0xFF;
                }
            }
            0x30 => {}
            0x60 => {
                self.addr_state = 2;
                self.state = command;
            }
            0x80 => {
                self.buffer_pos = 0;
                self.addr_state = 0;
                self.state = command;
            }
            0xD0 => {
                if self.state == 0x60 {
                    if !self.writable {
                        return Err(fatal("NAND erase with write protect on"));
                    }
                    let block_bits = self.metrics.pages_per_block() - 1;
                    if self.row & block_bits != 0 {
                        warn!("NAND flash: erase nonexistent block {:#x}", self.row);
                        self.row &= !block_bits;
                    }
                    flash.erase_block(self.row);
                    self.state = 0xFF;
                }
            }
            0xFF => {
                self.row = 0;
                self.col = 0;
                self.area_pointer = 0;
                self.addr_state = 6;
                self.state = command;
            }
            0x70 | 0x90 => {
                self.addr_state = 6;
                self.state = command;
            }
            _ => warn!("Unknown NAND command {:#04x}", command),
        }
        Ok(())
    }

    pub fn write_address(&mut self, byte: u8) {
        if self.addr_state >= 6 {
            return;
        }
        let state = self.addr_state;
        self.addr_state += 1;
        match state {
            0 => {
                if self.metrics.page_size < 0x800 {
                    self.col = self.area_pointer << 8;
                    self.addr_state = 2;
                    self.area_pointer &= !1;
                }
                self.col = (self.col & !0xFF) | byte as u32;
            }
            1 => {
                self.col = (self.col & 0xFF) | ((byte as u32) << 8);
            }
            n => {
                let bit = (n - 3) * 8;
                self.row = (self.row & !(0xFFu32 << bit)) | ((byte as u32) << bit);
                self.row &= self.metrics.num_pages - 1;
            }
        }
    }

    pub fn read_data_byte(&mut self, flash: &FlashImage) -> u8 {
        match self.state {
            0x00 => {
                if self.col >= self.metrics.page_size {
                    return 0;
                }
                let page = flash.page(self.row);
                let b = page[self.col as usize];
                self.col += 1;
                b
            }
            0x70 => 0x40 | ((self.writable as u8) << 7),
            0x90 => {
                self.state = 0x91;
                self.metrics.manufacturer_id
            }
            0x91 => {
                self.state = 0xFF;
                self.metrics.device_id
            }
            _ => 0,
        }
    }

    pub fn write_data_byte(&mut self, value: u8) {
        match self.state {
            0x80 => {
                if self.buffer_pos + self.col as usize >= self.metrics.page_size as usize {
                    warn!("NAND write past end of page");
                } else if self.buffer_pos < self.buffer.len() {
                    self.buffer[self.buffer_pos] = value;
                    self.buffer_pos += 1;
                }
            }
            s => warn!("NAND write in state {:#04x}", s),
        }
    }

    pub fn status(&self) -> u8 {
        0x40 | ((self.writable as u8) << 7)
    }
}

impl crate::snapshot::Snapshot for ParallelNand {
    /// `metrics` is not part of the blob: it is re-derived from the flash
    /// image's own header on `attach_flash`, which always runs before a
    /// resume (spec.md §4.J "nand").
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&[self.writable as u8, self.state, self.addr_state])?;
        out.write_all(&self.area_pointer.to_le_bytes())?;
        out.write_all(&self.row.to_le_bytes())?;
        out.write_all(&self.col.to_le_bytes())?;
        out.write_all(&(self.buffer_pos as u32).to_le_bytes())?;
        out.write_all(&self.buffer)
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut tag = [0u8; 3];
        input.read_exact(&mut tag)?;
        self.writable = tag[0] != 0;
        self.state = tag[1];
        self.addr_state = tag[2];
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.area_pointer = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.row = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.col = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.buffer_pos = u32::from_le_bytes(buf) as usize;
        input.read_exact(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::CHIP_SMALL_PAGE;
    use std::path::Path;

    fn scratch_flash(name: &str) -> FlashImage {
        let path = std::env::temp_dir().join(name);
        FlashImage::create(&path, false).unwrap()
    }

    #[test]
    fn erase_then_program_then_read_round_trips() {
        let mut flash = scratch_flash("nspire_core_test_parallel_roundtrip.bin");
        let mut nand = ParallelNand::new(CHIP_SMALL_PAGE);
        nand.write_command(&mut flash, 0x60).unwrap();
        nand.write_address(0);
        nand.write_address(0);
        nand.write_address(0);
        nand.write_command(&mut flash, 0xD0).unwrap();

        nand.write_command(&mut flash, 0x80).unwrap();
        nand.write_address(0);
        nand.write_address(0);
        nand.write_address(0);
        nand.write_address(0);
        nand.write_address(0);
        for b in 0u8..16 {
            nand.write_data_byte(b);
        }
        nand.write_command(&mut flash, 0x10).unwrap();

        nand.write_command(&mut flash, 0x00).unwrap();
        nand.write_address(0);
        nand.write_address(0);
        nand.write_address(0);
        nand.write_address(0);
        nand.write_address(0);
        for expected in 0u8..16 {
            assert_eq!(nand.read_data_byte(&flash), expected);
        }
        let _ = Path::new("unused");
    }

    #[test]
    fn snapshot_round_trips_mid_program_state() {
        use crate::snapshot::Snapshot;
        let mut flash = scratch_flash("nspire_core_test_parallel_snapshot.bin");
        let mut nand = ParallelNand::new(CHIP_SMALL_PAGE);
        nand.write_command(&mut flash, 0x80).unwrap();
        nand.write_address(0);
        nand.write_data_byte(0xAB);

        let mut buf = Vec::new();
        nand.write_to(&mut buf).unwrap();
        let mut restored = ParallelNand::new(CHIP_SMALL_PAGE);
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.buffer_pos, nand.buffer_pos);
        assert_eq!(restored.col, nand.col);
        restored.write_command(&mut flash, 0x10).unwrap();
        assert_eq!(restored.status(), nand.status());
    }
}
