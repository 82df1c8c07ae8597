//! DMA controller (spec.md §2 component I "DMA"). Grounded on
//! `original_source/core/cx2.cpp`'s `dma_state`/`dma_cx2_update` (an
//! FTDMAC020-style single-channel block mover).
//!
//! Transfers bypass the flagged MMIO path entirely, matching the source's
//! comment that a DMA move "doesn't trigger any read or write actions".

use crate::memory::RamRom;

const CSR_ENABLE: u32 = 1;
const CSR_ENDIAN_MASK: u32 = 0b110;
const CTRL_START: u32 = 1;
const CTRL_ABORT: u32 = 1 << 15;
const CTRL_BUS_AHB1: u32 = 0b110;

#[derive(Debug, Default, Clone, Copy)]
pub struct DmaChannel {
    pub control: u32,
    pub config: u32,
    pub src: u32,
    pub dest: u32,
    pub len: u32,
}

/// Single-channel DMA block (the core only wires up channel 0, matching
/// the teacher source).
#[derive(Debug, Default)]
pub struct Dma {
    pub csr: u32,
    pub channel: DmaChannel,
}

impl crate::snapshot::Snapshot for Dma {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.csr.to_le_bytes())?;
        out.write_all(&self.channel.control.to_le_bytes())?;
        out.write_all(&self.channel.config.to_le_bytes())?;
        out.write_all(&self.channel.src.to_le_bytes())?;
        out.write_all(&self.channel.dest.to_le_bytes())?;
        out.write_all(&self.channel.len.to_le_bytes())
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.csr = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.channel.control = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.channel.config = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.channel.src = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.channel.dest = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.channel.len = u32::from_le_bytes(buf);
        Ok(())
    }
}

impl Dma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, addr: u32) -> u32 {
        match addr & 0x3FF {
            0x024 => self.csr,
            0x100 => self.channel.control,
            0x104 => self.channel.config,
            0x108 => self.channel.src,
            0x10C => self.channel.dest,
            0x114 => self.channel.len,
            _ => 0,
        }
    }

    /// Writes a register and, for the control register, attempts the
    /// transfer synchronously (the source has no separate "busy" phase:
    /// the copy completes before the write returns and the start bit is
    /// cleared immediately).
    pub fn write(&mut self, addr: u32, value: u32, ram_rom: &mut RamRom) {
        match addr & 0x3FF {
            0x024 => self.csr = value,
            0x100 => {
                self.channel.control = value;
                self.update(ram_rom);
            }
            0x104 => self.channel.config = value,
            0x108 => self.channel.src = value,
            0x10C => self.channel.dest = value,
            0x114 => self.channel.len = value & 0x003F_FFFF,
            _ => {}
        }
    }

    fn update(&mut self, ram_rom: &mut RamRom) {
        if self.csr & CSR_ENABLE == 0 {
            return;
        }
        if self.csr & CSR_ENDIAN_MASK != 0 {
            return;
        }
        let ch = &mut self.channel;
        if ch.control & CTRL_START == 0 {
            return;
        }
        if ch.control & CTRL_ABORT != 0 {
            ch.control &= !(CTRL_ABORT | CTRL_START);
            return;
        }
        if ch.control & CTRL_BUS_AHB1 != CTRL_BUS_AHB1 {
            log::warn!("DMA: unsupported bus config {:#x}", ch.control);
            ch.control &= !CTRL_START;
            return;
        }
        let dst_dir = (ch.control >> 3) & 3;
        let src_dir = (ch.control >> 5) & 3;
        if src_dir != 0 || dst_dir != 0 {
            log::warn!("DMA: unsupported direction src={} dst={}", src_dir, dst_dir);
            ch.control &= !CTRL_START;
            return;
        }
        let dst_width = (ch.control >> 8) & 7;
        let src_width = (ch.control >> 11) & 7;
        if dst_width != src_width || dst_width > 2 {
            log::warn!("DMA: unsupported width src={} dst={}", src_width, dst_width);
            ch.control &= !CTRL_START;
            return;
        }
        let unit = 1u32 << src_width;
        let total_len = ch.len.saturating_mul(unit);
        if !ram_rom.copy_within(ch.src, ch.dest, total_len) {
            log::warn!("DMA: invalid transfer src={:#010x} dst={:#010x} len={}", ch.src, ch.dest, total_len);
        }
        ch.control &= !CTRL_START;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BackedRegion, Size};

    fn ram_with(base: u32, size: u32) -> RamRom {
        let mut rr = RamRom::new(base + size);
        rr.add_region(BackedRegion::new("sdram", base, size, false));
        rr
    }

    #[test]
    fn word_copy_moves_bytes_and_clears_start_bit() {
        let mut ram_rom = ram_with(0x1000_0000, 0x1000);
        ram_rom.write(0x1000_0000, Size::Word, 0xDEAD_BEEF, |_| {}, |_| {});
        let mut dma = Dma::new();
        dma.csr = CSR_ENABLE;
        dma.channel.src = 0x1000_0000;
        dma.channel.dest = 0x1000_0100;
        dma.channel.len = 1;
        // AHB1 bus, inc/inc, width=2 (word) on both sides, start bit set.
        let control = CTRL_BUS_AHB1 | (2 << 8) | (2 << 11) | CTRL_START;
        dma.write(0x100, control, &mut ram_rom);
        assert_eq!(ram_rom.read(0x1000_0100, Size::Word, |_| {}), 0xDEAD_BEEF);
        assert_eq!(dma.channel.control & CTRL_START, 0);
    }

    #[test]
    fn unsupported_direction_clears_start_without_transfer() {
        let mut ram_rom = ram_with(0x1000_0000, 0x1000);
        let mut dma = Dma::new();
        dma.csr = CSR_ENABLE;
        dma.channel.src = 0x1000_0000;
        dma.channel.dest = 0x1000_0100;
        dma.channel.len = 1;
        let control = CTRL_BUS_AHB1 | (1 << 5) | CTRL_START; // src dir = DEC
        dma.write(0x100, control, &mut ram_rom);
        assert_eq!(dma.channel.control & CTRL_START, 0);
        assert_eq!(ram_rom.read(0x1000_0100, Size::Word, |_| {}), 0);
    }

    #[test]
    fn snapshot_round_trips_channel_registers() {
        use crate::snapshot::Snapshot;
        let mut dma = Dma::new();
        dma.csr = CSR_ENABLE;
        dma.channel.src = 0x1000_0000;
        dma.channel.dest = 0x1000_0200;
        dma.channel.len = 4;
        let mut buf = Vec::new();
        dma.write_to(&mut buf).unwrap();
        let mut restored = Dma::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.csr, dma.csr);
        assert_eq!(restored.channel.dest, dma.channel.dest);
    }
}
