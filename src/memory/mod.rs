//! Memory-mapped I/O dispatch fabric (spec.md §3 "Dispatch tables", §4.C)
//! and the RAM/ROM backing store (§3 "backed regions", §4.D).

pub mod flags;

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{AccessKind, CoreError, CoreResult};
use flags::{FlagRegion, WordFlags};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Byte,
    Half,
    Word,
}

impl Size {
    pub fn bytes(self) -> u32 {
        match self {
            Size::Byte => 1,
            Size::Half => 2,
            Size::Word => 4,
        }
    }
}

/// Top-level 64-way address decode, indexed by `addr >> 26` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopRegion {
    /// Routes to the generic RAM/ROM handler, which consults the backed
    /// region sequence (the default entry).
    RamRom,
    /// Routes to the 22-entry APB sub-dispatcher.
    Apb,
    NandParallel,
    NandSpi,
    Lcd,
    FastbootRam,
    Unmapped,
}

pub const TOP_TABLE_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct TopDispatch {
    entries: [TopRegion; TOP_TABLE_SIZE],
}

impl TopDispatch {
    pub fn new() -> Self {
        TopDispatch { entries: [TopRegion::RamRom; TOP_TABLE_SIZE] }
    }
    pub fn set(&mut self, index: u32, region: TopRegion) {
        self.entries[index as usize & (TOP_TABLE_SIZE - 1)] = region;
    }
    pub fn lookup(&self, addr: u32) -> TopRegion {
        self.entries[(addr >> 26) as usize & (TOP_TABLE_SIZE - 1)]
    }
}

impl Default for TopDispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Secondary APB sub-dispatch table, indexed by `(addr >> 16) & 31`
/// (spec.md §3). Only 22 of the 32 possible slots are populated by any
/// given SoC variant; the rest remain `Unmapped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApbRegion {
    InterruptController,
    Pmu,
    Adc,
    ClassicTimers,
    Sp804Timers,
    Gpio,
    Rtc,
    Watchdog,
    Sdio,
    Spi,
    Led,
    Serial,
    Keypad,
    Dma,
    LcdRegs,
    BacklightPwm,
    SdramCtl,
    Crypto,
    UsbLink,
    Unmapped,
}

pub const APB_TABLE_SIZE: usize = 32;

#[derive(Debug, Clone)]
pub struct ApbDispatch {
    entries: [ApbRegion; APB_TABLE_SIZE],
}

impl ApbDispatch {
    pub fn new() -> Self {
        ApbDispatch { entries: [ApbRegion::Unmapped; APB_TABLE_SIZE] }
    }
    pub fn set(&mut self, index: u32, region: ApbRegion) {
        self.entries[index as usize & (APB_TABLE_SIZE - 1)] = region;
    }
    pub fn lookup(&self, addr: u32) -> ApbRegion {
        self.entries[(addr >> 16) as usize & (APB_TABLE_SIZE - 1)]
    }
}

impl Default for ApbDispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// `{base, size, host-pointer}` descriptor for a backed region (spec.md §3).
/// Mirror regions share the host pointer of ROM by cloning the `Rc`.
#[derive(Clone)]
pub struct BackedRegion {
    pub name: &'static str,
    pub base: u32,
    pub size: u32,
    pub read_only: bool,
    data: Rc<RefCell<Vec<u8>>>,
}

impl BackedRegion {
    pub fn new(name: &'static str, base: u32, size: u32, read_only: bool) -> Self {
        BackedRegion { name, base, size, read_only, data: Rc::new(RefCell::new(vec![0u8; size as usize])) }
    }

    /// A mirror region sharing the same backing bytes as `self`, at a
    /// different base address.
    pub fn mirror(&self, name: &'static str, base: u32) -> Self {
        BackedRegion { name, base, size: self.size, read_only: self.read_only, data: Rc::clone(&self.data) }
    }

    pub fn contains(&self, addr: u32, access_size: u32) -> bool {
        addr >= self.base && (addr - self.base).saturating_add(access_size) <= self.size
    }

    pub fn load_bytes(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.borrow_mut();
        let end = (offset + bytes.len()).min(data.len());
        if offset < end {
            data[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }

    pub fn raw(&self) -> Rc<RefCell<Vec<u8>>> {
        Rc::clone(&self.data)
    }
}

/// The RAM/ROM model: a small ordered sequence of backed regions plus a
/// parallel flag region of identical total size (spec.md §4.D). Lookup is
/// a linear scan of at most 5 entries.
pub struct RamRom {
    pub regions: Vec<BackedRegion>,
    pub flags: FlagRegion,
    total_size: u32,
}

impl RamRom {
    pub fn new(total_size: u32) -> Self {
        RamRom { regions: Vec::with_capacity(5), flags: FlagRegion::new(total_size as usize), total_size }
    }

    pub fn add_region(&mut self, region: BackedRegion) {
        assert!(self.regions.len() < 5, "at most 5 backed regions are supported");
        self.regions.push(region);
    }

    fn find(&self, addr: u32, access_size: u32) -> Option<&BackedRegion> {
        self.regions.iter().find(|r| r.contains(addr, access_size))
    }

    fn kind(size: Size, is_write: bool) -> AccessKind {
        match (size, is_write) {
            (Size::Byte, false) => AccessKind::ReadByte,
            (Size::Half, false) => AccessKind::ReadHalf,
            (Size::Word, false) => AccessKind::ReadWord,
            (Size::Byte, true) => AccessKind::WriteByte,
            (Size::Half, true) => AccessKind::WriteHalf,
            (Size::Word, true) => AccessKind::WriteWord,
        }
    }

    /// Reads `size` bytes at `addr`. Consults the flag word first: a read
    /// with `BREAK_READ` set calls `on_break`. Unmapped ranges fall through
    /// to `bad_read` semantics (value 0, logged).
    pub fn read(&self, addr: u32, size: Size, mut on_break: impl FnMut(u32)) -> u32 {
        let flags = self.flags.get(addr & !3);
        if flags.contains(WordFlags::BREAK_READ) {
            on_break(addr);
        }
        match self.find(addr, size.bytes()) {
            Some(region) => {
                let data = region.raw();
                let data = data.borrow();
                let off = (addr - region.base) as usize;
                match size {
                    Size::Byte => data[off] as u32,
                    Size::Half => u16::from_be_bytes([data[off], data[off + 1]]) as u32,
                    Size::Word => u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]),
                }
            }
            None => {
                warn!("Bad {}: {:#010x}", Self::kind(size, false), addr);
                0
            }
        }
    }

    /// Writes `value` at `addr`. A read-only flag rejects the write; a
    /// `CODE_TRANSLATED` word invalidates the tag; `CODE_EXECUTED` is
    /// always cleared on write (spec.md §4.C "Side effects on backed RAM").
    pub fn write(&mut self, addr: u32, size: Size, value: u32, mut on_break: impl FnMut(u32), mut on_invalidate: impl FnMut(u32)) {
        let word_addr = addr & !3;
        let flags = self.flags.get(word_addr);
        if flags.contains(WordFlags::BREAK_WRITE) {
            on_break(addr);
        }
        if flags.contains(WordFlags::READ_ONLY) {
            warn!("Bad {}: {:#010x} (read-only)", Self::kind(size, true), addr);
            return;
        }
        if flags.contains(WordFlags::CODE_TRANSLATED) {
            on_invalidate(word_addr);
        }
        self.flags.modify(word_addr, |f| {
            f.remove(WordFlags::CODE_TRANSLATED);
            f.remove(WordFlags::CODE_EXECUTED);
        });
        let size_bytes = size.bytes();
        let region = match self.regions.iter().find(|r| r.contains(addr, size_bytes)) {
            Some(r) => r.clone(),
            None => {
                warn!("Bad {}: {:#010x}", Self::kind(size, true), addr);
                return;
            }
        };
        if region.read_only {
            warn!("Bad {}: {:#010x} (read-only region {})", Self::kind(size, true), addr, region.name);
            return;
        }
        let data = region.raw();
        let mut data = data.borrow_mut();
        let off = (addr - region.base) as usize;
        match size {
            Size::Byte => data[off] = value as u8,
            Size::Half => {
                let bytes = (value as u16).to_be_bytes();
                data[off..off + 2].copy_from_slice(&bytes);
            }
            Size::Word => {
                let bytes = value.to_be_bytes();
                data[off..off + 4].copy_from_slice(&bytes);
            }
        }
    }

    /// Raw byte-level copy between two backed regions, bypassing the flag
    /// word entirely (DMA does not trigger breakpoints or translation
    /// invalidation on host hardware either; spec.md §2 component I).
    /// Returns `false` (and copies nothing) if either range is unmapped.
    pub fn copy_within(&mut self, src_addr: u32, dst_addr: u32, len: u32) -> bool {
        let len = len as usize;
        let (src_region, src_off) = match self.find(src_addr, len as u32) {
            Some(r) => (r.clone(), (src_addr - r.base) as usize),
            None => return false,
        };
        let (dst_region, dst_off) = match self.find(dst_addr, len as u32) {
            Some(r) => (r.clone(), (dst_addr - r.base) as usize),
            None => return false,
        };
        if dst_region.read_only {
            return false;
        }
        let chunk = {
            let src_data = src_region.raw();
            let src_data = src_data.borrow();
            src_data[src_off..src_off + len].to_vec()
        };
        let dst_data = dst_region.raw();
        let mut dst_data = dst_data.borrow_mut();
        dst_data[dst_off..dst_off + len].copy_from_slice(&chunk);
        true
    }

    /// Fails cross-region accesses: true if `[addr, addr+size)` lies fully
    /// within the reserved maximum extent.
    pub fn in_bounds(&self, addr: u32, size: u32) -> bool {
        (addr as u64) + (size as u64) <= self.total_size as u64
    }

    pub fn checked_kind(is_write: bool, size: Size) -> AccessKind {
        Self::kind(size, is_write)
    }
}

impl crate::snapshot::Snapshot for RamRom {
    /// Writes every backed region's bytes in `regions` order, then the flag
    /// region (spec.md §4.J "ram_rom_bytes"/"debug_breakpoints"). Region
    /// identity and sizes are fixed by the variant being resumed into, so
    /// only the bytes themselves need to travel.
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for region in &self.regions {
            let data = region.raw();
            let data = data.borrow();
            out.write_all(&data)?;
        }
        self.flags.write_to(out)
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        for region in &self.regions {
            let data = region.raw();
            let mut data = data.borrow_mut();
            input.read_exact(&mut data)?;
        }
        self.flags.read_from(input)
    }
}

pub fn bad_access(kind: AccessKind, addr: u32) -> CoreError {
    CoreError::BadAccess { kind, addr }
}

pub type Result<T> = CoreResult<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_shares_backing_bytes() {
        let mut ramrom = RamRom::new(0x10000);
        let rom = BackedRegion::new("rom", 0x0, 0x1000, true);
        rom.load_bytes(0, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let mirror = rom.mirror("rom_mirror", 0x8000);
        ramrom.add_region(rom);
        ramrom.add_region(mirror);
        let v = ramrom.read(0x8000, Size::Word, |_| {});
        assert_eq!(v, 0xDEADBEEF);
    }

    #[test]
    fn last_word_of_region_succeeds_one_past_fails() {
        let mut ramrom = RamRom::new(0x1000);
        let sdram = BackedRegion::new("sdram", 0x1000_0000, 0x1000, false);
        ramrom.add_region(sdram);
        assert!(ramrom.find(0x1000_0FFC, 4).is_some());
        assert!(ramrom.find(0x1000_1000, 4).is_none());
    }

    #[test]
    fn read_only_write_is_dropped() {
        let mut ramrom = RamRom::new(0x1000);
        let rom = BackedRegion::new("rom", 0x0, 0x1000, true);
        ramrom.add_region(rom);
        ramrom.write(0x10, Size::Word, 0x1234, |_| {}, |_| {});
        assert_eq!(ramrom.read(0x10, Size::Word, |_| {}), 0);
    }
}
