//! Per-word flag region running parallel to backed memory (spec.md §3
//! "Backed regions" / §4.D). Design Notes §9: "represent the flag word as a
//! small packed structure with named bit accessors; avoid interleaving
//! flags with data".

use std::io::{self, Read, Write};

use bitflags::bitflags;

bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
    pub struct WordFlags: u32 {
        const BREAK_EXEC       = 1 << 0;
        const BREAK_READ       = 1 << 1;
        const BREAK_WRITE      = 1 << 2;
        const BREAK_STEP       = 1 << 3;
        const READ_ONLY        = 1 << 4;
        const CODE_TRANSLATED  = 1 << 5;
        const CODE_EXECUTED    = 1 << 6;
    }
}

/// One flag word per aligned 32-bit machine word of the backed address
/// space, zeroed on reset.
#[derive(Debug, Clone)]
pub struct FlagRegion {
    words: Vec<WordFlags>,
}

impl FlagRegion {
    pub fn new(size_bytes: usize) -> Self {
        FlagRegion { words: vec![WordFlags::empty(); (size_bytes + 3) / 4] }
    }

    fn index(addr: u32) -> usize {
        (addr as usize) / 4
    }

    pub fn get(&self, addr: u32) -> WordFlags {
        self.words.get(Self::index(addr)).copied().unwrap_or_default()
    }

    pub fn set(&mut self, addr: u32, flags: WordFlags) {
        if let Some(slot) = self.words.get_mut(Self::index(addr)) {
            *slot = flags;
        }
    }

    pub fn modify(&mut self, addr: u32, f: impl FnOnce(&mut WordFlags)) {
        if let Some(slot) = self.words.get_mut(Self::index(addr)) {
            f(slot);
        }
    }

    pub fn reset(&mut self) {
        for w in self.words.iter_mut() {
            *w = WordFlags::empty();
        }
    }

    /// Persists breakpoint/translation bits for the "debug_breakpoints"
    /// snapshot component (spec.md §4.J).
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for w in &self.words {
            out.write_all(&w.bits().to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(&mut self, input: &mut dyn Read) -> io::Result<()> {
        for w in self.words.iter_mut() {
            let mut buf = [0u8; 4];
            input.read_exact(&mut buf)?;
            *w = WordFlags::from_bits_truncate(u32::from_le_bytes(buf));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_toggle_round_trips() {
        let mut flags = FlagRegion::new(16);
        flags.modify(4, |f| f.insert(WordFlags::BREAK_WRITE));
        assert!(flags.get(4).contains(WordFlags::BREAK_WRITE));
        flags.modify(4, |f| f.remove(WordFlags::BREAK_WRITE));
        assert_eq!(flags.get(4), WordFlags::empty());
    }
}
