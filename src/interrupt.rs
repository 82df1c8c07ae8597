//! 32-line interrupt controller (spec.md §3 "Interrupt controller state",
//! §4.B). Two variants: `Classic` (priority-based, matches
//! `original_source/core/peripherals/interrupt.c`'s `int_*` family) and
//! `Vectored` (the CX-II's 16-vector table, `int_cx_*`).

use log::trace;

pub const NUM_LINES: usize = 32;

/// Known IRQ role mappings (`original_source/core/peripherals/interrupt.h`).
pub mod line {
    pub const SERIAL_UART: u32 = 1;
    pub const DMA_CONTROLLER: u32 = 2;
    pub const WATCHDOG_TIMER: u32 = 3;
    pub const RTC: u32 = 4;
    pub const GPIO: u32 = 7;
    pub const USB_OTG: u32 = 8;
    pub const USB_HOST: u32 = 9;
    pub const ADC: u32 = 11;
    pub const SD_HOST_CONTROLLER: u32 = 13;
    pub const HDQ_1WIRE: u32 = 14;
    pub const POWER_MANAGEMENT: u32 = 15;
    pub const KEYPAD: u32 = 16;
    pub const FAST_TIMER: u32 = 17;
    pub const FIRST_TIMER: u32 = 18;
    pub const SECOND_TIMER: u32 = 19;
    pub const I2C: u32 = 20;
    pub const LCD_CONTROLLER: u32 = 21;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Irq = 0,
    Fiq = 1,
}

/// A single vectored-interrupt table entry (CX-II only).
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorEntry {
    pub address: u32,
    pub control: u8,
}

impl VectorEntry {
    fn enabled(&self) -> bool {
        self.control & 0x20 != 0
    }
    fn source(&self) -> u32 {
        (self.control & 0x1F) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Classic PL190-style priority controller.
    Classic,
    /// CX-II vectored controller with a default handler fallback.
    Vectored,
}

#[derive(Debug, Clone)]
pub struct InterruptController {
    pub variant: Variant,
    active: u32,
    raw_status: u32,
    sticky_status: u32,
    sticky: u32,
    noninverted: u32,
    status: u32,
    mask: [u32; 2],
    priority: [u8; NUM_LINES],
    priority_limit: [u8; 2],
    prev_pri_limit: [u8; 2],
    // Vectored-variant-only state.
    vectors: [VectorEntry; 16],
    default_handler: u32,
    current_vector: u32,
    cpu_irq: bool,
    cpu_fiq: bool,
    trace_irq: bool,
}

impl InterruptController {
    pub fn new(variant: Variant) -> Self {
        InterruptController {
            variant,
            active: 0,
            raw_status: 0,
            sticky_status: 0,
            sticky: 0,
            noninverted: 0xFFFF_FFFF,
            status: 0,
            mask: [0, 0],
            priority: [0; NUM_LINES],
            priority_limit: [8, 8],
            prev_pri_limit: [0, 0],
            vectors: [VectorEntry::default(); 16],
            default_handler: 0,
            current_vector: 0,
            cpu_irq: false,
            cpu_fiq: false,
            trace_irq: false,
        }
    }

    pub fn set_trace(&mut self, on: bool) {
        self.trace_irq = on;
    }

    pub fn cpu_irq(&self) -> bool {
        self.cpu_irq
    }
    pub fn cpu_fiq(&self) -> bool {
        self.cpu_fiq
    }

    /// Refreshes `raw_status`/`sticky_status`/`status` and the CPU input
    /// lines. Called after any write that changes `active`, `mask`,
    /// `priority_limit`, `noninverted`, or `sticky` (spec.md §3 invariant).
    fn refresh(&mut self) {
        let prev_raw = self.raw_status;
        self.raw_status = self.active ^ !self.noninverted;
        self.sticky_status |= self.raw_status & !prev_raw;
        self.status = (self.raw_status & !self.sticky) | (self.sticky_status & self.sticky);

        match self.variant {
            Variant::Classic => {
                self.cpu_irq = self.current_line(Bank::Irq).is_some();
                self.cpu_fiq = self.current_line(Bank::Fiq).is_some();
            }
            Variant::Vectored => {
                let pending_irq = self.active & self.mask[0] & !self.mask[1];
                self.current_vector = self.default_handler;
                for v in self.vectors.iter() {
                    if v.enabled() && pending_irq & (1 << v.source()) != 0 {
                        self.current_vector = v.address;
                        break;
                    }
                }
                self.cpu_irq = pending_irq != 0;
                self.cpu_fiq = self.active & self.mask[0] & self.mask[1] != 0;
            }
        }
    }

    fn masked_pending(&self, bank: Bank) -> u32 {
        self.status & self.mask[bank as usize]
    }

    /// Highest-priority pending line, tie-broken by lowest index.
    fn current_line(&self, bank: Bank) -> Option<u32> {
        let masked = self.masked_pending(bank);
        let limit = self.priority_limit[bank as usize];
        let mut best: Option<(u32, u8)> = None;
        for i in 0..NUM_LINES as u32 {
            if masked & (1 << i) != 0 && self.priority[i as usize] < limit {
                match best {
                    Some((_, pri)) if pri <= self.priority[i as usize] => {}
                    _ => best = Some((i, self.priority[i as usize])),
                }
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn irq_pending_masked(&self, bank: Bank) -> u32 {
        self.masked_pending(bank)
    }

    pub fn current(&self, bank: Bank) -> Option<u32> {
        self.current_line(bank)
    }

    /// Reads "acknowledge": returns the highest-priority pending line and
    /// saves the previous priority limit.
    pub fn acknowledge(&mut self, bank: Bank) -> Option<u32> {
        let cur = self.current_line(bank);
        if let Some(i) = cur {
            self.prev_pri_limit[bank as usize] = self.priority_limit[bank as usize];
            self.priority_limit[bank as usize] = self.priority[i as usize];
        }
        cur
    }

    /// Reads "release": deasserts the CPU input if no current line exists,
    /// and always returns the saved previous priority limit.
    pub fn release(&mut self, bank: Bank) -> u8 {
        if self.current_line(bank).is_none() {
            match bank {
                Bank::Irq => self.cpu_irq = false,
                Bank::Fiq => self.cpu_fiq = false,
            }
        }
        self.prev_pri_limit[bank as usize]
    }

    pub fn set_mask_or(&mut self, bank: Bank, value: u32) {
        self.mask[bank as usize] |= value;
        self.refresh();
    }
    pub fn set_mask_and_not(&mut self, bank: Bank, value: u32) {
        self.mask[bank as usize] &= !value;
        self.refresh();
    }
    pub fn set_priority_limit(&mut self, bank: Bank, value: u8) {
        self.priority_limit[bank as usize] = value & 0x0F;
        self.refresh();
    }
    pub fn set_noninverted(&mut self, value: u32) {
        self.noninverted = value;
        self.refresh();
    }
    pub fn set_sticky(&mut self, value: u32) {
        self.sticky = value;
        self.refresh();
    }
    pub fn clear_sticky_status(&mut self, value: u32) {
        self.sticky_status &= !value;
        self.refresh();
    }
    pub fn set_priority(&mut self, line: usize, value: u8) {
        if line < NUM_LINES {
            self.priority[line] = value & 7;
        }
    }

    pub fn set_vector(&mut self, entry: usize, addr: u32, ctrl: u8) {
        if entry < self.vectors.len() {
            self.vectors[entry].address = addr;
            self.vectors[entry].control = ctrl;
            self.refresh();
        }
    }
    pub fn set_default_handler(&mut self, addr: u32) {
        self.default_handler = addr;
    }
    pub fn current_vector(&self) -> u32 {
        self.current_vector
    }
    pub fn default_handler(&self) -> u32 {
        self.default_handler
    }

    /// Flips a line's `active` bit and refreshes all derived fields and
    /// the CPU input (spec.md §4.B "Update discipline").
    pub fn int_set(&mut self, line: u32, on: bool) {
        if line >= NUM_LINES as u32 {
            return;
        }
        let was_on = self.active & (1 << line) != 0;
        if on {
            self.active |= 1 << line;
        } else {
            self.active &= !(1 << line);
        }
        if was_on != on && self.trace_irq {
            trace!("[irq] line={} state={} active={:#010x}", line, on as u8, self.active);
        }
        self.refresh();
    }

    pub fn status(&self) -> u32 {
        self.status
    }
    pub fn raw_status(&self) -> u32 {
        self.raw_status
    }
    pub fn active(&self) -> u32 {
        self.active
    }
}

impl crate::snapshot::Snapshot for InterruptController {
    /// `variant` and `trace_irq` are not part of the blob: `variant` is
    /// fixed by the SoC variant being resumed into, and `trace_irq` is an
    /// env-derived config flag re-read at startup (Design Notes §9).
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for word in [self.active, self.raw_status, self.sticky_status, self.sticky, self.noninverted, self.status] {
            out.write_all(&word.to_le_bytes())?;
        }
        for word in self.mask {
            out.write_all(&word.to_le_bytes())?;
        }
        out.write_all(&self.priority)?;
        out.write_all(&self.priority_limit)?;
        out.write_all(&self.prev_pri_limit)?;
        for v in &self.vectors {
            out.write_all(&v.address.to_le_bytes())?;
            out.write_all(&[v.control])?;
        }
        out.write_all(&self.default_handler.to_le_bytes())?;
        out.write_all(&self.current_vector.to_le_bytes())?;
        out.write_all(&[self.cpu_irq as u8, self.cpu_fiq as u8])
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut word = [0u8; 4];
        macro_rules! read_word {
            () => {{
                input.read_exact(&mut word)?;
                u32::from_le_bytes(word)
            }};
        }
        self.active = read_word!();
        self.raw_status = read_word!();
        self.sticky_status = read_word!();
        self.sticky = read_word!();
        self.noninverted = read_word!();
        self.status = read_word!();
        for m in self.mask.iter_mut() {
            *m = read_word!();
        }
        input.read_exact(&mut self.priority)?;
        input.read_exact(&mut self.priority_limit)?;
        input.read_exact(&mut self.prev_pri_limit)?;
        for v in self.vectors.iter_mut() {
            v.address = read_word!();
            let mut ctrl = [0u8; 1];
            input.read_exact(&mut ctrl)?;
            v.control = ctrl[0];
        }
        self.default_handler = read_word!();
        self.current_vector = read_word!();
        let mut flags = [0u8; 2];
        input.read_exact(&mut flags)?;
        self.cpu_irq = flags[0] != 0;
        self.cpu_fiq = flags[1] != 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_formula_holds_after_transitions() {
        let mut ic = InterruptController::new(Variant::Classic);
        ic.set_sticky(1 << line::RTC);
        ic.int_set(line::RTC, true);
        ic.int_set(line::RTC, false);
        let expected = (ic.raw_status() & !ic.sticky) | (ic.sticky_status & ic.sticky);
        assert_eq!(ic.status(), expected);
        assert_ne!(ic.status() & (1 << line::RTC), 0, "sticky line should latch");
    }

    #[test]
    fn irq_input_matches_masked_pending_minus_fiq() {
        let mut ic = InterruptController::new(Variant::Classic);
        ic.set_mask_or(Bank::Irq, 1 << line::KEYPAD);
        ic.int_set(line::KEYPAD, true);
        assert!(ic.cpu_irq());
        let expect = (ic.active() & 0 | (1 << line::KEYPAD)) != 0;
        assert_eq!(ic.cpu_irq(), expect);
    }

    #[test]
    fn acknowledge_then_release_restores_limit() {
        let mut ic = InterruptController::new(Variant::Classic);
        ic.set_mask_or(Bank::Irq, 1 << line::ADC);
        ic.set_priority(line::ADC as usize, 2);
        ic.int_set(line::ADC, true);
        let acked = ic.acknowledge(Bank::Irq);
        assert_eq!(acked, Some(line::ADC));
        assert_eq!(ic.priority_limit[Bank::Irq as usize], 2);
        let prev = ic.release(Bank::Irq);
        assert_eq!(prev, 8);
    }

    #[test]
    fn vectored_variant_picks_enabled_vector() {
        let mut ic = InterruptController::new(Variant::Vectored);
        ic.set_default_handler(0xDEAD_0000);
        ic.set_vector(0, 0x1234, 0x20 | line::KEYPAD as u8);
        ic.set_mask_or(Bank::Irq, 1 << line::KEYPAD);
        ic.int_set(line::KEYPAD, true);
        assert_eq!(ic.current_vector(), 0x1234);
        ic.int_set(line::KEYPAD, false);
        assert_eq!(ic.current_vector(), 0xDEAD_0000);
    }

    #[test]
    fn snapshot_round_trip_preserves_pending_state() {
        use crate::snapshot::Snapshot;
        let mut ic = InterruptController::new(Variant::Classic);
        ic.set_mask_or(Bank::Irq, 1 << line::ADC);
        ic.set_sticky(1 << line::ADC);
        ic.int_set(line::ADC, true);

        let mut buf = Vec::new();
        ic.write_to(&mut buf).unwrap();

        let mut restored = InterruptController::new(Variant::Classic);
        let mut cursor = std::io::Cursor::new(buf);
        restored.read_from(&mut cursor).unwrap();

        assert_eq!(restored.status(), ic.status());
        assert_eq!(restored.cpu_irq(), ic.cpu_irq());
        assert_eq!(restored.active(), ic.active());
    }
}
