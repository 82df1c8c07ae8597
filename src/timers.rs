//! Timer banks: classic paired 32 kHz timers, SP804-style prescaled timers
//! (spec.md §4.H). Grounded on `original_source/core/misc/t_io.cpp` and
//! `original_source/core/misc/sp804.cpp`.

/// Classic timer pair, driven from the 32 kHz domain. A scheduler event
/// advances the bank by 703/1/1 ticks per firing (spec.md §4.H "Classic").
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicTimer {
    pub start_value: u32,
    pub current_value: u32,
    pub divider: u32,
    pub control: u32,
}

pub const CLASSIC_TICK_ADVANCE: u32 = 703;

#[derive(Debug, Default)]
pub struct ClassicTimerBank {
    pub timer_a: ClassicTimer,
    pub timer_b: ClassicTimer,
    pub completion: [u32; 6],
    pub int_status: u32,
    pub int_mask: u32,
}

impl ClassicTimerBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances both timers by `ticks` (in the bank's own domain),
    /// decrementing toward zero and wrapping from `start_value`, raising
    /// `int_status` bits when a timer reaches a completion value.
    pub fn advance(&mut self, ticks: u32) {
        for (i, timer) in [&mut self.timer_a, &mut self.timer_b].into_iter().enumerate() {
            if timer.control & 1 == 0 {
                continue;
            }
            let mut remaining = ticks;
            while remaining > 0 {
                if timer.current_value == 0 {
                    timer.current_value = timer.start_value;
                }
                let step = remaining.min(timer.current_value.max(1));
                timer.current_value = timer.current_value.saturating_sub(step);
                remaining -= step;
                if timer.current_value == 0 {
                    self.int_status |= 1 << i;
                }
            }
        }
    }

    pub fn pending(&self) -> u32 {
        self.int_status & self.int_mask
    }

    pub fn acknowledge(&mut self, mask: u32) {
        self.int_status &= !mask;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prescale {
    Div1,
    Div16,
    Div256,
}

impl Prescale {
    fn from_bits(bits: u32) -> Prescale {
        match bits & 0b11 {
            0b00 => Prescale::Div1,
            0b01 => Prescale::Div16,
            _ => Prescale::Div256,
        }
    }
    pub fn divisor(&self) -> u32 {
        match self {
            Prescale::Div1 => 1,
            Prescale::Div16 => 16,
            Prescale::Div256 => 256,
        }
    }
}

pub mod control_bits {
    pub const ENABLE: u32 = 0x80;
    pub const PERIODIC: u32 = 0x40;
    pub const SIZE_32BIT: u32 = 0x02;
    pub const ONE_SHOT: u32 = 0x01;
    pub const INT_ENABLE: u32 = 0x20;
    pub const PRESCALE_SHIFT: u32 = 2;
    pub const PRESCALE_MASK: u32 = 0b11;
}

/// Per-timer SP804 state. `scheduled_remaining` and `ticks_since_schedule`
/// let reads compute a live countdown instead of a stale stored value
/// (spec.md §4.H "SP804-style", testable property "accurate mid-tick
/// read").
#[derive(Debug, Clone, Copy, Default)]
pub struct Sp804Timer {
    pub load: u32,
    pub control: u32,
    pub interrupt_pending: bool,
    scheduled_remaining: u32,
    ticks_since_schedule: u32,
    background_load_pending: Option<u32>,
}

impl Sp804Timer {
    fn prescale(&self) -> Prescale {
        Prescale::from_bits(self.control >> control_bits::PRESCALE_SHIFT)
    }

    fn enabled(&self) -> bool {
        self.control & control_bits::ENABLE != 0
    }

    fn size_mask(&self) -> u32 {
        if self.control & control_bits::SIZE_32BIT != 0 {
            u32::MAX
        } else {
            0xFFFF
        }
    }

    /// Live value: scheduled remaining minus elapsed prescaled ticks since
    /// the last reschedule.
    pub fn value(&self) -> u32 {
        if !self.enabled() {
            return self.scheduled_remaining;
        }
        let elapsed_units = self.ticks_since_schedule / self.prescale().divisor();
        self.scheduled_remaining.saturating_sub(elapsed_units) & self.size_mask()
    }

    /// A write of Load restarts immediately.
    pub fn write_load(&mut self, value: u32) {
        self.load = value;
        self.scheduled_remaining = value;
        self.ticks_since_schedule = 0;
        self.background_load_pending = None;
    }

    /// A write of Background-Load only updates the reload value; applied
    /// at the next reload boundary.
    pub fn write_background_load(&mut self, value: u32) {
        self.background_load_pending = Some(value);
    }

    pub fn write_control(&mut self, control: u32) {
        self.control = control;
    }

    /// Advances raw (unprescaled) ticks; fires interrupt and reloads on
    /// underflow.
    pub fn advance(&mut self, raw_ticks: u32) {
        if !self.enabled() {
            return;
        }
        self.ticks_since_schedule += raw_ticks;
        let divisor = self.prescale().divisor();
        while self.ticks_since_schedule >= self.scheduled_remaining.max(1) * divisor {
            self.ticks_since_schedule -= self.scheduled_remaining.max(1) * divisor;
            if self.control & control_bits::INT_ENABLE != 0 {
                self.interrupt_pending = true;
            }
            let reload = self.background_load_pending.take().unwrap_or(self.load);
            self.load = reload;
            if self.control & control_bits::PERIODIC != 0 {
                self.scheduled_remaining = reload;
            } else if self.control & control_bits::ONE_SHOT != 0 {
                self.scheduled_remaining = 0;
                self.control &= !control_bits::ENABLE;
                break;
            } else {
                self.scheduled_remaining = self.size_mask();
            }
        }
    }

    /// Ticks (in the timer's own, prescaled domain) remaining before the
    /// next underflow — used to size the scheduler's next deadline.
    pub fn ticks_to_next_event(&self) -> Option<u32> {
        if !self.enabled() {
            return None;
        }
        let divisor = self.prescale().divisor();
        let total_raw = self.scheduled_remaining.max(1) * divisor;
        Some(total_raw.saturating_sub(self.ticks_since_schedule))
    }

    pub fn acknowledge(&mut self) {
        self.interrupt_pending = false;
    }
}

#[derive(Debug, Default)]
pub struct Sp804Bank {
    pub timers: [Sp804Timer; 2],
}

impl Sp804Bank {
    pub fn new() -> Self {
        Self::default()
    }
}

impl crate::snapshot::Snapshot for ClassicTimerBank {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for timer in [&self.timer_a, &self.timer_b] {
            out.write_all(&timer.start_value.to_le_bytes())?;
            out.write_all(&timer.current_value.to_le_bytes())?;
            out.write_all(&timer.divider.to_le_bytes())?;
            out.write_all(&timer.control.to_le_bytes())?;
        }
        for c in self.completion {
            out.write_all(&c.to_le_bytes())?;
        }
        out.write_all(&self.int_status.to_le_bytes())?;
        out.write_all(&self.int_mask.to_le_bytes())
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        for timer in [&mut self.timer_a, &mut self.timer_b] {
            input.read_exact(&mut buf)?;
            timer.start_value = u32::from_le_bytes(buf);
            input.read_exact(&mut buf)?;
            timer.current_value = u32::from_le_bytes(buf);
            input.read_exact(&mut buf)?;
            timer.divider = u32::from_le_bytes(buf);
            input.read_exact(&mut buf)?;
            timer.control = u32::from_le_bytes(buf);
        }
        for c in self.completion.iter_mut() {
            input.read_exact(&mut buf)?;
            *c = u32::from_le_bytes(buf);
        }
        input.read_exact(&mut buf)?;
        self.int_status = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.int_mask = u32::from_le_bytes(buf);
        Ok(())
    }
}

impl crate::snapshot::Snapshot for Sp804Bank {
    /// Includes the private countdown bookkeeping (`scheduled_remaining`,
    /// `ticks_since_schedule`, `background_load_pending`) so a resumed
    /// timer's `value()` reads identically to the instant it was suspended.
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for t in &self.timers {
            out.write_all(&t.load.to_le_bytes())?;
            out.write_all(&t.control.to_le_bytes())?;
            out.write_all(&[t.interrupt_pending as u8])?;
            out.write_all(&t.scheduled_remaining.to_le_bytes())?;
            out.write_all(&t.ticks_since_schedule.to_le_bytes())?;
            out.write_all(&[t.background_load_pending.is_some() as u8])?;
            out.write_all(&t.background_load_pending.unwrap_or(0).to_le_bytes())?;
        }
        Ok(())
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf4 = [0u8; 4];
        let mut buf1 = [0u8; 1];
        for t in self.timers.iter_mut() {
            input.read_exact(&mut buf4)?;
            t.load = u32::from_le_bytes(buf4);
            input.read_exact(&mut buf4)?;
            t.control = u32::from_le_bytes(buf4);
            input.read_exact(&mut buf1)?;
            t.interrupt_pending = buf1[0] != 0;
            input.read_exact(&mut buf4)?;
            t.scheduled_remaining = u32::from_le_bytes(buf4);
            input.read_exact(&mut buf4)?;
            t.ticks_since_schedule = u32::from_le_bytes(buf4);
            input.read_exact(&mut buf1)?;
            let has_background = buf1[0] != 0;
            input.read_exact(&mut buf4)?;
            let background = u32::from_le_bytes(buf4);
            t.background_load_pending = if has_background { Some(background) } else { None };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_bank_advance_raises_completion() {
        let mut bank = ClassicTimerBank::new();
        bank.timer_a.control = 1;
        bank.timer_a.start_value = 10;
        bank.timer_a.current_value = 10;
        bank.int_mask = 0b11;
        bank.advance(CLASSIC_TICK_ADVANCE);
        assert_ne!(bank.int_status & 1, 0);
    }

    #[test]
    fn sp804_load_restarts_immediately() {
        let mut t = Sp804Timer::default();
        t.write_control(control_bits::ENABLE | control_bits::PERIODIC);
        t.write_load(100);
        assert_eq!(t.value(), 100);
        t.advance(50);
        assert_eq!(t.value(), 50);
        t.write_load(10);
        assert_eq!(t.value(), 10);
    }

    #[test]
    fn sp804_background_load_defers_to_reload_boundary() {
        let mut t = Sp804Timer::default();
        t.write_control(control_bits::ENABLE | control_bits::PERIODIC);
        t.write_load(10);
        t.write_background_load(5);
        assert_eq!(t.value(), 10);
        t.advance(10);
        assert_eq!(t.load, 5);
    }

    #[test]
    fn sp804_one_shot_disables_after_firing() {
        let mut t = Sp804Timer::default();
        t.write_control(control_bits::ENABLE | control_bits::ONE_SHOT | control_bits::INT_ENABLE);
        t.write_load(5);
        t.advance(5);
        assert!(t.interrupt_pending);
        assert_eq!(t.control & control_bits::ENABLE, 0);
    }

    #[test]
    fn sp804_mid_tick_read_reflects_elapsed_time() {
        let mut t = Sp804Timer::default();
        t.write_control(control_bits::ENABLE | control_bits::PERIODIC);
        t.write_load(1000);
        t.advance(300);
        assert_eq!(t.value(), 700);
    }

    #[test]
    fn sp804_bank_snapshot_round_trips_mid_countdown() {
        use crate::snapshot::Snapshot;
        let mut bank = Sp804Bank::new();
        bank.timers[0].write_control(control_bits::ENABLE | control_bits::PERIODIC);
        bank.timers[0].write_load(1000);
        bank.timers[0].advance(300);
        bank.timers[1].write_control(control_bits::ENABLE | control_bits::PERIODIC);
        bank.timers[1].write_load(5);
        bank.timers[1].write_background_load(42);

        let mut buf = Vec::new();
        bank.write_to(&mut buf).unwrap();
        let mut restored = Sp804Bank::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.timers[0].value(), bank.timers[0].value());
        restored.timers[1].advance(5);
        assert_eq!(restored.timers[1].load, 42);
    }

    #[test]
    fn classic_bank_snapshot_round_trips() {
        use crate::snapshot::Snapshot;
        let mut bank = ClassicTimerBank::new();
        bank.timer_a.control = 1;
        bank.timer_a.start_value = 10;
        bank.timer_a.current_value = 10;
        bank.int_mask = 0b11;
        bank.advance(CLASSIC_TICK_ADVANCE);

        let mut buf = Vec::new();
        bank.write_to(&mut buf).unwrap();
        let mut restored = ClassicTimerBank::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.int_status, bank.int_status);
        assert_eq!(restored.timer_a.current_value, bank.timer_a.current_value);
    }
}
