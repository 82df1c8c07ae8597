//! ADC model: classic direct-read, later-SoC periodic background sampling
//! (spec.md §4.G). Grounded on `original_source/core/misc/adc.cpp`.

use crate::power::Pmu;

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicChannel {
    pub unknown: u32,
    pub count: u32,
    pub address: u32,
    pub value: u32,
    pub speed: u32,
}

const NUM_CLASSIC_CHANNELS: usize = 7;
const KEYPAD_CHANNEL: usize = 3;

pub struct ClassicAdc {
    pub channels: [ClassicChannel; NUM_CLASSIC_CHANNELS],
    pub done_bits: u32,
    pub keypad_type: u32,
}

impl ClassicAdc {
    pub fn new() -> Self {
        ClassicAdc { channels: [ClassicChannel::default(); NUM_CLASSIC_CHANNELS], done_bits: 0, keypad_type: 0 }
    }

    /// Latches a synthesized sample into the addressed channel and sets its
    /// "done" bit (spec.md §4.G "Classic").
    pub fn read_channel(&mut self, n: usize, pmu: &Pmu) {
        if n >= NUM_CLASSIC_CHANNELS {
            return;
        }
        let sample = if n == KEYPAD_CHANNEL {
            self.keypad_type
        } else {
            pmu.derived_rails().adc_battery as u32
        };
        self.channels[n].value = sample;
        self.done_bits |= 1 << n;
    }

    pub fn ack_channel(&mut self, n: usize) {
        if n < NUM_CLASSIC_CHANNELS {
            self.done_bits &= !(1 << n);
        }
    }
}

impl Default for ClassicAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::snapshot::Snapshot for ClassicAdc {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for ch in &self.channels {
            out.write_all(&ch.unknown.to_le_bytes())?;
            out.write_all(&ch.count.to_le_bytes())?;
            out.write_all(&ch.address.to_le_bytes())?;
            out.write_all(&ch.value.to_le_bytes())?;
            out.write_all(&ch.speed.to_le_bytes())?;
        }
        out.write_all(&self.done_bits.to_le_bytes())?;
        out.write_all(&self.keypad_type.to_le_bytes())
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        for ch in self.channels.iter_mut() {
            input.read_exact(&mut buf)?;
            ch.unknown = u32::from_le_bytes(buf);
            input.read_exact(&mut buf)?;
            ch.count = u32::from_le_bytes(buf);
            input.read_exact(&mut buf)?;
            ch.address = u32::from_le_bytes(buf);
            input.read_exact(&mut buf)?;
            ch.value = u32::from_le_bytes(buf);
            input.read_exact(&mut buf)?;
            ch.speed = u32::from_le_bytes(buf);
        }
        input.read_exact(&mut buf)?;
        self.done_bits = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.keypad_type = u32::from_le_bytes(buf);
        Ok(())
    }
}

const NUM_LATER_CHANNELS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct LaterChannelControl {
    pub started: bool,
    pub completed: bool,
    pub value: u16,
}

/// Flat 4 KB register window: sample bank at 0x00..0x1C, per-channel
/// control blocks at 0x100..0x1DF in 32-byte strides (spec.md §4.G "Later
/// SoC").
pub struct LaterAdc {
    pub sample_bank: [u16; NUM_LATER_CHANNELS],
    pub channels: [LaterChannelControl; NUM_LATER_CHANNELS],
    pub periodic_enabled: bool,
    pub reload_counter: u32,
    pub reload_value: u32,
    pub pmu_pending: bool,
}

impl LaterAdc {
    pub fn new() -> Self {
        LaterAdc {
            sample_bank: [0; NUM_LATER_CHANNELS],
            channels: [LaterChannelControl::default(); NUM_LATER_CHANNELS],
            periodic_enabled: false,
            reload_counter: 0,
            reload_value: 0,
            pmu_pending: false,
        }
    }

    /// Refreshes the sample bank from the power model; called on every read
    /// of the bank or of related PMU registers.
    pub fn refresh_sample_bank(&mut self, pmu: &Pmu) {
        let rails = pmu.derived_rails();
        self.sample_bank[0] = rails.adc_battery;
        self.sample_bank[1] = rails.adc_vbus;
        self.sample_bank[2] = rails.adc_dock;
        for slot in self.sample_bank.iter_mut().skip(3) {
            *slot = rails.adc_battery;
        }
    }

    pub fn start_conversion(&mut self, channel: usize) {
        if channel < NUM_LATER_CHANNELS {
            self.channels[channel].started = true;
            self.channels[channel].completed = false;
        }
    }

    /// One background step: walks started channels, completes them, and
    /// raises the ADC-pending flag when any channel finished (spec.md
    /// §4.G "periodic background step").
    pub fn step(&mut self, pmu: &Pmu) -> bool {
        if !self.periodic_enabled {
            return false;
        }
        self.refresh_sample_bank(pmu);
        let mut any_completed = false;
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if ch.started && !ch.completed {
                ch.completed = true;
                ch.value = self.sample_bank[i % NUM_LATER_CHANNELS];
                any_completed = true;
            }
        }
        if any_completed {
            self.pmu_pending = true;
        }
        any_completed
    }
}

impl Default for LaterAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::snapshot::Snapshot for LaterAdc {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for s in self.sample_bank {
            out.write_all(&s.to_le_bytes())?;
        }
        for ch in &self.channels {
            out.write_all(&[ch.started as u8, ch.completed as u8])?;
            out.write_all(&ch.value.to_le_bytes())?;
        }
        out.write_all(&[self.periodic_enabled as u8, self.pmu_pending as u8])?;
        out.write_all(&self.reload_counter.to_le_bytes())?;
        out.write_all(&self.reload_value.to_le_bytes())
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf2 = [0u8; 2];
        for s in self.sample_bank.iter_mut() {
            input.read_exact(&mut buf2)?;
            *s = u16::from_le_bytes(buf2);
        }
        for ch in self.channels.iter_mut() {
            let mut flags = [0u8; 2];
            input.read_exact(&mut flags)?;
            ch.started = flags[0] != 0;
            ch.completed = flags[1] != 0;
            input.read_exact(&mut buf2)?;
            ch.value = u16::from_le_bytes(buf2);
        }
        let mut flags = [0u8; 2];
        input.read_exact(&mut flags)?;
        self.periodic_enabled = flags[0] != 0;
        self.pmu_pending = flags[1] != 0;
        let mut buf4 = [0u8; 4];
        input.read_exact(&mut buf4)?;
        self.reload_counter = u32::from_le_bytes(buf4);
        input.read_exact(&mut buf4)?;
        self.reload_value = u32::from_le_bytes(buf4);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_keypad_channel_returns_keypad_type() {
        let mut adc = ClassicAdc::new();
        adc.keypad_type = 0xC2;
        let pmu = Pmu::new();
        adc.read_channel(KEYPAD_CHANNEL, &pmu);
        assert_eq!(adc.channels[KEYPAD_CHANNEL].value, 0xC2);
        assert_eq!(adc.done_bits & (1 << KEYPAD_CHANNEL), 1 << KEYPAD_CHANNEL);
    }

    #[test]
    fn later_adc_step_completes_started_channels() {
        let mut adc = LaterAdc::new();
        adc.periodic_enabled = true;
        adc.start_conversion(0);
        let pmu = Pmu::new();
        assert!(adc.step(&pmu));
        assert!(adc.channels[0].completed);
        assert!(adc.pmu_pending);
    }

    #[test]
    fn later_adc_disabled_step_is_noop() {
        let mut adc = LaterAdc::new();
        adc.start_conversion(0);
        let pmu = Pmu::new();
        assert!(!adc.step(&pmu));
        assert!(!adc.channels[0].completed);
    }

    #[test]
    fn classic_adc_snapshot_round_trips_done_bits() {
        use crate::snapshot::Snapshot;
        let mut adc = ClassicAdc::new();
        adc.keypad_type = 7;
        adc.read_channel(KEYPAD_CHANNEL, &Pmu::new());
        let mut buf = Vec::new();
        adc.write_to(&mut buf).unwrap();
        let mut restored = ClassicAdc::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.done_bits, adc.done_bits);
        assert_eq!(restored.channels[KEYPAD_CHANNEL].value, 7);
    }

    #[test]
    fn later_adc_snapshot_round_trips_in_flight_conversion() {
        use crate::snapshot::Snapshot;
        let mut adc = LaterAdc::new();
        adc.periodic_enabled = true;
        adc.start_conversion(2);
        let mut buf = Vec::new();
        adc.write_to(&mut buf).unwrap();
        let mut restored = LaterAdc::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert!(restored.channels[2].started);
        assert!(!restored.channels[2].completed);
        assert!(restored.periodic_enabled);
    }
}
