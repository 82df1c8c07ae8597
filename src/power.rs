//! Power/Clock/PMU model (spec.md §4.F, GLOSSARY "PMU"). Grounded on
//! `original_source/core/misc/pmu.cpp` and the "derived register values"
//! requirement of spec.md §2 row F.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::info;

use crate::scheduler::{ClockDomain, Scheduler};

const NO_OVERRIDE: i32 = -1;

/// Hardware-configuration overrides the UI thread can poke in from outside
/// the CPU-engine thread (spec.md §5). Sentineled with `-1` meaning "no
/// override", matching `misc.c`'s own sentinel convention for these same
/// fields. Each cell is independently atomic so the UI can update one
/// reading (say, `vbus_mv` on cable plug/unplug) without coordinating with
/// the engine thread.
#[derive(Debug, Default)]
pub struct HwOverrides {
    usb_source: AtomicI32,
    battery_present: AtomicI32,
    dock_attached: AtomicI32,
    vbus_mv: AtomicI32,
    dock_rail_mv: AtomicI32,
    battery_mv: AtomicI32,
}

impl HwOverrides {
    pub fn new() -> Arc<HwOverrides> {
        Arc::new(HwOverrides {
            usb_source: AtomicI32::new(NO_OVERRIDE),
            battery_present: AtomicI32::new(NO_OVERRIDE),
            dock_attached: AtomicI32::new(NO_OVERRIDE),
            vbus_mv: AtomicI32::new(NO_OVERRIDE),
            dock_rail_mv: AtomicI32::new(NO_OVERRIDE),
            battery_mv: AtomicI32::new(NO_OVERRIDE),
        })
    }

    pub fn set_usb_source(&self, source: UsbSource) {
        self.usb_source.store(usb_source_code(source) as i32, Ordering::Relaxed);
    }
    pub fn clear_usb_source(&self) {
        self.usb_source.store(NO_OVERRIDE, Ordering::Relaxed);
    }
    pub fn set_battery_present(&self, present: bool) {
        self.battery_present.store(present as i32, Ordering::Relaxed);
    }
    pub fn set_dock_attached(&self, attached: bool) {
        self.dock_attached.store(attached as i32, Ordering::Relaxed);
    }
    pub fn set_vbus_mv(&self, mv: u32) {
        self.vbus_mv.store(mv as i32, Ordering::Relaxed);
    }
    pub fn set_dock_rail_mv(&self, mv: u32) {
        self.dock_rail_mv.store(mv as i32, Ordering::Relaxed);
    }
    pub fn set_battery_mv(&self, mv: u32) {
        self.battery_mv.store(mv as i32, Ordering::Relaxed);
    }

    /// Overlays every non-sentinel cell onto `inputs`, read by the engine
    /// thread on each status/derived-rails computation.
    fn apply(&self, inputs: &mut PowerInputs) {
        let usb = self.usb_source.load(Ordering::Relaxed);
        if usb != NO_OVERRIDE {
            inputs.usb_source = usb_source_from_code(usb as u8);
        }
        let battery_present = self.battery_present.load(Ordering::Relaxed);
        if battery_present != NO_OVERRIDE {
            inputs.battery_present = battery_present != 0;
        }
        let dock_attached = self.dock_attached.load(Ordering::Relaxed);
        if dock_attached != NO_OVERRIDE {
            inputs.dock_attached = dock_attached != 0;
        }
        let vbus_mv = self.vbus_mv.load(Ordering::Relaxed);
        if vbus_mv != NO_OVERRIDE {
            inputs.vbus_mv = vbus_mv as u32;
        }
        let dock_rail_mv = self.dock_rail_mv.load(Ordering::Relaxed);
        if dock_rail_mv != NO_OVERRIDE {
            inputs.dock_rail_mv = dock_rail_mv as u32;
        }
        let battery_mv = self.battery_mv.load(Ordering::Relaxed);
        if battery_mv != NO_OVERRIDE {
            inputs.battery_mv = battery_mv as u32;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSource {
    Disconnected,
    Computer,
    Charger,
    Otg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargerState {
    Disconnected,
    ConnectedIdle,
    Charging,
}

/// Raw inputs the UI thread can override (spec.md §5 "hardware-configuration
/// overrides"); the PMU recomputes everything derived from these on every
/// status read.
#[derive(Debug, Clone, Copy)]
pub struct PowerInputs {
    pub usb_source: UsbSource,
    pub battery_present: bool,
    pub dock_attached: bool,
    pub vbus_mv: u32,
    pub dock_rail_mv: u32,
    pub battery_mv: u32,
}

impl Default for PowerInputs {
    fn default() -> Self {
        PowerInputs {
            usb_source: UsbSource::Disconnected,
            battery_present: true,
            dock_attached: false,
            vbus_mv: 0,
            dock_rail_mv: 0,
            battery_mv: 3700,
        }
    }
}

/// Pure function of `{battery_mv, battery_present, usb_source, vbus_mv,
/// dock_attached, dock_rail_mv}` (spec.md §3 "Power model").
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivedRails {
    pub charger_state: ChargerState,
    pub vsys_mv: u32,
    pub adc_battery: u16,
    pub adc_vbus: u16,
    pub adc_dock: u16,
}

impl Default for ChargerState {
    fn default() -> Self {
        ChargerState::Disconnected
    }
}

fn mv_to_adc_code(mv: u32) -> u16 {
    // 10-bit ADC over a 0..3300 mV reference, matching the classic ADC scale.
    ((mv.min(3300) * 1023) / 3300) as u16
}

fn derive(inputs: &PowerInputs) -> DerivedRails {
    let charger_state = match inputs.usb_source {
        UsbSource::Disconnected if !inputs.dock_attached => ChargerState::Disconnected,
        UsbSource::Charger => ChargerState::Charging,
        _ if inputs.dock_attached && inputs.dock_rail_mv > 0 => ChargerState::ConnectedIdle,
        UsbSource::Computer | UsbSource::Otg => ChargerState::ConnectedIdle,
        _ => ChargerState::Disconnected,
    };
    let vsys_mv = match charger_state {
        ChargerState::Disconnected => inputs.battery_mv,
        _ => inputs.battery_mv.max(inputs.vbus_mv).max(4200),
    };
    DerivedRails {
        charger_state,
        vsys_mv,
        adc_battery: mv_to_adc_code(inputs.battery_mv),
        adc_vbus: mv_to_adc_code(inputs.vbus_mv),
        adc_dock: mv_to_adc_code(inputs.dock_rail_mv),
    }
}

/// Decoded PMU clock word: `{crystal * multiplier, or fixed override}` plus
/// CPU/AHB dividers; APB is derived as AHB/2 (spec.md §4.F).
#[derive(Debug, Clone, Copy)]
pub struct ClockWord {
    pub base_hz: u32,
    pub cpu_divider: u32,
    pub ahb_divider: u32,
}

impl ClockWord {
    /// Decodes the 32-bit register value the guest writes to the PMU
    /// "apply" register. Bit layout mirrors the source's `pmu_set_clocks`:
    /// bits [7:0] multiplier (or 0xFF for a fixed override listed in bits
    /// [23:8] in kHz), bits [11:8] CPU divider, bits [15:12] AHB divider.
    pub fn decode(word: u32, crystal_hz: u32) -> ClockWord {
        let multiplier = word & 0xFF;
        let base_hz = if multiplier == 0xFF {
            ((word >> 8) & 0xFFFF) * 1000
        } else {
            crystal_hz * multiplier.max(1)
        };
        let cpu_divider = ((word >> 8) & 0xF).max(1);
        let ahb_divider = ((word >> 12) & 0xF).max(1);
        ClockWord { base_hz, cpu_divider, ahb_divider }
    }

    pub fn cpu_hz(&self) -> u32 {
        self.base_hz / self.cpu_divider
    }
    pub fn ahb_hz(&self) -> u32 {
        self.cpu_hz() / self.ahb_divider
    }
    pub fn apb_hz(&self) -> u32 {
        self.ahb_hz() / 2
    }
}

const CRYSTAL_HZ: u32 = 27_000_000;

pub struct Pmu {
    pub inputs: PowerInputs,
    pub sleeping: bool,
    pub wake_cause: u32,
    clock_word: u32,
    status_sticky: u32,
    overrides: Arc<HwOverrides>,
}

impl Pmu {
    pub fn new() -> Self {
        Pmu {
            inputs: PowerInputs::default(),
            sleeping: false,
            wake_cause: 0,
            clock_word: 0,
            status_sticky: 0,
            overrides: HwOverrides::new(),
        }
    }

    /// Handle for the UI thread to set live hardware readings from outside
    /// the CPU-engine thread (spec.md §5); cloning the `Arc` is cheap and
    /// every clone observes the same cells.
    pub fn hw_overrides(&self) -> Arc<HwOverrides> {
        Arc::clone(&self.overrides)
    }

    pub fn derived_rails(&self) -> DerivedRails {
        let mut inputs = self.inputs;
        self.overrides.apply(&mut inputs);
        derive(&inputs)
    }

    /// Applies a new clock word, pushing the decoded rates into the
    /// scheduler (spec.md §4.F "Clock change protocol").
    pub fn apply_clock_word(&mut self, word: u32, scheduler: &mut Scheduler) {
        self.clock_word = word;
        let decoded = ClockWord::decode(word, CRYSTAL_HZ);
        let mut rates = [0u32; 6];
        rates[ClockDomain::Cpu as usize] = decoded.cpu_hz();
        rates[ClockDomain::Ahb as usize] = decoded.ahb_hz();
        rates[ClockDomain::Apb as usize] = decoded.apb_hz();
        rates[ClockDomain::Fixed27M as usize] = 27_000_000;
        rates[ClockDomain::Fixed12M as usize] = 12_000_000;
        rates[ClockDomain::Fixed32K as usize] = 32_768;
        info!("PMU clock change: cpu={} ahb={} apb={}", rates[0], rates[1], rates[2]);
        scheduler.set_clocks(rates);
    }

    pub fn clock_word(&self) -> u32 {
        self.clock_word
    }

    /// Writing the sleep bit: the CPU engine checks the returned flag to
    /// leave its execution loop (spec.md §4.F "Sleep").
    pub fn sleep(&mut self) {
        self.sleeping = true;
        self.status_sticky = 0;
    }

    pub fn wake(&mut self, cause: u32) {
        self.sleeping = false;
        self.wake_cause = cause;
    }

    /// Status word with derived bits folded in on top of firmware-owned
    /// sticky bits (spec.md §4.F "Derived rails").
    pub fn status_word(&self) -> u32 {
        let rails = self.derived_rails();
        let charger_bits = match rails.charger_state {
            ChargerState::Disconnected => 0,
            ChargerState::ConnectedIdle => 1,
            ChargerState::Charging => 2,
        };
        let mut inputs = self.inputs;
        self.overrides.apply(&mut inputs);
        (self.status_sticky & 0xFFFF_FFF0) | charger_bits | ((inputs.battery_present as u32) << 3)
    }

    pub fn set_sticky(&mut self, bits: u32) {
        self.status_sticky |= bits;
    }
    pub fn clear_sticky(&mut self, bits: u32) {
        self.status_sticky &= !bits;
    }
}

impl Default for Pmu {
    fn default() -> Self {
        Self::new()
    }
}

fn usb_source_code(s: UsbSource) -> u8 {
    match s {
        UsbSource::Disconnected => 0,
        UsbSource::Computer => 1,
        UsbSource::Charger => 2,
        UsbSource::Otg => 3,
    }
}

fn usb_source_from_code(code: u8) -> UsbSource {
    match code {
        1 => UsbSource::Computer,
        2 => UsbSource::Charger,
        3 => UsbSource::Otg,
        _ => UsbSource::Disconnected,
    }
}

impl crate::snapshot::Snapshot for Pmu {
    /// `inputs` is UI-thread-owned hardware configuration (spec.md §5
    /// "hardware-configuration overrides") rather than emulated state, but
    /// travels with the snapshot so a resumed session keeps its last
    /// observed battery/USB/dock readings until the front-end overrides
    /// them again.
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&[usb_source_code(self.inputs.usb_source), self.inputs.battery_present as u8, self.inputs.dock_attached as u8])?;
        out.write_all(&self.inputs.vbus_mv.to_le_bytes())?;
        out.write_all(&self.inputs.dock_rail_mv.to_le_bytes())?;
        out.write_all(&self.inputs.battery_mv.to_le_bytes())?;
        out.write_all(&[self.sleeping as u8])?;
        out.write_all(&self.wake_cause.to_le_bytes())?;
        out.write_all(&self.clock_word.to_le_bytes())?;
        out.write_all(&self.status_sticky.to_le_bytes())
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut tag = [0u8; 3];
        input.read_exact(&mut tag)?;
        self.inputs.usb_source = usb_source_from_code(tag[0]);
        self.inputs.battery_present = tag[1] != 0;
        self.inputs.dock_attached = tag[2] != 0;
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.inputs.vbus_mv = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.inputs.dock_rail_mv = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.inputs.battery_mv = u32::from_le_bytes(buf);
        let mut flag = [0u8; 1];
        input.read_exact(&mut flag)?;
        self.sleeping = flag[0] != 0;
        input.read_exact(&mut buf)?;
        self.wake_cause = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.clock_word = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.status_sticky = u32::from_le_bytes(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charger_disconnected_by_default() {
        let pmu = Pmu::new();
        assert_eq!(pmu.derived_rails().charger_state, ChargerState::Disconnected);
    }

    #[test]
    fn usb_charger_source_yields_charging_state() {
        let mut pmu = Pmu::new();
        pmu.inputs.usb_source = UsbSource::Charger;
        pmu.inputs.vbus_mv = 5000;
        assert_eq!(pmu.derived_rails().charger_state, ChargerState::Charging);
        assert!(pmu.derived_rails().vsys_mv >= 4200);
    }

    #[test]
    fn clock_word_decodes_multiplier_and_dividers() {
        let word = 0x1_21; // multiplier=0x21 (33), cpu_div=1, ahb_div=0(->1)
        let decoded = ClockWord::decode(word, CRYSTAL_HZ);
        assert_eq!(decoded.cpu_hz(), CRYSTAL_HZ * 0x21);
        assert_eq!(decoded.apb_hz(), decoded.ahb_hz() / 2);
    }

    #[test]
    fn sleep_then_wake_clears_flag() {
        let mut pmu = Pmu::new();
        pmu.sleep();
        assert!(pmu.sleeping);
        pmu.wake(1);
        assert!(!pmu.sleeping);
        assert_eq!(pmu.wake_cause, 1);
    }

    #[test]
    fn hw_override_wins_over_stored_inputs_without_mutating_them() {
        let mut pmu = Pmu::new();
        pmu.inputs.vbus_mv = 0;
        let overrides = pmu.hw_overrides();
        overrides.set_usb_source(UsbSource::Charger);
        overrides.set_vbus_mv(5000);
        assert_eq!(pmu.derived_rails().charger_state, ChargerState::Charging);
        assert_eq!(pmu.inputs.vbus_mv, 0);
    }

    #[test]
    fn snapshot_round_trips_inputs_and_clock_word() {
        use crate::snapshot::Snapshot;
        let mut scheduler = crate::scheduler::Scheduler::new();
        let mut pmu = Pmu::new();
        pmu.inputs.usb_source = UsbSource::Charger;
        pmu.inputs.vbus_mv = 5000;
        pmu.apply_clock_word(0x1_21, &mut scheduler);

        let mut buf = Vec::new();
        pmu.write_to(&mut buf).unwrap();
        let mut restored = Pmu::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.inputs.usb_source, UsbSource::Charger);
        assert_eq!(restored.inputs.vbus_mv, 5000);
        assert_eq!(restored.clock_word(), pmu.clock_word());
    }
}
