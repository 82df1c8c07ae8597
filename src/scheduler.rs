//! Multi-clock timed-event queue (spec.md §3 "Scheduler state", §4.A).
//!
//! Re-architected per Design Notes §9: the source keeps one array of
//! `{clock, seconds, tick, cputick, proc}` slots and dispatches through a
//! raw function pointer stored in `proc`. Here each slot is identified by a
//! `SlotId` tag; firing is done by the caller (`Soc::process_pending`)
//! through an exhaustive match, so a snapshot resume never needs to
//! re-bind a function pointer.

use log::trace;

/// One of the six named clock domains (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    Cpu = 0,
    Ahb = 1,
    Apb = 2,
    Fixed27M = 3,
    Fixed12M = 4,
    Fixed32K = 5,
}

pub const NUM_CLOCKS: usize = 6;

/// Every peripheral that needs a scheduler deadline. One variant per table
/// row in spec.md §3 "a fixed set of N timed slots".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    Watchdog,
    ClassicTimerA,
    ClassicTimerB,
    ClassicTimerC,
    Sp804Timer { bank: u8, half: u8 },
    FastAdc,
    Usb,
    UsbLinkPoll,
    RtcTick,
    SleepWakePoll,
}

/// Total number of distinct slots a `Scheduler` can hold. Sp804Timer has
/// `bank in 0..3, half in 0..2`, giving six concrete instances.
pub const NUM_SLOTS: usize = 9 /* named */ + 6 /* sp804 timers */;

fn slot_index(id: SlotId) -> usize {
    match id {
        SlotId::Watchdog => 0,
        SlotId::ClassicTimerA => 1,
        SlotId::ClassicTimerB => 2,
        SlotId::ClassicTimerC => 3,
        SlotId::FastAdc => 4,
        SlotId::Usb => 5,
        SlotId::UsbLinkPoll => 6,
        SlotId::RtcTick => 7,
        SlotId::SleepWakePoll => 8,
        SlotId::Sp804Timer { bank, half } => 9 + (bank as usize) * 2 + (half as usize),
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    id: SlotId,
    clock: ClockDomain,
    /// `>= 0` active, `< 0` idle (spec.md §3 invariant).
    seconds_remaining: i64,
    /// Sub-tick remainder in the slot's own clock domain.
    sub_tick: u32,
    /// `sub_tick * CPU_rate / clock_rate`, ceiling-rounded.
    cpu_tick_equivalent: u32,
}

impl Slot {
    fn idle(id: SlotId, clock: ClockDomain) -> Self {
        Slot { id, clock, seconds_remaining: -1, sub_tick: 0, cpu_tick_equivalent: 0 }
    }
    fn active(&self) -> bool {
        self.seconds_remaining >= 0
    }
}

fn muldiv_ceil(a: u64, b: u64, c: u64) -> u32 {
    if c == 0 {
        return 0;
    }
    (((a * b) + c - 1) / c) as u32
}

pub struct Scheduler {
    clock_rates: [u32; NUM_CLOCKS],
    slots: Vec<Slot>,
    next_index: Option<usize>,
    next_cpu_tick: u32,
    /// Index currently executing its handler; used to suppress recursive
    /// cancellation per spec.md §4.A.
    current_index: Option<usize>,
}

const ALL_SLOT_IDS: [(SlotId, ClockDomain); NUM_SLOTS] = [
    (SlotId::Watchdog, ClockDomain::Fixed32K),
    (SlotId::ClassicTimerA, ClockDomain::Fixed32K),
    (SlotId::ClassicTimerB, ClockDomain::Fixed32K),
    (SlotId::ClassicTimerC, ClockDomain::Fixed32K),
    (SlotId::FastAdc, ClockDomain::Apb),
    (SlotId::Usb, ClockDomain::Ahb),
    (SlotId::UsbLinkPoll, ClockDomain::Fixed32K),
    (SlotId::RtcTick, ClockDomain::Fixed32K),
    (SlotId::SleepWakePoll, ClockDomain::Fixed32K),
    (SlotId::Sp804Timer { bank: 0, half: 0 }, ClockDomain::Apb),
    (SlotId::Sp804Timer { bank: 0, half: 1 }, ClockDomain::Apb),
    (SlotId::Sp804Timer { bank: 1, half: 0 }, ClockDomain::Apb),
    (SlotId::Sp804Timer { bank: 1, half: 1 }, ClockDomain::Apb),
    (SlotId::Sp804Timer { bank: 2, half: 0 }, ClockDomain::Apb),
    (SlotId::Sp804Timer { bank: 2, half: 1 }, ClockDomain::Apb),
];

impl Scheduler {
    pub fn new() -> Self {
        let mut slots = vec![Slot::idle(SlotId::Watchdog, ClockDomain::Fixed32K); NUM_SLOTS];
        for &(id, clock) in ALL_SLOT_IDS.iter() {
            slots[slot_index(id)] = Slot::idle(id, clock);
        }
        Scheduler {
            clock_rates: [0, 0, 0, 27_000_000, 12_000_000, 32_768],
            slots,
            next_index: None,
            next_cpu_tick: 0,
            current_index: None,
        }
    }

    pub fn clock_rate(&self, domain: ClockDomain) -> u32 {
        self.clock_rates[domain as usize]
    }

    /// Rescales every active slot's remaining time using old-vs-new rate
    /// ratios, preserving real-time deadlines (spec.md §4.A `set_clocks`).
    pub fn set_clocks(&mut self, rates: [u32; NUM_CLOCKS]) {
        let old_rates = self.clock_rates;
        self.clock_rates = rates;
        for slot in self.slots.iter_mut() {
            if !slot.active() {
                continue;
            }
            let old_rate = old_rates[slot.clock as usize];
            let new_rate = rates[slot.clock as usize];
            if old_rate == 0 || new_rate == 0 {
                continue;
            }
            slot.sub_tick = ((slot.sub_tick as u64 * new_rate as u64) / old_rate as u64) as u32;
            slot.cpu_tick_equivalent =
                muldiv_ceil(slot.sub_tick as u64, self.clock_rates[ClockDomain::Cpu as usize] as u64, new_rate as u64);
        }
        self.recompute_next();
    }

    fn cpu_tick_for(&self, clock: ClockDomain, sub_tick: u32) -> u32 {
        muldiv_ceil(sub_tick as u64, self.clock_rates[ClockDomain::Cpu as usize] as u64, self.clock_rates[clock as usize] as u64)
    }

    /// Activates a slot with a deadline `ticks_in_own_domain` from now.
    pub fn event_set(&mut self, id: SlotId, ticks_in_own_domain: u32) {
        let idx = slot_index(id);
        let rate = self.clock_rates[self.slots[idx].clock as usize];
        let seconds = (ticks_in_own_domain / rate.max(1)) as i64;
        let sub_tick = ticks_in_own_domain % rate.max(1);
        let clock = self.slots[idx].clock;
        let cpu_tick_equivalent = self.cpu_tick_for(clock, sub_tick);
        let slot = &mut self.slots[idx];
        slot.seconds_remaining = seconds;
        slot.sub_tick = sub_tick;
        slot.cpu_tick_equivalent = cpu_tick_equivalent;
        self.recompute_next();
        trace!("sched: event_set {:?} -> {}s +{}sub", id, seconds, sub_tick);
    }

    /// Re-arms without losing sub-tick precision carried over from the
    /// prior activation (spec.md §4.A `event_repeat`).
    pub fn event_repeat(&mut self, id: SlotId, ticks: u32) {
        let idx = slot_index(id);
        let clock = self.slots[idx].clock;
        let rate = self.clock_rates[clock as usize].max(1);
        let prev_sub = self.slots[idx].sub_tick;
        let mut seconds = (ticks / rate) as i64;
        let mut sub_tick = ticks % rate;
        if prev_sub >= rate.saturating_sub(sub_tick) {
            seconds += 1;
            sub_tick = sub_tick.wrapping_sub(rate);
        }
        sub_tick = sub_tick.wrapping_add(prev_sub);
        let cpu_tick_equivalent = self.cpu_tick_for(clock, sub_tick);
        let slot = &mut self.slots[idx];
        slot.seconds_remaining = seconds;
        slot.sub_tick = sub_tick;
        slot.cpu_tick_equivalent = cpu_tick_equivalent;
        self.recompute_next();
    }

    /// Deactivates a slot. If invoked from inside that slot's own handler
    /// (i.e. `id` is the slot currently firing), only marks it idle —
    /// never recurses into `process_pending`.
    pub fn event_clear(&mut self, id: SlotId) {
        let idx = slot_index(id);
        self.slots[idx].seconds_remaining = -1;
        self.slots[idx].sub_tick = 0;
        self.slots[idx].cpu_tick_equivalent = 0;
        if self.current_index == Some(idx) {
            // Deferred: the running `process_pending` loop will notice this
            // slot is idle next time it recomputes the minimum.
            return;
        }
        self.recompute_next();
    }

    /// Remaining ticks for `id` in its own clock domain.
    pub fn event_ticks_remaining(&self, id: SlotId) -> u32 {
        let slot = &self.slots[slot_index(id)];
        if !slot.active() {
            return 0;
        }
        let rate = self.clock_rates[slot.clock as usize];
        (slot.seconds_remaining as u32).saturating_mul(rate) + slot.sub_tick
    }

    pub fn is_active(&self, id: SlotId) -> bool {
        self.slots[slot_index(id)].active()
    }

    fn recompute_next(&mut self) {
        self.next_cpu_tick = self.clock_rates[ClockDomain::Cpu as usize];
        self.next_index = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.active() && slot.seconds_remaining == 0 && slot.cpu_tick_equivalent < self.next_cpu_tick {
                self.next_cpu_tick = slot.cpu_tick_equivalent;
                self.next_index = Some(i);
            }
        }
    }

    /// The slot id reported as "next", if any slot with `seconds_remaining
    /// == 0` is active. Used by `Soc::process_pending`'s dispatch loop.
    pub fn next_slot(&self) -> Option<SlotId> {
        self.next_index.map(|i| self.slots[i].id)
    }

    pub fn next_cpu_tick(&self) -> u32 {
        self.next_cpu_tick
    }

    /// Drains all slots whose deadline (in CPU ticks) falls within
    /// `current_cpu_tick`, calling `on_fire` for each and returning the
    /// remaining `delta` once no more events are due. Matches the
    /// `process_pending` algorithm of spec.md §4.A.
    pub fn process_pending(&mut self, delta: u32, mut on_fire: impl FnMut(&mut Scheduler, SlotId)) -> u32 {
        let mut current_cpu_tick = self.next_cpu_tick.wrapping_add(delta);
        while current_cpu_tick >= self.next_cpu_tick {
            match self.next_index {
                None => {
                    // A one-second boundary elapsed.
                    for slot in self.slots.iter_mut() {
                        if slot.seconds_remaining >= 0 {
                            slot.seconds_remaining -= 1;
                        }
                    }
                    current_cpu_tick = current_cpu_tick.wrapping_sub(self.clock_rates[ClockDomain::Cpu as usize]);
                }
                Some(idx) => {
                    let id = self.slots[idx].id;
                    self.slots[idx].seconds_remaining = -1;
                    self.current_index = Some(idx);
                    on_fire(self, id);
                    self.current_index = None;
                }
            }
            self.recompute_next();
        }
        current_cpu_tick.wrapping_sub(self.next_cpu_tick)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::snapshot::Snapshot for Scheduler {
    /// Writes clock rates then each slot's `{seconds_remaining, sub_tick,
    /// cpu_tick_equivalent}` in `ALL_SLOT_IDS` order (spec.md §4.J). Slot
    /// identity is positional, not stored: `slot_index` is a pure function
    /// of `SlotId`, so reading back in the same fixed order recovers it.
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for rate in self.clock_rates {
            out.write_all(&rate.to_le_bytes())?;
        }
        for slot in &self.slots {
            out.write_all(&slot.seconds_remaining.to_le_bytes())?;
            out.write_all(&slot.sub_tick.to_le_bytes())?;
            out.write_all(&slot.cpu_tick_equivalent.to_le_bytes())?;
        }
        Ok(())
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut rates = [0u32; NUM_CLOCKS];
        for rate in rates.iter_mut() {
            let mut buf = [0u8; 4];
            input.read_exact(&mut buf)?;
            *rate = u32::from_le_bytes(buf);
        }
        self.clock_rates = rates;
        for slot in self.slots.iter_mut() {
            let mut secs = [0u8; 8];
            input.read_exact(&mut secs)?;
            slot.seconds_remaining = i64::from_le_bytes(secs);
            let mut sub = [0u8; 4];
            input.read_exact(&mut sub)?;
            slot.sub_tick = u32::from_le_bytes(sub);
            let mut cpu = [0u8; 4];
            input.read_exact(&mut cpu)?;
            slot.cpu_tick_equivalent = u32::from_le_bytes(cpu);
        }
        self.current_index = None;
        self.recompute_next();
        Ok(())
    }
}

#[cfg(test)]
mod snapshot_tests {
    use super::*;
    use crate::snapshot::Snapshot;

    #[test]
    fn round_trips_active_slot_deadlines() {
        let mut sched = Scheduler::new();
        sched.set_clocks([100_000_000, 50_000_000, 25_000_000, 27_000_000, 12_000_000, 32_768]);
        sched.event_set(SlotId::Watchdog, 10);
        sched.event_set(SlotId::RtcTick, 1);

        let mut buf = Vec::new();
        sched.write_to(&mut buf).unwrap();

        let mut restored = Scheduler::new();
        let mut cursor = std::io::Cursor::new(buf);
        restored.read_from(&mut cursor).unwrap();

        assert_eq!(restored.next_slot(), Some(SlotId::RtcTick));
        assert_eq!(restored.next_cpu_tick(), sched.next_cpu_tick());
        assert_eq!(restored.event_ticks_remaining(SlotId::Watchdog), sched.event_ticks_remaining(SlotId::Watchdog));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_slot_has_minimum_cpu_tick() {
        let mut sched = Scheduler::new();
        sched.set_clocks([100_000_000, 50_000_000, 25_000_000, 27_000_000, 12_000_000, 32_768]);
        sched.event_set(SlotId::Watchdog, 10);
        sched.event_set(SlotId::RtcTick, 1);
        assert_eq!(sched.next_slot(), Some(SlotId::RtcTick));
    }

    #[test]
    fn event_clear_from_own_handler_does_not_recurse() {
        let mut sched = Scheduler::new();
        sched.set_clocks([1000, 500, 250, 27_000_000, 12_000_000, 32_768]);
        sched.event_set(SlotId::Watchdog, 0);
        let mut fired = 0;
        sched.process_pending(0, |s, id| {
            fired += 1;
            assert_eq!(id, SlotId::Watchdog);
            s.event_clear(SlotId::Watchdog);
        });
        assert_eq!(fired, 1);
        assert!(!sched.is_active(SlotId::Watchdog));
    }

    #[test]
    fn zero_tick_event_fires_next_process_pending() {
        let mut sched = Scheduler::new();
        sched.set_clocks([1000, 500, 250, 27_000_000, 12_000_000, 32_768]);
        sched.event_set(SlotId::RtcTick, 0);
        let mut fired = false;
        sched.process_pending(0, |_, id| {
            if id == SlotId::RtcTick {
                fired = true;
            }
        });
        assert!(fired);
    }
}
