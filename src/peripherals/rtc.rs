//! RTC: value = real-time seconds minus a stored offset (spec.md §4.I
//! "RTC"). Grounded on `original_source/core/misc/rtc.cpp`.

#[derive(Debug, Default)]
pub struct Rtc {
    offset_seconds: i64,
    alarm: u32,
    alarm_enabled: bool,
}

impl Rtc {
    pub fn new() -> Self {
        Self::default()
    }

    /// `now` is the host wall-clock time in seconds, passed in rather than
    /// read from `std::time` so the core stays deterministic under replay
    /// (Design Notes: no wall-clock reads inside the core).
    pub fn read(&self, now_seconds: i64) -> u32 {
        (now_seconds - self.offset_seconds).max(0) as u32
    }

    /// Sets the RTC to `value` as observed at `now_seconds`.
    pub fn set(&mut self, value: u32, now_seconds: i64) {
        self.offset_seconds = now_seconds - value as i64;
    }

    pub fn set_alarm(&mut self, value: u32, enabled: bool) {
        self.alarm = value;
        self.alarm_enabled = enabled;
    }

    pub fn alarm_due(&self, now_seconds: i64) -> bool {
        self.alarm_enabled && self.read(now_seconds) >= self.alarm
    }
}

impl crate::snapshot::Snapshot for Rtc {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.offset_seconds.to_le_bytes())?;
        out.write_all(&self.alarm.to_le_bytes())?;
        out.write_all(&[self.alarm_enabled as u8])
    }

    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf8 = [0u8; 8];
        input.read_exact(&mut buf8)?;
        self.offset_seconds = i64::from_le_bytes(buf8);
        let mut buf4 = [0u8; 4];
        input.read_exact(&mut buf4)?;
        self.alarm = u32::from_le_bytes(buf4);
        let mut flag = [0u8; 1];
        input.read_exact(&mut flag)?;
        self.alarm_enabled = flag[0] != 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_read_round_trips() {
        let mut rtc = Rtc::new();
        rtc.set(1000, 5000);
        assert_eq!(rtc.read(5000), 1000);
        assert_eq!(rtc.read(5010), 1010);
    }

    #[test]
    fn alarm_fires_once_value_reached() {
        let mut rtc = Rtc::new();
        rtc.set(0, 0);
        rtc.set_alarm(100, true);
        assert!(!rtc.alarm_due(50));
        assert!(rtc.alarm_due(100));
    }

    #[test]
    fn snapshot_round_trips_offset_and_alarm() {
        use crate::snapshot::Snapshot;
        let mut rtc = Rtc::new();
        rtc.set(1000, 5000);
        rtc.set_alarm(2000, true);
        let mut buf = Vec::new();
        rtc.write_to(&mut buf).unwrap();
        let mut restored = Rtc::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.read(5000), 1000);
        assert!(restored.alarm_due(7000));
    }
}
