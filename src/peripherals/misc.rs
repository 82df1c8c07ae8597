//! Register-level grab-bag: SDIO, SPI, LED, serial, fastboot RAM, LCD
//! registers, LCD-backlight PWM (spec.md §4.I). Grounded on
//! `original_source/core/misc/{serial,sdio,spi,led,lcd}.cpp`.

use std::collections::VecDeque;

/// Fastboot RAM: a small region that survives a soft reset, and is zeroed
/// on a hard reset (spec.md testable scenario #2).
#[derive(Debug)]
pub struct FastbootRam {
    data: Vec<u8>,
}

impl FastbootRam {
    pub fn new(size: usize) -> Self {
        FastbootRam { data: vec![0u8; size] }
    }

    pub fn read_word(&self, offset: usize) -> u32 {
        if offset + 4 > self.data.len() {
            return 0;
        }
        u32::from_le_bytes([self.data[offset], self.data[offset + 1], self.data[offset + 2], self.data[offset + 3]])
    }

    pub fn write_word(&mut self, offset: usize, value: u32) {
        if offset + 4 > self.data.len() {
            return;
        }
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn hard_reset(&mut self) {
        self.data.fill(0);
    }
}

impl crate::snapshot::Snapshot for FastbootRam {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.data)
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        input.read_exact(&mut self.data)
    }
}

/// Serial UART: a byte queue in each direction, consumed through the
/// front-end's `putchar`/`getchar` hooks (spec.md §6).
#[derive(Debug, Default)]
pub struct Serial {
    pub rx: VecDeque<u8>,
    pub tx: VecDeque<u8>,
}

impl Serial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rx(&mut self, byte: u8) {
        self.rx.push_back(byte);
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.tx.push_back(byte);
    }

    pub fn drain_tx(&mut self) -> Vec<u8> {
        self.tx.drain(..).collect()
    }
}

fn write_byte_fifo(out: &mut dyn std::io::Write, fifo: &VecDeque<u8>) -> std::io::Result<()> {
    out.write_all(&(fifo.len() as u32).to_le_bytes())?;
    for b in fifo {
        out.write_all(&[*b])?;
    }
    Ok(())
}

fn read_byte_fifo(input: &mut dyn std::io::Read) -> std::io::Result<VecDeque<u8>> {
    let mut len_buf = [0u8; 4];
    input.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    Ok(bytes.into())
}

impl crate::snapshot::Snapshot for Serial {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        write_byte_fifo(out, &self.rx)?;
        write_byte_fifo(out, &self.tx)
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        self.rx = read_byte_fifo(input)?;
        self.tx = read_byte_fifo(input)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Led {
    pub state: u32,
}

impl crate::snapshot::Snapshot for Led {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.state.to_le_bytes())
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.state = u32::from_le_bytes(buf);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Spi {
    pub control: u32,
    pub tx_fifo: VecDeque<u8>,
    pub rx_fifo: VecDeque<u8>,
}

impl Spi {
    pub fn transfer(&mut self, byte: u8) -> u8 {
        self.tx_fifo.push_back(byte);
        self.rx_fifo.pop_front().unwrap_or(0xFF)
    }
}

impl crate::snapshot::Snapshot for Spi {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.control.to_le_bytes())?;
        write_byte_fifo(out, &self.tx_fifo)?;
        write_byte_fifo(out, &self.rx_fifo)
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.control = u32::from_le_bytes(buf);
        self.tx_fifo = read_byte_fifo(input)?;
        self.rx_fifo = read_byte_fifo(input)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Sdio {
    pub command: u32,
    pub argument: u32,
    pub response: [u32; 4],
    pub card_present: bool,
}

impl crate::snapshot::Snapshot for Sdio {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.command.to_le_bytes())?;
        out.write_all(&self.argument.to_le_bytes())?;
        for r in self.response {
            out.write_all(&r.to_le_bytes())?;
        }
        out.write_all(&[self.card_present as u8])
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.command = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.argument = u32::from_le_bytes(buf);
        for r in self.response.iter_mut() {
            input.read_exact(&mut buf)?;
            *r = u32::from_le_bytes(buf);
        }
        let mut flag = [0u8; 1];
        input.read_exact(&mut flag)?;
        self.card_present = flag[0] != 0;
        Ok(())
    }
}

/// LCD register window. Pixel data itself is an external collaborator
/// (spec.md §1); only control registers live here.
#[derive(Debug, Default)]
pub struct LcdRegs {
    pub control: u32,
    pub timing: [u32; 4],
    pub contrast: u32,
}

/// Backlight PWM mirrors its duty cycle to `lcd.contrast` unless a GUI
/// override is active (spec.md §4.I).
#[derive(Debug, Default)]
pub struct BacklightPwm {
    pub duty_cycle: u32,
    pub gui_override: Option<u32>,
}

impl BacklightPwm {
    pub fn apply(&self, lcd: &mut LcdRegs) {
        lcd.contrast = self.gui_override.unwrap_or(self.duty_cycle);
    }
}

impl crate::snapshot::Snapshot for LcdRegs {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.control.to_le_bytes())?;
        for t in self.timing {
            out.write_all(&t.to_le_bytes())?;
        }
        out.write_all(&self.contrast.to_le_bytes())
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.control = u32::from_le_bytes(buf);
        for t in self.timing.iter_mut() {
            input.read_exact(&mut buf)?;
            *t = u32::from_le_bytes(buf);
        }
        input.read_exact(&mut buf)?;
        self.contrast = u32::from_le_bytes(buf);
        Ok(())
    }
}

/// `gui_override` is a UI-thread override (spec.md §5) that does not
/// survive a snapshot — only `duty_cycle`, the firmware-owned register
/// value, is persisted; a resumed session starts with the override cleared.
impl crate::snapshot::Snapshot for BacklightPwm {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.duty_cycle.to_le_bytes())
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.duty_cycle = u32::from_le_bytes(buf);
        self.gui_override = None;
        Ok(())
    }
}

/// Keypad matrix scan controller. The real hardware wires the keypad as a
/// row/column GPIO matrix rather than a bespoke block (spec.md §4.I groups
/// "keypad I/O" next to GPIO); modeled the same way as `Gpio` but kept
/// separate because it lives in its own APB window and column-select
/// register rather than sharing `Gpio`'s eight sections.
#[derive(Debug, Default)]
pub struct Keypad {
    pub column_select: u32,
    /// One row-bit mask per column, set by the front-end on key press/release.
    pub rows: [u8; 11],
}

impl Keypad {
    pub fn set_key(&mut self, column: usize, row: usize, pressed: bool) {
        if let Some(bits) = self.rows.get_mut(column) {
            if pressed {
                *bits |= 1 << row;
            } else {
                *bits &= !(1 << row);
            }
        }
    }

    pub fn read(&self, addr: u32) -> u32 {
        match addr & 0xFF {
            0x00 => self.column_select,
            0x04 => self.rows.get(self.column_select as usize).copied().unwrap_or(0) as u32,
            _ => 0,
        }
    }

    pub fn write(&mut self, addr: u32, value: u32) {
        if addr & 0xFF == 0x00 {
            self.column_select = value & 0xF;
        }
    }
}

impl crate::snapshot::Snapshot for Keypad {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.column_select.to_le_bytes())?;
        out.write_all(&self.rows)
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.column_select = u32::from_le_bytes(buf);
        input.read_exact(&mut self.rows)
    }
}

/// Crypto accelerator register block. Kept as a minimal, undocumented
/// corner (spec.md §1 Non-goals: "fidelity of undocumented peripheral
/// corners beyond what guest firmware exercises") — no original_source
/// file documents its algorithm, so guest writes are accepted and the
/// unsupported "start" path is logged rather than silently wrong.
#[derive(Debug, Default)]
pub struct Crypto {
    pub control: u32,
    pub status: u32,
    pub key: [u32; 8],
    pub data: [u32; 4],
}

impl Crypto {
    pub fn read(&self, addr: u32) -> u32 {
        match addr & 0xFF {
            0x00 => self.control,
            0x04 => self.status,
            0x40..=0x5F => self.key[((addr & 0xFF) as usize - 0x40) / 4],
            0x60..=0x6F => self.data[((addr & 0xFF) as usize - 0x60) / 4],
            _ => 0,
        }
    }

    pub fn write(&mut self, addr: u32, value: u32) {
        match addr & 0xFF {
            0x00 => {
                self.control = value;
                if value & 1 != 0 {
                    log::warn!("crypto: unsupported operation requested, control={:#x}", value);
                    self.control &= !1;
                    self.status |= 1; // done, result undefined
                }
            }
            0x40..=0x5F => self.key[((addr & 0xFF) as usize - 0x40) / 4] = value,
            0x60..=0x6F => self.data[((addr & 0xFF) as usize - 0x60) / 4] = value,
            _ => {}
        }
    }
}

impl crate::snapshot::Snapshot for Crypto {
    fn write_to(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        out.write_all(&self.control.to_le_bytes())?;
        out.write_all(&self.status.to_le_bytes())?;
        for k in self.key {
            out.write_all(&k.to_le_bytes())?;
        }
        for d in self.data {
            out.write_all(&d.to_le_bytes())?;
        }
        Ok(())
    }
    fn read_from(&mut self, input: &mut dyn std::io::Read) -> std::io::Result<()> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        self.control = u32::from_le_bytes(buf);
        input.read_exact(&mut buf)?;
        self.status = u32::from_le_bytes(buf);
        for k in self.key.iter_mut() {
            input.read_exact(&mut buf)?;
            *k = u32::from_le_bytes(buf);
        }
        for d in self.data.iter_mut() {
            input.read_exact(&mut buf)?;
            *d = u32::from_le_bytes(buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastboot_ram_survives_soft_reset_but_not_hard() {
        let mut ram = FastbootRam::new(0x10000);
        ram.write_word(0, 0xDEAD_BEEF);
        assert_eq!(ram.read_word(0), 0xDEAD_BEEF);
        ram.hard_reset();
        assert_eq!(ram.read_word(0), 0);
    }

    #[test]
    fn backlight_override_takes_precedence() {
        let mut lcd = LcdRegs::default();
        let mut pwm = BacklightPwm { duty_cycle: 50, gui_override: None };
        pwm.apply(&mut lcd);
        assert_eq!(lcd.contrast, 50);
        pwm.gui_override = Some(200);
        pwm.apply(&mut lcd);
        assert_eq!(lcd.contrast, 200);
    }

    #[test]
    fn serial_loopback_queue() {
        let mut s = Serial::new();
        s.push_rx(b'A');
        assert_eq!(s.read_byte(), Some(b'A'));
        s.write_byte(b'B');
        assert_eq!(s.drain_tx(), vec![b'B']);
    }

    #[test]
    fn keypad_column_select_exposes_matching_row_bits() {
        let mut kp = Keypad::default();
        kp.set_key(2, 3, true);
        kp.write(0x00, 2);
        assert_eq!(kp.read(0x04), 0b1000);
        kp.set_key(2, 3, false);
        assert_eq!(kp.read(0x04), 0);
    }

    #[test]
    fn crypto_unsupported_start_logs_and_clears_busy() {
        let mut c = Crypto::default();
        c.write(0x00, 1);
        assert_eq!(c.control & 1, 0);
        assert_eq!(c.status & 1, 1);
    }

    #[test]
    fn fastboot_ram_snapshot_round_trips() {
        use crate::snapshot::Snapshot;
        let mut ram = FastbootRam::new(0x100);
        ram.write_word(4, 0xCAFEBABE);
        let mut buf = Vec::new();
        ram.write_to(&mut buf).unwrap();
        let mut restored = FastbootRam::new(0x100);
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.read_word(4), 0xCAFEBABE);
    }

    #[test]
    fn serial_snapshot_round_trips_pending_queues() {
        use crate::snapshot::Snapshot;
        let mut s = Serial::new();
        s.push_rx(b'A');
        s.write_byte(b'B');
        let mut buf = Vec::new();
        s.write_to(&mut buf).unwrap();
        let mut restored = Serial::new();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(restored.read_byte(), Some(b'A'));
        assert_eq!(restored.drain_tx(), vec![b'B']);
    }

    #[test]
    fn keypad_snapshot_round_trips_held_keys() {
        use crate::snapshot::Snapshot;
        let mut kp = Keypad::default();
        kp.set_key(2, 3, true);
        let mut buf = Vec::new();
        kp.write_to(&mut buf).unwrap();
        let mut restored = Keypad::default();
        restored.read_from(&mut std::io::Cursor::new(buf)).unwrap();
        restored.write(0x00, 2);
        assert_eq!(restored.read(0x04), 0b1000);
    }
}
