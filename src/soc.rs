//! Ties every component into one owned `Soc` (spec.md §2 "Data flow", §4.C).
//!
//! Re-architected per Design Notes §9: the source's C globals become fields
//! of this struct; the source's cyclic peripheral back-pointers become a
//! `SystemContext` passed explicitly into handlers that need to raise
//! interrupts or arm scheduler slots.

use std::cell::Cell;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};

use crate::adc::{ClassicAdc, LaterAdc};
use crate::config::Config;
use crate::error::CoreResult;
use crate::interrupt::{line, Bank, InterruptController, Variant as IrqVariant};
use crate::memory::{ApbDispatch, ApbRegion, BackedRegion, RamRom, Size, TopDispatch, TopRegion};
use crate::nand::parallel::ParallelNand;
use crate::nand::spi::SpiNand;
use crate::nand::FlashImage;
use crate::peripherals::dma::Dma;
use crate::peripherals::gpio::Gpio;
use crate::peripherals::misc::{BacklightPwm, Crypto, FastbootRam, Keypad, Led, LcdRegs, Sdio, Serial, Spi};
use crate::peripherals::rtc::Rtc;
use crate::peripherals::usblink::{PacketExchange, UsbLink};
use crate::peripherals::watchdog::{Watchdog, WatchdogEvent};
use crate::power::Pmu;
use crate::scheduler::{ClockDomain, Scheduler, SlotId};
use crate::snapshot::{Snapshot, SnapshotHeader};
use crate::timers::{ClassicTimerBank, Sp804Bank, CLASSIC_TICK_ADVANCE};

/// The three SoC generations the core models (spec.md §1, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocVariant {
    Classic,
    Cx,
    CxIi,
}

impl SocVariant {
    fn nand_is_spi(self) -> bool {
        matches!(self, SocVariant::CxIi)
    }
    fn irq_variant(self) -> IrqVariant {
        match self {
            SocVariant::CxIi => IrqVariant::Vectored,
            _ => IrqVariant::Classic,
        }
    }
    fn has_later_adc(self) -> bool {
        matches!(self, SocVariant::Cx | SocVariant::CxIi)
    }
    fn has_sp804(self) -> bool {
        matches!(self, SocVariant::Cx | SocVariant::CxIi)
    }
}

/// Per-variant memory layout: base addresses and sizes for the backed
/// regions and the top-dispatch table overrides (spec.md §4.C
/// "Initialization").
struct MemoryMap {
    sdram_base: u32,
    sdram_size: u32,
    sram_base: u32,
    sram_size: u32,
    boot_rom_base: u32,
    boot_rom_size: u32,
    fastboot_ram_base: u32,
    fastboot_ram_size: u32,
    apb_top_index: u32,
    nand_top_index: u32,
    lcd_top_index: u32,
    fastboot_top_index: u32,
}

impl MemoryMap {
    fn for_variant(variant: SocVariant) -> MemoryMap {
        match variant {
            SocVariant::Classic | SocVariant::Cx => MemoryMap {
                sdram_base: 0x1000_0000,
                sdram_size: 32 * 1024 * 1024,
                sram_base: 0x0800_0000,
                sram_size: 512 * 1024,
                boot_rom_base: 0x0000_0000,
                boot_rom_size: 0x8_0000,
                fastboot_ram_base: 0x9400_0000,
                fastboot_ram_size: 0x1_0000,
                apb_top_index: 0x90 >> 2,
                nand_top_index: 0xC0 >> 2,
                lcd_top_index: 0xA0 >> 2,
                fastboot_top_index: 0x9400_0000 >> 26,
            },
            SocVariant::CxIi => MemoryMap {
                sdram_base: 0x1000_0000,
                sdram_size: 64 * 1024 * 1024,
                sram_base: 0x0800_0000,
                sram_size: 1024 * 1024,
                boot_rom_base: 0x0000_0000,
                boot_rom_size: 0x8_0000,
                fastboot_ram_base: 0x9400_0000,
                fastboot_ram_size: 0x1_0000,
                apb_top_index: 0x90 >> 2,
                nand_top_index: 0xB8 >> 2,
                lcd_top_index: 0xA0 >> 2,
                fastboot_top_index: 0x9400_0000 >> 26,
            },
        }
    }

    fn nand_window_base(&self) -> u32 {
        self.nand_top_index << 26
    }
}

/// Context passed to peripheral handlers that need to raise interrupts or
/// arm scheduler deadlines, replacing the source's cyclic back-pointers
/// (Design Notes §9 "replace cyclic peripheral references").
pub struct SystemContext<'a> {
    pub scheduler: &'a mut Scheduler,
    pub irq: &'a mut InterruptController,
}

impl<'a> SystemContext<'a> {
    pub fn raise(&mut self, line: u32) {
        self.irq.int_set(line, true);
    }
    pub fn lower(&mut self, line: u32) {
        self.irq.int_set(line, false);
    }
}

pub struct Soc {
    pub variant: SocVariant,
    pub config: Config,

    pub ram_rom: RamRom,
    top: TopDispatch,
    apb: ApbDispatch,

    pub scheduler: Scheduler,
    pub irq: InterruptController,

    pub pmu: Pmu,
    pub classic_adc: ClassicAdc,
    pub later_adc: LaterAdc,
    pub classic_timers: [ClassicTimerBank; 3],
    pub sp804: [Sp804Bank; 3],
    pub gpio: Gpio,
    pub rtc: Rtc,
    pub watchdog: Watchdog,
    pub sdio: Sdio,
    pub spi_periph: Spi,
    pub led: Led,
    pub serial: Serial,
    pub lcd: LcdRegs,
    pub backlight: BacklightPwm,
    pub fastboot_ram: FastbootRam,
    pub keypad: Keypad,
    pub crypto: Crypto,
    pub dma: Dma,
    pub usblink: UsbLink,
    usb_exchange: Box<dyn PacketExchange>,

    pub nand_parallel: Option<ParallelNand>,
    pub nand_spi: Option<SpiNand>,
    pub flash: Option<FlashImage>,

    pub sleeping: bool,
    pub now_seconds: i64,

    mem: MemoryMap,
}

/// A `PacketExchange` that never has inbound data and drops outbound
/// packets; used until a real front-end link is attached (spec.md §1
/// "USB-link... consumed via a packet-exchange interface").
#[derive(Default)]
pub struct NullPacketExchange;

impl PacketExchange for NullPacketExchange {
    fn poll_inbound(&mut self) -> Option<Vec<u8>> {
        None
    }
    fn send_outbound(&mut self, _packet: Vec<u8>) {}
}

impl Soc {
    pub fn new(variant: SocVariant, config: Config) -> Self {
        let mem = MemoryMap::for_variant(variant);
        let max_extent = mem.sdram_base + mem.sdram_size;
        let mut ram_rom = RamRom::new(max_extent.max(mem.sram_base + mem.sram_size));

        let boot_rom = BackedRegion::new("boot_rom", mem.boot_rom_base, mem.boot_rom_size, true);
        let sram = BackedRegion::new("sram", mem.sram_base, mem.sram_size, false);
        let sdram = BackedRegion::new("sdram", mem.sdram_base, mem.sdram_size, false);
        ram_rom.add_region(boot_rom);
        ram_rom.add_region(sram);
        ram_rom.add_region(sdram);

        let mut top = TopDispatch::new();
        top.set(mem.apb_top_index, TopRegion::Apb);
        top.set(mem.lcd_top_index, TopRegion::Lcd);
        top.set(mem.fastboot_top_index, TopRegion::FastbootRam);
        top.set(mem.nand_top_index, if variant.nand_is_spi() { TopRegion::NandSpi } else { TopRegion::NandParallel });

        let mut apb = ApbDispatch::new();
        apb.set(0, ApbRegion::InterruptController);
        apb.set(1, ApbRegion::Pmu);
        apb.set(2, ApbRegion::Adc);
        apb.set(3, ApbRegion::ClassicTimers);
        apb.set(4, ApbRegion::Sp804Timers);
        apb.set(5, ApbRegion::Gpio);
        apb.set(6, ApbRegion::Rtc);
        apb.set(7, ApbRegion::Watchdog);
        apb.set(8, ApbRegion::Sdio);
        apb.set(9, ApbRegion::Spi);
        apb.set(10, ApbRegion::Led);
        apb.set(11, ApbRegion::Serial);
        apb.set(12, ApbRegion::Keypad);
        apb.set(13, ApbRegion::Dma);
        apb.set(14, ApbRegion::LcdRegs);
        apb.set(15, ApbRegion::BacklightPwm);
        apb.set(16, ApbRegion::SdramCtl);
        apb.set(17, ApbRegion::Crypto);
        apb.set(18, ApbRegion::UsbLink);

        Soc {
            variant,
            config,
            ram_rom,
            top,
            apb,
            scheduler: Scheduler::new(),
            irq: InterruptController::new(variant.irq_variant()),
            pmu: Pmu::new(),
            classic_adc: ClassicAdc::new(),
            later_adc: LaterAdc::new(),
            classic_timers: [ClassicTimerBank::new(), ClassicTimerBank::new(), ClassicTimerBank::new()],
            sp804: [Sp804Bank::new(), Sp804Bank::new(), Sp804Bank::new()],
            gpio: Gpio::new(),
            rtc: Rtc::new(),
            watchdog: Watchdog::new(),
            sdio: Sdio::default(),
            spi_periph: Spi::default(),
            led: Led::default(),
            serial: Serial::new(),
            lcd: LcdRegs::default(),
            backlight: BacklightPwm::default(),
            fastboot_ram: FastbootRam::new(mem.fastboot_ram_size as usize),
            keypad: Keypad::default(),
            crypto: Crypto::default(),
            dma: Dma::new(),
            usblink: UsbLink::new(),
            usb_exchange: Box::new(NullPacketExchange),
            nand_parallel: None,
            nand_spi: None,
            flash: None,
            sleeping: false,
            now_seconds: 0,
            mem,
        }
    }

    /// Opens (or creates) the flash image, wiring up the matching bus
    /// controller for the variant (spec.md §6 `start`).
    pub fn attach_flash(&mut self, flash_path: &Path) -> CoreResult<()> {
        let flash = if flash_path.exists() {
            FlashImage::open(flash_path)?
        } else {
            FlashImage::create(flash_path, self.variant.nand_is_spi())?
        };
        let metrics = flash.metrics;
        if self.variant.nand_is_spi() {
            self.nand_spi = Some(SpiNand::new(metrics));
        } else {
            self.nand_parallel = Some(ParallelNand::new(metrics));
        }
        self.flash = Some(flash);
        Ok(())
    }

    /// Wires a real front-end-backed packet exchange in place of the
    /// no-op default (spec.md §1 "consumed via a packet-exchange interface").
    pub fn attach_usb_link_exchange(&mut self, exchange: Box<dyn PacketExchange>) {
        self.usb_exchange = exchange;
    }

    pub fn load_boot_rom(&mut self, boot1_path: &Path) -> CoreResult<()> {
        let bytes = std::fs::read(boot1_path)?;
        if let Some(region) = self.ram_rom.regions.iter().find(|r| r.name == "boot_rom") {
            region.load_bytes(0, &bytes);
        }
        Ok(())
    }

    fn top_extra_region(&mut self, region: TopRegion, addr: u32, size: Size, is_write: bool, write_value: u32) -> Option<u32> {
        match region {
            TopRegion::FastbootRam => {
                let off = (addr - self.mem.fastboot_ram_base) as usize;
                let word_off = off & !3;
                if is_write {
                    self.write_fastboot(word_off, write_value);
                    Some(0)
                } else {
                    Some(self.fastboot_ram.read_word(word_off))
                }
            }
            TopRegion::Lcd => {
                if is_write {
                    self.lcd.control = write_value;
                    Some(0)
                } else {
                    Some(self.lcd.control)
                }
            }
            _ => None,
        }
    }

    fn write_fastboot(&mut self, word_off: usize, value: u32) {
        self.fastboot_ram.write_word(word_off, value);
    }

    /// Top-level read dispatch: RAM/ROM, APB sub-dispatch, NAND windows,
    /// LCD regs, fastboot RAM (spec.md §4.C).
    pub fn read(&mut self, addr: u32, size: Size) -> u32 {
        match self.top.lookup(addr) {
            TopRegion::RamRom => self.ram_rom.read(addr, size, |_| {}),
            TopRegion::Apb => self.read_apb(addr, size),
            TopRegion::NandParallel => self.read_nand_parallel(addr, size),
            TopRegion::NandSpi => self.read_nand_spi(addr, size),
            TopRegion::Lcd | TopRegion::FastbootRam => self.top_extra_region(self.top.lookup(addr), addr, size, false, 0).unwrap_or(0),
            TopRegion::Unmapped => {
                warn!("Bad read: {:#010x} unmapped top region", addr);
                0
            }
        }
    }

    /// Top-level write dispatch; peripheral sub-dispatch broadcasts narrow
    /// writes across the full 32-bit lane per spec.md §4.C "Byte/half
    /// access".
    pub fn write(&mut self, addr: u32, size: Size, value: u32) {
        match self.top.lookup(addr) {
            TopRegion::RamRom => self.ram_rom.write(addr, size, value, |_| {}, |_| {}),
            TopRegion::Apb => self.write_apb(addr, size, value),
            TopRegion::NandParallel => self.write_nand_parallel(addr, size, value),
            TopRegion::NandSpi => self.write_nand_spi(addr, size, value),
            TopRegion::Lcd | TopRegion::FastbootRam => {
                self.top_extra_region(self.top.lookup(addr), addr, size, true, value);
            }
            TopRegion::Unmapped => warn!("Bad write: {:#010x} unmapped top region", addr),
        }
    }

    /// Widens a narrow access into a 32-bit lane value, per the APB
    /// specification (spec.md §4.C).
    fn broadcast(size: Size, value: u32) -> u32 {
        match size {
            Size::Byte => value.wrapping_mul(0x0101_0101),
            Size::Half => value.wrapping_mul(0x0001_0001),
            Size::Word => value,
        }
    }

    fn narrow(size: Size, addr: u32, word: u32) -> u32 {
        match size {
            Size::Word => word,
            Size::Half => {
                let shift = (addr & 2) * 8;
                (word >> shift) & 0xFFFF
            }
            Size::Byte => {
                let shift = (addr & 3) * 8;
                (word >> shift) & 0xFF
            }
        }
    }

    fn read_apb(&mut self, addr: u32, size: Size) -> u32 {
        let word = match self.apb.lookup(addr) {
            ApbRegion::InterruptController => self.read_irq_register(addr),
            ApbRegion::Pmu => self.read_pmu_register(addr),
            ApbRegion::Adc => self.read_adc_register(addr),
            ApbRegion::ClassicTimers => self.read_classic_timer_register(addr),
            ApbRegion::Sp804Timers => self.read_sp804_register(addr),
            ApbRegion::Gpio => self.read_gpio_register(addr),
            ApbRegion::Rtc => self.rtc.read(self.now_seconds),
            ApbRegion::Watchdog => self.watchdog.value,
            ApbRegion::Sdio => self.read_sdio_register(addr),
            ApbRegion::Spi => self.spi_periph.control,
            ApbRegion::Led => self.led.state,
            ApbRegion::Serial => self.read_serial_register(addr),
            ApbRegion::Keypad => self.keypad.read(addr),
            ApbRegion::Dma => self.dma.read(addr),
            ApbRegion::LcdRegs => self.read_lcd_register(addr),
            ApbRegion::BacklightPwm => self.backlight.duty_cycle,
            ApbRegion::SdramCtl => self.pmu.clock_word(),
            ApbRegion::Crypto => self.crypto.read(addr),
            ApbRegion::UsbLink => self.usblink.read(addr),
            ApbRegion::Unmapped => {
                warn!("Bad APB read: {:#010x}", addr);
                0
            }
        };
        Self::narrow(size, addr, word)
    }

    fn write_apb(&mut self, addr: u32, size: Size, value: u32) {
        let word = Self::broadcast(size, value);
        match self.apb.lookup(addr) {
            ApbRegion::InterruptController => self.write_irq_register(addr, word),
            ApbRegion::Pmu => self.write_pmu_register(addr, word),
            ApbRegion::Adc => self.write_adc_register(addr, word),
            ApbRegion::ClassicTimers => self.write_classic_timer_register(addr, word),
            ApbRegion::Sp804Timers => self.write_sp804_register(addr, word),
            ApbRegion::Gpio => self.write_gpio_register(addr, word),
            ApbRegion::Rtc => self.rtc.set(word, self.now_seconds),
            ApbRegion::Watchdog => self.write_watchdog_register(addr, word),
            ApbRegion::Sdio => self.write_sdio_register(addr, word),
            ApbRegion::Spi => {
                self.spi_periph.control = word;
            }
            ApbRegion::Led => self.led.state = word,
            ApbRegion::Serial => self.write_serial_register(addr, word),
            ApbRegion::Keypad => self.keypad.write(addr, word),
            ApbRegion::Dma => self.dma.write(addr, word, &mut self.ram_rom),
            ApbRegion::LcdRegs => self.write_lcd_register(addr, word),
            ApbRegion::BacklightPwm => {
                self.backlight.duty_cycle = word;
                self.backlight.apply(&mut self.lcd);
            }
            ApbRegion::SdramCtl => {
                self.pmu.apply_clock_word(word, &mut self.scheduler);
                self.irq.int_set(line::POWER_MANAGEMENT, true);
            }
            ApbRegion::Crypto => self.crypto.write(addr, word),
            ApbRegion::UsbLink => self.usblink.write(addr, word, self.usb_exchange.as_mut()),
            ApbRegion::Unmapped => warn!("Bad APB write: {:#010x}", addr),
        }
    }

    fn read_sdio_register(&self, addr: u32) -> u32 {
        match addr & 0xFF {
            0x00 => self.sdio.command,
            0x04 => self.sdio.argument,
            0x08..=0x14 => self.sdio.response[((addr & 0xFF) as usize - 0x08) / 4],
            0x18 => self.sdio.card_present as u32,
            _ => 0,
        }
    }
    fn write_sdio_register(&mut self, addr: u32, value: u32) {
        match addr & 0xFF {
            0x00 => self.sdio.command = value,
            0x04 => self.sdio.argument = value,
            _ => {}
        }
    }

    fn read_serial_register(&mut self, addr: u32) -> u32 {
        match addr & 0xFF {
            0x00 => self.serial.read_byte().map(|b| b as u32).unwrap_or(0),
            0x04 => if self.serial.rx.is_empty() { 0 } else { 1 },
            _ => 0,
        }
    }
    fn write_serial_register(&mut self, addr: u32, value: u32) {
        if addr & 0xFF == 0x00 {
            self.serial.write_byte(value as u8);
        }
    }

    fn read_lcd_register(&self, addr: u32) -> u32 {
        match addr & 0xFF {
            0x00 => self.lcd.control,
            0x04..=0x10 => self.lcd.timing[((addr & 0xFF) as usize - 0x04) / 4],
            0x18 => self.lcd.contrast,
            _ => 0,
        }
    }
    fn write_lcd_register(&mut self, addr: u32, value: u32) {
        match addr & 0xFF {
            0x00 => self.lcd.control = value,
            0x04..=0x10 => self.lcd.timing[((addr & 0xFF) as usize - 0x04) / 4] = value,
            0x18 => self.lcd.contrast = value,
            _ => {}
        }
    }

    fn read_irq_register(&self, addr: u32) -> u32 {
        match addr & 0xFF {
            0x00 => self.irq.irq_pending_masked(Bank::Irq),
            0x04 => self.irq.status(),
            _ => 0,
        }
    }
    fn write_irq_register(&mut self, addr: u32, value: u32) {
        match addr & 0xFF {
            0x08 => self.irq.set_mask_or(Bank::Irq, value),
            0x0C => self.irq.set_mask_and_not(Bank::Irq, value),
            0x10 => self.irq.set_priority_limit(Bank::Irq, value as u8),
            0x14 => self.irq.set_noninverted(value),
            0x18 => self.irq.set_sticky(value),
            0x1C => self.irq.clear_sticky_status(value),
            _ => {}
        }
    }

    fn read_pmu_register(&self, addr: u32) -> u32 {
        match addr & 0xFF {
            0x00 => self.pmu.status_word(),
            0x04 => self.pmu.clock_word(),
            _ => 0,
        }
    }
    fn write_pmu_register(&mut self, addr: u32, value: u32) {
        match addr & 0xFF {
            0x04 => {
                self.pmu.apply_clock_word(value, &mut self.scheduler);
                self.irq.int_set(line::POWER_MANAGEMENT, true);
            }
            0x08 if value & 1 != 0 => {
                self.pmu.sleep();
                self.sleeping = true;
                self.scheduler.event_clear(SlotId::ClassicTimerA);
                self.scheduler.event_clear(SlotId::ClassicTimerB);
            }
            _ => {}
        }
    }

    fn read_adc_register(&mut self, addr: u32) -> u32 {
        if self.variant.has_later_adc() {
            self.later_adc.refresh_sample_bank(&self.pmu);
            let off = (addr & 0xFFF) as usize;
            if off < 0x20 {
                self.later_adc.sample_bank.get(off / 4).copied().unwrap_or(0) as u32
            } else {
                0
            }
        } else {
            let ch = ((addr >> 2) & 7) as usize;
            self.classic_adc.channels.get(ch).map(|c| c.value).unwrap_or(0)
        }
    }
    fn write_adc_register(&mut self, addr: u32, value: u32) {
        if self.variant.has_later_adc() {
            if addr & 0xFFF == 0x118 {
                self.later_adc.periodic_enabled = value & 1 != 0;
            }
        } else {
            let ch = ((addr >> 2) & 7) as usize;
            self.classic_adc.read_channel(ch, &self.pmu);
            let _ = value;
        }
    }

    fn read_classic_timer_register(&self, addr: u32) -> u32 {
        let bank = ((addr >> 4) & 3) as usize;
        self.classic_timers.get(bank).map(|b| b.timer_a.current_value).unwrap_or(0)
    }
    fn write_classic_timer_register(&mut self, addr: u32, value: u32) {
        let bank = ((addr >> 4) & 3) as usize;
        if let Some(b) = self.classic_timers.get_mut(bank) {
            b.timer_a.control = value;
        }
    }

    fn read_sp804_register(&self, addr: u32) -> u32 {
        let bank = ((addr >> 6) & 3) as usize;
        let half = ((addr >> 5) & 1) as usize;
        self.sp804.get(bank).and_then(|b| b.timers.get(half)).map(|t| t.value()).unwrap_or(0)
    }
    fn write_sp804_register(&mut self, addr: u32, value: u32) {
        let bank = ((addr >> 6) & 3) as usize;
        let half = ((addr >> 5) & 1) as usize;
        let reg = addr & 0x1F;
        if let Some(t) = self.sp804.get_mut(bank).and_then(|b| b.timers.get_mut(half)) {
            match reg {
                0x00 => t.write_load(value),
                0x04 => t.write_background_load(value),
                0x08 => t.write_control(value),
                _ => {}
            }
        }
    }

    fn read_gpio_register(&self, addr: u32) -> u32 {
        let section = ((addr >> 4) & 7) as usize;
        self.gpio.sections.get(section).map(|s| s.data() as u32).unwrap_or(0)
    }
    fn write_gpio_register(&mut self, addr: u32, value: u32) {
        let section = ((addr >> 4) & 7) as usize;
        if let Some(s) = self.gpio.sections.get_mut(section) {
            s.direction = value as u8;
        }
    }

    fn write_watchdog_register(&mut self, addr: u32, value: u32) {
        match addr & 0xF {
            0x0 => self.watchdog.write_load(value),
            0x4 => self.watchdog.write_control(value),
            0x8 => self.watchdog.write_lock(value),
            _ => {}
        }
    }

    fn read_nand_parallel(&mut self, _addr: u32, _size: Size) -> u32 {
        match (&mut self.nand_parallel, &self.flash) {
            (Some(nand), Some(flash)) => nand.read_data_byte(flash) as u32,
            _ => 0,
        }
    }
    fn write_nand_parallel(&mut self, addr: u32, _size: Size, value: u32) {
        let (nand, flash) = match (&mut self.nand_parallel, &mut self.flash) {
            (Some(n), Some(f)) => (n, f),
            _ => return,
        };
        let reg = addr & 0xF;
        let result = match reg {
            0x0 => nand.write_command(flash, value as u8),
            0x4 => {
                nand.write_address(value as u8);
                Ok(())
            }
            0x8 => {
                nand.write_data_byte(value as u8);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("NAND fatal: {e}");
        }
    }

    fn read_nand_spi(&mut self, addr: u32, _size: Size) -> u32 {
        match &self.nand_spi {
            Some(nand) => match addr & 0xF {
                0x4 => nand.jedec_id()[0] as u32,
                _ => 0,
            },
            None => 0,
        }
    }
    fn write_nand_spi(&mut self, addr: u32, _size: Size, value: u32) {
        if let Some(nand) = &mut self.nand_spi {
            if addr & 0xF == 0x0 {
                nand.dispatch_command(value as u8);
            }
        }
    }

    pub fn reset_soft(&mut self) {
        info!("soft reset");
    }

    pub fn reset_hard(&mut self) {
        info!("hard reset");
        self.fastboot_ram.hard_reset();
        self.irq = InterruptController::new(self.variant.irq_variant());
        self.scheduler = Scheduler::new();
    }

    /// Drains due scheduler slots for `delta` CPU cycles, dispatching each
    /// through an exhaustive match (spec.md §4.A `process_pending`; Design
    /// Notes §9 enum-tag dispatch in place of function pointers).
    pub fn process_pending(&mut self, delta: u32) -> u32 {
        let mut scheduler = std::mem::replace(&mut self.scheduler, Scheduler::new());
        let remaining = scheduler.process_pending(delta, |sched, id| self.fire_slot(sched, id));
        self.scheduler = scheduler;
        remaining
    }

    fn fire_slot(&mut self, scheduler: &mut Scheduler, id: SlotId) {
        match id {
            SlotId::Watchdog => {
                let event = self.watchdog.advance(1);
                match event {
                    WatchdogEvent::Interrupt => self.irq.int_set(line::WATCHDOG_TIMER, true),
                    WatchdogEvent::Reset => {
                        self.irq.int_set(line::WATCHDOG_TIMER, true);
                        warn!("watchdog double expiration: requesting hard reset");
                    }
                    WatchdogEvent::None => {}
                }
                scheduler.event_repeat(SlotId::Watchdog, self.watchdog.load.max(1));
            }
            SlotId::ClassicTimerA => {
                self.classic_timers[0].advance(CLASSIC_TICK_ADVANCE);
                if self.classic_timers[0].pending() != 0 {
                    self.irq.int_set(line::FIRST_TIMER, true);
                }
                scheduler.event_repeat(SlotId::ClassicTimerA, CLASSIC_TICK_ADVANCE);
            }
            SlotId::ClassicTimerB => {
                self.classic_timers[1].advance(CLASSIC_TICK_ADVANCE);
                if self.classic_timers[1].pending() != 0 {
                    self.irq.int_set(line::SECOND_TIMER, true);
                }
                scheduler.event_repeat(SlotId::ClassicTimerB, CLASSIC_TICK_ADVANCE);
            }
            SlotId::ClassicTimerC => {
                self.classic_timers[2].advance(CLASSIC_TICK_ADVANCE);
                scheduler.event_repeat(SlotId::ClassicTimerC, CLASSIC_TICK_ADVANCE);
            }
            SlotId::Sp804Timer { bank, half } => {
                if let Some(t) = self.sp804.get_mut(bank as usize).and_then(|b| b.timers.get_mut(half as usize)) {
                    t.advance(1);
                    if t.interrupt_pending {
                        self.irq.int_set(line::FAST_TIMER, true);
                    }
                    if let Some(next) = t.ticks_to_next_event() {
                        scheduler.event_repeat(SlotId::Sp804Timer { bank, half }, next.max(1));
                    }
                }
            }
            SlotId::FastAdc => {
                if self.later_adc.step(&self.pmu) {
                    self.irq.int_set(line::ADC, true);
                }
                scheduler.event_repeat(SlotId::FastAdc, self.later_adc.reload_value.max(1));
            }
            SlotId::Usb => {
                self.irq.int_set(line::USB_HOST, true);
            }
            SlotId::UsbLinkPoll => {
                if self.usblink.poll(self.usb_exchange.as_mut()) {
                    self.irq.int_set(line::USB_HOST, true);
                }
                scheduler.event_repeat(SlotId::UsbLinkPoll, 1000);
            }
            SlotId::RtcTick => {
                self.now_seconds += 1;
                if self.rtc.alarm_due(self.now_seconds) {
                    self.irq.int_set(line::RTC, true);
                }
                scheduler.event_repeat(SlotId::RtcTick, self.scheduler_rtc_period());
            }
            SlotId::SleepWakePoll => {
                if !self.sleeping {
                    scheduler.event_clear(SlotId::SleepWakePoll);
                }
            }
        }
    }

    fn scheduler_rtc_period(&self) -> u32 {
        self.scheduler.clock_rate(ClockDomain::Fixed32K)
    }

    /// The `qXfer:memory-map:read` payload (spec.md §6, §8 scenario #4):
    /// one entry per backed region plus the NAND/SPI-NAND window.
    pub fn memory_map_entries(&self) -> Vec<crate::gdbstub::MemoryMapEntry> {
        let mut entries = vec![
            crate::gdbstub::MemoryMapEntry { kind: "rom", start: self.mem.boot_rom_base, length: self.mem.boot_rom_size, name: "boot_rom" },
            crate::gdbstub::MemoryMapEntry { kind: "ram", start: self.mem.sdram_base, length: self.mem.sdram_size, name: "sdram" },
            crate::gdbstub::MemoryMapEntry { kind: "ram", start: self.mem.sram_base, length: self.mem.sram_size, name: "sram" },
        ];
        let nand_name = if self.variant.nand_is_spi() { "spi_nand" } else { "nand" };
        entries.push(crate::gdbstub::MemoryMapEntry { kind: "flash", start: self.mem.nand_window_base(), length: 0x1000, name: nand_name });
        entries
    }

    /// Writes every component in `snapshot::COMPONENT_ORDER` (spec.md §4.J).
    /// The NAND bus-controller state machine is only written when a
    /// controller is attached, mirroring the variant's fixed choice of
    /// parallel vs. SPI NAND (`attach_flash` always runs before this on a
    /// fresh `Soc`, so exactly one of the two is `Some`).
    pub fn write_state(&self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(&self.now_seconds.to_le_bytes())?;
        out.write_all(&[self.sleeping as u8])?;
        self.ram_rom.write_to(out)?;
        self.gpio.write_to(out)?;
        self.rtc.write_to(out)?;
        self.watchdog.write_to(out)?;
        self.sdio.write_to(out)?;
        self.spi_periph.write_to(out)?;
        self.led.write_to(out)?;
        self.serial.write_to(out)?;
        self.lcd.write_to(out)?;
        self.backlight.write_to(out)?;
        self.fastboot_ram.write_to(out)?;
        self.keypad.write_to(out)?;
        self.crypto.write_to(out)?;
        self.dma.write_to(out)?;
        self.usblink.write_to(out)?;
        self.irq.write_to(out)?;
        self.pmu.write_to(out)?;
        self.classic_adc.write_to(out)?;
        self.later_adc.write_to(out)?;
        for bank in &self.classic_timers {
            bank.write_to(out)?;
        }
        for bank in &self.sp804 {
            bank.write_to(out)?;
        }
        if let Some(nand) = &self.nand_parallel {
            nand.write_to(out)?;
        }
        if let Some(nand) = &self.nand_spi {
            nand.write_to(out)?;
        }
        self.scheduler.write_to(out)
    }

    pub fn read_state(&mut self, input: &mut dyn Read) -> std::io::Result<()> {
        let mut buf8 = [0u8; 8];
        input.read_exact(&mut buf8)?;
        self.now_seconds = i64::from_le_bytes(buf8);
        let mut flag = [0u8; 1];
        input.read_exact(&mut flag)?;
        self.sleeping = flag[0] != 0;
        self.ram_rom.read_from(input)?;
        self.gpio.read_from(input)?;
        self.rtc.read_from(input)?;
        self.watchdog.read_from(input)?;
        self.sdio.read_from(input)?;
        self.spi_periph.read_from(input)?;
        self.led.read_from(input)?;
        self.serial.read_from(input)?;
        self.lcd.read_from(input)?;
        self.backlight.read_from(input)?;
        self.fastboot_ram.read_from(input)?;
        self.keypad.read_from(input)?;
        self.crypto.read_from(input)?;
        self.dma.read_from(input)?;
        self.usblink.read_from(input)?;
        self.irq.read_from(input)?;
        self.pmu.read_from(input)?;
        self.classic_adc.read_from(input)?;
        self.later_adc.read_from(input)?;
        for bank in self.classic_timers.iter_mut() {
            bank.read_from(input)?;
        }
        for bank in self.sp804.iter_mut() {
            bank.read_from(input)?;
        }
        if let Some(nand) = &mut self.nand_parallel {
            nand.read_from(input)?;
        }
        if let Some(nand) = &mut self.nand_spi {
            nand.read_from(input)?;
        }
        self.scheduler.read_from(input)
    }
}

/// Guest-facing lifecycle surface consumed by the front-end (spec.md §6).
pub struct Emulator {
    pub soc: Soc,
    pub flash_path: PathBuf,
    pub boot1_path: PathBuf,
    exiting: Rc<Cell<bool>>,
}

/// A cloneable handle that requests the emulator's run loop to stop
/// (spec.md §5 "Emulator lifecycle"). `Soc`'s memory model is built on
/// `Rc<RefCell<_>>` (see `memory::BackedRegion`), so it cannot cross a
/// thread boundary; this handle is the single-threaded stand-in for the
/// spec's cross-thread stop signal, shared with whoever embeds the core.
#[derive(Clone)]
pub struct StopHandle(Rc<Cell<bool>>);

impl StopHandle {
    pub fn request(&self) {
        self.0.set(true);
    }

    pub fn requested(&self) -> bool {
        self.0.get()
    }
}

impl Emulator {
    pub fn start(variant: SocVariant, boot1_path: &Path, flash_path: &Path, config: Config) -> CoreResult<Emulator> {
        let mut soc = Soc::new(variant, config);
        soc.load_boot_rom(boot1_path)?;
        soc.attach_flash(flash_path)?;
        Ok(Emulator {
            soc,
            flash_path: flash_path.to_path_buf(),
            boot1_path: boot1_path.to_path_buf(),
            exiting: Rc::new(Cell::new(false)),
        })
    }

    /// Writes a snapshot file (spec.md §4.J): header with the boot1/flash
    /// paths used for this session, followed by `Soc::write_state`. The
    /// flash image itself is not copied; it persists through its own
    /// memory-mapped file (`nand::FlashImage`).
    pub fn suspend(&self, path: &Path) -> CoreResult<()> {
        let mut file = std::fs::File::create(path)?;
        let header = SnapshotHeader { boot1_path: self.boot1_path.clone(), flash_path: self.flash_path.clone() };
        header.write_to(&mut file)?;
        self.soc.write_state(&mut file)?;
        info!("wrote snapshot to {:?}", path);
        Ok(())
    }

    /// Rebuilds a `Soc` from scratch using the boot1/flash paths recorded in
    /// the snapshot header, then overlays the serialized component state
    /// (spec.md §4.J). `variant` is supplied by the caller (the CLI's
    /// `--variant` flag, see DESIGN.md) rather than stored in the header,
    /// since the header only needs to know where the firmware images live.
    pub fn resume(variant: SocVariant, path: &Path, config: Config) -> CoreResult<Emulator> {
        let mut file = std::fs::File::open(path)?;
        let header = SnapshotHeader::read_from(&mut file)?;
        let mut soc = Soc::new(variant, config);
        soc.load_boot_rom(&header.boot1_path)?;
        soc.attach_flash(&header.flash_path)?;
        soc.read_state(&mut file)?;
        info!("resumed snapshot from {:?}", path);
        Ok(Emulator {
            soc,
            flash_path: header.flash_path,
            boot1_path: header.boot1_path,
            exiting: Rc::new(Cell::new(false)),
        })
    }

    /// Drives the scheduler with its own `next_cpu_tick` as the per-iteration
    /// budget (see main.rs's `run_loop`, which this generalizes) until a
    /// `StopHandle::request` flips the shared flag.
    pub fn run(&mut self) {
        self.exiting.set(false);
        while !self.exiting.get() {
            let budget = self.soc.scheduler.next_cpu_tick().max(1);
            self.soc.process_pending(budget);
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Rc::clone(&self.exiting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_dispatch_routes_apb_window() {
        let soc = Soc::new(SocVariant::Classic, Config::from_env());
        assert_eq!(soc.top.lookup(0x9000_0000 + (soc.mem.apb_top_index << 26)), TopRegion::Apb);
    }

    #[test]
    fn fastboot_ram_survives_soft_reset() {
        let mut soc = Soc::new(SocVariant::Classic, Config::from_env());
        soc.write(soc.mem.fastboot_ram_base, Size::Word, 0xDEAD_BEEF);
        soc.reset_soft();
        assert_eq!(soc.read(soc.mem.fastboot_ram_base, Size::Word), 0xDEAD_BEEF);
        soc.reset_hard();
        assert_eq!(soc.read(soc.mem.fastboot_ram_base, Size::Word), 0);
    }

    #[test]
    fn cx2_memory_map_includes_spi_nand_window() {
        let soc = Soc::new(SocVariant::CxIi, Config::from_env());
        let entries = soc.memory_map_entries();
        let xml = crate::gdbstub::memory_map_xml(&entries);
        assert!(xml.contains("<memory type=\"rom\" start=\"0x00000000\" length=\"0x00080000\" name=\"boot_rom\"/>"));
        assert!(xml.contains("name=\"spi_nand\""));
        assert!(xml.contains("start=\"0xb8000000\""));
    }

    #[test]
    fn watchdog_second_expiration_raises_line_once_before_reset() {
        let mut soc = Soc::new(SocVariant::Classic, Config::from_env());
        soc.write_watchdog_register(0x8, 0x1ACC_E551);
        soc.write_watchdog_register(0x0, 0x1000);
        soc.write_watchdog_register(0x4, 0x3);
        soc.irq.set_mask_or(Bank::Irq, 1 << line::WATCHDOG_TIMER);
        soc.scheduler.event_set(SlotId::Watchdog, 1);
        soc.scheduler.set_clocks([1_000_000, 500_000, 250_000, 27_000_000, 12_000_000, 32_768]);
        soc.scheduler.event_set(SlotId::Watchdog, 1);
        soc.process_pending(2);
        assert!(soc.irq.active() & (1 << line::WATCHDOG_TIMER) != 0);
    }

    #[test]
    fn snapshot_round_trips_full_soc_state() {
        let mut soc = Soc::new(SocVariant::CxIi, Config::from_env());
        soc.attach_flash(&std::env::temp_dir().join("nspire_core_test_soc_snapshot.bin")).unwrap();
        soc.write(soc.mem.fastboot_ram_base, Size::Word, 0xCAFE_F00D);
        soc.write_watchdog_register(0x0, 0x1234);
        soc.now_seconds = 42;
        soc.sleeping = true;
        soc.scheduler.set_clocks([1_000_000, 500_000, 250_000, 27_000_000, 12_000_000, 32_768]);
        soc.scheduler.event_set(SlotId::Watchdog, 7);

        let mut buf = Vec::new();
        soc.write_state(&mut buf).unwrap();

        let mut restored = Soc::new(SocVariant::CxIi, Config::from_env());
        restored.attach_flash(&std::env::temp_dir().join("nspire_core_test_soc_snapshot.bin")).unwrap();
        restored.read_state(&mut std::io::Cursor::new(buf)).unwrap();

        assert_eq!(restored.read(restored.mem.fastboot_ram_base, Size::Word), 0xCAFE_F00D);
        assert_eq!(restored.now_seconds, 42);
        assert!(restored.sleeping);
        assert_eq!(restored.scheduler.next_cpu_tick(), soc.scheduler.next_cpu_tick());
    }
}
