//! End-to-end tests against the public `Soc` surface (spec.md §8 "testable
//! properties" and "end-to-end scenarios"). Addresses below are computed
//! from the Classic/Cx memory map: APB window base `0x90000000`, sub-slot
//! `n` at `+ (n << 16)`.

use nspire_core::config::Config;
use nspire_core::interrupt::{line, Bank};
use nspire_core::memory::Size;
use nspire_core::nand::{FlashImage, CHIP_LARGE_PAGE, CHIP_SMALL_PAGE};
use nspire_core::scheduler::SlotId;
use nspire_core::soc::{Soc, SocVariant};

const APB_BASE: u32 = 0x9000_0000;
const IRQ_SLOT: u32 = APB_BASE;
const WATCHDOG_SLOT: u32 = APB_BASE + (7 << 16);

fn scratch_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(name)
}

#[test]
fn warm_reset_preserves_fastboot_ram_hard_reset_clears_it() {
    let mut soc = Soc::new(SocVariant::Classic, Config::from_env());
    let addr = 0x9400_0000u32;
    soc.write(addr, Size::Word, 0xDEAD_BEEF);
    soc.reset_soft();
    assert_eq!(soc.read(addr, Size::Word), 0xDEAD_BEEF);
    soc.reset_hard();
    assert_eq!(soc.read(addr, Size::Word), 0);
}

#[test]
fn last_word_of_sdram_succeeds() {
    let mut soc = Soc::new(SocVariant::CxIi, Config::from_env());
    let last = 0x1000_0000u32 + 64 * 1024 * 1024 - 4;
    soc.write(last, Size::Word, 0x1234_5678);
    assert_eq!(soc.read(last, Size::Word), 0x1234_5678);
}

#[test]
fn irq_status_formula_holds_through_the_soc() {
    let mut soc = Soc::new(SocVariant::Classic, Config::from_env());
    soc.irq.set_sticky(1 << line::KEYPAD);
    soc.irq.int_set(line::KEYPAD, true);
    assert_ne!(soc.irq.status() & (1 << line::KEYPAD), 0);
    soc.write(IRQ_SLOT + 0x18, Size::Word, 1 << line::RTC);
    assert_eq!(soc.irq.status() & (1 << line::RTC), 0);
}

#[test]
fn watchdog_register_writes_unlock_then_two_expirations_reset() {
    let mut soc = Soc::new(SocVariant::Classic, Config::from_env());
    soc.irq.set_mask_or(Bank::Irq, 1 << line::WATCHDOG_TIMER);
    soc.write(WATCHDOG_SLOT + 0x8, Size::Word, 0x1ACC_E551);
    soc.write(WATCHDOG_SLOT + 0x0, Size::Word, 0x1000);
    soc.write(WATCHDOG_SLOT + 0x4, Size::Word, 0x3);
    assert_eq!(soc.watchdog.advance(0x1000), nspire_core::peripherals::watchdog::WatchdogEvent::Interrupt);
    soc.watchdog.acknowledge();
    assert_eq!(soc.watchdog.advance(0x1000), nspire_core::peripherals::watchdog::WatchdogEvent::Interrupt);
}

#[test]
fn nand_program_can_only_clear_bits_end_to_end() {
    let path = scratch_path("nspire_core_it_nand_program.bin");
    let mut flash = FlashImage::create(&path, false).unwrap();
    let mut nand = nspire_core::nand::parallel::ParallelNand::new(CHIP_SMALL_PAGE);
    nand.write_command(&mut flash, 0x60).unwrap();
    for _ in 0..3 {
        nand.write_address(0);
    }
    nand.write_command(&mut flash, 0xD0).unwrap();

    nand.write_command(&mut flash, 0x80).unwrap();
    for _ in 0..5 {
        nand.write_address(0);
    }
    for b in [0xFF, 0x00, 0xAA, 0x55] {
        nand.write_data_byte(b);
    }
    nand.write_command(&mut flash, 0x10).unwrap();

    nand.write_command(&mut flash, 0x00).unwrap();
    for _ in 0..5 {
        nand.write_address(0);
    }
    let read: Vec<u8> = (0..4).map(|_| nand.read_data_byte(&flash)).collect();
    assert_eq!(read, vec![0xFF, 0x00, 0xAA, 0x55]);
}

#[test]
fn nand_large_page_quadrant_ecc_is_deterministic() {
    let mut page = vec![0u8; 2048];
    for (i, b) in page.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let ecc_a = nspire_core::nand::ecc::ecc_large_page(&page);
    let ecc_b = nspire_core::nand::ecc::ecc_large_page(&page);
    assert_eq!(ecc_a, ecc_b);
    assert_eq!(ecc_a.len(), 4);
}

#[test]
fn filesystem_parser_downgrades_gracefully_on_unrecognized_image() {
    let garbage = vec![0u8; 1 << 20];
    let result = nspire_core::nand::fs::parse(&garbage, 0, garbage.len() as u64, CHIP_LARGE_PAGE);
    assert!(result.is_err());
}

#[test]
fn scheduler_next_event_picks_the_soonest_slot() {
    let mut sched = nspire_core::scheduler::Scheduler::new();
    sched.set_clocks([1_000_000, 500_000, 250_000, 27_000_000, 12_000_000, 32_768]);
    sched.event_set(SlotId::Watchdog, 100);
    sched.event_set(SlotId::RtcTick, 3);
    sched.event_set(SlotId::FastAdc, 50);
    assert_eq!(sched.next_slot(), Some(SlotId::RtcTick));
}

#[test]
fn gdb_memory_map_contains_expected_regions_for_cx2() {
    use nspire_core::gdbstub::{memory_map_xml, MemoryMapEntry};
    let entries = [
        MemoryMapEntry { kind: "rom", start: 0, length: 0x80000, name: "boot_rom" },
        MemoryMapEntry { kind: "ram", start: 0x1000_0000, length: 64 * 1024 * 1024, name: "sdram" },
        MemoryMapEntry { kind: "flash", start: 0xB800_0000, length: 0x1000, name: "spi_nand" },
    ];
    let xml = memory_map_xml(&entries);
    assert!(xml.contains(r#"<memory type="rom" start="0x00000000" length="0x00080000" name="boot_rom"/>"#));
    assert!(xml.contains("name=\"spi_nand\""));
}

#[test]
fn debugger_hex_dump_matches_spec_scenario() {
    use nspire_core::debugger::dump_memory;
    let mut soc = Soc::new(SocVariant::CxIi, Config::from_env());
    let base = 0x1000_0000u32;
    for i in 0u32..16 {
        soc.write(base + i, Size::Byte, i);
    }
    let dump = dump_memory(&mut soc, base);
    let first_line = dump.lines().next().unwrap();
    assert!(first_line.starts_with("10000000  00 01 02 03 04 05 06 07-08 09 0A 0B 0C 0D 0E 0F"));
}

#[test]
fn emulator_start_loads_boot_rom_and_attaches_flash() {
    let boot1 = scratch_path("nspire_core_it_boot1.bin");
    std::fs::write(&boot1, [0xAAu8; 256]).unwrap();
    let flash = scratch_path("nspire_core_it_flash.bin");
    let _ = std::fs::remove_file(&flash);

    let mut emulator = nspire_core::Emulator::start(SocVariant::Classic, &boot1, &flash, Config::from_env()).unwrap();
    assert_eq!(emulator.soc.read(0, Size::Byte), 0xAA);
    assert!(emulator.soc.flash.is_some());
    emulator.soc.reset_hard();
}

#[test]
fn suspend_then_resume_restores_guest_visible_state() {
    let boot1 = scratch_path("nspire_core_it_suspend_boot1.bin");
    std::fs::write(&boot1, [0x11u8; 256]).unwrap();
    let flash = scratch_path("nspire_core_it_suspend_flash.bin");
    let _ = std::fs::remove_file(&flash);
    let snapshot = scratch_path("nspire_core_it_suspend.snap");

    let mut emulator = nspire_core::Emulator::start(SocVariant::Classic, &boot1, &flash, Config::from_env()).unwrap();
    emulator.soc.reset_hard();
    let sdram_addr = 0x1000_0000u32;
    emulator.soc.write(sdram_addr, Size::Word, 0x1357_9BDF);
    emulator.soc.write(WATCHDOG_SLOT + 0x8, Size::Word, 0x1ACC_E551);
    emulator.soc.write(WATCHDOG_SLOT + 0x0, Size::Word, 0x2000);
    emulator.soc.write(WATCHDOG_SLOT + 0x4, Size::Word, 0x3);

    emulator.suspend(&snapshot).unwrap();

    let mut resumed = nspire_core::Emulator::resume(SocVariant::Classic, &snapshot, Config::from_env()).unwrap();
    assert_eq!(resumed.soc.read(sdram_addr, Size::Word), 0x1357_9BDF);
    assert_eq!(resumed.soc.read(0, Size::Byte), 0x11);
    assert_eq!(resumed.soc.watchdog.advance(0), emulator.soc.watchdog.advance(0));
}
