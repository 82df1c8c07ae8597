//! Misc peripherals (spec.md §4.I): GPIO, watchdog, RTC, and the
//! register-level grab-bag (SDIO, SPI, LED, serial, fastboot RAM, LCD
//! registers, backlight PWM, keypad, crypto), plus DMA and the USB-link
//! FIFO surface.

pub mod dma;
pub mod gpio;
pub mod misc;
pub mod rtc;
pub mod usblink;
pub mod watchdog;
