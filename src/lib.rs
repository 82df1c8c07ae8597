pub mod adc;
pub mod config;
pub mod debugger;
pub mod error;
pub mod gdbstub;
pub mod interrupt;
pub mod loghook;
pub mod memory;
pub mod nand;
pub mod peripherals;
pub mod power;
pub mod scheduler;
pub mod snapshot;
pub mod soc;
pub mod timers;

pub use error::{CoreError, CoreResult};
pub use soc::{Emulator, Soc, SocVariant};
