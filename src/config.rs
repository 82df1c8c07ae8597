//! Startup configuration, built once from environment variables and CLI
//! flags and never re-read mid-run (Design Notes §9: "read once at startup
//! into a configuration record; do not re-read during steady-state").

use std::env;

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => !v.is_empty(),
        Err(_) => false,
    }
}

/// Opt-in diagnostic toggles, §6 "Environment variables". Absent or empty
/// means disabled.
#[derive(Debug, Clone, Default)]
pub struct DiagConfig {
    pub mmio_trace: bool,
    pub mmio_trace_pc: bool,
    pub trace_irq: bool,
    pub trace_vic: bool,
    pub nspire_log_hook: bool,
    pub nspire_log_autoscan: bool,
    pub nspire_log_bypass: bool,
}

impl DiagConfig {
    pub fn from_env() -> Self {
        DiagConfig {
            mmio_trace: env_flag("FIREBIRD_MMIO_TRACE"),
            mmio_trace_pc: env_flag("FIREBIRD_MMIO_TRACE_PC"),
            trace_irq: env_flag("FIREBIRD_TRACE_IRQ"),
            trace_vic: env_flag("FIREBIRD_TRACE_VIC"),
            nspire_log_hook: env_flag("FIREBIRD_NSPIRE_LOG_HOOK"),
            nspire_log_autoscan: env_flag("FIREBIRD_NSPIRE_LOG_AUTOSCAN"),
            nspire_log_bypass: env_flag("FIREBIRD_NSPIRE_LOG_BYPASS"),
        }
    }
}

/// Two independent booleans gating warning behavior (§7 "User-visible
/// failure behavior").
#[derive(Debug, Clone, Copy, Default)]
pub struct WarnPolicy {
    pub print_on_warn: bool,
    pub debug_on_warn: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub diag: DiagConfig,
    pub warn: WarnPolicy,
    pub debug_on_start: bool,
    pub diags_variant: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            diag: DiagConfig::from_env(),
            warn: WarnPolicy::default(),
            debug_on_start: false,
            diags_variant: false,
        }
    }
}
