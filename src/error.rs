use std::fmt;

/// Errors surfaced by the core. Mirrors the three-tier policy of §7: most
/// device handlers log and drop rather than return an error at all, so this
/// enum only covers the cases that must propagate to the CPU loop or the
/// front-end.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A bad physical access that the caller asked to be surfaced instead of
    /// silently logged (used by the debugger's `pr`/`pw` commands and the
    /// GDB memory-region probes).
    #[error("bad {kind} at {addr:#010x}")]
    BadAccess { kind: AccessKind, addr: u32 },

    /// A fatal programmer-error invariant violation in the core itself
    /// (NAND erase while write-protected, out-of-range scheduler slot, ...).
    /// Re-architects the source's longjmp-based unwind as an ordinary
    /// propagated result, per DESIGN.md / spec.md §9.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("nand error: {0}")]
    Nand(String),

    #[error("filesystem unrecognized: {0}")]
    FsUnrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    ReadByte,
    ReadHalf,
    ReadWord,
    WriteByte,
    WriteHalf,
    WriteWord,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessKind::ReadByte => "read_byte",
            AccessKind::ReadHalf => "read_half",
            AccessKind::ReadWord => "read_word",
            AccessKind::WriteByte => "write_byte",
            AccessKind::WriteHalf => "write_half",
            AccessKind::WriteWord => "write_word",
        };
        write!(f, "{}", s)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Fires a `CoreError::Fatal`. Named after the source's `error(fmt, ...)`
/// longjmp helper (Design Notes §9); callers propagate with `?` instead of
/// unwinding the stack.
pub fn fatal(msg: impl Into<String>) -> CoreError {
    CoreError::Fatal(msg.into())
}
