//! Optional log-extraction hook (spec.md §4.K). Always off by default;
//! controlled by `FIREBIRD_NSPIRE_LOG_*` environment variables
//! (`config.rs`). Grounded on `original_source/core/debug/nlog.cpp`.

/// ARM prologue recognized as the start of a candidate dispatcher function:
/// `STMDB sp!, {..., lr}` encodes as `0xE92D....` with the `lr` bit (14)
/// set in the register list.
const STMDB_MASK: u32 = 0xFFFF_0000;
const STMDB_PATTERN: u32 = 0xE92D_0000;
const LR_BIT: u32 = 1 << 14;

#[derive(Debug, Clone, Copy)]
pub struct PatchEntry {
    pub addr: u32,
    pub original: u32,
    pub patched: u32,
}

/// Reversible code-patch list (Design Notes §9: "model code-patch
/// reversibility as a `{addr, original, patched}` record list").
#[derive(Debug, Default)]
pub struct PatchTable {
    entries: Vec<PatchEntry>,
}

impl PatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, addr: u32, original: u32, patched: u32) {
        self.entries.push(PatchEntry { addr, original, patched });
    }

    /// Reverts every patch in reverse order, returning `(addr, original)`
    /// pairs for the caller to write back (spec.md testable "toggling the
    /// filter-bypass patch and then toggling it off restores the patched
    /// instructions bit-exactly").
    pub fn revert_all(&mut self) -> Vec<(u32, u32)> {
        let out = self.entries.iter().rev().map(|e| (e.addr, e.original)).collect();
        self.entries.clear();
        out
    }

    pub fn is_patched(&self, addr: u32) -> bool {
        self.entries.iter().any(|e| e.addr == addr)
    }
}

/// Scans `code` (word-aligned ARM instructions) for the dispatcher
/// prologue signature, returning word-offsets of candidate entry points.
pub fn scan_dispatcher_signatures(code: &[u32]) -> Vec<usize> {
    code.iter()
        .enumerate()
        .filter(|&(_, &word)| word & STMDB_MASK == STMDB_PATTERN && word & LR_BIT != 0)
        .map(|(i, _)| i)
        .collect()
}

/// Reconstructs a printf-style message from a format string and a slice of
/// already-fetched argument words (register + stack values the caller
/// collects at the breakpoint). Supports `%s`, `%d`, `%u`, `%x` — the
/// subset the guest's log dispatcher actually uses.
pub fn format_args(fmt: &str, args: &[u32], read_cstr: impl Fn(u32) -> String) -> String {
    let mut out = String::new();
    let mut arg_iter = args.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => {
                if let Some(&ptr) = arg_iter.next() {
                    out.push_str(&read_cstr(ptr));
                }
            }
            Some('d') => {
                if let Some(&v) = arg_iter.next() {
                    out.push_str(&(v as i32).to_string());
                }
            }
            Some('u') => {
                if let Some(&v) = arg_iter.next() {
                    out.push_str(&v.to_string());
                }
            }
            Some('x') => {
                if let Some(&v) = arg_iter.next() {
                    out.push_str(&format!("{v:x}"));
                }
            }
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_scan_finds_prologue() {
        let code = [0x0000_0000, STMDB_PATTERN | LR_BIT | 0x4000, 0xE320_F000];
        let hits = scan_dispatcher_signatures(&code);
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn format_args_substitutes_subset() {
        let out = format_args("val=%d str=%s pct=%%", &[42, 0x1000], |_ptr| "hello".to_string());
        assert_eq!(out, "val=42 str=hello pct=%");
    }

    #[test]
    fn patch_table_revert_restores_original_bytes() {
        let mut table = PatchTable::new();
        table.apply(0x1000, 0xE1A0_0000, 0xEA00_0000);
        assert!(table.is_patched(0x1000));
        let reverted = table.revert_all();
        assert_eq!(reverted, vec![(0x1000, 0xE1A0_0000)]);
        assert!(!table.is_patched(0x1000));
    }
}
