//! Snapshot engine: fixed-order component serialization (spec.md §3
//! "Snapshot", §4.J). Grounded on `original_source/core/misc/snapshot.cpp`.
//!
//! Re-architected per Design Notes §9: the source re-binds scheduler
//! handler function pointers from a freshly initialized instance on
//! resume. Because `Scheduler` here dispatches through `SlotId` tags
//! rather than function pointers (see `scheduler.rs`), no re-binding step
//! is needed — a deserialized `Scheduler` is immediately usable.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

const SIGNATURE: &[u8; 8] = b"NSPIRESN";
const VERSION: u32 = 1;

pub trait Snapshot {
    fn write_to(&self, out: &mut dyn Write) -> io::Result<()>;
    fn read_from(&mut self, input: &mut dyn Read) -> io::Result<()>;
}

fn write_u32(out: &mut dyn Write, v: u32) -> io::Result<()> {
    out.write_all(&v.to_le_bytes())
}
fn read_u32(input: &mut dyn Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
fn write_path(out: &mut dyn Write, path: &PathBuf) -> io::Result<()> {
    let bytes = path.to_string_lossy().into_owned().into_bytes();
    write_u32(out, bytes.len() as u32)?;
    out.write_all(&bytes)
}
fn read_path(input: &mut dyn Read) -> io::Result<PathBuf> {
    let len = read_u32(input)? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(PathBuf::from(String::from_utf8_lossy(&buf).into_owned()))
}

/// `{signature, version, boot1_path, flash_path}` (spec.md §3 "Snapshot").
pub struct SnapshotHeader {
    pub boot1_path: PathBuf,
    pub flash_path: PathBuf,
}

impl SnapshotHeader {
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(SIGNATURE)?;
        write_u32(out, VERSION)?;
        write_path(out, &self.boot1_path)?;
        write_path(out, &self.flash_path)
    }

    pub fn read_from(input: &mut dyn Read) -> CoreResult<SnapshotHeader> {
        let mut sig = [0u8; 8];
        input.read_exact(&mut sig).map_err(CoreError::Io)?;
        if &sig != SIGNATURE {
            return Err(CoreError::Snapshot("bad signature".into()));
        }
        let version = read_u32(input).map_err(CoreError::Io)?;
        if version != VERSION {
            return Err(CoreError::Snapshot(format!("unsupported version {version}")));
        }
        let boot1_path = read_path(input).map_err(CoreError::Io)?;
        let flash_path = read_path(input).map_err(CoreError::Io)?;
        Ok(SnapshotHeader { boot1_path, flash_path })
    }
}

/// Components are written in this fixed order: memory sizes, backing
/// bytes, then per-peripheral blobs, matching spec.md §4.J.
pub const COMPONENT_ORDER: &[&str] = &[
    "memory_sizes",
    "ram_rom_bytes",
    "misc",
    "keypad",
    "usb",
    "lcd",
    "crypto",
    "serial",
    "interrupt_controller",
    "variant_peripherals",
    "nand",
    "debug_breakpoints",
    "scheduler",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        let header = SnapshotHeader { boot1_path: PathBuf::from("/tmp/boot1.img"), flash_path: PathBuf::from("/tmp/flash.img") };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let restored = SnapshotHeader::read_from(&mut cursor).unwrap();
        assert_eq!(restored.boot1_path, header.boot1_path);
        assert_eq!(restored.flash_path, header.flash_path);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut buf = vec![0u8; 8];
        buf.extend_from_slice(&VERSION.to_le_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(SnapshotHeader::read_from(&mut cursor).is_err());
    }
}
