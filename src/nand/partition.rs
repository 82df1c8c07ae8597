//! Partition layout for the two addressing schemes (spec.md §4.E "Partition
//! layout"). Ported from `flash_partition_offset` / `flash_get_partitions`.

use super::ChipMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassicPartition {
    Manuf = 0,
    Boot2 = 1,
    Bootdata = 2,
    Diags = 3,
    Filesystem = 4,
}

const CLASSIC_OFFSETS: [usize; 5] = [0, 0x4200, 0x15a800, 0x16b000, 0x210000];

/// Classic/CX: a small offset table at fixed locations in the
/// manufacturing page yields `{Manuf, Boot2, Bootdata, Diags, Filesystem}`.
pub fn classic_partition_offset(p: ClassicPartition) -> u64 {
    CLASSIC_OFFSETS[p as usize] as u64
}

#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub name: &'static str,
    pub offset: u64,
    pub size: u64,
}

pub fn classic_partitions(metrics: ChipMetrics) -> Vec<PartitionInfo> {
    const NAMES: [&str; 5] = ["Manufacturing", "Boot2", "Bootdata", "Diags", "Filesystem"];
    let total = metrics.total_size();
    let mut out = Vec::with_capacity(5);
    for i in 0..5 {
        let offset = CLASSIC_OFFSETS[i] as u64;
        let size = if i + 1 < 5 { CLASSIC_OFFSETS[i + 1] as u64 - offset } else { total.saturating_sub(offset) };
        out.push(PartitionInfo { name: NAMES[i], offset, size });
    }
    out
}

struct Cx2PartSpec {
    name: &'static str,
    start_block: u32,
    end_block: Option<u32>,
}

/// Newer SoC: block-aligned fixed schedule (spec.md §4.E).
const CX2_PARTS: [Cx2PartSpec; 12] = [
    Cx2PartSpec { name: "Manufacturing", start_block: 0, end_block: Some(0) },
    Cx2PartSpec { name: "Bootloader", start_block: 1, end_block: Some(4) },
    Cx2PartSpec { name: "PTT Data", start_block: 5, end_block: Some(5) },
    Cx2PartSpec { name: "DevCert", start_block: 7, end_block: Some(7) },
    Cx2PartSpec { name: "OS Loader", start_block: 8, end_block: Some(10) },
    Cx2PartSpec { name: "Installer", start_block: 11, end_block: Some(18) },
    Cx2PartSpec { name: "Other Installer", start_block: 19, end_block: Some(26) },
    Cx2PartSpec { name: "OS Data", start_block: 27, end_block: Some(28) },
    Cx2PartSpec { name: "Diags", start_block: 29, end_block: Some(33) },
    Cx2PartSpec { name: "OS File", start_block: 34, end_block: Some(113) },
    Cx2PartSpec { name: "Logging", start_block: 114, end_block: Some(200) },
    Cx2PartSpec { name: "Filesystem", start_block: 201, end_block: None },
];

pub fn cx2_partitions(metrics: ChipMetrics) -> Vec<PartitionInfo> {
    let block_size = metrics.block_size() as u64;
    let max_block = (metrics.num_pages / metrics.pages_per_block()) as u32;
    let total = metrics.total_size();
    CX2_PARTS
        .iter()
        .map(|p| {
            let offset = p.start_block as u64 * block_size;
            let end = p.end_block.unwrap_or(max_block.saturating_sub(1));
            let mut size = (end - p.start_block + 1) as u64 * block_size;
            if offset + size > total {
                size = total.saturating_sub(offset);
            }
            PartitionInfo { name: p.name, offset, size }
        })
        .collect()
}

pub fn partitions(metrics: ChipMetrics) -> Vec<PartitionInfo> {
    if metrics.is_large_page() {
        cx2_partitions(metrics)
    } else {
        classic_partitions(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::{CHIP_LARGE_PAGE, CHIP_SMALL_PAGE};

    #[test]
    fn classic_partitions_sum_to_total_minus_gaps() {
        let parts = classic_partitions(CHIP_SMALL_PAGE);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].name, "Manufacturing");
        assert_eq!(parts[4].name, "Filesystem");
        assert_eq!(parts[4].offset, 0x210000);
    }

    #[test]
    fn cx2_filesystem_partition_covers_rest_of_nand() {
        let parts = cx2_partitions(CHIP_LARGE_PAGE);
        let fs = parts.last().unwrap();
        assert_eq!(fs.name, "Filesystem");
        assert!(fs.offset + fs.size <= CHIP_LARGE_PAGE.total_size());
    }
}
