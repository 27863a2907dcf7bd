//! Changed-range computation from CBT bitmaps
//!
//! Each bitmap byte holds the generation in which its block was last
//! written. A block belongs to an increment when it was written after the
//! previous backup's generation and no later than the snapshot's own.

use serde::{Deserialize, Serialize};

/// Kind of backup a range list supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    /// Every block must be read
    Full,
    /// Only blocks written since the previous backup
    Incremental,
}

/// Byte range on the original disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRange {
    /// First byte
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl DiskRange {
    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Answer to a changed-sectors query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedSectors {
    /// Tracked disk id
    pub disk_id: String,
    /// Snapshot id
    pub snapshot_id: String,
    /// Full or incremental
    pub backup_type: BackupType,
    /// Bytes per bitmap entry
    pub block_size: u32,
    /// Ranges to read, ascending and non-adjacent
    pub ranges: Vec<DiskRange>,
}

/// Byte ranges of blocks written in `(previous, current]`
///
/// With `previous == 0` every block qualifies, so a non-empty bitmap
/// yields exactly one range covering all of it.
pub fn fetch_increments(
    bitmap: &[u8],
    previous: u32,
    current: u32,
    block_size: u32,
) -> Vec<DiskRange> {
    let block_size = u64::from(block_size);
    if previous == 0 {
        if bitmap.is_empty() {
            return Vec::new();
        }
        return vec![DiskRange {
            offset: 0,
            length: bitmap.len() as u64 * block_size,
        }];
    }

    let qualifies = |entry: u8| previous < u32::from(entry) && u32::from(entry) <= current;
    let to_range = |start: usize, end: usize| DiskRange {
        offset: start as u64 * block_size,
        length: (end - start) as u64 * block_size,
    };

    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;
    for (index, entry) in bitmap.iter().enumerate() {
        match (qualifies(*entry), open) {
            (true, None) => open = Some(index),
            (false, Some(start)) => {
                ranges.push(to_range(start, index));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        ranges.push(to_range(start, bitmap.len()));
    }
    ranges
}
