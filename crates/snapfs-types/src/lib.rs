#![forbid(unsafe_code)]
//! Core types shared across the snapfs workspace.
//!
//! Identifier newtypes keep block numbers, file-logical block indices,
//! inode numbers and transaction ids from being mixed up at call sites.
//! The flag types model snapshot status as orthogonal booleans with a
//! small persistent subset, and the byte helpers are the single codec
//! used for every on-disk structure.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Identifier newtypes ─────────────────────────────────────────────────────

/// Absolute block number on the volume (zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Block index within a file's logical address space.
///
/// Snapshot files address the whole volume shifted by a fixed reserved
/// region; see [`snapshot_iblock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

/// Inode number (1-based; 0 is "no inode" on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Snapshot generation number.
///
/// Strictly increasing across takes; zero is never assigned so that a
/// zeroed record is recognizably "no snapshot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

/// Journal transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lblock {}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inode {}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen {}", self.0)
    }
}

// ── Block size ──────────────────────────────────────────────────────────────

/// Validated block size: a power of two between 1 KiB and 64 KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN: u32 = 1024;
    pub const MAX: u32 = 65536;

    /// Validate a raw byte count as a block size.
    #[must_use]
    pub fn new(bytes: u32) -> Option<Self> {
        if bytes.is_power_of_two() && (Self::MIN..=Self::MAX).contains(&bytes) {
            Some(Self(bytes))
        } else {
            None
        }
    }

    #[must_use]
    pub fn bytes(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn bytes_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Bits one block of bitmap can track.
    #[must_use]
    pub fn bits_per_block(self) -> u32 {
        self.0 * 8
    }
}

// ── Snapshot flags ──────────────────────────────────────────────────────────

/// Persistent per-snapshot flag bits as stored in the inode record.
pub const PFLAG_SNAPFILE: u32 = 1 << 0;
pub const PFLAG_DELETED: u32 = 1 << 1;
pub const PFLAG_SHRUNK: u32 = 1 << 2;
pub const PFLAG_ENABLED: u32 = 1 << 3;

/// Volume feature and state flag bits stored in the volume metadata block.
pub const VFLAG_HAS_SNAPSHOT: u32 = 1 << 0;
pub const VFLAG_IS_SNAPSHOT: u32 = 1 << 1;
pub const VFLAG_EXCLUDE_BITMAP: u32 = 1 << 2;
/// Set when an inconsistency was repaired forward; cleared by an offline check.
pub const VFLAG_FIX_EXCLUDE: u32 = 1 << 3;

/// Snapshot status, one boolean per orthogonal fact.
///
/// Only `deleted`, `shrunk` and `enabled` persist; the rest are derived
/// from the chain and the active pointer when the volume is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFlags {
    /// Linked on the snapshot chain.
    pub on_list: bool,
    /// The snapshot COW writes currently target.
    pub active: bool,
    /// Mountable for read by the host.
    pub enabled: bool,
    /// Deleted, but an older live snapshot still reads through it.
    pub in_use: bool,
    /// Marked for deletion; blocks reclaimed by the cleanup pass.
    pub deleted: bool,
    /// Cleanup freed every block not still needed for read-through.
    pub shrunk: bool,
}

impl SnapshotFlags {
    #[must_use]
    pub fn persistent_bits(self) -> u32 {
        let mut bits = PFLAG_SNAPFILE;
        if self.deleted {
            bits |= PFLAG_DELETED;
        }
        if self.shrunk {
            bits |= PFLAG_SHRUNK;
        }
        if self.enabled {
            bits |= PFLAG_ENABLED;
        }
        bits
    }

    #[must_use]
    pub fn from_persistent_bits(bits: u32) -> Self {
        Self {
            deleted: bits & PFLAG_DELETED != 0,
            shrunk: bits & PFLAG_SHRUNK != 0,
            enabled: bits & PFLAG_ENABLED != 0,
            ..Self::default()
        }
    }

    /// A snapshot that nothing references anymore and cleanup may remove.
    #[must_use]
    pub fn removable(self) -> bool {
        self.deleted && !self.in_use && !self.active && !self.enabled
    }
}

// ── Snapshot address space ──────────────────────────────────────────────────

/// Logical blocks reserved at the start of every snapshot file for the
/// engine's own metadata (inode record shadow, map spill, scratch).
pub const SNAPSHOT_META_BLOCKS: u64 = 8;

/// The logical block inside a snapshot file that shadows volume `block`.
#[must_use]
pub fn snapshot_iblock(block: BlockNumber) -> LogicalBlock {
    LogicalBlock(SNAPSHOT_META_BLOCKS + block.0)
}

/// Inverse of [`snapshot_iblock`]; `None` for the reserved region.
#[must_use]
pub fn snapshot_block_of(iblock: LogicalBlock) -> Option<BlockNumber> {
    iblock.0.checked_sub(SNAPSHOT_META_BLOCKS).map(BlockNumber)
}

// ── Group arithmetic ────────────────────────────────────────────────────────

/// Group that contains `block`, given blocks per group.
#[must_use]
pub fn block_to_group(blocks_per_group: u32, block: BlockNumber) -> GroupNumber {
    debug_assert!(blocks_per_group > 0);
    GroupNumber((block.0 / u64::from(blocks_per_group)) as u32)
}

/// First block of `group`.
#[must_use]
pub fn group_first_block(blocks_per_group: u32, group: GroupNumber) -> BlockNumber {
    BlockNumber(u64::from(group.0) * u64::from(blocks_per_group))
}

// ── Byte codecs ─────────────────────────────────────────────────────────────

/// Failure to decode an on-disk structure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("truncated structure: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        offset: usize,
        need: usize,
        have: usize,
    },
    #[error("bad magic: expected {expected:#x}, found {found:#x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("invalid field value: {0}")]
    Invalid(String),
}

/// Borrow `len` bytes at `offset`, or report exactly what was missing.
pub fn ensure_slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::Truncated {
        offset,
        need: len,
        have: buf.len(),
    })?;
    buf.get(offset..end).ok_or(ParseError::Truncated {
        offset,
        need: len,
        have: buf.len(),
    })
}

pub fn read_le_u16(buf: &[u8], offset: usize) -> Result<u16, ParseError> {
    let s = ensure_slice(buf, offset, 2)?;
    Ok(u16::from_le_bytes([s[0], s[1]]))
}

pub fn read_le_u32(buf: &[u8], offset: usize) -> Result<u32, ParseError> {
    let s = ensure_slice(buf, offset, 4)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

pub fn read_le_u64(buf: &[u8], offset: usize) -> Result<u64, ParseError> {
    let s = ensure_slice(buf, offset, 8)?;
    Ok(u64::from_le_bytes([
        s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
    ]))
}

/// Writers panic on short buffers: layouts are fixed and sized by the
/// caller, so a short buffer is a programming error, not an I/O condition.
pub fn write_le_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn write_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_le_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
