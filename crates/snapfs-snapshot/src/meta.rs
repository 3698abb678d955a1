//! On-disk metadata: the volume metadata block, the snapshot record
//! table, and persisted extent maps.
//!
//! Layout (all little-endian):
//!
//! - Block 0: volume metadata. Magic, geometry, feature/state flags,
//!   the chain head and active pointers, and the next generation to
//!   assign.
//! - Blocks 2..2+[`RECORD_TABLE_BLOCKS`]: fixed table of 64-byte
//!   snapshot inode records. A record whose inode field is zero is a
//!   free slot. The exclude inode occupies a slot like any snapshot,
//!   distinguished by a clear `PFLAG_SNAPFILE` bit.
//! - Extent maps: each record points at a chain of map blocks holding
//!   `(logical, physical, length)` extents; the engine rewrites a map
//!   chain wholesale whenever the file's mappings change durably.

use snapfs_error::{Result, SnapError};
use snapfs_journal::TxnHandle;
use snapfs_types::{
    read_le_u32, read_le_u64, write_le_u32, write_le_u64, BlockNumber, BlockSize, Generation,
    InodeNumber, LogicalBlock,
};

pub const VOLUME_MAGIC: u32 = 0x534E_4150;
pub const MAP_MAGIC: u32 = 0x534E_4D50;
pub const META_VERSION: u32 = 1;

/// First block of the snapshot record table.
pub const RECORD_TABLE_START: u64 = 2;
pub const RECORD_TABLE_BLOCKS: u64 = 2;
pub const RECORD_SIZE: usize = 64;

// ── Volume metadata ─────────────────────────────────────────────────────────

/// The mutable head of the volume: everything the engine must find
/// again after a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeMeta {
    pub flags: u32,
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub total_blocks: u64,
    /// Newest snapshot on the chain.
    pub head: Option<InodeNumber>,
    /// Snapshot COW writes currently target.
    pub active: Option<InodeNumber>,
    /// Next generation to assign; never zero.
    pub next_generation: u64,
    pub exclude_ino: InodeNumber,
    /// Free-space floor enforced before a take.
    pub reserved_floor: u64,
}

fn opt_ino(raw: u64) -> Option<InodeNumber> {
    if raw == 0 {
        None
    } else {
        Some(InodeNumber(raw))
    }
}

impl VolumeMeta {
    pub fn encode(&self, block_size: BlockSize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size.bytes() as usize];
        write_le_u32(&mut buf, 0, VOLUME_MAGIC);
        write_le_u32(&mut buf, 4, META_VERSION);
        write_le_u32(&mut buf, 8, self.flags);
        write_le_u32(&mut buf, 12, self.blocks_per_group);
        write_le_u32(&mut buf, 16, self.block_size.bytes());
        write_le_u64(&mut buf, 24, self.total_blocks);
        write_le_u64(&mut buf, 32, self.head.map_or(0, |i| i.0));
        write_le_u64(&mut buf, 40, self.active.map_or(0, |i| i.0));
        write_le_u64(&mut buf, 48, self.next_generation);
        write_le_u64(&mut buf, 56, self.exclude_ino.0);
        write_le_u64(&mut buf, 64, self.reserved_floor);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let magic = read_le_u32(buf, 0)?;
        if magic != VOLUME_MAGIC {
            return Err(SnapError::Corruption {
                block: 0,
                detail: format!("volume magic {magic:#x}, expected {VOLUME_MAGIC:#x}"),
            });
        }
        let version = read_le_u32(buf, 4)?;
        if version != META_VERSION {
            return Err(SnapError::Corruption {
                block: 0,
                detail: format!("unsupported metadata version {version}"),
            });
        }
        let raw_bs = read_le_u32(buf, 16)?;
        let block_size = BlockSize::new(raw_bs).ok_or_else(|| SnapError::Corruption {
            block: 0,
            detail: format!("invalid block size {raw_bs}"),
        })?;
        let next_generation = read_le_u64(buf, 48)?;
        if next_generation == 0 {
            return Err(SnapError::Corruption {
                block: 0,
                detail: "generation counter is zero".into(),
            });
        }
        Ok(Self {
            flags: read_le_u32(buf, 8)?,
            block_size,
            blocks_per_group: read_le_u32(buf, 12)?,
            total_blocks: read_le_u64(buf, 24)?,
            head: opt_ino(read_le_u64(buf, 32)?),
            active: opt_ino(read_le_u64(buf, 40)?),
            next_generation,
            exclude_ino: InodeNumber(read_le_u64(buf, 56)?),
            reserved_floor: read_le_u64(buf, 64)?,
        })
    }
}

// ── Snapshot records ────────────────────────────────────────────────────────

/// One 64-byte slot of the record table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawRecord {
    pub ino: u64,
    pub generation: u64,
    pub pflags: u32,
    pub next: u64,
    pub frozen_blocks: u64,
    pub disk_blocks: u64,
    pub map_root: u64,
}

impl RawRecord {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.ino == 0
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        write_le_u64(buf, 0, self.ino);
        write_le_u64(buf, 8, self.generation);
        write_le_u32(buf, 16, self.pflags);
        write_le_u32(buf, 20, 0);
        write_le_u64(buf, 24, self.next);
        write_le_u64(buf, 32, self.frozen_blocks);
        write_le_u64(buf, 40, self.disk_blocks);
        write_le_u64(buf, 48, self.map_root);
        write_le_u64(buf, 56, 0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            ino: read_le_u64(buf, 0)?,
            generation: read_le_u64(buf, 8)?,
            pflags: read_le_u32(buf, 16)?,
            next: read_le_u64(buf, 24)?,
            frozen_blocks: read_le_u64(buf, 32)?,
            disk_blocks: read_le_u64(buf, 40)?,
            map_root: read_le_u64(buf, 48)?,
        })
    }
}

#[must_use]
pub fn record_slots(block_size: BlockSize) -> usize {
    (block_size.bytes() as usize / RECORD_SIZE) * RECORD_TABLE_BLOCKS as usize
}

#[must_use]
pub fn slot_location(block_size: BlockSize, slot: usize) -> (BlockNumber, usize) {
    let per_block = block_size.bytes() as usize / RECORD_SIZE;
    (
        BlockNumber(RECORD_TABLE_START + (slot / per_block) as u64),
        (slot % per_block) * RECORD_SIZE,
    )
}

/// Read every record slot through the transaction's view.
pub fn load_records(handle: &TxnHandle, block_size: BlockSize) -> Result<Vec<RawRecord>> {
    let mut out = Vec::with_capacity(record_slots(block_size));
    for b in 0..RECORD_TABLE_BLOCKS {
        let buf = handle.read_block(BlockNumber(RECORD_TABLE_START + b))?;
        let per_block = block_size.bytes() as usize / RECORD_SIZE;
        for s in 0..per_block {
            let rec = RawRecord::decode(&buf[s * RECORD_SIZE..(s + 1) * RECORD_SIZE])?;
            out.push(rec);
        }
    }
    Ok(out)
}

/// Stage one record slot.
pub fn store_record(
    handle: &mut TxnHandle,
    block_size: BlockSize,
    slot: usize,
    record: &RawRecord,
) -> Result<()> {
    if slot >= record_slots(block_size) {
        return Err(SnapError::Format(format!("record slot {slot} out of range")));
    }
    let (block, offset) = slot_location(block_size, slot);
    let mut buf = handle.read_block(block)?;
    record.encode_into(&mut buf[offset..offset + RECORD_SIZE]);
    handle.write_block(block, buf)
}

// ── Extent map persistence ──────────────────────────────────────────────────

const MAP_HEADER: usize = 16;
const MAP_ENTRY: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MapExtent {
    lblock: u64,
    phys: u64,
    len: u32,
}

/// A persisted map chain: where it starts, where appends go, and which
/// blocks the operation just allocated (the caller marks those excluded,
/// since map chains are engine overhead that snapshots must not copy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChain {
    pub root: BlockNumber,
    pub tail: BlockNumber,
    pub new_blocks: Vec<BlockNumber>,
}

fn coalesce(entries: &[(LogicalBlock, BlockNumber)]) -> Vec<MapExtent> {
    let mut out: Vec<MapExtent> = Vec::new();
    for &(l, p) in entries {
        if let Some(last) = out.last_mut() {
            if l.0 == last.lblock + u64::from(last.len) && p.0 == last.phys + u64::from(last.len) {
                last.len += 1;
                continue;
            }
        }
        out.push(MapExtent {
            lblock: l.0,
            phys: p.0,
            len: 1,
        });
    }
    out
}

fn entries_per_block(block_size: BlockSize) -> usize {
    (block_size.bytes() as usize - MAP_HEADER) / MAP_ENTRY
}

fn encode_map_block(
    block_size: BlockSize,
    extents: &[MapExtent],
    next: Option<BlockNumber>,
) -> Vec<u8> {
    let mut buf = vec![0u8; block_size.bytes() as usize];
    write_le_u32(&mut buf, 0, MAP_MAGIC);
    write_le_u32(&mut buf, 4, extents.len() as u32);
    write_le_u64(&mut buf, 8, next.map_or(0, |b| b.0));
    for (j, e) in extents.iter().enumerate() {
        let off = MAP_HEADER + j * MAP_ENTRY;
        write_le_u64(&mut buf, off, e.lblock);
        write_le_u64(&mut buf, off + 8, e.phys);
        write_le_u32(&mut buf, off + 16, e.len);
    }
    buf
}

fn decode_map_block(
    block_size: BlockSize,
    block: BlockNumber,
    buf: &[u8],
) -> Result<(Vec<MapExtent>, Option<BlockNumber>)> {
    if read_le_u32(buf, 0)? != MAP_MAGIC {
        return Err(SnapError::Corruption {
            block: block.0,
            detail: "bad map block magic".into(),
        });
    }
    let count = read_le_u32(buf, 4)? as usize;
    if count > entries_per_block(block_size) {
        return Err(SnapError::Corruption {
            block: block.0,
            detail: format!("map block claims {count} extents"),
        });
    }
    let mut extents = Vec::with_capacity(count);
    for j in 0..count {
        let off = MAP_HEADER + j * MAP_ENTRY;
        extents.push(MapExtent {
            lblock: read_le_u64(buf, off)?,
            phys: read_le_u64(buf, off + 8)?,
            len: read_le_u32(buf, off + 16)?,
        });
    }
    let next = match read_le_u64(buf, 8)? {
        0 => None,
        b => Some(BlockNumber(b)),
    };
    Ok((extents, next))
}

/// Persist `entries` (logical order) as a fresh map chain; `None` for
/// an empty map. Allocation goes through the caller's transaction like
/// any other engine write.
pub fn write_map(
    handle: &mut TxnHandle,
    alloc: &snapfs_alloc::Allocator,
    entries: &[(LogicalBlock, BlockNumber)],
) -> Result<Option<MapChain>> {
    let block_size = alloc.geometry().block_size;
    let extents = coalesce(entries);
    if extents.is_empty() {
        return Ok(None);
    }
    let per_block = entries_per_block(block_size);
    let nblocks = extents.len().div_ceil(per_block);

    let mut blocks = Vec::with_capacity(nblocks);
    for _ in 0..nblocks {
        handle.extend_or_restart(4)?;
        let a = alloc.alloc(handle, 1, blocks.last().copied())?;
        blocks.push(a.start);
    }

    for (i, chunk) in extents.chunks(per_block).enumerate() {
        let buf = encode_map_block(block_size, chunk, blocks.get(i + 1).copied());
        handle.extend_or_restart(2)?;
        handle.write_block(blocks[i], buf)?;
    }
    Ok(Some(MapChain {
        root: blocks[0],
        tail: blocks[nblocks - 1],
        new_blocks: blocks,
    }))
}

/// Append `entries` to an existing chain at its `tail`; fills the tail
/// block first, then grows the chain. Returns the new tail and any
/// freshly allocated map blocks.
pub fn append_map(
    handle: &mut TxnHandle,
    alloc: &snapfs_alloc::Allocator,
    tail: BlockNumber,
    entries: &[(LogicalBlock, BlockNumber)],
) -> Result<(BlockNumber, Vec<BlockNumber>)> {
    let block_size = alloc.geometry().block_size;
    let mut extents = coalesce(entries);
    if extents.is_empty() {
        return Ok((tail, Vec::new()));
    }
    let per_block = entries_per_block(block_size);

    handle.extend_or_restart(2)?;
    let buf = handle.read_block(tail)?;
    let (mut tail_extents, next) = decode_map_block(block_size, tail, &buf)?;
    if next.is_some() {
        return Err(SnapError::Corruption {
            block: tail.0,
            detail: "map tail has a successor".into(),
        });
    }

    let room = per_block - tail_extents.len();
    let into_tail: Vec<MapExtent> = extents.drain(..room.min(extents.len())).collect();
    tail_extents.extend(into_tail);

    let mut new_blocks = Vec::new();
    let overflow: Vec<&[MapExtent]> = extents.chunks(per_block).collect();
    for _ in 0..overflow.len() {
        handle.extend_or_restart(4)?;
        let a = alloc.alloc(handle, 1, Some(tail))?;
        new_blocks.push(a.start);
    }

    let buf = encode_map_block(block_size, &tail_extents, new_blocks.first().copied());
    handle.write_block(tail, buf)?;
    for (i, chunk) in overflow.iter().enumerate() {
        let buf = encode_map_block(block_size, chunk, new_blocks.get(i + 1).copied());
        handle.extend_or_restart(2)?;
        handle.write_block(new_blocks[i], buf)?;
    }
    Ok((new_blocks.last().copied().unwrap_or(tail), new_blocks))
}

/// Free an existing map chain; returns the blocks released so the
/// caller can clear their exclude bits.
pub fn free_map(
    handle: &mut TxnHandle,
    alloc: &snapfs_alloc::Allocator,
    root: Option<BlockNumber>,
) -> Result<Vec<BlockNumber>> {
    let mut freed = Vec::new();
    let mut cursor = root;
    let total = alloc.geometry().total_blocks;
    while let Some(block) = cursor {
        if freed.len() as u64 > total {
            return Err(SnapError::Corruption {
                block: block.0,
                detail: "map chain forms a cycle".into(),
            });
        }
        let buf = handle.read_block(block)?;
        let (_, next) = decode_map_block(alloc.geometry().block_size, block, &buf)?;
        cursor = next;
        handle.extend_or_restart(4)?;
        alloc.free(handle, block, 1)?;
        freed.push(block);
    }
    Ok(freed)
}

/// Decode a map chain back into per-block mappings plus its tail block.
pub fn read_map(
    handle: &TxnHandle,
    block_size: BlockSize,
    total_blocks: u64,
    root: Option<BlockNumber>,
) -> Result<(Vec<(LogicalBlock, BlockNumber)>, Option<BlockNumber>)> {
    let mut out = Vec::new();
    let mut cursor = root;
    let mut tail = None;
    let mut hops = 0u64;
    while let Some(block) = cursor {
        hops += 1;
        if hops > total_blocks {
            return Err(SnapError::Corruption {
                block: block.0,
                detail: "map chain forms a cycle".into(),
            });
        }
        let buf = handle.read_block(block)?;
        let (extents, next) = decode_map_block(block_size, block, &buf)?;
        for e in extents {
            for i in 0..u64::from(e.len) {
                out.push((LogicalBlock(e.lblock + i), BlockNumber(e.phys + i)));
            }
        }
        tail = Some(block);
        cursor = next;
    }
    Ok((out, tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_meta_round_trip() {
        let bs = BlockSize::new(1024).unwrap();
        let meta = VolumeMeta {
            flags: 0b101,
            block_size: bs,
            blocks_per_group: 64,
            total_blocks: 256,
            head: Some(InodeNumber(17)),
            active: None,
            next_generation: 5,
            exclude_ino: InodeNumber(2),
            reserved_floor: 8,
        };
        let buf = meta.encode(bs);
        assert_eq!(VolumeMeta::decode(&buf).unwrap(), meta);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let bs = BlockSize::new(1024).unwrap();
        let buf = vec![0u8; 1024];
        assert!(matches!(
            VolumeMeta::decode(&buf),
            Err(SnapError::Corruption { .. })
        ));
        let mut buf = VolumeMeta {
            flags: 0,
            block_size: bs,
            blocks_per_group: 64,
            total_blocks: 256,
            head: None,
            active: None,
            next_generation: 1,
            exclude_ino: InodeNumber(2),
            reserved_floor: 0,
        }
        .encode(bs);
        // Zero out the generation counter: never valid on disk.
        write_le_u64(&mut buf, 48, 0);
        assert!(matches!(
            VolumeMeta::decode(&buf),
            Err(SnapError::Corruption { .. })
        ));
    }

    #[test]
    fn record_round_trip_and_slots() {
        let bs = BlockSize::new(1024).unwrap();
        assert_eq!(record_slots(bs), 32);
        let (block, off) = slot_location(bs, 17);
        assert_eq!(block, BlockNumber(RECORD_TABLE_START + 1));
        assert_eq!(off, RECORD_SIZE);

        let rec = RawRecord {
            ino: 12,
            generation: 3,
            pflags: 0b11,
            next: 9,
            frozen_blocks: 256,
            disk_blocks: 40,
            map_root: 77,
        };
        let mut buf = [0u8; RECORD_SIZE];
        rec.encode_into(&mut buf);
        assert_eq!(RawRecord::decode(&buf).unwrap(), rec);
        assert!(RawRecord::default().is_free());
    }

    #[test]
    fn coalesce_merges_contiguous_mappings() {
        let entries = vec![
            (LogicalBlock(10), BlockNumber(100)),
            (LogicalBlock(11), BlockNumber(101)),
            (LogicalBlock(12), BlockNumber(102)),
            (LogicalBlock(20), BlockNumber(103)),
            // Logically adjacent but physically discontiguous.
            (LogicalBlock(21), BlockNumber(200)),
        ];
        let ext = coalesce(&entries);
        assert_eq!(ext.len(), 3);
        assert_eq!(ext[0].len, 3);
        assert_eq!(ext[1].len, 1);
        assert_eq!(ext[2].phys, 200);
    }
}
