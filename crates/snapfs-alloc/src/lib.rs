#![forbid(unsafe_code)]
//! Block allocation and file block mapping for snapfs.
//!
//! Three layers live here:
//!
//! - **Bitmap primitives**: bit-level helpers over `&[u8]` buffers,
//!   shared by the allocator and the snapshot engine's COW bitmaps.
//! - **[`Allocator`]**: per-group block bitmaps. The in-memory copy is
//!   authoritative; every mutation is mirrored to the on-disk bitmap
//!   block through the caller's transaction, with undo access taken
//!   first so [`snapfs_journal::Journal::committed_view`] keeps serving
//!   the allocation state as of the last commit.
//! - **[`InodeTable`]**: logical→physical block maps per inode. This is
//!   the mapping collaborator the snapshot engine drives: allocate on
//!   write, remap an existing block (move-on-write), contiguous run
//!   queries for shrink walks.
//!
//! Aborting a transaction that allocated would leave the in-memory
//! bitmap ahead of the device, so every mutation marks the handle via
//! [`snapfs_journal::TxnHandle::mark_side_effects`]; aborting a marked
//! handle poisons the journal and the engine fails the volume before
//! accepting further writes.

use parking_lot::{Mutex, RwLock};
use snapfs_block::BlockDevice;
use snapfs_error::{Result, SnapError};
use snapfs_journal::TxnHandle;
use snapfs_types::{BlockNumber, BlockSize, GroupNumber, InodeNumber, LogicalBlock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

// ── Bitmap primitives ───────────────────────────────────────────────────────

#[must_use]
pub fn bitmap_get(bitmap: &[u8], bit: u32) -> bool {
    let byte = (bit / 8) as usize;
    byte < bitmap.len() && bitmap[byte] & (1 << (bit % 8)) != 0
}

pub fn bitmap_set(bitmap: &mut [u8], bit: u32) {
    let byte = (bit / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] |= 1 << (bit % 8);
    }
}

pub fn bitmap_clear(bitmap: &mut [u8], bit: u32) {
    let byte = (bit / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] &= !(1 << (bit % 8));
    }
}

/// Count clear bits among the first `nbits`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], nbits: u32) -> u32 {
    let mut free = 0;
    for bit in 0..nbits {
        if !bitmap_get(bitmap, bit) {
            free += 1;
        }
    }
    free
}

/// First clear bit at or after `start`, within the first `nbits`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], nbits: u32, start: u32) -> Option<u32> {
    (start..nbits).find(|&bit| !bitmap_get(bitmap, bit))
}

/// First run of `count` clear bits within the first `nbits`.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], nbits: u32, count: u32) -> Option<u32> {
    if count == 0 || count > nbits {
        return None;
    }
    let mut run_start = None;
    let mut run_len = 0;
    for bit in 0..nbits {
        if bitmap_get(bitmap, bit) {
            run_start = None;
            run_len = 0;
        } else {
            if run_start.is_none() {
                run_start = Some(bit);
            }
            run_len += 1;
            if run_len == count {
                return run_start;
            }
        }
    }
    None
}

/// Length of the run of bits equal to `value` starting at `start`,
/// capped at `max` and by `nbits`.
#[must_use]
pub fn bitmap_run_len(bitmap: &[u8], nbits: u32, start: u32, value: bool, max: u32) -> u32 {
    let mut len = 0;
    while len < max && start + len < nbits && bitmap_get(bitmap, start + len) == value {
        len += 1;
    }
    len
}

/// `dst = alloc AND NOT mask`, the COW bitmap derivation.
pub fn bitmap_and_not(dst: &mut [u8], alloc: &[u8], mask: &[u8]) {
    for (i, d) in dst.iter_mut().enumerate() {
        let a = alloc.get(i).copied().unwrap_or(0);
        let m = mask.get(i).copied().unwrap_or(0);
        *d = a & !m;
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// The volume metadata block: first block of the volume.
pub const VOLUME_META_BLOCK: BlockNumber = BlockNumber(0);

/// Offset of the block bitmap within every group.
const BITMAP_OFFSET: u64 = 1;

/// Static shape of a volume: block size and group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsGeometry {
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub total_blocks: u64,
    pub group_count: u32,
}

impl FsGeometry {
    pub fn new(block_size: BlockSize, blocks_per_group: u32, total_blocks: u64) -> Result<Self> {
        if blocks_per_group < 8 || blocks_per_group > block_size.bits_per_block() {
            return Err(SnapError::Format(format!(
                "blocks_per_group {blocks_per_group} outside 8..={}",
                block_size.bits_per_block()
            )));
        }
        if total_blocks < u64::from(blocks_per_group) {
            return Err(SnapError::Format(format!(
                "volume of {total_blocks} blocks smaller than one group"
            )));
        }
        let group_count = total_blocks.div_ceil(u64::from(blocks_per_group));
        let group_count = u32::try_from(group_count)
            .map_err(|_| SnapError::Format("group count exceeds u32".into()))?;
        Ok(Self {
            block_size,
            blocks_per_group,
            total_blocks,
            group_count,
        })
    }

    /// Blocks in `group` (the last group may be partial).
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let first = u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(first);
        remaining.min(u64::from(self.blocks_per_group)) as u32
    }

    #[must_use]
    pub fn group_of(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let group = (block.0 / u64::from(self.blocks_per_group)) as u32;
        let rel = (block.0 % u64::from(self.blocks_per_group)) as u32;
        (GroupNumber(group), rel)
    }

    #[must_use]
    pub fn absolute(&self, group: GroupNumber, rel: u32) -> BlockNumber {
        BlockNumber(u64::from(group.0) * u64::from(self.blocks_per_group) + u64::from(rel))
    }

    /// On-disk block holding `group`'s allocation bitmap.
    #[must_use]
    pub fn block_bitmap_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(u64::from(group.0) * u64::from(self.blocks_per_group) + BITMAP_OFFSET)
    }

    /// If `block` is some group's allocation bitmap, which group.
    #[must_use]
    pub fn bitmap_group_of(&self, block: BlockNumber) -> Option<GroupNumber> {
        let (group, rel) = self.group_of(block);
        (u64::from(rel) == BITMAP_OFFSET && group.0 < self.group_count).then_some(group)
    }

    /// Blocks the volume reserves in `group` for its own structures.
    #[must_use]
    pub fn reserved_in_group(&self, group: GroupNumber) -> Vec<u32> {
        if group.0 == 0 {
            vec![0, BITMAP_OFFSET as u32]
        } else {
            vec![BITMAP_OFFSET as u32]
        }
    }
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// A contiguous allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    pub start: BlockNumber,
    pub count: u32,
}

struct GroupState {
    bitmap: Vec<u8>,
    free: u32,
}

/// Per-group block allocator with journaled on-disk mirroring.
pub struct Allocator {
    geo: FsGeometry,
    groups: Vec<Mutex<GroupState>>,
}

impl Allocator {
    /// Write fresh allocation bitmaps to the device: volume structures
    /// and `extra_reserved` marked allocated, everything else free.
    pub fn format(
        dev: &Arc<dyn BlockDevice>,
        geo: &FsGeometry,
        extra_reserved: &[BlockNumber],
    ) -> Result<()> {
        let bs = geo.block_size.bytes() as usize;
        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let nbits = geo.blocks_in_group(group);
            let mut bitmap = vec![0u8; bs];
            // Bits past the end of a partial group stay allocated.
            for bit in nbits..geo.block_size.bits_per_block() {
                bitmap_set(&mut bitmap, bit);
            }
            for rel in geo.reserved_in_group(group) {
                bitmap_set(&mut bitmap, rel);
            }
            for &b in extra_reserved {
                let (bg, rel) = geo.group_of(b);
                if bg == group {
                    bitmap_set(&mut bitmap, rel);
                }
            }
            dev.write_block(geo.block_bitmap_block(group), &bitmap)?;
        }
        dev.sync()?;
        Ok(())
    }

    /// Load allocation state from the on-disk bitmaps.
    pub fn load(dev: &Arc<dyn BlockDevice>, geo: FsGeometry) -> Result<Self> {
        let mut groups = Vec::with_capacity(geo.group_count as usize);
        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let bitmap = dev.read_block(geo.block_bitmap_block(group))?.into_vec();
            let free = bitmap_count_free(&bitmap, geo.blocks_in_group(group));
            groups.push(Mutex::new(GroupState { bitmap, free }));
        }
        Ok(Self { geo, groups })
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.groups.iter().map(|g| u64::from(g.lock().free)).sum()
    }

    #[must_use]
    pub fn is_allocated(&self, block: BlockNumber) -> bool {
        let (group, rel) = self.geo.group_of(block);
        match self.groups.get(group.0 as usize) {
            Some(g) => bitmap_get(&g.lock().bitmap, rel),
            None => false,
        }
    }

    /// The in-memory allocation bitmap of `group` (current, not committed).
    #[must_use]
    pub fn bitmap_copy(&self, group: GroupNumber) -> Option<Vec<u8>> {
        self.groups.get(group.0 as usize).map(|g| g.lock().bitmap.clone())
    }

    /// Allocate `count` contiguous blocks, preferring the goal's group.
    pub fn alloc(
        &self,
        handle: &mut TxnHandle,
        count: u32,
        goal: Option<BlockNumber>,
    ) -> Result<BlockAlloc> {
        if count == 0 {
            return Err(SnapError::Format("cannot allocate 0 blocks".into()));
        }
        let goal_group = goal.map_or(GroupNumber(0), |b| self.geo.group_of(b).0);

        if let Some(alloc) = self.try_group(handle, goal_group, count, goal)? {
            return Ok(alloc);
        }
        for delta in 1..=self.geo.group_count {
            for dir in [1i64, -1i64] {
                let g = i64::from(goal_group.0) + dir * i64::from(delta);
                if g >= 0 && (g as u64) < u64::from(self.geo.group_count) {
                    if let Some(alloc) = self.try_group(handle, GroupNumber(g as u32), count, None)?
                    {
                        return Ok(alloc);
                    }
                }
            }
        }
        Err(SnapError::NoSpace)
    }

    fn try_group(
        &self,
        handle: &mut TxnHandle,
        group: GroupNumber,
        count: u32,
        goal: Option<BlockNumber>,
    ) -> Result<Option<BlockAlloc>> {
        let Some(slot) = self.groups.get(group.0 as usize) else {
            return Ok(None);
        };
        let mut gs = slot.lock();
        if gs.free < count {
            return Ok(None);
        }
        let nbits = self.geo.blocks_in_group(group);
        let start = goal.map_or(0, |b| {
            let (g, rel) = self.geo.group_of(b);
            if g == group { rel } else { 0 }
        });

        let found = if count == 1 {
            bitmap_find_free(&gs.bitmap, nbits, start)
                .or_else(|| bitmap_find_free(&gs.bitmap, nbits, 0))
                .map(|bit| (bit, 1))
        } else {
            bitmap_find_contiguous(&gs.bitmap, nbits, count).map(|bit| (bit, count))
        };
        let Some((rel, count)) = found else {
            return Ok(None);
        };

        for bit in rel..rel + count {
            bitmap_set(&mut gs.bitmap, bit);
        }
        gs.free -= count;
        let staged = gs.bitmap.clone();
        drop(gs);

        // The in-memory bitmap is now ahead of the device until this
        // transaction commits.
        handle.mark_side_effects();
        let bitmap_block = self.geo.block_bitmap_block(group);
        handle.get_undo_access(bitmap_block)?;
        handle.write_block(bitmap_block, staged)?;

        let start = self.geo.absolute(group, rel);
        trace!(%start, count, %group, "alloc");
        Ok(Some(BlockAlloc { start, count }))
    }

    /// Free `count` contiguous blocks; double frees are corruption.
    pub fn free(&self, handle: &mut TxnHandle, start: BlockNumber, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let (group, rel) = self.geo.group_of(start);
        let end_rel = rel
            .checked_add(count)
            .filter(|&e| e <= self.geo.blocks_in_group(group))
            .ok_or_else(|| SnapError::Format(format!("free [{start}, +{count}) crosses a group")))?;
        let reserved = self.geo.reserved_in_group(group);
        for bit in rel..end_rel {
            if reserved.contains(&bit) {
                return Err(SnapError::Corruption {
                    block: self.geo.absolute(group, bit).0,
                    detail: "attempt to free a reserved volume block".into(),
                });
            }
        }

        let slot = self
            .groups
            .get(group.0 as usize)
            .ok_or_else(|| SnapError::Format(format!("{group} out of range")))?;
        let mut gs = slot.lock();
        for bit in rel..end_rel {
            if !bitmap_get(&gs.bitmap, bit) {
                return Err(SnapError::Corruption {
                    block: self.geo.absolute(group, bit).0,
                    detail: "double free: block already free in bitmap".into(),
                });
            }
        }
        for bit in rel..end_rel {
            bitmap_clear(&mut gs.bitmap, bit);
        }
        gs.free += count;
        let staged = gs.bitmap.clone();
        drop(gs);

        handle.mark_side_effects();
        let bitmap_block = self.geo.block_bitmap_block(group);
        handle.get_undo_access(bitmap_block)?;
        handle.write_block(bitmap_block, staged)?;
        debug!(%start, count, "freed blocks");
        Ok(())
    }
}

// ── File block maps ─────────────────────────────────────────────────────────

/// What lives at a file's logical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedRun {
    /// `count` logically and physically contiguous mapped blocks.
    Mapped { start: BlockNumber, count: u64 },
    /// `count` unmapped logical blocks before the next mapping (or the
    /// probe limit).
    Hole { count: u64 },
}

#[derive(Default)]
struct FileMap {
    map: BTreeMap<u64, BlockNumber>,
}

/// Logical→physical block maps, one per inode.
///
/// Purely in-memory; the snapshot engine persists the maps it cares
/// about itself.
#[derive(Default)]
pub struct InodeTable {
    files: RwLock<HashMap<InodeNumber, FileMap>>,
}

impl InodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, ino: InodeNumber) -> Result<()> {
        let mut files = self.files.write();
        if files.contains_key(&ino) {
            return Err(SnapError::InvalidState(format!("{ino} already exists")));
        }
        files.insert(ino, FileMap::default());
        Ok(())
    }

    #[must_use]
    pub fn exists(&self, ino: InodeNumber) -> bool {
        self.files.read().contains_key(&ino)
    }

    /// Number of blocks mapped by the file.
    #[must_use]
    pub fn block_count(&self, ino: InodeNumber) -> u64 {
        self.files
            .read()
            .get(&ino)
            .map_or(0, |f| f.map.len() as u64)
    }

    #[must_use]
    pub fn lookup(&self, ino: InodeNumber, lblock: LogicalBlock) -> Option<BlockNumber> {
        self.files.read().get(&ino)?.map.get(&lblock.0).copied()
    }

    /// Describe the run starting at `lblock`, capped at `max` blocks.
    pub fn run_at(&self, ino: InodeNumber, lblock: LogicalBlock, max: u64) -> Result<MappedRun> {
        if max == 0 {
            return Err(SnapError::Format("run_at with max 0".into()));
        }
        let files = self.files.read();
        let file = files
            .get(&ino)
            .ok_or_else(|| SnapError::NotFound(ino.to_string()))?;
        match file.map.get(&lblock.0) {
            Some(&first) => {
                let mut count = 1u64;
                while count < max {
                    match file.map.get(&(lblock.0 + count)) {
                        Some(&phys) if phys.0 == first.0 + count => count += 1,
                        _ => break,
                    }
                }
                Ok(MappedRun::Mapped {
                    start: first,
                    count,
                })
            }
            None => {
                let next = file
                    .map
                    .range(lblock.0..lblock.0 + max)
                    .next()
                    .map(|(&l, _)| l);
                let count = next.map_or(max, |l| l - lblock.0);
                Ok(MappedRun::Hole { count })
            }
        }
    }

    /// Map `count` fresh blocks at `lblock`, allocating near `goal`.
    ///
    /// The range must be entirely unmapped.
    pub fn map_new(
        &self,
        handle: &mut TxnHandle,
        alloc: &Allocator,
        ino: InodeNumber,
        lblock: LogicalBlock,
        count: u32,
        goal: Option<BlockNumber>,
    ) -> Result<BlockAlloc> {
        {
            let files = self.files.read();
            let file = files
                .get(&ino)
                .ok_or_else(|| SnapError::NotFound(ino.to_string()))?;
            if file
                .map
                .range(lblock.0..lblock.0 + u64::from(count))
                .next()
                .is_some()
            {
                return Err(SnapError::InvalidState(format!(
                    "{ino} already maps part of [{lblock}, +{count})"
                )));
            }
        }
        let allocated = alloc.alloc(handle, count, goal)?;
        let mut files = self.files.write();
        let file = files
            .get_mut(&ino)
            .ok_or_else(|| SnapError::NotFound(ino.to_string()))?;
        for i in 0..u64::from(count) {
            file.map
                .insert(lblock.0 + i, BlockNumber(allocated.start.0 + i));
        }
        Ok(allocated)
    }

    /// Map already-allocated physical blocks into the file (move-on-write).
    ///
    /// Positions that are already mapped are skipped; the number of
    /// blocks actually taken over is returned.
    pub fn map_existing(
        &self,
        ino: InodeNumber,
        lblock: LogicalBlock,
        phys: BlockNumber,
        count: u64,
    ) -> Result<u64> {
        let mut files = self.files.write();
        let file = files
            .get_mut(&ino)
            .ok_or_else(|| SnapError::NotFound(ino.to_string()))?;
        let mut moved = 0;
        for i in 0..count {
            if let std::collections::btree_map::Entry::Vacant(e) = file.map.entry(lblock.0 + i) {
                e.insert(BlockNumber(phys.0 + i));
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Drop mappings in `[lblock, lblock + count)` without freeing the
    /// physical blocks; returns what was unmapped.
    pub fn unmap(
        &self,
        ino: InodeNumber,
        lblock: LogicalBlock,
        count: u64,
    ) -> Result<Vec<(LogicalBlock, BlockNumber)>> {
        let mut files = self.files.write();
        let file = files
            .get_mut(&ino)
            .ok_or_else(|| SnapError::NotFound(ino.to_string()))?;
        let keys: Vec<u64> = file
            .map
            .range(lblock.0..lblock.0 + count)
            .map(|(&l, _)| l)
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for l in keys {
            if let Some(phys) = file.map.remove(&l) {
                out.push((LogicalBlock(l), phys));
            }
        }
        Ok(out)
    }

    /// Remove the file entirely; returns every mapping it held.
    pub fn remove(&self, ino: InodeNumber) -> Result<Vec<(LogicalBlock, BlockNumber)>> {
        let mut files = self.files.write();
        let file = files
            .remove(&ino)
            .ok_or_else(|| SnapError::NotFound(ino.to_string()))?;
        Ok(file
            .map
            .into_iter()
            .map(|(l, p)| (LogicalBlock(l), p))
            .collect())
    }

    /// All mappings of `ino`, logical order.
    pub fn mappings(&self, ino: InodeNumber) -> Result<Vec<(LogicalBlock, BlockNumber)>> {
        let files = self.files.read();
        let file = files
            .get(&ino)
            .ok_or_else(|| SnapError::NotFound(ino.to_string()))?;
        Ok(file
            .map
            .iter()
            .map(|(&l, &p)| (LogicalBlock(l), p))
            .collect())
    }

    /// Bulk-install mappings, used when loading persisted maps.
    pub fn install(
        &self,
        ino: InodeNumber,
        entries: impl IntoIterator<Item = (LogicalBlock, BlockNumber)>,
    ) -> Result<()> {
        let mut files = self.files.write();
        let file = files.entry(ino).or_default();
        for (l, p) in entries {
            file.map.insert(l.0, p);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapfs_block::ByteBlockDevice;
    use snapfs_block::MemByteDevice;
    use snapfs_journal::Journal;

    fn setup() -> (Arc<Journal>, Allocator) {
        let bs = BlockSize::new(1024).unwrap();
        // 4 groups of 64 blocks.
        let dev: Arc<dyn BlockDevice> =
            Arc::new(ByteBlockDevice::new(MemByteDevice::new(256 * 1024), bs).unwrap());
        let geo = FsGeometry::new(bs, 64, 256).unwrap();
        Allocator::format(&dev, &geo, &[]).unwrap();
        let journal = Journal::new(Arc::clone(&dev), 128);
        let alloc = Allocator::load(&dev, geo).unwrap();
        (journal, alloc)
    }

    #[test]
    fn bitmap_primitives() {
        let mut bm = vec![0u8; 8];
        bitmap_set(&mut bm, 3);
        bitmap_set(&mut bm, 4);
        bitmap_set(&mut bm, 5);
        assert!(bitmap_get(&bm, 4));
        assert!(!bitmap_get(&bm, 6));
        assert_eq!(bitmap_count_free(&bm, 64), 61);
        assert_eq!(bitmap_find_free(&bm, 64, 3), Some(6));
        assert_eq!(bitmap_find_contiguous(&bm, 64, 10), Some(6));
        assert_eq!(bitmap_run_len(&bm, 64, 3, true, 16), 3);
        assert_eq!(bitmap_run_len(&bm, 64, 3, true, 2), 2);
        bitmap_clear(&mut bm, 4);
        assert!(!bitmap_get(&bm, 4));
    }

    #[test]
    fn and_not_masks_exclusions() {
        let alloc = vec![0b1111_0000u8];
        let mask = vec![0b0101_0101u8];
        let mut dst = vec![0u8; 1];
        bitmap_and_not(&mut dst, &alloc, &mask);
        assert_eq!(dst[0], 0b1010_0000);
    }

    #[test]
    fn geometry_partial_last_group() {
        let bs = BlockSize::new(1024).unwrap();
        let geo = FsGeometry::new(bs, 64, 200).unwrap();
        assert_eq!(geo.group_count, 4);
        assert_eq!(geo.blocks_in_group(GroupNumber(3)), 8);
        assert_eq!(geo.group_of(BlockNumber(130)), (GroupNumber(2), 2));
        assert_eq!(geo.absolute(GroupNumber(2), 2), BlockNumber(130));
    }

    #[test]
    fn alloc_respects_reserved_and_persists_through_txn() {
        let (journal, alloc) = setup();
        let mut h = journal.begin(16).unwrap();
        let a = alloc.alloc(&mut h, 4, None).unwrap();
        // Block 0 (volume meta) and block 1 (bitmap) are reserved.
        assert!(a.start.0 >= 2);
        assert!(alloc.is_allocated(a.start));
        h.commit().unwrap();

        // A reload from disk sees the same allocation.
        let reloaded = Allocator::load(journal.device(), *alloc.geometry()).unwrap();
        assert!(reloaded.is_allocated(a.start));
        assert_eq!(reloaded.free_blocks(), alloc.free_blocks());
    }

    #[test]
    fn committed_view_of_bitmap_lags_staged_alloc() {
        let (journal, alloc) = setup();
        let bitmap_block = alloc.geometry().block_bitmap_block(GroupNumber(0));
        let before = journal.committed_view(bitmap_block).unwrap();

        let mut h = journal.begin(16).unwrap();
        let a = alloc.alloc(&mut h, 1, None).unwrap();
        let (_, rel) = alloc.geometry().group_of(a.start);

        // Still clear in the committed view while the txn is open.
        let committed = journal.committed_view(bitmap_block).unwrap();
        assert_eq!(committed, before);
        assert!(!bitmap_get(&committed, rel));
        h.commit().unwrap();
        assert!(bitmap_get(&journal.committed_view(bitmap_block).unwrap(), rel));
    }

    #[test]
    fn double_free_is_corruption() {
        let (journal, alloc) = setup();
        let mut h = journal.begin(16).unwrap();
        let a = alloc.alloc(&mut h, 2, None).unwrap();
        alloc.free(&mut h, a.start, 2).unwrap();
        let err = alloc.free(&mut h, a.start, 2).unwrap_err();
        assert!(matches!(err, SnapError::Corruption { .. }));
        h.commit().unwrap();
    }

    #[test]
    fn freeing_reserved_blocks_is_corruption() {
        let (journal, alloc) = setup();
        let mut h = journal.begin(16).unwrap();
        assert!(matches!(
            alloc.free(&mut h, BlockNumber(1), 1).unwrap_err(),
            SnapError::Corruption { .. }
        ));
        h.abort();
    }

    #[test]
    fn inode_map_runs_and_moves() {
        let (journal, alloc) = setup();
        let table = InodeTable::new();
        let ino = InodeNumber(10);
        table.create(ino).unwrap();

        let mut h = journal.begin(32).unwrap();
        let a = table
            .map_new(&mut h, &alloc, ino, LogicalBlock(100), 4, None)
            .unwrap();
        assert_eq!(a.count, 4);

        match table.run_at(ino, LogicalBlock(100), 16).unwrap() {
            MappedRun::Mapped { start, count } => {
                assert_eq!(start, a.start);
                assert_eq!(count, 4);
            }
            MappedRun::Hole { .. } => panic!("expected mapped run"),
        }
        match table.run_at(ino, LogicalBlock(96), 16).unwrap() {
            MappedRun::Hole { count } => assert_eq!(count, 4),
            MappedRun::Mapped { .. } => panic!("expected hole"),
        }

        // Move-on-write: adopt an existing physical range; the already
        // mapped position is skipped.
        let moved = table
            .map_existing(ino, LogicalBlock(103), BlockNumber(200), 3)
            .unwrap();
        assert_eq!(moved, 2);
        assert_eq!(table.lookup(ino, LogicalBlock(104)), Some(BlockNumber(201)));

        let unmapped = table.unmap(ino, LogicalBlock(100), 2).unwrap();
        assert_eq!(unmapped.len(), 2);
        assert_eq!(table.lookup(ino, LogicalBlock(100)), None);
        h.commit().unwrap();
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let (journal, alloc) = setup();
        let mut h = journal.begin(64).unwrap();
        // 256 blocks minus reserved; a huge contiguous request must fail.
        let err = alloc.alloc(&mut h, 65, None).unwrap_err();
        assert!(matches!(err, SnapError::NoSpace));
        h.abort();
    }
}
