//! Lifecycle control: formatting and loading volumes, and driving
//! snapshots through create, take, enable, disable, delete and the
//! cleanup pass.
//!
//! Everything here runs under the engine's lifecycle mutex, so chain
//! surgery never races itself. `take` additionally freezes the journal
//! and commits the whole frozen image in one transaction, which is what
//! makes it atomic: a crash mid-take leaves a created-but-never-taken
//! snapshot that the next load quietly removes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use snapfs_alloc::{
    bitmap_and_not, bitmap_count_free, bitmap_get, Allocator, FsGeometry, InodeTable,
    VOLUME_META_BLOCK,
};
use snapfs_block::BlockDevice;
use snapfs_error::{Result, SnapError};
use snapfs_journal::{Journal, TxnHandle};
use snapfs_types::{
    snapshot_block_of, snapshot_iblock, BlockNumber, BlockSize, Generation, GroupNumber,
    InodeNumber, LogicalBlock, SnapshotFlags, PFLAG_SNAPFILE, SNAPSHOT_META_BLOCKS,
    VFLAG_EXCLUDE_BITMAP, VFLAG_HAS_SNAPSHOT, VFLAG_IS_SNAPSHOT,
};
use tracing::{debug, info, warn};

use crate::bitmap::{CowBitmapCache, ExcludeBitmaps};
use crate::list::{SnapState, SnapshotList, SnapshotRecord};
use crate::meta::{self, RawRecord, VolumeMeta, RECORD_TABLE_BLOCKS, RECORD_TABLE_START};
use crate::store::PendingCow;
use crate::{EngineConfig, SnapshotEngine, EXCLUDE_INODE};

/// Shape of a volume to format.
#[derive(Debug, Clone, Copy)]
pub struct VolumeParams {
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub total_blocks: u64,
}

fn opt_ino(raw: u64) -> Option<InodeNumber> {
    (raw != 0).then_some(InodeNumber(raw))
}

fn opt_block(raw: u64) -> Option<BlockNumber> {
    (raw != 0).then_some(BlockNumber(raw))
}

/// On-disk form of a snapshot's record slot.
pub(crate) fn raw_record(ino: InodeNumber, st: &SnapState) -> RawRecord {
    RawRecord {
        ino: ino.0,
        generation: st.generation.0,
        pflags: st.flags.persistent_bits(),
        next: st.next.map_or(0, |i| i.0),
        frozen_blocks: st.frozen_blocks,
        disk_blocks: st.disk_blocks,
        map_root: st.map_root.map_or(0, |b| b.0),
    }
}

impl SnapshotEngine {
    /// Lay down a fresh volume on `dev` and return the running engine.
    pub fn format(
        dev: Arc<dyn BlockDevice>,
        params: &VolumeParams,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let geo = FsGeometry::new(params.block_size, params.blocks_per_group, params.total_blocks)?;
        check_device(&dev, &geo)?;

        let record_table: Vec<BlockNumber> = (RECORD_TABLE_START
            ..RECORD_TABLE_START + RECORD_TABLE_BLOCKS)
            .map(BlockNumber)
            .collect();
        Allocator::format(&dev, &geo, &record_table)?;
        let zeros = vec![0u8; geo.block_size.bytes() as usize];
        for &b in &record_table {
            dev.write_block(b, &zeros)?;
        }

        let volume_meta = VolumeMeta {
            flags: VFLAG_EXCLUDE_BITMAP,
            block_size: geo.block_size,
            blocks_per_group: geo.blocks_per_group,
            total_blocks: geo.total_blocks,
            head: None,
            active: None,
            next_generation: 1,
            exclude_ino: EXCLUDE_INODE,
            reserved_floor: config.reserved_floor,
        };
        dev.write_block(VOLUME_META_BLOCK, &volume_meta.encode(geo.block_size))?;
        dev.sync()?;

        let engine = Self::assemble(dev, geo, volume_meta, config)?;
        engine.init_exclude_inode()?;
        info!(
            blocks = geo.total_blocks,
            groups = geo.group_count,
            "volume formatted"
        );
        Ok(engine)
    }

    /// Bring up the engine from an existing volume.
    pub fn load(dev: Arc<dyn BlockDevice>, config: EngineConfig) -> Result<Arc<Self>> {
        let raw = dev.read_block(VOLUME_META_BLOCK)?;
        let volume_meta = VolumeMeta::decode(raw.as_slice())?;
        let geo = FsGeometry::new(
            volume_meta.block_size,
            volume_meta.blocks_per_group,
            volume_meta.total_blocks,
        )?;
        check_device(&dev, &geo)?;
        if volume_meta.flags & VFLAG_IS_SNAPSHOT != 0 {
            return Err(SnapError::Format(
                "device holds a snapshot image, not a volume".into(),
            ));
        }

        let engine = Self::assemble(dev, geo, volume_meta, config)?;
        engine.load_state()?;
        info!(
            snapshots = engine.list.len(),
            read_only = engine.is_read_only(),
            "volume loaded"
        );
        Ok(engine)
    }

    fn assemble(
        dev: Arc<dyn BlockDevice>,
        geo: FsGeometry,
        volume_meta: VolumeMeta,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let journal = Journal::new(dev, config.txn_credits);
        let alloc = Allocator::load(journal.device(), geo)?;
        Ok(Arc::new(Self {
            journal,
            alloc,
            inodes: InodeTable::new(),
            meta: Mutex::new(volume_meta),
            list: SnapshotList::new(),
            cow_cache: CowBitmapCache::new(geo.group_count),
            exclude: ExcludeBitmaps::new(geo.group_count),
            pending: PendingCow::new(),
            excluded_files: RwLock::new(HashSet::new()),
            config,
            lifecycle: Mutex::new(()),
            read_only: AtomicBool::new(false),
        }))
    }

    /// Allocate and persist the exclude inode: one exclude bitmap per
    /// group, each placed in (and excluding) its own group.
    fn init_exclude_inode(&self) -> Result<()> {
        let geo = *self.alloc.geometry();
        let bs = geo.block_size.bytes() as usize;
        let mut handle = self.journal.begin(self.config.txn_credits)?;
        self.inodes.create(EXCLUDE_INODE)?;

        let mut entries = Vec::with_capacity(geo.group_count as usize);
        let mut spilled = Vec::new();
        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            handle.extend_or_restart(4)?;
            let got = self.inodes.map_new(
                &mut handle,
                &self.alloc,
                EXCLUDE_INODE,
                LogicalBlock(u64::from(g)),
                1,
                Some(geo.block_bitmap_block(group)),
            )?;
            let mut bitmap = vec![0u8; bs];
            let (home, rel) = geo.group_of(got.start);
            if home == group {
                snapfs_alloc::bitmap_set(&mut bitmap, rel);
            } else {
                spilled.push(got.start);
            }
            handle.write_block(got.start, bitmap)?;
            self.exclude.set_block(group, got.start);
            entries.push((LogicalBlock(u64::from(g)), got.start));
        }
        for b in spilled {
            self.exclude.mark_range(&mut handle, &geo, b, 1, true)?;
        }

        let mut disk_blocks = entries.len() as u64;
        let map_root = match meta::write_map(&mut handle, &self.alloc, &entries)? {
            Some(chain) => {
                for &b in &chain.new_blocks {
                    self.exclude.mark_range(&mut handle, &geo, b, 1, true)?;
                }
                disk_blocks += chain.new_blocks.len() as u64;
                chain.root.0
            }
            None => 0,
        };
        let record = RawRecord {
            ino: EXCLUDE_INODE.0,
            disk_blocks,
            map_root,
            ..RawRecord::default()
        };
        handle.extend_or_restart(1)?;
        meta::store_record(&mut handle, geo.block_size, 0, &record)?;
        handle.commit()
    }

    /// Rebuild in-memory state from disk. Chain damage degrades the
    /// volume to read-only rather than failing the load.
    fn load_state(&self) -> Result<()> {
        let volume_meta = *self.meta.lock();
        let geo = *self.alloc.geometry();
        let mut degraded = false;

        let handle = self.journal.begin(1)?;
        let records = meta::load_records(&handle, geo.block_size)?;

        let mut snapshots: HashMap<u64, (usize, RawRecord)> = HashMap::new();
        let mut exclude_rec = None;
        for (slot, rec) in records.iter().enumerate() {
            if rec.is_free() {
                continue;
            }
            if rec.pflags & PFLAG_SNAPFILE != 0 {
                snapshots.insert(rec.ino, (slot, *rec));
            } else if rec.ino == volume_meta.exclude_ino.0 {
                exclude_rec = Some(*rec);
            } else {
                warn!(slot, ino = rec.ino, "unrecognized record slot ignored");
            }
        }

        let exclude_rec = exclude_rec.ok_or_else(|| SnapError::Inconsistency {
            detail: "exclude inode record missing".into(),
        })?;
        let (exclude_map, _) = meta::read_map(
            &handle,
            geo.block_size,
            geo.total_blocks,
            opt_block(exclude_rec.map_root),
        )?;
        self.inodes
            .install(volume_meta.exclude_ino, exclude_map.iter().copied())?;
        for &(l, phys) in &exclude_map {
            if l.0 < u64::from(geo.group_count) {
                self.exclude.set_block(GroupNumber(l.0 as u32), phys);
            }
        }
        for g in 0..geo.group_count {
            if self.exclude.block_of(GroupNumber(g)).is_none() {
                warn!(group = g, "exclude bitmap missing");
                degraded = true;
            }
        }

        let mut cursor = volume_meta.head;
        let mut seen = HashSet::new();
        while let Some(ino) = cursor {
            if !seen.insert(ino) {
                warn!(%ino, "snapshot chain loops");
                degraded = true;
                break;
            }
            let Some(&(slot, rec)) = snapshots.get(&ino.0) else {
                warn!(%ino, "snapshot chain points at a missing record");
                degraded = true;
                break;
            };
            if rec.generation == 0 {
                warn!(%ino, "snapshot record has zero generation");
                degraded = true;
                break;
            }
            let (map_entries, map_tail) = match meta::read_map(
                &handle,
                geo.block_size,
                geo.total_blocks,
                opt_block(rec.map_root),
            ) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(%ino, error = %e, "snapshot map unreadable");
                    degraded = true;
                    break;
                }
            };
            self.inodes.install(ino, map_entries)?;
            let state = SnapState {
                generation: Generation(rec.generation),
                flags: SnapshotFlags::from_persistent_bits(rec.pflags),
                next: opt_ino(rec.next),
                frozen_blocks: rec.frozen_blocks,
                disk_blocks: rec.disk_blocks,
                map_root: opt_block(rec.map_root),
                map_tail,
            };
            cursor = state.next;
            self.list.insert_tail(SnapshotRecord::new(ino, slot, state))?;
        }
        handle.abort();

        let active_missing = volume_meta
            .active
            .is_some_and(|ino| self.list.get(ino).is_none());
        if degraded || active_missing {
            self.fail_volume("snapshot state incomplete");
        }
        self.update_flags();

        if !self.is_read_only() {
            self.drop_untaken()?;
        }
        Ok(())
    }

    /// Remove snapshots that were created but never taken, the residue
    /// of a crash between create and take.
    fn drop_untaken(&self) -> Result<()> {
        let leftovers: Vec<InodeNumber> = self
            .list
            .order()
            .iter()
            .filter(|r| !r.snapshot_state().taken())
            .map(|r| r.ino)
            .collect();
        if leftovers.is_empty() {
            return Ok(());
        }
        let mut handle = self.journal.begin(self.config.txn_credits)?;
        for ino in leftovers {
            warn!(%ino, "removing snapshot that was never taken");
            self.remove_snapshot(&mut handle, ino)?;
        }
        handle.commit()
    }

    // ── Chain operations ────────────────────────────────────────────────

    /// Create a snapshot file under `ino` at the head of the chain.
    /// The snapshot is inert until [`take`](Self::take).
    pub fn create(&self, ino: InodeNumber) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.require_writable()?;
        if ino == self.meta.lock().exclude_ino || self.inodes.exists(ino) {
            return Err(SnapError::InvalidState(format!("{ino} already in use")));
        }
        if let Some(head) = self.list.head() {
            if !head.snapshot_state().taken() {
                return Err(SnapError::InvalidState(format!(
                    "snapshot {} is still waiting to be taken",
                    head.ino
                )));
            }
        }
        let geo = *self.alloc.geometry();
        let (generation, prev_head) = {
            let m = self.meta.lock();
            (Generation(m.next_generation), m.head)
        };

        let mut handle = self.journal.begin(self.config.txn_credits)?;
        let records = meta::load_records(&handle, geo.block_size)?;
        let slot = records
            .iter()
            .position(RawRecord::is_free)
            .ok_or(SnapError::NoSpace)?;

        self.inodes.create(ino)?;
        let staged = self
            .prealloc_skeleton(&mut handle, ino, &geo)
            .and_then(|entries| {
                let mut disk_blocks = entries.len() as u64;
                let chain = meta::write_map(&mut handle, &self.alloc, &entries)?;
                let (map_root, map_tail) = match &chain {
                    Some(c) => {
                        for &b in &c.new_blocks {
                            self.exclude.mark_range(&mut handle, &geo, b, 1, true)?;
                        }
                        disk_blocks += c.new_blocks.len() as u64;
                        (Some(c.root), Some(c.tail))
                    }
                    None => (None, None),
                };
                let state = SnapState {
                    generation,
                    flags: SnapshotFlags {
                        on_list: true,
                        ..SnapshotFlags::default()
                    },
                    next: prev_head,
                    frozen_blocks: 0,
                    disk_blocks,
                    map_root,
                    map_tail,
                };
                handle.extend_or_restart(2)?;
                meta::store_record(&mut handle, geo.block_size, slot, &raw_record(ino, &state))?;
                self.meta.lock().head = Some(ino);
                self.write_meta(&mut handle)?;
                Ok(state)
            });

        let state = match staged {
            Ok(state) => state,
            Err(e) => {
                warn!(%ino, error = %e, "snapshot create failed, rolling back");
                self.meta.lock().head = prev_head;
                let undone = self
                    .release_file(&mut handle, ino)
                    .and_then(|_| {
                        meta::store_record(&mut handle, geo.block_size, slot, &RawRecord::default())
                    })
                    .and_then(|_| self.write_meta(&mut handle))
                    .and_then(|_| handle.commit());
                if undone.is_err() {
                    self.fail_volume("create rollback failed");
                }
                return Err(e);
            }
        };
        if let Err(e) = handle.commit() {
            self.meta.lock().head = prev_head;
            let _ = self.inodes.remove(ino);
            self.fail_volume("create commit failed");
            return Err(e);
        }
        self.list.insert_head(SnapshotRecord::new(ino, slot, state))?;
        info!(%ino, %generation, "snapshot created");
        Ok(())
    }

    /// Preallocate the snapshot's fixed targets: its reserved scratch
    /// region plus shadows for the volume metadata, the record table
    /// and every group's allocation bitmap. Take fills them without
    /// allocating, so the frozen copy cannot run out of space halfway.
    fn prealloc_skeleton(
        &self,
        handle: &mut TxnHandle,
        ino: InodeNumber,
        geo: &FsGeometry,
    ) -> Result<Vec<(LogicalBlock, BlockNumber)>> {
        let bs = geo.block_size.bytes() as usize;
        let mut targets: Vec<LogicalBlock> = (0..SNAPSHOT_META_BLOCKS).map(LogicalBlock).collect();
        targets.push(snapshot_iblock(VOLUME_META_BLOCK));
        for b in RECORD_TABLE_START..RECORD_TABLE_START + RECORD_TABLE_BLOCKS {
            targets.push(snapshot_iblock(BlockNumber(b)));
        }
        for g in 0..geo.group_count {
            targets.push(snapshot_iblock(geo.block_bitmap_block(GroupNumber(g))));
        }

        let mut entries = Vec::with_capacity(targets.len());
        let mut goal = None;
        for lblock in targets {
            handle.extend_or_restart(6)?;
            let got = self.inodes.map_new(handle, &self.alloc, ino, lblock, 1, goal)?;
            goal = Some(BlockNumber(got.start.0 + 1));
            handle.write_block(got.start, vec![0u8; bs])?;
            self.exclude.mark_range(handle, geo, got.start, 1, true)?;
            entries.push((lblock, got.start));
        }
        Ok(entries)
    }

    /// Upper bound on the storage a snapshot taken now may come to
    /// hold: one copy of every in-use block, minus the blocks the
    /// exclude bitmaps already keep out of snapshots. The metadata
    /// skeleton is preallocated at create and costs nothing at take.
    fn worst_case_cow_demand(&self) -> Result<u64> {
        let geo = *self.alloc.geometry();
        let in_use = geo.total_blocks.saturating_sub(self.alloc.free_blocks());
        let mut excluded = 0u64;
        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let bitmap_block =
                self.exclude
                    .block_of(group)
                    .ok_or_else(|| SnapError::Inconsistency {
                        detail: format!("no exclude bitmap for {group}"),
                    })?;
            let bitmap = self.journal.committed_view(bitmap_block)?;
            let bits = geo.blocks_in_group(group);
            excluded += u64::from(bits - bitmap_count_free(&bitmap, bits));
        }
        Ok(in_use.saturating_sub(excluded))
    }

    /// Freeze the volume and capture its current state into `ino`,
    /// making it the active snapshot. Returns the generation.
    pub fn take(&self, ino: InodeNumber) -> Result<Generation> {
        let _guard = self.lifecycle.lock();
        self.require_writable()?;
        let rec = self.list.require(ino)?;
        {
            let st = rec.snapshot_state();
            if st.taken() {
                return Err(SnapError::InvalidState(format!("{ino} was already taken")));
            }
            if st.flags.deleted {
                return Err(SnapError::InvalidState(format!("{ino} is deleted")));
            }
        }
        if self.list.head().map(|h| h.ino) != Some(ino) {
            return Err(SnapError::InvalidState(format!(
                "{ino} is not the newest snapshot"
            )));
        }
        let floor = self.meta.lock().reserved_floor;
        let free = self.alloc.free_blocks();
        let demand = self.worst_case_cow_demand()?;
        if free < demand.saturating_add(floor) {
            warn!(free, demand, floor, "not enough space to guarantee the snapshot");
            return Err(SnapError::NoSpace);
        }

        let geo = *self.alloc.geometry();
        let meta_before = *self.meta.lock();
        let prev_active = self.active_record();
        let frozen = self.journal.freeze();
        let mut handle = self.journal.begin_frozen(self.config.txn_credits)?;
        let staged = self.stage_frozen_image(&mut handle, &rec, &geo);
        let result = match staged {
            Ok(generation) => match handle.commit() {
                Ok(()) => Ok(generation),
                Err(e) => {
                    self.fail_volume("take commit failed");
                    Err(e)
                }
            },
            Err(e) => {
                handle.abort();
                // Undo the in-memory flips; nothing reached disk.
                *self.meta.lock() = meta_before;
                {
                    let mut st = rec.state();
                    st.frozen_blocks = 0;
                    st.flags.active = false;
                }
                if let Some(prev) = &prev_active {
                    prev.state().flags.active = true;
                }
                Err(e)
            }
        };
        drop(frozen);
        if let Ok(generation) = result {
            self.cow_cache.reset();
            info!(%ino, %generation, "snapshot taken");
        }
        result
    }

    /// Stage the frozen image into `rec`'s preallocated targets and
    /// flip it active. Runs with the journal frozen.
    fn stage_frozen_image(
        &self,
        handle: &mut TxnHandle,
        rec: &Arc<SnapshotRecord>,
        geo: &FsGeometry,
    ) -> Result<Generation> {
        // Reserve the whole image up front; a restart here would split
        // the take across two commits.
        let blocks_needed = 4
            + RECORD_TABLE_BLOCKS as usize
            + geo.group_count as usize;
        handle.extend_or_restart(blocks_needed)?;

        // The metadata copy describes the volume as it looks from
        // inside the snapshot: no chain, no active snapshot.
        let mut snap_meta = *self.meta.lock();
        snap_meta.flags = (snap_meta.flags & !VFLAG_HAS_SNAPSHOT) | VFLAG_IS_SNAPSHOT;
        snap_meta.head = None;
        snap_meta.active = None;
        self.fill_target(handle, rec, VOLUME_META_BLOCK, snap_meta.encode(geo.block_size))?;

        for b in RECORD_TABLE_START..RECORD_TABLE_START + RECORD_TABLE_BLOCKS {
            let data = handle.read_block(BlockNumber(b))?;
            self.fill_target(handle, rec, BlockNumber(b), data)?;
        }
        // Allocation bitmaps are copied with excluded blocks masked
        // out; these copies double as the COW bitmaps afterwards.
        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let src = handle.read_block(geo.block_bitmap_block(group))?;
            let exclude = self.exclude.read(handle, group)?;
            let mut masked = vec![0u8; src.len()];
            bitmap_and_not(&mut masked, &src, &exclude);
            self.fill_target(handle, rec, geo.block_bitmap_block(group), masked)?;
        }

        let generation;
        {
            let mut st = rec.state();
            st.frozen_blocks = geo.total_blocks;
            st.flags.active = true;
            generation = st.generation;
        }
        if let Some(prev) = self.active_record() {
            if prev.ino != rec.ino {
                let mut st = prev.state();
                st.flags.active = false;
                let raw = raw_record(prev.ino, &st);
                let slot = prev.slot;
                drop(st);
                handle.extend_or_restart(1)?;
                meta::store_record(handle, geo.block_size, slot, &raw)?;
            }
        }
        {
            let mut m = self.meta.lock();
            m.active = Some(rec.ino);
            m.flags |= VFLAG_HAS_SNAPSHOT;
            m.next_generation = generation
                .0
                .checked_add(1)
                .ok_or_else(|| SnapError::Format("generation counter exhausted".into()))?;
        }
        self.write_meta(handle)?;
        handle.extend_or_restart(1)?;
        meta::store_record(
            handle,
            geo.block_size,
            rec.slot,
            &raw_record(rec.ino, &rec.snapshot_state()),
        )?;
        Ok(generation)
    }

    fn fill_target(
        &self,
        handle: &mut TxnHandle,
        rec: &Arc<SnapshotRecord>,
        src: BlockNumber,
        data: Vec<u8>,
    ) -> Result<()> {
        let phys = self
            .inodes
            .lookup(rec.ino, snapshot_iblock(src))
            .ok_or_else(|| SnapError::Inconsistency {
                detail: format!("snapshot {} lacks a shadow for {src}", rec.ino),
            })?;
        handle.extend_or_restart(1)?;
        handle.write_block(phys, data)
    }

    /// Allow the host to mount `ino` for reading.
    pub fn enable(&self, ino: InodeNumber) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.require_writable()?;
        let rec = self.list.require(ino)?;
        {
            let mut st = rec.state();
            if !st.taken() {
                return Err(SnapError::InvalidState(format!("{ino} was never taken")));
            }
            if st.flags.deleted {
                return Err(SnapError::InvalidState(format!("{ino} is deleted")));
            }
            st.flags.enabled = true;
        }
        self.persist_record(&rec)
    }

    pub fn disable(&self, ino: InodeNumber) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.require_writable()?;
        let rec = self.list.require(ino)?;
        rec.state().flags.enabled = false;
        self.persist_record(&rec)
    }

    /// Flush a snapshot's record slot in its own small transaction.
    fn persist_record(&self, rec: &Arc<SnapshotRecord>) -> Result<()> {
        let block_size = self.meta.lock().block_size;
        let mut handle = self.journal.begin(4)?;
        meta::store_record(
            &mut handle,
            block_size,
            rec.slot,
            &raw_record(rec.ino, &rec.snapshot_state()),
        )?;
        handle.commit()
    }

    /// Mark `ino` deleted. Its storage is reclaimed by the next
    /// [`cleanup`](Self::cleanup) pass, once nothing reads through it.
    pub fn delete(&self, ino: InodeNumber) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.require_writable()?;
        let rec = self.list.require(ino)?;
        {
            let mut st = rec.state();
            if st.flags.enabled {
                return Err(SnapError::InvalidState(format!(
                    "{ino} is enabled, disable it first"
                )));
            }
            st.flags.deleted = true;
        }
        self.persist_record(&rec)?;
        self.update_flags();
        info!(%ino, "snapshot deleted");
        Ok(())
    }

    /// Recompute the derived per-snapshot flags from the chain. A
    /// deleted snapshot stays `in_use` while an older live snapshot
    /// still resolves reads through it.
    pub(crate) fn update_flags(&self) {
        let active = self.meta.lock().active;
        let mut seen_alive = false;
        for rec in self.list.order().iter().rev() {
            let mut st = rec.state();
            st.flags.on_list = true;
            st.flags.active = Some(rec.ino) == active;
            st.flags.in_use = st.flags.deleted && seen_alive;
            seen_alive |= !st.flags.deleted;
        }
    }

    /// Reclaim storage of deleted snapshots: drop the ones nothing
    /// needs, shrink the rest down to the blocks still read through
    /// them, then merge those into their older live neighbor.
    pub fn cleanup(&self) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.require_writable()?;
        self.update_flags();

        self.retire_dead_chain()?;
        self.remove_removable()?;
        self.shrink_and_merge()?;
        self.update_flags();
        Ok(())
    }

    /// If every snapshot is deleted, nothing will ever read through the
    /// chain again: drop the active designation so the whole chain
    /// becomes removable.
    fn retire_dead_chain(&self) -> Result<()> {
        let order = self.list.order();
        if order.is_empty() || order.iter().any(|r| !r.snapshot_state().flags.deleted) {
            return Ok(());
        }
        let frozen = self.journal.freeze();
        let mut handle = self.journal.begin_frozen(4)?;
        {
            let mut m = self.meta.lock();
            m.active = None;
            m.flags &= !VFLAG_HAS_SNAPSHOT;
        }
        for rec in &order {
            rec.state().flags.active = false;
        }
        self.write_meta(&mut handle)?;
        let result = handle.commit();
        drop(frozen);
        self.cow_cache.reset();
        self.update_flags();
        debug!("chain fully deleted, active snapshot retired");
        result
    }

    fn remove_removable(&self) -> Result<()> {
        let removable: Vec<InodeNumber> = self
            .list
            .order()
            .iter()
            .filter(|r| r.snapshot_state().flags.removable())
            .map(|r| r.ino)
            .collect();
        if removable.is_empty() {
            return Ok(());
        }
        let mut handle = self.journal.begin(self.config.txn_credits)?;
        for ino in removable {
            self.remove_snapshot(&mut handle, ino)?;
        }
        handle.commit()?;
        self.update_flags();
        Ok(())
    }

    /// Walk the chain for runs of deleted, still-in-use snapshots
    /// sitting above a live one, shrink them to the blocks that live
    /// one still needs, and fold those into it. Errors abort the run's
    /// transaction and surface; already-processed runs stay done.
    fn shrink_and_merge(&self) -> Result<()> {
        // Oldest first: the run ordering is also read-through order.
        let chain: Vec<Arc<SnapshotRecord>> = self.list.order().into_iter().rev().collect();
        let mut i = 0;
        while i < chain.len() {
            let flags = chain[i].snapshot_state().flags;
            if flags.deleted {
                i += 1;
                continue;
            }
            let start = Arc::clone(&chain[i]);
            let mut run = Vec::new();
            let mut j = i + 1;
            while j < chain.len() {
                let f = chain[j].snapshot_state().flags;
                if f.deleted && f.in_use && !f.active && !f.enabled {
                    run.push(Arc::clone(&chain[j]));
                    j += 1;
                } else {
                    break;
                }
            }
            if !run.is_empty() {
                let mut handle = self.journal.begin(self.config.txn_credits)?;
                let staged = self
                    .shrink_run(&mut handle, &start, &run)
                    .and_then(|_| self.merge_run(&mut handle, &start, &run));
                match staged {
                    Ok(()) => handle.commit()?,
                    Err(e) => {
                        handle.abort();
                        self.fail_volume("cleanup aborted mid-run");
                        return Err(e);
                    }
                }
            }
            i = j;
        }
        Ok(())
    }

    /// Free every block in the run that `start` will never read: blocks
    /// `start` captured itself, blocks free at `start`'s take, and
    /// duplicates already served by an older member of the run.
    fn shrink_run(
        &self,
        handle: &mut TxnHandle,
        start: &Arc<SnapshotRecord>,
        run: &[Arc<SnapshotRecord>],
    ) -> Result<()> {
        let geo = *self.alloc.geometry();
        let mut claimed: HashSet<u64> = HashSet::new();
        for member in run {
            let mut freed = 0u64;
            for (lblock, phys) in self.inodes.mappings(member.ino)? {
                let needed = match snapshot_block_of(lblock) {
                    // Scratch region; merge disposes of it.
                    None => true,
                    Some(v) => {
                        !claimed.contains(&v.0)
                            && self.inodes.lookup(start.ino, lblock).is_none()
                            && self.start_had_block(handle, start, v)?
                    }
                };
                if needed {
                    if let Some(v) = snapshot_block_of(lblock) {
                        claimed.insert(v.0);
                    }
                } else {
                    handle.extend_or_restart(6)?;
                    self.inodes.unmap(member.ino, lblock, 1)?;
                    self.exclude.mark_range(handle, &geo, phys, 1, false)?;
                    self.alloc.free(handle, phys, 1)?;
                    freed += 1;
                }
            }

            // Rewrite the map chain to match what is left.
            let old_root = member.state().map_root;
            for b in meta::free_map(handle, &self.alloc, old_root)? {
                self.exclude.mark_range(handle, &geo, b, 1, false)?;
            }
            let entries = self.inodes.mappings(member.ino)?;
            let mut disk_blocks = entries.len() as u64;
            let chain = meta::write_map(handle, &self.alloc, &entries)?;
            {
                let mut st = member.state();
                match &chain {
                    Some(c) => {
                        disk_blocks += c.new_blocks.len() as u64;
                        st.map_root = Some(c.root);
                        st.map_tail = Some(c.tail);
                    }
                    None => {
                        st.map_root = None;
                        st.map_tail = None;
                    }
                }
                st.disk_blocks = disk_blocks;
                st.flags.shrunk = true;
            }
            if let Some(c) = &chain {
                for &b in &c.new_blocks {
                    self.exclude.mark_range(handle, &geo, b, 1, true)?;
                }
            }
            handle.extend_or_restart(1)?;
            meta::store_record(
                handle,
                geo.block_size,
                member.slot,
                &raw_record(member.ino, &member.snapshot_state()),
            )?;
            debug!(ino = %member.ino, freed, "snapshot shrunk");
        }
        Ok(())
    }

    /// Was volume block `v` in use when `start` was taken, per its
    /// frozen bitmap copy. A missing copy keeps the block, erring on
    /// the side of retaining data.
    fn start_had_block(
        &self,
        handle: &TxnHandle,
        start: &Arc<SnapshotRecord>,
        v: BlockNumber,
    ) -> Result<bool> {
        let geo = self.alloc.geometry();
        let (group, rel) = geo.group_of(v);
        match self
            .inodes
            .lookup(start.ino, snapshot_iblock(geo.block_bitmap_block(group)))
        {
            Some(phys) => {
                let bitmap = handle.read_block(phys)?;
                Ok(bitmap_get(&bitmap, rel))
            }
            None => {
                warn!(ino = %start.ino, %group, "bitmap copy missing, keeping block");
                Ok(true)
            }
        }
    }

    /// Fold each shrunk member's surviving blocks into `start` and
    /// remove the member from the chain.
    fn merge_run(
        &self,
        handle: &mut TxnHandle,
        start: &Arc<SnapshotRecord>,
        run: &[Arc<SnapshotRecord>],
    ) -> Result<()> {
        let geo = *self.alloc.geometry();
        for member in run {
            let entries = self.inodes.remove(member.ino)?;
            let mut adopted = Vec::new();
            for (lblock, phys) in entries {
                let keep = snapshot_block_of(lblock).is_some()
                    && self.inodes.map_existing(start.ino, lblock, phys, 1)? == 1;
                if keep {
                    adopted.push((lblock, phys));
                } else {
                    handle.extend_or_restart(4)?;
                    self.exclude.mark_range(handle, &geo, phys, 1, false)?;
                    self.alloc.free(handle, phys, 1)?;
                }
            }
            for b in meta::free_map(handle, &self.alloc, member.state().map_root)? {
                self.exclude.mark_range(handle, &geo, b, 1, false)?;
            }
            handle.extend_or_restart(1)?;
            meta::store_record(handle, geo.block_size, member.slot, &RawRecord::default())?;
            self.restitch_after(handle, member.ino, geo.block_size)?;
            if !adopted.is_empty() {
                let count = adopted.len();
                self.persist_map_delta(handle, start, &adopted)?;
                info!(from = %member.ino, into = %start.ino, blocks = count, "snapshot merged");
            } else {
                info!(from = %member.ino, into = %start.ino, "empty snapshot removed");
            }
        }
        Ok(())
    }

    /// Unlink `ino` from the chain and persist whichever pointer now
    /// names its older neighbor.
    fn restitch_after(
        &self,
        handle: &mut TxnHandle,
        ino: InodeNumber,
        block_size: BlockSize,
    ) -> Result<()> {
        let (newer, older) = self.list.unlink(ino)?;
        match newer {
            Some(n) => {
                handle.extend_or_restart(1)?;
                meta::store_record(
                    handle,
                    block_size,
                    n.slot,
                    &raw_record(n.ino, &n.snapshot_state()),
                )
            }
            None => {
                self.meta.lock().head = older;
                self.write_meta(handle)
            }
        }
    }

    /// Fully remove a snapshot: blocks, map chain, record slot, chain
    /// link. Only valid for snapshots nothing references.
    pub(crate) fn remove_snapshot(&self, handle: &mut TxnHandle, ino: InodeNumber) -> Result<()> {
        let rec = self.list.require(ino)?;
        let geo = *self.alloc.geometry();
        let map_root = rec.snapshot_state().map_root;
        self.release_file(handle, ino)?;
        for b in meta::free_map(handle, &self.alloc, map_root)? {
            self.exclude.mark_range(handle, &geo, b, 1, false)?;
        }
        handle.extend_or_restart(1)?;
        meta::store_record(handle, geo.block_size, rec.slot, &RawRecord::default())?;
        self.restitch_after(handle, ino, geo.block_size)?;
        info!(%ino, "snapshot removed");
        Ok(())
    }
}

fn check_device(dev: &Arc<dyn BlockDevice>, geo: &FsGeometry) -> Result<()> {
    if dev.block_size() != geo.block_size {
        return Err(SnapError::Format(format!(
            "device block size {} does not match volume {}",
            dev.block_size().bytes(),
            geo.block_size.bytes()
        )));
    }
    if dev.block_count() < geo.total_blocks {
        return Err(SnapError::Format(format!(
            "device holds {} blocks, volume needs {}",
            dev.block_count(),
            geo.total_blocks
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtectMode;
    use snapfs_block::{ByteBlockDevice, MemByteDevice};

    fn test_device(total_blocks: u64) -> Arc<dyn BlockDevice> {
        let bs = BlockSize::new(1024).unwrap();
        let bytes = MemByteDevice::new(total_blocks as usize * 1024);
        Arc::new(ByteBlockDevice::new(bytes, bs).unwrap())
    }

    fn params(total_blocks: u64) -> VolumeParams {
        VolumeParams {
            block_size: BlockSize::new(1024).unwrap(),
            blocks_per_group: 64,
            total_blocks,
        }
    }

    fn formatted(total_blocks: u64) -> (Arc<dyn BlockDevice>, Arc<SnapshotEngine>) {
        let dev = test_device(total_blocks);
        let engine =
            SnapshotEngine::format(Arc::clone(&dev), &params(total_blocks), EngineConfig::default())
                .unwrap();
        (dev, engine)
    }

    #[test]
    fn format_then_load_round_trips() {
        let (dev, engine) = formatted(256);
        let before = engine.status();
        drop(engine);

        let loaded = SnapshotEngine::load(dev, EngineConfig::default()).unwrap();
        let after = loaded.status();
        assert!(!after.read_only);
        assert_eq!(after.total_blocks, 256);
        assert_eq!(after.free_blocks, before.free_blocks);
        assert!(after.snapshots.is_empty());
    }

    #[test]
    fn create_take_copy_and_read_back() {
        let (_dev, engine) = formatted(256);

        // A data block with known committed contents.
        let mut h = engine.journal().begin(16).unwrap();
        let got = engine.allocator().alloc(&mut h, 1, None).unwrap();
        let data_block = got.start;
        h.write_block(data_block, vec![0xAB; 1024]).unwrap();
        h.commit().unwrap();

        engine.create(InodeNumber(10)).unwrap();
        let generation = engine.take(InodeNumber(10)).unwrap();
        assert_eq!(generation, Generation(1));

        // Overwrite under protection.
        let mut h = engine.journal().begin(64).unwrap();
        let touched = engine
            .protect(&mut h, None, data_block, 1, ProtectMode::Copy)
            .unwrap();
        assert_eq!(touched, 1);
        h.write_block(data_block, vec![0xCD; 1024]).unwrap();
        h.commit().unwrap();

        let old = engine
            .read_snapshot_block(InodeNumber(10), data_block)
            .unwrap();
        assert_eq!(old, vec![0xAB; 1024]);

        // Second protect in a later transaction is a no-op.
        let mut h = engine.journal().begin(64).unwrap();
        let touched = engine
            .protect(&mut h, None, data_block, 1, ProtectMode::Copy)
            .unwrap();
        assert_eq!(touched, 0);
        h.abort();
    }

    #[test]
    fn take_requires_newest_untaken() {
        let (_dev, engine) = formatted(256);
        engine.create(InodeNumber(10)).unwrap();
        engine.take(InodeNumber(10)).unwrap();
        assert!(matches!(
            engine.take(InodeNumber(10)),
            Err(SnapError::InvalidState(_))
        ));
        // A second create is allowed once the head is taken.
        engine.create(InodeNumber(11)).unwrap();
        assert!(matches!(
            engine.take(InodeNumber(10)),
            Err(SnapError::InvalidState(_))
        ));
        engine.take(InodeNumber(11)).unwrap();
    }

    #[test]
    fn untaken_snapshot_dropped_on_load() {
        let (dev, engine) = formatted(256);
        engine.create(InodeNumber(10)).unwrap();
        let free_before = engine.status().free_blocks;
        drop(engine);

        let loaded = SnapshotEngine::load(dev, EngineConfig::default()).unwrap();
        assert!(loaded.status().snapshots.is_empty());
        assert!(loaded.status().free_blocks > free_before);
    }

    #[test]
    fn deleted_flag_chain_semantics() {
        let (_dev, engine) = formatted(512);
        engine.create(InodeNumber(10)).unwrap();
        engine.take(InodeNumber(10)).unwrap();
        engine.create(InodeNumber(11)).unwrap();
        engine.take(InodeNumber(11)).unwrap();

        // Deleting the newer one leaves it in_use: snapshot 10 still
        // reads through it.
        engine.delete(InodeNumber(11)).unwrap();
        let st = engine.status();
        let deleted = st.snapshots.iter().find(|s| s.ino == 11).unwrap();
        assert!(deleted.flags.deleted);
        assert!(deleted.flags.in_use);

        // Deleting the older one: nothing reads through it.
        let (_dev2, engine2) = formatted(512);
        engine2.create(InodeNumber(10)).unwrap();
        engine2.take(InodeNumber(10)).unwrap();
        engine2.create(InodeNumber(11)).unwrap();
        engine2.take(InodeNumber(11)).unwrap();
        engine2.delete(InodeNumber(10)).unwrap();
        let st = engine2.status();
        let deleted = st.snapshots.iter().find(|s| s.ino == 10).unwrap();
        assert!(deleted.flags.deleted);
        assert!(!deleted.flags.in_use);
        engine2.cleanup().unwrap();
        assert_eq!(engine2.status().snapshots.len(), 1);
    }
}
