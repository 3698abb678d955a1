#![forbid(unsafe_code)]
//! Copy-on-write block snapshot engine.
//!
//! A snapshot is a frozen, read-only image of the volume at a point in
//! time. Rather than copying the volume up front, the engine intercepts
//! writes: before a block that was in use at snapshot time is
//! overwritten, its old contents are copied (or the block itself is
//! remapped) into the newest snapshot. Older snapshots read through
//! newer ones for blocks they never captured, ending at the live
//! volume.
//!
//! The moving parts, one module each:
//!
//! - [`bitmap`]: per-group COW bitmaps ("was this block in use at take
//!   time"), derived once per active epoch, plus the persistent exclude
//!   bitmaps that keep snapshot storage out of other snapshots.
//! - `store` (read side): read-through resolution across the chain and
//!   the pending-COW rendezvous.
//! - `cow`: the [`protect`](SnapshotEngine::protect) decision pipeline.
//! - `list` / `ctl`: the snapshot chain and its lifecycle
//!   (create/take/enable/disable/delete/cleanup), all serialized under
//!   one lifecycle mutex, with take inside a full write freeze.
//! - `meta`: everything that goes to disk.
//!
//! Hosts drive the engine through a [`snapfs_journal::TxnHandle`]: the
//! backup staged by `protect` and the overwrite it protects commit
//! together or not at all.

pub mod bitmap;
mod cow;
mod ctl;
mod list;
mod meta;
mod store;

pub use cow::ProtectMode;
pub use ctl::VolumeParams;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use snapfs_alloc::{Allocator, InodeTable, VOLUME_META_BLOCK};
use snapfs_error::{Result, SnapError};
use snapfs_journal::{Journal, TxnHandle};
use snapfs_types::{
    BlockNumber, InodeNumber, LogicalBlock, SnapshotFlags, VFLAG_FIX_EXCLUDE,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::bitmap::{CowBitmapCache, ExcludeBitmaps};
use crate::list::{SnapshotList, SnapshotRecord};
use crate::meta::VolumeMeta;
use crate::store::PendingCow;

/// Inode number the engine claims for the exclude inode. Hosts must
/// keep their own inode numbers above this.
pub const EXCLUDE_INODE: InodeNumber = InodeNumber(2);

/// Host-side accounting notified when move-on-write transfers block
/// ownership from a file to a snapshot.
pub trait QuotaSink: Send + Sync {
    fn release(&self, origin: Option<InodeNumber>, blocks: u64);
}

/// Default sink: no quota accounting.
pub struct NoQuota;

impl QuotaSink for NoQuota {
    fn release(&self, _origin: Option<InodeNumber>, _blocks: u64) {}
}

/// Engine tunables.
pub struct EngineConfig {
    /// Verify allocation and exclusion state on read-through to the
    /// live volume.
    pub strict_read_checks: bool,
    /// Free blocks that must remain after a take.
    pub reserved_floor: u64,
    /// Per-transaction credit ceiling for the journal.
    pub txn_credits: usize,
    pub quota: Box<dyn QuotaSink>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_read_checks: false,
            reserved_floor: 0,
            txn_credits: 256,
            quota: Box::new(NoQuota),
        }
    }
}

/// Status summary for hosts and tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub read_only: bool,
    pub total_blocks: u64,
    pub free_blocks: u64,
    /// The volume was marked for an offline consistency check.
    pub needs_check: bool,
    pub active: Option<SnapshotInfo>,
    /// Newest first.
    pub snapshots: Vec<SnapshotInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub ino: u64,
    pub generation: u64,
    pub flags: SnapshotFlags,
    /// Volume size at take; zero until taken.
    pub frozen_blocks: u64,
    /// Blocks of snapshot storage currently held.
    pub disk_blocks: u64,
}

/// The engine. One instance per mounted volume.
pub struct SnapshotEngine {
    pub(crate) journal: Arc<Journal>,
    pub(crate) alloc: Allocator,
    pub(crate) inodes: InodeTable,
    pub(crate) meta: Mutex<VolumeMeta>,
    pub(crate) list: SnapshotList,
    pub(crate) cow_cache: CowBitmapCache,
    pub(crate) exclude: ExcludeBitmaps,
    pub(crate) pending: PendingCow,
    pub(crate) excluded_files: RwLock<HashSet<InodeNumber>>,
    pub(crate) config: EngineConfig,
    pub(crate) lifecycle: Mutex<()>,
    pub(crate) read_only: AtomicBool,
}

impl SnapshotEngine {
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// The block mapper; hosts register their own files here.
    #[must_use]
    pub fn inode_table(&self) -> &InodeTable {
        &self.inodes
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        if self.journal.is_poisoned() && !self.is_read_only() {
            self.fail_volume("a transaction aborted after changing shared state");
        }
        if self.is_read_only() {
            return Err(SnapError::ReadOnly);
        }
        Ok(())
    }

    /// Force the volume read-only after an unrecoverable failure.
    pub(crate) fn fail_volume(&self, why: &str) {
        warn!(why, "volume forced read-only");
        self.read_only.store(true, Ordering::Release);
    }

    pub(crate) fn active_record(&self) -> Option<Arc<SnapshotRecord>> {
        let active = self.meta.lock().active?;
        self.list.get(active)
    }

    /// Stage the volume metadata block from the in-memory copy.
    pub(crate) fn write_meta(&self, handle: &mut TxnHandle) -> Result<()> {
        let meta = self.meta.lock();
        let buf = meta.encode(meta.block_size);
        drop(meta);
        handle.extend_or_restart(1)?;
        handle.write_block(VOLUME_META_BLOCK, buf)
    }

    /// Record a repaired-forward inconsistency: log it and raise the
    /// persistent consistency-check flag.
    pub(crate) fn mark_needs_check(&self, handle: &mut TxnHandle, detail: &str) -> Result<()> {
        warn!(detail, "inconsistency repaired forward; volume marked for check");
        let mut meta = self.meta.lock();
        if meta.flags & VFLAG_FIX_EXCLUDE != 0 {
            return Ok(());
        }
        meta.flags |= VFLAG_FIX_EXCLUDE;
        drop(meta);
        self.write_meta(handle)
    }

    /// Register `ino` as an excluded file and mark its current blocks
    /// in the exclude bitmaps. Excluded files are never copied into
    /// snapshots.
    pub fn exclude_file(&self, handle: &mut TxnHandle, ino: InodeNumber) -> Result<()> {
        self.require_writable()?;
        self.excluded_files.write().insert(ino);
        if !self.inodes.exists(ino) {
            return Ok(());
        }
        let geo = *self.alloc.geometry();
        for (_, phys) in self.inodes.mappings(ino)? {
            self.exclude.mark_range(handle, &geo, phys, 1, true)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_excluded_file(&self, ino: InodeNumber) -> bool {
        self.excluded_files.read().contains(&ino)
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        let meta = self.meta.lock();
        let active_ino = meta.active;
        let total_blocks = meta.total_blocks;
        let needs_check = meta.flags & VFLAG_FIX_EXCLUDE != 0;
        drop(meta);

        let info = |rec: &Arc<SnapshotRecord>| {
            let st = rec.snapshot_state();
            SnapshotInfo {
                ino: rec.ino.0,
                generation: st.generation.0,
                flags: st.flags,
                frozen_blocks: st.frozen_blocks,
                disk_blocks: st.disk_blocks,
            }
        };
        let snapshots: Vec<SnapshotInfo> = self.list.order().iter().map(info).collect();
        let active = active_ino
            .and_then(|ino| self.list.get(ino))
            .as_ref()
            .map(info);
        StatusReport {
            read_only: self.is_read_only(),
            total_blocks,
            free_blocks: self.alloc.free_blocks(),
            needs_check,
            active,
            snapshots,
        }
    }

    /// Release every block a file holds: exclude bits cleared, blocks
    /// freed, mapping dropped.
    pub(crate) fn release_file(&self, handle: &mut TxnHandle, ino: InodeNumber) -> Result<()> {
        let geo = *self.alloc.geometry();
        let entries = self.inodes.remove(ino)?;
        for (_, phys) in entries {
            handle.extend_or_restart(6)?;
            self.exclude.mark_range(handle, &geo, phys, 1, false)?;
            self.alloc.free(handle, phys, 1)?;
        }
        Ok(())
    }

    /// Persist mappings freshly added to a snapshot file, growing its
    /// map chain in place, and refresh its record slot.
    pub(crate) fn persist_map_delta(
        &self,
        handle: &mut TxnHandle,
        rec: &Arc<SnapshotRecord>,
        added: &[(LogicalBlock, BlockNumber)],
    ) -> Result<()> {
        let geo = *self.alloc.geometry();
        let block_size = geo.block_size;
        handle.mark_side_effects();
        let mut st = rec.state();
        let new_blocks = match st.map_tail {
            Some(tail) => {
                let (tail, new_blocks) = meta::append_map(handle, &self.alloc, tail, added)?;
                st.map_tail = Some(tail);
                new_blocks
            }
            None => match meta::write_map(handle, &self.alloc, added)? {
                Some(chain) => {
                    st.map_root = Some(chain.root);
                    st.map_tail = Some(chain.tail);
                    chain.new_blocks
                }
                None => Vec::new(),
            },
        };
        st.disk_blocks += added.len() as u64;
        let raw = ctl::raw_record(rec.ino, &st);
        let slot = rec.slot;
        drop(st);
        for b in new_blocks {
            self.exclude.mark_range(handle, &geo, b, 1, true)?;
        }
        handle.extend_or_restart(1)?;
        meta::store_record(handle, block_size, slot, &raw)
    }
}
