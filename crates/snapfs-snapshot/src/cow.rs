//! The protect pipeline: decide, per write, whether the block about to
//! change was in use when the active snapshot was taken, and if so
//! capture its old contents first.
//!
//! The decision runs in stages, cheapest first: transaction-local COW
//! marker, COW bitmap run, active snapshot mapping. Only blocks that
//! survive all three get copied or moved. The whole pass runs inside
//! the caller's transaction, so the backup and the overwrite it
//! protects land together.

use std::sync::Arc;

use snapfs_alloc::{bitmap_and_not, bitmap_get, bitmap_run_len, MappedRun};
use snapfs_error::{Result, SnapError};
use snapfs_journal::TxnHandle;
use snapfs_types::{snapshot_iblock, BlockNumber, GroupNumber, InodeNumber, LogicalBlock};
use tracing::{debug, trace};

use crate::list::SnapshotRecord;
use crate::meta::{RECORD_TABLE_BLOCKS, RECORD_TABLE_START};
use crate::SnapshotEngine;

/// What the caller wants done about blocks that need protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectMode {
    /// Count the blocks that would need COW, without doing it.
    Probe,
    /// Copy old contents into the active snapshot before the overwrite.
    Copy,
    /// Remap the blocks themselves into the active snapshot; the
    /// caller rewrites the file at a fresh location.
    Move,
    /// No protection wanted, ever: set the exclude bits so these
    /// blocks never reach a snapshot.
    MarkExcluded,
}

/// Copy and Move after MarkExcluded has been peeled off.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CowAction {
    Probe,
    Copy,
    Move,
}

impl SnapshotEngine {
    /// Protect `[start, start + count)` ahead of an overwrite by the
    /// caller's transaction.
    ///
    /// `origin` names the file being written, if any; writes to files
    /// on the snapshot chain are refused. Returns the number of blocks
    /// that needed protection (for [`ProtectMode::MarkExcluded`], the
    /// number of exclude bits newly set).
    pub fn protect(
        &self,
        handle: &mut TxnHandle,
        origin: Option<InodeNumber>,
        start: BlockNumber,
        count: u32,
        mode: ProtectMode,
    ) -> Result<u64> {
        let geo = *self.alloc.geometry();
        if count == 0 {
            return Err(SnapError::Format("protect of empty range".into()));
        }
        let end = start
            .0
            .checked_add(u64::from(count))
            .filter(|&e| e <= geo.total_blocks)
            .ok_or_else(|| {
                SnapError::Format(format!("protect [{start}, +{count}) out of bounds"))
            })?;
        self.require_writable()?;

        if mode == ProtectMode::MarkExcluded
            || origin.is_some_and(|ino| self.is_excluded_file(ino))
        {
            return self
                .exclude
                .mark_range(handle, &geo, start, end - start.0, true);
        }
        if origin == Some(self.meta.lock().exclude_ino) {
            return Ok(0);
        }

        let Some(active) = self.active_record() else {
            return Ok(0);
        };
        // Reentry from our own COW writes: everything we allocate is
        // excluded already.
        if handle.cowing() {
            return Ok(0);
        }
        if let Some(ino) = origin {
            if self.list.contains(ino) {
                return Err(SnapError::PermissionDenied(format!(
                    "snapshot file {ino} is read-only"
                )));
            }
        }

        let action = match mode {
            ProtectMode::Probe => CowAction::Probe,
            ProtectMode::Copy => CowAction::Copy,
            ProtectMode::Move => CowAction::Move,
            ProtectMode::MarkExcluded => return Ok(0),
        };
        handle.set_cowing(true);
        let result = self.protect_inner(handle, origin, &active, start, end, action);
        handle.set_cowing(false);
        if result.is_err() {
            // There is no telling how far the pass got; the snapshot
            // map may already hold entries this handle never backed.
            self.fail_volume("protection failed partway");
        }
        result
    }

    fn protect_inner(
        &self,
        handle: &mut TxnHandle,
        origin: Option<InodeNumber>,
        active: &Arc<SnapshotRecord>,
        start: BlockNumber,
        end: u64,
        action: CowAction,
    ) -> Result<u64> {
        let frozen = active.state().frozen_blocks;
        if frozen == 0 {
            return Err(SnapError::InvalidState(format!(
                "active snapshot {} was never taken",
                active.ino
            )));
        }
        // Blocks past the frozen image did not exist at take time.
        let end = end.min(frozen);

        let mut touched = 0u64;
        let mut b = start.0;
        while b < end {
            let vb = BlockNumber(b);
            if handle.was_cowed(vb) {
                b += 1;
                continue;
            }
            let (in_use, run) = self.cow_bitmap_run(handle, active, vb, end - b)?;
            if !in_use {
                b += run;
                continue;
            }
            // Already captured by an earlier transaction?
            let todo = match self.inodes.run_at(active.ino, snapshot_iblock(vb), run)? {
                MappedRun::Mapped { count, .. } => {
                    for i in 0..count {
                        handle.mark_cowed(BlockNumber(b + i));
                    }
                    b += count;
                    continue;
                }
                MappedRun::Hole { count } => run.min(count),
            };
            match action {
                CowAction::Probe => {}
                CowAction::Copy => self.cow_copy_run(handle, active, vb, todo)?,
                CowAction::Move => self.cow_move_run(handle, origin, active, vb, todo)?,
            }
            touched += todo;
            b += todo;
        }
        if touched > 0 {
            trace!(
                start = %start,
                blocks = touched,
                probe = matches!(action, CowAction::Probe),
                "protect pass"
            );
        }
        Ok(touched)
    }

    /// Length of the uniform COW-bitmap run at `block`, capped at `max`
    /// and the group boundary. Returns (bit value, run length).
    fn cow_bitmap_run(
        &self,
        handle: &mut TxnHandle,
        active: &Arc<SnapshotRecord>,
        block: BlockNumber,
        max: u64,
    ) -> Result<(bool, u64)> {
        let geo = *self.alloc.geometry();
        let (group, rel) = geo.group_of(block);
        let in_group = geo.blocks_in_group(group);
        let cap = max.min(u64::from(in_group - rel)).min(u64::from(u32::MAX)) as u32;

        let cow_block = self.cow_bitmap_block(handle, active, group)?;
        let bitmap = handle.read_block(cow_block)?;
        let in_use = bitmap_get(&bitmap, rel);
        let run = bitmap_run_len(&bitmap, in_group, rel, in_use, cap);
        Ok((in_use, u64::from(run.max(1))))
    }

    /// Physical block holding `group`'s COW bitmap for the current
    /// active epoch, deriving and persisting it on first use.
    fn cow_bitmap_block(
        &self,
        handle: &mut TxnHandle,
        active: &Arc<SnapshotRecord>,
        group: GroupNumber,
    ) -> Result<BlockNumber> {
        self.cow_cache
            .get_or_derive(group, || self.derive_cow_bitmap(handle, active, group))
    }

    fn derive_cow_bitmap(
        &self,
        handle: &mut TxnHandle,
        active: &Arc<SnapshotRecord>,
        group: GroupNumber,
    ) -> Result<BlockNumber> {
        let geo = *self.alloc.geometry();
        let bitmap_block = geo.block_bitmap_block(group);
        let iblock = snapshot_iblock(bitmap_block);

        // Take wrote a masked bitmap copy into the snapshot; that copy
        // IS the COW bitmap.
        if let Some(phys) = self.inodes.lookup(active.ino, iblock) {
            return Ok(phys);
        }

        // No take-time copy (the group grew in after the take): derive
        // from the committed allocation state. The cache publishes the
        // block before this transaction commits, so this path must stay
        // unreachable while take copies a bitmap for every group; if
        // geometry growth ever lands, publication has to wait for the
        // commit.
        let committed = self.journal.committed_view(bitmap_block)?;
        let exclude = self.exclude.read(handle, group)?;
        let mut cow = vec![0u8; geo.block_size.bytes() as usize];
        bitmap_and_not(&mut cow, &committed, &exclude);

        handle.extend_or_restart(8)?;
        let got = self
            .inodes
            .map_new(handle, &self.alloc, active.ino, iblock, 1, Some(bitmap_block))?;
        handle.write_block(got.start, cow)?;
        self.exclude.mark_range(handle, &geo, got.start, 1, true)?;
        self.persist_map_delta(handle, active, &[(iblock, got.start)])?;
        debug!(%group, block = %got.start, "cow bitmap derived");
        Ok(got.start)
    }

    /// Copy `count` blocks of old contents into the active snapshot.
    fn cow_copy_run(
        &self,
        handle: &mut TxnHandle,
        active: &Arc<SnapshotRecord>,
        start: BlockNumber,
        count: u64,
    ) -> Result<()> {
        let geo = *self.alloc.geometry();
        let mut added = Vec::with_capacity(count as usize);
        let mut goal = None;
        for i in 0..count {
            let vb = BlockNumber(start.0 + i);
            let iblock = snapshot_iblock(vb);
            let guard = self.pending.begin(vb);
            // Another transaction may have captured the block while we
            // waited on its in-flight copy.
            if self.inodes.lookup(active.ino, iblock).is_some() {
                handle.mark_cowed(vb);
                drop(guard);
                continue;
            }
            handle.extend_or_restart(8)?;
            let got = self
                .inodes
                .map_new(handle, &self.alloc, active.ino, iblock, 1, goal)?;
            goal = Some(BlockNumber(got.start.0 + 1));

            let payload = if self.exclude.is_excluded(handle, &geo, vb)? {
                // Excluded yet present in the COW bitmap: the bitmaps
                // disagree. Back the block with zeroes and flag the
                // volume; the content was never meant to be captured.
                self.mark_needs_check(
                    handle,
                    &format!("excluded block {vb} found in cow bitmap"),
                )?;
                vec![0u8; geo.block_size.bytes() as usize]
            } else {
                let mut data = self.journal.committed_view(vb)?;
                if let Some(bg) = geo.bitmap_group_of(vb) {
                    // Snapshot copies of allocation bitmaps carry the
                    // exclude mask, as take-time copies do.
                    let exclude = self.exclude.read(handle, bg)?;
                    let src = data.clone();
                    bitmap_and_not(&mut data, &src, &exclude);
                }
                data
            };
            handle.write_block(got.start, payload)?;
            let flipped = self.exclude.mark_range(handle, &geo, got.start, 1, true)?;
            if flipped == 0 {
                self.mark_needs_check(
                    handle,
                    &format!("fresh snapshot block {} was already excluded", got.start),
                )?;
            }
            handle.mark_cowed(vb);
            added.push((iblock, got.start));
            drop(guard);
        }
        if !added.is_empty() {
            self.persist_map_delta(handle, active, &added)?;
        }
        Ok(())
    }

    /// Remap `count` data blocks from `origin` into the active
    /// snapshot. The blocks keep their contents; ownership moves.
    fn cow_move_run(
        &self,
        handle: &mut TxnHandle,
        origin: Option<InodeNumber>,
        active: &Arc<SnapshotRecord>,
        start: BlockNumber,
        count: u64,
    ) -> Result<()> {
        let geo = *self.alloc.geometry();
        let meta_end = RECORD_TABLE_START + RECORD_TABLE_BLOCKS;
        for i in 0..count {
            let vb = BlockNumber(start.0 + i);
            if vb.0 < meta_end || geo.bitmap_group_of(vb).is_some() {
                return Err(SnapError::Format(format!(
                    "metadata block {vb} cannot move into a snapshot"
                )));
            }
        }

        let mut added: Vec<(LogicalBlock, BlockNumber)> = Vec::with_capacity(count as usize);
        for i in 0..count {
            let vb = BlockNumber(start.0 + i);
            let iblock = snapshot_iblock(vb);
            let guard = self.pending.begin(vb);
            if self.inodes.lookup(active.ino, iblock).is_some() {
                handle.mark_cowed(vb);
                drop(guard);
                continue;
            }
            handle.extend_or_restart(4)?;
            let moved = self.inodes.map_existing(active.ino, iblock, vb, 1)?;
            handle.mark_side_effects();
            if moved != 1 {
                return Err(SnapError::InvalidState(format!(
                    "block {vb} vanished during move"
                )));
            }
            let flipped = self.exclude.mark_range(handle, &geo, vb, 1, true)?;
            if flipped == 0 {
                self.mark_needs_check(
                    handle,
                    &format!("moved block {vb} was already excluded"),
                )?;
            }
            handle.mark_cowed(vb);
            added.push((iblock, vb));
            drop(guard);
        }
        if !added.is_empty() {
            self.persist_map_delta(handle, active, &added)?;
            self.config.quota.release(origin, added.len() as u64);
            trace!(
                origin = ?origin.map(|i| i.0),
                blocks = added.len(),
                "move-on-write transferred ownership"
            );
        }
        Ok(())
    }
}
