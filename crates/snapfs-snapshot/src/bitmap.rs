//! COW bitmap cache and exclude bitmap maintenance.
//!
//! The COW bitmap of a group answers "was this block in use when the
//! active snapshot was taken". It is derived at most once per group per
//! active-snapshot epoch: committed allocation bitmap AND NOT exclude
//! bitmap, stored as a block of the active snapshot file. The cache
//! slot for a group is three-state:
//!
//! - `Unset`: not derived this epoch.
//! - `Pending`: some transaction is deriving it right now; everyone
//!   else waits on the group's condvar.
//! - `Resolved`: holds the bitmap's physical block.
//!
//! A failed derivation returns the slot to `Unset` so a later caller
//! retries. [`CowBitmapCache::reset`] starts a new epoch, invalidating
//! any derivation still in flight.
//!
//! Exclude bitmaps are persistent, one block per group, file-backed by
//! the exclude inode. Blocks owned by snapshot files are marked here so
//! snapshots never copy one another's storage.

use parking_lot::{Condvar, Mutex, RwLock};
use snapfs_alloc::{bitmap_clear, bitmap_get, bitmap_set, FsGeometry};
use snapfs_error::{Result, SnapError};
use snapfs_journal::TxnHandle;
use snapfs_types::{BlockNumber, GroupNumber};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

// ── COW bitmap cache ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CowSlot {
    Unset,
    Pending,
    Resolved(BlockNumber),
}

struct GroupSlot {
    state: Mutex<CowSlot>,
    cond: Condvar,
}

pub struct CowBitmapCache {
    groups: Vec<GroupSlot>,
    epoch: AtomicU64,
}

impl CowBitmapCache {
    #[must_use]
    pub fn new(group_count: u32) -> Self {
        let groups = (0..group_count)
            .map(|_| GroupSlot {
                state: Mutex::new(CowSlot::Unset),
                cond: Condvar::new(),
            })
            .collect();
        Self {
            groups,
            epoch: AtomicU64::new(0),
        }
    }

    /// Start a new epoch: every slot back to `Unset`, waiters woken.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for slot in &self.groups {
            let mut state = slot.state.lock();
            *state = CowSlot::Unset;
            drop(state);
            slot.cond.notify_all();
        }
        debug!("cow bitmap cache reset");
    }

    /// Resolved block for `group`, deriving via `derive` if needed.
    ///
    /// Exactly one caller runs `derive` per epoch; concurrent callers
    /// block until it resolves or fails.
    pub fn get_or_derive(
        &self,
        group: GroupNumber,
        derive: impl FnOnce() -> Result<BlockNumber>,
    ) -> Result<BlockNumber> {
        let slot = self
            .groups
            .get(group.0 as usize)
            .ok_or_else(|| SnapError::Format(format!("{group} out of range")))?;

        let mut state = slot.state.lock();
        loop {
            match *state {
                CowSlot::Resolved(block) => return Ok(block),
                CowSlot::Pending => slot.cond.wait(&mut state),
                CowSlot::Unset => break,
            }
        }
        *state = CowSlot::Pending;
        let epoch = self.epoch.load(Ordering::Acquire);
        drop(state);

        let result = derive();

        let mut state = slot.state.lock();
        // A reset during derivation moved the slot to a new epoch; the
        // stale result must not be published there.
        let stale = self.epoch.load(Ordering::Acquire) != epoch;
        match (&result, stale) {
            (Ok(block), false) => {
                trace!(%group, %block, "cow bitmap resolved");
                *state = CowSlot::Resolved(*block);
            }
            _ => {
                if *state == CowSlot::Pending {
                    *state = CowSlot::Unset;
                }
            }
        }
        drop(state);
        slot.cond.notify_all();
        result
    }

    /// Resolved block for `group` if this epoch derived one.
    #[must_use]
    pub fn peek(&self, group: GroupNumber) -> Option<BlockNumber> {
        let slot = self.groups.get(group.0 as usize)?;
        match *slot.state.lock() {
            CowSlot::Resolved(block) => Some(block),
            _ => None,
        }
    }
}

// ── Exclude bitmaps ─────────────────────────────────────────────────────────

/// Per-group exclude bitmap block pointers, cached off the exclude
/// inode's map.
pub struct ExcludeBitmaps {
    blocks: RwLock<Vec<Option<BlockNumber>>>,
}

impl ExcludeBitmaps {
    #[must_use]
    pub fn new(group_count: u32) -> Self {
        Self {
            blocks: RwLock::new(vec![None; group_count as usize]),
        }
    }

    pub fn set_block(&self, group: GroupNumber, block: BlockNumber) {
        let mut blocks = self.blocks.write();
        if let Some(slot) = blocks.get_mut(group.0 as usize) {
            *slot = Some(block);
        }
    }

    #[must_use]
    pub fn block_of(&self, group: GroupNumber) -> Option<BlockNumber> {
        self.blocks.read().get(group.0 as usize).copied().flatten()
    }

    fn require_block(&self, group: GroupNumber) -> Result<BlockNumber> {
        self.block_of(group).ok_or_else(|| SnapError::Inconsistency {
            detail: format!("no exclude bitmap for {group}"),
        })
    }

    /// The group's exclude bitmap through the transaction's view.
    pub fn read(&self, handle: &TxnHandle, group: GroupNumber) -> Result<Vec<u8>> {
        handle.read_block(self.require_block(group)?)
    }

    /// Is `block` marked excluded, per the transaction's view.
    pub fn is_excluded(&self, handle: &TxnHandle, geo: &FsGeometry, block: BlockNumber) -> Result<bool> {
        let (group, rel) = geo.group_of(block);
        let bitmap = self.read(handle, group)?;
        Ok(bitmap_get(&bitmap, rel))
    }

    /// Set or clear exclude bits for `[start, start + count)`, staging
    /// only bitmaps that actually changed. Returns the number of bits
    /// flipped, so callers can detect the already-marked (idempotent)
    /// case.
    pub fn mark_range(
        &self,
        handle: &mut TxnHandle,
        geo: &FsGeometry,
        start: BlockNumber,
        count: u64,
        set: bool,
    ) -> Result<u64> {
        let mut flipped = 0u64;
        let mut block = start.0;
        let end = start.0.checked_add(count).ok_or_else(|| {
            SnapError::Format(format!("exclude range overflow at {start}"))
        })?;
        while block < end {
            let (group, rel) = geo.group_of(BlockNumber(block));
            let in_group = u64::from(geo.blocks_in_group(group) - rel).min(end - block);
            let bitmap_block = self.require_block(group)?;
            handle.extend_or_restart(2)?;
            let mut bitmap = handle.read_block(bitmap_block)?;
            let mut changed = false;
            for i in 0..in_group {
                let bit = rel + i as u32;
                if bitmap_get(&bitmap, bit) != set {
                    if set {
                        bitmap_set(&mut bitmap, bit);
                    } else {
                        bitmap_clear(&mut bitmap, bit);
                    }
                    changed = true;
                    flipped += 1;
                }
            }
            if changed {
                handle.write_block(bitmap_block, bitmap)?;
            }
            block += in_group;
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn single_derivation_per_epoch() {
        let cache = Arc::new(CowBitmapCache::new(2));
        let derivations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let derivations = Arc::clone(&derivations);
            handles.push(std::thread::spawn(move || {
                cache
                    .get_or_derive(GroupNumber(0), || {
                        derivations.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        Ok(BlockNumber(42))
                    })
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), BlockNumber(42));
        }
        assert_eq!(derivations.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek(GroupNumber(0)), Some(BlockNumber(42)));
    }

    #[test]
    fn failed_derivation_retries() {
        let cache = CowBitmapCache::new(1);
        let err = cache
            .get_or_derive(GroupNumber(0), || Err(SnapError::NoSpace))
            .unwrap_err();
        assert!(matches!(err, SnapError::NoSpace));
        assert_eq!(cache.peek(GroupNumber(0)), None);

        let block = cache
            .get_or_derive(GroupNumber(0), || Ok(BlockNumber(7)))
            .unwrap();
        assert_eq!(block, BlockNumber(7));
    }

    #[test]
    fn reset_invalidates_resolved_slots() {
        let cache = CowBitmapCache::new(1);
        cache
            .get_or_derive(GroupNumber(0), || Ok(BlockNumber(9)))
            .unwrap();
        cache.reset();
        assert_eq!(cache.peek(GroupNumber(0)), None);
        let block = cache
            .get_or_derive(GroupNumber(0), || Ok(BlockNumber(10)))
            .unwrap();
        assert_eq!(block, BlockNumber(10));
    }

    #[test]
    fn reset_during_derivation_discards_the_stale_result() {
        let cache = Arc::new(CowBitmapCache::new(1));
        let cache2 = Arc::clone(&cache);
        let worker = std::thread::spawn(move || {
            cache2.get_or_derive(GroupNumber(0), || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                Ok(BlockNumber(1))
            })
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.reset();
        worker.join().unwrap().unwrap();
        // The pre-reset derivation must not be visible in the new epoch.
        assert_eq!(cache.peek(GroupNumber(0)), None);
    }
}
