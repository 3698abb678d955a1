//! The snapshot list: an arena of refcounted records plus the
//! newest-first chain order.
//!
//! Records are shared via `Arc`; the chain is only an ordered index of
//! inode numbers, so ordering reads never take a record lock and flag
//! updates never touch the chain. On disk the order is a singly linked
//! list of `next` pointers toward older snapshots, with the head in the
//! volume metadata block; both representations are rebuilt from that at
//! load.

use parking_lot::{Mutex, MutexGuard, RwLock};
use snapfs_error::{Result, SnapError};
use snapfs_types::{BlockNumber, Generation, InodeNumber, SnapshotFlags};
use std::collections::HashMap;
use std::sync::Arc;

/// Mutable per-snapshot state, guarded by the record's mutex.
#[derive(Debug, Clone)]
pub struct SnapState {
    pub generation: Generation,
    pub flags: SnapshotFlags,
    /// Older neighbor on the on-disk chain.
    pub next: Option<InodeNumber>,
    /// Volume size captured at take; zero until the snapshot is taken.
    pub frozen_blocks: u64,
    /// Blocks the snapshot file currently holds.
    pub disk_blocks: u64,
    /// Persisted extent map chain: first and last block.
    pub map_root: Option<BlockNumber>,
    pub map_tail: Option<BlockNumber>,
}

impl SnapState {
    #[must_use]
    pub fn taken(&self) -> bool {
        self.frozen_blocks > 0
    }
}

/// One snapshot. The record table slot ties it to disk.
pub struct SnapshotRecord {
    pub ino: InodeNumber,
    pub slot: usize,
    state: Mutex<SnapState>,
}

impl SnapshotRecord {
    #[must_use]
    pub fn new(ino: InodeNumber, slot: usize, state: SnapState) -> Arc<Self> {
        Arc::new(Self {
            ino,
            slot,
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, SnapState> {
        self.state.lock()
    }

    #[must_use]
    pub fn snapshot_state(&self) -> SnapState {
        self.state.lock().clone()
    }
}

/// Arena plus chain order.
#[derive(Default)]
pub struct SnapshotList {
    records: RwLock<HashMap<InodeNumber, Arc<SnapshotRecord>>>,
    /// Newest first.
    chain: RwLock<Vec<InodeNumber>>,
}

impl SnapshotList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, ino: InodeNumber) -> Option<Arc<SnapshotRecord>> {
        self.records.read().get(&ino).cloned()
    }

    pub fn require(&self, ino: InodeNumber) -> Result<Arc<SnapshotRecord>> {
        self.get(ino)
            .ok_or_else(|| SnapError::NotFound(format!("snapshot {ino}")))
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.records.read().contains_key(&ino)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.read().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.read().len()
    }

    /// Newest snapshot on the chain, if any.
    #[must_use]
    pub fn head(&self) -> Option<Arc<SnapshotRecord>> {
        let ino = self.chain.read().first().copied()?;
        self.get(ino)
    }

    /// Chain order, newest first.
    #[must_use]
    pub fn order(&self) -> Vec<Arc<SnapshotRecord>> {
        let chain = self.chain.read();
        let records = self.records.read();
        chain
            .iter()
            .filter_map(|ino| records.get(ino).cloned())
            .collect()
    }

    /// The on-list snapshot immediately newer than `ino`, the direction
    /// read-through falls.
    #[must_use]
    pub fn newer_neighbor(&self, ino: InodeNumber) -> Option<Arc<SnapshotRecord>> {
        let chain = self.chain.read();
        let pos = chain.iter().position(|&i| i == ino)?;
        let newer = *chain.get(pos.checked_sub(1)?)?;
        drop(chain);
        self.get(newer)
    }

    /// Register a record and link it as the new chain head.
    pub fn insert_head(&self, record: Arc<SnapshotRecord>) -> Result<()> {
        let ino = record.ino;
        let mut records = self.records.write();
        if records.contains_key(&ino) {
            return Err(SnapError::InvalidState(format!(
                "{ino} is already a snapshot"
            )));
        }
        records.insert(ino, record);
        drop(records);
        self.chain.write().insert(0, ino);
        Ok(())
    }

    /// Register a record at the chain tail, used when loading the
    /// on-disk list newest to oldest.
    pub fn insert_tail(&self, record: Arc<SnapshotRecord>) -> Result<()> {
        let ino = record.ino;
        let mut records = self.records.write();
        if records.contains_key(&ino) {
            return Err(SnapError::InvalidState(format!(
                "{ino} is already a snapshot"
            )));
        }
        records.insert(ino, record);
        drop(records);
        self.chain.write().push(ino);
        Ok(())
    }

    /// Unlink a record, returning the neighbors that must be restitched
    /// on disk: the newer neighbor (whose `next` pointer changes) and
    /// the removed record's own `next`.
    pub fn unlink(
        &self,
        ino: InodeNumber,
    ) -> Result<(Option<Arc<SnapshotRecord>>, Option<InodeNumber>)> {
        let record = self.require(ino)?;
        let older = record.state().next;

        let mut chain = self.chain.write();
        let pos = chain
            .iter()
            .position(|&i| i == ino)
            .ok_or_else(|| SnapError::InvalidState(format!("{ino} not on the chain")))?;
        chain.remove(pos);
        let newer = pos.checked_sub(1).map(|p| chain[p]);
        drop(chain);

        self.records.write().remove(&ino);
        let newer = newer.and_then(|i| self.get(i));
        if let Some(n) = &newer {
            n.state().next = older;
        }
        Ok((newer, older))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ino: u64, gen: u64) -> Arc<SnapshotRecord> {
        SnapshotRecord::new(
            InodeNumber(ino),
            ino as usize,
            SnapState {
                generation: Generation(gen),
                flags: SnapshotFlags::default(),
                next: None,
                frozen_blocks: 0,
                disk_blocks: 0,
                map_root: None,
                map_tail: None,
            },
        )
    }

    #[test]
    fn head_insertion_orders_newest_first() {
        let list = SnapshotList::new();
        list.insert_head(record(10, 1)).unwrap();
        list.insert_head(record(11, 2)).unwrap();
        list.insert_head(record(12, 3)).unwrap();

        let order: Vec<u64> = list.order().iter().map(|r| r.ino.0).collect();
        assert_eq!(order, vec![12, 11, 10]);
        assert_eq!(list.head().unwrap().ino, InodeNumber(12));
        assert!(list.insert_head(record(10, 4)).is_err());
    }

    #[test]
    fn newer_neighbor_walks_toward_the_head() {
        let list = SnapshotList::new();
        list.insert_head(record(10, 1)).unwrap();
        list.insert_head(record(11, 2)).unwrap();

        assert_eq!(
            list.newer_neighbor(InodeNumber(10)).unwrap().ino,
            InodeNumber(11)
        );
        assert!(list.newer_neighbor(InodeNumber(11)).is_none());
    }

    #[test]
    fn unlink_restitches_neighbors() {
        let list = SnapshotList::new();
        list.insert_head(record(10, 1)).unwrap();
        list.insert_head(record(11, 2)).unwrap();
        list.insert_head(record(12, 3)).unwrap();
        list.get(InodeNumber(12)).unwrap().state().next = Some(InodeNumber(11));
        list.get(InodeNumber(11)).unwrap().state().next = Some(InodeNumber(10));

        let (newer, older) = list.unlink(InodeNumber(11)).unwrap();
        assert_eq!(newer.as_ref().unwrap().ino, InodeNumber(12));
        assert_eq!(older, Some(InodeNumber(10)));
        // The newer neighbor now points past the removed record.
        assert_eq!(newer.unwrap().state().next, Some(InodeNumber(10)));
        assert_eq!(list.len(), 2);
        assert!(!list.contains(InodeNumber(11)));
    }
}
