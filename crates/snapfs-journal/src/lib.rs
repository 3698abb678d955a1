#![forbid(unsafe_code)]
//! Transactional block updates for snapfs.
//!
//! The engine performs every mutation through a [`TxnHandle`]. A handle
//! stages whole-block writes in memory and applies them to the device
//! only at commit, so a copy-on-write backup and the overwrite it
//! protects land atomically or not at all; an aborted transaction
//! leaves the on-disk pre-image untouched. Aborting a handle that had
//! already changed shared in-memory state ([`TxnHandle::mark_side_effects`])
//! poisons the journal, and the engine refuses further writes until the
//! volume is reloaded.
//!
//! Three journal-level facilities back the snapshot engine:
//!
//! - **Committed pre-images.** The first write access any running
//!   transaction takes to a block captures the block's current device
//!   contents. [`Journal::committed_view`] serves that capture until the
//!   last interested transaction ends, which is how bitmap derivation
//!   reads allocation state *as of the last commit* while writers have
//!   in-flight updates staged.
//! - **COW markers.** A block → transaction-id table recording the
//!   transaction in which a block was last backed up. A hit against the
//!   current transaction short-circuits the whole COW decision.
//! - **The freeze barrier.** [`Journal::freeze`] drains running
//!   transactions and blocks new ones until the returned guard drops.
//!   Snapshot take runs entirely inside this window via
//!   [`Journal::begin_frozen`].
//!
//! Credits bound how many distinct blocks a transaction may touch.
//! [`TxnHandle::extend_or_restart`] either raises the reservation or,
//! when the ceiling is hit, commits the staged batch and continues under
//! a fresh transaction id, the way long truncate-style operations are
//! chunked.

use parking_lot::{Condvar, Mutex};
use snapfs_block::BlockDevice;
use snapfs_error::{Result, SnapError};
use snapfs_types::{BlockNumber, TxnId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct PreImage {
    data: Vec<u8>,
    refs: usize,
}

#[derive(Default)]
struct JournalState {
    frozen: bool,
    running: usize,
    pre_images: HashMap<BlockNumber, PreImage>,
    cow_marks: HashMap<BlockNumber, TxnId>,
}

/// The journal: transaction source and freeze barrier for one volume.
pub struct Journal {
    dev: Arc<dyn BlockDevice>,
    max_credits: usize,
    state: Mutex<JournalState>,
    barrier: Condvar,
    next_tid: AtomicU64,
    poisoned: AtomicBool,
}

impl Journal {
    /// `max_credits` is the per-transaction ceiling on distinct blocks.
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>, max_credits: usize) -> Arc<Self> {
        Arc::new(Self {
            dev,
            max_credits,
            state: Mutex::new(JournalState::default()),
            barrier: Condvar::new(),
            next_tid: AtomicU64::new(1),
            poisoned: AtomicBool::new(false),
        })
    }

    /// True once a transaction that had already changed shared
    /// in-memory state (block maps, allocation bitmaps) was aborted.
    /// That state no longer matches the device and only a reload
    /// rebuilds it, so writers must stop.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poison(&self, tid: TxnId) {
        warn!(
            tid = tid.0,
            "transaction aborted after changing shared state; in-memory state is stale"
        );
        self.poisoned.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Open a transaction reserving `credits` block touches.
    ///
    /// Blocks while the journal is frozen.
    pub fn begin(self: &Arc<Self>, credits: usize) -> Result<TxnHandle> {
        self.begin_inner(credits, false)
    }

    /// Open a transaction while the journal is frozen.
    ///
    /// Only the holder of the [`FreezeGuard`] may use this; anyone else
    /// would bypass the barrier.
    pub fn begin_frozen(self: &Arc<Self>, credits: usize) -> Result<TxnHandle> {
        self.begin_inner(credits, true)
    }

    fn begin_inner(self: &Arc<Self>, credits: usize, allow_frozen: bool) -> Result<TxnHandle> {
        if credits == 0 || credits > self.max_credits {
            return Err(SnapError::Format(format!(
                "transaction credits {credits} outside 1..={}",
                self.max_credits
            )));
        }
        let mut state = self.state.lock();
        while state.frozen && !allow_frozen {
            self.barrier.wait(&mut state);
        }
        state.running += 1;
        drop(state);

        let tid = TxnId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        trace!(tid = tid.0, credits, "transaction start");
        Ok(TxnHandle {
            journal: Arc::clone(self),
            tid,
            reserved: credits,
            accessed: HashSet::new(),
            staged: HashMap::new(),
            cowing: false,
            side_effects: false,
            finished: false,
        })
    }

    /// Drain running transactions and block new ones.
    ///
    /// Must not be called while the calling thread holds an open handle,
    /// or the drain never completes.
    pub fn freeze(self: &Arc<Self>) -> FreezeGuard {
        let mut state = self.state.lock();
        state.frozen = true;
        while state.running > 0 {
            self.barrier.wait(&mut state);
        }
        drop(state);
        debug!("journal frozen");
        FreezeGuard {
            journal: Arc::clone(self),
        }
    }

    /// The block's contents as of the last commit.
    ///
    /// If a running transaction holds a pre-image for the block, that
    /// capture is returned; otherwise the device is authoritative.
    pub fn committed_view(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let state = self.state.lock();
        if let Some(pre) = state.pre_images.get(&block) {
            return Ok(pre.data.clone());
        }
        drop(state);
        Ok(self.dev.read_block(block)?.into_vec())
    }

    /// Finish a transaction: apply or discard, release pre-images,
    /// forget this transaction's COW marks, wake freeze waiters.
    fn finish(
        &self,
        tid: TxnId,
        accessed: &HashSet<BlockNumber>,
        staged: HashMap<BlockNumber, Vec<u8>>,
        apply: bool,
    ) -> Result<()> {
        let result = if apply {
            let count = staged.len();
            let mut out = Ok(());
            for (block, bytes) in staged {
                if let Err(e) = self.dev.write_block(block, &bytes) {
                    out = Err(e);
                    break;
                }
            }
            if out.is_ok() {
                out = self.dev.sync();
            }
            if out.is_ok() {
                trace!(tid = tid.0, blocks = count, "transaction commit");
            }
            out
        } else {
            debug!(tid = tid.0, "transaction abort");
            Ok(())
        };

        let mut state = self.state.lock();
        for block in accessed {
            if let Some(pre) = state.pre_images.get_mut(block) {
                pre.refs -= 1;
                if pre.refs == 0 {
                    state.pre_images.remove(block);
                }
            }
        }
        state.cow_marks.retain(|_, mark| *mark != tid);
        state.running -= 1;
        drop(state);
        self.barrier.notify_all();
        result
    }
}

/// Unfreezes the journal on drop.
pub struct FreezeGuard {
    journal: Arc<Journal>,
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        let mut state = self.journal.state.lock();
        state.frozen = false;
        drop(state);
        self.journal.barrier.notify_all();
        debug!("journal unfrozen");
    }
}

/// One running transaction.
///
/// Dropping a handle without [`commit`](TxnHandle::commit) aborts it.
pub struct TxnHandle {
    journal: Arc<Journal>,
    tid: TxnId,
    reserved: usize,
    accessed: HashSet<BlockNumber>,
    staged: HashMap<BlockNumber, Vec<u8>>,
    cowing: bool,
    side_effects: bool,
    finished: bool,
}

impl TxnHandle {
    #[must_use]
    pub fn tid(&self) -> TxnId {
        self.tid
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Credits still available before the reservation is exhausted.
    #[must_use]
    pub fn credits_left(&self) -> usize {
        self.reserved - self.accessed.len()
    }

    /// Reentrancy flag: true while this transaction is inside the COW
    /// decision engine, so nested protection requests become no-ops.
    #[must_use]
    pub fn cowing(&self) -> bool {
        self.cowing
    }

    pub fn set_cowing(&mut self, cowing: bool) {
        self.cowing = cowing;
    }

    /// Record that this transaction changed shared in-memory state
    /// that only its staged writes reconcile with disk. Aborting such
    /// a transaction poisons the journal.
    pub fn mark_side_effects(&mut self) {
        self.side_effects = true;
    }

    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        self.side_effects
    }

    /// Declare intent to modify `block`, charging one credit and
    /// capturing the committed pre-image if this is the first access by
    /// any running transaction.
    pub fn get_write_access(&mut self, block: BlockNumber) -> Result<()> {
        if self.accessed.contains(&block) {
            return Ok(());
        }
        if self.accessed.len() >= self.reserved {
            return Err(SnapError::Format(format!(
                "transaction {} out of credits ({} reserved)",
                self.tid.0, self.reserved
            )));
        }
        // Capture before staging so committed_view stays pre-modification.
        let mut state = self.journal.state.lock();
        if let Some(pre) = state.pre_images.get_mut(&block) {
            pre.refs += 1;
        } else {
            drop(state);
            let data = self.journal.dev.read_block(block)?.into_vec();
            state = self.journal.state.lock();
            state
                .pre_images
                .entry(block)
                .and_modify(|p| p.refs += 1)
                .or_insert(PreImage { data, refs: 1 });
        }
        drop(state);
        self.accessed.insert(block);
        Ok(())
    }

    /// Like [`get_write_access`](Self::get_write_access), named for call
    /// sites that depend on the pre-image being readable afterwards
    /// (bitmap derivation against the committed allocation state).
    pub fn get_undo_access(&mut self, block: BlockNumber) -> Result<()> {
        self.get_write_access(block)
    }

    /// Read through this transaction: staged bytes win over the device.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        if let Some(bytes) = self.staged.get(&block) {
            return Ok(bytes.clone());
        }
        Ok(self.journal.dev.read_block(block)?.into_vec())
    }

    /// Stage a whole-block write; acquires write access if needed.
    pub fn write_block(&mut self, block: BlockNumber, bytes: Vec<u8>) -> Result<()> {
        let bs = self.journal.dev.block_size().bytes() as usize;
        if bytes.len() != bs {
            return Err(SnapError::Format(format!(
                "staged write of {} bytes, block size is {bs}",
                bytes.len()
            )));
        }
        self.get_write_access(block)?;
        self.staged.insert(block, bytes);
        Ok(())
    }

    /// Record that `block` was backed up under this transaction.
    pub fn mark_cowed(&self, block: BlockNumber) {
        let mut state = self.journal.state.lock();
        state.cow_marks.insert(block, self.tid);
    }

    /// Was `block` already backed up under this transaction?
    #[must_use]
    pub fn was_cowed(&self, block: BlockNumber) -> bool {
        let state = self.journal.state.lock();
        state.cow_marks.get(&block) == Some(&self.tid)
    }

    /// Ensure at least `more` credits remain, restarting if the ceiling
    /// does not allow extension. A restart commits the staged batch and
    /// continues under a new transaction id; callers must re-validate
    /// any decision derived from this transaction's COW marks.
    pub fn extend_or_restart(&mut self, more: usize) -> Result<()> {
        if self.credits_left() >= more {
            return Ok(());
        }
        let wanted = self.accessed.len() + more;
        if wanted <= self.journal.max_credits {
            debug!(
                tid = self.tid.0,
                from = self.reserved,
                to = wanted,
                "transaction extend"
            );
            self.reserved = wanted;
            return Ok(());
        }
        if more > self.journal.max_credits {
            return Err(SnapError::Format(format!(
                "cannot reserve {more} credits (ceiling {})",
                self.journal.max_credits
            )));
        }
        debug!(tid = self.tid.0, more, "transaction restart");
        let staged = std::mem::take(&mut self.staged);
        let accessed = std::mem::take(&mut self.accessed);
        let old_tid = self.tid;
        // The journal's running count carries over: finish() decrements
        // and begin of the successor increments, but no new begin happens
        // here, so re-register before finishing.
        {
            let mut state = self.journal.state.lock();
            state.running += 1;
        }
        self.journal.finish(old_tid, &accessed, staged, true)?;
        self.tid = TxnId(self.journal.next_tid.fetch_add(1, Ordering::Relaxed));
        self.reserved = more;
        // Side effects so far are now committed; only changes made
        // under the successor id are at stake on a later abort.
        self.side_effects = false;
        Ok(())
    }

    /// Apply all staged writes and sync the device.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        let accessed = std::mem::take(&mut self.accessed);
        self.journal.finish(self.tid, &accessed, staged, true)
    }

    /// Discard all staged writes.
    pub fn abort(mut self) {
        self.finished = true;
        if self.side_effects {
            self.journal.poison(self.tid);
        }
        let staged = std::mem::take(&mut self.staged);
        let accessed = std::mem::take(&mut self.accessed);
        // Discard path cannot fail.
        let _ = self.journal.finish(self.tid, &accessed, staged, false);
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        if !self.finished {
            warn!(tid = self.tid.0, "transaction dropped without commit");
            if self.side_effects {
                self.journal.poison(self.tid);
            }
            let staged = std::mem::take(&mut self.staged);
            let accessed = std::mem::take(&mut self.accessed);
            let _ = self.journal.finish(self.tid, &accessed, staged, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapfs_block::{ByteBlockDevice, MemByteDevice};
    use snapfs_types::BlockSize;
    use std::time::Duration;

    fn journal(blocks: u64) -> Arc<Journal> {
        let bs = BlockSize::new(1024).unwrap();
        let dev = ByteBlockDevice::new(MemByteDevice::new((blocks * 1024) as usize), bs).unwrap();
        Journal::new(Arc::new(dev), 64)
    }

    fn block_of(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    #[test]
    fn staged_writes_apply_only_on_commit() {
        let j = journal(16);
        let mut h = j.begin(4).unwrap();
        h.write_block(BlockNumber(3), block_of(0xAA, 1024)).unwrap();

        // Not on the device yet.
        assert_eq!(j.device().read_block(BlockNumber(3)).unwrap().as_slice()[0], 0);
        // But visible through the handle.
        assert_eq!(h.read_block(BlockNumber(3)).unwrap()[0], 0xAA);

        h.commit().unwrap();
        assert_eq!(
            j.device().read_block(BlockNumber(3)).unwrap().as_slice()[0],
            0xAA
        );
    }

    #[test]
    fn abort_preserves_pre_image() {
        let j = journal(16);
        j.device()
            .write_block(BlockNumber(5), &block_of(0x11, 1024))
            .unwrap();

        let mut h = j.begin(4).unwrap();
        h.write_block(BlockNumber(5), block_of(0x22, 1024)).unwrap();
        h.abort();

        assert_eq!(
            j.device().read_block(BlockNumber(5)).unwrap().as_slice()[0],
            0x11
        );
    }

    #[test]
    fn committed_view_ignores_in_flight_writes() {
        let j = journal(16);
        j.device()
            .write_block(BlockNumber(2), &block_of(0x33, 1024))
            .unwrap();

        let mut h = j.begin(4).unwrap();
        h.get_undo_access(BlockNumber(2)).unwrap();
        h.write_block(BlockNumber(2), block_of(0x44, 1024)).unwrap();

        assert_eq!(j.committed_view(BlockNumber(2)).unwrap()[0], 0x33);
        h.commit().unwrap();
        assert_eq!(j.committed_view(BlockNumber(2)).unwrap()[0], 0x44);
    }

    #[test]
    fn cow_marks_are_transaction_scoped() {
        let j = journal(16);
        let h1 = j.begin(4).unwrap();
        let h2 = j.begin(4).unwrap();

        h1.mark_cowed(BlockNumber(7));
        assert!(h1.was_cowed(BlockNumber(7)));
        assert!(!h2.was_cowed(BlockNumber(7)));

        h1.commit().unwrap();
        // A later transaction never sees the finished transaction's mark.
        let h3 = j.begin(4).unwrap();
        assert!(!h3.was_cowed(BlockNumber(7)));
        h2.abort();
        h3.abort();
    }

    #[test]
    fn abort_with_side_effects_poisons_the_journal() {
        let j = journal(16);
        let mut h = j.begin(4).unwrap();
        h.write_block(BlockNumber(3), block_of(0x55, 1024)).unwrap();
        h.mark_side_effects();
        h.abort();
        assert!(j.is_poisoned());
    }

    #[test]
    fn committed_side_effects_do_not_poison() {
        let j = journal(16);
        let mut h = j.begin(4).unwrap();
        h.write_block(BlockNumber(3), block_of(0x55, 1024)).unwrap();
        h.mark_side_effects();
        h.commit().unwrap();
        assert!(!j.is_poisoned());

        // A plain abort with nothing shared at stake is harmless.
        let h = j.begin(4).unwrap();
        h.abort();
        assert!(!j.is_poisoned());
    }

    #[test]
    fn credits_are_enforced_and_extend_works() {
        let j = journal(16);
        let mut h = j.begin(2).unwrap();
        h.get_write_access(BlockNumber(0)).unwrap();
        h.get_write_access(BlockNumber(1)).unwrap();
        assert!(h.get_write_access(BlockNumber(2)).is_err());

        h.extend_or_restart(3).unwrap();
        h.get_write_access(BlockNumber(2)).unwrap();
        h.commit().unwrap();
    }

    #[test]
    fn restart_commits_and_continues() {
        let j = journal(128);
        let mut h = j.begin(64).unwrap();
        let first_tid = h.tid();
        for i in 0..64 {
            h.write_block(BlockNumber(i), block_of(0x55, 1024)).unwrap();
        }
        // Ceiling reached: this must restart, flushing the batch.
        h.extend_or_restart(8).unwrap();
        assert_ne!(h.tid(), first_tid);
        assert_eq!(
            j.device().read_block(BlockNumber(63)).unwrap().as_slice()[0],
            0x55
        );
        h.write_block(BlockNumber(64), block_of(0x66, 1024)).unwrap();
        h.commit().unwrap();
        assert_eq!(
            j.device().read_block(BlockNumber(64)).unwrap().as_slice()[0],
            0x66
        );
    }

    #[test]
    fn freeze_drains_and_blocks_new_transactions() {
        let j = journal(16);
        let h = j.begin(4).unwrap();

        let j2 = Arc::clone(&j);
        let freezer = std::thread::spawn(move || {
            let guard = j2.freeze();
            // Inside the window only begin_frozen works.
            let mut fh = j2.begin_frozen(4).unwrap();
            fh.write_block(BlockNumber(1), vec![0x77; 1024]).unwrap();
            fh.commit().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
        });

        // Give the freezer a moment to start waiting on the drain.
        std::thread::sleep(Duration::from_millis(20));
        h.commit().unwrap();

        // This begin must block until the guard drops, then succeed.
        let h2 = j.begin(4).unwrap();
        h2.abort();
        freezer.join().unwrap();
        assert_eq!(
            j.device().read_block(BlockNumber(1)).unwrap().as_slice()[0],
            0x77
        );
    }
}
