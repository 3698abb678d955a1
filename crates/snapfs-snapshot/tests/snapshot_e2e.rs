//! End-to-end scenarios driving the engine the way a host would:
//! format, snapshot lifecycle, protected overwrites, read-through,
//! deletion and cleanup, and reload from the same device.

use std::sync::{Arc, Mutex};

use snapfs_block::{BlockDevice, ByteBlockDevice, MemByteDevice};
use snapfs_error::SnapError;
use snapfs_snapshot::{EngineConfig, ProtectMode, QuotaSink, SnapshotEngine, VolumeParams};
use snapfs_types::{BlockNumber, BlockSize, InodeNumber, LogicalBlock};

const BS: u32 = 1024;

fn test_device(total_blocks: u64) -> Arc<dyn BlockDevice> {
    let bytes = MemByteDevice::new(total_blocks as usize * BS as usize);
    Arc::new(ByteBlockDevice::new(bytes, BlockSize::new(BS).unwrap()).unwrap())
}

fn params(total_blocks: u64) -> VolumeParams {
    VolumeParams {
        block_size: BlockSize::new(BS).unwrap(),
        blocks_per_group: 64,
        total_blocks,
    }
}

fn formatted(total_blocks: u64) -> (Arc<dyn BlockDevice>, Arc<SnapshotEngine>) {
    formatted_with(total_blocks, EngineConfig::default())
}

fn formatted_with(
    total_blocks: u64,
    config: EngineConfig,
) -> (Arc<dyn BlockDevice>, Arc<SnapshotEngine>) {
    let dev = test_device(total_blocks);
    let engine = SnapshotEngine::format(Arc::clone(&dev), &params(total_blocks), config).unwrap();
    (dev, engine)
}

/// Allocate one block and commit `fill` into it.
fn write_fresh(engine: &SnapshotEngine, fill: u8) -> BlockNumber {
    let mut h = engine.journal().begin(16).unwrap();
    let got = engine.allocator().alloc(&mut h, 1, None).unwrap();
    h.write_block(got.start, vec![fill; BS as usize]).unwrap();
    h.commit().unwrap();
    got.start
}

/// Overwrite `block` with `fill` under copy protection.
fn overwrite(engine: &SnapshotEngine, block: BlockNumber, fill: u8) {
    let mut h = engine.journal().begin(64).unwrap();
    engine
        .protect(&mut h, None, block, 1, ProtectMode::Copy)
        .unwrap();
    h.write_block(block, vec![fill; BS as usize]).unwrap();
    h.commit().unwrap();
}

fn snap(engine: &SnapshotEngine, ino: u64) -> InodeNumber {
    let ino = InodeNumber(ino);
    engine.create(ino).unwrap();
    engine.take(ino).unwrap();
    ino
}

#[test]
fn first_write_wins_across_transactions() {
    let (_dev, engine) = formatted(256);
    let block = write_fresh(&engine, 0x11);
    let snap_a = snap(&engine, 10);

    overwrite(&engine, block, 0x22);
    overwrite(&engine, block, 0x33);

    // The snapshot keeps the contents from take time, not the
    // intermediate overwrite.
    let frozen = engine.read_snapshot_block(snap_a, block).unwrap();
    assert_eq!(frozen, vec![0x11; BS as usize]);
}

#[test]
fn read_through_a_three_snapshot_chain() {
    let (_dev, engine) = formatted(512);
    let hot = write_fresh(&engine, 0xA1); // rewritten in every epoch
    let cold = write_fresh(&engine, 0xC1); // rewritten only at the end

    let snap_a = snap(&engine, 10);
    overwrite(&engine, hot, 0xA2);
    let snap_b = snap(&engine, 11);
    overwrite(&engine, hot, 0xA3);
    let snap_c = snap(&engine, 12);
    overwrite(&engine, hot, 0xA4);
    overwrite(&engine, cold, 0xC2);

    // Each snapshot sees the hot block as of its own take.
    assert_eq!(
        engine.read_snapshot_block(snap_a, hot).unwrap(),
        vec![0xA1; BS as usize]
    );
    assert_eq!(
        engine.read_snapshot_block(snap_b, hot).unwrap(),
        vec![0xA2; BS as usize]
    );
    assert_eq!(
        engine.read_snapshot_block(snap_c, hot).unwrap(),
        vec![0xA3; BS as usize]
    );

    // The cold block was captured only by the newest snapshot; the
    // older ones resolve it by walking toward newer snapshots.
    assert_eq!(
        engine.read_snapshot_block(snap_a, cold).unwrap(),
        vec![0xC1; BS as usize]
    );
    assert_eq!(
        engine.read_snapshot_block(snap_b, cold).unwrap(),
        vec![0xC1; BS as usize]
    );

    // A block never rewritten resolves to the live volume.
    let untouched = write_fresh(&engine, 0xEE);
    let snap_d = snap(&engine, 13);
    assert_eq!(
        engine.read_snapshot_block(snap_d, untouched).unwrap(),
        vec![0xEE; BS as usize]
    );
}

#[test]
fn deleted_snapshot_still_serves_older_readers() {
    let (_dev, engine) = formatted(512);
    let block = write_fresh(&engine, 0x44);

    let snap_a = snap(&engine, 10);
    let snap_b = snap(&engine, 11);
    overwrite(&engine, block, 0x55); // captured by B

    engine.delete(snap_b).unwrap();

    // B is deleted but in_use: A resolves the block through B's copy.
    assert_eq!(
        engine.read_snapshot_block(snap_a, block).unwrap(),
        vec![0x44; BS as usize]
    );
    // B itself is no longer readable.
    assert!(matches!(
        engine.read_snapshot_block(snap_b, block),
        Err(SnapError::InvalidState(_))
    ));
}

#[test]
fn cleanup_merges_deleted_snapshot_into_older_neighbor() {
    let (_dev, engine) = formatted(512);
    let block = write_fresh(&engine, 0x44);

    let snap_a = snap(&engine, 10);
    let snap_b = snap(&engine, 11);
    overwrite(&engine, block, 0x55);
    let _snap_c = snap(&engine, 12);

    engine.delete(snap_b).unwrap();
    let before = engine.status().free_blocks;
    engine.cleanup().unwrap();
    let status = engine.status();

    // B is gone, its needed capture now lives in A.
    assert!(status.snapshots.iter().all(|s| s.ino != snap_b.0));
    assert_eq!(status.snapshots.len(), 2);
    assert!(status.free_blocks > before);
    assert_eq!(
        engine.read_snapshot_block(snap_a, block).unwrap(),
        vec![0x44; BS as usize]
    );
}

#[test]
fn cleanup_frees_captures_the_older_survivor_does_not_need() {
    let (_dev, engine) = formatted(512);
    let block = write_fresh(&engine, 0x44);

    let snap_a = snap(&engine, 10);
    overwrite(&engine, block, 0x55);
    let snap_b = snap(&engine, 11);
    overwrite(&engine, block, 0x66);
    let snap_c = snap(&engine, 12);

    // A holds its own capture of `block`, so B's duplicate is pure
    // overhead once B is deleted.
    engine.delete(snap_b).unwrap();
    let before = engine.status().free_blocks;
    engine.cleanup().unwrap();
    let status = engine.status();

    assert!(status.snapshots.iter().all(|s| s.ino != snap_b.0));
    assert!(status.free_blocks > before);
    assert_eq!(
        engine.read_snapshot_block(snap_a, block).unwrap(),
        vec![0x44; BS as usize]
    );
    // C never captured the block; it resolves to the live volume.
    assert_eq!(
        engine.read_snapshot_block(snap_c, block).unwrap(),
        vec![0x66; BS as usize]
    );
}

#[test]
fn chain_survives_reload() {
    let (dev, engine) = formatted(512);
    let block = write_fresh(&engine, 0x61);
    let snap_a = snap(&engine, 10);
    overwrite(&engine, block, 0x62);
    let snap_b = snap(&engine, 11);
    overwrite(&engine, block, 0x63);
    drop(engine);

    let engine = SnapshotEngine::load(dev, EngineConfig::default()).unwrap();
    let status = engine.status();
    assert!(!status.read_only);
    let inos: Vec<u64> = status.snapshots.iter().map(|s| s.ino).collect();
    assert_eq!(inos, vec![snap_b.0, snap_a.0]);
    assert_eq!(status.active.unwrap().ino, snap_b.0);

    assert_eq!(
        engine.read_snapshot_block(snap_a, block).unwrap(),
        vec![0x61; BS as usize]
    );
    assert_eq!(
        engine.read_snapshot_block(snap_b, block).unwrap(),
        vec![0x62; BS as usize]
    );

    // COW still works against the reloaded chain.
    overwrite(&engine, block, 0x64);
    assert_eq!(
        engine.read_snapshot_block(snap_b, block).unwrap(),
        vec![0x62; BS as usize]
    );
}

#[derive(Clone, Default)]
struct CountingQuota {
    calls: Arc<Mutex<Vec<(Option<u64>, u64)>>>,
}

impl QuotaSink for CountingQuota {
    fn release(&self, origin: Option<InodeNumber>, blocks: u64) {
        self.calls.lock().unwrap().push((origin.map(|i| i.0), blocks));
    }
}

#[test]
fn move_on_write_transfers_ownership_and_notifies_quota() {
    let quota = CountingQuota::default();
    let config = EngineConfig {
        quota: Box::new(quota.clone()),
        ..EngineConfig::default()
    };
    let (_dev, engine) = formatted_with(512, config);

    let file = InodeNumber(50);
    engine.inode_table().create(file).unwrap();
    let block = write_fresh(&engine, 0x77);
    engine
        .inode_table()
        .install(file, [(LogicalBlock(0), block)])
        .unwrap();

    let snap_a = snap(&engine, 10);

    let mut h = engine.journal().begin(64).unwrap();
    let moved = engine
        .protect(&mut h, Some(file), block, 1, ProtectMode::Move)
        .unwrap();
    assert_eq!(moved, 1);
    h.commit().unwrap();

    // The block itself became snapshot storage; its contents were
    // never rewritten.
    assert_eq!(
        engine.read_snapshot_block(snap_a, block).unwrap(),
        vec![0x77; BS as usize]
    );
    assert_eq!(quota.calls.lock().unwrap().as_slice(), &[(Some(50), 1)]);
}

#[test]
fn snapshot_files_reject_writes() {
    let (_dev, engine) = formatted(256);
    let block = write_fresh(&engine, 0x10);
    let snap_a = snap(&engine, 10);

    let mut h = engine.journal().begin(16).unwrap();
    let err = engine
        .protect(&mut h, Some(snap_a), block, 1, ProtectMode::Copy)
        .unwrap_err();
    assert!(matches!(err, SnapError::PermissionDenied(_)));
    h.abort();
}

#[test]
fn bitmap_copies_mask_excluded_blocks() {
    let (_dev, engine) = formatted(256);
    let data = write_fresh(&engine, 0x42);
    let snap_a = snap(&engine, 10);

    // The snapshot's copy of each allocation bitmap shows data blocks
    // allocated but hides snapshot infrastructure: the snapshot's own
    // storage and the exclude bitmaps are masked out of the copy even
    // though the live bitmap has them allocated.
    let geo = *engine.allocator().geometry();
    let (data_group, data_rel) = geo.group_of(data);
    let copy = engine
        .read_snapshot_block(snap_a, geo.block_bitmap_block(data_group))
        .unwrap();
    assert!(snapfs_alloc::bitmap_get(&copy, data_rel));

    let mut infrastructure: Vec<BlockNumber> = engine
        .inode_table()
        .mappings(snap_a)
        .unwrap()
        .into_iter()
        .map(|(_, phys)| phys)
        .collect();
    infrastructure.extend(
        engine
            .inode_table()
            .mappings(snapfs_snapshot::EXCLUDE_INODE)
            .unwrap()
            .into_iter()
            .map(|(_, phys)| phys),
    );
    assert!(!infrastructure.is_empty());
    for phys in infrastructure {
        let (group, rel) = geo.group_of(phys);
        let copy = engine
            .read_snapshot_block(snap_a, geo.block_bitmap_block(group))
            .unwrap();
        let live = engine
            .journal()
            .device()
            .read_block(geo.block_bitmap_block(group))
            .unwrap();
        assert!(
            snapfs_alloc::bitmap_get(live.as_slice(), rel),
            "{phys} should be allocated on the live bitmap"
        );
        assert!(
            !snapfs_alloc::bitmap_get(&copy, rel),
            "{phys} leaked into the snapshot's bitmap copy"
        );
    }
}

#[test]
fn excluded_file_contents_never_reach_snapshots() {
    let (_dev, engine) = formatted(256);
    let secret = write_fresh(&engine, 0x99);
    let file = InodeNumber(60);
    engine.inode_table().create(file).unwrap();
    engine
        .inode_table()
        .install(file, [(LogicalBlock(0), secret)])
        .unwrap();

    let snap_a = snap(&engine, 10);

    // Excluding after the take is an inconsistency the engine repairs
    // forward: the COW bitmap says the block needs a backup, but the
    // backup must not carry the contents.
    let mut h = engine.journal().begin(64).unwrap();
    engine.exclude_file(&mut h, file).unwrap();
    h.commit().unwrap();

    let mut h = engine.journal().begin(64).unwrap();
    engine
        .protect(&mut h, None, secret, 1, ProtectMode::Copy)
        .unwrap();
    h.write_block(secret, vec![0x00; BS as usize]).unwrap();
    h.commit().unwrap();

    assert_eq!(
        engine.read_snapshot_block(snap_a, secret).unwrap(),
        vec![0u8; BS as usize]
    );
    assert!(engine.status().needs_check);
}

#[test]
fn take_honors_the_reserve_floor() {
    let config = EngineConfig {
        reserved_floor: u64::MAX,
        ..EngineConfig::default()
    };
    let (_dev, engine) = formatted_with(256, config);
    engine.create(InodeNumber(10)).unwrap();
    assert!(matches!(engine.take(InodeNumber(10)), Err(SnapError::NoSpace)));

    // Nothing of the failed take is visible: no active snapshot, the
    // candidate is still untaken, and the volume stays writable.
    let status = engine.status();
    assert!(status.active.is_none());
    assert_eq!(status.snapshots.len(), 1);
    assert_eq!(status.snapshots[0].frozen_blocks, 0);
    assert!(!status.read_only);
}

#[test]
fn strict_reads_reject_unallocated_read_through() {
    let config = EngineConfig {
        strict_read_checks: true,
        ..EngineConfig::default()
    };
    let (_dev, engine) = formatted_with(256, config);
    let data = write_fresh(&engine, 0x13);
    let snap_a = snap(&engine, 10);

    // Allocated block: read-through is fine.
    assert_eq!(
        engine.read_snapshot_block(snap_a, data).unwrap(),
        vec![0x13; BS as usize]
    );

    // A block that was free at take time was never in the image.
    let free_block = {
        let geo = *engine.allocator().geometry();
        (0..geo.total_blocks)
            .map(BlockNumber)
            .find(|&b| !engine.allocator().is_allocated(b))
            .unwrap()
    };
    assert!(matches!(
        engine.read_snapshot_block(snap_a, free_block),
        Err(SnapError::Corruption { .. })
    ));
}

#[test]
fn protection_is_idempotent_within_a_transaction() {
    let (_dev, engine) = formatted(512);
    let block = write_fresh(&engine, 0x21);
    let snap_a = snap(&engine, 10);

    let mut h = engine.journal().begin(64).unwrap();
    assert_eq!(
        engine
            .protect(&mut h, None, block, 1, ProtectMode::Copy)
            .unwrap(),
        1
    );
    let held = engine.status().snapshots[0].disk_blocks;
    // Same block, same transaction: the first backup already covers it.
    assert_eq!(
        engine
            .protect(&mut h, None, block, 1, ProtectMode::Copy)
            .unwrap(),
        0
    );
    assert_eq!(engine.status().snapshots[0].disk_blocks, held);
    h.write_block(block, vec![0x22; BS as usize]).unwrap();
    h.commit().unwrap();

    assert_eq!(
        engine.read_snapshot_block(snap_a, block).unwrap(),
        vec![0x21; BS as usize]
    );
}

#[test]
fn aborting_a_protected_transaction_fails_the_volume() {
    let (_dev, engine) = formatted(512);
    let block = write_fresh(&engine, 0x11);
    snap(&engine, 10);

    let mut h = engine.journal().begin(64).unwrap();
    assert_eq!(
        engine
            .protect(&mut h, None, block, 1, ProtectMode::Copy)
            .unwrap(),
        1
    );
    h.abort();

    // The backup only existed in the aborted transaction; the engine
    // refuses further writes rather than overwrite unprotected.
    let mut h = engine.journal().begin(64).unwrap();
    assert!(matches!(
        engine.protect(&mut h, None, block, 1, ProtectMode::Copy),
        Err(SnapError::ReadOnly)
    ));
    assert!(engine.is_read_only());
}

#[test]
fn take_fails_when_a_full_cow_pass_cannot_fit() {
    let (_dev, engine) = formatted(256);
    // Fill the volume past the point where every in-use block could
    // still be copied once.
    let mut h = engine.journal().begin(16).unwrap();
    for _ in 0..14 {
        engine.allocator().alloc(&mut h, 10, None).unwrap();
    }
    h.commit().unwrap();

    engine.create(InodeNumber(10)).unwrap();
    assert!(matches!(
        engine.take(InodeNumber(10)),
        Err(SnapError::NoSpace)
    ));
    // The refusal is an early check, not a failure.
    assert!(!engine.is_read_only());
}

#[test]
fn enabled_flag_survives_reload() {
    let (dev, engine) = formatted(256);
    let snap_a = snap(&engine, 10);
    engine.enable(snap_a).unwrap();
    drop(engine);

    let engine = SnapshotEngine::load(Arc::clone(&dev), EngineConfig::default()).unwrap();
    assert!(engine.status().snapshots[0].flags.enabled);

    engine.disable(snap_a).unwrap();
    drop(engine);
    let engine = SnapshotEngine::load(dev, EngineConfig::default()).unwrap();
    assert!(!engine.status().snapshots[0].flags.enabled);
}
