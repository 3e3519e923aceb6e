//! End-to-end scenarios exercising this crate's components together,
//! against an in-memory block device.
//!
//! Scenario 1 (whole-file write+flush+read) belongs to the B-tree/
//! directory layer built on top of this crate, not to the cache/fork/
//! dirty/log core itself, and is not reproduced here. The remaining
//! scenarios, including truncate's cache-level half of scenario 6
//! (`truncate.rs` has the byte-level assertions), land squarely within
//! this crate's scope and are covered below.

use std::sync::Arc;

use deltafs_core::block::{BlockAddr, Extent};
use deltafs_core::cache::CacheContext;
use deltafs_core::config::{CacheConfig, ReplayConfig};
use deltafs_core::device::MemDevice;
use deltafs_core::fork::{self, ForkOutcome, ForkedBuffers};
use deltafs_core::log::record::LogRecord;
use deltafs_core::log::replay::replay;
use deltafs_core::log::{collect_chain, DecodedBlock};
use deltafs_core::map::Map;
use deltafs_core::orphan::{MemOtable, OrphanTracker};

fn test_map(id: u64) -> Map {
    Map::for_device(id, Arc::new(MemDevice::new(12, 64)))
}

/// Scenario 2: fork under writeback. A buffer dirtied in delta 0 is
/// still pinned for an in-flight writeback when delta 1 wants to dirty
/// the same index; the writer must get a clone, and once delta 0's
/// writeback completes the original drains away, leaving only the
/// clone with delta 1's payload.
#[test]
fn fork_under_writeback() {
    let cache = CacheContext::new(CacheConfig::default());
    let map = test_map(1);
    let forked = ForkedBuffers::new();

    let h0_raw = cache.get(&map, 0).unwrap();
    let (h0, outcome) = fork::dirty_for(&cache, &map, &h0_raw, 0).unwrap();
    drop(h0_raw);
    assert_eq!(outcome, ForkOutcome::Dirtied);
    h0.write_data(|d| d[0] = b'A');

    // Simulate the backend beginning writeback of delta 0: the buffer is
    // pinned even though its bytes haven't changed yet.
    fork::set_pinned_for_writeback(&cache, &h0, true);

    // A frontend writer wants to dirty the same index for delta 1.
    let (h1, outcome) = fork::dirty_for(&cache, &map, &h0, 1).unwrap();
    assert_eq!(outcome, ForkOutcome::Forked, "pinned original forces a fork");
    h1.write_data(|d| d[0] = b'B');

    // h0 is the caller's only remaining handle to the pre-fork buffer;
    // handing it to the forked list simulates the in-flight writeback
    // holding on to it until it completes.
    fork::set_pinned_for_writeback(&cache, &h0, false);
    forked.enqueue(h0);
    assert_eq!(forked.len(), 1);

    // Delta 0's writeback completes: the forked-buffers list can now
    // reclaim the original.
    assert_eq!(
        forked.writeback_done_and_reap(),
        1,
        "original reclaimed once writeback drains"
    );
    assert!(forked.is_empty());

    h1.read_data(|d| assert_eq!(d[0], b'B'));
    drop(h1);
}

/// Scenario 3: an orphaned inode's on-disk table membership tracks
/// add/del across rollups, never touching the table for adds and dels
/// that cancel out within the same delta.
#[test]
fn orphan_lifecycle_across_rollup() {
    let tracker = OrphanTracker::new();
    let mut otable = MemOtable::default();

    let inum = 99;
    tracker.orphan_add(inum).unwrap();
    assert!(tracker.is_orphan(inum, &otable));
    assert!(!otable.contains(inum), "not yet rolled up");

    tracker.rollup(&mut otable).unwrap();
    assert!(otable.contains(inum));

    tracker.orphan_del(inum);
    assert!(otable.contains(inum), "removal deferred to the next rollup");

    tracker.rollup(&mut otable).unwrap();
    assert!(!otable.contains(inum));
}

/// Scenario 4: replay with a mid-chain `ROLLUP`. Records written before
/// the rollup anchor describe state already durable on disk and must be
/// skipped; only records from the rollup onward are replayed.
#[test]
fn replay_skips_blocks_before_mid_chain_rollup() {
    let block_size = 512;
    let mut writer = deltafs_core::log::LogWriter::new(block_size);
    let mut written: Vec<(BlockAddr, Vec<u8>)> = Vec::new();
    let mut next_addr = 0u64;

    let mut flush = |writer: &mut deltafs_core::log::LogWriter, written: &mut Vec<(BlockAddr, Vec<u8>)>, next_addr: &mut u64| {
        let addr = BlockAddr::new(*next_addr);
        *next_addr += 1;
        written.push((addr, writer.finish_block(addr)));
        addr
    };

    // Blocks 0-2: allocations that will predate the rollup.
    for i in 0..30u64 {
        let rec = LogRecord::BAlloc(Extent::new(BlockAddr::new(i), 1));
        if !writer.try_append(&rec).unwrap() {
            flush(&mut writer, &mut written, &mut next_addr);
            assert!(writer.try_append(&rec).unwrap());
        }
    }
    flush(&mut writer, &mut written, &mut next_addr); // finishes whatever's pending as a block boundary

    // The rollup record itself, then post-rollup allocations.
    assert!(writer.try_append(&LogRecord::Rollup(1)).unwrap());
    for i in 1000..1010u64 {
        let rec = LogRecord::BAlloc(Extent::new(BlockAddr::new(i), 1));
        if !writer.try_append(&rec).unwrap() {
            flush(&mut writer, &mut written, &mut next_addr);
            assert!(writer.try_append(&rec).unwrap());
        }
    }
    let tail = flush(&mut writer, &mut written, &mut next_addr);

    let lookup = |addr: BlockAddr| -> std::io::Result<Vec<u8>> {
        written
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "missing block"))
    };
    let chain: Vec<DecodedBlock> = collect_chain(tail, lookup).unwrap();

    let orphans = OrphanTracker::new();
    let mut otable = MemOtable::default();
    let state = replay(&chain, &orphans, &mut otable, 0).unwrap();

    assert_eq!(state.rollup_anchor, Some(1));
    assert_eq!(state.balloc.len(), 10, "only the post-rollup allocations are live");
    for e in &state.balloc {
        assert!(e.start.get() >= 1000);
    }
}

/// Scenario 5: a pool of 100 buffers with `max_evict = 10`, touched
/// read-only across 200 distinct indices, ends with exactly the second
/// half resident and none of it evicted out of order.
#[test]
fn eviction_policy_keeps_most_recent_hundred() {
    let mut cfg = CacheConfig::default();
    cfg.max_buffers = 100;
    cfg.max_evict = 10;
    let cache = CacheContext::new(cfg);
    let map = test_map(1);

    for i in 0..200u64 {
        let h = cache.read(&map, i).unwrap();
        drop(h);
    }

    for i in 0..100u64 {
        assert!(cache.peek(&map, i).is_none(), "buffer {i} should have been evicted");
    }
    for i in 100..200u64 {
        assert!(cache.peek(&map, i).is_some(), "buffer {i} should remain resident");
    }
}

/// Scenario 6: a two-block file with both blocks dirty (in the same
/// delta, so no fork is needed) truncated to 4096+100. Block 0 survives
/// dirty and unchanged; block 1 survives dirty with its tail zeroed
/// from offset 100; block 2 is discarded entirely.
#[test]
fn truncate_partial_and_range_with_dirty_buffers() {
    let cache = CacheContext::new(CacheConfig::default());
    let map = test_map(1);
    let forked = ForkedBuffers::new();

    let h0 = cache.get(&map, 0).unwrap();
    let (h0, _) = fork::dirty_for(&cache, &map, &h0, 0).unwrap();
    h0.write_data(|d| d.fill(0xAA));

    let h1 = cache.get(&map, 1).unwrap();
    let (h1, _) = fork::dirty_for(&cache, &map, &h1, 0).unwrap();
    h1.write_data(|d| d.fill(0xBB));
    drop(h0);
    drop(h1);

    deltafs_core::truncate::truncate(&cache, &map, 4096 + 100, &forked);

    let h0 = cache.peek(&map, 0).expect("block 0 untouched");
    assert_eq!(h0.state(), deltafs_core::buffer::State::Dirty(0), "still dirty, truncate doesn't flush");
    h0.read_data(|d| assert!(d.iter().all(|&b| b == 0xAA)));
    drop(h0);

    let h1 = cache.peek(&map, 1).expect("straddling block survives with a zeroed tail");
    h1.read_data(|d| {
        assert!(d[..100].iter().all(|&b| b == 0xBB));
        assert!(d[100..].iter().all(|&b| b == 0));
    });
    drop(h1);

    assert!(cache.peek(&map, 2).is_none(), "nothing was ever written to block 2, nothing to discard");
    assert!(forked.is_empty(), "neither surviving buffer was pinned for writeback");
}

/// Ties dirty-registry flush order to the bitmap/volume-map-last rule
/// against a real cache and map, rather than just the registry's
/// own unit tests.
#[test]
fn dirty_registry_flush_order_with_real_buffers() {
    use deltafs_core::dirty::{BufferKey, DirtyRegistry};
    use deltafs_core::param::inum;

    let cache = CacheContext::new(CacheConfig::default());
    let map = test_map(1);
    let registry = DirtyRegistry::new();

    let h_bitmap = cache.get(&map, 0).unwrap();
    let (h_bitmap, _) = fork::dirty_for(&cache, &map, &h_bitmap, 0).unwrap();
    registry.attach(
        inum::BITMAP,
        0,
        BufferKey {
            map: map.id,
            index: h_bitmap.index(),
        },
        None,
    );

    let h_file = cache.get(&map, 1).unwrap();
    let (h_file, _) = fork::dirty_for(&cache, &map, &h_file, 0).unwrap();
    registry.attach(
        42,
        0,
        BufferKey {
            map: map.id,
            index: h_file.index(),
        },
        None,
    );

    let order: Vec<u64> = registry.take_slot(0).into_iter().map(|(inode, _)| inode).collect();
    assert_eq!(order, vec![42, inum::BITMAP]);

    drop(h_bitmap);
    drop(h_file);
    let _ = ReplayConfig::default();
}
