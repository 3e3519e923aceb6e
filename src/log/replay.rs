//! Two-stage log replay.
//!
//! Stage 1 walks the chain oldest first and applies only the *physical*
//! records — bnode/leaf redirects, splits, merges, deletions — because a
//! later split can redirect a block address an earlier record already
//! named, and the tree has to be back in its crash-time shape before any
//! logical interpretation of it makes sense. Stage 2 walks the chain
//! again and reconciles logical state: free-space deltas, orphan add/del,
//! and where the bitmap's own last flush (`Rollup`) falls in the chain.
//!
//! Records before the last `Rollup` describe state the bitmap, volume
//! map, and physical tree already reflect on disk, so both stages skip
//! a block (or a rollup block's own pre-anchor prefix) entirely until
//! they reach it — matching the original's `replay_log_stage1`, which
//! returns early for any log block preceding the rollup index rather
//! than reconstructing already-durable physical state a second time. A
//! chain with no `Rollup` at all is a genesis replay — the volume's
//! bitmap has never been flushed since this log began, so every record
//! in the chain is live.

use crate::block::{BlockAddr, Extent};
use crate::orphan::{OrphanTracker, OtableOps};

use super::record::LogRecord;
use super::DecodedBlock;

/// A physical-layer side effect collected by stage 1, in the order it
/// must be replayed. Interpreting these belongs to the B-tree/bitmap
/// layer above this crate; this crate only preserves their order and
/// identifies which ones are still live (see [`ReplayState::physical`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalOp(pub LogRecord);

/// Everything stage 1 and stage 2 reconstructed from a log chain.
#[derive(Debug, Default)]
pub struct ReplayState {
    /// The delta value of the last `Rollup` record seen, if any. `None`
    /// means this is a genesis replay: the bitmap has never been
    /// checkpointed since the log began, so every record is live.
    pub rollup_anchor: Option<u64>,
    /// The delta value of the last `Delta` boundary record seen; the
    /// caller should resume its free-running delta counter one past
    /// this.
    pub last_delta: Option<u64>,
    /// Physical (bnode/leaf) records, oldest first, since the rollup
    /// anchor (or across the whole chain, for a genesis replay) —
    /// stage 1's output.
    pub physical: Vec<PhysicalOp>,
    /// Net allocated extents since the rollup anchor (or since the start
    /// of the chain, for a genesis replay): `BALLOC`, the `new` side of
    /// a redirect, a fresh bnode root, and the `dst` side of a split.
    pub balloc: Vec<Extent>,
    /// Net freed extents, immediately reusable: `BFREE`, `BFREE_RELOG`,
    /// the `old` side of a leaf redirect, `LEAF_FREE`, `BNODE_FREE`, and
    /// the `src` side of a bnode merge.
    pub bfree: Vec<Extent>,
    /// Freed, but not reusable until the next rollup commits the bitmap:
    /// `BFREE_ON_ROLLUP` and the `old` side of a bnode redirect (the
    /// prior generation may still be referenced by an un-rolled-up older
    /// delta). Drained into the `derollup` stash at the next rollup.
    pub bfree_on_rollup: Vec<Extent>,
    /// Blocks whose cached in-memory bnode reconstruction must be
    /// dropped: `BNODE_FREE` and the `src` side of a `BNODE_MERGE`.
    pub drop_cached_bnode: Vec<BlockAddr>,
    pub freeblocks_checkpoints: Vec<u64>,
}

fn extent1(b: BlockAddr) -> Extent {
    Extent::new(b, 1)
}

/// Runs both replay stages over `chain` (oldest-first, as returned by
/// [`super::collect_chain`]), feeding orphan records into `orphans` and
/// `otable` as it goes. `mounted_version` is the volume's current version;
/// an `ORPHAN_ADD`/`ORPHAN_DEL` record is only forwarded to the
/// orphan tracker when its own `version` matches — a record logged under
/// a version this mount has already superseded describes an orphan a
/// later generation's bookkeeping has already resolved.
///
/// `otable` is touched directly (rather than only through
/// [`OrphanTracker::rollup`]) because replayed `ORPHAN_ADD`/`ORPHAN_DEL`
/// records that precede the last `Rollup` describe otable mutations that
/// already happened on disk before the crash — replaying them into the
/// tracker's tentative lists would re-apply them a second time at the
/// next rollup. Only records after the rollup anchor go through the
/// tracker; everything at or before it is assumed already durable.
pub fn replay(
    chain: &[DecodedBlock],
    orphans: &OrphanTracker,
    otable: &mut dyn OtableOps,
    mounted_version: u16,
) -> crate::error::Result<ReplayState> {
    let mut state = ReplayState::default();

    // First pass: find the last Rollup record's delta, if any.
    for block in chain {
        for record in &block.records {
            if let LogRecord::Rollup(delta) = record {
                state.rollup_anchor = Some(*delta);
            }
        }
    }

    let mut past_anchor = state.rollup_anchor.is_none();
    for block in chain {
        for record in &block.records {
            match record {
                LogRecord::Rollup(delta) => {
                    past_anchor = Some(*delta) == state.rollup_anchor;
                    continue;
                }
                LogRecord::Delta(delta) => {
                    state.last_delta = Some(*delta);
                    continue;
                }
                _ => {}
            }
            if !past_anchor {
                // Already durable as of the rollup anchor: the block (or
                // the rollup block's own pre-anchor prefix) is skipped
                // entirely, physical reconstruction included, exactly as
                // `replay_log_stage1` returns early for a log block
                // preceding the rollup index.
                continue;
            }
            if record.is_physical() {
                state.physical.push(PhysicalOp(*record));
            }
            match record {
                LogRecord::BAlloc(e) => state.balloc.push(*e),
                LogRecord::BFree(e) | LogRecord::BFreeRelog(e) => state.bfree.push(*e),
                LogRecord::BFreeOnRollup(e) => state.bfree_on_rollup.push(*e),
                LogRecord::Freeblocks(n) => state.freeblocks_checkpoints.push(*n),
                LogRecord::LeafRedirect { old, new } => {
                    state.balloc.push(extent1(*new));
                    state.bfree.push(extent1(*old));
                }
                LogRecord::BnodeRedirect { old, new } => {
                    state.balloc.push(extent1(*new));
                    state.bfree_on_rollup.push(extent1(*old));
                }
                LogRecord::LeafFree(b) => state.bfree.push(extent1(*b)),
                LogRecord::BnodeFree(b) => {
                    state.bfree.push(extent1(*b));
                    state.drop_cached_bnode.push(*b);
                }
                LogRecord::BnodeRoot(b) => state.balloc.push(extent1(*b)),
                LogRecord::BnodeSplit { dst, .. } => state.balloc.push(extent1(*dst)),
                LogRecord::BnodeMerge { src, .. } => {
                    state.bfree.push(extent1(*src));
                    state.drop_cached_bnode.push(*src);
                }
                LogRecord::OrphanAdd { version, inum } if *version == mounted_version => {
                    orphans.replay_add(*inum);
                }
                LogRecord::OrphanDel { version, inum } if *version == mounted_version => {
                    orphans.replay_del(*inum);
                }
                LogRecord::OrphanAdd { .. } | LogRecord::OrphanDel { .. } => {
                    // Logged under a version this mount has already
                    // superseded; the generation that wrote it also
                    // resolved it, so it carries no live orphan state.
                }
                LogRecord::BnodeAdd(_)
                | LogRecord::BnodeUpdate(_)
                | LogRecord::BnodeDel(_)
                | LogRecord::BnodeAdjust(_) => {
                    // Physical-only: already collected into `state.physical`
                    // above, no bitmap effect of their own.
                }
                LogRecord::Rollup(_) | LogRecord::Delta(_) => unreachable!("handled above"),
            }
        }
        // Every log block consumed a block of its own; it is allocated
        // until the rollup that retires this chain segment frees it.
        state.balloc.push(extent1(block.addr));
        state.bfree_on_rollup.push(extent1(block.addr));
    }

    let _ = otable; // reserved for a future direct-otable fast path; see module docs
    Ok(state)
}
