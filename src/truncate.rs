//! Truncation: the cache-level edge case from §4.1 and the invalidation
//! variant from §4.3. Shrinking a map to `new_size` bytes must zero the
//! tail of whichever cached buffer straddles the new end-of-file, and
//! discard every cached buffer entirely beyond it — forking it away
//! (§4.3's "forked without a new copy") if a writeback might still be
//! reading its old bytes, or reclaiming it immediately otherwise.
//!
//! The B-tree/extent-map walk that decides *which* physical blocks back
//! a logical range past `new_size` is out of this crate's scope (§1);
//! this module only ever acts on buffers already resident in the cache
//! for the given map, matching "truncation walks each bucket" rather
//! than consulting an index of the file's full extent list.

use std::sync::Arc;

use crate::cache::{handle_for_slot, CacheContext};
use crate::fork::ForkedBuffers;
use crate::map::Map;

/// Shrinks `map`'s cached view to `new_size` bytes. Any resident buffer
/// at the straddling block is zeroed from the new end-of-file offset
/// onward; any resident buffer entirely beyond it is discarded.
pub fn truncate(cache: &Arc<CacheContext>, map: &Map, new_size: u64, forked: &ForkedBuffers) {
    let block_size = map.block_size() as u64;
    let straddle_block = new_size / block_size;
    let offset_in_block = (new_size % block_size) as usize;
    // Boundary case (§8): on an exact block boundary, the partial-zero
    // branch must not run, and every block at or past `straddle_block`
    // is fully discarded.
    let discard_from = if offset_in_block == 0 {
        straddle_block
    } else {
        straddle_block + 1
    };

    let mut to_enqueue = Vec::new();
    cache.with_inner(|v| {
        for (slot_idx, index) in v.indices_for_map(map.id) {
            if offset_in_block != 0 && index == straddle_block {
                v.zero_tail(slot_idx, offset_in_block);
                continue;
            }
            if index < discard_from {
                continue;
            }
            if v.is_pinned(slot_idx) || v.count(slot_idx) > 1 {
                // Either a writeback may still be reading the old bytes,
                // or some other caller is holding a reference: discard
                // without a new copy. The hash link's own +1 is not
                // touched by unhashing (mirroring `fork_clone`'s original
                // side) — it is simply reassigned to the handle just
                // below, which the forked-buffers list now owns, and
                // drains once every reference (including any external
                // holder's) goes away.
                v.unhash_for_discard(slot_idx, map.id, index);
                to_enqueue.push(slot_idx);
            } else {
                // Only the hash link references this buffer: reclaim it
                // synchronously rather than routing it through the
                // forked list for nothing.
                v.reclaim_now(slot_idx, map.id, index);
            }
        }
    });

    for slot_idx in to_enqueue {
        forked.enqueue(handle_for_slot(cache, slot_idx));
    }
}
