//! Dirty-inode and dirty-buffer tracking.
//!
//! Every buffer dirtied for a delta is attached to the inode that owns
//! it; flush walks the registry one delta slot at a time, writing back
//! each dirty inode's buffers, and always flushes the bitmap and volume
//! map inodes last so that block-allocation metadata reflects every
//! other inode's writeback before it is itself persisted.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::buffer::delta_slot;
use crate::param::{inum, TUX3_MAX_DELTA};

/// Identity of one dirty buffer, independent of whatever cache slot it
/// currently lives in — the registry only needs enough to re-resolve it
/// through [`crate::cache::CacheContext::get`] at flush time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub map: u64,
    pub index: u64,
}

/// One inode's dirty footprint within a single delta slot.
#[derive(Debug, Default)]
pub struct DirtyInodeEntry {
    /// The free-running delta counter value when this inode first went
    /// dirty in this slot's generation (distinct from the slot number,
    /// which wraps; used for diagnostics and to order concurrent
    /// rollups — see the inode shadow-attribute supplement below).
    pub dirty_since: u64,
    pub buffers: Vec<BufferKey>,
    /// A snapshot of this inode's on-disk attributes taken the moment it
    /// first went dirty in this slot, used to answer "what would this
    /// inode's metadata look like if this delta were rolled back" without
    /// re-reading the committed generation. Opaque to this crate — the
    /// attribute layout belongs to the inode-table module layered above
    /// it; this crate only carries the bytes through to flush.
    pub attr_shadow: Option<Box<[u8]>>,
}

#[derive(Default)]
struct Slot {
    inodes: HashMap<u64, DirtyInodeEntry>,
}

pub struct DirtyRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    slots: [Slot; TUX3_MAX_DELTA],
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::default()),
        }
    }
}

impl DirtyRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Records that `buffer` on `inode` is dirty for `delta`. Idempotent:
    /// attaching the same buffer to the same inode/delta twice does not
    /// duplicate the entry.
    pub fn attach(&self, inode: u64, delta: u64, buffer: BufferKey, attr_shadow: Option<Box<[u8]>>) {
        let slot = delta_slot(delta) as usize;
        let mut inner = self.inner.lock();
        let entry = inner.slots[slot].inodes.entry(inode).or_insert_with(|| DirtyInodeEntry {
            dirty_since: delta,
            buffers: Vec::new(),
            attr_shadow: None,
        });
        if attr_shadow.is_some() && entry.attr_shadow.is_none() {
            entry.attr_shadow = attr_shadow;
        }
        if !entry.buffers.contains(&buffer) {
            entry.buffers.push(buffer);
        }
    }

    /// `true` if any inode has a dirty buffer in `delta`'s slot.
    pub fn has_dirty(&self, delta: u64) -> bool {
        let slot = delta_slot(delta) as usize;
        !self.inner.lock().slots[slot].inodes.is_empty()
    }

    /// Drains every dirty inode recorded for `delta`'s slot, in flush
    /// order: ordinary inodes first (ascending inode number, for
    /// deterministic testing), then [`inum::BITMAP`], then
    /// [`inum::VOLUME_MAP`] last.
    pub fn take_slot(&self, delta: u64) -> Vec<(u64, DirtyInodeEntry)> {
        let slot = delta_slot(delta) as usize;
        let mut inner = self.inner.lock();
        let drained: HashMap<u64, DirtyInodeEntry> = std::mem::take(&mut inner.slots[slot].inodes);
        let mut entries: Vec<(u64, DirtyInodeEntry)> = drained.into_iter().collect();
        entries.sort_by_key(|(inode, _)| flush_rank(*inode));
        entries
    }
}

impl Default for DirtyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn flush_rank(inode: u64) -> (u8, u64) {
    match inode {
        id if id == inum::VOLUME_MAP => (2, id),
        id if id == inum::BITMAP => (1, id),
        id => (0, id),
    }
}
