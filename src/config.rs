//! Tunables threaded through the cache, dirty registry and replay.
//! Sizing policy is left to the embedder; these structs only carry the
//! numbers through.

use crate::param::{BUFFER_BUCKETS, DEFAULT_MAX_EVICT};

/// Governs [`crate::cache::CacheContext`]'s pool size and eviction batch.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Hard ceiling on the number of buffers held across all maps.
    pub max_buffers: usize,
    /// Upper bound on reclamations performed by a single eviction scan.
    /// Must be at least 1.
    pub max_evict: usize,
    /// Number of hash buckets per map; must be a power of two (checked by
    /// [`crate::param::is_pow2`] in tests, not re-validated at runtime
    /// since it is a compile-time constant in every caller observed so
    /// far).
    pub buffer_buckets: usize,
    /// Whether a pool miss grows the pool up to `max_buffers` before
    /// evicting (`Pool`, production default) or evicts eagerly on every
    /// miss first (`DebugEarlyReclaim`, §9's "debug path").
    pub alloc_mode: AllocMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_buffers: 4096,
            max_evict: DEFAULT_MAX_EVICT,
            buffer_buckets: BUFFER_BUCKETS,
            alloc_mode: AllocMode::default(),
        }
    }
}

/// What a pool miss should do before handing out a slot.
/// `Pool` is the default production behavior: grow the pool up to
/// `max_buffers` before ever evicting, so a buffer is only reclaimed
/// under real memory pressure. `DebugEarlyReclaim` evicts eagerly on
/// every miss, before growing or reusing a freed slot, so that a leaked
/// reference (a buffer that should have been `put` but wasn't) shows up
/// as an immediate inability to reclaim rather than being masked by
/// growing the pool — useful for invariant enforcement in tests without
/// allocating gigabytes of buffers first to reach `max_buffers`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AllocMode {
    #[default]
    Pool,
    DebugEarlyReclaim,
}

/// Bounds retry loops that re-resolve a buffer after a `TryAgain` from
/// block-fork classification — fork retry should be a real, observable
/// case rather than something that can loop forever.
#[derive(Clone, Copy, Debug)]
pub struct ReplayConfig {
    pub max_fork_retries: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { max_fork_retries: 8 }
    }
}
