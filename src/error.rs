//! Crate-wide error taxonomy.
//!
//! These are error *kinds*, not one-off ad hoc types: every fallible public
//! operation in this crate returns `Result<T>` with this single enum so that
//! callers can match on kind without caring which module raised it.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The buffer pool is exhausted and no eviction candidate exists.
    #[error("out of memory: pool exhausted with no reclaimable buffer")]
    OutOfMemory,

    /// The map's block-I/O callback failed.
    #[error("I/O error on block {block} of map {map}: {source}")]
    Io {
        map: u64,
        block: u64,
        #[source]
        source: std::io::Error,
    },

    /// A log block failed validation during replay (bad magic, over-long byte
    /// count, or an opcode the replayer doesn't know).
    #[error("invalid log block at {block}: {reason}")]
    InvalidLog { block: u64, reason: &'static str },

    /// A write would grow a file past the representable extent/block limits.
    #[error("file too big: block {block} exceeds the addressable range")]
    FileTooBig { block: u64 },

    /// Lookup failed: no cached buffer, no orphan record, or no otable entry.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// Internal to block-fork: the caller observed a fork in progress and
    /// must re-resolve the buffer by `(map, index)` and retry. Never
    /// surfaced past the crate boundary; call sites must loop on it.
    #[error("try again: fork in progress, re-resolve and retry")]
    TryAgain,

    /// A caller-supplied argument violates a documented precondition
    /// (e.g. a non-power-of-two bucket count).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    pub fn io(map: u64, block: u64, source: std::io::Error) -> Self {
        Error::Io { map, block, source }
    }
}
