//! A buffer cache, block-fork, dirty-delta tracker and write-ahead log
//! for a versioning, copy-on-write filesystem core.
//!
//! This crate implements the mechanism the rest of a filesystem (the
//! B-tree and directory layers, the allocator, the VFS glue) is built
//! on top of: every metadata block passes through the cache in
//! [`cache`], gets forked instead of corrupted when two deltas need to
//! touch it in [`fork`], is tracked per-inode for writeback in
//! [`dirty`], shrunk in place by [`truncate`], and is reconstructed
//! after a crash by replaying the write-ahead log in [`log::replay`].
//!
//! None of the B-tree node layout, directory format, or free-space
//! allocation policy lives here — those are out of scope for this
//! crate, which only guarantees that whatever buffers they dirty are
//! cached, forked, flushed and replayed correctly.

pub mod block;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod device;
pub mod dirty;
pub mod error;
pub mod fork;
pub mod log;
pub mod map;
pub mod orphan;
pub mod param;
pub mod sb;
pub mod truncate;

pub use error::{Error, Result};
