//! Map abstraction: the namespace of cached buffers for one inode
//! or the volume.
//!
//! A map binds a cacheable identity to a block-I/O callback. Buffer
//! hashing and the LRU/pool live in [`crate::cache::CacheContext`],
//! keyed by [`Map::id`] — see that module's header comment for why the
//! per-map hash-bucket lock named in the concurrency model is folded
//! into the cache context's single lock here.

use std::sync::Arc;

use crate::block::BlockAddr;
use crate::device::BlockDevice;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

/// One buffer's worth of I/O: a block address and the bytes to fill or
/// flush. The callback is expected to issue a single I/O for a
/// contiguous run of these.
pub struct IoSlice<'a> {
    pub block: BlockAddr,
    pub data: &'a mut [u8],
}

/// The block-I/O callback bound to a map.
pub trait BlockIo: Send + Sync {
    fn submit(&self, mode: IoMode, slices: &mut [IoSlice<'_>]) -> Result<()>;
}

/// Dispatches a map's I/O to a real [`BlockDevice`]. This is the default
/// callback every map except the log map is bound to.
pub struct DeviceIo {
    pub device: Arc<dyn BlockDevice>,
    pub map_id: u64,
}

impl BlockIo for DeviceIo {
    fn submit(&self, mode: IoMode, slices: &mut [IoSlice<'_>]) -> Result<()> {
        let shift = self.device.bits();
        for slice in slices {
            let offset = slice.block.get() << shift;
            let res = match mode {
                IoMode::Read => self.device.read(offset, slice.data),
                IoMode::Write => self.device.write(offset, slice.data),
            };
            res.map_err(|e| Error::io(self.map_id, slice.block.get(), e))?;
        }
        Ok(())
    }
}

/// Bound to maps that must never perform real I/O — the log map is
/// written directly through the log chain, not through the generic
/// buffer-cache path, so any attempt to read/write it here is a
/// programming error, not a recoverable condition.
pub struct ErrorIo;

impl BlockIo for ErrorIo {
    fn submit(&self, _mode: IoMode, _slices: &mut [IoSlice<'_>]) -> Result<()> {
        panic!("map is bound to ErrorIo and must never perform cache-path I/O");
    }
}

/// Identity of a cacheable object: an inode or the volume itself.
pub struct Map {
    /// Unique identity used as the cache's hash-bucket key. By convention
    /// this is the inode number, or one of the reserved inode numbers in
    /// [`crate::param::inum`] for the volume/log/bitmap maps.
    pub id: u64,
    /// `1 << dev_bits` is this map's block size in bytes.
    pub dev_bits: u32,
    pub io: Arc<dyn BlockIo>,
}

impl Map {
    pub fn new(id: u64, dev_bits: u32, io: Arc<dyn BlockIo>) -> Self {
        Self { id, dev_bits, io }
    }

    pub fn block_size(&self) -> usize {
        1usize << self.dev_bits
    }

    pub fn for_device(id: u64, device: Arc<dyn BlockDevice>) -> Self {
        let dev_bits = device.bits();
        let io = Arc::new(DeviceIo {
            device,
            map_id: id,
        });
        Self::new(id, dev_bits, io)
    }

    pub fn error_map(id: u64, dev_bits: u32) -> Self {
        Self::new(id, dev_bits, Arc::new(ErrorIo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn error_io_panics_on_use() {
        let map = Map::error_map(crate::param::inum::LOG_MAP, 12);
        let mut data = [0u8; 4096];
        let mut slices = [IoSlice {
            block: BlockAddr::new(0),
            data: &mut data,
        }];
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            map.io.submit(IoMode::Read, &mut slices)
        }));
        assert!(result.is_err());
    }

    #[test]
    fn device_io_reads_and_writes() {
        let dev = Arc::new(MemDevice::new(12, 4));
        let map = Map::for_device(100, dev);
        let mut buf = [7u8; 4096];
        {
            let mut slices = [IoSlice {
                block: BlockAddr::new(1),
                data: &mut buf,
            }];
            map.io.submit(IoMode::Write, &mut slices).unwrap();
        }
        let mut read_buf = [0u8; 4096];
        let mut slices = [IoSlice {
            block: BlockAddr::new(1),
            data: &mut read_buf,
        }];
        map.io.submit(IoMode::Read, &mut slices).unwrap();
        assert_eq!(read_buf, buf);
    }
}
