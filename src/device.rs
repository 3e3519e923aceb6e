//! The block device primitive consumed by maps.
//!
//! The device is an out-of-scope collaborator: the core only needs
//! synchronous byte-offset read/write of whole blocks. Real embedders
//! back this with a file, a raw device node, or a network block store;
//! tests back it with [`MemDevice`].

use std::io;

/// Block size is expressed as a power-of-two shift, matching
/// `1 << map.dev.bits` throughout the design.
pub trait BlockDevice: Send + Sync {
    /// `1 << bits()` is the device's block size in bytes.
    fn bits(&self) -> u32;

    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn block_size(&self) -> usize {
        1usize << self.bits()
    }
}

/// An in-memory `BlockDevice` backed by a growable byte vector, used by
/// unit and scenario tests in place of a real disk.
#[cfg(any(test, feature = "test-util"))]
pub struct MemDevice {
    bits: u32,
    data: parking_lot::Mutex<Vec<u8>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MemDevice {
    pub fn new(bits: u32, initial_blocks: usize) -> Self {
        let size = (1usize << bits) * initial_blocks;
        Self {
            bits,
            data: parking_lot::Mutex::new(vec![0u8; size]),
        }
    }

    fn ensure_len(data: &mut Vec<u8>, end: usize) {
        if data.len() < end {
            data.resize(end, 0);
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl BlockDevice for MemDevice {
    fn bits(&self) -> u32 {
        self.bits
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        Self::ensure_len(&mut data, end);
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        Self::ensure_len(&mut data, end);
        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}
