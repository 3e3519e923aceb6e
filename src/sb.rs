//! On-disk superblock.
//!
//! Fixed-size, big-endian, and deliberately small: everything else
//! (inode table root, bitmap root, log chain) is reached from fields
//! here rather than duplicated. `Superblock` is read once at mount and
//! rewritten only when the volume's own root pointers change — normal
//! delta commits never touch it directly, only the log and the inodes
//! and bitmap blocks it points at.

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::block::BlockAddr;
use crate::param::magic;

pub const SUPERBLOCK_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Width in bits of this volume's block size (`1 << dev_bits`).
    pub dev_bits: u32,
    /// Total number of blocks on the volume.
    pub block_count: u64,
    /// Free-running delta counter as of the last clean unmount or
    /// successful replay.
    pub next_delta: u64,
    /// Root block of the bitmap B-tree.
    pub bitmap_root: BlockAddr,
    /// Root block of the volume-map B-tree (inode table).
    pub volume_map_root: BlockAddr,
    /// Root block of the orphan B-tree (`otable`).
    pub otable_root: BlockAddr,
    /// Address of the most recently written log block — the tail replay
    /// starts from and walks backward via `prev` pointers.
    pub log_tail: Option<BlockAddr>,
}

impl Superblock {
    pub fn encode(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(magic::SUPERBLOCK)?;
        w.write_u32::<BigEndian>(self.dev_bits)?;
        w.write_u64::<BigEndian>(self.block_count)?;
        w.write_u64::<BigEndian>(self.next_delta)?;
        w.write_u64::<BigEndian>(self.bitmap_root.get())?;
        w.write_u64::<BigEndian>(self.volume_map_root.get())?;
        w.write_u64::<BigEndian>(self.otable_root.get())?;
        match self.log_tail {
            Some(addr) => {
                w.write_u8(1)?;
                w.write_u64::<BigEndian>(addr.get())?;
            }
            None => {
                w.write_u8(0)?;
                w.write_u64::<BigEndian>(0)?;
            }
        }
        Ok(())
    }

    pub fn decode(r: &mut impl Read) -> io::Result<Self> {
        let mut magic_buf = [0u8; 8];
        r.read_exact(&mut magic_buf)?;
        if &magic_buf != magic::SUPERBLOCK {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad superblock magic"));
        }
        let dev_bits = r.read_u32::<BigEndian>()?;
        let block_count = r.read_u64::<BigEndian>()?;
        let next_delta = r.read_u64::<BigEndian>()?;
        let bitmap_root = BlockAddr::new(r.read_u64::<BigEndian>()?);
        let volume_map_root = BlockAddr::new(r.read_u64::<BigEndian>()?);
        let otable_root = BlockAddr::new(r.read_u64::<BigEndian>()?);
        let has_tail = r.read_u8()?;
        let tail_raw = r.read_u64::<BigEndian>()?;
        let log_tail = match has_tail {
            0 => None,
            _ => Some(BlockAddr::new(tail_raw)),
        };
        Ok(Self {
            dev_bits,
            block_count,
            next_delta,
            bitmap_root,
            volume_map_root,
            otable_root,
            log_tail,
        })
    }

    pub fn to_block(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        self.encode(&mut cursor)?;
        Ok(buf)
    }

    pub fn from_block(bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Self::decode(&mut cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            dev_bits: 12,
            block_count: 1_000_000,
            next_delta: 77,
            bitmap_root: BlockAddr::new(1),
            volume_map_root: BlockAddr::new(2),
            otable_root: BlockAddr::new(3),
            log_tail: Some(BlockAddr::new(999)),
        }
    }

    #[test]
    fn roundtrips_through_a_block() {
        let sb = sample();
        let block = sb.to_block().unwrap();
        assert_eq!(block.len(), SUPERBLOCK_SIZE);
        let back = Superblock::from_block(&block).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn no_log_tail_roundtrips_as_none() {
        let mut sb = sample();
        sb.log_tail = None;
        let block = sb.to_block().unwrap();
        let back = Superblock::from_block(&block).unwrap();
        assert_eq!(back.log_tail, None);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; SUPERBLOCK_SIZE];
        assert!(Superblock::from_block(&buf).is_err());
    }
}
