//! Write-ahead log: record encoding ([`record`]) plus block chaining and
//! replay ([`replay`]).
//!
//! A log block is a small header (magic, and the address of the
//! previous log block in the chain) followed by records packed
//! back-to-back until the next one would not fit; the remainder of the
//! block is left zeroed, which [`record::LogRecord::decode`] reads back
//! as the end-of-block sentinel. Chaining backwards from the superblock's
//! recorded tail is what lets replay find every record written since the
//! last checkpoint without a separate index.

pub mod record;
pub mod replay;

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::block::BlockAddr;
use crate::error::{Error, Result as CrateResult};
use crate::param::magic;
use record::LogRecord;

const NO_PREV: u8 = 0;
const HAS_PREV: u8 = 1;
/// `magic(u16) + has_prev(u8) + prev(u64)`.
const HEADER_LEN: usize = 2 + 1 + 8;

/// Accumulates [`LogRecord`]s into fixed-size, chained log blocks.
pub struct LogWriter {
    block_size: usize,
    buf: Vec<u8>,
    used: usize,
    /// Address of the most recently finished block, which becomes the
    /// `prev` pointer of the block currently being filled.
    prev: Option<BlockAddr>,
}

impl LogWriter {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > HEADER_LEN + LogRecord::MAX_ENCODED_LEN);
        Self {
            block_size,
            buf: vec![0u8; block_size],
            used: HEADER_LEN,
            prev: None,
        }
    }

    /// Resumes writing a chain whose most recently flushed block is
    /// `prev` — used when reopening a volume that already has a log.
    pub fn resume(block_size: usize, prev: BlockAddr) -> Self {
        let mut w = Self::new(block_size);
        w.prev = Some(prev);
        w
    }

    /// Tries to append `record` to the block currently being filled.
    /// Returns `false` if it would not fit; the caller must
    /// [`Self::finish_block`] and retry.
    pub fn try_append(&mut self, record: &LogRecord) -> io::Result<bool> {
        let mut tmp = Vec::with_capacity(LogRecord::MAX_ENCODED_LEN);
        record.encode(&mut tmp)?;
        if self.used + tmp.len() > self.block_size {
            return Ok(false);
        }
        self.buf[self.used..self.used + tmp.len()].copy_from_slice(&tmp);
        self.used += tmp.len();
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.used == HEADER_LEN
    }

    /// Finalizes the current block for writing at `this_addr`, returning
    /// its bytes, and begins a new block chained to it.
    pub fn finish_block(&mut self, this_addr: BlockAddr) -> Vec<u8> {
        let mut header = Cursor::new(&mut self.buf[0..HEADER_LEN]);
        header.write_u16::<BigEndian>(magic::LOG_BLOCK).unwrap();
        match self.prev {
            Some(p) => {
                header.write_u8(HAS_PREV).unwrap();
                header.write_u64::<BigEndian>(p.get()).unwrap();
            }
            None => {
                header.write_u8(NO_PREV).unwrap();
                header.write_u64::<BigEndian>(0).unwrap();
            }
        }
        let finished = std::mem::replace(&mut self.buf, vec![0u8; self.block_size]);
        self.used = HEADER_LEN;
        self.prev = Some(this_addr);
        finished
    }
}

/// A decoded log block: its own address, its header, and the records it
/// holds, in order. The block's own address is what lets replay mark the
/// log block itself allocated and defer its eventual free to the
/// `derollup` stash — a log block is itself a block on the
/// volume, consuming space until the rollup that retires it.
pub struct DecodedBlock {
    pub addr: BlockAddr,
    pub prev: Option<BlockAddr>,
    pub records: Vec<LogRecord>,
}

pub fn decode_block(addr: BlockAddr, bytes: &[u8]) -> io::Result<DecodedBlock> {
    let mut cursor = Cursor::new(bytes);
    let found_magic = cursor.read_u16::<BigEndian>()?;
    if found_magic != magic::LOG_BLOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad log block magic {found_magic:#x}"),
        ));
    }
    let has_prev = cursor.read_u8()?;
    let prev_raw = cursor.read_u64::<BigEndian>()?;
    let prev = match has_prev {
        NO_PREV => None,
        HAS_PREV => Some(BlockAddr::new(prev_raw)),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad log block has_prev flag {other}"),
            ))
        }
    };
    let mut records = Vec::new();
    loop {
        match LogRecord::decode(&mut cursor)? {
            Some(rec) => records.push(rec),
            None => break,
        }
    }
    Ok(DecodedBlock { addr, prev, records })
}

/// Walks a log chain backward from `tail`, reading each block with
/// `read_block`, and returns the blocks in forward (oldest-first) order —
/// the order replay needs to apply them in.
///
/// A malformed block (bad magic, bad `has_prev` flag, or an unknown
/// opcode surfacing from [`LogRecord::decode`]) aborts the walk with
/// [`Error::InvalidLog`] rather than an I/O-layer error — this
/// is a mount-time failure, not something replay can route around.
pub fn collect_chain(
    tail: BlockAddr,
    mut read_block: impl FnMut(BlockAddr) -> io::Result<Vec<u8>>,
) -> CrateResult<Vec<DecodedBlock>> {
    let mut chain = Vec::new();
    let mut cur = Some(tail);
    while let Some(addr) = cur {
        let bytes = read_block(addr).map_err(|e| Error::io(crate::param::inum::LOG_MAP, addr.get(), e))?;
        let decoded = decode_block(addr, &bytes).map_err(|_| Error::InvalidLog {
            block: addr.get(),
            reason: "bad magic, prev-pointer flag, or opcode",
        })?;
        cur = decoded.prev;
        chain.push(decoded);
    }
    chain.reverse();
    Ok(chain)
}
