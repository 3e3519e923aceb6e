//! Log record opcodes and their on-disk encoding.
//!
//! Records are tagged unions, big-endian encoded with [`byteorder`] —
//! the same convention the rest of this crate's on-disk structures use
//! (see `sb.rs`). Opcode `0` is reserved as the end-of-block sentinel: a
//! freshly zeroed tail of a log block decodes as "no more records here"
//! without needing an explicit record count in the header.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::block::{BlockAddr, Extent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Opcode {
    EndOfBlock = 0,
    BAlloc = 1,
    BFree = 2,
    BFreeOnRollup = 3,
    BFreeRelog = 4,
    Freeblocks = 5,
    LeafRedirect = 6,
    LeafFree = 7,
    BnodeRedirect = 8,
    BnodeRoot = 9,
    BnodeSplit = 10,
    BnodeAdd = 11,
    BnodeUpdate = 12,
    BnodeMerge = 13,
    BnodeDel = 14,
    BnodeAdjust = 15,
    BnodeFree = 16,
    OrphanAdd = 17,
    OrphanDel = 18,
    Rollup = 19,
    Delta = 20,
}

impl TryFrom<u8> for Opcode {
    type Error = io::Error;

    fn try_from(v: u8) -> io::Result<Self> {
        Ok(match v {
            0 => Opcode::EndOfBlock,
            1 => Opcode::BAlloc,
            2 => Opcode::BFree,
            3 => Opcode::BFreeOnRollup,
            4 => Opcode::BFreeRelog,
            5 => Opcode::Freeblocks,
            6 => Opcode::LeafRedirect,
            7 => Opcode::LeafFree,
            8 => Opcode::BnodeRedirect,
            9 => Opcode::BnodeRoot,
            10 => Opcode::BnodeSplit,
            11 => Opcode::BnodeAdd,
            12 => Opcode::BnodeUpdate,
            13 => Opcode::BnodeMerge,
            14 => Opcode::BnodeDel,
            15 => Opcode::BnodeAdjust,
            16 => Opcode::BnodeFree,
            17 => Opcode::OrphanAdd,
            18 => Opcode::OrphanDel,
            19 => Opcode::Rollup,
            20 => Opcode::Delta,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown log opcode {other}"),
                ))
            }
        })
    }
}

/// One write-ahead-log entry. Every variant but `Rollup`/`Delta`
/// describes a single metadata-block side effect of a delta's commit;
/// `Rollup` and `Delta` are the bookkeeping records that mark where a
/// commit ends and where free-space state becomes durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogRecord {
    /// Blocks newly allocated this delta.
    BAlloc(Extent),
    /// Blocks freed this delta, immediately reusable.
    BFree(Extent),
    /// Blocks freed this delta, but not reusable until the next rollup
    /// commits the bitmap (they may still be referenced by the previous,
    /// not-yet-rolled-up generation).
    BFreeOnRollup(Extent),
    /// A `BFreeOnRollup` relogged into a later delta because the rollup
    /// that would have retired it has not happened yet.
    BFreeRelog(Extent),
    /// Running free-block count as of this record, recorded periodically
    /// so replay can cross-check its own reconstruction.
    Freeblocks(u64),
    /// A leaf block was copy-on-write redirected from `old` to `new`.
    LeafRedirect { old: BlockAddr, new: BlockAddr },
    LeafFree(BlockAddr),
    /// A bnode block was copy-on-write redirected from `old` to `new`.
    /// Unlike `LeafRedirect`, `old` is not immediately reusable: the
    /// prior generation's bnode may still be referenced by an
    /// as-yet-unflushed older delta, so its free is deferred to the next
    /// rollup (the `derollup` stash).
    BnodeRedirect { old: BlockAddr, new: BlockAddr },
    /// A new root bnode was allocated (tree grew a level).
    BnodeRoot(BlockAddr),
    /// A bnode split off `dst` from `src`.
    BnodeSplit { src: BlockAddr, dst: BlockAddr },
    /// An entry was added to an existing bnode; physical-only, no
    /// allocation of its own.
    BnodeAdd(BlockAddr),
    /// An existing bnode entry's key/pointer was updated in place;
    /// physical-only.
    BnodeUpdate(BlockAddr),
    /// `src` was merged into `dst` and freed immediately (its contents
    /// are fully absorbed, nothing else can still reference it).
    BnodeMerge { src: BlockAddr, dst: BlockAddr },
    /// An entry was deleted from a bnode; physical-only.
    BnodeDel(BlockAddr),
    /// A bnode's child-count bookkeeping was adjusted without changing
    /// its allocation; physical-only.
    BnodeAdjust(BlockAddr),
    /// A bnode was freed outright (its subtree was chopped). Freed
    /// immediately, and the replayer must drop any cached reconstruction
    /// of it — it no longer exists.
    BnodeFree(BlockAddr),
    /// `version` pins this record to the delta generation it was logged
    /// under; replay forwards it to the orphan tracker only when it
    /// matches the mounted volume's version — a record from a
    /// stale, pre-`ROLLUP` generation a subsequent version superseded is
    /// otherwise ignored rather than misapplied.
    OrphanAdd { version: u16, inum: u64 },
    OrphanDel { version: u16, inum: u64 },
    /// The bitmap and volume map were just flushed as of delta `delta`;
    /// every `BFreeOnRollup` before this point is now free for reuse.
    Rollup(u64),
    /// Marks the boundary of delta `delta`'s commit.
    Delta(u64),
}

fn write_extent(w: &mut impl Write, e: &Extent) -> io::Result<()> {
    w.write_u64::<BigEndian>(e.start.get())?;
    w.write_u32::<BigEndian>(e.count)
}

fn read_extent(r: &mut impl Read) -> io::Result<Extent> {
    let start = r.read_u64::<BigEndian>()?;
    let count = r.read_u32::<BigEndian>()?;
    Ok(Extent::new(BlockAddr::new(start), count))
}

impl LogRecord {
    /// Upper bound on any record's encoded size (1-byte opcode + up to
    /// two `u64`s), used by `log::LogWriter` to decide whether a record
    /// fits in a block's remaining space without doing a trial encode.
    pub const MAX_ENCODED_LEN: usize = 1 + 8 + 8;

    pub fn encode(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            LogRecord::BAlloc(e) => {
                w.write_u8(Opcode::BAlloc as u8)?;
                write_extent(w, e)
            }
            LogRecord::BFree(e) => {
                w.write_u8(Opcode::BFree as u8)?;
                write_extent(w, e)
            }
            LogRecord::BFreeOnRollup(e) => {
                w.write_u8(Opcode::BFreeOnRollup as u8)?;
                write_extent(w, e)
            }
            LogRecord::BFreeRelog(e) => {
                w.write_u8(Opcode::BFreeRelog as u8)?;
                write_extent(w, e)
            }
            LogRecord::Freeblocks(n) => {
                w.write_u8(Opcode::Freeblocks as u8)?;
                w.write_u64::<BigEndian>(*n)
            }
            LogRecord::LeafRedirect { old, new } => {
                w.write_u8(Opcode::LeafRedirect as u8)?;
                w.write_u64::<BigEndian>(old.get())?;
                w.write_u64::<BigEndian>(new.get())
            }
            LogRecord::LeafFree(b) => {
                w.write_u8(Opcode::LeafFree as u8)?;
                w.write_u64::<BigEndian>(b.get())
            }
            LogRecord::BnodeRedirect { old, new } => {
                w.write_u8(Opcode::BnodeRedirect as u8)?;
                w.write_u64::<BigEndian>(old.get())?;
                w.write_u64::<BigEndian>(new.get())
            }
            LogRecord::BnodeRoot(b) => {
                w.write_u8(Opcode::BnodeRoot as u8)?;
                w.write_u64::<BigEndian>(b.get())
            }
            LogRecord::BnodeSplit { src, dst } => {
                w.write_u8(Opcode::BnodeSplit as u8)?;
                w.write_u64::<BigEndian>(src.get())?;
                w.write_u64::<BigEndian>(dst.get())
            }
            LogRecord::BnodeAdd(b) => {
                w.write_u8(Opcode::BnodeAdd as u8)?;
                w.write_u64::<BigEndian>(b.get())
            }
            LogRecord::BnodeUpdate(b) => {
                w.write_u8(Opcode::BnodeUpdate as u8)?;
                w.write_u64::<BigEndian>(b.get())
            }
            LogRecord::BnodeMerge { src, dst } => {
                w.write_u8(Opcode::BnodeMerge as u8)?;
                w.write_u64::<BigEndian>(src.get())?;
                w.write_u64::<BigEndian>(dst.get())
            }
            LogRecord::BnodeDel(b) => {
                w.write_u8(Opcode::BnodeDel as u8)?;
                w.write_u64::<BigEndian>(b.get())
            }
            LogRecord::BnodeAdjust(b) => {
                w.write_u8(Opcode::BnodeAdjust as u8)?;
                w.write_u64::<BigEndian>(b.get())
            }
            LogRecord::BnodeFree(b) => {
                w.write_u8(Opcode::BnodeFree as u8)?;
                w.write_u64::<BigEndian>(b.get())
            }
            LogRecord::OrphanAdd { version, inum } => {
                w.write_u8(Opcode::OrphanAdd as u8)?;
                w.write_u16::<BigEndian>(*version)?;
                w.write_u64::<BigEndian>(*inum)
            }
            LogRecord::OrphanDel { version, inum } => {
                w.write_u8(Opcode::OrphanDel as u8)?;
                w.write_u16::<BigEndian>(*version)?;
                w.write_u64::<BigEndian>(*inum)
            }
            LogRecord::Rollup(delta) => {
                w.write_u8(Opcode::Rollup as u8)?;
                w.write_u64::<BigEndian>(*delta)
            }
            LogRecord::Delta(delta) => {
                w.write_u8(Opcode::Delta as u8)?;
                w.write_u64::<BigEndian>(*delta)
            }
        }
    }

    /// Decodes one record, or `None` at the end-of-block sentinel.
    pub fn decode(r: &mut impl Read) -> io::Result<Option<Self>> {
        let tag = r.read_u8()?;
        let op = Opcode::try_from(tag)?;
        Ok(Some(match op {
            Opcode::EndOfBlock => return Ok(None),
            Opcode::BAlloc => LogRecord::BAlloc(read_extent(r)?),
            Opcode::BFree => LogRecord::BFree(read_extent(r)?),
            Opcode::BFreeOnRollup => LogRecord::BFreeOnRollup(read_extent(r)?),
            Opcode::BFreeRelog => LogRecord::BFreeRelog(read_extent(r)?),
            Opcode::Freeblocks => LogRecord::Freeblocks(r.read_u64::<BigEndian>()?),
            Opcode::LeafRedirect => LogRecord::LeafRedirect {
                old: BlockAddr::new(r.read_u64::<BigEndian>()?),
                new: BlockAddr::new(r.read_u64::<BigEndian>()?),
            },
            Opcode::LeafFree => LogRecord::LeafFree(BlockAddr::new(r.read_u64::<BigEndian>()?)),
            Opcode::BnodeRedirect => LogRecord::BnodeRedirect {
                old: BlockAddr::new(r.read_u64::<BigEndian>()?),
                new: BlockAddr::new(r.read_u64::<BigEndian>()?),
            },
            Opcode::BnodeRoot => LogRecord::BnodeRoot(BlockAddr::new(r.read_u64::<BigEndian>()?)),
            Opcode::BnodeSplit => LogRecord::BnodeSplit {
                src: BlockAddr::new(r.read_u64::<BigEndian>()?),
                dst: BlockAddr::new(r.read_u64::<BigEndian>()?),
            },
            Opcode::BnodeAdd => LogRecord::BnodeAdd(BlockAddr::new(r.read_u64::<BigEndian>()?)),
            Opcode::BnodeUpdate => LogRecord::BnodeUpdate(BlockAddr::new(r.read_u64::<BigEndian>()?)),
            Opcode::BnodeMerge => LogRecord::BnodeMerge {
                src: BlockAddr::new(r.read_u64::<BigEndian>()?),
                dst: BlockAddr::new(r.read_u64::<BigEndian>()?),
            },
            Opcode::BnodeDel => LogRecord::BnodeDel(BlockAddr::new(r.read_u64::<BigEndian>()?)),
            Opcode::BnodeAdjust => LogRecord::BnodeAdjust(BlockAddr::new(r.read_u64::<BigEndian>()?)),
            Opcode::BnodeFree => LogRecord::BnodeFree(BlockAddr::new(r.read_u64::<BigEndian>()?)),
            Opcode::OrphanAdd => LogRecord::OrphanAdd {
                version: r.read_u16::<BigEndian>()?,
                inum: r.read_u64::<BigEndian>()?,
            },
            Opcode::OrphanDel => LogRecord::OrphanDel {
                version: r.read_u16::<BigEndian>()?,
                inum: r.read_u64::<BigEndian>()?,
            },
            Opcode::Rollup => LogRecord::Rollup(r.read_u64::<BigEndian>()?),
            Opcode::Delta => LogRecord::Delta(r.read_u64::<BigEndian>()?),
        }))
    }

    /// Physical records are the ones stage 1 of replay reconstructs
    /// bnode/leaf structure from; `Add`/`Update`/`Del`/`Adjust` mutate an
    /// existing bnode in place without allocating, so they carry no
    /// bitmap effect of their own but are still physical reconstruction
    /// steps.
    pub fn is_physical(&self) -> bool {
        matches!(
            self,
            LogRecord::LeafRedirect { .. }
                | LogRecord::LeafFree(_)
                | LogRecord::BnodeRedirect { .. }
                | LogRecord::BnodeRoot(_)
                | LogRecord::BnodeSplit { .. }
                | LogRecord::BnodeAdd(_)
                | LogRecord::BnodeUpdate(_)
                | LogRecord::BnodeMerge { .. }
                | LogRecord::BnodeDel(_)
                | LogRecord::BnodeAdjust(_)
                | LogRecord::BnodeFree(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(rec: LogRecord) {
        let mut buf = Vec::new();
        rec.encode(&mut buf).unwrap();
        let mut cursor = io::Cursor::new(buf);
        let decoded = LogRecord::decode(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn representative_records_roundtrip() {
        roundtrip(LogRecord::BAlloc(Extent::new(BlockAddr::new(10), 3)));
        roundtrip(LogRecord::OrphanAdd { version: 3, inum: 42 });
        roundtrip(LogRecord::OrphanDel { version: 3, inum: 42 });
        roundtrip(LogRecord::Rollup(7));
        roundtrip(LogRecord::BnodeSplit {
            src: BlockAddr::new(1),
            dst: BlockAddr::new(2),
        });
        roundtrip(LogRecord::BnodeFree(BlockAddr::new(9)));
        roundtrip(LogRecord::BnodeAdjust(BlockAddr::new(4)));
        roundtrip(LogRecord::BnodeUpdate(BlockAddr::new(5)));
        roundtrip(LogRecord::BnodeMerge {
            src: BlockAddr::new(6),
            dst: BlockAddr::new(7),
        });
    }

    #[test]
    fn zeroed_bytes_decode_as_end_of_block() {
        let buf = [0u8; 16];
        let mut cursor = io::Cursor::new(&buf[..]);
        assert_eq!(LogRecord::decode(&mut cursor).unwrap(), None);
    }
}
