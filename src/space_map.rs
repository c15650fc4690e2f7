//! The on-disk space map is out of scope (§1): this module only fixes the
//! contract a metaslab needs against it -- an append-only log of
//! ALLOC/FREE records that can be loaded into a [`RangeTree`] and appended
//! to per transaction group -- plus an in-memory reference implementation
//! used by tests and by callers without a real disk-backed log yet.

use crate::error::{Result, ResultExt};
use crate::histogram::Histogram;
use crate::range_tree::RangeTree;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Alloc,
    Free,
}

/// The opaque on-disk log contract. A real implementation lives in the
/// space-map/DMU layer outside this crate's scope; `MemSpaceMap` below is
/// the in-memory stand-in used for tests.
pub trait SpaceMap: Send {
    /// Replays every entry in order into a fresh [`RangeTree`]: FREE adds,
    /// ALLOC removes. Fails with [`crate::error::ErrorKind::Io`] if the
    /// underlying log can't be read.
    fn load(&self) -> Result<RangeTree>;

    /// Appends one record. Single-writer: only the syncing thread for the
    /// owning txg calls this.
    fn append(&mut self, kind: EntryKind, offset: u64, length: u64) -> Result<()>;

    /// Length of the on-disk log, in bytes.
    fn length(&self) -> u64;

    /// Power-of-two histogram of extent sizes, maintained incrementally.
    fn histogram(&self) -> &Histogram;

    /// Truncates the log to empty, in a DMU transaction. Used by condense
    /// to rewrite the log into its minimal form.
    fn truncate(&mut self);
}

fn bytes_needed(v: u64) -> usize {
    if v == 0 {
        1
    } else {
        (64 - v.leading_zeros() as usize + 7) / 8
    }
}

/// In-memory space map: an append-only byte log of variable-length
/// `(kind, offset, length)` records, encoded with as few bytes as the
/// magnitude of `offset`/`length` require -- mirroring the word-packed
/// on-disk format this stands in for.
#[derive(Default)]
pub struct MemSpaceMap {
    log: Vec<u8>,
    histogram: Histogram,
}

impl MemSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode(&mut self, kind: EntryKind, offset: u64, length: u64) -> Result<()> {
        let ob = bytes_needed(offset);
        let lb = bytes_needed(length);
        self.log
            .write_u8(match kind {
                EntryKind::Alloc => 0,
                EntryKind::Free => 1,
            })
            .chain_err(|| "space map encode")?;
        self.log.write_u8(ob as u8).chain_err(|| "space map encode")?;
        self.log.write_u8(lb as u8).chain_err(|| "space map encode")?;
        self.log
            .write_uint::<LittleEndian>(offset, ob)
            .chain_err(|| "space map encode")?;
        self.log
            .write_uint::<LittleEndian>(length, lb)
            .chain_err(|| "space map encode")?;
        Ok(())
    }
}

impl SpaceMap for MemSpaceMap {
    fn load(&self) -> Result<RangeTree> {
        let mut tree = RangeTree::new();
        let mut cursor = Cursor::new(&self.log[..]);
        while (cursor.position() as usize) < self.log.len() {
            let tag = cursor.read_u8().chain_err(|| "space map load")?;
            let ob = cursor.read_u8().chain_err(|| "space map load")? as usize;
            let lb = cursor.read_u8().chain_err(|| "space map load")? as usize;
            let offset = cursor
                .read_uint::<LittleEndian>(ob)
                .chain_err(|| "space map load")?;
            let length = cursor
                .read_uint::<LittleEndian>(lb)
                .chain_err(|| "space map load")?;
            match tag {
                1 => tree.add(offset, length),
                0 => tree.remove(offset, length),
                _ => bail!(crate::error::ErrorKind::Io),
            }
        }
        Ok(tree)
    }

    fn append(&mut self, kind: EntryKind, offset: u64, length: u64) -> Result<()> {
        match kind {
            EntryKind::Free => self.histogram.add(length),
            EntryKind::Alloc => self.histogram.remove(length),
        }
        self.encode(kind, offset, length)
    }

    fn length(&self) -> u64 {
        self.log.len() as u64
    }

    fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    fn truncate(&mut self) {
        self.log.clear();
        self.histogram.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_log() {
        let mut sm = MemSpaceMap::new();
        sm.append(EntryKind::Free, 0, 1000).unwrap();
        sm.append(EntryKind::Alloc, 100, 50).unwrap();
        let tree = sm.load().unwrap();
        assert!(tree.contains(0, 100));
        assert!(tree.contains(150, 850));
        assert!(!tree.contains(100, 50));
    }

    #[test]
    fn length_grows_with_entries() {
        let mut sm = MemSpaceMap::new();
        assert_eq!(sm.length(), 0);
        sm.append(EntryKind::Free, 0, 1000).unwrap();
        assert!(sm.length() > 0);
    }

    #[test]
    fn truncate_clears_log() {
        let mut sm = MemSpaceMap::new();
        sm.append(EntryKind::Free, 0, 1000).unwrap();
        sm.truncate();
        assert_eq!(sm.length(), 0);
        assert!(sm.load().unwrap().is_empty());
    }
}
