//! The block pointer shape the allocator fills in. Fixed external interface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A sector-count or byte-size quantity, generic so callers can't
/// accidentally mix blocks and bytes. Mirrors the `Block<T>` newtype the
/// teacher's own handler state (`SeqLock<Option<(DiskOffset, Block<u32>)>>`)
/// uses for the same purpose. `Dva::offset`/`Dva::asize` are the only
/// fields wired through it here; callers that need a raw integer (to hand
/// to a metaslab, which still deals in bare `u64` offsets/sizes) convert at
/// the boundary via `as_u64`/`as_u32`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Block<T>(pub T);

impl<T: fmt::Debug> fmt::Debug for Block<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:?})", self.0)
    }
}

impl Block<u64> {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Block<u32> {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Maximum number of replicas (ditto blocks) a block pointer may carry.
pub const MAX_DVAS: usize = 3;

/// A Data Virtual Address: `(device, offset, size)`, the unit a block
/// pointer replicates up to [`MAX_DVAS`] times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dva {
    pub vdev: u32,
    /// Sector offset on `vdev`. The high bit is reserved in the wire
    /// format for the gang flag; callers only ever see the low 63 bits.
    pub offset: Block<u64>,
    pub gang: bool,
    pub asize: Block<u32>,
}

impl Dva {
    pub fn new(vdev: u32, offset: u64, asize: u32, gang: bool) -> Self {
        Dva {
            vdev,
            offset: Block(offset),
            gang,
            asize: Block(asize),
        }
    }
}

/// Up to [`MAX_DVAS`] replicas plus the two txg fields the caller stamps in
/// after a successful allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointer {
    pub dvas: Vec<Dva>,
    pub birth_txg: u64,
    pub phys_birth_txg: u64,
}

impl BlockPointer {
    pub fn new(dvas: Vec<Dva>) -> Self {
        assert!(dvas.len() <= MAX_DVAS);
        BlockPointer {
            dvas,
            birth_txg: 0,
            phys_birth_txg: 0,
        }
    }
}
