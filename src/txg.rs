//! Transaction-group bookkeeping shared by the metaslab and its owning
//! group/class.
//!
//! Per-txg and defer trees are small fixed-size arrays indexed by `txg mod
//! TXG_SIZE` / `txg mod TXG_DEFER_SIZE`, not a dynamic map -- see the design
//! notes on per-txg state.

/// Monotonic transaction-group number. All writes within one txg commit
/// atomically.
pub type Txg = u64;

/// Number of in-flight (not yet synced) txg slots kept per metaslab.
pub const TXG_SIZE: usize = 4;

/// Number of txgs a free is held in the defer tree before it becomes
/// reusable, protecting against rewinding into a crash-recovered but
/// not-yet-committed write.
pub const TXG_DEFER_SIZE: usize = 3;

/// Index into a `[T; TXG_SIZE]` per-txg array for `txg`.
pub const fn txg_slot(txg: Txg) -> usize {
    (txg % TXG_SIZE as Txg) as usize
}

/// Index into a `[T; TXG_DEFER_SIZE]` defer array for `txg`.
pub const fn defer_slot(txg: Txg) -> usize {
    (txg % TXG_DEFER_SIZE as Txg) as usize
}

/// The slot that is guaranteed empty (fully drained and synced) relative to
/// `txg`: `txg - TXG_SIZE + 1` wrapped into the ring, matching
/// `TXG_CLEAN` in the source allocator -- the other end of the in-flight
/// window from `txg`'s own slot.
pub const fn clean_slot(txg: Txg) -> usize {
    txg_slot(txg.wrapping_add(1))
}

/// A seqlock-guarded view of "what txg is currently open". Readers (the
/// allocation path, many of them, concurrently) spin through a cheap
/// optimistic read; only the single syncing thread ever writes.
pub struct TxgHandle {
    inner: seqlock::SeqLock<Txg>,
}

impl TxgHandle {
    pub fn new(initial: Txg) -> Self {
        Self {
            inner: seqlock::SeqLock::new(initial),
        }
    }

    pub fn get(&self) -> Txg {
        self.inner.read()
    }

    pub fn advance(&self) -> Txg {
        let mut guard = self.inner.lock_write();
        *guard += 1;
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_wrap() {
        assert_eq!(txg_slot(0), 0);
        assert_eq!(txg_slot(TXG_SIZE as Txg), 0);
        assert_eq!(txg_slot(1), 1);
        assert_eq!(defer_slot(TXG_DEFER_SIZE as Txg), 0);
    }

    #[test]
    fn handle_advances() {
        let h = TxgHandle::new(5);
        assert_eq!(h.get(), 5);
        assert_eq!(h.advance(), 6);
        assert_eq!(h.get(), 6);
    }
}
