//! Fixed-size slice of one device's address space: the unit of allocation
//! bookkeeping. Owns the free range tree, per-txg alloc/free trees, the
//! defer trees, and the pluggable offset-search strategy.

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::range_tree::RangeTree;
use crate::space_map::{EntryKind, MemSpaceMap, SpaceMap};
use crate::strategy::{AllocStrategyOps as _, Strategy, StrategyCtx};
use crate::txg::{clean_slot, defer_slot, txg_slot, Txg, TXG_DEFER_SIZE, TXG_SIZE};

pub const ACTIVE_PRIMARY: u64 = 1 << 63;
pub const ACTIVE_SECONDARY: u64 = 1 << 62;
const WEIGHT_MASK: u64 = !(ACTIVE_PRIMARY | ACTIVE_SECONDARY);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Inactive,
    Primary,
    Secondary,
}

/// Two-phase condense state machine: allocation is disallowed while
/// `Condensing`. The flag is restored to `Fresh` under the metaslab lock
/// once the (simulated) DMU commit for the condensed log completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondenseState {
    Fresh,
    Condensing,
}

pub struct Metaslab {
    pub id: u64,
    pub start: u64,
    pub size: u64,
    ashift: u32,

    sm: Option<Box<dyn SpaceMap>>,
    tree: Option<RangeTree>,
    alloctree: [RangeTree; TXG_SIZE],
    freetree: [RangeTree; TXG_SIZE],
    defertree: [RangeTree; TXG_DEFER_SIZE],

    /// Free space, maintained even while unloaded so weight/capacity can
    /// be computed without forcing a load.
    free_space: u64,

    weight: u64,
    active: ActiveState,
    condense: CondenseState,
    access_txg: Txg,

    strategy: Strategy,
    strategy_state: crate::strategy::StrategyState,
}

impl Metaslab {
    /// Creates a metaslab; if `sm` is `Some`, it names an already-existing
    /// on-disk space map object to be loaded on first use.
    pub fn init(id: u64, start: u64, size: u64, ashift: u32, sm: Option<Box<dyn SpaceMap>>, strategy: Strategy) -> Self {
        Metaslab {
            id,
            start,
            size,
            ashift,
            sm,
            tree: None,
            alloctree: std::array::from_fn(|_| RangeTree::new()),
            freetree: std::array::from_fn(|_| RangeTree::new()),
            defertree: std::array::from_fn(|_| RangeTree::new()),
            free_space: size,
            weight: size,
            active: ActiveState::Inactive,
            condense: CondenseState::Fresh,
            access_txg: 0,
            strategy,
            strategy_state: crate::strategy::StrategyState::default(),
        }
    }

    /// Destroys the metaslab. Asserts there is no space left deferred --
    /// a metaslab is only ever torn down when its device is removed, long
    /// after all its defer windows have elapsed.
    pub fn fini(self) {
        for defer in &self.defertree {
            assert_eq!(defer.space(), 0, "fini: deferred space still outstanding");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.tree.is_some()
    }

    pub fn is_condensing(&self) -> bool {
        self.condense == CondenseState::Condensing
    }

    pub fn active_state(&self) -> ActiveState {
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active != ActiveState::Inactive
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn free_space(&self) -> u64 {
        self.free_space
    }

    pub fn percent_free(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.free_space as f64 / self.size as f64 * 100.0
        }
    }

    /// The largest segment this metaslab could still serve, used by
    /// [`Metaslab::passivate`]'s re-sort and by best-fit strategies.
    pub fn max_segment_size(&self) -> u64 {
        self.tree
            .as_ref()
            .and_then(|t| t.max_segment())
            .map(|(_, size)| size)
            .unwrap_or(0)
    }

    pub fn access_txg(&self) -> Txg {
        self.access_txg
    }

    /// The largest free extent's `(start, size)`, if the metaslab is
    /// loaded and holds any free space.
    pub fn max_segment(&self) -> Option<(u64, u64)> {
        self.tree.as_ref().and_then(|t| t.max_segment())
    }

    /// Current on-disk space map length in bytes, or 0 if none exists yet.
    pub fn space_map_length(&self) -> u64 {
        self.sm.as_ref().map(|s| s.length()).unwrap_or(0)
    }

    /// Brings the free tree into memory. Loads the space map if one
    /// exists; otherwise treats the whole metaslab as one free extent.
    /// Always subtracts the current defer trees afterward, since those
    /// ranges are not yet safe to reuse regardless of what the space map
    /// says.
    pub fn load(&mut self) -> Result<()> {
        if self.tree.is_some() {
            return Ok(());
        }
        let mut tree = match &self.sm {
            Some(sm) => sm.load().map_err(|_| Error::from(ErrorKind::Io))?,
            None => {
                let mut t = RangeTree::new();
                t.add(self.start, self.size);
                t
            }
        };

        let mut held_back = Vec::new();
        for defer in &self.defertree {
            defer.walk(|s, sz| held_back.push((s, sz)));
        }
        for (s, sz) in held_back {
            tree.remove(s, sz);
        }

        log::debug!(
            "metaslab {} loaded, {} bytes free across {} extents",
            self.id,
            tree.space(),
            tree.extent_count()
        );
        self.tree = Some(tree);
        Ok(())
    }

    /// Discards the free tree; the defer/alloc/free trees and the
    /// on-disk space map remain the source of truth.
    pub fn unload(&mut self) {
        if self.tree.is_some() {
            log::debug!("metaslab {} unloaded", self.id);
        }
        self.tree = None;
        self.active = ActiveState::Inactive;
    }

    fn base_weight(&self, ms_count: u64, cfg: &Config) -> u64 {
        let space = self.free_space;
        let bias = if ms_count == 0 {
            0
        } else {
            (self.id.saturating_mul(space)) / ms_count
        };
        let mut w = 2u64.saturating_mul(space).saturating_sub(bias);
        if cfg.weight_factor_enable {
            if let Some(sm) = &self.sm {
                w = w.saturating_add(sm.histogram().weight_bonus());
            }
        }
        w & WEIGHT_MASK
    }

    /// Recomputes base weight, then halves it if the active strategy
    /// considers the free tree fragmented -- the "demote" half of
    /// `fragmented`'s "mark the metaslab's weight preference or demote it"
    /// contract; marking is the caller's business (it just sees a lower
    /// weight and sorts accordingly).
    pub fn recompute_weight(&mut self, ms_count: u64, cfg: &Config) {
        let mut base = self.base_weight(ms_count, cfg);
        if let Some(tree) = &self.tree {
            if self.strategy.fragmented(tree, self.size, cfg) {
                base /= 2;
            }
        }
        let active_bits = self.weight & !WEIGHT_MASK;
        self.weight = (base & WEIGHT_MASK) | active_bits;
    }

    /// Loads the metaslab if cold and sets the active bit in its weight.
    pub fn activate(&mut self, secondary: bool, ms_count: u64, cfg: &Config) -> Result<()> {
        if self.tree.is_none() {
            self.load()?;
        }
        self.active = if secondary {
            ActiveState::Secondary
        } else {
            ActiveState::Primary
        };
        let base = self.base_weight(ms_count, cfg);
        let flag = if secondary { ACTIVE_SECONDARY } else { ACTIVE_PRIMARY };
        self.weight = base | flag;
        Ok(())
    }

    /// Clears the active bit and re-sorts by `min(current weight,
    /// max_size_left)`.
    pub fn passivate(&mut self, max_size_left: u64) {
        self.active = ActiveState::Inactive;
        let base = self.weight & WEIGHT_MASK;
        self.weight = base.min(max_size_left);
    }

    /// Searches for `size` bytes via the active strategy; on success
    /// removes the range from the free tree and records it in this txg's
    /// alloc tree.
    pub fn alloc_block(&mut self, size: u64, txg: Txg, cfg: &Config) -> Option<u64> {
        assert!(
            self.condense != CondenseState::Condensing,
            "alloc_block: metaslab {} is condensing",
            self.id
        );
        let align_unit = 1u64 << self.ashift;
        assert_eq!(size % align_unit, 0, "alloc_block: size not ashift-aligned");

        let tree_ref = self.tree.as_mut().expect("alloc_block: metaslab not loaded");
        let before = tree_ref.space();
        let offset = {
            let mut ctx = StrategyCtx {
                tree: tree_ref,
                size,
                ms_size: self.size,
                cfg,
                state: &mut self.strategy_state,
            };
            self.strategy.alloc(&mut ctx)?
        };
        assert_eq!(offset % align_unit, 0, "alloc_block: offset not ashift-aligned");

        tree_ref.remove(offset, size);
        debug_assert_eq!(before - tree_ref.space(), size);

        self.alloctree[txg_slot(txg)].add(offset, size);
        self.free_space -= size;
        self.access_txg = txg;
        Some(offset)
    }

    /// Records a free. When `now` is false (the normal path) it only
    /// lands in this txg's free tree; when `now` is true (in-txg
    /// rollback) it is also added back to the live free tree immediately.
    pub fn free_block(&mut self, offset: u64, size: u64, txg: Txg, now: bool) {
        let align_unit = 1u64 << self.ashift;
        assert_eq!(offset % align_unit, 0, "free_block: offset not ashift-aligned");
        assert_eq!(size % align_unit, 0, "free_block: size not ashift-aligned");

        self.freetree[txg_slot(txg)].add(offset, size);
        self.free_space += size;
        if now {
            if let Some(tree) = self.tree.as_mut() {
                tree.add(offset, size);
            }
        }
    }

    /// Marks a range allocated during crash recovery. Requires the
    /// metaslab to be loaded.
    pub fn claim(&mut self, offset: u64, size: u64, txg: Txg) -> Result<()> {
        let tree = self
            .tree
            .as_mut()
            .ok_or_else(|| Error::from(ErrorKind::Invalid("claim: metaslab not loaded".into())))?;
        if !tree.contains(offset, size) {
            bail!(ErrorKind::NotFound);
        }
        tree.remove(offset, size);
        self.free_space -= size;
        if txg != 0 {
            self.alloctree[txg_slot(txg)].add(offset, size);
        }
        Ok(())
    }

    fn ensure_space_map(&mut self) {
        if self.sm.is_none() {
            self.sm = Some(Box::new(MemSpaceMap::new()));
        }
    }

    /// The space map is condensed once (a) the largest free segment,
    /// encoded as individual per-sector entries, would already cost more
    /// bytes than the space map's current on-disk length, and (b) that
    /// on-disk length exceeds `condense_pct/100` of what a minimal
    /// one-word-per-extent encoding would take.
    pub fn should_condense(&self, cfg: &Config) -> bool {
        let (tree, sm) = match (&self.tree, &self.sm) {
            (Some(t), Some(s)) => (t, s),
            _ => return false,
        };
        let sm_len = sm.length();
        if sm_len == 0 {
            // Never written. The incremental path would append a raw ALLOC
            // against untouched free space, which space-map replay can't
            // make sense of from an empty range tree. Force the condense
            // path so the first write is always a valid baseline.
            return true;
        }
        let max_seg = tree.max_segment().map(|(_, sz)| sz).unwrap_or(0);
        let sectors = max_seg >> self.ashift;
        let naive_bytes = sectors.saturating_mul(8);

        let n_extents = tree.extent_count() as u64;
        let minimal_bytes = n_extents.saturating_mul(8);
        let threshold = minimal_bytes.saturating_mul(cfg.condense_pct as u64) / 100;

        naive_bytes > sm_len && sm_len > threshold
    }

    /// Rewrites the space map into its minimal form: one synthetic
    /// everything-allocated range (with this txg's pending frees, the
    /// defer trees, and the live free tree carved out) as ALLOC records,
    /// followed by the free set as FREE records.
    fn condense(&mut self, txg: Txg) -> Result<()> {
        self.condense = CondenseState::Condensing;
        let result = self.condense_inner(txg);
        self.condense = CondenseState::Fresh;
        result
    }

    fn condense_inner(&mut self, txg: Txg) -> Result<()> {
        let mut free_set = self.tree.clone_contents();
        for defer in &self.defertree {
            defer.walk(|s, sz| free_set.add(s, sz));
        }
        self.freetree[txg_slot(txg)].walk(|s, sz| free_set.add(s, sz));

        let mut allocated = RangeTree::new();
        allocated.add(self.start, self.size);
        let mut holes = Vec::new();
        free_set.walk(|s, sz| holes.push((s, sz)));
        for (s, sz) in holes {
            allocated.remove(s, sz);
        }

        let mut alloc_entries = Vec::new();
        allocated.walk(|s, sz| alloc_entries.push((s, sz)));
        let mut free_entries = Vec::new();
        free_set.walk(|s, sz| free_entries.push((s, sz)));

        self.ensure_space_map();
        let sm = self.sm.as_mut().unwrap();
        sm.truncate();
        for (s, sz) in alloc_entries {
            sm.append(EntryKind::Alloc, s, sz)?;
        }
        for (s, sz) in free_entries {
            sm.append(EntryKind::Free, s, sz)?;
        }
        log::debug!(
            "metaslab {} condensed, space map now {} bytes",
            self.id,
            sm.length()
        );
        Ok(())
    }

    /// Appends this txg's alloc/free records to the space map (or
    /// condenses, on sync-pass 1 when warranted), then rotates the
    /// per-txg free-tree slot.
    pub fn sync(&mut self, txg: Txg, sync_pass: u32, cfg: &Config) -> Result<()> {
        let slot = txg_slot(txg);
        if self.alloctree[slot].is_empty() && self.freetree[slot].is_empty() {
            return Ok(());
        }
        self.ensure_space_map();

        if self.tree.is_some() && sync_pass == 1 && self.should_condense(cfg) {
            self.condense(txg)?;
        } else {
            let mut alloc_entries = Vec::new();
            self.alloctree[slot].walk(|s, sz| alloc_entries.push((s, sz)));
            let mut free_entries = Vec::new();
            self.freetree[slot].walk(|s, sz| free_entries.push((s, sz)));
            let sm = self.sm.as_mut().unwrap();
            for (s, sz) in alloc_entries {
                sm.append(EntryKind::Alloc, s, sz)?;
            }
            for (s, sz) in free_entries {
                sm.append(EntryKind::Free, s, sz)?;
            }
        }

        self.alloctree[slot] = RangeTree::new();

        let clean = clean_slot(txg);
        if sync_pass == 1 {
            if clean != slot {
                let (lo, hi) = if slot < clean { (slot, clean) } else { (clean, slot) };
                let (left, right) = self.freetree.split_at_mut(hi);
                left[lo].swap(&mut right[0]);
            }
        } else {
            let mut entries = Vec::new();
            self.freetree[slot].walk(|s, sz| entries.push((s, sz)));
            for (s, sz) in entries {
                self.freetree[clean].add(s, sz);
            }
            self.freetree[slot] = RangeTree::new();
        }

        Ok(())
    }

    /// Promotes this txg's synced frees into the defer ring, merges the
    /// defer slot whose window has just elapsed back into the live free
    /// tree, resorts by weight, and unloads if idle long enough.
    pub fn sync_done(&mut self, txg: Txg, ms_count: u64, cfg: &Config) {
        let clean = clean_slot(txg);
        let dslot = defer_slot(txg);

        let mut elapsed = Vec::new();
        self.defertree[dslot].walk(|s, sz| elapsed.push((s, sz)));
        if let Some(tree) = self.tree.as_mut() {
            for (s, sz) in elapsed {
                tree.add(s, sz);
            }
        }
        self.defertree[dslot] = RangeTree::new();
        self.freetree[clean].swap(&mut self.defertree[dslot]);

        self.recompute_weight(ms_count, cfg);

        if !cfg.debug_unload
            && self.tree.is_some()
            && !self.is_active()
            && txg.saturating_sub(self.access_txg) >= cfg.unload_delay
        {
            self.unload();
        }
    }
}

trait CloneContents {
    fn clone_contents(&self) -> RangeTree;
}

impl CloneContents for Option<RangeTree> {
    fn clone_contents(&self) -> RangeTree {
        let mut out = RangeTree::new();
        if let Some(t) = self {
            t.walk(|s, sz| out.add(s, sz));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{DynamicFit, Strategy};
    use crate::txg::TXG_DEFER_SIZE;

    fn ms(size: u64, ashift: u32) -> Metaslab {
        Metaslab::init(0, 0, size, ashift, None, Strategy::from(DynamicFit))
    }

    #[test]
    fn basic_alloc_free_roundtrip() {
        let cfg = Config::default();
        let mut m = ms(1 << 20, 9);
        m.activate(false, 1, &cfg).unwrap();

        let mut offsets = Vec::new();
        for _ in 0..100 {
            let off = m.alloc_block(4096, 1, &cfg).expect("alloc should succeed");
            offsets.push(off);
        }
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 100, "all offsets must be distinct");
        assert_eq!(m.free_space(), (1u64 << 20) - 100 * 4096);

        for off in &offsets {
            m.free_block(*off, 4096, 1, false);
        }
        assert_eq!(m.free_space(), 1 << 20);

        // Drive the free through TXG_DEFER_SIZE + 1 sync/sync_done cycles
        // so it promotes all the way back to the live free tree.
        for t in 1..=(TXG_DEFER_SIZE as u64 + 1) {
            m.sync(t, 1, &cfg).unwrap();
            m.sync_done(t, 1, &cfg);
        }
        m.unload();
        m.load().unwrap();
        assert_eq!(m.free_space(), 1 << 20);
    }

    #[test]
    fn alignment_is_enforced() {
        let cfg = Config::default();
        let mut m = ms(1 << 20, 12);
        m.activate(false, 1, &cfg).unwrap();
        let off = m.alloc_block(8192, 1, &cfg).unwrap();
        assert_eq!(off % 4096, 0);
    }

    #[test]
    fn first_sync_of_a_fresh_metaslab_forces_condense() {
        let cfg = Config::default();
        let mut m = ms(1 << 20, 9);
        m.activate(false, 1, &cfg).unwrap();

        let off = m.alloc_block(4096, 1, &cfg).unwrap();
        m.free_block(off, 4096, 1, true);
        m.sync(1, 1, &cfg).unwrap();
        m.sync_done(1, 1, &cfg);

        // Reloading replays the space map from scratch; this panics if the
        // first sync ever wrote a bare ALLOC against an untouched log.
        m.unload();
        m.load().unwrap();
    }

    #[test]
    #[should_panic]
    fn alloc_while_condensing_panics() {
        let cfg = Config::default();
        let mut m = ms(1 << 20, 9);
        m.activate(false, 1, &cfg).unwrap();
        m.condense = CondenseState::Condensing;
        m.alloc_block(4096, 1, &cfg);
    }
}
