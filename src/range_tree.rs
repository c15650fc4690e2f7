//! In-memory set of free extents, dual-indexed by offset and by size.
//!
//! A [`RangeTree`] is private to one metaslab; callers serialize all
//! mutation through whatever mutex owns it (the metaslab mutex, in this
//! crate). Coalescing `add`, contract-checked `remove`, and the secondary
//! size index used by best-fit strategies all live here.

use std::collections::BTreeMap;

/// Observes every extent mutation a [`RangeTree`] performs. This supersedes
/// wiring a callback up at every call site: the tree keeps its own secondary
/// size index and histogram coherent internally, and external observers
/// (tests, metrics) can be attached for additional bookkeeping.
pub trait ExtentObserver: Send {
    fn added(&mut self, _start: u64, _size: u64) {}
    fn removed(&mut self, _start: u64, _size: u64) {}
    fn vacated(&mut self) {}
}

/// An offset- and size-indexed collection of non-overlapping,
/// non-adjacent extents.
#[derive(Default)]
pub struct RangeTree {
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeMap<(u64, u64), ()>,
    space: u64,
    histogram: crate::histogram::Histogram,
    observers: Vec<Box<dyn ExtentObserver>>,
}

impl RangeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: Box<dyn ExtentObserver>) -> Self {
        let mut tree = Self::new();
        tree.observers.push(observer);
        tree
    }

    pub fn add_observer(&mut self, observer: Box<dyn ExtentObserver>) {
        self.observers.push(observer);
    }

    fn insert_raw(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        let prev = self.by_offset.insert(start, size);
        debug_assert!(prev.is_none());
        self.by_size.insert((size, start), ());
        self.histogram.add(size);
        self.space += size;
        for obs in &mut self.observers {
            obs.added(start, size);
        }
    }

    fn erase_raw(&mut self, start: u64, size: u64) {
        let removed = self.by_offset.remove(&start);
        debug_assert_eq!(removed, Some(size));
        self.by_size.remove(&(size, start));
        self.histogram.remove(size);
        self.space -= size;
        for obs in &mut self.observers {
            obs.removed(start, size);
        }
    }

    /// Adds `[start, start+size)` as free space, coalescing with any
    /// abutting extent on either side. Panics if the new extent overlaps
    /// an existing one -- a contract violation, per the allocator's error
    /// model, never recovered from.
    pub fn add(&mut self, start: u64, size: u64) {
        assert!(size > 0, "add: zero-size extent");
        let end = start.checked_add(size).expect("add: offset overflow");

        let mut new_start = start;
        let mut new_end = end;

        if let Some((&lstart, &lsize)) = self.by_offset.range(..=start).next_back() {
            let lend = lstart + lsize;
            assert!(
                lend <= start,
                "add({start}, {size}) overlaps existing extent [{lstart}, {lend})"
            );
            if lend == start {
                new_start = lstart;
                self.erase_raw(lstart, lsize);
            }
        }

        if let Some((&rstart, &rsize)) = self.by_offset.range(new_end..).next() {
            assert!(
                rstart >= end,
                "add({start}, {size}) overlaps existing extent starting at {rstart}"
            );
            if rstart == new_end {
                new_end = rstart + rsize;
                self.erase_raw(rstart, rsize);
            }
        }

        assert!(
            self.by_offset.range(start..end).next().is_none(),
            "add({start}, {size}) overlaps free space contained within the new extent"
        );

        self.insert_raw(new_start, new_end - new_start);
    }

    /// Removes `[start, start+size)`, which must be wholly contained in
    /// exactly one existing extent; emits up to two residual extents.
    /// Panics (contract violation) if the range is not wholly free.
    pub fn remove(&mut self, start: u64, size: u64) {
        assert!(size > 0, "remove: zero-size extent");
        let end = start.checked_add(size).expect("remove: offset overflow");

        let (estart, esize) = *self
            .by_offset
            .range(..=start)
            .next_back()
            .unwrap_or_else(|| panic!("remove({start}, {size}): no containing extent"));
        let eend = estart + esize;
        assert!(
            estart <= start && end <= eend,
            "remove({start}, {size}) not wholly contained in extent [{estart}, {eend})"
        );

        self.erase_raw(estart, esize);
        if estart < start {
            self.insert_raw(estart, start - estart);
        }
        if end < eend {
            self.insert_raw(end, eend - end);
        }
    }

    /// Exact membership: is `[start, start+size)` wholly free?
    pub fn contains(&self, start: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        let end = start + size;
        match self.by_offset.range(..=start).next_back() {
            Some((&estart, &esize)) => estart <= start && end <= estart + esize,
            None => false,
        }
    }

    /// Panics unless `[start, start+size)` is wholly free. Debug aid used
    /// at call-boundary assertions.
    pub fn verify(&self, start: u64, size: u64) {
        assert!(
            self.contains(start, size),
            "verify failed: [{start}, {}) is not wholly free",
            start + size
        );
    }

    /// Total bytes covered by all extents.
    pub fn space(&self) -> u64 {
        self.space
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    pub fn extent_count(&self) -> usize {
        self.by_offset.len()
    }

    pub fn histogram(&self) -> &crate::histogram::Histogram {
        &self.histogram
    }

    /// In-offset-order iteration.
    pub fn walk(&self, mut f: impl FnMut(u64, u64)) {
        for (&start, &size) in &self.by_offset {
            f(start, size);
        }
    }

    /// The largest extent currently held, if any.
    pub fn max_segment(&self) -> Option<(u64, u64)> {
        self.by_size
            .keys()
            .next_back()
            .map(|&(size, start)| (start, size))
    }

    /// The first extent at or after `offset_hint`, by offset order,
    /// together with every extent after it -- used by the offset-cursor
    /// strategies (first-fit, cursor-fit, new-dynamic-fit).
    pub fn range_from(&self, offset_hint: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_offset
            .range(offset_hint..)
            .map(|(&start, &size)| (start, size))
    }

    /// Extents ordered by size (ascending), then offset -- used by
    /// best-fit lookups.
    pub fn by_size_ascending(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_size.keys().map(|&(size, start)| (start, size))
    }

    /// Smallest extent whose size lies in `size_range`, by offset among
    /// ties -- used by new-dynamic-fit's clamped size-tree fallback.
    pub fn smallest_in_size_range(&self, size_range: std::ops::RangeInclusive<u64>) -> Option<(u64, u64)> {
        self.by_size
            .range((*size_range.start(), 0)..=(*size_range.end(), u64::MAX))
            .next()
            .map(|&(size, start)| (start, size))
    }

    /// Removes every extent, optionally handing each to `f(dst, start,
    /// size)` first (typically "add to another tree"). Reinitializes the
    /// secondary index and histogram directly rather than walking and
    /// removing node by node.
    pub fn vacate<D>(&mut self, dst: &mut D, mut f: impl FnMut(&mut D, u64, u64)) {
        for (&start, &size) in &self.by_offset {
            f(dst, start, size);
        }
        self.by_offset.clear();
        self.by_size.clear();
        self.histogram.clear();
        self.space = 0;
        for obs in &mut self.observers {
            obs.vacated();
        }
    }

    /// O(1)-ish pointer swap of both indices (and the histogram) with
    /// `other`. Observers are not swapped: they remain attached to the
    /// tree object they were registered on.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.by_offset, &mut other.by_offset);
        std::mem::swap(&mut self.by_size, &mut other.by_size);
        std::mem::swap(&mut self.space, &mut other.space);
        std::mem::swap(&mut self.histogram, &mut other.histogram);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_coalesces_neighbors() {
        let mut t = RangeTree::new();
        t.add(0, 10);
        t.add(20, 10);
        t.add(10, 10);
        assert_eq!(t.extent_count(), 1);
        assert_eq!(t.space(), 30);
        assert!(t.contains(0, 30));
    }

    #[test]
    fn remove_splits() {
        let mut t = RangeTree::new();
        t.add(0, 100);
        t.remove(40, 10);
        assert_eq!(t.extent_count(), 2);
        assert_eq!(t.space(), 90);
        assert!(t.contains(0, 40));
        assert!(t.contains(50, 50));
        assert!(!t.contains(35, 10));
    }

    #[test]
    #[should_panic(expected = "not wholly contained")]
    fn remove_partial_overlap_panics() {
        let mut t = RangeTree::new();
        t.add(0, 10);
        t.add(20, 10);
        t.remove(5, 10);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn double_add_panics() {
        let mut t = RangeTree::new();
        t.add(0, 10);
        t.add(0, 10);
    }

    #[test]
    fn vacate_moves_extents() {
        let mut src = RangeTree::new();
        src.add(0, 10);
        src.add(100, 10);
        let mut dst = RangeTree::new();
        src.vacate(&mut dst, |dst, start, size| dst.add(start, size));
        assert!(src.is_empty());
        assert_eq!(dst.space(), 20);
    }

    #[test]
    fn swap_exchanges_contents() {
        let mut a = RangeTree::new();
        a.add(0, 10);
        let mut b = RangeTree::new();
        b.add(100, 50);
        a.swap(&mut b);
        assert!(a.contains(100, 50));
        assert!(b.contains(0, 10));
    }

    #[test]
    fn max_segment_tracks_largest() {
        let mut t = RangeTree::new();
        t.add(0, 10);
        t.add(100, 50);
        t.add(200, 5);
        assert_eq!(t.max_segment(), Some((100, 50)));
    }
}
