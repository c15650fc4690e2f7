//! Pluggable in-metaslab offset-search policy.
//!
//! Represented as a sum type of strategy variants (via `enum_dispatch`)
//! rather than a trait object, per the design notes -- the strategy itself
//! carries no state; the cursor state it reads and advances lives in the
//! owning metaslab's [`StrategyState`].

use crate::config::Config;
use crate::histogram::highbit;
use crate::range_tree::RangeTree;
use enum_dispatch::enum_dispatch;

use crate::histogram::HIGHBIT_MAX;

/// Per-metaslab cursor state threaded through every strategy call. Lives
/// on the metaslab, not the strategy, so that swapping a metaslab's
/// active strategy (not supported today, but structurally possible)
/// wouldn't lose allocation position.
#[derive(Debug, Clone)]
pub struct StrategyState {
    /// First-fit's per-size-bucket cursors.
    pub cursors: [u64; HIGHBIT_MAX],
    /// Cursor-fit's currently-active extent.
    pub cf_cursor: u64,
    pub cf_cursor_end: u64,
    /// New-dynamic-fit's single offset cursor.
    pub ndf_cursor: u64,
}

impl Default for StrategyState {
    fn default() -> Self {
        StrategyState {
            cursors: [0; HIGHBIT_MAX],
            cf_cursor: 0,
            cf_cursor_end: 0,
            ndf_cursor: 0,
        }
    }
}

/// Everything a strategy needs to search for an offset within one
/// metaslab's free tree.
pub struct StrategyCtx<'a> {
    pub tree: &'a RangeTree,
    pub size: u64,
    pub ms_size: u64,
    pub cfg: &'a Config,
    pub state: &'a mut StrategyState,
}

#[enum_dispatch]
pub trait AllocStrategyOps {
    /// Searches for an offset that can satisfy `ctx.size`, advancing
    /// cursor state on success. Does not mutate `ctx.tree`; the caller
    /// (the metaslab) removes the returned range from the free tree.
    fn alloc(&self, ctx: &mut StrategyCtx) -> Option<u64>;

    /// Whether this metaslab should be considered fragmented under this
    /// strategy's policy, for weight/demotion decisions.
    fn fragmented(&self, _tree: &RangeTree, _ms_size: u64, _cfg: &Config) -> bool {
        false
    }
}

fn round_up(x: u64, align: u64) -> u64 {
    if align <= 1 {
        x
    } else {
        ((x + align - 1) / align) * align
    }
}

fn scan_from(tree: &RangeTree, size: u64, align: u64, cursor: u64) -> Option<u64> {
    for (start, extent_size) in tree.range_from(cursor) {
        let aligned_start = round_up(start, align);
        if aligned_start.checked_add(size).map_or(false, |end| end <= start + extent_size) {
            return Some(aligned_start);
        }
    }
    None
}

fn align_bucket(size: u64) -> usize {
    let align = size & size.wrapping_neg();
    (highbit(align).saturating_sub(1) as usize).min(HIGHBIT_MAX - 1)
}

/// Scans the offset-ordered tree starting at the cursor for the relevant
/// power-of-two bucket; wraps around once on exhaustion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFit;

impl AllocStrategyOps for FirstFit {
    fn alloc(&self, ctx: &mut StrategyCtx) -> Option<u64> {
        let align = ctx.size & ctx.size.wrapping_neg();
        let bucket = align_bucket(ctx.size);
        let cursor = ctx.state.cursors[bucket];

        if let Some(offset) = scan_from(ctx.tree, ctx.size, align, cursor) {
            ctx.state.cursors[bucket] = offset + ctx.size;
            return Some(offset);
        }
        if cursor != 0 {
            if let Some(offset) = scan_from(ctx.tree, ctx.size, align, 0) {
                ctx.state.cursors[bucket] = offset + ctx.size;
                return Some(offset);
            }
        }
        ctx.state.cursors[bucket] = 0;
        None
    }
}

/// First-fit while the metaslab is "healthy" (large enough max segment and
/// enough free space remaining); otherwise best-fit via the size tree.
/// The default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicFit;

impl DynamicFit {
    fn should_use_best_fit(tree: &RangeTree, ms_size: u64, cfg: &Config) -> bool {
        let max_size = tree.max_segment().map(|(_, s)| s).unwrap_or(0);
        if max_size < cfg.df_alloc_threshold {
            return true;
        }
        if ms_size == 0 {
            return false;
        }
        let percent_free = (tree.space() as f64 / ms_size as f64) * 100.0;
        percent_free < cfg.df_free_pct as f64
    }
}

impl AllocStrategyOps for DynamicFit {
    fn alloc(&self, ctx: &mut StrategyCtx) -> Option<u64> {
        let max_size = ctx.tree.max_segment().map(|(_, s)| s).unwrap_or(0);
        if max_size < ctx.size {
            return None;
        }

        if !Self::should_use_best_fit(ctx.tree, ctx.ms_size, ctx.cfg) {
            let align = ctx.size & ctx.size.wrapping_neg();
            let bucket = align_bucket(ctx.size);
            let cursor = ctx.state.cursors[bucket];
            if let Some(offset) = scan_from(ctx.tree, ctx.size, align, cursor) {
                ctx.state.cursors[bucket] = offset + ctx.size;
                return Some(offset);
            }
        }

        // Best-fit: reset the relevant cursor and scan the size tree for
        // the smallest extent that still satisfies the request.
        let bucket = align_bucket(ctx.size);
        ctx.state.cursors[bucket] = 0;
        for (start, extent_size) in ctx.tree.by_size_ascending() {
            if extent_size >= ctx.size {
                return Some(start);
            }
        }
        None
    }

    fn fragmented(&self, tree: &RangeTree, ms_size: u64, cfg: &Config) -> bool {
        Self::should_use_best_fit(tree, ms_size, cfg)
    }
}

/// Allocates sequentially out of a single chosen extent; when it's
/// exhausted, takes the largest remaining extent from the size tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorFit;

impl AllocStrategyOps for CursorFit {
    fn alloc(&self, ctx: &mut StrategyCtx) -> Option<u64> {
        if ctx.state.cf_cursor < ctx.state.cf_cursor_end {
            let remaining = ctx.state.cf_cursor_end - ctx.state.cf_cursor;
            if remaining >= ctx.size {
                debug_assert!(ctx.tree.contains(ctx.state.cf_cursor, ctx.size));
                let offset = ctx.state.cf_cursor;
                ctx.state.cf_cursor += ctx.size;
                return Some(offset);
            }
        }

        let (start, len) = ctx.tree.max_segment()?;
        if len < ctx.size {
            return None;
        }
        ctx.state.cf_cursor = start + ctx.size;
        ctx.state.cf_cursor_end = start + len;
        Some(start)
    }
}

/// A single offset cursor over the whole tree; falls back to a
/// size-clamped window of the size tree rather than a pure best-fit scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewDynamicFit;

impl AllocStrategyOps for NewDynamicFit {
    fn alloc(&self, ctx: &mut StrategyCtx) -> Option<u64> {
        if let Some((start, len)) = ctx.tree.range_from(ctx.state.ndf_cursor).next() {
            if len >= ctx.size {
                ctx.state.ndf_cursor = start + ctx.size;
                return Some(start);
            }
        }

        let hb = highbit(ctx.size);
        let upper = 1u64
            .checked_shl(hb + ctx.cfg.ndf_clump_shift)
            .unwrap_or(u64::MAX);
        let (start, _) = ctx.tree.smallest_in_size_range(ctx.size..=upper)?;
        ctx.state.ndf_cursor = start + ctx.size;
        Some(start)
    }
}

#[enum_dispatch(AllocStrategyOps)]
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    FirstFit,
    DynamicFit,
    CursorFit,
    NewDynamicFit,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::DynamicFit(DynamicFit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(tree: &'a RangeTree, size: u64, cfg: &'a Config, state: &'a mut StrategyState) -> StrategyCtx<'a> {
        StrategyCtx {
            tree,
            size,
            ms_size: 1 << 20,
            cfg,
            state,
        }
    }

    #[test]
    fn first_fit_finds_and_advances() {
        let mut tree = RangeTree::new();
        tree.add(0, 1 << 20);
        let cfg = Config::default();
        let mut state = StrategyState::default();
        let strat = Strategy::from(FirstFit);
        let off1 = strat.alloc(&mut ctx(&tree, 4096, &cfg, &mut state)).unwrap();
        assert_eq!(off1, 0);
        tree.remove(off1, 4096);
        let off2 = strat.alloc(&mut ctx(&tree, 4096, &cfg, &mut state)).unwrap();
        assert_eq!(off2, 4096);
    }

    #[test]
    fn cursor_fit_exhausts_then_moves_on() {
        let mut tree = RangeTree::new();
        tree.add(0, 100);
        tree.add(1000, 50);
        let cfg = Config::default();
        let mut state = StrategyState::default();
        let strat = Strategy::from(CursorFit);
        let a = strat.alloc(&mut ctx(&tree, 60, &cfg, &mut state)).unwrap();
        assert_eq!(a, 0);
        tree.remove(a, 60);
        // remaining 40 in first extent is too small for another 60-byte request
        let b = strat.alloc(&mut ctx(&tree, 60, &cfg, &mut state));
        assert!(b.is_none());
    }

    #[test]
    fn dynamic_fit_switches_to_best_fit_when_low_on_space() {
        let mut tree = RangeTree::new();
        tree.add(0, 1000);
        let mut cfg = Config::default();
        cfg.df_free_pct = 50;
        cfg.df_alloc_threshold = 0;
        let mut state = StrategyState::default();
        let strat = Strategy::from(DynamicFit);
        assert!(strat.fragmented(&tree, 2000, &cfg));
    }
}
