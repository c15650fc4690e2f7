//! Per-device set of metaslabs, ordered by weight, with preload and
//! allocatability policy.

use crate::config::Config;
use crate::metaslab::{ActiveState, Metaslab};
use crate::txg::Txg;
use crate::vdev::VdevHandle;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const PRELOAD_WORKERS: usize = 2;

pub struct MetaslabGroup {
    vdev: Arc<dyn VdevHandle>,
    ms_shift: u32,
    metaslabs: Arc<Vec<Mutex<Metaslab>>>,
    /// `(weight, index)`, ascending; iterated in reverse for descending
    /// weight order, per the design notes' "indices into a vector" rotor
    /// representation applied here to the weight tree too.
    order: Mutex<BTreeSet<(u64, usize)>>,
    /// Mirrors each metaslab's last-known weight so `order` can be updated
    /// by remove-then-reinsert without re-locking every metaslab.
    last_weight: Vec<AtomicU64>,
    allocatable: AtomicBool,
    preload_tx: Option<Sender<usize>>,
    preload_workers: Vec<JoinHandle<()>>,
}

impl MetaslabGroup {
    pub fn new(vdev: Arc<dyn VdevHandle>, ms_shift: u32, metaslabs: Vec<Metaslab>) -> Self {
        let last_weight: Vec<AtomicU64> = metaslabs.iter().map(|m| AtomicU64::new(m.weight())).collect();
        let mut order = BTreeSet::new();
        for (idx, m) in metaslabs.iter().enumerate() {
            order.insert((m.weight(), idx));
        }
        let metaslabs = Arc::new(metaslabs.into_iter().map(Mutex::new).collect::<Vec<_>>());

        let (preload_tx, preload_rx) = bounded::<usize>(64);
        let mut preload_workers = Vec::with_capacity(PRELOAD_WORKERS);
        for _ in 0..PRELOAD_WORKERS {
            let rx = preload_rx.clone();
            let slabs = Arc::clone(&metaslabs);
            preload_workers.push(std::thread::spawn(move || {
                while let Ok(idx) = rx.recv() {
                    let mut ms = slabs[idx].lock();
                    if let Err(e) = ms.load() {
                        log::warn!("preload of metaslab {} failed: {}", idx, e);
                    }
                }
            }));
        }

        MetaslabGroup {
            vdev,
            ms_shift,
            metaslabs,
            order: Mutex::new(order),
            last_weight,
            allocatable: AtomicBool::new(true),
            preload_tx: Some(preload_tx),
            preload_workers,
        }
    }

    pub fn vdev(&self) -> &Arc<dyn VdevHandle> {
        &self.vdev
    }

    pub fn metaslab_count(&self) -> usize {
        self.metaslabs.len()
    }

    fn metaslab_index_for(&self, start: u64) -> usize {
        (start >> self.ms_shift) as usize
    }

    fn resort(&self, idx: usize, new_weight: u64) {
        let old_weight = self.last_weight[idx].swap(new_weight, Ordering::Relaxed);
        if old_weight == new_weight {
            return;
        }
        let mut order = self.order.lock();
        order.remove(&(old_weight, idx));
        order.insert((new_weight, idx));
    }

    /// Sums each metaslab's cached free space; recomputed on demand rather
    /// than tracked atomically, since allocatability is only re-derived
    /// at sync boundaries, not on the hot allocation path.
    pub fn free_capacity_pct(&self) -> u32 {
        let total: u64 = self.vdev.size();
        if total == 0 {
            return 0;
        }
        let free: u64 = self.metaslabs.iter().map(|m| m.lock().free_space()).sum();
        ((free as u128 * 100 / total as u128) as u64).min(100) as u32
    }

    pub fn is_allocatable(&self) -> bool {
        self.allocatable.load(Ordering::Relaxed)
    }

    /// A group is allocatable iff its free capacity exceeds
    /// `mg_noalloc_threshold`, OR the class reports no allocatable groups
    /// left, OR the class is non-normal.
    pub fn recompute_allocatable(&self, cfg: &Config, class_has_zero_allocatable: bool, class_is_normal: bool) {
        let by_capacity = self.free_capacity_pct() > cfg.mg_noalloc_threshold;
        let allocatable = by_capacity || class_has_zero_allocatable || !class_is_normal;
        self.allocatable.store(allocatable, Ordering::Relaxed);
    }

    /// Schedules the top `preload_limit` metaslabs by weight onto the
    /// per-group preload workers.
    pub fn preload_top(&self, cfg: &Config) {
        if !cfg.preload_enabled {
            return;
        }
        let order = self.order.lock();
        if let Some(tx) = &self.preload_tx {
            for &(_, idx) in order.iter().rev().take(cfg.preload_limit) {
                let _ = tx.try_send(idx);
            }
        }
    }

    /// Walks metaslabs in descending weight order looking for one that
    /// can serve `asize` bytes, honoring distance constraints for
    /// secondary-replica placement. Returns the absolute device offset.
    #[allow(clippy::too_many_arguments)]
    pub fn group_alloc(
        &self,
        asize: u64,
        txg: Txg,
        min_distance: u64,
        prior_offsets_on_vdev: &[u64],
        secondary: bool,
        ms_count: u64,
        cfg: &Config,
    ) -> Option<u64> {
        let mut tried: HashSet<usize> = HashSet::new();

        'retry: loop {
            let candidate = {
                let order = self.order.lock();
                let mut found = None;
                for &(weight, idx) in order.iter().rev() {
                    if weight < asize {
                        break;
                    }
                    if tried.contains(&idx) {
                        continue;
                    }
                    found = Some(idx);
                    break;
                }
                found
            };
            let idx = match candidate {
                Some(idx) => idx,
                None => return None,
            };
            tried.insert(idx);

            let mut ms = self.metaslabs[idx].lock();

            if ms.weight() < asize || ms.is_condensing() {
                continue 'retry;
            }

            if secondary {
                let target = if ms.access_txg() == 0 {
                    min_distance + min_distance / 2
                } else {
                    min_distance
                };
                let far_enough = prior_offsets_on_vdev
                    .iter()
                    .all(|&prior| ms.start.abs_diff(prior) >= target);
                if !far_enough {
                    continue 'retry;
                }
            }

            if ms.is_active() {
                if secondary && ms.active_state() == ActiveState::Primary {
                    // another thread upgraded this metaslab out from under
                    // our intended secondary placement; passivate and pick
                    // a different candidate.
                    let max_seg = ms.max_segment_size();
                    ms.passivate(max_seg);
                    let w = ms.weight();
                    drop(ms);
                    self.resort(idx, w);
                    continue 'retry;
                }
            } else if ms.activate(secondary, ms_count, cfg).is_err() {
                continue 'retry;
            }

            if ms.is_condensing() {
                continue 'retry;
            }

            match ms.alloc_block(asize, txg, cfg) {
                Some(offset) => {
                    let w = ms.weight();
                    drop(ms);
                    self.resort(idx, w);
                    return Some(offset);
                }
                None => {
                    let max_seg = ms.max_segment_size();
                    ms.passivate(max_seg);
                    let w = ms.weight();
                    drop(ms);
                    self.resort(idx, w);
                    continue 'retry;
                }
            }
        }
    }

    pub fn free_block(&self, offset: u64, size: u64, txg: Txg, now: bool) {
        let idx = self.metaslab_index_for(offset);
        let mut ms = self.metaslabs[idx].lock();
        ms.free_block(offset, size, txg, now);
        let w = ms.weight();
        drop(ms);
        self.resort(idx, w);
    }

    pub fn claim(&self, offset: u64, size: u64, txg: Txg) -> crate::error::Result<()> {
        let idx = self.metaslab_index_for(offset);
        let mut ms = self.metaslabs[idx].lock();
        if !ms.is_loaded() {
            ms.load()?;
        }
        ms.claim(offset, size, txg)
    }

    pub fn sync(&self, txg: Txg, sync_pass: u32, cfg: &Config) -> crate::error::Result<()> {
        for ms in self.metaslabs.iter() {
            ms.lock().sync(txg, sync_pass, cfg)?;
        }
        Ok(())
    }

    pub fn sync_done(&self, txg: Txg, cfg: &Config) {
        let ms_count = self.metaslabs.len() as u64;
        for (idx, ms) in self.metaslabs.iter().enumerate() {
            let mut ms = ms.lock();
            ms.sync_done(txg, ms_count, cfg);
            let w = ms.weight();
            drop(ms);
            self.resort(idx, w);
        }
        self.preload_top(cfg);
    }
}

impl Drop for MetaslabGroup {
    fn drop(&mut self) {
        // Dropping the sender closes the channel so preload workers
        // observe `recv() == Err` and exit; join them so a group never
        // outlives its own workers.
        self.preload_tx.take();
        for worker in self.preload_workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{DynamicFit, Strategy};
    use crate::vdev::StaticVdev;

    fn make_group(n_ms: usize, ms_size: u64, ashift: u32) -> MetaslabGroup {
        let vdev = Arc::new(StaticVdev::new(0, n_ms as u64 * ms_size, ashift));
        let metaslabs = (0..n_ms)
            .map(|id| {
                Metaslab::init(
                    id as u64,
                    id as u64 * ms_size,
                    ms_size,
                    ashift,
                    None,
                    Strategy::from(DynamicFit),
                )
            })
            .collect();
        MetaslabGroup::new(vdev, ms_size.trailing_zeros(), metaslabs)
    }

    #[test]
    fn group_alloc_finds_space_in_some_metaslab() {
        let group = make_group(4, 1 << 16, 9);
        let cfg = Config::default();
        let offset = group
            .group_alloc(4096, 1, 0, &[], false, 4, &cfg)
            .expect("group should have room");
        assert_eq!(offset % 512, 0);
    }

    #[test]
    fn group_alloc_exhausts_and_returns_none() {
        let group = make_group(1, 8192, 9);
        let cfg = Config::default();
        let mut count = 0;
        while group.group_alloc(4096, 1, 0, &[], false, 1, &cfg).is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn free_block_routes_to_owning_metaslab() {
        let group = make_group(2, 1 << 16, 9);
        let cfg = Config::default();
        let offset = group.group_alloc(4096, 1, 0, &[], false, 2, &cfg).unwrap();
        group.free_block(offset, 4096, 1, true);
    }
}
