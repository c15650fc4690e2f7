//! Top-level rotor: spreads an allocation's replicas across a class's
//! device groups, retrying with relaxed constraints as the rotor makes a
//! full unsuccessful pass.

use crate::config::Config;
use crate::dva::{BlockPointer, Dva, MAX_DVAS};
use crate::error::{ErrorKind, Result};
use crate::metaslab_group::MetaslabGroup;
use crate::txg::Txg;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Which pool of devices a request draws from. The allocatability rule
/// relaxes for any class other than `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Normal,
    Log,
    Dedup,
}

/// One allocation class: a circular list of groups, a lock-free rotor
/// position, and the counters `alloc`/`deferred`/`space`/`dspace`.
pub struct AllocationClass {
    kind: ClassKind,
    groups: Vec<MetaslabGroup>,
    rotor: AtomicUsize,
    aliquot_used: AtomicU64,
    alloc_groups: AtomicUsize,
    alloc_bytes: AtomicU64,
    deferred_bytes: AtomicU64,
    space: AtomicU64,
    dspace: AtomicU64,
    /// Seeded once at construction so the gang-block escape hatch is
    /// reproducible under a fixed seed in tests.
    gang_rng: Mutex<StdRng>,
}

impl AllocationClass {
    pub fn new(kind: ClassKind, groups: Vec<MetaslabGroup>, seed: u64) -> Self {
        let alloc_groups = groups.iter().filter(|g| g.is_allocatable()).count();
        AllocationClass {
            kind,
            groups,
            rotor: AtomicUsize::new(0),
            aliquot_used: AtomicU64::new(0),
            alloc_groups: AtomicUsize::new(alloc_groups),
            alloc_bytes: AtomicU64::new(0),
            deferred_bytes: AtomicU64::new(0),
            space: AtomicU64::new(0),
            dspace: AtomicU64::new(0),
            gang_rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn rotor_index(&self) -> usize {
        self.rotor.load(Ordering::Relaxed) % self.groups.len().max(1)
    }

    fn rotate_rotor(&self) {
        let len = self.groups.len().max(1);
        self.rotor.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |r| Some((r + 1) % len)).ok();
    }

    fn group_of_vdev(&self, vdev_id: u32) -> Option<usize> {
        self.groups.iter().position(|g| g.vdev().id() == vdev_id)
    }

    pub fn recompute_allocatable_groups(&self, cfg: &Config) {
        let class_is_normal = self.kind == ClassKind::Normal;
        // First pass uses the previous alloc_groups count (pool-wide
        // balance: when it drops to zero, every group is allocatable
        // again regardless of its own capacity).
        let zero_before = self.alloc_groups.load(Ordering::Relaxed) == 0;
        for g in &self.groups {
            g.recompute_allocatable(cfg, zero_before, class_is_normal);
        }
        let now = self.groups.iter().filter(|g| g.is_allocatable()).count();
        self.alloc_groups.store(now, Ordering::Relaxed);
    }

    fn gang_escape(&self, size: u64, cfg: &Config) -> bool {
        if size < cfg.gang_bang {
            return false;
        }
        let mut rng = self.gang_rng.lock().unwrap();
        rng.gen_bool(0.5)
    }

    /// Allocates `n_replicas` DVAs of `psize` bytes (`asize` after any
    /// device-specific inflation -- this crate treats them as equal,
    /// since RAID geometry is out of scope), walking the rotor per
    /// replica with distance bias and retry-with-relaxed-constraints.
    pub fn alloc(
        &self,
        psize: u64,
        n_replicas: usize,
        hint_dvas: &[Dva],
        txg: Txg,
        allow_degraded: bool,
        cfg: &Config,
    ) -> Result<BlockPointer> {
        assert!(n_replicas <= MAX_DVAS, "alloc: too many replicas requested");
        if psize >= cfg.gang_bang && self.gang_escape(psize, cfg) {
            bail!(ErrorKind::NoSpace);
        }

        let mut placed: Vec<Dva> = Vec::with_capacity(n_replicas);

        for d in 0..n_replicas {
            match self.alloc_one_replica(psize, d, &placed, hint_dvas, txg, allow_degraded, cfg) {
                Some(dva) => placed.push(dva),
                None => {
                    for dva in &placed {
                        self.free_dva(dva, txg, true);
                    }
                    bail!(ErrorKind::NoSpace);
                }
            }
        }

        self.alloc_bytes.fetch_add(psize * n_replicas as u64, Ordering::Relaxed);
        Ok(BlockPointer::new(placed))
    }

    fn starting_group(&self, d: usize, placed: &[Dva], hint_dvas: &[Dva]) -> usize {
        if let Some(hint) = hint_dvas.get(d) {
            if let Some(idx) = self.group_of_vdev(hint.vdev) {
                return idx;
            }
        }
        if d > 0 {
            if let Some(prior) = placed.last() {
                if let Some(idx) = self.group_of_vdev(prior.vdev) {
                    return (idx + 1) % self.groups.len();
                }
            }
        }
        self.rotor_index()
    }

    #[allow(clippy::too_many_arguments)]
    fn alloc_one_replica(
        &self,
        psize: u64,
        d: usize,
        placed: &[Dva],
        hint_dvas: &[Dva],
        txg: Txg,
        allow_degraded: bool,
        cfg: &Config,
    ) -> Option<Dva> {
        let n = self.groups.len();
        if n == 0 {
            return None;
        }
        let start = self.starting_group(d, placed, hint_dvas);
        let is_gang_sized = psize <= cfg.gang_bang;

        let mut dshift: u32 = 3;
        let mut degraded_ok = allow_degraded;

        loop {
            let mut any_distance_limited = false;

            for step in 0..n {
                let idx = (start + step) % n;
                let group = &self.groups[idx];

                if d == 0 && !degraded_ok && !group.vdev().is_healthy() {
                    continue;
                }
                if !group.is_allocatable() && !is_gang_sized {
                    continue;
                }

                let distance = group.vdev().size() >> dshift;
                if distance > 0 {
                    any_distance_limited = true;
                }

                let secondary = placed.iter().any(|p| p.vdev == group.vdev().id());
                let prior_on_this_vdev: Vec<u64> = placed
                    .iter()
                    .filter(|p| p.vdev == group.vdev().id())
                    .map(|p| p.offset.as_u64())
                    .collect();

                let ms_count = group.metaslab_count() as u64;
                if let Some(offset) = group.group_alloc(psize, txg, distance, &prior_on_this_vdev, secondary, ms_count, cfg) {
                    self.maybe_rotate(idx, psize, cfg);
                    return Some(Dva::new(group.vdev().id(), offset, psize as u32, false));
                }
            }

            if any_distance_limited && dshift < 64 {
                dshift = (dshift * 2).min(64);
                continue;
            }
            if !degraded_ok {
                degraded_ok = true;
                continue;
            }
            return None;
        }
    }

    fn maybe_rotate(&self, idx: usize, psize: u64, cfg: &Config) {
        let used = self.aliquot_used.fetch_add(psize, Ordering::Relaxed) + psize;
        if used >= cfg.aliquot {
            self.aliquot_used.store(0, Ordering::Relaxed);
            self.rotor.store((idx + 1) % self.groups.len().max(1), Ordering::Relaxed);
        }
    }

    fn free_dva(&self, dva: &Dva, txg: Txg, now: bool) {
        if let Some(idx) = self.group_of_vdev(dva.vdev) {
            self.groups[idx].free_block(dva.offset.as_u64(), dva.asize.as_u32() as u64, txg, now);
            self.deferred_bytes.fetch_add(dva.asize.as_u32() as u64, Ordering::Relaxed);
        }
    }

    /// Frees every DVA in `bp`.
    pub fn free(&self, bp: &BlockPointer, txg: Txg, now: bool) {
        for dva in &bp.dvas {
            self.free_dva(dva, txg, now);
        }
    }

    /// Marks every DVA in `bp` allocated during crash recovery.
    pub fn claim(&self, bp: &BlockPointer, txg: Txg) -> Result<()> {
        for dva in &bp.dvas {
            let idx = self
                .group_of_vdev(dva.vdev)
                .ok_or_else(|| crate::error::Error::from(ErrorKind::Invalid(format!("claim: unknown vdev {}", dva.vdev))))?;
            self.groups[idx].claim(dva.offset.as_u64(), dva.asize.as_u32() as u64, txg)?;
        }
        Ok(())
    }

    pub fn sync(&self, txg: Txg, sync_pass: u32, cfg: &Config) -> Result<()> {
        for g in &self.groups {
            g.sync(txg, sync_pass, cfg)?;
        }
        Ok(())
    }

    pub fn sync_done(&self, txg: Txg, cfg: &Config) {
        for g in &self.groups {
            g.sync_done(txg, cfg);
        }
        self.recompute_allocatable_groups(cfg);
    }
}
