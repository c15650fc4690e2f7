//! Literal-input scenario tests mirroring the walkthroughs used to pin
//! down this allocator's behavior: single-metaslab round-tripping,
//! alignment, the dynamic-fit strategy switch, condense, and rotor/replica
//! spread across several vdevs.

use std::sync::Arc;

use metaslab_pool::allocator::{AllocationClass, ClassKind};
use metaslab_pool::metaslab::Metaslab;
use metaslab_pool::metaslab_group::MetaslabGroup;
use metaslab_pool::strategy::{DynamicFit, Strategy};
use metaslab_pool::txg::TXG_DEFER_SIZE;
use metaslab_pool::vdev::StaticVdev;
use metaslab_pool::Config;

fn single_metaslab(size: u64, ashift: u32) -> Metaslab {
    Metaslab::init(0, 0, size, ashift, None, Strategy::from(DynamicFit))
}

/// S1: allocate and free a run of fixed-size blocks from one metaslab,
/// drain the defer ring, reload, and confirm every byte came back.
#[test]
fn s1_basic_alloc_free_roundtrip_survives_reload() {
    let cfg = Config::default();
    let mut m = single_metaslab(1 << 20, 9);
    m.activate(false, 1, &cfg).unwrap();

    let mut offsets = Vec::new();
    for _ in 0..100 {
        offsets.push(m.alloc_block(4096, 1, &cfg).expect("space for 100 4KiB blocks"));
    }
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), 100);
    assert_eq!(m.free_space(), (1u64 << 20) - 100 * 4096);

    for off in &offsets {
        m.free_block(*off, 4096, 1, false);
    }

    for t in 1..=(TXG_DEFER_SIZE as u64 + 1) {
        m.sync(t, 1, &cfg).unwrap();
        m.sync_done(t, 1, &cfg);
    }

    m.unload();
    m.load().unwrap();
    assert_eq!(m.free_space(), 1 << 20);
    assert_eq!(m.max_segment(), Some((0, 1 << 20)));
}

/// S2: every returned offset must be aligned to `1 << ashift`, even for a
/// request size that isn't itself a multiple of the full metaslab extent.
#[test]
fn s2_offsets_respect_ashift() {
    let cfg = Config::default();
    let mut m = single_metaslab(1 << 20, 12);
    m.activate(false, 1, &cfg).unwrap();

    for _ in 0..20 {
        let off = m.alloc_block(8192, 1, &cfg).unwrap();
        assert_eq!(off % 4096, 0);
    }
}

/// S3: once free space drops below `df_free_pct`, dynamic-fit abandons its
/// cursor walk and the next allocation lands on the single remaining
/// contiguous tail (the largest, and only, extent left).
#[test]
fn s3_dynamic_fit_switches_to_best_fit_under_pressure() {
    let mut cfg = Config::default();
    cfg.df_alloc_threshold = 0;
    cfg.df_free_pct = 4;

    let ms_size = 1u64 << 20;
    let mut m = single_metaslab(ms_size, 9);
    m.activate(false, 1, &cfg).unwrap();

    let chunk = 10_240u64; // 20 sectors, leaves ~2.3% free after 100 allocs
    for _ in 0..100 {
        m.alloc_block(chunk, 1, &cfg).expect("room for the 100th chunk");
    }
    assert!(m.percent_free() < cfg.df_free_pct as f64);

    let (tail_start, tail_size) = m.max_segment().expect("one extent left");
    let offset = m.alloc_block(tail_size, 1, &cfg).expect("best-fit should find the tail");
    assert_eq!(offset, tail_start);
}

/// S4: a space map inflated by many small alloc/free pairs, once allowed
/// to condense, is rewritten into a dramatically shorter minimal log, and
/// a full unload/reload afterward still reproduces the same free space.
#[test]
fn s4_condense_shrinks_an_inflated_space_map() {
    let mut cfg_grow = Config::default();
    cfg_grow.condense_pct = 1_000_000; // keep condense off during growth

    let ms_size = 1u64 << 20;
    let mut m = single_metaslab(ms_size, 9);
    m.activate(false, 1, &cfg_grow).unwrap();

    for txg in 1..=50u64 {
        let off = m.alloc_block(512, txg, &cfg_grow).unwrap();
        m.free_block(off, 512, txg, false);
        m.sync(txg, 1, &cfg_grow).unwrap();
        m.sync_done(txg, 1, &cfg_grow);
    }

    let len_before = m.space_map_length();
    assert!(len_before > 0, "50 sync rounds must have grown the log");

    let mut cfg_condense = Config::default();
    cfg_condense.condense_pct = 200;
    assert!(
        m.should_condense(&cfg_condense),
        "an inflated log against a single huge free extent should warrant condensing"
    );

    let off = m.alloc_block(512, 51, &cfg_condense).unwrap();
    m.free_block(off, 512, 51, false);
    m.sync(51, 1, &cfg_condense).unwrap();
    let len_after = m.space_map_length();
    assert!(len_after < len_before, "condense should shrink the on-disk log");

    m.sync_done(51, 1, &cfg_condense);
    m.unload();
    m.load().unwrap();
    assert_eq!(m.free_space(), ms_size);
}

fn make_class(n_vdevs: usize, n_ms: usize, ms_size: u64, ashift: u32, seed: u64) -> AllocationClass {
    let groups = (0..n_vdevs)
        .map(|vid| {
            let vdev = Arc::new(StaticVdev::new(vid as u32, n_ms as u64 * ms_size, ashift));
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
        })
        .collect();
    AllocationClass::new(ClassKind::Normal, groups, seed)
}

/// S5: over many single-replica allocations, the rotor's aliquot-driven
/// rotation should spread load roughly evenly across 4 vdevs.
#[test]
fn s5_rotor_spreads_load_across_vdevs() {
    let mut cfg = Config::default();
    cfg.aliquot = 64 * 1024; // rotate after 64KiB per group, for a tighter test

    let class = make_class(4, 4, 1 << 20, 9, 7);
    let mut counts = [0u32; 4];

    for txg in 0..1024u64 {
        let bp = class.alloc(4096, 1, &[], txg, false, &cfg).expect("plenty of room");
        counts[bp.dvas[0].vdev as usize] += 1;
    }

    for c in counts {
        assert!((256i64 - c as i64).unsigned_abs() <= 4, "uneven spread: {:?}", counts);
    }
}

/// S6: a 3-way replicated allocation across 3 vdevs must land one replica
/// per device.
#[test]
fn s6_replicas_land_on_distinct_vdevs() {
    let class = make_class(3, 4, 1 << 16, 9, 11);
    let cfg = Config::default();
    let bp = class.alloc(4096, 3, &[], 1, false, &cfg).unwrap();

    let mut vdevs: Vec<u32> = bp.dvas.iter().map(|d| d.vdev).collect();
    vdevs.sort_unstable();
    vdevs.dedup();
    assert_eq!(vdevs.len(), 3);
    assert_eq!(bp.dvas.len(), 3);
}
