//! Process-wide tunables, read at steady state.
//!
//! Constructed once at pool open and passed around by value/reference --
//! never a mutable global -- per the allocator's design notes.

#[cfg(feature = "figment_config")]
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default maximum block size a single DVA may address without being split
/// into a gang block; mirrors `1 + SPA_MAXBLOCKSIZE` of the source
/// allocator at a 16 MiB maximum record size.
pub const DEFAULT_GANG_BANG: u64 = 16 * 1024 * 1024 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bytes the rotor tries to allocate from one group per visit before
    /// moving on.
    pub aliquot: u64,
    /// Size at and above which the gang-block escape hatch may fire.
    pub gang_bang: u64,
    /// Condense threshold: the on-disk space map is condensed when its
    /// length exceeds `condense_pct / 100` of the size a minimal
    /// (alloc + free) rewrite would take.
    pub condense_pct: u32,
    /// Per-group free-capacity cutoff, as a percentage, below which a
    /// group is no longer allocatable.
    pub mg_noalloc_threshold: u32,
    /// Skip the lazy "initialize as one free extent" load path and always
    /// verify against the space map; a verification aid.
    pub debug_load: bool,
    /// Never unload a loaded metaslab; a verification aid.
    pub debug_unload: bool,
    /// Dynamic-fit switches to best-fit once the metaslab's largest free
    /// segment drops below this size.
    pub df_alloc_threshold: u64,
    /// Dynamic-fit switches to best-fit once percent-free drops below
    /// this percentage.
    pub df_free_pct: u32,
    /// Smallest allocation the pool will ever try to satisfy.
    pub min_alloc_size: u64,
    /// Txgs a metaslab must be idle for before it is unloaded.
    pub unload_delay: u64,
    /// Number of top-weighted metaslabs preloaded per group per sync pass.
    pub preload_limit: usize,
    /// Whether preloading is enabled at all.
    pub preload_enabled: bool,
    /// Clump shift used by new-dynamic-fit's size-tree fallback window.
    pub ndf_clump_shift: u32,
    /// Whether to add the space-map-histogram bonus to metaslab weight.
    /// Left off by default -- the tuning of this bonus is an open question
    /// in the source allocator that this crate does not attempt to
    /// resolve.
    pub weight_factor_enable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            aliquot: 512 * 1024,
            gang_bang: DEFAULT_GANG_BANG,
            condense_pct: 200,
            mg_noalloc_threshold: 0,
            debug_load: false,
            debug_unload: false,
            df_alloc_threshold: 131_072,
            df_free_pct: 4,
            min_alloc_size: 4096,
            unload_delay: 8,
            preload_limit: 10,
            preload_enabled: true,
            ndf_clump_shift: 4,
            weight_factor_enable: false,
        }
    }
}

impl Config {
    /// Loads a `Config` starting from [`Config::default`] and overriding
    /// with `METASLAB_*` environment variables, mirroring the figment-based
    /// configuration layering used elsewhere in the storage stack.
    #[cfg(feature = "figment_config")]
    pub fn from_env() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("METASLAB_"))
            .extract()
    }
}
