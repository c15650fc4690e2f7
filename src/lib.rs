//! Per-device metaslab allocator: the in-memory free-space representation
//! (range tree), pluggable in-metaslab offset-search strategies, the
//! metaslab and metaslab-group lifecycle, and the allocation-class rotor
//! that spreads replicas across devices.
//!
//! The transactional block layer, the on-disk space-map byte format, pool
//! configuration, vdev I/O, and dataset/snapshot machinery are external
//! collaborators; this crate only fixes the contracts it needs against
//! them ([`vdev::VdevHandle`], [`space_map::SpaceMap`]).

#[macro_use]
extern crate error_chain;

pub mod allocator;
pub mod config;
pub mod dva;
pub mod error;
pub mod histogram;
pub mod metaslab;
pub mod metaslab_group;
pub mod range_tree;
pub mod space_map;
pub mod strategy;
pub mod txg;
pub mod vdev;

pub use allocator::{AllocationClass, ClassKind};
pub use config::Config;
pub use dva::{BlockPointer, Dva};
pub use error::{Error, ErrorKind, Result};
pub use metaslab::Metaslab;
pub use metaslab_group::MetaslabGroup;
pub use range_tree::RangeTree;
pub use strategy::Strategy;
pub use txg::Txg;

/// Initializes `env_logger` from `RUST_LOG`, ignoring a "already
/// initialized" error so tests that call this more than once don't panic.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::try_init();
}
