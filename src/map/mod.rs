//! Cluster maps, the epoch cache and the persisted superblock.

pub mod cache;
pub mod osdmap;
pub mod superblock;

pub use cache::MapCache;
pub use osdmap::{Incremental, OsdMap, OsdState, PoolInfo};
pub use superblock::{CompatSet, Superblock, SUPERBLOCK_OID};

use crate::types::Epoch;

/// Object name of the full map for `epoch` in the meta collection.
pub fn full_map_oid(epoch: Epoch) -> String {
    format!("osdmap.{}", epoch)
}

/// Object name of the incremental producing `epoch` in the meta collection.
pub fn inc_map_oid(epoch: Epoch) -> String {
    format!("inc_osdmap.{}", epoch)
}
