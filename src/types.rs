//! Core types used throughout the node daemon.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a storage node (OSD) in the cluster.
pub type OsdId = u32;

/// Cluster map epoch. Strictly increasing in every node's view.
pub type Epoch = u32;

/// Transaction / request identifier.
pub type Tid = u64;

/// Identifier of a transport connection.
pub type ConnectionId = u64;

/// Identifier of a placement group: a shard of one pool's object space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PgId {
    /// Pool the placement group belongs to.
    pub pool: u32,
    /// Placement seed within the pool, `0..pg_num`.
    pub seed: u32,
}

impl PgId {
    /// Create a new PG id.
    pub const fn new(pool: u32, seed: u32) -> Self {
        Self { pool, seed }
    }

    /// The PG this one was split from when the pool grew from `old_pg_num`.
    pub fn parent(&self, old_pg_num: u32) -> PgId {
        PgId::new(self.pool, stable_mod(self.seed, old_pg_num))
    }

    /// Children created for this PG when the pool grows from `old_pg_num` to `new_pg_num`.
    pub fn split_children(&self, old_pg_num: u32, new_pg_num: u32) -> Vec<PgId> {
        if new_pg_num <= old_pg_num || old_pg_num == 0 {
            return Vec::new();
        }
        (old_pg_num..new_pg_num)
            .filter(|c| stable_mod(*c, old_pg_num) == self.seed)
            .map(|c| PgId::new(self.pool, c))
            .collect()
    }
}

/// Fold `x` into `0..b` so that growing `b` only moves values into new buckets.
///
/// A value either keeps its bucket or moves to a bucket `>= old b` whose own
/// `stable_mod` under the old count is the value's old bucket.
pub fn stable_mod(x: u32, b: u32) -> u32 {
    if b <= 1 {
        return 0;
    }
    let mask = b.next_power_of_two() - 1;
    if x & mask < b {
        x & mask
    } else {
        x & (mask >> 1)
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

impl FromStr for PgId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (pool, seed) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid pgid '{}'", s))?;
        let pool = pool
            .parse::<u32>()
            .map_err(|e| format!("invalid pool in '{}': {}", s, e))?;
        let seed = u32::from_str_radix(seed, 16)
            .map_err(|e| format!("invalid seed in '{}': {}", s, e))?;
        Ok(PgId::new(pool, seed))
    }
}

/// Kind of entity on the other side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Client,
    Osd,
    Mon,
}

/// Name of a cluster entity (`client.4123`, `osd.3`, `mon.0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName {
    pub kind: EntityKind,
    pub num: u64,
}

impl EntityName {
    pub const fn client(num: u64) -> Self {
        Self {
            kind: EntityKind::Client,
            num,
        }
    }

    pub const fn osd(id: OsdId) -> Self {
        Self {
            kind: EntityKind::Osd,
            num: id as u64,
        }
    }

    pub const fn mon(num: u64) -> Self {
        Self {
            kind: EntityKind::Mon,
            num,
        }
    }

    /// The OSD id, if this entity is an OSD.
    pub fn as_osd(&self) -> Option<OsdId> {
        match self.kind {
            EntityKind::Osd => OsdId::try_from(self.num).ok(),
            _ => None,
        }
    }

    pub fn is_osd(&self) -> bool {
        self.kind == EntityKind::Osd
    }

    pub fn is_mon(&self) -> bool {
        self.kind == EntityKind::Mon
    }

    pub fn is_client(&self) -> bool {
        self.kind == EntityKind::Client
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EntityKind::Client => "client",
            EntityKind::Osd => "osd",
            EntityKind::Mon => "mon",
        };
        write!(f, "{}.{}", kind, self.num)
    }
}

/// Role of this node for a placement group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Orders and coordinates operations on the PG.
    Primary,
    /// Holds a replica and follows the primary.
    Replica,
    /// Not in the acting set; holds stale data at most.
    Stray,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
            Role::Stray => write!(f, "stray"),
        }
    }
}

/// Object version: the epoch and per-PG sequence that produced it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Eversion {
    pub epoch: Epoch,
    pub version: u64,
}

impl Eversion {
    pub const fn new(epoch: Epoch, version: u64) -> Self {
        Self { epoch, version }
    }
}

impl fmt::Display for Eversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pgid_display_parse() {
        let pgid = PgId::new(3, 0x1f);
        assert_eq!(pgid.to_string(), "3.1f");
        assert_eq!("3.1f".parse::<PgId>().unwrap(), pgid);
        assert!("nonsense".parse::<PgId>().is_err());
    }

    #[test]
    fn test_split_children() {
        let parent = PgId::new(1, 1);
        let children = parent.split_children(4, 16);
        assert_eq!(
            children,
            vec![PgId::new(1, 5), PgId::new(1, 9), PgId::new(1, 13)]
        );
        for child in &children {
            assert_eq!(child.parent(4), parent);
        }
        assert!(parent.split_children(4, 4).is_empty());
    }

    #[test]
    fn test_stable_mod_split_consistency() {
        // Any value that moves when the pool grows lands in a child of its old bucket.
        for (old, new) in [(3u32, 5u32), (4, 6), (4, 16), (5, 12)] {
            for x in 0..1000u32 {
                let before = stable_mod(x, old);
                let after = stable_mod(x, new);
                if after != before {
                    assert!(after >= old);
                    assert_eq!(PgId::new(0, after).parent(old).seed, before);
                }
            }
        }
    }

    #[test]
    fn test_entity_name() {
        let osd = EntityName::osd(7);
        assert_eq!(osd.as_osd(), Some(7));
        assert_eq!(osd.to_string(), "osd.7");
        assert_eq!(EntityName::client(9).as_osd(), None);
    }

    #[test]
    fn test_eversion_ordering() {
        assert!(Eversion::new(3, 10) < Eversion::new(4, 1));
        assert!(Eversion::new(4, 1) < Eversion::new(4, 2));
    }
}
