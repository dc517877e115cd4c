//! Cluster map: membership, pools and PG placement at one epoch.

use crate::error::MapError;
use crate::types::{stable_mod, Epoch, OsdId, PgId, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Per-OSD membership state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsdState {
    pub up: bool,
    /// Epoch the OSD last came up.
    pub up_from: Epoch,
    /// Latest epoch the OSD confirmed it was alive through.
    pub up_thru: Epoch,
    /// Epoch the OSD last went down.
    pub down_at: Epoch,
}

/// A replicated pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub id: u32,
    pub pg_num: u32,
    /// Replica count.
    pub size: usize,
    /// Epoch the pool was created in.
    pub created: Epoch,
    /// Snapshots deleted by the user and awaiting trimming.
    pub removed_snaps: BTreeSet<u64>,
}

impl PoolInfo {
    pub fn new(id: u32, pg_num: u32, size: usize) -> Self {
        Self {
            id,
            pg_num,
            size,
            created: 0,
            removed_snaps: BTreeSet::new(),
        }
    }
}

/// Immutable snapshot of the cluster at one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsdMap {
    pub epoch: Epoch,
    pub fsid: uuid::Uuid,
    pub osds: BTreeMap<OsdId, OsdState>,
    pub pools: BTreeMap<u32, PoolInfo>,
    /// Acting set overrides requested by primaries.
    pub pg_temp: BTreeMap<PgId, Vec<OsdId>>,
}

impl OsdMap {
    /// An empty map at epoch 0.
    pub fn new(fsid: uuid::Uuid) -> Self {
        Self {
            epoch: 0,
            fsid,
            osds: BTreeMap::new(),
            pools: BTreeMap::new(),
            pg_temp: BTreeMap::new(),
        }
    }

    pub fn exists(&self, osd: OsdId) -> bool {
        self.osds.contains_key(&osd)
    }

    pub fn is_up(&self, osd: OsdId) -> bool {
        self.osds.get(&osd).is_some_and(|s| s.up)
    }

    pub fn up_thru(&self, osd: OsdId) -> Epoch {
        self.osds.get(&osd).map(|s| s.up_thru).unwrap_or(0)
    }

    pub fn up_osds(&self) -> impl Iterator<Item = OsdId> + '_ {
        self.osds.iter().filter(|(_, s)| s.up).map(|(id, _)| *id)
    }

    pub fn pool(&self, pool: u32) -> Option<&PoolInfo> {
        self.pools.get(&pool)
    }

    pub fn pg_exists(&self, pgid: PgId) -> bool {
        self.pools
            .get(&pgid.pool)
            .is_some_and(|p| pgid.seed < p.pg_num)
    }

    /// The PG an object name maps to in `pool`.
    pub fn object_to_pg(&self, pool: u32, oid: &str) -> Option<PgId> {
        let info = self.pools.get(&pool)?;
        let hash = hash_name(oid) as u32;
        Some(PgId::new(pool, stable_mod(hash, info.pg_num)))
    }

    /// Up and acting sets for a PG; the first acting member is the primary.
    ///
    /// Placement ranks every OSD in the map by a per-PG hash score and keeps
    /// the top `size`, so an OSD going down only removes itself from the set.
    pub fn pg_to_up_acting(&self, pgid: PgId) -> (Vec<OsdId>, Vec<OsdId>) {
        let Some(pool) = self.pools.get(&pgid.pool) else {
            return (Vec::new(), Vec::new());
        };
        if pgid.seed >= pool.pg_num {
            return (Vec::new(), Vec::new());
        }

        let mut ranked: Vec<(u64, OsdId)> = self
            .osds
            .keys()
            .map(|&osd| (placement_score(pgid, osd), osd))
            .collect();
        ranked.sort_by(|a, b| b.cmp(a));

        let up: Vec<OsdId> = ranked
            .into_iter()
            .take(pool.size)
            .map(|(_, osd)| osd)
            .filter(|&osd| self.is_up(osd))
            .collect();

        let acting = match self.pg_temp.get(&pgid) {
            Some(temp) if !temp.is_empty() => {
                temp.iter().copied().filter(|&o| self.is_up(o)).collect()
            }
            _ => up.clone(),
        };
        (up, acting)
    }

    pub fn primary_of(&self, pgid: PgId) -> Option<OsdId> {
        self.pg_to_up_acting(pgid).1.first().copied()
    }

    pub fn role_of(&self, pgid: PgId, osd: OsdId) -> Role {
        let (_, acting) = self.pg_to_up_acting(pgid);
        match acting.iter().position(|&o| o == osd) {
            Some(0) => Role::Primary,
            Some(_) => Role::Replica,
            None => Role::Stray,
        }
    }

    /// Apply the diff to the next epoch.
    pub fn apply_incremental(&self, inc: &Incremental) -> Result<OsdMap, MapError> {
        if inc.epoch != self.epoch + 1 {
            return Err(MapError::Discontiguous {
                base: self.epoch,
                got: inc.epoch,
            });
        }

        let mut next = self.clone();
        next.epoch = inc.epoch;

        for &osd in &inc.new_up {
            let state = next.osds.entry(osd).or_default();
            state.up = true;
            state.up_from = inc.epoch;
        }
        for &osd in &inc.new_down {
            if let Some(state) = next.osds.get_mut(&osd) {
                state.up = false;
                state.down_at = inc.epoch;
            }
        }
        for (&osd, &epoch) in &inc.new_up_thru {
            if let Some(state) = next.osds.get_mut(&osd) {
                state.up_thru = state.up_thru.max(epoch);
            }
        }
        for pool in &inc.new_pools {
            let mut pool = pool.clone();
            if let Some(existing) = next.pools.get(&pool.id) {
                pool.created = existing.created;
                pool.removed_snaps.extend(existing.removed_snaps.iter().copied());
            } else {
                pool.created = inc.epoch;
            }
            next.pools.insert(pool.id, pool);
        }
        for id in &inc.removed_pools {
            next.pools.remove(id);
            next.pg_temp.retain(|pgid, _| pgid.pool != *id);
        }
        for (pgid, temp) in &inc.new_pg_temp {
            if temp.is_empty() {
                next.pg_temp.remove(pgid);
            } else {
                next.pg_temp.insert(*pgid, temp.clone());
            }
        }
        for (pool, snaps) in &inc.new_removed_snaps {
            if let Some(info) = next.pools.get_mut(pool) {
                info.removed_snaps.extend(snaps.iter().copied());
            }
        }

        Ok(next)
    }
}

/// Diff from `epoch - 1` to `epoch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incremental {
    pub epoch: Epoch,
    pub new_up: Vec<OsdId>,
    pub new_down: Vec<OsdId>,
    pub new_up_thru: BTreeMap<OsdId, Epoch>,
    /// Created or modified pools.
    pub new_pools: Vec<PoolInfo>,
    pub removed_pools: Vec<u32>,
    /// An empty set clears the override.
    pub new_pg_temp: BTreeMap<PgId, Vec<OsdId>>,
    pub new_removed_snaps: BTreeMap<u32, Vec<u64>>,
}

impl Incremental {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    name.hash(&mut hasher);
    hasher.finish()
}

fn placement_score(pgid: PgId, osd: OsdId) -> u64 {
    let mut hasher = XxHash64::with_seed(u64::from(osd));
    pgid.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_map(osds: u32) -> OsdMap {
        let mut map = OsdMap::new(uuid::Uuid::nil());
        let mut inc = Incremental::new(1);
        inc.new_up = (0..osds).collect();
        inc.new_pools.push(PoolInfo::new(1, 8, 3));
        map = map.apply_incremental(&inc).unwrap();
        map
    }

    #[test]
    fn test_placement_is_deterministic() {
        let map = base_map(5);
        for seed in 0..8 {
            let pgid = PgId::new(1, seed);
            let (up, acting) = map.pg_to_up_acting(pgid);
            assert_eq!(up.len(), 3);
            assert_eq!(up, acting);
            assert_eq!(map.pg_to_up_acting(pgid), (up.clone(), acting.clone()));
            assert_eq!(map.role_of(pgid, up[0]), Role::Primary);
            assert_eq!(map.role_of(pgid, up[1]), Role::Replica);
        }
    }

    #[test]
    fn test_down_osd_leaves_acting_set() {
        let map = base_map(5);
        let pgid = PgId::new(1, 3);
        let (up, _) = map.pg_to_up_acting(pgid);

        let mut inc = Incremental::new(2);
        inc.new_down.push(up[0]);
        let next = map.apply_incremental(&inc).unwrap();

        let (new_up, _) = next.pg_to_up_acting(pgid);
        assert_eq!(new_up, up[1..].to_vec());
        assert_eq!(next.osds[&up[0]].down_at, 2);
    }

    #[test]
    fn test_pg_temp_overrides_acting() {
        let map = base_map(4);
        let pgid = PgId::new(1, 0);
        let (up, _) = map.pg_to_up_acting(pgid);
        let spare = (0..4).find(|o| !up.contains(o)).unwrap();

        let mut inc = Incremental::new(2);
        inc.new_pg_temp.insert(pgid, vec![spare, up[0]]);
        let next = map.apply_incremental(&inc).unwrap();
        assert_eq!(next.primary_of(pgid), Some(spare));
        assert_eq!(next.pg_to_up_acting(pgid).0, up);

        let mut inc = Incremental::new(3);
        inc.new_pg_temp.insert(pgid, Vec::new());
        let next = next.apply_incremental(&inc).unwrap();
        assert_eq!(next.primary_of(pgid), Some(up[0]));
    }

    #[test]
    fn test_discontiguous_incremental() {
        let map = base_map(1);
        let err = map.apply_incremental(&Incremental::new(5)).unwrap_err();
        assert_eq!(err, MapError::Discontiguous { base: 1, got: 5 });
    }

    #[test]
    fn test_pool_update_keeps_creation_epoch() {
        let map = base_map(3);
        let mut inc = Incremental::new(2);
        inc.new_pools.push(PoolInfo::new(1, 16, 3));
        inc.new_removed_snaps.insert(1, vec![4]);
        let next = map.apply_incremental(&inc).unwrap();

        let pool = next.pool(1).unwrap();
        assert_eq!(pool.pg_num, 16);
        assert_eq!(pool.created, 1);
        assert!(pool.removed_snaps.contains(&4));
        assert!(next.pg_exists(PgId::new(1, 15)));
        assert!(next.object_to_pg(1, "foo").unwrap().seed < 16);
    }
}
