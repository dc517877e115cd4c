//! Registry of the PGs hosted on this node.
//!
//! The id map is guarded by an `RwLock` that is held only to insert, erase
//! or clone out a handle; no PG lock is ever taken while it is held.
//! Creation, split and recreation serialize on a separate creation mutex,
//! which is always taken before any PG lock.

use super::info::{PgHistory, PgInfo, PgLog};
use super::{LockedPg, Pg, PgMeta, PgRef, PgState, PeeringState};
use crate::map::OsdMap;
use crate::osd::op_request::OpRequest;
use crate::store::{
    is_pg_meta, parse_pg_collection, pg_collection, read_decoded, ObjectStore, PGINFO_OID,
    PGLOG_OID,
};
use crate::types::{Epoch, OsdId, PgId, Role};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Initial placement and history for a PG about to be created.
#[derive(Debug, Clone)]
pub struct PgSpec {
    pub pgid: PgId,
    pub epoch: Epoch,
    pub role: Role,
    pub up: Vec<OsdId>,
    pub acting: Vec<OsdId>,
    pub history: PgHistory,
}

impl PgSpec {
    /// Placement of `pgid` in `map` as seen from `whoami`.
    pub fn from_map(pgid: PgId, map: &OsdMap, whoami: OsdId, history: PgHistory) -> Self {
        let (up, acting) = map.pg_to_up_acting(pgid);
        Self {
            pgid,
            epoch: map.epoch,
            role: map.role_of(pgid, whoami),
            up,
            acting,
            history,
        }
    }
}

/// Partition registry.
#[derive(Debug, Default)]
pub struct PgRegistry {
    pgs: RwLock<HashMap<PgId, PgRef>>,

    /// Serializes creation, split and recreation.
    create_lock: Mutex<()>,

    /// Ops for PGs this node should host but has not created yet.
    waiting_for_pg: Mutex<HashMap<PgId, Vec<OpRequest>>>,

    /// Creation requests from the monitor not yet instantiated.
    creating: Mutex<BTreeMap<PgId, Epoch>>,
}

impl PgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, pgid: PgId) -> Option<PgRef> {
        self.pgs.read().get(&pgid).cloned()
    }

    /// Look up and lock a PG. Never returns a removed PG.
    pub fn lookup_locked(&self, pgid: PgId) -> Option<LockedPg> {
        let pg = self.lookup(pgid)?;
        let locked = pg.lock_owned();
        if locked.peering == PeeringState::Removed {
            return None;
        }
        Some(locked)
    }

    /// Return the live PG for `spec.pgid`, creating and persisting it if needed.
    ///
    /// The flag is true when the PG was created by this call.
    pub fn get_or_create(
        &self,
        store: &dyn ObjectStore,
        spec: PgSpec,
    ) -> crate::Result<(LockedPg, bool)> {
        let _create = self.create_lock.lock();
        if let Some(pg) = self.lookup(spec.pgid) {
            let locked = pg.lock_owned();
            if locked.peering != PeeringState::Removed {
                return Ok((locked, false));
            }
        }
        let locked = self.create_locked(store, spec)?;
        Ok((locked, true))
    }

    /// Create a PG that must not exist yet.
    pub fn create_pg(&self, store: &dyn ObjectStore, spec: PgSpec) -> crate::Result<LockedPg> {
        let _create = self.create_lock.lock();
        if let Some(pg) = self.lookup(spec.pgid) {
            if pg.lock().peering != PeeringState::Removed {
                return Err(crate::Error::PgAlreadyExists(spec.pgid));
            }
        }
        self.create_locked(store, spec)
    }

    fn create_locked(&self, store: &dyn ObjectStore, spec: PgSpec) -> crate::Result<LockedPg> {
        let pgid = spec.pgid;
        let cid = pg_collection(pgid);

        let mut info = PgInfo::new(pgid);
        info.history = spec.history;
        let mut state = PgState::new(info, spec.epoch);
        state.role = spec.role;
        state.up = spec.up;
        state.acting = spec.acting;

        let mut tx = store.begin_transaction();
        if store.collection_exists(&cid) {
            // Leftover from an interrupted removal.
            tx.remove_collection(cid.clone());
        }
        tx.create_collection(cid);
        state.write_meta(&mut tx)?;
        store.commit(tx)?;

        if let Some(existing) = self.lookup(pgid) {
            assert!(
                existing.lock().peering == PeeringState::Removed,
                "pg {} registered twice",
                pgid
            );
        }
        let pg = Pg::new(state);
        let locked = pg.lock_owned();
        self.insert(pg);
        tracing::info!(pgid = %pgid, epoch = spec.epoch, role = %spec.role, "created pg");
        Ok(locked)
    }

    fn insert(&self, pg: PgRef) {
        self.pgs.write().insert(pg.id(), pg);
    }

    /// Split `parent` for a pool that grew from `old_pg_num` to `map`'s pg_num.
    ///
    /// Objects that now hash to a child move into the child's collection and
    /// both sides' metadata is rewritten, all in one transaction. Children are
    /// registered only after it commits. Returns the new children.
    pub fn split_pg(
        &self,
        store: &dyn ObjectStore,
        parent: &PgRef,
        map: &OsdMap,
        old_pg_num: u32,
    ) -> crate::Result<Vec<PgId>> {
        let _create = self.create_lock.lock();
        let pgid = parent.id();
        let Some(pool) = map.pool(pgid.pool) else {
            return Ok(Vec::new());
        };
        let child_ids = pgid.split_children(old_pg_num, pool.pg_num);
        let mut parent_state = parent.lock();
        if child_ids.is_empty() || parent_state.is_removing() {
            return Ok(Vec::new());
        }

        let parent_cid = pg_collection(pgid);
        let mut children: BTreeMap<PgId, PgState> = child_ids
            .iter()
            .map(|&child| {
                let mut info = PgInfo::new(child);
                info.last_update = parent_state.info.last_update;
                info.last_complete = parent_state.info.last_complete;
                info.log_tail = parent_state.info.last_update;
                info.history = parent_state.info.history;
                info.purged_snaps = parent_state.info.purged_snaps.clone();
                (child, PgState::new(info, parent_state.epoch))
            })
            .collect();

        let mut tx = store.begin_transaction();
        for child in children.keys() {
            tx.create_collection(pg_collection(*child));
        }

        let mut parent_stats = parent_state.info.stats;
        for oid in store.list_objects(&parent_cid) {
            if is_pg_meta(&oid) {
                continue;
            }
            let Some(target) = map.object_to_pg(pgid.pool, &oid) else {
                continue;
            };
            let Some(child) = children.get_mut(&target) else {
                continue;
            };
            let size = store.read(&parent_cid, &oid).map_or(0, |d| d.len() as u64);
            tx.move_object(parent_cid.clone(), pg_collection(target), oid.clone());
            child.info.stats.num_objects += 1;
            child.info.stats.num_bytes += size;
            parent_stats.num_objects = parent_stats.num_objects.saturating_sub(1);
            parent_stats.num_bytes = parent_stats.num_bytes.saturating_sub(size);
            if let Some(need) = parent_state.missing.get(&oid) {
                child.missing.insert(oid.clone(), *need);
            }
        }
        for child in children.values() {
            child.write_meta(&mut tx)?;
        }

        let old_stats = parent_state.info.stats;
        parent_state.info.stats = parent_stats;
        let committed = parent_state
            .write_meta(&mut tx)
            .and_then(|_| store.commit(tx).map_err(Into::into));
        if let Err(e) = committed {
            parent_state.info.stats = old_stats;
            return Err(e);
        }
        for child in children.values() {
            for oid in child.missing.keys() {
                parent_state.missing.remove(oid);
            }
        }
        drop(parent_state);

        for child in &child_ids {
            if let Some(existing) = self.lookup(*child) {
                assert!(
                    existing.lock().peering == PeeringState::Removed,
                    "split child {} already registered",
                    child
                );
            }
        }
        let mut pgs = self.pgs.write();
        for (child, state) in children {
            pgs.insert(child, Pg::new(state));
        }
        tracing::info!(pgid = %pgid, children = ?child_ids, "split pg");
        Ok(child_ids)
    }

    /// Unlink `pg` if it is still the registered instance for its id.
    pub fn remove(&self, pg: &PgRef) -> bool {
        let mut pgs = self.pgs.write();
        match pgs.get(&pg.id()) {
            Some(existing) if Arc::ptr_eq(existing, pg) => {
                pgs.remove(&pg.id());
                true
            }
            _ => false,
        }
    }

    /// Register every PG found on disk.
    pub fn load_pgs(&self, store: &dyn ObjectStore) -> crate::Result<Vec<PgRef>> {
        let _create = self.create_lock.lock();
        let mut loaded = Vec::new();
        for cid in store.list_collections() {
            let Some(pgid) = parse_pg_collection(&cid) else {
                continue;
            };
            let Some(meta) = read_decoded::<PgMeta>(store, &cid, PGINFO_OID)? else {
                tracing::warn!(pgid = %pgid, "pg collection without info, skipping");
                continue;
            };
            let log = read_decoded::<PgLog>(store, &cid, PGLOG_OID)?
                .unwrap_or_else(|| PgLog::starting_at(meta.info.last_update));
            let mut state = PgState::new(meta.info, meta.epoch);
            state.log = log;
            let pg = Pg::new(state);
            self.insert(pg.clone());
            loaded.push(pg);
        }
        tracing::info!(count = loaded.len(), "loaded pgs");
        Ok(loaded)
    }

    /// Lowest epoch any PG still refers to.
    pub fn min_epoch(&self) -> Option<Epoch> {
        self.all().iter().map(|pg| pg.lock().epoch).min()
    }

    pub fn park_for_pg(&self, pgid: PgId, op: OpRequest) {
        self.waiting_for_pg.lock().entry(pgid).or_default().push(op);
    }

    pub fn take_pg_waiters(&self, pgid: PgId) -> Vec<OpRequest> {
        self.waiting_for_pg.lock().remove(&pgid).unwrap_or_default()
    }

    /// PGs with parked ops.
    pub fn waiting_pgs(&self) -> Vec<PgId> {
        self.waiting_for_pg.lock().keys().copied().collect()
    }

    /// Remember a creation request until the PG exists.
    pub fn add_creating(&self, pgid: PgId, created: Epoch) {
        self.creating.lock().insert(pgid, created);
    }

    pub fn take_creating(&self) -> BTreeMap<PgId, Epoch> {
        std::mem::take(&mut *self.creating.lock())
    }

    pub fn is_creating(&self, pgid: PgId) -> bool {
        self.creating.lock().contains_key(&pgid)
    }

    pub fn len(&self) -> usize {
        self.pgs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pgs.read().is_empty()
    }

    /// Snapshot of every registered PG.
    pub fn all(&self) -> Vec<PgRef> {
        self.pgs.read().values().cloned().collect()
    }
}
