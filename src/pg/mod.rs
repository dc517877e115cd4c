//! Placement groups.
//!
//! A [`Pg`] is shared as a [`PgRef`] (`Arc<Pg>`): the registry holds one
//! reference and every queue the PG is linked into holds another. Queue
//! membership is one flag per [`QueueKind`], flipped only by the owning
//! queue's policy under that queue's lock, so a PG is queued at most once
//! per queue.
//!
//! All mutable state lives in [`PgState`] behind the per-PG mutex. A worker
//! holds that lock for exactly one unit of work.

pub mod info;
pub mod peering;
pub mod registry;

pub use info::{
    compare_scrub_maps, LogEntry, LogOp, MissingSet, ObjectDigest, PgHistory, PgInfo, PgLog,
    PgStats, ScrubMap,
};
pub use peering::{PeeringBatch, PeeringPhase, PeeringState};
pub use registry::{PgRegistry, PgSpec};

use crate::osd::op_request::OpRequest;
use crate::store::{pg_collection, Transaction, PGINFO_OID, PGLOG_OID};
use crate::types::{ConnectionId, EntityName, Epoch, Eversion, OsdId, PgId, Role, Tid};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, MutexGuard, RawMutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Queues a PG can be linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Op,
    Recovery,
    SnapTrim,
    Scrub,
    ScrubFinalize,
    Remove,
    Stats,
}

impl QueueKind {
    pub const COUNT: usize = 7;

    pub const ALL: [QueueKind; QueueKind::COUNT] = [
        QueueKind::Op,
        QueueKind::Recovery,
        QueueKind::SnapTrim,
        QueueKind::Scrub,
        QueueKind::ScrubFinalize,
        QueueKind::Remove,
        QueueKind::Stats,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Op => "op",
            QueueKind::Recovery => "recovery",
            QueueKind::SnapTrim => "snap_trim",
            QueueKind::Scrub => "scrub",
            QueueKind::ScrubFinalize => "scrub_finalize",
            QueueKind::Remove => "remove",
            QueueKind::Stats => "stats",
        }
    }
}

/// Shared handle to a PG.
pub type PgRef = Arc<Pg>;

/// A placement group hosted on this node.
#[derive(Debug)]
pub struct Pg {
    id: PgId,
    state: Arc<Mutex<PgState>>,
    queued: [AtomicBool; QueueKind::COUNT],
}

impl Pg {
    pub(crate) fn new(state: PgState) -> PgRef {
        Arc::new(Self {
            id: state.info.pgid,
            state: Arc::new(Mutex::new(state)),
            queued: Default::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(pgid: PgId) -> PgRef {
        Self::new(PgState::new(PgInfo::new(pgid), 0))
    }

    pub fn id(&self) -> PgId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, PgState> {
        self.state.lock()
    }

    /// Lock the PG, keeping the handle alongside the guard.
    pub fn lock_owned(self: &Arc<Self>) -> LockedPg {
        LockedPg {
            guard: self.state.lock_arc(),
            pg: self.clone(),
        }
    }

    pub fn is_queued(&self, kind: QueueKind) -> bool {
        self.queued[kind.index()].load(Ordering::SeqCst)
    }

    /// Set the flag for `kind`. Returns false if it was already set.
    pub(crate) fn mark_queued(&self, kind: QueueKind) -> bool {
        !self.queued[kind.index()].swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_queued(&self, kind: QueueKind) {
        self.queued[kind.index()].store(false, Ordering::SeqCst);
    }
}

/// A PG together with its held lock.
pub struct LockedPg {
    pg: PgRef,
    guard: ArcMutexGuard<RawMutex, PgState>,
}

impl LockedPg {
    pub fn pg(&self) -> &PgRef {
        &self.pg
    }

    pub fn id(&self) -> PgId {
        self.pg.id()
    }
}

impl Deref for LockedPg {
    type Target = PgState;

    fn deref(&self) -> &PgState {
        &self.guard
    }
}

impl DerefMut for LockedPg {
    fn deref_mut(&mut self) -> &mut PgState {
        &mut self.guard
    }
}

/// A replicated write waiting for replica acknowledgements.
#[derive(Debug)]
pub struct RepGather {
    pub op: OpRequest,
    pub version: Eversion,
    pub waiting_on: BTreeSet<OsdId>,
}

/// An in-flight recovery message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOp {
    Pull { oid: String, from: OsdId },
    Push { oid: String, to: OsdId },
}

impl RecoveryOp {
    pub fn oid(&self) -> &str {
        match self {
            RecoveryOp::Pull { oid, .. } | RecoveryOp::Push { oid, .. } => oid,
        }
    }
}

/// Progress of the current scrub, if any.
#[derive(Debug, Default)]
pub struct ScrubState {
    /// A node-wide scrub slot is held for this PG.
    pub reserved: bool,
    pub active: bool,
    /// Requested by an operator; skips the interval check.
    pub must_scrub: bool,
    pub local: ScrubMap,
    pub received: BTreeMap<OsdId, ScrubMap>,
    pub waiting_on: BTreeSet<OsdId>,
    /// Parked until the last in-flight replicated write completes.
    pub blocked_on_writes: bool,
}

impl ScrubState {
    /// Forget the current scrub. Returns whether a slot was held.
    pub fn reset(&mut self) -> bool {
        let reserved = self.reserved;
        *self = ScrubState::default();
        reserved
    }
}

/// A client watching an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey {
    pub conn: ConnectionId,
    pub cookie: u64,
}

/// A notify waiting for watcher acknowledgements.
#[derive(Debug)]
pub struct PendingNotify {
    pub op: OpRequest,
    pub oid: String,
    pub waiting_on: BTreeSet<WatchKey>,
}

/// What gets persisted in the `_pginfo` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgMeta {
    pub epoch: Epoch,
    pub info: PgInfo,
}

/// Mutable state of a PG, guarded by the PG lock.
#[derive(Debug)]
pub struct PgState {
    pub info: PgInfo,
    /// Map epoch this PG has been advanced to.
    pub epoch: Epoch,
    pub role: Role,
    pub up: Vec<OsdId>,
    pub acting: Vec<OsdId>,
    pub peering: PeeringState,

    pub log: PgLog,
    /// Objects this copy lacks.
    pub missing: MissingSet,
    /// Peer to pull missing objects from.
    pub pull_source: Option<OsdId>,

    /// Infos gathered from acting peers during peering.
    pub peer_info: BTreeMap<OsdId, PgInfo>,
    /// Acting peers whose info has not arrived yet.
    pub peers_pending: BTreeSet<OsdId>,
    /// Non-acting holders that announced themselves; told to remove on activation.
    pub strays: BTreeSet<OsdId>,
    pub peer_missing: BTreeMap<OsdId, MissingSet>,

    /// Ops admitted for this PG, in arrival order.
    pub op_queue: VecDeque<OpRequest>,
    pub waiting_for_map: VecDeque<OpRequest>,
    pub waiting_for_active: VecDeque<OpRequest>,
    pub waiting_for_missing: BTreeMap<String, Vec<OpRequest>>,
    pub repops: BTreeMap<Tid, RepGather>,
    pub recovering: BTreeMap<Tid, RecoveryOp>,

    pub scrub: ScrubState,
    /// Removed snapshots not yet purged from this PG.
    pub snap_trimq: BTreeSet<u64>,

    pub watchers: BTreeMap<String, BTreeMap<WatchKey, EntityName>>,
    pub notifies: BTreeMap<u64, PendingNotify>,
}

impl PgState {
    pub fn new(info: PgInfo, epoch: Epoch) -> Self {
        let log = PgLog::starting_at(info.last_update);
        Self {
            info,
            epoch,
            role: Role::Stray,
            up: Vec::new(),
            acting: Vec::new(),
            peering: PeeringState::Creating,
            log,
            missing: MissingSet::new(),
            pull_source: None,
            peer_info: BTreeMap::new(),
            peers_pending: BTreeSet::new(),
            strays: BTreeSet::new(),
            peer_missing: BTreeMap::new(),
            op_queue: VecDeque::new(),
            waiting_for_map: VecDeque::new(),
            waiting_for_active: VecDeque::new(),
            waiting_for_missing: BTreeMap::new(),
            repops: BTreeMap::new(),
            recovering: BTreeMap::new(),
            scrub: ScrubState::default(),
            snap_trimq: BTreeSet::new(),
            watchers: BTreeMap::new(),
            notifies: BTreeMap::new(),
        }
    }

    pub fn pgid(&self) -> PgId {
        self.info.pgid
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn is_active(&self) -> bool {
        self.peering == PeeringState::Active
    }

    pub fn is_removing(&self) -> bool {
        matches!(self.peering, PeeringState::Removing | PeeringState::Removed)
    }

    pub fn primary(&self) -> Option<OsdId> {
        self.acting.first().copied()
    }

    pub fn replicas(&self) -> &[OsdId] {
        self.acting.get(1..).unwrap_or(&[])
    }

    /// Whether recovery has anything left to do.
    pub fn needs_recovery(&self) -> bool {
        !self.missing.is_empty() || self.peer_missing.values().any(|m| !m.is_empty())
    }

    /// Next version for a local update at the current epoch.
    pub fn next_version(&self) -> Eversion {
        Eversion::new(self.epoch, self.info.last_update.version + 1)
    }

    /// Mark `oid` as present at its needed version.
    pub fn object_recovered(&mut self, oid: &str) {
        self.missing.remove(oid);
        if self.missing.is_empty() {
            self.info.last_complete = self.info.last_update;
        }
    }

    /// Summary string used in reports and command output.
    pub fn state_string(&self) -> String {
        let mut s = self.peering.to_string();
        if self.is_active() && self.needs_recovery() {
            s.push_str("+recovering");
        }
        if self.scrub.active {
            s.push_str("+scrubbing");
        }
        s
    }

    /// Append writes persisting the info and log to `tx`.
    pub fn write_meta(&self, tx: &mut Transaction) -> crate::Result<()> {
        let cid = pg_collection(self.pgid());
        let meta = PgMeta {
            epoch: self.epoch,
            info: self.info.clone(),
        };
        tx.write_encoded(cid.clone(), PGINFO_OID, &meta)?;
        tx.write_encoded(cid, PGLOG_OID, &self.log)?;
        Ok(())
    }

    /// Ops parked on this PG, oldest first. Used when the PG goes away.
    pub fn take_all_ops(&mut self) -> Vec<OpRequest> {
        let mut ops: Vec<OpRequest> = self.op_queue.drain(..).collect();
        ops.extend(self.waiting_for_map.drain(..));
        ops.extend(self.waiting_for_active.drain(..));
        for (_, waiting) in std::mem::take(&mut self.waiting_for_missing) {
            ops.extend(waiting);
        }
        ops.extend(std::mem::take(&mut self.repops).into_values().map(|r| r.op));
        ops.extend(std::mem::take(&mut self.notifies).into_values().map(|n| n.op));
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_flags() {
        let pg = Pg::new_for_test(PgId::new(1, 0));
        assert!(pg.mark_queued(QueueKind::Op));
        assert!(!pg.mark_queued(QueueKind::Op));
        assert!(pg.mark_queued(QueueKind::Scrub));
        pg.clear_queued(QueueKind::Op);
        assert!(!pg.is_queued(QueueKind::Op));
        assert!(pg.is_queued(QueueKind::Scrub));
    }

    #[test]
    fn test_locked_pg_keeps_handle() {
        let pg = Pg::new_for_test(PgId::new(2, 3));
        let mut locked = pg.lock_owned();
        locked.epoch = 9;
        assert_eq!(locked.id(), PgId::new(2, 3));
        assert!(pg.state.try_lock().is_none());
        drop(locked);
        assert_eq!(pg.lock().epoch, 9);
    }

    #[test]
    fn test_object_recovered_advances_last_complete() {
        let mut state = PgState::new(PgInfo::new(PgId::new(1, 1)), 3);
        state.info.last_update = Eversion::new(3, 4);
        state.missing.insert("a".into(), Eversion::new(3, 2));
        state.missing.insert("b".into(), Eversion::new(3, 4));

        state.object_recovered("a");
        assert_eq!(state.info.last_complete, Eversion::default());
        state.object_recovered("b");
        assert_eq!(state.info.last_complete, Eversion::new(3, 4));
    }
}
