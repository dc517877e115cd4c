//! Peering state machine.
//!
//! ```text
//!  Creating ──► Peering(GetInfo) ──► Peering(GetLog) ──► Active
//!                    │     ▲                              │
//!                    │     └──────── new interval ────────┘
//!                    └──────────────────────────────────► Active
//!  Active/Peering ──► Removing ──► Removed   (removal queue only)
//! ```
//!
//! The primary gathers infos from its acting peers, pulls the log from
//! whichever peer is ahead, then activates: it sends each replica the log
//! entries it lacks and records what every replica is missing. Replicas and
//! strays announce themselves with a notify and wait for the primary's log.
//!
//! Everything here mutates [`PgState`] and queues outbound messages into a
//! [`PeeringBatch`]; sending and persisting are up to the caller.

use super::info::{MissingSet, PgInfo};
use super::PgState;
use crate::map::OsdMap;
use crate::network::messages::{Message, PgLogMsg, PgNotify, PgQuery, PgRemove, QueryKind};
use crate::types::{Epoch, OsdId, PgId, Role};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeeringPhase {
    /// Primary is collecting infos from its acting peers.
    GetInfo,
    /// Primary is fetching the authoritative log from `from`.
    GetLog { from: OsdId },
    /// Non-primary is waiting for the primary's activation.
    WaitActivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeeringState {
    Creating,
    Peering(PeeringPhase),
    Active,
    Removing,
    Removed,
}

impl fmt::Display for PeeringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeeringState::Creating => write!(f, "creating"),
            PeeringState::Peering(PeeringPhase::GetInfo) => write!(f, "peering+getinfo"),
            PeeringState::Peering(PeeringPhase::GetLog { .. }) => write!(f, "peering+getlog"),
            PeeringState::Peering(PeeringPhase::WaitActivate) => write!(f, "peering+wait"),
            PeeringState::Active => write!(f, "active"),
            PeeringState::Removing => write!(f, "removing"),
            PeeringState::Removed => write!(f, "removed"),
        }
    }
}

/// Result of advancing a PG to a new map.
#[derive(Debug, Default)]
pub struct MapAdvance {
    /// The up or acting set changed; the PG must peer again.
    pub new_interval: bool,
    /// The PG's pool no longer exists.
    pub pool_removed: bool,
    /// Ops moved back onto the op queue.
    pub requeued: usize,
    /// Recovery slots held by cancelled recovery ops.
    pub released_recovery: usize,
    /// A scrub slot was held by the cancelled scrub.
    pub released_scrub: bool,
}

/// Result of activating a PG.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Activation {
    /// Ops moved from the waiting-for-active list onto the op queue.
    pub requeued: usize,
    pub needs_recovery: bool,
}

impl PgState {
    /// Move to `map`, opening a new interval if placement changed.
    pub fn advance_map(&mut self, map: &OsdMap, whoami: OsdId) -> MapAdvance {
        let mut result = MapAdvance::default();
        if map.epoch <= self.epoch && self.peering != PeeringState::Creating {
            return result;
        }
        self.epoch = map.epoch;
        result.requeued += self.requeue_waiting_for_map();

        if self.is_removing() {
            return result;
        }
        if map.pool(self.pgid().pool).is_none() {
            result.pool_removed = true;
            return result;
        }

        let (up, acting) = map.pg_to_up_acting(self.pgid());
        if up == self.up && acting == self.acting && self.peering != PeeringState::Creating {
            return result;
        }

        let primary_changed =
            acting.first() != self.acting.first() || self.peering == PeeringState::Creating;
        let history = &mut self.info.history;
        history.same_interval_since = map.epoch;
        if primary_changed {
            history.same_primary_since = map.epoch;
        }

        self.role = match acting.iter().position(|&o| o == whoami) {
            Some(0) => Role::Primary,
            Some(_) => Role::Replica,
            None => Role::Stray,
        };
        self.up = up;
        self.acting = acting;
        self.peer_info.clear();
        self.peers_pending.clear();
        self.strays.clear();
        self.peer_missing.clear();
        self.pull_source = None;

        result.released_recovery = self.recovering.len();
        self.recovering.clear();
        result.released_scrub = self.scrub.reset();

        // Writes that were waiting on replicas and reads waiting on recovery
        // start over in the new interval.
        let mut retry: Vec<_> = std::mem::take(&mut self.repops)
            .into_values()
            .map(|r| r.op)
            .collect();
        for (_, ops) in std::mem::take(&mut self.waiting_for_missing) {
            retry.extend(ops);
        }
        result.requeued += retry.len();
        for op in retry.into_iter().rev() {
            self.op_queue.push_front(op);
        }

        self.peering = PeeringState::Peering(PeeringPhase::GetInfo);
        result.new_interval = true;
        tracing::debug!(
            pgid = %self.pgid(),
            epoch = map.epoch,
            role = %self.role,
            acting = ?self.acting,
            "new interval"
        );
        result
    }

    fn requeue_waiting_for_map(&mut self) -> usize {
        let epoch = self.epoch;
        let mut ready = Vec::new();
        let mut still = std::collections::VecDeque::new();
        for op in self.waiting_for_map.drain(..) {
            if op.epoch() <= epoch {
                ready.push(op);
            } else {
                still.push_back(op);
            }
        }
        self.waiting_for_map = still;
        let n = ready.len();
        for op in ready.into_iter().rev() {
            self.op_queue.push_front(op);
        }
        n
    }

    /// Whether a peering message sent at `epoch` predates the current interval.
    pub fn is_from_old_interval(&self, epoch: Epoch) -> bool {
        epoch < self.info.history.same_interval_since
    }

    /// Kick off peering for the current interval.
    pub fn start_peering(
        &mut self,
        whoami: OsdId,
        batch: &mut PeeringBatch,
        backfill: &dyn Fn() -> MissingSet,
    ) -> Option<Activation> {
        match self.role {
            Role::Primary => {
                let peers: Vec<OsdId> = self.replicas().to_vec();
                if peers.is_empty() {
                    return Some(self.activate(whoami, batch, backfill));
                }
                self.peering = PeeringState::Peering(PeeringPhase::GetInfo);
                for &peer in &peers {
                    batch.query(peer, self.pgid(), QueryKind::Info);
                }
                self.peers_pending = peers.into_iter().collect();
                None
            }
            Role::Replica | Role::Stray => {
                self.peering = PeeringState::Peering(PeeringPhase::WaitActivate);
                if let Some(primary) = self.primary() {
                    if primary != whoami && (self.role == Role::Replica || !self.info.is_empty()) {
                        batch.notify(primary, self.info.clone());
                    }
                }
                None
            }
        }
    }

    /// A peer reported its info, unsolicited or in answer to a query.
    pub fn handle_info(
        &mut self,
        from: OsdId,
        info: PgInfo,
        whoami: OsdId,
        batch: &mut PeeringBatch,
        backfill: &dyn Fn() -> MissingSet,
    ) -> Option<Activation> {
        if !self.is_primary() {
            return None;
        }
        if !self.acting.contains(&from) {
            if self.is_active() {
                batch.remove(from, self.pgid());
            } else if !info.is_empty() {
                self.strays.insert(from);
            }
            return None;
        }
        if self.peering != PeeringState::Peering(PeeringPhase::GetInfo) {
            return None;
        }

        self.info.history.merge(&info.history);
        self.peer_info.insert(from, info);
        self.peers_pending.remove(&from);
        if !self.peers_pending.is_empty() {
            return None;
        }
        self.choose_authoritative(whoami, batch, backfill)
    }

    fn choose_authoritative(
        &mut self,
        whoami: OsdId,
        batch: &mut PeeringBatch,
        backfill: &dyn Fn() -> MissingSet,
    ) -> Option<Activation> {
        let ahead = self
            .peer_info
            .iter()
            .filter(|(_, i)| i.last_update > self.info.last_update)
            .max_by_key(|(_, i)| i.last_update)
            .map(|(&osd, _)| osd);

        match ahead {
            None => Some(self.activate(whoami, batch, backfill)),
            Some(from) => {
                self.peering = PeeringState::Peering(PeeringPhase::GetLog { from });
                batch.query(
                    from,
                    self.pgid(),
                    QueryKind::Log {
                        since: self.info.last_update,
                    },
                );
                None
            }
        }
    }

    /// A peer asked about this PG.
    pub fn handle_query(&self, from: OsdId, kind: QueryKind, batch: &mut PeeringBatch) {
        match kind {
            QueryKind::Info => batch.notify(from, self.info.clone()),
            QueryKind::Log { since } => batch.log(
                from,
                PgLogMsg {
                    epoch: self.epoch,
                    info: self.info.clone(),
                    entries: self.log.entries_after(since),
                },
            ),
        }
    }

    /// A log arrived: the answer to our log query, or the primary's activation.
    pub fn handle_log(
        &mut self,
        from: OsdId,
        msg: PgLogMsg,
        whoami: OsdId,
        batch: &mut PeeringBatch,
        backfill: &dyn Fn() -> MissingSet,
    ) -> Option<Activation> {
        match (self.role, self.peering) {
            (Role::Primary, PeeringState::Peering(PeeringPhase::GetLog { from: expected }))
                if expected == from =>
            {
                self.merge_log(msg);
                self.pull_source = Some(from);
                Some(self.activate(whoami, batch, backfill))
            }
            (Role::Replica, PeeringState::Peering(_)) if self.primary() == Some(from) => {
                let last_epoch_started = msg.info.history.last_epoch_started;
                self.merge_log(msg);
                self.info.history.last_epoch_started = last_epoch_started;
                self.peering = PeeringState::Active;
                tracing::debug!(pgid = %self.pgid(), missing = self.missing.len(), "replica activated");
                Some(Activation::default())
            }
            _ => None,
        }
    }

    fn merge_log(&mut self, msg: PgLogMsg) {
        for entry in msg.entries {
            if entry.version <= self.log.head() {
                continue;
            }
            self.missing.insert(entry.oid.clone(), entry.version);
            self.log.append(entry);
        }
        if msg.info.last_update > self.info.last_update {
            self.info.last_update = msg.info.last_update;
        }
        self.info.history.merge(&msg.info.history);
        if self.missing.is_empty() {
            self.info.last_complete = self.info.last_update;
        }
    }

    /// Become active: hand every replica the log it lacks.
    fn activate(
        &mut self,
        whoami: OsdId,
        batch: &mut PeeringBatch,
        backfill: &dyn Fn() -> MissingSet,
    ) -> Activation {
        self.peering = PeeringState::Active;
        self.info.history.last_epoch_started = self.epoch;
        if self.missing.is_empty() {
            self.info.last_complete = self.info.last_update;
        }

        let pgid = self.pgid();
        for peer in self.replicas().to_vec() {
            if peer == whoami {
                continue;
            }
            let since = self
                .peer_info
                .get(&peer)
                .map(|i| i.last_update)
                .unwrap_or_default();
            let missing = if self.log.covers(since) {
                self.log.missing_since(since)
            } else {
                backfill()
            };
            batch.log(
                peer,
                PgLogMsg {
                    epoch: self.epoch,
                    info: self.info.clone(),
                    entries: self.log.entries_after(since),
                },
            );
            self.peer_missing.insert(peer, missing);
        }
        for stray in std::mem::take(&mut self.strays) {
            batch.remove(stray, pgid);
        }

        let requeued = self.waiting_for_active.len();
        while let Some(op) = self.waiting_for_active.pop_back() {
            self.op_queue.push_front(op);
        }

        let activation = Activation {
            requeued,
            needs_recovery: self.needs_recovery(),
        };
        tracing::info!(
            pgid = %pgid,
            epoch = self.epoch,
            last_update = %self.info.last_update,
            needs_recovery = activation.needs_recovery,
            "pg activated"
        );
        activation
    }
}

/// Peering messages collected while handling one event, grouped by peer.
#[derive(Debug, Default)]
pub struct PeeringBatch {
    notifies: BTreeMap<OsdId, Vec<PgInfo>>,
    queries: BTreeMap<OsdId, Vec<(PgId, QueryKind)>>,
    removes: BTreeMap<OsdId, Vec<PgId>>,
    logs: Vec<(OsdId, PgLogMsg)>,
}

impl PeeringBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&mut self, to: OsdId, info: PgInfo) {
        self.notifies.entry(to).or_default().push(info);
    }

    pub fn query(&mut self, to: OsdId, pgid: PgId, kind: QueryKind) {
        self.queries.entry(to).or_default().push((pgid, kind));
    }

    pub fn remove(&mut self, to: OsdId, pgid: PgId) {
        self.removes.entry(to).or_default().push(pgid);
    }

    /// Logs are large and are sent one per message.
    pub fn log(&mut self, to: OsdId, msg: PgLogMsg) {
        self.logs.push((to, msg));
    }

    pub fn is_empty(&self) -> bool {
        self.notifies.is_empty()
            && self.queries.is_empty()
            && self.removes.is_empty()
            && self.logs.is_empty()
    }

    /// Number of messages the batch turns into.
    pub fn message_count(&self) -> usize {
        self.notifies.len() + self.queries.len() + self.removes.len() + self.logs.len()
    }

    /// One notify, one query and one remove message per peer, plus the logs.
    pub fn into_messages(self, epoch: Epoch) -> Vec<(OsdId, Message)> {
        let mut out = Vec::with_capacity(self.message_count());
        for (to, infos) in self.notifies {
            out.push((to, Message::PgNotify(PgNotify { epoch, infos })));
        }
        for (to, queries) in self.queries {
            out.push((to, Message::PgQuery(PgQuery { epoch, queries })));
        }
        for (to, pgs) in self.removes {
            out.push((to, Message::PgRemove(PgRemove { epoch, pgs })));
        }
        for (to, msg) in self.logs {
            out.push((to, Message::PgLog(msg)));
        }
        out
    }
}
