//! Inbound message dispatch.
//!
//! Every message is classified, counted and either handled inline (cheap
//! peering and monitor messages, replies) or turned into an [`OpRequest`]
//! and queued on its PG. Whether a queued op may run is decided by
//! [`Osd::op_disposition`], evaluated again when a worker dequeues it;
//! the check at enqueue time only rejects early.

use super::op_request::{OpMessage, OpRequest};
use super::queues::CommandItem;
use super::session::{OsdCaps, Session, WatchRef};
use super::{NodeState, Osd, Parked};
use crate::error::OpError;
use crate::network::messages::{
    OpOutput, OsdOp, OsdOpReply, PulledObject, RepScrubMap, SubOp, SubOpReply,
};
use crate::network::{Destination, Dispatcher, Envelope, Message, MessageClass};
use crate::pg::{PgState, RecoveryOp, WatchKey};
use crate::types::{ConnectionId, EntityName, Epoch, OsdId, PgId, Tid};

/// What to do with an op given the PG's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Process,
    /// The client is gone; drop silently.
    Discard,
    /// The op is tagged with an epoch the PG has not reached.
    WaitForMap,
    /// The PG is not active yet.
    WaitForActive,
    Reject(OpError),
}

fn discard_reason(err: &OpError) -> &'static str {
    match err {
        OpError::StaleEpoch { .. } => "stale_epoch",
        OpError::Misdirected { .. } => "misdirected",
        OpError::Again => "throttled",
        OpError::PermissionDenied => "permission",
        OpError::NoSuchPool(_) => "no_pool",
        OpError::NoSuchPg(_) => "no_pg",
        OpError::WrongPeer { .. } => "wrong_peer",
        OpError::NotFound | OpError::Storage(_) | OpError::InvalidArgument(_) => "error",
    }
}

impl Osd {
    /// Route one inbound message. Returns false for messages this node
    /// never accepts.
    pub fn dispatch(&self, env: Envelope) -> bool {
        let class = env.msg.class();
        if class == MessageClass::Outbound {
            tracing::warn!(from = %env.from, "dropping outbound-only message");
            return false;
        }
        self.metrics.messages.inc(class.as_str());
        if self.state() == NodeState::Stopping {
            return true;
        }

        if let (Some(peer), Some(epoch)) = (env.from.as_osd(), env.msg.epoch()) {
            self.maybe_share_map(peer, epoch);
        }

        match class {
            MessageClass::ClientOp => {
                if let Message::OsdOp(op) = env.msg {
                    self.handle_op(env.from, env.conn, op);
                }
            }
            MessageClass::SubOp | MessageClass::PeeringControl => {
                let Some(from) = env.from.as_osd() else {
                    tracing::warn!(from = %env.from, "peer message from a non-osd, dropping");
                    return true;
                };
                if env.msg.epoch().is_some_and(|e| e > self.epoch()) {
                    self.wait_for_map(Parked::Msg(env));
                    return true;
                }
                self.handle_peer_message(from, env);
            }
            MessageClass::Heartbeat => return self.heartbeat_dispatch(env),
            MessageClass::MapUpdate => {
                if let Message::OsdMap(update) = env.msg {
                    self.handle_osd_map(update);
                }
            }
            MessageClass::Command => {
                if let Message::Command(req) = env.msg {
                    self.queues.command.queue(CommandItem {
                        conn: env.conn,
                        req,
                    });
                }
            }
            MessageClass::MonitorControl => match env.msg {
                Message::PgCreate(create) if env.from.is_mon() => self.handle_pg_create(create),
                Message::PgStatsAck { tid } => self.reporter.handle_pg_stats_ack(tid),
                msg => tracing::warn!(from = %env.from, ?msg, "unexpected monitor message"),
            },
            MessageClass::Outbound => unreachable!("filtered above"),
        }
        true
    }

    fn handle_peer_message(&self, from: OsdId, env: Envelope) {
        match env.msg {
            Message::SubOp(op) => self.handle_sub_op_msg(from, env.conn, op),
            Message::SubOpReply(reply) => self.handle_sub_op_reply(from, reply),
            Message::PgNotify(notify) => self.handle_pg_notify(from, notify),
            Message::PgQuery(query) => self.handle_pg_query(from, query),
            Message::PgLog(log) => self.handle_pg_log(from, log),
            Message::PgRemove(remove) => self.handle_pg_remove(from, remove),
            Message::RepScrub(req) => {
                self.queues.rep_scrub.queue((from, req));
            }
            Message::RepScrubMap(map) => self.handle_rep_scrub_map(from, map),
            other => tracing::warn!(from, msg = ?other, "unexpected peer message"),
        }
    }

    fn heartbeat_dispatch(&self, env: Envelope) -> bool {
        self.heartbeat.ms_dispatch(env)
    }

    /// Register a connection's session. Ops from connections without one
    /// are dropped.
    pub fn handle_connect(&self, conn: ConnectionId, entity: EntityName, caps: OsdCaps) {
        self.sessions.insert(Session::new(entity, conn, caps));
        tracing::debug!(conn, entity = %entity, "session opened");
    }

    /// A connection went away: forget its session and tear down its watches.
    pub fn handle_reset(&self, conn: ConnectionId) -> bool {
        let Some(session) = self.sessions.remove(conn) else {
            return false;
        };
        let watches = session.close();
        tracing::debug!(conn, watches = watches.len(), "session reset");

        let mut completed = Vec::new();
        for WatchRef { pgid, oid, cookie } in watches {
            let Some(mut pg) = self.registry.lookup_locked(pgid) else {
                continue;
            };
            let key = WatchKey { conn, cookie };
            if let Some(watchers) = pg.watchers.get_mut(&oid) {
                watchers.remove(&key);
                if watchers.is_empty() {
                    pg.watchers.remove(&oid);
                }
            }
            let done: Vec<u64> = pg
                .notifies
                .iter_mut()
                .filter_map(|(&id, notify)| {
                    (notify.waiting_on.remove(&key) && notify.waiting_on.is_empty()).then_some(id)
                })
                .collect();
            for id in done {
                if let Some(notify) = pg.notifies.remove(&id) {
                    completed.push(notify.op);
                }
            }
        }
        for op in completed {
            self.reply_op(op, Ok(OpOutput::default()));
        }
        true
    }

    fn handle_op(&self, from: EntityName, conn: ConnectionId, op: OsdOp) {
        let Some(session) = self.sessions.get(conn) else {
            tracing::debug!(conn, tid = op.tid, "op without a session, dropping");
            self.metrics.record_discard("no_session");
            return;
        };
        self.metrics.ops_received.inc();
        if !session.caps.allows(op.kind.is_write()) {
            self.reply_client(conn, op.tid, op.pgid, Err(OpError::PermissionDenied));
            return;
        }
        let pending = self.op_tracker.len();
        if pending >= self.config.op_queue_capacity {
            tracing::debug!(pending, tid = op.tid, "op queue full, rejecting");
            self.reply_client(conn, op.tid, op.pgid, Err(OpError::Again));
            return;
        }

        let current = self.epoch();
        let req = OpRequest::new(&self.op_tracker, from, conn, OpMessage::Client(op), current);
        if req.epoch() > current {
            req.mark_event("waiting_for_map");
            self.wait_for_map(Parked::Op(req));
            return;
        }
        if req.epoch() < current {
            let prev = session.set_last_sent_epoch(current);
            if prev < current {
                self.share_map(Destination::Conn(conn), prev.max(req.epoch()));
            }
        }
        self.enqueue_op(req);
    }

    fn handle_sub_op_msg(&self, from: OsdId, conn: ConnectionId, op: SubOp) {
        let req = OpRequest::new(
            &self.op_tracker,
            EntityName::osd(from),
            conn,
            OpMessage::Sub(op),
            self.epoch(),
        );
        self.enqueue_op(req);
    }

    /// Park `parked` until the node reaches its epoch.
    pub(super) fn wait_for_map(&self, parked: Parked) {
        let want = parked.epoch();
        {
            let mut waiting = self.waiting_for_osdmap.lock();
            // Checked under the lock so a concurrent map advance cannot miss it.
            if want > self.epoch() {
                if matches!(parked, Parked::Op(_)) {
                    self.metrics.ops_waiting_for_map.inc();
                }
                waiting.push(parked);
                drop(waiting);
                self.request_map(want);
                return;
            }
        }
        self.redispatch(parked);
    }

    pub(super) fn redispatch(&self, parked: Parked) {
        match parked {
            Parked::Op(req) => self.enqueue_op(req),
            Parked::Msg(env) => {
                self.dispatch(env);
            }
        }
    }

    /// Put an admitted op on its PG's queue.
    pub(crate) fn enqueue_op(&self, req: OpRequest) {
        let pgid = req.pgid();
        let map = self.osdmap();
        let Some(pool) = map.pool(pgid.pool) else {
            self.reply_error(req, OpError::NoSuchPool(pgid.pool));
            return;
        };
        if pgid.seed >= pool.pg_num {
            self.reply_error(req, OpError::NoSuchPg(pgid));
            return;
        }

        match self.registry.lookup_locked(pgid) {
            Some(mut pg) => match self.op_disposition(&pg, &req) {
                Disposition::Reject(err) => {
                    drop(pg);
                    self.reply_error(req, err);
                }
                Disposition::Discard => {
                    drop(pg);
                    self.discard_op(req, "session_gone");
                }
                _ => {
                    req.mark_event("queued_for_pg");
                    pg.op_queue.push_back(req);
                    let pg_ref = pg.pg().clone();
                    drop(pg);
                    self.queue_op_pg(&pg_ref);
                }
            },
            None if !req.is_client() => self.reply_error(req, OpError::NoSuchPg(pgid)),
            None if map.primary_of(pgid) == Some(self.whoami) => {
                req.mark_event("waiting_for_pg");
                self.registry.park_for_pg(pgid, req);
                // The PG may have been created since the lookup.
                if self.registry.lookup(pgid).is_some() {
                    self.requeue_pg_waiters(pgid);
                }
            }
            None => {
                let primary = map.primary_of(pgid);
                self.reply_error(req, OpError::Misdirected { primary });
            }
        }
    }

    pub(crate) fn requeue_pg_waiters(&self, pgid: PgId) {
        for req in self.registry.take_pg_waiters(pgid) {
            self.enqueue_op(req);
        }
    }

    /// Decide what to do with `req` given the state of its PG.
    pub fn op_disposition(&self, state: &PgState, req: &OpRequest) -> Disposition {
        let epoch = req.epoch();
        let history = &state.info.history;
        if req.is_client() {
            if !self.sessions.contains(req.conn) {
                return Disposition::Discard;
            }
            if state.is_removing() {
                let primary = self.osdmap().primary_of(state.pgid());
                return Disposition::Reject(OpError::Misdirected { primary });
            }
            if epoch > state.epoch {
                return Disposition::WaitForMap;
            }
            if epoch < history.same_primary_since {
                return Disposition::Reject(OpError::StaleEpoch {
                    current: state.epoch,
                });
            }
            if !state.is_primary() {
                return Disposition::Reject(OpError::Misdirected {
                    primary: state.primary(),
                });
            }
            if !state.is_active() {
                return Disposition::WaitForActive;
            }
        } else {
            if state.is_removing() {
                return Disposition::Reject(OpError::NoSuchPg(state.pgid()));
            }
            if epoch > state.epoch {
                return Disposition::WaitForMap;
            }
            if epoch < history.same_interval_since {
                return Disposition::Reject(OpError::StaleEpoch {
                    current: state.epoch,
                });
            }
            if state.primary() != req.from.as_osd() {
                return Disposition::Reject(OpError::WrongPeer {
                    primary: state.primary(),
                });
            }
        }
        Disposition::Process
    }

    fn reply_client(
        &self,
        conn: ConnectionId,
        tid: Tid,
        pgid: PgId,
        result: Result<OpOutput, OpError>,
    ) {
        if let Err(e) = &result {
            self.metrics.record_discard(discard_reason(e));
        }
        let reply = Message::OsdOpReply(OsdOpReply {
            tid,
            pgid,
            epoch: self.epoch(),
            result,
        });
        self.send(Destination::Conn(conn), reply);
    }

    /// Complete a client op.
    pub(crate) fn reply_op(&self, req: OpRequest, result: Result<OpOutput, OpError>) {
        let OpMessage::Client(op) = &req.msg else {
            let result = result.map(|_| None);
            self.reply_sub_op(req, result);
            return;
        };
        if result.is_ok() {
            self.metrics.ops_processed.inc();
        }
        req.mark_event("done");
        self.reply_client(req.conn, op.tid, op.pgid, result);
    }

    /// Complete a sub-op.
    pub(crate) fn reply_sub_op(
        &self,
        req: OpRequest,
        result: Result<Option<PulledObject>, OpError>,
    ) {
        let OpMessage::Sub(op) = &req.msg else {
            let result = result.map(|_| OpOutput::default());
            self.reply_op(req, result);
            return;
        };
        match &result {
            Ok(_) => self.metrics.subops_processed.inc(),
            Err(e) => self.metrics.record_discard(discard_reason(e)),
        }
        let Some(to) = req.from.as_osd() else {
            return;
        };
        let reply = Message::SubOpReply(SubOpReply {
            tid: op.tid,
            pgid: op.pgid,
            epoch: self.epoch(),
            result,
        });
        self.send(Destination::Osd(to), reply);
    }

    /// Reject an op without running it.
    pub(crate) fn reply_error(&self, req: OpRequest, err: OpError) {
        tracing::debug!(op = ?req, error = %err, "rejecting op");
        if req.is_client() {
            self.reply_op(req, Err(err));
        } else {
            self.reply_sub_op(req, Err(err));
        }
    }

    pub(crate) fn discard_op(&self, req: OpRequest, reason: &'static str) {
        tracing::debug!(op = req.id(), reason, "discarding op");
        self.metrics.record_discard(reason);
    }

    /// A replica answered a sub-op: a replicated write ack or a recovery reply.
    fn handle_sub_op_reply(&self, from: OsdId, reply: SubOpReply) {
        let Some(mut pg) = self.registry.lookup_locked(reply.pgid) else {
            return;
        };

        if let Some(gather) = pg.repops.get_mut(&reply.tid) {
            let result = match reply.result {
                Err(e) => {
                    tracing::warn!(pgid = %reply.pgid, tid = reply.tid, from, error = %e, "replica rejected write");
                    Err(e)
                }
                Ok(_) => {
                    gather.waiting_on.remove(&from);
                    if !gather.waiting_on.is_empty() {
                        return;
                    }
                    Ok(OpOutput {
                        version: gather.version,
                        data: None,
                    })
                }
            };
            let Some(gather) = pg.repops.remove(&reply.tid) else {
                return;
            };
            let resume_scrub = pg.repops.is_empty() && pg.scrub.blocked_on_writes;
            if resume_scrub {
                pg.scrub.blocked_on_writes = false;
            }
            let pg_ref = pg.pg().clone();
            drop(pg);
            self.reply_op(gather.op, result);
            if resume_scrub {
                self.queue_scrub(&pg_ref);
            }
            return;
        }

        let Some(op) = pg.recovering.remove(&reply.tid) else {
            tracing::debug!(pgid = %reply.pgid, tid = reply.tid, "reply for unknown tid");
            return;
        };
        self.recovery_gate.finish(1);
        self.metrics.recovery_ops.inc();
        match (op, reply.result) {
            (RecoveryOp::Pull { oid, .. }, Ok(pulled)) => {
                let pulled = pulled.unwrap_or(PulledObject {
                    oid: oid.clone(),
                    version: pg.missing.get(&oid).copied().unwrap_or_default(),
                    data: None,
                });
                if let Err(e) = self.apply_recovered(&mut pg, pulled) {
                    tracing::warn!(pgid = %reply.pgid, oid, error = %e, "failed to store recovered object");
                }
            }
            (RecoveryOp::Push { oid, to }, Ok(_)) => {
                if let Some(missing) = pg.peer_missing.get_mut(&to) {
                    missing.remove(&oid);
                }
                self.release_missing_waiters(&mut pg, &oid);
            }
            (op, Err(e)) => {
                tracing::warn!(pgid = %reply.pgid, oid = op.oid(), error = %e, "recovery op failed");
            }
        }

        let pg_ref = pg.pg().clone();
        let queued_ops = !pg.op_queue.is_empty();
        if pg.is_active() && !pg.needs_recovery() && pg.recovering.is_empty() {
            pg.info.history.last_epoch_clean = pg.epoch;
            tracing::info!(pgid = %pg_ref.id(), epoch = pg.epoch, "pg recovered");
            self.persist_meta(&pg);
            drop(pg);
            self.queue_stats(&pg_ref);
        } else {
            let more = pg.needs_recovery();
            drop(pg);
            if more {
                self.queue_recovery(&pg_ref);
            }
        }
        if queued_ops {
            self.queue_op_pg(&pg_ref);
        }
        self.queues.recovery.wake();
    }

    fn handle_rep_scrub_map(&self, from: OsdId, msg: RepScrubMap) {
        let Some(mut pg) = self.registry.lookup_locked(msg.pgid) else {
            return;
        };
        if !pg.scrub.active || pg.is_from_old_interval(msg.epoch) {
            tracing::debug!(pgid = %msg.pgid, from, "stale scrub map");
            return;
        }
        if !pg.scrub.waiting_on.remove(&from) {
            return;
        }
        pg.scrub.received.insert(from, msg.map);
        if pg.scrub.waiting_on.is_empty() {
            let pg_ref = pg.pg().clone();
            drop(pg);
            self.queue_scrub_finalize(&pg_ref);
        }
    }

    /// Send a peer the maps it lacks, once per epoch.
    fn maybe_share_map(&self, peer: OsdId, their_epoch: Epoch) {
        let current = self.epoch();
        let since = {
            let mut known = self.peer_map_epoch.entry(peer).or_insert(0);
            *known = (*known).max(their_epoch);
            if *known >= current {
                return;
            }
            let since = *known;
            *known = current;
            since
        };
        self.share_map(Destination::Osd(peer), since);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::OpKind;
    use crate::pg::{PgInfo, PgState};
    use crate::types::Role;
    use std::sync::Arc;
    use std::time::Duration;

    fn client_req(osd: &Osd, conn: ConnectionId, epoch: Epoch) -> OpRequest {
        OpRequest::new(
            osd.op_tracker(),
            EntityName::client(1),
            conn,
            OpMessage::Client(OsdOp {
                tid: 1,
                pgid: PgId::new(1, 0),
                oid: "obj".to_string(),
                epoch,
                kind: OpKind::Read,
            }),
            epoch,
        )
    }

    fn sub_req(osd: &Osd, from: OsdId, epoch: Epoch) -> OpRequest {
        OpRequest::new(
            osd.op_tracker(),
            EntityName::osd(from),
            0,
            OpMessage::Sub(SubOp {
                tid: 1,
                pgid: PgId::new(1, 0),
                epoch,
                kind: crate::network::messages::SubOpKind::Pull {
                    oid: "obj".to_string(),
                },
            }),
            epoch,
        )
    }

    fn active_primary(epoch: Epoch) -> PgState {
        let mut state = PgState::new(PgInfo::new(PgId::new(1, 0)), epoch);
        state.role = Role::Primary;
        state.acting = vec![0, 1];
        state.peering = crate::pg::PeeringState::Active;
        state.info.history.same_interval_since = 3;
        state.info.history.same_primary_since = 3;
        state
    }

    fn test_osd() -> Arc<Osd> {
        Osd::new(
            crate::config::OsdConfig::new(0).with_worker_poll_interval(Duration::from_millis(10)),
            Arc::new(crate::store::MemStore::new()),
            crate::testing::RecordingTransport::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_client_op_disposition() {
        let osd = test_osd();
        osd.handle_connect(5, EntityName::client(1), OsdCaps::all());
        let mut state = active_primary(6);

        assert_eq!(osd.op_disposition(&state, &client_req(&osd, 5, 6)), Disposition::Process);
        assert_eq!(osd.op_disposition(&state, &client_req(&osd, 5, 7)), Disposition::WaitForMap);
        assert_eq!(
            osd.op_disposition(&state, &client_req(&osd, 5, 2)),
            Disposition::Reject(OpError::StaleEpoch { current: 6 })
        );
        assert_eq!(osd.op_disposition(&state, &client_req(&osd, 9, 6)), Disposition::Discard);

        state.peering = crate::pg::PeeringState::Peering(crate::pg::PeeringPhase::GetInfo);
        assert_eq!(osd.op_disposition(&state, &client_req(&osd, 5, 6)), Disposition::WaitForActive);

        state.role = Role::Replica;
        state.acting = vec![1, 0];
        assert_eq!(
            osd.op_disposition(&state, &client_req(&osd, 5, 6)),
            Disposition::Reject(OpError::Misdirected { primary: Some(1) })
        );
    }

    #[test]
    fn test_sub_op_disposition() {
        let osd = test_osd();
        let mut state = active_primary(6);
        state.role = Role::Replica;
        state.acting = vec![1, 0];

        assert_eq!(osd.op_disposition(&state, &sub_req(&osd, 1, 6)), Disposition::Process);
        assert_eq!(
            osd.op_disposition(&state, &sub_req(&osd, 2, 6)),
            Disposition::Reject(OpError::WrongPeer { primary: Some(1) })
        );
        assert_eq!(
            osd.op_disposition(&state, &sub_req(&osd, 1, 2)),
            Disposition::Reject(OpError::StaleEpoch { current: 6 })
        );
        assert_eq!(osd.op_disposition(&state, &sub_req(&osd, 1, 8)), Disposition::WaitForMap);

        state.peering = crate::pg::PeeringState::Removing;
        assert_eq!(
            osd.op_disposition(&state, &sub_req(&osd, 1, 6)),
            Disposition::Reject(OpError::NoSuchPg(PgId::new(1, 0)))
        );
    }

    #[test]
    fn test_outbound_messages_refused() {
        let osd = test_osd();
        let env = Envelope::new(EntityName::mon(0), 1, Message::Alive { want: 3 });
        assert!(!osd.dispatch(env));
    }

    #[test]
    fn test_op_without_session_dropped() {
        let osd = test_osd();
        let op = OsdOp {
            tid: 1,
            pgid: PgId::new(1, 0),
            oid: "a".to_string(),
            epoch: 0,
            kind: OpKind::Read,
        };
        assert!(osd.dispatch(Envelope::new(EntityName::client(1), 3, Message::OsdOp(op))));
        assert_eq!(osd.metrics().ops_discarded.get("no_session"), 1);
        assert!(osd.op_tracker().is_empty());
    }

    #[test]
    fn test_read_only_session_cannot_write() {
        let transport = crate::testing::RecordingTransport::new();
        let osd = Osd::new(
            crate::config::OsdConfig::new(0),
            Arc::new(crate::store::MemStore::new()),
            transport.clone(),
        )
        .unwrap();
        osd.handle_connect(3, EntityName::client(1), OsdCaps::read_only());
        let op = OsdOp {
            tid: 7,
            pgid: PgId::new(1, 0),
            oid: "a".to_string(),
            epoch: 0,
            kind: OpKind::Delete,
        };
        osd.dispatch(Envelope::new(EntityName::client(1), 3, Message::OsdOp(op)));
        let replies: Vec<_> = transport
            .take()
            .into_iter()
            .filter_map(|(dest, msg)| match msg {
                Message::OsdOpReply(r) => Some((dest, r)),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, Destination::Conn(3));
        assert_eq!(replies[0].1.result, Err(OpError::PermissionDenied));
    }
}
