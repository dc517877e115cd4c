//! Work done by the PG-scoped queues.
//!
//! Each `process_*` function runs on a pool thread with the PG lock held
//! for one unit of work: one op, one recovery batch, one trim pass, one
//! scrub step or one removal. Anything left over is requeued rather than
//! looped over under the lock.

use super::dispatch::Disposition;
use super::op_request::{OpMessage, OpRequest};
use super::session::WatchRef;
use super::Osd;
use crate::error::OpError;
use crate::network::messages::{
    OpKind, OpOutput, PulledObject, RepScrub, RepScrubMap, SubOp, SubOpKind, WatchNotify,
};
use crate::network::{Destination, Message};
use crate::pg::{
    compare_scrub_maps, LockedPg, LogEntry, LogOp, ObjectDigest, PeeringState, PendingNotify,
    PgRef, PgState, RecoveryOp, RepGather, ScrubMap, WatchKey,
};
use crate::store::{is_pg_meta, pg_collection, ObjectStore};
use crate::types::{Eversion, OsdId, PgId};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Object attribute holding the version that last wrote the object.
pub(crate) const VERSION_ATTR: &str = "_version";

/// Log entries kept per PG after a write.
const LOG_KEEP: usize = 3000;

const SCRUB_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Version stamped on an object, or the zero version if it has none.
pub(crate) fn object_version(store: &dyn ObjectStore, cid: &str, oid: &str) -> Eversion {
    store
        .get_attr(cid, oid, VERSION_ATTR)
        .and_then(|raw| bincode::deserialize(&raw).ok())
        .unwrap_or_default()
}

/// Seconds since the Unix epoch, for scrub stamps.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn build_scrub_map(store: &dyn ObjectStore, pgid: PgId) -> ScrubMap {
    let cid = pg_collection(pgid);
    store
        .list_objects(&cid)
        .into_iter()
        .filter(|oid| !is_pg_meta(oid))
        .filter_map(|oid| {
            let data = store.read(&cid, &oid)?;
            let digest = ObjectDigest {
                size: data.len() as u64,
                crc: SCRUB_CRC.checksum(&data),
            };
            Some((oid, digest))
        })
        .collect()
}

/// Snapshot id of a clone named `name@snap`.
fn clone_snap(oid: &str) -> Option<u64> {
    let (_, snap) = oid.rsplit_once('@')?;
    snap.parse().ok()
}

impl Osd {
    // -- ops --

    pub(super) fn process_op_pg(&self, pg: PgRef) {
        let mut state = pg.lock_owned();
        let Some(req) = state.op_queue.pop_front() else {
            return;
        };
        match self.op_disposition(&state, &req) {
            Disposition::Process => {
                req.mark_event("reached_pg");
                if req.is_client() {
                    self.do_op(&mut state, req);
                } else {
                    self.do_sub_op(&mut state, req);
                }
            }
            Disposition::WaitForMap => {
                req.mark_event("waiting_for_map");
                state.waiting_for_map.push_back(req);
            }
            Disposition::WaitForActive => {
                req.mark_event("waiting_for_active");
                state.waiting_for_active.push_back(req);
            }
            Disposition::Discard => self.discard_op(req, "session_gone"),
            Disposition::Reject(err) => self.reply_error(req, err),
        }
        if !state.op_queue.is_empty() {
            self.queue_op_pg(&pg);
        }
    }

    fn do_op(&self, pg: &mut LockedPg, req: OpRequest) {
        let OpMessage::Client(op) = &req.msg else {
            return;
        };
        let (oid, kind) = (op.oid.clone(), op.kind.clone());

        let degraded = kind.is_write() && pg.peer_missing.values().any(|m| m.contains_key(&oid));
        if pg.missing.contains_key(&oid) || degraded {
            tracing::debug!(pgid = %pg.id(), oid, "op waiting for object recovery");
            req.mark_event("waiting_for_missing");
            pg.waiting_for_missing.entry(oid).or_default().push(req);
            return;
        }

        let cid = pg_collection(pg.id());
        let store = self.store.as_ref();
        match kind {
            OpKind::Read => {
                let result = store
                    .read(&cid, &oid)
                    .map(|data| OpOutput {
                        version: object_version(store, &cid, &oid),
                        data: Some(data),
                    })
                    .ok_or(OpError::NotFound);
                self.reply_op(req, result);
            }
            OpKind::Stat => {
                let result = if store.exists(&cid, &oid) {
                    Ok(OpOutput {
                        version: object_version(store, &cid, &oid),
                        data: None,
                    })
                } else {
                    Err(OpError::NotFound)
                };
                self.reply_op(req, result);
            }
            OpKind::Write { data } => self.apply_update(pg, req, oid, Some(data)),
            OpKind::Delete => {
                if store.exists(&cid, &oid) {
                    self.apply_update(pg, req, oid, None);
                } else {
                    self.reply_op(req, Err(OpError::NotFound));
                }
            }
            OpKind::Watch { cookie } => self.do_watch(pg, req, oid, cookie),
            OpKind::Unwatch { cookie } => self.do_unwatch(pg, req, oid, cookie),
            OpKind::Notify { payload } => self.do_notify(pg, req, oid, payload),
            OpKind::NotifyAck { notify_id, cookie } => {
                self.do_notify_ack(pg, req, notify_id, cookie)
            }
        }
    }

    /// Commit a client mutation locally, then replicate it.
    fn apply_update(&self, pg: &mut LockedPg, req: OpRequest, oid: String, data: Option<Bytes>) {
        let pgid = pg.id();
        let cid = pg_collection(pgid);
        let version = pg.next_version();
        let entry = LogEntry {
            version,
            oid: oid.clone(),
            op: if data.is_some() {
                LogOp::Modify
            } else {
                LogOp::Delete
            },
        };

        let saved = (pg.info.clone(), pg.log.clone());
        self.stage_update(pg, &cid, &entry, data.as_ref());
        let committed = self.commit_update(pg, &cid, &entry, data.clone());
        if let Err(e) = committed {
            tracing::error!(pgid = %pgid, oid, error = %e, "write failed to commit");
            let (info, log) = saved;
            pg.info = info;
            pg.log = log;
            self.reply_op(req, Err(OpError::Storage(e.to_string())));
            return;
        }
        req.mark_event("commit_local");
        let pg_ref = pg.pg().clone();
        self.queue_stats(&pg_ref);

        let replicas: BTreeSet<OsdId> = pg
            .replicas()
            .iter()
            .copied()
            .filter(|&o| o != self.whoami)
            .collect();
        if replicas.is_empty() {
            self.reply_op(req, Ok(OpOutput { version, data: None }));
            return;
        }

        let tid = self.next_tid();
        for &replica in &replicas {
            let sub = SubOp {
                tid,
                pgid,
                epoch: pg.epoch,
                kind: SubOpKind::Modify {
                    entry: entry.clone(),
                    data: data.clone(),
                },
            };
            self.send(Destination::Osd(replica), Message::SubOp(sub));
        }
        req.mark_event("waiting_for_replicas");
        pg.repops.insert(
            tid,
            RepGather {
                op: req,
                version,
                waiting_on: replicas,
            },
        );
    }

    /// Apply an update to the in-memory log, info and stats.
    fn stage_update(&self, pg: &mut PgState, cid: &str, entry: &LogEntry, data: Option<&Bytes>) {
        let old_size = self.store.read(cid, &entry.oid).map(|d| d.len() as u64);
        let stats = &mut pg.info.stats;
        if let Some(size) = old_size {
            stats.num_objects = stats.num_objects.saturating_sub(1);
            stats.num_bytes = stats.num_bytes.saturating_sub(size);
        }
        if let Some(data) = data {
            stats.num_objects += 1;
            stats.num_bytes += data.len() as u64;
        }

        pg.log.append(entry.clone());
        pg.info.last_update = entry.version;
        if pg.missing.is_empty() {
            pg.info.last_complete = entry.version;
        }
        if pg.log.trim_to_len(LOG_KEEP) > 0 {
            pg.info.log_tail = pg.log.tail();
        }
    }

    fn commit_update(
        &self,
        pg: &PgState,
        cid: &str,
        entry: &LogEntry,
        data: Option<Bytes>,
    ) -> crate::Result<()> {
        let mut tx = self.store.begin_transaction();
        match data {
            Some(data) => {
                tx.write(cid, entry.oid.as_str(), data);
                tx.set_attr(
                    cid,
                    entry.oid.as_str(),
                    VERSION_ATTR,
                    bincode::serialize(&entry.version)?,
                );
            }
            None => {
                tx.remove(cid, entry.oid.as_str());
            }
        }
        pg.write_meta(&mut tx)?;
        self.store.commit(tx)?;
        Ok(())
    }

    // -- watch/notify --

    fn do_watch(&self, pg: &mut LockedPg, req: OpRequest, oid: String, cookie: u64) {
        let cid = pg_collection(pg.id());
        if !self.store.exists(&cid, &oid) {
            self.reply_op(req, Err(OpError::NotFound));
            return;
        }
        let Some(session) = self.sessions.get(req.conn) else {
            self.discard_op(req, "session_gone");
            return;
        };
        // A reset that closed the session first never sees this watch.
        let registered = session.add_watch(WatchRef {
            pgid: pg.id(),
            oid: oid.clone(),
            cookie,
        });
        if !registered {
            self.discard_op(req, "session_gone");
            return;
        }
        let key = WatchKey {
            conn: req.conn,
            cookie,
        };
        pg.watchers
            .entry(oid.clone())
            .or_default()
            .insert(key, req.from);
        tracing::debug!(pgid = %pg.id(), oid, cookie, conn = req.conn, "watch registered");
        let version = object_version(self.store.as_ref(), &cid, &oid);
        self.reply_op(req, Ok(OpOutput { version, data: None }));
    }

    fn do_unwatch(&self, pg: &mut LockedPg, req: OpRequest, oid: String, cookie: u64) {
        let key = WatchKey {
            conn: req.conn,
            cookie,
        };
        if let Some(watchers) = pg.watchers.get_mut(&oid) {
            watchers.remove(&key);
            if watchers.is_empty() {
                pg.watchers.remove(&oid);
            }
        }
        if let Some(session) = self.sessions.get(req.conn) {
            session.remove_watch(&WatchRef {
                pgid: pg.id(),
                oid,
                cookie,
            });
        }
        self.reply_op(req, Ok(OpOutput::default()));
    }

    /// Send the payload to every watcher. The notifier is answered once
    /// all of them acknowledge or disconnect.
    fn do_notify(&self, pg: &mut LockedPg, req: OpRequest, oid: String, payload: Bytes) {
        let watchers: Vec<WatchKey> = pg
            .watchers
            .get(&oid)
            .map(|w| w.keys().copied().collect())
            .unwrap_or_default();
        if watchers.is_empty() {
            self.reply_op(req, Ok(OpOutput::default()));
            return;
        }

        let notify_id = self.next_notify_id.fetch_add(1, Ordering::Relaxed);
        for key in &watchers {
            let msg = Message::WatchNotify(WatchNotify {
                pgid: pg.id(),
                oid: oid.clone(),
                notify_id,
                cookie: key.cookie,
                payload: payload.clone(),
            });
            self.send(Destination::Conn(key.conn), msg);
        }
        tracing::debug!(pgid = %pg.id(), oid, notify_id, watchers = watchers.len(), "notify sent");
        req.mark_event("waiting_for_notify_acks");
        pg.notifies.insert(
            notify_id,
            PendingNotify {
                op: req,
                oid,
                waiting_on: watchers.into_iter().collect(),
            },
        );
    }

    fn do_notify_ack(&self, pg: &mut LockedPg, req: OpRequest, notify_id: u64, cookie: u64) {
        let key = WatchKey {
            conn: req.conn,
            cookie,
        };
        let done = match pg.notifies.get_mut(&notify_id) {
            Some(notify) => notify.waiting_on.remove(&key) && notify.waiting_on.is_empty(),
            None => false,
        };
        if done {
            if let Some(notify) = pg.notifies.remove(&notify_id) {
                self.reply_op(notify.op, Ok(OpOutput::default()));
            }
        }
        self.reply_op(req, Ok(OpOutput::default()));
    }

    // -- sub-ops --

    fn do_sub_op(&self, pg: &mut LockedPg, req: OpRequest) {
        let OpMessage::Sub(op) = &req.msg else {
            return;
        };
        let kind = op.kind.clone();
        let cid = pg_collection(pg.id());
        match kind {
            SubOpKind::Modify { entry, data } => {
                if entry.version <= pg.log.head() {
                    tracing::debug!(pgid = %pg.id(), version = %entry.version, "duplicate replicated write");
                    self.reply_sub_op(req, Ok(None));
                    return;
                }
                let saved = (pg.info.clone(), pg.log.clone());
                self.stage_update(pg, &cid, &entry, data.as_ref());
                if let Err(e) = self.commit_update(pg, &cid, &entry, data) {
                    tracing::error!(pgid = %pg.id(), oid = entry.oid, error = %e, "replicated write failed");
                    let (info, log) = saved;
                    pg.info = info;
                    pg.log = log;
                    self.reply_sub_op(req, Err(OpError::Storage(e.to_string())));
                    return;
                }
                pg.object_recovered(&entry.oid);
                self.reply_sub_op(req, Ok(None));
            }
            SubOpKind::Push { oid, version, data } => {
                let pulled = PulledObject { oid, version, data };
                let result = self
                    .apply_recovered(pg, pulled)
                    .map(|_| None)
                    .map_err(|e| OpError::Storage(e.to_string()));
                self.reply_sub_op(req, result);
            }
            SubOpKind::Pull { oid } => {
                let store = self.store.as_ref();
                let pulled = PulledObject {
                    version: object_version(store, &cid, &oid),
                    data: store.read(&cid, &oid),
                    oid,
                };
                self.reply_sub_op(req, Ok(Some(pulled)));
            }
        }
    }

    // -- recovery --

    /// Install a recovered object and release ops waiting on it.
    pub(crate) fn apply_recovered(
        &self,
        pg: &mut PgState,
        obj: PulledObject,
    ) -> crate::Result<()> {
        let cid = pg_collection(pg.pgid());
        let store = self.store.as_ref();
        let existing = store.read(&cid, &obj.oid);
        let stale = existing.is_some() && object_version(store, &cid, &obj.oid) >= obj.version;

        if !stale {
            let mut tx = self.store.begin_transaction();
            let mut new_stats = pg.info.stats.clone();
            if let Some(old) = &existing {
                new_stats.num_objects = new_stats.num_objects.saturating_sub(1);
                new_stats.num_bytes = new_stats.num_bytes.saturating_sub(old.len() as u64);
            }
            match &obj.data {
                Some(data) => {
                    tx.write(cid.as_str(), obj.oid.as_str(), data.clone());
                    tx.set_attr(
                        cid.as_str(),
                        obj.oid.as_str(),
                        VERSION_ATTR,
                        bincode::serialize(&obj.version)?,
                    );
                    new_stats.num_objects += 1;
                    new_stats.num_bytes += data.len() as u64;
                }
                None if existing.is_some() => {
                    tx.remove(cid.as_str(), obj.oid.as_str());
                }
                None => {}
            }
            if !tx.is_empty() {
                self.store.commit(tx)?;
            }
            pg.info.stats = new_stats;
        }

        pg.object_recovered(&obj.oid);
        self.release_missing_waiters(pg, &obj.oid);
        self.persist_meta(pg);
        tracing::debug!(pgid = %pg.pgid(), oid = obj.oid, version = %obj.version, "object recovered");
        Ok(())
    }

    /// Requeue ops waiting on `oid` once no copy lacks it.
    pub(crate) fn release_missing_waiters(&self, pg: &mut PgState, oid: &str) -> usize {
        if pg.missing.contains_key(oid) || pg.peer_missing.values().any(|m| m.contains_key(oid)) {
            return 0;
        }
        let Some(ops) = pg.waiting_for_missing.remove(oid) else {
            return 0;
        };
        let n = ops.len();
        for op in ops.into_iter().rev() {
            pg.op_queue.push_front(op);
        }
        n
    }

    pub(super) fn process_recovery(&self, pg: PgRef) {
        let mut state = pg.lock_owned();
        if !state.is_primary() || !state.is_active() {
            return;
        }

        let in_flight: BTreeSet<String> =
            state.recovering.values().map(|op| op.oid().to_string()).collect();
        let mut candidates: Vec<RecoveryOp> = Vec::new();
        for oid in state.missing.keys() {
            if in_flight.contains(oid) {
                continue;
            }
            let source = state.pull_source.or_else(|| {
                state
                    .replicas()
                    .iter()
                    .copied()
                    .find(|r| *r != self.whoami && state.peer_missing.get(r).map_or(true, |m| !m.contains_key(oid)))
            });
            if let Some(from) = source {
                candidates.push(RecoveryOp::Pull {
                    oid: oid.clone(),
                    from,
                });
            }
        }
        for (&peer, missing) in &state.peer_missing {
            for oid in missing.keys() {
                // Pulled first, then pushed.
                if in_flight.contains(oid) || state.missing.contains_key(oid) {
                    continue;
                }
                candidates.push(RecoveryOp::Push {
                    oid: oid.clone(),
                    to: peer,
                });
            }
        }
        if candidates.is_empty() {
            return;
        }

        let want = candidates.len().min(self.config.recovery.max_chunk);
        let granted = self.recovery_gate.try_start(want);
        if granted < candidates.len() {
            self.queue_recovery(&pg);
        }
        if granted == 0 {
            return;
        }

        let pgid = state.id();
        let cid = pg_collection(pgid);
        for op in candidates.into_iter().take(granted) {
            let tid = self.next_tid();
            let (to, kind) = match &op {
                RecoveryOp::Pull { oid, from } => (*from, SubOpKind::Pull { oid: oid.clone() }),
                RecoveryOp::Push { oid, to } => {
                    let version = state
                        .peer_missing
                        .get(to)
                        .and_then(|m| m.get(oid))
                        .copied()
                        .unwrap_or_default();
                    let data = self.store.read(&cid, oid);
                    (
                        *to,
                        SubOpKind::Push {
                            oid: oid.clone(),
                            version,
                            data,
                        },
                    )
                }
            };
            tracing::debug!(pgid = %pgid, tid, op = ?op, "starting recovery op");
            state.recovering.insert(tid, op);
            let sub = SubOp {
                tid,
                pgid,
                epoch: state.epoch,
                kind,
            };
            self.send(Destination::Osd(to), Message::SubOp(sub));
        }
    }

    // -- snap trim --

    /// Remove `name@snap` clones of every queued removed snapshot.
    pub(super) fn process_snap_trim(&self, pg: PgRef) {
        let mut state = pg.lock_owned();
        if !state.is_active() || state.snap_trimq.is_empty() {
            return;
        }
        let pgid = state.id();
        let cid = pg_collection(pgid);
        let snaps = std::mem::take(&mut state.snap_trimq);
        let saved = state.info.clone();

        let mut tx = self.store.begin_transaction();
        let mut trimmed = 0u64;
        for oid in self.store.list_objects(&cid) {
            if is_pg_meta(&oid) || !clone_snap(&oid).is_some_and(|s| snaps.contains(&s)) {
                continue;
            }
            let size = self.store.read(&cid, &oid).map_or(0, |d| d.len() as u64);
            let stats = &mut state.info.stats;
            stats.num_objects = stats.num_objects.saturating_sub(1);
            stats.num_bytes = stats.num_bytes.saturating_sub(size);
            tx.remove(cid.as_str(), oid);
            trimmed += 1;
        }
        state.info.purged_snaps.extend(snaps.iter().copied());

        let committed = state
            .write_meta(&mut tx)
            .and_then(|_| self.store.commit(tx).map_err(Into::into));
        if let Err(e) = committed {
            tracing::error!(pgid = %pgid, error = %e, "snap trim failed to commit");
            state.info = saved;
            state.snap_trimq.extend(snaps);
            return;
        }
        self.metrics.snaps_trimmed.inc_by(trimmed);
        tracing::info!(pgid = %pgid, snaps = ?snaps, clones = trimmed, "trimmed snapshots");
        if state.is_primary() {
            self.queue_stats(&pg);
        }
    }

    // -- scrub --

    /// Reserve scrub slots for primaries that are due.
    pub(super) fn sched_scrub(&self) {
        let now = unix_now();
        let interval = self.config.scrub.min_interval.as_secs();
        for pg in self.registry.all() {
            let mut state = pg.lock();
            if !state.is_primary()
                || !state.is_active()
                || state.scrub.reserved
                || state.needs_recovery()
            {
                continue;
            }
            let due = state.scrub.must_scrub
                || now.saturating_sub(state.info.history.last_scrub_stamp) >= interval;
            if !due {
                continue;
            }
            if !self.try_reserve_scrub_slot() {
                tracing::debug!(pgid = %pg.id(), "no scrub slot free");
                break;
            }
            state.scrub.reserved = true;
            drop(state);
            self.queue_scrub(&pg);
        }
    }

    /// Build the primary's scrub map and ask replicas for theirs.
    pub(super) fn process_scrub(&self, pg: PgRef) {
        let mut state = pg.lock_owned();
        if !state.scrub.reserved || state.scrub.active {
            return;
        }
        if !state.is_primary() || !state.is_active() {
            if state.scrub.reset() {
                self.release_scrub_slot();
            }
            return;
        }
        if !state.repops.is_empty() {
            // Replicas would disagree about in-flight writes. The last
            // replica reply queues the scrub again.
            tracing::debug!(pgid = %state.id(), repops = state.repops.len(), "scrub waiting for writes");
            state.scrub.blocked_on_writes = true;
            return;
        }

        let pgid = state.id();
        state.scrub.active = true;
        state.scrub.must_scrub = false;
        state.scrub.local = build_scrub_map(self.store.as_ref(), pgid);
        let replicas: BTreeSet<OsdId> = state
            .replicas()
            .iter()
            .copied()
            .filter(|&o| o != self.whoami)
            .collect();
        tracing::info!(pgid = %pgid, objects = state.scrub.local.len(), "scrub started");
        for &replica in &replicas {
            let req = RepScrub {
                pgid,
                epoch: state.epoch,
            };
            self.send(Destination::Osd(replica), Message::RepScrub(req));
        }
        let waiting = !replicas.is_empty();
        state.scrub.waiting_on = replicas;
        if !waiting {
            drop(state);
            self.queue_scrub_finalize(&pg);
        }
    }

    /// A primary asked for this replica's scrub map.
    pub(super) fn process_rep_scrub(&self, (from, req): (OsdId, RepScrub)) {
        let Some(pg) = self.registry.lookup_locked(req.pgid) else {
            return;
        };
        if pg.is_from_old_interval(req.epoch) || pg.primary() != Some(from) {
            tracing::debug!(pgid = %req.pgid, from, "ignoring stale scrub request");
            return;
        }
        let map = build_scrub_map(self.store.as_ref(), req.pgid);
        let epoch = pg.epoch;
        drop(pg);
        let reply = RepScrubMap {
            pgid: req.pgid,
            epoch,
            map,
        };
        self.send(Destination::Osd(from), Message::RepScrubMap(reply));
    }

    /// Compare the collected maps and record the result.
    pub(super) fn process_scrub_finalize(&self, pg: PgRef) {
        let mut state = pg.lock_owned();
        if !state.scrub.active || !state.scrub.waiting_on.is_empty() {
            return;
        }
        let errors = {
            let replicas: Vec<&ScrubMap> = state.scrub.received.values().collect();
            compare_scrub_maps(&state.scrub.local, &replicas)
        };
        let pgid = state.id();
        state.info.stats.num_scrub_errors = errors as u64;
        state.info.history.last_scrub_stamp = unix_now();
        let reserved = state.scrub.reset();
        self.persist_meta(&state);
        drop(state);

        if reserved {
            self.release_scrub_slot();
        }
        self.metrics.scrubs_completed.inc();
        if errors > 0 {
            self.metrics.scrub_errors.inc_by(errors as u64);
            tracing::warn!(pgid = %pgid, errors, "scrub found inconsistencies");
        } else {
            tracing::info!(pgid = %pgid, "scrub ok");
        }
        self.queue_stats(&pg);
    }

    // -- removal --

    /// Tear down a PG marked for removal.
    pub(super) fn process_remove(&self, pg: PgRef) {
        self.queues.dequeue_pg_everywhere(&pg);
        self.reporter.dequeue_pg(&pg);

        let pgid = pg.id();
        let mut state = pg.lock_owned();
        if state.peering != PeeringState::Removing {
            return;
        }
        let cid = pg_collection(pgid);
        if self.store.collection_exists(&cid) {
            let mut tx = self.store.begin_transaction();
            tx.remove_collection(cid);
            if let Err(e) = self.store.commit(tx) {
                tracing::error!(pgid = %pgid, error = %e, "pg removal failed, will retry");
                return;
            }
        }

        let ops = state.take_all_ops();
        let recovering = state.recovering.len();
        state.recovering.clear();
        let scrub_reserved = state.scrub.reset();
        state.watchers.clear();
        state.peering = PeeringState::Removed;
        drop(state);

        if recovering > 0 {
            self.recovery_gate.finish(recovering);
        }
        if scrub_reserved {
            self.release_scrub_slot();
        }
        self.registry.remove(&pg);
        self.metrics.pgs_removed.inc();
        tracing::info!(pgid = %pgid, failed_ops = ops.len(), "pg removed");

        let primary = self.osdmap().primary_of(pgid);
        for op in ops {
            let err = if op.is_client() {
                OpError::Misdirected { primary }
            } else {
                OpError::NoSuchPg(pgid)
            };
            self.reply_error(op, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OsdConfig, ScrubConfig};
    use crate::network::messages::{OsdOp, OsdOpReply};
    use crate::osd::OsdCaps;
    use crate::store::MemStore;
    use crate::testing::{active_node, create_pg, MapBuilder, RecordingTransport};
    use crate::types::EntityName;
    use std::sync::Arc;
    use std::time::Duration;

    const CONN: u64 = 7;

    fn single_node() -> (Arc<Osd>, Arc<MemStore>, Arc<RecordingTransport>) {
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        let (osd, store, transport) = active_node(OsdConfig::new(0), &map);
        osd.handle_connect(CONN, EntityName::client(1), OsdCaps::all());
        (osd, store, transport)
    }

    fn replies(transport: &RecordingTransport) -> Vec<OsdOpReply> {
        transport
            .take()
            .into_iter()
            .filter_map(|(_, m)| match m {
                Message::OsdOpReply(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn submit(osd: &Osd, pgid: PgId, oid: &str, kind: OpKind) {
        let op = OsdOp {
            tid: 1,
            pgid,
            oid: oid.to_string(),
            epoch: osd.epoch(),
            kind,
        };
        osd.dispatch(crate::network::Envelope::new(
            EntityName::client(1),
            CONN,
            Message::OsdOp(op),
        ));
        assert!(osd.wait_for_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_write_then_read() {
        let (osd, store, transport) = single_node();
        let pgid = PgId::new(1, 0);
        create_pg(&osd, pgid);
        transport.take();

        submit(&osd, pgid, "a", OpKind::Write { data: Bytes::from_static(b"hello") });
        let reply = replies(&transport).pop().unwrap();
        let version = reply.result.unwrap().version;
        assert_eq!(version.version, 1);
        assert_eq!(store.read(&pg_collection(pgid), "a").unwrap(), Bytes::from_static(b"hello"));

        submit(&osd, pgid, "a", OpKind::Read);
        let reply = replies(&transport).pop().unwrap();
        let output = reply.result.unwrap();
        assert_eq!(output.version, version);
        assert_eq!(output.data.unwrap(), Bytes::from_static(b"hello"));

        let pg = osd.registry().lookup(pgid).unwrap();
        let state = pg.lock();
        assert_eq!(state.info.last_update, version);
        assert_eq!(state.info.stats.num_objects, 1);
        assert_eq!(state.info.stats.num_bytes, 5);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let (osd, store, transport) = single_node();
        let pgid = PgId::new(1, 0);
        create_pg(&osd, pgid);
        transport.take();

        store.fail_next_commits(1);
        submit(&osd, pgid, "a", OpKind::Write { data: Bytes::from_static(b"x") });
        let reply = replies(&transport).pop().unwrap();
        assert!(matches!(reply.result, Err(OpError::Storage(_))));

        let pg = osd.registry().lookup(pgid).unwrap();
        let state = pg.lock();
        assert_eq!(state.info.last_update, Eversion::default());
        assert!(state.log.is_empty());
        assert!(!store.exists(&pg_collection(pgid), "a"));
    }

    #[test]
    fn test_delete_missing_object() {
        let (osd, _, transport) = single_node();
        let pgid = PgId::new(1, 1);
        create_pg(&osd, pgid);
        transport.take();

        submit(&osd, pgid, "nope", OpKind::Delete);
        let reply = replies(&transport).pop().unwrap();
        assert_eq!(reply.result, Err(OpError::NotFound));
    }

    #[test]
    fn test_notify_waits_for_watchers() {
        let (osd, _, transport) = single_node();
        let pgid = PgId::new(1, 2);
        create_pg(&osd, pgid);
        submit(&osd, pgid, "obj", OpKind::Write { data: Bytes::from_static(b"v") });
        submit(&osd, pgid, "obj", OpKind::Watch { cookie: 9 });
        transport.take();

        submit(&osd, pgid, "obj", OpKind::Notify { payload: Bytes::from_static(b"ping") });
        let sent = transport.take();
        let notify_id = sent
            .iter()
            .find_map(|(_, m)| match m {
                Message::WatchNotify(n) => Some(n.notify_id),
                _ => None,
            })
            .unwrap();
        assert!(!sent.iter().any(|(_, m)| matches!(m, Message::OsdOpReply(_))));

        submit(&osd, pgid, "obj", OpKind::NotifyAck { notify_id, cookie: 9 });
        // The notifier and the ack are both answered.
        assert_eq!(replies(&transport).len(), 2);
    }

    #[test]
    fn test_disconnect_completes_notify() {
        let (osd, _, transport) = single_node();
        let pgid = PgId::new(1, 2);
        create_pg(&osd, pgid);
        submit(&osd, pgid, "obj", OpKind::Write { data: Bytes::from_static(b"v") });

        // A second client watches, the first notifies.
        osd.handle_connect(8, EntityName::client(2), OsdCaps::all());
        let watch = OsdOp {
            tid: 2,
            pgid,
            oid: "obj".to_string(),
            epoch: osd.epoch(),
            kind: OpKind::Watch { cookie: 1 },
        };
        osd.dispatch(crate::network::Envelope::new(
            EntityName::client(2),
            8,
            Message::OsdOp(watch),
        ));
        assert!(osd.wait_for_idle(Duration::from_secs(5)));
        submit(&osd, pgid, "obj", OpKind::Notify { payload: Bytes::new() });
        transport.take();

        assert!(osd.handle_reset(8));
        let done = replies(&transport);
        assert_eq!(done.len(), 1);
        assert!(done[0].result.is_ok());
        assert!(osd.registry().lookup(pgid).unwrap().lock().watchers.is_empty());
    }

    #[test]
    fn test_watch_on_closed_session_is_not_registered() {
        let (osd, _, transport) = single_node();
        let pgid = PgId::new(1, 3);
        create_pg(&osd, pgid);
        submit(&osd, pgid, "obj", OpKind::Write { data: Bytes::from_static(b"v") });

        // The session is closed by a reset after the worker looked it up.
        osd.handle_connect(8, EntityName::client(2), OsdCaps::all());
        let session = osd.sessions().get(8).unwrap();
        assert!(session.close().is_empty());
        transport.take();

        let watch = OsdOp {
            tid: 3,
            pgid,
            oid: "obj".to_string(),
            epoch: osd.epoch(),
            kind: OpKind::Watch { cookie: 1 },
        };
        osd.dispatch(crate::network::Envelope::new(
            EntityName::client(2),
            8,
            Message::OsdOp(watch),
        ));
        assert!(osd.wait_for_idle(Duration::from_secs(5)));

        assert!(replies(&transport).is_empty());
        assert_eq!(osd.metrics().ops_discarded.get("session_gone"), 1);
        assert!(osd.registry().lookup(pgid).unwrap().lock().watchers.is_empty());
        assert!(osd.op_tracker().is_empty());
    }

    #[test]
    fn test_snap_trim_removes_clones() {
        let (osd, store, transport) = single_node();
        let pgid = PgId::new(1, 0);
        create_pg(&osd, pgid);
        for oid in ["a", "a@3", "a@4", "b@3"] {
            submit(&osd, pgid, oid, OpKind::Write { data: Bytes::from_static(b"x") });
        }
        transport.take();

        let pg = osd.registry().lookup(pgid).unwrap();
        pg.lock().snap_trimq.insert(3);
        osd.queue_snap_trim(&pg);
        assert!(osd.wait_for_idle(Duration::from_secs(5)));

        let cid = pg_collection(pgid);
        assert!(store.exists(&cid, "a"));
        assert!(store.exists(&cid, "a@4"));
        assert!(!store.exists(&cid, "a@3"));
        assert!(!store.exists(&cid, "b@3"));
        let state = pg.lock();
        assert!(state.info.purged_snaps.contains(&3));
        assert_eq!(state.info.stats.num_objects, 2);
        assert_eq!(osd.metrics().snaps_trimmed.get(), 2);
    }

    #[test]
    fn test_single_copy_scrub_completes() {
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        let config = OsdConfig::new(0).with_scrub_config(ScrubConfig {
            max_scrubs: 1,
            min_interval: Duration::ZERO,
        });
        let (osd, _, _) = active_node(config, &map);
        let pgid = PgId::new(1, 3);
        create_pg(&osd, pgid);

        osd.sched_scrub();
        assert!(osd.wait_for_idle(Duration::from_secs(5)));

        assert_eq!(osd.scrubs_in_progress(), 0);
        assert_eq!(osd.metrics().scrubs_completed.get(), 1);
        let pg = osd.registry().lookup(pgid).unwrap();
        let state = pg.lock();
        assert!(!state.scrub.active);
        assert_eq!(state.info.stats.num_scrub_errors, 0);
        assert!(state.info.history.last_scrub_stamp > 0);
    }

    #[test]
    fn test_scrub_map_detects_corruption() {
        let store = MemStore::new();
        let pgid = PgId::new(1, 0);
        let cid = pg_collection(pgid);
        let mut tx = store.begin_transaction();
        tx.create_collection(cid.as_str());
        tx.write(cid.as_str(), "a", Bytes::from_static(b"good"));
        store.commit(tx).unwrap();
        let primary = build_scrub_map(&store, pgid);

        let mut tx = store.begin_transaction();
        tx.write(cid.as_str(), "a", Bytes::from_static(b"bad!"));
        store.commit(tx).unwrap();
        let replica = build_scrub_map(&store, pgid);

        assert_eq!(primary["a"].size, replica["a"].size);
        assert_eq!(compare_scrub_maps(&primary, &[&replica]), 1);
    }

    #[test]
    fn test_clone_snap_parsing() {
        assert_eq!(clone_snap("obj@12"), Some(12));
        assert_eq!(clone_snap("a@b@3"), Some(3));
        assert_eq!(clone_snap("obj"), None);
        assert_eq!(clone_snap("obj@head"), None);
    }
}
