//! Peering control messages and PG creation.

use super::workers::{object_version, unix_now};
use super::Osd;
use crate::map::OsdMap;
use crate::network::messages::{PgCreate, PgLogMsg, PgNotify, PgQuery, PgRemove, QueryKind};
use crate::network::Destination;
use crate::pg::peering::Activation;
use crate::pg::{MissingSet, PeeringBatch, PgHistory, PgInfo, PgRef, PgSpec, PgState};
use crate::store::{is_pg_meta, pg_collection};
use crate::types::{Epoch, OsdId, PgId};

impl Osd {
    pub(super) fn handle_pg_notify(&self, from: OsdId, notify: PgNotify) {
        let mut batch = PeeringBatch::new();
        for info in notify.infos {
            let pgid = info.pgid;
            let Some(mut pg) = self.registry.lookup_locked(pgid) else {
                tracing::debug!(pgid = %pgid, from, "notify for unknown pg");
                continue;
            };
            if pg.is_from_old_interval(notify.epoch) {
                tracing::debug!(pgid = %pgid, from, epoch = notify.epoch, "notify from old interval");
                continue;
            }
            let activation =
                pg.handle_info(from, info, self.whoami, &mut batch, &|| self.backfill_missing(pgid));
            if let Some(activation) = activation {
                let pg_ref = pg.pg().clone();
                self.persist_meta(&pg);
                self.after_activation(&pg_ref, &pg, activation);
            }
        }
        self.send_batch(batch, self.epoch());
    }

    pub(super) fn handle_pg_query(&self, from: OsdId, query: PgQuery) {
        let mut batch = PeeringBatch::new();
        for (pgid, kind) in query.queries {
            if let Some(pg) = self.registry.lookup_locked(pgid) {
                pg.handle_query(from, kind, &mut batch);
                continue;
            }
            // Nothing hosted here: answer as an empty copy.
            match kind {
                QueryKind::Info => batch.notify(from, PgInfo::new(pgid)),
                QueryKind::Log { .. } => batch.log(
                    from,
                    PgLogMsg {
                        epoch: self.epoch(),
                        info: PgInfo::new(pgid),
                        entries: Vec::new(),
                    },
                ),
            }
        }
        self.send_batch(batch, self.epoch());
    }

    pub(super) fn handle_pg_log(&self, from: OsdId, msg: PgLogMsg) {
        let pgid = msg.info.pgid;
        let mut pg = match self.registry.lookup_locked(pgid) {
            Some(pg) => pg,
            None => {
                let map = self.osdmap();
                if !map.pg_to_up_acting(pgid).1.contains(&self.whoami) {
                    tracing::debug!(pgid = %pgid, from, "log for a pg we do not serve");
                    return;
                }
                let spec = PgSpec::from_map(pgid, &map, self.whoami, msg.info.history);
                let mut pg = match self.registry.get_or_create(self.store.as_ref(), spec) {
                    Ok((pg, _)) => pg,
                    Err(e) => {
                        tracing::error!(pgid = %pgid, error = %e, "failed to create replica pg");
                        return;
                    }
                };
                pg.advance_map(&map, self.whoami);
                // Same interval as the primary that sent the log.
                pg.info.history.same_interval_since = msg.info.history.same_interval_since;
                pg.info.history.same_primary_since = msg.info.history.same_primary_since;
                pg
            }
        };
        if pg.is_from_old_interval(msg.epoch) {
            tracing::debug!(pgid = %pgid, from, epoch = msg.epoch, "log from old interval");
            return;
        }

        let mut batch = PeeringBatch::new();
        let activation =
            pg.handle_log(from, msg, self.whoami, &mut batch, &|| self.backfill_missing(pgid));
        if let Some(activation) = activation {
            let pg_ref = pg.pg().clone();
            self.persist_meta(&pg);
            self.after_activation(&pg_ref, &pg, activation);
        }
        drop(pg);
        self.send_batch(batch, self.epoch());
    }

    pub(super) fn handle_pg_remove(&self, from: OsdId, msg: PgRemove) {
        for pgid in msg.pgs {
            let Some(pg) = self.registry.lookup(pgid) else {
                continue;
            };
            let stray = {
                let state = pg.lock();
                !state.is_from_old_interval(msg.epoch) && !state.acting.contains(&self.whoami)
            };
            if stray {
                tracing::info!(pgid = %pgid, from, "primary told us to remove stray copy");
                self.queue_for_removal(&pg);
            }
        }
    }

    /// The monitor asked for PGs of a new or grown pool.
    pub(super) fn handle_pg_create(&self, create: PgCreate) {
        let _guard = self.map_lock.lock();
        let map = self.osdmap();
        if create.epoch > map.epoch {
            for (pgid, created) in create.pgs {
                self.registry.add_creating(pgid, created);
            }
            drop(_guard);
            self.request_map(create.epoch);
            return;
        }
        for (pgid, created) in create.pgs {
            self.instantiate_pg(pgid, created, &map);
        }
    }

    /// Create, advance and start peering a PG the monitor asked for.
    ///
    /// Requests that cannot be served yet are remembered and retried on the
    /// next map. Returns true if the PG exists afterwards.
    pub(super) fn instantiate_pg(&self, pgid: PgId, created: Epoch, map: &OsdMap) -> bool {
        if !map.pg_exists(pgid) {
            if map.pool(pgid.pool).is_some() || created > map.epoch {
                self.registry.add_creating(pgid, created);
            }
            return false;
        }
        if map.primary_of(pgid) != Some(self.whoami) {
            tracing::debug!(pgid = %pgid, "not primary for new pg, ignoring create");
            return false;
        }
        if !self.is_active() {
            self.registry.add_creating(pgid, created);
            return false;
        }

        let history = PgHistory {
            epoch_created: created,
            last_scrub_stamp: unix_now(),
            ..Default::default()
        };
        let spec = PgSpec::from_map(pgid, map, self.whoami, history);
        let (mut pg, created_now) = match self.registry.get_or_create(self.store.as_ref(), spec) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(pgid = %pgid, error = %e, "failed to create pg, will retry");
                self.registry.add_creating(pgid, created);
                return false;
            }
        };
        if !created_now {
            return true;
        }
        self.metrics.pgs_created.inc();

        pg.advance_map(map, self.whoami);
        let mut batch = PeeringBatch::new();
        let activation =
            pg.start_peering(self.whoami, &mut batch, &|| self.backfill_missing(pgid));
        let pg_ref = pg.pg().clone();
        self.persist_meta(&pg);
        if let Some(activation) = activation {
            self.after_activation(&pg_ref, &pg, activation);
        }
        drop(pg);
        self.send_batch(batch, map.epoch);
        self.requeue_pg_waiters(pgid);
        true
    }

    /// Follow-up work once a PG goes active. Runs under the PG lock.
    pub(super) fn after_activation(&self, pg: &PgRef, state: &PgState, activation: Activation) {
        if !state.op_queue.is_empty() {
            self.queue_op_pg(pg);
        }
        if state.is_primary() {
            if activation.needs_recovery {
                self.queue_recovery(pg);
            } else {
                self.queue_stats(pg);
            }
        }
    }

    pub(crate) fn persist_meta(&self, state: &PgState) {
        if let Err(e) = self.commit_meta(state) {
            tracing::error!(pgid = %state.pgid(), error = %e, "failed to persist pg meta");
        }
    }

    /// Write the PG's info and log in one transaction.
    pub(crate) fn commit_meta(&self, state: &PgState) -> crate::Result<()> {
        let mut tx = self.store.begin_transaction();
        state.write_meta(&mut tx)?;
        self.store.commit(tx)?;
        Ok(())
    }

    pub(super) fn send_batch(&self, batch: PeeringBatch, epoch: Epoch) {
        if batch.is_empty() {
            return;
        }
        for (to, msg) in batch.into_messages(epoch) {
            if to == self.whoami {
                continue;
            }
            self.send(Destination::Osd(to), msg);
        }
    }

    /// Every object this node holds for `pgid`, for peers whose log is too
    /// far behind to catch up from.
    pub(crate) fn backfill_missing(&self, pgid: PgId) -> MissingSet {
        let cid = pg_collection(pgid);
        self.store
            .list_objects(&cid)
            .into_iter()
            .filter(|oid| !is_pg_meta(oid))
            .map(|oid| {
                let version = object_version(self.store.as_ref(), &cid, &oid);
                (oid, version)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::OsdConfig;
    use crate::network::messages::{PgCreate, PgQuery, QueryKind};
    use crate::network::{Destination, Envelope, Message};
    use crate::osd::Osd;
    use crate::testing::{active_node, MapBuilder, RecordingTransport};
    use crate::types::{EntityName, PgId};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn node(osds: u32, size: usize) -> (Arc<Osd>, Arc<RecordingTransport>) {
        let map = MapBuilder::new(osds).pool(1, 4, size).build();
        let (osd, _, transport) = active_node(OsdConfig::new(0), &map);
        (osd, transport)
    }

    #[test]
    fn test_query_for_unknown_pg_gets_empty_info() {
        let (osd, transport) = node(2, 2);
        let query = PgQuery {
            epoch: 1,
            queries: vec![(PgId::new(1, 3), QueryKind::Info)],
        };
        osd.dispatch(Envelope::new(EntityName::osd(1), 9, Message::PgQuery(query)));

        let sent = transport.take();
        match &sent[..] {
            [(Destination::Osd(1), Message::PgNotify(notify))] => {
                assert_eq!(notify.infos.len(), 1);
                assert!(notify.infos[0].is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_create_single_replica_pg_activates() {
        let (osd, _) = node(1, 1);
        let pgid = PgId::new(1, 2);
        let create = PgCreate {
            epoch: 1,
            pgs: BTreeMap::from([(pgid, 1)]),
        };
        osd.dispatch(Envelope::new(EntityName::mon(0), 1, Message::PgCreate(create)));

        let pg = osd.registry().lookup(pgid).unwrap();
        let state = pg.lock();
        assert!(state.is_active());
        assert!(state.is_primary());
        assert_eq!(state.info.history.epoch_created, 1);
        assert_eq!(osd.metrics().pgs_created.get(), 1);
    }

    #[test]
    fn test_create_ahead_of_map_is_deferred() {
        let (osd, transport) = node(1, 1);
        let pgid = PgId::new(1, 1);
        let create = PgCreate {
            epoch: 3,
            pgs: BTreeMap::from([(pgid, 3)]),
        };
        osd.dispatch(Envelope::new(EntityName::mon(0), 1, Message::PgCreate(create)));
        assert!(osd.registry().lookup(pgid).is_none());
        assert!(osd.registry().is_creating(pgid));
        assert!(transport
            .take()
            .iter()
            .any(|(_, m)| matches!(m, Message::MapSubscribe { .. })));
    }
}
