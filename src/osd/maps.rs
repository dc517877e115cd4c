//! Map advance.
//!
//! New maps are persisted together with the superblock before anything
//! else happens; only then are PGs split and advanced epoch by epoch, and
//! only after every PG has been advanced is the new map published as the
//! node's current map. Messages parked on a newer epoch are re-dispatched
//! once the map lock is released.

use super::{NodeState, Osd, Parked};
use crate::map::{full_map_oid, inc_map_oid, Incremental, OsdMap};
use crate::network::messages::MapUpdate;
use crate::network::{Destination, Message};
use crate::pg::{PeeringBatch, PgRef};
use crate::store::{read_decoded, META_COLLECTION};
use crate::map::SUPERBLOCK_OID;
use crate::types::{Epoch, OsdId, PgId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Osd {
    /// Ask the monitor for maps newer than the current one.
    pub(crate) fn request_map(&self, want: Epoch) {
        if self.map_requested.fetch_max(want, Ordering::SeqCst) >= want {
            return;
        }
        let start = self.epoch() + 1;
        tracing::debug!(want, start, "subscribing to maps");
        self.send(Destination::Mon, Message::MapSubscribe { start });
    }

    /// Re-send the subscription if messages are still parked on a newer map.
    pub(crate) fn rerequest_maps(&self) {
        let want = self
            .waiting_for_osdmap
            .lock()
            .iter()
            .map(Parked::epoch)
            .max();
        if let Some(want) = want {
            self.map_requested.store(self.epoch(), Ordering::SeqCst);
            self.request_map(want);
        }
    }

    /// The map at `epoch`, from the cache or the store.
    pub fn get_map(&self, epoch: Epoch) -> crate::Result<Arc<OsdMap>> {
        match self.map_cache.get_map(epoch) {
            Ok(map) => Ok(map),
            Err(cache_err) => {
                let stored: Option<OsdMap> =
                    read_decoded(self.store.as_ref(), META_COLLECTION, &full_map_oid(epoch))?;
                let map = Arc::new(stored.ok_or(cache_err)?);
                Ok(map)
            }
        }
    }

    /// Send `dest` what it needs to get from `since` to the current epoch.
    ///
    /// Incrementals when the cache still has all of them and the gap is
    /// small, otherwise the current full map.
    pub(crate) fn share_map(&self, dest: Destination, since: Epoch) {
        let current = self.epoch();
        if since >= current {
            return;
        }
        let mut update = MapUpdate::default();
        let gap = (current - since) as usize;
        let incrementals = (since > 0 && gap <= self.config.map_share_max_epochs)
            .then(|| self.map_cache.get_incremental(since, current).ok())
            .flatten();
        match incrementals {
            Some(incs) => {
                for inc in incs {
                    update.incrementals.insert(inc.epoch, inc);
                }
            }
            None => {
                update.full.insert(current, self.osdmap().as_ref().clone());
            }
        }
        tracing::debug!(dest = ?dest, since, current, "sharing map");
        self.send(dest, Message::OsdMap(update));
    }

    /// Build, persist and cache the maps in `update` that follow the
    /// current epoch.
    fn persist_maps(&self, update: &MapUpdate) -> crate::Result<Vec<Arc<OsdMap>>> {
        let current = self.osdmap();
        let mut first = current.epoch + 1;
        if !update.full.contains_key(&first) && !update.incrementals.contains_key(&first) {
            // Too far behind for the incrementals: restart from a full map.
            match update.full.range(first..).next() {
                Some((&epoch, _)) => first = epoch,
                None => return Ok(Vec::new()),
            }
        }
        let last = update.last().unwrap_or(0);

        let mut tx = self.store.begin_transaction();
        let mut built: Vec<(Arc<OsdMap>, Option<Incremental>)> = Vec::new();
        let mut prev = current;
        for epoch in first..=last {
            let (map, inc) = if let Some(full) = update.full.get(&epoch) {
                (Arc::new(full.clone()), update.incrementals.get(&epoch).cloned())
            } else if let Some(inc) = update.incrementals.get(&epoch) {
                match prev.apply_incremental(inc) {
                    Ok(map) => (Arc::new(map), Some(inc.clone())),
                    Err(e) => {
                        tracing::warn!(epoch, error = %e, "cannot apply incremental");
                        break;
                    }
                }
            } else {
                tracing::warn!(epoch, last, "gap in map update");
                break;
            };
            tx.write_encoded(META_COLLECTION, full_map_oid(epoch), map.as_ref())?;
            if let Some(inc) = &inc {
                tx.write_encoded(META_COLLECTION, inc_map_oid(epoch), inc)?;
            }
            prev = map.clone();
            built.push((map, inc));
        }
        let Some((newest, _)) = built.last() else {
            return Ok(Vec::new());
        };

        let mut sb = self.superblock.lock();
        let mut next_sb = sb.clone();
        next_sb.cluster_fsid = newest.fsid;
        next_sb.current_epoch = newest.epoch;
        next_sb.newest_map = newest.epoch;
        if next_sb.oldest_map == 0 {
            next_sb.oldest_map = first;
        }
        tx.write(META_COLLECTION, SUPERBLOCK_OID, next_sb.encode()?);
        self.store.commit(tx)?;
        *sb = next_sb;
        drop(sb);

        let mut maps = Vec::with_capacity(built.len());
        for (map, inc) in built {
            if let Some(inc) = inc {
                self.map_cache.add_incremental(inc);
            }
            self.map_cache.add_map(map.clone());
            maps.push(map);
        }
        Ok(maps)
    }

    /// Apply a map update from the monitor or a peer.
    pub(crate) fn handle_osd_map(&self, update: MapUpdate) {
        let Some(last) = update.last() else {
            return;
        };
        self.metrics.maps_received.inc();
        let guard = self.map_lock.lock();
        let old = self.osdmap();
        if last <= old.epoch {
            tracing::debug!(last, current = old.epoch, "ignoring old maps");
            return;
        }

        let maps = match self.persist_maps(&update) {
            Ok(maps) if maps.is_empty() => {
                drop(guard);
                self.map_requested.store(old.epoch, Ordering::SeqCst);
                self.request_map(last);
                return;
            }
            Ok(maps) => maps,
            Err(e) => {
                tracing::error!(error = %e, "failed to persist maps, not advancing");
                return;
            }
        };

        let mut new_interval: BTreeMap<PgId, PgRef> = BTreeMap::new();
        let mut pool_removed: Vec<PgRef> = Vec::new();
        let mut prev = old.clone();
        for map in &maps {
            self.split_pgs(&prev, map);
            for pg in self.registry.all() {
                let advance = pg.lock().advance_map(map, self.whoami);
                if advance.released_recovery > 0 {
                    self.recovery_gate.finish(advance.released_recovery);
                }
                if advance.released_scrub {
                    self.release_scrub_slot();
                }
                if advance.pool_removed {
                    pool_removed.push(pg.clone());
                }
                if advance.new_interval {
                    new_interval.insert(pg.id(), pg.clone());
                }
                if advance.requeued > 0 {
                    self.queue_op_pg(&pg);
                }
            }
            self.metrics.epochs_applied.inc();
            prev = map.clone();
        }

        let map = prev;
        *self.osdmap.write() = map.clone();
        self.metrics.current_epoch.set(i64::from(map.epoch));
        tracing::info!(from = old.epoch, to = map.epoch, "advanced map");

        let just_activated = self.update_node_state(&map);
        if self.is_active() {
            let to_peer: Vec<PgRef> = if just_activated {
                self.registry.all()
            } else {
                new_interval.into_values().collect()
            };
            self.peer_pgs(&to_peer, map.epoch);
        }

        for pg in pool_removed {
            self.queue_for_removal(&pg);
        }
        self.queue_snap_trims(&map);

        for (pgid, created) in self.registry.take_creating() {
            self.instantiate_pg(pgid, created, &map);
        }
        for pgid in self.registry.waiting_pgs() {
            self.requeue_pg_waiters(pgid);
        }

        self.trim_maps(map.epoch);
        self.update_heartbeat_peers(&map);
        if self.is_active() {
            if let Some(want) = self.up_thru_needed() {
                self.send_alive(want);
            }
        }
        drop(guard);

        let ready: Vec<Parked> = {
            let mut waiting = self.waiting_for_osdmap.lock();
            let newest = self.epoch();
            let (ready, still): (Vec<Parked>, Vec<Parked>) =
                waiting.drain(..).partition(|p| p.epoch() <= newest);
            *waiting = still;
            ready
        };
        for parked in ready {
            self.redispatch(parked);
        }
    }

    /// Booting becomes Active once a map shows this node up since its
    /// mount; Active goes back to Booting when a map marks it down.
    /// Returns true on the Booting to Active transition.
    fn update_node_state(&self, map: &OsdMap) -> bool {
        let mounted = self.superblock.lock().mounted;
        let up_since_mount = map
            .osds
            .get(&self.whoami)
            .is_some_and(|s| s.up && s.up_from > mounted);
        let mut state = self.state.write();
        match *state {
            NodeState::Booting if up_since_mount => {
                *state = NodeState::Active;
                drop(state);
                tracing::info!(osd = self.whoami, epoch = map.epoch, "osd is up");
                true
            }
            NodeState::Active if !map.is_up(self.whoami) => {
                *state = NodeState::Booting;
                drop(state);
                tracing::warn!(osd = self.whoami, epoch = map.epoch, "marked down, rebooting");
                self.up_thru_wanted.store(0, Ordering::SeqCst);
                self.send_boot();
                false
            }
            _ => false,
        }
    }

    /// Split local PGs of pools whose pg_num grew between `prev` and `map`.
    fn split_pgs(&self, prev: &OsdMap, map: &OsdMap) {
        for (pool_id, pool) in &map.pools {
            let Some(old_pg_num) = prev
                .pool(*pool_id)
                .map(|p| p.pg_num)
                .filter(|&n| n < pool.pg_num)
            else {
                continue;
            };
            let parents: Vec<PgRef> = self
                .registry
                .all()
                .into_iter()
                .filter(|pg| pg.id().pool == *pool_id && pg.id().seed < old_pg_num)
                .collect();
            for parent in parents {
                match self
                    .registry
                    .split_pg(self.store.as_ref(), &parent, map, old_pg_num)
                {
                    Ok(children) if !children.is_empty() => {
                        self.metrics.pgs_split.inc_by(children.len() as u64);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(pgid = %parent.id(), error = %e, "pg split failed");
                    }
                }
            }
        }
    }

    /// Kick off peering for `pgs` and send the resulting messages.
    fn peer_pgs(&self, pgs: &[PgRef], epoch: Epoch) {
        let mut batch = PeeringBatch::new();
        let mut tx = self.store.begin_transaction();
        for pg in pgs {
            let mut state = pg.lock();
            if state.is_removing() || state.is_active() {
                continue;
            }
            let pgid = pg.id();
            let activation =
                state.start_peering(self.whoami, &mut batch, &|| self.backfill_missing(pgid));
            if let Err(e) = state.write_meta(&mut tx) {
                tracing::error!(pgid = %pgid, error = %e, "failed to encode pg meta");
            }
            if let Some(activation) = activation {
                self.after_activation(pg, &state, activation);
            }
        }
        if !tx.is_empty() {
            if let Err(e) = self.store.commit(tx) {
                tracing::error!(error = %e, "failed to persist pg history");
            }
        }
        self.send_batch(batch, epoch);
    }

    /// Queue snap trimming where the pool has removed snaps not yet purged.
    fn queue_snap_trims(&self, map: &OsdMap) {
        for pg in self.registry.all() {
            let Some(pool) = map.pool(pg.id().pool) else {
                continue;
            };
            let queue = {
                let mut state = pg.lock();
                if !state.is_active() {
                    continue;
                }
                let pending: BTreeSet<u64> = pool
                    .removed_snaps
                    .difference(&state.info.purged_snaps)
                    .copied()
                    .collect();
                state.snap_trimq.extend(pending);
                !state.snap_trimq.is_empty()
            };
            if queue {
                self.queue_snap_trim(&pg);
            }
        }
    }

    /// Drop stored and cached maps no PG needs any more.
    fn trim_maps(&self, newest: Epoch) {
        self.map_cache.set_pinned_floor(self.registry.min_epoch());
        let target = newest.saturating_sub(self.config.map_cache_size as Epoch - 1);
        let oldest = self.map_cache.trim(target);

        let mut sb = self.superblock.lock();
        if sb.oldest_map == 0 || oldest <= sb.oldest_map {
            return;
        }
        let mut next_sb = sb.clone();
        next_sb.oldest_map = oldest;
        let encoded = match next_sb.encode() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode superblock");
                return;
            }
        };
        let mut tx = self.store.begin_transaction();
        for epoch in sb.oldest_map..oldest {
            tx.remove(META_COLLECTION, full_map_oid(epoch));
            tx.remove(META_COLLECTION, inc_map_oid(epoch));
        }
        tx.write(META_COLLECTION, SUPERBLOCK_OID, encoded);
        match self.store.commit(tx) {
            Ok(()) => {
                tracing::debug!(from = sb.oldest_map, to = oldest, "trimmed stored maps");
                *sb = next_sb;
            }
            Err(e) => tracing::warn!(error = %e, "failed to trim stored maps"),
        }
    }

    /// Heartbeat every OSD sharing a PG with this node.
    fn update_heartbeat_peers(&self, map: &OsdMap) {
        let mut peers: BTreeSet<OsdId> = BTreeSet::new();
        for pg in self.registry.all() {
            let state = pg.lock();
            peers.extend(state.up.iter().copied());
            peers.extend(state.acting.iter().copied());
        }
        self.heartbeat.update_peers(map, peers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsdConfig;
    use crate::store::{MemStore, ObjectStore};
    use crate::testing::{advance, MapBuilder, RecordingTransport};

    fn booted(whoami: OsdId) -> (Arc<Osd>, Arc<MemStore>, Arc<RecordingTransport>) {
        let store = Arc::new(MemStore::new());
        let transport = RecordingTransport::new();
        let osd = Osd::new(OsdConfig::new(whoami), store.clone(), transport.clone()).unwrap();
        osd.init().unwrap();
        transport.take();
        (osd, store, transport)
    }

    fn full(map: &OsdMap) -> MapUpdate {
        let mut update = MapUpdate::default();
        update.full.insert(map.epoch, map.clone());
        update
    }

    #[test]
    fn test_map_persisted_before_publish() {
        let (osd, store, _) = booted(0);
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        osd.handle_osd_map(full(&map));

        assert_eq!(osd.epoch(), 1);
        assert!(osd.is_active());
        assert!(store.exists(META_COLLECTION, &full_map_oid(1)));
        assert_eq!(osd.superblock().current_epoch, 1);
        assert_eq!(osd.get_map(1).unwrap().epoch, 1);
    }

    #[test]
    fn test_failed_commit_does_not_advance() {
        let (osd, store, _) = booted(0);
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        store.fail_next_commits(1);
        osd.handle_osd_map(full(&map));
        assert_eq!(osd.epoch(), 0);
        assert_eq!(osd.superblock().current_epoch, 0);

        osd.handle_osd_map(full(&map));
        assert_eq!(osd.epoch(), 1);
    }

    #[test]
    fn test_incrementals_applied_in_order() {
        let (osd, _, _) = booted(0);
        let map1 = MapBuilder::new(2).pool(1, 4, 2).build();
        osd.handle_osd_map(full(&map1));

        let mut update = MapUpdate::default();
        let mut base = map1;
        for _ in 0..3 {
            let mut inc = Incremental::new(base.epoch + 1);
            inc.new_up_thru.insert(0, base.epoch);
            base = base.apply_incremental(&inc).unwrap();
            update.incrementals.insert(inc.epoch, inc);
        }
        osd.handle_osd_map(update);
        assert_eq!(osd.epoch(), 4);
        assert_eq!(osd.osdmap().up_thru(0), 3);
    }

    #[test]
    fn test_gap_requests_missing_maps() {
        let (osd, _, transport) = booted(0);
        let mut update = MapUpdate::default();
        update.incrementals.insert(3, Incremental::new(3));
        osd.handle_osd_map(update);
        assert_eq!(osd.epoch(), 0);
        assert!(transport
            .take()
            .iter()
            .any(|(_, m)| matches!(m, Message::MapSubscribe { start: 1 })));
    }

    #[test]
    fn test_marked_down_goes_back_to_booting() {
        let (osd, _, transport) = booted(1);
        let map = MapBuilder::new(2).pool(1, 4, 2).build();
        osd.handle_osd_map(full(&map));
        assert!(osd.is_active());
        transport.take();

        let down = advance(&map, |inc| inc.new_down.push(1));
        osd.handle_osd_map(full(&down));
        assert_eq!(osd.state(), NodeState::Booting);
        assert!(transport
            .take()
            .iter()
            .any(|(_, m)| matches!(m, Message::Boot(b) if b.osd == 1)));
    }

    #[test]
    fn test_share_map_sends_incrementals_or_full() {
        let (osd, _, transport) = booted(0);
        let map1 = MapBuilder::new(1).pool(1, 1, 1).build();
        osd.handle_osd_map(full(&map1));
        let inc = Incremental::new(2);
        let mut update = MapUpdate::default();
        update.incrementals.insert(2, inc);
        osd.handle_osd_map(update);
        transport.take();

        osd.share_map(Destination::Osd(5), 1);
        osd.share_map(Destination::Osd(6), 0);
        let sent = transport.take();
        match &sent[..] {
            [(Destination::Osd(5), Message::OsdMap(a)), (Destination::Osd(6), Message::OsdMap(b))] => {
                assert_eq!(a.incrementals.keys().copied().collect::<Vec<_>>(), vec![2]);
                assert!(a.full.is_empty());
                assert_eq!(b.full.keys().copied().collect::<Vec<_>>(), vec![2]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
