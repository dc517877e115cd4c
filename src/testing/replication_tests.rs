//! Two-node scenarios: replicated writes, peering and recovery.

use super::{advance, init_test_logging, wait_until, ClusterRouter, MapBuilder, IDLE_TIMEOUT};
use crate::config::{OsdConfig, RecoveryConfig};
use crate::map::OsdMap;
use crate::error::OpError;
use crate::network::messages::{OpKind, OsdOp, OsdOpReply, PgCreate, SubOpReply};
use crate::network::{Destination, Message};
use crate::osd::OsdCaps;
use crate::store::{pg_collection, ObjectStore};
use crate::types::{EntityName, OsdId, PgId};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const PGID: PgId = PgId::new(1, 0);
const CLIENT: u64 = 11;

fn config(id: OsdId) -> OsdConfig {
    OsdConfig::new(id)
        .with_recovery_config(RecoveryConfig::default().with_delay_start(Duration::ZERO))
}

/// (primary, replica) of `pgid`.
fn placement(map: &OsdMap, pgid: PgId) -> (OsdId, OsdId) {
    let (_, acting) = map.pg_to_up_acting(pgid);
    assert_eq!(acting.len(), 2);
    (acting[0], acting[1])
}

fn two_nodes() -> (Arc<ClusterRouter>, OsdMap, OsdId, OsdId) {
    init_test_logging();
    let map = MapBuilder::new(2).pool(1, 4, 2).build();
    let router = ClusterRouter::new();
    router.start(&map, config);
    let (primary, replica) = placement(&map, PGID);

    let create = PgCreate {
        epoch: map.epoch,
        pgs: BTreeMap::from([(PGID, map.epoch)]),
    };
    for id in [primary, replica] {
        router.dispatch_from(EntityName::mon(0), 0, id, Message::PgCreate(create.clone()));
    }
    for id in [primary, replica] {
        let pg = router.node(id).registry().lookup(PGID).unwrap();
        assert!(pg.lock().is_active(), "pg not active on osd.{}", id);
    }
    router.take_outbox();
    (router, map, primary, replica)
}

fn client_op(router: &ClusterRouter, to: OsdId, oid: &str, kind: OpKind) -> OsdOpReply {
    let osd = router.node(to);
    if !osd.sessions().contains(CLIENT) {
        osd.handle_connect(CLIENT, EntityName::client(1), OsdCaps::all());
    }
    let op = OsdOp {
        tid: osd.next_tid(),
        pgid: PGID,
        oid: oid.to_string(),
        epoch: osd.epoch(),
        kind,
    };
    router.dispatch_from(EntityName::client(1), CLIENT, to, Message::OsdOp(op));
    let mut replies: Vec<OsdOpReply> = router
        .take_outbox()
        .into_iter()
        .filter_map(|(_, dest, msg)| match (dest, msg) {
            (Destination::Conn(CLIENT), Message::OsdOpReply(reply)) => Some(reply),
            _ => None,
        })
        .collect();
    assert_eq!(replies.len(), 1, "expected exactly one reply");
    replies.remove(0)
}

fn write(router: &ClusterRouter, to: OsdId, oid: &str) -> OsdOpReply {
    let data = Bytes::from(format!("{}-data", oid));
    client_op(router, to, oid, OpKind::Write { data })
}

#[test]
fn test_write_is_applied_on_every_replica() {
    let (router, _, primary, replica) = two_nodes();

    let reply = write(&router, primary, "obj");
    let version = reply.result.unwrap().version;

    let cid = pg_collection(PGID);
    for id in [primary, replica] {
        assert_eq!(
            router.store(id).read(&cid, "obj").unwrap(),
            Bytes::from_static(b"obj-data")
        );
        let pg = router.node(id).registry().lookup(PGID).unwrap();
        assert_eq!(pg.lock().info.last_update, version);
    }
    assert_eq!(router.node(replica).metrics().subops_processed.get(), 1);
}

#[test]
fn test_replica_refuses_client_ops() {
    let (router, _, primary, replica) = two_nodes();

    let reply = client_op(&router, replica, "obj", OpKind::Read);
    assert_eq!(
        reply.result,
        Err(OpError::Misdirected {
            primary: Some(primary)
        })
    );
}

#[test]
fn test_returning_replica_is_recovered() {
    let (router, map1, primary, replica) = two_nodes();
    write(&router, primary, "a").result.unwrap();

    // The replica drops out and misses three writes.
    router.isolate(replica);
    let map2 = advance(&map1, |inc| inc.new_down.push(replica));
    router.deliver_maps(&[&map2]);
    {
        let pg = router.node(primary).registry().lookup(PGID).unwrap();
        let state = pg.lock();
        assert_eq!(state.acting, vec![primary]);
        assert!(state.is_active());
    }
    for oid in ["b", "c", "d"] {
        write(&router, primary, oid).result.unwrap();
    }
    let cid = pg_collection(PGID);
    assert!(!router.store(replica).exists(&cid, "b"));

    let map3 = advance(&map2, |inc| inc.new_up.push(replica));
    router.heal();
    router.deliver_maps(&[&map2, &map3]);

    // Recovery runs on its own pool; keep routing until the pushes land.
    let primary_osd = router.node(primary);
    let recovered = wait_until(Duration::from_secs(10), || {
        router.pump();
        let pg = primary_osd.registry().lookup(PGID).unwrap();
        let state = pg.lock();
        let done = state.is_active()
            && state.peer_missing.values().all(|m| m.is_empty())
            && state.recovering.is_empty();
        done
    });
    assert!(recovered, "recovery did not finish");

    for oid in ["a", "b", "c", "d"] {
        assert_eq!(
            router.store(replica).read(&cid, oid).unwrap(),
            Bytes::from(format!("{}-data", oid)),
            "{} not recovered",
            oid
        );
    }
    {
        let pg = router.node(replica).registry().lookup(PGID).unwrap();
        let state = pg.lock();
        assert!(state.missing.is_empty());
        assert_eq!(state.info.last_complete, state.info.last_update);
    }
    assert_eq!(primary_osd.metrics().recovery_ops.get(), 3);
    assert_eq!(primary_osd.recovery_gate().active(), 0);
}

#[test]
fn test_replica_commit_failure_fails_the_write() {
    let (router, _, primary, replica) = two_nodes();

    router.store(replica).fail_next_commits(1);
    let reply = write(&router, primary, "a");
    assert!(matches!(reply.result, Err(OpError::Storage(_))), "{:?}", reply.result);

    let primary_osd = router.node(primary);
    assert!(primary_osd.op_tracker().is_empty());
    let pg = primary_osd.registry().lookup(PGID).unwrap();
    assert!(pg.lock().repops.is_empty());

    // Later writes are not held up behind the failed one.
    assert!(write(&router, primary, "b").result.is_ok());
}

#[test]
fn test_scrub_waits_for_in_flight_write() {
    let (router, map, primary, replica) = two_nodes();
    let primary_osd = router.node(primary);
    primary_osd.handle_connect(CLIENT, EntityName::client(1), OsdCaps::all());

    // The replica never sees the write, so it stays in flight.
    router.isolate(replica);
    let op = OsdOp {
        tid: primary_osd.next_tid(),
        pgid: PGID,
        oid: "obj".to_string(),
        epoch: map.epoch,
        kind: OpKind::Write {
            data: Bytes::from_static(b"v"),
        },
    };
    router.dispatch_from(EntityName::client(1), CLIENT, primary, Message::OsdOp(op));
    let pg = primary_osd.registry().lookup(PGID).unwrap();
    let tid = {
        let mut state = pg.lock();
        assert_eq!(state.repops.len(), 1);
        state.scrub.must_scrub = true;
        *state.repops.keys().next().unwrap()
    };

    primary_osd.tick();
    assert!(primary_osd.wait_for_idle(IDLE_TIMEOUT));
    {
        let state = pg.lock();
        assert!(state.scrub.reserved);
        assert!(state.scrub.blocked_on_writes);
        assert!(!state.scrub.active);
    }
    assert_eq!(primary_osd.scrubs_in_progress(), 1);

    let ack = SubOpReply {
        tid,
        pgid: PGID,
        epoch: map.epoch,
        result: Ok(None),
    };
    router.dispatch_from(EntityName::osd(replica), 1 << 33, primary, Message::SubOpReply(ack));

    let state = pg.lock();
    assert!(state.repops.is_empty());
    assert!(!state.scrub.blocked_on_writes);
    assert!(state.scrub.active);
}
