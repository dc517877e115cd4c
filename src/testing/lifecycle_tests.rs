//! Single-node scenarios: epoch gating, removal, split, backpressure and
//! restart.

use super::{
    active_node, advance, create_pg, deliver_maps, init_test_logging, submit_op, submit_op_at,
    MapBuilder, RecordingTransport, IDLE_TIMEOUT,
};
use crate::config::OsdConfig;
use crate::error::OpError;
use crate::network::messages::{OpKind, OsdOp, OsdOpReply};
use crate::network::{Envelope, Message};
use crate::osd::{Osd, OsdCaps};
use crate::store::{is_pg_meta, pg_collection, ObjectStore};
use crate::types::{EntityName, PgId};
use bytes::Bytes;

const CONN: u64 = 3;

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

fn data(s: &'static str) -> OpKind {
    OpKind::Write {
        data: Bytes::from_static(s.as_bytes()),
    }
}

#[test]
fn test_op_from_the_future_waits_for_map() {
    init_test_logging();
    let map1 = MapBuilder::new(1).pool(1, 4, 1).build();
    let (osd, _, transport) = active_node(OsdConfig::new(0), &map1);
    let pgid = PgId::new(1, 0);
    create_pg(&osd, pgid);
    transport.take();

    submit_op_at(&osd, CONN, pgid, "a", data("x"), 2);
    let sent = transport.take();
    assert!(!sent.iter().any(|(_, m)| matches!(m, Message::OsdOpReply(_))));
    assert!(sent
        .iter()
        .any(|(_, m)| matches!(m, Message::MapSubscribe { start: 2 })));
    assert_eq!(osd.metrics().ops_waiting_for_map.get(), 1);
    assert_eq!(osd.op_tracker().len(), 1);

    let map2 = advance(&map1, |_| {});
    deliver_maps(&osd, [&map2]);
    assert!(osd.wait_for_idle(IDLE_TIMEOUT));

    let replies = replies(&transport);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].epoch, 2);
    assert!(replies[0].result.is_ok());
    assert!(osd.op_tracker().is_empty());
}

#[test]
fn test_stale_op_rejected_without_transaction() {
    let mut map = MapBuilder::new(1).pool(1, 4, 1).build();
    let (osd, store, transport) = active_node(OsdConfig::new(0), &map);
    let mut maps = Vec::new();
    for _ in 2..=5 {
        map = advance(&map, |_| {});
        maps.push(map.clone());
    }
    deliver_maps(&osd, maps.iter());
    assert_eq!(osd.epoch(), 5);

    let pgid = PgId::new(1, 1);
    create_pg(&osd, pgid);
    transport.take();

    submit_op_at(&osd, CONN, pgid, "obj", data("fresh"), 5);
    let reply = replies(&transport).pop().unwrap();
    assert!(reply.result.is_ok());
    let cid = pg_collection(pgid);
    assert_eq!(store.read(&cid, "obj").unwrap(), Bytes::from_static(b"fresh"));

    let commits = store.commit_count();
    submit_op_at(&osd, CONN, pgid, "other", data("stale"), 3);
    let reply = replies(&transport).pop().unwrap();
    assert_eq!(reply.result, Err(OpError::StaleEpoch { current: 5 }));
    assert_eq!(store.commit_count(), commits);
    assert!(!store.exists(&cid, "other"));
}

#[test]
fn test_concurrent_removal_tears_down_once() {
    let map = MapBuilder::new(1).pool(1, 4, 1).build();
    let (osd, store, _) = active_node(OsdConfig::new(0), &map);
    let pgid = PgId::new(1, 2);
    create_pg(&osd, pgid);
    submit_op(&osd, CONN, pgid, "obj", data("x"));
    let pg = osd.registry().lookup(pgid).unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let osd = osd.clone();
            let pg = pg.clone();
            std::thread::spawn(move || osd.queue_for_removal(&pg))
        })
        .collect();
    let queued: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(queued.iter().filter(|&&q| q).count(), 1);

    assert!(osd.wait_for_idle(IDLE_TIMEOUT));
    assert_eq!(osd.metrics().pgs_removed.get(), 1);
    assert!(osd.registry().lookup(pgid).is_none());
    assert!(!store.collection_exists(&pg_collection(pgid)));
    assert!(!osd.queue_for_removal(&pg));
}

#[test]
fn test_pool_deletion_removes_pgs() {
    let map = MapBuilder::new(1).pool(1, 4, 1).pool(2, 4, 1).build();
    let (osd, store, _) = active_node(OsdConfig::new(0), &map);
    create_pg(&osd, PgId::new(1, 0));
    create_pg(&osd, PgId::new(2, 0));

    let next = advance(&map, |inc| inc.removed_pools.push(1));
    deliver_maps(&osd, [&next]);
    assert!(osd.wait_for_idle(IDLE_TIMEOUT));

    assert!(osd.registry().lookup(PgId::new(1, 0)).is_none());
    assert!(osd.registry().lookup(PgId::new(2, 0)).is_some());
    assert!(!store.collection_exists(&pg_collection(PgId::new(1, 0))));
}

#[test]
fn test_pg_num_increase_splits() {
    let map = MapBuilder::new(1).pool(1, 2, 1).build();
    let (osd, store, _) = active_node(OsdConfig::new(0), &map);
    let parent = PgId::new(1, 0);
    create_pg(&osd, parent);
    let oids: Vec<String> = (0..)
        .map(|i| format!("obj{}", i))
        .filter(|oid| map.object_to_pg(1, oid) == Some(parent))
        .take(16)
        .collect();
    for oid in &oids {
        submit_op(&osd, CONN, parent, oid, data("x"));
    }

    let grown = advance(&map, |inc| {
        let mut pool = map.pool(1).unwrap().clone();
        pool.pg_num = 4;
        inc.new_pools.push(pool);
    });
    deliver_maps(&osd, [&grown]);
    assert!(osd.wait_for_idle(IDLE_TIMEOUT));

    let child = PgId::new(1, 2);
    assert_eq!(osd.metrics().pgs_split.get(), 1);
    assert!(osd.registry().lookup(child).is_some());
    let user_objects = |pgid: PgId| {
        store
            .list_objects(&pg_collection(pgid))
            .into_iter()
            .filter(|oid| !is_pg_meta(oid))
            .count()
    };
    assert!(user_objects(child) > 0);
    assert_eq!(user_objects(parent) + user_objects(child), 16);
}

#[test]
fn test_backpressure_rejects_with_again() {
    let map = MapBuilder::new(1).pool(1, 4, 1).build();
    let (osd, _, transport) = active_node(OsdConfig::new(0).with_op_queue_capacity(1), &map);
    let pgid = PgId::new(1, 3);
    create_pg(&osd, pgid);
    transport.take();

    // Parked on a future epoch, the first op keeps the only slot.
    submit_op_at(&osd, CONN, pgid, "a", OpKind::Read, 9);
    submit_op(&osd, CONN, pgid, "b", OpKind::Read);
    let replies = replies(&transport);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].result, Err(OpError::Again));
    assert_eq!(osd.metrics().ops_discarded.get("throttled"), 1);
}

#[test]
fn test_restart_reloads_pgs() {
    let map = MapBuilder::new(1).pool(1, 4, 1).build();
    let (osd, store, _) = active_node(OsdConfig::new(0), &map);
    let pgid = PgId::new(1, 0);
    create_pg(&osd, pgid);
    submit_op(&osd, CONN, pgid, "obj", data("persisted"));
    let last_update = osd.registry().lookup(pgid).unwrap().lock().info.last_update;
    osd.shutdown();
    drop(osd);

    let restarted = Osd::new(
        OsdConfig::new(0),
        store.clone(),
        RecordingTransport::new(),
    )
    .unwrap();
    restarted.init().unwrap();
    assert_eq!(restarted.epoch(), 1);
    assert!(!restarted.is_active());
    assert_eq!(restarted.registry().len(), 1);

    let reup = advance(&map, |inc| inc.new_up.push(0));
    deliver_maps(&restarted, [&reup]);
    assert!(restarted.is_active());
    assert!(restarted.wait_for_idle(IDLE_TIMEOUT));

    let pg = restarted.registry().lookup(pgid).unwrap();
    let state = pg.lock();
    assert!(state.is_active());
    assert_eq!(state.info.last_update, last_update);
}

#[test]
fn test_ops_on_one_pg_complete_in_arrival_order() {
    let map = MapBuilder::new(1).pool(1, 4, 1).build();
    let (osd, _, transport) = active_node(OsdConfig::new(0).with_op_threads(4), &map);
    let pgid = PgId::new(1, 1);
    create_pg(&osd, pgid);
    osd.handle_connect(CONN, EntityName::client(CONN), OsdCaps::all());
    transport.take();

    for tid in 0..50 {
        let op = OsdOp {
            tid,
            pgid,
            oid: format!("obj{}", tid % 5),
            epoch: osd.epoch(),
            kind: data("x"),
        };
        osd.dispatch(Envelope::new(EntityName::client(CONN), CONN, Message::OsdOp(op)));
    }
    assert!(osd.wait_for_idle(IDLE_TIMEOUT));

    let tids: Vec<u64> = replies(&transport).into_iter().map(|r| r.tid).collect();
    assert_eq!(tids, (0..50).collect::<Vec<u64>>());
}
