//! Testing utilities for OSD nodes.
//!
//! This module provides the pieces the unit and scenario tests share:
//! - [`RecordingTransport`] captures everything a node sends
//! - [`MapBuilder`] and [`advance`] build cluster maps without a monitor
//! - [`active_node`], [`create_pg`] and [`submit_op`] drive a single node
//! - [`ClusterRouter`] wires several nodes together in memory
//!
//! # Example
//!
//! ```rust,ignore
//! use osd_core::testing::{active_node, create_pg, submit_op, MapBuilder};
//! use osd_core::OsdConfig;
//!
//! let map = MapBuilder::new(1).pool(1, 8, 1).build();
//! let (osd, store, transport) = active_node(OsdConfig::new(0), &map);
//! create_pg(&osd, PgId::new(1, 0));
//! submit_op(&osd, 1, PgId::new(1, 0), "obj", OpKind::Read);
//! ```

mod cluster;

#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod replication_tests;

pub use cluster::{ClusterRouter, NodeTransport};

use crate::config::OsdConfig;
use crate::error::NetworkError;
use crate::map::{Incremental, OsdMap, PoolInfo};
use crate::network::messages::{MapUpdate, OpKind, OsdOp, PgCreate};
use crate::network::{Destination, Envelope, Message, Transport};
use crate::osd::{Osd, OsdCaps};
use crate::store::MemStore;
use crate::types::{ConnectionId, EntityName, OsdId, PgId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long helpers wait for a node's queues to drain.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport that keeps every outbound message for inspection.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Destination, Message)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain and return everything sent so far.
    pub fn take(&self) -> Vec<(Destination, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Copy of everything sent so far.
    pub fn sent(&self) -> Vec<(Destination, Message)> {
        self.sent.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, dest: Destination, msg: Message) -> Result<(), NetworkError> {
        self.sent.lock().push((dest, msg));
        Ok(())
    }
}

/// Builds an epoch 1 map with every OSD up.
#[derive(Debug, Clone)]
pub struct MapBuilder {
    osds: u32,
    pools: Vec<PoolInfo>,
}

impl MapBuilder {
    /// A map with OSDs `0..osds`.
    pub fn new(osds: u32) -> Self {
        Self {
            osds,
            pools: Vec::new(),
        }
    }

    pub fn pool(mut self, id: u32, pg_num: u32, size: usize) -> Self {
        self.pools.push(PoolInfo::new(id, pg_num, size));
        self
    }

    pub fn build(self) -> OsdMap {
        let mut inc = Incremental::new(1);
        inc.new_up = (0..self.osds).collect();
        inc.new_pools = self.pools;
        OsdMap::new(uuid::Uuid::new_v4())
            .apply_incremental(&inc)
            .unwrap_or_else(|e| panic!("failed to build map: {}", e))
    }
}

/// The map one epoch after `map`, with `f` applied to the diff.
pub fn advance(map: &OsdMap, f: impl FnOnce(&mut Incremental)) -> OsdMap {
    let mut inc = Incremental::new(map.epoch + 1);
    f(&mut inc);
    map.apply_incremental(&inc)
        .unwrap_or_else(|e| panic!("failed to advance map: {}", e))
}

/// A monitor map message carrying `maps` as full maps.
pub fn map_update<'a>(maps: impl IntoIterator<Item = &'a OsdMap>) -> Message {
    let mut update = MapUpdate::default();
    for map in maps {
        update.full.insert(map.epoch, map.clone());
    }
    Message::OsdMap(update)
}

/// Feed `maps` to `osd` as if sent by the monitor.
pub fn deliver_maps<'a>(osd: &Osd, maps: impl IntoIterator<Item = &'a OsdMap>) {
    osd.dispatch(Envelope::new(EntityName::mon(0), 0, map_update(maps)));
}

/// Start a node on a fresh store and bring it up with `map`.
pub fn active_node(
    config: OsdConfig,
    map: &OsdMap,
) -> (Arc<Osd>, Arc<MemStore>, Arc<RecordingTransport>) {
    let store = Arc::new(MemStore::new());
    let transport = RecordingTransport::new();
    let config = config.with_worker_poll_interval(Duration::from_millis(10));
    let osd = Osd::new(config, store.clone(), transport.clone())
        .unwrap_or_else(|e| panic!("failed to build osd: {}", e));
    osd.init()
        .unwrap_or_else(|e| panic!("failed to init osd: {}", e));
    deliver_maps(&osd, [map]);
    assert!(osd.is_active(), "osd.{} did not go active", osd.whoami());
    transport.take();
    (osd, store, transport)
}

/// Ask `osd` to create `pgid` as the monitor would and wait for it to
/// go active.
pub fn create_pg(osd: &Osd, pgid: PgId) {
    let epoch = osd.epoch();
    let create = PgCreate {
        epoch,
        pgs: BTreeMap::from([(pgid, epoch)]),
    };
    osd.dispatch(Envelope::new(EntityName::mon(0), 0, Message::PgCreate(create)));
    assert!(osd.wait_for_idle(IDLE_TIMEOUT));
    let pg = osd
        .registry()
        .lookup(pgid)
        .unwrap_or_else(|| panic!("pg {} was not created", pgid));
    assert!(pg.lock().is_active(), "pg {} is not active", pgid);
}

/// Send a client op tagged with the node's current epoch and wait for the
/// node to go idle. Opens a session for `conn` if there is none.
pub fn submit_op(osd: &Osd, conn: ConnectionId, pgid: PgId, oid: &str, kind: OpKind) {
    submit_op_at(osd, conn, pgid, oid, kind, osd.epoch());
}

/// Like [`submit_op`], with an explicit epoch tag.
pub fn submit_op_at(
    osd: &Osd,
    conn: ConnectionId,
    pgid: PgId,
    oid: &str,
    kind: OpKind,
    epoch: crate::types::Epoch,
) {
    if !osd.sessions().contains(conn) {
        osd.handle_connect(conn, EntityName::client(conn), OsdCaps::all());
    }
    let op = OsdOp {
        tid: osd.next_tid(),
        pgid,
        oid: oid.to_string(),
        epoch,
        kind,
    };
    osd.dispatch(Envelope::new(EntityName::client(conn), conn, Message::OsdOp(op)));
    assert!(osd.wait_for_idle(IDLE_TIMEOUT));
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Route `tracing` output to the test writer. Safe to call repeatedly.
pub fn init_test_logging() {
    #[cfg(test)]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Every OSD id in `map`.
pub fn osd_ids(map: &OsdMap) -> Vec<OsdId> {
    map.osds.keys().copied().collect()
}
