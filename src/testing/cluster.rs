//! In-memory message routing between several nodes.
//!
//! Messages between OSDs are queued and only delivered by
//! [`ClusterRouter::pump`], never from inside `send`: a synchronous hand-off
//! would re-enter the receiving node while the sender may still hold a PG
//! lock. Every routed message goes through the wire codec.

use super::IDLE_TIMEOUT;
use crate::config::OsdConfig;
use crate::error::NetworkError;
use crate::map::OsdMap;
use crate::network::{decode_message, encode_message, Destination, Envelope, Message, Transport};
use crate::osd::Osd;
use crate::store::MemStore;
use crate::types::{ConnectionId, EntityName, OsdId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Connection ids below this are free for tests to use as client conns.
const PEER_CONN_BASE: ConnectionId = 1 << 32;

fn peer_conn(osd: OsdId) -> ConnectionId {
    PEER_CONN_BASE + ConnectionId::from(osd)
}

#[derive(Debug)]
struct Routed {
    from: OsdId,
    to: OsdId,
    data: Vec<u8>,
}

/// A set of nodes exchanging messages through one queue.
#[derive(Default)]
pub struct ClusterRouter {
    nodes: RwLock<BTreeMap<OsdId, Arc<Osd>>>,
    stores: RwLock<BTreeMap<OsdId, Arc<MemStore>>>,
    in_flight: Mutex<VecDeque<Routed>>,
    /// Messages for the monitor and client connections, by sender.
    outbox: Mutex<Vec<(OsdId, Destination, Message)>>,
    isolated: Mutex<BTreeSet<OsdId>>,
}

/// Per-node handle into a [`ClusterRouter`].
pub struct NodeTransport {
    whoami: OsdId,
    router: Weak<ClusterRouter>,
}

impl Transport for NodeTransport {
    fn send(&self, dest: Destination, msg: Message) -> Result<(), NetworkError> {
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| NetworkError::Unreachable("router dropped".to_string()))?;
        router.route(self.whoami, dest, msg)
    }
}

impl ClusterRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport sending on behalf of `whoami`.
    pub fn transport(self: &Arc<Self>, whoami: OsdId) -> Arc<NodeTransport> {
        Arc::new(NodeTransport {
            whoami,
            router: Arc::downgrade(self),
        })
    }

    /// Build, init and register a node for every OSD in `map`, then bring
    /// them all up with it.
    pub fn start(self: &Arc<Self>, map: &OsdMap, config: impl Fn(OsdId) -> OsdConfig) {
        for &id in map.osds.keys() {
            let store = Arc::new(MemStore::new());
            let config = config(id).with_worker_poll_interval(Duration::from_millis(10));
            let osd = Osd::new(config, store.clone(), self.transport(id))
                .unwrap_or_else(|e| panic!("failed to build osd.{}: {}", id, e));
            osd.init()
                .unwrap_or_else(|e| panic!("failed to init osd.{}: {}", id, e));
            self.stores.write().insert(id, store);
            self.nodes.write().insert(id, osd);
        }
        self.deliver_maps(&[map]);
        for osd in self.nodes() {
            assert!(osd.is_active(), "osd.{} did not go active", osd.whoami());
        }
        self.take_outbox();
    }

    pub fn node(&self, id: OsdId) -> Arc<Osd> {
        self.nodes
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("no osd.{}", id))
    }

    pub fn store(&self, id: OsdId) -> Arc<MemStore> {
        self.stores
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("no store for osd.{}", id))
    }

    pub fn nodes(&self) -> Vec<Arc<Osd>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Send `maps` from the monitor to every reachable node and run the
    /// cluster until it settles.
    pub fn deliver_maps(&self, maps: &[&OsdMap]) {
        for osd in self.nodes() {
            if self.is_isolated(osd.whoami()) {
                continue;
            }
            super::deliver_maps(&osd, maps.iter().copied());
        }
        self.pump();
    }

    /// Deliver `msg` to `to` as if sent by `from`, then settle.
    pub fn dispatch_from(&self, from: EntityName, conn: ConnectionId, to: OsdId, msg: Message) {
        self.node(to).dispatch(Envelope::new(from, conn, msg));
        self.pump();
    }

    /// Drop all traffic to and from `id` until [`ClusterRouter::heal`].
    pub fn isolate(&self, id: OsdId) {
        self.isolated.lock().insert(id);
    }

    pub fn heal(&self) {
        self.isolated.lock().clear();
    }

    fn is_isolated(&self, id: OsdId) -> bool {
        self.isolated.lock().contains(&id)
    }

    /// Drain monitor and client bound messages.
    pub fn take_outbox(&self) -> Vec<(OsdId, Destination, Message)> {
        std::mem::take(&mut *self.outbox.lock())
    }

    fn route(&self, from: OsdId, dest: Destination, msg: Message) -> Result<(), NetworkError> {
        let Destination::Osd(to) = dest else {
            self.outbox.lock().push((from, dest, msg));
            return Ok(());
        };
        if !self.nodes.read().contains_key(&to) {
            return Err(NetworkError::Unreachable(format!("osd.{}", to)));
        }
        let data = encode_message(&msg).map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.in_flight.lock().push_back(Routed { from, to, data });
        Ok(())
    }

    /// Deliver queued messages until no node has work left. Returns the
    /// number of messages delivered.
    pub fn pump(&self) -> usize {
        let deadline = Instant::now() + IDLE_TIMEOUT;
        let mut delivered = 0;
        loop {
            let batch: Vec<Routed> = self.in_flight.lock().drain(..).collect();
            if batch.is_empty() {
                for osd in self.nodes() {
                    assert!(osd.wait_for_idle(IDLE_TIMEOUT), "osd.{} stuck", osd.whoami());
                }
                if self.in_flight.lock().is_empty() {
                    return delivered;
                }
                continue;
            }
            assert!(Instant::now() < deadline, "cluster did not settle");
            for routed in batch {
                if self.is_isolated(routed.from) || self.is_isolated(routed.to) {
                    tracing::debug!(from = routed.from, to = routed.to, "dropping message");
                    continue;
                }
                let msg = decode_message(&routed.data)
                    .unwrap_or_else(|e| panic!("failed to decode routed message: {}", e));
                let osd = self.node(routed.to);
                osd.dispatch(Envelope::new(
                    EntityName::osd(routed.from),
                    peer_conn(routed.from),
                    msg,
                ));
                delivered += 1;
            }
        }
    }
}
