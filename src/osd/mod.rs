//! The node context.
//!
//! [`Osd`] owns every piece of node-wide state: the current map and epoch
//! cache, the PG registry, sessions, the op tracker, the work queues and
//! their thread pools, the heartbeat monitor and the stats reporter. It is
//! built with [`Arc::new_cyclic`] so queue process functions can hold a
//! `Weak<Osd>` back-reference.
//!
//! # Lifecycle
//!
//! ```text
//!  new ──► init ──► Booting ──(map shows us up)──► Active ──► shutdown ──► Stopping
//!                      ▲                             │
//!                      └──── (map marks us down) ────┘
//! ```
//!
//! Inbound messages enter through [`Osd::dispatch`]; periodic housekeeping
//! runs in [`Osd::tick`], driven by [`Osd::run_tick_loop`].

pub mod command;
mod dispatch;
pub mod heartbeat;
mod maps;
pub mod op_request;
mod peering;
mod queues;
pub mod report;
pub mod session;
mod workers;

pub use dispatch::Disposition;
pub use heartbeat::HeartbeatMonitor;
pub use op_request::{OpMessage, OpRequest, OpTracker};
pub use report::PgStatsReporter;
pub use session::{OsdCaps, Session, SessionMap};

use crate::config::OsdConfig;
use crate::map::{MapCache, OsdMap, Superblock, SUPERBLOCK_OID};
use crate::metrics::OsdMetrics;
use crate::network::{Destination, Dispatcher, Envelope, Message, Transport};
use crate::pg::{PgRef, PgRegistry, QueueKind};
use crate::store::{read_decoded, ObjectStore, META_COLLECTION};
use crate::types::{ConnectionId, Epoch, OsdId, Tid};
use crate::workqueue::RecoveryGate;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use queues::OsdQueues;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Node lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting for a map that shows this node up.
    Booting,
    Active,
    Stopping,
}

/// Something waiting for a newer map than the node has.
#[derive(Debug)]
enum Parked {
    Op(OpRequest),
    Msg(Envelope),
}

impl Parked {
    fn epoch(&self) -> Epoch {
        match self {
            Parked::Op(op) => op.epoch(),
            Parked::Msg(env) => env.msg.epoch().unwrap_or(0),
        }
    }
}

/// One storage node.
pub struct Osd {
    whoami: OsdId,
    config: OsdConfig,
    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn Transport>,
    state: RwLock<NodeState>,

    /// Newest map the node has fully applied.
    osdmap: RwLock<Arc<OsdMap>>,
    map_cache: MapCache,
    superblock: Mutex<Superblock>,
    /// Serializes map handling.
    map_lock: Mutex<()>,
    /// Highest epoch already requested from the monitor.
    map_requested: AtomicU32,
    /// Newest epoch each peer is known to have.
    peer_map_epoch: DashMap<OsdId, Epoch>,
    waiting_for_osdmap: Mutex<Vec<Parked>>,
    up_thru_wanted: AtomicU32,

    registry: PgRegistry,
    sessions: SessionMap,
    op_tracker: Arc<OpTracker>,
    next_notify_id: AtomicU64,

    recovery_gate: Arc<RecoveryGate>,
    /// Scrub slots held (reserved or active).
    scrub_slots: AtomicUsize,

    heartbeat: Arc<HeartbeatMonitor>,
    reporter: PgStatsReporter,
    metrics: Arc<OsdMetrics>,
    queues: OsdQueues,

    loop_shutdown: Mutex<Vec<mpsc::Sender<()>>>,
}

impl Osd {
    /// Build a node. Nothing runs until [`Osd::init`].
    pub fn new(
        config: OsdConfig,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn Transport>,
    ) -> crate::Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(OsdMetrics::new());
        let recovery_gate = Arc::new(RecoveryGate::new(config.recovery.max_active));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            config.whoami,
            config.heartbeat.clone(),
            transport.clone(),
            metrics.clone(),
        ));

        Ok(Arc::new_cyclic(|weak| Self {
            whoami: config.whoami,
            store,
            transport: transport.clone(),
            state: RwLock::new(NodeState::Booting),
            osdmap: RwLock::new(Arc::new(OsdMap::new(uuid::Uuid::nil()))),
            map_cache: MapCache::new(config.map_cache_size),
            superblock: Mutex::new(Superblock::new(config.whoami)),
            map_lock: Mutex::new(()),
            map_requested: AtomicU32::new(0),
            peer_map_epoch: DashMap::new(),
            waiting_for_osdmap: Mutex::new(Vec::new()),
            up_thru_wanted: AtomicU32::new(0),
            registry: PgRegistry::new(),
            sessions: SessionMap::new(),
            op_tracker: Arc::new(OpTracker::new(config.op_complaint_time)),
            next_notify_id: AtomicU64::new(1),
            queues: OsdQueues::new(weak, &config, recovery_gate.clone()),
            recovery_gate,
            scrub_slots: AtomicUsize::new(0),
            heartbeat,
            reporter: PgStatsReporter::new(config.report.clone(), transport),
            metrics,
            loop_shutdown: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Mount the store, load maps and PGs, start the worker pools and boot.
    pub fn init(&self) -> crate::Result<()> {
        let store = self.store.as_ref();
        let mut sb = match store.read(META_COLLECTION, SUPERBLOCK_OID) {
            Some(data) => {
                let sb = Superblock::decode(&data)?;
                sb.check_mountable(self.whoami)?;
                sb
            }
            None => {
                tracing::info!(osd = self.whoami, "formatting new store");
                let mut tx = store.begin_transaction();
                if !store.collection_exists(META_COLLECTION) {
                    tx.create_collection(META_COLLECTION);
                }
                let sb = Superblock::new(self.whoami);
                tx.write(META_COLLECTION, SUPERBLOCK_OID, sb.encode()?);
                store.commit(tx)?;
                sb
            }
        };

        if sb.current_epoch > 0 {
            let oid = crate::map::full_map_oid(sb.current_epoch);
            match read_decoded::<OsdMap>(store, META_COLLECTION, &oid)? {
                Some(map) => {
                    let map = Arc::new(map);
                    self.map_cache.add_map(map.clone());
                    *self.osdmap.write() = map;
                }
                None => tracing::warn!(epoch = sb.current_epoch, "current map missing from store"),
            }
        }

        let map = self.osdmap();
        let pgs = self.registry.load_pgs(store)?;
        if map.epoch > 0 {
            for pg in &pgs {
                pg.lock().advance_map(&map, self.whoami);
            }
        }

        sb.mounted = map.epoch;
        let mut tx = store.begin_transaction();
        tx.write(META_COLLECTION, SUPERBLOCK_OID, sb.encode()?);
        store.commit(tx)?;
        *self.superblock.lock() = sb;

        self.queues.start()?;
        *self.state.write() = NodeState::Booting;
        self.metrics.num_pgs.set_count(self.registry.len());
        self.metrics.current_epoch.set(i64::from(map.epoch));
        tracing::info!(osd = self.whoami, epoch = map.epoch, pgs = pgs.len(), "osd initialized");

        self.send_boot();
        self.request_map(map.epoch + 1);
        Ok(())
    }

    /// Stop background loops and worker pools. Queued work is dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == NodeState::Stopping {
                return;
            }
            *state = NodeState::Stopping;
        }
        tracing::info!(osd = self.whoami, "shutting down");
        for tx in self.loop_shutdown.lock().drain(..) {
            let _ = tx.try_send(());
        }
        self.queues.drain_all();
        self.queues.stop();

        let mut sb = self.superblock.lock();
        sb.clean_thru = self.epoch();
        match sb.encode() {
            Ok(data) => {
                let mut tx = self.store.begin_transaction();
                tx.write(META_COLLECTION, SUPERBLOCK_OID, data);
                if let Err(e) = self.store.commit(tx) {
                    tracing::error!(error = %e, "failed to write superblock at shutdown");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode superblock"),
        }
        tracing::info!(osd = self.whoami, "shutdown complete");
    }

    /// Periodic housekeeping.
    pub fn tick(&self) {
        let now = Instant::now();
        let state = self.state();
        if state == NodeState::Stopping {
            return;
        }

        let slow = self.op_tracker.check_ops_in_flight(now);
        self.metrics.slow_ops.inc_by(slow as u64);
        self.metrics.ops_in_flight.set_count(self.op_tracker.len());
        self.metrics.num_pgs.set_count(self.registry.len());
        self.metrics.op_queue_len.set_count(self.queues.op.len());
        self.metrics
            .recovery_active
            .set_count(self.recovery_gate.active());
        self.rerequest_maps();

        match state {
            NodeState::Booting => self.send_boot(),
            NodeState::Active => {
                if let Some(want) = self.up_thru_needed() {
                    self.send_alive(want);
                }
                self.sched_scrub();
            }
            NodeState::Stopping => {}
        }

        for pg in self.registry.all() {
            let (removing, recover) = {
                let state = pg.lock();
                (
                    state.peering == crate::pg::PeeringState::Removing,
                    state.is_primary()
                        && state.is_active()
                        && state.needs_recovery()
                        && state.recovering.is_empty(),
                )
            };
            // Retries removals whose commit failed.
            if removing && !pg.is_queued(QueueKind::Remove) {
                self.queues.remove.queue(pg.clone());
            } else if recover {
                self.queue_recovery(&pg);
            }
        }
        self.queues.recovery.wake();
        self.maybe_send_pg_stats(now);
    }

    /// Run [`Osd::tick`] every `tick_interval` until shutdown.
    pub async fn run_tick_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                _ = shutdown_rx.recv() => {
                    tracing::info!(osd = self.whoami, "tick loop shutting down");
                    break;
                }
            }
        }
    }

    /// Spawn the tick and heartbeat loops on the current tokio runtime.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (hb_tx, hb_rx) = mpsc::channel(1);
        self.loop_shutdown.lock().extend([tick_tx, hb_tx]);
        vec![
            tokio::spawn(self.clone().run_tick_loop(tick_rx)),
            tokio::spawn(self.heartbeat.clone().run(hb_rx)),
        ]
    }

    pub fn whoami(&self) -> OsdId {
        self.whoami
    }

    pub fn config(&self) -> &OsdConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == NodeState::Active
    }

    /// Epoch of the current map.
    pub fn epoch(&self) -> Epoch {
        self.osdmap.read().epoch
    }

    pub fn osdmap(&self) -> Arc<OsdMap> {
        self.osdmap.read().clone()
    }

    pub fn map_cache(&self) -> &MapCache {
        &self.map_cache
    }

    pub fn superblock(&self) -> Superblock {
        self.superblock.lock().clone()
    }

    pub fn registry(&self) -> &PgRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    pub fn op_tracker(&self) -> &Arc<OpTracker> {
        &self.op_tracker
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn reporter(&self) -> &PgStatsReporter {
        &self.reporter
    }

    pub fn metrics(&self) -> &Arc<OsdMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn recovery_gate(&self) -> &Arc<RecoveryGate> {
        &self.recovery_gate
    }

    /// Allocate a tid for a sub-op, recovery op or monitor request.
    pub fn next_tid(&self) -> Tid {
        self.reporter.next_tid()
    }

    /// Wait until every work queue is idle. Returns false on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.queues.wait_for_idle(timeout)
    }

    pub(crate) fn send(&self, dest: Destination, msg: Message) {
        if let Err(e) = self.transport.send(dest, msg) {
            tracing::debug!(dest = ?dest, error = %e, "send failed");
        }
    }

    pub(crate) fn queue_op_pg(&self, pg: &PgRef) -> bool {
        self.queues.op.queue(pg.clone())
    }

    pub(crate) fn queue_recovery(&self, pg: &PgRef) -> bool {
        self.queues.recovery.queue(pg.clone())
    }

    pub(crate) fn queue_snap_trim(&self, pg: &PgRef) -> bool {
        self.queues.snap_trim.queue(pg.clone())
    }

    pub(crate) fn queue_scrub(&self, pg: &PgRef) -> bool {
        self.queues.scrub.queue(pg.clone())
    }

    pub(crate) fn queue_scrub_finalize(&self, pg: &PgRef) -> bool {
        self.queues.scrub_finalize.queue(pg.clone())
    }

    /// Mark `pg` for removal and queue it. Returns false if it was already
    /// being removed.
    pub fn queue_for_removal(&self, pg: &PgRef) -> bool {
        {
            let mut state = pg.lock();
            if state.is_removing() {
                return false;
            }
            state.peering = crate::pg::PeeringState::Removing;
        }
        tracing::info!(pgid = %pg.id(), "queued pg for removal");
        self.queues.remove.queue(pg.clone());
        true
    }

    fn release_scrub_slot(&self) {
        let prev = self.scrub_slots.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "scrub slot underflow");
    }

    fn try_reserve_scrub_slot(&self) -> bool {
        let max = self.config.scrub.max_scrubs;
        self.scrub_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    pub fn scrubs_in_progress(&self) -> usize {
        self.scrub_slots.load(Ordering::SeqCst)
    }
}

impl Dispatcher for Osd {
    fn ms_dispatch(&self, envelope: Envelope) -> bool {
        self.dispatch(envelope)
    }

    fn ms_handle_reset(&self, conn: ConnectionId) -> bool {
        self.handle_reset(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::testing::RecordingTransport;

    #[test]
    fn test_init_formats_and_boots() {
        let store = Arc::new(MemStore::new());
        let transport = RecordingTransport::new();
        let osd = Osd::new(OsdConfig::new(3), store.clone(), transport.clone()).unwrap();
        osd.init().unwrap();

        assert_eq!(osd.state(), NodeState::Booting);
        let sb = Superblock::decode(&store.read(META_COLLECTION, SUPERBLOCK_OID).unwrap()).unwrap();
        assert_eq!(sb.whoami, 3);

        let sent = transport.take();
        assert!(sent
            .iter()
            .any(|(d, m)| *d == Destination::Mon && matches!(m, Message::Boot(b) if b.osd == 3)));
        assert!(sent
            .iter()
            .any(|(_, m)| matches!(m, Message::MapSubscribe { start: 1 })));
        osd.shutdown();
        assert_eq!(osd.state(), NodeState::Stopping);
    }

    #[test]
    fn test_init_refuses_foreign_store() {
        let store = Arc::new(MemStore::new());
        let osd = Osd::new(OsdConfig::new(1), store.clone(), RecordingTransport::new()).unwrap();
        osd.init().unwrap();
        osd.shutdown();

        let other = Osd::new(OsdConfig::new(2), store, RecordingTransport::new()).unwrap();
        assert!(matches!(
            other.init(),
            Err(crate::Error::Superblock(
                crate::error::SuperblockError::WrongOsd { .. }
            ))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = OsdConfig::new(0).with_op_threads(0);
        assert!(Osd::new(config, Arc::new(MemStore::new()), RecordingTransport::new()).is_err());
    }

    #[tokio::test]
    async fn test_background_loops_stop_on_shutdown() {
        let osd = Osd::new(
            OsdConfig::new(0),
            Arc::new(MemStore::new()),
            RecordingTransport::new(),
        )
        .unwrap();
        osd.init().unwrap();
        let handles = osd.spawn_background();
        osd.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
