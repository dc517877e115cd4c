//! Peer liveness checking.
//!
//! Pings every heartbeat peer, remembers when each last answered, and
//! reports peers silent beyond the grace period to the monitor. A report
//! stays pending (and is not repeated) until the map marks the peer down,
//! the peer answers again (which sends a cancellation), or the report
//! expires. This node never marks a peer down itself.

use crate::config::HeartbeatConfig;
use crate::map::OsdMap;
use crate::metrics::OsdMetrics;
use crate::network::messages::{FailureReport, Message, Ping, PingOp};
use crate::network::{Destination, Dispatcher, Envelope, Transport};
use crate::types::{ConnectionId, Epoch, OsdId};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default)]
struct PeerStamps {
    first_tx: Option<Instant>,
    last_tx: Option<Instant>,
    last_rx: Option<Instant>,
}

impl PeerStamps {
    /// When the peer was last known alive, or when we started asking.
    fn reference(&self) -> Option<Instant> {
        self.last_rx.or(self.first_tx)
    }
}

#[derive(Debug, Default)]
struct HeartbeatState {
    peers: BTreeMap<OsdId, PeerStamps>,
    /// Failures detected but not yet sent, with the start of the silence.
    failure_queue: BTreeMap<OsdId, Instant>,
    /// Failures sent and not yet resolved, with the send time.
    failure_pending: BTreeMap<OsdId, Instant>,
}

/// Heartbeat monitor for one node.
pub struct HeartbeatMonitor {
    whoami: OsdId,
    config: HeartbeatConfig,
    transport: Arc<dyn Transport>,
    metrics: Arc<OsdMetrics>,
    epoch: AtomicU32,
    state: Mutex<HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new(
        whoami: OsdId,
        config: HeartbeatConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<OsdMetrics>,
    ) -> Self {
        Self {
            whoami,
            config,
            transport,
            metrics,
            epoch: AtomicU32::new(0),
            state: Mutex::new(HeartbeatState::default()),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Adopt the peer set for `map`. Failures for peers the map shows down
    /// are acknowledged.
    pub fn update_peers(&self, map: &OsdMap, peers: BTreeSet<OsdId>) {
        self.epoch.store(map.epoch, Ordering::SeqCst);
        let mut state = self.state.lock();

        let peers: BTreeSet<OsdId> = peers
            .into_iter()
            .filter(|&p| p != self.whoami && map.is_up(p))
            .collect();
        state.peers.retain(|p, _| peers.contains(p));
        for peer in peers {
            state.peers.entry(peer).or_default();
        }

        let acked: Vec<OsdId> = state
            .failure_pending
            .keys()
            .chain(state.failure_queue.keys())
            .copied()
            .filter(|&p| !map.is_up(p))
            .collect();
        for peer in acked {
            tracing::info!(peer, epoch = map.epoch, "failure report acknowledged by map");
            state.failure_pending.remove(&peer);
            state.failure_queue.remove(&peer);
        }
        let HeartbeatState {
            peers,
            failure_queue,
            ..
        } = &mut *state;
        failure_queue.retain(|p, _| peers.contains_key(p));
    }

    /// Forget a pending failure report.
    pub fn acknowledge_failure(&self, peer: OsdId) -> bool {
        self.state.lock().failure_pending.remove(&peer).is_some()
    }

    pub fn peers(&self) -> Vec<OsdId> {
        self.state.lock().peers.keys().copied().collect()
    }

    pub fn pending_failures(&self) -> Vec<OsdId> {
        self.state.lock().failure_pending.keys().copied().collect()
    }

    /// Ping every peer.
    pub fn send_pings(&self, now: Instant) {
        let epoch = self.epoch();
        let peers: Vec<OsdId> = {
            let mut state = self.state.lock();
            for stamps in state.peers.values_mut() {
                stamps.first_tx.get_or_insert(now);
                stamps.last_tx = Some(now);
            }
            state.peers.keys().copied().collect()
        };
        for peer in peers {
            let ping = Message::Ping(Ping {
                op: PingOp::Ping,
                epoch,
            });
            if let Err(e) = self.transport.send(Destination::Osd(peer), ping) {
                tracing::debug!(peer, error = %e, "ping send failed");
            }
        }
    }

    /// Handle a ping or a ping reply from `from`.
    pub fn handle_ping(&self, from: OsdId, ping: &Ping, now: Instant) {
        match ping.op {
            PingOp::Ping => {
                let reply = Message::Ping(Ping {
                    op: PingOp::Reply,
                    epoch: self.epoch(),
                });
                if let Err(e) = self.transport.send(Destination::Osd(from), reply) {
                    tracing::debug!(peer = from, error = %e, "ping reply send failed");
                }
            }
            PingOp::Reply => {
                let was_pending = {
                    let mut state = self.state.lock();
                    if let Some(stamps) = state.peers.get_mut(&from) {
                        stamps.last_rx = Some(now);
                    }
                    state.failure_queue.remove(&from);
                    state.failure_pending.remove(&from).is_some()
                };
                if was_pending {
                    tracing::info!(peer = from, "peer answered again, cancelling failure report");
                    self.send_to_mon(FailureReport {
                        target: from,
                        epoch: self.epoch(),
                        failed_for_secs: 0,
                        still_alive: true,
                    });
                }
            }
        }
    }

    /// Queue a failure for every peer silent beyond the grace period.
    pub fn heartbeat_check(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let silent: Vec<(OsdId, Instant)> = state
            .peers
            .iter()
            .filter_map(|(&peer, stamps)| {
                let since = stamps.reference()?;
                (now.saturating_duration_since(since) > self.config.grace).then_some((peer, since))
            })
            .filter(|(peer, _)| {
                !state.failure_queue.contains_key(peer) && !state.failure_pending.contains_key(peer)
            })
            .collect();
        for &(peer, since) in &silent {
            tracing::warn!(
                peer,
                silent_secs = now.saturating_duration_since(since).as_secs(),
                "no heartbeat reply"
            );
            state.failure_queue.insert(peer, since);
        }
        silent.len()
    }

    /// Send every queued failure once. Returns the number sent.
    pub fn send_failures(&self, now: Instant) -> usize {
        let queued = {
            let mut state = self.state.lock();
            let queued = std::mem::take(&mut state.failure_queue);
            for &peer in queued.keys() {
                state.failure_pending.insert(peer, now);
            }
            queued
        };
        let epoch = self.epoch();
        for (&target, &since) in &queued {
            self.metrics.failures_reported.inc();
            self.send_to_mon(FailureReport {
                target,
                epoch,
                failed_for_secs: now.saturating_duration_since(since).as_secs(),
                still_alive: false,
            });
        }
        queued.len()
    }

    /// Forget reports unacknowledged for longer than the expiry.
    pub fn expire_failures(&self, now: Instant) -> usize {
        let expiry = self.config.failure_report_expiry;
        let mut state = self.state.lock();
        let before = state.failure_pending.len();
        state
            .failure_pending
            .retain(|_, sent| now.saturating_duration_since(*sent) < expiry);
        before - state.failure_pending.len()
    }

    /// One heartbeat round.
    pub fn tick(&self, now: Instant) {
        self.expire_failures(now);
        self.heartbeat_check(now);
        self.send_failures(now);
        self.send_pings(now);
    }

    /// Run heartbeat rounds until shutdown, at the configured interval plus
    /// up to 50% random jitter.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let base = self.config.interval;
        loop {
            let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 2);
            let delay = base + Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => self.tick(Instant::now()),
                _ = shutdown_rx.recv() => {
                    tracing::info!(osd = self.whoami, "heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    fn send_to_mon(&self, report: FailureReport) {
        if let Err(e) = self.transport.send(Destination::Mon, Message::Failure(report)) {
            tracing::warn!(error = %e, "failed to send failure report");
        }
    }
}

impl Dispatcher for HeartbeatMonitor {
    fn ms_dispatch(&self, envelope: Envelope) -> bool {
        match (&envelope.msg, envelope.from.as_osd()) {
            (Message::Ping(ping), Some(from)) => {
                self.handle_ping(from, ping, Instant::now());
                true
            }
            _ => false,
        }
    }

    fn ms_handle_reset(&self, _conn: ConnectionId) -> bool {
        false
    }
}
