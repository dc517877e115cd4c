//! PG stat reporting to the monitor.
//!
//! PGs whose stats changed are queued once each (membership flag
//! [`QueueKind::Stats`]). A report drains the queue and is tagged with a
//! tid; the monitor acks each tid. Reports outstanding for longer than the
//! ack timeout mean the monitor may have lost them, so every primary PG is
//! queued again and a fresh report goes out.

use super::Osd;
use crate::config::ReportConfig;
use crate::network::messages::{BootRequest, Message, OsdStat, PgStatEntry, PgStatsReport};
use crate::network::{Destination, Transport};
use crate::pg::{PgRef, QueueKind};
use crate::types::{Epoch, PgId, Tid};
use crate::workqueue::{PgQueue, QueuePolicy};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ReporterState {
    pending: PgQueue,
    /// Sent reports awaiting an ack, with their send time.
    outstanding: BTreeMap<Tid, Instant>,
    last_ack: Instant,
    last_sent: Option<Instant>,
}

/// Stats/report scheduler. Also hands out tids for monitor requests.
pub struct PgStatsReporter {
    config: ReportConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<ReporterState>,
    acked: Condvar,
    next_tid: AtomicU64,
}

impl PgStatsReporter {
    pub fn new(config: ReportConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            state: Mutex::new(ReporterState {
                pending: PgQueue::new(QueueKind::Stats),
                outstanding: BTreeMap::new(),
                last_ack: Instant::now(),
                last_sent: None,
            }),
            acked: Condvar::new(),
            next_tid: AtomicU64::new(1),
        }
    }

    pub fn next_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `pg` for the next report. Returns false if already queued.
    pub fn queue_pg(&self, pg: &PgRef) -> bool {
        self.state.lock().pending.enqueue(pg.clone())
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Whether the report interval has passed since the last report.
    pub fn is_due(&self, now: Instant) -> bool {
        let state = self.state.lock();
        !state.pending.is_empty()
            && state
                .last_sent
                .map_or(true, |t| now.saturating_duration_since(t) >= self.config.pg_stats_interval)
    }

    /// Send a report covering every queued PG this node is still primary for.
    ///
    /// Returns the report's tid, or `None` if there was nothing to send.
    pub fn send_pg_stats(&self, epoch: Epoch, mut osd_stat: OsdStat) -> Option<Tid> {
        let pgs = self.state.lock().pending.clear();

        // PG locks are taken with the reporter lock released.
        let mut entries: BTreeMap<PgId, PgStatEntry> = BTreeMap::new();
        for pg in pgs {
            let state = pg.lock();
            if !state.is_primary() || state.is_removing() {
                continue;
            }
            entries.insert(
                pg.id(),
                PgStatEntry {
                    state: state.state_string(),
                    last_update: state.info.last_update,
                    reported_epoch: state.epoch,
                    stats: state.info.stats,
                },
            );
        }
        if entries.is_empty() {
            return None;
        }

        osd_stat.num_objects = entries.values().map(|e| e.stats.num_objects).sum();
        osd_stat.num_bytes = entries.values().map(|e| e.stats.num_bytes).sum();
        let tid = self.next_tid();
        let count = entries.len();
        let report = Message::PgStats(PgStatsReport {
            tid,
            epoch,
            pgs: entries,
            osd_stat,
        });

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if state.outstanding.is_empty() {
                state.last_ack = now;
            }
            state.outstanding.insert(tid, now);
            state.last_sent = Some(now);
        }
        if let Err(e) = self.transport.send(Destination::Mon, report) {
            tracing::warn!(tid, error = %e, "failed to send pg stats");
        }
        tracing::debug!(tid, pgs = count, epoch, "sent pg stats");
        Some(tid)
    }

    /// The monitor acknowledged report `tid` (and every older one).
    pub fn handle_pg_stats_ack(&self, tid: Tid) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.split_off(&(tid + 1));
        state.last_ack = Instant::now();
        self.acked.notify_all();
    }

    /// Block until every sent report is acknowledged. Returns false on timeout.
    pub fn flush_pg_stats(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.outstanding.is_empty() {
            if self.acked.wait_until(&mut state, deadline).timed_out() {
                return state.outstanding.is_empty();
            }
        }
        true
    }

    /// Queue every primary PG again when acks have stopped arriving.
    ///
    /// Returns true if a resend is needed.
    pub fn check_ack_timeout(&self, now: Instant, pgs: &[PgRef]) -> bool {
        {
            let mut state = self.state.lock();
            if state.outstanding.is_empty()
                || now.saturating_duration_since(state.last_ack) < self.config.mon_ack_timeout
            {
                return false;
            }
            tracing::warn!(
                outstanding = state.outstanding.len(),
                silent_secs = now.saturating_duration_since(state.last_ack).as_secs(),
                "monitor not acking pg stats, resending"
            );
            state.outstanding.clear();
            state.last_ack = now;
            state.last_sent = None;
            self.acked.notify_all();
        }

        let primaries: Vec<&PgRef> = pgs
            .iter()
            .filter(|pg| {
                let state = pg.lock();
                state.is_primary() && !state.is_removing()
            })
            .collect();
        let mut state = self.state.lock();
        for pg in primaries {
            state.pending.enqueue(pg.clone());
        }
        true
    }

    /// Forget queued PGs. Used at shutdown and by removal.
    pub fn dequeue_pg(&self, pg: &PgRef) -> bool {
        self.state.lock().pending.remove(pg).is_some()
    }
}

impl Osd {
    /// Send a stats report if one is due.
    pub(crate) fn maybe_send_pg_stats(&self, now: Instant) {
        if self.reporter.check_ack_timeout(now, &self.registry.all()) || self.reporter.is_due(now) {
            self.send_pg_stats();
        }
    }

    pub(crate) fn send_pg_stats(&self) -> Option<Tid> {
        let osd_stat = OsdStat {
            num_pgs: self.registry.len() as u64,
            heartbeat_peers: self.heartbeat.peers(),
            ..Default::default()
        };
        let tid = self.reporter.send_pg_stats(self.epoch(), osd_stat)?;
        self.metrics.stats_reports_sent.inc();
        Some(tid)
    }

    /// Queue `pg` for the next stats report.
    pub(crate) fn queue_stats(&self, pg: &PgRef) {
        self.reporter.queue_pg(pg);
    }

    /// Ask the monitor to raise `up_thru` if a primary PG needs it.
    pub(crate) fn send_alive(&self, want: Epoch) {
        let map = self.osdmap();
        if want <= map.up_thru(self.whoami) || want <= self.up_thru_wanted.load(Ordering::SeqCst) {
            return;
        }
        self.up_thru_wanted.store(want, Ordering::SeqCst);
        tracing::debug!(want, "requesting up_thru");
        self.send(Destination::Mon, Message::Alive { want });
    }

    pub(crate) fn send_boot(&self) {
        let sb = self.superblock.lock().clone();
        tracing::info!(osd = self.whoami, epoch = sb.current_epoch, "sending boot");
        self.send(
            Destination::Mon,
            Message::Boot(BootRequest {
                osd: self.whoami,
                osd_fsid: sb.osd_fsid,
                epoch: sb.current_epoch,
            }),
        );
    }

    /// Primary PGs whose interval started after this node's `up_thru`.
    pub(crate) fn up_thru_needed(&self) -> Option<Epoch> {
        let map = self.osdmap();
        let up_thru = map.up_thru(self.whoami);
        let want: BTreeSet<Epoch> = self
            .registry
            .all()
            .iter()
            .filter_map(|pg| {
                let state = pg.lock();
                (state.is_primary() && state.info.history.same_interval_since > up_thru)
                    .then_some(state.info.history.same_interval_since)
            })
            .collect();
        want.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::Pg;
    use crate::testing::RecordingTransport;
    use crate::types::Role;

    fn primary_pg(seed: u32) -> PgRef {
        let pg = Pg::new_for_test(PgId::new(1, seed));
        pg.lock().role = Role::Primary;
        pg
    }

    fn reporter(transport: Arc<RecordingTransport>) -> PgStatsReporter {
        let config = ReportConfig::default()
            .with_pg_stats_interval(Duration::from_secs(5))
            .with_mon_ack_timeout(Duration::from_secs(30));
        PgStatsReporter::new(config, transport)
    }

    fn reports(transport: &RecordingTransport) -> Vec<PgStatsReport> {
        transport
            .take()
            .into_iter()
            .filter_map(|(_, msg)| match msg {
                Message::PgStats(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_report_covers_queued_primaries() {
        let transport = RecordingTransport::new();
        let reporter = reporter(transport.clone());
        let a = primary_pg(0);
        let b = Pg::new_for_test(PgId::new(1, 1));

        assert!(reporter.queue_pg(&a));
        assert!(!reporter.queue_pg(&a));
        assert!(reporter.queue_pg(&b));
        assert!(reporter.is_due(Instant::now()));

        let tid = reporter.send_pg_stats(3, OsdStat::default()).unwrap();
        let sent = reports(&transport);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tid, tid);
        assert_eq!(sent[0].pgs.keys().copied().collect::<Vec<_>>(), vec![a.id()]);
        assert!(!a.is_queued(QueueKind::Stats));
        assert_eq!(reporter.pending(), 0);
        assert!(reporter.send_pg_stats(3, OsdStat::default()).is_none());
    }

    #[test]
    fn test_flush_waits_for_ack() {
        let transport = RecordingTransport::new();
        let reporter = Arc::new(reporter(transport));
        let pg = primary_pg(0);
        reporter.queue_pg(&pg);
        let tid = reporter.send_pg_stats(1, OsdStat::default()).unwrap();

        assert!(!reporter.flush_pg_stats(Duration::from_millis(20)));

        let acker = reporter.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            acker.handle_pg_stats_ack(tid);
        });
        assert!(reporter.flush_pg_stats(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(reporter.outstanding(), 0);
    }

    #[test]
    fn test_ack_timeout_requeues_primaries() {
        let transport = RecordingTransport::new();
        let reporter = reporter(transport.clone());
        let a = primary_pg(0);
        let b = Pg::new_for_test(PgId::new(1, 1));
        reporter.queue_pg(&a);
        reporter.send_pg_stats(1, OsdStat::default()).unwrap();
        reports(&transport);

        let now = Instant::now();
        let pgs = vec![a.clone(), b.clone()];
        assert!(!reporter.check_ack_timeout(now, &pgs));
        assert!(reporter.check_ack_timeout(now + Duration::from_secs(31), &pgs));
        assert!(a.is_queued(QueueKind::Stats));
        assert!(!b.is_queued(QueueKind::Stats));
        assert_eq!(reporter.outstanding(), 0);

        // Nothing outstanding any more, so no second resend.
        assert!(!reporter.check_ack_timeout(now + Duration::from_secs(62), &pgs));
    }

    #[test]
    fn test_ack_covers_older_reports() {
        let transport = RecordingTransport::new();
        let reporter = reporter(transport);
        let pg = primary_pg(0);
        reporter.queue_pg(&pg);
        let first = reporter.send_pg_stats(1, OsdStat::default()).unwrap();
        reporter.queue_pg(&pg);
        let second = reporter.send_pg_stats(2, OsdStat::default()).unwrap();
        assert_eq!(reporter.outstanding(), 2);

        reporter.handle_pg_stats_ack(first);
        assert_eq!(reporter.outstanding(), 1);
        reporter.handle_pg_stats_ack(second);
        assert_eq!(reporter.outstanding(), 0);
    }
}
