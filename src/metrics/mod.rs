//! Metrics for the dispatch and scheduling core.
//!
//! Counters track how inbound messages were disposed of and how much
//! background work ran; gauges track queue depths and the current epoch.
//! `to_prometheus` renders the exposition format used by the `status`
//! admin command.

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

/// Node-wide metrics.
#[derive(Debug)]
pub struct OsdMetrics {
    /// Client ops accepted by the dispatch pipeline.
    pub ops_received: Counter,
    /// Client ops that reached a terminal reply.
    pub ops_processed: Counter,
    /// Client ops dropped or answered with an error, by reason.
    pub ops_discarded: LabeledCounter,
    /// Client ops parked until a newer map arrives.
    pub ops_waiting_for_map: Counter,
    /// Sub-ops applied on this node as a replica.
    pub subops_processed: Counter,
    /// Map messages received.
    pub maps_received: Counter,
    /// Epochs applied to the node's view.
    pub epochs_applied: Counter,
    pub pgs_created: Counter,
    pub pgs_removed: Counter,
    pub pgs_split: Counter,
    /// Objects pushed or pulled by recovery.
    pub recovery_ops: Counter,
    pub scrubs_completed: Counter,
    /// Inconsistencies found by scrub.
    pub scrub_errors: Counter,
    pub snaps_trimmed: Counter,
    pub failures_reported: Counter,
    pub stats_reports_sent: Counter,
    pub slow_ops: Counter,
    /// Inbound messages by class.
    pub messages: LabeledCounter,

    pub op_queue_len: Gauge,
    pub num_pgs: Gauge,
    pub ops_in_flight: Gauge,
    pub current_epoch: Gauge,
    pub recovery_active: Gauge,
}

impl OsdMetrics {
    pub fn new() -> Self {
        Self {
            ops_received: Counter::new("osd_ops_received_total", "Client ops received"),
            ops_processed: Counter::new("osd_ops_processed_total", "Client ops completed"),
            ops_discarded: LabeledCounter::new(
                "osd_ops_discarded_total",
                "Client ops discarded or rejected",
                "reason",
            ),
            ops_waiting_for_map: Counter::new(
                "osd_ops_waiting_for_map_total",
                "Client ops parked for a newer map",
            ),
            subops_processed: Counter::new("osd_subops_processed_total", "Replica sub-ops applied"),
            maps_received: Counter::new("osd_maps_received_total", "Map messages received"),
            epochs_applied: Counter::new("osd_epochs_applied_total", "Epochs applied"),
            pgs_created: Counter::new("osd_pgs_created_total", "PGs created"),
            pgs_removed: Counter::new("osd_pgs_removed_total", "PGs removed"),
            pgs_split: Counter::new("osd_pgs_split_total", "PG splits performed"),
            recovery_ops: Counter::new("osd_recovery_ops_total", "Objects pushed or pulled"),
            scrubs_completed: Counter::new("osd_scrubs_completed_total", "Scrubs completed"),
            scrub_errors: Counter::new("osd_scrub_errors_total", "Scrub inconsistencies"),
            snaps_trimmed: Counter::new("osd_snaps_trimmed_total", "Snapshot clones trimmed"),
            failures_reported: Counter::new(
                "osd_failures_reported_total",
                "Peer failure reports sent",
            ),
            stats_reports_sent: Counter::new(
                "osd_stats_reports_sent_total",
                "PG stat reports sent",
            ),
            slow_ops: Counter::new("osd_slow_ops_total", "Slow op complaints"),
            messages: LabeledCounter::new("osd_messages_total", "Inbound messages", "class"),

            op_queue_len: Gauge::new("osd_op_queue_len", "Client and sub ops queued"),
            num_pgs: Gauge::new("osd_num_pgs", "PGs hosted"),
            ops_in_flight: Gauge::new("osd_ops_in_flight", "Tracked in-flight ops"),
            current_epoch: Gauge::new("osd_current_epoch", "Current map epoch"),
            recovery_active: Gauge::new("osd_recovery_active", "Active recovery ops"),
        }
    }

    /// Record a discarded or rejected client op.
    pub fn record_discard(&self, reason: &'static str) {
        self.ops_discarded.inc(reason);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ops_received: self.ops_received.get(),
            ops_processed: self.ops_processed.get(),
            ops_discarded: self.ops_discarded.get_all().iter().map(|(_, n)| n).sum(),
            ops_waiting_for_map: self.ops_waiting_for_map.get(),
            subops_processed: self.subops_processed.get(),
            epochs_applied: self.epochs_applied.get(),
            pgs_created: self.pgs_created.get(),
            pgs_removed: self.pgs_removed.get(),
            recovery_ops: self.recovery_ops.get(),
            scrubs_completed: self.scrubs_completed.get(),
            scrub_errors: self.scrub_errors.get(),
            failures_reported: self.failures_reported.get(),
            stats_reports_sent: self.stats_reports_sent.get(),
            num_pgs: self.num_pgs.get(),
            op_queue_len: self.op_queue_len.get(),
            current_epoch: self.current_epoch.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.ops_received);
        add_metric!("counter", self.ops_processed);
        add_metric!("counter", self.ops_waiting_for_map);
        add_metric!("counter", self.subops_processed);
        add_metric!("counter", self.maps_received);
        add_metric!("counter", self.epochs_applied);
        add_metric!("counter", self.pgs_created);
        add_metric!("counter", self.pgs_removed);
        add_metric!("counter", self.pgs_split);
        add_metric!("counter", self.recovery_ops);
        add_metric!("counter", self.scrubs_completed);
        add_metric!("counter", self.scrub_errors);
        add_metric!("counter", self.snaps_trimmed);
        add_metric!("counter", self.failures_reported);
        add_metric!("counter", self.stats_reports_sent);
        add_metric!("counter", self.slow_ops);

        for labeled in [&self.ops_discarded, &self.messages] {
            output.push_str(&format!(
                "# HELP {} {}\n# TYPE {} counter\n",
                labeled.name(),
                labeled.help(),
                labeled.name()
            ));
            for (value, count) in labeled.get_all() {
                output.push_str(&format!(
                    "{}{{{}=\"{}\"}} {}\n",
                    labeled.name(),
                    labeled.label(),
                    value,
                    count
                ));
            }
        }

        add_metric!("gauge", self.op_queue_len);
        add_metric!("gauge", self.num_pgs);
        add_metric!("gauge", self.ops_in_flight);
        add_metric!("gauge", self.current_epoch);
        add_metric!("gauge", self.recovery_active);

        output
    }
}

impl Default for OsdMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of the headline metrics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub ops_received: u64,
    pub ops_processed: u64,
    pub ops_discarded: u64,
    pub ops_waiting_for_map: u64,
    pub subops_processed: u64,
    pub epochs_applied: u64,
    pub pgs_created: u64,
    pub pgs_removed: u64,
    pub recovery_ops: u64,
    pub scrubs_completed: u64,
    pub scrub_errors: u64,
    pub failures_reported: u64,
    pub stats_reports_sent: u64,
    pub num_pgs: i64,
    pub op_queue_len: i64,
    pub current_epoch: i64,
}
