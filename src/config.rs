//! Configuration types for the node daemon.

use crate::types::OsdId;
use std::time::Duration;

/// Main configuration for one OSD.
#[derive(Debug, Clone)]
pub struct OsdConfig {
    /// This node's OSD id.
    pub whoami: OsdId,

    /// Worker threads serving the operation queue.
    pub op_threads: usize,

    /// Worker threads serving the recovery queue.
    pub recovery_threads: usize,

    /// Worker threads serving disk-bound queues (snap trim, scrub, removal).
    pub disk_threads: usize,

    /// Worker threads serving administrative commands.
    pub command_threads: usize,

    /// Maximum number of client/sub ops queued across all PGs.
    pub op_queue_capacity: usize,

    /// Number of epochs retained by the map cache.
    pub map_cache_size: usize,

    /// Maximum number of incrementals sent when sharing maps with a peer.
    pub map_share_max_epochs: usize,

    /// Interval of the housekeeping tick.
    pub tick_interval: Duration,

    /// Ops in flight longer than this are reported as slow.
    pub op_complaint_time: Duration,

    /// How long an idle worker sleeps before re-checking gated queues.
    pub worker_poll_interval: Duration,

    /// Recovery configuration.
    pub recovery: RecoveryConfig,

    /// Scrub configuration.
    pub scrub: ScrubConfig,

    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,

    /// Monitor reporting configuration.
    pub report: ReportConfig,
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            whoami: 0,
            op_threads: 2,
            recovery_threads: 1,
            disk_threads: 1,
            command_threads: 1,
            op_queue_capacity: 1000,
            map_cache_size: 500,
            map_share_max_epochs: 100,
            tick_interval: Duration::from_secs(1),
            op_complaint_time: Duration::from_secs(30),
            worker_poll_interval: Duration::from_millis(100),
            recovery: RecoveryConfig::default(),
            scrub: ScrubConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl OsdConfig {
    /// Create a configuration for the given OSD id.
    pub fn new(whoami: OsdId) -> Self {
        Self {
            whoami,
            ..Default::default()
        }
    }

    /// Set the number of op worker threads.
    pub fn with_op_threads(mut self, n: usize) -> Self {
        self.op_threads = n;
        self
    }

    /// Set the number of disk worker threads.
    pub fn with_disk_threads(mut self, n: usize) -> Self {
        self.disk_threads = n;
        self
    }

    /// Set the op queue capacity.
    pub fn with_op_queue_capacity(mut self, capacity: usize) -> Self {
        self.op_queue_capacity = capacity;
        self
    }

    /// Set the map cache size.
    pub fn with_map_cache_size(mut self, size: usize) -> Self {
        self.map_cache_size = size;
        self
    }

    /// Set the op complaint time.
    pub fn with_op_complaint_time(mut self, t: Duration) -> Self {
        self.op_complaint_time = t;
        self
    }

    /// Set the idle worker poll interval.
    pub fn with_worker_poll_interval(mut self, t: Duration) -> Self {
        self.worker_poll_interval = t;
        self
    }

    /// Set recovery configuration.
    pub fn with_recovery_config(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Set scrub configuration.
    pub fn with_scrub_config(mut self, scrub: ScrubConfig) -> Self {
        self.scrub = scrub;
        self
    }

    /// Set heartbeat configuration.
    pub fn with_heartbeat_config(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set report configuration.
    pub fn with_report_config(mut self, report: ReportConfig) -> Self {
        self.report = report;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let pools = [
            ("op_threads", self.op_threads),
            ("recovery_threads", self.recovery_threads),
            ("disk_threads", self.disk_threads),
            ("command_threads", self.command_threads),
        ];
        for (name, n) in pools {
            if n == 0 {
                return Err(crate::Error::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.op_queue_capacity == 0 {
            return Err(crate::Error::Config(
                "op_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.map_cache_size < 2 {
            return Err(crate::Error::Config(
                "map_cache_size must be at least 2".to_string(),
            ));
        }
        if self.heartbeat.grace <= self.heartbeat.interval {
            return Err(crate::Error::Config(
                "heartbeat grace must exceed the heartbeat interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Recovery throttling.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Recovery is held back this long after a PG is queued.
    pub delay_start: Duration,

    /// Maximum recovery ops active across all PGs.
    pub max_active: usize,

    /// Maximum objects recovered per PG per pass.
    pub max_chunk: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            delay_start: Duration::from_secs(15),
            max_active: 5,
            max_chunk: 8,
        }
    }
}

impl RecoveryConfig {
    pub fn with_delay_start(mut self, delay: Duration) -> Self {
        self.delay_start = delay;
        self
    }

    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = max;
        self
    }
}

/// Scrub scheduling.
#[derive(Debug, Clone)]
pub struct ScrubConfig {
    /// Maximum concurrent scrubs (pending + active) on this node.
    pub max_scrubs: usize,

    /// A PG is not scrubbed again before this much time has passed.
    pub min_interval: Duration,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            max_scrubs: 1,
            min_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Peer liveness checking.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Base interval between pings (randomized by up to 50%).
    pub interval: Duration,

    /// A peer silent for longer than this is reported failed.
    pub grace: Duration,

    /// Unacknowledged failure reports are forgotten after this long.
    pub failure_report_expiry: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6),
            grace: Duration::from_secs(20),
            failure_report_expiry: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_failure_report_expiry(mut self, expiry: Duration) -> Self {
        self.failure_report_expiry = expiry;
        self
    }
}

/// Reporting to the cluster monitor.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Minimum interval between PG stat reports.
    pub pg_stats_interval: Duration,

    /// Reports unacknowledged for this long trigger a resync.
    pub mon_ack_timeout: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            pg_stats_interval: Duration::from_secs(5),
            mon_ack_timeout: Duration::from_secs(30),
        }
    }
}

impl ReportConfig {
    pub fn with_pg_stats_interval(mut self, interval: Duration) -> Self {
        self.pg_stats_interval = interval;
        self
    }

    pub fn with_mon_ack_timeout(mut self, timeout: Duration) -> Self {
        self.mon_ack_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OsdConfig::default();
        assert_eq!(config.whoami, 0);
        assert_eq!(config.op_queue_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = OsdConfig::new(3)
            .with_op_threads(4)
            .with_op_queue_capacity(10)
            .with_recovery_config(RecoveryConfig::default().with_max_active(2));

        assert_eq!(config.whoami, 3);
        assert_eq!(config.op_threads, 4);
        assert_eq!(config.op_queue_capacity, 10);
        assert_eq!(config.recovery.max_active, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(OsdConfig::new(1).with_op_threads(0).validate().is_err());
        assert!(OsdConfig::new(1).with_map_cache_size(1).validate().is_err());

        let hb = HeartbeatConfig::default()
            .with_interval(Duration::from_secs(10))
            .with_grace(Duration::from_secs(5));
        assert!(OsdConfig::new(1).with_heartbeat_config(hb).validate().is_err());
    }
}
