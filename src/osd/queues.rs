//! The node's work queues and the pools that serve them.

use super::Osd;
use crate::config::OsdConfig;
use crate::network::messages::{CommandRequest, RepScrub};
use crate::pg::{PgRef, QueueKind};
use crate::types::{ConnectionId, OsdId};
use crate::workqueue::{FifoQueue, PgQueue, RecoveryGate, RecoveryQueue, ThreadPool, WorkQueue};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// An administrative command waiting for a command worker.
#[derive(Debug)]
pub(crate) struct CommandItem {
    pub conn: ConnectionId,
    pub req: CommandRequest,
}

/// Build a process function that runs `f` while the node is alive.
fn with_osd<T: Send + 'static>(
    osd: &Weak<Osd>,
    f: fn(&Osd, T),
) -> impl Fn(T) + Send + Sync + 'static {
    let osd = osd.clone();
    move |item| {
        if let Some(osd) = osd.upgrade() {
            f(&osd, item);
        }
    }
}

pub(crate) struct OsdQueues {
    pub op: Arc<WorkQueue<PgQueue>>,
    pub recovery: Arc<WorkQueue<RecoveryQueue>>,
    pub snap_trim: Arc<WorkQueue<PgQueue>>,
    pub scrub: Arc<WorkQueue<PgQueue>>,
    pub scrub_finalize: Arc<WorkQueue<PgQueue>>,
    pub remove: Arc<WorkQueue<PgQueue>>,
    pub rep_scrub: Arc<WorkQueue<FifoQueue<(OsdId, RepScrub)>>>,
    pub command: Arc<WorkQueue<FifoQueue<CommandItem>>>,

    op_tp: ThreadPool,
    recovery_tp: ThreadPool,
    disk_tp: ThreadPool,
    command_tp: ThreadPool,
}

impl OsdQueues {
    pub fn new(osd: &Weak<Osd>, config: &OsdConfig, gate: Arc<RecoveryGate>) -> Self {
        let poll = config.worker_poll_interval;
        let op = WorkQueue::new("op", PgQueue::new(QueueKind::Op), with_osd(osd, Osd::process_op_pg));
        let recovery = WorkQueue::new(
            "recovery",
            RecoveryQueue::new(gate, config.recovery.delay_start),
            with_osd(osd, Osd::process_recovery),
        );
        let snap_trim = WorkQueue::new(
            "snap_trim",
            PgQueue::new(QueueKind::SnapTrim),
            with_osd(osd, Osd::process_snap_trim),
        );
        let scrub = WorkQueue::new(
            "scrub",
            PgQueue::new(QueueKind::Scrub),
            with_osd(osd, Osd::process_scrub),
        );
        let scrub_finalize = WorkQueue::new(
            "scrub_finalize",
            PgQueue::new(QueueKind::ScrubFinalize),
            with_osd(osd, Osd::process_scrub_finalize),
        );
        let remove = WorkQueue::new(
            "remove",
            PgQueue::new(QueueKind::Remove),
            with_osd(osd, Osd::process_remove),
        );
        let rep_scrub = WorkQueue::new(
            "rep_scrub",
            FifoQueue::new(),
            with_osd(osd, Osd::process_rep_scrub),
        );
        let command = WorkQueue::new(
            "command",
            FifoQueue::new(),
            with_osd(osd, Osd::process_command),
        );

        let op_tp = ThreadPool::new("op_tp", config.op_threads, poll);
        op_tp.add_queue(&op);
        let recovery_tp = ThreadPool::new("recovery_tp", config.recovery_threads, poll);
        recovery_tp.add_queue(&recovery);
        let disk_tp = ThreadPool::new("disk_tp", config.disk_threads, poll);
        disk_tp.add_queue(&snap_trim);
        disk_tp.add_queue(&scrub);
        disk_tp.add_queue(&scrub_finalize);
        disk_tp.add_queue(&remove);
        disk_tp.add_queue(&rep_scrub);
        let command_tp = ThreadPool::new("command_tp", config.command_threads, poll);
        command_tp.add_queue(&command);

        Self {
            op,
            recovery,
            snap_trim,
            scrub,
            scrub_finalize,
            remove,
            rep_scrub,
            command,
            op_tp,
            recovery_tp,
            disk_tp,
            command_tp,
        }
    }

    pub fn start(&self) -> crate::Result<()> {
        self.op_tp.start()?;
        self.recovery_tp.start()?;
        self.disk_tp.start()?;
        self.command_tp.start()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.op_tp.stop();
        self.recovery_tp.stop();
        self.disk_tp.stop();
        self.command_tp.stop();
    }

    /// Drop everything queued and wait for in-progress items.
    pub fn drain_all(&self) {
        let dropped = self.op.drain()
            + self.recovery.drain()
            + self.snap_trim.drain()
            + self.scrub.drain()
            + self.scrub_finalize.drain()
            + self.remove.drain()
            + self.rep_scrub.drain()
            + self.command.drain();
        tracing::debug!(dropped, "drained work queues");
    }

    /// Unlink `pg` from every PG queue except removal.
    pub fn dequeue_pg_everywhere(&self, pg: &PgRef) {
        self.op.dequeue_item(pg);
        self.recovery.dequeue_item(pg);
        self.snap_trim.dequeue_item(pg);
        self.scrub.dequeue_item(pg);
        self.scrub_finalize.dequeue_item(pg);
    }

    /// Wait until every queue except recovery is idle.
    ///
    /// Recovery holds items back while deferred or throttled, so it is only
    /// waited on once it has something it can hand out.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let left = || deadline.saturating_duration_since(Instant::now());
        self.op.wait_for_idle(left())
            && self.snap_trim.wait_for_idle(left())
            && self.scrub.wait_for_idle(left())
            && self.scrub_finalize.wait_for_idle(left())
            && self.remove.wait_for_idle(left())
            && self.rep_scrub.wait_for_idle(left())
            && self.command.wait_for_idle(left())
    }
}
