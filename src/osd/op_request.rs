//! In-flight operation tracking.

use crate::network::messages::{OsdOp, SubOp};
use crate::types::{ConnectionId, EntityName, Epoch, PgId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The message an [`OpRequest`] carries.
#[derive(Debug, Clone)]
pub enum OpMessage {
    Client(OsdOp),
    Sub(SubOp),
}

/// One inbound client op or sub-op.
///
/// Registered with the [`OpTracker`] on construction and unregistered when
/// dropped. Not `Clone`: there is always exactly one owner.
pub struct OpRequest {
    id: u64,
    pub from: EntityName,
    pub conn: ConnectionId,
    pub msg: OpMessage,
    pub received: Instant,
    /// Node epoch when the op arrived.
    pub received_epoch: Epoch,
    tracker: Arc<OpTracker>,
}

impl OpRequest {
    pub fn new(
        tracker: &Arc<OpTracker>,
        from: EntityName,
        conn: ConnectionId,
        msg: OpMessage,
        received_epoch: Epoch,
    ) -> Self {
        let received = Instant::now();
        let id = tracker.register(describe(&from, &msg), received, received_epoch);
        Self {
            id,
            from,
            conn,
            msg,
            received,
            received_epoch,
            tracker: tracker.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Epoch the sender tagged the op with.
    pub fn epoch(&self) -> Epoch {
        match &self.msg {
            OpMessage::Client(op) => op.epoch,
            OpMessage::Sub(op) => op.epoch,
        }
    }

    pub fn pgid(&self) -> PgId {
        match &self.msg {
            OpMessage::Client(op) => op.pgid,
            OpMessage::Sub(op) => op.pgid,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.msg, OpMessage::Client(_))
    }

    pub fn age(&self) -> Duration {
        self.received.elapsed()
    }

    /// Record a processing milestone, shown by `dump_ops_in_flight`.
    pub fn mark_event(&self, event: &'static str) {
        self.tracker.mark_event(self.id, event);
    }
}

impl fmt::Debug for OpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRequest")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("conn", &self.conn)
            .field("msg", &self.msg)
            .finish()
    }
}

impl Drop for OpRequest {
    fn drop(&mut self) {
        self.tracker.unregister(self.id);
    }
}

fn describe(from: &EntityName, msg: &OpMessage) -> String {
    match msg {
        OpMessage::Client(op) => format!(
            "{} {} {} {} e{}",
            from,
            op.kind.name(),
            op.pgid,
            op.oid,
            op.epoch
        ),
        OpMessage::Sub(op) => format!("{} sub_op {} tid {} e{}", from, op.pgid, op.tid, op.epoch),
    }
}

#[derive(Debug, Clone)]
struct TrackedOp {
    description: String,
    received: Instant,
    epoch: Epoch,
    last_event: &'static str,
    warned: bool,
}

/// A tracked op as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct OpSummary {
    pub id: u64,
    pub description: String,
    pub age_ms: u64,
    pub epoch: Epoch,
    pub last_event: &'static str,
}

/// Registry of ops currently in flight. Has its own lock, independent of PG locks.
#[derive(Debug)]
pub struct OpTracker {
    ops: Mutex<BTreeMap<u64, TrackedOp>>,
    next_id: AtomicU64,
    complaint_time: Duration,
}

impl OpTracker {
    pub fn new(complaint_time: Duration) -> Self {
        Self {
            ops: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            complaint_time,
        }
    }

    fn register(&self, description: String, received: Instant, epoch: Epoch) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ops.lock().insert(
            id,
            TrackedOp {
                description,
                received,
                epoch,
                last_event: "initiated",
                warned: false,
            },
        );
        id
    }

    fn unregister(&self, id: u64) {
        let removed = self.ops.lock().remove(&id);
        assert!(removed.is_some(), "op {} unregistered twice", id);
    }

    fn mark_event(&self, id: u64, event: &'static str) {
        if let Some(op) = self.ops.lock().get_mut(&id) {
            op.last_event = event;
        }
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    pub fn dump(&self) -> Vec<OpSummary> {
        let now = Instant::now();
        self.ops
            .lock()
            .iter()
            .map(|(&id, op)| OpSummary {
                id,
                description: op.description.clone(),
                age_ms: now.saturating_duration_since(op.received).as_millis() as u64,
                epoch: op.epoch,
                last_event: op.last_event,
            })
            .collect()
    }

    /// Warn about ops older than the complaint time. Each op is reported once.
    ///
    /// Returns the number of newly slow ops.
    pub fn check_ops_in_flight(&self, now: Instant) -> usize {
        let mut ops = self.ops.lock();
        let mut slow = 0;
        for (id, op) in ops.iter_mut() {
            let age = now.saturating_duration_since(op.received);
            if op.warned || age < self.complaint_time {
                continue;
            }
            op.warned = true;
            slow += 1;
            tracing::warn!(
                op = id,
                age_secs = age.as_secs_f64(),
                last_event = op.last_event,
                "slow request: {}",
                op.description
            );
        }
        slow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::OpKind;

    fn client_op(tracker: &Arc<OpTracker>, epoch: Epoch) -> OpRequest {
        OpRequest::new(
            tracker,
            EntityName::client(1),
            10,
            OpMessage::Client(OsdOp {
                tid: 1,
                pgid: PgId::new(1, 0),
                oid: "obj".to_string(),
                epoch,
                kind: OpKind::Read,
            }),
            epoch,
        )
    }

    #[test]
    fn test_drop_unregisters() {
        let tracker = Arc::new(OpTracker::new(Duration::from_secs(30)));
        let a = client_op(&tracker, 3);
        let b = client_op(&tracker, 4);
        assert_eq!(tracker.len(), 2);
        assert_eq!(a.epoch(), 3);
        assert_eq!(b.pgid(), PgId::new(1, 0));

        drop(a);
        let dump = tracker.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].id, b.id());
        drop(b);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_slow_ops_reported_once() {
        let tracker = Arc::new(OpTracker::new(Duration::from_millis(10)));
        let op = client_op(&tracker, 1);
        op.mark_event("queued");

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(tracker.check_ops_in_flight(later), 1);
        assert_eq!(tracker.check_ops_in_flight(later), 0);
        assert_eq!(tracker.dump()[0].last_event, "queued");
    }
}
