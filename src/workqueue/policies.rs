//! Queue policies used by the node's queues.

use super::QueuePolicy;
use crate::pg::{PgRef, QueueKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Plain FIFO of distinct items (messages, commands).
#[derive(Debug)]
pub struct FifoQueue<T> {
    items: VecDeque<T>,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> QueuePolicy for FifoQueue<T> {
    type Item = T;

    fn enqueue(&mut self, item: T) -> bool {
        self.items.push_back(item);
        true
    }

    fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

/// FIFO of PGs with at most one entry per PG.
///
/// Membership is tracked by the PG's flag for `kind`, which only this
/// policy touches, always under the queue lock.
#[derive(Debug)]
pub struct PgQueue {
    kind: QueueKind,
    pgs: VecDeque<PgRef>,
}

impl PgQueue {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            pgs: VecDeque::new(),
        }
    }
}

fn remove_pg(pgs: &mut VecDeque<PgRef>, kind: QueueKind, pg: &PgRef) -> Option<PgRef> {
    if !pg.is_queued(kind) {
        return None;
    }
    let pos = pgs.iter().position(|p| Arc::ptr_eq(p, pg))?;
    let removed = pgs.remove(pos)?;
    removed.clear_queued(kind);
    Some(removed)
}

impl QueuePolicy for PgQueue {
    type Item = PgRef;

    fn enqueue(&mut self, pg: PgRef) -> bool {
        if !pg.mark_queued(self.kind) {
            return false;
        }
        self.pgs.push_back(pg);
        true
    }

    fn dequeue(&mut self) -> Option<PgRef> {
        let pg = self.pgs.pop_front()?;
        pg.clear_queued(self.kind);
        Some(pg)
    }

    fn remove(&mut self, pg: &PgRef) -> Option<PgRef> {
        remove_pg(&mut self.pgs, self.kind, pg)
    }

    fn is_empty(&self) -> bool {
        self.pgs.is_empty()
    }

    fn len(&self) -> usize {
        self.pgs.len()
    }

    fn clear(&mut self) -> Vec<PgRef> {
        let pgs: Vec<PgRef> = self.pgs.drain(..).collect();
        for pg in &pgs {
            pg.clear_queued(self.kind);
        }
        pgs
    }
}

/// Node-wide cap on concurrently active recovery ops.
#[derive(Debug)]
pub struct RecoveryGate {
    active: AtomicUsize,
    max: usize,
}

impl RecoveryGate {
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max: max.max(1),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.active.load(Ordering::SeqCst) < self.max
    }

    /// Reserve up to `want` slots. Returns how many were granted.
    pub fn try_start(&self, want: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                granted = want.min(self.max.saturating_sub(active));
                (granted > 0).then_some(active + granted)
            });
        granted
    }

    /// Release `n` slots.
    pub fn finish(&self, n: usize) {
        if n == 0 {
            return;
        }
        let prev = self.active.fetch_sub(n, Ordering::SeqCst);
        assert!(prev >= n, "recovery gate underflow: {} < {}", prev, n);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// PGs waiting for recovery.
///
/// Nothing is handed out before `defer_until` or while the recovery gate is
/// full; idle workers poll, so a gate release is noticed within one poll
/// interval even without an explicit wake.
#[derive(Debug)]
pub struct RecoveryQueue {
    pgs: VecDeque<PgRef>,
    defer_until: Instant,
    gate: Arc<RecoveryGate>,
}

impl RecoveryQueue {
    pub fn new(gate: Arc<RecoveryGate>, delay_start: Duration) -> Self {
        Self {
            pgs: VecDeque::new(),
            defer_until: Instant::now() + delay_start,
            gate,
        }
    }
}

impl QueuePolicy for RecoveryQueue {
    type Item = PgRef;

    fn enqueue(&mut self, pg: PgRef) -> bool {
        if !pg.mark_queued(QueueKind::Recovery) {
            return false;
        }
        self.pgs.push_back(pg);
        true
    }

    fn dequeue(&mut self) -> Option<PgRef> {
        if Instant::now() < self.defer_until || !self.gate.has_capacity() {
            return None;
        }
        let pg = self.pgs.pop_front()?;
        pg.clear_queued(QueueKind::Recovery);
        Some(pg)
    }

    fn remove(&mut self, pg: &PgRef) -> Option<PgRef> {
        remove_pg(&mut self.pgs, QueueKind::Recovery, pg)
    }

    fn is_empty(&self) -> bool {
        self.pgs.is_empty()
    }

    fn len(&self) -> usize {
        self.pgs.len()
    }

    fn clear(&mut self) -> Vec<PgRef> {
        let pgs: Vec<PgRef> = self.pgs.drain(..).collect();
        for pg in &pgs {
            pg.clear_queued(QueueKind::Recovery);
        }
        pgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::Pg;
    use crate::types::PgId;
    use crate::workqueue::WorkQueue;
    use std::thread;

    fn test_pg(seed: u32) -> PgRef {
        Pg::new_for_test(PgId::new(1, seed))
    }

    #[test]
    fn test_concurrent_enqueue_is_idempotent() {
        let queue = WorkQueue::new("op", PgQueue::new(QueueKind::Op), |_| {});
        let pg = test_pg(0);

        let added: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let queue = queue.clone();
                    let pg = pg.clone();
                    s.spawn(move || queue.queue(pg) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(added, 1);
        assert_eq!(queue.len(), 1);
        assert!(pg.is_queued(QueueKind::Op));
    }

    #[test]
    fn test_pg_queue_fifo_and_requeue() {
        let mut policy = PgQueue::new(QueueKind::Op);
        let pgs: Vec<_> = (0..4).map(test_pg).collect();
        for pg in &pgs {
            assert!(policy.enqueue(pg.clone()));
        }
        for pg in &pgs {
            let out = policy.dequeue().unwrap();
            assert!(Arc::ptr_eq(&out, pg));
            assert!(!out.is_queued(QueueKind::Op));
        }
        assert!(policy.dequeue().is_none());

        // A dequeued PG can be queued again.
        assert!(policy.enqueue(pgs[0].clone()));
    }

    #[test]
    fn test_reference_released_by_last_queue() {
        let mut op = PgQueue::new(QueueKind::Op);
        let mut scrub = PgQueue::new(QueueKind::Scrub);

        let pg = test_pg(7);
        let weak = Arc::downgrade(&pg);
        op.enqueue(pg.clone());
        scrub.enqueue(pg.clone());
        assert_eq!(Arc::strong_count(&pg), 3);
        drop(pg);

        let handle = weak.upgrade().unwrap();
        assert!(op.remove(&handle).is_some());
        drop(handle);
        assert!(weak.upgrade().is_some(), "still held by the scrub queue");

        let handle = weak.upgrade().unwrap();
        assert!(scrub.remove(&handle).is_some());
        drop(handle);
        assert!(weak.upgrade().is_none(), "freed after the last queue dropped it");
    }

    #[test]
    fn test_clear_resets_flags() {
        let mut policy = PgQueue::new(QueueKind::Remove);
        let pg = test_pg(1);
        policy.enqueue(pg.clone());
        assert_eq!(policy.clear().len(), 1);
        assert!(!pg.is_queued(QueueKind::Remove));
    }

    #[test]
    fn test_recovery_gate() {
        let gate = RecoveryGate::new(3);
        assert_eq!(gate.try_start(2), 2);
        assert_eq!(gate.try_start(5), 1);
        assert_eq!(gate.try_start(1), 0);
        assert!(!gate.has_capacity());
        gate.finish(2);
        assert_eq!(gate.active(), 1);
        assert!(gate.has_capacity());
    }

    #[test]
    fn test_recovery_queue_holds_items_back() {
        let gate = Arc::new(RecoveryGate::new(1));
        let mut delayed = RecoveryQueue::new(gate.clone(), Duration::from_secs(60));
        delayed.enqueue(test_pg(0));
        assert!(delayed.dequeue().is_none());
        assert_eq!(delayed.len(), 1);

        let mut ready = RecoveryQueue::new(gate.clone(), Duration::ZERO);
        ready.enqueue(test_pg(1));
        assert_eq!(gate.try_start(1), 1);
        assert!(ready.dequeue().is_none(), "gate is full");
        gate.finish(1);
        assert!(ready.dequeue().is_some());
    }
}
