//! Generic work queue engine.
//!
//! A [`WorkQueue`] pairs a [`QueuePolicy`] (the container and its
//! insertion/gating rules) with a process function. Queues are attached to
//! a [`ThreadPool`], whose workers round-robin across every attached queue
//! and run the process function with no queue or pool lock held.
//!
//! ```text
//!  queue(item) ──► [policy] ──notify──► ThreadPool workers ──► process(item)
//!                     ▲                        │
//!                     └──── dequeue_item ──────┘ (targeted removal)
//! ```

mod policies;
mod pool;

pub use policies::{FifoQueue, PgQueue, RecoveryGate, RecoveryQueue};
pub use pool::ThreadPool;

use parking_lot::{Condvar, Mutex};
use pool::{Job, PoolQueue, PoolShared};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Container and ordering rules of one queue.
///
/// All methods run under the queue's lock and must not block or take PG
/// locks.
pub trait QueuePolicy: Send + 'static {
    type Item: Send + 'static;

    /// Insert an item. Returns false if it was already queued.
    fn enqueue(&mut self, item: Self::Item) -> bool;

    /// Take the next eligible item. May return `None` while non-empty when
    /// the policy is holding items back.
    fn dequeue(&mut self) -> Option<Self::Item>;

    /// Remove a specific item, if queued.
    fn remove(&mut self, _item: &Self::Item) -> Option<Self::Item> {
        None
    }

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Remove every item.
    fn clear(&mut self) -> Vec<Self::Item>;
}

struct QueueState<P> {
    policy: P,
    /// Items handed to workers and not yet finished.
    processing: usize,
}

type ProcessFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// A queue of work items served by a thread pool.
pub struct WorkQueue<P: QueuePolicy> {
    name: String,
    state: Mutex<QueueState<P>>,
    /// Signalled whenever an item finishes processing.
    idle: Condvar,
    process: ProcessFn<P::Item>,
    pool: OnceLock<Weak<PoolShared>>,
}

impl<P: QueuePolicy> WorkQueue<P> {
    pub fn new(
        name: impl Into<String>,
        policy: P,
        process: impl Fn(P::Item) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                policy,
                processing: 0,
            }),
            idle: Condvar::new(),
            process: Box::new(process),
            pool: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an item. Returns false if the policy already held it.
    pub fn queue(&self, item: P::Item) -> bool {
        let added = self.state.lock().policy.enqueue(item);
        if added {
            self.wake();
        }
        added
    }

    /// Remove a specific item without processing it.
    pub fn dequeue_item(&self, item: &P::Item) -> bool {
        let removed = self.state.lock().policy.remove(item);
        removed.is_some()
    }

    /// Drop every queued item, then wait for in-progress items to finish.
    ///
    /// Returns the number of items dropped.
    pub fn drain(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.policy.clear()
        };
        let count = dropped.len();
        drop(dropped);

        let mut state = self.state.lock();
        while state.processing > 0 {
            self.idle.wait(&mut state);
        }
        tracing::debug!(queue = %self.name, dropped = count, "drained queue");
        count
    }

    /// Wait until nothing is queued or processing. Returns false on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.policy.is_empty() || state.processing > 0 {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.policy.is_empty() && state.processing == 0;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().policy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().policy.is_empty()
    }

    /// Poke the pool so gated items are re-checked.
    pub fn wake(&self) {
        if let Some(pool) = self.pool.get().and_then(Weak::upgrade) {
            pool.notify();
        }
    }

    fn attach(&self, pool: Weak<PoolShared>) {
        if self.pool.set(pool).is_err() {
            panic!("work queue {} attached to two pools", self.name);
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        assert!(state.processing > 0, "queue {} processing underflow", self.name);
        state.processing -= 1;
        self.idle.notify_all();
    }
}

impl<P: QueuePolicy> PoolQueue for WorkQueue<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn take(self: Arc<Self>) -> Option<Job> {
        let item = {
            let mut state = self.state.lock();
            let item = state.policy.dequeue()?;
            state.processing += 1;
            item
        };
        Some(Box::new(move || {
            (self.process)(item);
            self.finish();
        }))
    }

    fn attach_pool(&self, pool: Weak<PoolShared>) {
        self.attach(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fifo_queue(
        seen: Arc<Mutex<Vec<u32>>>,
    ) -> Arc<WorkQueue<FifoQueue<u32>>> {
        WorkQueue::new("test", FifoQueue::new(), move |item| {
            seen.lock().push(item);
        })
    }

    #[test]
    fn test_fifo_processing_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = fifo_queue(seen.clone());
        for i in 0..50 {
            assert!(queue.queue(i));
        }

        let pool = ThreadPool::new("test", 1, Duration::from_millis(10));
        pool.add_queue(&queue);
        pool.start().unwrap();

        assert!(queue.wait_for_idle(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        pool.stop();
    }

    #[test]
    fn test_drain_drops_queued_items() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = fifo_queue(seen.clone());
        for i in 0..5 {
            queue.queue(i);
        }
        assert_eq!(queue.drain(), 5);
        assert!(queue.is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_several_queues_share_a_pool() {
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let a = WorkQueue::new("a", FifoQueue::<u32>::new(), move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let b = WorkQueue::new("b", FifoQueue::<u32>::new(), move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        let pool = ThreadPool::new("shared", 2, Duration::from_millis(10));
        pool.add_queue(&a);
        pool.add_queue(&b);
        pool.start().unwrap();

        for i in 0..20 {
            a.queue(i);
            b.queue(i);
        }
        assert!(a.wait_for_idle(Duration::from_secs(5)));
        assert!(b.wait_for_idle(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 40);
        pool.stop();
    }

    #[test]
    fn test_wait_for_idle_times_out_without_workers() {
        let queue = fifo_queue(Arc::new(Mutex::new(Vec::new())));
        queue.queue(1);
        assert!(!queue.wait_for_idle(Duration::from_millis(20)));
    }
}
