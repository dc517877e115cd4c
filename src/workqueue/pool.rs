//! Fixed-size worker pools.

use super::{QueuePolicy, WorkQueue};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Type-erased view of a work queue, as seen by pool workers.
pub(crate) trait PoolQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Dequeue one item and package it with the process function.
    fn take(self: Arc<Self>) -> Option<Job>;

    fn attach_pool(&self, pool: Weak<PoolShared>);
}

struct PoolState {
    queues: Vec<Arc<dyn PoolQueue>>,
    stopping: bool,
    /// Round-robin cursor into `queues`.
    next: usize,
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl PoolShared {
    pub(crate) fn notify(&self) {
        // Taking the lock orders this wakeup after any worker's empty scan.
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    fn next_job(state: &mut PoolState) -> Option<(String, Job)> {
        let n = state.queues.len();
        for i in 0..n {
            let idx = (state.next + i) % n;
            let queue = state.queues[idx].clone();
            let name = queue.name().to_string();
            if let Some(job) = queue.take() {
                state.next = (idx + 1) % n;
                return Some((name, job));
            }
        }
        None
    }
}

/// A named group of worker threads serving one or more queues.
pub struct ThreadPool {
    name: String,
    num_threads: usize,
    /// Idle workers re-check gated queues this often.
    poll_interval: Duration,
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, num_threads: usize, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            num_threads: num_threads.max(1),
            poll_interval,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queues: Vec::new(),
                    stopping: false,
                    next: 0,
                }),
                cond: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve `queue` from this pool. A queue can belong to one pool only.
    pub fn add_queue<P: QueuePolicy>(&self, queue: &Arc<WorkQueue<P>>) {
        queue.attach_pool(Arc::downgrade(&self.shared));
        let queue: Arc<dyn PoolQueue> = queue.clone();
        self.shared.state.lock().queues.push(queue);
        self.shared.notify();
    }

    /// Spawn the worker threads.
    pub fn start(&self) -> crate::Result<()> {
        let mut threads = self.threads.lock();
        for i in threads.len()..self.num_threads {
            let shared = self.shared.clone();
            let pool = self.name.clone();
            let poll = self.poll_interval;
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || worker_loop(&pool, &shared, poll))
                .map_err(|e| crate::Error::Internal(format!("failed to spawn worker: {}", e)))?;
            threads.push(handle);
        }
        tracing::debug!(pool = %self.name, threads = threads.len(), "thread pool started");
        Ok(())
    }

    /// Stop the workers and join them. Items still queued stay queued.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            self.shared.cond.notify_all();
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "worker exited with a panic");
            }
        }
    }

    /// Wake idle workers so they re-check their queues.
    pub fn wake(&self) {
        self.shared.notify();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(pool: &str, shared: &PoolShared, poll: Duration) {
    loop {
        let (queue, job) = {
            let mut state = shared.state.lock();
            loop {
                if state.stopping {
                    return;
                }
                if let Some(found) = PoolShared::next_job(&mut state) {
                    break found;
                }
                shared.cond.wait_for(&mut state, poll);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(pool, queue = %queue, "work item panicked, aborting");
            std::process::abort();
        }
    }
}
