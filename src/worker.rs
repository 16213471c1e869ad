//! Queue lanes and worker pools
//!
//! One generic lane implementation covers every message stream: a FIFO
//! queue, a pool of OS worker threads, and a processing strategy. A
//! [`Processor::Single`] lane hands workers one message at a time; a
//! [`Processor::Batch`] lane drains everything queued into one ordered
//! batch so the role engine can group commits. FIFO order holds within
//! a lane (all lanes here run a single worker); nothing is guaranteed
//! across lanes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::message::Envelope;
use crate::registry::QUIESCE_POLL;
use crate::{NodeError, Result};

/// Per-message callback of a single-item lane.
pub type ItemFn = Arc<dyn Fn(Envelope) + Send + Sync>;
/// Per-batch callback of a batched lane; receives one ordered drain.
pub type BatchFn = Arc<dyn Fn(Vec<Envelope>) + Send + Sync>;

/// How a lane's workers consume the queue.
pub enum Processor {
    Single(ItemFn),
    Batch(BatchFn),
}

/// Sizing and bounds for one lane.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub name: String,
    /// Kept for pool-shape compatibility; workers are spawned eagerly
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue bound; `None` is unbounded
    pub capacity: Option<usize>,
}

impl LaneConfig {
    pub fn single_worker(name: String) -> Self {
        Self {
            name,
            min_workers: 1,
            max_workers: 1,
            capacity: None,
        }
    }
}

struct LaneShared {
    name: String,
    queue: Mutex<VecDeque<Envelope>>,
    available: Condvar,
    stopping: AtomicBool,
    capacity: Option<usize>,
    processor: Processor,
}

/// A named FIFO queue plus its worker pool.
pub struct Lane {
    shared: Arc<LaneShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Lane {
    /// Allocate the queue and start the worker pool.
    pub fn start(config: LaneConfig, processor: Processor) -> Result<Lane> {
        let shared = Arc::new(LaneShared {
            name: config.name.clone(),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopping: AtomicBool::new(false),
            capacity: config.capacity,
            processor,
        });

        let count = config.max_workers.max(1);
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, i))
                .spawn(move || worker_loop(worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.stopping.store(true, Ordering::Release);
                    shared.available.notify_all();
                    return Err(NodeError::ResourceExhausted(format!(
                        "spawn worker for lane {}: {}",
                        config.name, e
                    )));
                }
            }
        }

        log::debug!("lane {} started with {} workers", config.name, count);
        Ok(Lane {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Append a message to the FIFO.
    ///
    /// On failure (lane stopping, or queue at capacity) the message is
    /// handed back so the caller can send the error reply and free it;
    /// a lane never silently swallows a message.
    pub fn enqueue(&self, msg: Envelope) -> std::result::Result<(), Envelope> {
        {
            let mut queue = self.shared.queue.lock();
            if self.shared.stopping.load(Ordering::Acquire) {
                log::warn!("lane {} rejected message: stopping", self.shared.name);
                return Err(msg);
            }
            if let Some(capacity) = self.shared.capacity {
                if queue.len() >= capacity {
                    log::warn!("lane {} rejected message: at capacity", self.shared.name);
                    return Err(msg);
                }
            }
            queue.push_back(msg);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    /// Sleep-poll until the queue is drained. Does not wait for a
    /// message currently inside a callback; [`destroy`](Self::destroy)
    /// joins the workers and covers that.
    pub fn wait_until_empty(&self) {
        while !self.is_empty() {
            thread::sleep(QUIESCE_POLL);
        }
    }

    /// Stop and join the workers. The caller is responsible for
    /// draining the queue first; anything still queued when the last
    /// worker exits is dropped unanswered and logged.
    pub fn destroy(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.available.notify_all();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("lane {} worker panicked", self.shared.name);
            }
        }

        let leftover = self.shared.queue.lock().len();
        if leftover > 0 {
            log::warn!(
                "lane {} destroyed with {} unprocessed messages",
                self.shared.name,
                leftover
            );
        } else {
            log::debug!("lane {} destroyed", self.shared.name);
        }
    }
}

fn worker_loop(shared: Arc<LaneShared>) {
    loop {
        let mut queue = shared.queue.lock();
        while queue.is_empty() {
            if shared.stopping.load(Ordering::Acquire) {
                return;
            }
            shared.available.wait(&mut queue);
        }

        match &shared.processor {
            Processor::Single(callback) => {
                if let Some(msg) = queue.pop_front() {
                    drop(queue);
                    callback(msg);
                }
            }
            Processor::Batch(callback) => {
                // Atomic bulk-dequeue: the whole backlog becomes one
                // ordered unit of work.
                let batch: Vec<Envelope> = queue.drain(..).collect();
                drop(queue);
                if !batch.is_empty() {
                    callback(batch);
                }
            }
        }
    }
}
