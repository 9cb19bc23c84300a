//! # Priority Worker Pool
//!
//! A self-tuning pool draining one unbounded queue. Six instances exist per server:
//! {incoming, outgoing} x {High, Medium, Low}.
//!
//! ## Lifecycle
//! `Stopped -> Running -> Draining -> Stopped`. `start` launches `min_workers` workers and
//! a monitor task; `shutdown` stops new dequeues, lets in-flight items finish and waits
//! for every worker to exit.
//!
//! ## Scaling
//! - The monitor samples queue depth every `monitor_interval`; above `scale_up_threshold`
//!   it adds one worker, up to `max_workers`.
//! - A worker that waits `idle_cooldown` without receiving an item exits, as long as more
//!   than `min_workers` remain.
//!
//! Cancellation is only observed at dequeue, never while a worker owns an item. A failing
//! or panicking callback is logged and the worker carries on.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{PoolSettings, PoolsConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Priority;
use crate::utils::metrics::Metrics;

/// Callback invoked for every dequeued item
pub type Processor<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Running,
    Draining,
}

/// Producer handle onto a pool's queue
pub struct PoolQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for PoolQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> PoolQueue<T> {
    /// Queue an item; never blocks.
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(item).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            ProtocolError::PoolError("queue receiver dropped".to_string())
        })
    }

    /// Items queued and not yet picked up by a worker
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

struct PoolShared<T> {
    name: String,
    settings: PoolSettings,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    depth: Arc<AtomicUsize>,
    workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    processed: AtomicU64,
    failures: AtomicU64,
    state: Mutex<PoolState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    metrics: Option<Arc<Metrics>>,
}

impl<T> PoolShared<T> {
    /// Give up one worker slot if the pool is above its floor
    fn try_retire(&self) -> bool {
        let mut current = self.workers.load(Ordering::Acquire);
        loop {
            if current <= self.settings.min_workers {
                return false;
            }
            match self.workers.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

struct RunContext<T> {
    processor: Processor<T>,
    cancel: CancellationToken,
}

impl<T> Clone for RunContext<T> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

enum Dequeue<T> {
    Item(T),
    Idle,
    Stop,
}

/// Auto-scaling worker pool over one unbounded queue
pub struct PriorityWorkerPool<T> {
    shared: Arc<PoolShared<T>>,
    queue: PoolQueue<T>,
    parent: CancellationToken,
    run: Mutex<Option<RunContext<T>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> PriorityWorkerPool<T> {
    /// Create a stopped pool. `parent` is the server-wide shutdown token.
    pub fn new<S: Into<String>>(name: S, settings: PoolSettings, parent: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(PoolShared {
            name: name.into(),
            settings,
            rx: tokio::sync::Mutex::new(rx),
            depth: depth.clone(),
            workers: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            state: Mutex::new(PoolState::Stopped),
            handles: Mutex::new(Vec::new()),
            metrics: None,
        });
        Self {
            shared,
            queue: PoolQueue { tx, depth },
            parent,
            run: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// Attach a metrics collector; only effective before the pool is shared.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = Some(metrics);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn settings(&self) -> PoolSettings {
        self.shared.settings
    }

    pub fn queue(&self) -> PoolQueue<T> {
        self.queue.clone()
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        self.queue.enqueue(item)
    }

    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> PoolState {
        *self.shared.state.lock()
    }

    /// Stopped -> Running: launch the floor number of workers and the monitor.
    pub fn start(&self, processor: Processor<T>) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != PoolState::Stopped {
                return Err(ProtocolError::PoolError(
                    constants::ERR_POOL_NOT_STOPPED.to_string(),
                ));
            }
            *state = PoolState::Running;
        }

        let ctx = RunContext {
            processor,
            cancel: self.parent.child_token(),
        };
        for _ in 0..self.shared.settings.min_workers {
            spawn_worker(&self.shared, &ctx);
        }

        let monitor = tokio::spawn(monitor_loop(self.shared.clone(), ctx.clone()));
        *self.monitor.lock() = Some(monitor);
        *self.run.lock() = Some(ctx);

        info!(
            pool = %self.shared.name,
            min_workers = self.shared.settings.min_workers,
            max_workers = self.shared.settings.max_workers,
            "Worker pool started"
        );
        Ok(())
    }

    /// Running -> Draining -> Stopped. In-flight items finish before this returns.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state != PoolState::Running {
                return;
            }
            *state = PoolState::Draining;
        }

        if let Some(ctx) = self.run.lock().take() {
            ctx.cancel.cancel();
        }

        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        let handles: Vec<_> = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = %self.shared.name, error = %e, "Worker task failed to join");
            }
        }

        *self.shared.state.lock() = PoolState::Stopped;
        let left = self.depth();
        if left > 0 {
            warn!(pool = %self.shared.name, pending = left, "Pool stopped with queued items");
        } else {
            info!(pool = %self.shared.name, "Worker pool stopped");
        }
    }
}

fn spawn_worker<T: Send + 'static>(shared: &Arc<PoolShared<T>>, ctx: &RunContext<T>) {
    shared.workers.fetch_add(1, Ordering::AcqRel);
    let worker_id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let handle = tokio::spawn(worker_loop(shared.clone(), ctx.clone(), worker_id));
    shared.handles.lock().push(handle);
}

async fn worker_loop<T: Send + 'static>(
    shared: Arc<PoolShared<T>>,
    ctx: RunContext<T>,
    worker_id: usize,
) {
    trace!(pool = %shared.name, worker_id, "Worker started");
    let mut retired = false;

    loop {
        let next = {
            let mut rx = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                rx = shared.rx.lock() => rx,
            };
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Dequeue::Stop,
                item = rx.recv() => match item {
                    Some(item) => Dequeue::Item(item),
                    None => Dequeue::Stop,
                },
                _ = tokio::time::sleep(shared.settings.idle_cooldown) => Dequeue::Idle,
            }
        };

        match next {
            Dequeue::Item(item) => {
                shared.depth.fetch_sub(1, Ordering::AcqRel);
                process_item(&shared, &ctx.processor, item, worker_id).await;
            }
            Dequeue::Idle => {
                if shared.try_retire() {
                    retired = true;
                    debug!(pool = %shared.name, worker_id, "Idle worker retired");
                    break;
                }
            }
            Dequeue::Stop => break,
        }
    }

    if !retired {
        shared.workers.fetch_sub(1, Ordering::AcqRel);
    }
    trace!(pool = %shared.name, worker_id, "Worker exited");
}

async fn process_item<T: Send + 'static>(
    shared: &PoolShared<T>,
    processor: &Processor<T>,
    item: T,
    worker_id: usize,
) {
    let result = AssertUnwindSafe(async { processor(item).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(())) => {
            shared.processed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            shared.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &shared.metrics {
                m.handler_failed();
            }
            warn!(pool = %shared.name, worker_id, error = %e, "Item processing failed");
        }
        Err(_) => {
            shared.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &shared.metrics {
                m.handler_failed();
            }
            error!(pool = %shared.name, worker_id, critical = true, "Item processing panicked");
        }
    }
}

async fn monitor_loop<T: Send + 'static>(shared: Arc<PoolShared<T>>, ctx: RunContext<T>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.settings.monitor_interval) => {}
        }

        let depth = shared.depth.load(Ordering::Acquire);
        let workers = shared.workers.load(Ordering::Acquire);
        if depth > shared.settings.scale_up_threshold && workers < shared.settings.max_workers {
            spawn_worker(&shared, &ctx);
            debug!(
                pool = %shared.name,
                depth,
                workers = workers + 1,
                "Scaled up worker pool"
            );
        }

        shared.handles.lock().retain(|h| !h.is_finished());
    }
}

/// Producer handles for one direction's three tiers
pub struct TierQueues<T> {
    high: PoolQueue<T>,
    medium: PoolQueue<T>,
    low: PoolQueue<T>,
}

impl<T> Clone for TierQueues<T> {
    fn clone(&self) -> Self {
        Self {
            high: self.high.clone(),
            medium: self.medium.clone(),
            low: self.low.clone(),
        }
    }
}

impl<T> TierQueues<T> {
    pub fn get(&self, priority: Priority) -> &PoolQueue<T> {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    pub fn enqueue(&self, priority: Priority, item: T) -> Result<()> {
        self.get(priority).enqueue(item)
    }

    pub fn total_depth(&self) -> usize {
        self.high.depth() + self.medium.depth() + self.low.depth()
    }
}

/// The {High, Medium, Low} pools serving one direction
pub struct TierPools<T> {
    high: PriorityWorkerPool<T>,
    medium: PriorityWorkerPool<T>,
    low: PriorityWorkerPool<T>,
}

/// Which set of pool settings a [`TierPools`] uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl<T: Send + 'static> TierPools<T> {
    pub fn new(
        direction: Direction,
        config: &PoolsConfig,
        parent: &CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Self {
        let build = |priority: Priority| {
            let settings = match direction {
                Direction::Incoming => config.incoming(priority),
                Direction::Outgoing => config.outgoing(priority),
            };
            PriorityWorkerPool::new(
                format!("{}-{}", direction.name(), priority),
                settings,
                parent.clone(),
            )
            .with_metrics(metrics.clone())
        };
        Self {
            high: build(Priority::High),
            medium: build(Priority::Medium),
            low: build(Priority::Low),
        }
    }

    pub fn get(&self, priority: Priority) -> &PriorityWorkerPool<T> {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    pub fn queues(&self) -> TierQueues<T> {
        TierQueues {
            high: self.high.queue(),
            medium: self.medium.queue(),
            low: self.low.queue(),
        }
    }

    pub fn start(&self, processor: Processor<T>) -> Result<()> {
        for priority in Priority::ALL {
            self.get(priority).start(processor.clone())?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        futures::join!(
            self.high.shutdown(),
            self.medium.shutdown(),
            self.low.shutdown()
        );
    }
}
