//! Fixed-capacity worker pool.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::metrics::{PoolMetrics, PoolMetricsSnapshot};
use crate::worker::{IdleWorker, Job, TaskTicket, Worker};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Active,
    Releasing,
    Released,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Active,
            1 => PoolState::Releasing,
            _ => PoolState::Released,
        }
    }
}

/// State shared between the pool handle, its workers and the purge loop.
pub(crate) struct Shared {
    config: PoolConfig,
    state: AtomicU8,
    capacity: AtomicUsize,
    /// One permit per free worker slot.
    slots: Semaphore,
    /// Slots to retire instead of returning, left over from shrinking while busy.
    shrink_debt: AtomicUsize,
    blocked: AtomicUsize,
    idle: Mutex<Vec<IdleWorker>>,
    tune_lock: Mutex<()>,
    metrics: Arc<PoolMetrics>,
    tracker: TaskTracker,
    closed: CancellationToken,
    next_worker_id: AtomicU64,
}

impl Shared {
    pub(crate) fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(crate) fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_active(&self) -> bool {
        self.state() == PoolState::Active
    }

    fn idle(&self) -> MutexGuard<'_, Vec<IdleWorker>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a worker onto the idle stack. Returns `None` once the pool is closing.
    pub(crate) fn park(&self) -> Option<oneshot::Receiver<Job>> {
        let mut idle = self.idle();
        // Checked under the lock: `close` flips state before draining the stack.
        if !self.is_active() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        idle.push(IdleWorker {
            tx,
            last_used: Instant::now(),
        });
        Some(rx)
    }

    /// Return a slot after a task finishes, unless a shrink is still owed.
    pub(crate) fn release_slot(&self) {
        let retired = self
            .shrink_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                debt.checked_sub(1)
            })
            .is_ok();

        if !retired {
            self.slots.add_permits(1);
        }
    }

    /// Hand a job to the most recently used idle worker, or spawn a new one.
    fn dispatch(self: &Arc<Self>, mut job: Job) {
        loop {
            let worker = self.idle().pop();
            let Some(worker) = worker else {
                break;
            };
            match worker.tx.send(job) {
                Ok(()) => return,
                Err(returned) => job = returned,
            }
        }

        Worker::spawn(self, Some(job));
    }

    fn purge_expired(&self, expiry: Duration) -> usize {
        let now = Instant::now();
        let mut idle = self.idle();
        let before = idle.len();
        // Dropping the sender wakes the worker with an error and it exits.
        idle.retain(|worker| now.duration_since(worker.last_used) < expiry);
        before - idle.len()
    }

    /// Move `Active -> Releasing`. Only the first caller wins.
    fn begin_release(&self) -> bool {
        self.state
            .compare_exchange(
                PoolState::Active as u8,
                PoolState::Releasing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn close(&self) {
        self.closed.cancel();
        let stopped = {
            let mut idle = self.idle();
            let count = idle.len();
            idle.clear();
            count
        };
        self.tracker.close();
        debug!(pool = %self.config.name, idle_workers = stopped, "Stopped idle workers");
    }

    fn finish_release(&self) {
        self.state
            .store(PoolState::Released as u8, Ordering::Release);
    }
}

/// Bounded pool of long-lived async workers.
///
/// Tasks are `FnOnce() -> Future<Output = eyre::Result<()>>`. A task that
/// returns an error or panics is counted as failed; the worker survives
/// either way. Dropping the pool releases it without waiting for in-flight
/// tasks.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create a pool. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| {
            PoolError::InvalidConfig("worker pool must be created inside a tokio runtime".into())
        })?;

        let metrics = Arc::new(PoolMetrics::new(config.name.clone()));
        metrics.record_capacity(config.max_workers);

        let shared = Arc::new(Shared {
            state: AtomicU8::new(PoolState::Active as u8),
            capacity: AtomicUsize::new(config.max_workers),
            slots: Semaphore::new(config.max_workers),
            shrink_debt: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            idle: Mutex::new(Vec::with_capacity(if config.pre_alloc {
                config.max_workers
            } else {
                0
            })),
            tune_lock: Mutex::new(()),
            metrics,
            tracker: TaskTracker::new(),
            closed: CancellationToken::new(),
            next_worker_id: AtomicU64::new(0),
            config,
        });

        if shared.config.pre_alloc {
            for _ in 0..shared.config.max_workers {
                Worker::spawn(&shared, None);
            }
        }

        shared.tracker.spawn(purge_loop(
            Arc::downgrade(&shared),
            shared.closed.clone(),
            shared.config.expiry_duration,
        ));

        info!(
            pool = %shared.config.name,
            max_workers = shared.config.max_workers,
            max_blocking_tasks = shared.config.max_blocking_tasks,
            nonblocking = shared.config.nonblocking,
            pre_alloc = shared.config.pre_alloc,
            "Worker pool created"
        );

        Ok(Self { shared })
    }

    /// Submit a task.
    ///
    /// In blocking mode this waits for a free worker, honouring `ctx`
    /// cancellation. Rejected submissions are counted as failed.
    pub async fn submit<F, Fut>(&self, ctx: &CancellationToken, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let shared = &self.shared;

        if ctx.is_cancelled() {
            shared.metrics.record_failed();
            return Err(PoolError::Cancelled);
        }
        if !shared.is_active() {
            shared.metrics.record_failed();
            return Err(PoolError::Closed);
        }

        // From here on a failed admission is accounted by dropping the ticket.
        let ticket = TaskTicket::issue(&shared.metrics);
        self.acquire_slot(ctx).await?;

        if !shared.is_active() {
            shared.release_slot();
            return Err(PoolError::Closed);
        }

        shared.dispatch(Job::new(ticket, task));
        Ok(())
    }

    async fn acquire_slot(&self, ctx: &CancellationToken) -> Result<(), PoolError> {
        let shared = &self.shared;

        match shared.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                return Ok(());
            }
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        if shared.config.nonblocking {
            return Err(PoolError::Overloaded);
        }

        let _blocked = BlockedSubmitter::enter(shared)?;

        let permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(PoolError::Cancelled),
            _ = shared.closed.cancelled() => return Err(PoolError::Closed),
            permit = shared.slots.acquire() => permit.map_err(|_| PoolError::Closed)?,
        };
        permit.forget();
        Ok(())
    }

    /// Change capacity at runtime.
    ///
    /// Shrinking below the number of busy workers takes effect as those
    /// tasks finish.
    pub fn tune(&self, size: usize) -> Result<(), PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize(size));
        }
        let shared = &self.shared;
        if !shared.is_active() {
            return Err(PoolError::Closed);
        }

        let _guard = shared
            .tune_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = shared.capacity.load(Ordering::Acquire);

        if size > current {
            let grow = size - current;
            let owed = shared
                .shrink_debt
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                    Some(debt.saturating_sub(grow))
                })
                .unwrap_or_else(|debt| debt);
            shared.slots.add_permits(grow - owed.min(grow));
        } else if size < current {
            let shrink = current - size;
            let forgotten = shared.slots.forget_permits(shrink);
            shared
                .shrink_debt
                .fetch_add(shrink - forgotten, Ordering::AcqRel);
        } else {
            return Ok(());
        }

        shared.capacity.store(size, Ordering::Release);
        shared.metrics.record_capacity(size);
        info!(pool = %shared.config.name, from = current, to = size, "Worker pool resized");
        Ok(())
    }

    /// Stop accepting tasks and retire idle workers. In-flight tasks keep running.
    ///
    /// Idempotent.
    pub fn release(&self) {
        let shared = &self.shared;
        if !shared.begin_release() {
            return;
        }

        shared.close();
        shared.finish_release();
        info!(pool = %shared.config.name, "Worker pool released");
    }

    /// Stop accepting tasks and wait up to `timeout` for in-flight tasks to finish.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        let shared = &self.shared;
        if !shared.begin_release() {
            return Ok(());
        }

        info!(
            pool = %shared.config.name,
            running = self.running(),
            timeout_ms = timeout.as_millis() as u64,
            "Worker pool shutting down"
        );
        shared.close();

        let drained = tokio::time::timeout(timeout, shared.tracker.wait()).await;
        shared.finish_release();

        match drained {
            Ok(()) => {
                info!(pool = %shared.config.name, "Worker pool drained");
                Ok(())
            }
            Err(_) => {
                warn!(
                    pool = %shared.config.name,
                    running = self.running(),
                    "Worker pool shutdown timed out"
                );
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.is_active()
    }

    /// Current capacity.
    pub fn cap(&self) -> usize {
        self.shared.capacity.load(Ordering::Acquire)
    }

    /// Slots available for new tasks.
    pub fn free(&self) -> usize {
        self.shared.slots.available_permits()
    }

    /// Tasks currently executing.
    pub fn running(&self) -> usize {
        self.metrics().running_tasks.max(0) as usize
    }

    /// Tasks admitted but not yet started, including blocked submitters.
    pub fn waiting(&self) -> usize {
        self.metrics().waiting_tasks.max(0) as usize
    }

    /// Parked workers ready to take a task without spawning.
    pub fn idle_workers(&self) -> usize {
        self.shared.idle().len()
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.shared.metrics.snapshot(self.cap(), self.free())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("cap", &self.cap())
            .field("free", &self.free())
            .finish()
    }
}

/// Counts a submitter waiting for a slot; enforces `max_blocking_tasks`.
struct BlockedSubmitter<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> BlockedSubmitter<'a> {
    fn enter(shared: &'a Shared) -> Result<Self, PoolError> {
        let limit = shared.config.max_blocking_tasks;
        shared
            .blocked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |blocked| {
                (limit == 0 || blocked < limit).then_some(blocked + 1)
            })
            .map_err(|_| PoolError::Overloaded)?;

        Ok(Self {
            counter: &shared.blocked,
        })
    }
}

impl Drop for BlockedSubmitter<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn purge_loop(shared: Weak<Shared>, closed: CancellationToken, expiry: Duration) {
    let mut ticker = tokio::time::interval(expiry);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        let retired = shared.purge_expired(expiry);
        if retired > 0 {
            debug!(pool = %shared.config.name, retired, "Retired expired idle workers");
        }
    }
}
