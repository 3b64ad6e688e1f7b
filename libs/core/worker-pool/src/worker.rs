//! Long-lived worker tasks.
//!
//! A worker runs one job at a time. Between jobs it parks itself on the
//! pool's idle stack with a fresh oneshot receiver; dropping the matching
//! sender (expiry purge or release) makes the worker exit.

use crate::metrics::PoolMetrics;
use crate::pool::Shared;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

type BoxedTask = Box<dyn FnOnce() -> BoxFuture<'static, eyre::Result<()>> + Send>;

/// A submitted task together with its accounting ticket.
pub(crate) struct Job {
    task: BoxedTask,
    ticket: TaskTicket,
}

impl Job {
    pub(crate) fn new<F, Fut>(ticket: TaskTicket, task: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        Self {
            task: Box::new(move || task().boxed()),
            ticket,
        }
    }
}

/// Tracks one task through `waiting -> running -> stopped`.
///
/// Dropping a ticket that never started counts the task as failed, so every
/// admitted task ends in exactly one of completed or failed.
pub(crate) struct TaskTicket {
    metrics: Arc<PoolMetrics>,
    started: bool,
}

impl TaskTicket {
    pub(crate) fn issue(metrics: &Arc<PoolMetrics>) -> Self {
        metrics.task_queued();
        Self {
            metrics: metrics.clone(),
            started: false,
        }
    }

    fn start(&mut self) {
        self.metrics.task_started();
        self.started = true;
    }
}

impl Drop for TaskTicket {
    fn drop(&mut self) {
        if self.started {
            self.metrics.task_stopped();
        } else {
            self.metrics.task_abandoned();
        }
    }
}

/// Entry on the idle stack.
pub(crate) struct IdleWorker {
    pub(crate) tx: oneshot::Sender<Job>,
    pub(crate) last_used: Instant,
}

pub(crate) struct Worker {
    id: u64,
    shared: Arc<Shared>,
}

impl Worker {
    /// Spawn a worker on the pool's tracker, optionally with a first job.
    pub(crate) fn spawn(shared: &Arc<Shared>, first: Option<Job>) {
        let worker = Worker {
            id: shared.next_worker_id(),
            shared: shared.clone(),
        };
        shared.tracker().spawn(worker.run(first));
    }

    async fn run(self, mut job: Option<Job>) {
        debug!(worker_id = self.id, "Worker started");

        loop {
            let ran = match job.take() {
                Some(current) => {
                    self.execute(current).await;
                    true
                }
                None => false,
            };

            // Park before handing the slot back so the next submitter reuses this worker.
            let parked = self.shared.park();
            if ran {
                self.shared.release_slot();
            }

            let Some(rx) = parked else {
                break;
            };
            match rx.await {
                Ok(next) => job = Some(next),
                Err(_) => break,
            }
        }

        debug!(worker_id = self.id, "Worker stopped");
    }

    async fn execute(&self, job: Job) {
        let Job { task, mut ticket } = job;
        ticket.start();
        let started = Instant::now();

        let outcome = invoke(task).await;

        drop(ticket);
        let metrics = self.shared.metrics();
        metrics.record_duration(started.elapsed().as_secs_f64());

        match outcome {
            TaskOutcome::Completed => metrics.record_completed(),
            TaskOutcome::Failed(e) => {
                warn!(worker_id = self.id, error = %e, "Task failed");
                metrics.record_failed();
            }
            TaskOutcome::Panicked { message, site } => {
                match site {
                    Some(site) => error!(
                        worker_id = self.id,
                        panic = %message,
                        location = %site.location,
                        backtrace = %site.backtrace,
                        "Task panicked, worker recovered"
                    ),
                    None => error!(
                        worker_id = self.id,
                        panic = %message,
                        "Task panicked, worker recovered"
                    ),
                }
                metrics.record_failed();
            }
        }
    }
}

/// How a task invocation ended.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Completed,
    Failed(eyre::Report),
    Panicked {
        message: String,
        site: Option<PanicSite>,
    },
}

/// Where a panic was raised, captured by the panic hook before unwinding.
#[derive(Debug)]
pub(crate) struct PanicSite {
    location: String,
    backtrace: Backtrace,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that records the panic site for the unwinding thread.
///
/// `catch_unwind` runs on the thread that panicked within the same poll, so
/// the record is taken back before any other task runs there.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|location| location.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            LAST_PANIC.with(|slot| {
                *slot.borrow_mut() = Some(PanicSite {
                    location,
                    backtrace: Backtrace::force_capture(),
                });
            });
            previous(info);
        }));
    });
}

/// Run a task, converting an unwind into [`TaskOutcome::Panicked`].
async fn invoke(task: BoxedTask) -> TaskOutcome {
    install_panic_hook();
    match AssertUnwindSafe(async move { task().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(e)) => TaskOutcome::Failed(e),
        Err(panic) => TaskOutcome::Panicked {
            message: panic_message(panic.as_ref()),
            site: LAST_PANIC.with(|slot| slot.borrow_mut().take()),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
