//! Bounded execution pool.
//!
//! `pool_size` handlers run at once; up to `queue_depth` more submissions may
//! wait for a slot. Past that, [`ExecutionPool::submit`] fails fast with
//! [`SchedulerError::PoolSaturated`] instead of piling up work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::handler::{HandlerContext, JobHandler};
use crate::model::ExecutionStatus;

const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Terminal result of one handler run.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOutcome {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub queue_depth: usize,
    /// Handlers holding a slot right now.
    pub active: usize,
    /// Submissions waiting for a slot.
    pub queued: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

struct PoolInner {
    slots: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    pool_size: usize,
    queue_depth: usize,
    cancel_grace: Duration,
    shutdown: CancellationToken,
    counters: Counters,
}

#[derive(Clone)]
pub struct ExecutionPool<C> {
    inner: Arc<PoolInner>,
    clock: C,
}

/// A submitted run. Await [`started`](Self::started) to learn when it got a
/// slot, then [`outcome`](Self::outcome) for the result.
pub struct ExecutionHandle {
    started: Option<oneshot::Receiver<DateTime<Utc>>>,
    join: JoinHandle<PoolOutcome>,
}

impl ExecutionHandle {
    /// When the handler got a slot, or `None` if it never will (or this was
    /// already reported). Cancel-safe, so it can sit in a `select!` loop.
    pub async fn started(&mut self) -> Option<DateTime<Utc>> {
        let rx = self.started.as_mut()?;
        let at = rx.await.ok();
        self.started = None;
        at
    }

    pub async fn outcome(self) -> PoolOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => PoolOutcome {
                status: ExecutionStatus::Failed,
                result: None,
                error: Some(format!("execution task failed: {e}")),
                finished_at: Utc::now(),
            },
        }
    }
}

enum Admission {
    Slot(OwnedSemaphorePermit),
    Queued(OwnedSemaphorePermit),
}

impl<C: Clock> ExecutionPool<C> {
    pub fn new(pool_size: usize, queue_depth: usize, clock: C) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                slots: Arc::new(Semaphore::new(pool_size)),
                queue: Arc::new(Semaphore::new(queue_depth)),
                pool_size,
                queue_depth,
                cancel_grace: DEFAULT_CANCEL_GRACE,
                shutdown: CancellationToken::new(),
                counters: Counters::default(),
            }),
            clock,
        }
    }

    /// How long a cancelled handler may keep running before its task is aborted.
    /// Must be called before the pool is cloned.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.cancel_grace = grace;
        }
        self
    }

    /// Queue `handler` for execution, bounded by `timeout`.
    ///
    /// The pool installs its own cancellation token in `ctx.cancel`: it fires
    /// on timeout and on [`cancel_all`](Self::cancel_all).
    pub fn submit(
        &self,
        handler: Arc<dyn JobHandler>,
        mut ctx: HandlerContext,
        timeout: Duration,
    ) -> Result<ExecutionHandle> {
        let admission = match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(permit) => Admission::Slot(permit),
            Err(_) => match Arc::clone(&self.inner.queue).try_acquire_owned() {
                Ok(ticket) => Admission::Queued(ticket),
                Err(_) => {
                    self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        job_id = %ctx.job_id,
                        queue_depth = self.inner.queue_depth,
                        "Execution pool saturated"
                    );
                    return Err(SchedulerError::PoolSaturated {
                        queue_depth: self.inner.queue_depth,
                    });
                }
            },
        };

        ctx.cancel = self.inner.shutdown.child_token();
        let (started_tx, started_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let clock = self.clock.clone();

        let join = tokio::spawn(async move {
            let _slot = match admission {
                Admission::Slot(permit) => permit,
                Admission::Queued(ticket) => {
                    let permit = Arc::clone(&inner.slots).acquire_owned().await;
                    drop(ticket);
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            return PoolOutcome {
                                status: ExecutionStatus::Failed,
                                result: None,
                                error: Some("execution pool closed".into()),
                                finished_at: clock.now(),
                            }
                        }
                    }
                }
            };
            let _ = started_tx.send(clock.now());
            run_with_timeout(&inner, handler, ctx, timeout, &clock).await
        });

        Ok(ExecutionHandle {
            started: Some(started_rx),
            join,
        })
    }

    /// Cooperatively cancel every running and queued handler.
    pub fn cancel_all(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            pool_size: inner.pool_size,
            queue_depth: inner.queue_depth,
            active: inner.pool_size - inner.slots.available_permits(),
            queued: inner.queue_depth - inner.queue.available_permits(),
            succeeded: inner.counters.succeeded.load(Ordering::Relaxed),
            failed: inner.counters.failed.load(Ordering::Relaxed),
            timed_out: inner.counters.timed_out.load(Ordering::Relaxed),
            rejected: inner.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

async fn run_with_timeout<C: Clock>(
    inner: &PoolInner,
    handler: Arc<dyn JobHandler>,
    ctx: HandlerContext,
    timeout: Duration,
    clock: &C,
) -> PoolOutcome {
    let job_id = ctx.job_id.clone();
    let cancel = ctx.cancel.clone();
    let mut task = tokio::spawn(handler.run(ctx));

    let (status, result, error) = match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(value))) => (ExecutionStatus::Succeeded, Some(value), None),
        Ok(Ok(Err(message))) => (ExecutionStatus::Failed, None, Some(message)),
        Ok(Err(join_err)) => {
            error!(job_id = %job_id, error = %join_err, "Handler panicked");
            (
                ExecutionStatus::Failed,
                None,
                Some(format!("handler panicked: {join_err}")),
            )
        }
        Err(_) => {
            cancel.cancel();
            if tokio::time::timeout(inner.cancel_grace, &mut task).await.is_err() {
                warn!(job_id = %job_id, "Handler ignored cancellation, aborting");
                task.abort();
            }
            (
                ExecutionStatus::TimedOut,
                None,
                Some(format!("timed out after {}ms", timeout.as_millis())),
            )
        }
    };

    let counter = match status {
        ExecutionStatus::Succeeded => &inner.counters.succeeded,
        ExecutionStatus::TimedOut => &inner.counters.timed_out,
        _ => &inner.counters.failed,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    debug!(job_id = %job_id, %status, "Handler finished");

    PoolOutcome {
        status,
        result,
        error,
        finished_at: clock.now(),
    }
}
