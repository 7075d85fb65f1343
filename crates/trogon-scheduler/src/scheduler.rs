use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backoff::poll_backoff;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{Result, SchedulerError};
use crate::events::EventBus;
use crate::handler::HandlerRegistry;
use crate::lease::LeaseCoordinator;
use crate::pool::{ExecutionPool, PoolStats};
use crate::traits::{LeasePrimitive, ScheduleStore};
use crate::trigger::TriggerEngine;

/// What a health check or metrics scraper sees.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub holder_id: String,
    /// No failed polls since the last successful one.
    pub healthy: bool,
    pub last_poll_ok: Option<DateTime<Utc>>,
    pub consecutive_poll_failures: u32,
    pub last_error: Option<String>,
    pub in_flight: usize,
    pub event_subscribers: usize,
    pub pool: PoolStats,
}

#[derive(Default)]
struct PollHealth {
    last_poll_ok: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// One worker process: a single poller feeding a bounded execution pool.
///
/// Run as many as you like against the same store and lease backend; per-job
/// leases keep each fire on one worker.
#[derive(Clone)]
pub struct Scheduler<S, L, C> {
    store: S,
    trigger: TriggerEngine<S>,
    dispatcher: Dispatcher<S, L, C>,
    events: EventBus,
    clock: C,
    poll_interval: Duration,
    grace_period: Duration,
    health: Arc<Mutex<PollHealth>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<S, L, C> Scheduler<S, L, C>
where
    S: ScheduleStore,
    L: LeasePrimitive,
    C: Clock,
{
    pub fn new(
        config: &SchedulerConfig,
        store: S,
        lease_primitive: L,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
        clock: C,
    ) -> Self {
        let pool = ExecutionPool::new(config.pool_size, config.queue_depth, clock.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            LeaseCoordinator::new(lease_primitive, clock.clone()),
            pool,
            handlers,
            events.clone(),
            clock.clone(),
            config.holder_id.clone(),
            config.lease_margin,
        );
        Self {
            trigger: TriggerEngine::new(store.clone()),
            store,
            dispatcher,
            events,
            clock,
            poll_interval: config.poll_interval,
            grace_period: config.grace_period,
            health: Arc::default(),
            in_flight: Arc::default(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel this token to stop polling and start draining.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// One cheap read to prove the store answers before we commit to running.
    pub async fn probe(&self) -> Result<()> {
        self.store
            .scan_due(self.clock.now(), None, 1)
            .await
            .map(|_| ())
            .map_err(SchedulerError::infra)
    }

    /// Poll until the shutdown token fires, then drain in-flight executions
    /// for up to the grace period.
    ///
    /// Backend outages never end the loop: polling pauses with exponential
    /// backoff and resumes once the store answers again.
    pub async fn run(&self) -> Result<()> {
        info!(
            holder_id = %self.dispatcher.holder(),
            poll_interval_ms = self.poll_interval.as_millis(),
            pool_size = self.dispatcher.pool().stats().pool_size,
            "Scheduler starting"
        );

        let mut failures = 0u32;
        loop {
            let pause = if failures == 0 {
                self.poll_interval
            } else {
                poll_backoff(self.poll_interval, failures)
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }

            match self.poll_once().await {
                Ok(spawned) => {
                    if failures > 0 {
                        info!(after = failures, "Backend reachable again, polling resumed");
                    }
                    failures = 0;
                    self.record_poll(None);
                    if spawned > 0 {
                        debug!(spawned, "Dispatched due jobs");
                    }
                }
                Err(e) => {
                    failures = backoff_step(failures, &e);
                    if e.is_transient() {
                        warn!(
                            error = %e,
                            consecutive_failures = failures,
                            retry_in_ms = poll_backoff(self.poll_interval, failures).as_millis(),
                            "Trigger poll failed, backing off"
                        );
                    } else {
                        error!(error = %e, "Trigger poll failed");
                    }
                    self.record_poll(Some(e.to_string()));
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Scan once and hand every due job to the dispatcher. Returns how many
    /// dispatches were started.
    pub async fn poll_once(&self) -> Result<usize> {
        let due = self.trigger.due_jobs(self.clock.now());
        futures::pin_mut!(due);
        let mut spawned = 0;

        while let Some(record) = due.next().await {
            let record = record?;
            if self.pool_full() {
                debug!("Execution pool full, leaving remaining due jobs for the next poll");
                break;
            }
            let job_id = record.definition.id.clone();
            if !self.lock_in_flight().insert(job_id.clone()) {
                continue;
            }

            let dispatcher = self.dispatcher.clone();
            let in_flight = Arc::clone(&self.in_flight);
            self.tracker.spawn(async move {
                match dispatcher.dispatch(&record).await {
                    Ok(DispatchOutcome::LeaseDenied) | Ok(DispatchOutcome::NotDue) => {}
                    Ok(outcome) => debug!(job_id = %job_id, ?outcome, "Dispatch finished"),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Dispatch aborted by backend error")
                    }
                }
                in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&job_id);
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    pub fn health(&self) -> HealthSnapshot {
        let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        HealthSnapshot {
            holder_id: self.dispatcher.holder().to_string(),
            healthy: health.consecutive_failures == 0,
            last_poll_ok: health.last_poll_ok,
            consecutive_poll_failures: health.consecutive_failures,
            last_error: health.last_error.clone(),
            in_flight: self.lock_in_flight().len(),
            event_subscribers: self.events.subscriber_count(),
            pool: self.dispatcher.pool().stats(),
        }
    }

    async fn drain(&self) {
        self.tracker.close();
        let in_flight = self.tracker.len();
        info!(in_flight, grace_ms = self.grace_period.as_millis(), "Draining in-flight executions");

        if tokio::time::timeout(self.grace_period, self.tracker.wait())
            .await
            .is_err()
        {
            error!(
                remaining = self.tracker.len(),
                "Grace period elapsed, cancelling remaining executions"
            );
            self.dispatcher.pool().cancel_all();
            return;
        }
        info!("Scheduler stopped cleanly");
    }

    fn pool_full(&self) -> bool {
        let stats = self.dispatcher.pool().stats();
        stats.active >= stats.pool_size && stats.queued >= stats.queue_depth
    }

    fn record_poll(&self, error: Option<String>) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        match error {
            None => {
                health.last_poll_ok = Some(self.clock.now());
                health.consecutive_failures = 0;
                health.last_error = None;
            }
            Some(e) => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.last_error = Some(e);
            }
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Only an unreachable backend slows polling down. Other errors (a record
/// that no longer parses, say) would recur at any rate.
fn backoff_step(failures: u32, error: &SchedulerError) -> u32 {
    if error.is_transient() {
        failures.saturating_add(1)
    } else {
        failures
    }
}
