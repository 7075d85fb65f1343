//! Runs one fire cycle step for a due job.
//!
//! ```text
//! Pending ──lease──▶ Running ──ok──────────────▶ Pending (next regular fire)
//!    ▲                  │ fail, attempts left
//!    └──── Retrying ◀───┤
//!                       └ fail, exhausted ─────▶ Pending + DeadLetterRecord
//! ```
//!
//! Every state write is a compare-and-swap on the version read at claim time.
//! A lost CAS means another coordinator already moved the job on, so the
//! pending write is dropped without complaint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::retry_delay;
use crate::clock::{Clock, to_chrono};
use crate::config::JobDefinition;
use crate::error::{Result, SchedulerError};
use crate::events::{EventBus, EventType, SchedulerEvent};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::lease::{LeaseCoordinator, lease_ttl, renew_interval};
use crate::model::{
    CyclePhase, DeadLetterRecord, Execution, ExecutionStatus, JobRecord, Lease, ScheduleState,
};
use crate::pool::{ExecutionHandle, ExecutionPool, PoolOutcome};
use crate::schedule::ParsedSchedule;
use crate::traits::{CasOutcome, LeasePrimitive, ScheduleStore};

const ABANDONED: &str = "abandoned by previous lease holder";

/// What a single [`Dispatcher::dispatch`] call ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another holder owns the job right now.
    LeaseDenied,
    /// By the time the lease was ours the job was no longer due, enabled or present.
    NotDue,
    /// A state write lost its compare-and-swap.
    Conflict,
    Succeeded,
    /// Failed with attempts left; the job fires again at `at`.
    Retrying { at: DateTime<Utc> },
    DeadLettered,
    /// The lease expired mid-run. The schedule state is left to the new holder.
    LeaseLost,
}

#[derive(Clone)]
pub struct Dispatcher<S, L, C> {
    store: S,
    leases: LeaseCoordinator<L, C>,
    pool: ExecutionPool<C>,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
    clock: C,
    holder: String,
    lease_margin: Duration,
}

impl<S, L, C> Dispatcher<S, L, C>
where
    S: ScheduleStore,
    L: LeasePrimitive,
    C: Clock,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: S,
        leases: LeaseCoordinator<L, C>,
        pool: ExecutionPool<C>,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
        clock: C,
        holder: impl Into<String>,
        lease_margin: Duration,
    ) -> Self {
        Self {
            store,
            leases,
            pool,
            handlers,
            events,
            clock,
            holder: holder.into(),
            lease_margin,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn pool(&self) -> &ExecutionPool<C> {
        &self.pool
    }

    /// Take the job's lease, run one attempt, and record what happened.
    ///
    /// Handler failures are part of the returned outcome, not errors. `Err`
    /// means the store or lease backend misbehaved.
    pub async fn dispatch(&self, record: &JobRecord) -> Result<DispatchOutcome> {
        let job_id = record.definition.id.as_str();
        let ttl = lease_ttl(record.definition.timeout(), self.lease_margin);

        let Some(lease) = self.leases.try_acquire(job_id, &self.holder, ttl).await? else {
            debug!(job_id, "Lease denied, skipping");
            return Ok(DispatchOutcome::LeaseDenied);
        };

        let mut held = Some(lease);
        let result = self.run_locked(job_id, &mut held, ttl).await;
        if let Some(lease) = held {
            if let Err(e) = self.leases.release(&lease).await {
                warn!(job_id, error = %e, "Failed to release lease, it will expire on its own");
            }
        }
        result
    }

    /// Everything that happens while we hold the lease. `held` is kept current
    /// through renewals and set to `None` once the lease is lost.
    async fn run_locked(
        &self,
        job_id: &str,
        held: &mut Option<Lease>,
        ttl: Duration,
    ) -> Result<DispatchOutcome> {
        let now = self.clock.now();

        // The scan may be stale: re-read under the lease.
        let Some((definition, _)) = self
            .store
            .get_definition(job_id)
            .await
            .map_err(SchedulerError::infra)?
        else {
            return Ok(DispatchOutcome::NotDue);
        };
        let Some(state) = self.store.get_state(job_id).await.map_err(SchedulerError::infra)? else {
            return Ok(DispatchOutcome::NotDue);
        };
        if !definition.enabled || !state.is_due(now) {
            debug!(job_id, "Job no longer due under lease");
            return Ok(DispatchOutcome::NotDue);
        }
        let schedule = definition.validate()?;

        if state.phase == CyclePhase::Running {
            let history = self.reap_orphans(job_id, now).await?;
            // The final attempt already ran; only its dead-letter bookkeeping
            // is missing, so finish that instead of running the handler again.
            if state.attempt >= definition.retry.max_attempts {
                if let Some(last) = history.iter().find(|e| {
                    e.attempt == state.attempt
                        && Some(e.started_at) == state.last_fire
                        && matches!(e.status, ExecutionStatus::Failed | ExecutionStatus::TimedOut)
                }) {
                    info!(job_id, execution_id = %last.id, "Resuming exhausted cycle");
                    return self.on_exhausted(&schedule, &state, last, now).await;
                }
            }
        }

        let mut claimed = state.claim(&self.holder, now);
        match self.store.cas_state(&claimed).await.map_err(SchedulerError::infra)? {
            CasOutcome::Applied(version) => claimed.version = version,
            CasOutcome::Conflict => {
                debug!(job_id, "Claim lost to a concurrent writer");
                return Ok(DispatchOutcome::Conflict);
            }
        }

        let attempt = claimed.attempt;
        let execution = Execution::start(job_id, attempt, now);
        self.store
            .record_execution(&execution)
            .await
            .map_err(SchedulerError::infra)?;
        self.publish(EventType::Scheduled, &execution);
        info!(
            job_id,
            execution_id = %execution.id,
            attempt,
            max_attempts = definition.retry.max_attempts,
            "Dispatching job"
        );

        let outcome = match self.submit(&definition, &claimed, &execution, now) {
            Ok(handle) => self.supervise(handle, &execution, held, ttl).await,
            Err(reason) => PoolOutcome {
                status: ExecutionStatus::Failed,
                result: None,
                error: Some(reason),
                finished_at: self.clock.now(),
            },
        };

        let now = self.clock.now();
        let mut finished = execution
            .finish(outcome.status, outcome.result, outcome.error, outcome.finished_at)
            .unwrap_or_else(|| execution.clone());

        let still_held = held.as_ref().is_some_and(|lease| !lease.is_expired(now));
        if !still_held {
            *held = None;
            finished.lease_lost = true;
            warn!(
                job_id,
                execution_id = %finished.id,
                status = %finished.status,
                "Lease lost during execution, leaving the next decision to the new holder"
            );
            // Dropped by the store if the new holder already reaped it.
            self.store
                .record_execution(&finished)
                .await
                .map_err(SchedulerError::infra)?;
            return Ok(DispatchOutcome::LeaseLost);
        }

        self.store
            .record_execution(&finished)
            .await
            .map_err(SchedulerError::infra)?;

        match finished.status {
            ExecutionStatus::Succeeded => {
                self.on_success(&schedule, &claimed, &finished, now).await
            }
            _ if attempt < definition.retry.max_attempts => {
                self.on_retry(&definition, &claimed, &finished, now).await
            }
            _ => self.on_exhausted(&schedule, &claimed, &finished, now).await,
        }
    }

    fn submit(
        &self,
        definition: &JobDefinition,
        claimed: &ScheduleState,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> std::result::Result<ExecutionHandle, String> {
        let handler = self.handlers.get(&definition.handler.id).ok_or_else(|| {
            SchedulerError::UnknownHandler(definition.handler.id.clone()).to_string()
        })?;
        let ctx = HandlerContext {
            job_id: definition.id.clone(),
            execution_id: execution.id.clone(),
            attempt: execution.attempt,
            fired_at: claimed.cycle_fire.unwrap_or(now),
            args: definition.handler.args.clone(),
            cancel: CancellationToken::new(),
        };
        self.pool
            .submit(handler, ctx, definition.timeout())
            .map_err(|e| e.to_string())
    }

    /// Await the outcome, renewing the lease every TTL/3 meanwhile.
    async fn supervise(
        &self,
        mut handle: ExecutionHandle,
        execution: &Execution,
        held: &mut Option<Lease>,
        ttl: Duration,
    ) -> PoolOutcome {
        let every = renew_interval(ttl);
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                started = handle.started() => {
                    if started.is_some() {
                        self.publish(EventType::Started, execution);
                    }
                    break;
                }
                _ = ticker.tick() => self.renew(held, ttl).await,
            }
        }

        let outcome = handle.outcome();
        tokio::pin!(outcome);
        loop {
            tokio::select! {
                outcome = &mut outcome => return outcome,
                _ = ticker.tick() => self.renew(held, ttl).await,
            }
        }
    }

    async fn renew(&self, held: &mut Option<Lease>, ttl: Duration) {
        let Some(lease) = held.as_ref() else {
            return;
        };
        match self.leases.renew(lease, ttl).await {
            Ok(Some(renewed)) => *held = Some(renewed),
            Ok(None) => *held = None,
            // The lease may still be live; the next tick tries again and local
            // expiry is checked before anything is written.
            Err(e) => warn!(job_id = %lease.job_id, error = %e, "Lease renewal failed"),
        }
    }

    async fn on_success(
        &self,
        schedule: &ParsedSchedule,
        claimed: &ScheduleState,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let cycle_fire = claimed.cycle_fire.unwrap_or(now);
        let next_fire = schedule.advance(cycle_fire, now);
        if !self.write_state(&claimed.complete(next_fire)).await? {
            return Ok(DispatchOutcome::Conflict);
        }
        info!(
            job_id = %claimed.job_id,
            execution_id = %execution.id,
            next_fire = ?next_fire,
            "Job succeeded"
        );
        self.publish(EventType::Succeeded, execution);
        Ok(DispatchOutcome::Succeeded)
    }

    async fn on_retry(
        &self,
        definition: &JobDefinition,
        claimed: &ScheduleState,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let delay = retry_delay(&definition.retry, execution.attempt);
        let at = now + to_chrono(delay);
        if !self.write_state(&claimed.retry_at(at)).await? {
            return Ok(DispatchOutcome::Conflict);
        }
        warn!(
            job_id = %claimed.job_id,
            execution_id = %execution.id,
            attempt = execution.attempt,
            max_attempts = definition.retry.max_attempts,
            delay_ms = delay.as_millis(),
            error = execution.error.as_deref().unwrap_or(""),
            "Attempt failed, retry scheduled"
        );
        self.publish(failure_event(execution.status), execution);
        Ok(DispatchOutcome::Retrying { at })
    }

    async fn on_exhausted(
        &self,
        schedule: &ParsedSchedule,
        claimed: &ScheduleState,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let reason = execution
            .error
            .clone()
            .unwrap_or_else(|| execution.status.to_string());
        let record = DeadLetterRecord {
            job_id: claimed.job_id.clone(),
            execution_id: execution.id.clone(),
            attempts: execution.attempt,
            cycle_fire: claimed.cycle_fire,
            reason,
            recorded_at: now,
        };
        // Record first: if the state write below never lands the job stays
        // due, and the next holder's append for this execution is a no-op.
        self.store
            .append_dead_letter(&record)
            .await
            .map_err(SchedulerError::infra)?;

        let cycle_fire = claimed.cycle_fire.unwrap_or(now);
        let next_fire = schedule.advance(cycle_fire, now);
        if !self.write_state(&claimed.dead_letter(next_fire, now)).await? {
            return Ok(DispatchOutcome::Conflict);
        }
        error!(
            job_id = %record.job_id,
            execution_id = %record.execution_id,
            attempts = record.attempts,
            reason = %record.reason,
            "Attempts exhausted, job dead-lettered"
        );
        self.publish(failure_event(execution.status), execution);
        self.publish(EventType::DeadLettered, execution);
        Ok(DispatchOutcome::DeadLettered)
    }

    async fn write_state(&self, next: &ScheduleState) -> Result<bool> {
        match self.store.cas_state(next).await.map_err(SchedulerError::infra)? {
            CasOutcome::Applied(_) => Ok(true),
            CasOutcome::Conflict => {
                debug!(job_id = %next.job_id, "State moved on underneath us, dropping write");
                Ok(false)
            }
        }
    }

    /// Executions still marked Running for a job we just took over can only
    /// belong to a holder that is gone. Returns the history as it now stands.
    async fn reap_orphans(&self, job_id: &str, now: DateTime<Utc>) -> Result<Vec<Execution>> {
        let mut history = self
            .store
            .executions(job_id)
            .await
            .map_err(SchedulerError::infra)?;
        for execution in &mut history {
            let Some(orphan) =
                execution.finish(ExecutionStatus::Failed, None, Some(ABANDONED.into()), now)
            else {
                continue;
            };
            warn!(
                job_id,
                execution_id = %orphan.id,
                attempt = orphan.attempt,
                "Reaping orphaned execution"
            );
            self.store
                .record_execution(&orphan)
                .await
                .map_err(SchedulerError::infra)?;
            *execution = orphan;
        }
        Ok(history)
    }

    fn publish(&self, event_type: EventType, execution: &Execution) {
        self.events.publish(SchedulerEvent::new(
            event_type,
            &execution.job_id,
            Some(&execution.id),
            execution.attempt,
            self.clock.now(),
        ));
    }
}

fn failure_event(status: ExecutionStatus) -> EventType {
    match status {
        ExecutionStatus::TimedOut => EventType::TimedOut,
        _ => EventType::Failed,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    use super::*;
    use crate::clock::MockClock;
    use crate::config::{HandlerRef, Schedule};
    use crate::handler::EchoHandler;
    use crate::memory::{MemoryLeasePrimitive, MemoryStore};
    use crate::mocks::FlakyStore;

    type TestDispatcher = Dispatcher<MemoryStore, MemoryLeasePrimitive, MockClock>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn backends() -> (MemoryStore, MemoryLeasePrimitive, EventBus) {
        (MemoryStore::new(), MemoryLeasePrimitive::new(), EventBus::new())
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", EchoHandler);
        registry.register("fail", |_ctx: HandlerContext| async {
            Err::<Value, _>("boom".to_string())
        });
        registry
    }

    fn dispatcher(
        store: &MemoryStore,
        locks: &MemoryLeasePrimitive,
        clock: &MockClock,
        holder: &str,
        handlers: HandlerRegistry,
        events: &EventBus,
    ) -> TestDispatcher {
        Dispatcher::new(
            store.clone(),
            LeaseCoordinator::new(locks.clone(), clock.clone()),
            ExecutionPool::new(2, 2, clock.clone()),
            Arc::new(handlers),
            events.clone(),
            clock.clone(),
            holder,
            Duration::from_secs(5),
        )
    }

    /// Every-minute cron job, due at t0.
    async fn seed(store: &MemoryStore, id: &str, handler: &str, max_attempts: u32) {
        let mut def = JobDefinition::new(
            id,
            Schedule::Cron {
                expr: "0 * * * * *".into(),
            },
            HandlerRef::new(handler).with_args(json!({ "n": 1 })),
        );
        def.retry.max_attempts = max_attempts;
        def.retry.backoff_base_ms = 1_000;
        def.retry.backoff_cap_ms = 1_000;
        def.timeout_ms = 5_000;
        store
            .insert_job(&def, &ScheduleState::new(id, Some(t0())))
            .await
            .unwrap();
    }

    async fn record(store: &MemoryStore, id: &str) -> JobRecord {
        JobRecord {
            definition: store.get_definition(id).await.unwrap().unwrap().0,
            state: store.get_state(id).await.unwrap().unwrap(),
        }
    }

    fn drain(sub: &mut crate::events::EventSubscription) -> Vec<EventType> {
        std::iter::from_fn(|| sub.try_recv()).map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn success_advances_from_the_scheduled_instant() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0() + ChronoDuration::seconds(5));
        seed(&store, "job", "echo", 1).await;
        let mut sub = events.subscribe_all();
        let d = dispatcher(&store, &locks, &clock, "w1", registry(), &events);

        let outcome = d.dispatch(&record(&store, "job").await).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Succeeded);

        let state = store.get_state("job").await.unwrap().unwrap();
        assert_eq!(state.next_fire, Some(t0() + ChronoDuration::minutes(1)));
        assert_eq!(state.phase, CyclePhase::Pending);
        assert_eq!(state.attempt, 0);

        let history = store.executions("job").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Succeeded);
        assert_eq!(history[0].result, Some(json!({ "n": 1 })));

        assert_eq!(
            drain(&mut sub),
            vec![EventType::Scheduled, EventType::Started, EventType::Succeeded]
        );
        // Lease released: another worker could take the job right away.
        let leases = LeaseCoordinator::new(locks, clock);
        assert!(leases
            .try_acquire("job", "w2", Duration::from_secs(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn downtime_collapses_to_a_single_fire() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0() + ChronoDuration::minutes(10) + ChronoDuration::seconds(3));
        seed(&store, "job", "echo", 1).await;
        let d = dispatcher(&store, &locks, &clock, "w1", registry(), &events);

        d.dispatch(&record(&store, "job").await).await.unwrap();
        let state = store.get_state("job").await.unwrap().unwrap();
        assert_eq!(state.next_fire, Some(t0() + ChronoDuration::minutes(11)));
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter_once_and_resume_schedule() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0());
        seed(&store, "job", "fail", 3).await;
        let mut sub = events.subscribe(|e| e.event_type == EventType::DeadLettered);
        let d = dispatcher(&store, &locks, &clock, "w1", registry(), &events);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let rec = record(&store, "job").await;
            clock.set(rec.state.next_fire.unwrap());
            outcomes.push(d.dispatch(&rec).await.unwrap());
            clock.advance(ChronoDuration::milliseconds(1));
        }
        assert!(matches!(outcomes[0], DispatchOutcome::Retrying { .. }));
        assert!(matches!(outcomes[1], DispatchOutcome::Retrying { .. }));
        assert_eq!(outcomes[2], DispatchOutcome::DeadLettered);

        let history = store.executions("job").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(history.iter().all(|e| e.status == ExecutionStatus::Failed));

        let dead = store.dead_letters("job").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].cycle_fire, Some(t0()));
        assert_eq!(dead[0].reason, "boom");

        let state = store.get_state("job").await.unwrap().unwrap();
        assert_eq!(state.next_fire, Some(t0() + ChronoDuration::minutes(1)));
        assert_eq!(state.attempt, 0);
        assert!(state.dead_lettered_at.is_some());
        assert_eq!(drain(&mut sub).len(), 1);
    }

    #[tokio::test]
    async fn retry_delay_is_bounded_by_backoff() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0());
        seed(&store, "job", "fail", 2).await;
        let d = dispatcher(&store, &locks, &clock, "w1", registry(), &events);

        let outcome = d.dispatch(&record(&store, "job").await).await.unwrap();
        let DispatchOutcome::Retrying { at } = outcome else {
            panic!("expected a retry");
        };
        assert!(at >= t0() && at <= t0() + ChronoDuration::seconds(1));
        let state = store.get_state("job").await.unwrap().unwrap();
        assert_eq!(state.phase, CyclePhase::Retrying);
        assert_eq!(state.next_fire, Some(at));
        assert_eq!(state.cycle_fire, Some(t0()));
    }

    #[tokio::test]
    async fn live_lease_elsewhere_means_skip() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0());
        seed(&store, "job", "echo", 1).await;
        LeaseCoordinator::new(locks.clone(), clock.clone())
            .try_acquire("job", "other", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let d = dispatcher(&store, &locks, &clock, "w1", registry(), &events);
        let outcome = d.dispatch(&record(&store, "job").await).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::LeaseDenied);
        assert!(store.executions("job").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_after_scan_is_not_run() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0());
        seed(&store, "job", "echo", 1).await;
        let stale = record(&store, "job").await;

        let (mut def, version) = store.get_definition("job").await.unwrap().unwrap();
        def.enabled = false;
        store.update_definition(&def, version).await.unwrap();

        let d = dispatcher(&store, &locks, &clock, "w1", registry(), &events);
        assert_eq!(d.dispatch(&stale).await.unwrap(), DispatchOutcome::NotDue);
        assert!(store.executions("job").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_handler_at_fire_time_fails_the_attempt() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0());
        seed(&store, "job", "gone", 1).await;
        let d = dispatcher(&store, &locks, &clock, "w1", registry(), &events);

        assert_eq!(
            d.dispatch(&record(&store, "job").await).await.unwrap(),
            DispatchOutcome::DeadLettered
        );
        let history = store.executions("job").await.unwrap();
        assert!(history[0].error.as_deref().unwrap().contains("Unknown handler"));
    }

    #[tokio::test]
    async fn stale_success_after_takeover_is_fenced() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0());
        seed(&store, "job", "gated", 1).await;

        let gate = Arc::new(Notify::new());
        let mut slow = registry();
        let release = gate.clone();
        slow.register("gated", move |_ctx: HandlerContext| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok::<_, String>(json!("late"))
            }
        });
        let mut fast = registry();
        fast.register("gated", EchoHandler);

        let a = dispatcher(&store, &locks, &clock, "a", slow, &events);
        let b = dispatcher(&store, &locks, &clock, "b", fast, &events);

        let rec = record(&store, "job").await;
        let first = tokio::spawn(async move { a.dispatch(&rec).await });
        while store.executions("job").await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // a's lease (5s timeout + 5s margin) runs out while its handler hangs.
        clock.advance(ChronoDuration::seconds(11));
        let takeover = b.dispatch(&record(&store, "job").await).await.unwrap();
        assert_eq!(takeover, DispatchOutcome::Succeeded);
        let after_b = store.get_state("job").await.unwrap().unwrap();

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), DispatchOutcome::LeaseLost);

        let state = store.get_state("job").await.unwrap().unwrap();
        assert_eq!(state, after_b, "stale holder must not touch the state");

        let history = store.executions("job").await.unwrap();
        assert_eq!(history.len(), 2);
        // The reaped record stands; the late success does not rewrite it.
        let stale = history.iter().find(|e| e.attempt == 1).unwrap();
        assert_eq!(stale.status, ExecutionStatus::Failed);
        assert_eq!(stale.error.as_deref(), Some(ABANDONED));
        assert_eq!(stale.result, None);
        let fresh = history.iter().find(|e| e.attempt == 2).unwrap();
        assert_eq!(fresh.status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_dead_letter_append_keeps_the_cycle_open() {
        let (_, locks, events) = backends();
        let store = FlakyStore::default();
        let clock = MockClock::new(t0());
        seed(store.inner(), "job", "fail", 1).await;
        let mut dead = events.subscribe(|e| e.event_type == EventType::DeadLettered);
        let d = Dispatcher::new(
            store.clone(),
            LeaseCoordinator::new(locks.clone(), clock.clone()),
            ExecutionPool::new(2, 2, clock.clone()),
            Arc::new(registry()),
            events.clone(),
            clock.clone(),
            "w1",
            Duration::from_secs(5),
        );

        store.faults().fail_next("append_dead_letter");
        assert!(d.dispatch(&record(store.inner(), "job").await).await.is_err());

        let state = store.inner().get_state("job").await.unwrap().unwrap();
        assert!(state.is_due(t0()));
        assert_eq!(state.dead_lettered_at, None);
        assert!(store.inner().dead_letters("job").await.unwrap().is_empty());
        assert!(drain(&mut dead).is_empty());

        let outcome = d.dispatch(&record(store.inner(), "job").await).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::DeadLettered);

        // The handler is not run a second time for the exhausted cycle.
        let history = store.inner().executions("job").await.unwrap();
        assert_eq!(history.len(), 1);
        let records = store.inner().dead_letters("job").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].execution_id, history[0].id);
        assert_eq!(records[0].attempts, 1);

        let state = store.inner().get_state("job").await.unwrap().unwrap();
        assert_eq!(state.next_fire, Some(t0() + ChronoDuration::minutes(1)));
        assert_eq!(state.attempt, 0);
        assert!(state.dead_lettered_at.is_some());
        assert_eq!(drain(&mut dead).len(), 1);
    }

    #[tokio::test]
    async fn renewal_keeps_a_long_run_from_being_taken_over() {
        let (store, locks, events) = backends();
        let clock = MockClock::new(t0());
        seed(&store, "job", "gated", 1).await;
        let (mut def, version) = store.get_definition("job").await.unwrap().unwrap();
        def.timeout_ms = 600;
        store.update_definition(&def, version).await.unwrap();

        let gate = Arc::new(Notify::new());
        let mut handlers = registry();
        let release = gate.clone();
        handlers.register("gated", move |_ctx: HandlerContext| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok::<_, String>(json!("done"))
            }
        });
        // No margin: the lease lasts exactly one timeout (600ms) and is renewed every 200ms.
        let d = Dispatcher::new(
            store.clone(),
            LeaseCoordinator::new(locks.clone(), clock.clone()),
            ExecutionPool::new(2, 2, clock.clone()),
            Arc::new(handlers),
            events.clone(),
            clock.clone(),
            "w1",
            Duration::ZERO,
        );

        let rec = record(&store, "job").await;
        let run = tokio::spawn(async move { d.dispatch(&rec).await });
        while store.executions("job").await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        clock.advance(ChronoDuration::milliseconds(500));
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Past the first grant's expiry; only a renewal keeps the lease alive.
        clock.advance(ChronoDuration::milliseconds(300));
        let rival = LeaseCoordinator::new(locks.clone(), clock.clone());
        assert!(rival
            .try_acquire("job", "w2", Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());

        gate.notify_one();
        assert_eq!(run.await.unwrap().unwrap(), DispatchOutcome::Succeeded);
        let history = store.executions("job").await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Succeeded);
        assert!(!history[0].lease_lost);
    }
}
