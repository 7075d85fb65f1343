//! End-to-end scheduling against the in-memory backends.
//!
//! These run on wall-clock time with short intervals, so each takes a few
//! seconds. The 30-second disable check is `#[ignore]`d:
//!
//!   cargo test -p trogon-scheduler --test scheduling -- --include-ignored

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use trogon_scheduler::mocks::{FlakyLeasePrimitive, FlakyStore};
use trogon_scheduler::{
    EventBus, EventSubscription, EventType, ExecutionStatus, HandlerContext, HandlerRef,
    HandlerRegistry, JobDefinition, LeasePrimitive, MemoryLeasePrimitive, MemoryStore, RetryPolicy,
    Schedule, ScheduleStore, Scheduler, SchedulerClient, SchedulerConfig, SchedulerEvent,
    SystemClock,
};

fn config(holder: &str) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_grace_period(Duration::from_secs(2))
        .with_lease_margin(Duration::from_secs(1))
        .with_holder_id(holder)
}

fn hourly(id: &str, handler: &str) -> JobDefinition {
    JobDefinition::new(
        id,
        Schedule::Interval { interval_sec: 3600 },
        HandlerRef::new(handler),
    )
}

fn start<S, L>(
    config: &SchedulerConfig,
    store: S,
    leases: L,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
) -> (Scheduler<S, L, SystemClock>, JoinHandle<()>)
where
    S: ScheduleStore,
    L: LeasePrimitive,
{
    let scheduler = Scheduler::new(config, store, leases, handlers, events, SystemClock);
    let running = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await.unwrap() }
    });
    (scheduler, running)
}

async fn stop<S, L>(scheduler: Scheduler<S, L, SystemClock>, running: JoinHandle<()>)
where
    S: ScheduleStore,
    L: LeasePrimitive,
{
    scheduler.shutdown_token().cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("scheduler should stop within its grace period")
        .unwrap();
}

async fn next_event(sub: &mut EventSubscription, within: Duration) -> Option<SchedulerEvent> {
    tokio::time::timeout(within, sub.recv()).await.ok().flatten()
}

/// Tracks how many attempts of each job are running right now, and the peak.
#[derive(Clone, Default)]
struct Overlap {
    active: Arc<Mutex<HashMap<String, usize>>>,
    peak: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
}

impl Overlap {
    fn enter(&self, job_id: &str) {
        let mut active = self.active.lock().unwrap();
        let count = active.entry(job_id.to_string()).or_default();
        *count += 1;
        self.peak.fetch_max(*count, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self, job_id: &str) {
        if let Some(count) = self.active.lock().unwrap().get_mut(job_id) {
            *count -= 1;
        }
    }
}

#[tokio::test]
async fn two_schedulers_never_overlap_a_job_under_backend_faults() {
    let store = MemoryStore::new();
    let leases = MemoryLeasePrimitive::new();
    let overlap = Overlap::default();

    let mut registry = HandlerRegistry::with_builtins();
    registry.register("guarded", {
        let overlap = overlap.clone();
        move |ctx: HandlerContext| {
            let overlap = overlap.clone();
            async move {
                overlap.enter(&ctx.job_id);
                tokio::time::sleep(Duration::from_millis(30)).await;
                overlap.leave(&ctx.job_id);
                Ok::<_, String>(json!(null))
            }
        }
    });
    let handlers = Arc::new(registry);

    let client = SchedulerClient::new(store.clone(), Arc::clone(&handlers), SystemClock);
    for id in ["alpha", "beta", "gamma"] {
        let mut def = JobDefinition::new(
            id,
            Schedule::Interval { interval_sec: 1 },
            HandlerRef::new("guarded"),
        );
        def.timeout_ms = 2_000;
        def.retry = RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_cap_ms: 50,
        };
        client.create_job(&def).await.unwrap();
    }

    let mut workers = Vec::new();
    for holder in ["worker-a", "worker-b"] {
        let flaky_store = FlakyStore::new(store.clone());
        let flaky_leases = FlakyLeasePrimitive::new(leases.clone());
        flaky_store.faults().set_failure_rate(0.1);
        flaky_leases.faults().set_failure_rate(0.1);
        workers.push(start(
            &config(holder),
            flaky_store,
            flaky_leases,
            Arc::clone(&handlers),
            EventBus::new(),
        ));
    }

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    for (scheduler, running) in workers {
        stop(scheduler, running).await;
    }

    assert_eq!(overlap.peak.load(Ordering::SeqCst), 1, "a job ran on two workers at once");
    assert!(
        overlap.runs.load(Ordering::SeqCst) >= 3,
        "expected every job to fire at least once, got {} runs",
        overlap.runs.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn failing_job_is_dead_lettered_after_max_attempts() {
    let store = MemoryStore::new();
    let mut registry = HandlerRegistry::with_builtins();
    registry.register("broken", |_ctx: HandlerContext| async {
        Err::<serde_json::Value, _>("upstream refused".to_string())
    });
    let handlers = Arc::new(registry);
    let client = SchedulerClient::new(store.clone(), Arc::clone(&handlers), SystemClock);

    let mut def = hourly("flaky-export", "broken");
    def.retry = RetryPolicy {
        max_attempts: 3,
        backoff_base_ms: 10,
        backoff_cap_ms: 40,
    };
    client.create_job(&def).await.unwrap();
    client.trigger_now("flaky-export").await.unwrap();

    let events = EventBus::new();
    let mut failed = events.subscribe(|e| e.event_type == EventType::Failed);
    let mut dead = events.subscribe(|e| e.event_type == EventType::DeadLettered);
    let (scheduler, running) = start(
        &config("worker"),
        store.clone(),
        MemoryLeasePrimitive::new(),
        handlers,
        events,
    );

    let dead_event = next_event(&mut dead, Duration::from_secs(5))
        .await
        .expect("job should be dead-lettered");
    stop(scheduler, running).await;

    assert_eq!(dead_event.attempt, 3);
    let mut failures = Vec::new();
    while let Some(event) = failed.try_recv() {
        failures.push(event.attempt);
    }
    assert_eq!(failures, vec![1, 2, 3]);

    let history = client.list_due_history("flaky-export").await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|e| e.status == ExecutionStatus::Failed));
    assert!(history.iter().all(|e| e.error.as_deref() == Some("upstream refused")));

    let letters = client.dead_letters("flaky-export").await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);

    let record = client.get_job("flaky-export").await.unwrap().unwrap();
    assert_eq!(record.state.attempt, 0);
    assert!(record.state.dead_lettered_at.is_some());
    assert!(record.state.next_fire.unwrap() > chrono::Utc::now());
}

#[tokio::test]
async fn saturated_pool_never_exceeds_its_slots() {
    let store = MemoryStore::new();
    let mut registry = HandlerRegistry::with_builtins();
    registry.register("slow", |_ctx: HandlerContext| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok::<_, String>(json!("done"))
    });
    let handlers = Arc::new(registry);
    let client = SchedulerClient::new(store.clone(), Arc::clone(&handlers), SystemClock);

    let jobs = ["j1", "j2", "j3", "j4", "j5"];
    for id in jobs {
        let mut def = hourly(id, "slow");
        // Dispatches racing for a full pool are rejected and retried.
        def.retry = RetryPolicy {
            max_attempts: 20,
            backoff_base_ms: 50,
            backoff_cap_ms: 200,
        };
        client.create_job(&def).await.unwrap();
        client.trigger_now(id).await.unwrap();
    }

    let events = EventBus::new();
    let mut succeeded = events.subscribe(|e| e.event_type == EventType::Succeeded);
    let config = config("worker").with_pool_size(1).with_queue_depth(1);
    let (scheduler, running) = start(
        &config,
        store,
        MemoryLeasePrimitive::new(),
        handlers,
        events,
    );

    let mut done = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while done.len() < jobs.len() && tokio::time::Instant::now() < deadline {
        let stats = scheduler.health().pool;
        assert!(stats.active <= 1, "active {} exceeds pool size", stats.active);
        assert!(stats.queued <= 1, "queued {} exceeds queue depth", stats.queued);
        if let Some(event) = next_event(&mut succeeded, Duration::from_millis(20)).await {
            done.push(event.job_id);
        }
    }
    stop(scheduler, running).await;

    done.sort();
    assert_eq!(done, jobs);
}

#[tokio::test]
async fn polling_pauses_during_outage_and_resumes() {
    let store = MemoryStore::new();
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let client = SchedulerClient::new(store.clone(), Arc::clone(&handlers), SystemClock);
    client.create_job(&hourly("beat", "echo")).await.unwrap();
    client.trigger_now("beat").await.unwrap();

    let flaky = FlakyStore::new(store);
    flaky.faults().outage();
    let events = EventBus::new();
    let mut succeeded = events.subscribe(|e| e.event_type == EventType::Succeeded);
    let mut cfg = config("worker");
    cfg.poll_interval = Duration::from_millis(20);
    let (scheduler, running) = start(
        &cfg,
        flaky.clone(),
        MemoryLeasePrimitive::new(),
        handlers,
        events,
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = scheduler.health();
    assert!(!health.healthy);
    assert!(health.consecutive_poll_failures >= 1);
    assert!(health.last_error.is_some());
    assert!(succeeded.try_recv().is_none());

    flaky.faults().heal();
    let event = next_event(&mut succeeded, Duration::from_secs(5))
        .await
        .expect("job should run once the store is back");
    assert_eq!(event.job_id, "beat");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.health().healthy);

    stop(scheduler, running).await;
}

async fn cron_job_fires_then_stays_quiet_when_disabled(quiet_for: Duration) {
    let store = MemoryStore::new();
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let client = SchedulerClient::new(store.clone(), Arc::clone(&handlers), SystemClock);
    client
        .create_job(&JobDefinition::new(
            "every-5s",
            Schedule::Cron {
                expr: "*/5 * * * * *".into(),
            },
            HandlerRef::new("echo").with_args(json!({ "ping": true })),
        ))
        .await
        .unwrap();

    let events = EventBus::new();
    let mut succeeded = events.subscribe(|e| e.event_type == EventType::Succeeded);
    let mut any = events.subscribe_all();
    let (scheduler, running) = start(
        &config("worker"),
        store,
        MemoryLeasePrimitive::new(),
        handlers,
        events,
    );

    let event = next_event(&mut succeeded, Duration::from_secs(6))
        .await
        .expect("cron job should fire within one period");
    assert_eq!(event.job_id, "every-5s");
    let history = client.list_due_history("every-5s").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result, Some(json!({ "ping": true })));

    client.disable_job("every-5s").await.unwrap();
    while any.try_recv().is_some() {}
    assert!(
        next_event(&mut any, quiet_for).await.is_none(),
        "disabled job must not fire"
    );

    stop(scheduler, running).await;
}

#[tokio::test]
async fn cron_job_fires_and_disable_stops_it() {
    cron_job_fires_then_stays_quiet_when_disabled(Duration::from_secs(6)).await;
}

#[tokio::test]
#[ignore = "takes over 30 seconds"]
async fn disabled_cron_job_stays_quiet_for_thirty_seconds() {
    cron_job_fires_then_stays_quiet_when_disabled(Duration::from_secs(30)).await;
}

#[tokio::test]
async fn shutdown_drains_in_flight_execution() {
    let store = MemoryStore::new();
    let mut registry = HandlerRegistry::with_builtins();
    registry.register("slow", |_ctx: HandlerContext| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, String>(json!("finished"))
    });
    let handlers = Arc::new(registry);
    let client = SchedulerClient::new(store.clone(), Arc::clone(&handlers), SystemClock);
    client.create_job(&hourly("drain-me", "slow")).await.unwrap();
    client.trigger_now("drain-me").await.unwrap();

    let events = EventBus::new();
    let mut started = events.subscribe(|e| e.event_type == EventType::Started);
    let (scheduler, running) = start(
        &config("worker"),
        store,
        MemoryLeasePrimitive::new(),
        handlers,
        events,
    );
    next_event(&mut started, Duration::from_secs(2))
        .await
        .expect("execution should start");
    stop(scheduler, running).await;

    let history = client.list_due_history("drain-me").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Succeeded);
}
