//! NATS JetStream backends.
//!
//! | Bucket | Keys | Holds |
//! |---|---|---|
//! | `scheduler_jobs` | `defs.<job>`, `state.<job>` | definitions and trigger state |
//! | `scheduler_leases` | `lease.<job>` | per-job leases |
//! | `scheduler_history` | `exec.<job>.<execution>`, `dead.<job>.<execution>` | executions and dead-letters |
//!
//! KV revisions serve as versions and fencing tokens.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use async_nats::{Client, ConnectOptions, Event};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::JobDefinition;
use crate::error::{Result, SchedulerError};
use crate::events::EventBus;
use crate::handler::{HandlerContext, HandlerOutcome, JobHandler};
use crate::model::{DeadLetterRecord, Execution, JobRecord, ScheduleState};
use crate::traits::{CasOutcome, DueCursor, LeaseEntry, LeasePrimitive, ScheduleStore};

pub const JOBS_BUCKET: &str = "scheduler_jobs";
pub const LEASES_BUCKET: &str = "scheduler_leases";
pub const HISTORY_BUCKET: &str = "scheduler_history";
pub const EVENTS_SUBJECT_PREFIX: &str = "scheduler.events.";
/// Subjects the `nats.publish` handler may publish to.
pub const TICK_SUBJECT_PREFIX: &str = "cron.";

const DEFS_PREFIX: &str = "defs.";
const STATE_PREFIX: &str = "state.";
const EXEC_PREFIX: &str = "exec.";
const DEAD_PREFIX: &str = "dead.";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

fn reconnect_delay(attempts: usize) -> Duration {
    let exponent = u32::try_from(attempts).unwrap_or(u32::MAX);
    Duration::from_secs(std::cmp::min(
        MAX_RECONNECT_DELAY.as_secs(),
        2u64.saturating_pow(exponent),
    ))
}

async fn handle_event(event: Event) {
    match event {
        Event::Connected => info!("NATS connected"),
        Event::Disconnected => warn!("NATS disconnected - will attempt reconnect"),
        Event::ServerError(err) => warn!(error = %err, "NATS server error"),
        Event::ClientError(err) => warn!(error = %err, "NATS client error"),
        Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer detected"),
        other => info!(event = %other, "NATS connection event"),
    }
}

/// Connect once; fail if the server is unreachable. Later disconnects are
/// retried with capped exponential delay.
pub async fn connect(url: &str) -> Result<Client> {
    info!(url, "Connecting to NATS");
    ConnectOptions::new()
        .connection_timeout(CONNECTION_TIMEOUT)
        .reconnect_delay_callback(reconnect_delay)
        .event_callback(|event| async move { handle_event(event).await })
        .connect(url)
        .await
        .map_err(|e| SchedulerError::infra(format!("failed to connect to NATS at {url}: {e}")))
}

async fn get_or_create(js: &jetstream::Context, config: kv::Config) -> Result<kv::Store> {
    let name = config.bucket.clone();
    match js.create_key_value(config).await {
        Ok(store) => Ok(store),
        Err(_) => js.get_key_value(&name).await.map_err(SchedulerError::infra),
    }
}

async fn read<T: DeserializeOwned>(store: &kv::Store, key: &str) -> Result<Option<(T, u64)>> {
    match store.entry(key).await.map_err(SchedulerError::infra)? {
        Some(entry) if entry.operation == kv::Operation::Put => {
            Ok(Some((serde_json::from_slice(&entry.value)?, entry.revision)))
        }
        _ => Ok(None),
    }
}

async fn live_revision(store: &kv::Store, key: &str) -> Result<Option<u64>> {
    Ok(match store.entry(key).await.map_err(SchedulerError::infra)? {
        Some(entry) if entry.operation == kv::Operation::Put => Some(entry.revision),
        _ => None,
    })
}

/// Revisioned update. A failed write whose key has meanwhile moved (or
/// vanished) is a conflict; anything else is a backend failure.
async fn update(store: &kv::Store, key: &str, value: Bytes, expected: u64) -> Result<CasOutcome> {
    match store.update(key, value, expected).await {
        Ok(revision) => Ok(CasOutcome::Applied(revision)),
        Err(e) => match live_revision(store, key).await? {
            Some(current) if current == expected => Err(SchedulerError::infra(e)),
            _ => Ok(CasOutcome::Conflict),
        },
    }
}

async fn keys_with_prefix(store: &kv::Store, prefix: &str) -> Result<Vec<String>> {
    let keys: Vec<String> = store
        .keys()
        .await
        .map_err(SchedulerError::infra)?
        .try_collect()
        .await
        .map_err(SchedulerError::infra)?;
    Ok(keys.into_iter().filter(|k| k.starts_with(prefix)).collect())
}

fn defs_key(job_id: &str) -> String {
    format!("{DEFS_PREFIX}{job_id}")
}

fn state_key(job_id: &str) -> String {
    format!("{STATE_PREFIX}{job_id}")
}

#[derive(Clone)]
pub struct NatsStore {
    jobs: kv::Store,
    history: kv::Store,
}

impl NatsStore {
    pub async fn open(js: &jetstream::Context) -> Result<Self> {
        let jobs = get_or_create(
            js,
            kv::Config {
                bucket: JOBS_BUCKET.to_string(),
                history: 5,
                ..Default::default()
            },
        )
        .await?;
        let history = get_or_create(
            js,
            kv::Config {
                bucket: HISTORY_BUCKET.to_string(),
                history: 1,
                ..Default::default()
            },
        )
        .await?;
        Ok(Self { jobs, history })
    }

    async fn read_state(&self, job_id: &str) -> Result<Option<ScheduleState>> {
        Ok(read::<ScheduleState>(&self.jobs, &state_key(job_id))
            .await?
            .map(|(mut state, revision)| {
                state.version = revision;
                state
            }))
    }
}

impl ScheduleStore for NatsStore {
    type Error = SchedulerError;

    async fn insert_job(&self, definition: &JobDefinition, state: &ScheduleState) -> Result<bool> {
        let value = Bytes::from(serde_json::to_vec(definition)?);
        if let Err(e) = self.jobs.create(defs_key(&definition.id), value).await {
            return match live_revision(&self.jobs, &defs_key(&definition.id)).await? {
                Some(_) => Ok(false),
                None => Err(SchedulerError::infra(e)),
            };
        }
        self.jobs
            .put(state_key(&definition.id), Bytes::from(serde_json::to_vec(state)?))
            .await
            .map_err(SchedulerError::infra)?;
        Ok(true)
    }

    async fn get_definition(&self, job_id: &str) -> Result<Option<(JobDefinition, u64)>> {
        read(&self.jobs, &defs_key(job_id)).await
    }

    async fn update_definition(
        &self,
        definition: &JobDefinition,
        expected_version: u64,
    ) -> Result<CasOutcome> {
        let value = Bytes::from(serde_json::to_vec(definition)?);
        update(&self.jobs, &defs_key(&definition.id), value, expected_version).await
    }

    async fn list_definitions(&self) -> Result<Vec<JobDefinition>> {
        let mut defs = Vec::new();
        for key in keys_with_prefix(&self.jobs, DEFS_PREFIX).await? {
            match read::<JobDefinition>(&self.jobs, &key).await {
                Ok(Some((def, _))) => defs.push(def),
                Ok(None) => {}
                Err(SchedulerError::Serde(e)) => {
                    warn!(key = %key, error = %e, "Skipping unreadable job definition")
                }
                Err(e) => return Err(e),
            }
        }
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let existed = live_revision(&self.jobs, &defs_key(job_id)).await?.is_some();
        self.jobs
            .delete(state_key(job_id))
            .await
            .map_err(SchedulerError::infra)?;
        self.jobs
            .delete(defs_key(job_id))
            .await
            .map_err(SchedulerError::infra)?;
        Ok(existed)
    }

    async fn get_state(&self, job_id: &str) -> Result<Option<ScheduleState>> {
        self.read_state(job_id).await
    }

    async fn cas_state(&self, state: &ScheduleState) -> Result<CasOutcome> {
        let value = Bytes::from(serde_json::to_vec(state)?);
        update(&self.jobs, &state_key(&state.job_id), value, state.version).await
    }

    /// KV has no secondary index, so this reads every state entry and sorts.
    async fn scan_due(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let mut due = Vec::new();
        for key in keys_with_prefix(&self.jobs, STATE_PREFIX).await? {
            let Some(job_id) = key.strip_prefix(STATE_PREFIX) else {
                continue;
            };
            let state = match self.read_state(job_id).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(SchedulerError::Serde(e)) => {
                    warn!(job_id, error = %e, "Skipping unreadable schedule state");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(next_fire) = state.next_fire.filter(|t| *t <= now) else {
                continue;
            };
            if after.is_some_and(|c| (next_fire, job_id) <= (c.next_fire, c.job_id.as_str())) {
                continue;
            }
            if let Some((definition, _)) =
                read::<JobDefinition>(&self.jobs, &defs_key(job_id)).await?
            {
                due.push(JobRecord { definition, state });
            }
        }
        due.sort_by(|a, b| {
            (a.state.next_fire, &a.state.job_id).cmp(&(b.state.next_fire, &b.state.job_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn record_execution(&self, execution: &Execution) -> Result<()> {
        let key = format!("{EXEC_PREFIX}{}.{}", execution.job_id, execution.id);
        let value = Bytes::from(serde_json::to_vec(execution)?);
        let written = match read::<Execution>(&self.history, &key).await? {
            None => match self.history.create(&key, value).await {
                Ok(_) => true,
                Err(e) => {
                    if live_revision(&self.history, &key).await?.is_none() {
                        return Err(SchedulerError::infra(e));
                    }
                    false
                }
            },
            Some((current, _)) if current.status.is_terminal() => false,
            Some((_, revision)) => update(&self.history, &key, value, revision)
                .await?
                .is_applied(),
        };
        if !written {
            debug!(key = %key, "Execution already closed elsewhere, dropping write");
        }
        Ok(())
    }

    async fn executions(&self, job_id: &str) -> Result<Vec<Execution>> {
        let mut history = Vec::new();
        for key in keys_with_prefix(&self.history, &format!("{EXEC_PREFIX}{job_id}.")).await? {
            if let Some((execution, _)) = read::<Execution>(&self.history, &key).await? {
                history.push(execution);
            }
        }
        history.sort_by_key(|e: &Execution| (e.started_at, e.attempt));
        Ok(history)
    }

    async fn append_dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        let key = format!("{DEAD_PREFIX}{}.{}", record.job_id, record.execution_id);
        let value = Bytes::from(serde_json::to_vec(record)?);
        // One record per final execution: a replayed append is a no-op.
        if self.history.create(&key, value).await.is_err()
            && live_revision(&self.history, &key).await?.is_none()
        {
            return Err(SchedulerError::infra(format!("failed to append dead letter {key}")));
        }
        Ok(())
    }

    async fn dead_letters(&self, job_id: &str) -> Result<Vec<DeadLetterRecord>> {
        let mut records = Vec::new();
        for key in keys_with_prefix(&self.history, &format!("{DEAD_PREFIX}{job_id}.")).await? {
            if let Some((record, _)) = read::<DeadLetterRecord>(&self.history, &key).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r: &DeadLetterRecord| r.recorded_at);
        Ok(records)
    }
}

/// Lease table in a KV bucket. Expiry lives in the value, so the bucket
/// itself has no max age.
#[derive(Clone)]
pub struct NatsLeasePrimitive {
    store: kv::Store,
}

impl NatsLeasePrimitive {
    pub async fn open(js: &jetstream::Context) -> Result<Self> {
        let store = get_or_create(
            js,
            kv::Config {
                bucket: LEASES_BUCKET.to_string(),
                history: 1,
                ..Default::default()
            },
        )
        .await?;
        Ok(Self { store })
    }
}

impl LeasePrimitive for NatsLeasePrimitive {
    type Error = SchedulerError;

    async fn create(&self, key: &str, value: Bytes) -> Result<Option<u64>> {
        match self.store.create(key, value).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) => match live_revision(&self.store, key).await? {
                Some(_) => Ok(None),
                None => Err(SchedulerError::infra(e)),
            },
        }
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<Option<u64>> {
        Ok(match update(&self.store, key, value, revision).await? {
            CasOutcome::Applied(revision) => Some(revision),
            CasOutcome::Conflict => None,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseEntry>> {
        Ok(match self.store.entry(key).await.map_err(SchedulerError::infra)? {
            Some(entry) if entry.operation == kv::Operation::Put => Some(LeaseEntry {
                value: entry.value,
                revision: entry.revision,
            }),
            _ => None,
        })
    }

    async fn delete(&self, key: &str, revision: u64) -> Result<bool> {
        match self.store.delete_expect_revision(key, Some(revision)).await {
            Ok(()) => Ok(true),
            Err(e) => match live_revision(&self.store, key).await? {
                Some(current) if current == revision => Err(SchedulerError::infra(e)),
                _ => Ok(false),
            },
        }
    }
}

/// Republish every bus event on `scheduler.events.<type>` until `shutdown`
/// fires or the bus goes away.
pub fn forward_events(
    bus: &EventBus,
    client: Client,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut events = bus.subscribe_all();
    tokio::spawn(async move {
        loop {
            // Buffered events go out before shutdown is honoured.
            let event = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            let subject = format!("{EVENTS_SUBJECT_PREFIX}{}", event.event_type);
            let payload = match serde_json::to_vec(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                warn!(subject = %subject, error = %e, "Failed to forward event");
            }
        }
        if let Err(e) = client.flush().await {
            warn!(error = %e, "Failed to flush forwarded events");
        }
        debug!("Event forwarder stopped");
    })
}

/// Message published by the `nats.publish` handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    pub job_id: String,
    /// Unique per attempt; consumers can dedupe on it.
    pub execution_id: String,
    pub attempt: u32,
    pub fired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PublishArgs {
    subject: String,
    #[serde(default)]
    payload: Option<Value>,
}

fn parse_publish_args(args: &Value) -> std::result::Result<PublishArgs, String> {
    let args: PublishArgs =
        serde_json::from_value(args.clone()).map_err(|e| format!("nats.publish args: {e}"))?;
    let token_ok = |t: &str| !t.is_empty() && !t.contains(['*', '>']);
    if !args.subject.starts_with(TICK_SUBJECT_PREFIX)
        || args.subject.contains(char::is_whitespace)
        || !args.subject.split('.').all(token_ok)
    {
        return Err(format!(
            "subject must be a concrete subject under '{TICK_SUBJECT_PREFIX}', got: {:?}",
            args.subject
        ));
    }
    Ok(args)
}

/// Publishes a [`TickPayload`] to `handler.args.subject`. Handy for driving
/// existing NATS consumers on a schedule.
#[derive(Clone)]
pub struct NatsPublishHandler {
    client: Client,
}

impl NatsPublishHandler {
    pub const ID: &'static str = "nats.publish";

    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl JobHandler for NatsPublishHandler {
    fn validate_args(&self, args: &Value) -> std::result::Result<(), String> {
        parse_publish_args(args).map(|_| ())
    }

    fn run(&self, ctx: HandlerContext) -> BoxFuture<'static, HandlerOutcome> {
        let client = self.client.clone();
        async move {
            let args = parse_publish_args(&ctx.args)?;
            let tick = TickPayload {
                job_id: ctx.job_id,
                execution_id: ctx.execution_id,
                attempt: ctx.attempt,
                fired_at: ctx.fired_at,
                payload: args.payload,
            };
            let body = serde_json::to_vec(&tick).map_err(|e| e.to_string())?;
            client
                .publish(args.subject.clone(), body.into())
                .await
                .map_err(|e| format!("publish to {}: {e}", args.subject))?;
            client
                .flush()
                .await
                .map_err(|e| format!("flush after publish to {}: {e}", args.subject))?;
            Ok(json!({ "subject": args.subject }))
        }
        .boxed()
    }
}
