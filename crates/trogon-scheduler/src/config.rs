use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::schedule::ParsedSchedule;

/// How often a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire every N seconds (minimum 1).
    Interval { interval_sec: u64 },
    /// Cron expression. Six fields with seconds ("*/5 * * * * *") or the classic
    /// five-field form, which fires at second 0.
    Cron { expr: String },
}

/// Which registered handler runs the job, and with what arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRef {
    pub id: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl HandlerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per fire cycle, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Job definition. Stored as-is; changes apply on the next trigger evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub schedule: Schedule,
    pub handler: HandlerRef,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, schedule: Schedule, handler: HandlerRef) -> Self {
        Self {
            id: id.into(),
            schedule,
            handler,
            retry: RetryPolicy::default(),
            timeout_ms: default_timeout_ms(),
            enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Structural checks plus schedule parsing. Handler resolution happens in
    /// the client, which owns the registry.
    pub fn validate(&self) -> Result<ParsedSchedule> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::validation("id must not be empty"));
        }
        // Ids become key and subject tokens in the backends.
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SchedulerError::validation(format!(
                "id may only contain ASCII letters, digits, '-' and '_': {:?}",
                self.id
            )));
        }
        if self.handler.id.trim().is_empty() {
            return Err(SchedulerError::validation("handler.id must not be empty"));
        }
        if self.timeout_ms == 0 {
            return Err(SchedulerError::validation("timeout_ms must be >= 1"));
        }
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(SchedulerError::validation("max_attempts must be >= 1"));
        }
        if retry.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(SchedulerError::validation(format!(
                "max_attempts must be <= {MAX_ATTEMPTS_LIMIT}, got {}",
                retry.max_attempts
            )));
        }
        if retry.backoff_base_ms == 0 {
            return Err(SchedulerError::validation("backoff_base_ms must be >= 1"));
        }
        if retry.backoff_cap_ms < retry.backoff_base_ms {
            return Err(SchedulerError::validation(
                "backoff_cap_ms must be >= backoff_base_ms",
            ));
        }
        ParsedSchedule::parse(&self.schedule)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

// ── Process configuration ────────────────────────────────────────────────────

const ENV_POLL_INTERVAL: &str = "SCHEDULER_POLL_INTERVAL";
const ENV_POOL_SIZE: &str = "SCHEDULER_POOL_SIZE";
const ENV_QUEUE_DEPTH: &str = "SCHEDULER_QUEUE_DEPTH";
const ENV_GRACE_PERIOD: &str = "SCHEDULER_GRACE_PERIOD";
const ENV_LEASE_MARGIN: &str = "SCHEDULER_LEASE_MARGIN";
const ENV_HOLDER_ID: &str = "SCHEDULER_HOLDER_ID";
const ENV_BACKEND: &str = "SCHEDULER_BACKEND";
const ENV_NATS_URL: &str = "NATS_URL";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_QUEUE_DEPTH: usize = 64;
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_LEASE_MARGIN: Duration = Duration::from_secs(5);
const DEFAULT_NATS_URL: &str = "localhost:4222";

/// Read access to environment variables, so tests never touch the process env.
pub trait ReadEnv {
    fn var(&self, key: &str) -> std::result::Result<String, std::env::VarError>;
}

/// The real process environment.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> std::result::Result<String, std::env::VarError> {
        std::env::var(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Nats,
    /// Single-process store and lease table. Nothing survives a restart.
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(Self::Nats),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{other}', expected 'nats' or 'memory'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub pool_size: usize,
    pub queue_depth: usize,
    pub grace_period: Duration,
    /// Added to a job's timeout to form its lease TTL.
    pub lease_margin: Duration,
    pub holder_id: String,
    pub backend: Backend,
    pub nats_url: String,
    pub jobs_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            pool_size: DEFAULT_POOL_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            grace_period: DEFAULT_GRACE_PERIOD,
            lease_margin: DEFAULT_LEASE_MARGIN,
            holder_id: uuid::Uuid::new_v4().to_string(),
            backend: Backend::Nats,
            nats_url: DEFAULT_NATS_URL.to_string(),
            jobs_file: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_lease_margin(mut self, margin: Duration) -> Self {
        self.lease_margin = margin;
        self
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }
}

/// Arguments of `scheduler run`.
#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Trigger poll period, e.g. `500ms`, `1s`.
    #[arg(long = "poll-interval", value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Number of parallel execution slots.
    #[arg(long = "pool-size")]
    pub pool_size: Option<usize>,

    /// Submissions allowed to wait for a slot before failing with PoolSaturated.
    #[arg(long = "queue-depth")]
    pub queue_depth: Option<usize>,

    /// How long SIGTERM waits for in-flight executions.
    #[arg(long = "grace-period", value_parser = parse_duration)]
    pub grace_period: Option<Duration>,

    /// `nats` or `memory`.
    #[arg(long)]
    pub backend: Option<Backend>,

    /// Lease holder identity; defaults to a random UUID.
    #[arg(long = "holder-id")]
    pub holder_id: Option<String>,

    /// JSON array of job definitions to create or update at startup.
    #[arg(long = "jobs")]
    pub jobs_file: Option<PathBuf>,
}

/// Resolve config: CLI args override env vars, which override defaults.
pub fn from_args<E: ReadEnv>(args: RunArgs, env: &E) -> SchedulerConfig {
    let defaults = SchedulerConfig::default();

    let pool_size = args
        .pool_size
        .or_else(|| env_parse(env, ENV_POOL_SIZE, |raw| raw.parse::<usize>().ok()))
        .filter(|n| {
            if *n == 0 {
                warn!("pool size 0 is not allowed, using default");
            }
            *n > 0
        })
        .unwrap_or(defaults.pool_size);

    SchedulerConfig {
        poll_interval: args
            .poll_interval
            .or_else(|| env_parse(env, ENV_POLL_INTERVAL, |raw| parse_duration(raw).ok()))
            .filter(|d| !d.is_zero())
            .unwrap_or(defaults.poll_interval),
        pool_size,
        queue_depth: args
            .queue_depth
            .or_else(|| env_parse(env, ENV_QUEUE_DEPTH, |raw| raw.parse::<usize>().ok()))
            .unwrap_or(defaults.queue_depth),
        grace_period: args
            .grace_period
            .or_else(|| env_parse(env, ENV_GRACE_PERIOD, |raw| parse_duration(raw).ok()))
            .unwrap_or(defaults.grace_period),
        lease_margin: env_parse(env, ENV_LEASE_MARGIN, |raw| parse_duration(raw).ok())
            .unwrap_or(defaults.lease_margin),
        holder_id: args
            .holder_id
            .or_else(|| env.var(ENV_HOLDER_ID).ok())
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(defaults.holder_id),
        backend: args
            .backend
            .or_else(|| env_parse(env, ENV_BACKEND, |raw| raw.parse::<Backend>().ok()))
            .unwrap_or(defaults.backend),
        nats_url: env.var(ENV_NATS_URL).unwrap_or(defaults.nats_url),
        jobs_file: args.jobs_file,
    }
}

fn env_parse<E: ReadEnv, T>(env: &E, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = env.var(key).ok()?;
    match parse(&raw) {
        Some(value) => Some(value),
        None => {
            warn!("{key}={raw:?} is not valid, using default");
            None
        }
    }
}

/// Parse `250ms`, `5s`, `2m`, `1h`. A bare integer is seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let secs = |per: u64| {
        value
            .checked_mul(per)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {raw:?} is too large"))
    };
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(3600),
        other => Err(format!("unknown duration unit {other:?} in {raw:?}")),
    }
}
