//! Durable records: schedule state, executions, leases and dead-letters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::JobDefinition;

/// Where a job is in its current fire cycle.
///
/// `Pending → Running → {Pending (succeeded / dead-lettered), Retrying}` and
/// `Retrying → Running`. Lease acquisition happens between Pending/Retrying and
/// Running and is not persisted here; the lease table owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Pending,
    Running,
    Retrying,
}

/// Per-job trigger state. Mutated only through compare-and-swap on `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub job_id: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
    pub lease_holder: Option<String>,
    /// Backend revision this snapshot was read at. Not part of the stored value.
    #[serde(skip)]
    pub version: u64,
    #[serde(default)]
    pub phase: CyclePhase,
    /// Attempts started in the current fire cycle.
    #[serde(default)]
    pub attempt: u32,
    /// The scheduled instant that opened the current cycle. Retries move
    /// `next_fire` but never this.
    #[serde(default)]
    pub cycle_fire: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl ScheduleState {
    pub fn new(job_id: impl Into<String>, next_fire: Option<DateTime<Utc>>) -> Self {
        Self {
            job_id: job_id.into(),
            next_fire,
            last_fire: None,
            lease_holder: None,
            version: 0,
            phase: CyclePhase::Pending,
            attempt: 0,
            cycle_fire: None,
            dead_lettered_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire.is_some_and(|t| t <= now)
    }

    /// Begin an attempt: the cycle keeps its original scheduled instant across retries.
    pub fn claim(&self, holder: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.cycle_fire = self.cycle_fire.or(self.next_fire);
        next.attempt = self.attempt + 1;
        next.phase = CyclePhase::Running;
        next.lease_holder = Some(holder.to_string());
        next.last_fire = Some(now);
        next
    }

    /// Close the cycle and schedule the next regular fire.
    pub fn complete(&self, next_fire: Option<DateTime<Utc>>) -> Self {
        let mut next = self.clone();
        next.next_fire = next_fire;
        next.attempt = 0;
        next.cycle_fire = None;
        next.phase = CyclePhase::Pending;
        next.lease_holder = None;
        next
    }

    pub fn retry_at(&self, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.next_fire = Some(at);
        next.phase = CyclePhase::Retrying;
        next.lease_holder = None;
        next
    }

    pub fn dead_letter(&self, next_fire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let mut next = self.complete(next_fire);
        next.dead_lettered_at = Some(now);
        next
    }
}

/// A job's definition together with its trigger state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub definition: JobDefinition,
    pub state: ScheduleState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// One attempt to run a job. Terminal status is written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub job_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The lease was lost before the outcome arrived; the status is advisory only.
    #[serde(default)]
    pub lease_lost: bool,
}

impl Execution {
    pub fn start(job_id: &str, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            attempt,
            started_at: now,
            status: ExecutionStatus::Running,
            finished_at: None,
            result: None,
            error: None,
            lease_lost: false,
        }
    }

    /// Returns `None` if already terminal.
    pub fn finish(
        &self,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if self.status.is_terminal() {
            return None;
        }
        let mut done = self.clone();
        done.status = status;
        done.result = result;
        done.error = error;
        done.finished_at = Some(now);
        Some(done)
    }
}

/// Time-bounded exclusive ownership of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    /// Backend revision of the lease entry. Late writes from a dispossessed holder carry a stale token.
    pub fencing_token: u64,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Append-only record of a fire cycle that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub job_id: String,
    pub execution_id: String,
    pub attempts: u32,
    /// The scheduled instant the failed cycle belonged to.
    pub cycle_fire: Option<DateTime<Utc>>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}
