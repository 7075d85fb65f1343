use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::JobDefinition;
use crate::model::{DeadLetterRecord, Execution, JobRecord, ScheduleState};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the new version.
    Applied(u64),
    /// Someone else wrote first. Not an error.
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Position in a due scan. Results are ordered by `(next_fire, job_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueCursor {
    pub next_fire: DateTime<Utc>,
    pub job_id: String,
}

/// Durable job definitions, trigger state, execution history and dead-letters.
///
/// Any backend works as long as state writes are conditional on version and
/// due jobs can be scanned by `next_fire <= now`.
pub trait ScheduleStore: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a job. Returns `false` if the id is taken.
    fn insert_job(
        &self,
        definition: &JobDefinition,
        state: &ScheduleState,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Definition with its version.
    fn get_definition(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<(JobDefinition, u64)>, Self::Error>> + Send;

    fn update_definition(
        &self,
        definition: &JobDefinition,
        expected_version: u64,
    ) -> impl Future<Output = Result<CasOutcome, Self::Error>> + Send;

    fn list_definitions(
        &self,
    ) -> impl Future<Output = Result<Vec<JobDefinition>, Self::Error>> + Send;

    /// Returns `false` if the job did not exist.
    fn remove_job(&self, job_id: &str) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// State with `version` set to the revision it was read at.
    fn get_state(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<ScheduleState>, Self::Error>> + Send;

    /// Write `state` only if the stored version still equals `state.version`.
    fn cas_state(
        &self,
        state: &ScheduleState,
    ) -> impl Future<Output = Result<CasOutcome, Self::Error>> + Send;

    /// Up to `limit` jobs with `next_fire <= now`, ordered by `(next_fire, job_id)`,
    /// strictly after `after`.
    fn scan_due(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<JobRecord>, Self::Error>> + Send;

    /// Insert or update an execution by id. A stored record that is already
    /// terminal is left as it is and the write is dropped.
    fn record_execution(
        &self,
        execution: &Execution,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Executions of a job ordered by start time.
    fn executions(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<Execution>, Self::Error>> + Send;

    fn append_dead_letter(
        &self,
        record: &DeadLetterRecord,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn dead_letters(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<DeadLetterRecord>, Self::Error>> + Send;
}

/// A lease table entry as stored by the lock service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    pub value: Bytes,
    pub revision: u64,
}

/// External mutual-exclusion primitive: conditional create, revisioned update
/// and revisioned delete on a single key.
///
/// The revision doubles as the fencing token.
pub trait LeasePrimitive: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create the key if absent. `Ok(None)` if it already exists.
    fn create(
        &self,
        key: &str,
        value: Bytes,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send;

    /// CAS-update the key. `Ok(None)` if the revision no longer matches.
    fn update(
        &self,
        key: &str,
        value: Bytes,
        revision: u64,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send;

    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<LeaseEntry>, Self::Error>> + Send;

    /// Delete only if the revision matches. `Ok(false)` otherwise.
    fn delete(
        &self,
        key: &str,
        revision: u64,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}
