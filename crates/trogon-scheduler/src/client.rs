use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::config::JobDefinition;
use crate::error::{Result, SchedulerError};
use crate::handler::HandlerRegistry;
use crate::model::{CyclePhase, DeadLetterRecord, Execution, JobRecord, ScheduleState};
use crate::schedule::ParsedSchedule;
use crate::traits::{CasOutcome, ScheduleStore};

/// How many times a read-modify-write is retried when it keeps losing its CAS.
const CAS_RETRIES: usize = 5;

/// Job submission API.
///
/// Definitions are validated here, handler ids included, so nothing malformed
/// ever reaches the store or the trigger loop. Any number of clients and
/// schedulers may share a store.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use trogon_scheduler::{
///     HandlerRef, HandlerRegistry, JobDefinition, MemoryStore, Schedule, SchedulerClient,
///     SystemClock,
/// };
///
/// # async fn example() -> Result<(), trogon_scheduler::SchedulerError> {
/// let client = SchedulerClient::new(
///     MemoryStore::new(),
///     Arc::new(HandlerRegistry::with_builtins()),
///     SystemClock,
/// );
/// client
///     .create_job(&JobDefinition::new(
///         "heartbeat",
///         Schedule::Cron { expr: "*/5 * * * * *".into() },
///         HandlerRef::new("echo"),
///     ))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SchedulerClient<S, C> {
    store: S,
    handlers: Arc<HandlerRegistry>,
    clock: C,
}

impl<S: ScheduleStore, C: Clock> SchedulerClient<S, C> {
    pub fn new(store: S, handlers: Arc<HandlerRegistry>, clock: C) -> Self {
        Self {
            store,
            handlers,
            clock,
        }
    }

    /// Register a new job. Its first fire is the first schedule instant after now.
    pub async fn create_job(&self, definition: &JobDefinition) -> Result<String> {
        let schedule = self.validate(definition)?;
        let state = ScheduleState::new(&definition.id, schedule.next_after(self.clock.now()));
        let inserted = self
            .store
            .insert_job(definition, &state)
            .await
            .map_err(SchedulerError::infra)?;
        if !inserted {
            return Err(SchedulerError::AlreadyExists(definition.id.clone()));
        }
        info!(job_id = %definition.id, next_fire = ?state.next_fire, "Job created");
        Ok(definition.id.clone())
    }

    /// Replace a job's definition and return the new definition version.
    ///
    /// A new schedule reschedules an idle job right away; a job mid-cycle picks
    /// it up when the cycle closes.
    pub async fn update_job(&self, job_id: &str, definition: &JobDefinition) -> Result<u64> {
        if definition.id != job_id {
            return Err(SchedulerError::validation(format!(
                "definition id {:?} does not match job id {job_id:?}",
                definition.id
            )));
        }
        let schedule = self.validate(definition)?;
        let (previous, version) = self
            .replace_definition(job_id, |_| definition.clone())
            .await?;

        if previous.schedule != definition.schedule {
            self.reschedule_idle(job_id, &schedule).await?;
        }
        info!(job_id, version, "Job updated");
        Ok(version)
    }

    /// Create the job, or update it if the id is taken.
    pub async fn upsert_job(&self, definition: &JobDefinition) -> Result<()> {
        match self.create_job(definition).await {
            Err(SchedulerError::AlreadyExists(_)) => {
                self.update_job(&definition.id, definition).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    /// Stop future fires. An execution already running finishes normally.
    pub async fn disable_job(&self, job_id: &str) -> Result<()> {
        self.set_enabled(job_id, false).await
    }

    pub async fn enable_job(&self, job_id: &str) -> Result<()> {
        self.set_enabled(job_id, true).await
    }

    /// Remove the definition and trigger state. History and dead-letters stay.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let removed = self
            .store
            .remove_job(job_id)
            .await
            .map_err(SchedulerError::infra)?;
        if removed {
            info!(job_id, "Job removed");
        }
        Ok(removed)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let Some((definition, _)) = self
            .store
            .get_definition(job_id)
            .await
            .map_err(SchedulerError::infra)?
        else {
            return Ok(None);
        };
        let state = self
            .store
            .get_state(job_id)
            .await
            .map_err(SchedulerError::infra)?
            .unwrap_or_else(|| ScheduleState::new(job_id, None));
        Ok(Some(JobRecord { definition, state }))
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        self.store
            .list_definitions()
            .await
            .map_err(SchedulerError::infra)
    }

    /// Every recorded execution of the job, oldest first.
    pub async fn list_due_history(&self, job_id: &str) -> Result<Vec<Execution>> {
        self.store
            .executions(job_id)
            .await
            .map_err(SchedulerError::infra)
    }

    pub async fn dead_letters(&self, job_id: &str) -> Result<Vec<DeadLetterRecord>> {
        self.store
            .dead_letters(job_id)
            .await
            .map_err(SchedulerError::infra)
    }

    /// Make the job due now as a fresh cycle starting at attempt 1.
    ///
    /// Refused with [`SchedulerError::JobRunning`] while an attempt is in flight.
    pub async fn trigger_now(&self, job_id: &str) -> Result<()> {
        for _ in 0..CAS_RETRIES {
            let state = self
                .store
                .get_state(job_id)
                .await
                .map_err(SchedulerError::infra)?
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            if state.phase == CyclePhase::Running {
                return Err(SchedulerError::JobRunning(job_id.to_string()));
            }
            let now = self.clock.now();
            if self
                .store
                .cas_state(&state.complete(Some(now)))
                .await
                .map_err(SchedulerError::infra)?
                .is_applied()
            {
                info!(job_id, "Job triggered manually");
                return Ok(());
            }
        }
        Err(contended(job_id))
    }

    fn validate(&self, definition: &JobDefinition) -> Result<ParsedSchedule> {
        let schedule = definition.validate()?;
        let handler = self
            .handlers
            .get(&definition.handler.id)
            .ok_or_else(|| SchedulerError::UnknownHandler(definition.handler.id.clone()))?;
        handler
            .validate_args(&definition.handler.args)
            .map_err(SchedulerError::validation)?;
        Ok(schedule)
    }

    async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        self.replace_definition(job_id, |current| JobDefinition {
            enabled,
            ..current.clone()
        })
        .await?;
        info!(job_id, enabled, "Job enabled flag changed");
        Ok(())
    }

    /// Read-modify-write of a definition. Returns the previous definition and
    /// the new version.
    async fn replace_definition(
        &self,
        job_id: &str,
        change: impl Fn(&JobDefinition) -> JobDefinition,
    ) -> Result<(JobDefinition, u64)> {
        for _ in 0..CAS_RETRIES {
            let (current, version) = self
                .store
                .get_definition(job_id)
                .await
                .map_err(SchedulerError::infra)?
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            let next = change(&current);
            match self
                .store
                .update_definition(&next, version)
                .await
                .map_err(SchedulerError::infra)?
            {
                CasOutcome::Applied(new_version) => return Ok((current, new_version)),
                CasOutcome::Conflict => continue,
            }
        }
        Err(contended(job_id))
    }

    async fn reschedule_idle(&self, job_id: &str, schedule: &ParsedSchedule) -> Result<()> {
        for _ in 0..CAS_RETRIES {
            let Some(state) = self
                .store
                .get_state(job_id)
                .await
                .map_err(SchedulerError::infra)?
            else {
                return Ok(());
            };
            if state.phase != CyclePhase::Pending {
                return Ok(());
            }
            let mut next = state.clone();
            next.next_fire = schedule.next_after(self.clock.now());
            if self
                .store
                .cas_state(&next)
                .await
                .map_err(SchedulerError::infra)?
                .is_applied()
            {
                return Ok(());
            }
        }
        Err(contended(job_id))
    }
}

fn contended(job_id: &str) -> SchedulerError {
    SchedulerError::infra(format!("job {job_id} kept changing underneath the update"))
}
