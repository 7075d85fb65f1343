//! In-process backends.
//!
//! Clones share state, so several [`Scheduler`](crate::Scheduler) instances in
//! one process coordinate exactly as separate processes would against a real
//! backend. Nothing survives a restart.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::JobDefinition;
use crate::model::{DeadLetterRecord, Execution, JobRecord, ScheduleState};
use crate::traits::{CasOutcome, DueCursor, LeaseEntry, LeasePrimitive, ScheduleStore};

#[derive(Default)]
struct StoreInner {
    revision: u64,
    definitions: HashMap<String, (JobDefinition, u64)>,
    states: HashMap<String, ScheduleState>,
    executions: HashMap<String, Vec<Execution>>,
    dead_letters: HashMap<String, Vec<DeadLetterRecord>>,
}

impl StoreInner {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScheduleStore for MemoryStore {
    type Error = Infallible;

    async fn insert_job(
        &self,
        definition: &JobDefinition,
        state: &ScheduleState,
    ) -> Result<bool, Infallible> {
        let mut inner = self.lock();
        if inner.definitions.contains_key(&definition.id) {
            return Ok(false);
        }
        let def_rev = inner.bump();
        inner
            .definitions
            .insert(definition.id.clone(), (definition.clone(), def_rev));
        let state_rev = inner.bump();
        let mut state = state.clone();
        state.version = state_rev;
        inner.states.insert(definition.id.clone(), state);
        Ok(true)
    }

    async fn get_definition(
        &self,
        job_id: &str,
    ) -> Result<Option<(JobDefinition, u64)>, Infallible> {
        Ok(self.lock().definitions.get(job_id).cloned())
    }

    async fn update_definition(
        &self,
        definition: &JobDefinition,
        expected_version: u64,
    ) -> Result<CasOutcome, Infallible> {
        let mut inner = self.lock();
        let current = inner.definitions.get(&definition.id).map(|(_, v)| *v);
        if current != Some(expected_version) {
            return Ok(CasOutcome::Conflict);
        }
        let rev = inner.bump();
        inner
            .definitions
            .insert(definition.id.clone(), (definition.clone(), rev));
        Ok(CasOutcome::Applied(rev))
    }

    async fn list_definitions(&self) -> Result<Vec<JobDefinition>, Infallible> {
        let inner = self.lock();
        let mut defs: Vec<_> = inner.definitions.values().map(|(d, _)| d.clone()).collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool, Infallible> {
        let mut inner = self.lock();
        inner.states.remove(job_id);
        Ok(inner.definitions.remove(job_id).is_some())
    }

    async fn get_state(&self, job_id: &str) -> Result<Option<ScheduleState>, Infallible> {
        Ok(self.lock().states.get(job_id).cloned())
    }

    async fn cas_state(&self, state: &ScheduleState) -> Result<CasOutcome, Infallible> {
        let mut inner = self.lock();
        let current = inner.states.get(&state.job_id).map(|s| s.version);
        if current != Some(state.version) {
            return Ok(CasOutcome::Conflict);
        }
        let rev = inner.bump();
        let mut next = state.clone();
        next.version = rev;
        inner.states.insert(state.job_id.clone(), next);
        Ok(CasOutcome::Applied(rev))
    }

    async fn scan_due(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, Infallible> {
        let inner = self.lock();
        let mut due: Vec<JobRecord> = inner
            .states
            .values()
            .filter(|s| s.is_due(now))
            .filter(|s| match (after, s.next_fire) {
                (Some(cursor), Some(next_fire)) => {
                    (next_fire, s.job_id.as_str()) > (cursor.next_fire, cursor.job_id.as_str())
                }
                _ => true,
            })
            .filter_map(|s| {
                inner.definitions.get(&s.job_id).map(|(d, _)| JobRecord {
                    definition: d.clone(),
                    state: s.clone(),
                })
            })
            .collect();
        due.sort_by(|a, b| {
            (a.state.next_fire, &a.state.job_id).cmp(&(b.state.next_fire, &b.state.job_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn record_execution(&self, execution: &Execution) -> Result<(), Infallible> {
        let mut inner = self.lock();
        let history = inner.executions.entry(execution.job_id.clone()).or_default();
        match history.iter_mut().find(|e| e.id == execution.id) {
            Some(existing) if existing.status.is_terminal() => {}
            Some(existing) => *existing = execution.clone(),
            None => history.push(execution.clone()),
        }
        Ok(())
    }

    async fn executions(&self, job_id: &str) -> Result<Vec<Execution>, Infallible> {
        let mut history = self
            .lock()
            .executions
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        history.sort_by_key(|e| (e.started_at, e.attempt));
        Ok(history)
    }

    async fn append_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), Infallible> {
        let mut inner = self.lock();
        let records = inner.dead_letters.entry(record.job_id.clone()).or_default();
        if !records.iter().any(|r| r.execution_id == record.execution_id) {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn dead_letters(&self, job_id: &str) -> Result<Vec<DeadLetterRecord>, Infallible> {
        Ok(self
            .lock()
            .dead_letters
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct LeaseInner {
    revision: u64,
    entries: HashMap<String, LeaseEntry>,
}

/// Lease table with revisioned compare-and-swap, shared by clones.
#[derive(Clone, Default)]
pub struct MemoryLeasePrimitive {
    inner: Arc<Mutex<LeaseInner>>,
}

impl MemoryLeasePrimitive {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LeaseInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LeasePrimitive for MemoryLeasePrimitive {
    type Error = Infallible;

    async fn create(&self, key: &str, value: Bytes) -> Result<Option<u64>, Infallible> {
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            return Ok(None);
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), LeaseEntry { value, revision });
        Ok(Some(revision))
    }

    async fn update(
        &self,
        key: &str,
        value: Bytes,
        revision: u64,
    ) -> Result<Option<u64>, Infallible> {
        let mut inner = self.lock();
        if inner.entries.get(key).map(|e| e.revision) != Some(revision) {
            return Ok(None);
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), LeaseEntry { value, revision });
        Ok(Some(revision))
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseEntry>, Infallible> {
        Ok(self.lock().entries.get(key).cloned())
    }

    async fn delete(&self, key: &str, revision: u64) -> Result<bool, Infallible> {
        let mut inner = self.lock();
        if inner.entries.get(key).map(|e| e.revision) != Some(revision) {
            return Ok(false);
        }
        inner.entries.remove(key);
        Ok(true)
    }
}
