//! Fault-injecting wrappers around the in-memory backends.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-scheduler = { path = "...", features = ["test-support"] }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::JobDefinition;
use crate::error::SchedulerError;
use crate::memory::{MemoryLeasePrimitive, MemoryStore};
use crate::model::{DeadLetterRecord, Execution, JobRecord, ScheduleState};
use crate::traits::{CasOutcome, DueCursor, LeaseEntry, LeasePrimitive, ScheduleStore};

pub use crate::clock::MockClock;

// ── Faults ────────────────────────────────────────────────────────────────────

/// Shared failure switch. Clones control the same wrapper.
#[derive(Clone, Default)]
pub struct Faults {
    down: Arc<AtomicBool>,
    /// `f64` bits of the per-call failure probability.
    rate: Arc<AtomicU64>,
    injected: Arc<AtomicU64>,
    /// Operations whose next call fails once.
    armed: Arc<Mutex<Vec<String>>>,
}

impl Faults {
    /// Every call fails until [`heal`](Self::heal).
    pub fn outage(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.down.store(false, Ordering::SeqCst);
        self.rate.store(0f64.to_bits(), Ordering::SeqCst);
        self.armed().clear();
    }

    /// The next call to `op` (e.g. `"append_dead_letter"`) fails; later calls pass.
    pub fn fail_next(&self, op: &str) {
        self.armed().push(op.to_string());
    }

    /// Each call fails independently with probability `rate` (clamped to `0..=1`).
    pub fn set_failure_rate(&self, rate: f64) {
        self.rate
            .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    /// How many calls have been failed so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn armed(&self) -> MutexGuard<'_, Vec<String>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_armed(&self, op: &str) -> bool {
        let mut armed = self.armed();
        match armed.iter().position(|o| o == op) {
            Some(i) => {
                armed.swap_remove(i);
                true
            }
            None => false,
        }
    }

    fn check(&self, op: &str) -> Result<(), SchedulerError> {
        let rate = f64::from_bits(self.rate.load(Ordering::SeqCst));
        if self.down.load(Ordering::SeqCst)
            || self.take_armed(op)
            || (rate > 0.0 && rand::random::<f64>() < rate)
        {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(SchedulerError::infra(format!("injected fault in {op}")));
        }
        Ok(())
    }
}

fn infallible<T>(result: Result<T, std::convert::Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

// ── FlakyStore ────────────────────────────────────────────────────────────────

/// [`MemoryStore`] that fails on demand, checked before the inner call so a
/// failed call never has a side effect.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    faults: Faults,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            faults: Faults::default(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl ScheduleStore for FlakyStore {
    type Error = SchedulerError;

    async fn insert_job(
        &self,
        definition: &JobDefinition,
        state: &ScheduleState,
    ) -> Result<bool, SchedulerError> {
        self.faults.check("insert_job")?;
        Ok(infallible(self.inner.insert_job(definition, state).await))
    }

    async fn get_definition(
        &self,
        job_id: &str,
    ) -> Result<Option<(JobDefinition, u64)>, SchedulerError> {
        self.faults.check("get_definition")?;
        Ok(infallible(self.inner.get_definition(job_id).await))
    }

    async fn update_definition(
        &self,
        definition: &JobDefinition,
        expected_version: u64,
    ) -> Result<CasOutcome, SchedulerError> {
        self.faults.check("update_definition")?;
        Ok(infallible(self.inner.update_definition(definition, expected_version).await))
    }

    async fn list_definitions(&self) -> Result<Vec<JobDefinition>, SchedulerError> {
        self.faults.check("list_definitions")?;
        Ok(infallible(self.inner.list_definitions().await))
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
        self.faults.check("remove_job")?;
        Ok(infallible(self.inner.remove_job(job_id).await))
    }

    async fn get_state(&self, job_id: &str) -> Result<Option<ScheduleState>, SchedulerError> {
        self.faults.check("get_state")?;
        Ok(infallible(self.inner.get_state(job_id).await))
    }

    async fn cas_state(&self, state: &ScheduleState) -> Result<CasOutcome, SchedulerError> {
        self.faults.check("cas_state")?;
        Ok(infallible(self.inner.cas_state(state).await))
    }

    async fn scan_due(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, SchedulerError> {
        self.faults.check("scan_due")?;
        Ok(infallible(self.inner.scan_due(now, after, limit).await))
    }

    async fn record_execution(&self, execution: &Execution) -> Result<(), SchedulerError> {
        self.faults.check("record_execution")?;
        infallible(self.inner.record_execution(execution).await);
        Ok(())
    }

    async fn executions(&self, job_id: &str) -> Result<Vec<Execution>, SchedulerError> {
        self.faults.check("executions")?;
        Ok(infallible(self.inner.executions(job_id).await))
    }

    async fn append_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), SchedulerError> {
        self.faults.check("append_dead_letter")?;
        infallible(self.inner.append_dead_letter(record).await);
        Ok(())
    }

    async fn dead_letters(&self, job_id: &str) -> Result<Vec<DeadLetterRecord>, SchedulerError> {
        self.faults.check("dead_letters")?;
        Ok(infallible(self.inner.dead_letters(job_id).await))
    }
}

// ── FlakyLeasePrimitive ───────────────────────────────────────────────────────

/// [`MemoryLeasePrimitive`] that fails on demand.
#[derive(Clone, Default)]
pub struct FlakyLeasePrimitive {
    inner: MemoryLeasePrimitive,
    faults: Faults,
}

impl FlakyLeasePrimitive {
    pub fn new(inner: MemoryLeasePrimitive) -> Self {
        Self {
            inner,
            faults: Faults::default(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

impl LeasePrimitive for FlakyLeasePrimitive {
    type Error = SchedulerError;

    async fn create(&self, key: &str, value: Bytes) -> Result<Option<u64>, SchedulerError> {
        self.faults.check("lease create")?;
        Ok(infallible(self.inner.create(key, value).await))
    }

    async fn update(
        &self,
        key: &str,
        value: Bytes,
        revision: u64,
    ) -> Result<Option<u64>, SchedulerError> {
        self.faults.check("lease update")?;
        Ok(infallible(self.inner.update(key, value, revision).await))
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseEntry>, SchedulerError> {
        self.faults.check("lease get")?;
        Ok(infallible(self.inner.get(key).await))
    }

    async fn delete(&self, key: &str, revision: u64) -> Result<bool, SchedulerError> {
        self.faults.check("lease delete")?;
        Ok(infallible(self.inner.delete(key, revision).await))
    }
}
