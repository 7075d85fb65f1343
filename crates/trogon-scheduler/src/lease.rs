use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, to_chrono};
use crate::error::{Result, SchedulerError};
use crate::model::Lease;
use crate::traits::LeasePrimitive;

pub const LEASE_KEY_PREFIX: &str = "lease.";

/// What the lock service stores under `lease.<job_id>`.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseValue {
    holder: String,
    expires_at: DateTime<Utc>,
}

fn lease_key(job_id: &str) -> String {
    format!("{LEASE_KEY_PREFIX}{job_id}")
}

/// TTL for a job's lease: its timeout plus a safety margin, so a job that is
/// still legitimately running is never preempted.
pub fn lease_ttl(timeout: Duration, margin: Duration) -> Duration {
    timeout.saturating_add(margin)
}

/// How often a holder renews: a third of the TTL.
pub fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(10))
}

/// Per-job leases on top of a [`LeasePrimitive`].
///
/// Expiry lives in the stored value; an expired entry is taken over with a
/// revisioned update, so two coordinators racing for it cannot both win.
#[derive(Clone)]
pub struct LeaseCoordinator<L, C> {
    primitive: L,
    clock: C,
}

impl<L: LeasePrimitive, C: Clock> LeaseCoordinator<L, C> {
    pub fn new(primitive: L, clock: C) -> Self {
        Self { primitive, clock }
    }

    /// `Ok(None)` means another holder owns a live lease. That is expected, not an error.
    pub async fn try_acquire(
        &self,
        job_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let key = lease_key(job_id);
        let now = self.clock.now();
        let expires_at = now + to_chrono(ttl);
        let value = encode(holder, expires_at)?;

        if let Some(revision) = self
            .primitive
            .create(&key, value.clone())
            .await
            .map_err(SchedulerError::infra)?
        {
            debug!(job_id, holder, revision, "Lease acquired");
            return Ok(Some(lease(job_id, holder, expires_at, revision)));
        }

        let Some(entry) = self.primitive.get(&key).await.map_err(SchedulerError::infra)? else {
            // Released between our create and get; one more create decides it.
            return Ok(self
                .primitive
                .create(&key, value)
                .await
                .map_err(SchedulerError::infra)?
                .map(|revision| lease(job_id, holder, expires_at, revision)));
        };

        match serde_json::from_slice::<LeaseValue>(&entry.value) {
            Ok(current) if current.expires_at > now => {
                debug!(job_id, holder = %current.holder, "Lease held by another worker");
                return Ok(None);
            }
            Ok(current) => {
                info!(job_id, previous = %current.holder, holder, "Taking over expired lease");
            }
            Err(e) => {
                warn!(job_id, error = %e, "Unreadable lease entry, treating as expired");
            }
        }

        Ok(self
            .primitive
            .update(&key, value, entry.revision)
            .await
            .map_err(SchedulerError::infra)?
            .map(|revision| lease(job_id, holder, expires_at, revision)))
    }

    /// Extend a held lease. `Ok(None)` means it expired or was taken over.
    pub async fn renew(&self, held: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        let now = self.clock.now();
        if held.is_expired(now) {
            warn!(job_id = %held.job_id, holder = %held.holder, "Lease expired before renewal");
            return Ok(None);
        }
        let expires_at = now + to_chrono(ttl);
        let value = encode(&held.holder, expires_at)?;
        let renewed = self
            .primitive
            .update(&lease_key(&held.job_id), value, held.fencing_token)
            .await
            .map_err(SchedulerError::infra)?;
        match renewed {
            Some(revision) => Ok(Some(lease(&held.job_id, &held.holder, expires_at, revision))),
            None => {
                warn!(
                    job_id = %held.job_id,
                    holder = %held.holder,
                    "Lost lease (revision changed)"
                );
                Ok(None)
            }
        }
    }

    /// Drop the lease so the next trigger pass can pick the job up immediately.
    /// A no-op if someone else already holds it.
    pub async fn release(&self, held: &Lease) -> Result<()> {
        let deleted = self
            .primitive
            .delete(&lease_key(&held.job_id), held.fencing_token)
            .await
            .map_err(SchedulerError::infra)?;
        if deleted {
            debug!(job_id = %held.job_id, holder = %held.holder, "Lease released");
        } else {
            debug!(job_id = %held.job_id, holder = %held.holder, "Lease already superseded");
        }
        Ok(())
    }
}

fn encode(holder: &str, expires_at: DateTime<Utc>) -> Result<Bytes> {
    let value = LeaseValue {
        holder: holder.to_string(),
        expires_at,
    };
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

fn lease(job_id: &str, holder: &str, expires_at: DateTime<Utc>, revision: u64) -> Lease {
    Lease {
        job_id: job_id.to_string(),
        holder: holder.to_string(),
        expires_at,
        fencing_token: revision,
    }
}
