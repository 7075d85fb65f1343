use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors surfaced by the scheduler core.
///
/// Lease denial and handler failures are deliberately absent: the former is an
/// `Ok(None)` from the lease coordinator, the latter is recorded on the
/// `Execution` and never propagated.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad job definition, rejected before it reaches the store.
    #[error("Invalid job definition: {reason}")]
    Validation { reason: String },

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("Unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    /// Store or lease backend unreachable. Recovered locally with backoff.
    #[error("Backend unavailable: {0}")]
    TransientInfra(String),

    /// Execution pool queue is full.
    #[error("Execution pool saturated (queue depth {queue_depth})")]
    PoolSaturated { queue_depth: usize },

    /// The job is mid-execution and the requested change would race it.
    #[error("Job {0} is running")]
    JobRunning(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SchedulerError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn infra(err: impl std::fmt::Display) -> Self {
        Self::TransientInfra(err.to_string())
    }

    /// Whether the poll loop should back off and retry rather than give up.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_) | Self::PoolSaturated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = SchedulerError::validation("max_attempts must be >= 1");
        assert_eq!(
            err.to_string(),
            "Invalid job definition: max_attempts must be >= 1"
        );
    }

    #[test]
    fn cron_error_display_includes_expression() {
        let err = SchedulerError::InvalidCronExpression {
            expr: "not-a-cron".into(),
            reason: "bad field".into(),
        };
        assert!(err.to_string().contains("'not-a-cron'"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err: SchedulerError = json_err.into();
        assert!(err.to_string().starts_with("Serialization error:"));
    }

    #[test]
    fn only_infra_and_saturation_are_transient() {
        assert!(SchedulerError::infra("connection refused").is_transient());
        assert!(SchedulerError::PoolSaturated { queue_depth: 4 }.is_transient());
        assert!(!SchedulerError::JobNotFound("x".into()).is_transient());
        assert!(!SchedulerError::validation("x").is_transient());
    }
}
