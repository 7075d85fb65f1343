//! # trogon-scheduler
//!
//! Distributed task scheduler: cron and fixed-interval jobs, executed at most
//! once per fire across any number of worker processes.
//!
//! ## Features
//!
//! - Job definitions and trigger state in a pluggable store (NATS KV or in-memory).
//! - Per-job leases with fencing tokens; a crashed worker's lease lapses after
//!   `timeout + margin` and another worker takes the job over.
//! - Missed fires during downtime collapse into a single catch-up fire.
//! - Bounded retries with full-jitter exponential backoff, then a dead-letter record.
//! - Bounded execution pool with per-job timeouts and cooperative cancellation.
//! - Lifecycle events (`scheduled`, `started`, `succeeded`, `failed`,
//!   `timed_out`, `dead_lettered`) on an in-process bus, optionally forwarded
//!   to NATS.
//! - Graceful shutdown: stop polling, drain in-flight executions for a grace
//!   period, then cancel what is left.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trogon_scheduler::{
//!     EventBus, HandlerRegistry, MemoryLeasePrimitive, MemoryStore, Scheduler, SchedulerConfig,
//!     SystemClock,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let scheduler = Scheduler::new(
//!         &SchedulerConfig::default(),
//!         MemoryStore::new(),
//!         MemoryLeasePrimitive::new(),
//!         Arc::new(HandlerRegistry::with_builtins()),
//!         EventBus::new(),
//!         SystemClock,
//!     );
//!     scheduler.run().await.unwrap();
//! }
//! ```
//!
//! ## Job definition example
//!
//! ```json
//! {
//!   "id": "report",
//!   "schedule": { "type": "cron", "expr": "0 0 8 * * *" },
//!   "handler":  { "id": "spawn", "args": { "bin": "/usr/bin/report", "args": ["--pdf"] } },
//!   "retry":    { "max_attempts": 3, "backoff_base_ms": 1000, "backoff_cap_ms": 60000 },
//!   "timeout_ms": 120000,
//!   "enabled": true
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod lease;
pub mod memory;
pub mod model;
pub mod nats;
pub mod pool;
pub mod schedule;
pub mod scheduler;
pub mod traits;
pub mod trigger;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use client::SchedulerClient;
pub use clock::{Clock, SystemClock};
pub use config::{HandlerRef, JobDefinition, RetryPolicy, Schedule, SchedulerConfig};
pub use error::SchedulerError;
pub use events::{EventBus, EventSubscription, EventType, SchedulerEvent};
pub use handler::{HandlerContext, HandlerOutcome, HandlerRegistry, JobHandler};
pub use memory::{MemoryLeasePrimitive, MemoryStore};
pub use model::{CyclePhase, DeadLetterRecord, Execution, ExecutionStatus, JobRecord, ScheduleState};
pub use scheduler::{HealthSnapshot, Scheduler};
pub use traits::{LeasePrimitive, ScheduleStore};
