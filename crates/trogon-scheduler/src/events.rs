//! Lifecycle events for observers (health checks, metrics, forwarders).
//!
//! Publishing never blocks the dispatcher. Delivery is at-most-once per
//! subscriber: a subscriber that falls more than the channel capacity behind
//! skips the events it missed. The store stays the source of truth.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Scheduled,
    Started,
    Succeeded,
    Failed,
    TimedOut,
    DeadLettered,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Scheduled,
        EventType::Started,
        EventType::Succeeded,
        EventType::Failed,
        EventType::TimedOut,
        EventType::DeadLettered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub job_id: String,
    pub execution_id: Option<String>,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

impl SchedulerEvent {
    pub fn new(
        event_type: EventType,
        job_id: &str,
        execution_id: Option<&str>,
        attempt: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            execution_id: execution_id.map(str::to_string),
            event_type,
            timestamp,
            attempt,
        }
    }
}

/// Fan-out of [`SchedulerEvent`]s over a tokio broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget. Silently drops the event if nobody listens.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    /// Events matching `predicate`, from now on.
    pub fn subscribe<F>(&self, predicate: F) -> EventSubscription
    where
        F: Fn(&SchedulerEvent) -> bool + Send + Sync + 'static,
    {
        EventSubscription {
            rx: self.tx.subscribe(),
            predicate: Box::new(predicate),
        }
    }

    pub fn subscribe_all(&self) -> EventSubscription {
        self.subscribe(|_| true)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<SchedulerEvent>,
    predicate: Box<dyn Fn(&SchedulerEvent) -> bool + Send + Sync>,
}

impl EventSubscription {
    /// Next matching event, or `None` once every bus handle is dropped.
    pub async fn recv(&mut self) -> Option<SchedulerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if (self.predicate)(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<SchedulerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if (self.predicate)(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagging, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = SchedulerEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}
