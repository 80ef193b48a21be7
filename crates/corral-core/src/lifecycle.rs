//! Lifecycle notifications for management clients.

use crate::domain::DomainRef;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

/// What happened to a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleKind {
    Defined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Crashed,
    Watchdog,
    DeviceRemoved,
    BlockJob,
    AgentConnected,
    AgentDisconnected,
    JobCompleted,
    MemoryResized,
    Undefined,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Defined => "defined",
            Self::Started => "started",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Watchdog => "watchdog",
            Self::DeviceRemoved => "device-removed",
            Self::BlockJob => "block-job",
            Self::AgentConnected => "agent-connected",
            Self::AgentDisconnected => "agent-disconnected",
            Self::JobCompleted => "job-completed",
            Self::MemoryResized => "memory-resized",
            Self::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub domain: DomainRef,
    pub kind: LifecycleKind,
    /// Free-form detail (reason, device alias, job outcome).
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Broadcast fan-out of [`LifecycleEvent`]s.
///
/// Subscribers that fall more than `capacity` events behind lose the oldest
/// ones.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Notifier {
    /// Create a notifier buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, domain: &DomainRef, kind: LifecycleKind, detail: impl Into<String>) {
        let event = LifecycleEvent {
            domain: domain.clone(),
            kind,
            detail: detail.into(),
            at: Utc::now(),
        };
        tracing::debug!(domain = %event.domain.name, kind = %event.kind, detail = %event.detail, "Lifecycle event");
        let _ = self.tx.send(event);
    }

    /// Receive future events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
