//! Asynchronous notifications raised by the emulator, the guest agent and
//! the channel readers.

use crate::domain::DomainRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Watchdog action reported by the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchdogAction {
    Reset,
    Shutdown,
    Poweroff,
    Pause,
    Debug,
    None,
    InjectNmi,
    /// Pause and write a memory dump.
    Dump,
}

/// Kind-specific payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    Watchdog {
        action: WatchdogAction,
    },
    GuestPanic {
        /// Crash details as reported by the emulator.
        #[serde(default)]
        info: Option<Value>,
    },
    DeviceDeleted {
        alias: String,
    },
    NicRxFilterChanged {
        alias: String,
    },
    SerialChanged {
        alias: String,
        connected: bool,
    },
    BlockJob {
        disk: String,
        job_id: String,
        job_type: String,
        /// Emulator status string ("running", "ready", "concluded", ...).
        status: String,
        offset: u64,
        len: u64,
        #[serde(default)]
        error: Option<String>,
    },
    JobStatusChange {
        id: String,
        status: String,
    },
    /// The monitor channel of attach `generation` closed.
    MonitorEof {
        generation: u64,
    },
    /// The agent channel of attach `generation` closed.
    AgentEof {
        generation: u64,
    },
    PrDisconnect,
    RdmaGidStatusChanged {
        netdev: String,
        gid_status: bool,
        subnet_prefix: u64,
        interface_id: u64,
    },
    GuestCrashLoaded,
    MemoryDeviceSizeChange {
        alias: String,
        size: u64,
    },
}

impl EventKind {
    /// Stable kebab-case name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Watchdog { .. } => "watchdog",
            Self::GuestPanic { .. } => "guest-panic",
            Self::DeviceDeleted { .. } => "device-deleted",
            Self::NicRxFilterChanged { .. } => "nic-rx-filter-changed",
            Self::SerialChanged { .. } => "serial-changed",
            Self::BlockJob { .. } => "block-job",
            Self::JobStatusChange { .. } => "job-status-change",
            Self::MonitorEof { .. } => "monitor-eof",
            Self::AgentEof { .. } => "agent-eof",
            Self::PrDisconnect => "pr-disconnect",
            Self::RdmaGidStatusChanged { .. } => "rdma-gid-status-changed",
            Self::GuestCrashLoaded => "guest-crash-loaded",
            Self::MemoryDeviceSizeChange { .. } => "memory-device-size-change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One queued notification.
///
/// Carries a back-reference to the domain, not the domain itself: by the
/// time the worker gets to it the domain may have been removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Submission order, assigned by the queue.
    pub seq: u64,
    /// Target domain.
    pub domain: DomainRef,
    /// Payload.
    pub kind: EventKind,
    /// When the event was created.
    pub received_at: DateTime<Utc>,
}

impl Event {
    /// New event for `domain`. The sequence number is assigned on submit.
    pub fn new(domain: DomainRef, kind: EventKind) -> Self {
        Self {
            seq: 0,
            domain,
            kind,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::MonitorEof { generation: 1 }.to_string(), "monitor-eof");
        let kind = EventKind::SerialChanged {
            alias: "channel0".into(),
            connected: true,
        };
        assert_eq!(kind.name(), "serial-changed");
    }

    #[test]
    fn test_event_kind_json() {
        let kind: EventKind = serde_json::from_str(
            r#"{"type":"watchdog","action":"inject-nmi"}"#,
        )
        .unwrap();
        assert_eq!(
            kind,
            EventKind::Watchdog {
                action: WatchdogAction::InjectNmi
            }
        );

        let json = serde_json::to_value(EventKind::GuestCrashLoaded).unwrap();
        assert_eq!(json["type"], "guest-crash-loaded");
    }

    #[test]
    fn test_new_event_unsequenced() {
        let domain = DomainRef {
            name: "web01".into(),
            uuid: Uuid::new_v4(),
        };
        let event = Event::new(domain.clone(), EventKind::AgentEof { generation: 3 });
        assert_eq!(event.seq, 0);
        assert_eq!(event.domain, domain);
    }
}
