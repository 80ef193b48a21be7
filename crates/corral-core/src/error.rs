//! Error types for corral-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for corral-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while scheduling jobs or talking to a domain.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An incompatible job is active, or the bounded wait elapsed.
    #[error("domain {domain} is busy: {reason}")]
    JobBusy {
        /// Domain name
        domain: String,
        /// Which job blocked the request
        reason: String,
        /// How long the caller waited before giving up
        waited: Duration,
    },

    /// The domain was undefined or removed while the caller was waiting.
    #[error("domain {0} no longer exists")]
    DomainGone(String),

    /// The monitor or agent channel is not attached, or died mid-call.
    #[error("{channel} channel closed: {reason}")]
    ChannelClosed {
        /// "monitor" or "agent"
        channel: &'static str,
        /// Why the channel is unusable
        reason: String,
    },

    /// The peer sent something that does not parse as a reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The emulator or guest agent answered with an error reply.
    #[error("command {command} failed ({class}): {message}")]
    Command {
        /// Command that was issued
        command: String,
        /// Error class reported by the peer
        class: String,
        /// Error description reported by the peer
        message: String,
    },

    /// No domain with this name or UUID is known.
    #[error("domain not found: {0}")]
    NotFound(String),

    /// Operation is not valid for the domain's current state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The async job stopped at a safe point because an abort was requested.
    #[error("async job {0} aborted")]
    Aborted(String),

    /// The event queue is shutting down and rejects new events.
    #[error("event queue closed")]
    QueueClosed,

    /// The event queue is at capacity.
    #[error("event queue full (capacity {0})")]
    QueueFull(usize),

    /// Invalid configuration or definition.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Shorthand for a closed monitor channel.
    pub fn monitor_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: "monitor",
            reason: reason.into(),
        }
    }

    /// Shorthand for a closed agent channel.
    pub fn agent_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: "agent",
            reason: reason.into(),
        }
    }

    /// True for [`CoreError::JobBusy`].
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::JobBusy { .. })
    }

    /// True for [`CoreError::ChannelClosed`].
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed { .. })
    }

    /// True when the domain can no longer be found.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::DomainGone(_) | Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_display() {
        let err = CoreError::JobBusy {
            domain: "web01".into(),
            reason: "job modify is active".into(),
            waited: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "domain web01 is busy: job modify is active"
        );
        assert!(err.is_busy());
        assert!(!err.is_channel_closed());
    }

    #[test]
    fn test_channel_closed_helpers() {
        let err = CoreError::monitor_closed("end of file");
        assert_eq!(err.to_string(), "monitor channel closed: end of file");
        assert!(err.is_channel_closed());

        let err = CoreError::agent_closed("not connected");
        assert!(err.to_string().starts_with("agent channel"));
    }

    #[test]
    fn test_gone_classification() {
        assert!(CoreError::DomainGone("a".into()).is_gone());
        assert!(CoreError::NotFound("a".into()).is_gone());
        assert!(!CoreError::QueueClosed.is_gone());
    }
}
