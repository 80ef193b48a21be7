//! The seam between sessions and the wire.

use crate::domain::{ChannelBinding, ChannelKind, DomainGuard};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A request/reply channel to the emulator monitor or the guest agent.
///
/// Implementations match replies to requests themselves and forward
/// unsolicited notifications through the [`ChannelBinding`] they were
/// attached with (see [`ChannelReader`]). When the peer goes away every
/// outstanding and future `call` fails with [`CoreError::ChannelClosed`].
///
/// [`CoreError::ChannelClosed`]: crate::error::CoreError::ChannelClosed
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send `command` with `args` and wait for the matching reply.
    async fn call(&self, command: &str, args: Value) -> Result<Value>;

    /// True once the peer is known to be gone.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Background half of a connection: feeds replies and notifications once
/// the transport is attached to a domain.
pub trait ChannelReader: Send {
    /// Start reading. Events and the final closure are reported through
    /// `binding`.
    fn spawn(self: Box<Self>, binding: ChannelBinding) -> JoinHandle<()>;
}

/// A connected channel, not yet attached to a domain.
pub struct Connection {
    /// Request side.
    pub transport: Arc<dyn RpcTransport>,
    /// Reader side.
    pub reader: Box<dyn ChannelReader>,
}

impl Connection {
    /// Attach to `guard`'s `kind` slot and start the reader.
    pub fn attach(self, guard: &mut DomainGuard, kind: ChannelKind) -> JoinHandle<()> {
        let binding = match kind {
            ChannelKind::Monitor => guard.attach_monitor(self.transport),
            ChannelKind::Agent => guard.attach_agent(self.transport),
        };
        self.reader.spawn(binding)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.transport.is_closed())
            .finish()
    }
}
