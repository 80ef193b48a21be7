//! Protocol sessions: exclusive use of the monitor or agent channel.
//!
//! Entering a session consumes the [`DomainGuard`], so the object lock is
//! provably not held while a request is in flight. `exit` takes the lock
//! again and hands back a fresh guard.
//!
//! ```ignore
//! let (vm, job) = domain.begin_job(JobKind::Query).await?;
//! let mut mon = vm.enter_monitor(&job).await.map_err(|(_, e)| e)?;
//! let status = mon.call("query-status", json!({})).await;
//! let mut vm = mon.exit().await;
//! vm.end_job(job);
//! ```

use crate::controller::{AgentJobClaim, AsyncJobClaim, JobClaim, Release};
use crate::domain::{ChannelKind, Domain, DomainGuard};
use crate::error::{CoreError, Result};
use crate::transport::RpcTransport;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Channel marker for [`Session`].
pub trait Channel: Send + Sync + 'static {
    /// Which slot of the domain the session occupies.
    const KIND: ChannelKind;
}

/// Emulator monitor channel.
#[derive(Debug)]
pub enum Monitor {}

/// Guest agent channel.
#[derive(Debug)]
pub enum Agent {}

impl Channel for Monitor {
    const KIND: ChannelKind = ChannelKind::Monitor;
}

impl Channel for Agent {
    const KIND: ChannelKind = ChannelKind::Agent;
}

/// Session on the monitor.
pub type MonitorSession = Session<Monitor>;

/// Session on the guest agent.
pub type AgentSession = Session<Agent>;

/// Failed entry: the guard is handed back so the caller can end its job.
pub type EnterError = (DomainGuard, CoreError);

/// Exclusive use of one channel. Holds no object lock.
#[must_use = "a session must be closed with exit()"]
pub struct Session<C: Channel> {
    domain: Arc<Domain>,
    transport: Arc<dyn RpcTransport>,
    generation: u64,
    nested: Option<u64>,
    channel_failed: bool,
    exited: bool,
    _channel: PhantomData<C>,
}

impl<C: Channel> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("domain", &self.domain.name())
            .field("channel", &C::KIND)
            .field("generation", &self.generation)
            .field("channel_failed", &self.channel_failed)
            .finish()
    }
}

fn closed_error(kind: ChannelKind, reason: &str) -> CoreError {
    CoreError::ChannelClosed {
        channel: kind.as_str(),
        reason: reason.to_string(),
    }
}

impl<C: Channel> Session<C> {
    /// Domain the session belongs to.
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Whether a request on this session found the channel dead.
    pub fn channel_failed(&self) -> bool {
        self.channel_failed
    }

    /// Send one request and wait for its reply.
    ///
    /// Fails with `ChannelClosed` once the channel has died; the domain sees
    /// the closure when the session exits.
    pub async fn call(&mut self, command: &str, args: Value) -> Result<Value> {
        if self.channel_failed {
            return Err(closed_error(C::KIND, "channel failed earlier in this session"));
        }
        let timeout = self.domain.tuning.rpc_timeout;
        let started = Instant::now();
        tracing::trace!(domain = %self.domain.name(), channel = C::KIND.as_str(), command, "Sending request");

        match tokio::time::timeout(timeout, self.transport.call(command, args)).await {
            Ok(Ok(reply)) => {
                tracing::debug!(
                    domain = %self.domain.name(),
                    channel = C::KIND.as_str(),
                    command,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request completed"
                );
                Ok(reply)
            }
            Ok(Err(e)) => {
                if e.is_channel_closed() {
                    self.channel_failed = true;
                }
                tracing::debug!(domain = %self.domain.name(), channel = C::KIND.as_str(), command, error = %e, "Request failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(domain = %self.domain.name(), channel = C::KIND.as_str(), command, ?timeout, "Request timed out");
                Err(CoreError::Protocol(format!(
                    "{command} got no reply within {timeout:?}"
                )))
            }
        }
    }

    /// [`call`](Self::call) and decode the reply.
    pub async fn call_typed<R: DeserializeOwned>(&mut self, command: &str, args: Value) -> Result<R> {
        let reply = self.call(command, args).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Leave the session and take the object lock again.
    ///
    /// If a request found the channel dead, the channel is torn down here and
    /// the matching EOF event is raised (once per attach generation).
    pub async fn exit(mut self) -> DomainGuard {
        self.exited = true;
        let mut guard = self.domain.lock().await;
        finish(&mut guard, C::KIND, self.generation, self.nested, self.channel_failed);
        guard
    }
}

impl<C: Channel> Drop for Session<C> {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        tracing::warn!(domain = %self.domain.name(), channel = C::KIND.as_str(), "Session dropped without exit, closing in background");
        let domain = Arc::clone(&self.domain);
        let (generation, nested, failed) = (self.generation, self.nested, self.channel_failed);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut guard = domain.lock().await;
                    finish(&mut guard, C::KIND, generation, nested, failed);
                });
            }
            Err(_) => {
                tracing::error!(domain = %domain.name(), "No runtime to close dropped session, channel left occupied");
            }
        }
    }
}

fn finish(
    guard: &mut DomainGuard,
    kind: ChannelKind,
    generation: u64,
    nested: Option<u64>,
    failed: bool,
) {
    let slot = guard.slot_mut(kind);
    if slot.generation == generation {
        slot.occupied_since = None;
    }
    guard.domain.session_notify.notify_waiters();

    if let Some(id) = nested {
        guard.release(Release::Normal(id));
    }
    if failed && guard.detach_channel(kind, Some(generation)) {
        tracing::warn!(domain = %guard.domain.name(), channel = kind.as_str(), generation, "Channel died during session");
        guard.domain.raise_eof(kind, generation);
    }
}

impl DomainGuard {
    /// Enter the monitor under a normal job.
    pub async fn enter_monitor(self, job: &JobClaim) -> std::result::Result<MonitorSession, EnterError> {
        if !job.belongs_to(&self.domain) || self.jobs().normal().map(|j| j.id) != Some(job.id()) {
            let actual = format!("job {} is not active on {}", job.id(), self.domain.name());
            return Err((self, CoreError::InvalidState {
                expected: "an active normal job".into(),
                actual,
            }));
        }
        self.enter(None).await
    }

    /// Enter the monitor on behalf of an async job.
    ///
    /// Takes the normal lane as a nested job for the duration of the
    /// session, waiting (lock released) if a compatible normal job holds it.
    pub async fn enter_monitor_async(
        self,
        job: &AsyncJobClaim,
    ) -> std::result::Result<MonitorSession, EnterError> {
        if !job.belongs_to(&self.domain) || self.jobs().async_job().map(|j| j.id) != Some(job.id()) {
            let actual = format!("async job {} is not active on {}", job.id(), self.domain.name());
            return Err((self, CoreError::InvalidState {
                expected: "an active async job".into(),
                actual,
            }));
        }
        let domain = Arc::clone(&self.domain);
        let (guard, nested) = match self.begin_nested_job(job.id()).await {
            Ok(acquired) => acquired,
            Err(e) => return Err((domain.lock().await, e)),
        };
        match guard.enter::<Monitor>(Some(nested)).await {
            Ok(session) => Ok(session),
            Err((mut guard, e)) => {
                guard.release(Release::Normal(nested));
                Err((guard, e))
            }
        }
    }

    /// Enter the guest agent under an agent job.
    pub async fn enter_agent(self, job: &AgentJobClaim) -> std::result::Result<AgentSession, EnterError> {
        if !job.belongs_to(&self.domain) || self.jobs().agent().map(|j| j.id) != Some(job.id()) {
            let actual = format!("agent job {} is not active on {}", job.id(), self.domain.name());
            return Err((self, CoreError::InvalidState {
                expected: "an active agent job".into(),
                actual,
            }));
        }
        self.enter(None).await
    }

    async fn enter<C: Channel>(mut self, nested: Option<u64>) -> std::result::Result<Session<C>, EnterError> {
        let domain = Arc::clone(&self.domain);
        loop {
            if self.is_removed() {
                return Err((self, CoreError::DomainGone(domain.name().to_string())));
            }
            let slot = self.slot(C::KIND);
            let Some(transport) = slot.transport.clone() else {
                return Err((self, closed_error(C::KIND, "not connected")));
            };
            if slot.occupied_since.is_none() {
                let generation = slot.generation;
                self.slot_mut(C::KIND).occupied_since = Some((Instant::now(), Utc::now()));
                drop(self);
                return Ok(Session {
                    domain,
                    transport,
                    generation,
                    nested,
                    channel_failed: false,
                    exited: false,
                    _channel: PhantomData,
                });
            }

            let notified = domain.session_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            tracing::trace!(domain = %domain.name(), channel = C::KIND.as_str(), "Waiting for channel");
            drop(self);
            notified.await;
            self = domain.lock().await;
        }
    }

    /// One monitor request under a normal job.
    pub async fn monitor_call(self, job: &JobClaim, command: &str, args: Value) -> (DomainGuard, Result<Value>) {
        match self.enter_monitor(job).await {
            Ok(mut session) => {
                let reply = session.call(command, args).await;
                (session.exit().await, reply)
            }
            Err((guard, e)) => (guard, Err(e)),
        }
    }

    /// One monitor request on behalf of an async job.
    pub async fn async_monitor_call(
        self,
        job: &AsyncJobClaim,
        command: &str,
        args: Value,
    ) -> (DomainGuard, Result<Value>) {
        match self.enter_monitor_async(job).await {
            Ok(mut session) => {
                let reply = session.call(command, args).await;
                (session.exit().await, reply)
            }
            Err((guard, e)) => (guard, Err(e)),
        }
    }

    /// One agent request under an agent job.
    pub async fn agent_call(self, job: &AgentJobClaim, command: &str, args: Value) -> (DomainGuard, Result<Value>) {
        match self.enter_agent(job).await {
            Ok(mut session) => {
                let reply = session.call(command, args).await;
                (session.exit().await, reply)
            }
            Err((guard, e)) => (guard, Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainDef, DomainTuning};
    use crate::job::{AsyncJobKind, JobKind, JobOperation, JobOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Answers every request with `{"ok": <command>}` unless told to fail.
    #[derive(Default)]
    struct Echo {
        dead: AtomicBool,
        calls: AtomicUsize,
        lock_free: StdMutex<Vec<bool>>,
        domain: StdMutex<Option<Arc<Domain>>>,
    }

    #[async_trait]
    impl RpcTransport for Echo {
        async fn call(&self, command: &str, _args: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let domain = self.domain.lock().unwrap().clone();
            if let Some(domain) = domain {
                let free = domain.try_lock().is_some();
                self.lock_free.lock().unwrap().push(free);
            }
            if self.dead.load(Ordering::SeqCst) {
                return Err(CoreError::monitor_closed("end of file"));
            }
            Ok(serde_json::json!({ "ok": command }))
        }
    }

    fn setup() -> (Arc<Domain>, Arc<Echo>) {
        let tuning = DomainTuning {
            job_wait_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
        };
        let domain = Domain::new(DomainDef::new("web01"), true, tuning, None);
        let echo = Arc::new(Echo::default());
        *echo.domain.lock().unwrap() = Some(Arc::clone(&domain));
        (domain, echo)
    }

    #[tokio::test]
    async fn test_lock_not_held_during_call() {
        let (domain, echo) = setup();
        let mut vm = domain.lock().await;
        vm.attach_monitor(echo.clone());

        let (vm, job) = vm.begin_job(JobKind::Query).await.unwrap();
        let (mut vm, reply) = vm.monitor_call(&job, "query-status", Value::Null).await;
        assert_eq!(reply.unwrap()["ok"], "query-status");
        vm.end_job(job);

        assert_eq!(*echo.lock_free.lock().unwrap(), vec![true]);
        assert!(vm.monitor.occupied_since.is_none());
    }

    #[tokio::test]
    async fn test_enter_without_transport() {
        let (domain, _echo) = setup();
        let (vm, job) = domain.begin_job(JobKind::Query).await.unwrap();
        let (mut vm, err) = match vm.enter_monitor(&job).await {
            Ok(_) => panic!("monitor is not attached"),
            Err(failed) => failed,
        };
        assert!(err.is_channel_closed());
        vm.end_job(job);
    }

    #[tokio::test]
    async fn test_enter_with_foreign_claim() {
        let (domain, echo) = setup();
        let (other, _) = setup();
        domain.lock().await.attach_monitor(echo);

        let (mut other_vm, other_job) = other.begin_job(JobKind::Query).await.unwrap();
        let vm = domain.lock().await;
        let (vm, err) = match vm.enter_monitor(&other_job).await {
            Ok(_) => panic!("claim belongs to another domain"),
            Err(failed) => failed,
        };
        assert!(matches!(err, CoreError::InvalidState { .. }));
        drop(vm);
        other_vm.end_job(other_job);
    }

    #[tokio::test]
    async fn test_dead_channel_detached_on_exit() {
        let (domain, echo) = setup();
        domain.lock().await.attach_monitor(echo.clone());
        echo.dead.store(true, Ordering::SeqCst);

        let (vm, job) = domain.begin_job(JobKind::Modify).await.unwrap();
        let mut session = vm.enter_monitor(&job).await.unwrap();
        assert!(session.call("stop", Value::Null).await.unwrap_err().is_channel_closed());
        assert!(session.channel_failed());
        // Further calls fail without touching the transport.
        assert!(session.call("stop", Value::Null).await.is_err());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

        let mut vm = session.exit().await;
        assert!(!vm.monitor_attached());
        vm.end_job(job);
    }

    #[tokio::test]
    async fn test_async_session_takes_nested_job() {
        let (domain, echo) = setup();
        domain.lock().await.attach_monitor(echo);

        let (vm, job) = domain
            .begin_async_job(AsyncJobKind::MigrationOut, JobOperation::MigrationOut)
            .await
            .unwrap();
        let session = vm.enter_monitor_async(&job).await.unwrap();
        assert_eq!(domain.snapshot().normal_job.as_deref(), Some("async-nested"));

        let mut vm = session.exit().await;
        assert!(vm.jobs().normal().is_none());
        vm.end_async_job(job, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_agent_slot_unaffected_by_monitor_session() {
        let (domain, echo) = setup();
        {
            let mut vm = domain.lock().await;
            vm.attach_monitor(echo.clone());
            vm.attach_agent(echo);
        }

        let (vm, job) = domain
            .begin_async_job(AsyncJobKind::Save, JobOperation::Save)
            .await
            .unwrap();
        let monitor = vm.enter_monitor_async(&job).await.unwrap();
        assert!(domain.snapshot().monitor_busy_since.is_some());

        let (vm, agent_job) = domain.begin_agent_job(crate::job::AgentJobKind::Query).await.unwrap();
        let (mut vm, reply) = vm.agent_call(&agent_job, "guest-ping", Value::Null).await;
        assert!(reply.is_ok());
        vm.end_agent_job(agent_job);
        drop(vm);

        let mut vm = monitor.exit().await;
        vm.end_async_job(job, JobOutcome::Completed);
        drop(vm);
        assert!(domain.snapshot().monitor_busy_since.is_none());
    }

    #[tokio::test]
    async fn test_dropped_session_is_closed() {
        let (domain, echo) = setup();
        domain.lock().await.attach_monitor(echo);
        let (vm, job) = domain.begin_job(JobKind::Query).await.unwrap();
        let session = vm.enter_monitor(&job).await.unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut vm = domain.lock().await;
        assert!(vm.monitor.occupied_since.is_none());
        vm.end_job(job);
    }
}
