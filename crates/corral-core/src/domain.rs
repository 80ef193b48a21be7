//! Domain objects: one managed VM, its object lock and its channels.
//!
//! A [`Domain`] is always handled through an `Arc`. Its mutable state lives
//! behind a single async mutex (the object lock); holding the lock is
//! represented by a [`DomainGuard`]. Blocking work never happens while a
//! guard is alive: job waits release the lock (see `controller`) and RPC
//! traffic runs inside a session that owns no guard (see `session`).
//!
//! Readers that only need to look at a domain use [`Domain::snapshot`],
//! which is refreshed every time a guard is dropped and never takes the lock.

use crate::event::{Event, EventKind};
use crate::job::{JobLanes, JobProgress, JobTable};
use crate::job::{AgentJobKind, AsyncJobKind, JobStats};
use crate::queue::EventSubmitter;
use crate::transport::RpcTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify, OwnedMutexGuard};
use uuid::Uuid;

// ============================================================================
// Definitions
// ============================================================================

/// What to do when the guest reports a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashAction {
    /// Leave the domain in the crashed state for inspection.
    #[default]
    Preserve,
    /// Tear the domain down.
    Destroy,
}

/// Device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Nic,
    Serial,
    Channel,
    Memory,
    Hostdev,
    Other,
}

/// A device declared in the definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDef {
    /// Device alias as known to the emulator.
    pub alias: String,
    /// Device category.
    pub kind: DeviceKind,
}

/// Persistent definition of a domain.
///
/// Parsing richer definition formats is the job of the caller; this is the
/// subset the control plane needs to schedule work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDef {
    /// Unique name.
    pub name: String,
    /// Unique identifier.
    pub uuid: Uuid,
    /// Guest memory in MiB.
    pub memory_mib: u32,
    /// vCPU count.
    pub vcpus: u8,
    /// Reaction to a guest panic.
    #[serde(default)]
    pub on_crash: CrashAction,
    /// Whether the guest agent channel is configured.
    #[serde(default)]
    pub agent: bool,
    /// Declared devices.
    #[serde(default)]
    pub devices: Vec<DeviceDef>,
    /// Extra emulator arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl DomainDef {
    /// Create a definition with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            memory_mib: 512,
            vcpus: 1,
            on_crash: CrashAction::default(),
            agent: false,
            devices: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    /// Validate the definition.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::CoreError::Config("domain name is required".into()));
        }
        if self.name.contains('/') {
            return Err(crate::CoreError::Config(format!(
                "domain name {:?} must not contain '/'",
                self.name
            )));
        }
        if self.memory_mib == 0 {
            return Err(crate::CoreError::Config("memory_mib must be > 0".into()));
        }
        if self.vcpus == 0 {
            return Err(crate::CoreError::Config("vcpus must be > 0".into()));
        }
        Ok(())
    }
}

/// Back-reference used to re-locate a domain after its lock was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainRef {
    /// Domain name.
    pub name: String,
    /// Domain UUID.
    pub uuid: Uuid,
}

impl fmt::Display for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

// ============================================================================
// Runtime state
// ============================================================================

/// Coarse run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Shutoff,
    Running,
    Paused,
    Crashed,
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutoff => write!(f, "shutoff"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Why the domain is in its current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateReason {
    Unknown,
    Booted,
    Restored,
    Migrated,
    User,
    Watchdog,
    SaveInProgress,
    MigrationInProgress,
    Shutdown,
    Destroyed,
    Saved,
    Failed,
    Crashed,
    Panicked,
    CrashLoaded,
}

/// Live view of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    /// Device category.
    pub kind: DeviceKind,
    /// MAC reported by the last RX filter query.
    pub mac: Option<String>,
    /// Connection state for serial/channel devices.
    pub connected: Option<bool>,
    /// Current size for memory devices, in bytes.
    pub size: Option<u64>,
    /// Last RDMA GID reported for the device.
    pub rdma_gid: Option<String>,
}

impl DeviceState {
    /// Empty state for a device of `kind`.
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            mac: None,
            connected: None,
            size: None,
            rdma_gid: None,
        }
    }
}

/// State of a block job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockJobStatus {
    Running,
    Ready,
    Completed,
    Failed,
    Cancelled,
}

/// Tracked block job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockJobState {
    /// Emulator job id.
    pub job_id: String,
    /// Job type (copy, commit, stream, ...).
    pub job_type: String,
    /// Status.
    pub status: BlockJobStatus,
    /// Bytes done / total.
    pub offset: u64,
    /// Total length.
    pub len: u64,
    /// Error reported by the emulator.
    pub error: Option<String>,
}

/// Which channel a session or event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Monitor,
    Agent,
}

impl ChannelKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Agent => "agent",
        }
    }
}

/// One attached (or detached) protocol channel.
#[derive(Default)]
pub(crate) struct ChannelSlot {
    pub(crate) transport: Option<Arc<dyn RpcTransport>>,
    pub(crate) generation: u64,
    pub(crate) occupied_since: Option<(Instant, DateTime<Utc>)>,
}

impl fmt::Debug for ChannelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSlot")
            .field("attached", &self.transport.is_some())
            .field("generation", &self.generation)
            .field("occupied_since", &self.occupied_since.map(|(_, at)| at))
            .finish()
    }
}

/// Mutable state of a domain, reachable only through a [`DomainGuard`].
#[derive(Debug)]
pub struct DomainState {
    def: DomainDef,
    status: DomainStatus,
    reason: StateReason,
    persistent: bool,
    removed: bool,
    pid: Option<u32>,
    managed_save: Option<PathBuf>,
    pr_helper_connected: bool,
    devices: BTreeMap<String, DeviceState>,
    block_jobs: BTreeMap<String, BlockJobState>,
    pub(crate) jobs: JobTable,
    pub(crate) monitor: ChannelSlot,
    pub(crate) agent: ChannelSlot,
}

impl DomainState {
    fn new(def: DomainDef, persistent: bool) -> Self {
        let devices = def
            .devices
            .iter()
            .map(|d| (d.alias.clone(), DeviceState::new(d.kind)))
            .collect();
        Self {
            def,
            status: DomainStatus::Shutoff,
            reason: StateReason::Unknown,
            persistent,
            removed: false,
            pid: None,
            managed_save: None,
            pr_helper_connected: true,
            devices,
            block_jobs: BTreeMap::new(),
            jobs: JobTable::default(),
            monitor: ChannelSlot::default(),
            agent: ChannelSlot::default(),
        }
    }

    /// The definition this domain was created from.
    pub fn def(&self) -> &DomainDef {
        &self.def
    }

    /// Current status.
    pub fn status(&self) -> DomainStatus {
        self.status
    }

    /// Reason for the current status.
    pub fn reason(&self) -> StateReason {
        self.reason
    }

    /// Update status and reason.
    pub fn set_status(&mut self, status: DomainStatus, reason: StateReason) {
        if self.status != status || self.reason != reason {
            tracing::debug!(
                domain = %self.def.name,
                from = %self.status,
                to = %status,
                ?reason,
                "Domain status changed"
            );
        }
        self.status = status;
        self.reason = reason;
    }

    /// True unless the domain is shut off.
    pub fn is_active(&self) -> bool {
        self.status != DomainStatus::Shutoff
    }

    /// Whether the definition survives the domain stopping.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Mark the definition persistent or transient.
    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    /// True once the domain has been removed from the registry.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Emulator process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Record the emulator process id.
    pub fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    /// Managed-save image waiting to be restored on next start.
    pub fn managed_save(&self) -> Option<&PathBuf> {
        self.managed_save.as_ref()
    }

    /// Record or clear the managed-save image.
    pub fn set_managed_save(&mut self, path: Option<PathBuf>) {
        self.managed_save = path;
    }

    /// Whether the persistent-reservation helper is connected.
    pub fn pr_helper_connected(&self) -> bool {
        self.pr_helper_connected
    }

    /// Record the persistent-reservation helper state.
    pub fn set_pr_helper_connected(&mut self, connected: bool) {
        self.pr_helper_connected = connected;
    }

    /// Devices by alias.
    pub fn devices(&self) -> &BTreeMap<String, DeviceState> {
        &self.devices
    }

    /// Mutable devices by alias.
    pub fn devices_mut(&mut self) -> &mut BTreeMap<String, DeviceState> {
        &mut self.devices
    }

    /// Block jobs by disk.
    pub fn block_jobs(&self) -> &BTreeMap<String, BlockJobState> {
        &self.block_jobs
    }

    /// Mutable block jobs by disk.
    pub fn block_jobs_mut(&mut self) -> &mut BTreeMap<String, BlockJobState> {
        &mut self.block_jobs
    }

    /// Job lanes and progress records.
    pub fn jobs(&self) -> &JobLanes {
        self.jobs.lanes()
    }

    /// Progress of the job in flight, for holders updating counters.
    pub fn progress_mut(&mut self) -> Option<&mut JobProgress> {
        self.jobs.lanes_mut().current_mut()
    }

    /// Whether a monitor transport is attached.
    pub fn monitor_attached(&self) -> bool {
        self.monitor.transport.is_some()
    }

    /// Whether an agent transport is attached.
    pub fn agent_attached(&self) -> bool {
        self.agent.transport.is_some()
    }

    /// Whether an EOF raised for attach `generation` still describes the
    /// channel: it is detached and nothing was attached after it.
    pub fn eof_is_current(&self, kind: ChannelKind, generation: u64) -> bool {
        let slot = self.slot(kind);
        slot.generation == generation && slot.transport.is_none()
    }

    pub(crate) fn slot(&self, kind: ChannelKind) -> &ChannelSlot {
        match kind {
            ChannelKind::Monitor => &self.monitor,
            ChannelKind::Agent => &self.agent,
        }
    }

    pub(crate) fn slot_mut(&mut self, kind: ChannelKind) -> &mut ChannelSlot {
        match kind {
            ChannelKind::Monitor => &mut self.monitor,
            ChannelKind::Agent => &mut self.agent,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only copy of a domain's state, published whenever the lock is released.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainSnapshot {
    /// Domain name.
    pub name: String,
    /// Domain UUID.
    pub uuid: Uuid,
    /// Run status.
    pub status: DomainStatus,
    /// Status reason.
    pub reason: StateReason,
    /// Whether the definition is persistent.
    pub persistent: bool,
    /// Active normal job, if any.
    pub normal_job: Option<String>,
    /// Active async job, if any.
    pub async_job: Option<AsyncJobKind>,
    /// Active agent job, if any.
    pub agent_job: Option<AgentJobKind>,
    /// Last job id handed out.
    pub job_id: u64,
    /// Number of queued job requests.
    pub waiting: usize,
    /// Progress of the job in flight.
    pub current: Option<JobProgress>,
    /// Last finished async job.
    pub completed: Option<JobProgress>,
    /// Whether the monitor is attached.
    pub monitor_attached: bool,
    /// Whether the agent is attached.
    pub agent_attached: bool,
    /// When the current monitor exchange started.
    pub monitor_busy_since: Option<DateTime<Utc>>,
    /// When the current agent exchange started.
    pub agent_busy_since: Option<DateTime<Utc>>,
}

impl DomainSnapshot {
    fn capture(state: &DomainState) -> Self {
        let lanes = state.jobs.lanes();
        Self {
            name: state.def.name.clone(),
            uuid: state.def.uuid,
            status: state.status,
            reason: state.reason,
            persistent: state.persistent,
            normal_job: lanes.normal().map(|j| j.kind.to_string()),
            async_job: lanes.async_job().map(|j| j.kind),
            agent_job: lanes.agent().map(|j| j.kind),
            job_id: state.jobs.last_job_id(),
            waiting: state.jobs.waiting(),
            current: lanes.current().cloned(),
            completed: lanes.completed().cloned(),
            monitor_attached: state.monitor.transport.is_some(),
            agent_attached: state.agent.transport.is_some(),
            monitor_busy_since: state.monitor.occupied_since.map(|(_, at)| at),
            agent_busy_since: state.agent.occupied_since.map(|(_, at)| at),
        }
    }

    /// True when a monitor exchange has been outstanding longer than `threshold`.
    pub fn monitor_stuck(&self, threshold: Duration) -> bool {
        match self.monitor_busy_since {
            Some(since) => (Utc::now() - since)
                .to_std()
                .map(|busy| busy > threshold)
                .unwrap_or(false),
            None => false,
        }
    }
}

// ============================================================================
// Domain
// ============================================================================

/// Timing knobs a domain needs from the manager configuration.
#[derive(Debug, Clone, Copy)]
pub struct DomainTuning {
    /// Bounded wait for `begin_*`.
    pub job_wait_timeout: Duration,
    /// Per-request RPC timeout inside sessions.
    pub rpc_timeout: Duration,
}

impl Default for DomainTuning {
    fn default() -> Self {
        Self {
            job_wait_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// One managed VM.
pub struct Domain {
    reference: DomainRef,
    state: Arc<Mutex<DomainState>>,
    pub(crate) job_notify: Notify,
    pub(crate) session_notify: Notify,
    snapshot_tx: watch::Sender<Arc<DomainSnapshot>>,
    pub(crate) stats: JobStats,
    pub(crate) tuning: DomainTuning,
    events: Option<EventSubmitter>,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.reference.name)
            .field("uuid", &self.reference.uuid)
            .finish()
    }
}

impl Domain {
    /// Create a domain object for `def`.
    ///
    /// `events` is where channel closures are reported; pass `None` for
    /// domains that are never attached to a transport.
    pub fn new(
        def: DomainDef,
        persistent: bool,
        tuning: DomainTuning,
        events: Option<EventSubmitter>,
    ) -> Arc<Self> {
        let reference = DomainRef {
            name: def.name.clone(),
            uuid: def.uuid,
        };
        let state = DomainState::new(def, persistent);
        let (snapshot_tx, _) = watch::channel(Arc::new(DomainSnapshot::capture(&state)));
        tracing::debug!(domain = %reference.name, uuid = %reference.uuid, persistent, "Domain object created");
        Arc::new(Self {
            reference,
            state: Arc::new(Mutex::new(state)),
            job_notify: Notify::new(),
            session_notify: Notify::new(),
            snapshot_tx,
            stats: JobStats::default(),
            tuning,
            events,
        })
    }

    /// Domain name.
    pub fn name(&self) -> &str {
        &self.reference.name
    }

    /// Domain UUID.
    pub fn uuid(&self) -> Uuid {
        self.reference.uuid
    }

    /// Back-reference for events.
    pub fn reference(&self) -> &DomainRef {
        &self.reference
    }

    /// Job counters.
    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    /// Timing knobs.
    pub fn tuning(&self) -> DomainTuning {
        self.tuning
    }

    /// Take the object lock.
    pub async fn lock(self: &Arc<Self>) -> DomainGuard {
        let guard = Arc::clone(&self.state).lock_owned().await;
        DomainGuard {
            domain: Arc::clone(self),
            guard,
        }
    }

    /// Take the object lock if it is free.
    pub fn try_lock(self: &Arc<Self>) -> Option<DomainGuard> {
        let guard = Arc::clone(&self.state).try_lock_owned().ok()?;
        Some(DomainGuard {
            domain: Arc::clone(self),
            guard,
        })
    }

    /// Latest published snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<DomainSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn watch(&self) -> watch::Receiver<Arc<DomainSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Report that a channel of this domain went away.
    ///
    /// Called by transport readers. Tears the session down if `generation`
    /// is still the attached one and raises the matching EOF event; repeated
    /// reports for the same generation are ignored.
    pub async fn channel_closed(self: &Arc<Self>, kind: ChannelKind, generation: u64, reason: &str) {
        let mut guard = self.lock().await;
        if guard.detach_channel(kind, Some(generation)) {
            tracing::warn!(
                domain = %self.name(),
                channel = kind.as_str(),
                generation,
                reason,
                "Channel closed"
            );
            drop(guard);
            self.raise_eof(kind, generation);
        }
    }

    pub(crate) fn raise_eof(&self, kind: ChannelKind, generation: u64) {
        let event_kind = match kind {
            ChannelKind::Monitor => EventKind::MonitorEof { generation },
            ChannelKind::Agent => EventKind::AgentEof { generation },
        };
        match &self.events {
            Some(events) => events.submit_detached(Event::new(self.reference.clone(), event_kind)),
            None => tracing::debug!(domain = %self.name(), channel = kind.as_str(), "No event queue, EOF not raised"),
        }
    }

    /// Publish a snapshot of `state` if it differs from the last one.
    fn publish(&self, state: &DomainState) {
        let fresh = DomainSnapshot::capture(state);
        self.snapshot_tx.send_if_modified(|current| {
            if **current == fresh {
                false
            } else {
                *current = Arc::new(fresh);
                true
            }
        });
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Proof that the object lock is held.
pub struct DomainGuard {
    pub(crate) domain: Arc<Domain>,
    guard: OwnedMutexGuard<DomainState>,
}

impl fmt::Debug for DomainGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainGuard")
            .field("domain", &self.domain.name())
            .finish()
    }
}

impl Deref for DomainGuard {
    type Target = DomainState;

    fn deref(&self) -> &DomainState {
        &self.guard
    }
}

impl DerefMut for DomainGuard {
    fn deref_mut(&mut self) -> &mut DomainState {
        &mut self.guard
    }
}

impl Drop for DomainGuard {
    fn drop(&mut self) {
        self.domain.publish(&self.guard);
    }
}

impl DomainGuard {
    /// The domain this guard locks.
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Attach a freshly connected monitor transport.
    pub fn attach_monitor(&mut self, transport: Arc<dyn RpcTransport>) -> ChannelBinding {
        self.attach(ChannelKind::Monitor, transport)
    }

    /// Attach a freshly connected agent transport.
    pub fn attach_agent(&mut self, transport: Arc<dyn RpcTransport>) -> ChannelBinding {
        self.attach(ChannelKind::Agent, transport)
    }

    fn attach(&mut self, kind: ChannelKind, transport: Arc<dyn RpcTransport>) -> ChannelBinding {
        let slot = self.slot_mut(kind);
        slot.generation += 1;
        slot.transport = Some(transport);
        slot.occupied_since = None;
        let generation = slot.generation;
        tracing::info!(domain = %self.domain.name(), channel = kind.as_str(), generation, "Channel attached");
        ChannelBinding {
            domain: Arc::downgrade(&self.domain),
            name: self.domain.name().to_string(),
            kind,
            generation,
        }
    }

    /// Detach a channel. With `Some(generation)` only that generation is
    /// detached. Returns true if a transport was actually removed.
    ///
    /// Tasks waiting to enter the channel are woken and fail with a
    /// channel-closed error.
    pub fn detach_channel(&mut self, kind: ChannelKind, generation: Option<u64>) -> bool {
        let slot = self.slot_mut(kind);
        if slot.transport.is_none() {
            return false;
        }
        if let Some(generation) = generation {
            if slot.generation != generation {
                return false;
            }
        }
        slot.transport = None;
        slot.occupied_since = None;
        let generation = slot.generation;
        self.domain.session_notify.notify_waiters();
        tracing::debug!(domain = %self.domain.name(), channel = kind.as_str(), generation, "Channel detached");
        true
    }

    /// Remove the domain: every task waiting for a job or a session fails
    /// with `DomainGone`.
    pub fn mark_removed(&mut self) {
        self.removed = true;
        self.detach_channel(ChannelKind::Monitor, None);
        self.detach_channel(ChannelKind::Agent, None);
        self.domain.job_notify.notify_waiters();
        self.domain.session_notify.notify_waiters();
        tracing::info!(domain = %self.domain.name(), "Domain removed");
    }

    /// Release the object lock now.
    pub fn unlock(self) {}
}

/// Link between a transport reader and the domain slot it feeds.
#[derive(Debug, Clone)]
pub struct ChannelBinding {
    domain: Weak<Domain>,
    name: String,
    kind: ChannelKind,
    generation: u64,
}

impl ChannelBinding {
    /// Channel this binding belongs to.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Attach generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Domain back-reference, if the domain still exists.
    pub fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.upgrade()
    }

    /// Feed an asynchronous notification into the event queue.
    pub async fn event(&self, kind: EventKind) -> crate::Result<()> {
        let Some(domain) = self.domain.upgrade() else {
            return Err(crate::CoreError::DomainGone(self.name.clone()));
        };
        match &domain.events {
            Some(events) => events.submit(Event::new(domain.reference.clone(), kind)).await,
            None => Ok(()),
        }
    }

    /// Report that the channel closed.
    pub async fn closed(&self, reason: &str) {
        if let Some(domain) = self.domain.upgrade() {
            domain.channel_closed(self.kind, self.generation, reason).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> Arc<Domain> {
        Domain::new(DomainDef::new(name), true, DomainTuning::default(), None)
    }

    #[test]
    fn test_def_validation() {
        assert!(DomainDef::new("web01").validate().is_ok());
        assert!(DomainDef::new("").validate().is_err());
        assert!(DomainDef::new("a/b").validate().is_err());
        let mut def = DomainDef::new("web01");
        def.vcpus = 0;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_def_serde_defaults() {
        let json = r#"{"name":"db","uuid":"67e55044-10b1-426f-9247-bb680e5fe0c8","memory_mib":1024,"vcpus":2}"#;
        let def: DomainDef = serde_json::from_str(json).unwrap();
        assert_eq!(def.on_crash, CrashAction::Preserve);
        assert!(def.devices.is_empty());
        assert!(!def.agent);
    }

    #[tokio::test]
    async fn test_snapshot_published_on_unlock() {
        let domain = domain("web01");
        assert_eq!(domain.snapshot().status, DomainStatus::Shutoff);

        let mut guard = domain.lock().await;
        guard.set_status(DomainStatus::Running, StateReason::Booted);
        // Not yet visible while the lock is held.
        assert_eq!(domain.snapshot().status, DomainStatus::Shutoff);
        drop(guard);

        let snap = domain.snapshot();
        assert_eq!(snap.status, DomainStatus::Running);
        assert_eq!(snap.reason, StateReason::Booted);
    }

    #[tokio::test]
    async fn test_try_lock_while_held() {
        let domain = domain("web01");
        let guard = domain.lock().await;
        assert!(domain.try_lock().is_none());
        guard.unlock();
        assert!(domain.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_devices_seeded_from_def() {
        let mut def = DomainDef::new("web01");
        def.devices.push(DeviceDef {
            alias: "net0".into(),
            kind: DeviceKind::Nic,
        });
        let domain = Domain::new(def, true, DomainTuning::default(), None);
        let guard = domain.lock().await;
        assert_eq!(guard.devices()["net0"].kind, DeviceKind::Nic);
    }

    #[test]
    fn test_domain_ref_display() {
        let uuid = Uuid::new_v4();
        let r = DomainRef {
            name: "web01".into(),
            uuid,
        };
        assert_eq!(r.to_string(), format!("web01 ({uuid})"));
    }

    #[test]
    fn test_monitor_stuck() {
        let domain = domain("web01");
        let mut snap = (*domain.snapshot()).clone();
        assert!(!snap.monitor_stuck(Duration::from_secs(1)));
        snap.monitor_busy_since = Some(Utc::now() - chrono::Duration::seconds(120));
        assert!(snap.monitor_stuck(Duration::from_secs(30)));
    }
}
