//! Job lanes: the per-domain exclusivity state machine.
//!
//! Every domain has three independent lanes:
//!
//! | Lane   | Kinds                                                             |
//! |--------|-------------------------------------------------------------------|
//! | normal | query, modify, destroy, abort, migration-op, suspend              |
//! | async  | migration-out, migration-in, save, dump, snapshot, start, backup  |
//! | agent  | query, modify                                                     |
//!
//! [`JobLanes::admit`] is the only place that decides whether a request may
//! proceed given the jobs that are already active. [`JobTable`] adds the
//! waiter queue on top of it: FIFO per lane, with destroy requests served
//! before everything else that is eligible.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ============================================================================
// Job kinds
// ============================================================================

/// Kind of a normal (short, synchronous) job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Read-only inspection. Does not reset progress data.
    Query,
    /// Mutates domain state.
    Modify,
    /// Tears the domain down. Served ahead of other waiters.
    Destroy,
    /// Cancels the active async job.
    Abort,
    /// Migration control step (speed, downtime, postcopy switch).
    MigrationOp,
    /// Pauses vCPUs.
    Suspend,
}

impl JobKind {
    const fn bit(self) -> u8 {
        match self {
            Self::Query => 1 << 0,
            Self::Modify => 1 << 1,
            Self::Destroy => 1 << 2,
            Self::Abort => 1 << 3,
            Self::MigrationOp => 1 << 4,
            Self::Suspend => 1 << 5,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Modify => "modify",
            Self::Destroy => "destroy",
            Self::Abort => "abort",
            Self::MigrationOp => "migration-op",
            Self::Suspend => "suspend",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of normal job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobMask(u8);

impl JobMask {
    /// Normal jobs every async job tolerates.
    pub const DEFAULT: JobMask = JobMask(0)
        .with(JobKind::Query)
        .with(JobKind::Destroy)
        .with(JobKind::Abort);

    /// Add a kind to the mask.
    pub const fn with(self, kind: JobKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Check whether `kind` is in the mask.
    pub const fn contains(self, kind: JobKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

/// Kind of an async (long-running, background) job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncJobKind {
    /// Outgoing live migration.
    MigrationOut,
    /// Incoming live migration.
    MigrationIn,
    /// Save guest state to a file.
    Save,
    /// Dump guest memory.
    Dump,
    /// Take a snapshot.
    Snapshot,
    /// Start the domain.
    Start,
    /// Run a backup job.
    Backup,
}

impl AsyncJobKind {
    /// Normal jobs that may run while this async job is active.
    pub const fn allowed_normal_jobs(self) -> JobMask {
        match self {
            Self::MigrationOut => JobMask::DEFAULT
                .with(JobKind::Suspend)
                .with(JobKind::MigrationOp),
            Self::MigrationIn => JobMask::DEFAULT.with(JobKind::MigrationOp),
            Self::Save | Self::Dump | Self::Snapshot | Self::Start | Self::Backup => {
                JobMask::DEFAULT
            }
        }
    }

    /// Monitor command that cancels this job, if the emulator has one.
    pub fn cancel_command(self) -> Option<&'static str> {
        match self {
            Self::MigrationOut | Self::Save => Some("migrate_cancel"),
            Self::Dump => Some("dump-cancel"),
            Self::Backup => Some("job-cancel"),
            Self::MigrationIn | Self::Snapshot | Self::Start => None,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MigrationOut => "migration-out",
            Self::MigrationIn => "migration-in",
            Self::Save => "save",
            Self::Dump => "dump",
            Self::Snapshot => "snapshot",
            Self::Start => "start",
            Self::Backup => "backup",
        }
    }
}

impl fmt::Display for AsyncJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an agent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentJobKind {
    /// Read-only guest query.
    Query,
    /// Guest-side mutation (freeze, password, hostname).
    Modify,
}

impl fmt::Display for AgentJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => f.write_str("query"),
            Self::Modify => f.write_str("modify"),
        }
    }
}

/// User-facing operation an async job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobOperation {
    Start,
    Save,
    Restore,
    MigrationIn,
    MigrationOut,
    Snapshot,
    SnapshotRevert,
    Dump,
    Backup,
}

/// Occupant of the normal lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalJob {
    /// A job requested through `begin_job`.
    Kind(JobKind),
    /// Step taken by the async job owner to enter the monitor.
    AsyncNested,
}

impl fmt::Display for NormalJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => kind.fmt(f),
            Self::AsyncNested => f.write_str("async-nested"),
        }
    }
}

// ============================================================================
// Requests and admission
// ============================================================================

/// A request for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRequest {
    Normal(JobKind),
    Nested { async_id: u64 },
    Async(AsyncJobKind),
    Agent(AgentJobKind),
}

impl JobRequest {
    fn lane(&self) -> LaneGroup {
        match self {
            Self::Agent(_) => LaneGroup::Agent,
            _ => LaneGroup::Monitor,
        }
    }

    fn priority(&self) -> u8 {
        match self {
            Self::Normal(JobKind::Destroy) => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal(kind) => write!(f, "job {kind}"),
            Self::Nested { .. } => f.write_str("nested job"),
            Self::Async(kind) => write!(f, "async job {kind}"),
            Self::Agent(kind) => write!(f, "agent job {kind}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneGroup {
    Monitor,
    Agent,
}

/// Outcome of checking a request against the active jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may be installed now.
    Grant,
    /// The request must wait for the lane to free up.
    Wait,
    /// The request can never succeed while the current jobs are active.
    Reject,
}

// ============================================================================
// Progress records
// ============================================================================

/// Status of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// How an async job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Progress of the active (or last completed) job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    /// Operation the async job performs, if any.
    pub operation: Option<JobOperation>,
    /// Current status.
    pub status: JobStatus,
    /// When the job started.
    pub started_at: DateTime<Utc>,
    /// Last progress update.
    pub updated_at: DateTime<Utc>,
    /// Total bytes (or units) to process.
    pub data_total: u64,
    /// Bytes processed so far.
    pub data_processed: u64,
    /// Bytes left.
    pub data_remaining: u64,
    /// Last error recorded against the job.
    pub error: Option<String>,
    /// Whether an abort was requested.
    pub abort_requested: bool,
}

impl JobProgress {
    /// Fresh record for a job starting now.
    pub fn new(operation: Option<JobOperation>) -> Self {
        let now = Utc::now();
        Self {
            operation,
            status: JobStatus::Active,
            started_at: now,
            updated_at: now,
            data_total: 0,
            data_processed: 0,
            data_remaining: 0,
            error: None,
            abort_requested: false,
        }
    }

    /// Record transfer counters.
    pub fn update(&mut self, total: u64, processed: u64, remaining: u64) {
        self.data_total = total;
        self.data_processed = processed;
        self.data_remaining = remaining;
        self.updated_at = Utc::now();
    }

    /// Milliseconds since the job started.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    fn finish(&mut self, outcome: JobOutcome) {
        self.updated_at = Utc::now();
        match outcome {
            JobOutcome::Completed => self.status = JobStatus::Completed,
            JobOutcome::Cancelled => self.status = JobStatus::Cancelled,
            JobOutcome::Failed(reason) => {
                self.status = if self.abort_requested {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                };
                self.error = Some(reason);
            }
        }
    }
}

// ============================================================================
// Lanes
// ============================================================================

/// An installed job.
#[derive(Debug, Clone)]
pub struct ActiveJob<K> {
    /// Job identifier, unique per domain.
    pub id: u64,
    /// Job kind.
    pub kind: K,
    /// When the job was granted.
    pub since: Instant,
}

/// The installed async job plus its abort flag.
#[derive(Debug, Clone)]
pub struct ActiveAsyncJob {
    /// Job identifier, unique per domain.
    pub id: u64,
    /// Job kind.
    pub kind: AsyncJobKind,
    /// Operation tag.
    pub operation: JobOperation,
    /// When the job was granted.
    pub since: Instant,
    pub(crate) abort: Arc<AtomicBool>,
}

impl ActiveAsyncJob {
    /// Whether an abort was requested.
    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// The three lanes and the progress records of one domain.
#[derive(Debug, Default)]
pub struct JobLanes {
    normal: Option<ActiveJob<NormalJob>>,
    async_job: Option<ActiveAsyncJob>,
    agent: Option<ActiveJob<AgentJobKind>>,
    current: Option<JobProgress>,
    completed: Option<JobProgress>,
}

impl JobLanes {
    /// Decide whether `request` is compatible with the active jobs.
    pub fn admit(&self, request: &JobRequest) -> Admission {
        match *request {
            JobRequest::Normal(kind) => {
                if self.normal.is_some() {
                    return Admission::Wait;
                }
                match &self.async_job {
                    Some(job) if !job.kind.allowed_normal_jobs().contains(kind) => Admission::Wait,
                    _ => Admission::Grant,
                }
            }
            JobRequest::Nested { async_id } => match &self.async_job {
                Some(job) if job.id == async_id => {
                    if self.normal.is_some() {
                        Admission::Wait
                    } else {
                        Admission::Grant
                    }
                }
                _ => Admission::Reject,
            },
            JobRequest::Async(_) => {
                if self.async_job.is_some() {
                    Admission::Reject
                } else if self.normal.is_some() {
                    Admission::Wait
                } else {
                    Admission::Grant
                }
            }
            JobRequest::Agent(_) => {
                if self.agent.is_some() {
                    Admission::Wait
                } else {
                    Admission::Grant
                }
            }
        }
    }

    /// Active normal job.
    pub fn normal(&self) -> Option<&ActiveJob<NormalJob>> {
        self.normal.as_ref()
    }

    /// Active async job.
    pub fn async_job(&self) -> Option<&ActiveAsyncJob> {
        self.async_job.as_ref()
    }

    /// Active agent job.
    pub fn agent(&self) -> Option<&ActiveJob<AgentJobKind>> {
        self.agent.as_ref()
    }

    /// Progress of the job in flight.
    pub fn current(&self) -> Option<&JobProgress> {
        self.current.as_ref()
    }

    /// Mutable progress of the job in flight.
    pub fn current_mut(&mut self) -> Option<&mut JobProgress> {
        self.current.as_mut()
    }

    /// Frozen record of the last finished async job.
    pub fn completed(&self) -> Option<&JobProgress> {
        self.completed.as_ref()
    }

    /// Human-readable description of what blocks `request`.
    pub fn blocker(&self, request: &JobRequest) -> String {
        let normal = self
            .normal
            .as_ref()
            .map(|j| format!("job {} (id {}, held {:?})", j.kind, j.id, j.since.elapsed()));
        let async_job = self
            .async_job
            .as_ref()
            .map(|j| format!("async job {} (id {}, held {:?})", j.kind, j.id, j.since.elapsed()));
        let agent = self
            .agent
            .as_ref()
            .map(|j| format!("agent job {} (id {})", j.kind, j.id));

        let held = match request {
            JobRequest::Agent(_) => agent,
            JobRequest::Async(_) => async_job.or(normal),
            JobRequest::Normal(_) | JobRequest::Nested { .. } => normal.or(async_job),
        };
        match held {
            Some(held) => format!("{request} blocked by {held}"),
            None => format!("{request} queued behind earlier waiters"),
        }
    }
}

// ============================================================================
// Waiter table
// ============================================================================

#[derive(Debug, Clone)]
struct Waiter {
    ticket: u64,
    request: JobRequest,
}

impl Waiter {
    fn outranks(&self, other: &Waiter) -> bool {
        let (mine, theirs) = (self.request.priority(), other.request.priority());
        mine > theirs || (mine == theirs && self.ticket < other.ticket)
    }
}

/// Job lanes plus the queue of tasks waiting for them.
#[derive(Debug, Default)]
pub struct JobTable {
    lanes: JobLanes,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    next_job_id: u64,
}

impl JobTable {
    /// Read access to the lanes.
    pub fn lanes(&self) -> &JobLanes {
        &self.lanes
    }

    /// Number of queued requests.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Last job identifier handed out.
    pub fn last_job_id(&self) -> u64 {
        self.next_job_id
    }

    pub(crate) fn lanes_mut(&mut self) -> &mut JobLanes {
        &mut self.lanes
    }

    pub(crate) fn enqueue(&mut self, request: JobRequest) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.waiters.push_back(Waiter { ticket, request });
        ticket
    }

    pub(crate) fn dequeue(&mut self, ticket: u64) {
        self.waiters.retain(|w| w.ticket != ticket);
    }

    /// Decide for a queued ticket, applying FIFO and destroy priority among
    /// the waiters that could be granted right now.
    pub(crate) fn decide(&self, ticket: u64) -> Admission {
        let Some(me) = self.waiters.iter().find(|w| w.ticket == ticket) else {
            return Admission::Reject;
        };
        match self.lanes.admit(&me.request) {
            Admission::Grant => {}
            other => return other,
        }
        let outranked = self.waiters.iter().any(|w| {
            w.ticket != ticket
                && w.request.lane() == me.request.lane()
                && self.lanes.admit(&w.request) == Admission::Grant
                && w.outranks(me)
        });
        if outranked {
            Admission::Wait
        } else {
            Admission::Grant
        }
    }

    pub(crate) fn request_of(&self, ticket: u64) -> Option<JobRequest> {
        self.waiters
            .iter()
            .find(|w| w.ticket == ticket)
            .map(|w| w.request)
    }

    /// Install a granted ticket and return the new job id.
    pub(crate) fn install(&mut self, ticket: u64, operation: Option<JobOperation>) -> u64 {
        let request = self.request_of(ticket);
        self.dequeue(ticket);
        self.next_job_id += 1;
        let id = self.next_job_id;
        let since = Instant::now();

        match request {
            Some(JobRequest::Normal(kind)) => {
                if kind != JobKind::Query && self.lanes.async_job.is_none() {
                    self.lanes.current = Some(JobProgress::new(None));
                }
                self.lanes.normal = Some(ActiveJob {
                    id,
                    kind: NormalJob::Kind(kind),
                    since,
                });
            }
            Some(JobRequest::Nested { .. }) => {
                self.lanes.normal = Some(ActiveJob {
                    id,
                    kind: NormalJob::AsyncNested,
                    since,
                });
            }
            Some(JobRequest::Async(kind)) => {
                let operation = operation.unwrap_or(match kind {
                    AsyncJobKind::MigrationOut => JobOperation::MigrationOut,
                    AsyncJobKind::MigrationIn => JobOperation::MigrationIn,
                    AsyncJobKind::Save => JobOperation::Save,
                    AsyncJobKind::Dump => JobOperation::Dump,
                    AsyncJobKind::Snapshot => JobOperation::Snapshot,
                    AsyncJobKind::Start => JobOperation::Start,
                    AsyncJobKind::Backup => JobOperation::Backup,
                });
                self.lanes.current = Some(JobProgress::new(Some(operation)));
                self.lanes.async_job = Some(ActiveAsyncJob {
                    id,
                    kind,
                    operation,
                    since,
                    abort: Arc::new(AtomicBool::new(false)),
                });
            }
            Some(JobRequest::Agent(kind)) => {
                self.lanes.agent = Some(ActiveJob { id, kind, since });
            }
            None => {}
        }
        id
    }

    /// Clear the normal lane if `id` holds it.
    pub(crate) fn release_normal(&mut self, id: u64) -> bool {
        match &self.lanes.normal {
            Some(job) if job.id == id => {
                let kind = job.kind;
                self.lanes.normal = None;
                if kind != NormalJob::Kind(JobKind::Query) && self.lanes.async_job.is_none() {
                    self.lanes.current = None;
                }
                true
            }
            _ => false,
        }
    }

    /// Clear the async lane if `id` holds it, freezing its progress.
    pub(crate) fn release_async(&mut self, id: u64, outcome: JobOutcome) -> bool {
        match &self.lanes.async_job {
            Some(job) if job.id == id => {
                let mut progress = self
                    .lanes
                    .current
                    .take()
                    .unwrap_or_else(|| JobProgress::new(Some(job.operation)));
                progress.abort_requested |= job.abort_requested();
                progress.finish(outcome);
                self.lanes.completed = Some(progress);
                self.lanes.async_job = None;
                true
            }
            _ => false,
        }
    }

    /// Clear the agent lane if `id` holds it.
    pub(crate) fn release_agent(&mut self, id: u64) -> bool {
        match &self.lanes.agent {
            Some(job) if job.id == id => {
                self.lanes.agent = None;
                true
            }
            _ => false,
        }
    }

    /// Set the abort flag on the active async job. Returns `None` when no
    /// async job is active, `Some(false)` when it was already set.
    pub(crate) fn request_abort(&mut self) -> Option<bool> {
        let job = self.lanes.async_job.as_ref()?;
        let first = !job.abort.swap(true, Ordering::AcqRel);
        if let Some(progress) = self.lanes.current.as_mut() {
            progress.abort_requested = true;
        }
        Some(first)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Job counters for one domain.
///
/// All counters are atomic and can be read without the object lock.
#[derive(Debug, Default)]
pub struct JobStats {
    /// Normal jobs granted.
    pub normal_started: AtomicU64,
    /// Normal jobs released.
    pub normal_ended: AtomicU64,
    /// Async jobs granted.
    pub async_started: AtomicU64,
    /// Async jobs released.
    pub async_ended: AtomicU64,
    /// Agent jobs granted.
    pub agent_started: AtomicU64,
    /// Agent jobs released.
    pub agent_ended: AtomicU64,
    /// Requests rejected outright.
    pub busy_rejections: AtomicU64,
    /// Requests that gave up after the bounded wait.
    pub wait_timeouts: AtomicU64,
}

impl JobStats {
    /// Normal jobs currently held.
    pub fn normal_active(&self) -> u64 {
        self.normal_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.normal_ended.load(Ordering::Relaxed))
    }

    /// Async jobs currently held.
    pub fn async_active(&self) -> u64 {
        self.async_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.async_ended.load(Ordering::Relaxed))
    }

    /// Agent jobs currently held.
    pub fn agent_active(&self) -> u64 {
        self.agent_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.agent_ended.load(Ordering::Relaxed))
    }

    /// Requests that failed with a busy error.
    pub fn busy(&self) -> u64 {
        self.busy_rejections.load(Ordering::Relaxed) + self.wait_timeouts.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================
