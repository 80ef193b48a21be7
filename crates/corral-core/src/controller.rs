//! Job controller: acquiring and releasing job lanes.
//!
//! ```ignore
//! let (mut vm, job) = domain.lock().await.begin_job(JobKind::Modify).await?;
//! vm.set_status(DomainStatus::Paused, StateReason::User);
//! vm.end_job(job);
//! ```
//!
//! `begin_*` takes the guard by value because waiting releases the object
//! lock; the guard handed back is a fresh acquisition. Claims are move-only
//! tokens consumed by the matching `end_*`. A claim that is dropped instead
//! (early return, panic in a handler) is released by a background task so
//! the lane never leaks.

use crate::domain::{Domain, DomainGuard};
use crate::error::{CoreError, Result};
use crate::job::{
    Admission, AgentJobKind, AsyncJobKind, JobKind, JobOperation, JobOutcome, JobRequest,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

// ============================================================================
// Claims
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) enum Release {
    Normal(u64),
    Async(u64, JobOutcome),
    Agent(u64),
}

/// Active normal job.
#[must_use = "a job claim must be released with DomainGuard::end_job"]
pub struct JobClaim {
    domain: Arc<Domain>,
    id: u64,
    kind: JobKind,
    released: bool,
}

/// Active async job.
#[must_use = "an async job claim must be released with DomainGuard::end_async_job"]
pub struct AsyncJobClaim {
    domain: Arc<Domain>,
    id: u64,
    kind: AsyncJobKind,
    abort: Arc<AtomicBool>,
    released: bool,
}

/// Active agent job.
#[must_use = "an agent job claim must be released with DomainGuard::end_agent_job"]
pub struct AgentJobClaim {
    domain: Arc<Domain>,
    id: u64,
    kind: AgentJobKind,
    released: bool,
}

impl JobClaim {
    /// Job id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Job kind.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub(crate) fn belongs_to(&self, domain: &Arc<Domain>) -> bool {
        Arc::ptr_eq(&self.domain, domain)
    }
}

impl AsyncJobClaim {
    /// Job id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Job kind.
    pub fn kind(&self) -> AsyncJobKind {
        self.kind
    }

    /// Whether `abort_async_job` was called for this job. Readable without
    /// the object lock; long-running holders poll it at safe points.
    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub(crate) fn belongs_to(&self, domain: &Arc<Domain>) -> bool {
        Arc::ptr_eq(&self.domain, domain)
    }
}

impl AgentJobClaim {
    /// Job id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Job kind.
    pub fn kind(&self) -> AgentJobKind {
        self.kind
    }

    pub(crate) fn belongs_to(&self, domain: &Arc<Domain>) -> bool {
        Arc::ptr_eq(&self.domain, domain)
    }
}

impl fmt::Debug for JobClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobClaim")
            .field("domain", &self.domain.name())
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Debug for AsyncJobClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncJobClaim")
            .field("domain", &self.domain.name())
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Debug for AgentJobClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentJobClaim")
            .field("domain", &self.domain.name())
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        if !self.released {
            self.domain.release_detached(Release::Normal(self.id));
        }
    }
}

impl Drop for AsyncJobClaim {
    fn drop(&mut self) {
        if !self.released {
            let outcome = JobOutcome::Failed("job owner went away".into());
            self.domain.release_detached(Release::Async(self.id, outcome));
        }
    }
}

impl Drop for AgentJobClaim {
    fn drop(&mut self) {
        if !self.released {
            self.domain.release_detached(Release::Agent(self.id));
        }
    }
}

// ============================================================================
// Abort
// ============================================================================

/// Result of [`Domain::abort_async_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortOutcome {
    /// Flag set and the cancel command was delivered.
    CancelSent,
    /// Flag set; no cancel command was sent (none exists, no monitor, or
    /// the monitor could not be reached).
    Flagged,
    /// An abort was already requested for this job.
    AlreadyRequested,
}

impl Domain {
    /// Request a normal job. Shorthand for `lock().await.begin_job(kind)`.
    pub async fn begin_job(self: &Arc<Self>, kind: JobKind) -> Result<(DomainGuard, JobClaim)> {
        self.lock().await.begin_job(kind).await
    }

    /// Request an async job. Shorthand for `lock().await.begin_async_job(..)`.
    pub async fn begin_async_job(
        self: &Arc<Self>,
        kind: AsyncJobKind,
        operation: JobOperation,
    ) -> Result<(DomainGuard, AsyncJobClaim)> {
        self.lock().await.begin_async_job(kind, operation).await
    }

    /// Request an agent job. Shorthand for `lock().await.begin_agent_job(kind)`.
    pub async fn begin_agent_job(
        self: &Arc<Self>,
        kind: AgentJobKind,
    ) -> Result<(DomainGuard, AgentJobClaim)> {
        self.lock().await.begin_agent_job(kind).await
    }

    /// Ask the active async job to stop.
    ///
    /// Sets the abort flag and, when the job has a cancel command and the
    /// monitor is attached, sends it under an `abort` job. Does not wait for
    /// the async job to finish. A second call for the same job is a no-op.
    pub async fn abort_async_job(self: &Arc<Self>) -> Result<AbortOutcome> {
        let mut guard = self.lock().await;
        let Some(kind) = guard.jobs().async_job().map(|j| j.kind) else {
            return Err(CoreError::InvalidState {
                expected: "an active async job".into(),
                actual: "no async job".into(),
            });
        };
        if guard.jobs.request_abort() != Some(true) {
            tracing::debug!(domain = %self.name(), %kind, "Abort already requested");
            return Ok(AbortOutcome::AlreadyRequested);
        }
        tracing::info!(domain = %self.name(), %kind, "Abort requested for async job");

        let Some(command) = kind.cancel_command() else {
            return Ok(AbortOutcome::Flagged);
        };
        if !guard.monitor_attached() {
            return Ok(AbortOutcome::Flagged);
        }

        let (guard, job) = match guard.begin_job(JobKind::Abort).await {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(domain = %self.name(), error = %e, "Could not acquire abort job, flag only");
                return Ok(AbortOutcome::Flagged);
            }
        };
        let (mut guard, reply) = guard
            .monitor_call(&job, command, serde_json::json!({}))
            .await;
        guard.end_job(job);

        match reply {
            Ok(_) => Ok(AbortOutcome::CancelSent),
            Err(e) => {
                tracing::warn!(domain = %self.name(), command, error = %e, "Cancel command failed");
                Ok(AbortOutcome::Flagged)
            }
        }
    }

    /// Release a lane from a context that cannot take the lock (Drop).
    pub(crate) fn release_detached(self: &Arc<Self>, release: Release) {
        tracing::warn!(domain = %self.name(), ?release, "Job claim dropped without end, releasing in background");
        let domain = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut guard = domain.lock().await;
                    guard.release(release);
                });
            }
            Err(_) => {
                tracing::error!(domain = %self.name(), "No runtime to release dropped job claim, lane leaked");
            }
        }
    }
}

// ============================================================================
// Begin / end
// ============================================================================

impl DomainGuard {
    /// Acquire a normal job, waiting (lock released) while it conflicts.
    pub async fn begin_job(self, kind: JobKind) -> Result<(DomainGuard, JobClaim)> {
        let (guard, id) = self.acquire(JobRequest::Normal(kind), None).await?;
        let claim = JobClaim {
            domain: Arc::clone(&guard.domain),
            id,
            kind,
            released: false,
        };
        Ok((guard, claim))
    }

    /// Acquire an async job. Fails at once if another async job is active.
    pub async fn begin_async_job(
        self,
        kind: AsyncJobKind,
        operation: JobOperation,
    ) -> Result<(DomainGuard, AsyncJobClaim)> {
        let (guard, id) = self.acquire(JobRequest::Async(kind), Some(operation)).await?;
        let abort = guard
            .jobs()
            .async_job()
            .map(|j| Arc::clone(&j.abort))
            .unwrap_or_default();
        let claim = AsyncJobClaim {
            domain: Arc::clone(&guard.domain),
            id,
            kind,
            abort,
            released: false,
        };
        Ok((guard, claim))
    }

    /// Acquire an agent job.
    pub async fn begin_agent_job(self, kind: AgentJobKind) -> Result<(DomainGuard, AgentJobClaim)> {
        let (guard, id) = self.acquire(JobRequest::Agent(kind), None).await?;
        let claim = AgentJobClaim {
            domain: Arc::clone(&guard.domain),
            id,
            kind,
            released: false,
        };
        Ok((guard, claim))
    }

    /// Take the normal lane for the owner of `async_id`.
    pub(crate) async fn begin_nested_job(self, async_id: u64) -> Result<(DomainGuard, u64)> {
        self.acquire(JobRequest::Nested { async_id }, None).await
    }

    /// Release a normal job.
    pub fn end_job(&mut self, mut claim: JobClaim) {
        claim.released = true;
        if !claim.belongs_to(&self.domain) {
            tracing::error!(domain = %self.domain.name(), job_id = claim.id, "Job claim belongs to another domain");
            return;
        }
        self.release(Release::Normal(claim.id));
    }

    /// Release an async job, freezing its progress into `completed`.
    pub fn end_async_job(&mut self, mut claim: AsyncJobClaim, outcome: JobOutcome) {
        claim.released = true;
        if !claim.belongs_to(&self.domain) {
            tracing::error!(domain = %self.domain.name(), job_id = claim.id, "Async job claim belongs to another domain");
            return;
        }
        self.release(Release::Async(claim.id, outcome));
    }

    /// Release an agent job.
    pub fn end_agent_job(&mut self, mut claim: AgentJobClaim) {
        claim.released = true;
        if !claim.belongs_to(&self.domain) {
            tracing::error!(domain = %self.domain.name(), job_id = claim.id, "Agent job claim belongs to another domain");
            return;
        }
        self.release(Release::Agent(claim.id));
    }

    pub(crate) fn release(&mut self, release: Release) {
        let domain = Arc::clone(&self.domain);
        let stats = &domain.stats;
        let released = match &release {
            Release::Normal(id) => {
                let done = self.jobs.release_normal(*id);
                if done {
                    stats.normal_ended.fetch_add(1, Ordering::Relaxed);
                }
                done
            }
            Release::Async(id, outcome) => {
                let done = self.jobs.release_async(*id, outcome.clone());
                if done {
                    stats.async_ended.fetch_add(1, Ordering::Relaxed);
                }
                done
            }
            Release::Agent(id) => {
                let done = self.jobs.release_agent(*id);
                if done {
                    stats.agent_ended.fetch_add(1, Ordering::Relaxed);
                }
                done
            }
        };

        if released {
            tracing::debug!(domain = %self.domain.name(), ?release, "Job ended");
            self.domain.job_notify.notify_waiters();
        } else {
            tracing::error!(domain = %self.domain.name(), ?release, "Ending a job that is not active");
        }
    }

    /// Install a granted ticket. Waiters that deferred to it may be
    /// admissible now (a query next to a fresh async job), so they re-check.
    pub(crate) fn grant(&mut self, ticket: u64, operation: Option<JobOperation>) -> u64 {
        let id = self.jobs.install(ticket, operation);
        if self.jobs.waiting() > 0 {
            self.domain.job_notify.notify_waiters();
        }
        id
    }

    /// Queue `request` and wait until it is granted, rejected, or the
    /// bounded wait runs out.
    async fn acquire(
        self,
        request: JobRequest,
        operation: Option<JobOperation>,
    ) -> Result<(DomainGuard, u64)> {
        let domain = Arc::clone(&self.domain);
        let start = Instant::now();
        let deadline = start + domain.tuning.job_wait_timeout;
        let mut guard = self;
        let ticket = guard.jobs.enqueue(request);
        let mut expired = false;

        loop {
            if guard.is_removed() {
                guard.jobs.dequeue(ticket);
                domain.job_notify.notify_waiters();
                return Err(CoreError::DomainGone(domain.name().to_string()));
            }

            match guard.jobs.decide(ticket) {
                Admission::Grant => {
                    let id = guard.grant(ticket, operation);
                    domain.stats.record_start(&request);
                    let waited_ms = start.elapsed().as_millis() as u64;
                    if waited_ms > 0 {
                        tracing::info!(domain = %domain.name(), %request, job_id = id, waited_ms, "Job granted after wait");
                    } else {
                        tracing::debug!(domain = %domain.name(), %request, job_id = id, "Job started");
                    }
                    return Ok((guard, id));
                }
                Admission::Reject => {
                    let reason = guard.jobs().blocker(&request);
                    guard.jobs.dequeue(ticket);
                    domain.job_notify.notify_waiters();
                    domain.stats.busy_rejections.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(domain = %domain.name(), %reason, "Job request rejected");
                    return Err(CoreError::JobBusy {
                        domain: domain.name().to_string(),
                        reason,
                        waited: start.elapsed(),
                    });
                }
                Admission::Wait if expired => {
                    let reason = guard.jobs().blocker(&request);
                    guard.jobs.dequeue(ticket);
                    domain.job_notify.notify_waiters();
                    domain.stats.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        domain = %domain.name(),
                        %reason,
                        timeout_ms = domain.tuning.job_wait_timeout.as_millis() as u64,
                        "Timed out waiting for job"
                    );
                    return Err(CoreError::JobBusy {
                        domain: domain.name().to_string(),
                        reason,
                        waited: start.elapsed(),
                    });
                }
                Admission::Wait => {}
            }

            // Register for the wakeup before the lock is released so an
            // `end_*` between unlock and await is not lost.
            let notified = domain.job_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            tracing::trace!(domain = %domain.name(), %request, "Waiting for job");
            drop(guard);

            expired = tokio::time::timeout_at(deadline, notified).await.is_err();
            guard = domain.lock().await;
        }
    }
}

impl crate::job::JobStats {
    fn record_start(&self, request: &JobRequest) {
        let counter = match request {
            JobRequest::Normal(_) | JobRequest::Nested { .. } => &self.normal_started,
            JobRequest::Async(_) => &self.async_started,
            JobRequest::Agent(_) => &self.agent_started,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainDef, DomainTuning};
    use crate::job::JobStatus;
    use std::time::Duration;

    fn domain_with_wait(wait: Duration) -> Arc<Domain> {
        let tuning = DomainTuning {
            job_wait_timeout: wait,
            ..DomainTuning::default()
        };
        Domain::new(DomainDef::new("web01"), true, tuning, None)
    }

    #[tokio::test]
    async fn test_begin_end_job() {
        let domain = domain_with_wait(Duration::from_secs(1));
        let (mut vm, job) = domain.begin_job(JobKind::Modify).await.unwrap();
        assert_eq!(vm.jobs().normal().unwrap().id, job.id());
        assert!(vm.jobs().current().is_some());
        vm.end_job(job);
        assert!(vm.jobs().normal().is_none());
        assert!(vm.jobs().current().is_none());
        assert_eq!(domain.stats().normal_active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_job_times_out() {
        let domain = domain_with_wait(Duration::from_secs(5));
        let (vm, held) = domain.begin_job(JobKind::Modify).await.unwrap();
        drop(vm);

        let err = domain.begin_job(JobKind::Query).await.unwrap_err();
        assert!(err.is_busy(), "{err}");
        assert_eq!(domain.stats().wait_timeouts.load(Ordering::Relaxed), 1);

        let mut vm = domain.lock().await;
        assert_eq!(vm.jobs.waiting(), 0);
        vm.end_job(held);
    }

    #[tokio::test]
    async fn test_waiter_granted_after_end() {
        let domain = domain_with_wait(Duration::from_secs(5));
        let (vm, held) = domain.begin_job(JobKind::Modify).await.unwrap();
        drop(vm);

        let waiter = {
            let domain = Arc::clone(&domain);
            tokio::spawn(async move {
                let (mut vm, job) = domain.begin_job(JobKind::Query).await?;
                let id = job.id();
                vm.end_job(job);
                Ok::<_, CoreError>(id)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(domain.snapshot().waiting, 1);

        let mut vm = domain.lock().await;
        let held_id = held.id();
        vm.end_job(held);
        drop(vm);

        let granted = waiter.await.unwrap().unwrap();
        assert!(granted > held_id);
    }

    #[tokio::test]
    async fn test_query_deferring_to_async_request_runs_beside_it() {
        let domain = domain_with_wait(Duration::from_secs(30));
        // An older async request, admissible now, outranks the query.
        let mut vm = domain.lock().await;
        let ticket = vm.jobs.enqueue(JobRequest::Async(AsyncJobKind::Snapshot));
        drop(vm);

        let query = {
            let domain = Arc::clone(&domain);
            tokio::spawn(async move {
                let (mut vm, job) = domain.begin_job(JobKind::Query).await?;
                let beside = vm.jobs().async_job().map(|j| j.id);
                vm.end_job(job);
                Ok::<_, CoreError>(beside)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(domain.snapshot().waiting, 2);

        let mut vm = domain.lock().await;
        let async_id = vm.grant(ticket, Some(JobOperation::Snapshot));
        drop(vm);

        let beside = tokio::time::timeout(Duration::from_secs(5), query)
            .await
            .expect("query was never woken")
            .unwrap()
            .unwrap();
        assert_eq!(beside, Some(async_id));

        let mut vm = domain.lock().await;
        vm.release(Release::Async(async_id, JobOutcome::Completed));
        assert_eq!(vm.jobs.waiting(), 0);
    }

    #[tokio::test]
    async fn test_second_async_job_fails_fast() {
        let domain = domain_with_wait(Duration::from_secs(60));
        let (vm, first) = domain
            .begin_async_job(AsyncJobKind::MigrationOut, JobOperation::MigrationOut)
            .await
            .unwrap();
        drop(vm);

        let started = Instant::now();
        let err = domain
            .begin_async_job(AsyncJobKind::MigrationOut, JobOperation::MigrationOut)
            .await
            .unwrap_err();
        assert!(err.is_busy());
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut vm = domain.lock().await;
        vm.end_async_job(first, JobOutcome::Completed);
        assert_eq!(vm.jobs().completed().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_agent_lane_is_independent() {
        let domain = domain_with_wait(Duration::from_millis(200));
        let (vm, normal) = domain.begin_job(JobKind::Modify).await.unwrap();
        let (vm, agent) = vm.begin_agent_job(AgentJobKind::Modify).await.unwrap();
        let (mut vm, async_job) = {
            // An async job has to wait for the normal lane.
            drop(vm);
            let err = domain
                .begin_async_job(AsyncJobKind::Backup, JobOperation::Backup)
                .await
                .unwrap_err();
            assert!(err.is_busy());
            let mut vm = domain.lock().await;
            vm.end_job(normal);
            vm.begin_async_job(AsyncJobKind::Backup, JobOperation::Backup)
                .await
                .unwrap()
        };
        assert!(vm.jobs().agent().is_some());
        assert!(vm.jobs().async_job().is_some());
        vm.end_agent_job(agent);
        vm.end_async_job(async_job, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_removed_domain_fails_waiters() {
        let domain = domain_with_wait(Duration::from_secs(30));
        let (vm, held) = domain.begin_job(JobKind::Modify).await.unwrap();
        drop(vm);

        let waiter = {
            let domain = Arc::clone(&domain);
            tokio::spawn(async move { domain.begin_job(JobKind::Query).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut vm = domain.lock().await;
        vm.mark_removed();
        vm.end_job(held);
        drop(vm);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::DomainGone(_)));
    }

    #[tokio::test]
    async fn test_dropped_claim_is_released() {
        let domain = domain_with_wait(Duration::from_secs(5));
        {
            let (_vm, _job) = domain.begin_job(JobKind::Modify).await.unwrap();
        }
        // The background release runs before this acquisition completes.
        let (mut vm, job) = domain.begin_job(JobKind::Modify).await.unwrap();
        vm.end_job(job);
        assert_eq!(domain.stats().normal_active(), 0);
    }

    #[tokio::test]
    async fn test_abort_without_async_job() {
        let domain = domain_with_wait(Duration::from_secs(1));
        assert!(matches!(
            domain.abort_async_job().await,
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_without_monitor() {
        let domain = domain_with_wait(Duration::from_secs(1));
        let (vm, job) = domain
            .begin_async_job(AsyncJobKind::Save, JobOperation::Save)
            .await
            .unwrap();
        drop(vm);

        assert_eq!(domain.abort_async_job().await.unwrap(), AbortOutcome::Flagged);
        assert!(job.is_abort_requested());
        assert_eq!(
            domain.abort_async_job().await.unwrap(),
            AbortOutcome::AlreadyRequested
        );

        let mut vm = domain.lock().await;
        vm.end_async_job(job, JobOutcome::Failed("cancelled by client".into()));
        assert_eq!(vm.jobs().completed().unwrap().status, JobStatus::Cancelled);
    }
}
