//! Domain operations.
//!
//! Every operation follows the same shape: begin the right kind of job,
//! talk to the emulator or the guest through sessions, update state, end
//! the job. Event handlers call these exactly like API callers do.

use crate::controller::{AbortOutcome, AsyncJobClaim, JobClaim};
use crate::domain::{ChannelKind, Domain, DomainGuard, DomainStatus, StateReason};
use crate::error::{CoreError, Result};
use crate::job::{AgentJobKind, AsyncJobKind, JobKind, JobOperation, JobOutcome, JobProgress};
use crate::lifecycle::LifecycleKind;
use crate::manager::Services;
use crate::process::LaunchMode;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn require(guard: &DomainGuard, ok: bool, expected: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidState {
            expected: expected.to_string(),
            actual: guard.status().to_string(),
        })
    }
}

// ============================================================================
// Start / stop
// ============================================================================

/// Start an inactive domain, restoring its managed-save image if there is one.
pub async fn start(services: &Services, domain: &Arc<Domain>) -> Result<()> {
    let (guard, job) = domain
        .begin_async_job(AsyncJobKind::Start, JobOperation::Start)
        .await?;
    if let Err(e) = require(&guard, !guard.is_active(), "shutoff") {
        let mut guard = guard;
        guard.end_async_job(job, JobOutcome::Failed(e.to_string()));
        return Err(e);
    }

    let restore = guard.managed_save().cloned();
    let def = guard.def().clone();
    let mode = if restore.is_some() {
        LaunchMode::Incoming
    } else {
        LaunchMode::Fresh
    };
    tracing::info!(domain = %def.name, ?mode, "Starting domain");

    // Launching spawns and connects; the job keeps others out meanwhile.
    drop(guard);
    let launched = services.process.launch(&def, mode).await;
    let mut guard = domain.lock().await;
    let launched = match launched {
        Ok(launched) => launched,
        Err(e) => {
            tracing::error!(domain = %def.name, error = %e, "Launch failed");
            guard.end_async_job(job, JobOutcome::Failed(e.to_string()));
            return Err(e);
        }
    };

    guard.set_pid(launched.pid);
    guard.set_status(DomainStatus::Paused, StateReason::Booted);
    launched.monitor.attach(&mut guard, ChannelKind::Monitor);

    let (guard, booted) = boot(services, guard, &job, restore.as_deref()).await;
    let mut guard = match booted {
        Ok(()) => guard,
        Err(e) => {
            tracing::error!(domain = %def.name, error = %e, "Start failed, tearing emulator down");
            let mut guard = teardown(services, guard, true).await;
            mark_stopped(services, &mut guard, StateReason::Failed).await;
            guard.end_async_job(job, JobOutcome::Failed(e.to_string()));
            return Err(e);
        }
    };

    let reason = if restore.is_some() {
        StateReason::Restored
    } else {
        StateReason::Booted
    };
    guard.set_status(DomainStatus::Running, reason);
    guard.end_async_job(job, JobOutcome::Completed);
    tracing::info!(domain = %def.name, pid = ?guard.pid(), ?reason, "Domain started");
    services
        .notifier
        .emit(domain.reference(), LifecycleKind::Started, format!("{reason:?}").to_lowercase());

    if def.agent {
        drop(guard);
        connect_agent(services, domain).await;
    }
    Ok(())
}

/// Restore state if needed and start the vCPUs.
async fn boot(
    services: &Services,
    guard: DomainGuard,
    job: &AsyncJobClaim,
    restore: Option<&Path>,
) -> (DomainGuard, Result<()>) {
    let mut guard = guard;
    if let Some(path) = restore {
        if let Err(e) = check_abort(job) {
            return (guard, Err(e));
        }
        tracing::info!(domain = %guard.def().name, path = %path.display(), "Restoring managed-save image");
        let uri = format!("exec:cat {}", path.display());
        let (g, reply) = guard
            .async_monitor_call(job, "migrate-incoming", json!({ "uri": uri }))
            .await;
        guard = g;
        if let Err(e) = reply {
            return (guard, Err(e));
        }
        let (g, done) = wait_for_migration(services, guard, job).await;
        guard = g;
        if let Err(e) = done {
            return (guard, Err(e));
        }

        let path = path.to_path_buf();
        let domain = Arc::clone(guard.domain());
        drop(guard);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to discard managed-save image");
        }
        guard = domain.lock().await;
        guard.set_managed_save(None);
    }

    if let Err(e) = check_abort(job) {
        return (guard, Err(e));
    }
    let (guard, reply) = guard.async_monitor_call(job, "cont", json!({})).await;
    (guard, reply.map(|_| ()))
}

/// Attach the guest agent, if it answers. Failures leave the agent detached.
pub async fn connect_agent(services: &Services, domain: &Arc<Domain>) {
    let def = {
        let guard = domain.lock().await;
        if !guard.is_active() || guard.agent_attached() || !guard.def().agent {
            return;
        }
        guard.def().clone()
    };
    match services.process.connect_agent(&def).await {
        Ok(connection) => {
            let mut guard = domain.lock().await;
            if !guard.is_active() || guard.agent_attached() {
                tracing::debug!(domain = %def.name, "Agent connection no longer needed");
                return;
            }
            connection.attach(&mut guard, ChannelKind::Agent);
            drop(guard);
            services
                .notifier
                .emit(domain.reference(), LifecycleKind::AgentConnected, "");
        }
        Err(e) => tracing::warn!(domain = %def.name, error = %e, "Guest agent not reachable"),
    }
}

/// Ask the guest to power down. Completion arrives as a monitor EOF.
pub async fn shutdown(_services: &Services, domain: &Arc<Domain>) -> Result<()> {
    let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
    if let Err(e) = require(&guard, guard.is_active(), "running or paused") {
        guard.end_job(job);
        return Err(e);
    }
    let (mut guard, reply) = guard.monitor_call(&job, "system_powerdown", json!({})).await;
    guard.end_job(job);
    reply?;
    tracing::info!(domain = %domain.name(), "Guest shutdown requested");
    Ok(())
}

/// Kill the emulator. Served ahead of every other waiting job.
pub async fn destroy(services: &Services, domain: &Arc<Domain>) -> Result<()> {
    stop_with_reason(services, domain, StateReason::Destroyed, true).await
}

/// Tear a running domain down under a destroy job.
pub(crate) async fn stop_with_reason(
    services: &Services,
    domain: &Arc<Domain>,
    reason: StateReason,
    force: bool,
) -> Result<()> {
    let (guard, job) = domain.begin_job(JobKind::Destroy).await?;
    stop_under_job(services, guard, job, reason, force).await
}

/// Tear a running domain down with its destroy job already held.
pub(crate) async fn stop_under_job(
    services: &Services,
    mut guard: DomainGuard,
    job: JobClaim,
    reason: StateReason,
    force: bool,
) -> Result<()> {
    if let Err(e) = require(&guard, guard.is_active(), "running or paused") {
        guard.end_job(job);
        return Err(e);
    }
    tracing::info!(domain = %guard.domain().name(), ?reason, force, "Stopping domain");
    let mut guard = teardown(services, guard, force).await;
    mark_stopped(services, &mut guard, reason).await;
    guard.end_job(job);
    Ok(())
}

/// Detach both channels and terminate the emulator. The lock is released
/// while the process goes away.
async fn teardown(services: &Services, mut guard: DomainGuard, force: bool) -> DomainGuard {
    // Detaching first means the reader's EOF for this generation is ignored.
    guard.detach_channel(ChannelKind::Monitor, None);
    guard.detach_channel(ChannelKind::Agent, None);
    let domain = Arc::clone(guard.domain());
    drop(guard);
    if let Err(e) = services.process.terminate(domain.uuid(), force).await {
        tracing::warn!(domain = %domain.name(), error = %e, "Failed to terminate emulator");
    }
    domain.lock().await
}

/// Record that the emulator is gone.
pub(crate) async fn mark_stopped(services: &Services, guard: &mut DomainGuard, reason: StateReason) {
    guard.detach_channel(ChannelKind::Monitor, None);
    guard.detach_channel(ChannelKind::Agent, None);
    guard.set_pid(None);
    guard.block_jobs_mut().clear();
    guard.set_status(DomainStatus::Shutoff, reason);
    services.notifier.emit(
        guard.domain().reference(),
        LifecycleKind::Stopped,
        format!("{reason:?}").to_lowercase(),
    );
    services.forget_if_transient(guard).await;
}

// ============================================================================
// Pause / resume / query
// ============================================================================

/// Pause the vCPUs.
pub async fn suspend(services: &Services, domain: &Arc<Domain>) -> Result<()> {
    let (mut guard, job) = domain.begin_job(JobKind::Suspend).await?;
    if let Err(e) = require(&guard, guard.status() == DomainStatus::Running, "running") {
        guard.end_job(job);
        return Err(e);
    }
    let (mut guard, reply) = guard.monitor_call(&job, "stop", json!({})).await;
    if reply.is_ok() {
        guard.set_status(DomainStatus::Paused, StateReason::User);
    }
    guard.end_job(job);
    reply?;
    services
        .notifier
        .emit(domain.reference(), LifecycleKind::Suspended, "user");
    Ok(())
}

/// Resume paused vCPUs.
pub async fn resume(services: &Services, domain: &Arc<Domain>) -> Result<()> {
    let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
    if let Err(e) = require(&guard, guard.status() == DomainStatus::Paused, "paused") {
        guard.end_job(job);
        return Err(e);
    }
    let (mut guard, reply) = guard.monitor_call(&job, "cont", json!({})).await;
    if reply.is_ok() {
        guard.set_status(DomainStatus::Running, StateReason::User);
    }
    guard.end_job(job);
    reply?;
    services
        .notifier
        .emit(domain.reference(), LifecycleKind::Resumed, "user");
    Ok(())
}

/// Ask the emulator for the run state and reconcile the cached status.
pub async fn query_status(_services: &Services, domain: &Arc<Domain>) -> Result<DomainStatus> {
    let (mut guard, job) = domain.begin_job(JobKind::Query).await?;
    if !guard.is_active() || !guard.monitor_attached() {
        let status = guard.status();
        guard.end_job(job);
        return Ok(status);
    }
    let (mut guard, reply) = guard.monitor_call(&job, "query-status", json!({})).await;
    let result = reply.map(|reply| {
        match reply.get("status").and_then(Value::as_str) {
            Some("running") => {
                if guard.status() != DomainStatus::Running {
                    guard.set_status(DomainStatus::Running, StateReason::Unknown);
                }
            }
            Some("guest-panicked") => {
                if guard.status() != DomainStatus::Crashed {
                    guard.set_status(DomainStatus::Crashed, StateReason::Panicked);
                }
            }
            Some(_) if guard.status() == DomainStatus::Running => {
                guard.set_status(DomainStatus::Paused, StateReason::Unknown);
            }
            _ => {}
        }
        guard.status()
    });
    guard.end_job(job);
    result
}

/// Job information as seen by `job_info`.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    /// Active normal job.
    pub normal_job: Option<String>,
    /// Active async job.
    pub async_job: Option<AsyncJobKind>,
    /// Active agent job.
    pub agent_job: Option<AgentJobKind>,
    /// Progress of the job in flight.
    pub current: Option<JobProgress>,
    /// Last finished async job.
    pub completed: Option<JobProgress>,
    /// Queued job requests.
    pub waiting: usize,
    /// Whether a monitor exchange has been outstanding longer than the RPC timeout.
    pub monitor_stuck: bool,
}

/// Current and last-completed job progress. Never takes the object lock.
pub fn job_info(domain: &Domain) -> JobInfo {
    let snapshot = domain.snapshot();
    JobInfo {
        normal_job: snapshot.normal_job.clone(),
        async_job: snapshot.async_job,
        agent_job: snapshot.agent_job,
        current: snapshot.current.clone(),
        completed: snapshot.completed.clone(),
        waiting: snapshot.waiting,
        monitor_stuck: snapshot.monitor_stuck(domain.tuning().rpc_timeout),
    }
}

/// Abort the active async job.
pub async fn abort_job(domain: &Arc<Domain>) -> Result<AbortOutcome> {
    domain.abort_async_job().await
}

// ============================================================================
// Save / migrate / dump
// ============================================================================

/// Poll `query-migrate` until the transfer ends, recording progress.
async fn wait_for_migration(
    services: &Services,
    mut guard: DomainGuard,
    job: &AsyncJobClaim,
) -> (DomainGuard, Result<()>) {
    let domain = Arc::clone(guard.domain());
    loop {
        let (g, reply) = guard.async_monitor_call(job, "query-migrate", json!({})).await;
        guard = g;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => return (guard, Err(e)),
        };

        if let Some(ram) = reply.get("ram") {
            let field = |name: &str| ram.get(name).and_then(Value::as_u64).unwrap_or(0);
            let (total, transferred, remaining) =
                (field("total"), field("transferred"), field("remaining"));
            if let Some(progress) = guard.progress_mut() {
                progress.update(total, transferred, remaining);
            }
        }

        match reply.get("status").and_then(Value::as_str).unwrap_or("") {
            "completed" => return (guard, Ok(())),
            "failed" => {
                let message = reply
                    .get("error-desc")
                    .and_then(Value::as_str)
                    .unwrap_or("migration failed")
                    .to_string();
                return (
                    guard,
                    Err(CoreError::Command {
                        command: "migrate".into(),
                        class: "GenericError".into(),
                        message,
                    }),
                );
            }
            "cancelled" => {
                return (
                    guard,
                    Err(CoreError::Command {
                        command: "migrate".into(),
                        class: "Cancelled".into(),
                        message: "migration cancelled".into(),
                    }),
                );
            }
            status => {
                tracing::trace!(domain = %domain.name(), status, "Migration in progress");
                if job.is_abort_requested() {
                    return cancel_in_flight(guard, job).await;
                }
            }
        }

        drop(guard);
        tokio::time::sleep(services.config.progress_poll_interval).await;
        guard = domain.lock().await;
    }
}

/// Safe point for long-running owners: fails once an abort was requested.
fn check_abort(job: &AsyncJobClaim) -> Result<()> {
    if job.is_abort_requested() {
        tracing::info!(job_id = job.id(), kind = %job.kind(), "Async job stopping on abort request");
        Err(CoreError::Aborted(job.kind().to_string()))
    } else {
        Ok(())
    }
}

/// Stop the transfer the job started, then report the abort.
async fn cancel_in_flight(mut guard: DomainGuard, job: &AsyncJobClaim) -> (DomainGuard, Result<()>) {
    if let Some(command) = job.kind().cancel_command() {
        let (g, reply) = guard.async_monitor_call(job, command, json!({})).await;
        guard = g;
        if let Err(e) = reply {
            tracing::warn!(domain = %guard.domain().name(), command, error = %e, "Cancel command failed");
        }
    }
    (guard, check_abort(job))
}

fn outcome_of(result: &Result<()>, job: &AsyncJobClaim) -> JobOutcome {
    match result {
        Ok(()) => JobOutcome::Completed,
        Err(_) if job.is_abort_requested() => JobOutcome::Cancelled,
        Err(e) => JobOutcome::Failed(e.to_string()),
    }
}

/// Save guest state to the managed-save image and stop the domain. The next
/// `start` restores from it.
pub async fn save(services: &Services, domain: &Arc<Domain>) -> Result<PathBuf> {
    let path = services.managed_save_path(domain.name());
    tokio::fs::create_dir_all(&services.config.save_dir).await?;

    let (guard, job) = domain
        .begin_async_job(AsyncJobKind::Save, JobOperation::Save)
        .await?;
    if let Err(e) = require(&guard, guard.is_active(), "running or paused") {
        let mut guard = guard;
        guard.end_async_job(job, JobOutcome::Failed(e.to_string()));
        return Err(e);
    }
    tracing::info!(domain = %domain.name(), path = %path.display(), "Saving domain");

    let was_running = guard.status() == DomainStatus::Running;
    let mut guard = guard;
    if was_running {
        let (g, reply) = guard.async_monitor_call(&job, "stop", json!({})).await;
        guard = g;
        if let Err(e) = reply {
            guard.end_async_job(job, JobOutcome::Failed(e.to_string()));
            return Err(e);
        }
        guard.set_status(DomainStatus::Paused, StateReason::SaveInProgress);
    }

    let (g, result) = match check_abort(&job) {
        Ok(()) => {
            let uri = format!("exec:cat > {}", path.display());
            let (g, reply) = guard.async_monitor_call(&job, "migrate", json!({ "uri": uri })).await;
            match reply {
                Ok(_) => wait_for_migration(services, g, &job).await,
                Err(e) => (g, Err(e)),
            }
        }
        Err(e) => (guard, Err(e)),
    };
    guard = g;

    let outcome = outcome_of(&result, &job);
    if let Err(e) = result {
        tracing::warn!(domain = %domain.name(), error = %e, "Save failed");
        if was_running && guard.monitor_attached() {
            let (g, reply) = guard.async_monitor_call(&job, "cont", json!({})).await;
            guard = g;
            match reply {
                Ok(_) => guard.set_status(DomainStatus::Running, StateReason::User),
                Err(e) => tracing::warn!(domain = %domain.name(), error = %e, "Could not resume after failed save"),
            }
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial save image");
            }
        }
        guard.end_async_job(job, outcome);
        return Err(e);
    }

    guard.set_managed_save(Some(path.clone()));
    let mut guard = teardown(services, guard, false).await;
    mark_stopped(services, &mut guard, StateReason::Saved).await;
    guard.end_async_job(job, JobOutcome::Completed);
    tracing::info!(domain = %domain.name(), path = %path.display(), "Domain saved");
    Ok(path)
}

/// Migrate the domain out to `uri`. On success the local emulator is stopped;
/// on failure the domain keeps running here.
pub async fn migrate(services: &Services, domain: &Arc<Domain>, uri: &str) -> Result<()> {
    let (guard, job) = domain
        .begin_async_job(AsyncJobKind::MigrationOut, JobOperation::MigrationOut)
        .await?;
    if let Err(e) = require(&guard, guard.is_active(), "running or paused") {
        let mut guard = guard;
        guard.end_async_job(job, JobOutcome::Failed(e.to_string()));
        return Err(e);
    }
    tracing::info!(domain = %domain.name(), uri, "Starting outgoing migration");

    let (mut guard, result) = match check_abort(&job) {
        Ok(()) => {
            let (guard, reply) = guard.async_monitor_call(&job, "migrate", json!({ "uri": uri })).await;
            match reply {
                Ok(_) => wait_for_migration(services, guard, &job).await,
                Err(e) => (guard, Err(e)),
            }
        }
        Err(e) => (guard, Err(e)),
    };

    let outcome = outcome_of(&result, &job);
    if let Err(e) = result {
        tracing::warn!(domain = %domain.name(), error = %e, "Migration failed");
        guard.end_async_job(job, outcome);
        return Err(e);
    }

    let mut guard = teardown(services, guard, false).await;
    mark_stopped(services, &mut guard, StateReason::Migrated).await;
    guard.end_async_job(job, JobOutcome::Completed);
    tracing::info!(domain = %domain.name(), "Migration completed");
    Ok(())
}

/// Dump guest memory to `path`, polling until the dump finishes.
pub async fn dump(services: &Services, domain: &Arc<Domain>, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let (guard, job) = domain
        .begin_async_job(AsyncJobKind::Dump, JobOperation::Dump)
        .await?;
    if let Err(e) = require(&guard, guard.is_active(), "running or paused") {
        let mut guard = guard;
        guard.end_async_job(job, JobOutcome::Failed(e.to_string()));
        return Err(e);
    }
    tracing::info!(domain = %domain.name(), path = %path.display(), "Dumping guest memory");

    let args = json!({
        "paging": false,
        "protocol": format!("file:{}", path.display()),
        "detach": true,
    });
    let (mut guard, mut result) = match check_abort(&job) {
        Ok(()) => {
            let (guard, reply) = guard.async_monitor_call(&job, "dump-guest-memory", args).await;
            (guard, reply.map(|_| ()))
        }
        Err(e) => (guard, Err(e)),
    };

    while result.is_ok() {
        let (g, reply) = guard.async_monitor_call(&job, "query-dump", json!({})).await;
        guard = g;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        let field = |name: &str| reply.get(name).and_then(Value::as_u64).unwrap_or(0);
        let (total, completed) = (field("total"), field("completed"));
        if let Some(progress) = guard.progress_mut() {
            progress.update(total, completed, total.saturating_sub(completed));
        }
        match reply.get("status").and_then(Value::as_str).unwrap_or("") {
            "completed" => break,
            "failed" => {
                result = Err(CoreError::Command {
                    command: "dump-guest-memory".into(),
                    class: "GenericError".into(),
                    message: "dump failed".into(),
                });
            }
            _ if job.is_abort_requested() => {
                let (g, cancelled) = cancel_in_flight(guard, &job).await;
                guard = g;
                result = cancelled;
            }
            _ => {
                drop(guard);
                tokio::time::sleep(services.config.progress_poll_interval).await;
                guard = domain.lock().await;
            }
        }
    }

    let outcome = outcome_of(&result, &job);
    match &result {
        Ok(()) => {
            tracing::info!(domain = %domain.name(), path = %path.display(), "Memory dump written");
            guard.end_async_job(job, outcome);
            services
                .notifier
                .emit(domain.reference(), LifecycleKind::JobCompleted, "dump");
        }
        Err(e) => {
            tracing::warn!(domain = %domain.name(), error = %e, "Memory dump failed");
            guard.end_async_job(job, outcome);
        }
    }
    result
}

// ============================================================================
// Guest agent
// ============================================================================

async fn agent_request(
    domain: &Arc<Domain>,
    kind: AgentJobKind,
    command: &str,
    args: Value,
) -> Result<Value> {
    let (mut guard, job) = domain.begin_agent_job(kind).await?;
    if let Err(e) = require(&guard, guard.status() == DomainStatus::Running, "running") {
        guard.end_agent_job(job);
        return Err(e);
    }
    let (mut guard, reply) = guard.agent_call(&job, command, args).await;
    guard.end_agent_job(job);
    reply
}

/// Check that the guest agent answers.
pub async fn agent_ping(domain: &Arc<Domain>) -> Result<()> {
    agent_request(domain, AgentJobKind::Query, "guest-ping", json!({}))
        .await
        .map(|_| ())
}

/// Freeze guest filesystems. Returns how many were frozen.
pub async fn agent_fs_freeze(domain: &Arc<Domain>) -> Result<u64> {
    let reply = agent_request(domain, AgentJobKind::Modify, "guest-fsfreeze-freeze", json!({})).await?;
    reply
        .as_u64()
        .ok_or_else(|| CoreError::Protocol(format!("unexpected freeze reply: {reply}")))
}

/// Thaw guest filesystems. Returns how many were thawed.
pub async fn agent_fs_thaw(domain: &Arc<Domain>) -> Result<u64> {
    let reply = agent_request(domain, AgentJobKind::Modify, "guest-fsfreeze-thaw", json!({})).await?;
    reply
        .as_u64()
        .ok_or_else(|| CoreError::Protocol(format!("unexpected thaw reply: {reply}")))
}

/// Set the guest hostname.
pub async fn agent_set_hostname(domain: &Arc<Domain>, hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(CoreError::Config("hostname must not be empty".into()));
    }
    agent_request(
        domain,
        AgentJobKind::Modify,
        "guest-set-host-name",
        json!({ "host-name": hostname }),
    )
    .await
    .map(|_| ())
}
