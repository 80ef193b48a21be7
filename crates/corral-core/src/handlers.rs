//! Lifecycle handlers run by the event worker.
//!
//! Each handler takes the same kind of job an API caller would for the same
//! change, so event processing interleaves with API calls under the usual
//! job rules.

use crate::domain::{
    BlockJobState, BlockJobStatus, ChannelKind, CrashAction, DeviceKind, DeviceState, Domain,
    DomainStatus, StateReason,
};
use crate::error::Result;
use crate::event::{Event, EventKind, WatchdogAction};
use crate::job::JobKind;
use crate::lifecycle::LifecycleKind;
use crate::manager::Services;
use crate::ops;
use crate::queue::EventHandler;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Alias of the virtio-serial port the guest agent lives on.
pub const AGENT_PORT: &str = "channel0";

/// The standard handler set.
pub struct LifecycleHandlers {
    services: Arc<Services>,
}

impl LifecycleHandlers {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn dispatch(&self, domain: &Arc<Domain>, kind: EventKind) -> Result<()> {
        match kind {
            EventKind::Watchdog { action } => self.watchdog(domain, action).await,
            EventKind::GuestPanic { info } => self.guest_panic(domain, info).await,
            EventKind::DeviceDeleted { alias } => self.device_deleted(domain, &alias).await,
            EventKind::NicRxFilterChanged { alias } => self.rx_filter_changed(domain, &alias).await,
            EventKind::SerialChanged { alias, connected } => {
                self.serial_changed(domain, &alias, connected).await
            }
            EventKind::BlockJob {
                disk,
                job_id,
                job_type,
                status,
                offset,
                len,
                error,
            } => {
                let state = BlockJobState {
                    job_id,
                    job_type,
                    status: block_job_status(&status, error.is_some()),
                    offset,
                    len,
                    error,
                };
                self.block_job(domain, disk, state).await
            }
            EventKind::JobStatusChange { id, status } => self.job_status_change(domain, &id, &status).await,
            EventKind::MonitorEof { generation } => self.monitor_eof(domain, generation).await,
            EventKind::AgentEof { generation } => self.agent_eof(domain, generation).await,
            EventKind::PrDisconnect => self.pr_disconnect(domain).await,
            EventKind::RdmaGidStatusChanged {
                netdev,
                gid_status,
                subnet_prefix,
                interface_id,
            } => {
                let gid = gid_status.then(|| format!("{subnet_prefix:016x}:{interface_id:016x}"));
                self.rdma_gid_changed(domain, &netdev, gid).await
            }
            EventKind::GuestCrashLoaded => self.guest_crash_loaded(domain).await,
            EventKind::MemoryDeviceSizeChange { alias, size } => {
                self.memory_size_changed(domain, &alias, size).await
            }
        }
    }

    async fn watchdog(&self, domain: &Arc<Domain>, action: WatchdogAction) -> Result<()> {
        tracing::warn!(domain = %domain.name(), ?action, "Watchdog fired");
        if matches!(action, WatchdogAction::Pause | WatchdogAction::Dump) {
            let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
            if guard.status() == DomainStatus::Running {
                guard.set_status(DomainStatus::Paused, StateReason::Watchdog);
            }
            guard.end_job(job);
        }
        self.services.notifier.emit(
            domain.reference(),
            LifecycleKind::Watchdog,
            format!("{action:?}").to_lowercase(),
        );

        if action == WatchdogAction::Dump {
            let path = self.services.dump_path(domain.name());
            ops::dump(&self.services, domain, &path).await?;
            ops::resume(&self.services, domain).await?;
        }
        Ok(())
    }

    async fn guest_panic(&self, domain: &Arc<Domain>, info: Option<Value>) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        if !guard.is_active() {
            guard.end_job(job);
            return Ok(());
        }
        tracing::error!(domain = %domain.name(), info = ?info, "Guest panicked");
        guard.set_status(DomainStatus::Crashed, StateReason::Panicked);
        let on_crash = guard.def().on_crash;
        guard.end_job(job);
        drop(guard);
        self.services
            .notifier
            .emit(domain.reference(), LifecycleKind::Crashed, "panicked");

        if on_crash == CrashAction::Destroy {
            ops::stop_with_reason(&self.services, domain, StateReason::Crashed, true).await?;
        }
        Ok(())
    }

    async fn guest_crash_loaded(&self, domain: &Arc<Domain>) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        if guard.is_active() {
            tracing::error!(domain = %domain.name(), "Guest loaded a crash kernel");
            guard.set_status(DomainStatus::Crashed, StateReason::CrashLoaded);
            self.services
                .notifier
                .emit(domain.reference(), LifecycleKind::Crashed, "crash-loaded");
        }
        guard.end_job(job);
        Ok(())
    }

    async fn device_deleted(&self, domain: &Arc<Domain>, alias: &str) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        let removed = guard.devices_mut().remove(alias).is_some();
        guard.end_job(job);
        if removed {
            tracing::info!(domain = %domain.name(), alias, "Device removed");
            self.services
                .notifier
                .emit(domain.reference(), LifecycleKind::DeviceRemoved, alias);
        } else {
            tracing::debug!(domain = %domain.name(), alias, "Deleted device was not tracked");
        }
        Ok(())
    }

    async fn rx_filter_changed(&self, domain: &Arc<Domain>, alias: &str) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        if !guard.is_active() || !guard.devices().contains_key(alias) {
            guard.end_job(job);
            return Ok(());
        }
        let (mut guard, reply) = guard
            .monitor_call(&job, "query-rx-filter", json!({ "name": alias }))
            .await;
        let result = reply.map(|reply| {
            let mac = reply
                .get(0)
                .and_then(|filter| filter.get("main-mac"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(device) = guard.devices_mut().get_mut(alias) {
                tracing::debug!(domain = %domain.name(), alias, mac = ?mac, "RX filter refreshed");
                device.mac = mac;
            }
        });
        guard.end_job(job);
        result
    }

    async fn serial_changed(&self, domain: &Arc<Domain>, alias: &str, connected: bool) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        guard
            .devices_mut()
            .entry(alias.to_string())
            .or_insert_with(|| DeviceState::new(DeviceKind::Channel))
            .connected = Some(connected);

        let is_agent = alias == AGENT_PORT && guard.def().agent;
        let detached = is_agent && !connected && guard.detach_channel(ChannelKind::Agent, None);
        let wants_agent = is_agent && connected && guard.is_active() && !guard.agent_attached();
        guard.end_job(job);
        drop(guard);

        if detached {
            tracing::info!(domain = %domain.name(), "Guest agent went away");
            self.services
                .notifier
                .emit(domain.reference(), LifecycleKind::AgentDisconnected, "");
        }
        if wants_agent {
            ops::connect_agent(&self.services, domain).await;
        }
        Ok(())
    }

    async fn block_job(&self, domain: &Arc<Domain>, disk: String, state: BlockJobState) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        let detail = format!("{disk}: {} {:?}", state.job_type, state.status);
        match state.status {
            BlockJobStatus::Running | BlockJobStatus::Ready => {
                guard.block_jobs_mut().insert(disk, state);
            }
            BlockJobStatus::Completed | BlockJobStatus::Failed | BlockJobStatus::Cancelled => {
                guard.block_jobs_mut().remove(&disk);
            }
        }
        guard.end_job(job);
        tracing::info!(domain = %domain.name(), %detail, "Block job update");
        self.services
            .notifier
            .emit(domain.reference(), LifecycleKind::BlockJob, detail);
        Ok(())
    }

    async fn job_status_change(&self, domain: &Arc<Domain>, id: &str, status: &str) -> Result<()> {
        if status != "concluded" {
            tracing::trace!(domain = %domain.name(), id, status, "Emulator job status");
            return Ok(());
        }
        let (guard, job) = domain.begin_job(JobKind::Modify).await?;
        if !guard.monitor_attached() {
            let mut guard = guard;
            guard.end_job(job);
            return Ok(());
        }
        let (mut guard, reply) = guard.monitor_call(&job, "job-dismiss", json!({ "id": id })).await;
        guard.end_job(job);
        reply?;
        tracing::debug!(domain = %domain.name(), id, "Concluded emulator job dismissed");
        Ok(())
    }

    async fn monitor_eof(&self, domain: &Arc<Domain>, generation: u64) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Destroy).await?;
        if !guard.eof_is_current(ChannelKind::Monitor, generation) {
            tracing::debug!(domain = %domain.name(), generation, "Stale monitor EOF ignored");
            guard.end_job(job);
            return Ok(());
        }
        if !guard.is_active() {
            tracing::debug!(domain = %domain.name(), "Monitor EOF for inactive domain");
            guard.end_job(job);
            return Ok(());
        }
        let reason = match guard.status() {
            DomainStatus::Crashed => StateReason::Crashed,
            _ => StateReason::Shutdown,
        };
        tracing::warn!(domain = %domain.name(), ?reason, "Monitor connection lost, stopping domain");
        ops::stop_under_job(&self.services, guard, job, reason, false).await
    }

    async fn agent_eof(&self, domain: &Arc<Domain>, generation: u64) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        if !guard.eof_is_current(ChannelKind::Agent, generation) {
            tracing::debug!(domain = %domain.name(), generation, "Stale agent EOF ignored");
            guard.end_job(job);
            return Ok(());
        }
        let active = guard.is_active();
        guard.end_job(job);
        drop(guard);
        tracing::info!(domain = %domain.name(), "Guest agent channel closed");
        if active {
            self.services
                .notifier
                .emit(domain.reference(), LifecycleKind::AgentDisconnected, "eof");
        }
        Ok(())
    }

    async fn pr_disconnect(&self, domain: &Arc<Domain>) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        guard.set_pr_helper_connected(false);
        guard.end_job(job);
        tracing::warn!(domain = %domain.name(), "Persistent reservation helper disconnected");
        Ok(())
    }

    async fn rdma_gid_changed(&self, domain: &Arc<Domain>, netdev: &str, gid: Option<String>) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        if let Some(device) = guard.devices_mut().get_mut(netdev) {
            tracing::debug!(domain = %domain.name(), netdev, gid = ?gid, "RDMA GID changed");
            device.rdma_gid = gid;
        }
        guard.end_job(job);
        Ok(())
    }

    async fn memory_size_changed(&self, domain: &Arc<Domain>, alias: &str, size: u64) -> Result<()> {
        let (mut guard, job) = domain.begin_job(JobKind::Modify).await?;
        let known = match guard.devices_mut().get_mut(alias) {
            Some(device) => {
                device.size = Some(size);
                true
            }
            None => false,
        };
        guard.end_job(job);
        if known {
            self.services
                .notifier
                .emit(domain.reference(), LifecycleKind::MemoryResized, format!("{alias}: {size}"));
        }
        Ok(())
    }
}

fn block_job_status(status: &str, failed: bool) -> BlockJobStatus {
    match status {
        "ready" => BlockJobStatus::Ready,
        "cancelled" => BlockJobStatus::Cancelled,
        "concluded" | "completed" if failed => BlockJobStatus::Failed,
        "concluded" | "completed" => BlockJobStatus::Completed,
        "failed" => BlockJobStatus::Failed,
        _ => BlockJobStatus::Running,
    }
}

#[async_trait]
impl EventHandler for LifecycleHandlers {
    async fn handle(&self, domain: Arc<Domain>, event: Event) -> Result<()> {
        match self.dispatch(&domain, event.kind).await {
            Err(e) if e.is_gone() => {
                tracing::debug!(domain = %domain.name(), seq = event.seq, "Domain went away during event");
                Ok(())
            }
            other => other,
        }
    }
}
