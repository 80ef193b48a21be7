//! Manager configuration types.

use crate::domain::DomainTuning;
use crate::error::CoreError;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by the domain manager, its domains and the event worker.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long `begin_*` may wait for a conflicting job before failing (default: 30s).
    pub job_wait_timeout: Duration,
    /// Capacity of the bounded event queue (default: 1024).
    pub event_queue_capacity: usize,
    /// Timeout for a single monitor or agent request (default: 30s).
    pub rpc_timeout: Duration,
    /// Total time allowed for connecting to a freshly spawned emulator (default: 10s).
    pub connect_timeout: Duration,
    /// Interval between connection attempts (default: 100ms).
    pub connect_retry_interval: Duration,
    /// Interval between progress polls in long-running async jobs (default: 500ms).
    pub progress_poll_interval: Duration,
    /// How long a stopping emulator gets before it is killed (default: 5s).
    pub shutdown_grace: Duration,
    /// Per-subscriber buffer of the lifecycle fan-out (default: 256).
    pub lifecycle_capacity: usize,
    /// Directory holding persisted domain definitions.
    pub state_dir: PathBuf,
    /// Directory holding per-domain sockets and runtime files.
    pub run_dir: PathBuf,
    /// Directory that receives watchdog-triggered memory dumps and save images.
    pub save_dir: PathBuf,
    /// Emulator binary used by the process manager.
    pub emulator_path: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            job_wait_timeout: Duration::from_secs(30),
            event_queue_capacity: 1024,
            rpc_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            connect_retry_interval: Duration::from_millis(100),
            progress_poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
            lifecycle_capacity: 256,
            state_dir: PathBuf::from("/var/lib/corral/domains"),
            run_dir: PathBuf::from("/run/corral"),
            save_dir: PathBuf::from("/var/lib/corral/save"),
            emulator_path: PathBuf::from("/usr/bin/qemu-system-x86_64"),
        }
    }
}

impl ManagerConfig {
    /// Set the bounded job wait.
    pub fn job_wait_timeout(mut self, timeout: Duration) -> Self {
        self.job_wait_timeout = timeout;
        self
    }

    /// Set the event queue capacity.
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the per-request RPC timeout.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the emulator connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the async job progress poll interval.
    pub fn progress_poll_interval(mut self, interval: Duration) -> Self {
        self.progress_poll_interval = interval;
        self
    }

    /// Set the emulator stop grace period.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the definition state directory.
    pub fn state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = path.into();
        self
    }

    /// Set the runtime directory.
    pub fn run_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_dir = path.into();
        self
    }

    /// Set the save/dump directory.
    pub fn save_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_dir = path.into();
        self
    }

    /// Set the emulator binary.
    pub fn emulator_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.emulator_path = path.into();
        self
    }

    /// Timing knobs handed to each domain.
    pub fn tuning(&self) -> DomainTuning {
        DomainTuning {
            job_wait_timeout: self.job_wait_timeout,
            rpc_timeout: self.rpc_timeout,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.job_wait_timeout.is_zero() {
            return Err(CoreError::Config("job_wait_timeout must be > 0".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(CoreError::Config("event_queue_capacity must be > 0".into()));
        }
        if self.rpc_timeout.is_zero() {
            return Err(CoreError::Config("rpc_timeout must be > 0".into()));
        }
        if self.progress_poll_interval.is_zero() {
            return Err(CoreError::Config("progress_poll_interval must be > 0".into()));
        }
        if self.lifecycle_capacity == 0 {
            return Err(CoreError::Config("lifecycle_capacity must be > 0".into()));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(CoreError::Config("state_dir is required".into()));
        }
        if self.run_dir.as_os_str().is_empty() {
            return Err(CoreError::Config("run_dir is required".into()));
        }
        Ok(())
    }
}
