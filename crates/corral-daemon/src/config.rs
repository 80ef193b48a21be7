//! Configuration for the corral daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use corral_core::ManagerConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for `corrald`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding persisted domain definitions.
    pub state_dir: PathBuf,

    /// Directory for monitor/agent sockets and emulator logs.
    pub run_dir: PathBuf,

    /// Directory for managed-save images and memory dumps.
    pub save_dir: PathBuf,

    /// Emulator binary.
    pub emulator_path: PathBuf,

    /// Bounded wait for a conflicting job (default: 30s).
    pub job_wait_timeout: Duration,

    /// Per-request monitor/agent timeout (default: 30s).
    pub rpc_timeout: Duration,

    /// Event queue capacity (default: 1024).
    pub event_queue_capacity: usize,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("emulator binary not found: {0}")]
    MissingEmulator(PathBuf),

    #[error("state directory parent not found: {0}")]
    InvalidStateDir(PathBuf),

    #[error("run directory parent not found: {0}")]
    InvalidRunDir(PathBuf),

    #[error(transparent)]
    Core(#[from] corral_core::CoreError),
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let core = ManagerConfig::default();
        Self {
            state_dir: core.state_dir,
            run_dir: core.run_dir,
            save_dir: core.save_dir,
            emulator_path: core.emulator_path,
            job_wait_timeout: core.job_wait_timeout,
            rpc_timeout: core.rpc_timeout,
            event_queue_capacity: core.event_queue_capacity,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8460),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CORRAL_STATE_DIR` | `/var/lib/corral/domains` |
    /// | `CORRAL_RUN_DIR` | `/run/corral` |
    /// | `CORRAL_SAVE_DIR` | `/var/lib/corral/save` |
    /// | `CORRAL_EMULATOR` | `/usr/bin/qemu-system-x86_64` |
    /// | `CORRAL_JOB_WAIT_SECS` | `30` |
    /// | `CORRAL_RPC_TIMEOUT_SECS` | `30` |
    /// | `CORRAL_EVENT_QUEUE` | `1024` |
    /// | `CORRAL_HTTP_HOST` | `127.0.0.1` |
    /// | `CORRAL_HTTP_PORT` | `8460` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr = std::env::var("CORRAL_HTTP_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = std::env::var("CORRAL_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        Self {
            state_dir: std::env::var("CORRAL_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.state_dir),
            run_dir: std::env::var("CORRAL_RUN_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.run_dir),
            save_dir: std::env::var("CORRAL_SAVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.save_dir),
            emulator_path: std::env::var("CORRAL_EMULATOR")
                .map(PathBuf::from)
                .unwrap_or(default.emulator_path),
            job_wait_timeout: env_secs("CORRAL_JOB_WAIT_SECS").unwrap_or(default.job_wait_timeout),
            rpc_timeout: env_secs("CORRAL_RPC_TIMEOUT_SECS").unwrap_or(default.rpc_timeout),
            event_queue_capacity: std::env::var("CORRAL_EVENT_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.event_queue_capacity),
            http_addr: SocketAddr::new(http_host, http_port),
        }
    }

    /// Core manager configuration derived from this one.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .state_dir(&self.state_dir)
            .run_dir(&self.run_dir)
            .save_dir(&self.save_dir)
            .emulator_path(&self.emulator_path)
            .job_wait_timeout(self.job_wait_timeout)
            .rpc_timeout(self.rpc_timeout)
            .event_queue_capacity(self.event_queue_capacity)
    }

    /// Validate paths and limits.
    ///
    /// Call this at startup to get clear error messages about missing files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.emulator_path.exists() {
            return Err(ConfigError::MissingEmulator(self.emulator_path.clone()));
        }

        // Both directories are created on demand, so just check parents exist
        if let Some(parent) = self.state_dir.parent() {
            if !parent.exists() {
                return Err(ConfigError::InvalidStateDir(self.state_dir.clone()));
            }
        }
        if let Some(parent) = self.run_dir.parent() {
            if !parent.exists() {
                return Err(ConfigError::InvalidRunDir(self.run_dir.clone()));
            }
        }

        self.manager_config().validate()?;
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration problem");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/corral/domains"));
        assert_eq!(config.run_dir, PathBuf::from("/run/corral"));
        assert_eq!(config.job_wait_timeout, Duration::from_secs(30));
        assert_eq!(config.http_addr.port(), 8460);
        assert!(config.http_addr.ip().is_loopback());
    }

    #[test]
    fn test_from_env_uses_defaults() {
        std::env::remove_var("CORRAL_STATE_DIR");
        std::env::remove_var("CORRAL_RUN_DIR");
        std::env::remove_var("CORRAL_EMULATOR");
        std::env::remove_var("CORRAL_JOB_WAIT_SECS");
        std::env::remove_var("CORRAL_HTTP_HOST");
        std::env::remove_var("CORRAL_HTTP_PORT");

        let config = DaemonConfig::from_env();
        let default = DaemonConfig::default();

        assert_eq!(config.state_dir, default.state_dir);
        assert_eq!(config.emulator_path, default.emulator_path);
        assert_eq!(config.job_wait_timeout, default.job_wait_timeout);
        assert_eq!(config.http_addr, default.http_addr);
    }

    #[test]
    fn test_manager_config_carries_settings() {
        let config = DaemonConfig {
            job_wait_timeout: Duration::from_secs(5),
            event_queue_capacity: 16,
            ..DaemonConfig::default()
        };
        let core = config.manager_config();
        assert_eq!(core.job_wait_timeout, Duration::from_secs(5));
        assert_eq!(core.event_queue_capacity, 16);
        assert_eq!(core.state_dir, config.state_dir);
    }

    #[test]
    fn test_validate_missing_emulator() {
        let config = DaemonConfig {
            emulator_path: PathBuf::from("/nonexistent/qemu"),
            ..DaemonConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEmulator(_))
        ));
    }
}
