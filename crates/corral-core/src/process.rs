//! Emulator process management.

use crate::config::ManagerConfig;
use crate::domain::DomainDef;
use crate::error::{CoreError, Result};
use crate::transport::Connection;
use crate::wire::{ConnectOptions, Dialect, JsonLineTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

/// How the emulator should come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Boot from the definition, vCPUs paused until `cont`.
    Fresh,
    /// Wait for incoming state (restore or inbound migration).
    Incoming,
}

/// What a launch hands back.
#[derive(Debug)]
pub struct LaunchedChannels {
    /// Emulator process id, if known.
    pub pid: Option<u32>,
    /// Connected monitor.
    pub monitor: Connection,
}

/// Starts and stops emulator processes.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start the emulator for `def` and connect its monitor.
    async fn launch(&self, def: &DomainDef, mode: LaunchMode) -> Result<LaunchedChannels>;

    /// Connect to the guest agent socket of a running domain.
    async fn connect_agent(&self, def: &DomainDef) -> Result<Connection>;

    /// Stop the emulator. With `force` it is killed at once, otherwise it
    /// gets the configured grace period to exit on its own. Unknown domains
    /// are not an error.
    async fn terminate(&self, uuid: Uuid, force: bool) -> Result<()>;
}

/// [`ProcessManager`] that runs the configured emulator binary.
pub struct EmulatorProcessManager {
    emulator: PathBuf,
    run_dir: PathBuf,
    connect: ConnectOptions,
    grace: Duration,
    children: Mutex<HashMap<Uuid, (Child, String)>>,
}

impl std::fmt::Debug for EmulatorProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorProcessManager")
            .field("emulator", &self.emulator)
            .field("run_dir", &self.run_dir)
            .finish()
    }
}

impl EmulatorProcessManager {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            emulator: config.emulator_path.clone(),
            run_dir: config.run_dir.clone(),
            connect: ConnectOptions {
                timeout: config.connect_timeout,
                retry_interval: config.connect_retry_interval,
            },
            grace: config.shutdown_grace,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Monitor socket of `name`.
    pub fn monitor_socket(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.monitor"))
    }

    /// Agent socket of `name`.
    pub fn agent_socket(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.agent"))
    }

    fn log_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.log"))
    }

    /// Emulator arguments for `def`.
    pub fn arguments(&self, def: &DomainDef, mode: LaunchMode) -> Vec<String> {
        let mut args = vec![
            "-name".to_string(),
            format!("guest={},debug-threads=on", def.name),
            "-uuid".to_string(),
            def.uuid.to_string(),
            "-m".to_string(),
            def.memory_mib.to_string(),
            "-smp".to_string(),
            def.vcpus.to_string(),
            "-nodefaults".to_string(),
            "-nographic".to_string(),
            "-S".to_string(),
            "-qmp".to_string(),
            format!(
                "unix:{},server=on,wait=off",
                self.monitor_socket(&def.name).display()
            ),
        ];
        if def.agent {
            args.extend([
                "-chardev".to_string(),
                format!(
                    "socket,id=charagent0,path={},server=on,wait=off",
                    self.agent_socket(&def.name).display()
                ),
                "-device".to_string(),
                "virtio-serial".to_string(),
                "-device".to_string(),
                "virtserialport,chardev=charagent0,id=channel0,name=org.qemu.guest_agent.0".to_string(),
            ]);
        }
        if mode == LaunchMode::Incoming {
            args.extend(["-incoming".to_string(), "defer".to_string()]);
        }
        args.extend(def.extra_args.iter().cloned());
        args
    }

    async fn remove_sockets(&self, name: &str) {
        for path in [self.monitor_socket(name), self.agent_socket(name)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::trace!(path = %path.display(), "Removed socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket"),
            }
        }
    }

    fn open_log(path: &Path) -> Result<(Stdio, Stdio)> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let stderr = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

#[async_trait]
impl ProcessManager for EmulatorProcessManager {
    async fn launch(&self, def: &DomainDef, mode: LaunchMode) -> Result<LaunchedChannels> {
        let start = std::time::Instant::now();
        tracing::info!(domain = %def.name, ?mode, emulator = %self.emulator.display(), "Launching emulator");

        tokio::fs::create_dir_all(&self.run_dir).await.map_err(|e| {
            tracing::error!(dir = %self.run_dir.display(), error = %e, "Failed to create run directory");
            e
        })?;
        self.remove_sockets(&def.name).await;

        let (stdout, stderr) = Self::open_log(&self.log_file(&def.name))?;
        let mut child = Command::new(&self.emulator)
            .args(self.arguments(def, mode))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(domain = %def.name, error = %e, "Emulator spawn failed");
                e
            })?;
        let pid = child.id();
        tracing::debug!(domain = %def.name, ?pid, "Emulator spawned");

        let monitor = match JsonLineTransport::connect(
            &self.monitor_socket(&def.name),
            Dialect::Monitor,
            self.connect,
        )
        .await
        {
            Ok(monitor) => monitor,
            Err(e) => {
                tracing::error!(domain = %def.name, error = %e, "Monitor connection failed, killing emulator");
                let _ = child.kill().await;
                self.remove_sockets(&def.name).await;
                return Err(e);
            }
        };

        self.children
            .lock()
            .await
            .insert(def.uuid, (child, def.name.clone()));
        tracing::info!(
            domain = %def.name,
            ?pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Emulator ready"
        );
        Ok(LaunchedChannels { pid, monitor })
    }

    async fn connect_agent(&self, def: &DomainDef) -> Result<Connection> {
        if !def.agent {
            return Err(CoreError::agent_closed("no agent channel configured"));
        }
        JsonLineTransport::connect(&self.agent_socket(&def.name), Dialect::Agent, self.connect).await
    }

    async fn terminate(&self, uuid: Uuid, force: bool) -> Result<()> {
        let Some((mut child, name)) = self.children.lock().await.remove(&uuid) else {
            tracing::debug!(%uuid, "No emulator process to terminate");
            return Ok(());
        };

        if !force {
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(domain = %name, %status, "Emulator exited");
                    self.remove_sockets(&name).await;
                    return Ok(());
                }
                Ok(Err(e)) => tracing::warn!(domain = %name, error = %e, "Waiting for emulator failed"),
                Err(_) => tracing::warn!(domain = %name, grace = ?self.grace, "Emulator did not exit in time"),
            }
        }

        tracing::warn!(domain = %name, "Killing emulator");
        child.kill().await?;
        self.remove_sockets(&name).await;
        Ok(())
    }
}
