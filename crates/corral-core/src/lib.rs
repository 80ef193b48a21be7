//! # corral-core
//!
//! Per-domain job scheduling, protocol sessions and event dispatch for the
//! corral hypervisor driver.
//!
//! Every managed VM is a [`Domain`] with one object lock. Work on a domain
//! is serialized by jobs in three lanes (normal, async, agent); protocol
//! traffic to the emulator monitor and the guest agent runs in sessions
//! that give the object lock up for the duration of each request; and
//! asynchronous notifications are handled one at a time by a single event
//! worker.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       corral-core (host)                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌─────────────────┐       ┌───────────────────────────────┐  │
//! │  │  DomainManager  │──────▶│ Registry (uuid + name index)  │  │
//! │  │  - define()     │       └───────────────────────────────┘  │
//! │  │  - undefine()   │                     │                    │
//! │  │  - load_all()   │                     ▼                    │
//! │  └─────────────────┘       ┌───────────────────────────────┐  │
//! │           │                │ Domain                        │  │
//! │           ▼                │  object lock ─▶ DomainState   │  │
//! │  ┌─────────────────┐       │  jobs: normal | async | agent │  │
//! │  │ ops::start, ... │──────▶│  monitor slot / agent slot    │  │
//! │  └─────────────────┘       └───────────────────────────────┘  │
//! │           ▲                      │ sessions (lock released)  │
//! │           │                      ▼                           │
//! │  ┌─────────────────┐       ┌───────────────────────────────┐  │
//! │  │ EventQueue      │◀──────│ JsonLineTransport readers     │  │
//! │  │  one worker     │ events│  monitor / guest agent        │  │
//! │  └─────────────────┘       └───────────────────────────────┘  │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use corral_core::{ops, DomainDef, DomainManager, EmulatorProcessManager, JsonFileStore, ManagerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> corral_core::Result<()> {
//! let config = ManagerConfig::default();
//! let store = Arc::new(JsonFileStore::new(&config.state_dir));
//! let process = Arc::new(EmulatorProcessManager::new(&config));
//! let manager = DomainManager::new(config, store, process)?;
//!
//! let web = manager.define(DomainDef::new("web01")).await?;
//! ops::start(manager.services(), &web).await?;
//!
//! // Anything that changes the domain runs under a job.
//! let (guard, job) = web.begin_job(corral_core::JobKind::Query).await?;
//! let (mut guard, status) = guard.monitor_call(&job, "query-status", serde_json::json!({})).await;
//! guard.end_job(job);
//! println!("{}", status?);
//!
//! ops::destroy(manager.services(), &web).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod event;
pub mod handlers;
pub mod job;
pub mod lifecycle;
pub mod manager;
pub mod ops;
pub mod process;
pub mod queue;
pub mod session;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::ManagerConfig;
pub use controller::{AbortOutcome, AgentJobClaim, AsyncJobClaim, JobClaim};
pub use domain::{
    ChannelKind, CrashAction, DeviceDef, DeviceKind, Domain, DomainDef, DomainGuard, DomainRef,
    DomainSnapshot, DomainState, DomainStatus, StateReason,
};
pub use error::{CoreError, Result};
pub use event::{Event, EventKind, WatchdogAction};
pub use job::{AgentJobKind, AsyncJobKind, JobKind, JobOperation, JobOutcome, JobProgress, JobStats};
pub use lifecycle::{LifecycleEvent, LifecycleKind, Notifier};
pub use manager::{DomainManager, Services};
pub use process::{EmulatorProcessManager, LaunchMode, LaunchedChannels, ProcessManager};
pub use queue::{EventHandler, EventQueue, EventSubmitter};
pub use session::{AgentSession, MonitorSession};
pub use store::{DomainStore, JsonFileStore, MemoryStore};
pub use transport::{ChannelReader, Connection, RpcTransport};
