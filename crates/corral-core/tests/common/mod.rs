//! In-memory stand-ins for the emulator: a scripted transport, a reader
//! driven by the test, and a process manager that hands those out.

#![allow(dead_code)]

use async_trait::async_trait;
use corral_core::domain::ChannelBinding;
use corral_core::process::{LaunchMode, LaunchedChannels, ProcessManager};
use corral_core::transport::{ChannelReader, Connection, RpcTransport};
use corral_core::{CoreError, DomainDef, DomainManager, EventKind, ManagerConfig, MemoryStore, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

type Responder = dyn Fn(&str, &Value) -> Result<Value> + Send + Sync;

/// Default replies for the commands the operations issue.
pub fn default_reply(command: &str, _args: &Value) -> Result<Value> {
    Ok(match command {
        "query-status" => json!({ "status": "running", "running": true }),
        "query-migrate" => json!({
            "status": "completed",
            "ram": { "total": 1024, "transferred": 1024, "remaining": 0 }
        }),
        "query-dump" => json!({ "status": "completed", "total": 4096, "completed": 4096 }),
        "query-rx-filter" => json!([{ "name": "net0", "main-mac": "52:54:00:12:34:56" }]),
        "guest-fsfreeze-freeze" | "guest-fsfreeze-thaw" => json!(2),
        _ => json!({}),
    })
}

/// Transport answering from a closure, with optional latency and a
/// command that kills the channel.
pub struct ScriptedTransport {
    responder: Box<Responder>,
    latency: Duration,
    die_on: Option<String>,
    closed: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            responder: Box::new(default_reply),
            latency: Duration::ZERO,
            die_on: None,
            closed: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn dying_on(mut self, command: &str) -> Self {
        self.die_on = Some(command.to_string());
        self
    }

    pub fn responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    /// Commands received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, command: &str) -> bool {
        self.calls().iter().any(|c| c == command)
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn call(&self, command: &str, args: Value) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::monitor_closed("end of file"));
        }
        self.calls.lock().unwrap().push(command.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.die_on.as_deref() == Some(command) {
            self.closed.store(true, Ordering::Release);
            return Err(CoreError::monitor_closed("end of file"));
        }
        (self.responder)(command, &args)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What a test can push through a [`FeedReader`].
#[derive(Debug)]
pub enum Feed {
    Event(EventKind),
    Eof,
}

/// Reader that forwards whatever the test feeds it.
pub struct FeedReader {
    rx: mpsc::UnboundedReceiver<Feed>,
}

impl FeedReader {
    pub fn new() -> (Self, mpsc::UnboundedSender<Feed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, tx)
    }
}

impl ChannelReader for FeedReader {
    fn spawn(self: Box<Self>, binding: ChannelBinding) -> tokio::task::JoinHandle<()> {
        let mut rx = self.rx;
        tokio::spawn(async move {
            while let Some(feed) = rx.recv().await {
                match feed {
                    Feed::Event(kind) => {
                        let _ = binding.event(kind).await;
                    }
                    Feed::Eof => {
                        binding.closed("end of file").await;
                        return;
                    }
                }
            }
        })
    }
}

/// Wrap `transport` into a connection plus the feed for its reader.
pub fn connection(transport: Arc<ScriptedTransport>) -> (Connection, mpsc::UnboundedSender<Feed>) {
    let (reader, feed) = FeedReader::new();
    (
        Connection {
            transport,
            reader: Box::new(reader),
        },
        feed,
    )
}

/// Handles to the channels of one launched domain.
#[derive(Clone)]
pub struct Launched {
    pub monitor: Arc<ScriptedTransport>,
    pub monitor_feed: mpsc::UnboundedSender<Feed>,
}

type TransportFactory = dyn Fn() -> ScriptedTransport + Send + Sync;

/// Process manager that launches nothing and hands out scripted channels.
pub struct MockProcess {
    factory: Box<TransportFactory>,
    launched: Mutex<HashMap<Uuid, Launched>>,
    agents: Mutex<HashMap<Uuid, Arc<ScriptedTransport>>>,
    pub launches: AtomicUsize,
    pub terminations: Mutex<Vec<(Uuid, bool)>>,
    pub fail_launch: AtomicBool,
}

impl MockProcess {
    pub fn new() -> Self {
        Self::with_transport(ScriptedTransport::new)
    }

    pub fn with_transport<F>(factory: F) -> Self
    where
        F: Fn() -> ScriptedTransport + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            launched: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            launches: AtomicUsize::new(0),
            terminations: Mutex::new(Vec::new()),
            fail_launch: AtomicBool::new(false),
        }
    }

    pub fn launched(&self, uuid: Uuid) -> Launched {
        self.launched.lock().unwrap()[&uuid].clone()
    }

    pub fn agent(&self, uuid: Uuid) -> Option<Arc<ScriptedTransport>> {
        self.agents.lock().unwrap().get(&uuid).cloned()
    }

    pub fn terminations(&self) -> Vec<(Uuid, bool)> {
        self.terminations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessManager for MockProcess {
    async fn launch(&self, def: &DomainDef, _mode: LaunchMode) -> Result<LaunchedChannels> {
        if self.fail_launch.load(Ordering::Acquire) {
            return Err(CoreError::monitor_closed("connection refused"));
        }
        self.launches.fetch_add(1, Ordering::AcqRel);
        let monitor = Arc::new((self.factory)());
        let (connection, feed) = connection(Arc::clone(&monitor));
        self.launched.lock().unwrap().insert(
            def.uuid,
            Launched {
                monitor,
                monitor_feed: feed,
            },
        );
        Ok(LaunchedChannels {
            pid: Some(4242),
            monitor: connection,
        })
    }

    async fn connect_agent(&self, def: &DomainDef) -> Result<Connection> {
        if !def.agent {
            return Err(CoreError::agent_closed("no agent channel configured"));
        }
        let agent = Arc::new(ScriptedTransport::new());
        self.agents.lock().unwrap().insert(def.uuid, Arc::clone(&agent));
        let (connection, _feed) = connection(agent);
        Ok(connection)
    }

    async fn terminate(&self, uuid: Uuid, force: bool) -> Result<()> {
        self.terminations.lock().unwrap().push((uuid, force));
        Ok(())
    }
}

/// Manager with an in-memory store and `process`.
pub fn manager_with(config: ManagerConfig, process: Arc<MockProcess>) -> DomainManager {
    let scratch = std::env::temp_dir().join(format!("corral-it-{}", Uuid::new_v4()));
    let config = config.save_dir(scratch.join("save")).run_dir(scratch.join("run"));
    DomainManager::new(config, Arc::new(MemoryStore::new()), process).unwrap()
}

/// Wait (bounded) until `check` holds on the domain's snapshot.
pub async fn wait_for<F>(domain: &corral_core::Domain, mut check: F)
where
    F: FnMut(&corral_core::DomainSnapshot) -> bool,
{
    let mut rx = domain.watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if check(&rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .expect("condition not reached in time");
}
