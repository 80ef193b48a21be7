//! Newline-delimited JSON transport over a Unix socket.
//!
//! Two dialects share the framing:
//!
//! - **Monitor**: `{"execute", "arguments", "id"}` requests, `return` /
//!   `error` replies and `event` notifications, preceded by a greeting that
//!   is answered with `qmp_capabilities`.
//! - **Agent**: JSON-RPC 2.0 requests and responses.
//!
//! A connection is split in two: [`JsonLineTransport`] writes requests and
//! waits for replies, [`WireReader`] owns the read half, routes replies to
//! waiting callers by id and turns monitor events into [`EventKind`]s.

use crate::domain::{ChannelBinding, ChannelKind};
use crate::error::{CoreError, Result};
use crate::event::{EventKind, WatchdogAction};
use crate::transport::{ChannelReader, Connection, RpcTransport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Monitor,
    Agent,
}

impl Dialect {
    fn channel(self) -> ChannelKind {
        match self {
            Self::Monitor => ChannelKind::Monitor,
            Self::Agent => ChannelKind::Agent,
        }
    }

    fn closed(self, reason: impl Into<String>) -> CoreError {
        CoreError::ChannelClosed {
            channel: self.channel().as_str(),
            reason: reason.into(),
        }
    }

    /// Encode one request.
    pub fn request(self, id: u64, command: &str, args: &Value) -> Value {
        match self {
            Self::Monitor => {
                let mut request = json!({ "execute": command, "id": id });
                if !args.is_null() {
                    request["arguments"] = args.clone();
                }
                request
            }
            Self::Agent => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": command,
                "params": if args.is_null() { json!({}) } else { args.clone() },
            }),
        }
    }

    /// Decode one line.
    pub fn parse(self, line: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| CoreError::Protocol(format!("malformed line: {e}")))?;
        match self {
            Self::Monitor => parse_monitor(value),
            Self::Agent => parse_agent(value),
        }
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to request `id`.
    Reply { id: u64, reply: WireReply },
    /// Asynchronous notification the control plane reacts to.
    Event(EventKind),
    /// Greeting, notification without a handler, or untagged reply.
    Ignored,
}

/// Body of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum WireReply {
    Ok(Value),
    Err { class: String, message: String },
}

fn reply_id(value: &Value) -> Option<u64> {
    value.get("id").and_then(Value::as_u64)
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn u64_field(data: &Value, key: &str) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn parse_monitor(value: Value) -> Result<Frame> {
    if let Some(result) = value.get("return") {
        return Ok(match reply_id(&value) {
            Some(id) => Frame::Reply {
                id,
                reply: WireReply::Ok(result.clone()),
            },
            None => Frame::Ignored,
        });
    }
    if let Some(error) = value.get("error") {
        let reply = WireReply::Err {
            class: str_field(error, "class").unwrap_or_else(|| "GenericError".into()),
            message: str_field(error, "desc").unwrap_or_default(),
        };
        return Ok(match reply_id(&value) {
            Some(id) => Frame::Reply { id, reply },
            None => Frame::Ignored,
        });
    }
    if let Some(name) = value.get("event").and_then(Value::as_str) {
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        return Ok(monitor_event(name, &data).map_or(Frame::Ignored, Frame::Event));
    }
    if value.get("QMP").is_some() {
        return Ok(Frame::Ignored);
    }
    Err(CoreError::Protocol(format!("unrecognized monitor message: {value}")))
}

fn monitor_event(name: &str, data: &Value) -> Option<EventKind> {
    let kind = match name {
        "WATCHDOG" => {
            let action = data.get("action").cloned()?;
            EventKind::Watchdog {
                action: serde_json::from_value::<WatchdogAction>(action).ok()?,
            }
        }
        "GUEST_PANICKED" => EventKind::GuestPanic {
            info: data.get("info").cloned(),
        },
        "GUEST_CRASHLOADED" => EventKind::GuestCrashLoaded,
        "DEVICE_DELETED" => EventKind::DeviceDeleted {
            alias: str_field(data, "device")?,
        },
        "NIC_RX_FILTER_CHANGED" => EventKind::NicRxFilterChanged {
            alias: str_field(data, "name")?,
        },
        "VSERPORT_CHANGE" => EventKind::SerialChanged {
            alias: str_field(data, "id")?,
            connected: data.get("open").and_then(Value::as_bool)?,
        },
        "BLOCK_JOB_COMPLETED" | "BLOCK_JOB_READY" | "BLOCK_JOB_ERROR" | "BLOCK_JOB_CANCELLED" => {
            let status = match name {
                "BLOCK_JOB_READY" => "ready",
                "BLOCK_JOB_CANCELLED" => "cancelled",
                "BLOCK_JOB_ERROR" => "failed",
                _ if data.get("error").is_some() => "failed",
                _ => "concluded",
            };
            EventKind::BlockJob {
                disk: str_field(data, "device")?,
                job_id: str_field(data, "id").or_else(|| str_field(data, "device"))?,
                job_type: str_field(data, "type").unwrap_or_default(),
                status: status.to_string(),
                offset: u64_field(data, "offset"),
                len: u64_field(data, "len"),
                error: str_field(data, "error"),
            }
        }
        "JOB_STATUS_CHANGE" => EventKind::JobStatusChange {
            id: str_field(data, "id")?,
            status: str_field(data, "status")?,
        },
        "PR_MANAGER_STATUS_CHANGED" => {
            if data.get("connected").and_then(Value::as_bool) != Some(false) {
                return None;
            }
            EventKind::PrDisconnect
        }
        "RDMA_GID_STATUS_CHANGED" => EventKind::RdmaGidStatusChanged {
            netdev: str_field(data, "netdev")?,
            gid_status: data.get("gid-status").and_then(Value::as_bool).unwrap_or(false),
            subnet_prefix: u64_field(data, "subnet-prefix"),
            interface_id: u64_field(data, "interface-id"),
        },
        "MEMORY_DEVICE_SIZE_CHANGE" => EventKind::MemoryDeviceSizeChange {
            alias: str_field(data, "id")?,
            size: data.get("size").and_then(Value::as_u64)?,
        },
        _ => return None,
    };
    Some(kind)
}

fn parse_agent(value: Value) -> Result<Frame> {
    let Some(id) = reply_id(&value) else {
        // Notifications and untagged replies carry nothing we wait for.
        return Ok(Frame::Ignored);
    };
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        return Ok(Frame::Reply {
            id,
            reply: WireReply::Err {
                class: code.to_string(),
                message: str_field(error, "message").unwrap_or_else(|| "unknown error".into()),
            },
        });
    }
    match value.get("result") {
        Some(result) => Ok(Frame::Reply {
            id,
            reply: WireReply::Ok(result.clone()),
        }),
        None => Err(CoreError::Protocol("missing result in response".into())),
    }
}

// ============================================================================
// Transport
// ============================================================================

struct Pending {
    command: String,
    tx: oneshot::Sender<Result<Value>>,
}

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, Pending>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, Pending>> {
    // Entries are plain data; a poisoned map is still consistent.
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the pending entry of a request whose caller stopped waiting,
/// whether it got a reply, failed, or was cancelled by a timeout.
struct PendingEntry<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

/// Request side of a JSON-line connection.
pub struct JsonLineTransport {
    dialect: Dialect,
    path: PathBuf,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for JsonLineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLineTransport")
            .field("dialect", &self.dialect)
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Connection retry knobs.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Total time allowed, including retries.
    pub timeout: Duration,
    /// Pause between attempts.
    pub retry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl JsonLineTransport {
    /// Connect to `path`, retrying until the peer is listening or
    /// `options.timeout` elapses, and run the dialect handshake.
    pub async fn connect(path: &Path, dialect: Dialect, options: ConnectOptions) -> Result<Connection> {
        let start = tokio::time::Instant::now();
        tracing::debug!(path = %path.display(), ?dialect, "Connecting");

        // The emulator may not have created the socket yet.
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::try_connect(path, dialect).await {
                Ok(connection) => {
                    tracing::info!(
                        path = %path.display(),
                        ?dialect,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected"
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    if start.elapsed() >= options.timeout {
                        tracing::warn!(
                            path = %path.display(),
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            error = %e,
                            "Connection timeout"
                        );
                        return Err(dialect.closed(format!(
                            "could not connect to {} within {:?}: {e}",
                            path.display(),
                            options.timeout
                        )));
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                    tokio::time::sleep(options.retry_interval).await;
                }
            }
        }
    }

    async fn try_connect(path: &Path, dialect: Dialect) -> Result<Connection> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        if dialect == Dialect::Monitor {
            let mut greeting = String::new();
            reader.read_line(&mut greeting).await?;
            let greeting: Value = serde_json::from_str(greeting.trim())
                .map_err(|e| CoreError::Protocol(format!("bad greeting: {e}")))?;
            if greeting.get("QMP").is_none() {
                return Err(CoreError::Protocol(format!("unexpected greeting: {greeting}")));
            }
            tracing::trace!(%greeting, "Monitor greeting");

            let negotiate = dialect.request(0, "qmp_capabilities", &Value::Null);
            writer.write_all(negotiate.to_string().as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;

            let mut reply = String::new();
            reader.read_line(&mut reply).await?;
            match dialect.parse(reply.trim())? {
                Frame::Reply {
                    reply: WireReply::Ok(_),
                    ..
                } => {}
                other => {
                    return Err(CoreError::Protocol(format!(
                        "capabilities negotiation failed: {other:?}"
                    )))
                }
            }
        }

        let (transport, reader) = Self::assemble(dialect, path, reader, writer);
        Ok(Connection {
            transport,
            reader: Box::new(reader),
        })
    }

    /// Pair the request side with its reader over an already negotiated stream.
    fn assemble(
        dialect: Dialect,
        path: &Path,
        reader: BufReader<OwnedReadHalf>,
        writer: BufWriter<OwnedWriteHalf>,
    ) -> (Arc<Self>, WireReader) {
        let pending: PendingMap = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(Self {
            dialect,
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            pending: Arc::clone(&pending),
            next_id: AtomicU64::new(1),
            closed: Arc::clone(&closed),
        });
        let reader = WireReader {
            dialect,
            reader,
            pending,
            closed,
        };
        (transport, reader)
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&self, body: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(body.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

#[async_trait]
impl RpcTransport for JsonLineTransport {
    async fn call(&self, command: &str, args: Value) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.dialect.closed("connection closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(
            id,
            Pending {
                command: command.to_string(),
                tx,
            },
        );
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };
        // The reader may have failed every pending request just before the insert.
        if self.closed.load(Ordering::Acquire) {
            return Err(self.dialect.closed("connection closed"));
        }

        let body = self.dialect.request(id, command, &args).to_string();
        tracing::debug!(command, id, "Sending RPC request");
        tracing::trace!(request = %body, "RPC request body");

        if let Err(e) = self.write_line(&body).await {
            self.closed.store(true, Ordering::Release);
            tracing::warn!(command, id, error = %e, "RPC write error");
            return Err(self.dialect.closed(format!("write failed: {e}")));
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(self.dialect.closed("connection closed before reply")),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read side of a JSON-line connection.
pub struct WireReader {
    dialect: Dialect,
    reader: BufReader<OwnedReadHalf>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
}

impl ChannelReader for WireReader {
    fn spawn(self: Box<Self>, binding: ChannelBinding) -> JoinHandle<()> {
        tokio::spawn(self.run(binding))
    }
}

impl WireReader {
    async fn run(mut self, binding: ChannelBinding) {
        let channel = self.dialect.channel().as_str();
        tracing::debug!(channel, generation = binding.generation(), "Reader started");
        let mut line = String::new();

        // Events go through a forwarder so a full event queue never stops
        // replies from being routed. Order per connection is kept.
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<EventKind>();
        let forwarder = {
            let binding = binding.clone();
            tokio::spawn(async move {
                while let Some(kind) = events_rx.recv().await {
                    let name = kind.name();
                    if let Err(e) = binding.event(kind).await {
                        tracing::warn!(channel, event = name, error = %e, "Event not queued");
                    }
                }
            })
        };

        let reason = loop {
            line.clear();
            match self.reader.read_line(&mut line).await {
                Ok(0) => break "end of file".to_string(),
                Ok(_) => {}
                Err(e) => break format!("read failed: {e}"),
            }
            let body = line.trim();
            if body.is_empty() {
                continue;
            }
            tracing::trace!(channel, response = %body, "Wire line");

            match self.dialect.parse(body) {
                Ok(Frame::Reply { id, reply }) => self.route(id, reply),
                Ok(Frame::Event(kind)) => {
                    if events_tx.send(kind).is_err() {
                        tracing::warn!(channel, "Event forwarder gone, event dropped");
                    }
                }
                Ok(Frame::Ignored) => {}
                Err(e) => tracing::warn!(channel, error = %e, "Skipping malformed line"),
            }
        };

        self.closed.store(true, Ordering::Release);
        let stranded: Vec<Pending> = lock_pending(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in stranded {
            let _ = pending.tx.send(Err(self.dialect.closed(reason.clone())));
        }
        tracing::debug!(channel, %reason, "Reader stopped");

        // EOF is reported after the events read before it.
        drop(events_tx);
        if let Err(e) = forwarder.await {
            tracing::error!(channel, error = ?e, "Event forwarder panicked");
        }
        binding.closed(&reason).await;
    }

    fn route(&self, id: u64, reply: WireReply) {
        let Some(pending) = lock_pending(&self.pending).remove(&id) else {
            tracing::debug!(id, "Reply for unknown request dropped");
            return;
        };
        let result = match reply {
            WireReply::Ok(value) => Ok(value),
            WireReply::Err { class, message } => {
                tracing::debug!(command = %pending.command, id, %class, %message, "RPC error response");
                Err(CoreError::Command {
                    command: pending.command,
                    class,
                    message,
                })
            }
        };
        let _ = pending.tx.send(result);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Domain, DomainDef, DomainRef, DomainTuning};
    use crate::event::Event;
    use crate::queue::{DomainResolver, EventHandler, EventQueue};
    use tokio::net::UnixListener;

    #[test]
    fn test_monitor_request_encoding() {
        let req = Dialect::Monitor.request(3, "stop", &Value::Null);
        assert_eq!(req, json!({"execute": "stop", "id": 3}));
        let req = Dialect::Monitor.request(4, "migrate", &json!({"uri": "exec:cat"}));
        assert_eq!(req["arguments"]["uri"], "exec:cat");
    }

    #[test]
    fn test_agent_request_encoding() {
        let req = Dialect::Agent.request(9, "guest-ping", &Value::Null);
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["method"], "guest-ping");
        assert_eq!(req["params"], json!({}));
    }

    #[test]
    fn test_parse_monitor_replies() {
        let frame = Dialect::Monitor
            .parse(r#"{"return": {"status": "running"}, "id": 7}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::Reply {
                id: 7,
                reply: WireReply::Ok(json!({"status": "running"}))
            }
        );

        let frame = Dialect::Monitor
            .parse(r#"{"error": {"class": "DeviceNotFound", "desc": "no net0"}, "id": 8}"#)
            .unwrap();
        assert!(matches!(
            frame,
            Frame::Reply { id: 8, reply: WireReply::Err { ref class, .. } } if class == "DeviceNotFound"
        ));

        assert_eq!(
            Dialect::Monitor.parse(r#"{"QMP": {"version": {}}}"#).unwrap(),
            Frame::Ignored
        );
        assert!(Dialect::Monitor.parse("not json").is_err());
    }

    #[test]
    fn test_parse_monitor_events() {
        let frame = Dialect::Monitor
            .parse(r#"{"event": "WATCHDOG", "data": {"action": "pause"}}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::Event(EventKind::Watchdog {
                action: WatchdogAction::Pause
            })
        );

        let frame = Dialect::Monitor
            .parse(r#"{"event": "VSERPORT_CHANGE", "data": {"id": "channel0", "open": true}}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::Event(EventKind::SerialChanged {
                alias: "channel0".into(),
                connected: true
            })
        );

        let frame = Dialect::Monitor
            .parse(r#"{"event": "BLOCK_JOB_COMPLETED", "data": {"device": "drive0", "type": "mirror", "offset": 10, "len": 10}}"#)
            .unwrap();
        assert!(matches!(
            frame,
            Frame::Event(EventKind::BlockJob { ref status, .. }) if status == "concluded"
        ));

        // Connected helper is not a disconnect.
        let frame = Dialect::Monitor
            .parse(r#"{"event": "PR_MANAGER_STATUS_CHANGED", "data": {"id": "pr0", "connected": true}}"#)
            .unwrap();
        assert_eq!(frame, Frame::Ignored);

        let frame = Dialect::Monitor
            .parse(r#"{"event": "RESUME", "data": {}}"#)
            .unwrap();
        assert_eq!(frame, Frame::Ignored);
    }

    #[test]
    fn test_parse_agent() {
        let frame = Dialect::Agent
            .parse(r#"{"jsonrpc": "2.0", "id": 1, "result": {}}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::Reply {
                id: 1,
                reply: WireReply::Ok(json!({}))
            }
        );
        let frame = Dialect::Agent
            .parse(r#"{"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "no such method"}}"#)
            .unwrap();
        assert!(matches!(
            frame,
            Frame::Reply { id: 2, reply: WireReply::Err { ref class, .. } } if class == "-32601"
        ));
        assert!(Dialect::Agent.parse(r#"{"jsonrpc": "2.0", "id": 3}"#).is_err());
    }

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("corral-wire-{tag}-{}.sock", uuid::Uuid::new_v4()))
    }

    /// Minimal monitor peer: greets, negotiates, answers one request, hangs up.
    async fn serve_once(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        write_half.write_all(b"{\"return\": {}, \"id\": 0}\n").await.unwrap();

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let request: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(request["execute"], "query-status");
        let reply = json!({"return": {"status": "running"}, "id": request["id"]});
        write_half
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();

        line.clear();
        // Second request is never answered.
        reader.read_line(&mut line).await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_round_trip_and_eof() {
        let path = socket_path("mon");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(listener));

        let connection = JsonLineTransport::connect(&path, Dialect::Monitor, ConnectOptions::default())
            .await
            .unwrap();
        let transport = Arc::clone(&connection.transport);

        let domain = Domain::new(DomainDef::new("web01"), true, DomainTuning::default(), None);
        let reader = {
            let mut vm = domain.lock().await;
            connection.attach(&mut vm, ChannelKind::Monitor)
        };

        let status = transport.call("query-status", Value::Null).await.unwrap();
        assert_eq!(status["status"], "running");

        let err = transport.call("stop", Value::Null).await.unwrap_err();
        assert!(err.is_channel_closed(), "{err}");
        assert!(transport.is_closed());

        server.await.unwrap();
        reader.await.unwrap();
        assert!(!domain.lock().await.monitor_attached());
        let _ = std::fs::remove_file(&path);
    }

    /// Transport and reader over one end of a socket pair; the other end is the peer.
    fn paired(dialect: Dialect) -> (Arc<JsonLineTransport>, WireReader, UnixStream) {
        let (client, peer) = UnixStream::pair().unwrap();
        let (read_half, write_half) = client.into_split();
        let (transport, reader) = JsonLineTransport::assemble(
            dialect,
            Path::new("socketpair"),
            BufReader::new(read_half),
            BufWriter::new(write_half),
        );
        (transport, reader, peer)
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_pending_entry() {
        let (transport, _reader, _peer) = paired(Dialect::Agent);

        // The peer never answers.
        let call = tokio::time::timeout(
            Duration::from_millis(50),
            transport.call("guest-ping", Value::Null),
        )
        .await;
        assert!(call.is_err());
        assert_eq!(transport.pending_requests(), 0);
    }

    /// Worker stays on its first event forever.
    struct Stuck;

    #[async_trait]
    impl DomainResolver for Stuck {
        async fn resolve(&self, _domain: &DomainRef) -> Option<Arc<Domain>> {
            std::future::pending().await
        }
    }

    struct Ignore;

    #[async_trait]
    impl EventHandler for Ignore {
        async fn handle(&self, _domain: Arc<Domain>, _event: Event) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_replies_routed_while_event_queue_full() {
        let queue = EventQueue::start(1, Arc::new(Stuck), Arc::new(Ignore));
        let domain = Domain::new(
            DomainDef::new("web01"),
            true,
            DomainTuning::default(),
            Some(queue.submitter()),
        );
        let (transport, reader, peer) = paired(Dialect::Monitor);
        let _reader = {
            let mut vm = domain.lock().await;
            let binding = vm.attach_monitor(transport.clone());
            Box::new(reader).spawn(binding)
        };

        let peer = tokio::spawn(async move {
            let (read_half, mut write_half) = peer.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Value = serde_json::from_str(line.trim()).unwrap();
            // More events than the queue holds, then the reply.
            for _ in 0..4 {
                write_half
                    .write_all(b"{\"event\": \"GUEST_CRASHLOADED\"}\n")
                    .await
                    .unwrap();
            }
            let reply = json!({"return": {"status": "running"}, "id": request["id"]});
            write_half
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
            line.clear();
            let _ = reader.read_line(&mut line).await;
        });

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            transport.call("query-status", Value::Null),
        )
        .await
        .expect("reply stuck behind the event queue")
        .unwrap();
        assert_eq!(status["status"], "running");
        assert_eq!(transport.pending_requests(), 0);
        peer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up() {
        let path = socket_path("missing");
        let options = ConnectOptions {
            timeout: Duration::from_millis(300),
            retry_interval: Duration::from_millis(100),
        };
        let err = JsonLineTransport::connect(&path, Dialect::Agent, options)
            .await
            .unwrap_err();
        assert!(err.is_channel_closed());
    }
}
