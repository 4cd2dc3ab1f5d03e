//! One managed connection to a tool-server subprocess.
//!
//! A [`Session`] spawns its server, performs the `initialize` handshake, and
//! then serves tool/resource calls until it is disconnected or the process
//! dies. Four background tasks run per live process:
//!
//! - **writer**: sole owner of stdin, drains the outbound line queue
//! - **reader**: drains stdout, decodes lines, resolves pending requests
//! - **stderr**: forwards diagnostic output to `tracing`
//! - **supervisor**: sole owner of the `Child`; reacts to process exit,
//!   stream failures, and shutdown requests
//!
//! State transitions are published on a `watch` channel:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake ok──▶ Ready
//!                               │                          │
//!                               └──handshake error──▶ Failed ◀──exit / stream error
//! any state ──disconnect──▶ Disconnected
//! ```

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::codec::{self, LineDecoder};
use super::config::SessionConfig;
use super::correlator::Correlator;
use super::errors::McpError;
use super::types::{
    error_codes, InitializeParams, InitializeResult, McpResource, McpTool, ResourceContents,
    ResourceReadResult, ResourcesListResult, ToolCallResult, ToolsListResult, WireMessage,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of each read from the server's stdout.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Outbound lines queued for the writer task.
const OUTBOUND_QUEUE: usize = 64;

/// How long the supervisor lets the reader drain stdout after the process exits,
/// so responses written just before exit still reach their callers.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

// ─── State ───────────────────────────────────────────────────────────────────

/// Connectivity state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Events delivered to the supervisor task.
#[derive(Debug)]
enum SupervisorEvent {
    /// stdin or stdout stopped working.
    StreamClosed { stream: &'static str, reason: String },
    /// Kill the process and stop.
    Shutdown,
}

/// State shared between the session handle and its background tasks.
struct Shared {
    name: String,
    correlator: Arc<Correlator>,
    state: watch::Sender<SessionState>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `to` only if the current state is one of `from`.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// The process or one of its streams is gone: mark the session failed and
    /// release every waiting caller.
    fn fail(&self, reason: &str) {
        if self.transition(&[SessionState::Connecting, SessionState::Ready], SessionState::Failed) {
            tracing::warn!(server = %self.name, reason, "session failed");
        }
        self.correlator.cancel_all(McpError::ServerCrashed {
            name: self.name.clone(),
            reason: reason.to_string(),
        });
    }
}

/// Handles for the background tasks of one running process.
struct ProcessLink {
    events: mpsc::Sender<SupervisorEvent>,
    supervisor: JoinHandle<()>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl ProcessLink {
    /// Kill the process and wait for every task to stop.
    async fn shutdown(&mut self) {
        // Fails only if the supervisor already exited with the process.
        let _ = self.events.send(SupervisorEvent::Shutdown).await;
        if let Err(e) = (&mut self.supervisor).await {
            if e.is_panic() {
                tracing::error!(error = %e, "session supervisor panicked");
            }
        }
        for task in [&mut self.reader, &mut self.writer, &mut self.stderr] {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        // Aborting the supervisor drops the `Child`, which is `kill_on_drop`.
        self.supervisor.abort();
        self.reader.abort();
        self.writer.abort();
        self.stderr.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// A connection to one tool-server subprocess.
///
/// All methods take `&self`; wrap the session in an `Arc` to issue calls from
/// several tasks at once.
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
    /// Serializes `connect` calls.
    connect_lock: tokio::sync::Mutex<()>,
    link: tokio::sync::Mutex<Option<ProcessLink>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    server_info: Mutex<Option<InitializeResult>>,
    pid: Mutex<Option<u32>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            correlator: Arc::new(Correlator::new(&config.name)),
            state,
        });

        Self {
            config,
            shared,
            connect_lock: tokio::sync::Mutex::new(()),
            link: tokio::sync::Mutex::new(None),
            outbound: Mutex::new(None),
            server_info: Mutex::new(None),
            pid: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// What the server reported during the handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.server_info).clone()
    }

    /// OS process id of the running server, if any.
    pub fn process_id(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server and perform the handshake.
    ///
    /// A no-op when already `Ready`. A `Failed` session's dead process is
    /// cleaned up first, so this doubles as "reconnect".
    pub async fn connect(&self) -> Result<(), McpError> {
        let _connecting = self.connect_lock.lock().await;
        if self.state() == SessionState::Ready {
            return Ok(());
        }

        {
            let mut link = self.link.lock().await;
            if let Some(mut stale) = link.take() {
                tracing::debug!(server = %self.name(), "clearing previous process before reconnect");
                self.teardown(&mut stale).await;
            }

            self.shared.state.send_replace(SessionState::Connecting);
            match self.spawn_process() {
                Ok(spawned) => *link = Some(spawned),
                Err(e) => {
                    self.shared.state.send_replace(SessionState::Disconnected);
                    tracing::error!(server = %self.name(), error = %e, "failed to spawn server");
                    return Err(e);
                }
            }
        }

        let handshake = self.handshake().await;

        let mut link = self.link.lock().await;
        let error = match handshake {
            Ok(info) if self.shared.transition(&[SessionState::Connecting], SessionState::Ready) => {
                tracing::info!(
                    server = %self.name(),
                    server_name = info.server_info.as_ref().and_then(|s| s.name.as_deref()).unwrap_or("unknown"),
                    server_version = info.server_info.as_ref().and_then(|s| s.version.as_deref()).unwrap_or("unknown"),
                    "server connected"
                );
                *lock(&self.server_info) = Some(info);
                return Ok(());
            }
            Ok(_) => {
                // The process died or disconnect() ran while the handshake was finishing.
                match self.state() {
                    SessionState::Disconnected => McpError::Disconnected {
                        name: self.name().to_string(),
                    },
                    _ => McpError::ServerCrashed {
                        name: self.name().to_string(),
                        reason: "process stopped during handshake".into(),
                    },
                }
            }
            Err(e) => e,
        };

        if let Some(mut failed) = link.take() {
            self.teardown(&mut failed).await;
        }
        // Leave an explicit disconnect() in place.
        self.shared
            .transition(&[SessionState::Connecting], SessionState::Failed);

        tracing::error!(server = %self.name(), error = %error, "handshake failed");
        Err(McpError::HandshakeFailed {
            name: self.name().to_string(),
            source: Box::new(error),
        })
    }

    /// Kill the server (if running) and fail every pending request.
    ///
    /// Always safe; calling it on a disconnected session does nothing.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        // State first: a request that registers after this point sees it and bails.
        let previous = self.shared.state.send_replace(SessionState::Disconnected);

        if let Some(mut running) = link.take() {
            self.teardown(&mut running).await;
        }
        self.shared.correlator.cancel_all(McpError::Disconnected {
            name: self.name().to_string(),
        });
        *lock(&self.server_info) = None;

        if previous != SessionState::Disconnected {
            tracing::info!(server = %self.name(), from = %previous, "session disconnected");
        }
    }

    /// Stop the process behind `link` and fail whatever is still pending.
    async fn teardown(&self, link: &mut ProcessLink) {
        lock(&self.outbound).take();
        link.shutdown().await;
        lock(&self.pid).take();
        self.shared.correlator.cancel_all(McpError::Disconnected {
            name: self.name().to_string(),
        });
    }

    fn spawn_process(&self) -> Result<ProcessLink, McpError> {
        let config = &self.config;
        let spawn_error = |reason: String| McpError::SpawnFailed {
            name: config.name.clone(),
            reason,
        };

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        // Inherited environment with the session's variables on top.
        cmd.envs(&config.env);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(format!("{}: {e}", config.command)))?;

        // On any early return below, dropping `child` kills it.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("failed to capture stderr".into()))?;

        let pid = child.id();
        let (events_tx, events_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let writer = tokio::spawn(write_stdin(
            stdin,
            outbound_rx,
            events_tx.clone(),
            config.name.clone(),
        ));
        let reader = tokio::spawn(read_stdout(
            stdout,
            Arc::clone(&self.shared),
            outbound_tx.clone(),
            events_tx.clone(),
        ));
        let stderr = tokio::spawn(forward_stderr(stderr, config.name.clone()));
        let supervisor = tokio::spawn(supervise(child, events_rx, Arc::clone(&self.shared)));

        *lock(&self.outbound) = Some(outbound_tx);
        *lock(&self.pid) = pid;

        tracing::info!(
            server = %config.name,
            command = %config.command,
            pid = pid.unwrap_or_default(),
            "spawned server process"
        );

        Ok(ProcessLink {
            events: events_tx,
            supervisor,
            reader,
            writer,
            stderr,
        })
    }

    /// `initialize` request followed by the `notifications/initialized` notification.
    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let params =
            serde_json::to_value(InitializeParams::default()).map_err(|e| McpError::InvalidResponse {
                method: "initialize".into(),
                reason: format!("failed to serialize params: {e}"),
            })?;
        let result = self
            .dispatch("initialize", params, SessionState::Connecting)
            .await?;

        let info: InitializeResult = serde_json::from_value(result).unwrap_or_else(|e| {
            tracing::warn!(server = %self.name(), error = %e, "unrecognized initialize result");
            InitializeResult::default()
        });

        if let Some(version) = info.protocol_version.as_deref() {
            if version != PROTOCOL_VERSION {
                tracing::warn!(
                    server = %self.name(),
                    server_version = version,
                    client_version = PROTOCOL_VERSION,
                    "protocol version mismatch, continuing"
                );
            }
        }

        let line = codec::encode_notification("notifications/initialized", None)?;
        self.send_line(line).await?;
        Ok(info)
    }

    // ─── Requests ────────────────────────────────────────────────────────

    fn ensure_state(&self, expected: SessionState) -> Result<(), McpError> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(McpError::NotConnected {
                name: self.name().to_string(),
            })
        }
    }

    async fn send_line(&self, line: String) -> Result<(), McpError> {
        let outbound = lock(&self.outbound).clone().ok_or_else(|| McpError::NotConnected {
            name: self.name().to_string(),
        })?;
        outbound.send(line).await.map_err(|_| McpError::TransportError {
            server: self.name().to_string(),
            reason: "stdin writer has stopped".into(),
        })
    }

    /// Register, write, and wait. Only valid while the session is in `expected`.
    async fn dispatch(
        &self,
        method: &str,
        params: Value,
        expected: SessionState,
    ) -> Result<Value, McpError> {
        self.ensure_state(expected)?;

        let correlator = &self.shared.correlator;
        let id = correlator.next_id();
        let pending = correlator.register(id, method, self.config.timeout())?;
        // Re-check after registering: a concurrent disconnect either sees this
        // entry in its cancel_all or already changed the state.
        self.ensure_state(expected)?;

        let line = codec::encode_request(id, method, params)?;
        self.send_line(line).await?;
        tracing::debug!(server = %self.name(), id, method, "request sent");

        pending.wait().await
    }

    /// Send an arbitrary request and return its raw result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        self.dispatch(method, params, SessionState::Ready).await
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.ensure_state(SessionState::Ready)?;
        let line = codec::encode_notification(method, params)?;
        self.send_line(line).await
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, McpError> {
        let result = self.request(method, params).await?;
        serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// `tools/list`
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let list: ToolsListResult = self.request_as("tools/list", serde_json::json!({})).await?;
        Ok(list.tools)
    }

    /// `tools/call`. `arguments` is passed through untouched.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.request_as("tools/call", params).await
    }

    /// `resources/list`
    pub async fn list_resources(&self) -> Result<Vec<McpResource>, McpError> {
        let list: ResourcesListResult = self
            .request_as("resources/list", serde_json::json!({}))
            .await?;
        Ok(list.resources)
    }

    /// `resources/read`
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let read: ResourceReadResult = self
            .request_as("resources/read", serde_json::json!({"uri": uri}))
            .await?;
        Ok(read.contents)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

// ─── Background tasks ────────────────────────────────────────────────────────

async fn supervise(
    mut child: Child,
    mut events: mpsc::Receiver<SupervisorEvent>,
    shared: Arc<Shared>,
) {
    let reason = loop {
        tokio::select! {
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("process exited ({status})"),
                    Err(e) => format!("failed to wait for process: {e}"),
                };
                tracing::info!(server = %shared.name, %reason, "server process stopped");
                if tokio::time::timeout(EXIT_DRAIN_GRACE, stdout_drained(&mut events))
                    .await
                    .is_err()
                {
                    tracing::debug!(server = %shared.name, "stdout still open after process exit");
                }
                break reason;
            }
            event = events.recv() => match event {
                Some(SupervisorEvent::StreamClosed { stream, reason }) => {
                    // The process may still be alive; keep owning it until disconnect.
                    shared.fail(&format!("{stream} closed: {reason}"));
                }
                Some(SupervisorEvent::Shutdown) | None => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(server = %shared.name, error = %e, "kill failed");
                    }
                    return;
                }
            },
        }
    };

    shared.fail(&reason);
}

/// Resolves once the reader reports stdout closed (or nobody can report it anymore).
async fn stdout_drained(events: &mut mpsc::Receiver<SupervisorEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::StreamClosed { stream: "stdout", .. } | SupervisorEvent::Shutdown => {
                return
            }
            SupervisorEvent::StreamClosed { .. } => {}
        }
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut lines: mpsc::Receiver<String>,
    events: mpsc::Sender<SupervisorEvent>,
    server: String,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = write_line(&mut stdin, &line).await {
            tracing::warn!(server = %server, error = %e, "failed to write to server stdin");
            let _ = events
                .send(SupervisorEvent::StreamClosed {
                    stream: "stdin",
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    }
    // Every sender is gone; EOF tells the server we are done.
    let _ = stdin.shutdown().await;
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn read_stdout(
    mut stdout: ChildStdout,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<String>,
    events: mpsc::Sender<SupervisorEvent>,
) {
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    let reason = loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                if let Some(decoded) = decoder.finish() {
                    handle_decoded(&shared, &outbound, decoded);
                }
                break "end of stream".to_string();
            }
            Ok(n) => {
                for decoded in decoder.push(&buf[..n]) {
                    handle_decoded(&shared, &outbound, decoded);
                }
            }
            Err(e) => break format!("read error: {e}"),
        }
    };

    tracing::debug!(server = %shared.name, %reason, "stdout reader finished");
    let _ = events
        .send(SupervisorEvent::StreamClosed {
            stream: "stdout",
            reason,
        })
        .await;
}

fn handle_decoded(
    shared: &Shared,
    outbound: &mpsc::Sender<String>,
    decoded: Result<WireMessage, McpError>,
) {
    match decoded {
        Ok(message) => route_message(shared, outbound, message),
        Err(e) => {
            tracing::warn!(server = %shared.name, error = %e, "discarding malformed line from server");
        }
    }
}

/// Never blocks: the reader must keep draining stdout no matter what.
fn route_message(shared: &Shared, outbound: &mpsc::Sender<String>, message: WireMessage) {
    match message {
        WireMessage::Response(response) => {
            let id = response.id;
            let delivered = match codec::extract_result(response) {
                Ok(result) => shared.correlator.resolve(id, result),
                Err(e) => shared.correlator.reject(id, e),
            };
            if !delivered {
                tracing::debug!(server = %shared.name, id, "dropping response for unknown or expired request");
            }
        }
        WireMessage::Notification { method, params } => {
            log_notification(&shared.name, &method, params.as_ref());
        }
        WireMessage::Request(request) => {
            let reply = if request.method == "ping" {
                codec::encode_result(&request.id, serde_json::json!({}))
            } else {
                tracing::debug!(server = %shared.name, method = %request.method, "rejecting server request");
                codec::encode_error(
                    &request.id,
                    error_codes::METHOD_NOT_FOUND,
                    &format!("Method not found: {}", request.method),
                )
            };
            match reply {
                Ok(line) => {
                    if outbound.try_send(line).is_err() {
                        tracing::warn!(server = %shared.name, "outbound queue unavailable, dropping reply");
                    }
                }
                Err(e) => tracing::warn!(server = %shared.name, error = %e, "failed to encode reply"),
            }
        }
    }
}

fn log_notification(server: &str, method: &str, params: Option<&Value>) {
    match method {
        "notifications/message" => {
            let level = params
                .and_then(|p| p.get("level"))
                .and_then(Value::as_str)
                .unwrap_or("info");
            let data = match params.and_then(|p| p.get("data")) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            match level {
                "debug" => tracing::debug!(server, "server log: {data}"),
                "warning" | "error" | "critical" | "alert" | "emergency" => {
                    tracing::warn!(server, level, "server log: {data}")
                }
                _ => tracing::info!(server, "server log: {data}"),
            }
        }
        _ => tracing::debug!(server, method, "unhandled server notification"),
    }
}

async fn forward_stderr(stderr: ChildStderr, server: String) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    tracing::info!(server = %server, "stderr: {text}");
                }
            }
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stderr reader failed");
                break;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
