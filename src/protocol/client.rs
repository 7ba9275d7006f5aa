//! Client for the coding agent's app-server protocol.
//!
//! The client owns at most one agent subprocess. Requests are correlated with
//! responses purely by id, so any number may be in flight and responses may
//! arrive in any order. A background reader task decodes stdout, answers
//! approval requests, and fans everything else out on the [`EventBus`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{AgentEvent, EventBus};
use super::frame::{FrameDecoder, encode_frame};
use super::message::{
    IncomingMessage, METHOD_NOT_FOUND, OutgoingMessage, RpcError, approval_response,
};
use crate::config::ForemanConfig;
use crate::errors::ProtocolError;

const TOKEN_USAGE_METHOD: &str = "thread/tokenUsage/updated";
const TURN_COMPLETED_METHOD: &str = "turn/completed";
const ITEM_COMPLETED_METHOD: &str = "item/completed";

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to launch and talk to the agent.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub turn_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            cwd: None,
            model: None,
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            turn_timeout: Duration::from_secs(1800),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &ForemanConfig) -> Self {
        let agent = &config.toml.agent;
        Self {
            command: config.toml.agent_cmd(),
            args: agent.args.clone(),
            cwd: Some(config.project_dir.clone()),
            model: agent.model.clone(),
            request_timeout: Duration::from_secs(agent.request_timeout_secs),
            shutdown_grace: Duration::from_secs(agent.shutdown_grace_secs),
            turn_timeout: Duration::from_secs(agent.turn_timeout_secs),
        }
    }
}

/// Cumulative token usage reported for one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: Option<String>,
    /// `completed`, `failed` or `interrupted`.
    pub status: String,
    pub error: Option<String>,
    /// Text of the last agent message item seen during the turn.
    pub last_agent_message: Option<String>,
}

impl TurnOutcome {
    pub fn is_success(&self) -> bool {
        self.status == "completed"
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, ProtocolError>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State tied to one connection. Replaced wholesale on reconnect.
struct Session {
    writer: AsyncMutex<Option<BoxWriter>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    usage: Mutex<HashMap<String, TokenUsage>>,
    closed: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: EventBus,
}

impl Session {
    fn new(writer: BoxWriter, events: EventBus) -> Self {
        Self {
            writer: AsyncMutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
            closed: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            events,
        }
    }

    fn closed_reason(&self) -> Option<String> {
        lock(&self.closed).clone()
    }

    async fn write(&self, msg: &OutgoingMessage) -> Result<(), ProtocolError> {
        let frame = encode_frame(msg)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotStarted)?;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| ProtocolError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::WriteFailed(e.to_string()))
    }

    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn fail_pending(&self, err: &ProtocolError) -> usize {
        let drained: Vec<PendingRequest> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(err.clone()));
        }
        count
    }

    /// Mark the session closed and reject everything still waiting. Only the
    /// first call emits [`AgentEvent::Exited`].
    fn shutdown(&self, reason: &str, err: ProtocolError) {
        let first = {
            let mut closed = lock(&self.closed);
            if closed.is_some() {
                false
            } else {
                *closed = Some(reason.to_string());
                true
            }
        };
        let failed = self.fail_pending(&err);
        if failed > 0 {
            warn!(failed, reason, "rejected pending agent requests");
        }
        if first {
            self.events.emit(AgentEvent::Exited {
                reason: reason.to_string(),
            });
        }
    }

    fn abort_tasks(&self) {
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
    }

    async fn dispatch(&self, line: &str) {
        let msg = match IncomingMessage::classify(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "ignoring malformed agent frame");
                self.events.emit(AgentEvent::ProtocolError(e.to_string()));
                return;
            }
        };

        match msg {
            IncomingMessage::Response { id, outcome } => {
                let pending = lock(&self.pending).remove(&id);
                match pending {
                    Some(p) => {
                        let method = p.method;
                        let result = outcome.map_err(|e| ProtocolError::Rpc {
                            method,
                            code: e.code,
                            message: e.message,
                        });
                        let _ = p.tx.send(result);
                    }
                    None => debug!(id, "dropping response with no pending request"),
                }
            }
            IncomingMessage::Request { id, method, params } => {
                let approval = approval_response(&method);
                let reply = match &approval {
                    Some(result) => OutgoingMessage::Response {
                        id: id.clone(),
                        result: result.clone(),
                    },
                    None => OutgoingMessage::ErrorResponse {
                        id: id.clone(),
                        error: RpcError {
                            code: METHOD_NOT_FOUND,
                            message: format!("Method not found: {}", method),
                            data: None,
                        },
                    },
                };
                if approval.is_some() {
                    debug!(%method, "auto-approving server request");
                } else {
                    warn!(%method, "unsupported server request");
                }
                if let Err(e) = self.write(&reply).await {
                    warn!(error = %e, %method, "failed to answer server request");
                }
                self.events.emit(AgentEvent::ServerRequest {
                    id,
                    method,
                    params,
                    auto_approved: approval.is_some(),
                });
            }
            IncomingMessage::Notification { method, params } => {
                if method == TOKEN_USAGE_METHOD {
                    self.record_usage(params.as_ref());
                }
                self.events
                    .emit(AgentEvent::Notification { method, params });
            }
        }
    }

    fn record_usage(&self, params: Option<&Value>) {
        let Some(params) = params else { return };
        let Some(thread_id) = params.get("threadId").and_then(Value::as_str) else {
            return;
        };
        let Some(total) = params
            .pointer("/tokenUsage/total")
            .or_else(|| params.get("usage"))
        else {
            return;
        };
        let field = |key: &str| total.get(key).and_then(Value::as_u64).unwrap_or(0);
        let usage = TokenUsage {
            input_tokens: field("inputTokens"),
            output_tokens: field("outputTokens"),
            total_tokens: field("totalTokens"),
        };
        lock(&self.usage).insert(thread_id.to_string(), usage);
    }
}

async fn read_loop<R>(session: Arc<Session>, mut reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "agent closed its output stream".to_string(),
            Ok(n) => {
                for line in decoder.push(&buf[..n]) {
                    session.dispatch(&line).await;
                }
            }
            Err(e) => break format!("read error: {}", e),
        }
    };
    debug!(%reason, "agent reader finished");
    session.shutdown(&reason, ProtocolError::ProcessExited(reason.clone()));
}

/// Line-delimited JSON client for one agent subprocess.
pub struct AgentClient {
    options: ClientOptions,
    events: EventBus,
    next_id: AtomicU64,
    session: Mutex<Option<Arc<Session>>>,
    child: AsyncMutex<Option<Child>>,
    /// Held across the running check and the spawn in [`AgentClient::start`].
    start_lock: AsyncMutex<()>,
}

impl AgentClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            events: EventBus::new(),
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
            child: AsyncMutex::new(None),
            start_lock: AsyncMutex::new(()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// True while a connection is attached and its reader has not hit EOF.
    pub fn is_running(&self) -> bool {
        lock(&self.session)
            .as_ref()
            .is_some_and(|s| s.closed_reason().is_none())
    }

    /// Spawn the agent subprocess. A no-op if one is already running.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let _guard = self.start_lock.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.options.command);
        cmd.args(&self.options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.options.cwd {
            cmd.current_dir(cwd);
        }

        let spawn_failed = |message: String| ProtocolError::SpawnFailed {
            command: self.options.command.clone(),
            message,
        };

        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout was not captured".into()))?;
        let stderr = child.stderr.take();

        info!(
            command = %self.options.command,
            pid = ?child.id(),
            "agent process started"
        );

        let session = self.attach(stdout, stdin);
        if let Some(stderr) = stderr {
            let events = self.events.clone();
            let handle = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "foreman::agent_stderr", "{}", line);
                    events.emit(AgentEvent::Stderr(line));
                }
            });
            lock(&session.tasks).push(handle);
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Attach to an already-open transport. Replaces any existing
    /// connection, failing its pending requests with [`ProtocolError::Reset`].
    pub fn connect<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.attach(reader, writer);
    }

    fn attach<R, W>(&self, reader: R, writer: W) -> Arc<Session>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = Arc::new(Session::new(Box::new(writer), self.events.clone()));
        let handle = tokio::spawn(read_loop(session.clone(), reader));
        lock(&session.tasks).push(handle);

        let previous = lock(&self.session).replace(session.clone());
        if let Some(previous) = previous {
            previous.shutdown("connection replaced", ProtocolError::Reset);
            previous.abort_tasks();
        }
        session
    }

    fn current_session(&self) -> Result<Arc<Session>, ProtocolError> {
        let session = lock(&self.session)
            .clone()
            .ok_or(ProtocolError::NotStarted)?;
        if let Some(reason) = session.closed_reason() {
            return Err(ProtocolError::ProcessExited(reason));
        }
        Ok(session)
    }

    /// Protocol handshake: `initialize` followed by `initialized`.
    pub async fn initialize(&self) -> Result<Value, ProtocolError> {
        let result = self
            .request(
                "initialize",
                Some(json!({
                    "clientInfo": {
                        "name": "foreman",
                        "title": "Foreman",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
            )
            .await?;
        self.notify("initialized", None).await?;
        Ok(result)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProtocolError> {
        self.request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    /// Send a request and wait for its response. On timeout the pending entry
    /// is removed, so a late response is dropped.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let session = self.current_session()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&session.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        let msg = OutgoingMessage::Request {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = session.write(&msg).await {
            lock(&session.pending).remove(&id);
            return Err(e);
        }
        debug!(id, method, "sent agent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ProcessExited(
                "response channel dropped".into(),
            )),
            Err(_) => {
                lock(&session.pending).remove(&id);
                warn!(id, method, ?timeout, "agent request timed out");
                Err(ProtocolError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtocolError> {
        let session = self.current_session()?;
        session
            .write(&OutgoingMessage::Notification {
                method: method.to_string(),
                params,
            })
            .await
    }

    /// Open a coding thread rooted at `cwd` and return its id.
    pub async fn start_thread(&self, cwd: &Path) -> Result<String, ProtocolError> {
        let mut params = json!({ "cwd": cwd.display().to_string() });
        if let Some(model) = &self.options.model {
            params["model"] = json!(model);
        }
        let result = self.request("thread/start", Some(params)).await?;
        result
            .pointer("/thread/id")
            .or_else(|| result.get("threadId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::UnexpectedResponse {
                method: "thread/start".into(),
                message: format!("no thread id in {}", result),
            })
    }

    /// Start a turn and wait for its `turn/completed` notification.
    pub async fn run_turn(&self, thread_id: &str, prompt: &str) -> Result<TurnOutcome, ProtocolError> {
        // Subscribe first so a fast completion is not missed.
        let mut events = self.events.subscribe();
        let result = self
            .request(
                "turn/start",
                Some(json!({
                    "threadId": thread_id,
                    "input": [{ "type": "text", "text": prompt }],
                })),
            )
            .await?;
        let turn_id = result
            .pointer("/turn/id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let wait = async {
            let mut last_agent_message = None;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "turn event receiver lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        return Err(ProtocolError::ProcessExited("event bus closed".into()));
                    }
                };
                let (method, params) = match event {
                    AgentEvent::Notification { method, params } => {
                        (method, params.unwrap_or(Value::Null))
                    }
                    AgentEvent::Exited { reason } => {
                        return Err(ProtocolError::ProcessExited(reason));
                    }
                    _ => continue,
                };
                if params.get("threadId").and_then(Value::as_str) != Some(thread_id) {
                    continue;
                }
                match method.as_str() {
                    ITEM_COMPLETED_METHOD => {
                        if params.pointer("/item/type").and_then(Value::as_str)
                            == Some("agentMessage")
                        {
                            last_agent_message = params
                                .pointer("/item/text")
                                .and_then(Value::as_str)
                                .map(str::to_string);
                        }
                    }
                    TURN_COMPLETED_METHOD => {
                        let completed_id = params
                            .pointer("/turn/id")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        if turn_id.is_some() && completed_id.is_some() && completed_id != turn_id {
                            continue;
                        }
                        let status = params
                            .pointer("/turn/status")
                            .and_then(Value::as_str)
                            .unwrap_or("completed")
                            .to_string();
                        let error = params
                            .pointer("/turn/error/message")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        return Ok(TurnOutcome {
                            turn_id: completed_id.or_else(|| turn_id.clone()),
                            status,
                            error,
                            last_agent_message,
                        });
                    }
                    _ => {}
                }
            }
        };

        match tokio::time::timeout(self.options.turn_timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::Timeout {
                method: "turn/start".into(),
                after: self.options.turn_timeout,
            }),
        }
    }

    pub fn thread_usage(&self, thread_id: &str) -> Option<TokenUsage> {
        let session = lock(&self.session).clone()?;
        let usage = lock(&session.usage).get(thread_id).copied();
        usage
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.session)
            .as_ref()
            .map(|s| lock(&s.pending).len())
            .unwrap_or(0)
    }

    /// Fail every pending request with [`ProtocolError::Reset`] and forget
    /// per-thread usage. The connection itself stays open.
    pub fn reset(&self) {
        if let Some(session) = lock(&self.session).clone() {
            session.fail_pending(&ProtocolError::Reset);
            lock(&session.usage).clear();
        }
    }

    /// Close stdin, give the agent the grace period to exit, then kill it.
    pub async fn stop(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = &session {
            session.close_writer().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.options.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "agent process exited"),
                Ok(Err(e)) => warn!(error = %e, "failed to wait for agent process"),
                Err(_) => {
                    warn!(
                        grace = ?self.options.shutdown_grace,
                        "agent did not exit within grace period, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill agent process");
                    }
                }
            }
        }

        if let Some(session) = session {
            session.shutdown(
                "agent stopped",
                ProtocolError::ProcessExited("agent stopped".into()),
            );
            session.abort_tasks();
        }
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.abort_tasks();
        }
    }
}
