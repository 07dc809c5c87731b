//! ACP (Agent Client Protocol) adapter.
//!
//! Transport is JSON-RPC 2.0 over the stdio of a spawned subprocess.
//! Handshake: `initialize` (protocolVersion 1), then `session/new`, or
//! `session/load` when resuming.  `session/prompt` carries user messages;
//! `session/update` notifications carry stream chunks; server-initiated
//! `session/request_permission` requests surface as `permission_request`
//! unified messages and are answered by echoing the server's request id.
//! `fs/*` and `terminal/*` requests are refused with `-32601` so the agent
//! never hangs waiting on capabilities we do not offer.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bc_domain::error::{Error, Result};
use bc_domain::message::{ContentBlock, MessageType, Role, UnifiedMessage};
use bc_domain::stream::MessageStream;
use bc_supervisor::env::sanitized_env;

use crate::jsonrpc::{
    Correlator, IncomingRpc, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_SUPPORTED,
};
use crate::queue::MessageQueue;
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions,
};

const ACP_PROTOCOL_VERSION: u64 = 1;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AcpAdapter {
    name: String,
    command: String,
    args: Vec<String>,
}

impl AcpAdapter {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: "acp".into(),
            command: command.into(),
            args,
        }
    }

    /// Same protocol under a different registry name (Gemini rides on this).
    pub fn named(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl BackendAdapter for AcpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            slash_passthrough: false,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>> {
        // Per-session launch override, used by the generic `acp` entry.
        let command = opts
            .adapter_options
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or(&self.command)
            .to_owned();
        let args: Vec<String> = opts
            .adapter_options
            .get("args")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_else(|| self.args.clone());

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(sanitized_env(&[], &[]))
            .kill_on_drop(true);
        if let Some(cwd) = opts.adapter_options.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::BackendConnect(format!("spawn {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::BackendConnect("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::BackendConnect("failed to capture agent stdout".into()))?;

        let (queue, stream) = MessageQueue::channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(AcpShared {
            session_id: opts.session_id.clone(),
            acp_session_id: Mutex::new(None),
            correlator: Correlator::new(),
            queue,
            pending_permissions: Mutex::new(HashMap::new()),
            turn_text: Mutex::new(String::new()),
            outbound_tx,
            cancel: CancellationToken::new(),
        });

        // Writer: drains the outbound line channel into stdin so `send`
        // never touches I/O.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = outbound_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            // Channel closed: dropping stdin is the graceful shutdown signal.
        });

        // Reader: classify every stdout line.
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    let line = tokio::select! {
                        line = lines.next_line() => line,
                        _ = shared.cancel.cancelled() => break,
                    };
                    match line {
                        Ok(Some(line)) => shared.handle_line(&line),
                        Ok(None) | Err(_) => break,
                    }
                }
                shared
                    .correlator
                    .fail_all(-32000, "agent process stream ended");
                shared.queue.close();
            });
        }

        // Handshake.
        let init = shared
            .request(
                "initialize",
                json!({
                    "protocolVersion": ACP_PROTOCOL_VERSION,
                    "clientCapabilities": {
                        "fs": {"readTextFile": false, "writeTextFile": false},
                    },
                }),
            )
            .await?
            .into_result()
            .map_err(|e| Error::BackendConnect(format!("initialize: {e}")))?;
        tracing::debug!(session_id = %opts.session_id, response = %init, "ACP initialize complete");

        let cwd = opts
            .adapter_options
            .get("cwd")
            .and_then(Value::as_str)
            .unwrap_or(".");
        let session_result = if opts.resume {
            let upstream = opts.upstream_session_id.clone().ok_or_else(|| {
                Error::BackendConnect("resume requested without an upstream session id".into())
            })?;
            shared
                .request("session/load", json!({"sessionId": upstream, "cwd": cwd, "mcpServers": []}))
                .await?
                .into_result()
                .map(|r| (r, upstream))
        } else {
            shared
                .request("session/new", json!({"cwd": cwd, "mcpServers": []}))
                .await?
                .into_result()
                .and_then(|r| {
                    let sid = r
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .ok_or(crate::jsonrpc::JsonRpcError {
                            code: -32000,
                            message: "session/new response missing sessionId".into(),
                            data: None,
                        })?;
                    Ok((r, sid))
                })
        };
        let (_, acp_session_id) =
            session_result.map_err(|e| Error::BackendConnect(format!("session setup: {e}")))?;
        *shared.acp_session_id.lock() = Some(acp_session_id.clone());

        // Announce the upstream id so the coordinator can persist it.
        shared.queue.push(
            UnifiedMessage::new(MessageType::SessionInit, Role::System)
                .with_meta("session_id", Value::String(acp_session_id)),
        );

        Ok(Box::new(AcpSession {
            shared,
            child: tokio::sync::Mutex::new(Some(child)),
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared peer state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingPermission {
    rpc_id: Value,
    options: Vec<Value>,
}

struct AcpShared {
    session_id: String,
    acp_session_id: Mutex<Option<String>>,
    correlator: Correlator,
    queue: MessageQueue,
    /// request_id → the server's JSON-RPC id + offered options.
    pending_permissions: Mutex<HashMap<String, PendingPermission>>,
    /// Assistant text accumulated over the current prompt turn.
    turn_text: Mutex<String>,
    outbound_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl AcpShared {
    fn send_line(&self, line: String) -> Result<()> {
        self.outbound_tx
            .send(line)
            .map_err(|_| Error::SessionClosed(self.session_id.clone()))
    }

    async fn request(&self, method: &str, params: Value) -> Result<JsonRpcResponse> {
        let (id, rx) = self.correlator.register();
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, Some(params)))?;
        self.send_line(line)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::BackendStream(format!("{method}: peer went away"))),
            Err(_) => {
                self.correlator.forget(id);
                Err(Error::Timeout(format!("{method} timed out")))
            }
        }
    }

    fn notify(&self, method: &str, params: Value) {
        if let Ok(line) = serde_json::to_string(&JsonRpcNotification::new(method, Some(params))) {
            let _ = self.send_line(line);
        }
    }

    fn respond(&self, response: JsonRpcResponse) {
        if let Ok(line) = serde_json::to_string(&response) {
            let _ = self.send_line(line);
        }
    }

    fn handle_line(self: &Arc<Self>, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        match IncomingRpc::classify(trimmed) {
            Some(IncomingRpc::Response(resp)) => {
                if !self.correlator.complete(resp) {
                    tracing::debug!(session_id = %self.session_id, "response for unknown request id");
                }
            }
            Some(IncomingRpc::Notification { method, params }) => {
                self.handle_notification(&method, params);
            }
            Some(IncomingRpc::Request { id, method, params }) => {
                self.handle_server_request(id, &method, params);
            }
            None => {
                tracing::debug!(session_id = %self.session_id, line = %trimmed, "dropping non-RPC line from agent");
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        if method != "session/update" {
            tracing::debug!(method = %method, "dropping unrecognized notification");
            return;
        }
        let Some(update) = params.as_ref().and_then(|p| p.get("update")) else {
            self.queue
                .push(UnifiedMessage::error_result("session/update without update body"));
            return;
        };
        if let Some(text) = agent_chunk_text(update) {
            self.turn_text.lock().push_str(text);
        }
        if let Some(msg) = translate_update(update) {
            self.queue.push(msg);
        }
    }

    fn handle_server_request(&self, id: Value, method: &str, params: Option<Value>) {
        if method == "session/request_permission" {
            let params = params.unwrap_or(Value::Null);
            let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
            let options: Vec<Value> = params
                .get("options")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let request_id = uuid::Uuid::new_v4().to_string();
            self.pending_permissions.lock().insert(
                request_id.clone(),
                PendingPermission {
                    rpc_id: id,
                    options: options.clone(),
                },
            );

            let tool_use_id = tool_call
                .get("toolCallId")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned();
            let tool_name = tool_call
                .get("title")
                .or_else(|| tool_call.get("kind"))
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_owned();

            self.queue.push(
                UnifiedMessage::new(MessageType::PermissionRequest, Role::System)
                    .with_meta("request_id", Value::String(request_id))
                    .with_meta("tool_name", Value::String(tool_name))
                    .with_meta(
                        "input",
                        tool_call.get("rawInput").cloned().unwrap_or(Value::Null),
                    )
                    .with_meta("tool_use_id", Value::String(tool_use_id))
                    .with_meta("permission_suggestions", Value::Array(options)),
            );
            return;
        }

        // fs/* and terminal/* (and anything else we do not serve) must be
        // answered, not ignored, or the agent blocks forever.
        tracing::debug!(method = %method, "refusing server-initiated request");
        self.respond(JsonRpcResponse::failure(
            id,
            METHOD_NOT_SUPPORTED,
            "Method not supported",
        ));
    }

    /// Answer a pending permission request by echoing the server's id.
    fn resolve_permission(&self, request_id: &str, behavior: &str) -> bool {
        let Some(pending) = self.pending_permissions.lock().remove(request_id) else {
            return false;
        };
        let option_id = select_option(behavior, &pending.options);
        self.respond(JsonRpcResponse::success(
            pending.rpc_id,
            json!({"outcome": {"outcome": "selected", "optionId": option_id}}),
        ));
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AcpSession {
    shared: Arc<AcpShared>,
    child: tokio::sync::Mutex<Option<Child>>,
    stream: Mutex<Option<MessageStream>>,
    closed: AtomicBool,
}

impl AcpSession {
    fn run_prompt(&self, text: String) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let Some(acp_session_id) = shared.acp_session_id.lock().clone() else {
                shared
                    .queue
                    .push(UnifiedMessage::error_result("prompt before session setup"));
                return;
            };
            shared.turn_text.lock().clear();

            let result = shared
                .request(
                    "session/prompt",
                    json!({
                        "sessionId": acp_session_id,
                        "prompt": [{"type": "text", "text": text}],
                    }),
                )
                .await
                .and_then(|r| r.into_result().map_err(|e| Error::BackendStream(e.to_string())));

            match result {
                Ok(response) => {
                    let text = std::mem::take(&mut *shared.turn_text.lock());
                    if !text.is_empty() {
                        shared.queue.push(
                            UnifiedMessage::new(MessageType::Assistant, Role::Assistant)
                                .with_content(vec![ContentBlock::text(text.clone())])
                                .with_meta(
                                    "message",
                                    json!({"role": "assistant", "content": [{"type": "text", "text": text}]}),
                                ),
                        );
                    }
                    let stop_reason = response
                        .get("stopReason")
                        .and_then(Value::as_str)
                        .unwrap_or("end_turn");
                    shared.queue.push(
                        UnifiedMessage::new(MessageType::Result, Role::System)
                            .with_meta("subtype", json!("success"))
                            .with_meta("is_error", json!(false))
                            .with_meta("stop_reason", json!(stop_reason))
                            .with_meta("num_turns", json!(1)),
                    );
                }
                Err(e) => {
                    shared
                        .queue
                        .push(UnifiedMessage::error_result(format!("session/prompt: {e}")));
                }
            }
        });
    }
}

#[async_trait]
impl BackendSession for AcpSession {
    fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    fn send(&self, msg: UnifiedMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.shared.session_id.clone()));
        }
        match msg.kind {
            MessageType::UserMessage => {
                self.run_prompt(msg.text_content());
                Ok(())
            }
            MessageType::PermissionResponse => {
                let request_id = msg.meta_str("request_id").unwrap_or("");
                let behavior = msg.meta_str("behavior").unwrap_or("deny");
                if !self.shared.resolve_permission(request_id, behavior) {
                    tracing::warn!(
                        session_id = %self.shared.session_id,
                        request_id = %request_id,
                        "permission response for unknown request"
                    );
                }
                Ok(())
            }
            MessageType::Interrupt => {
                if let Some(acp_session_id) = self.shared.acp_session_id.lock().clone() {
                    self.shared
                        .notify("session/cancel", json!({"sessionId": acp_session_id}));
                }
                Ok(())
            }
            ref other => {
                tracing::warn!(
                    session_id = %self.shared.session_id,
                    msg_type = %other,
                    "acp adapter cannot express message type, ignoring"
                );
                Ok(())
            }
        }
    }

    fn messages(&self) -> Result<MessageStream> {
        self.stream
            .lock()
            .take()
            .ok_or_else(|| Error::BackendStream("message stream already taken".into()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.queue.close();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        // The writer task holds stdin; closing its channel drops stdin, which
        // is the graceful exit signal.  Escalate after the grace period.
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(session_id = %self.shared.session_id, ?status, "agent process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.shared.session_id, error = %e, "error waiting for agent process");
            }
            Err(_) => {
                tracing::warn!(session_id = %self.shared.session_id, "agent did not exit within grace period, killing");
                let _ = child.kill().await;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Translation helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Text payload of an agent message chunk, if this update carries one.
fn agent_chunk_text(update: &Value) -> Option<&str> {
    if update.get("sessionUpdate").and_then(Value::as_str) != Some("agent_message_chunk") {
        return None;
    }
    update.get("content")?.get("text")?.as_str()
}

/// Map one `session/update` body to a unified message.  Unrecognized update
/// kinds are dropped.
fn translate_update(update: &Value) -> Option<UnifiedMessage> {
    let kind = update.get("sessionUpdate").and_then(Value::as_str)?;
    match kind {
        "agent_message_chunk" | "agent_thought_chunk" | "plan" => Some(
            UnifiedMessage::new(MessageType::StreamEvent, Role::Assistant)
                .with_meta("event", update.clone()),
        ),
        "tool_call" | "tool_call_update" => Some(
            UnifiedMessage::new(MessageType::ToolProgress, Role::Tool)
                .with_meta("update", update.clone()),
        ),
        other => {
            tracing::debug!(kind = %other, "dropping unrecognized session update");
            None
        }
    }
}

/// Pick the ACP option id matching an allow/deny decision.  Falls back to
/// the literal behavior when the server offered no recognizable options.
fn select_option(behavior: &str, options: &[Value]) -> String {
    let want_allow = behavior == "allow";
    for option in options {
        let kind = option.get("kind").and_then(Value::as_str).unwrap_or("");
        let matches = if want_allow {
            kind.starts_with("allow")
        } else {
            kind.starts_with("reject") || kind.starts_with("deny")
        };
        if matches {
            if let Some(id) = option.get("optionId").and_then(Value::as_str) {
                return id.to_owned();
            }
        }
    }
    behavior.to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
