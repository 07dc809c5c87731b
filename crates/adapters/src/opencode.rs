//! OpenCode adapter.
//!
//! Transport is HTTP + SSE against a locally launched `opencode serve`.  The
//! coordinator spawns the server through the supervisor (readiness is the
//! `"listening on"` stdout marker) and hands the adapter its base URL.  The
//! adapter creates an opencode session over REST, opens the `/event` SSE
//! stream, and translates events; outbound traffic is REST posts issued by a
//! worker task so `send` stays a synchronous enqueue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bc_domain::error::{Error, Result};
use bc_domain::message::{MessageType, Role, UnifiedMessage};
use bc_domain::stream::MessageStream;
use bc_supervisor::process::SpawnSpec;

use crate::queue::MessageQueue;
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions,
};

/// Stdout marker that signals the server is accepting connections.
pub const READY_MARKER: &str = "listening on";

/// Build the supervisor spec for `opencode serve --port N --hostname H`.
pub fn launch_spec(key: &str, port: u16, hostname: &str) -> SpawnSpec {
    SpawnSpec {
        key: key.to_owned(),
        command: "opencode".into(),
        args: vec![
            "serve".into(),
            "--port".into(),
            port.to_string(),
            "--hostname".into(),
            hostname.to_owned(),
        ],
        ready_marker: Some(READY_MARKER.into()),
        ..Default::default()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenCodeAdapter {
    client: reqwest::Client,
}

impl OpenCodeAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OpenCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for OpenCodeAdapter {
    fn name(&self) -> &str {
        "opencode"
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
        let base_url = opts
            .adapter_options
            .get("base_url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BackendConnect("opencode adapter requires base_url".into()))?
            .trim_end_matches('/')
            .to_owned();

        // Create the upstream session over REST.
        let created: Value = self
            .client
            .post(format!("{base_url}/session"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| Error::BackendConnect(format!("create session: {e}")))?
            .json()
            .await
            .map_err(|e| Error::BackendConnect(format!("create session body: {e}")))?;
        let oc_session_id = created
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BackendConnect("session create response missing id".into()))?
            .to_owned();

        let (queue, stream) = MessageQueue::channel();
        let queue = Arc::new(queue);
        let cancel = CancellationToken::new();

        // SSE consumer.
        {
            let client = self.client.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            let base_url = base_url.clone();
            let oc_session_id = oc_session_id.clone();
            tokio::spawn(async move {
                let response = match client.get(format!("{base_url}/event")).send().await {
                    Ok(response) => response,
                    Err(e) => {
                        queue.push(UnifiedMessage::error_result(format!("event stream: {e}")));
                        queue.close();
                        return;
                    }
                };
                let mut response = response;
                let mut buffer = String::new();
                loop {
                    let chunk = tokio::select! {
                        chunk = response.chunk() => chunk,
                        _ = cancel.cancelled() => break,
                    };
                    match chunk {
                        Ok(Some(bytes)) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                            for data in drain_data_lines(&mut buffer) {
                                handle_event(&queue, &oc_session_id, &data);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            queue.push(UnifiedMessage::error_result(format!("event stream: {e}")));
                            break;
                        }
                    }
                }
                queue.close();
            });
        }

        // Outbound worker: REST calls off the `send` path.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundCall>();
        {
            let client = self.client.clone();
            let queue = queue.clone();
            let base_url = base_url.clone();
            let oc_session_id = oc_session_id.clone();
            tokio::spawn(async move {
                while let Some(call) = outbound_rx.recv().await {
                    let result = match call {
                        OutboundCall::Prompt(text) => {
                            client
                                .post(format!("{base_url}/session/{oc_session_id}/prompt"))
                                .json(&json!({"parts": [{"type": "text", "text": text}]}))
                                .send()
                                .await
                        }
                        OutboundCall::Abort => {
                            client
                                .post(format!("{base_url}/session/{oc_session_id}/abort"))
                                .json(&json!({}))
                                .send()
                                .await
                        }
                        OutboundCall::Permission { id, reply } => {
                            client
                                .post(format!(
                                    "{base_url}/session/{oc_session_id}/permission/{id}"
                                ))
                                .json(&json!({"reply": reply}))
                                .send()
                                .await
                        }
                    };
                    if let Err(e) = result {
                        queue.push(UnifiedMessage::error_result(format!("opencode call: {e}")));
                    }
                }
            });
        }

        // Upstream id announcement for persistence.
        queue.push(
            UnifiedMessage::new(MessageType::SessionInit, Role::System)
                .with_meta("session_id", Value::String(oc_session_id.clone())),
        );

        Ok(Box::new(OpenCodeSession {
            session_id: opts.session_id,
            outbound_tx,
            stream: Mutex::new(Some(stream)),
            cancel,
            queue,
            closed: AtomicBool::new(false),
        }))
    }
}

enum OutboundCall {
    Prompt(String),
    Abort,
    Permission { id: String, reply: &'static str },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenCodeSession {
    session_id: String,
    outbound_tx: mpsc::UnboundedSender<OutboundCall>,
    stream: Mutex<Option<MessageStream>>,
    cancel: CancellationToken,
    queue: Arc<MessageQueue>,
    closed: AtomicBool,
}

#[async_trait]
impl BackendSession for OpenCodeSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, msg: UnifiedMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.session_id.clone()));
        }
        let call = match msg.kind {
            MessageType::UserMessage => OutboundCall::Prompt(msg.text_content()),
            MessageType::Interrupt => OutboundCall::Abort,
            MessageType::PermissionResponse => {
                let id = msg.meta_str("request_id").unwrap_or("").to_owned();
                let reply = match msg.meta_str("behavior") {
                    Some("allow") => "once",
                    _ => "never",
                };
                OutboundCall::Permission { id, reply }
            }
            ref other => {
                tracing::warn!(
                    session_id = %self.session_id,
                    msg_type = %other,
                    "opencode adapter cannot express message type, ignoring"
                );
                return Ok(());
            }
        };
        self.outbound_tx
            .send(call)
            .map_err(|_| Error::SessionClosed(self.session_id.clone()))
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
        self.cancel.cancel();
        self.queue.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE & event translation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract complete `data:` payloads from an SSE buffer.  Events are
/// delimited by `\n\n`; the buffer is drained in place and a trailing
/// partial event stays for the next call.
fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}

fn handle_event(queue: &MessageQueue, oc_session_id: &str, data: &str) {
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        tracing::debug!("dropping unparseable SSE payload");
        return;
    };
    for msg in translate_event(&event, oc_session_id) {
        queue.push(msg);
    }
}

/// Translate one opencode event to unified messages.  Events for other
/// sessions and unrecognized types are dropped.
fn translate_event(event: &Value, oc_session_id: &str) -> Vec<UnifiedMessage> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    let properties = event.get("properties").cloned().unwrap_or(Value::Null);

    // Session-scoped events carry the opencode session id.
    if let Some(sid) = properties.get("sessionID").and_then(Value::as_str) {
        if sid != oc_session_id {
            return Vec::new();
        }
    }

    match event_type {
        "server.connected" => vec![
            UnifiedMessage::new(MessageType::SessionInit, Role::System)
                .with_meta("server", properties),
        ],
        "session.status" => {
            let status = properties
                .get("status")
                .map(|s| {
                    s.as_str()
                        .map(str::to_owned)
                        .or_else(|| {
                            s.get("type").and_then(Value::as_str).map(str::to_owned)
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            let mut out = vec![
                UnifiedMessage::new(MessageType::StatusChange, Role::System)
                    .with_meta("status", Value::String(status.clone())),
            ];
            // Going idle ends the turn.
            if status == "idle" {
                out.push(
                    UnifiedMessage::new(MessageType::Result, Role::System)
                        .with_meta("subtype", json!("success"))
                        .with_meta("is_error", json!(false))
                        .with_meta("num_turns", json!(1)),
                );
            }
            out
        }
        "message.part.updated" => vec![
            UnifiedMessage::new(MessageType::StreamEvent, Role::Assistant)
                .with_meta("event", properties),
        ],
        "permission.updated" => {
            let request_id = properties
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned();
            let tool_name = properties
                .get("title")
                .or_else(|| properties.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_owned();
            vec![
                UnifiedMessage::new(MessageType::PermissionRequest, Role::System)
                    .with_meta("request_id", Value::String(request_id))
                    .with_meta("tool_name", Value::String(tool_name))
                    .with_meta(
                        "input",
                        properties.get("metadata").cloned().unwrap_or(Value::Null),
                    )
                    .with_meta(
                        "tool_use_id",
                        properties
                            .get("callID")
                            .cloned()
                            .unwrap_or(Value::String(String::new())),
                    ),
            ]
        }
        other => {
            tracing::debug!(event_type = %other, "dropping unrecognized opencode event");
            Vec::new()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_spec_shape() {
        let spec = launch_spec("s1", 4096, "127.0.0.1");
        assert_eq!(spec.command, "opencode");
        assert_eq!(
            spec.args,
            vec!["serve", "--port", "4096", "--hostname", "127.0.0.1"]
        );
        assert_eq!(spec.ready_marker.as_deref(), Some(READY_MARKER));
    }

    #[test]
    fn drain_handles_partial_events() {
        let mut buf = String::from("data: {\"a\":1}\n\ndata: par");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert_eq!(buf, "data: par");

        buf.push_str("tial\n\n");
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["partial"]);
    }

    #[test]
    fn server_connected_becomes_session_init() {
        let event = json!({"type": "server.connected", "properties": {"version": "1.0"}});
        let msgs = translate_event(&event, "oc-1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageType::SessionInit);
    }

    #[test]
    fn idle_status_emits_status_and_result() {
        let event = json!({
            "type": "session.status",
            "properties": {"sessionID": "oc-1", "status": "idle"},
        });
        let msgs = translate_event(&event, "oc-1");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].kind, MessageType::StatusChange);
        assert_eq!(msgs[1].kind, MessageType::Result);
        assert_eq!(msgs[1].meta_bool("is_error"), Some(false));
    }

    #[test]
    fn busy_status_emits_only_status_change() {
        let event = json!({
            "type": "session.status",
            "properties": {"sessionID": "oc-1", "status": {"type": "busy"}},
        });
        let msgs = translate_event(&event, "oc-1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].meta_str("status"), Some("busy"));
    }

    #[test]
    fn other_sessions_filtered() {
        let event = json!({
            "type": "session.status",
            "properties": {"sessionID": "oc-other", "status": "idle"},
        });
        assert!(translate_event(&event, "oc-1").is_empty());
    }

    #[test]
    fn permission_updated_translates() {
        let event = json!({
            "type": "permission.updated",
            "properties": {
                "sessionID": "oc-1",
                "id": "perm-1",
                "title": "bash",
                "metadata": {"command": "ls"},
                "callID": "call-1",
            },
        });
        let msgs = translate_event(&event, "oc-1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageType::PermissionRequest);
        assert_eq!(msgs[0].meta_str("request_id"), Some("perm-1"));
        assert_eq!(msgs[0].meta_str("tool_name"), Some("bash"));
    }

    #[test]
    fn unknown_event_dropped() {
        let event = json!({"type": "installation.updated", "properties": {}});
        assert!(translate_event(&event, "oc-1").is_empty());
    }
}
