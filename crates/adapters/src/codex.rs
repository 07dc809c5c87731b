//! Codex adapter.
//!
//! Connects out to a local Codex agent over WebSocket.  The wire format is
//! the Claude-family CLI framing, so translation delegates to [`cli_wire`];
//! only the transport differs: a tungstenite client with a writer task fed
//! by an unbounded channel, and a reader task feeding the message queue.
//!
//! [`cli_wire`]: crate::cli_wire

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use bc_domain::error::{Error, Result};
use bc_domain::message::UnifiedMessage;
use bc_domain::stream::MessageStream;

use crate::cli_wire;
use crate::ndjson::LineBuffer;
use crate::queue::MessageQueue;
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions,
};

pub const DEFAULT_CODEX_URL: &str = "ws://127.0.0.1:1456";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct CodexAdapter;

impl CodexAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: false,
            slash_passthrough: true,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>> {
        let url = opts
            .adapter_options
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CODEX_URL)
            .to_owned();

        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| Error::BackendConnect(format!("codex connect {url}: {e}")))?;
        let (mut ws_sink, mut ws_stream) = ws.split();

        let (queue, stream) = MessageQueue::channel();
        let queue = Arc::new(queue);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();

        // Writer: forwards enqueued frames to the socket.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if ws_sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        // Reader: normalize inbound frames until close or cancellation.
        {
            let queue = queue.clone();
            let cancel = cancel.clone();
            let session_id = opts.session_id.clone();
            tokio::spawn(async move {
                let mut line_buffer = LineBuffer::new();
                loop {
                    let msg = tokio::select! {
                        msg = ws_stream.next() => msg,
                        _ = cancel.cancelled() => break,
                    };
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            ingest_frame(&queue, &mut line_buffer, &text);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(session_id = %session_id, error = %e, "codex socket error");
                            break;
                        }
                    }
                }
                queue.close();
            });
        }

        Ok(Box::new(CodexSession {
            session_id: opts.session_id,
            outbound_tx,
            stream: Mutex::new(Some(stream)),
            cancel,
            queue,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Fast-path single-object frames; everything else through the line buffer.
/// The fast path only applies while the buffer holds no partial line.
fn ingest_frame(queue: &MessageQueue, line_buffer: &mut LineBuffer, frame: &str) {
    if !frame.contains('\n') && line_buffer.is_empty() {
        if let Some(msg) = cli_wire::native_to_unified(frame.trim()) {
            queue.push(msg);
        }
        return;
    }
    for line in line_buffer.push(frame) {
        if let Some(msg) = cli_wire::native_to_unified(&line) {
            queue.push(msg);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CodexSession {
    session_id: String,
    outbound_tx: mpsc::UnboundedSender<String>,
    stream: Mutex<Option<MessageStream>>,
    cancel: CancellationToken,
    queue: Arc<MessageQueue>,
    closed: AtomicBool,
}

#[async_trait]
impl BackendSession for CodexSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, msg: UnifiedMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.session_id.clone()));
        }
        match cli_wire::unified_to_native(&msg, &self.session_id) {
            Some(frame) => self
                .outbound_tx
                .send(frame)
                .map_err(|_| Error::SessionClosed(self.session_id.clone())),
            None => {
                tracing::warn!(
                    session_id = %self.session_id,
                    msg_type = %msg.kind,
                    "codex adapter cannot express message type, ignoring"
                );
                Ok(())
            }
        }
    }

    fn send_raw(&self, line: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.session_id.clone()));
        }
        self.outbound_tx
            .send(line.to_owned())
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

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::message::MessageType;
    use futures_util::StreamExt as _;

    #[tokio::test]
    async fn ingest_handles_both_framings() {
        let (queue, mut stream) = MessageQueue::channel();
        let mut buffer = LineBuffer::new();

        ingest_frame(&queue, &mut buffer, r#"{"type":"keep_alive"}"#);
        ingest_frame(
            &queue,
            &mut buffer,
            "{\"type\":\"system\",\"subtype\":\"status\",\"status\":\"idle\"}\n{\"type\":\"keep_alive\"}\n",
        );

        assert_eq!(stream.next().await.unwrap().kind, MessageType::KeepAlive);
        assert_eq!(stream.next().await.unwrap().kind, MessageType::StatusChange);
        assert_eq!(stream.next().await.unwrap().kind, MessageType::KeepAlive);
    }

    #[test]
    fn capabilities_include_passthrough() {
        let adapter = CodexAdapter::new();
        assert!(adapter.capabilities().slash_passthrough);
        assert_eq!(adapter.name(), "codex");
    }
}
