//! Claude SDK-URL adapter.
//!
//! The Claude Code CLI is launched with an SDK URL pointing back at the
//! broker's embedded WebSocket server.  Connect therefore returns before any
//! socket exists: outbound frames queue in the session until the transport
//! glue attaches the CLI's socket, then drain in order.
//!
//! Inbound deliveries may be a complete single-object frame (fast path, no
//! newline) or NDJSON chunks assembled by the line buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use bc_domain::error::{Error, Result};
use bc_domain::message::UnifiedMessage;
use bc_domain::stream::MessageStream;

use crate::cli_wire;
use crate::ndjson::LineBuffer;
use crate::queue::MessageQueue;
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Factory plus the rendezvous table the transport glue uses to attach CLI
/// sockets to waiting sessions.
#[derive(Default)]
pub struct ClaudeAdapter {
    sessions: Mutex<HashMap<String, ClaudeSession>>,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the CLI's socket for a session.  `outbound_tx` receives every
    /// wire frame the session wants delivered; queued frames drain
    /// immediately, in order.
    pub fn attach_transport(
        &self,
        session_id: &str,
        outbound_tx: mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| Error::BackendConnect(format!("no pending session {session_id}")))?;
        session.attach(outbound_tx);
        Ok(())
    }

    /// Feed one WebSocket delivery from the CLI into a session.
    pub fn ingest(&self, session_id: &str, frame: &str) {
        let session = {
            let sessions = self.sessions.lock();
            sessions.get(session_id).cloned()
        };
        match session {
            Some(session) => session.ingest_frame(frame),
            None => tracing::warn!(session_id = %session_id, "CLI frame for unknown session"),
        }
    }

    /// The CLI's socket closed; terminate the session's message stream.
    pub fn transport_closed(&self, session_id: &str) {
        let session = {
            let mut sessions = self.sessions.lock();
            sessions.remove(session_id)
        };
        if let Some(session) = session {
            session.inner.queue.close();
        }
    }
}

#[async_trait]
impl BackendAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            slash_passthrough: true,
            availability: Availability::Local,
            teams: true,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>> {
        let session = ClaudeSession::new(&opts.session_id);
        self.sessions
            .lock()
            .insert(opts.session_id.clone(), session.clone());
        tracing::info!(session_id = %opts.session_id, resume = opts.resume, "claude session awaiting CLI socket");
        Ok(Box::new(session))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Outbound {
    /// Socket not attached yet; frames wait here.
    Pending(Vec<String>),
    Attached(mpsc::UnboundedSender<String>),
}

struct ClaudeInner {
    session_id: String,
    queue: MessageQueue,
    stream: Mutex<Option<MessageStream>>,
    outbound: Mutex<Outbound>,
    line_buffer: Mutex<LineBuffer>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ClaudeSession {
    inner: Arc<ClaudeInner>,
}

impl ClaudeSession {
    fn new(session_id: &str) -> Self {
        let (queue, stream) = MessageQueue::channel();
        Self {
            inner: Arc::new(ClaudeInner {
                session_id: session_id.to_owned(),
                queue,
                stream: Mutex::new(Some(stream)),
                outbound: Mutex::new(Outbound::Pending(Vec::new())),
                line_buffer: Mutex::new(LineBuffer::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        let mut outbound = self.inner.outbound.lock();
        if let Outbound::Pending(frames) = &mut *outbound {
            let queued = std::mem::take(frames);
            tracing::info!(
                session_id = %self.inner.session_id,
                queued = queued.len(),
                "CLI socket attached, draining queued frames"
            );
            for frame in queued {
                let _ = tx.send(frame);
            }
        }
        *outbound = Outbound::Attached(tx);
    }

    fn enqueue_frame(&self, frame: String) -> Result<()> {
        let mut outbound = self.inner.outbound.lock();
        match &mut *outbound {
            Outbound::Pending(frames) => {
                frames.push(frame);
                Ok(())
            }
            Outbound::Attached(tx) => {
                if tx.send(frame).is_err() {
                    // Socket writer is gone; surface on the inbound stream.
                    self.inner.queue.push(UnifiedMessage::error_result(
                        "CLI socket write failed: receiver dropped",
                    ));
                }
                Ok(())
            }
        }
    }

    /// One WebSocket delivery.  A complete single-object frame is parsed
    /// directly; anything else goes through the NDJSON buffer.  The fast
    /// path only applies while the buffer holds no partial line.
    pub fn ingest_frame(&self, frame: &str) {
        let mut buffer = self.inner.line_buffer.lock();
        if !frame.contains('\n') && buffer.is_empty() {
            drop(buffer);
            self.ingest_line(frame);
            return;
        }
        let lines = buffer.push(frame);
        drop(buffer);
        for line in lines {
            self.ingest_line(&line);
        }
    }

    fn ingest_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if let Some(msg) = cli_wire::native_to_unified(trimmed) {
            self.inner.queue.push(msg);
        }
    }
}

#[async_trait]
impl BackendSession for ClaudeSession {
    fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    fn send(&self, msg: UnifiedMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.inner.session_id.clone()));
        }
        match cli_wire::unified_to_native(&msg, &self.inner.session_id) {
            Some(frame) => self.enqueue_frame(frame),
            None => {
                tracing::warn!(
                    session_id = %self.inner.session_id,
                    msg_type = %msg.kind,
                    "claude adapter cannot express message type, ignoring"
                );
                Ok(())
            }
        }
    }

    fn send_raw(&self, line: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.inner.session_id.clone()));
        }
        self.enqueue_frame(line.to_owned())
    }

    fn messages(&self) -> Result<MessageStream> {
        self.inner
            .stream
            .lock()
            .take()
            .ok_or_else(|| Error::BackendStream("message stream already taken".into()))
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.queue.close();
        *self.inner.outbound.lock() = Outbound::Pending(Vec::new());
        tracing::info!(session_id = %self.inner.session_id, "claude session closed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::message::MessageType;
    use futures_util::StreamExt;

    async fn connect(adapter: &ClaudeAdapter) -> Box<dyn BackendSession> {
        adapter
            .connect(ConnectOptions::new("s1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn frames_queue_until_socket_attaches() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;

        session.send(UnifiedMessage::user_text("first")).unwrap();
        session.send(UnifiedMessage::user_text("second")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.attach_transport("s1", tx).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.contains("\"first\""));
        assert!(second.contains("\"second\""));
    }

    #[tokio::test]
    async fn single_object_frame_fast_path() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;
        let mut stream = session.messages().unwrap();

        adapter.ingest("s1", r#"{"type":"keep_alive"}"#);
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.kind, MessageType::KeepAlive);
    }

    #[tokio::test]
    async fn chunked_ndjson_assembles() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;
        let mut stream = session.messages().unwrap();

        adapter.ingest("s1", "{\"type\":\"keep_alive\"}\n{\"type\":\"system\",");
        adapter.ingest("s1", "\"subtype\":\"status\",\"status\":\"idle\"}\n");

        assert_eq!(stream.next().await.unwrap().kind, MessageType::KeepAlive);
        assert_eq!(stream.next().await.unwrap().kind, MessageType::StatusChange);
    }

    #[tokio::test]
    async fn messages_single_subscriber() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;
        let _stream = session.messages().unwrap();
        assert!(session.messages().is_err());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;
        session.close().await;
        session.close().await; // idempotent
        let err = session.send(UnifiedMessage::user_text("late")).unwrap_err();
        assert!(matches!(err, Error::SessionClosed(_)));
    }

    #[tokio::test]
    async fn close_terminates_stream() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;
        let mut stream = session.messages().unwrap();
        session.close().await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn transport_closed_terminates_stream() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;
        let mut stream = session.messages().unwrap();
        adapter.transport_closed("s1");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn raw_bypass_supported() {
        let adapter = ClaudeAdapter::new();
        let session = connect(&adapter).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.attach_transport("s1", tx).unwrap();

        session.send_raw("{\"type\":\"custom\"}").unwrap();
        assert_eq!(rx.recv().await.unwrap(), "{\"type\":\"custom\"}");
    }

    #[tokio::test]
    async fn attach_unknown_session_errors() {
        let adapter = ClaudeAdapter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(adapter.attach_transport("ghost", tx).is_err());
    }
}
