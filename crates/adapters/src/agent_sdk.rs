//! Direct Agent SDK adapter.
//!
//! No subprocess: the adapter holds an in-process language-model query
//! primitive.  A `user_message` becomes one query invocation; response
//! chunks map to `stream_event`, the final text to `assistant`, and
//! termination to `result`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use bc_domain::error::{Error, Result};
use bc_domain::message::{ContentBlock, MessageType, Role, UnifiedMessage};
use bc_domain::stream::{BoxStream, MessageStream};

use crate::queue::MessageQueue;
use crate::traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query primitive
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One streamed event from the model.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    TextDelta(String),
    Done {
        /// Full response text.
        text: String,
        usage: Option<Value>,
    },
}

/// The in-process language-model entry point the adapter wraps.
#[async_trait]
pub trait AgentQuery: Send + Sync {
    async fn query(
        &self,
        prompt: String,
        model: Option<String>,
    ) -> Result<BoxStream<'static, Result<QueryEvent>>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentSdkAdapter {
    query: Arc<dyn AgentQuery>,
}

impl AgentSdkAdapter {
    pub fn new(query: Arc<dyn AgentQuery>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl BackendAdapter for AgentSdkAdapter {
    fn name(&self) -> &str {
        "agent-sdk"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: false,
            slash_commands: false,
            slash_passthrough: false,
            availability: Availability::Local,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>> {
        let (queue, stream) = MessageQueue::channel();
        let model = opts
            .adapter_options
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(Box::new(AgentSdkSession {
            session_id: opts.session_id,
            query: self.query.clone(),
            model,
            queue: Arc::new(queue),
            stream: Mutex::new(Some(stream)),
            turn: Mutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentSdkSession {
    session_id: String,
    query: Arc<dyn AgentQuery>,
    model: Option<String>,
    queue: Arc<MessageQueue>,
    stream: Mutex<Option<MessageStream>>,
    /// Cancels the running turn on interrupt or close.
    turn: Mutex<CancellationToken>,
    closed: AtomicBool,
}

impl AgentSdkSession {
    fn run_turn(&self, prompt: String) {
        let query = self.query.clone();
        let model = self.model.clone();
        let queue = self.queue.clone();
        let token = {
            let mut turn = self.turn.lock();
            *turn = CancellationToken::new();
            turn.clone()
        };

        tokio::spawn(async move {
            let stream = match query.query(prompt, model).await {
                Ok(stream) => stream,
                Err(e) => {
                    queue.push(UnifiedMessage::error_result(format!("query failed: {e}")));
                    return;
                }
            };
            let mut stream = stream;
            loop {
                let event = tokio::select! {
                    event = stream.next() => event,
                    _ = token.cancelled() => {
                        queue.push(
                            UnifiedMessage::new(MessageType::Result, Role::System)
                                .with_meta("subtype", json!("interrupted"))
                                .with_meta("is_error", json!(false)),
                        );
                        return;
                    }
                };
                match event {
                    Some(Ok(QueryEvent::TextDelta(delta))) => {
                        queue.push(
                            UnifiedMessage::new(MessageType::StreamEvent, Role::Assistant)
                                .with_meta(
                                    "event",
                                    json!({"type": "text_delta", "text": delta}),
                                ),
                        );
                    }
                    Some(Ok(QueryEvent::Done { text, usage })) => {
                        queue.push(
                            UnifiedMessage::new(MessageType::Assistant, Role::Assistant)
                                .with_content(vec![ContentBlock::text(text.clone())])
                                .with_meta(
                                    "message",
                                    json!({"role": "assistant", "content": [{"type": "text", "text": text}]}),
                                ),
                        );
                        let mut result = UnifiedMessage::new(MessageType::Result, Role::System)
                            .with_meta("subtype", json!("success"))
                            .with_meta("is_error", json!(false))
                            .with_meta("num_turns", json!(1));
                        if let Some(usage) = usage {
                            result.metadata.insert("modelUsage".into(), usage);
                        }
                        queue.push(result);
                        return;
                    }
                    Some(Err(e)) => {
                        queue.push(UnifiedMessage::error_result(format!("query stream: {e}")));
                        return;
                    }
                    None => {
                        // Stream ended without a Done marker.
                        queue.push(
                            UnifiedMessage::new(MessageType::Result, Role::System)
                                .with_meta("subtype", json!("success"))
                                .with_meta("is_error", json!(false)),
                        );
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl BackendSession for AgentSdkSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, msg: UnifiedMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.session_id.clone()));
        }
        match msg.kind {
            MessageType::UserMessage => {
                self.run_turn(msg.text_content());
                Ok(())
            }
            MessageType::Interrupt => {
                self.turn.lock().cancel();
                Ok(())
            }
            ref other => {
                tracing::warn!(
                    session_id = %self.session_id,
                    msg_type = %other,
                    "agent-sdk adapter cannot express message type, ignoring"
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
        self.turn.lock().cancel();
        self.queue.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoQuery;

    #[async_trait]
    impl AgentQuery for EchoQuery {
        async fn query(
            &self,
            prompt: String,
            _model: Option<String>,
        ) -> Result<BoxStream<'static, Result<QueryEvent>>> {
            Ok(Box::pin(async_stream::stream! {
                yield Ok(QueryEvent::TextDelta("echo: ".into()));
                yield Ok(QueryEvent::TextDelta(prompt.clone()));
                yield Ok(QueryEvent::Done {
                    text: format!("echo: {prompt}"),
                    usage: None,
                });
            }))
        }
    }

    #[tokio::test]
    async fn user_message_runs_a_turn() {
        let adapter = AgentSdkAdapter::new(Arc::new(EchoQuery));
        let session = adapter.connect(ConnectOptions::new("s1")).await.unwrap();
        let mut stream = session.messages().unwrap();

        session.send(UnifiedMessage::user_text("hi")).unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, MessageType::StreamEvent);
        let second = stream.next().await.unwrap();
        assert_eq!(second.kind, MessageType::StreamEvent);
        let third = stream.next().await.unwrap();
        assert_eq!(third.kind, MessageType::Assistant);
        assert_eq!(third.text_content(), "echo: hi");
        let fourth = stream.next().await.unwrap();
        assert_eq!(fourth.kind, MessageType::Result);
        assert_eq!(fourth.meta_bool("is_error"), Some(false));
    }

    #[tokio::test]
    async fn unsupported_types_ignored() {
        let adapter = AgentSdkAdapter::new(Arc::new(EchoQuery));
        let session = adapter.connect(ConnectOptions::new("s1")).await.unwrap();
        session
            .send(UnifiedMessage::new(MessageType::PermissionResponse, Role::User))
            .unwrap();
    }

    #[tokio::test]
    async fn close_terminates_stream() {
        let adapter = AgentSdkAdapter::new(Arc::new(EchoQuery));
        let session = adapter.connect(ConnectOptions::new("s1")).await.unwrap();
        let mut stream = session.messages().unwrap();
        session.close().await;
        assert!(stream.next().await.is_none());
        assert!(session.send(UnifiedMessage::user_text("late")).is_err());
    }
}
