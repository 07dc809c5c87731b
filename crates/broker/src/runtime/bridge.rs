//! The session bridge.
//!
//! Owns every live session record and both message pipelines.  Inbound:
//! size check → rate limit → authorization → parse → T1 → route.  Outbound:
//! reduce → derived updates → T4 → per-consumer fan-out.  All mutation of
//! one session happens behind its lock; nothing awaits while holding it:
//! adapter `send` is a synchronous enqueue and socket writes drain through
//! per-consumer channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use bc_adapters::traits::{BackendAdapter, ConnectOptions};
use bc_domain::config::BrokerConfig;
use bc_domain::consumer::{
    ConsumerMessage, ConsumerRole, InboundMessage, PermissionBehavior, SequencedMessage,
    MAX_INBOUND_FRAME_BYTES,
};
use bc_domain::error::{Error, Result};
use bc_domain::events::{BridgeEvent, EventHub};
use bc_domain::message::{MessageType, UnifiedMessage};
use bc_domain::state::{SessionPhase, SessionStatus};
use bc_sessions::reducer::reduce;

use crate::consumers::delivery::DeliveryChannel;
use crate::consumers::gatekeeper::{
    anonymous_identity, authenticate_with_timeout, AuthContext, ConsumerAuthenticator,
};
use crate::consumers::limiter::TokenBucket;
use crate::runtime::normalize;
use crate::runtime::session::{
    ConsumerHandle, PendingPassthrough, Session, SessionEntry, SessionSnapshot,
};
use crate::runtime::slash::{self, SlashRoute};
use crate::runtime::{fanout, queue};

const BACKEND_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// What the transport layer should do after a frame was processed.
#[derive(Debug)]
pub enum FrameOutcome {
    Handled,
    /// The consumer asked to swap the backend adapter; the coordinator owns
    /// that operation.
    SetAdapter {
        adapter_name: String,
        adapter_options: Option<Value>,
    },
}

/// Seed values for a freshly created session.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub is_worktree: Option<bool>,
    pub repo_root: Option<String>,
    pub git_ahead: Option<i64>,
    pub git_behind: Option<i64>,
}

struct BridgeInner {
    config: Arc<BrokerConfig>,
    hub: EventHub,
    authenticator: Option<Arc<dyn ConsumerAuthenticator>>,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

/// Cheap-clone handle to the bridge; tasks capture clones.
#[derive(Clone)]
pub struct SessionBridge {
    inner: Arc<BridgeInner>,
}

impl SessionBridge {
    pub fn new(
        config: Arc<BrokerConfig>,
        hub: EventHub,
        authenticator: Option<Arc<dyn ConsumerAuthenticator>>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                config,
                hub,
                authenticator,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub(crate) fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    // ── Session store ────────────────────────────────────────────────

    pub fn create_session(
        &self,
        session_id: &str,
        adapter_name: &str,
        seed: SessionSeed,
    ) -> Arc<SessionEntry> {
        let mut session = Session::new(session_id, adapter_name, &self.inner.config);
        session.state.model = seed.model;
        session.state.cwd = seed.cwd;
        session.state.git_branch = seed.git_branch;
        session.state.is_worktree = seed.is_worktree;
        session.state.repo_root = seed.repo_root;
        session.state.git_ahead = seed.git_ahead;
        session.state.git_behind = seed.git_behind;

        let entry = Arc::new(SessionEntry::new(session));
        self.inner
            .sessions
            .write()
            .insert(session_id.to_owned(), entry.clone());
        entry
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.inner.sessions.read().get(session_id).cloned()
    }

    fn get_or_create(&self, session_id: &str) -> Arc<SessionEntry> {
        if let Some(entry) = self.get(session_id) {
            return entry;
        }
        // First consumer open creates the session lazily.
        self.create_session(
            session_id,
            &self.inner.config.sessions.default_adapter,
            SessionSeed::default(),
        )
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.read().keys().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.inner
            .sessions
            .read()
            .values()
            .map(|entry| entry.inner.lock().snapshot())
            .collect()
    }

    // ── Consumers ────────────────────────────────────────────────────

    /// Authenticate and attach a consumer socket.  Returns the consumer
    /// handle id used for subsequent frames.
    pub async fn attach_consumer(
        &self,
        ctx: AuthContext,
        last_seen_seq: Option<u64>,
        writer: mpsc::UnboundedSender<String>,
    ) -> Result<u64> {
        let entry = self.get_or_create(&ctx.session_id);

        let auth_timeout = Duration::from_millis(self.inner.config.sessions.auth_timeout_ms);
        let identity = match authenticate_with_timeout(
            self.inner.authenticator.as_ref(),
            &ctx,
            auth_timeout,
        )
        .await
        {
            Ok(identity) => identity,
            Err(e) => {
                self.hub().emit(BridgeEvent::AuthFailed {
                    session_id: ctx.session_id.clone(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut session = entry.inner.lock();
        if session.closed {
            return Err(Error::SessionClosed(ctx.session_id.clone()));
        }

        let identity = match identity {
            Some(mut identity) => {
                identity.session_id = ctx.session_id.clone();
                if let Some(role) = ctx.role_hint {
                    identity.role = role;
                }
                identity
            }
            None => {
                let n = session.next_anonymous();
                let mut anon = anonymous_identity(&ctx.session_id, n);
                if let Some(role) = ctx.role_hint {
                    anon.role = role;
                }
                anon
            }
        };

        let consumer_id = session.next_consumer_handle();
        session.consumers.insert(
            consumer_id,
            ConsumerHandle {
                identity: identity.clone(),
                limiter: TokenBucket::new(&self.inner.config.rate_limit),
                channel: DeliveryChannel::new(&self.inner.config.delivery),
                writer: writer.clone(),
            },
        );
        session.touch();

        self.hub().emit(BridgeEvent::ConsumerConnected {
            session_id: ctx.session_id.clone(),
            user_id: identity.user_id.clone(),
            role: match identity.role {
                ConsumerRole::Participant => "participant".into(),
                ConsumerRole::Observer => "observer".into(),
            },
        });

        // Bounded replay before any new traffic.  Replayed messages keep
        // their original sequence numbers; the synthetic gap error uses seq
        // 0 so it sorts before everything.
        if let Some(last_seen) = last_seen_seq {
            let replay = session.history.replay_after(last_seen);
            if replay.gapped {
                let gap = SequencedMessage {
                    seq: 0,
                    message_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    payload: ConsumerMessage::error_with_code("replay history evicted", "gap"),
                };
                write_to(&writer, &gap);
            }
            for msg in replay.messages {
                write_to(&writer, &msg);
            }
        }

        self.send_to_consumer(
            &mut session,
            consumer_id,
            ConsumerMessage::Identity {
                identity: identity.clone(),
            },
        );
        let presence = ConsumerMessage::PresenceUpdate {
            consumers: session.presence(),
        };
        self.broadcast(&mut session, presence);

        Ok(consumer_id)
    }

    pub fn detach_consumer(&self, session_id: &str, consumer_id: u64) {
        let Some(entry) = self.get(session_id) else {
            return;
        };
        let mut session = entry.inner.lock();
        let Some(handle) = session.consumers.remove(&consumer_id) else {
            return;
        };
        self.hub().emit(BridgeEvent::ConsumerDisconnected {
            session_id: session_id.to_owned(),
            user_id: handle.identity.user_id.clone(),
        });
        let presence = ConsumerMessage::PresenceUpdate {
            consumers: session.presence(),
        };
        self.broadcast(&mut session, presence);
    }

    // ── Inbound pipeline ─────────────────────────────────────────────

    pub async fn handle_consumer_frame(
        &self,
        session_id: &str,
        consumer_id: u64,
        raw: &str,
    ) -> Result<FrameOutcome> {
        // 1. Size check: transports close with 1009 on this error.
        if raw.len() > MAX_INBOUND_FRAME_BYTES {
            self.hub().emit(BridgeEvent::Error {
                session_id: session_id.to_owned(),
                source: "frameSize".into(),
                message: format!("frame of {} bytes exceeds limit", raw.len()),
            });
            return Err(Error::Protocol("message too big".into()));
        }

        let Some(entry) = self.get(session_id) else {
            return Err(Error::SessionClosed(session_id.to_owned()));
        };

        // Everything up to routing is synchronous under the session lock.
        let routed = {
            let mut session = entry.inner.lock();
            let Some(handle) = session.consumers.get_mut(&consumer_id) else {
                return Ok(FrameOutcome::Handled);
            };
            let identity = handle.identity.clone();

            // 2. Rate limit.
            if !handle.limiter.try_acquire() {
                self.send_to_consumer(
                    &mut session,
                    consumer_id,
                    ConsumerMessage::error_with_code("rate limit exceeded", "ratelimit_exceeded"),
                );
                return Ok(FrameOutcome::Handled);
            }

            // 3. Parse.
            let inbound: InboundMessage = match serde_json::from_str(raw) {
                Ok(inbound) => inbound,
                Err(e) => {
                    self.hub().emit(BridgeEvent::Error {
                        session_id: session_id.to_owned(),
                        source: "parseInbound".into(),
                        message: e.to_string(),
                    });
                    self.send_to_consumer(
                        &mut session,
                        consumer_id,
                        ConsumerMessage::error_with_code(
                            format!("unrecognized message: {e}"),
                            "protocol",
                        ),
                    );
                    return Ok(FrameOutcome::Handled);
                }
            };

            // 4. Authorization.
            if identity.role == ConsumerRole::Observer && inbound.participant_only() {
                self.send_to_consumer(
                    &mut session,
                    consumer_id,
                    ConsumerMessage::error_with_code(
                        format!("observers may not send {}", inbound.type_name()),
                        "not_authorized",
                    ),
                );
                return Ok(FrameOutcome::Handled);
            }

            session.touch();
            self.hub().emit(BridgeEvent::MessageInbound {
                session_id: session_id.to_owned(),
                message_type: inbound.type_name().to_owned(),
            });

            // 5./6. Normalize + route.
            match inbound {
                InboundMessage::SlashCommand { command } => RoutedFrame::Slash { command },
                InboundMessage::QueueMessage { content, images } => {
                    queue::handle_queue_message(self, &mut session, consumer_id, content, images);
                    RoutedFrame::Done
                }
                InboundMessage::UpdateQueuedMessage { content, images } => {
                    queue::handle_update_queued_message(
                        self,
                        &mut session,
                        consumer_id,
                        content,
                        images,
                    );
                    RoutedFrame::Done
                }
                InboundMessage::CancelQueuedMessage => {
                    queue::handle_cancel_queued_message(self, &mut session, consumer_id);
                    RoutedFrame::Done
                }
                InboundMessage::PresenceQuery => {
                    let update = ConsumerMessage::PresenceUpdate {
                        consumers: session.presence(),
                    };
                    self.send_to_consumer(&mut session, consumer_id, update);
                    RoutedFrame::Done
                }
                InboundMessage::SetAdapter {
                    adapter_name,
                    adapter_options,
                } => RoutedFrame::SetAdapter {
                    adapter_name,
                    adapter_options,
                },
                InboundMessage::PermissionResponse {
                    ref request_id,
                    behavior,
                    ..
                } => {
                    let behavior_str = match behavior {
                        PermissionBehavior::Allow => "allow",
                        PermissionBehavior::Deny => "deny",
                    };
                    if !self.resolve_permission(&mut session, request_id, behavior_str) {
                        self.send_to_consumer(
                            &mut session,
                            consumer_id,
                            ConsumerMessage::error_with_code(
                                format!("no pending permission request {request_id}"),
                                "protocol",
                            ),
                        );
                        return Ok(FrameOutcome::Handled);
                    }
                    if let Some(unified) = normalize::normalize(&inbound) {
                        self.send_to_backend(&mut session, unified);
                    }
                    RoutedFrame::Done
                }
                other => {
                    if let Some(unified) = normalize::normalize(&other) {
                        self.send_to_backend(&mut session, unified);
                    }
                    RoutedFrame::Done
                }
            }
        };

        // 7. Anything that must await runs outside the lock.
        match routed {
            RoutedFrame::Done => Ok(FrameOutcome::Handled),
            RoutedFrame::SetAdapter {
                adapter_name,
                adapter_options,
            } => Ok(FrameOutcome::SetAdapter {
                adapter_name,
                adapter_options,
            }),
            RoutedFrame::Slash { command } => {
                self.execute_slash(&entry, session_id, &command).await;
                Ok(FrameOutcome::Handled)
            }
        }
    }

    // ── Slash chain ──────────────────────────────────────────────────

    async fn execute_slash(&self, entry: &Arc<SessionEntry>, session_id: &str, command: &str) {
        let started = std::time::Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();

        // Decide the route under the lock; only adapter-native execution
        // needs to await afterwards.
        let native = {
            let mut session = entry.inner.lock();
            let claims = session
                .backend
                .as_ref()
                .map(|b| b.claims_slash(command))
                .unwrap_or(false);
            let passthrough = session
                .adapter_caps
                .map(|c| c.slash_passthrough)
                .unwrap_or(false);

            match slash::route(command, claims, passthrough) {
                SlashRoute::Emulated => {
                    let name = command.split_whitespace().next().unwrap_or(command);
                    let body = if name == "/clear" {
                        slash::clear_body()
                    } else {
                        slash::help_body(
                            session.state.capabilities.as_ref(),
                            &session.state.slash_commands,
                            &session.registry,
                        )
                    };
                    let msg = ConsumerMessage::SlashCommandResult {
                        request_id: request_id.clone(),
                        command: command.to_owned(),
                        source: "emulated".into(),
                        body,
                    };
                    self.broadcast(&mut session, msg);
                    self.hub().emit(BridgeEvent::SlashCommandExecuted {
                        session_id: session_id.to_owned(),
                        command: command.to_owned(),
                        source: "emulated".into(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    None
                }
                SlashRoute::AdapterNative => session.backend.clone(),
                SlashRoute::Passthrough => {
                    session.pending_passthroughs.push_back(PendingPassthrough {
                        request_id: request_id.clone(),
                        command: command.to_owned(),
                        body: String::new(),
                    });
                    let unified = UnifiedMessage::user_text(command);
                    self.send_to_backend(&mut session, unified);
                    None
                }
                SlashRoute::Unsupported => {
                    let msg = ConsumerMessage::SlashCommandError {
                        request_id: request_id.clone(),
                        command: command.to_owned(),
                        message: format!("{command} is not supported by this backend"),
                    };
                    self.broadcast(&mut session, msg);
                    self.hub().emit(BridgeEvent::SlashCommandFailed {
                        session_id: session_id.to_owned(),
                        command: command.to_owned(),
                        message: "unsupported".into(),
                    });
                    None
                }
            }
        };

        let Some(backend) = native else {
            return;
        };
        let source = {
            let session = entry.inner.lock();
            session.adapter_name.clone()
        };
        let result = backend.execute_slash(command).await;
        let mut session = entry.inner.lock();
        match result {
            Ok(body) => {
                let msg = ConsumerMessage::SlashCommandResult {
                    request_id,
                    command: command.to_owned(),
                    source: source.clone(),
                    body,
                };
                self.broadcast(&mut session, msg);
                self.hub().emit(BridgeEvent::SlashCommandExecuted {
                    session_id: session_id.to_owned(),
                    command: command.to_owned(),
                    source,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(e) => {
                let msg = ConsumerMessage::SlashCommandError {
                    request_id,
                    command: command.to_owned(),
                    message: e.to_string(),
                };
                self.broadcast(&mut session, msg);
                self.hub().emit(BridgeEvent::SlashCommandFailed {
                    session_id: session_id.to_owned(),
                    command: command.to_owned(),
                    message: e.to_string(),
                });
            }
        }
    }

    // ── Backend lifecycle ────────────────────────────────────────────

    /// Connect an adapter session and start the consumption loop.
    pub async fn connect_backend(
        &self,
        session_id: &str,
        adapter: &dyn BackendAdapter,
        opts: ConnectOptions,
    ) -> Result<()> {
        let entry = self
            .get(session_id)
            .ok_or_else(|| Error::SessionClosed(session_id.to_owned()))?;

        {
            let mut session = entry.inner.lock();
            if session.closed {
                return Err(Error::SessionClosed(session_id.to_owned()));
            }
            session.phase = SessionPhase::BackendConnecting;
        }

        let backend = match adapter.connect(opts).await {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                let mut session = entry.inner.lock();
                session.phase = SessionPhase::Degraded;
                self.hub().emit(BridgeEvent::Error {
                    session_id: session_id.to_owned(),
                    source: "backendConnect".into(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        let mut stream = backend.messages()?;

        let abort = {
            let mut session = entry.inner.lock();
            session.backend = Some(backend.clone());
            session.adapter_caps = Some(adapter.capabilities());
            session.adapter_name = adapter.name().to_owned();
            session.phase = SessionPhase::BackendConnected;
            session.backend_abort = tokio_util::sync::CancellationToken::new();

            // Offer everything that queued while the session was dead, in
            // arrival order.
            while let Some(pending) = session.pending_messages.pop_front() {
                if let Err(e) = backend.send(pending) {
                    self.hub().emit(BridgeEvent::Error {
                        session_id: session_id.to_owned(),
                        source: "sendToBackend".into(),
                        message: e.to_string(),
                    });
                }
            }
            session.backend_abort.clone()
        };

        self.hub().emit(BridgeEvent::BackendConnected {
            session_id: session_id.to_owned(),
            adapter: adapter.name().to_owned(),
        });

        self.send_initialize_request(&entry);

        // Consumption loop: the only reader of the adapter's stream.
        let bridge = self.clone();
        let loop_entry = entry.clone();
        let loop_session_id = session_id.to_owned();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = stream.next() => msg,
                    _ = abort.cancelled() => break,
                };
                match msg {
                    Some(msg) => bridge.handle_backend_message(&loop_entry, msg),
                    None => {
                        // Stream ended without cancellation: the backend is
                        // gone.  The session stays in the store, degraded.
                        let mut session = loop_entry.inner.lock();
                        session.backend = None;
                        session.phase = SessionPhase::Degraded;
                        bridge.hub().emit(BridgeEvent::BackendDisconnected {
                            session_id: loop_session_id.clone(),
                            code: None,
                            reason: Some("message stream ended".into()),
                        });
                        let lifecycle = ConsumerMessage::SessionLifecycle {
                            event: serde_json::json!({"event": "cli_disconnected"}),
                        };
                        bridge.broadcast(&mut session, lifecycle);
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Signal the consumption loop, then close the adapter session with a
    /// bounded grace period.
    pub async fn disconnect_backend(&self, session_id: &str) {
        let Some(entry) = self.get(session_id) else {
            return;
        };
        let backend = {
            let mut session = entry.inner.lock();
            session.backend_abort.cancel();
            session.phase = SessionPhase::Degraded;
            session.backend.take()
        };
        if let Some(backend) = backend {
            if tokio::time::timeout(BACKEND_CLOSE_GRACE, backend.close())
                .await
                .is_err()
            {
                tracing::warn!(session_id = %session_id, "backend close timed out, dropping");
            }
            self.hub().emit(BridgeEvent::BackendDisconnected {
                session_id: session_id.to_owned(),
                code: Some(1000),
                reason: Some("disconnect requested".into()),
            });
        }
    }

    /// Close and remove a session.  Idempotent: only the first call emits
    /// `session:closed` and returns true.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let Some(entry) = self.inner.sessions.write().remove(session_id) else {
            return false;
        };
        let backend = {
            let mut session = entry.inner.lock();
            session.closed = true;
            session.phase = SessionPhase::Closed;
            session.backend_abort.cancel();
            session.consumers.clear();
            session.backend.take()
        };
        if let Some(backend) = backend {
            if tokio::time::timeout(BACKEND_CLOSE_GRACE, backend.close())
                .await
                .is_err()
            {
                tracing::warn!(session_id = %session_id, "backend close timed out during session close");
            }
        }
        self.hub().emit(BridgeEvent::SessionClosed {
            session_id: session_id.to_owned(),
        });
        true
    }

    // ── Outbound pipeline ────────────────────────────────────────────

    /// Apply one backend message: reduce, update derived state, fan out.
    pub fn handle_backend_message(&self, entry: &Arc<SessionEntry>, msg: UnifiedMessage) {
        let mut session = entry.inner.lock();
        let session_id = session.session_id().to_owned();
        session.touch();

        if msg.kind == MessageType::ControlResponse {
            // Capabilities flow only through the handshake gate so a
            // response arriving after the initialize timeout is never
            // stored retroactively.
            self.handle_control_response(&mut session, &msg);
            self.hub().emit(BridgeEvent::MessageOutbound {
                session_id,
                message_type: msg.kind.as_str().to_owned(),
            });
            return;
        }

        if msg.kind == MessageType::SessionInit {
            if let Some(upstream) = msg.meta_str("session_id") {
                self.hub().emit(BridgeEvent::BackendSessionId {
                    session_id: session_id.clone(),
                    upstream_session_id: upstream.to_owned(),
                });
            }
            if session.phase == SessionPhase::BackendConnected {
                session.phase = SessionPhase::Idle;
            }
        }

        // 1. Pure reduction.
        let mut team_buffer = std::mem::take(&mut session.team_buffer);
        if let Some(next) = reduce(&session.state, &msg, &mut team_buffer) {
            session.state = next;
        }
        session.team_buffer = team_buffer;

        // 2. Derived updates.
        if msg.kind == MessageType::PermissionRequest {
            self.track_permission_request(&mut session, &msg);
        }
        if msg.kind == MessageType::AuthStatus {
            self.hub().emit(BridgeEvent::AuthStatus {
                session_id: session_id.clone(),
            });
        }
        match msg.kind {
            MessageType::StatusChange => {
                if let Some(status) = msg.meta_str("status") {
                    let status = SessionStatus::from(status.to_owned());
                    let became_idle = status == SessionStatus::Idle
                        && session.last_status != Some(SessionStatus::Idle);
                    session.last_status = Some(status.clone());
                    session.phase = match status {
                        SessionStatus::Idle => SessionPhase::Idle,
                        _ => SessionPhase::Active,
                    };
                    if became_idle {
                        queue::maybe_auto_send_queued(self, &mut session);
                    }
                }
            }
            MessageType::Assistant => {
                if let Some(front) = session.pending_passthroughs.front_mut() {
                    front.body.push_str(&msg.text_content());
                }
            }
            MessageType::Result => {
                // A completed passthrough command reports through its own
                // channel in addition to the regular result fan-out.
                if let Some(pending) = session.pending_passthroughs.pop_front() {
                    let body = slash::result_body(
                        &pending.body,
                        &serde_json::Value::Object(msg.metadata.clone()),
                    );
                    let result = ConsumerMessage::SlashCommandResult {
                        request_id: pending.request_id.clone(),
                        command: pending.command.clone(),
                        source: "passthrough".into(),
                        body,
                    };
                    self.broadcast(&mut session, result);
                    self.hub().emit(BridgeEvent::SlashCommandExecuted {
                        session_id: session_id.clone(),
                        command: pending.command,
                        source: "passthrough".into(),
                        duration_ms: 0,
                    });
                }

                if session.state.num_turns == 1 && !session.first_turn_emitted {
                    session.first_turn_emitted = true;
                    self.hub().emit(BridgeEvent::SessionFirstTurnCompleted {
                        session_id: session_id.clone(),
                        first_user_message: session.first_user_message.clone(),
                    });
                }

                session.last_status = Some(SessionStatus::Idle);
                session.phase = SessionPhase::Idle;
            }
            _ => {}
        }

        // 3./4./5. T4 map and fan out.
        for consumer_msg in fanout::fanout(&session.state, &msg) {
            self.broadcast(&mut session, consumer_msg);
        }

        // The turn is over; release the queued next-turn message.
        if msg.kind == MessageType::Result {
            queue::maybe_auto_send_queued(self, &mut session);
        }

        self.hub().emit(BridgeEvent::MessageOutbound {
            session_id,
            message_type: msg.kind.as_str().to_owned(),
        });
    }

    /// Offer a unified message to the backend, queueing while disconnected.
    pub(crate) fn send_to_backend(&self, session: &mut Session, msg: UnifiedMessage) {
        if msg.kind == MessageType::UserMessage && session.first_user_message.is_none() {
            session.first_user_message = Some(msg.text_content());
        }

        let Some(backend) = session.backend.clone() else {
            session.pending_messages.push_back(msg);
            return;
        };
        if session.phase == SessionPhase::Degraded {
            session.pending_messages.push_back(msg);
            return;
        }

        let is_user_message = msg.kind == MessageType::UserMessage;
        if let Err(e) = backend.send(msg) {
            self.hub().emit(BridgeEvent::Error {
                session_id: session.session_id().to_owned(),
                source: "sendToBackend".into(),
                message: e.to_string(),
            });
            // Consumers see the failure as a synthetic error result.
            let synthetic = UnifiedMessage::error_result(e.to_string());
            for consumer_msg in fanout::fanout(&session.state, &synthetic) {
                self.broadcast(session, consumer_msg);
            }
            return;
        }
        if is_user_message {
            session.last_status = Some(SessionStatus::Running);
            session.phase = SessionPhase::Active;
        }
    }

    // ── Delivery ─────────────────────────────────────────────────────

    /// Enqueue onto every consumer's delivery channel and drain to its
    /// writer.  A refused enqueue means the hard ceiling was reached; that
    /// consumer is disconnected.
    pub(crate) fn broadcast(&self, session: &mut Session, payload: ConsumerMessage) {
        let seq = session.next_seq();
        let msg = SequencedMessage::new(seq, payload);
        session.history.push(msg.clone());

        let mut overflowed = Vec::new();
        for (id, handle) in session.consumers.iter_mut() {
            if !handle.channel.enqueue(msg.clone()) {
                overflowed.push(*id);
                continue;
            }
            for queued in handle.channel.drain() {
                write_to(&handle.writer, &queued);
            }
        }
        for id in overflowed {
            if let Some(handle) = session.consumers.remove(&id) {
                tracing::warn!(
                    session_id = %session.session_id(),
                    user_id = %handle.identity.user_id,
                    "delivery queue ceiling reached, disconnecting consumer"
                );
                self.hub().emit(BridgeEvent::ConsumerDisconnected {
                    session_id: session.session_id().to_owned(),
                    user_id: handle.identity.user_id,
                });
            }
        }
    }

    /// Deliver to one consumer only.
    pub(crate) fn send_to_consumer(
        &self,
        session: &mut Session,
        consumer_id: u64,
        payload: ConsumerMessage,
    ) {
        let seq = session.next_seq();
        let msg = SequencedMessage::new(seq, payload);
        let Some(handle) = session.consumers.get_mut(&consumer_id) else {
            return;
        };
        if !handle.channel.enqueue(msg) {
            return;
        }
        for queued in handle.channel.drain() {
            write_to(&handle.writer, &queued);
        }
    }
}

fn write_to(writer: &mpsc::UnboundedSender<String>, msg: &SequencedMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = writer.send(json);
    }
}

enum RoutedFrame {
    Done,
    Slash {
        command: String,
    },
    SetAdapter {
        adapter_name: String,
        adapter_options: Option<Value>,
    },
}
