//! The live session record.
//!
//! One [`Session`] per active session id, owned by the bridge and mutated
//! only behind its per-session lock.  Consumer sockets hold no session
//! pointer; the bridge's store holds the mapping.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bc_adapters::traits::{AdapterCapabilities, BackendSession};
use bc_domain::config::BrokerConfig;
use bc_domain::consumer::{ConsumerIdentity, InboundImage, PresenceEntry};
use bc_domain::message::UnifiedMessage;
use bc_domain::state::{SessionPhase, SessionState, SessionStatus};
use bc_sessions::history::MessageHistory;
use bc_sessions::team::TeamCorrelationBuffer;

use crate::consumers::delivery::DeliveryChannel;
use crate::consumers::limiter::TokenBucket;
use crate::runtime::slash::SlashCommandRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supporting records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One attached consumer socket.
pub struct ConsumerHandle {
    pub identity: ConsumerIdentity,
    pub limiter: TokenBucket,
    pub channel: DeliveryChannel,
    /// Serialized [`SequencedMessage`] JSON lines, drained by the socket
    /// writer task.
    ///
    /// [`SequencedMessage`]: bc_domain::consumer::SequencedMessage
    pub writer: mpsc::UnboundedSender<String>,
}

/// The single-slot next-turn queue entry.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub content: String,
    pub images: Option<Vec<InboundImage>>,
    pub consumer_id: String,
    pub display_name: String,
    pub queued_at: i64,
}

/// An in-flight slash-command passthrough awaiting its result cycle.
#[derive(Debug, Clone)]
pub struct PendingPassthrough {
    pub request_id: String,
    pub command: String,
    /// Assistant text captured since the passthrough was sent.
    pub body: String,
}

/// The armed initialize handshake.
#[derive(Debug, Clone)]
pub struct PendingInitialize {
    pub request_id: String,
}

/// A permission request awaiting a participant's decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tool_use_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Session {
    pub state: SessionState,
    pub phase: SessionPhase,
    pub adapter_name: String,
    /// Shared so slow adapter calls can run outside the session lock.
    pub backend: Option<std::sync::Arc<Box<dyn BackendSession>>>,
    pub backend_abort: CancellationToken,
    pub adapter_caps: Option<AdapterCapabilities>,
    pub consumers: HashMap<u64, ConsumerHandle>,
    next_consumer_handle: u64,
    pub pending_permissions: HashMap<String, PendingPermission>,
    pub history: MessageHistory,
    next_seq: u64,
    /// Inbound messages awaiting a backend connection.
    pub pending_messages: VecDeque<UnifiedMessage>,
    pub pending_passthroughs: VecDeque<PendingPassthrough>,
    pub queued_message: Option<QueuedMessage>,
    pub last_status: Option<SessionStatus>,
    pub last_activity: i64,
    pub pending_initialize: Option<PendingInitialize>,
    pub team_buffer: TeamCorrelationBuffer,
    pub registry: SlashCommandRegistry,
    pub anonymous_counter: u64,
    pub first_user_message: Option<String>,
    pub first_turn_emitted: bool,
    pub closed: bool,
}

impl Session {
    pub fn new(session_id: &str, adapter_name: &str, config: &BrokerConfig) -> Self {
        Self {
            state: SessionState::new(session_id),
            phase: SessionPhase::Created,
            adapter_name: adapter_name.to_owned(),
            backend: None,
            backend_abort: CancellationToken::new(),
            adapter_caps: None,
            consumers: HashMap::new(),
            next_consumer_handle: 1,
            pending_permissions: HashMap::new(),
            history: MessageHistory::new(config.delivery.history_limit),
            next_seq: 0,
            pending_messages: VecDeque::new(),
            pending_passthroughs: VecDeque::new(),
            queued_message: None,
            last_status: None,
            last_activity: chrono::Utc::now().timestamp_millis(),
            pending_initialize: None,
            team_buffer: TeamCorrelationBuffer::new(),
            registry: SlashCommandRegistry::new(),
            anonymous_counter: 0,
            first_user_message: None,
            first_turn_emitted: false,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn next_consumer_handle(&mut self) -> u64 {
        let id = self.next_consumer_handle;
        self.next_consumer_handle += 1;
        id
    }

    /// Next outbound sequence number; strictly increasing per session, so
    /// strictly increasing for every consumer's delivered subset.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn next_anonymous(&mut self) -> u64 {
        self.anonymous_counter += 1;
        self.anonymous_counter
    }

    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now().timestamp_millis();
    }

    pub fn presence(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self
            .consumers
            .values()
            .map(|h| PresenceEntry {
                user_id: h.identity.user_id.clone(),
                display_name: h.identity.display_name.clone(),
                role: h.identity.role,
            })
            .collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.state.session_id.clone(),
            adapter_name: self.adapter_name.clone(),
            phase: self.phase,
            consumer_count: self.consumers.len(),
            last_activity: self.last_activity,
            state: self.state.clone(),
        }
    }
}

/// A read-only view handed out by `list_sessions` / `get_session`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub adapter_name: String,
    pub phase: SessionPhase,
    pub consumer_count: usize,
    pub last_activity: i64,
    pub state: SessionState,
}

/// The lockable entry stored in the bridge's session map.
pub struct SessionEntry {
    pub inner: Mutex<Session>,
}

impl SessionEntry {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Mutex::new(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let config = BrokerConfig::default();
        let mut session = Session::new("s1", "claude", &config);
        assert_eq!(session.next_seq(), 1);
        assert_eq!(session.next_seq(), 2);
        assert_eq!(session.next_anonymous(), 1);
        assert_eq!(session.next_anonymous(), 2);
        assert_eq!(session.next_consumer_handle(), 1);
        assert_eq!(session.next_consumer_handle(), 2);
    }

    #[test]
    fn snapshot_reflects_state() {
        let config = BrokerConfig::default();
        let mut session = Session::new("s1", "claude", &config);
        session.state.model = Some("sonnet".into());
        let snap = session.snapshot();
        assert_eq!(snap.session_id, "s1");
        assert_eq!(snap.adapter_name, "claude");
        assert_eq!(snap.phase, SessionPhase::Created);
        assert_eq!(snap.state.model.as_deref(), Some("sonnet"));
    }
}
