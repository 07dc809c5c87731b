//! Consumer wire protocol.
//!
//! One JSON object per WebSocket frame (NDJSON when the transport is a
//! stream).  [`InboundMessage`] is what consumers send, [`ConsumerMessage`]
//! is what the bridge fans out, wrapped in a [`SequencedMessage`] envelope so
//! reconnecting consumers can replay from `last_seen_seq`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{Capabilities, SessionState};

/// Maximum inbound frame size in bytes (256 KiB).  Exceeding it closes the
/// socket with code 1009.
pub const MAX_INBOUND_FRAME_BYTES: usize = 262_144;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & roles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerRole {
    Participant,
    Observer,
}

/// The resolved identity of an attached consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerIdentity {
    pub user_id: String,
    pub display_name: String,
    pub role: ConsumerRole,
    pub session_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumer → server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An image attached to a user or queued message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundImage {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "user_message")]
    UserMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<Vec<InboundImage>>,
    },

    #[serde(rename = "permission_response")]
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_permissions: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "interrupt")]
    Interrupt,

    #[serde(rename = "set_model")]
    SetModel { model: String },

    #[serde(rename = "set_permission_mode")]
    SetPermissionMode { mode: String },

    #[serde(rename = "slash_command")]
    SlashCommand { command: String },

    #[serde(rename = "queue_message")]
    QueueMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<Vec<InboundImage>>,
    },

    #[serde(rename = "update_queued_message")]
    UpdateQueuedMessage {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<Vec<InboundImage>>,
    },

    #[serde(rename = "cancel_queued_message")]
    CancelQueuedMessage,

    #[serde(rename = "presence_query")]
    PresenceQuery,

    #[serde(rename = "set_adapter")]
    SetAdapter {
        adapter_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        adapter_options: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

impl InboundMessage {
    /// Whether this message type is denied to observers.
    pub fn participant_only(&self) -> bool {
        !matches!(self, Self::PresenceQuery)
    }

    /// The wire tag, for error reporting.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::PermissionResponse { .. } => "permission_response",
            Self::Interrupt => "interrupt",
            Self::SetModel { .. } => "set_model",
            Self::SetPermissionMode { .. } => "set_permission_mode",
            Self::SlashCommand { .. } => "slash_command",
            Self::QueueMessage { .. } => "queue_message",
            Self::UpdateQueuedMessage { .. } => "update_queued_message",
            Self::CancelQueuedMessage => "cancel_queued_message",
            Self::PresenceQuery => "presence_query",
            Self::SetAdapter { .. } => "set_adapter",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server → consumer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One attached consumer, as reported in `presence_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub role: ConsumerRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConsumerMessage {
    #[serde(rename = "session_init")]
    SessionInit { state: SessionState },

    #[serde(rename = "status_change")]
    StatusChange {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant { message: Value },

    #[serde(rename = "result")]
    Result { result: Value },

    #[serde(rename = "stream_event")]
    StreamEvent { event: Value },

    #[serde(rename = "permission_request")]
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestions: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    #[serde(rename = "tool_progress")]
    ToolProgress { progress: Value },

    #[serde(rename = "tool_use_summary")]
    ToolUseSummary { summary: Value },

    #[serde(rename = "auth_status")]
    AuthStatus { status: Value },

    #[serde(rename = "configuration_change")]
    ConfigurationChange { change: Value },

    #[serde(rename = "session_lifecycle")]
    SessionLifecycle { event: Value },

    #[serde(rename = "capabilities_ready")]
    CapabilitiesReady { capabilities: Capabilities },

    #[serde(rename = "message_queued")]
    MessageQueued {
        content: String,
        queued_by: String,
        display_name: String,
    },

    #[serde(rename = "queued_message_updated")]
    QueuedMessageUpdated { content: String, queued_by: String },

    #[serde(rename = "queued_message_cancelled")]
    QueuedMessageCancelled { cancelled_by: String },

    #[serde(rename = "queued_message_sent")]
    QueuedMessageSent { content: String, queued_by: String },

    #[serde(rename = "presence_update")]
    PresenceUpdate { consumers: Vec<PresenceEntry> },

    #[serde(rename = "identity")]
    Identity { identity: ConsumerIdentity },

    #[serde(rename = "slash_command_result")]
    SlashCommandResult {
        request_id: String,
        command: String,
        source: String,
        body: String,
    },

    #[serde(rename = "slash_command_error")]
    SlashCommandError {
        request_id: String,
        command: String,
        message: String,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Unknown adapter output, forwarded transparently.  Serializes as the
    /// raw object (which carries its own `type` field).
    #[serde(untagged)]
    Passthrough(Value),
}

impl ConsumerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// The wire tag, used for critical-type matching in the delivery channel.
    pub fn type_name(&self) -> &str {
        match self {
            Self::SessionInit { .. } => "session_init",
            Self::StatusChange { .. } => "status_change",
            Self::Assistant { .. } => "assistant",
            Self::Result { .. } => "result",
            Self::StreamEvent { .. } => "stream_event",
            Self::PermissionRequest { .. } => "permission_request",
            Self::ToolProgress { .. } => "tool_progress",
            Self::ToolUseSummary { .. } => "tool_use_summary",
            Self::AuthStatus { .. } => "auth_status",
            Self::ConfigurationChange { .. } => "configuration_change",
            Self::SessionLifecycle { .. } => "session_lifecycle",
            Self::CapabilitiesReady { .. } => "capabilities_ready",
            Self::MessageQueued { .. } => "message_queued",
            Self::QueuedMessageUpdated { .. } => "queued_message_updated",
            Self::QueuedMessageCancelled { .. } => "queued_message_cancelled",
            Self::QueuedMessageSent { .. } => "queued_message_sent",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::Identity { .. } => "identity",
            Self::SlashCommandResult { .. } => "slash_command_result",
            Self::SlashCommandError { .. } => "slash_command_error",
            Self::Error { .. } => "error",
            Self::Passthrough(value) => value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("passthrough"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sequenced envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The envelope every outbound consumer message is wrapped in.  `seq` is
/// strictly increasing per consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedMessage {
    pub seq: u64,
    pub message_id: String,
    pub timestamp: i64,
    pub payload: ConsumerMessage,
}

impl SequencedMessage {
    pub fn new(seq: u64, payload: ConsumerMessage) -> Self {
        Self {
            seq,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
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
    fn inbound_user_message_parses() {
        let raw = r#"{"type":"user_message","content":"hello","images":[{"media_type":"image/png","data":"aGk="}]}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::UserMessage { content, images, .. } => {
                assert_eq!(content, "hello");
                assert_eq!(images.unwrap().len(), 1);
            }
            _ => panic!("expected user_message"),
        }
    }

    #[test]
    fn unknown_inbound_type_rejected() {
        let raw = r#"{"type":"not_a_thing"}"#;
        assert!(serde_json::from_str::<InboundMessage>(raw).is_err());
    }

    #[test]
    fn observer_denied_set() {
        let denied = [
            InboundMessage::UserMessage {
                content: "x".into(),
                session_id: None,
                images: None,
            },
            InboundMessage::Interrupt,
            InboundMessage::SetModel { model: "m".into() },
            InboundMessage::SetPermissionMode { mode: "plan".into() },
            InboundMessage::SlashCommand { command: "/help".into() },
            InboundMessage::QueueMessage { content: "x".into(), images: None },
            InboundMessage::UpdateQueuedMessage { content: "x".into(), images: None },
            InboundMessage::CancelQueuedMessage,
            InboundMessage::SetAdapter {
                adapter_name: "claude".into(),
                adapter_options: None,
            },
        ];
        for msg in denied {
            assert!(msg.participant_only(), "{} should be denied", msg.type_name());
        }
        assert!(!InboundMessage::PresenceQuery.participant_only());
    }

    #[test]
    fn permission_response_behavior() {
        let raw = r#"{"type":"permission_response","request_id":"r1","behavior":"allow","updated_input":{"command":"ls -a"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::PermissionResponse { behavior, updated_input, .. } => {
                assert_eq!(behavior, PermissionBehavior::Allow);
                assert_eq!(updated_input.unwrap()["command"], "ls -a");
            }
            _ => panic!("expected permission_response"),
        }
    }

    #[test]
    fn consumer_message_tagged() {
        let msg = ConsumerMessage::error_with_code("too fast", "ratelimit_exceeded");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "ratelimit_exceeded");
        assert_eq!(msg.type_name(), "error");
    }

    #[test]
    fn passthrough_serializes_raw() {
        let raw = serde_json::json!({"type": "exotic_event", "payload": 42});
        let msg = ConsumerMessage::Passthrough(raw.clone());
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
        assert_eq!(msg.type_name(), "exotic_event");
    }

    #[test]
    fn sequenced_envelope_shape() {
        let seq = SequencedMessage::new(7, ConsumerMessage::error("x"));
        let json = serde_json::to_value(&seq).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["payload"]["type"], "error");
        assert!(json["message_id"].as_str().is_some());
    }
}
