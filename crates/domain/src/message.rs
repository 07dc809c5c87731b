//! The unified message model.
//!
//! Every backend adapter normalizes its native wire format into
//! [`UnifiedMessage`] (T3) and renders outbound unified messages back into
//! native frames (T2).  The bridge only ever sees this type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The tag of a unified message.
///
/// Unknown tags received from an adapter are preserved in `Other` so they can
/// be forwarded to consumers transparently.  The inbound normalizer never
/// produces `Other`; unknown consumer types are a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    SessionInit,
    StatusChange,
    Assistant,
    UserMessage,
    Result,
    StreamEvent,
    PermissionRequest,
    PermissionResponse,
    Interrupt,
    ToolProgress,
    ToolUseSummary,
    AuthStatus,
    ConfigurationChange,
    SessionLifecycle,
    ControlResponse,
    KeepAlive,
    // Adapter-internal types, not part of the consumer surface.
    ControlRequest,
    ControlCancelRequest,
    Diagnostic,
    /// Anything an adapter emits that we do not recognize.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionInit => "session_init",
            Self::StatusChange => "status_change",
            Self::Assistant => "assistant",
            Self::UserMessage => "user_message",
            Self::Result => "result",
            Self::StreamEvent => "stream_event",
            Self::PermissionRequest => "permission_request",
            Self::PermissionResponse => "permission_response",
            Self::Interrupt => "interrupt",
            Self::ToolProgress => "tool_progress",
            Self::ToolUseSummary => "tool_use_summary",
            Self::AuthStatus => "auth_status",
            Self::ConfigurationChange => "configuration_change",
            Self::SessionLifecycle => "session_lifecycle",
            Self::ControlResponse => "control_response",
            Self::KeepAlive => "keep_alive",
            Self::ControlRequest => "control_request",
            Self::ControlCancelRequest => "control_cancel_request",
            Self::Diagnostic => "diagnostic",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "session_init" => Self::SessionInit,
            "status_change" => Self::StatusChange,
            "assistant" => Self::Assistant,
            "user_message" => Self::UserMessage,
            "result" => Self::Result,
            "stream_event" => Self::StreamEvent,
            "permission_request" => Self::PermissionRequest,
            "permission_response" => Self::PermissionResponse,
            "interrupt" => Self::Interrupt,
            "tool_progress" => Self::ToolProgress,
            "tool_use_summary" => Self::ToolUseSummary,
            "auth_status" => Self::AuthStatus,
            "configuration_change" => Self::ConfigurationChange,
            "session_lifecycle" => Self::SessionLifecycle,
            "control_response" => Self::ControlResponse,
            "keep_alive" => Self::KeepAlive,
            "control_request" => Self::ControlRequest,
            "control_cancel_request" => Self::ControlCancelRequest,
            "diagnostic" => Self::Diagnostic,
            _ => Self::Other(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_owned()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Role
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One element of a message's ordered content sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        budget_tokens: Option<u64>,
    },

    #[serde(rename = "code")]
    Code { language: String, code: String },

    #[serde(rename = "image")]
    Image { source: ImageSource },

    #[serde(rename = "refusal")]
    Refusal { refusal: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build a tool_result block.  Array content is JSON-stringified before
    /// storage; plain strings pass through.
    pub fn tool_result(tool_use_id: impl Into<String>, content: &Value, is_error: Option<bool>) -> Self {
        let content = match content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error,
        }
    }

    pub fn base64_image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource {
                source_type: "base64".into(),
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unified message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single internal message representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    /// Milliseconds since epoch.  Not required to be monotonic per session.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Open, adapter-dependent payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl UnifiedMessage {
    pub fn new(kind: MessageType, role: Role) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            role,
            content: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// A user message with a single text block.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(MessageType::UserMessage, Role::User)
            .with_content(vec![ContentBlock::text(text)])
    }

    /// A synthetic error result, used when a backend operation fails and the
    /// failure must surface on the message stream instead of a return value.
    pub fn error_result(message: impl Into<String>) -> Self {
        Self::new(MessageType::Result, Role::System)
            .with_meta("is_error", Value::Bool(true))
            .with_meta("error_message", Value::String(message.into()))
    }

    /// Concatenated text of every text block.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrip() {
        for raw in [
            "session_init",
            "status_change",
            "assistant",
            "user_message",
            "result",
            "stream_event",
            "permission_request",
            "permission_response",
            "interrupt",
            "tool_progress",
            "tool_use_summary",
            "auth_status",
            "configuration_change",
            "session_lifecycle",
            "control_response",
            "keep_alive",
            "control_request",
            "control_cancel_request",
            "diagnostic",
        ] {
            let t = MessageType::from(raw.to_string());
            assert!(!matches!(t, MessageType::Other(_)), "{raw} parsed as Other");
            assert_eq!(t.as_str(), raw);
        }
    }

    #[test]
    fn unknown_type_preserved() {
        let t = MessageType::from("weird_future_type".to_string());
        assert_eq!(t, MessageType::Other("weird_future_type".into()));
        assert_eq!(t.as_str(), "weird_future_type");
    }

    #[test]
    fn message_type_serde_as_string() {
        let json = serde_json::to_string(&MessageType::SessionInit).unwrap();
        assert_eq!(json, "\"session_init\"");
        let back: MessageType = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(back, MessageType::Assistant);
    }

    #[test]
    fn content_block_tagged_serde() {
        let block = ContentBlock::text("hello");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn tool_result_stringifies_arrays() {
        let content = serde_json::json!([{"type": "text", "text": "out"}]);
        let block = ContentBlock::tool_result("t1", &content, None);
        match block {
            ContentBlock::ToolResult { content, .. } => {
                assert_eq!(content, r#"[{"text":"out","type":"text"}]"#);
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn tool_result_passes_strings_through() {
        let content = serde_json::json!("plain output");
        let block = ContentBlock::tool_result("t1", &content, Some(false));
        match block {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert_eq!(content, "plain output");
                assert_eq!(is_error, Some(false));
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn error_result_metadata() {
        let msg = UnifiedMessage::error_result("backend gone");
        assert_eq!(msg.kind, MessageType::Result);
        assert_eq!(msg.meta_bool("is_error"), Some(true));
        assert_eq!(msg.meta_str("error_message"), Some("backend gone"));
    }

    #[test]
    fn text_content_concatenates() {
        let msg = UnifiedMessage::new(MessageType::Assistant, Role::Assistant).with_content(vec![
            ContentBlock::text("a"),
            ContentBlock::ToolUse {
                id: "t".into(),
                name: "Bash".into(),
                input: Value::Null,
            },
            ContentBlock::text("b"),
        ]);
        assert_eq!(msg.text_content(), "ab");
    }

    #[test]
    fn unique_ids() {
        let a = UnifiedMessage::user_text("x");
        let b = UnifiedMessage::user_text("x");
        assert_ne!(a.id, b.id);
    }
}
