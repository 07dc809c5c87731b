//! Claude-family CLI wire codec.
//!
//! The Claude Code CLI (and the Codex agent, which speaks the same framing)
//! exchanges newline-delimited JSON: `system/init`, `system/status`,
//! `assistant`, `result`, `stream_event`, `control_request`,
//! `control_response`, `tool_progress`, `tool_use_summary`, `auth_status`,
//! `keep_alive`.  This module holds both translation directions:
//!
//! - [`native_to_unified`] (T3): one wire line → zero or one unified message.
//!   Unrecognized types are dropped and logged; recognized but malformed
//!   lines surface as `result { is_error }`.
//! - [`unified_to_native`] (T2): one unified message → zero or one wire
//!   frame.  Inexpressible types are skipped with a warning by the caller.

use serde_json::{json, Map, Value};

use bc_domain::message::{ContentBlock, MessageType, Role, UnifiedMessage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// T3: native → unified
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Translate one native wire line.  `None` means the line was dropped
/// (unparseable envelope or unrecognized type).
pub fn native_to_unified(line: &str) -> Option<UnifiedMessage> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "dropping unparseable CLI line");
            return None;
        }
    };
    let obj = value.as_object()?;
    let msg_type = obj.get("type").and_then(Value::as_str)?;

    match msg_type {
        "system" => translate_system(obj),
        "assistant" => Some(translate_assistant(obj)),
        "user" => Some(
            UnifiedMessage::new(MessageType::UserMessage, Role::User)
                .with_content(parse_message_content(obj))
                .with_meta("raw", Value::Object(strip_type(obj))),
        ),
        "result" => Some(
            UnifiedMessage::new(MessageType::Result, Role::System)
                .with_metadata_from(strip_type(obj)),
        ),
        "stream_event" => Some(
            UnifiedMessage::new(MessageType::StreamEvent, Role::Assistant)
                .with_meta("event", obj.get("event").cloned().unwrap_or(Value::Null)),
        ),
        "control_request" => Some(translate_control_request(obj)),
        "control_response" => Some(
            UnifiedMessage::new(MessageType::ControlResponse, Role::System)
                .with_meta("response", obj.get("response").cloned().unwrap_or(Value::Null)),
        ),
        "control_cancel_request" => Some(
            UnifiedMessage::new(MessageType::ControlCancelRequest, Role::System)
                .with_metadata_from(strip_type(obj)),
        ),
        "tool_progress" => Some(
            UnifiedMessage::new(MessageType::ToolProgress, Role::Tool)
                .with_metadata_from(strip_type(obj)),
        ),
        "tool_use_summary" => Some(
            UnifiedMessage::new(MessageType::ToolUseSummary, Role::Tool)
                .with_metadata_from(strip_type(obj)),
        ),
        "auth_status" => Some(
            UnifiedMessage::new(MessageType::AuthStatus, Role::System)
                .with_metadata_from(strip_type(obj)),
        ),
        "keep_alive" => Some(UnifiedMessage::new(MessageType::KeepAlive, Role::System)),
        other => {
            tracing::debug!(msg_type = %other, "dropping unrecognized CLI message type");
            None
        }
    }
}

fn translate_system(obj: &Map<String, Value>) -> Option<UnifiedMessage> {
    match obj.get("subtype").and_then(Value::as_str) {
        Some("init") => Some(
            UnifiedMessage::new(MessageType::SessionInit, Role::System)
                .with_metadata_from(strip_keys(obj, &["type", "subtype"])),
        ),
        Some("status") => Some(
            UnifiedMessage::new(MessageType::StatusChange, Role::System)
                .with_metadata_from(strip_keys(obj, &["type", "subtype"])),
        ),
        other => {
            tracing::debug!(subtype = ?other, "dropping unrecognized system subtype");
            None
        }
    }
}

fn translate_assistant(obj: &Map<String, Value>) -> UnifiedMessage {
    let Some(message) = obj.get("message") else {
        return UnifiedMessage::error_result("assistant frame without message");
    };
    UnifiedMessage::new(MessageType::Assistant, Role::Assistant)
        .with_content(parse_message_content(obj))
        .with_meta("message", message.clone())
}

fn translate_control_request(obj: &Map<String, Value>) -> UnifiedMessage {
    let request_id = obj
        .get("request_id")
        .cloned()
        .unwrap_or(Value::Null);
    let request = obj.get("request").and_then(Value::as_object);

    // Permission prompts arrive as control requests; everything else stays
    // adapter-internal.
    let subtype = request.and_then(|r| r.get("subtype")).and_then(Value::as_str);
    if subtype.is_none() || subtype == Some("can_use_tool") {
        let Some(request) = request else {
            return UnifiedMessage::error_result("control_request without request body");
        };
        let mut msg = UnifiedMessage::new(MessageType::PermissionRequest, Role::System)
            .with_meta("request_id", request_id);
        for key in [
            "tool_name",
            "input",
            "permission_suggestions",
            "description",
            "tool_use_id",
            "agent_id",
        ] {
            if let Some(value) = request.get(key) {
                msg.metadata.insert(key.to_string(), value.clone());
            }
        }
        return msg;
    }

    UnifiedMessage::new(MessageType::ControlRequest, Role::System)
        .with_meta("request_id", request_id)
        .with_meta(
            "request",
            request.cloned().map(Value::Object).unwrap_or(Value::Null),
        )
}

/// Parse `message.content` into content blocks.  A bare string becomes one
/// text block; unknown block types are skipped.
fn parse_message_content(obj: &Map<String, Value>) -> Vec<ContentBlock> {
    let Some(content) = obj.get("message").and_then(|m| m.get("content")) else {
        return Vec::new();
    };
    match content {
        Value::String(text) => vec![ContentBlock::text(text.clone())],
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| serde_json::from_value::<ContentBlock>(b.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

fn strip_type(obj: &Map<String, Value>) -> Map<String, Value> {
    strip_keys(obj, &["type"])
}

fn strip_keys(obj: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    obj.iter()
        .filter(|(k, _)| !keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

trait WithMetadata {
    fn with_metadata_from(self, map: Map<String, Value>) -> Self;
}

impl WithMetadata for UnifiedMessage {
    fn with_metadata_from(mut self, map: Map<String, Value>) -> Self {
        self.metadata = map;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// T2: unified → native
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Translate one unified message to a wire frame.  `None` means the adapter
/// cannot express the type (the caller logs and ignores).
pub fn unified_to_native(msg: &UnifiedMessage, session_id: &str) -> Option<String> {
    let frame = match &msg.kind {
        MessageType::UserMessage => Some(user_frame(msg, session_id)),
        MessageType::PermissionResponse => permission_response_frame(msg),
        MessageType::Interrupt => Some(control_request_frame(
            &uuid::Uuid::new_v4().to_string(),
            json!({"subtype": "interrupt"}),
        )),
        MessageType::ControlRequest => {
            let request_id = msg
                .meta_str("request_id")
                .map(str::to_owned)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut request = Map::new();
            if let Some(subtype) = msg.meta_str("subtype") {
                request.insert("subtype".into(), Value::String(subtype.into()));
            }
            for (key, value) in &msg.metadata {
                if key != "request_id" && key != "subtype" {
                    request.insert(key.clone(), value.clone());
                }
            }
            Some(control_request_frame(&request_id, Value::Object(request)))
        }
        _ => None,
    };
    frame.map(|f| f.to_string())
}

/// The CLI user frame, bit-exact:
/// `{"type":"user","message":{"role":"user","content":…},"parent_tool_use_id":null,"session_id":…}`.
fn user_frame(msg: &UnifiedMessage, session_id: &str) -> Value {
    let only_text = msg
        .content
        .iter()
        .all(|b| matches!(b, ContentBlock::Text { .. }));
    let content = if only_text {
        Value::String(msg.text_content())
    } else {
        serde_json::to_value(&msg.content).unwrap_or(Value::Array(vec![]))
    };
    json!({
        "type": "user",
        "message": {"role": "user", "content": content},
        "parent_tool_use_id": Value::Null,
        "session_id": session_id,
    })
}

fn permission_response_frame(msg: &UnifiedMessage) -> Option<Value> {
    let request_id = msg.meta_str("request_id")?;
    let behavior = msg.meta_str("behavior").unwrap_or("deny");

    let mut response = Map::new();
    response.insert("behavior".into(), Value::String(behavior.into()));
    if let Some(updated_input) = msg.metadata.get("updated_input") {
        response.insert("updatedInput".into(), updated_input.clone());
    }
    if let Some(updated_permissions) = msg.metadata.get("updated_permissions") {
        response.insert("updatedPermissions".into(), updated_permissions.clone());
    }
    if let Some(message) = msg.metadata.get("message") {
        response.insert("message".into(), message.clone());
    }

    Some(json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": Value::Object(response),
        },
    }))
}

fn control_request_frame(request_id: &str, request: Value) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": request,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_becomes_session_init() {
        let line = r#"{"type":"system","subtype":"init","model":"claude-sonnet-4-5","cwd":"/tmp","tools":["Bash"],"session_id":"up-1"}"#;
        let msg = native_to_unified(line).unwrap();
        assert_eq!(msg.kind, MessageType::SessionInit);
        assert_eq!(msg.meta_str("model"), Some("claude-sonnet-4-5"));
        assert_eq!(msg.meta_str("cwd"), Some("/tmp"));
        assert_eq!(msg.meta_str("session_id"), Some("up-1"));
        assert!(msg.metadata.get("type").is_none());
    }

    #[test]
    fn status_becomes_status_change() {
        let line = r#"{"type":"system","subtype":"status","status":"compacting"}"#;
        let msg = native_to_unified(line).unwrap();
        assert_eq!(msg.kind, MessageType::StatusChange);
        assert_eq!(msg.meta_str("status"), Some("compacting"));
    }

    #[test]
    fn assistant_parses_content_blocks() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi"},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let msg = native_to_unified(line).unwrap();
        assert_eq!(msg.kind, MessageType::Assistant);
        assert_eq!(msg.content.len(), 2);
        assert_eq!(msg.text_content(), "hi");
        assert!(msg.metadata.contains_key("message"));
    }

    #[test]
    fn assistant_without_message_is_error_result() {
        let msg = native_to_unified(r#"{"type":"assistant"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Result);
        assert_eq!(msg.meta_bool("is_error"), Some(true));
    }

    #[test]
    fn result_keeps_counters() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"num_turns":3,"total_cost_usd":0.12}"#;
        let msg = native_to_unified(line).unwrap();
        assert_eq!(msg.kind, MessageType::Result);
        assert_eq!(msg.meta_u64("num_turns"), Some(3));
        assert_eq!(msg.meta_f64("total_cost_usd"), Some(0.12));
    }

    #[test]
    fn can_use_tool_becomes_permission_request() {
        let line = r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"t1"}}"#;
        let msg = native_to_unified(line).unwrap();
        assert_eq!(msg.kind, MessageType::PermissionRequest);
        assert_eq!(msg.meta_str("request_id"), Some("r1"));
        assert_eq!(msg.meta_str("tool_name"), Some("Bash"));
        assert_eq!(msg.meta_str("tool_use_id"), Some("t1"));
    }

    #[test]
    fn other_control_request_stays_internal() {
        let line = r#"{"type":"control_request","request_id":"r2","request":{"subtype":"hook_callback"}}"#;
        let msg = native_to_unified(line).unwrap();
        assert_eq!(msg.kind, MessageType::ControlRequest);
    }

    #[test]
    fn unknown_type_dropped() {
        assert!(native_to_unified(r#"{"type":"galactic_event"}"#).is_none());
        assert!(native_to_unified("not json at all").is_none());
    }

    #[test]
    fn keep_alive_translates() {
        let msg = native_to_unified(r#"{"type":"keep_alive"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::KeepAlive);
    }

    #[test]
    fn user_text_frame_is_bit_exact() {
        let msg = UnifiedMessage::user_text("hello");
        let frame = unified_to_native(&msg, "s1").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["role"], "user");
        assert_eq!(value["message"]["content"], "hello");
        assert_eq!(value["parent_tool_use_id"], Value::Null);
        assert_eq!(value["session_id"], "s1");
    }

    #[test]
    fn user_frame_with_image_uses_block_array() {
        let msg = UnifiedMessage::new(MessageType::UserMessage, Role::User).with_content(vec![
            ContentBlock::text("look"),
            ContentBlock::base64_image("image/png", "aGk="),
        ]);
        let frame = unified_to_native(&msg, "s1").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        let content = value["message"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
    }

    #[test]
    fn permission_allow_roundtrip() {
        let msg = UnifiedMessage::new(MessageType::PermissionResponse, Role::User)
            .with_meta("request_id", json!("r1"))
            .with_meta("behavior", json!("allow"))
            .with_meta("updated_input", json!({"command": "ls -a"}));
        let frame = unified_to_native(&msg, "s1").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "control_response");
        assert_eq!(value["response"]["subtype"], "success");
        assert_eq!(value["response"]["request_id"], "r1");
        assert_eq!(value["response"]["response"]["behavior"], "allow");
        assert_eq!(value["response"]["response"]["updatedInput"]["command"], "ls -a");
    }

    #[test]
    fn interrupt_becomes_control_request() {
        let msg = UnifiedMessage::new(MessageType::Interrupt, Role::User);
        let frame = unified_to_native(&msg, "s1").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "control_request");
        assert_eq!(value["request"]["subtype"], "interrupt");
        assert!(value["request_id"].as_str().is_some());
    }

    #[test]
    fn initialize_control_request_keeps_request_id() {
        let msg = UnifiedMessage::new(MessageType::ControlRequest, Role::System)
            .with_meta("request_id", json!("init-1"))
            .with_meta("subtype", json!("initialize"));
        let frame = unified_to_native(&msg, "s1").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["request_id"], "init-1");
        assert_eq!(value["request"]["subtype"], "initialize");
    }

    #[test]
    fn set_model_control_request() {
        let msg = UnifiedMessage::new(MessageType::ControlRequest, Role::User)
            .with_meta("subtype", json!("set_model"))
            .with_meta("model", json!("claude-opus-4"));
        let frame = unified_to_native(&msg, "s1").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["request"]["subtype"], "set_model");
        assert_eq!(value["request"]["model"], "claude-opus-4");
    }

    #[test]
    fn inexpressible_types_return_none() {
        let msg = UnifiedMessage::new(MessageType::KeepAlive, Role::System);
        assert!(unified_to_native(&msg, "s1").is_none());
    }
}
