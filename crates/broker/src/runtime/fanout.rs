//! T4: unified → consumer wire.
//!
//! Maps each backend-originated unified message to zero or more consumer
//! messages.  Adapter-internal types produce nothing; unknown types forward
//! transparently as raw passthrough objects.

use serde_json::{Map, Value};

use bc_domain::consumer::ConsumerMessage;
use bc_domain::message::{MessageType, UnifiedMessage};
use bc_domain::state::SessionState;

fn metadata_object(msg: &UnifiedMessage) -> Value {
    Value::Object(msg.metadata.clone())
}

/// Map one unified message into consumer messages, given the post-reduce
/// session state.
pub fn fanout(state: &SessionState, msg: &UnifiedMessage) -> Vec<ConsumerMessage> {
    match &msg.kind {
        MessageType::SessionInit => vec![ConsumerMessage::SessionInit {
            state: state.clone(),
        }],
        MessageType::StatusChange => vec![ConsumerMessage::StatusChange {
            status: msg.meta_str("status").unwrap_or("unknown").to_owned(),
            permission_mode: msg.meta_str("permissionMode").map(str::to_owned),
        }],
        MessageType::Assistant => {
            let message = msg
                .metadata
                .get("message")
                .cloned()
                .unwrap_or_else(|| {
                    serde_json::json!({
                        "role": "assistant",
                        "content": msg.content,
                    })
                });
            vec![ConsumerMessage::Assistant { message }]
        }
        MessageType::Result => vec![ConsumerMessage::Result {
            result: metadata_object(msg),
        }],
        MessageType::StreamEvent => vec![ConsumerMessage::StreamEvent {
            event: msg.metadata.get("event").cloned().unwrap_or(Value::Null),
        }],
        MessageType::PermissionRequest => vec![ConsumerMessage::PermissionRequest {
            request_id: msg.meta_str("request_id").unwrap_or("").to_owned(),
            tool_name: msg.meta_str("tool_name").unwrap_or("tool").to_owned(),
            input: msg.metadata.get("input").cloned().unwrap_or(Value::Null),
            suggestions: msg.metadata.get("permission_suggestions").cloned(),
            description: msg.meta_str("description").map(str::to_owned),
            tool_use_id: msg.meta_str("tool_use_id").unwrap_or("").to_owned(),
            agent_id: msg.meta_str("agent_id").map(str::to_owned),
        }],
        MessageType::ToolProgress => vec![ConsumerMessage::ToolProgress {
            progress: metadata_object(msg),
        }],
        MessageType::ToolUseSummary => vec![ConsumerMessage::ToolUseSummary {
            summary: metadata_object(msg),
        }],
        MessageType::AuthStatus => vec![ConsumerMessage::AuthStatus {
            status: metadata_object(msg),
        }],
        MessageType::ConfigurationChange => vec![ConsumerMessage::ConfigurationChange {
            change: metadata_object(msg),
        }],
        MessageType::SessionLifecycle => vec![ConsumerMessage::SessionLifecycle {
            event: metadata_object(msg),
        }],
        // Adapter-internal and inbound-only types never reach consumers.
        MessageType::ControlResponse
        | MessageType::ControlRequest
        | MessageType::ControlCancelRequest
        | MessageType::Diagnostic
        | MessageType::KeepAlive
        | MessageType::UserMessage
        | MessageType::PermissionResponse
        | MessageType::Interrupt => Vec::new(),
        // Unknown adapter output forwards transparently.
        MessageType::Other(tag) => {
            let mut obj = Map::new();
            obj.insert("type".into(), Value::String(tag.clone()));
            for (key, value) in &msg.metadata {
                obj.insert(key.clone(), value.clone());
            }
            if !msg.content.is_empty() {
                obj.insert(
                    "content".into(),
                    serde_json::to_value(&msg.content).unwrap_or(Value::Null),
                );
            }
            vec![ConsumerMessage::Passthrough(Value::Object(obj))]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::message::Role;
    use serde_json::json;

    fn state() -> SessionState {
        let mut s = SessionState::new("s1");
        s.model = Some("sonnet".into());
        s
    }

    #[test]
    fn session_init_carries_state_snapshot() {
        let msg = UnifiedMessage::new(MessageType::SessionInit, Role::System);
        let out = fanout(&state(), &msg);
        assert_eq!(out.len(), 1);
        match &out[0] {
            ConsumerMessage::SessionInit { state } => {
                assert_eq!(state.model.as_deref(), Some("sonnet"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keep_alive_produces_nothing() {
        let msg = UnifiedMessage::new(MessageType::KeepAlive, Role::System);
        assert!(fanout(&state(), &msg).is_empty());
    }

    #[test]
    fn control_types_stay_internal() {
        for kind in [
            MessageType::ControlResponse,
            MessageType::ControlRequest,
            MessageType::PermissionResponse,
            MessageType::Interrupt,
        ] {
            let msg = UnifiedMessage::new(kind, Role::System);
            assert!(fanout(&state(), &msg).is_empty());
        }
    }

    #[test]
    fn permission_request_maps_fields() {
        let msg = UnifiedMessage::new(MessageType::PermissionRequest, Role::System)
            .with_meta("request_id", json!("r1"))
            .with_meta("tool_name", json!("Bash"))
            .with_meta("input", json!({"command": "ls"}))
            .with_meta("tool_use_id", json!("t1"));
        let out = fanout(&state(), &msg);
        match &out[0] {
            ConsumerMessage::PermissionRequest {
                request_id,
                tool_name,
                input,
                tool_use_id,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(tool_name, "Bash");
                assert_eq!(input["command"], "ls");
                assert_eq!(tool_use_id, "t1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_forwards_transparently() {
        let msg = UnifiedMessage::new(MessageType::Other("exotic_event".into()), Role::System)
            .with_meta("payload", json!(42));
        let out = fanout(&state(), &msg);
        assert_eq!(out.len(), 1);
        let json = serde_json::to_value(&out[0]).unwrap();
        assert_eq!(json["type"], "exotic_event");
        assert_eq!(json["payload"], 42);
    }

    #[test]
    fn status_change_maps() {
        let msg = UnifiedMessage::new(MessageType::StatusChange, Role::System)
            .with_meta("status", json!("running"));
        let out = fanout(&state(), &msg);
        match &out[0] {
            ConsumerMessage::StatusChange { status, .. } => assert_eq!(status, "running"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
