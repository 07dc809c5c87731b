//! T1: consumer wire → unified.
//!
//! Only the backend-destined message types pass through here; slash
//! commands, the queue family, and presence queries are handled locally by
//! the bridge before normalization.

use serde_json::{json, Value};

use bc_domain::consumer::{InboundImage, InboundMessage, PermissionBehavior};
use bc_domain::message::{ContentBlock, MessageType, Role, UnifiedMessage};

/// Build the content blocks for a user message with optional images.
pub fn user_content(content: &str, images: Option<&[InboundImage]>) -> Vec<ContentBlock> {
    let mut blocks = vec![ContentBlock::text(content)];
    if let Some(images) = images {
        for image in images {
            blocks.push(ContentBlock::base64_image(
                image.media_type.clone(),
                image.data.clone(),
            ));
        }
    }
    blocks
}

/// Normalize one backend-destined inbound message.  Returns `None` for
/// message types the bridge handles locally.
pub fn normalize(inbound: &InboundMessage) -> Option<UnifiedMessage> {
    match inbound {
        InboundMessage::UserMessage {
            content, images, ..
        } => Some(
            UnifiedMessage::new(MessageType::UserMessage, Role::User)
                .with_content(user_content(content, images.as_deref())),
        ),
        InboundMessage::PermissionResponse {
            request_id,
            behavior,
            updated_input,
            updated_permissions,
            message,
        } => {
            let behavior = match behavior {
                PermissionBehavior::Allow => "allow",
                PermissionBehavior::Deny => "deny",
            };
            let mut msg = UnifiedMessage::new(MessageType::PermissionResponse, Role::User)
                .with_meta("request_id", json!(request_id))
                .with_meta("behavior", json!(behavior));
            if let Some(updated_input) = updated_input {
                msg.metadata
                    .insert("updated_input".into(), updated_input.clone());
            }
            if let Some(updated_permissions) = updated_permissions {
                msg.metadata
                    .insert("updated_permissions".into(), updated_permissions.clone());
            }
            if let Some(message) = message {
                msg.metadata
                    .insert("message".into(), Value::String(message.clone()));
            }
            Some(msg)
        }
        InboundMessage::Interrupt => {
            Some(UnifiedMessage::new(MessageType::Interrupt, Role::User))
        }
        InboundMessage::SetModel { model } => Some(
            UnifiedMessage::new(MessageType::ControlRequest, Role::User)
                .with_meta("subtype", json!("set_model"))
                .with_meta("model", json!(model)),
        ),
        InboundMessage::SetPermissionMode { mode } => Some(
            UnifiedMessage::new(MessageType::ControlRequest, Role::User)
                .with_meta("subtype", json!("set_permission_mode"))
                .with_meta("mode", json!(mode)),
        ),
        // Locally handled families.
        InboundMessage::SlashCommand { .. }
        | InboundMessage::QueueMessage { .. }
        | InboundMessage::UpdateQueuedMessage { .. }
        | InboundMessage::CancelQueuedMessage
        | InboundMessage::PresenceQuery
        | InboundMessage::SetAdapter { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_text_survives() {
        let inbound = InboundMessage::UserMessage {
            content: "hello world".into(),
            session_id: None,
            images: None,
        };
        let msg = normalize(&inbound).unwrap();
        assert_eq!(msg.kind, MessageType::UserMessage);
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text_content(), "hello world");
    }

    #[test]
    fn images_become_blocks() {
        let inbound = InboundMessage::UserMessage {
            content: "see".into(),
            session_id: None,
            images: Some(vec![InboundImage {
                media_type: "image/png".into(),
                data: "aGk=".into(),
            }]),
        };
        let msg = normalize(&inbound).unwrap();
        assert_eq!(msg.content.len(), 2);
        assert!(matches!(msg.content[1], ContentBlock::Image { .. }));
    }

    #[test]
    fn permission_response_fields_survive() {
        let inbound = InboundMessage::PermissionResponse {
            request_id: "r1".into(),
            behavior: PermissionBehavior::Allow,
            updated_input: Some(json!({"command": "ls -a"})),
            updated_permissions: None,
            message: None,
        };
        let msg = normalize(&inbound).unwrap();
        assert_eq!(msg.kind, MessageType::PermissionResponse);
        assert_eq!(msg.meta_str("request_id"), Some("r1"));
        assert_eq!(msg.meta_str("behavior"), Some("allow"));
        assert_eq!(msg.metadata["updated_input"]["command"], "ls -a");
    }

    #[test]
    fn interrupt_survives() {
        let msg = normalize(&InboundMessage::Interrupt).unwrap();
        assert_eq!(msg.kind, MessageType::Interrupt);
    }

    #[test]
    fn set_model_becomes_control_request() {
        let msg = normalize(&InboundMessage::SetModel {
            model: "claude-opus-4".into(),
        })
        .unwrap();
        assert_eq!(msg.kind, MessageType::ControlRequest);
        assert_eq!(msg.meta_str("subtype"), Some("set_model"));
        assert_eq!(msg.meta_str("model"), Some("claude-opus-4"));
    }

    #[test]
    fn local_families_return_none() {
        assert!(normalize(&InboundMessage::PresenceQuery).is_none());
        assert!(normalize(&InboundMessage::CancelQueuedMessage).is_none());
        assert!(normalize(&InboundMessage::SlashCommand {
            command: "/help".into()
        })
        .is_none());
    }
}
