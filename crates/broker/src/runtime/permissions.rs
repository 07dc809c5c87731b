//! Permission request tracking.
//!
//! In-flight permission prompts are correlated by request id: the backend's
//! `permission_request` stores a pending entry and fans out to consumers; a
//! participant's `permission_response` removes it and is routed back through
//! the adapter's native path (Claude control_response frame, ACP JSON-RPC
//! echo, OpenCode REST reply, all inside the adapter's `send`).

use bc_domain::events::BridgeEvent;
use bc_domain::message::UnifiedMessage;

use crate::runtime::bridge::SessionBridge;
use crate::runtime::session::{PendingPermission, Session};

impl SessionBridge {
    /// Store a pending entry for a backend `permission_request`.  Requests
    /// with an unexpected subtype are ignored.
    pub(crate) fn track_permission_request(&self, session: &mut Session, msg: &UnifiedMessage) {
        match msg.meta_str("subtype") {
            None | Some("can_use_tool") => {}
            Some(other) => {
                tracing::debug!(subtype = %other, "ignoring permission request subtype");
                return;
            }
        }
        let Some(request_id) = msg.meta_str("request_id") else {
            tracing::warn!(
                session_id = %session.session_id(),
                "permission request without request_id, dropping"
            );
            return;
        };

        let pending = PendingPermission {
            request_id: request_id.to_owned(),
            tool_name: msg.meta_str("tool_name").unwrap_or("tool").to_owned(),
            input: msg
                .metadata
                .get("input")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            suggestions: msg.metadata.get("permission_suggestions").cloned(),
            description: msg.meta_str("description").map(str::to_owned),
            tool_use_id: msg.meta_str("tool_use_id").unwrap_or("").to_owned(),
            agent_id: msg.meta_str("agent_id").map(str::to_owned),
            timestamp: msg.timestamp,
        };
        let tool_name = pending.tool_name.clone();
        session
            .pending_permissions
            .insert(request_id.to_owned(), pending);

        self.hub().emit(BridgeEvent::PermissionRequested {
            session_id: session.session_id().to_owned(),
            request_id: request_id.to_owned(),
            tool_name,
        });
    }

    /// Remove a pending entry on response.  Returns false when the request
    /// id is unknown (expired or never tracked).
    pub(crate) fn resolve_permission(
        &self,
        session: &mut Session,
        request_id: &str,
        behavior: &str,
    ) -> bool {
        if session.pending_permissions.remove(request_id).is_none() {
            return false;
        }
        self.hub().emit(BridgeEvent::PermissionResolved {
            session_id: session.session_id().to_owned(),
            request_id: request_id.to_owned(),
            behavior: behavior.to_owned(),
        });
        true
    }
}
