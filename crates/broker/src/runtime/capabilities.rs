//! Capability handshake.
//!
//! Exactly once per backend connect, the bridge sends a
//! `control_request { subtype: "initialize" }` and arms a timeout.  A
//! matching success response stores capabilities and feeds the slash
//! registry; an error response synthesizes minimal capabilities from
//! `slash_commands` when possible; a late response is ignored outright.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use bc_domain::consumer::ConsumerMessage;
use bc_domain::events::BridgeEvent;
use bc_domain::message::{MessageType, Role, UnifiedMessage};
use bc_domain::state::{Capabilities, CommandInfo};

use crate::runtime::bridge::SessionBridge;
use crate::runtime::session::{PendingInitialize, Session, SessionEntry};

impl SessionBridge {
    /// Send the initialize control request.  A duplicate call while one is
    /// pending is a no-op.
    pub(crate) fn send_initialize_request(&self, entry: &Arc<SessionEntry>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let session_id = {
            let mut session = entry.inner.lock();
            if session.pending_initialize.is_some() {
                return;
            }
            let Some(backend) = session.backend.clone() else {
                return;
            };
            session.pending_initialize = Some(PendingInitialize {
                request_id: request_id.clone(),
            });

            let msg = UnifiedMessage::new(MessageType::ControlRequest, Role::System)
                .with_meta("request_id", json!(request_id))
                .with_meta("subtype", json!("initialize"));
            if let Err(e) = backend.send(msg) {
                tracing::warn!(
                    session_id = %session.session_id(),
                    error = %e,
                    "failed to send initialize request"
                );
            }
            session.session_id().to_owned()
        };

        // Timeout watchdog: fires only while this request is still pending.
        let bridge = self.clone();
        let timer_entry = entry.clone();
        let timeout = Duration::from_millis(self.config().sessions.initialize_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut session = timer_entry.inner.lock();
            let still_pending = session
                .pending_initialize
                .as_ref()
                .map(|p| p.request_id == request_id)
                .unwrap_or(false);
            if still_pending {
                session.pending_initialize = None;
                bridge
                    .hub()
                    .emit(BridgeEvent::CapabilitiesTimeout { session_id });
            }
        });
    }

    /// Handle a `control_response`.  Responses that do not match the pending
    /// initialize request, including responses arriving after the timeout,
    /// are ignored and never stored retroactively.
    pub(crate) fn handle_control_response(&self, session: &mut Session, msg: &UnifiedMessage) {
        let Some(response) = msg.metadata.get("response") else {
            return;
        };
        let request_id = response.get("request_id").and_then(Value::as_str);
        let matches = match (&session.pending_initialize, request_id) {
            (Some(pending), Some(rid)) => pending.request_id == rid,
            _ => false,
        };
        if !matches {
            tracing::debug!(
                session_id = %session.session_id(),
                "control_response without matching pending initialize, ignoring"
            );
            return;
        }
        session.pending_initialize = None;

        match response.get("subtype").and_then(Value::as_str) {
            Some("success") => {
                let body = response.get("response").cloned().unwrap_or(Value::Null);
                let capabilities = Capabilities {
                    commands: body
                        .get("commands")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default(),
                    models: body
                        .get("models")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default(),
                    account: body.get("account").cloned(),
                    received_at: chrono::Utc::now().timestamp_millis(),
                };
                self.store_capabilities(session, capabilities);
            }
            Some("error") => {
                // Fall back to the init-reported command names, unless real
                // capabilities were already stored.
                if session.state.slash_commands.is_empty()
                    || session.state.capabilities.is_some()
                {
                    return;
                }
                let commands: Vec<CommandInfo> = session
                    .state
                    .slash_commands
                    .iter()
                    .map(|name| CommandInfo {
                        name: name.clone(),
                        description: String::new(),
                    })
                    .collect();
                let capabilities = Capabilities {
                    commands,
                    models: Vec::new(),
                    account: None,
                    received_at: chrono::Utc::now().timestamp_millis(),
                };
                self.store_capabilities(session, capabilities);
            }
            other => {
                tracing::debug!(subtype = ?other, "unrecognized control_response subtype");
            }
        }
    }

    fn store_capabilities(&self, session: &mut Session, capabilities: Capabilities) {
        session.registry.register_all(&capabilities.commands);
        session.state.capabilities = Some(capabilities.clone());

        let command_count = capabilities.commands.len();
        let msg = ConsumerMessage::CapabilitiesReady { capabilities };
        self.broadcast(session, msg);
        self.hub().emit(BridgeEvent::CapabilitiesReady {
            session_id: session.session_id().to_owned(),
            command_count,
        });
    }
}
