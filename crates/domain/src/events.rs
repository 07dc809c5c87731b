//! Typed lifecycle events emitted by the session bridge.
//!
//! Handlers subscribe through [`EventHub`]; every event is also mirrored into
//! `tracing` as a structured log line so the event stream shows up in normal
//! logs without a subscriber.

use serde::Serialize;
use tokio::sync::broadcast;

/// Structured lifecycle events emitted across the broker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum BridgeEvent {
    SessionCreated {
        session_id: String,
        adapter: String,
    },
    SessionClosed {
        session_id: String,
    },
    SessionFirstTurnCompleted {
        session_id: String,
        first_user_message: Option<String>,
    },
    BackendConnected {
        session_id: String,
        adapter: String,
    },
    BackendDisconnected {
        session_id: String,
        code: Option<i64>,
        reason: Option<String>,
    },
    BackendSessionId {
        session_id: String,
        upstream_session_id: String,
    },
    BackendRelaunchNeeded {
        session_id: String,
        reason: String,
    },
    ConsumerConnected {
        session_id: String,
        user_id: String,
        role: String,
    },
    ConsumerDisconnected {
        session_id: String,
        user_id: String,
    },
    MessageInbound {
        session_id: String,
        message_type: String,
    },
    MessageOutbound {
        session_id: String,
        message_type: String,
    },
    PermissionRequested {
        session_id: String,
        request_id: String,
        tool_name: String,
    },
    PermissionResolved {
        session_id: String,
        request_id: String,
        behavior: String,
    },
    CapabilitiesReady {
        session_id: String,
        command_count: usize,
    },
    CapabilitiesTimeout {
        session_id: String,
    },
    AuthStatus {
        session_id: String,
    },
    AuthFailed {
        session_id: String,
        reason: String,
    },
    SlashCommandExecuted {
        session_id: String,
        command: String,
        source: String,
        duration_ms: u64,
    },
    SlashCommandFailed {
        session_id: String,
        command: String,
        message: String,
    },
    Error {
        session_id: String,
        source: String,
        message: String,
    },
}

impl BridgeEvent {
    /// Session id this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionClosed { session_id }
            | Self::SessionFirstTurnCompleted { session_id, .. }
            | Self::BackendConnected { session_id, .. }
            | Self::BackendDisconnected { session_id, .. }
            | Self::BackendSessionId { session_id, .. }
            | Self::BackendRelaunchNeeded { session_id, .. }
            | Self::ConsumerConnected { session_id, .. }
            | Self::ConsumerDisconnected { session_id, .. }
            | Self::MessageInbound { session_id, .. }
            | Self::MessageOutbound { session_id, .. }
            | Self::PermissionRequested { session_id, .. }
            | Self::PermissionResolved { session_id, .. }
            | Self::CapabilitiesReady { session_id, .. }
            | Self::CapabilitiesTimeout { session_id }
            | Self::AuthStatus { session_id }
            | Self::AuthFailed { session_id, .. }
            | Self::SlashCommandExecuted { session_id, .. }
            | Self::SlashCommandFailed { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }
}

/// Broadcast hub for bridge events.  Handlers are synchronous receivers and
/// must not block the bridge loop; slow subscribers lag and drop.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BridgeEvent) {
        let json = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(session_id = %event.session_id(), bridge_event = %json, "bc_event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        hub.emit(BridgeEvent::SessionClosed {
            session_id: "s1".into(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BridgeEvent::SessionClosed { .. }));
        assert_eq!(event.session_id(), "s1");
    }

    #[test]
    fn emit_without_subscribers_is_ok() {
        let hub = EventHub::default();
        hub.emit(BridgeEvent::CapabilitiesTimeout {
            session_id: "s1".into(),
        });
    }

    #[test]
    fn serializes_with_event_tag() {
        let event = BridgeEvent::BackendDisconnected {
            session_id: "s1".into(),
            code: Some(1006),
            reason: Some("gone".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "BackendDisconnected");
        assert_eq!(json["code"], 1006);
    }
}
