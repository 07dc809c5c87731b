//! WebSocket endpoints.
//!
//! Flow for consumers:
//! 1. Consumer connects to `/v1/consumers/ws?session_id=…&token=…`
//! 2. The bridge authenticates and attaches the socket
//! 3. One select loop owns the socket: inbound frames feed the bridge,
//!    outbound deliveries drain from the consumer's writer channel
//!
//! The second endpoint, `/v1/cli/ws/{session_id}`, is the connect-back
//! socket for CLI-launched backends (Claude SDK-URL): the CLI attaches and
//! its frames flow straight into the waiting adapter session.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use bc_domain::consumer::{ConsumerRole, MAX_INBOUND_FRAME_BYTES};
use bc_domain::error::Error;

use crate::consumers::gatekeeper::AuthContext;
use crate::runtime::bridge::FrameOutcome;
use crate::runtime::coordinator::CreateSessionParams;
use crate::state::AppState;

/// Close code for oversized inbound frames.
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
/// Close code for failed authentication.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code when the session is deleted out from under the consumer.
const CLOSE_NORMAL: u16 = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consumer endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ConsumerQuery {
    pub session_id: String,
    pub token: Option<String>,
    /// `participant` (default) or `observer`.
    pub role: Option<String>,
    /// Replay cursor for reconnects.
    pub last_seen_seq: Option<u64>,
}

/// GET /v1/consumers/ws: upgrade a consumer connection.
pub async fn consumer_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConsumerQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_consumer_socket(socket, state, query))
}

async fn handle_consumer_socket(socket: WebSocket, state: AppState, query: ConsumerQuery) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let session_id = query.session_id.clone();

    let role_hint = match query.role.as_deref() {
        Some("observer") => Some(ConsumerRole::Observer),
        Some("participant") => Some(ConsumerRole::Participant),
        _ => None,
    };
    let ctx = AuthContext {
        session_id: session_id.clone(),
        token: query.token.clone(),
        role_hint,
        remote_addr: None,
    };

    // Writer channel: the bridge drains delivery queues into this.
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();

    let bridge = state.coordinator.bridge().clone();
    let consumer_id = match bridge
        .attach_consumer(ctx, query.last_seen_seq, writer_tx)
        .await
    {
        Ok(consumer_id) => consumer_id,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "consumer rejected");
            let _ = ws_sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        }
    };

    // One task owns the sink: outbound deliveries and protocol-level closes
    // are serialized through the same select loop.
    loop {
        tokio::select! {
            delivery = writer_rx.recv() => {
                let Some(json) = delivery else {
                    // Delivery side gone: the session was closed.
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: "session closed".into(),
                        })))
                        .await;
                    break;
                };
                if ws_sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            frame = ws_stream.next() => {
                let Some(Ok(msg)) = frame else { break };
                match msg {
                    Message::Text(text) => {
                        match bridge
                            .handle_consumer_frame(&session_id, consumer_id, &text)
                            .await
                        {
                            Ok(FrameOutcome::Handled) => {}
                            Ok(FrameOutcome::SetAdapter {
                                adapter_name,
                                adapter_options,
                            }) => {
                                let result = state
                                    .coordinator
                                    .switch_adapter(&session_id, &adapter_name, adapter_options)
                                    .await;
                                if let Err(e) = result {
                                    tracing::warn!(
                                        session_id = %session_id,
                                        adapter = %adapter_name,
                                        error = %e,
                                        "adapter switch failed"
                                    );
                                }
                            }
                            Err(Error::Protocol(_)) => {
                                debug_assert!(text.len() > MAX_INBOUND_FRAME_BYTES);
                                let _ = ws_sink
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CLOSE_MESSAGE_TOO_BIG,
                                        reason: "message too big".into(),
                                    })))
                                    .await;
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(session_id = %session_id, error = %e, "frame handling failed");
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    bridge.detach_consumer(&session_id, consumer_id);
    tracing::info!(session_id = %session_id, consumer_id, "consumer disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI connect-back endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /v1/cli/ws/{session_id}: the launched CLI dials back here.
pub async fn cli_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_cli_socket(socket, state, session_id))
}

async fn handle_cli_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let claude = state.coordinator.claude().clone();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    if let Err(e) = claude.attach_transport(&session_id, outbound_tx) {
        tracing::warn!(session_id = %session_id, error = %e, "CLI socket for unknown session");
        let _ = ws_sink.close().await;
        return;
    }
    // Connect-back counts as the readiness signal for the spawned CLI.
    state.coordinator.cli_connected(&session_id);
    tracing::info!(session_id = %session_id, "CLI connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => claude.ingest(&session_id, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    claude.transport_closed(&session_id);
    writer.abort();
    tracing::info!(session_id = %session_id, "CLI disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REST session management
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionBody {
    pub adapter_name: Option<String>,
    pub adapter_options: Option<serde_json::Value>,
    #[serde(default)]
    pub resume: bool,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
}

/// POST /v1/sessions: create a session.
pub async fn create_session(
    State(state): State<AppState>,
    body: Option<axum::Json<CreateSessionBody>>,
) -> impl IntoResponse {
    let body = body.map(|b| b.0).unwrap_or_default();
    let params = CreateSessionParams {
        adapter_name: body.adapter_name,
        adapter_options: body.adapter_options,
        resume: body.resume,
        cwd: body.cwd,
        model: body.model,
        session_id: body.session_id,
    };
    match state.coordinator.create_session(params).await {
        Ok(session_id) => (
            axum::http::StatusCode::OK,
            axum::Json(serde_json::json!({"session_id": session_id})),
        ),
        Err(e) => (
            axum::http::StatusCode::BAD_GATEWAY,
            axum::Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

/// GET /v1/sessions: list session snapshots.
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.coordinator.list_sessions())
}

/// GET /v1/sessions/{id}: one snapshot.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.get_session(&session_id) {
        Some(snapshot) => axum::Json(serde_json::json!(snapshot)).into_response(),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({"error": "unknown session"})),
        )
            .into_response(),
    }
}

/// DELETE /v1/sessions/{id}.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let deleted = state.coordinator.delete_session(&session_id).await;
    axum::Json(serde_json::json!({"deleted": deleted}))
}

/// Build the axum router for all broker endpoints.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/v1/consumers/ws", axum::routing::get(consumer_ws))
        .route("/v1/cli/ws/:session_id", axum::routing::get(cli_ws))
        .route(
            "/v1/sessions",
            axum::routing::post(create_session).get(list_sessions),
        )
        .route(
            "/v1/sessions/:session_id",
            axum::routing::get(get_session).delete(delete_session),
        )
        .with_state(state)
}
