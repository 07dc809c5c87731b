//! JSON-RPC 2.0 framing over newline-delimited JSON.
//!
//! Used by the ACP adapter (and Gemini, which rides on it).  Unlike a plain
//! client, the ACP peer is full duplex: the server sends responses to our
//! requests, its own requests (permission prompts, fs/terminal access), and
//! notifications, all interleaved on one stream.  [`Correlator`] matches
//! responses to in-flight requests; everything else is classified by
//! [`IncomingRpc::classify`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 request we originate.  Ids auto-increment per session
/// starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

/// A response.  `id` is kept as a raw value: responses to server-initiated
/// requests must echo the server's id whatever its JSON type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// `-32601`: the code used to refuse server-initiated methods we do not
/// implement (`fs/*`, `terminal/*`), preserving protocol liveness.
pub const METHOD_NOT_SUPPORTED: i64 = -32601;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incoming classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One parsed line from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingRpc {
    /// Server-initiated request: has both `id` and `method`.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Notification: `method` without `id`.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Response to one of our requests: `id` without `method`.
    Response(JsonRpcResponse),
}

impl IncomingRpc {
    /// Classify a raw JSON line.  Returns `None` for objects that are not
    /// JSON-RPC shaped (callers drop and log those).
    pub fn classify(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        let obj = value.as_object()?;

        let method = obj.get("method").and_then(Value::as_str);
        let id = obj.get("id").cloned();
        let params = obj.get("params").cloned();

        match (method, id) {
            (Some(method), Some(id)) => Some(Self::Request {
                id,
                method: method.to_string(),
                params,
            }),
            (Some(method), None) => Some(Self::Notification {
                method: method.to_string(),
                params,
            }),
            (None, Some(id)) => Some(Self::Response(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id,
                result: obj.get("result").cloned(),
                error: obj
                    .get("error")
                    .cloned()
                    .and_then(|e| serde_json::from_value(e).ok()),
            })),
            (None, None) => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Correlator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-flight request correlation.  Each outgoing request registers a oneshot
/// that the read loop completes when the matching response arrives.
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request id and register a waiter for its response.
    pub fn register(&self) -> (u64, oneshot::Receiver<JsonRpcResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Complete a waiter.  Returns false when the response matches nothing
    /// (already timed out, or not ours).
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.as_u64() else {
            return false;
        };
        match self.pending.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter without completing it (request timed out).
    pub fn forget(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Fail every in-flight request (stream ended).
    pub fn fail_all(&self, code: i64, message: &str) {
        let pending: Vec<_> = {
            let mut map = self.pending.lock();
            map.drain().collect()
        };
        for (id, tx) in pending {
            let _ = tx.send(JsonRpcResponse::failure(Value::from(id), code, message));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let req = JsonRpcRequest::new(1, "initialize", Some(serde_json::json!({"protocolVersion": 1})));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
    }

    #[test]
    fn serialize_notification_without_id() {
        let notif = JsonRpcNotification::new("session/cancel", None);
        let json = serde_json::to_string(&notif).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn classify_response() {
        let line = r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#;
        match IncomingRpc::classify(line).unwrap() {
            IncomingRpc::Response(resp) => {
                assert_eq!(resp.id, Value::from(3));
                assert!(!resp.is_error());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_server_request() {
        let line = r#"{"jsonrpc":"2.0","id":"srv-1","method":"session/request_permission","params":{}}"#;
        match IncomingRpc::classify(line).unwrap() {
            IncomingRpc::Request { id, method, .. } => {
                assert_eq!(id, Value::from("srv-1"));
                assert_eq!(method, "session/request_permission");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let line = r#"{"jsonrpc":"2.0","method":"session/update","params":{"kind":"text"}}"#;
        match IncomingRpc::classify(line).unwrap() {
            IncomingRpc::Notification { method, params } => {
                assert_eq!(method, "session/update");
                assert!(params.is_some());
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classify_garbage_returns_none() {
        assert!(IncomingRpc::classify("not json").is_none());
        assert!(IncomingRpc::classify("{}").is_none());
        assert!(IncomingRpc::classify("[1,2,3]").is_none());
    }

    #[test]
    fn correlator_ids_start_at_one() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register();
        assert_eq!(id, 1);
        let (id, _rx2) = correlator.register();
        assert_eq!(id, 2);
    }

    #[tokio::test]
    async fn correlator_completes_matching_waiter() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();

        let resp = JsonRpcResponse::success(Value::from(id), serde_json::json!({"done": true}));
        assert!(correlator.complete(resp));

        let received = rx.await.unwrap();
        assert_eq!(received.into_result().unwrap()["done"], true);
        assert_eq!(correlator.in_flight(), 0);
    }

    #[test]
    fn correlator_ignores_unknown_response() {
        let correlator = Correlator::new();
        let resp = JsonRpcResponse::success(Value::from(99u64), Value::Null);
        assert!(!correlator.complete(resp));
    }

    #[tokio::test]
    async fn fail_all_drains_pending() {
        let correlator = Correlator::new();
        let (_id, rx) = correlator.register();
        correlator.fail_all(-32000, "stream closed");
        let resp = rx.await.unwrap();
        assert!(resp.is_error());
        assert_eq!(correlator.in_flight(), 0);
    }

    #[test]
    fn error_response_shape() {
        let resp = JsonRpcResponse::failure(Value::from("x"), METHOD_NOT_SUPPORTED, "Method not supported");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], -32601);
        assert_eq!(json["id"], "x");
        assert!(json.get("result").is_none());
    }
}
