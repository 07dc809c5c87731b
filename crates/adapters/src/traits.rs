use async_trait::async_trait;
use serde_json::{Map, Value};

use bc_domain::error::{Error, Result};
use bc_domain::message::UnifiedMessage;
use bc_domain::stream::MessageStream;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities & options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Local,
    Remote,
}

/// What a backend adapter can do.  The bridge consults this to decide how to
/// route permissions and slash commands.
#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub permissions: bool,
    pub slash_commands: bool,
    /// When true, unhandled `/commands` are sent to the backend as plain
    /// user messages and the next result cycle is captured as their output.
    pub slash_passthrough: bool,
    pub availability: Availability,
    pub teams: bool,
}

/// Options for [`BackendAdapter::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub session_id: String,
    /// Resume from persisted upstream state instead of starting fresh.
    pub resume: bool,
    /// Previously stored upstream session id, when resuming.
    pub upstream_session_id: Option<String>,
    /// Adapter-specific options, passed through opaquely.
    pub adapter_options: Map<String, Value>,
}

impl ConnectOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A factory for backend sessions speaking one native agent protocol.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable adapter name used in configuration and `set_adapter`.
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Open one live session.  Exactly one backend session per session id
    /// exists at any time; the bridge enforces this.
    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>>;
}

/// A bidirectional handle to one live agent session.
///
/// `send` is a synchronous enqueue and must never block on I/O; failures on
/// the wire surface on the message stream as `result { is_error }`.  The
/// message stream is single-subscriber: the second call to `messages` fails.
#[async_trait]
pub trait BackendSession: Send + Sync {
    fn session_id(&self) -> &str;

    /// Translate the unified message to the native protocol (T2) and enqueue
    /// it.  Types the adapter cannot express are ignored with a warning.
    fn send(&self, msg: UnifiedMessage) -> Result<()>;

    /// Adapter-specific raw bypass.  Most adapters do not support it.
    fn send_raw(&self, _line: &str) -> Result<()> {
        Err(Error::BackendCapability(
            "raw send is not supported by this adapter".into(),
        ))
    }

    /// The adapter's normalized output (T3), until the session closes.
    fn messages(&self) -> Result<MessageStream>;

    /// Whether this adapter natively executes the given slash command.
    fn claims_slash(&self, _command: &str) -> bool {
        false
    }

    /// Execute a natively claimed slash command, returning its rendered body.
    async fn execute_slash(&self, command: &str) -> Result<String> {
        Err(Error::BackendCapability(format!(
            "adapter cannot execute {command} natively"
        )))
    }

    /// Idempotent close.  After close, `send` fails with `SessionClosed` and
    /// the message stream terminates.
    async fn close(&self);
}
