/// Shared error type used across all BeamCode crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unrecognized consumer input (bad JSON, unknown message
    /// type, missing required field, oversized frame).
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("authentication: {0}")]
    Authentication(String),

    /// An observer attempted a participant-only message.
    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("rate limit exceeded")]
    RateLimited,

    /// Adapter connect / handshake failure.
    #[error("backend connect: {0}")]
    BackendConnect(String),

    /// The adapter's message stream failed mid-flight.
    #[error("backend stream: {0}")]
    BackendStream(String),

    /// The adapter does not support the requested operation.
    #[error("backend capability: {0}")]
    BackendCapability(String),

    /// `send` was called on a closed backend session.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Restart refused because the circuit breaker is open.
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    /// A `--resume` launch exited before becoming ready.
    #[error("resume failed: {0}")]
    ResumeFailed(String),

    #[error("config: {0}")]
    Config(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
