//! Backend adapters for BeamCode.
//!
//! Each adapter normalizes one external agent protocol (Claude SDK-URL,
//! in-process Agent SDK, ACP over stdio, Gemini, OpenCode REST+SSE, Codex
//! WebSocket) into a bidirectional [`UnifiedMessage`] session behind the
//! [`BackendAdapter`] / [`BackendSession`] contract.
//!
//! [`UnifiedMessage`]: bc_domain::UnifiedMessage

pub mod acp;
pub mod agent_sdk;
pub mod claude;
pub mod cli_wire;
pub mod codex;
pub mod gemini;
pub mod jsonrpc;
pub mod ndjson;
pub mod opencode;
pub mod queue;
pub mod registry;
pub mod traits;

pub use queue::MessageQueue;
pub use registry::AdapterRegistry;
pub use traits::{
    AdapterCapabilities, Availability, BackendAdapter, BackendSession, ConnectOptions,
};
