//! Shared types for the BeamCode session broker.
//!
//! Everything that crosses a crate boundary lives here: the unified message
//! model every backend adapter normalizes into, the consumer wire protocol,
//! per-session state, broker configuration, the shared error type, and the
//! typed lifecycle events the bridge emits.

pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod message;
pub mod state;
pub mod stream;

pub use config::BrokerConfig;
pub use consumer::{
    ConsumerIdentity, ConsumerMessage, ConsumerRole, InboundMessage, SequencedMessage,
};
pub use error::{Error, Result};
pub use events::BridgeEvent;
pub use message::{ContentBlock, MessageType, Role, UnifiedMessage};
pub use state::{Capabilities, SessionState, SessionStatus};
pub use stream::{BoxStream, MessageStream};
