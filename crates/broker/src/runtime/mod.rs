//! The session runtime: bridge, coordinator, and their supporting modules.

pub mod bridge;
pub mod capabilities;
pub mod coordinator;
pub mod fanout;
pub mod normalize;
pub mod permissions;
pub mod queue;
pub mod session;
pub mod slash;

pub use bridge::{FrameOutcome, SessionBridge, SessionSeed};
pub use coordinator::{CreateSessionParams, SessionCoordinator};
