//! Consumer-facing plumbing: authentication, rate limiting, delivery
//! queues, and the WebSocket endpoints.

pub mod delivery;
pub mod gatekeeper;
pub mod limiter;
pub mod ws;

pub use delivery::DeliveryChannel;
pub use gatekeeper::{AuthContext, ConsumerAuthenticator, TokenAuthenticator};
pub use limiter::TokenBucket;
