//! Child-process supervision for agent CLIs.
//!
//! Spawns backends with a sanitized environment, pipes their output into
//! line events, escalates kills from graceful to forceful, and suppresses
//! restart storms with a failure-windowed circuit breaker.

pub mod breaker;
pub mod env;
pub mod process;

pub use breaker::{BreakerState, CircuitBreaker};
pub use env::sanitized_env;
pub use process::{ProcessSupervisor, SpawnSpec, SupervisorEvent};
