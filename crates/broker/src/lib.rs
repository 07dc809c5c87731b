//! The BeamCode session broker.
//!
//! Multiplexes AI coding-agent CLIs behind one uniform consumer protocol:
//! many WebSocket consumers in, exactly one live backend session per session
//! id, fan-out with per-consumer delivery queues, and full lifecycle
//! management of the underlying agent process.

pub mod cli;
pub mod consumers;
pub mod runtime;
pub mod state;
