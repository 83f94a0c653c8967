//! Clock-synchronized stream playback engine.
//!
//! Connects to a stream server over TCP, keeps the local clock within
//! sub-millisecond agreement with the server's, decodes the audio stream,
//! and renders each chunk at its server-assigned deadline so that every
//! client on the network plays in lockstep.
//!
//! ## Architecture
//! A [`engine::Engine`] owns a supervisor which owns at most one live
//! session. Each session runs its own network, probe, and decode threads
//! plus the sink backend's device thread; the playout buffer is the only
//! structure crossing the real-time boundary.

pub mod clock;
pub mod config;
pub mod decode;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod persist;
pub mod playout;
pub mod settings;
pub mod sink;
pub mod transport;

mod router;
mod session;
mod supervisor;

#[cfg(test)]
mod testutil;

pub use config::{EngineConfig, PlayoutConfig};
pub use diagnostics::DiagnosticsSnapshot;
pub use engine::Engine;
pub use error::ApiError;
pub use supervisor::EngineState;
