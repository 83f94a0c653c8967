//! Audio sink boundary.
//!
//! The engine renders through [`FrameSource`]; backends own the OS device
//! and pull from the source on their own real-time cadence. Backends are
//! chosen at construction; there is no runtime registration.

mod cpal_out;
mod null;

pub use cpal_out::{CpalBackend, list_output_devices};
pub use null::NullBackend;

use std::sync::Arc;

use crate::decode::AudioFormat;
use crate::error::SinkError;

/// Pull side of the playout buffer, called from the backend's audio thread.
pub trait FrameSource: Send + Sync {
    fn channels(&self) -> u16;

    /// Render `out.len() / channels()` frames expected to become audible at
    /// `host_deadline_us` on the client's monotonic clock. Must not block.
    fn fill(&self, out: &mut [f32], host_deadline_us: i64);
}

/// Pluggable audio output.
///
/// Transitions are monotonic and re-entry is harmless. After `stop()`
/// returns, no `fill` callback is in flight.
pub trait AudioBackend: Send {
    /// Bind the device for `format`. Fails with
    /// [`SinkError::FormatUnsupported`] when the device cannot run the
    /// stream's rate and channel count natively.
    fn open(&mut self, format: &AudioFormat, source: Arc<dyn FrameSource>)
    -> Result<(), SinkError>;

    fn start(&mut self) -> Result<(), SinkError>;
    fn stop(&mut self);
    fn pause(&mut self) -> Result<(), SinkError>;
    fn resume(&mut self) -> Result<(), SinkError>;

    /// Hardware + driver reported output latency. May change after route
    /// changes; read it per callback, not once.
    fn latency_us(&self) -> u64;
}

/// Constructor for per-session backends.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn AudioBackend> + Send + Sync>;
