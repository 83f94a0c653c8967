//! Live playback settings shared across threads.
//!
//! Server settings arrive on the network thread and are read from the audio
//! callback, so everything here is a plain atomic. Applications are
//! last-writer-wins; there is no partial application.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU16, Ordering};

use snapstream_proto::ServerSettings;

/// Server-pushed settings, applied atomically field-by-field from a single
/// writer (the network thread).
#[derive(Debug)]
pub struct SharedSettings {
    buffer_ms: AtomicI32,
    latency_us: AtomicI64,
    volume: AtomicU16,
    muted: AtomicBool,
}

impl SharedSettings {
    pub fn new() -> Self {
        let d = ServerSettings::default();
        Self {
            buffer_ms: AtomicI32::new(d.buffer_ms),
            latency_us: AtomicI64::new(d.latency as i64 * 1000),
            volume: AtomicU16::new(d.volume),
            muted: AtomicBool::new(d.muted),
        }
    }

    pub fn apply(&self, s: &ServerSettings) {
        self.buffer_ms.store(s.buffer_ms, Ordering::Relaxed);
        self.latency_us
            .store(s.latency as i64 * 1000, Ordering::Relaxed);
        self.volume.store(s.volume.min(100), Ordering::Relaxed);
        self.muted.store(s.muted, Ordering::Relaxed);
        tracing::debug!(
            buffer_ms = s.buffer_ms,
            latency_ms = s.latency,
            volume = s.volume,
            muted = s.muted,
            "server settings applied"
        );
    }

    pub fn buffer_ms(&self) -> i32 {
        self.buffer_ms.load(Ordering::Relaxed)
    }

    /// Server-assigned client latency in microseconds.
    pub fn latency_us(&self) -> i64 {
        self.latency_us.load(Ordering::Relaxed)
    }

    /// Linear gain in `[0.0, 1.0]`, zero when muted.
    pub fn gain(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            return 0.0;
        }
        self.volume.load(Ordering::Relaxed) as f32 / 100.0
    }

    pub fn snapshot(&self) -> ServerSettings {
        ServerSettings {
            buffer_ms: self.buffer_ms.load(Ordering::Relaxed),
            latency: (self.latency_us.load(Ordering::Relaxed) / 1000) as i32,
            volume: self.volume.load(Ordering::Relaxed),
            muted: self.muted.load(Ordering::Relaxed),
        }
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// User-facing controls that outlive individual sessions.
#[derive(Debug, Default)]
pub struct UserControls {
    pub paused: AtomicBool,
    pub user_latency_us: AtomicI64,
}

impl UserControls {
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_user_latency_ms(&self, ms: i32) {
        self.user_latency_us
            .store(ms as i64 * 1000, Ordering::Relaxed);
    }

    pub fn user_latency_us(&self) -> i64 {
        self.user_latency_us.load(Ordering::Relaxed)
    }
}
