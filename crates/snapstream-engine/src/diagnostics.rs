//! Engine-wide diagnostics counters and the periodic snapshot.
//!
//! Counters are written from hot paths (enqueue, audio callback) and read by
//! the diagnostics tick, so all of them are relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Chunks dropped at enqueue because their deadline had already passed.
    pub late_drops: AtomicU64,
    /// Chunks dropped from the front to keep the buffer under its cap.
    pub overflow_drops: AtomicU64,
    /// Frames the sink skipped because their playout instant was missed.
    pub sink_late_frames: AtomicU64,
    /// Total silence emitted in place of missing audio, microseconds.
    pub underrun_us: AtomicU64,
    /// Distinct empty-buffer episodes in the sink callback.
    pub underrun_events: AtomicU64,
    /// Frames actually delivered to the device.
    pub frames_played: AtomicU64,
    /// Sessions ever armed.
    pub sessions_started: AtomicU64,
    /// Automatic reconnect attempts.
    pub reconnects: AtomicU64,
    /// Orphans joined by the background reaper.
    pub orphans_reaped: AtomicU64,
    /// Orphans force-released on list overflow. Should stay at zero.
    pub orphans_force_released: AtomicU64,
}

impl Diagnostics {
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Periodic point-in-time view published on the diagnostics subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub state: String,
    pub orphan_count: usize,
    pub late_drops: u64,
    pub overflow_drops: u64,
    pub sink_late_frames: u64,
    pub underrun_ms: u64,
    pub underrun_events: u64,
    pub frames_played: u64,
    pub buffered_ms: u64,
    pub clock_offset_us: i64,
    pub drift_ppm: f64,
    pub clock_samples: usize,
    pub clock_resets: u64,
    pub clock_outliers: u64,
    pub sessions_started: u64,
    pub reconnects: u64,
    pub orphans_reaped: u64,
    pub orphans_force_released: u64,
    pub last_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let d = Diagnostics::default();
        d.add(&d.late_drops, 2);
        d.add(&d.late_drops, 3);
        assert_eq!(d.late_drops.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn snapshot_serializes() {
        let snap = DiagnosticsSnapshot {
            state: "Running".into(),
            ..DiagnosticsSnapshot::default()
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "Running");
    }
}
