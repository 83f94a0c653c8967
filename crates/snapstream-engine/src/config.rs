//! Engine configuration.
//!
//! Plain structs with defaults; the CLI layers `clap` on top of these, the
//! library never parses arguments itself.

use std::time::Duration;

/// Tunables for the whole engine. Defaults match a LAN deployment.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Friendly client name reported in the Hello payload.
    pub client_name: String,
    /// Output device substring match; `None` picks the default device.
    pub device: Option<String>,
    /// How long a draining session may take before it is abandoned to the
    /// orphan list.
    pub drain_timeout: Duration,
    /// Hard cap on concurrently abandoned sessions.
    pub max_orphans: usize,
    /// TCP dial timeout.
    pub connect_timeout: Duration,
    /// Interval between time probes.
    pub time_probe_interval: Duration,
    /// Reconnect automatically after transport or stall failures.
    pub auto_reconnect: bool,
    /// First reconnect delay; doubles per attempt.
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling.
    pub backoff_cap: Duration,
    /// Background gap beyond which a foreground hint resets clock sync.
    pub clock_reset_after: Duration,
    /// Playout buffer tuning.
    pub playout: PlayoutConfig,
    /// Interval between diagnostics snapshots.
    pub diagnostics_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_name: "snapstream".to_string(),
            device: None,
            drain_timeout: Duration::from_secs(2),
            max_orphans: 5,
            connect_timeout: Duration::from_secs(10),
            time_probe_interval: Duration::from_secs(1),
            auto_reconnect: true,
            backoff_initial: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            clock_reset_after: Duration::from_secs(30),
            playout: PlayoutConfig::default(),
            diagnostics_interval: Duration::from_secs(1),
        }
    }
}

/// Bounds and thresholds for the playout buffer.
#[derive(Clone, Copy, Debug)]
pub struct PlayoutConfig {
    /// Desired gap between the head chunk deadline and server-now.
    pub target_latency_ms: u32,
    /// Soft lower fill bound.
    pub min_ms: u32,
    /// Hard upper fill bound; enqueue drops from the front above this.
    pub max_ms: u32,
    /// Chunks whose deadline is older than this are dropped on enqueue.
    pub evict_threshold_ms: u32,
    /// Continuous underrun span that escalates to a stalled stream.
    pub stall_threshold_ms: u32,
    /// Drift magnitude below which the sink consumes 1:1.
    pub drift_deadband_ppm: f64,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            target_latency_ms: 150,
            min_ms: 50,
            max_ms: 1000,
            evict_threshold_ms: 50,
            stall_threshold_ms: 5000,
            drift_deadband_ppm: 50.0,
        }
    }
}
