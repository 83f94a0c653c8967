//! Server/client clock synchronization.
//!
//! Each time probe yields the classic four timestamps `t1..t4` (client send,
//! server receive, server send, client receive). From those:
//!
//! ```text
//! latency = ((t4 - t1) - (t3 - t2)) / 2
//! offset  = ((t2 - t1) + (t3 - t4)) / 2      // server - client, µs
//! ```
//!
//! Offsets go through a median-of-window filter; samples whose latency
//! exceeds `median + 3·MAD` are rejected as spikes. The published offset is
//! a single atomic so the audio callback can read it without locking.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Offset window size used for the published median.
const OFFSET_WINDOW: usize = 30;
/// Sample count over which drift is regressed.
const DRIFT_WINDOW: usize = 120;
/// Minimum latency samples before outlier rejection starts.
const MIN_SAMPLES_FOR_REJECT: usize = 8;
/// Floor for the MAD so identical latencies don't reject everything.
const MAD_FLOOR_US: i64 = 50;

/// Process-local monotonic microsecond clock.
///
/// All client-side timestamps (probe send/receive, playout deadlines) live in
/// this one domain so offsets stay meaningful across subsystems.
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
    skew_us: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            skew_us: AtomicI64::new(0),
        }
    }

    pub fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64 + self.skew_us.load(Ordering::Relaxed)
    }

    /// Shift the clock forward, modeling a suspended process waking up.
    #[cfg(test)]
    pub(crate) fn advance_us(&self, us: i64) {
        self.skew_us.fetch_add(us, Ordering::Relaxed);
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct SyncWindow {
    /// (client receive time, offset) pairs, newest last.
    offsets: Vec<(i64, i64)>,
    latencies: Vec<i64>,
}

/// Offset estimator between the server clock and [`MonotonicClock`].
pub struct ClockSync {
    clock: std::sync::Arc<MonotonicClock>,
    window: Mutex<SyncWindow>,
    published_offset_us: AtomicI64,
    /// Drift in ppm, stored as f64 bits.
    published_drift: AtomicU64,
    synced: AtomicBool,
    outliers: AtomicU64,
    resets: AtomicU64,
}

impl ClockSync {
    pub fn new(clock: std::sync::Arc<MonotonicClock>) -> Self {
        Self {
            clock,
            window: Mutex::new(SyncWindow::default()),
            published_offset_us: AtomicI64::new(0),
            published_drift: AtomicU64::new(0f64.to_bits()),
            synced: AtomicBool::new(false),
            outliers: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    /// Feed one completed probe exchange. All timestamps in microseconds;
    /// `t1`/`t4` on the client clock, `t2`/`t3` on the server clock.
    pub fn update(&self, t1: i64, t2: i64, t3: i64, t4: i64) {
        let latency = ((t4 - t1) - (t3 - t2)) / 2;
        let offset = ((t2 - t1) + (t3 - t4)) / 2;
        if latency < 0 {
            // Clock arithmetic went backwards; not a usable sample.
            self.outliers.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut w = self.window.lock().unwrap();
        if w.latencies.len() >= MIN_SAMPLES_FOR_REJECT {
            let med = median(&w.latencies);
            let mad = mad(&w.latencies, med).max(MAD_FLOOR_US);
            if latency > med + 3 * mad {
                drop(w);
                self.outliers.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(latency_us = latency, "rejected time sample as outlier");
                return;
            }
        }

        w.latencies.push(latency);
        if w.latencies.len() > OFFSET_WINDOW {
            w.latencies.remove(0);
        }
        w.offsets.push((t4, offset));
        if w.offsets.len() > DRIFT_WINDOW {
            w.offsets.remove(0);
        }

        let recent: Vec<i64> = w
            .offsets
            .iter()
            .rev()
            .take(OFFSET_WINDOW)
            .map(|&(_, o)| o)
            .collect();
        let published = median(&recent);
        let drift = regress_drift_ppm(&w.offsets);
        drop(w);

        self.published_offset_us.store(published, Ordering::Relaxed);
        if let Some(ppm) = drift {
            self.published_drift.store(ppm.to_bits(), Ordering::Relaxed);
        }
        self.synced.store(true, Ordering::Relaxed);
    }

    /// Current server time estimate in microseconds. Lock-free.
    pub fn server_now_us(&self) -> i64 {
        self.clock.now_us() + self.published_offset_us.load(Ordering::Relaxed)
    }

    /// Client monotonic time in microseconds.
    pub fn client_now_us(&self) -> i64 {
        self.clock.now_us()
    }

    /// Published offset (server − client) in microseconds. Lock-free.
    pub fn offset_us(&self) -> i64 {
        self.published_offset_us.load(Ordering::Relaxed)
    }

    /// Estimated oscillator drift in parts per million. Lock-free.
    pub fn drift_ppm(&self) -> f64 {
        f64::from_bits(self.published_drift.load(Ordering::Relaxed))
    }

    /// Whether at least one sample has been accepted since the last reset.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn sample_count(&self) -> usize {
        self.window.lock().unwrap().offsets.len()
    }

    pub fn outlier_count(&self) -> u64 {
        self.outliers.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Clear the window and start a fresh convergence. The last published
    /// offset stays visible until new samples replace it.
    pub fn reset(&self) {
        let mut w = self.window.lock().unwrap();
        w.offsets.clear();
        w.latencies.clear();
        drop(w);
        self.synced.store(false, Ordering::Relaxed);
        self.resets.fetch_add(1, Ordering::Relaxed);
        tracing::info!("clock sync window reset");
    }
}

fn median(values: &[i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    }
}

fn mad(values: &[i64], med: i64) -> i64 {
    let deviations: Vec<i64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// Least-squares slope of offset over client time, in ppm.
///
/// Needs a full offset window before it reports anything; short baselines
/// produce garbage slopes.
fn regress_drift_ppm(samples: &[(i64, i64)]) -> Option<f64> {
    if samples.len() < DRIFT_WINDOW {
        return None;
    }
    let n = samples.len() as f64;
    let t0 = samples[0].0;
    let mean_t: f64 = samples.iter().map(|&(t, _)| (t - t0) as f64).sum::<f64>() / n;
    let mean_o: f64 = samples.iter().map(|&(_, o)| o as f64).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for &(t, o) in samples {
        let dt = (t - t0) as f64 - mean_t;
        num += dt * (o as f64 - mean_o);
        den += dt * dt;
    }
    if den == 0.0 {
        return None;
    }
    Some(num / den * 1e6)
}
