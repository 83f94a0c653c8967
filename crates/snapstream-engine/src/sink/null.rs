//! Device-less audio backend.
//!
//! Pulls frames at wall-clock pace and discards them. Used by tests and by
//! hosts without a usable output device; the playout buffer still sees a
//! realistic consumption cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::MonotonicClock;
use crate::decode::AudioFormat;
use crate::error::SinkError;
use crate::sink::{AudioBackend, FrameSource};

const TICK: Duration = Duration::from_millis(10);
/// Pretend hardware latency so deadline math stays realistic.
const REPORTED_LATENCY_US: u64 = 10_000;

pub struct NullBackend {
    clock: Arc<MonotonicClock>,
    running: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl NullBackend {
    pub fn new(clock: Arc<MonotonicClock>) -> Self {
        Self {
            clock,
            running: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl AudioBackend for NullBackend {
    fn open(
        &mut self,
        format: &AudioFormat,
        source: Arc<dyn FrameSource>,
    ) -> Result<(), SinkError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let channels = format.channels as usize;
        let frames_per_tick =
            (format.sample_rate as u64 * TICK.as_millis() as u64 / 1000) as usize;
        let running = self.running.clone();
        let stopped = self.stopped.clone();
        let clock = self.clock.clone();

        let worker = thread::Builder::new()
            .name("snapstream-null-sink".into())
            .spawn(move || {
                let mut scratch = vec![0.0f32; frames_per_tick * channels];
                let mut next = Instant::now();
                while !stopped.load(Ordering::Acquire) {
                    next += TICK;
                    if running.load(Ordering::Acquire) {
                        let deadline = clock.now_us() + REPORTED_LATENCY_US as i64;
                        source.fill(&mut scratch, deadline);
                    }
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|e| SinkError::Backend(anyhow::anyhow!("spawn null sink: {e}")))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn start(&mut self) -> Result<(), SinkError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn pause(&mut self) -> Result<(), SinkError> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), SinkError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn latency_us(&self) -> u64 {
        REPORTED_LATENCY_US
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingSource {
        fills: AtomicU64,
        live: Arc<AtomicBool>,
    }

    impl FrameSource for CountingSource {
        fn channels(&self) -> u16 {
            2
        }

        fn fill(&self, out: &mut [f32], _host_deadline_us: i64) {
            assert!(self.live.load(Ordering::Acquire), "fill after stop");
            out.fill(0.0);
            self.fills.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 16,
        }
    }

    #[test]
    fn pulls_at_wall_clock_pace() {
        let live = Arc::new(AtomicBool::new(true));
        let source = Arc::new(CountingSource {
            fills: AtomicU64::new(0),
            live: live.clone(),
        });
        let mut backend = NullBackend::new(Arc::new(MonotonicClock::new()));
        backend.open(&format(), source.clone()).unwrap();
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(120));
        backend.stop();
        let fills = source.fills.load(Ordering::Relaxed);
        assert!(fills >= 5, "only {fills} fills in 120ms");
    }

    #[test]
    fn no_callback_in_flight_after_stop() {
        let live = Arc::new(AtomicBool::new(true));
        let source = Arc::new(CountingSource {
            fills: AtomicU64::new(0),
            live: live.clone(),
        });
        let mut backend = NullBackend::new(Arc::new(MonotonicClock::new()));
        backend.open(&format(), source).unwrap();
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        backend.stop();
        // The canary would trip if any fill ran past this point.
        live.store(false, Ordering::Release);
        thread::sleep(Duration::from_millis(30));
    }

    #[test]
    fn pause_stops_pulling_without_stopping_thread() {
        let live = Arc::new(AtomicBool::new(true));
        let source = Arc::new(CountingSource {
            fills: AtomicU64::new(0),
            live,
        });
        let mut backend = NullBackend::new(Arc::new(MonotonicClock::new()));
        backend.open(&format(), source.clone()).unwrap();
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(40));
        backend.pause().unwrap();
        thread::sleep(Duration::from_millis(20));
        let at_pause = source.fills.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(source.fills.load(Ordering::Relaxed), at_pause);
        backend.resume().unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(source.fills.load(Ordering::Relaxed) > at_pause);
        backend.stop();
    }
}
