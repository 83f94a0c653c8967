//! Public control API.
//!
//! Thin facade over the supervisor: validates inputs, persists the last
//! endpoint, and publishes periodic diagnostics. Every notification is a
//! value on a subscription channel; nothing calls back into the caller.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::clock::MonotonicClock;
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::ApiError;
use crate::persist::{Endpoint, PersistedState};
use crate::settings::UserControls;
use crate::sink::{BackendFactory, CpalBackend};
use crate::supervisor::{EngineState, SupShared, Supervisor};

/// User latency bounds, milliseconds.
const LATENCY_RANGE_MS: std::ops::RangeInclusive<i32> = -2000..=2000;

pub struct Engine {
    config: EngineConfig,
    controls: Arc<UserControls>,
    diag: Arc<Diagnostics>,
    persist: Arc<PersistedState>,
    supervisor: Supervisor,
    diag_subs: Arc<Mutex<Vec<Sender<DiagnosticsSnapshot>>>>,
    diag_stop: Arc<AtomicBool>,
    diag_thread: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Engine with the CPAL output backend and the default state file.
    pub fn new(config: EngineConfig) -> Self {
        let clock_base = Arc::new(MonotonicClock::new());
        let device = config.device.clone();
        let factory_clock = clock_base.clone();
        let factory: BackendFactory = Arc::new(move || {
            Box::new(CpalBackend::new(device.clone(), factory_clock.clone()))
        });
        Self::with_backend(config, clock_base, factory, None, true)
    }

    /// Fully parameterized constructor, used by tests and embedders.
    pub fn with_backend(
        config: EngineConfig,
        clock_base: Arc<MonotonicClock>,
        backend_factory: BackendFactory,
        state_path: Option<PathBuf>,
        use_default_state_path: bool,
    ) -> Self {
        let persist = Arc::new(if use_default_state_path && state_path.is_none() {
            PersistedState::load_default()
        } else {
            PersistedState::load(state_path)
        });
        let controls = Arc::new(UserControls::default());
        let diag = Arc::new(Diagnostics::default());

        let supervisor = Supervisor::start(
            config.clone(),
            clock_base,
            controls.clone(),
            diag.clone(),
            backend_factory,
            persist.client_id(),
        );

        let diag_subs: Arc<Mutex<Vec<Sender<DiagnosticsSnapshot>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let diag_stop = Arc::new(AtomicBool::new(false));
        let diag_thread = spawn_diag_tick(
            config.diagnostics_interval,
            diag.clone(),
            supervisor.shared(),
            supervisor.state_cell(),
            diag_subs.clone(),
            diag_stop.clone(),
        );

        Self {
            config,
            controls,
            diag,
            persist,
            supervisor,
            diag_subs,
            diag_stop,
            diag_thread: Some(diag_thread),
        }
    }

    /// Arm a connection to `host:port`. Returns once the target is armed;
    /// progress is observable through the state subscription.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), ApiError> {
        let host = host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) || port == 0 {
            return Err(ApiError::InvalidEndpoint(format!("{host:?}:{port}")));
        }
        self.supervisor.connect(host.to_string(), port)?;
        self.persist.set_last_endpoint(Endpoint {
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    /// Request orderly teardown. Completion is the transition to Idle.
    pub fn disconnect(&self) {
        self.supervisor.disconnect();
    }

    pub fn set_user_latency(&self, ms: i32) -> Result<(), ApiError> {
        if !LATENCY_RANGE_MS.contains(&ms) {
            return Err(ApiError::OutOfRange(ms));
        }
        self.controls.set_user_latency_ms(ms);
        self.supervisor.latency_changed(ms);
        Ok(())
    }

    /// Pause overlay: the sink emits silence, the session stays connected
    /// and the clock keeps converging.
    pub fn set_paused(&self, paused: bool) {
        self.controls.set_paused(paused);
    }

    pub fn current_state(&self) -> EngineState {
        self.supervisor.current_state()
    }

    pub fn subscribe_state(&self) -> Receiver<EngineState> {
        self.supervisor.subscribe()
    }

    /// Periodic diagnostics snapshots. Slow subscribers are coalesced: a
    /// full channel drops the newest snapshot, never blocks the publisher.
    pub fn subscribe_diagnostics(&self) -> Receiver<DiagnosticsSnapshot> {
        let (tx, rx) = bounded(8);
        self.diag_subs.lock().unwrap().push(tx);
        rx
    }

    /// The app returned to the foreground after `was_backgrounded_ms`.
    /// Long gaps reset clock sync so stale offsets never steer playback.
    pub fn foreground_hint(&self, was_backgrounded_ms: u64) {
        self.supervisor.foreground_hint(was_backgrounded_ms);
    }

    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.persist.last_endpoint()
    }

    pub fn client_id(&self) -> String {
        self.persist.client_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One immediate snapshot, independent of the periodic tick.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        assemble_snapshot(
            &self.diag,
            &self.supervisor.shared(),
            self.supervisor.current_state(),
        )
    }

    pub fn shutdown(&mut self) {
        self.diag_stop.store(true, Ordering::Release);
        if let Some(t) = self.diag_thread.take() {
            let _ = t.join();
        }
        self.supervisor.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_diag_tick(
    interval: std::time::Duration,
    diag: Arc<Diagnostics>,
    shared: Arc<SupShared>,
    state: Arc<AtomicU8>,
    subs: Arc<Mutex<Vec<Sender<DiagnosticsSnapshot>>>>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("snapstream-diag".into())
        .spawn(move || {
            let ticker = crossbeam_channel::tick(interval);
            while !stop.load(Ordering::Acquire) {
                if ticker
                    .recv_timeout(std::time::Duration::from_millis(100))
                    .is_err()
                {
                    continue;
                }
                let snap = assemble_snapshot(
                    &diag,
                    &shared,
                    crate::supervisor::EngineState::from_atomic(&state),
                );
                let mut subs = subs.lock().unwrap();
                subs.retain(|tx| match tx.try_send(snap.clone()) {
                    Ok(()) => true,
                    Err(crossbeam_channel::TrySendError::Full(_)) => true,
                    Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
                });
            }
        })
        .expect("spawn diagnostics thread")
}

pub(crate) fn assemble_snapshot(
    diag: &Diagnostics,
    shared: &SupShared,
    state: EngineState,
) -> DiagnosticsSnapshot {
    let mut snap = DiagnosticsSnapshot {
        state: state.to_string(),
        orphan_count: shared.orphan_count.load(Ordering::Acquire),
        late_drops: diag.late_drops.load(Ordering::Relaxed),
        overflow_drops: diag.overflow_drops.load(Ordering::Relaxed),
        sink_late_frames: diag.sink_late_frames.load(Ordering::Relaxed),
        underrun_ms: diag.underrun_us.load(Ordering::Relaxed) / 1000,
        underrun_events: diag.underrun_events.load(Ordering::Relaxed),
        frames_played: diag.frames_played.load(Ordering::Relaxed),
        sessions_started: diag.sessions_started.load(Ordering::Relaxed),
        reconnects: diag.reconnects.load(Ordering::Relaxed),
        orphans_reaped: diag.orphans_reaped.load(Ordering::Relaxed),
        orphans_force_released: diag.orphans_force_released.load(Ordering::Relaxed),
        last_reason: shared.last_reason.lock().unwrap().clone(),
        ..DiagnosticsSnapshot::default()
    };
    if let Some(view) = shared.current.lock().unwrap().as_ref() {
        snap.clock_offset_us = view.clock.offset_us();
        snap.drift_ppm = view.clock.drift_ppm();
        snap.clock_samples = view.clock.sample_count();
        snap.clock_resets = view.clock.reset_count();
        snap.clock_outliers = view.clock.outlier_count();
        if let Some(playout) = view.playout.lock().unwrap().as_ref() {
            snap.buffered_ms = playout.buffered_ms();
        }
    }
    snap
}
