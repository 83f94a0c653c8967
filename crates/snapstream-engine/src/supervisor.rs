//! Engine lifecycle supervision.
//!
//! One monitor thread serializes every connect/disconnect/switch and owns
//! the single active session. A session that will not drain inside the
//! timeout is abandoned to the orphan list and reaped in the background; the
//! control path is never held hostage by a hung peer.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::clock::{ClockSync, MonotonicClock};
use crate::config::EngineConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{ApiError, ErrorKind, SessionError};
use crate::playout::PlayoutBuffer;
use crate::session::{self, SessionContext, SessionEvent, SessionHandle};
use crate::settings::{SharedSettings, UserControls};
use crate::sink::BackendFactory;

/// Published engine states, totally ordered per subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Arming,
    Running,
    Switching,
    Draining,
    Failed,
}

impl EngineState {
    fn as_u8(self) -> u8 {
        match self {
            EngineState::Idle => 0,
            EngineState::Arming => 1,
            EngineState::Running => 2,
            EngineState::Switching => 3,
            EngineState::Draining => 4,
            EngineState::Failed => 5,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Arming,
            2 => EngineState::Running,
            3 => EngineState::Switching,
            4 => EngineState::Draining,
            5 => EngineState::Failed,
            _ => EngineState::Idle,
        }
    }

    pub(crate) fn from_atomic(cell: &AtomicU8) -> Self {
        Self::from_u8(cell.load(Ordering::Acquire))
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug)]
enum Command {
    Connect { host: String, port: u16 },
    Disconnect,
    ForegroundHint { gap_ms: u64 },
    LatencyChanged { ms: i32 },
    Shutdown,
}

/// Exponential reconnect backoff.
struct Backoff {
    initial: Duration,
    cap: Duration,
    next_delay: Duration,
}

impl Backoff {
    fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            next_delay: initial,
        }
    }

    fn next(&mut self) -> Duration {
        let d = self.next_delay;
        self.next_delay = (d * 2).min(self.cap);
        d
    }

    fn reset(&mut self) {
        self.next_delay = self.initial;
    }
}

/// Read-only view of the active session for diagnostics assembly.
pub(crate) struct CurrentView {
    pub clock: Arc<ClockSync>,
    pub playout: Arc<Mutex<Option<Arc<PlayoutBuffer>>>>,
}

pub(crate) struct SupShared {
    pub orphan_count: AtomicUsize,
    pub last_reason: Mutex<Option<String>>,
    pub current: Mutex<Option<CurrentView>>,
}

pub(crate) struct Supervisor {
    cmd_tx: Sender<Command>,
    state: Arc<AtomicU8>,
    shutting_down: Arc<AtomicBool>,
    shared: Arc<SupShared>,
    subscribers: Arc<Mutex<Vec<Sender<EngineState>>>>,
    monitor: Option<thread::JoinHandle<()>>,
    reaper: Option<thread::JoinHandle<()>>,
    reaper_stop: Arc<AtomicBool>,
}

impl Supervisor {
    pub(crate) fn start(
        config: EngineConfig,
        clock_base: Arc<MonotonicClock>,
        controls: Arc<UserControls>,
        diag: Arc<Diagnostics>,
        backend_factory: BackendFactory,
        client_id: String,
    ) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let (evt_tx, evt_rx) = unbounded();
        let state = Arc::new(AtomicU8::new(EngineState::Idle.as_u8()));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(SupShared {
            orphan_count: AtomicUsize::new(0),
            last_reason: Mutex::new(None),
            current: Mutex::new(None),
        });
        let subscribers: Arc<Mutex<Vec<Sender<EngineState>>>> = Arc::new(Mutex::new(Vec::new()));
        let orphans: Arc<Mutex<Vec<SessionHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let reaper_stop = Arc::new(AtomicBool::new(false));
        let reaper = spawn_reaper(
            orphans.clone(),
            shared.clone(),
            diag.clone(),
            reaper_stop.clone(),
        );

        let monitor = {
            let backoff = Backoff::new(config.backoff_initial, config.backoff_cap);
            let monitor = Monitor {
                config,
                clock_base,
                controls,
                diag,
                backend_factory,
                client_id,
                evt_tx,
                state: state.clone(),
                subscribers: subscribers.clone(),
                shared: shared.clone(),
                orphans,
                next_session_id: 1,
                current: None,
                current_settings: None,
                target: None,
                pending_target: None,
                drain_deadline: None,
                reconnect_at: None,
                backoff,
                user_disconnected: false,
            };
            thread::Builder::new()
                .name("snapstream-supervisor".into())
                .spawn(move || monitor.run(cmd_rx, evt_rx))
                .expect("spawn supervisor thread")
        };

        Self {
            cmd_tx,
            state,
            shutting_down,
            shared,
            subscribers,
            monitor: Some(monitor),
            reaper: Some(reaper),
            reaper_stop,
        }
    }

    pub(crate) fn connect(&self, host: String, port: u16) -> Result<(), ApiError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ApiError::AlreadyShuttingDown);
        }
        let _ = self.cmd_tx.send(Command::Connect { host, port });
        Ok(())
    }

    pub(crate) fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    pub(crate) fn foreground_hint(&self, gap_ms: u64) {
        let _ = self.cmd_tx.send(Command::ForegroundHint { gap_ms });
    }

    pub(crate) fn latency_changed(&self, ms: i32) {
        let _ = self.cmd_tx.send(Command::LatencyChanged { ms });
    }

    pub(crate) fn current_state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Subscribe to state transitions. The current state is delivered first.
    pub(crate) fn subscribe(&self) -> Receiver<EngineState> {
        let (tx, rx) = unbounded();
        let _ = tx.send(self.current_state());
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub(crate) fn shared(&self) -> Arc<SupShared> {
        self.shared.clone()
    }

    /// Lock-free state cell, for readers that outlive `&self` borrows.
    pub(crate) fn state_cell(&self) -> Arc<AtomicU8> {
        self.state.clone()
    }

    /// Orderly shutdown: drain the active session within the drain timeout,
    /// then stop background threads. Anything still alive past that point is
    /// intentionally leaked.
    pub(crate) fn shutdown(&mut self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        self.reaper_stop.store(true, Ordering::Release);
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Monitor {
    config: EngineConfig,
    clock_base: Arc<MonotonicClock>,
    controls: Arc<UserControls>,
    diag: Arc<Diagnostics>,
    backend_factory: BackendFactory,
    client_id: String,
    evt_tx: Sender<SessionEvent>,
    state: Arc<AtomicU8>,
    subscribers: Arc<Mutex<Vec<Sender<EngineState>>>>,
    shared: Arc<SupShared>,
    orphans: Arc<Mutex<Vec<SessionHandle>>>,
    next_session_id: u64,
    current: Option<SessionHandle>,
    current_settings: Option<Arc<SharedSettings>>,
    /// Endpoint the current session was armed for.
    target: Option<(String, u16)>,
    /// Endpoint to arm once the current session is gone.
    pending_target: Option<(String, u16)>,
    drain_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    backoff: Backoff,
    user_disconnected: bool,
}

impl Monitor {
    fn run(mut self, cmd_rx: Receiver<Command>, evt_rx: Receiver<SessionEvent>) {
        loop {
            let timeout = self.next_wakeup();
            crossbeam_channel::select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(Command::Shutdown) | Err(_) => {
                        self.handle_shutdown();
                        return;
                    }
                    Ok(cmd) => self.handle_command(cmd),
                },
                recv(evt_rx) -> evt => {
                    if let Ok(evt) = evt {
                        self.handle_event(evt);
                    }
                }
                default(timeout) => {}
            }
            self.handle_deadlines();
        }
    }

    fn next_wakeup(&self) -> Duration {
        let mut wake = Duration::from_millis(250);
        let now = Instant::now();
        for deadline in [self.drain_deadline, self.reconnect_at].into_iter().flatten() {
            let until = deadline.saturating_duration_since(now);
            wake = wake.min(until.max(Duration::from_millis(1)));
        }
        wake
    }

    fn publish(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
        tracing::info!(state = %state, "engine state");
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(state).is_ok());
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { host, port } => self.handle_connect(host, port),
            Command::Disconnect => self.handle_disconnect(),
            Command::ForegroundHint { gap_ms } => {
                if gap_ms > self.config.clock_reset_after.as_millis() as u64 {
                    if let Some(current) = &self.current {
                        current.clock.reset();
                    }
                }
            }
            Command::LatencyChanged { ms } => {
                if let (Some(current), Some(settings)) =
                    (&self.current, &self.current_settings)
                {
                    let snap = settings.snapshot();
                    current.send_client_info(ms, snap.volume, snap.muted);
                }
            }
            Command::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn handle_connect(&mut self, host: String, port: u16) {
        self.user_disconnected = false;
        self.reconnect_at = None;

        let target = (host, port);
        if self.current.is_none() {
            self.arm(target);
            return;
        }
        // Idempotent when the in-progress target is already this endpoint.
        if self.pending_target.as_ref() == Some(&target) {
            return;
        }
        if self.pending_target.is_none()
            && self.target.as_ref() == Some(&target)
            && self.drain_deadline.is_none()
        {
            return;
        }
        self.begin_switch(target);
    }

    fn handle_disconnect(&mut self) {
        self.user_disconnected = true;
        self.pending_target = None;
        self.reconnect_at = None;
        self.backoff.reset();
        if let Some(current) = &self.current {
            current.cancel(SessionError::cancelled());
            self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
            self.publish(EngineState::Draining);
        } else {
            self.publish(EngineState::Idle);
        }
    }

    fn begin_switch(&mut self, target: (String, u16)) {
        if let Some(current) = &self.current {
            current.cancel(SessionError::cancelled());
        }
        self.pending_target = Some(target);
        if self.drain_deadline.is_none() {
            self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
        }
        self.publish(EngineState::Switching);
    }

    fn arm(&mut self, target: (String, u16)) {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let settings = Arc::new(SharedSettings::new());
        let ctx = SessionContext {
            config: self.config.clone(),
            clock_base: self.clock_base.clone(),
            controls: self.controls.clone(),
            settings: settings.clone(),
            diag: self.diag.clone(),
            backend_factory: self.backend_factory.clone(),
            client_id: self.client_id.clone(),
            events: self.evt_tx.clone(),
        };
        let handle = session::spawn(id, target.0.clone(), target.1, ctx);

        *self.shared.current.lock().unwrap() = Some(CurrentView {
            clock: handle.clock.clone(),
            playout: handle.playout_slot(),
        });
        self.current = Some(handle);
        self.current_settings = Some(settings);
        self.target = Some(target);
        self.drain_deadline = None;
        self.publish(EngineState::Arming);
    }

    fn handle_event(&mut self, evt: SessionEvent) {
        match evt {
            SessionEvent::Connected { session_id } => {
                if self.current.as_ref().map(|c| c.id) == Some(session_id)
                    && self.drain_deadline.is_none()
                {
                    self.backoff.reset();
                    self.publish(EngineState::Running);
                }
            }
            SessionEvent::Finished { session_id, reason } => {
                if self.current.as_ref().map(|c| c.id) != Some(session_id) {
                    return; // stale event from a replaced session
                }
                let mut handle = self.current.take().expect("checked above");
                handle.join();
                self.current_settings = None;
                self.drain_deadline = None;
                *self.shared.current.lock().unwrap() = None;
                self.after_session_end(reason);
            }
        }
    }

    fn after_session_end(&mut self, reason: SessionError) {
        if reason.kind != ErrorKind::Cancelled {
            tracing::warn!(reason = %reason, "session ended");
            *self.shared.last_reason.lock().unwrap() = Some(reason.to_string());
        }

        if let Some(target) = self.pending_target.take() {
            self.arm(target);
            return;
        }
        if self.user_disconnected {
            self.publish(EngineState::Idle);
            return;
        }
        match reason.kind {
            ErrorKind::Fatal => self.publish(EngineState::Failed),
            ErrorKind::Transport | ErrorKind::Stalled if self.config.auto_reconnect => {
                if self.target.is_some() {
                    let delay = self.backoff.next();
                    self.reconnect_at = Some(Instant::now() + delay);
                    tracing::info!(delay_s = delay.as_secs_f32(), "reconnect scheduled");
                }
                self.publish(EngineState::Idle);
            }
            _ => self.publish(EngineState::Idle),
        }
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();

        if let Some(deadline) = self.drain_deadline {
            if now >= deadline {
                self.drain_deadline = None;
                if let Some(handle) = self.current.take() {
                    if handle.is_finished() {
                        // Finished but the event lost the race; complete here.
                        let mut handle = handle;
                        handle.join();
                        self.current_settings = None;
                        *self.shared.current.lock().unwrap() = None;
                        self.after_session_end(SessionError::cancelled());
                    } else {
                        self.abandon(handle);
                        self.current_settings = None;
                        *self.shared.current.lock().unwrap() = None;
                        self.after_session_end(SessionError::cancelled());
                    }
                }
            }
        }

        if let Some(at) = self.reconnect_at {
            if now >= at && self.current.is_none() && !self.user_disconnected {
                self.reconnect_at = None;
                if let Some(target) = self.target.clone() {
                    self.diag.add(&self.diag.reconnects, 1);
                    self.arm(target);
                }
            }
        }
    }

    /// Move a non-draining session to the orphan list. Its callback gate is
    /// blocked at the instant of abandonment, so anything it still emits is
    /// discarded before touching engine state.
    fn abandon(&mut self, handle: SessionHandle) {
        handle.gate.block_only();
        handle.cancel(SessionError::cancelled());
        tracing::warn!(session = handle.id, "session abandoned to orphan list");

        let mut orphans = self.orphans.lock().unwrap();
        if orphans.len() >= self.config.max_orphans {
            let mut oldest = orphans.remove(0);
            oldest.force_release();
            self.diag.add(&self.diag.orphans_force_released, 1);
            tracing::error!(session = oldest.id, "orphan list overflow, force-released oldest");
        }
        orphans.push(handle);
        self.shared
            .orphan_count
            .store(orphans.len(), Ordering::Release);
    }

    fn handle_shutdown(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.cancel(SessionError::cancelled());
            if current.wait_finished(self.config.drain_timeout) {
                current.join();
            } else {
                self.abandon(current);
            }
        }
        *self.shared.current.lock().unwrap() = None;
        self.publish(EngineState::Idle);
    }
}

fn spawn_reaper(
    orphans: Arc<Mutex<Vec<SessionHandle>>>,
    shared: Arc<SupShared>,
    diag: Arc<Diagnostics>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("snapstream-reaper".into())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
                let mut orphans = orphans.lock().unwrap();
                let before = orphans.len();
                orphans.retain_mut(|o| {
                    if o.is_finished() {
                        o.join();
                        false
                    } else {
                        true
                    }
                });
                let reaped = before - orphans.len();
                if reaped > 0 {
                    diag.add(&diag.orphans_reaped, reaped as u64);
                    tracing::info!(count = reaped, "reaped orphan sessions");
                }
                shared.orphan_count.store(orphans.len(), Ordering::Release);
            }
        })
        .expect("spawn reaper thread")
}
