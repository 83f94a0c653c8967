//! A single server connection: threads, wiring, teardown.
//!
//! The session owns its transport, router, clock sync, decode stage, playout
//! buffer, and sink backend. Three threads run per session: the network
//! reader (also the session main), the probe/housekeeping loop, and the
//! decoder. The sink backend runs its own device thread.
//!
//! Teardown is strictly linear: close transport → network loop unwinds →
//! chunk channel closes → decoder drains → sink stops → Finished is emitted.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, tick};
use snapstream_proto::{Payload, Time, WireChunk};

use crate::clock::{ClockSync, MonotonicClock};
use crate::config::EngineConfig;
use crate::decode::make_decoder;
use crate::diagnostics::Diagnostics;
use crate::error::{DecodeError, ErrorKind, SessionError};
use crate::playout::{PcmChunk, PlayoutBuffer};
use crate::router::{Dispatch, ProbeTable, Router, make_hello};
use crate::settings::{SharedSettings, UserControls};
use crate::sink::{AudioBackend, BackendFactory};
use crate::transport::{Transport, TransportError, resolve};

/// Gate between a publisher and its listeners during destruction.
///
/// Phase one (`destroy`) synchronously blocks new entries; phase two waits
/// for in-flight callbacks to drain. A callback that loses the race simply
/// never runs.
pub(crate) struct CallbackGate {
    destroying: AtomicBool,
    inflight: AtomicUsize,
}

pub(crate) struct GateGuard<'a> {
    gate: &'a CallbackGate,
}

impl CallbackGate {
    pub(crate) fn new() -> Self {
        Self {
            destroying: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
        }
    }

    /// Begin a callback. Returns `None` once destruction has started.
    pub(crate) fn enter(&self) -> Option<GateGuard<'_>> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self.destroying.load(Ordering::SeqCst) {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(GateGuard { gate: self })
    }

    /// Block new callbacks, then wait for in-flight ones to return.
    pub(crate) fn destroy(&self) {
        self.destroying.store(true, Ordering::SeqCst);
        while self.inflight.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
    }

    /// Block new callbacks without draining (orphan abandonment).
    pub(crate) fn block_only(&self) {
        self.destroying.store(true, Ordering::SeqCst);
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Events a session reports to its supervisor.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Server settings applied; the connection is live.
    Connected { session_id: u64 },
    /// All session threads (except main, which is emitting this) unwound.
    Finished {
        session_id: u64,
        reason: SessionError,
    },
}

/// Cancellation plumbing shared by every session thread.
struct CancelToken {
    cancel: AtomicBool,
    pending: Mutex<Option<SessionError>>,
    transport: Mutex<Option<Arc<Transport>>>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            pending: Mutex::new(None),
            transport: Mutex::new(None),
        }
    }

    /// First reason wins; later trips only reinforce the cancel flag.
    fn trip(&self, reason: SessionError) {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_none() {
                *pending = Some(reason);
            }
        }
        self.cancel.store(true, Ordering::Release);
        if let Some(t) = self.transport.lock().unwrap().as_ref() {
            t.close();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn taken_reason(&self, fallback: SessionError) -> SessionError {
        self.pending.lock().unwrap().take().unwrap_or(fallback)
    }
}

/// Everything a session needs from its owner.
pub(crate) struct SessionContext {
    pub config: EngineConfig,
    pub clock_base: Arc<MonotonicClock>,
    pub controls: Arc<UserControls>,
    pub settings: Arc<SharedSettings>,
    pub diag: Arc<Diagnostics>,
    pub backend_factory: BackendFactory,
    pub client_id: String,
    pub events: Sender<SessionEvent>,
}

pub(crate) struct SessionHandle {
    pub id: u64,
    pub gate: Arc<CallbackGate>,
    pub clock: Arc<ClockSync>,
    playout: Arc<Mutex<Option<Arc<PlayoutBuffer>>>>,
    token: Arc<CancelToken>,
    finished: Arc<AtomicBool>,
    main: Option<thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Request teardown; returns immediately.
    pub fn cancel(&self, reason: SessionError) {
        self.token.trip(reason);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            && self.main.as_ref().map(|m| m.is_finished()).unwrap_or(true)
    }

    /// Poll for completion up to `timeout`.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_finished() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Join the main thread. Only sensible once `is_finished()` is true.
    pub fn join(&mut self) {
        if let Some(main) = self.main.take() {
            let _ = main.join();
        }
    }

    /// Drop thread handles without joining. Last-resort path for orphan
    /// overflow; the threads exit on their own once the socket dies.
    pub fn force_release(&mut self) {
        self.token.trip(SessionError::cancelled());
        self.gate.block_only();
        self.main.take();
    }

    /// Report a local latency change upstream, if connected.
    pub fn send_client_info(&self, latency_ms: i32, volume: u16, muted: bool) {
        if let Some(t) = self.token.transport.lock().unwrap().as_ref() {
            let info = snapstream_proto::ClientInfo {
                volume,
                muted,
                latency: latency_ms,
            };
            let _ = t.send(0, 0, &Payload::ClientInfo(info));
        }
    }

    /// Shared slot holding the playout buffer once the codec header arrives.
    pub fn playout_slot(&self) -> Arc<Mutex<Option<Arc<PlayoutBuffer>>>> {
        self.playout.clone()
    }
}

/// Spawn a session targeting `host:port`. Dialing happens on the session's
/// own network thread so the caller is never blocked on a slow peer.
pub(crate) fn spawn(id: u64, host: String, port: u16, ctx: SessionContext) -> SessionHandle {
    let gate = Arc::new(CallbackGate::new());
    let clock = Arc::new(ClockSync::new(ctx.clock_base.clone()));
    let token = Arc::new(CancelToken::new());
    let playout_slot: Arc<Mutex<Option<Arc<PlayoutBuffer>>>> = Arc::new(Mutex::new(None));
    let finished = Arc::new(AtomicBool::new(false));

    let main = {
        let gate = gate.clone();
        let clock = clock.clone();
        let token = token.clone();
        let playout_slot = playout_slot.clone();
        let finished = finished.clone();
        thread::Builder::new()
            .name(format!("snapstream-session-{id}"))
            .spawn(move || {
                let reason = run_session(
                    id,
                    &host,
                    port,
                    &ctx,
                    &clock,
                    &token,
                    &playout_slot,
                    &gate,
                );
                let reason = token.taken_reason(reason);
                finished.store(true, Ordering::Release);
                if let Some(_guard) = gate.enter() {
                    let _ = ctx.events.send(SessionEvent::Finished {
                        session_id: id,
                        reason,
                    });
                }
            })
            .expect("spawn session thread")
    };

    SessionHandle {
        id,
        gate,
        clock,
        playout: playout_slot,
        token,
        finished,
        main: Some(main),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_session(
    id: u64,
    host: &str,
    port: u16,
    ctx: &SessionContext,
    clock: &Arc<ClockSync>,
    token: &Arc<CancelToken>,
    playout_slot: &Arc<Mutex<Option<Arc<PlayoutBuffer>>>>,
    gate: &Arc<CallbackGate>,
) -> SessionError {
    ctx.diag.add(&ctx.diag.sessions_started, 1);

    let addr = match resolve(host, port) {
        Ok(addr) => addr,
        Err(e) => return SessionError::transport(format!("resolve {host}:{port}: {e}")),
    };
    if token.is_cancelled() {
        return SessionError::cancelled();
    }

    let transport = match Transport::connect(addr, ctx.config.connect_timeout, ctx.clock_base.clone())
    {
        Ok(t) => Arc::new(t),
        Err(e) => {
            if token.is_cancelled() {
                return SessionError::cancelled();
            }
            return SessionError::transport(format!("dial {addr}: {e}"));
        }
    };
    tracing::info!(session = id, peer = %addr, "connected");

    *token.transport.lock().unwrap() = Some(transport.clone());
    if token.is_cancelled() {
        transport.close();
        return SessionError::cancelled();
    }

    let hello = make_hello(&ctx.config.client_name, &ctx.client_id, 1);
    if let Err(e) = transport.send(0, 0, &Payload::Hello(hello)) {
        return SessionError::transport(format!("send hello: {e}"));
    }

    let probes = Arc::new(ProbeTable::new());
    let session_done = Arc::new(AtomicBool::new(false));
    let probe_join = spawn_probe_loop(
        ctx,
        transport.clone(),
        probes.clone(),
        clock.clone(),
        token.clone(),
        playout_slot.clone(),
        session_done.clone(),
    );

    let mut router = Router::new(&probes, &ctx.settings);
    let mut chunk_tx: Option<Sender<WireChunk>> = None;
    let mut decode_join: Option<thread::JoinHandle<()>> = None;
    let mut backend: Option<Box<dyn AudioBackend>> = None;

    let reason = loop {
        if token.is_cancelled() {
            break SessionError::cancelled();
        }
        let msg = match transport.recv() {
            Ok(msg) => msg,
            Err(TransportError::Cancelled) => break SessionError::cancelled(),
            Err(TransportError::EndOfStream) => {
                break SessionError::transport("server closed the connection");
            }
            Err(TransportError::Frame(e)) => {
                break SessionError::protocol(format!("bad frame: {e}"));
            }
            Err(e) => break SessionError::transport(e.to_string()),
        };

        match router.route(msg) {
            Ok(Dispatch::None) => {}
            Ok(Dispatch::Connected) => {
                if let Some(_guard) = gate.enter() {
                    let _ = ctx.events.send(SessionEvent::Connected { session_id: id });
                }
            }
            Ok(Dispatch::Codec(header)) => {
                match build_pipeline(ctx, clock, token, playout_slot, &header) {
                    Ok((tx, join, sink)) => {
                        chunk_tx = Some(tx);
                        decode_join = Some(join);
                        backend = Some(sink);
                    }
                    Err(e) => break e,
                }
            }
            Ok(Dispatch::Chunk(chunk)) => {
                if let Some(tx) = &chunk_tx {
                    // Bounded send: a slow decoder backpressures the reader
                    // rather than growing an unbounded queue.
                    if tx.send(chunk).is_err() {
                        break SessionError::new(ErrorKind::Fatal, "decode stage gone");
                    }
                }
            }
            Ok(Dispatch::TimeSample { t1, t2, t3, t4 }) => {
                clock.update(t1, t2, t3, t4);
            }
            Err(e) => break e,
        }
    };

    // Linear teardown.
    transport.close();
    drop(chunk_tx);
    if let Some(join) = decode_join {
        let _ = join.join();
    }
    if let Some(mut sink) = backend {
        sink.stop();
    }
    session_done.store(true, Ordering::Release);
    let _ = probe_join.join();
    tracing::info!(session = id, reason = %reason, "session finished");
    reason
}

type PipelineParts = (
    Sender<WireChunk>,
    thread::JoinHandle<()>,
    Box<dyn AudioBackend>,
);

/// Initialize decoder, playout buffer, and sink from the codec header, and
/// start the decode thread.
fn build_pipeline(
    ctx: &SessionContext,
    clock: &Arc<ClockSync>,
    token: &Arc<CancelToken>,
    playout_slot: &Arc<Mutex<Option<Arc<PlayoutBuffer>>>>,
    header: &snapstream_proto::CodecHeader,
) -> Result<PipelineParts, SessionError> {
    let mut decoder = make_decoder(&header.codec)
        .map_err(|e| SessionError::new(ErrorKind::Fatal, e.to_string()))?;
    let format = decoder
        .init(&header.payload)
        .map_err(|e| SessionError::protocol(format!("codec setup: {e}")))?;
    tracing::info!(
        codec = %header.codec,
        rate_hz = format.sample_rate,
        channels = format.channels,
        bits = format.bits_per_sample,
        "stream format"
    );

    let playout = Arc::new(PlayoutBuffer::new(
        format,
        ctx.config.playout,
        clock.clone(),
        ctx.settings.clone(),
        ctx.controls.clone(),
        ctx.diag.clone(),
    ));
    *playout_slot.lock().unwrap() = Some(playout.clone());

    let mut sink = (ctx.backend_factory)();
    sink.open(&format, playout.clone())
        .map_err(|e| SessionError::new(ErrorKind::Fatal, format!("sink open: {e}")))?;
    sink.start()
        .map_err(|e| SessionError::new(ErrorKind::Fatal, format!("sink start: {e}")))?;

    let (tx, rx) = bounded::<WireChunk>(128);
    let token = token.clone();
    let join = thread::Builder::new()
        .name("snapstream-decode".into())
        .spawn(move || {
            while let Ok(chunk) = rx.recv() {
                match decoder.decode(&chunk.payload) {
                    Ok(samples) => {
                        if !samples.is_empty() {
                            playout.enqueue(PcmChunk {
                                deadline_us: chunk.timestamp.to_micros(),
                                samples,
                            });
                        }
                    }
                    Err(DecodeError::Recoverable(e)) => {
                        tracing::debug!("chunk dropped: {e}");
                    }
                    Err(DecodeError::Fatal(e)) => {
                        token.trip(SessionError::new(ErrorKind::Fatal, e));
                        break;
                    }
                }
            }
        })
        .map_err(|e| SessionError::new(ErrorKind::Fatal, format!("spawn decoder: {e}")))?;

    Ok((tx, join, sink))
}

/// Probe scheduling and housekeeping. Ticks at 250 ms so a cancelled session
/// never waits a full probe interval to unwind.
fn spawn_probe_loop(
    ctx: &SessionContext,
    transport: Arc<Transport>,
    probes: Arc<ProbeTable>,
    clock: Arc<ClockSync>,
    token: Arc<CancelToken>,
    playout_slot: Arc<Mutex<Option<Arc<PlayoutBuffer>>>>,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let interval = ctx.config.time_probe_interval;
    let stall_ms = ctx.config.playout.stall_threshold_ms as u64;
    thread::Builder::new()
        .name("snapstream-probe".into())
        .spawn(move || {
            let ticker = tick(Duration::from_millis(250));
            let mut next_probe = Instant::now();
            loop {
                if done.load(Ordering::Acquire) || token.is_cancelled() {
                    break;
                }
                let _ = ticker.recv();
                if done.load(Ordering::Acquire) || token.is_cancelled() {
                    break;
                }

                if Instant::now() >= next_probe {
                    next_probe = Instant::now() + interval;
                    let id = probes.begin(clock.client_now_us());
                    if transport
                        .send(id, 0, &Payload::Time(Time::default()))
                        .is_err()
                    {
                        // Transport is dying; the network loop handles it.
                        continue;
                    }
                }

                let stalled = playout_slot
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|p| p.stalled_for_ms())
                    .unwrap_or(0);
                if stalled > stall_ms {
                    token.trip(SessionError::new(
                        ErrorKind::Stalled,
                        format!("{stalled} ms of continuous underrun"),
                    ));
                    break;
                }
            }
        })
        .expect("spawn probe thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn gate_blocks_new_entries_after_destroy() {
        let gate = CallbackGate::new();
        assert!(gate.enter().is_some());
        gate.destroy();
        assert!(gate.enter().is_none());
    }

    #[test]
    fn gate_destroy_waits_for_inflight() {
        let gate = Arc::new(CallbackGate::new());
        let counter = Arc::new(AtomicU64::new(0));

        let g2 = gate.clone();
        let c2 = counter.clone();
        let worker = thread::spawn(move || {
            let guard = g2.enter().unwrap();
            thread::sleep(Duration::from_millis(50));
            c2.store(1, Ordering::SeqCst);
            drop(guard);
        });

        thread::sleep(Duration::from_millis(10));
        gate.destroy();
        // destroy() must not return before the in-flight callback finished.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        worker.join().unwrap();
    }

    #[test]
    fn gate_race_fuzz_no_callback_after_destroy() {
        for _ in 0..50 {
            let gate = Arc::new(CallbackGate::new());
            let canary = Arc::new(AtomicBool::new(true));

            let mut workers = Vec::new();
            for _ in 0..4 {
                let gate = gate.clone();
                let canary = canary.clone();
                workers.push(thread::spawn(move || {
                    for _ in 0..100 {
                        if let Some(_guard) = gate.enter() {
                            // The canary must still be alive inside the gate.
                            assert!(canary.load(Ordering::SeqCst), "callback on destroyed subject");
                        }
                    }
                }));
            }

            thread::yield_now();
            gate.destroy();
            canary.store(false, Ordering::SeqCst);

            for w in workers {
                w.join().unwrap();
            }
        }
    }

    #[test]
    fn cancel_token_first_reason_wins() {
        let token = CancelToken::new();
        token.trip(SessionError::new(ErrorKind::Stalled, "first"));
        token.trip(SessionError::new(ErrorKind::Transport, "second"));
        let reason = token.taken_reason(SessionError::cancelled());
        assert_eq!(reason.kind, ErrorKind::Stalled);
        assert!(token.is_cancelled());
    }
}
