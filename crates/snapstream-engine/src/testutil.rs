//! In-process mock stream server for integration tests.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use snapstream_proto::{
    CodecHeader, Message, MessageKind, Payload, ServerSettings, Time, TimeVal, WireChunk,
    read_message, write_message,
};

/// What the mock does with each accepted connection.
#[derive(Debug, Clone)]
pub(crate) enum ServerBehavior {
    /// Accept the TCP connection and never speak.
    AcceptOnly,
    /// Violate the handshake: send an audio chunk immediately.
    ChunkFirst,
    /// Full PCM handshake, then paced chunks.
    Pcm {
        chunk_ms: u64,
        total_chunks: usize,
        /// How far in the server future each chunk's deadline sits.
        lead_ms: i64,
        /// Drop the connection once all chunks are sent.
        close_after: bool,
    },
}

pub(crate) struct MockServer {
    port: u16,
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    pub(crate) fn spawn(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        // One shared server clock so reconnects see a consistent timeline,
        // offset far from the client's to make sync meaningful.
        let epoch = Instant::now();

        let stop_accept = stop.clone();
        let join = thread::spawn(move || {
            let mut connections = Vec::new();
            while !stop_accept.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let behavior = behavior.clone();
                        let stop = stop_accept.clone();
                        connections.push(thread::spawn(move || {
                            serve_connection(stream, &behavior, &stop, epoch);
                        }));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
            for conn in connections {
                let _ = conn.join();
            }
        });

        Self {
            port,
            stop,
            join: Some(join),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn server_now_us(epoch: Instant) -> i64 {
    1_000_000_000_000 + epoch.elapsed().as_micros() as i64
}

pub(crate) fn wave_header(rate: u32, channels: u16, bits: u16) -> Vec<u8> {
    let block_align = channels * bits / 8;
    let mut h = Vec::new();
    h.extend_from_slice(b"RIFF");
    h.extend_from_slice(&36u32.to_le_bytes());
    h.extend_from_slice(b"WAVE");
    h.extend_from_slice(b"fmt ");
    h.extend_from_slice(&16u32.to_le_bytes());
    h.extend_from_slice(&1u16.to_le_bytes());
    h.extend_from_slice(&channels.to_le_bytes());
    h.extend_from_slice(&rate.to_le_bytes());
    h.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
    h.extend_from_slice(&block_align.to_le_bytes());
    h.extend_from_slice(&bits.to_le_bytes());
    h
}

/// Write one message; returns false once the peer is gone.
fn send(
    writer: &Mutex<TcpStream>,
    id: u16,
    refers_to: u16,
    epoch: Instant,
    payload: &Payload,
) -> bool {
    let mut w = writer.lock().unwrap();
    let sent = TimeVal::from_micros(server_now_us(epoch));
    write_message(&mut *w, id, refers_to, sent, payload).is_ok() && w.flush().is_ok()
}

/// Reader half: consume Hello/ClientInfo, answer Time probes. Flags
/// `peer_gone` when the client hangs up.
fn spawn_probe_responder(
    stream: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    stop: Arc<AtomicBool>,
    peer_gone: Arc<AtomicBool>,
    epoch: Instant,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut stream = stream;
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        while !stop.load(Ordering::Acquire) {
            let msg: Message = match read_message(&mut stream) {
                Ok(m) => m,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => break,
            };
            if msg.header.kind == MessageKind::Time {
                let t2 = server_now_us(epoch);
                let t1 = msg.header.sent.to_micros();
                send(
                    &writer,
                    100,
                    msg.header.id,
                    epoch,
                    &Payload::Time(Time {
                        latency: TimeVal::from_micros(t2 - t1),
                    }),
                );
            }
        }
        peer_gone.store(true, Ordering::Release);
    })
}

fn park_until(stop: &AtomicBool, peer_gone: &AtomicBool) {
    while !stop.load(Ordering::Acquire) && !peer_gone.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(20));
    }
}

fn serve_connection(
    stream: TcpStream,
    behavior: &ServerBehavior,
    stop: &Arc<AtomicBool>,
    epoch: Instant,
) {
    stream.set_nodelay(true).unwrap();

    if let ServerBehavior::AcceptOnly = behavior {
        // Truly mute peer: no probe replies, no handshake, just a socket.
        let never = AtomicBool::new(false);
        park_until(stop, &never);
        let _ = stream.shutdown(std::net::Shutdown::Both);
        return;
    }

    let reader = stream.try_clone().unwrap();
    let writer = Arc::new(Mutex::new(stream));
    let peer_gone = Arc::new(AtomicBool::new(false));

    let responder = spawn_probe_responder(
        reader,
        writer.clone(),
        stop.clone(),
        peer_gone.clone(),
        epoch,
    );

    match behavior {
        ServerBehavior::AcceptOnly => unreachable!("handled above"),
        ServerBehavior::ChunkFirst => {
            send(
                &writer,
                1,
                0,
                epoch,
                &Payload::WireChunk(WireChunk {
                    timestamp: TimeVal::from_micros(server_now_us(epoch)),
                    payload: vec![0u8; 64],
                }),
            );
            park_until(stop, &peer_gone);
        }
        ServerBehavior::Pcm {
            chunk_ms,
            total_chunks,
            lead_ms,
            close_after,
        } => {
            send(
                &writer,
                1,
                0,
                epoch,
                &Payload::ServerSettings(ServerSettings {
                    buffer_ms: 150,
                    latency: 0,
                    volume: 100,
                    muted: false,
                }),
            );
            send(
                &writer,
                2,
                0,
                epoch,
                &Payload::CodecHeader(CodecHeader {
                    codec: "pcm".into(),
                    payload: wave_header(48_000, 2, 16),
                }),
            );

            let frames = (48_000 * chunk_ms / 1000) as usize;
            let mut payload = Vec::with_capacity(frames * 4);
            for _ in 0..frames {
                payload.extend_from_slice(&1000i16.to_le_bytes());
                payload.extend_from_slice(&1000i16.to_le_bytes());
            }

            for _ in 0..*total_chunks {
                if stop.load(Ordering::Acquire) || peer_gone.load(Ordering::Acquire) {
                    break;
                }
                let delivered = send(
                    &writer,
                    3,
                    0,
                    epoch,
                    &Payload::WireChunk(WireChunk {
                        timestamp: TimeVal::from_micros(server_now_us(epoch) + lead_ms * 1000),
                        payload: payload.clone(),
                    }),
                );
                if !delivered {
                    break;
                }
                thread::sleep(Duration::from_millis(*chunk_ms));
            }
            if !close_after {
                park_until(stop, &peer_gone);
            }
        }
    }

    // Shut the socket down so the responder's reader unblocks too.
    let _ = writer
        .lock()
        .unwrap()
        .shutdown(std::net::Shutdown::Both);
    let _ = responder.join();
}
