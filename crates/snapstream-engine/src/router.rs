//! Inbound message routing and the protocol handshake.
//!
//! The mandatory order is Hello (out) → ServerSettings → CodecHeader →
//! steady state. Settings retransmissions and Time replies may interleave at
//! any point; an audio chunk before the codec header is a protocol error and
//! ends the session. The router itself is socket-free so the handshake rules
//! are testable in isolation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};

use snapstream_proto::{Hello, Message, Payload};

use crate::error::SessionError;
use crate::settings::SharedSettings;

pub(crate) const PROTOCOL_VERSION: u32 = 2;

/// Replies to probes older than this no longer update the clock.
const PROBE_STALE_US: i64 = 3_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitSettings,
    AwaitCodec,
    Streaming,
}

/// What the session should do with one routed message.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Nothing actionable (e.g. a stale time reply).
    None,
    /// First ServerSettings arrived; the handshake is underway.
    Connected,
    /// Codec header: build the decoder pipeline.
    Codec(snapstream_proto::CodecHeader),
    /// Audio chunk for the decode stage.
    Chunk(snapstream_proto::WireChunk),
    /// Completed time exchange, microsecond timestamps t1..t4.
    TimeSample { t1: i64, t2: i64, t3: i64, t4: i64 },
}

/// Outstanding time probes, shared between the probe scheduler and the
/// routing thread.
pub(crate) struct ProbeTable {
    inner: Mutex<HashMap<u16, i64>>,
    next_id: AtomicU16,
}

impl ProbeTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(1),
        }
    }

    /// Register a new probe sent at `now_us` and return its message id.
    /// Entries past the staleness horizon are pruned here.
    pub(crate) fn begin(&self, now_us: i64) -> u16 {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, &mut sent| now_us - sent <= PROBE_STALE_US);
        map.insert(id, now_us);
        id
    }

    /// Look up and consume the send time of a probe, if it is still fresh.
    pub(crate) fn resolve(&self, refers_to: u16, now_us: i64) -> Option<i64> {
        let mut map = self.inner.lock().unwrap();
        let sent = map.remove(&refers_to)?;
        if now_us - sent > PROBE_STALE_US {
            return None;
        }
        Some(sent)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

pub(crate) struct Router<'a> {
    phase: Phase,
    probes: &'a ProbeTable,
    settings: &'a SharedSettings,
}

impl<'a> Router<'a> {
    pub(crate) fn new(probes: &'a ProbeTable, settings: &'a SharedSettings) -> Self {
        Self {
            phase: Phase::AwaitSettings,
            probes,
            settings,
        }
    }

    pub(crate) fn handshake_complete(&self) -> bool {
        self.phase == Phase::Streaming
    }

    /// Route one inbound message. `Err` means the session must end.
    pub(crate) fn route(&mut self, msg: Message) -> Result<Dispatch, SessionError> {
        match msg.payload {
            Payload::ServerSettings(s) => {
                self.settings.apply(&s);
                if self.phase == Phase::AwaitSettings {
                    self.phase = Phase::AwaitCodec;
                    return Ok(Dispatch::Connected);
                }
                Ok(Dispatch::None)
            }
            Payload::CodecHeader(h) => match self.phase {
                Phase::AwaitCodec => {
                    self.phase = Phase::Streaming;
                    tracing::info!(codec = %h.codec, "codec header received");
                    Ok(Dispatch::Codec(h))
                }
                Phase::AwaitSettings => Err(SessionError::protocol(
                    "codec header before server settings",
                )),
                Phase::Streaming => {
                    Err(SessionError::protocol("second codec header in session"))
                }
            },
            Payload::WireChunk(c) => {
                if self.phase != Phase::Streaming {
                    return Err(SessionError::protocol("audio chunk before codec header"));
                }
                Ok(Dispatch::Chunk(c))
            }
            Payload::Time(t) => {
                let t4 = msg.header.received.to_micros();
                let Some(t1) = self.probes.resolve(msg.header.refers_to, t4) else {
                    tracing::debug!(
                        refers_to = msg.header.refers_to,
                        "discarding unmatched time reply"
                    );
                    return Ok(Dispatch::None);
                };
                // The reply's latency field carries t2 - t1; the header's
                // sent stamp is t3 on the server clock.
                let t2 = t1 + t.latency.to_micros();
                let t3 = msg.header.sent.to_micros();
                Ok(Dispatch::TimeSample { t1, t2, t3, t4 })
            }
            Payload::Error(e) => Err(SessionError::protocol(format!(
                "server error {}: {}",
                e.code, e.message
            ))),
            Payload::Hello(_) | Payload::ClientInfo(_) => {
                Err(SessionError::protocol("client-bound message from server"))
            }
        }
    }
}

/// Build the identity payload for the initial handshake message.
pub(crate) fn make_hello(client_name: &str, client_id: &str, instance: u32) -> Hello {
    Hello {
        mac: "00:00:00:00:00:00".to_string(),
        hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        client_name: client_name.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        instance,
        protocol_version: PROTOCOL_VERSION,
        id: client_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use snapstream_proto::{
        CodecHeader, MessageHeader, MessageKind, ServerSettings, Time, TimeVal, WireChunk,
    };

    fn msg(payload: Payload, refers_to: u16, sent_us: i64, received_us: i64) -> Message {
        Message {
            header: MessageHeader {
                kind: payload.kind(),
                id: 1,
                refers_to,
                sent: TimeVal::from_micros(sent_us),
                received: TimeVal::from_micros(received_us),
                size: 0,
            },
            payload,
        }
    }

    fn settings_msg() -> Message {
        msg(
            Payload::ServerSettings(ServerSettings::default()),
            0,
            0,
            0,
        )
    }

    fn codec_msg() -> Message {
        msg(
            Payload::CodecHeader(CodecHeader {
                codec: "pcm".into(),
                payload: vec![],
            }),
            0,
            0,
            0,
        )
    }

    fn chunk_msg() -> Message {
        msg(
            Payload::WireChunk(WireChunk {
                timestamp: TimeVal::default(),
                payload: vec![0, 0],
            }),
            0,
            0,
            0,
        )
    }

    #[test]
    fn happy_handshake_order() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);

        assert!(matches!(
            router.route(settings_msg()).unwrap(),
            Dispatch::Connected
        ));
        assert!(matches!(router.route(codec_msg()).unwrap(), Dispatch::Codec(_)));
        assert!(router.handshake_complete());
        assert!(matches!(router.route(chunk_msg()).unwrap(), Dispatch::Chunk(_)));
    }

    #[test]
    fn chunk_before_codec_header_is_protocol_error() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);

        router.route(settings_msg()).unwrap();
        let err = router.route(chunk_msg()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn chunk_before_settings_is_protocol_error() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);
        let err = router.route(chunk_msg()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn second_codec_header_is_protocol_error() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);
        router.route(settings_msg()).unwrap();
        router.route(codec_msg()).unwrap();
        let err = router.route(codec_msg()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn settings_retransmission_applies_silently() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);
        router.route(settings_msg()).unwrap();
        router.route(codec_msg()).unwrap();

        let update = msg(
            Payload::ServerSettings(ServerSettings {
                buffer_ms: 150,
                latency: 5,
                volume: 42,
                muted: false,
            }),
            0,
            0,
            0,
        );
        assert!(matches!(router.route(update).unwrap(), Dispatch::None));
        assert_eq!(settings.snapshot().volume, 42);
    }

    #[test]
    fn time_reply_resolves_probe() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);

        let id = probes.begin(1_000_000);
        let reply = Message {
            header: MessageHeader {
                kind: MessageKind::Time,
                id: 9,
                refers_to: id,
                sent: TimeVal::from_micros(5_000_500), // t3
                received: TimeVal::from_micros(1_002_000), // t4
                size: 8,
            },
            payload: Payload::Time(Time {
                latency: TimeVal::from_micros(4_000_000), // t2 - t1
            }),
        };
        match router.route(reply).unwrap() {
            Dispatch::TimeSample { t1, t2, t3, t4 } => {
                assert_eq!(t1, 1_000_000);
                assert_eq!(t2, 5_000_000);
                assert_eq!(t3, 5_000_500);
                assert_eq!(t4, 1_002_000);
            }
            other => panic!("unexpected dispatch {other:?}"),
        }
    }

    #[test]
    fn stale_time_reply_discarded() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);

        let id = probes.begin(0);
        // Reply lands 5 seconds later: past the staleness horizon.
        let reply = msg(Payload::Time(Time::default()), id, 0, 5_000_000);
        assert!(matches!(router.route(reply).unwrap(), Dispatch::None));
    }

    #[test]
    fn unknown_refers_to_discarded() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);
        let reply = msg(Payload::Time(Time::default()), 77, 0, 100);
        assert!(matches!(router.route(reply).unwrap(), Dispatch::None));
    }

    #[test]
    fn probe_table_prunes_stale_entries() {
        let probes = ProbeTable::new();
        probes.begin(0);
        probes.begin(1_000_000);
        assert_eq!(probes.len(), 2);
        probes.begin(10_000_000);
        assert_eq!(probes.len(), 1);
    }

    #[test]
    fn server_error_message_ends_session() {
        let probes = ProbeTable::new();
        let settings = SharedSettings::new();
        let mut router = Router::new(&probes, &settings);
        let err = router
            .route(msg(
                Payload::Error(snapstream_proto::ErrorPayload {
                    code: 1,
                    message: "bad client".into(),
                }),
                0,
                0,
                0,
            ))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn hello_payload_is_populated() {
        let hello = make_hello("living room", "abc-123", 1);
        assert_eq!(hello.client_name, "living room");
        assert_eq!(hello.id, "abc-123");
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
        assert!(!hello.os.is_empty());
        assert!(!hello.arch.is_empty());
    }
}
