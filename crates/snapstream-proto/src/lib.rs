//! Wire protocol primitives shared by the stream client and its test servers.
//!
//! Every wire unit is a fixed 26-byte little-endian header followed by a
//! type-specific payload:
//! - kind: u16
//! - id: u16 (sender-chosen request id)
//! - refers_to: u16 (id of the message being replied to, or 0)
//! - sent: TimeVal (i32 seconds + i32 microseconds, sender clock)
//! - received: TimeVal (filled in on the receive side)
//! - size: u32 (payload length in bytes)
//!
//! JSON payload bodies (Hello, ServerSettings, ClientInfo) carry their own
//! u32 LE length prefix inside the payload.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 26;

/// Upper bound on a single payload. Anything larger is a framing error,
/// not a legitimate message.
pub const MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

/// Wire message kinds.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    CodecHeader = 1,
    WireChunk = 2,
    ServerSettings = 3,
    Time = 4,
    Hello = 5,
    ClientInfo = 7,
    Error = 8,
}

impl MessageKind {
    pub fn from_u16(v: u16) -> io::Result<Self> {
        let kind = match v {
            1 => MessageKind::CodecHeader,
            2 => MessageKind::WireChunk,
            3 => MessageKind::ServerSettings,
            4 => MessageKind::Time,
            5 => MessageKind::Hello,
            7 => MessageKind::ClientInfo,
            8 => MessageKind::Error,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message kind {v}"),
                ));
            }
        };
        Ok(kind)
    }
}

/// Seconds + microseconds pair used for all wire timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: i32,
    pub usec: i32,
}

impl TimeVal {
    pub fn from_micros(us: i64) -> Self {
        let sec = us.div_euclid(1_000_000);
        let usec = us.rem_euclid(1_000_000);
        Self {
            sec: sec as i32,
            usec: usec as i32,
        }
    }

    pub fn to_micros(self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }
}

/// Parsed 26-byte base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub id: u16,
    pub refers_to: u16,
    pub sent: TimeVal,
    pub received: TimeVal,
    pub size: u32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> io::Result<Self> {
        let kind = MessageKind::from_u16(u16::from_le_bytes([buf[0], buf[1]]))?;
        let size = u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]);
        if size > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload size {size} exceeds limit"),
            ));
        }
        Ok(Self {
            kind,
            id: u16::from_le_bytes([buf[2], buf[3]]),
            refers_to: u16::from_le_bytes([buf[4], buf[5]]),
            sent: TimeVal {
                sec: i32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
                usec: i32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
            },
            received: TimeVal {
                sec: i32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]),
                usec: i32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]),
            },
            size,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&(self.kind as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.refers_to.to_le_bytes());
        buf[6..10].copy_from_slice(&self.sent.sec.to_le_bytes());
        buf[10..14].copy_from_slice(&self.sent.usec.to_le_bytes());
        buf[14..18].copy_from_slice(&self.received.sec.to_le_bytes());
        buf[18..22].copy_from_slice(&self.received.usec.to_le_bytes());
        buf[22..26].copy_from_slice(&self.size.to_le_bytes());
        buf
    }
}

/// Client identity sent once on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "HostName")]
    pub hostname: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ClientName")]
    pub client_name: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    #[serde(rename = "Instance")]
    pub instance: u32,
    #[serde(rename = "SnapStreamProtocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "ID")]
    pub id: String,
}

/// Server-pushed playback settings. May be retransmitted at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(rename = "bufferMs")]
    pub buffer_ms: i32,
    pub latency: i32,
    pub volume: u16,
    pub muted: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            buffer_ms: 1000,
            latency: 0,
            volume: 100,
            muted: false,
        }
    }
}

/// Codec tag plus the codec-specific setup blob. Exactly one per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader {
    pub codec: String,
    pub payload: Vec<u8>,
}

/// One chunk of codec-encoded audio. The timestamp is the server-clock
/// playout deadline of the first sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    pub timestamp: TimeVal,
    pub payload: Vec<u8>,
}

/// Round-trip time probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Time {
    pub latency: TimeVal,
}

/// Client → server volume/latency report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub volume: u16,
    pub muted: bool,
    #[serde(default)]
    pub latency: i32,
}

/// Server-reported error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

/// Typed payload sum for every message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    CodecHeader(CodecHeader),
    WireChunk(WireChunk),
    ServerSettings(ServerSettings),
    Time(Time),
    Hello(Hello),
    ClientInfo(ClientInfo),
    Error(ErrorPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::CodecHeader(_) => MessageKind::CodecHeader,
            Payload::WireChunk(_) => MessageKind::WireChunk,
            Payload::ServerSettings(_) => MessageKind::ServerSettings,
            Payload::Time(_) => MessageKind::Time,
            Payload::Hello(_) => MessageKind::Hello,
            Payload::ClientInfo(_) => MessageKind::ClientInfo,
            Payload::Error(_) => MessageKind::Error,
        }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Payload::CodecHeader(h) => {
                write_prefixed_str(&mut out, &h.codec)?;
                write_prefixed_bytes(&mut out, &h.payload)?;
            }
            Payload::WireChunk(c) => {
                out.extend_from_slice(&c.timestamp.sec.to_le_bytes());
                out.extend_from_slice(&c.timestamp.usec.to_le_bytes());
                write_prefixed_bytes(&mut out, &c.payload)?;
            }
            Payload::ServerSettings(s) => write_prefixed_json(&mut out, s)?,
            Payload::Time(t) => {
                out.extend_from_slice(&t.latency.sec.to_le_bytes());
                out.extend_from_slice(&t.latency.usec.to_le_bytes());
            }
            Payload::Hello(h) => write_prefixed_json(&mut out, h)?,
            Payload::ClientInfo(i) => write_prefixed_json(&mut out, i)?,
            Payload::Error(e) => {
                out.extend_from_slice(&e.code.to_le_bytes());
                write_prefixed_str(&mut out, &e.message)?;
            }
        }
        Ok(out)
    }

    pub fn decode(kind: MessageKind, payload: &[u8]) -> io::Result<Self> {
        let mut r = SliceReader::new(payload);
        let decoded = match kind {
            MessageKind::CodecHeader => {
                let codec = r.take_prefixed_str()?;
                let payload = r.take_prefixed_bytes()?;
                Payload::CodecHeader(CodecHeader { codec, payload })
            }
            MessageKind::WireChunk => {
                let timestamp = r.take_timeval()?;
                let payload = r.take_prefixed_bytes()?;
                Payload::WireChunk(WireChunk { timestamp, payload })
            }
            MessageKind::ServerSettings => Payload::ServerSettings(r.take_prefixed_json()?),
            MessageKind::Time => Payload::Time(Time {
                latency: r.take_timeval()?,
            }),
            MessageKind::Hello => Payload::Hello(r.take_prefixed_json()?),
            MessageKind::ClientInfo => Payload::ClientInfo(r.take_prefixed_json()?),
            MessageKind::Error => {
                let code = r.take_u32()?;
                let message = r.take_prefixed_str()?;
                Payload::Error(ErrorPayload { code, message })
            }
        };
        r.expect_empty()?;
        Ok(decoded)
    }
}

/// A complete message: header plus decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Payload,
}

/// Serialize and write one message. The header's `size` is derived from the
/// encoded payload; `received` is always written as zero (the receive side
/// fills it in).
pub fn write_message(
    mut w: impl Write,
    id: u16,
    refers_to: u16,
    sent: TimeVal,
    payload: &Payload,
) -> io::Result<()> {
    let body = payload.encode()?;
    let len: u32 = body
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload too large",
        ));
    }
    let header = MessageHeader {
        kind: payload.kind(),
        id,
        refers_to,
        sent,
        received: TimeVal::default(),
        size: len,
    };
    // Single buffered write so a message is never interleaved with another.
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&body);
    w.write_all(&frame)
}

/// Read exactly one framed message. A partial read at EOF is an error.
pub fn read_message(mut r: impl Read) -> io::Result<Message> {
    let mut head = [0u8; HEADER_LEN];
    r.read_exact(&mut head)?;
    let header = MessageHeader::parse(&head)?;
    let mut body = vec![0u8; header.size as usize];
    r.read_exact(&mut body)?;
    let payload = Payload::decode(header.kind, &body)?;
    Ok(Message { header, payload })
}

fn write_prefixed_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    let len: u32 = bytes
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too large"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_prefixed_str(out: &mut Vec<u8>, s: &str) -> io::Result<()> {
    write_prefixed_bytes(out, s.as_bytes())
}

fn write_prefixed_json<T: Serialize>(out: &mut Vec<u8>, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    write_prefixed_bytes(out, &body)
}

/// Cursor over a payload slice with short-read checking.
struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short payload"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_u32(&mut self) -> io::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_i32(&mut self) -> io::Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_timeval(&mut self) -> io::Result<TimeVal> {
        Ok(TimeVal {
            sec: self.take_i32()?,
            usec: self.take_i32()?,
        })
    }

    fn take_prefixed_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.take_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn take_prefixed_str(&mut self) -> io::Result<String> {
        let bytes = self.take_prefixed_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "field not utf-8"))
    }

    fn take_prefixed_json<T: for<'de> Deserialize<'de>>(&mut self) -> io::Result<T> {
        let len = self.take_u32()? as usize;
        let body = self.take(len)?;
        serde_json::from_slice(body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    fn expect_empty(&self) -> io::Result<()> {
        if self.pos != self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes in payload",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) -> Message {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            7,
            3,
            TimeVal {
                sec: 12,
                usec: 345_678,
            },
            &payload,
        )
        .unwrap();
        let msg = read_message(buf.as_slice()).unwrap();
        assert_eq!(msg.payload, payload);
        msg
    }

    #[test]
    fn header_fields_roundtrip() {
        let msg = roundtrip(Payload::Time(Time {
            latency: TimeVal {
                sec: 1,
                usec: 500_000,
            },
        }));
        assert_eq!(msg.header.kind, MessageKind::Time);
        assert_eq!(msg.header.id, 7);
        assert_eq!(msg.header.refers_to, 3);
        assert_eq!(msg.header.sent.to_micros(), 12_345_678);
        assert_eq!(msg.header.received, TimeVal::default());
        assert_eq!(msg.header.size, 8);
    }

    #[test]
    fn hello_roundtrips() {
        roundtrip(Payload::Hello(Hello {
            mac: "00:11:22:33:44:55".into(),
            hostname: "livingroom".into(),
            version: "0.1.0".into(),
            client_name: "snapstream".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            instance: 1,
            protocol_version: 2,
            id: "b2c7a9d4".into(),
        }));
    }

    #[test]
    fn hello_json_uses_wire_field_names() {
        let hello = Hello {
            mac: "aa".into(),
            id: "dev-1".into(),
            ..Hello::default()
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["MAC"], "aa");
        assert_eq!(json["ID"], "dev-1");
        assert!(json.get("SnapStreamProtocolVersion").is_some());
    }

    #[test]
    fn server_settings_roundtrips() {
        roundtrip(Payload::ServerSettings(ServerSettings {
            buffer_ms: 150,
            latency: -20,
            volume: 70,
            muted: true,
        }));
    }

    #[test]
    fn codec_header_roundtrips() {
        roundtrip(Payload::CodecHeader(CodecHeader {
            codec: "flac".into(),
            payload: vec![0x66, 0x4c, 0x61, 0x43, 0, 0, 0, 34],
        }));
    }

    #[test]
    fn wire_chunk_roundtrips() {
        roundtrip(Payload::WireChunk(WireChunk {
            timestamp: TimeVal {
                sec: 100,
                usec: 999_999,
            },
            payload: vec![1, 2, 3, 4, 5],
        }));
    }

    #[test]
    fn client_info_and_error_roundtrip() {
        roundtrip(Payload::ClientInfo(ClientInfo {
            volume: 55,
            muted: false,
            latency: 10,
        }));
        roundtrip(Payload::Error(ErrorPayload {
            code: 42,
            message: "stream gone".into(),
        }));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = Vec::new();
        write_message(&mut buf, 1, 0, TimeVal::default(), &Payload::Time(Time::default())).unwrap();
        buf[0] = 99;
        assert!(read_message(buf.as_slice()).is_err());
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            1,
            0,
            TimeVal::default(),
            &Payload::WireChunk(WireChunk {
                timestamp: TimeVal::default(),
                payload: vec![0; 16],
            }),
        )
        .unwrap();
        buf.truncate(buf.len() - 4);
        let err = read_message(buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_header_size_rejected() {
        let header = MessageHeader {
            kind: MessageKind::WireChunk,
            id: 0,
            refers_to: 0,
            sent: TimeVal::default(),
            received: TimeVal::default(),
            size: MAX_PAYLOAD + 1,
        };
        let encoded = header.encode();
        assert!(MessageHeader::parse(&encoded).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let payload = Payload::Time(Time::default()).encode().unwrap();
        let mut oversized = payload.clone();
        oversized.push(0);
        assert!(Payload::decode(MessageKind::Time, &oversized).is_err());
    }

    #[test]
    fn timeval_micros_roundtrip() {
        for us in [0i64, 1, 999_999, 1_000_000, 1_500_000, -1, -999_999, -1_000_001] {
            assert_eq!(TimeVal::from_micros(us).to_micros(), us);
        }
    }

    #[test]
    fn timeval_negative_normalized() {
        let tv = TimeVal::from_micros(-250_000);
        assert_eq!(tv.sec, -1);
        assert_eq!(tv.usec, 750_000);
    }
}
