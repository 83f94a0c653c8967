//! Framed TCP transport.
//!
//! One connection, one read loop, writes serialized per message. All I/O
//! failures are terminal here; retry policy lives with the supervisor.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use snapstream_proto::{HEADER_LEN, Message, MessageHeader, Payload, TimeVal, write_message};
use thiserror::Error;

use crate::clock::MonotonicClock;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("end of stream")]
    EndOfStream,
    #[error("cancelled")]
    Cancelled,
    #[error("dial failed: {0}")]
    Dial(io::Error),
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("bad frame: {0}")]
    Frame(io::Error),
}

/// Resolve `host:port` to the first usable socket address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()
        .map_err(TransportError::Dial)?
        .next()
        .ok_or_else(|| {
            TransportError::Dial(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {host}:{port}"),
            ))
        })
}

pub struct Transport {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    closed: AtomicBool,
    clock: std::sync::Arc<MonotonicClock>,
}

impl Transport {
    /// Blocking dial. No retries; a failed dial is reported upward as-is.
    pub fn connect(
        addr: SocketAddr,
        timeout: Duration,
        clock: std::sync::Arc<MonotonicClock>,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(TransportError::Dial)?;
        stream.set_nodelay(true).map_err(TransportError::Dial)?;
        let writer = stream.try_clone().map_err(TransportError::Dial)?;
        Ok(Self {
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            clock,
        })
    }

    /// Serialize and write one message. Writes are atomic per message: the
    /// frame is built in memory and written under the writer lock.
    pub fn send(
        &self,
        id: u16,
        refers_to: u16,
        payload: &Payload,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }
        let sent = TimeVal::from_micros(self.clock.now_us());
        let mut w = self.writer.lock().unwrap();
        write_message(&mut *w, id, refers_to, sent, payload).map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                TransportError::Cancelled
            } else {
                TransportError::Write(e)
            }
        })?;
        w.flush().map_err(TransportError::Write)
    }

    /// Read exactly one framed message.
    ///
    /// The header's `received` stamp is taken when the first byte of the
    /// message is observed. A clean EOF between messages is `EndOfStream`;
    /// an EOF inside a frame is a protocol error.
    pub fn recv(&self) -> Result<Message, TransportError> {
        let mut r = self.reader.lock().unwrap();
        let mut head = [0u8; HEADER_LEN];

        match r.read(&mut head[..1]) {
            Ok(0) => return Err(self.closed_or(TransportError::EndOfStream)),
            Ok(_) => {}
            Err(e) => return Err(self.closed_or(TransportError::Read(e))),
        }
        let received = TimeVal::from_micros(self.clock.now_us());

        read_full(&mut *r, &mut head[1..]).map_err(|e| self.closed_or(e))?;
        let mut header = MessageHeader::parse(&head).map_err(TransportError::Frame)?;
        header.received = received;

        let mut body = vec![0u8; header.size as usize];
        read_full(&mut *r, &mut body).map_err(|e| self.closed_or(e))?;
        let payload = Payload::decode(header.kind, &body).map_err(TransportError::Frame)?;
        Ok(Message { header, payload })
    }

    /// Shut the socket down, failing all outstanding reads and writes.
    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Ok(r) = self.reader.try_lock() {
                let _ = r.shutdown(Shutdown::Both);
            } else if let Ok(w) = self.writer.lock() {
                let _ = w.shutdown(Shutdown::Both);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed_or(&self, err: TransportError) -> TransportError {
        if self.closed.load(Ordering::Acquire) {
            TransportError::Cancelled
        } else {
            err
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.reader.get_mut().unwrap().shutdown(Shutdown::Both);
    }
}

fn read_full(r: &mut TcpStream, buf: &mut [u8]) -> Result<(), TransportError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::Frame(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside frame",
            ))
        } else {
            TransportError::Read(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapstream_proto::{Time, read_message};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn loopback_pair() -> (Transport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let clock = Arc::new(MonotonicClock::new());
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let transport = Transport::connect(addr, Duration::from_secs(1), clock).unwrap();
        (transport, accept.join().unwrap())
    }

    #[test]
    fn send_and_recv_roundtrip_with_received_stamp() {
        let (transport, mut peer) = loopback_pair();

        transport
            .send(5, 0, &Payload::Time(Time::default()))
            .unwrap();
        let echoed = read_message(&mut peer).unwrap();
        assert_eq!(echoed.header.id, 5);

        snapstream_proto::write_message(
            &mut peer,
            9,
            5,
            TimeVal::from_micros(123_456),
            &Payload::Time(Time::default()),
        )
        .unwrap();
        let msg = transport.recv().unwrap();
        assert_eq!(msg.header.id, 9);
        assert_eq!(msg.header.refers_to, 5);
        assert!(msg.header.received.to_micros() > 0);
    }

    #[test]
    fn peer_close_between_messages_is_end_of_stream() {
        let (transport, peer) = loopback_pair();
        drop(peer);
        assert!(matches!(
            transport.recv(),
            Err(TransportError::EndOfStream)
        ));
    }

    #[test]
    fn peer_close_inside_frame_is_frame_error() {
        let (transport, mut peer) = loopback_pair();
        // Half a header, then hang up.
        peer.write_all(&[0u8; 10]).unwrap();
        drop(peer);
        assert!(matches!(transport.recv(), Err(TransportError::Frame(_))));
    }

    #[test]
    fn close_unblocks_pending_recv() {
        let (transport, _peer) = loopback_pair();
        let transport = Arc::new(transport);
        let t2 = transport.clone();
        let reader = thread::spawn(move || t2.recv());
        thread::sleep(Duration::from_millis(50));
        transport.close();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(TransportError::Cancelled)));
        // Idempotent.
        transport.close();
        assert!(matches!(
            transport.send(1, 0, &Payload::Time(Time::default())),
            Err(TransportError::Cancelled)
        ));
    }
}
