//! Upstream transport
//!
//! The engine only needs a bidirectional, message-oriented pipe. A
//! [`Transport`] moves already-encoded messages (see
//! [`tessera_protocol::WireMessage::encode`]) and reports inbound messages
//! and closure on the event channel handed to [`Transport::connect`].
//!
//! [`TcpTransport`] is the bundled implementation: CRC-checked frames over a
//! plain TCP stream, with one reader thread per connection.

use crate::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tessera_protocol::{Frame, FrameKind, ProtocolError};

/// Events reported by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One inbound encoded message
    Message(Bytes),
    /// The connection ended; carries the reason when it was not a clean close
    Closed(Option<String>),
}

/// A message pipe to the upstream
pub trait Transport: Send + Sync {
    /// Open a connection to `uri`, blocking until it is usable. Inbound
    /// messages and the eventual close are reported on `events`.
    fn connect(&self, uri: &str, events: Sender<TransportEvent>) -> Result<()>;

    /// Send one encoded message
    fn send(&self, message: Bytes) -> Result<()>;

    /// Close the current connection, if any
    fn close(&self);

    /// Whether a connection is open
    fn is_connected(&self) -> bool;
}

struct TcpConnection {
    writer: BufWriter<TcpStream>,
    stream: TcpStream,
    reader: Option<JoinHandle<()>>,
}

/// Length-prefixed, CRC-checked frames over TCP
pub struct TcpTransport {
    connect_timeout: Duration,
    connection: Mutex<Option<TcpConnection>>,
    connected: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Create a transport with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `tcp://host:port/...` or `host:port`
    fn socket_addr(uri: &str) -> Result<std::net::SocketAddr> {
        let rest = uri.strip_prefix("tcp://").unwrap_or(uri);
        let authority = rest.split('/').next().unwrap_or(rest);
        authority
            .to_socket_addrs()
            .map_err(|e| Error::config(format!("Invalid upstream address '{}': {}", uri, e)))?
            .next()
            .ok_or_else(|| Error::config(format!("Upstream address '{}' did not resolve", uri)))
    }

    fn reader_loop(stream: TcpStream, events: Sender<TransportEvent>, connected: Arc<AtomicBool>) {
        let mut reader = BufReader::new(stream);
        let reason = loop {
            match Frame::read_from(&mut reader) {
                Ok(frame) => match frame.kind {
                    FrameKind::Message => {
                        if events.send(TransportEvent::Message(frame.payload)).is_err() {
                            break None;
                        }
                    }
                    FrameKind::Close => break None,
                },
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break None;
                }
                Err(e) => break Some(e.to_string()),
            }
        };
        connected.store(false, Ordering::SeqCst);
        let _ = events.send(TransportEvent::Closed(reason));
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Transport for TcpTransport {
    fn connect(&self, uri: &str, events: Sender<TransportEvent>) -> Result<()> {
        self.close();

        let addr = Self::socket_addr(uri)?;
        tracing::info!("Connecting to upstream at {}", addr);
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;

        let read_half = stream.try_clone()?;
        let writer = BufWriter::new(stream.try_clone()?);
        self.connected.store(true, Ordering::SeqCst);

        let connected = self.connected.clone();
        let reader = thread::Builder::new()
            .name("tessera-tcp-reader".into())
            .spawn(move || Self::reader_loop(read_half, events, connected))?;

        *self.connection.lock() = Some(TcpConnection {
            writer,
            stream,
            reader: Some(reader),
        });
        Ok(())
    }

    fn send(&self, message: Bytes) -> Result<()> {
        let mut guard = self.connection.lock();
        let conn = guard.as_mut().ok_or(Error::Disconnected)?;
        Frame::message(message).write_to(&mut conn.writer)?;
        conn.writer.flush()?;
        Ok(())
    }

    fn close(&self) {
        let Some(mut conn) = self.connection.lock().take() else {
            return;
        };
        let _ = Frame::close().write_to(&mut conn.writer);
        let _ = conn.writer.flush();
        let _ = conn.stream.shutdown(Shutdown::Both);
        if let Some(reader) = conn.reader.take() {
            let _ = reader.join();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::net::TcpListener;

    #[test]
    fn test_socket_addr_parsing() {
        assert!(TcpTransport::socket_addr("tcp://127.0.0.1:4000/graphs").is_ok());
        assert!(TcpTransport::socket_addr("127.0.0.1:4000").is_ok());
        assert!(TcpTransport::socket_addr("tcp://nonsense").is_err());
    }

    #[test]
    fn test_send_and_receive_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let frame = Frame::read_from(&mut stream).unwrap();
            Frame::message(frame.payload).write_to(&mut stream).unwrap();
            Frame::close().write_to(&mut stream).unwrap();
        });

        let transport = TcpTransport::default();
        let (tx, rx) = unbounded();
        transport.connect(&format!("tcp://{}", addr), tx).unwrap();
        assert!(transport.is_connected());

        transport.send(Bytes::from_static(b"echo")).unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            TransportEvent::Message(payload) => assert_eq!(&payload[..], b"echo"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TransportEvent::Closed(None)
        ));
        server.join().unwrap();
        transport.close();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_send_without_connection() {
        let transport = TcpTransport::default();
        assert!(matches!(
            transport.send(Bytes::from_static(b"x")),
            Err(Error::Disconnected)
        ));
    }
}
