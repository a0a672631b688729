//! Transport abstraction: any non-blocking, byte-oriented stream.
//!
//! Concrete implementations:
//! - [`TcpTransport`]: a non-blocking `std::net::TcpStream`
//! - [`LoopbackTransport`]: an in-process pipe pair with optional
//!   read/write throttling, used to exercise fragmentation and short writes
//!
//! The channel is generic over `Transport`, so adding a new transport
//! requires zero changes to the RPC logic.

use core::cell::RefCell;
use core::fmt;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::rc::Rc;

/// Byte-oriented transport channel.
pub trait Transport {
    /// Error type for this transport.
    type Error: fmt::Debug;

    /// Read up to `buf.len()` bytes into `buf`.
    ///
    /// Returns 0 if no data is available right now (non-blocking).
    /// Returns an error once the peer has gone away.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write `data` in one attempt and return how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Close the connection. Idempotent.
    fn close(&mut self);

    /// Whether the transport still refers to an open connection.
    fn is_readable(&self) -> bool;
}

// ── Loopback ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackError {
    /// This end, or its peer, has been closed.
    Closed,
}

impl fmt::Display for LoopbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("loopback closed")
    }
}

impl std::error::Error for LoopbackError {}

#[derive(Debug, Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    closed: bool,
}

type SharedPipe = Rc<RefCell<Pipe>>;

/// One end of an in-process duplex byte pipe.
///
/// Closing either end closes both directions; bytes already queued can
/// still be drained by the reader before it sees [`LoopbackError::Closed`].
#[derive(Debug)]
pub struct LoopbackTransport {
    inbound: SharedPipe,
    outbound: SharedPipe,
    read_limit: usize,
    write_limit: usize,
    open: bool,
}

impl LoopbackTransport {
    pub fn pair() -> (Self, Self) {
        let a_to_b = SharedPipe::default();
        let b_to_a = SharedPipe::default();
        let a = Self::end(b_to_a.clone(), a_to_b.clone());
        let b = Self::end(a_to_b, b_to_a);
        (a, b)
    }

    fn end(inbound: SharedPipe, outbound: SharedPipe) -> Self {
        Self {
            inbound,
            outbound,
            read_limit: usize::MAX,
            write_limit: usize::MAX,
            open: true,
        }
    }

    /// Return at most `limit` bytes per `read` call.
    pub fn set_read_limit(&mut self, limit: usize) {
        self.read_limit = limit.max(1);
    }

    /// Accept at most `limit` bytes per `write` call.
    pub fn set_write_limit(&mut self, limit: usize) {
        self.write_limit = limit;
    }

    /// Bytes queued for this end to read.
    pub fn pending(&self) -> usize {
        self.inbound.borrow().bytes.len()
    }

    /// Whether either end has closed the link.
    pub fn is_link_closed(&self) -> bool {
        !self.open || self.outbound.borrow().closed
    }
}

impl Transport for LoopbackTransport {
    type Error = LoopbackError;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LoopbackError> {
        if !self.open {
            return Err(LoopbackError::Closed);
        }
        let mut pipe = self.inbound.borrow_mut();
        if pipe.bytes.is_empty() {
            return if pipe.closed {
                Err(LoopbackError::Closed)
            } else {
                Ok(0)
            };
        }
        let n = buf.len().min(self.read_limit).min(pipe.bytes.len());
        for (dst, src) in buf.iter_mut().zip(pipe.bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, LoopbackError> {
        let mut pipe = self.outbound.borrow_mut();
        if !self.open || pipe.closed {
            return Err(LoopbackError::Closed);
        }
        let n = data.len().min(self.write_limit);
        pipe.bytes.extend(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        self.open = false;
        self.inbound.borrow_mut().closed = true;
        self.outbound.borrow_mut().closed = true;
    }

    fn is_readable(&self) -> bool {
        self.open
    }
}

// ── TCP ──────────────────────────────────────────────────────

/// A non-blocking TCP connection.
///
/// `WouldBlock` maps to `Ok(0)`; end-of-stream maps to
/// `ErrorKind::UnexpectedEof` so the channel treats it as a close.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }
}

impl Transport for TcpTransport {
    type Error = io::Error;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream()?.read(buf) {
            Ok(0) => Err(io::Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_readable(&self) -> bool {
        self.stream.is_some()
    }
}
