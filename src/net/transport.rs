use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

/// Byte pipe under a WebSocket connection: a bare TCP stream or a TLS
/// session on top of one.
///
/// All calls are non-blocking. `read` returns `Ok(0)` at end of stream and
/// `WouldBlock` once the socket is drained.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Pushes bytes buffered below the caller (TLS records) to the socket.
    fn flush(&mut self) -> io::Result<()>;

    /// Bytes are buffered inside the transport waiting for the socket.
    fn wants_write(&self) -> bool;

    fn is_secure(&self) -> bool;

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    fn shutdown(&mut self);
}

/// Plain `ws://` transport.
pub struct PlainTransport {
    socket: TcpStream,
}

impl PlainTransport {
    pub fn new(socket: TcpStream) -> Self {
        Self { socket }
    }
}

impl Transport for PlainTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket.flush()
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.socket, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.socket, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    fn shutdown(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}
