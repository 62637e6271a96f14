use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

/// Pending connections the kernel queues while the loop is busy.
pub const LISTEN_BACKLOG: i32 = 128;

/// Creates the non-blocking listening socket.
///
/// `SO_REUSEADDR` lets a restarted server rebind while old connections sit
/// in TIME_WAIT.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Per-connection flags for an accepted stream. Small envelopes go out
/// immediately instead of waiting on Nagle.
pub fn apply_optimizations(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
