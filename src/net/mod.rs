pub mod connection;
pub mod framing;
pub mod handshake;
pub mod tcp_opt;
pub mod tls_server;
pub mod transport;

pub use connection::{Connection, ConnectionError, ReadEvent};
pub use transport::{PlainTransport, Transport};
