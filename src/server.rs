//! The single-threaded readiness loop: accepts clients, reads their frames
//! and applies what the router decides.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use rustls::ServerConfig;
use thiserror::Error;

use crate::config::Config;
use crate::crypto::{Cipher, CipherError};
use crate::net::framing::ProtocolSignal;
use crate::net::tcp_opt;
use crate::net::tls_server::{load_server_config, TlsServer, TlsSetupError};
use crate::net::{Connection, ConnectionError, PlainTransport, ReadEvent, Transport};
use crate::protocol::inbound;
use crate::protocol::{ConnectionId, Outbound};
use crate::router::{MessageRouter, RouterStats};
use crate::session::{Effect, SessionRegistry};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
/// Client tokens start here; `ConnectionId(n)` is registered as `Token(n)`.
const FIRST_CLIENT: usize = 2;
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] TlsSetupError),
    #[error("invalid secret: {0}")]
    Cipher(#[from] CipherError),
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    pub fn stop(&self) -> io::Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    connections: HashMap<ConnectionId, Connection>,
    registry: SessionRegistry,
    router: MessageRouter,
    cipher: Cipher,
    tls: Option<Arc<ServerConfig>>,
    next_id: usize,
    /// The listener fired and may still hold queued connections.
    accept_pending: bool,
    max_buffer_size: usize,
    mask_outgoing: bool,
    last_stats: RouterStats,
}

impl Server {
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let cipher = Cipher::new(&config.secret)?;
        let tls = match &config.tls {
            Some(files) => Some(load_server_config(&files.cert, &files.key)?),
            None => None,
        };

        let poll = Poll::new()?;
        let mut listener = tcp_opt::bind_listener(config.listen)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let local_addr = listener.local_addr()?;

        info!(
            "listening on {}://{local_addr} (max buffer {} bytes, masked output {})",
            if tls.is_some() { "wss" } else { "ws" },
            config.max_buffer_size,
            config.mask_outgoing
        );

        Ok(Self {
            poll,
            listener,
            local_addr,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            connections: HashMap::new(),
            registry: SessionRegistry::new(),
            router: MessageRouter::new(),
            cipher,
            tls,
            next_id: FIRST_CLIENT,
            accept_pending: false,
            max_buffer_size: config.max_buffer_size,
            mask_outgoing: config.mask_outgoing,
            last_stats: RouterStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs until [`ServerHandle::stop`] is called. Only a failing poll ends
    /// the loop early; per-client failures close that client.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.stop.load(Ordering::SeqCst) {
            self.idle();

            // a backlog left by the one-per-iteration accept will not fire again
            let timeout = self.accept_pending.then_some(Duration::ZERO);
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending = true,
                    WAKER => trace!("woken"),
                    Token(n) => {
                        let readable =
                            event.is_readable() || event.is_read_closed() || event.is_error();
                        self.on_client_event(ConnectionId(n), readable, event.is_writable());
                    }
                }
            }

            if self.accept_pending {
                self.accept_one();
            }
        }

        self.shutdown();
        Ok(())
    }

    fn idle(&mut self) {
        let stats = self.router.stats();
        if stats != self.last_stats {
            debug!(
                "connections {} sessions {} routed {} dropped {} rejected {}",
                self.connections.len(),
                self.registry.session_count(),
                stats.routed,
                stats.dropped,
                stats.rejected
            );
            self.last_stats = stats;
        }
    }

    fn accept_one(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                self.accept_pending = false;
                return;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => return,
            Err(e) => {
                error!("accept failed: {e}");
                self.accept_pending = false;
                return;
            }
        };

        if let Err(err) = tcp_opt::apply_optimizations(&stream) {
            debug!("could not set socket options for {peer}: {err}");
        }

        let transport: Box<dyn Transport> = match &self.tls {
            Some(config) => match TlsServer::new(stream, Arc::clone(config)) {
                Ok(tls) => Box::new(tls),
                Err(err) => {
                    warn!("tls session setup for {peer} failed: {err}");
                    return;
                }
            },
            None => Box::new(PlainTransport::new(stream)),
        };

        let id = self.allocate_id();
        let mut connection = Connection::new(id, transport, self.max_buffer_size, self.mask_outgoing);
        if let Err(err) = connection.register(self.poll.registry()) {
            warn!("{id}: could not register {peer}: {err}");
            return;
        }
        debug!("{id}: accepted {peer}");
        self.connections.insert(id, connection);
    }

    fn allocate_id(&mut self) -> ConnectionId {
        loop {
            let id = ConnectionId(self.next_id);
            self.next_id = self.next_id.checked_add(1).unwrap_or(FIRST_CLIENT);
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    /// Handles one readiness event. Errors and panics close the client and
    /// never reach the loop.
    fn on_client_event(&mut self, id: ConnectionId, readable: bool, writable: bool) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handle_client(id, readable, writable)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log_failure(id, &err);
                self.disconnect(id);
            }
            Err(_) => {
                error!("{id}: panic while handling event, disconnecting");
                self.disconnect(id);
            }
        }
    }

    fn handle_client(&mut self, id: ConnectionId, readable: bool, writable: bool) -> Result<(), ConnectionError> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        if writable {
            connection.flush_and_update(self.poll.registry())?;
        }
        if !readable {
            return Ok(());
        }

        let events = connection.on_readable()?;
        connection.flush_and_update(self.poll.registry())?;

        for event in events {
            if !self.connections.contains_key(&id) {
                break;
            }
            match event {
                ReadEvent::Upgraded(request) => {
                    info!("{id}: websocket open on {}", request.path);
                }
                ReadEvent::Data(payload) => self.on_message(id, &payload),
                ReadEvent::Closed => {
                    debug!("{id}: peer closed the stream");
                    self.disconnect(id);
                    break;
                }
                ReadEvent::Ended(signal) => {
                    log_failure(id, &ConnectionError::Protocol(signal));
                    self.disconnect(id);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Decrypts one payload and routes it. The bare keepalive strings are
    /// accepted without encryption.
    fn on_message(&mut self, id: ConnectionId, payload: &[u8]) {
        let live = self.connections.len();
        let text = std::str::from_utf8(payload).ok();

        let effects = match text {
            Some(raw) if inbound::keepalive(raw).is_some() => {
                self.router.route(&mut self.registry, id, raw, live)
            }
            Some(raw) => match self.cipher.decrypt(raw) {
                Some(plaintext) => {
                    trace!("{id}: {plaintext}");
                    self.router.route(&mut self.registry, id, &plaintext, live)
                }
                None => self.router.undecryptable(&self.registry, id),
            },
            None => {
                debug!("{id}: payload is not text: {}", hex::encode(&payload[..payload.len().min(32)]));
                self.router.undecryptable(&self.registry, id)
            }
        };
        self.apply(effects);
    }

    /// Applies effects in order. Closing a connection can cascade (a
    /// departing teacher closes the session), so follow-ups join the queue.
    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Send { to, message } => {
                    if let Err(err) = self.send(to, &message) {
                        debug!("{to}: send of {} failed: {err}", message.name());
                        queue.push_back(Effect::Disconnect(to));
                    }
                }
                Effect::Disconnect(id) => queue.extend(self.close_connection(id)),
            }
        }
    }

    fn send(&mut self, to: ConnectionId, message: &Outbound) -> Result<(), ConnectionError> {
        if !self.connections.contains_key(&to) {
            return Ok(());
        }
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!("{to}: cannot serialise {}: {err}", message.name());
                return Ok(());
            }
        };
        let wire = self.cipher.encrypt(&json);

        let Some(connection) = self.connections.get_mut(&to) else {
            return Ok(());
        };
        connection.send_text(&wire)?;
        connection.flush_and_update(self.poll.registry())
    }

    fn disconnect(&mut self, id: ConnectionId) {
        self.apply(vec![Effect::Disconnect(id)]);
    }

    /// Closes the socket and returns the notices the registry produces for
    /// the rest of the session.
    fn close_connection(&mut self, id: ConnectionId) -> Vec<Effect> {
        let Some(mut connection) = self.connections.remove(&id) else {
            return Vec::new();
        };
        connection.close(self.poll.registry());
        debug!("{id}: closed ({} open)", self.connections.len());
        self.registry.on_disconnect(id)
    }

    fn shutdown(&mut self) {
        info!("shutting down, closing {} connection(s)", self.connections.len());
        let registry = self.poll.registry();
        for (_, mut connection) in self.connections.drain() {
            connection.close(registry);
        }
        self.registry = SessionRegistry::new();
    }
}

fn log_failure(id: ConnectionId, err: &ConnectionError) {
    match err {
        ConnectionError::Protocol(ProtocolSignal::Close) => debug!("{id}: close signal received"),
        ConnectionError::Protocol(signal @ (ProtocolSignal::TooShort | ProtocolSignal::SuspectedAttack)) => {
            warn!("{id}: {signal}, disconnecting")
        }
        ConnectionError::Protocol(ProtocolSignal::Malformed) => warn!("{id}: malformed frame, disconnecting"),
        ConnectionError::Handshake(err) => info!("{id}: rejected upgrade: {err}"),
        ConnectionError::Io(err) => debug!("{id}: socket error: {err}"),
        ConnectionError::Entropy => error!("{id}: {err}"),
        ConnectionError::Backlog(_) => warn!("{id}: {err}, disconnecting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new("127.0.0.1:0".parse().unwrap(), "classroom")
    }

    #[test]
    fn binds_and_reports_the_ephemeral_port() {
        let server = Server::bind(&config()).unwrap();
        assert_eq!(server.local_addr().ip().to_string(), "127.0.0.1");
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn bad_secret_fails_at_bind() {
        let mut config = config();
        config.secret = "not allowed".into();
        assert!(matches!(Server::bind(&config), Err(ServerError::Cipher(_))));
    }

    #[test]
    fn stop_before_run_returns_immediately() {
        let mut server = Server::bind(&config()).unwrap();
        server.handle().stop().unwrap();
        server.run().unwrap();
    }

    #[test]
    fn ids_skip_connections_still_open() {
        let mut server = Server::bind(&config()).unwrap();
        assert_eq!(server.allocate_id(), ConnectionId(FIRST_CLIENT));
        server.next_id = usize::MAX;
        assert_eq!(server.allocate_id(), ConnectionId(usize::MAX));
        assert_eq!(server.allocate_id(), ConnectionId(FIRST_CLIENT));
    }
}
