use std::io::{self, ErrorKind};

use log::{debug, trace, warn};
use mio::{Interest, Registry, Token};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use crate::net::framing::{self, FrameReader, Message, Opcode, ProtocolSignal, SHORT_FRAME_LEN};
use crate::net::handshake::{self, HandshakeError, HandshakeProgress, HandshakeReader, UpgradeRequest};
use crate::net::transport::Transport;
use crate::protocol::ConnectionId;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("{0}")]
    Protocol(#[from] ProtocolSignal),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("no entropy for outbound mask")]
    Entropy,
    #[error("{0} bytes queued for a peer that is not reading")]
    Backlog(usize),
}

/// Unsent output allowed per connection, in multiples of the buffer size.
pub const MAX_QUEUED_BUFFERS: usize = 64;

/// What a readable event produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    /// The upgrade request was answered; the connection is now a WebSocket.
    Upgraded(UpgradeRequest),
    /// One complete inbound message, still encrypted.
    Data(Vec<u8>),
    /// The peer closed the stream.
    Closed,
    /// The frame stream ended with a close or a protocol violation. Data
    /// events before it arrived first and should still be handled.
    Ended(ProtocolSignal),
}

/// One accepted client: transport, handshake state, frame reassembly and the
/// bytes waiting to be written.
pub struct Connection {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    /// `Some` until the upgrade request has been answered.
    handshake: Option<HandshakeReader>,
    reader: FrameReader,
    outbox: Vec<u8>,
    /// Messages queued before the handshake finished.
    held: Vec<String>,
    /// Next outbound frame continues a fragmented message.
    sending_continuation: bool,
    max_buffer_size: usize,
    mask_outgoing: bool,
    rng: SystemRandom,
    writable_interest: bool,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        transport: Box<dyn Transport>,
        max_buffer_size: usize,
        mask_outgoing: bool,
    ) -> Self {
        Self {
            id,
            transport,
            handshake: Some(HandshakeReader::new(max_buffer_size)),
            reader: FrameReader::new(max_buffer_size),
            outbox: Vec::new(),
            held: Vec::new(),
            sending_continuation: false,
            max_buffer_size,
            mask_outgoing,
            rng: SystemRandom::new(),
            writable_interest: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_upgraded(&self) -> bool {
        self.handshake.is_none()
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.transport
            .register(registry, Token(self.id.0), Interest::READABLE)
    }

    /// Drains the socket. Reads are capped at the buffer size and repeated
    /// until the socket would block, as edge-triggered readiness requires.
    pub fn on_readable(&mut self) -> Result<Vec<ReadEvent>, ConnectionError> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; self.max_buffer_size];
        loop {
            let n = match self.transport.read(&mut buf) {
                Ok(0) => {
                    events.push(ReadEvent::Closed);
                    break;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
                    ) =>
                {
                    events.push(ReadEvent::Closed);
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let chunk = &buf[..n];
            trace!("{}: read {n} bytes", self.id);

            if let Some(reader) = self.handshake.as_mut() {
                match reader.push(chunk)? {
                    HandshakeProgress::Pending => {}
                    HandshakeProgress::Complete { request, leftover } => {
                        self.handshake = None;
                        self.complete_handshake(&request)?;
                        events.push(ReadEvent::Upgraded(request));
                        if !leftover.is_empty() && self.feed(&leftover, &mut events)? {
                            break;
                        }
                    }
                }
            } else if self.feed(chunk, &mut events)? {
                break;
            }
        }
        Ok(events)
    }

    fn complete_handshake(&mut self, request: &UpgradeRequest) -> Result<(), ConnectionError> {
        let reply = handshake::response(request, self.transport.is_secure());
        self.outbox.extend_from_slice(reply.as_bytes());
        debug!("{}: upgraded on {}", self.id, request.path);

        let held = std::mem::take(&mut self.held);
        if !held.is_empty() {
            debug!("{}: releasing {} held message(s)", self.id, held.len());
        }
        for text in held {
            self.queue_text(&text)?;
        }
        Ok(())
    }

    /// Returns true once the stream has ended; nothing after that is read.
    fn feed(&mut self, chunk: &[u8], events: &mut Vec<ReadEvent>) -> Result<bool, ConnectionError> {
        let (messages, signal) = self.reader.push(chunk);
        for message in messages {
            match message {
                Message::Data(payload) => events.push(ReadEvent::Data(payload)),
                Message::Ping(payload) => self.queue_frame(&payload, Opcode::Pong, false)?,
                Message::Pong => {}
            }
        }
        let Some(signal) = signal else {
            return Ok(false);
        };
        if signal == ProtocolSignal::TooShort && chunk.len() <= SHORT_FRAME_LEN {
            debug!("{}: short frame {}", self.id, hex::encode(chunk));
        }
        events.push(ReadEvent::Ended(signal));
        Ok(true)
    }

    /// Queues a text message. Before the handshake completes it is held and
    /// released in order right after the upgrade response.
    pub fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        if self.handshake.is_some() {
            let held: usize = self.held.iter().map(String::len).sum();
            if held + text.len() > self.outbox_limit() {
                warn!("{}: {held} bytes held before the upgrade, giving up", self.id);
                return Err(ConnectionError::Backlog(held));
            }
            self.held.push(text.to_owned());
            return Ok(());
        }
        self.queue_text(text)
    }

    /// Messages longer than the buffer size go out as a text frame followed
    /// by continuation frames.
    fn queue_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        let payload = text.as_bytes();
        if payload.len() <= self.max_buffer_size {
            return self.queue_frame(payload, Opcode::Text, false);
        }

        let chunks: Vec<&[u8]> = payload.chunks(self.max_buffer_size).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let opcode = if self.sending_continuation {
                Opcode::Continuation
            } else {
                Opcode::Text
            };
            let more = i != last;
            self.queue_frame(chunk, opcode, more)?;
            self.sending_continuation = more;
        }
        Ok(())
    }

    fn queue_frame(&mut self, payload: &[u8], opcode: Opcode, more: bool) -> Result<(), ConnectionError> {
        let mask = if self.mask_outgoing {
            let mut key = [0u8; 4];
            self.rng.fill(&mut key).map_err(|_| ConnectionError::Entropy)?;
            Some(key)
        } else {
            None
        };
        let frame = framing::encode(payload, opcode, more, mask);
        if self.outbox.len() + frame.len() > self.outbox_limit() {
            warn!("{}: {} bytes unsent, peer is not reading", self.id, self.outbox.len());
            return Err(ConnectionError::Backlog(self.outbox.len()));
        }
        self.outbox.extend_from_slice(&frame);
        Ok(())
    }

    fn outbox_limit(&self) -> usize {
        self.max_buffer_size.saturating_mul(MAX_QUEUED_BUFFERS)
    }

    /// Writes as much of the outbox as the socket takes. Returns whether
    /// bytes remain, in which case the caller should wait for WRITABLE.
    pub fn flush(&mut self) -> Result<bool, ConnectionError> {
        while !self.outbox.is_empty() {
            match self.transport.write(&self.outbox) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    let _ = self.outbox.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match self.transport.flush() {
            Ok(()) => Ok(self.transport.wants_write()),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Flushes and keeps WRITABLE interest in step with the outbox.
    pub fn flush_and_update(&mut self, registry: &Registry) -> Result<(), ConnectionError> {
        let pending = self.flush()?;
        if pending != self.writable_interest {
            let interest = if pending {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.transport
                .reregister(registry, Token(self.id.0), interest)?;
            self.writable_interest = pending;
        }
        Ok(())
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbox.is_empty() || self.transport.wants_write()
    }

    /// Best-effort final flush, then deregistration and shutdown.
    pub fn close(&mut self, registry: &Registry) {
        if let Err(err) = self.flush() {
            debug!("{}: dropping unsent output on close: {err}", self.id);
        }
        if let Err(err) = self.transport.deregister(registry) {
            warn!("{}: deregister failed: {err}", self.id);
        }
        self.transport.shutdown();
    }
}
