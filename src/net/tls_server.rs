use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use thiserror::Error;

use crate::net::transport::Transport;

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("cannot read PEM material: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Builds the server config from a PEM certificate chain and private key.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let chain = CertificateDer::pem_file_iter(cert)?.collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(TlsSetupError::NoCertificate(cert.display().to_string()));
    }
    let key = PrivateKeyDer::from_pem_file(key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}

/// A non-blocking TLS session over an accepted mio stream. State is owned by
/// the struct; the event loop is the only caller.
pub struct TlsServer {
    socket: TcpStream,
    tls_conn: ServerConnection,
}

impl TlsServer {
    pub fn new(socket: TcpStream, config: Arc<ServerConfig>) -> io::Result<Self> {
        let tls_conn =
            ServerConnection::new(config).map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        Ok(Self { socket, tls_conn })
    }

    /// Pulls ciphertext from the socket into the TLS engine. `Ok(0)` is EOF.
    fn read_tls(&mut self) -> io::Result<usize> {
        let n = self.tls_conn.read_tls(&mut self.socket)?;
        if let Err(err) = self.tls_conn.process_new_packets() {
            // let the alert reach the peer before bailing out
            let _ = self.tls_conn.write_tls(&mut self.socket);
            return Err(io::Error::new(ErrorKind::InvalidData, err));
        }
        Ok(n)
    }
}

impl Transport for TlsServer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.tls_conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }

            if self.read_tls()? == 0 {
                return Ok(0);
            }
            // handshake records produced while processing
            match self.flush() {
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                other => other?,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.tls_conn.writer().write(buf)?;
        match self.flush() {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            other => other?,
        }
        if n == 0 && !buf.is_empty() {
            return Err(ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.tls_conn.wants_write() {
            let n = self.tls_conn.write_tls(&mut self.socket)?;
            debug!("tls: flushed {n} bytes");
        }
        Ok(())
    }

    fn wants_write(&self) -> bool {
        self.tls_conn.wants_write()
    }

    fn is_secure(&self) -> bool {
        true
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
        self.tls_conn.send_close_notify();
        let _ = self.flush();
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}
