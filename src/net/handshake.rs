use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use ring::digest;
use thiserror::Error;

/// RFC 6455 section 4.2.2.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on header lines so a client cannot stream headers forever.
const MAX_HEADER_LINES: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("request line is not an HTTP/1.1 or HTTP/1.0 request: {0:?}")]
    NotHttp(String),
    #[error("request line or header longer than {0} bytes")]
    LineTooLong(usize),
    #[error("too many header lines")]
    TooManyLines,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("request head is not valid UTF-8")]
    NotUtf8,
}

/// The parts of an upgrade request the server looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub host: Option<String>,
    pub connection: Option<String>,
    pub upgrade: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    Pending,
    /// `leftover` holds bytes that arrived after the blank line; they already
    /// belong to the frame stream.
    Complete {
        request: UpgradeRequest,
        leftover: Vec<u8>,
    },
}

/// Collects the request head across non-blocking reads.
#[derive(Debug)]
pub struct HandshakeReader {
    buf: Vec<u8>,
    max_line: usize,
}

impl HandshakeReader {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<HandshakeProgress, HandshakeError> {
        self.buf.extend_from_slice(chunk);

        let Some(end) = find_head_end(&self.buf) else {
            self.check_bounds(&self.buf)?;
            return Ok(HandshakeProgress::Pending);
        };

        let (head, rest) = self.buf.split_at(end);
        self.check_bounds(head)?;
        let head = std::str::from_utf8(head).map_err(|_| HandshakeError::NotUtf8)?;
        let request = parse_request(head)?;
        let leftover = rest[4..].to_vec();
        self.buf.clear();

        Ok(HandshakeProgress::Complete { request, leftover })
    }

    fn check_bounds(&self, bytes: &[u8]) -> Result<(), HandshakeError> {
        let mut lines = 0;
        for line in bytes.split(|&b| b == b'\n') {
            lines += 1;
            if line.len() > self.max_line {
                return Err(HandshakeError::LineTooLong(self.max_line));
            }
        }
        if lines > MAX_HEADER_LINES {
            return Err(HandshakeError::TooManyLines);
        }
        Ok(())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parses the request line and the four headers of interest; everything else
/// is ignored.
pub fn parse_request(head: &str) -> Result<UpgradeRequest, HandshakeError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let path = match parts.as_slice() {
        [_method, path, "HTTP/1.1" | "HTTP/1.0"] => (*path).to_string(),
        _ => return Err(HandshakeError::NotHttp(request_line.to_string())),
    };

    let mut key = None;
    let mut host = None;
    let mut connection = None;
    let mut upgrade = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "sec-websocket-key" => key = Some(value),
            "host" => host = Some(value),
            "connection" => connection = Some(value),
            "upgrade" => upgrade = Some(value),
            _ => {}
        }
    }

    let key = key.filter(|k| !k.is_empty()).ok_or(HandshakeError::MissingKey)?;

    Ok(UpgradeRequest {
        path,
        key,
        host,
        connection,
        upgrade,
    })
}

/// `base64(sha1(key + GUID))`
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key.trim());
    input.push_str(WS_GUID);
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    Base64.encode(hash.as_ref())
}

/// Builds the 101 response. The legacy `WebSocket-Origin`/`WebSocket-Location`
/// lines are only sent when the client named a host.
pub fn response(request: &UpgradeRequest, secure: bool) -> String {
    let accept = accept_key(&request.key);
    let location = match &request.host {
        Some(host) => {
            let scheme = if secure { "wss" } else { "ws" };
            format!(
                "WebSocket-Origin: {host}\r\n\
                 WebSocket-Location: {scheme}://{host}{path}\r\n",
                path = request.path
            )
        }
        None => String::new(),
    };
    format!(
        "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         {location}\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
}
