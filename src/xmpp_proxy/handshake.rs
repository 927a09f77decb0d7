//! HTTP/1.1 upgrade handshake for incoming WebSocket connections.
//!
//! The request head is consumed line by line until the blank line. Only
//! `GET` upgrade requests offering the `xmpp` subprotocol from an allowed
//! origin are accepted.

use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::config::Config;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only WebSocket protocol version spoken.
pub const WEBSOCKET_VERSION: &str = "13";

/// Subprotocol browsers must offer.
pub const XMPP_SUBPROTOCOL: &str = "xmpp";

/// Upper bound on the request head, request line included.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed request line {0:?}")]
    RequestLine(String),
    #[error("header line without a colon: {0:?}")]
    HeaderLine(String),
    #[error("continuation line before any header")]
    StrayContinuation,
    #[error("request line or header is not valid UTF-8")]
    Encoding,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Done,
    Error,
}

/// Line-oriented parser for the request head. Header names are matched
/// case-insensitively; lines starting with whitespace continue the previous
/// header.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    error: Option<HandshakeError>,
    method: String,
    resource: String,
    version: String,
    headers: Vec<(String, String)>,
    /// Header being assembled; flushed once a non-continuation line arrives.
    current: Option<String>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            error: None,
            method: String::new(),
            resource: String::new(),
            version: String::new(),
            headers: Vec::new(),
            current: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    pub fn is_error(&self) -> bool {
        self.state == ParseState::Error
    }

    pub fn error(&self) -> Option<&HandshakeError> {
        self.error.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in order.
    pub fn protocols(&self) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("sec-websocket-protocol"))
            .flat_map(|(_, value)| value.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Feed one line without its line terminator.
    pub fn add_line(&mut self, line: &str) {
        match self.state {
            ParseState::RequestLine => self.parse_request_line(line),
            ParseState::Headers => self.parse_header_line(line),
            ParseState::Done | ParseState::Error => {}
        }
    }

    fn fail(&mut self, error: HandshakeError) {
        self.state = ParseState::Error;
        self.error = Some(error);
    }

    fn parse_request_line(&mut self, line: &str) {
        let mut parts = line.split_ascii_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(resource), Some(version), None) if version.starts_with("HTTP/") => {
                self.method = method.to_string();
                self.resource = resource.to_string();
                self.version = version.to_string();
                self.state = ParseState::Headers;
            }
            _ => self.fail(HandshakeError::RequestLine(line.to_string())),
        }
    }

    fn parse_header_line(&mut self, line: &str) {
        if line.starts_with([' ', '\t']) {
            match self.current.as_mut() {
                Some(current) => {
                    current.push(' ');
                    current.push_str(line.trim());
                }
                None => self.fail(HandshakeError::StrayContinuation),
            }
            return;
        }

        if let Some(previous) = self.current.take() {
            let Some((name, value)) = previous.split_once(':') else {
                self.fail(HandshakeError::HeaderLine(previous));
                return;
            };
            self.headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }

        if line.is_empty() {
            self.state = ParseState::Done;
        } else {
            self.current = Some(line.to_string());
        }
    }

    fn is_http11(&self) -> bool {
        self.version == "HTTP/1.1"
    }
}

/// Splits raw socket bytes into lines for a [`RequestParser`] and hands back
/// whatever follows the request head.
#[derive(Debug, Default)]
pub struct RequestReader {
    buffer: BytesMut,
    consumed: usize,
    parser: RequestParser,
}

impl RequestReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    /// Append bytes. Returns `Ok(Some(rest))` once the blank line has been
    /// seen, where `rest` holds the bytes that followed it (already the first
    /// WebSocket frames).
    pub fn push(&mut self, data: &[u8]) -> Result<Option<Bytes>, HandshakeError> {
        self.buffer.extend_from_slice(data);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            self.consumed += newline + 1;
            if self.consumed > MAX_REQUEST_BYTES {
                return Err(HandshakeError::TooLarge(MAX_REQUEST_BYTES));
            }
            let raw = self.buffer.split_to(newline + 1);
            let line = raw.strip_suffix(b"\n").unwrap_or(&raw);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let line = std::str::from_utf8(line).map_err(|_| HandshakeError::Encoding)?;

            self.parser.add_line(line);
            if let Some(error) = self.parser.error() {
                return Err(error.clone());
            }
            if self.parser.is_done() {
                let rest = self.buffer.split().freeze();
                return Ok(Some(rest));
            }
        }

        if self.consumed + self.buffer.remaining() > MAX_REQUEST_BYTES {
            return Err(HandshakeError::TooLarge(MAX_REQUEST_BYTES));
        }
        Ok(None)
    }
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),
    #[error("origin {0:?} not allowed")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unsupported WebSocket version {0:?}")]
    UpgradeRequired(String),
}

impl Rejection {
    pub fn status(&self) -> u16 {
        match self {
            Self::MethodNotAllowed(_) => 405,
            Self::Forbidden(_) => 403,
            Self::BadRequest(_) => 400,
            Self::UpgradeRequired(_) => 426,
        }
    }

    /// Complete HTTP response sent before closing the connection.
    pub fn response(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed(_) => "HTTP/1.1 405 Method Not Allowed\r\n\r\n",
            Self::Forbidden(_) => "HTTP/1.1 403 Forbidden\r\n\r\n",
            Self::BadRequest(_) => "HTTP/1.1 400 Bad Request\r\n\r\n",
            Self::UpgradeRequired(_) => {
                "HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: 13\r\n\r\n"
            }
        }
    }
}

impl From<HandshakeError> for Rejection {
    fn from(error: HandshakeError) -> Self {
        Self::BadRequest(error.to_string())
    }
}

fn has_token(value: Option<&str>, token: &str) -> bool {
    value.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

/// Decide on a complete request. Returns the `101 Switching Protocols`
/// response on success.
pub fn evaluate(request: &RequestParser, config: &Config) -> Result<String, Rejection> {
    if request.method() != "GET" {
        return Err(Rejection::MethodNotAllowed(request.method().to_string()));
    }

    if let Some(origin) = request.header("origin") {
        if !config.origin_allowed(origin) {
            return Err(Rejection::Forbidden(origin.to_string()));
        }
    }

    let bad = |reason: &str| Err(Rejection::BadRequest(reason.to_string()));
    if !request.is_http11() {
        return bad("HTTP/1.1 required");
    }
    if request.header("host").map_or(true, str::is_empty) {
        return bad("missing Host");
    }
    if request.header("origin").is_none() {
        return bad("missing Origin");
    }
    if !has_token(request.header("upgrade"), "websocket") {
        return bad("Upgrade is not websocket");
    }
    if !has_token(request.header("connection"), "upgrade") {
        return bad("Connection does not include upgrade");
    }
    let Some(key) = request.header("sec-websocket-key") else {
        return bad("missing Sec-WebSocket-Key");
    };
    let key_is_valid = base64::engine::general_purpose::STANDARD
        .decode(key)
        .is_ok_and(|raw| raw.len() == 16);
    if !key_is_valid {
        return bad("Sec-WebSocket-Key is not 16 base64-encoded bytes");
    }
    match request.header("sec-websocket-version") {
        None => return bad("missing Sec-WebSocket-Version"),
        Some(WEBSOCKET_VERSION) => {}
        Some(other) => return Err(Rejection::UpgradeRequired(other.to_string())),
    }
    if !request.protocols().contains(&XMPP_SUBPROTOCOL) {
        return bad("xmpp subprotocol not offered");
    }

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: {XMPP_SUBPROTOCOL}\r\n\r\n",
        accept_key(key)
    ))
}
