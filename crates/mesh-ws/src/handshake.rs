//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4).
//!
//! Client side builds the `GET` upgrade request with a fresh
//! `Sec-WebSocket-Key` and checks the server's `101 Switching Protocols`
//! response. Server side validates the request and answers with `101` (or
//! `400 Bad Request`).
//!
//! - [`compute_accept_key`]: SHA-1 + Base64 computation per RFC 6455 Section 4.2.2
//! - [`ClientHandshake`]: Request builder and response checker for one connection attempt
//! - [`parse_request`] / [`validate_upgrade_request`]: Server-side request validation
//! - [`build_response`] / [`build_bad_request`]: Server-side responses
//! - [`find_header_end`]: Locate the blank line so trailing frame bytes can be carried over

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::{Result, WsError};

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest header block accepted before the blank line.
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64 encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Base64 of 16 random bytes, as required for `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Offset just past the `\r\n\r\n` that terminates the header block.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Header lines in arrival order. Lookups ignore ASCII case of the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `true` if the comma-separated header value contains `token` (ASCII case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<Vec<(String, String)>> for Headers {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Headers(pairs)
    }
}

/// Split a header block (without the terminating blank line) into its first
/// line and the parsed header lines.
fn split_head(head: &[u8]) -> Result<(&str, Headers)> {
    let text =
        std::str::from_utf8(head).map_err(|_| WsError::protocol("handshake is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let first = lines.next().unwrap_or_default();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()))
            }
            None => return Err(WsError::protocol(format!("malformed header line: {}", line))),
        }
    }
    Ok((first, Headers(headers)))
}

/// Cut `buf` at the end of its header block.
///
/// Returns `Ok(None)` while the blank line has not arrived yet, and a
/// protocol error once the block outgrows [`MAX_HANDSHAKE_SIZE`].
fn take_head(buf: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
    match find_header_end(buf) {
        Some(end) if end <= MAX_HANDSHAKE_SIZE => Ok(Some((&buf[..end - 4], &buf[end..]))),
        Some(_) => Err(WsError::protocol("handshake header block too large")),
        None if buf.len() > MAX_HANDSHAKE_SIZE => {
            Err(WsError::protocol("handshake header block too large"))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Client half of one handshake attempt: remembers the key it sent so the
/// server's accept value can be checked.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
}

/// A successfully parsed `101` response.
#[derive(Debug)]
pub struct HandshakeResponse {
    pub headers: Headers,
    /// Bytes that followed the blank line in the same read; these are frames.
    pub remaining: Vec<u8>,
}

impl ClientHandshake {
    /// New attempt with a freshly generated key.
    pub fn new() -> Self {
        Self { key: generate_key() }
    }

    /// Attempt with a caller-chosen key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Build the HTTP/1.1 upgrade request.
    pub fn request(&self, host: &str, path: &str, extra_headers: &[(String, String)]) -> Vec<u8> {
        let mut req = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            path, host, self.key
        );
        for (name, value) in extra_headers {
            req.push_str(name);
            req.push_str(": ");
            req.push_str(value);
            req.push_str("\r\n");
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    /// Parse the server's response.
    ///
    /// Returns `Ok(None)` until the full header block has been received.
    /// Fails with a protocol error if the status is not 101, the upgrade
    /// headers are missing, or `Sec-WebSocket-Accept` does not match the key.
    pub fn parse_response(&self, buf: &[u8]) -> Result<Option<HandshakeResponse>> {
        let Some((head, rest)) = take_head(buf)? else {
            return Ok(None);
        };
        let (status_line, headers) = split_head(head)?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status = parts.next().unwrap_or_default();
        if version != "HTTP/1.1" {
            return Err(WsError::protocol(format!("malformed status line: {}", status_line)));
        }
        if status != "101" {
            return Err(WsError::protocol(format!("Expected status code: 101; Got: {}", status)));
        }

        if !headers.has_token("Upgrade", "websocket") {
            return Err(WsError::protocol("missing or invalid Upgrade header"));
        }
        if !headers.has_token("Connection", "upgrade") {
            return Err(WsError::protocol("missing or invalid Connection header"));
        }

        let expected = compute_accept_key(&self.key);
        match headers.get("Sec-WebSocket-Accept") {
            Some(accept) if accept == expected => {}
            Some(accept) => {
                return Err(WsError::protocol(format!(
                    "Sec-WebSocket-Accept mismatch: expected {}, got {}",
                    expected, accept
                )))
            }
            None => return Err(WsError::protocol("missing Sec-WebSocket-Accept header")),
        }

        Ok(Some(HandshakeResponse {
            headers,
            remaining: rest.to_vec(),
        }))
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a handshake: fresh key plus the request bytes to send.
pub fn build_request(host: &str, path: &str) -> (ClientHandshake, Vec<u8>) {
    let handshake = ClientHandshake::new();
    let bytes = handshake.request(host, path, &[]);
    (handshake, bytes)
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// A validated upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub version: u8,
    pub headers: Headers,
    /// Bytes received after the blank line.
    pub remaining: Vec<u8>,
}

/// Validate upgrade headers per RFC 6455 Section 4.2.1.
///
/// Returns `Ok(client_key)` if all required headers are present and valid,
/// or `Err(reason)` describing the first validation failure.
pub fn validate_upgrade_request(
    method: &str,
    headers: &Headers,
) -> std::result::Result<(String, u8), &'static str> {
    if method != "GET" {
        return Err("method must be GET");
    }

    // Connection may carry several tokens ("keep-alive, Upgrade")
    if !headers.has_token("Connection", "upgrade") {
        return Err("missing or invalid Connection header");
    }

    if !headers.has_token("Upgrade", "websocket") {
        return Err("missing or invalid Upgrade header");
    }

    let version = match headers.get("Sec-WebSocket-Version").map(str::parse::<u8>) {
        Some(Ok(v)) if v > 7 && v <= 13 => v,
        _ => return Err("missing or invalid Sec-WebSocket-Version (must be 8-13)"),
    };

    let client_key = match headers.get("Sec-WebSocket-Key") {
        Some(k) if !k.is_empty() => k.to_string(),
        _ => return Err("missing Sec-WebSocket-Key header"),
    };

    Ok((client_key, version))
}

/// Parse and validate a client upgrade request.
///
/// Returns `Ok(None)` until the full header block has been received, and a
/// protocol error naming the first problem if the request is not a valid
/// WebSocket upgrade.
pub fn parse_request(buf: &[u8]) -> Result<Option<UpgradeRequest>> {
    let Some((head, rest)) = take_head(buf)? else {
        return Ok(None);
    };
    let (request_line, headers) = split_head(head)?;

    // "GET /path HTTP/1.1"
    let parts: Vec<&str> = request_line.split(' ').collect();
    if parts.len() != 3 {
        return Err(WsError::protocol(format!("malformed request line: {}", request_line)));
    }
    let (method, path, http_version) = (parts[0], parts[1], parts[2]);
    if http_version != "HTTP/1.1" {
        return Err(WsError::protocol(format!("unsupported HTTP version: {}", http_version)));
    }

    let (key, version) = validate_upgrade_request(method, &headers).map_err(WsError::protocol)?;

    Ok(Some(UpgradeRequest {
        path: path.to_string(),
        key,
        version,
        headers,
        remaining: rest.to_vec(),
    }))
}

/// The `101 Switching Protocols` response for a client key.
pub fn build_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        compute_accept_key(client_key)
    )
    .into_bytes()
}

/// A `400 Bad Request` response with the given reason.
pub fn build_bad_request(reason: &str) -> Vec<u8> {
    let body = format!("Bad Request: {}", reason);
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes()
}
