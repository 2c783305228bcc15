//! HTTP/1.1 Upgrade negotiation, read directly off the raw byte stream.
//!
//! The negotiator is not an HTTP parser. It reads chunks from a freshly
//! accepted connection into a bounded buffer until the CRLF-terminated
//! blank line that ends the request head, then makes two passes over the
//! bytes: one over the request line to slice out the query string, one over
//! the header block to build a case-insensitive name/value map. Anything
//! beyond what RFC 6455 needs from the upgrade request is ignored.
//!
//! On success the 101 response is written and flushed before returning, so
//! the caller can treat every later byte as frame data. Bytes that arrived
//! after the blank line are handed back so they can seed the frame decoder.

use std::collections::HashMap;

use base64::prelude::*;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, WebSocketError};

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`,
/// from RFC 6455 section 1.3.
const WS_ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request head. A handshake that does not fit fails.
pub const MAX_REQUEST_HEAD: usize = 2048;

/// How many bytes a single read pulls off the socket at most.
const READ_CHUNK: usize = 1024;

/// Case-insensitively keyed header map.
///
/// Names are stored ASCII-lowercased; values are kept as the raw bytes that
/// appeared on the wire, with only the leading whitespace after the colon
/// and the trailing CR stripped.
#[derive(Debug, Default, Clone)]
pub struct HeaderMap {
    entries: HashMap<String, Bytes>,
}

impl HeaderMap {
    fn insert(&mut self, name: &str, value: Bytes) {
        self.entries.insert(name.to_ascii_lowercase(), value);
    }

    /// Returns the raw value bytes for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.get(&name.to_ascii_lowercase())
    }

    /// Returns the value for `name` as a string, when it is valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Whether a header named `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The parts of the upgrade request the server keeps.
#[derive(Debug)]
pub(crate) struct UpgradeRequest {
    /// Request method, captured for diagnostics only.
    pub(crate) method: String,
    /// Full request target, captured for diagnostics only.
    pub(crate) target: String,
    /// The query-string portion of the request target.
    pub(crate) query: String,
    pub(crate) headers: HeaderMap,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// The full trimmed key participates in the digest:
/// `BASE64(SHA1(key ++ GUID))`.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.trim_ascii());
    sha1.update(WS_ACCEPT_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Runs the complete server handshake on a raw stream.
///
/// Reads the request head within `timeout`, validates it, and writes either
/// the 101 response or a bare HTTP error status. Returns the parsed request
/// and any bytes that arrived past the blank line.
pub(crate) async fn negotiate<S>(
    io: &mut S,
    timeout: std::time::Duration,
) -> Result<(UpgradeRequest, Bytes)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_REQUEST_HEAD);

    let read = tokio::time::timeout(timeout, read_request_head(io, &mut buf)).await;
    let head_end = match read {
        Err(_) => return Err(WebSocketError::HandshakeTimeout),
        Ok(Err(err)) => {
            if err.is_handshake_error() {
                let _ = io.write_all(b"HTTP/1.1 400\n").await;
            }
            return Err(err);
        }
        Ok(Ok(head_end)) => head_end,
    };

    let leftover = buf.split_off(head_end).freeze();

    let request = match parse_request(&buf).and_then(|request| {
        validate(&request)?;
        Ok(request)
    }) {
        Ok(request) => request,
        Err(err) => {
            let status: &[u8] = if matches!(err, WebSocketError::MissingQueryString) {
                b"HTTP/1.1 401\n"
            } else {
                b"HTTP/1.1 400\n"
            };
            let _ = io.write_all(status).await;
            let _ = io.flush().await;
            return Err(err);
        }
    };

    let key = request
        .headers
        .get("sec-websocket-key")
        .expect("validated")
        .clone();
    let accept = accept_key(&key);

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    );
    io.write_all(response.as_bytes()).await?;
    io.flush().await?;

    Ok((request, leftover))
}

/// Reads until the blank line ending the request head, in chunks, within
/// the bounded buffer. Returns the offset one past the blank line.
async fn read_request_head<S>(io: &mut S, buf: &mut BytesMut) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(end) = find_head_end(buf) {
            return Ok(end);
        }
        let room = MAX_REQUEST_HEAD - buf.len();
        if room == 0 {
            return Err(WebSocketError::RequestHeadersTooLarge(MAX_REQUEST_HEAD));
        }

        let n = io.read(&mut chunk[..room.min(READ_CHUNK)]).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parses the request head: request line first, then the header block.
fn parse_request(head: &[u8]) -> Result<UpgradeRequest> {
    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(WebSocketError::MalformedRequestLine)?;
    let line = strip_cr(&head[..line_end]);

    // Request line pass. The method and target are only kept for
    // diagnostics; the query string is what the connection exposes.
    let method_end = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(WebSocketError::MalformedRequestLine)?;
    let target_start = method_end + 1;
    let target_end = line[target_start..]
        .iter()
        .position(|&b| b == b' ')
        .map(|pos| target_start + pos)
        .ok_or(WebSocketError::MalformedRequestLine)?;

    let question = line[..target_end]
        .iter()
        .position(|&b| b == b'?')
        .ok_or(WebSocketError::MissingQueryString)?;
    let query = &line[question + 1..target_end];

    let method = String::from_utf8_lossy(&line[..method_end]).into_owned();
    let target = String::from_utf8_lossy(&line[target_start..target_end]).into_owned();
    let query = String::from_utf8_lossy(query).into_owned();

    // Header pass: look for ':' to end a name, then for the newline to end
    // its value. Lines without a colon are skipped.
    let mut headers = HeaderMap::default();
    let mut at = line_end + 1;
    while at < head.len() {
        let Some(rel) = head[at..].iter().position(|&b| b == b'\n') else {
            break;
        };
        let line = strip_cr(&head[at..at + rel]);
        at += rel + 1;

        if line.is_empty() {
            break;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let Ok(name) = std::str::from_utf8(&line[..colon]) else {
            continue;
        };

        let mut value = &line[colon + 1..];
        while let [b' ' | b'\t', rest @ ..] = value {
            value = rest;
        }
        headers.insert(name.trim(), Bytes::copy_from_slice(value));
    }

    Ok(UpgradeRequest {
        method,
        target,
        query,
        headers,
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Enforces the RFC 6455 requirements on the upgrade request.
fn validate(request: &UpgradeRequest) -> Result<()> {
    if !request.headers.contains("host") {
        return Err(WebSocketError::MissingHostHeader);
    }

    let upgrade = request
        .headers
        .get_str("upgrade")
        .ok_or(WebSocketError::InvalidUpgradeHeader)?;
    if !upgrade.to_ascii_lowercase().contains("websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    let connection = request
        .headers
        .get_str("connection")
        .ok_or(WebSocketError::InvalidConnectionHeader)?;
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    match request.headers.get_str("sec-websocket-version") {
        Some(version) if version.trim() == "13" => {}
        _ => return Err(WebSocketError::InvalidSecWebSocketVersion),
    }

    match request.headers.get("sec-websocket-key") {
        Some(key) if !key.trim_ascii().is_empty() => Ok(()),
        _ => Err(WebSocketError::MissingSecWebSocketKey),
    }
}
