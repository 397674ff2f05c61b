//! Minimal HTTP/1.1 websocket upgrade handshake.
//!
//! The server speaks just enough HTTP to accept `GET /ws` upgrade requests
//! and turn away everything else; routing and static files are external
//! collaborators.

use std::io::{BufRead, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use thiserror::Error;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_VERSION: &str = "13";
const MAX_HEADER_LINES: usize = 128;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed http request: {reason}")]
    Malformed { reason: String },
    #[error("request for {target} is not a websocket upgrade")]
    NotUpgrade { target: String },
    #[error("unsupported websocket version {got:?}")]
    Version { got: String },
}

impl HandshakeError {
    fn malformed(reason: impl Into<String>) -> Self {
        HandshakeError::Malformed {
            reason: reason.into(),
        }
    }
}

pub struct RequestHead {
    pub method: String,
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read an HTTP request head (request line plus headers, up to the blank
/// line) from the stream.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<RequestHead, HandshakeError> {
    let request_line = read_line(reader)?;
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| HandshakeError::malformed("empty request line"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| HandshakeError::malformed("request line has no target"))?
        .to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADER_LINES {
            return Err(HandshakeError::malformed("too many header lines"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::malformed("header line has no colon"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, HandshakeError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(HandshakeError::malformed("unexpected end of request"));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Validate the upgrade headers and return the client's nonce key.
pub fn upgrade_key(head: &RequestHead) -> Result<String, HandshakeError> {
    let not_upgrade = || HandshakeError::NotUpgrade {
        target: head.target.clone(),
    };

    if head.method != "GET" {
        return Err(not_upgrade());
    }
    if !head
        .header("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return Err(not_upgrade());
    }
    if !head
        .header("Connection")
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
    {
        return Err(not_upgrade());
    }

    let version = head.header("Sec-WebSocket-Version").unwrap_or_default();
    if version != WS_VERSION {
        return Err(HandshakeError::Version {
            got: version.to_string(),
        });
    }

    head.header("Sec-WebSocket-Key")
        .map(str::to_string)
        .ok_or_else(|| HandshakeError::malformed("missing Sec-WebSocket-Key"))
}

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(WS_GUID.as_bytes());
    BASE64.encode(digest.finalize())
}

/// Complete the handshake with a `101 Switching Protocols` response.
pub fn write_accept<W: Write>(writer: &mut W, key: &str) -> std::io::Result<()> {
    write!(
        writer,
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )?;
    writer.flush()
}

/// Turn away a request that is not a websocket upgrade.
pub fn write_rejection<W: Write>(writer: &mut W, status: u16, reason: &str) -> std::io::Result<()> {
    write!(
        writer,
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\r\n"
    )?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request(text: &str) -> RequestHead {
        read_request(&mut Cursor::new(text.as_bytes())).unwrap()
    }

    const UPGRADE: &str = "GET /ws HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_upgrade_request() {
        let head = request(UPGRADE);
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/ws");
        assert_eq!(head.header("upgrade"), Some("websocket"));
        assert_eq!(
            upgrade_key(&head).unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
    }

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let head = request("GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert!(matches!(
            upgrade_key(&head),
            Err(HandshakeError::NotUpgrade { .. })
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let head = request(
            "GET /ws HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: abc\r\n\
             Sec-WebSocket-Version: 8\r\n\r\n",
        );
        assert!(matches!(
            upgrade_key(&head),
            Err(HandshakeError::Version { .. })
        ));
    }

    #[test]
    fn missing_key_is_malformed() {
        let head = request(
            "GET /ws HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(matches!(
            upgrade_key(&head),
            Err(HandshakeError::Malformed { .. })
        ));
    }

    #[test]
    fn accept_response_quotes_the_derived_key() {
        let mut buf = Vec::new();
        write_accept(&mut buf, "dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
