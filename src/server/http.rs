//! TCP-side plumbing: turn an accepted socket into a websocket connection.

use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;

use crate::conn::ws::handshake::{self, HandshakeError};
use crate::conn::{WsConfig, WsConn};

const WS_TARGET: &str = "/ws";

/// Perform the HTTP upgrade on a freshly accepted stream. Requests that
/// are not websocket upgrades of `/ws` get a terse rejection and `None`;
/// the server owns no other HTTP surface.
pub(crate) fn accept_websocket(
    stream: TcpStream,
    config: &WsConfig,
) -> std::io::Result<Option<Arc<WsConn>>> {
    let peer = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let head = match handshake::read_request(&mut reader) {
        Ok(head) => head,
        Err(err) => {
            tracing::debug!(%peer, %err, "rejecting malformed request");
            let _ = handshake::write_rejection(&mut writer, 400, "Bad Request");
            return Ok(None);
        }
    };

    if head.target != WS_TARGET {
        let _ = handshake::write_rejection(&mut writer, 404, "Not Found");
        return Ok(None);
    }

    let key = match handshake::upgrade_key(&head) {
        Ok(key) => key,
        Err(err @ HandshakeError::Version { .. }) => {
            tracing::debug!(%peer, %err, "rejecting websocket request");
            let _ = handshake::write_rejection(&mut writer, 426, "Upgrade Required");
            return Ok(None);
        }
        Err(err) => {
            tracing::debug!(%peer, %err, "rejecting non-upgrade request");
            let _ = handshake::write_rejection(&mut writer, 400, "Bad Request");
            return Ok(None);
        }
    };

    handshake::write_accept(&mut writer, &key)?;
    WsConn::spawn(reader, writer, peer, config).map(Some)
}
