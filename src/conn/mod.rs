//! Connections: polymorphic bidirectional mutation transports.
//!
//! A [`Conn`] produces and consumes [`Mutation`]s. Implementations cover
//! websocket peers ([`WsConn`]), append-only mutation logs ([`IoConn`]),
//! and path-filtering wrappers ([`FilterConn`]). Closed is terminal; all
//! implementations are safe for concurrent `send`/`receive` from different
//! threads.

mod filter;
mod io;
mod set;
pub mod ws;

pub use filter::FilterConn;
pub use io::IoConn;
pub use set::ConnSet;
pub(crate) use set::spawn_pipe;
pub use ws::{WsConfig, WsConn};

use std::sync::{Arc, Weak};

use crossbeam::channel::Sender;

use crate::mutation::{Mutation, MutationError};
use crate::shutdown::Shutdown;

/// Something that can send and receive mutations.
///
/// Once closed, a connection cannot be used again: `send` and `receive`
/// return [`MutationError::Closed`]. Connections may close themselves on
/// external events, such as a websocket peer going away.
pub trait Conn: Send + Sync {
    /// Deliver a mutation to the peer.
    fn send(&self, mutation: &Mutation) -> Result<(), MutationError>;

    /// Block until the next mutation arrives from the peer.
    fn receive(&self) -> Result<Mutation, MutationError>;

    /// Release the underlying transport. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Report an error to the peer, in whatever form suits the transport.
    /// Best-effort: failures are swallowed.
    fn send_error(&self, err: &MutationError);

    /// Human-readable identity (file name, peer address) for logs.
    fn name(&self) -> String;
}

/// Non-owning handle to a connection, carried by mutations back to their
/// origin. Upgrading fails once the connection has been dropped.
pub type ConnRef = Weak<dyn Conn>;

/// Downgrade a shared connection into the handle form mutations carry.
pub fn conn_ref(conn: &Arc<dyn Conn>) -> ConnRef {
    Arc::downgrade(conn)
}

/// Forward every mutation `conn` receives into `out` until the connection
/// errors or `shutdown` fires. Blocking; run on a dedicated thread. The
/// output channel is left open: many pipes share one channel.
pub fn pipe(
    shutdown: &Shutdown,
    conn: &Arc<dyn Conn>,
    out: &Sender<Mutation>,
) -> Result<(), MutationError> {
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let mutation = conn.receive()?;

        crossbeam::select! {
            recv(shutdown.signal()) -> _ => return Ok(()),
            send(out, mutation) -> res => {
                if res.is_err() {
                    // All receivers gone; nothing left to feed.
                    return Ok(());
                }
            }
        }
    }
}
