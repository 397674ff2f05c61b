use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;

use crate::mutation::Mutation;
use crate::shutdown::Shutdown;

use super::{Conn, pipe};

/// A thread-safe, unordered set of connections.
///
/// The set's lifecycle is independent of its members: purged connections
/// are removed but never closed by the set itself.
#[derive(Default)]
pub struct ConnSet {
    conns: RwLock<Vec<Arc<dyn Conn>>>,
}

impl ConnSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<dyn Conn>) {
        let mut conns = self.conns.write().expect("conn set lock poisoned");
        if !conns.iter().any(|c| Arc::ptr_eq(c, &conn)) {
            conns.push(conn);
        }
    }

    pub fn remove(&self, conn: &Arc<dyn Conn>) {
        let mut conns = self.conns.write().expect("conn set lock poisoned");
        conns.retain(|c| !Arc::ptr_eq(c, conn));
    }

    pub fn len(&self) -> usize {
        self.conns.read().expect("conn set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a mutation to every member, holding the read lock for the
    /// duration. Failed sends are logged and left in place; removal of dead
    /// members is [`ConnSet::purge`]'s job.
    pub fn broadcast(&self, mutation: &Mutation) {
        let conns = self.conns.read().expect("conn set lock poisoned");
        for conn in conns.iter() {
            if let Err(err) = conn.send(mutation) {
                tracing::warn!(conn = %conn.name(), %err, "broadcast send failed");
            }
        }
    }

    /// Current membership, for callers that need to act on every
    /// connection outside the set's own lock.
    pub fn snapshot(&self) -> Vec<Arc<dyn Conn>> {
        self.conns.read().expect("conn set lock poisoned").clone()
    }

    /// Drop every member whose connection reports closed.
    pub fn purge(&self) {
        let mut conns = self.conns.write().expect("conn set lock poisoned");
        conns.retain(|c| !c.is_closed());
    }

    /// Spawn a pumping thread per current member, feeding everything each
    /// one receives into the shared `out` channel until `shutdown` fires or
    /// the connection errors.
    pub fn pipe_all(&self, shutdown: &Shutdown, out: &Sender<Mutation>) -> Vec<JoinHandle<()>> {
        let conns = self.conns.read().expect("conn set lock poisoned");
        conns
            .iter()
            .map(|conn| spawn_pipe(shutdown.clone(), Arc::clone(conn), out.clone()))
            .collect()
    }
}

pub(crate) fn spawn_pipe(
    shutdown: Shutdown,
    conn: Arc<dyn Conn>,
    out: Sender<Mutation>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(err) = pipe(&shutdown, &conn, &out) {
            if err.is_closed() {
                tracing::debug!(conn = %conn.name(), "pipe ended: connection closed");
            } else {
                tracing::warn!(conn = %conn.name(), %err, "pipe ended");
            }
        }
    })
}
