//! The central server loop.
//!
//! Every connection feeds one bounded channel; a single worker thread pops
//! mutations off it, applies them to the state tree, and rebroadcasts
//! accepted non-Read mutations to every connection in the set. That
//! includes the append-only log, whose self-write dedup keeps replay from
//! looping.

mod http;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use thiserror::Error;

use crate::config::Config;
use crate::conn::{Conn, ConnSet, FilterConn, IoConn, spawn_pipe};
use crate::domain::TeamState;
use crate::mutation::{Action, Mutation, MutationError};
use crate::shutdown::Shutdown;
use crate::state::MutableState;

const ACCEPT_IDLE: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Conn(#[from] MutationError),
}

pub struct Server {
    config: Config,
    shutdown: Shutdown,
    conns: Arc<ConnSet>,
    mutations_tx: Sender<Mutation>,
    mutations_rx: Receiver<Mutation>,
    state: MutableState<TeamState>,
}

impl Server {
    /// Build the server: state tree, connection set, fan-in channel, and
    /// the mutation log (filtered when `log_filter` rules are configured).
    /// Replay of the log happens once [`Server::start`] pipes it.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let (mutations_tx, mutations_rx) = bounded(config.mutation_buffer.max(1));
        let conns = Arc::new(ConnSet::new());

        let log = IoConn::open(&config.state_file)?;
        tracing::info!(file = %log.name(), "mutation log open");
        let log: Arc<dyn Conn> = if config.log_filter.is_empty() {
            log
        } else {
            FilterConn::wrap(log, &config.log_filter)?
        };
        conns.add(log);

        Ok(Self {
            config,
            shutdown: Shutdown::new(),
            conns,
            mutations_tx,
            mutations_rx,
            state: MutableState::new(TeamState::new()),
        })
    }

    /// Register an extra connection before starting; it will be piped and
    /// receive broadcasts like any accepted peer.
    pub fn add_conn(&self, conn: Arc<dyn Conn>) {
        self.conns.add(conn);
    }

    /// Bind the listener, pipe every registered connection, and spawn the
    /// accept loop and the worker.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let Server {
            config,
            shutdown,
            conns,
            mutations_tx,
            mutations_rx,
            state,
        } = self;

        let listener = TcpListener::bind(&config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        conns.pipe_all(&shutdown, &mutations_tx);

        let worker = {
            let shutdown = shutdown.clone();
            let conns = Arc::clone(&conns);
            thread::spawn(move || work(shutdown, state, conns, mutations_rx))
        };

        let accept = {
            let shutdown = shutdown.clone();
            let conns = Arc::clone(&conns);
            let ws_config = config.ws_config();
            thread::spawn(move || {
                run_accept_loop(listener, shutdown, conns, mutations_tx, ws_config)
            })
        };

        tracing::info!(addr = %local_addr, "listening");
        Ok(ServerHandle {
            shutdown,
            conns,
            local_addr,
            worker,
            accept,
        })
    }
}

pub struct ServerHandle {
    shutdown: Shutdown,
    conns: Arc<ConnSet>,
    local_addr: SocketAddr,
    worker: JoinHandle<()>,
    accept: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the server stops.
    pub fn wait(self) {
        let _ = self.worker.join();
        let _ = self.accept.join();
    }

    /// Cancel the server, close every connection (which unblocks their
    /// pipes), and join the core threads.
    pub fn shutdown(self) {
        self.shutdown.cancel();
        for conn in self.conns.snapshot() {
            conn.close();
        }
        let _ = self.worker.join();
        let _ = self.accept.join();
    }
}

fn run_accept_loop(
    listener: TcpListener,
    shutdown: Shutdown,
    conns: Arc<ConnSet>,
    mutations_tx: Sender<Mutation>,
    ws_config: crate::conn::WsConfig,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match listener.accept() {
            Ok((stream, _)) => match http::accept_websocket(stream, &ws_config) {
                Ok(Some(conn)) => {
                    tracing::info!(conn = %conn.name(), "peer connected");
                    let shared: Arc<dyn Conn> = conn;
                    conns.add(Arc::clone(&shared));
                    spawn_pipe(shutdown.clone(), shared, mutations_tx.clone());
                    conns.purge();
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, "websocket accept failed"),
            },
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(err) => {
                tracing::warn!(%err, "accept error");
                thread::sleep(ACCEPT_IDLE);
            }
        }
    }
}

/// The single application loop: all state writes happen here, in channel
/// order. Rejected mutations are reported to their origin only; accepted
/// non-Read mutations are rebroadcast to every connection. A no-op update
/// succeeds without a broadcast.
fn work(
    shutdown: Shutdown,
    mut state: MutableState<TeamState>,
    conns: Arc<ConnSet>,
    mutations_rx: Receiver<Mutation>,
) {
    loop {
        crossbeam::select! {
            recv(shutdown.signal()) -> _ => return,
            recv(mutations_rx) -> mutation => {
                let Ok(mut mutation) = mutation else { return };
                tracing::info!(
                    action = %mutation.action,
                    path = %mutation.path,
                    body = %String::from_utf8_lossy(mutation.body_bytes()),
                    "mutation"
                );

                match state.apply(&mut mutation) {
                    Ok(()) => {
                        if mutation.action != Action::Read {
                            conns.broadcast(&mutation);
                        }
                    }
                    Err(err) if err.is_no_change() => {}
                    Err(err) => {
                        tracing::warn!(client_id = %mutation.client_id, %err, "mutation rejected");
                        let rejected = MutationError::mutation_rejected(
                            mutation.client_id.clone(),
                            err.to_string(),
                            err,
                        );
                        mutation.error(&rejected);
                    }
                }
            }
        }
    }
}
