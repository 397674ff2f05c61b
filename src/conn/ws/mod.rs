//! Websocket mutation transport.
//!
//! Each connection owns three threads: a *reader* that decodes frames off
//! the socket, a *writer* that serializes queued messages onto it, and a
//! *worker* that parses incoming text into mutations, answers pings, sends
//! heartbeats, and enforces the idle timeout. External callers never touch
//! the socket; everything crosses a channel.

mod frame;
pub mod handshake;

pub use frame::{
    FrameError, FrameReader, FrameWriter, OPCODE_BINARY, OPCODE_CLOSE, OPCODE_CONTINUATION,
    OPCODE_PING, OPCODE_PONG, OPCODE_TEXT, WsMessage, close_payload,
};

use std::io::BufReader;
use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError, after, bounded, tick};

use crate::mutation::{Mutation, MutationError};
use crate::shutdown::Shutdown;

use super::{Conn, ConnRef};

const CONTROL_WRITE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct WsConfig {
    /// Heartbeat interval. Must be non-zero; a zero interval is a
    /// programmer error.
    pub ping_interval: Duration,
    /// Idle cutoff: the connection closes itself when no frame arrives for
    /// this long. Must be non-zero.
    pub timeout: Duration,
    pub send_queue: usize,
    pub recv_queue: usize,
    pub max_payload: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(45),
            send_queue: 16,
            recv_queue: 16,
            max_payload: 1024 * 1024,
        }
    }
}

struct Outbound {
    opcode: u8,
    payload: Vec<u8>,
    result: Option<Sender<Result<(), MutationError>>>,
}

/// A full-duplex websocket mutation connection.
pub struct WsConn {
    name: String,
    shutdown: Shutdown,
    send_tx: Sender<Outbound>,
    mutations_rx: Receiver<Mutation>,
    stream: Mutex<Option<TcpStream>>,
}

impl WsConn {
    /// Take over a freshly upgraded socket. `reader` must be the buffered
    /// reading half used for the handshake, so bytes the client sent right
    /// behind the upgrade request are not lost.
    pub fn spawn(
        reader: BufReader<TcpStream>,
        writer: TcpStream,
        peer: SocketAddr,
        config: &WsConfig,
    ) -> std::io::Result<Arc<WsConn>> {
        assert!(
            !config.ping_interval.is_zero() && !config.timeout.is_zero(),
            "websocket ping interval and timeout must be non-zero"
        );

        let (send_tx, send_rx) = bounded(config.send_queue.max(1));
        let (rec_tx, rec_rx) = bounded(config.recv_queue.max(1));
        let (mutations_tx, mutations_rx) = bounded(0);

        let control = writer.try_clone()?;
        let held = writer.try_clone()?;
        let shutdown = Shutdown::new();

        let conn = Arc::new(WsConn {
            name: format!("ws:{peer}"),
            shutdown: shutdown.clone(),
            send_tx: send_tx.clone(),
            mutations_rx,
            stream: Mutex::new(Some(held)),
        });

        let origin: ConnRef = {
            let as_dyn: Arc<dyn Conn> = conn.clone();
            Arc::downgrade(&as_dyn)
        };

        let frame_reader = FrameReader::new(reader, config.max_payload);
        let reader_conn = conn.clone();
        thread::spawn(move || run_reader(frame_reader, rec_tx, reader_conn));

        let frame_writer = FrameWriter::new(writer);
        let writer_shutdown = shutdown.clone();
        let writer_name = conn.name.clone();
        thread::spawn(move || {
            run_writer(frame_writer, control, send_rx, writer_shutdown, writer_name)
        });

        let worker_conn = conn.clone();
        let worker_config = config.clone();
        thread::spawn(move || {
            run_worker(worker_conn, origin, rec_rx, send_tx, mutations_tx, worker_config)
        });

        Ok(conn)
    }

    fn enqueue(&self, out: Outbound) -> Result<(), MutationError> {
        match self.send_tx.try_send(out) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(MutationError::comm_failed(self.name(), "send queue full"))
            }
            Err(TrySendError::Disconnected(_)) => Err(MutationError::closed(self.name())),
        }
    }
}

impl Conn for WsConn {
    /// Enqueue the mutation as a text frame and wait for the write result.
    /// A full queue fails fast rather than blocking the caller.
    fn send(&self, mutation: &Mutation) -> Result<(), MutationError> {
        if self.shutdown.is_cancelled() {
            return Err(MutationError::closed(self.name()));
        }

        let (result_tx, result_rx) = bounded(1);
        self.enqueue(Outbound {
            opcode: OPCODE_TEXT,
            payload: mutation.to_wire(true).into_bytes(),
            result: Some(result_tx),
        })?;

        crossbeam::select! {
            recv(self.shutdown.signal()) -> _ => Err(MutationError::closed(self.name())),
            recv(result_rx) -> res => res.unwrap_or_else(|_| Err(MutationError::closed(self.name()))),
        }
    }

    fn receive(&self) -> Result<Mutation, MutationError> {
        crossbeam::select! {
            recv(self.shutdown.signal()) -> _ => Err(MutationError::closed(self.name())),
            recv(self.mutations_rx) -> mutation => {
                mutation.map_err(|_| MutationError::closed(self.name()))
            }
        }
    }

    fn close(&self) {
        self.shutdown.cancel();
        if let Some(stream) = self.stream.lock().expect("ws stream lock").take() {
            let _ = stream.shutdown(SocketShutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.lock().expect("ws stream lock").is_none()
    }

    /// Report an error to the peer as a text frame, quoting the mutation's
    /// client ID when the error identifies one. Best-effort.
    fn send_error(&self, err: &MutationError) {
        let text = match err {
            MutationError::MutationFailed {
                client_id: Some(id),
                ..
            } => format!("{id} ERROR {err}"),
            _ => format!("ERROR {err}"),
        };
        let _ = self.enqueue(Outbound {
            opcode: OPCODE_TEXT,
            payload: text.into_bytes(),
            result: None,
        });
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

fn run_reader(
    mut frames: FrameReader<BufReader<TcpStream>>,
    rec_tx: Sender<WsMessage>,
    conn: Arc<WsConn>,
) {
    loop {
        if conn.shutdown.is_cancelled() {
            return;
        }

        match frames.next_message() {
            Ok(message) => {
                crossbeam::select! {
                    recv(conn.shutdown.signal()) -> _ => return,
                    send(rec_tx, message) -> res => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                if !conn.shutdown.is_cancelled() {
                    tracing::debug!(conn = %conn.name, %err, "websocket read ended");
                }
                conn.close();
                return;
            }
        }
    }
}

fn run_writer(
    mut frames: FrameWriter<TcpStream>,
    control: TcpStream,
    send_rx: Receiver<Outbound>,
    shutdown: Shutdown,
    name: String,
) {
    loop {
        crossbeam::select! {
            recv(shutdown.signal()) -> _ => return,
            recv(send_rx) -> out => {
                let Ok(out) = out else { return };
                let res = write_outbound(&mut frames, &control, &out, &name);
                if let Err(err) = &res {
                    tracing::debug!(conn = %name, %err, "websocket write failed");
                }
                if let Some(result_tx) = out.result {
                    let _ = result_tx.try_send(res);
                }
            }
        }
    }
}

fn write_outbound(
    frames: &mut FrameWriter<TcpStream>,
    control: &TcpStream,
    out: &Outbound,
    name: &str,
) -> Result<(), MutationError> {
    let is_control = out.opcode >= OPCODE_CLOSE;
    if is_control {
        let _ = control.set_write_timeout(Some(CONTROL_WRITE_DEADLINE));
    }
    let res = frames
        .write_message(out.opcode, &out.payload, None)
        .map_err(|err| MutationError::comm_failed_by(name, "failed to write frame", err));
    if is_control {
        let _ = control.set_write_timeout(None);
    }
    res
}

fn run_worker(
    conn: Arc<WsConn>,
    origin: ConnRef,
    rec_rx: Receiver<WsMessage>,
    send_tx: Sender<Outbound>,
    mutations_tx: Sender<Mutation>,
    config: WsConfig,
) {
    let ping = tick(config.ping_interval);
    let mut idle = after(config.timeout);

    // Blocking enqueue that gives up on cancellation. Returns false when
    // the connection is going away.
    let enqueue = |opcode: u8, payload: Vec<u8>| -> bool {
        let out = Outbound {
            opcode,
            payload,
            result: None,
        };
        crossbeam::select! {
            recv(conn.shutdown.signal()) -> _ => false,
            send(send_tx, out) -> res => res.is_ok(),
        }
    };

    loop {
        crossbeam::select! {
            recv(conn.shutdown.signal()) -> _ => return,
            recv(idle) -> _ => {
                tracing::debug!(conn = %conn.name, "websocket idle timeout");
                conn.close();
                return;
            }
            recv(ping) -> _ => {
                if !enqueue(OPCODE_PING, Vec::new()) {
                    return;
                }
            }
            recv(rec_rx) -> message => {
                let Ok(message) = message else { return };
                idle = after(config.timeout);

                match message {
                    WsMessage::Text(text) => {
                        match Mutation::parse(&text, Some(origin.clone())) {
                            Ok(mutation) => {
                                crossbeam::select! {
                                    recv(conn.shutdown.signal()) -> _ => return,
                                    send(mutations_tx, mutation) -> res => {
                                        if res.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                            Err(err) => conn.send_error(&err),
                        }
                    }
                    WsMessage::Ping(data) => {
                        if !enqueue(OPCODE_PONG, data) {
                            return;
                        }
                    }
                    WsMessage::Pong(_) | WsMessage::Binary(_) => {}
                    WsMessage::Close { .. } => {
                        conn.close();
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Action, MutationId, MutationPath};
    use bytes::Bytes;
    use std::net::TcpListener;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (client, server, peer)
    }

    fn spawn_conn(config: &WsConfig) -> (Arc<WsConn>, FrameReader<TcpStream>, FrameWriter<TcpStream>) {
        let (client, server, peer) = socket_pair();
        let reader = BufReader::new(server.try_clone().unwrap());
        let conn = WsConn::spawn(reader, server, peer, config).unwrap();
        let client_read = FrameReader::new(client.try_clone().unwrap(), 1024 * 1024);
        let client_write = FrameWriter::new(client);
        (conn, client_read, client_write)
    }

    fn mutation() -> Mutation {
        Mutation {
            client_id: MutationId::from("q1"),
            id: MutationId::from("srv1"),
            timestamp: time::OffsetDateTime::now_utc(),
            origin: None,
            action: Action::Update,
            path: MutationPath::from(&["note"][..]),
            original_body: None,
            body: Some(Bytes::from_static(b"\"hi\"")),
        }
    }

    #[test]
    fn receive_parses_client_text_frames() {
        let (conn, _cr, mut cw) = spawn_conn(&WsConfig::default());
        cw.write_message(OPCODE_TEXT, b"q1 UPDATE note \"hi\"", Some(MASK))
            .unwrap();

        let m = conn.receive().unwrap();
        assert_eq!(m.client_id, MutationId::from("q1"));
        assert_eq!(m.action, Action::Update);
        assert_eq!(m.path.segments(), ["note"]);
        assert_eq!(m.body_bytes(), b"\"hi\"");

        let origin = m.origin.as_ref().unwrap().upgrade().unwrap();
        assert_eq!(origin.name(), conn.name());
    }

    #[test]
    fn send_delivers_client_id_on_the_wire() {
        let (conn, mut cr, _cw) = spawn_conn(&WsConfig::default());
        let m = mutation();
        conn.send(&m).unwrap();

        match cr.next_message().unwrap() {
            WsMessage::Text(text) => assert_eq!(text, m.to_wire(true)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn bad_mutation_gets_an_error_line_back() {
        let (_conn, mut cr, mut cw) = spawn_conn(&WsConfig::default());
        cw.write_message(OPCODE_TEXT, b"nonsense", Some(MASK)).unwrap();

        match cr.next_message().unwrap() {
            WsMessage::Text(text) => {
                assert!(text.starts_with("ERROR "), "got {text:?}");
                assert!(text.contains("invalid mutation"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn pings_flow_on_the_configured_interval() {
        let config = WsConfig {
            ping_interval: Duration::from_millis(30),
            ..WsConfig::default()
        };
        let (_conn, mut cr, _cw) = spawn_conn(&config);

        match cr.next_message().unwrap() {
            WsMessage::Ping(_) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn client_pings_are_answered_with_pongs() {
        let (_conn, mut cr, mut cw) = spawn_conn(&WsConfig::default());
        cw.write_message(OPCODE_PING, b"beat", Some(MASK)).unwrap();

        match cr.next_message().unwrap() {
            WsMessage::Pong(data) => assert_eq!(data, b"beat"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn idle_timeout_closes_the_connection() {
        let config = WsConfig {
            ping_interval: Duration::from_secs(60),
            timeout: Duration::from_millis(50),
            ..WsConfig::default()
        };
        let (conn, _cr, _cw) = spawn_conn(&config);

        assert!(conn.receive().unwrap_err().is_closed());
        assert!(conn.is_closed());
    }

    #[test]
    fn close_frame_closes_the_connection() {
        let (conn, _cr, mut cw) = spawn_conn(&WsConfig::default());
        cw.write_message(OPCODE_CLOSE, &close_payload(1000, "bye"), Some(MASK))
            .unwrap();

        assert!(conn.receive().unwrap_err().is_closed());
        assert!(conn.is_closed());
    }

    #[test]
    fn closed_conn_rejects_send() {
        let (conn, _cr, _cw) = spawn_conn(&WsConfig::default());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.send(&mutation()).unwrap_err().is_closed());
        assert!(conn.receive().unwrap_err().is_closed());
    }
}
