use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::mutation::{IdSource, Mutation, MutationError, MutationId, random_ids};

use super::{Conn, ConnRef};

/// An append-only line-delimited mutation log acting as both history and a
/// peer.
///
/// Writes are stamped with a fresh ID which is remembered, so reading the
/// log back never re-emits this instance's own writes. On read, the
/// recorded ID column is trusted as the mutation's identity and the line
/// number takes its place as the reply-correlation ID.
pub struct IoConn<R: Read + Send, W: Write + Send> {
    reader: Mutex<Option<LineReader<R>>>,
    writer: Mutex<Option<W>>,
    ids: Mutex<HashSet<MutationId>>,
    id_source: IdSource,
    self_ref: Mutex<Option<ConnRef>>,
    closed: AtomicBool,
    name: String,
}

struct LineReader<R> {
    buf: BufReader<R>,
    line: u64,
}

impl IoConn<File, File> {
    /// Open (creating if needed) a mutation log file with append-only
    /// writes and an independent read cursor.
    pub fn open(path: &Path) -> std::io::Result<Arc<Self>> {
        Self::open_with_ids(path, random_ids())
    }

    pub fn open_with_ids(path: &Path, id_source: IdSource) -> std::io::Result<Arc<Self>> {
        let writer = OpenOptions::new().create(true).append(true).open(path)?;
        let reader = File::open(path)?;
        Ok(Self::shared(
            reader,
            writer,
            &path.display().to_string(),
            id_source,
        ))
    }
}

impl<R: Read + Send + 'static, W: Write + Send + 'static> IoConn<R, W> {
    /// Wrap an arbitrary reader/writer pair. Most useful for files, but any
    /// line-oriented transport works.
    pub fn shared(reader: R, writer: W, name: &str, id_source: IdSource) -> Arc<Self> {
        let name = if name.is_empty() {
            "unnamed IO connection".to_string()
        } else {
            name.to_string()
        };

        let conn = Arc::new(Self {
            reader: Mutex::new(Some(LineReader {
                buf: BufReader::new(reader),
                line: 0,
            })),
            writer: Mutex::new(Some(writer)),
            ids: Mutex::new(HashSet::new()),
            id_source,
            self_ref: Mutex::new(None),
            closed: AtomicBool::new(false),
            name,
        });

        let dyn_conn: Arc<dyn Conn> = conn.clone();
        *conn.self_ref.lock().expect("io conn self ref lock") = Some(Arc::downgrade(&dyn_conn));
        conn
    }

    fn origin(&self) -> Option<ConnRef> {
        self.self_ref
            .lock()
            .expect("io conn self ref lock")
            .clone()
    }

    /// Next line and its 1-based number. EOF reports Closed: the log has no
    /// more history, though the connection itself stays usable for writes.
    fn next_line(&self) -> Result<(String, u64), MutationError> {
        let mut guard = self.reader.lock().expect("io conn reader lock");
        let Some(reader) = guard.as_mut() else {
            return Err(MutationError::closed(self.name()));
        };

        let mut line = String::new();
        match reader.buf.read_line(&mut line) {
            Ok(0) => Err(MutationError::closed(self.name())),
            Ok(_) => {
                reader.line += 1;
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok((line, reader.line))
            }
            Err(err) => Err(MutationError::comm_failed_by(
                self.name(),
                "failed to read line",
                err,
            )),
        }
    }
}

impl<R: Read + Send + 'static, W: Write + Send + 'static> Conn for IoConn<R, W> {
    /// Append the mutation to the log under a freshly generated ID so a
    /// later read-back recognizes it. Re-sending a mutation whose ID was
    /// already recorded (a broadcast echo of a line read from this log) is
    /// a no-op.
    fn send(&self, mutation: &Mutation) -> Result<(), MutationError> {
        if self.is_closed() {
            return Err(MutationError::closed(self.name()));
        }

        let mut copy = mutation.clone();
        {
            let mut ids = self.ids.lock().expect("io conn id lock");
            if ids.contains(&mutation.id) {
                return Ok(());
            }
            copy.id = (self.id_source)();
            ids.insert(copy.id.clone());
        }

        let mut guard = self.writer.lock().expect("io conn writer lock");
        let Some(writer) = guard.as_mut() else {
            return Err(MutationError::closed(self.name()));
        };
        let mut line = copy.to_wire(false);
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|err| MutationError::comm_failed_by(self.name(), "failed to write", err))
    }

    /// Scan for the next non-terminal line. Invalid lines are logged and
    /// skipped; lines carrying an ID this instance wrote are skipped.
    fn receive(&self) -> Result<Mutation, MutationError> {
        loop {
            let (line, number) = self.next_line()?;

            let mut mutation = match Mutation::parse(&line, self.origin()) {
                Ok(m) => m,
                Err(err) => {
                    self.send_error(&err);
                    continue;
                }
            };

            // Trust the author's ID column; the line number takes over as
            // the reply-correlation ID so errors quote a source location.
            mutation.id = mutation.client_id.clone();
            mutation.client_id = MutationId::from(number.to_string());

            let seen = {
                let mut ids = self.ids.lock().expect("io conn id lock");
                !ids.insert(mutation.id.clone())
            };
            if seen {
                continue;
            }

            return Ok(mutation);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().expect("io conn writer lock").take() {
            let _ = writer.flush();
        }
        self.reader.lock().expect("io conn reader lock").take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Errors never land in the log itself; they go to the process logger
    /// with the file name and position.
    fn send_error(&self, err: &MutationError) {
        tracing::warn!(conn = %self.name(), %err, "skipping invalid mutation");
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
