use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::conn::ConnRef;

use super::MutationError;

/// A mostly-unique identifier for a mutation.
///
/// Depending on the source, the ID may be a UUID or a simple incrementing
/// number; IDs are not guaranteed to be globally unique and a single
/// mutation may change IDs depending on the connection it is sent through.
/// A leading `-` marks the inverse of another mutation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MutationId(String);

impl MutationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_inverse(&self) -> bool {
        self.0.starts_with('-')
    }

    /// Toggle the inverse marker: strip a leading `-`, or prepend one.
    pub fn inverted(&self) -> Self {
        if self.0.is_empty() {
            return self.clone();
        }
        match self.0.strip_prefix('-') {
            Some(rest) => Self(rest.to_string()),
            None => Self(format!("-{}", self.0)),
        }
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MutationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MutationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Source of freshly generated mutation IDs.
///
/// Transports that stamp their own IDs (the IO connection) take one of
/// these so tests can pin the generated values.
pub type IdSource = Arc<dyn Fn() -> MutationId + Send + Sync>;

pub fn random_ids() -> IdSource {
    Arc::new(MutationId::random)
}

/// The kind of change a mutation performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Unknown,
    Create,
    /// Not technically a mutation: a remote read of the addressed value,
    /// answered with an Update reply on the originating connection only.
    Read,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Read => "READ",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::Unknown => "UNKNOWN",
        }
    }

    /// Case-sensitive keyword lookup; anything unrecognized is `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text {
            "CREATE" => Action::Create,
            "READ" => Action::Read,
            "UPDATE" => Action::Update,
            "DELETE" => Action::Delete,
            _ => Action::Unknown,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A path into the state tree. Empty means the root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationPath(Vec<String>);

impl MutationPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Decode the wire form: the literal `/` is the root, otherwise the
    /// text splits on `/` with a leading empty (absolute) segment elided.
    pub fn parse(text: &str) -> Self {
        if text == "/" {
            return Self::root();
        }
        let mut segments: Vec<String> = text.split('/').map(str::to_string).collect();
        if segments.first().is_some_and(String::is_empty) {
            segments.remove(0);
        }
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn split_last(&self) -> Option<(&str, &[String])> {
        self.0.split_last().map(|(last, init)| (last.as_str(), init))
    }
}

impl fmt::Display for MutationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        f.write_str(&self.0.join("/"))
    }
}

impl<S: Into<String>> FromIterator<S> for MutationPath {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<&[&str]> for MutationPath {
    fn from(segments: &[&str]) -> Self {
        segments.iter().copied().collect()
    }
}

/// A single proposed or recorded change to the state tree.
#[derive(Clone, Debug)]
pub struct Mutation {
    /// The ID the originator assigned, used to match replies to requests.
    pub client_id: MutationId,
    /// Transport-unique ID. A leading `-` marks an inverse.
    pub id: MutationId,
    pub timestamp: OffsetDateTime,
    /// The connection that produced the mutation. Non-owning: a mutation
    /// never prolongs its connection's lifetime.
    pub origin: Option<ConnRef>,
    pub action: Action,
    pub path: MutationPath,
    /// Snapshot of the addressed value prior to applying, captured during
    /// apply (never during parse). Inversion consumes it.
    pub original_body: Option<Bytes>,
    pub body: Option<Bytes>,
}

impl Mutation {
    /// Parse a mutation from its wire form:
    ///
    /// ```text
    /// [<ts> ]<id> <ACTION> <path>[ <body>]
    /// ```
    ///
    /// The leading RFC-3339 timestamp is optional; when absent the current
    /// time is substituted. A fresh transport ID is generated.
    pub fn parse(text: &str, origin: Option<ConnRef>) -> Result<Mutation, MutationError> {
        let mut fields: Vec<&str> = text.split(' ').collect();
        if fields.len() < 3 {
            return Err(MutationError::mutation_failed("invalid mutation"));
        }

        let timestamp = match OffsetDateTime::parse(fields[0], &Rfc3339) {
            Ok(ts) => {
                fields.remove(0);
                ts
            }
            Err(_) => OffsetDateTime::now_utc(),
        };
        if fields.len() < 3 {
            return Err(MutationError::mutation_failed("invalid mutation"));
        }

        let body = if fields.len() > 3 {
            Some(Bytes::from(fields[3..].join(" ")))
        } else {
            None
        };

        Ok(Mutation {
            client_id: MutationId::from(fields[0]),
            id: MutationId::random(),
            timestamp,
            origin,
            action: Action::parse(fields[1]),
            path: MutationPath::parse(fields[2]),
            original_body: None,
            body,
        })
    }

    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    pub fn body_as_json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(self.body_bytes())
    }

    /// Report a failure back to the originating connection, if it is still
    /// alive. Best-effort.
    pub fn error(&self, err: &MutationError) {
        if let Some(conn) = self.origin.as_ref().and_then(ConnRef::upgrade) {
            conn.send_error(err);
        }
    }

    /// Wire form of the mutation. `use_client_id` selects which ID column
    /// is written; websocket peers get the client ID they can correlate,
    /// the mutation log records the transport ID.
    pub fn to_wire(&self, use_client_id: bool) -> String {
        let id = if use_client_id { &self.client_id } else { &self.id };
        let mut line = format!(
            "{} {} {} {}",
            wire_timestamp(self.timestamp),
            id,
            self.action,
            self.path
        );
        if !self.body_bytes().is_empty() {
            line.push(' ');
            line.push_str(&String::from_utf8_lossy(self.body_bytes()));
        }
        line
    }

    /// The mutation that would undo this one.
    ///
    /// Requires `original_body` to be populated for Update and Delete.
    /// Returns `None` for Read and Unknown, which do not modify state.
    pub fn inverse(&self) -> Option<Mutation> {
        let inverted = Mutation {
            client_id: self.client_id.inverted(),
            id: self.id.inverted(),
            timestamp: OffsetDateTime::now_utc(),
            origin: self.origin.clone(),
            path: self.path.clone(),
            action: self.action,
            original_body: None,
            body: None,
        };

        match self.action {
            Action::Create => Some(Mutation {
                action: Action::Delete,
                original_body: self.body.clone(),
                ..inverted
            }),
            Action::Update => Some(Mutation {
                action: Action::Update,
                original_body: self.body.clone(),
                body: self.original_body.clone(),
                ..inverted
            }),
            Action::Delete => Some(Mutation {
                action: Action::Create,
                body: self.original_body.clone(),
                ..inverted
            }),
            Action::Read | Action::Unknown => None,
        }
    }

    /// Two mutations are equivalent when applying them would have the same
    /// effect: same action, path, and body. IDs, timestamps, origins, and
    /// original bodies are ignored, so the inverses of two equivalent
    /// mutations are not necessarily equivalent.
    pub fn equivalent(&self, other: &Mutation) -> bool {
        self.action == other.action
            && self.path == other.path
            && self.body_bytes() == other.body_bytes()
    }

    /// Identity comparison: equivalence plus IDs, original body, timestamp,
    /// and originating connection.
    pub fn equal(&self, other: &Mutation) -> bool {
        self.equivalent(other)
            && self.id == other.id
            && self.client_id == other.client_id
            && self.original_body.as_deref().unwrap_or_default()
                == other.original_body.as_deref().unwrap_or_default()
            && self.timestamp == other.timestamp
            && same_origin(&self.origin, &other.origin)
    }
}

fn same_origin(a: &Option<ConnRef>, b: &Option<ConnRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => ConnRef::ptr_eq(a, b),
        _ => false,
    }
}

/// UTC RFC-3339 with whole-second precision, the on-wire timestamp form.
pub(crate) fn wire_timestamp(ts: OffsetDateTime) -> String {
    let utc = ts.to_offset(time::UtcOffset::UTC);
    let utc = utc.replace_nanosecond(0).unwrap_or(utc);
    utc.format(&Rfc3339).unwrap_or_default()
}
