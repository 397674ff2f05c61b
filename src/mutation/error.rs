use thiserror::Error;

use super::MutationId;

type Source = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the mutation transport layer.
///
/// `Closed` is terminal for the connection that raised it;
/// `CommunicationFailed` is a transient transport fault the caller may
/// retry; `MutationFailed` marks a malformed or rejected mutation and is
/// reported back to the peer without dropping the connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MutationError {
    #[error("connection {conn} closed")]
    Closed {
        conn: String,
        #[source]
        source: Option<Source>,
    },

    #[error("communication failed on {conn}: {msg}")]
    CommunicationFailed {
        conn: String,
        msg: String,
        #[source]
        source: Option<Source>,
    },

    #[error("mutation failed: {msg}")]
    MutationFailed {
        msg: String,
        /// The client-assigned ID of the offending mutation, when known.
        /// Error replies quote it so the peer can correlate.
        client_id: Option<MutationId>,
        #[source]
        source: Option<Source>,
    },

    #[error("invalid filter rule: {rule}")]
    InvalidFilterRule { rule: String },
}

impl MutationError {
    pub fn closed(conn: impl Into<String>) -> Self {
        MutationError::Closed {
            conn: conn.into(),
            source: None,
        }
    }

    pub fn closed_by(conn: impl Into<String>, source: impl Into<Source>) -> Self {
        MutationError::Closed {
            conn: conn.into(),
            source: Some(source.into()),
        }
    }

    pub fn comm_failed(conn: impl Into<String>, msg: impl Into<String>) -> Self {
        MutationError::CommunicationFailed {
            conn: conn.into(),
            msg: msg.into(),
            source: None,
        }
    }

    pub fn comm_failed_by(
        conn: impl Into<String>,
        msg: impl Into<String>,
        source: impl Into<Source>,
    ) -> Self {
        MutationError::CommunicationFailed {
            conn: conn.into(),
            msg: msg.into(),
            source: Some(source.into()),
        }
    }

    pub fn mutation_failed(msg: impl Into<String>) -> Self {
        MutationError::MutationFailed {
            msg: msg.into(),
            client_id: None,
            source: None,
        }
    }

    pub fn mutation_rejected(
        client_id: MutationId,
        msg: impl Into<String>,
        source: impl Into<Source>,
    ) -> Self {
        MutationError::MutationFailed {
            msg: msg.into(),
            client_id: Some(client_id),
            source: Some(source.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, MutationError::Closed { .. })
    }

    pub fn is_mutation_failed(&self) -> bool {
        matches!(self, MutationError::MutationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn closed_formats_with_conn_name() {
        let err = MutationError::closed("log.mutlog");
        assert_eq!(err.to_string(), "connection log.mutlog closed");
        assert!(err.is_closed());
        assert!(err.source().is_none());
    }

    #[test]
    fn comm_failed_unwraps_to_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err = MutationError::comm_failed_by("ws:1.2.3.4", "failed to write", cause);
        assert_eq!(
            err.to_string(),
            "communication failed on ws:1.2.3.4: failed to write"
        );
        assert_eq!(err.source().unwrap().to_string(), "pipe gone");
    }

    #[test]
    fn mutation_failed_carries_client_id() {
        let err = MutationError::mutation_rejected(
            MutationId::from("q1"),
            "invalid field",
            MutationError::mutation_failed("inner"),
        );
        match &err {
            MutationError::MutationFailed { client_id, .. } => {
                assert_eq!(client_id.as_ref().unwrap().as_str(), "q1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_mutation_failed());
    }

    #[test]
    fn invalid_filter_rule_names_the_rule() {
        let err = MutationError::InvalidFilterRule {
            rule: "!".to_string(),
        };
        assert_eq!(err.to_string(), "invalid filter rule: !");
    }
}
