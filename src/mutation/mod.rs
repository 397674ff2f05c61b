//! Mutation records and the error taxonomy of the mutation pipeline.
//!
//! A [`Mutation`] is a declarative record of a single change (or read
//! request) against the shared state tree. Mutations travel between
//! [`Conn`](crate::conn::Conn)s as single text lines, are applied in one
//! place by the [`MutableState`](crate::state::MutableState), and are
//! rebroadcast to every other peer. Replaying a recorded log reconstructs
//! the state exactly.

mod error;
mod record;

pub use error::MutationError;
pub use record::{Action, IdSource, Mutation, MutationId, MutationPath, random_ids};
