#![forbid(unsafe_code)]

pub mod config;
pub mod conn;
pub mod domain;
pub mod error;
pub mod mutation;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the mutation-pipeline surface at the crate root for convenience
pub use crate::conn::{Conn, ConnRef, ConnSet, FilterConn, IoConn, WsConfig, WsConn, pipe};
pub use crate::mutation::{Action, Mutation, MutationError, MutationId, MutationPath};
pub use crate::state::{Mutable, MutableState, Readonly, StateError};
