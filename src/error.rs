use thiserror::Error;

use crate::config::ConfigError;
use crate::mutation::MutationError;
use crate::server::ServerError;
use crate::state::StateError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the capability errors owned
/// by each module.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),
}
