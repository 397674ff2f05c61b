//! The mutable state overlay.
//!
//! A [`Mutable`] adapts one node of the domain tree to the mutation
//! pipeline: JSON encode, JSON decode-in-place, and navigation to named
//! children. Scalars, maps, and structs get implementations here (structs
//! through [`mutable_struct!`]); domain nodes with computed or readonly
//! fields write their own.
//!
//! [`MutableState`] owns the domain root and applies mutations to it: walk
//! the path, then dispatch on the action. All applications happen on the
//! server's single worker thread.

mod map;
mod readonly;
mod scalar;

pub use map::MapKey;
pub use readonly::Readonly;

use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;

use crate::mutation::{Action, Mutation, MutationError, MutationId};

/// Errors raised while navigating or mutating the state tree.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    #[error("unknown field: {0:?}")]
    UnknownField(String),

    #[error("field {0:?} already exists")]
    DuplicateField(String),

    #[error("invalid map key: {0:?}")]
    InvalidKey(String),

    /// The addressed value has no children to navigate into.
    #[error("value not found")]
    NotFound,

    #[error("readonly")]
    ReadOnly,

    /// The decoded value equals the current one; nothing was written.
    #[error("mutation is a no-op")]
    NoChange,

    /// Create/Delete addressed a node that has no keyed children.
    #[error("cannot create or delete here")]
    NotAContainer,

    #[error("invalid action {0}")]
    InvalidAction(Action),

    #[error("read requires an originating connection")]
    MissingOrigin,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("read reply failed")]
    Reply(#[from] MutationError),
}

impl StateError {
    pub fn is_no_change(&self) -> bool {
        matches!(self, StateError::NoChange)
    }
}

/// One node of the domain tree, as seen by the mutation pipeline.
pub trait Mutable {
    /// JSON encoding of the value rooted here.
    fn value_to_json(&self) -> Result<Vec<u8>, StateError>;

    /// Decode `bytes` and overwrite the value in place. Returns
    /// [`StateError::NoChange`] when the decoded value equals the current
    /// one.
    fn value_from_json(&mut self, bytes: &[u8]) -> Result<(), StateError>;

    /// Navigate to a named child.
    fn field_mut(&mut self, name: &str) -> Result<&mut dyn Mutable, StateError>;

    /// Readonly nodes fail writes and shield their subtree; the walk
    /// accumulates this flag.
    fn is_readonly(&self) -> bool {
        false
    }

    /// Insert a new keyed child. Only keyed containers (maps) support this.
    fn insert_field(&mut self, name: &str, bytes: &[u8]) -> Result<(), StateError> {
        let _ = (name, bytes);
        Err(StateError::NotAContainer)
    }

    /// Remove a keyed child, returning its JSON encoding. Only keyed
    /// containers (maps) support this.
    fn remove_field(&mut self, name: &str) -> Result<Vec<u8>, StateError> {
        let _ = name;
        Err(StateError::NotAContainer)
    }
}

/// Implement [`Mutable`] for a struct by mapping wire field names to
/// fields. The struct must be `PartialEq + Serialize + DeserializeOwned`
/// and every listed field must itself be `Mutable`. This is the static
/// counterpart of tag-driven reflection: the field table is spelled out
/// where the struct is defined.
macro_rules! mutable_struct {
    ($ty:ty { $($wire:literal => $field:ident),+ $(,)? }) => {
        impl $crate::state::Mutable for $ty {
            fn value_to_json(&self) -> Result<Vec<u8>, $crate::state::StateError> {
                Ok(serde_json::to_vec(self)?)
            }

            fn value_from_json(
                &mut self,
                bytes: &[u8],
            ) -> Result<(), $crate::state::StateError> {
                let next: $ty = serde_json::from_slice(bytes)?;
                if *self == next {
                    return Err($crate::state::StateError::NoChange);
                }
                *self = next;
                Ok(())
            }

            fn field_mut(
                &mut self,
                name: &str,
            ) -> Result<&mut dyn $crate::state::Mutable, $crate::state::StateError> {
                match name {
                    $($wire => Ok(&mut self.$field),)+
                    _ => Err($crate::state::StateError::UnknownField(name.to_string())),
                }
            }
        }
    };
}
pub(crate) use mutable_struct;

/// The root of the state tree, plus the application of mutations to it.
pub struct MutableState<R: Mutable> {
    root: R,
}

impl<R: Mutable> MutableState<R> {
    pub fn new(root: R) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &R {
        &self.root
    }

    /// Apply one mutation to the tree.
    ///
    /// - Read: encode the addressed value and send an Update reply on the
    ///   originating connection, preserving path and client ID.
    /// - Update: snapshot the prior value into `original_body`, then decode
    ///   over it. A decode equal to the current value is `NoChange`.
    /// - Create/Delete: insert into / remove from the keyed container at
    ///   the parent of the path tail; Delete captures the removed value as
    ///   `original_body`.
    pub fn apply(&mut self, mutation: &mut Mutation) -> Result<(), StateError> {
        match mutation.action {
            Action::Create | Action::Delete => self.apply_keyed(mutation),
            Action::Read => self.apply_read(mutation),
            Action::Update => self.apply_update(mutation),
            Action::Unknown => Err(StateError::InvalidAction(Action::Unknown)),
        }
    }

    fn walk<'a>(
        root: &'a mut R,
        segments: &[String],
    ) -> Result<(&'a mut dyn Mutable, bool), StateError> {
        let mut readonly = root.is_readonly();
        let mut node: &mut dyn Mutable = root;
        for segment in segments {
            node = node.field_mut(segment)?;
            readonly |= node.is_readonly();
        }
        Ok((node, readonly))
    }

    fn apply_read(&mut self, mutation: &Mutation) -> Result<(), StateError> {
        let conn = mutation
            .origin
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
            .ok_or(StateError::MissingOrigin)?;

        let (node, _) = Self::walk(&mut self.root, mutation.path.segments())?;
        let body = node.value_to_json()?;

        let reply = Mutation {
            client_id: mutation.client_id.clone(),
            id: MutationId::random(),
            timestamp: OffsetDateTime::now_utc(),
            origin: None,
            action: Action::Update,
            path: mutation.path.clone(),
            original_body: None,
            body: Some(Bytes::from(body)),
        };
        conn.send(&reply)?;
        Ok(())
    }

    fn apply_update(&mut self, mutation: &mut Mutation) -> Result<(), StateError> {
        let (node, readonly) = Self::walk(&mut self.root, mutation.path.segments())?;
        if readonly {
            return Err(StateError::ReadOnly);
        }

        let prior = node.value_to_json()?;
        node.value_from_json(mutation.body_bytes())?;
        mutation.original_body = Some(Bytes::from(prior));
        Ok(())
    }

    fn apply_keyed(&mut self, mutation: &mut Mutation) -> Result<(), StateError> {
        let Some((key, parents)) = mutation.path.split_last() else {
            return Err(StateError::NotAContainer);
        };

        let (parent, readonly) = Self::walk(&mut self.root, parents)?;
        if readonly {
            return Err(StateError::ReadOnly);
        }

        match mutation.action {
            Action::Create => parent.insert_field(key, mutation.body_bytes()),
            Action::Delete => {
                let removed = parent.remove_field(key)?;
                mutation.original_body = Some(Bytes::from(removed));
                Ok(())
            }
            _ => Err(StateError::InvalidAction(mutation.action)),
        }
    }
}
