//! Readonly wrapper for domain-tree nodes.

use serde::{Deserialize, Serialize};

use super::{Mutable, StateError};

/// A node whose subtree serves reads but rejects every write with
/// [`StateError::ReadOnly`]. Declared in the domain tree itself, so
/// readonly-ness is part of the tree's static shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Readonly<T>(pub T);

impl<T> Readonly<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn get(&self) -> &T {
        &self.0
    }
}

impl<T: Mutable> Mutable for Readonly<T> {
    fn value_to_json(&self) -> Result<Vec<u8>, StateError> {
        self.0.value_to_json()
    }

    fn value_from_json(&mut self, _bytes: &[u8]) -> Result<(), StateError> {
        Err(StateError::ReadOnly)
    }

    /// Navigation passes through; the path walk carries the readonly flag
    /// down to whatever it reaches.
    fn field_mut(&mut self, name: &str) -> Result<&mut dyn Mutable, StateError> {
        self.0.field_mut(name)
    }

    fn is_readonly(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_delegate_writes_fail() {
        let mut value = Readonly::new("v1".to_string());
        assert_eq!(value.value_to_json().unwrap(), b"\"v1\"");
        assert!(matches!(
            value.value_from_json(b"\"v2\""),
            Err(StateError::ReadOnly)
        ));
        assert_eq!(value.get(), "v1");
        assert!(value.is_readonly());
    }

    #[test]
    fn serializes_transparently() {
        let value = Readonly::new(3u32);
        assert_eq!(serde_json::to_string(&value).unwrap(), "3");
        let back: Readonly<u32> = serde_json::from_str("3").unwrap();
        assert_eq!(back, value);
    }
}
