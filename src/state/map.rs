//! `Mutable` for keyed containers.

use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Mutable, StateError};

/// A scalar map key that can be recovered from a path segment. Strings and
/// the integer family qualify; floats are not equatable keys in Rust maps.
pub trait MapKey: Eq + Hash + Clone + Serialize + DeserializeOwned {
    fn from_segment(segment: &str) -> Option<Self>;
}

impl MapKey for String {
    fn from_segment(segment: &str) -> Option<Self> {
        Some(segment.to_string())
    }
}

macro_rules! impl_int_map_key {
    ($($ty:ty),+ $(,)?) => {$(
        impl MapKey for $ty {
            fn from_segment(segment: &str) -> Option<Self> {
                segment.parse().ok()
            }
        }
    )+};
}

impl_int_map_key!(i8, i16, i32, i64, u8, u16, u32, u64);

impl<K, V> Mutable for HashMap<K, V>
where
    K: MapKey,
    V: Mutable + Default + PartialEq + Serialize + DeserializeOwned,
{
    fn value_to_json(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn value_from_json(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let next: HashMap<K, V> = serde_json::from_slice(bytes)?;
        if *self == next {
            return Err(StateError::NoChange);
        }
        *self = next;
        Ok(())
    }

    /// A missing key autovivifies a default-valued entry, so paths can be
    /// written before anything was stored under them.
    fn field_mut(&mut self, name: &str) -> Result<&mut dyn Mutable, StateError> {
        let key = K::from_segment(name).ok_or_else(|| StateError::InvalidKey(name.to_string()))?;
        Ok(self.entry(key).or_default())
    }

    fn insert_field(&mut self, name: &str, bytes: &[u8]) -> Result<(), StateError> {
        let key = K::from_segment(name).ok_or_else(|| StateError::InvalidKey(name.to_string()))?;
        if self.contains_key(&key) {
            return Err(StateError::DuplicateField(name.to_string()));
        }
        let value: V = serde_json::from_slice(bytes)?;
        self.insert(key, value);
        Ok(())
    }

    fn remove_field(&mut self, name: &str) -> Result<Vec<u8>, StateError> {
        let key = K::from_segment(name).ok_or_else(|| StateError::InvalidKey(name.to_string()))?;
        let removed = self
            .remove(&key)
            .ok_or_else(|| StateError::UnknownField(name.to_string()))?;
        Ok(serde_json::to_vec(&removed)?)
    }
}
