//! `Mutable` for scalar leaves.

use super::{Mutable, StateError};

macro_rules! impl_mutable_scalar {
    ($($ty:ty),+ $(,)?) => {$(
        impl Mutable for $ty {
            fn value_to_json(&self) -> Result<Vec<u8>, StateError> {
                Ok(serde_json::to_vec(self)?)
            }

            fn value_from_json(&mut self, bytes: &[u8]) -> Result<(), StateError> {
                let next: $ty = serde_json::from_slice(bytes)?;
                if *self == next {
                    return Err(StateError::NoChange);
                }
                *self = next;
                Ok(())
            }

            fn field_mut(&mut self, _name: &str) -> Result<&mut dyn Mutable, StateError> {
                Err(StateError::NotFound)
            }
        }
    )+};
}

impl_mutable_scalar!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut value = 7u32;
        assert_eq!(value.value_to_json().unwrap(), b"7");

        value.value_from_json(b"9").unwrap();
        assert_eq!(value, 9);
    }

    #[test]
    fn equal_decode_is_no_change() {
        let mut value = "hi".to_string();
        let err = value.value_from_json(b"\"hi\"").unwrap_err();
        assert!(err.is_no_change());
        assert_eq!(value, "hi");
    }

    #[test]
    fn bad_json_leaves_the_value_alone() {
        let mut value = true;
        assert!(matches!(
            value.value_from_json(b"not json"),
            Err(StateError::Json(_))
        ));
        assert!(value);
    }

    #[test]
    fn scalars_are_leaves() {
        let mut value = 1.5f64;
        assert!(matches!(
            value.field_mut("x"),
            Err(StateError::NotFound)
        ));
    }
}
