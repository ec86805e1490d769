use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `taskfuse` every deferred call is keyed by the hash of its own
/// descriptor. BLAKE3 is seed-free, so the controller and every worker agree
/// on the same keys without any shared hashing configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Hashes the CBOR encoding of `value`.
    pub(crate) fn hash_serialized<T: Serialize + ?Sized>(value: &T) -> Self {
        let mut hasher = blake3::Hasher::new();
        // writing into the hasher never fails
        ciborium::into_writer(value, &mut hasher).expect("descriptor is always encodable");
        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Unique identifier of an entry in a task graph.
///
/// Derived keys have the shape `<name>-<hash>`, where `name` is the operation
/// name and `hash` fingerprints the whole call descriptor. Two calls with the
/// same operation and the same arguments always get the same key, which is
/// what lets the graph share them.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Arc<str>);

impl Key {
    /// Creates a key from a caller-chosen name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Key(name.into())
    }

    /// Derives a content-addressed key from any serializable descriptor.
    pub(crate) fn derive<T: Serialize + ?Sized>(name: &str, content: &T) -> Self {
        let hash = Hash32::hash_serialized(content).to_hex();
        Key(format!("{name}-{}", &hash[..32]).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The human readable part of the key, everything before the hash.
    pub fn name(&self) -> &str {
        match self.0.rsplit_once('-') {
            Some((name, hash)) if hash.len() == 32 => name,
            _ => &self.0,
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::new(value)
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::new(value)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(Hash32::hash_serialized("abc"), Hash32::hash_serialized("abc"));
        assert_ne!(Hash32::hash_serialized("abc"), Hash32::hash_serialized("abd"));
        assert_eq!(Hash32::hash_serialized("abc").to_hex().len(), 64);
    }

    #[test]
    fn test_derived_key_shape() {
        let key = Key::derive("add", &(1, 2));
        assert!(key.as_str().starts_with("add-"));
        assert_eq!(key.name(), "add");
        assert_eq!(key, Key::derive("add", &(1, 2)));
        assert_ne!(key, Key::derive("add", &(2, 1)));
    }

    #[test]
    fn test_named_key() {
        let key = Key::new("my-result");
        assert_eq!(key.name(), "my-result");
        assert_eq!(key.to_string(), "my-result");
    }
}
