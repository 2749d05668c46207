//! Collection-prefixed document keys.
//!
//! Every key stored by the engine carries its collection id as an unsigned
//! LEB128 prefix, so the raw bytes on disk and in the checkpoint indexes are
//! self-describing. The prefix is validated on construction; code reading
//! keys back from disk surfaces a decode failure as `Status::Corruption`.

use std::fmt;

use crate::constants::{DEFAULT_COLLECTION, SYSTEM_COLLECTION};
use crate::leb128;

/// Identifier of a collection within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CollectionId(pub u32);

impl CollectionId {
    /// The default collection.
    pub const DEFAULT: CollectionId = CollectionId(DEFAULT_COLLECTION);

    /// The system-event collection.
    pub const SYSTEM: CollectionId = CollectionId(SYSTEM_COLLECTION);

    /// Check whether this is the system-event collection.
    pub const fn is_system(&self) -> bool {
        self.0 == SYSTEM_COLLECTION
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{:#x}", self.0)
    }
}

/// A document key: LEB128 collection prefix followed by the logical key.
///
/// Ordering and hashing operate on the full encoded byte sequence, so keys
/// from different collections never collide in the checkpoint dedup indexes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey {
    bytes: Vec<u8>,
}

impl DocKey {
    /// Build a key from a collection id and the logical key bytes.
    pub fn new(cid: CollectionId, logical: &[u8]) -> Self {
        let mut bytes = leb128::encode_u32(cid.0);
        bytes.extend_from_slice(logical);
        Self { bytes }
    }

    /// Build a key in the default collection.
    pub fn from_logical(logical: &[u8]) -> Self {
        Self::new(CollectionId::DEFAULT, logical)
    }

    /// Interpret raw encoded bytes as a key, validating the prefix.
    pub fn from_encoded(bytes: Vec<u8>) -> Result<Self, crate::leb128::Leb128Error> {
        leb128::decode_u32(&bytes)?;
        Ok(Self { bytes })
    }

    /// The full encoded byte sequence (prefix + logical key).
    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    /// The collection this key belongs to.
    pub fn collection_id(&self) -> CollectionId {
        // The prefix was validated at construction.
        let (cid, _) = leb128::decode_u32(&self.bytes).unwrap_or((DEFAULT_COLLECTION, &[]));
        CollectionId(cid)
    }

    /// The logical key bytes without the collection prefix.
    pub fn logical_key(&self) -> &[u8] {
        match leb128::decode_u32(&self.bytes) {
            Ok((_, rest)) => {
                let prefix_len = self.bytes.len() - rest.len();
                &self.bytes[prefix_len..]
            }
            Err(_) => &self.bytes,
        }
    }

    /// Check whether the key lives in the system-event collection.
    pub fn is_in_system_collection(&self) -> bool {
        self.collection_id().is_system()
    }

    /// Total size in bytes of the encoded key.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection_id(), String::from_utf8_lossy(self.logical_key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_collection_key() {
        let key = DocKey::from_logical(b"beer");
        assert_eq!(key.collection_id(), CollectionId::DEFAULT);
        assert_eq!(key.logical_key(), b"beer");
        // One prefix byte for collection 0.
        assert_eq!(key.size(), 5);
    }

    #[test]
    fn test_wide_collection_prefix() {
        let key = DocKey::new(CollectionId(0x1234_5678), b"k");
        assert_eq!(key.collection_id(), CollectionId(0x1234_5678));
        assert_eq!(key.logical_key(), b"k");
        assert!(key.size() > 2);
    }

    #[test]
    fn test_system_collection() {
        let key = DocKey::new(CollectionId::SYSTEM, b"_collection");
        assert!(key.is_in_system_collection());
        assert!(!DocKey::from_logical(b"x").is_in_system_collection());
    }

    #[test]
    fn test_from_encoded_round_trip() {
        let key = DocKey::new(CollectionId(99), b"doc-1");
        let rebuilt = DocKey::from_encoded(key.encoded().to_vec()).unwrap();
        assert_eq!(rebuilt, key);
        assert_eq!(rebuilt.collection_id(), CollectionId(99));
    }

    #[test]
    fn test_from_encoded_rejects_bad_prefix() {
        // Continuation bytes with no stop byte.
        assert!(DocKey::from_encoded(vec![0x80, 0x80, 0x80, 0x80, 0x80, 0x80]).is_err());
        assert!(DocKey::from_encoded(Vec::new()).is_err());
    }

    #[test]
    fn test_keys_in_distinct_collections_differ() {
        let a = DocKey::new(CollectionId(0), b"same");
        let b = DocKey::new(CollectionId(8), b"same");
        assert_ne!(a, b);
        assert_eq!(a.logical_key(), b.logical_key());
    }
}
