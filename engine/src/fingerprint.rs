//! Change-detection fingerprints for collections.
//!
//! A fingerprint is the first 8 bytes of a BLAKE3 digest of the collection's
//! compact JSON form, rendered as 16 lowercase hex digits. It is only used to
//! tell whether content changed; collisions are tolerated and it is never
//! persisted as an identity.

use crate::Collection;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Digest bytes kept in a fingerprint.
const DIGEST_BYTES: usize = 8;

/// Digest reserved for the empty collection.
///
/// Hex digests are always 16 characters, so this can never collide with one.
pub const EMPTY_FINGERPRINT: &str = "empty";

/// Digest of a collection's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The fingerprint of an empty collection.
    pub fn empty() -> Self {
        Self(EMPTY_FINGERPRINT.to_string())
    }

    /// Whether this is the empty-collection sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == EMPTY_FINGERPRINT
    }

    /// The digest text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a collection.
///
/// Equal collections (same records, same field values, same order) always
/// produce equal fingerprints. Object keys are serialized in sorted order, so
/// field insertion order does not matter; record order does.
pub fn fingerprint(collection: &Collection) -> Fingerprint {
    if collection.is_empty() {
        return Fingerprint::empty();
    }

    let mut hasher = blake3::Hasher::new();
    // Serializing JSON objects into an infallible writer cannot fail.
    if serde_json::to_writer(&mut hasher, collection).is_err() {
        tracing::warn!("collection serialization failed while fingerprinting");
    }
    let digest = hasher.finalize();
    Fingerprint(hex::encode(&digest.as_bytes()[..DIGEST_BYTES]))
}
