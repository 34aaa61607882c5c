//! Stable content hashing

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Incremental SHA-256 hasher with length-prefixed fields.
///
/// Every field is prefixed with its length so that adjacent fields cannot be
/// re-split into a different sequence with the same bytes.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHasher").finish_non_exhaustive()
    }
}

impl ContentHasher {
    /// Create a new hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one field
    pub fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    /// Append a labelled field
    pub fn labelled(&mut self, label: &str, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.field(label).field(bytes)
    }

    /// Finish and return the lowercase hex digest
    pub fn finish(self) -> String {
        format!("{:x}", self.inner.finalize())
    }

    /// Hash a single blob of content
    pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        format!("{:x}", hasher.finalize())
    }

    /// Hash a set of (path, content hash) pairs.
    ///
    /// The map is ordered, so the result does not depend on the order in which
    /// entries were discovered.
    pub fn hash_entries(entries: &BTreeMap<String, String>) -> String {
        let mut hasher = Self::new();
        hasher.field((entries.len() as u64).to_le_bytes());
        for (path, hash) in entries {
            hasher.field(path).field(hash);
        }
        hasher.finish()
    }
}
