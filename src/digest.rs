//! Content digests and root-key derivation
//!
//! Digests are `algorithm:encoded` strings, e.g. `sha256:9f86d0...`.
//! Root keys (keys without dependencies) get an identifier that depends
//! only on the operation digest and the output index.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Prefix marking digests that are intentionally non-deterministic
pub const RANDOM_PREFIX: &str = "random:";

/// Index of an operation input or output slot
pub type Index = usize;

/// Content hash of an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wrap an existing `algorithm:encoded` string
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// SHA256 digest of raw bytes
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Algorithm part (`sha256`, `random`, ...), empty if there is none
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(alg, _)| alg).unwrap_or("")
    }

    /// Encoded part after the algorithm separator
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, enc)| enc).unwrap_or(&self.0)
    }

    /// Whether the digest was tagged as non-deterministic
    pub fn is_random(&self) -> bool {
        self.0.starts_with(RANDOM_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Digest {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of the root key for `(digest, output)`
///
/// `random:` digests pass through unchanged; everything else hashes
/// `"<digest>@<output>"`.
pub fn root_key(digest: &Digest, output: Index) -> Digest {
    if digest.is_random() {
        return Digest(format!("{}{}", RANDOM_PREFIX, digest.encoded()));
    }
    Digest::from_bytes(format!("{}@{}", digest, output))
}
