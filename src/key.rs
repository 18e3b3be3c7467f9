//! Cache keys and the links between them
//!
//! A [`CacheKey`] is a node in a derivation graph: an operation digest, the
//! output slot it names and, per input slot, a group of alternative parent
//! keys with the selector used to consume them. Only root keys (no
//! dependencies) carry an intrinsic identifier; every other key gets its
//! identifier from a [`CacheManager`](crate::manager::CacheManager), which
//! memoizes it on the key per manager.

use crate::digest::{root_key, Digest, Index};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Identity of one manager instance, used to scope memoized key identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ManagerToken(Uuid);

impl ManagerToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Label of a stored edge between two key identifiers
///
/// A link `parent --label--> child` records that using `parent` as input
/// `input` (through `selector`) of the operation `digest` yields output
/// `output`, identified by `child`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheInfoLink {
    pub input: Index,
    pub output: Index,
    pub digest: Digest,
    pub selector: String,
}

impl CacheInfoLink {
    pub fn new(input: Index, output: Index, digest: Digest, selector: impl Into<String>) -> Self {
        Self {
            input,
            output,
            digest,
            selector: selector.into(),
        }
    }
}

/// A parent key together with the selector used to consume it
#[derive(Debug, Clone)]
pub struct CacheKeyWithSelector {
    pub key: Arc<CacheKey>,
    pub selector: String,
}

impl CacheKeyWithSelector {
    pub fn new(key: Arc<CacheKey>, selector: impl Into<String>) -> Self {
        Self {
            key,
            selector: selector.into(),
        }
    }

    /// Compact description for log events
    pub fn describe(&self) -> String {
        if self.selector.is_empty() {
            self.key.describe()
        } else {
            format!("{}[{}]", self.key.describe(), self.selector)
        }
    }
}

/// One node of a derivation graph
pub struct CacheKey {
    id: String,
    digest: Digest,
    output: Index,
    deps: Vec<Vec<CacheKeyWithSelector>>,
    ids: Mutex<HashMap<ManagerToken, String>>,
}

impl CacheKey {
    /// Create a key; `deps[i]` holds the alternative parents for input `i`
    pub fn new(digest: Digest, output: Index, deps: Vec<Vec<CacheKeyWithSelector>>) -> Arc<Self> {
        Arc::new(Self {
            id: root_key(&digest, output).to_string(),
            digest,
            output,
            deps,
            ids: Mutex::new(HashMap::new()),
        })
    }

    /// Create a key without dependencies
    pub fn root(digest: Digest, output: Index) -> Arc<Self> {
        Self::new(digest, output, Vec::new())
    }

    /// Key that already has a known identifier for one manager
    pub(crate) fn with_id(
        id: String,
        digest: Digest,
        output: Index,
        token: ManagerToken,
    ) -> Arc<Self> {
        let mut ids = HashMap::new();
        ids.insert(token, id.clone());
        Arc::new(Self {
            id,
            digest,
            output,
            deps: Vec::new(),
            ids: Mutex::new(ids),
        })
    }

    /// Intrinsic identifier; only meaningful for root keys
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn output(&self) -> Index {
        self.output
    }

    pub fn deps(&self) -> &[Vec<CacheKeyWithSelector>] {
        &self.deps
    }

    pub fn is_root(&self) -> bool {
        self.deps.is_empty()
    }

    /// Per-manager identifier cache, locked while an identifier is resolved
    pub(crate) fn ids(&self) -> &Mutex<HashMap<ManagerToken, String>> {
        &self.ids
    }

    /// Compact description for log events
    pub fn describe(&self) -> String {
        let mut out = format!("{}#{}", self.digest, self.output);
        if !self.deps.is_empty() {
            let groups: Vec<String> = self
                .deps
                .iter()
                .map(|group| {
                    group
                        .iter()
                        .map(CacheKeyWithSelector::describe)
                        .collect::<Vec<_>>()
                        .join("|")
                })
                .collect();
            out.push_str(&format!("({})", groups.join(", ")));
        }
        out
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("id", &self.id)
            .field("digest", &self.digest)
            .field("output", &self.output)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}
