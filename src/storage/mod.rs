//! Storage collaborators used by the cache manager
//!
//! Two stores back a manager:
//! - [`KeyStorage`]: key identifiers, labeled links between them and the
//!   results recorded under each identifier
//! - [`ResultStorage`]: the artifacts those results refer to
//!
//! Both are external; [`memory`] provides in-process implementations.

pub mod memory;

pub use memory::{MemoryArtifact, MemoryKeyStorage, MemoryResultStorage};

use crate::error::KeygraphResult;
use crate::key::CacheInfoLink;
use crate::record::CacheResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A materialized build artifact handed out by result storage
///
/// The receiver owns the handle and must call [`Artifact::release`] when
/// it is no longer needed.
#[async_trait]
pub trait Artifact: Send + Sync + fmt::Debug {
    /// Identifier of the artifact in result storage
    fn id(&self) -> &str;

    /// Give up this handle
    async fn release(&self) -> KeygraphResult<()>;
}

/// Shared artifact handle
pub type SharedArtifact = Arc<dyn Artifact>;

/// Durable store of key identifiers, links and result associations
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Whether the identifier is known
    async fn exists(&self, id: &str) -> bool;

    /// All known identifiers
    async fn walk(&self) -> KeygraphResult<Vec<String>>;

    /// Results recorded under an identifier
    async fn walk_results(&self, id: &str) -> KeygraphResult<Vec<CacheResult>>;

    /// Targets of the outgoing links of `id` carrying `link`
    async fn walk_links(&self, id: &str, link: &CacheInfoLink) -> KeygraphResult<Vec<String>>;

    /// Record the link `id --link--> target`
    async fn add_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> KeygraphResult<()>;

    async fn has_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> bool;

    /// Record a result under an identifier
    async fn add_result(&self, id: &str, result: CacheResult) -> KeygraphResult<()>;

    /// Fetch the result `result_id` recorded under `id`
    async fn load(&self, id: &str, result_id: &str) -> KeygraphResult<CacheResult>;

    /// Drop every association with `result_id`
    async fn release(&self, result_id: &str) -> KeygraphResult<()>;
}

/// Durable store of artifacts
#[async_trait]
pub trait ResultStorage: Send + Sync {
    async fn exists(&self, id: &str) -> bool;

    /// Persist an artifact and return the reference to it
    async fn save(
        &self,
        artifact: SharedArtifact,
        created_at: DateTime<Utc>,
    ) -> KeygraphResult<CacheResult>;

    /// Materialize the artifact behind a reference
    async fn load(&self, result: &CacheResult) -> KeygraphResult<SharedArtifact>;

    /// Bulk ancestor loading, when the store supports it
    fn parent_loader(&self) -> Option<&dyn ParentLoader> {
        None
    }
}

/// Optional result storage capability: load a result together with the
/// results of its ancestors in one pass
#[async_trait]
pub trait ParentLoader: Send + Sync {
    /// Artifacts keyed by the key identifier they were stored under
    async fn load_with_parents(
        &self,
        result: &CacheResult,
    ) -> KeygraphResult<HashMap<String, SharedArtifact>>;
}
