//! keygraph - cache-key graph engine for content-addressable build caches
//!
//! Decides whether a build step, identified by its operation digest and the
//! cache keys of its inputs, already has a stored result, and records new
//! results so later builds with the same inputs can reuse them.

pub mod config;
pub mod digest;
pub mod error;
pub mod identity;
pub mod key;
pub mod logging;
pub mod manager;
pub mod record;
pub mod storage;

pub use digest::{root_key, Digest, Index};
pub use error::{KeygraphError, KeygraphResult};
pub use key::{CacheInfoLink, CacheKey, CacheKeyWithSelector};
pub use manager::CacheManager;
pub use record::{CacheRecord, CacheResult, ExportableCacheKey, Exporter, LoadedResult};
pub use storage::{Artifact, KeyStorage, ParentLoader, ResultStorage, SharedArtifact};
