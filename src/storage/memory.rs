//! In-memory storage collaborators
//!
//! Nothing survives the process. Useful for single-build caches and tests.

use super::{Artifact, KeyStorage, ResultStorage, SharedArtifact};
use crate::error::{KeygraphError, KeygraphResult};
use crate::key::CacheInfoLink;
use crate::record::CacheResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
struct KeyItem {
    results: HashMap<String, CacheResult>,
    links: HashMap<CacheInfoLink, HashSet<String>>,
    backlinks: HashSet<String>,
}

impl KeyItem {
    fn is_empty(&self) -> bool {
        self.results.is_empty() && self.links.values().all(HashSet::is_empty)
    }
}

#[derive(Debug, Default)]
struct KeyGraph {
    by_id: HashMap<String, KeyItem>,
    by_result: HashMap<String, HashSet<String>>,
}

impl KeyGraph {
    /// Remove `id` if it holds nothing, then retry on each parent that
    /// linked to it
    fn prune(&mut self, id: &str) {
        let Some(item) = self.by_id.get(id) else {
            return;
        };
        if !item.is_empty() {
            return;
        }
        let Some(item) = self.by_id.remove(id) else {
            return;
        };
        trace!("Pruned empty cache key {}", id);

        for parent in item.backlinks {
            if let Some(parent_item) = self.by_id.get_mut(&parent) {
                for targets in parent_item.links.values_mut() {
                    targets.remove(id);
                }
                parent_item.links.retain(|_, targets| !targets.is_empty());
            }
            self.prune(&parent);
        }
    }
}

/// Key/link storage held in process memory
#[derive(Debug, Default)]
pub struct MemoryKeyStorage {
    graph: Mutex<KeyGraph>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStorage for MemoryKeyStorage {
    async fn exists(&self, id: &str) -> bool {
        self.graph.lock().await.by_id.contains_key(id)
    }

    async fn walk(&self) -> KeygraphResult<Vec<String>> {
        let graph = self.graph.lock().await;
        Ok(graph.by_id.keys().cloned().collect())
    }

    async fn walk_results(&self, id: &str) -> KeygraphResult<Vec<CacheResult>> {
        let graph = self.graph.lock().await;
        Ok(graph
            .by_id
            .get(id)
            .map(|item| item.results.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn walk_links(&self, id: &str, link: &CacheInfoLink) -> KeygraphResult<Vec<String>> {
        let graph = self.graph.lock().await;
        Ok(graph
            .by_id
            .get(id)
            .and_then(|item| item.links.get(link))
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> KeygraphResult<()> {
        let mut graph = self.graph.lock().await;
        graph
            .by_id
            .entry(id.to_string())
            .or_default()
            .links
            .entry(link.clone())
            .or_default()
            .insert(target.to_string());
        graph
            .by_id
            .entry(target.to_string())
            .or_default()
            .backlinks
            .insert(id.to_string());
        Ok(())
    }

    async fn has_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> bool {
        let graph = self.graph.lock().await;
        graph
            .by_id
            .get(id)
            .and_then(|item| item.links.get(link))
            .is_some_and(|targets| targets.contains(target))
    }

    async fn add_result(&self, id: &str, result: CacheResult) -> KeygraphResult<()> {
        let mut graph = self.graph.lock().await;
        graph
            .by_result
            .entry(result.id.clone())
            .or_default()
            .insert(id.to_string());
        graph
            .by_id
            .entry(id.to_string())
            .or_default()
            .results
            .insert(result.id.clone(), result);
        Ok(())
    }

    async fn load(&self, id: &str, result_id: &str) -> KeygraphResult<CacheResult> {
        let graph = self.graph.lock().await;
        let item = graph
            .by_id
            .get(id)
            .ok_or_else(|| KeygraphError::KeyNotFound(id.to_string()))?;
        item.results
            .get(result_id)
            .cloned()
            .ok_or_else(|| KeygraphError::ResultNotFound {
                key: id.to_string(),
                result: result_id.to_string(),
            })
    }

    async fn release(&self, result_id: &str) -> KeygraphResult<()> {
        let mut graph = self.graph.lock().await;
        let Some(ids) = graph.by_result.remove(result_id) else {
            return Ok(());
        };
        for id in ids {
            if let Some(item) = graph.by_id.get_mut(&id) {
                item.results.remove(result_id);
            }
            graph.prune(&id);
        }
        Ok(())
    }
}

/// Result storage held in process memory
#[derive(Debug, Default)]
pub struct MemoryResultStorage {
    artifacts: Mutex<HashMap<String, SharedArtifact>>,
}

impl MemoryResultStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete an artifact behind the key store's back
    ///
    /// Associations pointing at it become stale until the next
    /// `records` or `release_unreferenced` pass.
    pub async fn remove(&self, id: &str) -> Option<SharedArtifact> {
        self.artifacts.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.artifacts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.lock().await.is_empty()
    }
}

#[async_trait]
impl ResultStorage for MemoryResultStorage {
    async fn exists(&self, id: &str) -> bool {
        self.artifacts.lock().await.contains_key(id)
    }

    async fn save(
        &self,
        artifact: SharedArtifact,
        created_at: DateTime<Utc>,
    ) -> KeygraphResult<CacheResult> {
        let id = artifact.id().to_string();
        self.artifacts.lock().await.insert(id.clone(), artifact);
        Ok(CacheResult::new(id, created_at))
    }

    async fn load(&self, result: &CacheResult) -> KeygraphResult<SharedArtifact> {
        self.artifacts
            .lock()
            .await
            .get(&result.id)
            .cloned()
            .ok_or_else(|| KeygraphError::ArtifactNotFound(result.id.clone()))
    }
}

/// Artifact holding its content in memory and counting releases
#[derive(Debug)]
pub struct MemoryArtifact {
    id: String,
    data: Vec<u8>,
    releases: AtomicUsize,
}

impl MemoryArtifact {
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            data: data.into(),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of times a handle to this artifact was released
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Artifact for MemoryArtifact {
    fn id(&self) -> &str {
        &self.id
    }

    async fn release(&self) -> KeygraphResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
