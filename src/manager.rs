//! Cache manager
//!
//! Answers "has an equivalent result already been built?" for cache keys and
//! records new results so later builds can reuse them.
//!
//! # Identity
//!
//! A root key is identified by `root_key(digest, output)`. Any other key is
//! identified through storage: a parent identifier, followed along a link
//! labeled with the key's input slot, output, digest and selector, leads to
//! the child identifier. A key whose parents reach a common identifier in
//! every input slot takes that identifier; otherwise it gets a fresh one,
//! which is only linked into storage when a result is saved under it.
//! Identifiers are memoized on the key, per manager.
//!
//! # Locking
//!
//! | Operation | Manager lock |
//! |-----------|--------------|
//! | query, records, load, load_with_parents | read |
//! | save, release_unreferenced | write |
//!
//! Identifier resolution takes only the lock of the key being resolved.

use crate::config::Config;
use crate::digest::{root_key, Digest, Index};
use crate::error::{KeygraphError, KeygraphResult};
use crate::identity::{IdGenerator, RandomIds};
use crate::key::{CacheInfoLink, CacheKey, CacheKeyWithSelector, ManagerToken};
use crate::record::{CacheRecord, CacheResult, ExportableCacheKey, Exporter, LoadedResult};
use crate::storage::{
    KeyStorage, MemoryKeyStorage, MemoryResultStorage, ResultStorage, SharedArtifact,
};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

/// Orchestrates key storage and result storage for one cache
pub struct CacheManager {
    id: String,
    token: ManagerToken,
    keys: Arc<dyn KeyStorage>,
    results: Arc<dyn ResultStorage>,
    generator: Arc<dyn IdGenerator>,
    lock: RwLock<()>,
}

impl CacheManager {
    /// Create a manager and drop stale result associations
    ///
    /// A failing cleanup is logged; the manager is usable either way.
    pub async fn new(
        id: impl Into<String>,
        keys: Arc<dyn KeyStorage>,
        results: Arc<dyn ResultStorage>,
    ) -> Self {
        Self::with_generator(id, keys, results, Arc::new(RandomIds)).await
    }

    /// Like [`CacheManager::new`] with a custom identifier source
    pub async fn with_generator(
        id: impl Into<String>,
        keys: Arc<dyn KeyStorage>,
        results: Arc<dyn ResultStorage>,
        generator: Arc<dyn IdGenerator>,
    ) -> Self {
        let manager = Self::unchecked(id.into(), keys, results, generator);
        manager.startup_cleanup().await;
        manager
    }

    /// Create a manager from configuration
    pub async fn from_config(
        config: &Config,
        keys: Arc<dyn KeyStorage>,
        results: Arc<dyn ResultStorage>,
    ) -> Self {
        let generator: Arc<dyn IdGenerator> = Arc::new(RandomIds);
        let id = config
            .manager
            .id
            .clone()
            .unwrap_or_else(|| generator.new_id());
        let manager = Self::unchecked(id, keys, results, generator);
        if config.manager.release_unreferenced_on_start {
            manager.startup_cleanup().await;
        } else {
            debug!("Skipping startup cleanup for cache manager {}", manager.id);
        }
        manager
    }

    /// Manager over fresh in-memory stores with a random ID
    pub async fn in_memory() -> Self {
        Self::new(
            RandomIds.new_id(),
            Arc::new(MemoryKeyStorage::new()),
            Arc::new(MemoryResultStorage::new()),
        )
        .await
    }

    fn unchecked(
        id: String,
        keys: Arc<dyn KeyStorage>,
        results: Arc<dyn ResultStorage>,
        generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            id,
            token: ManagerToken::new(),
            keys,
            results,
            generator,
            lock: RwLock::new(()),
        }
    }

    async fn startup_cleanup(&self) {
        if let Err(e) = self.release_unreferenced().await {
            error!(
                "Failed to release unreferenced cache metadata for {}: {}",
                self.id, e
            );
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drop result associations whose artifacts no longer exist
    ///
    /// Returns the number of released associations.
    pub async fn release_unreferenced(&self) -> KeygraphResult<usize> {
        let _guard = self.lock.write().await;

        let mut visited = HashSet::new();
        let mut released = 0;
        for id in self.keys.walk().await? {
            for result in self.keys.walk_results(&id).await? {
                if !visited.insert(result.id.clone()) {
                    continue;
                }
                if self.results.exists(&result.id).await {
                    continue;
                }
                match self.keys.release(&result.id).await {
                    Ok(()) => released += 1,
                    Err(e) => warn!("Failed to release result {}: {}", result.id, e),
                }
            }
        }

        info!(
            "Cache manager {} released {} unreferenced results",
            self.id, released
        );
        Ok(released)
    }

    /// Find the keys derived from one input slot's alternative dependencies
    ///
    /// Every dependency is an equivalent provider for `input`. Identifiers
    /// found through any of them get linked from all of them. With no
    /// dependencies this looks up the root key of `(digest, output)`. An
    /// empty result is a cache miss.
    pub async fn query(
        &self,
        deps: &[CacheKeyWithSelector],
        input: Index,
        digest: &Digest,
        output: Index,
    ) -> KeygraphResult<Vec<Arc<CacheKey>>> {
        let outcome = {
            let _guard = self.lock.read().await;
            self.query_locked(deps, input, digest, output).await
        };

        let deps_desc: Vec<String> = deps.iter().map(CacheKeyWithSelector::describe).collect();
        match &outcome {
            Ok(keys) => trace!(
                "query {}#{} input {} deps [{}] on {}: {} keys",
                digest,
                output,
                input,
                deps_desc.join(", "),
                self.id,
                keys.len()
            ),
            Err(e) => debug!(
                "query {}#{} input {} deps [{}] on {} failed: {}",
                digest,
                output,
                input,
                deps_desc.join(", "),
                self.id,
                e
            ),
        }
        outcome
    }

    async fn query_locked(
        &self,
        deps: &[CacheKeyWithSelector],
        input: Index,
        digest: &Digest,
        output: Index,
    ) -> KeygraphResult<Vec<Arc<CacheKey>>> {
        if deps.is_empty() {
            let root = root_key(digest, output);
            if !self.keys.exists(root.as_str()).await {
                return Ok(Vec::new());
            }
            return Ok(vec![self.new_key_with_id(
                root.to_string(),
                digest.clone(),
                output,
            )]);
        }

        let mut found: BTreeMap<String, Arc<CacheKey>> = BTreeMap::new();
        let mut walked = Vec::with_capacity(deps.len());
        for dep in deps {
            let dep_id = self.resolve(&dep.key).await;
            let link = CacheInfoLink::new(input, output, digest.clone(), dep.selector.clone());
            let targets: HashSet<String> = self
                .keys
                .walk_links(&dep_id, &link)
                .await?
                .into_iter()
                .collect();
            for target in &targets {
                found.entry(target.clone()).or_insert_with(|| {
                    self.new_key_with_id(target.clone(), digest.clone(), output)
                });
            }
            walked.push((dep_id, link, targets));
        }

        for target in found.keys() {
            for (dep_id, link, targets) in &walked {
                if !targets.contains(target) {
                    self.keys.add_link(dep_id, link, target).await?;
                }
            }
        }

        Ok(found.into_values().collect())
    }

    /// Results stored under a key whose artifacts still exist
    ///
    /// Associations whose artifact is gone are released on the way.
    pub async fn records(&self, key: &Arc<CacheKey>) -> KeygraphResult<Vec<CacheRecord>> {
        let outcome = {
            let _guard = self.lock.read().await;
            self.records_locked(key).await
        };

        match &outcome {
            Ok(records) => trace!(
                "records for {} on {}: {}",
                key.describe(),
                self.id,
                records.len()
            ),
            Err(e) => debug!("records for {} on {} failed: {}", key.describe(), self.id, e),
        }
        outcome
    }

    async fn records_locked(&self, key: &Arc<CacheKey>) -> KeygraphResult<Vec<CacheRecord>> {
        let id = self.resolve(key).await;
        let mut records = Vec::new();
        for result in self.keys.walk_results(&id).await? {
            if self.results.exists(&result.id).await {
                records.push(CacheRecord::new(&result, key.clone(), &self.id, self.token));
            } else {
                debug!("Result {} for {} is gone, releasing", result.id, id);
                if let Err(e) = self.keys.release(&result.id).await {
                    warn!("Failed to release result {}: {}", result.id, e);
                }
            }
        }
        Ok(records)
    }

    /// Materialize the artifact behind a record
    pub async fn load(&self, record: &CacheRecord) -> KeygraphResult<SharedArtifact> {
        let outcome = {
            let _guard = self.lock.read().await;
            self.load_unlocked(record).await
        };

        match &outcome {
            Ok(artifact) => trace!("load {} on {}: {}", record.describe(), self.id, artifact.id()),
            Err(e) => debug!("load {} on {} failed: {}", record.describe(), self.id, e),
        }
        outcome
    }

    async fn load_unlocked(&self, record: &CacheRecord) -> KeygraphResult<SharedArtifact> {
        self.check_owner(record)?;
        let id = self.resolve(record.key()).await;
        let result = self.keys.load(&id, &record.id).await?;
        self.results.load(&result).await
    }

    /// Load a record's artifact along with the artifacts of its ancestors
    ///
    /// Without bulk loading support in result storage this is a plain
    /// [`CacheManager::load`]. Artifacts that are not returned are released,
    /// including on error.
    pub async fn load_with_parents(
        &self,
        record: &CacheRecord,
    ) -> KeygraphResult<Vec<LoadedResult>> {
        let outcome = {
            let _guard = self.lock.read().await;
            self.load_with_parents_locked(record).await
        };

        match &outcome {
            Ok(results) => trace!(
                "load_with_parents {} on {}: [{}]",
                record.describe(),
                self.id,
                results
                    .iter()
                    .map(LoadedResult::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Err(e) => debug!(
                "load_with_parents {} on {} failed: {}",
                record.describe(),
                self.id,
                e
            ),
        }
        outcome
    }

    async fn load_with_parents_locked(
        &self,
        record: &CacheRecord,
    ) -> KeygraphResult<Vec<LoadedResult>> {
        let Some(loader) = self.results.parent_loader() else {
            let artifact = self.load_unlocked(record).await?;
            return Ok(vec![LoadedResult {
                result: artifact,
                cache_result: CacheResult::new(record.id.clone(), record.created_at),
                cache_key: record.key().clone(),
            }]);
        };

        self.check_owner(record)?;
        let id = self.resolve(record.key()).await;
        let result = self.keys.load(&id, &record.id).await?;
        let mut loaded = loader.load_with_parents(&result).await?;

        let mut visited = HashSet::new();
        let filtered = self
            .filter_results(&mut loaded, record.key(), &mut visited)
            .await;

        // Matched artifacts were taken out of `loaded`
        release_all(loaded.into_values()).await;

        filtered
    }

    /// Pair bulk-loaded artifacts with the results stored under `key` and
    /// its ancestors, each identifier visited once
    fn filter_results<'a>(
        &'a self,
        loaded: &'a mut HashMap<String, SharedArtifact>,
        key: &'a Arc<CacheKey>,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, KeygraphResult<Vec<LoadedResult>>> {
        async move {
            let id = self.resolve(key).await;
            if !visited.insert(id.clone()) {
                return Ok(Vec::new());
            }

            let mut results = Vec::new();
            for stored in self.keys.walk_results(&id).await? {
                if let Some(artifact) = loaded.remove(&id) {
                    results.push(LoadedResult {
                        result: artifact,
                        cache_result: stored,
                        cache_key: key.clone(),
                    });
                }
            }

            for group in key.deps() {
                for dep in group {
                    match self.filter_results(loaded, &dep.key, visited).await {
                        Ok(parents) => results.extend(parents),
                        Err(e) => {
                            release_all(results.into_iter().map(|r| r.result)).await;
                            return Err(e);
                        }
                    }
                }
            }
            Ok(results)
        }
        .boxed()
    }

    /// Store an artifact as a result of `key`
    ///
    /// The artifact is saved first; if recording it under the key fails, it
    /// stays in result storage unreferenced until the next cleanup.
    pub async fn save(
        &self,
        key: &Arc<CacheKey>,
        artifact: SharedArtifact,
        created_at: DateTime<Utc>,
    ) -> KeygraphResult<ExportableCacheKey> {
        let artifact_id = artifact.id().to_string();
        let outcome = {
            let _guard = self.lock.write().await;
            self.save_locked(key, artifact, created_at).await
        };

        match &outcome {
            Ok(saved) => debug!(
                "Saved result {} (artifact {}) under {} on {}",
                saved.exporter.record().id,
                artifact_id,
                key.describe(),
                self.id
            ),
            Err(e) => debug!(
                "save of artifact {} under {} on {} failed: {}",
                artifact_id,
                key.describe(),
                self.id,
                e
            ),
        }
        outcome
    }

    async fn save_locked(
        &self,
        key: &Arc<CacheKey>,
        artifact: SharedArtifact,
        created_at: DateTime<Utc>,
    ) -> KeygraphResult<ExportableCacheKey> {
        let result = self.results.save(artifact, created_at).await?;
        let id = self.resolve(key).await;
        self.keys.add_result(&id, result.clone()).await?;
        self.ensure_persistent_key(key).await?;

        let record = CacheRecord::new(&result, key.clone(), &self.id, self.token);
        Ok(ExportableCacheKey {
            key: key.clone(),
            exporter: Exporter::new(key.clone(), record),
        })
    }

    /// Key with a known identifier for this manager and no dependency graph
    pub(crate) fn new_key_with_id(
        &self,
        id: String,
        digest: Digest,
        output: Index,
    ) -> Arc<CacheKey> {
        CacheKey::with_id(id, digest, output, self.token)
    }

    /// Root key for `(digest, output)`, resolved for this manager
    pub fn new_root_key(&self, digest: Digest, output: Index) -> Arc<CacheKey> {
        let id = root_key(&digest, output).to_string();
        self.new_key_with_id(id, digest, output)
    }

    /// Identifier of `key` in this manager's storage, computed once per key
    pub fn resolve<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, String> {
        async move {
            let mut ids = key.ids().lock().await;
            if let Some(id) = ids.get(&self.token) {
                return id.clone();
            }
            let id = if key.is_root() {
                key.id().to_string()
            } else {
                self.derive_id(key).await
            };
            ids.insert(self.token, id.clone());
            id
        }
        .boxed()
    }

    /// Identifier reached from the key's parents in every input slot, or a
    /// new one
    ///
    /// Within a slot the targets of all alternative parents are unioned;
    /// across slots they are intersected. Empty groups after the first add
    /// no constraint. A failing link lookup drops all candidates.
    async fn derive_id(&self, key: &CacheKey) -> String {
        let mut matches: Option<HashSet<String>> = None;

        for (input, group) in key.deps().iter().enumerate() {
            // Slot 0 seeds the candidates even when it has no parents
            if group.is_empty() && input > 0 {
                continue;
            }
            let mut reached = HashSet::new();
            for dep in group {
                let parent = self.resolve(&dep.key).await;
                let link = CacheInfoLink::new(
                    input,
                    key.output(),
                    key.digest().clone(),
                    dep.selector.clone(),
                );
                match self.keys.walk_links(&parent, &link).await {
                    Ok(targets) => reached.extend(targets),
                    Err(e) => {
                        debug!("Link lookup from {} failed, minting new key: {}", parent, e);
                        return self.generator.new_id();
                    }
                }
            }

            let narrowed: HashSet<String> = match matches.take() {
                None => reached,
                Some(previous) => previous.intersection(&reached).cloned().collect(),
            };
            if narrowed.is_empty() {
                return self.generator.new_id();
            }
            matches = Some(narrowed);
        }

        matches
            .and_then(|m| m.into_iter().min())
            .unwrap_or_else(|| self.generator.new_id())
    }

    /// Make sure every derivation edge of `key`'s graph is stored as a link,
    /// parents before children
    pub(crate) fn ensure_persistent_key<'a>(
        &'a self,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, KeygraphResult<()>> {
        async move {
            let id = self.resolve(key).await;
            for (input, group) in key.deps().iter().enumerate() {
                for dep in group {
                    let link = CacheInfoLink::new(
                        input,
                        key.output(),
                        key.digest().clone(),
                        dep.selector.clone(),
                    );
                    let parent = self.resolve(&dep.key).await;
                    if !self.keys.has_link(&parent, &link, &id).await {
                        self.ensure_persistent_key(&dep.key).await?;
                        self.keys.add_link(&parent, &link, &id).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn check_owner(&self, record: &CacheRecord) -> KeygraphResult<()> {
        if record.token() != self.token {
            return Err(KeygraphError::ForeignRecord {
                record: record.id.clone(),
                manager: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// Release artifact handles that will not reach the caller
async fn release_all(artifacts: impl IntoIterator<Item = SharedArtifact>) {
    for artifact in artifacts {
        if let Err(e) = artifact.release().await {
            warn!("Failed to release artifact {}: {}", artifact.id(), e);
        }
    }
}
