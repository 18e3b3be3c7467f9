//! Integration tests for keygraph

mod support {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use keygraph::storage::{MemoryKeyStorage, MemoryResultStorage};
    use keygraph::{
        CacheInfoLink, CacheResult, KeyStorage, KeygraphError, KeygraphResult, ParentLoader,
        ResultStorage, SharedArtifact,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Key storage that counts writes and can fail result or link walks for one id
    #[derive(Default)]
    pub struct StubKeys {
        pub inner: MemoryKeyStorage,
        pub writes: AtomicUsize,
        pub releases: AtomicUsize,
        pub fail_results_for: Mutex<Option<String>>,
        pub fail_links_for: Mutex<Option<String>>,
    }

    impl StubKeys {
        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        pub async fn fail_results_for(&self, id: &str) {
            *self.fail_results_for.lock().await = Some(id.to_string());
        }

        pub async fn fail_links_for(&self, id: &str) {
            *self.fail_links_for.lock().await = Some(id.to_string());
        }
    }

    #[async_trait]
    impl KeyStorage for StubKeys {
        async fn exists(&self, id: &str) -> bool {
            self.inner.exists(id).await
        }

        async fn walk(&self) -> KeygraphResult<Vec<String>> {
            self.inner.walk().await
        }

        async fn walk_results(&self, id: &str) -> KeygraphResult<Vec<CacheResult>> {
            if self.fail_results_for.lock().await.as_deref() == Some(id) {
                return Err(KeygraphError::backend("walk_results", "injected failure"));
            }
            self.inner.walk_results(id).await
        }

        async fn walk_links(&self, id: &str, link: &CacheInfoLink) -> KeygraphResult<Vec<String>> {
            if self.fail_links_for.lock().await.as_deref() == Some(id) {
                return Err(KeygraphError::backend("walk_links", "injected failure"));
            }
            self.inner.walk_links(id, link).await
        }

        async fn add_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> KeygraphResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.add_link(id, link, target).await
        }

        async fn has_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> bool {
            self.inner.has_link(id, link, target).await
        }

        async fn add_result(&self, id: &str, result: CacheResult) -> KeygraphResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.add_result(id, result).await
        }

        async fn load(&self, id: &str, result_id: &str) -> KeygraphResult<CacheResult> {
            self.inner.load(id, result_id).await
        }

        async fn release(&self, result_id: &str) -> KeygraphResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(result_id).await
        }
    }

    /// Result storage with bulk ancestor loading returning a preset map
    #[derive(Default)]
    pub struct BulkResults {
        pub inner: MemoryResultStorage,
        pub bulk: Mutex<HashMap<String, SharedArtifact>>,
    }

    #[async_trait]
    impl ResultStorage for BulkResults {
        async fn exists(&self, id: &str) -> bool {
            self.inner.exists(id).await
        }

        async fn save(
            &self,
            artifact: SharedArtifact,
            created_at: DateTime<Utc>,
        ) -> KeygraphResult<CacheResult> {
            self.inner.save(artifact, created_at).await
        }

        async fn load(&self, result: &CacheResult) -> KeygraphResult<SharedArtifact> {
            self.inner.load(result).await
        }

        fn parent_loader(&self) -> Option<&dyn ParentLoader> {
            Some(self)
        }
    }

    #[async_trait]
    impl ParentLoader for BulkResults {
        async fn load_with_parents(
            &self,
            _result: &CacheResult,
        ) -> KeygraphResult<HashMap<String, SharedArtifact>> {
            Ok(self.bulk.lock().await.clone())
        }
    }
}

mod end_to_end {
    use chrono::Utc;
    use keygraph::storage::{MemoryArtifact, MemoryKeyStorage, MemoryResultStorage};
    use keygraph::{CacheKey, CacheKeyWithSelector, CacheManager, Digest};
    use std::sync::Arc;

    #[tokio::test]
    async fn root_key_save_query_load() {
        let manager = CacheManager::in_memory().await;
        let digest = Digest::from_bytes(b"compile main.rs");
        let key = CacheKey::root(digest.clone(), 0);

        manager
            .save(&key, MemoryArtifact::new("artifact-1", b"object".to_vec()), Utc::now())
            .await
            .unwrap();

        let found = manager.query(&[], 0, &digest, 0).await.unwrap();
        assert_eq!(found.len(), 1);

        let records = manager.records(&found[0]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].manager_id(), manager.id());

        let artifact = manager.load(&records[0]).await.unwrap();
        assert_eq!(artifact.id(), "artifact-1");
    }

    #[tokio::test]
    async fn child_key_found_through_parent() {
        let manager = CacheManager::in_memory().await;
        let parent = CacheKey::root(Digest::from("sha256:source"), 0);
        let d2 = Digest::from("sha256:build");
        let child = CacheKey::new(
            d2.clone(),
            0,
            vec![vec![CacheKeyWithSelector::new(parent.clone(), "sel")]],
        );

        manager
            .save(&child, MemoryArtifact::new("built", b"bin".to_vec()), Utc::now())
            .await
            .unwrap();

        let found = manager
            .query(&[CacheKeyWithSelector::new(parent, "sel")], 0, &d2, 0)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            manager.resolve(&found[0]).await,
            manager.resolve(&child).await
        );

        let records = manager.records(&found[0]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "built");
    }

    #[tokio::test]
    async fn query_with_other_selector_misses() {
        let manager = CacheManager::in_memory().await;
        let parent = CacheKey::root(Digest::from("sha256:source"), 0);
        let digest = Digest::from("sha256:build");
        let child = CacheKey::new(
            digest.clone(),
            0,
            vec![vec![CacheKeyWithSelector::new(parent.clone(), "/a")]],
        );
        manager
            .save(&child, MemoryArtifact::new("built", b"bin".to_vec()), Utc::now())
            .await
            .unwrap();

        let found = manager
            .query(&[CacheKeyWithSelector::new(parent, "/b")], 0, &digest, 0)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn independent_graphs_converge() {
        let manager = CacheManager::in_memory().await;
        let build = |source: &str| {
            let a = CacheKey::root(Digest::from(source), 0);
            let b = CacheKey::root(Digest::from("sha256:toolchain"), 0);
            CacheKey::new(
                Digest::from("sha256:link"),
                0,
                vec![
                    vec![CacheKeyWithSelector::new(a, "")],
                    vec![CacheKeyWithSelector::new(b, "/bin")],
                ],
            )
        };

        let first = build("sha256:src");
        manager
            .save(&first, MemoryArtifact::new("linked", b"elf".to_vec()), Utc::now())
            .await
            .unwrap();

        let second = build("sha256:src");
        assert_eq!(
            manager.resolve(&second).await,
            manager.resolve(&first).await
        );
        assert_eq!(manager.records(&second).await.unwrap().len(), 1);

        let unrelated = build("sha256:other-src");
        assert_ne!(
            manager.resolve(&unrelated).await,
            manager.resolve(&first).await
        );
    }

    #[tokio::test]
    async fn save_exports_derivation_graph() {
        let manager = CacheManager::new(
            "exporter",
            Arc::new(MemoryKeyStorage::new()),
            Arc::new(MemoryResultStorage::new()),
        )
        .await;
        let parent = CacheKey::root(Digest::from("sha256:p"), 0);
        let child = CacheKey::new(
            Digest::from("sha256:c"),
            2,
            vec![vec![CacheKeyWithSelector::new(parent, "sel")]],
        );

        let saved = manager
            .save(&child, MemoryArtifact::new("res", b"x".to_vec()), Utc::now())
            .await
            .unwrap();

        let exported = saved.exporter.export();
        assert_eq!(exported.output, 2);
        assert_eq!(exported.result.map(|r| r.id), Some("res".to_string()));
        assert_eq!(exported.deps[0][0].selector, "sel");
        assert_eq!(saved.exporter.record().manager_id(), "exporter");
    }
}

mod persistence {
    use crate::support::StubKeys;
    use chrono::Utc;
    use keygraph::identity::SequentialIds;
    use keygraph::storage::{MemoryArtifact, MemoryResultStorage};
    use keygraph::{
        CacheInfoLink, CacheKey, CacheKeyWithSelector, CacheManager, Digest, KeyStorage,
        KeygraphError,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn resaving_linked_graph_only_adds_result() {
        let keys = Arc::new(StubKeys::default());
        let manager = CacheManager::with_generator(
            "m",
            keys.clone(),
            Arc::new(MemoryResultStorage::new()),
            Arc::new(SequentialIds::new("k")),
        )
        .await;
        let parent = CacheKey::root(Digest::from("sha256:p"), 0);
        let child = CacheKey::new(
            Digest::from("sha256:c"),
            0,
            vec![vec![CacheKeyWithSelector::new(parent, "")]],
        );

        manager
            .save(&child, MemoryArtifact::new("r1", b"1".to_vec()), Utc::now())
            .await
            .unwrap();
        // one result plus one link
        assert_eq!(keys.writes(), 2);

        manager
            .save(&child, MemoryArtifact::new("r2", b"2".to_vec()), Utc::now())
            .await
            .unwrap();
        assert_eq!(keys.writes(), 3);
        assert_eq!(manager.records(&child).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn query_links_every_alternative() {
        let keys = Arc::new(StubKeys::default());
        let manager = CacheManager::new(
            "m",
            keys.clone(),
            Arc::new(MemoryResultStorage::new()),
        )
        .await;
        let digest = Digest::from("sha256:op");
        let a = CacheKey::root(Digest::from("sha256:a"), 0);
        let b = CacheKey::root(Digest::from("sha256:b"), 0);
        let child = CacheKey::new(
            digest.clone(),
            0,
            vec![vec![CacheKeyWithSelector::new(a.clone(), "")]],
        );
        manager
            .save(&child, MemoryArtifact::new("r", b"r".to_vec()), Utc::now())
            .await
            .unwrap();

        let deps = [
            CacheKeyWithSelector::new(a, ""),
            CacheKeyWithSelector::new(b.clone(), ""),
        ];
        let found = manager.query(&deps, 0, &digest, 0).await.unwrap();
        assert_eq!(found.len(), 1);

        // b alone now reaches the same key
        let via_b = CacheKey::new(digest.clone(), 0, vec![vec![CacheKeyWithSelector::new(b, "")]]);
        assert_eq!(
            manager.resolve(&via_b).await,
            manager.resolve(&child).await
        );

        let writes = keys.writes();
        manager.query(&deps, 0, &digest, 0).await.unwrap();
        assert_eq!(keys.writes(), writes);
        assert!(keys.inner.exists(&manager.resolve(&child).await).await);
    }

    #[tokio::test]
    async fn failed_link_lookup_mints_new_key() {
        let keys = Arc::new(StubKeys::default());
        let manager = CacheManager::with_generator(
            "m",
            keys.clone(),
            Arc::new(MemoryResultStorage::new()),
            Arc::new(SequentialIds::new("fresh")),
        )
        .await;
        let digest = Digest::from("sha256:op");
        let a = CacheKey::root(Digest::from("sha256:a"), 0);
        let b = CacheKey::root(Digest::from("sha256:b"), 0);
        keys.inner
            .add_link(a.id(), &CacheInfoLink::new(0, 0, digest.clone(), ""), "existing")
            .await
            .unwrap();
        keys.inner
            .add_link(b.id(), &CacheInfoLink::new(1, 0, digest.clone(), ""), "existing")
            .await
            .unwrap();

        let healthy = CacheKey::new(
            digest.clone(),
            0,
            vec![
                vec![CacheKeyWithSelector::new(a.clone(), "")],
                vec![CacheKeyWithSelector::new(b.clone(), "")],
            ],
        );
        assert_eq!(manager.resolve(&healthy).await, "existing");

        keys.fail_links_for(b.id()).await;
        let broken = CacheKey::new(
            digest,
            0,
            vec![
                vec![CacheKeyWithSelector::new(a, "")],
                vec![CacheKeyWithSelector::new(b, "")],
            ],
        );
        assert_eq!(manager.resolve(&broken).await, "fresh-1");
    }

    #[tokio::test]
    async fn failed_query_reports_backend_error() {
        let keys = Arc::new(StubKeys::default());
        let manager = CacheManager::new("m", keys.clone(), Arc::new(MemoryResultStorage::new())).await;
        let parent = CacheKey::root(Digest::from("sha256:p"), 0);
        keys.fail_links_for(parent.id()).await;

        let err = manager
            .query(
                &[CacheKeyWithSelector::new(parent, "")],
                0,
                &Digest::from("sha256:op"),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KeygraphError::Backend { .. }));
    }
}

mod healing {
    use crate::support::StubKeys;
    use chrono::Utc;
    use keygraph::storage::{MemoryArtifact, MemoryKeyStorage, MemoryResultStorage};
    use keygraph::{CacheKey, CacheManager, Digest, KeyStorage};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[tokio::test]
    async fn records_release_missing_artifacts() {
        let keys = Arc::new(StubKeys::default());
        let results = Arc::new(MemoryResultStorage::new());
        let manager = CacheManager::new("m", keys.clone(), results.clone()).await;
        let key = CacheKey::root(Digest::from("sha256:op"), 0);

        manager
            .save(&key, MemoryArtifact::new("kept", b"1".to_vec()), Utc::now())
            .await
            .unwrap();
        manager
            .save(&key, MemoryArtifact::new("lost", b"2".to_vec()), Utc::now())
            .await
            .unwrap();
        results.remove("lost").await;

        let records = manager.records(&key).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "kept");
        assert_eq!(keys.releases.load(Ordering::SeqCst), 1);

        let stored = keys.inner.walk_results(key.id()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "kept");
    }

    #[tokio::test]
    async fn startup_releases_unreferenced_once_per_result() {
        let keys = Arc::new(MemoryKeyStorage::new());
        let results = Arc::new(MemoryResultStorage::new());
        let first = CacheManager::new("first", keys.clone(), results.clone()).await;

        let a = CacheKey::root(Digest::from("sha256:a"), 0);
        let b = CacheKey::root(Digest::from("sha256:b"), 0);
        let shared = MemoryArtifact::new("shared", b"s".to_vec());
        first.save(&a, shared.clone(), Utc::now()).await.unwrap();
        first.save(&b, shared, Utc::now()).await.unwrap();
        first
            .save(&b, MemoryArtifact::new("alive", b"a".to_vec()), Utc::now())
            .await
            .unwrap();

        results.remove("shared").await;
        assert_eq!(first.release_unreferenced().await.unwrap(), 1);

        assert!(keys.walk_results(a.id()).await.unwrap().is_empty());
        let left = keys.walk_results(b.id()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "alive");

        results.remove("alive").await;
        let second = CacheManager::new("second", keys.clone(), results).await;
        assert!(keys.walk().await.unwrap().is_empty());
        assert!(second.query(&[], 0, &Digest::from("sha256:b"), 0).await.unwrap().is_empty());
    }
}

mod load_with_parents {
    use crate::support::{BulkResults, StubKeys};
    use chrono::Utc;
    use keygraph::storage::{MemoryArtifact, MemoryResultStorage};
    use keygraph::{CacheKey, CacheKeyWithSelector, CacheManager, Digest, ResultStorage, SharedArtifact};
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Fixture {
        manager: CacheManager,
        keys: Arc<StubKeys>,
        results: Arc<BulkResults>,
        parent: Arc<CacheKey>,
        child: Arc<CacheKey>,
        parent_art: Arc<MemoryArtifact>,
        child_art: Arc<MemoryArtifact>,
        stray_art: Arc<MemoryArtifact>,
    }

    async fn fixture() -> Fixture {
        let keys = Arc::new(StubKeys::default());
        let results = Arc::new(BulkResults::default());
        let manager = CacheManager::new("m", keys.clone(), results.clone()).await;

        let parent = CacheKey::root(Digest::from("sha256:p"), 0);
        let child = CacheKey::new(
            Digest::from("sha256:c"),
            0,
            vec![vec![CacheKeyWithSelector::new(parent.clone(), "")]],
        );
        let parent_art = MemoryArtifact::new("parent-art", b"p".to_vec());
        let child_art = MemoryArtifact::new("child-art", b"c".to_vec());
        let stray_art = MemoryArtifact::new("stray-art", b"s".to_vec());

        manager.save(&parent, parent_art.clone(), Utc::now()).await.unwrap();
        manager.save(&child, child_art.clone(), Utc::now()).await.unwrap();

        let mut bulk: HashMap<String, SharedArtifact> = HashMap::new();
        bulk.insert(manager.resolve(&child).await, child_art.clone());
        bulk.insert(manager.resolve(&parent).await, parent_art.clone());
        bulk.insert("unknown-key".to_string(), stray_art.clone());
        *results.bulk.lock().await = bulk;

        Fixture {
            manager,
            keys,
            results,
            parent,
            child,
            parent_art,
            child_art,
            stray_art,
        }
    }

    #[tokio::test]
    async fn returns_ancestors_and_releases_leftovers() {
        let f = fixture().await;
        let record = f.manager.records(&f.child).await.unwrap().remove(0);

        let loaded = f.manager.load_with_parents(&record).await.unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].result.id(), "child-art");
        assert_eq!(loaded[0].cache_result.id, "child-art");
        assert_eq!(loaded[1].result.id(), "parent-art");
        assert!(Arc::ptr_eq(&loaded[1].cache_key, &f.parent));
        assert_eq!(f.stray_art.release_count(), 1);
        assert_eq!(f.child_art.release_count(), 0);
        assert_eq!(f.parent_art.release_count(), 0);
        assert!(f.results.inner.exists("child-art").await);
    }

    #[tokio::test]
    async fn failure_releases_everything_fetched() {
        let f = fixture().await;
        let record = f.manager.records(&f.child).await.unwrap().remove(0);
        f.keys.fail_results_for(f.parent.id()).await;

        let err = f.manager.load_with_parents(&record).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(f.child_art.release_count(), 1);
        assert_eq!(f.parent_art.release_count(), 1);
        assert_eq!(f.stray_art.release_count(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_single_load() {
        let manager = CacheManager::new(
            "m",
            Arc::new(StubKeys::default()),
            Arc::new(MemoryResultStorage::new()),
        )
        .await;
        let key = CacheKey::root(Digest::from("sha256:op"), 0);
        let saved = manager
            .save(&key, MemoryArtifact::new("only", b"o".to_vec()), Utc::now())
            .await
            .unwrap();

        let loaded = manager
            .load_with_parents(saved.exporter.record())
            .await
            .unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].result.id(), "only");
        assert_eq!(loaded[0].cache_result.id, "only");
        assert!(Arc::ptr_eq(&loaded[0].cache_key, &key));
    }
}

mod concurrency {
    use chrono::Utc;
    use keygraph::storage::MemoryArtifact;
    use keygraph::{CacheKey, CacheKeyWithSelector, CacheManager, Digest};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_and_queries() {
        let manager = Arc::new(CacheManager::in_memory().await);
        let base = CacheKey::root(Digest::from("sha256:base"), 0);
        let digest = Digest::from("sha256:step");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            let base = base.clone();
            let digest = digest.clone();
            tasks.push(tokio::spawn(async move {
                let key = CacheKey::new(
                    digest.clone(),
                    i,
                    vec![vec![CacheKeyWithSelector::new(base.clone(), "")]],
                );
                manager
                    .save(
                        &key,
                        MemoryArtifact::new(format!("out-{i}"), vec![i as u8]),
                        Utc::now(),
                    )
                    .await
                    .unwrap();
                manager
                    .query(&[CacheKeyWithSelector::new(base, "")], 0, &digest, i)
                    .await
                    .unwrap()
                    .len()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_key_resolves_once_per_manager() {
        let manager = Arc::new(CacheManager::in_memory().await);
        let base = CacheKey::root(Digest::from("sha256:base"), 0);
        let key = CacheKey::new(
            Digest::from("sha256:step"),
            0,
            vec![vec![CacheKeyWithSelector::new(base, "")]],
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move { manager.resolve(&key).await }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }
}
