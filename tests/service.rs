use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use strata::{
    Backend, CacheConfig, CoordinatorConfig, EmbeddingProvider, FlatFileBackend,
    HashEmbeddingProvider, HealthState, InMemoryBackend, MemoryError, MemoryKind, MemoryPatch,
    MemoryService, NewMemory, ServiceConfig, SimilarityReference,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quiet_config() -> ServiceConfig {
    ServiceConfig::builder("unused")
        .background_tasks(false)
        .coordinator(CoordinatorConfig {
            backend_timeout: Duration::from_millis(200),
            transient_retries: 1,
            retry_backoff: Duration::from_millis(5),
        })
        .build()
}

async fn single_backend(config: ServiceConfig) -> MemoryService {
    MemoryService::with_backends(vec![Arc::new(InMemoryBackend::new("primary"))], config)
        .await
        .unwrap()
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn store_then_retrieve_round_trips() {
    let service = single_backend(quiet_config()).await;
    let new_memory = NewMemory::new("agent", MemoryKind::Procedural, "restart the worker with --force")
        .with_tag("ops")
        .with_importance(0.7)
        .with_embedding(vec![0.1, 0.2, 0.3]);

    let id = service.store(new_memory.clone()).await.unwrap();
    let memory = service.retrieve(&id, false).await.unwrap().unwrap();

    assert_eq!(memory.agent_id, new_memory.agent_id);
    assert_eq!(memory.kind, new_memory.kind);
    assert_eq!(memory.content, new_memory.content);
    assert_eq!(memory.tags, new_memory.tags);
    assert_eq!(memory.importance, 0.7);
    assert_eq!(memory.embedding, new_memory.embedding);
    assert_eq!(memory.version, 1);
    assert_eq!(memory.access_count, 0);

    let touched = service.retrieve(&id, true).await.unwrap().unwrap();
    assert_eq!(touched.access_count, 1);
    assert_eq!(touched.version, 1);
}

#[tokio::test]
async fn invalid_memories_are_rejected() {
    let service = single_backend(quiet_config()).await;
    let err = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, ""))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}

#[tokio::test]
async fn stale_version_conflicts_without_mutation() {
    let service = single_backend(quiet_config()).await;
    let id = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "v1"))
        .await
        .unwrap();

    let v2 = service
        .update(&id, 1, MemoryPatch::new().content("v2"))
        .await
        .unwrap();
    assert_eq!(v2, 2);

    let err = service
        .update(&id, 1, MemoryPatch::new().content("stale"))
        .await
        .unwrap_err();
    match err {
        MemoryError::VersionConflict { expected, actual, .. } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }

    let memory = service.retrieve(&id, false).await.unwrap().unwrap();
    assert_eq!(memory.content, "v2");
    assert_eq!(memory.version, 2);

    let err = service
        .update("missing", 1, MemoryPatch::new().content("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));
}

#[tokio::test]
async fn writes_fail_over_and_sync_back_after_recovery() {
    init_tracing();
    let top = Arc::new(InMemoryBackend::new("top"));
    let bottom = Arc::new(InMemoryBackend::new("bottom"));
    let service = MemoryService::with_backends(
        vec![top.clone() as Arc<dyn Backend>, bottom.clone() as Arc<dyn Backend>],
        quiet_config(),
    )
    .await
    .unwrap();

    top.set_available(false);
    let id = service
        .store(NewMemory::new("agent", MemoryKind::Episodic, "written during an outage"))
        .await
        .unwrap();

    assert_eq!(service.health_snapshot().state(0), Some(HealthState::Unavailable));
    assert!(bottom.get_memory(&id).await.unwrap().is_some());
    assert_eq!(service.pending_sync_count(), 1);
    assert!(service.retrieve(&id, false).await.unwrap().is_some());

    top.set_available(true);
    let snapshot = service.check_health().await;
    assert_eq!(snapshot.state(0), Some(HealthState::Healthy));

    wait_for(|| service.pending_sync_count() == 0).await;
    let synced = top.get_memory(&id).await.unwrap().unwrap();
    assert_eq!(synced.content, "written during an outage");

    service.shutdown().await;
}

#[tokio::test]
async fn all_backends_down_is_storage_unavailable() {
    let only = Arc::new(InMemoryBackend::new("only"));
    let service = MemoryService::with_backends(vec![only.clone() as Arc<dyn Backend>], quiet_config())
        .await
        .unwrap();

    only.set_available(false);
    let err = tokio_test::assert_err!(
        service
            .store(NewMemory::new("agent", MemoryKind::Working, "nowhere to go"))
            .await
    );
    assert!(matches!(err, MemoryError::StorageUnavailable(_)));
}

#[tokio::test]
async fn cache_eviction_keeps_entities_readable() {
    let config = ServiceConfig::builder("unused")
        .background_tasks(false)
        .cache(CacheConfig::builder().memory_capacity(2).build())
        .build();
    let service = single_backend(config).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            service
                .store(NewMemory::new("agent", MemoryKind::Semantic, format!("fact {i}")))
                .await
                .unwrap(),
        );
    }
    for (i, id) in ids.iter().enumerate() {
        let memory = service.retrieve(id, false).await.unwrap().unwrap();
        assert_eq!(memory.content, format!("fact {i}"));
    }
    assert!(service.cache_stats().evictions > 0);
}

#[tokio::test]
async fn soft_and_hard_forget() {
    let service = single_backend(quiet_config()).await;
    let soft = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "soft target"))
        .await
        .unwrap();
    let hard = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "hard target"))
        .await
        .unwrap();

    assert!(tokio_test::assert_ok!(service.forget(&soft, false).await));
    assert!(!tokio_test::assert_ok!(service.forget(&soft, false).await));
    let tombstone = service.retrieve(&soft, false).await.unwrap().unwrap();
    assert!(tombstone.deleted_at.is_some());
    assert_eq!(tombstone.version, 2);

    assert!(service.forget(&hard, true).await.unwrap());
    assert!(service.retrieve(&hard, false).await.unwrap().is_none());

    let hits = service.search("agent", "target", 10, None).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn find_similar_respects_threshold_and_order() {
    let service = single_backend(quiet_config()).await;
    let store = |content: &'static str, vector: Vec<f32>, importance: f32| {
        let service = service.clone();
        async move {
            service
                .store(
                    NewMemory::new("agent", MemoryKind::Semantic, content)
                        .with_importance(importance)
                        .with_embedding(vector),
                )
                .await
                .unwrap()
        }
    };

    let reference = store("reference", vec![1.0, 0.0], 0.5).await;
    let close_low = store("close, low", vec![0.9, 0.1], 0.2).await;
    let close_high = store("close, high", vec![0.9, 0.1], 0.8).await;
    let far = store("far", vec![0.0, 1.0], 0.9).await;

    let hits = service
        .find_similar(SimilarityReference::memory(reference.clone()), 0.5, 10)
        .await
        .unwrap();
    let ids: Vec<&str> = hits.iter().map(|(m, _)| m.id.as_str()).collect();
    assert_eq!(ids, vec![close_high.as_str(), close_low.as_str()]);
    assert!(hits.iter().all(|(_, score)| *score >= 0.5));
    assert!(!ids.contains(&far.as_str()));
    assert!(!ids.contains(&reference.as_str()));

    let capped = service
        .find_similar(SimilarityReference::memory(reference), 0.5, 1)
        .await
        .unwrap();
    assert_eq!(capped.len(), 1);

    let text = service
        .find_similar(SimilarityReference::text("agent", "anything"), 0.0, 10)
        .await
        .unwrap();
    assert!(text.is_empty());
}

#[tokio::test]
async fn embedder_fills_vectors_for_text_similarity() {
    let service = MemoryService::builder(quiet_config())
        .backends(vec![Arc::new(InMemoryBackend::new("primary"))])
        .embedder(Arc::new(HashEmbeddingProvider::new(128)))
        .build()
        .await
        .unwrap();

    let deploy = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "deploy the billing service"))
        .await
        .unwrap();
    service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "weekly team lunch"))
        .await
        .unwrap();

    let hits = service
        .find_similar(SimilarityReference::text("agent", "billing service deploy"), 0.8, 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, deploy);
}

#[tokio::test]
async fn associations_are_walked_breadth_first() {
    let service = single_backend(quiet_config()).await;
    let leaf = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "leaf"))
        .await
        .unwrap();
    let middle = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "middle").with_association(leaf.clone(), 0.5))
        .await
        .unwrap();
    let root = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "root").with_association(middle.clone(), 0.9))
        .await
        .unwrap();

    let one_hop = service.find_associated(&root, 1).await.unwrap();
    assert_eq!(one_hop.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), vec![middle.clone()]);

    let two_hops = service.find_associated(&root, 2).await.unwrap();
    assert_eq!(two_hops.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), vec![middle, leaf]);
}

/// Embeds slowly so a short deadline expires mid-store
struct SlowEmbedder;

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn name(&self) -> &str {
        "slow"
    }

    fn dimension(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> strata::Result<Vec<Vec<f32>>> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

#[tokio::test]
async fn timed_out_mutations_still_complete() {
    let service = MemoryService::builder(quiet_config())
        .backends(vec![Arc::new(InMemoryBackend::new("primary"))])
        .embedder(Arc::new(SlowEmbedder))
        .build()
        .await
        .unwrap();
    let hurried = service.with_deadline(Duration::from_millis(20));

    let err = hurried
        .store(NewMemory::new("agent", MemoryKind::Working, "slow to embed"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Timeout(_)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let hits = service.search("agent", "slow to embed", 10, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].embedding, Some(vec![1.0, 0.0]));
}

#[tokio::test]
async fn flat_file_corruption_surfaces_as_recovery_warning() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let flat = Arc::new(FlatFileBackend::open(dir.path()).await.unwrap());
        let service = MemoryService::with_backends(vec![flat as Arc<dyn Backend>], quiet_config())
            .await
            .unwrap();
        let id = service
            .store(NewMemory::new("agent", MemoryKind::Working, "survives"))
            .await
            .unwrap();
        service.shutdown().await;
        id
    };

    let path = dir.path().join("agent").join("working.mem");
    let mut text = std::fs::read_to_string(&path).unwrap();
    text.push_str("id: \"torn\"\ncontent: \"half");
    std::fs::write(&path, text).unwrap();

    let flat = Arc::new(FlatFileBackend::open(dir.path()).await.unwrap());
    let service = MemoryService::with_backends(vec![flat as Arc<dyn Backend>], quiet_config())
        .await
        .unwrap();
    assert_eq!(service.recovery_warnings().len(), 1);
    assert!(service.retrieve(&id, false).await.unwrap().is_some());
}

#[tokio::test]
async fn default_chain_opens_under_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig::builder(dir.path()).background_tasks(false).build();
    let service = MemoryService::open(config.clone()).await.unwrap();

    let snapshot = service.health_snapshot();
    assert_eq!(snapshot.records.len(), 4);
    assert!(snapshot.records.iter().all(|r| r.state == HealthState::Healthy));

    let id = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "persisted"))
        .await
        .unwrap();
    service.shutdown().await;

    let reopened = MemoryService::open(config).await.unwrap();
    let memory = reopened.retrieve(&id, false).await.unwrap().unwrap();
    assert_eq!(memory.content, "persisted");
    reopened.shutdown().await;
}

fn two_tier(top: &Arc<InMemoryBackend>, bottom: &Arc<InMemoryBackend>) -> Vec<Arc<dyn Backend>> {
    vec![top.clone() as Arc<dyn Backend>, bottom.clone() as Arc<dyn Backend>]
}

#[tokio::test]
async fn outage_writes_are_found_after_restart() {
    init_tracing();
    let top = Arc::new(InMemoryBackend::new("top"));
    let bottom = Arc::new(InMemoryBackend::new("bottom"));

    let id = {
        let service = MemoryService::with_backends(two_tier(&top, &bottom), quiet_config())
            .await
            .unwrap();
        top.set_available(false);
        let id = service
            .store(NewMemory::new("agent", MemoryKind::Semantic, "stranded during the outage"))
            .await
            .unwrap();
        service.shutdown().await;
        id
    };
    top.set_available(true);
    assert!(top.get_memory(&id).await.unwrap().is_none());
    let service = MemoryService::with_backends(two_tier(&top, &bottom), quiet_config())
        .await
        .unwrap();
    let memory = service.retrieve(&id, false).await.unwrap().unwrap();
    assert_eq!(memory.content, "stranded during the outage");
    let hits = service.search("agent", "stranded", 10, None).await.unwrap();
    assert_eq!(hits.len(), 1);

    wait_for(|| service.pending_sync_count() == 0).await;
    assert!(top.get_memory(&id).await.unwrap().is_some());
    service.shutdown().await;
}

#[tokio::test]
async fn forgets_reach_backends_that_missed_them() {
    init_tracing();
    let top = Arc::new(InMemoryBackend::new("top"));
    let bottom = Arc::new(InMemoryBackend::new("bottom"));
    let service = MemoryService::with_backends(two_tier(&top, &bottom), quiet_config())
        .await
        .unwrap();

    top.set_available(false);
    let hard = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "hard target"))
        .await
        .unwrap();
    let soft = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "soft target"))
        .await
        .unwrap();
    top.set_available(true);
    service.check_health().await;
    wait_for(|| service.pending_sync_count() == 0).await;

    bottom.set_available(false);
    service.check_health().await;
    assert!(service.forget(&hard, true).await.unwrap());
    assert!(service.forget(&soft, false).await.unwrap());
    assert_eq!(service.pending_sync_count(), 2);

    // Fail over to the backend that missed both forgets.
    bottom.set_available(true);
    top.set_available(false);
    let snapshot = service.check_health().await;
    assert_eq!(snapshot.state(0), Some(HealthState::Unavailable));
    assert!(bottom.get_memory(&hard).await.unwrap().is_some());

    assert!(service.retrieve(&hard, false).await.unwrap().is_none());
    let tombstone = service.retrieve(&soft, false).await.unwrap().unwrap();
    assert!(tombstone.deleted_at.is_some());
    let hits = service.search("agent", "target", 10, None).await.unwrap();
    assert!(hits.is_empty());

    top.set_available(true);
    service.check_health().await;
    wait_for(|| service.pending_sync_count() == 0).await;
    assert!(bottom.get_memory(&hard).await.unwrap().is_none());
    let synced = bottom.get_memory(&soft).await.unwrap().unwrap();
    assert!(synced.deleted_at.is_some());
    service.shutdown().await;
}

struct NanEmbedder;

#[async_trait]
impl EmbeddingProvider for NanEmbedder {
    fn name(&self) -> &str {
        "nan"
    }

    fn dimension(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> strata::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![f32::NAN, 1.0]).collect())
    }
}

#[tokio::test]
async fn non_finite_embeddings_are_rejected() {
    let service = MemoryService::builder(quiet_config())
        .backends(vec![Arc::new(InMemoryBackend::new("primary"))])
        .embedder(Arc::new(NanEmbedder))
        .build()
        .await
        .unwrap();

    let err = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "poisoned vector"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
    assert!(service.search("agent", "poisoned", 10, None).await.unwrap().is_empty());
    assert!(service.similarity_index().is_empty());
}

#[tokio::test]
async fn pinned_cache_stays_bounded_during_an_outage() {
    let top = Arc::new(InMemoryBackend::new("top"));
    let bottom = Arc::new(InMemoryBackend::new("bottom"));
    let config = ServiceConfig::builder("unused")
        .background_tasks(false)
        .cache(CacheConfig::builder().memory_capacity(4).max_pinned(4).build())
        .build();
    let service = MemoryService::with_backends(two_tier(&top, &bottom), config)
        .await
        .unwrap();

    top.set_available(false);
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            service
                .store(NewMemory::new("agent", MemoryKind::Episodic, format!("outage note {i}")))
                .await
                .unwrap(),
        );
    }
    assert_eq!(service.pending_sync_count(), 20);
    assert!(service.cache_stats().evictions >= 12);

    for (i, id) in ids.iter().enumerate() {
        let memory = service.retrieve(id, false).await.unwrap().unwrap();
        assert_eq!(memory.content, format!("outage note {i}"));
    }
    service.shutdown().await;
}

#[tokio::test]
async fn failed_access_tracking_still_returns_the_memory() {
    let only = Arc::new(InMemoryBackend::new("only"));
    let service = MemoryService::with_backends(vec![only.clone() as Arc<dyn Backend>], quiet_config())
        .await
        .unwrap();
    let id = service
        .store(NewMemory::new("agent", MemoryKind::Semantic, "read while the disk is gone"))
        .await
        .unwrap();

    only.set_available(false);
    let memory = tokio_test::assert_ok!(service.retrieve(&id, true).await).unwrap();
    assert_eq!(memory.content, "read while the disk is gone");
    assert_eq!(memory.access_count, 0);
}
