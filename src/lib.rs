//! # Strata - hierarchical memory for autonomous agents
//!
//! Durable, queryable agent memory over an ordered chain of storage backends
//! (graph > relational > flat file > in-memory). Writes land on the best healthy backend
//! and are replayed upward once a preferred backend recovers; reads go through a
//! write-through cache. On top sit agent contexts with inheritance and checkpoints,
//! embedding similarity search, and a consolidation pass that decays, prunes and
//! compresses old memories.
//!
//! ```rust,no_run
//! use strata::{MemoryKind, MemoryService, NewMemory, ServiceConfig};
//!
//! # async fn demo() -> strata::Result<()> {
//! let service = MemoryService::open(ServiceConfig::new("./data")).await?;
//! let id = service
//!     .store(NewMemory::new("agent-1", MemoryKind::Semantic, "The deploy key rotates monthly"))
//!     .await?;
//! let hits = service.search("agent-1", "deploy key", 10, None).await?;
//! assert!(hits.iter().any(|m| m.id == id));
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod events;
pub mod health;
pub mod locks;
pub mod similarity;
pub mod store;
pub mod sync;
pub mod types;

pub use backend::{
    Backend, BackendKind, FlatFileBackend, GraphBackend, InMemoryBackend, MemoryFilter,
    RelationalBackend, SearchQuery,
};
pub use cache::{CacheConfig, CacheConfigBuilder, CacheLayer, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use consolidation::{
    ConsolidationConfig, ConsolidationConfigBuilder, ConsolidationEngine, ConsolidationReport,
};
pub use context::{ContextConfig, ContextConfigBuilder, ContextManager};
pub use coordinator::{CoordinatorConfig, FallbackChainCoordinator};
pub use embedding::{EmbeddingProvider, HashEmbeddingProvider};
pub use error::{MemoryError, Result};
pub use events::{Event, EventBus, EventFilter, EventStats, EventType, FilteredSubscriber, WriteObserver};
pub use health::{
    BackendHealthRecord, HealthConfig, HealthConfigBuilder, HealthMonitor, HealthSnapshot,
    HealthState,
};
pub use similarity::{cosine_similarity, SimilarityIndex, SimilarityReference};
pub use store::MemoryStore;
pub use sync::{EntityKey, PendingSet, SyncConfig, SyncConfigBuilder, SyncOutcome};
pub use types::{
    AgentId, Association, Checkpoint, Context, ContextId, ContextStatus, Memory, MemoryId,
    MemoryKind, MemoryPatch, NewMemory, ParentLookup,
};

use crate::embedding::embed_one;
use crate::locks::KeyedLocks;
use crate::sync::SyncBackWorker;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Inner {
    coordinator: Arc<FallbackChainCoordinator>,
    health: Arc<HealthMonitor>,
    cache: Arc<CacheLayer>,
    store: MemoryStore,
    contexts: Arc<ContextManager>,
    consolidation: Arc<ConsolidationEngine>,
    index: Arc<SimilarityIndex>,
    events: EventBus,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    clock: Arc<dyn Clock>,
    config: ServiceConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    recovery: Mutex<Vec<String>>,
}

/// Main memory service
#[derive(Clone)]
pub struct MemoryService {
    inner: Arc<Inner>,
    deadline: Duration,
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("data_dir", &self.inner.config.data_dir)
            .field("coordinator", &self.inner.coordinator)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Assembles a [`MemoryService`] from a config plus optional collaborators
pub struct MemoryServiceBuilder {
    config: ServiceConfig,
    backends: Option<Vec<Arc<dyn Backend>>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    clock: Arc<dyn Clock>,
}

impl MemoryServiceBuilder {
    /// Use a custom chain, highest priority first, instead of the default one
    pub fn backends(mut self, backends: Vec<Arc<dyn Backend>>) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn build(self) -> Result<MemoryService> {
        let MemoryServiceBuilder {
            config,
            backends,
            embedder,
            clock,
        } = self;

        let mut recovery = Vec::new();
        let backends = match backends {
            Some(backends) => backends,
            None => default_chain(&config, &mut recovery).await?,
        };

        let health = Arc::new(HealthMonitor::new(
            backends.clone(),
            config.health.clone(),
            clock.clone(),
        ));
        let pending = Arc::new(PendingSet::new());
        let locks = Arc::new(KeyedLocks::new());
        let (coordinator, sync_rx) = FallbackChainCoordinator::new(
            backends,
            health.clone(),
            pending.clone(),
            locks.clone(),
            config.coordinator.clone(),
            config.sync.queue_capacity,
        )?;
        let coordinator = Arc::new(coordinator);
        let cache = Arc::new(CacheLayer::new(config.cache.clone(), pending));

        let events = EventBus::new(config.event_capacity);
        let index = Arc::new(SimilarityIndex::new());
        events.register_observer(index.clone());

        let store = MemoryStore::new(
            coordinator.clone(),
            cache.clone(),
            locks.clone(),
            events.clone(),
            clock.clone(),
        );
        let contexts = Arc::new(ContextManager::new(
            coordinator.clone(),
            cache.clone(),
            locks,
            events.clone(),
            clock.clone(),
            store.clone(),
            config.context.clone(),
        ));
        let consolidation = Arc::new(ConsolidationEngine::new(
            store.clone(),
            contexts.clone(),
            events.clone(),
            clock.clone(),
            config.consolidation.clone(),
        ));

        // Before anything reads: entities stranded below the top by an earlier outage.
        let stranded = coordinator.reconcile().await;
        index.rebuild(coordinator.list_memories(&MemoryFilter::default()).await?);

        recovery.extend(coordinator.drain_warnings());
        for warning in &recovery {
            tracing::warn!(warning = %warning, "storage recovery");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks =
            vec![SyncBackWorker::new(coordinator.clone(), config.sync.clone(), sync_rx, shutdown_rx.clone()).spawn()];
        if config.background_tasks {
            tasks.push(health.clone().spawn(shutdown_rx.clone()));
            tasks.push(consolidation.clone().spawn(shutdown_rx));
        }

        tracing::info!(
            backends = ?coordinator.backends().iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
            indexed = index.len(),
            stranded,
            embedder = embedder.as_ref().map(|e| e.name().to_string()),
            "memory service started"
        );

        let deadline = config.default_timeout;
        Ok(MemoryService {
            inner: Arc::new(Inner {
                coordinator,
                health,
                cache,
                store,
                contexts,
                consolidation,
                index,
                events,
                embedder,
                clock,
                config,
                shutdown,
                tasks: Mutex::new(tasks),
                recovery: Mutex::new(recovery),
            }),
            deadline,
        })
    }
}

/// Graph > Relational > FlatFile > InMemory under `config.data_dir`.
/// A tier that fails to open is left out of the chain with a warning.
async fn default_chain(config: &ServiceConfig, warnings: &mut Vec<String>) -> Result<Vec<Arc<dyn Backend>>> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let mut chain: Vec<Arc<dyn Backend>> = Vec::with_capacity(4);

    match GraphBackend::open(config.graph_snapshot_path()).await {
        Ok(graph) => chain.push(Arc::new(graph)),
        Err(e) => {
            tracing::error!(error = %e, "graph backend unavailable at startup");
            warnings.push(format!("graph: not opened: {e}"));
        }
    }
    match RelationalBackend::connect(config.sqlite_path()).await {
        Ok(relational) => chain.push(Arc::new(relational)),
        Err(e) => {
            tracing::error!(error = %e, "relational backend unavailable at startup");
            warnings.push(format!("relational: not opened: {e}"));
        }
    }
    match FlatFileBackend::open(config.flatfile_dir()).await {
        Ok(flat) => chain.push(Arc::new(flat)),
        Err(e) => {
            tracing::error!(error = %e, "flat-file backend unavailable at startup");
            warnings.push(format!("flatfile: not opened: {e}"));
        }
    }
    chain.push(Arc::new(InMemoryBackend::new("memory")));
    Ok(chain)
}

impl MemoryService {
    pub fn builder(config: ServiceConfig) -> MemoryServiceBuilder {
        MemoryServiceBuilder {
            config,
            backends: None,
            embedder: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Open the default backend chain under `config.data_dir`
    pub async fn open(config: ServiceConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Run over a caller-supplied chain, highest priority first
    pub async fn with_backends(backends: Vec<Arc<dyn Backend>>, config: ServiceConfig) -> Result<Self> {
        Self::builder(config).backends(backends).build().await
    }

    /// Same service, different per-operation deadline
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            inner: self.inner.clone(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn timeout_error(&self, op: &str) -> MemoryError {
        MemoryError::Timeout(format!("{op} exceeded {:?}", self.deadline))
    }

    /// Reads are simply cut off at the deadline
    async fn read<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.deadline, fut)
            .await
            .map_err(|_| self.timeout_error(op))?
    }

    /// Mutations run on their own task, which finishes even if the caller times out
    async fn mutate<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Inner>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(f(self.inner.clone()));
        match tokio::time::timeout(self.deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MemoryError::Other(anyhow::anyhow!("{op} task failed: {e}"))),
            Err(_) => {
                tracing::warn!(op, deadline = ?self.deadline, "operation timed out, completing in background");
                Err(self.timeout_error(op))
            }
        }
    }

    // ─── Memories ─────────────────────────────────────────────────────────────

    /// Store a new memory; server-assigned fields are filled in and the id returned
    pub async fn store(&self, new_memory: NewMemory) -> Result<MemoryId> {
        new_memory.validate()?;
        self.mutate("store", move |inner| async move {
            let mut memory = new_memory.into_memory(inner.clock.now());
            if memory.embedding.is_none() {
                memory.embedding = inner.embed(&memory.content).await?;
            }
            inner.store.save(memory).await
        })
        .await
    }

    /// Fetch by id. Tombstoned memories come back with `deleted_at` set.
    pub async fn retrieve(&self, id: &str, update_access: bool) -> Result<Option<Memory>> {
        if !update_access {
            return self.read("retrieve", self.inner.store.load(id, false)).await;
        }
        let id = id.to_string();
        self.mutate("retrieve", move |inner| async move { inner.store.load(&id, true).await })
            .await
    }

    /// Live memories of one agent matching `query_text`, best first
    pub async fn search(
        &self,
        agent_id: &str,
        query_text: &str,
        limit: usize,
        kind: Option<MemoryKind>,
    ) -> Result<Vec<Memory>> {
        if agent_id.trim().is_empty() {
            return Err(MemoryError::Validation("agent_id is required".into()));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = SearchQuery::new(agent_id, query_text, limit).with_kind(kind);
        self.read("search", self.inner.store.search(&query)).await
    }

    /// Optimistic update; returns the new version
    pub async fn update(&self, id: &str, expected_version: u64, mut patch: MemoryPatch) -> Result<u64> {
        patch.validate()?;
        let id = id.to_string();
        self.mutate("update", move |inner| async move {
            if patch.embedding.is_none() {
                if let Some(content) = patch.content.clone() {
                    patch.embedding = inner.embed(&content).await?.map(Some);
                }
            }
            inner.store.update(&id, expected_version, patch).await
        })
        .await
    }

    /// Soft (tombstone) or hard (physical) forget. Returns whether anything changed.
    pub async fn forget(&self, id: &str, hard: bool) -> Result<bool> {
        let id = id.to_string();
        self.mutate("forget", move |inner| async move { inner.store.forget(&id, hard).await })
            .await
    }

    /// Memories with cosine similarity >= `threshold` to the reference
    pub async fn find_similar(
        &self,
        reference: SimilarityReference,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(Memory, f32)>> {
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            return Err(MemoryError::Validation(format!(
                "threshold must be within [-1, 1], got {threshold}"
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.read("find_similar", self.inner.find_similar(reference, threshold, limit))
            .await
    }

    /// Breadth-first walk over association edges, at most `max_depth` hops
    pub async fn find_associated(&self, id: &str, max_depth: usize) -> Result<Vec<Memory>> {
        self.read("find_associated", self.inner.store.associated(id, max_depth))
            .await
    }

    // ─── Contexts ─────────────────────────────────────────────────────────────

    pub async fn create_context(
        &self,
        agent_id: &str,
        task_id: Option<String>,
        parent_id: Option<ContextId>,
    ) -> Result<Context> {
        let agent_id = agent_id.to_string();
        self.mutate("create_context", move |inner| async move {
            inner.contexts.create(&agent_id, task_id, parent_id).await
        })
        .await
    }

    pub async fn load_context(&self, id: &str) -> Result<Option<Context>> {
        self.read("load_context", self.inner.contexts.load(id)).await
    }

    /// Last-writer-wins save; `false` when the context is archived
    pub async fn save_context(&self, context: Context) -> Result<bool> {
        self.mutate("save_context", move |inner| async move { inner.contexts.save(context).await })
            .await
    }

    pub async fn switch_context(&self, agent_id: &str, to_context_id: &str) -> Result<Context> {
        let agent_id = agent_id.to_string();
        let to = to_context_id.to_string();
        self.mutate("switch_context", move |inner| async move {
            inner.contexts.switch(&agent_id, &to).await
        })
        .await
    }

    pub async fn merge_contexts(&self, primary_id: &str, secondary_id: &str) -> Result<Context> {
        let primary = primary_id.to_string();
        let secondary = secondary_id.to_string();
        self.mutate("merge_contexts", move |inner| async move {
            inner.contexts.merge(&primary, &secondary).await
        })
        .await
    }

    pub async fn checkpoint_context(&self, id: &str) -> Result<Context> {
        let id = id.to_string();
        self.mutate("checkpoint_context", move |inner| async move {
            inner.contexts.checkpoint(&id).await
        })
        .await
    }

    /// Restore from checkpoint `index`, or the latest one
    pub async fn restore_checkpoint(&self, id: &str, index: Option<usize>) -> Result<Context> {
        let id = id.to_string();
        self.mutate("restore_checkpoint", move |inner| async move {
            inner.contexts.restore_checkpoint(&id, index).await
        })
        .await
    }

    pub async fn archive_context(&self, id: &str) -> Result<Context> {
        let id = id.to_string();
        self.mutate("archive_context", move |inner| async move { inner.contexts.archive(&id).await })
            .await
    }

    pub async fn delete_context(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.mutate("delete_context", move |inner| async move { inner.contexts.delete(&id).await })
            .await
    }

    pub async fn parent_of(&self, id: &str) -> Result<ParentLookup> {
        self.read("parent_of", self.inner.contexts.parent_of(id)).await
    }

    pub async fn active_context(&self, agent_id: &str) -> Result<Option<Context>> {
        self.read("active_context", self.inner.contexts.active_context(agent_id))
            .await
    }

    /// Remove stale, inactive contexts now
    pub async fn collect_garbage(&self) -> Result<usize> {
        self.mutate("collect_garbage", move |inner| async move {
            inner.contexts.collect_garbage(inner.clock.now()).await
        })
        .await
    }

    // ─── Operations ───────────────────────────────────────────────────────────

    /// Run a consolidation pass now. Not bound by the operation deadline.
    pub async fn run_consolidation(&self) -> Result<ConsolidationReport> {
        self.inner.consolidation.run().await
    }

    pub fn health_snapshot(&self) -> Arc<HealthSnapshot> {
        self.inner.health.snapshot()
    }

    /// Probe every backend once and return the resulting snapshot
    pub async fn check_health(&self) -> Arc<HealthSnapshot> {
        self.inner.health.probe_once().await;
        self.inner.health.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Entities written below their preferred backend and not yet replayed upward
    pub fn pending_sync_count(&self) -> usize {
        self.inner.coordinator.pending().len()
    }

    /// Corruption and startup problems recovered from so far
    pub fn recovery_warnings(&self) -> Vec<String> {
        let fresh = self.inner.coordinator.drain_warnings();
        let mut recovery = self.inner.recovery.lock().unwrap_or_else(|e| e.into_inner());
        recovery.extend(fresh);
        recovery.clone()
    }

    pub fn similarity_index(&self) -> &SimilarityIndex {
        &self.inner.index
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Stop background tasks and close backend pools. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        self.inner.coordinator.close_all().await;
        tracing::info!("memory service stopped");
    }
}

impl Inner {
    /// Embedding for new content; `None` without a provider or when the provider fails.
    /// A vector the provider does produce must be valid.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let Some(embedder) = self.embedder.as_ref() else {
            return Ok(None);
        };
        match embed_one(embedder.as_ref(), text, self.config.embed_timeout).await {
            Ok(vector) => Ok(Some(vector)),
            Err(e @ MemoryError::Validation(_)) => {
                tracing::warn!(provider = embedder.name(), error = %e, "embedding provider returned an invalid vector");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(provider = embedder.name(), error = %e, "embedding failed, continuing without vector");
                Ok(None)
            }
        }
    }

    async fn find_similar(
        &self,
        reference: SimilarityReference,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(Memory, f32)>> {
        let (agent_id, vector, exclude) = match reference {
            SimilarityReference::Memory(id) => {
                let memory = self
                    .store
                    .load(&id, false)
                    .await?
                    .ok_or_else(|| MemoryError::NotFound(format!("memory {id}")))?;
                let Some(vector) = memory.embedding else {
                    return Ok(Vec::new());
                };
                (memory.agent_id, vector, Some(id))
            }
            SimilarityReference::Vector { agent_id, vector } => (agent_id, vector, None),
            SimilarityReference::Text { agent_id, text } => {
                let Some(embedder) = &self.embedder else {
                    tracing::debug!("text similarity requested without an embedding provider");
                    return Ok(Vec::new());
                };
                let vector = embed_one(embedder.as_ref(), &text, self.config.embed_timeout).await?;
                (agent_id, vector, None)
            }
        };

        let mut results = Vec::with_capacity(limit);
        for (id, score) in self.index.query(&agent_id, &vector, threshold, exclude.as_deref()) {
            if results.len() >= limit {
                break;
            }
            // The index can briefly trail a concurrent forget.
            if let Some(memory) = self.store.load(&id, false).await? {
                if !memory.is_deleted() {
                    results.push((memory, score));
                }
            }
        }
        Ok(results)
    }
}
