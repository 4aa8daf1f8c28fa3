//! Fallback chain routing.
//!
//! Every storage call goes to the highest-priority routable backend. Backend faults are
//! retried a few times in place, then the backend is reported Unavailable and the call
//! fails over down the chain. Mutations that land below the top of the chain are marked
//! pending and handed to the sync-back worker, as are deletes and tombstones that could
//! not reach every backend. At startup [`FallbackChainCoordinator::reconcile`] finds
//! entities whose newest copy sits below the top, so none is stranded by a restart.

use crate::backend::{rank_matches, Backend, MemoryFilter, SearchQuery};
use crate::error::{MemoryError, Result};
use crate::health::HealthMonitor;
use crate::locks::KeyedLocks;
use crate::sync::{Change, EntityKey, PendingSet, SyncOutcome, SyncTask};
use crate::types::{Context, Memory};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on a single backend call
    pub backend_timeout: Duration,
    /// In-place retries on a backend fault before failing over
    pub transient_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(5),
            transient_retries: 2,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Routes storage calls across the ordered backend chain
pub struct FallbackChainCoordinator {
    backends: Vec<Arc<dyn Backend>>,
    health: Arc<HealthMonitor>,
    pending: Arc<PendingSet>,
    locks: Arc<KeyedLocks>,
    sync_tx: mpsc::Sender<SyncTask>,
    config: CoordinatorConfig,
    dropped_syncs: AtomicU64,
}

impl std::fmt::Debug for FallbackChainCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChainCoordinator")
            .field("backends", &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl FallbackChainCoordinator {
    /// Build the coordinator; the returned receiver feeds the sync-back worker
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        health: Arc<HealthMonitor>,
        pending: Arc<PendingSet>,
        locks: Arc<KeyedLocks>,
        config: CoordinatorConfig,
        queue_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<SyncTask>)> {
        if backends.is_empty() {
            return Err(MemoryError::Configuration(
                "fallback chain needs at least one backend".into(),
            ));
        }
        let (sync_tx, sync_rx) = mpsc::channel(queue_capacity.max(1));
        Ok((
            Self {
                backends,
                health,
                pending,
                locks,
                sync_tx,
                config,
                dropped_syncs: AtomicU64::new(0),
            },
            sync_rx,
        ))
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn pending(&self) -> &Arc<PendingSet> {
        &self.pending
    }

    /// Sync tasks dropped because the queue was full
    pub fn dropped_syncs(&self) -> u64 {
        self.dropped_syncs.load(Ordering::Relaxed)
    }

    /// Routable backends in priority order, with `preferred` moved first when routable
    fn route(&self, preferred: Option<usize>) -> Vec<usize> {
        let mut order = self.health.snapshot().routable();
        if let Some(p) = preferred {
            if let Some(pos) = order.iter().position(|&i| i == p) {
                order.remove(pos);
                order.insert(0, p);
            }
        }
        order
    }

    /// Run `call` down the chain until one backend answers.
    /// Returns the index of the serving backend with the value.
    async fn execute<T, F>(&self, op: &'static str, order: Vec<usize>, mut call: F) -> Result<(usize, T)>
    where
        T: Send + 'static,
        F: FnMut(Arc<dyn Backend>) -> BoxFuture<'static, Result<T>>,
    {
        if order.is_empty() {
            return Err(MemoryError::StorageUnavailable(format!(
                "{op}: no routable backend"
            )));
        }

        let mut last_error = None;
        for (position, index) in order.iter().copied().enumerate() {
            match self.attempt(op, index, &mut call).await {
                Ok(value) => {
                    if position > 0 {
                        tracing::info!(op, backend = self.backends[index].name(), "served after failover");
                    }
                    return Ok((index, value));
                }
                Err(e) if e.is_backend_fault() => {
                    tracing::warn!(
                        op,
                        backend = self.backends[index].name(),
                        error = %e,
                        "backend failed, failing over"
                    );
                    self.health.report_failure(index, &e.to_string());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(MemoryError::StorageUnavailable(match last_error {
            Some(e) => format!("{op}: every backend failed, last error: {e}"),
            None => format!("{op}: every backend failed"),
        }))
    }

    /// One backend, with bounded transient retries and a per-call timeout
    async fn attempt<T, F>(&self, op: &'static str, index: usize, call: &mut F) -> Result<T>
    where
        F: FnMut(Arc<dyn Backend>) -> BoxFuture<'static, Result<T>>,
    {
        let backend = &self.backends[index];
        let mut retries = 0;
        loop {
            let result = match tokio::time::timeout(self.config.backend_timeout, call(Arc::clone(backend))).await {
                Ok(result) => result,
                Err(_) => Err(MemoryError::backend(
                    backend.name(),
                    format!("{op} timed out after {:?}", self.config.backend_timeout),
                )),
            };
            match result {
                Err(e) if e.is_backend_fault() && retries < self.config.transient_retries => {
                    retries += 1;
                    tracing::debug!(op, backend = backend.name(), retries, error = %e, "transient retry");
                    tokio::time::sleep(self.config.retry_backoff * retries).await;
                }
                other => return other,
            }
        }
    }

    /// Bookkeeping after a successful mutation served by `index`; `lagging` are the
    /// backends a delete or tombstone did not reach
    fn after_write(&self, key: EntityKey, index: usize, lagging: Vec<usize>, change: Change) {
        self.pending.record(key.clone(), index, lagging, change);
        if !self.pending.contains(&key) {
            return;
        }
        match self.sync_tx.try_send(SyncTask::new(key, index)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.dropped_syncs.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    entity = %task.key,
                    source = index,
                    "sync-back queue full, task dropped; entity stays readable from its serving backend"
                );
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                tracing::debug!(entity = %task.key, "sync-back worker not running");
            }
        }
    }

    /// Read from a backend outside the failover path, bounded by the call timeout
    async fn side_read<T>(&self, index: usize, fut: BoxFuture<'_, Result<T>>) -> Option<T> {
        match tokio::time::timeout(self.config.backend_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::debug!(backend = self.backends[index].name(), error = %e, "side read failed");
                None
            }
            Err(_) => None,
        }
    }

    /// Apply a side effect to every backend except `served`. Returns whether any of them
    /// reported `true`, and the backends that did not confirm.
    async fn fan_out<F>(&self, served: usize, mut call: F) -> (bool, Vec<usize>)
    where
        F: FnMut(Arc<dyn Backend>) -> BoxFuture<'static, Result<bool>>,
    {
        let routable = self.health.snapshot().routable();
        let mut any = false;
        let mut lagging = Vec::new();
        for index in (0..self.backends.len()).filter(|&i| i != served) {
            if !routable.contains(&index) {
                lagging.push(index);
                continue;
            }
            match self.side_read(index, call(Arc::clone(&self.backends[index]))).await {
                Some(hit) => any |= hit,
                None => lagging.push(index),
            }
        }
        if !lagging.is_empty() {
            tracing::warn!(
                lagging = ?lagging.iter().map(|&i| self.backends[i].name()).collect::<Vec<_>>(),
                "side effect queued for backends that did not confirm"
            );
        }
        (any, lagging)
    }

    /// Hide what a copy served by a lagging backend is known to be missing
    fn mask_memory(&self, served: usize, mut memory: Memory) -> Option<Memory> {
        match self.pending.lagging_at(&EntityKey::Memory(memory.id.clone()), served) {
            Some(Change::Removed) => None,
            Some(Change::Tombstoned { version, at }) if memory.version < version => {
                memory.deleted_at.get_or_insert(at);
                Some(memory)
            }
            _ => Some(memory),
        }
    }

    fn mask_context(&self, served: usize, context: Context) -> Option<Context> {
        match self.pending.lagging_at(&EntityKey::Context(context.id.clone()), served) {
            Some(Change::Removed) => None,
            _ => Some(context),
        }
    }

    // ─── Memories ─────────────────────────────────────────────────────────────

    pub async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let preferred = self.pending.source_of(&EntityKey::Memory(id.to_string()));
        let id = id.to_string();
        let (index, memory) = self
            .execute("get_memory", self.route(preferred), |b| {
                let id = id.clone();
                Box::pin(async move { b.get_memory(&id).await })
            })
            .await?;
        Ok(memory.and_then(|m| self.mask_memory(index, m)))
    }

    /// Upsert; returns the index of the backend that took the write
    pub async fn put_memory(&self, memory: &Memory) -> Result<usize> {
        let (index, ()) = self
            .execute("put_memory", self.route(None), |b| {
                let memory = memory.clone();
                Box::pin(async move { b.put_memory(&memory).await })
            })
            .await?;
        self.after_write(EntityKey::Memory(memory.id.clone()), index, Vec::new(), Change::Written);
        Ok(index)
    }

    /// Upsert a tombstone, then lay it over every older copy held elsewhere in the chain.
    /// Backends that cannot be reached get it through sync-back.
    pub async fn put_tombstone(&self, memory: &Memory) -> Result<usize> {
        let (index, ()) = self
            .execute("put_tombstone", self.route(None), |b| {
                let memory = memory.clone();
                Box::pin(async move { b.put_memory(&memory).await })
            })
            .await?;

        let tombstone = memory.clone();
        let (_, lagging) = self
            .fan_out(index, move |b| {
                let tombstone = tombstone.clone();
                Box::pin(async move {
                    match b.get_memory(&tombstone.id).await? {
                        Some(current) if tombstone.supersedes(&current) => {
                            b.put_memory(&tombstone).await?;
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                })
            })
            .await;

        let change = match memory.deleted_at {
            Some(at) => Change::Tombstoned {
                version: memory.version,
                at,
            },
            None => Change::Written,
        };
        self.after_write(EntityKey::Memory(memory.id.clone()), index, lagging, change);
        Ok(index)
    }

    /// Physical removal from the serving backend, then from the rest. Backends that
    /// cannot confirm get the removal through sync-back.
    pub async fn delete_memory(&self, id: &str) -> Result<bool> {
        let owned = id.to_string();
        let (index, existed) = self
            .execute("delete_memory", self.route(None), |b| {
                let id = owned.clone();
                Box::pin(async move { b.delete_memory(&id).await })
            })
            .await?;

        let side = owned.clone();
        let (removed, lagging) = self
            .fan_out(index, move |b| {
                let id = side.clone();
                Box::pin(async move { b.delete_memory(&id).await })
            })
            .await;
        self.after_write(EntityKey::Memory(owned), index, lagging, Change::Removed);
        Ok(existed || removed)
    }

    pub async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        let (index, listed) = self
            .execute("list_memories", self.route(None), |b| {
                let filter = filter.clone();
                Box::pin(async move { b.list_memories(&filter).await })
            })
            .await?;
        Ok(self.overlay_memories(index, listed, filter).await)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<Memory>> {
        // Pending entries may displace or drop served hits, so over-fetch by that many.
        let pending = self.pending.len();
        let widened = SearchQuery {
            limit: query.limit.saturating_add(pending),
            ..query.clone()
        };
        let (index, found) = self
            .execute("search", self.route(None), |b| {
                let query = widened.clone();
                Box::pin(async move { b.search(&query).await })
            })
            .await?;
        if pending == 0 {
            return Ok(found);
        }
        let overlaid = self.overlay_memories(index, found, &query.filter()).await;
        Ok(rank_matches(overlaid, query))
    }

    pub async fn associated(&self, id: &str, max_depth: usize) -> Result<Vec<Memory>> {
        let id = id.to_string();
        let (_, found) = self
            .execute("associated", self.route(None), |b| {
                let id = id.clone();
                Box::pin(async move { b.associated(&id, max_depth).await })
            })
            .await?;
        Ok(found)
    }

    /// Replace stale copies from the serving backend with the source copies of pending
    /// entities, so un-replayed writes stay visible. When a source is out of reach, copies
    /// known to lag are masked instead.
    async fn overlay_memories(
        &self,
        served_by: usize,
        mut results: Vec<Memory>,
        filter: &MemoryFilter,
    ) -> Vec<Memory> {
        let snapshot = self.health.snapshot();
        for (id, entry) in self.pending.memory_entries() {
            if entry.source == served_by {
                continue;
            }
            let newest = if snapshot.state(entry.source).is_some_and(|s| s.is_routable()) {
                let source = &self.backends[entry.source];
                self.side_read(entry.source, source.get_memory(&id)).await
            } else {
                None
            };
            match newest {
                Some(Some(memory)) => {
                    results.retain(|r| r.id != memory.id || r.supersedes(&memory));
                    if !results.iter().any(|r| r.id == memory.id) && filter.matches(&memory) {
                        results.push(memory);
                    }
                }
                Some(None) => results.retain(|r| r.id != id),
                None => {
                    results = results
                        .into_iter()
                        .filter_map(|r| if r.id == id { self.mask_memory(served_by, r) } else { Some(r) })
                        .filter(|r| filter.matches(r))
                        .collect();
                }
            }
        }
        results
    }

    // ─── Contexts ─────────────────────────────────────────────────────────────

    pub async fn get_context(&self, id: &str) -> Result<Option<Context>> {
        let preferred = self.pending.source_of(&EntityKey::Context(id.to_string()));
        let id = id.to_string();
        let (index, context) = self
            .execute("get_context", self.route(preferred), |b| {
                let id = id.clone();
                Box::pin(async move { b.get_context(&id).await })
            })
            .await?;
        Ok(context.and_then(|c| self.mask_context(index, c)))
    }

    pub async fn put_context(&self, context: &Context) -> Result<usize> {
        let (index, ()) = self
            .execute("put_context", self.route(None), |b| {
                let context = context.clone();
                Box::pin(async move { b.put_context(&context).await })
            })
            .await?;
        self.after_write(EntityKey::Context(context.id.clone()), index, Vec::new(), Change::Written);
        Ok(index)
    }

    pub async fn delete_context(&self, id: &str) -> Result<bool> {
        let owned = id.to_string();
        let (index, existed) = self
            .execute("delete_context", self.route(None), |b| {
                let id = owned.clone();
                Box::pin(async move { b.delete_context(&id).await })
            })
            .await?;

        let side = owned.clone();
        let (removed, lagging) = self
            .fan_out(index, move |b| {
                let id = side.clone();
                Box::pin(async move { b.delete_context(&id).await })
            })
            .await;
        self.after_write(EntityKey::Context(owned), index, lagging, Change::Removed);
        Ok(existed || removed)
    }

    pub async fn list_contexts(&self, agent_id: Option<&str>) -> Result<Vec<Context>> {
        let agent = agent_id.map(str::to_string);
        let (index, mut listed) = self
            .execute("list_contexts", self.route(None), |b| {
                let agent = agent.clone();
                Box::pin(async move { b.list_contexts(agent.as_deref()).await })
            })
            .await?;

        let snapshot = self.health.snapshot();
        for (id, entry) in self.pending.context_entries() {
            if entry.source == index {
                continue;
            }
            let newest = if snapshot.state(entry.source).is_some_and(|s| s.is_routable()) {
                let source = &self.backends[entry.source];
                self.side_read(entry.source, source.get_context(&id)).await
            } else {
                None
            };
            let Some(newest) = newest else {
                listed = listed
                    .into_iter()
                    .filter_map(|c| if c.id == id { self.mask_context(index, c) } else { Some(c) })
                    .collect();
                continue;
            };
            match newest {
                Some(context) => {
                    listed.retain(|c| c.id != context.id || c.supersedes(&context));
                    let wanted = agent_id.map_or(true, |a| context.agent_id == a);
                    if wanted && !listed.iter().any(|c| c.id == context.id) {
                        listed.push(context);
                    }
                }
                None => listed.retain(|c| c.id != id),
            }
        }
        Ok(listed)
    }

    // ─── Sync-back ────────────────────────────────────────────────────────────

    /// Copy one entity from `source` into `target` under last-writer-wins.
    ///
    /// Idempotent: replaying an unchanged entity is `Skipped`. An entity missing on the
    /// source is deleted from the target.
    pub async fn replay(&self, key: &EntityKey, source: usize, target: usize) -> Result<SyncOutcome> {
        let (Some(src), Some(dst)) = (self.backends.get(source), self.backends.get(target)) else {
            return Err(MemoryError::Configuration(format!(
                "replay between unknown backends {source} -> {target}"
            )));
        };
        // Serialize against foreground writers of the same entity.
        let _guard = self.locks.lock(key.id()).await;

        let outcome = match key {
            EntityKey::Memory(id) => {
                let newest = src.get_memory(id).await?;
                let current = dst.get_memory(id).await?;
                match (newest, current) {
                    (Some(newest), Some(current)) if !newest.supersedes(&current) => SyncOutcome::Skipped,
                    (Some(newest), _) => {
                        dst.put_memory(&newest).await?;
                        SyncOutcome::Applied
                    }
                    (None, Some(_)) => {
                        dst.delete_memory(id).await?;
                        SyncOutcome::Deleted
                    }
                    (None, None) => SyncOutcome::Skipped,
                }
            }
            EntityKey::Context(id) => {
                let newest = src.get_context(id).await?;
                let current = dst.get_context(id).await?;
                match (newest, current) {
                    (Some(newest), Some(current)) if !newest.supersedes(&current) => SyncOutcome::Skipped,
                    (Some(newest), _) => {
                        dst.put_context(&newest).await?;
                        SyncOutcome::Applied
                    }
                    (None, Some(_)) => {
                        dst.delete_context(id).await?;
                        SyncOutcome::Deleted
                    }
                    (None, None) => SyncOutcome::Skipped,
                }
            }
        };

        if outcome != SyncOutcome::Skipped {
            tracing::info!(
                entity = %key,
                from = src.name(),
                to = dst.name(),
                ?outcome,
                "sync-back replayed"
            );
        }
        Ok(outcome)
    }

    /// Startup pass over the whole chain: every entity whose newest copy, by version then
    /// timestamp, sits below a backend that lacks it or holds an older one is marked
    /// pending. Returns how many entities were marked.
    ///
    /// Sync-back state lives in process, so this is what carries it across a restart.
    /// A backend that cannot be listed counts as lacking everything.
    pub async fn reconcile(&self) -> usize {
        if self.backends.len() < 2 {
            return 0;
        }

        let mut listed = vec![false; self.backends.len()];
        let mut copies: HashMap<EntityKey, Vec<(usize, (u64, DateTime<Utc>))>> = HashMap::new();
        for (index, backend) in self.backends.iter().enumerate() {
            let memories = self.side_read(index, backend.list_memories(&MemoryFilter::all())).await;
            let contexts = self.side_read(index, backend.list_contexts(None)).await;
            let (Some(memories), Some(contexts)) = (memories, contexts) else {
                tracing::warn!(backend = backend.name(), "backend could not be listed during reconciliation");
                self.health.report_failure(index, "listing failed during reconciliation");
                continue;
            };
            listed[index] = true;
            for memory in memories {
                let stamp = (memory.version, memory.last_touched());
                copies.entry(EntityKey::Memory(memory.id)).or_default().push((index, stamp));
            }
            for context in contexts {
                let stamp = (context.version, context.updated_at);
                copies.entry(EntityKey::Context(context.id)).or_default().push((index, stamp));
            }
        }

        let mut marked = 0;
        for (key, held) in copies {
            // Highest stamp wins; ties go to the higher-priority backend.
            let Some(&(source, newest)) = held
                .iter()
                .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            else {
                continue;
            };
            let behind: Vec<usize> = (0..source)
                .filter(|&i| {
                    !listed[i] || !held.iter().any(|&(holder, stamp)| holder == i && stamp >= newest)
                })
                .collect();
            if behind.is_empty() {
                continue;
            }
            tracing::debug!(entity = %key, source, ?behind, "newest copy below the top of the chain");
            self.pending.record(key, source, behind, Change::Written);
            marked += 1;
        }

        if marked > 0 {
            tracing::info!(marked, "reconciliation queued sync-back for entities stranded below the top");
        }
        marked
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Close every backend; errors are logged
    pub async fn close_all(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.close().await {
                tracing::warn!(backend = backend.name(), error = %e, "backend close failed");
            }
        }
    }

    /// Recovery warnings from every backend, prefixed with the backend name
    pub fn drain_warnings(&self) -> Vec<String> {
        self.backends
            .iter()
            .flat_map(|b| {
                let name = b.name().to_string();
                b.drain_warnings()
                    .into_iter()
                    .map(move |w| format!("{name}: {w}"))
            })
            .collect()
    }
}
