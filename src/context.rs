//! Context lifecycle: creation, inheritance, switching, checkpoints, merging and GC.
//!
//! Status machine: `Active -> Checkpointed -> Active` (any change after a checkpoint makes
//! the context dirty again) and `Active | Checkpointed -> Archived` (terminal). Each agent
//! has at most one active context, tracked in process.

use crate::cache::CacheLayer;
use crate::clock::Clock;
use crate::coordinator::FallbackChainCoordinator;
use crate::error::{MemoryError, Result};
use crate::events::{Event, EventBus};
use crate::locks::KeyedLocks;
use crate::store::MemoryStore;
use crate::types::{AgentId, Context, ContextId, ContextStatus, MemoryId, ParentLookup};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Upper bound on `focus_refs` produced by a merge
    pub max_focus: usize,
    /// Oldest checkpoints are dropped beyond this count
    pub max_checkpoints: usize,
    /// Parent chains longer than this are treated as cyclic
    pub max_parent_depth: usize,
    /// Inactive contexts untouched for this long are collected
    pub retention: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_focus: 16,
            max_checkpoints: 10,
            max_parent_depth: 64,
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl ContextConfig {
    pub fn builder() -> ContextConfigBuilder {
        ContextConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ContextConfigBuilder {
    config: ContextConfig,
}

impl ContextConfigBuilder {
    pub fn max_focus(mut self, max: usize) -> Self {
        self.config.max_focus = max;
        self
    }

    pub fn max_checkpoints(mut self, max: usize) -> Self {
        self.config.max_checkpoints = max.max(1);
        self
    }

    pub fn max_parent_depth(mut self, depth: usize) -> Self {
        self.config.max_parent_depth = depth.max(1);
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn build(self) -> ContextConfig {
        self.config
    }
}

pub struct ContextManager {
    coordinator: Arc<FallbackChainCoordinator>,
    cache: Arc<CacheLayer>,
    locks: Arc<KeyedLocks>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    memories: MemoryStore,
    config: ContextConfig,
    active: Mutex<HashMap<AgentId, ContextId>>,
    /// Held while a parent link is checked and written, so two concurrent saves
    /// cannot close a loop between them. Saves that keep their parent skip it.
    lineage: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("config", &self.config)
            .finish()
    }
}

fn agent_lock_key(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

/// Whether writing `context` over `stored` sets or moves its parent link
fn relinks(stored: Option<&Context>, context: &Context) -> bool {
    match stored {
        Some(stored) => stored.parent_id != context.parent_id,
        None => context.parent_id.is_some(),
    }
}

impl ContextManager {
    pub fn new(
        coordinator: Arc<FallbackChainCoordinator>,
        cache: Arc<CacheLayer>,
        locks: Arc<KeyedLocks>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        memories: MemoryStore,
        config: ContextConfig,
    ) -> Self {
        Self {
            coordinator,
            cache,
            locks,
            events,
            clock,
            memories,
            config,
            active: Mutex::new(HashMap::new()),
            lineage: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn active_map(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, ContextId>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn load_locked(&self, id: &str) -> Result<Option<Context>> {
        if let Some(context) = self.cache.get_context(id) {
            return Ok(Some(context));
        }
        let loaded = self.coordinator.get_context(id).await?;
        if let Some(context) = &loaded {
            self.cache.put_context(context.clone());
        }
        Ok(loaded)
    }

    async fn require_locked(&self, id: &str) -> Result<Context> {
        self.load_locked(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("context {id}")))
    }

    /// Write a context whose version and timestamp are already set
    async fn persist_locked(&self, context: &Context) -> Result<()> {
        self.coordinator.put_context(context).await?;
        self.cache.put_context(context.clone());
        self.events.emit(Event::ContextSaved {
            context_id: context.id.clone(),
            agent_id: context.agent_id.clone(),
            version: context.version,
            timestamp: context.updated_at,
        });
        Ok(())
    }

    /// Walk up from `parent` and fail if `id` is reached or the chain is too deep.
    /// A missing ancestor ends the walk (orphaned chains are not cycles).
    async fn check_lineage(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = parent.map(str::to_string);
        while let Some(ancestor) = current {
            if ancestor == id || !seen.insert(ancestor.clone()) {
                return Err(MemoryError::CyclicInheritance(id.to_string()));
            }
            if seen.len() > self.config.max_parent_depth {
                tracing::warn!(context = id, depth = seen.len(), "parent chain exceeds depth bound");
                return Err(MemoryError::CyclicInheritance(id.to_string()));
            }
            current = match self.load_any(&ancestor).await? {
                Some(context) => context.parent_id,
                None => None,
            };
        }
        Ok(())
    }

    /// Read without taking the per-id lock
    async fn load_any(&self, id: &str) -> Result<Option<Context>> {
        if let Some(context) = self.cache.get_context(id) {
            return Ok(Some(context));
        }
        self.coordinator.get_context(id).await
    }

    pub async fn create(
        &self,
        agent_id: &str,
        task_id: Option<String>,
        parent_id: Option<ContextId>,
    ) -> Result<Context> {
        if agent_id.trim().is_empty() {
            return Err(MemoryError::Validation("agent_id is required".into()));
        }
        let mut context = Context::new(agent_id, self.clock.now());
        context.task_id = task_id;
        context.parent_id = parent_id;
        self.insert_new(context).await
    }

    async fn insert_new(&self, context: Context) -> Result<Context> {
        let _lineage = match context.parent_id {
            Some(_) => Some(self.lineage.lock().await),
            None => None,
        };
        if let Some(parent_id) = &context.parent_id {
            let parent = self
                .load_any(parent_id)
                .await?
                .ok_or_else(|| MemoryError::NotFound(format!("parent context {parent_id}")))?;
            if parent.agent_id != context.agent_id {
                return Err(MemoryError::Validation(format!(
                    "parent context {parent_id} belongs to another agent"
                )));
            }
        }
        self.check_lineage(&context.id, context.parent_id.as_deref()).await?;

        let _guard = self.locks.lock(&context.id).await;
        self.persist_locked(&context).await?;
        tracing::debug!(id = %context.id, agent = %context.agent_id, "context created");
        Ok(context)
    }

    pub async fn load(&self, id: &str) -> Result<Option<Context>> {
        if let Some(context) = self.cache.get_context(id) {
            return Ok(Some(context));
        }
        let _guard = self.locks.lock(id).await;
        self.load_locked(id).await
    }

    /// Last-writer-wins save. Returns `false` when the stored context is archived.
    pub async fn save(&self, context: Context) -> Result<bool> {
        if context.agent_id.trim().is_empty() {
            return Err(MemoryError::Validation("agent_id is required".into()));
        }

        let peeked = self.load_any(&context.id).await?;
        if !relinks(peeked.as_ref(), &context) {
            if let Some(saved) = self.save_locked(context.clone(), false).await? {
                return Ok(saved);
            }
        }

        let _lineage = self.lineage.lock().await;
        self.check_lineage(&context.id, context.parent_id.as_deref()).await?;
        Ok(self.save_locked(context, true).await?.unwrap_or(false))
    }

    /// Save under the per-id lock. Without `lineage_held`, a save that turns out to
    /// move the parent link returns `None` untouched so it can be redone under the
    /// lineage lock; with it, the result is always `Some`.
    async fn save_locked(&self, mut context: Context, lineage_held: bool) -> Result<Option<bool>> {
        let _guard = self.locks.lock(&context.id).await;
        let stored = self.load_locked(&context.id).await?;
        if !lineage_held && relinks(stored.as_ref(), &context) {
            return Ok(None);
        }
        if let Some(stored) = &stored {
            if stored.is_archived() {
                tracing::debug!(id = %context.id, "save ignored, context archived");
                return Ok(Some(false));
            }
            if stored.agent_id != context.agent_id {
                return Err(MemoryError::Validation(format!(
                    "context {} belongs to another agent",
                    context.id
                )));
            }
            if context.status == ContextStatus::Checkpointed && context.content_differs(stored) {
                context.status = ContextStatus::Active;
            }
        }

        let base = stored.as_ref().map_or(context.version, |s| s.version.max(context.version));
        context.version = base + 1;
        context.updated_at = self.clock.now();
        self.trim_checkpoints(&mut context);
        self.persist_locked(&context).await?;
        Ok(Some(true))
    }

    fn trim_checkpoints(&self, context: &mut Context) {
        let max = self.config.max_checkpoints;
        if context.checkpoints.len() > max {
            let excess = context.checkpoints.len() - max;
            context.checkpoints.drain(..excess);
        }
    }

    /// Load, modify and persist one context under its lock; archived contexts are read-only
    async fn modify<F>(&self, id: &str, change: F) -> Result<Context>
    where
        F: FnOnce(&mut Context, DateTime<Utc>) -> Result<()>,
    {
        let _guard = self.locks.lock(id).await;
        let mut context = self.require_locked(id).await?;
        if context.is_archived() {
            return Err(MemoryError::Validation(format!("context {id} is archived")));
        }
        let now = self.clock.now();
        change(&mut context, now)?;
        context.version += 1;
        context.updated_at = now;
        self.trim_checkpoints(&mut context);
        self.persist_locked(&context).await?;
        Ok(context)
    }

    pub async fn checkpoint(&self, id: &str) -> Result<Context> {
        let context = self
            .modify(id, |context, now| {
                let snapshot = context.snapshot(now);
                context.checkpoints.push(snapshot);
                context.status = ContextStatus::Checkpointed;
                Ok(())
            })
            .await?;
        tracing::debug!(id, checkpoints = context.checkpoints.len(), "context checkpointed");
        Ok(context)
    }

    /// Restore working state from a checkpoint (latest when `index` is `None`)
    pub async fn restore_checkpoint(&self, id: &str, index: Option<usize>) -> Result<Context> {
        self.modify(id, |context, _| {
            let position = match index {
                Some(i) => i,
                None => context
                    .checkpoints
                    .len()
                    .checked_sub(1)
                    .ok_or_else(|| MemoryError::Validation(format!("context {} has no checkpoints", context.id)))?,
            };
            let checkpoint = context.checkpoints.get(position).cloned().ok_or_else(|| {
                MemoryError::Validation(format!("context {} has no checkpoint {position}", context.id))
            })?;
            context.state = checkpoint.state;
            context.memory_refs = checkpoint.memory_refs;
            context.focus_refs = checkpoint.focus_refs;
            context.status = ContextStatus::Checkpointed;
            Ok(())
        })
        .await
    }

    pub async fn archive(&self, id: &str) -> Result<Context> {
        let context = self
            .modify(id, |context, _| {
                context.status = ContextStatus::Archived;
                Ok(())
            })
            .await?;

        let mut active = self.active_map();
        if active.get(&context.agent_id) == Some(&context.id) {
            active.remove(&context.agent_id);
        }
        tracing::info!(id, "context archived");
        Ok(context)
    }

    /// Checkpoint the agent's current context if dirty, then make `to` its active one,
    /// creating it when absent.
    pub async fn switch(&self, agent_id: &str, to: &str) -> Result<Context> {
        if agent_id.trim().is_empty() || to.trim().is_empty() {
            return Err(MemoryError::Validation("agent_id and context id are required".into()));
        }
        let _agent = self.locks.lock(&agent_lock_key(agent_id)).await;

        let target = match self.load(to).await? {
            Some(target) => {
                if target.agent_id != agent_id {
                    return Err(MemoryError::Validation(format!(
                        "context {to} belongs to another agent"
                    )));
                }
                if target.is_archived() {
                    return Err(MemoryError::Validation(format!("context {to} is archived")));
                }
                target
            }
            None => {
                let mut fresh = Context::new(agent_id, self.clock.now());
                fresh.id = to.to_string();
                self.insert_new(fresh).await?
            }
        };

        let previous = self.active_map().get(agent_id).cloned();
        if let Some(previous) = previous.as_deref().filter(|p| *p != to) {
            match self.load(previous).await? {
                Some(current) if current.status == ContextStatus::Active => {
                    self.checkpoint(previous).await?;
                }
                _ => {}
            }
        }

        self.active_map().insert(agent_id.to_string(), target.id.clone());
        self.events.emit(Event::ContextSwitched {
            agent_id: agent_id.to_string(),
            from: previous,
            to: target.id.clone(),
            timestamp: self.clock.now(),
        });
        tracing::debug!(agent = agent_id, to, "context switched");
        Ok(target)
    }

    pub async fn active_context(&self, agent_id: &str) -> Result<Option<Context>> {
        let active = self.active_map().get(agent_id).cloned();
        match active {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    /// New context (parent = primary) combining two contexts of the same agent.
    ///
    /// `memory_refs` is the ordered union (primary first), `focus_refs` the union ranked
    /// by memory importance then recency and capped, `state` primary's map plus the keys
    /// only secondary has.
    pub async fn merge(&self, primary_id: &str, secondary_id: &str) -> Result<Context> {
        let primary = self
            .load(primary_id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("context {primary_id}")))?;
        let secondary = self
            .load(secondary_id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("context {secondary_id}")))?;
        if primary.agent_id != secondary.agent_id {
            return Err(MemoryError::Validation(
                "cannot merge contexts of different agents".into(),
            ));
        }

        let mut merged = Context::new(primary.agent_id.clone(), self.clock.now());
        merged.parent_id = Some(primary.id.clone());
        merged.task_id = primary.task_id.clone();

        for id in primary.memory_refs.iter().chain(&secondary.memory_refs) {
            if !merged.memory_refs.contains(id) {
                merged.memory_refs.push(id.clone());
            }
        }

        let mut focus: Vec<MemoryId> = Vec::new();
        for id in primary.focus_refs.iter().chain(&secondary.focus_refs) {
            if !focus.contains(id) {
                focus.push(id.clone());
            }
        }
        merged.focus_refs = self.rank_focus(focus).await?;

        merged.state = primary.state.clone();
        for (key, value) in &secondary.state {
            merged
                .state
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        let merged = self.insert_new(merged).await?;
        tracing::info!(
            primary = primary_id,
            secondary = secondary_id,
            merged = %merged.id,
            refs = merged.memory_refs.len(),
            "contexts merged"
        );
        Ok(merged)
    }

    /// Most important first, ties by most recent access, then id; unknown memories last
    async fn rank_focus(&self, ids: Vec<MemoryId>) -> Result<Vec<MemoryId>> {
        let mut ranked = Vec::with_capacity(ids.len());
        for id in ids {
            let memory = self.memories.load(&id, false).await?;
            let key = memory
                .filter(|m| !m.is_deleted())
                .map(|m| (m.importance, Some(m.accessed_at)))
                .unwrap_or((f32::NEG_INFINITY, None));
            ranked.push((id, key));
        }
        ranked.sort_by(|(id_a, (imp_a, at_a)), (id_b, (imp_b, at_b))| {
            imp_b
                .total_cmp(imp_a)
                .then(at_b.cmp(at_a))
                .then(id_a.cmp(id_b))
        });
        ranked.truncate(self.config.max_focus);
        Ok(ranked.into_iter().map(|(id, _)| id).collect())
    }

    pub async fn parent_of(&self, id: &str) -> Result<ParentLookup> {
        let context = self
            .load(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("context {id}")))?;
        let Some(parent_id) = context.parent_id else {
            return Ok(ParentLookup::Root);
        };
        Ok(match self.load(&parent_id).await? {
            Some(parent) => ParentLookup::Present(parent),
            None => ParentLookup::Orphaned(parent_id),
        })
    }

    /// Physical removal; children keep their (now orphaned) parent link
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let agent_id = self.load_locked(id).await?.map(|c| c.agent_id);
        let existed = self.coordinator.delete_context(id).await?;
        self.cache.invalidate_context(id);

        if let Some(agent_id) = agent_id {
            {
                let mut active = self.active_map();
                if active.get(&agent_id).map(String::as_str) == Some(id) {
                    active.remove(&agent_id);
                }
            }
            if existed {
                self.events.emit(Event::ContextDeleted {
                    context_id: id.to_string(),
                    agent_id,
                    timestamp: self.clock.now(),
                });
            }
        }
        Ok(existed)
    }

    /// Delete contexts that no agent has active and that have not changed within the
    /// retention window. Returns the number removed.
    pub async fn collect_garbage(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| MemoryError::Configuration(format!("context retention: {e}")))?;
        let cutoff = now - retention;
        let active: HashSet<ContextId> = self.active_map().values().cloned().collect();

        let mut collected = 0;
        for context in self.coordinator.list_contexts(None).await? {
            if active.contains(&context.id) || context.updated_at >= cutoff {
                continue;
            }
            // Re-check under the lock; the context may have been saved meanwhile.
            let still_stale = {
                let _guard = self.locks.lock(&context.id).await;
                self.load_locked(&context.id)
                    .await?
                    .is_some_and(|c| c.updated_at < cutoff)
            };
            if still_stale && self.delete(&context.id).await? {
                collected += 1;
            }
        }
        if collected > 0 {
            tracing::info!(collected, "stale contexts collected");
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, InMemoryBackend};
    use crate::cache::CacheConfig;
    use crate::coordinator::CoordinatorConfig;
    use crate::health::{HealthConfig, HealthMonitor};
    use crate::sync::PendingSet;
    use crate::{
        ContextConfig, ContextStatus, ManualClock, MemoryError, MemoryKind, MemoryService,
        NewMemory, ParentLookup, ServiceConfig,
    };
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    async fn service_with(context: ContextConfig, clock: ManualClock) -> MemoryService {
        let config = ServiceConfig::builder("unused")
            .background_tasks(false)
            .context(context)
            .build();
        MemoryService::builder(config)
            .backends(vec![Arc::new(InMemoryBackend::new("primary"))])
            .clock(Arc::new(clock))
            .build()
            .await
            .unwrap()
    }

    async fn service() -> MemoryService {
        service_with(ContextConfig::default(), ManualClock::default()).await
    }

    fn manager() -> ContextManager {
        let backends: Vec<Arc<dyn Backend>> = vec![Arc::new(InMemoryBackend::new("primary"))];
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let health = Arc::new(HealthMonitor::new(backends.clone(), HealthConfig::default(), clock.clone()));
        let pending = Arc::new(PendingSet::new());
        let locks = Arc::new(KeyedLocks::new());
        let (coordinator, _sync_rx) = FallbackChainCoordinator::new(
            backends,
            health,
            pending.clone(),
            locks.clone(),
            CoordinatorConfig::default(),
            8,
        )
        .unwrap();
        let coordinator = Arc::new(coordinator);
        let cache = Arc::new(CacheLayer::new(CacheConfig::default(), pending));
        let events = EventBus::new(16);
        let store = MemoryStore::new(coordinator.clone(), cache.clone(), locks.clone(), events.clone(), clock.clone());
        ContextManager::new(coordinator, cache, locks, events, clock, store, ContextConfig::default())
    }

    #[tokio::test]
    async fn only_parent_changes_wait_for_the_lineage_lock() {
        let manager = manager();
        let parent = manager.create("agent", None, None).await.unwrap();
        let child = manager.create("agent", None, Some(parent.id.clone())).await.unwrap();

        let held = manager.lineage.lock().await;
        let mut edited = child.clone();
        edited.task_id = Some("triage".into());
        let saved = tokio::time::timeout(Duration::from_secs(1), manager.save(edited)).await;
        assert!(saved.unwrap().unwrap());
        let orphan = tokio::time::timeout(Duration::from_secs(1), manager.create("agent", None, None)).await;
        assert!(orphan.unwrap().is_ok());

        let mut moved = manager.load(&child.id).await.unwrap().unwrap();
        moved.parent_id = None;
        let blocked = tokio::time::timeout(Duration::from_millis(50), manager.save(moved.clone())).await;
        assert!(blocked.is_err());

        drop(held);
        assert!(manager.save(moved).await.unwrap());
        let stored = manager.load(&child.id).await.unwrap().unwrap();
        assert_eq!(stored.parent_id, None);
        assert_eq!(stored.task_id.as_deref(), Some("triage"));
    }

    #[tokio::test]
    async fn parent_cycle_is_rejected() {
        let service = service().await;
        let a = service.create_context("agent", None, None).await.unwrap();
        let b = service
            .create_context("agent", None, Some(a.id.clone()))
            .await
            .unwrap();

        let mut a = service.load_context(&a.id).await.unwrap().unwrap();
        a.parent_id = Some(b.id.clone());
        let err = service.save_context(a.clone()).await.unwrap_err();
        assert!(matches!(err, MemoryError::CyclicInheritance(_)));

        a.parent_id = Some(a.id.clone());
        let err = service.save_context(a).await.unwrap_err();
        assert!(matches!(err, MemoryError::CyclicInheritance(_)));
    }

    #[tokio::test]
    async fn merge_is_commutative_in_refs_but_not_in_state() {
        let service = service().await;
        let low = service
            .store(NewMemory::new("agent", MemoryKind::Semantic, "minor detail").with_importance(0.2))
            .await
            .unwrap();
        let high = service
            .store(NewMemory::new("agent", MemoryKind::Semantic, "key fact").with_importance(0.9))
            .await
            .unwrap();

        let mut a = service.create_context("agent", None, None).await.unwrap();
        a.activate_memory("m1");
        a.focus_memory(low.clone());
        a.set_state("shared", serde_json::json!("from a"));
        a.set_state("only_a", serde_json::json!(1));
        assert!(service.save_context(a.clone()).await.unwrap());

        let mut b = service.create_context("agent", None, None).await.unwrap();
        b.activate_memory("m2");
        b.focus_memory(high.clone());
        b.set_state("shared", serde_json::json!("from b"));
        b.set_state("only_b", serde_json::json!(2));
        assert!(service.save_context(b.clone()).await.unwrap());

        let ab = service.merge_contexts(&a.id, &b.id).await.unwrap();
        let ba = service.merge_contexts(&b.id, &a.id).await.unwrap();

        assert_eq!(ab.parent_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(ba.parent_id.as_deref(), Some(b.id.as_str()));
        assert_eq!(ab.memory_refs, vec!["m1".to_string(), low.clone(), "m2".into(), high.clone()]);
        let ab_refs: HashSet<_> = ab.memory_refs.iter().collect();
        let ba_refs: HashSet<_> = ba.memory_refs.iter().collect();
        assert_eq!(ab_refs, ba_refs);

        assert_eq!(ab.focus_refs, vec![high.clone(), low.clone()]);
        assert_eq!(ba.focus_refs, vec![high, low]);

        assert_eq!(ab.state["shared"], serde_json::json!("from a"));
        assert_eq!(ba.state["shared"], serde_json::json!("from b"));
        assert_eq!(ab.state.len(), 3);
        assert_ne!(ab.state, ba.state);
    }

    #[tokio::test]
    async fn merge_caps_focus() {
        let service = service_with(
            ContextConfig::builder().max_focus(1).build(),
            ManualClock::default(),
        )
        .await;
        let mut a = service.create_context("agent", None, None).await.unwrap();
        a.focus_memory("x");
        service.save_context(a.clone()).await.unwrap();
        let mut b = service.create_context("agent", None, None).await.unwrap();
        b.focus_memory("y");
        service.save_context(b.clone()).await.unwrap();

        let merged = service.merge_contexts(&a.id, &b.id).await.unwrap();
        assert_eq!(merged.focus_refs.len(), 1);
        assert_eq!(merged.memory_refs.len(), 2);
    }

    #[tokio::test]
    async fn switch_checkpoints_the_previous_context() {
        let service = service().await;
        let first = service.create_context("agent", None, None).await.unwrap();
        service.switch_context("agent", &first.id).await.unwrap();

        let mut first = service.load_context(&first.id).await.unwrap().unwrap();
        first.set_state("step", serde_json::json!(3));
        service.save_context(first.clone()).await.unwrap();

        let second = service.switch_context("agent", "task-two").await.unwrap();
        assert_eq!(second.id, "task-two");
        assert_eq!(second.agent_id, "agent");

        let first = service.load_context(&first.id).await.unwrap().unwrap();
        assert_eq!(first.status, ContextStatus::Checkpointed);
        assert_eq!(first.checkpoints.len(), 1);
        assert_eq!(first.checkpoints[0].state["step"], serde_json::json!(3));

        let active = service.active_context("agent").await.unwrap().unwrap();
        assert_eq!(active.id, "task-two");
    }

    #[tokio::test]
    async fn switch_rejects_foreign_and_archived_targets() {
        let service = service().await;
        let other = service.create_context("other", None, None).await.unwrap();
        let err = service.switch_context("agent", &other.id).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let mine = service.create_context("agent", None, None).await.unwrap();
        service.archive_context(&mine.id).await.unwrap();
        let err = service.switch_context("agent", &mine.id).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn archived_contexts_ignore_saves() {
        let service = service().await;
        let context = service.create_context("agent", None, None).await.unwrap();
        service.archive_context(&context.id).await.unwrap();

        let mut stale = context.clone();
        stale.set_state("late", serde_json::json!(true));
        assert!(!service.save_context(stale).await.unwrap());

        let stored = service.load_context(&context.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContextStatus::Archived);
        assert!(stored.state.is_empty());
    }

    #[tokio::test]
    async fn save_is_last_writer_wins() {
        let service = service().await;
        let context = service.create_context("agent", None, None).await.unwrap();

        let mut first = context.clone();
        first.set_state("writer", serde_json::json!("first"));
        let mut second = context.clone();
        second.set_state("writer", serde_json::json!("second"));

        assert!(service.save_context(first).await.unwrap());
        assert!(service.save_context(second).await.unwrap());

        let stored = service.load_context(&context.id).await.unwrap().unwrap();
        assert_eq!(stored.state["writer"], serde_json::json!("second"));
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn checkpoints_are_capped_and_restorable() {
        let service = service_with(
            ContextConfig::builder().max_checkpoints(2).build(),
            ManualClock::default(),
        )
        .await;
        let context = service.create_context("agent", None, None).await.unwrap();

        for step in 0..3 {
            let mut current = service.load_context(&context.id).await.unwrap().unwrap();
            current.set_state("step", serde_json::json!(step));
            service.save_context(current).await.unwrap();
            service.checkpoint_context(&context.id).await.unwrap();
        }

        let stored = service.load_context(&context.id).await.unwrap().unwrap();
        assert_eq!(stored.checkpoints.len(), 2);
        assert_eq!(stored.checkpoints[0].state["step"], serde_json::json!(1));

        let restored = service.restore_checkpoint(&context.id, Some(0)).await.unwrap();
        assert_eq!(restored.state["step"], serde_json::json!(1));
        assert_eq!(restored.status, ContextStatus::Checkpointed);
    }

    #[tokio::test]
    async fn deleted_parent_leaves_child_orphaned() {
        let service = service().await;
        let parent = service.create_context("agent", None, None).await.unwrap();
        let child = service
            .create_context("agent", None, Some(parent.id.clone()))
            .await
            .unwrap();
        assert!(matches!(
            service.parent_of(&child.id).await.unwrap(),
            ParentLookup::Present(_)
        ));

        assert!(service.delete_context(&parent.id).await.unwrap());
        assert_eq!(
            service.parent_of(&child.id).await.unwrap(),
            ParentLookup::Orphaned(parent.id)
        );
    }

    #[tokio::test]
    async fn garbage_collection_spares_active_contexts() {
        let clock = ManualClock::default();
        let service = service_with(
            ContextConfig::builder()
                .retention(Duration::from_secs(24 * 3600))
                .build(),
            clock.clone(),
        )
        .await;
        let idle = service.create_context("agent", None, None).await.unwrap();
        let active = service.create_context("agent", None, None).await.unwrap();
        service.switch_context("agent", &active.id).await.unwrap();

        clock.advance(chrono::Duration::days(2));
        assert_eq!(service.collect_garbage().await.unwrap(), 1);
        assert!(service.load_context(&idle.id).await.unwrap().is_none());
        assert!(service.load_context(&active.id).await.unwrap().is_some());
    }
}
