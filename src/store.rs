//! Memory CRUD over the cache and the fallback chain.
//!
//! Every mutation of one memory runs under that memory's keyed lock: load (cache first),
//! check, write through the coordinator, refresh the cache, emit the event. Reads that
//! miss the cache fill it under the same lock.

use crate::backend::{MemoryFilter, SearchQuery};
use crate::cache::CacheLayer;
use crate::clock::Clock;
use crate::coordinator::FallbackChainCoordinator;
use crate::error::{MemoryError, Result};
use crate::events::{Event, EventBus};
use crate::locks::KeyedLocks;
use crate::types::{Memory, MemoryId, MemoryPatch};
use std::sync::Arc;

/// Memory store for CRUD and graph operations
#[derive(Clone)]
pub struct MemoryStore {
    coordinator: Arc<FallbackChainCoordinator>,
    cache: Arc<CacheLayer>,
    locks: Arc<KeyedLocks>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl MemoryStore {
    pub fn new(
        coordinator: Arc<FallbackChainCoordinator>,
        cache: Arc<CacheLayer>,
        locks: Arc<KeyedLocks>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            cache,
            locks,
            events,
            clock,
        }
    }

    pub fn coordinator(&self) -> &Arc<FallbackChainCoordinator> {
        &self.coordinator
    }

    /// Cache first, then the chain; fills the cache. Caller holds the id lock.
    async fn load_locked(&self, id: &str) -> Result<Option<Memory>> {
        if let Some(memory) = self.cache.get_memory(id) {
            return Ok(Some(memory));
        }
        let loaded = self.coordinator.get_memory(id).await?;
        if let Some(memory) = &loaded {
            self.cache.put_memory(memory.clone());
        }
        Ok(loaded)
    }

    async fn write_locked(&self, memory: &Memory) -> Result<()> {
        self.coordinator.put_memory(memory).await?;
        self.cache.put_memory(memory.clone());
        Ok(())
    }

    /// Persist a freshly materialized memory
    pub async fn save(&self, memory: Memory) -> Result<MemoryId> {
        let _guard = self.locks.lock(&memory.id).await;
        self.write_locked(&memory).await?;
        tracing::debug!(id = %memory.id, agent = %memory.agent_id, kind = %memory.kind, "memory stored");

        let id = memory.id.clone();
        self.events.emit(Event::MemoryStored {
            timestamp: memory.created_at,
            memory,
        });
        Ok(id)
    }

    /// Load a memory by ID, optionally recording the access.
    /// Tombstoned memories are returned as-is and never touched. A failed access
    /// write-back is logged and the memory returned as read.
    pub async fn load(&self, id: &str, track_access: bool) -> Result<Option<Memory>> {
        if !track_access {
            if let Some(memory) = self.cache.get_memory(id) {
                return Ok(Some(memory));
            }
        }

        let _guard = self.locks.lock(id).await;
        let Some(mut memory) = self.load_locked(id).await? else {
            return Ok(None);
        };
        if !track_access || memory.is_deleted() {
            return Ok(Some(memory));
        }

        let now = self.clock.now();
        let mut touched = memory.clone();
        touched.touch(now);
        if let Err(e) = self.write_locked(&touched).await {
            tracing::warn!(id, error = %e, "access tracking not persisted");
            return Ok(Some(memory));
        }
        memory = touched;
        self.events.emit(Event::MemoryAccessed {
            memory_id: memory.id.clone(),
            agent_id: memory.agent_id.clone(),
            access_count: memory.access_count,
            timestamp: now,
        });
        Ok(Some(memory))
    }

    /// Optimistic update. Returns the new version.
    pub async fn update(&self, id: &str, expected_version: u64, patch: MemoryPatch) -> Result<u64> {
        patch.validate()?;

        let _guard = self.locks.lock(id).await;
        let mut memory = self
            .load_locked(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("memory {id}")))?;
        if memory.is_deleted() {
            return Err(MemoryError::Validation(format!("memory {id} has been forgotten")));
        }
        if memory.version != expected_version {
            return Err(MemoryError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: memory.version,
            });
        }

        let previous_version = memory.version;
        patch.apply(&mut memory, self.clock.now());
        self.write_locked(&memory).await?;
        tracing::debug!(id, version = memory.version, "memory updated");

        let version = memory.version;
        self.events.emit(Event::MemoryUpdated {
            timestamp: memory.updated_at,
            memory,
            previous_version,
        });
        Ok(version)
    }

    /// Soft-forget. With `expected_version`, only a memory still at that version is
    /// tombstoned. Returns the tombstoned copy, or `None` when nothing changed.
    pub async fn tombstone(&self, id: &str, expected_version: Option<u64>) -> Result<Option<Memory>> {
        let _guard = self.locks.lock(id).await;
        let Some(mut memory) = self.load_locked(id).await? else {
            return Ok(None);
        };
        if memory.is_deleted() || expected_version.is_some_and(|v| v != memory.version) {
            return Ok(None);
        }

        let now = self.clock.now();
        memory.deleted_at = Some(now);
        memory.version += 1;
        memory.updated_at = now;
        self.coordinator.put_tombstone(&memory).await?;
        self.cache.put_memory(memory.clone());

        self.events.emit(Event::MemoryForgotten {
            memory_id: memory.id.clone(),
            agent_id: memory.agent_id.clone(),
            timestamp: now,
        });
        Ok(Some(memory))
    }

    /// Undo a tombstone (compression rollback). Returns whether the memory was revived.
    pub async fn revive(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let Some(mut memory) = self.load_locked(id).await? else {
            return Ok(false);
        };
        if !memory.is_deleted() {
            return Ok(false);
        }

        let previous_version = memory.version;
        let now = self.clock.now();
        memory.deleted_at = None;
        memory.version += 1;
        memory.updated_at = now;
        self.write_locked(&memory).await?;

        self.events.emit(Event::MemoryUpdated {
            memory,
            previous_version,
            timestamp: now,
        });
        Ok(true)
    }

    /// Physical removal from backends, cache and index. Returns whether it existed.
    pub async fn purge(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let agent_id = self
            .load_locked(id)
            .await?
            .map(|m| m.agent_id)
            .unwrap_or_default();

        let existed = self.coordinator.delete_memory(id).await?;
        self.cache.invalidate_memory(id);
        if existed {
            tracing::debug!(id, "memory purged");
            self.events.emit(Event::MemoryDeleted {
                memory_id: id.to_string(),
                agent_id,
                timestamp: self.clock.now(),
            });
        }
        Ok(existed)
    }

    pub async fn forget(&self, id: &str, hard: bool) -> Result<bool> {
        if hard {
            self.purge(id).await
        } else {
            Ok(self.tombstone(id, None).await?.is_some())
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<Memory>> {
        self.coordinator.search(query).await
    }

    pub async fn list(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        self.coordinator.list_memories(filter).await
    }

    pub async fn associated(&self, id: &str, max_depth: usize) -> Result<Vec<Memory>> {
        self.coordinator.associated(id, max_depth).await
    }
}
