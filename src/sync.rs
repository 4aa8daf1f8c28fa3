//! Sync-back of writes served by a lower-priority backend.
//!
//! When a mutation lands on a backend below the top of the chain, or a delete or
//! tombstone could not reach every backend, the entity is marked pending and a task is
//! queued for the worker. The worker replays the source copy into each lagging backend
//! once that backend is Healthy, settling targets one by one. While the source itself
//! is not Healthy the task stays parked.

use crate::coordinator::FallbackChainCoordinator;
use crate::health::HealthSnapshot;
use crate::types::{ContextId, MemoryId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Identity of a replicated entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Memory(MemoryId),
    Context(ContextId),
}

impl EntityKey {
    pub fn id(&self) -> &str {
        match self {
            EntityKey::Memory(id) | EntityKey::Context(id) => id,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::Memory(id) => write!(f, "memory:{id}"),
            EntityKey::Context(id) => write!(f, "context:{id}"),
        }
    }
}

/// What the authoritative copy went through, so lagging backends can be masked while
/// their own copy is still stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Written,
    Tombstoned { version: u64, at: DateTime<Utc> },
    Removed,
}

/// One entity whose copies disagree across the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Backend holding the newest copy
    pub source: usize,
    /// Backends that still need the source's copy replayed into them
    pub targets: BTreeSet<usize>,
    pub change: Change,
    /// Bumped on every write so a replay never settles a newer change
    pub generation: u64,
    /// The worker gave up; the entry still routes reads but no longer pins the cache
    pub abandoned: bool,
}

/// Entities whose copies disagree across the chain. Shared by the coordinator (read
/// routing and masking), the cache (eviction pins) and the worker.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: Mutex<HashMap<EntityKey, PendingEntry>>,
    generations: AtomicU64,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<EntityKey, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a mutation served by `source`. Every backend above it, every backend in
    /// `lagging`, and whatever lagged behind the previous change become replay targets.
    pub fn record(&self, key: EntityKey, source: usize, lagging: impl IntoIterator<Item = usize>, change: Change) {
        let mut entries = self.entries();
        let mut targets = BTreeSet::new();
        if let Some(previous) = entries.get(&key) {
            targets.extend(previous.targets.iter().copied());
            targets.insert(previous.source);
        }
        targets.extend(0..source);
        targets.extend(lagging);
        targets.remove(&source);

        if targets.is_empty() {
            entries.remove(&key);
            return;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        entries.insert(
            key,
            PendingEntry {
                source,
                targets,
                change,
                generation,
                abandoned: false,
            },
        );
    }

    /// Record a plain write that landed on `source`
    pub fn mark(&self, key: EntityKey, source: usize) {
        self.record(key, source, [], Change::Written);
    }

    pub fn get(&self, key: &EntityKey) -> Option<PendingEntry> {
        self.entries().get(key).cloned()
    }

    pub fn source_of(&self, key: &EntityKey) -> Option<usize> {
        self.entries().get(key).map(|e| e.source)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries().contains_key(key)
    }

    /// Whether the cache must keep this entity resident
    pub fn is_pinned(&self, key: &EntityKey) -> bool {
        self.entries().get(key).is_some_and(|e| !e.abandoned)
    }

    /// The change a copy served by `index` is known to be missing
    pub fn lagging_at(&self, key: &EntityKey, index: usize) -> Option<Change> {
        self.entries()
            .get(key)
            .filter(|e| e.targets.contains(&index))
            .map(|e| e.change)
    }

    /// Drop `target` after a successful replay, unless a newer change arrived meanwhile.
    /// Returns whether the entity is fully settled.
    pub fn settle(&self, key: &EntityKey, source: usize, generation: u64, target: usize) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return true;
        };
        if entry.source != source || entry.generation != generation {
            return false;
        }
        entry.targets.remove(&target);
        if entry.targets.is_empty() {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    pub fn abandon(&self, key: &EntityKey) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.abandoned = true;
        }
    }

    /// Forget the entry regardless of its targets
    pub fn clear(&self, key: &EntityKey) {
        self.entries().remove(key);
    }

    pub fn snapshot(&self) -> Vec<(EntityKey, usize)> {
        let mut all: Vec<_> = self.entries().iter().map(|(k, e)| (k.clone(), e.source)).collect();
        all.sort();
        all
    }

    pub fn memory_entries(&self) -> Vec<(MemoryId, PendingEntry)> {
        self.entries()
            .iter()
            .filter_map(|(k, e)| match k {
                EntityKey::Memory(id) => Some((id.clone(), e.clone())),
                EntityKey::Context(_) => None,
            })
            .collect()
    }

    pub fn context_entries(&self) -> Vec<(ContextId, PendingEntry)> {
        self.entries()
            .iter()
            .filter_map(|(k, e)| match k {
                EntityKey::Context(id) => Some((id.clone(), e.clone())),
                EntityKey::Memory(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of replaying one entity into one target backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The source copy was written to the target
    Applied,
    /// The target already held the same or a newer copy
    Skipped,
    /// The entity is gone from the source, so it was removed from the target
    Deleted,
}

/// Unit of work for the sync-back worker
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub key: EntityKey,
    pub source: usize,
    pub attempts: u32,
    not_before: Instant,
    /// Waiting for its source or a target backend to become Healthy
    parked: bool,
}

impl SyncTask {
    pub fn new(key: EntityKey, source: usize) -> Self {
        Self {
            key,
            source,
            attempts: 0,
            not_before: Instant::now(),
            parked: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bounded queue between the write path and the worker
    pub queue_capacity: usize,
    /// Replay attempts before a task is dropped
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Delay before attempt number `attempts + 1`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.config.base_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

enum TaskResult {
    Done,
    /// A newer change arrived mid-replay
    Requeue,
    Parked,
    Failed(String),
    Obsolete,
}

/// Background worker replaying pending entities upward
pub struct SyncBackWorker {
    coordinator: Arc<FallbackChainCoordinator>,
    config: SyncConfig,
    rx: mpsc::Receiver<SyncTask>,
    health: watch::Receiver<Arc<HealthSnapshot>>,
    shutdown: watch::Receiver<bool>,
    /// One task per entity; later enqueues for the same key coalesce here
    waiting: HashMap<EntityKey, SyncTask>,
}

impl SyncBackWorker {
    pub fn new(
        coordinator: Arc<FallbackChainCoordinator>,
        config: SyncConfig,
        rx: mpsc::Receiver<SyncTask>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let health = coordinator.health().subscribe();
        Self {
            coordinator,
            config,
            rx,
            health,
            shutdown,
            waiting: HashMap::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        tracing::info!("sync-back worker started");
        // Entities left pending by a previous worker (or dropped on a full queue).
        self.rescan();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.drain_ready().await;

            let next_due = self
                .waiting
                .values()
                .filter(|t| !t.parked)
                .map(|t| t.not_before)
                .min();
            let wake = async move {
                match next_due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                task = self.rx.recv() => match task {
                    Some(task) => self.admit(task),
                    None => break,
                },
                changed = self.health.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.health.borrow_and_update();
                    self.unpark_all();
                    self.rescan();
                }
                _ = wake => {}
            }
        }

        tracing::info!(left = self.waiting.len(), "sync-back worker stopped");
    }

    fn admit(&mut self, task: SyncTask) {
        match self.waiting.get_mut(&task.key) {
            Some(existing) => {
                existing.source = task.source;
                existing.parked = false;
                existing.not_before = existing.not_before.min(Instant::now());
            }
            None => {
                self.waiting.insert(task.key.clone(), task);
            }
        }
    }

    fn unpark_all(&mut self) {
        let now = Instant::now();
        for task in self.waiting.values_mut().filter(|t| t.parked) {
            task.parked = false;
            task.not_before = now;
        }
    }

    fn rescan(&mut self) {
        for (key, source) in self.coordinator.pending().snapshot() {
            self.waiting
                .entry(key.clone())
                .or_insert_with(|| SyncTask::new(key, source));
        }
    }

    async fn drain_ready(&mut self) {
        let now = Instant::now();
        let mut ready: Vec<EntityKey> = self
            .waiting
            .values()
            .filter(|t| !t.parked && t.not_before <= now)
            .map(|t| t.key.clone())
            .collect();
        ready.sort();

        for key in ready {
            let Some(mut task) = self.waiting.remove(&key) else {
                continue;
            };
            match self.process(&mut task).await {
                TaskResult::Done => {
                    tracing::debug!(entity = %task.key, source = task.source, "sync-back complete");
                }
                TaskResult::Obsolete => {}
                TaskResult::Requeue => {
                    task.not_before = Instant::now();
                    self.waiting.insert(key, task);
                }
                TaskResult::Parked => {
                    task.parked = true;
                    self.waiting.insert(key, task);
                }
                TaskResult::Failed(error) => {
                    task.attempts += 1;
                    if task.attempts >= self.config.max_attempts {
                        tracing::error!(
                            entity = %task.key,
                            attempts = task.attempts,
                            %error,
                            "sync-back abandoned; entity stays readable from its serving backend"
                        );
                        self.coordinator.pending().abandon(&task.key);
                        continue;
                    }
                    let delay = self.config.backoff(task.attempts);
                    tracing::warn!(
                        entity = %task.key,
                        attempt = task.attempts,
                        retry_in = ?delay,
                        %error,
                        "sync-back replay failed"
                    );
                    task.not_before = Instant::now() + delay;
                    self.waiting.insert(key, task);
                }
            }
        }
    }

    async fn process(&self, task: &mut SyncTask) -> TaskResult {
        // A newer write may have moved (or cleared) the authoritative copy.
        let Some(entry) = self.coordinator.pending().get(&task.key) else {
            return TaskResult::Obsolete;
        };
        task.source = entry.source;

        let snapshot = self.coordinator.health().snapshot();
        if !snapshot.is_healthy(entry.source) {
            return TaskResult::Parked;
        }
        let mut blocked = false;
        for target in entry.targets.iter().copied() {
            if !snapshot.is_healthy(target) {
                blocked = true;
                continue;
            }
            match self.coordinator.replay(&task.key, entry.source, target).await {
                Ok(outcome) => {
                    tracing::debug!(
                        entity = %task.key,
                        source = entry.source,
                        target_index = target,
                        ?outcome,
                        "replayed"
                    );
                    self.coordinator
                        .pending()
                        .settle(&task.key, entry.source, entry.generation, target);
                }
                Err(e) => return TaskResult::Failed(e.to_string()),
            }
        }

        if blocked {
            TaskResult::Parked
        } else if self.coordinator.pending().contains(&task.key) {
            TaskResult::Requeue
        } else {
            TaskResult::Done
        }
    }
}
