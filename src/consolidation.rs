//! Consolidation: decay, pruning and compression of stored memories.
//!
//! One pass runs in four stages:
//!
//! 1. **Decay** - live memories not accessed within the retention window whose effective
//!    importance fell below the floor are tombstoned.
//! 2. **Purge** - tombstones older than the grace period are hard-deleted.
//! 3. **Compress** - clusters of near-duplicate, low-importance memories of one agent and
//!    kind are replaced by a summary memory that associates the originals.
//! 4. **Context GC** - stale contexts nobody has active are collected.
//!
//! Passes run on a schedule, early after a number of writes, or on demand; they never
//! overlap.

use crate::backend::MemoryFilter;
use crate::clock::Clock;
use crate::context::ContextManager;
use crate::error::{MemoryError, Result};
use crate::events::{Event, EventBus, WriteObserver};
use crate::similarity::cosine_similarity;
use crate::store::MemoryStore;
use crate::types::{AgentId, Memory, MemoryId, MemoryKind, NewMemory};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Longest summary content; originals beyond it are only referenced by association
const MAX_SUMMARY_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Memories accessed more recently than this are never decayed away
    pub retention_window: Duration,
    /// Effective importance below which a memory is tombstoned
    pub importance_floor: f32,
    /// Age after which a tombstone is purged
    pub tombstone_grace: Duration,
    pub enable_compression: bool,
    /// Cosine similarity needed to join a cluster
    pub compression_threshold: f32,
    pub min_cluster_size: usize,
    /// Only memories at or below this effective importance are compressed
    pub compression_max_importance: f32,
    pub interval: Duration,
    /// Run early after this many stored or updated memories
    pub write_trigger: Option<u64>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            retention_window: Duration::from_secs(7 * 24 * 3600),
            importance_floor: 0.1,
            tombstone_grace: Duration::from_secs(30 * 24 * 3600),
            enable_compression: true,
            compression_threshold: 0.95,
            min_cluster_size: 3,
            compression_max_importance: 0.3,
            interval: Duration::from_secs(3600),
            write_trigger: None,
        }
    }
}

impl ConsolidationConfig {
    pub fn builder() -> ConsolidationConfigBuilder {
        ConsolidationConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConsolidationConfigBuilder {
    config: ConsolidationConfig,
}

impl ConsolidationConfigBuilder {
    pub fn retention_window(mut self, window: Duration) -> Self {
        self.config.retention_window = window;
        self
    }

    pub fn importance_floor(mut self, floor: f32) -> Self {
        self.config.importance_floor = floor.clamp(0.0, 1.0);
        self
    }

    pub fn tombstone_grace(mut self, grace: Duration) -> Self {
        self.config.tombstone_grace = grace;
        self
    }

    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.config.enable_compression = enabled;
        self
    }

    pub fn compression_threshold(mut self, threshold: f32) -> Self {
        self.config.compression_threshold = threshold.clamp(-1.0, 1.0);
        self
    }

    pub fn min_cluster_size(mut self, size: usize) -> Self {
        self.config.min_cluster_size = size.max(2);
        self
    }

    pub fn compression_max_importance(mut self, importance: f32) -> Self {
        self.config.compression_max_importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn write_trigger(mut self, writes: u64) -> Self {
        self.config.write_trigger = (writes > 0).then_some(writes);
        self
    }

    pub fn build(self) -> ConsolidationConfig {
        self.config
    }
}

/// Outcome of one consolidation pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsolidationReport {
    /// Memories examined
    pub checked: usize,
    /// Memories soft-forgotten by decay
    pub tombstoned: usize,
    /// Tombstones hard-deleted after the grace period
    pub purged: usize,
    /// Summary memories created
    pub summaries: usize,
    /// Originals tombstoned into summaries
    pub compressed: usize,
    /// Clusters abandoned or rolled back
    pub clusters_abandoned: usize,
    pub contexts_collected: usize,
    /// Per-memory failures; a pass keeps going past them
    pub errors: usize,
    pub duration_ms: u64,
}

/// Counts writes and wakes the scheduler once the trigger is reached
#[derive(Debug, Default)]
struct WriteCounter {
    writes: AtomicU64,
    threshold: Option<u64>,
    notify: Notify,
}

impl WriteObserver for WriteCounter {
    fn on_event(&self, event: &Event) {
        let Some(threshold) = self.threshold else {
            return;
        };
        if matches!(event, Event::MemoryStored { .. } | Event::MemoryUpdated { .. }) {
            let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
            if writes == threshold {
                self.notify.notify_one();
            }
        }
    }
}

pub struct ConsolidationEngine {
    store: MemoryStore,
    contexts: Arc<ContextManager>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: ConsolidationConfig,
    counter: Arc<WriteCounter>,
    running: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ConsolidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationEngine")
            .field("config", &self.config)
            .finish()
    }
}

/// Summary candidate grouped for clustering
#[derive(Debug, Clone)]
struct Candidate {
    id: MemoryId,
    version: u64,
    vector: Vec<f32>,
}

impl ConsolidationEngine {
    pub fn new(
        store: MemoryStore,
        contexts: Arc<ContextManager>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: ConsolidationConfig,
    ) -> Self {
        let counter = Arc::new(WriteCounter {
            threshold: config.write_trigger,
            ..WriteCounter::default()
        });
        events.register_observer(counter.clone());
        Self {
            store,
            contexts,
            events,
            clock,
            config,
            counter,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Run one full pass at the clock's current time
    pub async fn run(&self) -> Result<ConsolidationReport> {
        let _running = self.running.lock().await;
        self.counter.writes.store(0, Ordering::Relaxed);

        let started = Instant::now();
        let now = self.clock.now();
        let mut report = ConsolidationReport::default();

        let memories = self.store.list(&MemoryFilter::all()).await?;
        report.checked = memories.len();

        self.decay(&memories, now, &mut report).await;
        self.purge(&memories, now, &mut report).await;
        if self.config.enable_compression {
            self.compress(&memories, now, &mut report).await;
        }
        report.contexts_collected = self.contexts.collect_garbage(now).await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            checked = report.checked,
            tombstoned = report.tombstoned,
            purged = report.purged,
            compressed = report.compressed,
            summaries = report.summaries,
            contexts = report.contexts_collected,
            errors = report.errors,
            duration_ms = report.duration_ms,
            "consolidation pass complete"
        );
        self.events.emit(Event::ConsolidationCompleted {
            tombstoned: report.tombstoned,
            purged: report.purged,
            compressed: report.compressed,
            contexts_collected: report.contexts_collected,
            duration_ms: report.duration_ms,
            timestamp: self.clock.now(),
        });
        Ok(report)
    }

    fn is_stale(&self, memory: &Memory, now: DateTime<Utc>) -> bool {
        (now - memory.accessed_at)
            .to_std()
            .is_ok_and(|idle| idle >= self.config.retention_window)
    }

    async fn decay(&self, memories: &[Memory], now: DateTime<Utc>, report: &mut ConsolidationReport) {
        for memory in memories.iter().filter(|m| !m.is_deleted()) {
            if !self.is_stale(memory, now) {
                continue;
            }
            let effective = memory.effective_importance(now);
            if effective >= self.config.importance_floor {
                continue;
            }
            // Version-guarded: a memory touched since the listing is left alone.
            match self.store.tombstone(&memory.id, Some(memory.version)).await {
                Ok(Some(_)) => {
                    tracing::debug!(id = %memory.id, effective, "memory decayed below floor");
                    report.tombstoned += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(id = %memory.id, error = %e, "decay tombstone failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn purge(&self, memories: &[Memory], now: DateTime<Utc>, report: &mut ConsolidationReport) {
        for memory in memories {
            let Some(deleted_at) = memory.deleted_at else {
                continue;
            };
            let expired = (now - deleted_at)
                .to_std()
                .is_ok_and(|age| age >= self.config.tombstone_grace);
            if !expired {
                continue;
            }
            match self.store.purge(&memory.id).await {
                Ok(true) => report.purged += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(id = %memory.id, error = %e, "tombstone purge failed");
                    report.errors += 1;
                }
            }
        }
    }

    /// Greedy single-link clusters around the oldest unassigned member. Only memories
    /// idle for the whole retention window are candidates.
    fn clusters(&self, memories: &[Memory], now: DateTime<Utc>) -> Vec<Vec<Candidate>> {
        let mut groups: BTreeMap<(AgentId, MemoryKind), Vec<&Memory>> = BTreeMap::new();
        for memory in memories {
            if memory.is_deleted()
                || !self.is_stale(memory, now)
                || memory.embedding.is_none()
                || memory.effective_importance(now) > self.config.compression_max_importance
            {
                continue;
            }
            groups
                .entry((memory.agent_id.clone(), memory.kind))
                .or_default()
                .push(memory);
        }

        let mut clusters = Vec::new();
        for (_, mut members) in groups {
            members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            let mut assigned: HashSet<MemoryId> = HashSet::new();

            for (i, seed) in members.iter().enumerate() {
                if assigned.contains(&seed.id) {
                    continue;
                }
                let Some(seed_vector) = &seed.embedding else {
                    continue;
                };
                let mut cluster = vec![*seed];
                for other in &members[i + 1..] {
                    if assigned.contains(&other.id) {
                        continue;
                    }
                    let similar = other.embedding.as_deref().is_some_and(|v| {
                        cosine_similarity(seed_vector, v) >= self.config.compression_threshold
                    });
                    if similar {
                        cluster.push(*other);
                    }
                }
                if cluster.len() >= self.config.min_cluster_size {
                    assigned.extend(cluster.iter().map(|m| m.id.clone()));
                    clusters.push(
                        cluster
                            .into_iter()
                            .map(|m| Candidate {
                                id: m.id.clone(),
                                version: m.version,
                                vector: m.embedding.clone().unwrap_or_default(),
                            })
                            .collect(),
                    );
                }
            }
        }
        clusters
    }

    async fn compress(&self, memories: &[Memory], now: DateTime<Utc>, report: &mut ConsolidationReport) {
        for cluster in self.clusters(memories, now) {
            match self.compress_cluster(cluster).await {
                Ok(Some(compressed)) => {
                    report.summaries += 1;
                    report.compressed += compressed;
                }
                Ok(None) => report.clusters_abandoned += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "cluster compression rolled back");
                    report.clusters_abandoned += 1;
                    report.errors += 1;
                }
            }
        }
    }

    /// Summary created and every original tombstoned, or neither.
    /// Returns the number of originals folded in, `None` when abandoned.
    async fn compress_cluster(&self, cluster: Vec<Candidate>) -> Result<Option<usize>> {
        // Re-read: originals deleted since the listing drop out of the cluster.
        let mut originals: Vec<(Memory, Vec<f32>)> = Vec::with_capacity(cluster.len());
        for candidate in cluster {
            match self.store.load(&candidate.id, false).await? {
                Some(memory) if !memory.is_deleted() && memory.version == candidate.version => {
                    originals.push((memory, candidate.vector));
                }
                _ => tracing::debug!(id = %candidate.id, "cluster member changed, skipped"),
            }
        }
        if originals.len() < self.config.min_cluster_size {
            return Ok(None);
        }

        let summary = self.summarize(&originals);
        let summary_id = self.store.save(summary).await?;

        let mut tombstoned: Vec<MemoryId> = Vec::with_capacity(originals.len());
        for (original, _) in &originals {
            let outcome = self.store.tombstone(&original.id, Some(original.version)).await;
            let failure = match outcome {
                Ok(Some(_)) => {
                    tombstoned.push(original.id.clone());
                    continue;
                }
                Ok(None) => match self.store.load(&original.id, false).await {
                    // Deleted concurrently: counts as already tombstoned.
                    Ok(None) => continue,
                    Ok(Some(m)) if m.is_deleted() => continue,
                    Ok(Some(m)) => MemoryError::VersionConflict {
                        id: original.id.clone(),
                        expected: original.version,
                        actual: m.version,
                    },
                    Err(e) => e,
                },
                Err(e) => e,
            };
            self.rollback(&summary_id, &tombstoned).await;
            return Err(failure);
        }

        tracing::debug!(summary = %summary_id, originals = tombstoned.len(), "cluster compressed");
        Ok(Some(tombstoned.len()))
    }

    async fn rollback(&self, summary_id: &str, tombstoned: &[MemoryId]) {
        for id in tombstoned {
            if let Err(e) = self.store.revive(id).await {
                tracing::error!(id = %id, error = %e, "failed to revive memory during rollback");
            }
        }
        if let Err(e) = self.store.purge(summary_id).await {
            tracing::error!(id = summary_id, error = %e, "failed to remove summary during rollback");
        }
    }

    fn summarize(&self, originals: &[(Memory, Vec<f32>)]) -> Memory {
        let first = &originals[0].0;

        let mut content = format!("Summary of {} related memories:", originals.len());
        for (memory, _) in originals {
            if content.len() + memory.content.len() + 3 > MAX_SUMMARY_CHARS {
                content.push_str("\n- ...");
                break;
            }
            content.push_str("\n- ");
            content.push_str(&memory.content);
        }

        let dimension = originals[0].1.len();
        let mut centroid = vec![0.0f32; dimension];
        for (_, vector) in originals.iter().filter(|(_, v)| v.len() == dimension) {
            for (c, v) in centroid.iter_mut().zip(vector) {
                *c += v;
            }
        }
        let norm = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            centroid.iter_mut().for_each(|c| *c /= norm);
        }

        let importance = originals
            .iter()
            .map(|(m, _)| m.importance)
            .fold(0.0f32, f32::max);
        let mut summary = NewMemory::new(first.agent_id.clone(), first.kind, content)
            .with_importance(importance)
            .with_decay_rate(first.decay_rate)
            .with_embedding(centroid)
            .with_tag("summary");
        for (memory, _) in originals {
            summary = summary.with_association(memory.id.clone(), 1.0);
            for tag in &memory.tags {
                summary = summary.with_tag(tag.clone());
            }
        }
        summary.into_memory(self.clock.now())
    }

    /// Scheduler: one pass per interval, or early when the write trigger fires
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            tracing::info!(interval_secs = self.config.interval.as_secs(), "consolidation scheduler started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                    _ = self.counter.notify.notified() => {
                        tracing::debug!("write trigger reached");
                    }
                }
                if let Err(e) = self.run().await {
                    tracing::error!(error = %e, "consolidation pass failed");
                }
            }
            tracing::info!("consolidation scheduler stopped");
        })
    }
}
