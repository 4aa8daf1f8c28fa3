//! Embedding similarity index.
//!
//! A derived, rebuildable view over stored memories: one normalised vector per live
//! memory that has an embedding, grouped by agent. It is rebuilt from backend data at
//! startup and kept current by observing write events.

use crate::events::{Event, WriteObserver};
use crate::types::{AgentId, Memory, MemoryId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// What to compare against in `find_similar`
#[derive(Debug, Clone, PartialEq)]
pub enum SimilarityReference {
    /// A stored memory; searches its agent and excludes itself
    Memory(MemoryId),
    /// A raw vector scoped to an agent
    Vector { agent_id: AgentId, vector: Vec<f32> },
    /// Text embedded through the configured provider
    Text { agent_id: AgentId, text: String },
}

impl SimilarityReference {
    pub fn memory(id: impl Into<MemoryId>) -> Self {
        SimilarityReference::Memory(id.into())
    }

    pub fn vector(agent_id: impl Into<AgentId>, vector: Vec<f32>) -> Self {
        SimilarityReference::Vector {
            agent_id: agent_id.into(),
            vector,
        }
    }

    pub fn text(agent_id: impl Into<AgentId>, text: impl Into<String>) -> Self {
        SimilarityReference::Text {
            agent_id: agent_id.into(),
            text: text.into(),
        }
    }
}

/// Compute cosine similarity between two vectors.
/// Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone)]
struct IndexedVector {
    agent_id: AgentId,
    unit: Vec<f32>,
    importance: f32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<MemoryId, IndexedVector>,
    by_agent: HashMap<AgentId, HashSet<MemoryId>>,
}

impl IndexState {
    fn insert(&mut self, memory: &Memory) {
        self.remove(&memory.id);
        let Some(embedding) = &memory.embedding else {
            return;
        };
        if memory.is_deleted() {
            return;
        }
        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return;
        }

        self.by_agent
            .entry(memory.agent_id.clone())
            .or_default()
            .insert(memory.id.clone());
        self.entries.insert(
            memory.id.clone(),
            IndexedVector {
                agent_id: memory.agent_id.clone(),
                unit: embedding.iter().map(|v| v / norm).collect(),
                importance: memory.importance,
                created_at: memory.created_at,
            },
        );
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        if let Some(ids) = self.by_agent.get_mut(&entry.agent_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_agent.remove(&entry.agent_id);
            }
        }
        true
    }
}

/// Per-agent nearest-neighbour index (exact scan)
#[derive(Debug, Default)]
pub struct SimilarityIndex {
    state: RwLock<IndexState>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index with the given memories
    pub fn rebuild<I>(&self, memories: I) -> usize
    where
        I: IntoIterator<Item = Memory>,
    {
        let mut fresh = IndexState::default();
        for memory in memories {
            fresh.insert(&memory);
        }
        let indexed = fresh.entries.len();
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        tracing::info!(indexed, "similarity index rebuilt");
        indexed
    }

    pub fn upsert(&self, memory: &Memory) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(memory);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every indexed memory of `agent_id` with similarity >= `threshold`, ordered by
    /// similarity desc, importance desc, created_at desc, id asc.
    pub fn query(
        &self,
        agent_id: &str,
        vector: &[f32],
        threshold: f32,
        exclude: Option<&str>,
    ) -> Vec<(MemoryId, f32)> {
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Vec::new();
        }

        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let Some(ids) = state.by_agent.get(agent_id) else {
            return Vec::new();
        };

        let mut hits: Vec<(&MemoryId, &IndexedVector, f32)> = ids
            .iter()
            .filter(|id| exclude != Some(id.as_str()))
            .filter_map(|id| {
                let entry = state.entries.get(id)?;
                if entry.unit.len() != vector.len() {
                    return None;
                }
                let dot: f32 = entry.unit.iter().zip(vector).map(|(a, b)| a * b).sum();
                let score = (dot / norm).clamp(-1.0, 1.0);
                (score >= threshold).then_some((id, entry, score))
            })
            .collect();

        hits.sort_by(|(id_a, a, sa), (id_b, b, sb)| {
            sb.total_cmp(sa)
                .then(b.importance.total_cmp(&a.importance))
                .then(b.created_at.cmp(&a.created_at))
                .then(id_a.cmp(id_b))
        });
        hits.into_iter().map(|(id, _, score)| (id.clone(), score)).collect()
    }
}

impl WriteObserver for SimilarityIndex {
    fn on_event(&self, event: &Event) {
        match event {
            Event::MemoryStored { memory, .. } | Event::MemoryUpdated { memory, .. } => {
                self.upsert(memory)
            }
            Event::MemoryForgotten { memory_id, .. } | Event::MemoryDeleted { memory_id, .. } => {
                self.remove(memory_id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryKind, NewMemory};
    use chrono::Duration;

    fn with_vector(agent: &str, vector: Vec<f32>, importance: f32) -> Memory {
        NewMemory::new(agent, MemoryKind::Semantic, "v")
            .with_embedding(vector)
            .with_importance(importance)
            .into_memory(Utc::now())
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &[1.0, 0.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn query_applies_threshold_and_tie_breaks() {
        let index = SimilarityIndex::new();
        let exact_low = with_vector("a", vec![1.0, 0.0], 0.2);
        let exact_high = with_vector("a", vec![2.0, 0.0], 0.8);
        let mut exact_high_newer = with_vector("a", vec![3.0, 0.0], 0.8);
        exact_high_newer.created_at = exact_high.created_at + Duration::seconds(1);
        let far = with_vector("a", vec![0.0, 1.0], 0.9);
        let other_agent = with_vector("b", vec![1.0, 0.0], 0.9);
        for m in [&exact_low, &exact_high, &exact_high_newer, &far, &other_agent] {
            index.upsert(m);
        }

        let hits = index.query("a", &[1.0, 0.0], 0.5, None);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec![exact_high_newer.id.as_str(), exact_high.id.as_str(), exact_low.id.as_str()]);
        assert!(hits.iter().all(|(_, s)| *s >= 0.5));

        let excluding = index.query("a", &[1.0, 0.0], 0.5, Some(&exact_high.id));
        assert_eq!(excluding.len(), 2);
    }

    #[test]
    fn events_keep_the_index_current() {
        let index = SimilarityIndex::new();
        let mut memory = with_vector("a", vec![0.5, 0.5], 0.5);
        index.on_event(&Event::MemoryStored {
            memory: memory.clone(),
            timestamp: Utc::now(),
        });
        assert!(index.contains(&memory.id));

        memory.deleted_at = Some(Utc::now());
        index.on_event(&Event::MemoryUpdated {
            memory: memory.clone(),
            previous_version: 1,
            timestamp: Utc::now(),
        });
        assert!(!index.contains(&memory.id));

        memory.deleted_at = None;
        index.upsert(&memory);
        index.on_event(&Event::MemoryDeleted {
            memory_id: memory.id.clone(),
            agent_id: "a".into(),
            timestamp: Utc::now(),
        });
        assert!(index.is_empty());
    }

    #[test]
    fn rebuild_skips_tombstones_and_missing_vectors() {
        let index = SimilarityIndex::new();
        let live = with_vector("a", vec![1.0], 0.5);
        let mut dead = with_vector("a", vec![1.0], 0.5);
        dead.deleted_at = Some(Utc::now());
        let plain = NewMemory::new("a", MemoryKind::Working, "no vector").into_memory(Utc::now());

        assert_eq!(index.rebuild(vec![live, dead, plain]), 1);
    }
}
