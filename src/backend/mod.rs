//! Storage backend contract and its four implementations

pub mod flatfile;
pub mod graph;
pub mod memory;
pub mod relational;

pub use flatfile::FlatFileBackend;
pub use graph::GraphBackend;
pub use memory::InMemoryBackend;
pub use relational::RelationalBackend;

use crate::error::{MemoryError, Result};
use crate::types::{AgentId, Context, Memory, MemoryKind};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::PathBuf;

/// Storage engine family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Graph,
    Relational,
    FlatFile,
    InMemory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Graph => write!(f, "graph"),
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::FlatFile => write!(f, "flatfile"),
            BackendKind::InMemory => write!(f, "in_memory"),
        }
    }
}

/// Selection of memories for bulk listing
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub agent_id: Option<AgentId>,
    pub kind: Option<MemoryKind>,
    pub include_deleted: bool,
}

impl MemoryFilter {
    pub fn all() -> Self {
        Self {
            include_deleted: true,
            ..Self::default()
        }
    }

    pub fn live_for(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, memory: &Memory) -> bool {
        if !self.include_deleted && memory.is_deleted() {
            return false;
        }
        if let Some(agent_id) = &self.agent_id {
            if &memory.agent_id != agent_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if memory.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Text query over one agent's memories
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub agent_id: AgentId,
    pub text: String,
    pub kind: Option<MemoryKind>,
    pub limit: usize,
    pub include_deleted: bool,
}

impl SearchQuery {
    pub fn new(agent_id: impl Into<AgentId>, text: impl Into<String>, limit: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            text: text.into(),
            kind: None,
            limit,
            include_deleted: false,
        }
    }

    pub fn with_kind(mut self, kind: Option<MemoryKind>) -> Self {
        self.kind = kind;
        self
    }

    pub fn filter(&self) -> MemoryFilter {
        MemoryFilter {
            agent_id: Some(self.agent_id.clone()),
            kind: self.kind,
            include_deleted: self.include_deleted,
        }
    }
}

/// Rank candidate memories against a text query.
///
/// Every backend funnels its search through this so that the same data yields the same
/// ordering regardless of which backend served it: text score desc, importance desc,
/// created_at desc, id asc.
pub fn rank_matches(candidates: Vec<Memory>, query: &SearchQuery) -> Vec<Memory> {
    let filter = query.filter();
    let mut scored: Vec<(f32, Memory)> = candidates
        .into_iter()
        .filter(|m| filter.matches(m))
        .map(|m| (m.text_score(&query.text), m))
        .filter(|(score, _)| *score > 0.0)
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.total_cmp(sa)
            .then(b.importance.total_cmp(&a.importance))
            .then(b.created_at.cmp(&a.created_at))
            .then(a.id.cmp(&b.id))
    });
    scored.truncate(query.limit);
    scored.into_iter().map(|(_, m)| m).collect()
}

/// Storage backend trait - uniform persistence contract over memories and contexts.
///
/// Writes are unconditional upserts; version checks happen above this layer.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable name used in logs and health records
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Lightweight liveness check
    async fn ping(&self) -> Result<()>;

    async fn put_memory(&self, memory: &Memory) -> Result<()>;
    async fn get_memory(&self, id: &str) -> Result<Option<Memory>>;
    /// Physically remove a memory. Returns whether it existed.
    async fn delete_memory(&self, id: &str) -> Result<bool>;
    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Memory>> {
        let candidates = self.list_memories(&query.filter()).await?;
        Ok(rank_matches(candidates, query))
    }

    /// Breadth-first walk over outgoing associations, excluding the start memory and
    /// tombstoned or dangling targets. Depth 1 is direct neighbours.
    async fn associated(&self, id: &str, max_depth: usize) -> Result<Vec<Memory>> {
        let Some(start) = self.get_memory(id).await? else {
            return Ok(Vec::new());
        };

        let mut visited: HashSet<String> = HashSet::from([start.id.clone()]);
        let mut queue: VecDeque<(Memory, usize)> = VecDeque::from([(start, 0)]);
        let mut found = Vec::new();

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for target in node.association_targets() {
                if !visited.insert(target.to_string()) {
                    continue;
                }
                if let Some(next) = self.get_memory(target).await? {
                    if next.is_deleted() {
                        continue;
                    }
                    found.push(next.clone());
                    queue.push_back((next, depth + 1));
                }
            }
        }

        Ok(found)
    }

    async fn put_context(&self, context: &Context) -> Result<()>;
    async fn get_context(&self, id: &str) -> Result<Option<Context>>;
    async fn delete_context(&self, id: &str) -> Result<bool>;
    async fn list_contexts(&self, agent_id: Option<&str>) -> Result<Vec<Context>>;

    /// Release pooled resources and flush pending state
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Warnings raised while loading persisted data (e.g. corruption recovery).
    /// Draining clears them.
    fn drain_warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backend({})", self.name())
    }
}

/// Replace a file atomically (temp file in the same directory, then rename).
/// Empty contents remove the file instead.
pub(crate) async fn write_atomic(path: PathBuf, contents: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path.parent().ok_or_else(|| {
            MemoryError::Configuration(format!("no parent directory for {}", path.display()))
        })?;
        std::fs::create_dir_all(dir)?;

        if contents.is_empty() {
            return match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| MemoryError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| MemoryError::Other(e.into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewMemory;
    use chrono::{Duration, Utc};

    #[test]
    fn rank_orders_by_score_then_importance_then_recency() {
        let now = Utc::now();
        let strong = NewMemory::new("a", MemoryKind::Semantic, "rust borrow checker")
            .with_importance(0.2)
            .into_memory(now);
        let weak_old = NewMemory::new("a", MemoryKind::Semantic, "rust macros")
            .with_importance(0.5)
            .into_memory(now);
        let weak_new = NewMemory::new("a", MemoryKind::Semantic, "rust traits")
            .with_importance(0.5)
            .into_memory(now + Duration::seconds(1));
        let other_agent = NewMemory::new("b", MemoryKind::Semantic, "rust borrow")
            .into_memory(now);

        let ranked = rank_matches(
            vec![weak_old.clone(), other_agent, strong.clone(), weak_new.clone()],
            &SearchQuery::new("a", "rust borrow", 10),
        );

        let ids: Vec<_> = ranked.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![strong.id, weak_new.id, weak_old.id]);
    }

    #[test]
    fn rank_skips_tombstones_unless_asked() {
        let mut memory = NewMemory::new("a", MemoryKind::Working, "scratch").into_memory(Utc::now());
        memory.deleted_at = Some(Utc::now());

        let query = SearchQuery::new("a", "scratch", 10);
        assert!(rank_matches(vec![memory.clone()], &query).is_empty());

        let mut with_deleted = query.clone();
        with_deleted.include_deleted = true;
        assert_eq!(rank_matches(vec![memory], &with_deleted).len(), 1);
    }
}
