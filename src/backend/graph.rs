//! Graph backend: memories are nodes, associations are directed edges.
//!
//! Node data lives in an in-process arena with an incoming-edge index so that both
//! directions of the association graph resolve without scanning. Context parent links
//! are indexed the same way.
//!
//! When opened with a path, every mutation is appended to a journal and synced before
//! it becomes visible to readers. The journal is folded into a bincode snapshot every
//! `compact_every` mutations, on open and on close. A torn record at the journal tail
//! (a crash mid-append) is cut off on open and reported as a warning.

use super::{write_atomic, Backend, BackendKind, MemoryFilter};
use crate::error::{MemoryError, Result};
use crate::types::{Context, ContextId, Memory, MemoryId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

const SNAPSHOT_VERSION: u32 = 1;
const DEFAULT_COMPACT_EVERY: usize = 1024;

#[derive(Debug, Default)]
struct GraphState {
    nodes: HashMap<MemoryId, Memory>,
    /// target -> sources pointing at it
    incoming: HashMap<MemoryId, BTreeSet<MemoryId>>,
    contexts: HashMap<ContextId, Context>,
    /// parent -> child contexts
    children: HashMap<ContextId, BTreeSet<ContextId>>,
}

impl GraphState {
    fn upsert_node(&mut self, memory: Memory) {
        if let Some(previous) = self.nodes.remove(&memory.id) {
            self.unlink_edges(&previous);
        }
        for target in memory.association_targets() {
            self.incoming
                .entry(target.to_string())
                .or_default()
                .insert(memory.id.clone());
        }
        self.nodes.insert(memory.id.clone(), memory);
    }

    fn remove_node(&mut self, id: &str) -> Option<Memory> {
        let removed = self.nodes.remove(id)?;
        self.unlink_edges(&removed);
        Some(removed)
    }

    fn unlink_edges(&mut self, memory: &Memory) {
        for target in memory.association_targets() {
            if let Some(sources) = self.incoming.get_mut(target) {
                sources.remove(&memory.id);
                if sources.is_empty() {
                    self.incoming.remove(target);
                }
            }
        }
    }

    fn upsert_context(&mut self, context: Context) {
        if let Some(previous) = self.contexts.remove(&context.id) {
            self.unlink_parent(&previous);
        }
        if let Some(parent) = &context.parent_id {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(context.id.clone());
        }
        self.contexts.insert(context.id.clone(), context);
    }

    fn remove_context(&mut self, id: &str) -> Option<Context> {
        let removed = self.contexts.remove(id)?;
        self.unlink_parent(&removed);
        Some(removed)
    }

    fn unlink_parent(&mut self, context: &Context) {
        if let Some(parent) = &context.parent_id {
            if let Some(kids) = self.children.get_mut(parent) {
                kids.remove(&context.id);
                if kids.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
    }

    fn to_snapshot(&self) -> Result<GraphSnapshot> {
        let mut memories: Vec<Memory> = self.nodes.values().cloned().collect();
        memories.sort_by(|a, b| a.id.cmp(&b.id));

        // Context state holds arbitrary JSON, which bincode cannot describe.
        let mut contexts: Vec<(ContextId, String)> = self
            .contexts
            .values()
            .map(|c| -> Result<(ContextId, String)> {
                Ok((c.id.clone(), serde_json::to_string(c)?))
            })
            .collect::<Result<_>>()?;
        contexts.sort();

        Ok(GraphSnapshot {
            version: SNAPSHOT_VERSION,
            memories,
            contexts: contexts.into_iter().map(|(_, json)| json).collect(),
        })
    }

    fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MemoryError::Corruption(format!(
                "unsupported graph snapshot version {}",
                snapshot.version
            )));
        }
        let mut state = GraphState::default();
        for memory in snapshot.memories {
            state.upsert_node(memory);
        }
        for json in snapshot.contexts {
            state.upsert_context(serde_json::from_str(&json)?);
        }
        Ok(state)
    }
}

/// One state change, as applied in memory
#[derive(Debug, Clone)]
enum Mutation {
    PutMemory(Memory),
    DeleteMemory(MemoryId),
    PutContext(Context),
    DeleteContext(ContextId),
}

/// On-disk form of a [`Mutation`]; contexts go through JSON like in snapshots
#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    PutMemory(Memory),
    DeleteMemory(MemoryId),
    PutContext(String),
    DeleteContext(ContextId),
}

impl Mutation {
    /// Deletes of absent entities change nothing and are not journaled
    fn is_noop(&self, state: &GraphState) -> bool {
        match self {
            Mutation::DeleteMemory(id) => !state.nodes.contains_key(id),
            Mutation::DeleteContext(id) => !state.contexts.contains_key(id),
            _ => false,
        }
    }

    /// Returns whether anything was there before
    fn apply(self, state: &mut GraphState) -> bool {
        match self {
            Mutation::PutMemory(memory) => {
                let existed = state.nodes.contains_key(&memory.id);
                state.upsert_node(memory);
                existed
            }
            Mutation::DeleteMemory(id) => state.remove_node(&id).is_some(),
            Mutation::PutContext(context) => {
                let existed = state.contexts.contains_key(&context.id);
                state.upsert_context(context);
                existed
            }
            Mutation::DeleteContext(id) => state.remove_context(&id).is_some(),
        }
    }

    /// Length-prefixed bincode frame
    fn encode(&self) -> Result<Vec<u8>> {
        let record = match self {
            Mutation::PutMemory(memory) => JournalRecord::PutMemory(memory.clone()),
            Mutation::DeleteMemory(id) => JournalRecord::DeleteMemory(id.clone()),
            Mutation::PutContext(context) => JournalRecord::PutContext(serde_json::to_string(context)?),
            Mutation::DeleteContext(id) => JournalRecord::DeleteContext(id.clone()),
        };
        let body = bincode::serialize(&record)?;
        let len = u32::try_from(body.len())
            .map_err(|_| MemoryError::Serialization("journal record exceeds 4 GiB".into()))?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decode(body: &[u8]) -> Result<Self> {
        Ok(match bincode::deserialize(body)? {
            JournalRecord::PutMemory(memory) => Mutation::PutMemory(memory),
            JournalRecord::DeleteMemory(id) => Mutation::DeleteMemory(id),
            JournalRecord::PutContext(json) => Mutation::PutContext(serde_json::from_str(&json)?),
            JournalRecord::DeleteContext(id) => Mutation::DeleteContext(id),
        })
    }
}

/// Decode every intact frame. Returns the mutations and the byte length they cover;
/// anything past that is a torn or corrupt tail.
fn read_journal(bytes: &[u8]) -> (Vec<Mutation>, usize) {
    let mut mutations = Vec::new();
    let mut offset = 0;
    while let Some(header) = bytes.get(offset..offset + 4) {
        let mut len = [0u8; 4];
        len.copy_from_slice(header);
        let end = offset + 4 + u32::from_le_bytes(len) as usize;
        let Some(body) = bytes.get(offset + 4..end) else {
            break;
        };
        match Mutation::decode(body) {
            Ok(mutation) => mutations.push(mutation),
            Err(_) => break,
        }
        offset = end;
    }
    (mutations, offset)
}

async fn append_frame(path: PathBuf, frame: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(())
    })
    .await
    .map_err(|e| MemoryError::Other(e.into()))?
}

async fn truncate_journal(path: PathBuf, len: u64) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        match std::fs::OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                file.set_len(len)?;
                file.sync_all()?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    })
    .await
    .map_err(|e| MemoryError::Other(e.into()))?
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphSnapshot {
    version: u32,
    memories: Vec<Memory>,
    contexts: Vec<String>,
}

/// Snapshot file plus the journal of mutations since it was written
#[derive(Debug)]
struct Persistence {
    snapshot: PathBuf,
    journal: PathBuf,
    /// Journal records since the last compaction
    journaled: usize,
    compact_every: usize,
}

/// Primary backend of the default chain
#[derive(Debug)]
pub struct GraphBackend {
    name: String,
    state: RwLock<GraphState>,
    /// Serializes journal appends so they land in mutation order
    persistence: Mutex<Option<Persistence>>,
    warnings: std::sync::Mutex<Vec<String>>,
}

impl GraphBackend {
    /// Volatile graph with no snapshot file
    pub fn in_memory() -> Self {
        Self {
            name: "graph".to_string(),
            state: RwLock::new(GraphState::default()),
            persistence: Mutex::new(None),
            warnings: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Open a graph persisted at `path`: load the snapshot, replay the journal next to
    /// it, then compact
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let journal = path.with_extension("journal");
        let mut state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: GraphSnapshot = bincode::deserialize(&bytes)
                    .map_err(|e| MemoryError::Corruption(format!("{}: {e}", path.display())))?;
                GraphState::from_snapshot(snapshot)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GraphState::default(),
            Err(e) => return Err(e.into()),
        };

        let mut warnings = Vec::new();
        let bytes = match tokio::fs::read(&journal).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (mutations, intact) = read_journal(&bytes);
        let replayed = mutations.len();
        for mutation in mutations {
            mutation.apply(&mut state);
        }
        if intact < bytes.len() {
            let dropped = bytes.len() - intact;
            tracing::warn!(journal = %journal.display(), dropped, "discarding torn journal tail");
            warnings.push(format!("{}: discarded {dropped} bytes of torn journal tail", journal.display()));
            truncate_journal(journal.clone(), intact as u64).await?;
        }

        tracing::info!(
            path = %path.display(),
            nodes = state.nodes.len(),
            contexts = state.contexts.len(),
            replayed,
            "graph backend opened"
        );

        let backend = Self {
            name: "graph".to_string(),
            state: RwLock::new(state),
            persistence: Mutex::new(Some(Persistence {
                snapshot: path,
                journal,
                journaled: replayed,
                compact_every: DEFAULT_COMPACT_EVERY,
            })),
            warnings: std::sync::Mutex::new(warnings),
        };
        if replayed > 0 {
            let mut persistence = backend.persistence.lock().await;
            if let Some(persistence) = persistence.as_mut() {
                if let Err(e) = backend.compact(persistence).await {
                    tracing::warn!(error = %e, "graph compaction on open failed, journal kept");
                }
            }
        }
        Ok(backend)
    }

    /// Fold the journal into a snapshot after this many mutations
    pub fn compact_every(mut self, mutations: usize) -> Self {
        if let Some(persistence) = self.persistence.get_mut().as_mut() {
            persistence.compact_every = mutations.max(1);
        }
        self
    }

    /// Ids of memories holding an association to `id`
    pub async fn incoming(&self, id: &str) -> Vec<MemoryId> {
        self.state
            .read()
            .await
            .incoming
            .get(id)
            .map(|sources| sources.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of contexts whose parent is `id`
    pub async fn child_contexts(&self, id: &str) -> Vec<ContextId> {
        self.state
            .read()
            .await
            .children
            .get(id)
            .map(|kids| kids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Write the current state as a snapshot, then empty the journal. Caller holds the
    /// persistence lock, so no append can slip in between.
    async fn compact(&self, persistence: &mut Persistence) -> Result<()> {
        let bytes = bincode::serialize(&self.state.read().await.to_snapshot()?)?;
        write_atomic(persistence.snapshot.clone(), bytes).await?;
        truncate_journal(persistence.journal.clone(), 0).await?;
        tracing::debug!(backend = %self.name, folded = persistence.journaled, "graph journal compacted");
        persistence.journaled = 0;
        Ok(())
    }

    /// Journal a mutation, then make it visible. Nothing changes in memory when the
    /// journal append fails.
    async fn mutate(&self, mutation: Mutation) -> Result<bool> {
        let mut persistence = self.persistence.lock().await;
        if mutation.is_noop(&*self.state.read().await) {
            return Ok(false);
        }
        if let Some(persistence) = persistence.as_mut() {
            let frame = mutation.encode()?;
            if let Err(e) = append_frame(persistence.journal.clone(), frame).await {
                tracing::warn!(backend = %self.name, error = %e, "graph journal append failed");
                return Err(MemoryError::backend(&self.name, e));
            }
            persistence.journaled += 1;
        }

        let existed = mutation.apply(&mut *self.state.write().await);

        if let Some(persistence) = persistence.as_mut() {
            if persistence.journaled >= persistence.compact_every {
                if let Err(e) = self.compact(persistence).await {
                    tracing::warn!(backend = %self.name, error = %e, "graph compaction failed, journal kept");
                }
            }
        }
        Ok(existed)
    }
}

#[async_trait]
impl Backend for GraphBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    async fn ping(&self) -> Result<()> {
        let Some(path) = self.persistence.lock().await.as_ref().map(|p| p.snapshot.clone()) else {
            return Ok(());
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|e| MemoryError::backend(&self.name, e))?;
        if !meta.is_dir() {
            return Err(MemoryError::backend(&self.name, "snapshot directory missing"));
        }
        Ok(())
    }

    async fn put_memory(&self, memory: &Memory) -> Result<()> {
        self.mutate(Mutation::PutMemory(memory.clone())).await.map(|_| ())
    }

    async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.state.read().await.nodes.get(id).cloned())
    }

    async fn delete_memory(&self, id: &str) -> Result<bool> {
        self.mutate(Mutation::DeleteMemory(id.to_string())).await
    }

    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        Ok(self
            .state
            .read()
            .await
            .nodes
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    /// Walks the arena under one read lock instead of issuing a lookup per hop
    async fn associated(&self, id: &str, max_depth: usize) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        let Some(start) = state.nodes.get(id) else {
            return Ok(Vec::new());
        };

        let mut visited: HashSet<&str> = HashSet::from([start.id.as_str()]);
        let mut queue: VecDeque<(&Memory, usize)> = VecDeque::from([(start, 0)]);
        let mut found = Vec::new();

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for target in node.association_targets() {
                if !visited.insert(target) {
                    continue;
                }
                match state.nodes.get(target) {
                    Some(next) if !next.is_deleted() => {
                        found.push(next.clone());
                        queue.push_back((next, depth + 1));
                    }
                    _ => {}
                }
            }
        }

        Ok(found)
    }

    async fn put_context(&self, context: &Context) -> Result<()> {
        self.mutate(Mutation::PutContext(context.clone())).await.map(|_| ())
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>> {
        Ok(self.state.read().await.contexts.get(id).cloned())
    }

    async fn delete_context(&self, id: &str) -> Result<bool> {
        self.mutate(Mutation::DeleteContext(id.to_string())).await
    }

    async fn list_contexts(&self, agent_id: Option<&str>) -> Result<Vec<Context>> {
        Ok(self
            .state
            .read()
            .await
            .contexts
            .values()
            .filter(|c| agent_id.map_or(true, |a| c.agent_id == a))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        let mut persistence = self.persistence.lock().await;
        match persistence.as_mut() {
            Some(persistence) if persistence.journaled > 0 => self.compact(persistence).await,
            _ => Ok(()),
        }
    }

    fn drain_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
