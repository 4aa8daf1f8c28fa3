//! Memory and context types

use crate::error::{MemoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for memories
pub type MemoryId = String;

/// Unique identifier for contexts
pub type ContextId = String;

/// Identifier of the agent owning a memory or context
pub type AgentId = String;

/// Memory structure representing a piece of agent knowledge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    /// Unique identifier, assigned at creation
    pub id: MemoryId,
    /// Owning agent
    pub agent_id: AgentId,
    /// Kind of memory (affects default importance and decay)
    pub kind: MemoryKind,
    /// The memory content
    pub content: String,
    /// Embedding produced by an external provider; opaque here
    pub embedding: Option<Vec<f32>>,
    /// Tags associated with this memory
    pub tags: BTreeSet<String>,
    /// Importance score (0.0 - 1.0)
    pub importance: f32,
    /// Forgetting speed, per day
    pub decay_rate: f32,
    /// Directed, weighted links to other memories (insertion ordered, unique targets)
    pub associations: Vec<Association>,
    /// When the memory was created
    pub created_at: DateTime<Utc>,
    /// When the memory last received a versioned write
    pub updated_at: DateTime<Utc>,
    /// When the memory was last accessed
    pub accessed_at: DateTime<Utc>,
    /// Number of tracked accesses
    pub access_count: u64,
    /// Incremented on every update
    pub version: u64,
    /// Tombstone marker (soft delete)
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Memory {
    /// Whether this memory has been soft-forgotten
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Latest timestamp that reflects a change to this record
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.updated_at.max(self.accessed_at)
    }

    /// Last-writer-wins ordering: higher version wins, ties go to the fresher timestamp.
    pub fn supersedes(&self, other: &Memory) -> bool {
        self.version > other.version
            || (self.version == other.version && self.last_touched() > other.last_touched())
    }

    /// Importance after exponential decay since the last access
    pub fn effective_importance(&self, now: DateTime<Utc>) -> f32 {
        let elapsed_days = (now - self.accessed_at).num_seconds().max(0) as f64 / 86_400.0;
        (self.importance as f64 * (-(self.decay_rate as f64) * elapsed_days).exp()) as f32
    }

    /// Record a tracked access
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.accessed_at = now;
        self.access_count += 1;
    }

    /// Add or strengthen an association to another memory
    pub fn associate(&mut self, target_id: impl Into<MemoryId>, strength: f32) {
        let target_id = target_id.into();
        let strength = strength.clamp(0.0, 1.0);
        match self.associations.iter_mut().find(|a| a.target_id == target_id) {
            Some(existing) => existing.strength = strength,
            None => self.associations.push(Association { target_id, strength }),
        }
    }

    /// Ids this memory points at, in association order
    pub fn association_targets(&self) -> impl Iterator<Item = &str> {
        self.associations.iter().map(|a| a.target_id.as_str())
    }

    /// Case-insensitive relevance of this memory to a text query (0.0 - 1.0).
    ///
    /// Fraction of query terms found in the content or tags; an empty query matches
    /// everything with score 1.0.
    pub fn text_score(&self, query: &str) -> f32 {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return 1.0;
        }

        let content = self.content.to_lowercase();
        let hits = terms
            .iter()
            .filter(|t| {
                content.contains(t.as_str()) || self.tags.iter().any(|tag| tag.to_lowercase() == **t)
            })
            .count();
        hits as f32 / terms.len() as f32
    }
}

/// Kinds of memories with different default importance and decay
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Something that happened
    Episodic,
    /// General knowledge or fact
    Semantic,
    /// How to do something
    Procedural,
    /// Short-lived scratch memory
    Working,
}

impl MemoryKind {
    /// All memory kinds
    pub const ALL: &[MemoryKind] = &[
        MemoryKind::Episodic,
        MemoryKind::Semantic,
        MemoryKind::Procedural,
        MemoryKind::Working,
    ];

    /// Get default importance for this kind
    pub fn default_importance(&self) -> f32 {
        match self {
            MemoryKind::Procedural => 0.7,
            MemoryKind::Semantic => 0.6,
            MemoryKind::Episodic => 0.5,
            MemoryKind::Working => 0.3,
        }
    }

    /// Get default decay rate (per day) for this kind
    pub fn default_decay_rate(&self) -> f32 {
        match self {
            MemoryKind::Procedural => 0.01,
            MemoryKind::Semantic => 0.02,
            MemoryKind::Episodic => 0.1,
            MemoryKind::Working => 0.5,
        }
    }

    /// Stable lowercase name used in file names and database columns
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Working => "working",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "episodic" => Ok(MemoryKind::Episodic),
            "semantic" => Ok(MemoryKind::Semantic),
            "procedural" => Ok(MemoryKind::Procedural),
            "working" => Ok(MemoryKind::Working),
            other => Err(MemoryError::Validation(format!("unknown memory kind '{other}'"))),
        }
    }
}

/// Directed association to another memory (graph edge)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Association {
    /// Target memory ID
    pub target_id: MemoryId,
    /// Strength of the association (0.0 - 1.0)
    pub strength: f32,
}

impl Association {
    pub fn new(target_id: impl Into<MemoryId>, strength: f32) -> Self {
        Self {
            target_id: target_id.into(),
            strength: strength.clamp(0.0, 1.0),
        }
    }
}

/// Input for creating a memory. Server-assigned fields (id, version, timestamps,
/// access count) are filled in by `MemoryService::store`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    pub agent_id: AgentId,
    pub kind: MemoryKind,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub tags: BTreeSet<String>,
    pub importance: Option<f32>,
    pub decay_rate: Option<f32>,
    pub associations: Vec<Association>,
}

impl NewMemory {
    pub fn new(agent_id: impl Into<AgentId>, kind: MemoryKind, content: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            content: content.into(),
            embedding: None,
            tags: BTreeSet::new(),
            importance: None,
            decay_rate: None,
            associations: Vec::new(),
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_decay_rate(mut self, decay_rate: f32) -> Self {
        self.decay_rate = Some(decay_rate);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_association(mut self, target_id: impl Into<MemoryId>, strength: f32) -> Self {
        let target_id = target_id.into();
        self.associations.retain(|a| a.target_id != target_id);
        self.associations.push(Association { target_id, strength });
        self
    }

    /// Reject input that cannot become a valid memory
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(MemoryError::Validation("agent_id is required".into()));
        }
        if self.content.trim().is_empty() {
            return Err(MemoryError::Validation("content is required".into()));
        }
        if let Some(importance) = self.importance {
            validate_unit("importance", importance)?;
        }
        if let Some(decay_rate) = self.decay_rate {
            validate_decay_rate(decay_rate)?;
        }
        if let Some(embedding) = &self.embedding {
            validate_embedding(embedding)?;
        }
        validate_associations(&self.associations)
    }

    /// Materialize the memory with server-assigned fields
    pub(crate) fn into_memory(self, now: DateTime<Utc>) -> Memory {
        let mut associations: Vec<Association> = Vec::with_capacity(self.associations.len());
        for assoc in self.associations {
            if !associations.iter().any(|a| a.target_id == assoc.target_id) {
                associations.push(assoc);
            }
        }

        Memory {
            id: Uuid::new_v4().to_string(),
            agent_id: self.agent_id,
            importance: self.importance.unwrap_or_else(|| self.kind.default_importance()),
            decay_rate: self.decay_rate.unwrap_or_else(|| self.kind.default_decay_rate()),
            kind: self.kind,
            content: self.content,
            embedding: self.embedding,
            tags: self.tags,
            associations,
            created_at: now,
            updated_at: now,
            accessed_at: now,
            access_count: 0,
            version: 1,
            deleted_at: None,
        }
    }
}

/// Partial update applied through `MemoryService::update`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub embedding: Option<Option<Vec<f32>>>,
    pub tags: Option<BTreeSet<String>>,
    pub importance: Option<f32>,
    pub decay_rate: Option<f32>,
    pub associations: Option<Vec<Association>>,
}

impl MemoryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn decay_rate(mut self, decay_rate: f32) -> Self {
        self.decay_rate = Some(decay_rate);
        self
    }

    pub fn associations(mut self, associations: Vec<Association>) -> Self {
        self.associations = Some(associations);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(content) = &self.content {
            if content.trim().is_empty() {
                return Err(MemoryError::Validation("content cannot be empty".into()));
            }
        }
        if let Some(importance) = self.importance {
            validate_unit("importance", importance)?;
        }
        if let Some(decay_rate) = self.decay_rate {
            validate_decay_rate(decay_rate)?;
        }
        if let Some(Some(embedding)) = &self.embedding {
            validate_embedding(embedding)?;
        }
        if let Some(associations) = &self.associations {
            validate_associations(associations)?;
        }
        Ok(())
    }

    /// Apply to a memory, bumping its version
    pub(crate) fn apply(self, memory: &mut Memory, now: DateTime<Utc>) {
        if let Some(content) = self.content {
            memory.content = content;
        }
        if let Some(embedding) = self.embedding {
            memory.embedding = embedding;
        }
        if let Some(tags) = self.tags {
            memory.tags = tags;
        }
        if let Some(importance) = self.importance {
            memory.importance = importance;
        }
        if let Some(decay_rate) = self.decay_rate {
            memory.decay_rate = decay_rate;
        }
        if let Some(associations) = self.associations {
            memory.associations.clear();
            for assoc in associations {
                memory.associate(assoc.target_id, assoc.strength);
            }
        }
        memory.version += 1;
        memory.updated_at = now;
    }
}

fn validate_unit(field: &str, value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(MemoryError::Validation(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn validate_decay_rate(value: f32) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(MemoryError::Validation(format!(
            "decay_rate must be >= 0, got {value}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_embedding(embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(MemoryError::Validation("embedding cannot be empty".into()));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::Validation("embedding contains non-finite values".into()));
    }
    Ok(())
}

fn validate_associations(associations: &[Association]) -> Result<()> {
    for assoc in associations {
        if assoc.target_id.trim().is_empty() {
            return Err(MemoryError::Validation("association target is required".into()));
        }
        validate_unit("association strength", assoc.strength)?;
    }
    Ok(())
}

// ─── Contexts ─────────────────────────────────────────────────────────────────

/// Liveness of a context
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Live, with changes since the last checkpoint
    Active,
    /// Live, matching its latest checkpoint
    Checkpointed,
    /// Terminal and read-only
    Archived,
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextStatus::Active => write!(f, "active"),
            ContextStatus::Checkpointed => write!(f, "checkpointed"),
            ContextStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Immutable snapshot of a context's working state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub taken_at: DateTime<Utc>,
    pub state: BTreeMap<String, serde_json::Value>,
    pub memory_refs: Vec<MemoryId>,
    pub focus_refs: Vec<MemoryId>,
}

/// An agent's working state and active memory set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Context {
    pub id: ContextId,
    pub agent_id: AgentId,
    pub task_id: Option<String>,
    /// Weak reference to the context this one inherits from
    pub parent_id: Option<ContextId>,
    pub state: BTreeMap<String, serde_json::Value>,
    /// Memories currently in play (ordered, unique)
    pub memory_refs: Vec<MemoryId>,
    /// High-priority subset of `memory_refs`
    pub focus_refs: Vec<MemoryId>,
    /// Oldest first
    pub checkpoints: Vec<Checkpoint>,
    pub status: ContextStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(agent_id: impl Into<AgentId>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            task_id: None,
            parent_id: None,
            state: BTreeMap::new(),
            memory_refs: Vec::new(),
            focus_refs: Vec::new(),
            checkpoints: Vec::new(),
            status: ContextStatus::Active,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status == ContextStatus::Archived
    }

    /// Put a memory in play. Returns false if it was already referenced.
    pub fn activate_memory(&mut self, memory_id: impl Into<MemoryId>) -> bool {
        let memory_id = memory_id.into();
        if self.memory_refs.contains(&memory_id) {
            return false;
        }
        self.memory_refs.push(memory_id);
        self.mark_dirty();
        true
    }

    /// Mark a memory high priority, referencing it first if needed
    pub fn focus_memory(&mut self, memory_id: impl Into<MemoryId>) {
        let memory_id = memory_id.into();
        self.activate_memory(memory_id.clone());
        if !self.focus_refs.contains(&memory_id) {
            self.focus_refs.push(memory_id);
            self.mark_dirty();
        }
    }

    /// Drop a memory from both the active and the focus sets
    pub fn release_memory(&mut self, memory_id: &str) -> bool {
        let before = self.memory_refs.len();
        self.memory_refs.retain(|id| id != memory_id);
        self.focus_refs.retain(|id| id != memory_id);
        let removed = self.memory_refs.len() != before;
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.state.insert(key.into(), value);
        self.mark_dirty();
    }

    /// Whether the working state differs from another copy of the same context
    pub fn content_differs(&self, other: &Context) -> bool {
        self.state != other.state
            || self.memory_refs != other.memory_refs
            || self.focus_refs != other.focus_refs
            || self.parent_id != other.parent_id
            || self.task_id != other.task_id
    }

    /// Last-writer-wins ordering used by sync-back
    pub fn supersedes(&self, other: &Context) -> bool {
        self.version > other.version
            || (self.version == other.version && self.updated_at > other.updated_at)
    }

    pub(crate) fn snapshot(&self, now: DateTime<Utc>) -> Checkpoint {
        Checkpoint {
            taken_at: now,
            state: self.state.clone(),
            memory_refs: self.memory_refs.clone(),
            focus_refs: self.focus_refs.clone(),
        }
    }

    fn mark_dirty(&mut self) {
        if self.status == ContextStatus::Checkpointed {
            self.status = ContextStatus::Active;
        }
    }
}

/// Result of resolving a context's parent
#[derive(Debug, Clone, PartialEq)]
pub enum ParentLookup {
    /// The context has no parent
    Root,
    /// The parent exists
    Present(Context),
    /// The parent id points at a context that no longer exists
    Orphaned(ContextId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(now: DateTime<Utc>) -> Memory {
        NewMemory::new("agent-1", MemoryKind::Semantic, "Rust has ownership")
            .with_tag("rust")
            .into_memory(now)
    }

    #[test]
    fn new_memory_gets_kind_defaults() {
        let memory = sample(Utc::now());
        assert_eq!(memory.importance, MemoryKind::Semantic.default_importance());
        assert_eq!(memory.decay_rate, MemoryKind::Semantic.default_decay_rate());
        assert_eq!(memory.version, 1);
        assert!(!memory.is_deleted());
    }

    #[test]
    fn validation_rejects_missing_content_and_bad_ranges() {
        assert!(NewMemory::new("a", MemoryKind::Working, "  ").validate().is_err());
        assert!(NewMemory::new("", MemoryKind::Working, "x").validate().is_err());
        assert!(NewMemory::new("a", MemoryKind::Working, "x")
            .with_importance(1.5)
            .validate()
            .is_err());
        assert!(NewMemory::new("a", MemoryKind::Working, "x")
            .with_decay_rate(-0.1)
            .validate()
            .is_err());
        assert!(NewMemory::new("a", MemoryKind::Working, "x")
            .with_association("b", 2.0)
            .validate()
            .is_err());
    }

    #[test]
    fn effective_importance_decays_exponentially() {
        let now = Utc::now();
        let mut memory = sample(now);
        memory.importance = 0.9;
        memory.decay_rate = 0.5;
        assert!((memory.effective_importance(now) - 0.9).abs() < 1e-6);

        let later = now + Duration::days(2);
        let expected = 0.9 * (-1.0f32).exp();
        assert!((memory.effective_importance(later) - expected).abs() < 1e-4);
    }

    #[test]
    fn supersedes_uses_version_then_timestamp() {
        let now = Utc::now();
        let a = sample(now);
        let mut b = a.clone();
        assert!(!b.supersedes(&a));

        b.touch(now + Duration::seconds(5));
        assert!(b.supersedes(&a));

        let mut c = a.clone();
        c.version = 2;
        assert!(c.supersedes(&b));
    }

    #[test]
    fn patch_bumps_version_and_keeps_associations_unique() {
        let now = Utc::now();
        let mut memory = sample(now);
        MemoryPatch::new()
            .content("Rust has ownership and borrowing")
            .associations(vec![Association::new("x", 0.4), Association::new("x", 0.8)])
            .apply(&mut memory, now);

        assert_eq!(memory.version, 2);
        assert_eq!(memory.associations, vec![Association::new("x", 0.8)]);
    }

    #[test]
    fn text_score_counts_terms() {
        let memory = sample(Utc::now());
        assert_eq!(memory.text_score(""), 1.0);
        assert_eq!(memory.text_score("ownership"), 1.0);
        assert_eq!(memory.text_score("ownership lifetimes"), 0.5);
        assert_eq!(memory.text_score("RUST"), 1.0);
        assert_eq!(memory.text_score("python"), 0.0);
    }

    #[test]
    fn context_mutators_return_checkpointed_to_active() {
        let mut ctx = Context::new("agent-1", Utc::now());
        ctx.status = ContextStatus::Checkpointed;
        ctx.focus_memory("m1");
        assert_eq!(ctx.status, ContextStatus::Active);
        assert_eq!(ctx.memory_refs, vec!["m1".to_string()]);
        assert_eq!(ctx.focus_refs, vec!["m1".to_string()]);

        assert!(ctx.release_memory("m1"));
        assert!(ctx.memory_refs.is_empty());
        assert!(ctx.focus_refs.is_empty());
    }
}
