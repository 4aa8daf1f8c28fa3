//! Human-readable fallback backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<agent>/<kind>.mem     memories of one agent and kind
//! <root>/<agent>/contexts.ctx   contexts of one agent
//! ```
//!
//! Every record is a block of `field: <json>` lines in a fixed field order, closed by a
//! `%%` line. Values are JSON so multi-line content stays on one line. On load an
//! unterminated trailing block (torn write) is dropped and malformed blocks are skipped;
//! both are reported as warnings instead of failing the open.

use super::{write_atomic, Backend, BackendKind, MemoryFilter};
use crate::error::{MemoryError, Result};
use crate::types::{AgentId, Context, Memory, MemoryKind};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::RwLock;

const DELIMITER: &str = "%%";
const CONTEXT_FILE: &str = "contexts.ctx";
const MEMORY_EXT: &str = "mem";

const MEMORY_FIELDS: &[&str] = &[
    "id",
    "agent_id",
    "kind",
    "content",
    "embedding",
    "tags",
    "importance",
    "decay_rate",
    "associations",
    "created_at",
    "updated_at",
    "accessed_at",
    "access_count",
    "version",
    "deleted_at",
];

const CONTEXT_FIELDS: &[&str] = &[
    "id",
    "agent_id",
    "task_id",
    "parent_id",
    "status",
    "version",
    "state",
    "memory_refs",
    "focus_refs",
    "checkpoints",
    "created_at",
    "updated_at",
];

/// Outcome of loading the directory at open time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub memories_loaded: usize,
    pub contexts_loaded: usize,
    pub blocks_discarded: usize,
    pub files_affected: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.blocks_discarded == 0
    }
}

/// Flat-file backend keeping a full in-memory mirror of its directory
#[derive(Debug)]
pub struct FlatFileBackend {
    name: String,
    root: PathBuf,
    memories: RwLock<HashMap<String, Memory>>,
    contexts: RwLock<HashMap<String, Context>>,
    /// Serializes file rewrites so a stale snapshot never overwrites a newer one
    file_lock: tokio::sync::Mutex<()>,
    report: RecoveryReport,
    warnings: Mutex<Vec<String>>,
}

impl FlatFileBackend {
    /// Open (creating if needed) a flat-file store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let scan_root = root.clone();
        let loaded = tokio::task::spawn_blocking(move || load_dir(&scan_root))
            .await
            .map_err(|e| MemoryError::Other(e.into()))??;

        for warning in &loaded.warnings {
            tracing::warn!(root = %root.display(), "{warning}");
        }
        tracing::info!(
            root = %root.display(),
            memories = loaded.report.memories_loaded,
            contexts = loaded.report.contexts_loaded,
            discarded = loaded.report.blocks_discarded,
            "flat-file backend loaded"
        );

        Ok(Self {
            name: "flatfile".to_string(),
            root,
            memories: RwLock::new(loaded.memories),
            contexts: RwLock::new(loaded.contexts),
            file_lock: tokio::sync::Mutex::new(()),
            report: loaded.report,
            warnings: Mutex::new(loaded.warnings),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    fn memory_path(&self, agent_id: &str, kind: MemoryKind) -> PathBuf {
        self.root
            .join(encode_agent_dir(agent_id))
            .join(format!("{}.{MEMORY_EXT}", kind.as_str()))
    }

    fn context_path(&self, agent_id: &str) -> PathBuf {
        self.root.join(encode_agent_dir(agent_id)).join(CONTEXT_FILE)
    }

    /// Rewrite the file holding one agent's memories of one kind
    async fn flush_memories(&self, agent_id: &AgentId, kind: MemoryKind) -> Result<()> {
        let mut records: Vec<Memory> = self
            .memories
            .read()
            .await
            .values()
            .filter(|m| &m.agent_id == agent_id && m.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let text = encode_records(&records, MEMORY_FIELDS)?;
        write_atomic(self.memory_path(agent_id, kind), text.into_bytes()).await
    }

    async fn flush_contexts(&self, agent_id: &AgentId) -> Result<()> {
        let mut records: Vec<Context> = self
            .contexts
            .read()
            .await
            .values()
            .filter(|c| &c.agent_id == agent_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let text = encode_records(&records, CONTEXT_FIELDS)?;
        write_atomic(self.context_path(agent_id), text.into_bytes()).await
    }
}

#[async_trait]
impl Backend for FlatFileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::FlatFile
    }

    async fn ping(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.root).await?;
        if !meta.is_dir() {
            return Err(MemoryError::backend(&self.name, "root is not a directory"));
        }
        Ok(())
    }

    async fn put_memory(&self, memory: &Memory) -> Result<()> {
        let _file = self.file_lock.lock().await;
        let previous = self
            .memories
            .write()
            .await
            .insert(memory.id.clone(), memory.clone());

        let result = self.flush_memories(&memory.agent_id, memory.kind).await;
        if result.is_err() {
            // Keep the mirror consistent with what is on disk.
            let mut memories = self.memories.write().await;
            match previous {
                Some(prev) => memories.insert(prev.id.clone(), prev),
                None => memories.remove(&memory.id),
            };
        }
        result
    }

    async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.memories.read().await.get(id).cloned())
    }

    async fn delete_memory(&self, id: &str) -> Result<bool> {
        let _file = self.file_lock.lock().await;
        let removed = self.memories.write().await.remove(id);
        match removed {
            Some(memory) => {
                if let Err(e) = self.flush_memories(&memory.agent_id, memory.kind).await {
                    self.memories.write().await.insert(memory.id.clone(), memory);
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        Ok(self
            .memories
            .read()
            .await
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn put_context(&self, context: &Context) -> Result<()> {
        let _file = self.file_lock.lock().await;
        let previous = self
            .contexts
            .write()
            .await
            .insert(context.id.clone(), context.clone());

        let result = self.flush_contexts(&context.agent_id).await;
        if result.is_err() {
            let mut contexts = self.contexts.write().await;
            match previous {
                Some(prev) => contexts.insert(prev.id.clone(), prev),
                None => contexts.remove(&context.id),
            };
        }
        result
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>> {
        Ok(self.contexts.read().await.get(id).cloned())
    }

    async fn delete_context(&self, id: &str) -> Result<bool> {
        let _file = self.file_lock.lock().await;
        let removed = self.contexts.write().await.remove(id);
        match removed {
            Some(context) => {
                if let Err(e) = self.flush_contexts(&context.agent_id).await {
                    self.contexts.write().await.insert(context.id.clone(), context);
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_contexts(&self, agent_id: Option<&str>) -> Result<Vec<Context>> {
        Ok(self
            .contexts
            .read()
            .await
            .values()
            .filter(|c| agent_id.map_or(true, |a| c.agent_id == a))
            .cloned()
            .collect())
    }

    fn drain_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

// ─── Encoding ─────────────────────────────────────────────────────────────────

/// Serialize records as delimiter-terminated blocks with a fixed field order
pub fn encode_records<T: Serialize>(records: &[T], fields: &[&str]) -> Result<String> {
    let mut out = String::new();
    for record in records {
        let Value::Object(map) = serde_json::to_value(record)? else {
            return Err(MemoryError::Serialization(
                "flat-file records must serialize to objects".into(),
            ));
        };
        for field in fields {
            let value = map.get(*field).unwrap_or(&Value::Null);
            out.push_str(field);
            out.push_str(": ");
            out.push_str(&serde_json::to_string(value)?);
            out.push('\n');
        }
        out.push_str(DELIMITER);
        out.push('\n');
    }
    Ok(out)
}

/// Parse blocks, returning the decodable records plus one warning per discarded block
pub fn decode_records<T: DeserializeOwned>(text: &str) -> (Vec<T>, Vec<String>) {
    let mut records = Vec::new();
    let mut warnings = Vec::new();
    let mut block: Map<String, Value> = Map::new();
    let mut block_start = 1usize;
    let mut malformed: Option<String> = None;
    let mut has_lines = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line == DELIMITER {
            if let Some(reason) = malformed.take() {
                warnings.push(format!("discarded record at line {block_start}: {reason}"));
            } else {
                match serde_json::from_value::<T>(Value::Object(std::mem::take(&mut block))) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warnings.push(format!("discarded record at line {block_start}: {e}"))
                    }
                }
            }
            block.clear();
            has_lines = false;
            block_start = line_no + 1;
            continue;
        }

        has_lines = true;
        if malformed.is_some() {
            continue;
        }
        match line.split_once(": ") {
            Some((key, raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(value) => {
                    block.insert(key.to_string(), value);
                }
                Err(e) => malformed = Some(format!("bad value for '{key}': {e}")),
            },
            None => malformed = Some(format!("unparseable line {line_no}")),
        }
    }

    if has_lines {
        warnings.push(format!(
            "discarded unterminated record starting at line {block_start}"
        ));
    }

    (records, warnings)
}

/// Agent ids become directory names; percent-encode anything outside `[A-Za-z0-9_-]`
fn encode_agent_dir(agent_id: &str) -> String {
    let mut out = String::with_capacity(agent_id.len());
    for byte in agent_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    if out.is_empty() {
        out.push_str("%00");
    }
    out
}

struct LoadedDir {
    memories: HashMap<String, Memory>,
    contexts: HashMap<String, Context>,
    report: RecoveryReport,
    warnings: Vec<String>,
}

fn load_dir(root: &Path) -> Result<LoadedDir> {
    let mut loaded = LoadedDir {
        memories: HashMap::new(),
        contexts: HashMap::new(),
        report: RecoveryReport::default(),
        warnings: Vec::new(),
    };

    for agent_entry in std::fs::read_dir(root)? {
        let agent_dir = agent_entry?.path();
        if !agent_dir.is_dir() {
            continue;
        }
        for file_entry in std::fs::read_dir(&agent_dir)? {
            let path = file_entry?.path();
            let bytes = std::fs::read(&path)?;
            // A torn write can split a multi-byte character; decode lossily and let the
            // block parser throw away whatever no longer parses.
            let text = String::from_utf8_lossy(&bytes);

            let is_context = path.file_name().and_then(|n| n.to_str()) == Some(CONTEXT_FILE);
            let is_memory = path.extension().and_then(|e| e.to_str()) == Some(MEMORY_EXT);

            let warnings = if is_context {
                let (records, warnings) = decode_records::<Context>(&text);
                for context in records {
                    loaded.report.contexts_loaded += 1;
                    keep_newest(&mut loaded.contexts, context.id.clone(), context, |a, b| {
                        a.supersedes(b)
                    });
                }
                warnings
            } else if is_memory {
                let (records, warnings) = decode_records::<Memory>(&text);
                for memory in records {
                    loaded.report.memories_loaded += 1;
                    keep_newest(&mut loaded.memories, memory.id.clone(), memory, |a, b| {
                        a.supersedes(b)
                    });
                }
                warnings
            } else {
                continue;
            };

            if !warnings.is_empty() {
                loaded.report.blocks_discarded += warnings.len();
                loaded.report.files_affected.push(path.clone());
                loaded
                    .warnings
                    .extend(warnings.into_iter().map(|w| format!("{}: {w}", path.display())));
            }
        }
    }

    Ok(loaded)
}

fn keep_newest<T>(map: &mut HashMap<String, T>, id: String, record: T, newer: impl Fn(&T, &T) -> bool) {
    match map.get(&id) {
        Some(existing) if !newer(&record, existing) => {}
        _ => {
            map.insert(id, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewMemory;
    use chrono::Utc;

    fn memory(agent: &str, kind: MemoryKind, content: &str) -> Memory {
        NewMemory::new(agent, kind, content).into_memory(Utc::now())
    }

    #[test]
    fn encode_uses_stable_field_order() {
        let m = memory("agent", MemoryKind::Semantic, "line one\nline two");
        let text = encode_records(std::slice::from_ref(&m), MEMORY_FIELDS).unwrap();
        let keys: Vec<&str> = text
            .lines()
            .take_while(|l| *l != DELIMITER)
            .map(|l| l.split_once(": ").unwrap().0)
            .collect();
        assert_eq!(keys, MEMORY_FIELDS);
        assert!(text.ends_with("%%\n"));

        let (decoded, warnings) = decode_records::<Memory>(&text);
        assert!(warnings.is_empty());
        assert_eq!(decoded, vec![m]);
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let a = memory("agent", MemoryKind::Episodic, "first");
        let b = memory("agent", MemoryKind::Episodic, "second");
        let text = encode_records(&[a.clone(), b], MEMORY_FIELDS).unwrap();

        // Cut the file in the middle of the second block.
        let cut = text.len() - 40;
        let (decoded, warnings) = decode_records::<Memory>(&text[..cut]);
        assert_eq!(decoded, vec![a]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("unterminated"));
    }

    #[test]
    fn malformed_block_is_skipped() {
        let a = memory("agent", MemoryKind::Episodic, "first");
        let good = encode_records(std::slice::from_ref(&a), MEMORY_FIELDS).unwrap();
        let text = format!("id: \"x\"\ngarbage line\n%%\n{good}");

        let (decoded, warnings) = decode_records::<Memory>(&text);
        assert_eq!(decoded, vec![a]);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn agent_dir_encoding_is_path_safe() {
        assert_eq!(encode_agent_dir("agent-1_x"), "agent-1_x");
        assert_eq!(encode_agent_dir("../etc"), "%2E%2E%2Fetc");
    }

    #[tokio::test]
    async fn persists_one_file_per_agent_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FlatFileBackend::open(dir.path()).await.unwrap();

        let a = memory("agent", MemoryKind::Episodic, "met Bob");
        let b = memory("agent", MemoryKind::Semantic, "Bob likes tea");
        backend.put_memory(&a).await.unwrap();
        backend.put_memory(&b).await.unwrap();

        assert!(dir.path().join("agent").join("episodic.mem").exists());
        assert!(dir.path().join("agent").join("semantic.mem").exists());

        let reopened = FlatFileBackend::open(dir.path()).await.unwrap();
        assert!(reopened.recovery_report().is_clean());
        assert_eq!(reopened.get_memory(&a.id).await.unwrap(), Some(a.clone()));
        assert_eq!(reopened.get_memory(&b.id).await.unwrap(), Some(b));

        assert!(reopened.delete_memory(&a.id).await.unwrap());
        assert!(!dir.path().join("agent").join("episodic.mem").exists());
    }

    #[tokio::test]
    async fn recovers_from_torn_write_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let a = memory("agent", MemoryKind::Working, "keep me");
        {
            let backend = FlatFileBackend::open(dir.path()).await.unwrap();
            backend.put_memory(&a).await.unwrap();
        }

        let path = dir.path().join("agent").join("working.mem");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("id: \"half\"\nagent_id: \"ag");
        std::fs::write(&path, text).unwrap();

        let backend = FlatFileBackend::open(dir.path()).await.unwrap();
        assert_eq!(backend.get_memory(&a.id).await.unwrap(), Some(a));
        assert_eq!(backend.recovery_report().blocks_discarded, 1);
        assert_eq!(backend.drain_warnings().len(), 1);
        assert!(backend.drain_warnings().is_empty());
    }

    #[tokio::test]
    async fn contexts_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FlatFileBackend::open(dir.path()).await.unwrap();
        let mut ctx = Context::new("agent", Utc::now());
        ctx.set_state("goal", serde_json::json!({"step": 2}));
        ctx.focus_memory("m1");
        backend.put_context(&ctx).await.unwrap();

        let reopened = FlatFileBackend::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get_context(&ctx.id).await.unwrap(), Some(ctx.clone()));
        assert_eq!(reopened.list_contexts(Some("agent")).await.unwrap().len(), 1);
        assert!(reopened.list_contexts(Some("other")).await.unwrap().is_empty());
    }
}
