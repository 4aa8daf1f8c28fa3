//! Volatile backend, last link of the default chain

use super::{Backend, BackendKind, MemoryFilter};
use crate::error::{MemoryError, Result};
use crate::types::{Context, Memory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Process-local backend. Can be switched offline to simulate an outage.
#[derive(Debug)]
pub struct InMemoryBackend {
    name: String,
    memories: RwLock<HashMap<String, Memory>>,
    contexts: RwLock<HashMap<String, Context>>,
    available: AtomicBool,
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memories: RwLock::new(HashMap::new()),
            contexts: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; while offline every call fails with a backend fault
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::debug!(backend = %self.name, available, "availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(MemoryError::backend(&self.name, "backend offline"))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("in_memory")
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn put_memory(&self, memory: &Memory) -> Result<()> {
        self.check()?;
        self.memories
            .write()
            .await
            .insert(memory.id.clone(), memory.clone());
        Ok(())
    }

    async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        self.check()?;
        Ok(self.memories.read().await.get(id).cloned())
    }

    async fn delete_memory(&self, id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.memories.write().await.remove(id).is_some())
    }

    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        self.check()?;
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
        self.check()?;
        self.contexts
            .write()
            .await
            .insert(context.id.clone(), context.clone());
        Ok(())
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>> {
        self.check()?;
        Ok(self.contexts.read().await.get(id).cloned())
    }

    async fn delete_context(&self, id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.contexts.write().await.remove(id).is_some())
    }

    async fn list_contexts(&self, agent_id: Option<&str>) -> Result<Vec<Context>> {
        self.check()?;
        Ok(self
            .contexts
            .read()
            .await
            .values()
            .filter(|c| agent_id.map_or(true, |a| c.agent_id == a))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryKind, NewMemory};
    use chrono::Utc;

    #[tokio::test]
    async fn crud_roundtrip() {
        let backend = InMemoryBackend::default();
        let memory = NewMemory::new("agent", MemoryKind::Episodic, "met Alice").into_memory(Utc::now());

        backend.put_memory(&memory).await.unwrap();
        assert_eq!(backend.get_memory(&memory.id).await.unwrap(), Some(memory.clone()));
        assert!(backend.delete_memory(&memory.id).await.unwrap());
        assert!(!backend.delete_memory(&memory.id).await.unwrap());
        assert_eq!(backend.get_memory(&memory.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_backend_reports_faults() {
        let backend = InMemoryBackend::default();
        backend.set_available(false);

        let err = backend.ping().await.unwrap_err();
        assert!(err.is_backend_fault());
        assert!(backend.get_memory("x").await.unwrap_err().is_backend_fault());

        backend.set_available(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn default_association_walk_is_depth_bounded() {
        let backend = InMemoryBackend::default();
        let now = Utc::now();
        let c = NewMemory::new("a", MemoryKind::Semantic, "c").into_memory(now);
        let b = NewMemory::new("a", MemoryKind::Semantic, "b")
            .with_association(c.id.clone(), 0.5)
            .into_memory(now);
        let mut a = NewMemory::new("a", MemoryKind::Semantic, "a")
            .with_association(b.id.clone(), 0.9)
            .into_memory(now);
        // Cycle back to the start must not loop.
        let mut c_cyclic = c.clone();
        c_cyclic.associate(a.id.clone(), 0.1);
        a.associate("missing", 0.3);

        for m in [&a, &b, &c_cyclic] {
            backend.put_memory(m).await.unwrap();
        }

        let one = backend.associated(&a.id, 1).await.unwrap();
        assert_eq!(one.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec![b.id.as_str()]);

        let two = backend.associated(&a.id, 5).await.unwrap();
        assert_eq!(
            two.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec![b.id.as_str(), c.id.as_str()]
        );
    }
}
