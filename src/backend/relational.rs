//! Relational backend using SQLite

use super::{rank_matches, Backend, BackendKind, MemoryFilter, SearchQuery};
use crate::error::{MemoryError, Result};
use crate::types::{Context, ContextStatus, Memory, MemoryKind};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;

const MEMORY_COLUMNS: &str = "id, agent_id, kind, content, embedding, tags, importance, decay_rate, \
     associations, created_at, updated_at, accessed_at, access_count, version, deleted_at";

const CONTEXT_COLUMNS: &str = "id, agent_id, task_id, parent_id, status, version, state, \
     memory_refs, focus_refs, checkpoints, created_at, updated_at";

/// SQLite-backed store for memories and contexts
#[derive(Clone)]
pub struct RelationalBackend {
    name: String,
    pool: SqlitePool,
}

impl std::fmt::Debug for RelationalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalBackend")
            .field("name", &self.name)
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl RelationalBackend {
    /// Open (creating if missing) a database file and run migrations
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// Create an in-memory database, mostly for tests
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .create_if_missing(true);

        // A single never-recycled connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| MemoryError::Database(e.into()))?;

        Ok(Self {
            name: "relational".to_string(),
            pool,
        })
    }

    /// Get a reference to the SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Backend for RelationalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn put_memory(&self, memory: &Memory) -> Result<()> {
        let embedding_json = memory
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO memories (
                id, agent_id, kind, content, embedding, tags, importance, decay_rate,
                associations, created_at, updated_at, accessed_at, access_count, version, deleted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                embedding = excluded.embedding,
                tags = excluded.tags,
                importance = excluded.importance,
                decay_rate = excluded.decay_rate,
                associations = excluded.associations,
                updated_at = excluded.updated_at,
                accessed_at = excluded.accessed_at,
                access_count = excluded.access_count,
                version = excluded.version,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&memory.id)
        .bind(&memory.agent_id)
        .bind(memory.kind.as_str())
        .bind(&memory.content)
        .bind(embedding_json)
        .bind(serde_json::to_string(&memory.tags)?)
        .bind(memory.importance)
        .bind(memory.decay_rate)
        .bind(serde_json::to_string(&memory.associations)?)
        .bind(memory.created_at)
        .bind(memory.updated_at)
        .bind(memory.accessed_at)
        .bind(memory.access_count as i64)
        .bind(memory.version as i64)
        .bind(memory.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let row = sqlx::query(&format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_memory).transpose()
    }

    async fn delete_memory(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE 1 = 1");
        if filter.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }

        let mut query = sqlx::query(&sql);
        if let Some(agent_id) = &filter.agent_id {
            query = query.bind(agent_id);
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_memory).collect()
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Memory>> {
        // SQL narrows to the agent/kind/tombstone slice; scoring is shared with the
        // other backends so results do not depend on which one served the query.
        let candidates = self.list_memories(&query.filter()).await?;
        Ok(rank_matches(candidates, query))
    }

    async fn put_context(&self, context: &Context) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contexts (
                id, agent_id, task_id, parent_id, status, version, state,
                memory_refs, focus_refs, checkpoints, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                task_id = excluded.task_id,
                parent_id = excluded.parent_id,
                status = excluded.status,
                version = excluded.version,
                state = excluded.state,
                memory_refs = excluded.memory_refs,
                focus_refs = excluded.focus_refs,
                checkpoints = excluded.checkpoints,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&context.id)
        .bind(&context.agent_id)
        .bind(context.task_id.as_ref())
        .bind(context.parent_id.as_ref())
        .bind(context.status.to_string())
        .bind(context.version as i64)
        .bind(serde_json::to_string(&context.state)?)
        .bind(serde_json::to_string(&context.memory_refs)?)
        .bind(serde_json::to_string(&context.focus_refs)?)
        .bind(serde_json::to_string(&context.checkpoints)?)
        .bind(context.created_at)
        .bind(context.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>> {
        let row = sqlx::query(&format!("SELECT {CONTEXT_COLUMNS} FROM contexts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_context).transpose()
    }

    async fn delete_context(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM contexts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_contexts(&self, agent_id: Option<&str>) -> Result<Vec<Context>> {
        let rows = match agent_id {
            Some(agent_id) => {
                sqlx::query(&format!(
                    "SELECT {CONTEXT_COLUMNS} FROM contexts WHERE agent_id = ?"
                ))
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {CONTEXT_COLUMNS} FROM contexts"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_context).collect()
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        tracing::debug!(backend = %self.name, "connection pool closed");
        Ok(())
    }
}

/// Helper: Convert database row to Memory
fn row_to_memory(row: &SqliteRow) -> Result<Memory> {
    let kind: String = row.try_get("kind")?;
    let embedding: Option<String> = row.try_get("embedding")?;
    let tags: String = row.try_get("tags")?;
    let associations: String = row.try_get("associations")?;

    Ok(Memory {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        kind: kind.parse::<MemoryKind>()?,
        content: row.try_get("content")?,
        embedding: embedding.map(|e| serde_json::from_str(&e)).transpose()?,
        tags: serde_json::from_str(&tags)?,
        importance: row.try_get("importance")?,
        decay_rate: row.try_get("decay_rate")?,
        associations: serde_json::from_str(&associations)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        accessed_at: row.try_get("accessed_at")?,
        access_count: row.try_get::<i64, _>("access_count")?.max(0) as u64,
        version: row.try_get::<i64, _>("version")?.max(0) as u64,
        deleted_at: row.try_get("deleted_at")?,
    })
}

/// Helper: Convert database row to Context
fn row_to_context(row: &SqliteRow) -> Result<Context> {
    let status: String = row.try_get("status")?;
    let state: String = row.try_get("state")?;
    let memory_refs: String = row.try_get("memory_refs")?;
    let focus_refs: String = row.try_get("focus_refs")?;
    let checkpoints: String = row.try_get("checkpoints")?;

    Ok(Context {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        task_id: row.try_get("task_id")?,
        parent_id: row.try_get("parent_id")?,
        status: parse_status(&status)?,
        version: row.try_get::<i64, _>("version")?.max(0) as u64,
        state: serde_json::from_str(&state)?,
        memory_refs: serde_json::from_str(&memory_refs)?,
        focus_refs: serde_json::from_str(&focus_refs)?,
        checkpoints: serde_json::from_str(&checkpoints)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Helper: Parse context status from string
fn parse_status(s: &str) -> Result<ContextStatus> {
    match s {
        "active" => Ok(ContextStatus::Active),
        "checkpointed" => Ok(ContextStatus::Checkpointed),
        "archived" => Ok(ContextStatus::Archived),
        other => Err(MemoryError::Corruption(format!("unknown context status '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewMemory;
    use chrono::Utc;

    #[tokio::test]
    async fn memory_upsert_roundtrip() {
        let backend = RelationalBackend::connect_in_memory().await.unwrap();
        let mut memory = NewMemory::new("agent", MemoryKind::Procedural, "run cargo fmt before commit")
            .with_tag("workflow")
            .with_embedding(vec![0.25, 0.5, 1.0])
            .with_association("other", 0.75)
            .into_memory(Utc::now());

        backend.put_memory(&memory).await.unwrap();
        assert_eq!(backend.get_memory(&memory.id).await.unwrap(), Some(memory.clone()));

        memory.version = 2;
        memory.deleted_at = Some(Utc::now());
        backend.put_memory(&memory).await.unwrap();
        let loaded = backend.get_memory(&memory.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert!(loaded.is_deleted());

        assert!(backend
            .list_memories(&MemoryFilter::live_for("agent"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(backend.list_memories(&MemoryFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_filters_by_kind() {
        let backend = RelationalBackend::connect_in_memory().await.unwrap();
        let now = Utc::now();
        let proc = NewMemory::new("agent", MemoryKind::Procedural, "deploy with ansible").into_memory(now);
        let epi = NewMemory::new("agent", MemoryKind::Episodic, "deploy failed on friday").into_memory(now);
        backend.put_memory(&proc).await.unwrap();
        backend.put_memory(&epi).await.unwrap();

        let all = backend.search(&SearchQuery::new("agent", "deploy", 10)).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_proc = backend
            .search(&SearchQuery::new("agent", "deploy", 10).with_kind(Some(MemoryKind::Procedural)))
            .await
            .unwrap();
        assert_eq!(only_proc, vec![proc]);
    }

    #[tokio::test]
    async fn context_roundtrip_and_delete() {
        let backend = RelationalBackend::connect_in_memory().await.unwrap();
        let mut ctx = Context::new("agent", Utc::now());
        ctx.task_id = Some("task-7".into());
        ctx.set_state("cursor", serde_json::json!(42));
        backend.put_context(&ctx).await.unwrap();

        assert_eq!(backend.get_context(&ctx.id).await.unwrap(), Some(ctx.clone()));
        assert_eq!(backend.list_contexts(None).await.unwrap().len(), 1);
        assert!(backend.delete_context(&ctx.id).await.unwrap());
        assert_eq!(backend.get_context(&ctx.id).await.unwrap(), None);
    }
}
