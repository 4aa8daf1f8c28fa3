//! Service configuration: one struct aggregating every component's settings.

use crate::cache::CacheConfig;
use crate::consolidation::ConsolidationConfig;
use crate::context::ContextConfig;
use crate::coordinator::CoordinatorConfig;
use crate::health::HealthConfig;
use crate::sync::SyncConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root for the default backend chain (graph snapshot, sqlite file, flat files)
    pub data_dir: PathBuf,
    /// Deadline applied to every service operation
    pub default_timeout: Duration,
    /// Deadline for one embedding provider call
    pub embed_timeout: Duration,
    pub event_capacity: usize,
    /// Spawn the health probe loop and the consolidation scheduler
    pub background_tasks: bool,
    pub health: HealthConfig,
    pub sync: SyncConfig,
    pub coordinator: CoordinatorConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub consolidation: ConsolidationConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            default_timeout: Duration::from_secs(30),
            embed_timeout: Duration::from_secs(10),
            event_capacity: 1024,
            background_tasks: true,
            health: HealthConfig::default(),
            sync: SyncConfig::default(),
            coordinator: CoordinatorConfig::default(),
            cache: CacheConfig::default(),
            context: ContextConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn builder(data_dir: impl AsRef<Path>) -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::new(data_dir),
        }
    }

    pub fn graph_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("graph.bin")
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memories.db")
    }

    pub fn flatfile_dir(&self) -> PathBuf {
        self.data_dir.join("flat")
    }
}

#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn embed_timeout(mut self, timeout: Duration) -> Self {
        self.config.embed_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Disable background tasks; health probes and consolidation then run on demand only
    pub fn background_tasks(mut self, enabled: bool) -> Self {
        self.config.background_tasks = enabled;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.config.coordinator = coordinator;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn context(mut self, context: ContextConfig) -> Self {
        self.config.context = context;
        self
    }

    pub fn consolidation(mut self, consolidation: ConsolidationConfig) -> Self {
        self.config.consolidation = consolidation;
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.config
    }
}
