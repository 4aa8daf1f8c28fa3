//! Write events.
//!
//! Every successful mutation emits an [`Event`]. In-process observers (the similarity
//! index) see it synchronously before the mutation returns; external subscribers get it
//! through a broadcast channel and may lag.
//!
//! ```rust,no_run
//! use strata::{EventFilter, EventType, MemoryService, ServiceConfig};
//!
//! # async fn demo() -> strata::Result<()> {
//! let service = MemoryService::open(ServiceConfig::new("./data")).await?;
//! let mut stored = service.events().subscribe_filtered(
//!     EventFilter::new().with_event_type(EventType::MemoryStored),
//! );
//! tokio::spawn(async move {
//!     while let Some(event) = stored.recv().await {
//!         println!("{}", event.description());
//!     }
//! });
//! # Ok(())
//! # }
//! ```

use crate::types::{AgentId, ContextId, Memory, MemoryId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    MemoryStored {
        memory: Memory,
        timestamp: DateTime<Utc>,
    },

    MemoryUpdated {
        memory: Memory,
        previous_version: u64,
        timestamp: DateTime<Utc>,
    },

    MemoryAccessed {
        memory_id: MemoryId,
        agent_id: AgentId,
        access_count: u64,
        timestamp: DateTime<Utc>,
    },

    /// Soft forget (tombstone)
    MemoryForgotten {
        memory_id: MemoryId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// Physical removal
    MemoryDeleted {
        memory_id: MemoryId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    ContextSaved {
        context_id: ContextId,
        agent_id: AgentId,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    ContextSwitched {
        agent_id: AgentId,
        from: Option<ContextId>,
        to: ContextId,
        timestamp: DateTime<Utc>,
    },

    ContextDeleted {
        context_id: ContextId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    ConsolidationCompleted {
        tombstoned: usize,
        purged: usize,
        compressed: usize,
        contexts_collected: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::MemoryStored { timestamp, .. }
            | Event::MemoryUpdated { timestamp, .. }
            | Event::MemoryAccessed { timestamp, .. }
            | Event::MemoryForgotten { timestamp, .. }
            | Event::MemoryDeleted { timestamp, .. }
            | Event::ContextSaved { timestamp, .. }
            | Event::ContextSwitched { timestamp, .. }
            | Event::ContextDeleted { timestamp, .. }
            | Event::ConsolidationCompleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn memory_id(&self) -> Option<&str> {
        match self {
            Event::MemoryStored { memory, .. } | Event::MemoryUpdated { memory, .. } => {
                Some(&memory.id)
            }
            Event::MemoryAccessed { memory_id, .. }
            | Event::MemoryForgotten { memory_id, .. }
            | Event::MemoryDeleted { memory_id, .. } => Some(memory_id),
            _ => None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Event::MemoryStored { memory, .. } | Event::MemoryUpdated { memory, .. } => {
                Some(&memory.agent_id)
            }
            Event::MemoryAccessed { agent_id, .. }
            | Event::MemoryForgotten { agent_id, .. }
            | Event::MemoryDeleted { agent_id, .. }
            | Event::ContextSaved { agent_id, .. }
            | Event::ContextSwitched { agent_id, .. }
            | Event::ContextDeleted { agent_id, .. } => Some(agent_id),
            Event::ConsolidationCompleted { .. } => None,
        }
    }

    /// Human-readable one-liner
    pub fn description(&self) -> String {
        match self {
            Event::MemoryStored { memory, .. } => {
                format!("New {} memory stored: {}", memory.kind, memory.id)
            }
            Event::MemoryUpdated {
                memory,
                previous_version,
                ..
            } => format!(
                "Memory {} updated: v{} -> v{}",
                memory.id, previous_version, memory.version
            ),
            Event::MemoryAccessed {
                memory_id,
                access_count,
                ..
            } => format!("Memory {} accessed (count: {})", memory_id, access_count),
            Event::MemoryForgotten { memory_id, .. } => format!("Memory {} forgotten", memory_id),
            Event::MemoryDeleted { memory_id, .. } => format!("Memory {} deleted", memory_id),
            Event::ContextSaved {
                context_id,
                version,
                ..
            } => format!("Context {} saved at v{}", context_id, version),
            Event::ContextSwitched {
                agent_id, from, to, ..
            } => match from {
                Some(from) => format!("Agent {} switched context {} -> {}", agent_id, from, to),
                None => format!("Agent {} activated context {}", agent_id, to),
            },
            Event::ContextDeleted { context_id, .. } => format!("Context {} deleted", context_id),
            Event::ConsolidationCompleted {
                tombstoned,
                purged,
                compressed,
                contexts_collected,
                ..
            } => format!(
                "Consolidation: {} tombstoned, {} purged, {} compressed, {} contexts collected",
                tombstoned, purged, compressed, contexts_collected
            ),
        }
    }
}

/// Event kinds (for filtering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    MemoryStored,
    MemoryUpdated,
    MemoryAccessed,
    MemoryForgotten,
    MemoryDeleted,
    ContextSaved,
    ContextSwitched,
    ContextDeleted,
    ConsolidationCompleted,
}

impl From<&Event> for EventType {
    fn from(event: &Event) -> Self {
        match event {
            Event::MemoryStored { .. } => EventType::MemoryStored,
            Event::MemoryUpdated { .. } => EventType::MemoryUpdated,
            Event::MemoryAccessed { .. } => EventType::MemoryAccessed,
            Event::MemoryForgotten { .. } => EventType::MemoryForgotten,
            Event::MemoryDeleted { .. } => EventType::MemoryDeleted,
            Event::ContextSaved { .. } => EventType::ContextSaved,
            Event::ContextSwitched { .. } => EventType::ContextSwitched,
            Event::ContextDeleted { .. } => EventType::ContextDeleted,
            Event::ConsolidationCompleted { .. } => EventType::ConsolidationCompleted,
        }
    }
}

/// Filter for subscribing to specific events
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub agent_id: Option<AgentId>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_types.get_or_insert_with(Vec::new).push(event_type);
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.contains(&EventType::from(event)) {
                return false;
            }
        }
        if let Some(ref agent_id) = self.agent_id {
            // Agent-less events never match an agent filter.
            if event.agent_id() != Some(agent_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Synchronous hook on the write path
pub trait WriteObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_emitted: u64,
    pub by_type: HashMap<EventType, u64>,
    pub last_emitted: Option<DateTime<Utc>>,
}

/// Event bus for the memory service
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    observers: Arc<RwLock<Vec<Arc<dyn WriteObserver>>>>,
    stats: Arc<Mutex<EventStats>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(Mutex::new(EventStats::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredSubscriber {
        FilteredSubscriber {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn WriteObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Run observers, then broadcast. Never fails; having no subscribers is normal.
    pub fn emit(&self, event: Event) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.total_emitted += 1;
            stats.last_emitted = Some(event.timestamp());
            *stats.by_type.entry(EventType::from(&event)).or_insert(0) += 1;
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_event(&event);
        }

        if self.sender.receiver_count() > 0 {
            if let Err(e) = self.sender.send(event) {
                tracing::debug!("event dropped: {}", e);
            }
        }
    }

    pub fn stats(&self) -> EventStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Subscriber that only yields matching events
pub struct FilteredSubscriber {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl FilteredSubscriber {
    /// Next matching event; `None` once the bus is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}
