//! Backend health tracking.
//!
//! A probe loop pings every backend on a fixed interval and folds the results into a
//! ranking snapshot published through a `watch` channel. Routing code reads the latest
//! snapshot without ever waiting on a probe.

use crate::backend::Backend;
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Availability of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

impl HealthState {
    /// Whether the coordinator may send traffic to a backend in this state
    pub fn is_routable(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendHealthRecord {
    pub backend_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BackendHealthRecord {
    fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_probe_at: None,
            last_success_at: None,
            last_error: None,
        }
    }
}

/// Ranking of the chain at one point in time, in priority order
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub records: Vec<BackendHealthRecord>,
    /// Bumped on every state transition
    pub generation: u64,
}

impl HealthSnapshot {
    pub fn state(&self, index: usize) -> Option<HealthState> {
        self.records.get(index).map(|r| r.state)
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        self.state(index) == Some(HealthState::Healthy)
    }

    /// Indices of backends that may serve traffic, highest priority first
    pub fn routable(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state.is_routable())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Probe loop settings
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before Healthy becomes Degraded
    pub degraded_after: u32,
    /// Consecutive failures before Degraded becomes Unavailable
    pub unavailable_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            degraded_after: 2,
            unavailable_after: 3,
        }
    }
}

impl HealthConfig {
    pub fn builder() -> HealthConfigBuilder {
        HealthConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct HealthConfigBuilder {
    config: HealthConfig,
}

impl HealthConfigBuilder {
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn degraded_after(mut self, failures: u32) -> Self {
        self.config.degraded_after = failures.max(1);
        self
    }

    pub fn unavailable_after(mut self, failures: u32) -> Self {
        self.config.unavailable_after = failures.max(1);
        self
    }

    pub fn build(self) -> HealthConfig {
        self.config
    }
}

/// Health monitor for every backend of the chain
#[derive(Debug)]
pub struct HealthMonitor {
    backends: Vec<Arc<dyn Backend>>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    tx: watch::Sender<Arc<HealthSnapshot>>,
}

impl HealthMonitor {
    /// All backends start Healthy
    pub fn new(backends: Vec<Arc<dyn Backend>>, config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        let records = backends
            .iter()
            .map(|b| BackendHealthRecord::new(b.name()))
            .collect();
        let (tx, _rx) = watch::channel(Arc::new(HealthSnapshot {
            records,
            generation: 0,
        }));
        Self {
            backends,
            config,
            clock,
            tx,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Latest published ranking
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver that wakes on every state transition
    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthSnapshot>> {
        self.tx.subscribe()
    }

    /// Probe every backend once, concurrently, and apply the results.
    /// Returns whether any backend changed state.
    pub async fn probe_once(&self) -> bool {
        let timeout = self.config.probe_timeout;
        let probes = self.backends.iter().map(|backend| async move {
            match tokio::time::timeout(timeout, backend.ping()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("probe timed out after {timeout:?}")),
            }
        });
        let results = futures::future::join_all(probes).await;
        let now = self.clock.now();
        let (degraded_after, unavailable_after) =
            (self.config.degraded_after, self.config.unavailable_after);

        self.tx.send_if_modified(|snapshot| {
            let next = Arc::make_mut(snapshot);
            let mut changed = false;

            for (record, result) in next.records.iter_mut().zip(results) {
                record.last_probe_at = Some(now);
                let before = record.state;
                match result {
                    Ok(()) => {
                        record.consecutive_failures = 0;
                        record.last_success_at = Some(now);
                        record.last_error = None;
                        record.state = HealthState::Healthy;
                    }
                    Err(error) => {
                        record.consecutive_failures += 1;
                        tracing::warn!(
                            backend = %record.backend_id,
                            failures = record.consecutive_failures,
                            %error,
                            "health probe failed"
                        );
                        record.last_error = Some(error);
                        // One step per cycle at most.
                        record.state = match record.state {
                            HealthState::Healthy
                                if record.consecutive_failures >= degraded_after =>
                            {
                                HealthState::Degraded
                            }
                            HealthState::Degraded
                                if record.consecutive_failures >= unavailable_after =>
                            {
                                HealthState::Unavailable
                            }
                            state => state,
                        };
                    }
                }
                if record.state != before {
                    tracing::info!(
                        backend = %record.backend_id,
                        from = %before,
                        to = %record.state,
                        "backend health transition"
                    );
                    changed = true;
                }
            }

            if changed {
                next.generation += 1;
            }
            changed
        })
    }

    /// Mark a backend Unavailable after a fault seen on the request path
    pub fn report_failure(&self, index: usize, error: &str) {
        let now = self.clock.now();
        self.tx.send_if_modified(|snapshot| {
            let Some(current) = snapshot.records.get(index) else {
                return false;
            };
            if current.state == HealthState::Unavailable {
                return false;
            }

            let next = Arc::make_mut(snapshot);
            let record = &mut next.records[index];
            let before = record.state;
            record.state = HealthState::Unavailable;
            record.consecutive_failures += 1;
            record.last_probe_at = Some(now);
            record.last_error = Some(error.to_string());
            next.generation += 1;
            tracing::warn!(
                backend = %next.records[index].backend_id,
                from = %before,
                error,
                "backend marked unavailable by request path"
            );
            true
        });
    }

    /// Run the probe loop until shutdown is signalled
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval = ?self.config.probe_interval, "health monitor started");
            let mut ticker = tokio::time::interval(self.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; backends start Healthy.
            ticker.tick().await;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::clock::SystemClock;

    fn monitor_with(backend: Arc<InMemoryBackend>) -> HealthMonitor {
        let backends: Vec<Arc<dyn Backend>> = vec![backend, Arc::new(InMemoryBackend::new("spare"))];
        HealthMonitor::new(backends, HealthConfig::default(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn probe_failures_step_down_one_state_per_cycle() {
        let primary = Arc::new(InMemoryBackend::new("primary"));
        let monitor = monitor_with(Arc::clone(&primary));
        primary.set_available(false);

        assert!(!monitor.probe_once().await);
        assert_eq!(monitor.snapshot().state(0), Some(HealthState::Healthy));

        assert!(monitor.probe_once().await);
        assert_eq!(monitor.snapshot().state(0), Some(HealthState::Degraded));

        assert!(monitor.probe_once().await);
        assert_eq!(monitor.snapshot().state(0), Some(HealthState::Unavailable));
        assert_eq!(monitor.snapshot().routable(), vec![1]);
        assert_eq!(monitor.snapshot().records[0].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn one_success_restores_health() {
        let primary = Arc::new(InMemoryBackend::new("primary"));
        let monitor = monitor_with(Arc::clone(&primary));
        monitor.report_failure(0, "connection refused");
        assert_eq!(monitor.snapshot().state(0), Some(HealthState::Unavailable));

        assert!(monitor.probe_once().await);
        let snapshot = monitor.snapshot();
        assert!(snapshot.is_healthy(0));
        assert_eq!(snapshot.records[0].consecutive_failures, 0);
        assert!(snapshot.records[0].last_success_at.is_some());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let primary = Arc::new(InMemoryBackend::new("primary"));
        let monitor = monitor_with(primary);
        let mut rx = monitor.subscribe();
        let before = rx.borrow_and_update().generation;

        monitor.report_failure(0, "boom");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().generation, before + 1);

        // Reporting an already unavailable backend publishes nothing.
        monitor.report_failure(0, "boom again");
        assert!(!rx.has_changed().unwrap());
    }
}
