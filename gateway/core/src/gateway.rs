//! Gateway Facade
//!
//! Wires the store, provider registry, accelerator guard, orchestrator, and
//! delivery dispatcher into one handle. The daemon (or an embedding
//! application) talks to this type only: create and query tasks, subscribe
//! to status events, start and stop the engine.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::GatewayConfig;
use crate::device::{DeviceGuard, DeviceStats, FixedMonitor, ResourceMonitor};
use crate::error::Result;
use crate::orchestrator::{Orchestrator, OrchestratorHandle};
use crate::provider::ProviderRegistry;
use crate::store::{CancelOutcome, StoreStats, TaskEvent, TaskStore};
use crate::task::{Task, TaskId, TaskSpec};
use crate::webhook::{DeliveryDispatcher, DeliverySink, HttpSink};

/// Point-in-time engine snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct GatewayStats {
    /// Store counters
    pub store: StoreStats,
    /// Accelerator readings
    pub device: DeviceStats,
    /// Whether the accelerator lease is currently held
    pub device_held: bool,
}

/// The scheduling and execution engine.
///
/// Construct with [`Gateway::from_config`] inside a tokio runtime (the
/// delivery dispatcher spawns its workers immediately), call
/// [`Gateway::start`] to begin consuming the queue, and
/// [`Gateway::shutdown`] to drain and stop.
pub struct Gateway {
    store: Arc<TaskStore>,
    registry: Arc<ProviderRegistry>,
    guard: Arc<DeviceGuard>,
    dispatcher: Arc<DeliveryDispatcher>,
    orchestrator: Arc<Orchestrator>,
    handle: Option<OrchestratorHandle>,
}

impl Gateway {
    /// Build the engine from configuration with the shipped HTTP webhook
    /// sink and fixed resource monitor.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let sink = HttpSink::new(config.webhook_config().request_timeout)?;
        let monitor = FixedMonitor::new(config.device.total_memory_mb);
        Self::from_parts(config, Arc::new(sink), Arc::new(monitor))
    }

    /// Build the engine with injected webhook sink and resource monitor.
    pub fn from_parts(
        config: &GatewayConfig,
        sink: Arc<dyn DeliverySink>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<Self> {
        let store = Arc::new(TaskStore::new(config.store_config()));
        let registry = Arc::new(ProviderRegistry::new(config.providers.clone())?);
        let guard = Arc::new(DeviceGuard::new(config.device_config(), monitor));
        let dispatcher = Arc::new(DeliveryDispatcher::start(config.webhook_config(), sink));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&guard),
            Arc::clone(&dispatcher),
            config.orchestrator_config(),
        ));
        Ok(Self {
            store,
            registry,
            guard,
            dispatcher,
            orchestrator,
            handle: None,
        })
    }

    /// Start the consumer loop. Idempotent while running.
    pub fn start(&mut self) {
        if self.handle.is_none() {
            self.handle = Some(Arc::clone(&self.orchestrator).start());
        }
    }

    /// Stop the consumer, then drain in-flight webhook deliveries.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
        }
        drop(self.orchestrator);
        match Arc::try_unwrap(self.dispatcher) {
            Ok(dispatcher) => dispatcher.shutdown().await,
            Err(_) => tracing::warn!("delivery dispatcher still shared at shutdown"),
        }
    }

    /// Validate and enqueue a task. Idempotency keys make this safe to
    /// retry: a repeat create returns the existing task.
    pub fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        // Surface an unroutable model at creation time, not at dispatch.
        self.registry.provider_for_model(&spec.model)?;
        self.store.create(spec)
    }

    /// Fetch a task record.
    pub fn task(&self, id: &TaskId) -> Result<Task> {
        self.store.get(id)
    }

    /// Cancel a task: synchronous while pending, cooperative while
    /// processing.
    pub fn cancel(&self, id: &TaskId) -> Result<CancelOutcome> {
        self.store.cancel(id)
    }

    /// Subscribe to status-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.store.subscribe()
    }

    /// Snapshot of queue, records, and device state.
    pub fn stats(&self) -> Result<GatewayStats> {
        Ok(GatewayStats {
            store: self.store.stats(),
            device: self.guard.probe()?,
            device_held: self.guard.is_held(),
        })
    }

    /// Probe every configured provider.
    pub async fn healthcheck(&self) -> Vec<(String, bool)> {
        self.registry.healthcheck_all().await
    }

    /// Drop expired terminal tasks and idempotency mappings; returns the
    /// number of tasks removed. The daemon runs this on an interval.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    /// The underlying store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// The provider registry handle.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The accelerator guard handle.
    #[must_use]
    pub fn guard(&self) -> &Arc<DeviceGuard> {
        &self.guard
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("running", &self.handle.is_some())
            .field("providers", &self.registry.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderPreset;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.providers.push(ProviderPreset::local("ollama"));
        config
    }

    #[tokio::test]
    async fn test_create_and_query_through_facade() {
        let gateway = Gateway::from_config(&config()).unwrap();
        let task = gateway.create_task(TaskSpec::new("llama-7b", "hi")).unwrap();
        let fetched = gateway.task(&task.id).unwrap();
        assert_eq!(fetched.id, task.id);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_unroutable_model_rejected_at_create() {
        let mut config = GatewayConfig::default();
        let mut preset = ProviderPreset::local("ollama");
        preset.models = vec!["llama-7b".into()];
        config.providers.push(preset);

        let gateway = Gateway::from_config(&config).unwrap();
        let err = gateway
            .create_task(TaskSpec::new("unknown-model", "hi"))
            .unwrap_err();
        assert_eq!(err.code(), "provider_not_found");
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let gateway = Gateway::from_config(&config()).unwrap();
        gateway.create_task(TaskSpec::new("m", "p")).unwrap();
        let stats = gateway.stats().unwrap();
        assert_eq!(stats.store.queue_size, 1);
        assert!(!stats.device_held);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_without_start() {
        let gateway = Gateway::from_config(&config()).unwrap();
        gateway.shutdown().await;
    }
}
