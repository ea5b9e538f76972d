//! Task Orchestrator
//!
//! The single consumer draining the dispatch queue. One orchestrator runs
//! per accelerator (a deployment invariant); it claims the highest-priority
//! pending task, resolves a provider, takes the device lease when the
//! provider needs it, runs the generation, writes the terminal state, and
//! hands terminal tasks to the delivery dispatcher.
//!
//! The queue is not a retry mechanism: only transient provider errors
//! (timeouts, throttling) are retried, in place, with a fixed backoff and a
//! bounded attempt count. Every other failure is terminal on first
//! occurrence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::device::DeviceGuard;
use crate::error::{Error, Result, TaskError};
use crate::provider::{GenerationRequest, Provider, ProviderRegistry};
use crate::store::TaskStore;
use crate::task::{GenerationResult, Task};
use crate::webhook::DeliveryDispatcher;

/// How a task's execution ended, short of an error.
enum TaskOutcome {
    /// Generation succeeded
    Completed(GenerationResult),
    /// A cooperative cancellation won; any result is discarded
    Cancelled,
}

/// Execution tuning.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// How long to wait for the accelerator lease before failing the task
    pub lease_wait: Duration,
    /// Provider call attempts per task (transient errors only)
    pub max_attempts: u32,
    /// Fixed delay between transient retries
    pub retry_delay: Duration,
    /// Poll fallback when idle, in case a wakeup is missed
    pub idle_poll: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_wait: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            idle_poll: Duration::from_millis(500),
        }
    }
}

/// Handle to a running orchestrator loop.
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Signal shutdown and wait for the in-flight task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "orchestrator loop panicked");
        }
    }
}

/// The scheduling consumer.
pub struct Orchestrator {
    store: Arc<TaskStore>,
    registry: Arc<ProviderRegistry>,
    guard: Arc<DeviceGuard>,
    dispatcher: Arc<DeliveryDispatcher>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wire the orchestrator over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<ProviderRegistry>,
        guard: Arc<DeviceGuard>,
        dispatcher: Arc<DeliveryDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            guard,
            dispatcher,
            config,
        }
    }

    /// Spawn the consumer loop.
    #[must_use]
    pub fn start(self: Arc<Self>) -> OrchestratorHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(self.run(rx));
        OrchestratorHandle { shutdown, join }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("orchestrator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.store.try_claim() {
                Some(task) => self.execute(task).await,
                None => {
                    tokio::select! {
                        () = self.store.wait_for_work() => {}
                        () = tokio::time::sleep(self.config.idle_poll) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        tracing::info!("orchestrator stopped");
    }

    /// Run one claimed task to its terminal state. Never returns an error:
    /// execution failures land on the task record, not the loop.
    async fn execute(&self, task: Task) {
        tracing::info!(
            task_id = %task.id,
            model = %task.model,
            priority = task.priority,
            "task claimed"
        );
        match self.run_task(&task).await {
            Ok(TaskOutcome::Completed(result)) => {
                let tokens = result.usage.total_tokens;
                match self.store.complete(&task.id, result) {
                    Ok(terminal) => {
                        tracing::info!(task_id = %task.id, tokens, "task completed");
                        self.hand_off(&terminal).await;
                    }
                    Err(e) => {
                        tracing::error!(task_id = %task.id, error = %e, "terminal write failed");
                    }
                }
            }
            Ok(TaskOutcome::Cancelled) => match self.store.fail(&task.id, TaskError::cancelled()) {
                Ok(terminal) => {
                    tracing::info!(task_id = %task.id, "task cancelled");
                    self.hand_off(&terminal).await;
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "terminal write failed");
                }
            },
            Err(err) => {
                match self.store.fail(&task.id, TaskError::from_error(&err)) {
                    Ok(terminal) => {
                        tracing::warn!(task_id = %task.id, error = %err, "task failed");
                        self.hand_off(&terminal).await;
                    }
                    Err(e) => {
                        tracing::error!(task_id = %task.id, error = %e, "terminal write failed");
                    }
                }
            }
        }
    }

    async fn run_task(&self, task: &Task) -> Result<TaskOutcome> {
        if self.cancel_requested(task) {
            return Ok(TaskOutcome::Cancelled);
        }

        let provider = self.registry.resolve_model(&task.model).await?;
        self.store.set_provider(&task.id, provider.name())?;
        if !provider.capabilities().generate {
            return Err(Error::CapabilityUnsupported {
                provider: provider.name().to_string(),
                capability: "generate",
            });
        }

        // Local providers occupy the accelerator; the lease spans the whole
        // call and drops with this scope on every path.
        let _lease = if provider.kind().requires_accelerator() {
            self.admit(task, provider.as_ref())?;
            Some(
                self.guard
                    .acquire(&task.id, &task.model, self.config.lease_wait)
                    .await?,
            )
        } else {
            None
        };

        if self.cancel_requested(task) {
            return Ok(TaskOutcome::Cancelled);
        }
        let result = self.generate_with_retries(task, provider.as_ref()).await?;
        // A cancellation that landed mid-generation still wins; the result
        // is discarded.
        if self.cancel_requested(task) {
            return Ok(TaskOutcome::Cancelled);
        }
        Ok(TaskOutcome::Completed(result))
    }

    /// Admission check, skipped on the hot path where the model is already
    /// resident.
    fn admit(&self, task: &Task, provider: &dyn Provider) -> Result<()> {
        if self.guard.resident_model().as_deref() == Some(task.model.as_str()) {
            return Ok(());
        }
        let Some(footprint_mb) = provider.estimated_footprint_mb() else {
            return Ok(());
        };
        if self.guard.can_admit(footprint_mb)? {
            Ok(())
        } else {
            Err(Error::ResourceExhausted(format!(
                "model '{}' needs {footprint_mb} MB over the admission ceiling",
                task.model
            )))
        }
    }

    async fn generate_with_retries(
        &self,
        task: &Task,
        provider: &dyn Provider,
    ) -> Result<GenerationResult> {
        let request = GenerationRequest::from_task(task);
        loop {
            let attempt = self.store.note_attempt(&task.id)?;
            match provider.generate(&request).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    tracing::warn!(
                        task_id = %task.id,
                        provider = provider.name(),
                        attempt,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn cancel_requested(&self, task: &Task) -> bool {
        self.store.cancel_requested(&task.id)
    }

    async fn hand_off(&self, terminal: &Task) {
        if terminal.callback_url.is_none() {
            return;
        }
        if let Err(e) = self.dispatcher.enqueue(terminal).await {
            tracing::error!(task_id = %terminal.id, error = %e, "webhook handoff failed");
        }
    }
}
