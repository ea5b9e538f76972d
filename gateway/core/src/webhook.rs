//! Delivery Dispatcher
//!
//! Ships terminal-state notifications to producer callback URLs through a
//! bounded worker pool. The orchestrator hands a task off and moves on; it
//! awaits queue capacity but never the delivery outcome. Delivery failures
//! are retried with backoff and, once exhausted, logged and dropped; they
//! never mutate the task record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result, TaskError};
use crate::task::{GenerationResult, Task, TaskId, TaskStatus};

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Number of delivery workers
    pub workers: usize,
    /// Pending-delivery queue capacity; enqueue awaits when full
    pub queue_capacity: usize,
    /// Attempts per delivery before giving up
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,
    /// Per-attempt timeout
    pub request_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// The notification body posted to a callback URL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Task that reached a terminal state
    pub task_id: TaskId,
    /// Terminal status
    pub status: TaskStatus,
    /// Model the task targeted
    pub model: String,
    /// Generation result, when completed and the producer asked for it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
    /// Error description, when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl WebhookPayload {
    /// Build the payload for a terminal task, honoring its
    /// `deliver_result` flag.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            model: task.model.clone(),
            result: if task.deliver_result {
                task.result.clone()
            } else {
                None
            },
            error: task.error.clone(),
        }
    }
}

/// Transport seam for deliveries. The shipped implementation posts JSON
/// over HTTP; tests substitute scripted sinks.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Attempt one delivery. An `Err` counts as a failed attempt.
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<()>;
}

/// HTTP JSON delivery.
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    /// Build the sink; `request_timeout` caps each attempt.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("webhook http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliverySink for HttpSink {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::DeliveryFailed(format!("{url}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::DeliveryFailed(format!("{url}: {status}")))
        }
    }
}

struct Delivery {
    url: String,
    payload: WebhookPayload,
}

/// Bounded worker pool shipping webhook notifications.
pub struct DeliveryDispatcher {
    tx: mpsc::Sender<Delivery>,
    workers: Vec<JoinHandle<()>>,
}

impl DeliveryDispatcher {
    /// Spawn the worker pool over the given sink.
    #[must_use]
    pub fn start(config: WebhookConfig, sink: Arc<dyn DeliverySink>) -> Self {
        let (tx, rx) = mpsc::channel::<Delivery>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let config = Arc::new(config);

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let sink = Arc::clone(&sink);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        Self::run_delivery(&config, sink.as_ref(), &job).await;
                    }
                    tracing::debug!(worker, "delivery worker stopped");
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Queue a notification for the task's callback URL. Awaits queue
    /// capacity; returns once the delivery is queued, not delivered.
    pub async fn enqueue(&self, task: &Task) -> Result<()> {
        let Some(url) = task.callback_url.clone() else {
            return Ok(());
        };
        let delivery = Delivery {
            url,
            payload: WebhookPayload::from_task(task),
        };
        self.tx
            .send(delivery)
            .await
            .map_err(|_| Error::DeliveryFailed("dispatcher is shut down".into()))
    }

    async fn run_delivery(config: &WebhookConfig, sink: &dyn DeliverySink, job: &Delivery) {
        for attempt in 0..config.max_attempts {
            let outcome =
                tokio::time::timeout(config.request_timeout, sink.deliver(&job.url, &job.payload))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::DeliveryFailed(format!(
                            "{}: attempt timed out",
                            job.url
                        )))
                    });
            match outcome {
                Ok(()) => {
                    tracing::info!(
                        task_id = %job.payload.task_id,
                        url = %job.url,
                        attempt = attempt + 1,
                        "webhook delivered"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %job.payload.task_id,
                        url = %job.url,
                        attempt = attempt + 1,
                        error = %e,
                        "webhook attempt failed"
                    );
                    if attempt + 1 < config.max_attempts {
                        tokio::time::sleep(config.base_delay * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        tracing::error!(
            task_id = %job.payload.task_id,
            url = %job.url,
            attempts = config.max_attempts,
            "webhook delivery exhausted"
        );
    }

    /// Stop accepting work and wait for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    struct ScriptedSink {
        outcomes: StdMutex<VecDeque<Result<()>>>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedSink {
        fn new(outcomes: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes.into()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliverySink for ScriptedSink {
        async fn deliver(&self, url: &str, _payload: &WebhookPayload) -> Result<()> {
            self.calls.lock().unwrap().push(url.to_string());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    fn terminal_task(deliver_result: bool) -> Task {
        let mut spec =
            TaskSpec::new("llama-7b", "hi").with_callback_url("https://example.com/hook");
        spec.deliver_result = deliver_result;
        let mut task = Task::from_spec(TaskId::generate(), spec);
        task.transition(TaskStatus::Processing).unwrap();
        task.result = Some(GenerationResult {
            text: "out".into(),
            finish_reason: "stop".into(),
            usage: Default::default(),
            model: "llama-7b".into(),
        });
        task.transition(TaskStatus::Completed).unwrap();
        task
    }

    #[test]
    fn test_payload_honors_deliver_result_flag() {
        let with = WebhookPayload::from_task(&terminal_task(true));
        assert!(with.result.is_some());

        let without = WebhookPayload::from_task(&terminal_task(false));
        assert!(without.result.is_none());
        assert_eq!(without.status, TaskStatus::Completed);
    }

    #[test]
    fn test_payload_omits_empty_fields_in_json() {
        let payload = WebhookPayload::from_task(&terminal_task(false));
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["status"], "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_until_success() {
        let sink = ScriptedSink::new(vec![
            Err(Error::DeliveryFailed("500".into())),
            Err(Error::DeliveryFailed("500".into())),
            Ok(()),
        ]);
        let dispatcher = DeliveryDispatcher::start(WebhookConfig::default(), sink.clone());

        let started = Instant::now();
        dispatcher.enqueue(&terminal_task(true)).await.unwrap();
        dispatcher.shutdown().await;

        // Two failures cost a 1s and a 2s backoff before the third attempt.
        assert_eq!(sink.call_count(), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_drops_delivery() {
        let sink = ScriptedSink::new(vec![
            Err(Error::DeliveryFailed("500".into())),
            Err(Error::DeliveryFailed("500".into())),
            Err(Error::DeliveryFailed("500".into())),
            Ok(()),
        ]);
        let dispatcher = DeliveryDispatcher::start(WebhookConfig::default(), sink.clone());
        dispatcher.enqueue(&terminal_task(true)).await.unwrap();
        dispatcher.shutdown().await;
        // Hard cap at max_attempts; the queued Ok is never reached.
        assert_eq!(sink.call_count(), 3);
    }

    #[tokio::test]
    async fn test_tasks_without_callback_are_skipped() {
        let sink = ScriptedSink::new(vec![]);
        let dispatcher = DeliveryDispatcher::start(WebhookConfig::default(), sink.clone());

        let task = Task::from_spec(TaskId::generate(), TaskSpec::new("m", "p"));
        dispatcher.enqueue(&task).await.unwrap();
        dispatcher.shutdown().await;
        assert_eq!(sink.call_count(), 0);
    }

    #[tokio::test]
    async fn test_single_success_delivers_once() {
        let sink = ScriptedSink::new(vec![Ok(())]);
        let dispatcher = DeliveryDispatcher::start(WebhookConfig::default(), sink.clone());
        dispatcher.enqueue(&terminal_task(true)).await.unwrap();
        dispatcher.shutdown().await;
        assert_eq!(sink.call_count(), 1);
    }
}
