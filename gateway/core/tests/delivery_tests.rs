//! End-to-end webhook delivery tests: payload contents, retry timing, and
//! exhaustion behavior with the full engine running.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use gateway_core::{
    Capabilities, DeliverySink, Error, FixedMonitor, Gateway, GatewayConfig, GenerationRequest,
    GenerationResult, Provider, ProviderKind, ProviderPreset, Result, TaskId, TaskSpec,
    TaskStatus, TokenUsage, WebhookPayload,
};

/// Sink that replays scripted outcomes and records attempt times/payloads.
struct ScriptedSink {
    outcomes: Mutex<Vec<Result<()>>>,
    attempts: Mutex<Vec<(Instant, WebhookPayload)>>,
}

impl ScriptedSink {
    fn new(outcomes: Vec<Result<()>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn attempts(&self) -> Vec<(Instant, WebhookPayload)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for ScriptedSink {
    async fn deliver(&self, _url: &str, payload: &WebhookPayload) -> Result<()> {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.push((Instant::now(), payload.clone()));
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            Ok(())
        } else {
            outcomes.remove(0)
        }
    }
}

struct EchoProvider {
    fail: bool,
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }
    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteApi
    }
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        if self.fail {
            return Err(Error::GenerationFailed("injected".into()));
        }
        Ok(GenerationResult {
            text: format!("echo: {}", request.prompt),
            finish_reason: "stop".into(),
            usage: TokenUsage {
                prompt_tokens: 2,
                completion_tokens: 3,
                total_tokens: 5,
            },
            model: request.model.clone(),
        })
    }
    async fn healthcheck(&self) -> bool {
        true
    }
}

fn gateway_with(sink: Arc<ScriptedSink>, fail: bool) -> Gateway {
    let mut config = GatewayConfig::default();
    config.providers.push(ProviderPreset::local("echo"));
    let gateway =
        Gateway::from_parts(&config, sink, Arc::new(FixedMonitor::new(24_000))).unwrap();
    gateway.registry().register("echo", Arc::new(EchoProvider { fail }));
    gateway
}

async fn wait_terminal(gateway: &Gateway, id: &TaskId) -> TaskStatus {
    for _ in 0..200 {
        let task = gateway.task(id).unwrap();
        if task.status.is_terminal() {
            return task.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {id} never reached a terminal state");
}

async fn wait_attempts(sink: &ScriptedSink, count: usize) {
    for _ in 0..400 {
        if sink.attempt_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "expected {count} delivery attempts, saw {}",
        sink.attempt_count()
    );
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success_with_backoff() {
    let sink = ScriptedSink::new(vec![
        Err(Error::DeliveryFailed("500".into())),
        Err(Error::DeliveryFailed("500".into())),
        Ok(()),
    ]);
    let mut gateway = gateway_with(Arc::clone(&sink), false);

    let task = gateway
        .create_task(TaskSpec::new("m", "p").with_callback_url("https://example.com/hook"))
        .unwrap();
    gateway.start();
    wait_terminal(&gateway, &task.id).await;
    wait_attempts(&sink, 3).await;
    gateway.shutdown().await;

    let attempts = sink.attempts();
    assert_eq!(attempts.len(), 3);
    // 1s backoff after the first failure, 2s after the second.
    assert!(attempts[1].0 - attempts[0].0 >= Duration::from_secs(1));
    assert!(attempts[2].0 - attempts[1].0 >= Duration::from_secs(2));
    assert!(attempts[2].0 - attempts[0].0 >= Duration::from_secs(3));
}

#[tokio::test]
async fn test_completed_payload_carries_result() {
    let sink = ScriptedSink::new(vec![Ok(())]);
    let mut gateway = gateway_with(Arc::clone(&sink), false);

    let task = gateway
        .create_task(TaskSpec::new("m", "hello").with_callback_url("https://example.com/hook"))
        .unwrap();
    gateway.start();
    wait_terminal(&gateway, &task.id).await;
    wait_attempts(&sink, 1).await;
    gateway.shutdown().await;

    let attempts = sink.attempts();
    let payload = &attempts[0].1;
    assert_eq!(payload.task_id, task.id);
    assert_eq!(payload.status, TaskStatus::Completed);
    assert_eq!(payload.model, "m");
    assert_eq!(payload.result.as_ref().unwrap().text, "echo: hello");
    assert!(payload.error.is_none());
}

#[tokio::test]
async fn test_failed_payload_carries_error() {
    let sink = ScriptedSink::new(vec![Ok(())]);
    let mut gateway = gateway_with(Arc::clone(&sink), true);

    let task = gateway
        .create_task(TaskSpec::new("m", "p").with_callback_url("https://example.com/hook"))
        .unwrap();
    gateway.start();
    assert_eq!(wait_terminal(&gateway, &task.id).await, TaskStatus::Failed);
    wait_attempts(&sink, 1).await;
    gateway.shutdown().await;

    let payload = sink.attempts()[0].1.clone();
    assert_eq!(payload.status, TaskStatus::Failed);
    assert!(payload.result.is_none());
    assert_eq!(payload.error.as_ref().unwrap().code, "generation_failed");
}

#[tokio::test]
async fn test_result_suppressed_when_not_requested() {
    let sink = ScriptedSink::new(vec![Ok(())]);
    let mut gateway = gateway_with(Arc::clone(&sink), false);

    let mut spec = TaskSpec::new("m", "p").with_callback_url("https://example.com/hook");
    spec.deliver_result = false;
    let task = gateway.create_task(spec).unwrap();
    gateway.start();
    wait_terminal(&gateway, &task.id).await;
    wait_attempts(&sink, 1).await;
    gateway.shutdown().await;

    let payload = sink.attempts()[0].1.clone();
    assert_eq!(payload.status, TaskStatus::Completed);
    assert!(payload.result.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_delivery_never_touches_the_task() {
    let sink = ScriptedSink::new(vec![
        Err(Error::DeliveryFailed("500".into())),
        Err(Error::DeliveryFailed("500".into())),
        Err(Error::DeliveryFailed("500".into())),
    ]);
    let mut gateway = gateway_with(Arc::clone(&sink), false);

    let task = gateway
        .create_task(TaskSpec::new("m", "p").with_callback_url("https://example.com/hook"))
        .unwrap();
    gateway.start();
    wait_terminal(&gateway, &task.id).await;
    wait_attempts(&sink, 3).await;
    let record = gateway.task(&task.id).unwrap();
    gateway.shutdown().await;

    assert_eq!(sink.attempt_count(), 3);
    // Delivery exhaustion is logged only; the record stays completed.
    assert_eq!(record.status, TaskStatus::Completed);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn test_task_without_callback_delivers_nothing() {
    let sink = ScriptedSink::new(vec![]);
    let mut gateway = gateway_with(Arc::clone(&sink), false);

    let task = gateway.create_task(TaskSpec::new("m", "p")).unwrap();
    gateway.start();
    wait_terminal(&gateway, &task.id).await;
    gateway.shutdown().await;

    assert_eq!(sink.attempt_count(), 0);
}
