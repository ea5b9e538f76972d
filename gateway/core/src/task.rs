//! Task Types
//!
//! The unit of work flowing through the engine: the producer-facing spec,
//! the persisted record, and the status machine. The store owns persistence;
//! the orchestrator exclusively owns status transitions after enqueue.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TaskError};

/// Task identifier (`task-` followed by 16 hex chars)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(
    /// The underlying id string
    pub String,
);

impl TaskId {
    /// Create a task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID
    #[must_use]
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("task-{}", &hex[..16]))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created and enqueued, not yet claimed
    Pending,
    /// Claimed by the orchestrator, execution in flight
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error (includes cancellation)
    Failed,
}

impl TaskStatus {
    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether this status is terminal
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal transition from this status.
    ///
    /// Transitions are monotonic: Pending -> Processing, Pending -> Failed
    /// (synchronous cancel), Processing -> Completed, Processing -> Failed.
    /// Everything else is an internal consistency violation.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Result of a successful generation, persisted on the task record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Generated text
    pub text: String,
    /// Why generation stopped (`stop`, `length`, `error`)
    pub finish_reason: String,
    /// Token accounting
    pub usage: TokenUsage,
    /// Model that produced the text
    pub model: String,
}

/// Token usage counters reported by a provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens generated
    pub completion_tokens: u32,
    /// Sum of the above
    pub total_tokens: u32,
}

/// Producer-supplied description of the work to run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Target model name (must match a provider preset)
    pub model: String,
    /// Prompt text
    pub prompt: String,
    /// Generation parameters, opaque to the engine
    #[serde(default)]
    pub params: serde_json::Value,
    /// Dispatch priority; higher runs first, FIFO within a priority class
    #[serde(default)]
    pub priority: i32,
    /// At-most-once creation token, valid for the idempotency TTL window
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// URL notified on terminal state
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Whether the webhook payload should carry the full result
    #[serde(default = "default_deliver_result")]
    pub deliver_result: bool,
}

fn default_deliver_result() -> bool {
    true
}

impl TaskSpec {
    /// Create a spec with defaults for the optional fields
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            params: serde_json::Value::Null,
            priority: 0,
            idempotency_key: None,
            callback_url: None,
            deliver_result: true,
        }
    }

    /// Set the dispatch priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the idempotency key
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the callback URL
    #[must_use]
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Set the generation parameters
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Reject malformed specs before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Validation("model must not be empty".into()));
        }
        if self.prompt.is_empty() {
            return Err(Error::Validation("prompt must not be empty".into()));
        }
        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(Error::Validation(
                    "idempotency_key must not be blank".into(),
                ));
            }
        }
        if let Some(url) = &self.callback_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Validation(format!(
                    "callback_url must be http(s), got '{url}'"
                )));
            }
        }
        Ok(())
    }

    /// Fingerprint used to detect an idempotency key being reused with a
    /// different spec. Covers the fields that change what would execute.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "{}\u{1}{}\u{1}{}\u{1}{}",
            self.model, self.prompt, self.params, self.priority
        )
    }
}

/// A persisted task record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// Current status
    pub status: TaskStatus,
    /// Target model name
    pub model: String,
    /// Provider the orchestrator resolved for this task (set at claim time)
    pub provider: Option<String>,
    /// Prompt text
    pub prompt: String,
    /// Opaque generation parameters
    pub params: serde_json::Value,
    /// Dispatch priority, immutable after creation
    pub priority: i32,
    /// Idempotency key, if the producer supplied one
    pub idempotency_key: Option<String>,
    /// Webhook target, if the producer requested notification
    pub callback_url: Option<String>,
    /// Whether the webhook carries the full result payload
    pub deliver_result: bool,
    /// Result of a completed generation
    pub result: Option<GenerationResult>,
    /// Error description of a failed generation
    pub error: Option<TaskError>,
    /// Provider call attempts made (retries included)
    pub attempts: u32,
    /// Cooperative cancellation flag; advisory once Processing
    pub cancel_requested: bool,
    /// Creation time (unix ms)
    pub created_at: u64,
    /// Last update time (unix ms)
    pub updated_at: u64,
    /// Terminal time (unix ms), set with the terminal transition
    pub finished_at: Option<u64>,
}

impl Task {
    /// Create a new pending task from a validated spec
    #[must_use]
    pub fn from_spec(id: TaskId, spec: TaskSpec) -> Self {
        let now = now_ms();
        Self {
            id,
            status: TaskStatus::Pending,
            model: spec.model,
            provider: None,
            prompt: spec.prompt,
            params: spec.params,
            priority: spec.priority,
            idempotency_key: spec.idempotency_key,
            callback_url: spec.callback_url,
            deliver_result: spec.deliver_result,
            result: None,
            error: None,
            attempts: 0,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Apply a status transition, enforcing the monotonic table.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal status transition {} -> {} for {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        self.updated_at = now_ms();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }
}

/// Current unix time in milliseconds
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_generate() {
        let id1 = TaskId::generate();
        let id2 = TaskId::generate();
        assert_ne!(id1, id2);
        assert!(id1.0.starts_with("task-"));
        assert_eq!(id1.0.len(), "task-".len() + 16);
    }

    #[test]
    fn test_status_transition_table() {
        use TaskStatus::{Completed, Failed, Pending, Processing};
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_illegal_transition_is_internal_error() {
        let mut task = Task::from_spec(TaskId::generate(), TaskSpec::new("m", "p"));
        task.transition(TaskStatus::Processing).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        let err = task.transition(TaskStatus::Pending).unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }

    #[test]
    fn test_terminal_sets_finished_at() {
        let mut task = Task::from_spec(TaskId::generate(), TaskSpec::new("m", "p"));
        assert!(task.finished_at.is_none());
        task.transition(TaskStatus::Processing).unwrap();
        assert!(task.finished_at.is_none());
        task.transition(TaskStatus::Failed).unwrap();
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_spec_validation() {
        assert!(TaskSpec::new("model", "prompt").validate().is_ok());
        assert!(TaskSpec::new("", "prompt").validate().is_err());
        assert!(TaskSpec::new("model", "").validate().is_err());
        assert!(TaskSpec::new("model", "p")
            .with_idempotency_key("  ")
            .validate()
            .is_err());
        assert!(TaskSpec::new("model", "p")
            .with_callback_url("ftp://nope")
            .validate()
            .is_err());
        assert!(TaskSpec::new("model", "p")
            .with_callback_url("https://example.com/hook")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_fingerprint_tracks_execution_fields() {
        let a = TaskSpec::new("m", "p").with_priority(1);
        let b = TaskSpec::new("m", "p").with_priority(1);
        let c = TaskSpec::new("m", "other").with_priority(1);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
