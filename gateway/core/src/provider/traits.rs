//! Provider trait and request/response types.
//!
//! Implementations handle backend-specific details (API formats, auth);
//! the orchestrator only sees this interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::task::{GenerationResult, Task};

/// Which implementation backs a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Colocated inference server driving the accelerator directly
    Local,
    /// OpenAI-compatible remote API
    RemoteApi,
    /// Bespoke HTTP endpoint speaking the plain gateway contract
    CustomHttp,
}

impl ProviderKind {
    /// Whether execution must hold the accelerator lease
    #[must_use]
    pub fn requires_accelerator(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::RemoteApi => "remote_api",
            Self::CustomHttp => "custom_http",
        };
        write!(f, "{s}")
    }
}

/// What a provider can do. Checked at dispatch time; requesting an
/// unsupported operation is a [`Error::CapabilityUnsupported`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Capabilities {
    /// Plain text generation
    #[serde(default = "default_true")]
    pub generate: bool,
    /// Token streaming
    #[serde(default)]
    pub stream: bool,
    /// Embedding vectors
    #[serde(default)]
    pub embed: bool,
    /// Schema-constrained output
    #[serde(default)]
    pub structured_output: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            generate: true,
            stream: false,
            embed: false,
            structured_output: false,
        }
    }
}

/// What the orchestrator hands a provider: the execution-relevant slice of
/// a claimed task.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Model identifier
    pub model: String,
    /// Prompt text
    pub prompt: String,
    /// Opaque generation parameters, forwarded to the backend
    pub params: serde_json::Value,
}

impl GenerationRequest {
    /// Build a request from a claimed task record
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            model: task.model.clone(),
            prompt: task.prompt.clone(),
            params: task.params.clone(),
        }
    }
}

/// Events on a provider token stream.
#[derive(Clone, Debug)]
pub enum StreamChunk {
    /// A token from the response
    Token(String),
    /// Stream finished; carries the assembled result
    Done(GenerationResult),
    /// Stream aborted with an error
    Error(String),
}

/// A generation backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name as configured
    fn name(&self) -> &str;

    /// Which implementation this is
    fn kind(&self) -> ProviderKind;

    /// Declared capabilities
    fn capabilities(&self) -> Capabilities;

    /// Estimated device memory footprint once loaded, MB. `None` for
    /// providers that do not occupy the accelerator.
    fn estimated_footprint_mb(&self) -> Option<u64> {
        None
    }

    /// Run a generation to completion.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult>;

    /// Stream tokens as they arrive. The channel closes after a `Done` or
    /// `Error` chunk.
    async fn stream(&self, request: &GenerationRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        let _ = request;
        Err(Error::CapabilityUnsupported {
            provider: self.name().to_string(),
            capability: "stream",
        })
    }

    /// Compute embedding vectors for the inputs.
    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let _ = (model, inputs);
        Err(Error::CapabilityUnsupported {
            provider: self.name().to_string(),
            capability: "embed",
        })
    }

    /// Whether the backend is reachable right now
    async fn healthcheck(&self) -> bool;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskSpec};

    #[test]
    fn test_only_local_requires_accelerator() {
        assert!(ProviderKind::Local.requires_accelerator());
        assert!(!ProviderKind::RemoteApi.requires_accelerator());
        assert!(!ProviderKind::CustomHttp.requires_accelerator());
    }

    #[test]
    fn test_request_from_task() {
        let spec = TaskSpec::new("llama-7b", "hello")
            .with_params(serde_json::json!({"temperature": 0.2}));
        let task = Task::from_spec(TaskId::generate(), spec);
        let request = GenerationRequest::from_task(&task);
        assert_eq!(request.model, "llama-7b");
        assert_eq!(request.prompt, "hello");
        assert_eq!(request.params["temperature"], 0.2);
    }

    #[test]
    fn test_default_capabilities() {
        let caps = Capabilities::default();
        assert!(caps.generate);
        assert!(!caps.stream);
        assert!(!caps.embed);
    }
}
