//! Remote HTTP providers.
//!
//! Two flavors that never touch the accelerator: [`RemoteApiProvider`]
//! speaks the OpenAI-compatible chat completions surface, and
//! [`CustomHttpProvider`] posts the plain gateway contract to a bespoke
//! endpoint. Throttling and timeouts map to transient errors so the
//! orchestrator can retry them in place.

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{Capabilities, GenerationRequest, Provider, ProviderKind};
use super::ProviderPreset;
use crate::error::{Error, Result};
use crate::task::{GenerationResult, TokenUsage};

#[derive(Debug)]
struct HttpBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    fn from_preset(preset: &ProviderPreset) -> Result<Self> {
        let base_url = preset
            .base_url
            .clone()
            .ok_or_else(|| Error::InvalidConfig {
                name: preset.name.clone(),
                reason: "base_url is required".into(),
            })?
            .trim_end_matches('/')
            .to_string();
        let api_key = match &preset.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| Error::InvalidConfig {
                name: preset.name.clone(),
                reason: format!("api key env var '{var}' is not set"),
            })?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(preset.timeout_secs))
            .build()
            .map_err(|e| Error::InvalidConfig {
                name: preset.name.clone(),
                reason: format!("http client: {e}"),
            })?;
        Ok(Self {
            name: preset.name.clone(),
            base_url,
            api_key,
            client,
        })
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn map_send_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(format!("{}: request timed out", self.name))
        } else {
            Error::GenerationFailed(format!("{}: {err}", self.name))
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => Error::AuthenticationFailure(self.name.clone()),
                429 => Error::RateLimited(format!("{}: {body}", self.name)),
                _ => Error::GenerationFailed(format!("{}: {status}: {body}", self.name)),
            });
        }
        response
            .json()
            .await
            .map_err(|e| Error::GenerationFailed(format!("{}: bad response: {e}", self.name)))
    }

    async fn reachable(&self, url: String) -> bool {
        let mut builder = self.client.get(url).timeout(Duration::from_secs(5));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// OpenAI-compatible chat completions provider.
#[derive(Debug)]
pub struct RemoteApiProvider {
    backend: HttpBackend,
    capabilities: Capabilities,
}

impl RemoteApiProvider {
    /// Construct from a validated preset.
    pub fn from_preset(preset: &ProviderPreset) -> Result<Self> {
        Ok(Self {
            backend: HttpBackend::from_preset(preset)?,
            capabilities: preset.capabilities,
        })
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        // Sampling params merge into the top-level request.
        if let Some(params) = request.params.as_object() {
            if let Some(obj) = body.as_object_mut() {
                for (k, v) in params {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        body
    }

    fn parse_response(&self, data: &serde_json::Value, model: &str) -> Result<GenerationResult> {
        let choice = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| {
                Error::GenerationFailed(format!("{}: response carried no choices", self.name()))
            })?;
        let text = choice
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let finish_reason = choice
            .get("finish_reason")
            .and_then(|r| r.as_str())
            .unwrap_or("stop")
            .to_string();
        let usage = data.get("usage").map_or_else(TokenUsage::default, |u| {
            let field = |k: &str| u.get(k).and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
            TokenUsage {
                prompt_tokens: field("prompt_tokens"),
                completion_tokens: field("completion_tokens"),
                total_tokens: field("total_tokens"),
            }
        });
        Ok(GenerationResult {
            text,
            finish_reason,
            usage,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Provider for RemoteApiProvider {
    fn name(&self) -> &str {
        &self.backend.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteApi
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let url = format!("{}/chat/completions", self.backend.base_url);
        let response = self
            .backend
            .post(url)
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|e| self.backend.map_send_error(e))?;
        let data = self.backend.check_status(response).await?;
        self.parse_response(&data, &request.model)
    }

    async fn healthcheck(&self) -> bool {
        self.backend
            .reachable(format!("{}/models", self.backend.base_url))
            .await
    }
}

/// Provider posting the plain gateway contract to a bespoke endpoint:
/// request `{model, prompt, params}`, response `{text, finish_reason?, usage?}`.
pub struct CustomHttpProvider {
    backend: HttpBackend,
    capabilities: Capabilities,
}

impl CustomHttpProvider {
    /// Construct from a validated preset.
    pub fn from_preset(preset: &ProviderPreset) -> Result<Self> {
        Ok(Self {
            backend: HttpBackend::from_preset(preset)?,
            capabilities: preset.capabilities,
        })
    }
}

#[async_trait]
impl Provider for CustomHttpProvider {
    fn name(&self) -> &str {
        &self.backend.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::CustomHttp
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "params": request.params,
        });
        let response = self
            .backend
            .post(self.backend.base_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.backend.map_send_error(e))?;
        let data = self.backend.check_status(response).await?;

        let text = data
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                Error::GenerationFailed(format!("{}: response carried no text", self.name()))
            })?
            .to_string();
        let finish_reason = data
            .get("finish_reason")
            .and_then(|r| r.as_str())
            .unwrap_or("stop")
            .to_string();
        let usage = data
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default();
        Ok(GenerationResult {
            text,
            finish_reason,
            usage,
            model: request.model.clone(),
        })
    }

    async fn healthcheck(&self) -> bool {
        self.backend.reachable(self.backend.base_url.clone()).await
    }
}
