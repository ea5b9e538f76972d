//! Local inference provider.
//!
//! Talks to a colocated inference server (Ollama-style REST API) over
//! loopback HTTP. The only provider kind that occupies the accelerator,
//! so the orchestrator holds the device lease for the whole call.
//!
//! # API surface used
//!
//! - `POST /api/generate`: completions, batch or newline-delimited JSON stream
//! - `POST /api/embed`: embedding vectors
//! - `GET /api/tags`: reachability probe

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{Capabilities, GenerationRequest, Provider, ProviderKind, StreamChunk};
use super::ProviderPreset;
use crate::error::{Error, Result};
use crate::task::{GenerationResult, TokenUsage};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Provider backed by a local inference server.
pub struct LocalProvider {
    name: String,
    base_url: String,
    capabilities: Capabilities,
    footprint_mb: Option<u64>,
    client: reqwest::Client,
}

impl LocalProvider {
    /// Construct from a validated preset.
    pub fn from_preset(preset: &ProviderPreset) -> Result<Self> {
        let base_url = preset
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
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
            capabilities: preset.capabilities,
            footprint_mb: preset.footprint_mb,
            client,
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn embed_url(&self) -> String {
        format!("{}/api/embed", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn request_body(&self, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": stream,
        });
        // Generation params pass through as inference options.
        if request.params.is_object() {
            body["options"] = request.params.clone();
        }
        body
    }

    fn map_send_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(format!("{}: request timed out", self.name))
        } else if err.is_connect() {
            Error::GenerationFailed(format!("{}: backend unreachable: {err}", self.name))
        } else {
            Error::GenerationFailed(format!("{}: {err}", self.name))
        }
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            429 => Error::RateLimited(format!("{}: {body}", self.name)),
            401 | 403 => Error::AuthenticationFailure(self.name.clone()),
            _ => Error::GenerationFailed(format!("{}: {status}: {body}", self.name)),
        })
    }

    fn result_from_final(model: &str, text: String, data: &serde_json::Value) -> GenerationResult {
        let prompt_tokens = data
            .get("prompt_eval_count")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        let completion_tokens = data
            .get("eval_count")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        let finish_reason = data
            .get("done_reason")
            .and_then(|r| r.as_str())
            .unwrap_or("stop")
            .to_string();
        GenerationResult {
            text,
            finish_reason,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn estimated_footprint_mb(&self) -> Option<u64> {
        self.footprint_mb
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let response = self
            .client
            .post(self.generate_url())
            .json(&self.request_body(request, false))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = self.check_status(response).await?;

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::GenerationFailed(format!("{}: bad response: {e}", self.name)))?;
        let text = data
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();
        Ok(Self::result_from_final(&request.model, text, &data))
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        if !self.capabilities.stream {
            return Err(Error::CapabilityUnsupported {
                provider: self.name.clone(),
                capability: "stream",
            });
        }
        let (tx, rx) = mpsc::channel(100);

        let response = self
            .client
            .post(self.generate_url())
            .json(&self.request_body(request, true))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = self.check_status(response).await?;

        let model = request.model.clone();
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Newline-delimited JSON frames.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(data) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };
                    if let Some(token) = data.get("response").and_then(|r| r.as_str()) {
                        full_response.push_str(token);
                        if tx
                            .send(StreamChunk::Token(token.to_string()))
                            .await
                            .is_err()
                        {
                            // Receiver dropped, stop streaming.
                            return;
                        }
                    }
                    if data
                        .get("done")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false)
                    {
                        let result = Self::result_from_final(
                            &model,
                            std::mem::take(&mut full_response),
                            &data,
                        );
                        let _ = tx.send(StreamChunk::Done(result)).await;
                        return;
                    }
                }
            }

            // Stream ended without a done frame.
            if !full_response.is_empty() {
                let result = GenerationResult {
                    text: full_response,
                    finish_reason: "stop".to_string(),
                    usage: TokenUsage::default(),
                    model,
                };
                let _ = tx.send(StreamChunk::Done(result)).await;
            }
        });

        Ok(rx)
    }

    async fn embed(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if !self.capabilities.embed {
            return Err(Error::CapabilityUnsupported {
                provider: self.name.clone(),
                capability: "embed",
            });
        }
        let response = self
            .client
            .post(self.embed_url())
            .json(&serde_json::json!({ "model": model, "input": inputs }))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = self.check_status(response).await?;

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::GenerationFailed(format!("{}: bad response: {e}", self.name)))?;
        let vectors = data
            .get("embeddings")
            .and_then(|e| e.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|vals| {
                                vals.iter()
                                    .filter_map(serde_json::Value::as_f64)
                                    .map(|v| v as f32)
                                    .collect()
                            })
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(vectors)
    }

    async fn healthcheck(&self) -> bool {
        self.client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
