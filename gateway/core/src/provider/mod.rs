//! Provider Abstraction
//!
//! Capability-bearing generation backends behind one trait, plus the lazy
//! registry that constructs them from configuration presets. The engine
//! never talks HTTP directly; the orchestrator resolves a provider by model
//! name and dispatches through the trait.

mod local;
mod registry;
mod remote;
mod traits;

pub use local::LocalProvider;
pub use registry::ProviderRegistry;
pub use remote::{CustomHttpProvider, RemoteApiProvider};
pub use traits::{
    Capabilities, GenerationRequest, Provider, ProviderKind, StreamChunk,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A configured provider entry, one `[[providers]]` table in the gateway
/// config. Validated at registry construction, instantiated lazily on first
/// use.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProviderPreset {
    /// Unique provider name
    pub name: String,
    /// Which implementation to construct
    pub kind: ProviderKind,
    /// Backend base URL. Optional for `local` (defaults to the conventional
    /// localhost inference port), required otherwise.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key. Secrets never live in the
    /// config file itself.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Model names this provider serves. Empty means any model.
    #[serde(default)]
    pub models: Vec<String>,
    /// Capability flags; defaults to plain text generation
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Estimated device memory footprint when loaded, MB. Only meaningful
    /// for accelerator-bound providers.
    #[serde(default)]
    pub footprint_mb: Option<u64>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl ProviderPreset {
    /// Minimal preset for a local provider
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Local,
            base_url: None,
            api_key_env: None,
            models: Vec::new(),
            capabilities: Capabilities::default(),
            footprint_mb: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Whether this preset serves the given model
    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    /// Reject presets that cannot possibly construct a working provider.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig {
                name: self.name.clone(),
                reason: "provider name must not be empty".into(),
            });
        }
        if self.kind != ProviderKind::Local && self.base_url.is_none() {
            return Err(Error::InvalidConfig {
                name: self.name.clone(),
                reason: format!("base_url is required for kind '{}'", self.kind),
            });
        }
        if let Some(url) = &self.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::InvalidConfig {
                    name: self.name.clone(),
                    reason: format!("base_url must be http(s), got '{url}'"),
                });
            }
        }
        if self.timeout_secs == 0 {
            return Err(Error::InvalidConfig {
                name: self.name.clone(),
                reason: "timeout_secs must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_validation() {
        assert!(ProviderPreset::local("ollama").validate().is_ok());

        let mut remote = ProviderPreset::local("api");
        remote.kind = ProviderKind::RemoteApi;
        assert!(remote.validate().is_err());

        remote.base_url = Some("https://api.example.com/v1".into());
        assert!(remote.validate().is_ok());

        remote.base_url = Some("ftp://nope".into());
        assert!(remote.validate().is_err());
    }

    #[test]
    fn test_preset_model_matching() {
        let mut preset = ProviderPreset::local("ollama");
        assert!(preset.serves("anything"));

        preset.models = vec!["llama-7b".into(), "qwen-14b".into()];
        assert!(preset.serves("llama-7b"));
        assert!(!preset.serves("gpt-4o"));
    }

    #[test]
    fn test_preset_toml_round_trip() {
        let toml = r#"
            name = "openai"
            kind = "remote_api"
            base_url = "https://api.openai.com/v1"
            api_key_env = "OPENAI_API_KEY"
            models = ["gpt-4o-mini"]
        "#;
        let preset: ProviderPreset = toml::from_str(toml).unwrap();
        assert_eq!(preset.kind, ProviderKind::RemoteApi);
        assert_eq!(preset.timeout_secs, 120);
        assert!(preset.capabilities.generate);
        preset.validate().unwrap();
    }
}
