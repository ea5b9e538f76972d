//! Lazy provider registry.
//!
//! Presets come from configuration; providers are constructed on first use
//! and cached. Construction is serialized behind one lock so concurrent
//! first use builds exactly one instance.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::traits::{Provider, ProviderKind};
use super::{CustomHttpProvider, LocalProvider, ProviderPreset, RemoteApiProvider};
use crate::error::{Error, Result};

/// Registry of configured providers with lazy instantiation.
#[derive(Debug)]
pub struct ProviderRegistry {
    presets: Vec<ProviderPreset>,
    cache: DashMap<String, Arc<dyn Provider>>,
    creation: Mutex<()>,
}

impl ProviderRegistry {
    /// Build a registry over validated presets. Duplicate names are a
    /// configuration error.
    pub fn new(presets: Vec<ProviderPreset>) -> Result<Self> {
        for (i, preset) in presets.iter().enumerate() {
            preset.validate()?;
            if presets[..i].iter().any(|p| p.name == preset.name) {
                return Err(Error::InvalidConfig {
                    name: preset.name.clone(),
                    reason: "duplicate provider name".into(),
                });
            }
        }
        Ok(Self {
            presets,
            cache: DashMap::new(),
            creation: Mutex::new(()),
        })
    }

    /// Configured provider names, in declaration order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.presets.iter().map(|p| p.name.clone()).collect()
    }

    fn preset(&self, name: &str) -> Option<&ProviderPreset> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Name of the first preset serving `model`, declaration order wins.
    pub fn provider_for_model(&self, model: &str) -> Result<String> {
        self.presets
            .iter()
            .find(|p| p.serves(model))
            .map(|p| p.name.clone())
            .ok_or_else(|| Error::ProviderNotFound(format!("no provider serves model '{model}'")))
    }

    /// Get the cached provider or construct it from its preset.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<dyn Provider>> {
        if let Some(provider) = self.cache.get(name) {
            return Ok(Arc::clone(&provider));
        }

        let _guard = self.creation.lock().await;
        // Double-checked: someone else may have built it while we waited.
        if let Some(provider) = self.cache.get(name) {
            return Ok(Arc::clone(&provider));
        }

        let preset = self
            .preset(name)
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))?;
        let provider = Self::build(preset)?;
        tracing::info!(provider = name, kind = %preset.kind, "provider constructed");
        self.cache.insert(name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    fn build(preset: &ProviderPreset) -> Result<Arc<dyn Provider>> {
        Ok(match preset.kind {
            ProviderKind::Local => Arc::new(LocalProvider::from_preset(preset)?),
            ProviderKind::RemoteApi => Arc::new(RemoteApiProvider::from_preset(preset)?),
            ProviderKind::CustomHttp => Arc::new(CustomHttpProvider::from_preset(preset)?),
        })
    }

    /// Resolve the provider serving `model`, constructing it if needed.
    pub async fn resolve_model(&self, model: &str) -> Result<Arc<dyn Provider>> {
        let name = self.provider_for_model(model)?;
        self.get_or_create(&name).await
    }

    /// Evict a cached instance; the next use reconstructs it. Returns
    /// whether an instance was cached.
    pub fn invalidate(&self, name: &str) -> bool {
        self.cache.remove(name).is_some()
    }

    /// Inject a pre-built provider under `name`, replacing any preset or
    /// cached instance. Test seam, same shape the cache uses.
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        self.cache.insert(name.clone(), provider);
        tracing::debug!(provider = %name, "provider registered directly");
    }

    /// Probe every configured provider, constructing lazily. A preset that
    /// fails to construct reports unhealthy rather than erroring out.
    pub async fn healthcheck_all(&self) -> Vec<(String, bool)> {
        let mut report = Vec::with_capacity(self.presets.len());
        for name in self.names() {
            let healthy = match self.get_or_create(&name).await {
                Ok(provider) => provider.healthcheck().await,
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider construction failed");
                    false
                }
            };
            report.push((name, healthy));
        }
        report
    }
}
