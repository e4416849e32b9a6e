//! Registry of code agent provider specifications.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::Provider;
use crate::errors::{EngineError, EngineResult};

/// How to launch a code agent provider process.
#[derive(Debug, Clone, Default)]
pub struct ProviderSpec {
    pub name: Provider,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Thread-safe registry of provider specifications.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<Provider, ProviderSpec>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    /// Add a provider spec. Registering the same name twice fails with
    /// `provider_unavailable`.
    pub fn register(&self, spec: ProviderSpec) -> EngineResult<()> {
        let mut providers = self
            .providers
            .write()
            .map_err(|_| EngineError::ProviderUnavailable("registry lock poisoned".into()))?;
        if providers.contains_key(&spec.name) {
            return Err(EngineError::ProviderUnavailable(format!(
                "provider already registered: {}",
                spec.name
            )));
        }
        providers.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// The spec for the named provider, or `provider_unavailable`.
    pub fn get(&self, name: &str) -> EngineResult<ProviderSpec> {
        let providers = self
            .providers
            .read()
            .map_err(|_| EngineError::ProviderUnavailable("registry lock poisoned".into()))?;
        providers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ProviderUnavailable(name.to_string()))
    }

    /// All registered provider names, lexicographically sorted.
    pub fn list(&self) -> Vec<Provider> {
        let mut names: Vec<Provider> = match self.providers.read() {
            Ok(providers) => providers.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}
