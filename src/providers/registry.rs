//! Provider registry
//!
//! Immutable lookup from provider to its adapter configuration. The registry
//! is a plain value built once at startup and injected into the schedulers;
//! there is no global instance and no mutation after construction.

use std::collections::HashMap;

use crate::config::AppConfig;

use super::{PollPlan, Provider, ProviderConfig, RefreshEndpoint, catalog};

/// Provider registry storing adapter configurations.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    providers: HashMap<Provider, ProviderConfig>,
}

impl Registry {
    /// Build a registry from explicit configurations. A later entry for the
    /// same provider replaces an earlier one.
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Self {
        let mut providers = HashMap::new();
        for config in configs {
            providers.insert(config.provider, config);
        }
        Self { providers }
    }

    /// The full builtin catalog, with client credentials taken from the
    /// application configuration.
    pub fn builtin(config: &AppConfig) -> Self {
        Self::from_configs(catalog::builtin_providers(config))
    }

    /// Refresh endpoint for a provider; `None` disables refresh for its
    /// connections.
    pub fn refresh_config(&self, provider: Provider) -> Option<&RefreshEndpoint> {
        self.providers
            .get(&provider)
            .and_then(|config| config.refresh.as_ref())
    }

    /// Poll plan for a provider; `None` excludes it from poll cycles.
    pub fn poll_plan(&self, provider: Provider) -> Option<&PollPlan> {
        self.providers
            .get(&provider)
            .and_then(|config| config.poll.as_ref())
    }

    /// Providers with a poll plan, in stable order.
    pub fn pollable_providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self
            .providers
            .values()
            .filter(|config| config.poll.is_some())
            .map(|config| config.provider)
            .collect();
        providers.sort();
        providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
