//! Environment tag -> provider factory
//!
//! The default registry is built once on first use and read-only afterwards.

use super::{cluster, container, local, Env, Provider};
use crate::config::ProbeConfig;
use crate::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Builds the providers for one environment. A factory may yield several
/// providers, e.g. one per kubeconfig context.
pub type ProviderFactory = fn(ProbeConfig) -> BoxFuture<'static, Result<Vec<Arc<dyn Provider>>>>;

#[derive(Default)]
pub struct Registry {
    factories: HashMap<Env, ProviderFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, env: Env, factory: ProviderFactory) {
        self.factories.insert(env, factory);
    }

    pub fn contains(&self, env: Env) -> bool {
        self.factories.contains_key(&env)
    }

    pub async fn create(&self, env: Env, config: &ProbeConfig) -> Result<Vec<Arc<dyn Provider>>> {
        let factory = self
            .factories
            .get(&env)
            .ok_or_else(|| crate::ProbeError::UnknownEnv(env.to_string()))?;
        factory(config.clone()).await
    }
}

pub fn default_registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = Registry::new();
        registry.register(Env::Local, local::factory);
        registry.register(Env::Container, container::factory);
        registry.register(Env::Cluster, cluster::factory);
        registry
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProbeError;
    use futures::FutureExt;

    fn empty_factory(_config: ProbeConfig) -> BoxFuture<'static, Result<Vec<Arc<dyn Provider>>>> {
        async { Ok(Vec::new()) }.boxed()
    }

    #[test]
    fn test_default_registry_knows_all_envs() {
        let registry = default_registry();
        assert!(registry.contains(Env::Local));
        assert!(registry.contains(Env::Container));
        assert!(registry.contains(Env::Cluster));
    }

    #[tokio::test]
    async fn test_unregistered_env() {
        let registry = Registry::new();
        let err = registry
            .create(Env::Cluster, &ProbeConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::UnknownEnv(_)));
    }

    #[tokio::test]
    async fn test_registered_factory_is_used() {
        let mut registry = Registry::new();
        registry.register(Env::Local, empty_factory);
        let providers = registry
            .create(Env::Local, &ProbeConfig::default())
            .await
            .unwrap();
        assert!(providers.is_empty());
    }
}
