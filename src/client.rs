//! Top-level client aggregating providers
//!
//! Discovery queries every provider concurrently, then initializes the
//! returned handlers as [`Instance`]s with bounded concurrency. A failing
//! provider or instance is logged and contributes nothing.

use crate::config::ProbeConfig;
use crate::providers::{default_registry, Handler, Provider, QueryParams};
use crate::vpp::Instance;
use crate::{ProbeError, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Client {
    providers: Mutex<Vec<Arc<dyn Provider>>>,
    instances: RwLock<Vec<Arc<Instance>>>,
    concurrency: usize,
}

impl Client {
    pub fn new(concurrency: usize) -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            instances: RwLock::new(Vec::new()),
            concurrency: concurrency.max(1),
        }
    }

    /// Create providers for every configured environment. Environments that
    /// cannot be reached are skipped; it is an error when none remain.
    pub async fn connect(config: &ProbeConfig) -> Result<Self> {
        let client = Self::new(config.concurrency);
        let registry = default_registry();
        let mut first_err = None;

        for env in &config.envs {
            match registry.create(*env, config).await {
                Ok(providers) => {
                    for provider in providers {
                        if let Err(e) = client.add_provider(provider).await {
                            warn!("{}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Environment {} unavailable: {}", env, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        if client.providers.lock().await.is_empty() {
            return Err(first_err
                .unwrap_or_else(|| ProbeError::Config("no provider could be created".to_string())));
        }
        Ok(client)
    }

    /// Register a provider. `(env, name)` must be unique.
    pub async fn add_provider(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let mut providers = self.providers.lock().await;
        if providers
            .iter()
            .any(|p| p.env() == provider.env() && p.name() == provider.name())
        {
            return Err(ProbeError::DuplicateProvider(format!(
                "{}/{}",
                provider.env(),
                provider.name()
            )));
        }
        info!("Added provider {}/{}", provider.env(), provider.name());
        providers.push(provider);
        Ok(())
    }

    pub async fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.lock().await.clone()
    }

    /// Query every provider and initialize the handlers found. The instance
    /// list is replaced by the result.
    pub async fn discover_instances(
        &self,
        queries: &[QueryParams],
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<Instance>>> {
        let handlers = self.query_providers(queries, cancel).await?;
        debug!("Initializing {} instances", handlers.len());

        let init = stream::iter(handlers)
            .map(|handler| async move {
                let id = handler.id().to_string();
                match Instance::init(handler).await {
                    Ok(instance) => Some(Arc::new(instance)),
                    Err(e) => {
                        warn!("Instance {} init failed: {}", id, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|instance| async move { instance })
            .collect::<Vec<_>>();

        let mut instances = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            instances = init => instances,
        };
        instances.sort_by(|a, b| a.id().cmp(b.id()));

        *self.instances.write().await = instances.clone();
        if instances.is_empty() {
            return Err(ProbeError::NoInstancesDiscovered);
        }
        info!("Discovered {} instances", instances.len());
        Ok(instances)
    }

    async fn query_providers(
        &self,
        queries: &[QueryParams],
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<dyn Handler>>> {
        let providers = self.providers().await;
        let mut slots: Vec<Vec<Arc<dyn Handler>>> = vec![Vec::new(); providers.len()];

        let mut tasks = JoinSet::new();
        for (slot, provider) in providers.into_iter().enumerate() {
            let params = queries.to_vec();
            tasks.spawn(async move {
                let res = provider.query(&params).await;
                (slot, provider, res)
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(ProbeError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok((slot, provider, Ok(found)))) => {
                    debug!(
                        "Provider {}/{} returned {} handlers",
                        provider.env(),
                        provider.name(),
                        found.len()
                    );
                    slots[slot] = found;
                }
                Some(Ok((_, provider, Err(e)))) => {
                    warn!(
                        "Query on provider {}/{} failed: {}",
                        provider.env(),
                        provider.name(),
                        e
                    );
                }
                Some(Err(e)) => error!("Provider query task failed: {}", e),
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Instances from the last discovery
    pub async fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.read().await.clone()
    }

    /// Close every provider and forget all instances
    pub async fn close(&self) -> Result<()> {
        self.instances.write().await.clear();
        let providers: Vec<_> = self.providers.lock().await.drain(..).collect();

        let mut first_err = None;
        for provider in providers {
            if let Err(e) = provider.close().await {
                warn!("Closing provider {} failed: {}", provider.name(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Env, Handler};
    use crate::vpp::testing::cli_only_handler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler(id: &str) -> Arc<dyn Handler> {
        cli_only_handler(id)
    }

    enum Behavior {
        Found(Vec<Arc<dyn Handler>>),
        Fail,
        Panic,
    }

    struct FakeProvider {
        name: String,
        behavior: Behavior,
        closed: AtomicUsize,
    }

    impl FakeProvider {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behavior,
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn env(&self) -> Env {
            Env::Local
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn query(&self, _params: &[QueryParams]) -> Result<Vec<Arc<dyn Handler>>> {
            match &self.behavior {
                Behavior::Found(handlers) => Ok(handlers.clone()),
                Behavior::Fail => Err(ProbeError::Query {
                    provider: self.name.clone(),
                    message: "connection refused".to_string(),
                }),
                Behavior::Panic => panic!("provider bug"),
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_providers() {
        let client = Client::new(4);
        let good = FakeProvider::new(
            "good",
            Behavior::Found(vec![handler("b-2"), handler("a-1")]),
        );
        client.add_provider(good).await.unwrap();
        client
            .add_provider(FakeProvider::new("bad", Behavior::Fail))
            .await
            .unwrap();
        client
            .add_provider(FakeProvider::new("buggy", Behavior::Panic))
            .await
            .unwrap();

        let instances = client
            .discover_instances(&[], &CancellationToken::new())
            .await
            .unwrap();
        let ids: Vec<&str> = instances.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["a-1", "b-2"]);
        assert_eq!(client.instances().await.len(), 2);
    }

    #[tokio::test]
    async fn test_all_empty_is_error() {
        let client = Client::new(4);
        client
            .add_provider(FakeProvider::new("empty", Behavior::Found(Vec::new())))
            .await
            .unwrap();
        client
            .add_provider(FakeProvider::new("bad", Behavior::Fail))
            .await
            .unwrap();

        let err = client
            .discover_instances(&[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NoInstancesDiscovered));
        assert!(client.instances().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_provider_rejected() {
        let client = Client::new(1);
        client
            .add_provider(FakeProvider::new("local", Behavior::Fail))
            .await
            .unwrap();
        let err = client
            .add_provider(FakeProvider::new("local", Behavior::Fail))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::DuplicateProvider(name) if name == "local/local"));
        assert_eq!(client.providers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_discovery() {
        let client = Client::new(1);
        client
            .add_provider(FakeProvider::new(
                "good",
                Behavior::Found(vec![handler("a-1")]),
            ))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            client.discover_instances(&[], &cancel).await,
            Err(ProbeError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_close_closes_providers_once() {
        let client = Client::new(1);
        let provider = FakeProvider::new("p", Behavior::Found(Vec::new()));
        client.add_provider(provider.clone()).await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(provider.closed.load(Ordering::SeqCst), 1);
        assert!(client.providers().await.is_empty());
    }
}
