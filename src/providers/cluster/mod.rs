//! Dataplane instances running in Kubernetes pods
//!
//! One provider per kubeconfig context. Pods are selected by name (direct
//! get) or by label and field selectors; system namespaces are skipped
//! unless requested explicitly.

pub mod client;
pub mod exec;
pub mod handler;
pub mod portforward;
pub mod types;

pub use client::KubeClient;
pub use handler::ClusterHandler;
pub use types::{NodeInfo, PodInfo};

use super::query::{self, QueryParams};
use super::{Env, Handler, HandlerSet, Provider};
use crate::config::ProbeConfig;
use crate::{ProbeError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Query keys consumed by pod selection
const SELECTOR_KEYS: &[&str] = &["name", "namespace", "label", "field"];

/// One provider per configured context; the current context when none is
/// configured. Contexts that fail to load are skipped while others remain.
pub fn factory(config: ProbeConfig) -> BoxFuture<'static, Result<Vec<Arc<dyn Provider>>>> {
    async move {
        let contexts = split_contexts(&config.kube_contexts);
        let kubeconfig = config.resolve_kubeconfig();

        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        let mut first_err = None;
        for context in contexts {
            match KubeClient::connect(kubeconfig.as_deref(), context.as_deref()).await {
                Ok(client) => providers.push(Arc::new(ClusterProvider::new(client, config.clone()))),
                Err(e) => {
                    warn!("Kubernetes context {:?} unavailable: {}", context, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match (providers.is_empty(), first_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(providers),
        }
    }
    .boxed()
}

/// Expand comma-separated context lists. An empty list means the current
/// context. Duplicates are kept.
pub fn split_contexts(raw: &[String]) -> Vec<Option<String>> {
    let contexts: Vec<Option<String>> = raw
        .iter()
        .flat_map(|c| c.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| Some(c.to_string()))
        .collect();
    if contexts.is_empty() {
        vec![None]
    } else {
        contexts
    }
}

/// How a query clause selects pods
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodSelector {
    Named {
        name: String,
        namespace: Option<String>,
    },
    List {
        namespace: Option<String>,
        labels: Option<String>,
        fields: Option<String>,
    },
}

impl PodSelector {
    pub fn from_params(params: &QueryParams) -> Self {
        let namespace = params.get("namespace").cloned();
        match params.get("name") {
            Some(name) => PodSelector::Named {
                name: name.clone(),
                namespace,
            },
            None => PodSelector::List {
                namespace,
                labels: params.get("label").cloned(),
                fields: params.get("field").cloned(),
            },
        }
    }
}

pub struct ClusterProvider {
    client: KubeClient,
    config: ProbeConfig,
    handlers: HandlerSet,
    cancel: CancellationToken,
}

impl ClusterProvider {
    pub fn new(client: KubeClient, config: ProbeConfig) -> Self {
        Self {
            client,
            config,
            handlers: HandlerSet::default(),
            cancel: CancellationToken::new(),
        }
    }

    async fn select(&self, selector: &PodSelector) -> Result<Vec<Pod>> {
        match selector {
            PodSelector::Named { name, namespace } => {
                let ns = namespace
                    .as_deref()
                    .unwrap_or_else(|| self.client.default_namespace());
                Ok(self.client.get_pod(name, ns).await?.into_iter().collect())
            }
            PodSelector::List {
                namespace,
                labels,
                fields,
            } => {
                let pods = self
                    .client
                    .list_pods(namespace.as_deref(), labels.as_deref(), fields.as_deref())
                    .await?;
                Ok(pods
                    .into_iter()
                    .filter(|p| {
                        namespace.is_some()
                            || !types::is_system_namespace(
                                p.metadata.namespace.as_deref().unwrap_or_default(),
                            )
                    })
                    .collect())
            }
        }
    }

    async fn node(
        &self,
        cache: &mut BTreeMap<String, Option<NodeInfo>>,
        name: &str,
    ) -> Option<NodeInfo> {
        if let Some(cached) = cache.get(name) {
            return cached.clone();
        }
        let info = match self.client.get_node(name).await {
            Ok(node) => node.as_ref().map(NodeInfo::from_k8s_node),
            Err(e) => {
                warn!("Looking up node {} failed: {}", name, e);
                None
            }
        };
        cache.insert(name.to_string(), info.clone());
        info
    }
}

#[async_trait]
impl Provider for ClusterProvider {
    fn env(&self) -> Env {
        Env::Cluster
    }

    fn name(&self) -> &str {
        self.client.context()
    }

    async fn query(&self, params: &[QueryParams]) -> Result<Vec<Arc<dyn Handler>>> {
        let cluster = self.client.cluster().to_string();
        let mut nodes = BTreeMap::new();
        let mut seen = BTreeSet::new();
        let mut handlers = Vec::new();

        for clause in query::normalize(params) {
            let selector = PodSelector::from_params(&clause);
            let pods = self.select(&selector).await.map_err(|e| ProbeError::Query {
                provider: self.name().to_string(),
                message: e.to_string(),
            })?;

            for pod in pods {
                let info = PodInfo::from_k8s_pod(&pod);
                if !info.is_running() {
                    debug!("Skipping pod {}/{} in phase {}", info.namespace, info.name, info.phase);
                    continue;
                }
                let node = match &info.node_name {
                    Some(name) => self.node(&mut nodes, name).await,
                    None => None,
                };
                let metadata = handler::pod_metadata(&cluster, &info, node.as_ref());
                if !query::matches_except(&metadata, &clause, SELECTOR_KEYS) {
                    continue;
                }

                let id = handler::handler_id(&cluster, &info);
                if !seen.insert(id.clone()) {
                    continue;
                }
                let handler = self.handlers.get_or_insert_with(&id, || {
                    Arc::new(ClusterHandler::new(
                        id.clone(),
                        metadata,
                        self.client.pods(&info.namespace),
                        &info,
                        self.config.vpp.clone(),
                        &self.cancel,
                    )) as Arc<dyn Handler>
                });
                handlers.push(handler);
            }
        }

        self.handlers.retain(&seen).await;
        debug!("Cluster {} matched {} pods", cluster, handlers.len());
        Ok(handlers)
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    async fn close(&self) -> Result<()> {
        let res = self.handlers.close_all().await;
        self.cancel.cancel();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_split_contexts() {
        assert_eq!(split_contexts(&[]), vec![None]);
        assert_eq!(
            split_contexts(&["kind-a,kind-b".to_string(), "kind-a".to_string()]),
            vec![
                Some("kind-a".to_string()),
                Some("kind-b".to_string()),
                Some("kind-a".to_string())
            ]
        );
        assert_eq!(split_contexts(&[" , ".to_string()]), vec![None]);
    }

    #[test]
    fn test_selector_from_params() {
        assert_eq!(
            PodSelector::from_params(&params(&[("name", "vpp-1"), ("label", "app=vpp")])),
            PodSelector::Named {
                name: "vpp-1".into(),
                namespace: None
            }
        );
        assert_eq!(
            PodSelector::from_params(&params(&[
                ("label", "app=vpp"),
                ("field", "spec.nodeName=worker-1"),
                ("namespace", "vpp")
            ])),
            PodSelector::List {
                namespace: Some("vpp".into()),
                labels: Some("app=vpp".into()),
                fields: Some("spec.nodeName=worker-1".into())
            }
        );
    }
}
