use crate::{ProbeError, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::Path;
use tracing::{debug, info};

/// Kubernetes client bound to one kubeconfig context
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    context: String,
    cluster: String,
}

impl KubeClient {
    /// Connect using `context` from the kubeconfig at `path` (or the default
    /// kubeconfig location). `None` selects the current context.
    pub async fn connect(path: Option<&Path>, context: Option<&str>) -> Result<Self> {
        debug!(
            "Initializing Kubernetes client (kubeconfig {:?}, context {:?})",
            path, context
        );

        let kubeconfig = match path {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(connect_error)?;

        let context = context
            .map(str::to_string)
            .or_else(|| kubeconfig.current_context.clone())
            .unwrap_or_default();
        let cluster = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context)
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone())
            .unwrap_or_else(|| context.clone());

        let options = KubeConfigOptions {
            context: Some(context.clone()).filter(|c| !c.is_empty()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(connect_error)?;
        let client = Client::try_from(config).map_err(connect_error)?;

        info!("Using Kubernetes context {} (cluster {})", context, cluster);

        Ok(Self {
            client,
            context,
            cluster,
        })
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    /// Fetch one pod, `None` when it does not exist
    pub async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    pub async fn list_pods(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let pods = match namespace {
            Some(ns) => self.pods(ns),
            None => self.pods_all(),
        };

        let mut params = ListParams::default();
        if let Some(labels) = label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = field_selector {
            params = params.fields(fields);
        }

        Ok(pods.list(&params).await?.items)
    }

    pub async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(name).await?)
    }

    /// Liveness check against the API server
    pub async fn ping(&self) -> Result<()> {
        let version = self.client.apiserver_version().await?;
        debug!("API server {} is {}", self.cluster, version.git_version);
        Ok(())
    }
}

fn connect_error(e: impl std::fmt::Display) -> ProbeError {
    ProbeError::EnvironmentConnect {
        env: "cluster".to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-a
clusters:
- name: cluster-a
  cluster:
    server: https://127.0.0.1:6443
    insecure-skip-tls-verify: true
- name: cluster-b
  cluster:
    server: https://127.0.0.1:7443
    insecure-skip-tls-verify: true
contexts:
- name: kind-a
  context:
    cluster: cluster-a
    user: admin
    namespace: vpp
- name: kind-b
  context:
    cluster: cluster-b
    user: admin
users:
- name: admin
  user:
    token: abc
"#;

    fn kubeconfig_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_connect_current_context() {
        let file = kubeconfig_file();
        let client = KubeClient::connect(Some(file.path()), None).await.unwrap();
        assert_eq!(client.context(), "kind-a");
        assert_eq!(client.cluster(), "cluster-a");
        assert_eq!(client.default_namespace(), "vpp");
    }

    #[tokio::test]
    async fn test_connect_named_context() {
        let file = kubeconfig_file();
        let client = KubeClient::connect(Some(file.path()), Some("kind-b"))
            .await
            .unwrap();
        assert_eq!(client.cluster(), "cluster-b");
        assert_eq!(client.default_namespace(), "default");
    }

    #[tokio::test]
    async fn test_missing_kubeconfig() {
        let err = KubeClient::connect(Some(Path::new("/nonexistent/kubeconfig")), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::EnvironmentConnect { .. }));
    }
}
