use super::exec::PodExecutor;
use super::portforward::PortForward;
use super::types::{NodeInfo, PodInfo};
use crate::config::VppConfig;
use crate::exec::{CommandRunner, Runner};
use crate::providers::{release_channels, CapabilityCell, Env, Handler, Metadata};
use crate::vpp::api::{ProxyChannel, RpcChannel};
use crate::vpp::cli::{CliExecutor, VppCtl};
use crate::vpp::stats::{ProxyStats, StatsProvider};
use crate::vpp::transport::HttpProxy;
use crate::{ProbeError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Instance metadata of a pod on `node` in `cluster`
pub fn pod_metadata(cluster: &str, pod: &PodInfo, node: Option<&NodeInfo>) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("env".to_string(), Env::Cluster.to_string());
    metadata.insert("cluster".to_string(), cluster.to_string());
    metadata.insert(
        "node".to_string(),
        pod.node_name.clone().unwrap_or_default(),
    );
    metadata.insert("namespace".to_string(), pod.namespace.clone());
    metadata.insert("pod".to_string(), pod.name.clone());
    metadata.insert("ip".to_string(), pod.pod_ip.clone().unwrap_or_default());
    metadata.insert("image".to_string(), pod.image.clone());
    if let Some(addr) = node
        .and_then(NodeInfo::address)
        .map(str::to_string)
        .or_else(|| pod.host_ip.clone())
    {
        metadata.insert("node_ip".to_string(), addr);
    }
    metadata
}

pub fn handler_id(cluster: &str, pod: &PodInfo) -> String {
    format!("{}/{}/{}", cluster, pod.namespace, pod.name)
}

/// Handler of a dataplane running in a pod. The RPC proxy is reached
/// through a port-forward opened on first use.
pub struct ClusterHandler {
    id: String,
    metadata: Metadata,
    pods: Api<Pod>,
    pod: String,
    config: VppConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
    forward: Mutex<Option<PortForward>>,
    proxy: CapabilityCell<HttpProxy>,
    cli: CapabilityCell<dyn CliExecutor>,
    api: CapabilityCell<dyn RpcChannel>,
    stats: CapabilityCell<dyn StatsProvider>,
    closed: AtomicBool,
}

impl ClusterHandler {
    pub fn new(
        id: String,
        metadata: Metadata,
        pods: Api<Pod>,
        pod: &PodInfo,
        config: VppConfig,
        parent: &CancellationToken,
    ) -> Self {
        let executor = PodExecutor::new(pods.clone(), &pod.name, pod.container.clone());
        Self {
            id,
            metadata,
            pods,
            pod: pod.name.clone(),
            config,
            runner: Arc::new(Runner::new(Arc::new(executor))),
            cancel: parent.child_token(),
            forward: Mutex::new(None),
            proxy: CapabilityCell::new(),
            cli: CapabilityCell::new(),
            api: CapabilityCell::new(),
            stats: CapabilityCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProbeError::HandlerClosed(self.id.clone()));
        }
        Ok(())
    }

    async fn proxy(&self, capability: &'static str) -> Result<Arc<HttpProxy>> {
        self.proxy
            .get_or_try_init(|| async {
                let mut forward = self.forward.lock().await;
                let pf = PortForward::start(
                    self.pods.clone(),
                    &self.pod,
                    self.config.proxy_port,
                    &self.cancel,
                )
                .await
                .map_err(|e| ProbeError::capability(capability, e))?;

                let url = format!("http://{}", pf.local_addr());
                debug!("RPC proxy of {} reachable at {}", self.id, url);
                let proxy = HttpProxy::new(&url, self.config.timeout)?;
                *forward = Some(pf);
                Ok(Arc::new(proxy))
            })
            .await
    }
}

#[async_trait]
impl Handler for ClusterHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    async fn get_cli(&self) -> Result<Arc<dyn CliExecutor>> {
        self.check_open()?;
        self.cli
            .get_or_try_init(|| async {
                let cli = VppCtl::detect(self.runner.clone(), &self.config).await;
                Ok(Arc::new(cli) as Arc<dyn CliExecutor>)
            })
            .await
    }

    async fn get_api(&self) -> Result<Arc<dyn RpcChannel>> {
        self.check_open()?;
        let proxy = self.proxy("binapi").await?;
        self.api
            .get_or_try_init(|| async { Ok(Arc::new(ProxyChannel::new(proxy)) as Arc<dyn RpcChannel>) })
            .await
    }

    async fn get_stats(&self) -> Result<Arc<dyn StatsProvider>> {
        self.check_open()?;
        let proxy = self.proxy("stats").await?;
        self.stats
            .get_or_try_init(|| async { Ok(Arc::new(ProxyStats::new(proxy)) as Arc<dyn StatsProvider>) })
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let released = release_channels(&self.id, &self.api, &self.stats).await;
        self.proxy.take().await;
        self.cli.take().await;

        self.cancel.cancel();
        if let Some(pf) = self.forward.lock().await.take() {
            pf.stop().await;
        }
        debug!("Closed handler {}", self.id);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpp::api::testing::ScriptedChannel;

    fn pod() -> PodInfo {
        PodInfo {
            name: "vpp-node-x2k4d".into(),
            namespace: "vpp".into(),
            node_name: Some("worker-1".into()),
            pod_ip: Some("10.244.1.7".into()),
            host_ip: Some("192.168.1.11".into()),
            phase: "Running".into(),
            image: "ligato/vpp-base:21.01".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_metadata() {
        let node = NodeInfo {
            name: "worker-1".into(),
            hostname: "worker-1".into(),
            internal_ip: Some("192.168.1.21".into()),
            external_ip: None,
        };
        let meta = pod_metadata("kind-a", &pod(), Some(&node));
        assert_eq!(meta["env"], "cluster");
        assert_eq!(meta["cluster"], "kind-a");
        assert_eq!(meta["node"], "worker-1");
        assert_eq!(meta["namespace"], "vpp");
        assert_eq!(meta["pod"], "vpp-node-x2k4d");
        assert_eq!(meta["ip"], "10.244.1.7");
        assert_eq!(meta["node_ip"], "192.168.1.21");
    }

    #[test]
    fn test_pod_metadata_without_node() {
        let meta = pod_metadata("kind-a", &pod(), None);
        assert_eq!(meta["node_ip"], "192.168.1.11");
        assert_eq!(handler_id("kind-a", &pod()), "kind-a/vpp/vpp-node-x2k4d");
    }

    #[tokio::test]
    async fn test_close_cancels_tunnel_after_channel_error() {
        let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        let parent = CancellationToken::new();
        let handler = ClusterHandler::new(
            handler_id("kind-a", &pod()),
            pod_metadata("kind-a", &pod(), None),
            Api::namespaced(client, "vpp"),
            &pod(),
            VppConfig::default(),
            &parent,
        );
        handler
            .api
            .get_or_try_init(|| async {
                Ok(Arc::new(ScriptedChannel {
                    fail_close: true,
                    ..Default::default()
                }) as Arc<dyn RpcChannel>)
            })
            .await
            .unwrap();

        assert!(matches!(handler.close().await, Err(ProbeError::Rpc(_))));
        assert!(handler.cancel.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(handler.forward.lock().await.is_none());

        handler.close().await.unwrap();
        assert!(matches!(
            handler.get_cli().await,
            Err(ProbeError::HandlerClosed(_))
        ));
    }
}
