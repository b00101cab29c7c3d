//! Dataplane instances running in Docker containers
//!
//! The daemon is reached through the `docker` CLI, optionally pointed at a
//! remote daemon with `-H`. Every command executed in an instance is wrapped
//! in `docker exec -i <id>`.

use super::query::{self, QueryParams};
use super::{release_channels, CapabilityCell, Env, Handler, HandlerSet, Metadata, Provider};
use crate::config::{ProbeConfig, VppConfig};
use crate::exec::{CommandRunner, Runner, Wrapper};
use crate::vpp::api::{ProxyChannel, RpcChannel};
use crate::vpp::cli::{CliExecutor, VppCtl};
use crate::vpp::stats::{ProxyStats, StatsProvider};
use crate::vpp::transport::HttpProxy;
use crate::{ProbeError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

const DOCKER: &str = "docker";

/// Query keys translated into `docker ps` filters, by precedence
const FILTER_KEYS: &[&str] = &["id", "name", "label"];

pub fn factory(config: ProbeConfig) -> BoxFuture<'static, Result<Vec<Arc<dyn Provider>>>> {
    async move {
        let provider = ContainerProvider::connect(config).await?;
        Ok(vec![Arc::new(provider) as Arc<dyn Provider>])
    }
    .boxed()
}

/// Subset of `docker inspect` output
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default, rename = "IPAddress")]
    pub ip_address: String,
    #[serde(default)]
    pub networks: Option<BTreeMap<String, EndpointSettings>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSettings {
    #[serde(default, rename = "IPAddress")]
    pub ip_address: String,
}

impl ContainerInfo {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn container_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    /// Address reachable from the host: the default bridge IP, else the
    /// first network with an address
    pub fn ip(&self) -> Option<String> {
        let settings = &self.network_settings;
        if !settings.ip_address.is_empty() {
            return Some(settings.ip_address.clone());
        }
        settings
            .networks
            .as_ref()?
            .values()
            .map(|n| n.ip_address.clone())
            .find(|ip| !ip.is_empty())
    }

    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("env".to_string(), Env::Container.to_string());
        metadata.insert("name".to_string(), self.container_name().to_string());
        metadata.insert("container".to_string(), self.container_name().to_string());
        metadata.insert("id".to_string(), self.short_id().to_string());
        metadata.insert("image".to_string(), self.config.image.clone());
        metadata.insert("created".to_string(), self.created.clone());
        metadata
    }

    /// Client-side check of a filter key with `docker ps` semantics: id
    /// prefix, exact name, `key` or `key=value` label
    pub fn matches_filter(&self, key: &str, value: &str) -> bool {
        match key {
            "id" => !value.is_empty() && self.id.starts_with(value),
            "name" => self.container_name() == value.trim_start_matches('/'),
            "label" => {
                let labels = self.config.labels.as_ref();
                match value.split_once('=') {
                    Some((k, v)) => labels.and_then(|l| l.get(k)).is_some_and(|l| l == v),
                    None => labels.is_some_and(|l| l.contains_key(value)),
                }
            }
            _ => false,
        }
    }

    /// True when every pair of `clause` except the one already applied by
    /// the daemon holds for this container
    pub fn matches_clause(&self, clause: &QueryParams, applied: Option<&str>) -> bool {
        let metadata = self.metadata();
        clause
            .iter()
            .filter(|(key, _)| Some(key.as_str()) != applied)
            .all(|(key, value)| {
                if FILTER_KEYS.contains(&key.as_str()) {
                    self.matches_filter(key, value)
                } else {
                    metadata.get(key).is_some_and(|v| v == value)
                }
            })
    }
}

/// `docker ps` filter for a query clause, with the key it came from.
/// The first recognized key wins.
pub fn list_filter(params: &QueryParams) -> Option<(&'static str, String)> {
    FILTER_KEYS
        .iter()
        .find_map(|key| params.get(*key).map(|value| (*key, format!("{}={}", key, value))))
}

pub struct ContainerProvider {
    name: String,
    config: ProbeConfig,
    docker: Arc<dyn CommandRunner>,
    handlers: HandlerSet,
}

impl ContainerProvider {
    /// Connect to the daemon selected by `docker_host`, or the default one
    pub async fn connect(config: ProbeConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(Runner::host())).await
    }

    /// Connect using `base` to start the `docker` client
    pub async fn with_runner(config: ProbeConfig, base: Arc<dyn CommandRunner>) -> Result<Self> {
        let host_args: Vec<String> = match &config.docker_host {
            Some(host) => vec!["-H".to_string(), host.clone()],
            None => Vec::new(),
        };
        let docker: Arc<dyn CommandRunner> = Arc::new(Wrapper::new(base, DOCKER, host_args));

        let version = docker
            .command("version", &["--format".to_string(), "{{.Server.Version}}".to_string()])
            .output()
            .await
            .map_err(|e| ProbeError::EnvironmentConnect {
                env: Env::Container.to_string(),
                message: e.to_string(),
            })?;
        debug!(
            "Connected to docker daemon {}",
            String::from_utf8_lossy(&version).trim()
        );

        let name = config
            .docker_host
            .clone()
            .unwrap_or_else(|| DOCKER.to_string());
        Ok(Self {
            name,
            config,
            docker,
            handlers: HandlerSet::default(),
        })
    }

    async fn list_ids(&self, filter: Option<&str>) -> Result<Vec<String>> {
        let mut args = vec!["-q".to_string(), "--no-trunc".to_string()];
        if let Some(filter) = filter {
            args.push("--filter".to_string());
            args.push(filter.to_string());
        }
        let out = self.docker.command("ps", &args).output().await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn inspect(&self, ids: &[String]) -> Result<Vec<ContainerInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let out = self.docker.command("inspect", ids).output().await?;
        Ok(serde_json::from_slice(&out)?)
    }

    fn query_error(&self, e: ProbeError) -> ProbeError {
        ProbeError::Query {
            provider: self.name.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Provider for ContainerProvider {
    fn env(&self) -> Env {
        Env::Container
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, params: &[QueryParams]) -> Result<Vec<Arc<dyn Handler>>> {
        let mut seen = BTreeSet::new();
        let mut handlers = Vec::new();

        for clause in query::normalize(params) {
            let filter = list_filter(&clause);
            let ids = self
                .list_ids(filter.as_ref().map(|(_, f)| f.as_str()))
                .await
                .map_err(|e| self.query_error(e))?;
            let containers = self.inspect(&ids).await.map_err(|e| self.query_error(e))?;

            for info in containers {
                if !info.matches_clause(&clause, filter.as_ref().map(|(key, _)| *key)) {
                    continue;
                }
                if !seen.insert(info.id.clone()) {
                    continue;
                }
                let handler = self.handlers.get_or_insert_with(&info.id, || {
                    Arc::new(ContainerHandler::new(
                        &info,
                        self.docker.clone(),
                        self.config.vpp.clone(),
                    )) as Arc<dyn Handler>
                });
                handlers.push(handler);
            }
        }

        self.handlers.retain(&seen).await;
        debug!("Provider {} found {} containers", self.name, handlers.len());
        Ok(handlers)
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .command("info", &["--format".to_string(), "{{.ID}}".to_string()])
            .output()
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.handlers.close_all().await
    }
}

pub struct ContainerHandler {
    id: String,
    metadata: Metadata,
    ip: Option<String>,
    config: VppConfig,
    runner: Arc<dyn CommandRunner>,
    cli: CapabilityCell<dyn CliExecutor>,
    proxy: CapabilityCell<HttpProxy>,
    api: CapabilityCell<dyn RpcChannel>,
    stats: CapabilityCell<dyn StatsProvider>,
    closed: AtomicBool,
}

impl ContainerHandler {
    pub fn new(info: &ContainerInfo, docker: Arc<dyn CommandRunner>, config: VppConfig) -> Self {
        let runner = Wrapper::new(docker, "exec", ["-i".to_string(), info.id.clone()]);
        Self {
            id: info.id.clone(),
            metadata: info.metadata(),
            ip: info.ip(),
            config,
            runner: Arc::new(runner),
            cli: CapabilityCell::new(),
            proxy: CapabilityCell::new(),
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
                let ip = self.ip.as_deref().ok_or_else(|| {
                    ProbeError::capability(capability, "container has no IP address")
                })?;
                let url = format!("http://{}:{}", ip, self.config.proxy_port);
                Ok(Arc::new(HttpProxy::new(&url, self.config.timeout)?))
            })
            .await
    }
}

#[async_trait]
impl Handler for ContainerHandler {
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
        debug!("Closed handler {}", self.id);
        released
    }
}
