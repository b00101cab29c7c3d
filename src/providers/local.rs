//! Dataplane processes running on this host
//!
//! Candidates are found by scanning `/proc`. A process inside a container
//! is skipped unless the probe itself runs in that same container; such
//! instances belong to the container provider.

use super::query::{self, QueryParams};
use super::{release_channels, CapabilityCell, Env, Handler, HandlerSet, Metadata, Provider};
use crate::config::{ProbeConfig, VppConfig};
use crate::exec::{CommandRunner, Runner};
use crate::vpp::api::{RpcChannel, SocketChannel};
use crate::vpp::cli::{CliExecutor, VppCtl};
use crate::vpp::stats::{SocketStats, StatsProvider};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

const PROC_ROOT: &str = "/proc";

/// Executable name of the dataplane
const PROGRAM: &str = "vpp";

/// Thread names the dataplane's main thread may carry
const PROGRAM_COMMS: &[&str] = &["vpp", "vpp_main"];

/// Container runtime prefixes seen in cgroup path components
const RUNTIME_PREFIXES: &[&str] = &["docker-", "cri-containerd-", "crio-", "libpod-"];

pub fn factory(config: ProbeConfig) -> BoxFuture<'static, Result<Vec<Arc<dyn Provider>>>> {
    async move {
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new(config));
        Ok(vec![provider])
    }
    .boxed()
}

/// A dataplane process found in the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProcess {
    pub pid: u32,
    pub container_id: Option<String>,
}

pub struct LocalProvider {
    config: ProbeConfig,
    proc_root: PathBuf,
    handlers: HandlerSet,
}

impl LocalProvider {
    pub fn new(config: ProbeConfig) -> Self {
        Self::with_proc_root(config, PathBuf::from(PROC_ROOT))
    }

    /// Provider scanning an alternative proc tree (for testing)
    pub fn with_proc_root(config: ProbeConfig, proc_root: PathBuf) -> Self {
        Self {
            config,
            proc_root,
            handlers: HandlerSet::default(),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn env(&self) -> Env {
        Env::Local
    }

    fn name(&self) -> &str {
        "local"
    }

    async fn query(&self, params: &[QueryParams]) -> Result<Vec<Arc<dyn Handler>>> {
        let root = self.proc_root.clone();
        let processes = tokio::task::spawn_blocking(move || scan_processes(&root))
            .await
            .map_err(|e| ProbeError::Query {
                provider: "local".to_string(),
                message: format!("process scan failed: {}", e),
            })??;

        let mut seen = BTreeSet::new();
        let mut handlers = Vec::new();
        for process in processes {
            let metadata = local_metadata(process.pid);
            if !query::matches(&metadata, params) {
                trace!("Process {} does not match query", process.pid);
                continue;
            }
            let id = format!("local-{}", process.pid);
            let vpp = self.config.vpp.clone();
            let handler = self.handlers.get_or_insert_with(&id, || {
                Arc::new(LocalHandler::new(id.clone(), metadata, vpp)) as Arc<dyn Handler>
            });
            seen.insert(id);
            handlers.push(handler);
        }
        self.handlers.retain(&seen).await;
        debug!("Local provider found {} instances", handlers.len());
        Ok(handlers)
    }

    async fn close(&self) -> Result<()> {
        self.handlers.close_all().await
    }
}

fn local_metadata(pid: u32) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("env".to_string(), Env::Local.to_string());
    metadata.insert("pid".to_string(), pid.to_string());
    metadata
}

/// List dataplane processes visible to the probe
pub fn scan_processes(proc_root: &Path) -> Result<Vec<LocalProcess>> {
    let own_container = read_container_id(&proc_root.join("self"));
    let mut found = Vec::new();

    for entry in fs::read_dir(proc_root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping proc entry: {}", e);
                continue;
            }
        };
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let dir = entry.path();

        if !is_dataplane(&dir) {
            continue;
        }

        let container_id = read_container_id(&dir);
        if container_id.is_some() && container_id != own_container {
            debug!(
                "Skipping pid {} in container {}",
                pid,
                container_id.as_deref().unwrap_or_default()
            );
            continue;
        }

        found.push(LocalProcess { pid, container_id });
    }

    found.sort_by_key(|p| p.pid);
    Ok(found)
}

fn is_dataplane(dir: &Path) -> bool {
    // Processes exit while we scan; unreadable entries are not candidates
    let exe_matches = fs::read(dir.join("cmdline"))
        .ok()
        .and_then(|raw| {
            let argv0 = raw.split(|b| *b == 0).next()?;
            let argv0 = String::from_utf8_lossy(argv0);
            Some(argv0.rsplit('/').next().unwrap_or_default().contains(PROGRAM))
        })
        .unwrap_or(false);
    if !exe_matches {
        return false;
    }

    fs::read_to_string(dir.join("comm"))
        .map(|comm| PROGRAM_COMMS.contains(&comm.trim()))
        .unwrap_or(false)
}

fn read_container_id(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join("cgroup"))
        .ok()
        .and_then(|content| extract_container_id(&content))
}

/// Extract a container id from `/proc/<pid>/cgroup` content
pub fn extract_container_id(cgroup: &str) -> Option<String> {
    for line in cgroup.lines() {
        // hierarchy-ID:controller-list:cgroup-path
        let Some(path) = line.splitn(3, ':').nth(2) else {
            continue;
        };
        for component in path.rsplit('/') {
            let name = component.strip_suffix(".scope").unwrap_or(component);
            let name = RUNTIME_PREFIXES
                .iter()
                .find_map(|p| name.strip_prefix(p))
                .unwrap_or(name);
            if name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                return Some(name.to_string());
            }
        }
    }
    None
}

pub struct LocalHandler {
    id: String,
    metadata: Metadata,
    config: VppConfig,
    runner: Arc<dyn CommandRunner>,
    cli: CapabilityCell<dyn CliExecutor>,
    api: CapabilityCell<dyn RpcChannel>,
    stats: CapabilityCell<dyn StatsProvider>,
    closed: AtomicBool,
}

impl LocalHandler {
    pub fn new(id: String, metadata: Metadata, config: VppConfig) -> Self {
        Self {
            id,
            metadata,
            config,
            runner: Arc::new(Runner::host()),
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
}

#[async_trait]
impl Handler for LocalHandler {
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
                let cli: Arc<dyn CliExecutor> = Arc::new(VppCtl::new(
                    self.runner.clone(),
                    &self.config.vppctl,
                    &self.config.cli_socket,
                ));
                Ok(cli)
            })
            .await
    }

    async fn get_api(&self) -> Result<Arc<dyn RpcChannel>> {
        self.check_open()?;
        self.api
            .get_or_try_init(|| async {
                let ch = SocketChannel::connect(
                    Path::new(&self.config.api_socket),
                    self.config.timeout,
                )
                .await?;
                Ok(Arc::new(ch) as Arc<dyn RpcChannel>)
            })
            .await
    }

    async fn get_stats(&self) -> Result<Arc<dyn StatsProvider>> {
        self.check_open()?;
        self.stats
            .get_or_try_init(|| async {
                let stats = SocketStats::connect(
                    Path::new(&self.config.stats_socket),
                    self.config.timeout,
                )
                .await?;
                Ok(Arc::new(stats) as Arc<dyn StatsProvider>)
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let released = release_channels(&self.id, &self.api, &self.stats).await;
        self.cli.take().await;
        debug!("Closed handler {}", self.id);
        released
    }
}
