//! Dataplane instance lifecycle
//!
//! An [`Instance`] wraps a provider [`Handler`] and tracks which control
//! channels work. The CLI is mandatory; the binary API and the stats segment
//! are optional and every derived query falls back to parsing CLI output
//! when the API is missing.

pub mod api;
pub mod cli;
pub mod parse;
pub mod refresh;
pub mod stats;
pub mod transport;

use crate::agent::Agent;
use crate::providers::{Handler, Metadata};
use crate::{ProbeError, Result};
use api::{RpcChannel, SwInterfaceDetails};
use chrono::{DateTime, Local, NaiveDateTime};
use cli::CliExecutor;
use serde::{Deserialize, Serialize};
use stats::{Stats, StatsProvider};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unknown,
    Checking,
    Ok,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unknown => "unknown",
            Status::Checking => "checking",
            Status::Ok => "ok",
            Status::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Per-channel status of an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub cli: Status,
    pub bin_api: Status,
    pub stats_api: Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub device_type: String,
    pub mac: String,
    pub admin_up: bool,
    pub link_up: bool,
    pub mtu: u32,
    pub vrf_ipv4: u32,
    pub vrf_ipv6: u32,
    pub ip_addresses: Vec<String>,
}

impl Interface {
    pub(crate) fn from_details(d: SwInterfaceDetails) -> Self {
        Self {
            index: d.sw_if_index,
            name: d.interface_name,
            device_type: d.interface_dev_type,
            mac: d.l2_address,
            admin_up: d.admin_up,
            link_up: d.link_up,
            mtu: d.mtu,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: Option<NaiveDateTime>,
    pub level: String,
    pub class: String,
    pub message: String,
}

/// Observable state of an instance, republished while a refresh runs
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceState {
    pub version: VersionInfo,
    #[serde(with = "duration_secs")]
    pub uptime: Option<Duration>,
    pub status: InstanceStatus,
    pub interfaces: Vec<Interface>,
    pub logs: Vec<LogLine>,
    pub stats: Option<Stats>,
    /// Output of the informational CLIs, keyed by command
    pub cli_results: BTreeMap<String, String>,
    pub last_update: Option<DateTime<Local>>,
    pub error: Option<String>,
    pub updating: bool,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}

pub struct Instance {
    handler: Arc<dyn Handler>,
    cli: Arc<dyn CliExecutor>,
    api: Option<Arc<dyn RpcChannel>>,
    stats: Option<Arc<dyn StatsProvider>>,
    state: RwLock<InstanceState>,
    agent: RwLock<Option<Arc<Agent>>>,
}

impl Instance {
    /// Probe the handler's channels. Fails only when the CLI is unusable.
    pub async fn init(handler: Arc<dyn Handler>) -> Result<Self> {
        let mut state = InstanceState {
            status: InstanceStatus {
                cli: Status::Checking,
                ..Default::default()
            },
            ..Default::default()
        };

        let cli = handler.get_cli().await?;
        let output = cli.run_cli("show version verbose").await?;
        state.version = parse::parse_version(&output)?;
        state.status.cli = Status::Ok;
        debug!(
            "Instance {} runs VPP {} (pid {})",
            handler.id(),
            state.version.version,
            state.version.pid
        );

        state.status.bin_api = Status::Checking;
        let api = match Self::probe_api(handler.as_ref()).await {
            Ok(api) => {
                state.status.bin_api = Status::Ok;
                Some(api)
            }
            Err(e) => {
                warn!("Binary API unavailable on {}: {}", handler.id(), e);
                state.status.bin_api = Status::Error;
                None
            }
        };

        state.status.stats_api = Status::Checking;
        let stats = match Self::probe_stats(handler.as_ref()).await {
            Ok(stats) => {
                state.status.stats_api = Status::Ok;
                Some(stats)
            }
            Err(e) => {
                warn!("Stats unavailable on {}: {}", handler.id(), e);
                state.status.stats_api = Status::Error;
                None
            }
        };

        info!(
            "Initialized instance {} (cli={}, api={}, stats={})",
            handler.id(),
            state.status.cli,
            state.status.bin_api,
            state.status.stats_api
        );

        Ok(Self {
            handler,
            cli,
            api,
            stats,
            state: RwLock::new(state),
            agent: RwLock::new(None),
        })
    }

    async fn probe_api(handler: &dyn Handler) -> Result<Arc<dyn RpcChannel>> {
        let ch = handler.get_api().await?;
        api::check_compatibility(ch.as_ref()).await?;
        api::control_ping(ch.as_ref()).await?;
        Ok(ch)
    }

    async fn probe_stats(handler: &dyn Handler) -> Result<Arc<dyn StatsProvider>> {
        let stats = handler.get_stats().await?;
        stats.system_stats().await?;
        Ok(stats)
    }

    pub fn id(&self) -> &str {
        self.handler.id()
    }

    pub fn metadata(&self) -> &Metadata {
        self.handler.metadata()
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub async fn state(&self) -> InstanceState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> InstanceStatus {
        self.state.read().await.status
    }

    pub async fn version(&self) -> VersionInfo {
        self.state.read().await.version.clone()
    }

    pub(crate) async fn modify_state<F: FnOnce(&mut InstanceState)>(&self, f: F) -> InstanceState {
        let mut state = self.state.write().await;
        f(&mut state);
        state.clone()
    }

    pub async fn run_cli(&self, cmd: &str) -> Result<String> {
        self.cli.run_cli(cmd).await
    }

    pub fn cli(&self) -> Arc<dyn CliExecutor> {
        self.cli.clone()
    }

    pub async fn get_version_info(&self) -> Result<VersionInfo> {
        match &self.api {
            Some(ch) => api::version_info(ch.as_ref()).await,
            None => parse::parse_version(&self.run_cli("show version verbose").await?),
        }
    }

    pub async fn get_uptime(&self) -> Result<Duration> {
        match &self.api {
            Some(ch) => api::uptime(ch.as_ref()).await,
            None => parse::parse_uptime(&self.run_cli("show clock").await?),
        }
    }

    pub async fn list_interfaces(&self) -> Result<Vec<Interface>> {
        match &self.api {
            Some(ch) => api::list_interfaces(ch.as_ref()).await,
            None => {
                let show_int = self.run_cli("show interface").await?;
                let show_addr = self.run_cli("show interface addr").await?;
                Ok(parse::parse_interfaces(&show_int, &show_addr))
            }
        }
    }

    pub async fn dump_logs(&self) -> Result<Vec<LogLine>> {
        self.get_logs(None).await
    }

    pub async fn get_logs(&self, since: Option<NaiveDateTime>) -> Result<Vec<LogLine>> {
        match &self.api {
            Some(ch) => api::dump_logs(ch.as_ref(), since).await,
            None => {
                let output = self.run_cli("show logging").await?;
                Ok(parse::filter_logs_since(parse::parse_logs(&output), since))
            }
        }
    }

    pub async fn list_stats(&self) -> Result<Stats> {
        match &self.stats {
            Some(stats) => stats::collect(stats.as_ref()).await,
            None => Err(ProbeError::capability(
                "stats",
                format!("not available on {}", self.id()),
            )),
        }
    }

    pub async fn agent(&self) -> Option<Arc<Agent>> {
        self.agent.read().await.clone()
    }

    /// Retrieve the agent config snapshot. On failure the previous snapshot
    /// stays in place.
    pub async fn update_agent(&self) -> Result<Option<Arc<Agent>>> {
        let agent = crate::agent::retrieve(self.handler.as_ref()).await?.map(Arc::new);
        *self.agent.write().await = agent.clone();
        Ok(agent)
    }

    #[cfg(test)]
    pub(crate) async fn set_agent(&self, agent: Agent) {
        *self.agent.write().await = Some(Arc::new(agent));
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.handler.id())
            .field("api", &self.api.is_some())
            .field("stats", &self.stats.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::exec::testing::RecordingExecutor;
    use crate::exec::{CommandRunner, Runner};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// CLI answering from a command -> output table
    #[derive(Default)]
    pub struct FakeCli {
        pub outputs: Mutex<HashMap<String, String>>,
        pub batches: Mutex<Vec<Vec<String>>>,
    }

    impl FakeCli {
        pub fn with(outputs: &[(&str, &str)]) -> Self {
            let cli = Self::default();
            for (cmd, out) in outputs {
                cli.outputs
                    .lock()
                    .unwrap()
                    .insert(cmd.to_string(), out.to_string());
            }
            cli
        }
    }

    #[async_trait]
    impl CliExecutor for FakeCli {
        async fn run_cli(&self, cmd: &str) -> Result<String> {
            let outputs = self.outputs.lock().unwrap();
            if let Some(out) = outputs.get(cmd) {
                return Ok(out.clone());
            }
            let prefix = outputs
                .iter()
                .find(|(k, _)| cmd.starts_with(k.as_str()))
                .map(|(_, v)| v.clone());
            prefix.ok_or_else(|| ProbeError::exec(format!("fake cli {}", cmd), "unknown command", b""))
        }

        async fn run_cli_batch(&self, cmds: &[String]) -> Result<String> {
            self.batches.lock().unwrap().push(cmds.to_vec());
            Ok(String::new())
        }
    }

    /// Handler with only a CLI; API and stats always fail
    pub struct FakeHandler {
        pub id: String,
        pub metadata: Metadata,
        pub cli: Arc<FakeCli>,
        pub exec: Arc<RecordingExecutor>,
        pub closed: AtomicUsize,
    }

    impl FakeHandler {
        pub fn new(id: &str, cli: FakeCli) -> Self {
            let mut metadata = Metadata::new();
            metadata.insert("env".into(), "local".into());
            Self {
                id: id.to_string(),
                metadata,
                cli: Arc::new(cli),
                exec: Arc::new(RecordingExecutor::default()),
                closed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Handler for FakeHandler {
        fn id(&self) -> &str {
            &self.id
        }

        fn metadata(&self) -> &Metadata {
            &self.metadata
        }

        fn runner(&self) -> Arc<dyn CommandRunner> {
            Arc::new(Runner::new(self.exec.clone()))
        }

        async fn get_cli(&self) -> Result<Arc<dyn CliExecutor>> {
            Ok(self.cli.clone())
        }

        async fn get_api(&self) -> Result<Arc<dyn RpcChannel>> {
            Err(ProbeError::capability("binapi", "not in fake"))
        }

        async fn get_stats(&self) -> Result<Arc<dyn StatsProvider>> {
            Err(ProbeError::capability("stats", "not in fake"))
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub const SHOW_VERSION: &str = "Version:                  v21.01-release\nCurrent PID:              1425\n";

    pub fn cli_only_handler(id: &str) -> Arc<FakeHandler> {
        Arc::new(FakeHandler::new(
            id,
            FakeCli::with(&[
                ("show version verbose", SHOW_VERSION),
                ("show clock", "Time now 10.5, Tue, 1 Dec 2020 11:52:45 GMT\n"),
                (
                    "show interface addr",
                    "local0 (dn):\nmemif0/0 (up):\n  L3 10.0.0.1/24\n",
                ),
                (
                    "show interface",
                    "local0   0   down   0/0/0/0\nmemif0/0   1   up   1500/0/0/0\n",
                ),
                (
                    "show logging",
                    "2020/12/01 11:52:40:101 notice     plugin/load    Loaded plugin\n",
                ),
            ]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_init_degrades_to_cli() {
        let instance = Instance::init(cli_only_handler("local-1425")).await.unwrap();
        let status = instance.status().await;
        assert_eq!(status.cli, Status::Ok);
        assert_eq!(status.bin_api, Status::Error);
        assert_eq!(status.stats_api, Status::Error);
        assert_eq!(instance.version().await.pid, 1425);
    }

    #[tokio::test]
    async fn test_init_fails_without_cli_output() {
        let handler = Arc::new(FakeHandler::new("broken", FakeCli::default()));
        assert!(Instance::init(handler).await.is_err());
    }

    #[tokio::test]
    async fn test_cli_fallback_queries() {
        let instance = Instance::init(cli_only_handler("local-1")).await.unwrap();

        assert_eq!(instance.get_uptime().await.unwrap(), Duration::from_millis(10_500));

        let ifaces = instance.list_interfaces().await.unwrap();
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[1].ip_addresses, vec!["10.0.0.1/24"]);

        let logs = instance.dump_logs().await.unwrap();
        assert_eq!(logs.len(), 1);

        assert_eq!(instance.get_version_info().await.unwrap().version, "v21.01-release");
        assert!(matches!(
            instance.list_stats().await,
            Err(ProbeError::Capability { .. })
        ));
    }
}
