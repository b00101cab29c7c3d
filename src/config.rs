//! Probe configuration
//!
//! Defaults are built in, optionally overlaid by a YAML file, and finally by
//! command-line flags (see `cli::commands`).

use crate::providers::Env;
use crate::{ProbeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming a YAML config file
pub const CONFIG_ENV: &str = "VPP_PROBE_CONFIG";

/// Environment variable forcing debug logging when non-empty
pub const DEBUG_ENV: &str = "VPP_PROBE_DEBUG";

pub const DEFAULT_CLI_SOCKET: &str = "/run/vpp/cli.sock";
pub const DEFAULT_API_SOCKET: &str = "/run/vpp/api.sock";
pub const DEFAULT_STATS_SOCKET: &str = "/run/vpp/stats.sock";
pub const DEFAULT_VPPCTL: &str = "/usr/bin/vppctl";
pub const DEFAULT_CLI_TCP_ADDR: &str = "localhost:5002";
pub const DEFAULT_PROXY_PORT: u16 = 9191;
pub const DEFAULT_NUM_PACKETS: u32 = 5000;

/// Input nodes traced when none are given explicitly
pub const DEFAULT_TRACE_NODES: &[&str] = &[
    "af-packet-input",
    "avf-input",
    "bond-process",
    "dpdk-crypto-input",
    "dpdk-input",
    "handoff-trace",
    "ixge-input",
    "lacp-process",
    "memif-input",
    "p2p-ethernet-input",
    "pg-input",
    "punt-socket-rx",
    "rdma-input",
    "session-queue",
    "tuntap-rx",
    "vhost-user-input",
    "virtio-input",
    "vmxnet3-input",
];

/// Informational CLIs captured on every manual refresh
pub const DEFAULT_INFO_COMMANDS: &[&str] = &[
    "show version verbose",
    "show plugins",
    "show threads",
    "show hardware-interfaces",
    "show interface address",
    "show errors",
    "show memory main-heap",
    "show buffers",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Environments to discover instances in
    pub envs: Vec<Env>,
    /// Raw query clauses, see `providers::query`
    pub queries: Vec<String>,
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig contexts; each yields its own cluster provider
    pub kube_contexts: Vec<String>,
    pub docker_host: Option<String>,
    pub vpp: VppConfig,
    pub trace: TraceConfig,
    #[serde(with = "humantime_serde_compat")]
    pub refresh_interval: Duration,
    /// Upper bound on concurrently processed instances
    pub concurrency: usize,
    pub info_commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VppConfig {
    pub vppctl: String,
    pub cli_socket: String,
    pub api_socket: String,
    pub stats_socket: String,
    /// CLI endpoint used inside containers lacking the CLI socket
    pub cli_tcp_addr: String,
    /// Port of the in-instance RPC proxy
    pub proxy_port: u16,
    #[serde(with = "humantime_serde_compat")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub num_packets: u32,
    pub nodes: Vec<String>,
    pub result_dir: PathBuf,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            envs: vec![Env::Local],
            queries: Vec::new(),
            kubeconfig: None,
            kube_contexts: Vec::new(),
            docker_host: None,
            vpp: VppConfig::default(),
            trace: TraceConfig::default(),
            refresh_interval: Duration::from_secs(1),
            concurrency: 10,
            info_commands: DEFAULT_INFO_COMMANDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for VppConfig {
    fn default() -> Self {
        Self {
            vppctl: DEFAULT_VPPCTL.to_string(),
            cli_socket: DEFAULT_CLI_SOCKET.to_string(),
            api_socket: DEFAULT_API_SOCKET.to_string(),
            stats_socket: DEFAULT_STATS_SOCKET.to_string(),
            cli_tcp_addr: DEFAULT_CLI_TCP_ADDR.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            num_packets: DEFAULT_NUM_PACKETS,
            nodes: DEFAULT_TRACE_NODES.iter().map(|s| s.to_string()).collect(),
            result_dir: PathBuf::from("."),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from `path`, or from `$VPP_PROBE_CONFIG` when no
    /// path is given. Falls back to defaults when neither is set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProbeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.envs.is_empty() {
            return Err(ProbeError::Config("no environment selected".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ProbeError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.trace.num_packets == 0 {
            return Err(ProbeError::Config(
                "trace.num_packets must be at least 1".to_string(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(ProbeError::Config(
                "refresh_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Kubeconfig path: explicit setting first, then `$KUBECONFIG`
    pub fn resolve_kubeconfig(&self) -> Option<PathBuf> {
        self.kubeconfig.clone().or_else(|| {
            std::env::var_os("KUBECONFIG")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        })
    }
}

/// True when `$VPP_PROBE_DEBUG` is set to a non-empty value
pub fn debug_forced() -> bool {
    std::env::var_os(DEBUG_ENV).is_some_and(|v| !v.is_empty())
}

/// Serde adapter for durations written as "1s", "500ms", "2m"
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ProbeConfig::default();
        assert_eq!(config.envs, vec![Env::Local]);
        assert_eq!(config.trace.num_packets, 5000);
        assert_eq!(config.refresh_interval, Duration::from_secs(1));
        assert_eq!(config.vpp.cli_socket, "/run/vpp/cli.sock");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
envs: [container, cluster]
kube_contexts: [kind-a, kind-b]
refresh_interval: 500ms
vpp:
  proxy_port: 9999
trace:
  num_packets: 100
"#;
        let config = ProbeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.envs, vec![Env::Container, Env::Cluster]);
        assert_eq!(config.kube_contexts, vec!["kind-a", "kind-b"]);
        assert_eq!(config.refresh_interval, Duration::from_millis(500));
        assert_eq!(config.vpp.proxy_port, 9999);
        assert_eq!(config.vpp.cli_socket, DEFAULT_CLI_SOCKET);
        assert_eq!(config.trace.num_packets, 100);
        assert!(!config.trace.nodes.is_empty());
    }

    #[test]
    fn test_unknown_env_is_rejected() {
        let err = ProbeConfig::from_yaml("envs: [mainframe]").unwrap_err();
        assert!(matches!(err, ProbeError::Yaml(_)));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = ProbeConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "docker_host: tcp://10.0.0.1:2375").unwrap();
        let config = ProbeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.docker_host.as_deref(), Some("tcp://10.0.0.1:2375"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ProbeConfig::from_file(Path::new("/nonexistent/vpp-probe.yaml")).unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }
}
