use super::render::{self, InstanceRow};
use super::{Cli, Commands, DiscoverFormat, TopologyFormat};
use crate::agent::ipsec::{self, IpsecCorrelation};
use crate::agent::topology::{self, InstanceConfig};
use crate::agent::{Agent, AgentStatus};
use crate::client::Client;
use crate::config::ProbeConfig;
use crate::providers::{parse_queries, Env, Metadata, QueryParams};
use crate::trace::orchestrator::{run_trace, TraceOptions, Workload};
use crate::vpp::refresh::spawn_refresh;
use crate::vpp::{Instance, InstanceState};
use crate::{ProbeError, Result};
use chrono::Local;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Overlay command line flags on the file/default configuration
pub fn build_config(cli: &Cli) -> Result<ProbeConfig> {
    let mut config = ProbeConfig::load(cli.config.as_deref())?;

    let envs: Vec<&String> = cli.envs.iter().filter(|e| !e.trim().is_empty()).collect();
    if !envs.is_empty() {
        config.envs = envs
            .into_iter()
            .map(|e| e.parse::<Env>())
            .collect::<Result<Vec<_>>>()?;
    }
    if !cli.queries.is_empty() {
        config.queries = cli.queries.clone();
    }
    if let Some(path) = &cli.kubeconfig {
        config.kubeconfig = Some(path.clone());
    }
    if let Some(contexts) = &cli.kubecontext {
        config.kube_contexts = vec![contexts.clone()];
    }
    if let Some(host) = &cli.dockerhost {
        config.docker_host = Some(host.clone());
    }
    if let Some(sock) = &cli.clisock {
        config.vpp.cli_socket = sock.clone();
    }
    if let Some(sock) = &cli.apisock {
        config.vpp.api_socket = sock.clone();
    }
    if let Some(sock) = &cli.statsock {
        config.vpp.stats_socket = sock.clone();
    }

    config.validate()?;
    Ok(config)
}

pub async fn handle_command(cli: &Cli, command: Commands) -> Result<()> {
    let config = build_config(cli)?;
    let queries = parse_queries(&config.queries)?;

    let cancel = CancellationToken::new();
    let interrupt = spawn_interrupt_handler(cancel.clone());
    let result = run_session(&config, &queries, command, &cancel).await;
    interrupt.abort();
    result
}

async fn run_session(
    config: &ProbeConfig,
    queries: &[QueryParams],
    command: Commands,
    cancel: &CancellationToken,
) -> Result<()> {
    let client = Client::connect(config).await?;
    let result = match client.discover_instances(queries, cancel).await {
        Ok(instances) => run_command(config, command, &instances, cancel).await,
        Err(e) => Err(e),
    };

    if let Err(e) = client.close().await {
        warn!("Closing providers failed: {}", e);
    }
    result
}

async fn run_command(
    config: &ProbeConfig,
    command: Commands,
    instances: &[Arc<Instance>],
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Commands::Discover { format, ipsec_agg } => {
            handle_discover(config, instances, format, ipsec_agg, cancel).await
        }
        Commands::Instances { watch } => handle_instances(config, instances, watch, cancel).await,
        Commands::Exec { commands } => handle_exec(config, instances, &commands, cancel).await,
        Commands::Trace {
            resultdir,
            tracenodes,
            numpackets,
            print,
            duration,
            workload,
        } => {
            let options = TraceOptions {
                nodes: if tracenodes.is_empty() {
                    config.trace.nodes.clone()
                } else {
                    tracenodes
                },
                num_packets: numpackets.unwrap_or(config.trace.num_packets),
                result_dir: resultdir.unwrap_or_else(|| config.trace.result_dir.clone()),
            };
            handle_trace(instances, &options, workload_of(&workload, duration), print, cancel).await
        }
        Commands::Topology { src, dst, format } => {
            handle_topology(config, instances, src.as_deref(), dst.as_deref(), format, cancel).await
        }
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    })
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Retrieve agent snapshots of every instance, in instance order
async fn fetch_agents(
    config: &ProbeConfig,
    instances: &[Arc<Instance>],
    cancel: &CancellationToken,
) -> Result<Vec<Option<Arc<Agent>>>> {
    let fetch = stream::iter(instances)
        .map(|instance| async move {
            match instance.update_agent().await {
                Ok(agent) => agent,
                Err(e) => {
                    warn!("Retrieving agent config of {} failed: {}", instance.id(), e);
                    None
                }
            }
        })
        .buffered(config.concurrency)
        .collect::<Vec<_>>();
    until_cancelled(cancel, fetch).await
}

fn instance_configs(instances: &[Arc<Instance>], agents: &[Option<Arc<Agent>>]) -> Vec<InstanceConfig> {
    instances
        .iter()
        .zip(agents)
        .filter_map(|(instance, agent)| {
            agent.as_ref().map(|agent| InstanceConfig {
                instance: instance.id().to_string(),
                config: agent.config.clone(),
            })
        })
        .collect()
}

#[derive(Serialize)]
struct DiscoveredInstance<'a> {
    id: &'a str,
    metadata: &'a Metadata,
    state: InstanceState,
    agent: Option<&'a AgentStatus>,
}

#[derive(Serialize)]
struct DiscoverReport<'a> {
    instances: Vec<DiscoveredInstance<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipsec: Option<Vec<IpsecCorrelation>>,
}

async fn handle_discover(
    config: &ProbeConfig,
    instances: &[Arc<Instance>],
    format: DiscoverFormat,
    ipsec_agg: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let update = stream::iter(instances)
        .map(|instance| instance.update(&config.info_commands, None))
        .buffered(config.concurrency)
        .collect::<Vec<_>>();
    let states = until_cancelled(cancel, update).await?;
    let agents = fetch_agents(config, instances, cancel).await?;

    let correlations = ipsec_agg.then(|| ipsec::correlate(&instance_configs(instances, &agents)));

    match format {
        DiscoverFormat::Table => {
            for ((instance, state), agent) in instances.iter().zip(&states).zip(&agents) {
                let row = InstanceRow {
                    id: instance.id(),
                    metadata: instance.metadata(),
                    state,
                };
                println!("{}", render::instance_details(&row, agent.as_deref()));
            }
            if let Some(correlations) = &correlations {
                println!("IPsec correlations");
                println!("{}", "-".repeat(40));
                print!("{}", ipsec::report(correlations));
            }
        }
        DiscoverFormat::Json => {
            let report = DiscoverReport {
                instances: instances
                    .iter()
                    .zip(states)
                    .zip(&agents)
                    .map(|((instance, state), agent)| DiscoveredInstance {
                        id: instance.id(),
                        metadata: instance.metadata(),
                        state,
                        agent: agent.as_ref().map(|a| &a.status),
                    })
                    .collect(),
                ipsec: correlations,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn print_instances(instances: &[Arc<Instance>], states: &[InstanceState]) {
    let rows: Vec<InstanceRow<'_>> = instances
        .iter()
        .zip(states)
        .map(|(instance, state)| InstanceRow {
            id: instance.id(),
            metadata: instance.metadata(),
            state,
        })
        .collect();
    print!("{}", render::instances_table(&rows));
}

async fn handle_instances(
    config: &ProbeConfig,
    instances: &[Arc<Instance>],
    watch: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    if !watch {
        let mut states = Vec::with_capacity(instances.len());
        for instance in instances {
            states.push(instance.state().await);
        }
        print_instances(instances, &states);
        return Ok(());
    }

    let mut handles = Vec::with_capacity(instances.len());
    for instance in instances {
        let handle = spawn_refresh(
            instance.clone(),
            config.refresh_interval,
            config.info_commands.clone(),
            cancel.clone(),
        )
        .await;
        handle.trigger();
        handles.push(handle);
    }
    let receivers: Vec<_> = handles.iter().map(|h| h.subscribe()).collect();
    debug!("Watching {} instances every {:?}", instances.len(), config.refresh_interval);

    let mut ticker = tokio::time::interval(config.refresh_interval.max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let states: Vec<InstanceState> =
                    receivers.iter().map(|rx| rx.borrow().clone()).collect();
                println!("\n{}", Local::now().format("%Y-%m-%d %H:%M:%S"));
                print_instances(instances, &states);
            }
        }
    }

    for handle in handles {
        handle.stop().await;
    }
    Ok(())
}

async fn handle_exec(
    config: &ProbeConfig,
    instances: &[Arc<Instance>],
    commands: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let run = stream::iter(instances)
        .map(|instance| async move {
            let mut out = String::new();
            for cmd in commands {
                let output = match instance.run_cli(cmd).await {
                    Ok(output) => output,
                    Err(e) => {
                        warn!("Running {:?} on {} failed: {}", cmd, instance.id(), e);
                        format!("error: {}", e)
                    }
                };
                out.push_str(&render::exec_output(instance.id(), cmd, &output));
            }
            out
        })
        .buffered(config.concurrency)
        .collect::<Vec<_>>();

    for out in until_cancelled(cancel, run).await? {
        println!("{}", out);
    }
    Ok(())
}

/// A single argument is taken as a shell script, several arguments are
/// quoted so each reaches the program unchanged.
fn workload_of(args: &[String], duration: Duration) -> Workload {
    match args {
        [] => Workload::Sleep(duration),
        [script] => Workload::Command(script.clone()),
        args => Workload::Command(shell_words::join(args)),
    }
}

async fn handle_trace(
    instances: &[Arc<Instance>],
    options: &TraceOptions,
    workload: Workload,
    print: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(
        "Tracing {} nodes on {} instances ({} packets per node)",
        options.nodes.len(),
        instances.len(),
        options.num_packets
    );
    let run = run_trace(instances, options, &workload, cancel).await?;

    println!("{:<36} {:>8}  {}", "INSTANCE", "PACKETS", "RESULT FILE");
    println!("{}", "-".repeat(80));
    for trace in &run.traces {
        let file = trace
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "not saved".to_string());
        println!(
            "{:<36} {:>8}  {}",
            render::truncate(trace.instance.id(), 36),
            trace.result.packets.len(),
            file
        );
    }

    if print {
        for trace in &run.traces {
            println!();
            print!("{}", render::packets(trace.instance.id(), &trace.result.packets));
        }
    }

    match run.workload_error {
        None => Ok(()),
        Some(ProbeError::Cancelled) => {
            info!("Workload interrupted, traces collected");
            Ok(())
        }
        Some(e) => Err(e),
    }
}

async fn handle_topology(
    config: &ProbeConfig,
    instances: &[Arc<Instance>],
    src: Option<&str>,
    dst: Option<&str>,
    format: TopologyFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let agents = fetch_agents(config, instances, cancel).await?;
    let configs = instance_configs(instances, &agents);
    if configs.is_empty() {
        warn!("No agent config retrieved from any instance");
    }

    let topology = topology::build(&configs).filter(src, dst);
    info!("Topology has {} connections", topology.len());

    match format {
        TopologyFormat::Table => print!("{}", render::topology_table(&topology)),
        TopologyFormat::Dot => print!("{}", topology.to_dot()),
        TopologyFormat::Json => println!("{}", serde_json::to_string_pretty(&topology)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_build_config_overlays_flags() {
        let cli = Cli::parse_from([
            "vpp-probe",
            "--env",
            "container,cluster",
            "--kubecontext",
            "kind-a,kind-b",
            "--dockerhost",
            "tcp://10.0.0.5:2375",
            "--clisock",
            "/tmp/cli.sock",
            "--config",
            "/nonexistent/vpp-probe.yaml",
            "instances",
        ]);
        assert!(matches!(build_config(&cli), Err(ProbeError::Config(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.yaml");
        std::fs::write(&path, "concurrency: 3\n").unwrap();
        let cli = Cli::parse_from([
            "vpp-probe",
            "--config",
            path.to_str().unwrap(),
            "--env",
            "container,cluster",
            "--kubecontext",
            "kind-a,kind-b",
            "--dockerhost",
            "tcp://10.0.0.5:2375",
            "--clisock",
            "/tmp/cli.sock",
            "instances",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.envs, vec![Env::Container, Env::Cluster]);
        assert_eq!(config.kube_contexts, vec!["kind-a,kind-b"]);
        assert_eq!(config.docker_host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert_eq!(config.vpp.cli_socket, "/tmp/cli.sock");
        assert_eq!(config.concurrency, 3);
    }

    #[test]
    fn test_build_config_rejects_unknown_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.yaml");
        std::fs::write(&path, "").unwrap();
        let cli = Cli::parse_from([
            "vpp-probe",
            "--config",
            path.to_str().unwrap(),
            "--env",
            "vm",
            "instances",
        ]);
        assert!(matches!(build_config(&cli), Err(ProbeError::UnknownEnv(env)) if env == "vm"));
    }

    #[test]
    fn test_workload_of() {
        assert_eq!(
            workload_of(&[], Duration::from_secs(5)),
            Workload::Sleep(Duration::from_secs(5))
        );
        assert_eq!(
            workload_of(&["ping".into(), "-c".into(), "3".into()], Duration::from_secs(5)),
            Workload::Command("ping -c 3".into())
        );
        let args: Vec<String> = vec!["echo".into(), "a b".into(), "it's".into()];
        match workload_of(&args, Duration::ZERO) {
            Workload::Command(cmd) => {
                assert!(cmd.starts_with("echo 'a b' "), "{}", cmd);
                assert_eq!(shell_words::split(&cmd).unwrap(), args);
            }
            other => panic!("expected command, got {:?}", other),
        }
        assert_eq!(
            workload_of(&["ping -c 1 10.0.0.2 | tail -1".into()], Duration::ZERO),
            Workload::Command("ping -c 1 10.0.0.2 | tail -1".into())
        );
    }
}
