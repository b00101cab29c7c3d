pub mod commands;
pub mod render;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "vpp-probe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Discover, inspect and trace VPP instances across local, Docker and Kubernetes environments",
    long_about = None
)]
pub struct Cli {
    #[arg(short = 'D', long, global = true, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(short, long, global = true, help = "YAML config file (default: $VPP_PROBE_CONFIG)")]
    pub config: Option<PathBuf>,

    #[arg(
        short,
        long = "env",
        global = true,
        value_delimiter = ',',
        help = "Environments to search (local, container, cluster)"
    )]
    pub envs: Vec<String>,

    #[arg(
        short,
        long = "query",
        global = true,
        help = "Instance query, key=value pairs joined by ';' (repeat for OR)"
    )]
    pub queries: Vec<String>,

    #[arg(long, global = true, help = "Path to kubeconfig (default: $KUBECONFIG)")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, global = true, help = "Kubeconfig contexts, comma-separated")]
    pub kubecontext: Option<String>,

    #[arg(long, global = true, help = "Docker daemon address")]
    pub dockerhost: Option<String>,

    #[arg(long, global = true, help = "VPP CLI socket path")]
    pub clisock: Option<String>,

    #[arg(long, global = true, help = "VPP binary API socket path")]
    pub apisock: Option<String>,

    #[arg(long, global = true, help = "VPP stats socket path")]
    pub statsock: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiscoverFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TopologyFormat {
    Table,
    Dot,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Discover instances and print their details")]
    Discover {
        #[arg(short, long, value_enum, default_value = "table", help = "Output format")]
        format: DiscoverFormat,

        #[arg(long, help = "Correlate IPsec policies across instances")]
        ipsec_agg: bool,
    },
    #[command(about = "List instances")]
    Instances {
        #[arg(short, long, help = "Keep refreshing until interrupted")]
        watch: bool,
    },
    #[command(about = "Run CLI commands on every instance")]
    Exec {
        #[arg(default_values_t = ["show interface".to_string(), "show err".to_string()])]
        commands: Vec<String>,
    },
    #[command(about = "Trace packets while running a workload")]
    Trace {
        #[arg(long, help = "Directory for trace results")]
        resultdir: Option<PathBuf>,

        #[arg(long, value_delimiter = ',', help = "Nodes to trace, comma-separated")]
        tracenodes: Vec<String>,

        #[arg(long, help = "Packets to trace per node")]
        numpackets: Option<u32>,

        #[arg(long, help = "Print parsed packets")]
        print: bool,

        #[arg(
            short,
            long,
            value_parser = humantime::parse_duration,
            default_value = "5s",
            help = "How long to trace when no workload is given"
        )]
        duration: Duration,

        #[arg(
            last = true,
            help = "Workload command run with sh -c, a single argument is used as a script"
        )]
        workload: Vec<String>,
    },
    #[command(about = "Print the topology between instances")]
    Topology {
        #[arg(help = "Source instance or interface filter")]
        src: Option<String>,

        #[arg(help = "Destination instance or interface filter")]
        dst: Option<String>,

        #[arg(short, long, value_enum, default_value = "table", help = "Output format")]
        format: TopologyFormat,
    },
}
