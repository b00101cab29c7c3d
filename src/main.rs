use clap::Parser;
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vpp_probe::cli::{commands, Cli};
use vpp_probe::config;

#[tokio::main]
async fn main() {
    let mut cli = Cli::parse();

    let default_level = if cli.debug || config::debug_forced() {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    debug!("Starting vpp-probe v{}", vpp_probe::VERSION);

    let result = match cli.command.take() {
        Some(command) => commands::handle_command(&cli, command).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
