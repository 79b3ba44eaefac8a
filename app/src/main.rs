//! nodectl — control-plane sidecar of a proxy edge node.
//!
//! Loads the YAML process config, builds the shared engine, then starts one
//! controller per configured node and runs until interrupted.

mod service;

use clap::{Parser, Subcommand};
use nc_config::Config;

#[derive(Parser)]
#[command(name = "nodectl", version, about = "proxy edge node controller")]
struct Args {
    /// Path to the process configuration file.
    #[arg(short, long, default_value = "config.yml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the configured nodes.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_yaml_file(&args.config)?;
    init_logging(&config.log.level);

    match args.command {
        Some(Commands::Check) => {
            for node in &config.nodes {
                println!(
                    "{} node {} via {} ({})",
                    node.api.node_type, node.api.node_id, node.api.api_host, node.panel_type
                );
            }
            println!("configuration ok: {} node(s)", config.nodes.len());
            Ok(())
        }
        None => service::run(config).await,
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
