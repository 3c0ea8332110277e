//! Demo binary: loads a [`GlintConfig`], boots a single-node or in-process
//! multi-node cluster, and runs until `Ctrl-C`.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use glint_node::{Cluster, GlintConfig};

#[derive(Parser)]
#[command(name = "glintd", about = "glint demo node runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the config at `--config`, boot a cluster, and serve until interrupted.
    Run {
        /// Directory holding `glint.toml` (and, if missing, where a default
        /// one is written before starting).
        #[arg(long)]
        config: Utf8PathBuf,

        /// Number of in-process nodes to run as a demo cluster; 1 is a
        /// single node.
        #[arg(long, default_value_t = 1)]
        peers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    glint_node::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, peers } => run(&config, peers).await,
    }
}

async fn run(config_dir: &Utf8PathBuf, peers: usize) -> Result<()> {
    let config = if GlintConfig::exists(config_dir) {
        GlintConfig::load(config_dir).wrap_err("failed to load configuration")?
    } else {
        tracing::info!(dir = %config_dir, "no configuration found, writing defaults");
        let config = GlintConfig::default();
        config
            .save(config_dir)
            .wrap_err("failed to write default configuration")?;
        config
    };

    tracing::info!(node_id = %config.node_id, peers, "booting cluster");
    let cluster = Cluster::bootstrap(&config, peers, config_dir).wrap_err("failed to bootstrap cluster")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let daemons = cluster.spawn_anti_entropy(shutdown_rx);

    tracing::info!(nodes = cluster.nodes.len(), "cluster running, awaiting ctrl-c");
    tokio::signal::ctrl_c().await.wrap_err("failed to listen for ctrl-c")?;

    tracing::info!("shutdown requested, stopping anti-entropy daemons");
    shutdown_tx.send(true).ok();
    for daemon in daemons {
        let _ = daemon.await;
    }

    Ok(())
}
