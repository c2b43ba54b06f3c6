//! cloudproxyd — the CloudProxy daemon.
//!
//! Single binary that assembles every subsystem:
//! - Fleet store (redb)
//! - Provider adapters
//! - Reconciliation controller (scaling + rolling recycle)
//! - Destroy queue worker
//! - REST API
//!
//! # Usage
//!
//! ```text
//! cloudproxyd serve --config /etc/cloudproxy.toml --port 8000 --data-dir /var/lib/cloudproxy
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloudproxyd", about = "CloudProxy fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller, destroy worker, and API in one process.
    Serve {
        /// Fleet configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long, default_value = "8000")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/cloudproxy")]
        data_dir: PathBuf,

        /// Keep all state in memory; nothing survives a restart.
        #[arg(long)]
        in_memory: bool,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cloudproxyd=debug,cloudproxy=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            in_memory,
            log_json,
        } => {
            init_tracing(log_json);
            let store_location = if in_memory { None } else { Some(data_dir) };
            daemon::run(config, port, store_location).await
        }
    }
}
