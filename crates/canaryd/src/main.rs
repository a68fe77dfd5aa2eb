//! canaryd — the canary rollout daemon.
//!
//! Runs one consensus node over TCP, or replays a node's transaction log
//! offline.
//!
//! # Usage
//!
//! ```text
//! canaryd run --config node-a.toml --stages 0.05,0.2,0.5
//! canaryd run --config node-b.toml --probe-addr 127.0.0.1:50052
//! canaryd inspect --log logs/node-a.log
//! ```

mod health_probe;
mod inspect;
mod node_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "canaryd", about = "Canary rollout consensus daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node until Ctrl-C.
    Run {
        /// Node configuration file (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Override `node_id` from the config file.
        #[arg(long)]
        node_id: Option<String>,

        /// Override `listen_addr` from the config file.
        #[arg(long)]
        listen: Option<String>,

        /// Override `data_dir` from the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Canary shares to roll out in order, coordinated by this node.
        #[arg(long, value_delimiter = ',')]
        stages: Vec<f64>,

        /// Seconds to wait before the first stage and between stages.
        #[arg(long, default_value = "2")]
        stage_interval: u64,

        /// Model server address to probe for latency and errors.
        #[arg(long)]
        probe_addr: Option<String>,

        /// Seconds per health sampling window.
        #[arg(long, default_value = "10")]
        health_window: u64,
    },
    /// Replay a transaction log and print the recovered state as JSON.
    Inspect {
        /// Path to a `<node_id>.log` file.
        #[arg(long)]
        log: PathBuf,

        /// Stable model id the log started from.
        #[arg(long, default_value = "v1")]
        stable_model: String,

        /// Canary model id the log started from.
        #[arg(long, default_value = "v2")]
        canary_model: String,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,canaryd=debug,canary=debug"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Command::Run {
            config,
            node_id,
            listen,
            data_dir,
            stages,
            stage_interval,
            probe_addr,
            health_window,
        } => {
            let overrides = node_mode::Overrides {
                node_id,
                listen,
                data_dir,
            };
            let driver = node_mode::Driver {
                stages,
                stage_interval,
                probe_addr,
                health_window,
            };
            node_mode::run_node(&config, overrides, driver).await
        }
        Command::Inspect {
            log,
            stable_model,
            canary_model,
        } => inspect::run_inspect(&log, &stable_model, &canary_model),
    }
}
