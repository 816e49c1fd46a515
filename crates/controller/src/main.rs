use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::{Client, CustomResourceExt};
use mcpsync_controller::{ActiveRegistry, ManagerOptions, ResourceSyncConfig, SyncManager};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mcpsync-controller", version, about = "Keeps an MCP index in sync with live cluster resources")]
struct Cli {
    /// Log filter, e.g. "info,mcpsync_store=debug"
    #[arg(long, env = "MCPSYNC_LOG", default_value = "info", global = true)]
    log: String,

    /// Prometheus exporter listen address (host:port)
    #[arg(long, env = "MCPSYNC_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Print the resource types a config would watch
    Discover {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
    /// Print the ResourceSyncConfig CRD manifest
    Crd,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct RunArgs {
    /// Capacity of each config's change intake queue; changes beyond it are dropped
    #[arg(long, env = "MCPSYNC_QUEUE_CAPACITY", default_value_t = 4096)]
    queue_capacity: usize,
    #[arg(long, env = "MCPSYNC_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
    #[arg(long, env = "MCPSYNC_INITIAL_BACKOFF_MS", default_value_t = 1000)]
    initial_backoff_ms: u64,
    #[arg(long, env = "MCPSYNC_MAX_BACKOFF_MS", default_value_t = 30_000)]
    max_backoff_ms: u64,
    #[arg(long, env = "MCPSYNC_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
    /// Maintenance requeue for healthy configs
    #[arg(long, env = "MCPSYNC_REQUEUE_SECS", default_value_t = 300)]
    requeue_secs: u64,
}

impl RunArgs {
    fn options(&self) -> ManagerOptions {
        ManagerOptions {
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr.as_deref());

    match cli.command {
        Commands::Run(args) => {
            let client = Client::try_default().await.context("building kube client")?;
            let manager = Arc::new(SyncManager::with_client(args.options(), ActiveRegistry::new(), client.clone()));
            info!(queue_capacity = args.queue_capacity, max_retries = args.max_retries, "starting mcpsync controller");
            mcpsync_controller::run(client, manager, Duration::from_secs(args.requeue_secs)).await?;
        }
        Commands::Discover { output } => {
            let client = Client::try_default().await.context("building kube client")?;
            let resources = mcpsync_kubehub::discover(&client).await?;
            match output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.gvr, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Crd => println!("{}", serde_json::to_string_pretty(&ResourceSyncConfig::crd())?),
    }
    Ok(())
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => tracing::warn!(addr = %addr, "invalid MCPSYNC_METRICS_ADDR; expected host:port"),
    }
}
