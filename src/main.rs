//! Demo binary: run a coordinator or a worker, or print a partition plan.

use clap::{Parser, Subcommand, ValueEnum};
use nimbus::{
    Cluster, DistributedConfig, GenerationParams, InferenceModel, ModelDescriptor, ModelPartition, NodeCapability,
    NodeId, NodeInfo, NodeRole, PartitionStrategy,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Distributed inference coordination", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordinator and print a health report periodically
    Coordinator {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Overrides the configured coordinator port
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds between health reports
        #[arg(long, default_value = "10")]
        report_every: u64,
    },

    /// Join a coordinator and serve tasks with the demo model
    Worker {
        /// Coordinator host
        #[arg(long, default_value = "127.0.0.1")]
        coordinator: String,

        #[arg(short, long)]
        port: Option<u16>,

        /// Node id; generated when omitted
        #[arg(long)]
        id: Option<String>,

        #[arg(long, default_value = "4")]
        cores: u32,

        #[arg(long, default_value = "1.0")]
        power: f32,
    },

    /// Print the partition plan for a model shape
    Plan {
        #[arg(long)]
        layers: usize,

        #[arg(long, default_value = "4096")]
        hidden: usize,

        #[arg(long)]
        nodes: usize,

        #[arg(long, value_enum, default_value = "layer-wise")]
        strategy: StrategyArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    LayerWise,
    TensorParallel,
    Pipeline,
    DataParallel,
    Hybrid,
}

impl From<StrategyArg> for PartitionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::LayerWise => PartitionStrategy::LayerWise,
            StrategyArg::TensorParallel => PartitionStrategy::TensorParallel,
            StrategyArg::Pipeline => PartitionStrategy::Pipeline,
            StrategyArg::DataParallel => PartitionStrategy::DataParallel,
            StrategyArg::Hybrid => PartitionStrategy::Hybrid,
        }
    }
}

/// Deterministic stand-in for a real model
struct DemoModel;

impl InferenceModel for DemoModel {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(24, 4096, 2048)
    }

    fn generate(&self, params: &GenerationParams) -> nimbus::Result<Vec<i32>> {
        let seed = params.prompt_tokens.iter().copied().sum::<i32>();
        Ok((0..params.max_tokens as i32).map(|i| 100 + (seed + i) % 1000).collect())
    }
}

#[tokio::main]
async fn main() -> nimbus::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DistributedConfig::from_file(path)?,
        None => DistributedConfig::default(),
    };

    match cli.command {
        Commands::Coordinator {
            host,
            port,
            report_every,
        } => run_coordinator(config, &host, port, report_every).await,
        Commands::Worker {
            coordinator,
            port,
            id,
            cores,
            power,
        } => run_worker(config, &coordinator, port, id, cores, power).await,
        Commands::Plan {
            layers,
            hidden,
            nodes,
            strategy,
        } => {
            let model = ModelDescriptor::new(layers, hidden, 2048);
            let partition = ModelPartition::plan(&model, strategy.into(), nodes)?;
            println!("{}", serde_json::to_string_pretty(&partition)?);
            Ok(())
        }
    }
}

async fn run_coordinator(
    mut config: DistributedConfig,
    host: &str,
    port: Option<u16>,
    report_every: u64,
) -> nimbus::Result<()> {
    if let Some(port) = port {
        config.coordinator_port = port;
    }

    let cluster = Cluster::new(config)?;
    cluster.attach_model(Arc::new(DemoModel));
    let addr = cluster.start_coordinator(host).await?;
    info!(%addr, "Press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(report_every.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match cluster.health_report().to_json() {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!(error = %e, "Could not render health report"),
                }
                if cluster.is_load_imbalanced() {
                    warn!(stats = ?cluster.load_statistics(), "Cluster load is imbalanced");
                }
            }
        }
    }

    cluster.shutdown().await;
    Ok(())
}

async fn run_worker(
    config: DistributedConfig,
    coordinator: &str,
    port: Option<u16>,
    id: Option<String>,
    cores: u32,
    power: f32,
) -> nimbus::Result<()> {
    let port = port.unwrap_or(config.coordinator_port);
    let capability = NodeCapability::new(cores, 8 * 1024 * 1024 * 1024, power, 0)
        .map_err(|e| nimbus::ClusterError::ConfigRejected(e.to_string()))?;

    let id = id.map(NodeId::from).unwrap_or_else(NodeId::generate);
    let local = NodeInfo::new(id, "127.0.0.1", config.worker_base_port, NodeRole::Worker).with_capability(capability);

    let cluster = Cluster::new(config)?;
    cluster.attach_model(Arc::new(DemoModel));
    let index = cluster.join_cluster(coordinator, port, local).await?;
    info!(index, "Worker running, press Ctrl-C to leave");

    let _ = tokio::signal::ctrl_c().await;
    cluster.shutdown().await;
    Ok(())
}
