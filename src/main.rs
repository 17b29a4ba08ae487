//! WolfCluster - Single-Node Cluster Bootstrap
//!
//! Runs a node that elects itself master of a one-node cluster and serves
//! its cluster state over HTTP.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcluster::api::HttpServer;
use wolfcluster::cluster::DiscoveryNode;
use wolfcluster::config::{LoggingConfig, WolfClusterConfig};
use wolfcluster::error::{Error, Result};
use wolfcluster::node::Node;

/// WolfCluster - Single-Node Cluster Bootstrap
#[derive(Parser)]
#[command(name = "wolfcluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcluster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and elect it master
    Start,

    /// Check the status of a running node
    Status {
        /// API address to query
        #[arg(short, long, default_value = "localhost:9200")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcluster.toml")]
        output: PathBuf,

        /// Node ID (generated at startup when omitted)
        #[arg(long)]
        node_id: Option<String>,

        /// Transport address of this node
        #[arg(long, default_value = "127.0.0.1:9300")]
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config-driven commands pick their log settings from the file when it loads
    let logging = match cli.command {
        Commands::Start | Commands::Info => WolfClusterConfig::from_file(&cli.config)
            .map(|c| c.logging)
            .unwrap_or_default(),
        _ => LoggingConfig::default(),
    };
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init {
            output,
            node_id,
            address,
        } => run_init(output, node_id, address),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfCluster node...");

    let config = match WolfClusterConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };

    let node = Node::new(config.clone())?;

    let state = match node.start().await {
        Ok(state) => state,
        Err(e) if e.is_closed() => {
            tracing::warn!("Node closed before the cluster formed");
            return Err(e);
        }
        Err(e) => {
            tracing::error!("Node failed to join the cluster: {}", e);
            node.close().await?;
            return Err(e);
        }
    };
    tracing::info!("Cluster ready: {}", state);

    let http_server = HttpServer::new(
        config.api.clone(),
        node.local_node().id().to_string(),
        std::sync::Arc::clone(node.cluster()),
    );
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    http_handle.abort();
    node.close().await?;

    tracing::info!("WolfCluster shutdown complete");
    Ok(())
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: Option<String>, address: String) -> Result<()> {
    let mut config = WolfClusterConfig::for_address(address);
    config.node.id = node_id;
    config.validate()?;

    let content = format!(
        "# WolfCluster Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );

    std::fs::write(&output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: wolfcluster --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfClusterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id.as_deref().unwrap_or("(generated)"));
            println!("  Address: {}", config.node.address);
            println!("  Cluster: {}", config.cluster.name);
            println!("  Discovery: {}", config.discovery.kind);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfClusterConfig::from_file(&config_path)?;
    let local = DiscoveryNode::from_config(&config.node)?;

    println!("WolfCluster Node Information");
    println!("============================");
    println!();
    println!("Node ID:          {}", config.node.id.as_deref().unwrap_or("(generated at startup)"));
    println!("Node Name:        {}", config.node.name.as_deref().unwrap_or("(node id)"));
    println!("Address:          {}", local.address());
    println!("Protocol:         {}", local.version());
    println!();
    println!("Cluster Configuration:");
    println!("  Name:           {}", config.cluster.name);
    println!("  Discovery:      {}", config.discovery.kind);
    println!("  Join Timeout:   {} ms", config.cluster.initial_join_timeout_ms);
    println!();
    println!("API Configuration:");
    println!("  Enabled:        {}", config.api.enabled);
    println!("  Bind Address:   {}", config.api.bind_address);

    Ok(())
}
