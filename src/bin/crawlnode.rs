//! crawlnode CLI: run the node or inspect its durable state.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use crawlnode::channel::{StaticLink, WsConnector};
use crawlnode::config::{Config, NodeConfig};
use crawlnode::engine::{HttpSandbox, IdentityProcessor};
use crawlnode::limiter::RateLimiter;
use crawlnode::node::{Node, open_store};
use crawlnode::queue::AdmissionQueue;
use crawlnode::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "crawlnode", about = "Crawl node job coordinator")]
struct Cli {
    /// TOML file with coordinator limits
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the dispatcher and run jobs until Ctrl-C
    Serve {
        /// Measured downlink in Mbit/s; unknown when omitted
        #[arg(long)]
        downlink_mbps: Option<f64>,
    },
    /// Show queued jobs and the rate-limit window
    Status,
    /// Start a fresh rate-limit window and clear the limit-reached flag
    ResetWindow,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let node_config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Command::Serve { downlink_mbps } => cmd_serve(node_config, downlink_mbps).await,
        Command::Status => cmd_status(node_config).await,
        Command::ResetWindow => cmd_reset_window(node_config).await,
    }
}

async fn cmd_serve(node_config: NodeConfig, downlink_mbps: Option<f64>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "crawlnode".to_string(),
        node_id: config.node_id.clone(),
        log_level: config.log_level.clone(),
    })?;

    let store = open_store(&config).await?;
    let sandbox = Arc::new(HttpSandbox::new(node_config.base_lifespan())?);
    let node = Node::start(
        &config.node_id,
        node_config,
        store,
        sandbox,
        Arc::new(IdentityProcessor),
    )
    .await?;

    let connector = Arc::new(WsConnector::new(
        config.dispatcher_url.clone(),
        config.dispatcher_token.clone(),
    ));
    let channel = Arc::new(node.channel(
        &config.node_id,
        connector,
        Arc::new(StaticLink(downlink_mbps)),
    ));

    let ch = Arc::clone(&channel);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ch.stop();
    });

    let result = channel.run().await;
    node.shutdown().await;
    result?;
    Ok(())
}

async fn cmd_status(node_config: NodeConfig) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let queue = AdmissionQueue::new(Arc::clone(&store), node_config.queue_capacity);
    let limiter = RateLimiter::new(store, node_config.daily_cap, node_config.refresh_interval())?;

    match limiter.state().await? {
        Some(window) => println!(
            "Window:     started {} ({} / {})",
            window.window_start.format("%Y-%m-%d %H:%M:%S"),
            window.count,
            limiter.daily_cap()
        ),
        None => println!("Window:     none"),
    }
    match limiter.reopens_at().await? {
        Some(at) => println!("Limit:      reached, reopens {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("Limit:      not reached"),
    }

    let entries = queue.snapshot().await?;
    println!("Queue:      {} / {}", entries.len(), queue.capacity());
    if entries.is_empty() {
        return Ok(());
    }

    println!();
    println!("{:<24}  {:<12}  {:<17}  URL", "JOB", "CLASS", "ARRIVED");
    println!("{}", "-".repeat(90));
    for entry in &entries {
        println!(
            "{:<24}  {:<12}  {:<17}  {}",
            entry.job.id.to_string(),
            entry.job.class.to_string(),
            entry.job.arrived_at.format("%Y-%m-%d %H:%M"),
            entry.job.url
        );
    }
    Ok(())
}

async fn cmd_reset_window(node_config: NodeConfig) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let limiter = RateLimiter::new(store, node_config.daily_cap, node_config.refresh_interval())?;
    limiter.reset_window(Utc::now()).await?;
    println!("Rate-limit window reset.");
    Ok(())
}
