// Ratekeeper - Main Entry Point
//
// Operator CLI for the coordinator:
// - validate a configuration file
// - print operation / circuit status
// - inspect a persistent quota
// - serve the status view

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ratekeeper::config::Config;
use ratekeeper::coordinator;
use ratekeeper::quota::Reservation;
use ratekeeper::status_server;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Ratekeeper: rate-limited access to quota-constrained APIs
#[derive(Parser, Debug)]
#[command(name = "ratekeeper")]
#[command(author = "Ratekeeper Contributors")]
#[command(version)]
#[command(about = "Token buckets, circuit breakers and quotas for external APIs", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: $RATEKEEPER_CONFIG or ./ratekeeper.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration and print the operation table
    CheckConfig,
    /// Print bucket, queue and circuit status as JSON
    Status {
        /// Only this operation
        #[arg(long)]
        operation: Option<String>,
    },
    /// Show an owner's persistent quota and the wait for a number of tokens
    Quota {
        #[arg(long)]
        owner: String,

        #[arg(long, default_value_t = 1)]
        tokens: u32,
    },
    /// Run the coordinator and serve the status view until Ctrl-C
    Serve {
        /// Overrides [status].port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let path = args.config.clone().unwrap_or_else(Config::config_path);
    let config = Config::load_from_path(&path)?;
    init_tracing(&config, args.verbose)?;

    match args.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Status { operation } => status(&config, operation).await,
        Commands::Quota { owner, tokens } => quota(&config, &owner, tokens).await,
        Commands::Serve { port } => serve(&config, port).await,
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    let registry = config.registry()?;

    println!("Configuration OK");
    println!("  store: {:?} ({})", config.store.backend, config.store.failure_policy);
    println!("  operations: {}", registry.len());
    for name in registry.operations() {
        let limit = registry.get(&name)?;
        println!(
            "    {:<40} rate={}/s burst={} min_delay={}ms batch={}",
            name,
            limit.rate_per_second,
            limit.burst_capacity,
            limit.min_delay_ms,
            limit.max_batch_size
        );
    }
    if config.quota.enabled {
        println!(
            "  quota: {:?} max={} regen={}/min",
            config.quota.backend, config.quota.max_tokens, config.quota.regen_per_minute
        );
    }
    Ok(())
}

async fn status(config: &Config, operation: Option<String>) -> Result<()> {
    let coordinator = coordinator::Coordinator::from_config(config).await?;

    let json = match operation {
        Some(operation) => serde_json::to_string_pretty(&coordinator.operation_status(&operation).await?)?,
        None => serde_json::to_string_pretty(&coordinator.status_report().await?)?,
    };
    println!("{}", json);

    coordinator.shutdown().await;
    Ok(())
}

async fn quota(config: &Config, owner: &str, tokens: u32) -> Result<()> {
    if !config.quota.enabled {
        anyhow::bail!("Quota tracking is disabled; set [quota].enabled = true");
    }
    let coordinator = coordinator::Coordinator::from_config(config).await?;
    let tracker = coordinator
        .quota()
        .context("Quota tracker was not built")?;

    let snapshot = tracker.snapshot(owner).await?;
    let wait = snapshot.quota.wait_time_for(tokens as f64);
    let outcome = if wait.is_zero() {
        Reservation::Granted {
            remaining: snapshot.quota.available_tokens - tokens as f64,
        }
    } else {
        Reservation::Insufficient {
            available: snapshot.quota.available_tokens,
            wait,
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "owner": owner,
            "backend": tracker.backend(),
            "tokens": tokens,
            "quota": snapshot.quota,
            "if_reserved": outcome,
        }))?
    );

    coordinator.shutdown().await;
    Ok(())
}

async fn serve(config: &Config, port: Option<u16>) -> Result<()> {
    let coordinator = coordinator::init(config).await?;
    let port = port.unwrap_or(config.status.port);

    info!(port, "Ratekeeper serving");
    status_server::serve(coordinator, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await?;

    coordinator::shutdown().await;
    Ok(())
}
