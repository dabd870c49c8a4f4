//! Content Ingestion Service
//!
//! Command-line front end for the ingestion engine:
//! - `run` ticks the scheduler until SIGINT/SIGTERM, then drains gracefully
//! - `run --once` dispatches one tick and waits for it to finish
//! - subscription management: add, enable, disable, reschedule, list
//! - inspection: items, status

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use content_ingestion::config::Config;
use content_ingestion::harvester::Harvester;
use content_ingestion::schemas::{NewSubscription, SubscriptionId};
use content_ingestion::status::{parse_since, status};
use content_ingestion::storage::{ItemStore, Storage, SubscriptionStore};
use content_ingestion::{schedule, scheduler, IngestionError};

/// Content Ingestion Service - scheduled, deduplicated feed polling
#[derive(Parser, Debug)]
#[command(name = "content-ingestion")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Continuously polls subscriptions and stores new items")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,

    /// Optional TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the ingestion engine
    Run {
        /// Run a single tick and exit once dispatched work completes
        #[arg(long)]
        once: bool,
    },

    /// Register a new subscription
    Add {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// Source URL
        #[arg(short, long)]
        url: String,

        /// Source kind (feed, channel, periodic)
        #[arg(short, long, default_value = "feed")]
        kind: String,

        /// Schedule ("@every 30m", "@hourly", "*/15 * * * *")
        #[arg(short, long, default_value = "@hourly")]
        schedule: String,
    },

    /// Re-enable a subscription and reset its failure count
    Enable { id: SubscriptionId },

    /// Disable a subscription
    Disable {
        id: SubscriptionId,

        /// Reason recorded as the last error
        #[arg(short, long, default_value = "disabled by operator")]
        reason: String,
    },

    /// Change a subscription's schedule
    Reschedule { id: SubscriptionId, schedule: String },

    /// List subscriptions
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Show recently discovered items of a subscription
    Items {
        id: SubscriptionId,

        /// Maximum number of items
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },

    /// Show engine status
    Status {
        /// Trailing window for item counts (e.g., "24h", "30m", "7d")
        #[arg(short, long, default_value = "24h")]
        window: String,

        /// Failure count at which a subscription is reported as failing
        #[arg(short, long, default_value = "3")]
        threshold: u32,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Generates a new correlation ID for the session
fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Handles graceful shutdown on SIGTERM/SIGINT
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    // Signal all tasks to shutdown
    let _ = shutdown_tx.send(());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    let correlation_id = generate_correlation_id();

    let config = Config::load(cli.config.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        correlation_id = %correlation_id,
        database = %config.database_url,
        max_concurrent = config.max_concurrent_fetches,
        tick_secs = config.tick_interval_secs,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Run { once } => run(config, correlation_id, once).await?,
        Commands::Add { name, url, kind, schedule } => {
            add_subscription(&config, NewSubscription::new(name, url, kind, schedule)).await?
        }
        Commands::Enable { id } => {
            let storage = open_storage(&config).await?;
            storage.subscriptions().enable(id).await?;
            println!("Enabled subscription {}", id);
        }
        Commands::Disable { id, reason } => {
            let storage = open_storage(&config).await?;
            storage.subscriptions().disable(id, &reason).await?;
            println!("Disabled subscription {}", id);
        }
        Commands::Reschedule { id, schedule } => {
            let storage = open_storage(&config).await?;
            let next = scheduler::reschedule(&storage.subscriptions(), id, &schedule, Utc::now()).await?;
            println!("Subscription {} next due {}", id, next.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        Commands::List { output } => list_subscriptions(&config, &output).await?,
        Commands::Items { id, limit } => show_items(&config, id, limit).await?,
        Commands::Status { window, threshold, json } => {
            show_status(&config, &window, threshold, json).await?
        }
    }

    Ok(())
}

async fn open_storage(config: &Config) -> Result<Storage> {
    Ok(Storage::new(&config.database_url, config.db_max_connections).await?)
}

/// Runs the engine until a shutdown signal, or for a single tick
async fn run(config: Config, correlation_id: String, once: bool) -> Result<()> {
    let harvester = Arc::new(Harvester::new(config, correlation_id).await?);

    if once {
        let report = harvester.run_once().await?;
        println!(
            "Tick complete: {} due, {} dispatched, {} skipped, {} invalid schedules",
            report.due, report.dispatched, report.skipped_in_flight, report.invalid_schedule
        );
        harvester.shutdown().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let signal_handle = tokio::spawn(shutdown_signal(shutdown_tx));

    info!("Running in daemon mode (continuous ingestion)");
    if let Err(e) = harvester.run_continuous(shutdown_rx).await {
        error!(error = %e, "Harvester failed");
        return Err(e.into());
    }

    signal_handle.abort();
    info!("Content Ingestion Service stopped");
    Ok(())
}

async fn add_subscription(config: &Config, subscription: NewSubscription) -> Result<()> {
    if let Err(e) = schedule::next_due(&subscription.schedule, Utc::now()) {
        warn!(error = %e, "Schedule is invalid; the subscription will be disabled on its first tick");
    }

    let storage = open_storage(config).await?;
    match storage.subscriptions().register(&subscription).await {
        Ok(id) => {
            println!("Registered subscription {} ({})", id, subscription.url);
            Ok(())
        }
        Err(IngestionError::DuplicateSource(url)) => bail!("A subscription for {} already exists", url),
        Err(e) => Err(e.into()),
    }
}

async fn list_subscriptions(config: &Config, output: &str) -> Result<()> {
    let storage = open_storage(config).await?;
    let subscriptions = storage.subscriptions().list().await?;

    match output {
        "json" => println!("{}", serde_json::to_string_pretty(&subscriptions)?),
        _ => {
            println!(
                "\n{:<6} {:<24} {:<8} {:<16} {:<8} {:<6} {:<20}",
                "ID", "Name", "Kind", "Schedule", "Enabled", "Fails", "Next due"
            );
            println!("{}", "-".repeat(94));
            for sub in &subscriptions {
                println!(
                    "{:<6} {:<24} {:<8} {:<16} {:<8} {:<6} {:<20}",
                    sub.id,
                    truncate(&sub.name, 24),
                    truncate(&sub.kind, 8),
                    truncate(&sub.schedule, 16),
                    if sub.enabled { "yes" } else { "no" },
                    sub.consecutive_failures,
                    sub.next_due
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "now".to_string()),
                );
            }
            println!("\nTotal: {} subscriptions", subscriptions.len());
        }
    }

    Ok(())
}

async fn show_items(config: &Config, id: SubscriptionId, limit: u32) -> Result<()> {
    let storage = open_storage(config).await?;
    if storage.subscriptions().get(id).await?.is_none() {
        bail!(IngestionError::SubscriptionNotFound(id));
    }

    let items = storage.items().recent(id, limit).await?;
    for item in &items {
        println!(
            "{}  {}\n    {}",
            item.discovered_at.format("%Y-%m-%d %H:%M:%S"),
            item.title,
            item.url.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} items shown", items.len());
    Ok(())
}

async fn show_status(config: &Config, window: &str, threshold: u32, json: bool) -> Result<()> {
    let window = parse_since(window)?;
    let storage = open_storage(config).await?;
    let report = status(&storage.subscriptions(), &storage.items(), window, threshold, Utc::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\nContent Ingestion Status");
    println!("========================\n");
    println!(
        "Subscriptions: {} total, {} enabled",
        report.total_subscriptions, report.enabled_subscriptions
    );
    println!(
        "Items discovered since {}: {}",
        report.window_start.format("%Y-%m-%d %H:%M:%S UTC"),
        report.items_in_window
    );

    if report.failing.is_empty() {
        println!("\nNo failing subscriptions");
    } else {
        println!("\nFailing subscriptions:");
        for sub in &report.failing {
            println!(
                "  - [{}] {} ({} failures{}): {}",
                sub.id,
                sub.name,
                sub.consecutive_failures,
                if sub.enabled { "" } else { ", disabled" },
                sub.last_error.as_deref().unwrap_or("-")
            );
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}~")
    }
}
