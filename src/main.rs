//! orderbus - Main Entry Point
//!
//! `consume` runs the self-healing consumer until SIGINT/SIGTERM, `publish`
//! sends one order-created event with confirmation, `config` validates and
//! optionally prints the effective configuration.

use chrono::Utc;
use clap::{Parser, Subcommand};
use orderbus::config::RelayConfig;
use orderbus::consumer::{ConsumerLoop, MessageHandler};
use orderbus::error::{RelayError, RelayResult};
use orderbus::notify::HttpStatusNotifier;
use orderbus::observability::{init_logging_with_verbosity, metrics};
use orderbus::protocol::OrderDraft;
use orderbus::transport::{AmqpConnector, ConnectionManager, OrderPublisher};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// At-least-once order event delivery over AMQP
#[derive(Parser)]
#[command(name = "orderbus")]
#[command(about = "Publish and consume order-created events over AMQP")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ORDERBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume order events until stopped
    Consume,
    /// Publish one order-created event
    Publish {
        /// Order id; a random one when omitted
        #[arg(long)]
        order_id: Option<String>,
        #[arg(long)]
        customer_id: String,
        #[arg(long)]
        total: f64,
        /// Product name, repeat for several
        #[arg(long = "product", required = true)]
        products: Vec<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_logging_with_verbosity(cli.verbose);

    info!("Starting orderbus v{}", env!("CARGO_PKG_VERSION"));

    let config = match RelayConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Failed to load configuration: {}",
                orderbus::error::sanitize_error_message(&e.to_string())
            );
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Consume => run_consumer(config).await,
        Commands::Publish {
            order_id,
            customer_id,
            total,
            products,
        } => {
            let draft = OrderDraft {
                customer_id,
                products,
                total_amount: total,
            };
            publish_order(config, order_id, draft).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        if e.is_fatal() {
            error!("Fatal error, cannot continue: {}", e.sanitized());
        } else {
            error!("Command failed: {}", e.sanitized());
        }
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn build_manager(config: &RelayConfig) -> RelayResult<ConnectionManager> {
    let address = config.broker_address()?;
    let profile = config.connection_profile()?;
    info!(
        broker = %address,
        environment = %profile.environment,
        heartbeat_secs = profile.heartbeat.as_secs(),
        tls = profile.use_tls,
        "Resolved broker connection profile"
    );

    Ok(ConnectionManager::new(
        Arc::new(AmqpConnector::new()),
        address,
        profile,
        config.queue(),
    )
    .with_retry_policy(config.connection_retry_policy()))
}

async fn run_consumer(config: RelayConfig) -> RelayResult<()> {
    let manager = build_manager(&config)?;
    let notifier = HttpStatusNotifier::new(
        &config.downstream.orders_service_url,
        config.notify_timeout(),
    )?;
    let handler = MessageHandler::new(Arc::new(notifier), config.notify_timeout());
    let consumer = ConsumerLoop::new(manager, handler)
        .with_reconnect_schedule(config.reconnect_schedule())
        .with_consumer_tag(config.consumer.consumer_tag.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| RelayError::internal_error(format!("SIGINT handler: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| RelayError::internal_error(format!("SIGTERM handler: {e}")))?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = shutdown_tx.send(true);
    });

    consumer.run(shutdown_rx).await?;

    let snapshot = metrics().snapshot();
    info!(
        received = snapshot.consumer.messages_received,
        acked = snapshot.consumer.messages_acked,
        discarded = snapshot.consumer.messages_discarded,
        requeued = snapshot.consumer.messages_requeued,
        reconnects = snapshot.consumer.reconnects,
        "Consumer stopped"
    );
    Ok(())
}

async fn publish_order(
    config: RelayConfig,
    order_id: Option<String>,
    draft: OrderDraft,
) -> RelayResult<()> {
    let publisher =
        OrderPublisher::new(build_manager(&config)?).with_retry_policy(config.publish_retry_policy());
    let order_id = order_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let report = publisher
        .publish_order_created(&order_id, &draft, Utc::now())
        .await?;

    if report.is_degraded() {
        warn!(order_id = %report.order_id, "Order event was not confirmed");
        return Err(RelayError::publish_degraded(report.order_id, report.outcome));
    }

    println!(
        "{}",
        serde_json::json!({
            "order_id": report.order_id,
            "outcome": report.outcome.to_string(),
            "attempts": report.attempts,
        })
    );
    Ok(())
}

fn handle_config_command(config: &RelayConfig, show: bool) -> RelayResult<()> {
    if show {
        let rendered = toml::to_string_pretty(&config.redacted())
            .map_err(|e| RelayError::internal_error(e.to_string()))?;
        println!("Current configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
