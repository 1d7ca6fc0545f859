use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_core::RepriceSuggestion;
use pricewatch_storage::RecordStore;
use pricewatch_sync::{
    import_watchlist, load_watchlist, monitor_from_config, MonitorConfig, PriceMonitor, Scheduler,
};
use pricewatch_web::AppState;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Competitor price monitor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check every product that has competitors.
    Sweep,
    /// Check one product now.
    CheckProduct {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        product: Uuid,
    },
    /// Check all of one user's products.
    CheckUser {
        #[arg(long)]
        user: Uuid,
    },
    /// Send daily digests.
    Digest,
    /// Print repricing suggestions, for one product or for every product.
    Suggest {
        #[arg(long, requires = "product")]
        user: Option<Uuid>,
        #[arg(long, requires = "user")]
        product: Option<Uuid>,
    },
    /// Fetch one listing price without recording it.
    Probe { url: String },
    /// Import users, products and competitors from a YAML watchlist.
    Seed { path: PathBuf },
    /// Delete price history past the retention window.
    Expire,
    /// Serve the HTTP trigger surface.
    Serve,
    /// Run the scheduler and the HTTP surface together.
    Daemon,
}

#[derive(Debug, Serialize)]
struct SuggestionLine {
    user_email: String,
    product_id: Uuid,
    product_name: String,
    #[serde(flatten)]
    suggestion: RepriceSuggestion,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn suggest_all(monitor: &PriceMonitor) -> Result<Vec<SuggestionLine>> {
    let mut lines = Vec::new();
    for user in monitor.store().list_users().await? {
        for product in monitor.store().list_products_for_user(user.id).await? {
            let suggestion = monitor.suggest(user.id, product.id).await?;
            lines.push(SuggestionLine {
                user_email: user.email.clone(),
                product_id: product.id,
                product_name: product.name,
                suggestion,
            });
        }
    }
    Ok(lines)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pricewatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();
    let monitor = monitor_from_config(&config).await?;

    match cli.command.unwrap_or(Commands::Sweep) {
        Commands::Sweep => {
            let summary = monitor.run_full_sweep().await?;
            print_json(&summary)?;
        }
        Commands::CheckProduct { user, product } => {
            print_json(&monitor.check_product(user, product).await?)?;
        }
        Commands::CheckUser { user } => {
            print_json(&monitor.check_user_products(user).await?)?;
        }
        Commands::Digest => {
            print_json(&monitor.run_daily_digest().await?)?;
        }
        Commands::Suggest {
            user: Some(user),
            product: Some(product),
        } => {
            print_json(&monitor.suggest(user, product).await?)?;
        }
        Commands::Suggest { .. } => {
            print_json(&suggest_all(&monitor).await?)?;
        }
        Commands::Probe { url } => {
            print_json(&monitor.probe(&url).await?)?;
        }
        Commands::Seed { path } => {
            let watchlist = load_watchlist(&path).await?;
            let summary = import_watchlist(monitor.store().as_ref(), &watchlist).await?;
            print_json(&summary)?;
        }
        Commands::Expire => {
            let removed = monitor.purge_expired_history().await?;
            println!("expired {removed} price history rows");
        }
        Commands::Serve => {
            pricewatch_web::serve(AppState::new(Arc::new(monitor)), config.web_port).await?;
        }
        Commands::Daemon => {
            let monitor = Arc::new(monitor);
            let _scheduler = if config.scheduler_enabled {
                Some(
                    Scheduler::from_config(Arc::clone(&monitor), &config)
                        .start()
                        .await?,
                )
            } else {
                tracing::info!("scheduler disabled");
                None
            };
            tokio::select! {
                served = pricewatch_web::serve(AppState::new(monitor), config.web_port) => served?,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for shutdown signal")?;
                    tracing::info!("shutting down");
                }
            }
        }
    }

    Ok(())
}
