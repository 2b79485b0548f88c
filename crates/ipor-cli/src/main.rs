use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use ipor_adapters::{ChittorgarhClient, IpoPremiumClient, StatusFilter};
use ipor_core::Category;
use ipor_storage::{HttpClientConfig, HttpFetcher};
use ipor_sync::{build_scheduler, BroadcastSink, SyncConfig, SyncEngine};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ipor-cli")]
#[command(about = "IPO offering reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync batch for a category/status pair.
    Sync {
        #[arg(long, default_value = "mainboard")]
        category: String,
        #[arg(long, default_value = "live")]
        status: String,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Serve the read API.
    Serve {
        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
    /// Apply database migrations.
    Migrate,
    /// Backfill missing ipo_details rows.
    Backfill,
}

async fn build_engine(config: &SyncConfig) -> Result<Arc<SyncEngine>> {
    let pool = ipor_storage::connect_pool(&config.database_url, 5).await?;
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);
    let primary = Arc::new(IpoPremiumClient::new(
        http.clone(),
        config.primary_base_url.clone(),
    ));
    let secondary = Arc::new(ChittorgarhClient::new(
        http,
        config.secondary_base_url.clone(),
    ));
    let sink = Arc::new(BroadcastSink::new(64));
    Ok(Arc::new(SyncEngine::new(
        pool,
        primary.clone(),
        secondary,
        primary,
        sink,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        category: "mainboard".to_string(),
        status: "live".to_string(),
    }) {
        Commands::Sync { category, status } => {
            let category =
                Category::parse(&category).ok_or_else(|| anyhow!("unknown category {category}"))?;
            let status =
                StatusFilter::parse(&status).ok_or_else(|| anyhow!("unknown status {status}"))?;
            let engine = build_engine(&config).await?;
            let outcome = engine.sync_batch(category, status).await;
            println!(
                "sync {}: run_id={} category={} status={} changed={}",
                outcome.status.as_str(),
                outcome.run_id,
                outcome.category,
                outcome.status_filter.as_str(),
                outcome.changed
            );
        }
        Commands::Schedule => {
            let engine = build_engine(&config).await?;
            let mut scheduler_config = config.clone();
            scheduler_config.scheduler_enabled = true;
            match build_scheduler(engine, &scheduler_config).await? {
                Some(mut scheduler) => {
                    scheduler.start().await?;
                    println!("scheduler running; press ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                    scheduler.shutdown().await?;
                }
                None => eprintln!("scheduler disabled by configuration"),
            }
        }
        Commands::Serve { port } => {
            let pool = ipor_storage::connect_pool(&config.database_url, 5).await?;
            ipor_web::serve(pool, port).await?;
        }
        Commands::Migrate => {
            let pool = ipor_storage::connect_pool(&config.database_url, 5).await?;
            ipor_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Backfill => {
            let pool = ipor_storage::connect_pool(&config.database_url, 5).await?;
            let inserted = ipor_storage::backfill_missing_details(&pool).await?;
            println!("backfilled {inserted} detail rows");
        }
    }

    Ok(())
}
