use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealwatch_core::parse_id_list;
use dealwatch_refresh::{RefreshConfig, RefreshJob};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "dealwatch")]
#[command(about = "Marketplace discount watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the configured products once and persist them.
    Fetch {
        /// Comma-separated product ids; overrides DEALWATCH_PRODUCT_IDS.
        #[arg(long)]
        ids: Option<String>,
    },
    /// Run the recurring refresh job until interrupted.
    Watch,
    /// Serve the dashboard and JSON API.
    Serve,
    /// Dump the store as newline-delimited JSON.
    Export {
        #[arg(long, default_value = "discounts.jsonl")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = RefreshConfig::from_env();

    match cli.command.unwrap_or(Commands::Fetch { ids: None }) {
        Commands::Fetch { ids } => {
            if let Some(ids) = ids {
                config.product_ids = parse_id_list(&ids).context("parsing --ids")?;
            }
            let job = RefreshJob::from_config(config).await?;
            let summary = job.run_once().await.context("running refresh cycle")?;
            println!(
                "cycle complete: run_id={} fetched={} flagged={} notified={:?}",
                summary.run_id, summary.fetched, summary.flagged, summary.notified
            );
        }
        Commands::Watch => {
            let job = Arc::new(RefreshJob::from_config(config).await?);
            // One cycle up front; the scheduler waits a full interval before
            // its first tick.
            if let Err(err) = job.run_once().await {
                warn!(error = %err, "initial refresh cycle aborted");
            }
            let handle = Arc::clone(&job).start().await?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            handle.stop().await?;
        }
        Commands::Serve => {
            let job = Arc::new(RefreshJob::from_config(config).await?);
            dealwatch_web::serve(job).await?;
        }
        Commands::Export { out } => {
            let job = RefreshJob::from_config(config).await?;
            let records = job.store().all().await.context("reading discount store")?;
            let jsonl = dealwatch_core::to_jsonl(&records).context("serializing store")?;
            std::fs::write(&out, jsonl).with_context(|| format!("writing {}", out.display()))?;
            println!("exported {} records to {}", records.len(), out.display());
        }
    }

    Ok(())
}
