use anyhow::Result;
use clap::{Parser, Subcommand};
use mls_core::ResourceName;
use mls_sync::{CancelFlag, RunOptions, SyncMode};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mls-cli")]
#[command(about = "MLS feed synchronization command-line interface")]
struct Cli {
    /// Sync only the active-listing (IDX) stream.
    #[arg(long, conflicts_with_all = ["vow_only", "media_only"])]
    idx_only: bool,
    /// Sync only the closed-listing (VOW) stream.
    #[arg(long, conflicts_with = "media_only")]
    vow_only: bool,
    /// Sync only the media stream.
    #[arg(long)]
    media_only: bool,
    /// Continue from each resource's stored checkpoint instead of a full walk.
    #[arg(long)]
    incremental: bool,
    /// Abort the whole run on the first resource failure.
    #[arg(long)]
    fail_fast: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the embedded database migrations.
    Migrate,
    /// Print the stored per-resource checkpoints.
    Status,
}

fn selected_resources(cli: &Cli) -> Vec<ResourceName> {
    if cli.idx_only {
        vec![ResourceName::Idx]
    } else if cli.vow_only {
        vec![ResourceName::Vow]
    } else if cli.media_only {
        vec![ResourceName::Media]
    } else {
        ResourceName::ALL.to_vec()
    }
}

fn init_tracing() {
    let debug = std::env::var("DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Migrate) => {
            let config = mls_storage::DbConfig::from_env()?;
            let pool = mls_storage::create_pool(&config).await?;
            mls_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Some(Commands::Status) => {
            let config = mls_storage::DbConfig::from_env()?;
            let pool = mls_storage::create_pool(&config).await?;
            let store = mls_storage::CheckpointStore::new(pool);
            let rows = store.all().await?;
            if rows.is_empty() {
                println!("no checkpoints recorded yet");
            }
            for (resource, last_processed, updated_at) in rows {
                println!("{resource}: last processed {last_processed}, updated {updated_at}");
            }
        }
        None => {
            let options = RunOptions {
                resources: selected_resources(&cli),
                mode: if cli.incremental {
                    SyncMode::Incremental
                } else {
                    SyncMode::Full
                },
                fail_fast: cli.fail_fast,
            };

            let cancel = CancelFlag::new();
            let signal_flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing the current page before stopping");
                    signal_flag.cancel();
                }
            });

            let summary = mls_sync::run_sync_from_env(&options, &cancel).await?;
            for resource in &summary.resources {
                println!(
                    "{}: fetched={} unique={} upserted={} latest={}",
                    resource.resource,
                    resource.fetched,
                    resource.unique,
                    resource.upserted,
                    resource
                        .latest_ts
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            println!(
                "sync {}: run_id={} resources={} failures={}",
                if summary.cancelled { "cancelled" } else { "complete" },
                summary.run_id,
                summary.resources.len(),
                summary.failures
            );
        }
    }

    Ok(())
}
