use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hitledger_common::Config;
use hitledger_engine::{
    ingest_with_recovery, BatchIngestor, ConsolidationReport, Consolidator, RecoveryOutcome,
};
use hitledger_store::{bootstrap, Bootstrap, KindRegistry, PgStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod input;

#[derive(Parser)]
#[command(name = "hitledger", about = "Hit ingestion and resource consolidation")]
#[command(version)]
struct Cli {
    /// Postgres connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending schema migrations
    Migrate,

    /// Purge duplicate hits and create the request id and URL lookup indexes
    Bootstrap,

    /// Merge resources that share a URL
    Consolidate {
        /// Only merge these URLs (repeatable); defaults to every duplicate group
        #[arg(long = "key")]
        keys: Vec<String>,
    },

    /// Ingest hits from a JSON-lines file
    Ingest {
        /// Path to the JSON-lines file, one hit per line
        #[arg(long)]
        file: PathBuf,

        /// Rows per batch
        #[arg(long, default_value_t = 500)]
        batch_size: usize,

        /// Consolidate and retry once when a batch hits duplicate resources
        #[arg(long)]
        recover: bool,
    },

    /// Delete all but the earliest hit for each repeated request id
    PurgeDuplicateHits,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hitledger=info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("{e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_lookup(|key| match key {
        "DATABASE_URL" => cli.database_url.clone(),
        _ => std::env::var(key).ok(),
    })?;
    config.log_redacted();

    let store = PgStore::connect(&config.database_url, config.max_db_connections)
        .await
        .context("Failed to connect to Postgres")?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            info!("Migrations complete");
        }
        Commands::Bootstrap => {
            let report = bootstrap::run(&store).await?;
            info!(
                duplicate_hits_removed = report.duplicate_hits_removed,
                request_id_index_created = report.request_id_index_created,
                resource_lookup_index_created = report.resource_lookup_index_created,
                "Bootstrap complete"
            );
        }
        Commands::Consolidate { keys } => {
            let registry = KindRegistry::from_config(&config)?;
            let consolidator = Consolidator::new(store, registry);
            let report = if keys.is_empty() {
                consolidator.consolidate().await?
            } else {
                consolidator.consolidate_keys(&keys).await
            };
            ensure_clean(&report)?;
        }
        Commands::Ingest {
            file,
            batch_size,
            recover,
        } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let batches = input::parse_batches(&contents, batch_size)?;
            info!(batches = batches.len(), file = %file.display(), "Ingesting");

            let registry = KindRegistry::from_config(&config)?;
            let ingestor = BatchIngestor::from_config(store.clone(), &config);
            let consolidator = Consolidator::new(store, registry);

            let mut persisted = 0;
            let mut failed_batches = 0;
            for (n, batch) in batches.iter().enumerate() {
                if recover {
                    match ingest_with_recovery(&ingestor, &consolidator, batch).await {
                        Ok(outcome) => {
                            if let RecoveryOutcome::Recovered { consolidation, .. } = &outcome {
                                info!(
                                    batch = n,
                                    groups_merged = consolidation.groups_merged,
                                    "Batch recovered"
                                );
                            }
                            persisted += outcome.total_persisted();
                        }
                        Err(e) => {
                            warn!(batch = n, error = %e, "Batch failed");
                            failed_batches += 1;
                        }
                    }
                } else {
                    match ingestor.save_batch(batch).await {
                        Ok(report) => persisted += report.persisted,
                        Err(failure) => {
                            warn!(batch = n, error = %failure, "Batch failed");
                            persisted += failure.persisted;
                            failed_batches += 1;
                        }
                    }
                }
            }

            info!(persisted, failed_batches, "Ingest complete");
            if failed_batches > 0 {
                bail!("{failed_batches} of {} batches had failing rows", batches.len());
            }
        }
        Commands::PurgeDuplicateHits => {
            let removed = store.purge_duplicate_hits().await?;
            println!("{}", serde_json::json!({ "duplicate_hits_removed": removed }));
        }
    }

    Ok(())
}

fn ensure_clean(report: &ConsolidationReport) -> Result<()> {
    println!(
        "{}",
        serde_json::json!({
            "groups_found": report.groups_found,
            "groups_merged": report.groups_merged,
            "groups_already_consolidated": report.groups_already_consolidated,
            "resources_removed": report.resources_removed,
            "references_rewritten": report.references_rewritten,
            "merges": report.merges,
        })
    );

    for failure in &report.failures {
        warn!(logical_key = %failure.logical_key, error = %failure.cause, "Group not merged");
    }
    if !report.is_clean() {
        bail!("{} duplicate groups could not be merged", report.failures.len());
    }
    Ok(())
}
