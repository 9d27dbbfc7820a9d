use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acre_core::FieldList;
use acre_pipeline::{
    default_field_list, fetch_and_enrich, load_field_list, Cleaner, CleanerOptions, ConfigError,
    EnrichOptions, FetchOptions, WriteMode,
};
use acre_remote::{
    resolve_search_api_key, CredentialOverrides, Credentials, RecordSource, RemoteOptions,
    RestRecordSource, RestSearchApi, SearchApi, SearchOptions,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "acre")]
#[command(about = "Account fetch, enrichment and cleanup toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch accounts, enrich them via the search API, write or print the
    /// result table.
    Enrich {
        /// Search API key (falls back to SERPAPI_API_KEY).
        #[arg(long)]
        api_key: Option<String>,
        /// How many accounts to fetch (omit for no limit).
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 40)]
        chunk_size: usize,
        #[arg(long, default_value_t = 200)]
        id_batch_size: usize,
        /// Parallel fetch workers.
        #[arg(long, default_value_t = 5)]
        workers: usize,
        /// Parallel search workers.
        #[arg(long, default_value_t = 5)]
        serp_workers: usize,
        /// Minimum pause per search worker between calls, in seconds.
        #[arg(long, default_value_t = 0.2)]
        pause: f64,
        /// CSV output path; prints a summary when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
        /// YAML field catalog overriding the built-in account schema.
        #[arg(long)]
        fields: Option<PathBuf>,
    },
    /// Fetch, enrich, propose updates and (optionally) merge duplicates,
    /// writing a backup and a report. Dry-run unless --commit is given.
    Clean {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Backup directory for the pre-mutation snapshot.
        #[arg(long, default_value = "backups")]
        backup: PathBuf,
        /// Report output path.
        #[arg(long, default_value = "cleaner_report.json")]
        report: PathBuf,
        /// Parallel workers for update pushes.
        #[arg(long, default_value_t = 6)]
        workers: usize,
        #[arg(long, default_value_t = 5)]
        serp_workers: usize,
        /// Apply updates and deletions remotely (otherwise dry-run).
        #[arg(long)]
        commit: bool,
        /// Run the duplicate merge step after enrichment.
        #[arg(long)]
        merge: bool,
        #[arg(long)]
        fields: Option<PathBuf>,
    },
}

fn field_list_from(path: Option<&PathBuf>) -> Result<FieldList> {
    match path {
        Some(path) => load_field_list(path),
        None => Ok(default_field_list()),
    }
}

async fn connect_source() -> Result<Arc<dyn RecordSource>> {
    let credentials = Credentials::resolve(CredentialOverrides::default())
        .context("resolving record source credentials")?;
    let source = RestRecordSource::connect(credentials, RemoteOptions::default())
        .await
        .context("connecting to the record source")?;
    Ok(Arc::new(source))
}

fn build_search(api_key: Option<String>) -> Result<Arc<dyn SearchApi>> {
    let api_key = resolve_search_api_key(api_key).ok_or(ConfigError::MissingApiKey)?;
    let search = RestSearchApi::new(api_key, SearchOptions::default())
        .context("building the search client")?;
    Ok(Arc::new(search))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Enrich {
            api_key,
            limit,
            chunk_size,
            id_batch_size,
            workers,
            serp_workers,
            pause,
            output,
            fields,
        } => {
            let field_list = field_list_from(fields.as_ref())?;
            let search = build_search(api_key)?;
            let source = connect_source().await?;

            let result = fetch_and_enrich(
                source,
                search,
                &field_list,
                FetchOptions {
                    limit,
                    chunk_size,
                    id_batch_size,
                    workers,
                    ..FetchOptions::default()
                },
                EnrichOptions {
                    workers: serp_workers,
                    pause: Duration::from_secs_f64(pause.max(0.0)),
                    ..EnrichOptions::default()
                },
            )
            .await?;

            match output {
                Some(path) => {
                    acre_pipeline::report::write_table_csv(&path, &result.table)?;
                    info!(path = %path.display(), rows = result.table.row_count(), "enriched table written");
                }
                None => {
                    println!(
                        "enriched {} rows ({} columns): {} succeeded, {} not found, {} skipped, {} errors",
                        result.table.row_count(),
                        result.table.column_count(),
                        result.enrichment.counts.succeeded,
                        result.enrichment.counts.not_found,
                        result.enrichment.counts.skipped,
                        result.enrichment.counts.errors,
                    );
                }
            }
            if !result.chunk_failures.is_empty() {
                eprintln!(
                    "warning: {} chunk(s) failed permanently; their columns are null",
                    result.chunk_failures.len()
                );
            }
        }
        Commands::Clean {
            api_key,
            limit,
            backup,
            report,
            workers,
            serp_workers,
            commit,
            merge,
            fields,
        } => {
            let field_list = field_list_from(fields.as_ref())?;
            let search = build_search(api_key)?;
            let source = connect_source().await?;

            let cleaner = Cleaner::new(
                source,
                search,
                CleanerOptions {
                    fetch: FetchOptions {
                        limit,
                        ..FetchOptions::default()
                    },
                    enrich: EnrichOptions {
                        workers: serp_workers,
                        ..EnrichOptions::default()
                    },
                    update_workers: workers,
                    backup_dir: backup,
                    report_path: report,
                    mode: if commit {
                        WriteMode::Commit
                    } else {
                        WriteMode::DryRun
                    },
                    merge,
                },
            )?;

            let summary = cleaner.run(&field_list).await?;
            println!(
                "clean complete: run_id={} rows={} updates={} groups={} actions={} report={}",
                summary.run_id,
                summary.fetched_rows,
                summary.proposed_updates,
                summary.duplicate_groups,
                summary.planned_actions,
                summary.report_path.display(),
            );
        }
    }

    Ok(())
}
