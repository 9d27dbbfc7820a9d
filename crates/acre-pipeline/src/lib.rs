//! Fetch → enrich → dedupe pipeline engines and the thin orchestrator
//! that wires them into the `enrich` and `clean` flows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use acre_core::{FieldList, MergePlan, ResultTable};
use acre_remote::{RecordSource, SearchApi};
use acre_transport::SnapshotStore;
use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub mod dedupe;
pub mod enrich;
pub mod fetch;
pub mod report;

pub use dedupe::{
    apply_merge_plan, apply_updates, build_merge_plan, collect_updates, group_duplicates,
    ProposedUpdate, UpdateOutcome,
};
pub use enrich::{EnrichmentCounts, EnrichmentEngine, EnrichmentSummary, EnrichOptions};
pub use fetch::{
    batch_ids, chunk_fields, merge_partials, ChunkFailure, FetchEngine, FetchError, FetchOptions,
    FetchOutcome, MergeError, PartialResult,
};
pub use report::{BackupInfo, MergeSummary, RunReport};

pub const CRATE_NAME: &str = "acre-pipeline";

// Well-known columns of the account schema.
pub const NAME_FIELD: &str = "Name";
pub const WEBSITE_FIELD: &str = "Website";
pub const PHONE_FIELD: &str = "Phone";
pub const BILLING_CITY_FIELD: &str = "BillingCity";
pub const BILLING_COUNTRY_FIELD: &str = "BillingCountry";
pub const TYPE_FIELD: &str = "Type";
pub const INDUSTRY_FIELD: &str = "Industry";
pub const CATEGORY_FIELD: &str = "Category__c";

// Columns written by the enrichment stage.
pub const PLACE_ID_FIELD: &str = "Google_Place_ID__c";
pub const DATA_ID_FIELD: &str = "Google_Data_ID__c";
pub const SEARCH_TITLE_FIELD: &str = "Search_Title__c";
pub const SEARCH_LINK_FIELD: &str = "Search_Link__c";
pub const SEARCH_SNIPPET_FIELD: &str = "Search_Snippet__c";
pub const SEARCH_STATUS_FIELD: &str = "Search_Status__c";
pub const PLACE_UPDATED_FIELD: &str = "Google_Updated_Date__c";

/// Fields the cleaner pushes back to the source after enrichment.
pub const UPDATE_FIELDS: [&str; 5] = [
    PLACE_ID_FIELD,
    SEARCH_TITLE_FIELD,
    SEARCH_LINK_FIELD,
    SEARCH_SNIPPET_FIELD,
    PLACE_UPDATED_FIELD,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk size must be at least 1 (got {0})")]
    ChunkSize(usize),
    #[error("id batch size must be at least 1 (got {0})")]
    IdBatchSize(usize),
    #[error("worker count must be at least 1 (got {0})")]
    Workers(usize),
    #[error("search api key missing; pass --api-key or set SERPAPI_API_KEY")]
    MissingApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    DryRun,
    Commit,
}

impl WriteMode {
    pub fn is_commit(&self) -> bool {
        matches!(self, WriteMode::Commit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::DryRun => "dry-run",
            WriteMode::Commit => "commit",
        }
    }
}

/// The wide account schema fetched by default; callers can swap in their
/// own list from a YAML catalog file.
const DEFAULT_ACCOUNT_FIELDS: &[&str] = &[
    "Name",
    "AccountNumber",
    "Type",
    "Industry",
    "Category__c",
    "Description",
    "Website",
    "Phone",
    "Fax",
    "NumberOfEmployees",
    "AnnualRevenue",
    "OwnerId",
    "ParentId",
    "BillingStreet",
    "BillingCity",
    "BillingState",
    "BillingPostalCode",
    "BillingCountry",
    "ShippingStreet",
    "ShippingCity",
    "ShippingState",
    "ShippingPostalCode",
    "ShippingCountry",
    "CreatedDate",
    "LastModifiedDate",
    "LastActivityDate",
    "Rating",
    "Sic",
    "TickerSymbol",
    "Ownership",
    "Site",
    "CurrencyIsoCode",
    "IsCustomer__c",
    "Customer_Since__c",
    "Segment__c",
    "Sales_Region__c",
    "Delivery_Zone__c",
    "Contract_Status__c",
    "Payment_Terms__c",
    "Google_Place_ID__c",
    "Google_Data_ID__c",
    "Google_Rating__c",
    "Google_Review_Count__c",
    "Google_Price__c",
    "Google_Updated_Date__c",
    "Search_Title__c",
    "Search_Link__c",
    "Search_Snippet__c",
    "Search_Status__c",
];

pub fn default_field_list() -> FieldList {
    FieldList::new(DEFAULT_ACCOUNT_FIELDS.iter().map(|f| f.to_string()))
}

#[derive(Debug, Deserialize)]
struct FieldCatalogFile {
    fields: Vec<String>,
}

/// Loads a field catalog from YAML (`fields: [...]`), deduplicated and
/// order-preserving.
pub fn load_field_list(path: &Path) -> anyhow::Result<FieldList> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: FieldCatalogFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(FieldList::new(file.fields))
}

/// Everything the `enrich` flow produces.
#[derive(Debug)]
pub struct EnrichRunOutput {
    pub table: ResultTable,
    pub enrichment: EnrichmentSummary,
    pub chunk_failures: Vec<ChunkFailure>,
    pub queries_dispatched: usize,
}

/// Fetch + enrich convenience used by the `enrich` CLI command.
pub async fn fetch_and_enrich(
    source: Arc<dyn RecordSource>,
    search: Arc<dyn SearchApi>,
    fields: &FieldList,
    fetch_options: FetchOptions,
    enrich_options: EnrichOptions,
) -> anyhow::Result<EnrichRunOutput> {
    let engine = FetchEngine::new(source, fetch_options)?;
    let outcome = engine.run(fields).await?;
    let mut table = outcome.table;

    let enricher = EnrichmentEngine::new(search, enrich_options)?;
    let enrichment = enricher.run(&mut table).await;

    Ok(EnrichRunOutput {
        table,
        enrichment,
        chunk_failures: outcome.failures,
        queries_dispatched: outcome.queries_dispatched,
    })
}

#[derive(Debug, Clone)]
pub struct CleanerOptions {
    pub fetch: FetchOptions,
    pub enrich: EnrichOptions,
    pub update_workers: usize,
    pub backup_dir: PathBuf,
    pub report_path: PathBuf,
    pub mode: WriteMode,
    pub merge: bool,
}

impl Default for CleanerOptions {
    fn default() -> Self {
        Self {
            fetch: FetchOptions::default(),
            enrich: EnrichOptions::default(),
            update_workers: 6,
            backup_dir: PathBuf::from("backups"),
            report_path: PathBuf::from("cleaner_report.json"),
            mode: WriteMode::DryRun,
            merge: false,
        }
    }
}

#[derive(Debug)]
pub struct CleanerSummary {
    pub run_id: Uuid,
    pub fetched_rows: usize,
    pub proposed_updates: usize,
    pub duplicate_groups: usize,
    pub planned_actions: usize,
    pub report_path: PathBuf,
}

/// The `clean` flow: fetch → backup → enrich → push updates → optional
/// dedup merge, with the report always written. The backup snapshot lands
/// strictly before any remote mutation.
pub struct Cleaner {
    source: Arc<dyn RecordSource>,
    search: Arc<dyn SearchApi>,
    options: CleanerOptions,
}

impl Cleaner {
    pub fn new(
        source: Arc<dyn RecordSource>,
        search: Arc<dyn SearchApi>,
        options: CleanerOptions,
    ) -> Result<Self, ConfigError> {
        if options.update_workers < 1 {
            return Err(ConfigError::Workers(options.update_workers));
        }
        Ok(Self {
            source,
            search,
            options,
        })
    }

    pub async fn run(&self, fields: &FieldList) -> anyhow::Result<CleanerSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, mode = self.options.mode.as_str(), "cleaner run starting");

        let fetch_engine =
            FetchEngine::new(Arc::clone(&self.source), self.options.fetch.clone())?;
        let outcome = fetch_engine.run(fields).await?;
        let original = outcome.table;
        info!(
            rows = original.row_count(),
            failures = outcome.failures.len(),
            "fetch complete"
        );

        let mut backup = None;
        if !original.is_empty() {
            let store = SnapshotStore::new(&self.options.backup_dir);
            let bytes =
                serde_json::to_vec_pretty(&original).context("serializing backup snapshot")?;
            let stored = store.store_bytes("accounts", "json", &bytes).await?;
            info!(
                path = %stored.absolute_path.display(),
                deduplicated = stored.deduplicated,
                "backup snapshot written"
            );
            backup = Some(BackupInfo {
                path: stored.absolute_path.display().to_string(),
                sha256: stored.content_hash,
                bytes: stored.byte_size,
            });
        }

        let mut enriched = original.clone();
        let enricher =
            EnrichmentEngine::new(Arc::clone(&self.search), self.options.enrich.clone())?;
        let enrichment = enricher.run(&mut enriched).await;

        let updates = collect_updates(&original, &enriched, &UPDATE_FIELDS);
        info!(count = updates.len(), "enrichment updates collected");
        let update_outcomes = apply_updates(
            Arc::clone(&self.source),
            &updates,
            self.options.mode,
            self.options.update_workers,
        )
        .await?;

        let (groups, plan, audit) = if self.options.merge {
            // In commit mode the pushed updates change grouping, so read
            // the table back before planning.
            let basis = if self.options.mode.is_commit() {
                fetch_engine.run(fields).await?.table
            } else {
                enriched.clone()
            };
            let groups = group_duplicates(&basis);
            let plan = build_merge_plan(&groups);
            info!(
                groups = groups.len(),
                actions = plan.len(),
                "duplicate groups planned"
            );
            let audit = match self.options.mode {
                WriteMode::Commit => {
                    Some(apply_merge_plan(self.source.as_ref(), &plan, WriteMode::Commit).await)
                }
                WriteMode::DryRun => None,
            };
            (groups, plan, audit)
        } else {
            (Vec::new(), MergePlan::default(), None)
        };
        let duplicate_groups = groups.len();
        let planned_actions = plan.len();

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode: self.options.mode.as_str().to_string(),
            fetched_rows: original.row_count(),
            queries_dispatched: outcome.queries_dispatched,
            chunk_failures: outcome.failures,
            enrichment: enrichment.counts,
            enrichment_records: enrichment.records,
            proposed_updates: updates.len(),
            updates: update_outcomes,
            backup,
        };
        report::write_json(&self.options.report_path, &report).await?;
        let brief_path = self.options.report_path.with_extension("md");
        tokio::fs::write(&brief_path, report::render_run_brief(&report))
            .await
            .with_context(|| format!("writing {}", brief_path.display()))?;

        if self.options.merge {
            let summary_path = self.merge_summary_path();
            report::write_json(
                &summary_path,
                &MergeSummary {
                    run_id,
                    groups,
                    plan,
                    audit,
                },
            )
            .await?;
            info!(path = %summary_path.display(), "merge summary written");
        }

        info!(%run_id, "cleaner run finished");
        Ok(CleanerSummary {
            run_id,
            fetched_rows: report.fetched_rows,
            proposed_updates: report.proposed_updates,
            duplicate_groups,
            planned_actions,
            report_path: self.options.report_path.clone(),
        })
    }

    fn merge_summary_path(&self) -> PathBuf {
        match self.options.report_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("merge_summary.json"),
            _ => PathBuf::from("merge_summary.json"),
        }
    }
}
