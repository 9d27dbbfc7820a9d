//! Run reports and persisted outputs: report JSON, merge summary, CSV
//! table export and a short markdown brief.

use std::path::Path;

use acre_core::{DuplicateGroup, EnrichmentRecord, MergeAudit, MergePlan, ResultTable};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::dedupe::UpdateOutcome;
use crate::enrich::EnrichmentCounts;
use crate::fetch::ChunkFailure;

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
}

/// Per-run outcome enumeration: every attempted unit and how it ended.
/// Written even under partial failure.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: String,
    pub fetched_rows: usize,
    pub queries_dispatched: usize,
    pub chunk_failures: Vec<ChunkFailure>,
    pub enrichment: EnrichmentCounts,
    pub enrichment_records: Vec<EnrichmentRecord>,
    pub proposed_updates: usize,
    pub updates: Vec<UpdateOutcome>,
    pub backup: Option<BackupInfo>,
}

#[derive(Debug, Serialize)]
pub struct MergeSummary {
    pub run_id: Uuid,
    pub groups: Vec<DuplicateGroup>,
    pub plan: MergePlan,
    pub audit: Option<MergeAudit>,
}

pub async fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing report json")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn cell_to_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Flat CSV export of a result table, columns in table order, rows in id
/// order.
pub fn write_table_csv(path: &Path, table: &ResultTable) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    writer
        .write_record(table.columns())
        .context("writing csv header")?;
    for (_, row) in table.rows() {
        let record: Vec<String> = table
            .columns()
            .iter()
            .map(|column| cell_to_string(row.get(column)))
            .collect();
        writer.write_record(&record).context("writing csv row")?;
    }
    writer.flush().context("flushing csv")?;
    Ok(())
}

pub fn render_run_brief(report: &RunReport) -> String {
    format!(
        "# Cleaner Run Brief\n\n- Run ID: `{}`\n- Mode: {}\n- Started: {}\n- Finished: {}\n- Fetched rows: {}\n- Queries dispatched: {}\n- Chunk failures: {}\n- Enrichment: {} attempted / {} succeeded / {} not found / {} skipped / {} errors\n- Proposed updates: {}\n",
        report.run_id,
        report.mode,
        report.started_at,
        report.finished_at,
        report.fetched_rows,
        report.queries_dispatched,
        report.chunk_failures.len(),
        report.enrichment.attempted,
        report.enrichment.succeeded,
        report.enrichment.not_found,
        report.enrichment.skipped,
        report.enrichment.errors,
        report.proposed_updates,
    )
}
