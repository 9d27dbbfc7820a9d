//! Core domain model for ACRE: record identity, field lists, the merged
//! result table, enrichment outcomes and dedup merge plans.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "acre-core";

/// Identifier column present in every projection and every table.
pub const ID_FIELD: &str = "Id";

/// Opaque unique key naming one remote record; join key for all merges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Ordered, deduplicated field names. The identifier field is never a
/// member; it is implicitly projected into every chunk and every table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldList {
    fields: Vec<String>,
}

impl FieldList {
    pub fn new(fields: impl IntoIterator<Item = String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let fields = fields
            .into_iter()
            .filter(|f| f != ID_FIELD && !f.is_empty() && seen.insert(f.clone()))
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unknown column {0}")]
    UnknownColumn(String),
}

static NULL_CELL: Value = Value::Null;

/// Row-per-record, column-per-field table. Missing cells are an explicit
/// `Value::Null`, never absent. Rows are keyed by [`RecordId`] in a sorted
/// map so iteration and serialization are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultTable {
    columns: Vec<String>,
    rows: BTreeMap<RecordId, BTreeMap<String, Value>>,
}

impl ResultTable {
    /// Empty table whose columns are the identifier followed by `fields`
    /// in their original order.
    pub fn new(fields: &FieldList) -> Self {
        let mut columns = Vec::with_capacity(fields.len() + 1);
        columns.push(ID_FIELD.to_string());
        columns.extend(fields.fields().iter().cloned());
        Self {
            columns,
            rows: BTreeMap::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains_record(&self, id: &RecordId) -> bool {
        self.rows.contains_key(id)
    }

    pub fn record_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.rows.keys()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&RecordId, &BTreeMap<String, Value>)> {
        self.rows.iter()
    }

    /// Inserts an all-null row for `id` if not already present.
    pub fn insert_row(&mut self, id: RecordId) {
        let columns = &self.columns;
        self.rows.entry(id.clone()).or_insert_with(|| {
            let mut row: BTreeMap<String, Value> = columns
                .iter()
                .map(|c| (c.clone(), Value::Null))
                .collect();
            row.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            row
        });
    }

    pub fn set_cell(&mut self, id: &RecordId, column: &str, value: Value) -> Result<(), TableError> {
        if !self.columns.iter().any(|c| c == column) {
            return Err(TableError::UnknownColumn(column.to_string()));
        }
        self.insert_row(id.clone());
        if let Some(row) = self.rows.get_mut(id) {
            row.insert(column.to_string(), value);
        }
        Ok(())
    }

    pub fn cell(&self, id: &RecordId, column: &str) -> &Value {
        self.rows
            .get(id)
            .and_then(|row| row.get(column))
            .unwrap_or(&NULL_CELL)
    }

    /// Non-empty string content of a cell, if any.
    pub fn cell_str(&self, id: &RecordId, column: &str) -> Option<&str> {
        match self.cell(id, column) {
            Value::String(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Appends a column (all cells null) unless it already exists.
    pub fn add_column(&mut self, column: &str) {
        if self.columns.iter().any(|c| c == column) {
            return;
        }
        self.columns.push(column.to_string());
        for row in self.rows.values_mut() {
            row.insert(column.to_string(), Value::Null);
        }
    }

    /// Number of populated cells in a row (identifier excluded).
    pub fn non_null_count(&self, id: &RecordId) -> usize {
        self.rows
            .get(id)
            .map(|row| {
                row.iter()
                    .filter(|(column, value)| {
                        column.as_str() != ID_FIELD
                            && !value.is_null()
                            && value.as_str().map(|s| !s.is_empty()).unwrap_or(true)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Keeps the `limit` lowest record ids, dropping the rest.
    pub fn truncate_to(&mut self, limit: usize) {
        if self.rows.len() <= limit {
            return;
        }
        let cutoff: Vec<RecordId> = self.rows.keys().skip(limit).cloned().collect();
        for id in cutoff {
            self.rows.remove(&id);
        }
    }
}

/// Per-record outcome of one external search lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Success,
    NotFound,
    Skipped,
    Error,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Success => "success",
            EnrichmentStatus::NotFound => "not_found",
            EnrichmentStatus::Skipped => "skipped",
            EnrichmentStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub record_id: RecordId,
    pub status: EnrichmentStatus,
    pub title: Option<String>,
    pub link: Option<String>,
    pub snippet: Option<String>,
    pub place_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Records sharing one external place identifier. Exactly one survivor;
/// the duplicates are reparented into it and deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub place_id: String,
    pub survivor: RecordId,
    pub duplicates: Vec<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MergeAction {
    Reparent { source: RecordId, target: RecordId },
    Delete { source: RecordId },
}

impl MergeAction {
    pub fn source(&self) -> &RecordId {
        match self {
            MergeAction::Reparent { source, .. } | MergeAction::Delete { source } => source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub place_id: String,
    #[serde(flatten)]
    pub action: MergeAction,
}

/// Ordered reparent/delete actions derived from duplicate groups.
/// Immutable once computed; consumed once by the apply step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MergePlan {
    entries: Vec<PlannedAction>,
}

impl MergePlan {
    pub fn new(entries: Vec<PlannedAction>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PlannedAction] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    DryRun,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub place_id: String,
    #[serde(flatten)]
    pub action: MergeAction,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

/// Every attempted (or dry-run) merge action and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MergeAudit {
    pub entries: Vec<AuditEntry>,
}

impl MergeAudit {
    pub fn applied(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, ActionOutcome::Applied))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, ActionOutcome::Failed { .. }))
            .count()
    }
}
