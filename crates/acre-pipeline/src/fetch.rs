//! Chunked-parallel fetch: field chunking, id batching, the bounded
//! worker-pool query executor and the result merger.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use acre_core::{FieldList, RecordId, ResultTable, TableError, ID_FIELD};
use acre_remote::{RecordSource, SourceError};
use acre_transport::{retry_with_backoff, BackoffPolicy};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::ConfigError;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Caller row limit; triggers the two-phase (ids first) fetch.
    pub limit: Option<usize>,
    pub chunk_size: usize,
    pub id_batch_size: usize,
    pub workers: usize,
    pub backoff: BackoffPolicy,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            limit: None,
            chunk_size: 40,
            id_batch_size: 200,
            workers: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Splits the field list into ordered chunks of at most `chunk_size`,
/// covering it exactly once. The identifier is projected separately into
/// every chunk by the executor.
pub fn chunk_fields(fields: &FieldList, chunk_size: usize) -> Result<Vec<Vec<String>>, ConfigError> {
    if chunk_size < 1 {
        return Err(ConfigError::ChunkSize(chunk_size));
    }
    Ok(fields
        .fields()
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Exact ordered partition of the id set into batches of at most
/// `batch_size`.
pub fn batch_ids(ids: &[RecordId], batch_size: usize) -> Result<Vec<Vec<RecordId>>, ConfigError> {
    if batch_size < 1 {
        return Err(ConfigError::IdBatchSize(batch_size));
    }
    Ok(ids.chunks(batch_size).map(|batch| batch.to_vec()).collect())
}

/// One unit of query work: a field subset, optionally restricted to an id
/// batch. Owned by the executor, destroyed once merged.
#[derive(Debug, Clone)]
struct QueryChunk {
    fields: Vec<String>,
    id_batch: Option<Vec<RecordId>>,
}

/// Rows returned by a single chunk query, tagged with the fields that
/// chunk covers (dropped invalid fields stay listed so their columns are
/// accounted for as null).
#[derive(Debug, Clone)]
pub struct PartialResult {
    pub fields: Vec<String>,
    pub rows: Vec<acre_remote::RecordRow>,
}

/// A chunk that failed permanently; its fields remain all-null in the
/// merged table.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub fields: Vec<String>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("duplicate record id {id} within one partial result")]
    DuplicateKey { id: RecordId },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listing record ids: {0}")]
    IdListing(SourceError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub table: ResultTable,
    pub failures: Vec<ChunkFailure>,
    pub queries_dispatched: usize,
}

/// Executes the (field-chunk × id-batch) query set against the source with
/// a fixed-size worker pool and merges the partials into one table.
pub struct FetchEngine {
    source: Arc<dyn RecordSource>,
    options: FetchOptions,
}

impl FetchEngine {
    pub fn new(source: Arc<dyn RecordSource>, options: FetchOptions) -> Result<Self, ConfigError> {
        if options.chunk_size < 1 {
            return Err(ConfigError::ChunkSize(options.chunk_size));
        }
        if options.id_batch_size < 1 {
            return Err(ConfigError::IdBatchSize(options.id_batch_size));
        }
        if options.workers < 1 {
            return Err(ConfigError::Workers(options.workers));
        }
        Ok(Self { source, options })
    }

    pub async fn run(&self, fields: &FieldList) -> Result<FetchOutcome, FetchError> {
        let chunks = chunk_fields(fields, self.options.chunk_size)?;

        // Two-phase fetch under a row limit: list ids once, then restrict
        // every chunk query to bounded membership filters.
        let id_batches = match self.options.limit {
            Some(limit) => {
                let rows = retry_with_backoff(&self.options.backoff, SourceError::is_transient, |_| {
                    self.source.query_records(&[], None, Some(limit))
                })
                .await
                .map_err(FetchError::IdListing)?;
                let ids: Vec<RecordId> = rows.into_iter().map(|row| row.id).collect();
                if ids.is_empty() {
                    return Ok(FetchOutcome {
                        table: ResultTable::new(fields),
                        failures: Vec::new(),
                        queries_dispatched: 0,
                    });
                }
                Some(batch_ids(&ids, self.options.id_batch_size)?)
            }
            None => None,
        };

        let mut tasks: VecDeque<QueryChunk> = VecDeque::new();
        match &id_batches {
            Some(batches) => {
                for batch in batches {
                    for chunk in &chunks {
                        tasks.push_back(QueryChunk {
                            fields: chunk.clone(),
                            id_batch: Some(batch.clone()),
                        });
                    }
                }
            }
            None => {
                for chunk in &chunks {
                    tasks.push_back(QueryChunk {
                        fields: chunk.clone(),
                        id_batch: None,
                    });
                }
            }
        }
        let queries_dispatched = tasks.len();
        debug!(
            chunks = chunks.len(),
            batches = id_batches.as_ref().map(|b| b.len()).unwrap_or(0),
            queries = queries_dispatched,
            "dispatching chunk queries"
        );

        // Fixed-size pool draining a shared queue; task counts in the
        // hundreds never exceed `workers` in-flight queries.
        let queue = Arc::new(Mutex::new(tasks));
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<PartialResult, ChunkFailure>>();
        let mut workers = JoinSet::new();
        let pool_size = self.options.workers.min(queries_dispatched.max(1));
        for _ in 0..pool_size {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let source = Arc::clone(&self.source);
            let backoff = self.options.backoff;
            workers.spawn(async move {
                loop {
                    let Some(task) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let result = execute_chunk(source.as_ref(), &backoff, task).await;
                    if tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut partials = Vec::new();
        let mut failures = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(partial) => partials.push(partial),
                Err(failure) => {
                    warn!(
                        fields = ?failure.fields,
                        message = failure.message.as_str(),
                        "chunk failed permanently; its columns stay null"
                    );
                    failures.push(failure);
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "fetch worker aborted");
            }
        }

        let mut table = merge_partials(fields, partials)?;
        if let Some(limit) = self.options.limit {
            table.truncate_to(limit);
        }
        Ok(FetchOutcome {
            table,
            failures,
            queries_dispatched,
        })
    }
}

async fn execute_chunk(
    source: &dyn RecordSource,
    backoff: &BackoffPolicy,
    task: QueryChunk,
) -> Result<PartialResult, ChunkFailure> {
    let outcome = retry_with_backoff(backoff, SourceError::is_transient, |_| {
        source.query_records(&task.fields, task.id_batch.as_deref(), None)
    })
    .await;

    match outcome {
        Ok(rows) => Ok(PartialResult {
            fields: task.fields,
            rows,
        }),
        Err(SourceError::InvalidField(message)) => {
            warn!(message = message.as_str(), "projection rejected; describing source to drop invalid fields");
            recover_invalid_fields(source, task).await
        }
        Err(err) => Err(ChunkFailure {
            fields: task.fields,
            message: err.to_string(),
        }),
    }
}

/// Invalid-field recovery: describe once, drop unknown fields from the
/// projection, retry exactly once. The chunk keeps claiming its original
/// fields so dropped columns merge as null.
async fn recover_invalid_fields(
    source: &dyn RecordSource,
    task: QueryChunk,
) -> Result<PartialResult, ChunkFailure> {
    let valid = match source.describe_field_names().await {
        Ok(valid) => valid,
        Err(err) => {
            return Err(ChunkFailure {
                fields: task.fields,
                message: format!("describe after invalid field failed: {err}"),
            });
        }
    };

    let (kept, dropped): (Vec<String>, Vec<String>) = task
        .fields
        .iter()
        .cloned()
        .partition(|field| valid.contains(field));
    if !dropped.is_empty() {
        warn!(?dropped, "dropping fields unknown to the source");
    }
    if kept.is_empty() {
        return Ok(PartialResult {
            fields: task.fields,
            rows: Vec::new(),
        });
    }

    match source
        .query_records(&kept, task.id_batch.as_deref(), None)
        .await
    {
        Ok(rows) => Ok(PartialResult {
            fields: task.fields,
            rows,
        }),
        Err(err) => Err(ChunkFailure {
            fields: task.fields,
            message: format!("retry after dropping {dropped:?} failed: {err}"),
        }),
    }
}

/// Outer-joins partials on the record id: union of all ids, each field
/// column filled by its single covering chunk. Arrival order is
/// irrelevant. Fails only on a duplicate id within one partial.
pub fn merge_partials(
    fields: &FieldList,
    partials: Vec<PartialResult>,
) -> Result<ResultTable, MergeError> {
    let mut table = ResultTable::new(fields);
    for partial in partials {
        let covered: HashSet<&str> = partial.fields.iter().map(String::as_str).collect();
        let mut seen: HashSet<RecordId> = HashSet::with_capacity(partial.rows.len());
        for row in partial.rows {
            if !seen.insert(row.id.clone()) {
                return Err(MergeError::DuplicateKey { id: row.id });
            }
            table.insert_row(row.id.clone());
            for (column, value) in row.cells {
                if column == ID_FIELD {
                    continue;
                }
                if covered.contains(column.as_str()) {
                    table.set_cell(&row.id, &column, value)?;
                }
            }
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use acre_remote::RecordRow;
    use async_trait::async_trait;
    use serde_json::Value;

    fn field_list(names: &[&str]) -> FieldList {
        FieldList::new(names.iter().map(|s| s.to_string()))
    }

    /// In-memory record source with injectable failures.
    struct MockSource {
        rows: Vec<(RecordId, BTreeMap<String, Value>)>,
        valid_fields: HashSet<String>,
        permanent_fail_fields: HashSet<String>,
        transient_failures: AtomicUsize,
        queries: AtomicUsize,
        describes: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockSource {
        fn new(rows: Vec<(RecordId, BTreeMap<String, Value>)>, valid: &[&str]) -> Self {
            Self {
                rows,
                valid_fields: valid.iter().map(|s| s.to_string()).collect(),
                permanent_fail_fields: HashSet::new(),
                transient_failures: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
                describes: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn make_rows(count: usize, fields: &[String]) -> Vec<(RecordId, BTreeMap<String, Value>)> {
            (0..count)
                .map(|i| {
                    let id = RecordId::new(format!("A{i:04}"));
                    let cells = fields
                        .iter()
                        .map(|f| (f.clone(), Value::String(format!("{f}-{i}"))))
                        .collect();
                    (id, cells)
                })
                .collect()
        }
    }

    #[async_trait]
    impl RecordSource for MockSource {
        async fn query_records(
            &self,
            fields: &[String],
            id_filter: Option<&[RecordId]>,
            limit: Option<usize>,
        ) -> Result<Vec<RecordRow>, SourceError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SourceError::Transient("simulated timeout".into()));
            }
            if fields.iter().any(|f| self.permanent_fail_fields.contains(f)) {
                return Err(SourceError::Permanent("simulated outage".into()));
            }
            if let Some(unknown) = fields.iter().find(|f| !self.valid_fields.contains(*f)) {
                return Err(SourceError::InvalidField(format!(
                    "No such column '{unknown}'"
                )));
            }

            let mut out = Vec::new();
            for (id, cells) in &self.rows {
                if let Some(filter) = id_filter {
                    if !filter.contains(id) {
                        continue;
                    }
                }
                let projected = fields
                    .iter()
                    .filter_map(|f| cells.get(f).map(|v| (f.clone(), v.clone())))
                    .collect();
                out.push(RecordRow {
                    id: id.clone(),
                    cells: projected,
                });
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            Ok(out)
        }

        async fn describe_field_names(&self) -> Result<HashSet<String>, SourceError> {
            self.describes.fetch_add(1, Ordering::SeqCst);
            Ok(self.valid_fields.clone())
        }

        async fn update_record(
            &self,
            _id: &RecordId,
            _patch: &BTreeMap<String, Value>,
        ) -> Result<(), SourceError> {
            Err(SourceError::Permanent("not supported in this mock".into()))
        }

        async fn reparent_children(
            &self,
            _from: &RecordId,
            _to: &RecordId,
        ) -> Result<u64, SourceError> {
            Err(SourceError::Permanent("not supported in this mock".into()))
        }

        async fn delete_record(&self, _id: &RecordId) -> Result<(), SourceError> {
            Err(SourceError::Permanent("not supported in this mock".into()))
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        }
    }

    #[test]
    fn chunking_reassembles_the_field_list_exactly() {
        let fields = field_list(&["A", "B", "C", "D", "E"]);
        let chunks = chunk_fields(&fields, 2).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 2));
        let flattened: Vec<String> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, fields.fields());
    }

    #[test]
    fn chunk_size_zero_is_a_config_error() {
        let fields = field_list(&["A"]);
        assert!(matches!(
            chunk_fields(&fields, 0),
            Err(ConfigError::ChunkSize(0))
        ));
    }

    #[test]
    fn id_batching_partitions_exactly() {
        let ids: Vec<RecordId> = (0..205).map(|i| RecordId::new(format!("A{i:04}"))).collect();
        let batches = batch_ids(&ids, 200).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 200);
        assert_eq!(batches[1].len(), 5);
        let mut union: Vec<RecordId> = batches.into_iter().flatten().collect();
        union.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(union, expected);
        assert!(matches!(batch_ids(&ids, 0), Err(ConfigError::IdBatchSize(0))));
    }

    #[test]
    fn merge_is_idempotent_under_reordering() {
        let fields = field_list(&["Name", "Website"]);
        let partial_a = PartialResult {
            fields: vec!["Name".to_string()],
            rows: vec![
                RecordRow {
                    id: RecordId::from("001"),
                    cells: [("Name".to_string(), Value::String("One".into()))].into(),
                },
                RecordRow {
                    id: RecordId::from("002"),
                    cells: [("Name".to_string(), Value::String("Two".into()))].into(),
                },
            ],
        };
        let partial_b = PartialResult {
            fields: vec!["Website".to_string()],
            rows: vec![RecordRow {
                id: RecordId::from("002"),
                cells: [("Website".to_string(), Value::String("https://two".into()))].into(),
            }],
        };

        let forward = merge_partials(&fields, vec![partial_a.clone(), partial_b.clone()]).unwrap();
        let reversed = merge_partials(&fields, vec![partial_b, partial_a]).unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(forward.row_count(), 2);
        assert!(forward
            .cell(&RecordId::from("001"), "Website")
            .is_null());
    }

    #[test]
    fn missing_partial_leaves_columns_null_not_rows_missing() {
        let fields = field_list(&["Name", "Website"]);
        let only_names = PartialResult {
            fields: vec!["Name".to_string()],
            rows: vec![RecordRow {
                id: RecordId::from("001"),
                cells: [("Name".to_string(), Value::String("One".into()))].into(),
            }],
        };
        let table = merge_partials(&fields, vec![only_names]).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.columns(), ["Id", "Name", "Website"]);
        assert!(table.cell(&RecordId::from("001"), "Website").is_null());
    }

    #[test]
    fn duplicate_id_within_one_partial_is_structural() {
        let fields = field_list(&["Name"]);
        let partial = PartialResult {
            fields: vec!["Name".to_string()],
            rows: vec![
                RecordRow {
                    id: RecordId::from("001"),
                    cells: BTreeMap::new(),
                },
                RecordRow {
                    id: RecordId::from("001"),
                    cells: BTreeMap::new(),
                },
            ],
        };
        assert!(matches!(
            merge_partials(&fields, vec![partial]),
            Err(MergeError::DuplicateKey { .. })
        ));
    }

    #[tokio::test]
    async fn limit_of_205_with_85_fields_dispatches_six_queries() {
        let names: Vec<String> = (0..85).map(|i| format!("F{i:02}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let rows = MockSource::make_rows(205, &names);
        let source = Arc::new(MockSource::new(rows, &name_refs));

        let engine = FetchEngine::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            FetchOptions {
                limit: Some(205),
                chunk_size: 40,
                id_batch_size: 200,
                workers: 5,
                backoff: fast_backoff(),
            },
        )
        .unwrap();

        let fields = FieldList::new(names.clone());
        let outcome = engine.run(&fields).await.unwrap();

        assert_eq!(outcome.queries_dispatched, 6);
        assert_eq!(outcome.table.row_count(), 205);
        assert_eq!(outcome.table.column_count(), 86);
        assert!(outcome.failures.is_empty());
        // id listing + 6 chunk queries
        assert_eq!(source.queries.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn worker_pool_never_exceeds_the_configured_bound() {
        let names: Vec<String> = (0..30).map(|i| format!("F{i:02}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let rows = MockSource::make_rows(10, &names);
        let source = Arc::new(MockSource::new(rows, &name_refs));

        let engine = FetchEngine::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            FetchOptions {
                limit: None,
                chunk_size: 1,
                id_batch_size: 200,
                workers: 3,
                backoff: fast_backoff(),
            },
        )
        .unwrap();

        let fields = FieldList::new(names);
        let outcome = engine.run(&fields).await.unwrap();
        assert_eq!(outcome.queries_dispatched, 30);
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn invalid_fields_are_described_away_and_merge_null() {
        let names = vec!["Name".to_string(), "Bogus__c".to_string()];
        let rows = MockSource::make_rows(3, &["Name".to_string()]);
        let source = Arc::new(MockSource::new(rows, &["Name"]));

        let engine = FetchEngine::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            FetchOptions {
                chunk_size: 40,
                backoff: fast_backoff(),
                ..FetchOptions::default()
            },
        )
        .unwrap();

        let fields = FieldList::new(names);
        let outcome = engine.run(&fields).await.unwrap();

        assert!(outcome.failures.is_empty());
        assert_eq!(source.describes.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.table.row_count(), 3);
        let first = RecordId::from("A0000");
        assert_eq!(
            outcome.table.cell_str(&first, "Name"),
            Some("Name-0")
        );
        assert!(outcome.table.cell(&first, "Bogus__c").is_null());
    }

    #[tokio::test]
    async fn one_failing_chunk_does_not_abort_its_siblings() {
        let names = vec!["Name".to_string(), "Cursed".to_string()];
        let mut source = MockSource::new(
            MockSource::make_rows(2, &["Name".to_string(), "Cursed".to_string()]),
            &["Name", "Cursed"],
        );
        source.permanent_fail_fields.insert("Cursed".to_string());
        let source = Arc::new(source);

        let engine = FetchEngine::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            FetchOptions {
                chunk_size: 1,
                backoff: fast_backoff(),
                ..FetchOptions::default()
            },
        )
        .unwrap();

        let fields = FieldList::new(names);
        let outcome = engine.run(&fields).await.unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].fields, ["Cursed"]);
        assert_eq!(outcome.table.row_count(), 2);
        let first = RecordId::from("A0000");
        assert_eq!(outcome.table.cell_str(&first, "Name"), Some("Name-0"));
        assert!(outcome.table.cell(&first, "Cursed").is_null());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let names = vec!["Name".to_string()];
        let mut source = MockSource::new(
            MockSource::make_rows(2, &names),
            &["Name"],
        );
        source.transient_failures = AtomicUsize::new(2);
        let source = Arc::new(source);

        let engine = FetchEngine::new(
            Arc::clone(&source) as Arc<dyn RecordSource>,
            FetchOptions {
                backoff: fast_backoff(),
                ..FetchOptions::default()
            },
        )
        .unwrap();

        let fields = FieldList::new(names);
        let outcome = engine.run(&fields).await.unwrap();
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.table.row_count(), 2);
    }
}
