//! Rate-limited external search enrichment: record selection, query
//! construction, bounded workers with retry/backoff, column append.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acre_core::{EnrichmentRecord, EnrichmentStatus, RecordId, ResultTable};
use acre_remote::{SearchApi, SearchError, SearchQuery};
use acre_transport::{retry_with_backoff, BackoffPolicy, TokenBucket, TokenBucketConfig};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    ConfigError, BILLING_CITY_FIELD, BILLING_COUNTRY_FIELD, CATEGORY_FIELD, DATA_ID_FIELD,
    INDUSTRY_FIELD, NAME_FIELD, PHONE_FIELD, PLACE_ID_FIELD, PLACE_UPDATED_FIELD,
    SEARCH_LINK_FIELD, SEARCH_SNIPPET_FIELD, SEARCH_STATUS_FIELD, SEARCH_TITLE_FIELD,
    TYPE_FIELD, WEBSITE_FIELD,
};

#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub workers: usize,
    /// Minimum pause per worker between consecutive calls.
    pub pause: Duration,
    pub backoff: BackoffPolicy,
    /// Optional shared rate budget across all workers.
    pub rate: Option<TokenBucketConfig>,
    /// Records whose type/category/name contains one of these markers are
    /// never looked up.
    pub exclusion_markers: Vec<String>,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            workers: 5,
            pause: Duration::from_millis(200),
            backoff: BackoffPolicy::default(),
            rate: None,
            exclusion_markers: vec!["hotel".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub not_found: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct EnrichmentSummary {
    pub records: Vec<EnrichmentRecord>,
    pub counts: EnrichmentCounts,
}

struct SearchTask {
    id: RecordId,
    query: SearchQuery,
}

/// Looks up every selected record against the search API and appends the
/// extracted columns to the table, one row per record id.
pub struct EnrichmentEngine {
    api: Arc<dyn SearchApi>,
    options: EnrichOptions,
}

impl EnrichmentEngine {
    pub fn new(api: Arc<dyn SearchApi>, options: EnrichOptions) -> Result<Self, ConfigError> {
        if options.workers < 1 {
            return Err(ConfigError::Workers(options.workers));
        }
        Ok(Self { api, options })
    }

    pub async fn run(&self, table: &mut ResultTable) -> EnrichmentSummary {
        for column in [
            PLACE_ID_FIELD,
            SEARCH_TITLE_FIELD,
            SEARCH_LINK_FIELD,
            SEARCH_SNIPPET_FIELD,
            PLACE_UPDATED_FIELD,
            SEARCH_STATUS_FIELD,
        ] {
            table.add_column(column);
        }

        let ids: Vec<RecordId> = table.record_ids().cloned().collect();
        let mut records: Vec<EnrichmentRecord> = Vec::new();
        let mut tasks: VecDeque<SearchTask> = VecDeque::new();
        for id in ids {
            if !self.should_enrich(table, &id) {
                records.push(skipped_record(id));
                continue;
            }
            match build_search_query(table, &id) {
                Some(query) => tasks.push_back(SearchTask { id, query }),
                None => {
                    debug!(record = %id, "no constructible search query; skipping");
                    records.push(skipped_record(id));
                }
            }
        }

        let attempted = tasks.len();
        info!(
            rows = table.row_count(),
            attempted,
            skipped = records.len(),
            "starting enrichment"
        );

        let bucket = self
            .options
            .rate
            .map(|config| Arc::new(TokenBucket::new(config)));
        let queue = Arc::new(Mutex::new(tasks));
        let (tx, mut rx) = mpsc::unbounded_channel::<EnrichmentRecord>();
        let mut workers = JoinSet::new();
        let pool_size = self.options.workers.min(attempted.max(1));
        for _ in 0..pool_size {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let api = Arc::clone(&self.api);
            let bucket = bucket.clone();
            let backoff = self.options.backoff;
            let pause = self.options.pause;
            workers.spawn(async move {
                loop {
                    let Some(task) = queue.lock().await.pop_front() else {
                        break;
                    };
                    if let Some(bucket) = &bucket {
                        bucket.take().await;
                    }
                    let record = lookup_one(api.as_ref(), &backoff, task).await;
                    if tx.send(record).is_err() {
                        break;
                    }
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
            });
        }
        drop(tx);

        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "enrichment worker aborted");
            }
        }

        let mut counts = EnrichmentCounts {
            attempted,
            ..EnrichmentCounts::default()
        };
        for record in &records {
            match record.status {
                EnrichmentStatus::Success => counts.succeeded += 1,
                EnrichmentStatus::NotFound => counts.not_found += 1,
                EnrichmentStatus::Skipped => counts.skipped += 1,
                EnrichmentStatus::Error => counts.errors += 1,
            }
            apply_record(table, record);
        }
        info!(
            succeeded = counts.succeeded,
            not_found = counts.not_found,
            skipped = counts.skipped,
            errors = counts.errors,
            "enrichment complete"
        );

        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        EnrichmentSummary { records, counts }
    }

    fn should_enrich(&self, table: &ResultTable, id: &RecordId) -> bool {
        if table.cell_str(id, PLACE_ID_FIELD).is_some()
            || table.cell_str(id, DATA_ID_FIELD).is_some()
        {
            return false;
        }
        for column in [CATEGORY_FIELD, TYPE_FIELD, INDUSTRY_FIELD, NAME_FIELD] {
            if let Some(text) = table.cell_str(id, column) {
                let lowered = text.to_ascii_lowercase();
                if self
                    .options
                    .exclusion_markers
                    .iter()
                    .any(|marker| lowered.contains(marker.as_str()))
                {
                    return false;
                }
            }
        }
        true
    }
}

fn skipped_record(id: RecordId) -> EnrichmentRecord {
    EnrichmentRecord {
        record_id: id,
        status: EnrichmentStatus::Skipped,
        title: None,
        link: None,
        snippet: None,
        place_id: None,
        updated_at: Utc::now(),
        attempts: 0,
        error: None,
    }
}

/// Query ladder: an existing place id wins, then the website, then a
/// name + locality composite. `None` means nothing usable to search for.
pub fn build_search_query(table: &ResultTable, id: &RecordId) -> Option<SearchQuery> {
    for column in [PLACE_ID_FIELD, DATA_ID_FIELD] {
        if let Some(place_id) = table.cell_str(id, column) {
            return Some(SearchQuery::for_place_id(place_id));
        }
    }

    let locality = {
        let parts: Vec<&str> = [BILLING_CITY_FIELD, BILLING_COUNTRY_FIELD]
            .iter()
            .filter_map(|c| table.cell_str(id, c))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    };

    if let Some(website) = table.cell_str(id, WEBSITE_FIELD) {
        return Some(SearchQuery::for_text(website, locality));
    }

    let name = table.cell_str(id, NAME_FIELD)?;
    let mut parts = vec![name];
    for column in [BILLING_CITY_FIELD, BILLING_COUNTRY_FIELD, PHONE_FIELD] {
        if let Some(value) = table.cell_str(id, column) {
            parts.push(value);
        }
    }
    Some(SearchQuery::for_text(parts.join(" "), locality))
}

async fn lookup_one(
    api: &dyn SearchApi,
    backoff: &BackoffPolicy,
    task: SearchTask,
) -> EnrichmentRecord {
    let attempts = AtomicU32::new(0);
    let outcome = retry_with_backoff(backoff, SearchError::is_transient, |attempt| {
        attempts.store(attempt + 1, Ordering::Relaxed);
        api.lookup(&task.query)
    })
    .await;
    let attempts = attempts.load(Ordering::Relaxed);

    match outcome {
        Ok(Some(hit)) => EnrichmentRecord {
            record_id: task.id,
            status: EnrichmentStatus::Success,
            title: hit.title,
            link: hit.link,
            snippet: hit.snippet,
            place_id: hit.place_id,
            updated_at: Utc::now(),
            attempts,
            error: None,
        },
        Ok(None) => EnrichmentRecord {
            record_id: task.id,
            status: EnrichmentStatus::NotFound,
            title: None,
            link: None,
            snippet: None,
            place_id: None,
            updated_at: Utc::now(),
            attempts,
            error: None,
        },
        Err(err) => {
            warn!(record = %task.id, attempts, error = %err, "enrichment lookup failed");
            EnrichmentRecord {
                record_id: task.id,
                status: EnrichmentStatus::Error,
                title: None,
                link: None,
                snippet: None,
                place_id: None,
                updated_at: Utc::now(),
                attempts,
                error: Some(err.to_string()),
            }
        }
    }
}

fn apply_record(table: &mut ResultTable, record: &EnrichmentRecord) {
    // Columns were added up front; failures here would be programming
    // errors, so surface them loudly in logs rather than dropping data.
    let mut set = |column: &str, value: Value| {
        if let Err(err) = table.set_cell(&record.record_id, column, value) {
            warn!(record = %record.record_id, column, error = %err, "failed to write enrichment cell");
        }
    };

    set(
        SEARCH_STATUS_FIELD,
        Value::String(record.status.as_str().to_string()),
    );
    if record.status != EnrichmentStatus::Success {
        return;
    }
    if let Some(title) = &record.title {
        set(SEARCH_TITLE_FIELD, Value::String(title.clone()));
    }
    if let Some(link) = &record.link {
        set(SEARCH_LINK_FIELD, Value::String(link.clone()));
    }
    if let Some(snippet) = &record.snippet {
        set(SEARCH_SNIPPET_FIELD, Value::String(snippet.clone()));
    }
    if let Some(place_id) = &record.place_id {
        set(PLACE_ID_FIELD, Value::String(place_id.clone()));
    }
    set(
        PLACE_UPDATED_FIELD,
        Value::String(record.updated_at.to_rfc3339()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use acre_core::FieldList;
    use acre_remote::SearchHit;
    use async_trait::async_trait;

    struct MockSearch {
        transient_failures: AtomicU32,
        permanent: bool,
        calls: AtomicU32,
        hit: Option<SearchHit>,
    }

    impl MockSearch {
        fn with_hit() -> Self {
            Self {
                transient_failures: AtomicU32::new(0),
                permanent: false,
                calls: AtomicU32::new(0),
                hit: Some(SearchHit {
                    title: Some("Blue Door Cafe".into()),
                    link: Some("https://bluedoor.example".into()),
                    snippet: Some("Neighborhood cafe".into()),
                    place_id: Some("P-123".into()),
                }),
            }
        }
    }

    #[async_trait]
    impl SearchApi for MockSearch {
        async fn lookup(&self, _query: &SearchQuery) -> Result<Option<SearchHit>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(SearchError::Permanent("status 400: bad query".into()));
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SearchError::Transient("status 429: rate limited".into()));
            }
            Ok(self.hit.clone())
        }
    }

    fn account_fields() -> FieldList {
        FieldList::new(
            [
                NAME_FIELD,
                WEBSITE_FIELD,
                PHONE_FIELD,
                BILLING_CITY_FIELD,
                BILLING_COUNTRY_FIELD,
                CATEGORY_FIELD,
                PLACE_ID_FIELD,
            ]
            .into_iter()
            .map(String::from),
        )
    }

    fn table_with_row(id: &str, cells: &[(&str, &str)]) -> ResultTable {
        let mut table = ResultTable::new(&account_fields());
        let rid = RecordId::from(id);
        table.insert_row(rid.clone());
        for (column, value) in cells {
            table
                .set_cell(&rid, column, Value::String(value.to_string()))
                .unwrap();
        }
        table
    }

    fn fast_options() -> EnrichOptions {
        EnrichOptions {
            workers: 2,
            pause: Duration::ZERO,
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            rate: None,
            exclusion_markers: vec!["hotel".to_string()],
        }
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_within_three_attempts() {
        let api = Arc::new(MockSearch {
            transient_failures: AtomicU32::new(2),
            ..MockSearch::with_hit()
        });
        let engine =
            EnrichmentEngine::new(Arc::clone(&api) as Arc<dyn SearchApi>, fast_options()).unwrap();

        let mut table = table_with_row("001", &[(NAME_FIELD, "Blue Door Cafe")]);
        let summary = engine.run(&mut table).await;

        assert_eq!(summary.counts.succeeded, 1);
        let record = &summary.records[0];
        assert_eq!(record.status, EnrichmentStatus::Success);
        assert!(record.attempts <= 3);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            table.cell_str(&RecordId::from("001"), PLACE_ID_FIELD),
            Some("P-123")
        );
        assert_eq!(
            table.cell_str(&RecordId::from("001"), SEARCH_STATUS_FIELD),
            Some("success")
        );
    }

    #[tokio::test]
    async fn permanent_failure_errors_after_exactly_one_attempt() {
        let api = Arc::new(MockSearch {
            permanent: true,
            ..MockSearch::with_hit()
        });
        let engine =
            EnrichmentEngine::new(Arc::clone(&api) as Arc<dyn SearchApi>, fast_options()).unwrap();

        let mut table = table_with_row("001", &[(NAME_FIELD, "Blue Door Cafe")]);
        let summary = engine.run(&mut table).await;

        assert_eq!(summary.counts.errors, 1);
        let record = &summary.records[0];
        assert_eq!(record.status, EnrichmentStatus::Error);
        assert_eq!(record.attempts, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert!(record.error.as_deref().unwrap_or_default().contains("400"));
    }

    #[tokio::test]
    async fn rows_with_existing_place_id_are_skipped_without_a_call() {
        let api = Arc::new(MockSearch::with_hit());
        let engine =
            EnrichmentEngine::new(Arc::clone(&api) as Arc<dyn SearchApi>, fast_options()).unwrap();

        let mut table = table_with_row(
            "001",
            &[(NAME_FIELD, "Blue Door Cafe"), (PLACE_ID_FIELD, "P-999")],
        );
        let summary = engine.run(&mut table).await;

        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            table.cell_str(&RecordId::from("001"), SEARCH_STATUS_FIELD),
            Some("skipped")
        );
    }

    #[tokio::test]
    async fn rows_matching_an_exclusion_marker_are_skipped() {
        let api = Arc::new(MockSearch::with_hit());
        let engine =
            EnrichmentEngine::new(Arc::clone(&api) as Arc<dyn SearchApi>, fast_options()).unwrap();

        let mut table = table_with_row("001", &[(NAME_FIELD, "Grand Hotel Riverside")]);
        let summary = engine.run(&mut table).await;

        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rows_with_no_constructible_query_are_skipped() {
        let api = Arc::new(MockSearch::with_hit());
        let engine =
            EnrichmentEngine::new(Arc::clone(&api) as Arc<dyn SearchApi>, fast_options()).unwrap();

        let mut table = table_with_row("001", &[(PHONE_FIELD, "+1 555 0100")]);
        let summary = engine.run(&mut table).await;

        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.records[0].attempts, 0);
    }

    #[test]
    fn query_ladder_prefers_website_over_name() {
        let table = table_with_row(
            "001",
            &[
                (NAME_FIELD, "Blue Door Cafe"),
                (WEBSITE_FIELD, "https://bluedoor.example"),
                (BILLING_CITY_FIELD, "Lyon"),
            ],
        );
        let query = build_search_query(&table, &RecordId::from("001")).unwrap();
        assert_eq!(query.text.as_deref(), Some("https://bluedoor.example"));
        assert_eq!(query.locality.as_deref(), Some("Lyon"));
    }

    #[test]
    fn name_query_composites_locality_and_phone() {
        let table = table_with_row(
            "001",
            &[
                (NAME_FIELD, "Blue Door Cafe"),
                (BILLING_CITY_FIELD, "Lyon"),
                (BILLING_COUNTRY_FIELD, "France"),
                (PHONE_FIELD, "+33 4 00 00 00"),
            ],
        );
        let query = build_search_query(&table, &RecordId::from("001")).unwrap();
        assert_eq!(
            query.text.as_deref(),
            Some("Blue Door Cafe Lyon France +33 4 00 00 00")
        );
        assert_eq!(query.locality.as_deref(), Some("Lyon, France"));
    }

    #[test]
    fn existing_place_id_becomes_a_direct_lookup() {
        let table = table_with_row("001", &[(PLACE_ID_FIELD, "P-42")]);
        let query = build_search_query(&table, &RecordId::from("001")).unwrap();
        assert_eq!(query.place_id.as_deref(), Some("P-42"));
        assert!(query.text.is_none());
    }
}
