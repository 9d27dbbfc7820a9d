//! Duplicate reconciliation: grouping by place id, survivor selection,
//! reparent/delete planning, audited apply, and the enrichment update
//! push.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use acre_core::{
    ActionOutcome, AuditEntry, DuplicateGroup, MergeAction, MergeAudit, MergePlan, PlannedAction,
    RecordId, ResultTable,
};
use acre_remote::RecordSource;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{ConfigError, WriteMode, PLACE_ID_FIELD};

/// Partitions the table's records by external place id. Records without
/// one never join a group; groups of one are not duplicates.
pub fn group_duplicates(table: &ResultTable) -> Vec<DuplicateGroup> {
    let mut by_place: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
    for id in table.record_ids() {
        if let Some(place_id) = table.cell_str(id, PLACE_ID_FIELD) {
            by_place.entry(place_id.to_string()).or_default().push(id.clone());
        }
    }

    by_place
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(place_id, mut members)| {
            members.sort();
            let survivor = choose_survivor(table, &members);
            let duplicates = members.into_iter().filter(|id| *id != survivor).collect();
            DuplicateGroup {
                place_id,
                survivor,
                duplicates,
            }
        })
        .collect()
}

/// Most populated record wins; ties break to the lowest record id so the
/// choice is a total order over the group, not an artifact of input
/// order.
fn choose_survivor(table: &ResultTable, members: &[RecordId]) -> RecordId {
    members
        .iter()
        .max_by_key(|id| (table.non_null_count(id), Reverse((*id).clone())))
        .cloned()
        .unwrap_or_else(|| RecordId::from(""))
}

/// Reparent-then-delete, per duplicate, in group order.
pub fn build_merge_plan(groups: &[DuplicateGroup]) -> MergePlan {
    let mut entries = Vec::new();
    for group in groups {
        for duplicate in &group.duplicates {
            entries.push(PlannedAction {
                place_id: group.place_id.clone(),
                action: MergeAction::Reparent {
                    source: duplicate.clone(),
                    target: group.survivor.clone(),
                },
            });
            entries.push(PlannedAction {
                place_id: group.place_id.clone(),
                action: MergeAction::Delete {
                    source: duplicate.clone(),
                },
            });
        }
    }
    MergePlan::new(entries)
}

/// Executes the plan sequentially so reparent/delete of one group never
/// race. In dry-run mode the mutation interface is never touched. A
/// failed reparent skips the matching delete; everything is audited.
pub async fn apply_merge_plan(
    source: &dyn RecordSource,
    plan: &MergePlan,
    mode: WriteMode,
) -> MergeAudit {
    let mut audit = MergeAudit::default();
    let mut failed_reparents: HashSet<RecordId> = HashSet::new();

    for entry in plan.entries() {
        let outcome = match mode {
            WriteMode::DryRun => ActionOutcome::DryRun,
            WriteMode::Commit => match &entry.action {
                MergeAction::Reparent { source: from, target } => {
                    match source.reparent_children(from, target).await {
                        Ok(moved) => {
                            debug!(from = %from, to = %target, moved, "reparented duplicate children");
                            ActionOutcome::Applied
                        }
                        Err(err) => {
                            warn!(from = %from, to = %target, error = %err, "reparent failed; duplicate kept");
                            failed_reparents.insert(from.clone());
                            ActionOutcome::Failed {
                                message: err.to_string(),
                            }
                        }
                    }
                }
                MergeAction::Delete { source: victim } => {
                    if failed_reparents.contains(victim) {
                        ActionOutcome::Failed {
                            message: "skipped: reparent failed".to_string(),
                        }
                    } else {
                        match source.delete_record(victim).await {
                            Ok(()) => ActionOutcome::Applied,
                            Err(err) => {
                                warn!(record = %victim, error = %err, "delete failed; duplicate kept");
                                ActionOutcome::Failed {
                                    message: err.to_string(),
                                }
                            }
                        }
                    }
                }
            },
        };
        audit.entries.push(AuditEntry {
            place_id: entry.place_id.clone(),
            action: entry.action.clone(),
            outcome,
        });
    }

    info!(
        total = audit.entries.len(),
        applied = audit.applied(),
        failed = audit.failed(),
        "merge plan processed"
    );
    audit
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// New non-empty values the enrichment produced for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedUpdate {
    pub record_id: RecordId,
    pub changes: BTreeMap<String, FieldChange>,
}

impl ProposedUpdate {
    pub fn new_values(&self) -> BTreeMap<String, Value> {
        self.changes
            .iter()
            .map(|(field, change)| (field.clone(), change.new.clone()))
            .collect()
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Diffs the enriched table against the fetched originals over `fields`:
/// a change is a new non-empty value that the original lacked or differed
/// on.
pub fn collect_updates(
    original: &ResultTable,
    enriched: &ResultTable,
    fields: &[&str],
) -> Vec<ProposedUpdate> {
    let mut updates = Vec::new();
    for (id, _) in enriched.rows() {
        if !original.contains_record(id) {
            continue;
        }
        let mut changes = BTreeMap::new();
        for field in fields {
            let new = enriched.cell(id, field);
            if is_empty_value(new) {
                continue;
            }
            let old = original.cell(id, field);
            if is_empty_value(old) || old != new {
                changes.insert(
                    field.to_string(),
                    FieldChange {
                        old: old.clone(),
                        new: new.clone(),
                    },
                );
            }
        }
        if !changes.is_empty() {
            updates.push(ProposedUpdate {
                record_id: id.clone(),
                changes,
            });
        }
    }
    updates
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub record_id: RecordId,
    pub updated_fields: Vec<String>,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

/// Pushes collected updates to the source with a bounded worker pool; a
/// single record's failure is recorded and skipped. Dry-run records the
/// proposal without calling the source.
pub async fn apply_updates(
    source: Arc<dyn RecordSource>,
    updates: &[ProposedUpdate],
    mode: WriteMode,
    workers: usize,
) -> Result<Vec<UpdateOutcome>, ConfigError> {
    if workers < 1 {
        return Err(ConfigError::Workers(workers));
    }
    if updates.is_empty() {
        return Ok(Vec::new());
    }

    if mode == WriteMode::DryRun {
        return Ok(updates
            .iter()
            .map(|update| UpdateOutcome {
                record_id: update.record_id.clone(),
                updated_fields: update.changes.keys().cloned().collect(),
                outcome: ActionOutcome::DryRun,
            })
            .collect());
    }

    let queue: Arc<Mutex<VecDeque<ProposedUpdate>>> =
        Arc::new(Mutex::new(updates.iter().cloned().collect()));
    let (tx, mut rx) = mpsc::unbounded_channel::<UpdateOutcome>();
    let mut pool = JoinSet::new();
    for _ in 0..workers.min(updates.len()) {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let source = Arc::clone(&source);
        pool.spawn(async move {
            loop {
                let Some(update) = queue.lock().await.pop_front() else {
                    break;
                };
                let patch = update.new_values();
                let outcome = match source.update_record(&update.record_id, &patch).await {
                    Ok(()) => ActionOutcome::Applied,
                    Err(err) => {
                        warn!(record = %update.record_id, error = %err, "update push failed");
                        ActionOutcome::Failed {
                            message: err.to_string(),
                        }
                    }
                };
                let sent = tx.send(UpdateOutcome {
                    record_id: update.record_id,
                    updated_fields: update.changes.keys().cloned().collect(),
                    outcome,
                });
                if sent.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut outcomes = Vec::new();
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    while let Some(joined) = pool.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "update worker aborted");
        }
    }
    outcomes.sort_by(|a, b| a.record_id.cmp(&b.record_id));
    Ok(outcomes)
}
