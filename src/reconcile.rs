//! Idempotent reconciliation of normalized records into the warehouse.
//!
//! For every record the reconciler looks up the live row by its uniqueness
//! predicate and then either inserts the full row or updates its mutable
//! columns. Running the same sync twice writes the same warehouse state;
//! the second run simply reports updates instead of creates.

use crate::error::{Error, Result};
use crate::normalize::{FieldValue, NormalizedRecord};
use crate::schema::EntityGraph;
use crate::warehouse::Warehouse;
use chrono::Utc;
use indexmap::IndexMap;
use tracing::{debug, instrument, warn};

/// What the reconciler did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// No existing row matched; a full row was inserted.
    Created,
    /// Exactly one row matched; its mutable columns were updated.
    Updated,
    /// More than one row matched the uniqueness predicate. The first match
    /// was updated; the rest were left untouched.
    DuplicateDetected,
    /// The record could not be written; `reason` says why.
    Skipped,
}

impl ReconcileAction {
    /// Stable lowercase name for logs and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::DuplicateDetected => "duplicate_detected",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-record reconciliation result.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Target table
    pub table: String,
    /// The record's natural key
    pub natural_key: String,
    /// What happened
    pub action: ReconcileAction,
    /// Failure detail, set only for [`ReconcileAction::Skipped`]
    pub reason: Option<String>,
}

impl ReconcileOutcome {
    fn new(record: &NormalizedRecord, action: ReconcileAction) -> Self {
        Self {
            table: record.table.clone(),
            natural_key: record.natural_key.clone(),
            action,
            reason: None,
        }
    }

    fn skipped(record: &NormalizedRecord, reason: impl Into<String>) -> Self {
        Self {
            table: record.table.clone(),
            natural_key: record.natural_key.clone(),
            action: ReconcileAction::Skipped,
            reason: Some(reason.into()),
        }
    }
}

/// Writes normalized record trees into the warehouse, parents first.
pub struct Reconciler<'a> {
    graph: &'a EntityGraph,
    warehouse: &'a dyn Warehouse,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler for one entity graph.
    pub fn new(graph: &'a EntityGraph, warehouse: &'a dyn Warehouse) -> Self {
        Self { graph, warehouse }
    }

    /// Reconcile a record and all of its descendants, depth first.
    ///
    /// A failed parent does not stop its children: each is still attempted
    /// and reports its own outcome (a child whose parent row is missing
    /// fails the foreign key and comes back skipped). Fatal errors, such as
    /// a lost warehouse connection, propagate instead of being absorbed as
    /// per-record skips.
    pub async fn reconcile_tree(&self, record: &NormalizedRecord) -> Result<Vec<ReconcileOutcome>> {
        let mut outcomes = Vec::with_capacity(record.record_count());
        for rec in record.walk() {
            outcomes.push(self.reconcile_one(rec).await?);
        }
        Ok(outcomes)
    }

    /// Check-then-act upsert of one record.
    ///
    /// Returns `Err` only for fatal errors; any other write failure is a
    /// `Skipped` outcome.
    #[instrument(skip(self, record), fields(table = %record.table, key = %record.natural_key))]
    pub async fn reconcile_one(&self, record: &NormalizedRecord) -> Result<ReconcileOutcome> {
        let Some(node) = self.graph.node(&record.table) else {
            return Ok(ReconcileOutcome::skipped(
                record,
                "table not declared in entity graph",
            ));
        };

        // Uniqueness predicate: the declared column tuple when one is set,
        // otherwise the natural key itself.
        let predicate: Vec<(String, FieldValue)> = match &node.key_columns {
            Some(columns) => columns
                .iter()
                .map(|col| {
                    let value = record
                        .attributes
                        .get(col)
                        .cloned()
                        .unwrap_or(FieldValue::Null);
                    (col.clone(), value)
                })
                .collect(),
            None => vec![(
                "natural_key".to_string(),
                FieldValue::Text(record.natural_key.clone()),
            )],
        };

        let existing = match self.warehouse.find(&record.table, &predicate).await {
            Ok(rows) => rows,
            Err(e) => return skip_or_abort(record, e),
        };

        match existing.len() {
            0 => match self.insert_full_row(record).await {
                Ok(()) => {
                    debug!("Created record");
                    Ok(ReconcileOutcome::new(record, ReconcileAction::Created))
                }
                Err(e) => skip_or_abort(record, e),
            },
            1 => match self.update_mutable(record, node, &predicate).await {
                Ok(()) => {
                    debug!("Updated record");
                    Ok(ReconcileOutcome::new(record, ReconcileAction::Updated))
                }
                Err(e) => skip_or_abort(record, e),
            },
            n => {
                warn!(
                    matches = n,
                    "Duplicate rows matched uniqueness predicate; updating first match only"
                );
                match self.update_mutable(record, node, &predicate).await {
                    Ok(()) => Ok(ReconcileOutcome::new(
                        record,
                        ReconcileAction::DuplicateDetected,
                    )),
                    Err(e) => skip_or_abort(record, e),
                }
            }
        }
    }

    async fn insert_full_row(&self, record: &NormalizedRecord) -> Result<()> {
        let mut row = IndexMap::new();
        row.insert(
            "natural_key".to_string(),
            FieldValue::Text(record.natural_key.clone()),
        );
        if let Some(parent) = &record.parent {
            row.insert(
                "parent_key".to_string(),
                FieldValue::Text(parent.natural_key.clone()),
            );
        }
        for (column, value) in &record.attributes {
            row.insert(column.clone(), value.clone());
        }
        row.insert(
            "last_synced_at".to_string(),
            FieldValue::Timestamp(Utc::now()),
        );
        self.warehouse.insert(&record.table, &row).await
    }

    async fn update_mutable(
        &self,
        record: &NormalizedRecord,
        node: &crate::schema::EntityNode,
        predicate: &[(String, FieldValue)],
    ) -> Result<()> {
        let mut changes = IndexMap::new();
        for column in node.mutable_columns() {
            if let Some(value) = record.attributes.get(column) {
                changes.insert(column.to_string(), value.clone());
            }
        }
        changes.insert(
            "last_synced_at".to_string(),
            FieldValue::Timestamp(Utc::now()),
        );
        self.warehouse.update(&record.table, predicate, &changes).await?;
        Ok(())
    }
}

/// Record-scope failures become a skip; fatal errors abort the entity run.
fn skip_or_abort(record: &NormalizedRecord, error: Error) -> Result<ReconcileOutcome> {
    if error.is_fatal() {
        return Err(error);
    }
    Ok(ReconcileOutcome::skipped(record, error.to_string()))
}
