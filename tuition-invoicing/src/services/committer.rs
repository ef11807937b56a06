//! Applies a ledger diff to storage and keeps the invoice total consistent.
//!
//! Two modes:
//!
//! * `BestEffort` issues every create/update/delete, concurrently, and keeps
//!   going past failures. Each failure is reported; whatever succeeded stays.
//! * `Atomic` runs everything in one storage transaction and rolls back on
//!   the first failure.
//!
//! In both modes the total is recomputed from a fresh read of storage only
//! after every line-item operation has settled.

use crate::error::EditError;
use crate::models::{InvoiceHeader, InvoiceHeaderUpdate, LineItemField};
use crate::services::calculator::compute_total;
use crate::services::ledger::{Ledger, LedgerDiff, PendingLineItem, RowUpdate};
use crate::services::metrics::{record_commit, record_commit_operation, record_error};
use crate::services::store::{InvoiceStore, StoreError, StoreTransaction, TransactionalStore};
use chrono::NaiveDate;
use futures::future::{join3, join_all};
use rust_decimal::Decimal;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// How a commit reacts to a failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    #[default]
    BestEffort,
    Atomic,
}

impl CommitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitMode::BestEffort => "best_effort",
            CommitMode::Atomic => "atomic",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "best_effort" => Some(CommitMode::BestEffort),
            "atomic" => Some(CommitMode::Atomic),
            _ => None,
        }
    }
}

/// One storage step of a commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    UpdateDate {
        invoice_date: NaiveDate,
    },
    Create {
        local_id: Uuid,
        /// Id assigned by storage; `None` when the create did not happen.
        line_item_id: Option<i64>,
    },
    Update {
        line_item_id: i64,
        fields: Vec<LineItemField>,
    },
    Delete {
        line_item_id: i64,
    },
    RecomputeTotal,
    CommitTransaction,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::UpdateDate { .. } => "update_date",
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::RecomputeTotal => "recompute_total",
            Operation::CommitTransaction => "commit_transaction",
        }
    }

    /// Whether this step changes line items or the date, as opposed to the
    /// bookkeeping steps that follow them.
    pub fn is_change(&self) -> bool {
        !matches!(
            self,
            Operation::RecomputeTotal | Operation::CommitTransaction
        )
    }

    fn create(pending: &PendingLineItem) -> Self {
        Operation::Create {
            local_id: pending.local_id,
            line_item_id: None,
        }
    }

    fn update(row: &RowUpdate) -> Self {
        Operation::Update {
            line_item_id: row.line_item_id,
            fields: row.changes.iter().map(|c| c.field()).collect(),
        }
    }
}

/// An operation that did not take effect, and why.
#[derive(Debug)]
pub struct OperationFailure {
    pub operation: Operation,
    pub error: EditError,
}

impl Serialize for OperationFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("OperationFailure", 3)?;
        state.serialize_field("operation", &self.operation)?;
        state.serialize_field("kind", self.error.kind())?;
        state.serialize_field("message", &self.error.to_string())?;
        state.end()
    }
}

/// Consolidated outcome of a commit.
#[derive(Debug, Serialize)]
pub struct CommitResult {
    pub invoice_id: i64,
    pub mode: CommitMode,
    pub applied: Vec<Operation>,
    pub failures: Vec<OperationFailure>,
    /// Total written to the header, when the recompute step succeeded.
    pub total: Option<Decimal>,
    pub rolled_back: bool,
}

impl CommitResult {
    fn new(invoice_id: i64, mode: CommitMode) -> Self {
        Self {
            invoice_id,
            mode,
            applied: Vec::new(),
            failures: Vec::new(),
            total: None,
            rolled_back: false,
        }
    }

    fn record(&mut self, outcome: Result<Operation, OperationFailure>) {
        match outcome {
            Ok(operation) => {
                record_commit_operation(operation.label(), "ok");
                self.applied.push(operation);
            }
            Err(failure) => {
                record_commit_operation(failure.operation.label(), "failed");
                warn!(
                    invoice_id = self.invoice_id,
                    operation = failure.operation.label(),
                    error = %failure.error,
                    "Commit operation failed"
                );
                self.failures.push(failure);
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    /// Number of line-item and date changes that reached storage.
    pub fn saved_count(&self) -> usize {
        self.applied.iter().filter(|op| op.is_change()).count()
    }

    /// True when the header total may no longer match the line items.
    pub fn total_is_stale(&self) -> bool {
        !self.rolled_back && self.total.is_none()
    }

    /// Short user-facing description of the outcome.
    pub fn summary(&self) -> String {
        if self.rolled_back {
            format!(
                "no changes saved, rolled back after {} failed",
                self.failed_count()
            )
        } else if self.failures.is_empty() && self.saved_count() == 0 {
            "no changes".to_string()
        } else if self.failures.is_empty() {
            format!("all {} changes saved", self.saved_count())
        } else {
            format!("some changes saved, {} failed", self.failed_count())
        }
    }

    fn outcome_label(&self) -> &'static str {
        if self.rolled_back {
            "rolled_back"
        } else if self.failures.is_empty() {
            "success"
        } else {
            "partial"
        }
    }
}

/// Turns ledger diffs into storage writes followed by a total recompute.
pub struct ReconciliationCommitter<S> {
    store: Arc<S>,
    mode: CommitMode,
}

impl<S> Clone for ReconciliationCommitter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            mode: self.mode,
        }
    }
}

impl<S: TransactionalStore> ReconciliationCommitter<S> {
    pub fn new(store: Arc<S>, mode: CommitMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Commit everything a ledger changed since it was loaded.
    pub async fn save(
        &self,
        ledger: &Ledger,
        invoice_date: Option<NaiveDate>,
    ) -> Result<CommitResult, EditError> {
        self.commit(ledger.invoice_id(), &ledger.diff(), invoice_date)
            .await
    }

    pub async fn commit(
        &self,
        invoice_id: i64,
        diff: &LedgerDiff,
        invoice_date: Option<NaiveDate>,
    ) -> Result<CommitResult, EditError> {
        self.commit_with_mode(invoice_id, diff, invoice_date, self.mode)
            .await
    }

    /// Apply `diff` (and an optional new invoice date) to `invoice_id`.
    ///
    /// Updates and deletes are scoped to `invoice_id`: a row id from another
    /// invoice fails as not found and leaves that row untouched.
    ///
    /// Only an unresolvable invoice, or a transaction that cannot be opened,
    /// is returned as `Err`; every other failure is listed in the result.
    #[instrument(
        skip(self, diff),
        fields(
            mode = mode.as_str(),
            creates = diff.to_create.len(),
            updates = diff.to_update.len(),
            deletes = diff.to_delete.len()
        )
    )]
    pub async fn commit_with_mode(
        &self,
        invoice_id: i64,
        diff: &LedgerDiff,
        invoice_date: Option<NaiveDate>,
        mode: CommitMode,
    ) -> Result<CommitResult, EditError> {
        let header = fetch_header(&*self.store, invoice_id).await?;

        let result = match mode {
            CommitMode::BestEffort => commit_best_effort(&*self.store, &header, diff, invoice_date).await,
            CommitMode::Atomic => commit_atomic(&*self.store, &header, diff, invoice_date).await?,
        };

        record_commit(mode.as_str(), result.outcome_label());
        if result.total_is_stale() {
            record_error("recompute");
        }

        info!(
            saved = result.saved_count(),
            failed = result.failed_count(),
            rolled_back = result.rolled_back,
            total = ?result.total,
            "{}",
            result.summary()
        );

        Ok(result)
    }

    /// Re-derive the total from stored line items and write it to the header.
    #[instrument(skip(self))]
    pub async fn recompute(&self, invoice_id: i64) -> Result<Decimal, EditError> {
        let header = fetch_header(&*self.store, invoice_id).await?;
        let total = recompute_total(&*self.store, &header)
            .await
            .map_err(EditError::Recompute)?;

        info!(total = %total, "Invoice total recomputed");

        Ok(total)
    }
}

async fn fetch_header<T>(store: &T, invoice_id: i64) -> Result<InvoiceHeader, EditError>
where
    T: InvoiceStore + ?Sized,
{
    store
        .fetch_invoice_header(invoice_id)
        .await
        .map_err(EditError::Persistence)?
        .ok_or(EditError::NotFound { invoice_id })
}

/// Read the post-mutation rows, compute the total and persist it.
async fn recompute_total<T>(store: &T, header: &InvoiceHeader) -> Result<Decimal, StoreError>
where
    T: InvoiceStore + ?Sized,
{
    let items = store.fetch_line_items(header.invoice_id).await?;
    let total = compute_total(&items, &header.policy());
    store
        .update_invoice_header(header.invoice_id, &InvoiceHeaderUpdate::total(total))
        .await?;
    Ok(total)
}

fn validate_create(pending: &PendingLineItem) -> Result<(), OperationFailure> {
    pending.input.validate().map_err(|e| OperationFailure {
        operation: Operation::create(pending),
        error: EditError::from(e),
    })
}

fn validate_update(row: &RowUpdate) -> Result<(), OperationFailure> {
    for change in &row.changes {
        change.validate().map_err(|reason| OperationFailure {
            operation: Operation::update(row),
            error: EditError::validation(reason),
        })?;
    }
    Ok(())
}

/// Split the diff into rows that may be written and validation failures.
fn partition_valid(
    diff: &LedgerDiff,
) -> (Vec<&PendingLineItem>, Vec<&RowUpdate>, Vec<OperationFailure>) {
    let mut invalid = Vec::new();

    let creates = diff
        .to_create
        .iter()
        .filter(|p| match validate_create(p) {
            Ok(()) => true,
            Err(failure) => {
                invalid.push(failure);
                false
            }
        })
        .collect::<Vec<_>>();

    let updates = diff
        .to_update
        .iter()
        .filter(|row| match validate_update(row) {
            Ok(()) => true,
            Err(failure) => {
                invalid.push(failure);
                false
            }
        })
        .collect::<Vec<_>>();

    (creates, updates, invalid)
}

/// The date step is skipped when the date is unchanged.
fn date_change(header: &InvoiceHeader, invoice_date: Option<NaiveDate>) -> Option<NaiveDate> {
    invoice_date.filter(|date| *date != header.invoice_date)
}

async fn apply_date<T>(
    store: &T,
    invoice_id: i64,
    invoice_date: NaiveDate,
) -> Result<Operation, OperationFailure>
where
    T: InvoiceStore + ?Sized,
{
    let operation = Operation::UpdateDate { invoice_date };
    match store
        .update_invoice_header(invoice_id, &InvoiceHeaderUpdate::date(invoice_date))
        .await
    {
        Ok(()) => Ok(operation),
        Err(e) => Err(OperationFailure {
            operation,
            error: EditError::Persistence(e),
        }),
    }
}

async fn apply_create<T>(
    store: &T,
    invoice_id: i64,
    pending: &PendingLineItem,
) -> Result<Operation, OperationFailure>
where
    T: InvoiceStore + ?Sized,
{
    match store.create_line_item(invoice_id, &pending.input).await {
        Ok(created) => Ok(Operation::Create {
            local_id: pending.local_id,
            line_item_id: created.id.persisted(),
        }),
        Err(e) => Err(OperationFailure {
            operation: Operation::create(pending),
            error: EditError::Persistence(e),
        }),
    }
}

async fn apply_update<T>(
    store: &T,
    invoice_id: i64,
    row: &RowUpdate,
) -> Result<Operation, OperationFailure>
where
    T: InvoiceStore + ?Sized,
{
    match store
        .update_line_item(invoice_id, row.line_item_id, &row.changes)
        .await
    {
        Ok(()) => Ok(Operation::update(row)),
        Err(e) => Err(OperationFailure {
            operation: Operation::update(row),
            error: EditError::Persistence(e),
        }),
    }
}

async fn apply_delete<T>(
    store: &T,
    invoice_id: i64,
    line_item_id: i64,
) -> Result<Operation, OperationFailure>
where
    T: InvoiceStore + ?Sized,
{
    let operation = Operation::Delete { line_item_id };
    match store.delete_line_item(invoice_id, line_item_id).await {
        Ok(()) => Ok(operation),
        Err(e) => Err(OperationFailure {
            operation,
            error: EditError::Persistence(e),
        }),
    }
}

async fn commit_best_effort<T>(
    store: &T,
    header: &InvoiceHeader,
    diff: &LedgerDiff,
    invoice_date: Option<NaiveDate>,
) -> CommitResult
where
    T: InvoiceStore + ?Sized,
{
    let invoice_id = header.invoice_id;
    let mut result = CommitResult::new(invoice_id, CommitMode::BestEffort);

    if let Some(date) = date_change(header, invoice_date) {
        result.record(apply_date(store, invoice_id, date).await);
    }

    let (creates, updates, invalid) = partition_valid(diff);
    for failure in invalid {
        result.record(Err(failure));
    }

    // Rows are disjoint, so the three groups may run side by side.
    let (created, updated, deleted) = join3(
        join_all(creates.into_iter().map(|p| apply_create(store, invoice_id, p))),
        join_all(updates.into_iter().map(|row| apply_update(store, invoice_id, row))),
        join_all(diff.to_delete.iter().map(|id| apply_delete(store, invoice_id, *id))),
    )
    .await;

    for outcome in created.into_iter().chain(updated).chain(deleted) {
        result.record(outcome);
    }

    match recompute_total(store, header).await {
        Ok(total) => {
            result.total = Some(total);
            result.record(Ok(Operation::RecomputeTotal));
        }
        Err(e) => result.record(Err(OperationFailure {
            operation: Operation::RecomputeTotal,
            error: EditError::Recompute(e),
        })),
    }

    result
}

async fn commit_atomic<S>(
    store: &S,
    header: &InvoiceHeader,
    diff: &LedgerDiff,
    invoice_date: Option<NaiveDate>,
) -> Result<CommitResult, EditError>
where
    S: TransactionalStore + ?Sized,
{
    let invoice_id = header.invoice_id;
    let mut result = CommitResult::new(invoice_id, CommitMode::Atomic);

    let (creates, updates, invalid) = partition_valid(diff);
    if !invalid.is_empty() {
        for failure in invalid {
            result.record(Err(failure));
        }
        result.rolled_back = true;
        return Ok(result);
    }

    let tx = store.begin().await.map_err(EditError::Persistence)?;

    let mut applied = Vec::new();
    let steps = run_in_transaction(
        &tx,
        header,
        invoice_date,
        &creates,
        &updates,
        &diff.to_delete,
        &mut applied,
    )
    .await;

    match steps {
        Ok(total) => match tx.commit().await {
            Ok(()) => {
                for operation in applied {
                    result.record(Ok(operation));
                }
                result.total = Some(total);
            }
            Err(e) => {
                result.rolled_back = true;
                result.record(Err(OperationFailure {
                    operation: Operation::CommitTransaction,
                    error: EditError::Persistence(e),
                }));
            }
        },
        Err(failure) => {
            if let Err(e) = tx.rollback().await {
                warn!(invoice_id, error = %e, "Rollback failed");
            }
            result.rolled_back = true;
            result.record(Err(failure));
        }
    }

    Ok(result)
}

/// Sequential steps of an atomic commit; stops at the first failure.
async fn run_in_transaction<T>(
    tx: &T,
    header: &InvoiceHeader,
    invoice_date: Option<NaiveDate>,
    creates: &[&PendingLineItem],
    updates: &[&RowUpdate],
    deletes: &[i64],
    applied: &mut Vec<Operation>,
) -> Result<Decimal, OperationFailure>
where
    T: InvoiceStore + ?Sized,
{
    let invoice_id = header.invoice_id;

    if let Some(date) = date_change(header, invoice_date) {
        applied.push(apply_date(tx, invoice_id, date).await?);
    }
    for pending in creates {
        applied.push(apply_create(tx, invoice_id, pending).await?);
    }
    for row in updates {
        applied.push(apply_update(tx, invoice_id, row).await?);
    }
    for line_item_id in deletes {
        applied.push(apply_delete(tx, invoice_id, *line_item_id).await?);
    }

    let total = recompute_total(tx, header)
        .await
        .map_err(|e| OperationFailure {
            operation: Operation::RecomputeTotal,
            error: EditError::Recompute(e),
        })?;
    applied.push(Operation::RecomputeTotal);

    Ok(total)
}
