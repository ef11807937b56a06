use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::EditError;
use crate::models::{
    FieldChange, InvoiceHeader, LessonDuration, LineItem, LineItemField, LineItemId,
    LineItemInput,
};
use crate::services::metrics::record_error;
use crate::services::{CommitMode, CommitResult, Ledger, TransactionalStore};
use crate::startup::AppState;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct LineItemsResponse {
    pub header: InvoiceHeader,
    pub line_items: Vec<LineItem>,
    pub computed_total: Decimal,
}

/// One row of the submitted working set. Rows without `id` are new.
#[derive(Debug, Deserialize)]
pub struct LineItemPayload {
    pub id: Option<i64>,
    pub description: String,
    #[serde(default)]
    pub period: String,
    pub lesson_count: Decimal,
    #[serde(default)]
    pub duration: Option<LessonDuration>,
    pub rate: Decimal,
    #[serde(default)]
    pub contract_id: Option<i64>,
    #[serde(default)]
    pub student_subject_id: Option<i64>,
}

impl LineItemPayload {
    fn into_input(self) -> LineItemInput {
        LineItemInput {
            description: self.description,
            period: self.period,
            lesson_count: self.lesson_count,
            duration: self.duration,
            rate: self.rate,
            contract_id: self.contract_id,
            student_subject_id: self.student_subject_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SaveLineItemsRequest {
    #[serde(default)]
    pub invoice_date: Option<NaiveDate>,
    #[serde(default)]
    pub mode: Option<CommitMode>,
    pub line_items: Vec<LineItemPayload>,
}

#[derive(Debug, Serialize)]
pub struct SaveLineItemsResponse {
    pub summary: String,
    #[serde(flatten)]
    pub result: CommitResult,
}

#[derive(Debug, Serialize)]
pub struct RecomputeTotalResponse {
    pub invoice_id: i64,
    pub total: Decimal,
}

fn to_app_error(err: EditError) -> AppError {
    let err = AppError::from(err);
    record_error(err.kind());
    err
}

/// Replace the ledger's working set with the submitted rows.
fn stage_working_set(ledger: &mut Ledger, rows: Vec<LineItemPayload>) -> Result<(), EditError> {
    let mut kept = HashSet::new();

    for row in rows {
        match row.id {
            Some(id) => {
                let item_id = LineItemId::Persisted(id);
                if ledger.baseline().iter().all(|item| item.id != item_id) {
                    return Err(EditError::UnknownLineItem(id));
                }
                kept.insert(id);

                let submitted = LineItem::from_input(item_id, row.into_input());
                for field in LineItemField::ALL {
                    ledger.update(item_id, FieldChange::read(&submitted, field));
                }
            }
            None => {
                ledger.add(row.into_input())?;
            }
        }
    }

    let removed: Vec<i64> = ledger
        .baseline()
        .iter()
        .filter_map(|item| item.id.persisted())
        .filter(|id| !kept.contains(id))
        .collect();
    for id in removed {
        ledger.remove(LineItemId::Persisted(id));
    }

    Ok(())
}

#[tracing::instrument(skip(state))]
pub async fn get_line_items<S: TransactionalStore + 'static>(
    State(state): State<AppState<S>>,
    Path(invoice_id): Path<i64>,
) -> Result<Json<LineItemsResponse>, AppError> {
    let ledger = Ledger::load(&**state.committer.store(), invoice_id)
        .await
        .map_err(to_app_error)?;

    Ok(Json(LineItemsResponse {
        computed_total: ledger.draft_total(),
        header: ledger.header().clone(),
        line_items: ledger.items().to_vec(),
    }))
}

/// Reconcile the invoice with the submitted rows and recompute its total.
///
/// New rows are validated while the request is staged, so one invalid new
/// row rejects the whole save with 422 and nothing is written. Edits to
/// existing rows are validated per row at commit: an invalid edit shows up
/// in `failures` with kind `validation` while the other rows are still
/// saved (207). Atomic saves that roll back answer 409.
#[tracing::instrument(skip(state, request))]
pub async fn save_line_items<S: TransactionalStore + 'static>(
    State(state): State<AppState<S>>,
    Path(invoice_id): Path<i64>,
    Json(request): Json<SaveLineItemsRequest>,
) -> Result<(StatusCode, Json<SaveLineItemsResponse>), AppError> {
    let mut ledger = Ledger::load(&**state.committer.store(), invoice_id)
        .await
        .map_err(to_app_error)?;

    stage_working_set(&mut ledger, request.line_items).map_err(to_app_error)?;

    let mode = request.mode.unwrap_or(state.committer.mode());
    let result = state
        .committer
        .commit_with_mode(invoice_id, &ledger.diff(), request.invoice_date, mode)
        .await
        .map_err(to_app_error)?;

    let status = if result.rolled_back {
        StatusCode::CONFLICT
    } else if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };

    Ok((
        status,
        Json(SaveLineItemsResponse {
            summary: result.summary(),
            result,
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn recompute_total<S: TransactionalStore + 'static>(
    State(state): State<AppState<S>>,
    Path(invoice_id): Path<i64>,
) -> Result<Json<RecomputeTotalResponse>, AppError> {
    let total = state
        .committer
        .recompute(invoice_id)
        .await
        .map_err(to_app_error)?;

    Ok(Json(RecomputeTotalResponse { invoice_id, total }))
}
