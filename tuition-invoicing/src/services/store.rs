//! Persistence seam used by the ledger and the reconciliation committer.

use crate::models::{FieldChange, InvoiceHeader, InvoiceHeaderUpdate, LineItem, LineItemInput};
use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single storage call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Storage failure: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn invoice_not_found(id: i64) -> Self {
        StoreError::NotFound {
            entity: "Invoice",
            id,
        }
    }

    pub fn line_item_not_found(id: i64) -> Self {
        StoreError::NotFound {
            entity: "Line item",
            id,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err)
                if db_err.is_check_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_unique_violation() =>
            {
                StoreError::Constraint(db_err.message().to_string())
            }
            other => StoreError::Backend(anyhow::Error::new(other)),
        }
    }
}

/// Reads and writes of invoice headers and their line items.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// `Ok(None)` when the invoice id does not resolve.
    async fn fetch_invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, StoreError>;

    /// Line items of an invoice in display order.
    async fn fetch_line_items(&self, invoice_id: i64) -> Result<Vec<LineItem>, StoreError>;

    /// Insert a row; the returned item carries the authoritative id.
    async fn create_line_item(
        &self,
        invoice_id: i64,
        input: &LineItemInput,
    ) -> Result<LineItem, StoreError>;

    /// Write every change of one row in a single call. Rows that do not
    /// belong to `invoice_id` are reported as not found.
    async fn update_line_item(
        &self,
        invoice_id: i64,
        line_item_id: i64,
        changes: &[FieldChange],
    ) -> Result<(), StoreError>;

    /// Rows that do not belong to `invoice_id` are reported as not found.
    async fn delete_line_item(&self, invoice_id: i64, line_item_id: i64)
        -> Result<(), StoreError>;

    async fn update_invoice_header(
        &self,
        invoice_id: i64,
        update: &InvoiceHeaderUpdate,
    ) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A store that can group calls into one all-or-nothing unit.
#[async_trait]
pub trait TransactionalStore: InvoiceStore {
    type Transaction: StoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// Open storage transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: InvoiceStore + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
