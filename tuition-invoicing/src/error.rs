//! Errors raised while editing and committing an invoice's line items.

use crate::services::store::StoreError;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EditError {
    /// The invoice id does not resolve; fatal to the edit session.
    #[error("Invoice {invoice_id} not found")]
    NotFound { invoice_id: i64 },

    /// A line item or field value breaks the line item invariants.
    #[error("Invalid line item: {reason}")]
    Validation { reason: String },

    /// The edit refers to a line item that is not on this invoice.
    #[error("Line item {0} is not part of this invoice")]
    UnknownLineItem(i64),

    /// One create/update/delete/header call failed.
    #[error("Storage operation failed: {0}")]
    Persistence(#[source] StoreError),

    /// The recomputed total could not be persisted; the header total is stale.
    #[error("Invoice total could not be persisted: {0}")]
    Recompute(#[source] StoreError),
}

impl EditError {
    pub fn validation(reason: impl Into<String>) -> Self {
        EditError::Validation {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EditError::NotFound { .. } => "not_found",
            EditError::Validation { .. } => "validation",
            EditError::UnknownLineItem(_) => "unknown_line_item",
            EditError::Persistence(_) => "persistence",
            EditError::Recompute(_) => "recompute",
        }
    }
}

impl From<validator::ValidationErrors> for EditError {
    fn from(err: validator::ValidationErrors) -> Self {
        EditError::validation(err.to_string())
    }
}

impl From<EditError> for AppError {
    fn from(err: EditError) -> Self {
        match err {
            EditError::NotFound { .. } => AppError::NotFound(anyhow::Error::new(err)),
            EditError::Validation { .. } => AppError::Unprocessable(anyhow::Error::new(err)),
            EditError::UnknownLineItem(_) => AppError::BadRequest(anyhow::Error::new(err)),
            EditError::Persistence(_) | EditError::Recompute(_) => {
                AppError::DatabaseError(anyhow::Error::new(err))
            }
        }
    }
}
