//! Services module for tuition-invoicing.

pub mod calculator;
pub mod committer;
pub mod database;
pub mod ledger;
pub mod metrics;
pub mod store;

pub use calculator::{compute_total, REGISTRATION_FEE_LABEL};
pub use committer::{CommitMode, CommitResult, Operation, OperationFailure, ReconciliationCommitter};
pub use database::{Database, PgStoreTransaction};
pub use ledger::{Ledger, LedgerDiff, PendingLineItem, RowUpdate};
pub use metrics::{get_metrics, init_metrics};
pub use store::{InvoiceStore, StoreError, StoreTransaction, TransactionalStore};
