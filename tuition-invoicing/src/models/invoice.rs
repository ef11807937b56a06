//! Invoice header model for tuition-invoicing.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which side of the agency an invoice sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum InvoiceKind {
    /// Issued to a student; subject to the minimum-lesson floor.
    Receivable,
    /// Issued to a teacher; never floored.
    Payable,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Receivable => "receivable",
            InvoiceKind::Payable => "payable",
        }
    }
}

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Active,
    Paid,
    Suspended,
    Deleted,
}

/// Invoice header: the parent record of a set of line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InvoiceHeader {
    pub invoice_id: i64,
    pub kind: InvoiceKind,
    /// Student id for receivables, teacher id for payables.
    pub party_id: i64,
    pub invoice_date: NaiveDate,
    pub total: Decimal,
    pub status: InvoiceStatus,
    pub minimum_lessons_enforced: bool,
    pub minimum_lesson_count: Option<i32>,
    pub created_utc: DateTime<Utc>,
}

impl InvoiceHeader {
    /// Billing policy derived from the header flags.
    pub fn policy(&self) -> BillingPolicy {
        BillingPolicy {
            kind: self.kind,
            minimum_lessons_enforced: self.minimum_lessons_enforced,
            minimum_lesson_count: self.minimum_lesson_count,
        }
    }
}

/// Invoice-level inputs to total calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPolicy {
    pub kind: InvoiceKind,
    pub minimum_lessons_enforced: bool,
    pub minimum_lesson_count: Option<i32>,
}

impl BillingPolicy {
    /// Policy for a payable invoice; the minimum-lesson flags do not exist there.
    pub fn payable() -> Self {
        Self {
            kind: InvoiceKind::Payable,
            minimum_lessons_enforced: false,
            minimum_lesson_count: None,
        }
    }

    /// Receivable policy with an optional minimum-lesson floor.
    pub fn receivable(minimum_lesson_count: Option<i32>) -> Self {
        Self {
            kind: InvoiceKind::Receivable,
            minimum_lessons_enforced: minimum_lesson_count.is_some(),
            minimum_lesson_count,
        }
    }

    /// The floor to apply, if any.
    pub fn lesson_floor(&self) -> Option<Decimal> {
        match (self.kind, self.minimum_lessons_enforced, self.minimum_lesson_count) {
            (InvoiceKind::Receivable, true, Some(min)) => Some(Decimal::from(min)),
            _ => None,
        }
    }
}

/// Header fields the committer writes back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceHeaderUpdate {
    pub invoice_date: Option<NaiveDate>,
    pub total: Option<Decimal>,
}

impl InvoiceHeaderUpdate {
    pub fn date(invoice_date: NaiveDate) -> Self {
        Self {
            invoice_date: Some(invoice_date),
            total: None,
        }
    }

    pub fn total(total: Decimal) -> Self {
        Self {
            invoice_date: None,
            total: Some(total),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.invoice_date.is_none() && self.total.is_none()
    }
}
