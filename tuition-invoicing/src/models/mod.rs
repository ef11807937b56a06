//! Domain models for tuition-invoicing.

mod invoice;
mod line_item;

pub use invoice::{BillingPolicy, InvoiceHeader, InvoiceHeaderUpdate, InvoiceKind, InvoiceStatus};
pub use line_item::{
    FieldChange, LessonDuration, LineItem, LineItemField, LineItemId, LineItemInput,
    LineItemRecord,
};
