//! Editable working set of an invoice's line items for one edit session.

use crate::error::EditError;
use crate::models::{FieldChange, InvoiceHeader, LineItem, LineItemField, LineItemId, LineItemInput};
use crate::services::calculator::compute_total;
use crate::services::store::InvoiceStore;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

/// A row added during the session that storage has not seen yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingLineItem {
    pub local_id: Uuid,
    pub input: LineItemInput,
}

/// All changed fields of one persisted row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowUpdate {
    pub line_item_id: i64,
    pub changes: Vec<FieldChange>,
}

/// Operations needed to bring storage in line with the working set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerDiff {
    pub to_create: Vec<PendingLineItem>,
    pub to_update: Vec<RowUpdate>,
    pub to_delete: Vec<i64>,
}

impl LedgerDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Number of storage calls the diff turns into.
    pub fn operation_count(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }

    /// Field-granular view: one `(id, change)` per changed field.
    pub fn field_changes(&self) -> impl Iterator<Item = (i64, &FieldChange)> + '_ {
        self.to_update.iter().flat_map(|row| {
            row.changes
                .iter()
                .map(move |change| (row.line_item_id, change))
        })
    }
}

/// Line items of one invoice: the baseline loaded at session start and the
/// working set the user edits. Nothing here touches storage after `load`.
#[derive(Debug, Clone)]
pub struct Ledger {
    header: InvoiceHeader,
    baseline: Vec<LineItem>,
    working: Vec<LineItem>,
}

impl Ledger {
    /// Fetch the header and current rows of `invoice_id` and open a session.
    #[instrument(skip(store))]
    pub async fn load<S>(store: &S, invoice_id: i64) -> Result<Self, EditError>
    where
        S: InvoiceStore + ?Sized,
    {
        let header = store
            .fetch_invoice_header(invoice_id)
            .await
            .map_err(EditError::Persistence)?
            .ok_or(EditError::NotFound { invoice_id })?;

        let baseline = store
            .fetch_line_items(invoice_id)
            .await
            .map_err(EditError::Persistence)?;

        info!(line_items = baseline.len(), "Edit session opened");

        Ok(Self::new(header, baseline))
    }

    pub fn new(header: InvoiceHeader, baseline: Vec<LineItem>) -> Self {
        let working = baseline.clone();
        Self {
            header,
            baseline,
            working,
        }
    }

    pub fn invoice_id(&self) -> i64 {
        self.header.invoice_id
    }

    pub fn header(&self) -> &InvoiceHeader {
        &self.header
    }

    pub fn baseline(&self) -> &[LineItem] {
        &self.baseline
    }

    /// Current working set.
    pub fn items(&self) -> &[LineItem] {
        &self.working
    }

    pub fn get(&self, id: LineItemId) -> Option<&LineItem> {
        self.working.iter().find(|item| item.id == id)
    }

    /// Validate and append a new row with a local id.
    pub fn add(&mut self, input: LineItemInput) -> Result<&LineItem, EditError> {
        input.validate()?;

        let item = LineItem::from_input(LineItemId::new_pending(), input);
        debug!(line_item_id = %item.id, "Line item staged");
        self.working.push(item);

        Ok(&self.working[self.working.len() - 1])
    }

    /// Set one field of a working-set row. Returns `false` if the id is not
    /// in the working set. Values are checked at commit time, not here.
    pub fn update(&mut self, id: LineItemId, change: FieldChange) -> bool {
        match self.working.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                change.apply(item);
                true
            }
            None => false,
        }
    }

    /// Set a field by name from a raw form value.
    ///
    /// Unknown field names and values that cannot be coerced are ignored.
    pub fn update_field(&mut self, id: LineItemId, field: &str, raw: &str) -> bool {
        let Some(field) = LineItemField::from_name(field) else {
            debug!(field, "Ignoring update of unknown field");
            return false;
        };
        let Some(change) = FieldChange::parse(field, raw) else {
            debug!(field = field.as_str(), raw, "Ignoring value that does not coerce");
            return false;
        };
        self.update(id, change)
    }

    /// Drop a row from the working set. Persisted rows are deleted on commit;
    /// pending rows simply disappear.
    pub fn remove(&mut self, id: LineItemId) -> Option<LineItem> {
        let index = self.working.iter().position(|item| item.id == id)?;
        Some(self.working.remove(index))
    }

    /// Compare the working set against the baseline.
    pub fn diff(&self) -> LedgerDiff {
        let baseline: HashMap<i64, &LineItem> = self
            .baseline
            .iter()
            .filter_map(|item| item.id.persisted().map(|id| (id, item)))
            .collect();

        let mut diff = LedgerDiff::default();
        let mut seen = HashSet::new();

        for item in &self.working {
            match item.id {
                LineItemId::Pending(local_id) => diff.to_create.push(PendingLineItem {
                    local_id,
                    input: item.to_input(),
                }),
                LineItemId::Persisted(id) => {
                    seen.insert(id);
                    let Some(original) = baseline.get(&id) else {
                        continue;
                    };
                    let changes: Vec<FieldChange> = LineItemField::ALL
                        .into_iter()
                        .map(|field| FieldChange::read(item, field))
                        .filter(|current| *current != FieldChange::read(original, current.field()))
                        .collect();
                    if !changes.is_empty() {
                        diff.to_update.push(RowUpdate {
                            line_item_id: id,
                            changes,
                        });
                    }
                }
            }
        }

        diff.to_delete = self
            .baseline
            .iter()
            .filter_map(|item| item.id.persisted())
            .filter(|id| !seen.contains(id))
            .collect();

        diff
    }

    /// Total of the working set under the invoice's policy, before saving.
    pub fn draft_total(&self) -> Decimal {
        compute_total(&self.working, &self.header.policy())
    }
}
