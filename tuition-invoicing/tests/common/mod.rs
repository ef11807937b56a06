//! Common test utilities for tuition-invoicing integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use tuition_invoicing::models::{
    FieldChange, InvoiceHeader, InvoiceHeaderUpdate, InvoiceKind, InvoiceStatus, LineItem,
    LineItemId, LineItemInput,
};
use tuition_invoicing::services::{
    InvoiceStore, StoreError, StoreTransaction, TransactionalStore,
};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,tuition_invoicing=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A storage call as seen by the store double.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    FetchHeader(i64),
    FetchLineItems(i64),
    Create { invoice_id: i64, description: String },
    Update(i64),
    Delete(i64),
    UpdateDate(i64),
    UpdateTotal { invoice_id: i64, total: Decimal },
    Begin,
    Commit,
    Rollback,
}

impl Call {
    /// Whether the call changes line items.
    pub fn is_line_item_write(&self) -> bool {
        matches!(self, Call::Create { .. } | Call::Update(_) | Call::Delete(_))
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    headers: BTreeMap<i64, InvoiceHeader>,
    /// line_item_id -> (invoice_id, row)
    items: BTreeMap<i64, (i64, LineItem)>,
    next_line_item_id: i64,
}

#[derive(Debug, Default)]
struct Faults {
    updates: HashSet<i64>,
    deletes: HashSet<i64>,
    creates: HashSet<String>,
    date_update: bool,
    total_update: bool,
    begin: bool,
    health: bool,
}

#[derive(Debug, Default)]
struct Inner {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<Call>>,
}

fn injected(what: &str) -> StoreError {
    StoreError::Backend(anyhow::anyhow!("injected {} failure", what))
}

impl Inner {
    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn fetch_header(&self, tables: &Tables, invoice_id: i64) -> Option<InvoiceHeader> {
        self.log(Call::FetchHeader(invoice_id));
        tables.headers.get(&invoice_id).cloned()
    }

    fn fetch_items(&self, tables: &Tables, invoice_id: i64) -> Vec<LineItem> {
        self.log(Call::FetchLineItems(invoice_id));
        tables
            .items
            .values()
            .filter(|(owner, _)| *owner == invoice_id)
            .map(|(_, item)| item.clone())
            .collect()
    }

    fn create(
        &self,
        tables: &mut Tables,
        invoice_id: i64,
        input: &LineItemInput,
    ) -> Result<LineItem, StoreError> {
        self.log(Call::Create {
            invoice_id,
            description: input.description.clone(),
        });
        if self.faults.lock().unwrap().creates.contains(&input.description) {
            return Err(injected("create"));
        }
        if !tables.headers.contains_key(&invoice_id) {
            return Err(StoreError::invoice_not_found(invoice_id));
        }
        tables.next_line_item_id += 1;
        let id = tables.next_line_item_id;
        let item = LineItem::from_input(LineItemId::Persisted(id), input.clone());
        tables.items.insert(id, (invoice_id, item.clone()));
        Ok(item)
    }

    fn update(
        &self,
        tables: &mut Tables,
        invoice_id: i64,
        line_item_id: i64,
        changes: &[FieldChange],
    ) -> Result<(), StoreError> {
        self.log(Call::Update(line_item_id));
        if self.faults.lock().unwrap().updates.contains(&line_item_id) {
            return Err(injected("update"));
        }
        let (_, item) = tables
            .items
            .get_mut(&line_item_id)
            .filter(|(owner, _)| *owner == invoice_id)
            .ok_or_else(|| StoreError::line_item_not_found(line_item_id))?;
        for change in changes {
            change.apply(item);
        }
        Ok(())
    }

    fn delete(
        &self,
        tables: &mut Tables,
        invoice_id: i64,
        line_item_id: i64,
    ) -> Result<(), StoreError> {
        self.log(Call::Delete(line_item_id));
        if self.faults.lock().unwrap().deletes.contains(&line_item_id) {
            return Err(injected("delete"));
        }
        let owned = matches!(
            tables.items.get(&line_item_id),
            Some((owner, _)) if *owner == invoice_id
        );
        if !owned {
            return Err(StoreError::line_item_not_found(line_item_id));
        }
        tables.items.remove(&line_item_id);
        Ok(())
    }

    fn update_header(
        &self,
        tables: &mut Tables,
        invoice_id: i64,
        update: &InvoiceHeaderUpdate,
    ) -> Result<(), StoreError> {
        if update.invoice_date.is_some() {
            self.log(Call::UpdateDate(invoice_id));
            if self.faults.lock().unwrap().date_update {
                return Err(injected("date update"));
            }
        }
        if let Some(total) = update.total {
            self.log(Call::UpdateTotal { invoice_id, total });
            if self.faults.lock().unwrap().total_update {
                return Err(injected("total update"));
            }
        }
        let header = tables
            .headers
            .get_mut(&invoice_id)
            .ok_or_else(|| StoreError::invoice_not_found(invoice_id))?;
        if let Some(date) = update.invoice_date {
            header.invoice_date = date;
        }
        if let Some(total) = update.total {
            header.total = total;
        }
        Ok(())
    }
}

/// In-memory invoice store with a call log and per-operation fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invoice(self, header: InvoiceHeader) -> Self {
        self.inner
            .tables
            .lock()
            .unwrap()
            .headers
            .insert(header.invoice_id, header);
        self
    }

    /// Seed a persisted row; its id must be `LineItemId::Persisted`.
    pub fn with_item(self, invoice_id: i64, item: LineItem) -> Self {
        let id = item.id.persisted().expect("seeded items must be persisted");
        {
            let mut tables = self.inner.tables.lock().unwrap();
            tables.next_line_item_id = tables.next_line_item_id.max(id);
            tables.items.insert(id, (invoice_id, item));
        }
        self
    }

    pub fn fail_update(&self, line_item_id: i64) {
        self.inner.faults.lock().unwrap().updates.insert(line_item_id);
    }

    pub fn fail_delete(&self, line_item_id: i64) {
        self.inner.faults.lock().unwrap().deletes.insert(line_item_id);
    }

    pub fn fail_create(&self, description: &str) {
        self.inner
            .faults
            .lock()
            .unwrap()
            .creates
            .insert(description.to_string());
    }

    pub fn fail_date_update(&self) {
        self.inner.faults.lock().unwrap().date_update = true;
    }

    pub fn fail_total_update(&self) {
        self.inner.faults.lock().unwrap().total_update = true;
    }

    pub fn fail_begin(&self) {
        self.inner.faults.lock().unwrap().begin = true;
    }

    pub fn fail_health(&self) {
        self.inner.faults.lock().unwrap().health = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().unwrap().clear();
    }

    /// Stored header, read without touching the call log.
    pub fn header(&self, invoice_id: i64) -> Option<InvoiceHeader> {
        self.inner.tables.lock().unwrap().headers.get(&invoice_id).cloned()
    }

    /// Stored rows of an invoice, read without touching the call log.
    pub fn items(&self, invoice_id: i64) -> Vec<LineItem> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .items
            .values()
            .filter(|(owner, _)| *owner == invoice_id)
            .map(|(_, item)| item.clone())
            .collect()
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn fetch_invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, StoreError> {
        let tables = self.inner.tables.lock().unwrap();
        Ok(self.inner.fetch_header(&tables, invoice_id))
    }

    async fn fetch_line_items(&self, invoice_id: i64) -> Result<Vec<LineItem>, StoreError> {
        let tables = self.inner.tables.lock().unwrap();
        Ok(self.inner.fetch_items(&tables, invoice_id))
    }

    async fn create_line_item(
        &self,
        invoice_id: i64,
        input: &LineItemInput,
    ) -> Result<LineItem, StoreError> {
        let mut tables = self.inner.tables.lock().unwrap();
        self.inner.create(&mut tables, invoice_id, input)
    }

    async fn update_line_item(
        &self,
        invoice_id: i64,
        line_item_id: i64,
        changes: &[FieldChange],
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.lock().unwrap();
        self.inner.update(&mut tables, invoice_id, line_item_id, changes)
    }

    async fn delete_line_item(&self, invoice_id: i64, line_item_id: i64) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.lock().unwrap();
        self.inner.delete(&mut tables, invoice_id, line_item_id)
    }

    async fn update_invoice_header(
        &self,
        invoice_id: i64,
        update: &InvoiceHeaderUpdate,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.lock().unwrap();
        self.inner.update_header(&mut tables, invoice_id, update)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        if self.inner.faults.lock().unwrap().health {
            return Err(injected("health"));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        self.inner.log(Call::Begin);
        if self.inner.faults.lock().unwrap().begin {
            return Err(injected("begin"));
        }
        let staged = self.inner.tables.lock().unwrap().clone();
        Ok(MemoryTransaction {
            inner: self.inner.clone(),
            staged: Mutex::new(staged),
        })
    }
}

/// Writes go to a private copy of the tables until `commit`.
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    staged: Mutex<Tables>,
}

#[async_trait]
impl InvoiceStore for MemoryTransaction {
    async fn fetch_invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, StoreError> {
        let tables = self.staged.lock().unwrap();
        Ok(self.inner.fetch_header(&tables, invoice_id))
    }

    async fn fetch_line_items(&self, invoice_id: i64) -> Result<Vec<LineItem>, StoreError> {
        let tables = self.staged.lock().unwrap();
        Ok(self.inner.fetch_items(&tables, invoice_id))
    }

    async fn create_line_item(
        &self,
        invoice_id: i64,
        input: &LineItemInput,
    ) -> Result<LineItem, StoreError> {
        let mut tables = self.staged.lock().unwrap();
        self.inner.create(&mut tables, invoice_id, input)
    }

    async fn update_line_item(
        &self,
        invoice_id: i64,
        line_item_id: i64,
        changes: &[FieldChange],
    ) -> Result<(), StoreError> {
        let mut tables = self.staged.lock().unwrap();
        self.inner.update(&mut tables, invoice_id, line_item_id, changes)
    }

    async fn delete_line_item(&self, invoice_id: i64, line_item_id: i64) -> Result<(), StoreError> {
        let mut tables = self.staged.lock().unwrap();
        self.inner.delete(&mut tables, invoice_id, line_item_id)
    }

    async fn update_invoice_header(
        &self,
        invoice_id: i64,
        update: &InvoiceHeaderUpdate,
    ) -> Result<(), StoreError> {
        let mut tables = self.staged.lock().unwrap();
        self.inner.update_header(&mut tables, invoice_id, update)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.inner.log(Call::Commit);
        let staged = self.staged.into_inner().unwrap();
        *self.inner.tables.lock().unwrap() = staged;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.log(Call::Rollback);
        Ok(())
    }
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Receivable header; `minimum` enables the lesson floor when set.
pub fn receivable(invoice_id: i64, minimum: Option<i32>) -> InvoiceHeader {
    InvoiceHeader {
        invoice_id,
        kind: InvoiceKind::Receivable,
        party_id: 7,
        invoice_date: date(2024, 3, 1),
        total: Decimal::ZERO,
        status: InvoiceStatus::Active,
        minimum_lessons_enforced: minimum.is_some(),
        minimum_lesson_count: minimum,
        created_utc: Utc::now(),
    }
}

pub fn payable(invoice_id: i64) -> InvoiceHeader {
    InvoiceHeader {
        kind: InvoiceKind::Payable,
        party_id: 11,
        ..receivable(invoice_id, None)
    }
}

pub fn input(description: &str, lesson_count: Decimal, rate: Decimal) -> LineItemInput {
    LineItemInput {
        description: description.to_string(),
        period: "March 2024".to_string(),
        lesson_count,
        duration: None,
        rate,
        contract_id: None,
        student_subject_id: None,
    }
}

pub fn item(id: i64, description: &str, lesson_count: Decimal, rate: Decimal) -> LineItem {
    LineItem::from_input(
        LineItemId::Persisted(id),
        input(description, lesson_count, rate),
    )
}
