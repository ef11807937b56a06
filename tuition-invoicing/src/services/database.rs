//! PostgreSQL implementation of the invoice store.

use crate::models::{
    FieldChange, InvoiceHeader, InvoiceHeaderUpdate, LineItem, LineItemInput, LineItemRecord,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{InvoiceStore, StoreError, StoreTransaction, TransactionalStore};
use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument};

const HEADER_COLUMNS: &str = "invoice_id, kind, party_id, invoice_date, total, status, \
     minimum_lessons_enforced, minimum_lesson_count, created_utc";

const LINE_ITEM_COLUMNS: &str = "line_item_id, invoice_id, description, period, lesson_count, \
     duration, rate, contract_id, student_subject_id, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "tuition-invoicing"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Queries, shared by the pool and by open transactions
// -------------------------------------------------------------------------

async fn select_header<'e, E>(
    executor: E,
    invoice_id: i64,
) -> Result<Option<InvoiceHeader>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let timer = DB_QUERY_DURATION
        .with_label_values(&["fetch_invoice_header"])
        .start_timer();

    let header = sqlx::query_as::<_, InvoiceHeader>(&format!(
        "SELECT {} FROM invoices WHERE invoice_id = $1",
        HEADER_COLUMNS
    ))
    .bind(invoice_id)
    .fetch_optional(executor)
    .await?;

    timer.observe_duration();

    Ok(header)
}

async fn select_line_items<'e, E>(executor: E, invoice_id: i64) -> Result<Vec<LineItem>, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let timer = DB_QUERY_DURATION
        .with_label_values(&["fetch_line_items"])
        .start_timer();

    let records = sqlx::query_as::<_, LineItemRecord>(&format!(
        "SELECT {} FROM invoice_line_items WHERE invoice_id = $1 ORDER BY line_item_id",
        LINE_ITEM_COLUMNS
    ))
    .bind(invoice_id)
    .fetch_all(executor)
    .await?;

    timer.observe_duration();

    Ok(records.into_iter().map(LineItem::from).collect())
}

async fn insert_line_item<'e, E>(
    executor: E,
    invoice_id: i64,
    input: &LineItemInput,
) -> Result<LineItem, StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let timer = DB_QUERY_DURATION
        .with_label_values(&["create_line_item"])
        .start_timer();

    let record = sqlx::query_as::<_, LineItemRecord>(&format!(
        r#"
        INSERT INTO invoice_line_items (
            invoice_id, description, period, lesson_count, duration, rate,
            contract_id, student_subject_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        LINE_ITEM_COLUMNS
    ))
    .bind(invoice_id)
    .bind(&input.description)
    .bind(&input.period)
    .bind(input.lesson_count)
    .bind(input.duration.map(|d| d.as_str()))
    .bind(input.rate)
    .bind(input.contract_id)
    .bind(input.student_subject_id)
    .fetch_one(executor)
    .await?;

    timer.observe_duration();

    info!(line_item_id = record.line_item_id, invoice_id, "Line item created");

    Ok(LineItem::from(record))
}

/// `UPDATE` setting every changed column of one row of one invoice.
fn line_item_update_query(
    invoice_id: i64,
    line_item_id: i64,
    changes: &[FieldChange],
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new("UPDATE invoice_line_items SET ");
    let mut columns = builder.separated(", ");
    for change in changes {
        columns.push(format!("{} = ", change.field().as_str()));
        match change {
            FieldChange::Description(v) | FieldChange::Period(v) => {
                columns.push_bind_unseparated(v.clone())
            }
            FieldChange::LessonCount(v) | FieldChange::Rate(v) => columns.push_bind_unseparated(*v),
            FieldChange::Duration(v) => {
                columns.push_bind_unseparated(v.map(|d| d.as_str().to_string()))
            }
            FieldChange::ContractId(v) | FieldChange::StudentSubjectId(v) => {
                columns.push_bind_unseparated(*v)
            }
        };
    }
    builder.push(" WHERE line_item_id = ");
    builder.push_bind(line_item_id);
    builder.push(" AND invoice_id = ");
    builder.push_bind(invoice_id);
    builder
}

const DELETE_LINE_ITEM_SQL: &str =
    "DELETE FROM invoice_line_items WHERE line_item_id = $1 AND invoice_id = $2";

const UPDATE_HEADER_SQL: &str = r#"
        UPDATE invoices
        SET invoice_date = COALESCE($2, invoice_date),
            total = COALESCE($3, total)
        WHERE invoice_id = $1
        "#;

async fn update_line_item_columns<'e, E>(
    executor: E,
    invoice_id: i64,
    line_item_id: i64,
    changes: &[FieldChange],
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    if changes.is_empty() {
        return Ok(());
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["update_line_item"])
        .start_timer();

    let mut builder = line_item_update_query(invoice_id, line_item_id, changes);
    let result = builder.build().execute(executor).await?;

    timer.observe_duration();

    if result.rows_affected() == 0 {
        return Err(StoreError::line_item_not_found(line_item_id));
    }

    Ok(())
}

async fn delete_line_item_row<'e, E>(
    executor: E,
    invoice_id: i64,
    line_item_id: i64,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    let timer = DB_QUERY_DURATION
        .with_label_values(&["delete_line_item"])
        .start_timer();

    let result = sqlx::query(DELETE_LINE_ITEM_SQL)
        .bind(line_item_id)
        .bind(invoice_id)
        .execute(executor)
        .await?;

    timer.observe_duration();

    if result.rows_affected() == 0 {
        return Err(StoreError::line_item_not_found(line_item_id));
    }

    Ok(())
}

async fn update_header_columns<'e, E>(
    executor: E,
    invoice_id: i64,
    update: &InvoiceHeaderUpdate,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    if update.is_empty() {
        return Ok(());
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["update_invoice_header"])
        .start_timer();

    let result = sqlx::query(UPDATE_HEADER_SQL)
        .bind(invoice_id)
        .bind(update.invoice_date)
        .bind(update.total)
        .execute(executor)
        .await?;

    timer.observe_duration();

    if result.rows_affected() == 0 {
        return Err(StoreError::invoice_not_found(invoice_id));
    }

    Ok(())
}

#[async_trait]
impl InvoiceStore for Database {
    #[instrument(skip(self))]
    async fn fetch_invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, StoreError> {
        select_header(&self.pool, invoice_id).await
    }

    #[instrument(skip(self))]
    async fn fetch_line_items(&self, invoice_id: i64) -> Result<Vec<LineItem>, StoreError> {
        select_line_items(&self.pool, invoice_id).await
    }

    #[instrument(skip(self, input))]
    async fn create_line_item(
        &self,
        invoice_id: i64,
        input: &LineItemInput,
    ) -> Result<LineItem, StoreError> {
        insert_line_item(&self.pool, invoice_id, input).await
    }

    #[instrument(skip(self, changes), fields(fields = changes.len()))]
    async fn update_line_item(
        &self,
        invoice_id: i64,
        line_item_id: i64,
        changes: &[FieldChange],
    ) -> Result<(), StoreError> {
        update_line_item_columns(&self.pool, invoice_id, line_item_id, changes).await
    }

    #[instrument(skip(self))]
    async fn delete_line_item(&self, invoice_id: i64, line_item_id: i64) -> Result<(), StoreError> {
        delete_line_item_row(&self.pool, invoice_id, line_item_id).await
    }

    #[instrument(skip(self))]
    async fn update_invoice_header(
        &self,
        invoice_id: i64,
        update: &InvoiceHeaderUpdate,
    ) -> Result<(), StoreError> {
        update_header_columns(&self.pool, invoice_id, update).await
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for Database {
    type Transaction = PgStoreTransaction;

    async fn begin(&self) -> Result<PgStoreTransaction, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgStoreTransaction { tx: Mutex::new(tx) })
    }
}

/// Store calls running inside one PostgreSQL transaction.
pub struct PgStoreTransaction {
    tx: Mutex<Transaction<'static, Postgres>>,
}

#[async_trait]
impl InvoiceStore for PgStoreTransaction {
    async fn fetch_invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, StoreError> {
        let mut tx = self.tx.lock().await;
        select_header(&mut **tx, invoice_id).await
    }

    async fn fetch_line_items(&self, invoice_id: i64) -> Result<Vec<LineItem>, StoreError> {
        let mut tx = self.tx.lock().await;
        select_line_items(&mut **tx, invoice_id).await
    }

    async fn create_line_item(
        &self,
        invoice_id: i64,
        input: &LineItemInput,
    ) -> Result<LineItem, StoreError> {
        let mut tx = self.tx.lock().await;
        insert_line_item(&mut **tx, invoice_id, input).await
    }

    async fn update_line_item(
        &self,
        invoice_id: i64,
        line_item_id: i64,
        changes: &[FieldChange],
    ) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        update_line_item_columns(&mut **tx, invoice_id, line_item_id, changes).await
    }

    async fn delete_line_item(&self, invoice_id: i64, line_item_id: i64) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        delete_line_item_row(&mut **tx, invoice_id, line_item_id).await
    }

    async fn update_invoice_header(
        &self,
        invoice_id: i64,
        update: &InvoiceHeaderUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.tx.lock().await;
        update_header_columns(&mut **tx, invoice_id, update).await
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.into_inner().rollback().await?;
        Ok(())
    }
}
