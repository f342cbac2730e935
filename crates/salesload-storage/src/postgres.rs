//! PostgreSQL sales store on a `sqlx` pool.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use salesload_core::{FileBatch, PersistenceError, WriteOutcome};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, warn};

use crate::store::{log_duplicate, SalesStore, StoreCounts};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Lines per multi-row INSERT; 11 binds each keeps well under the 65535 parameter limit.
const INSERT_CHUNK: usize = 1000;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PgSalesStore {
    pool: PgPool,
}

impl PgSalesStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|err| PersistenceError::Connection(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        batch: &FileBatch,
    ) -> Result<WriteOutcome, PersistenceError> {
        sqlx::query("INSERT INTO shops (shop_num) VALUES ($1) ON CONFLICT (shop_num) DO NOTHING")
            .bind(batch.register.shop_num)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::query(
            "INSERT INTO cash_registers (shop_num, cash_num) VALUES ($1, $2) \
             ON CONFLICT (shop_num, cash_num) DO NOTHING",
        )
        .bind(batch.register.shop_num)
        .bind(batch.register.cash_num)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        // Row numbers are unique within one batch, so they identify the inserted lines.
        let mut inserted: HashSet<i32> = HashSet::with_capacity(batch.lines.len());
        for chunk in batch.lines.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO sales_lines (doc_id, shop_num, cash_num, row_num, item, category, \
                 amount, price, discount, line_total, source_file) ",
            );
            qb.push_values(chunk, |mut b, line| {
                b.push_bind(line.doc_id.clone())
                    .push_bind(line.shop_num)
                    .push_bind(line.cash_num)
                    .push_bind(line.row_num)
                    .push_bind(line.item.clone())
                    .push_bind(line.category.clone())
                    .push_bind(line.amount)
                    .push_bind(line.price)
                    .push_bind(line.discount)
                    .push_bind(line.line_total)
                    .push_bind(line.source_file.clone());
            });
            qb.push(" ON CONFLICT ON CONSTRAINT uniq_doc_row DO NOTHING RETURNING row_num");

            let rows: Vec<i32> = qb
                .build_query_scalar()
                .fetch_all(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
            inserted.extend(rows);
        }

        let mut outcome = WriteOutcome::default();
        for line in &batch.lines {
            if inserted.contains(&line.row_num) {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
                log_duplicate(batch, line);
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl SalesStore for PgSalesStore {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| PersistenceError::Schema(err.to_string()))
    }

    async fn write_file(&self, batch: &FileBatch) -> Result<WriteOutcome, PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        match Self::write_in_tx(&mut tx, batch).await {
            Ok(outcome) => {
                tx.commit().await.map_err(map_sqlx_error)?;
                debug!(
                    source_file = %batch.source_file,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    "transaction committed"
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(source_file = %batch.source_file, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn counts(&self) -> Result<StoreCounts, PersistenceError> {
        let (shops, cash_registers, sales_lines): (i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM shops), \
                    (SELECT COUNT(*) FROM cash_registers), \
                    (SELECT COUNT(*) FROM sales_lines)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(StoreCounts {
            shops,
            cash_registers,
            sales_lines,
        })
    }
}

fn map_sqlx_error(err: sqlx::Error) -> PersistenceError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.constraint() {
            Some(constraint) => PersistenceError::Constraint {
                constraint: constraint.to_string(),
                message: db_err.message().to_string(),
            },
            None => PersistenceError::Database(err.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => PersistenceError::Connection(err.to_string()),
        _ => PersistenceError::Database(err.to_string()),
    }
}
