//! In-process sales store with the same keys, checks and all-or-nothing writes as the SQL schema.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use salesload_core::{fits_money, line_total, FileBatch, PersistenceError, RegisterKey, SalesLine, WriteOutcome};
use tokio::sync::Mutex;

use crate::store::{log_duplicate, SalesStore, StoreCounts};

type LineKey = (String, i32, i32, i32);

#[derive(Debug, Clone)]
pub struct StoredLine {
    pub line: SalesLine,
    pub load_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    shops: BTreeSet<i32>,
    registers: BTreeSet<RegisterKey>,
    lines: BTreeMap<LineKey, StoredLine>,
}

#[derive(Debug, Default)]
pub struct MemorySalesStore {
    state: Mutex<MemoryState>,
}

impl MemorySalesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted lines ordered by idempotency key.
    pub async fn lines(&self) -> Vec<StoredLine> {
        self.state.lock().await.lines.values().cloned().collect()
    }

    pub async fn registers(&self) -> Vec<RegisterKey> {
        self.state.lock().await.registers.iter().copied().collect()
    }
}

fn constraint(name: &str, message: impl Into<String>) -> PersistenceError {
    PersistenceError::Constraint {
        constraint: name.to_string(),
        message: message.into(),
    }
}

fn check_numeric_12_2(column: &str, value: Decimal) -> Result<(), PersistenceError> {
    if !fits_money(value) {
        return Err(PersistenceError::Database(format!(
            "numeric field overflow in column {column}"
        )));
    }
    Ok(())
}

fn check_line(state: &MemoryState, line: &SalesLine) -> Result<(), PersistenceError> {
    if !state.registers.contains(&line.register()) {
        return Err(constraint(
            "sales_lines_register_fkey",
            format!("register {} does not exist", line.register()),
        ));
    }
    if line.row_num < 1 {
        return Err(constraint("sales_lines_row_num_positive", "row_num must be >= 1"));
    }
    if line.amount < 0 {
        return Err(constraint("sales_lines_amount_nonneg", "amount must be >= 0"));
    }
    check_numeric_12_2("price", line.price)?;
    check_numeric_12_2("discount", line.discount)?;
    check_numeric_12_2("line_total", line.line_total)?;
    if line.price < Decimal::ZERO {
        return Err(constraint("sales_lines_price_nonneg", "price must be >= 0"));
    }
    if line.discount < Decimal::ZERO {
        return Err(constraint("sales_lines_discount_nonneg", "discount must be >= 0"));
    }
    if line_total(line.amount, line.price, line.discount) != Some(line.line_total) {
        return Err(constraint(
            "sales_lines_line_total_derived",
            "line_total differs from round(amount * price - discount, 2)",
        ));
    }
    Ok(())
}

#[async_trait]
impl SalesStore for MemorySalesStore {
    async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn write_file(&self, batch: &FileBatch) -> Result<WriteOutcome, PersistenceError> {
        let mut guard = self.state.lock().await;
        // Work on a copy and swap it in only once every line went through.
        let mut staged = guard.clone();
        let register = batch.register;

        if register.shop_num < 0 {
            return Err(constraint("shops_shop_num_nonneg", "shop_num must be >= 0"));
        }
        if register.cash_num < 0 {
            return Err(constraint("cash_registers_cash_num_nonneg", "cash_num must be >= 0"));
        }
        staged.shops.insert(register.shop_num);
        staged.registers.insert(register);

        let load_ts = Utc::now();
        let mut outcome = WriteOutcome::default();
        for line in &batch.lines {
            check_line(&staged, line)?;
            let key: LineKey = (line.doc_id.clone(), line.shop_num, line.cash_num, line.row_num);
            if staged.lines.contains_key(&key) {
                outcome.duplicates += 1;
                log_duplicate(batch, line);
                continue;
            }
            staged.lines.insert(
                key,
                StoredLine {
                    line: line.clone(),
                    load_ts,
                },
            );
            outcome.inserted += 1;
        }

        *guard = staged;
        Ok(outcome)
    }

    async fn counts(&self) -> Result<StoreCounts, PersistenceError> {
        let state = self.state.lock().await;
        Ok(StoreCounts {
            shops: state.shops.len() as i64,
            cash_registers: state.registers.len() as i64,
            sales_lines: state.lines.len() as i64,
        })
    }
}
