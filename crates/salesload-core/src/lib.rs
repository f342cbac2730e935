//! Core domain model for the sales loader: register identity, sales lines and file errors.

use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header columns every sales file must carry (after normalisation).
pub const REQUIRED_COLUMNS: [&str; 6] = ["doc_id", "item", "category", "amount", "price", "discount"];

pub const DEFAULT_EXTENSION: &str = "csv";

/// Fractional digits kept for money columns.
pub const MONEY_SCALE: u32 = 2;

/// Exclusive bound on the absolute value of a `NUMERIC(12,2)` column.
pub const MONEY_LIMIT: i64 = 10_000_000_000;

/// Whether `value` fits a `NUMERIC(12,2)` column once rounded to [`MONEY_SCALE`].
pub fn fits_money(value: Decimal) -> bool {
    value.abs() < Decimal::from(MONEY_LIMIT)
}

/// A cash register, identified by the shop it belongs to and its number within the shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterKey {
    pub shop_num: i32,
    pub cash_num: i32,
}

impl RegisterKey {
    pub fn new(shop_num: i32, cash_num: i32) -> Self {
        Self { shop_num, cash_num }
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shop {} / cash {}", self.shop_num, self.cash_num)
    }
}

/// Result of matching a file name against `<shop_num>_<cash_num>.<ext>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Matched(RegisterKey),
    Unmatched,
}

/// Classify a bare file name. The extension comparison ignores ASCII case;
/// both numbers must be plain decimal digits that fit in an `i32`.
pub fn classify_filename(name: &str, extension: &str) -> FileClass {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return FileClass::Unmatched;
    };
    if !ext.eq_ignore_ascii_case(extension.trim_start_matches('.')) {
        return FileClass::Unmatched;
    }
    let Some((shop, cash)) = stem.split_once('_') else {
        return FileClass::Unmatched;
    };
    match (parse_digits(shop), parse_digits(cash)) {
        (Some(shop_num), Some(cash_num)) => FileClass::Matched(RegisterKey::new(shop_num, cash_num)),
        _ => FileClass::Unmatched,
    }
}

fn parse_digits(text: &str) -> Option<i32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// `round(amount * price - discount, 2)`, rounding half away from zero like SQL `ROUND(numeric, 2)`.
/// `None` when the arithmetic overflows `Decimal`.
pub fn line_total(amount: i32, price: Decimal, discount: Decimal) -> Option<Decimal> {
    Decimal::from(amount)
        .checked_mul(price)?
        .checked_sub(discount)
        .map(|total| total.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero))
}

/// Fully populated sales line ready for persistence. `load_ts` is stamped by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesLine {
    pub doc_id: String,
    pub shop_num: i32,
    pub cash_num: i32,
    pub row_num: i32,
    pub item: String,
    pub category: String,
    pub amount: i32,
    pub price: Decimal,
    pub discount: Decimal,
    pub line_total: Decimal,
    pub source_file: String,
}

impl SalesLine {
    pub fn register(&self) -> RegisterKey {
        RegisterKey::new(self.shop_num, self.cash_num)
    }

    /// Idempotency key: `(doc_id, shop_num, cash_num, row_num)`.
    pub fn key(&self) -> (&str, i32, i32, i32) {
        (&self.doc_id, self.shop_num, self.cash_num, self.row_num)
    }
}

/// Everything one file contributes to storage, written in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBatch {
    pub register: RegisterKey,
    pub source_file: String,
    pub lines: Vec<SalesLine>,
}

/// Counts produced by writing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("storage connection failed: {0}")]
    Connection(String),
    #[error("constraint `{constraint}` violated: {message}")]
    Constraint { constraint: String, message: String },
    #[error("schema provisioning failed: {0}")]
    Schema(String),
    #[error("database error: {0}")]
    Database(String),
}

/// Every way a single file can fail. All variants reject the file; none aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    #[error("file name {name:?} does not match <shop_num>_<cash_num>.{extension}")]
    Naming { name: String, extension: String },
    #[error("unreadable input: {0}")]
    Read(String),
    #[error("missing required columns: {}", missing.join(", "))]
    Schema { missing: Vec<String> },
    #[error("column `{column}` row {row}: cannot convert {value:?} to {expected}")]
    Coercion {
        column: String,
        row: usize,
        value: String,
        expected: &'static str,
    },
    #[error("column `{column}` row {row}: {reason}")]
    Validation {
        column: String,
        row: usize,
        reason: String,
    },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("internal failure while loading file: {0}")]
    Internal(String),
}

impl FileError {
    /// Stable label used in logs and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Naming { .. } => "naming",
            Self::Read(_) => "read",
            Self::Schema { .. } => "schema",
            Self::Coercion { .. } => "coercion",
            Self::Validation { .. } => "validation",
            Self::Persistence(_) => "persistence",
            Self::Internal(_) => "internal",
        }
    }
}
