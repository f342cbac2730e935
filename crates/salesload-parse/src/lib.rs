//! Sales CSV validation: header normalisation, numeric coercion, business rules and derived fields.
//!
//! Validation is file-granular. The first problem found rejects the whole file,
//! so callers either get every line of the file or an error.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use salesload_core::{fits_money, line_total, FileError, RegisterKey, SalesLine, MONEY_SCALE, REQUIRED_COLUMNS};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Lower-cases and trims a header cell so `" Doc_ID "` and `doc_id` are the same column.
pub fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Positions of the required columns inside a source header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    doc_id: usize,
    item: usize,
    category: usize,
    amount: usize,
    price: usize,
    discount: usize,
}

impl ColumnMap {
    /// Resolve required columns by normalised name. Extra columns are ignored and the
    /// first occurrence wins when a name repeats.
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = &'a str>) -> Result<Self, FileError> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        for (idx, header) in headers.into_iter().enumerate() {
            positions.entry(normalize_header(header)).or_insert(idx);
        }

        let missing = REQUIRED_COLUMNS
            .iter()
            .filter(|name| !positions.contains_key(**name))
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(FileError::Schema { missing });
        }

        Ok(Self {
            doc_id: positions["doc_id"],
            item: positions["item"],
            category: positions["category"],
            amount: positions["amount"],
            price: positions["price"],
            discount: positions["discount"],
        })
    }
}

/// A row after type coercion, before business rules.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TypedRow {
    doc_id: String,
    item: String,
    category: String,
    amount: i32,
    price: Decimal,
    discount: Decimal,
}

/// Turn the raw bytes of one sales file into persistence-ready lines.
///
/// `register` comes from the file name and `source_file` is recorded on every line
/// as provenance. Row numbers are the 1-based position of the row in the file.
pub fn transform_sales_file(
    bytes: &[u8],
    register: RegisterKey,
    source_file: &str,
) -> Result<Vec<SalesLine>, FileError> {
    let rows = read_typed_rows(bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes))?;
    validate_rows(&rows)?;

    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| {
            let row_num = i32::try_from(idx + 1).map_err(|_| FileError::Validation {
                column: "row_num".to_string(),
                row: idx + 1,
                reason: "file has more rows than a row number can hold".to_string(),
            })?;
            let total = line_total(row.amount, row.price, row.discount)
                .filter(|total| fits_money(*total))
                .ok_or_else(|| out_of_range("line_total", idx + 1))?;
            Ok(SalesLine {
                line_total: total,
                doc_id: row.doc_id,
                shop_num: register.shop_num,
                cash_num: register.cash_num,
                row_num,
                item: row.item,
                category: row.category,
                amount: row.amount,
                price: row.price,
                discount: row.discount,
                source_file: source_file.to_string(),
            })
        })
        .collect()
}

fn read_typed_rows(bytes: &[u8]) -> Result<Vec<TypedRow>, FileError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers = reader.headers().map_err(read_error)?.clone();
    let columns = ColumnMap::from_headers(headers.iter())?;

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(read_error)?;
        let row = idx + 1;
        let cell = |pos: usize| record.get(pos).unwrap_or_default();
        rows.push(TypedRow {
            doc_id: cell(columns.doc_id).to_string(),
            item: cell(columns.item).to_string(),
            category: cell(columns.category).to_string(),
            amount: coerce_amount(cell(columns.amount), row)?,
            price: coerce_money("price", cell(columns.price), row)?,
            discount: coerce_money("discount", cell(columns.discount), row)?,
        });
    }
    Ok(rows)
}

fn read_error(err: csv::Error) -> FileError {
    FileError::Read(err.to_string())
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .ok()
        .or_else(|| Decimal::from_scientific(text).ok())
}

fn coerce_amount(raw: &str, row: usize) -> Result<i32, FileError> {
    let fail = || FileError::Coercion {
        column: "amount".to_string(),
        row,
        value: raw.to_string(),
        expected: "integer",
    };
    if let Ok(value) = raw.trim().parse::<i32>() {
        return Ok(value);
    }
    let value = parse_decimal(raw).ok_or_else(fail)?;
    if !value.fract().is_zero() {
        return Err(fail());
    }
    value.to_i32().ok_or_else(fail)
}

fn coerce_money(column: &str, raw: &str, row: usize) -> Result<Decimal, FileError> {
    parse_decimal(raw)
        .map(|value| value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero))
        .ok_or_else(|| FileError::Coercion {
            column: column.to_string(),
            row,
            value: raw.to_string(),
            expected: "decimal",
        })
}

fn validate_rows(rows: &[TypedRow]) -> Result<(), FileError> {
    for (idx, row) in rows.iter().enumerate() {
        let row_no = idx + 1;
        for (column, value) in [
            ("doc_id", &row.doc_id),
            ("item", &row.item),
            ("category", &row.category),
        ] {
            if value.trim().is_empty() {
                return Err(FileError::Validation {
                    column: column.to_string(),
                    row: row_no,
                    reason: "value is blank".to_string(),
                });
            }
        }
        if row.amount < 0 {
            return Err(negative("amount", row_no, row.amount.to_string()));
        }
        if row.price < Decimal::ZERO {
            return Err(negative("price", row_no, row.price.to_string()));
        }
        if row.discount < Decimal::ZERO {
            return Err(negative("discount", row_no, row.discount.to_string()));
        }
        if !fits_money(row.price) {
            return Err(out_of_range("price", row_no));
        }
        if !fits_money(row.discount) {
            return Err(out_of_range("discount", row_no));
        }
    }
    Ok(())
}

fn negative(column: &str, row: usize, value: String) -> FileError {
    FileError::Validation {
        column: column.to_string(),
        row,
        reason: format!("negative value {value} is not allowed"),
    }
}

fn out_of_range(column: &str, row: usize) -> FileError {
    FileError::Validation {
        column: column.to_string(),
        row,
        reason: "value does not fit 10 integer and 2 fractional digits".to_string(),
    }
}
