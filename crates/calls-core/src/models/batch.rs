//! Normalized tabular batch
//!
//! Every row carries exactly one cell per batch column, in column order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use super::schema::{ColumnSpec, ColumnType, TableSchema};

/// Typed value of one output cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Absent or unparseable
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Nested value passed through verbatim
    Json(Value),
}

impl CellValue {
    /// Pass-through mapping of a raw JSON value
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Int(i),
                None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null),
            },
            Value::String(s) => CellValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => CellValue::Json(value.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Column type this cell would be stored as
    pub fn inferred_type(&self) -> Option<ColumnType> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(_) => Some(ColumnType::Boolean),
            CellValue::Int(_) => Some(ColumnType::Integer),
            CellValue::Float(_) => Some(ColumnType::Float),
            CellValue::Text(_) | CellValue::Json(_) => Some(ColumnType::String),
            CellValue::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    /// Text rendering for STRING columns; `None` for null
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Text(s) => Some(s.clone()),
            CellValue::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            CellValue::Json(v) => Some(v.to_string()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Float(f) => Some(*f),
            CellValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            CellValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Row-JSON encoding for warehouse load files
    ///
    /// Timestamps become RFC 3339 UTC strings and nested values are flattened
    /// to compact JSON text so they fit a STRING column.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int(i) => Value::Number((*i).into()),
            CellValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Timestamp(_) | CellValue::Json(_) => {
                self.as_text().map(Value::String).unwrap_or(Value::Null)
            }
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

/// One call after normalization
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedRow {
    cells: Vec<CellValue>,
}

impl NormalizedRow {
    pub fn new(cells: Vec<CellValue>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[CellValue] {
        &self.cells
    }

    pub fn get(&self, index: usize) -> Option<&CellValue> {
        self.cells.get(index)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Ordered rows sharing one column list
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultBatch {
    columns: Vec<String>,
    rows: Vec<NormalizedRow>,
}

impl ResultBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_capacity(columns: Vec<String>, rows: usize) -> Self {
        Self {
            columns,
            rows: Vec::with_capacity(rows),
        }
    }

    /// Append a row; its cells must line up with the batch columns
    pub fn push_row(&mut self, row: NormalizedRow) {
        debug_assert_eq!(row.len(), self.columns.len(), "row/column mismatch");
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[NormalizedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell at (`row`, column `name`)
    pub fn cell(&self, row: usize, name: &str) -> Option<&CellValue> {
        let index = self.column_index(name)?;
        self.rows.get(row)?.get(index)
    }

    /// Schema inferred from the cells themselves
    ///
    /// A column takes the type of its non-null cells when they all agree;
    /// all-null and mixed columns fall back to STRING (integers mixed with
    /// floats widen to FLOAT).
    pub fn inferred_schema(&self) -> TableSchema {
        let columns = self
            .columns
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let mut inferred: Option<ColumnType> = None;
                for cell_type in self
                    .rows
                    .iter()
                    .filter_map(|r| r.get(index))
                    .filter_map(CellValue::inferred_type)
                {
                    inferred = Some(match inferred {
                        None => cell_type,
                        Some(current) if current == cell_type => current,
                        Some(ColumnType::Integer) if cell_type == ColumnType::Float => {
                            ColumnType::Float
                        }
                        Some(ColumnType::Float) if cell_type == ColumnType::Integer => {
                            ColumnType::Float
                        }
                        Some(_) => ColumnType::String,
                    });
                }
                ColumnSpec::new(name.clone(), inferred.unwrap_or(ColumnType::String))
            })
            .collect();

        TableSchema::new("inferred", columns)
    }

    /// Row as a JSON object keyed by column name
    pub fn row_json(&self, row: &NormalizedRow) -> serde_json::Map<String, Value> {
        self.columns
            .iter()
            .zip(row.cells())
            .map(|(name, cell)| (name.clone(), cell.to_json()))
            .collect()
    }
}
