//! Record normalizer
//!
//! Turns raw call records into a `ResultBatch`: the `employees` list is
//! flattened into four joined-string columns, timestamps are read in the
//! report time zone and stored as UTC, and `talk_duration` becomes an
//! integer. A value that cannot be coerced becomes a null cell; rows are
//! never dropped.

use calls_core::config::{ColumnSetMode, ReportConfig};
use calls_core::models::{
    CallRecord, CellValue, ColumnType, NormalizedRow, ResultBatch, TableSchema, EMPLOYEES_FIELD,
    EMPLOYEE_SUBFIELDS, INTEGER_COLUMNS, TIMESTAMP_COLUMNS,
};
use calls_core::AppResult;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

/// Separator between per-employee values
pub const EMPLOYEE_JOIN: &str = ", ";

const LOCAL_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Counters gathered while normalizing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    /// Present, non-null values that could not be coerced
    pub coercion_failures: usize,
    /// Keys outside the static schema (static mode only)
    pub unknown_fields: usize,
}

pub struct RecordNormalizer {
    mode: ColumnSetMode,
    tz: Tz,
    schema: TableSchema,
}

impl RecordNormalizer {
    pub fn new(mode: ColumnSetMode, tz: Tz) -> Self {
        Self {
            mode,
            tz,
            schema: TableSchema::calls_v1(),
        }
    }

    pub fn from_config(config: &ReportConfig) -> AppResult<Self> {
        Ok(Self::new(config.column_set, config.tz()?))
    }

    pub fn normalize(&self, records: &[CallRecord]) -> ResultBatch {
        self.normalize_with_stats(records).0
    }

    #[instrument(skip(self, records), fields(records = records.len(), mode = ?self.mode))]
    pub fn normalize_with_stats(&self, records: &[CallRecord]) -> (ResultBatch, NormalizeStats) {
        let mut stats = NormalizeStats::default();

        let batch = match self.mode {
            ColumnSetMode::Static => self.normalize_static(records, &mut stats),
            ColumnSetMode::Observed => self.normalize_observed(records, &mut stats),
        };

        if stats.unknown_fields > 0 {
            debug!("Ignored {} values outside the static schema", stats.unknown_fields);
        }
        if stats.coercion_failures > 0 {
            warn!(
                "{} values could not be coerced and were stored as null",
                stats.coercion_failures
            );
        }

        (batch, stats)
    }

    fn normalize_static(&self, records: &[CallRecord], stats: &mut NormalizeStats) -> ResultBatch {
        let mut batch = ResultBatch::with_capacity(self.schema.column_names(), records.len());

        for record in records {
            let employees = flatten_employees(record.get(EMPLOYEES_FIELD));

            stats.unknown_fields += record
                .keys()
                .filter(|k| k.as_str() != EMPLOYEES_FIELD && self.schema.column(k).is_none())
                .count();

            let cells = self
                .schema
                .columns
                .iter()
                .map(|column| match employee_index(&column.name) {
                    Some(i) => CellValue::Text(employees[i].clone()),
                    None => {
                        let raw = record.get(&column.name);
                        let cell = coerce(raw, column.column_type, self.tz);
                        note_failure(raw, &cell, stats);
                        cell
                    }
                })
                .collect();

            batch.push_row(NormalizedRow::new(cells));
        }

        batch
    }

    fn normalize_observed(&self, records: &[CallRecord], stats: &mut NormalizeStats) -> ResultBatch {
        let mut columns: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for key in records.iter().flat_map(|r| r.keys()) {
            if key == EMPLOYEES_FIELD || employee_index(key).is_some() {
                continue;
            }
            if seen.insert(key.as_str()) {
                columns.push(key.clone());
            }
        }

        let passthrough = columns.len();
        columns.extend(EMPLOYEE_SUBFIELDS.iter().map(|s| s.to_string()));

        let mut batch = ResultBatch::with_capacity(columns.clone(), records.len());

        for record in records {
            let mut cells: Vec<CellValue> = columns[..passthrough]
                .iter()
                .map(|name| {
                    let raw = record.get(name);
                    let cell = match observed_type(name) {
                        Some(column_type) => coerce(raw, column_type, self.tz),
                        None => raw.map(CellValue::from_json).unwrap_or(CellValue::Null),
                    };
                    note_failure(raw, &cell, stats);
                    cell
                })
                .collect();

            cells.extend(
                flatten_employees(record.get(EMPLOYEES_FIELD))
                    .into_iter()
                    .map(CellValue::Text),
            );

            batch.push_row(NormalizedRow::new(cells));
        }

        batch
    }
}

fn employee_index(name: &str) -> Option<usize> {
    EMPLOYEE_SUBFIELDS.iter().position(|s| *s == name)
}

/// Columns that get typed even in observed mode
fn observed_type(name: &str) -> Option<ColumnType> {
    if TIMESTAMP_COLUMNS.contains(&name) {
        Some(ColumnType::Timestamp)
    } else if INTEGER_COLUMNS.contains(&name) {
        Some(ColumnType::Integer)
    } else {
        None
    }
}

fn note_failure(raw: Option<&Value>, cell: &CellValue, stats: &mut NormalizeStats) {
    let present = raw.map_or(false, |v| !v.is_null());
    if present && cell.is_null() {
        stats.coercion_failures += 1;
    }
}

/// Flatten `employees` into the four joined columns
///
/// Anything other than a list yields four empty strings.
pub fn flatten_employees(value: Option<&Value>) -> [String; 4] {
    let entries = match value {
        Some(Value::Array(entries)) if !entries.is_empty() => entries,
        _ => return Default::default(),
    };

    let mut columns: [Vec<String>; 4] = Default::default();
    for entry in entries {
        for (i, field) in EMPLOYEE_SUBFIELDS.iter().enumerate() {
            let rendered = match entry {
                Value::Object(map) => render_joined(map.get(*field)),
                _ => String::new(),
            };
            columns[i].push(rendered);
        }
    }

    columns.map(|values| values.join(EMPLOYEE_JOIN))
}

/// Text of one employee sub-field inside a joined column
pub fn render_joined(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(true)) => "True".to_string(),
        Some(Value::Bool(false)) => "False".to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(nested) => nested.to_string(),
    }
}

/// Coerce a raw value to a column type; failures become `Null`
pub fn coerce(value: Option<&Value>, column_type: ColumnType, tz: Tz) -> CellValue {
    let value = match value {
        None | Some(Value::Null) => return CellValue::Null,
        Some(v) => v,
    };

    let cell = match column_type {
        ColumnType::String => Some(match value {
            Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }),
        ColumnType::Integer => parse_integer(value).map(CellValue::Int),
        ColumnType::Float => parse_float(value).map(CellValue::Float),
        ColumnType::Boolean => parse_bool(value).map(CellValue::Bool),
        ColumnType::Timestamp => value
            .as_str()
            .and_then(|s| parse_timestamp(s, tz))
            .map(CellValue::Timestamp),
    };

    cell.unwrap_or(CellValue::Null)
}

/// Integer from a JSON integer, an integral float, or a numeric string
pub fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse an API timestamp read as wall-clock time in `tz`
///
/// RFC 3339 strings carry their own offset and ignore `tz`. Local times in
/// a DST gap yield `None`; ambiguous ones resolve to the earlier instant.
pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let naive = LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
