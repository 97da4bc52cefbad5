//! Domain models
//!
//! Raw call records as returned by the report API, the normalized batch
//! handed to the warehouse, and the schema/destination types around them.

pub mod batch;
pub mod call;
pub mod date_range;
pub mod schema;

pub use batch::{CellValue, NormalizedRow, ResultBatch};
pub use call::CallRecord;
pub use date_range::{DateRange, REPORT_DATETIME_FORMAT};
pub use schema::{
    ColumnSpec, ColumnType, TableRef, TableSchema, CALL_SCALAR_FIELDS, EMPLOYEES_FIELD,
    EMPLOYEE_SUBFIELDS, INTEGER_COLUMNS, TIMESTAMP_COLUMNS,
};
