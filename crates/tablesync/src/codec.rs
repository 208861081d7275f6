//! Columnar value codec
//!
//! Turns resolved JSON values into Arrow record batches:
//!
//! ```text
//! Value ──coerce──▶ typed Value ──RecordBuilder::append──▶ column builders ──finish──▶ RecordBatch
//! ```
//!
//! Every record starts with two lineage columns, `_sync_id` and
//! `_sync_parent_id`, followed by the table's declared columns.

use crate::schema::{ColumnType, Table};
use arrow_array::builder::{
    ArrayBuilder, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Identifier column present on every record
pub const SYNC_ID_COLUMN: &str = "_sync_id";
/// Parent identifier column present on every record
pub const SYNC_PARENT_ID_COLUMN: &str = "_sync_parent_id";
/// Schema metadata key holding the table name
pub const TABLE_NAME_METADATA: &str = "table_name";

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("cannot convert {found} to {expected}")]
    TypeMismatch {
        expected: ColumnType,
        found: &'static str,
    },

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid uuid '{0}'")]
    InvalidUuid(String),

    #[error("column '{0}' does not accept null")]
    NullValue(String),

    #[error("row has {found} values, schema expects {expected}")]
    Arity { expected: usize, found: usize },

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Coerce a value to a column type.
///
/// Null passes through for every type. Timestamps are normalized to RFC 3339
/// UTC text with microseconds; integers are read as Unix seconds. UUIDs are
/// normalized to lowercase hyphenated text.
pub fn coerce(column_type: ColumnType, value: Value) -> Result<Value, CodecError> {
    if value.is_null() {
        return Ok(value);
    }
    let mismatch = |value: &Value| CodecError::TypeMismatch {
        expected: column_type,
        found: kind(value),
    };

    match column_type {
        ColumnType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        ColumnType::Int64 => match &value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else {
                    match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                            Ok(Value::from(f as i64))
                        }
                        _ => Err(mismatch(&value)),
                    }
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        ColumnType::Float64 => match &value {
            Value::Number(n) => n.as_f64().map(Value::from).ok_or_else(|| mismatch(&value)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        ColumnType::Utf8 => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(mismatch(&other)),
        },
        ColumnType::Timestamp => {
            let ts = parse_timestamp(&value)?;
            Ok(Value::String(
                ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            ))
        }
        ColumnType::Json => Ok(value),
        ColumnType::Uuid => match &value {
            Value::String(s) => Uuid::parse_str(s.trim())
                .map(|id| Value::String(id.to_string()))
                .map_err(|_| CodecError::InvalidUuid(s.clone())),
            _ => Err(mismatch(&value)),
        },
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, CodecError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| CodecError::InvalidTimestamp(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| CodecError::InvalidTimestamp(n.to_string())),
        other => Err(CodecError::TypeMismatch {
            expected: ColumnType::Timestamp,
            found: kind(other),
        }),
    }
}

/// Text form used when hashing values into identifiers
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Rough byte size of a value once encoded
pub fn estimated_size(value: &Value) -> usize {
    match value {
        Value::Null => 1,
        Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(estimated_size).sum::<usize>() + 2,
        Value::Object(fields) => {
            fields
                .iter()
                .map(|(k, v)| k.len() + estimated_size(v) + 2)
                .sum::<usize>()
                + 2
        }
    }
}

fn data_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Utf8 | ColumnType::Json | ColumnType::Uuid => DataType::Utf8,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

/// Arrow schema of a table's records
pub fn arrow_schema(table: &Table) -> SchemaRef {
    let mut fields = Vec::with_capacity(table.columns.len() + 2);
    fields.push(Field::new(SYNC_ID_COLUMN, DataType::Utf8, false));
    fields.push(Field::new(SYNC_PARENT_ID_COLUMN, DataType::Utf8, true));
    for column in &table.columns {
        let mut field = Field::new(
            column.name.as_str(),
            data_type(column.column_type),
            !column.primary_key,
        );
        if column.primary_key {
            field = field.with_metadata(HashMap::from([(
                "primary_key".to_string(),
                "true".to_string(),
            )]));
        }
        fields.push(field);
    }
    let metadata = HashMap::from([(TABLE_NAME_METADATA.to_string(), table.name.clone())]);
    Arc::new(Schema::new_with_metadata(fields, metadata))
}

/// Cell converted ahead of appending, so a bad value never leaves a
/// half-appended row behind
enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    Timestamp(TimestampMicrosecondBuilder),
}

impl ColumnBuilder {
    fn new(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => Self::Boolean(BooleanBuilder::new()),
            DataType::Int64 => Self::Int64(Int64Builder::new()),
            DataType::Float64 => Self::Float64(Float64Builder::new()),
            DataType::Timestamp(_, _) => {
                Self::Timestamp(TimestampMicrosecondBuilder::new().with_timezone("UTC"))
            }
            _ => Self::Utf8(StringBuilder::new()),
        }
    }

    fn push(&mut self, cell: Cell) {
        match (self, cell) {
            (Self::Boolean(b), Cell::Bool(v)) => b.append_value(v),
            (Self::Int64(b), Cell::Int(v)) => b.append_value(v),
            (Self::Float64(b), Cell::Float(v)) => b.append_value(v),
            (Self::Utf8(b), Cell::Text(v)) => b.append_value(v),
            (Self::Timestamp(b), Cell::Int(v)) => b.append_value(v),
            (Self::Boolean(b), _) => b.append_null(),
            (Self::Int64(b), _) => b.append_null(),
            (Self::Float64(b), _) => b.append_null(),
            (Self::Utf8(b), _) => b.append_null(),
            (Self::Timestamp(b), _) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Boolean(b) => Arc::new(b.finish()),
            Self::Int64(b) => Arc::new(b.finish()),
            Self::Float64(b) => Arc::new(b.finish()),
            Self::Utf8(b) => Arc::new(b.finish()),
            Self::Timestamp(b) => Arc::new(b.finish()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Boolean(b) => b.len(),
            Self::Int64(b) => b.len(),
            Self::Float64(b) => b.len(),
            Self::Utf8(b) => b.len(),
            Self::Timestamp(b) => b.len(),
        }
    }
}

/// Accumulates rows of one table into a [`RecordBatch`]
pub struct RecordBuilder {
    schema: SchemaRef,
    /// Logical type per field; `None` for the lineage columns
    types: Vec<Option<ColumnType>>,
    columns: Vec<ColumnBuilder>,
}

impl RecordBuilder {
    pub fn new(table: &Table) -> Self {
        let schema = arrow_schema(table);
        let columns = schema
            .fields()
            .iter()
            .map(|f| ColumnBuilder::new(f.data_type()))
            .collect();
        let types = [None, None]
            .into_iter()
            .chain(table.columns.iter().map(|c| Some(c.column_type)))
            .collect();
        Self {
            schema,
            types,
            columns,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Rows appended since the last [`finish`](Self::finish)
    pub fn len(&self) -> usize {
        self.columns.first().map(ColumnBuilder::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one row; the row is either fully appended or not at all
    pub fn append(&mut self, values: &[Value]) -> Result<(), CodecError> {
        if values.len() != self.columns.len() {
            return Err(CodecError::Arity {
                expected: self.columns.len(),
                found: values.len(),
            });
        }
        let cells = values
            .iter()
            .zip(&self.types)
            .map(|(value, column_type)| to_cell(*column_type, value))
            .collect::<Result<Vec<_>, _>>()?;
        for (field, cell) in self.schema.fields().iter().zip(&cells) {
            if matches!(cell, Cell::Null) && !field.is_nullable() {
                return Err(CodecError::NullValue(field.name().clone()));
            }
        }
        for (builder, cell) in self.columns.iter_mut().zip(cells) {
            builder.push(cell);
        }
        Ok(())
    }

    /// Build a record from the appended rows and reset the builder
    pub fn finish(&mut self) -> Result<RecordBatch, CodecError> {
        let arrays = self.columns.iter_mut().map(ColumnBuilder::finish).collect();
        Ok(RecordBatch::try_new(Arc::clone(&self.schema), arrays)?)
    }
}

fn to_cell(column_type: Option<ColumnType>, value: &Value) -> Result<Cell, CodecError> {
    let Some(column_type) = column_type else {
        return Ok(match value {
            Value::String(s) => Cell::Text(s.clone()),
            _ => Cell::Null,
        });
    };
    if value.is_null() {
        return Ok(Cell::Null);
    }
    if column_type == ColumnType::Json {
        return Ok(Cell::Text(value.to_string()));
    }
    let value = coerce(column_type, value.clone())?;
    Ok(match (column_type, value) {
        (ColumnType::Boolean, Value::Bool(b)) => Cell::Bool(b),
        (ColumnType::Int64, Value::Number(n)) => n.as_i64().map(Cell::Int).unwrap_or(Cell::Null),
        (ColumnType::Float64, Value::Number(n)) => {
            n.as_f64().map(Cell::Float).unwrap_or(Cell::Null)
        }
        (ColumnType::Timestamp, ts) => Cell::Int(parse_timestamp(&ts)?.timestamp_micros()),
        (_, Value::String(s)) => Cell::Text(s),
        _ => Cell::Null,
    })
}
