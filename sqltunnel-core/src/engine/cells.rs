//! Arrow cell decoding and SQL type naming for result sets.

use duckdb::arrow::array::{Array, ArrayRef, AsArray};
use duckdb::arrow::datatypes::{
    DataType, Date32Type, Date64Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, Time32MillisecondType, Time32SecondType, Time64MicrosecondType,
    Time64NanosecondType, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use duckdb::arrow::util::display::array_value_to_string;

use crate::error::ServerError;
use crate::value::ParameterValue;

/// java.sql.Types codes reported in result-set metadata and typed nulls.
pub mod sql_types {
    pub const NULL: i32 = 0;
    pub const BOOLEAN: i32 = 16;
    pub const TINYINT: i32 = -6;
    pub const SMALLINT: i32 = 5;
    pub const INTEGER: i32 = 4;
    pub const BIGINT: i32 = -5;
    pub const REAL: i32 = 7;
    pub const DOUBLE: i32 = 8;
    pub const DECIMAL: i32 = 3;
    pub const VARCHAR: i32 = 12;
    pub const VARBINARY: i32 = -3;
    pub const DATE: i32 = 91;
    pub const TIME: i32 = 92;
    pub const TIMESTAMP: i32 = 93;
    pub const OTHER: i32 = 1111;
}

/// A decoded cell. Binary payloads are kept apart so the row encoder can
/// decide between inlining and a LOB handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(ParameterValue),
    Binary(Vec<u8>),
}

pub fn is_binary(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) | DataType::BinaryView
    )
}

/// Borrowed bytes of a binary cell; `None` for nulls and non-binary columns.
pub fn binary_slice(array: &ArrayRef, row: usize) -> Option<&[u8]> {
    if array.is_null(row) {
        return None;
    }
    match array.data_type() {
        DataType::Binary => Some(array.as_binary::<i32>().value(row)),
        DataType::LargeBinary => Some(array.as_binary::<i64>().value(row)),
        DataType::FixedSizeBinary(_) => Some(array.as_fixed_size_binary().value(row)),
        DataType::BinaryView => Some(array.as_binary_view().value(row)),
        _ => None,
    }
}

pub fn binary_value(array: &ArrayRef, row: usize) -> Option<Vec<u8>> {
    binary_slice(array, row).map(<[u8]>::to_vec)
}

/// Length in bytes of a binary cell without copying it.
pub fn binary_len(array: &ArrayRef, row: usize) -> Option<usize> {
    binary_slice(array, row).map(<[u8]>::len)
}

pub fn decode_cell(array: &ArrayRef, row: usize) -> Result<Cell, ServerError> {
    let data_type = array.data_type();
    if array.is_null(row) {
        return Ok(Cell::Value(ParameterValue::Null(sql_type_code(data_type))));
    }
    if let Some(bytes) = binary_value(array, row) {
        return Ok(Cell::Binary(bytes));
    }
    let value = match data_type {
        DataType::Boolean => ParameterValue::Boolean(array.as_boolean().value(row)),
        DataType::Int8 => ParameterValue::Byte(array.as_primitive::<Int8Type>().value(row)),
        DataType::Int16 => {
            ParameterValue::Int(i32::from(array.as_primitive::<Int16Type>().value(row)))
        }
        DataType::Int32 => ParameterValue::Int(array.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => ParameterValue::Long(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => {
            ParameterValue::Int(i32::from(array.as_primitive::<UInt8Type>().value(row)))
        }
        DataType::UInt16 => {
            ParameterValue::Int(i32::from(array.as_primitive::<UInt16Type>().value(row)))
        }
        DataType::UInt32 => {
            ParameterValue::Long(i64::from(array.as_primitive::<UInt32Type>().value(row)))
        }
        DataType::UInt64 => {
            let raw = array.as_primitive::<UInt64Type>().value(row);
            match i64::try_from(raw) {
                Ok(v) => ParameterValue::Long(v),
                Err(_) => ParameterValue::Decimal(raw.to_string()),
            }
        }
        DataType::Float32 => ParameterValue::Float(array.as_primitive::<Float32Type>().value(row)),
        DataType::Float64 => {
            ParameterValue::Double(array.as_primitive::<Float64Type>().value(row))
        }
        DataType::Utf8 => ParameterValue::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => {
            ParameterValue::Text(array.as_string::<i64>().value(row).to_string())
        }
        DataType::Utf8View => {
            ParameterValue::Text(array.as_string_view().value(row).to_string())
        }
        DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => {
            ParameterValue::Decimal(array_value_to_string(array, row)?)
        }
        DataType::Date32 => temporal(
            array.as_primitive::<Date32Type>().value_as_date(row),
            ParameterValue::Date,
            array,
            row,
        )?,
        DataType::Date64 => temporal(
            array.as_primitive::<Date64Type>().value_as_date(row),
            ParameterValue::Date,
            array,
            row,
        )?,
        DataType::Time32(TimeUnit::Second) => temporal(
            array.as_primitive::<Time32SecondType>().value_as_time(row),
            ParameterValue::Time,
            array,
            row,
        )?,
        DataType::Time32(_) => temporal(
            array.as_primitive::<Time32MillisecondType>().value_as_time(row),
            ParameterValue::Time,
            array,
            row,
        )?,
        DataType::Time64(TimeUnit::Nanosecond) => temporal(
            array.as_primitive::<Time64NanosecondType>().value_as_time(row),
            ParameterValue::Time,
            array,
            row,
        )?,
        DataType::Time64(_) => temporal(
            array.as_primitive::<Time64MicrosecondType>().value_as_time(row),
            ParameterValue::Time,
            array,
            row,
        )?,
        DataType::Timestamp(unit, _) => {
            let ts = match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value_as_datetime(row),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value_as_datetime(row),
                TimeUnit::Microsecond => array
                    .as_primitive::<TimestampMicrosecondType>()
                    .value_as_datetime(row),
                TimeUnit::Nanosecond => array
                    .as_primitive::<TimestampNanosecondType>()
                    .value_as_datetime(row),
            };
            temporal(ts, ParameterValue::Timestamp, array, row)?
        }
        _ => ParameterValue::Opaque(array_value_to_string(array, row)?),
    };
    Ok(Cell::Value(value))
}

fn temporal<T>(
    value: Option<T>,
    wrap: impl FnOnce(T) -> ParameterValue,
    array: &ArrayRef,
    row: usize,
) -> Result<ParameterValue, ServerError> {
    match value {
        Some(v) => Ok(wrap(v)),
        None => Ok(ParameterValue::Opaque(array_value_to_string(array, row)?)),
    }
}

pub fn sql_type_code(data_type: &DataType) -> i32 {
    match data_type {
        DataType::Null => sql_types::NULL,
        DataType::Boolean => sql_types::BOOLEAN,
        DataType::Int8 => sql_types::TINYINT,
        DataType::Int16 | DataType::UInt8 => sql_types::SMALLINT,
        DataType::Int32 | DataType::UInt16 => sql_types::INTEGER,
        DataType::Int64 | DataType::UInt32 => sql_types::BIGINT,
        DataType::Float32 => sql_types::REAL,
        DataType::Float64 => sql_types::DOUBLE,
        DataType::UInt64 | DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => {
            sql_types::DECIMAL
        }
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => sql_types::VARCHAR,
        dt if is_binary(dt) => sql_types::VARBINARY,
        DataType::Date32 | DataType::Date64 => sql_types::DATE,
        DataType::Time32(_) | DataType::Time64(_) => sql_types::TIME,
        DataType::Timestamp(_, _) => sql_types::TIMESTAMP,
        _ => sql_types::OTHER,
    }
}

pub fn sql_type_name(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Null => "NULL",
        DataType::Boolean => "BOOLEAN",
        DataType::Int8 => "TINYINT",
        DataType::Int16 => "SMALLINT",
        DataType::Int32 => "INTEGER",
        DataType::Int64 => "BIGINT",
        DataType::UInt8 => "UTINYINT",
        DataType::UInt16 => "USMALLINT",
        DataType::UInt32 => "UINTEGER",
        DataType::UInt64 => "UBIGINT",
        DataType::Float32 => "FLOAT",
        DataType::Float64 => "DOUBLE",
        DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => "DECIMAL",
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "VARCHAR",
        dt if is_binary(dt) => "BLOB",
        DataType::Date32 | DataType::Date64 => "DATE",
        DataType::Time32(_) | DataType::Time64(_) => "TIME",
        DataType::Timestamp(_, Some(_)) => "TIMESTAMP WITH TIME ZONE",
        DataType::Timestamp(_, None) => "TIMESTAMP",
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => "LIST",
        DataType::Struct(_) => "STRUCT",
        DataType::Map(_, _) => "MAP",
        _ => "OTHER",
    }
}

/// Precision and scale as reported by result-set metadata.
pub fn precision_and_scale(data_type: &DataType) -> (i32, i32) {
    match data_type {
        DataType::Decimal128(p, s) | DataType::Decimal256(p, s) => (i32::from(*p), i32::from(*s)),
        DataType::Boolean => (1, 0),
        DataType::Int8 | DataType::UInt8 => (3, 0),
        DataType::Int16 | DataType::UInt16 => (5, 0),
        DataType::Int32 | DataType::UInt32 => (10, 0),
        DataType::Int64 => (19, 0),
        DataType::UInt64 => (20, 0),
        DataType::Float32 => (7, 0),
        DataType::Float64 => (15, 0),
        DataType::FixedSizeBinary(width) => (*width, 0),
        _ => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use chrono::NaiveDate;
    use duckdb::arrow::array::{BinaryArray, Date32Array, Int32Array, StringArray};

    use super::*;

    #[test]
    fn decodes_primitive_text_and_null_cells() -> Result<()> {
        let ints: ArrayRef = Arc::new(Int32Array::from(vec![Some(5), None]));
        assert_eq!(
            decode_cell(&ints, 0).map_err(|e| anyhow!(e.to_string()))?,
            Cell::Value(ParameterValue::Int(5))
        );
        assert_eq!(
            decode_cell(&ints, 1).map_err(|e| anyhow!(e.to_string()))?,
            Cell::Value(ParameterValue::Null(sql_types::INTEGER))
        );

        let text: ArrayRef = Arc::new(StringArray::from(vec!["abc"]));
        assert_eq!(
            decode_cell(&text, 0).map_err(|e| anyhow!(e.to_string()))?,
            Cell::Value(ParameterValue::Text("abc".to_string()))
        );

        let dates: ArrayRef = Arc::new(Date32Array::from(vec![10]));
        let expected = NaiveDate::from_ymd_opt(1970, 1, 11).ok_or_else(|| anyhow!("bad date"))?;
        assert_eq!(
            decode_cell(&dates, 0).map_err(|e| anyhow!(e.to_string()))?,
            Cell::Value(ParameterValue::Date(expected))
        );
        Ok(())
    }

    #[test]
    fn binary_cells_are_kept_raw() -> Result<()> {
        let blobs: ArrayRef = Arc::new(BinaryArray::from(vec![Some(&b"\x01\x02"[..]), None]));
        assert_eq!(binary_len(&blobs, 0), Some(2));
        assert_eq!(binary_len(&blobs, 1), None);
        assert_eq!(
            decode_cell(&blobs, 0).map_err(|e| anyhow!(e.to_string()))?,
            Cell::Binary(vec![1, 2])
        );
        assert!(is_binary(blobs.data_type()));
        assert_eq!(sql_type_name(blobs.data_type()), "BLOB");
        Ok(())
    }
}
