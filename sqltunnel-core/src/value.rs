//! Typed parameter and cell values.
//!
//! `ParameterValue` is the decoded form of a `WireValue`. LOB variants carry a
//! handle into the session's LOB registry and are resolved at bind time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use duckdb::types::{TimeUnit, Value};

use crate::error::ServerError;
use crate::protocol::{wire_value::Kind, WireValue};
use crate::session::ResourceId;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Int(i32),
    Long(i64),
    Double(f64),
    Float(f32),
    Text(String),
    Boolean(bool),
    Decimal(String),
    Bytes(Vec<u8>),
    Byte(i8),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    BlobRef(ResourceId),
    ClobRef(ResourceId),
    BinaryStreamRef(ResourceId),
    /// Null of the given SQL type code.
    Null(i32),
    Opaque(String),
}

impl ParameterValue {
    pub fn from_wire(value: &WireValue) -> Result<Self, ServerError> {
        let kind = value
            .kind
            .as_ref()
            .ok_or_else(|| ServerError::InvalidRequest("parameter without a value".to_string()))?;
        Ok(match kind {
            Kind::Int(v) => ParameterValue::Int(*v),
            Kind::Long(v) => ParameterValue::Long(*v),
            Kind::Double(v) => ParameterValue::Double(*v),
            Kind::Float(v) => ParameterValue::Float(*v),
            Kind::Text(v) => ParameterValue::Text(v.clone()),
            Kind::Boolean(v) => ParameterValue::Boolean(*v),
            Kind::Decimal(v) => ParameterValue::Decimal(v.clone()),
            Kind::Bytes(v) => ParameterValue::Bytes(v.clone()),
            Kind::Byte(v) => ParameterValue::Byte(i8::try_from(*v).map_err(|_| {
                ServerError::InvalidRequest(format!("byte parameter out of range: {v}"))
            })?),
            Kind::Date(v) => ParameterValue::Date(
                NaiveDate::parse_from_str(v, DATE_FORMAT)
                    .map_err(|err| invalid_temporal("date", v, err))?,
            ),
            Kind::Time(v) => ParameterValue::Time(
                NaiveTime::parse_from_str(v, TIME_FORMAT)
                    .map_err(|err| invalid_temporal("time", v, err))?,
            ),
            Kind::Timestamp(v) => ParameterValue::Timestamp(parse_timestamp(v)?),
            Kind::BlobRef(v) => ParameterValue::BlobRef(ResourceId::parse(v)?),
            Kind::ClobRef(v) => ParameterValue::ClobRef(ResourceId::parse(v)?),
            Kind::BinaryStreamRef(v) => ParameterValue::BinaryStreamRef(ResourceId::parse(v)?),
            Kind::Null(sql_type) => ParameterValue::Null(*sql_type),
            Kind::Opaque(v) => ParameterValue::Opaque(v.clone()),
        })
    }

    pub fn from_wire_list(values: &[WireValue]) -> Result<Vec<Self>, ServerError> {
        values.iter().map(Self::from_wire).collect()
    }

    pub fn to_wire(&self) -> WireValue {
        let kind = match self {
            ParameterValue::Int(v) => Kind::Int(*v),
            ParameterValue::Long(v) => Kind::Long(*v),
            ParameterValue::Double(v) => Kind::Double(*v),
            ParameterValue::Float(v) => Kind::Float(*v),
            ParameterValue::Text(v) => Kind::Text(v.clone()),
            ParameterValue::Boolean(v) => Kind::Boolean(*v),
            ParameterValue::Decimal(v) => Kind::Decimal(v.clone()),
            ParameterValue::Bytes(v) => Kind::Bytes(v.clone()),
            ParameterValue::Byte(v) => Kind::Byte(i32::from(*v)),
            ParameterValue::Date(v) => Kind::Date(v.format(DATE_FORMAT).to_string()),
            ParameterValue::Time(v) => Kind::Time(v.format(TIME_FORMAT).to_string()),
            ParameterValue::Timestamp(v) => Kind::Timestamp(v.format(TIMESTAMP_FORMATS[0]).to_string()),
            ParameterValue::BlobRef(id) => Kind::BlobRef(id.to_string()),
            ParameterValue::ClobRef(id) => Kind::ClobRef(id.to_string()),
            ParameterValue::BinaryStreamRef(id) => Kind::BinaryStreamRef(id.to_string()),
            ParameterValue::Null(sql_type) => Kind::Null(*sql_type),
            ParameterValue::Opaque(v) => Kind::Opaque(v.clone()),
        };
        WireValue::of(kind)
    }

    /// LOB handle referenced by this parameter, if any.
    pub fn lob_ref(&self) -> Option<&ResourceId> {
        match self {
            ParameterValue::BlobRef(id)
            | ParameterValue::ClobRef(id)
            | ParameterValue::BinaryStreamRef(id) => Some(id),
            _ => None,
        }
    }

    /// Convert an inline value into an engine bind value. LOB references must
    /// be resolved by the caller first.
    pub fn to_engine(&self) -> Result<Value, ServerError> {
        Ok(match self {
            ParameterValue::Int(v) => Value::Int(*v),
            ParameterValue::Long(v) => Value::BigInt(*v),
            ParameterValue::Double(v) => Value::Double(*v),
            ParameterValue::Float(v) => Value::Float(*v),
            ParameterValue::Text(v) | ParameterValue::Decimal(v) | ParameterValue::Opaque(v) => {
                Value::Text(v.clone())
            }
            ParameterValue::Boolean(v) => Value::Boolean(*v),
            ParameterValue::Bytes(v) => Value::Blob(v.clone()),
            ParameterValue::Byte(v) => Value::TinyInt(*v),
            ParameterValue::Date(v) => Value::Date32(days_since_epoch(*v)?),
            ParameterValue::Time(v) => Value::Time64(TimeUnit::Microsecond, micros_of_day(*v)),
            ParameterValue::Timestamp(v) => {
                Value::Timestamp(TimeUnit::Microsecond, v.and_utc().timestamp_micros())
            }
            ParameterValue::Null(_) => Value::Null,
            ParameterValue::BlobRef(id)
            | ParameterValue::ClobRef(id)
            | ParameterValue::BinaryStreamRef(id) => {
                return Err(ServerError::Internal(format!(
                    "lob parameter {id} must be resolved before binding"
                )))
            }
        })
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Byte(v) => Some(i64::from(*v)),
            ParameterValue::Int(v) => Some(i64::from(*v)),
            ParameterValue::Long(v) => Some(*v),
            ParameterValue::Text(v) | ParameterValue::Decimal(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(f64::from(*v)),
            ParameterValue::Double(v) => Some(*v),
            ParameterValue::Text(v) | ParameterValue::Decimal(v) => v.trim().parse().ok(),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Boolean(v) => Some(*v),
            ParameterValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParameterValue::Null(_))
    }

    /// Text form served by `getString`; `None` for SQL NULL.
    pub fn render_text(&self) -> Option<String> {
        Some(match self {
            ParameterValue::Int(v) => v.to_string(),
            ParameterValue::Long(v) => v.to_string(),
            ParameterValue::Double(v) => v.to_string(),
            ParameterValue::Float(v) => v.to_string(),
            ParameterValue::Text(v) | ParameterValue::Decimal(v) | ParameterValue::Opaque(v) => {
                v.clone()
            }
            ParameterValue::Boolean(v) => v.to_string(),
            ParameterValue::Bytes(v) => v.iter().map(|b| format!("{b:02x}")).collect(),
            ParameterValue::Byte(v) => v.to_string(),
            ParameterValue::Date(v) => v.format(DATE_FORMAT).to_string(),
            ParameterValue::Time(v) => v.format(TIME_FORMAT).to_string(),
            ParameterValue::Timestamp(v) => v.format(TIMESTAMP_FORMATS[1]).to_string(),
            ParameterValue::BlobRef(id)
            | ParameterValue::ClobRef(id)
            | ParameterValue::BinaryStreamRef(id) => id.to_string(),
            ParameterValue::Null(_) => return None,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, ServerError> {
    let mut last_err = None;
    for format in TIMESTAMP_FORMATS {
        match NaiveDateTime::parse_from_str(raw, format) {
            Ok(ts) => return Ok(ts),
            Err(err) => last_err = Some(err),
        }
    }
    Err(ServerError::InvalidRequest(format!(
        "invalid timestamp {raw:?}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn invalid_temporal(what: &str, raw: &str, err: chrono::ParseError) -> ServerError {
    ServerError::InvalidRequest(format!("invalid {what} {raw:?}: {err}"))
}

fn days_since_epoch(date: NaiveDate) -> Result<i32, ServerError> {
    let days = date
        .signed_duration_since(DateTime::UNIX_EPOCH.date_naive())
        .num_days();
    i32::try_from(days).map_err(|_| ServerError::InvalidRequest(format!("date out of range: {date}")))
}

fn micros_of_day(time: NaiveTime) -> i64 {
    i64::from(time.num_seconds_from_midnight()) * 1_000_000 + i64::from(time.nanosecond() / 1_000)
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;

    #[test]
    fn temporal_parameters_bind_in_microseconds() -> Result<()> {
        let date = ParameterValue::from_wire(&WireValue::of(Kind::Date("1970-01-11".to_string())))
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(date.to_engine().map_err(|e| anyhow!(e.to_string()))?, Value::Date32(10));

        let time = ParameterValue::from_wire(&WireValue::of(Kind::Time("00:00:01.5".to_string())))
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(
            time.to_engine().map_err(|e| anyhow!(e.to_string()))?,
            Value::Time64(TimeUnit::Microsecond, 1_500_000)
        );

        let ts = ParameterValue::from_wire(&WireValue::of(Kind::Timestamp(
            "1970-01-01 00:00:02".to_string(),
        )))
        .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(
            ts.to_engine().map_err(|e| anyhow!(e.to_string()))?,
            Value::Timestamp(TimeUnit::Microsecond, 2_000_000)
        );
        Ok(())
    }

    #[test]
    fn lob_references_are_not_bindable_inline() -> Result<()> {
        let id = ResourceId::new();
        let blob = ParameterValue::from_wire(&WireValue::of(Kind::BlobRef(id.to_string())))
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(blob.lob_ref(), Some(&id));
        assert!(blob.to_engine().is_err());
        Ok(())
    }

    #[test]
    fn malformed_values_are_invalid_requests() {
        let bad_date = WireValue::of(Kind::Date("31/12/2024".to_string()));
        assert!(matches!(
            ParameterValue::from_wire(&bad_date),
            Err(ServerError::InvalidRequest(_))
        ));
        let bad_byte = WireValue::of(Kind::Byte(300));
        assert!(ParameterValue::from_wire(&bad_byte).is_err());
        assert!(ParameterValue::from_wire(&WireValue::default()).is_err());
        let bad_ref = WireValue::of(Kind::ClobRef("not-a-uuid".to_string()));
        assert!(ParameterValue::from_wire(&bad_ref).is_err());
    }

    #[test]
    fn numeric_accessors_widen() {
        assert_eq!(ParameterValue::Byte(7).as_i64(), Some(7));
        assert_eq!(ParameterValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(ParameterValue::Text("42".to_string()).as_i64(), Some(42));
        assert_eq!(ParameterValue::Boolean(true).as_i64(), None);
        assert_eq!(ParameterValue::Text("true".to_string()).as_bool(), Some(true));
    }
}
