//! Normalization between Firestore wire values and the canonical
//! [`Value`](crate::value::Value) set.
//!
//! Decoding is total over the closed variant set: a wire value with no
//! canonical counterpart (today only `geoPointValue`) is an
//! [`Error::UnsupportedValueType`], never silently dropped.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};

use super::models::{ArrayValue, MapValue, ValueType, WireDocument, WireValue};
use crate::error::{Error, Result};
use crate::value::{Document, Fields, Value};

pub fn decode_value(wire: WireValue) -> Result<Value> {
    Ok(match wire.value_type {
        ValueType::NullValue(()) => Value::Null,
        ValueType::BooleanValue(b) => Value::Bool(b),
        ValueType::IntegerValue(s) => Value::Integer(s.parse().map_err(|e| {
            Error::Backend(format!("malformed integer value {s:?}: {e}"))
        })?),
        ValueType::DoubleValue(d) => Value::Double(d),
        ValueType::StringValue(s) => Value::String(s),
        ValueType::BytesValue(b64) => Value::Bytes(BASE64.decode(b64.as_bytes()).map_err(
            |e| Error::Backend(format!("malformed bytes value: {e}")),
        )?),
        ValueType::TimestampValue(ts) => Value::Timestamp(
            DateTime::parse_from_rfc3339(&ts)
                .map_err(|e| Error::Backend(format!("malformed timestamp {ts:?}: {e}")))?
                .with_timezone(&Utc),
        ),
        ValueType::ReferenceValue(path) => Value::Reference(path),
        ValueType::ArrayValue(array) => Value::Sequence(
            array
                .values
                .into_iter()
                .map(decode_value)
                .collect::<Result<Vec<_>>>()?,
        ),
        ValueType::MapValue(map) => Value::Map(decode_fields(map.fields)?),
        ValueType::GeoPointValue(_) => {
            return Err(Error::UnsupportedValueType("geoPointValue".into()))
        }
    })
}

pub fn decode_fields(fields: HashMap<String, WireValue>) -> Result<Fields> {
    let mut out = BTreeMap::new();
    for (name, value) in fields {
        let value = decode_value(value)?;
        out.insert(name, value);
    }
    Ok(out)
}

/// Extracts the document id (the last path segment of the resource name) and
/// decodes the fields.
pub fn decode_document(wire: WireDocument) -> Result<Document> {
    let id = wire
        .name
        .rsplit('/')
        .next()
        .unwrap_or(wire.name.as_str())
        .to_string();
    Ok(Document::new(id, decode_fields(wire.fields)?))
}

pub fn encode_value(value: &Value) -> WireValue {
    let value_type = match value {
        Value::Null => ValueType::NullValue(()),
        Value::Bool(b) => ValueType::BooleanValue(*b),
        Value::Integer(i) => ValueType::IntegerValue(i.to_string()),
        Value::Double(d) => ValueType::DoubleValue(*d),
        Value::String(s) => ValueType::StringValue(s.clone()),
        Value::Bytes(bytes) => ValueType::BytesValue(BASE64.encode(bytes)),
        Value::Timestamp(ts) => {
            ValueType::TimestampValue(ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
        }
        Value::Reference(path) => ValueType::ReferenceValue(path.clone()),
        Value::Sequence(items) => ValueType::ArrayValue(ArrayValue {
            values: items.iter().map(encode_value).collect(),
        }),
        Value::Map(map) => ValueType::MapValue(MapValue {
            fields: encode_fields(map),
        }),
    };
    WireValue { value_type }
}

pub fn encode_fields(fields: &Fields) -> HashMap<String, WireValue> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), encode_value(value)))
        .collect()
}
