use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Field values of a document.
pub type Fields = BTreeMap<String, Value>;

/// The canonical, dynamically-typed value set every backend normalizes into.
///
/// The set is closed: a backend-native value of any other type must fail
/// normalization with [`Error::UnsupportedValueType`] instead of being
/// silently dropped.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Sequence(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Timestamp(DateTime<Utc>),
    Reference(String),
}

impl Value {
    /// `true` for every variant except `Sequence`.
    ///
    /// Filter arity validation distinguishes scalar operands from sequence
    /// operands; maps count as scalars here because no operator takes one as
    /// a membership list.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Sequence(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Sequence(_) => "sequence",
            Value::Map(_) => "map",
            Value::Timestamp(_) => "timestamp",
            Value::Reference(_) => "reference",
        }
    }

    /// Total order within a variant, `None` across variants.
    ///
    /// Range operators (`Lt`, `Gt`, ...) only ever match values of the same
    /// type as their operand; mixed-type comparisons are simply non-matches,
    /// mirroring the vendor SDKs this layer fronts.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Null, Null) => Some(std::cmp::Ordering::Equal),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Double(a), Double(b)) => a.partial_cmp(b),
            (Integer(a), Double(b)) => (*a as f64).partial_cmp(b),
            (Double(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Reference(a), Reference(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

// Structural equality, bitwise on doubles so that `Value` (and therefore
// `QueryDescriptor`) can key the subscription de-duplication map.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Sequence(a), Sequence(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            (Reference(a), Reference(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Sequence(items) => items.hash(state),
            Value::Map(map) => map.hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Reference(r) => r.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Double(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Sequence(items.into_iter().map(Into::into).collect())
    }
}

/// Converts a `serde_json::Value` into the canonical set.
///
/// JSON is narrower than the canonical set (no bytes, timestamps, or
/// references come back out of this path), but it is the convenient way to
/// assemble fields in application code and tests. Numbers that fit an `i64`
/// become `Integer`; anything else a JSON number can hold becomes `Double`
/// when finite, and fails otherwise.
impl TryFrom<serde_json::Value> for Value {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Value> {
        Ok(match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Double(f)
                } else {
                    return Err(Error::UnsupportedValueType(format!(
                        "number out of range: {n}"
                    )));
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Sequence(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
            serde_json::Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (k, v) in map {
                    fields.insert(k, Value::try_from(v)?);
                }
                Value::Map(fields)
            }
        })
    }
}

/// Builds a [`Fields`] map from a JSON object; fails on non-objects.
pub fn fields_from_json(value: serde_json::Value) -> Result<Fields> {
    match Value::try_from(value)? {
        Value::Map(fields) => Ok(fields),
        other => Err(Error::UnsupportedValueType(format!(
            "document fields must be a map, got {}",
            other.type_name()
        ))),
    }
}

/// An immutable snapshot of one document: its id plus normalized fields.
///
/// Holds no reference back into backend-native objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn doubles_compare_and_hash_by_bits() {
        assert_eq!(Value::Double(1.5), Value::Double(1.5));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_eq!(
            hash_of(&Value::Double(2.25)),
            hash_of(&Value::Double(2.25))
        );
    }

    #[test]
    fn integers_and_doubles_are_distinct_variants() {
        assert_ne!(Value::Integer(1), Value::Double(1.0));
        // but they still order against each other numerically
        assert_eq!(
            Value::Integer(1).compare(&Value::Double(1.5)),
            Some(std::cmp::Ordering::Less)
        );
    }

    #[test]
    fn cross_variant_compare_is_none() {
        assert_eq!(Value::String("a".into()).compare(&Value::Integer(1)), None);
        assert_eq!(Value::Null.compare(&Value::Bool(false)), None);
    }

    #[test]
    fn json_conversion_nested() {
        let fields = fields_from_json(json!({
            "name": "a",
            "age": 10,
            "score": 1.5,
            "tags": ["x", "y"],
            "nested": { "ok": true, "inner": [1, 2] }
        }))
        .unwrap();

        assert_eq!(fields["age"], Value::Integer(10));
        assert_eq!(fields["score"], Value::Double(1.5));
        assert_eq!(
            fields["tags"],
            Value::Sequence(vec!["x".into(), "y".into()])
        );
        match &fields["nested"] {
            Value::Map(m) => {
                assert_eq!(m["ok"], Value::Bool(true));
                assert_eq!(m["inner"], Value::Sequence(vec![1i64.into(), 2i64.into()]));
            }
            other => panic!("expected map, got {}", other.type_name()),
        }
    }

    #[test]
    fn json_conversion_rejects_non_object_fields() {
        assert!(matches!(
            fields_from_json(json!([1, 2, 3])),
            Err(Error::UnsupportedValueType(_))
        ));
    }

    #[test]
    fn u64_overflow_is_unsupported() {
        let big = json!(u64::MAX);
        // u64::MAX has no exact i64 representation; serde_json still exposes
        // it as an f64, which we accept as Double.
        assert_eq!(Value::try_from(big).unwrap(), Value::Double(u64::MAX as f64));
    }
}
