//! Runtime values for expression evaluation.
//!
//! `Value` covers the subset of CEL values the rule engine evaluates:
//! primitives, collections, timestamps/durations, protobuf messages (backed
//! by `DynamicMessage`), and error values, which propagate through
//! evaluation instead of unwinding it.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use prost_reflect::{DynamicMessage, ReflectMessage};

use crate::error::EvalError;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer.
    UInt(u64),
    /// 64-bit floating point.
    Double(f64),
    /// Unicode string (Arc for cheap cloning).
    String(Arc<str>),
    /// Byte sequence (Arc for cheap cloning).
    Bytes(Arc<[u8]>),
    /// List of values.
    List(Arc<Vec<Value>>),
    /// Key-value map (BTreeMap for deterministic iteration).
    Map(Arc<ValueMap>),
    /// Timestamp (seconds and nanos since Unix epoch).
    Timestamp(Timestamp),
    /// Duration (seconds and nanos).
    Duration(Duration),
    /// Protobuf message.
    Message(Arc<DynamicMessage>),
    /// Error value (evaluation errors propagate as values).
    Error(Arc<EvalError>),
}

/// A timestamp value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds since Unix epoch.
    pub seconds: i64,
    /// Nanoseconds (0..999_999_999).
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }
}

/// A duration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration {
    /// Seconds component.
    pub seconds: i64,
    /// Nanoseconds component.
    pub nanos: i32,
}

impl Duration {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }
}

/// Keys permitted in map values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MapKey {
    Bool(bool),
    Int(i64),
    UInt(u64),
    String(Arc<str>),
}

impl MapKey {
    /// Convert a value into a map key, if the value is a permitted key type.
    pub fn from_value(value: &Value) -> Result<MapKey, EvalError> {
        match value {
            Value::Bool(b) => Ok(MapKey::Bool(*b)),
            Value::Int(n) => Ok(MapKey::Int(*n)),
            Value::UInt(n) => Ok(MapKey::UInt(*n)),
            Value::String(s) => Ok(MapKey::String(s.clone())),
            other => Err(EvalError::InvalidMapKey(other.type_name().to_string())),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Bool(b) => write!(f, "{}", b),
            MapKey::Int(n) => write!(f, "{}", n),
            MapKey::UInt(n) => write!(f, "{}", n),
            MapKey::String(s) => write!(f, "{}", s),
        }
    }
}

/// An ordered map of values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    entries: BTreeMap<MapKey, Value>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: MapKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &MapKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &MapKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &MapKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &Value)> {
        self.entries.iter()
    }
}

impl FromIterator<(MapKey, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (MapKey, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Value {
    /// Wrap an evaluation error as a value.
    pub fn error(err: EvalError) -> Value {
        Value::Error(Arc::new(err))
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// The value's type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Timestamp(_) => "timestamp",
            Value::Duration(_) => "duration",
            Value::Message(_) => "message",
            Value::Error(_) => "error",
        }
    }

    /// Extract a bool, or None for any other value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns true if this value is the default (zero) value of its type.
    ///
    /// Protobuf semantics: empty string/bytes/list/map, zero numerics,
    /// false, and null are all defaults. Messages are defaults when every
    /// field is unset.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::UInt(n) => *n == 0,
            Value::Double(n) => *n == 0.0,
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            Value::Timestamp(t) => t.seconds == 0 && t.nanos == 0,
            Value::Duration(d) => d.seconds == 0 && d.nanos == 0,
            Value::Message(m) => m.fields().next().is_none(),
            Value::Error(_) => false,
        }
    }

    /// Convert a protobuf reflection value.
    ///
    /// Well-known `Timestamp` and `Duration` messages convert to the
    /// corresponding primitive values; enums widen to int.
    pub fn from_proto(value: &prost_reflect::Value) -> Value {
        use prost_reflect::Value as P;
        match value {
            P::Bool(b) => Value::Bool(*b),
            P::I32(n) => Value::Int(*n as i64),
            P::I64(n) => Value::Int(*n),
            P::U32(n) => Value::UInt(*n as u64),
            P::U64(n) => Value::UInt(*n),
            P::F32(n) => Value::Double(*n as f64),
            P::F64(n) => Value::Double(*n),
            P::String(s) => Value::String(Arc::from(s.as_str())),
            P::Bytes(b) => Value::Bytes(Arc::from(b.as_ref())),
            P::EnumNumber(n) => Value::Int(*n as i64),
            P::Message(m) => Value::from_message(m.clone()),
            P::List(elems) => {
                Value::List(Arc::new(elems.iter().map(Value::from_proto).collect()))
            }
            P::Map(entries) => {
                let map = entries
                    .iter()
                    .map(|(k, v)| (map_key_from_proto(k), Value::from_proto(v)))
                    .collect();
                Value::Map(Arc::new(map))
            }
        }
    }

    /// Wrap a dynamic message, converting well-known time types.
    pub fn from_message(message: DynamicMessage) -> Value {
        match message.descriptor().full_name() {
            "google.protobuf.Timestamp" => Value::Timestamp(Timestamp::new(
                int_field(&message, "seconds"),
                int_field(&message, "nanos") as i32,
            )),
            "google.protobuf.Duration" => Value::Duration(Duration::new(
                int_field(&message, "seconds"),
                int_field(&message, "nanos") as i32,
            )),
            _ => Value::Message(Arc::new(message)),
        }
    }

    /// Partial ordering between comparable values.
    ///
    /// Numerics compare across int/uint/double; strings, bytes, booleans,
    /// timestamps, and durations compare within their own type.
    pub fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::UInt(a), Value::UInt(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::UInt(b)) => Some(cmp_int_uint(*a, *b)),
            (Value::UInt(a), Value::Int(b)) => Some(cmp_int_uint(*b, *a).reverse()),
            (Value::Int(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::UInt(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::UInt(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

fn cmp_int_uint(a: i64, b: u64) -> Ordering {
    if a < 0 {
        Ordering::Less
    } else {
        (a as u64).cmp(&b)
    }
}

fn map_key_from_proto(key: &prost_reflect::MapKey) -> MapKey {
    use prost_reflect::MapKey as P;
    match key {
        P::Bool(b) => MapKey::Bool(*b),
        P::I32(n) => MapKey::Int(*n as i64),
        P::I64(n) => MapKey::Int(*n),
        P::U32(n) => MapKey::UInt(*n as u64),
        P::U64(n) => MapKey::UInt(*n),
        P::String(s) => MapKey::String(Arc::from(s.as_str())),
    }
}

fn int_field(message: &DynamicMessage, name: &str) -> i64 {
    message
        .descriptor()
        .get_field_by_name(name)
        .map(|fd| match message.get_field(&fd).as_ref() {
            prost_reflect::Value::I64(n) => *n,
            prost_reflect::Value::I32(n) => *n as i64,
            _ => 0,
        })
        .unwrap_or(0)
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Message(a), Value::Message(b)) => a == b,
            // Numerics compare across representations.
            (Value::Int(_), _)
            | (Value::UInt(_), _)
            | (Value::Double(_), _) => self.partial_cmp(other) == Some(Ordering::Equal),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Arc::from(v.as_str()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(Arc::new(v))
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(Arc::new(v))
    }
}

impl From<EvalError> for Value {
    fn from(err: EvalError) -> Self {
        Value::error(err)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::UInt(n) => write!(f, "{}u", n),
            Value::Double(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Bytes(b) => write!(f, "b\"{}\"", String::from_utf8_lossy(b)),
            Value::List(elems) => {
                write!(f, "[")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", elem)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Timestamp(t) => write!(f, "timestamp({}s {}n)", t.seconds, t.nanos),
            Value::Duration(d) => write!(f, "duration({}s {}n)", d.seconds, d.nanos),
            Value::Message(m) => write!(f, "{}{{..}}", m.descriptor().full_name()),
            Value::Error(e) => write!(f, "error: {}", e),
        }
    }
}
