//! CEL type system with parameterized types.
//!
//! `CelType` is the compile-time type representation used by declarations,
//! the checker, and the rule engine's type mapper. It supports parameterized
//! collections (`list<T>`, `map<K, V>`) and named protobuf message types.

use std::fmt;
use std::sync::Arc;

/// A CEL type as seen by the type checker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CelType {
    /// Boolean type.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// Unsigned 64-bit integer.
    UInt,
    /// 64-bit floating point.
    Double,
    /// Unicode string.
    String,
    /// Byte sequence.
    Bytes,
    /// Homogeneous list with element type: `list<T>`.
    List(Arc<CelType>),
    /// Key-value map with key and value types: `map<K, V>`.
    Map(Arc<CelType>, Arc<CelType>),
    /// google.protobuf.Timestamp.
    Timestamp,
    /// google.protobuf.Duration.
    Duration,
    /// Null value.
    Null,
    /// Dynamic type, compatible with any type.
    Dyn,
    /// google.protobuf.Any.
    Any,
    /// Protobuf message type with fully qualified name.
    Message(Arc<str>),
    /// Error type, used when type inference fails so checking can continue.
    Error,
}

impl CelType {
    /// Create a list type with the given element type.
    pub fn list(elem: CelType) -> Self {
        CelType::List(Arc::new(elem))
    }

    /// Create a map type with the given key and value types.
    pub fn map(key: CelType, value: CelType) -> Self {
        CelType::Map(Arc::new(key), Arc::new(value))
    }

    /// Create a message type with the given fully qualified name.
    pub fn message(name: &str) -> Self {
        CelType::Message(Arc::from(name))
    }

    /// Returns true if this is a primitive type.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            CelType::Bool
                | CelType::Int
                | CelType::UInt
                | CelType::Double
                | CelType::String
                | CelType::Bytes
        )
    }

    /// Returns true if this is a numeric type (int, uint, or double).
    pub fn is_numeric(&self) -> bool {
        matches!(self, CelType::Int | CelType::UInt | CelType::Double)
    }

    /// Returns true if this type is assignable from another type.
    ///
    /// Type `a` is assignable from type `b` if a value of type `b` can be
    /// used where a value of type `a` is expected. `dyn`, `any`, and the
    /// error type are compatible with everything; lists and maps are
    /// covariant in their parameters.
    pub fn is_assignable_from(&self, other: &CelType) -> bool {
        if self == other {
            return true;
        }

        if matches!(self, CelType::Dyn | CelType::Any | CelType::Error)
            || matches!(other, CelType::Dyn | CelType::Any | CelType::Error)
        {
            return true;
        }

        match (self, other) {
            (CelType::List(self_elem), CelType::List(other_elem)) => {
                self_elem.is_assignable_from(other_elem)
            }
            (CelType::Map(self_key, self_val), CelType::Map(other_key, other_val)) => {
                self_key.is_assignable_from(other_key) && self_val.is_assignable_from(other_val)
            }
            _ => false,
        }
    }

    /// Get the element type of a list, or None if not a list.
    pub fn list_elem(&self) -> Option<&CelType> {
        match self {
            CelType::List(elem) => Some(elem),
            _ => None,
        }
    }

    /// Get the key and value types of a map, or None if not a map.
    pub fn map_types(&self) -> Option<(&CelType, &CelType)> {
        match self {
            CelType::Map(key, val) => Some((key, val)),
            _ => None,
        }
    }

    /// Get the message name if this is a message type.
    pub fn message_name(&self) -> Option<&str> {
        match self {
            CelType::Message(name) => Some(name),
            _ => None,
        }
    }

    /// Returns the display name of this type as used in error messages.
    pub fn display_name(&self) -> String {
        match self {
            CelType::Bool => "bool".to_string(),
            CelType::Int => "int".to_string(),
            CelType::UInt => "uint".to_string(),
            CelType::Double => "double".to_string(),
            CelType::String => "string".to_string(),
            CelType::Bytes => "bytes".to_string(),
            CelType::List(elem) => format!("list<{}>", elem.display_name()),
            CelType::Map(key, val) => {
                format!("map<{}, {}>", key.display_name(), val.display_name())
            }
            CelType::Timestamp => "timestamp".to_string(),
            CelType::Duration => "duration".to_string(),
            CelType::Null => "null".to_string(),
            CelType::Dyn => "dyn".to_string(),
            CelType::Any => "any".to_string(),
            CelType::Message(name) => name.to_string(),
            CelType::Error => "error".to_string(),
        }
    }
}

impl fmt::Display for CelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
