//! Protobuf type registry for schema-aware type checking.
//!
//! Wraps a `prost_reflect::DescriptorPool` so the checker can resolve
//! message field types. Descriptors are assumed to be fully resolved and
//! linked before they reach this crate.

use prost_reflect::{DescriptorPool, FieldDescriptor, Kind, MessageDescriptor};

use crate::types::CelType;

/// Registry for protobuf type information.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    pool: DescriptorPool,
}

impl TypeRegistry {
    /// Create a registry from a descriptor pool.
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// The underlying descriptor pool.
    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Get a message descriptor by fully qualified name.
    pub fn get_message(&self, name: &str) -> Option<MessageDescriptor> {
        self.pool.get_message_by_name(name)
    }

    /// Get the type of a field in a message.
    pub fn field_type(&self, message_name: &str, field_name: &str) -> Option<CelType> {
        let message = self.get_message(message_name)?;
        let field = message.get_field_by_name(field_name)?;
        Some(field_to_cel_type(&field))
    }
}

/// Map a field descriptor to its CEL type.
///
/// Map fields become map types keyed by their declared key type; repeated
/// fields become lists; enums widen to int; the well-known time types map
/// to the timestamp/duration primitives.
pub fn field_to_cel_type(field: &FieldDescriptor) -> CelType {
    if field.is_map() {
        // Map fields carry a synthetic entry message with key/value fields.
        if let Kind::Message(entry) = field.kind() {
            let key = entry
                .get_field_by_name("key")
                .map(|f| kind_to_cel_type(&f.kind()))
                .unwrap_or(CelType::Dyn);
            let value = entry
                .get_field_by_name("value")
                .map(|f| kind_to_cel_type(&f.kind()))
                .unwrap_or(CelType::Dyn);
            return CelType::map(key, value);
        }
        return CelType::map(CelType::Dyn, CelType::Dyn);
    }

    let base = kind_to_cel_type(&field.kind());
    if field.is_list() {
        CelType::list(base)
    } else {
        base
    }
}

/// Map a protobuf kind to its CEL type.
pub fn kind_to_cel_type(kind: &Kind) -> CelType {
    match kind {
        Kind::Bool => CelType::Bool,
        Kind::Int32 | Kind::Int64 | Kind::Sint32 | Kind::Sint64 | Kind::Sfixed32
        | Kind::Sfixed64 => CelType::Int,
        Kind::Uint32 | Kind::Uint64 | Kind::Fixed32 | Kind::Fixed64 => CelType::UInt,
        Kind::Float | Kind::Double => CelType::Double,
        Kind::String => CelType::String,
        Kind::Bytes => CelType::Bytes,
        Kind::Enum(_) => CelType::Int,
        Kind::Message(message) => match message.full_name() {
            "google.protobuf.Timestamp" => CelType::Timestamp,
            "google.protobuf.Duration" => CelType::Duration,
            "google.protobuf.Any" => CelType::Any,
            name => CelType::message(name),
        },
    }
}
