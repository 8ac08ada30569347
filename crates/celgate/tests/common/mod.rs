//! Common fixtures for celgate integration tests.
//!
//! Descriptors are built in code and loaded into a fresh pool, so the
//! tests need no protoc run. The schema mirrors a small gateway-facing
//! service:
//!
//! ```proto
//! package demo.v1;
//!
//! message Ref { string name = 1; string value = 2; }
//! message CreateRequest {
//!     string name = 1;
//!     Ref ref = 2;
//!     repeated string tags = 3;
//!     int64 count = 4;
//! }
//! message PingRequest { string ping = 1; }
//! message PingResponse {}
//!
//! service Demo {
//!     rpc Send(PingRequest) returns (PingResponse);
//!     rpc Create(CreateRequest) returns (PingResponse);
//! }
//! ```

use prost_reflect::{DescriptorPool, DynamicMessage, Value};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FieldMask, FileDescriptorProto,
    MethodDescriptorProto, ServiceDescriptorProto,
};

fn string_field(name: &str, number: i32) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        r#type: Some(Type::String as i32),
        ..Default::default()
    }
}

pub fn demo_pool() -> DescriptorPool {
    let file = FileDescriptorProto {
        name: Some("demo/v1/demo.proto".to_string()),
        package: Some("demo.v1".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            DescriptorProto {
                name: Some("Ref".to_string()),
                field: vec![string_field("name", 1), string_field("value", 2)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("CreateRequest".to_string()),
                field: vec![
                    string_field("name", 1),
                    FieldDescriptorProto {
                        name: Some("ref".to_string()),
                        number: Some(2),
                        r#type: Some(Type::Message as i32),
                        type_name: Some(".demo.v1.Ref".to_string()),
                        ..Default::default()
                    },
                    FieldDescriptorProto {
                        name: Some("tags".to_string()),
                        number: Some(3),
                        label: Some(Label::Repeated as i32),
                        r#type: Some(Type::String as i32),
                        ..Default::default()
                    },
                    FieldDescriptorProto {
                        name: Some("count".to_string()),
                        number: Some(4),
                        r#type: Some(Type::Int64 as i32),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("PingRequest".to_string()),
                field: vec![string_field("ping", 1)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("PingResponse".to_string()),
                ..Default::default()
            },
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("Demo".to_string()),
            method: vec![
                MethodDescriptorProto {
                    name: Some("Send".to_string()),
                    input_type: Some(".demo.v1.PingRequest".to_string()),
                    output_type: Some(".demo.v1.PingResponse".to_string()),
                    ..Default::default()
                },
                MethodDescriptorProto {
                    name: Some("Create".to_string()),
                    input_type: Some(".demo.v1.CreateRequest".to_string()),
                    output_type: Some(".demo.v1.PingResponse".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
        ..Default::default()
    };
    let mut pool = DescriptorPool::new();
    pool.add_file_descriptor_proto(file).expect("valid fixture");
    pool
}

pub fn config(json: &str) -> celgate::Config {
    serde_json::from_str(json).expect("valid config fixture")
}

#[allow(dead_code)]
pub fn mask(paths: &[&str]) -> FieldMask {
    FieldMask {
        paths: paths.iter().map(|p| p.to_string()).collect(),
    }
}

#[allow(dead_code)]
pub fn ping_request(pool: &DescriptorPool, ping: &str) -> DynamicMessage {
    let descriptor = pool.get_message_by_name("demo.v1.PingRequest").unwrap();
    let mut message = DynamicMessage::new(descriptor);
    if !ping.is_empty() {
        message.set_field_by_name("ping", Value::String(ping.to_string()));
    }
    message
}

/// A `CreateRequest` with the given scalar fields; empty strings stay
/// unset.
#[allow(dead_code)]
pub fn create_request(
    pool: &DescriptorPool,
    name: &str,
    ref_name: &str,
    ref_value: &str,
) -> DynamicMessage {
    let descriptor = pool.get_message_by_name("demo.v1.CreateRequest").unwrap();
    let mut message = DynamicMessage::new(descriptor);
    if !name.is_empty() {
        message.set_field_by_name("name", Value::String(name.to_string()));
    }
    if !ref_name.is_empty() || !ref_value.is_empty() {
        let ref_desc = pool.get_message_by_name("demo.v1.Ref").unwrap();
        let mut reference = DynamicMessage::new(ref_desc);
        if !ref_name.is_empty() {
            reference.set_field_by_name("name", Value::String(ref_name.to_string()));
        }
        if !ref_value.is_empty() {
            reference.set_field_by_name("value", Value::String(ref_value.to_string()));
        }
        message.set_field_by_name("ref", Value::Message(reference));
    }
    message
}
