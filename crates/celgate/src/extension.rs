//! Extraction of rule data and resource annotations from descriptor options.
//!
//! Rule data travels inside descriptor options as extensions of the
//! `google.protobuf.*Options` messages, keyed by the well-known identifiers
//! in [`well_known`]. Schemas compiled against `celgate/annotations.proto`
//! carry them; [`annotations_file`] provides that file's descriptor so hosts
//! can register it into the pool their descriptor sets load into.
//!
//! Resource annotations use the standard `google.api` options
//! (`resource`, `resource_reference`, `field_behavior`).

use prost_reflect::{
    DynamicMessage, FieldDescriptor, FileDescriptor, MessageDescriptor, MethodDescriptor,
    ReflectMessage, ServiceDescriptor, Value as ProtoValue,
};
use prost_types::{
    field_descriptor_proto, DescriptorProto, FieldDescriptorProto, FileDescriptorProto,
    MessageOptions,
};

use crate::error::Error;
use crate::rule::{FieldRule, ProgramDecl, Rule};
use crate::typemap::{DeclaredType, FunctionSignature};

/// Fully-qualified names of the extensions the engine reads.
pub mod well_known {
    /// `celgate.Rule` on `google.protobuf.FileOptions`.
    pub const FILE_RULES: &str = "celgate.file_rules";
    /// `celgate.Rule` on `google.protobuf.ServiceOptions`.
    pub const SERVICE_RULES: &str = "celgate.service_rules";
    /// `celgate.Rule` on `google.protobuf.MethodOptions`.
    pub const METHOD_RULES: &str = "celgate.method_rules";
    /// `celgate.Rule` on `google.protobuf.MessageOptions`.
    pub const MESSAGE_RULES: &str = "celgate.message_rules";
    /// `celgate.FieldRule` on `google.protobuf.FieldOptions`.
    pub const FIELD_RULES: &str = "celgate.field_rules";
    /// `google.api.ResourceDescriptor` on message options.
    pub const RESOURCE: &str = "google.api.resource";
    /// `google.api.ResourceReference` on field options.
    pub const RESOURCE_REFERENCE: &str = "google.api.resource_reference";
    /// `repeated google.api.FieldBehavior` on field options.
    pub const FIELD_BEHAVIOR: &str = "google.api.field_behavior";
}

/// `google.api.FieldBehavior.REQUIRED`.
const FIELD_BEHAVIOR_REQUIRED: i32 = 2;

/// Rule data embedded in a file's options, if any.
pub fn file_rule(file: &FileDescriptor) -> Result<Option<Rule>, Error> {
    rule_extension(&file.options(), well_known::FILE_RULES)
}

/// Rule data embedded in a service's options, if any.
pub fn service_rule(service: &ServiceDescriptor) -> Result<Option<Rule>, Error> {
    rule_extension(&service.options(), well_known::SERVICE_RULES)
}

/// Rule data embedded in a method's options, if any.
pub fn method_rule(method: &MethodDescriptor) -> Result<Option<Rule>, Error> {
    rule_extension(&method.options(), well_known::METHOD_RULES)
}

/// Rule data embedded in a message's options, if any.
pub fn message_rule(message: &MessageDescriptor) -> Result<Option<Rule>, Error> {
    rule_extension(&message.options(), well_known::MESSAGE_RULES)
}

/// Rule data embedded in a field's options, if any.
pub fn field_rule(field: &FieldDescriptor) -> Result<Option<FieldRule>, Error> {
    match extension_message(&field.options(), well_known::FIELD_RULES) {
        Some(message) => decode_field_rule(&message).map(Some),
        None => Ok(None),
    }
}

/// Whether the field carries the `REQUIRED` field behavior annotation.
pub fn field_required(field: &FieldDescriptor) -> bool {
    let options = field.options();
    for (ext, value) in options.extensions() {
        if ext.full_name() == well_known::FIELD_BEHAVIOR {
            if let ProtoValue::List(behaviors) = value {
                return behaviors
                    .iter()
                    .any(|b| b.as_enum_number() == Some(FIELD_BEHAVIOR_REQUIRED));
            }
        }
    }
    false
}

/// A message's declared resource type and its name patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAnnotation {
    /// The resource type name (e.g. `library.googleapis.com/Book`).
    pub type_name: String,
    /// Name patterns with `{...}` placeholders (e.g. `shelves/{shelf}`).
    pub patterns: Vec<String>,
}

/// The resource annotation on a message, if any.
pub fn resource(message: &MessageDescriptor) -> Option<ResourceAnnotation> {
    let options = message.options();
    let ann = extension_message(&options, well_known::RESOURCE)?;
    Some(ResourceAnnotation {
        type_name: str_field(&ann, "type"),
        patterns: string_list_field(&ann, "pattern"),
    })
}

/// A field's declared reference to a resource type.
///
/// At most one of the two names is expected to be set; the resolver reports
/// the conflict when both are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceReference {
    /// Exact resource type the field names.
    pub type_name: String,
    /// Resource type the field names a child of.
    pub child_type: String,
}

/// The resource reference annotation on a field, if any.
pub fn resource_reference(field: &FieldDescriptor) -> Option<ResourceReference> {
    let options = field.options();
    let ann = extension_message(&options, well_known::RESOURCE_REFERENCE)?;
    let reference = ResourceReference {
        type_name: str_field(&ann, "type"),
        child_type: str_field(&ann, "child_type"),
    };
    if reference.type_name.is_empty() && reference.child_type.is_empty() {
        return None;
    }
    Some(reference)
}

/// Decode a `celgate.Rule` message.
pub fn decode_rule(message: &DynamicMessage) -> Result<Rule, Error> {
    let mut rule = Rule::default();
    for program in message_list_field(message, "programs") {
        rule.programs.push(ProgramDecl {
            id: str_field(&program, "id"),
            expression: str_field(&program, "expression"),
        });
    }
    rule.options.globals.constants = string_map_field(message, "constants");
    rule.options.globals.functions = string_map_field(message, "functions");
    for (name, signature) in message_map_field(message, "overload_functions") {
        rule.options
            .overloads
            .functions
            .insert(name, decode_signature(&signature)?);
    }
    for (name, declared) in string_map_field(message, "overload_variables") {
        rule.options
            .overloads
            .variables
            .insert(name, DeclaredType::parse(&declared)?);
    }
    rule.options.stdlib_overriding = bool_field(message, "stdlib_overriding");
    Ok(rule)
}

/// Decode a `celgate.FieldRule` message.
pub fn decode_field_rule(message: &DynamicMessage) -> Result<FieldRule, Error> {
    let rule = match message_field(message, "rule") {
        Some(rule) => decode_rule(&rule)?,
        None => Rule::default(),
    };
    Ok(FieldRule {
        rule,
        required: bool_field(message, "required"),
    })
}

fn decode_signature(message: &DynamicMessage) -> Result<FunctionSignature, Error> {
    let args = string_list_field(message, "args")
        .iter()
        .map(|arg| DeclaredType::parse(arg))
        .collect::<Result<Vec<_>, _>>()?;
    let result = DeclaredType::parse(&str_field(message, "result"))?;
    Ok(FunctionSignature {
        args,
        result,
        member: bool_field(message, "member"),
    })
}

fn rule_extension(options: &DynamicMessage, name: &str) -> Result<Option<Rule>, Error> {
    match extension_message(options, name) {
        Some(message) => decode_rule(&message).map(Some),
        None => Ok(None),
    }
}

fn extension_message(options: &DynamicMessage, name: &str) -> Option<DynamicMessage> {
    options.extensions().find_map(|(ext, value)| {
        if ext.full_name() == name {
            value.as_message().cloned()
        } else {
            None
        }
    })
}

fn str_field(message: &DynamicMessage, name: &str) -> String {
    message
        .get_field_by_name(name)
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn bool_field(message: &DynamicMessage, name: &str) -> bool {
    message
        .get_field_by_name(name)
        .and_then(|value| value.as_bool())
        .unwrap_or(false)
}

fn message_field(message: &DynamicMessage, name: &str) -> Option<DynamicMessage> {
    let descriptor = message.descriptor().get_field_by_name(name)?;
    if !message.has_field(&descriptor) {
        return None;
    }
    message
        .get_field(&descriptor)
        .as_message()
        .cloned()
}

fn string_list_field(message: &DynamicMessage, name: &str) -> Vec<String> {
    message
        .get_field_by_name(name)
        .and_then(|value| {
            value.as_list().map(|list| {
                list.iter()
                    .filter_map(|elem| elem.as_str().map(str::to_string))
                    .collect()
            })
        })
        .unwrap_or_default()
}

fn message_list_field(message: &DynamicMessage, name: &str) -> Vec<DynamicMessage> {
    message
        .get_field_by_name(name)
        .and_then(|value| {
            value.as_list().map(|list| {
                list.iter()
                    .filter_map(|elem| elem.as_message().cloned())
                    .collect()
            })
        })
        .unwrap_or_default()
}

fn string_map_field(
    message: &DynamicMessage,
    name: &str,
) -> std::collections::BTreeMap<String, String> {
    message
        .get_field_by_name(name)
        .and_then(|value| {
            value.as_map().map(|map| {
                map.iter()
                    .filter_map(|(key, value)| {
                        let prost_reflect::MapKey::String(key) = key else {
                            return None;
                        };
                        Some((key.clone(), value.as_str()?.to_string()))
                    })
                    .collect()
            })
        })
        .unwrap_or_default()
}

fn message_map_field(
    message: &DynamicMessage,
    name: &str,
) -> std::collections::BTreeMap<String, DynamicMessage> {
    message
        .get_field_by_name(name)
        .and_then(|value| {
            value.as_map().map(|map| {
                map.iter()
                    .filter_map(|(key, value)| {
                        let prost_reflect::MapKey::String(key) = key else {
                            return None;
                        };
                        Some((key.clone(), value.as_message()?.clone()))
                    })
                    .collect()
            })
        })
        .unwrap_or_default()
}

/// The `celgate/annotations.proto` file descriptor.
///
/// Hosts add this to the descriptor pool their schemas load into so that
/// rule extensions on descriptor options decode. Schemas produced by a
/// compiler that already imported the annotations file carry it themselves.
pub fn annotations_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("celgate/annotations.proto".to_string()),
        package: Some("celgate".to_string()),
        dependency: vec!["google/protobuf/descriptor.proto".to_string()],
        syntax: Some("proto3".to_string()),
        message_type: vec![
            rule_descriptor(),
            program_descriptor(),
            signature_descriptor(),
            field_rule_descriptor(),
        ],
        extension: vec![
            rule_extension_field("file_rules", ".google.protobuf.FileOptions"),
            rule_extension_field("service_rules", ".google.protobuf.ServiceOptions"),
            rule_extension_field("method_rules", ".google.protobuf.MethodOptions"),
            rule_extension_field("message_rules", ".google.protobuf.MessageOptions"),
            FieldDescriptorProto {
                name: Some("field_rules".to_string()),
                number: Some(50000),
                label: Some(field_descriptor_proto::Label::Optional as i32),
                r#type: Some(field_descriptor_proto::Type::Message as i32),
                type_name: Some(".celgate.FieldRule".to_string()),
                extendee: Some(".google.protobuf.FieldOptions".to_string()),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

fn rule_descriptor() -> DescriptorProto {
    DescriptorProto {
        name: Some("Rule".to_string()),
        field: vec![
            message_field_proto("programs", 1, ".celgate.Program", true),
            map_field_proto("constants", 2, ".celgate.Rule.ConstantsEntry"),
            map_field_proto("functions", 3, ".celgate.Rule.FunctionsEntry"),
            map_field_proto(
                "overload_functions",
                4,
                ".celgate.Rule.OverloadFunctionsEntry",
            ),
            map_field_proto(
                "overload_variables",
                5,
                ".celgate.Rule.OverloadVariablesEntry",
            ),
            scalar_field_proto(
                "stdlib_overriding",
                6,
                field_descriptor_proto::Type::Bool,
            ),
        ],
        nested_type: vec![
            map_entry_descriptor("ConstantsEntry", field_descriptor_proto::Type::String, None),
            map_entry_descriptor("FunctionsEntry", field_descriptor_proto::Type::String, None),
            map_entry_descriptor(
                "OverloadFunctionsEntry",
                field_descriptor_proto::Type::Message,
                Some(".celgate.Signature"),
            ),
            map_entry_descriptor(
                "OverloadVariablesEntry",
                field_descriptor_proto::Type::String,
                None,
            ),
        ],
        ..Default::default()
    }
}

fn program_descriptor() -> DescriptorProto {
    DescriptorProto {
        name: Some("Program".to_string()),
        field: vec![
            scalar_field_proto("id", 1, field_descriptor_proto::Type::String),
            scalar_field_proto("expression", 2, field_descriptor_proto::Type::String),
        ],
        ..Default::default()
    }
}

fn signature_descriptor() -> DescriptorProto {
    DescriptorProto {
        name: Some("Signature".to_string()),
        field: vec![
            FieldDescriptorProto {
                name: Some("args".to_string()),
                number: Some(1),
                label: Some(field_descriptor_proto::Label::Repeated as i32),
                r#type: Some(field_descriptor_proto::Type::String as i32),
                ..Default::default()
            },
            scalar_field_proto("result", 2, field_descriptor_proto::Type::String),
            scalar_field_proto("member", 3, field_descriptor_proto::Type::Bool),
        ],
        ..Default::default()
    }
}

fn field_rule_descriptor() -> DescriptorProto {
    DescriptorProto {
        name: Some("FieldRule".to_string()),
        field: vec![
            message_field_proto("rule", 1, ".celgate.Rule", false),
            scalar_field_proto("required", 2, field_descriptor_proto::Type::Bool),
        ],
        ..Default::default()
    }
}

fn rule_extension_field(name: &str, extendee: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(50000),
        label: Some(field_descriptor_proto::Label::Optional as i32),
        r#type: Some(field_descriptor_proto::Type::Message as i32),
        type_name: Some(".celgate.Rule".to_string()),
        extendee: Some(extendee.to_string()),
        ..Default::default()
    }
}

fn scalar_field_proto(
    name: &str,
    number: i32,
    field_type: field_descriptor_proto::Type,
) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(field_descriptor_proto::Label::Optional as i32),
        r#type: Some(field_type as i32),
        ..Default::default()
    }
}

fn message_field_proto(
    name: &str,
    number: i32,
    type_name: &str,
    repeated: bool,
) -> FieldDescriptorProto {
    let label = if repeated {
        field_descriptor_proto::Label::Repeated
    } else {
        field_descriptor_proto::Label::Optional
    };
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(field_descriptor_proto::Type::Message as i32),
        type_name: Some(type_name.to_string()),
        ..Default::default()
    }
}

fn map_field_proto(name: &str, number: i32, entry_type: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(field_descriptor_proto::Label::Repeated as i32),
        r#type: Some(field_descriptor_proto::Type::Message as i32),
        type_name: Some(entry_type.to_string()),
        ..Default::default()
    }
}

fn map_entry_descriptor(
    name: &str,
    value_type: field_descriptor_proto::Type,
    value_type_name: Option<&str>,
) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: vec![
            scalar_field_proto("key", 1, field_descriptor_proto::Type::String),
            FieldDescriptorProto {
                name: Some("value".to_string()),
                number: Some(2),
                label: Some(field_descriptor_proto::Label::Optional as i32),
                r#type: Some(value_type as i32),
                type_name: value_type_name.map(str::to_string),
                ..Default::default()
            },
        ],
        options: Some(MessageOptions {
            map_entry: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;

    fn annotations_pool() -> DescriptorPool {
        let mut pool = DescriptorPool::global();
        pool.add_file_descriptor_proto(annotations_file()).unwrap();
        pool
    }

    fn rule_message(pool: &DescriptorPool, text: &str) -> DynamicMessage {
        let descriptor = pool.get_message_by_name("celgate.Rule").unwrap();
        DynamicMessage::parse_text_format(descriptor, text).unwrap()
    }

    #[test]
    fn decodes_rule_from_dynamic_message() {
        let pool = annotations_pool();
        let message = rule_message(
            &pool,
            r#"
            programs { id: "authz" expression: "true" }
            programs { id: "sane" expression: "1 == 1" }
            constants { key: "env" value: "prod" }
            functions { key: "is_prod" value: "env == 'prod'" }
            overload_variables { key: "roles" value: "list<string>" }
            stdlib_overriding: true
            "#,
        );

        let rule = decode_rule(&message).unwrap();
        assert_eq!(rule.programs.len(), 2);
        assert_eq!(rule.programs[0].id, "authz");
        assert_eq!(rule.options.globals.constants["env"], "prod");
        assert_eq!(rule.options.globals.functions["is_prod"], "env == 'prod'");
        assert!(rule.options.overloads.variables.contains_key("roles"));
        assert!(rule.options.stdlib_overriding);
    }

    #[test]
    fn decodes_overload_function_signatures() {
        let pool = annotations_pool();
        let message = rule_message(
            &pool,
            r#"
            overload_functions {
                key: "allowed"
                value { args: "string" args: "list<string>" result: "bool" member: true }
            }
            "#,
        );

        let rule = decode_rule(&message).unwrap();
        let signature = &rule.options.overloads.functions["allowed"];
        assert_eq!(signature.args.len(), 2);
        assert!(signature.member);
    }

    #[test]
    fn bad_declared_type_is_an_error() {
        let pool = annotations_pool();
        let message = rule_message(
            &pool,
            r#"overload_variables { key: "x" value: "list<" }"#,
        );
        assert!(matches!(
            decode_rule(&message),
            Err(Error::InvalidDeclaredType { .. })
        ));
    }

    #[test]
    fn decodes_field_rule_with_required_flag() {
        let pool = annotations_pool();
        let descriptor = pool.get_message_by_name("celgate.FieldRule").unwrap();
        let message = DynamicMessage::parse_text_format(
            descriptor,
            r#"rule { programs { id: "not_empty" expression: "name != ''" } } required: true"#,
        )
        .unwrap();

        let field_rule = decode_field_rule(&message).unwrap();
        assert!(field_rule.required);
        assert_eq!(field_rule.rule.programs[0].id, "not_empty");
    }

    #[test]
    fn extension_round_trip_through_options() {
        let pool = annotations_pool();
        let ext = pool
            .get_extension_by_name(well_known::MESSAGE_RULES)
            .unwrap();
        let rule = rule_message(&pool, r#"programs { id: "p" expression: "true" }"#);

        let options_desc = pool
            .get_message_by_name("google.protobuf.MessageOptions")
            .unwrap();
        let mut options = DynamicMessage::new(options_desc);
        options.set_extension(&ext, ProtoValue::Message(rule));

        let decoded = rule_extension(&options, well_known::MESSAGE_RULES)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.programs[0].id, "p");
    }

    #[test]
    fn absent_extension_is_none() {
        let pool = annotations_pool();
        let options_desc = pool
            .get_message_by_name("google.protobuf.MessageOptions")
            .unwrap();
        let options = DynamicMessage::new(options_desc);
        assert!(rule_extension(&options, well_known::MESSAGE_RULES)
            .unwrap()
            .is_none());
    }
}
