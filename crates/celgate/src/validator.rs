//! Validators and the fieldmask-aware partial validation algorithm.
//!
//! A validator binds compiled programs to a descriptor. Service validators
//! gate the caller first and the selected method second; message validators
//! walk the subset of fields a mask selects, failing absent required fields
//! ahead of their rules, and recurse into nested messages through a
//! [`ValidatorSource`] so nested validators stay memoized in one place.

use std::collections::BTreeMap;
use std::sync::Arc;

use prost_reflect::{
    DynamicMessage, FieldDescriptor, MessageDescriptor, MethodDescriptor, ReflectMessage,
    ServiceDescriptor,
};
use prost_types::FieldMask;

use celgate_cel::activation::{Activation, MapActivation};
use celgate_cel::Value;

use crate::compile::CompiledProgram;
use crate::context::AttributeContext;
use crate::envbuild::{self, ATTRIBUTE_CONTEXT_VAR, HEADERS_VAR, REQUEST_VAR};
use crate::error::{Error, ValidationError};

/// Resolves nested message validators during mask recursion.
pub trait ValidatorSource: Send + Sync {
    fn message_validator(&self, message: &MessageDescriptor)
        -> Result<Arc<MessageValidator>, Error>;
}

/// Compiled programs bound to a single field.
#[derive(Debug)]
pub struct FieldValidator {
    field: FieldDescriptor,
    required: bool,
    programs: Vec<CompiledProgram>,
}

impl FieldValidator {
    pub fn new(field: FieldDescriptor, required: bool, programs: Vec<CompiledProgram>) -> Self {
        Self {
            field,
            required,
            programs,
        }
    }

    /// Whether the field must carry a non-default value.
    pub fn required(&self) -> bool {
        self.required
    }

    pub fn has_validators(&self) -> bool {
        self.required || !self.programs.is_empty()
    }

    /// Run the field's programs against the enclosing message's field
    /// values.
    fn run(&self, message: &DynamicMessage) -> Result<(), ValidationError> {
        if self.programs.is_empty() {
            return Ok(());
        }
        let activation = field_activation(message);
        run_programs(&self.programs, &activation, self.field.full_name(), None)
    }
}

/// Compiled programs bound to a message, with its field validators.
pub struct MessageValidator {
    message: MessageDescriptor,
    programs: Vec<CompiledProgram>,
    fields: BTreeMap<String, FieldValidator>,
    source: Option<Arc<dyn ValidatorSource>>,
}

impl std::fmt::Debug for MessageValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageValidator")
            .field("message", &self.message.full_name())
            .field("programs", &self.programs.len())
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MessageValidator {
    pub fn new(
        message: MessageDescriptor,
        programs: Vec<CompiledProgram>,
        fields: BTreeMap<String, FieldValidator>,
    ) -> Self {
        Self {
            message,
            programs,
            fields,
            source: None,
        }
    }

    /// Attach the source nested-mask recursion resolves validators
    /// through.
    pub fn with_source(mut self, source: Arc<dyn ValidatorSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// The validated message type.
    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.message
    }

    /// Whether any rule is attached at the message or field level.
    pub fn has_validators(&self) -> bool {
        !self.programs.is_empty() || self.fields.values().any(FieldValidator::has_validators)
    }

    /// Validate every declared field plus the message-level rule.
    pub fn validate(&self, message: &DynamicMessage) -> Result<(), Error> {
        let mask = FieldMask {
            paths: vec!["*".to_string()],
        };
        self.validate_with_mask(message, Some(&mask))
    }

    /// Validate the subset of `message` the mask selects.
    ///
    /// No mask means the fields the message has explicitly set; `["*"]`
    /// means every declared field plus, once, the message-level rule;
    /// otherwise each dotted path selects a top-level field and the
    /// remainder recurses into the nested validator. An absent required
    /// field fails before its rule is consulted; otherwise the field's
    /// rule runs against the value the mask selected, default or not.
    pub fn validate_with_mask(
        &self,
        message: &DynamicMessage,
        mask: Option<&FieldMask>,
    ) -> Result<(), Error> {
        let plan = self.partition(message, mask);
        if plan.whole_message {
            let activation = field_activation(message);
            run_programs(
                &self.programs,
                &activation,
                self.message.full_name(),
                None,
            )?;
        }

        for (field_name, sub_paths) in plan.fields {
            let Some(field) = self.message.get_field_by_name(&field_name) else {
                return Err(Error::UnknownMaskField {
                    message: self.message.full_name().to_string(),
                    field: field_name,
                });
            };
            let value = Value::from_proto(message.get_field(&field).as_ref());
            let present = message.has_field(&field) || !value.is_default();
            let validator = self.fields.get(&field_name);

            // An absent required field fails before its rule is consulted,
            // so the two checks never both report for one field.
            if !present && validator.is_some_and(FieldValidator::required) {
                return Err(ValidationError::required_field(field.full_name()).into());
            }
            if let Some(validator) = validator {
                validator.run(message)?;
            }
            if !sub_paths.is_empty() && present {
                self.recurse(message, &field, sub_paths)?;
            }
        }
        Ok(())
    }

    fn recurse(
        &self,
        message: &DynamicMessage,
        field: &FieldDescriptor,
        sub_paths: Vec<String>,
    ) -> Result<(), Error> {
        if field.is_list() || field.is_map() {
            return Ok(());
        }
        let Some(nested_type) = envbuild::nested_message_type(field) else {
            return Ok(());
        };
        let source = self.source.as_ref().ok_or_else(|| {
            Error::MissingDescriptor(nested_type.full_name().to_string())
        })?;
        let validator = source.message_validator(&nested_type)?;

        let value = message.get_field(field);
        let Some(nested) = value.as_message() else {
            return Ok(());
        };
        let mask = FieldMask { paths: sub_paths };
        validator.validate_with_mask(nested, Some(&mask))
    }

    fn partition(&self, message: &DynamicMessage, mask: Option<&FieldMask>) -> MaskPlan {
        match mask {
            None => MaskPlan {
                whole_message: false,
                fields: message
                    .fields()
                    .map(|(field, _)| (field.name().to_string(), Vec::new()))
                    .collect(),
            },
            Some(mask) if mask.paths.len() == 1 && mask.paths[0] == "*" => MaskPlan {
                whole_message: true,
                fields: self
                    .message
                    .fields()
                    .map(|field| (field.name().to_string(), Vec::new()))
                    .collect(),
            },
            Some(mask) => {
                let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for path in &mask.paths {
                    if path.is_empty() {
                        continue;
                    }
                    match path.split_once('.') {
                        // A bare `*` sub-path means the whole field; it is
                        // not propagated into the recursion.
                        Some((top, "*")) => {
                            grouped.entry(top.to_string()).or_default();
                        }
                        Some((top, rest)) => {
                            grouped
                                .entry(top.to_string())
                                .or_default()
                                .push(rest.to_string());
                        }
                        None => {
                            grouped.entry(path.clone()).or_default();
                        }
                    }
                }
                MaskPlan {
                    whole_message: false,
                    fields: grouped.into_iter().collect(),
                }
            }
        }
    }
}

struct MaskPlan {
    /// True for the `["*"]` mask: run the message-level rule once.
    whole_message: bool,
    fields: Vec<(String, Vec<String>)>,
}

/// Compiled programs bound to a method.
#[derive(Debug)]
pub struct MethodValidator {
    method: MethodDescriptor,
    programs: Vec<CompiledProgram>,
}

impl MethodValidator {
    pub fn new(method: MethodDescriptor, programs: Vec<CompiledProgram>) -> Self {
        Self { method, programs }
    }

    pub fn has_validators(&self) -> bool {
        !self.programs.is_empty()
    }

    /// Run the method's programs against the caller context and request.
    pub fn validate(
        &self,
        context: &AttributeContext,
        request: &DynamicMessage,
    ) -> Result<(), Error> {
        let mut activation = caller_activation(context);
        activation.insert(REQUEST_VAR, Value::Message(Arc::new(request.clone())));
        run_programs(
            &self.programs,
            &activation,
            self.method.full_name(),
            Some(context),
        )?;
        Ok(())
    }
}

/// Compiled programs bound to a service, with its method validators.
#[derive(Debug)]
pub struct ServiceValidator {
    service: ServiceDescriptor,
    programs: Vec<CompiledProgram>,
    methods: BTreeMap<String, MethodValidator>,
}

impl ServiceValidator {
    pub fn new(
        service: ServiceDescriptor,
        programs: Vec<CompiledProgram>,
        methods: BTreeMap<String, MethodValidator>,
    ) -> Self {
        Self {
            service,
            programs,
            methods,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn has_validators(&self) -> bool {
        !self.programs.is_empty() || self.methods.values().any(MethodValidator::has_validators)
    }

    /// The validator for one method, if the operation names one.
    pub fn method(&self, name: &str) -> Option<&MethodValidator> {
        self.methods.get(name)
    }

    /// Authorize a call: service-level programs first, then the programs
    /// of the method the attribute context's operation names.
    pub fn validate(
        &self,
        context: &AttributeContext,
        request: &DynamicMessage,
    ) -> Result<(), Error> {
        let activation = caller_activation(context);
        run_programs(
            &self.programs,
            &activation,
            self.service.full_name(),
            Some(context),
        )?;

        let method = context
            .operation
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .and_then(|name| self.methods.get(name));
        match method {
            Some(method) => method.validate(context, request),
            None => Err(Error::MissingDescriptor(format!(
                "no method for operation '{}' in service '{}'",
                context.operation,
                self.service.full_name()
            ))),
        }
    }
}

/// Bindings for caller-facing scopes.
fn caller_activation(context: &AttributeContext) -> MapActivation {
    let mut activation = MapActivation::new();
    activation.insert(ATTRIBUTE_CONTEXT_VAR, context.to_value());
    activation.insert(HEADERS_VAR, context.headers.to_value());
    activation
}

/// Bindings for message-facing scopes: the message itself plus every field
/// value by name.
fn field_activation(message: &DynamicMessage) -> MapActivation {
    let mut activation = MapActivation::new();
    activation.insert(REQUEST_VAR, Value::Message(Arc::new(message.clone())));
    for field in message.descriptor().fields() {
        activation.insert(
            field.name(),
            Value::from_proto(message.get_field(&field).as_ref()),
        );
    }
    activation
}

/// Evaluate programs in order; the first non-true result fails the scope.
fn run_programs(
    programs: &[CompiledProgram],
    activation: &dyn Activation,
    descriptor: &str,
    context: Option<&AttributeContext>,
) -> Result<(), ValidationError> {
    for compiled in programs {
        let failure = match compiled.program().eval(activation) {
            Value::Bool(true) => continue,
            Value::Bool(false) => ValidationError::expression_failed(descriptor, compiled.id()),
            Value::Error(err) => {
                ValidationError::evaluation(descriptor, compiled.id(), err.to_string())
            }
            other => ValidationError::evaluation(
                descriptor,
                compiled.id(),
                format!("expected bool, got {}", other.type_name()),
            ),
        };
        return Err(match context {
            Some(context) => failure.with_context(context.summary()),
            None => failure,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile_rule;
    use crate::envbuild::{EnvBuilder, EnvScope};
    use crate::error::ValidationErrorKind;
    use crate::options::RuleOptions;
    use crate::rule::{ProgramDecl, Rule};
    use prost_reflect::DescriptorPool;
    use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};

    fn pool() -> DescriptorPool {
        use prost_types::field_descriptor_proto::Type;
        let string_field = |name: &str, number: i32| FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            r#type: Some(Type::String as i32),
            ..Default::default()
        };
        let file = FileDescriptorProto {
            name: Some("demo/v1/demo.proto".to_string()),
            package: Some("demo.v1".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("CreateRequest".to_string()),
                field: vec![string_field("name", 1), string_field("kind", 2)],
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file).unwrap();
        pool
    }

    fn field_programs(
        pool: &DescriptorPool,
        message: &MessageDescriptor,
        expression: &str,
    ) -> Vec<CompiledProgram> {
        let options = RuleOptions::default();
        let env = EnvBuilder::new(EnvScope::Field { message }, &options, pool)
            .build()
            .unwrap();
        let rule = Rule {
            programs: vec![ProgramDecl::new("rule", expression)],
            ..Default::default()
        };
        compile_rule(&rule, &env, message.full_name()).unwrap()
    }

    fn request(pool: &DescriptorPool, name: &str) -> DynamicMessage {
        let descriptor = pool.get_message_by_name("demo.v1.CreateRequest").unwrap();
        let mut message = DynamicMessage::new(descriptor);
        if !name.is_empty() {
            message.set_field_by_name("name", prost_reflect::Value::String(name.to_string()));
        }
        message
    }

    fn name_validator(pool: &DescriptorPool, required: bool) -> MessageValidator {
        let descriptor = pool.get_message_by_name("demo.v1.CreateRequest").unwrap();
        let field = descriptor.get_field_by_name("name").unwrap();
        let programs = field_programs(pool, &descriptor, "name != ''");
        let mut fields = BTreeMap::new();
        fields.insert(
            "name".to_string(),
            FieldValidator::new(field, required, programs),
        );
        MessageValidator::new(descriptor, Vec::new(), fields)
    }

    fn mask(paths: &[&str]) -> FieldMask {
        FieldMask {
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn masked_field_runs_its_rule() {
        let pool = pool();
        let validator = name_validator(&pool, false);

        let ok = request(&pool, "x");
        assert!(validator
            .validate_with_mask(&ok, Some(&mask(&["name"])))
            .is_ok());

        // The rule sees the default value when the mask names an unset
        // field, so `name != ''` rejects it.
        let empty = request(&pool, "");
        assert!(validator
            .validate_with_mask(&empty, Some(&mask(&["name"])))
            .is_err());
    }

    #[test]
    fn required_field_fails_only_when_absent() {
        let pool = pool();
        let validator = name_validator(&pool, true);

        let empty = request(&pool, "");
        let err = validator.validate(&empty).unwrap_err();
        let Error::Validation(err) = err else {
            panic!("expected a validation error");
        };
        assert_eq!(err.kind, ValidationErrorKind::RequiredFieldMissing);
        assert_eq!(err.descriptor, "demo.v1.CreateRequest.name");

        let ok = request(&pool, "x");
        assert!(validator.validate(&ok).is_ok());
    }

    #[test]
    fn unknown_mask_field_is_an_error() {
        let pool = pool();
        let validator = name_validator(&pool, false);
        let message = request(&pool, "x");
        assert!(matches!(
            validator.validate_with_mask(&message, Some(&mask(&["nope"]))),
            Err(Error::UnknownMaskField { .. })
        ));
    }

    #[test]
    fn nil_mask_checks_only_set_fields() {
        let pool = pool();
        let validator = name_validator(&pool, true);
        // Nothing is set, so nothing is inspected, including the required
        // check.
        let empty = request(&pool, "");
        assert!(validator.validate_with_mask(&empty, None).is_ok());
    }

    #[test]
    fn star_mask_runs_message_rule_once() {
        let pool = pool();
        let descriptor = pool.get_message_by_name("demo.v1.CreateRequest").unwrap();
        let programs = field_programs(&pool, &descriptor, "request.name != ''");
        let validator = MessageValidator::new(descriptor, programs, BTreeMap::new());

        let ok = request(&pool, "x");
        assert!(validator.validate(&ok).is_ok());

        let empty = request(&pool, "");
        let err = validator.validate(&empty).unwrap_err();
        assert!(err.to_string().contains("demo.v1.CreateRequest"));

        // Outside the star form the message rule does not run.
        assert!(validator
            .validate_with_mask(&empty, Some(&mask(&["name"])))
            .is_ok());
    }

    #[test]
    fn wildcard_sub_path_is_not_propagated() {
        let pool = pool();
        let validator = name_validator(&pool, false);
        // `name.*` collapses to `name`; recursion into a string field
        // would otherwise be attempted and there is no source attached.
        let message = request(&pool, "x");
        assert!(validator
            .validate_with_mask(&message, Some(&mask(&["name.*"])))
            .is_ok());
    }

    #[test]
    fn failure_names_program_and_descriptor() {
        let pool = pool();
        let descriptor = pool.get_message_by_name("demo.v1.CreateRequest").unwrap();
        let field = descriptor.get_field_by_name("name").unwrap();
        let programs = field_programs(&pool, &descriptor, "name == 'expected'");
        let mut fields = BTreeMap::new();
        fields.insert(
            "name".to_string(),
            FieldValidator::new(field, false, programs),
        );
        let validator = MessageValidator::new(descriptor, Vec::new(), fields);

        let message = request(&pool, "other");
        let err = validator
            .validate_with_mask(&message, Some(&mask(&["name"])))
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("rule 'rule'"));
        assert!(text.contains("demo.v1.CreateRequest.name"));
    }
}
