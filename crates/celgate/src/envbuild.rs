//! Per-scope compilation environments.
//!
//! Every scope's expressions are checked against an environment built here:
//! the scope's entry-point variables, string constants, custom overloads
//! mapped through the type DSL, the header accessor functions, and the
//! `validate()`/`validateWithMask()` member predicates for every reachable
//! message type that carries a rule. When stdlib overriding is enabled, the
//! standard library is re-declared with colliding names suppressed so a
//! schema field named `size` shadows the builtin instead of conflicting
//! with it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use prost_reflect::{DescriptorPool, DynamicMessage, Kind, MessageDescriptor};
use prost_types::FieldMask;

use celgate_cel::decls::{FunctionDecl, OverloadDecl, VariableDecl};
use celgate_cel::error::EvalError;
use celgate_cel::registry::field_to_cel_type;
use celgate_cel::value::{MapKey, Value};
use celgate_cel::{CelType, Env, TypeRegistry};

use crate::error::Error;
use crate::options::RuleOptions;

/// Variable bound to the request or validated message.
pub const REQUEST_VAR: &str = "request";
/// Variable bound to the caller attribute context.
pub const ATTRIBUTE_CONTEXT_VAR: &str = "attribute_context";
/// Variable bound to the caller's header multimap.
pub const HEADERS_VAR: &str = "headers";

/// The bindings a scope's expressions are compiled against.
#[derive(Clone, Copy)]
pub enum EnvScope<'a> {
    /// Service-level authorization: caller attributes and headers only.
    Service,
    /// Method-level authorization: caller attributes, headers, and the
    /// request message.
    Method { request: &'a MessageDescriptor },
    /// Message-level validation: the message plus its fields by name.
    Message { message: &'a MessageDescriptor },
    /// Field-level validation: same bindings as the message scope.
    Field { message: &'a MessageDescriptor },
}

impl EnvScope<'_> {
    fn message(&self) -> Option<&MessageDescriptor> {
        match self {
            EnvScope::Service => None,
            EnvScope::Method { request } => Some(request),
            EnvScope::Message { message } | EnvScope::Field { message } => Some(message),
        }
    }

    fn has_caller_context(&self) -> bool {
        matches!(self, EnvScope::Service | EnvScope::Method { .. })
    }

    fn binds_fields(&self) -> bool {
        matches!(self, EnvScope::Message { .. } | EnvScope::Field { .. })
    }
}

/// Validates a message value on behalf of a `validate()` call inside an
/// expression.
pub trait MessageValidate: Send + Sync {
    fn validate(&self, message: &DynamicMessage, mask: Option<&FieldMask>) -> Result<(), Error>;
}

/// How `validate()` calls resolve to validators.
///
/// Generated code registers a static strategy; without one, calls fall
/// through to on-demand compilation in the manager.
#[derive(Clone)]
pub enum ValidateBinding {
    /// Statically generated per-message validators.
    Static(Arc<dyn MessageValidate>),
    /// On-demand compilation through the manager.
    OnDemand(Arc<dyn MessageValidate>),
}

impl ValidateBinding {
    fn strategy(&self) -> &Arc<dyn MessageValidate> {
        match self {
            ValidateBinding::Static(strategy) | ValidateBinding::OnDemand(strategy) => strategy,
        }
    }
}

/// A named bundle of declarations a host injects into every environment.
#[derive(Clone, Default)]
pub struct Library {
    pub name: String,
    pub functions: Vec<FunctionDecl>,
    pub variables: Vec<VariableDecl>,
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_function(mut self, decl: FunctionDecl) -> Self {
        self.functions.push(decl);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, cel_type: CelType) -> Self {
        self.variables.push(VariableDecl::new(name, cel_type));
        self
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("functions", &self.functions.len())
            .field("variables", &self.variables.len())
            .finish()
    }
}

/// Builds the environment for one scope.
pub struct EnvBuilder<'a> {
    scope: EnvScope<'a>,
    options: &'a RuleOptions,
    pool: &'a DescriptorPool,
    libraries: &'a [Library],
    validate_binding: Option<ValidateBinding>,
    has_rule: Option<&'a dyn Fn(&MessageDescriptor) -> bool>,
}

impl<'a> EnvBuilder<'a> {
    pub fn new(scope: EnvScope<'a>, options: &'a RuleOptions, pool: &'a DescriptorPool) -> Self {
        Self {
            scope,
            options,
            pool,
            libraries: &[],
            validate_binding: None,
            has_rule: None,
        }
    }

    /// Inject host libraries.
    pub fn with_libraries(mut self, libraries: &'a [Library]) -> Self {
        self.libraries = libraries;
        self
    }

    /// Enable `validate()` declarations, resolved through `binding` for
    /// every reachable message type where `has_rule` reports a rule.
    pub fn with_validate_binding(
        mut self,
        binding: ValidateBinding,
        has_rule: &'a dyn Fn(&MessageDescriptor) -> bool,
    ) -> Self {
        self.validate_binding = Some(binding);
        self.has_rule = Some(has_rule);
        self
    }

    pub fn build(self) -> Result<Env, Error> {
        let mut env = if self.options.stdlib_overriding {
            Env::with_filtered_standard_library(&self.reserved_names())
        } else {
            Env::with_standard_library()
        };
        env.set_types(TypeRegistry::new(self.pool.clone()));

        if self.scope.has_caller_context() {
            env.add_variable(
                ATTRIBUTE_CONTEXT_VAR,
                CelType::map(CelType::String, CelType::Dyn),
            );
            env.add_variable(HEADERS_VAR, header_map_type());
            for decl in header_functions() {
                env.add_function(decl);
            }
        }
        if let Some(message) = self.scope.message() {
            env.add_variable(REQUEST_VAR, CelType::message(message.full_name()));
        }
        if self.scope.binds_fields() {
            if let Some(message) = self.scope.message() {
                for field in message.fields() {
                    env.add_variable(field.name(), field_to_cel_type(&field));
                }
            }
        }

        for (name, value) in &self.options.globals.constants {
            env.add_constant(name, CelType::String, Value::from(value.as_str()));
        }
        for (name, signature) in &self.options.overloads.functions {
            let params = signature.args.iter().map(|arg| arg.to_cel_type()).collect();
            let result = signature.result.to_cel_type();
            let overload = if signature.member {
                OverloadDecl::method(format!("{}_custom", name), params, result)
            } else {
                OverloadDecl::function(format!("{}_custom", name), params, result)
            };
            env.add_function(FunctionDecl::new(name.clone()).with_overload(overload));
        }
        for (name, declared) in &self.options.overloads.variables {
            env.add_variable(name, declared.to_cel_type());
        }

        for library in self.libraries {
            for decl in &library.functions {
                env.add_function(decl.clone());
            }
            for decl in &library.variables {
                env.add_variable(decl.name.clone(), decl.cel_type.clone());
            }
        }

        if let (Some(binding), Some(has_rule), Some(root)) =
            (&self.validate_binding, self.has_rule, self.scope.message())
        {
            for decl in validate_declarations(root, has_rule, binding) {
                env.add_function(decl);
            }
        }

        Ok(env)
    }

    /// Names that suppress colliding standard library declarations.
    fn reserved_names(&self) -> HashSet<String> {
        let mut reserved: HashSet<String> = HashSet::new();
        reserved.extend(self.options.globals.constants.keys().cloned());
        reserved.extend(self.options.globals.functions.keys().cloned());
        reserved.extend(self.options.overloads.functions.keys().cloned());
        reserved.extend(self.options.overloads.variables.keys().cloned());
        if let Some(message) = self.scope.message() {
            reserved.extend(message.fields().map(|field| field.name().to_string()));
        }
        reserved
    }
}

fn header_map_type() -> CelType {
    CelType::map(CelType::String, CelType::list(CelType::String))
}

/// `get(headers, key)` and `values(headers, key)`, case-insensitive.
fn header_functions() -> Vec<FunctionDecl> {
    let get = FunctionDecl::new("get").with_overload(
        OverloadDecl::method(
            "headers_get",
            vec![header_map_type(), CelType::String],
            CelType::String,
        )
        .with_impl(|args| match (&args[0], &args[1]) {
            (Value::Map(map), Value::String(key)) => {
                match lookup_header(map, key) {
                    Some(Value::List(values)) => {
                        values.first().cloned().unwrap_or_else(|| Value::from(""))
                    }
                    Some(other) => other,
                    None => Value::from(""),
                }
            }
            _ => header_args_error("get"),
        }),
    );
    let values = FunctionDecl::new("values").with_overload(
        OverloadDecl::method(
            "headers_values",
            vec![header_map_type(), CelType::String],
            CelType::list(CelType::String),
        )
        .with_impl(|args| match (&args[0], &args[1]) {
            (Value::Map(map), Value::String(key)) => match lookup_header(map, key) {
                Some(list @ Value::List(_)) => list,
                Some(other) => Value::from(vec![other]),
                None => Value::from(Vec::new()),
            },
            _ => header_args_error("values"),
        }),
    );
    vec![get, values]
}

fn lookup_header(map: &celgate_cel::value::ValueMap, key: &str) -> Option<Value> {
    let key = MapKey::String(Arc::from(key.to_ascii_lowercase().as_str()));
    map.get(&key).cloned()
}

fn header_args_error(function: &str) -> Value {
    Value::error(EvalError::TypeMismatch(format!(
        "{} expects (map<string, list<string>>, string)",
        function
    )))
}

/// `validate()` and `validateWithMask(mask)` member declarations for every
/// message type reachable from `root` whose subtree carries a rule.
fn validate_declarations(
    root: &MessageDescriptor,
    has_rule: &dyn Fn(&MessageDescriptor) -> bool,
    binding: &ValidateBinding,
) -> Vec<FunctionDecl> {
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    let mut types = Vec::new();
    collect_rule_bearing(root, has_rule, &mut memo, &mut visiting, &mut types);

    let mut validate = FunctionDecl::new("validate");
    let mut validate_with_mask = FunctionDecl::new("validateWithMask");
    for type_name in &types {
        let id_suffix = type_name.replace('.', "_");
        let strategy = binding.strategy().clone();
        validate = validate.with_overload(
            OverloadDecl::method(
                format!("{}_validate", id_suffix),
                vec![CelType::message(type_name)],
                CelType::Bool,
            )
            .with_impl(move |args| match &args[0] {
                Value::Message(message) => run_validate(&strategy, message, None),
                other => validate_receiver_error(other),
            }),
        );
        let strategy = binding.strategy().clone();
        validate_with_mask = validate_with_mask.with_overload(
            OverloadDecl::method(
                format!("{}_validate_with_mask", id_suffix),
                vec![
                    CelType::message(type_name),
                    CelType::list(CelType::String),
                ],
                CelType::Bool,
            )
            .with_impl(move |args| match (&args[0], &args[1]) {
                (Value::Message(message), Value::List(paths)) => {
                    let mut mask = FieldMask::default();
                    for path in paths.iter() {
                        match path {
                            Value::String(path) => mask.paths.push(path.to_string()),
                            other => {
                                return Value::error(EvalError::TypeMismatch(format!(
                                    "mask path expects string, got {}",
                                    other.type_name()
                                )));
                            }
                        }
                    }
                    run_validate(&strategy, message, Some(&mask))
                }
                (other, _) => validate_receiver_error(other),
            }),
        );
    }

    if types.is_empty() {
        Vec::new()
    } else {
        vec![validate, validate_with_mask]
    }
}

fn run_validate(
    strategy: &Arc<dyn MessageValidate>,
    message: &DynamicMessage,
    mask: Option<&FieldMask>,
) -> Value {
    match strategy.validate(message, mask) {
        Ok(()) => Value::Bool(true),
        Err(Error::Validation(_)) => Value::Bool(false),
        Err(err) => Value::error(EvalError::Message(err.to_string())),
    }
}

fn validate_receiver_error(other: &Value) -> Value {
    Value::error(EvalError::TypeMismatch(format!(
        "validate expects a message receiver, got {}",
        other.type_name()
    )))
}

/// Collect, in discovery order, every message type reachable from `root`
/// whose own or nested fields carry a rule. The visited set keeps cyclic
/// schemas from recursing forever.
fn collect_rule_bearing(
    message: &MessageDescriptor,
    has_rule: &dyn Fn(&MessageDescriptor) -> bool,
    memo: &mut HashMap<String, bool>,
    visiting: &mut HashSet<String>,
    types: &mut Vec<String>,
) -> bool {
    let name = message.full_name().to_string();
    if let Some(&known) = memo.get(&name) {
        return known;
    }
    if !visiting.insert(name.clone()) {
        // Already on the stack: the cycle contributes nothing new.
        return false;
    }

    let mut bearing = has_rule(message);
    for field in message.fields() {
        if let Some(nested) = nested_message_type(&field) {
            if collect_rule_bearing(&nested, has_rule, memo, visiting, types) {
                bearing = true;
            }
        }
    }

    visiting.remove(&name);
    memo.insert(name.clone(), bearing);
    if bearing {
        types.push(name);
    }
    bearing
}

/// The message type a field holds, unwrapping map entries to their value
/// type.
pub(crate) fn nested_message_type(
    field: &prost_reflect::FieldDescriptor,
) -> Option<MessageDescriptor> {
    match field.kind() {
        Kind::Message(entry) if field.is_map() => {
            match entry.get_field_by_name("value")?.kind() {
                Kind::Message(value) => Some(value),
                _ => None,
            }
        }
        Kind::Message(message) => Some(message),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celgate_cel::activation::MapActivation;
    use celgate_cel::parse;
    use celgate_cel::value::ValueMap;
    use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};

    fn field(name: &str, number: i32, kind: prost_types::field_descriptor_proto::Type) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            r#type: Some(kind as i32),
            ..Default::default()
        }
    }

    fn message_field(name: &str, number: i32, type_name: &str) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            r#type: Some(prost_types::field_descriptor_proto::Type::Message as i32),
            type_name: Some(type_name.to_string()),
            ..Default::default()
        }
    }

    fn pool() -> DescriptorPool {
        use prost_types::field_descriptor_proto::Type;
        let file = FileDescriptorProto {
            name: Some("test/v1/test.proto".to_string()),
            package: Some("test.v1".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                DescriptorProto {
                    name: Some("Request".to_string()),
                    field: vec![
                        field("name", 1, Type::String),
                        field("size", 2, Type::Int64),
                        message_field("ref", 3, ".test.v1.Ref"),
                        message_field("node", 4, ".test.v1.Node"),
                    ],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("Ref".to_string()),
                    field: vec![field("value", 1, Type::String)],
                    ..Default::default()
                },
                // Self-referential type exercising cycle tolerance.
                DescriptorProto {
                    name: Some("Node".to_string()),
                    field: vec![message_field("next", 1, ".test.v1.Node")],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_proto(file).unwrap();
        pool
    }

    #[test]
    fn message_scope_binds_request_and_fields() {
        let pool = pool();
        let message = pool.get_message_by_name("test.v1.Request").unwrap();
        let options = RuleOptions::default();
        let env = EnvBuilder::new(EnvScope::Message { message: &message }, &options, &pool)
            .build()
            .unwrap();

        let expr = parse("request.name == name && name != ''").unwrap();
        assert!(env.check(&expr).is_ok());
    }

    #[test]
    fn service_scope_has_no_request() {
        let pool = pool();
        let options = RuleOptions::default();
        let env = EnvBuilder::new(EnvScope::Service, &options, &pool)
            .build()
            .unwrap();

        assert!(env.check(&parse("'k' in headers").unwrap()).is_ok());
        assert!(env.check(&parse("request.name != ''").unwrap()).is_err());
    }

    #[test]
    fn stdlib_override_lets_fields_shadow_builtins() {
        let pool = pool();
        let message = pool.get_message_by_name("test.v1.Request").unwrap();

        // Without the flag the field collides with the builtin: `size` as
        // a bare identifier resolves to the variable either way, but the
        // builtin call keeps working.
        let options = RuleOptions {
            stdlib_overriding: true,
            ..Default::default()
        };
        let env = EnvBuilder::new(EnvScope::Message { message: &message }, &options, &pool)
            .build()
            .unwrap();
        assert!(env.function("size").is_none());
        assert!(env.check(&parse("size > 0").unwrap()).is_ok());
        assert!(env.check(&parse("size('abc') == 3").unwrap()).is_err());

        let options = RuleOptions::default();
        let env = EnvBuilder::new(EnvScope::Message { message: &message }, &options, &pool)
            .build()
            .unwrap();
        assert!(env.check(&parse("size('abc') == 3").unwrap()).is_ok());
    }

    #[test]
    fn constants_and_overload_variables_declare() {
        let pool = pool();
        let mut options = RuleOptions::default();
        options
            .globals
            .constants
            .insert("env".to_string(), "prod".to_string());
        options.overloads.variables.insert(
            "roles".to_string(),
            crate::typemap::DeclaredType::parse("list<string>").unwrap(),
        );

        let env = EnvBuilder::new(EnvScope::Service, &options, &pool)
            .build()
            .unwrap();
        assert!(env
            .check(&parse("env == 'prod' && 'admin' in roles").unwrap())
            .is_ok());
    }

    #[test]
    fn header_get_is_case_insensitive_and_total() {
        let pool = pool();
        let options = RuleOptions::default();
        let env = EnvBuilder::new(EnvScope::Service, &options, &pool)
            .build()
            .unwrap();

        let source = "headers.get('X-Token') == 'abc' && headers.values('missing') == []";
        let expr = parse(source).unwrap();
        let checked = env.check(&expr).unwrap();
        let program = env.program(expr, source, checked.result_type, HashMap::new());

        let mut headers = ValueMap::new();
        headers.insert(
            MapKey::String(Arc::from("x-token")),
            Value::from(vec![Value::from("abc"), Value::from("xyz")]),
        );
        let mut activation = MapActivation::new();
        activation.insert(HEADERS_VAR, Value::from(headers));
        activation.insert(ATTRIBUTE_CONTEXT_VAR, Value::from(ValueMap::new()));
        assert_eq!(program.eval(&activation), Value::Bool(true));
    }

    struct AlwaysFalse;
    impl MessageValidate for AlwaysFalse {
        fn validate(
            &self,
            _message: &DynamicMessage,
            _mask: Option<&FieldMask>,
        ) -> Result<(), Error> {
            Err(crate::error::ValidationError::expression_failed("test", "p").into())
        }
    }

    #[test]
    fn validate_declared_only_for_rule_bearing_types() {
        let pool = pool();
        let message = pool.get_message_by_name("test.v1.Request").unwrap();
        let options = RuleOptions::default();

        let has_rule = |m: &MessageDescriptor| m.full_name() == "test.v1.Ref";
        let binding = ValidateBinding::OnDemand(Arc::new(AlwaysFalse));
        let env = EnvBuilder::new(EnvScope::Message { message: &message }, &options, &pool)
            .with_validate_binding(binding, &has_rule)
            .build()
            .unwrap();

        // Ref carries a rule, and Request reaches it, so both get the
        // member predicate. Node carries none anywhere.
        assert!(env.check(&parse("request.ref.validate()").unwrap()).is_ok());
        assert!(env.check(&parse("request.validate()").unwrap()).is_ok());
        assert!(env
            .check(&parse("request.node.validate()").unwrap())
            .is_err());
        assert!(env
            .check(&parse("request.ref.validateWithMask(['value'])").unwrap())
            .is_ok());
    }

    #[test]
    fn validate_binding_failure_evaluates_false() {
        let pool = pool();
        let message = pool.get_message_by_name("test.v1.Request").unwrap();
        let options = RuleOptions::default();

        let has_rule = |_: &MessageDescriptor| true;
        let binding = ValidateBinding::OnDemand(Arc::new(AlwaysFalse));
        let env = EnvBuilder::new(EnvScope::Message { message: &message }, &options, &pool)
            .with_validate_binding(binding, &has_rule)
            .build()
            .unwrap();

        let source = "request.ref.validate()";
        let expr = parse(source).unwrap();
        let checked = env.check(&expr).unwrap();
        let program = env.program(expr, source, checked.result_type, HashMap::new());

        let descriptor = pool.get_message_by_name("test.v1.Request").unwrap();
        let mut activation = MapActivation::new();
        activation.insert(
            REQUEST_VAR,
            Value::Message(Arc::new(DynamicMessage::new(descriptor))),
        );
        assert_eq!(program.eval(&activation), Value::Bool(false));
    }

    #[test]
    fn cyclic_schema_terminates() {
        let pool = pool();
        let node = pool.get_message_by_name("test.v1.Node").unwrap();
        let has_rule = |_: &MessageDescriptor| true;
        let binding = ValidateBinding::OnDemand(Arc::new(AlwaysFalse));
        let decls = validate_declarations(&node, &has_rule, &binding);
        assert!(!decls.is_empty());
    }
}
