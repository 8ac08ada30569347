//! Runtime function registry.
//!
//! The registry maps function names to callable overloads. The evaluator
//! dispatches non-operator calls here; overloads are selected by member
//! form and arity, with the actual argument values deciding inside the
//! implementation where needed.

use std::collections::HashMap;

use crate::decls::{FunctionDecl, FunctionImpl};
use crate::error::EvalError;
use crate::value::Value;

/// A callable overload.
#[derive(Clone)]
pub struct RuntimeOverload {
    /// The overload id.
    pub id: String,
    /// Whether this is a member function.
    pub is_member: bool,
    /// Parameter count, including the receiver for member functions.
    pub arity: usize,
    /// The implementation.
    pub implementation: FunctionImpl,
}

impl std::fmt::Debug for RuntimeOverload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOverload")
            .field("id", &self.id)
            .field("is_member", &self.is_member)
            .field("arity", &self.arity)
            .finish()
    }
}

/// A function with its callable overloads.
#[derive(Debug, Clone, Default)]
pub struct RuntimeFunction {
    pub name: String,
    pub overloads: Vec<RuntimeOverload>,
}

/// Registry of all functions available during evaluation.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RuntimeFunction>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implemented overloads of a declaration.
    ///
    /// Declarations without implementations contribute nothing; they exist
    /// for the checker only, and calling them at runtime reports a missing
    /// overload.
    pub fn register_decl(&mut self, decl: &FunctionDecl) {
        for overload in &decl.overloads {
            let Some(implementation) = overload.implementation.clone() else {
                continue;
            };
            let function = self
                .functions
                .entry(decl.name.clone())
                .or_insert_with(|| RuntimeFunction {
                    name: decl.name.clone(),
                    overloads: Vec::new(),
                });
            function.overloads.push(RuntimeOverload {
                id: overload.id.clone(),
                is_member: overload.is_member,
                arity: overload.params.len(),
                implementation,
            });
        }
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Dispatch a call. The receiver, if any, is the first argument.
    pub fn call(&self, name: &str, is_member: bool, args: &[Value]) -> Value {
        let overload = self.functions.get(name).and_then(|f| {
            f.overloads
                .iter()
                .find(|o| o.is_member == is_member && o.arity == args.len())
        });
        match overload {
            Some(overload) => (overload.implementation)(args),
            None => Value::error(EvalError::NoMatchingOverload {
                function: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decls::OverloadDecl;
    use crate::types::CelType;

    #[test]
    fn registers_and_dispatches() {
        let decl = FunctionDecl::new("double").with_overload(
            OverloadDecl::function("double_int", vec![CelType::Int], CelType::Int).with_impl(
                |args| match args {
                    [Value::Int(n)] => Value::Int(n * 2),
                    _ => Value::error(EvalError::Message("bad args".to_string())),
                },
            ),
        );

        let mut registry = FunctionRegistry::new();
        registry.register_decl(&decl);

        assert_eq!(
            registry.call("double", false, &[Value::Int(21)]),
            Value::Int(42)
        );
    }

    #[test]
    fn missing_overload_is_error() {
        let registry = FunctionRegistry::new();
        let result = registry.call("nope", false, &[]);
        assert!(result.is_error());
    }

    #[test]
    fn declaration_without_impl_is_not_callable() {
        let decl = FunctionDecl::new("declared_only").with_overload(OverloadDecl::function(
            "declared_only_int",
            vec![CelType::Int],
            CelType::Bool,
        ));
        let mut registry = FunctionRegistry::new();
        registry.register_decl(&decl);
        assert!(registry.call("declared_only", false, &[Value::Int(1)]).is_error());
    }
}
