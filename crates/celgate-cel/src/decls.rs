//! Declarations for variables, functions, and overloads.
//!
//! Declarations carry both the type information the checker needs and the
//! optional implementation the evaluator dispatches to.

use std::sync::Arc;

use crate::types::CelType;
use crate::value::Value;

/// A function implementation.
///
/// Receives the already-evaluated argument values; for member functions the
/// receiver is the first argument.
pub type FunctionImpl = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A variable or constant declaration.
#[derive(Debug, Clone)]
pub struct VariableDecl {
    /// The variable name.
    pub name: String,
    /// The declared type.
    pub cel_type: CelType,
    /// For constants, the value bound at evaluation time.
    pub const_value: Option<Value>,
}

impl VariableDecl {
    /// Declare a variable.
    pub fn new(name: impl Into<String>, cel_type: CelType) -> Self {
        Self {
            name: name.into(),
            cel_type,
            const_value: None,
        }
    }

    /// Declare a constant with its value.
    pub fn constant(name: impl Into<String>, cel_type: CelType, value: Value) -> Self {
        Self {
            name: name.into(),
            cel_type,
            const_value: Some(value),
        }
    }
}

/// A single function signature, optionally with an implementation.
pub struct OverloadDecl {
    /// Unique identifier for this overload (e.g. "contains_string").
    pub id: String,
    /// Parameter types, receiver first for member functions.
    pub params: Vec<CelType>,
    /// Return type.
    pub result: CelType,
    /// Whether this is a member function (`receiver.f(args)`).
    pub is_member: bool,
    /// Implementation used during evaluation, when present.
    pub implementation: Option<FunctionImpl>,
}

impl std::fmt::Debug for OverloadDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverloadDecl")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("is_member", &self.is_member)
            .field("has_impl", &self.implementation.is_some())
            .finish()
    }
}

impl Clone for OverloadDecl {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            params: self.params.clone(),
            result: self.result.clone(),
            is_member: self.is_member,
            implementation: self.implementation.clone(),
        }
    }
}

impl OverloadDecl {
    /// Declare a standalone function overload.
    pub fn function(id: impl Into<String>, params: Vec<CelType>, result: CelType) -> Self {
        Self {
            id: id.into(),
            params,
            result,
            is_member: false,
            implementation: None,
        }
    }

    /// Declare a member function overload; the first parameter is the
    /// receiver type.
    pub fn method(id: impl Into<String>, params: Vec<CelType>, result: CelType) -> Self {
        Self {
            id: id.into(),
            params,
            result,
            is_member: true,
            implementation: None,
        }
    }

    /// Attach an implementation.
    pub fn with_impl<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.implementation = Some(Arc::new(f));
        self
    }

    /// Check whether the given argument types match this overload.
    pub fn matches(&self, is_member: bool, args: &[CelType]) -> bool {
        self.is_member == is_member
            && self.params.len() == args.len()
            && self
                .params
                .iter()
                .zip(args)
                .all(|(param, arg)| param.is_assignable_from(arg))
    }
}

/// A function with its overloads.
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    /// The function name.
    pub name: String,
    /// All overloads for this function.
    pub overloads: Vec<OverloadDecl>,
}

impl FunctionDecl {
    /// Declare a function with no overloads.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overloads: Vec::new(),
        }
    }

    /// Add an overload.
    pub fn with_overload(mut self, overload: OverloadDecl) -> Self {
        self.overloads.push(overload);
        self
    }

    /// Find the first overload matching the call shape.
    pub fn find_matching(&self, is_member: bool, args: &[CelType]) -> Option<&OverloadDecl> {
        self.overloads.iter().find(|o| o.matches(is_member, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_matching() {
        let overload = OverloadDecl::method(
            "string_contains_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        );
        assert!(overload.matches(true, &[CelType::String, CelType::String]));
        assert!(overload.matches(true, &[CelType::String, CelType::Dyn]));
        assert!(!overload.matches(false, &[CelType::String, CelType::String]));
        assert!(!overload.matches(true, &[CelType::Int, CelType::String]));
    }

    #[test]
    fn function_find_matching() {
        let func = FunctionDecl::new("size")
            .with_overload(OverloadDecl::function(
                "size_string",
                vec![CelType::String],
                CelType::Int,
            ))
            .with_overload(OverloadDecl::method(
                "string_size",
                vec![CelType::String],
                CelType::Int,
            ));

        assert_eq!(
            func.find_matching(false, &[CelType::String]).map(|o| o.id.as_str()),
            Some("size_string")
        );
        assert_eq!(
            func.find_matching(true, &[CelType::String]).map(|o| o.id.as_str()),
            Some("string_size")
        );
        assert!(func.find_matching(false, &[CelType::Int]).is_none());
    }

    #[test]
    fn constant_decl_carries_value() {
        let decl = VariableDecl::constant("greeting", CelType::String, Value::from("hi"));
        assert_eq!(decl.const_value, Some(Value::from("hi")));
    }
}
