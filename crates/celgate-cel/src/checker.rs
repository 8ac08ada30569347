//! Type checking for parsed expressions.
//!
//! The checker walks an expression against an [`Env`], producing a type for
//! every node. Errors accumulate so a single pass reports all problems.
//! Comprehension variables are handled with an explicit scope stack.

use std::collections::HashMap;

use crate::ast::{operators, Expr, ExprId, ExprKind, Literal};
use crate::env::Env;
use crate::error::CheckError;
use crate::types::CelType;

/// Result of a successful type check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// The type of every node, keyed by node id.
    pub type_map: HashMap<ExprId, CelType>,
    /// The type of the root expression.
    pub result_type: CelType,
}

/// Type-check an expression against an environment.
pub fn check(expr: &Expr, env: &Env) -> Result<CheckResult, Vec<CheckError>> {
    let mut checker = Checker {
        env,
        scopes: Vec::new(),
        type_map: HashMap::new(),
        errors: Vec::new(),
    };
    let result_type = checker.check_expr(expr);
    if checker.errors.is_empty() {
        Ok(CheckResult {
            type_map: checker.type_map,
            result_type,
        })
    } else {
        Err(checker.errors)
    }
}

struct Checker<'a> {
    env: &'a Env,
    /// Comprehension variable scopes, innermost last.
    scopes: Vec<HashMap<String, CelType>>,
    type_map: HashMap<ExprId, CelType>,
    errors: Vec<CheckError>,
}

impl Checker<'_> {
    fn record(&mut self, id: ExprId, cel_type: CelType) -> CelType {
        self.type_map.insert(id, cel_type.clone());
        cel_type
    }

    fn error(&mut self, error: CheckError) -> CelType {
        self.errors.push(error);
        CelType::Error
    }

    fn lookup_ident(&self, name: &str) -> Option<CelType> {
        for scope in self.scopes.iter().rev() {
            if let Some(t) = scope.get(name) {
                return Some(t.clone());
            }
        }
        self.env.variable(name).map(|decl| decl.cel_type.clone())
    }

    fn check_expr(&mut self, expr: &Expr) -> CelType {
        let cel_type = match &expr.kind {
            ExprKind::Literal(literal) => literal_type(literal),
            ExprKind::Ident(name) => match self.lookup_ident(name) {
                Some(t) => t,
                None => self.error(CheckError::UndeclaredReference(name.clone())),
            },
            ExprKind::Select {
                operand,
                field,
                test_only,
            } => {
                let operand_type = self.check_expr(operand);
                let field_type = self.check_select(&operand_type, field);
                if *test_only {
                    // has() yields a bool regardless of the field type, but
                    // the field itself must still resolve.
                    if field_type == CelType::Error {
                        CelType::Error
                    } else {
                        CelType::Bool
                    }
                } else {
                    field_type
                }
            }
            ExprKind::Call {
                target,
                function,
                args,
            } => self.check_call(target.as_deref(), function, args),
            ExprKind::List { elements } => {
                let mut elem = None;
                for element in elements {
                    let t = self.check_expr(element);
                    elem = Some(join(elem, t));
                }
                CelType::list(elem.unwrap_or(CelType::Dyn))
            }
            ExprKind::Map { entries } => {
                let mut key = None;
                let mut value = None;
                for entry in entries {
                    let k = self.check_expr(&entry.key);
                    let v = self.check_expr(&entry.value);
                    key = Some(join(key, k));
                    value = Some(join(value, v));
                }
                CelType::map(key.unwrap_or(CelType::Dyn), value.unwrap_or(CelType::Dyn))
            }
            ExprKind::Struct { type_name, fields } => self.check_struct(type_name, fields),
            ExprKind::Comprehension(c) => {
                let range_type = self.check_expr(&c.iter_range);
                let elem_type = match &range_type {
                    CelType::List(elem) => (**elem).clone(),
                    CelType::Map(key, _) => (**key).clone(),
                    CelType::Dyn | CelType::Any | CelType::Error => CelType::Dyn,
                    other => self.error(CheckError::NotIterable(other.display_name())),
                };
                let accu_type = self.check_expr(&c.accu_init);

                let mut scope = HashMap::new();
                scope.insert(c.iter_var.clone(), elem_type);
                scope.insert(c.accu_var.clone(), accu_type.clone());
                self.scopes.push(scope);

                let cond_type = self.check_expr(&c.loop_condition);
                self.expect_bool(&cond_type);
                let step_type = self.check_expr(&c.loop_step);
                if !accu_type.is_assignable_from(&step_type)
                    && !step_type.is_assignable_from(&accu_type)
                {
                    self.errors.push(CheckError::TypeMismatch {
                        expected: accu_type.display_name(),
                        found: step_type.display_name(),
                    });
                }
                let result_type = self.check_expr(&c.result);

                self.scopes.pop();
                result_type
            }
        };
        self.record(expr.id, cel_type)
    }

    fn check_select(&mut self, operand_type: &CelType, field: &str) -> CelType {
        match operand_type {
            CelType::Message(name) => match self.env.types() {
                Some(registry) => {
                    if registry.get_message(name).is_none() {
                        return self.error(CheckError::UnknownType(name.to_string()));
                    }
                    match registry.field_type(name, field) {
                        Some(t) => t,
                        None => self.error(CheckError::UndefinedField {
                            message: name.to_string(),
                            field: field.to_string(),
                        }),
                    }
                }
                // Without a registry, message fields are unknowable.
                None => CelType::Dyn,
            },
            CelType::Map(_, value) => (**value).clone(),
            CelType::Dyn | CelType::Any | CelType::Error => CelType::Dyn,
            other => self.error(CheckError::NotSelectable(other.display_name())),
        }
    }

    fn check_call(&mut self, target: Option<&Expr>, function: &str, args: &[Expr]) -> CelType {
        let mut arg_types = Vec::with_capacity(args.len() + 1);
        if let Some(target) = target {
            arg_types.push(self.check_expr(target));
        }
        for arg in args {
            arg_types.push(self.check_expr(arg));
        }

        if operators::is_operator(function) {
            return self.check_operator(function, &arg_types);
        }

        let Some(decl) = self.env.function(function) else {
            return self.error(CheckError::UnknownFunction(function.to_string()));
        };
        match decl.find_matching(target.is_some(), &arg_types) {
            Some(overload) => overload.result.clone(),
            None => {
                let args = arg_types
                    .iter()
                    .map(|t| t.display_name())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.error(CheckError::NoMatchingOverload {
                    function: function.to_string(),
                    args,
                })
            }
        }
    }

    fn check_operator(&mut self, op: &str, args: &[CelType]) -> CelType {
        use operators::*;
        match op {
            CONDITIONAL => {
                self.expect_bool(&args[0]);
                join_branches(&args[1], &args[2])
            }
            LOGICAL_AND | LOGICAL_OR => {
                self.expect_bool(&args[0]);
                self.expect_bool(&args[1]);
                CelType::Bool
            }
            LOGICAL_NOT => {
                self.expect_bool(&args[0]);
                CelType::Bool
            }
            EQUALS | NOT_EQUALS => {
                let (a, b) = (&args[0], &args[1]);
                if a.is_assignable_from(b)
                    || b.is_assignable_from(a)
                    || (a.is_numeric() && b.is_numeric())
                {
                    CelType::Bool
                } else {
                    self.overload_error(op, args)
                }
            }
            LESS | LESS_EQUALS | GREATER | GREATER_EQUALS => {
                let (a, b) = (&args[0], &args[1]);
                let comparable = (a.is_numeric() && b.is_numeric())
                    || (a == b && is_orderable(a))
                    || matches!(a, CelType::Dyn | CelType::Any | CelType::Error)
                    || matches!(b, CelType::Dyn | CelType::Any | CelType::Error);
                if comparable {
                    CelType::Bool
                } else {
                    self.overload_error(op, args)
                }
            }
            ADD => self.check_add(&args[0], &args[1]),
            SUBTRACT | MULTIPLY | DIVIDE => self.check_arithmetic(op, &args[0], &args[1]),
            MODULO => {
                let (a, b) = (&args[0], &args[1]);
                match (normalize(a), normalize(b)) {
                    (CelType::Int, CelType::Int) => CelType::Int,
                    (CelType::UInt, CelType::UInt) => CelType::UInt,
                    (CelType::Dyn, _) | (_, CelType::Dyn) => CelType::Dyn,
                    _ => self.overload_error(op, args),
                }
            }
            NEGATE => match normalize(&args[0]) {
                CelType::Int => CelType::Int,
                CelType::Double => CelType::Double,
                CelType::Dyn => CelType::Dyn,
                _ => self.overload_error(op, args),
            },
            INDEX => match (&args[0], normalize(&args[1])) {
                (CelType::List(elem), CelType::Int | CelType::UInt | CelType::Dyn) => {
                    (**elem).clone()
                }
                (CelType::Map(key, value), _) => {
                    if !key.is_assignable_from(&args[1]) {
                        self.errors.push(CheckError::TypeMismatch {
                            expected: key.display_name(),
                            found: args[1].display_name(),
                        });
                    }
                    (**value).clone()
                }
                (CelType::Dyn | CelType::Any | CelType::Error, _) => CelType::Dyn,
                _ => self.overload_error(op, args),
            },
            IN => match &args[1] {
                CelType::List(elem) => {
                    if !elem.is_assignable_from(&args[0]) && !args[0].is_assignable_from(elem) {
                        self.errors.push(CheckError::TypeMismatch {
                            expected: elem.display_name(),
                            found: args[0].display_name(),
                        });
                    }
                    CelType::Bool
                }
                CelType::Map(key, _) => {
                    if !key.is_assignable_from(&args[0]) {
                        self.errors.push(CheckError::TypeMismatch {
                            expected: key.display_name(),
                            found: args[0].display_name(),
                        });
                    }
                    CelType::Bool
                }
                CelType::Dyn | CelType::Any | CelType::Error => CelType::Bool,
                _ => self.overload_error(op, args),
            },
            _ => self.overload_error(op, args),
        }
    }

    fn check_add(&mut self, a: &CelType, b: &CelType) -> CelType {
        match (normalize(a), normalize(b)) {
            (CelType::Int, CelType::Int) => CelType::Int,
            (CelType::UInt, CelType::UInt) => CelType::UInt,
            (CelType::Double, CelType::Double) => CelType::Double,
            (CelType::String, CelType::String) => CelType::String,
            (CelType::Bytes, CelType::Bytes) => CelType::Bytes,
            (CelType::List(x), CelType::List(y)) => {
                CelType::list(join(Some((*x).clone()), (*y).clone()))
            }
            (CelType::Dyn, _) | (_, CelType::Dyn) => CelType::Dyn,
            _ => self.overload_error(operators::ADD, &[a.clone(), b.clone()]),
        }
    }

    fn check_arithmetic(&mut self, op: &str, a: &CelType, b: &CelType) -> CelType {
        match (normalize(a), normalize(b)) {
            (CelType::Int, CelType::Int) => CelType::Int,
            (CelType::UInt, CelType::UInt) => CelType::UInt,
            (CelType::Double, CelType::Double) => CelType::Double,
            (CelType::Dyn, _) | (_, CelType::Dyn) => CelType::Dyn,
            _ => self.overload_error(op, &[a.clone(), b.clone()]),
        }
    }

    fn expect_bool(&mut self, t: &CelType) {
        if !CelType::Bool.is_assignable_from(t) {
            self.errors.push(CheckError::TypeMismatch {
                expected: "bool".to_string(),
                found: t.display_name(),
            });
        }
    }

    fn overload_error(&mut self, function: &str, args: &[CelType]) -> CelType {
        let args = args
            .iter()
            .map(|t| t.display_name())
            .collect::<Vec<_>>()
            .join(", ");
        self.error(CheckError::NoMatchingOverload {
            function: function.to_string(),
            args,
        })
    }

    fn check_struct(&mut self, type_name: &str, fields: &[crate::ast::StructField]) -> CelType {
        let field_types: Vec<(String, CelType)> = fields
            .iter()
            .map(|f| (f.name.clone(), self.check_expr(&f.value)))
            .collect();

        let Some(registry) = self.env.types() else {
            return CelType::Dyn;
        };
        if registry.get_message(type_name).is_none() {
            return self.error(CheckError::UnknownType(type_name.to_string()));
        }
        for (name, value_type) in &field_types {
            match registry.field_type(type_name, name) {
                Some(field_type) => {
                    if !field_type.is_assignable_from(value_type) {
                        self.errors.push(CheckError::TypeMismatch {
                            expected: field_type.display_name(),
                            found: value_type.display_name(),
                        });
                    }
                }
                None => {
                    self.errors.push(CheckError::UndefinedField {
                        message: type_name.to_string(),
                        field: name.clone(),
                    });
                }
            }
        }
        CelType::message(type_name)
    }
}

fn literal_type(literal: &Literal) -> CelType {
    match literal {
        Literal::Null => CelType::Null,
        Literal::Bool(_) => CelType::Bool,
        Literal::Int(_) => CelType::Int,
        Literal::UInt(_) => CelType::UInt,
        Literal::Double(_) => CelType::Double,
        Literal::String(_) => CelType::String,
        Literal::Bytes(_) => CelType::Bytes,
    }
}

/// Dyn/Error collapse to the other operand; equal types stay, mixed types
/// widen to dyn.
fn normalize(t: &CelType) -> CelType {
    match t {
        CelType::Any | CelType::Error => CelType::Dyn,
        other => other.clone(),
    }
}

/// Types that support the ordered comparison operators (`<`, `<=`, `>`, `>=`)
/// when both operands share the type. Numeric operands are handled separately
/// by the checker's numeric-cross-comparison path.
fn is_orderable(t: &CelType) -> bool {
    matches!(
        t,
        CelType::Bool
            | CelType::Int
            | CelType::UInt
            | CelType::Double
            | CelType::String
            | CelType::Bytes
            | CelType::Timestamp
            | CelType::Duration
    )
}

fn join(acc: Option<CelType>, next: CelType) -> CelType {
    match acc {
        None => next,
        Some(prev) if prev == next => prev,
        Some(_) => CelType::Dyn,
    }
}

fn join_branches(a: &CelType, b: &CelType) -> CelType {
    if a == b {
        a.clone()
    } else if matches!(a, CelType::Dyn | CelType::Error) {
        b.clone()
    } else if matches!(b, CelType::Dyn | CelType::Error) {
        a.clone()
    } else {
        CelType::Dyn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use crate::parser::parse;

    fn check_in(env: &Env, source: &str) -> Result<CheckResult, Vec<CheckError>> {
        let expr = parse(source).unwrap();
        check(&expr, env)
    }

    #[test]
    fn literal_and_arithmetic_types() {
        let env = Env::with_standard_library();
        let result = check_in(&env, "1 + 2 * 3").unwrap();
        assert_eq!(result.result_type, CelType::Int);
    }

    #[test]
    fn undeclared_reference() {
        let env = Env::with_standard_library();
        let errors = check_in(&env, "missing == 1").unwrap_err();
        assert!(matches!(
            errors[0],
            CheckError::UndeclaredReference(ref name) if name == "missing"
        ));
    }

    #[test]
    fn declared_variable_resolves() {
        let mut env = Env::with_standard_library();
        env.add_variable("x", CelType::Int);
        let result = check_in(&env, "x + 1").unwrap();
        assert_eq!(result.result_type, CelType::Int);
    }

    #[test]
    fn boolean_operators_require_bools() {
        let mut env = Env::with_standard_library();
        env.add_variable("x", CelType::Int);
        assert!(check_in(&env, "x && true").is_err());
        assert!(check_in(&env, "x > 0 && true").is_ok());
    }

    #[test]
    fn string_functions() {
        let mut env = Env::with_standard_library();
        env.add_variable("name", CelType::String);
        let result = check_in(&env, "name.startsWith('a') || name.contains('b')").unwrap();
        assert_eq!(result.result_type, CelType::Bool);
    }

    #[test]
    fn unknown_function_errors() {
        let env = Env::with_standard_library();
        let errors = check_in(&env, "frobnicate(1)").unwrap_err();
        assert!(matches!(errors[0], CheckError::UnknownFunction(_)));
    }

    #[test]
    fn in_operator_on_map() {
        let mut env = Env::with_standard_library();
        env.add_variable(
            "headers",
            CelType::map(CelType::String, CelType::list(CelType::String)),
        );
        let result = check_in(&env, "'k' in headers").unwrap();
        assert_eq!(result.result_type, CelType::Bool);
    }

    #[test]
    fn comprehension_scopes_iter_var() {
        let mut env = Env::with_standard_library();
        env.add_variable("names", CelType::list(CelType::String));
        let result = check_in(&env, "names.all(s, s != '')").unwrap();
        assert_eq!(result.result_type, CelType::Bool);
        // Iteration variable is not visible outside the comprehension.
        assert!(check_in(&env, "names.all(s, s != '') && s == ''").is_err());
    }

    #[test]
    fn ternary_joins_branches() {
        let mut env = Env::with_standard_library();
        env.add_variable("flag", CelType::Bool);
        let result = check_in(&env, "flag ? 1 : 2").unwrap();
        assert_eq!(result.result_type, CelType::Int);
        let result = check_in(&env, "flag ? 1 : 'a'").unwrap();
        assert_eq!(result.result_type, CelType::Dyn);
    }

    #[test]
    fn collects_multiple_errors() {
        let env = Env::with_standard_library();
        let errors = check_in(&env, "a == 1 && b == 2").unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
