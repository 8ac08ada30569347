//! Tree-walking evaluator.
//!
//! Evaluation never panics: failures become error values that propagate to
//! the root, with the usual short-circuit absorption for `&&`, `||`, and
//! the conditional. The evaluator is stateless per call and safe to share
//! across threads.

use std::collections::HashMap;
use std::sync::Arc;

use prost_reflect::ReflectMessage;
use regex::Regex;

use crate::activation::{Activation, HierarchicalActivation};
use crate::ast::{operators, Comprehension, Expr, ExprId, ExprKind, Literal};
use crate::error::EvalError;
use crate::functions::FunctionRegistry;
use crate::stdlib;
use crate::value::{MapKey, Value, ValueMap};

/// Expression evaluator.
pub struct Evaluator<'a> {
    functions: &'a FunctionRegistry,
    regexes: Option<&'a HashMap<ExprId, Regex>>,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator over a function registry.
    pub fn new(functions: &'a FunctionRegistry) -> Self {
        Self {
            functions,
            regexes: None,
        }
    }

    /// Attach a precompiled regex cache keyed by `matches()` call node id.
    pub fn with_regexes(mut self, regexes: &'a HashMap<ExprId, Regex>) -> Self {
        self.regexes = Some(regexes);
        self
    }

    /// Evaluate an expression with the given variable bindings.
    pub fn eval(&self, expr: &Expr, activation: &dyn Activation) -> Value {
        match &expr.kind {
            ExprKind::Literal(literal) => literal_value(literal),
            ExprKind::Ident(name) => match activation.resolve(name) {
                Some(value) => value,
                None => Value::error(EvalError::UnknownVariable(name.clone())),
            },
            ExprKind::Select {
                operand,
                field,
                test_only,
            } => {
                let operand = self.eval(operand, activation);
                self.eval_select(operand, field, *test_only)
            }
            ExprKind::Call {
                target,
                function,
                args,
            } => self.eval_call(expr.id, target.as_deref(), function, args, activation),
            ExprKind::List { elements } => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    let value = self.eval(element, activation);
                    if value.is_error() {
                        return value;
                    }
                    values.push(value);
                }
                Value::from(values)
            }
            ExprKind::Map { entries } => {
                let mut map = ValueMap::new();
                for entry in entries {
                    let key = self.eval(&entry.key, activation);
                    if key.is_error() {
                        return key;
                    }
                    let key = match MapKey::from_value(&key) {
                        Ok(key) => key,
                        Err(err) => return Value::error(err),
                    };
                    let value = self.eval(&entry.value, activation);
                    if value.is_error() {
                        return value;
                    }
                    map.insert(key, value);
                }
                Value::from(map)
            }
            ExprKind::Struct { fields, .. } => {
                // Struct literals evaluate to a map keyed by field name.
                let mut map = ValueMap::new();
                for field in fields {
                    let value = self.eval(&field.value, activation);
                    if value.is_error() {
                        return value;
                    }
                    map.insert(MapKey::String(Arc::from(field.name.as_str())), value);
                }
                Value::from(map)
            }
            ExprKind::Comprehension(c) => self.eval_comprehension(c, activation),
        }
    }

    fn eval_select(&self, operand: Value, field: &str, test_only: bool) -> Value {
        match operand {
            Value::Error(_) => operand,
            Value::Message(message) => {
                let Some(fd) = message.descriptor().get_field_by_name(field) else {
                    return Value::error(EvalError::NoSuchField {
                        type_name: message.descriptor().full_name().to_string(),
                        field: field.to_string(),
                    });
                };
                let value = Value::from_proto(message.get_field(&fd).as_ref());
                if test_only {
                    Value::Bool(message.has_field(&fd) || !value.is_default())
                } else {
                    value
                }
            }
            Value::Map(map) => {
                let key = MapKey::String(Arc::from(field));
                if test_only {
                    Value::Bool(map.contains_key(&key))
                } else {
                    match map.get(&key) {
                        Some(value) => value.clone(),
                        None => Value::error(EvalError::NoSuchKey(field.to_string())),
                    }
                }
            }
            other => Value::error(EvalError::NoSuchField {
                type_name: other.type_name().to_string(),
                field: field.to_string(),
            }),
        }
    }

    fn eval_call(
        &self,
        call_id: ExprId,
        target: Option<&Expr>,
        function: &str,
        args: &[Expr],
        activation: &dyn Activation,
    ) -> Value {
        use operators::*;
        // Short-circuiting forms evaluate their own operands.
        match function {
            LOGICAL_AND => return self.eval_logic(args, activation, false),
            LOGICAL_OR => return self.eval_logic(args, activation, true),
            CONDITIONAL => {
                return match self.eval(&args[0], activation) {
                    Value::Bool(true) => self.eval(&args[1], activation),
                    Value::Bool(false) => self.eval(&args[2], activation),
                    Value::Error(err) => Value::Error(err),
                    other => type_error(format!(
                        "conditional expects bool, got {}",
                        other.type_name()
                    )),
                };
            }
            _ => {}
        }

        let mut values = Vec::with_capacity(args.len() + 1);
        if let Some(target) = target {
            values.push(self.eval(target, activation));
        }
        for arg in args {
            values.push(self.eval(arg, activation));
        }
        if let Some(err) = values.iter().find(|v| v.is_error()) {
            return err.clone();
        }

        if function == "matches" {
            return self.eval_matches(call_id, &values);
        }
        if operators::is_operator(function) {
            return eval_operator(function, &values);
        }
        self.functions.call(function, target.is_some(), &values)
    }

    /// `&&` and `||` with error absorption: a determinate operand wins over
    /// an error in the other position.
    fn eval_logic(&self, args: &[Expr], activation: &dyn Activation, absorb: bool) -> Value {
        let left = self.eval(&args[0], activation);
        if left.as_bool() == Some(absorb) {
            return Value::Bool(absorb);
        }
        let right = self.eval(&args[1], activation);
        if right.as_bool() == Some(absorb) {
            return Value::Bool(absorb);
        }
        match (left, right) {
            (Value::Bool(a), Value::Bool(b)) => {
                if absorb {
                    Value::Bool(a || b)
                } else {
                    Value::Bool(a && b)
                }
            }
            (Value::Error(err), _) | (_, Value::Error(err)) => Value::Error(err),
            (other, _) => type_error(format!(
                "logical operator expects bool, got {}",
                other.type_name()
            )),
        }
    }

    fn eval_matches(&self, call_id: ExprId, values: &[Value]) -> Value {
        let (subject, pattern) = match values {
            [Value::String(s), Value::String(p)] => (s, p),
            _ => {
                return type_error("matches expects (string, string)".to_string());
            }
        };
        if let Some(re) = self.regexes.and_then(|cache| cache.get(&call_id)) {
            return Value::Bool(re.is_match(subject));
        }
        stdlib::match_regex(subject, pattern)
    }

    fn eval_comprehension(&self, c: &Comprehension, activation: &dyn Activation) -> Value {
        let range = self.eval(&c.iter_range, activation);
        let items: Vec<Value> = match &range {
            Value::List(elems) => elems.iter().cloned().collect(),
            Value::Map(map) => map
                .keys()
                .map(|k| match k {
                    MapKey::Bool(b) => Value::Bool(*b),
                    MapKey::Int(n) => Value::Int(*n),
                    MapKey::UInt(n) => Value::UInt(*n),
                    MapKey::String(s) => Value::String(s.clone()),
                })
                .collect(),
            Value::Error(_) => return range,
            other => {
                return type_error(format!("cannot iterate over {}", other.type_name()));
            }
        };

        let mut accu = self.eval(&c.accu_init, activation);
        if accu.is_error() {
            return accu;
        }
        for item in items {
            let mut scope = HierarchicalActivation::new(&activation);
            scope.insert(c.iter_var.clone(), item);
            scope.insert(c.accu_var.clone(), accu.clone());

            match self.eval(&c.loop_condition, &scope) {
                Value::Bool(true) => {}
                Value::Bool(false) => break,
                Value::Error(err) => return Value::Error(err),
                other => {
                    return type_error(format!(
                        "loop condition expects bool, got {}",
                        other.type_name()
                    ));
                }
            }

            accu = self.eval(&c.loop_step, &scope);
            if accu.is_error() {
                return accu;
            }
        }

        let mut scope = HierarchicalActivation::new(&activation);
        scope.insert(c.accu_var.clone(), accu);
        self.eval(&c.result, &scope)
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::Int(*n),
        Literal::UInt(n) => Value::UInt(*n),
        Literal::Double(n) => Value::Double(*n),
        Literal::String(s) => Value::from(s.as_str()),
        Literal::Bytes(b) => Value::Bytes(Arc::from(b.as_slice())),
    }
}

fn type_error(message: String) -> Value {
    Value::error(EvalError::TypeMismatch(message))
}

fn eval_operator(op: &str, values: &[Value]) -> Value {
    use operators::*;
    match op {
        LOGICAL_NOT => match &values[0] {
            Value::Bool(b) => Value::Bool(!b),
            other => type_error(format!("! expects bool, got {}", other.type_name())),
        },
        NEGATE => match &values[0] {
            Value::Int(n) => match n.checked_neg() {
                Some(n) => Value::Int(n),
                None => Value::error(EvalError::IntegerOverflow),
            },
            Value::Double(n) => Value::Double(-n),
            other => type_error(format!("- expects a number, got {}", other.type_name())),
        },
        EQUALS => Value::Bool(values[0] == values[1]),
        NOT_EQUALS => Value::Bool(values[0] != values[1]),
        LESS | LESS_EQUALS | GREATER | GREATER_EQUALS => {
            match values[0].partial_cmp(&values[1]) {
                Some(ordering) => {
                    let holds = match op {
                        LESS => ordering.is_lt(),
                        LESS_EQUALS => ordering.is_le(),
                        GREATER => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    };
                    Value::Bool(holds)
                }
                None => type_error(format!(
                    "cannot compare {} with {}",
                    values[0].type_name(),
                    values[1].type_name()
                )),
            }
        }
        ADD => eval_add(&values[0], &values[1]),
        SUBTRACT => eval_numeric(op, &values[0], &values[1]),
        MULTIPLY => eval_numeric(op, &values[0], &values[1]),
        DIVIDE => eval_numeric(op, &values[0], &values[1]),
        MODULO => eval_numeric(op, &values[0], &values[1]),
        INDEX => eval_index(&values[0], &values[1]),
        IN => eval_in(&values[0], &values[1]),
        other => Value::error(EvalError::NoMatchingOverload {
            function: other.to_string(),
        }),
    }
}

fn eval_add(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match x.checked_add(*y) {
            Some(n) => Value::Int(n),
            None => Value::error(EvalError::IntegerOverflow),
        },
        (Value::UInt(x), Value::UInt(y)) => match x.checked_add(*y) {
            Some(n) => Value::UInt(n),
            None => Value::error(EvalError::IntegerOverflow),
        },
        (Value::Double(x), Value::Double(y)) => Value::Double(x + y),
        (Value::String(x), Value::String(y)) => {
            let mut joined = String::with_capacity(x.len() + y.len());
            joined.push_str(x);
            joined.push_str(y);
            Value::from(joined)
        }
        (Value::Bytes(x), Value::Bytes(y)) => {
            let mut joined = Vec::with_capacity(x.len() + y.len());
            joined.extend_from_slice(x);
            joined.extend_from_slice(y);
            Value::Bytes(Arc::from(joined.as_slice()))
        }
        (Value::List(x), Value::List(y)) => {
            let mut joined = Vec::with_capacity(x.len() + y.len());
            joined.extend(x.iter().cloned());
            joined.extend(y.iter().cloned());
            Value::from(joined)
        }
        _ => type_error(format!(
            "cannot add {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

fn eval_numeric(op: &str, a: &Value, b: &Value) -> Value {
    use operators::*;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            let result = match op {
                SUBTRACT => x.checked_sub(*y),
                MULTIPLY => x.checked_mul(*y),
                DIVIDE => {
                    if *y == 0 {
                        return Value::error(EvalError::DivisionByZero);
                    }
                    x.checked_div(*y)
                }
                _ => {
                    if *y == 0 {
                        return Value::error(EvalError::DivisionByZero);
                    }
                    x.checked_rem(*y)
                }
            };
            match result {
                Some(n) => Value::Int(n),
                None => Value::error(EvalError::IntegerOverflow),
            }
        }
        (Value::UInt(x), Value::UInt(y)) => {
            let result = match op {
                SUBTRACT => x.checked_sub(*y),
                MULTIPLY => x.checked_mul(*y),
                DIVIDE => {
                    if *y == 0 {
                        return Value::error(EvalError::DivisionByZero);
                    }
                    x.checked_div(*y)
                }
                _ => {
                    if *y == 0 {
                        return Value::error(EvalError::DivisionByZero);
                    }
                    x.checked_rem(*y)
                }
            };
            match result {
                Some(n) => Value::UInt(n),
                None => Value::error(EvalError::IntegerOverflow),
            }
        }
        (Value::Double(x), Value::Double(y)) => match op {
            SUBTRACT => Value::Double(x - y),
            MULTIPLY => Value::Double(x * y),
            DIVIDE => Value::Double(x / y),
            _ => type_error("modulo does not apply to double".to_string()),
        },
        _ => type_error(format!(
            "operator does not apply to ({}, {})",
            a.type_name(),
            b.type_name()
        )),
    }
}

fn eval_index(operand: &Value, index: &Value) -> Value {
    match operand {
        Value::List(elems) => {
            let idx = match index {
                Value::Int(n) => *n,
                Value::UInt(n) => *n as i64,
                other => {
                    return type_error(format!(
                        "list index must be an integer, got {}",
                        other.type_name()
                    ));
                }
            };
            if idx < 0 || idx as usize >= elems.len() {
                return Value::error(EvalError::IndexOutOfRange {
                    index: idx,
                    len: elems.len(),
                });
            }
            elems[idx as usize].clone()
        }
        Value::Map(map) => {
            let key = match MapKey::from_value(index) {
                Ok(key) => key,
                Err(err) => return Value::error(err),
            };
            match map.get(&key) {
                Some(value) => value.clone(),
                None => Value::error(EvalError::NoSuchKey(key.to_string())),
            }
        }
        other => type_error(format!("{} cannot be indexed", other.type_name())),
    }
}

fn eval_in(needle: &Value, haystack: &Value) -> Value {
    match haystack {
        Value::List(elems) => Value::Bool(elems.iter().any(|elem| elem == needle)),
        Value::Map(map) => match MapKey::from_value(needle) {
            Ok(key) => Value::Bool(map.contains_key(&key)),
            Err(err) => Value::error(err),
        },
        other => type_error(format!(
            "'in' expects a list or map, got {}",
            other.type_name()
        )),
    }
}
