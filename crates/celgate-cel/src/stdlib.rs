//! Standard library declarations and implementations.
//!
//! Operators are checked and evaluated natively; this module declares the
//! named functions. Every declaration here can be suppressed by name when
//! the environment is built with a reserved-name set, which is how a schema
//! field called `size` shadows the builtin instead of conflicting with it.

use std::sync::Arc;

use crate::decls::{FunctionDecl, OverloadDecl};
use crate::error::EvalError;
use crate::types::CelType;
use crate::value::Value;

/// All standard library function declarations.
pub fn declarations() -> Vec<FunctionDecl> {
    vec![
        size_decl(),
        contains_decl(),
        starts_with_decl(),
        ends_with_decl(),
        matches_decl(),
        string_decl(),
        int_decl(),
        uint_decl(),
        double_decl(),
    ]
}

fn size_decl() -> FunctionDecl {
    let imp = |args: &[Value]| match &args[0] {
        Value::String(s) => Value::Int(s.chars().count() as i64),
        Value::Bytes(b) => Value::Int(b.len() as i64),
        Value::List(l) => Value::Int(l.len() as i64),
        Value::Map(m) => Value::Int(m.len() as i64),
        other => Value::error(EvalError::TypeMismatch(format!(
            "size does not apply to {}",
            other.type_name()
        ))),
    };
    FunctionDecl::new("size")
        .with_overload(
            OverloadDecl::function("size_string", vec![CelType::String], CelType::Int)
                .with_impl(imp),
        )
        .with_overload(
            OverloadDecl::function("size_bytes", vec![CelType::Bytes], CelType::Int)
                .with_impl(imp),
        )
        .with_overload(
            OverloadDecl::function(
                "size_list",
                vec![CelType::list(CelType::Dyn)],
                CelType::Int,
            )
            .with_impl(imp),
        )
        .with_overload(
            OverloadDecl::function(
                "size_map",
                vec![CelType::map(CelType::Dyn, CelType::Dyn)],
                CelType::Int,
            )
            .with_impl(imp),
        )
        .with_overload(
            OverloadDecl::method("string_size", vec![CelType::String], CelType::Int)
                .with_impl(imp),
        )
        .with_overload(
            OverloadDecl::method("bytes_size", vec![CelType::Bytes], CelType::Int)
                .with_impl(imp),
        )
        .with_overload(
            OverloadDecl::method("list_size", vec![CelType::list(CelType::Dyn)], CelType::Int)
                .with_impl(imp),
        )
        .with_overload(
            OverloadDecl::method(
                "map_size",
                vec![CelType::map(CelType::Dyn, CelType::Dyn)],
                CelType::Int,
            )
            .with_impl(imp),
        )
}

fn string_pair_impl(
    name: &'static str,
    f: fn(&str, &str) -> bool,
) -> impl Fn(&[Value]) -> Value + Send + Sync {
    move |args: &[Value]| match (&args[0], &args[1]) {
        (Value::String(s), Value::String(arg)) => Value::Bool(f(s, arg)),
        (a, b) => Value::error(EvalError::TypeMismatch(format!(
            "{} does not apply to ({}, {})",
            name,
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn contains_decl() -> FunctionDecl {
    FunctionDecl::new("contains").with_overload(
        OverloadDecl::method(
            "string_contains_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        )
        .with_impl(string_pair_impl("contains", |s, arg| s.contains(arg))),
    )
}

fn starts_with_decl() -> FunctionDecl {
    FunctionDecl::new("startsWith").with_overload(
        OverloadDecl::method(
            "string_starts_with_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        )
        .with_impl(string_pair_impl("startsWith", |s, arg| s.starts_with(arg))),
    )
}

fn ends_with_decl() -> FunctionDecl {
    FunctionDecl::new("endsWith").with_overload(
        OverloadDecl::method(
            "string_ends_with_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        )
        .with_impl(string_pair_impl("endsWith", |s, arg| s.ends_with(arg))),
    )
}

fn matches_decl() -> FunctionDecl {
    // No implementation: the evaluator handles matches() natively so it can
    // consult the program's precompiled regex cache.
    FunctionDecl::new("matches")
        .with_overload(OverloadDecl::method(
            "string_matches_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        ))
        .with_overload(OverloadDecl::function(
            "matches_string_string",
            vec![CelType::String, CelType::String],
            CelType::Bool,
        ))
}

fn string_decl() -> FunctionDecl {
    let imp = |args: &[Value]| match &args[0] {
        Value::String(s) => Value::String(s.clone()),
        Value::Int(n) => Value::from(n.to_string()),
        Value::UInt(n) => Value::from(n.to_string()),
        Value::Double(n) => Value::from(n.to_string()),
        Value::Bool(b) => Value::from(b.to_string()),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => Value::from(s),
            Err(_) => Value::error(EvalError::TypeMismatch(
                "bytes are not valid UTF-8".to_string(),
            )),
        },
        other => Value::error(EvalError::TypeMismatch(format!(
            "cannot convert {} to string",
            other.type_name()
        ))),
    };
    let mut decl = FunctionDecl::new("string");
    for (id, param) in [
        ("string_to_string", CelType::String),
        ("int_to_string", CelType::Int),
        ("uint_to_string", CelType::UInt),
        ("double_to_string", CelType::Double),
        ("bool_to_string", CelType::Bool),
        ("bytes_to_string", CelType::Bytes),
    ] {
        decl = decl
            .with_overload(OverloadDecl::function(id, vec![param], CelType::String).with_impl(imp));
    }
    decl
}

fn int_decl() -> FunctionDecl {
    let imp = |args: &[Value]| match &args[0] {
        Value::Int(n) => Value::Int(*n),
        Value::UInt(n) => {
            if *n <= i64::MAX as u64 {
                Value::Int(*n as i64)
            } else {
                Value::error(EvalError::IntegerOverflow)
            }
        }
        Value::Double(n) => Value::Int(*n as i64),
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::error(EvalError::TypeMismatch(format!(
                "cannot parse '{}' as int",
                s
            ))),
        },
        other => Value::error(EvalError::TypeMismatch(format!(
            "cannot convert {} to int",
            other.type_name()
        ))),
    };
    let mut decl = FunctionDecl::new("int");
    for (id, param) in [
        ("int_to_int", CelType::Int),
        ("uint_to_int", CelType::UInt),
        ("double_to_int", CelType::Double),
        ("string_to_int", CelType::String),
    ] {
        decl = decl
            .with_overload(OverloadDecl::function(id, vec![param], CelType::Int).with_impl(imp));
    }
    decl
}

fn uint_decl() -> FunctionDecl {
    let imp = |args: &[Value]| match &args[0] {
        Value::UInt(n) => Value::UInt(*n),
        Value::Int(n) => {
            if *n >= 0 {
                Value::UInt(*n as u64)
            } else {
                Value::error(EvalError::IntegerOverflow)
            }
        }
        Value::String(s) => match s.parse::<u64>() {
            Ok(n) => Value::UInt(n),
            Err(_) => Value::error(EvalError::TypeMismatch(format!(
                "cannot parse '{}' as uint",
                s
            ))),
        },
        other => Value::error(EvalError::TypeMismatch(format!(
            "cannot convert {} to uint",
            other.type_name()
        ))),
    };
    let mut decl = FunctionDecl::new("uint");
    for (id, param) in [
        ("uint_to_uint", CelType::UInt),
        ("int_to_uint", CelType::Int),
        ("string_to_uint", CelType::String),
    ] {
        decl = decl
            .with_overload(OverloadDecl::function(id, vec![param], CelType::UInt).with_impl(imp));
    }
    decl
}

fn double_decl() -> FunctionDecl {
    let imp = |args: &[Value]| match &args[0] {
        Value::Double(n) => Value::Double(*n),
        Value::Int(n) => Value::Double(*n as f64),
        Value::UInt(n) => Value::Double(*n as f64),
        Value::String(s) => match s.parse::<f64>() {
            Ok(n) => Value::Double(n),
            Err(_) => Value::error(EvalError::TypeMismatch(format!(
                "cannot parse '{}' as double",
                s
            ))),
        },
        other => Value::error(EvalError::TypeMismatch(format!(
            "cannot convert {} to double",
            other.type_name()
        ))),
    };
    let mut decl = FunctionDecl::new("double");
    for (id, param) in [
        ("double_to_double", CelType::Double),
        ("int_to_double", CelType::Int),
        ("uint_to_double", CelType::UInt),
        ("string_to_double", CelType::String),
    ] {
        decl = decl.with_overload(
            OverloadDecl::function(id, vec![param], CelType::Double).with_impl(imp),
        );
    }
    decl
}

/// Evaluate a `matches()` call without a precompiled regex.
///
/// Used by the evaluator as the fallback when the call site was not seen at
/// compile time (e.g. a pattern built from a non-literal expression).
pub fn match_regex(subject: &str, pattern: &str) -> Value {
    match regex::Regex::new(pattern) {
        Ok(re) => Value::Bool(re.is_match(subject)),
        Err(err) => Value::Error(Arc::new(EvalError::InvalidRegex(err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_applies_to_strings_and_lists() {
        let decls = declarations();
        let size = decls.iter().find(|d| d.name == "size").unwrap();
        let imp = size.overloads[0].implementation.as_ref().unwrap();
        assert_eq!(imp(&[Value::from("abc")]), Value::Int(3));
        assert_eq!(
            imp(&[Value::from(vec![Value::Int(1), Value::Int(2)])]),
            Value::Int(2)
        );
    }

    #[test]
    fn conversions() {
        let decls = declarations();
        let int = decls.iter().find(|d| d.name == "int").unwrap();
        let imp = int.overloads[0].implementation.as_ref().unwrap();
        assert_eq!(imp(&[Value::from("42")]), Value::Int(42));
        assert!(imp(&[Value::from("x")]).is_error());
    }

    #[test]
    fn match_regex_fallback() {
        assert_eq!(match_regex("a/123", r"^a/\d+$"), Value::Bool(true));
        assert!(match_regex("a", "(").is_error());
    }
}
