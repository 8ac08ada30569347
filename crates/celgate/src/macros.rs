//! Named macro translation.
//!
//! A macro is a zero-argument, globally-scoped call whose name matches an
//! entry in `Globals.functions`. At compile time each call site is replaced
//! by a structural copy of the macro body's AST, rebuilt node by node
//! through the call site's own [`AstBuilder`]. The indirection matters: AST
//! nodes carry parse-scoped ids, so a body parsed on its own can never be
//! physically shared with a separately parsed outer expression.

use std::collections::BTreeMap;

use celgate_cel::ast::{AstBuilder, Comprehension, Expr, ExprKind, MapEntry, StructField};
use celgate_cel::parse;

use crate::error::Error;
use crate::options::Globals;

/// Parsed macro bodies keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MacroRegistry {
    macros: BTreeMap<String, Expr>,
}

impl MacroRegistry {
    /// Parse every named function source in the globals.
    pub fn from_globals(globals: &Globals, descriptor: &str) -> Result<MacroRegistry, Error> {
        let mut macros = BTreeMap::new();
        for (name, source) in &globals.functions {
            let body = parse(source).map_err(|err| Error::Compilation {
                descriptor: descriptor.to_string(),
                id: name.clone(),
                message: err.to_string(),
            })?;
            macros.insert(name.clone(), body);
        }
        Ok(MacroRegistry { macros })
    }

    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.macros.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

/// Find the names of declared macros called anywhere a call site can host
/// one.
///
/// The walk recurses into call receivers/arguments and list elements only.
/// Struct values, map entries, and comprehension sub-expressions are not
/// scanned, so a macro referenced only inside a struct literal stays an
/// ordinary call and fails type-checking instead.
pub fn find_macro_calls(expr: &Expr, registry: &MacroRegistry) -> Vec<String> {
    let mut found = Vec::new();
    scan(expr, registry, &mut found);
    found
}

fn scan(expr: &Expr, registry: &MacroRegistry, found: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Call {
            target,
            function,
            args,
        } => {
            if target.is_none() && args.is_empty() && registry.contains(function) {
                if !found.iter().any(|name| name == function) {
                    found.push(function.clone());
                }
                return;
            }
            if let Some(target) = target {
                scan(target, registry, found);
            }
            for arg in args {
                scan(arg, registry, found);
            }
        }
        ExprKind::List { elements } => {
            for element in elements {
                scan(element, registry, found);
            }
        }
        _ => {}
    }
}

/// Replace every declared macro call site in `expr` with a structural copy
/// of the macro body, built through `builder`.
///
/// The same walk restriction as [`find_macro_calls`] applies.
pub fn inline_macros(expr: Expr, registry: &MacroRegistry, builder: &mut impl AstBuilder) -> Expr {
    if registry.is_empty() {
        return expr;
    }
    rewrite(expr, registry, builder)
}

fn rewrite(expr: Expr, registry: &MacroRegistry, builder: &mut impl AstBuilder) -> Expr {
    match expr.kind {
        ExprKind::Call {
            target,
            function,
            args,
        } => {
            if target.is_none() && args.is_empty() {
                if let Some(body) = registry.get(&function) {
                    return copy_expr(body, builder);
                }
            }
            let target = target.map(|t| Box::new(rewrite(*t, registry, builder)));
            let args = args
                .into_iter()
                .map(|arg| rewrite(arg, registry, builder))
                .collect();
            Expr {
                id: expr.id,
                kind: ExprKind::Call {
                    target,
                    function,
                    args,
                },
            }
        }
        ExprKind::List { elements } => {
            let elements = elements
                .into_iter()
                .map(|element| rewrite(element, registry, builder))
                .collect();
            Expr {
                id: expr.id,
                kind: ExprKind::List { elements },
            }
        }
        kind => Expr { id: expr.id, kind },
    }
}

/// Copy an expression tree node by node through a builder.
///
/// Every copied node gets a fresh id from the builder, so the copy lives
/// entirely in the host tree's id space.
pub fn copy_expr(expr: &Expr, builder: &mut impl AstBuilder) -> Expr {
    match &expr.kind {
        ExprKind::Literal(literal) => builder.literal(literal.clone()),
        ExprKind::Ident(name) => builder.ident(name.clone()),
        ExprKind::Select {
            operand,
            field,
            test_only,
        } => {
            let operand = copy_expr(operand, builder);
            builder.select(operand, field.clone(), *test_only)
        }
        ExprKind::Call {
            target,
            function,
            args,
        } => {
            let args: Vec<Expr> = args.iter().map(|arg| copy_expr(arg, builder)).collect();
            match target {
                Some(target) => {
                    let target = copy_expr(target, builder);
                    builder.member_call(target, function.clone(), args)
                }
                None => builder.global_call(function.clone(), args),
            }
        }
        ExprKind::List { elements } => {
            let elements = elements
                .iter()
                .map(|element| copy_expr(element, builder))
                .collect();
            builder.list(elements)
        }
        ExprKind::Map { entries } => {
            let entries = entries
                .iter()
                .map(|entry| MapEntry {
                    key: copy_expr(&entry.key, builder),
                    value: copy_expr(&entry.value, builder),
                })
                .collect();
            builder.map_literal(entries)
        }
        ExprKind::Struct { type_name, fields } => {
            let fields = fields
                .iter()
                .map(|field| StructField {
                    name: field.name.clone(),
                    value: copy_expr(&field.value, builder),
                })
                .collect();
            builder.struct_literal(type_name.clone(), fields)
        }
        ExprKind::Comprehension(c) => {
            let copied = Comprehension {
                iter_var: c.iter_var.clone(),
                iter_range: copy_expr(&c.iter_range, builder),
                accu_var: c.accu_var.clone(),
                accu_init: copy_expr(&c.accu_init, builder),
                loop_condition: copy_expr(&c.loop_condition, builder),
                loop_step: copy_expr(&c.loop_step, builder),
                result: copy_expr(&c.result, builder),
            };
            builder.comprehension(copied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celgate_cel::ast::ExprFactory;

    fn registry(pairs: &[(&str, &str)]) -> MacroRegistry {
        let mut globals = Globals::default();
        for (name, source) in pairs {
            globals
                .functions
                .insert(name.to_string(), source.to_string());
        }
        MacroRegistry::from_globals(&globals, "test").unwrap()
    }

    /// Structural equality that ignores node ids.
    fn same_shape(a: &Expr, b: &Expr) -> bool {
        let mut fa = ExprFactory::new();
        let mut fb = ExprFactory::new();
        copy_expr(a, &mut fa) == copy_expr(b, &mut fb)
    }

    #[test]
    fn registry_parses_bodies() {
        let registry = registry(&[("is_admin", "'admin' in roles")]);
        assert!(registry.contains("is_admin"));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn registry_rejects_bad_sources() {
        let mut globals = Globals::default();
        globals
            .functions
            .insert("broken".to_string(), "1 +".to_string());
        assert!(MacroRegistry::from_globals(&globals, "test").is_err());
    }

    #[test]
    fn finds_macro_calls_in_args_and_lists() {
        let registry = registry(&[("m", "1"), ("n", "2")]);
        let expr = parse("f(m()) + size([n()])").unwrap();
        let found = find_macro_calls(&expr, &registry);
        assert_eq!(found, vec!["m".to_string(), "n".to_string()]);
    }

    #[test]
    fn does_not_scan_struct_values() {
        let registry = registry(&[("m", "1")]);
        let expr = parse("{'k': m()}").unwrap();
        assert!(find_macro_calls(&expr, &registry).is_empty());
    }

    #[test]
    fn copy_preserves_shape_with_fresh_ids() {
        let body = parse("a.b(c, [1, {'k': v}])").unwrap();
        let mut factory = ExprFactory::continuing(&body);
        let copy = copy_expr(&body, &mut factory);

        assert!(same_shape(&body, &copy));
        // Every id in the copy is new.
        let max_original = body.max_id();
        copy.visit(&mut |e| assert!(e.id > max_original));
    }

    #[test]
    fn inline_replaces_call_sites() {
        let registry = registry(&[("limit", "10")]);
        let expr = parse("x < limit()").unwrap();
        let mut factory = ExprFactory::continuing(&expr);
        let inlined = inline_macros(expr, &registry, &mut factory);

        let expected = parse("x < 10").unwrap();
        assert!(same_shape(&inlined, &expected));
    }

    #[test]
    fn inline_is_deterministic_per_site() {
        // Both occurrences expand to the same shape, each with its own
        // fresh nodes.
        let registry = registry(&[("m", "a + b")]);
        let expr = parse("m() == m()").unwrap();
        let mut factory = ExprFactory::continuing(&expr);
        let inlined = inline_macros(expr, &registry, &mut factory);

        let ExprKind::Call { args, .. } = &inlined.kind else {
            panic!("expected a call");
        };
        assert!(same_shape(&args[0], &args[1]));
        assert_ne!(args[0].id, args[1].id);
    }
}
