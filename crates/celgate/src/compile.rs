//! Compilation of rule programs into executable predicates.
//!
//! Each program declaration parses, gets its named macros inlined, type
//! checks against the scope environment, and must come out boolean. Literal
//! `matches()` patterns compile to regexes here so a malformed pattern is a
//! build failure instead of a per-request evaluation error.

use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use celgate_cel::ast::{Expr, ExprFactory, ExprId, ExprKind, Literal};
use celgate_cel::{parse, CelType, Env, Program};

use crate::error::Error;
use crate::macros::{self, MacroRegistry};
use crate::rule::{ProgramDecl, Rule};

/// One compiled predicate, keeping the declaration id it reports failures
/// under.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    id: String,
    program: Program,
}

impl CompiledProgram {
    /// The declaration's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The executable program.
    pub fn program(&self) -> &Program {
        &self.program
    }
}

/// Compile every program a rule declares, in declaration order.
pub fn compile_rule(
    rule: &Rule,
    env: &Env,
    descriptor: &str,
) -> Result<Vec<CompiledProgram>, Error> {
    let macros = MacroRegistry::from_globals(&rule.options.globals, descriptor)?;
    rule.programs
        .iter()
        .map(|decl| compile_program(decl, &macros, env, descriptor))
        .collect()
}

fn compile_program(
    decl: &ProgramDecl,
    macros: &MacroRegistry,
    env: &Env,
    descriptor: &str,
) -> Result<CompiledProgram, Error> {
    let fail = |message: String| Error::Compilation {
        descriptor: descriptor.to_string(),
        id: decl.id.clone(),
        message,
    };

    let expr = parse(&decl.expression).map_err(|err| fail(err.to_string()))?;

    let found = macros::find_macro_calls(&expr, macros);
    let expr = if found.is_empty() {
        expr
    } else {
        debug!(program = %decl.id, macros = ?found, "inlining named macros");
        let mut factory = ExprFactory::continuing(&expr);
        macros::inline_macros(expr, macros, &mut factory)
    };

    let checked = env.check(&expr).map_err(|errors| {
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        fail(message)
    })?;
    if !matches!(checked.result_type, CelType::Bool | CelType::Dyn) {
        return Err(fail(format!(
            "rule must evaluate to bool, got {}",
            checked.result_type.display_name()
        )));
    }

    let regexes = precompile_regexes(&expr).map_err(fail)?;
    let program = env.program(expr, decl.expression.as_str(), checked.result_type, regexes);
    Ok(CompiledProgram {
        id: decl.id.clone(),
        program,
    })
}

/// Compile every literal `matches()` pattern, keyed by call node id.
fn precompile_regexes(expr: &Expr) -> Result<HashMap<ExprId, Regex>, String> {
    let mut regexes = HashMap::new();
    let mut error = None;
    expr.visit(&mut |node| {
        if error.is_some() {
            return;
        }
        let ExprKind::Call { function, args, .. } = &node.kind else {
            return;
        };
        if function != "matches" {
            return;
        }
        // The pattern is the last argument in both the member and global
        // call forms.
        if let Some(Expr {
            kind: ExprKind::Literal(Literal::String(pattern)),
            ..
        }) = args.last()
        {
            match Regex::new(pattern) {
                Ok(regex) => {
                    regexes.insert(node.id, regex);
                }
                Err(err) => {
                    error = Some(format!("invalid regular expression '{}': {}", pattern, err));
                }
            }
        }
    });
    match error {
        Some(message) => Err(message),
        None => Ok(regexes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use celgate_cel::activation::MapActivation;
    use celgate_cel::Value;

    fn rule(programs: &[(&str, &str)]) -> Rule {
        Rule {
            programs: programs
                .iter()
                .map(|(id, expr)| ProgramDecl::new(*id, *expr))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn tautology_compiles_and_passes() {
        let env = Env::with_standard_library();
        let compiled = compile_rule(&rule(&[("t", "1 == 1")]), &env, "test").unwrap();
        assert_eq!(compiled.len(), 1);
        assert_eq!(
            compiled[0]
                .program()
                .eval(&celgate_cel::activation::EmptyActivation),
            Value::Bool(true)
        );
    }

    #[test]
    fn empty_rule_compiles_to_nothing() {
        let env = Env::with_standard_library();
        let compiled = compile_rule(&Rule::default(), &env, "test").unwrap();
        assert!(compiled.is_empty());
    }

    #[test]
    fn non_boolean_result_is_rejected() {
        let env = Env::with_standard_library();
        let err = compile_rule(&rule(&[("n", "1 + 1")]), &env, "test").unwrap_err();
        assert!(matches!(err, Error::Compilation { .. }));
        assert!(err.to_string().contains("bool"));
    }

    #[test]
    fn unknown_identifier_is_a_compile_error() {
        let env = Env::with_standard_library();
        assert!(compile_rule(&rule(&[("u", "nope == 1")]), &env, "test").is_err());
    }

    #[test]
    fn malformed_literal_regex_fails_at_compile_time() {
        let mut env = Env::with_standard_library();
        env.add_variable("name", CelType::String);
        let err = compile_rule(&rule(&[("r", "name.matches('(')")]), &env, "test").unwrap_err();
        assert!(err.to_string().contains("regular expression"));
    }

    #[test]
    fn literal_regex_is_precompiled_and_matches() {
        let mut env = Env::with_standard_library();
        env.add_variable("name", CelType::String);
        let compiled =
            compile_rule(&rule(&[("r", "name.matches('^a/[0-9]+$')")]), &env, "test").unwrap();

        let mut activation = MapActivation::new();
        activation.insert("name", "a/42");
        assert_eq!(compiled[0].program().eval(&activation), Value::Bool(true));

        let mut activation = MapActivation::new();
        activation.insert("name", "b/42");
        assert_eq!(compiled[0].program().eval(&activation), Value::Bool(false));
    }

    #[test]
    fn named_macros_inline_before_checking() {
        let mut options = crate::options::RuleOptions::default();
        options
            .globals
            .functions
            .insert("limit".to_string(), "10".to_string());
        let with_macro = Rule {
            options,
            programs: vec![ProgramDecl::new("m", "count < limit()")],
        };

        let mut env = Env::with_standard_library();
        env.add_variable("count", CelType::Int);
        let compiled = compile_rule(&with_macro, &env, "test").unwrap();

        let mut activation = MapActivation::new();
        activation.insert("count", 5i64);
        assert_eq!(compiled[0].program().eval(&activation), Value::Bool(true));

        let mut activation = MapActivation::new();
        activation.insert("count", 50i64);
        assert_eq!(compiled[0].program().eval(&activation), Value::Bool(false));
    }

    #[test]
    fn programs_compile_in_declaration_order() {
        let env = Env::with_standard_library();
        let compiled =
            compile_rule(&rule(&[("first", "true"), ("second", "true")]), &env, "test").unwrap();
        assert_eq!(compiled[0].id(), "first");
        assert_eq!(compiled[1].id(), "second");
    }
}
