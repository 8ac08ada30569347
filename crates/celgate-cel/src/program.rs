//! Compiled programs.
//!
//! A `Program` is the immutable unit handed to request-time evaluation:
//! the expression tree, the runtime function registry, bound constant
//! values, and the precompiled regex cache. All state is behind `Arc`s and
//! evaluation holds no mutable scratch, so one program can be evaluated
//! from any number of threads concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::activation::{Activation, MapActivation};
use crate::ast::{Expr, ExprId};
use crate::eval::Evaluator;
use crate::functions::FunctionRegistry;
use crate::types::CelType;
use crate::value::Value;

/// A compiled expression ready for evaluation.
#[derive(Debug, Clone)]
pub struct Program {
    expr: Arc<Expr>,
    source: Arc<str>,
    functions: Arc<FunctionRegistry>,
    consts: Arc<MapActivation>,
    result_type: CelType,
    regexes: Arc<HashMap<ExprId, Regex>>,
}

impl Program {
    /// Assemble a program. Use [`crate::env::Env::program`] rather than
    /// calling this directly.
    pub fn new(
        expr: Expr,
        source: String,
        functions: FunctionRegistry,
        consts: MapActivation,
        result_type: CelType,
        regexes: HashMap<ExprId, Regex>,
    ) -> Self {
        Self {
            expr: Arc::new(expr),
            source: Arc::from(source.as_str()),
            functions: Arc::new(functions),
            consts: Arc::new(consts),
            result_type,
            regexes: Arc::new(regexes),
        }
    }

    /// The expression tree.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The checked result type.
    pub fn result_type(&self) -> &CelType {
        &self.result_type
    }

    /// Evaluate with the given variable bindings.
    ///
    /// Caller bindings shadow declared constants.
    pub fn eval(&self, activation: &dyn Activation) -> Value {
        let chained = ChainActivation {
            primary: activation,
            fallback: &*self.consts,
        };
        Evaluator::new(&self.functions)
            .with_regexes(&self.regexes)
            .eval(&self.expr, &chained)
    }
}

/// Tries the primary activation first, then the fallback.
struct ChainActivation<'a> {
    primary: &'a dyn Activation,
    fallback: &'a dyn Activation,
}

impl Activation for ChainActivation<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.primary
            .resolve(name)
            .or_else(|| self.fallback.resolve(name))
    }

    fn has(&self, name: &str) -> bool {
        self.primary.has(name) || self.fallback.has(name)
    }
}
