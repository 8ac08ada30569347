//! Declaration environment for expression compilation.
//!
//! The `Env` holds the variable and function declarations an expression is
//! checked against, plus the optional protobuf type registry for resolving
//! message fields. Compiled programs snapshot the environment's runtime
//! pieces (function implementations, constant values), so an `Env` can be
//! dropped once its programs are built.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::ast::{Expr, ExprId};
use crate::checker::{check, CheckResult};
use crate::decls::{FunctionDecl, VariableDecl};
use crate::error::CheckError;
use crate::functions::FunctionRegistry;
use crate::program::Program;
use crate::registry::TypeRegistry;
use crate::stdlib;
use crate::types::CelType;
use crate::value::Value;

/// A declaration environment.
#[derive(Debug, Clone, Default)]
pub struct Env {
    variables: HashMap<String, VariableDecl>,
    functions: HashMap<String, FunctionDecl>,
    types: Option<TypeRegistry>,
}

impl Env {
    /// Create an empty environment with no declarations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an environment with the full standard library.
    pub fn with_standard_library() -> Self {
        let mut env = Self::new();
        for decl in stdlib::declarations() {
            env.add_function(decl);
        }
        env
    }

    /// Create an environment with the standard library minus any
    /// declaration whose name appears in `reserved`.
    ///
    /// This is how stdlib overriding works: a schema field or custom
    /// declaration named `size` suppresses the builtin of the same name
    /// instead of conflicting with it.
    pub fn with_filtered_standard_library(reserved: &HashSet<String>) -> Self {
        let mut env = Self::new();
        for decl in stdlib::declarations() {
            if !reserved.contains(&decl.name) {
                env.add_function(decl);
            }
        }
        env
    }

    /// Declare a variable.
    pub fn add_variable(&mut self, name: impl Into<String>, cel_type: CelType) {
        let name = name.into();
        self.variables
            .insert(name.clone(), VariableDecl::new(name, cel_type));
    }

    /// Declare a constant with its value.
    pub fn add_constant(&mut self, name: impl Into<String>, cel_type: CelType, value: Value) {
        let name = name.into();
        self.variables
            .insert(name.clone(), VariableDecl::constant(name, cel_type, value));
    }

    /// Declare a function. Overloads merge when the name already exists.
    pub fn add_function(&mut self, decl: FunctionDecl) {
        match self.functions.get_mut(&decl.name) {
            Some(existing) => existing.overloads.extend(decl.overloads),
            None => {
                self.functions.insert(decl.name.clone(), decl);
            }
        }
    }

    /// Attach a protobuf type registry.
    pub fn set_types(&mut self, types: TypeRegistry) {
        self.types = Some(types);
    }

    /// Look up a variable declaration.
    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.get(name)
    }

    /// Look up a function declaration.
    pub fn function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.get(name)
    }

    /// The protobuf type registry, if one is attached.
    pub fn types(&self) -> Option<&TypeRegistry> {
        self.types.as_ref()
    }

    /// Type-check an expression against this environment.
    pub fn check(&self, expr: &Expr) -> Result<CheckResult, Vec<CheckError>> {
        check(expr, self)
    }

    /// Build the runtime function registry from the declared
    /// implementations.
    pub fn runtime_functions(&self) -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        for decl in self.functions.values() {
            registry.register_decl(decl);
        }
        registry
    }

    /// Assemble a compiled program from a checked expression.
    ///
    /// The program snapshots the function implementations and constant
    /// values declared here, plus the precompiled regex cache produced by
    /// the compiler.
    pub fn program(
        &self,
        expr: Expr,
        source: impl Into<String>,
        result_type: CelType,
        regexes: HashMap<ExprId, Regex>,
    ) -> Program {
        let consts = self
            .variables
            .values()
            .filter_map(|decl| {
                decl.const_value
                    .as_ref()
                    .map(|value| (decl.name.clone(), value.clone()))
            })
            .collect();
        Program::new(expr, source.into(), self.runtime_functions(), consts, result_type, regexes)
    }
}
