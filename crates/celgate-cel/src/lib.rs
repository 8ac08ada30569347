//! Expression language for celgate rules.
//!
//! This crate is the CEL subset the rule engine compiles rule expressions
//! with: a logos lexer, a recursive descent parser with parse-time macro
//! expansion, a schema-aware type checker, and a tree-walking evaluator
//! over immutable compiled programs.
//!
//! # Quick start
//!
//! ```
//! use celgate_cel::{parse, CelType, Env};
//! use celgate_cel::activation::MapActivation;
//! use celgate_cel::value::Value;
//! use std::collections::HashMap;
//!
//! let mut env = Env::with_standard_library();
//! env.add_variable("name", CelType::String);
//!
//! let source = "name != ''";
//! let expr = parse(source).unwrap();
//! let checked = env.check(&expr).unwrap();
//! let program = env.program(expr, source, checked.result_type, HashMap::new());
//!
//! let mut activation = MapActivation::new();
//! activation.insert("name", "x");
//! assert_eq!(program.eval(&activation), Value::Bool(true));
//! ```
//!
//! # Architecture
//!
//! - [`lexer`] / [`parser`]: source text to id-carrying AST, with the
//!   standard macros (`has`, `all`, `exists`, ...) expanded inline.
//! - [`ast`]: expression nodes and the [`ast::AstBuilder`] capability that
//!   everything constructing or copying nodes goes through.
//! - [`env`] / [`checker`]: declarations and type checking against an
//!   optional protobuf [`registry::TypeRegistry`].
//! - [`eval`] / [`program`]: runtime values, activations, and evaluation.

pub mod activation;
pub mod ast;
pub mod checker;
pub mod decls;
pub mod env;
pub mod error;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod program;
pub mod registry;
pub mod stdlib;
pub mod types;
pub mod value;

pub use ast::{AstBuilder, Expr, ExprFactory, ExprId, ExprKind};
pub use checker::{check, CheckResult};
pub use env::Env;
pub use error::{CheckError, EvalError};
pub use parser::{parse, ParseError};
pub use program::Program;
pub use registry::TypeRegistry;
pub use types::CelType;
pub use value::Value;
