//! Rule resolution, compilation, and validation for protobuf RPC services.
//!
//! Services declare authorization and validation rules as CEL boolean
//! expressions attached to files, services, methods, messages, and fields,
//! either embedded in descriptor options or supplied as external
//! configuration. This crate resolves those declarations across the
//! five-scope hierarchy, compiles them into type-checked predicates, and
//! hands out per-descriptor validators that interceptors evaluate per
//! request, with at-most-one compilation per scope.
//!
//! # Quick start
//!
//! ```no_run
//! use celgate::config::Config;
//! use celgate::context::AttributeContext;
//! use celgate::manager::Manager;
//! use prost_reflect::{DescriptorPool, DynamicMessage};
//!
//! fn authorize(
//!     pool: DescriptorPool,
//!     config: Config,
//!     request: &DynamicMessage,
//! ) -> Result<(), celgate::Error> {
//!     let manager = Manager::new(pool, config);
//!     let validator = manager.get_service_validator_by_name("demo.v1.Demo")?;
//!
//!     let context = AttributeContext::new()
//!         .with_operation("/demo.v1.Demo/Send")
//!         .with_protocol("grpc")
//!         .with_header("authorization", "Bearer ...");
//!     validator.validate(&context, request)
//! }
//! ```
//!
//! # Architecture
//!
//! - [`rule`] / [`options`] / [`config`]: the declaration model and its
//!   key-wise, last-wins merge.
//! - [`extension`]: rule data and resource annotations read from
//!   descriptor options.
//! - [`resolve`]: the five-scope precedence merge producing one effective
//!   rule per descriptor.
//! - [`envbuild`] / [`typemap`] / [`macros`]: the compilation environment
//!   for each scope, declared types, and named macro inlining.
//! - [`resource`]: regex rules synthesized from resource name patterns.
//! - [`compile`] / [`validator`]: executable predicates and the
//!   fieldmask-aware validation algorithm.
//! - [`manager`]: memoized construction, library injection, and the
//!   package-keyed registry.

pub mod compile;
pub mod config;
pub mod context;
pub mod envbuild;
pub mod error;
pub mod extension;
pub mod macros;
pub mod manager;
pub mod options;
pub mod resolve;
pub mod resource;
pub mod rule;
pub mod typemap;
pub mod validator;

pub use config::Config;
pub use context::{AttributeContext, HeaderMap};
pub use envbuild::Library;
pub use error::{Error, ValidationError, ValidationErrorKind};
pub use manager::{Manager, Registry};
pub use options::{Globals, Overloads, RuleOptions};
pub use rule::{FieldRule, MessageRule, MethodRule, ProgramDecl, Rule, ServiceRule};
pub use typemap::{DeclaredType, FunctionSignature};
pub use validator::{MessageValidator, ServiceValidator};
