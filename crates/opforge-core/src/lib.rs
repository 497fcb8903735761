//! # opforge core
//!
//! Shared types for the opforge kernel build/cache/dispatch engine.
//!
//! This crate holds everything that does not touch the filesystem or a
//! dynamic library:
//!
//! - [`ScalarType`], [`DType`] and [`TemplateType`] - the type model of a
//!   declared kernel parameter
//! - [`Scalar`] - a typed runtime scalar and its conversion rules
//! - [`IdCode`] - the canonical signature identifier and its hashed symbol
//! - [`parse_declarations`] - the annotated-source declaration parser
//! - [`Declaration`] - one parsed kernel or function declaration
//! - [`EngineConfig`] - engine-wide settings
//!
//! ## Example
//!
//! ```
//! use opforge_core::{parse_declarations, IdCode};
//!
//! let source = "OPFORGE_FUNC int add(const int* a, const int* b, int* out, int n) {";
//! let decls = parse_declarations(source).unwrap();
//! let types = decls[0].concrete_types().unwrap();
//! let idcode = IdCode::new(&decls[0].name, &types);
//! assert_eq!(idcode.as_str(), "add:const int*,const int*,int*,int");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod declaration;
pub mod error;
pub mod parser;
pub mod signature;
pub mod types;
pub mod value;

pub use config::EngineConfig;
pub use declaration::{Declaration, FuncKind, Param, ReturnType, TemplateArgs};
pub use error::{OpforgeError, Result};
pub use parser::{parse_declarations, FUNC_MARKER, KERNEL_MARKER, KERNEL_SUFFIX};
pub use signature::IdCode;
pub use types::{Context, DType, Device, Element, ParamType, ScalarType, TemplateType};
pub use value::Scalar;
