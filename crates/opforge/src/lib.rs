//! # opforge
//!
//! Compile, cache and call native kernels declared in annotated C++ sources.
//!
//! A source file marks callable entry points with `OPFORGE_KERNEL` (device
//! kernels, named `*_kernel`) and `OPFORGE_FUNC` (host functions). The
//! [`Engine`] parses those declarations, generates a wrapper for every
//! signature that is actually called, compiles the wrappers into one shared
//! library per source file and context, and dispatches calls into it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use opforge::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let engine = Engine::new();
//!     engine.load_source("kernels/ops.cpp")?;
//!
//!     let a = vec![1, 2, 3];
//!     let b = vec![4, 5, 6];
//!     let mut out = vec![0; 3];
//!     let n = engine.call(
//!         "add",
//!         CallArgs::new().tensor(&a).tensor(&b).tensor_mut(&mut out).scalar(3),
//!     )?;
//!     assert_eq!(n, Some(Scalar::I32(3)));
//!     assert_eq!(out, vec![5, 7, 9]);
//!     Ok(())
//! }
//! ```
//!
//! ## Build cache
//!
//! Artifacts live next to each source in a `build/` directory (see
//! [`EngineConfig::build_dir_name`]). A manifest records which signatures an
//! artifact holds; a new signature or a changed source triggers a rebuild
//! under a cross-process file lock, so concurrent processes compile at most
//! once per change.
//!
//! ## Tensors
//!
//! Arguments are matched to a [`Glue`] by their runtime type. `Vec<T>` of
//! every primitive element is supported out of the box; other tensor types
//! register their own glue with [`EngineBuilder::glue`] or
//! [`Engine::register_glue`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod engine;

pub use engine::{BoundFunction, Engine, EngineBuilder};

pub use opforge_core::*;

pub use opforge_runtime::{
    Arg, BuildOutcome, CallArgs, Compiler, FunctionRegistry, Glue, GlueCapabilities, GlueRegistry,
    HostCompiler, HostGlue, NativeEntry, RawData, SourceFile,
};

// Re-export the layers for backends that need more than the facade.
pub use opforge_codegen as codegen;
pub use opforge_runtime as runtime;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Engine, EngineBuilder};
    pub use opforge_core::{
        Context, Device, EngineConfig, OpforgeError, Result, Scalar, ScalarType, TemplateArgs,
    };
    pub use opforge_runtime::{Arg, CallArgs, Glue, GlueCapabilities, RawData};
}
