//! # opforge runtime
//!
//! Everything between a parsed declaration and a native call:
//!
//! - [`build`] - per-source manifests, the rebuild decision and the
//!   cross-process build lock
//! - [`compiler`] - the [`Compiler`] collaborator and the system C++ compiler
//! - [`loader`] - shared-library loading and symbol lookup
//! - [`registry`] - loaded entry points per (context, source file)
//! - [`glue`] - tensor adapters
//! - [`dispatch`] - argument binding and marshaling
//!
//! The facade crate `opforge` wires these together; they are public so that
//! backends can supply their own compiler and glue.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod build;
pub mod compiler;
pub mod dispatch;
pub mod glue;
pub mod loader;
pub mod registry;
pub mod source;

pub use build::{BuildCache, BuildLayout, BuildManifest, BuildOutcome, ManifestLock, MANIFEST_VERSION};
pub use compiler::{BuildFlags, Compiler, HostCompiler};
pub use dispatch::{bind, invoke, Arg, CallArgs, CallBinding};
pub use glue::{AsyncCall, Glue, GlueCapabilities, GlueRegistry, HostGlue, RawData};
pub use loader::{AsyncFn, CompiledModule, Loader, PackedFn, ResolveFn};
pub use registry::{FunctionRegistry, ModuleTable, NativeEntry};
pub use source::{SourceFile, SourceSnapshot};
