//! Dynamic loading of compiled artifacts.

use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, info};

use opforge_codegen::{ASYNC_SUFFIX, PACKED_SUFFIX};
use opforge_core::{Context, IdCode, OpforgeError, Result};

use crate::registry::NativeEntry;

/// Uniform trampoline: `(device_id, args, rtn)`.
///
/// `args[i]` points at the value of argument `i` (for pointer arguments, at
/// the pointer). `rtn` receives the return value, if any.
pub type PackedFn = unsafe extern "C" fn(c_int, *const *mut c_void, *mut c_void);

/// Maps a backend handle to a raw device pointer: `(resolve_ctx, handle)`.
pub type ResolveFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void;

/// Asynchronous adapter: `(device_id, args, resolve, resolve_ctx)`.
///
/// Pointer slots of `args` hold backend handles instead of pointers to values.
pub type AsyncFn = unsafe extern "C" fn(c_int, *const *mut c_void, ResolveFn, *mut c_void);

/// One loaded shared-library artifact.
pub struct CompiledModule {
    context: Context,
    source: PathBuf,
    path: PathBuf,
    build_id: u64,
    library: Library,
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("context", &self.context)
            .field("source", &self.source)
            .field("path", &self.path)
            .field("build_id", &self.build_id)
            .finish_non_exhaustive()
    }
}

impl CompiledModule {
    /// Open the artifact at `path`.
    pub fn open(context: &Context, source: &Path, path: &Path, build_id: u64) -> Result<Self> {
        // SAFETY: artifacts are produced by the build cache from generated
        // wrappers; their initializers are the user's own static constructors.
        let library = unsafe { Library::new(path) }
            .map_err(|e| OpforgeError::Load(format!("{}: {}", path.display(), e)))?;
        info!(
            context = %context,
            path = %path.display(),
            build_id,
            "Loaded compiled module"
        );
        Ok(Self {
            context: context.clone(),
            source: source.to_path_buf(),
            path: path.to_path_buf(),
            build_id,
            library,
        })
    }

    /// Build context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Artifact path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build id of the artifact.
    pub fn build_id(&self) -> u64 {
        self.build_id
    }

    fn symbol<T: Copy>(&self, name: &str) -> Option<T> {
        // SAFETY: `T` is one of the fn-pointer aliases above and the named
        // symbols are emitted with exactly those signatures.
        unsafe { self.library.get::<T>(name.as_bytes()).ok().map(|s| *s) }
    }

    /// Resolve the entry points of `idcode`.
    ///
    /// The packed trampoline must exist; so must the async adapter when
    /// `has_async` is set.
    pub fn entry(self: &Arc<Self>, idcode: &IdCode, has_async: bool) -> Result<NativeEntry> {
        let symbol = idcode.symbol();
        let missing = |name: String| OpforgeError::SymbolNotFound {
            symbol: name,
            artifact: self.path.display().to_string(),
        };

        let packed_name = format!("{}{}", symbol, PACKED_SUFFIX);
        let packed = self
            .symbol::<PackedFn>(&packed_name)
            .ok_or_else(|| missing(packed_name))?;

        let async_fn = if has_async {
            let async_name = format!("{}{}", symbol, ASYNC_SUFFIX);
            Some(
                self.symbol::<AsyncFn>(&async_name)
                    .ok_or_else(|| missing(async_name))?,
            )
        } else {
            None
        };

        Ok(NativeEntry {
            idcode: idcode.clone(),
            symbol,
            packed,
            async_fn,
            module: Some(Arc::clone(self)),
        })
    }
}

/// Opens artifacts, caching one module per (context, source, build id).
#[derive(Debug, Default)]
pub struct Loader {
    modules: Mutex<HashMap<(Context, PathBuf, u64), Arc<CompiledModule>>>,
}

impl Loader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached module for this build, opening `artifact` on first use.
    pub fn load(
        &self,
        context: &Context,
        source: &Path,
        artifact: &Path,
        build_id: u64,
    ) -> Result<Arc<CompiledModule>> {
        let key = (context.clone(), source.to_path_buf(), build_id);
        let mut modules = self.modules.lock();
        if let Some(module) = modules.get(&key) {
            debug!(context = %context, source = %source.display(), build_id, "Module cache hit");
            return Ok(Arc::clone(module));
        }
        let module = Arc::new(CompiledModule::open(context, source, artifact, build_id)?);
        modules.insert(key, Arc::clone(&module));
        Ok(module)
    }

    /// Number of cached modules.
    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    /// Whether no module is cached.
    pub fn is_empty(&self) -> bool {
        self.modules.lock().is_empty()
    }

    /// Forget every cached module. Entries still in use keep their library alive.
    pub fn clear(&self) {
        self.modules.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_artifact_is_load_error() {
        let loader = Loader::new();
        let err = loader
            .load(
                &Context::Cpu,
                Path::new("/nonexistent/ops.cpp"),
                Path::new("/nonexistent/build/ops_cpu_1.so"),
                1,
            )
            .unwrap_err();
        assert!(matches!(err, OpforgeError::Load(_)));
        assert!(loader.is_empty());
    }
}
