//! The engine facade.

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use opforge_core::{
    Context, DType, Declaration, EngineConfig, IdCode, OpforgeError, Result, Scalar, TemplateArgs,
};
use opforge_runtime::{
    bind, invoke, BuildCache, CallArgs, Compiler, FunctionRegistry, Glue, GlueRegistry,
    HostCompiler, Loader, ModuleTable, NativeEntry, SourceFile,
};

/// A declaration bound by name, together with the source it came from.
#[derive(Debug, Clone)]
pub struct BoundFunction {
    source: Arc<SourceFile>,
    decl: Declaration,
}

impl BoundFunction {
    /// Source file declaring the function.
    pub fn source(&self) -> &SourceFile {
        &self.source
    }

    /// Parsed declaration.
    pub fn declaration(&self) -> &Declaration {
        &self.decl
    }
}

/// Builds, caches and calls annotated native functions.
///
/// One engine is meant to live for the whole process. It owns the function
/// registry and loaded modules; both are only cleared by [`Engine::reset`].
pub struct Engine {
    config: EngineConfig,
    cache: BuildCache,
    loader: Loader,
    registry: FunctionRegistry,
    glues: RwLock<GlueRegistry>,
    functions: RwLock<HashMap<String, BoundFunction>>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine using the system C++ compiler and settings from the environment.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parse `path` and bind every declaration in it by name.
    ///
    /// A name that is already bound is rebound to the new declaration.
    /// Returns the names declared by the file.
    pub fn load_source(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let source = Arc::new(SourceFile::open(path)?);
        let mut functions = self.functions.write();
        let mut names = Vec::with_capacity(source.declarations().len());
        for decl in source.declarations() {
            let bound = BoundFunction {
                source: Arc::clone(&source),
                decl: decl.clone(),
            };
            if let Some(previous) = functions.insert(decl.name.clone(), bound) {
                warn!(
                    name = %decl.name,
                    previous = %previous.source.path().display(),
                    source = %source.path().display(),
                    "Function rebound to a new declaration"
                );
            }
            names.push(decl.name.clone());
        }
        info!(
            source = %source.path().display(),
            functions = names.len(),
            "Loaded source"
        );
        Ok(names)
    }

    /// The function bound to `name`.
    pub fn function(&self, name: &str) -> Result<BoundFunction> {
        self.functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| OpforgeError::UnknownFunction(name.to_string()))
    }

    /// Names of every bound function, sorted.
    pub fn functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Call the function bound to `name`.
    ///
    /// Builds the artifact on first use of a signature. Returns the decoded
    /// return value of functions that have one; kernels and asynchronous
    /// submissions return `None`.
    pub fn call(&self, name: &str, args: CallArgs<'_>) -> Result<Option<Scalar>> {
        let function = self.function(name)?;
        let binding = {
            let glues = self.glues.read();
            bind(&function.decl, args, &glues)?
        };
        let context = binding.context(&self.config);
        let entry = self.resolve(&function, &context, binding.types())?;
        invoke(&entry, &function.decl, binding, self.config.async_exec)
    }

    /// Build the instantiation of `name` selected by `template_args` for
    /// `context` without calling it.
    pub fn build(
        &self,
        name: &str,
        context: &Context,
        template_args: TemplateArgs,
    ) -> Result<NativeEntry> {
        let function = self.function(name)?;
        let types = function.decl.instantiate(&template_args)?;
        self.resolve(&function, context, &types)
    }

    /// Register `glue` for tensor arguments of type `T`.
    pub fn register_glue<T: Any>(&self, glue: impl Glue + 'static) {
        self.glues.write().register::<T>(glue);
    }

    /// Loaded entry points.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Forget every loaded entry point and module. Bound names are kept.
    pub fn reset(&self) {
        self.registry.reset();
        self.loader.clear();
        debug!("Engine reset");
    }

    fn resolve(
        &self,
        function: &BoundFunction,
        context: &Context,
        types: &[DType],
    ) -> Result<NativeEntry> {
        let path = function.source.path();
        let idcode = IdCode::new(&function.decl.name, types);
        if let Some(entry) = self.registry.get(context, path, &idcode) {
            return Ok(entry);
        }

        let outcome = self
            .cache
            .ensure(&function.source, context, &function.decl, types)?;
        let module = self
            .loader
            .load(context, path, &outcome.artifact, outcome.build_id)?;
        let snapshot = function.source.snapshot()?;
        let table = ModuleTable::populate(&module, &outcome.entries, &snapshot.declarations)?;
        self.registry.install(context, path, table);
        self.registry.resolve(context, path, &idcode)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    compiler: Option<Arc<dyn Compiler>>,
    glues: GlueRegistry,
}

impl EngineBuilder {
    /// Create a new builder with the host glues registered.
    pub fn new() -> Self {
        Self {
            config: None,
            compiler: None,
            glues: GlueRegistry::with_host_defaults(),
        }
    }

    /// Use `config` instead of [`EngineConfig::from_env`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `compiler` instead of [`HostCompiler::from_env`].
    pub fn compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Some(Arc::new(compiler));
        self
    }

    /// Use a shared compiler.
    pub fn compiler_arc(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Register `glue` for tensor arguments of type `T`.
    pub fn glue<T: Any>(mut self, glue: impl Glue + 'static) -> Self {
        self.glues.register::<T>(glue);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Engine {
        let config = self.config.unwrap_or_else(EngineConfig::from_env);
        let compiler = self
            .compiler
            .unwrap_or_else(|| Arc::new(HostCompiler::from_env()));
        debug!(
            build_dir = %config.build_dir_name,
            gpu_backend = %config.gpu_backend,
            async_exec = config.async_exec,
            "Creating engine"
        );
        Engine {
            cache: BuildCache::new(compiler, &config),
            config,
            loader: Loader::new(),
            registry: FunctionRegistry::new(),
            glues: RwLock::new(self.glues),
            functions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
