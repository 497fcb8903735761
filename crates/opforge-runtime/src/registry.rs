//! Function registry.
//!
//! Registered entries are scoped per (context, source file). A new build
//! replaces the whole table of its scope; tables are never merged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use opforge_core::{Context, Declaration, IdCode, OpforgeError, Result};

use crate::loader::{AsyncFn, CompiledModule, PackedFn};

/// A callable native entry point.
#[derive(Debug, Clone)]
pub struct NativeEntry {
    pub(crate) idcode: IdCode,
    pub(crate) symbol: String,
    pub(crate) packed: PackedFn,
    pub(crate) async_fn: Option<AsyncFn>,
    pub(crate) module: Option<Arc<CompiledModule>>,
}

impl NativeEntry {
    /// Wrap entry points that do not come from a compiled module.
    ///
    /// # Safety
    ///
    /// `packed` (and `async_fn`, if given) must implement the packed and
    /// async calling conventions for the argument types encoded in `idcode`,
    /// and must stay valid for as long as the entry is used.
    pub unsafe fn from_raw(idcode: IdCode, packed: PackedFn, async_fn: Option<AsyncFn>) -> Self {
        Self {
            symbol: idcode.symbol(),
            idcode,
            packed,
            async_fn,
            module: None,
        }
    }

    /// Signature of the entry.
    pub fn idcode(&self) -> &IdCode {
        &self.idcode
    }

    /// Hashed symbol name.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Packed trampoline.
    pub fn packed(&self) -> PackedFn {
        self.packed
    }

    /// Asynchronous adapter, for kernels that have one.
    pub fn async_fn(&self) -> Option<AsyncFn> {
        self.async_fn
    }

    /// Build id of the owning module, if any.
    pub fn build_id(&self) -> Option<u64> {
        self.module.as_ref().map(|m| m.build_id())
    }
}

/// The entries of one loaded build.
#[derive(Debug, Clone, Default)]
pub struct ModuleTable {
    build_id: u64,
    entries: HashMap<IdCode, NativeEntry>,
}

impl ModuleTable {
    /// Resolve every signature in `entries` from `module`.
    ///
    /// `declarations` tell which kernels carry an async adapter. Any missing
    /// symbol fails the whole table.
    pub fn populate(
        module: &Arc<CompiledModule>,
        entries: &[IdCode],
        declarations: &[Declaration],
    ) -> Result<Self> {
        let mut table = HashMap::with_capacity(entries.len());
        for idcode in entries {
            let has_async = declarations
                .iter()
                .find(|d| d.name == idcode.function_name())
                .is_some_and(Declaration::has_async_adapter);
            table.insert(idcode.clone(), module.entry(idcode, has_async)?);
        }
        debug!(
            path = %module.path().display(),
            build_id = module.build_id(),
            entries = table.len(),
            "Populated symbol table"
        );
        Ok(Self {
            build_id: module.build_id(),
            entries: table,
        })
    }

    /// Table built from ready-made entries.
    pub fn from_entries(build_id: u64, entries: impl IntoIterator<Item = NativeEntry>) -> Self {
        Self {
            build_id,
            entries: entries
                .into_iter()
                .map(|e| (e.idcode.clone(), e))
                .collect(),
        }
    }

    /// Build id of the table.
    pub fn build_id(&self) -> u64 {
        self.build_id
    }

    /// Entry for `idcode`.
    pub fn get(&self, idcode: &IdCode) -> Option<&NativeEntry> {
        self.entries.get(idcode)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-wide table of loaded entry points.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    tables: RwLock<HashMap<(Context, PathBuf), ModuleTable>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `table` for (`context`, `source`), replacing any previous table.
    pub fn install(&self, context: &Context, source: &Path, table: ModuleTable) {
        let key = (context.clone(), source.to_path_buf());
        let mut tables = self.tables.write();
        let previous = tables.get(&key).map(ModuleTable::build_id);
        info!(
            context = %context,
            source = %source.display(),
            build_id = table.build_id(),
            previous_build_id = ?previous,
            entries = table.len(),
            "Installed function table"
        );
        tables.insert(key, table);
    }

    /// Entry for `idcode`, if registered.
    pub fn get(&self, context: &Context, source: &Path, idcode: &IdCode) -> Option<NativeEntry> {
        self.tables
            .read()
            .get(&(context.clone(), source.to_path_buf()))
            .and_then(|t| t.get(idcode))
            .cloned()
    }

    /// Entry for `idcode`, or `SymbolNotFound`.
    pub fn resolve(&self, context: &Context, source: &Path, idcode: &IdCode) -> Result<NativeEntry> {
        self.get(context, source, idcode)
            .ok_or_else(|| OpforgeError::SymbolNotFound {
                symbol: idcode.symbol(),
                artifact: format!("{} ({})", source.display(), context),
            })
    }

    /// Build id of the installed table.
    pub fn build_id(&self, context: &Context, source: &Path) -> Option<u64> {
        self.tables
            .read()
            .get(&(context.clone(), source.to_path_buf()))
            .map(ModuleTable::build_id)
    }

    /// Drop every table.
    pub fn reset(&self) {
        self.tables.write().clear();
    }
}
