//! Rebuild decision and artifact production.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use opforge_codegen::{CodeGenerator, WrapperUnit};
use opforge_core::{Context, DType, Declaration, EngineConfig, IdCode, Result};

use super::{BuildManifest, ManifestLock};
use crate::compiler::Compiler;
use crate::source::SourceFile;

/// Result of [`BuildCache::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Build id of the artifact.
    pub build_id: u64,
    /// Artifact path.
    pub artifact: PathBuf,
    /// Whether this request compiled a new artifact.
    pub rebuilt: bool,
    /// Every signature compiled into the artifact.
    pub entries: Vec<IdCode>,
}

/// Keeps one artifact per (source, context) up to date with the signatures
/// requested from it.
pub struct BuildCache {
    compiler: Arc<dyn Compiler>,
    generator: CodeGenerator,
    build_dir_name: String,
}

impl BuildCache {
    /// Create a build cache compiling with `compiler`.
    pub fn new(compiler: Arc<dyn Compiler>, config: &EngineConfig) -> Self {
        Self {
            compiler,
            generator: CodeGenerator::new(),
            build_dir_name: config.build_dir_name.clone(),
        }
    }

    /// Make sure the artifact of `source` for `context` contains `decl`
    /// instantiated at `types`, rebuilding it if needed.
    ///
    /// The manifest lock is held from reading the manifest until the updated
    /// manifest is written. A failed compile leaves the manifest and the
    /// previous artifact untouched; a superseded artifact is removed on a
    /// best-effort basis once its replacement exists.
    pub fn ensure(
        &self,
        source: &SourceFile,
        context: &Context,
        decl: &Declaration,
        types: &[DType],
    ) -> Result<BuildOutcome> {
        let layout = source.layout(&self.build_dir_name);
        let mut lock = ManifestLock::acquire(layout.manifest())?;
        let (mut manifest, stale) = BuildManifest::decode(&lock.read()?)?;

        let snapshot = source.snapshot()?;
        // Generate from the current parse when the declaration still exists.
        let decl = snapshot
            .declarations
            .iter()
            .find(|d| d.name == decl.name)
            .unwrap_or(decl);
        if decl.is_template() {
            decl.template_mapping(types)?;
        } else {
            decl.check_types(types)?;
        }
        let idcode = IdCode::new(&decl.name, types);

        let changed = manifest.source_fingerprint != snapshot.fingerprint;
        let current = layout.artifact(context, manifest.build_id);
        let exists = current.exists();
        let known = manifest.contains(&idcode, decl.is_template());

        if !changed && exists && known && !stale {
            debug!(
                source = %source.path().display(),
                context = %context,
                idcode = %idcode,
                build_id = manifest.build_id,
                "Build cache hit"
            );
            return Ok(BuildOutcome {
                build_id: manifest.build_id,
                artifact: current,
                rebuilt: false,
                entries: manifest.entries(),
            });
        }

        if changed {
            manifest.template_functions.clear();
        }
        if changed || !known {
            manifest.build_id += 1;
        }

        let mut body = String::new();
        let mut ordinary = BTreeSet::new();
        for d in snapshot.declarations.iter().filter(|d| !d.is_template()) {
            let types = d.concrete_types()?;
            body.push_str(&self.generator.generate(d, &types)?);
            ordinary.insert(IdCode::new(&d.name, &types));
        }
        if decl.is_template() && !manifest.template_functions.contains_key(&idcode) {
            let code = self.generator.generate(decl, types)?;
            manifest.template_functions.insert(idcode.clone(), code);
        }
        for code in manifest.template_functions.values() {
            body.push_str(code);
        }

        let wrapper = layout.wrapper(context);
        if let Some(parent) = wrapper.parent() {
            fs::create_dir_all(parent)?;
        }
        let unit = WrapperUnit::new(self.compiler.prelude(context), source.path(), body);
        fs::write(&wrapper, unit.render())?;

        let artifact = layout.artifact(context, manifest.build_id);
        info!(
            source = %source.path().display(),
            context = %context,
            idcode = %idcode,
            build_id = manifest.build_id,
            changed,
            stale,
            "Rebuilding artifact"
        );
        self.compiler.compile(&[wrapper], &artifact, context)?;

        if exists && current != artifact {
            if let Err(e) = fs::remove_file(&current) {
                warn!(path = %current.display(), error = %e, "Failed to remove superseded artifact");
            }
        }

        manifest.ordinary_functions = ordinary;
        manifest.source_fingerprint = snapshot.fingerprint;
        lock.write(&manifest.encode()?)?;
        drop(lock);

        Ok(BuildOutcome {
            build_id: manifest.build_id,
            artifact,
            rebuilt: true,
            entries: manifest.entries(),
        })
    }
}
