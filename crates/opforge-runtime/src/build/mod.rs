//! Build cache.
//!
//! Each source file owns one manifest under its build directory recording the
//! current build id, a fingerprint of the source and every signature compiled
//! into the current artifacts:
//!
//! ```text
//! <dir>/ops.cpp
//! <dir>/build/ops.json                    manifest, also the lock file
//! <dir>/build/ops_cpu_3.so                artifact for context `cpu`, build 3
//! <dir>/build/cpu/ops_wrapper.cpp         last generated wrapper unit
//! ```
//!
//! All manifest reads and writes, and the decision to rebuild, happen while
//! holding an exclusive lock on the manifest file.

mod cache;
mod lock;
mod manifest;

pub use cache::{BuildCache, BuildOutcome};
pub use lock::ManifestLock;
pub use manifest::{BuildManifest, MANIFEST_VERSION};

use std::env::consts::DLL_EXTENSION;
use std::path::{Path, PathBuf};

use opforge_core::Context;

/// Paths of the build products of one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    dir: PathBuf,
    stem: String,
}

impl BuildLayout {
    /// Layout rooted at `dir` for a source named `stem`.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    /// Build directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Manifest path.
    pub fn manifest(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.stem))
    }

    /// Artifact path for `ctx` at `build_id`.
    pub fn artifact(&self, ctx: &Context, build_id: u64) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.{}",
            self.stem,
            ctx.name(),
            build_id,
            DLL_EXTENSION
        ))
    }

    /// Generated wrapper unit for `ctx`.
    pub fn wrapper(&self, ctx: &Context) -> PathBuf {
        self.dir
            .join(ctx.name())
            .join(format!("{}_wrapper.cpp", self.stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = BuildLayout::new("/src/build", "ops");
        assert_eq!(layout.manifest(), PathBuf::from("/src/build/ops.json"));
        assert_eq!(
            layout.artifact(&Context::Gpu("cuda".into()), 4),
            PathBuf::from(format!("/src/build/ops_cuda_4.{}", DLL_EXTENSION))
        );
        assert_eq!(
            layout.wrapper(&Context::Cpu),
            PathBuf::from("/src/build/cpu/ops_wrapper.cpp")
        );
    }
}
