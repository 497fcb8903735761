//! Annotated source files.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use opforge_core::{parse_declarations, Declaration, Result};

use crate::build::BuildLayout;

/// An annotated source file and the declarations parsed from it.
#[derive(Debug, Clone)]
pub struct SourceFile {
    path: PathBuf,
    declarations: Vec<Declaration>,
}

/// Content of a source file as it is on disk right now.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    /// SHA-256 of the file bytes, lowercase hex.
    pub fingerprint: String,
    /// Declarations parsed from those bytes.
    pub declarations: Vec<Declaration>,
}

impl SourceFile {
    /// Read and parse the file at `path`.
    ///
    /// The path is canonicalized so that one file always maps to one
    /// manifest and one registry scope.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = fs::canonicalize(path.as_ref())?;
        let text = fs::read_to_string(&path)?;
        let declarations = parse_declarations(&text)?;
        Ok(Self { path, declarations })
    }

    /// Absolute path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without extension.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directory containing the file.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Declarations parsed when the file was opened.
    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Declaration named `name`.
    pub fn declaration(&self, name: &str) -> Option<&Declaration> {
        self.declarations.iter().find(|d| d.name == name)
    }

    /// Re-read the file and parse its current content.
    pub fn snapshot(&self) -> Result<SourceSnapshot> {
        let text = fs::read_to_string(&self.path)?;
        Ok(SourceSnapshot {
            fingerprint: fingerprint(&text),
            declarations: parse_declarations(&text)?,
        })
    }

    /// Build directory layout of this file.
    pub fn layout(&self, build_dir_name: &str) -> BuildLayout {
        BuildLayout::new(self.dir().join(build_dir_name), self.stem())
    }
}

/// SHA-256 of `text` as lowercase hex.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
