//! Exclusive manifest lock.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use opforge_core::Result;

/// An open manifest file held under an exclusive advisory lock.
///
/// The lock is blocking and scoped to the open file, so it serializes both
/// processes and threads that each acquire their own guard. It is released
/// when the guard is dropped.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
    path: PathBuf,
}

impl ManifestLock {
    /// Open (creating if needed) and lock the manifest at `path`.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        tracing::trace!(path = %path.display(), "Acquired manifest lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Locked path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole manifest text.
    pub fn read(&mut self) -> Result<String> {
        let mut text = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Replace the manifest text and flush it to disk.
    pub fn write(&mut self, text: &str) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(text.as_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release manifest lock");
        }
    }
}
