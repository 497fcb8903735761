//! Native compiler collaborators.
//!
//! The build cache only needs two things from a compiler: the prelude placed
//! in front of the user source for a context, and a synchronous call that
//! turns wrapper units into a shared library.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use opforge_codegen::HOST_PRELUDE;
use opforge_core::{Context, OpforgeError, Result};

/// Environment variable naming the C++ compiler.
pub const ENV_CXX: &str = "CXX";
/// Environment variable with extra compiler flags.
pub const ENV_CXXFLAGS: &str = "OPFORGE_CXXFLAGS";

/// Produces shared-library artifacts from generated wrapper units.
pub trait Compiler: Send + Sync {
    /// Definitions emitted before the user source for `ctx`.
    fn prelude(&self, ctx: &Context) -> String;

    /// Compile `sources` into the shared library `target`.
    fn compile(&self, sources: &[PathBuf], target: &Path, ctx: &Context) -> Result<()>;
}

/// Ordered compiler command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildFlags {
    flags: Vec<String>,
}

impl BuildFlags {
    /// Empty flag list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw flag.
    pub fn add(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Add a preprocessor definition, `-DKEY` or `-DKEY=VALUE`.
    pub fn add_definition(mut self, key: &str, value: Option<&str>) -> Self {
        self.flags.push(match value {
            Some(v) => format!("-D{}={}", key, v),
            None => format!("-D{}", key),
        });
        self
    }

    /// Append whitespace-separated flags.
    pub fn extend_from_str(mut self, text: &str) -> Self {
        self.flags.extend(text.split_whitespace().map(str::to_string));
        self
    }

    /// The flags in order.
    pub fn as_slice(&self) -> &[String] {
        &self.flags
    }
}

impl fmt::Display for BuildFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flags.join(" "))
    }
}

/// The system C++ compiler, building host artifacts.
#[derive(Debug, Clone)]
pub struct HostCompiler {
    program: String,
    flags: BuildFlags,
}

impl Default for HostCompiler {
    fn default() -> Self {
        Self::new("c++")
    }
}

impl HostCompiler {
    /// Compiler invoked as `program` with the default flags.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flags: Self::default_flags(),
        }
    }

    /// Compiler from `CXX` (default `c++`) with extra flags from `OPFORGE_CXXFLAGS`.
    pub fn from_env() -> Self {
        let program = std::env::var(ENV_CXX)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "c++".to_string());
        let mut compiler = Self::new(program);
        if let Ok(extra) = std::env::var(ENV_CXXFLAGS) {
            compiler.flags = compiler.flags.extend_from_str(&extra);
        }
        compiler
    }

    fn default_flags() -> BuildFlags {
        BuildFlags::new()
            .add("-std=c++14")
            .add("-O2")
            .add("-fPIC")
            .add("-shared")
            .add_definition("OPFORGE_HOST", None)
    }

    /// Replace the flag list.
    pub fn with_flags(mut self, flags: BuildFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Compiler program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Flags passed before the sources.
    pub fn flags(&self) -> &BuildFlags {
        &self.flags
    }

    /// Whether the compiler can be run.
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

impl Compiler for HostCompiler {
    fn prelude(&self, _ctx: &Context) -> String {
        HOST_PRELUDE.to_string()
    }

    fn compile(&self, sources: &[PathBuf], target: &Path, ctx: &Context) -> Result<()> {
        if !ctx.is_host() {
            return Err(OpforgeError::Build(format!(
                "the host compiler cannot build for context `{}`",
                ctx
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(
            compiler = %self.program,
            flags = %self.flags,
            target = %target.display(),
            "Compiling native artifact"
        );
        let output = Command::new(&self.program)
            .args(self.flags.as_slice())
            .args(sources)
            .arg("-o")
            .arg(target)
            .output()
            .map_err(|e| OpforgeError::Build(format!("failed to run `{}`: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(OpforgeError::Build(format!(
                "`{}` exited with {}:\n{}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_flags() {
        let flags = BuildFlags::new()
            .add("-O3")
            .add_definition("USING_CBLAS", Some("1"))
            .add_definition("NDEBUG", None)
            .extend_from_str("  -march=native   -g ");
        assert_eq!(flags.to_string(), "-O3 -DUSING_CBLAS=1 -DNDEBUG -march=native -g");
        assert_eq!(flags.as_slice().len(), 5);
    }

    #[test]
    fn test_default_host_flags() {
        let compiler = HostCompiler::default();
        assert_eq!(compiler.program(), "c++");
        let flags = compiler.flags().to_string();
        assert!(flags.starts_with("-std=c++14 -O2 -fPIC -shared"));
    }

    #[test]
    fn test_gpu_context_rejected() {
        let compiler = HostCompiler::default();
        let err = compiler
            .compile(&[], Path::new("/nonexistent/out.so"), &Context::Gpu("cuda".into()))
            .unwrap_err();
        assert!(matches!(err, OpforgeError::Build(_)));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let compiler = HostCompiler::new("opforge-no-such-compiler");
        assert!(!compiler.is_available());
        let dir = tempfile::TempDir::new().unwrap();
        let err = compiler
            .compile(&[], &dir.path().join("out.so"), &Context::Cpu)
            .unwrap_err();
        assert!(err.to_string().contains("failed to run"));
    }

    #[test]
    fn test_host_prelude() {
        assert!(HostCompiler::default().prelude(&Context::Cpu).contains("OPFORGE_DLL"));
    }
}
